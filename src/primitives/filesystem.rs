// File: src/primitives/filesystem.rs
//
// Filesystem primitives. Handles are opened and fully consumed inside each
// primitive; no handle value exists at the language surface.

use std::fs;
use std::path::Path;

use super::{check_arity, string_arg};
use crate::value::Value;

pub fn handle(selector: &str, args: &[Value]) -> Option<Result<Value, String>> {
    let result = match selector {
        "fileRead:" => check_arity(selector, args, 1).and_then(|_| {
            let path = string_arg(selector, args, 0)?;
            fs::read_to_string(&path)
                .map(Value::str)
                .map_err(|e| format!("Failed to read file '{}': {}", path, e))
        }),

        "fileWrite:content:" => check_arity(selector, args, 2).and_then(|_| {
            let path = string_arg(selector, args, 0)?;
            let content = string_arg(selector, args, 1)?;
            fs::write(&path, content)
                .map(|_| Value::Nil)
                .map_err(|e| format!("Failed to write file '{}': {}", path, e))
        }),

        "fileExists:" => check_arity(selector, args, 1).and_then(|_| {
            let path = string_arg(selector, args, 0)?;
            Ok(Value::Bool(Path::new(&path).exists()))
        }),

        "fileDelete:" => check_arity(selector, args, 1).and_then(|_| {
            let path = string_arg(selector, args, 0)?;
            fs::remove_file(&path)
                .map(|_| Value::Nil)
                .map_err(|e| format!("Failed to delete file '{}': {}", path, e))
        }),

        _ => return None,
    };
    Some(result)
}

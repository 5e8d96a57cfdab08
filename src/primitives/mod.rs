// File: src/primitives/mod.rs
//
// Module organization for the extended primitive selectors.
// These are the boundary of the core: the VM routes selectors that survive
// method lookup here, and each category module claims the ones it knows.
// Primitives read their operands from the message arguments; the receiver
// never reaches them.

pub mod crypto;
pub mod datetime;
pub mod encoding;
pub mod filesystem;
pub mod http;
pub mod json;
pub mod random;
pub mod regex_ops;

use crate::value::Value;

/// Route a selector to the category modules in order. None means no
/// primitive claims it and the send becomes "does not understand".
pub fn dispatch(selector: &str, args: &[Value]) -> Option<Result<Value, String>> {
    if let Some(result) = crypto::handle(selector, args) {
        return Some(result);
    }
    if let Some(result) = encoding::handle(selector, args) {
        return Some(result);
    }
    if let Some(result) = filesystem::handle(selector, args) {
        return Some(result);
    }
    if let Some(result) = json::handle(selector, args) {
        return Some(result);
    }
    if let Some(result) = regex_ops::handle(selector, args) {
        return Some(result);
    }
    if let Some(result) = random::handle(selector, args) {
        return Some(result);
    }
    if let Some(result) = datetime::handle(selector, args) {
        return Some(result);
    }
    if let Some(result) = http::handle(selector, args) {
        return Some(result);
    }
    None
}

/// Argument accessors shared by the category modules. Every primitive
/// checks arity and types strictly and reports the selector in its error.
pub(crate) fn string_arg(selector: &str, args: &[Value], idx: usize) -> Result<String, String> {
    match args.get(idx) {
        Some(Value::Str(s)) => Ok(s.as_ref().clone()),
        Some(other) => Err(format!(
            "{} requires a string for argument {}, got {}",
            selector,
            idx + 1,
            other.kind_name()
        )),
        None => Err(format!("{} is missing argument {}", selector, idx + 1)),
    }
}

pub(crate) fn int_arg(selector: &str, args: &[Value], idx: usize) -> Result<i64, String> {
    match args.get(idx) {
        Some(Value::Int(n)) => Ok(*n),
        Some(other) => Err(format!(
            "{} requires an integer for argument {}, got {}",
            selector,
            idx + 1,
            other.kind_name()
        )),
        None => Err(format!("{} is missing argument {}", selector, idx + 1)),
    }
}

pub(crate) fn check_arity(selector: &str, args: &[Value], expected: usize) -> Result<(), String> {
    if args.len() != expected {
        return Err(format!(
            "{} requires {} arguments, got {}",
            selector,
            expected,
            args.len()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_selector_is_not_claimed() {
        assert!(dispatch("definitelyNotAPrimitive:", &[Value::Int(1)]).is_none());
    }

    #[test]
    fn test_known_selectors_are_claimed_by_some_module() {
        let claimed = [
            "sha256:",
            "base64Encode:",
            "fileExists:",
            "jsonParse:",
            "regexMatch:text:",
            "randomFloat",
            "dateNow",
        ];
        for selector in claimed {
            let args = match selector {
                "randomFloat" | "dateNow" => vec![],
                "regexMatch:text:" => vec![Value::str_ref("a"), Value::str_ref("a")],
                _ => vec![Value::str_ref("x")],
            };
            assert!(
                dispatch(selector, &args).is_some(),
                "selector {} should be claimed",
                selector
            );
        }
    }

    #[test]
    fn test_arity_errors_name_the_selector() {
        let result = dispatch("sha256:", &[]).unwrap();
        assert!(result.unwrap_err().contains("sha256:"));
    }
}

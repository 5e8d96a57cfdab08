// File: src/primitives/http.rs
//
// HTTP client primitives. Blocking by design: the VM is single-threaded
// and a request blocks it. Response bodies are fully read and the
// connection released before the primitive returns.

use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::blocking::Client;

use super::{check_arity, string_arg};
use crate::value::Value;

static CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("default HTTP client configuration is valid")
});

pub fn handle(selector: &str, args: &[Value]) -> Option<Result<Value, String>> {
    let result = match selector {
        "httpGet:" => check_arity(selector, args, 1).and_then(|_| {
            let url = string_arg(selector, args, 0)?;
            CLIENT
                .get(&url)
                .send()
                .and_then(|response| response.text())
                .map(Value::str)
                .map_err(|e| format!("HTTP GET '{}' failed: {}", url, e))
        }),

        "httpPost:body:" => check_arity(selector, args, 2).and_then(|_| {
            let url = string_arg(selector, args, 0)?;
            let body = string_arg(selector, args, 1)?;
            CLIENT
                .post(&url)
                .body(body)
                .send()
                .and_then(|response| response.text())
                .map(Value::str)
                .map_err(|e| format!("HTTP POST '{}' failed: {}", url, e))
        }),

        _ => return None,
    };
    Some(result)
}

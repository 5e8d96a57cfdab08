// File: src/primitives/regex_ops.rs
//
// Regular expression primitives.

use regex::Regex;

use super::{check_arity, string_arg};
use crate::value::Value;

pub fn handle(selector: &str, args: &[Value]) -> Option<Result<Value, String>> {
    let result = match selector {
        "regexMatch:text:" => check_arity(selector, args, 2).and_then(|_| {
            let regex = compile(&string_arg(selector, args, 0)?)?;
            let text = string_arg(selector, args, 1)?;
            Ok(Value::Bool(regex.is_match(&text)))
        }),

        "regexFindAll:text:" => check_arity(selector, args, 2).and_then(|_| {
            let regex = compile(&string_arg(selector, args, 0)?)?;
            let text = string_arg(selector, args, 1)?;
            let matches: Vec<Value> =
                regex.find_iter(&text).map(|m| Value::str_ref(m.as_str())).collect();
            Ok(Value::array(matches))
        }),

        "regexReplace:text:with:" => check_arity(selector, args, 3).and_then(|_| {
            let regex = compile(&string_arg(selector, args, 0)?)?;
            let text = string_arg(selector, args, 1)?;
            let replacement = string_arg(selector, args, 2)?;
            Ok(Value::str(regex.replace_all(&text, replacement.as_str()).into_owned()))
        }),

        _ => return None,
    };
    Some(result)
}

fn compile(pattern: &str) -> Result<Regex, String> {
    Regex::new(pattern).map_err(|e| format!("Invalid regex pattern: {}", e))
}

#[cfg(test)]
mod tests {
    use super::handle;
    use crate::value::Value;

    #[test]
    fn test_match_answers_boolean() {
        let result = handle(
            "regexMatch:text:",
            &[Value::str_ref(r"\d+"), Value::str_ref("year 2026")],
        )
        .unwrap()
        .unwrap();
        assert!(matches!(result, Value::Bool(true)));

        let result = handle(
            "regexMatch:text:",
            &[Value::str_ref(r"\d+"), Value::str_ref("no digits")],
        )
        .unwrap()
        .unwrap();
        assert!(matches!(result, Value::Bool(false)));
    }

    #[test]
    fn test_find_all_collects_matches() {
        let result = handle(
            "regexFindAll:text:",
            &[Value::str_ref(r"[a-z]+"), Value::str_ref("one 2 three 4")],
        )
        .unwrap()
        .unwrap();
        match result {
            Value::Array(items) => {
                let items = items.lock().unwrap();
                let words: Vec<String> = items
                    .iter()
                    .map(|v| match v {
                        Value::Str(s) => s.as_ref().clone(),
                        other => panic!("Expected Value::Str, got {:?}", other),
                    })
                    .collect();
                assert_eq!(words, vec!["one", "three"]);
            }
            other => panic!("Expected Value::Array, got {:?}", other),
        }
    }

    #[test]
    fn test_replace_all_occurrences() {
        let result = handle(
            "regexReplace:text:with:",
            &[Value::str_ref(r"\s+"), Value::str_ref("a  b   c"), Value::str_ref("-")],
        )
        .unwrap()
        .unwrap();
        match result {
            Value::Str(s) => assert_eq!(s.as_ref(), "a-b-c"),
            other => panic!("Expected Value::Str, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        let result = handle(
            "regexMatch:text:",
            &[Value::str_ref("("), Value::str_ref("text")],
        )
        .unwrap();
        assert!(result.unwrap_err().contains("Invalid regex pattern"));
    }
}

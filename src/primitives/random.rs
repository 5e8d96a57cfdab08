// File: src/primitives/random.rs
//
// Randomness primitives, backed by the operating system's CSPRNG.

use base64::Engine;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};

use super::{check_arity, int_arg};
use crate::value::Value;

/// Ceiling for randomBytes: requests, to keep a typo from allocating
/// gigabytes.
const MAX_RANDOM_BYTES: i64 = 1 << 20;

pub fn handle(selector: &str, args: &[Value]) -> Option<Result<Value, String>> {
    let result = match selector {
        "randomInt:max:" => check_arity(selector, args, 2).and_then(|_| {
            let min = int_arg(selector, args, 0)?;
            let max = int_arg(selector, args, 1)?;
            if min > max {
                return Err(format!("randomInt:max: bounds are inverted ({} > {})", min, max));
            }
            Ok(Value::Int(OsRng.gen_range(min..=max)))
        }),

        "randomFloat" => check_arity(selector, args, 0).map(|_| Value::Float(OsRng.gen::<f64>())),

        "randomBytes:" => check_arity(selector, args, 1).and_then(|_| {
            let count = int_arg(selector, args, 0)?;
            if count < 0 || count > MAX_RANDOM_BYTES {
                return Err(format!(
                    "randomBytes: count must be between 0 and {}",
                    MAX_RANDOM_BYTES
                ));
            }
            let mut bytes = vec![0u8; count as usize];
            OsRng.fill_bytes(&mut bytes);
            Ok(Value::str(base64::engine::general_purpose::STANDARD.encode(bytes)))
        }),

        _ => return None,
    };
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::handle;
    use crate::value::Value;
    use base64::Engine;

    #[test]
    fn test_random_int_respects_bounds() {
        for _ in 0..50 {
            let result =
                handle("randomInt:max:", &[Value::Int(3), Value::Int(7)]).unwrap().unwrap();
            match result {
                Value::Int(n) => assert!((3..=7).contains(&n)),
                other => panic!("Expected Value::Int, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_random_int_rejects_inverted_bounds() {
        let result = handle("randomInt:max:", &[Value::Int(9), Value::Int(1)]).unwrap();
        assert!(result.unwrap_err().contains("inverted"));
    }

    #[test]
    fn test_random_float_is_in_unit_interval() {
        for _ in 0..50 {
            let result = handle("randomFloat", &[]).unwrap().unwrap();
            match result {
                Value::Float(f) => assert!((0.0..1.0).contains(&f)),
                other => panic!("Expected Value::Float, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_random_bytes_length() {
        let result = handle("randomBytes:", &[Value::Int(16)]).unwrap().unwrap();
        match result {
            Value::Str(encoded) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded.as_ref())
                    .expect("randomBytes: should produce base64");
                assert_eq!(bytes.len(), 16);
            }
            other => panic!("Expected Value::Str, got {:?}", other),
        }
    }
}

// File: src/primitives/datetime.rs
//
// Date and time primitives over Unix timestamps, interpreted in UTC.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};

use super::{check_arity, int_arg, string_arg};
use crate::value::Value;

pub fn handle(selector: &str, args: &[Value]) -> Option<Result<Value, String>> {
    let result = match selector {
        "dateNow" => check_arity(selector, args, 0).map(|_| Value::Int(Utc::now().timestamp())),

        "dateFormat:format:" => check_arity(selector, args, 2).and_then(|_| {
            let timestamp = int_arg(selector, args, 0)?;
            let format = string_arg(selector, args, 1)?;
            let datetime = utc_from_timestamp(timestamp)?;
            let items = checked_format_items(&format)?;
            Ok(Value::str(datetime.format_with_items(items.into_iter()).to_string()))
        }),

        "dateParse:format:" => check_arity(selector, args, 2).and_then(|_| {
            let text = string_arg(selector, args, 0)?;
            let format = string_arg(selector, args, 1)?;
            if let Ok(datetime) = NaiveDateTime::parse_from_str(&text, &format) {
                return Ok(Value::Int(datetime.and_utc().timestamp()));
            }
            // A date-only format has no time fields; midnight it.
            match NaiveDate::parse_from_str(&text, &format) {
                Ok(date) => {
                    let datetime = date.and_hms_opt(0, 0, 0).expect("midnight is always valid");
                    Ok(Value::Int(datetime.and_utc().timestamp()))
                }
                Err(e) => Err(format!("Cannot parse '{}' with format '{}': {}", text, format, e)),
            }
        }),

        "timeYear:" => time_component(selector, args, |dt| dt.year() as i64),
        "timeMonth:" => time_component(selector, args, |dt| dt.month() as i64),
        "timeDay:" => time_component(selector, args, |dt| dt.day() as i64),
        "timeHour:" => time_component(selector, args, |dt| dt.hour() as i64),
        "timeMinute:" => time_component(selector, args, |dt| dt.minute() as i64),
        "timeSecond:" => time_component(selector, args, |dt| dt.second() as i64),

        _ => return None,
    };
    Some(result)
}

fn utc_from_timestamp(timestamp: i64) -> Result<DateTime<Utc>, String> {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .ok_or_else(|| format!("Timestamp {} is out of range", timestamp))
}

/// chrono panics on invalid specifiers at render time; reject them here.
fn checked_format_items(format: &str) -> Result<Vec<Item<'_>>, String> {
    let items: Vec<Item> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(format!("Invalid date format '{}'", format));
    }
    Ok(items)
}

fn time_component(
    selector: &str,
    args: &[Value],
    extract: fn(&DateTime<Utc>) -> i64,
) -> Result<Value, String> {
    check_arity(selector, args, 1)?;
    let timestamp = int_arg(selector, args, 0)?;
    let datetime = utc_from_timestamp(timestamp)?;
    Ok(Value::Int(extract(&datetime)))
}

#[cfg(test)]
mod tests {
    use super::handle;
    use crate::value::Value;

    #[test]
    fn test_format_epoch() {
        let result = handle(
            "dateFormat:format:",
            &[Value::Int(0), Value::str_ref("%Y-%m-%d %H:%M:%S")],
        )
        .unwrap()
        .unwrap();
        match result {
            Value::Str(s) => assert_eq!(s.as_ref(), "1970-01-01 00:00:00"),
            other => panic!("Expected Value::Str, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_date_only_format() {
        let result = handle(
            "dateParse:format:",
            &[Value::str_ref("2020-01-02"), Value::str_ref("%Y-%m-%d")],
        )
        .unwrap()
        .unwrap();
        match result {
            Value::Int(ts) => assert_eq!(ts, 1_577_923_200),
            other => panic!("Expected Value::Int, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_and_format_round_trip() {
        let parsed = handle(
            "dateParse:format:",
            &[Value::str_ref("2026-08-01 12:30:45"), Value::str_ref("%Y-%m-%d %H:%M:%S")],
        )
        .unwrap()
        .unwrap();
        let ts = match parsed {
            Value::Int(ts) => ts,
            other => panic!("Expected Value::Int, got {:?}", other),
        };

        let formatted = handle(
            "dateFormat:format:",
            &[Value::Int(ts), Value::str_ref("%Y-%m-%d %H:%M:%S")],
        )
        .unwrap()
        .unwrap();
        match formatted {
            Value::Str(s) => assert_eq!(s.as_ref(), "2026-08-01 12:30:45"),
            other => panic!("Expected Value::Str, got {:?}", other),
        }
    }

    #[test]
    fn test_time_components_of_known_timestamp() {
        // 2020-01-02 03:04:05 UTC
        let ts = Value::Int(1_577_934_245);
        let cases = [
            ("timeYear:", 2020),
            ("timeMonth:", 1),
            ("timeDay:", 2),
            ("timeHour:", 3),
            ("timeMinute:", 4),
            ("timeSecond:", 5),
        ];
        for (selector, expected) in cases {
            let result = handle(selector, std::slice::from_ref(&ts)).unwrap().unwrap();
            match result {
                Value::Int(n) => assert_eq!(n, expected, "{}", selector),
                other => panic!("Expected Value::Int from {}, got {:?}", selector, other),
            }
        }
    }

    #[test]
    fn test_invalid_format_specifier_is_an_error() {
        let result = handle(
            "dateFormat:format:",
            &[Value::Int(0), Value::str_ref("%Q-nope")],
        )
        .unwrap();
        assert!(result.unwrap_err().contains("Invalid date format"));
    }
}

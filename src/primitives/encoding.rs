// File: src/primitives/encoding.rs
//
// Base64 and compression primitives. Zip wraps the text in an in-memory
// single-entry archive; gzip is a plain stream. Compressed output travels
// as base64 so it stays a string at the language surface.

use std::io::{Read, Write};

use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::{check_arity, string_arg};
use crate::value::Value;

pub fn handle(selector: &str, args: &[Value]) -> Option<Result<Value, String>> {
    let result = match selector {
        "base64Encode:" => check_arity(selector, args, 1).and_then(|_| {
            let text = string_arg(selector, args, 0)?;
            Ok(Value::str(base64::engine::general_purpose::STANDARD.encode(text.as_bytes())))
        }),

        "base64Decode:" => check_arity(selector, args, 1).and_then(|_| {
            let encoded = string_arg(selector, args, 0)?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| format!("Invalid base64 input: {}", e))?;
            String::from_utf8(bytes)
                .map(Value::str)
                .map_err(|e| format!("Decoded data is not valid UTF-8: {}", e))
        }),

        "zipCompress:" => check_arity(selector, args, 1).and_then(|_| {
            let text = string_arg(selector, args, 0)?;
            zip_compress(&text)
        }),

        "zipDecompress:" => check_arity(selector, args, 1).and_then(|_| {
            let encoded = string_arg(selector, args, 0)?;
            zip_decompress(&encoded)
        }),

        "gzipCompress:" => check_arity(selector, args, 1).and_then(|_| {
            let text = string_arg(selector, args, 0)?;
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(text.as_bytes())
                .and_then(|_| encoder.finish())
                .map(|bytes| {
                    Value::str(base64::engine::general_purpose::STANDARD.encode(bytes))
                })
                .map_err(|e| format!("gzip compression failed: {}", e))
        }),

        "gzipDecompress:" => check_arity(selector, args, 1).and_then(|_| {
            let encoded = string_arg(selector, args, 0)?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| format!("Invalid base64 input: {}", e))?;
            let mut decoder = GzDecoder::new(bytes.as_slice());
            let mut out = String::new();
            decoder
                .read_to_string(&mut out)
                .map(|_| Value::str(out))
                .map_err(|e| format!("gzip decompression failed: {}", e))
        }),

        _ => return None,
    };
    Some(result)
}

fn zip_compress(text: &str) -> Result<Value, String> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        writer
            .start_file("data", options)
            .map_err(|e| format!("zip compression failed: {}", e))?;
        writer
            .write_all(text.as_bytes())
            .map_err(|e| format!("zip compression failed: {}", e))?;
        writer.finish().map_err(|e| format!("zip compression failed: {}", e))?;
    }
    Ok(Value::str(base64::engine::general_purpose::STANDARD.encode(cursor.into_inner())))
}

fn zip_decompress(encoded: &str) -> Result<Value, String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| format!("Invalid base64 input: {}", e))?;
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| format!("Invalid zip archive: {}", e))?;
    if archive.len() == 0 {
        return Err("Zip archive has no entries".to_string());
    }
    let mut entry =
        archive.by_index(0).map_err(|e| format!("Invalid zip archive: {}", e))?;
    let mut out = String::new();
    entry
        .read_to_string(&mut out)
        .map(|_| Value::str(out))
        .map_err(|e| format!("zip decompression failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::handle;
    use crate::value::Value;

    fn string_result(result: Option<Result<Value, String>>) -> String {
        match result.unwrap().unwrap() {
            Value::Str(s) => s.as_ref().clone(),
            other => panic!("Expected Value::Str, got {:?}", other),
        }
    }

    #[test]
    fn test_base64_round_trip() {
        let encoded = string_result(handle("base64Encode:", &[Value::str_ref("hello")]));
        assert_eq!(encoded, "aGVsbG8=");
        let decoded = string_result(handle("base64Decode:", &[Value::str_ref(&encoded)]));
        assert_eq!(decoded, "hello");
    }

    #[test]
    fn test_base64_decode_rejects_garbage() {
        let result = handle("base64Decode:", &[Value::str_ref("@@not base64@@")]).unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_zip_round_trip() {
        let text = "smalt smalt smalt smalt smalt";
        let compressed = string_result(handle("zipCompress:", &[Value::str_ref(text)]));
        let decompressed =
            string_result(handle("zipDecompress:", &[Value::str_ref(&compressed)]));
        assert_eq!(decompressed, text);
    }

    #[test]
    fn test_gzip_round_trip() {
        let text = "a longer body of text that gzip can actually shrink down a bit";
        let compressed = string_result(handle("gzipCompress:", &[Value::str_ref(text)]));
        let decompressed =
            string_result(handle("gzipDecompress:", &[Value::str_ref(&compressed)]));
        assert_eq!(decompressed, text);
    }
}

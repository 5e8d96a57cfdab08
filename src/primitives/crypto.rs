// File: src/primitives/crypto.rs
//
// Hashing and AES primitives.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine;
use md5::Md5;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};

use super::{check_arity, string_arg};
use crate::value::Value;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const AES_KEY_LEN: usize = 32;
const AES_IV_LEN: usize = 16;

pub fn handle(selector: &str, args: &[Value]) -> Option<Result<Value, String>> {
    let result = match selector {
        "sha256:" => hash_hex::<Sha256>(selector, args),
        "sha512:" => hash_hex::<Sha512>(selector, args),
        "md5:" => hash_hex::<Md5>(selector, args),

        "aesGenerateKey" => check_arity(selector, args, 0).map(|_| {
            let mut key = [0u8; AES_KEY_LEN];
            OsRng.fill_bytes(&mut key);
            Value::str(base64::engine::general_purpose::STANDARD.encode(key))
        }),

        "aesEncrypt:key:" => aes_encrypt(selector, args),
        "aesDecrypt:key:" => aes_decrypt(selector, args),

        _ => return None,
    };
    Some(result)
}

fn hash_hex<D: Digest>(selector: &str, args: &[Value]) -> Result<Value, String> {
    check_arity(selector, args, 1)?;
    let data = string_arg(selector, args, 0)?;
    let mut hasher = D::new();
    hasher.update(data.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    Ok(Value::str(hex))
}

/// The key argument is the base64 string produced by aesGenerateKey, or a
/// raw 32-character string.
fn key_bytes(key: &str) -> Result<[u8; AES_KEY_LEN], String> {
    if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(key) {
        if decoded.len() == AES_KEY_LEN {
            let mut out = [0u8; AES_KEY_LEN];
            out.copy_from_slice(&decoded);
            return Ok(out);
        }
    }
    if key.len() == AES_KEY_LEN {
        let mut out = [0u8; AES_KEY_LEN];
        out.copy_from_slice(key.as_bytes());
        return Ok(out);
    }
    Err("AES key must be 32 bytes".to_string())
}

/// AES-256-CBC with a random IV prefixed to the base64 ciphertext.
fn aes_encrypt(selector: &str, args: &[Value]) -> Result<Value, String> {
    check_arity(selector, args, 2)?;
    let plaintext = string_arg(selector, args, 0)?;
    let key = key_bytes(&string_arg(selector, args, 1)?)?;

    let mut iv = [0u8; AES_IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|e| format!("Failed to create AES cipher: {}", e))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let mut payload = iv.to_vec();
    payload.extend_from_slice(&ciphertext);
    Ok(Value::str(base64::engine::general_purpose::STANDARD.encode(payload)))
}

fn aes_decrypt(selector: &str, args: &[Value]) -> Result<Value, String> {
    check_arity(selector, args, 2)?;
    let payload_b64 = string_arg(selector, args, 0)?;
    let key = key_bytes(&string_arg(selector, args, 1)?)?;

    let payload = base64::engine::general_purpose::STANDARD
        .decode(payload_b64)
        .map_err(|e| format!("Invalid base64 ciphertext: {}", e))?;
    if payload.len() < AES_IV_LEN {
        return Err("Invalid ciphertext: too short".to_string());
    }

    let (iv, ciphertext) = payload.split_at(AES_IV_LEN);
    let cipher = Aes256CbcDec::new_from_slices(&key, iv)
        .map_err(|e| format!("Failed to create AES cipher: {}", e))?;
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| "AES decryption failed".to_string())?;

    String::from_utf8(plaintext)
        .map(Value::str)
        .map_err(|e| format!("Decrypted data is not valid UTF-8: {}", e))
}

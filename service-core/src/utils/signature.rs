use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Field holding the signature inside a signed JSON payload.
pub const SIGNATURE_FIELD: &str = "signature";

/// Raw HMAC-SHA256 of `message` under `key`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Compare two strings without leaking the position of the first mismatch.
pub fn secure_compare(expected: &str, provided: &str) -> bool {
    let expected_bytes = expected.as_bytes();
    let provided_bytes = provided.as_bytes();

    if expected_bytes.len() != provided_bytes.len() {
        return false;
    }

    expected_bytes.ct_eq(provided_bytes).into()
}

/// Canonical form of a JSON payload: the top-level `signature` field removed,
/// object keys sorted at every depth, no insignificant whitespace.
///
/// Non-ASCII characters are written as lowercase `\uXXXX` escapes (UTF-16
/// surrogate pairs above the BMP), matching signers that serialize with
/// `json.dumps(..., sort_keys=True, separators=(",", ":"))`.
pub fn canonical_json(payload: &Value) -> Result<String, anyhow::Error> {
    let mut out = String::new();
    match payload {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().filter(|k| *k != SIGNATURE_FIELD).collect();
            keys.sort();
            write_object(&mut out, keys.into_iter().map(|k| (k, &map[k])))?;
        }
        other => write_value(&mut out, other)?,
    }
    Ok(out)
}

fn write_object<'a>(
    out: &mut String,
    entries: impl Iterator<Item = (&'a String, &'a Value)>,
) -> Result<(), anyhow::Error> {
    out.push('{');
    for (i, (key, value)) in entries.enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_ascii_json(out, &serde_json::to_string(key)?);
        out.push(':');
        write_value(out, value)?;
    }
    out.push('}');
    Ok(())
}

fn write_value(out: &mut String, value: &Value) -> Result<(), anyhow::Error> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            write_object(out, keys.into_iter().map(|k| (k, &map[k])))
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
            Ok(())
        }
        scalar => {
            push_ascii_json(out, &serde_json::to_string(scalar)?);
            Ok(())
        }
    }
}

fn push_ascii_json(out: &mut String, encoded: &str) {
    for c in encoded.chars() {
        if c.is_ascii() {
            out.push(c);
            continue;
        }
        let mut units = [0u16; 2];
        for unit in c.encode_utf16(&mut units) {
            out.push_str(&format!("\\u{:04x}", unit));
        }
    }
}

/// Sign a JSON payload: hex HMAC-SHA256 over its canonical form.
pub fn sign_json(secret: &str, payload: &Value) -> Result<String, anyhow::Error> {
    let canonical = canonical_json(payload)?;
    let mac = hmac_sha256(secret.as_bytes(), canonical.as_bytes())?;
    Ok(hex::encode(mac))
}

/// Verify the `signature` carried inside a JSON payload.
///
/// Returns `Ok(false)` when the field is missing, not a string, or does not
/// match; an empty secret never verifies anything.
pub fn verify_json_signature(secret: &str, payload: &Value) -> Result<bool, anyhow::Error> {
    if secret.is_empty() {
        return Ok(false);
    }

    let provided = match payload.get(SIGNATURE_FIELD).and_then(Value::as_str) {
        Some(sig) => sig.to_ascii_lowercase(),
        None => return Ok(false),
    };

    let expected = sign_json(secret, payload)?;
    Ok(secure_compare(&expected, &provided))
}

use anyhow::{anyhow, Context};
use ethers::types::{Address, Bytes, H256, U256};
use serde_json::Value;

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

pub fn fmt_h256(h: H256) -> String {
    format!("0x{}", hex::encode(h.as_bytes()))
}

/// JSON-RPC "quantity" encoding.
pub fn fmt_u256(v: U256) -> String {
    if v.is_zero() {
        "0x0".to_string()
    } else {
        format!("0x{:x}", v)
    }
}

pub fn fmt_bytes(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b.as_ref()))
}

pub fn parse_u256_quantity(s: &str) -> anyhow::Result<U256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(U256::zero());
    }
    Ok(U256::from_str_radix(s, 16)?)
}

pub fn parse_h256(s: &str) -> anyhow::Result<H256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        anyhow::bail!("expected 32-byte hex, got {} bytes", bytes.len());
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(H256(arr))
}

pub fn parse_bytes(s: &str) -> anyhow::Result<Bytes> {
    let hex_str = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(hex_str).with_context(|| format!("invalid hex: {s}"))?;
    Ok(Bytes::from(bytes))
}

pub fn parse_address(s: &str) -> anyhow::Result<Address> {
    s.parse::<Address>().map_err(|e| anyhow!("invalid address {s}: {e}"))
}

/// True for a `0x`-prefixed string of hex digits (empty payload allowed).
pub fn is_hex(s: &str) -> bool {
    s.strip_prefix("0x")
        .map(|rest| rest.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

/// Recursively turns every numeric leaf into a lowercase `0x` quantity.
///
/// Bundlers expect hex for every numeric field and JSON has no big integer
/// type, so this runs on every payload before it goes over JSON-RPC.
/// Hex strings are lowercased; other strings, booleans and nulls pass through.
pub fn deep_hexlify(value: Value) -> Value {
    match value {
        Value::Number(n) => match n.as_u64() {
            Some(v) => Value::String(fmt_u256(U256::from(v))),
            // Negative or fractional numbers have no quantity form.
            None => Value::Number(n),
        },
        Value::String(s) if is_hex(&s) => Value::String(s.to_ascii_lowercase()),
        Value::Array(items) => Value::Array(items.into_iter().map(deep_hexlify).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, deep_hexlify(v)))
                .collect(),
        ),
        other => other,
    }
}

/// JSON-safe representation of a big integer for error payloads.
pub fn bigint_json(v: U256) -> Value {
    serde_json::json!({ "type": "bigint", "value": v.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quantity_formatting() {
        assert_eq!(fmt_u256(U256::zero()), "0x0");
        assert_eq!(fmt_u256(U256::from(0x59682f1e_u64)), "0x59682f1e");
        assert_eq!(parse_u256_quantity("0x").unwrap(), U256::zero());
        assert_eq!(
            parse_u256_quantity(&fmt_u256(U256::MAX)).unwrap(),
            U256::MAX
        );
    }

    #[test]
    fn deep_hexlify_walks_nested_values() {
        let v = json!({
            "nonce": 1,
            "list": [0, 255, "0xABCD"],
            "nested": { "flag": true, "name": "alice", "none": null },
        });
        let out = deep_hexlify(v);
        assert_eq!(
            out,
            json!({
                "nonce": "0x1",
                "list": ["0x0", "0xff", "0xabcd"],
                "nested": { "flag": true, "name": "alice", "none": null },
            })
        );
    }

    #[test]
    fn bigint_json_is_decimal() {
        assert_eq!(
            bigint_json(U256::from(1000u64)),
            json!({ "type": "bigint", "value": "1000" })
        );
    }

    #[test]
    fn is_hex_requires_prefix() {
        assert!(is_hex("0x"));
        assert!(is_hex("0xdeadBEEF"));
        assert!(!is_hex("deadbeef"));
        assert!(!is_hex("0xzz"));
    }
}

//! settld-canon
//!
//! The single bit-exact JSON serialization rule used to derive every artifact
//! hash in the system. One value, one byte string:
//!
//! - object keys sorted by UTF-16 code-unit order, arrays in input order
//! - numbers: integers plain, floats shortest round-trip, no `-0`, integral
//!   floats in the safe range collapse to integers
//! - strings: minimal JSON escape set only
//! - no trailing newline inside hash input
//!
//! The output feeds SHA-256 directly; any drift here invalidates every chain
//! hash, decision hash and receipt hash downstream.

use serde::de::{DeserializeSeed, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Number, Value};
use settld_core::SettldError;
use std::fmt;

/// Largest integer exactly representable in an IEEE-754 double (2^53).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

// ── Normalization pre-pass ────────────────────────────────────────────────────

/// Normalize a value into the canonical subset.
///
/// Collapses `-0.0` and integral floats within the safe range to integers,
/// recurses through arrays and objects, and rejects anything that cannot be
/// canonically represented. `serde_json::Value` cannot hold NaN or infinity,
/// so those are rejected upstream at the `Number::from_f64` boundary; the
/// helper [`number_from_f64`] reports them with the canonical error code.
pub fn normalize(value: &Value) -> Result<Value, SettldError> {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(value.clone()),
        Value::Number(n) => Ok(Value::Number(normalize_number(n)?)),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(normalize(item)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), normalize(v)?);
            }
            Ok(Value::Object(out))
        }
    }
}

fn normalize_number(n: &Number) -> Result<Number, SettldError> {
    if n.is_i64() || n.is_u64() {
        return Ok(n.clone());
    }
    let f = n.as_f64().ok_or_else(|| SettldError::ValueNotRepresentable {
        reason: "number outside the canonical grammar".to_string(),
    })?;
    if !f.is_finite() {
        return Err(SettldError::ValueNotRepresentable {
            reason: "non-finite number".to_string(),
        });
    }
    // -0 normalizes to 0; integral doubles in the safe range become integers.
    if f == 0.0 {
        return Ok(Number::from(0));
    }
    if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER {
        return Ok(Number::from(f as i64));
    }
    Number::from_f64(f).ok_or_else(|| SettldError::ValueNotRepresentable {
        reason: "non-finite number".to_string(),
    })
}

/// Convert an `f64` into a canonical number, rejecting NaN and infinities.
pub fn number_from_f64(f: f64) -> Result<Number, SettldError> {
    if !f.is_finite() {
        return Err(SettldError::ValueNotRepresentable {
            reason: "non-finite number".to_string(),
        });
    }
    normalize_number(&Number::from_f64(f).expect("finite f64"))
}

// ── Canonical encoding ────────────────────────────────────────────────────────

/// Canonical UTF-8 byte string for `value`. Runs the normalization pre-pass.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, SettldError> {
    Ok(canonical_string(value)?.into_bytes())
}

/// Canonical string form for `value`. Runs the normalization pre-pass.
pub fn canonical_string(value: &Value) -> Result<String, SettldError> {
    let normalized = normalize(value)?;
    let mut out = String::new();
    write_value(&normalized, &mut out);
    Ok(out)
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        // serde_json renders i64/u64 plainly and floats in shortest
        // round-trip form (ryu), which is the canonical grammar.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_escaped(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            // Lexicographic on UTF-16 code units, not UTF-8 bytes: astral
            // characters (surrogate pairs) sort below U+E000..U+FFFF.
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(key, out);
                out.push(':');
                write_value(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// Minimal escape set: `\" \\ \b \f \n \r \t`, `\u00XX` for remaining control
/// characters, everything else verbatim UTF-8.
fn write_escaped(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

// ── Raw-text entrypoint (duplicate-key detection) ─────────────────────────────

/// Parse raw JSON text and return its canonical form.
///
/// This is the only path where duplicate object keys can occur; the parsed
/// `Value` layer cannot hold them, so detection happens during deserialization
/// and fails with `CANONICAL_DUPLICATE_KEY`.
pub fn canonical_from_str(text: &str) -> Result<String, SettldError> {
    let mut de = serde_json::Deserializer::from_str(text);
    let value = StrictValue
        .deserialize(&mut de)
        .map_err(map_parse_error)?;
    de.end().map_err(map_parse_error)?;
    canonical_string(&value)
}

fn map_parse_error(e: serde_json::Error) -> SettldError {
    let msg = e.to_string();
    if let Some(rest) = msg.strip_prefix("duplicate object key: ") {
        let key = rest
            .split(" at line")
            .next()
            .unwrap_or(rest)
            .trim()
            .to_string();
        SettldError::DuplicateKey { key }
    } else {
        SettldError::ValueNotRepresentable { reason: msg }
    }
}

/// Deserialization seed that builds a `Value` but errors on duplicate keys.
struct StrictValue;

impl<'de> DeserializeSeed<'de> for StrictValue {
    type Value = Value;

    fn deserialize<D>(self, deserializer: D) -> Result<Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(StrictValueVisitor)
    }
}

struct StrictValueVisitor;

impl<'de> Visitor<'de> for StrictValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a JSON value without duplicate object keys")
    }

    fn visit_bool<E: serde::de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Number(v.into()))
    }

    fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Value, E> {
        Ok(Value::Number(v.into()))
    }

    fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Value, E> {
        Number::from_f64(v)
            .map(Value::Number)
            .ok_or_else(|| E::custom("non-finite number"))
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::String(v.to_string()))
    }

    fn visit_string<E: serde::de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: serde::de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        StrictValue.deserialize(deserializer)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element_seed(StrictValue)? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A>(self, mut access: A) -> Result<Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut map = Map::new();
        while let Some(key) = access.next_key::<String>()? {
            let value = access.next_value_seed(StrictValue)?;
            if map.insert(key.clone(), value).is_some() {
                return Err(serde::de::Error::custom(format!(
                    "duplicate object key: {key}"
                )));
            }
        }
        Ok(Value::Object(map))
    }
}

// ── Serialize-then-canonicalize helper ────────────────────────────────────────

/// Canonical bytes of any serde-serializable artifact. The usual path for
/// hashing: `sha256_hex(&to_canonical_bytes(&artifact)?)`.
pub fn to_canonical_bytes<T: serde::Serialize>(artifact: &T) -> Result<Vec<u8>, SettldError> {
    let value =
        serde_json::to_value(artifact).map_err(|e| SettldError::Serialization(e.to_string()))?;
    canonical_bytes(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_is_stable_under_permutation() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":2,"c":[{"y":1,"x":2}]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"c":[{"x":2,"y":1}],"a":2,"b":1}"#).unwrap();
        assert_eq!(
            canonical_string(&a).unwrap(),
            canonical_string(&b).unwrap()
        );
        assert_eq!(
            canonical_string(&a).unwrap(),
            r#"{"a":2,"b":1,"c":[{"x":2,"y":1}]}"#
        );
    }

    #[test]
    fn keys_sort_by_utf16_code_units_not_utf8_bytes() {
        // U+10000 encodes in UTF-16 as the surrogate pair D800 DC00, which
        // sorts below U+FFFF; UTF-8 byte order would put it after.
        let mut map = Map::new();
        map.insert("\u{ffff}".to_string(), json!(1));
        map.insert("\u{10000}".to_string(), json!(2));
        let s = canonical_string(&Value::Object(map)).unwrap();
        let astral = s.find('\u{10000}').unwrap();
        let bmp = s.find('\u{ffff}').unwrap();
        assert!(astral < bmp, "astral key must sort first: {s}");
    }

    #[test]
    fn arrays_keep_input_order() {
        let v = json!([3, 1, 2]);
        assert_eq!(canonical_string(&v).unwrap(), "[3,1,2]");
    }

    #[test]
    fn negative_zero_normalizes_to_zero() {
        let v = json!(-0.0);
        assert_eq!(canonical_string(&v).unwrap(), "0");
    }

    #[test]
    fn integral_floats_collapse_to_integers() {
        assert_eq!(canonical_string(&json!(2.0)).unwrap(), "2");
        assert_eq!(canonical_string(&json!(-17.0)).unwrap(), "-17");
        assert_eq!(canonical_string(&json!(0.5)).unwrap(), "0.5");
    }

    #[test]
    fn integers_never_use_exponent_form() {
        assert_eq!(
            canonical_string(&json!(9007199254740991i64)).unwrap(),
            "9007199254740991"
        );
    }

    #[test]
    fn minimal_escapes_only() {
        let v = json!("a\"b\\c\nd\te\u{01}f");
        assert_eq!(
            canonical_string(&v).unwrap(),
            "\"a\\\"b\\\\c\\nd\\te\\u0001f\""
        );
    }

    #[test]
    fn non_control_unicode_stays_verbatim() {
        let v = json!("héllo — ☃");
        assert_eq!(canonical_string(&v).unwrap(), "\"héllo — ☃\"");
    }

    #[test]
    fn duplicate_keys_rejected_from_raw_text() {
        let err = canonical_from_str(r#"{"a":1,"a":2}"#).unwrap_err();
        assert_eq!(err.code(), "CANONICAL_DUPLICATE_KEY");
    }

    #[test]
    fn nested_duplicate_keys_rejected() {
        let err = canonical_from_str(r#"{"outer":{"k":1,"k":1}}"#).unwrap_err();
        assert_eq!(err.code(), "CANONICAL_DUPLICATE_KEY");
    }

    #[test]
    fn non_finite_f64_rejected() {
        let err = number_from_f64(f64::NAN).unwrap_err();
        assert_eq!(err.code(), "CANONICAL_VALUE_NOT_REPRESENTABLE");
        let err = number_from_f64(f64::INFINITY).unwrap_err();
        assert_eq!(err.code(), "CANONICAL_VALUE_NOT_REPRESENTABLE");
    }

    #[test]
    fn canonical_equals_canonical_of_normalized() {
        let v = json!({"z": -0.0, "a": [1.0, {"q": 2.0}], "m": "s"});
        let n = normalize(&v).unwrap();
        assert_eq!(
            canonical_string(&v).unwrap(),
            canonical_string(&n).unwrap()
        );
    }

    #[test]
    fn no_trailing_newline_in_output() {
        let s = canonical_string(&json!({"a": 1})).unwrap();
        assert!(!s.ends_with('\n'));
    }

    #[test]
    fn struct_serialization_path_matches_value_path() {
        #[derive(serde::Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Sample {
            beta_field: i64,
            alpha_field: &'static str,
        }
        let s = Sample {
            beta_field: 7,
            alpha_field: "x",
        };
        let bytes = to_canonical_bytes(&s).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"alphaField":"x","betaField":7}"#
        );
    }
}

//! Order-preserving encoding of values and tuples.
//!
//! Every encoded value starts with a discriminator character reflecting its
//! type rank, so comparing two encodings as strings agrees with
//! [`Value::compare`]:
//!
//! | type   | prefix | body                                      |
//! |--------|--------|-------------------------------------------|
//! | null   | `b`    | empty                                     |
//! | object | `c`    | tuple of sorted `key, value, key, value…` |
//! | array  | `d`    | tuple of elements                         |
//! | number | `e`    | 16 hex digits of the sign-flipped bits    |
//! | string | `f`    | the raw string                            |
//! | bool   | `g`    | `false` / `true`                          |
//! | date   | `h`    | 16 hex digits of seconds, 8 of nanos      |
//!
//! Tuples concatenate element encodings, each followed by `\x00`. Inside an
//! element `\x00` is written as `\x01\x01` and `\x01` as `\x01\x02`; both
//! escapes still sort below any other character, so a tuple that is a prefix
//! of another sorts first.

use crate::{Error, Object, Result, Tuple, Value};
use chrono::{DateTime, Utc};

const NULL: char = 'b';
const OBJECT: char = 'c';
const ARRAY: char = 'd';
const NUMBER: char = 'e';
const STRING: char = 'f';
const BOOL: char = 'g';
const DATE: char = 'h';

pub(crate) const DELIMITER: char = '\x00';
const ESCAPE: char = '\x01';

/// A character greater than every discriminator. Appending it to an encoded
/// tuple yields an upper bound for all tuples extending it.
pub(crate) const MAX_CHAR: char = '\u{7f}';

const SIGN_BIT: u64 = 1 << 63;

/// Encoder with optional restrictions on string contents.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    disallowed: Vec<char>,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    /// A codec that rejects strings containing any of `chars`.
    pub fn with_disallowed(chars: impl IntoIterator<Item = char>) -> Self {
        Self {
            disallowed: chars.into_iter().collect(),
        }
    }

    pub fn encode_value(&self, value: &Value) -> Result<String> {
        let mut out = String::new();
        self.write_value(value, &mut out)?;
        Ok(out)
    }

    pub fn encode_tuple(&self, tuple: &[Value]) -> Result<String> {
        let mut out = String::new();
        self.write_tuple(tuple, &mut out)?;
        Ok(out)
    }

    fn write_value(&self, value: &Value, out: &mut String) -> Result<()> {
        match value {
            Value::Null => out.push(NULL),
            Value::Bool(b) => {
                out.push(BOOL);
                out.push_str(if *b { "true" } else { "false" });
            }
            Value::Number(n) => {
                out.push(NUMBER);
                out.push_str(&encode_number(*n)?);
            }
            Value::String(s) => {
                self.check_string(s)?;
                out.push(STRING);
                out.push_str(s);
            }
            Value::Date(date) => {
                out.push(DATE);
                out.push_str(&encode_date(date));
            }
            Value::Array(items) => {
                out.push(ARRAY);
                self.write_tuple(items, out)?;
            }
            Value::Object(map) => {
                out.push(OBJECT);
                let mut flat = Vec::with_capacity(map.len() * 2);
                for (key, item) in map {
                    self.check_string(key)?;
                    flat.push(Value::String(key.clone()));
                    flat.push(item.clone());
                }
                self.write_tuple(&flat, out)?;
            }
        }
        Ok(())
    }

    fn write_tuple(&self, tuple: &[Value], out: &mut String) -> Result<()> {
        let mut element = String::new();
        for value in tuple {
            element.clear();
            self.write_value(value, &mut element)?;
            for c in element.chars() {
                match c {
                    DELIMITER => out.push_str("\x01\x01"),
                    ESCAPE => out.push_str("\x01\x02"),
                    c => out.push(c),
                }
            }
            out.push(DELIMITER);
        }
        Ok(())
    }

    fn check_string(&self, s: &str) -> Result<()> {
        match s.chars().find(|c| self.disallowed.contains(c)) {
            Some(c) => Err(Error::Encoding(format!(
                "string {:?} contains disallowed character {:?}",
                s, c
            ))),
            None => Ok(()),
        }
    }
}

/// Encode a value with the default codec.
pub fn encode_value(value: &Value) -> Result<String> {
    Codec::default().encode_value(value)
}

/// Encode a tuple with the default codec.
pub fn encode_tuple(tuple: &[Value]) -> Result<String> {
    Codec::default().encode_tuple(tuple)
}

pub fn decode_value(encoded: &str) -> Result<Value> {
    let mut chars = encoded.chars();
    let tag = chars
        .next()
        .ok_or_else(|| Error::Encoding("cannot decode empty value".into()))?;
    let body = chars.as_str();
    match tag {
        NULL if body.is_empty() => Ok(Value::Null),
        BOOL => match body {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            other => Err(Error::Encoding(format!("invalid boolean {:?}", other))),
        },
        NUMBER => decode_number(body).map(Value::Number),
        STRING => Ok(Value::String(body.to_string())),
        DATE => decode_date(body).map(Value::Date),
        ARRAY => decode_tuple(body).map(Value::Array),
        OBJECT => {
            let flat = decode_tuple(body)?;
            if flat.len() % 2 != 0 {
                return Err(Error::Encoding("object has a dangling key".into()));
            }
            let mut map = Object::new();
            let mut items = flat.into_iter();
            while let (Some(key), Some(item)) = (items.next(), items.next()) {
                match key {
                    Value::String(key) => {
                        map.insert(key, item);
                    }
                    other => {
                        return Err(Error::Encoding(format!(
                            "object key must be a string, got {}",
                            other.type_name()
                        )))
                    }
                }
            }
            Ok(Value::Object(map))
        }
        other => Err(Error::Encoding(format!(
            "unknown type discriminator {:?}",
            other
        ))),
    }
}

pub fn decode_tuple(encoded: &str) -> Result<Tuple> {
    let mut tuple = Vec::new();
    let mut element = String::new();
    let mut chars = encoded.chars();
    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some('\x01') => element.push(DELIMITER),
                Some('\x02') => element.push(ESCAPE),
                other => {
                    return Err(Error::Encoding(format!(
                        "invalid escape sequence {:?}",
                        other
                    )))
                }
            },
            DELIMITER => {
                tuple.push(decode_value(&element)?);
                element.clear();
            }
            c => element.push(c),
        }
    }
    if !element.is_empty() {
        return Err(Error::Encoding("unterminated tuple element".into()));
    }
    Ok(tuple)
}

/// Compare tuples element-wise; a prefix sorts before its extensions.
pub fn compare_tuple(a: &[Value], b: &[Value]) -> std::cmp::Ordering {
    Value::Array(a.to_vec()).compare(&Value::Array(b.to_vec()))
}

fn encode_number(n: f64) -> Result<String> {
    if !n.is_finite() {
        return Err(Error::Encoding(format!("cannot encode number {}", n)));
    }
    // -0.0 and 0.0 compare equal, so they must encode identically
    let n = if n == 0.0 { 0.0 } else { n };
    let bits = n.to_bits();
    let key = if bits & SIGN_BIT != 0 {
        !bits
    } else {
        bits | SIGN_BIT
    };
    Ok(format!("{:016x}", key))
}

fn decode_number(body: &str) -> Result<f64> {
    if body.len() != 16 {
        return Err(Error::Encoding(format!("invalid number encoding {:?}", body)));
    }
    let key = u64::from_str_radix(body, 16)
        .map_err(|e| Error::Encoding(format!("invalid number encoding {:?}: {}", body, e)))?;
    let bits = if key & SIGN_BIT != 0 {
        key & !SIGN_BIT
    } else {
        !key
    };
    Ok(f64::from_bits(bits))
}

fn encode_date(date: &DateTime<Utc>) -> String {
    let seconds = (date.timestamp() as u64) ^ SIGN_BIT;
    format!("{:016x}{:08x}", seconds, date.timestamp_subsec_nanos())
}

fn decode_date(body: &str) -> Result<DateTime<Utc>> {
    let invalid = || Error::Encoding(format!("invalid date encoding {:?}", body));
    if body.len() != 24 || !body.is_ascii() {
        return Err(invalid());
    }
    let seconds = u64::from_str_radix(&body[..16], 16).map_err(|_| invalid())?;
    let nanos = u32::from_str_radix(&body[16..], 16).map_err(|_| invalid())?;
    DateTime::from_timestamp((seconds ^ SIGN_BIT) as i64, nanos).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(j: serde_json::Value) -> Value {
        Value::from(j)
    }

    #[test]
    fn discriminators_follow_type_rank() {
        let encoded: Vec<String> = [
            Value::Null,
            v(json!({})),
            v(json!([])),
            Value::Number(0.0),
            Value::from(""),
            Value::Bool(false),
            Value::Date(DateTime::from_timestamp(0, 0).unwrap()),
        ]
        .iter()
        .map(|value| encode_value(value).unwrap())
        .collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn numbers_are_fixed_width_and_ordered() {
        let numbers = [-1e300, -5.5, -1.0, -0.0001, 0.0, 0.0001, 1.0, 2.0, 10.0, 1e300];
        let encoded: Vec<String> = numbers
            .iter()
            .map(|n| encode_value(&Value::Number(*n)).unwrap())
            .collect();
        assert!(encoded.iter().all(|e| e.len() == 17));
        for pair in encoded.windows(2) {
            assert!(pair[0] < pair[1], "{:?}", pair);
        }
        for (n, e) in numbers.iter().zip(&encoded) {
            assert_eq!(decode_value(e).unwrap(), Value::Number(*n));
        }
    }

    #[test]
    fn dates_are_fixed_width_and_ordered() {
        let dates: Vec<Value> = [(-86_400, 0), (-1, 999_999_999), (0, 0), (0, 1), (1_700_000_000, 5)]
            .iter()
            .map(|(secs, nanos)| Value::Date(DateTime::from_timestamp(*secs, *nanos).unwrap()))
            .collect();
        let encoded: Vec<String> = dates.iter().map(|d| encode_value(d).unwrap()).collect();
        assert!(encoded.iter().all(|e| e.len() == 25));
        for pair in encoded.windows(2) {
            assert!(pair[0] < pair[1], "{:?}", pair);
        }
        for (date, e) in dates.iter().zip(&encoded) {
            assert_eq!(&decode_value(e).unwrap(), date);
        }
        assert!(encode_value(&Value::Bool(true)).unwrap() < encoded[0]);
        assert!(decode_value("h0123").is_err());
    }

    #[test]
    fn negative_zero_encodes_as_zero() {
        assert_eq!(
            encode_value(&Value::Number(-0.0)).unwrap(),
            encode_value(&Value::Number(0.0)).unwrap()
        );
    }

    #[test]
    fn non_finite_numbers_fail() {
        assert!(matches!(
            encode_value(&Value::Number(f64::NAN)),
            Err(Error::Encoding(_))
        ));
        assert!(matches!(
            encode_value(&Value::Number(f64::INFINITY)),
            Err(Error::Encoding(_))
        ));
    }

    #[test]
    fn tuple_roundtrip_with_control_characters() {
        let tuple = vec![
            Value::from("a\x00b\x01c"),
            v(json!(["nested", ["deeper", null]])),
            v(json!({"k\x00": 1, "z": [true]})),
            Value::Number(-3.25),
        ];
        let encoded = encode_tuple(&tuple).unwrap();
        assert_eq!(decode_tuple(&encoded).unwrap(), tuple);
    }

    #[test]
    fn prefix_tuple_sorts_first() {
        let short = encode_tuple(&[Value::from("ab")]).unwrap();
        let long = encode_tuple(&[Value::from("ab"), Value::Null]).unwrap();
        let embedded_nul = encode_tuple(&[Value::from("ab\x00")]).unwrap();
        assert!(short < long);
        assert!(short < embedded_nul);
    }

    #[test]
    fn disallowed_characters_fail() {
        let codec = Codec::with_disallowed(['#']);
        assert!(matches!(
            codec.encode_value(&Value::from("a#b")),
            Err(Error::Encoding(_))
        ));
        assert!(matches!(
            codec.encode_value(&v(json!({"x#": 1}))),
            Err(Error::Encoding(_))
        ));
        assert!(codec.encode_value(&Value::from("ab")).is_ok());
    }

    #[test]
    fn malformed_input_fails() {
        assert!(decode_value("").is_err());
        assert!(decode_value("z").is_err());
        assert!(decode_value("e12").is_err());
        assert!(decode_tuple("fabc").is_err());
        assert!(decode_tuple("fa\x01\x05\x00").is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_scalar() -> impl Strategy<Value = Value> {
            prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::Bool),
                (-1.0e9f64..1.0e9f64).prop_map(Value::Number),
                (-1000i64..1000).prop_map(|n| Value::Number(n as f64)),
                "[a-c\\x00\\x01~]{0,6}".prop_map(Value::String),
                (-4_000_000_000i64..4_000_000_000, 0u32..1_000_000_000).prop_map(|(secs, nanos)| {
                    Value::Date(DateTime::from_timestamp(secs, nanos).unwrap_or_default())
                }),
            ]
        }

        fn arb_value() -> impl Strategy<Value = Value> {
            arb_scalar().prop_recursive(3, 24, 4, |inner| {
                prop_oneof![
                    prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                    prop::collection::btree_map("[a-c]{1,3}", inner, 0..4)
                        .prop_map(Value::Object),
                ]
            })
        }

        proptest! {
            #[test]
            fn prop_value_roundtrip(value in arb_value()) {
                let encoded = encode_value(&value).unwrap();
                prop_assert_eq!(decode_value(&encoded).unwrap(), value);
            }

            #[test]
            fn prop_tuple_roundtrip(tuple in prop::collection::vec(arb_value(), 0..5)) {
                let encoded = encode_tuple(&tuple).unwrap();
                prop_assert_eq!(decode_tuple(&encoded).unwrap(), tuple);
            }

            #[test]
            fn prop_scalar_order_preserved(a in arb_scalar(), b in arb_scalar()) {
                let (ea, eb) = (encode_value(&a).unwrap(), encode_value(&b).unwrap());
                prop_assert_eq!(a.compare(&b), ea.cmp(&eb));
            }

            #[test]
            fn prop_nested_order_preserved(a in arb_value(), b in arb_value()) {
                let (ea, eb) = (encode_value(&a).unwrap(), encode_value(&b).unwrap());
                prop_assert_eq!(a.compare(&b), ea.cmp(&eb), "{:?} vs {:?}", a, b);
            }

            #[test]
            fn prop_nested_tuple_order_preserved(
                a in prop::collection::vec(arb_value(), 0..4),
                b in prop::collection::vec(arb_value(), 0..4),
            ) {
                let (ea, eb) = (encode_tuple(&a).unwrap(), encode_tuple(&b).unwrap());
                prop_assert_eq!(compare_tuple(&a, &b), ea.cmp(&eb));
            }

            #[test]
            fn prop_tuple_order_preserved(
                a in prop::collection::vec(arb_scalar(), 0..4),
                b in prop::collection::vec(arb_scalar(), 0..4),
            ) {
                let (ea, eb) = (encode_tuple(&a).unwrap(), encode_tuple(&b).unwrap());
                prop_assert_eq!(compare_tuple(&a, &b), ea.cmp(&eb));
            }
        }
    }
}

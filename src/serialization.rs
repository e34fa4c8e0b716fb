// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Value ⇄ bytes conversion for cached payloads.
//!
//! Payloads are JSON (serde_json), optionally zstd-compressed above a size
//! threshold. Any `Serialize + DeserializeOwned` type whose serde
//! representation round-trips through JSON is supported: scalars,
//! sequences, maps with string keys, and any nesting of them.
//!
//! Reference cycles cannot be built out of these owned shapes (serde's
//! `rc` feature is not enabled, so `Rc`/`Arc` graphs do not implement
//! `Serialize`). Runaway nesting is rejected by the depth guard on both
//! encode and decode rather than truncated.
//!
//! JSON has no NaN or infinity and `serde_json` would write them as
//! `null`, so values are walked by [`check_finite`] first and any
//! non-finite float is an error.

use serde::de::DeserializeOwned;
use serde::ser::{self, Serializer};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use crate::compression::{compress_bytes, decompress_bytes, is_compressed};

/// Maximum nesting accepted in either direction (matches serde_json's own
/// recursion limit on the decode side).
pub const DEFAULT_MAX_DEPTH: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("value could not be encoded: {0}")]
    Encode(String),

    #[error("payload could not be decoded: {0}")]
    Decode(String),

    #[error("value nests deeper than {limit} levels")]
    TooDeep { limit: usize },

    #[error("non-finite float {value} at {path} has no JSON representation")]
    NonFinite { path: String, value: f64 },

    #[error(transparent)]
    Compression(#[from] crate::compression::CompressionError),
}

/// Encoder/decoder for cached values.
#[derive(Debug, Clone)]
pub struct SerializationLayer {
    max_depth: usize,
    /// Payloads at least this large are compressed (`None` = never).
    compression_threshold: Option<usize>,
}

impl Default for SerializationLayer {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            compression_threshold: None,
        }
    }
}

impl SerializationLayer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Compress payloads of at least `bytes` bytes. Only takes effect with
    /// the `compression` feature enabled.
    #[must_use]
    pub fn with_compression_threshold(mut self, bytes: Option<usize>) -> Self {
        self.compression_threshold = bytes;
        self
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        check_finite(value).map_err(|e| match e {
            FloatCheckError::NonFinite { path, value } => SerializationError::NonFinite { path, value },
            FloatCheckError::Custom(msg) => SerializationError::Encode(msg),
        })?;
        let tree = serde_json::to_value(value).map_err(|e| SerializationError::Encode(e.to_string()))?;
        if depth(&tree) > self.max_depth {
            return Err(SerializationError::TooDeep { limit: self.max_depth });
        }

        let json = serde_json::to_vec(&tree).map_err(|e| SerializationError::Encode(e.to_string()))?;
        match self.compression_threshold {
            Some(threshold) if json.len() >= threshold && cfg!(feature = "compression") => {
                Ok(compress_bytes(&json)?)
            }
            _ => Ok(json),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        let json = if is_compressed(bytes) {
            decompress_bytes(bytes)?
        } else {
            bytes.to_vec()
        };

        let tree: Value =
            serde_json::from_slice(&json).map_err(|e| SerializationError::Decode(e.to_string()))?;
        if depth(&tree) > self.max_depth {
            return Err(SerializationError::TooDeep { limit: self.max_depth });
        }

        serde_json::from_value(tree).map_err(|e| SerializationError::Decode(e.to_string()))
    }
}

/// Nesting depth of a JSON tree; scalars are depth 0.
///
/// Iterative so that measuring a hostile tree cannot itself overflow the stack.
pub(crate) fn depth(value: &Value) -> usize {
    let mut deepest = 0;
    let mut stack: Vec<(&Value, usize)> = vec![(value, 0)];

    while let Some((node, level)) = stack.pop() {
        deepest = deepest.max(level);
        match node {
            Value::Array(items) => stack.extend(items.iter().map(|v| (v, level + 1))),
            Value::Object(map) => stack.extend(map.values().map(|v| (v, level + 1))),
            _ => {}
        }
    }
    deepest
}

/// Why [`check_finite`] stopped.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FloatCheckError {
    /// `path` is `$` for the root, then `.field` and `[index]` segments
    NonFinite { path: String, value: f64 },
    /// The value's own `Serialize` impl failed
    Custom(String),
}

impl fmt::Display for FloatCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FloatCheckError::NonFinite { path, value } => write!(f, "non-finite float {} at {}", value, path),
            FloatCheckError::Custom(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for FloatCheckError {}

impl ser::Error for FloatCheckError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        FloatCheckError::Custom(msg.to_string())
    }
}

/// Walk `value`'s serde representation and fail on the first NaN or
/// infinity. Everything else, including shapes JSON cannot hold, passes;
/// those are reported by `serde_json` afterwards.
pub(crate) fn check_finite<T: Serialize + ?Sized>(value: &T) -> Result<(), FloatCheckError> {
    value.serialize(&mut FloatCheck { path: vec!["$".to_string()] })
}

struct FloatCheck {
    path: Vec<String>,
}

impl FloatCheck {
    fn float(&self, value: f64) -> Result<(), FloatCheckError> {
        if value.is_finite() {
            Ok(())
        } else {
            Err(FloatCheckError::NonFinite {
                path: self.path.concat(),
                value,
            })
        }
    }

    fn nested<T: Serialize + ?Sized>(&mut self, segment: String, value: &T) -> Result<(), FloatCheckError> {
        self.path.push(segment);
        let result = value.serialize(&mut *self);
        self.path.pop();
        result
    }
}

/// Compound state: the checker plus the next sequence index.
struct Compound<'a> {
    check: &'a mut FloatCheck,
    index: usize,
}

impl<'a> Compound<'a> {
    fn element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FloatCheckError> {
        let segment = format!("[{}]", self.index);
        self.index += 1;
        self.check.nested(segment, value)
    }

    fn field<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<(), FloatCheckError> {
        self.check.nested(format!(".{}", name), value)
    }
}

impl<'a> Serializer for &'a mut FloatCheck {
    type Ok = ();
    type Error = FloatCheckError;
    type SerializeSeq = Compound<'a>;
    type SerializeTuple = Compound<'a>;
    type SerializeTupleStruct = Compound<'a>;
    type SerializeTupleVariant = Compound<'a>;
    type SerializeMap = Compound<'a>;
    type SerializeStruct = Compound<'a>;
    type SerializeStructVariant = Compound<'a>;

    fn serialize_bool(self, _: bool) -> Result<(), FloatCheckError> { Ok(()) }
    fn serialize_i8(self, _: i8) -> Result<(), FloatCheckError> { Ok(()) }
    fn serialize_i16(self, _: i16) -> Result<(), FloatCheckError> { Ok(()) }
    fn serialize_i32(self, _: i32) -> Result<(), FloatCheckError> { Ok(()) }
    fn serialize_i64(self, _: i64) -> Result<(), FloatCheckError> { Ok(()) }
    fn serialize_i128(self, _: i128) -> Result<(), FloatCheckError> { Ok(()) }
    fn serialize_u8(self, _: u8) -> Result<(), FloatCheckError> { Ok(()) }
    fn serialize_u16(self, _: u16) -> Result<(), FloatCheckError> { Ok(()) }
    fn serialize_u32(self, _: u32) -> Result<(), FloatCheckError> { Ok(()) }
    fn serialize_u64(self, _: u64) -> Result<(), FloatCheckError> { Ok(()) }
    fn serialize_u128(self, _: u128) -> Result<(), FloatCheckError> { Ok(()) }

    fn serialize_f32(self, v: f32) -> Result<(), FloatCheckError> {
        self.float(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> Result<(), FloatCheckError> {
        self.float(v)
    }

    fn serialize_char(self, _: char) -> Result<(), FloatCheckError> { Ok(()) }
    fn serialize_str(self, _: &str) -> Result<(), FloatCheckError> { Ok(()) }
    fn serialize_bytes(self, _: &[u8]) -> Result<(), FloatCheckError> { Ok(()) }
    fn serialize_none(self) -> Result<(), FloatCheckError> { Ok(()) }
    fn serialize_unit(self) -> Result<(), FloatCheckError> { Ok(()) }
    fn serialize_unit_struct(self, _: &'static str) -> Result<(), FloatCheckError> { Ok(()) }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<(), FloatCheckError> {
        value.serialize(self)
    }

    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Result<(), FloatCheckError> {
        Ok(())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(self, _: &'static str, value: &T) -> Result<(), FloatCheckError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<(), FloatCheckError> {
        self.nested(format!(".{}", variant), value)
    }

    fn serialize_seq(self, _: Option<usize>) -> Result<Compound<'a>, FloatCheckError> {
        Ok(Compound { check: self, index: 0 })
    }

    fn serialize_tuple(self, _: usize) -> Result<Compound<'a>, FloatCheckError> {
        Ok(Compound { check: self, index: 0 })
    }

    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Compound<'a>, FloatCheckError> {
        Ok(Compound { check: self, index: 0 })
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        _: usize,
    ) -> Result<Compound<'a>, FloatCheckError> {
        self.path.push(format!(".{}", variant));
        Ok(Compound { check: self, index: 0 })
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Compound<'a>, FloatCheckError> {
        Ok(Compound { check: self, index: 0 })
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Compound<'a>, FloatCheckError> {
        Ok(Compound { check: self, index: 0 })
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        _: usize,
    ) -> Result<Compound<'a>, FloatCheckError> {
        self.path.push(format!(".{}", variant));
        Ok(Compound { check: self, index: 0 })
    }
}

impl ser::SerializeSeq for Compound<'_> {
    type Ok = ();
    type Error = FloatCheckError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FloatCheckError> {
        self.element(value)
    }

    fn end(self) -> Result<(), FloatCheckError> {
        Ok(())
    }
}

impl ser::SerializeTuple for Compound<'_> {
    type Ok = ();
    type Error = FloatCheckError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FloatCheckError> {
        self.element(value)
    }

    fn end(self) -> Result<(), FloatCheckError> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for Compound<'_> {
    type Ok = ();
    type Error = FloatCheckError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FloatCheckError> {
        self.element(value)
    }

    fn end(self) -> Result<(), FloatCheckError> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for Compound<'_> {
    type Ok = ();
    type Error = FloatCheckError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FloatCheckError> {
        self.element(value)
    }

    fn end(self) -> Result<(), FloatCheckError> {
        self.check.path.pop();
        Ok(())
    }
}

impl ser::SerializeMap for Compound<'_> {
    type Ok = ();
    type Error = FloatCheckError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), FloatCheckError> {
        self.check.nested(format!("{{key {}}}", self.index), key)
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FloatCheckError> {
        self.element(value)
    }

    fn end(self) -> Result<(), FloatCheckError> {
        Ok(())
    }
}

impl ser::SerializeStruct for Compound<'_> {
    type Ok = ();
    type Error = FloatCheckError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T) -> Result<(), FloatCheckError> {
        self.field(key, value)
    }

    fn end(self) -> Result<(), FloatCheckError> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for Compound<'_> {
    type Ok = ();
    type Error = FloatCheckError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T) -> Result<(), FloatCheckError> {
        self.field(key, value)
    }

    fn end(self) -> Result<(), FloatCheckError> {
        self.check.path.pop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Course {
        id: u64,
        title: String,
        tags: Vec<String>,
        rating: Option<f64>,
    }

    #[test]
    fn test_roundtrip_struct() {
        let layer = SerializationLayer::new();
        let course = Course {
            id: 7,
            title: "Rust".into(),
            tags: vec!["systems".into(), "async".into()],
            rating: Some(4.5),
        };

        let bytes = layer.encode(&course).unwrap();
        let back: Course = layer.decode(&bytes).unwrap();
        assert_eq!(back, course);
    }

    #[test]
    fn test_roundtrip_nested_collections() {
        let layer = SerializationLayer::new();
        let mut value: HashMap<String, Vec<BTreeMap<String, i64>>> = HashMap::new();
        value.insert("a".into(), vec![BTreeMap::from([("x".into(), 1), ("y".into(), -2)])]);
        value.insert("b".into(), vec![]);

        let bytes = layer.encode(&value).unwrap();
        let back: HashMap<String, Vec<BTreeMap<String, i64>>> = layer.decode(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_non_string_map_keys_rejected() {
        let layer = SerializationLayer::new();
        let mut value: HashMap<(u8, u8), u8> = HashMap::new();
        value.insert((1, 2), 3);

        assert!(matches!(layer.encode(&value), Err(SerializationError::Encode(_))));
    }

    #[test]
    fn test_depth_guard_on_encode() {
        let layer = SerializationLayer::new().with_max_depth(3);
        assert!(layer.encode(&json!([[[1]]])).is_ok());
        assert!(matches!(
            layer.encode(&json!([[[[1]]]])),
            Err(SerializationError::TooDeep { limit: 3 })
        ));
    }

    #[test]
    fn test_depth_guard_on_decode() {
        let layer = SerializationLayer::new().with_max_depth(2);
        let result: Result<Value, _> = layer.decode(b"[[[1]]]");
        assert!(matches!(result, Err(SerializationError::TooDeep { limit: 2 })));
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let layer = SerializationLayer::new();
        let result: Result<Course, _> = layer.decode(b"\xff\x00not json");
        assert!(matches!(result, Err(SerializationError::Decode(_))));
    }

    #[test]
    fn test_type_mismatch_is_a_decode_error() {
        let layer = SerializationLayer::new();
        let bytes = layer.encode(&json!({"id": "not a number"})).unwrap();
        let result: Result<Course, _> = layer.decode(&bytes);
        assert!(matches!(result, Err(SerializationError::Decode(_))));
    }

    #[test]
    fn test_non_finite_floats_rejected_not_nulled() {
        let layer = SerializationLayer::new();

        assert!(matches!(
            layer.encode(&f64::NAN),
            Err(SerializationError::NonFinite { ref path, .. }) if path == "$"
        ));
        assert!(matches!(
            layer.encode(&Some(f64::INFINITY)),
            Err(SerializationError::NonFinite { value, .. }) if value == f64::INFINITY
        ));
        assert!(matches!(
            layer.encode(&f32::NEG_INFINITY),
            Err(SerializationError::NonFinite { .. })
        ));
    }

    #[test]
    fn test_non_finite_float_path_points_at_field() {
        let layer = SerializationLayer::new();
        let course = Course {
            id: 1,
            title: "Rust".into(),
            tags: vec![],
            rating: Some(f64::NAN),
        };
        match layer.encode(&vec![course]) {
            Err(SerializationError::NonFinite { path, .. }) => assert_eq!(path, "$[0].rating"),
            other => panic!("expected NonFinite, got {:?}", other),
        }
    }

    #[test]
    fn test_non_finite_inside_maps_and_variants() {
        #[derive(Serialize)]
        enum Score {
            Raw(f64),
            Weighted { value: f64, weight: f64 },
        }

        let layer = SerializationLayer::new();
        let map = BTreeMap::from([("a".to_string(), 1.0), ("b".to_string(), f64::NAN)]);
        assert!(matches!(layer.encode(&map), Err(SerializationError::NonFinite { .. })));
        assert!(matches!(
            layer.encode(&Score::Raw(f64::INFINITY)),
            Err(SerializationError::NonFinite { ref path, .. }) if path == "$.Raw"
        ));
        assert!(matches!(
            layer.encode(&Score::Weighted { value: 1.0, weight: f64::NAN }),
            Err(SerializationError::NonFinite { ref path, .. }) if path == "$.Weighted.weight"
        ));
        assert!(layer.encode(&Score::Weighted { value: 1.0, weight: 0.5 }).is_ok());
    }

    #[test]
    fn test_finite_floats_roundtrip() {
        let layer = SerializationLayer::new();
        for v in [1.5, -0.25, 0.0, 1024.0] {
            let back: f64 = layer.decode(&layer.encode(&v).unwrap()).unwrap();
            assert_eq!(back, v);
        }
    }

    #[test]
    fn test_depth() {
        assert_eq!(depth(&json!(1)), 0);
        assert_eq!(depth(&json!([])), 0);
        assert_eq!(depth(&json!([1])), 1);
        assert_eq!(depth(&json!({"a": {"b": [1]}})), 3);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_large_payload_compressed_and_restored() {
        let layer = SerializationLayer::new().with_compression_threshold(Some(64));
        let value: Vec<String> = (0..200).map(|_| "repeat".to_string()).collect();

        let bytes = layer.encode(&value).unwrap();
        assert!(is_compressed(&bytes));
        let back: Vec<String> = layer.decode(&bytes).unwrap();
        assert_eq!(back, value);
    }
}

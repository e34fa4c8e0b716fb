// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deterministic cache-key construction.
//!
//! A key is `{prefix}:{identity}:{sha256-hex}` where the digest covers a
//! canonical JSON form of the call's arguments:
//!
//! ```text
//! {"args":[<positional, in order>],"kwargs":{<named, sorted by name>}}
//! ```
//!
//! Canonicalisation makes semantically equal calls hash identically:
//! - object keys are emitted in sorted order regardless of insertion order
//! - integral floats fold to integers (`1.0` and `1` are the same argument)
//! - `-0.0` folds to `0`
//! - arguments added with [`KeyArgs::unordered`] are sorted element-wise,
//!   which is how a `HashSet` (unstable iteration order) must be passed
//!
//! # Example
//!
//! ```
//! use query_cache::{KeyArgs, KeyCodec};
//! use serde_json::json;
//!
//! let codec = KeyCodec::new();
//! let a = codec.build("app", "course_search", &KeyArgs::new()
//!     .arg(&"rust").unwrap()
//!     .kwarg("filters", &json!({"level": 1, "lang": "en"})).unwrap()).unwrap();
//! let b = codec.build("app", "course_search", &KeyArgs::new()
//!     .arg(&"rust").unwrap()
//!     .kwarg("filters", &json!({"lang": "en", "level": 1.0})).unwrap()).unwrap();
//! assert_eq!(a, b);
//! assert!(a.starts_with("app:course_search:"));
//! ```

use serde::Serialize;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::serialization::{check_finite, DEFAULT_MAX_DEPTH};
use crate::RESERVED_KEY_PREFIX;

/// Largest integer exactly representable in an f64
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    #[error("argument {position} cannot be canonicalised: {reason}")]
    Unrepresentable { position: String, reason: String },

    #[error("argument {position} nests deeper than {limit} levels")]
    TooDeep { position: String, limit: usize },

    #[error("cache key identity must not be empty")]
    EmptyIdentity,

    #[error("key prefix '{0}' uses the reserved '__' namespace")]
    ReservedPrefix(String),
}

/// Arguments of one call, positional and named.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyArgs {
    positional: Vec<Value>,
    named: BTreeMap<String, Value>,
}

impl KeyArgs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument. Order is significant.
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, EncodingError> {
        let position = self.positional.len().to_string();
        self.positional.push(to_tree(&position, value)?);
        Ok(self)
    }

    /// Add a named argument. Order of named arguments is not significant.
    pub fn kwarg<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Result<Self, EncodingError> {
        let tree = to_tree(name, value)?;
        self.named.insert(name.to_string(), tree);
        Ok(self)
    }

    /// Append a positional argument whose element order is not significant
    /// (sets, bags). Elements are sorted by their canonical encoding.
    pub fn unordered<I, T>(mut self, items: I) -> Result<Self, EncodingError>
    where
        I: IntoIterator<Item = T>,
        T: Serialize,
    {
        let position = self.positional.len().to_string();
        let mut encoded: Vec<(String, Value)> = items
            .into_iter()
            .map(|item| {
                let tree = canonicalize(to_tree(&position, &item)?, &position, 0, DEFAULT_MAX_DEPTH)?;
                Ok((tree.to_string(), tree))
            })
            .collect::<Result<_, EncodingError>>()?;
        encoded.sort_by(|a, b| a.0.cmp(&b.0));
        self.positional
            .push(Value::Array(encoded.into_iter().map(|(_, v)| v).collect()));
        Ok(self)
    }

    /// Build from a single serialisable value used as the only positional argument.
    pub fn single<T: Serialize + ?Sized>(value: &T) -> Result<Self, EncodingError> {
        Self::new().arg(value)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }
}

/// `serde_json::to_value` turns NaN and infinities into `null`, which
/// would make `f(NaN)`, `f(inf)` and `f(None)` share a key, so floats are
/// checked on the way in.
fn to_tree<T: Serialize + ?Sized>(position: &str, value: &T) -> Result<Value, EncodingError> {
    check_finite(value).map_err(|e| EncodingError::Unrepresentable {
        position: position.to_string(),
        reason: e.to_string(),
    })?;
    serde_json::to_value(value).map_err(|e| EncodingError::Unrepresentable {
        position: position.to_string(),
        reason: e.to_string(),
    })
}

/// Rewrite a JSON tree into its canonical form.
fn canonicalize(value: Value, position: &str, level: usize, limit: usize) -> Result<Value, EncodingError> {
    if level > limit {
        return Err(EncodingError::TooDeep {
            position: position.to_string(),
            limit,
        });
    }

    Ok(match value {
        Value::Number(n) => Value::Number(canonical_number(n, position)?),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| canonicalize(v, position, level + 1, limit))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map.into_iter().collect();
            let mut out = Map::new();
            // Inserting in sorted order keeps the output sorted even when
            // serde_json's `preserve_order` feature is enabled somewhere
            for (k, v) in sorted {
                out.insert(k, canonicalize(v, position, level + 1, limit)?);
            }
            Value::Object(out)
        }
        other => other,
    })
}

fn canonical_number(n: Number, position: &str) -> Result<Number, EncodingError> {
    if n.is_i64() || n.is_u64() {
        return Ok(n);
    }
    let f = n.as_f64().ok_or_else(|| EncodingError::Unrepresentable {
        position: position.to_string(),
        reason: format!("number {} has no numeric value", n),
    })?;
    if !f.is_finite() {
        return Err(EncodingError::Unrepresentable {
            position: position.to_string(),
            reason: "non-finite float".to_string(),
        });
    }
    if f.fract() == 0.0 && f.abs() < MAX_SAFE_INTEGER {
        return Ok(Number::from(f as i64));
    }
    Number::from_f64(f).ok_or_else(|| EncodingError::Unrepresentable {
        position: position.to_string(),
        reason: "non-finite float".to_string(),
    })
}

/// Builds cache keys from a prefix, a function identity and call arguments.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    max_depth: usize,
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl KeyCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// `{prefix}:{identity}:{digest}`, or `{identity}:{digest}` for an
    /// empty prefix. The digest is always 64 hex characters.
    pub fn build(&self, prefix: &str, identity: &str, args: &KeyArgs) -> Result<String, EncodingError> {
        if identity.is_empty() {
            return Err(EncodingError::EmptyIdentity);
        }
        let head = if prefix.is_empty() { identity } else { prefix };
        if head.starts_with(RESERVED_KEY_PREFIX) {
            return Err(EncodingError::ReservedPrefix(head.to_string()));
        }

        let digest = self.digest(args)?;
        Ok(if prefix.is_empty() {
            format!("{}:{}", identity, digest)
        } else {
            format!("{}:{}:{}", prefix, identity, digest)
        })
    }

    /// Hex SHA-256 over the canonical form of `args`.
    pub fn digest(&self, args: &KeyArgs) -> Result<String, EncodingError> {
        let canonical = self.canonical_form(args)?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// The exact text that gets hashed.
    pub fn canonical_form(&self, args: &KeyArgs) -> Result<String, EncodingError> {
        let positional = args
            .positional
            .iter()
            .enumerate()
            .map(|(i, v)| canonicalize(v.clone(), &i.to_string(), 0, self.max_depth))
            .collect::<Result<Vec<_>, _>>()?;

        let mut named = Map::new();
        for (name, v) in &args.named {
            named.insert(name.clone(), canonicalize(v.clone(), name, 0, self.max_depth)?);
        }

        let mut doc = Map::new();
        doc.insert("args".to_string(), Value::Array(positional));
        doc.insert("kwargs".to_string(), Value::Object(named));
        Ok(Value::Object(doc).to_string())
    }
}

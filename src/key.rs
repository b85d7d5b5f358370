//! Deterministic cache keys derived from request values.
//!
//! A request is serialized with [`serde`] straight into a canonical string:
//! struct fields and map entries sorted by name, compact separators, strings
//! escaped as JSON. Two requests with equal field values therefore produce
//! equal keys no matter in which order their fields (or map entries) were
//! assigned. Absent optional fields encode as `null`, which keeps "missing"
//! distinct from every present value. Non-finite floats encode as the bare
//! tokens `inf`, `-inf` and `nan`, which no finite number or string can
//! produce.
//!
//! The operation name prefixes the key so that several operations can share
//! one [`CacheStore`](crate::cache::CacheStore) without colliding.
//!
//! Derivation fails with [`KeyDerivationError`] when the request cannot be
//! serialized deterministically, e.g. a map keyed by a tuple.
//!
//! # Unordered collections
//!
//! Sequences keep their iteration order, and serde reports a `HashSet` the
//! same way as a `Vec`. Equal `HashSet`s (and maps serialized as sequences of
//! pairs) may therefore iterate differently and yield different keys, so such
//! requests never hit the cache. Use `BTreeSet`/`BTreeMap` in request types,
//! or supply a [`KeyFn`] that orders the elements itself.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::ser::{self, Serializer};

use crate::error::KeyDerivationError;

const SEPARATOR: char = '\u{1f}';

/// Canonical cache key: operation namespace plus canonical request encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Build a key from an already-canonical string.
    ///
    /// Useful for custom [`KeyFn`]s; the caller is responsible for
    /// determinism.
    pub fn from_canonical(namespace: &str, canonical: &str) -> Self {
        let mut s = String::with_capacity(namespace.len() + canonical.len() + 1);
        s.push_str(namespace);
        s.push(SEPARATOR);
        s.push_str(canonical);
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The namespace (operation name) part of the key.
    pub fn namespace(&self) -> &str {
        self.0.split(SEPARATOR).next().unwrap_or_default()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The separator is unprintable; render it as a slash in logs.
        f.write_str(&self.0.replacen(SEPARATOR, "/", 1))
    }
}

/// Custom key derivation, used in place of [`derive_key`].
pub type KeyFn<Req> = Arc<dyn Fn(&Req) -> Result<CacheKey, KeyDerivationError> + Send + Sync>;

/// Derive the cache key for `request` under `namespace`.
///
/// Sequence order is significant. A request holding a `HashSet` can yield a
/// different key for every instance with the same contents; see the
/// [module docs](self#unordered-collections).
pub fn derive_key<R>(namespace: &str, request: &R) -> Result<CacheKey, KeyDerivationError>
where
    R: Serialize + ?Sized,
{
    let canonical = request
        .serialize(Canonical)
        .map_err(|e| KeyDerivationError::new(namespace, e.to_string()))?;
    Ok(CacheKey::from_canonical(namespace, &canonical))
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Unkeyable(String);

impl ser::Error for Unkeyable {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Unkeyable(msg.to_string())
    }
}

type Encoded = Result<String, Unkeyable>;

fn quoted(s: &str) -> Encoded {
    serde_json::to_string(s).map_err(|e| Unkeyable(e.to_string()))
}

fn float(finite: Option<String>, v: f64) -> Encoded {
    match finite {
        Some(encoded) => Ok(encoded),
        None if v.is_nan() => Ok("nan".to_owned()),
        None if v > 0.0 => Ok("inf".to_owned()),
        None => Ok("-inf".to_owned()),
    }
}

/// Map keys must encode as strings; integer keys are quoted like JSON does.
fn map_key<T: ?Sized + Serialize>(key: &T) -> Encoded {
    let encoded = key.serialize(Canonical)?;
    if encoded.starts_with('"') {
        return Ok(encoded);
    }
    let digits = encoded.strip_prefix('-').unwrap_or(encoded.as_str());
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(format!("\"{encoded}\""));
    }
    Err(Unkeyable(format!("map key {encoded} is not a string or integer")))
}

/// Serializer producing the canonical encoding of a value.
struct Canonical;

impl Serializer for Canonical {
    type Ok = String;
    type Error = Unkeyable;
    type SerializeSeq = SeqWriter;
    type SerializeTuple = SeqWriter;
    type SerializeTupleStruct = SeqWriter;
    type SerializeTupleVariant = SeqWriter;
    type SerializeMap = MapWriter;
    type SerializeStruct = MapWriter;
    type SerializeStructVariant = MapWriter;

    fn serialize_bool(self, v: bool) -> Encoded {
        Ok(v.to_string())
    }

    fn serialize_i8(self, v: i8) -> Encoded {
        Ok(v.to_string())
    }

    fn serialize_i16(self, v: i16) -> Encoded {
        Ok(v.to_string())
    }

    fn serialize_i32(self, v: i32) -> Encoded {
        Ok(v.to_string())
    }

    fn serialize_i64(self, v: i64) -> Encoded {
        Ok(v.to_string())
    }

    fn serialize_i128(self, v: i128) -> Encoded {
        Ok(v.to_string())
    }

    fn serialize_u8(self, v: u8) -> Encoded {
        Ok(v.to_string())
    }

    fn serialize_u16(self, v: u16) -> Encoded {
        Ok(v.to_string())
    }

    fn serialize_u32(self, v: u32) -> Encoded {
        Ok(v.to_string())
    }

    fn serialize_u64(self, v: u64) -> Encoded {
        Ok(v.to_string())
    }

    fn serialize_u128(self, v: u128) -> Encoded {
        Ok(v.to_string())
    }

    fn serialize_f32(self, v: f32) -> Encoded {
        let finite = v.is_finite().then(|| serde_json::to_string(&v)).transpose();
        float(finite.map_err(|e| Unkeyable(e.to_string()))?, f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> Encoded {
        let finite = v.is_finite().then(|| serde_json::to_string(&v)).transpose();
        float(finite.map_err(|e| Unkeyable(e.to_string()))?, v)
    }

    fn serialize_char(self, v: char) -> Encoded {
        quoted(v.encode_utf8(&mut [0; 4]))
    }

    fn serialize_str(self, v: &str) -> Encoded {
        quoted(v)
    }

    fn serialize_bytes(self, v: &[u8]) -> Encoded {
        let items: Vec<String> = v.iter().map(u8::to_string).collect();
        Ok(format!("[{}]", items.join(",")))
    }

    fn serialize_none(self) -> Encoded {
        Ok("null".to_owned())
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Encoded {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Encoded {
        Ok("null".to_owned())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Encoded {
        Ok("null".to_owned())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Encoded {
        quoted(variant)
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Encoded {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> Encoded {
        Ok(format!("{{{}:{}}}", quoted(variant)?, value.serialize(Canonical)?))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<SeqWriter, Unkeyable> {
        Ok(SeqWriter::new(None))
    }

    fn serialize_tuple(self, _len: usize) -> Result<SeqWriter, Unkeyable> {
        Ok(SeqWriter::new(None))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<SeqWriter, Unkeyable> {
        Ok(SeqWriter::new(None))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<SeqWriter, Unkeyable> {
        Ok(SeqWriter::new(Some(variant)))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapWriter, Unkeyable> {
        Ok(MapWriter::new(None))
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<MapWriter, Unkeyable> {
        Ok(MapWriter::new(None))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<MapWriter, Unkeyable> {
        Ok(MapWriter::new(Some(variant)))
    }
}

/// Wraps an enum variant's payload as `{"Variant":payload}`.
fn tagged(variant: Option<&'static str>, body: String) -> Encoded {
    match variant {
        Some(variant) => Ok(format!("{{{}:{body}}}", quoted(variant)?)),
        None => Ok(body),
    }
}

struct SeqWriter {
    variant: Option<&'static str>,
    items: Vec<String>,
}

impl SeqWriter {
    fn new(variant: Option<&'static str>) -> Self {
        Self {
            variant,
            items: Vec::new(),
        }
    }

    fn push<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Unkeyable> {
        self.items.push(value.serialize(Canonical)?);
        Ok(())
    }

    fn finish(self) -> Encoded {
        tagged(self.variant, format!("[{}]", self.items.join(",")))
    }
}

impl ser::SerializeSeq for SeqWriter {
    type Ok = String;
    type Error = Unkeyable;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Unkeyable> {
        self.push(value)
    }

    fn end(self) -> Encoded {
        self.finish()
    }
}

impl ser::SerializeTuple for SeqWriter {
    type Ok = String;
    type Error = Unkeyable;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Unkeyable> {
        self.push(value)
    }

    fn end(self) -> Encoded {
        self.finish()
    }
}

impl ser::SerializeTupleStruct for SeqWriter {
    type Ok = String;
    type Error = Unkeyable;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Unkeyable> {
        self.push(value)
    }

    fn end(self) -> Encoded {
        self.finish()
    }
}

impl ser::SerializeTupleVariant for SeqWriter {
    type Ok = String;
    type Error = Unkeyable;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Unkeyable> {
        self.push(value)
    }

    fn end(self) -> Encoded {
        self.finish()
    }
}

struct MapWriter {
    variant: Option<&'static str>,
    entries: Vec<(String, String)>,
    key: Option<String>,
}

impl MapWriter {
    fn new(variant: Option<&'static str>) -> Self {
        Self {
            variant,
            entries: Vec::new(),
            key: None,
        }
    }

    fn push<T: ?Sized + Serialize>(&mut self, key: String, value: &T) -> Result<(), Unkeyable> {
        self.entries.push((key, value.serialize(Canonical)?));
        Ok(())
    }

    fn finish(mut self) -> Encoded {
        self.entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        let members: Vec<String> = self
            .entries
            .into_iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect();
        tagged(self.variant, format!("{{{}}}", members.join(",")))
    }
}

impl ser::SerializeMap for MapWriter {
    type Ok = String;
    type Error = Unkeyable;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), Unkeyable> {
        self.key = Some(map_key(key)?);
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Unkeyable> {
        let key = self
            .key
            .take()
            .ok_or_else(|| Unkeyable("map value without a key".to_owned()))?;
        self.push(key, value)
    }

    fn end(self) -> Encoded {
        self.finish()
    }
}

impl ser::SerializeStruct for MapWriter {
    type Ok = String;
    type Error = Unkeyable;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Unkeyable> {
        self.push(quoted(key)?, value)
    }

    fn end(self) -> Encoded {
        self.finish()
    }
}

impl ser::SerializeStructVariant for MapWriter {
    type Ok = String;
    type Error = Unkeyable;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Unkeyable> {
        self.push(quoted(key)?, value)
    }

    fn end(self) -> Encoded {
        self.finish()
    }
}

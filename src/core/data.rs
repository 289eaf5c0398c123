//! # Data Collections
//!
//! Application payloads travel as a [`DataCollection`]: either a string-keyed map
//! or an ordered array of [`DataValue`]s. The transport never interprets the
//! contents, it only moves them between bytes and values.
//!
//! ## Formats
//! - **Zero**: compact binary layout (bincode), the default
//! - **MsgPack**: MessagePack, for clients that already speak it
//!
//! The header byte of each frame says which format was used. The decoder looks
//! the format up in a fixed table of (de)serializers rather than branching on
//! the type at every call site.
//!
//! Payloads come straight off the network, so nested maps and arrays are
//! limited to [`MAX_NESTING_DEPTH`] levels. Deeper input is a
//! `DeserializeError`, not a stack overflow.
//!
//! ## Usage
//! ```rust
//! use gamewire::core::data::{DataCollection, DataType, DataValue};
//!
//! let mut map = DataCollection::new_map();
//! map.put("hp", DataValue::Int(42));
//! let bytes = map.serialize(DataType::MsgPack).unwrap();
//! let back = DataCollection::deserialize(DataType::MsgPack, &bytes).unwrap();
//! assert_eq!(back, map);
//! ```

use crate::error::{ProtocolError, Result};
use bincode::Options;
use serde::de::{self, DeserializeSeed, EnumAccess, MapAccess, SeqAccess, VariantAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Deepest map/array nesting accepted from a peer.
pub const MAX_NESTING_DEPTH: usize = 64;

// Caps speculative allocation from a claimed element count
const MAX_PREALLOCATED_ITEMS: usize = 4096;

/// Supported serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Binary compact format (default)
    #[default]
    Zero,
    /// MessagePack
    MsgPack,
}

impl DataType {
    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            DataType::Zero => "Zero",
            DataType::MsgPack => "MessagePack",
        }
    }

    #[inline]
    fn index(self) -> usize {
        match self {
            DataType::Zero => 0,
            DataType::MsgPack => 1,
        }
    }
}

/// A single value inside a collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DataValue {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Map(BTreeMap<String, DataValue>),
    Array(Vec<DataValue>),
}

impl DataValue {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            DataValue::Int(v) => Some(*v),
            DataValue::Long(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::String(s) => Some(s),
            _ => None,
        }
    }
}

const VALUE_VARIANTS: &[&str] = &[
    "Null", "Bool", "Int", "Long", "Double", "String", "Bytes", "Map", "Array",
];

#[derive(Deserialize)]
#[serde(variant_identifier)]
enum ValueTag {
    Null,
    Bool,
    Int,
    Long,
    Double,
    String,
    Bytes,
    Map,
    Array,
}

/// Deserializes a [`DataValue`] found `depth` collections deep.
struct ValueSeed {
    depth: usize,
}

impl<'de> DeserializeSeed<'de> for ValueSeed {
    type Value = DataValue;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<DataValue, D::Error> {
        deserializer.deserialize_enum("DataValue", VALUE_VARIANTS, self)
    }
}

impl<'de> Visitor<'de> for ValueSeed {
    type Value = DataValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a data value")
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> std::result::Result<DataValue, A::Error> {
        let (tag, variant) = data.variant::<ValueTag>()?;
        match tag {
            ValueTag::Null => variant.unit_variant().map(|()| DataValue::Null),
            ValueTag::Bool => variant.newtype_variant().map(DataValue::Bool),
            ValueTag::Int => variant.newtype_variant().map(DataValue::Int),
            ValueTag::Long => variant.newtype_variant().map(DataValue::Long),
            ValueTag::Double => variant.newtype_variant().map(DataValue::Double),
            ValueTag::String => variant.newtype_variant().map(DataValue::String),
            ValueTag::Bytes => variant.newtype_variant().map(DataValue::Bytes),
            ValueTag::Map => variant
                .newtype_variant_seed(MapSeed { depth: nested::<A::Error>(self.depth)? })
                .map(DataValue::Map),
            ValueTag::Array => variant
                .newtype_variant_seed(ArraySeed { depth: nested::<A::Error>(self.depth)? })
                .map(DataValue::Array),
        }
    }
}

fn nested<E: de::Error>(depth: usize) -> std::result::Result<usize, E> {
    let depth = depth + 1;
    if depth > MAX_NESTING_DEPTH {
        return Err(E::custom(format!("nesting deeper than {MAX_NESTING_DEPTH} levels")));
    }
    Ok(depth)
}

struct MapSeed {
    depth: usize,
}

impl<'de> DeserializeSeed<'de> for MapSeed {
    type Value = BTreeMap<String, DataValue>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for MapSeed {
    type Value = BTreeMap<String, DataValue>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of data values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
        let mut map = BTreeMap::new();
        while let Some(key) = access.next_key::<String>()? {
            let value = access.next_value_seed(ValueSeed { depth: self.depth })?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

struct ArraySeed {
    depth: usize,
}

impl<'de> DeserializeSeed<'de> for ArraySeed {
    type Value = Vec<DataValue>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for ArraySeed {
    type Value = Vec<DataValue>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an array of data values")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
        let mut items = Vec::with_capacity(access.size_hint().unwrap_or(0).min(MAX_PREALLOCATED_ITEMS));
        while let Some(item) = access.next_element_seed(ValueSeed { depth: self.depth })? {
            items.push(item);
        }
        Ok(items)
    }
}

impl<'de> Deserialize<'de> for DataValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        ValueSeed { depth: 0 }.deserialize(deserializer)
    }
}

/// Top-level payload of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataCollection {
    Map(BTreeMap<String, DataValue>),
    Array(Vec<DataValue>),
}

type SerializeFn = fn(&DataCollection) -> Result<Vec<u8>>;
type DeserializeFn = fn(&[u8]) -> Result<DataCollection>;

/// Indexed by [`DataType::index`].
const SERIALIZERS: [SerializeFn; 2] = [serialize_zero, serialize_msgpack];
const DESERIALIZERS: [DeserializeFn; 2] = [deserialize_zero, deserialize_msgpack];

// Same layout as `bincode::serialize`
fn zero_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

fn serialize_zero(collection: &DataCollection) -> Result<Vec<u8>> {
    zero_options()
        .serialize(collection)
        .map_err(|e| ProtocolError::SerializeError(e.to_string()))
}

fn deserialize_zero(data: &[u8]) -> Result<DataCollection> {
    // A claimed length can never exceed the bytes actually received
    zero_options()
        .with_limit(data.len() as u64)
        .deserialize(data)
        .map_err(|e| ProtocolError::DeserializeError(e.to_string()))
}

fn serialize_msgpack(collection: &DataCollection) -> Result<Vec<u8>> {
    rmp_serde::to_vec(collection).map_err(|e| ProtocolError::SerializeError(e.to_string()))
}

fn deserialize_msgpack(data: &[u8]) -> Result<DataCollection> {
    rmp_serde::from_slice(data).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
}

impl DataCollection {
    pub fn new_map() -> Self {
        DataCollection::Map(BTreeMap::new())
    }

    pub fn new_array() -> Self {
        DataCollection::Array(Vec::new())
    }

    /// Serialize with the given format.
    pub fn serialize(&self, data_type: DataType) -> Result<Vec<u8>> {
        SERIALIZERS[data_type.index()](self)
    }

    /// Deserialize bytes produced by [`DataCollection::serialize`] with the same format.
    pub fn deserialize(data_type: DataType, data: &[u8]) -> Result<Self> {
        DESERIALIZERS[data_type.index()](data)
    }

    /// Insert into a map collection. Arrays are left untouched.
    pub fn put(&mut self, key: impl Into<String>, value: DataValue) -> &mut Self {
        if let DataCollection::Map(map) = self {
            map.insert(key.into(), value);
        }
        self
    }

    /// Append to an array collection. Maps are left untouched.
    pub fn push(&mut self, value: DataValue) -> &mut Self {
        if let DataCollection::Array(items) = self {
            items.push(value);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&DataValue> {
        match self {
            DataCollection::Map(map) => map.get(key),
            DataCollection::Array(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DataCollection::Map(map) => map.len(),
            DataCollection::Array(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DataCollection {
        let mut inner = BTreeMap::new();
        inner.insert("x".to_string(), DataValue::Double(1.5));
        let mut map = DataCollection::new_map();
        map.put("name", DataValue::String("room-1".into()))
            .put("players", DataValue::Array(vec![DataValue::Int(1), DataValue::Int(2)]))
            .put("pos", DataValue::Map(inner))
            .put("blob", DataValue::Bytes(vec![0, 1, 2]))
            .put("none", DataValue::Null);
        map
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_zero_format() {
        let data = sample();
        let bytes = data.serialize(DataType::Zero).expect("serialize");
        let recovered = DataCollection::deserialize(DataType::Zero, &bytes).expect("deserialize");
        assert_eq!(data, recovered);
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_msgpack_format() {
        let data = sample();
        let bytes = data.serialize(DataType::MsgPack).expect("serialize");
        let recovered =
            DataCollection::deserialize(DataType::MsgPack, &bytes).expect("deserialize");
        assert_eq!(data, recovered);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let result = DataCollection::deserialize(DataType::Zero, &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(ProtocolError::DeserializeError(_))));
    }

    #[test]
    fn test_put_on_array_is_ignored() {
        let mut array = DataCollection::new_array();
        array.put("k", DataValue::Null).push(DataValue::Bool(true));
        assert_eq!(array.len(), 1);
        assert!(array.get("k").is_none());
    }

    #[test]
    fn test_default_format() {
        assert_eq!(DataType::default(), DataType::Zero);
        assert_eq!(DataType::MsgPack.name(), "MessagePack");
    }

    fn nested_arrays(depth: usize) -> DataCollection {
        let mut value = DataValue::Null;
        for _ in 0..depth {
            value = DataValue::Array(vec![value]);
        }
        DataCollection::Array(vec![value])
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_nesting_up_to_the_limit_is_accepted() {
        let data = nested_arrays(MAX_NESTING_DEPTH);
        for data_type in [DataType::Zero, DataType::MsgPack] {
            let bytes = data.serialize(data_type).expect("serialize");
            let recovered = DataCollection::deserialize(data_type, &bytes).expect("deserialize");
            assert_eq!(recovered, data);
        }
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_nesting_past_the_limit_is_rejected() {
        let data = nested_arrays(MAX_NESTING_DEPTH + 1);
        for data_type in [DataType::Zero, DataType::MsgPack] {
            let bytes = data.serialize(data_type).expect("serialize");
            let result = DataCollection::deserialize(data_type, &bytes);
            assert!(matches!(result, Err(ProtocolError::DeserializeError(_))), "{data_type:?}");
        }
    }

    #[test]
    fn test_hostile_nesting_is_an_error_not_a_crash() {
        // DataCollection::Array, one element
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
        // 100k levels of DataValue::Array holding one element
        for _ in 0..100_000 {
            bytes.extend_from_slice(&8u32.to_le_bytes());
            bytes.extend_from_slice(&1u64.to_le_bytes());
        }
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let result = DataCollection::deserialize(DataType::Zero, &bytes);
        assert!(matches!(result, Err(ProtocolError::DeserializeError(_))));
    }

    #[test]
    fn test_claimed_length_beyond_input_is_rejected() {
        // DataCollection::Array claiming u64::MAX elements
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());

        let result = DataCollection::deserialize(DataType::Zero, &bytes);
        assert!(matches!(result, Err(ProtocolError::DeserializeError(_))));
    }
}

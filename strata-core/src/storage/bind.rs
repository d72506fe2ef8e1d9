use std::sync::Arc;

use serde::de::{
    self, DeserializeOwned, DeserializeSeed, Deserializer, EnumAccess, IntoDeserializer, MapAccess,
    SeqAccess, Unexpected, VariantAccess, Visitor,
};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::storage::{ConfigPath, MultiStorage, Scalar, Segment, Storage, TreeStorage};

/// `serde::Deserializer` over any [`Storage`].
///
/// Typed structs are driven by their serde field list: each field is looked up
/// with [`Storage::child`] and skipped when absent, so a merged storage overlays
/// fields instead of replacing whole records. Text leaves are coerced into the
/// requested scalar type, which is what flat sources need.
pub struct StorageDeserializer {
    storage: Arc<dyn Storage>,
    path: ConfigPath,
}

impl StorageDeserializer {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            path: ConfigPath::root(),
        }
    }

    fn nested(&self, storage: Arc<dyn Storage>, segment: Segment) -> Self {
        Self {
            storage,
            path: self.path.child(segment),
        }
    }

    fn describe(&self) -> &'static str {
        if !self.storage.is_present() {
            "nothing"
        } else if self.storage.keys().is_some() {
            "a mapping"
        } else if self.storage.scalar().is_some() {
            "a scalar"
        } else {
            "a sequence"
        }
    }

    fn scalar(&self, expected: &str) -> Result<Scalar> {
        self.storage.scalar().ok_or_else(|| {
            Error::Bind(format!("expected {expected}, found {}", self.describe()))
        })
    }

    fn is_null(&self) -> bool {
        !self.storage.is_present() || matches!(self.storage.scalar(), Some(Scalar::Null))
    }
}

impl<'s> dyn Storage + 's {
    /// Binds this view into a fresh `T`, then runs the storage's validation
    /// hook against the bound value.
    pub fn convert<T>(&self) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let value = T::deserialize(StorageDeserializer::new(self.sub("")))?;
        self.check_bound(&value)?;
        Ok(value)
    }

    /// Overlays this view onto `dest`: fields the storage does not supply keep
    /// their current value. `dest` is only replaced when binding and validation
    /// both succeed.
    pub fn convert_into<T>(&self, dest: &mut T) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        let current = serde_json::to_value(&*dest)
            .map_err(|err| Error::Bind(format!("failed to snapshot destination: {err}")))?;
        let base = TreeStorage::new(current).into_shared();
        let layered = MultiStorage::new(vec![base, self.sub("")])?;
        let value = T::deserialize(StorageDeserializer::new(layered.into_shared()))?;
        self.check_bound(&value)?;
        *dest = value;
        Ok(())
    }

    fn check_bound<T: Serialize>(&self, value: &T) -> Result<()> {
        let bound = serde_json::to_value(value)
            .map_err(|err| Error::Bind(format!("failed to serialize bound value: {err}")))?;
        self.validate(&bound)
    }
}

/// Prefixes a bind error with the path it happened at, once, at the innermost
/// level that knows it.
fn located(err: Error, path: &ConfigPath) -> Error {
    match err {
        Error::Bind(message) if !message.starts_with('`') && !path.is_root() => {
            Error::Bind(format!("`{path}`: {message}"))
        }
        other => other,
    }
}

fn unexpected(scalar: &Scalar) -> Unexpected<'_> {
    match scalar {
        Scalar::Null => Unexpected::Unit,
        Scalar::Bool(flag) => Unexpected::Bool(*flag),
        Scalar::Integer(signed) => Unexpected::Signed(*signed),
        Scalar::Unsigned(unsigned) => Unexpected::Unsigned(*unsigned),
        Scalar::Float(float) => Unexpected::Float(*float),
        Scalar::Text(text) => Unexpected::Str(text),
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn resolve_variant(name: &str, variants: &'static [&'static str]) -> String {
    variants
        .iter()
        .find(|variant| variant.eq_ignore_ascii_case(name.trim()))
        .map(|variant| (*variant).to_owned())
        .unwrap_or_else(|| name.to_owned())
}

macro_rules! deserialize_integer {
    ($method:ident) => {
        fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
            let scalar = self.scalar("an integer")?;
            match scalar {
                Scalar::Integer(signed) => visitor.visit_i64(signed),
                Scalar::Unsigned(unsigned) => visitor.visit_u64(unsigned),
                Scalar::Float(float) if float.fract() == 0.0 => visitor.visit_i64(float as i64),
                Scalar::Text(ref text) => {
                    let trimmed = text.trim();
                    if let Ok(signed) = trimmed.parse::<i64>() {
                        visitor.visit_i64(signed)
                    } else if let Ok(unsigned) = trimmed.parse::<u64>() {
                        visitor.visit_u64(unsigned)
                    } else {
                        Err(de::Error::invalid_type(unexpected(&scalar), &visitor))
                    }
                }
                ref other => Err(de::Error::invalid_type(unexpected(other), &visitor)),
            }
        }
    };
}

macro_rules! deserialize_float {
    ($method:ident) => {
        fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
            let scalar = self.scalar("a number")?;
            match scalar {
                Scalar::Integer(signed) => visitor.visit_i64(signed),
                Scalar::Unsigned(unsigned) => visitor.visit_u64(unsigned),
                Scalar::Float(float) => visitor.visit_f64(float),
                Scalar::Text(ref text) => match text.trim().parse::<f64>() {
                    Ok(float) => visitor.visit_f64(float),
                    Err(_) => Err(de::Error::invalid_type(unexpected(&scalar), &visitor)),
                },
                ref other => Err(de::Error::invalid_type(unexpected(other), &visitor)),
            }
        }
    };
}

impl<'de> Deserializer<'de> for StorageDeserializer {
    type Error = Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.storage.to_value() {
            Some(value) => value
                .deserialize_any(visitor)
                .map_err(|err| Error::Bind(err.to_string())),
            None => visitor.visit_unit(),
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        let scalar = self.scalar("a boolean")?;
        match scalar {
            Scalar::Bool(flag) => visitor.visit_bool(flag),
            Scalar::Text(ref text) => match parse_bool(text) {
                Some(flag) => visitor.visit_bool(flag),
                None => Err(de::Error::invalid_type(unexpected(&scalar), &visitor)),
            },
            ref other => Err(de::Error::invalid_type(unexpected(other), &visitor)),
        }
    }

    deserialize_integer!(deserialize_i8);
    deserialize_integer!(deserialize_i16);
    deserialize_integer!(deserialize_i32);
    deserialize_integer!(deserialize_i64);
    deserialize_integer!(deserialize_u8);
    deserialize_integer!(deserialize_u16);
    deserialize_integer!(deserialize_u32);
    deserialize_integer!(deserialize_u64);
    deserialize_float!(deserialize_f32);
    deserialize_float!(deserialize_f64);

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.deserialize_string(visitor)
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.deserialize_string(visitor)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.scalar("a string")? {
            Scalar::Text(text) => visitor.visit_string(text),
            Scalar::Bool(flag) => visitor.visit_string(flag.to_string()),
            Scalar::Integer(signed) => visitor.visit_string(signed.to_string()),
            Scalar::Unsigned(unsigned) => visitor.visit_string(unsigned.to_string()),
            Scalar::Float(float) => visitor.visit_string(float.to_string()),
            Scalar::Null => Err(de::Error::invalid_type(Unexpected::Unit, &visitor)),
        }
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.deserialize_byte_buf(visitor)
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.storage.scalar() {
            Some(Scalar::Text(text)) => visitor.visit_byte_buf(text.into_bytes()),
            _ => self.deserialize_seq(visitor),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        if self.is_null() {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        if let Some(elements) = self.storage.elements() {
            return visitor.visit_seq(SeqAccessor::new(self, elements));
        }
        if self.is_null() {
            return visitor.visit_seq(SeqAccessor::new(self, Vec::new()));
        }
        Err(Error::Bind(format!(
            "expected a sequence, found {}",
            self.describe()
        )))
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        if let Some(keys) = self.storage.keys() {
            return visitor.visit_map(MapAccessor::new(self, keys));
        }
        if self.is_null() {
            return visitor.visit_map(MapAccessor::new(self, Vec::new()));
        }
        Err(Error::Bind(format!(
            "expected a mapping, found {}",
            self.describe()
        )))
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        if !self.is_null() && self.storage.keys().is_none() {
            return Err(Error::Bind(format!(
                "expected a mapping for {name}, found {}",
                self.describe()
            )));
        }

        let present = fields
            .iter()
            .filter(|field| self.storage.child(Segment::Key((**field).to_owned())).is_present())
            .map(|field| (*field).to_owned())
            .collect();
        visitor.visit_map(MapAccessor::new(self, present))
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        if let Some(Scalar::Text(text)) = self.storage.scalar() {
            let variant = resolve_variant(&text, variants);
            return visitor.visit_enum(IntoDeserializer::<'de, Error>::into_deserializer(variant));
        }

        if let Some(keys) = self.storage.keys() {
            if let [key] = keys.as_slice() {
                let content = self.storage.child(Segment::Key(key.clone()));
                return visitor.visit_enum(EnumAccessor {
                    variant: resolve_variant(key, variants),
                    content: self.nested(content, Segment::Key(key.clone())),
                });
            }
        }

        Err(Error::Bind(format!(
            "expected {name} as a variant name or a single-key mapping, found {}",
            self.describe()
        )))
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.deserialize_string(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_unit()
    }
}

struct SeqAccessor {
    parent: StorageDeserializer,
    items: std::iter::Enumerate<std::vec::IntoIter<Arc<dyn Storage>>>,
    remaining: usize,
}

impl SeqAccessor {
    fn new(parent: StorageDeserializer, items: Vec<Arc<dyn Storage>>) -> Self {
        Self {
            parent,
            remaining: items.len(),
            items: items.into_iter().enumerate(),
        }
    }
}

impl<'de> SeqAccess<'de> for SeqAccessor {
    type Error = Error;

    fn next_element_seed<T: DeserializeSeed<'de>>(&mut self, seed: T) -> Result<Option<T::Value>> {
        let Some((index, item)) = self.items.next() else {
            return Ok(None);
        };
        self.remaining -= 1;
        let nested = self.parent.nested(item, Segment::Index(index));
        let path = nested.path.clone();
        seed.deserialize(nested)
            .map(Some)
            .map_err(|err| located(err, &path))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.remaining)
    }
}

struct MapAccessor {
    parent: StorageDeserializer,
    keys: std::vec::IntoIter<String>,
    current: Option<String>,
}

impl MapAccessor {
    fn new(parent: StorageDeserializer, keys: Vec<String>) -> Self {
        Self {
            parent,
            keys: keys.into_iter(),
            current: None,
        }
    }
}

impl<'de> MapAccess<'de> for MapAccessor {
    type Error = Error;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>> {
        let Some(key) = self.keys.next() else {
            return Ok(None);
        };
        let value = seed.deserialize(KeyDeserializer(key.clone()))?;
        self.current = Some(key);
        Ok(Some(value))
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value> {
        let key = self
            .current
            .take()
            .ok_or_else(|| Error::Bind("mapping value requested before its key".to_owned()))?;
        let child = self.parent.storage.child(Segment::Key(key.clone()));
        let nested = self.parent.nested(child, Segment::Key(key));
        let path = nested.path.clone();
        seed.deserialize(nested).map_err(|err| located(err, &path))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.keys.len())
    }
}

struct EnumAccessor {
    variant: String,
    content: StorageDeserializer,
}

impl<'de> EnumAccess<'de> for EnumAccessor {
    type Error = Error;
    type Variant = VariantAccessor;

    fn variant_seed<V: DeserializeSeed<'de>>(self, seed: V) -> Result<(V::Value, Self::Variant)> {
        let variant =
            seed.deserialize(IntoDeserializer::<'de, Error>::into_deserializer(self.variant))?;
        Ok((
            variant,
            VariantAccessor {
                content: self.content,
            },
        ))
    }
}

struct VariantAccessor {
    content: StorageDeserializer,
}

impl<'de> VariantAccess<'de> for VariantAccessor {
    type Error = Error;

    fn unit_variant(self) -> Result<()> {
        Ok(())
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> Result<T::Value> {
        seed.deserialize(self.content)
    }

    fn tuple_variant<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value> {
        self.content.deserialize_seq(visitor)
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        self.content.deserialize_struct("variant", fields, visitor)
    }
}

/// Mapping keys are strings in every storage; numeric and boolean key types
/// are parsed from them.
struct KeyDeserializer(String);

macro_rules! deserialize_key_number {
    ($method:ident, $ty:ty, $visit:ident) => {
        fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
            match self.0.trim().parse::<$ty>() {
                Ok(number) => visitor.$visit(number),
                Err(_) => visitor.visit_string(self.0),
            }
        }
    };
}

impl<'de> Deserializer<'de> for KeyDeserializer {
    type Error = Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_string(self.0)
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match parse_bool(&self.0) {
            Some(flag) => visitor.visit_bool(flag),
            None => visitor.visit_string(self.0),
        }
    }

    deserialize_key_number!(deserialize_i8, i64, visit_i64);
    deserialize_key_number!(deserialize_i16, i64, visit_i64);
    deserialize_key_number!(deserialize_i32, i64, visit_i64);
    deserialize_key_number!(deserialize_i64, i64, visit_i64);
    deserialize_key_number!(deserialize_u8, u64, visit_u64);
    deserialize_key_number!(deserialize_u16, u64, visit_u64);
    deserialize_key_number!(deserialize_u32, u64, visit_u64);
    deserialize_key_number!(deserialize_u64, u64, visit_u64);
    deserialize_key_number!(deserialize_f32, f64, visit_f64);
    deserialize_key_number!(deserialize_f64, f64, visit_f64);

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        let variant = resolve_variant(&self.0, variants);
        visitor.visit_enum(IntoDeserializer::<'de, Error>::into_deserializer(variant))
    }

    serde::forward_to_deserialize_any! {
        char str string bytes byte_buf option unit unit_struct seq tuple
        tuple_struct map struct identifier ignored_any
    }
}

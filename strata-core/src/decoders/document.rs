use std::sync::Arc;

use serde_json::{Map, Value};

use crate::decoders::{utf8, Decoder};
use crate::error::{Error, Result};
use crate::storage::{Storage, TreeStorage};

/// Whitespace-only input decodes to an absent tree rather than an error, so an
/// empty file behaves like a source that contributes nothing.
fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

fn document(storage: &dyn Storage) -> Value {
    storage
        .to_value()
        .unwrap_or_else(|| Value::Object(Map::new()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    fn name(&self) -> &str {
        "json"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Arc<dyn Storage>> {
        let text = utf8(bytes, "json")?;
        if is_blank(text) {
            return Ok(TreeStorage::empty().into_shared());
        }
        let value = serde_json::from_str::<Value>(text)
            .map_err(|err| Error::Decode(format!("failed parsing json: {err}")))?;
        Ok(TreeStorage::new(value).into_shared())
    }

    fn encode(&self, storage: &dyn Storage) -> Result<Vec<u8>> {
        let mut rendered = serde_json::to_vec_pretty(&document(storage))
            .map_err(|err| Error::Decode(format!("failed encoding json: {err}")))?;
        rendered.push(b'\n');
        Ok(rendered)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YamlDecoder;

impl Decoder for YamlDecoder {
    fn name(&self) -> &str {
        "yaml"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Arc<dyn Storage>> {
        let text = utf8(bytes, "yaml")?;
        if is_blank(text) {
            return Ok(TreeStorage::empty().into_shared());
        }
        let yaml_value = serde_yaml::from_str::<serde_yaml::Value>(text)
            .map_err(|err| Error::Decode(format!("failed parsing yaml: {err}")))?;
        let value = serde_json::to_value(yaml_value)
            .map_err(|err| Error::Decode(format!("failed converting yaml to json: {err}")))?;
        Ok(TreeStorage::new(value).into_shared())
    }

    fn encode(&self, storage: &dyn Storage) -> Result<Vec<u8>> {
        serde_yaml::to_string(&document(storage))
            .map(String::into_bytes)
            .map_err(|err| Error::Decode(format!("failed encoding yaml: {err}")))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TomlDecoder;

impl Decoder for TomlDecoder {
    fn name(&self) -> &str {
        "toml"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Arc<dyn Storage>> {
        let text = utf8(bytes, "toml")?;
        if is_blank(text) {
            return Ok(TreeStorage::empty().into_shared());
        }
        let table = text
            .parse::<toml::Table>()
            .map_err(|err| Error::Decode(format!("failed parsing toml: {err}")))?;
        Ok(TreeStorage::new(toml_to_json(toml::Value::Table(table))).into_shared())
    }

    fn encode(&self, storage: &dyn Storage) -> Result<Vec<u8>> {
        let mut value = document(storage);
        if !value.is_object() {
            return Err(Error::Decode(
                "toml documents must have a table at the root".to_owned(),
            ));
        }
        drop_nulls(&mut value);
        toml::to_string(&value)
            .map(String::into_bytes)
            .map_err(|err| Error::Decode(format!("failed encoding toml: {err}")))
    }
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(text) => Value::String(text),
        toml::Value::Integer(number) => Value::from(number),
        toml::Value::Float(number) => Value::from(number),
        toml::Value::Boolean(flag) => Value::Bool(flag),
        toml::Value::Datetime(datetime) => Value::String(datetime.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(key, item)| (key, toml_to_json(item)))
                .collect(),
        ),
    }
}

/// TOML has no null.
fn drop_nulls(value: &mut Value) {
    match value {
        Value::Object(object) => {
            object.retain(|_, item| !item.is_null());
            object.values_mut().for_each(drop_nulls);
        }
        Value::Array(items) => {
            items.retain(|item| !item.is_null());
            items.iter_mut().for_each(drop_nulls);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{JsonDecoder, TomlDecoder, YamlDecoder};
    use crate::decoders::Decoder;
    use crate::error::Error;
    use crate::storage::{Scalar, TreeStorage};

    #[test]
    fn yaml_and_toml_land_in_the_same_tree() {
        let yaml = YamlDecoder
            .decode(b"database:\n  host: db\n  port: 5432\n")
            .expect("yaml decodes");
        let toml = TomlDecoder
            .decode(b"[database]\nhost = \"db\"\nport = 5432\n")
            .expect("toml decodes");
        assert!(yaml.equals(toml.as_ref()));
        assert_eq!(yaml.sub("database.port").scalar(), Some(Scalar::Integer(5432)));
    }

    #[test]
    fn blank_input_is_absent() {
        for decoder in [&JsonDecoder as &dyn Decoder, &YamlDecoder, &TomlDecoder] {
            let storage = decoder.decode(b"  \n").expect("blank decodes");
            assert!(!storage.is_present(), "{}", decoder.name());
        }
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let err = JsonDecoder
            .decode(b"{ \"a\": ")
            .err()
            .expect("truncated json");
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn invalid_utf8_is_a_decode_error() {
        for decoder in [&JsonDecoder as &dyn Decoder, &YamlDecoder, &TomlDecoder] {
            let err = decoder
                .decode(&[0x61, 0xff, 0xfe])
                .err()
                .expect("not UTF-8");
            assert!(
                matches!(err, Error::Decode(ref message) if message.contains("not valid UTF-8")),
                "{err:?}"
            );
        }
    }

    #[test]
    fn toml_encode_drops_nulls() {
        let storage = TreeStorage::new(json!({ "a": 1, "b": null, "t": { "x": "y" } }));
        let encoded = TomlDecoder.encode(&storage).expect("encodes");
        let decoded = TomlDecoder.decode(&encoded).expect("decodes");
        assert_eq!(decoded.to_value(), Some(json!({ "a": 1, "t": { "x": "y" } })));
    }

    #[test]
    fn toml_datetimes_become_text() {
        let storage = TomlDecoder
            .decode(b"released = 1979-05-27T07:32:00Z\n")
            .expect("decodes");
        assert_eq!(
            storage.sub("released").scalar(),
            Some(Scalar::Text("1979-05-27T07:32:00Z".to_owned()))
        );
    }
}

use std::sync::Arc;

use serde_json::Value;

use crate::decoders::{utf8, Decoder};
use crate::error::{Error, Result};
use crate::storage::{FlatOptions, FlatStorage, IndexMarker, Storage};

/// Dotenv-style `KEY=VALUE` lines into a [`FlatStorage`].
///
/// Blank lines and `#` comments are skipped, a leading `export ` is ignored and
/// values may be wrapped in single or double quotes. Double-quoted values
/// understand `\n`, `\t`, `\"` and `\\`.
#[derive(Debug, Clone, Default)]
pub struct FlatDecoder {
    options: FlatOptions,
}

impl FlatDecoder {
    pub fn new(options: FlatOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &FlatOptions {
        &self.options
    }
}

impl Decoder for FlatDecoder {
    fn name(&self) -> &str {
        "flat"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Arc<dyn Storage>> {
        let text = utf8(bytes, "flat")?;
        let pairs = parse_lines(text)?;
        Ok(FlatStorage::new(pairs, self.options.clone()).into_shared())
    }

    fn encode(&self, storage: &dyn Storage) -> Result<Vec<u8>> {
        let mut lines = Vec::new();
        if let Some(value) = storage.to_value() {
            flatten(&value, &mut Vec::new(), &self.options, &mut lines);
        }
        let mut rendered = String::new();
        for (key, value) in lines {
            rendered.push_str(&render_line(&key, &value));
            rendered.push('\n');
        }
        Ok(rendered.into_bytes())
    }
}

pub(crate) fn parse_lines(text: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::Decode(format!(
                "line {}: expected KEY=VALUE, found '{line}'",
                number + 1
            )));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::Decode(format!("line {}: empty key", number + 1)));
        }
        pairs.push((key.to_owned(), unquote(value.trim())));
    }
    Ok(pairs)
}

fn unquote(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return raw[1..raw.len() - 1].to_owned();
    }
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        let mut out = String::with_capacity(raw.len());
        let mut chars = raw[1..raw.len() - 1].chars();
        while let Some(ch) = chars.next() {
            if ch != '\\' {
                out.push(ch);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        }
        return out;
    }
    // Unquoted values may carry a trailing comment.
    match raw.find(" #") {
        Some(comment) => raw[..comment].trim_end().to_owned(),
        None => raw.to_owned(),
    }
}

pub(crate) fn render_line(key: &str, value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|ch| !ch.is_whitespace() && !matches!(ch, '"' | '\'' | '#' | '\\'));
    if plain {
        return format!("{key}={value}");
    }
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\t', "\\t");
    format!("{key}=\"{escaped}\"")
}

fn flatten(
    value: &Value,
    prefix: &mut Vec<String>,
    options: &FlatOptions,
    out: &mut Vec<(String, String)>,
) {
    match value {
        Value::Object(object) => {
            for (key, item) in object {
                prefix.push(key.clone());
                flatten(item, prefix, options, out);
                prefix.pop();
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                match (options.index_marker, prefix.last_mut()) {
                    (IndexMarker::Bracket, Some(last)) => {
                        let saved = last.clone();
                        last.push_str(&format!("[{index}]"));
                        flatten(item, prefix, options, out);
                        if let Some(last) = prefix.last_mut() {
                            *last = saved;
                        }
                    }
                    _ => {
                        prefix.push(index.to_string());
                        flatten(item, prefix, options, out);
                        prefix.pop();
                    }
                }
            }
        }
        Value::Null => out.push((prefix.join(&options.separator), String::new())),
        Value::String(text) => out.push((prefix.join(&options.separator), text.clone())),
        other => out.push((prefix.join(&options.separator), other.to_string())),
    }
}

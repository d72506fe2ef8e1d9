use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::storage::path::{parse_indices, ConfigPath, Segment};
use crate::storage::{Scalar, Storage, TreeStorage};

/// Above this index a flat key is not expanded into a dense array when the
/// storage is materialized as an untyped tree.
const MAX_DENSE_INDEX: usize = 4_096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMarker {
    /// Only `name[0]` denotes a sequence index.
    #[default]
    Bracket,
    /// `name[0]` and any all-digit segment (`SERVERS_0_HOST`) denote an index.
    Numeric,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatOptions {
    pub separator: String,
    pub index_marker: IndexMarker,
}

impl Default for FlatOptions {
    fn default() -> Self {
        Self {
            separator: ".".to_owned(),
            index_marker: IndexMarker::Bracket,
        }
    }
}

impl FlatOptions {
    /// `DATABASE_PRIMARY_HOST`, `SERVERS_0_HOST`.
    pub fn env() -> Self {
        Self {
            separator: "_".to_owned(),
            index_marker: IndexMarker::Numeric,
        }
    }

    /// `--database-primary-host`, `--servers-0-host`.
    pub fn args() -> Self {
        Self {
            separator: "-".to_owned(),
            index_marker: IndexMarker::Numeric,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Key { raw: String, folded: String },
    Index(usize),
}

#[derive(Debug, Clone)]
struct FlatEntry {
    key: String,
    tokens: Vec<Token>,
    value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Capture {
    Key(String),
    Index(usize),
}

#[derive(Debug)]
struct Match {
    consumed: usize,
    captures: Vec<Capture>,
}

/// Single-level storage keyed by raw flat strings (environment variables,
/// command-line arguments), resolved against structured paths at read time.
///
/// A raw key matches a path when, ignoring case and separators, the path's
/// segments are a prefix of the key's segments. A path segment may span several
/// raw segments, so both `database.primary.host` and `database.primary_host`
/// resolve `DATABASE_PRIMARY_HOST`. When several raw keys resolve to the same
/// leaf the one inserted last wins.
#[derive(Debug, Clone)]
pub struct FlatStorage {
    entries: Arc<Vec<FlatEntry>>,
    options: FlatOptions,
    prefix: Vec<Segment>,
}

impl FlatStorage {
    pub fn new<I, K, V>(pairs: I, options: FlatOptions) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let entries = pairs
            .into_iter()
            .map(|(key, value)| {
                let key = key.into();
                FlatEntry {
                    tokens: tokenize(&key, &options),
                    key,
                    value: value.into(),
                }
            })
            .collect();

        Self {
            entries: Arc::new(entries),
            options,
            prefix: Vec::new(),
        }
    }

    pub fn into_shared(self) -> Arc<dyn Storage> {
        Arc::new(self)
    }

    pub fn options(&self) -> &FlatOptions {
        &self.options
    }

    /// Raw entries visible from this view, in insertion order.
    pub fn entries(&self) -> Vec<(&str, &str)> {
        self.matching(&self.prefix)
            .map(|(entry, _)| (entry.key.as_str(), entry.value.as_str()))
            .collect()
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        let pattern = self.pattern(ConfigPath::parse(path).segments());
        self.matching(&pattern)
            .filter(|(entry, matched)| matched.consumed == entry.tokens.len())
            .last()
            .map(|(entry, _)| entry.value.as_str())
    }

    /// Concrete paths (relative to this view) produced by substituting every
    /// `[N]` / `{KEY}` placeholder in `pattern` with what the raw keys contain.
    pub fn expand(&self, pattern: &str) -> Vec<ConfigPath> {
        let relative = ConfigPath::parse(pattern);
        let full = self.pattern(relative.segments());
        let mut expanded: Vec<ConfigPath> = Vec::new();

        for (_, matched) in self.matching(&full) {
            let skip = self
                .prefix
                .iter()
                .filter(|segment| segment.is_placeholder())
                .count();
            let mut captures = matched.captures.into_iter().skip(skip);
            let mut segments = Vec::with_capacity(relative.segments().len());
            for segment in relative.segments() {
                let concrete = match segment {
                    Segment::AnyKey | Segment::AnyIndex => match captures.next() {
                        Some(Capture::Key(key)) => Segment::Key(key),
                        Some(Capture::Index(index)) => Segment::Index(index),
                        None => segment.clone(),
                    },
                    other => other.clone(),
                };
                segments.push(concrete);
            }

            let path = ConfigPath::from_segments(segments);
            if !expanded.contains(&path) {
                expanded.push(path);
            }
        }

        expanded
    }

    fn pattern(&self, extra: &[Segment]) -> Vec<Segment> {
        let mut pattern = self.prefix.clone();
        pattern.extend(extra.iter().cloned());
        pattern
    }

    fn matching<'s, 'p>(
        &'s self,
        pattern: &'p [Segment],
    ) -> impl Iterator<Item = (&'s FlatEntry, Match)> + 'p
    where
        's: 'p,
    {
        self.entries.iter().filter_map(move |entry| {
            match_prefix(pattern, &entry.tokens).map(|matched| (entry, matched))
        })
    }

    fn view(&self, prefix: Vec<Segment>) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            options: self.options.clone(),
            prefix,
        }
    }
}

impl Storage for FlatStorage {
    fn sub_path(&self, path: &ConfigPath) -> Arc<dyn Storage> {
        Arc::new(self.view(self.pattern(path.segments())))
    }

    fn is_present(&self) -> bool {
        self.matching(&self.prefix).next().is_some()
    }

    fn scalar(&self) -> Option<Scalar> {
        self.matching(&self.prefix)
            .filter(|(entry, matched)| matched.consumed == entry.tokens.len())
            .last()
            .map(|(entry, _)| Scalar::Text(entry.value.clone()))
    }

    fn elements(&self) -> Option<Vec<Arc<dyn Storage>>> {
        let pattern = self.pattern(&[Segment::AnyIndex]);
        let indices: BTreeSet<usize> = self
            .matching(&pattern)
            .filter_map(|(_, matched)| match matched.captures.last() {
                Some(Capture::Index(index)) => Some(*index),
                _ => None,
            })
            .collect();

        // A plain leaf with no indexed children reads as a comma-separated list.
        if indices.is_empty() {
            let Some(Scalar::Text(text)) = self.scalar() else {
                return None;
            };
            return Some(split_list(&text));
        }

        Some(
            indices
                .into_iter()
                .map(|index| {
                    Arc::new(self.view(self.pattern(&[Segment::Index(index)])))
                        as Arc<dyn Storage>
                })
                .collect(),
        )
    }

    fn keys(&self) -> Option<Vec<String>> {
        let pattern = self.pattern(&[Segment::AnyKey]);
        let mut keys: Vec<String> = Vec::new();
        for (_, matched) in self.matching(&pattern) {
            if let Some(Capture::Key(key)) = matched.captures.last() {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }

        if keys.is_empty() {
            None
        } else {
            Some(keys)
        }
    }

    fn to_value(&self) -> Option<Value> {
        let mut root: Option<Value> = None;
        for (entry, matched) in self.matching(&self.prefix) {
            let remaining = &entry.tokens[matched.consumed..];
            if remaining
                .iter()
                .any(|token| matches!(token, Token::Index(index) if *index > MAX_DENSE_INDEX))
            {
                tracing::debug!(key = %entry.key, "skipping flat key with oversized index");
                continue;
            }
            let node = root.get_or_insert(Value::Null);
            insert_tokens(node, remaining, &entry.value);
        }
        root
    }
}

fn split_list(text: &str) -> Vec<Arc<dyn Storage>> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    text.split(',')
        .map(|item| TreeStorage::new(Value::String(item.trim().to_owned())).into_shared())
        .collect()
}

fn fold(raw: &str) -> String {
    raw.chars()
        .filter(|ch| ch.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn tokenize(raw: &str, options: &FlatOptions) -> Vec<Token> {
    let pieces: Vec<&str> = if options.separator.is_empty() {
        vec![raw]
    } else {
        raw.split(options.separator.as_str()).collect()
    };

    let mut tokens = Vec::new();
    for piece in pieces {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }

        let (name, indices) = match piece.find('[') {
            Some(open) => match parse_indices(&piece[open..]) {
                Some(indices) if !indices.iter().any(Segment::is_placeholder) => {
                    (&piece[..open], indices)
                }
                _ => (piece, Vec::new()),
            },
            None => (piece, Vec::new()),
        };

        if !name.is_empty() {
            let numeric = options.index_marker == IndexMarker::Numeric
                && name.chars().all(|ch| ch.is_ascii_digit());
            match name.parse::<usize>() {
                Ok(index) if numeric => tokens.push(Token::Index(index)),
                _ => tokens.push(Token::Key {
                    raw: name.to_owned(),
                    folded: fold(name),
                }),
            }
        }

        for segment in indices {
            if let Segment::Index(index) = segment {
                tokens.push(Token::Index(index));
            }
        }
    }
    tokens
}

fn match_prefix(pattern: &[Segment], tokens: &[Token]) -> Option<Match> {
    let mut position = 0;
    let mut captures = Vec::new();

    for segment in pattern {
        match segment {
            Segment::Key(key) => {
                position = match_key(&fold(key), tokens, position)?;
            }
            Segment::Index(expected) => match tokens.get(position)? {
                Token::Index(index) if index == expected => position += 1,
                _ => return None,
            },
            Segment::AnyIndex => match tokens.get(position)? {
                Token::Index(index) => {
                    captures.push(Capture::Index(*index));
                    position += 1;
                }
                Token::Key { .. } => return None,
            },
            Segment::AnyKey => match tokens.get(position)? {
                Token::Key { raw, .. } => {
                    captures.push(Capture::Key(raw.to_lowercase()));
                    position += 1;
                }
                Token::Index(_) => return None,
            },
        }
    }

    Some(Match {
        consumed: position,
        captures,
    })
}

/// One path key may span several raw segments: `primary_host` consumes
/// `PRIMARY` and `HOST`.
fn match_key(target: &str, tokens: &[Token], start: usize) -> Option<usize> {
    if target.is_empty() {
        return None;
    }

    let mut joined = String::new();
    for (offset, token) in tokens.get(start..)?.iter().enumerate() {
        let Token::Key { folded, .. } = token else {
            return None;
        };
        joined.push_str(folded);
        if joined == target {
            return Some(start + offset + 1);
        }
        if !target.starts_with(joined.as_str()) {
            return None;
        }
    }
    None
}

fn insert_tokens(node: &mut Value, tokens: &[Token], value: &str) {
    let Some((first, rest)) = tokens.split_first() else {
        *node = Value::String(value.to_owned());
        return;
    };

    match first {
        Token::Key { raw, .. } => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(object) = node {
                let child = object.entry(raw.to_lowercase()).or_insert(Value::Null);
                insert_tokens(child, rest, value);
            }
        }
        Token::Index(index) => {
            if !node.is_array() {
                *node = Value::Array(Vec::new());
            }
            if let Value::Array(items) = node {
                if items.len() <= *index {
                    items.resize(index + 1, Value::Null);
                }
                insert_tokens(&mut items[*index], rest, value);
            }
        }
    }
}

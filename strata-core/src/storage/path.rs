use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// One step of a [`ConfigPath`].
///
/// `AnyKey` and `AnyIndex` are placeholders (`{KEY}` and `[N]`) used for pattern
/// queries; storages that cannot expand them treat them as absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
    AnyKey,
    AnyIndex,
}

impl Segment {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::AnyKey | Self::AnyIndex)
    }
}

/// Parsed `segment(.segment)*` address shared by lookups, sub-views and handler
/// registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ConfigPath {
    segments: Vec<Segment>,
}

impl ConfigPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn parse(raw: &str) -> Self {
        let mut segments = Vec::new();
        for part in raw.split('.') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            parse_part(part, &mut segments);
        }
        Self { segments }
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn has_placeholders(&self) -> bool {
        self.segments.iter().any(Segment::is_placeholder)
    }

    pub fn join(&self, other: &ConfigPath) -> ConfigPath {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    pub fn child(&self, segment: Segment) -> ConfigPath {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self { segments }
    }
}

impl FromStr for ConfigPath {
    type Err = Infallible;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::parse(value))
    }
}

impl fmt::Display for ConfigPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Key(key) => {
                    if position > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{key}")?;
                }
                Segment::AnyKey => {
                    if position > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{{KEY}}")?;
                }
                Segment::Index(index) => write!(f, "[{index}]")?,
                Segment::AnyIndex => write!(f, "[N]")?,
            }
        }
        Ok(())
    }
}

/// Splits `name[0][1]` into a key followed by index segments. Anything that does
/// not follow the bracket grammar is kept verbatim as a key.
fn parse_part(part: &str, out: &mut Vec<Segment>) {
    if part == "{KEY}" {
        out.push(Segment::AnyKey);
        return;
    }

    let Some(open) = part.find('[') else {
        out.push(Segment::Key(part.to_owned()));
        return;
    };

    match parse_indices(&part[open..]) {
        Some(indices) => {
            let name = part[..open].trim();
            if !name.is_empty() {
                out.push(Segment::Key(name.to_owned()));
            }
            out.extend(indices);
        }
        None => out.push(Segment::Key(part.to_owned())),
    }
}

pub(crate) fn parse_indices(mut remainder: &str) -> Option<Vec<Segment>> {
    let mut indices = Vec::new();
    while !remainder.is_empty() {
        let inner = remainder.strip_prefix('[')?;
        let close = inner.find(']')?;
        let token = inner[..close].trim();
        let segment = if token == "N" {
            Segment::AnyIndex
        } else {
            Segment::Index(token.parse::<usize>().ok()?)
        };
        indices.push(segment);
        remainder = &inner[(close + 1)..];
    }
    Some(indices)
}

#[cfg(test)]
mod tests {
    use super::{ConfigPath, Segment};

    #[test]
    fn parses_keys_and_indices() {
        let path = ConfigPath::parse("servers[0].ports[2].number");
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("servers".to_owned()),
                Segment::Index(0),
                Segment::Key("ports".to_owned()),
                Segment::Index(2),
                Segment::Key("number".to_owned()),
            ]
        );
        assert_eq!(path.to_string(), "servers[0].ports[2].number");
    }

    #[test]
    fn empty_path_is_root() {
        assert!(ConfigPath::parse("").is_root());
        assert!(ConfigPath::parse(" . ").is_root());
    }

    #[test]
    fn parses_placeholders() {
        let path = ConfigPath::parse("servers[N].labels.{KEY}");
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("servers".to_owned()),
                Segment::AnyIndex,
                Segment::Key("labels".to_owned()),
                Segment::AnyKey,
            ]
        );
        assert!(path.has_placeholders());
        assert_eq!(path.to_string(), "servers[N].labels.{KEY}");
    }

    #[test]
    fn malformed_brackets_stay_literal() {
        let path = ConfigPath::parse("a[x].b[1");
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("a[x]".to_owned()),
                Segment::Key("b[1".to_owned()),
            ]
        );
    }

    #[test]
    fn leading_index_has_no_key() {
        let path = ConfigPath::parse("[3].name");
        assert_eq!(
            path.segments(),
            &[Segment::Index(3), Segment::Key("name".to_owned())]
        );
        let joined = ConfigPath::parse("servers").join(&path);
        assert_eq!(joined.to_string(), "servers[3].name");
    }
}

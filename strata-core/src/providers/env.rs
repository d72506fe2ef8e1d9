use async_trait::async_trait;

use crate::decoders::flat::render_line;
use crate::error::{Error, Result};
use crate::providers::{ChangeCallback, Provider};

const SEPARATORS: [char; 3] = ['_', '.', '-'];

/// Process environment as `KEY=VALUE` lines. Only variables starting with
/// `prefix` (case-insensitive) followed by a separator are kept, with both
/// stripped. The environment is read on every `load`; there is
/// no change delivery.
pub struct EnvProvider {
    prefix: Option<String>,
    vars: Option<Vec<(String, String)>>,
}

impl EnvProvider {
    pub fn new(prefix: Option<String>) -> Self {
        Self {
            prefix: prefix.filter(|prefix| !prefix.is_empty()),
            vars: None,
        }
    }

    /// Reads from a fixed snapshot instead of the process environment.
    pub fn from_vars<I, K, V>(prefix: Option<String>, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: Some(
                vars.into_iter()
                    .map(|(key, value)| (key.into(), value.into()))
                    .collect(),
            ),
            ..Self::new(prefix)
        }
    }

    fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        let Some(prefix) = self.prefix.as_deref() else {
            return Some(key);
        };
        let head = key.get(..prefix.len())?;
        if !head.eq_ignore_ascii_case(prefix) {
            return None;
        }
        let rest = &key[prefix.len()..];
        let bounded = prefix.ends_with(SEPARATORS) || rest.starts_with(SEPARATORS);
        let rest = rest.trim_start_matches(SEPARATORS);
        (bounded && !rest.is_empty()).then_some(rest)
    }

    fn render(&self, vars: impl Iterator<Item = (String, String)>) -> Vec<u8> {
        let mut rendered = String::new();
        for (key, value) in vars {
            if let Some(stripped) = self.strip(&key) {
                rendered.push_str(&render_line(stripped, &value));
                rendered.push('\n');
            }
        }
        rendered.into_bytes()
    }
}

#[async_trait]
impl Provider for EnvProvider {
    fn name(&self) -> &str {
        "env"
    }

    async fn load(&self) -> Result<Vec<u8>> {
        Ok(match &self.vars {
            Some(vars) => self.render(vars.iter().cloned()),
            None => self.render(std::env::vars()),
        })
    }

    async fn save(&self, _bytes: &[u8]) -> Result<()> {
        Err(Error::Config("environment provider is read-only".to_owned()))
    }

    fn on_change(&self, _callback: ChangeCallback) {}

    async fn watch(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::EnvProvider;
    use crate::decoders::flat::parse_lines;
    use crate::providers::Provider;

    #[tokio::test]
    async fn prefix_filters_and_is_stripped() {
        let provider = EnvProvider::from_vars(
            Some("APP".to_owned()),
            [
                ("APP_DATABASE_HOST", "db"),
                ("app_motd", "hello world"),
                ("HOME", "/root"),
                ("APPLE", "x"),
            ],
        );

        let bytes = provider.load().await.expect("load");
        let pairs = parse_lines(std::str::from_utf8(&bytes).expect("utf8")).expect("parse");
        assert_eq!(
            pairs,
            vec![
                ("DATABASE_HOST".to_owned(), "db".to_owned()),
                ("motd".to_owned(), "hello world".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn save_is_rejected() {
        let provider = EnvProvider::new(None);
        assert!(provider.save(b"A=1").await.is_err());
    }
}

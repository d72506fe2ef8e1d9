use async_trait::async_trait;

use crate::decoders::flat::render_line;
use crate::error::{Error, Result};
use crate::providers::{ChangeCallback, Provider};

/// Command-line style arguments as `KEY=VALUE` lines.
///
/// `--key=value` and `--key value` take the value, a `--flag` followed by
/// another option (or nothing) reads as `true`. Everything after a bare `--`
/// and every positional argument is ignored.
#[derive(Debug, Clone, Default)]
pub struct ArgsProvider {
    args: Vec<String>,
}

impl ArgsProvider {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        let mut iter = self.args.iter().peekable();
        while let Some(arg) = iter.next() {
            if arg == "--" {
                break;
            }
            let Some(option) = arg.strip_prefix("--") else {
                tracing::debug!(%arg, "ignoring positional argument");
                continue;
            };

            if let Some((key, value)) = option.split_once('=') {
                pairs.push((key.to_owned(), value.to_owned()));
                continue;
            }

            let value = match iter.peek() {
                Some(next) if !next.starts_with("--") => iter.next().cloned().unwrap_or_default(),
                _ => "true".to_owned(),
            };
            pairs.push((option.to_owned(), value));
        }
        pairs
    }
}

#[async_trait]
impl Provider for ArgsProvider {
    fn name(&self) -> &str {
        "args"
    }

    async fn load(&self) -> Result<Vec<u8>> {
        let mut rendered = String::new();
        for (key, value) in self.pairs() {
            rendered.push_str(&render_line(&key, &value));
            rendered.push('\n');
        }
        Ok(rendered.into_bytes())
    }

    async fn save(&self, _bytes: &[u8]) -> Result<()> {
        Err(Error::Config("argument provider is read-only".to_owned()))
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
    use super::ArgsProvider;
    use crate::decoders::{Decoder, FlatDecoder};
    use crate::providers::Provider;
    use crate::storage::{FlatOptions, Scalar};

    #[test]
    fn parses_option_forms() {
        let provider = ArgsProvider::new([
            "serve",
            "--database-primary-host=db1",
            "--port",
            "8080",
            "--verbose",
            "--tls",
            "--",
            "--ignored=1",
        ]);
        assert_eq!(
            provider.pairs(),
            vec![
                ("database-primary-host".to_owned(), "db1".to_owned()),
                ("port".to_owned(), "8080".to_owned()),
                ("verbose".to_owned(), "true".to_owned()),
                ("tls".to_owned(), "true".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn decodes_into_flat_storage() {
        let provider = ArgsProvider::new(["--database-primary-host", "db1"]);
        let bytes = provider.load().await.expect("load");
        let storage = FlatDecoder::new(FlatOptions::args())
            .decode(&bytes)
            .expect("decode");
        assert_eq!(
            storage.sub("database.primary_host").scalar(),
            Some(Scalar::Text("db1".to_owned()))
        );
    }
}

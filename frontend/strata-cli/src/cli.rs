use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "strata", about = "Inspect and watch layered configuration")]
pub struct Cli {
    /// Configuration file, lowest priority first. Repeatable.
    #[arg(short, long = "file", value_name = "PATH")]
    pub files: Vec<PathBuf>,

    /// Environment variables with this prefix form the highest layer.
    #[arg(long, env = "STRATA_ENV_PREFIX")]
    pub env_prefix: Option<String>,

    /// Engine options file (`.toml` or `.json`); replaces --file and --env-prefix.
    #[arg(long, value_name = "PATH", conflicts_with_all = ["files", "env_prefix"])]
    pub options: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub output: OutputFormat,

    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Print the merged value at a path.
    Get {
        path: Option<String>,
        /// Also show which source supplied the value and every layer's own value.
        #[arg(long)]
        explain: bool,
    },
    /// Encode the merged configuration.
    Dump {
        #[arg(long, default_value = "json")]
        format: String,
    },
    /// Validate the merged value at a path against a JSON schema.
    Check {
        #[arg(long, value_name = "FILE")]
        schema: PathBuf,
        path: Option<String>,
    },
    /// Watch sources and print changes until interrupted.
    Watch {
        /// Paths to report on; the whole tree when omitted.
        paths: Vec<String>,
    },
    /// List the configured sources in priority order.
    Sources,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

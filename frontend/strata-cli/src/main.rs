mod cli;
mod renderer;

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use strata_core::decoders::{decoder_for_extension, FlatDecoder};
use strata_core::engine::{ConfigEngine, EngineOptions};
use strata_core::logging::{init_tracing, level_for_verbosity};
use strata_core::providers::{EnvProvider, FileProvider};
use strata_core::storage::{FlatOptions, Storage, ValidateStorage};
use strata_core::{Error, Registry, Result};
use tokio::sync::broadcast::error::RecvError;

use crate::renderer::{display_path, Renderer};

const OUTPUT_SCHEMA: &str = "strata/output/v1";

fn main() {
    let args = cli::Cli::parse_args();
    init_tracing(level_for_verbosity(args.verbose));

    let output = args.output;
    if let Err(error) = run(args) {
        match output {
            cli::OutputFormat::Text => eprintln!("strata failed: {error}"),
            cli::OutputFormat::Json => {
                if let Err(render_error) = print_json_error_envelope(&error) {
                    eprintln!("strata failed: {error} ({render_error})");
                }
            }
        }
        std::process::exit(1);
    }
}

fn run(args: cli::Cli) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|err| Error::Config(format!("failed to create tokio runtime: {err}")))?;
    runtime.block_on(async move {
        let engine = build_engine(&args).await?;
        let result = handle_command(&engine, args.command, args.output).await;
        let closed = engine.close().await;
        result?;
        closed
    })
}

async fn build_engine(args: &cli::Cli) -> Result<ConfigEngine> {
    if let Some(path) = &args.options {
        let options = EngineOptions::load(path)?;
        return ConfigEngine::from_options(&options, &Registry::default()).await;
    }

    let mut builder = ConfigEngine::builder();
    for path in &args.files {
        let decoder = decoder_for_path(path)?;
        builder = builder.source(
            path.display().to_string(),
            Arc::new(FileProvider::new(path.clone())),
            decoder,
        );
    }
    if let Some(prefix) = &args.env_prefix {
        builder = builder.source(
            "env",
            Arc::new(EnvProvider::new(Some(prefix.clone()))),
            Arc::new(FlatDecoder::new(FlatOptions::env())),
        );
    }
    let engine = builder.build().await?;
    tracing::debug!(sources = ?engine.source_names(), "engine ready");
    Ok(engine)
}

fn decoder_for_path(path: &Path) -> Result<Arc<dyn strata_core::Decoder>> {
    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .unwrap_or_default();
    decoder_for_extension(extension).ok_or_else(|| {
        Error::Config(format!(
            "cannot tell the format of '{}' from its extension",
            path.display()
        ))
    })
}

async fn handle_command(
    engine: &ConfigEngine,
    command: cli::Command,
    output: cli::OutputFormat,
) -> Result<()> {
    match command {
        cli::Command::Get { path, explain } => {
            let path = path.unwrap_or_default();
            if explain {
                let resolved = engine.resolve(&path)?;
                match output {
                    cli::OutputFormat::Text => {
                        println!("Path: {}", display_path(&resolved.path));
                        println!(
                            "Source: {}",
                            resolved.source.as_deref().unwrap_or("<none>")
                        );
                        for (name, value) in &resolved.layers {
                            println!(
                                "  {name}: {}",
                                value
                                    .as_ref()
                                    .map(|v| v.to_string())
                                    .unwrap_or_else(|| "<not set>".to_owned())
                            );
                        }
                        println!("Effective: {}", to_json(&resolved.effective)?);
                    }
                    cli::OutputFormat::Json => print_json_envelope("get", &resolved)?,
                }
            } else {
                let value = engine.value(&path)?;
                match output {
                    cli::OutputFormat::Text => println!("{}", to_pretty_json(&value)?),
                    cli::OutputFormat::Json => {
                        print_json_envelope("get", &GetData { path, value })?
                    }
                }
            }
        }
        cli::Command::Dump { format } => {
            let decoder = decoder_for_extension(&format)
                .ok_or_else(|| Error::Config(format!("unsupported dump format '{format}'")))?;
            let bytes = engine.dump(decoder.as_ref())?;
            let content = String::from_utf8_lossy(&bytes).into_owned();
            match output {
                cli::OutputFormat::Text => print!("{content}"),
                cli::OutputFormat::Json => {
                    print_json_envelope("dump", &DumpData { format, content })?
                }
            }
        }
        cli::Command::Check { schema, path } => {
            let path = path.unwrap_or_default();
            let schema_json = read_schema(&schema)?;
            let validated =
                ValidateStorage::new(engine.sub(&path).storage(), &schema_json)?.into_shared();
            let _: serde_json::Value = validated.convert()?;
            match output {
                cli::OutputFormat::Text => {
                    println!("{} is valid against {}", display_path(&path), schema.display())
                }
                cli::OutputFormat::Json => print_json_envelope(
                    "check",
                    &CheckData {
                        path,
                        schema: schema.display().to_string(),
                        valid: true,
                    },
                )?,
            }
        }
        cli::Command::Watch { paths } => watch(engine, paths, output).await?,
        cli::Command::Sources => {
            let names = engine.source_names();
            match output {
                cli::OutputFormat::Text => {
                    if names.is_empty() {
                        println!("No sources configured.");
                    }
                    for (priority, name) in names.iter().enumerate() {
                        println!("{priority}: {name}");
                    }
                }
                cli::OutputFormat::Json => print_json_envelope("sources", &names)?,
            }
        }
    }
    Ok(())
}

async fn watch(
    engine: &ConfigEngine,
    paths: Vec<String>,
    output: cli::OutputFormat,
) -> Result<()> {
    let renderer = Renderer::new(output);
    let paths = if paths.is_empty() {
        vec![String::new()]
    } else {
        paths
    };
    for path in paths {
        let node = engine.sub(&path);
        let full = node.full_path().to_string();
        node.on_change(move |storage: &dyn Storage| {
            renderer.render_change(&full, storage.to_value().as_ref());
            Ok(())
        })?;
    }

    let mut events = engine.events();
    engine.watch().await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            received = events.recv() => match received {
                Ok(event) => renderer.render_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

fn read_schema(path: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        Error::Config(format!(
            "failed to read schema file '{}': {err}",
            path.display()
        ))
    })?;
    serde_json::from_str(&raw).map_err(|err| {
        Error::Config(format!(
            "schema is not valid JSON '{}': {err}",
            path.display()
        ))
    })
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|err| Error::Config(format!("failed encoding output: {err}")))
}

fn to_pretty_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|err| Error::Config(format!("failed encoding output: {err}")))
}

fn print_json_envelope<T: Serialize>(command: &str, data: &T) -> Result<()> {
    let envelope = CliJsonEnvelope {
        schema: OUTPUT_SCHEMA,
        status: "ok",
        command,
        data,
    };
    println!("{}", to_json(&envelope)?);
    Ok(())
}

fn print_json_error_envelope(error: &Error) -> Result<()> {
    let envelope = CliJsonErrorEnvelope {
        schema: OUTPUT_SCHEMA,
        status: "error",
        error: CliJsonErrorPayload {
            code: error_code(error),
            message: error.to_string(),
        },
    };
    println!("{}", to_json(&envelope)?);
    Ok(())
}

fn error_code(error: &Error) -> &'static str {
    match error {
        Error::Config(_) => "config_error",
        Error::Validation(_) => "validation_error",
        Error::NotFound(_) => "not_found",
        Error::SourceLoad(_) => "source_load_error",
        Error::Decode(_) => "decode_error",
        Error::Bind(_) => "bind_error",
        Error::HandlerFailure { .. } => "handler_failure",
        Error::HandlerTimeout { .. } => "handler_timeout",
        Error::EngineClosed => "engine_closed",
    }
}

#[derive(Debug, Serialize)]
struct CliJsonEnvelope<'a, T: Serialize> {
    schema: &'a str,
    status: &'a str,
    command: &'a str,
    data: &'a T,
}

#[derive(Debug, Serialize)]
struct CliJsonErrorEnvelope<'a> {
    schema: &'a str,
    status: &'a str,
    error: CliJsonErrorPayload,
}

#[derive(Debug, Serialize)]
struct CliJsonErrorPayload {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct GetData {
    path: String,
    value: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct DumpData {
    format: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct CheckData {
    path: String,
    schema: String,
    valid: bool,
}

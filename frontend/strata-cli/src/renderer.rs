use crate::cli::OutputFormat;
use strata_core::events::Event;

#[derive(Clone, Copy)]
pub struct Renderer {
    output_format: OutputFormat,
}

impl Renderer {
    pub fn new(output_format: OutputFormat) -> Self {
        Self { output_format }
    }

    pub fn render_event(&self, event: &Event) {
        match self.output_format {
            OutputFormat::Text => self.render_text(event),
            OutputFormat::Json => self.render_json(event),
        }
    }

    /// Value delivered to a watch handler.
    pub fn render_change(&self, path: &str, value: Option<&serde_json::Value>) {
        match self.output_format {
            OutputFormat::Text => println!(
                "[change] {}: {}",
                display_path(path),
                value
                    .map(|value| value.to_string())
                    .unwrap_or_else(|| "<not set>".to_owned())
            ),
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "type": "change",
                    "path": path,
                    "value": value,
                });
                println!("{}", serde_json::to_string(&output).unwrap_or_default());
            }
        }
    }

    fn render_text(&self, event: &Event) {
        match event {
            Event::SourceUpdated {
                source,
                changed_paths,
            } => {
                if changed_paths.is_empty() {
                    println!("[source:{source}] reloaded, nothing watched changed");
                } else {
                    let paths: Vec<&str> = changed_paths.iter().map(|p| display_path(p)).collect();
                    println!("[source:{source}] reloaded, changed: {}", paths.join(", "));
                }
            }
            Event::SourceFailed { source, error } => {
                eprintln!("[source:{source}] reload failed: {error}");
            }
            Event::HandlerSucceeded { .. } => {
                // Already visible through the change line.
            }
            Event::HandlerFailed {
                path,
                index,
                elapsed,
                error,
            } => {
                eprintln!(
                    "[handler] #{index} on {} failed after {}ms: {error}",
                    display_path(path),
                    elapsed.as_millis()
                );
            }
            Event::HandlerTimedOut {
                path,
                index,
                elapsed,
            } => {
                eprintln!(
                    "[handler] #{index} on {} timed out after {}ms",
                    display_path(path),
                    elapsed.as_millis()
                );
            }
            Event::DispatchHalted { path, skipped } => {
                eprintln!("[handler] {} halted, {skipped} skipped", display_path(path));
            }
            Event::Watching => println!("[watch] watching for changes (ctrl-c to stop)"),
            Event::Closed { error } => match error {
                Some(err) => eprintln!("[watch] closed with error: {err}"),
                None => println!("[watch] closed"),
            },
        }
    }

    fn render_json(&self, event: &Event) {
        let output = match event {
            Event::SourceUpdated {
                source,
                changed_paths,
            } => serde_json::json!({
                "type": "source_updated",
                "source": source,
                "changed_paths": changed_paths
            }),
            Event::SourceFailed { source, error } => serde_json::json!({
                "type": "source_failed",
                "source": source,
                "error": error
            }),
            Event::HandlerSucceeded {
                path,
                index,
                elapsed,
            } => serde_json::json!({
                "type": "handler_succeeded",
                "path": path,
                "index": index,
                "elapsed_ms": elapsed.as_millis() as u64
            }),
            Event::HandlerFailed {
                path,
                index,
                elapsed,
                error,
            } => serde_json::json!({
                "type": "handler_failed",
                "path": path,
                "index": index,
                "elapsed_ms": elapsed.as_millis() as u64,
                "error": error
            }),
            Event::HandlerTimedOut {
                path,
                index,
                elapsed,
            } => serde_json::json!({
                "type": "handler_timed_out",
                "path": path,
                "index": index,
                "elapsed_ms": elapsed.as_millis() as u64
            }),
            Event::DispatchHalted { path, skipped } => serde_json::json!({
                "type": "dispatch_halted",
                "path": path,
                "skipped": skipped
            }),
            Event::Watching => serde_json::json!({ "type": "watching" }),
            Event::Closed { error } => serde_json::json!({
                "type": "closed",
                "error": error
            }),
        };

        println!("{}", serde_json::to_string(&output).unwrap_or_default());
    }
}

pub fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "<root>"
    } else {
        path
    }
}

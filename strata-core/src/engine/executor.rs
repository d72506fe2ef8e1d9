use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::engine::options::{ErrorPolicy, ExecutorOptions};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::storage::Storage;

/// Change callback. The token is cancelled once the invocation's deadline has
/// passed; handlers that never check it keep running in the background and
/// their result is discarded.
pub type Handler = Arc<dyn Fn(&dyn Storage, &CancellationToken) -> Result<()> + Send + Sync>;

pub type Observer = Arc<dyn Fn(&HandlerRecord) + Send + Sync>;

/// Wraps a callback that does not care about cancellation.
pub fn handler<F>(callback: F) -> Handler
where
    F: Fn(&dyn Storage) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(move |storage: &dyn Storage, _token: &CancellationToken| callback(storage))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded,
    /// `Error::HandlerFailure` or `Error::HandlerTimeout`.
    Failed(Error),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Failed(Error::HandlerTimeout { .. }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerRecord {
    pub path: String,
    pub index: usize,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// Everything that happened while running the handler list of one path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub path: String,
    pub records: Vec<HandlerRecord>,
    /// Handlers not run because the stop policy halted the dispatch.
    pub skipped: usize,
}

impl DispatchReport {
    pub fn ran(&self) -> Vec<usize> {
        self.records.iter().map(|record| record.index).collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &Error> {
        self.records.iter().filter_map(|record| match &record.outcome {
            Outcome::Failed(err) => Some(err),
            Outcome::Succeeded => None,
        })
    }

    pub fn timeouts(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.outcome.is_timeout())
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.skipped == 0 && self.records.iter().all(|record| record.outcome.is_success())
    }
}

/// Runs the ordered handler list of a changed path under the configured
/// timeout, concurrency mode and error policy.
#[derive(Clone)]
pub struct HandlerExecutor {
    timeout: Duration,
    run_async: bool,
    error_policy: ErrorPolicy,
    observer: Option<Observer>,
    events: Option<EventBus>,
}

impl HandlerExecutor {
    pub fn new(options: &ExecutorOptions) -> Self {
        Self {
            timeout: options.timeout(),
            run_async: options.run_async,
            error_policy: options.error_policy,
            observer: None,
            events: None,
        }
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn dispatch(
        &self,
        path: &str,
        handlers: &[Handler],
        storage: Arc<dyn Storage>,
    ) -> DispatchReport {
        let mut report = DispatchReport {
            path: path.to_owned(),
            ..DispatchReport::default()
        };

        if self.run_async {
            // The stop policy has no effect here: everything is already running.
            let invocations = handlers.iter().enumerate().map(|(index, handler)| {
                self.invoke(path, index, Arc::clone(handler), Arc::clone(&storage))
            });
            report.records = join_all(invocations).await;
        } else {
            for (index, handler) in handlers.iter().enumerate() {
                let record = self
                    .invoke(path, index, Arc::clone(handler), Arc::clone(&storage))
                    .await;
                let failed = !record.outcome.is_success();
                report.records.push(record);
                if failed && self.error_policy == ErrorPolicy::Stop {
                    report.skipped = handlers.len() - index - 1;
                    break;
                }
            }
        }

        if report.skipped > 0 {
            tracing::info!(path, skipped = report.skipped, "dispatch halted by stop policy");
            self.publish(Event::DispatchHalted {
                path: path.to_owned(),
                skipped: report.skipped,
            });
        }
        report
    }

    async fn invoke(
        &self,
        path: &str,
        index: usize,
        handler: Handler,
        storage: Arc<dyn Storage>,
    ) -> HandlerRecord {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let started = Instant::now();
        let task =
            tokio::task::spawn_blocking(move || handler(storage.as_ref(), &task_token));

        let outcome = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(()))) => Outcome::Succeeded,
            Ok(Ok(Err(err))) => Outcome::Failed(Error::HandlerFailure {
                path: path.to_owned(),
                index,
                message: err.to_string(),
            }),
            Ok(Err(join_err)) => Outcome::Failed(Error::HandlerFailure {
                path: path.to_owned(),
                index,
                message: if join_err.is_panic() {
                    "handler panicked".to_owned()
                } else {
                    join_err.to_string()
                },
            }),
            Err(_) => {
                token.cancel();
                Outcome::Failed(Error::HandlerTimeout {
                    path: path.to_owned(),
                    index,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        };

        let record = HandlerRecord {
            path: path.to_owned(),
            index,
            outcome,
            elapsed: started.elapsed(),
        };
        self.observe(&record);
        record
    }

    fn observe(&self, record: &HandlerRecord) {
        let elapsed_ms = record.elapsed.as_millis() as u64;
        let event = match &record.outcome {
            Outcome::Succeeded => {
                tracing::debug!(
                    path = %record.path,
                    handler = record.index,
                    elapsed_ms,
                    "config handler succeeded"
                );
                Event::HandlerSucceeded {
                    path: record.path.clone(),
                    index: record.index,
                    elapsed: record.elapsed,
                }
            }
            Outcome::Failed(err @ Error::HandlerTimeout { .. }) => {
                tracing::warn!(
                    path = %record.path,
                    handler = record.index,
                    elapsed_ms,
                    %err,
                    "config handler timed out"
                );
                Event::HandlerTimedOut {
                    path: record.path.clone(),
                    index: record.index,
                    elapsed: record.elapsed,
                }
            }
            Outcome::Failed(err) => {
                tracing::warn!(
                    path = %record.path,
                    handler = record.index,
                    elapsed_ms,
                    %err,
                    "config handler failed"
                );
                Event::HandlerFailed {
                    path: record.path.clone(),
                    index: record.index,
                    elapsed: record.elapsed,
                    error: err.to_string(),
                }
            }
        };
        self.publish(event);

        if let Some(observer) = &self.observer {
            observer(record);
        }
    }

    fn publish(&self, event: Event) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

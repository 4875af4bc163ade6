//! Step wrapper — runs pipeline stages as reported build steps.
//!
//! A step is reported `running` before its stage starts. The stage result
//! decides the rest: a summary marks the step successful, a warning marks it
//! failed but lets the pipeline continue, cancellation and fatal errors mark
//! it failed and abort the pipeline.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::metrics;
use crate::models::StepStatus;
use crate::services::status_service::StatusService;

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The ref is not meant to be built; the build ends `cancelled`.
    #[error("{0}")]
    Cancelled(String),
    /// The stage degraded but the pipeline goes on.
    #[error("{0}")]
    Warning(String),
    #[error("{0:#}")]
    Fatal(anyhow::Error),
}

impl StageError {
    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        StageError::Fatal(error.into())
    }
}

pub type StageResult = Result<Option<String>, StageError>;

/// Reports the steps of one build.
#[derive(Clone)]
pub struct StepRunner {
    build_id: i64,
    status: Arc<StatusService>,
}

enum Signal {
    Output,
    Finish,
}

/// Output accumulated by a running step.
///
/// Every push schedules an incremental step update; updates are applied in
/// order by a single task and coalesced when the datastore lags behind.
#[derive(Clone)]
pub struct StepOutput {
    text: Arc<Mutex<String>>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl StepOutput {
    pub fn push(&self, chunk: &str) {
        if let Ok(mut text) = self.text.lock() {
            text.push_str(chunk);
        }
        let _ = self.signals.send(Signal::Output);
    }

    fn snapshot(&self) -> String {
        self.text.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

pub struct RunningStep {
    runner: StepRunner,
    description: String,
    started: Instant,
    output: StepOutput,
    updater: JoinHandle<()>,
}

impl StepRunner {
    pub fn new(build_id: i64, status: Arc<StatusService>) -> Self {
        Self { build_id, status }
    }

    /// Report a step as running and return its handle.
    pub async fn start(&self, description: &str) -> Result<RunningStep, StageError> {
        tracing::info!(build_id = self.build_id, step = description, "step started");
        self.status
            .update_step(self.build_id, description, StepStatus::Running, None)
            .await
            .map_err(StageError::Fatal)?;

        let (signals, mut receiver) = mpsc::unbounded_channel();
        let output = StepOutput {
            text: Arc::new(Mutex::new(String::new())),
            signals,
        };

        let updater = {
            let runner = self.clone();
            let output = output.clone();
            let description = description.to_string();
            tokio::spawn(async move {
                while let Some(signal) = receiver.recv().await {
                    let mut finished = matches!(signal, Signal::Finish);
                    while let Ok(next) = receiver.try_recv() {
                        finished |= matches!(next, Signal::Finish);
                    }
                    if finished {
                        break;
                    }

                    if let Err(e) = runner
                        .status
                        .update_step_output(runner.build_id, &description, &output.snapshot())
                        .await
                    {
                        tracing::warn!(build_id = runner.build_id, step = %description, "could not record step output: {e:#}");
                    }
                }
            })
        };

        Ok(RunningStep {
            runner: self.clone(),
            description: description.to_string(),
            started: Instant::now(),
            output,
            updater,
        })
    }

    /// Run `stage` as the step `description`.
    pub async fn run<F>(&self, description: &str, stage: F) -> Result<(), StageError>
    where
        F: Future<Output = StageResult>,
    {
        let step = self.start(description).await?;
        let result = stage.await;
        step.finish(result).await
    }
}

impl RunningStep {
    pub fn output(&self) -> StepOutput {
        self.output.clone()
    }

    /// Record the stage result; warnings are swallowed, other errors returned.
    pub async fn finish(self, result: StageResult) -> Result<(), StageError> {
        let RunningStep {
            runner,
            description,
            started,
            output,
            updater,
        } = self;

        let _ = output.signals.send(Signal::Finish);
        if let Err(e) = updater.await {
            tracing::warn!(build_id = runner.build_id, step = %description, "step output task failed: {e}");
        }
        metrics::step_duration(&description, started.elapsed().as_secs_f64());

        let (status, recorded, outcome) = match result {
            Ok(summary) => (StepStatus::Success, summary, Ok(())),
            Err(StageError::Warning(message)) => {
                tracing::warn!(build_id = runner.build_id, step = %description, "{message}");
                (StepStatus::Failed, Some(message), Ok(()))
            }
            Err(StageError::Cancelled(reason)) => {
                tracing::info!(build_id = runner.build_id, step = %description, "build cancelled: {reason}");
                (
                    StepStatus::Failed,
                    Some(reason.clone()),
                    Err(StageError::Cancelled(reason)),
                )
            }
            Err(error) => {
                tracing::error!(build_id = runner.build_id, step = %description, "{error}");
                (StepStatus::Failed, Some(error.to_string()), Err(error))
            }
        };

        let reported = runner
            .status
            .update_step(runner.build_id, &description, status, recorded.as_deref())
            .await;
        match (reported, outcome) {
            (Err(e), Ok(())) => Err(StageError::Fatal(e)),
            (Err(e), Err(error)) => {
                tracing::warn!(build_id = runner.build_id, step = %description, "could not record step result: {e:#}");
                Err(error)
            }
            (Ok(()), outcome) => outcome,
        }
    }
}

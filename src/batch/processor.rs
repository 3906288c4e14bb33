//! Item processors: the per-item callback invoked by a run

use std::future::Future;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::batch::types::{Item, Outcome};
use crate::telemetry::correlation;

const STDERR_TAIL: usize = 512;

/// Processes one item and classifies the result
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Process `item`
    async fn process(&self, item: &Item) -> Outcome;
}

/// Adapter turning an async closure into an [`ItemProcessor`]
pub struct FnProcessor<F, Fut> {
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Wrap `func` as an item processor
pub fn processor_fn<F, Fut>(func: F) -> FnProcessor<F, Fut>
where
    F: Fn(Item) -> Fut + Send + Sync,
    Fut: Future<Output = Outcome> + Send,
{
    FnProcessor {
        func,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> ItemProcessor for FnProcessor<F, Fut>
where
    F: Fn(Item) -> Fut + Send + Sync,
    Fut: Future<Output = Outcome> + Send,
{
    async fn process(&self, item: &Item) -> Outcome {
        (self.func)(item.clone()).await
    }
}

/// Runs an external command once per item
///
/// The item key is appended as the last argument and the payload, when it is
/// a string, is exposed as `BATCHRUN_ITEM_PAYLOAD`. Exit status 0 is success,
/// the configured fatal code stops the run, any other status is retryable.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    fatal_exit_code: Option<i32>,
}

impl CommandProcessor {
    /// Processor running `program` with `args`
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            fatal_exit_code: None,
        }
    }

    /// Build from a full command line (`[program, args...]`)
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    /// Directory the command runs in
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Exit code that marks an item as fatal
    pub fn with_fatal_exit_code(mut self, code: i32) -> Self {
        self.fatal_exit_code = Some(code);
        self
    }

    fn command_for(&self, item: &Item) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&item.key)
            .env("BATCHRUN_ITEM_KEY", &item.key)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(payload) = item.payload.as_str() {
            command.env("BATCHRUN_ITEM_PAYLOAD", payload);
        } else if !item.payload.is_null() {
            command.env("BATCHRUN_ITEM_PAYLOAD", item.payload.to_string());
        }

        if let Some(fields) = correlation::current() {
            command
                .env("BATCHRUN_RUN_ID", &fields.run_id)
                .env("BATCHRUN_SOURCE_ID", &fields.source_id)
                .env("BATCHRUN_BATCH_SEQ", fields.batch_seq.to_string());
        }

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL.saturating_sub(1))
        .map_or(0, |(idx, _)| idx);
    text[start..].to_string()
}

#[async_trait]
impl ItemProcessor for CommandProcessor {
    async fn process(&self, item: &Item) -> Outcome {
        let output = match self.command_for(item).output().await {
            Ok(output) => output,
            Err(e) => {
                warn!(program = %self.program, error = %e, "Failed to spawn item command");
                return Outcome::fatal(format!("failed to spawn '{}': {}", self.program, e));
            }
        };

        if output.status.success() {
            debug!(item_key = %item.key, "Item command succeeded");
            return Outcome::Success;
        }

        let tail = stderr_tail(&output.stderr);
        let reason = match output.status.code() {
            Some(code) if tail.is_empty() => format!("exit code {}", code),
            Some(code) => format!("exit code {}: {}", code, tail),
            None => format!("terminated by signal: {}", tail),
        };

        match (output.status.code(), self.fatal_exit_code) {
            (Some(code), Some(fatal)) if code == fatal => Outcome::Fatal(reason),
            _ => Outcome::Retryable(reason),
        }
    }
}

//! Model executor: the single task that mutates the per-radio object model.
//!
//! Status lines and replies arrive on the session task, but the objects
//! they describe (slices, panadapters, streams, ...) belong to the caller's
//! model, which must only be written from one place. The dispatcher
//! therefore packages each update as a job and submits it here; jobs run
//! strictly in submission order.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use flexapi_core::{Property, ReplyField, ReplyFieldSink, StatusParser};

use crate::dispatcher::StatusKeyword;

/// A unit of work run against the [`Model`].
pub type ModelJob = Box<dyn FnOnce(&mut Model) + Send>;

/// Externally supplied model components, owned by the executor task.
#[derive(Default)]
pub struct Model {
    parsers: HashMap<StatusKeyword, Box<dyn StatusParser>>,
    reply_sink: Option<Box<dyn ReplyFieldSink>>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_parser(&mut self, keyword: StatusKeyword, parser: Box<dyn StatusParser>) {
        self.parsers.insert(keyword, parser);
    }

    pub fn set_reply_sink(&mut self, sink: Box<dyn ReplyFieldSink>) {
        self.reply_sink = Some(sink);
    }

    pub fn has_parser(&self, keyword: StatusKeyword) -> bool {
        self.parsers.contains_key(&keyword)
    }

    /// Forward a status line to its keyword's parser. Returns `false` when no
    /// parser is registered for the keyword.
    pub fn parse_status(
        &mut self,
        keyword: StatusKeyword,
        properties: &[Property],
        in_use: bool,
    ) -> bool {
        match self.parsers.get_mut(&keyword) {
            Some(parser) => {
                parser.parse_status(properties, in_use);
                true
            }
            None => false,
        }
    }

    pub fn apply_reply(&mut self, field: ReplyField, command: &str, text: &str) {
        if let Some(sink) = self.reply_sink.as_mut() {
            sink.apply(field, command, text);
        }
    }

    /// Clear every parser's state.
    pub fn clear(&mut self) {
        for parser in self.parsers.values_mut() {
            parser.clear();
        }
    }
}

/// Handle for submitting jobs to the executor task. Cheap to clone.
#[derive(Clone)]
pub struct ModelExecutor {
    tx: mpsc::UnboundedSender<ModelJob>,
}

impl ModelExecutor {
    /// Spawn the executor task. It runs until `cancel` fires or every
    /// handle is dropped.
    pub fn spawn(model: Model, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(executor_loop(model, rx, cancel));
        (Self { tx }, task)
    }

    /// Queue a job. Jobs submitted after the executor stopped are dropped.
    pub fn submit(&self, job: impl FnOnce(&mut Model) + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            tracing::debug!("Model executor stopped; job dropped");
        }
    }

    /// Wait until every job submitted before this call has run.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(move |_| {
            let _ = done_tx.send(());
        });
        let _ = done_rx.await;
    }
}

async fn executor_loop(
    mut model: Model,
    mut rx: mpsc::UnboundedReceiver<ModelJob>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!("Model executor cancelled");
                break;
            }

            job = rx.recv() => match job {
                Some(job) => job(&mut model),
                None => break,
            },
        }
    }
}

//! Command/reply correlation by sequence number.
//!
//! Every command sent on the TCP channel is registered here under its
//! sequence number before it is written. When the matching `R` line
//! arrives, the entry is removed and its callback (or the default handler)
//! runs exactly once. There is no per-command timeout: an entry that never
//! gets a reply stays until the connection is torn down and [`clear`]
//! drops it.
//!
//! [`clear`]: ReplyCorrelator::clear

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use flexapi_core::ReplyField;

use crate::codec::{ReplyLine, Severity};
use crate::executor::ModelExecutor;

/// A reply delivered to a waiting caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub sequence: u32,
    /// Text of the command this reply answers.
    pub command: String,
    /// Response code exactly as sent.
    pub code: String,
    pub error_code: u32,
    pub text: String,
    pub debug: Option<String>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.error_code == 0
    }
}

/// Callback run when a reply arrives.
pub type ReplyCallback = Box<dyn FnOnce(&Reply) + Send>;

/// Build a callback that forwards the reply into a oneshot channel.
pub fn reply_channel() -> (ReplyCallback, oneshot::Receiver<Reply>) {
    let (tx, rx) = oneshot::channel();
    let callback: ReplyCallback = Box::new(move |reply: &Reply| {
        let _ = tx.send(reply.clone());
    });
    (callback, rx)
}

struct PendingReply {
    command: String,
    callback: Option<ReplyCallback>,
}

/// Commands whose error replies are expected and not worth logging.
const QUIET_ERROR_PREFIXES: &[&str] = &[
    "ping",
    "sub ",
    "unsub ",
    "client udp_register",
    "display pan rfgain_info",
];

/// Successful replies routed to the model, by command prefix.
const REPLY_FIELDS: &[(&str, ReplyField)] = &[
    ("info", ReplyField::Info),
    ("version", ReplyField::Version),
    ("ant list", ReplyField::AntennaList),
    ("mic list", ReplyField::MicList),
    ("radio uptime", ReplyField::Uptime),
    ("profile global info", ReplyField::ProfileInfo),
    ("profile tx info", ReplyField::ProfileInfo),
    ("profile mic info", ReplyField::ProfileInfo),
    ("profile display info", ReplyField::ProfileInfo),
];

fn reply_field_for(command: &str) -> Option<ReplyField> {
    REPLY_FIELDS
        .iter()
        .find(|(prefix, _)| command.starts_with(prefix))
        .map(|(_, field)| *field)
}

/// Table of outstanding commands.
pub struct ReplyCorrelator {
    pending: Mutex<HashMap<u32, PendingReply>>,
    executor: ModelExecutor,
}

impl ReplyCorrelator {
    pub fn new(executor: ModelExecutor) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            executor,
        }
    }

    /// Record an outstanding command. Without a callback, the default
    /// handler processes the reply.
    pub fn register(&self, seq: u32, command: &str, callback: Option<ReplyCallback>) {
        self.pending.lock().insert(
            seq,
            PendingReply {
                command: command.to_string(),
                callback,
            },
        );
    }

    /// Forget a command whose write failed.
    pub fn discard(&self, seq: u32) {
        self.pending.lock().remove(&seq);
    }

    /// Deliver a reply. Returns `true` if a waiter was found.
    pub fn resolve(&self, line: ReplyLine) -> bool {
        let entry = self.pending.lock().remove(&line.sequence);

        let Some(entry) = entry else {
            if line.error_code != 0 {
                tracing::warn!(
                    seq = line.sequence,
                    code = %line.code,
                    text = %line.text,
                    "Unhandled error reply"
                );
            }
            return false;
        };

        let reply = Reply {
            sequence: line.sequence,
            command: entry.command,
            code: line.code,
            error_code: line.error_code,
            text: line.text,
            debug: line.debug,
        };

        match entry.callback {
            Some(callback) => callback(&reply),
            None => self.default_handler(&reply),
        }
        true
    }

    /// Drop every outstanding entry. Oneshot waiters observe a closed
    /// channel. Returns how many entries were dropped.
    pub fn clear(&self) -> usize {
        let mut pending = self.pending.lock();
        let n = pending.len();
        pending.clear();
        n
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, seq: u32) -> bool {
        self.pending.lock().contains_key(&seq)
    }

    fn default_handler(&self, reply: &Reply) {
        if reply.error_code != 0 {
            if QUIET_ERROR_PREFIXES
                .iter()
                .any(|p| reply.command.starts_with(p))
            {
                return;
            }
            let code = format!("0x{:08X}", reply.error_code);
            match Severity::from_code(reply.error_code) {
                Severity::Info => {
                    tracing::info!(command = %reply.command, code = %code, text = %reply.text, "Command reply")
                }
                Severity::Warning => {
                    tracing::warn!(command = %reply.command, code = %code, text = %reply.text, "Command failed")
                }
                Severity::Error | Severity::Fatal => {
                    tracing::error!(command = %reply.command, code = %code, text = %reply.text, "Command failed")
                }
            }
            return;
        }

        if let Some(field) = reply_field_for(&reply.command) {
            let command = reply.command.clone();
            let text = reply.text.clone();
            self.executor
                .submit(move |model| model.apply_reply(field, &command, &text));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use flexapi_core::ReplyFieldSink;
    use tokio_util::sync::CancellationToken;

    use crate::codec::parse_reply;
    use crate::executor::Model;

    fn correlator() -> ReplyCorrelator {
        let (exec, _task) = ModelExecutor::spawn(Model::new(), CancellationToken::new());
        ReplyCorrelator::new(exec)
    }

    #[tokio::test]
    async fn callback_runs_exactly_once() {
        let c = correlator();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));

        let calls2 = calls.clone();
        let seen2 = seen.clone();
        c.register(
            5,
            "info",
            Some(Box::new(move |r: &Reply| {
                calls2.fetch_add(1, Ordering::SeqCst);
                *seen2.lock() = Some(r.clone());
            })),
        );

        assert!(c.resolve(parse_reply("5|0|key1=val1,key2=val2").unwrap()));
        assert!(!c.resolve(parse_reply("5|0|again").unwrap()));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let reply = seen.lock().clone().unwrap();
        assert_eq!(reply.sequence, 5);
        assert_eq!(reply.command, "info");
        assert_eq!(reply.code, "0");
        assert_eq!(reply.text, "key1=val1,key2=val2");
        assert_eq!(c.pending_count(), 0);
    }

    #[test]
    fn correlator_is_shareable_across_tasks() {
        fn shareable<T: Send + Sync>() {}
        shareable::<ReplyCorrelator>();
        shareable::<crate::tcp::TcpChannel>();
    }

    #[tokio::test]
    async fn unknown_sequence_is_ignored() {
        let c = correlator();
        assert!(!c.resolve(parse_reply("99|0|").unwrap()));
        assert!(!c.resolve(parse_reply("99|50000015|bad").unwrap()));
    }

    #[tokio::test]
    async fn oneshot_waiter() {
        let c = correlator();
        let (cb, rx) = reply_channel();
        c.register(1, "slice list", Some(cb));
        c.resolve(parse_reply("1|0|0 1").unwrap());
        let reply = rx.await.unwrap();
        assert_eq!(reply.text, "0 1");
    }

    #[tokio::test]
    async fn clear_drops_waiters() {
        let c = correlator();
        let (cb, rx) = reply_channel();
        c.register(1, "info", Some(cb));
        c.register(2, "version", None);
        assert_eq!(c.clear(), 2);
        assert!(rx.await.is_err());
        assert_eq!(c.pending_count(), 0);
    }

    /// Unanswered commands are never expired; the table only shrinks on
    /// teardown. This documents the growth.
    #[tokio::test]
    async fn unanswered_commands_accumulate_until_clear() {
        let c = correlator();
        for seq in 0..100 {
            c.register(seq, "sub slice all", None);
        }
        assert_eq!(c.pending_count(), 100);
        c.clear();
        assert_eq!(c.pending_count(), 0);
    }

    struct FieldRecorder(Arc<Mutex<Vec<(ReplyField, String)>>>);

    impl ReplyFieldSink for FieldRecorder {
        fn apply(&mut self, field: ReplyField, _command: &str, text: &str) {
            self.0.lock().push((field, text.to_string()));
        }
    }

    #[tokio::test]
    async fn default_handler_routes_fields() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut model = Model::new();
        model.set_reply_sink(Box::new(FieldRecorder(seen.clone())));
        let (exec, _task) = ModelExecutor::spawn(model, CancellationToken::new());
        let c = ReplyCorrelator::new(exec.clone());

        c.register(0, "info", None);
        c.register(1, "ant list", None);
        c.register(2, "sub slice all", None);
        c.register(3, "version", None);
        c.resolve(parse_reply("0|0|model=FLEX-6600").unwrap());
        c.resolve(parse_reply("1|0|ANT1,ANT2").unwrap());
        c.resolve(parse_reply("2|0|").unwrap());
        // error replies are never routed as fields
        c.resolve(parse_reply("3|50000015|nope").unwrap());
        exec.flush().await;

        assert_eq!(
            *seen.lock(),
            vec![
                (ReplyField::Info, "model=FLEX-6600".to_string()),
                (ReplyField::AntennaList, "ANT1,ANT2".to_string()),
            ]
        );
    }

    #[test]
    fn field_table_prefixes() {
        assert_eq!(reply_field_for("info"), Some(ReplyField::Info));
        assert_eq!(reply_field_for("mic list"), Some(ReplyField::MicList));
        assert_eq!(reply_field_for("profile tx info"), Some(ReplyField::ProfileInfo));
        assert_eq!(reply_field_for("profile global load Default"), None);
        assert_eq!(reply_field_for("slice list"), None);
    }
}

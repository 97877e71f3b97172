use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tracing::debug;

use super::Transport;
use super::relay::RelayMessage;
use crate::dispatch::AttemptOutcome;
use crate::render::Payload;

/// Writes each message as a JSON file into a directory instead of sending it.
///
/// Used for dry runs and for handing messages to an external mailer. Write
/// errors are reported as transient failures.
pub struct OutboxTransport {
    dir: PathBuf,
    sender: String,
    sequence: AtomicU64,
}

impl OutboxTransport {
    pub fn new(dir: impl Into<PathBuf>, sender: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            sender: sender.into(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(&self, recipient: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let safe: String = recipient
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
            .collect();
        format!("{}-{seq:04}-{safe}.json", Utc::now().format("%Y%m%dT%H%M%S"))
    }
}

impl Transport for OutboxTransport {
    async fn send(&self, recipient: &str, payload: &Payload) -> AttemptOutcome {
        let message = RelayMessage {
            from: self.sender.clone(),
            to: recipient.to_string(),
            subject: payload.subject.clone(),
            html: payload.body.clone(),
        };
        let bytes = match serde_json::to_vec_pretty(&message) {
            Ok(bytes) => bytes,
            Err(e) => return AttemptOutcome::PermanentFailure(e.to_string()),
        };
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            return AttemptOutcome::TransientFailure(format!("outbox unavailable: {e}"));
        }
        let path = self.dir.join(self.file_name(recipient));
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => {
                debug!(path = %path.display(), "Message written to outbox");
                AttemptOutcome::Success
            }
            Err(e) => AttemptOutcome::TransientFailure(format!("outbox write failed: {e}")),
        }
    }
}

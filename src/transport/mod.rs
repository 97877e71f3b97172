pub mod error;
pub mod outbox;
pub mod relay;

use std::future::Future;

pub use outbox::OutboxTransport;
pub use relay::RelayTransport;

use crate::dispatch::AttemptOutcome;
use crate::render::Payload;

/// Delivers one rendered message to one recipient.
///
/// Implementations classify their own failures as transient or permanent and
/// must return within a bounded time; the scheduler waits for every call.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        recipient: &str,
        payload: &Payload,
    ) -> impl Future<Output = AttemptOutcome> + Send;
}

/// Either configured transport, picked at runtime from the config file.
pub enum AnyTransport {
    Relay(RelayTransport),
    Outbox(OutboxTransport),
}

impl Transport for AnyTransport {
    async fn send(&self, recipient: &str, payload: &Payload) -> AttemptOutcome {
        match self {
            AnyTransport::Relay(t) => t.send(recipient, payload).await,
            AnyTransport::Outbox(t) => t.send(recipient, payload).await,
        }
    }
}

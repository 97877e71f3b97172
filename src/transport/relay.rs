use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Transport;
use super::error::RelayError;
use crate::dispatch::AttemptOutcome;
use crate::render::Payload;

/// Request body accepted by the mail relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Delivers messages by POSTing them to an HTTP mail relay.
pub struct RelayTransport {
    endpoint: String,
    api_token: String,
    sender: String,
    client: Client,
}

impl RelayTransport {
    pub fn new(endpoint: String, api_token: String, sender: String) -> Result<Self, RelayError> {
        // Timeouts bound every send so a hung relay cannot stall the scheduler.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            endpoint,
            api_token,
            sender,
            client,
        })
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub async fn deliver(&self, recipient: &str, payload: &Payload) -> Result<(), RelayError> {
        let message = RelayMessage {
            from: self.sender.clone(),
            to: recipient.to_string(),
            subject: payload.subject.clone(),
            html: payload.body.clone(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_token)
            .json(&message)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1000))
                .unwrap_or(1000);
            return Err(RelayError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(RelayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        debug!(recipient = %recipient, status = status.as_u16(), "Relay accepted message");
        Ok(())
    }
}

impl Transport for RelayTransport {
    async fn send(&self, recipient: &str, payload: &Payload) -> AttemptOutcome {
        match self.deliver(recipient, payload).await {
            Ok(()) => AttemptOutcome::Success,
            Err(e) => e.into_outcome(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> Payload {
        Payload {
            subject: "Statement".into(),
            body: "<p>hi</p>".into(),
        }
    }

    async fn transport_for(server: &MockServer) -> RelayTransport {
        RelayTransport::new(
            format!("{}/send", server.uri()),
            "tok-123".into(),
            "billing@acme.com".into(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn success_posts_message_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .and(bearer_token("tok-123"))
            .and(body_partial_json(serde_json::json!({
                "from": "billing@acme.com",
                "to": "ops@client.com",
                "subject": "Statement"
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport_for(&server).await;
        let outcome = transport.send("ops@client.com", &payload()).await;
        assert_eq!(outcome, AttemptOutcome::Success);
    }

    #[tokio::test]
    async fn throttling_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let transport = transport_for(&server).await;
        let outcome = transport.send("ops@client.com", &payload()).await;
        assert_eq!(
            outcome,
            AttemptOutcome::TransientFailure("rate limited, retry after 7000ms".into())
        );
    }

    #[tokio::test]
    async fn oversized_retry_after_saturates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429).insert_header("retry-after", "18446744073709552"),
            )
            .mount(&server)
            .await;

        let transport = transport_for(&server).await;
        let outcome = transport.send("ops@client.com", &payload()).await;
        assert_eq!(
            outcome,
            AttemptOutcome::TransientFailure(format!("rate limited, retry after {}ms", u64::MAX))
        );
    }

    #[tokio::test]
    async fn bad_recipient_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("mailbox unavailable"))
            .mount(&server)
            .await;

        let transport = transport_for(&server).await;
        let outcome = transport.send("nobody@client.com", &payload()).await;
        assert_eq!(
            outcome,
            AttemptOutcome::PermanentFailure(
                "relay error (status 400): mailbox unavailable".into()
            )
        );
    }

    #[tokio::test]
    async fn unreachable_relay_is_transient() {
        // Nothing listens on port 9 locally.
        let transport = RelayTransport::new(
            "http://127.0.0.1:9/send".into(),
            "tok".into(),
            "billing@acme.com".into(),
        )
        .unwrap();
        let outcome = transport.send("ops@client.com", &payload()).await;
        assert!(matches!(outcome, AttemptOutcome::TransientFailure(_)));
    }
}

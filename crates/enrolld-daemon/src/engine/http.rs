//! Outbound HTTP adapters for the external collaborators.
//!
//! Thin JSON-over-HTTP clients for the submission (browser automation),
//! payment, and notification services. Responses are parsed into the tagged
//! outcome enums at the boundary; unknown shapes are transport errors, never
//! guessed at. `ureq` is blocking, so every call runs on the blocking
//! thread pool; the engine adds its own hard timeout on top.

use std::time::Duration;

use async_trait::async_trait;
use enrolld_core::request::RegistrationRequest;
use serde_json::{Value, json};
use ureq::Agent;

use super::collaborators::{
    CollaboratorError, Notifier, PaymentClient, PaymentOutcome, SubmissionClient, SubmissionOutcome,
};

fn agent(timeout: Duration) -> Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

async fn post_json<T>(agent: Agent, url: String, body: Value) -> Result<T, CollaboratorError>
where
    T: serde::de::DeserializeOwned + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let response = agent
            .post(&url)
            .send_json(body)
            .map_err(|err| CollaboratorError::new(err.to_string()))?;
        response
            .into_json::<T>()
            .map_err(|err| CollaboratorError::new(format!("invalid response body: {err}")))
    })
    .await
    .map_err(|err| CollaboratorError::new(format!("worker join failed: {err}")))?
}

/// Submission service client.
pub struct HttpSubmissionClient {
    agent: Agent,
    url: String,
}

impl HttpSubmissionClient {
    /// Creates a client posting to `url` with the given per-call timeout.
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            agent: agent(timeout),
            url: url.into(),
        }
    }
}

#[async_trait]
impl SubmissionClient for HttpSubmissionClient {
    async fn submit(
        &self,
        request: &RegistrationRequest,
    ) -> Result<SubmissionOutcome, CollaboratorError> {
        let body = json!({
            "request_id": request.request_id,
            "session_id": request.session_id,
            "user_id": request.user_id,
            "dependent_id": request.dependent_id,
            "priority": request.priority,
        });
        post_json(self.agent.clone(), self.url.clone(), body).await
    }
}

/// Payment processor client.
pub struct HttpPaymentClient {
    agent: Agent,
    url: String,
}

impl HttpPaymentClient {
    /// Creates a client posting to `url` with the given per-call timeout.
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            agent: agent(timeout),
            url: url.into(),
        }
    }
}

#[async_trait]
impl PaymentClient for HttpPaymentClient {
    async fn capture(
        &self,
        idempotency_key: &str,
        amount_cents: i64,
    ) -> Result<PaymentOutcome, CollaboratorError> {
        let body = json!({
            "idempotency_key": idempotency_key,
            "amount_cents": amount_cents,
        });
        post_json(self.agent.clone(), self.url.clone(), body).await
    }
}

/// Notification delivery client.
pub struct HttpNotifier {
    agent: Agent,
    url: String,
}

impl HttpNotifier {
    /// Creates a client posting to `url` with the given per-call timeout.
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            agent: agent(timeout),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(
        &self,
        user_id: &str,
        kind: &str,
        payload: &Value,
    ) -> Result<(), CollaboratorError> {
        let body = json!({
            "user_id": user_id,
            "kind": kind,
            "payload": payload,
        });
        let agent = self.agent.clone();
        let url = self.url.clone();
        tokio::task::spawn_blocking(move || {
            agent
                .post(&url)
                .send_json(body)
                .map(|_| ())
                .map_err(|err| CollaboratorError::new(err.to_string()))
        })
        .await
        .map_err(|err| CollaboratorError::new(format!("worker join failed: {err}")))?
    }
}

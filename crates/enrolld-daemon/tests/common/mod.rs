//! Shared harness for daemon integration tests: in-memory store, scripted
//! collaborator fakes, and seeding helpers.
//!
//! The fakes are scripted per request id, never randomized: a test states
//! exactly which submission/payment outcomes each request will see, in
//! order, and the default (unscripted) behavior is plain success.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use enrolld_core::config::EngineConfig;
use enrolld_core::request::RegistrationRequest;
use enrolld_core::retry::{BackoffConfig, RetryPolicy};
use enrolld_core::session::{Session, SessionStatus};
use enrolld_core::token::TokenService;
use enrolld_daemon::engine::Engine;
use enrolld_daemon::engine::collaborators::{
    CollaboratorError, Notifier, PaymentClient, PaymentOutcome, SubmissionClient, SubmissionOutcome,
};
use enrolld_daemon::store::Store;
use secrecy::SecretString;
use serde_json::Value;

/// Fixed test epoch; sessions open here and cycles run relative to it.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
}

/// Scripted submission collaborator.
#[derive(Default)]
pub struct ScriptedSubmission {
    scripts: Mutex<HashMap<String, VecDeque<SubmissionOutcome>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSubmission {
    /// Queues the next outcome for a request id.
    pub fn script(&self, request_id: &str, outcome: SubmissionOutcome) {
        self.scripts
            .lock()
            .unwrap()
            .entry(request_id.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Request ids submitted so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of submission attempts for one request.
    pub fn call_count(&self, request_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == request_id)
            .count()
    }
}

#[async_trait]
impl SubmissionClient for ScriptedSubmission {
    async fn submit(
        &self,
        request: &RegistrationRequest,
    ) -> Result<SubmissionOutcome, CollaboratorError> {
        self.calls.lock().unwrap().push(request.request_id.clone());
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.request_id)
            .and_then(VecDeque::pop_front);
        Ok(scripted.unwrap_or(SubmissionOutcome::Confirmed))
    }
}

/// One scripted payment behavior.
pub enum PaymentScript {
    /// Capture succeeds with this processor reference.
    Capture(&'static str),
    /// Processor declines.
    Decline(&'static str),
    /// The call never returns; the engine's hard timeout must fire.
    Hang,
}

/// Scripted payment collaborator.
#[derive(Default)]
pub struct ScriptedPayment {
    scripts: Mutex<HashMap<String, VecDeque<PaymentScript>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedPayment {
    /// Queues the next behavior for an idempotency key (request id).
    pub fn script(&self, request_id: &str, script: PaymentScript) {
        self.scripts
            .lock()
            .unwrap()
            .entry(request_id.to_string())
            .or_default()
            .push_back(script);
    }

    /// Number of capture calls for one request.
    pub fn call_count(&self, request_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == request_id)
            .count()
    }
}

#[async_trait]
impl PaymentClient for ScriptedPayment {
    async fn capture(
        &self,
        idempotency_key: &str,
        _amount_cents: i64,
    ) -> Result<PaymentOutcome, CollaboratorError> {
        self.calls.lock().unwrap().push(idempotency_key.to_string());
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(idempotency_key)
            .and_then(VecDeque::pop_front);
        match scripted {
            None => Ok(PaymentOutcome::Captured {
                reference: format!("psp-{idempotency_key}"),
            }),
            Some(PaymentScript::Capture(reference)) => Ok(PaymentOutcome::Captured {
                reference: reference.to_string(),
            }),
            Some(PaymentScript::Decline(cause)) => Ok(PaymentOutcome::Failed {
                reason: cause.to_string(),
            }),
            Some(PaymentScript::Hang) => {
                // Far longer than any configured charge timeout.
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(CollaboratorError::new("unreachable"))
            },
        }
    }
}

/// One recorded notification.
#[derive(Debug, Clone)]
pub struct NotifyEvent {
    pub user_id: String,
    pub kind: String,
    pub payload: Value,
}

/// Recording notifier; can be flipped to fail every delivery.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotifyEvent>>,
    fail_deliveries: Mutex<bool>,
}

impl RecordingNotifier {
    /// Makes every subsequent delivery fail (best-effort path test).
    pub fn fail_deliveries(&self) {
        *self.fail_deliveries.lock().unwrap() = true;
    }

    /// All recorded events in dispatch order.
    pub fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Kinds dispatched for requests (attempted, even if delivery failed).
    pub fn kinds(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.kind.clone())
            .collect()
    }

    /// The resume token from the latest `action_required` payload.
    pub fn latest_resume_token(&self) -> Option<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|event| event.kind == "action_required")
            .and_then(|event| event.payload.get("resume_token"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        user_id: &str,
        kind: &str,
        payload: &Value,
    ) -> Result<(), CollaboratorError> {
        self.events.lock().unwrap().push(NotifyEvent {
            user_id: user_id.to_string(),
            kind: kind.to_string(),
            payload: payload.clone(),
        });
        if *self.fail_deliveries.lock().unwrap() {
            return Err(CollaboratorError::new("delivery refused"));
        }
        Ok(())
    }
}

/// Everything a test needs to drive the engine deterministically.
pub struct Harness {
    pub store: Store,
    pub engine: Arc<Engine>,
    pub submission: Arc<ScriptedSubmission>,
    pub payment: Arc<ScriptedPayment>,
    pub notifier: Arc<RecordingNotifier>,
}

/// Engine config tuned for fast, deterministic tests.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        submission_timeout: Duration::from_millis(200),
        charge_timeout: Duration::from_millis(200),
        retry: RetryPolicy {
            max_attempts: 2,
            backoff: BackoffConfig::Fixed {
                delay: Duration::from_secs(120),
            },
        },
        ..EngineConfig::default()
    }
}

/// Builds a harness over an in-memory store.
pub fn harness(config: EngineConfig) -> Harness {
    let store = Store::open_in_memory().expect("in-memory store");
    let tokens =
        TokenService::new(&SecretString::new(hex::encode([0x42u8; 32]))).expect("token service");
    let submission = Arc::new(ScriptedSubmission::default());
    let payment = Arc::new(ScriptedPayment::default());
    let notifier = Arc::new(RecordingNotifier::default());

    let engine = Arc::new(Engine::new(
        store.clone(),
        tokens,
        config,
        Arc::clone(&submission) as Arc<dyn SubmissionClient>,
        Arc::clone(&payment) as Arc<dyn PaymentClient>,
        Arc::clone(&notifier) as Arc<dyn Notifier>,
    ));

    Harness {
        store,
        engine,
        submission,
        payment,
        notifier,
    }
}

impl Harness {
    /// Seeds an open session with the given capacity.
    pub fn seed_session(&self, session_id: &str, capacity: u32) {
        self.store
            .upsert_session(&Session {
                session_id: session_id.to_string(),
                capacity,
                opens_at: t0(),
                price_cents: 12_500,
                status: SessionStatus::Open,
            })
            .expect("seed session");
    }

    /// Seeds a pending request; `offset_secs` orders `requested_at`.
    pub fn seed_request(
        &self,
        request_id: &str,
        user_id: &str,
        dependent_id: &str,
        session_id: &str,
        priority: bool,
        offset_secs: i64,
    ) {
        let request = RegistrationRequest::new(
            request_id,
            user_id,
            dependent_id,
            session_id,
            priority,
            t0() + chrono::Duration::seconds(offset_secs),
        );
        self.store.insert_request(&request).expect("seed request");
    }

    /// Current status of a request, as stored.
    pub fn status_of(&self, request_id: &str) -> enrolld_core::request::RequestStatus {
        self.store
            .request(request_id)
            .expect("load request")
            .expect("request exists")
            .status
    }
}

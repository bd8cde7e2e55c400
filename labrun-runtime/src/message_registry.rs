//! Message Subscriber Registry (spec §4.J).
//!
//! Spec §9 calls out the original's reflection/annotation-based subscriber
//! scanner and asks for "a registry that stores `{messageTypeId →
//! subscriberFn}` produced ... by an explicit registration call; the
//! behavioral contract in §4.J is preserved." This is that: no scanning, no
//! generic message-event wrapper type — just a map from a message type id to
//! a boxed handler, populated by [`MessageSubscriberRegistry::register`].

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{instrument, warn};

/// The wire envelope dispatched to subscribers: analogous to an `Any`-typed
/// protobuf `MessageSend`, but carrying a `type_id` tag directly instead of
/// relying on a type-url convention.
#[derive(Clone, Debug)]
pub struct MessageSend {
    pub type_id: String,
    pub payload: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("subscriber for message type {0} returned an error")]
    HandlerFailed(String, #[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type SubscriberFn =
    Box<dyn Fn(&Value) -> Result<Value, SubscriberError> + Send + Sync>;

/// One dispatch attempt's outcome, recorded for observability the way the
/// original's reception records did.
#[derive(Clone, Debug)]
pub struct ReceptionRecord {
    pub type_id: String,
    pub started_at: chrono::DateTime<chrono::Local>,
    pub ended_at: chrono::DateTime<chrono::Local>,
    pub outcome: ReceptionOutcome,
}

#[derive(Clone, Debug)]
pub enum ReceptionOutcome {
    Success(Value),
    SubscriberError(String),
    NoSubscriber,
}

/// Registered subscribers, keyed by message type id. Dispatch invokes every
/// subscriber registered for an incoming message's type sequentially,
/// capturing each invocation into a [`ReceptionRecord`] rather than letting
/// one subscriber's error abort the others.
#[derive(Default)]
pub struct MessageSubscriberRegistry {
    subscribers: Mutex<HashMap<String, Vec<SubscriberFn>>>,
}

impl MessageSubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `type_id`. Multiple subscribers may be
    /// registered for the same type; all run on dispatch.
    pub fn register(&self, type_id: impl Into<String>, handler: SubscriberFn) {
        self.subscribers
            .lock()
            .expect("subscriber map lock poisoned")
            .entry(type_id.into())
            .or_default()
            .push(handler);
    }

    pub fn is_registered(&self, type_id: &str) -> bool {
        self.subscribers
            .lock()
            .expect("subscriber map lock poisoned")
            .contains_key(type_id)
    }

    /// Invokes every subscriber registered for `message.type_id` in
    /// registration order, recording a [`ReceptionRecord`] per invocation. A
    /// message with no registered subscriber produces a single
    /// `NoSubscriber` record and is otherwise a no-op (spec §4.J: shapes
    /// other than the declared one are *invalid subscribers*, recorded, not
    /// fatal — absence of any subscriber is the dispatch-time analogue).
    #[instrument(level = "debug", skip(self, message), fields(type_id = %message.type_id))]
    pub fn dispatch(&self, message: &MessageSend) -> Vec<ReceptionRecord> {
        let handlers_len = {
            let subscribers = self.subscribers.lock().expect("subscriber map lock poisoned");
            subscribers.get(&message.type_id).map_or(0, Vec::len)
        };

        if handlers_len == 0 {
            warn!(type_id = %message.type_id, "no subscriber registered for message type");
            return vec![ReceptionRecord {
                type_id: message.type_id.clone(),
                started_at: chrono::Local::now(),
                ended_at: chrono::Local::now(),
                outcome: ReceptionOutcome::NoSubscriber,
            }];
        }

        let mut records = Vec::with_capacity(handlers_len);
        for index in 0..handlers_len {
            let started_at = chrono::Local::now();
            // Re-lock per subscriber rather than holding the lock across the
            // call: a subscriber must be free to register more subscribers
            // of its own without deadlocking.
            let outcome = {
                let subscribers = self.subscribers.lock().expect("subscriber map lock poisoned");
                let handler = &subscribers.get(&message.type_id).expect("handler list shrank mid-dispatch")[index];
                handler(&message.payload)
            };
            let ended_at = chrono::Local::now();
            let outcome = match outcome {
                Ok(response) => ReceptionOutcome::Success(response),
                Err(error) => {
                    warn!(type_id = %message.type_id, %error, "subscriber invocation failed");
                    ReceptionOutcome::SubscriberError(error.to_string())
                }
            };
            records.push(ReceptionRecord {
                type_id: message.type_id.clone(),
                started_at,
                ended_at,
                outcome,
            });
        }
        records
    }
}

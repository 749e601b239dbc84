//! Routes decoded notifications to the one handler registered for their
//! type, skipping replays of ids already processed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::protocol::Envelope;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HandlerError {
    pub fn payload(kind: impl Into<String>, source: serde_json::Error) -> Self {
        HandlerError::Payload {
            kind: kind.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("a handler for {0} is already registered")]
    AlreadyRegistered(String),
}

pub trait NotificationHandler: Send + Sync {
    fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

impl<F> NotificationHandler for F
where
    F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        self(envelope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    Duplicate,
    Unrouted,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub handled: u64,
    pub duplicates: u64,
    pub unrouted: u64,
    pub failed: u64,
}

struct Route {
    token: u64,
    handler: Arc<dyn NotificationHandler>,
}

struct DispatcherInner {
    routes: Mutex<HashMap<String, Route>>,
    last_notification_id: AtomicU64,
    next_token: AtomicU64,
    stats: Mutex<DispatchStats>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                routes: Mutex::new(HashMap::new()),
                last_notification_id: AtomicU64::new(0),
                next_token: AtomicU64::new(1),
                stats: Mutex::new(DispatchStats::default()),
            }),
        }
    }

    /// Route `kind` to `handler` until the returned registration is dropped.
    pub fn register<H>(
        &self,
        kind: impl Into<String>,
        handler: H,
    ) -> Result<HandlerRegistration, DispatchError>
    where
        H: NotificationHandler + 'static,
    {
        let kind = kind.into();
        let mut routes = self.inner.routes.lock();
        if routes.contains_key(&kind) {
            return Err(DispatchError::AlreadyRegistered(kind));
        }
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        routes.insert(
            kind.clone(),
            Route {
                token,
                handler: Arc::new(handler),
            },
        );
        debug!(target = "busline::dispatch", kind = %kind, "handler registered");
        Ok(HandlerRegistration {
            kind,
            token,
            dispatcher: Arc::downgrade(&self.inner),
        })
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.inner.routes.lock().contains_key(kind)
    }

    /// Highest notification id seen so far; sent back to the server on
    /// reconnect to request replay.
    pub fn last_notification_id(&self) -> u64 {
        self.inner.last_notification_id.load(Ordering::Acquire)
    }

    /// Seed the high-water mark, e.g. from the id the server reported at
    /// subscribe time. Never moves it backwards.
    pub fn set_last_notification_id(&self, id: u64) {
        self.inner
            .last_notification_id
            .fetch_max(id, Ordering::AcqRel);
    }

    pub fn stats(&self) -> DispatchStats {
        *self.inner.stats.lock()
    }

    pub fn dispatch(&self, envelope: &Envelope) -> DispatchOutcome {
        let outcome = self.route(envelope);
        let mut stats = self.inner.stats.lock();
        match outcome {
            DispatchOutcome::Handled => stats.handled += 1,
            DispatchOutcome::Duplicate => stats.duplicates += 1,
            DispatchOutcome::Unrouted => stats.unrouted += 1,
            DispatchOutcome::Failed => stats.failed += 1,
        }
        outcome
    }

    fn route(&self, envelope: &Envelope) -> DispatchOutcome {
        let previous = self
            .inner
            .last_notification_id
            .fetch_max(envelope.id, Ordering::AcqRel);
        if envelope.id <= previous {
            trace!(
                target = "busline::dispatch",
                id = envelope.id,
                last = previous,
                "skipping replayed notification"
            );
            return DispatchOutcome::Duplicate;
        }

        let handler = self
            .inner
            .routes
            .lock()
            .get(&envelope.kind)
            .map(|route| Arc::clone(&route.handler));
        let Some(handler) = handler else {
            warn!(
                target = "busline::dispatch",
                id = envelope.id,
                kind = %envelope.kind,
                "no handler for notification type"
            );
            return DispatchOutcome::Unrouted;
        };

        match handler.handle(envelope) {
            Ok(()) => {
                trace!(
                    target = "busline::dispatch",
                    id = envelope.id,
                    kind = %envelope.kind,
                    "handled"
                );
                DispatchOutcome::Handled
            }
            Err(err) => {
                warn!(
                    target = "busline::dispatch",
                    id = envelope.id,
                    kind = %envelope.kind,
                    error = %err,
                    "notification handler failed"
                );
                DispatchOutcome::Failed
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.inner.routes.lock().keys().cloned().collect();
        kinds.sort();
        f.debug_struct("Dispatcher")
            .field("kinds", &kinds)
            .field("last_notification_id", &self.last_notification_id())
            .finish()
    }
}

/// Keeps a handler routed; dropping it unregisters.
#[must_use = "dropping a HandlerRegistration unregisters the handler"]
pub struct HandlerRegistration {
    kind: String,
    token: u64,
    dispatcher: Weak<DispatcherInner>,
}

impl HandlerRegistration {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn unregister(self) {}
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for HandlerRegistration {
    fn drop(&mut self) {
        let Some(inner) = self.dispatcher.upgrade() else {
            return;
        };
        let mut routes = inner.routes.lock();
        if routes
            .get(&self.kind)
            .is_some_and(|route| route.token == self.token)
        {
            routes.remove(&self.kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counting(
        dispatcher: &Dispatcher,
        kind: &str,
    ) -> (Arc<Mutex<Vec<u64>>>, HandlerRegistration) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let registration = dispatcher
            .register(kind, move |envelope: &Envelope| -> Result<(), HandlerError> {
                sink.lock().push(envelope.id);
                Ok(())
            })
            .expect("register");
        (seen, registration)
    }

    #[test]
    fn routes_by_kind_and_skips_replays() {
        let dispatcher = Dispatcher::new();
        let (seen, _registration) = counting(&dispatcher, "ping");

        assert_eq!(
            dispatcher.dispatch(&Envelope::new(1, "ping", json!({}))),
            DispatchOutcome::Handled
        );
        assert_eq!(
            dispatcher.dispatch(&Envelope::new(2, "ping", json!({}))),
            DispatchOutcome::Handled
        );
        assert_eq!(
            dispatcher.dispatch(&Envelope::new(2, "ping", json!({}))),
            DispatchOutcome::Duplicate
        );
        assert_eq!(
            dispatcher.dispatch(&Envelope::new(1, "ping", json!({}))),
            DispatchOutcome::Duplicate
        );
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(dispatcher.last_notification_id(), 2);
    }

    #[test]
    fn unknown_types_are_unrouted_but_advance_the_mark() {
        let dispatcher = Dispatcher::new();
        assert_eq!(
            dispatcher.dispatch(&Envelope::new(5, "mystery", json!(null))),
            DispatchOutcome::Unrouted
        );
        assert_eq!(dispatcher.last_notification_id(), 5);
        assert_eq!(dispatcher.stats().unrouted, 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let dispatcher = Dispatcher::new();
        let (_seen, _registration) = counting(&dispatcher, "ping");
        let again =
            dispatcher.register("ping", |_: &Envelope| -> Result<(), HandlerError> { Ok(()) });
        assert!(matches!(again, Err(DispatchError::AlreadyRegistered(kind)) if kind == "ping"));
    }

    #[test]
    fn dropping_the_registration_unregisters() {
        let dispatcher = Dispatcher::new();
        let (_seen, registration) = counting(&dispatcher, "ping");
        registration.unregister();
        assert!(!dispatcher.is_registered("ping"));
        assert_eq!(
            dispatcher.dispatch(&Envelope::new(1, "ping", json!({}))),
            DispatchOutcome::Unrouted
        );
        let _registration = dispatcher
            .register("ping", |_: &Envelope| -> Result<(), HandlerError> { Ok(()) })
            .expect("register again");
    }

    #[test]
    fn handler_errors_do_not_propagate() {
        let dispatcher = Dispatcher::new();
        let _registration = dispatcher
            .register("bad", |envelope: &Envelope| -> Result<(), HandlerError> {
                serde_json::from_value::<u64>(envelope.payload.clone())
                    .map(|_| ())
                    .map_err(|err| HandlerError::payload("bad", err))
            })
            .expect("register");
        assert_eq!(
            dispatcher.dispatch(&Envelope::new(1, "bad", json!("nope"))),
            DispatchOutcome::Failed
        );
        assert_eq!(
            dispatcher.dispatch(&Envelope::new(2, "bad", json!(3))),
            DispatchOutcome::Handled
        );
        assert_eq!(
            dispatcher.stats(),
            DispatchStats {
                handled: 1,
                failed: 1,
                ..DispatchStats::default()
            }
        );
    }

    #[test]
    fn seeded_mark_never_moves_back() {
        let dispatcher = Dispatcher::new();
        dispatcher.set_last_notification_id(10);
        dispatcher.set_last_notification_id(4);
        assert_eq!(dispatcher.last_notification_id(), 10);
        assert_eq!(
            dispatcher.dispatch(&Envelope::new(9, "ping", json!({}))),
            DispatchOutcome::Duplicate
        );
    }
}

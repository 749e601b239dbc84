//! Connection health derived from transport lifecycle events and the OS
//! online/offline signal.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

mod machine;

pub use machine::{Effect, HealthMachine, MonitorInput, TimerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Stable,
    Unstable,
    Lost,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Stable => "stable",
            ConnectionState::Unstable => "unstable",
            ConnectionState::Lost => "lost",
        }
    }

    /// Whether a "connection issues" indicator should be shown.
    pub fn is_degraded(self) -> bool {
        matches!(self, ConnectionState::Unstable | ConnectionState::Lost)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy thresholds for the health machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub grace_period: Duration,
    pub stability_threshold: Duration,
    pub max_reconnect_attempts: u32,
    pub lost_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(1_500),
            stability_threshold: Duration::from_secs(10),
            max_reconnect_attempts: 3,
            lost_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub at: Instant,
}

type Listener = Arc<dyn Fn(StateTransition) + Send + Sync>;

/// Runs the [`HealthMachine`] against the tokio clock.
///
/// Cheap to clone; all clones observe the same machine.
#[derive(Clone)]
pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    core: Mutex<MonitorCore>,
    state_tx: watch::Sender<ConnectionState>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
}

struct MonitorCore {
    machine: HealthMachine,
    timers: [Option<JoinHandle<()>>; 3],
}

impl ConnectionMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(MonitorInner {
                core: Mutex::new(MonitorCore {
                    machine: HealthMachine::new(config),
                    timers: [None, None, None],
                }),
                state_tx,
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn last_stable_at(&self) -> Option<Instant> {
        self.inner.core.lock().machine.last_stable_at()
    }

    pub fn reconnect_attempt_count(&self) -> u32 {
        self.inner.core.lock().machine.reconnect_attempt_count()
    }

    pub fn is_online(&self) -> bool {
        self.inner.core.lock().machine.is_online()
    }

    /// A receiver that always holds the latest state.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Register `listener` for state transitions. It runs once per real
    /// transition, on the task that caused it. Dropping the returned
    /// [`Subscription`] removes it.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(StateTransition) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        Subscription {
            id,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    pub fn start(&self) {
        self.handle(MonitorInput::Start);
    }

    pub fn shutdown(&self) {
        self.handle(MonitorInput::Shutdown);
    }

    /// Feed one lifecycle input. Must be called from within a tokio runtime
    /// because timers are spawned as tasks.
    pub fn handle(&self, input: MonitorInput) {
        let now = Instant::now();
        let transitions = {
            let mut core = self.inner.core.lock();
            let effects = core.machine.handle(input, now);
            self.apply(&mut core, effects, now)
        };
        self.notify(transitions);
    }

    fn fire(&self, kind: TimerKind, generation: u64) {
        let now = Instant::now();
        let transitions = {
            let mut core = self.inner.core.lock();
            if core.machine.is_armed(kind, generation) {
                core.timers[kind.slot()] = None;
            }
            let effects = core.machine.expire(kind, generation, now);
            self.apply(&mut core, effects, now)
        };
        self.notify(transitions);
    }

    /// Timer handles and the published state change under the same lock the
    /// machine decided under, so concurrent callers cannot reorder them.
    fn apply(
        &self,
        core: &mut MonitorCore,
        effects: Vec<Effect>,
        now: Instant,
    ) -> Vec<StateTransition> {
        let mut transitions = Vec::new();
        for effect in effects {
            match effect {
                Effect::Arm {
                    kind,
                    after,
                    generation,
                } => {
                    let weak = Arc::downgrade(&self.inner);
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        if let Some(inner) = weak.upgrade() {
                            ConnectionMonitor { inner }.fire(kind, generation);
                        }
                    });
                    if let Some(previous) = core.timers[kind.slot()].replace(handle) {
                        previous.abort();
                    }
                }
                Effect::Cancel(kind) => {
                    if let Some(handle) = core.timers[kind.slot()].take() {
                        handle.abort();
                    }
                }
                Effect::Transition { from, to } => {
                    info!(
                        target = "busline::monitor",
                        from = %from,
                        to = %to,
                        "connection state changed"
                    );
                    self.inner.state_tx.send_replace(to);
                    transitions.push(StateTransition { from, to, at: now });
                }
            }
        }
        transitions
    }

    fn notify(&self, transitions: Vec<StateTransition>) {
        if transitions.is_empty() {
            return;
        }
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for transition in transitions {
            for listener in &listeners {
                listener(transition);
            }
        }
    }
}

impl fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        for handle in self.core.get_mut().timers.iter_mut().filter_map(Option::take) {
            handle.abort();
        }
    }
}

/// Disposer for a state listener.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    monitor: Weak<MonitorInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.monitor.upgrade() {
            inner.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CloseCode;

    fn recorder(monitor: &ConnectionMonitor) -> (Arc<Mutex<Vec<ConnectionState>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = monitor.subscribe(move |transition| sink.lock().push(transition.to));
        (seen, subscription)
    }

    fn abnormal() -> MonitorInput {
        MonitorInput::Disconnect {
            code: CloseCode::ABNORMAL_CLOSURE,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn grace_timer_escalates_on_the_tokio_clock() {
        let monitor = ConnectionMonitor::new(MonitorConfig::default());
        let (seen, _sub) = recorder(&monitor);
        monitor.start();
        monitor.handle(MonitorInput::Connect);
        monitor.handle(abnormal());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(monitor.state(), ConnectionState::Unstable);

        monitor.handle(MonitorInput::Reconnect);
        assert_eq!(
            *seen.lock(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Stable,
                ConnectionState::Unstable,
                ConnectionState::Stable,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_cancels_pending_timers() {
        let monitor = ConnectionMonitor::new(MonitorConfig::default());
        let (seen, _sub) = recorder(&monitor);
        monitor.start();
        monitor.handle(MonitorInput::Connect);
        monitor.handle(abnormal());
        tokio::time::sleep(Duration::from_millis(300)).await;
        monitor.handle(MonitorInput::Reconnect);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(monitor.state(), ConnectionState::Stable);
        assert_eq!(
            *seen.lock(),
            vec![ConnectionState::Connecting, ConnectionState::Stable]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_subscription_stops_receiving() {
        let monitor = ConnectionMonitor::new(MonitorConfig::default());
        let (seen, sub) = recorder(&monitor);
        monitor.start();
        sub.unsubscribe();
        monitor.handle(MonitorInput::Connect);
        assert_eq!(*seen.lock(), vec![ConnectionState::Connecting]);
        assert_eq!(monitor.state(), ConnectionState::Stable);
    }

    fn quick() -> MonitorConfig {
        MonitorConfig {
            grace_period: Duration::from_millis(5),
            stability_threshold: Duration::from_millis(50),
            max_reconnect_attempts: 3,
            lost_timeout: Duration::from_millis(20),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_inputs_keep_the_live_timers() {
        for _ in 0..50 {
            let monitor = ConnectionMonitor::new(quick());
            monitor.start();
            monitor.handle(MonitorInput::Connect);

            let mut tasks = Vec::new();
            let disconnecting = monitor.clone();
            tasks.push(tokio::spawn(async move {
                disconnecting.handle(abnormal());
            }));
            for _ in 0..3 {
                let flapping = monitor.clone();
                tasks.push(tokio::spawn(async move {
                    flapping.handle(MonitorInput::Offline);
                    tokio::task::yield_now().await;
                    flapping.handle(MonitorInput::Online);
                }));
            }
            for task in tasks {
                task.await.expect("join");
            }

            // Every interleaving ends online with a live outage, so the
            // lost timer that survived must still fire.
            assert!(monitor.is_online());
            tokio::time::sleep(Duration::from_millis(150)).await;
            assert_eq!(monitor.state(), ConnectionState::Lost);
            assert_eq!(monitor.state(), monitor.inner.core.lock().machine.state());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn published_state_matches_the_machine_under_contention() {
        let monitor = ConnectionMonitor::new(quick());
        monitor.start();
        let mut tasks = Vec::new();
        for worker in 0..4 {
            let monitor = monitor.clone();
            tasks.push(tokio::spawn(async move {
                for round in 0..200 {
                    let input = match (worker + round) % 4 {
                        0 => MonitorInput::Connect,
                        1 => abnormal(),
                        2 => MonitorInput::Reconnect,
                        _ => MonitorInput::Disconnect {
                            code: CloseCode::RECONNECTING,
                        },
                    };
                    monitor.handle(input);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.expect("join");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(monitor.state(), monitor.inner.core.lock().machine.state());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_receiver_tracks_latest_state() {
        let monitor = ConnectionMonitor::new(MonitorConfig::default());
        let mut rx = monitor.watch();
        assert_eq!(*rx.borrow(), ConnectionState::Disconnected);
        monitor.start();
        rx.changed().await.expect("changed");
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connecting);
        monitor.shutdown();
        assert_eq!(monitor.state(), ConnectionState::Disconnected);
    }
}

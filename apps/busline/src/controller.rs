//! Root context object: owns the monitor, dispatcher and store of one
//! session and pumps transport events into them.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use transport_bus::Bus;
use uuid::Uuid;

use crate::dispatch::{DispatchError, DispatchOutcome, Dispatcher, HandlerRegistration};
use crate::monitor::{
    ConnectionMonitor, ConnectionState, MonitorConfig, MonitorInput, Subscription,
};
use crate::protocol::{CloseCode, Envelope, decode_frame};
use crate::store::{PersonaId, Store, handlers};
use crate::sync::{StoreSync, SyncTasks};
use crate::transport::{
    ChannelConfig, ChannelHandle, NetworkSignal, TransportEvent, WebSocketChannel,
};

const EVENT_CAPACITY: usize = 256;
const TRANSPORT_QUEUE: usize = 256;

/// Events observable by the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Connect,
    Disconnect { code: CloseCode },
    Reconnect,
    Notification(Envelope),
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[derive(Clone)]
pub struct BusClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    tab_id: String,
    monitor: ConnectionMonitor,
    dispatcher: Dispatcher,
    store: Arc<Store>,
    events: broadcast::Sender<BusEvent>,
    registrations: Mutex<Vec<HandlerRegistration>>,
    state_subscription: Mutex<Option<Subscription>>,
    sync: Mutex<Option<SyncTasks>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BusClient {
    pub fn new(
        config: MonitorConfig,
        self_persona: Option<PersonaId>,
    ) -> Result<Self, ClientError> {
        let monitor = ConnectionMonitor::new(config);
        let dispatcher = Dispatcher::new();
        let store = Arc::new(Store::new(self_persona));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let registrations = handlers::install(&dispatcher, Arc::clone(&store))?;
        let state_events = events.clone();
        let state_subscription = monitor.subscribe(move |transition| {
            let _ = state_events.send(BusEvent::StateChanged {
                from: transition.from,
                to: transition.to,
            });
        });

        Ok(Self {
            inner: Arc::new(ClientInner {
                tab_id: Uuid::new_v4().to_string(),
                monitor,
                dispatcher,
                store,
                events,
                registrations: Mutex::new(registrations),
                state_subscription: Mutex::new(Some(state_subscription)),
                sync: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Share store mutations with sibling sessions over `bus`. Must be called
    /// within a tokio runtime.
    pub fn with_bus(self, bus: Arc<dyn Bus>, topic: &str) -> Self {
        let sync = Arc::new(
            StoreSync::new(bus, Arc::clone(&self.inner.store), self.inner.tab_id.clone())
                .with_topic(topic),
        );
        let tasks = sync.spawn();
        if let Some(previous) = self.inner.sync.lock().replace(tasks) {
            previous.abort();
        }
        self
    }

    pub fn tab_id(&self) -> &str {
        &self.inner.tab_id
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.inner.monitor
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.events.subscribe()
    }

    pub fn start(&self) {
        info!(target = "busline::monitor", tab = %self.inner.tab_id, "starting bus client");
        self.inner.monitor.start();
    }

    fn emit(&self, event: BusEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn handle_event(&self, event: TransportEvent) {
        let monitor = &self.inner.monitor;
        match event {
            TransportEvent::Connect => {
                monitor.handle(MonitorInput::Connect);
                self.emit(BusEvent::Connect);
            }
            TransportEvent::Disconnect { code } => {
                monitor.handle(MonitorInput::Disconnect { code });
                self.emit(BusEvent::Disconnect { code });
                if code.is_terminal() {
                    // The channel stops retrying after this close.
                    warn!(target = "busline::monitor", %code, "session ended by server");
                    monitor.shutdown();
                }
            }
            TransportEvent::Reconnecting { attempt } => {
                debug!(target = "busline::transport", attempt, "transport reconnecting");
                monitor.handle(MonitorInput::Reconnecting);
            }
            TransportEvent::Reconnect => {
                monitor.handle(MonitorInput::Reconnect);
                self.emit(BusEvent::Reconnect);
            }
            TransportEvent::Frame(text) => self.handle_frame(&text),
        }
    }

    pub fn handle_network(&self, signal: NetworkSignal) {
        let input = match signal {
            NetworkSignal::Online => MonitorInput::Online,
            NetworkSignal::Offline => MonitorInput::Offline,
        };
        self.inner.monitor.handle(input);
    }

    fn handle_frame(&self, text: &str) {
        let envelopes = match decode_frame(text) {
            Ok(envelopes) => envelopes,
            Err(err) => {
                warn!(target = "busline::dispatch", error = %err, "discarding undecodable frame");
                return;
            }
        };
        for envelope in envelopes {
            if self.inner.dispatcher.dispatch(&envelope) != DispatchOutcome::Duplicate {
                self.emit(BusEvent::Notification(envelope));
            }
        }
    }

    /// Consume `events` in order on a background task until the sender side
    /// closes or the client shuts down.
    pub fn attach(&self, mut events: mpsc::Receiver<TransportEvent>) {
        let client = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                client.handle_event(event);
            }
            debug!(target = "busline::transport", "transport event stream ended");
        });
        self.inner.tasks.lock().push(task);
    }

    pub fn attach_network(&self, mut signals: mpsc::Receiver<NetworkSignal>) {
        let client = self.clone();
        let task = tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                client.handle_network(signal);
            }
        });
        self.inner.tasks.lock().push(task);
    }

    /// Open a websocket channel for `config` and pump its events.
    pub fn connect(&self, config: ChannelConfig) -> ChannelHandle {
        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_QUEUE);
        let handle = WebSocketChannel::new(config, self.inner.dispatcher.clone()).spawn(events_tx);
        self.attach(events_rx);
        handle
    }

    /// Stop pumping, cancel timers and release handlers. The client stays
    /// readable afterwards.
    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(sync) = self.inner.sync.lock().take() {
            sync.abort();
        }
        self.inner.monitor.shutdown();
        drop(self.inner.state_subscription.lock().take());
        self.inner.registrations.lock().clear();
        info!(target = "busline::monitor", tab = %self.inner.tab_id, "bus client shut down");
    }
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("tab_id", &self.inner.tab_id)
            .field("state", &self.inner.monitor.state())
            .finish()
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use super::{ConnectionState, MonitorConfig};
use crate::protocol::CloseCode;

/// Lifecycle input fed to the health machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorInput {
    Start,
    Connect,
    Disconnect { code: CloseCode },
    Reconnecting,
    Reconnect,
    Offline,
    Online,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Disconnects shorter than this are noise.
    Grace,
    /// Disconnects longer than this mean the connection is lost.
    Lost,
    /// Connected this long means the connection is proven stable.
    Stability,
}

impl TimerKind {
    const ALL: [TimerKind; 3] = [TimerKind::Grace, TimerKind::Lost, TimerKind::Stability];

    pub(crate) fn slot(self) -> usize {
        match self {
            TimerKind::Grace => 0,
            TimerKind::Lost => 1,
            TimerKind::Stability => 2,
        }
    }
}

/// Side effects requested by the machine. The caller owns the clock and
/// the timers; the machine only decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Arm {
        kind: TimerKind,
        after: Duration,
        generation: u64,
    },
    Cancel(TimerKind),
    Transition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutageCause {
    /// Abnormal closure while the OS reported being online.
    Abnormal,
    /// Closure that coincided with the OS going offline.
    Offline,
    /// Clean closure requested by either side.
    Planned,
}

#[derive(Debug, Clone, Copy)]
struct Outage {
    cause: OutageCause,
    counted: bool,
}

/// Pure connection-health state machine.
#[derive(Debug)]
pub struct HealthMachine {
    config: MonitorConfig,
    state: ConnectionState,
    online: bool,
    connected: bool,
    outage: Option<Outage>,
    last_stable_at: Option<Instant>,
    reconnect_attempt_count: u32,
    generation: u64,
    armed: [Option<u64>; 3],
}

impl HealthMachine {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            online: true,
            connected: false,
            outage: None,
            last_stable_at: None,
            reconnect_attempt_count: 0,
            generation: 0,
            armed: [None; 3],
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_stable_at(&self) -> Option<Instant> {
        self.last_stable_at
    }

    pub fn reconnect_attempt_count(&self) -> u32 {
        self.reconnect_attempt_count
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub(crate) fn is_armed(&self, kind: TimerKind, generation: u64) -> bool {
        self.armed[kind.slot()] == Some(generation)
    }

    pub fn handle(&mut self, input: MonitorInput, now: Instant) -> Vec<Effect> {
        let mut fx = Vec::new();
        match input {
            MonitorInput::Offline => self.on_offline(now, &mut fx),
            MonitorInput::Online => self.on_online(&mut fx),
            MonitorInput::Shutdown => self.on_shutdown(now, &mut fx),
            MonitorInput::Start => {
                if self.state == ConnectionState::Disconnected {
                    self.enter(ConnectionState::Connecting, now, &mut fx);
                }
            }
            _ if self.state == ConnectionState::Disconnected => {
                trace!(target = "busline::monitor", ?input, "ignoring event before start");
            }
            MonitorInput::Connect | MonitorInput::Reconnect => self.on_connected(now, &mut fx),
            MonitorInput::Disconnect { code } => self.on_disconnected(code, now, &mut fx),
            MonitorInput::Reconnecting => {
                trace!(
                    target = "busline::monitor",
                    state = %self.state,
                    attempts = self.reconnect_attempt_count,
                    "transport reconnecting"
                );
            }
        }
        fx
    }

    /// Apply a timer expiry. Expiries whose generation is no longer armed
    /// were superseded and are ignored.
    pub fn expire(&mut self, kind: TimerKind, generation: u64, now: Instant) -> Vec<Effect> {
        let mut fx = Vec::new();
        if !self.is_armed(kind, generation) {
            trace!(target = "busline::monitor", ?kind, generation, "stale timer ignored");
            return fx;
        }
        self.armed[kind.slot()] = None;

        match kind {
            TimerKind::Grace => {
                if self.in_live_outage()
                    && matches!(
                        self.state,
                        ConnectionState::Stable | ConnectionState::Connecting
                    )
                {
                    self.enter(ConnectionState::Unstable, now, &mut fx);
                }
            }
            TimerKind::Lost => {
                if self.in_live_outage()
                    && matches!(
                        self.state,
                        ConnectionState::Stable
                            | ConnectionState::Connecting
                            | ConnectionState::Unstable
                    )
                {
                    self.enter(ConnectionState::Lost, now, &mut fx);
                }
            }
            TimerKind::Stability => {
                if self.connected {
                    debug!(
                        target = "busline::monitor",
                        attempts = self.reconnect_attempt_count,
                        "connection proven stable"
                    );
                    self.reconnect_attempt_count = 0;
                    if self.state == ConnectionState::Unstable {
                        self.enter(ConnectionState::Stable, now, &mut fx);
                    }
                }
            }
        }
        fx
    }

    fn on_connected(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        if self.connected {
            trace!(target = "busline::monitor", "duplicate connect ignored");
            return;
        }
        self.connected = true;
        self.outage = None;
        self.cancel(TimerKind::Grace, fx);
        self.cancel(TimerKind::Lost, fx);
        self.arm(TimerKind::Stability, fx);

        let target = if self.is_flaky() {
            ConnectionState::Unstable
        } else {
            ConnectionState::Stable
        };
        self.enter(target, now, fx);
    }

    fn on_disconnected(&mut self, code: CloseCode, now: Instant, fx: &mut Vec<Effect>) {
        if !self.connected {
            trace!(target = "busline::monitor", %code, "disconnect while not connected ignored");
            return;
        }
        self.connected = false;
        self.cancel(TimerKind::Stability, fx);

        if code.is_planned() {
            self.outage = Some(Outage {
                cause: OutageCause::Planned,
                counted: false,
            });
            self.enter(ConnectionState::Connecting, now, fx);
            return;
        }

        if !self.online {
            debug!(target = "busline::monitor", %code, "disconnect while offline; not counted");
            self.outage = Some(Outage {
                cause: OutageCause::Offline,
                counted: false,
            });
            self.enter(ConnectionState::Connecting, now, fx);
            return;
        }

        self.reconnect_attempt_count = self.reconnect_attempt_count.saturating_add(1);
        self.outage = Some(Outage {
            cause: OutageCause::Abnormal,
            counted: true,
        });
        self.arm(TimerKind::Grace, fx);
        self.arm(TimerKind::Lost, fx);
        debug!(
            target = "busline::monitor",
            %code,
            attempts = self.reconnect_attempt_count,
            "abnormal disconnect"
        );

        if self.is_flaky() && self.state == ConnectionState::Stable {
            self.enter(ConnectionState::Unstable, now, fx);
        }
    }

    fn on_offline(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        self.online = false;
        let Some(outage) = self.outage.as_mut() else {
            return;
        };
        if self.connected || outage.cause != OutageCause::Abnormal {
            return;
        }
        outage.cause = OutageCause::Offline;
        if outage.counted {
            outage.counted = false;
            self.reconnect_attempt_count = self.reconnect_attempt_count.saturating_sub(1);
        }
        self.cancel(TimerKind::Grace, fx);
        self.cancel(TimerKind::Lost, fx);
        // The outage is explained by the network going away.
        if self.state != ConnectionState::Connecting {
            self.enter(ConnectionState::Connecting, now, fx);
        }
    }

    fn on_online(&mut self, fx: &mut Vec<Effect>) {
        self.online = true;
        if self.connected {
            return;
        }
        if let Some(outage) = self.outage.as_mut() {
            if outage.cause == OutageCause::Offline {
                // Still down after the network came back: watch it again,
                // without charging the offline period as an attempt.
                outage.cause = OutageCause::Abnormal;
                self.arm(TimerKind::Grace, fx);
                self.arm(TimerKind::Lost, fx);
            }
        }
    }

    fn on_shutdown(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        for kind in TimerKind::ALL {
            self.cancel(kind, fx);
        }
        self.connected = false;
        self.outage = None;
        self.reconnect_attempt_count = 0;
        self.enter(ConnectionState::Disconnected, now, fx);
    }

    fn in_live_outage(&self) -> bool {
        !self.connected
            && matches!(
                self.outage,
                Some(Outage {
                    cause: OutageCause::Abnormal,
                    ..
                })
            )
    }

    fn is_flaky(&self) -> bool {
        self.reconnect_attempt_count > self.config.max_reconnect_attempts
    }

    fn arm(&mut self, kind: TimerKind, fx: &mut Vec<Effect>) {
        self.generation += 1;
        self.armed[kind.slot()] = Some(self.generation);
        let after = match kind {
            TimerKind::Grace => self.config.grace_period,
            TimerKind::Lost => self.config.lost_timeout,
            TimerKind::Stability => self.config.stability_threshold,
        };
        fx.push(Effect::Arm {
            kind,
            after,
            generation: self.generation,
        });
    }

    fn cancel(&mut self, kind: TimerKind, fx: &mut Vec<Effect>) {
        if self.armed[kind.slot()].take().is_some() {
            fx.push(Effect::Cancel(kind));
        }
    }

    fn enter(&mut self, to: ConnectionState, now: Instant, fx: &mut Vec<Effect>) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        if to == ConnectionState::Stable {
            self.last_stable_at = Some(now);
        }
        fx.push(Effect::Transition { from, to });
    }
}

//! Engine scheduling
//!
//! Each engine runs in its own task on a fixed interval. A loop owns its
//! engine while running and hands it back when stopped, so baselines and
//! restart counters survive a stop/start. Cycles of one engine never
//! overlap, and a stop request abandons an in-flight cycle without
//! committing any of its state. An on-demand cycle borrows an idle engine
//! without holding the slot table, so edits and other engines proceed while
//! it runs.

use crate::detector::integrity::IntegrityEngine;
use crate::detector::scanner::ContentScanner;
use crate::detector::watchdog::ServiceWatchdog;
use crate::detector::{Event, EventKind};
use crate::error::ConfigError;
use crate::response::EventLog;
use crate::store::{ConfigEdit, ConfigStore, Policy, Section};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The independently scheduled engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    Integrity,
    Watchdog,
    Scanner,
}

impl EngineKind {
    pub const ALL: [EngineKind; 3] = [EngineKind::Integrity, EngineKind::Watchdog, EngineKind::Scanner];

    /// Engine whose behavior depends on a policy section
    pub fn for_section(section: Section) -> EngineKind {
        match section {
            Section::Paths => EngineKind::Integrity,
            Section::Services => EngineKind::Watchdog,
            Section::Patterns | Section::ScanDirs => EngineKind::Scanner,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Integrity => "integrity",
            EngineKind::Watchdog => "watchdog",
            EngineKind::Scanner => "scanner",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "integrity" | "check" => Ok(EngineKind::Integrity),
            "watchdog" | "services" => Ok(EngineKind::Watchdog),
            "scanner" | "scan" => Ok(EngineKind::Scanner),
            other => Err(format!("unknown engine {:?}", other)),
        }
    }
}

/// A periodically executed detection engine
#[async_trait]
pub trait Engine: Send {
    fn kind(&self) -> EngineKind;

    /// Run one complete cycle. State changes are committed only when the
    /// returned future completes.
    async fn run_cycle(&mut self, policy: &Policy) -> Vec<Event>;

    /// Lift restart suppression for a service, if this engine tracks one
    fn clear_service(&mut self, _name: &str) -> bool {
        false
    }
}

#[async_trait]
impl Engine for IntegrityEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Integrity
    }

    async fn run_cycle(&mut self, policy: &Policy) -> Vec<Event> {
        IntegrityEngine::run_cycle(self, policy).await
    }
}

#[async_trait]
impl Engine for ServiceWatchdog {
    fn kind(&self) -> EngineKind {
        EngineKind::Watchdog
    }

    async fn run_cycle(&mut self, policy: &Policy) -> Vec<Event> {
        ServiceWatchdog::run_cycle(self, policy).await
    }

    fn clear_service(&mut self, name: &str) -> bool {
        self.clear(name)
    }
}

#[async_trait]
impl Engine for ContentScanner {
    fn kind(&self) -> EngineKind {
        EngineKind::Scanner
    }

    async fn run_cycle(&mut self, policy: &Policy) -> Vec<Event> {
        ContentScanner::run_cycle(self, policy).await
    }
}

/// Messages delivered to a running loop between cycles
enum Control {
    /// Start the next cycle now
    Wake,
    ClearService(String, oneshot::Sender<bool>),
}

struct RunningLoop {
    stop: watch::Sender<bool>,
    control: mpsc::UnboundedSender<Control>,
    handle: JoinHandle<Box<dyn Engine>>,
}

/// An idle engine lent out for a single on-demand cycle
struct OnDemand {
    cancel: watch::Sender<bool>,
    /// Closed once the engine is back in its slot
    returned: watch::Receiver<()>,
}

type Slots = Arc<Mutex<HashMap<EngineKind, Slot>>>;

enum Slot {
    Idle(Box<dyn Engine>),
    Running(RunningLoop),
    Busy(OnDemand),
    /// Engine lost to a panicked loop
    Failed,
}

/// Owns the engine loops and routes their events to the event log
pub struct Coordinator {
    store: Arc<ConfigStore>,
    log: Arc<EventLog>,
    intervals: HashMap<EngineKind, Duration>,
    slots: Slots,
}

impl Coordinator {
    pub fn new(
        store: Arc<ConfigStore>,
        log: Arc<EventLog>,
        engines: Vec<Box<dyn Engine>>,
        intervals: HashMap<EngineKind, Duration>,
    ) -> Self {
        let slots = engines
            .into_iter()
            .map(|engine| (engine.kind(), Slot::Idle(engine)))
            .collect();

        Self {
            store,
            log,
            intervals,
            slots: Arc::new(Mutex::new(slots)),
        }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    fn interval(&self, kind: EngineKind) -> Duration {
        self.intervals
            .get(&kind)
            .copied()
            .unwrap_or(Duration::from_secs(10))
    }

    /// Start the loop for `kind`. Returns false if it is already running or
    /// not registered.
    pub async fn start(&self, kind: EngineKind) -> bool {
        let mut slots = self.slots.lock().await;

        let engine = match slots.remove(&kind) {
            Some(Slot::Idle(engine)) => engine,
            Some(other) => {
                slots.insert(kind, other);
                return false;
            }
            None => return false,
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_loop(
            engine,
            self.store.clone(),
            self.log.clone(),
            self.interval(kind),
            stop_rx,
            control_rx,
        ));

        slots.insert(
            kind,
            Slot::Running(RunningLoop {
                stop: stop_tx,
                control: control_tx,
                handle,
            }),
        );
        true
    }

    /// Stop the loop for `kind` and wait for it to exit. Other loops are
    /// unaffected. An on-demand cycle in flight is cancelled instead.
    pub async fn stop(&self, kind: EngineKind) -> bool {
        let mut slots = self.slots.lock().await;

        let running = match slots.remove(&kind) {
            Some(Slot::Running(running)) => running,
            Some(Slot::Busy(on_demand)) => {
                let _ = on_demand.cancel.send(true);
                let mut returned = on_demand.returned.clone();
                slots.insert(kind, Slot::Busy(on_demand));
                drop(slots);

                let _ = returned.changed().await;
                info!("{} on-demand cycle cancelled", kind);
                return true;
            }
            Some(other) => {
                slots.insert(kind, other);
                return false;
            }
            None => return false,
        };

        let _ = running.stop.send(true);
        let slot = match running.handle.await {
            Ok(engine) => Slot::Idle(engine),
            Err(e) => {
                error!("{} loop terminated abnormally: {}", kind, e);
                Slot::Failed
            }
        };
        slots.insert(kind, slot);
        info!("{} loop stopped", kind);
        true
    }

    pub async fn start_all(&self) {
        for kind in EngineKind::ALL {
            self.start(kind).await;
        }
    }

    /// Stop every running loop
    pub async fn shutdown(&self) {
        for kind in EngineKind::ALL {
            self.stop(kind).await;
        }
    }

    pub async fn is_running(&self, kind: EngineKind) -> bool {
        matches!(self.slots.lock().await.get(&kind), Some(Slot::Running(_)))
    }

    /// `(engine, running)` for every registered engine
    pub async fn status(&self) -> Vec<(EngineKind, bool)> {
        let slots = self.slots.lock().await;
        EngineKind::ALL
            .into_iter()
            .filter_map(|kind| {
                slots
                    .get(&kind)
                    .map(|slot| (kind, matches!(slot, Slot::Running(_))))
            })
            .collect()
    }

    /// Run a single cycle now.
    ///
    /// An idle engine is taken out of its slot for the cycle and its events
    /// are returned. A running loop is woken instead and `None` is returned;
    /// its events go to the log as usual. `None` is also returned when the
    /// engine is already busy or the cycle is cancelled by `stop`.
    pub async fn run_once(&self, kind: EngineKind) -> Option<Vec<Event>> {
        let mut slots = self.slots.lock().await;
        let engine = match slots.remove(&kind) {
            Some(Slot::Idle(engine)) => engine,
            Some(Slot::Running(running)) => {
                let _ = running.control.send(Control::Wake);
                slots.insert(kind, Slot::Running(running));
                return None;
            }
            Some(other) => {
                slots.insert(kind, other);
                return None;
            }
            None => return None,
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (returned_tx, returned_rx) = watch::channel(());
        slots.insert(
            kind,
            Slot::Busy(OnDemand {
                cancel: cancel_tx,
                returned: returned_rx,
            }),
        );
        drop(slots);

        // The engine finds its way back even if this caller goes away
        let task = tokio::spawn(run_detached(
            engine,
            self.slots.clone(),
            self.log.clone(),
            self.store.snapshot(),
            cancel_rx,
            returned_tx,
        ));
        match task.await {
            Ok(events) => events,
            Err(e) => {
                error!("{} on-demand cycle terminated abnormally: {}", kind, e);
                self.slots.lock().await.insert(kind, Slot::Failed);
                None
            }
        }
    }

    /// Apply a policy edit and wake the engine that depends on it
    pub async fn apply_edit(&self, edit: &ConfigEdit) -> Result<Arc<Policy>, ConfigError> {
        let policy = self.store.apply_edit(edit)?;
        self.after_update(edit.section(), policy.revision).await;
        Ok(policy)
    }

    /// Re-read a section edited outside the agent
    pub async fn reload(&self, section: Section) -> Result<Arc<Policy>, ConfigError> {
        let policy = self.store.reload(section)?;
        self.after_update(section, policy.revision).await;
        Ok(policy)
    }

    async fn after_update(&self, section: Section, revision: u64) {
        self.log.record(&Event::new(
            EventKind::ConfigUpdated,
            section.as_str(),
            format!("policy revision {}", revision),
        ));

        let kind = EngineKind::for_section(section);
        let slots = self.slots.lock().await;
        if let Some(Slot::Running(running)) = slots.get(&kind) {
            debug!("Waking {} after {} update", kind, section);
            let _ = running.control.send(Control::Wake);
        }
    }

    /// Lift flapping suppression for a service
    pub async fn clear_service(&self, name: &str) -> bool {
        loop {
            let mut returned = {
                let mut slots = self.slots.lock().await;
                match slots.get_mut(&EngineKind::Watchdog) {
                    Some(Slot::Idle(engine)) => return engine.clear_service(name),
                    Some(Slot::Running(running)) => {
                        let (tx, rx) = oneshot::channel();
                        if running
                            .control
                            .send(Control::ClearService(name.to_string(), tx))
                            .is_err()
                        {
                            return false;
                        }
                        drop(slots);
                        return rx.await.unwrap_or(false);
                    }
                    // Wait for the on-demand cycle to hand the engine back
                    Some(Slot::Busy(on_demand)) => on_demand.returned.clone(),
                    Some(Slot::Failed) | None => return false,
                }
            };
            let _ = returned.changed().await;
        }
    }
}

/// One cycle of an engine borrowed from its slot, returned there afterwards
async fn run_detached(
    mut engine: Box<dyn Engine>,
    slots: Slots,
    log: Arc<EventLog>,
    policy: Arc<Policy>,
    mut cancel: watch::Receiver<bool>,
    returned: watch::Sender<()>,
) -> Option<Vec<Event>> {
    let kind = engine.kind();

    let events = {
        let cycle = engine.run_cycle(&policy);
        tokio::select! {
            biased;
            _ = cancel.changed() => None,
            events = cycle => Some(events),
        }
    };

    slots.lock().await.insert(kind, Slot::Idle(engine));
    drop(returned);

    match &events {
        Some(events) => log.record_all(events),
        None => warn!("{} on-demand cycle cancelled before commit", kind),
    }
    events
}

async fn run_loop(
    mut engine: Box<dyn Engine>,
    store: Arc<ConfigStore>,
    log: Arc<EventLog>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
    mut control: mpsc::UnboundedReceiver<Control>,
) -> Box<dyn Engine> {
    let kind = engine.kind();
    info!("{} loop started ({:?} interval)", kind, interval);

    loop {
        if *stop.borrow() {
            break;
        }

        let policy = store.snapshot();
        let cycle = engine.run_cycle(&policy);
        tokio::select! {
            biased;
            _ = stop.changed() => {
                warn!("{} cycle abandoned on shutdown", kind);
                break;
            }
            events = cycle => log.record_all(&events),
        }

        let wait = tokio::time::sleep(interval);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = stop.changed() => return engine,
                _ = &mut wait => break,
                message = control.recv() => match message {
                    Some(Control::Wake) => break,
                    Some(Control::ClearService(name, reply)) => {
                        let _ = reply.send(engine.clear_service(&name));
                    }
                    None => return engine,
                },
            }
        }
    }

    engine
}

//! The poll loop: single owner and single writer of the sensor model.
//!
//! Each poll refreshes the state store, reconciles subsystems when the
//! configured set changed, reads and evaluates every sensor, and commits
//! whatever changed in one transaction. Control requests (dump, test
//! temperatures) are served between polls over a channel so the registry
//! is never shared.

use std::{collections::BTreeSet, time::Duration};

use anyhow::{Context, Result, anyhow};
use log::{debug, error, info, warn};
use tokio::{
    sync::{broadcast::error::RecvError, mpsc, oneshot},
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;

use crate::{
    catalog::HardwareCatalog,
    emergency::{self, EmergencyController, Verdict},
    event::{Event, EventBus},
    publisher,
    reader::SensorReader,
    registry::SubsystemRegistry,
    store::{LockState, StateStore, StoreTxn, StoreView},
};

/// Request served by the poll loop between polls.
#[derive(Debug)]
pub enum ControlRequest {
    Dump {
        reply: oneshot::Sender<String>,
    },
    SetTestTemperature {
        sensor: String,
        /// `None` clears the override.
        temp: Option<i32>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Sending side of the control channel.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl ControlHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ControlRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ControlRequest) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| anyhow!("Poll loop is not running"))?;
        rx.await.context("Poll loop dropped the request")
    }

    pub async fn dump(&self) -> Result<String> {
        self.request(|reply| ControlRequest::Dump { reply }).await
    }

    pub async fn set_test_temperature(&self, sensor: &str, temp: Option<i32>) -> Result<()> {
        self.request(|reply| ControlRequest::SetTestTemperature {
            sensor: sensor.to_string(),
            temp,
            reply,
        })
        .await?
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Lock not held; nothing was read or published.
    Skipped,
    /// Woken by a store change that did not touch the subsystem set.
    Unchanged,
    /// Poll ran; `changes` store ops were committed.
    Completed { changes: usize },
    /// A sensor stayed in emergency on an auto shutdown subsystem.
    ShutdownTriggered { sensor: String },
}

pub struct PollLoop {
    registry: SubsystemRegistry,
    store: Box<dyn StateStore>,
    catalog: Box<dyn HardwareCatalog>,
    reader: SensorReader,
    emergency: EmergencyController,
    events: EventBus,
    daemon_name: String,
    last_seqno: Option<u64>,
    /// Created subsystems whose sensor list is not yet committed.
    unlinked: BTreeSet<String>,
    hw_ready: bool,
    contended: bool,
}

impl PollLoop {
    pub fn new(
        store: Box<dyn StateStore>,
        catalog: Box<dyn HardwareCatalog>,
        reader: SensorReader,
        emergency: EmergencyController,
        events: EventBus,
    ) -> Self {
        Self {
            registry: SubsystemRegistry::new(),
            store,
            catalog,
            reader,
            emergency,
            events,
            daemon_name: "ops-tempd".to_string(),
            last_seqno: None,
            unlinked: BTreeSet::new(),
            hw_ready: false,
            contended: false,
        }
    }

    pub fn with_daemon_name(mut self, name: impl Into<String>) -> Self {
        self.daemon_name = name.into();
        self
    }

    pub fn registry(&self) -> &SubsystemRegistry {
        &self.registry
    }

    /// Runs one full poll.
    pub async fn poll(&mut self) -> Result<PollOutcome> {
        let view = self.store.refresh().await?;
        self.process(view).await
    }

    /// Reacts to a store change notification.
    ///
    /// Only a change of the configured subsystem set warrants an early poll;
    /// everything else (our own commits included) waits for the next tick.
    pub async fn wake(&mut self) -> Result<PollOutcome> {
        let view = self.store.refresh().await?;
        if self.last_seqno == Some(view.seqno) {
            return Ok(PollOutcome::Unchanged);
        }
        self.process(view).await
    }

    async fn process(&mut self, view: StoreView) -> Result<PollOutcome> {
        match view.lock {
            LockState::Held => {
                if self.contended {
                    info!("State store lock acquired, resuming polls");
                    self.contended = false;
                }
            }
            LockState::Contended => {
                if !self.contended {
                    warn!("State store locked by another instance, skipping polls");
                    self.contended = true;
                }
                return Ok(PollOutcome::Skipped);
            }
            LockState::Pending => return Ok(PollOutcome::Skipped),
        }

        let mut txn = StoreTxn::new();

        if self.last_seqno != Some(view.seqno) {
            self.reconcile(&view).await;
            self.last_seqno = Some(view.seqno);
        }
        for name in &self.unlinked {
            publisher::link_subsystem(&self.registry, name, &mut txn);
        }

        for subsystem in self.registry.subsystems_mut() {
            let auto_shutdown = subsystem.auto_shutdown;
            for sensor in subsystem.sensors.values_mut() {
                self.reader.read(sensor).await;
                if let Verdict::ShutdownTriggered { sensor } =
                    emergency::verify(&self.reader, sensor, auto_shutdown).await
                {
                    return Ok(PollOutcome::ShutdownTriggered { sensor });
                }
            }
        }

        publisher::diff(&self.registry, &view.document, &mut txn);
        let daemon_found =
            !self.hw_ready && publisher::mark_hw_ready(&view.document, &self.daemon_name, &mut txn);

        let changes = txn.len();
        if changes > 0 {
            self.store
                .commit(txn)
                .await
                .context("Failed to publish sensor state")?;
        }
        self.unlinked.clear();
        if daemon_found {
            self.hw_ready = true;
        }

        Ok(PollOutcome::Completed { changes })
    }

    async fn reconcile(&mut self, view: &StoreView) {
        debug!(
            "Subsystem set changed (seqno {}), reconciling {} rows",
            view.seqno,
            view.document.subsystems.len()
        );

        let report = self
            .registry
            .reconcile(&view.document.subsystems, self.catalog.as_mut(), &self.reader)
            .await;

        for name in report.created {
            self.unlinked.insert(name.clone());
            let sensors = self
                .registry
                .subsystem(&name)
                .map_or(0, |s| s.sensors.len());
            self.events.emit(Event::SubsystemAdded { name, sensors });
        }
        for name in report.removed {
            self.unlinked.remove(&name);
            self.events.emit(Event::SubsystemRemoved { name });
        }
    }

    fn handle(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Dump { reply } => {
                let _ = reply.send(self.registry.dump());
            }
            ControlRequest::SetTestTemperature {
                sensor,
                temp,
                reply,
            } => {
                let result = self.registry.set_test_temperature(&sensor, temp);
                match (&result, temp) {
                    (Ok(()), Some(temp)) => info!("Test temperature of {sensor} set to {temp}"),
                    (Ok(()), None) => info!("Test temperature of {sensor} cleared"),
                    (Err(e), _) => debug!("Test temperature request rejected: {e}"),
                }
                let _ = reply.send(result);
            }
        }
    }

    /// Polls every `period` until cancelled.
    ///
    /// Cancellation and control requests are only looked at between polls.
    /// A triggered shutdown never returns.
    pub async fn run(
        mut self,
        period: Duration,
        mut control: mpsc::Receiver<ControlRequest>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut events = self.events.subscribe();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("Poll loop cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => self.poll().await,
                Some(request) = control.recv() => {
                    self.handle(request);
                    continue;
                }
                event = events.recv() => match event {
                    Ok(Event::StoreChanged) => self.wake().await,
                    Ok(_) | Err(RecvError::Closed) => continue,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Poll loop missed {missed} events, polling now");
                        self.poll().await
                    }
                },
            };

            match outcome {
                Ok(PollOutcome::ShutdownTriggered { sensor }) => {
                    match self.emergency.halt(&sensor).await {}
                }
                Ok(outcome) => debug!("Poll finished: {outcome:?}"),
                Err(e) => error!("Poll failed: {e:#}"),
            }
        }
    }
}

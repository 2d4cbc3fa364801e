//! Tick driver
//!
//! Runs the engine against the network: probes devices, sends the planned
//! commands, feeds the outcomes back and publishes device state. The engine
//! lock is never held across network I/O.

use chrono::{DateTime, Local};
use kidslock_api::{DeviceDefinition, DeviceStatus, DeviceView};
use kidslock_config::ServiceConfig;
use kidslock_device_api::{DeviceError, ReachabilityProber, RemoteControl, StatePublisher};
use kidslock_util::{DeviceId, MonotonicInstant};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{Action, CommandPlan, CoreEvent, EngineResult, ProbeResult, ProbeTarget, ReconcileEngine};

/// Network timing for the driver
#[derive(Debug, Clone, Copy)]
pub struct DriverSettings {
    pub tick_interval: Duration,
    pub probe_timeout: Duration,
    pub command_timeout: Duration,
    /// Read the lock state back from online devices every tick
    pub poll_status: bool,
}

impl From<&ServiceConfig> for DriverSettings {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            tick_interval: config.tick_interval,
            probe_timeout: config.probe_timeout,
            command_timeout: config.command_timeout,
            poll_status: config.poll_status,
        }
    }
}

/// Summary of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub devices: usize,
    pub online: usize,
    pub commands_sent: usize,
    pub commands_failed: usize,
}

/// Drives a shared [`ReconcileEngine`]
#[derive(Clone)]
pub struct Reconciler {
    engine: Arc<Mutex<ReconcileEngine>>,
    prober: Arc<dyn ReachabilityProber>,
    remote: Arc<dyn RemoteControl>,
    publisher: Arc<dyn StatePublisher>,
    settings: DriverSettings,
    events: Option<mpsc::UnboundedSender<CoreEvent>>,
    /// Held from planning a command until its outcome is applied, so plans
    /// from a tick and from a client command never interleave
    dispatch: Arc<Mutex<()>>,
}

impl Reconciler {
    pub fn new(
        engine: Arc<Mutex<ReconcileEngine>>,
        prober: Arc<dyn ReachabilityProber>,
        remote: Arc<dyn RemoteControl>,
        publisher: Arc<dyn StatePublisher>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            engine,
            prober,
            remote,
            publisher,
            settings,
            events: None,
            dispatch: Arc::new(Mutex::new(())),
        }
    }

    /// Forward lock changes and command failures to `tx`
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<CoreEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn engine(&self) -> &Arc<Mutex<ReconcileEngine>> {
        &self.engine
    }

    /// Tick on the configured interval until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval = ?self.settings.tick_interval, "Reconciler running");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.run_tick().await;
                    debug!(
                        devices = report.devices,
                        online = report.online,
                        sent = report.commands_sent,
                        failed = report.commands_failed,
                        "Tick complete"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }

    pub async fn run_tick(&self) -> TickReport {
        self.run_tick_at(kidslock_util::now(), MonotonicInstant::now())
            .await
    }

    /// One full tick at the given clock readings
    pub async fn run_tick_at(&self, now: DateTime<Local>, mono_now: MonotonicInstant) -> TickReport {
        let targets = self.engine.lock().await.prepare_tick(now);
        let probes = self.probe_all(targets).await;

        let mut report = TickReport {
            devices: probes.len(),
            online: probes.values().filter(|p| p.online).count(),
            ..Default::default()
        };

        let _dispatch = self.dispatch.lock().await;
        let actions = self.engine.lock().await.tick(now, mono_now, &probes);
        let (sent, failed) = self.execute(actions, now).await;
        report.commands_sent = sent;
        report.commands_failed = failed;
        report
    }

    async fn probe_all(&self, targets: Vec<ProbeTarget>) -> HashMap<DeviceId, ProbeResult> {
        let mut probes = JoinSet::new();
        for target in targets {
            let prober = self.prober.clone();
            let remote = self.remote.clone();
            let settings = self.settings;
            probes.spawn(async move {
                let result = probe_one(prober, remote, settings, &target.address).await;
                (target.device_id, result)
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((device_id, result)) => {
                    results.insert(device_id, result);
                }
                Err(e) => warn!(error = %e, "Probe task failed"),
            }
        }
        results
    }

    /// Carry out engine actions; returns (commands sent, commands failed)
    async fn execute(&self, actions: Vec<Action>, now: DateTime<Local>) -> (usize, usize) {
        let mut commands = JoinSet::new();
        for action in actions {
            match action {
                Action::Publish { device_id, status } => {
                    self.publish(&device_id, status).await;
                }
                Action::SendCommand(plan) => {
                    let remote = self.remote.clone();
                    let limit = self.settings.command_timeout;
                    commands.spawn(async move {
                        let result = send_command(remote, &plan, limit).await;
                        (plan, result)
                    });
                }
            }
        }

        let (mut sent, mut failed) = (0, 0);
        while let Some(joined) = commands.join_next().await {
            let (plan, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "Command task failed");
                    failed += 1;
                    continue;
                }
            };

            if result.is_ok() {
                sent += 1;
            } else {
                failed += 1;
            }

            let outcome = self
                .engine
                .lock()
                .await
                .complete_command(&plan, result.map_err(|e| e.to_string()), now);

            // Deleted while the command was in flight
            let Some(outcome) = outcome else {
                continue;
            };

            self.publish(&outcome.device_id, outcome.status).await;
            if let (Some(event), Some(tx)) = (outcome.event, &self.events) {
                let _ = tx.send(event);
            }
        }

        (sent, failed)
    }

    async fn publish(&self, device_id: &DeviceId, status: DeviceStatus) {
        if let Err(e) = self.publisher.publish(device_id, status).await {
            warn!(device_id = %device_id, error = %e, "Failed to publish device state");
        }
    }

    /// Execute one action and return the resulting view
    async fn finish(&self, id: &DeviceId, action: Action, now: DateTime<Local>) -> EngineResult<DeviceView> {
        self.execute(vec![action], now).await;
        self.engine.lock().await.device_view(id, now)
    }

    // Client commands. Each is planned and applied in one engine critical
    // section, then its command (if any) is sent.

    pub async fn toggle_lock(
        &self,
        id: &DeviceId,
        now: DateTime<Local>,
    ) -> EngineResult<DeviceView> {
        let _dispatch = self.dispatch.lock().await;
        let action = self.engine.lock().await.toggle_lock(id, now)?;
        self.finish(id, action, now).await
    }

    pub async fn set_lock(
        &self,
        id: &DeviceId,
        locked: bool,
        now: DateTime<Local>,
    ) -> EngineResult<DeviceView> {
        let _dispatch = self.dispatch.lock().await;
        let action = self.engine.lock().await.set_lock(id, locked, now)?;
        self.finish(id, action, now).await
    }

    pub async fn add_time(
        &self,
        id: &DeviceId,
        minutes: u32,
        now: DateTime<Local>,
    ) -> EngineResult<DeviceView> {
        let _dispatch = self.dispatch.lock().await;
        let action = self.engine.lock().await.add_time(id, minutes, now)?;
        self.finish(id, action, now).await
    }

    pub async fn reset_day(
        &self,
        id: &DeviceId,
        now: DateTime<Local>,
    ) -> EngineResult<DeviceView> {
        let _dispatch = self.dispatch.lock().await;
        let action = self.engine.lock().await.reset_day(id, now)?;
        self.finish(id, action, now).await
    }

    pub async fn resume_automatic(
        &self,
        id: &DeviceId,
        now: DateTime<Local>,
    ) -> EngineResult<DeviceView> {
        let _dispatch = self.dispatch.lock().await;
        let action = self.engine.lock().await.resume_automatic(id, now)?;
        self.finish(id, action, now).await
    }

    pub async fn create_device(
        &self,
        definition: DeviceDefinition,
        now: DateTime<Local>,
    ) -> EngineResult<DeviceView> {
        let id = definition.id.clone();
        let _dispatch = self.dispatch.lock().await;
        let action = {
            let mut engine = self.engine.lock().await;
            engine.create_device(definition, now)?;
            engine.reconcile_device(&id, now)?
        };
        self.finish(&id, action, now).await
    }

    pub async fn update_device(
        &self,
        definition: DeviceDefinition,
        now: DateTime<Local>,
    ) -> EngineResult<DeviceView> {
        let id = definition.id.clone();
        let _dispatch = self.dispatch.lock().await;
        let action = {
            let mut engine = self.engine.lock().await;
            engine.update_device(definition, now)?;
            engine.reconcile_device(&id, now)?
        };
        self.finish(&id, action, now).await
    }

    /// Delete a device and withdraw its retained state
    pub async fn delete_device(&self, id: &DeviceId) -> EngineResult<()> {
        let _dispatch = self.dispatch.lock().await;
        self.engine.lock().await.delete_device(id)?;
        if let Err(e) = self.publisher.remove(id).await {
            warn!(device_id = %id, error = %e, "Failed to withdraw retained state");
        }
        Ok(())
    }
}

async fn probe_one(
    prober: Arc<dyn ReachabilityProber>,
    remote: Arc<dyn RemoteControl>,
    settings: DriverSettings,
    address: &str,
) -> ProbeResult {
    let online = timeout(settings.probe_timeout, prober.is_reachable(address))
        .await
        .unwrap_or(false);

    let reported_locked = if online && settings.poll_status {
        match timeout(settings.command_timeout, remote.status(address)).await {
            Ok(Ok(locked)) => Some(locked),
            Ok(Err(e)) => {
                debug!(address, error = %e, "Status read failed");
                None
            }
            Err(_) => {
                debug!(address, "Status read timed out");
                None
            }
        }
    } else {
        None
    };

    ProbeResult {
        online,
        reported_locked,
    }
}

async fn send_command(
    remote: Arc<dyn RemoteControl>,
    plan: &CommandPlan,
    limit: Duration,
) -> Result<(), DeviceError> {
    debug!(
        device_id = %plan.device_id,
        address = %plan.address,
        locked = plan.locked,
        reason = %plan.reason,
        "Sending device command"
    );
    match timeout(limit, remote.set_locked(&plan.address, plan.locked)).await {
        Ok(result) => result,
        Err(_) => Err(DeviceError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineSettings;
    use chrono::TimeZone;
    use kidslock_api::{DecisionReason, Remaining};
    use kidslock_device_api::{MockProber, MockPublisher, MockRemote, SentCommand};
    use kidslock_store::SqliteStore;

    const ADDR: &str = "10.0.0.5";

    struct Harness {
        reconciler: Reconciler,
        prober: MockProber,
        remote: MockRemote,
        publisher: MockPublisher,
        events: mpsc::UnboundedReceiver<CoreEvent>,
    }

    fn at(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 11, h, m, 0).unwrap()
    }

    fn harness(poll_status: bool) -> Harness {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut engine = ReconcileEngine::new(
            store,
            EngineSettings {
                tick_interval: Duration::from_secs(60),
                reassert_lock: false,
            },
        );
        engine.seed(&[DeviceDefinition::new("TV", ADDR)], at(0, 0).date_naive());

        let prober = MockProber::new(true);
        let remote = MockRemote::new();
        let publisher = MockPublisher::new();
        let (tx, events) = mpsc::unbounded_channel();
        let reconciler = Reconciler::new(
            Arc::new(Mutex::new(engine)),
            Arc::new(prober.clone()),
            Arc::new(remote.clone()),
            Arc::new(publisher.clone()),
            DriverSettings {
                tick_interval: Duration::from_secs(60),
                probe_timeout: Duration::from_millis(200),
                command_timeout: Duration::from_millis(200),
                poll_status,
            },
        )
        .with_events(tx);

        Harness {
            reconciler,
            prober,
            remote,
            publisher,
            events,
        }
    }

    fn tv() -> DeviceId {
        DeviceId::new("tv")
    }

    async fn set_counters(h: &Harness, elapsed: f64, locked: bool) {
        let mut engine = h.reconciler.engine().lock().await;
        let device = engine.device_mut(&tv()).unwrap();
        device.counters.elapsed_minutes = elapsed;
        device.counters.locked = locked;
    }

    #[tokio::test]
    async fn tick_publishes_state_for_every_device() {
        let h = harness(false);
        let report = h.reconciler.run_tick_at(at(10, 0), MonotonicInstant::now()).await;

        assert_eq!(
            report,
            TickReport {
                devices: 1,
                online: 1,
                commands_sent: 0,
                commands_failed: 0,
            }
        );
        assert_eq!(h.prober.probes(), vec![ADDR]);
        assert_eq!(
            h.publisher.retained(&tv()),
            Some(DeviceStatus {
                locked: false,
                remaining: Remaining::Minutes(120),
                online: true,
            })
        );
    }

    #[tokio::test]
    async fn bedtime_lock_is_sent_even_when_offline() {
        let mut h = harness(false);
        h.prober.set_reachable(ADDR, false);

        let report = h.reconciler.run_tick_at(at(23, 30), MonotonicInstant::now()).await;
        assert_eq!(report.online, 0);
        assert_eq!(report.commands_sent, 1);
        assert_eq!(
            h.remote.sent(),
            vec![SentCommand {
                address: ADDR.into(),
                locked: true
            }]
        );
        assert!(h.publisher.retained(&tv()).unwrap().locked);
        assert_eq!(
            h.events.recv().await,
            Some(CoreEvent::LockChanged {
                device_id: tv(),
                locked: true,
                reason: DecisionReason::Bedtime,
            })
        );
    }

    #[tokio::test]
    async fn failed_command_is_retried_next_tick() {
        let mut h = harness(false);
        h.remote.set_fail_commands(true);

        let report = h.reconciler.run_tick_at(at(23, 30), MonotonicInstant::now()).await;
        assert_eq!(report.commands_failed, 1);
        assert!(!h.publisher.retained(&tv()).unwrap().locked);
        assert!(matches!(
            h.events.recv().await,
            Some(CoreEvent::CommandFailed { locked: true, .. })
        ));

        h.remote.set_fail_commands(false);
        let report = h.reconciler.run_tick_at(at(23, 31), MonotonicInstant::now()).await;
        assert_eq!(report.commands_sent, 1);
        assert_eq!(h.remote.sent().len(), 2);
        assert!(h.publisher.retained(&tv()).unwrap().locked);
    }

    #[tokio::test]
    async fn slow_device_times_out() {
        let mut h = harness(false);
        h.remote.set_command_delay(Some(Duration::from_secs(2)));

        let report = h.reconciler.run_tick_at(at(23, 30), MonotonicInstant::now()).await;
        assert_eq!(report.commands_failed, 1);
        match h.events.recv().await {
            Some(CoreEvent::CommandFailed { error, .. }) => assert!(error.contains("Timed out")),
            other => panic!("expected CommandFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn add_time_unlocks_through_the_remote() {
        let h = harness(false);
        set_counters(&h, 125.0, true).await;

        let view = h.reconciler.add_time(&tv(), 30, at(15, 0)).await.unwrap();
        assert!(!view.locked);
        assert_eq!(view.remaining, Remaining::Minutes(25));
        assert_eq!(view.manual_override, None);
        assert_eq!(h.remote.sent().last().map(|c| c.locked), Some(false));
        assert!(!h.publisher.retained(&tv()).unwrap().locked);
    }

    #[tokio::test]
    async fn set_lock_pins_manual_override() {
        let h = harness(false);

        let view = h.reconciler.set_lock(&tv(), true, at(10, 0)).await.unwrap();
        assert!(view.locked);
        assert_eq!(view.manual_override, Some(kidslock_api::ManualOverride::Lock));
        assert_eq!(h.remote.sent().last().map(|c| c.locked), Some(true));

        let view = h.reconciler.set_lock(&tv(), false, at(10, 1)).await.unwrap();
        assert!(!view.locked);
        assert_eq!(view.manual_override, Some(kidslock_api::ManualOverride::Unlock));
        assert_eq!(h.remote.sent().last().map(|c| c.locked), Some(false));
    }

    #[tokio::test]
    async fn toggle_then_resume() {
        let h = harness(false);

        let view = h.reconciler.toggle_lock(&tv(), at(10, 0)).await.unwrap();
        assert!(view.locked);
        assert_eq!(view.reason, Some(DecisionReason::Manual));

        let view = h.reconciler.resume_automatic(&tv(), at(10, 1)).await.unwrap();
        assert_eq!(view.manual_override, None);
        assert_eq!(h.remote.sent().len(), 2);
    }

    #[tokio::test]
    async fn status_polling_heals_drift() {
        let h = harness(true);
        h.remote.set_device_locked(ADDR, true);

        h.reconciler.run_tick_at(at(10, 0), MonotonicInstant::now()).await;
        assert_eq!(
            h.remote.sent(),
            vec![SentCommand {
                address: ADDR.into(),
                locked: false
            }]
        );
    }

    #[tokio::test]
    async fn delete_withdraws_retained_state() {
        let h = harness(false);
        h.reconciler.run_tick_at(at(10, 0), MonotonicInstant::now()).await;
        assert!(h.publisher.retained(&tv()).is_some());

        h.reconciler.delete_device(&tv()).await.unwrap();
        assert!(h.publisher.retained(&tv()).is_none());
        assert!(h.reconciler.toggle_lock(&tv(), at(10, 1)).await.is_err());
    }

    #[tokio::test]
    async fn created_device_is_published_immediately() {
        let h = harness(false);
        let view = h
            .reconciler
            .create_device(DeviceDefinition::new("Tablet", "10.0.0.6"), at(10, 0))
            .await
            .unwrap();
        assert_eq!(view.device_id.as_str(), "tablet");
        assert!(h.publisher.retained(&DeviceId::new("tablet")).is_some());
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let h = harness(false);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.reconciler.clone().run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        // The first interval tick fires immediately
        assert_eq!(h.prober.probes().len(), 1);
    }
}

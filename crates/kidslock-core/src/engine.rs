//! Reconciliation engine
//!
//! Owns the registry and performs every state mutation. The engine does no
//! I/O of its own besides persistence: probing, device commands and
//! publishing are carried out by the caller for the [`Action`]s it returns,
//! and command outcomes are fed back through [`ReconcileEngine::complete_command`].

use chrono::{DateTime, Datelike, Local, NaiveDate};
use kidslock_api::{
    DecisionReason, DefinitionError, DeviceDefinition, DeviceStatus, DeviceView, ManualOverride,
    ServiceStateSnapshot, API_VERSION,
};
use kidslock_config::ServiceConfig;
use kidslock_store::{AuditEvent, AuditEventType, DeviceCounters, DeviceRecord, Store, StoreError};
use kidslock_util::{DeviceId, MonotonicInstant};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::decision::{self, Decision};
use crate::{CoreEvent, Device, Registry};

/// Errors returned to callers of engine commands
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("Device already exists: {0}")]
    DeviceExists(DeviceId),

    #[error(transparent)]
    InvalidDefinition(#[from] DefinitionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Engine tuning taken from the service configuration
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Nominal tick interval; accrual per tick is capped at twice this
    pub tick_interval: Duration,
    /// Re-send lock to online devices already believed locked
    pub reassert_lock: bool,
}

impl From<&ServiceConfig> for EngineSettings {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            tick_interval: config.tick_interval,
            reassert_lock: config.reassert_lock,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&ServiceConfig::default())
    }
}

/// A device to probe before the next tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub device_id: DeviceId,
    pub address: String,
}

/// What probing found out about a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub online: bool,
    /// Lock state read back from the device, when status polling is on
    pub reported_locked: Option<bool>,
}

/// A lock or unlock command to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub device_id: DeviceId,
    pub address: String,
    pub locked: bool,
    pub reason: DecisionReason,
}

/// Side effect requested by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a command, then report back with `complete_command`
    SendCommand(CommandPlan),
    /// Publish the device's current status
    Publish {
        device_id: DeviceId,
        status: DeviceStatus,
    },
}

/// Result of applying a command outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub device_id: DeviceId,
    pub status: DeviceStatus,
    pub event: Option<CoreEvent>,
}

/// The reconciliation engine
pub struct ReconcileEngine {
    registry: Registry,
    store: Arc<dyn Store>,
    settings: EngineSettings,
    last_tick: Option<MonotonicInstant>,
    last_tick_at: Option<DateTime<Local>>,
}

impl ReconcileEngine {
    pub fn new(store: Arc<dyn Store>, settings: EngineSettings) -> Self {
        Self {
            registry: Registry::new(),
            store,
            settings,
            last_tick: None,
            last_tick_at: None,
        }
    }

    /// Load every persisted device into the registry
    pub fn load(&mut self) -> EngineResult<usize> {
        let records = self.store.load_devices()?;
        for record in records {
            self.registry.insert(Device::from_record(record));
        }
        info!(device_count = self.registry.len(), "Device registry loaded");
        Ok(self.registry.len())
    }

    /// Upsert configured devices, keeping the counters of known ones.
    ///
    /// Invalid definitions are skipped with a warning.
    pub fn seed(&mut self, definitions: &[DeviceDefinition], today: NaiveDate) -> usize {
        let mut seeded = 0;
        for definition in definitions {
            if let Err(e) = definition.validate() {
                warn!(device_id = %definition.id, error = %e, "Skipping invalid configured device");
                continue;
            }

            let device = match self.registry.get(&definition.id) {
                Some(existing) => Device {
                    definition: definition.clone(),
                    ..existing.clone()
                },
                None => Device::from_record(DeviceRecord {
                    definition: definition.clone(),
                    counters: DeviceCounters::fresh(today),
                }),
            };

            if let Err(e) = self.store.upsert_device(&device.record()) {
                warn!(device_id = %definition.id, error = %e, "Failed to persist configured device");
            }
            self.registry.insert(device);
            seeded += 1;
        }

        self.audit(AuditEventType::ConfigLoaded {
            device_count: seeded,
        });
        info!(seeded, total = self.registry.len(), "Configured devices seeded");
        seeded
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    pub fn device(&self, id: &DeviceId) -> Option<&Device> {
        self.registry.get(id)
    }

    pub fn device_count(&self) -> usize {
        self.registry.len()
    }

    pub fn last_tick_at(&self) -> Option<DateTime<Local>> {
        self.last_tick_at
    }

    pub fn store_healthy(&self) -> bool {
        self.store.is_healthy()
    }

    /// Append to the audit log, logging failures
    pub fn audit(&self, event: AuditEventType) {
        if let Err(e) = self.store.append_audit(AuditEvent::new(event)) {
            warn!(error = %e, "Failed to append audit event");
        }
    }

    pub fn recent_audits(&self, limit: usize) -> EngineResult<Vec<AuditEvent>> {
        Ok(self.store.get_recent_audits(limit)?)
    }

    // Views

    pub fn device_view(&self, id: &DeviceId, now: DateTime<Local>) -> EngineResult<DeviceView> {
        self.registry
            .get(id)
            .map(|d| d.view(now))
            .ok_or_else(|| EngineError::DeviceNotFound(id.clone()))
    }

    pub fn list_devices(&self, now: DateTime<Local>) -> Vec<DeviceView> {
        self.registry.iter().map(|d| d.view(now)).collect()
    }

    pub fn snapshot(&self, now: DateTime<Local>) -> ServiceStateSnapshot {
        ServiceStateSnapshot {
            api_version: API_VERSION,
            tick_interval_secs: self.settings.tick_interval.as_secs(),
            device_count: self.registry.len(),
            last_tick: self.last_tick_at,
            devices: self.list_devices(now),
        }
    }

    // Device definitions

    pub fn create_device(
        &mut self,
        definition: DeviceDefinition,
        now: DateTime<Local>,
    ) -> EngineResult<DeviceView> {
        definition.validate()?;
        if self.registry.contains(&definition.id) {
            return Err(EngineError::DeviceExists(definition.id));
        }

        let device = Device::from_record(DeviceRecord {
            definition,
            counters: DeviceCounters::fresh(now.date_naive()),
        });
        self.store.upsert_device(&device.record())?;

        let id = device.id().clone();
        info!(device_id = %id, address = %device.definition.address, "Device created");
        self.audit(AuditEventType::DeviceCreated {
            device_id: id.clone(),
        });
        self.registry.insert(device);
        self.device_view(&id, now)
    }

    /// Replace a device's definition; counters and lock state are kept
    pub fn update_device(
        &mut self,
        definition: DeviceDefinition,
        now: DateTime<Local>,
    ) -> EngineResult<DeviceView> {
        definition.validate()?;
        let device = self
            .registry
            .get_mut(&definition.id)
            .ok_or_else(|| EngineError::DeviceNotFound(definition.id.clone()))?;

        let updated = Device {
            definition,
            ..device.clone()
        };
        self.store.upsert_device(&updated.record())?;
        *device = updated;

        let id = device.id().clone();
        info!(device_id = %id, "Device updated");
        self.audit(AuditEventType::DeviceUpdated {
            device_id: id.clone(),
        });
        self.device_view(&id, now)
    }

    /// Remove a device and its persisted counters
    pub fn delete_device(&mut self, id: &DeviceId) -> EngineResult<()> {
        if !self.registry.contains(id) {
            return Err(EngineError::DeviceNotFound(id.clone()));
        }
        self.store.delete_device(id)?;
        self.registry.remove(id);

        info!(device_id = %id, "Device deleted");
        self.audit(AuditEventType::DeviceDeleted {
            device_id: id.clone(),
        });
        Ok(())
    }

    // Tick

    /// Phase one of a tick: daily resets, then the devices to probe.
    ///
    /// Devices whose definition is unusable are skipped with a warning.
    pub fn prepare_tick(&mut self, now: DateTime<Local>) -> Vec<ProbeTarget> {
        let today = now.date_naive();
        let mut targets = Vec::with_capacity(self.registry.len());

        for device in self.registry.iter_mut() {
            if decision::apply_daily_reset(&mut device.counters, today) {
                on_daily_reset(self.store.as_ref(), device);
            }

            if let Err(e) = device.definition.validate() {
                warn!(device_id = %device.id(), error = %e, "Skipping misconfigured device this tick");
                continue;
            }

            targets.push(ProbeTarget {
                device_id: device.id().clone(),
                address: device.definition.address.clone(),
            });
        }

        targets
    }

    /// Phase two of a tick: accrue, decide and persist for every probed device.
    ///
    /// `mono_now` measures the time since the previous tick. The first tick
    /// after startup accrues nothing.
    pub fn tick(
        &mut self,
        now: DateTime<Local>,
        mono_now: MonotonicInstant,
        probes: &HashMap<DeviceId, ProbeResult>,
    ) -> Vec<Action> {
        let delta_minutes = match self.last_tick {
            Some(prev) => {
                decision::clamp_delta_minutes(mono_now.duration_since(prev), self.settings.tick_interval)
            }
            None => 0.0,
        };
        self.last_tick = Some(mono_now);
        self.last_tick_at = Some(now);

        let mut actions = Vec::with_capacity(probes.len());
        for (id, probe) in probes {
            // Deleted while probing
            let Some(device) = self.registry.get_mut(id) else {
                continue;
            };
            actions.push(reconcile(
                self.store.as_ref(),
                self.settings,
                device,
                now,
                Some(*probe),
                delta_minutes,
            ));
        }

        debug!(
            devices = probes.len(),
            delta_minutes,
            commands = actions
                .iter()
                .filter(|a| matches!(a, Action::SendCommand(_)))
                .count(),
            "Tick evaluated"
        );
        actions
    }

    /// Reconcile one device now, without probing or accrual
    pub fn reconcile_device(&mut self, id: &DeviceId, now: DateTime<Local>) -> EngineResult<Action> {
        let device = self
            .registry
            .get_mut(id)
            .ok_or_else(|| EngineError::DeviceNotFound(id.clone()))?;
        Ok(reconcile(self.store.as_ref(), self.settings, device, now, None, 0.0))
    }

    /// Apply the outcome of a command.
    ///
    /// Returns `None` if the device was deleted in the meantime.
    pub fn complete_command(
        &mut self,
        plan: &CommandPlan,
        result: Result<(), String>,
        now: DateTime<Local>,
    ) -> Option<CommandOutcome> {
        let device = self.registry.get_mut(&plan.device_id)?;

        let event = match result {
            Ok(()) => {
                let changed = device.counters.locked != plan.locked;
                device.counters.locked = plan.locked;
                if changed {
                    info!(
                        device_id = %plan.device_id,
                        locked = plan.locked,
                        reason = %plan.reason,
                        "Device lock state changed"
                    );
                    let event = if plan.locked {
                        AuditEventType::DeviceLocked {
                            device_id: plan.device_id.clone(),
                            reason: plan.reason,
                        }
                    } else {
                        AuditEventType::DeviceUnlocked {
                            device_id: plan.device_id.clone(),
                            reason: plan.reason,
                        }
                    };
                    append_audit(self.store.as_ref(), event);
                    Some(CoreEvent::LockChanged {
                        device_id: plan.device_id.clone(),
                        locked: plan.locked,
                        reason: plan.reason,
                    })
                } else {
                    debug!(device_id = %plan.device_id, "Lock re-asserted");
                    None
                }
            }
            Err(error) => {
                warn!(
                    device_id = %plan.device_id,
                    locked = plan.locked,
                    error = %error,
                    "Device command failed, will retry next tick"
                );
                append_audit(
                    self.store.as_ref(),
                    AuditEventType::CommandFailed {
                        device_id: plan.device_id.clone(),
                        locked: plan.locked,
                        error: error.clone(),
                    },
                );
                Some(CoreEvent::CommandFailed {
                    device_id: plan.device_id.clone(),
                    locked: plan.locked,
                    error,
                })
            }
        };

        persist_counters(self.store.as_ref(), device);
        Some(CommandOutcome {
            device_id: plan.device_id.clone(),
            status: device.status(now.weekday()),
            event,
        })
    }

    // External commands. Each mutates the device and reconciles it in the
    // same critical section.

    /// Override to the opposite of the current lock state
    pub fn toggle_lock(&mut self, id: &DeviceId, now: DateTime<Local>) -> EngineResult<Action> {
        let locked = self.require(id)?.counters.locked;
        self.set_lock(id, !locked, now)
    }

    /// Override to an explicit lock state
    pub fn set_lock(&mut self, id: &DeviceId, locked: bool, now: DateTime<Local>) -> EngineResult<Action> {
        let device = self.require_mut(id)?;
        device.counters.manual_override = Some(ManualOverride::from_locked(locked));
        info!(device_id = %id, locked, "Manual override set");
        self.audit(AuditEventType::OverrideSet {
            device_id: id.clone(),
            locked,
        });
        self.reconcile_device(id, now)
    }

    /// Give back `minutes` of budget and clear the override
    pub fn add_time(&mut self, id: &DeviceId, minutes: u32, now: DateTime<Local>) -> EngineResult<Action> {
        let device = self.require_mut(id)?;
        let counters = &mut device.counters;
        counters.elapsed_minutes = (counters.elapsed_minutes - minutes as f64).max(0.0);
        counters.manual_override = None;
        let elapsed_minutes = counters.elapsed_minutes;

        info!(device_id = %id, minutes, elapsed_minutes, "Time added");
        self.audit(AuditEventType::TimeAdded {
            device_id: id.clone(),
            minutes,
            elapsed_minutes,
        });
        self.reconcile_device(id, now)
    }

    /// Zero today's usage and clear the override
    pub fn reset_day(&mut self, id: &DeviceId, now: DateTime<Local>) -> EngineResult<Action> {
        let device = self.require_mut(id)?;
        device.counters.elapsed_minutes = 0.0;
        device.counters.manual_override = None;
        device.counters.last_reset_date = now.date_naive();

        info!(device_id = %id, "Day reset on request");
        self.audit(AuditEventType::DayReset {
            device_id: id.clone(),
            manual: true,
        });
        self.reconcile_device(id, now)
    }

    /// Clear the override and return to automatic control
    pub fn resume_automatic(&mut self, id: &DeviceId, now: DateTime<Local>) -> EngineResult<Action> {
        let device = self.require_mut(id)?;
        if device.counters.manual_override.take().is_some() {
            info!(device_id = %id, "Manual override cleared");
            self.audit(AuditEventType::OverrideCleared {
                device_id: id.clone(),
            });
        }
        self.reconcile_device(id, now)
    }

    #[cfg(test)]
    pub(crate) fn device_mut(&mut self, id: &DeviceId) -> Option<&mut Device> {
        self.registry.get_mut(id)
    }

    fn require(&self, id: &DeviceId) -> EngineResult<&Device> {
        self.registry
            .get(id)
            .ok_or_else(|| EngineError::DeviceNotFound(id.clone()))
    }

    fn require_mut(&mut self, id: &DeviceId) -> EngineResult<&mut Device> {
        self.registry
            .get_mut(id)
            .ok_or_else(|| EngineError::DeviceNotFound(id.clone()))
    }
}

/// One device, one pass: reset, observe, accrue, decide, persist
fn reconcile(
    store: &dyn Store,
    settings: EngineSettings,
    device: &mut Device,
    now: DateTime<Local>,
    probe: Option<ProbeResult>,
    delta_minutes: f64,
) -> Action {
    if decision::apply_daily_reset(&mut device.counters, now.date_naive()) {
        on_daily_reset(store, device);
    }

    if let Some(probe) = probe {
        device.online = probe.online;
        if let Some(reported) = probe.reported_locked
            && reported != device.counters.locked
        {
            info!(device_id = %device.id(), reported, "Device reported drifted lock state");
            device.counters.locked = reported;
        }
    }

    decision::accrue(
        &mut device.counters,
        device.online,
        device.definition.no_limit_mode,
        delta_minutes,
    );

    let Decision {
        desired_locked,
        reason,
        ..
    } = decision::evaluate(&device.definition, &device.counters, now);
    device.last_reason = Some(reason);

    persist_counters(store, device);

    if decision::should_dispatch(
        desired_locked,
        device.counters.locked,
        device.online,
        settings.reassert_lock,
    ) {
        Action::SendCommand(CommandPlan {
            device_id: device.id().clone(),
            address: device.definition.address.clone(),
            locked: desired_locked,
            reason,
        })
    } else {
        Action::Publish {
            device_id: device.id().clone(),
            status: device.status(now.weekday()),
        }
    }
}

fn on_daily_reset(store: &dyn Store, device: &Device) {
    info!(device_id = %device.id(), date = %device.counters.last_reset_date, "Daily usage reset");
    append_audit(
        store,
        AuditEventType::DayReset {
            device_id: device.id().clone(),
            manual: false,
        },
    );
    persist_counters(store, device);
}

fn persist_counters(store: &dyn Store, device: &Device) {
    if let Err(e) = store.save_counters(device.id(), &device.counters) {
        warn!(device_id = %device.id(), error = %e, "Failed to persist counters, will retry");
    }
}

fn append_audit(store: &dyn Store, event: AuditEventType) {
    if let Err(e) = store.append_audit(AuditEvent::new(event)) {
        warn!(error = %e, "Failed to append audit event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kidslock_api::{DaySchedule, Remaining, WeeklySchedule};
    use kidslock_store::SqliteStore;
    use kidslock_util::WallClock;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Local> {
        // June 2025; the 11th is a Wednesday
        Local.with_ymd_and_hms(2025, 6, d, h, m, 0).unwrap()
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            tick_interval: Duration::from_secs(60),
            reassert_lock: false,
        }
    }

    fn engine_with(definitions: &[DeviceDefinition], now: DateTime<Local>) -> (ReconcileEngine, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut engine = ReconcileEngine::new(store.clone(), settings());
        engine.seed(definitions, now.date_naive());
        (engine, store)
    }

    fn tv() -> DeviceDefinition {
        DeviceDefinition::new("TV", "10.0.0.5").with_schedule(WeeklySchedule::uniform(
            DaySchedule::new(120, WallClock::new(20, 0).unwrap()),
        ))
    }

    fn id() -> DeviceId {
        DeviceId::new("tv")
    }

    fn online() -> HashMap<DeviceId, ProbeResult> {
        HashMap::from([(
            id(),
            ProbeResult {
                online: true,
                reported_locked: None,
            },
        )])
    }

    fn offline() -> HashMap<DeviceId, ProbeResult> {
        HashMap::from([(id(), ProbeResult::default())])
    }

    fn command(actions: &[Action]) -> Option<&CommandPlan> {
        actions.iter().find_map(|a| match a {
            Action::SendCommand(plan) => Some(plan),
            _ => None,
        })
    }

    #[test]
    fn exhausted_budget_issues_lock_command() {
        let now = at(11, 15, 0);
        let (mut engine, _) = engine_with(&[tv()], now);
        engine.registry.get_mut(&id()).unwrap().counters.elapsed_minutes = 119.0;

        let t0 = MonotonicInstant::now();
        assert_eq!(engine.prepare_tick(now).len(), 1);
        let actions = engine.tick(now, t0, &online());
        assert!(command(&actions).is_none(), "first tick accrues nothing");

        let later = at(11, 15, 2);
        engine.prepare_tick(later);
        let actions = engine.tick(later, t0 + Duration::from_secs(120), &online());
        let device = engine.device(&id()).unwrap();
        assert!((device.counters.elapsed_minutes - 121.0).abs() < 1e-9);

        let plan = command(&actions).expect("lock command");
        assert!(plan.locked);
        assert_eq!(plan.reason, DecisionReason::TimeLimitReached);

        let outcome = engine.complete_command(plan, Ok(()), later).unwrap();
        assert!(outcome.status.locked);
        assert_eq!(outcome.status.remaining, Remaining::Minutes(0));
        assert!(matches!(outcome.event, Some(CoreEvent::LockChanged { locked: true, .. })));
        assert!(engine.device(&id()).unwrap().counters.locked);
    }

    #[test]
    fn bedtime_locks_late_evening_and_early_morning() {
        let evening = at(11, 23, 30);
        let (mut engine, _) = engine_with(&[tv()], evening);
        engine.prepare_tick(evening);
        let actions = engine.tick(evening, MonotonicInstant::now(), &online());
        let plan = command(&actions).unwrap();
        assert!(plan.locked);
        assert_eq!(plan.reason, DecisionReason::Bedtime);

        let early = at(12, 2, 0);
        let (mut engine, _) = engine_with(&[tv()], early);
        engine.prepare_tick(early);
        let actions = engine.tick(early, MonotonicInstant::now(), &online());
        assert!(command(&actions).unwrap().locked);
    }

    #[test]
    fn add_time_unlocks_immediately() {
        let now = at(11, 15, 0);
        let (mut engine, _) = engine_with(&[tv()], now);
        {
            let device = engine.registry.get_mut(&id()).unwrap();
            device.counters.elapsed_minutes = 125.0;
            device.counters.locked = true;
            device.counters.manual_override = Some(ManualOverride::Lock);
        }

        let action = engine.add_time(&id(), 30, now).unwrap();
        let device = engine.device(&id()).unwrap();
        assert_eq!(device.counters.manual_override, None);
        assert!((device.counters.elapsed_minutes - 95.0).abs() < 1e-9);

        match action {
            Action::SendCommand(plan) => {
                assert!(!plan.locked);
                assert_eq!(plan.reason, DecisionReason::WithinBudget);
            }
            other => panic!("expected unlock command, got {:?}", other),
        }
    }

    #[test]
    fn add_time_floors_at_zero() {
        let now = at(11, 15, 0);
        let (mut engine, _) = engine_with(&[tv()], now);
        engine.registry.get_mut(&id()).unwrap().counters.elapsed_minutes = 10.0;
        engine.add_time(&id(), 30, now).unwrap();
        assert_eq!(engine.device(&id()).unwrap().counters.elapsed_minutes, 0.0);
    }

    #[test]
    fn offline_device_does_not_accrue() {
        let now = at(11, 15, 0);
        let (mut engine, _) = engine_with(&[tv()], now);
        engine.registry.get_mut(&id()).unwrap().counters.elapsed_minutes = 40.0;

        let t0 = MonotonicInstant::now();
        engine.tick(now, t0, &offline());
        let actions = engine.tick(at(11, 15, 1), t0 + Duration::from_secs(60), &offline());

        assert_eq!(engine.device(&id()).unwrap().counters.elapsed_minutes, 40.0);
        assert_eq!(
            actions,
            vec![Action::Publish {
                device_id: id(),
                status: DeviceStatus {
                    locked: false,
                    remaining: Remaining::Minutes(80),
                    online: false,
                },
            }]
        );
    }

    #[test]
    fn rollover_resets_usage_and_override() {
        let today = at(11, 22, 0);
        let (mut engine, store) = engine_with(&[tv()], today);
        {
            let device = engine.registry.get_mut(&id()).unwrap();
            device.counters.elapsed_minutes = 80.0;
            device.counters.manual_override = Some(ManualOverride::Unlock);
        }

        let tomorrow = at(12, 9, 0);
        engine.prepare_tick(tomorrow);
        let device = engine.device(&id()).unwrap();
        assert_eq!(device.counters.elapsed_minutes, 0.0);
        assert_eq!(device.counters.manual_override, None);
        assert_eq!(device.counters.last_reset_date, tomorrow.date_naive());

        let persisted = store.get_device(&id()).unwrap().unwrap();
        assert_eq!(persisted.counters.elapsed_minutes, 0.0);
        assert_eq!(persisted.counters.last_reset_date, tomorrow.date_naive());
    }

    #[test]
    fn toggle_sets_opposite_override() {
        let now = at(11, 15, 0);
        let (mut engine, _) = engine_with(&[tv()], now);

        let action = engine.toggle_lock(&id(), now).unwrap();
        assert_eq!(
            engine.device(&id()).unwrap().counters.manual_override,
            Some(ManualOverride::Lock)
        );
        let Action::SendCommand(plan) = action else {
            panic!("expected lock command");
        };
        assert!(plan.locked);
        assert_eq!(plan.reason, DecisionReason::Manual);
        engine.complete_command(&plan, Ok(()), now);

        engine.toggle_lock(&id(), now).unwrap();
        assert_eq!(
            engine.device(&id()).unwrap().counters.manual_override,
            Some(ManualOverride::Unlock)
        );
    }

    #[test]
    fn manual_unlock_survives_exhausted_budget_until_resume() {
        let now = at(11, 15, 0);
        let (mut engine, _) = engine_with(&[tv()], now);
        engine.registry.get_mut(&id()).unwrap().counters.elapsed_minutes = 200.0;
        engine.registry.get_mut(&id()).unwrap().counters.locked = true;

        let Action::SendCommand(plan) = engine.set_lock(&id(), false, now).unwrap() else {
            panic!("expected unlock command");
        };
        engine.complete_command(&plan, Ok(()), now);

        let actions = engine.tick(now, MonotonicInstant::now(), &online());
        assert!(command(&actions).is_none());

        let action = engine.resume_automatic(&id(), now).unwrap();
        assert!(matches!(action, Action::SendCommand(CommandPlan { locked: true, .. })));
    }

    #[test]
    fn failed_command_keeps_locked_and_retries() {
        let now = at(11, 23, 0);
        let (mut engine, store) = engine_with(&[tv()], now);

        let actions = engine.tick(now, MonotonicInstant::now(), &online());
        let plan = command(&actions).unwrap().clone();
        let outcome = engine
            .complete_command(&plan, Err("connection refused".into()), now)
            .unwrap();
        assert!(!outcome.status.locked);
        assert!(matches!(outcome.event, Some(CoreEvent::CommandFailed { .. })));

        let actions = engine.tick(now, MonotonicInstant::now(), &online());
        assert!(command(&actions).is_some(), "command retried on next tick");

        let audits = store.get_recent_audits(10).unwrap();
        assert!(audits
            .iter()
            .any(|a| matches!(a.event, AuditEventType::CommandFailed { .. })));
    }

    #[test]
    fn repeated_state_is_idempotent_without_reassert() {
        let now = at(11, 15, 0);
        let (mut engine, _) = engine_with(&[tv()], now);
        let t0 = MonotonicInstant::now();
        let first = engine.tick(now, t0, &online());
        let second = engine.tick(now, t0, &online());
        assert!(command(&first).is_none());
        assert!(command(&second).is_none());
    }

    #[test]
    fn reassert_lock_heals_drift_when_online() {
        let now = at(11, 23, 0);
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut engine = ReconcileEngine::new(
            store,
            EngineSettings {
                tick_interval: Duration::from_secs(30),
                reassert_lock: true,
            },
        );
        engine.seed(&[tv()], now.date_naive());
        engine.registry.get_mut(&id()).unwrap().counters.locked = true;

        let actions = engine.tick(now, MonotonicInstant::now(), &online());
        let plan = command(&actions).unwrap().clone();
        assert!(plan.locked);
        let outcome = engine.complete_command(&plan, Ok(()), now).unwrap();
        assert_eq!(outcome.event, None, "re-assert is not a state change");

        let actions = engine.tick(now, MonotonicInstant::now(), &offline());
        assert!(command(&actions).is_none(), "no re-assert while offline");
    }

    #[test]
    fn status_read_back_corrects_drift() {
        let now = at(11, 15, 0);
        let (mut engine, _) = engine_with(&[tv()], now);
        let probes = HashMap::from([(
            id(),
            ProbeResult {
                online: true,
                reported_locked: Some(true),
            },
        )]);

        let actions = engine.tick(now, MonotonicInstant::now(), &probes);
        let plan = command(&actions).expect("unlock to match desired state");
        assert!(!plan.locked);
    }

    #[test]
    fn no_limit_device_never_locks_automatically() {
        let now = at(11, 23, 30);
        let (mut engine, _) = engine_with(&[tv().with_no_limit(true)], now);
        engine.registry.get_mut(&id()).unwrap().counters.elapsed_minutes = 999.0;

        let t0 = MonotonicInstant::now();
        engine.tick(now, t0, &online());
        let actions = engine.tick(now, t0 + Duration::from_secs(60), &online());
        assert!(command(&actions).is_none());
        assert_eq!(engine.device(&id()).unwrap().counters.elapsed_minutes, 999.0);
        assert_eq!(
            engine.device(&id()).unwrap().last_reason,
            Some(DecisionReason::NoLimit)
        );
    }

    #[test]
    fn crud_round_trip() {
        let now = at(11, 10, 0);
        let (mut engine, store) = engine_with(&[], now);

        let view = engine.create_device(tv(), now).unwrap();
        assert_eq!(view.remaining, Remaining::Minutes(120));
        assert!(matches!(
            engine.create_device(tv(), now),
            Err(EngineError::DeviceExists(_))
        ));

        engine.registry.get_mut(&id()).unwrap().counters.elapsed_minutes = 30.0;
        let updated = engine
            .update_device(DeviceDefinition { address: "10.0.0.99".into(), ..tv() }, now)
            .unwrap();
        assert_eq!(updated.address, "10.0.0.99");
        assert_eq!(updated.elapsed_minutes, 30.0);

        let invalid = DeviceDefinition { address: String::new(), ..tv() };
        assert!(matches!(
            engine.update_device(invalid, now),
            Err(EngineError::InvalidDefinition(_))
        ));

        engine.delete_device(&id()).unwrap();
        assert!(store.get_device(&id()).unwrap().is_none());
        assert!(matches!(
            engine.delete_device(&id()),
            Err(EngineError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn seeding_keeps_existing_counters() {
        let now = at(11, 10, 0);
        let (mut engine, store) = engine_with(&[tv()], now);
        engine.registry.get_mut(&id()).unwrap().counters.elapsed_minutes = 45.0;
        persist_counters(store.as_ref(), engine.device(&id()).unwrap());

        let mut restarted = ReconcileEngine::new(store.clone(), settings());
        assert_eq!(restarted.load().unwrap(), 1);
        let renamed = DeviceDefinition { name: "Big TV".into(), ..tv() };
        restarted.seed(&[renamed], now.date_naive());

        let device = restarted.device(&id()).unwrap();
        assert_eq!(device.definition.name, "Big TV");
        assert_eq!(device.counters.elapsed_minutes, 45.0);
    }

    #[test]
    fn deleted_mid_tick_is_ignored() {
        let now = at(11, 23, 0);
        let (mut engine, _) = engine_with(&[tv()], now);
        let actions = engine.tick(now, MonotonicInstant::now(), &online());
        let plan = command(&actions).unwrap().clone();

        engine.delete_device(&id()).unwrap();
        assert!(engine.complete_command(&plan, Ok(()), now).is_none());
        assert!(engine.tick(now, MonotonicInstant::now(), &online()).is_empty());
    }

    /// Store that rejects every read and write
    struct BrokenStore;

    impl Store for BrokenStore {
        fn append_audit(&self, _event: AuditEvent) -> Result<(), StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }

        fn get_recent_audits(&self, _limit: usize) -> Result<Vec<AuditEvent>, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }

        fn load_devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }

        fn get_device(&self, _id: &DeviceId) -> Result<Option<DeviceRecord>, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }

        fn upsert_device(&self, _record: &DeviceRecord) -> Result<(), StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }

        fn save_counters(&self, _id: &DeviceId, _counters: &DeviceCounters) -> Result<(), StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }

        fn delete_device(&self, _id: &DeviceId) -> Result<bool, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }

        fn is_healthy(&self) -> bool {
            false
        }
    }

    #[test]
    fn store_failures_keep_state_in_memory() {
        let now = at(11, 15, 0);
        let mut engine = ReconcileEngine::new(Arc::new(BrokenStore), settings());
        assert!(engine.load().is_err());
        assert_eq!(engine.seed(&[tv()], now.date_naive()), 1);
        assert!(!engine.store_healthy());

        let t0 = MonotonicInstant::now();
        engine.prepare_tick(now);
        engine.tick(now, t0, &online());
        let later = at(11, 15, 2);
        engine.prepare_tick(later);
        let actions = engine.tick(later, t0 + Duration::from_secs(120), &online());
        assert_eq!(actions.len(), 1);
        assert!(command(&actions).is_none());
        let device = engine.device(&id()).unwrap();
        assert!((device.counters.elapsed_minutes - 2.0).abs() < 1e-9);

        let Action::SendCommand(plan) = engine.toggle_lock(&id(), later).unwrap() else {
            panic!("expected lock command");
        };
        assert!(plan.locked);
        assert_eq!(plan.reason, DecisionReason::Manual);

        let outcome = engine.complete_command(&plan, Ok(()), later).unwrap();
        assert!(outcome.status.locked);
        assert!(matches!(outcome.event, Some(CoreEvent::LockChanged { locked: true, .. })));

        let view = engine.device_view(&id(), later).unwrap();
        assert!(view.locked);
        assert_eq!(view.manual_override, Some(ManualOverride::Lock));
        assert!(engine.recent_audits(10).is_err());
    }
}

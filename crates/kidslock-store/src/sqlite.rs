//! SQLite-based store implementation

use chrono::{DateTime, Local, NaiveDate};
use kidslock_api::{DaySchedule, DeviceDefinition, ManualOverride, WeeklySchedule, WEEKDAYS};
use kidslock_util::{DeviceId, WallClock};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::{AuditEvent, DeviceCounters, DeviceRecord, Store, StoreError, StoreResult};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// A `devices` row before decoding
struct DeviceRow {
    id: String,
    name: String,
    address: String,
    no_limit: bool,
    elapsed_minutes: f64,
    last_reset_date: String,
    manual_override: Option<String>,
    locked: bool,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection lock poisoned".into()))
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- Audit log (append-only)
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_json TEXT NOT NULL
            );

            -- Device registry and daily counters
            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                address TEXT NOT NULL,
                no_limit INTEGER NOT NULL DEFAULT 0,
                elapsed_minutes REAL NOT NULL DEFAULT 0,
                last_reset_date TEXT NOT NULL,
                manual_override TEXT,
                locked INTEGER NOT NULL DEFAULT 0
            );

            -- One row per device and weekday (0 = Monday)
            CREATE TABLE IF NOT EXISTS device_schedule (
                device_id TEXT NOT NULL,
                weekday INTEGER NOT NULL,
                limit_minutes INTEGER NOT NULL,
                bedtime TEXT NOT NULL,
                PRIMARY KEY (device_id, weekday)
            );

            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }

    fn load_schedule(conn: &Connection, device_id: &str) -> StoreResult<Result<WeeklySchedule, String>> {
        let mut stmt = conn.prepare(
            "SELECT weekday, limit_minutes, bedtime FROM device_schedule WHERE device_id = ?",
        )?;
        let rows = stmt.query_map([device_id], |row| {
            let weekday: i64 = row.get(0)?;
            let limit: i64 = row.get(1)?;
            let bedtime: String = row.get(2)?;
            Ok((weekday, limit, bedtime))
        })?;

        let mut schedule = WeeklySchedule::default();
        for row in rows {
            let (weekday, limit, bedtime) = row?;
            let Some(weekday) = usize::try_from(weekday).ok().and_then(|i| WEEKDAYS.get(i).copied()) else {
                return Ok(Err(format!("invalid weekday index {}", weekday)));
            };
            let limit = match u32::try_from(limit) {
                Ok(l) if l > 0 => l,
                _ => return Ok(Err(format!("invalid limit {} for {}", limit, weekday))),
            };
            let bedtime = match bedtime.parse::<WallClock>() {
                Ok(b) => b,
                Err(e) => return Ok(Err(e.to_string())),
            };
            schedule.set(weekday, DaySchedule::new(limit, bedtime));
        }
        Ok(Ok(schedule))
    }

    fn decode_device(conn: &Connection, row: DeviceRow) -> StoreResult<Result<DeviceRecord, String>> {
        let last_reset_date = match NaiveDate::parse_from_str(&row.last_reset_date, DATE_FORMAT) {
            Ok(d) => d,
            Err(_) => return Ok(Err(format!("invalid reset date '{}'", row.last_reset_date))),
        };
        let manual_override = match row.manual_override.as_deref() {
            None => None,
            Some(s) => match ManualOverride::parse(s) {
                Some(o) => Some(o),
                None => return Ok(Err(format!("invalid manual override '{}'", s))),
            },
        };
        let schedule = match Self::load_schedule(conn, &row.id)? {
            Ok(s) => s,
            Err(e) => return Ok(Err(e)),
        };

        Ok(Ok(DeviceRecord {
            definition: DeviceDefinition {
                id: DeviceId::new(row.id),
                name: row.name,
                address: row.address,
                schedule,
                no_limit_mode: row.no_limit,
            },
            counters: DeviceCounters {
                elapsed_minutes: row.elapsed_minutes.max(0.0),
                last_reset_date,
                manual_override,
                locked: row.locked,
            },
        }))
    }

    fn read_device_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceRow> {
        Ok(DeviceRow {
            id: row.get(0)?,
            name: row.get(1)?,
            address: row.get(2)?,
            no_limit: row.get(3)?,
            elapsed_minutes: row.get(4)?,
            last_reset_date: row.get(5)?,
            manual_override: row.get(6)?,
            locked: row.get(7)?,
        })
    }
}

const DEVICE_COLUMNS: &str =
    "id, name, address, no_limit, elapsed_minutes, last_reset_date, manual_override, locked";

impl Store for SqliteStore {
    fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        let conn = self.conn()?;
        let event_json = serde_json::to_string(&event.event)?;

        conn.execute(
            "INSERT INTO audit_log (timestamp, event_json) VALUES (?, ?)",
            params![event.timestamp.to_rfc3339(), event_json],
        )?;

        event.id = conn.last_insert_rowid();
        debug!(event_id = event.id, "Audit event appended");

        Ok(())
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let timestamp_str: String = row.get(1)?;
            let event_json: String = row.get(2)?;
            Ok((id, timestamp_str, event_json))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp_str, event_json) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
                .map(|dt| dt.with_timezone(&Local))
                .unwrap_or_else(|_| kidslock_util::now());
            let event = match serde_json::from_str(&event_json) {
                Ok(e) => e,
                Err(e) => {
                    warn!(event_id = id, error = %e, "Skipping undecodable audit event");
                    continue;
                }
            };

            events.push(AuditEvent {
                id,
                timestamp,
                event,
            });
        }

        Ok(events)
    }

    fn load_devices(&self) -> StoreResult<Vec<DeviceRecord>> {
        let conn = self.conn()?;

        let rows: Vec<DeviceRow> = {
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM devices ORDER BY id", DEVICE_COLUMNS))?;
            let rows = stmt.query_map([], Self::read_device_row)?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut devices = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match Self::decode_device(&conn, row)? {
                Ok(record) => devices.push(record),
                Err(reason) => {
                    warn!(device_id = %id, reason = %reason, "Skipping undecodable device row");
                }
            }
        }

        debug!(count = devices.len(), "Devices loaded");
        Ok(devices)
    }

    fn get_device(&self, id: &DeviceId) -> StoreResult<Option<DeviceRecord>> {
        let conn = self.conn()?;

        let row = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE id = ?", DEVICE_COLUMNS),
                [id.as_str()],
                Self::read_device_row,
            )
            .optional()?;

        match row {
            Some(row) => match Self::decode_device(&conn, row)? {
                Ok(record) => Ok(Some(record)),
                Err(reason) => {
                    warn!(device_id = %id, reason = %reason, "Undecodable device row");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn upsert_device(&self, record: &DeviceRecord) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let def = &record.definition;
        let counters = &record.counters;

        tx.execute(
            r#"
            INSERT INTO devices
                (id, name, address, no_limit, elapsed_minutes, last_reset_date, manual_override, locked)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                address = excluded.address,
                no_limit = excluded.no_limit,
                elapsed_minutes = excluded.elapsed_minutes,
                last_reset_date = excluded.last_reset_date,
                manual_override = excluded.manual_override,
                locked = excluded.locked
            "#,
            params![
                def.id.as_str(),
                def.name,
                def.address,
                def.no_limit_mode,
                counters.elapsed_minutes,
                counters.last_reset_date.format(DATE_FORMAT).to_string(),
                counters.manual_override.map(ManualOverride::as_str),
                counters.locked,
            ],
        )?;

        for (index, (_, day)) in def.schedule.days().enumerate() {
            tx.execute(
                r#"
                INSERT INTO device_schedule (device_id, weekday, limit_minutes, bedtime)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(device_id, weekday) DO UPDATE SET
                    limit_minutes = excluded.limit_minutes,
                    bedtime = excluded.bedtime
                "#,
                params![
                    def.id.as_str(),
                    index as i64,
                    day.limit_minutes,
                    day.bedtime.to_string()
                ],
            )?;
        }

        tx.commit()?;
        debug!(device_id = %def.id, "Device upserted");
        Ok(())
    }

    fn save_counters(&self, id: &DeviceId, counters: &DeviceCounters) -> StoreResult<()> {
        let conn = self.conn()?;

        let updated = conn.execute(
            r#"
            UPDATE devices SET
                elapsed_minutes = ?,
                last_reset_date = ?,
                manual_override = ?,
                locked = ?
            WHERE id = ?
            "#,
            params![
                counters.elapsed_minutes,
                counters.last_reset_date.format(DATE_FORMAT).to_string(),
                counters.manual_override.map(ManualOverride::as_str),
                counters.locked,
                id.as_str(),
            ],
        )?;

        if updated == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn delete_device(&self, id: &DeviceId) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM device_schedule WHERE device_id = ?", [id.as_str()])?;
        let removed = tx.execute("DELETE FROM devices WHERE id = ?", [id.as_str()])?;
        tx.commit()?;

        debug!(device_id = %id, removed, "Device deleted");
        Ok(removed > 0)
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}

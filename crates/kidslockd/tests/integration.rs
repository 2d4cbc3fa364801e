//! Integration tests for kidslockd
//!
//! These tests verify the end-to-end behavior of the daemon.

use chrono::{Local, TimeZone};
use kidslock_api::{
    Command, DeviceDefinition, ErrorCode, EventPayload, ResponsePayload, ResponseResult,
};
use kidslock_config::{parse_config, Policy};
use kidslock_core::{DriverSettings, EngineSettings, ReconcileEngine, Reconciler};
use kidslock_device_api::{MockProber, MockPublisher, MockRemote};
use kidslock_ipc::{EventStream, IpcClient};
use kidslock_store::{SqliteStore, Store};
use kidslock_util::{DeviceId, MonotonicInstant};
use kidslockd::Service;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

const CONFIG: &str = r#"
config_version = 1

[service]
tick_interval_seconds = 30

[[devices]]
name = "TV"
address = "10.0.0.5"
daily_limit_minutes = 120
bedtime = "20:00"

[[devices]]
name = "Tablet"
address = "10.0.0.6"
no_limit = true
"#;

fn make_test_policy() -> Policy {
    parse_config(CONFIG).unwrap()
}

struct Running {
    remote: MockRemote,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

async fn start_service(socket_path: &Path) -> Running {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
    let remote = MockRemote::new();
    let service = Service::new(
        make_test_policy(),
        socket_path,
        store,
        Arc::new(MockProber::new(true)),
        Arc::new(remote.clone()),
    )
    .await
    .unwrap();

    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(service.run(rx));
    Running {
        remote,
        shutdown,
        handle,
    }
}

async fn ok(client: &mut IpcClient, command: Command) -> ResponsePayload {
    match client.send(command).await.unwrap().result {
        ResponseResult::Ok(payload) => payload,
        ResponseResult::Err(e) => panic!("request failed: {:?}", e),
    }
}

async fn err(client: &mut IpcClient, command: Command) -> ErrorCode {
    match client.send(command).await.unwrap().result {
        ResponseResult::Err(e) => e.code,
        ResponseResult::Ok(payload) => panic!("expected an error, got {:?}", payload),
    }
}

/// Skip events until one matches
async fn wait_for(events: &mut EventStream, matches: impl Fn(&EventPayload) -> bool) -> EventPayload {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.next().await.unwrap();
            if matches(&event.payload) {
                return event.payload;
            }
        }
    })
    .await
    .expect("event not received")
}

#[test]
fn test_policy_loading() {
    let policy = make_test_policy();
    assert_eq!(policy.devices.len(), 2);
    assert_eq!(policy.devices[0].id.as_str(), "tv");
    assert!(policy.devices[1].no_limit_mode);
}

#[tokio::test]
async fn test_counters_survive_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("kidslock.db");
    let policy = make_test_policy();
    let tv = DeviceId::new("tv");
    let day = Local.with_ymd_and_hms(2025, 6, 11, 15, 0, 0).unwrap();
    let settings = DriverSettings {
        tick_interval: Duration::from_secs(60),
        probe_timeout: Duration::from_millis(200),
        command_timeout: Duration::from_millis(200),
        poll_status: false,
    };

    let build = || {
        let store = Arc::new(SqliteStore::open(&db_path).unwrap());
        let mut engine = ReconcileEngine::new(
            store,
            EngineSettings {
                tick_interval: Duration::from_secs(60),
                reassert_lock: true,
            },
        );
        engine.load().unwrap();
        engine.seed(&policy.devices, day.date_naive());
        Reconciler::new(
            Arc::new(Mutex::new(engine)),
            Arc::new(MockProber::new(true)),
            Arc::new(MockRemote::new()),
            Arc::new(MockPublisher::new()),
            settings,
        )
    };

    {
        let reconciler = build();
        let t0 = MonotonicInstant::now();
        reconciler.run_tick_at(day, t0).await;
        reconciler
            .run_tick_at(day + chrono::Duration::minutes(2), t0 + Duration::from_secs(120))
            .await;
        reconciler.set_lock(&tv, true, day).await.unwrap();
    }

    let reconciler = build();
    let view = reconciler
        .engine()
        .lock()
        .await
        .device_view(&tv, day)
        .unwrap();
    assert!((view.elapsed_minutes - 2.0).abs() < 1e-9);
    assert!(view.locked);
    assert!(view.manual_override.is_some());
}

#[tokio::test]
async fn test_ipc_end_to_end() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("kidslockd.sock");
    let running = start_service(&socket_path).await;

    let mut client = IpcClient::connect(&socket_path).await.unwrap();
    assert!(matches!(ok(&mut client, Command::Ping).await, ResponsePayload::Pong));

    let ResponsePayload::Devices { devices } = ok(&mut client, Command::ListDevices).await else {
        panic!("expected device list");
    };
    let ids: Vec<_> = devices.iter().map(|d| d.device_id.as_str()).collect();
    assert_eq!(ids, vec!["tablet", "tv"]);

    let observer = IpcClient::connect(&socket_path).await.unwrap();
    let mut events = observer.subscribe().await.unwrap();

    // Manual overrides go straight to the device
    let ResponsePayload::Device { device } = ok(
        &mut client,
        Command::SetLock {
            device_id: DeviceId::new("tv"),
            locked: true,
        },
    )
    .await
    else {
        panic!("expected device view");
    };
    assert!(device.locked);
    assert!(running.remote.sent().iter().any(|c| c.address == "10.0.0.5" && c.locked));

    let ResponsePayload::Device { device } = ok(
        &mut client,
        Command::SetLock {
            device_id: DeviceId::new("tv"),
            locked: false,
        },
    )
    .await
    else {
        panic!("expected device view");
    };
    assert!(!device.locked);

    let changed = wait_for(&mut events, |p| {
        matches!(p, EventPayload::LockChanged { locked: false, .. })
    })
    .await;
    assert!(matches!(changed, EventPayload::LockChanged { device_id, .. } if device_id.as_str() == "tv"));

    // A late subscriber gets the retained state
    let late = IpcClient::connect(&socket_path).await.unwrap();
    let late_events = late.subscribe().await.unwrap();
    let tv_state = late_events
        .retained()
        .iter()
        .find(|r| r.device_id.as_str() == "tv")
        .expect("tv state retained");
    assert!(!tv_state.status.locked);

    // Errors map to protocol codes
    assert_eq!(
        err(
            &mut client,
            Command::GetDevice {
                device_id: DeviceId::new("nope")
            }
        )
        .await,
        ErrorCode::DeviceNotFound
    );
    assert_eq!(
        err(
            &mut client,
            Command::AddTime {
                device_id: DeviceId::new("tv"),
                minutes: 0
            }
        )
        .await,
        ErrorCode::InvalidRequest
    );
    assert_eq!(
        err(
            &mut client,
            Command::CreateDevice {
                device: DeviceDefinition::new("TV", "10.0.0.9")
            }
        )
        .await,
        ErrorCode::DeviceExists
    );
    assert_eq!(
        err(
            &mut client,
            Command::CreateDevice {
                device: DeviceDefinition::new("Console", "")
            }
        )
        .await,
        ErrorCode::ValidationFailed
    );

    // Create and delete round trip, with the retained state withdrawn
    ok(
        &mut client,
        Command::CreateDevice {
            device: DeviceDefinition::new("Console", "10.0.0.7"),
        },
    )
    .await;
    ok(
        &mut client,
        Command::DeleteDevice {
            device_id: DeviceId::new("console"),
        },
    )
    .await;
    let removed = wait_for(&mut events, |p| matches!(p, EventPayload::DeviceRemoved { .. })).await;
    assert!(matches!(removed, EventPayload::DeviceRemoved { device_id } if device_id.as_str() == "console"));

    let ResponsePayload::RecentEvents { events: audits } =
        ok(&mut client, Command::GetRecentEvents { limit: 50 }).await
    else {
        panic!("expected audit entries");
    };
    assert!(audits.iter().any(|a| a.event["type"] == "device_deleted"));
    assert!(audits.iter().any(|a| a.event["type"] == "override_set"));

    running.shutdown.send(true).unwrap();
    wait_for(&mut events, |p| matches!(p, EventPayload::Shutdown)).await;
    tokio::time::timeout(Duration::from_secs(5), running.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_health_reports_ready_after_first_tick() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("kidslockd.sock");
    let running = start_service(&socket_path).await;
    let mut client = IpcClient::connect(&socket_path).await.unwrap();

    let mut ready = false;
    for _ in 0..100 {
        let ResponsePayload::Health(health) = ok(&mut client, Command::GetHealth).await else {
            panic!("expected health");
        };
        assert!(health.live);
        assert!(health.store_ok);
        assert_eq!(health.device_count, 2);
        if health.ready {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(ready, "service never became ready");

    running.shutdown.send(true).unwrap();
    running.handle.await.unwrap().unwrap();
}

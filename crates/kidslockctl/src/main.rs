//! kidslockctl - talk to a running kidslockd over its local socket

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kidslock_api::{
    AuditEntryView, Command, DaySchedule, DeviceDefinition, DeviceView, EventPayload,
    HealthStatus, ResponsePayload, ResponseResult, WeeklySchedule,
};
use kidslock_ipc::IpcClient;
use kidslock_util::{default_socket_path, format_datetime_full, DeviceId, WallClock};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kidslockctl")]
#[command(about = "Inspect and control devices managed by kidslockd", long_about = None)]
struct Cli {
    /// Socket path (or set KIDSLOCK_SOCKET env var)
    #[arg(short, long, env = "KIDSLOCK_SOCKET", default_value_os_t = default_socket_path())]
    socket: PathBuf,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List every device with its lock state and remaining time
    #[command(alias = "list")]
    Status,

    /// Show one device in detail
    Show { device: String },

    /// Lock a device until `resume`
    Lock { device: String },

    /// Unlock a device until `resume`
    Unlock { device: String },

    /// Flip the current lock state
    Toggle { device: String },

    /// Drop the manual override and return to schedule enforcement
    Resume { device: String },

    /// Grant extra minutes for today
    AddTime { device: String, minutes: u32 },

    /// Forget today's usage
    ResetDay { device: String },

    /// Register a new device
    Add {
        name: String,
        address: String,

        /// Daily budget in minutes
        #[arg(long)]
        limit: Option<u32>,

        /// Bedtime as HH:MM
        #[arg(long)]
        bedtime: Option<WallClock>,

        /// Track the device without enforcing anything
        #[arg(long)]
        no_limit: bool,
    },

    /// Delete a device
    #[command(alias = "rm")]
    Remove { device: String },

    /// Show the audit log
    Events {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Follow device state changes
    Watch,

    /// Service health
    Health,

    /// Check that the service answers
    Ping,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn device_id(s: &str) -> DeviceId {
    DeviceId::new(s)
}

async fn request(client: &mut IpcClient, command: Command) -> Result<ResponsePayload> {
    debug!(?command, "Sending request");
    let response = client.send(command).await.context("Request failed")?;
    match response.result {
        ResponseResult::Ok(payload) => Ok(payload),
        ResponseResult::Err(e) => bail!("{:?}: {}", e.code, e.message),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut client = IpcClient::connect(&cli.socket)
        .await
        .with_context(|| format!("Cannot connect to kidslockd at {:?}", cli.socket))?;

    let command = match cli.command {
        Cmd::Watch => return watch(client, cli.json).await,
        Cmd::Status => Command::ListDevices,
        Cmd::Show { device } => Command::GetDevice {
            device_id: device_id(&device),
        },
        Cmd::Lock { device } => Command::SetLock {
            device_id: device_id(&device),
            locked: true,
        },
        Cmd::Unlock { device } => Command::SetLock {
            device_id: device_id(&device),
            locked: false,
        },
        Cmd::Toggle { device } => Command::ToggleLock {
            device_id: device_id(&device),
        },
        Cmd::Resume { device } => Command::ResumeAutomatic {
            device_id: device_id(&device),
        },
        Cmd::AddTime { device, minutes } => Command::AddTime {
            device_id: device_id(&device),
            minutes,
        },
        Cmd::ResetDay { device } => Command::ResetDay {
            device_id: device_id(&device),
        },
        Cmd::Add {
            name,
            address,
            limit,
            bedtime,
            no_limit,
        } => {
            let defaults = DaySchedule::default();
            let day = DaySchedule::new(
                limit.unwrap_or(defaults.limit_minutes),
                bedtime.unwrap_or(defaults.bedtime),
            );
            let device = DeviceDefinition::new(name, address)
                .with_schedule(WeeklySchedule::uniform(day))
                .with_no_limit(no_limit);
            Command::CreateDevice { device }
        }
        Cmd::Remove { device } => Command::DeleteDevice {
            device_id: device_id(&device),
        },
        Cmd::Events { limit } => Command::GetRecentEvents { limit },
        Cmd::Health => Command::GetHealth,
        Cmd::Ping => Command::Ping,
    };

    let payload = request(&mut client, command).await?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    match payload {
        ResponsePayload::Devices { devices } => print_devices(&devices),
        ResponsePayload::Device { device } => print_device(&device),
        ResponsePayload::DeviceDeleted { device_id } => println!("Deleted {}", device_id),
        ResponsePayload::RecentEvents { events } => print_events(&events),
        ResponsePayload::Health(health) => print_health(&health),
        ResponsePayload::Pong => println!("pong"),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}

async fn watch(client: IpcClient, json: bool) -> Result<()> {
    let mut events = client.subscribe().await.context("Subscribe failed")?;

    for state in events.retained() {
        if json {
            println!("{}", serde_json::to_string(state)?);
        } else {
            println!(
                "{:<16} {:<8} {:<8} {}",
                state.device_id,
                lock_label(state.status.locked),
                online_label(state.status.online),
                state.status.remaining
            );
        }
    }

    loop {
        let event = events.next().await.context("Event stream closed")?;
        if json {
            println!("{}", serde_json::to_string(&event)?);
            if matches!(event.payload, EventPayload::Shutdown) {
                return Ok(());
            }
            continue;
        }

        let time = event.timestamp.format("%H:%M:%S");
        match event.payload {
            EventPayload::DeviceState { device_id, status } => println!(
                "{} {:<16} {:<8} {:<8} {}",
                time,
                device_id,
                lock_label(status.locked),
                online_label(status.online),
                status.remaining
            ),
            EventPayload::DeviceRemoved { device_id } => {
                println!("{} {:<16} removed", time, device_id)
            }
            EventPayload::LockChanged {
                device_id,
                locked,
                reason,
            } => println!(
                "{} {:<16} {} ({})",
                time,
                device_id,
                lock_label(locked),
                reason
            ),
            EventPayload::CommandFailed {
                device_id,
                locked,
                error,
            } => println!(
                "{} {:<16} {} failed: {}",
                time,
                device_id,
                if locked { "lock" } else { "unlock" },
                error
            ),
            EventPayload::Shutdown => {
                println!("{} service shutting down", time);
                return Ok(());
            }
        }
    }
}

fn lock_label(locked: bool) -> &'static str {
    if locked { "locked" } else { "unlocked" }
}

fn online_label(online: bool) -> &'static str {
    if online { "online" } else { "offline" }
}

fn print_devices(devices: &[DeviceView]) {
    if devices.is_empty() {
        println!("No devices configured");
        return;
    }
    println!(
        "{:<16} {:<20} {:<8} {:<8} {:<12} {}",
        "ID", "NAME", "STATE", "NETWORK", "REMAINING", "REASON"
    );
    for d in devices {
        println!(
            "{:<16} {:<20} {:<8} {:<8} {:<12} {}",
            d.device_id,
            d.name,
            lock_label(d.locked),
            online_label(d.online),
            d.remaining.to_string(),
            d.reason.map(|r| r.to_string()).unwrap_or_else(|| "-".into())
        );
    }
}

fn print_device(d: &DeviceView) {
    println!("{} ({})", d.name, d.device_id);
    println!("  address:    {}", d.address);
    println!("  state:      {}, {}", lock_label(d.locked), online_label(d.online));
    if d.no_limit_mode {
        println!("  mode:       no limit");
    }
    println!(
        "  today:      {} of {} min used, bedtime {}",
        d.elapsed_minutes.trunc(),
        d.today.limit_minutes,
        d.today.bedtime
    );
    println!("  remaining:  {}", d.remaining);
    if let Some(o) = d.manual_override {
        println!("  override:   {}", o.as_str());
    }
    if let Some(r) = d.reason {
        println!("  reason:     {}", r);
    }
}

fn print_events(events: &[AuditEntryView]) {
    for e in events {
        let kind = e.event["type"].as_str().unwrap_or("unknown");
        println!("{:>6} {} {}", e.id, format_datetime_full(&e.timestamp), kind);
    }
}

fn print_health(h: &HealthStatus) {
    println!("live:     {}", h.live);
    println!("ready:    {}", h.ready);
    println!("store:    {}", if h.store_ok { "ok" } else { "failing" });
    println!("devices:  {}", h.device_count);
    match h.last_tick {
        Some(t) => println!("last tick: {}", format_datetime_full(&t)),
        None => println!("last tick: never"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    run(Cli::parse()).await
}

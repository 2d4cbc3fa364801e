//! Config validation CLI tool
//!
//! Validates a kidslockd configuration file and reports any errors.

use kidslock_config::{ConfigError, ProbeKind, CURRENT_CONFIG_VERSION};
use kidslock_util::{default_config_path, format_minutes};
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a kidslockd configuration file.");
            eprintln!();
            eprintln!("If no path is provided, uses: {}", default_path.display());
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match kidslock_config::load_config(&config_path) {
        Ok(policy) => {
            let service = &policy.service;
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", CURRENT_CONFIG_VERSION);
            println!("  Tick interval: {}s", service.tick_interval.as_secs());
            println!(
                "  Probe: {} (timeout {}ms)",
                match service.probe {
                    ProbeKind::Tcp => "tcp",
                    ProbeKind::Icmp => "icmp",
                },
                service.probe_timeout.as_millis()
            );
            println!(
                "  Control port: {} (timeout {}ms)",
                service.control_port,
                service.command_timeout.as_millis()
            );
            println!("  Devices: {}", policy.devices.len());

            if !policy.devices.is_empty() {
                println!();
                println!("Devices:");
                for device in &policy.devices {
                    println!("  - {} ({}) @ {}", device.id, device.name, device.address);
                    if device.no_limit_mode {
                        println!("      no limit");
                        continue;
                    }
                    for (weekday, day) in device.schedule.days() {
                        println!(
                            "      {}: {} until {}",
                            weekday,
                            format_minutes(day.limit_minutes as u64),
                            day.bedtime
                        );
                    }
                }
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver, CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}

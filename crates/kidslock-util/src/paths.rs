//! Where kidslock keeps its files
//!
//! Everything is per-user so the daemon runs without root:
//! - config: `$XDG_CONFIG_HOME/kidslock/config.toml`
//! - socket: `$XDG_RUNTIME_DIR/kidslock/kidslockd.sock`
//! - data: `$XDG_DATA_HOME/kidslock`
//!
//! The socket and data locations can be pinned with `KIDSLOCK_SOCKET` and
//! `KIDSLOCK_DATA_DIR`.

use std::path::PathBuf;

pub const KIDSLOCK_SOCKET_ENV: &str = "KIDSLOCK_SOCKET";
pub const KIDSLOCK_DATA_DIR_ENV: &str = "KIDSLOCK_DATA_DIR";

const APP_DIR: &str = "kidslock";

/// A kind of per-user location, resolved from the environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Config,
    Socket,
    Data,
}

impl Location {
    fn override_var(self) -> Option<&'static str> {
        match self {
            Location::Config => None,
            Location::Socket => Some(KIDSLOCK_SOCKET_ENV),
            Location::Data => Some(KIDSLOCK_DATA_DIR_ENV),
        }
    }

    fn xdg_var(self) -> &'static str {
        match self {
            Location::Config => "XDG_CONFIG_HOME",
            Location::Socket => "XDG_RUNTIME_DIR",
            Location::Data => "XDG_DATA_HOME",
        }
    }

    /// File appended to the application directory, if any
    fn file_name(self) -> Option<&'static str> {
        match self {
            Location::Config => Some("config.toml"),
            Location::Socket => Some("kidslockd.sock"),
            Location::Data => None,
        }
    }

    /// Base directory when the XDG variable is unset
    fn fallback_base(self, env: &impl Fn(&str) -> Option<String>) -> PathBuf {
        let home = env("HOME").map(PathBuf::from);
        let base = match (self, home) {
            (Location::Config, Some(home)) => home.join(".config"),
            (Location::Config, None) => PathBuf::from("/etc"),
            (Location::Data, Some(home)) => home.join(".local").join("share"),
            (Location::Data, None) => PathBuf::from("/var/lib"),
            (Location::Socket, _) => {
                let user = env("USER").unwrap_or_else(|| "unknown".to_string());
                // `/tmp/kidslock-<user>` already names the app
                return PathBuf::from(format!("/tmp/{}-{}", APP_DIR, user));
            }
        };
        base.join(APP_DIR)
    }

    fn resolve(self, env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(path) = self.override_var().and_then(&env) {
            return PathBuf::from(path);
        }

        let dir = match env(self.xdg_var()) {
            Some(base) if !base.is_empty() => PathBuf::from(base).join(APP_DIR),
            _ => self.fallback_base(&env),
        };

        match self.file_name() {
            Some(name) => dir.join(name),
            None => dir,
        }
    }
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

pub fn default_config_path() -> PathBuf {
    Location::Config.resolve(process_env)
}

/// Control socket, honouring `KIDSLOCK_SOCKET`
pub fn default_socket_path() -> PathBuf {
    Location::Socket.resolve(process_env)
}

/// Directory holding `kidslock.db`, honouring `KIDSLOCK_DATA_DIR`
pub fn default_data_dir() -> PathBuf {
    Location::Data.resolve(process_env)
}

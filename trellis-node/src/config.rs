//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/trellis/config.toml or
/// /etc/trellis/config.toml. Env overrides: TRELLIS_COMMAND_QUEUE,
/// TRELLIS_EVENT_QUEUE. Ports and paths come from the command line.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Console command queue capacity (default 10).
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,
    /// Connection event queue capacity (default 64).
    #[serde(default = "default_event_queue")]
    pub event_queue: usize,
}

fn default_command_queue() -> usize {
    10
}
fn default_event_queue() -> usize {
    64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command_queue: default_command_queue(),
            event_queue: default_event_queue(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("TRELLIS_COMMAND_QUEUE") {
        if let Ok(n) = s.parse::<usize>() {
            c.command_queue = n;
        }
    }
    if let Ok(s) = std::env::var("TRELLIS_EVENT_QUEUE") {
        if let Ok(n) = s.parse::<usize>() {
            c.event_queue = n;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/trellis/config.toml"));
    }
    out.push(PathBuf::from("/etc/trellis/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

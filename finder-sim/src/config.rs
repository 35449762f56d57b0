//! Load simulation config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Simulation parameters. File: ~/.config/finder-sim/config.toml.
/// Env overrides: FINDER_SIM_LOSS, FINDER_SIM_DUPLICATE, FINDER_SIM_SEED,
/// FINDER_SIM_RUN_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Probability a mesh packet is dropped (0.0-1.0, default 0.1).
    #[serde(default = "default_loss")]
    pub loss: f64,
    /// Probability a delivered packet is duplicated (default 0.05).
    #[serde(default = "default_duplicate")]
    pub duplicate: f64,
    /// Scheduler tick period in ms (default 50, like the device UI tick).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Wall-clock length of the run in seconds (default 90).
    #[serde(default = "default_run_secs")]
    pub run_secs: u64,
    /// RNG seed for reproducible runs (default 7).
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_loss() -> f64 {
    0.1
}
fn default_duplicate() -> f64 {
    0.05
}
fn default_tick_ms() -> u64 {
    50
}
fn default_run_secs() -> u64 {
    90
}
fn default_seed() -> u64 {
    7
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loss: default_loss(),
            duplicate: default_duplicate(),
            tick_ms: default_tick_ms(),
            run_secs: default_run_secs(),
            seed: default_seed(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_else(Config::default);
    if let Ok(s) = std::env::var("FINDER_SIM_LOSS") {
        if let Ok(v) = s.parse::<f64>() {
            c.loss = v;
        }
    }
    if let Ok(s) = std::env::var("FINDER_SIM_DUPLICATE") {
        if let Ok(v) = s.parse::<f64>() {
            c.duplicate = v;
        }
    }
    if let Ok(s) = std::env::var("FINDER_SIM_SEED") {
        if let Ok(v) = s.parse::<u64>() {
            c.seed = v;
        }
    }
    if let Ok(s) = std::env::var("FINDER_SIM_RUN_SECS") {
        if let Ok(v) = s.parse::<u64>() {
            c.run_secs = v;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/finder-sim/config.toml"));
    }
    out.push(PathBuf::from("/etc/finder-sim/config.toml"));
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

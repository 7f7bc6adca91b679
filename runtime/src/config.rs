//! Runtime settings.
//!
//! Defaults, overridden by `RUNTIME_DEBUG` (comma separated `key=value`
//! pairs), overridden by whatever the embedder sets afterwards. Read once
//! when the runtime starts and fixed from then on.

use std::{env, thread, time::Duration};

use heap::HeapConfig;

pub const ENV_VAR: &str = "RUNTIME_DEBUG";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("expected key=value, found {0:?}")]
    Malformed(String),
    #[error("unknown setting {0:?}")]
    UnknownKey(String),
    #[error("bad value {value:?} for {key}")]
    BadValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Heap growth between cycles in percent, negative turns the pacer off.
    pub gc_percent: i32,
    /// Execution slots.
    pub procs: usize,
    /// A cycle is forced when none ran for this long.
    pub force_gc: Duration,
    /// How often free memory beyond the heap goal goes back to the OS.
    pub scavenge: Duration,
    /// Largest task stack in bytes.
    pub max_stack: usize,
    /// Upper bound on worker threads, including those stuck in syscalls.
    pub max_threads: usize,
    /// Address space reserved for the heap.
    pub heap_max: usize,
    /// Check lock ranks on every acquisition.
    pub lock_rank: bool,
    /// One log line per collection.
    pub gc_trace: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gc_percent: 100,
            procs: thread::available_parallelism().map_or(1, |n| n.get()),
            force_gc: Duration::from_secs(120),
            scavenge: Duration::from_secs(1),
            max_stack: 1 << 20,
            max_threads: 10_000,
            heap_max: 1 << 30,
            lock_rank: cfg!(debug_assertions),
            gc_trace: false,
        }
    }
}

impl RuntimeConfig {
    /// Defaults with `RUNTIME_DEBUG` applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(value) = env::var(ENV_VAR) {
            config.apply(&value)?;
        }
        Ok(config)
    }

    /// Apply `key=value[,key=value...]`. Later keys win.
    pub fn apply(&mut self, options: &str) -> Result<(), ConfigError> {
        for pair in options.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(ConfigError::Malformed(pair.to_string()));
            };
            self.set(key.trim(), value.trim())?;
        }
        Ok(())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let bad = || ConfigError::BadValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "gcpercent" => {
                self.gc_percent = if value == "off" {
                    -1
                } else {
                    value.parse().map_err(|_| bad())?
                }
            }
            "procs" => self.procs = parse_nonzero(value).ok_or_else(bad)?,
            "forcegc_ms" => {
                self.force_gc = Duration::from_millis(value.parse().map_err(|_| bad())?)
            }
            "scavenge_ms" => {
                self.scavenge = Duration::from_millis(value.parse().map_err(|_| bad())?)
            }
            "maxstack" => self.max_stack = parse_size(value).ok_or_else(bad)?,
            "maxthreads" => self.max_threads = parse_nonzero(value).ok_or_else(bad)?,
            "heapmax" => self.heap_max = parse_size(value).ok_or_else(bad)?,
            "lockrank" => self.lock_rank = parse_flag(value).ok_or_else(bad)?,
            "gctrace" => self.gc_trace = parse_flag(value).ok_or_else(bad)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    pub fn heap_config(&self) -> HeapConfig {
        HeapConfig {
            limit: self.heap_max,
            gc_percent: self.gc_percent,
            procs: self.procs,
            gc_trace: self.gc_trace,
            ..HeapConfig::default()
        }
    }
}

fn parse_nonzero(s: &str) -> Option<usize> {
    s.parse().ok().filter(|&n| n > 0)
}

fn parse_flag(s: &str) -> Option<bool> {
    match s {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// Bytes with an optional `k`, `m` or `g` suffix.
fn parse_size(s: &str) -> Option<usize> {
    let lower = s.to_ascii_lowercase();
    let (digits, shift) = match lower.as_bytes().last()? {
        b'k' => (&lower[..lower.len() - 1], 10),
        b'm' => (&lower[..lower.len() - 1], 20),
        b'g' => (&lower[..lower.len() - 1], 30),
        _ => (lower.as_str(), 0),
    };
    let n: usize = digits.parse().ok()?;
    n.checked_mul(1 << shift).filter(|&n| n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_pairs_in_order() {
        let mut c = RuntimeConfig::default();
        c.apply("gcpercent=50, procs=3,maxstack=256k,gcpercent=200")
            .unwrap();
        assert_eq!(c.gc_percent, 200);
        assert_eq!(c.procs, 3);
        assert_eq!(c.max_stack, 256 << 10);
    }

    #[test]
    fn durations_and_flags() {
        let mut c = RuntimeConfig::default();
        c.apply("forcegc_ms=250,scavenge_ms=10,gctrace=1,lockrank=off,gcpercent=off")
            .unwrap();
        assert_eq!(c.force_gc, Duration::from_millis(250));
        assert_eq!(c.scavenge, Duration::from_millis(10));
        assert!(c.gc_trace);
        assert!(!c.lock_rank);
        assert_eq!(c.gc_percent, -1);
        assert_eq!(c.heap_config().gc_percent, -1);
    }

    #[test]
    fn rejects_bad_input() {
        let mut c = RuntimeConfig::default();
        assert_eq!(
            c.apply("procs"),
            Err(ConfigError::Malformed("procs".into()))
        );
        assert_eq!(
            c.apply("color=blue"),
            Err(ConfigError::UnknownKey("color".into()))
        );
        assert!(matches!(
            c.apply("procs=0"),
            Err(ConfigError::BadValue { .. })
        ));
        assert!(matches!(
            c.apply("heapmax=12q"),
            Err(ConfigError::BadValue { .. })
        ));
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("1G"), Some(1 << 30));
        assert_eq!(parse_size("m"), None);
        assert_eq!(parse_size("0"), None);
    }
}

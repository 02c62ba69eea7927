// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Remote endpoint and pool sizing.
    pub transport: Transport,
    /// Connect-attempt circuit breaker tuning.
    #[serde(default)]
    pub breaker: Breaker,
    /// Socket operation deadlines.
    #[serde(default)]
    pub timeouts: Timeouts,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Transport {
    /// Peer to dial, in the address grammar: `host:port`, `[v6]:port`
    /// or a bare port.
    pub target_address: String,
    /// Upper bound on concurrently live connections to the peer.
    #[serde(default = "default_target_capacity")]
    pub target_capacity: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Breaker {
    /// Dial failures tolerated before the breaker opens.
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u64,
    /// Cooldown after the last failure before a half-open probe.
    #[serde(default = "default_reset_after_ms")]
    pub reset_after_ms: i64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Timeouts {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

fn default_target_capacity() -> usize {
    4
}

fn default_max_failed_attempts() -> u64 {
    10
}

fn default_reset_after_ms() -> i64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_io_timeout_ms() -> u64 {
    30_000
}

impl Default for Breaker {
    fn default() -> Self {
        Self {
            max_failed_attempts: default_max_failed_attempts(),
            reset_after_ms: default_reset_after_ms(),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        let cfg: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {path:?}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults with only the target filled in; the shape tests and
    /// short-lived tools want.
    pub fn for_target(target_address: impl Into<String>) -> Self {
        Self {
            transport: Transport {
                target_address: target_address.into(),
                target_capacity: default_target_capacity(),
            },
            breaker: Breaker::default(),
            timeouts: Timeouts::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.transport.target_address.is_empty(),
            "transport.target_address must be set"
        );
        ensure!(
            self.transport.target_capacity > 0,
            "transport.target_capacity must be > 0"
        );
        ensure!(
            self.breaker.max_failed_attempts > 0,
            "breaker.max_failed_attempts must be > 0"
        );
        ensure!(
            self.breaker.reset_after_ms > 0,
            "breaker.reset_after_ms must be > 0"
        );
        ensure!(
            self.timeouts.connect_timeout_ms > 0 && self.timeouts.io_timeout_ms > 0,
            "timeouts must be > 0"
        );
        Ok(())
    }
}

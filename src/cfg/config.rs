// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Default cap on one frame's payload: 1 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1 << 20;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Multiplexer tunables. Queue capacities are protocol-visible: they
    /// are the only backpressure mechanism, so changing them changes the
    /// observable pacing of a session.
    pub mux: MuxConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Knobs of one multiplexed session.
pub struct MuxConfig {
    #[serde(rename = "MaxMessageSize", default = "default_max_message_size")]
    /// Upper bound on a single frame payload, read and write side.
    pub max_message_size: usize,

    #[serde(rename = "ReceiveTimeout", with = "serde_secs", default = "default_receive_timeout")]
    /// Wall-clock bound on enqueueing one inbound MESSAGE; expiry resets
    /// the offending stream while the rest of the session continues.
    pub receive_timeout: Duration,

    #[serde(rename = "NewStreamTimeout", with = "serde_secs", default = "default_new_stream_timeout")]
    /// Bound on handing a NEW_STREAM frame to the writer.
    pub new_stream_timeout: Duration,

    #[serde(rename = "ResetStreamTimeout", with = "serde_secs", default = "default_reset_stream_timeout")]
    /// Bound on handing a CLOSE or RESET frame to the writer.
    pub reset_stream_timeout: Duration,

    #[serde(rename = "AcceptBacklog", default = "default_accept_backlog")]
    /// Capacity of the inbound-stream accept queue.
    pub accept_backlog: usize,

    #[serde(rename = "WriteBacklog", default = "default_write_backlog")]
    /// Capacity of the framed-buffer queue drained by the writer task.
    pub write_backlog: usize,

    #[serde(rename = "StreamBacklog", default = "default_stream_backlog")]
    /// Capacity of each stream's inbound data queue.
    pub stream_backlog: usize,
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_receive_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_new_stream_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_reset_stream_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_accept_backlog() -> usize {
    16
}

fn default_write_backlog() -> usize {
    16
}

fn default_stream_backlog() -> usize {
    8
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            receive_timeout: default_receive_timeout(),
            new_stream_timeout: default_new_stream_timeout(),
            reset_stream_timeout: default_reset_stream_timeout(),
            accept_backlog: default_accept_backlog(),
            write_backlog: default_write_backlog(),
            stream_backlog: default_stream_backlog(),
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.mux.validate()?;
        Ok(cfg)
    }
}

impl MuxConfig {
    /// Validates invariants the session relies on.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_message_size >= 1, "MaxMessageSize must be >= 1");
        ensure!(
            !self.receive_timeout.is_zero(),
            "ReceiveTimeout must be > 0"
        );
        ensure!(
            !self.new_stream_timeout.is_zero(),
            "NewStreamTimeout must be > 0"
        );
        ensure!(
            !self.reset_stream_timeout.is_zero(),
            "ResetStreamTimeout must be > 0"
        );
        ensure!(self.accept_backlog >= 1, "AcceptBacklog must be >= 1");
        ensure!(self.write_backlog >= 1, "WriteBacklog must be >= 1");
        ensure!(self.stream_backlog >= 1, "StreamBacklog must be >= 1");
        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

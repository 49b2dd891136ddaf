// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use mplex_rs::cfg::config::{Config, DEFAULT_MAX_MESSAGE_SIZE, MuxConfig};

#[test]
fn defaults_match_protocol_documentation() {
    let cfg = MuxConfig::default();
    assert_eq!(cfg.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    assert_eq!(cfg.receive_timeout, Duration::from_secs(5));
    assert_eq!(cfg.new_stream_timeout, Duration::from_secs(60));
    assert_eq!(cfg.reset_stream_timeout, Duration::from_secs(120));
    assert_eq!(cfg.accept_backlog, 16);
    assert_eq!(cfg.write_backlog, 16);
    assert_eq!(cfg.stream_backlog, 8);
    assert!(cfg.validate().is_ok());
}

#[test]
fn empty_mux_section_uses_defaults() -> Result<()> {
    let cfg: Config = serde_yaml::from_str("mux: {}\n")?;
    assert_eq!(cfg.mux.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    assert_eq!(cfg.mux.stream_backlog, 8);
    Ok(())
}

#[test]
fn explicit_values_parse() -> Result<()> {
    let yaml = r#"
mux:
  MaxMessageSize: 4096
  ReceiveTimeout: 1
  NewStreamTimeout: 10
  ResetStreamTimeout: 20
  AcceptBacklog: 4
  WriteBacklog: 4
  StreamBacklog: 2
"#;
    let cfg: Config = serde_yaml::from_str(yaml)?;
    assert_eq!(cfg.mux.max_message_size, 4096);
    assert_eq!(cfg.mux.receive_timeout, Duration::from_secs(1));
    assert_eq!(cfg.mux.new_stream_timeout, Duration::from_secs(10));
    assert_eq!(cfg.mux.reset_stream_timeout, Duration::from_secs(20));
    assert_eq!(cfg.mux.accept_backlog, 4);
    assert_eq!(cfg.mux.write_backlog, 4);
    assert_eq!(cfg.mux.stream_backlog, 2);
    assert!(cfg.mux.validate().is_ok());
    Ok(())
}

#[test]
fn zero_sizes_fail_validation() {
    let cfg = MuxConfig { max_message_size: 0, ..MuxConfig::default() };
    assert!(cfg.validate().is_err());

    let cfg = MuxConfig { receive_timeout: Duration::ZERO, ..MuxConfig::default() };
    assert!(cfg.validate().is_err());

    let cfg = MuxConfig { stream_backlog: 0, ..MuxConfig::default() };
    assert!(cfg.validate().is_err());
}

//! TOML configuration for `gcastd`.
//!
//! Every field is optional. Missing values fall back to
//! [`GroupConfig::default_config`].

use std::path::Path;
use std::time::Duration;

use anyhow::bail;
use gcast_types::{GroupConfig, SendPolicy};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Group protocol tuning.
    pub group: GroupSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[group]` section. Durations are in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GroupSection {
    /// Deadline for collecting flush acknowledgements.
    pub flush_timeout_ms: Option<u64>,
    /// Period between stability gossip rounds.
    pub stability_interval_ms: Option<u64>,
    /// Retransmission backoff schedule. The last value repeats.
    pub retransmit_backoff_ms: Option<Vec<u64>>,
    /// Deadline for collecting subgroup state during a merge.
    pub merge_timeout_ms: Option<u64>,
    /// Deadline for view acknowledgements.
    pub view_ack_timeout_ms: Option<u64>,
    /// `"block"` (default) or `"reject"`.
    pub send_policy: Option<String>,
    /// Capacity of each member's inbound channel.
    pub inbound_capacity: Option<usize>,
    /// How long a departed member's stability report is honoured.
    pub departed_retention_ms: Option<u64>,
    /// Deadline for a state provider to answer.
    pub state_timeout_ms: Option<u64>,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Effective group configuration: file values over production defaults.
    pub fn group_config(&self) -> anyhow::Result<GroupConfig> {
        let mut config = GroupConfig::default_config();
        let g = &self.group;

        if let Some(ms) = g.flush_timeout_ms {
            config.flush_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = g.stability_interval_ms {
            if ms == 0 {
                bail!("stability_interval_ms must be positive");
            }
            config.stability_interval = Duration::from_millis(ms);
        }
        if let Some(schedule) = &g.retransmit_backoff_ms {
            if schedule.is_empty() {
                bail!("retransmit_backoff_ms needs at least one value");
            }
            config.retransmit_backoff = schedule.iter().copied().map(Duration::from_millis).collect();
        }
        if let Some(ms) = g.merge_timeout_ms {
            config.merge_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = g.view_ack_timeout_ms {
            config.view_ack_timeout = Duration::from_millis(ms);
        }
        if let Some(policy) = g.send_policy.as_deref() {
            config.send_policy = parse_send_policy(policy)?;
        }
        if let Some(capacity) = g.inbound_capacity {
            if capacity == 0 {
                bail!("inbound_capacity must be positive");
            }
            config.inbound_capacity = capacity;
        }
        if let Some(ms) = g.departed_retention_ms {
            config.departed_retention = Duration::from_millis(ms);
        }
        if let Some(ms) = g.state_timeout_ms {
            config.state_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn parse_send_policy(s: &str) -> anyhow::Result<SendPolicy> {
    match s.trim().to_ascii_lowercase().as_str() {
        "block" => Ok(SendPolicy::Block),
        "reject" => Ok(SendPolicy::Reject),
        other => bail!("unknown send_policy {other:?}, expected \"block\" or \"reject\""),
    }
}

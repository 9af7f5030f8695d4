//! Node configuration
//!
//! Loaded from JSON; every section has defaults, durations are humantime
//! strings. `validate` builds the palette, generator and session once so
//! that configuration faults surface at startup.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use stroop_core::{Color, ConfigError, DeviceId, Task, TaskId};
use stroop_stimulus::{ColorPalette, StimulusGenerator, StimulusTiming, WordOrder};
use stroop_task::SessionState;
use stroop_transport::{BackoffPolicy, ConnectionConfig, LinkConfig};

use crate::duration_format;
use crate::logging::{init_tracing_with, LogFormat};

/// Top-level configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StroopConfig {
    pub device: DeviceConfig,
    pub connection: ConnectionSection,
    pub stimulus: StimulusConfig,
    /// Session sequence, in order
    pub tasks: Vec<TaskConfig>,
    pub logging: LoggingConfig,
}

impl Default for StroopConfig {
    fn default() -> Self {
        StroopConfig {
            device: DeviceConfig::default(),
            connection: ConnectionSection::default(),
            stimulus: StimulusConfig::default(),
            tasks: vec![TaskConfig {
                id: "stroop".to_string(),
                label: "Stroop".to_string(),
                timeout: Duration::from_secs(180),
            }],
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    /// Random when absent
    pub device_id: Option<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            name: "stroop-device".to_string(),
            device_id: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub service_name: String,
    /// Responder listen address
    pub listen_addr: SocketAddr,
    /// Initiator peer address; discovery is used when absent
    pub peer_addr: Option<SocketAddr>,
    #[serde(with = "duration_format")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_format")]
    pub handshake_timeout: Duration,
    #[serde(with = "duration_format")]
    pub heartbeat_interval: Duration,
    pub missed_heartbeats: u32,
    #[serde(with = "duration_format")]
    pub backoff_base: Duration,
    #[serde(with = "duration_format")]
    pub backoff_max: Duration,
    pub outbound_capacity: usize,
    /// How often a running task reports its status
    #[serde(with = "duration_format")]
    pub status_interval: Duration,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        ConnectionSection {
            service_name: "stroop-link".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            peer_addr: None,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            missed_heartbeats: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(16),
            outbound_capacity: 64,
            status_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulusConfig {
    /// Color word → matching color
    pub words: BTreeMap<String, String>,
    /// Display-only ink colors
    pub extra_colors: Vec<String>,
    #[serde(with = "duration_format")]
    pub display_duration: Duration,
    #[serde(with = "duration_format")]
    pub min_interval: Duration,
    #[serde(with = "duration_format")]
    pub max_interval: Duration,
    #[serde(with = "duration_format")]
    pub countdown: Duration,
    /// Shuffled full cycles through the words instead of independent draws
    pub balanced: bool,
    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for StimulusConfig {
    fn default() -> Self {
        let timing = StimulusTiming::default();
        let words = [
            ("RED", "red"),
            ("GREEN", "green"),
            ("BLUE", "blue"),
            ("YELLOW", "yellow"),
        ]
        .into_iter()
        .map(|(word, color)| (word.to_string(), color.to_string()))
        .collect();

        StimulusConfig {
            words,
            extra_colors: Vec::new(),
            display_duration: timing.display,
            min_interval: timing.min_interval,
            max_interval: timing.max_interval,
            countdown: timing.countdown,
            balanced: false,
            seed: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    pub label: String,
    #[serde(with = "duration_format")]
    pub timeout: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Default filter when `RUST_LOG` is unset
    pub filter: Option<String>,
}

impl StroopConfig {
    /// Read, parse and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config: StroopConfig = serde_json::from_str(&text).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: StroopConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.generator()?;
        self.validate_tasks()?;
        self.validate_connection()
    }

    /// Task sequence checks; only the initiator needs these
    pub fn validate_tasks(&self) -> Result<(), ConfigError> {
        SessionState::new(self.task_ids()).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        for task in &self.tasks {
            if task.timeout.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "task {} has a zero timeout",
                    task.id
                )));
            }
        }
        Ok(())
    }

    /// Connection section checks, shared by both roles
    pub fn validate_connection(&self) -> Result<(), ConfigError> {
        let connection = &self.connection;
        let named = [
            ("connect_timeout", connection.connect_timeout),
            ("handshake_timeout", connection.handshake_timeout),
            ("heartbeat_interval", connection.heartbeat_interval),
            ("backoff_base", connection.backoff_base),
            ("status_interval", connection.status_interval),
        ];
        for (name, duration) in named {
            if duration.is_zero() {
                return Err(ConfigError::NonPositiveDuration(name));
            }
        }
        if connection.missed_heartbeats == 0 {
            return Err(ConfigError::Invalid("missed_heartbeats must be at least 1".into()));
        }
        if connection.backoff_base > connection.backoff_max {
            return Err(ConfigError::Invalid(
                "backoff_base exceeds backoff_max".into(),
            ));
        }
        if connection.outbound_capacity == 0 {
            return Err(ConfigError::Invalid("outbound_capacity must be positive".into()));
        }
        Ok(())
    }

    /// Configured device id, or a fresh random one
    pub fn device_id(&self) -> DeviceId {
        self.device
            .device_id
            .map(DeviceId::new)
            .unwrap_or_else(DeviceId::generate)
    }

    pub fn palette(&self) -> Result<ColorPalette, ConfigError> {
        let extras = self.stimulus.extra_colors.iter().map(|c| Color::from(c.as_str()));
        ColorPalette::with_extra_colors(self.stimulus.words.clone(), extras)
    }

    pub fn timing(&self) -> StimulusTiming {
        StimulusTiming {
            display: self.stimulus.display_duration,
            min_interval: self.stimulus.min_interval,
            max_interval: self.stimulus.max_interval,
            countdown: self.stimulus.countdown,
        }
    }

    /// Build the stimulus generator (seeded when configured)
    pub fn generator(&self) -> Result<StimulusGenerator, ConfigError> {
        let palette = self.palette()?;
        let generator = match self.stimulus.seed {
            Some(seed) => StimulusGenerator::with_seed(palette, self.timing(), seed)?,
            None => StimulusGenerator::new(palette, self.timing())?,
        };
        let order = if self.stimulus.balanced {
            WordOrder::Balanced
        } else {
            WordOrder::Uniform
        };
        Ok(generator.with_order(order))
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks
            .iter()
            .map(|task| Task::new(task.id.as_str(), task.label.clone(), task.timeout))
            .collect()
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|task| TaskId::from(task.id.as_str())).collect()
    }

    /// Connection manager settings for this device
    pub fn connection_config(&self) -> ConnectionConfig {
        let connection = &self.connection;
        ConnectionConfig {
            service_name: connection.service_name.clone(),
            device_id: self.device_id(),
            connect_timeout: connection.connect_timeout,
            handshake_timeout: connection.handshake_timeout,
            link: LinkConfig {
                heartbeat_interval: connection.heartbeat_interval,
                missed_heartbeats: connection.missed_heartbeats,
            },
            backoff: BackoffPolicy {
                base: connection.backoff_base,
                max: connection.backoff_max,
            },
            outbound_capacity: connection.outbound_capacity,
            ..ConnectionConfig::default()
        }
    }

    /// Install the tracing subscriber described by the `logging` section
    ///
    /// Returns `false` if a subscriber was already installed.
    pub fn init_logging(&self) -> bool {
        init_tracing_with(self.logging.format, self.logging.filter.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "device": { "name": "tablet", "device_id": 42 },
        "connection": { "heartbeat_interval": "2s", "backoff_max": "8s" },
        "stimulus": {
            "words": { "ROT": "red", "BLAU": "blue" },
            "extra_colors": ["black"],
            "display_duration": "1500ms",
            "seed": 7
        },
        "tasks": [
            { "id": "warmup", "label": "Warm-up", "timeout": "30s" },
            { "id": "main", "label": "Main run", "timeout": "3m" }
        ],
        "logging": { "format": "json" }
    }"#;

    #[test]
    fn test_parse_sample() {
        let config = StroopConfig::from_json(SAMPLE).unwrap();

        assert_eq!(config.device_id(), DeviceId::new(42));
        assert_eq!(config.connection.heartbeat_interval, Duration::from_secs(2));
        // Unspecified fields keep their defaults
        assert_eq!(config.connection.missed_heartbeats, 3);
        assert_eq!(config.stimulus.min_interval, Duration::from_secs(1));
        assert_eq!(config.timing().display, Duration::from_millis(1500));
        assert_eq!(config.tasks()[1].timeout, Duration::from_secs(180));
        assert_eq!(config.logging.format, LogFormat::Json);

        let palette = config.palette().unwrap();
        assert_eq!(palette.colors().len(), 3);

        let connection = config.connection_config();
        assert_eq!(connection.link.silence_timeout(), Duration::from_secs(6));
        assert_eq!(connection.backoff.max, Duration::from_secs(8));
    }

    #[test]
    fn test_defaults_validate() {
        let config = StroopConfig::from_json("{}").unwrap();
        assert_eq!(config, StroopConfig::default());
        assert_eq!(config.palette().unwrap().word_count(), 4);
        assert_eq!(config.tasks()[0].timeout, Duration::from_secs(180));
    }

    #[test]
    fn test_degenerate_palette_rejected() {
        let json = r#"{
            "stimulus": { "words": { "RED": "red" } },
            "tasks": [{ "id": "t", "label": "T", "timeout": "10s" }]
        }"#;
        assert_eq!(
            StroopConfig::from_json(json).unwrap_err(),
            ConfigError::TooFewColors(1)
        );
    }

    #[test]
    fn test_inverted_interval_rejected() {
        let json = r#"{
            "stimulus": { "min_interval": "4s", "max_interval": "2s" },
            "tasks": [{ "id": "t", "label": "T", "timeout": "10s" }]
        }"#;
        assert!(matches!(
            StroopConfig::from_json(json),
            Err(ConfigError::IntervalRange { .. })
        ));
    }

    #[test]
    fn test_duplicate_and_empty_tasks_rejected() {
        let duplicate = r#"{
            "tasks": [
                { "id": "t", "label": "A", "timeout": "10s" },
                { "id": "t", "label": "B", "timeout": "10s" }
            ]
        }"#;
        assert!(matches!(
            StroopConfig::from_json(duplicate),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            StroopConfig::from_json(r#"{ "tasks": [] }"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_zero_connection_durations_rejected() {
        let json = r#"{ "connection": { "status_interval": "0s" } }"#;
        assert_eq!(
            StroopConfig::from_json(json).unwrap_err(),
            ConfigError::NonPositiveDuration("status_interval")
        );

        let mut config = StroopConfig::default();
        config.connection.heartbeat_interval = Duration::ZERO;
        assert_eq!(
            config.validate_connection().unwrap_err(),
            ConfigError::NonPositiveDuration("heartbeat_interval")
        );
        // Task checks do not look at the connection section
        assert!(config.validate_tasks().is_ok());
    }

    #[test]
    fn test_logging_section_installs_once() {
        let json = r#"{ "logging": { "format": "compact", "filter": "debug" } }"#;
        let config = StroopConfig::from_json(json).unwrap();
        assert_eq!(config.logging.filter.as_deref(), Some("debug"));
        let _ = config.init_logging();
        assert!(!config.init_logging());
    }

    #[test]
    fn test_load_reports_path() {
        let err = StroopConfig::load("/nonexistent/stroop.json").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Load { path, .. } if path == "/nonexistent/stroop.json"
        ));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("stroop-config-{}.json", std::process::id()));
        std::fs::write(&path, SAMPLE).unwrap();
        let config = StroopConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.tasks.len(), 2);
    }
}

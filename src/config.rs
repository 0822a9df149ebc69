//! # Configuration Management
//!
//! Loads the bridge configuration from layered sources:
//! - TOML configuration file (config.toml, optional)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` environment variables
//! 2. `APP_`-prefixed environment variables, sections split by `__`
//!    (e.g. `APP_DEVICES__CAPTURE_TARGET=my_monitor`)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! The PCM format itself is not configurable; see `audio::format`.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioSettings,
    pub devices: DevicesConfig,
    pub performance: PerformanceConfig,
}

/// HTTP listener settings.
///
/// ## Fields:
/// - `host`: address to bind ("0.0.0.0" accepts connections from any interface)
/// - `port`: TCP port for HTTP and the `/audio` WebSocket
/// - `public_dir`: directory holding the landing page (`index.html`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub public_dir: String,
}

/// Stream sizing and latency.
///
/// ## Fields:
/// - `latency_ms`: latency target passed to both external processes
/// - `read_chunk_bytes`: largest single read from the capture pipe (one frame)
/// - `max_message_bytes`: largest inbound message accepted for playback
/// - `max_frame_bytes`: WebSocket codec limit; must exceed `max_message_bytes`
///   so oversized messages are rejected by policy, not by the protocol
/// - `inbound_queue_messages`: per-session queue between socket and playback
/// - `outbound_queue_frames`: per-connection mailbox for captured frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub latency_ms: u64,
    pub read_chunk_bytes: usize,
    pub max_message_bytes: usize,
    pub max_frame_bytes: usize,
    pub inbound_queue_messages: usize,
    pub outbound_queue_frames: usize,
}

/// External programs and the virtual devices they bind to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    pub capture_program: String,
    pub capture_target: String,
    pub playback_program: String,
    pub playback_target: String,
}

/// Limits and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub teardown_grace_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3003,
                public_dir: "public".to_string(),
            },
            audio: AudioSettings {
                latency_ms: 50,
                read_chunk_bytes: 4096,
                max_message_bytes: 1024 * 1024,
                max_frame_bytes: 8 * 1024 * 1024,
                inbound_queue_messages: 32,
                outbound_queue_frames: 64,
            },
            devices: DevicesConfig {
                capture_program: "pw-record".to_string(),
                capture_target: "browser_speaker_source".to_string(),
                playback_program: "pw-play".to_string(),
                playback_target: "browser_mic_sink".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 8,
                heartbeat_interval_secs: 10,
                client_timeout_secs: 30,
                teardown_grace_ms: 500,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=4000`: Override server port
    /// - `APP_PERFORMANCE__MAX_CONCURRENT_SESSIONS=2`: Lower the session cap
    /// - `PORT=4000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        Self::load_with(config::File::with_name("config").required(false))
    }

    /// Load with `file` as the file layer.
    fn load_with<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("Server port cannot be 0");
        }

        for (name, value) in [
            ("devices.capture_program", &self.devices.capture_program),
            ("devices.capture_target", &self.devices.capture_target),
            ("devices.playback_program", &self.devices.playback_program),
            ("devices.playback_target", &self.devices.playback_target),
        ] {
            if value.trim().is_empty() {
                bail!("{} cannot be empty", name);
            }
        }

        let audio = &self.audio;
        for (name, value) in [
            ("audio.latency_ms", audio.latency_ms as usize),
            ("audio.read_chunk_bytes", audio.read_chunk_bytes),
            ("audio.max_message_bytes", audio.max_message_bytes),
            ("audio.inbound_queue_messages", audio.inbound_queue_messages),
            ("audio.outbound_queue_frames", audio.outbound_queue_frames),
            (
                "performance.max_concurrent_sessions",
                self.performance.max_concurrent_sessions,
            ),
            (
                "performance.heartbeat_interval_secs",
                self.performance.heartbeat_interval_secs as usize,
            ),
        ] {
            if value == 0 {
                bail!("{} must be greater than 0", name);
            }
        }

        if audio.max_frame_bytes <= audio.max_message_bytes {
            bail!(
                "audio.max_frame_bytes ({}) must be larger than audio.max_message_bytes ({})",
                audio.max_frame_bytes,
                audio.max_message_bytes
            );
        }

        if self.performance.client_timeout_secs <= self.performance.heartbeat_interval_secs {
            bail!("performance.client_timeout_secs must be larger than the heartbeat interval");
        }

        Ok(())
    }

    /// `host:port` for the HTTP listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 3003);
        assert_eq!(config.devices.capture_program, "pw-record");
        assert_eq!(config.devices.capture_target, "browser_speaker_source");
        assert_eq!(config.devices.playback_program, "pw-play");
        assert_eq!(config.devices.playback_target, "browser_mic_sink");
        assert_eq!(config.audio.max_message_bytes, 1_048_576);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.devices.playback_target = "  ".into();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("devices.playback_target"));

        let mut config = AppConfig::default();
        config.audio.max_frame_bytes = config.audio.max_message_bytes;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.client_timeout_secs = config.performance.heartbeat_interval_secs;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_layer_overrides_defaults() {
        let file = config::File::from_str(
            r#"
            [devices]
            capture_target = "studio_monitor"

            [performance]
            max_concurrent_sessions = 2
            "#,
            config::FileFormat::Toml,
        );

        let config = AppConfig::load_with(file).unwrap();
        assert_eq!(config.devices.capture_target, "studio_monitor");
        assert_eq!(config.devices.playback_target, "browser_mic_sink");
        assert_eq!(config.performance.max_concurrent_sessions, 2);
        assert_eq!(config.audio.latency_ms, 50);
    }

    #[test]
    fn test_example_config_parses() {
        let config: AppConfig = toml::from_str(include_str!("../config.example.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 3003);
    }
}

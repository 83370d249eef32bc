//! Bridge configuration.
//!
//! Defaults match the deployed device. Environment variables override the
//! defaults; the CLI overrides both (see `bin/posebridge.rs`).

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use crate::pose::{DEFAULT_SCALE, PoseTransform};

pub const DEFAULT_BROKER_HOST: &str = "192.168.1.11";
pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_DEVICE_ID: &str = "jetson_01";

const DEFAULT_WORKER_PROGRAM: &str = "./Examples/RGB-D/rgbd_realsense_D435i";
const DEFAULT_VOCABULARY: &str = "/home/bhargavi/ORB_SLAM3/Vocabulary/ORBvoc.txt";
const DEFAULT_SENSOR_CONFIG: &str = "/home/bhargavi/ORB_SLAM3/Examples/RGB-D/RealSense_D435i.yaml";
const DEFAULT_MODE: &str = "loc";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub client_id: String,
    pub connect_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_BROKER_HOST.to_string(),
            port: DEFAULT_BROKER_PORT,
            keep_alive: Duration::from_secs(60),
            client_id: format!("posebridge-{}", uuid::Uuid::new_v4().simple()),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl BusConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }
}

/// The localization executable and its fixed positional arguments.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub program: PathBuf,
    pub vocabulary: PathBuf,
    pub sensor_config: PathBuf,
    pub mode: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_WORKER_PROGRAM),
            vocabulary: PathBuf::from(DEFAULT_VOCABULARY),
            sensor_config: PathBuf::from(DEFAULT_SENSOR_CONFIG),
            mode: DEFAULT_MODE.to_string(),
        }
    }
}

impl WorkerConfig {
    /// Argument vector in invocation order: vocabulary, sensor config, mode.
    pub fn args(&self) -> Vec<OsString> {
        vec![
            self.vocabulary.clone().into_os_string(),
            self.sensor_config.clone().into_os_string(),
            OsString::from(&self.mode),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub device_id: String,
    pub bus: BusConfig,
    pub worker: WorkerConfig,
    pub scale: f64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_ID)
    }
}

impl BridgeConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            bus: BusConfig::default(),
            worker: WorkerConfig::default(),
            scale: DEFAULT_SCALE,
        }
    }

    pub fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn command_topic(&self) -> String {
        format!("/commands/{}", self.device_id)
    }

    pub fn pose_topic(&self) -> String {
        format!("/pose/{}", self.device_id)
    }

    pub fn transform(&self) -> PoseTransform {
        PoseTransform::new(self.scale)
    }

    /// Defaults overridden by `POSEBRIDGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (an environment-like key/value source).
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(host) = lookup("POSEBRIDGE_BROKER_HOST") {
            self.bus.host = host;
        }
        if let Some(port) = lookup("POSEBRIDGE_BROKER_PORT") {
            self.bus.port = parse_port("POSEBRIDGE_BROKER_PORT", &port)?;
        }
        if let Some(device_id) = lookup("POSEBRIDGE_DEVICE_ID") {
            self.device_id = parse_device_id("POSEBRIDGE_DEVICE_ID", &device_id)?;
        }
        if let Some(program) = lookup("POSEBRIDGE_WORKER") {
            self.worker.program = PathBuf::from(program);
        }
        if let Some(vocabulary) = lookup("POSEBRIDGE_VOCABULARY") {
            self.worker.vocabulary = PathBuf::from(vocabulary);
        }
        if let Some(sensor_config) = lookup("POSEBRIDGE_SENSOR_CONFIG") {
            self.worker.sensor_config = PathBuf::from(sensor_config);
        }
        if let Some(mode) = lookup("POSEBRIDGE_MODE") {
            self.worker.mode = mode;
        }
        if let Some(scale) = lookup("POSEBRIDGE_SCALE") {
            self.scale = parse_scale("POSEBRIDGE_SCALE", &scale)?;
        }
        Ok(self)
    }
}

pub fn parse_port(key: &str, value: &str) -> Result<u16, ConfigError> {
    match value.trim().parse::<u16>() {
        Ok(0) => Err(ConfigError::invalid(key, value, "port must be non-zero")),
        Ok(port) => Ok(port),
        Err(e) => Err(ConfigError::invalid(key, value, e.to_string())),
    }
}

/// The device id becomes an MQTT topic level, so it may not contain
/// separators or wildcards.
pub fn parse_device_id(key: &str, value: &str) -> Result<String, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::invalid(key, value, "device id must not be empty"));
    }
    if value.contains(['/', '+', '#']) {
        return Err(ConfigError::invalid(
            key,
            value,
            "device id must not contain '/', '+' or '#'",
        ));
    }
    Ok(value.to_string())
}

pub fn parse_scale(key: &str, value: &str) -> Result<f64, ConfigError> {
    let scale: f64 = value
        .trim()
        .parse()
        .map_err(|e: std::num::ParseFloatError| ConfigError::invalid(key, value, e.to_string()))?;
    if !scale.is_finite() || scale == 0.0 {
        return Err(ConfigError::invalid(
            key,
            value,
            "scale must be finite and non-zero",
        ));
    }
    Ok(scale)
}

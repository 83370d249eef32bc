//! posebridge: remote control of a localization worker over MQTT.
//!
//! Listens on `/commands/<device>` for `load_map` and `shutdown`, runs the
//! worker as a child process, and republishes the poses it prints as
//! integer grid coordinates on `/pose/<device>`.
//!
//! # Architecture
//!
//! ```text
//! ┌────────┐  commands   ┌────────┐   load/shutdown   ┌────────────┐
//! │  bus   │ ──────────► │ bridge │ ────────────────► │ supervisor │
//! └────────┘             └────────┘                   └─────┬──────┘
//!     ▲                                                     │ spawn
//!     │ {"x":..,"y":..}  ┌────────┐  stdout+stderr    ┌─────▼──────┐
//!     └───────────────── │ relay  │ ◄──────────────── │   worker   │
//!                        └────────┘                   └────────────┘
//! ```

pub mod bridge;
pub mod bus;
pub mod command;
pub mod config;
pub mod line_codec;
pub mod pose;
pub mod relay;
pub mod spawner;
pub mod supervisor;

pub use bridge::{Bridge, BridgeError, ShutdownSignals};
pub use bus::{BusClient, BusError, InboundMessage, MqttBus, PosePublisher};
pub use command::{CommandError, ControlCommand};
pub use config::{BridgeConfig, BusConfig, ConfigError, WorkerConfig};
pub use pose::{PoseParseError, PoseRecord, PoseTransform, RawPose};
pub use relay::{OutputRelay, RelayStats};
pub use spawner::{CommandSpawner, SpawnError, SpawnedWorker, WorkerSpawner};
pub use supervisor::{
    LoadOutcome, ShutdownOutcome, SupervisorError, TerminateOutcome, WorkerState,
    WorkerSupervisor,
};

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global subscriber, writing to stderr.
///
/// `RUST_LOG` wins when set. Otherwise `POSEBRIDGE_LOG` (debug, info, warn,
/// error; default info) applies to the posebridge targets. `LOG_FORMAT=json`
/// switches to JSON lines.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("POSEBRIDGE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("posebridge={level},bus_probe={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

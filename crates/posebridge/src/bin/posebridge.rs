use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;

use posebridge::config::{parse_device_id, parse_port, parse_scale};
use posebridge::{Bridge, BridgeConfig, CommandSpawner, MqttBus, ShutdownSignals};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config = match BridgeConfig::from_env()
        .map_err(|e| e.to_string())
        .and_then(|config| parse_args(&args, config))
    {
        Ok(config) => config,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: posebridge [--host <host>] [--port <port>] [--device <id>] [--scale <metres>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --host <host>      MQTT broker host [default: 192.168.1.11]");
            eprintln!("  --port <port>      MQTT broker port [default: 1883]");
            eprintln!("  --device <id>      Device id used in topic names [default: jetson_01]");
            eprintln!("  --scale <metres>   Metres per grid cell [default: 0.08]");
            eprintln!();
            eprintln!("Environment: POSEBRIDGE_BROKER_HOST, POSEBRIDGE_BROKER_PORT, POSEBRIDGE_DEVICE_ID,");
            eprintln!("  POSEBRIDGE_WORKER, POSEBRIDGE_VOCABULARY, POSEBRIDGE_SENSOR_CONFIG,");
            eprintln!("  POSEBRIDGE_MODE, POSEBRIDGE_SCALE, POSEBRIDGE_LOG, LOG_FORMAT");
            return ExitCode::from(2);
        }
    };

    posebridge::init_tracing();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "posebridge failed");
            ExitCode::FAILURE
        }
    }
}

fn parse_args(args: &[String], mut config: BridgeConfig) -> Result<BridgeConfig, String> {
    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--host" | "--port" | "--device" | "--scale" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| format!("{flag} requires a value"))?;
                match flag {
                    "--host" => config.bus.host = value.clone(),
                    "--port" => {
                        config.bus.port = parse_port(flag, value).map_err(|e| e.to_string())?
                    }
                    "--device" => {
                        config.device_id =
                            parse_device_id(flag, value).map_err(|e| e.to_string())?
                    }
                    _ => config.scale = parse_scale(flag, value).map_err(|e| e.to_string())?,
                }
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(config)
}

async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let mut signals = ShutdownSignals::install().context("failed to install signal handlers")?;

    tracing::info!(
        device = %config.device_id,
        worker = %config.worker.program.display(),
        scale = config.scale,
        "Starting posebridge"
    );

    let (bus, inbound) = MqttBus::connect(&config.bus)
        .await
        .context("failed to connect to MQTT broker")?;

    let spawner = Arc::new(CommandSpawner::from_config(&config.worker));
    let bridge = Arc::new(Bridge::new(Arc::new(bus), spawner, &config));

    if let Err(e) = bridge.start().await {
        bridge.terminate().await;
        return Err(e).context("failed to subscribe to command topic");
    }

    bridge
        .run(inbound, async {
            let signal = signals.recv().await;
            tracing::info!(signal, "Received signal, shutting down");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("posebridge")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn flags_override_config() {
        let config = parse_args(
            &args(&["--host", "10.0.0.2", "--port", "1884", "--device", "jetson_02", "--scale", "0.1"]),
            BridgeConfig::default(),
        )
        .unwrap();
        assert_eq!(config.bus.host, "10.0.0.2");
        assert_eq!(config.bus.port, 1884);
        assert_eq!(config.command_topic(), "/commands/jetson_02");
        assert_eq!(config.scale, 0.1);
    }

    #[test]
    fn no_flags_keeps_defaults() {
        let config = parse_args(&args(&[]), BridgeConfig::default()).unwrap();
        assert_eq!(config.device_id, "jetson_01");
    }

    #[test]
    fn usage_errors() {
        let cases: [&[&str]; 6] = [
            &["--port"],
            &["--port", "abc"],
            &["--device", "a/b"],
            &["--scale", "0"],
            &["--verbose"],
            &["extra"],
        ];
        for bad in cases {
            assert!(
                parse_args(&args(bad), BridgeConfig::default()).is_err(),
                "{bad:?} should be rejected"
            );
        }
        assert_eq!(
            parse_args(&args(&["--help"]), BridgeConfig::default()).unwrap_err(),
            ""
        );
    }
}

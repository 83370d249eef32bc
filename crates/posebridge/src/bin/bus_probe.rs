//! Broker connectivity check: subscribe to one topic and print every
//! payload received until interrupted.

use std::process::ExitCode;

use anyhow::Context;

use posebridge::config::parse_port;
use posebridge::{BridgeConfig, BusClient, BusConfig, MqttBus, ShutdownSignals};

const DEFAULT_TOPIC: &str = "/test";

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let (bus, topic) = match BridgeConfig::from_env()
        .map_err(|e| e.to_string())
        .and_then(|config| parse_args(&args, config.bus))
    {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: bus-probe [--host <host>] [--port <port>] [--topic <topic>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --host <host>      MQTT broker host [default: 192.168.1.11]");
            eprintln!("  --port <port>      MQTT broker port [default: 1883]");
            eprintln!("  --topic <topic>    Topic to subscribe to [default: {DEFAULT_TOPIC}]");
            return ExitCode::from(2);
        }
    };

    posebridge::init_tracing();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(bus, topic)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "bus-probe failed");
            ExitCode::FAILURE
        }
    }
}

fn parse_args(args: &[String], mut bus: BusConfig) -> Result<(BusConfig, String), String> {
    let mut topic = DEFAULT_TOPIC.to_string();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                bus.host = args.get(i).ok_or("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                let value = args.get(i).ok_or("--port requires a value")?;
                bus.port = parse_port("--port", value).map_err(|e| e.to_string())?;
            }
            "--topic" => {
                i += 1;
                topic = args.get(i).ok_or("--topic requires a value")?.clone();
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok((bus, topic))
}

async fn run(config: BusConfig, topic: String) -> anyhow::Result<()> {
    let mut signals = ShutdownSignals::install().context("failed to install signal handlers")?;

    let (bus, mut inbound) = MqttBus::connect(&config)
        .await
        .context("failed to connect to MQTT broker")?;
    bus.subscribe(&topic)
        .await
        .with_context(|| format!("failed to subscribe to {topic}"))?;

    loop {
        tokio::select! {
            signal = signals.recv() => {
                tracing::info!(signal, "Received signal, exiting");
                break;
            }
            message = inbound.recv() => match message {
                Some(message) => {
                    println!("Received: {}", String::from_utf8_lossy(&message.payload));
                }
                None => {
                    tracing::warn!("Connection closed");
                    break;
                }
            },
        }
    }

    bus.disconnect().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("bus-probe")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_to_test_topic() {
        let (_, topic) = parse_args(&args(&[]), BusConfig::default()).unwrap();
        assert_eq!(topic, "/test");
    }

    #[test]
    fn flags_apply() {
        let (bus, topic) = parse_args(
            &args(&["--host", "localhost", "--port", "1884", "--topic", "/pose/#"]),
            BusConfig::default(),
        )
        .unwrap();
        assert_eq!(bus.host, "localhost");
        assert_eq!(bus.port, 1884);
        assert_eq!(topic, "/pose/#");
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&args(&["--port", "x"]), BusConfig::default()).is_err());
        assert!(parse_args(&args(&["--topic"]), BusConfig::default()).is_err());
        assert!(parse_args(&args(&["stray"]), BusConfig::default()).is_err());
    }
}

//! printer_bridge - serial printer agent
//!
//! Opens the printer's serial port, keeps it open, follows the printer's
//! state, polls telemetry and logs state changes and events until
//! interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use mimalloc::MiMalloc;

use printer_bridge::command::{CommandContext, ExecuteGcode, SendInfo};
use printer_bridge::config::{BridgeConfig, DEFAULT_CONFIG_PATH};
use printer_bridge::events::{forward_state_changes, EventSink, LogSink};
use printer_bridge::inference::StateInference;
use printer_bridge::queue::{InstructionQueue, QueueConfig};
use printer_bridge::telemetry::TelemetryGatherer;
use printer_bridge::transport::serial::SerialConnector;
use printer_bridge::transport::{Connector, Transport, TransportConfig};
use printer_bridge::{logging, LineRouter, Shutdown, StateMachine};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "printer_bridge", version, about = "Serial printer agent")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Serial port, overriding the configuration
    #[arg(short, long)]
    port: Option<String>,

    /// Reset the printer through the DTR line after connecting
    #[arg(long)]
    reset: bool,

    /// G-code to execute once connected (repeatable)
    #[arg(long = "gcode")]
    gcodes: Vec<String>,

    /// Report printer information once connected
    #[arg(long)]
    info: bool,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = BridgeConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;
    if let Some(port) = cli.port {
        config.serial.port = port;
    }

    logging::init(&config.application.log_level, cli.json_logs);
    tracing::info!(
        name = %config.application.name,
        port = %config.serial.port,
        baud_rate = config.serial.baud_rate,
        "Starting printer bridge"
    );

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Interrupted, shutting down"),
                Err(e) => tracing::error!(error = %e, "Cannot listen for interrupts, shutting down"),
            }
            shutdown.trigger();
        });
    }

    let router = Arc::new(LineRouter::new());
    let connector: Arc<dyn Connector> = Arc::new(SerialConnector::from(&config.serial));
    let transport = match Transport::start(
        connector,
        TransportConfig::from(&config.serial),
        Arc::clone(&router),
        shutdown.clone(),
    )
    .await
    {
        Ok(transport) => transport,
        Err(e) if e.is_shutdown() => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if cli.reset {
        transport.reset_via_control_line().await?;
    }

    let queue_config = QueueConfig::try_from(&config.queue)?;
    let queue = InstructionQueue::start(
        Arc::clone(&transport),
        &router,
        queue_config,
        shutdown.clone(),
    );
    let state = Arc::new(StateMachine::new());
    let _inference = StateInference::install(&router, &state);
    let events: Arc<dyn EventSink> = Arc::new(LogSink);

    let mut tasks = vec![forward_state_changes(
        &state,
        Arc::clone(&events),
        shutdown.clone(),
    )];

    let telemetry = TelemetryGatherer::new(
        Arc::clone(&queue),
        Arc::clone(&state),
        &router,
        &config.telemetry,
    );
    let interval = Duration::from_millis(config.telemetry.interval_ms);
    tasks.push(telemetry.watch_state(shutdown.clone()));
    tasks.push(Arc::clone(&telemetry).spawn_poller(
        interval,
        transport.link_status(),
        shutdown.clone(),
    ));
    {
        let telemetry = Arc::clone(&telemetry);
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            while shutdown.sleep(interval).await {
                let snapshot = telemetry.take_telemetry(state.get_state());
                match serde_json::to_string(&snapshot) {
                    Ok(json) => tracing::info!(telemetry = %json, "Telemetry"),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize telemetry"),
                }
            }
        }));
    }

    let commands = CommandContext::new(
        Arc::clone(&queue),
        Arc::clone(&state),
        events,
        transport.link_status(),
        shutdown.clone(),
        &config.commands,
    );
    if cli.info {
        // Reported as an event either way.
        let _ = commands.execute(0, &SendInfo::new()).await;
    }
    for (command_id, gcode) in (1..).zip(cli.gcodes) {
        // Failures are reported as events; keep going with the next one.
        if let Err(e) = commands.execute(command_id, &ExecuteGcode::new(gcode)).await {
            if e.is_shutdown() {
                break;
            }
        }
    }

    shutdown.wait().await;

    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }
    queue.stop().await;
    transport.shutdown().await;
    tracing::info!("Printer bridge stopped");
    Ok(())
}

//! Agent Bus CLI
//!
//! Operator entry point: loads configuration, initialises logging, and runs
//! a self-check against an in-process broker.

use agent_client::AgentClient;
use agent_comms::{payload, Broker, InProcessBackend, Payload};
use agent_core::{init_logging, load_config_or_default, BusConfig};
use agent_runtime::Agent;
use agent_telemetry::{TelemetryCollector, TelemetryEvent};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "agent-bus", version, about = "Inter-agent message bus")]
struct Cli {
    /// Configuration file (TOML, JSON, or YAML); BUS__* env vars override it
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log as JSON regardless of configuration
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Ping round trips, a context write, and broker health/stats
    Check {
        /// Number of ping round trips
        #[arg(short, long, default_value_t = 3)]
        rounds: u32,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = load_config_or_default(&cli.config);
    if cli.json_logs {
        config.logging.json = true;
    }
    init_logging(&config.logging)?;

    match cli.command.unwrap_or(Command::Check { rounds: 3 }) {
        Command::Check { rounds } => self_check(&config, rounds).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn self_check(config: &BusConfig, rounds: u32) -> Result<(), Box<dyn std::error::Error>> {
    println!("Agent Bus v{}", env!("CARGO_PKG_VERSION"));

    let broker = Arc::new(Broker::with_backend(
        InProcessBackend::new(),
        config.broker.clone(),
    ));
    let shutdown = CancellationToken::new();
    let sweeper = broker.spawn_sweeper(shutdown.clone());

    let telemetry = TelemetryCollector::default();
    let mut events = telemetry.subscribe();

    let client = AgentClient::builder(Arc::clone(&broker))
        .client_id("agent-bus-cli")
        .settings(config.agent.clone())
        .telemetry(telemetry.clone())
        .agent("echo", move |broker, settings| {
            let agent = Agent::builder("echo", "diagnostic", broker)
                .settings(settings.clone())
                .telemetry(telemetry.clone())
                .build();
            agent.register_handler("ping", |agent, message| async move {
                agent
                    .send_response(&message, payload(json!({"pong": true})))
                    .await
            });
            Ok(agent)
        })
        .build();

    for round in 1..=rounds {
        let started = Instant::now();
        let reply: Payload = client.call("echo", "ping", Payload::new()).await?;
        println!(
            "ping #{round}: pong={} in {:?}",
            reply.get("pong").unwrap_or(&json!(false)),
            started.elapsed()
        );
    }

    let mut context = client
        .start_workflow(
            "self-check",
            "diagnostic",
            payload(json!({"rounds": rounds})),
            payload(json!({"source": "agent-bus check"})),
            None,
        )
        .await?;
    context.mark_completed()?;
    broker.update_context(&mut context).await?;
    let stored = client.get_context(&context.context_id).await?;
    println!(
        "context {}: status={} version={}",
        stored.context_id, stored.status, stored.version
    );

    println!("health: {}", serde_json::to_string(&broker.health().await)?);
    println!("stats:  {}", serde_json::to_string(&broker.stats().await?)?);

    client.shutdown().await?;
    shutdown.cancel();
    sweeper.await?;

    let mut sent = 0;
    let mut received = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            TelemetryEvent::MessageSent { .. } => sent += 1,
            TelemetryEvent::MessageReceived { .. } => received += 1,
            TelemetryEvent::DeadLetter { action, .. } => println!("dead letter: {action}"),
            TelemetryEvent::HandlerFailed { action, error, .. } => {
                println!("handler failed: {action}: {error}")
            }
            _ => {}
        }
    }
    println!("telemetry: {sent} sent, {received} received");
    println!("self-check passed");
    Ok(())
}

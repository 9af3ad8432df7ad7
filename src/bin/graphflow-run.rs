//! `graphflow-run`: loads a YAML graph definition, wires it, optionally
//! fires a one-shot trigger event, and prints the resulting graph
//! summary as JSON.

use clap::Parser;
use graphflow::config::load_yaml_config;
use graphflow::definition::{self, GraphDefinition};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "graphflow-run")]
#[command(about = "Load and run a graphflow graph definition", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to the YAML graph definition.
    #[arg(short, long)]
    graph: PathBuf,

    /// How long to keep lifecycle-capable nodes (MQTT subscriber/
    /// publisher) running after the trigger fires, in seconds. Ignored
    /// if the graph has no lifecycle nodes.
    #[arg(long, default_value_t = 0)]
    run_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "graphflow-run failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let def: GraphDefinition = load_yaml_config(&cli.graph)?;
    let graph = definition::build_graph(&def).await?;

    graph.start().await?;

    if let Some(trigger) = &def.trigger {
        tracing::info!(node = %trigger.node, "firing trigger event");
        graph.trigger_event(&trigger.node, definition::trigger_event(trigger)).await;
    }

    if cli.run_secs > 0 {
        tokio::time::sleep(std::time::Duration::from_secs(cli.run_secs)).await;
    }

    println!("{}", serde_json::to_string_pretty(&graph.summary())?);

    graph.stop().await?;
    Ok(())
}

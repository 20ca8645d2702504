//! CLI binary for invoking Conflux providers and inspecting the loader.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use conflux_engine::execute;
use conflux_providers::{ProviderKind, ProviderLoader};
use conflux_types::{duration_serde, ExecutionContext, ProviderDescriptor};

#[derive(Parser)]
#[command(name = "cfx", version, about = "Invoke workflow integrations through the Conflux provider engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the whitelisted provider keys
    List,

    /// Invoke a provider with a JSON input payload
    Invoke {
        /// Provider key (see `cfx list`)
        provider: String,

        /// Path to a JSON file holding the input payload
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Inline JSON input payload (takes precedence over --input)
        #[arg(long, value_name = "JSON")]
        input_json: Option<String>,

        /// Provider configuration file: JSON map of key -> descriptor
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Timeout override, e.g. "30s" or "500ms"
        #[arg(short, long)]
        timeout: Option<String>,

        /// Correlation id; generated when omitted
        #[arg(long)]
        task_id: Option<String>,

        /// Print loader counters to stderr after the invocation
        #[arg(long)]
        show_stats: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::List => cmd_list(),
        Commands::Invoke {
            provider,
            input,
            input_json,
            config,
            timeout,
            task_id,
            show_stats,
        } => {
            cmd_invoke(
                &provider,
                input.as_deref(),
                input_json.as_deref(),
                config.as_deref(),
                timeout.as_deref(),
                task_id,
                show_stats,
            )
            .await?;
        }
    }
    Ok(())
}

fn cmd_list() {
    for kind in ProviderKind::all() {
        println!("{:<20} {}", kind.key(), kind.display_name());
    }
}

async fn cmd_invoke(
    provider: &str,
    input: Option<&Path>,
    input_json: Option<&str>,
    config: Option<&Path>,
    timeout: Option<&str>,
    task_id: Option<String>,
    show_stats: bool,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match (input_json, input) {
        (Some(raw), _) => serde_json::from_str(raw).context("parsing --input-json")?,
        (None, Some(path)) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading input file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing input file {}", path.display()))?
        }
        (None, None) => anyhow::bail!("provide an input payload via --input FILE or --input-json JSON"),
    };

    let descriptors: HashMap<String, ProviderDescriptor> = match config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => HashMap::new(),
    };
    let loader = ProviderLoader::with_descriptors(descriptors);

    // Load failures are faults, reported before any execution happens.
    let handler = match loader.load(provider).await {
        Ok(handler) => handler,
        Err(err) => {
            eprintln!("{}", serde_json::to_string_pretty(&err)?);
            std::process::exit(2);
        }
    };

    // Ctrl-C feeds the caller-side cancellation token.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling invocation");
                cancel.cancel();
            }
        });
    }

    let mut context = ExecutionContext::new(payload)
        .with_cancellation(cancel)
        .with_metadata(
            "invoked_at",
            serde_json::json!(chrono::Utc::now().to_rfc3339()),
        );
    if let Some(raw) = timeout {
        let timeout = duration_serde::parse_duration_str(raw)
            .map_err(|e| anyhow::anyhow!("invalid --timeout: {e}"))?;
        context = context.with_timeout(timeout);
    }
    if let Some(task_id) = task_id {
        context = context.with_task_id(task_id);
    }

    let result = execute(&handler, context).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if show_stats {
        eprintln!("{}", serde_json::to_string_pretty(&loader.stats().await)?);
    }

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cadflow::codec::{write_expression_file, ParameterSet};
use cadflow::config::CadflowConfig;
use cadflow::core::{EventStatus, OutputStream, RunStatus, StatusEvent};
use cadflow::events::ChannelStatusSink;
use cadflow::orchestrator::{Orchestrator, SubmitRequest, TargetSelection};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "cadflow=info";
const EVENT_BUFFER: usize = 1024;

#[derive(Parser)]
#[command(name = "cadflow")]
#[command(about = "Run CAD-to-solver pipelines locally or on remote hosts", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit logs and status events as JSON lines.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a run and stream its status until it finishes.
    Run {
        #[arg(short, long, env = "CADFLOW_CONFIG", default_value = "cadflow.json")]
        config: PathBuf,

        /// Parameter file: a JSON array of {name, type, value, unit}.
        #[arg(short, long)]
        params: PathBuf,

        /// `local` or a profile name.
        #[arg(short, long, default_value = "local")]
        target: TargetSelection,

        /// Files copied into the run directory before the first stage.
        #[arg(short, long = "input")]
        inputs: Vec<PathBuf>,
    },
    /// Write an expression interchange file.
    Encode {
        #[arg(short, long)]
        params: PathBuf,

        #[arg(short, long)]
        out: PathBuf,
    },
    /// List configured remote profiles.
    Profiles {
        #[arg(short, long, env = "CADFLOW_CONFIG", default_value = "cadflow.json")]
        config: PathBuf,
    },
    /// Validate the configuration and pipeline.
    Check {
        #[arg(short, long, env = "CADFLOW_CONFIG", default_value = "cadflow.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Commands::Run {
            config,
            params,
            target,
            inputs,
        } => run(&config, &params, target, inputs, cli.json).await,
        Commands::Encode { params, out } => encode(&params, &out).await,
        Commands::Profiles { config } => profiles(&config, cli.json),
        Commands::Check { config } => check(&config),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(path: &Path) -> Result<CadflowConfig> {
    CadflowConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))
}

async fn load_params(path: &Path) -> Result<ParameterSet> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read parameters {}", path.display()))?;
    ParameterSet::from_json_str(&text)
        .with_context(|| format!("Invalid parameters in {}", path.display()))
}

async fn run(
    config: &Path,
    params: &Path,
    target: TargetSelection,
    inputs: Vec<PathBuf>,
    json: bool,
) -> Result<ExitCode> {
    let config = load_config(config)?;
    let params = load_params(params).await?;

    let (sink, mut events) = ChannelStatusSink::new(EVENT_BUFFER);
    let orchestrator =
        Orchestrator::new(config, Arc::new(sink)).context("Invalid configuration")?;

    let mut request = SubmitRequest::new(params).with_target(target);
    request.inputs = inputs;
    let handle = orchestrator.submit(request).await.context("Run rejected")?;
    info!(run_id = %handle.id(), workdir = %handle.workdir().display(), "Run started");

    let run_id = handle.id();
    let cancel_on_interrupt = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel("interrupted");
        }
        std::future::pending::<()>().await;
    };
    let stream = async {
        while let Some(event) = events.recv().await {
            print_event(&event, json)?;
            if event.run_id == run_id && event.status.is_terminal_run() {
                break;
            }
        }
        anyhow::Ok(())
    };
    tokio::select! {
        result = stream => result?,
        () = cancel_on_interrupt => {}
    }

    let run = handle.wait().await?;
    orchestrator.shutdown().await;

    if json {
        println!("{}", serde_json::to_string(&run)?);
    } else if let Some(error) = &run.error {
        eprintln!(
            "run {} {}: {}{}",
            run.id,
            run.status(),
            run.failed_stage.as_deref().map(|s| format!("[{s}] ")).unwrap_or_default(),
            error
        );
    }

    Ok(if run.status() == RunStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_event(event: &StatusEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    let stage = match (&event.stage_id, event.attempt) {
        (Some(stage), Some(attempt)) => format!("{stage}#{attempt} "),
        (Some(stage), None) => format!("{stage} "),
        _ => String::new(),
    };
    match event.status {
        EventStatus::Output(stream) => {
            let tag = match stream {
                OutputStream::Stdout => "out",
                OutputStream::Stderr => "err",
            };
            println!("{stage}{tag}| {}", event.message);
        }
        EventStatus::Run(status) => println!("run {status} {}", event.message),
        EventStatus::Stage(status) => println!("{stage}{status} {}", event.message),
    }
    Ok(())
}

async fn encode(params: &Path, out: &Path) -> Result<ExitCode> {
    let params = load_params(params).await?;
    write_expression_file(out, &params)
        .await
        .with_context(|| format!("Failed to write {}", out.display()))?;
    println!("Wrote {} parameters to {}", params.len(), out.display());
    Ok(ExitCode::SUCCESS)
}

fn profiles(config: &Path, json: bool) -> Result<ExitCode> {
    let config = load_config(config)?;
    if json {
        println!("{}", serde_json::to_string(&config.profiles)?);
        return Ok(ExitCode::SUCCESS);
    }
    if config.profiles.is_empty() {
        println!("No profiles configured");
    }
    for profile in config.profiles.values() {
        let mode = if profile.uses_queue() {
            profile.scheduler.to_string()
        } else {
            "foreground".to_string()
        };
        println!("{:<16} {:<32} {}", profile.name, profile.destination(), mode);
    }
    Ok(ExitCode::SUCCESS)
}

fn check(config: &Path) -> Result<ExitCode> {
    let config = load_config(config)?;
    if config.pipeline.stages.is_empty() {
        bail!("Pipeline '{}' has no stages", config.pipeline.name);
    }
    println!(
        "Pipeline '{}' OK: {} stages, {} profiles",
        config.pipeline.name,
        config.pipeline.stages.len(),
        config.profiles.len()
    );
    Ok(ExitCode::SUCCESS)
}

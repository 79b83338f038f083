use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use remaster::{telemetry, Capabilities, ConsoleStyle, Mode, Pipeline, RemasterRequest};
use remasterconf::RemasterConfig;
use tokio_util::sync::CancellationToken;

/// Remaster MIDI files into console-styled audio
#[derive(Parser, Debug)]
#[command(name = "remaster", version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of ./remaster.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Remaster one or more MIDI files and print the responses as JSON
    Run {
        /// .mid or .midi files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Target console style: snes, gba, nds, ps2 or wii
        #[arg(short, long, default_value = "snes")]
        style: String,

        /// baseline or ml
        #[arg(short, long, default_value = "baseline")]
        mode: Mode,

        /// Text prompt for generative mode
        #[arg(long)]
        description: Option<String>,

        /// Checkpoint file name in the checkpoint directory
        #[arg(long)]
        checkpoint: Option<String>,

        /// Also render with this style's soundfont as a separate B output
        #[arg(long)]
        alternate_soundfont: Option<String>,
    },

    /// Check tools and checkpoints and print what is available
    Capabilities,

    /// Reclaim expired workspaces
    Sweep {
        /// Keep sweeping on the configured interval until interrupted
        #[arg(long)]
        watch: bool,
    },

    /// Print the effective configuration
    Config,

    /// Score how well remapping preserves melody and rhythm across a corpus
    Evaluate {
        /// Directory searched recursively for .mid and .midi files
        corpus: PathBuf,

        /// Styles to evaluate; all five when omitted
        #[arg(short, long, num_args = 1..)]
        styles: Vec<ConsoleStyle>,

        /// Onset matching window in milliseconds
        #[arg(long, default_value_t = 50)]
        tolerance_ms: u64,

        /// Also write the JSON report to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compare two MIDI files directly
    Compare {
        reference: PathBuf,
        candidate: PathBuf,

        /// Onset matching window in milliseconds
        #[arg(long, default_value_t = 50)]
        tolerance_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let (config, sources) = RemasterConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    let _telemetry = telemetry::init(
        &config.telemetry.log_level,
        config.telemetry.otlp_endpoint.as_deref(),
    )
    .context("Failed to initialize telemetry")?;

    match cli.command {
        Command::Config => {
            for file in &sources.files {
                println!("# loaded: {}", file.display());
            }
            for var in &sources.env_overrides {
                println!("# env: {var}");
            }
            print!("{}", config.to_toml());
            Ok(ExitCode::SUCCESS)
        }
        Command::Capabilities => {
            let caps = Capabilities::detect(&config).await;
            println!("{}", serde_json::to_string_pretty(&caps)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Sweep { watch } => sweep(config, watch).await,
        Command::Evaluate {
            corpus,
            styles,
            tolerance_ms,
            output,
        } => evaluate(config, corpus, styles, Duration::from_millis(tolerance_ms), output).await,
        Command::Compare {
            reference,
            candidate,
            tolerance_ms,
        } => compare(config, reference, candidate, Duration::from_millis(tolerance_ms)).await,
        Command::Run {
            files,
            style,
            mode,
            description,
            checkpoint,
            alternate_soundfont,
        } => {
            let template = RemasterRequest {
                style,
                mode,
                description,
                checkpoint,
                alternate_soundfont,
                ..Default::default()
            };
            run(config, files, template).await
        }
    }
}

async fn run(config: RemasterConfig, files: Vec<PathBuf>, template: RemasterRequest) -> Result<ExitCode> {
    let caps = Capabilities::detect(&config).await;
    let interval = config.retention.sweep_interval()?;
    let pipeline = Arc::new(Pipeline::new(config, caps)?);

    let cancel = CancellationToken::new();
    let sweeper = scratch::spawn_sweeper(Arc::clone(pipeline.workspaces()), interval, cancel.clone());

    let mut tasks = Vec::with_capacity(files.len());
    for path in files {
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let request = RemasterRequest {
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            bytes,
            ..template.clone()
        };
        let pipeline = Arc::clone(&pipeline);
        tasks.push(tokio::spawn(async move { pipeline.run(request).await }));
    }

    let mut failed = false;
    for task in tasks {
        match task.await.context("Remaster task panicked")? {
            Ok(response) => println!("{}", serde_json::to_string_pretty(&response)?),
            Err(e) => {
                failed = true;
                println!("{}", serde_json::to_string_pretty(&e.to_body())?);
            }
        }
    }

    cancel.cancel();
    let _ = sweeper.await;

    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

async fn sweep(config: RemasterConfig, watch: bool) -> Result<ExitCode> {
    let interval = config.retention.sweep_interval()?;
    let caps = Capabilities::assume_available(&config);
    let pipeline = Pipeline::new(config, caps)?;
    let manager = Arc::clone(pipeline.workspaces());

    if !watch {
        let report = tokio::task::spawn_blocking(move || manager.reclaim_if_needed())
            .await
            .context("Sweep task panicked")?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = CancellationToken::new();
    let sweeper = scratch::spawn_sweeper(manager, interval, cancel.clone());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    cancel.cancel();
    sweeper.await.context("Sweeper task panicked")?;
    Ok(ExitCode::SUCCESS)
}

async fn evaluate(
    config: RemasterConfig,
    corpus: PathBuf,
    styles: Vec<ConsoleStyle>,
    tolerance: Duration,
    output: Option<PathBuf>,
) -> Result<ExitCode> {
    let styles = if styles.is_empty() {
        ConsoleStyle::ALL.to_vec()
    } else {
        styles
    };
    let caps = Capabilities::assume_available(&config);
    let pipeline = Pipeline::new(config, caps)?;

    let report = remaster::evaluate_corpus(&pipeline, &corpus, &styles, tolerance)
        .await
        .with_context(|| format!("Failed to evaluate {}", corpus.display()))?;
    let json = serde_json::to_string_pretty(&report)?;
    if let Some(path) = output {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, &json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    println!("{json}");
    Ok(ExitCode::SUCCESS)
}

async fn compare(
    config: RemasterConfig,
    reference: PathBuf,
    candidate: PathBuf,
    tolerance: Duration,
) -> Result<ExitCode> {
    let timeout = config.limits.parse_timeout()?;
    let mut docs = Vec::with_capacity(2);
    for path in [&reference, &candidate] {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let doc = tokio::task::spawn_blocking(move || midi_analysis::load_with_timeout(&bytes, timeout))
            .await
            .context("Parse task panicked")?
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        docs.push(doc);
    }
    let result = midi_analysis::evaluate(&docs[0], &docs[1], tolerance);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(ExitCode::SUCCESS)
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fs;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use reqwest::Url;
use tracing_subscriber::EnvFilter;

use nocap::command::{CancellationToken, Command, CommandFeatures, TimeEstimate};
use nocap::error::{report, ErrorBuilder};
use nocap::locks::resilient_lock;
use nocap::{
    load_config, CommandError, CommandRegistry, CommandRunner, Config, MutableProgressTracker, RunnerEvent, TaskState,
    TypedData, TypedDataType,
};

/// Version string
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following BSD sysexits.h conventions
mod exit_codes {
    /// Success - operation completed successfully
    pub const SUCCESS: i32 = 0;
    /// General error - the pipeline failed
    pub const ERROR: i32 = 1;
    /// Usage error - invalid command line arguments
    pub const USAGE: i32 = 64;
    /// Data error - the pipeline does not accept the given input
    pub const DATA_ERR: i32 = 65;
    /// I/O error - input file could not be read
    pub const IO_ERR: i32 = 74;
    /// Configuration error - invalid config or pipeline
    pub const CONFIG: i32 = 78;
    /// Interrupted - cancelled with Ctrl+C
    pub const CANCELLED: i32 = 130;
}

use exit_codes::*;

/// Progress bar helpers for consistent output
mod bar {
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    pub fn determinate_style() -> ProgressStyle {
        ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ")
    }

    pub fn indeterminate_style() -> ProgressStyle {
        ProgressStyle::with_template("{spinner:.cyan} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
    }

    pub fn create(indeterminate: bool, quiet: bool) -> ProgressBar {
        if quiet {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(100);
        bar.set_style(if indeterminate {
            indeterminate_style()
        } else {
            determinate_style()
        });
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    }
}

/// nocap - capture, transform and upload through composable pipelines.
#[derive(Parser)]
#[command(name = "nocap")]
#[command(version = VERSION)]
#[command(about = "Run data through composable save/upload pipelines.")]
#[command(long_about = "nocap - composable save/upload pipelines\n\n\
    Save a screenshot:      nocap run shot.png\n\
    Save some text:         nocap run --text \"hello\"\n\
    Pipe stdin:             echo hi | nocap run --pipeline share\n\
    List commands:          nocap list\n\
    List pipelines:         nocap pipelines\n\n\
    Pipelines are configured in ~/.nocap/config.json.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to use instead of ~/.nocap/config.json
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Quiet mode: no progress bar
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: debug logging on stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline on a file, text, a URL or piped stdin
    ///
    /// Examples:
    ///   nocap run screenshot.png
    ///   nocap run --pipeline share --url https://example.com
    Run {
        /// Pipeline name (defaults to the configured default, else "save")
        #[arg(short, long)]
        pipeline: Option<String>,

        /// Use this text as input
        #[arg(long, conflicts_with_all = ["url", "file"])]
        text: Option<String>,

        /// Use this URL as input
        #[arg(long, conflicts_with = "file")]
        url: Option<String>,

        /// Input file; images are decoded, anything else is sent as raw bytes
        file: Option<PathBuf>,
    },

    /// List registered commands and the features they provide
    #[command(alias = "ls")]
    List,

    /// List configured pipelines with their accepted input types
    Pipelines,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("nocap=debug")
    } else {
        EnvFilter::try_from_env("NOCAP_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    // Logs go to stderr so stdout only carries results.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

/// Keeps a printable copy of the root command's result, which the runner
/// disposes once the task finishes.
struct Capture {
    inner: Arc<dyn Command>,
    result: Arc<Mutex<Option<String>>>,
}

impl Command for Capture {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn input_data_types(&self) -> Vec<TypedDataType> {
        self.inner.input_data_types()
    }

    fn time_estimate(&self) -> TimeEstimate {
        self.inner.time_estimate()
    }

    fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    fn factory_id(&self) -> Option<&str> {
        self.inner.factory_id()
    }

    fn process(
        &self,
        input: &mut TypedData,
        progress: &Arc<MutableProgressTracker>,
        cancel: &CancellationToken,
    ) -> nocap::Result<TypedData> {
        let output = self.inner.process(input, progress, cancel)?;
        *resilient_lock(&self.result) = Some(output.describe());
        Ok(output)
    }
}

fn read_file(path: &Path) -> Result<TypedData> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());

    if image::ImageFormat::from_path(path).is_ok() {
        let image = image::open(path).with_context(|| format!("decoding image {}", path.display()))?;
        return Ok(TypedData::from_image(image, name));
    }

    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(TypedData::from_raw_data(bytes, name))
}

fn read_input(text: Option<String>, url: Option<String>, file: Option<PathBuf>) -> Result<TypedData> {
    if let Some(text) = text {
        return Ok(TypedData::from_text(text, "text"));
    }
    if let Some(url) = url {
        let uri = Url::parse(&url).with_context(|| format!("'{}' is not a valid URL", url))?;
        return Ok(TypedData::from_uri(uri, "link"));
    }
    if let Some(path) = file {
        return read_file(&path);
    }
    if !io::stdin().is_terminal() {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text).context("reading stdin")?;
        return Ok(TypedData::from_text(text, "stdin"));
    }
    Ok(TypedData::none())
}

fn handle_run(
    config: &Config,
    registry: &CommandRegistry,
    pipeline: Option<String>,
    input: Result<TypedData>,
    quiet: bool,
) -> Result<i32> {
    let pipeline_name = pipeline.unwrap_or_else(|| config.default_pipeline().to_string());
    let pipeline = match config.pipeline(&pipeline_name, registry) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!(
                "{}",
                ErrorBuilder::new(format!("Cannot build pipeline '{}'", pipeline_name))
                    .cause(format!("{:#}", e))
                    .fix("Run `nocap pipelines` to see what is configured")
                    .fix("Check ~/.nocap/config.json")
                    .build()
            );
            return Ok(CONFIG);
        }
    };

    let input = match input {
        Ok(input) => input,
        Err(e) => {
            eprintln!("{} {:#}", "[✗]".red(), e);
            return Ok(IO_ERR);
        }
    };
    if input.is_none() && !pipeline.accepts(TypedDataType::None) {
        eprintln!(
            "{} Pipeline '{}' needs input: pass a FILE, --text, --url or pipe to stdin",
            "[!]".yellow(),
            pipeline_name
        );
        return Ok(USAGE);
    }

    let result = Arc::new(Mutex::new(None));
    let root: Arc<dyn Command> = Arc::new(Capture {
        inner: pipeline,
        result: result.clone(),
    });

    let runner = CommandRunner::new();
    let bar = bar::create(root.time_estimate().is_indeterminate, quiet);
    let listener = {
        let bar = bar.clone();
        let spinning = AtomicBool::new(root.time_estimate().is_indeterminate);
        runner.subscribe(Arc::new(move |event: &RunnerEvent| {
            if let RunnerEvent::ProgressUpdated { snapshot, .. } = event {
                if spinning.swap(snapshot.is_indeterminate, Ordering::Relaxed) != snapshot.is_indeterminate {
                    bar.set_style(if snapshot.is_indeterminate {
                        bar::indeterminate_style()
                    } else {
                        bar::determinate_style()
                    });
                }
                bar.set_position(snapshot.percent());
                if let Some(status) = &snapshot.status {
                    bar.set_message(status.clone());
                }
            }
        }))
    };

    let task = match runner.run_with_input(root, input) {
        Ok(task) => task,
        Err(err) => {
            bar.finish_and_clear();
            eprintln!("{}", report(&err));
            return Ok(match err {
                CommandError::UnsupportedDataType { .. } => DATA_ERR,
                CommandError::InvalidArgument(_) => CONFIG,
                _ => ERROR,
            });
        }
    };
    bar.set_message(task.name().to_string());

    let interrupted = task.clone();
    if let Err(e) = ctrlc::set_handler(move || interrupted.cancel("interrupted by user")) {
        tracing::warn!(error = %e, "could not install Ctrl+C handler");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("creating async runtime")?;
    let state = runtime.block_on(task.wait());
    runner.unsubscribe(listener);
    bar.finish_and_clear();

    let elapsed = task
        .elapsed()
        .and_then(|d| d.to_std().ok())
        .unwrap_or(Duration::ZERO);

    Ok(match state {
        TaskState::Completed => {
            let output = resilient_lock(&result).take().unwrap_or_else(|| "(no data)".to_string());
            if !quiet {
                eprintln!("{} {} finished in {:.1}s", "[OK]".green(), pipeline_name.bold(), elapsed.as_secs_f64());
            }
            println!("{}", output);
            SUCCESS
        }
        TaskState::Cancelled { command, reason } => {
            eprintln!(
                "{} Cancelled in '{}'{}",
                "[!]".yellow(),
                command,
                reason.map(|r| format!(": {}", r)).unwrap_or_default()
            );
            CANCELLED
        }
        TaskState::Failed { error } => {
            eprintln!(
                "{}",
                ErrorBuilder::new(format!("Pipeline '{}' failed", pipeline_name))
                    .cause(error)
                    .fix("Run again with --verbose for details")
                    .fix("Check the pipeline with `nocap pipelines`")
                    .build()
            );
            ERROR
        }
        other => {
            tracing::error!(state = %other, "task ended in a non-terminal state");
            ERROR
        }
    })
}

fn handle_list(registry: &CommandRegistry) {
    println!("{}", "Registered commands".bold());
    println!();
    for factory in registry.factories() {
        let features: Vec<String> = factory
            .features()
            .names()
            .into_iter()
            .map(|name| {
                let is_default = CommandFeatures::from_name(name)
                    .and_then(|flag| registry.default_id(flag))
                    .is_some_and(|id| id == factory.id());
                if is_default {
                    format!("{}*", name)
                } else {
                    name.to_string()
                }
            })
            .collect();

        if features.is_empty() {
            println!("  {:<16} {}", factory.id().cyan(), factory.name());
        } else {
            println!(
                "  {:<16} {} {}",
                factory.id().cyan(),
                factory.name(),
                format!("[{}]", features.join(", ")).dimmed()
            );
        }
    }
    println!();
    println!("{}", "* default for that feature".dimmed());
}

fn handle_pipelines(config: &Config, registry: &CommandRegistry) {
    println!("{} (output: {})", "Pipelines".bold(), config.output_dir().display());
    println!();
    let output_dir = config.output_dir();
    for (name, spec) in &config.pipelines {
        let marker = if name == config.default_pipeline() { "*" } else { " " };
        match spec.build(name, registry, &output_dir) {
            Ok(command) => {
                let types: Vec<String> = command.input_data_types().iter().map(ToString::to_string).collect();
                let validity = if command.is_valid() {
                    "valid".green()
                } else {
                    "invalid".red()
                };
                println!("{} {:<12} {:<8} accepts {}", marker, name.cyan(), validity, types.join(", "));
            }
            Err(e) => println!("{} {:<12} {}", marker, name.cyan(), format!("error: {}", e).red()),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} Failed to load config: {:#}", "[✗]".red(), e);
            std::process::exit(CONFIG);
        }
    };
    let registry = match config.registry() {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("{} Invalid config: {:#}", "[✗]".red(), e);
            std::process::exit(CONFIG);
        }
    };

    match cli.command {
        Commands::Run {
            pipeline,
            text,
            url,
            file,
        } => {
            let input = read_input(text, url, file);
            let code = handle_run(&config, &registry, pipeline, input, cli.quiet)?;
            if code != SUCCESS {
                std::process::exit(code);
            }
        }
        Commands::List => handle_list(&registry),
        Commands::Pipelines => handle_pipelines(&config, &registry),
    }
    Ok(())
}

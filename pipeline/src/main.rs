//! Bounded retry execution pipeline CLI.
//!
//! `run` gates, executes and retries one code submission against a CSV file
//! and prints the outcome JSON on stdout. `check` runs only the static gates.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};

use insight_pipeline::core::safety::SafetyGate;
use insight_pipeline::core::structure::StructuralValidator;
use insight_pipeline::core::types::{CodeSubmission, DataContext, DeclaredOutput, ReviewState};
use insight_pipeline::exit_codes;
use insight_pipeline::io::config::{
    DEFAULT_CONFIG_FILE, PipelineConfig, SandboxBackend, load_config, write_config,
};
use insight_pipeline::{logging, run_pipeline};

#[derive(Parser)]
#[command(
    name = "insight-pipeline",
    version,
    about = "Gate, execute and retry generated data-analysis code"
)]
struct Cli {
    /// Config file (defaults apply when it does not exist).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run code against a data file and print the outcome JSON.
    Run {
        /// File holding the code, or `-` for stdin.
        #[arg(long)]
        code: String,
        /// Data file; otherwise taken from a marker line in the code.
        #[arg(long)]
        data: Option<PathBuf>,
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
        /// Output the code promises to bind.
        #[arg(long, value_enum)]
        declared: Option<DeclaredArg>,
        #[arg(long)]
        max_iterations: Option<u32>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Pretty-print the outcome JSON.
        #[arg(long)]
        pretty: bool,
    },
    /// Run the safety and structure gates without executing anything.
    Check {
        /// File holding the code, or `-` for stdin.
        #[arg(long)]
        code: String,
        #[arg(long, value_enum)]
        declared: Option<DeclaredArg>,
    },
    /// Write the default config file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Python,
    Embedded,
}

impl From<BackendArg> for SandboxBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Python => SandboxBackend::Python,
            BackendArg::Embedded => SandboxBackend::Embedded,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum DeclaredArg {
    Value,
    Table,
}

impl From<DeclaredArg> for DeclaredOutput {
    fn from(arg: DeclaredArg) -> Self {
        match arg {
            DeclaredArg::Value => DeclaredOutput::Value,
            DeclaredArg::Table => DeclaredOutput::Table,
        }
    }
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            code,
            data,
            backend,
            declared,
            max_iterations,
            timeout_secs,
            pretty,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(backend) = backend {
                config.backend = backend.into();
            }
            if let Some(max_iterations) = max_iterations {
                config.max_iterations = max_iterations;
            }
            if let Some(timeout_secs) = timeout_secs {
                config.timeout_secs = timeout_secs;
            }
            config.validate().context("invalid command-line overrides")?;
            cmd_run(&config, &code, data, declared, pretty)
        }
        Command::Check { code, declared } => {
            let config = load_config(&cli.config)?;
            cmd_check(&config, &code, declared)
        }
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
    }
}

fn cmd_run(
    config: &PipelineConfig,
    code_source: &str,
    data: Option<PathBuf>,
    declared: Option<DeclaredArg>,
    pretty: bool,
) -> Result<i32> {
    let submission = submission_from(code_source, declared)?;
    let context = DataContext { path: data, schema: None };
    let outcome = run_pipeline(submission, context, config)?;
    let payload = if pretty {
        serde_json::to_string_pretty(&outcome)
    } else {
        serde_json::to_string(&outcome)
    }
    .context("serialize outcome")?;
    println!("{payload}");
    Ok(if outcome.is_success() {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn cmd_check(
    config: &PipelineConfig,
    code_source: &str,
    declared: Option<DeclaredArg>,
) -> Result<i32> {
    let submission = submission_from(code_source, declared)?;
    let structure = StructuralValidator::new(&config.data_handle, config.require_data_handle)?;
    let safety = SafetyGate::new(&config.disallowed_patterns);

    let mut rejected = false;
    for verdict in [safety.review(&submission.text), structure.review(&submission)] {
        if let ReviewState::NeedsRevision(reason) = verdict {
            println!("{reason}");
            rejected = true;
        }
    }
    if rejected {
        return Ok(exit_codes::REJECTED);
    }
    println!("approved");
    Ok(exit_codes::OK)
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &PipelineConfig::default())?;
    Ok(exit_codes::OK)
}

fn submission_from(source: &str, declared: Option<DeclaredArg>) -> Result<CodeSubmission> {
    let text = read_code(source)?;
    let submission = CodeSubmission::new(text);
    Ok(match declared {
        Some(declared) => submission.with_declared_output(declared.into()),
        None => submission,
    })
}

fn read_code(source: &str) -> Result<String> {
    if source == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("read code from stdin")?;
        return Ok(text);
    }
    fs::read_to_string(source).with_context(|| format!("read code {source}"))
}

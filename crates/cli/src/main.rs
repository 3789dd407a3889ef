//! Code flow command-line tool.
//!
//! Provides subcommands for flowing code between the VMR and a component
//! repository, inspecting the last flows of a mapping, and generating /
//! validating configuration files.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use codeflow_core::build_info::{BuildMetadataProvider, JsonFileBuildProvider};
use codeflow_core::lock::{InMemoryCache, InProcessLock};
use codeflow_core::models::FlowDirection;
use codeflow_core::{CodeflowConfig, CodeflowEngine, CodeflowResult, FlowRequest};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Code flow command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "codeflow",
    version,
    about = "Flow code between a virtual monorepo and its component repositories"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "./codeflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Flow a build of a component repository into the VMR.
    Forward(FlowArgs),

    /// Flow a build of the VMR back into a component repository.
    Backflow(FlowArgs),

    /// Show the last flows of a mapping.
    LastFlows {
        /// Mapping name.
        #[arg(short, long)]
        mapping: String,

        /// Local clone of the component repository.
        #[arg(short, long)]
        repo: PathBuf,

        /// Direction of the flow the result is computed for.
        #[arg(short, long, value_enum, default_value = "forward")]
        direction: Direction,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./codeflow.toml")]
        output: PathBuf,

        /// Working tree of the VMR.
        #[arg(long, default_value = "./vmr")]
        vmr: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

#[derive(Args, Debug)]
struct FlowArgs {
    /// Mapping name.
    #[arg(short, long)]
    mapping: String,

    /// Id of the build being flowed.
    #[arg(short, long)]
    build: u64,

    /// JSON file listing known builds.
    #[arg(long, default_value = "./builds.json")]
    builds: PathBuf,

    /// Branch the flow targets.
    #[arg(short, long, default_value = "main")]
    target_branch: String,

    /// Branch the flow is made on. Created from the target branch if missing.
    #[arg(long)]
    head_branch: String,

    /// Local clone of the component repository. Cloned from the mapping's
    /// default remote when omitted.
    #[arg(short, long)]
    repo: Option<PathBuf>,

    /// Assets whose dependencies are not updated.
    #[arg(long = "exclude-asset")]
    excluded_assets: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Direction {
    Forward,
    Backflow,
}

impl From<Direction> for FlowDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Forward => FlowDirection::Forward,
            Direction::Backflow => FlowDirection::Backflow,
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output, vmr } => {
            init_tracing("warn");
            cmd_init(&output, &vmr)
        }
        Commands::Validate => {
            init_tracing("warn");
            cmd_validate(&cli.config)
        }
        command => {
            let config = load_config(&cli.config)?;
            init_tracing(&config.logging.level);

            match command {
                Commands::Forward(args) => cmd_flow(config, args, FlowDirection::Forward).await,
                Commands::Backflow(args) => cmd_flow(config, args, FlowDirection::Backflow).await,
                Commands::LastFlows {
                    mapping,
                    repo,
                    direction,
                } => cmd_last_flows(config, &mapping, &repo, direction.into()).await,
                Commands::Init { .. } | Commands::Validate => Ok(()),
            }
        }
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<CodeflowConfig> {
    let config = CodeflowConfig::load_from_file(path).context("failed to load configuration file")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Cancel the token on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling the flow");
            token.cancel();
        }
    });
    cancel
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_flow(config: CodeflowConfig, args: FlowArgs, direction: FlowDirection) -> Result<()> {
    let provider = JsonFileBuildProvider::new(&args.builds);
    let build = provider
        .get_build(args.build)
        .await
        .with_context(|| format!("failed to read builds from {}", args.builds.display()))?
        .with_context(|| format!("build {} not found in {}", args.build, args.builds.display()))?;

    let engine = CodeflowEngine::new(config)
        .with_lock(Arc::new(InProcessLock::new()))
        .with_cache(Arc::new(InMemoryCache::new()));
    let request = FlowRequest {
        mapping: args.mapping,
        build,
        target_branch: args.target_branch,
        head_branch: args.head_branch,
        excluded_assets: args.excluded_assets,
        repo_path: args.repo,
    };

    let cancel = cancel_on_interrupt();
    info!(mapping = %request.mapping, build = request.build.id, %direction, "starting flow");
    let result = match direction {
        FlowDirection::Forward => engine.flow_forward(&request, &cancel).await,
        FlowDirection::Backflow => engine.flow_back(&request, &cancel).await,
    }
    .with_context(|| format!("{direction} flow of {} failed", request.mapping))?;

    print_result(&result)?;
    if !result.conflicted_files.is_empty() {
        anyhow::bail!(
            "merging {} into {} left {} conflicted file(s)",
            request.target_branch,
            result.head_branch,
            result.conflicted_files.len()
        );
    }
    Ok(())
}

fn print_result(result: &CodeflowResult) -> Result<()> {
    println!("Flow {}", result.flow_id);
    println!("  Head branch     : {}", result.head_branch);
    println!("  Had updates     : {}", if result.had_updates { "yes" } else { "no" });
    println!(
        "  Recreated flows : {}",
        if result.recreated_previous_flows { "yes" } else { "no" }
    );

    if !result.dependency_updates.is_empty() {
        println!();
        println!("Dependency updates:");
        for update in &result.dependency_updates {
            println!("  - {}", update.describe());
        }
    }
    if !result.conflicted_files.is_empty() {
        println!();
        println!("Conflicted files:");
        for file in &result.conflicted_files {
            println!("  - {file}");
        }
    }
    for comment in &result.comments {
        println!();
        println!("[{:?}] {}", comment.kind, comment.text);
    }

    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(result).context("failed to serialize the result")?
    );
    Ok(())
}

async fn cmd_last_flows(config: CodeflowConfig, mapping: &str, repo: &Path, direction: FlowDirection) -> Result<()> {
    let engine = CodeflowEngine::new(config);
    let flows = engine
        .inspect_last_flows(mapping, repo, direction)
        .await
        .with_context(|| format!("failed to resolve the last flows of {mapping}"))?;

    println!("Last flows of {mapping}");
    println!("  Last flow         : {}", flows.last_flow);
    println!("  Last forward flow : {}", flows.last_forward_flow);
    println!(
        "  Last backflow     : {}",
        flows
            .last_backflow
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "none".to_string())
    );
    Ok(())
}

fn default_config(vmr: &Path) -> String {
    format!(
        r#"# Code flow configuration

[vmr]
path = "{}"
uri = "https://github.com/dotnet/dotnet"
tmp_path = "/tmp/codeflow"
sources_dir = "src"
source_manifest = "src/source-manifest.json"
source_mappings = "src/source-mappings.json"
git_info_dir = "prereqs/git-info"

[patches]
max_patch_size = 1000000000
keep_attribute = "vmr-preserve"
ignore_attribute = "vmr-ignore"

[codeflow]
eng_common_mapping = "arcade"
arcade_sdk_package = "Microsoft.DotNet.Arcade.Sdk"
max_recreation_depth = 1
cache_ttl_secs = 3600
lock_ttl_secs = 3600
committer_name = "codeflow-bot"
committer_email = "codeflow-bot@users.noreply.github.com"

[logging]
level = "info"
"#,
        vmr.display()
    )
}

fn cmd_init(output: &Path, vmr: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config(vmr)).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Point [vmr] path at a clone of the VMR");
    println!("  2. Validate with: codeflow validate --config {}", output.display());
    println!(
        "  3. Flow a build: codeflow forward --config {} --mapping <name> --build <id> --head-branch <branch>",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config = CodeflowConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    match config.validate() {
        Ok(()) => {
            println!("  [OK] All required fields are valid");
        }
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    let vmr = &config.vmr.path;
    if vmr.join(".git").exists() {
        println!("  [OK] VMR found at {}", vmr.display());
    } else {
        println!("  [WARN] No git repository at {}", vmr.display());
    }

    println!();
    println!("Configuration summary:");
    println!("  VMR path        : {}", vmr.display());
    println!("  VMR URI         : {}", config.vmr.uri);
    println!("  Scratch dir     : {}", config.vmr.tmp_path.display());
    println!("  Source manifest : {}", config.vmr.source_manifest);
    println!("  Source mappings : {}", config.vmr.source_mappings);
    println!(
        "  Git info dir    : {}",
        if config.vmr.git_info_dir.is_empty() {
            "disabled"
        } else {
            config.vmr.git_info_dir.as_str()
        }
    );
    println!("  Max patch size  : {} bytes", config.patches.max_patch_size);
    println!("  Recreation depth: {}", config.codeflow.max_recreation_depth);
    println!("  Git processes   : {}", config.codeflow.max_git_processes);
    println!();
    println!("Configuration is valid.");

    Ok(())
}

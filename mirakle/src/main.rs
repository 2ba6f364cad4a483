//! Mirakle - run your build on a remote machine.
//!
//! `mirakle [run] [--] <build args>` uploads the project, runs the build
//! entrypoint on the configured host and downloads the results. `plan` shows
//! the tasks that would run and `config` shows the effective configuration.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mirakle_common::config::ResolvedConfig;
use mirakle_common::orchestrator::BuildPlan;
use mirakle_common::{
    ConfigLoader, LogConfig, MirakleError, Orchestrator, RunMode, SystemRunner, init_logging,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "mirakle")]
#[command(author, version, about = "Mirakle - run your build on a remote machine")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Project config file to use instead of <project>/mirakle.toml
    #[arg(long, global = true, env = "MIRAKLE_CONFIG")]
    config: Option<PathBuf>,

    /// Project root (defaults to the current directory)
    #[arg(short = 'C', long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,

    /// Build arguments, as for `run`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the build on the remote machine
    Run {
        /// Build arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Show the tasks a build would run, without running them
    Plan {
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,

        /// Build arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Show the effective configuration
    Config {
        /// Print the configuration as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (log_config, env_errors) = LogConfig::from_env();
    init_logging(&log_config.verbose(cli.verbose));
    for err in env_errors {
        warn!("{}", err);
    }

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => report(&err),
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let project_root = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to determine the current directory")?,
    };
    let project_root = project_root
        .canonicalize()
        .with_context(|| format!("Project directory {} not found", project_root.display()))?;
    debug!(root = %project_root.display(), "Resolved project root");

    let loader = ConfigLoader::new(project_root).with_explicit_config(cli.config.clone());

    match cli.command {
        Some(Commands::Config { json }) => {
            let resolved = loader.resolve()?;
            print_config(&resolved, json)?;
            Ok(0)
        }
        Some(Commands::Plan { json, args }) => {
            let orchestrator = Orchestrator::new(Arc::new(SystemRunner), loader);
            let plan = orchestrator.plan(&args)?;
            print_plan(&plan, json)?;
            Ok(0)
        }
        Some(Commands::Run { args }) => execute(loader, &args).await,
        None => execute(loader, &cli.args).await,
    }
}

async fn execute(loader: ConfigLoader, args: &[String]) -> Result<i32> {
    let orchestrator = Orchestrator::new(Arc::new(SystemRunner), loader);
    let summary = orchestrator.run(args).await?;
    if let RunMode::Remote { source } = &summary.mode {
        debug!(source = %source, exit_code = summary.exit_code, "Remote build finished");
    }
    Ok(summary.exit_code)
}

fn report(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<MirakleError>() {
        Some(mirakle) => {
            error!("{}", mirakle);
            if let Some(hint) = mirakle.hint() {
                info!("Hint: {}", hint);
            }
            mirakle.exit_code()
        }
        None => {
            error!("{:#}", err);
            1
        }
    }
}

fn print_plan(plan: &BuildPlan, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(plan)?);
        return Ok(());
    }
    match &plan.mode {
        RunMode::Local { reason } => {
            println!("Not offloaded ({reason}), building locally:");
            if let Some(local) = &plan.local {
                println!("  {local}");
            }
        }
        RunMode::Remote { source } => {
            if let Some(host) = &plan.host {
                println!("Host: {host}");
            }
            println!("Config: {source}");
            for (index, node) in plan.nodes.iter().enumerate() {
                let mut flags = Vec::new();
                if node.gated {
                    flags.push("conditional");
                }
                if node.ignore_exit_value {
                    flags.push("exit value checked later");
                }
                if node.background {
                    flags.push("background");
                }
                if flags.is_empty() {
                    println!("{}. {}", index + 1, node.name);
                } else {
                    println!("{}. {} ({})", index + 1, node.name, flags.join(", "));
                }
                if let Some(command) = &node.command {
                    println!("   {command}");
                }
            }
        }
    }
    Ok(())
}

fn print_config(resolved: &ResolvedConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(resolved)?);
        return Ok(());
    }
    let config = &resolved.config;
    println!("Source:            {}", resolved.source);
    println!("Host:              {}", config.host);
    println!("Remote folder:     {}", config.remote_folder);
    println!("Entrypoint:        {}", config.entrypoint);
    println!("SSH args:          {}", config.ssh_args.join(" "));
    println!("Upload args:       {}", config.rsync_to_remote_args().join(" "));
    println!("Download args:     {}", config.rsync_from_remote_args().join(" "));
    println!("Fallback:          {}", config.fallback);
    println!("Parallel download: {}", config.download_in_parallel);
    println!("Download interval: {} ms", config.download_interval);
    match config.execute_timeout {
        Some(timeout) => println!("Execute timeout:   {timeout:?}"),
        None => println!("Execute timeout:   none"),
    }
    Ok(())
}

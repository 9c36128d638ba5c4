//! # Tasker Configuration Validator
//!
//! Command-line tool for validating engine configuration and task templates
//! before starting a coordinator. Exits non-zero on invalid configuration,
//! unreadable templates, dependency cycles or over-deep graphs.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tasker_engine::config::{ConfigManager, TaskerConfig};
use tasker_engine::models::TaskTemplate;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate Tasker engine configuration and task templates")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate (development, test, production, ...)
    #[arg(short, long, default_value = "development", env = "TASKER_ENV")]
    environment: String,

    /// Configuration directory path (default: config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration and every template in <config-dir>/task_templates
    All,

    /// Validate only the layered configuration
    Config,

    /// Validate task template files and print their dependency topology
    Templates {
        /// Template files; defaults to <config-dir>/task_templates/*.yaml
        paths: Vec<PathBuf>,
    },

    /// List environments with an override file in the configuration directory
    Environments,
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::All) | None => validate_all(&cli),
        Some(Commands::Config) => validate_config(&cli).map(|_| ()),
        Some(Commands::Templates { paths }) => validate_config(&cli)
            .and_then(|config| validate_templates(&cli, &config, paths)),
        Some(Commands::Environments) => list_environments(&cli),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {e:#}");
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn config_dir(cli: &Cli) -> PathBuf {
    cli.config_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("config"))
}

fn validate_all(cli: &Cli) -> Result<()> {
    let config = validate_config(cli)?;
    validate_templates(cli, &config, &[])?;
    println!("\n🎉 All configuration validation checks passed!");
    Ok(())
}

fn validate_config(cli: &Cli) -> Result<TaskerConfig> {
    println!("🔧 Validating Tasker Configuration");
    println!("Environment: {}", cli.environment);
    println!("Config Directory: {}", config_dir(cli).display());

    let manager =
        ConfigManager::load_from_directory_with_env(Some(config_dir(cli)), &cli.environment)
            .context("failed to load configuration")?;
    let config = manager.config().clone();

    println!("✅ Configuration loaded and validated");
    println!(
        "   execution: max_concurrent_steps={}, step_timeout={}ms, default_retry_limit={}",
        config.execution.max_concurrent_steps,
        config.execution.step_execution_timeout_ms,
        config.execution.default_retry_limit
    );
    println!(
        "   backoff: base={}ms, max={}ms, multiplier={}, jitter={}",
        config.backoff.base_delay_ms,
        config.backoff.max_delay_ms,
        config.backoff.multiplier,
        config.backoff.jitter_enabled
    );
    println!(
        "   orchestration: poll={}ms, max_poll={}ms, stale_claim={}s",
        config.orchestration.poll_interval_ms,
        config.orchestration.max_poll_interval_ms,
        config.orchestration.stale_claim_timeout_seconds
    );
    println!(
        "   engine: identity_strategy={}, max_dependency_depth={}",
        config.engine.identity_strategy, config.dependency_graph.max_depth
    );

    Ok(config)
}

fn validate_templates(cli: &Cli, config: &TaskerConfig, paths: &[PathBuf]) -> Result<()> {
    let paths = if paths.is_empty() {
        default_template_paths(&config_dir(cli).join("task_templates"))?
    } else {
        paths.to_vec()
    };

    if paths.is_empty() {
        println!("\nℹ️  No task templates to validate");
        return Ok(());
    }

    let mut failures = 0;
    for path in &paths {
        match validate_template(path, &cli.environment, config.dependency_graph.max_depth) {
            Ok(()) => {}
            Err(e) => {
                failures += 1;
                println!("   ❌ {e:#}");
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {} task templates are invalid", paths.len());
    }
    Ok(())
}

fn validate_template(path: &Path, environment: &str, max_depth: usize) -> Result<()> {
    println!("\n📄 {}", path.display());
    let template = TaskTemplate::from_yaml_file(path)
        .with_context(|| format!("{} could not be parsed", path.display()))?
        .resolve_for_environment(environment);
    let analysis = template
        .validate(max_depth)
        .with_context(|| format!("{} is invalid", template.qualified_name()))?;

    println!(
        "   ✅ {} ({} steps, {} levels)",
        template.qualified_name(),
        template.steps.len(),
        analysis.max_depth
    );
    println!("   topology: {}", analysis.topological_order.join(" -> "));
    for (level, steps) in analysis.steps_by_level().iter().enumerate() {
        println!("   level {level}: {}", steps.join(", "));
    }
    println!("   roots: {}", analysis.roots.join(", "));
    println!("   leaves: {}", analysis.leaves.join(", "));
    Ok(())
}

fn default_template_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml")
        })
        .collect();
    paths.sort();
    Ok(paths)
}

fn list_environments(cli: &Cli) -> Result<()> {
    println!("📋 Available Environments:");

    let dir = config_dir(cli);
    let mut environments: Vec<String> = std::fs::read_dir(&dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("tasker-config-"))
                .and_then(|name| name.strip_suffix(".yaml"))
                .map(String::from)
        })
        .collect();
    environments.sort();

    for env in environments {
        println!("  • {env}");
    }
    Ok(())
}

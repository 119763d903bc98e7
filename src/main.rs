//! tplkit entry point
//!
//! Parses a template descriptor, composes it (`extends` and `includes`),
//! resolves its dependencies and prints the result as JSON on stdout.
//! Logs go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use tplkit::compose::{ComposedTemplate, CompositionContext, CompositionEngine};
use tplkit::config::Config;
use tplkit::core::TemplateError;
use tplkit::core::error::user_friendly_error;
use tplkit::descriptor::{DescriptorParser, ValidationIssue};
use tplkit::resolver::{DependencyGraph, DependencyResolver, ResolveOptions};
use tplkit::source::SourceManager;
use tplkit::source::fetch::{cleanup_materialized, materialized_root};

#[derive(Parser)]
#[command(
    name = "tplkit",
    about = "Resolve and compose a template descriptor",
    version,
    long_about = "Loads a template.yaml, applies extends and includes, resolves its dependencies and prints a JSON report."
)]
struct Cli {
    /// Descriptor file, or a directory containing template.yaml
    descriptor: PathBuf,

    /// Variable value visible to include conditions (`key=value`, value parsed as JSON when possible)
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
    vars: Vec<(String, Value)>,

    /// Leave out dev dependencies
    #[arg(long)]
    skip_dev: bool,

    /// Resolve optional dependencies
    #[arg(long)]
    include_optional: bool,

    /// Skip dependency resolution
    #[arg(long)]
    no_deps: bool,

    /// Path to a tplkit configuration file (default: ~/.tplkit/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw.split_once('=').ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    template: ComposedTemplate,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    validation_warnings: Vec<ValidationIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dependencies: Option<DependencyGraph>,
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load_with_optional(cli.config.clone()).await?;
    let manager = SourceManager::from_config(&config)?;
    if let Err(e) = cleanup_materialized(&materialized_root(), config.cache.ttl()).await {
        tracing::debug!("Skipping materialized template cleanup: {e:#}");
    }

    let location = tplkit::descriptor::locate_descriptor(&cli.descriptor)
        .unwrap_or_else(|| cli.descriptor.clone());
    let location = std::path::absolute(&location)
        .with_context(|| format!("Failed to resolve {}", location.display()))?;
    let parsed = DescriptorParser::new().parse_file(&location).await?;
    if !parsed.is_valid {
        return Err(TemplateError::InvalidDescriptor {
            name: if parsed.descriptor.name.is_empty() {
                location.display().to_string()
            } else {
                parsed.descriptor.name.clone()
            },
            errors: parsed.error_messages(),
        }
        .into());
    }

    let project_root = location.parent().map_or_else(|| location.clone(), PathBuf::from);
    let ctx = CompositionContext::from_config(&project_root, &config.composition)
        .with_variables(cli.vars.into_iter().collect::<Map<_, _>>());
    let engine = CompositionEngine::new(manager.clone());
    let composed = engine.compose_at(&parsed.descriptor, &location, &ctx).await?;
    for warning in &composed.warnings {
        tracing::warn!("{warning}");
    }

    let dependencies = if cli.no_deps {
        None
    } else {
        let options = ResolveOptions {
            skip_dev: cli.skip_dev,
            include_optional: cli.include_optional,
            install_dir: config.registry.install_dir.clone(),
            ..ResolveOptions::new(&project_root)
        };
        let graph =
            DependencyResolver::new(manager).resolve(&composed.descriptor.dependencies, &options).await;
        if graph.all_required_failed() {
            tracing::warn!("None of the required dependencies could be resolved");
        }
        Some(graph)
    };

    let report = Report {
        template: composed,
        validation_warnings: parsed.warnings,
        dependencies,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    let filter = if cli.verbose {
        EnvFilter::new("tplkit=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tplkit=warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match run(cli).await {
        Ok(()) => Ok(()),
        Err(e) => {
            user_friendly_error(e).display();
            std::process::exit(1);
        }
    }
}

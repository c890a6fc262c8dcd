//! Command-line front end for the herald dispatch engine
//!
//! - `herald send`: render a template and send it to one or more recipients
//! - `herald preload`: build and cache transports for the given domains

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use herald::{Herald, HeraldConfig, find_config_file};
use herald_common::DomainKey;
use herald_dispatch::{DispatchEngine, SendRequest, Variables};

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

/// Send vendor payment notifications
#[derive(Parser, Debug)]
#[command(name = "herald")]
#[command(about = "Rate-limited, retrying notification dispatch", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (overrides HERALD_CONFIG and the default locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a template to one or more recipients
    Send {
        #[arg(long)]
        subject: String,

        /// Template name, resolved in the configured template directory
        #[arg(long)]
        template: String,

        /// Template variable, may be repeated
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_variable)]
        variables: Vec<(String, String)>,

        /// Recipients per batch for bulk sends (defaults to the configured size)
        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(required = true)]
        recipients: Vec<String>,
    },
    /// Build transports for domains ahead of time and print cache statistics
    Preload {
        #[arg(required = true)]
        domains: Vec<String>,
    },
}

fn parse_variable(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = find_config_file(cli.config.as_deref())?;
    let config = HeraldConfig::load(&config_path)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.dispatch.pool.core_threads())
        .enable_all()
        .build()?;

    let herald = Herald::new(config);
    runtime.block_on(herald.run(move |engine| async move {
        match cli.command {
            Commands::Send {
                subject,
                template,
                variables,
                batch_size,
                recipients,
            } => {
                let variables: Variables = variables.into_iter().collect();
                send(&engine, &subject, &template, &variables, batch_size, &recipients).await
            }
            Commands::Preload { domains } => preload(&engine, &domains).await,
        }
    }))
}

async fn send(
    engine: &DispatchEngine,
    subject: &str,
    template: &str,
    variables: &Variables,
    batch_size: Option<usize>,
    recipients: &[String],
) -> anyhow::Result<()> {
    if let [recipient] = recipients {
        let request = SendRequest::new(recipient.as_str(), subject, template)
            .with_variables(variables.clone());
        let result = engine.send(request).await;

        println!("{}", result.message);
        if !result.success {
            anyhow::bail!("Send to {} failed", result.recipient);
        }
        return Ok(());
    }

    let batch_size = batch_size.unwrap_or(engine.config().batch.batch_size);
    let report = engine
        .batches()
        .send_bulk_in_batches(recipients, subject, template, variables, batch_size)?
        .await;

    println!(
        "{} submitted in {} batch(es): {} sent, {} failed",
        report.submitted, report.batches, report.succeeded, report.failed
    );
    for failure in &report.failures {
        println!("  {:<40} {}", failure.recipient, failure.message);
    }

    if !report.all_succeeded() {
        anyhow::bail!("{} of {} sends failed", report.failed, report.submitted);
    }

    Ok(())
}

async fn preload(engine: &DispatchEngine, domains: &[String]) -> anyhow::Result<()> {
    let report = engine
        .cache()
        .preload(domains.iter().map(|domain| DomainKey::new(domain)))
        .await;

    println!("Loaded {} of {} domain(s)", report.loaded, domains.len());
    for (domain, reason) in &report.failed {
        println!("  {domain:<40} {reason}");
    }

    let stats = engine.cache().stats();
    println!(
        "Cache: {} entries, {} hits, {} misses, {} evictions, average load {:?}",
        stats.size,
        stats.hits,
        stats.misses,
        stats.evictions,
        stats.average_load_penalty()
    );

    Ok(())
}

//! `gcastd`: command-line driver for gcast process groups.
//!
//! # Usage
//!
//! ```text
//! gcastd config                              # print the effective configuration
//! gcastd config -c gcast.toml                # same, from a config file
//! gcastd simulate -n 5 -m 100                # five members, 100 multicasts
//! gcastd simulate -n 4 -m 20 --partition     # split, heal and merge
//! ```

mod config;
mod simulate;
mod telemetry;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use config::CliConfig;
use simulate::SimulationOptions;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "gcastd", version, about = "Virtually synchronous group communication")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective group configuration.
    Config,

    /// Run an in-memory group and report what every member delivered.
    Simulate {
        /// Number of group members.
        #[arg(short = 'n', long, default_value = "3")]
        members: u16,

        /// Number of messages, multicast round-robin by the members.
        #[arg(short, long, default_value = "100")]
        messages: usize,

        /// Split the group in two after the first round, then merge it.
        #[arg(short, long)]
        partition: bool,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    telemetry::init(&config.log.level);

    match cli.command {
        Commands::Config => cmd_config(&config),
        Commands::Simulate {
            members,
            messages,
            partition,
        } => {
            let options = SimulationOptions {
                members,
                messages,
                partition,
            };
            cmd_simulate(&config, &options).await
        }
    }
}

// -----------------------------------------------------------------------
// gcastd config
// -----------------------------------------------------------------------

fn cmd_config(config: &CliConfig) -> Result<()> {
    let group = config.group_config()?;

    println!("Group configuration");
    println!("  flush_timeout:       {:?}", group.flush_timeout);
    println!("  stability_interval:  {:?}", group.stability_interval);
    println!("  retransmit_backoff:  {:?}", group.retransmit_backoff);
    println!("  merge_timeout:       {:?}", group.merge_timeout);
    println!("  view_ack_timeout:    {:?}", group.view_ack_timeout);
    println!("  send_policy:         {:?}", group.send_policy);
    println!("  inbound_capacity:    {}", group.inbound_capacity);
    println!("  departed_retention:  {:?}", group.departed_retention);
    println!("  state_timeout:       {:?}", group.state_timeout);
    println!("  log level:           {}", config.log.level);

    Ok(())
}

// -----------------------------------------------------------------------
// gcastd simulate
// -----------------------------------------------------------------------

async fn cmd_simulate(config: &CliConfig, options: &SimulationOptions) -> Result<()> {
    let group = config.group_config()?;
    info!(
        members = options.members,
        messages = options.messages,
        partition = options.partition,
        "starting simulation"
    );

    let start = Instant::now();
    let report = simulate::run(group, options).await?;
    let elapsed = start.elapsed();

    println!("gcast simulation");
    println!("  members:    {}", options.members);
    println!("  messages:   {}", options.messages);
    println!("  partition:  {}", if report.merged { "healed by merge" } else { "no" });
    println!("  dropped:    {} frames", report.dropped);
    println!("  elapsed:    {:.2}s", elapsed.as_secs_f64());
    println!();
    println!("  {:<22} {:>10} {:>8} {:>8}  view", "member", "delivered", "blocks", "views");
    for m in &report.members {
        println!(
            "  {:<22} {:>10} {:>8} {:>8}  {}",
            m.member.to_string(),
            m.delivered,
            m.blocks,
            m.view_changes,
            m.view
        );
    }
    println!();

    if report.converged() {
        println!("All members delivered {} messages in the same view.", report.expected);
        Ok(())
    } else {
        anyhow::bail!("members did not converge on {} deliveries", report.expected)
    }
}

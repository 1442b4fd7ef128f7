//! Operator command-line tool for the focal plane controller
//!
//! Thin wrapper over the library: loads the layered configuration, builds
//! the coordinator, runs one operation, and prints the result. The TCP
//! operator surface lives elsewhere; this tool is for bring-up and
//! debugging.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fps_comms_controller::shared::trajectory::Trajectory;
use fps_comms_controller::shared::types::PositionerId;
use fps_comms_controller::{Fps, FpsConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fpsctl", about = "Focal plane controller operations", version)]
struct Cli {
    /// Explicit configuration file, layered on top of the defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Discover the fleet and print what answered
    Discover,
    /// Print one positioner's snapshot, or the whole fleet
    Status {
        /// Positioner id; omit for the whole fleet
        id: Option<u16>,
    },
    /// Move one positioner to an absolute position
    Goto {
        /// Positioner id
        id: u16,
        /// Target alpha, degrees
        alpha: f64,
        /// Target beta, degrees
        beta: f64,
    },
    /// Execute a trajectory from a JSON file
    Trajectory {
        /// Path to the trajectory file
        file: PathBuf,
    },
    /// Clear the fleet lock after a collision has been resolved
    Unlock,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = FpsConfig::load_from(cli.config.as_deref()).context("loading configuration")?;
    let fps = Fps::from_config(config).context("building the coordinator")?;

    match cli.command {
        Command::Discover => {
            let count = fps.initialize().await?;
            println!("{count} positioners answered");
            for (id, positioner) in fps.positioners() {
                let firmware = positioner
                    .firmware
                    .map_or_else(|| "unknown".to_string(), |v| v.to_string());
                println!("  {id}: firmware {firmware}, bus {:?}", positioner.bus);
            }
        }
        Command::Status { id } => {
            fps.initialize().await?;
            let table = fps.positioners();
            let selected: Vec<_> = match id {
                Some(id) => table
                    .get(&PositionerId::new(id))
                    .cloned()
                    .into_iter()
                    .collect(),
                None => table.into_values().collect(),
            };
            for positioner in selected {
                println!(
                    "{}: alpha={:?} beta={:?} status={:08X?} flags={:?}",
                    positioner.id,
                    positioner.alpha,
                    positioner.beta,
                    positioner.status_raw,
                    positioner.flags,
                );
            }
        }
        Command::Goto { id, alpha, beta } => {
            fps.initialize().await?;
            fps.goto(PositionerId::new(id), alpha, beta, None)
                .await
                .context("goto failed")?;
            println!("positioner {id} at ({alpha:.3}, {beta:.3})");
        }
        Command::Trajectory { file } => {
            fps.initialize().await?;
            let trajectory =
                Trajectory::from_file(&file).context("parsing the trajectory file")?;
            fps.send_trajectory(&trajectory)
                .await
                .context("trajectory failed")?;
            println!("trajectory complete: {} positioners", trajectory.len());
        }
        Command::Unlock => {
            fps.unlock();
            println!("fleet unlocked");
        }
    }

    fps.shutdown().await;
    Ok(())
}

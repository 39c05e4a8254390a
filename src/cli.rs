use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;

use crate::domain::Proposal;

#[derive(Parser, Debug)]
#[command(name = "maya")]
#[command(version)]
#[command(about = "Agent orchestration and treasury reconciliation engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file; defaults to config/default.toml plus the MAYA_ENV overlay
    #[arg(short, long, global = true, env = "MAYA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Use the simulated chain and simulated workers
    #[arg(long, global = true)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control loop until SIGINT/SIGTERM
    Run,
    /// Run a single tick and print the engine snapshot
    Tick,
    /// Read the treasury balance once
    Treasury,
    /// List proposals
    Proposals {
        /// Only pending proposals
        #[arg(long)]
        pending: bool,
    },
    /// Submit a new funding proposal
    Submit {
        /// Unique proposal id
        id: String,
        /// Agent the proposal funds
        #[arg(long)]
        agent_id: String,
        /// What the funds are for
        #[arg(long)]
        purpose: String,
        /// Requested amount in the chain's native unit
        #[arg(long, default_value = "0")]
        cost: Decimal,
        #[arg(long, default_value = "0")]
        expected_revenue: Decimal,
    },
    /// Queue a pending proposal for funding
    Approve { id: String },
    /// Reject a pending or approved proposal
    Reject { id: String },
}

impl Commands {
    /// Proposal described by a `submit` command
    pub fn proposal(&self) -> Option<Proposal> {
        match self {
            Commands::Submit {
                id,
                agent_id,
                purpose,
                cost,
                expected_revenue,
            } => Some(Proposal::new(
                id.clone(),
                agent_id.clone(),
                purpose.clone(),
                *cost,
                *expected_revenue,
            )),
            _ => None,
        }
    }
}

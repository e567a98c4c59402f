//! stagewatch-ctl: operator CLI for the Stagewatch daemon.
//!
//! ## Subcommands
//!
//! - `baseline`, `arm`, `disarm`, `reset`, `ping`: session commands
//! - `health`, `config`, `events`, `observations`: read-only queries
//!
//! Every subcommand prints the daemon's reply as pretty JSON and exits
//! non-zero when the daemon answers with an error.

mod client;
mod logging;

use clap::{Parser, Subcommand};
use stagewatch_daemon_protocol::{
    Command, Inbound, Query, DEFAULT_EVENTS_LIMIT, DEFAULT_OBSERVATIONS_LIMIT,
};

#[derive(Parser)]
#[command(name = "stagewatch-ctl")]
#[command(about = "Control and inspect a running stagewatch daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture the last observed count as the baseline
    Baseline,

    /// Start watching for discrepancies
    Arm,

    /// Stop watching, keep the baseline
    Disarm,

    /// Clear the baseline and return to idle
    Reset,

    /// Check that the daemon is answering
    Ping,

    /// Show session state and agent readiness
    Health,

    /// Show the daemon's effective configuration
    Config,

    /// Show recent events, newest first
    Events {
        #[arg(long, default_value_t = DEFAULT_EVENTS_LIMIT)]
        limit: usize,
    },

    /// Show recent sampled observations, newest first
    Observations {
        #[arg(long, default_value_t = DEFAULT_OBSERVATIONS_LIMIT)]
        limit: usize,
    },
}

impl Commands {
    fn to_inbound(&self) -> Inbound {
        match self {
            Commands::Baseline => Inbound::Command(Command::SetBaseline),
            Commands::Arm => Inbound::Command(Command::Arm),
            Commands::Disarm => Inbound::Command(Command::Disarm),
            Commands::Reset => Inbound::Command(Command::Reset),
            Commands::Ping => Inbound::Command(Command::Ping),
            Commands::Health => Inbound::Query(Query::Health),
            Commands::Config => Inbound::Query(Query::Config),
            Commands::Events { limit } => Inbound::Query(Query::Events { limit: *limit }),
            Commands::Observations { limit } => {
                Inbound::Query(Query::Observations { limit: *limit })
            }
        }
    }
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();
    let message = cli.command.to_inbound();

    let reply = match client::request(&message) {
        Ok(reply) => reply,
        Err(err) => {
            tracing::error!(error = %err, "stagewatch-ctl request failed");
            eprintln!("stagewatch-ctl: {}", err);
            std::process::exit(2);
        }
    };

    match serde_json::to_string_pretty(&reply) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", reply),
    }

    if client::message_type(&reply) == "error" {
        tracing::warn!(reply = %reply, "Daemon returned an error");
        std::process::exit(1);
    }
}

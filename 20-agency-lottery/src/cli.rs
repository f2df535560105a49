use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::{
    bet::AgencyId, client::ClientConfig, server::ServerConfig, storage::DEFAULT_WINNING_NUMBER,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Default log filter, used when `RUST_LOG` is not set.
    #[arg(long, global = true, env = "LOGGING_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the lottery server, accepting agency connections over TCP.
    Server(ServerArgs),
    /// Submit an agency's bets and wait for its winners.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Interface to bind.
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, env = "SERVER_PORT", default_value_t = 12345)]
    pub port: u16,

    /// Pending connections the kernel may queue.
    #[arg(long, env = "SERVER_LISTEN_BACKLOG", default_value_t = 5)]
    pub backlog: u32,

    /// Sessions served at once; further connections are refused.
    #[arg(
        long,
        env = "SERVER_MAX_WORKERS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_workers: u32,

    /// Number of agencies that must be ready before the draw.
    #[arg(
        long,
        env = "NUMBER_OF_AGENCIES",
        default_value_t = 5,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub agencies: u32,

    /// CSV file where accepted bets are appended.
    #[arg(long, env = "STORAGE_FILEPATH", default_value = "./bets.csv")]
    pub bets_file: PathBuf,

    /// Bet number that wins the draw.
    #[arg(long, env = "LOTTERY_WINNER_NUMBER", default_value_t = DEFAULT_WINNING_NUMBER)]
    pub winning_number: u32,

    /// Seconds to wait for in-flight sessions on shutdown.
    #[arg(long, default_value_t = 30)]
    pub shutdown_timeout_secs: u64,
}

impl ServerArgs {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen: SocketAddr::new(self.host, self.port),
            backlog: self.backlog,
            max_workers: self.max_workers as usize,
            agencies: self.agencies as usize,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Agency id, starting at 1.
    #[arg(long, env = "CLI_ID", value_parser = clap::value_parser!(u32).range(1..))]
    pub agency: u32,

    /// Address of the lottery server.
    #[arg(long, env = "CLI_SERVER_ADDRESS", default_value = "127.0.0.1:12345")]
    pub server: String,

    /// CSV file with rows `first_name,last_name,document,birthdate,number`.
    #[arg(long)]
    pub bets: PathBuf,

    /// Most bets sent in one batch.
    #[arg(
        long,
        env = "CLI_BATCH_MAXAMOUNT",
        default_value_t = 100,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub batch_max_amount: u32,

    /// Delay between winners queries while the draw is pending.
    #[arg(long, default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// Winners queries to attempt before giving up.
    #[arg(long, default_value_t = 120)]
    pub max_polls: u32,
}

impl ClientArgs {
    pub fn client_config(&self) -> Result<ClientConfig> {
        let agency = AgencyId::new(self.agency).context("agency id must be positive")?;
        Ok(ClientConfig {
            agency,
            server: self.server.clone(),
            bets_path: self.bets.clone(),
            batch_max_amount: self.batch_max_amount as usize,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_polls: self.max_polls,
        })
    }
}

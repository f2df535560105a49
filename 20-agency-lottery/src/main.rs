use std::io::IsTerminal;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{io::AsyncWriteExt, select};
use tracing::{info, warn};

use agency_lottery::{
    cli::{Cli, ClientArgs, Command, ServerArgs},
    client,
    server::LotteryServer,
    signal::shutdown_signal,
    storage::{CsvBetStore, Storage},
};

fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Server(args) => run_server(args).await,
        Command::Client(args) => run_client(args).await,
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let config = args.server_config();
    let storage = Storage::new(CsvBetStore::new(&args.bets_file, args.winning_number));
    let server = LotteryServer::bind(&config, storage)
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("lottery server listening on {}", server.local_addr()?);

    if let Err(err) = server.run_until_signalled().await {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let config = args.client_config()?;

    let winners = select! {
        result = client::run(&config) => result?,
        _ = shutdown_signal() => {
            info!(agency = %config.agency, "client interrupted");
            return Ok(());
        }
    };

    let mut report = format!("winners: {}\n", winners.len());
    for document in &winners {
        report.push_str(document);
        report.push('\n');
    }
    let mut stdout = tokio::io::stdout();
    stdout.write_all(report.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

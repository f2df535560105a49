use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tracing::{debug, info, warn};

use crate::{
    bet::{AgencyId, Bet, FIELD_SEPARATOR, RECORD_SEPARATOR},
    message::{Message, OpCode, read_message, write_message},
};

/// Upper bound on the payload of a single `BATCH` frame.
pub const MAX_BATCH_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub agency: AgencyId,
    /// `host:port` of the lottery server.
    pub server: String,
    /// CSV file with rows `first_name,last_name,document,birthdate,number`.
    pub bets_path: PathBuf,
    pub batch_max_amount: usize,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

/// Submits the agency's bets, announces readiness and waits for the draw.
///
/// Returns the winning document ids for this agency.
pub async fn run(config: &ClientConfig) -> Result<Vec<String>> {
    let bets = load_agency_bets(&config.bets_path, config.agency)?;
    info!(agency = %config.agency, bets = bets.len(), "loaded bets");

    submit_bets(config, &bets).await?;
    announce_ready(config).await?;
    poll_winners(config).await
}

fn load_agency_bets(path: &Path, agency: AgencyId) -> Result<Vec<Bet>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open bets file {}", path.display()))?;

    let mut bets = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("failed to read row {}", index + 1))?;
        let mut record = agency.to_string();
        for field in row.iter() {
            record.push(FIELD_SEPARATOR);
            record.push_str(field);
        }
        let bet = record
            .parse::<Bet>()
            .with_context(|| format!("invalid bet on row {}", index + 1))?;
        bets.push(bet);
    }
    Ok(bets)
}

/// Groups records into payloads limited both by count and by byte size.
///
/// A record that alone exceeds the byte limit still travels in its own batch.
fn chunk_batches(bets: &[Bet], max_amount: usize, max_bytes: usize) -> Vec<String> {
    let mut batches = Vec::new();
    let mut current = String::new();
    let mut count = 0;

    for record in bets.iter().map(Bet::to_record) {
        let extra = if current.is_empty() {
            record.len()
        } else {
            record.len() + 1
        };
        if count > 0 && (count == max_amount || current.len() + extra > max_bytes) {
            batches.push(std::mem::take(&mut current));
            count = 0;
        }
        if !current.is_empty() {
            current.push(RECORD_SEPARATOR);
        }
        current.push_str(&record);
        count += 1;
    }

    if count > 0 {
        batches.push(current);
    }
    batches
}

async fn connect(config: &ClientConfig) -> Result<TcpStream> {
    TcpStream::connect(&config.server)
        .await
        .with_context(|| format!("failed to connect to {}", config.server))
}

async fn submit_bets(config: &ClientConfig, bets: &[Bet]) -> Result<()> {
    let batches = chunk_batches(bets, config.batch_max_amount, MAX_BATCH_BYTES);
    if batches.is_empty() {
        return Ok(());
    }

    let mut stream = connect(config).await?;
    for (index, payload) in batches.into_iter().enumerate() {
        write_message(&mut stream, &Message::new(OpCode::Batch, payload)).await?;
        match read_message(&mut stream).await? {
            Some(Message {
                op: OpCode::Confirmation,
                payload,
            }) => debug!(batch = index + 1, reply = %payload, "batch confirmed"),
            Some(Message {
                op: OpCode::Error,
                payload,
            }) => bail!("server rejected batch {}: {payload}", index + 1),
            Some(other) => bail!("unexpected reply to batch: {}", other.op),
            None => bail!("server closed the connection while sending batches"),
        }
    }

    if let Err(error) = stream.shutdown().await {
        warn!(?error, "failed to shut down batch connection cleanly");
    }
    info!(agency = %config.agency, bets = bets.len(), "all bets submitted");
    Ok(())
}

async fn announce_ready(config: &ClientConfig) -> Result<()> {
    let mut stream = connect(config).await?;
    write_message(
        &mut stream,
        &Message::new(OpCode::Ready, config.agency.to_string()),
    )
    .await?;

    // The server acknowledges readiness by closing the connection.
    match read_message(&mut stream).await? {
        None => {
            info!(agency = %config.agency, "readiness announced");
            Ok(())
        }
        Some(Message {
            op: OpCode::Error,
            payload,
        }) => Err(anyhow!("server rejected readiness: {payload}")),
        Some(other) => Err(anyhow!("unexpected reply to readiness: {}", other.op)),
    }
}

async fn poll_winners(config: &ClientConfig) -> Result<Vec<String>> {
    for attempt in 1..=config.max_polls {
        let mut stream = connect(config).await?;
        write_message(
            &mut stream,
            &Message::new(OpCode::WinnersQuery, config.agency.to_string()),
        )
        .await?;

        match read_message(&mut stream).await? {
            Some(Message {
                op: OpCode::WinnersResponse,
                payload,
            }) => {
                let winners: Vec<String> = payload
                    .split(',')
                    .filter(|document| !document.is_empty())
                    .map(str::to_string)
                    .collect();
                info!(agency = %config.agency, winners = winners.len(), "winners received");
                return Ok(winners);
            }
            Some(Message {
                op: OpCode::NotReady,
                ..
            }) => {
                debug!(attempt, "draw not done yet");
                tokio::time::sleep(config.poll_interval).await;
            }
            Some(Message {
                op: OpCode::Error,
                payload,
            }) => bail!("server rejected winners query: {payload}"),
            Some(other) => bail!("unexpected reply to winners query: {}", other.op),
            None => bail!("server closed the connection without answering"),
        }
    }

    bail!("draw did not happen after {} polls", config.max_polls)
}

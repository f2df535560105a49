//! Per-connection session: read frames, dispatch on the opcode, reply.
//!
//! A connection carrying `BATCH` frames stays open for further batches until
//! the peer closes it. Every other request is answered (or not) and then the
//! connection is closed.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::{
    bet::{AgencyId, BetParseError, parse_batch},
    lottery::{LotteryCoordinator, WinnersReply},
    message::{FrameError, Message, OpCode, read_message, write_message},
    storage::Storage,
};

/// Shared state handed to every connection task.
#[derive(Clone)]
pub struct SessionContext {
    pub lottery: Arc<LotteryCoordinator>,
    pub storage: Storage,
}

impl SessionContext {
    pub fn new(agencies: usize, storage: Storage) -> Self {
        Self {
            lottery: Arc::new(LotteryCoordinator::new(agencies)),
            storage,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("unexpected operation {0}")]
    UnexpectedOp(OpCode),
    #[error("invalid agency id: {0}")]
    InvalidAgency(#[from] BetParseError),
}

enum Flow {
    Continue,
    Close,
}

/// Runs a session to completion and closes the stream on every path.
///
/// Failures are logged and, where the transport still allows it, reported
/// to the peer with an `ERROR` frame.
pub async fn serve<S>(mut stream: S, ctx: &SessionContext)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(error) = run_session(&mut stream, ctx).await {
        warn!(%error, "session failed");
        let reply = Message::error(error.to_string());
        if let Err(send_error) = write_message(&mut stream, &reply).await {
            debug!(error = %send_error, "failed to report session error to peer");
        }
    }

    if let Err(error) = stream.shutdown().await {
        debug!(?error, "failed to shut down connection cleanly");
    }
}

async fn run_session<S>(stream: &mut S, ctx: &SessionContext) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let Some(message) = read_message(stream).await? else {
            debug!("peer closed connection");
            return Ok(());
        };
        debug!(op = %message.op, len = message.payload.len(), "message received");

        match handle_message(message, stream, ctx).await? {
            Flow::Continue => continue,
            Flow::Close => return Ok(()),
        }
    }
}

async fn handle_message<W>(
    message: Message,
    writer: &mut W,
    ctx: &SessionContext,
) -> Result<Flow, SessionError>
where
    W: AsyncWrite + Unpin,
{
    match message.op {
        OpCode::Batch => {
            store_bets(&message.payload, writer, ctx).await?;
            Ok(Flow::Continue)
        }
        OpCode::LegacySingleBet => {
            store_bets(&message.payload, writer, ctx).await?;
            Ok(Flow::Close)
        }
        OpCode::Ready => {
            let agency = message.payload.parse::<AgencyId>()?;
            if ctx.lottery.mark_ready(agency).await {
                info!(%agency, "agency ready");
            } else {
                warn!(%agency, "ignoring readiness from unknown agency");
            }
            Ok(Flow::Close)
        }
        OpCode::WinnersQuery => {
            let agency = message.payload.parse::<AgencyId>()?;
            answer_winners_query(agency, writer, ctx).await?;
            Ok(Flow::Close)
        }
        OpCode::Error => {
            warn!(message = %message.payload, "peer reported an error");
            Ok(Flow::Close)
        }
        other => Err(SessionError::UnexpectedOp(other)),
    }
}

async fn store_bets<W>(payload: &str, writer: &mut W, ctx: &SessionContext) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let batch = parse_batch(payload);
    let rejected = batch.rejected;

    let reply = match ctx.storage.append(batch.bets).await {
        Ok(stored) => {
            info!(stored, rejected, "batch stored");
            Message::new(OpCode::Confirmation, format!("stored {stored} bets"))
        }
        Err(error) => {
            warn!(%error, "failed to store batch");
            Message::error(error.to_string())
        }
    };

    write_message(writer, &reply).await
}

async fn answer_winners_query<W>(
    agency: AgencyId,
    writer: &mut W,
    ctx: &SessionContext,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let reply = match ctx.lottery.query_winners(agency).await {
        WinnersReply::Winners(documents) => {
            info!(%agency, winners = documents.len(), "winners delivered");
            Message::new(OpCode::WinnersResponse, documents.join(","))
        }
        WinnersReply::NotReady => {
            debug!(%agency, "winners requested before the draw");
            Message::new(OpCode::NotReady, "")
        }
    };

    write_message(writer, &reply).await
}

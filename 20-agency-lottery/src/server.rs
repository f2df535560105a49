use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    select,
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    message::{Message, write_message},
    session::{self, SessionContext},
    signal::shutdown_signal,
    storage::Storage,
};

const REAP_INTERVAL: Duration = Duration::from_secs(1);
const REFUSAL_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub backlog: u32,
    /// Most sessions allowed to run at once.
    pub max_workers: usize,
    /// Agencies `1..=agencies` take part in the draw.
    pub agencies: usize,
    /// How long shutdown waits for in-flight sessions.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 12345)),
            backlog: 5,
            max_workers: 10,
            agencies: 5,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

pub struct LotteryServer {
    listener: TcpListener,
    state: ServerState,
    shutdown_timeout: Duration,
}

impl LotteryServer {
    /// Binds the listening socket. Must be called from within a Tokio runtime.
    pub fn bind(config: &ServerConfig, storage: Storage) -> io::Result<Self> {
        let socket = if config.listen.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(config.listen)?;
        let listener = socket.listen(config.backlog)?;

        Ok(Self {
            listener,
            state: ServerState {
                ctx: SessionContext::new(config.agencies, storage),
                workers: WorkerPool::new(config.max_workers),
            },
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let LotteryServer {
            listener,
            state,
            shutdown_timeout,
        } = self;
        tokio::pin!(shutdown);

        let mut reap = time::interval(REAP_INTERVAL);
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, closing listener");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state).await;
                }
                _ = reap.tick() => {
                    state.workers.reap();
                }
            }
        }

        drop(listener);
        drain_workers(&state.workers, shutdown_timeout).await;
        info!("server stopped");
        Ok(())
    }

    pub async fn run_until_signalled(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }
}

struct ServerState {
    ctx: SessionContext,
    workers: WorkerPool,
}

/// Tracks spawned sessions and caps how many run at once.
struct WorkerPool {
    capacity: usize,
    permits: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            handles: Mutex::new(Vec::new()),
        }
    }

    fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).try_acquire_owned().ok()
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Forgets sessions that already finished.
    fn reap(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let before = handles.len();
        handles.retain(|handle| !handle.is_finished());
        let reaped = before - handles.len();
        if reaped > 0 {
            debug!(reaped, running = handles.len(), "reclaimed finished workers");
        }
    }

    fn drain(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

async fn handle_accept_result(result: io::Result<(TcpStream, SocketAddr)>, state: &ServerState) {
    match result {
        Ok((stream, peer)) => dispatch_connection(stream, peer, state).await,
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn dispatch_connection(stream: TcpStream, peer: SocketAddr, state: &ServerState) {
    state.workers.reap();

    let Some(permit) = state.workers.try_reserve() else {
        warn!(%peer, capacity = state.workers.capacity, "refusing connection, server at capacity");
        refuse_connection(stream, state.workers.capacity).await;
        return;
    };

    debug!(%peer, "connection accepted");
    let ctx = state.ctx.clone();
    let handle = tokio::spawn(async move {
        session::serve(stream, &ctx)
            .instrument(info_span!("session", %peer))
            .await;
        drop(permit);
        draw_if_ready(&ctx).await;
    });
    state.workers.track(handle);
}

async fn refuse_connection(mut stream: TcpStream, capacity: usize) {
    let reply = Message::error(format!("server at capacity ({capacity} connections)"));
    match time::timeout(REFUSAL_WRITE_TIMEOUT, write_message(&mut stream, &reply)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = %err, "failed to send capacity error"),
        Err(_) => debug!("timed out sending capacity error"),
    }
}

async fn draw_if_ready(ctx: &SessionContext) {
    match ctx.lottery.draw_if_ready(&ctx.storage).await {
        Ok(true) => info!("all agencies ready, draw executed"),
        Ok(false) => {}
        Err(err) => error!(error = %err, "draw failed"),
    }
}

/// Waits for in-flight sessions until the deadline, then abandons the rest.
async fn drain_workers(workers: &WorkerPool, timeout: Duration) {
    let handles = workers.drain();
    if handles.is_empty() {
        return;
    }

    info!(running = handles.len(), ?timeout, "waiting for in-flight sessions");
    let deadline = Instant::now() + timeout;
    let mut abandoned = 0usize;
    for handle in handles {
        match time::timeout_at(deadline, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = ?err, "session task panicked"),
            Err(_) => abandoned += 1,
        }
    }

    if abandoned > 0 {
        warn!(abandoned, "sessions still running after shutdown timeout, abandoning them");
    }
}

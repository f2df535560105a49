use std::{net::SocketAddr, time::Duration};

use agency_lottery::{
    message::{Message, OpCode, read_message, write_message},
    server::{LotteryServer, ServerConfig},
    storage::{MemoryBetStore, Storage},
};
use anyhow::{Result, anyhow};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const IO_TIMEOUT: Duration = Duration::from_secs(2);

struct TestServer {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<Result<()>>,
}

impl TestServer {
    async fn start(agencies: usize, max_workers: usize, storage: Storage) -> Result<Self> {
        let config = ServerConfig {
            listen: "127.0.0.1:0".parse()?,
            agencies,
            max_workers,
            shutdown_timeout: Duration::from_millis(200),
            ..ServerConfig::default()
        };
        let server = LotteryServer::bind(&config, storage)?;
        let addr = server.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .run_until(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(Self {
            addr,
            shutdown_tx,
            handle,
        })
    }

    async fn stop(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        timeout(Duration::from_secs(5), self.handle).await???;
        Ok(())
    }
}

async fn recv(stream: &mut TcpStream) -> Result<Option<Message>> {
    Ok(timeout(IO_TIMEOUT, read_message(stream)).await??)
}

/// Sends one request on a fresh connection and collects every reply until
/// the server closes it.
async fn request(addr: SocketAddr, message: Message) -> Result<Vec<Message>> {
    let mut stream = TcpStream::connect(addr).await?;
    write_message(&mut stream, &message).await?;
    let mut replies = Vec::new();
    while let Some(reply) = recv(&mut stream).await? {
        replies.push(reply);
    }
    Ok(replies)
}

async fn send_batch(addr: SocketAddr, payload: &str) -> Result<Message> {
    let mut stream = TcpStream::connect(addr).await?;
    write_message(&mut stream, &Message::new(OpCode::Batch, payload)).await?;
    let reply = recv(&mut stream)
        .await?
        .ok_or_else(|| anyhow!("server closed before confirming batch"))?;
    stream.shutdown().await?;
    Ok(reply)
}

async fn wait_for_winners(addr: SocketAddr, agency: u32) -> Result<String> {
    for _ in 0..100 {
        let replies = request(addr, Message::new(OpCode::WinnersQuery, agency.to_string())).await?;
        match replies.as_slice() {
            [Message {
                op: OpCode::WinnersResponse,
                payload,
            }] => return Ok(payload.clone()),
            [Message {
                op: OpCode::NotReady,
                ..
            }] => sleep(Duration::from_millis(20)).await,
            other => return Err(anyhow!("unexpected winners reply: {other:?}")),
        }
    }
    Err(anyhow!("draw never happened"))
}

#[tokio::test]
async fn three_agencies_complete_a_draw() -> Result<()> {
    let storage = Storage::new(MemoryBetStore::new(7574));
    let server = TestServer::start(3, 10, storage.clone()).await?;

    let batches = [
        "1,Ana,Diaz,111,1990-01-01,7574;1,Luis,Paz,112,1991-02-02,10",
        "2,Eva,Sosa,221,1985-05-05,1;2,Juan,Gil,222,1980-06-06,2",
        "3,Mia,Rey,331,1970-07-07,7574;3,Leo,Ruiz,332,1975-08-08,7574",
    ];
    for payload in batches {
        let reply = send_batch(server.addr, payload).await?;
        assert_eq!(reply, Message::new(OpCode::Confirmation, "stored 2 bets"));
    }

    for agency in 1..=3 {
        let replies = request(server.addr, Message::new(OpCode::Ready, agency.to_string())).await?;
        assert!(replies.is_empty(), "ready is acknowledged by closing");
    }

    assert_eq!(wait_for_winners(server.addr, 1).await?, "111");
    assert_eq!(wait_for_winners(server.addr, 2).await?, "");
    assert_eq!(wait_for_winners(server.addr, 3).await?, "331,332");

    // A late bet cannot change the outcome of a finished draw.
    send_batch(server.addr, "2,Sol,Vera,223,1999-09-09,7574").await?;
    assert_eq!(wait_for_winners(server.addr, 2).await?, "");
    assert_eq!(storage.load_all().await?.len(), 7);

    server.stop().await
}

#[tokio::test]
async fn winners_query_counts_as_readiness() -> Result<()> {
    let storage = Storage::new(MemoryBetStore::new(7574));
    let server = TestServer::start(2, 10, storage).await?;

    send_batch(server.addr, "2,Eva,Sosa,221,1985-05-05,7574").await?;
    request(server.addr, Message::new(OpCode::Ready, "1")).await?;

    // Agency 2 never sends READY; its first query is answered NOT_READY and
    // completes the barrier.
    let replies = request(server.addr, Message::new(OpCode::WinnersQuery, "2")).await?;
    assert_eq!(replies, vec![Message::new(OpCode::NotReady, "")]);

    assert_eq!(wait_for_winners(server.addr, 2).await?, "221");
    assert_eq!(wait_for_winners(server.addr, 1).await?, "");

    server.stop().await
}

#[tokio::test]
async fn queries_before_barrier_are_not_ready() -> Result<()> {
    let server = TestServer::start(3, 10, Storage::new(MemoryBetStore::default())).await?;

    request(server.addr, Message::new(OpCode::Ready, "1")).await?;
    request(server.addr, Message::new(OpCode::Ready, "2")).await?;
    for _ in 0..3 {
        let replies = request(server.addr, Message::new(OpCode::WinnersQuery, "1")).await?;
        assert_eq!(replies, vec![Message::new(OpCode::NotReady, "")]);
    }

    server.stop().await
}

#[tokio::test]
async fn malformed_record_is_dropped() -> Result<()> {
    let storage = Storage::new(MemoryBetStore::default());
    let server = TestServer::start(1, 10, storage.clone()).await?;

    let reply = send_batch(
        server.addr,
        "1,Ana,Diaz,111,1990-01-01,7574;1,Luis,Paz,112,1991-02-02",
    )
    .await?;
    assert_eq!(reply, Message::new(OpCode::Confirmation, "stored 1 bets"));

    let stored = storage.load_all().await?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].document, "111");

    server.stop().await
}

#[tokio::test]
async fn connections_beyond_capacity_are_refused() -> Result<()> {
    let server = TestServer::start(1, 2, Storage::new(MemoryBetStore::default())).await?;

    // Two idle sessions occupy every worker slot.
    let mut first = TcpStream::connect(server.addr).await?;
    let mut second = TcpStream::connect(server.addr).await?;

    let mut refused = TcpStream::connect(server.addr).await?;
    let reply = recv(&mut refused)
        .await?
        .ok_or_else(|| anyhow!("expected capacity error"))?;
    assert_eq!(reply.op, OpCode::Error);
    assert!(reply.payload.contains("capacity"), "got {:?}", reply.payload);
    assert!(recv(&mut refused).await?.is_none());

    // The in-flight sessions keep working.
    for stream in [&mut first, &mut second] {
        write_message(
            stream,
            &Message::new(OpCode::Batch, "1,Ana,Diaz,111,1990-01-01,1"),
        )
        .await?;
        let reply = recv(stream)
            .await?
            .ok_or_else(|| anyhow!("expected confirmation"))?;
        assert_eq!(reply, Message::new(OpCode::Confirmation, "stored 1 bets"));
    }

    drop(first);
    drop(second);
    server.stop().await
}

#[tokio::test]
async fn unknown_opcode_gets_error_reply() -> Result<()> {
    let server = TestServer::start(1, 10, Storage::new(MemoryBetStore::default())).await?;

    let mut stream = TcpStream::connect(server.addr).await?;
    stream.write_all(&[200, 0, 0, 0, 0]).await?;
    let reply = recv(&mut stream)
        .await?
        .ok_or_else(|| anyhow!("expected error reply"))?;
    assert_eq!(reply.op, OpCode::Error);
    assert!(reply.payload.contains("unknown operation code 200"));
    assert!(recv(&mut stream).await?.is_none());

    server.stop().await
}

#[tokio::test]
async fn shutdown_abandons_stalled_sessions() -> Result<()> {
    let server = TestServer::start(1, 10, Storage::new(MemoryBetStore::default())).await?;
    let addr = server.addr;

    // Complete one exchange so the idle connection below is surely accepted.
    send_batch(addr, "1,Ana,Diaz,111,1990-01-01,1").await?;
    let mut stalled = TcpStream::connect(addr).await?;
    write_message(
        &mut stalled,
        &Message::new(OpCode::Batch, "1,Luis,Paz,112,1991-02-02,2"),
    )
    .await?;
    recv(&mut stalled).await?;

    timeout(Duration::from_secs(2), server.stop()).await??;
    assert!(TcpStream::connect(addr).await.is_err());

    drop(stalled);
    Ok(())
}

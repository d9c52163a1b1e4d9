//! RESP2 listener and per-connection loop.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::{BytesFrame, Resp2Frame};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::command::{self, CommandError};
use crate::server::ServerEntry;
use crate::session::Session;

pub async fn run(addr: SocketAddr, server: Arc<ServerEntry>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (socket, peer) = listener.accept().await?;
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, peer, server).await {
                tracing::debug!(error = ?err, "resp connection closed");
            }
        });
    }
}

async fn handle_conn(
    socket: TcpStream,
    peer: SocketAddr,
    server: Arc<ServerEntry>,
) -> anyhow::Result<()> {
    let session = server.sessions().register(&server, peer.to_string());
    let result = conn_loop(socket, &session).await;
    server.sessions().deregister(session.id());
    result
}

async fn conn_loop(socket: TcpStream, session: &Arc<Session>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, Resp2::default());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let reply = match parse_args(frame) {
            Ok(Some(args)) => {
                let session = session.clone();
                // Commands run synchronously and may block inside the
                // engine; keep them off the runtime threads.
                tokio::task::spawn_blocking(move || command::execute(&session, &args))
                    .await
                    .map_err(|err| anyhow::anyhow!("command task failed: {err}"))?
            }
            Ok(None) => continue,
            Err(err) => CommandError::parse(err.to_string()).to_frame(),
        };
        feed_frame(&mut framed, reply).await?;
        flush_frames(&mut framed).await?;
    }
    Ok(())
}

async fn feed_frame(
    framed: &mut Framed<TcpStream, Resp2>,
    frame: BytesFrame,
) -> anyhow::Result<()> {
    framed.feed(frame).await?;
    Ok(())
}

async fn flush_frames(framed: &mut Framed<TcpStream, Resp2>) -> anyhow::Result<()> {
    <Framed<TcpStream, Resp2> as SinkExt<BytesFrame>>::flush(framed).await?;
    Ok(())
}

/// Decode a client frame into an argument vector.
///
/// Empty arrays are legal no-ops; non-array frames and non-text arguments
/// are protocol errors.
fn parse_args(frame: BytesFrame) -> anyhow::Result<Option<Vec<String>>> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };
    if parts.is_empty() {
        return Ok(None);
    }
    let mut args = Vec::with_capacity(parts.len());
    for part in &parts {
        let Some(text) = part.as_str() else {
            anyhow::bail!("expected bulk string argument");
        };
        args.push(text.to_string());
    }
    Ok(Some(args))
}

//! Per-socket duplex: the version handshake plus three cooperative loops
//! (receive, send, heartbeat watchdog) raced under one `select!`. Whichever
//! loop finishes first cancels the others, and the connection reports itself
//! on the server's lost-connection channel.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use tempolink_shared::{read_frame, write_frame, ClientCommand, ServerCommand, PROTOCOL_VERSION};

use crate::server::Server;
use crate::session::Session;
use crate::{HEARTBEAT_POLL, HEARTBEAT_TIMEOUT};

pub async fn handle_connection(server: Arc<Server>, mut stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY for {addr}: {e}");
    }

    // Version handshake: each side pushes its byte without waiting for the
    // peer's. A mismatch is not an error at this layer.
    if let Err(e) = stream.write_u8(PROTOCOL_VERSION).await {
        warn!("handshake write to {addr} failed: {e}");
        return;
    }
    let client_version = match stream.read_u8().await {
        Ok(version) => version,
        Err(e) => {
            warn!("handshake read from {addr} failed: {e}");
            return;
        }
    };
    debug!("client {addr} speaks protocol version {client_version}");

    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let session = Session::new(server.clone(), client_version, queue_tx);
    server.register_session(&session);
    info!("session {} connected from {addr}", session.id);

    let (reader, writer) = stream.into_split();
    tokio::select! {
        result = recv_loop(&session, reader) => {
            // Covers clean EOF, transport errors, and malformed or oversized
            // frame lengths alike.
            if let Err(e) = result {
                info!("session {} receive side ended: {e}", session.id);
            }
        }
        result = send_loop(writer, queue_rx) => {
            if let Err(e) = result {
                info!("session {} send side ended: {e}", session.id);
            }
        }
        () = watchdog(&session) => {
            warn!(
                "session {} heard nothing for {HEARTBEAT_TIMEOUT:?}, dropping",
                session.id
            );
        }
    }
    server.report_lost(session.id);
}

/// Reads frames, decodes commands, and dispatches them to the session.
///
/// Frame-local decode failures are logged and skipped; only transport
/// problems (I/O errors, EOF, bad or oversized length prefixes) end the
/// loop. `Ping` is answered right here without consulting the session.
async fn recv_loop(session: &Arc<Session>, reader: OwnedReadHalf) -> io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(1024);
    loop {
        read_frame(&mut reader, &mut buf).await?;
        session.touch();
        match ClientCommand::decode(&buf) {
            Ok(ClientCommand::Ping) => session.send(ServerCommand::Pong),
            Ok(cmd) => session.handle(cmd).await,
            Err(e) => warn!("session {} skipping malformed frame: {e}", session.id),
        }
    }
}

/// Drains the unbounded outbound queue. The queue has no bound on purpose:
/// the server must be able to push state changes without losing them to a
/// transiently slow consumer. Returns when the queue closes or a write
/// fails.
async fn send_loop(
    writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<ServerCommand>,
) -> io::Result<()> {
    let mut writer = BufWriter::new(writer);
    while let Some(cmd) = queue.recv().await {
        write_frame(&mut writer, &cmd.encode()).await?;
    }
    Ok(())
}

/// Resolves once the peer has been silent past the heartbeat timeout.
/// Clients are expected to ping at least every ~5 s.
async fn watchdog(session: &Session) {
    let mut interval = tokio::time::interval(HEARTBEAT_POLL);
    loop {
        interval.tick().await;
        if session.idle_for() > HEARTBEAT_TIMEOUT {
            return;
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt as _;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::hosts::HostEntry;
use crate::record::Outbound;
use crate::router::Shared;

/// Accept/read poll quantum; loops notice a shutdown within this.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Pumps read at most this much per iteration. The router is a byte-splice,
/// not a message reframer; delivery boundaries follow these chunks.
const CHUNK_SIZE: usize = 1024;

/// Impersonate `host` on one TCP port: accept inbound connections, splice
/// each to a twin connection against `{host}_Actual`, and feed both
/// directions through the delay queue.
pub(crate) async fn listen(
    shared: Arc<Shared>,
    host: HostEntry,
    port: u16,
    listener: TcpListener,
) {
    while shared.is_running() {
        let accepted = match timeout(POLL_TIMEOUT, listener.accept()).await {
            Err(_) => continue,
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                tracing::warn!(host = %host.name, port, "tcp accept failed: {e}");
                continue;
            }
        };
        let (inbound, peer) = accepted;

        let sender = match shared.directory.name_by_ip(peer.ip()) {
            Ok(name) => name.to_owned(),
            Err(e) => {
                // Dropping the socket closes the connection.
                tracing::warn!(%peer, "rejecting tcp connection: {e}");
                continue;
            }
        };

        let recipient = format!("{}_Actual", host.name);

        let outbound = match connect(&shared, &recipient, port).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(
                    %sender,
                    %recipient,
                    port,
                    "abandoning connection, could not reach peer: {e}"
                );
                continue;
            }
        };

        tracing::info!(%sender, %recipient, port, "spliced tcp connection");

        let (inbound_read, inbound_write) = inbound.into_split();
        let (outbound_read, outbound_write) = outbound.into_split();
        let inbound_write = Arc::new(Mutex::new(inbound_write));
        let outbound_write = Arc::new(Mutex::new(outbound_write));

        tokio::spawn(pump(
            shared.clone(),
            inbound_read,
            Outbound::Tcp(outbound_write),
            sender.clone(),
            recipient.clone(),
            port,
        ));
        tokio::spawn(pump(
            shared.clone(),
            outbound_read,
            Outbound::Tcp(inbound_write),
            recipient,
            sender,
            port,
        ));
    }
}

async fn connect(shared: &Shared, recipient: &str, port: u16) -> std::io::Result<TcpStream> {
    let addr = shared.resolver.resolve(recipient, port).await?;

    TcpStream::connect(addr).await
}

/// Half-duplex pump: read chunks from one side of the splice and enqueue
/// them for the other. An EOF or read error ends this direction only; the
/// opposite pump keeps going until its own EOF.
async fn pump(
    shared: Arc<Shared>,
    mut from: OwnedReadHalf,
    to: Outbound,
    sender: String,
    recipient: String,
    port: u16,
) {
    let mut buf = [0u8; CHUNK_SIZE];

    while shared.is_running() {
        let n = match timeout(POLL_TIMEOUT, from.read(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                tracing::debug!(%sender, %recipient, port, "tcp read ended: {e}");
                break;
            }
        };

        // Both sides of a splice bind the same port, so send and receive
        // ports coincide for TCP.
        shared.commit(&sender, recipient.clone(), port, port, buf[..n].to_vec(), to.clone());
    }

    tracing::debug!(%sender, %recipient, port, "tcp pump finished");
}

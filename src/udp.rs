use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::record::Outbound;
use crate::router::Shared;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest datagram we pass through intact.
const MAX_DATAGRAM: usize = 65536;

/// Receive loop shared by listener sockets and forwarding sockets.
///
/// `impersonates` is the logical host whose traffic terminates at this
/// socket: the inventory host for a listener, the original sender for a
/// forwarding socket (so replies from `H_Actual` flow back to
/// `{sender}_Actual`). `port` is the local port this socket is bound to and
/// becomes the `recv_port` of every record it produces.
pub(crate) async fn listen(
    shared: Arc<Shared>,
    impersonates: String,
    port: u16,
    socket: Arc<UdpSocket>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    while shared.is_running() {
        let (n, peer) = match timeout(POLL_TIMEOUT, socket.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                tracing::warn!(port, "udp receive failed: {e}");
                continue;
            }
        };

        let sender = match shared.directory.name_by_ip(peer.ip()) {
            Ok(name) => name.to_owned(),
            Err(e) => {
                tracing::warn!(%peer, port, "discarding datagram: {e}");
                continue;
            }
        };

        let source_port = peer.port();

        let forward = match forwarding_socket(&shared, &sender, source_port).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!(
                    %sender,
                    source_port,
                    "discarding datagram, no forwarding socket: {e}"
                );
                continue;
            }
        };

        shared.commit(
            &sender,
            format!("{impersonates}_Actual"),
            source_port,
            port,
            buf[..n].to_vec(),
            Outbound::Udp(forward),
        );
    }
}

/// One forwarding socket per observed source port, for the router's
/// lifetime: a UDP conversation keeps its apparent source port across
/// delays, drops and replies. Binds on the sender's alias address when the
/// inventory provides one, so the `_Actual` peer replies to an address this
/// router owns.
///
/// A datagram sourced from a port the sender is itself impersonated on is a
/// reply; it rides that listener socket back out, so the original sender
/// sees it come from the alias it addressed.
fn forwarding_socket<'a>(
    shared: &'a Arc<Shared>,
    sender: &'a str,
    source_port: u16,
) -> std::pin::Pin<
    Box<dyn std::future::Future<Output = std::io::Result<Arc<UdpSocket>>> + Send + 'a>,
> {
    Box::pin(async move {
        let mut sockets = shared.udp_sockets.lock().await;

        if let Some(listener) = sockets.listeners.get(&(sender.to_owned(), source_port)) {
            return Ok(listener.clone());
        }

        if let Some(existing) = sockets.forwarders.get(&source_port) {
            return Ok(existing.clone());
        }

        let bind_addr = shared
            .directory
            .get(sender)
            .and_then(|entry| entry.bind_addr)
            .unwrap_or(Ipv4Addr::UNSPECIFIED.into());

        let socket = Arc::new(UdpSocket::bind((bind_addr, source_port)).await?);
        sockets.forwarders.insert(source_port, socket.clone());

        tracing::info!(%sender, source_port, "opened udp forwarding socket");

        let spawned: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
            Box::pin(listen(
                shared.clone(),
                sender.to_owned(),
                source_port,
                socket.clone(),
            ));
        tokio::spawn(spawned);

        Ok(socket)
    })
}

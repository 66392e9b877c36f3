use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt as _;

use crate::record::{Delivery, MessageRecord, Outbound};
use crate::router::Shared;

/// Idle poll quantum of the release loop.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// The single consumer of the delay queue. One thread of control by design:
/// release order equals dispatch order for records with equal forward time.
pub(crate) async fn run(shared: Arc<Shared>) {
    tracing::info!("forwarder started");

    while shared.is_running() {
        let Some(record) = shared.queue.pop_due(Instant::now()) else {
            tokio::time::sleep(IDLE_SLEEP).await;
            continue;
        };

        let status = deliver(&shared, &record).await;

        shared.diagram.append(&record, status);
    }

    tracing::info!("forwarder stopped");
}

async fn deliver(shared: &Shared, record: &MessageRecord) -> Delivery {
    if record.drop_message {
        tracing::info!(
            number = record.message_number,
            sender = %record.sender,
            recipient = %record.recipient,
            "choosing not to deliver message"
        );
        return Delivery::Dropped;
    }

    match &record.socket {
        Outbound::Tcp(write_half) => {
            let mut write_half = write_half.lock().await;

            match write_half.write_all(&record.message).await {
                Ok(()) => {
                    tracing::info!(
                        number = record.message_number,
                        sender = %record.sender,
                        recipient = %record.recipient,
                        bytes = record.message.len(),
                        "delivered tcp message"
                    );
                    Delivery::Success
                }
                Err(e) => {
                    tracing::warn!(
                        number = record.message_number,
                        sender = %record.sender,
                        recipient = %record.recipient,
                        "could not deliver tcp message: {e}"
                    );
                    // Send a FIN so the paired pump runs down on its next
                    // read instead of feeding a dead connection.
                    let _ = write_half.shutdown().await;
                    Delivery::Failure
                }
            }
        }
        Outbound::Udp(socket) => {
            let dest = match shared
                .resolver
                .resolve(&record.recipient, record.recv_port)
                .await
            {
                Ok(dest) => dest,
                Err(e) => {
                    tracing::error!(
                        number = record.message_number,
                        recipient = %record.recipient,
                        recv_port = record.recv_port,
                        "cannot resolve recipient: {e}"
                    );
                    return Delivery::RouterError;
                }
            };

            match socket.send_to(&record.message, dest).await {
                Ok(_) => {
                    tracing::info!(
                        number = record.message_number,
                        sender = %record.sender,
                        send_port = record.send_port,
                        recipient = %record.recipient,
                        recv_port = record.recv_port,
                        bytes = record.message.len(),
                        "delivered udp message"
                    );
                    Delivery::Success
                }
                Err(e) => {
                    tracing::warn!(
                        number = record.message_number,
                        sender = %record.sender,
                        recipient = %record.recipient,
                        "could not deliver udp message: {e}"
                    );
                    Delivery::Failure
                }
            }
        }
    }
}

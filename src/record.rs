use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// The outbound transport a record will be delivered on.
///
/// A TCP record carries the write half of the spliced peer connection (shared
/// with every other record of the same direction); a UDP record carries the
/// forwarding socket bound to the conversation's source port. The variant is
/// the record's socket type.
#[derive(Clone)]
pub enum Outbound {
    Tcp(Arc<Mutex<OwnedWriteHalf>>),
    Udp(Arc<UdpSocket>),
}

impl Outbound {
    pub fn kind(&self) -> SocketKind {
        match self {
            Outbound::Tcp(_) => SocketKind::Tcp,
            Outbound::Udp(_) => SocketKind::Udp,
        }
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outbound::Tcp(_) => "Outbound::Tcp",
            Outbound::Udp(_) => "Outbound::Udp",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Tcp,
    Udp,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SocketKind::Tcp => "tcp",
            SocketKind::Udp => "udp",
        })
    }
}

/// Outcome of one forward attempt, as reported to the sequence diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Success,
    Dropped,
    Failure,
    RouterError,
}

impl fmt::Display for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Delivery::Success => "success",
            Delivery::Dropped => "dropped",
            Delivery::Failure => "failure",
            Delivery::RouterError => "router_error",
        })
    }
}

/// One intercepted message on its way through the router.
///
/// Created on receipt, handed to the manipulation hook exactly once,
/// committed to the delay queue, consumed by the forwarder, reported to the
/// diagram writer. Never reused.
#[derive(Debug)]
pub struct MessageRecord {
    /// Logical hostname of the originator, resolved from the source address.
    pub sender: String,
    /// Destination; the `_Actual` alias of the impersonated peer, except for
    /// the reverse direction of a TCP splice where the accepted socket leads
    /// straight back to the originator.
    pub recipient: String,
    /// Port on which the router received the bytes.
    pub send_port: u16,
    /// Port the recipient will receive the bytes on.
    pub recv_port: u16,
    pub message: Vec<u8>,
    pub socket: Outbound,
    /// Strictly increasing in receive order, process-wide.
    pub message_number: u64,
    pub receipt_time: Instant,
    /// Scheduled release time; never before `receipt_time`.
    pub forward_time: Instant,
    pub time_since_test_start: Duration,
    pub drop_message: bool,
    pub diagram_label: Option<String>,
    /// Free-form side-table for instructor-attached values.
    pub annotations: HashMap<String, String>,
}

impl MessageRecord {
    pub fn socket_kind(&self) -> SocketKind {
        self.socket.kind()
    }

    /// Schedule this record `delay` after its receipt.
    pub fn delay_by(&mut self, delay: Duration) {
        self.forward_time = self.receipt_time + delay;
    }

    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations.insert(key.into(), value.into());
    }
}

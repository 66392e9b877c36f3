//! Transparent TCP/UDP interception fabric for grading networked student
//! assignments.
//!
//! Student processes are launched under assumed hostnames and resolve each
//! other through a hosts-file aliasing scheme: connecting to hostname `H`
//! reaches this router, connecting to `H_Actual` reaches the real process
//! behind `H`. The router accepts every message, runs it through an
//! instructor-supplied [`Manipulate`] hook (which may delay, drop, relabel or
//! rewrite it), and releases it from a time-ordered queue. Every forward
//! attempt is appended to a Mermaid-dialect sequence diagram.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod diagram;
mod forwarder;
mod hosts;
mod manipulate;
mod queue;
mod record;
mod resolver;
mod router;
mod tcp;
mod udp;

pub use diagram::DiagramWriter;
pub use hosts::{HostDirectory, HostEntry};
pub use manipulate::{Identity, Manipulate, hooks};
pub use record::{Delivery, MessageRecord, Outbound, SocketKind};
pub use resolver::{Resolve, StaticResolver, SystemResolver};
pub use router::{Router, RouterBuilder, RouterConfig};

use std::net::IpAddr;
use std::path::PathBuf;

/// Errors surfaced by router setup and peer resolution.
///
/// Everything else (send failures, slow hooks, listener bind conflicts)
/// degrades one flow at a time and is reported through the log and the
/// sequence diagram instead of an error return.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown peer address {0}")]
    UnknownPeer(IpAddr),

    #[error("failed to read host inventory at {path}")]
    InventoryRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed host inventory at {path}")]
    InventoryParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("hosts {first} and {second} share the ip address {ip}")]
    DuplicateIp {
        ip: IpAddr,
        first: String,
        second: String,
    },

    #[error("host {host} has an empty {proto} port range ({lo}..={hi})")]
    EmptyPortRange {
        host: String,
        proto: &'static str,
        lo: u16,
        hi: u16,
    },

    #[error("failed to open sequence diagram file at {path}")]
    Diagram {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

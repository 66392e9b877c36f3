use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

use crate::diagram::DiagramWriter;
use crate::hosts::HostDirectory;
use crate::manipulate::{Identity, Manipulate};
use crate::queue::DelayQueue;
use crate::record::{MessageRecord, Outbound};
use crate::resolver::{Resolve, SystemResolver};
use crate::{forwarder, tcp, udp, Error};

/// Hooks are expected to return promptly; anything slower than this is
/// logged as a contract violation.
const SLOW_HOOK: Duration = Duration::from_millis(50);

/// Well-known file locations for a router run.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub inventory: PathBuf,
    pub sequence_diagram: PathBuf,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            inventory: "knownhosts.json".into(),
            sequence_diagram: "sequence_diagram.txt".into(),
        }
    }
}

pub struct RouterBuilder {
    directory: HostDirectory,
    diagram: DiagramWriter,
    hook: Box<dyn Manipulate>,
    resolver: Box<dyn Resolve>,
}

impl RouterBuilder {
    pub fn new(directory: HostDirectory, diagram: DiagramWriter) -> Self {
        Self {
            directory,
            diagram,
            hook: Box::new(Identity),
            resolver: Box::new(SystemResolver),
        }
    }

    /// Install an instructor manipulation hook in place of [`Identity`].
    pub fn hook(mut self, hook: impl Manipulate) -> Self {
        self.hook = Box::new(hook);
        self
    }

    /// Replace the system resolver for `_Actual` names.
    pub fn resolver(mut self, resolver: impl Resolve) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn build(self) -> Router {
        Router {
            shared: Arc::new(Shared {
                directory: self.directory,
                diagram: self.diagram,
                hook: self.hook,
                resolver: self.resolver,
                queue: DelayQueue::new(),
                running: AtomicBool::new(false),
                udp_sockets: tokio::sync::Mutex::new(UdpTable::default()),
                counter: AtomicU64::new(0),
                started_at: OnceLock::new(),
            }),
            forwarder: Arc::new(Mutex::new(None)),
        }
    }
}

/// The interception fabric: impersonating listeners, the delay queue and the
/// forwarder, plus the instructor hook they feed records through.
#[derive(Clone)]
pub struct Router {
    shared: Arc<Shared>,
    forwarder: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Router {
    /// Load the host inventory and open the diagram sink; the first half of
    /// the `init`/`run` lifecycle.
    pub fn init(config: &RouterConfig) -> Result<RouterBuilder, Error> {
        let directory = HostDirectory::load(&config.inventory)?;
        let diagram =
            DiagramWriter::create(&config.sequence_diagram).map_err(|source| Error::Diagram {
                path: config.sequence_diagram.clone(),
                source,
            })?;

        Ok(RouterBuilder::new(directory, diagram))
    }

    pub fn builder(directory: HostDirectory, diagram: DiagramWriter) -> RouterBuilder {
        RouterBuilder::new(directory, diagram)
    }

    /// Bind every listener and start the forwarder, then return. A bind
    /// failure disables that one listener and is logged; the rest of the
    /// router keeps going.
    pub async fn start(&self) -> Result<()> {
        self.shared.running.store(true, Ordering::SeqCst);
        let _ = self.shared.started_at.set(Instant::now());

        if self.shared.directory.is_empty() {
            tracing::warn!("host inventory is empty; the router has nothing to impersonate");
        }

        for entry in self.shared.directory.entries() {
            let bind_addr = entry
                .bind_addr
                .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED.into());

            for port in entry.tcp_ports.clone() {
                let listener = match TcpListener::bind((bind_addr, port)).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        tracing::error!(
                            host = %entry.name,
                            port,
                            "failed to bind tcp listener: {e}"
                        );
                        continue;
                    }
                };

                tracing::info!(host = %entry.name, port, "listening for tcp");

                tokio::spawn(tcp::listen(self.shared.clone(), entry.clone(), port, listener));
            }

            for port in entry.udp_ports.clone() {
                let socket = match UdpSocket::bind((bind_addr, port)).await {
                    Ok(socket) => Arc::new(socket),
                    Err(e) => {
                        tracing::error!(
                            host = %entry.name,
                            port,
                            "failed to bind udp listener: {e}"
                        );
                        continue;
                    }
                };

                tracing::info!(host = %entry.name, port, "listening for udp");

                self.shared
                    .udp_sockets
                    .lock()
                    .await
                    .listeners
                    .insert((entry.name.clone(), port), socket.clone());

                tokio::spawn(udp::listen(
                    self.shared.clone(),
                    entry.name.clone(),
                    port,
                    socket,
                ));
            }
        }

        let handle = tokio::spawn(forwarder::run(self.shared.clone()));
        *self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        tracing::info!(hosts = self.shared.directory.len(), "router started");

        Ok(())
    }

    /// Start everything and block until [`Router::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;

        let handle = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            handle.await.context("forwarder task panicked")?;
        }

        Ok(())
    }

    /// Ask every loop to wind down; listeners notice within their poll
    /// timeout, the forwarder on its next empty-queue tick. In-flight sends
    /// are not interrupted.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Number of records waiting in the delay queue.
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }
}

/// State shared by every listener, pump and the forwarder.
pub(crate) struct Shared {
    pub(crate) directory: HostDirectory,
    pub(crate) diagram: DiagramWriter,
    pub(crate) hook: Box<dyn Manipulate>,
    pub(crate) resolver: Box<dyn Resolve>,
    pub(crate) queue: DelayQueue,
    pub(crate) running: AtomicBool,
    /// Every UDP socket the router holds. Insert-if-absent under the lock
    /// keeps one forwarding socket per conversation for the router's
    /// lifetime.
    pub(crate) udp_sockets: tokio::sync::Mutex<UdpTable>,
    counter: AtomicU64,
    started_at: OnceLock<Instant>,
}

/// The process-wide UDP socket table.
///
/// Listeners are keyed by the host they impersonate and their listen port;
/// forwarding sockets by the conversation source port they preserve. The
/// reply path prefers a sender's own listener, so answers appear to come
/// from the alias the original sender first talked to.
#[derive(Default)]
pub(crate) struct UdpTable {
    pub(crate) listeners: HashMap<(String, u16), Arc<UdpSocket>>,
    pub(crate) forwarders: HashMap<u16, Arc<UdpSocket>>,
}

impl Shared {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Build a record for freshly received bytes, run it through the
    /// manipulation hook exactly once, and commit it to the delay queue.
    pub(crate) fn commit(
        &self,
        sender: &str,
        recipient: String,
        send_port: u16,
        recv_port: u16,
        message: Vec<u8>,
        socket: Outbound,
    ) {
        let now = Instant::now();
        let started = self.started_at.get().copied().unwrap_or(now);

        let record = MessageRecord {
            sender: sender.to_owned(),
            recipient,
            send_port,
            recv_port,
            message,
            socket,
            message_number: self.counter.fetch_add(1, Ordering::Relaxed),
            receipt_time: now,
            forward_time: now,
            time_since_test_start: now.duration_since(started),
            drop_message: false,
            diagram_label: None,
            annotations: HashMap::new(),
        };

        tracing::info!(
            number = record.message_number,
            sender = %record.sender,
            recipient = %record.recipient,
            send_port = record.send_port,
            recv_port = record.recv_port,
            kind = %record.socket_kind(),
            bytes = record.message.len(),
            "enqueueing message"
        );

        let hook_started = Instant::now();
        let mut record = self.hook.manipulate(record);
        let hook_elapsed = hook_started.elapsed();
        if hook_elapsed > SLOW_HOOK {
            tracing::warn!(
                elapsed_ms = hook_elapsed.as_millis() as u64,
                "manipulation hook blocked the receive path; use forward_time for delays"
            );
        }

        if record.forward_time < record.receipt_time {
            tracing::warn!(
                number = record.message_number,
                "hook moved forward_time before receipt_time; clamping"
            );
            record.forward_time = record.receipt_time;
        }

        self.queue.push(record);
    }
}

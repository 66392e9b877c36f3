use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;

/// Turns `{host}_Actual` names into socket addresses.
///
/// The surrounding harness aliases these names in the hosts file, so the
/// default implementation just asks the system resolver. Tests and harnesses
/// without hosts entries substitute a fixed table.
#[async_trait]
pub trait Resolve: Send + Sync + 'static {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr>;
}

/// System resolver; honors hosts-file aliases.
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}"))
            })
    }
}

/// Fixed hostname → address table; ports pass through unchanged.
#[derive(Default)]
pub struct StaticResolver {
    addresses: HashMap<String, IpAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, host: impl Into<String>, ip: IpAddr) -> Self {
        self.addresses.insert(host.into(), ip);
        self
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        self.addresses
            .get(host)
            .map(|ip| SocketAddr::new(*ip, port))
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}"))
            })
    }
}

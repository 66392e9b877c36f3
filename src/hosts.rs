use std::collections::HashMap;
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::path::Path;

use serde::Deserialize;

use crate::Error;

/// One configured host: the address its real process sends from, and the
/// port ranges the router impersonates it on.
#[derive(Debug, Clone)]
pub struct HostEntry {
    pub name: String,
    /// Address of the real (student) process behind this name; incoming
    /// connections and datagrams are attributed to a host by this address.
    pub ip: IpAddr,
    pub tcp_ports: RangeInclusive<u16>,
    pub udp_ports: RangeInclusive<u16>,
    /// Local address the router binds this host's listeners to. Absent means
    /// unspecified, which matches a router running in its own network
    /// namespace; single-machine harnesses give each host a distinct
    /// loopback alias here.
    pub bind_addr: Option<IpAddr>,
}

#[derive(Debug, Deserialize)]
struct Inventory {
    hosts: HashMap<String, RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    ip_address: IpAddr,
    tcp_start_port: u16,
    tcp_end_port: u16,
    udp_start_port: u16,
    udp_end_port: u16,
    #[serde(default)]
    bind_address: Option<IpAddr>,
}

/// Read-only name/address table loaded once at startup.
///
/// Both lookups are total over the configured hosts; resolving an address
/// outside the inventory is the [`Error::UnknownPeer`] condition that causes
/// the offending connection or datagram to be rejected.
#[derive(Debug)]
pub struct HostDirectory {
    by_name: HashMap<String, HostEntry>,
    by_ip: HashMap<IpAddr, String>,
}

impl HostDirectory {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|source| Error::InventoryRead {
            path: path.to_owned(),
            source,
        })?;

        Self::parse(&raw).map_err(|source| match source {
            ParseError::Json(source) => Error::InventoryParse {
                path: path.to_owned(),
                source,
            },
            ParseError::Invalid(e) => e,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, Error> {
        Self::parse(raw).map_err(|source| match source {
            ParseError::Json(source) => Error::InventoryParse {
                path: "<inline>".into(),
                source,
            },
            ParseError::Invalid(e) => e,
        })
    }

    fn parse(raw: &str) -> Result<Self, ParseError> {
        let inventory: Inventory = serde_json::from_str(raw)?;

        let mut by_name = HashMap::new();
        let mut by_ip: HashMap<IpAddr, String> = HashMap::new();

        for (name, raw) in inventory.hosts {
            if let Some(other) = by_ip.get(&raw.ip_address) {
                // Report the pair in a stable order; map iteration isn't.
                let (first, second) = if *other < name {
                    (other.clone(), name)
                } else {
                    (name, other.clone())
                };
                return Err(Error::DuplicateIp {
                    ip: raw.ip_address,
                    first,
                    second,
                }
                .into());
            }

            for (proto, lo, hi) in [
                ("tcp", raw.tcp_start_port, raw.tcp_end_port),
                ("udp", raw.udp_start_port, raw.udp_end_port),
            ] {
                if lo > hi {
                    return Err(Error::EmptyPortRange {
                        host: name.clone(),
                        proto,
                        lo,
                        hi,
                    }
                    .into());
                }
            }

            by_ip.insert(raw.ip_address, name.clone());
            by_name.insert(
                name.clone(),
                HostEntry {
                    name,
                    ip: raw.ip_address,
                    tcp_ports: raw.tcp_start_port..=raw.tcp_end_port,
                    udp_ports: raw.udp_start_port..=raw.udp_end_port,
                    bind_addr: raw.bind_address,
                },
            );
        }

        Ok(Self { by_name, by_ip })
    }

    pub fn get(&self, name: &str) -> Option<&HostEntry> {
        self.by_name.get(name)
    }

    pub fn name_by_ip(&self, ip: IpAddr) -> Result<&str, Error> {
        self.by_ip
            .get(&ip)
            .map(String::as_str)
            .ok_or(Error::UnknownPeer(ip))
    }

    pub fn entries(&self) -> impl Iterator<Item = &HostEntry> {
        self.by_name.values()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

enum ParseError {
    Json(serde_json::Error),
    Invalid(Error),
}

impl From<serde_json::Error> for ParseError {
    fn from(e: serde_json::Error) -> Self {
        ParseError::Json(e)
    }
}

impl From<Error> for ParseError {
    fn from(e: Error) -> Self {
        ParseError::Invalid(e)
    }
}

//! Name-keyed channel construction.
//!
//! The registry maps a channel class name to a constructor taking a
//! `"host;port"` connection string, so topology code can dial peers without
//! knowing the concrete transport. It is built once at process start and
//! passed by reference to whatever needs to create channels.

use std::collections::HashMap;

use crate::error::{ChannelError, Result};
use crate::tcp::{TcpChannel, TcpChannelConfig};
use crate::Channel;

/// Registry key of the built-in TCP channel.
pub const TCP_CHANNEL_CLASS: &str = "tcp";

/// Constructor for an unconnected channel from a connection string.
pub type ChannelConstructor = fn(&str) -> Result<Box<dyn Channel>>;

/// Explicit channel-class registry.
#[derive(Default)]
pub struct ChannelRegistry {
    constructors: HashMap<String, ChannelConstructor>,
}

fn construct_tcp(conninfo: &str) -> Result<Box<dyn Channel>> {
    let chan = TcpChannel::from_conninfo(conninfo, TcpChannelConfig::default())?;
    Ok(Box::new(chan))
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in transports registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(TCP_CHANNEL_CLASS, construct_tcp);
        registry
    }

    pub fn register(&mut self, class: &str, constructor: ChannelConstructor) {
        self.constructors.insert(class.to_string(), constructor);
    }

    /// Create an unconnected channel of the named class.
    pub fn create(&self, class: &str, conninfo: &str) -> Result<Box<dyn Channel>> {
        match self.constructors.get(class) {
            Some(constructor) => constructor(conninfo),
            None => Err(ChannelError::Protocol(format!(
                "no channel class registered under {class:?}"
            ))),
        }
    }
}

/// Split a `"<hostname-or-ip>;<tcp-port>"` connection string.
pub fn parse_connection_info(conninfo: &str) -> Result<(String, u16)> {
    let trimmed = conninfo.trim_end_matches('\0');
    let mut parts = trimmed.splitn(2, ';');
    let host = parts.next().unwrap_or_default();
    let port = parts
        .next()
        .ok_or_else(|| bad_conninfo(conninfo))?
        .trim()
        .parse::<u16>()
        .map_err(|_| bad_conninfo(conninfo))?;
    if host.is_empty() {
        return Err(bad_conninfo(conninfo));
    }
    Ok((host.to_string(), port))
}

fn bad_conninfo(conninfo: &str) -> ChannelError {
    ChannelError::Protocol(format!(
        "connection info {conninfo:?} is not \"host;port\""
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_connection_info() {
        let (host, port) = parse_connection_info("node7.cluster;4444").unwrap();
        assert_eq!(host, "node7.cluster");
        assert_eq!(port, 4444);

        // linkup payloads carry nul-terminated strings
        let (host, port) = parse_connection_info("10.0.0.3;900\0").unwrap();
        assert_eq!(host, "10.0.0.3");
        assert_eq!(port, 900);
    }

    #[test]
    fn rejects_malformed_connection_info() {
        for bad in ["nohost", ";1234", "host;", "host;notaport"] {
            assert!(parse_connection_info(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn default_registry_builds_tcp_channels() {
        let registry = ChannelRegistry::with_defaults();
        let chan = registry.create(TCP_CHANNEL_CLASS, "127.0.0.1;9000").unwrap();
        assert_eq!(chan.class_name(), TCP_CHANNEL_CLASS);
        assert!(!chan.is_connected());
        assert_eq!(chan.connection_info(), "127.0.0.1;9000");
    }

    #[test]
    fn unknown_class_is_an_error() {
        let registry = ChannelRegistry::with_defaults();
        assert!(registry.create("carrier-pigeon", "a;1").is_err());
    }
}

//! Analyzer service address parsing and wildcard resolution

use crate::{Result, TopowatchError};
use std::fmt;
use std::net::IpAddr;
use topowatch_common::DEFAULT_ANALYZER_PORT;

/// A `HOST:PORT` pair as written in `analyzer.listen`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAddress {
    pub host: String,
    pub port: u16,
}

impl ServiceAddress {
    /// Accepts `HOST:PORT`, `[V6]:PORT`, `:PORT` (all interfaces) and a bare
    /// `PORT` (loopback).
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let invalid = || TopowatchError::InvalidAddress(value.to_string());

        if value.is_empty() {
            return Ok(Self {
                host: "127.0.0.1".to_string(),
                port: DEFAULT_ANALYZER_PORT,
            });
        }

        if let Ok(port) = value.parse::<u16>() {
            return Ok(Self {
                host: "127.0.0.1".to_string(),
                port,
            });
        }

        let (host, port) = value.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        if host.contains(':') && host.parse::<IpAddr>().is_err() {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Address a local client should use to reach a service bound here:
    /// wildcard binds are reached over loopback.
    pub fn connectable(&self) -> Self {
        let host = match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) if ip.is_unspecified() => "127.0.0.1".to_string(),
            Ok(IpAddr::V6(ip)) if ip.is_unspecified() => "::1".to_string(),
            _ => self.host.clone(),
        };
        Self {
            host,
            port: self.port,
        }
    }

    fn is_ipv6(&self) -> bool {
        matches!(self.host.parse::<IpAddr>(), Ok(IpAddr::V6(_)))
    }

    /// Base URL of the service
    pub fn url(&self, tls: bool) -> String {
        let scheme = if tls { "https" } else { "http" };
        format!("{}://{}", scheme, self)
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

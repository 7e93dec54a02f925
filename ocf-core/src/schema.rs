//! Resource links and endpoints as advertised by OCF discovery.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::SchemaError;

/// Transport scheme of an endpoint URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// `coap` over UDP
    Udp,
    /// `coaps` over DTLS
    UdpSecure,
    /// `coap+tcp`
    Tcp,
    /// `coaps+tcp` over TLS
    TcpSecure,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Udp => "coap",
            Scheme::UdpSecure => "coaps",
            Scheme::Tcp => "coap+tcp",
            Scheme::TcpSecure => "coaps+tcp",
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::UdpSecure | Scheme::TcpSecure)
    }

    pub fn default_port(&self) -> u16 {
        if self.is_secure() {
            5684
        } else {
            5683
        }
    }
}

impl FromStr for Scheme {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "coap" => Ok(Scheme::Udp),
            "coaps" => Ok(Scheme::UdpSecure),
            "coap+tcp" => Ok(Scheme::Tcp),
            "coaps+tcp" => Ok(Scheme::TcpSecure),
            _ => Err(SchemaError::UnknownScheme(s.to_string())),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved network address of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Addr {
    /// `host:port`, bracketing IPv6 literals.
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Canonical URI form, also used as the connection cache key.
    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme, self.host_port())
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// An endpoint entry of a resource link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "ep")]
    pub uri: String,
    #[serde(rename = "pri", default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u64>,
}

impl Endpoint {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            priority: None,
        }
    }

    /// Parse the endpoint URI into scheme, host and port.
    pub fn addr(&self) -> Result<Addr, SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidEndpoint {
            endpoint: self.uri.clone(),
            reason,
        };

        let url = Url::parse(&self.uri).map_err(|e| invalid(e.to_string()))?;
        let scheme: Scheme = url.scheme().parse()?;
        let host = match url.host() {
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            Some(host) => host.to_string(),
            None => return Err(invalid("missing host".to_string())),
        };
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        Ok(Addr { scheme, host, port })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

/// A discovered resource: where it lives and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceLink {
    pub href: String,
    #[serde(rename = "di", default)]
    pub device_id: String,
    #[serde(rename = "rt", default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<String>,
    #[serde(rename = "if", default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<String>,
    #[serde(rename = "eps", default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
}

impl ResourceLink {
    /// Endpoints ordered by ascending priority; entries without one go last.
    pub fn sorted_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints = self.endpoints.clone();
        endpoints.sort_by_key(|e| e.priority.unwrap_or(u64::MAX));
        endpoints
    }
}

/// Find the link for `href` among a device's discovered links.
pub fn get_resource_link(links: &[ResourceLink], href: &str) -> Result<ResourceLink, SchemaError> {
    links
        .iter()
        .find(|link| link.href == href)
        .cloned()
        .ok_or_else(|| SchemaError::ResourceLinkNotFound(href.to_string()))
}

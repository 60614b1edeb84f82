//! Server catalogue — bundled lists of public Electrum Cash servers.
//!
//! Entries are either URL strings or `{host, port, scheme?}` objects.
//! `http`/`https` are rewritten to `ws`/`wss`; anything else is rejected at
//! load time.

use serde::Deserialize;
use url::Url;

use crate::config::Network;
use crate::error::{Result, RpcError};

const MAINNET_SERVERS: &str = include_str!("../assets/servers.mainnet.json");
const TESTNET_SERVERS: &str = include_str!("../assets/servers.testnet.json");

/// A normalized `ws://` or `wss://` server URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint(String);

impl Endpoint {
    /// Parse and normalize a server URL.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut url = Url::parse(raw.trim())
            .map_err(|e| RpcError::InvalidConfig(format!("invalid server url '{raw}': {e}")))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(RpcError::InvalidConfig(format!(
                    "unsupported scheme '{other}' in '{raw}'"
                )))
            }
        };
        if url.scheme() != scheme {
            // Switching between special schemes is always permitted.
            url.set_scheme(scheme).map_err(|_| {
                RpcError::InvalidConfig(format!("cannot normalize scheme of '{raw}'"))
            })?;
        }
        if url.host_str().is_none() {
            return Err(RpcError::InvalidConfig(format!("server url '{raw}' has no host")));
        }
        Ok(Self(url.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CatalogEntry {
    Url(String),
    Host {
        host: String,
        port: u16,
        #[serde(default)]
        scheme: Option<String>,
    },
}

impl CatalogEntry {
    fn into_endpoint(self) -> Result<Endpoint> {
        match self {
            Self::Url(url) => Endpoint::parse(&url),
            Self::Host { host, port, scheme } => {
                let scheme = scheme.as_deref().unwrap_or("wss");
                Endpoint::parse(&format!("{scheme}://{host}:{port}"))
            }
        }
    }
}

/// Parse a catalogue document. Fails on the first invalid entry.
pub fn parse_catalog(json: &str) -> Result<Vec<Endpoint>> {
    let entries: Vec<CatalogEntry> = serde_json::from_str(json)
        .map_err(|e| RpcError::InvalidConfig(format!("invalid server catalogue: {e}")))?;
    entries.into_iter().map(CatalogEntry::into_endpoint).collect()
}

/// The bundled catalogue for `network`.
pub fn load_server_catalog(network: Network) -> Result<Vec<Endpoint>> {
    match network {
        Network::Mainnet => parse_catalog(MAINNET_SERVERS),
        Network::Testnet => parse_catalog(TESTNET_SERVERS),
    }
}

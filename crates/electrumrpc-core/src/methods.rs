//! Built-in Electrum Cash protocol methods.
//!
//! Enough of the catalogue to drive the client: the handshake and liveness
//! calls, fee and tip queries, and the three subscription families.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::method::{Method, MethodKind, SubscriptionMethod};
use crate::version::VersionRange;

/// Path of the version handshake.
pub const HANDSHAKE_PATH: &str = "server.version";

// ─── Server ───────────────────────────────────────────────────────────────────

/// `server.version` — negotiate the protocol version.
///
/// Replies `[server_software, protocol]` where `protocol` is one version or a
/// `[min, max]` pair.
#[derive(Debug, Clone)]
pub struct ServerVersion {
    pub client_name: String,
    pub protocol: VersionRange,
}

impl Method for ServerVersion {
    type Output = (String, Value);

    fn path(&self) -> &'static str {
        HANDSHAKE_PATH
    }

    fn params(&self) -> Vec<Value> {
        vec![Value::String(self.client_name.clone()), self.protocol.to_param()]
    }
}

/// `server.ping` — cheap liveness check.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerPing;

impl Method for ServerPing {
    type Output = ();

    fn path(&self) -> &'static str {
        "server.ping"
    }

    fn params(&self) -> Vec<Value> {
        vec![]
    }
}

/// Reply of `server.features`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFeatures {
    pub genesis_hash: String,
    #[serde(default)]
    pub hosts: Value,
    pub protocol_min: String,
    pub protocol_max: String,
    #[serde(default)]
    pub pruning: Option<u64>,
    pub server_version: String,
    #[serde(default)]
    pub hash_function: Option<String>,
    #[serde(default)]
    pub dsproof: Option<bool>,
    #[serde(default)]
    pub cashtokens: Option<bool>,
}

/// `server.features`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetServerFeatures;

impl Method for GetServerFeatures {
    type Output = ServerFeatures;

    fn path(&self) -> &'static str {
        "server.features"
    }

    fn params(&self) -> Vec<Value> {
        vec![]
    }
}

// ─── Fees ─────────────────────────────────────────────────────────────────────

/// `blockchain.relayfee` — minimum relay fee in BCH/kB.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayFee;

impl Method for RelayFee {
    type Output = f64;

    fn path(&self) -> &'static str {
        "blockchain.relayfee"
    }

    fn params(&self) -> Vec<Value> {
        vec![]
    }
}

/// `blockchain.estimatefee` — fee estimate for confirmation within `blocks`.
#[derive(Debug, Clone, Copy)]
pub struct EstimateFee {
    pub blocks: u32,
}

impl Method for EstimateFee {
    type Output = f64;

    fn path(&self) -> &'static str {
        "blockchain.estimatefee"
    }

    fn params(&self) -> Vec<Value> {
        vec![Value::from(self.blocks)]
    }
}

// ─── Headers ──────────────────────────────────────────────────────────────────

/// A block header at the chain tip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderTip {
    pub height: u64,
    pub hex: String,
}

/// `blockchain.headers.get_tip`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadersGetTip;

impl Method for HeadersGetTip {
    type Output = HeaderTip;

    fn path(&self) -> &'static str {
        "blockchain.headers.get_tip"
    }

    fn params(&self) -> Vec<Value> {
        vec![]
    }
}

/// `blockchain.headers.subscribe` — current tip, then every new tip.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadersSubscribe;

impl Method for HeadersSubscribe {
    type Output = HeaderTip;

    fn path(&self) -> &'static str {
        "blockchain.headers.subscribe"
    }

    fn params(&self) -> Vec<Value> {
        vec![]
    }

    fn kind(&self) -> MethodKind {
        MethodKind::Subscription
    }
}

impl SubscriptionMethod for HeadersSubscribe {
    type Notification = (HeaderTip,);

    fn unsubscribe_path(&self) -> Option<&'static str> {
        Some("blockchain.headers.unsubscribe")
    }
}

// ─── Addresses ────────────────────────────────────────────────────────────────

/// `blockchain.address.subscribe` — status hash of an address.
///
/// The status is `None` when the address has no history.
#[derive(Debug, Clone)]
pub struct AddressSubscribe {
    pub address: String,
}

impl AddressSubscribe {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into() }
    }
}

impl Method for AddressSubscribe {
    type Output = Option<String>;

    fn path(&self) -> &'static str {
        "blockchain.address.subscribe"
    }

    fn params(&self) -> Vec<Value> {
        vec![Value::String(self.address.clone())]
    }

    fn kind(&self) -> MethodKind {
        MethodKind::Subscription
    }
}

impl SubscriptionMethod for AddressSubscribe {
    /// `(address, status)`
    type Notification = (String, Option<String>);

    fn identifier(&self) -> Option<String> {
        Some(self.address.clone())
    }

    fn unsubscribe_path(&self) -> Option<&'static str> {
        Some("blockchain.address.unsubscribe")
    }
}

// ─── Double-spend proofs ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: String,
    pub vout: u32,
}

/// A double-spend proof for an unconfirmed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsProof {
    pub dspid: String,
    pub txid: String,
    pub hex: String,
    pub outpoint: OutPoint,
    #[serde(default)]
    pub descendants: Vec<String>,
}

/// `blockchain.transaction.dsproof.subscribe`.
#[derive(Debug, Clone)]
pub struct TransactionDsProofSubscribe {
    pub tx_hash: String,
}

impl TransactionDsProofSubscribe {
    pub fn new(tx_hash: impl Into<String>) -> Self {
        Self { tx_hash: tx_hash.into() }
    }
}

impl Method for TransactionDsProofSubscribe {
    type Output = Option<DsProof>;

    fn path(&self) -> &'static str {
        "blockchain.transaction.dsproof.subscribe"
    }

    fn params(&self) -> Vec<Value> {
        vec![Value::String(self.tx_hash.clone())]
    }

    fn kind(&self) -> MethodKind {
        MethodKind::Subscription
    }
}

impl SubscriptionMethod for TransactionDsProofSubscribe {
    /// `(tx_hash, proof)`
    type Notification = (String, Option<DsProof>);

    fn identifier(&self) -> Option<String> {
        Some(self.tx_hash.clone())
    }

    fn unsubscribe_path(&self) -> Option<&'static str> {
        Some("blockchain.transaction.dsproof.unsubscribe")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_params() {
        let m = ServerVersion {
            client_name: "electrumrpc".into(),
            protocol: VersionRange::default(),
        };
        assert_eq!(m.params(), vec![serde_json::json!("electrumrpc"), serde_json::json!(["1.4", "1.5.3"])]);
    }

    #[test]
    fn subscription_identifiers() {
        assert_eq!(HeadersSubscribe.identifier(), None);
        assert_eq!(AddressSubscribe::new("qabc").identifier().as_deref(), Some("qabc"));
        assert_eq!(
            TransactionDsProofSubscribe::new("ff").unsubscribe_params(),
            vec![serde_json::json!("ff")]
        );
        assert!(HeadersSubscribe.unsubscribe_params().is_empty());
    }

    #[test]
    fn kinds() {
        assert_eq!(RelayFee.kind(), MethodKind::Unary);
        assert_eq!(HeadersSubscribe.kind(), MethodKind::Subscription);
    }
}

//! Method traits — the boundary to the RPC method catalogue.
//!
//! The client never inspects parameters or results beyond what these traits
//! expose: a dotted method path, positional parameters, the method kind and
//! the typed shape of the result.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Whether a method yields one response or a push stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    Subscription,
}

impl std::fmt::Display for MethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unary => write!(f, "unary"),
            Self::Subscription => write!(f, "subscription"),
        }
    }
}

/// An RPC method the client can send.
pub trait Method: Send + Sync {
    /// Decoded shape of the (initial) response.
    type Output: DeserializeOwned + Send + 'static;

    /// Dotted method path, e.g. `"blockchain.headers.get_tip"`.
    fn path(&self) -> &'static str;

    /// Positional parameters.
    fn params(&self) -> Vec<Value>;

    fn kind(&self) -> MethodKind {
        MethodKind::Unary
    }
}

/// A method that opens a push stream after its initial response.
pub trait SubscriptionMethod: Method {
    /// Decoded shape of one push notification's `params`.
    type Notification: DeserializeOwned + Send + 'static;

    /// Per-subscription discriminator carried as the first notification
    /// parameter (address, transaction hash). `None` for global streams
    /// such as block headers.
    fn identifier(&self) -> Option<String> {
        None
    }

    /// Method path that cancels this subscription server-side, if any.
    fn unsubscribe_path(&self) -> Option<&'static str> {
        None
    }

    /// Parameters for the unsubscribe request.
    fn unsubscribe_params(&self) -> Vec<Value> {
        self.identifier().map(Value::String).into_iter().collect()
    }
}

//! Crate-level error type for callers that do not care which subsystem
//! failed.

use thiserror::Error;

use crate::bloom::BloomError;
use crate::crypto::{KeyError, SignatureError};
use crate::money::MoneyError;
use crate::receipts::ReceiptError;
use crate::router::RouterError;
use crate::routing::RoutingError;
use crate::transport::{TransportError, TunnelError};

#[derive(Debug, Error)]
pub enum AutoRouteError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Receipt(#[from] ReceiptError),

    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Bloom(#[from] BloomError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("node is closed")]
    Closed,
}

pub type Result<T, E = AutoRouteError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha512;
    use crate::crypto::NodeAddress;

    #[test]
    fn subsystem_errors_stay_distinguishable() {
        let addr = NodeAddress::from_bytes(sha512(b"x"));
        let err: AutoRouteError = RoutingError::NoRoute(addr).into();
        assert!(matches!(err, AutoRouteError::Routing(RoutingError::NoRoute(_))));

        let err: AutoRouteError = RouterError::DuplicateConnection(addr).into();
        assert!(err.to_string().contains("already connected"));

        let err: AutoRouteError = TransportError::StreamClosed.into();
        assert!(matches!(err, AutoRouteError::Transport(TransportError::StreamClosed)));
    }
}

use thiserror::Error;

use parley_net::NetError;
use parley_store::StoreError;

/// Errors surfaced by the session layer.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Local cache failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// REST or live-connection failure.
    #[error("Network error: {0}")]
    Net(#[from] NetError),
}

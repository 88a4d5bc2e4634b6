//! # parley-client
//!
//! Chat sync engine: reconciles a locally cached message history with
//! the paginated REST history API and the live WebSocket stream, and
//! exposes the [`ChatSession`] facade the UI layer drives.

pub mod session;
pub mod sync;

mod error;

pub use error::ClientError;
pub use session::{ChatSession, SessionConfig};
pub use sync::{reconcile, SyncConfig};

use tracing_subscriber::{fmt, EnvFilter};

/// Install the default tracing subscriber for an embedding application.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("parley_client=debug,parley_net=debug,parley_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

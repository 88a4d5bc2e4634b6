// REST history fetching and the multiplexed live connection.

pub mod credentials;
pub mod live;
pub mod rest;
pub mod transport;

mod error;

pub use credentials::{BearerAuth, CookieAuth, CredentialProvider};
pub use error::NetError;
pub use live::{ConnectionState, LiveConnection, ReconnectPolicy, Subscription};
pub use rest::{ChatApi, RestClient};
pub use transport::{Connector, FrameSender, Transport, WsConnector};

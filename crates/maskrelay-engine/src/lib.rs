pub mod config;
pub mod driver;
pub mod encoder;
pub mod inputs;
pub mod mask;
pub mod normalize;
pub mod probe;
pub mod reply;
pub mod store;
pub mod transport;

pub use config::{RequestOptions, ServerConfig, TransportKind};
pub use driver::{new_run_id, BatchDriver, BatchOutcome};
pub use mask::NormalizedMask;
pub use normalize::{normalize, Normalized};
pub use reply::RawReply;
pub use store::{BatchState, ResultStore};
pub use transport::{Channel, Connector, ExchangeError, ExchangeErrorKind, ServerConnector};

pub mod connection;
pub mod error;
pub mod shutdown;

pub use connection::{ConnectionManager, ConnectionState, InboundHandler, LinkConfig};
pub use error::{FluxError, Result};
pub use shutdown::ShutdownSignal;

pub mod supervisor;
pub mod transport;

pub use supervisor::{StreamState, StreamSupervisor};
pub use transport::WsTransport;

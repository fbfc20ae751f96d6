//! Answers loading requests from the cache and the network.

mod cachable;
pub mod delegate;
pub mod request;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use delegate::ResourceLoader;
pub use request::{DataRequest, LoadingEvent, LoadingRequest};
pub use transport::{HttpTransport, Transport, TransportError, TransportRequest, TransportResponse};

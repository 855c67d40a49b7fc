//! Swift client implementations.

pub mod http;
pub mod memory;

pub use http::HttpSwiftClient;
pub use memory::{MemorySwift, RequestCounts};

//! HTTP lookup API
//!
//! IPv4 addresses are answered from the key-value cache, IPv6 addresses
//! from the published range index.

pub mod handlers;
pub mod routes;

pub use handlers::AppState;
pub use routes::create_api_router;

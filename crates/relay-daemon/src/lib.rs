//! Upload relay daemon: accepts base64-encoded file payloads over HTTP and
//! brokers them to the external blob store.

pub mod middleware;
pub mod server;
pub mod telemetry;

//! Infrastructure layer: sockets and live link I/O. Discovery broadcasts,
//! the per-peer transport link, and the provider that orchestrates both
//! into the application layer's registry and router.

pub mod discovery;
pub mod link;
pub mod provider;

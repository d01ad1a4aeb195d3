mod batch;
mod blocking;
mod cluster;
mod handshake;
mod multiplexing;
mod prepared;
pub(crate) mod utils;

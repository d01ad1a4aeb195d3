pub mod blocking;
mod builder;
mod config;
mod session;

pub use builder::ClientBuilder;
pub use config::{ClientConfig, DEFAULT_PORT};
pub use session::Client;

pub use cassandra_cql::frame::compression::Compression;

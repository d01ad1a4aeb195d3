//! Async Rust driver for [Apache Cassandra®](https://cassandra.apache.org/)
//! speaking the CQL native protocol, versions 2 to 4.
//!
//! # Driver overview
//! ### Connecting
//! All driver activity revolves around the [Client].\
//! A `Client` is created by specifying a few seed nodes and connecting to them.
//! The rest of the cluster is found through `system.peers`:
//!
//! ```rust,no_run
//! use cassandra_driver::{Client, ClientBuilder};
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let client: Client = ClientBuilder::new()
//!         .host("127.0.0.1")
//!         .host("10.0.0.2")
//!         .build()
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Making queries
//! Statements can be run unprepared with [`Client::execute`], or prepared
//! once with [`Client::prepare`] and run many times with
//! [`Client::execute_prepared`]. Several statements can be sent at once in a
//! [`Batch`](statement::batch::Batch):
//!
//! ```rust,no_run
//! # use cassandra_driver::{Client, CqlValue, ExecuteOptions};
//! # use cassandra_driver::statement::batch::BatchType;
//! # async fn example(client: &Client) -> Result<(), Box<dyn std::error::Error>> {
//! let insert = client.prepare("INSERT INTO ks.t (id, v) VALUES (?, ?)").await?;
//! client
//!     .execute_prepared(&insert, &[CqlValue::Int(9), CqlValue::Text("qux".into())], &ExecuteOptions::default())
//!     .await?;
//!
//! let mut batch = client.batch(BatchType::Logged, ExecuteOptions::default());
//! batch
//!     .add_prepared(&insert, vec![CqlValue::Int(8), CqlValue::Text("baz".into())])
//!     .add_query("DELETE FROM ks.t WHERE id = 7", vec![]);
//! batch.execute(client, &ExecuteOptions::default()).await?;
//! assert!(batch.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod frame {
    pub use cassandra_cql::frame::{compression, frame_errors, types, value, ProtocolVersion};

    pub mod response {
        pub use cassandra_cql::frame::response::error::{DbError, WriteType};
        pub use cassandra_cql::frame::response::event;

        pub mod result {
            pub use cassandra_cql::frame::response::result::{
                ColumnSpec, PreparedMetadata, ResultMetadata, Row, TableSpec,
            };
        }
    }
}

pub mod authentication;
pub mod client;
pub mod errors;
pub mod network;
pub mod policies;
pub mod response;
pub mod statement;

pub use cassandra_cql::{ColumnType, Consistency, CqlValue, ProtocolVersion, SerialConsistency};

pub use client::{Client, ClientBuilder, ClientConfig, Compression};
pub use response::{BatchResult, QueryResult};
pub use statement::batch::{Batch, BatchPart, BatchType};
pub use statement::prepared::PreparedStatement;
pub use statement::ExecuteOptions;

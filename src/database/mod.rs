//! Logical database settings and the connections used to take consistent dumps.

mod configuration;
mod connection;

pub use configuration::{collect_overrides, DatabaseConfiguration, DUMP_FILE_SUFFIX, MAIN_DATABASE};
pub use connection::{connect_options, DatabaseAdapter, PgAdapter, SnapshotConnection};

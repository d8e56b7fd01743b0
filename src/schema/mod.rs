//! Schema state across shards: the migration ledger, live introspection,
//! drift comparison and coordinated migrations.
//!
//! ```text
//!   ShardedMigrationCoordinator ──▶ MigrationHistoryStore (ledger per shard)
//!              │
//!              └──────────────────▶ ConnectionFactory (up/down scripts)
//!
//!   SchemaComparer ──▶ SchemaIntrospector ──▶ ShardSchema ──▶ SchemaDiff
//! ```
//!
//! Comparison is read-only; only the coordinator mutates shards.

mod compare;
mod coordinator;
mod history;
mod introspect;

pub use compare::{ColumnMismatch, SchemaComparer, SchemaDiff, SchemaDriftReport};
pub use coordinator::{MigrationOutcome, MigrationReport, MigrationStrategy, ShardedMigrationCoordinator};
pub use history::{
    InMemoryMigrationHistoryStore, Migration, MigrationHistoryStore, MigrationRecord,
    SqlMigrationHistoryStore, DEFAULT_HISTORY_TABLE,
};
pub use introspect::{
    ColumnSchema, InMemorySchemaIntrospector, SchemaIntrospector, ShardSchema, SqlSchemaIntrospector,
    TableSchema,
};

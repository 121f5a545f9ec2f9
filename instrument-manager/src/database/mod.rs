// Database access
//
// - connection: sqlx pool, credentials, connection probing
// - schema_inspector: read-only information_schema and registry lookups
// - consistency: definition-vs-schema and definition-vs-pages verdicts

pub mod connection;
pub mod consistency;
pub mod schema_inspector;

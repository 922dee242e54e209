//! redb table definitions.

use redb::TableDefinition;

/// Function apps (with compositions, deployments and layouts) keyed by app id.
pub const FUNCTION_APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("function_apps");

//! redb table definitions for the TierGrid state store.
//!
//! Keys are `&str`; record tables hold JSON-serialized values.

use redb::TableDefinition;

/// Provisioned resources keyed by graph step id (`network`, `pool:web`, ...).
pub const RESOURCES: TableDefinition<&str, &[u8]> = TableDefinition::new("resources");

/// Discovery records keyed by parameter path (`/wordbash/ws_endpoint`).
pub const PARAMETERS: TableDefinition<&str, &[u8]> = TableDefinition::new("parameters");

/// Last version of each retracted parameter, so a republish continues the
/// version sequence instead of restarting at 1.
pub const RETIRED_VERSIONS: TableDefinition<&str, u64> = TableDefinition::new("retired_versions");

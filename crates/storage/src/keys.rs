//! Key layout of the durable backend
//!
//! Every key ends with `/` so a prefix scan over `X/` never matches `X`
//! itself or a sibling that merely shares `X` as a string prefix.
//!
//! | Keyspace | Key |
//! |----------|-----|
//! | server cache leaf | `/<path>/` (root leaf is `/`) |
//! | user write record | `$user_write_records/<write_id>/` |
//! | tracked query | `$tracked_queries/<query_id>/` |
//! | tracked query key | `$tracked_query_keys/<query_id>/<key>/` |

use tidepool_core::{Path, VALUE_KEY};

/// Prefix of persisted user write records
pub const USER_WRITE_RECORDS_PREFIX: &str = "$user_write_records/";
/// Prefix of persisted tracked queries
pub const TRACKED_QUERIES_PREFIX: &str = "$tracked_queries/";
/// Prefix of persisted tracked query key sets
pub const TRACKED_QUERY_KEYS_PREFIX: &str = "$tracked_query_keys/";

const SEPARATOR: char = '/';

/// Prefix covering the server cache at and below `path`.
pub fn server_cache_prefix(path: &Path) -> String {
    if path.is_empty() {
        return SEPARATOR.to_string();
    }
    format!("{SEPARATOR}{path}{SEPARATOR}")
}

/// Key of the leaf stored at `path`. A trailing `.value` segment addresses
/// the node's own leaf, so it is stripped.
pub fn server_cache_key(path: &Path) -> String {
    if path.base_name() == VALUE_KEY {
        server_cache_prefix(&path.parent())
    } else {
        server_cache_prefix(path)
    }
}

/// Location addressed by a server cache key.
pub fn server_cache_path(key: &str) -> Path {
    Path::new(key)
}

/// Key of the user write record `write_id`.
pub fn user_write_key(write_id: i64) -> String {
    format!("{USER_WRITE_RECORDS_PREFIX}{write_id}{SEPARATOR}")
}

/// Key of the tracked query `query_id`.
pub fn tracked_query_key(query_id: u64) -> String {
    format!("{TRACKED_QUERIES_PREFIX}{query_id}{SEPARATOR}")
}

/// Prefix of every tracked key of `query_id`.
pub fn tracked_query_keys_prefix(query_id: u64) -> String {
    format!("{TRACKED_QUERY_KEYS_PREFIX}{query_id}{SEPARATOR}")
}

/// Key recording that `query_id` tracks the child `key`.
pub fn tracked_query_key_entry(query_id: u64, key: &str) -> String {
    format!("{}{key}{SEPARATOR}", tracked_query_keys_prefix(query_id))
}

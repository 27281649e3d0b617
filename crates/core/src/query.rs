//! Query descriptions and persisted bookkeeping records

use crate::compound_write::CompoundWrite;
use crate::path::Path;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Ordering applied to a query's children
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OrderBy {
    /// By priority, then key
    #[default]
    Priority,
    /// By child key
    Key,
    /// By child value
    Value,
    /// By the value of a named grandchild
    Child(String),
}

/// One end of a query range
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryBound {
    /// Ordering value at the bound
    pub value: Value,
    /// Tie-breaking child key
    pub child_key: Option<String>,
}

impl QueryBound {
    /// A bound on `value` alone.
    pub fn new(value: impl Into<Value>) -> Self {
        QueryBound {
            value: value.into(),
            child_key: None,
        }
    }

    /// A bound on `value` with a tie-breaking key.
    pub fn with_key(value: impl Into<Value>, child_key: impl Into<String>) -> Self {
        QueryBound {
            value: value.into(),
            child_key: Some(child_key.into()),
        }
    }
}

/// Filtering and ordering parameters of a query
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryParams {
    /// Child ordering
    pub order_by: OrderBy,
    /// Inclusive lower bound
    pub start_at: Option<QueryBound>,
    /// Inclusive upper bound
    pub end_at: Option<QueryBound>,
    /// Exact match
    pub equal_to: Option<QueryBound>,
    /// Keep only the first N children
    pub limit_first: Option<u32>,
    /// Keep only the last N children
    pub limit_last: Option<u32>,
}

impl QueryParams {
    /// True when no bound or limit restricts the result.
    pub fn loads_all_data(&self) -> bool {
        self.start_at.is_none()
            && self.end_at.is_none()
            && self.equal_to.is_none()
            && self.limit_first.is_none()
            && self.limit_last.is_none()
    }

    /// True for the canonical unfiltered parameters.
    pub fn is_default(&self) -> bool {
        self.loads_all_data() && self.order_by == OrderBy::Priority
    }

    /// Builder: set the ordering.
    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = order_by;
        self
    }

    /// Builder: set the lower bound.
    pub fn start_at(mut self, bound: QueryBound) -> Self {
        self.start_at = Some(bound);
        self
    }

    /// Builder: set the upper bound.
    pub fn end_at(mut self, bound: QueryBound) -> Self {
        self.end_at = Some(bound);
        self
    }

    /// Builder: require an exact match.
    pub fn equal_to(mut self, bound: QueryBound) -> Self {
        self.equal_to = Some(bound);
        self
    }

    /// Builder: keep the first `n` children.
    pub fn limit_first(mut self, n: u32) -> Self {
        self.limit_first = Some(n);
        self
    }

    /// Builder: keep the last `n` children.
    pub fn limit_last(mut self, n: u32) -> Self {
        self.limit_last = Some(n);
        self
    }
}

/// A location plus the parameters filtering it
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Location of the query
    pub path: Path,
    /// Filters applied at `path`
    pub params: QueryParams,
}

impl QuerySpec {
    /// The default (unfiltered) query at `path`.
    pub fn new(path: impl Into<Path>) -> Self {
        QuerySpec {
            path: path.into(),
            params: QueryParams::default(),
        }
    }

    /// A query at `path` with explicit parameters.
    pub fn with_params(path: impl Into<Path>, params: QueryParams) -> Self {
        QuerySpec {
            path: path.into(),
            params,
        }
    }

    /// See [`QueryParams::loads_all_data`].
    pub fn loads_all_data(&self) -> bool {
        self.params.loads_all_data()
    }

    /// See [`QueryParams::is_default`].
    pub fn is_default(&self) -> bool {
        self.params.is_default()
    }

    /// Same query with any loads-all-data parameters replaced by the
    /// default parameters.
    pub fn normalized(&self) -> QuerySpec {
        if self.loads_all_data() {
            QuerySpec::new(self.path.clone())
        } else {
            self.clone()
        }
    }
}

/// Persisted record of a watched query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedQuery {
    /// Stable identifier
    pub query_id: u64,
    /// Normalized query
    pub query_spec: QuerySpec,
    /// Milliseconds since the epoch of the last activity change
    pub last_use: u64,
    /// Cached data fully represents the query's server value
    pub complete: bool,
    /// A listener currently watches the query
    pub active: bool,
}

impl TrackedQuery {
    /// Build a record.
    pub fn new(
        query_id: u64,
        query_spec: QuerySpec,
        last_use: u64,
        complete: bool,
        active: bool,
    ) -> Self {
        TrackedQuery {
            query_id,
            query_spec,
            last_use,
            complete,
            active,
        }
    }

    /// Copy with a new `last_use` and activity flag.
    pub fn updated_last_use(&self, last_use: u64, active: bool) -> Self {
        TrackedQuery {
            last_use,
            active,
            ..self.clone()
        }
    }

    /// Copy marked complete.
    pub fn set_complete(&self) -> Self {
        TrackedQuery {
            complete: true,
            ..self.clone()
        }
    }
}

/// Payload of a locally originated write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UserWrite {
    /// Replace the value at the path
    Overwrite(Value),
    /// Apply each contained write relative to the path
    Merge(CompoundWrite),
}

/// Persisted, not yet acknowledged local write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserWriteRecord {
    /// Ordering key assigned by the caller
    pub write_id: i64,
    /// Location of the write
    pub path: Path,
    /// Overwrite or merge payload
    pub write: UserWrite,
    /// Whether the write is visible to local reads
    pub visible: bool,
}

impl UserWriteRecord {
    /// Record for an overwrite.
    pub fn overwrite(write_id: i64, path: Path, value: Value, visible: bool) -> Self {
        UserWriteRecord {
            write_id,
            path,
            write: UserWrite::Overwrite(value),
            visible,
        }
    }

    /// Record for a merge; merges are always visible.
    pub fn merge(write_id: i64, path: Path, merge: CompoundWrite) -> Self {
        UserWriteRecord {
            write_id,
            path,
            write: UserWrite::Merge(merge),
            visible: true,
        }
    }

    /// True for overwrites.
    pub fn is_overwrite(&self) -> bool {
        matches!(self.write, UserWrite::Overwrite(_))
    }

    /// Overwrite payload, if this is an overwrite.
    pub fn overwrite_value(&self) -> Option<&Value> {
        match &self.write {
            UserWrite::Overwrite(value) => Some(value),
            UserWrite::Merge(_) => None,
        }
    }

    /// Merge payload, if this is a merge.
    pub fn merge_write(&self) -> Option<&CompoundWrite> {
        match &self.write {
            UserWrite::Merge(merge) => Some(merge),
            UserWrite::Overwrite(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params() {
        let params = QueryParams::default();
        assert!(params.loads_all_data());
        assert!(params.is_default());
    }

    #[test]
    fn test_ordering_alone_still_loads_all_data() {
        let params = QueryParams::default().order_by(OrderBy::Key);
        assert!(params.loads_all_data());
        assert!(!params.is_default());

        let spec = QuerySpec::with_params("a", params);
        assert_eq!(spec.normalized(), QuerySpec::new("a"));
    }

    #[test]
    fn test_filtered_params_are_not_normalized() {
        let params = QueryParams::default()
            .order_by(OrderBy::Child("score".to_string()))
            .start_at(QueryBound::new(10))
            .limit_first(5);
        assert!(!params.loads_all_data());
        let spec = QuerySpec::with_params("a", params.clone());
        assert_eq!(spec.normalized().params, params);
    }

    #[test]
    fn test_params_are_ordered_map_keys() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(QueryParams::default(), 1);
        map.insert(QueryParams::default().limit_last(2), 2);
        map.insert(
            QueryParams::default().equal_to(QueryBound::with_key(1.5, "k")),
            3,
        );
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&QueryParams::default().limit_last(2)), Some(&2));
    }

    #[test]
    fn test_tracked_query_updates() {
        let query = TrackedQuery::new(1, QuerySpec::new("a"), 10, false, true);
        let idle = query.updated_last_use(20, false);
        assert_eq!(idle.last_use, 20);
        assert!(!idle.active);
        assert!(idle.set_complete().complete);
        assert_eq!(idle.query_id, 1);
    }

    #[test]
    fn test_user_write_record_accessors() {
        let overwrite = UserWriteRecord::overwrite(1, Path::new("a"), Value::Int(1), true);
        assert!(overwrite.is_overwrite());
        assert_eq!(overwrite.overwrite_value(), Some(&Value::Int(1)));
        assert!(overwrite.merge_write().is_none());

        let merge = UserWriteRecord::merge(
            2,
            Path::new("b"),
            CompoundWrite::new().add_write(&Path::new("c"), Value::Int(2)),
        );
        assert!(!merge.is_overwrite());
        assert!(merge.visible);
        assert!(merge.merge_write().is_some());
    }

    #[test]
    fn test_records_msgpack_round_trip() {
        let query = TrackedQuery::new(
            7,
            QuerySpec::with_params(
                "rooms",
                QueryParams::default().end_at(QueryBound::new("z")).limit_first(3),
            ),
            99,
            true,
            false,
        );
        let bytes = rmp_serde::to_vec_named(&query).unwrap();
        assert_eq!(rmp_serde::from_slice::<TrackedQuery>(&bytes).unwrap(), query);
    }
}

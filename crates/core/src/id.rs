//! Identifiers for the entities a script step runs under.
//!
//! Each id is a `domain-key` UUID wrapper with its own domain marker, so an
//! [`ExecutionId`] is never accepted where a [`NodeId`] is expected. Ids are
//! `Copy`, display and serialize as hyphenated UUID strings, and parse back
//! with `parse`.

use domain_key::define_uuid;

pub use domain_key::UuidParseError;

// Keys per-execution static data and the UI log channel.
define_uuid!(pub ExecutionIdDomain => ExecutionId);
// Identifies the Code step that failed in a step error.
define_uuid!(pub NodeIdDomain => NodeId);

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    #[test]
    fn fresh_ids_are_distinct() {
        let ids: BTreeSet<ExecutionId> = (0..16).map(|_| ExecutionId::v4()).collect();
        assert_eq!(ids.len(), 16);
        assert!(ids.iter().all(|id| !id.is_nil()));
    }

    #[test]
    fn node_id_survives_display_and_parse() {
        let id = NodeId::v4();
        assert_eq!(NodeId::parse(&id.to_string()).unwrap(), id);
        assert!(NodeId::parse("step-1").is_err());
    }

    #[test]
    fn execution_id_is_a_plain_json_string() {
        let id = ExecutionId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::json!("550e8400-e29b-41d4-a716-446655440000"));
        assert_eq!(serde_json::from_value::<ExecutionId>(json).unwrap(), id);
    }
}

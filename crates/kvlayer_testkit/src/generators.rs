//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data
//! that maintains required invariants.

use kvlayer_core::{IndexKey, KeyField, RecordId};
use proptest::prelude::*;

/// Strategy for generating record ids that are not sentinels.
pub fn record_id_strategy() -> impl Strategy<Value = RecordId> {
    (1u64..1_000_000).prop_map(RecordId::new)
}

/// Strategy for generating valid idents.
pub fn ident_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,15}").expect("Invalid regex")
}

/// Strategy for generating record payloads.
pub fn record_data_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

/// Strategy for generating a single key field of any type.
pub fn key_field_strategy() -> impl Strategy<Value = KeyField> {
    prop_oneof![
        Just(KeyField::Null),
        any::<bool>().prop_map(KeyField::Bool),
        any::<i64>().prop_map(KeyField::Int),
        prop::string::string_regex("[a-z]{0,8}")
            .expect("Invalid regex")
            .prop_map(KeyField::Str),
    ]
}

/// Strategy for generating index keys with `fields` fields.
pub fn index_key_strategy(fields: usize) -> impl Strategy<Value = IndexKey> {
    prop::collection::vec(key_field_strategy(), fields).prop_map(IndexKey::new)
}

/// Strategy for generating index entries on a single-field index.
pub fn index_entries_strategy(max: usize) -> impl Strategy<Value = Vec<(IndexKey, RecordId)>> {
    prop::collection::vec((index_key_strategy(1), record_id_strategy()), 0..max)
}

/// A step of a nested unit-of-work script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkStep {
    /// Begin a (possibly nested) unit of work.
    Begin,
    /// Register a change at the current depth.
    Register,
    /// Commit the innermost unit of work.
    Commit,
    /// End the innermost unit of work without committing.
    Abort,
}

/// Strategy for generating well-nested unit-of-work scripts.
///
/// Every script begins at depth 0, never ends more units than it began and
/// only registers changes inside a unit.
pub fn unit_of_work_script_strategy(
    max_steps: usize,
) -> impl Strategy<Value = Vec<UnitOfWorkStep>> {
    prop::collection::vec(0u8..4, 0..max_steps).prop_map(|raw| {
        let mut depth = 0usize;
        let mut script = Vec::with_capacity(raw.len() + 4);
        for choice in raw {
            let step = match (choice, depth) {
                (0, _) | (_, 0) => UnitOfWorkStep::Begin,
                (1, _) => UnitOfWorkStep::Register,
                (2, _) => UnitOfWorkStep::Commit,
                _ => UnitOfWorkStep::Abort,
            };
            match step {
                UnitOfWorkStep::Begin => depth += 1,
                UnitOfWorkStep::Commit | UnitOfWorkStep::Abort => depth -= 1,
                UnitOfWorkStep::Register => {}
            }
            script.push(step);
        }
        script.extend(std::iter::repeat(UnitOfWorkStep::Commit).take(depth));
        script
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::test_runner::TestRunner;

    #[test]
    fn scripts_are_well_nested() {
        let mut runner = TestRunner::default();
        runner
            .run(&unit_of_work_script_strategy(32), |script| {
                let mut depth = 0i32;
                for step in &script {
                    match step {
                        UnitOfWorkStep::Begin => depth += 1,
                        UnitOfWorkStep::Register => prop_assert!(depth > 0),
                        UnitOfWorkStep::Commit | UnitOfWorkStep::Abort => depth -= 1,
                    }
                    prop_assert!(depth >= 0);
                }
                prop_assert_eq!(depth, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn record_ids_are_normal() {
        let mut runner = TestRunner::default();
        runner
            .run(&record_id_strategy(), |id| {
                prop_assert!(id.is_normal());
                Ok(())
            })
            .unwrap();
    }
}

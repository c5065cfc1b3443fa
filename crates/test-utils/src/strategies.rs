//! Proptest strategies for table records and query operands.
//!
//! Reusable generators for property-based testing across crates. Records are
//! plain `BTreeMap<String, Vec<u8>>` values so this crate does not depend on
//! the store itself.
//!
//! # Usage
//!
//! ```no_run
//! use tabula_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(record in strategies::arb_record()) {
//!         // store the record and check an invariant
//!     }
//! }
//! ```

use std::collections::BTreeMap;

use proptest::prelude::*;

/// A record as a map from column name to value.
pub type Record = BTreeMap<String, Vec<u8>>;

/// Generates a primary key of 1-24 arbitrary bytes.
pub fn arb_primary_key() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..24)
}

/// Generates a printable primary key matching `[a-z0-9]{1,12}`.
pub fn arb_text_key() -> impl Strategy<Value = Vec<u8>> {
    "[a-z0-9]{1,12}".prop_map(String::into_bytes)
}

/// Generates a column name from a small fixed set, so generated records
/// share columns often.
pub fn arb_column_name() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "name".to_string(),
        "age".to_string(),
        "city".to_string(),
        "tags".to_string(),
        "note".to_string(),
    ])
}

/// Generates an arbitrary column value of 0-63 bytes.
pub fn arb_value() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..64)
}

/// Generates a decimal number as text, sometimes with a fraction or sign.
pub fn arb_number_text() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        (-10_000i64..10_000).prop_map(|n| n.to_string().into_bytes()),
        (-1000.0f64..1000.0).prop_map(|n| format!("{n:.3}").into_bytes()),
    ]
}

/// Generates space-separated words drawn from a small vocabulary.
pub fn arb_token_text() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(
        prop::sample::select(vec!["red", "green", "blue", "fast", "slow", "tall"]),
        0..4,
    )
    .prop_map(|words| words.join(" ").into_bytes())
}

/// Generates a record of 0-5 columns with arbitrary values.
pub fn arb_record() -> impl Strategy<Value = Record> {
    proptest::collection::btree_map(arb_column_name(), arb_value(), 0..5)
}

/// Generates a record with a numeric `age`, a word list in `tags` and a
/// short text `name`, each present with high probability.
pub fn arb_queryable_record() -> impl Strategy<Value = Record> {
    (
        proptest::option::weighted(0.9, arb_number_text()),
        proptest::option::weighted(0.9, arb_token_text()),
        proptest::option::weighted(0.9, "[a-e]{0,6}".prop_map(String::into_bytes)),
    )
        .prop_map(|(age, tags, name)| {
            let mut record = Record::new();
            if let Some(age) = age {
                record.insert("age".to_string(), age);
            }
            if let Some(tags) = tags {
                record.insert("tags".to_string(), tags);
            }
            if let Some(name) = name {
                record.insert("name".to_string(), name);
            }
            record
        })
}

/// Generates a batch of distinct text keys, each with a queryable record.
pub fn arb_table_contents(max: usize) -> impl Strategy<Value = BTreeMap<Vec<u8>, Record>> {
    proptest::collection::btree_map(arb_text_key(), arb_queryable_record(), 0..max)
}

//! Property-based tests for key escaping.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeMap;

use proptest::prelude::*;
use serde::{Deserialize, Serialize};

use shipyard_core::{decode_key, encode_key};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Doc {
    #[serde(with = "shipyard_core::escape::escaped_keys")]
    types: BTreeMap<String, u32>,
}

/// Keys built from the characters that matter to the escape scheme.
fn arb_key() -> impl Strategy<Value = String> {
    "[a-z.~tp]{0,24}"
}

proptest! {
    #[test]
    fn decode_inverts_encode(key in any::<String>()) {
        prop_assert_eq!(decode_key(&encode_key(&key)), key);
    }

    #[test]
    fn encoded_keys_have_no_dots(key in arb_key()) {
        prop_assert!(!encode_key(&key).contains('.'));
    }

    #[test]
    fn encoding_is_injective(a in arb_key(), b in arb_key()) {
        prop_assume!(a != b);
        prop_assert_ne!(encode_key(&a), encode_key(&b));
    }

    #[test]
    fn documents_survive_storage(keys in prop::collection::btree_set(arb_key(), 0..8)) {
        let doc = Doc {
            types: keys.into_iter().zip(0u32..).collect(),
        };
        let stored = serde_json::to_value(&doc).unwrap();
        let stored_keys = stored["types"].as_object().unwrap();
        prop_assert!(stored_keys.keys().all(|k| !k.contains('.')));
        prop_assert_eq!(stored_keys.len(), doc.types.len());

        let back: Doc = serde_json::from_value(stored).unwrap();
        prop_assert_eq!(back, doc);
    }
}

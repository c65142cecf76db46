//! Property-based tests for routing keys and topic matching
//!
//! - Derived keys only contain ASCII alphanumerics and '.'
//! - Derivation is deterministic and idempotent
//! - A derived key always matches its own binding and `#`

use broker_adapter::routing::topic_matches;
use broker_adapter::{derive_routing_key, RoutingKey};
use proptest::prelude::*;

/// Strategy for Rust-like type paths
fn type_path_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[A-Z][A-Za-z0-9]{0,8}", 1..4).prop_map(|parts| parts.join("::"))
}

proptest! {
    #[test]
    fn prop_derived_key_charset(name in any::<String>()) {
        let key = derive_routing_key(&name);
        prop_assert!(key.as_str().chars().all(|c| c.is_ascii_alphanumeric() || c == '.'));
    }

    #[test]
    fn prop_derivation_is_stable(name in any::<String>()) {
        let first = RoutingKey::derive(&name);
        prop_assert_eq!(&first, &RoutingKey::derive(&name));
        prop_assert_eq!(RoutingKey::derive(first.as_str()), first);
    }

    #[test]
    fn prop_type_path_keeps_segments(path in type_path_strategy()) {
        let key = RoutingKey::validated(&path).unwrap();
        prop_assert_eq!(key.as_str(), path.replace("::", "."));
    }

    #[test]
    fn prop_key_matches_own_binding(path in type_path_strategy()) {
        let key = derive_routing_key(&path);
        prop_assert!(topic_matches(key.as_str(), key.as_str()));
        prop_assert!(topic_matches("#", key.as_str()));
    }
}

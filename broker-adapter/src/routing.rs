//! Routing key derivation and topic pattern matching
//!
//! AMQP 0.9.1 topic words may only contain `A-Z`, `a-z` and `0-9`, separated
//! by `.`. Message type names are hierarchical (`Orders::Created`), so the
//! hierarchy separator maps onto the word delimiter and anything else that is
//! not allowed collapses to the delimiter too.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Word delimiter in routing keys
pub const DELIMITER: char = '.';

/// Hierarchy separator in message type names
pub const HIERARCHY_SEPARATOR: &str = "::";

/// Broker routing key derived from a message type name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Derive a routing key. Pure and total.
    pub fn derive(type_name: &str) -> Self {
        let key = type_name
            .replace(HIERARCHY_SEPARATOR, ".")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { DELIMITER })
            .collect();
        Self(key)
    }

    /// Derive a routing key, rejecting empty or delimiter-only results
    pub fn validated(type_name: &str) -> Result<Self> {
        let key = Self::derive(type_name);
        if key.is_degenerate() {
            return Err(Error::RoutingKey(type_name.to_string()));
        }
        Ok(key)
    }

    /// Empty, or made of delimiters only
    pub fn is_degenerate(&self) -> bool {
        self.0.chars().all(|c| c == DELIMITER)
    }

    /// Key as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoutingKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive the routing key for a message type name
pub fn derive_routing_key(type_name: &str) -> RoutingKey {
    RoutingKey::derive(type_name)
}

/// Match a routing key against a topic binding pattern.
///
/// `*` matches exactly one word, `#` matches zero or more words.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split(DELIMITER).collect();
    let key: Vec<&str> = key.split(DELIMITER).collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && match_words(rest, tail),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy_to_delimiter() {
        assert_eq!(derive_routing_key("Orders::Created").as_str(), "Orders.Created");
        assert_eq!(
            derive_routing_key("SmartMessage::Billing::Invoice").as_str(),
            "SmartMessage.Billing.Invoice"
        );
    }

    #[test]
    fn test_invalid_characters_replaced() {
        assert_eq!(derive_routing_key("Alert!System").as_str(), "Alert.System");
        assert_eq!(derive_routing_key("user_signed-up").as_str(), "user.signed.up");
        assert_eq!(derive_routing_key("Orders.Created").as_str(), "Orders.Created");
        assert_eq!(derive_routing_key("Café").as_str(), "Caf.");
    }

    #[test]
    fn test_degenerate_keys() {
        assert!(derive_routing_key("").is_degenerate());
        assert!(derive_routing_key("::").is_degenerate());
        assert!(derive_routing_key("!@#").is_degenerate());
        assert!(!derive_routing_key("A::").is_degenerate());

        assert!(matches!(RoutingKey::validated(""), Err(Error::RoutingKey(_))));
        assert!(matches!(RoutingKey::validated("?!"), Err(Error::RoutingKey(_))));
        assert_eq!(RoutingKey::validated("Orders::Created").unwrap().as_str(), "Orders.Created");
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("Orders.Created", "Orders.Created"));
        assert!(!topic_matches("Orders.Created", "Orders.Deleted"));

        assert!(topic_matches("Orders.*", "Orders.Created"));
        assert!(!topic_matches("Orders.*", "Orders.Created.Late"));
        assert!(!topic_matches("Orders.*", "Orders"));

        assert!(topic_matches("SmartMessage.#", "SmartMessage"));
        assert!(topic_matches("SmartMessage.#", "SmartMessage.Orders.Created"));
        assert!(!topic_matches("SmartMessage.#", "Orders.Created"));

        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.Created.#", "Orders.Created"));
        assert!(topic_matches("#.Created", "A.B.Created"));
    }
}

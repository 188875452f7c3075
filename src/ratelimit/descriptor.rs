//! Counter key generation.

use crate::identity::Identifier;

/// A key that uniquely identifies one counter in a store.
///
/// Window counters are namespaced by identifier and endpoint so limits never
/// leak across actors or routes. Burst counters used by the pattern detector
/// live in their own namespace and are per identifier only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CounterKey {
    /// Main policy window for an actor on an endpoint
    Window { identifier: String, endpoint: String },
    /// Short auxiliary window for burst detection
    Burst { identifier: String },
}

impl CounterKey {
    pub fn window(identifier: &Identifier, endpoint: &str) -> Self {
        CounterKey::Window {
            identifier: identifier.to_string(),
            endpoint: endpoint.to_string(),
        }
    }

    pub fn burst(identifier: &Identifier) -> Self {
        CounterKey::Burst {
            identifier: identifier.to_string(),
        }
    }

    /// Convert the counter key to its storage representation.
    pub fn to_string_key(&self) -> String {
        match self {
            CounterKey::Window {
                identifier,
                endpoint,
            } => format!("window:{}:{}", identifier, endpoint),
            CounterKey::Burst { identifier } => format!("burst:{}", identifier),
        }
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

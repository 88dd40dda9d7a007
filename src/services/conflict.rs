//! Deterministic conflict resolution between local intent and server
//! state.
//!
//! Strategies are pure: given the same inputs they produce the same
//! reconciled payload. No clock reads, no randomness. Embedders may
//! register a custom resolver per entity type; the enumerated strategies
//! cover everything else.

use crate::types::{ConflictStrategy, Payload};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Custom resolver: (local, server, previous) → reconciled payload.
pub type CustomResolver = dyn Fn(&Payload, &Payload, Option<&Payload>) -> Payload + Send + Sync;

/// Outcome of resolving one conflict.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The conflict resolved to a payload. `acknowledged` is true when the
    /// result carries no unacknowledged local intent (the entry's
    /// `sync_required` flag may be cleared).
    Resolved {
        payload: Payload,
        acknowledged: bool,
        /// Pending local operations must be cancelled (server-wins).
        cancel_pending: bool,
    },
    /// Resolution requires review; both payloads are parked and the entry
    /// stays dirty.
    Manual { local: Payload, server: Payload },
}

/// Strategy table keyed by entity type, with pluggable custom resolvers.
pub struct ConflictResolver {
    default_strategy: ConflictStrategy,
    custom: DashMap<String, Arc<CustomResolver>>,
}

impl ConflictResolver {
    pub fn new(default_strategy: ConflictStrategy) -> Self {
        Self {
            default_strategy,
            custom: DashMap::new(),
        }
    }

    /// Register a custom resolver for an entity type. It takes precedence
    /// over every enumerated strategy for that type.
    pub fn register<F>(&self, entity_type: impl Into<String>, resolver: F)
    where
        F: Fn(&Payload, &Payload, Option<&Payload>) -> Payload + Send + Sync + 'static,
    {
        self.custom.insert(entity_type.into(), Arc::new(resolver));
    }

    pub fn default_strategy(&self) -> ConflictStrategy {
        self.default_strategy
    }

    /// Resolve a conflict for one entity. `strategy` comes from the local
    /// operation that produced the unacknowledged intent; `None` falls
    /// back to the configured default.
    pub fn resolve(
        &self,
        entity_type: &str,
        strategy: Option<ConflictStrategy>,
        local: &Payload,
        server: &Payload,
        previous: Option<&Payload>,
    ) -> Resolution {
        if let Some(custom) = self.custom.get(entity_type) {
            let payload = (custom.value().as_ref())(local, server, previous);
            return Resolution::Resolved {
                payload,
                // A custom resolver preserves local intent by construction;
                // the result still needs an upload.
                acknowledged: false,
                cancel_pending: false,
            };
        }

        let strategy = strategy.unwrap_or(self.default_strategy);
        debug!("Resolving '{entity_type}' conflict via {}", strategy.as_str());

        match strategy {
            ConflictStrategy::ClientWins => Resolution::Resolved {
                payload: local.clone(),
                acknowledged: false,
                cancel_pending: false,
            },
            ConflictStrategy::ServerWins => Resolution::Resolved {
                payload: server.clone(),
                acknowledged: true,
                cancel_pending: true,
            },
            ConflictStrategy::LastWriterWins => {
                let local_wins = local_is_newer(local, server);
                Resolution::Resolved {
                    payload: if local_wins {
                        local.clone()
                    } else {
                        server.clone()
                    },
                    acknowledged: !local_wins,
                    cancel_pending: false,
                }
            }
            ConflictStrategy::Merge => Resolution::Resolved {
                payload: merge_payloads(server, local),
                acknowledged: false,
                cancel_pending: false,
            },
            ConflictStrategy::Manual => Resolution::Manual {
                local: local.clone(),
                server: server.clone(),
            },
        }
    }
}

/// Compare `updated_at` fields. Numbers compare numerically, strings
/// lexicographically (RFC 3339 sorts chronologically). Ties and missing
/// local timestamps go to the server.
fn local_is_newer(local: &Payload, server: &Payload) -> bool {
    match (local.get("updated_at"), server.get("updated_at")) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => {
            a.as_f64().unwrap_or(0.0) > b.as_f64().unwrap_or(0.0)
        }
        (Some(Value::String(a)), Some(Value::String(b))) => a > b,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Field-by-field union with the server payload as base: local-only keys
/// are added, nested mappings merge recursively, list values are
/// deduplicated-unioned (server order first, local additions appended in
/// local order), and conflicting scalars keep the server value.
pub fn merge_payloads(server: &Payload, local: &Payload) -> Payload {
    let mut merged = server.clone();

    for (key, local_value) in local {
        let replacement = match merged.get(key) {
            None => Some(local_value.clone()),
            Some(Value::Object(server_map)) => match local_value {
                Value::Object(local_map) => {
                    Some(Value::Object(merge_payloads(server_map, local_map)))
                }
                _ => None,
            },
            Some(Value::Array(server_list)) => match local_value {
                Value::Array(local_list) => {
                    let mut union = server_list.clone();
                    for item in local_list {
                        if !union.contains(item) {
                            union.push(item.clone());
                        }
                    }
                    Some(Value::Array(union))
                }
                _ => None,
            },
            // Conflicting scalars: server value is retained.
            Some(_) => None,
        };
        if let Some(value) = replacement {
            merged.insert(key.clone(), value);
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: serde_json::Value) -> Payload {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_merge_server_scalar_wins_local_keys_preserved() {
        let local = payload(json!({"amount": 300, "notes": "local"}));
        let server = payload(json!({"amount": 310, "status": "approved"}));

        let merged = merge_payloads(&server, &local);
        assert_eq!(
            Value::Object(merged),
            json!({"amount": 310, "notes": "local", "status": "approved"})
        );
    }

    #[test]
    fn test_merge_recursive_and_list_union() {
        let local = payload(json!({
            "address": {"city": "Osaka", "zip": "530"},
            "tags": ["b", "c"]
        }));
        let server = payload(json!({
            "address": {"city": "Kyoto", "country": "JP"},
            "tags": ["a", "b"]
        }));

        let merged = merge_payloads(&server, &local);
        assert_eq!(
            Value::Object(merged),
            json!({
                "address": {"city": "Kyoto", "country": "JP", "zip": "530"},
                "tags": ["a", "b", "c"]
            })
        );
    }

    #[test]
    fn test_merge_commutes_on_disjoint_keys() {
        let a = payload(json!({"x": 1, "y": "two"}));
        let b = payload(json!({"z": [3]}));
        assert_eq!(merge_payloads(&a, &b), merge_payloads(&b, &a));
    }

    #[test]
    fn test_client_wins_keeps_local_dirty() {
        let resolver = ConflictResolver::new(ConflictStrategy::ServerWins);
        let local = payload(json!({"amount": 300}));
        let server = payload(json!({"amount": 310}));

        match resolver.resolve(
            "invoice",
            Some(ConflictStrategy::ClientWins),
            &local,
            &server,
            None,
        ) {
            Resolution::Resolved {
                payload,
                acknowledged,
                cancel_pending,
            } => {
                assert_eq!(payload, local);
                assert!(!acknowledged);
                assert!(!cancel_pending);
            }
            _ => panic!("expected resolved"),
        }
    }

    #[test]
    fn test_server_wins_cancels_pending() {
        let resolver = ConflictResolver::new(ConflictStrategy::ClientWins);
        let local = payload(json!({"amount": 300}));
        let server = payload(json!({"amount": 310}));

        match resolver.resolve(
            "invoice",
            Some(ConflictStrategy::ServerWins),
            &local,
            &server,
            None,
        ) {
            Resolution::Resolved {
                payload,
                acknowledged,
                cancel_pending,
            } => {
                assert_eq!(payload, server);
                assert!(acknowledged);
                assert!(cancel_pending);
            }
            _ => panic!("expected resolved"),
        }
    }

    #[test]
    fn test_last_writer_wins_by_timestamp() {
        let resolver = ConflictResolver::new(ConflictStrategy::LastWriterWins);
        let newer_local = payload(json!({"amount": 300, "updated_at": 2000}));
        let older_server = payload(json!({"amount": 310, "updated_at": 1000}));

        match resolver.resolve("invoice", None, &newer_local, &older_server, None) {
            Resolution::Resolved {
                payload,
                acknowledged,
                ..
            } => {
                assert_eq!(payload.get("amount"), Some(&json!(300)));
                assert!(!acknowledged);
            }
            _ => panic!("expected resolved"),
        }

        // Ties go to the server.
        let tied = payload(json!({"amount": 300, "updated_at": 1000}));
        match resolver.resolve("invoice", None, &tied, &older_server, None) {
            Resolution::Resolved {
                payload,
                acknowledged,
                ..
            } => {
                assert_eq!(payload.get("amount"), Some(&json!(310)));
                assert!(acknowledged);
            }
            _ => panic!("expected resolved"),
        }
    }

    #[test]
    fn test_manual_parks_both_payloads() {
        let resolver = ConflictResolver::new(ConflictStrategy::Manual);
        let local = payload(json!({"a": 1}));
        let server = payload(json!({"a": 2}));

        match resolver.resolve("invoice", None, &local, &server, None) {
            Resolution::Manual { local: l, server: s } => {
                assert_eq!(l, local);
                assert_eq!(s, server);
            }
            _ => panic!("expected manual"),
        }
    }

    #[test]
    fn test_custom_resolver_takes_precedence() {
        let resolver = ConflictResolver::new(ConflictStrategy::ServerWins);
        resolver.register("invoice", |local, server, _previous| {
            let mut out = server.clone();
            if let Some(notes) = local.get("notes") {
                out.insert("notes".to_string(), notes.clone());
            }
            out
        });

        let local = payload(json!({"amount": 300, "notes": "keep me"}));
        let server = payload(json!({"amount": 310}));

        match resolver.resolve(
            "invoice",
            Some(ConflictStrategy::ServerWins),
            &local,
            &server,
            None,
        ) {
            Resolution::Resolved { payload, .. } => {
                assert_eq!(payload.get("amount"), Some(&json!(310)));
                assert_eq!(payload.get("notes"), Some(&json!("keep me")));
            }
            _ => panic!("expected resolved"),
        }
    }
}

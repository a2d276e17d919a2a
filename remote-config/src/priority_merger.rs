//! Resolves scoped library configurations into one effective configuration.
//!
//! Several configurations may target this process at once: one for the whole
//! organization, one for a cluster, one for the environment, one for the service.
//! Each is ranked by how specific its scope is and their `lib_config` objects are
//! merged so that the most specific scope wins on conflicting top-level keys.

use crate::handler::ProductHandler;
use crate::types::Action;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

const WILDCARD: &str = "*";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceTarget {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub env: Option<String>,
}

/// A configuration as delivered for a library configuration product.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScopedConfig {
    #[serde(default)]
    pub service_target: Option<ServiceTarget>,
    /// Cluster selector. Only its presence is used for ranking.
    #[serde(default)]
    pub k8s_target_v2: Option<JsonValue>,
    #[serde(default)]
    pub lib_config: Option<Map<String, JsonValue>>,
}

#[derive(Debug, Clone)]
struct Entry {
    config: ScopedConfig,
    priority: u8,
}

#[derive(Debug)]
pub struct PriorityMerger {
    service: String,
    env: Option<String>,
    // Ties in priority merge in insertion order.
    entries: IndexMap<String, Entry>,
}

fn is_specific(value: Option<&str>) -> bool {
    matches!(value, Some(value) if value != WILDCARD)
}

fn matches_dimension(selector: Option<&str>, local: Option<&str>) -> bool {
    match selector {
        None | Some(WILDCARD) => true,
        Some(selector) => local == Some(selector),
    }
}

impl PriorityMerger {
    pub fn new(service: &str, env: Option<&str>) -> Self {
        PriorityMerger {
            service: service.to_string(),
            env: env.map(str::to_string),
            entries: IndexMap::new(),
        }
    }

    /// Ranks a configuration by scope: service and env 5, service 4, env 3,
    /// cluster 2, organization-wide 1.
    pub fn calculate_priority(config: &ScopedConfig) -> u8 {
        if let Some(target) = &config.service_target {
            match (
                is_specific(target.service.as_deref()),
                is_specific(target.env.as_deref()),
            ) {
                (true, true) => return 5,
                (true, false) => return 4,
                (false, true) => return 3,
                (false, false) => {}
            }
        }

        if config.k8s_target_v2.is_some() { 2 } else { 1 }
    }

    pub fn matches_current_service_env(&self, config: &ScopedConfig) -> bool {
        let Some(target) = &config.service_target else {
            return true;
        };

        matches_dimension(target.service.as_deref(), Some(self.service.as_str()))
            && matches_dimension(target.env.as_deref(), self.env.as_deref())
    }

    /// Stores `config` under `id`, replacing any previous entry. Returns false if the
    /// configuration targets another service or environment.
    pub fn add_config(&mut self, id: &str, config: ScopedConfig) -> bool {
        if !self.matches_current_service_env(&config) {
            tracing::debug!(
                id,
                target = ?config.service_target,
                service = %self.service,
                "ignoring configuration scoped to another service or environment"
            );
            return false;
        }

        let priority = Self::calculate_priority(&config);
        self.entries
            .insert(id.to_string(), Entry { config, priority });
        true
    }

    pub fn remove_config(&mut self, id: &str) {
        self.entries.shift_remove(id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merges the `lib_config` of every stored configuration, lowest priority first.
    /// `None` if no stored configuration carries one.
    pub fn merged_lib_config(&self) -> Option<Map<String, JsonValue>> {
        let mut entries: Vec<&Entry> = self
            .entries
            .values()
            .filter(|entry| entry.config.lib_config.is_some())
            .collect();
        if entries.is_empty() {
            return None;
        }

        entries.sort_by_key(|entry| entry.priority);

        let mut merged = Map::new();
        for lib_config in entries.into_iter().filter_map(|entry| entry.config.lib_config.as_ref()) {
            merged.extend(lib_config.clone());
        }
        Some(merged)
    }
}

/// Product handler that feeds a shared merger and passes the merged
/// configuration to `on_change` after every change.
pub fn lib_config_handler<F>(merger: Arc<Mutex<PriorityMerger>>, on_change: F) -> ProductHandler
where
    F: Fn(Option<Map<String, JsonValue>>) + Send + Sync + 'static,
{
    ProductHandler::sync(move |action, content, id| {
        let merged = {
            let mut merger = merger.lock();
            match action {
                Action::Unapply => merger.remove_config(id),
                Action::Apply | Action::Modify => {
                    let content = content.ok_or("configuration has no content")?;
                    let config: ScopedConfig = serde_json::from_value(content.clone())?;
                    // A modified config that no longer matches must not keep its old entry
                    merger.remove_config(id);
                    merger.add_config(id, config);
                }
            }
            merger.merged_lib_config()
        };

        on_change(merged);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scoped(value: JsonValue) -> ScopedConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_calculate_priority() {
        let cases = [
            (json!({"service_target": {"service": "svc", "env": "prod"}}), 5),
            (json!({"service_target": {"service": "svc", "env": "*"}}), 4),
            (json!({"service_target": {"service": "svc"}}), 4),
            (json!({"service_target": {"service": "*", "env": "prod"}}), 3),
            (json!({"k8s_target_v2": {"cluster_targets": []}}), 2),
            (json!({"service_target": {"service": "*", "env": "*"}}), 1),
            (json!({}), 1),
        ];

        for (config, expected) in cases {
            assert_eq!(
                PriorityMerger::calculate_priority(&scoped(config.clone())),
                expected,
                "{config}"
            );
        }
    }

    #[test]
    fn test_matches_current_service_env() {
        let merger = PriorityMerger::new("svc", Some("prod"));

        assert!(merger.matches_current_service_env(&scoped(json!({}))));
        assert!(merger.matches_current_service_env(&scoped(
            json!({"service_target": {"service": "*", "env": "*"}})
        )));
        assert!(merger.matches_current_service_env(&scoped(
            json!({"service_target": {"service": "svc"}})
        )));
        assert!(merger.matches_current_service_env(&scoped(
            json!({"service_target": {"service": "svc", "env": "prod"}})
        )));
        assert!(!merger.matches_current_service_env(&scoped(
            json!({"service_target": {"service": "other"}})
        )));
        assert!(!merger.matches_current_service_env(&scoped(
            json!({"service_target": {"service": "svc", "env": "staging"}})
        )));

        // Without a local env only wildcard or absent env selectors match
        let merger = PriorityMerger::new("svc", None);
        assert!(!merger.matches_current_service_env(&scoped(
            json!({"service_target": {"env": "prod"}})
        )));
    }

    #[test]
    fn test_merge_by_priority() {
        let mut merger = PriorityMerger::new("svc", Some("prod"));
        assert_eq!(merger.merged_lib_config(), None);

        assert!(merger.add_config(
            "org",
            scoped(json!({
                "service_target": {"service": "*", "env": "*"},
                "lib_config": {"a": 0.5, "b": true}
            }))
        ));
        assert!(merger.add_config(
            "service",
            scoped(json!({
                "service_target": {"service": "svc", "env": "*"},
                "lib_config": {"a": 0.8}
            }))
        ));
        assert!(!merger.add_config(
            "other",
            scoped(json!({
                "service_target": {"service": "other", "env": "*"},
                "lib_config": {"a": 0.1, "c": 1}
            }))
        ));

        assert_eq!(
            merger.merged_lib_config(),
            Some(json!({"a": 0.8, "b": true}).as_object().unwrap().clone())
        );

        merger.remove_config("service");
        assert_eq!(
            merger.merged_lib_config(),
            Some(json!({"a": 0.5, "b": true}).as_object().unwrap().clone())
        );

        merger.remove_config("org");
        assert!(merger.is_empty());
        assert_eq!(merger.merged_lib_config(), None);
    }

    #[test]
    fn test_merge_order_does_not_depend_on_insertion() {
        let mut merger = PriorityMerger::new("svc", Some("prod"));
        merger.add_config(
            "exact",
            scoped(json!({
                "service_target": {"service": "svc", "env": "prod"},
                "lib_config": {"level": "exact"}
            })),
        );
        merger.add_config(
            "env",
            scoped(json!({
                "service_target": {"service": "*", "env": "prod"},
                "lib_config": {"level": "env", "env_only": 1}
            })),
        );
        merger.add_config(
            "cluster",
            scoped(json!({
                "k8s_target_v2": {},
                "lib_config": {"level": "cluster"}
            })),
        );

        assert_eq!(
            merger.merged_lib_config(),
            Some(
                json!({"level": "exact", "env_only": 1})
                    .as_object()
                    .unwrap()
                    .clone()
            )
        );
    }

    #[test]
    fn test_configs_without_lib_config() {
        let mut merger = PriorityMerger::new("svc", None);
        merger.add_config("empty", scoped(json!({"service_target": {"service": "svc"}})));
        assert!(!merger.is_empty());
        assert_eq!(merger.merged_lib_config(), None);
    }

    #[test]
    fn test_lib_config_handler() {
        let merger = Arc::new(Mutex::new(PriorityMerger::new("svc", Some("prod"))));
        let seen: Arc<Mutex<Vec<Option<Map<String, JsonValue>>>>> = Arc::default();
        let seen_clone = seen.clone();
        let handler = lib_config_handler(merger.clone(), move |merged| {
            seen_clone.lock().push(merged);
        });
        let ProductHandler::Sync(handle) = handler else {
            panic!("expected a sync handler");
        };

        let org = json!({"lib_config": {"sample_rate": 0.5}});
        handle(Action::Apply, Some(&org), "org").unwrap();

        let service = json!({
            "service_target": {"service": "svc"},
            "lib_config": {"sample_rate": 0.9}
        });
        handle(Action::Apply, Some(&service), "service").unwrap();

        // Retargeted away from this service: its old entry is dropped
        let moved = json!({
            "service_target": {"service": "other"},
            "lib_config": {"sample_rate": 0.1}
        });
        handle(Action::Modify, Some(&moved), "service").unwrap();

        handle(Action::Unapply, None, "org").unwrap();

        let values: Vec<Option<JsonValue>> = seen
            .lock()
            .iter()
            .map(|merged| merged.clone().map(JsonValue::Object))
            .collect();
        assert_eq!(
            values,
            vec![
                Some(json!({"sample_rate": 0.5})),
                Some(json!({"sample_rate": 0.9})),
                Some(json!({"sample_rate": 0.5})),
                None,
            ]
        );

        assert!(handle(Action::Apply, None, "empty").is_err());
        assert!(handle(Action::Apply, Some(&json!({"lib_config": 5})), "bad").is_err());
        assert!(merger.lock().is_empty());
    }
}

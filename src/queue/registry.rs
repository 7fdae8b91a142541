//! Queue bindings and the routing table built from them.

use crate::error::{DockhandError, DockhandResult};
use crate::queue::identity::{LOCAL_ENV, to_local_name, to_physical_name};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Environment variable holding the assumed-role ARN of the caller.
pub const CALLER_ARN_ENV: &str = "DOCKHAND_CALLER_ARN";

/// One queue bound to one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBinding {
    /// Short queue name, without environment
    pub short_name: String,
    /// Task consumed from this queue
    pub task_name: String,
    /// Rate-limit key consulted before polling. `None` never throttles.
    #[serde(default)]
    pub rate_limit_key: Option<String>,
}

impl QueueBinding {
    /// Bind `short_name` to `task_name` without rate limiting.
    pub fn new(short_name: impl Into<String>, task_name: impl Into<String>) -> Self {
        Self {
            short_name: short_name.into(),
            task_name: task_name.into(),
            rate_limit_key: None,
        }
    }

    /// Throttle polling of this queue under `key`.
    pub fn with_rate_limit_key(mut self, key: impl Into<String>) -> Self {
        self.rate_limit_key = Some(key.into());
        self
    }
}

/// A binding with its resolved physical queue name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedQueue {
    /// Physical queue name
    pub physical_name: String,
    /// Binding this queue came from
    pub binding: QueueBinding,
}

/// Immutable task and queue lookups, shared behind `Arc`.
#[derive(Debug, Default)]
pub struct RoutingTable {
    queues: Vec<ResolvedQueue>,
    task_to_queue: HashMap<String, String>,
    queue_index: HashMap<String, usize>,
}

impl RoutingTable {
    /// Physical queue routing `task_name`.
    pub fn physical_name_for(&self, task_name: &str) -> Option<&str> {
        self.task_to_queue.get(task_name).map(String::as_str)
    }

    /// Rate-limit key of a physical queue. `None` means never throttle.
    pub fn rate_limit_key_for(&self, physical: &str) -> Option<&str> {
        self.resolved(physical)
            .and_then(|q| q.binding.rate_limit_key.as_deref())
    }

    /// Task consumed from a physical queue.
    pub fn task_for(&self, physical: &str) -> Option<&str> {
        self.resolved(physical).map(|q| q.binding.task_name.as_str())
    }

    /// Resolved queue by physical name.
    pub fn resolved(&self, physical: &str) -> Option<&ResolvedQueue> {
        self.queue_index.get(physical).map(|&i| &self.queues[i])
    }

    /// Every physical queue, in binding order.
    pub fn active_queues(&self) -> impl Iterator<Item = &str> {
        self.queues.iter().map(|q| q.physical_name.as_str())
    }

    /// Number of routed queues.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// Whether nothing is routed.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

/// Source of the caller id used for local queue names.
pub trait CallerIdentity: Send + Sync {
    /// Resolve the caller id.
    fn caller_id(&self) -> DockhandResult<String>;
}

/// Caller id given explicitly.
#[derive(Debug, Clone)]
pub struct StaticCallerIdentity(pub String);

impl CallerIdentity for StaticCallerIdentity {
    fn caller_id(&self) -> DockhandResult<String> {
        if self.0.is_empty() {
            return Err(DockhandError::CredentialResolution {
                message: "caller id is empty".to_string(),
            });
        }
        Ok(self.0.clone())
    }
}

/// Caller id taken from an assumed-role ARN such as
/// `arn:aws:sts::123456789012:assumed-role/alice/session`.
#[derive(Debug, Clone)]
pub struct ArnCallerIdentity {
    arn: Option<String>,
}

impl ArnCallerIdentity {
    /// Use the given ARN.
    pub fn new(arn: impl Into<String>) -> Self {
        Self {
            arn: Some(arn.into()),
        }
    }

    /// Read the ARN from `DOCKHAND_CALLER_ARN`. A missing variable only
    /// fails once the id is actually needed.
    pub fn from_env() -> Self {
        Self {
            arn: std::env::var(CALLER_ARN_ENV).ok(),
        }
    }
}

impl CallerIdentity for ArnCallerIdentity {
    fn caller_id(&self) -> DockhandResult<String> {
        let arn = self
            .arn
            .as_deref()
            .ok_or_else(|| DockhandError::CredentialResolution {
                message: format!("{} is not set", CALLER_ARN_ENV),
            })?;

        match arn.split('/').nth(1) {
            Some(segment) if !segment.is_empty() => Ok(segment.to_string()),
            _ => Err(DockhandError::CredentialResolution {
                message: format!("cannot extract caller from ARN '{}'", arn),
            }),
        }
    }
}

/// The configured queue bindings and, once built, their routing table.
#[derive(Debug, Clone)]
pub struct QueueRegistry {
    bindings: Vec<QueueBinding>,
    table: Option<Arc<RoutingTable>>,
}

impl QueueRegistry {
    /// Create an unbuilt registry.
    pub fn new(bindings: Vec<QueueBinding>) -> Self {
        Self {
            bindings,
            table: None,
        }
    }

    /// Resolve every binding for `env` and freeze the routing table.
    ///
    /// In the `local` environment each physical name is further qualified by
    /// the caller id, so `caller` is only consulted there.
    pub fn build(&mut self, env: &str, caller: &dyn CallerIdentity) -> DockhandResult<Arc<RoutingTable>> {
        let caller_id = if env == LOCAL_ENV {
            Some(caller.caller_id()?)
        } else {
            None
        };

        let mut table = RoutingTable::default();

        for binding in &self.bindings {
            let mut physical = to_physical_name(&binding.short_name, env)?;
            if let Some(caller_id) = &caller_id {
                physical = to_local_name(&physical, caller_id)?;
            }

            if let Some(first) = table.task_to_queue.get(&binding.task_name) {
                return Err(DockhandError::DuplicateTaskRoute {
                    task_name: binding.task_name.clone(),
                    first: first.clone(),
                    second: physical,
                });
            }
            if table.queue_index.contains_key(&physical) {
                return Err(DockhandError::DuplicateQueue {
                    physical_name: physical,
                });
            }

            table
                .task_to_queue
                .insert(binding.task_name.clone(), physical.clone());
            table.queue_index.insert(physical.clone(), table.queues.len());
            table.queues.push(ResolvedQueue {
                physical_name: physical,
                binding: binding.clone(),
            });
        }

        tracing::info!(env, queues = table.len(), "Queue routing table built");

        let table = Arc::new(table);
        self.table = Some(Arc::clone(&table));
        Ok(table)
    }

    /// The built routing table.
    pub fn routing_table(&self) -> DockhandResult<Arc<RoutingTable>> {
        self.table.clone().ok_or(DockhandError::RegistryNotBuilt)
    }

    /// Physical queue routing `task_name`.
    pub fn physical_name_for(&self, task_name: &str) -> DockhandResult<String> {
        let table = self.table.as_ref().ok_or(DockhandError::RegistryNotBuilt)?;
        table
            .physical_name_for(task_name)
            .map(str::to_string)
            .ok_or_else(|| DockhandError::TaskNotRouted {
                task_name: task_name.to_string(),
            })
    }

    /// Rate-limit key of a physical queue.
    pub fn rate_limit_key_for(&self, physical: &str) -> DockhandResult<Option<String>> {
        let table = self.table.as_ref().ok_or(DockhandError::RegistryNotBuilt)?;
        Ok(table.rate_limit_key_for(physical).map(str::to_string))
    }

    /// Configured bindings.
    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }

    /// Whether `build` has succeeded.
    pub fn is_built(&self) -> bool {
        self.table.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller() -> StaticCallerIdentity {
        StaticCallerIdentity("alice".to_string())
    }

    #[test]
    fn test_single_binding_resolves() {
        let mut registry = QueueRegistry::new(vec![QueueBinding::new("add", "add")]);
        registry.build("stage", &caller()).unwrap();

        let physical = registry.physical_name_for("add").unwrap();
        assert_eq!(physical, "stage-add");
        assert_eq!(
            crate::queue::identity::to_dead_letter_name(&physical),
            "err-stage-add"
        );
    }

    #[test]
    fn test_access_before_build_fails() {
        let registry = QueueRegistry::new(vec![QueueBinding::new("add", "add")]);
        assert!(matches!(
            registry.physical_name_for("add"),
            Err(DockhandError::RegistryNotBuilt)
        ));
        assert!(matches!(
            registry.rate_limit_key_for("stage-add"),
            Err(DockhandError::RegistryNotBuilt)
        ));
        assert!(registry.routing_table().is_err());
    }

    #[test]
    fn test_duplicate_task_route() {
        let mut registry = QueueRegistry::new(vec![
            QueueBinding::new("add", "add"),
            QueueBinding::new("add-v2", "add"),
        ]);
        let err = registry.build("prod", &caller()).unwrap_err();
        assert!(err.is_fatal_config());
        match err {
            DockhandError::DuplicateTaskRoute {
                task_name,
                first,
                second,
            } => {
                assert_eq!(task_name, "add");
                assert_eq!(first, "prod-add");
                assert_eq!(second, "prod-add-v2");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!registry.is_built());
    }

    #[test]
    fn test_duplicate_queue() {
        let mut registry = QueueRegistry::new(vec![
            QueueBinding::new("add", "add"),
            QueueBinding::new("add", "sum"),
        ]);
        assert!(matches!(
            registry.build("prod", &caller()),
            Err(DockhandError::DuplicateQueue { .. })
        ));
    }

    #[test]
    fn test_distinct_tasks_all_resolve() {
        let mut registry = QueueRegistry::new(vec![
            QueueBinding::new("add", "add"),
            QueueBinding::new("retry", "retry_demo").with_rate_limit_key("retry-key"),
            QueueBinding::new("events", "polymorphism_task"),
        ]);
        let table = registry.build("dev", &caller()).unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.physical_name_for("retry_demo"), Some("dev-retry"));
        assert_eq!(table.task_for("dev-events"), Some("polymorphism_task"));
        assert_eq!(
            registry.rate_limit_key_for("dev-retry").unwrap().as_deref(),
            Some("retry-key")
        );
        assert_eq!(registry.rate_limit_key_for("dev-add").unwrap(), None);
        assert_eq!(
            table.active_queues().collect::<Vec<_>>(),
            vec!["dev-add", "dev-retry", "dev-events"]
        );
        assert!(matches!(
            registry.physical_name_for("missing"),
            Err(DockhandError::TaskNotRouted { .. })
        ));
    }

    #[test]
    fn test_local_env_uses_caller() {
        let mut registry = QueueRegistry::new(vec![QueueBinding::new("add", "add")]);
        registry.build("local", &caller()).unwrap();
        assert_eq!(registry.physical_name_for("add").unwrap(), "alice-local-add");
    }

    #[test]
    fn test_local_env_credential_failure_is_fatal() {
        let mut registry = QueueRegistry::new(vec![QueueBinding::new("add", "add")]);
        let err = registry
            .build("local", &ArnCallerIdentity { arn: None })
            .unwrap_err();
        assert!(matches!(err, DockhandError::CredentialResolution { .. }));
        assert!(err.is_fatal_config());

        // Caller identity is never consulted outside local.
        registry.build("stage", &ArnCallerIdentity { arn: None }).unwrap();
    }

    #[test]
    fn test_arn_caller_identity() {
        let identity = ArnCallerIdentity::new("arn:aws:sts::123456789012:assumed-role/alice/session");
        assert_eq!(identity.caller_id().unwrap(), "alice");

        let identity = ArnCallerIdentity::new("arn:aws:iam::123456789012:root");
        assert!(identity.caller_id().is_err());
    }

    #[test]
    fn test_binding_deserializes_without_key() {
        let binding: QueueBinding =
            serde_json::from_str(r#"{"short_name": "add", "task_name": "add"}"#).unwrap();
        assert_eq!(binding, QueueBinding::new("add", "add"));
    }
}

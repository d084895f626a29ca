//! In-memory policy store.
//!
//! A process-local cache of the policies held in Redis, kept coherent by
//! the pub/sub subscription. The lock is held only for the map operation
//! itself; nothing does Redis work while holding it.

use std::collections::HashMap;
use std::sync::RwLock;

use super::policy::PeriodicPolicy;

/// Map of policy id → policy behind a reader/writer lock.
#[derive(Default)]
pub struct PolicyStore {
    policies: RwLock<HashMap<String, PeriodicPolicy>>,
}

impl PolicyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts one policy. Items with an empty id are ignored.
    pub fn add(&self, policy: PeriodicPolicy) {
        if policy.policy_id.is_empty() {
            return;
        }
        let mut map = self.policies.write().expect("policy store lock poisoned");
        map.insert(policy.policy_id.clone(), policy);
    }

    /// Bulk-inserts policies; used by the startup load.
    pub fn add_all(&self, policies: Vec<PeriodicPolicy>) {
        let mut map = self.policies.write().expect("policy store lock poisoned");
        for policy in policies {
            if policy.policy_id.is_empty() {
                continue;
            }
            map.insert(policy.policy_id.clone(), policy);
        }
    }

    /// Removes a policy by id, returning it when present.
    pub fn remove(&self, policy_id: &str) -> Option<PeriodicPolicy> {
        let mut map = self.policies.write().expect("policy store lock poisoned");
        map.remove(policy_id)
    }

    /// Snapshot of all stored policies.
    pub fn list(&self) -> Vec<PeriodicPolicy> {
        let map = self.policies.read().expect("policy store lock poisoned");
        map.values().cloned().collect()
    }

    /// Number of stored policies.
    pub fn size(&self) -> usize {
        let map = self.policies.read().expect("policy store lock poisoned");
        map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;
    use crate::period::policy::policy_id_for_score;

    fn policy(id: &str) -> PeriodicPolicy {
        let mut p = PeriodicPolicy::new(
            "fake_job",
            params::single("image", "testing:v1"),
            "5 * * * * *",
        );
        p.policy_id = id.to_string();
        p
    }

    #[test]
    fn test_add_list_remove_roundtrip() {
        let store = PolicyStore::new();
        let id = policy_id_for_score(1_700_000_000);
        store.add(policy(&id));

        let listed = store.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].policy_id, id);

        let removed = store.remove(&id).expect("policy present");
        assert_eq!(removed.policy_id, id);
        assert_eq!(store.size(), 0);
        assert!(store.remove(&id).is_none());
    }

    #[test]
    fn test_add_overwrites_same_id() {
        let store = PolicyStore::new();
        store.add(policy("p1"));

        let mut updated = policy("p1");
        updated.cron_spec = "0 0 * * * *".into();
        store.add(updated);

        assert_eq!(store.size(), 1);
        assert_eq!(store.list()[0].cron_spec, "0 0 * * * *");
    }

    #[test]
    fn test_empty_id_ignored() {
        let store = PolicyStore::new();
        store.add(policy(""));
        assert_eq!(store.size(), 0);

        store.add_all(vec![policy(""), policy("p1"), policy("p2")]);
        assert_eq!(store.size(), 2);
    }
}

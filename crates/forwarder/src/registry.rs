//! The table of forward rules and the listeners they own.
//!
//! The registry does no validation beyond keeping the map consistent; every
//! mutation goes through [`crate::ForwardManager`], which holds the registry
//! behind a single mutex.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use common::{ForwardRule, ForwardStatus};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Errors from registry mutation.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("forward id {0} is already registered")]
    DuplicateId(String),
}

/// Handle to a running accept loop. Owning it is owning the listener.
#[derive(Debug)]
pub struct ListenerHandle {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub(crate) fn new(addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            addr,
            cancel,
            task: None,
        }
    }

    pub(crate) fn attach(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    /// Stop accepting without waiting for the loop to exit.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel the accept loop and wait up to `timeout` for it to drop the
    /// listener. Connections already accepted are unaffected.
    pub async fn close(mut self, timeout: Duration) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(timeout, task).await.is_err() {
                warn!(addr = %self.addr, "accept loop did not exit in time");
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A rule together with the listener serving it.
#[derive(Debug)]
pub struct ActiveForward {
    pub(crate) rule: ForwardRule,
    pub(crate) listener: ListenerHandle,
}

impl ActiveForward {
    pub fn new(rule: ForwardRule, listener: ListenerHandle) -> Self {
        Self { rule, listener }
    }

    /// Snapshot of the rule; never exposes the listener.
    pub fn snapshot(&self) -> ForwardRule {
        self.rule.clone()
    }

    pub fn into_parts(self) -> (ForwardRule, ListenerHandle) {
        (self.rule, self.listener)
    }
}

/// Map from rule id to [`ActiveForward`].
#[derive(Debug, Default)]
pub struct Registry {
    forwards: HashMap<String, ActiveForward>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots of every rule, oldest first.
    pub fn list(&self) -> Vec<ForwardRule> {
        let mut rules: Vec<ForwardRule> = self.forwards.values().map(ActiveForward::snapshot).collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        rules
    }

    pub fn get(&self, id: &str) -> Option<ForwardRule> {
        self.forwards.get(id).map(ActiveForward::snapshot)
    }

    /// Register `forward` under its rule id.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateId`] if the id is taken.
    pub fn insert(&mut self, forward: ActiveForward) -> Result<(), RegistryError> {
        let id = forward.rule.id.clone();
        if self.forwards.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        self.forwards.insert(id, forward);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<ActiveForward> {
        self.forwards.remove(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.forwards.keys().cloned().collect()
    }

    /// Cancel the accept loop of `id`. `false` if there is no such rule.
    pub(crate) fn cancel_listener(&mut self, id: &str) -> bool {
        match self.forwards.get(id) {
            Some(forward) => {
                forward.listener.cancel();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.forwards.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.forwards.is_empty()
    }

    /// The `running` rule bound to `port`, if any.
    pub fn running_on_port(&self, port: u16) -> Option<&ForwardRule> {
        self.forwards
            .values()
            .map(|f| &f.rule)
            .find(|r| r.local_port == port && r.status == ForwardStatus::Running)
    }

    pub(crate) fn rule_mut(&mut self, id: &str) -> Option<&mut ForwardRule> {
        self.forwards.get_mut(id).map(|f| &mut f.rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use common::{ForwardSpec, ResourceKind};

    fn active(id: &str, port: u16, age_secs: i64) -> ActiveForward {
        let spec = ForwardSpec {
            namespace: "default".into(),
            resource_type: ResourceKind::Pod,
            resource_name: format!("pod-{id}"),
            local_port: port,
            remote_port: 80,
        };
        let created = Utc::now() - ChronoDuration::seconds(age_secs);
        let rule = ForwardRule::new(id, &spec, created);
        let listener = ListenerHandle::new(([127, 0, 0, 1], port).into(), CancellationToken::new());
        ActiveForward::new(rule, listener)
    }

    #[test]
    fn insert_get_remove() {
        let mut reg = Registry::new();
        reg.insert(active("a", 9000, 0)).unwrap();
        assert_eq!(reg.get("a").unwrap().local_port, 9000);
        assert!(reg.get("b").is_none());

        let removed = reg.remove("a").unwrap();
        assert_eq!(removed.snapshot().id, "a");
        assert!(reg.remove("a").is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut reg = Registry::new();
        reg.insert(active("a", 9000, 0)).unwrap();
        let err = reg.insert(active("a", 9001, 0)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(id) if id == "a"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn list_is_oldest_first() {
        let mut reg = Registry::new();
        reg.insert(active("young", 9001, 1)).unwrap();
        reg.insert(active("old", 9000, 60)).unwrap();
        let ids: Vec<_> = reg.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["old", "young"]);
    }

    #[test]
    fn port_conflicts_only_count_running_rules() {
        let mut reg = Registry::new();
        reg.insert(active("a", 9000, 0)).unwrap();
        assert_eq!(reg.running_on_port(9000).unwrap().id, "a");

        reg.rule_mut("a").unwrap().status = ForwardStatus::Error;
        assert!(reg.running_on_port(9000).is_none());
    }

    #[test]
    fn cancel_listener_only_knows_registered_rules() {
        let mut reg = Registry::new();
        let token = CancellationToken::new();
        let spec = ForwardSpec {
            namespace: "default".into(),
            resource_type: ResourceKind::Pod,
            resource_name: "web".into(),
            local_port: 9000,
            remote_port: 80,
        };
        let listener = ListenerHandle::new(([127, 0, 0, 1], 9000).into(), token.clone());
        reg.insert(ActiveForward::new(ForwardRule::new("a", &spec, Utc::now()), listener))
            .unwrap();

        assert!(!reg.cancel_listener("b"));
        assert!(!token.is_cancelled());
        assert!(reg.cancel_listener("a"));
        assert!(token.is_cancelled());
        assert_eq!(reg.get("a").unwrap().status, ForwardStatus::Running);
    }

    #[test]
    fn dropping_a_listener_handle_cancels_it() {
        let token = CancellationToken::new();
        let handle = ListenerHandle::new(([127, 0, 0, 1], 9000).into(), token.clone());
        drop(handle);
        assert!(token.is_cancelled());
    }
}

//! # Subscription Registry
//!
//! Keeps, per resource name, the ordered list of listeners that want to hear
//! about changes to that resource. Entries are reference counted: handing the
//! same listener `Arc` in twice for one resource keeps a single entry with two
//! references, so it is still called only once per event. The resource entry
//! is pruned when its last listener goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;

/// A callback invoked with the `data` payload of a push message.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

type Table = Mutex<HashMap<String, Vec<Entry>>>;

struct Entry {
    id: u64,
    listener: Listener,
    refs: u32,
}

/// Reference-counted listener table.
pub struct Registry {
    subscriptions: Arc<Table>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `listener` for `resource`.
    ///
    /// Returns a handle that removes exactly this registration when
    /// unsubscribed or dropped.
    pub fn subscribe(&self, resource: &str, listener: Listener) -> Subscription {
        let mut subs = lock(&self.subscriptions);
        let entries = subs.entry(resource.to_string()).or_default();

        let id = match entries
            .iter_mut()
            .find(|e| Arc::ptr_eq(&e.listener, &listener))
        {
            Some(existing) => {
                existing.refs += 1;
                log::debug!(
                    "Listener {} on '{}' re-registered ({} refs)",
                    existing.id,
                    resource,
                    existing.refs
                );
                existing.id
            }
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                entries.push(Entry { id, listener, refs: 1 });
                log::debug!("Listener {} subscribed to '{}'", id, resource);
                id
            }
        };

        Subscription {
            resource: resource.to_string(),
            id,
            table: Arc::downgrade(&self.subscriptions),
            active: true,
        }
    }

    /// Copies the current listeners of `resource` in registration order.
    ///
    /// Delivery iterates over this copy, so registrations changed while a
    /// frame is being delivered only affect later frames.
    pub fn snapshot(&self, resource: &str) -> Vec<Listener> {
        lock(&self.subscriptions)
            .get(resource)
            .map(|entries| entries.iter().map(|e| Arc::clone(&e.listener)).collect())
            .unwrap_or_default()
    }

    /// Number of distinct listeners registered for `resource`.
    pub fn listener_count(&self, resource: &str) -> usize {
        lock(&self.subscriptions).get(resource).map_or(0, Vec::len)
    }

    /// Resources that currently have at least one listener.
    pub fn resources(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.subscriptions).keys().cloned().collect();
        names.sort();
        names
    }
}

/// Handle for one registration. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    resource: String,
    id: u64,
    table: Weak<Table>,
    active: bool,
}

impl Subscription {
    /// The resource this handle is registered under.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Removes this registration.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        // Registry already gone: nothing left to remove from.
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut subs = lock(&table);
        let mut removed: Option<Entry> = None;

        if let Some(entries) = subs.get_mut(&self.resource) {
            if let Some(pos) = entries.iter().position(|e| e.id == self.id) {
                entries[pos].refs -= 1;
                if entries[pos].refs == 0 {
                    removed = Some(entries.remove(pos));
                    log::debug!("Listener {} unsubscribed from '{}'", self.id, self.resource);
                }
            }
            if entries.is_empty() {
                subs.remove(&self.resource);
                log::debug!("No listeners left for '{}'", self.resource);
            }
        }

        // The listener may own other subscriptions whose drop locks the table.
        drop(subs);
        drop(removed);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("resource", &self.resource)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

fn lock(table: &Table) -> MutexGuard<'_, HashMap<String, Vec<Entry>>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Listener {
        Arc::new(|_: &Value| {})
    }

    #[test]
    fn test_subscribe_and_prune() {
        let registry = Registry::new();
        let sub = registry.subscribe("accounts", noop());
        assert_eq!(registry.listener_count("accounts"), 1);
        assert_eq!(registry.resources(), vec!["accounts".to_string()]);

        sub.unsubscribe();
        assert_eq!(registry.listener_count("accounts"), 0);
        assert!(registry.resources().is_empty());
    }

    #[test]
    fn test_same_listener_twice_is_stored_once() {
        let registry = Registry::new();
        let listener = noop();

        let first = registry.subscribe("accounts", Arc::clone(&listener));
        let second = registry.subscribe("accounts", Arc::clone(&listener));
        assert_eq!(registry.listener_count("accounts"), 1);

        // One reference remains after the first handle goes.
        first.unsubscribe();
        assert_eq!(registry.listener_count("accounts"), 1);

        drop(second);
        assert_eq!(registry.listener_count("accounts"), 0);
    }

    #[test]
    fn test_unsubscribe_removes_only_its_own_entry() {
        let registry = Registry::new();
        let a = registry.subscribe("containers", noop());
        let _b = registry.subscribe("containers", noop());
        let _c = registry.subscribe("accounts", noop());

        a.unsubscribe();
        assert_eq!(registry.listener_count("containers"), 1);
        assert_eq!(registry.listener_count("accounts"), 1);
    }

    #[test]
    fn test_listener_owning_a_subscription_can_be_released() {
        let registry = Registry::new();
        let child = registry.subscribe("positions", noop());

        // A parent view listener that keeps its child registration alive.
        let holder = std::sync::Mutex::new(Some(child));
        let parent = registry.subscribe(
            "accounts",
            Arc::new(move |_: &Value| {
                let _ = holder.lock().unwrap().is_some();
            }),
        );
        assert_eq!(registry.listener_count("positions"), 1);

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            parent.unsubscribe();
            let _ = done_tx.send(());
        });
        done_rx
            .recv_timeout(std::time::Duration::from_secs(3))
            .expect("unsubscribe of a listener owning a Subscription hung");

        assert!(registry.resources().is_empty());
    }

    #[test]
    fn test_handle_outliving_registry_is_harmless() {
        let registry = Registry::new();
        let sub = registry.subscribe("accounts", noop());
        drop(registry);
        assert_eq!(sub.resource(), "accounts");
        drop(sub);
    }
}

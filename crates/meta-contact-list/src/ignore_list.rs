use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::types::AccountId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    /// The operation gave up waiting; the next matching event is its late
    /// echo and is swallowed once, unless the window closes first.
    Draining { until: Instant },
}

#[derive(Debug)]
struct Entry {
    token: u64,
    state: EntryState,
}

/// Suppresses protocol events that a local operation is about to cause.
///
/// Keyed by contact address or group name together with the account. Every
/// registration carries its own token so overlapping operations on the same
/// key release only their own entry.
#[derive(Debug)]
pub struct EventIgnoreList {
    entries: Mutex<HashMap<(String, AccountId), Vec<Entry>>>,
    next_token: AtomicU64,
    grace: Duration,
}

/// Handle to one registration. Releasing it (or dropping the guard that owns
/// it) is the only way to remove the entry.
#[derive(Debug)]
pub struct IgnoreToken {
    key: String,
    account: AccountId,
    id: u64,
}

impl EventIgnoreList {
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            grace,
        }
    }

    pub fn register(&self, key: &str, account: &str) -> IgnoreToken {
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .unwrap()
            .entry((key.to_string(), account.to_string()))
            .or_default()
            .push(Entry {
                token: id,
                state: EntryState::Pending,
            });
        IgnoreToken {
            key: key.to_string(),
            account: account.to_string(),
            id,
        }
    }

    /// Registers an entry that is released when the returned guard drops.
    pub fn guard(&self, key: &str, account: &str) -> IgnoreGuard<'_> {
        IgnoreGuard {
            list: self,
            token: Some(self.register(key, account)),
            drain: false,
        }
    }

    /// Whether events for `key` are currently suppressed. Does not consume
    /// drain entries.
    pub fn is_ignored(&self, key: &str, account: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let map_key = (key.to_string(), account.to_string());
        Self::purge_expired(&mut entries, &map_key);
        entries.contains_key(&map_key)
    }

    /// Like [`EventIgnoreList::is_ignored`], but a drain entry is used up by
    /// the event it suppresses.
    pub fn should_ignore(&self, key: &str, account: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let map_key = (key.to_string(), account.to_string());
        Self::purge_expired(&mut entries, &map_key);

        let Some(list) = entries.get_mut(&map_key) else {
            return false;
        };
        if list.iter().any(|e| e.state == EntryState::Pending) {
            return true;
        }
        if let Some(index) = list
            .iter()
            .position(|e| matches!(e.state, EntryState::Draining { .. }))
        {
            let entry = list.remove(index);
            warn!(
                key = %key,
                account = %account,
                token = entry.token,
                "swallowing late event of a timed out operation"
            );
        }
        if list.is_empty() {
            entries.remove(&map_key);
        }
        true
    }

    /// Removes the registration. With `drain` set the entry instead lingers
    /// to swallow one late event.
    pub fn release(&self, token: IgnoreToken, drain: bool) {
        let mut entries = self.entries.lock().unwrap();
        let map_key = (token.key, token.account);
        let Some(list) = entries.get_mut(&map_key) else {
            return;
        };
        if let Some(index) = list.iter().position(|e| e.token == token.id) {
            if drain {
                debug!(key = %map_key.0, account = %map_key.1, "ignore entry now draining");
                list[index].state = EntryState::Draining {
                    until: Instant::now() + self.grace,
                };
            } else {
                list.remove(index);
            }
        }
        if list.is_empty() {
            entries.remove(&map_key);
        }
    }

    fn purge_expired(
        entries: &mut HashMap<(String, AccountId), Vec<Entry>>,
        map_key: &(String, AccountId),
    ) {
        let now = Instant::now();
        if let Some(list) = entries.get_mut(map_key) {
            list.retain(|e| match e.state {
                EntryState::Pending => true,
                EntryState::Draining { until } => until > now,
            });
            if list.is_empty() {
                entries.remove(map_key);
            }
        }
    }
}

/// Releases its registration on drop, on every exit path.
pub struct IgnoreGuard<'a> {
    list: &'a EventIgnoreList,
    token: Option<IgnoreToken>,
    drain: bool,
}

impl IgnoreGuard<'_> {
    /// Marks the operation as timed out so one late echo is still swallowed.
    pub fn drain_on_release(&mut self) {
        self.drain = true;
    }
}

impl Drop for IgnoreGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.list.release(token, self.drain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_release_round_trip() {
        let list = EventIgnoreList::new(Duration::from_secs(30));
        assert!(!list.is_ignored("alice@example.com", "acc"));

        let token = list.register("alice@example.com", "acc");
        assert!(list.is_ignored("alice@example.com", "acc"));
        assert!(!list.is_ignored("alice@example.com", "other"));

        list.release(token, false);
        assert!(!list.is_ignored("alice@example.com", "acc"));
    }

    #[test]
    fn overlapping_registrations_release_independently() {
        let list = EventIgnoreList::new(Duration::from_secs(30));
        let first = list.register("Friends", "acc");
        let second = list.register("Friends", "acc");

        list.release(first, false);
        assert!(list.is_ignored("Friends", "acc"));
        list.release(second, false);
        assert!(!list.is_ignored("Friends", "acc"));
    }

    #[test]
    fn pending_entry_is_not_consumed() {
        let list = EventIgnoreList::new(Duration::from_secs(30));
        let _guard = list.guard("bob@x", "acc");
        assert!(list.should_ignore("bob@x", "acc"));
        assert!(list.should_ignore("bob@x", "acc"));
    }

    #[test]
    fn drained_entry_swallows_exactly_one_event() {
        let list = EventIgnoreList::new(Duration::from_secs(30));
        {
            let mut guard = list.guard("bob@x", "acc");
            guard.drain_on_release();
        }
        assert!(list.is_ignored("bob@x", "acc"));
        assert!(list.should_ignore("bob@x", "acc"));
        assert!(!list.should_ignore("bob@x", "acc"));
        assert!(!list.is_ignored("bob@x", "acc"));
    }

    #[test]
    fn drain_entry_expires() {
        let list = EventIgnoreList::new(Duration::from_millis(0));
        list.release(list.register("bob@x", "acc"), true);
        std::thread::sleep(Duration::from_millis(5));
        assert!(!list.should_ignore("bob@x", "acc"));
    }

    #[test]
    fn guard_releases_on_drop() {
        let list = EventIgnoreList::new(Duration::from_secs(30));
        {
            let _guard = list.guard("carol@x", "acc");
            assert!(list.is_ignored("carol@x", "acc"));
        }
        assert!(!list.is_ignored("carol@x", "acc"));
    }
}

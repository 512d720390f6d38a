use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::events::{MetaContactEvent, MetaContactListListener, MetaContactRenamedEvent, ProtoContactEvent};
use crate::history::{MessageDirection, MessageRecord};
use crate::meta_contact::MetaContact;
use crate::service::MetaContactListService;
use crate::storage::StorageAdapter;
use crate::types::{AccountId, ContactKey, MetaUid};
use crate::Result;

const RECENT_PREFIX: &str = "v1/recent/";

/// The last message exchanged with one protocol contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentMessage {
    pub account: AccountId,
    pub address: String,
    /// Meta contact currently holding the contact, if it is in the list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_uid: Option<MetaUid>,
    pub display_name: String,
    pub text: String,
    pub direction: MessageDirection,
    pub timestamp_ms: u64,
}

impl RecentMessage {
    pub fn contact(&self) -> ContactKey {
        ContactKey::new(self.account.as_str(), self.address.as_str())
    }

    fn link(&mut self, meta_contact: &MetaContact) {
        self.meta_uid = Some(meta_contact.uid().to_string());
        self.display_name = meta_contact.display_name().to_string();
    }
}

fn entry_key(account: &str, address: &str) -> String {
    format!(
        "{}{}/{}",
        RECENT_PREFIX,
        urlencoding::encode(account),
        urlencoding::encode(address)
    )
}

/// Newest-first list of the contacts last talked to, one entry per protocol
/// contact, capped at `limit` entries.
///
/// Registered as a contact list listener it follows renames, moves and
/// removals so every entry names the meta contact it currently belongs to.
pub struct RecentMessages {
    storage: Arc<dyn StorageAdapter>,
    limit: usize,
    entries: Mutex<Vec<RecentMessage>>,
}

impl RecentMessages {
    /// Loads the stored entries, newest first.
    pub fn load(storage: Arc<dyn StorageAdapter>, limit: usize) -> Result<Self> {
        let mut entries = Vec::new();
        for key in storage.list(RECENT_PREFIX)? {
            let Some(raw) = storage.get(&key)? else {
                continue;
            };
            match serde_json::from_str::<RecentMessage>(&raw) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable recent message"),
            }
        }
        let recent = Self {
            storage,
            limit,
            entries: Mutex::new(Vec::new()),
        };
        {
            let mut current = recent.entries.lock().unwrap();
            *current = entries;
            recent.sort_and_trim(&mut current)?;
        }
        Ok(recent)
    }

    /// Records `message` as the latest one with its contact, looked up in
    /// `service`.
    pub fn on_message(&self, service: &MetaContactListService, message: &MessageRecord) -> Result<()> {
        let meta_contact = service.find_meta_contact_by_contact(&message.contact());
        let mut entries = self.entries.lock().unwrap();
        let index = entries
            .iter()
            .position(|e| e.account == message.account && e.address == message.address);
        let entry = match index {
            Some(i) if entries[i].timestamp_ms > message.timestamp_ms => {
                debug!(address = %message.address, "older than the recorded message, ignored");
                return Ok(());
            }
            Some(i) => &mut entries[i],
            None => {
                entries.push(RecentMessage {
                    account: message.account.clone(),
                    address: message.address.clone(),
                    meta_uid: None,
                    display_name: message.address.clone(),
                    text: String::new(),
                    direction: message.direction,
                    timestamp_ms: 0,
                });
                let last = entries.len() - 1;
                &mut entries[last]
            }
        };
        entry.text = message.text.clone();
        entry.direction = message.direction;
        entry.timestamp_ms = message.timestamp_ms;
        match &meta_contact {
            Some(mc) => entry.link(mc),
            None => entry.meta_uid = None,
        }
        let entry = entry.clone();
        self.write(&entry)?;
        self.sort_and_trim(&mut entries)
    }

    /// The newest `count` entries whose contact is still in the list.
    ///
    /// `account` and `address` narrow the result to one provider or one
    /// contact address.
    pub fn recent(&self, count: usize, account: Option<&str>, address: Option<&str>) -> Vec<RecentMessage> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.meta_uid.is_some())
            .filter(|e| account.map_or(true, |a| e.account == a))
            .filter(|e| address.map_or(true, |a| e.address == a))
            .take(count)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deletes every entry.
    pub fn clear(&self) -> Result<()> {
        self.entries.lock().unwrap().clear();
        self.storage.del_prefix(RECENT_PREFIX)?;
        Ok(())
    }

    fn sort_and_trim(&self, entries: &mut Vec<RecentMessage>) -> Result<()> {
        entries.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        if entries.len() > self.limit {
            for dropped in entries.drain(self.limit..) {
                self.storage.del(&entry_key(&dropped.account, &dropped.address))?;
            }
        }
        Ok(())
    }

    fn write(&self, entry: &RecentMessage) -> Result<()> {
        self.storage.put(
            &entry_key(&entry.account, &entry.address),
            serde_json::to_string(entry)?,
        )
    }

    /// Applies `change` to every entry it returns true for and stores them.
    fn update(&self, operation: &str, mut change: impl FnMut(&mut RecentMessage) -> bool) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.iter_mut() {
            if !change(entry) {
                continue;
            }
            if let Err(e) = self.write(entry) {
                error!(operation, error = %e, "failed to persist recent message change");
            }
        }
    }

    fn relink(&self, operation: &str, meta_contact: &MetaContact) {
        self.update(operation, |e| {
            if meta_contact.contact(&e.address, &e.account).is_none() {
                return false;
            }
            e.link(meta_contact);
            true
        });
    }
}

impl MetaContactListListener for RecentMessages {
    fn meta_contact_added(&self, event: &MetaContactEvent) {
        self.relink("meta_contact_added", &event.meta_contact);
    }

    fn meta_contact_removed(&self, event: &MetaContactEvent) {
        let uid = event.meta_contact.uid();
        self.update("meta_contact_removed", |e| {
            if e.meta_uid.as_deref() != Some(uid) {
                return false;
            }
            e.meta_uid = None;
            true
        });
    }

    fn meta_contact_renamed(&self, event: &MetaContactRenamedEvent) {
        let uid = event.meta_contact.uid();
        self.update("meta_contact_renamed", |e| {
            if e.meta_uid.as_deref() != Some(uid) {
                return false;
            }
            e.display_name = event.new_name.clone();
            true
        });
    }

    fn proto_contact_added(&self, event: &ProtoContactEvent) {
        if let Some(parent) = &event.new_parent {
            self.relink("proto_contact_added", parent);
        }
    }

    fn proto_contact_moved(&self, event: &ProtoContactEvent) {
        if let Some(parent) = &event.new_parent {
            self.relink("proto_contact_moved", parent);
        }
    }

    fn proto_contact_removed(&self, event: &ProtoContactEvent) {
        let key = event.contact.key();
        self.update("proto_contact_removed", |e| {
            if e.contact() != key || e.meta_uid.is_none() {
                return false;
            }
            e.meta_uid = None;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn message(address: &str, text: &str, at: u64) -> MessageRecord {
        MessageRecord::at(&ContactKey::new("xmpp", address), MessageDirection::Incoming, text, at)
    }

    #[test]
    fn keeps_newest_entry_per_contact_within_limit() {
        let storage = Arc::new(InMemoryStorage::new());
        let service = MetaContactListService::new(Default::default());
        let recent = RecentMessages::load(storage.clone(), 2).unwrap();

        recent.on_message(&service, &message("a@x", "first", 10)).unwrap();
        recent.on_message(&service, &message("b@x", "second", 20)).unwrap();
        recent.on_message(&service, &message("a@x", "third", 30)).unwrap();
        recent.on_message(&service, &message("a@x", "stale", 5)).unwrap();
        recent.on_message(&service, &message("c@x", "fourth", 40)).unwrap();

        let reloaded = RecentMessages::load(storage.clone(), 2).unwrap();
        assert_eq!(reloaded.len(), 2);
        let entries = reloaded.entries.lock().unwrap().clone();
        let texts: Vec<&str> = entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["fourth", "third"]);
        assert_eq!(storage.len(), 2);

        // None of them is in the list.
        assert!(reloaded.recent(10, None, None).is_empty());
    }
}

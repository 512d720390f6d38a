use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::meta_contact::MetaContact;
use crate::service::MetaContactListService;
use crate::storage::StorageAdapter;
use crate::types::{AccountId, ContactKey};
use crate::Result;

const MESSAGE_PREFIX: &str = "v1/history/msg/";
const LOGGING_KEY: &str = "v1/history/logging";
const DISABLED_PREFIX: &str = "v1/history/disabled/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDirection {
    Incoming,
    Outgoing,
}

/// One logged chat message with one protocol contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub uid: String,
    pub account: AccountId,
    pub address: String,
    pub direction: MessageDirection,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl MessageRecord {
    /// A message stamped with the current time.
    pub fn new(
        contact: &ContactKey,
        direction: MessageDirection,
        text: impl Into<String>,
    ) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self::at(contact, direction, text, timestamp_ms)
    }

    pub fn at(
        contact: &ContactKey,
        direction: MessageDirection,
        text: impl Into<String>,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            account: contact.account.clone(),
            address: contact.address.clone(),
            direction,
            text: text.into(),
            timestamp_ms,
        }
    }

    pub fn contact(&self) -> ContactKey {
        ContactKey::new(self.account.as_str(), self.address.as_str())
    }

    fn matches(&self, keywords: &[&str], case_sensitive: bool) -> bool {
        if case_sensitive {
            keywords.iter().all(|k| self.text.contains(k))
        } else {
            let text = self.text.to_lowercase();
            keywords.iter().all(|k| text.contains(&k.to_lowercase()))
        }
    }
}

fn contact_prefix(account: &str, address: &str) -> String {
    format!(
        "{}{}/{}/",
        MESSAGE_PREFIX,
        urlencoding::encode(account),
        urlencoding::encode(address)
    )
}

fn message_key(record: &MessageRecord) -> String {
    format!(
        "{}{:020}/{}",
        contact_prefix(&record.account, &record.address),
        record.timestamp_ms,
        record.uid
    )
}

/// Splits a message key back into the contact it belongs to.
fn contact_of_key(key: &str) -> Option<ContactKey> {
    let mut parts = key.strip_prefix(MESSAGE_PREFIX)?.split('/');
    let account = urlencoding::decode(parts.next()?).ok()?;
    let address = urlencoding::decode(parts.next()?).ok()?;
    Some(ContactKey::new(account.into_owned(), address.into_owned()))
}

/// Per-contact chat history stored as JSON rows in a [`StorageAdapter`].
///
/// Rows live under `v1/history/msg/{account}/{address}/{timestamp}/{uid}`,
/// so listing one contact's prefix yields its messages oldest first. Queries
/// take a [`MetaContact`] and merge the histories of all its members.
pub struct MessageHistory {
    storage: Arc<dyn StorageAdapter>,
}

impl MessageHistory {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    /// Stores `record` unless logging is off globally or for its address.
    /// Returns whether the message was written.
    pub fn record_message(&self, record: &MessageRecord) -> Result<bool> {
        if !self.is_history_logging_enabled()? || !self.is_history_logging_enabled_for(&record.address)? {
            debug!(address = %record.address, "history logging disabled, message not stored");
            return Ok(false);
        }
        self.storage
            .put(&message_key(record), serde_json::to_string(record)?)?;
        Ok(true)
    }

    /// Messages at or after `start`.
    pub fn find_by_start_date(&self, meta_contact: &MetaContact, start: u64) -> Result<Vec<MessageRecord>> {
        self.query(meta_contact, |r| r.timestamp_ms >= start)
    }

    /// Messages before `end`.
    pub fn find_by_end_date(&self, meta_contact: &MetaContact, end: u64) -> Result<Vec<MessageRecord>> {
        self.query(meta_contact, |r| r.timestamp_ms < end)
    }

    /// Messages in `[start, end)` containing every keyword.
    pub fn find_by_period(
        &self,
        meta_contact: &MetaContact,
        start: u64,
        end: u64,
        keywords: &[&str],
        case_sensitive: bool,
    ) -> Result<Vec<MessageRecord>> {
        self.query(meta_contact, |r| {
            r.timestamp_ms >= start && r.timestamp_ms < end && r.matches(keywords, case_sensitive)
        })
    }

    pub fn find_by_keyword(
        &self,
        meta_contact: &MetaContact,
        keyword: &str,
        case_sensitive: bool,
    ) -> Result<Vec<MessageRecord>> {
        self.find_by_keywords(meta_contact, &[keyword], case_sensitive)
    }

    pub fn find_by_keywords(
        &self,
        meta_contact: &MetaContact,
        keywords: &[&str],
        case_sensitive: bool,
    ) -> Result<Vec<MessageRecord>> {
        self.query(meta_contact, |r| r.matches(keywords, case_sensitive))
    }

    /// The newest `count` messages, oldest first.
    pub fn find_last(&self, meta_contact: &MetaContact, count: usize) -> Result<Vec<MessageRecord>> {
        let mut all = self.query(meta_contact, |_| true)?;
        let skip = all.len().saturating_sub(count);
        Ok(all.split_off(skip))
    }

    /// Up to `count` messages strictly after `date`, oldest first.
    pub fn find_first_messages_after(
        &self,
        meta_contact: &MetaContact,
        date: u64,
        count: usize,
    ) -> Result<Vec<MessageRecord>> {
        let mut after = self.query(meta_contact, |r| r.timestamp_ms > date)?;
        after.truncate(count);
        Ok(after)
    }

    /// Up to `count` messages strictly before `date`, oldest first.
    pub fn find_last_messages_before(
        &self,
        meta_contact: &MetaContact,
        date: u64,
        count: usize,
    ) -> Result<Vec<MessageRecord>> {
        let mut before = self.query(meta_contact, |r| r.timestamp_ms < date)?;
        let skip = before.len().saturating_sub(count);
        Ok(before.split_off(skip))
    }

    /// The latest message of each contact still in the list, newest first.
    ///
    /// `account` and `address` narrow the search to one provider or one
    /// contact address.
    pub fn find_recent_messages_per_contact(
        &self,
        service: &MetaContactListService,
        count: usize,
        account: Option<&str>,
        address: Option<&str>,
    ) -> Result<Vec<MessageRecord>> {
        // Keys sort by timestamp within a contact, so the last one wins.
        let mut latest: BTreeMap<ContactKey, String> = BTreeMap::new();
        for key in self.storage.list(MESSAGE_PREFIX)? {
            if let Some(contact) = contact_of_key(&key) {
                latest.insert(contact, key);
            }
        }

        let mut recent = Vec::new();
        for (contact, key) in latest {
            if account.is_some_and(|a| a != contact.account)
                || address.is_some_and(|a| a != contact.address)
            {
                continue;
            }
            if service.find_meta_contact_by_contact(&contact).is_none() {
                continue;
            }
            if let Some(record) = self.read(&key)? {
                recent.push(record);
            }
        }
        recent.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        recent.truncate(count);
        Ok(recent)
    }

    /// Deletes every stored message.
    pub fn erase_all(&self) -> Result<usize> {
        let removed = self.storage.del_prefix(MESSAGE_PREFIX)?;
        debug!(messages = removed, "message history erased");
        Ok(removed)
    }

    /// Deletes the history of `meta_contact`, or only the messages whose
    /// uid is in `message_uids` when given.
    pub fn erase_for_meta_contact(
        &self,
        meta_contact: &MetaContact,
        message_uids: Option<&[String]>,
    ) -> Result<usize> {
        let mut removed = 0;
        for contact in meta_contact.contacts() {
            let prefix = contact_prefix(&contact.account, &contact.address);
            match message_uids {
                None => removed += self.storage.del_prefix(&prefix)?,
                Some(uids) => {
                    for key in self.storage.list(&prefix)? {
                        if uids.iter().any(|uid| key.ends_with(&format!("/{}", uid))) {
                            self.storage.del(&key)?;
                            removed += 1;
                        }
                    }
                }
            }
        }
        debug!(meta = %meta_contact.uid(), messages = removed, "meta contact history erased");
        Ok(removed)
    }

    pub fn is_history_logging_enabled(&self) -> Result<bool> {
        Ok(self.storage.get(LOGGING_KEY)?.as_deref() != Some("false"))
    }

    pub fn set_history_logging_enabled(&self, enabled: bool) -> Result<()> {
        if enabled {
            self.storage.del(LOGGING_KEY)
        } else {
            self.storage.put(LOGGING_KEY, "false".to_string())
        }
    }

    /// Logging state of one contact address or chat room id.
    pub fn is_history_logging_enabled_for(&self, id: &str) -> Result<bool> {
        Ok(self.storage.get(&disabled_key(id))?.is_none())
    }

    pub fn set_history_logging_enabled_for(&self, id: &str, enabled: bool) -> Result<()> {
        if enabled {
            self.storage.del(&disabled_key(id))
        } else {
            self.storage.put(&disabled_key(id), "true".to_string())
        }
    }

    fn query(
        &self,
        meta_contact: &MetaContact,
        keep: impl Fn(&MessageRecord) -> bool,
    ) -> Result<Vec<MessageRecord>> {
        let mut records = Vec::new();
        for contact in meta_contact.contacts() {
            for key in self.storage.list(&contact_prefix(&contact.account, &contact.address))? {
                match self.read(&key)? {
                    Some(record) if keep(&record) => records.push(record),
                    _ => {}
                }
            }
        }
        records.sort_by(|a, b| {
            a.timestamp_ms
                .cmp(&b.timestamp_ms)
                .then_with(|| a.uid.cmp(&b.uid))
        });
        Ok(records)
    }

    /// Unparseable rows are logged and skipped.
    fn read(&self, key: &str) -> Result<Option<MessageRecord>> {
        let Some(raw) = self.storage.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(key = %key, error = %e, "skipping unreadable history record");
                Ok(None)
            }
        }
    }
}

fn disabled_key(id: &str) -> String {
    format!("{}{}", DISABLED_PREFIX, urlencoding::encode(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::types::{CapabilitySet, ProtoContact, ProtoGroup};

    fn bob() -> MetaContact {
        let mut mc = MetaContact::new();
        mc.add_proto_contact(
            ProtoContact::new(ProtoGroup::root("xmpp").id, "bob@x"),
            CapabilitySet::empty(),
        );
        mc.add_proto_contact(
            ProtoContact::new(ProtoGroup::root("sip").id, "bob/desk@sip"),
            CapabilitySet::empty(),
        );
        mc
    }

    fn history_with(messages: &[(&str, &str, &str, u64)]) -> MessageHistory {
        let history = MessageHistory::new(Arc::new(InMemoryStorage::new()));
        for (account, address, text, at) in messages {
            let record = MessageRecord::at(
                &ContactKey::new(*account, *address),
                MessageDirection::Incoming,
                *text,
                *at,
            );
            history.record_message(&record).unwrap();
        }
        history
    }

    fn texts(records: &[MessageRecord]) -> Vec<&str> {
        records.iter().map(|r| r.text.as_str()).collect()
    }

    #[test]
    fn queries_merge_members_in_time_order() {
        let history = history_with(&[
            ("xmpp", "bob@x", "one", 10),
            ("sip", "bob/desk@sip", "two", 20),
            ("xmpp", "bob@x", "three", 30),
            ("xmpp", "carol@x", "other", 25),
        ]);
        let bob = bob();

        assert_eq!(texts(&history.find_by_start_date(&bob, 20).unwrap()), vec!["two", "three"]);
        assert_eq!(texts(&history.find_by_end_date(&bob, 20).unwrap()), vec!["one"]);
        assert_eq!(texts(&history.find_last(&bob, 2).unwrap()), vec!["two", "three"]);
        assert_eq!(texts(&history.find_first_messages_after(&bob, 10, 1).unwrap()), vec!["two"]);
        assert_eq!(texts(&history.find_last_messages_before(&bob, 30, 5).unwrap()), vec!["one", "two"]);
    }

    #[test]
    fn keyword_search_needs_every_keyword() {
        let history = history_with(&[
            ("xmpp", "bob@x", "Lunch at noon?", 10),
            ("xmpp", "bob@x", "lunch is late", 20),
        ]);
        let bob = bob();

        assert_eq!(history.find_by_keyword(&bob, "lunch", false).unwrap().len(), 2);
        assert_eq!(history.find_by_keyword(&bob, "lunch", true).unwrap().len(), 1);
        assert_eq!(texts(&history.find_by_keywords(&bob, &["lunch", "noon"], false).unwrap()), vec!["Lunch at noon?"]);
        assert!(history.find_by_period(&bob, 15, 30, &["noon"], false).unwrap().is_empty());
    }

    #[test]
    fn logging_switches_are_persisted() {
        let storage = Arc::new(InMemoryStorage::new());
        let history = MessageHistory::new(storage.clone());
        let record = MessageRecord::at(&ContactKey::new("xmpp", "bob@x"), MessageDirection::Outgoing, "hi", 1);

        history.set_history_logging_enabled_for("bob@x", false).unwrap();
        assert!(!history.record_message(&record).unwrap());

        let reopened = MessageHistory::new(storage);
        assert!(!reopened.is_history_logging_enabled_for("bob@x").unwrap());
        reopened.set_history_logging_enabled_for("bob@x", true).unwrap();
        reopened.set_history_logging_enabled(false).unwrap();
        assert!(!reopened.record_message(&record).unwrap());
        reopened.set_history_logging_enabled(true).unwrap();
        assert!(reopened.record_message(&record).unwrap());
    }

    #[test]
    fn erase_selected_messages_only() {
        let history = history_with(&[
            ("xmpp", "bob@x", "keep", 10),
            ("sip", "bob/desk@sip", "drop", 20),
        ]);
        let bob = bob();
        let drop_uid = history.find_by_keyword(&bob, "drop", true).unwrap()[0].uid.clone();

        assert_eq!(history.erase_for_meta_contact(&bob, Some(&[drop_uid][..])).unwrap(), 1);
        assert_eq!(texts(&history.find_last(&bob, 10).unwrap()), vec!["keep"]);
        assert_eq!(history.erase_for_meta_contact(&bob, None).unwrap(), 1);
        assert!(history.find_last(&bob, 10).unwrap().is_empty());
    }

    #[test]
    fn message_keys_round_trip_addresses_with_slashes() {
        let record = MessageRecord::at(&ContactKey::new("sip", "bob/desk@sip"), MessageDirection::Incoming, "x", 5);
        assert_eq!(contact_of_key(&message_key(&record)), Some(record.contact()));
    }
}

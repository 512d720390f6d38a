use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::events::{
    GroupEventKind, MetaContactAvatarUpdateEvent, MetaContactEvent, MetaContactGroupEvent,
    MetaContactListListener, MetaContactModifiedEvent, MetaContactMovedEvent,
    MetaContactRenamedEvent, ProtoContactEvent,
};
use crate::meta_contact::MetaContact;
use crate::meta_group::MetaContactGroup;
use crate::persistence::ContactListPersistence;
use crate::service::{MetaContactListService, StoredContactDescriptor};
use crate::storage::StorageAdapter;
use crate::types::{AccountId, ContactKey, ProtoGroupId};
use crate::Result;

const KEY_PREFIX: &str = "v1/mcl/";
const GROUP_PREFIX: &str = "v1/mcl/group/";
const CONTACT_PREFIX: &str = "v1/mcl/contact/";

/// One server group aggregated by a meta group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredGroupRecord {
    pub account: AccountId,
    pub group_uid: String,
    pub name: String,
    pub parent_proto_group_uid: String,
    pub proto_group_uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_data: Option<String>,
}

/// One protocol contact of a meta contact, with the meta contact's own
/// attributes repeated on every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredContactRecord {
    pub account: AccountId,
    pub meta_uid: String,
    pub proto_group_uid: String,
    pub address: String,
    pub display_name: String,
    #[serde(default)]
    pub user_defined: bool,
    #[serde(default)]
    pub contact_display_name: String,
    #[serde(default)]
    pub details: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_data: Option<String>,
}

/// Persists the contact list as JSON records in a [`StorageAdapter`].
///
/// Keys are `v1/mcl/group/{meta group}/{account}/{server group}` and
/// `v1/mcl/contact/{meta contact}/{account}/{address}`. The root group and
/// non-persistent groups and contacts are never written.
pub struct MclStorage {
    storage: Arc<dyn StorageAdapter>,
}

fn group_key(group_uid: &str, account: &str, proto_uid: &str) -> String {
    format!("{}{}/{}/{}", GROUP_PREFIX, group_uid, account, proto_uid)
}

fn contact_key(meta_uid: &str, account: &str, address: &str) -> String {
    format!("{}{}/{}/{}", CONTACT_PREFIX, meta_uid, account, address)
}

impl MclStorage {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    /// Accounts that have at least one stored record.
    pub fn accounts(&self) -> Result<Vec<AccountId>> {
        let mut accounts = BTreeSet::new();
        for record in self.group_records(None)? {
            accounts.insert(record.account);
        }
        for record in self.contact_records(None)? {
            accounts.insert(record.account);
        }
        Ok(accounts.into_iter().collect())
    }

    pub fn group_records(&self, account: Option<&str>) -> Result<Vec<StoredGroupRecord>> {
        self.records(GROUP_PREFIX, |r: &StoredGroupRecord| {
            account.map_or(true, |a| r.account == a)
        })
    }

    pub fn contact_records(&self, account: Option<&str>) -> Result<Vec<StoredContactRecord>> {
        self.records(CONTACT_PREFIX, |r: &StoredContactRecord| {
            account.map_or(true, |a| r.account == a)
        })
    }

    /// Unparseable rows are logged and skipped.
    fn records<T>(&self, prefix: &str, keep: impl Fn(&T) -> bool) -> Result<Vec<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let mut records = Vec::new();
        for key in self.storage.list(prefix)? {
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            match serde_json::from_str::<T>(&raw) {
                Ok(record) if keep(&record) => records.push(record),
                Ok(_) => {}
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable contact list record"),
            }
        }
        Ok(records)
    }

    fn write_meta_contact(&self, meta_contact: &MetaContact) -> Result<()> {
        for contact in meta_contact.contacts().iter().filter(|c| c.persistent) {
            let record = StoredContactRecord {
                account: contact.account.clone(),
                meta_uid: meta_contact.uid().to_string(),
                proto_group_uid: contact.parent.uid.clone(),
                address: contact.address.clone(),
                display_name: meta_contact.display_name().to_string(),
                user_defined: meta_contact.is_display_name_user_defined(),
                contact_display_name: contact.display_name.clone(),
                details: meta_contact.details().clone(),
                persistent_data: contact.persistent_data.clone(),
            };
            self.storage.put(
                &contact_key(&record.meta_uid, &record.account, &record.address),
                serde_json::to_string(&record)?,
            )?;
        }
        Ok(())
    }

    fn delete_meta_contact(&self, uid: &str) -> Result<()> {
        let removed = self.storage.del_prefix(&format!("{}{}/", CONTACT_PREFIX, uid))?;
        debug!(meta = %uid, records = removed, "meta contact records deleted");
        Ok(())
    }

    fn delete_contact(&self, meta_uid: &str, contact: &ContactKey) -> Result<()> {
        self.storage
            .del(&contact_key(meta_uid, &contact.account, &contact.address))
    }

    fn write_group(&self, group: &MetaContactGroup) -> Result<()> {
        if group.is_root() {
            return Ok(());
        }
        for proto_group in group.contact_groups().iter().filter(|g| g.persistent) {
            let Some(parent) = &proto_group.parent else {
                continue;
            };
            let record = StoredGroupRecord {
                account: proto_group.account().to_string(),
                group_uid: group.uid().to_string(),
                name: group.name().to_string(),
                parent_proto_group_uid: parent.uid.clone(),
                proto_group_uid: proto_group.id.uid.clone(),
                persistent_data: proto_group.persistent_data.clone(),
            };
            self.storage.put(
                &group_key(&record.group_uid, &record.account, &record.proto_group_uid),
                serde_json::to_string(&record)?,
            )?;
        }
        Ok(())
    }

    fn delete_group(&self, uid: &str) -> Result<()> {
        self.storage.del_prefix(&format!("{}{}/", GROUP_PREFIX, uid))?;
        Ok(())
    }

    fn write_subtree(&self, event: &MetaContactGroupEvent) -> Result<()> {
        self.write_group(&event.group)?;
        for group in &event.descendant_groups {
            self.write_group(group)?;
        }
        for meta_contact in &event.descendant_contacts {
            self.write_meta_contact(meta_contact)?;
        }
        Ok(())
    }

    fn delete_subtree(&self, event: &MetaContactGroupEvent) -> Result<()> {
        self.delete_group(event.group.uid())?;
        for group in &event.descendant_groups {
            self.delete_group(group.uid())?;
        }
        for meta_contact in &event.descendant_contacts {
            self.delete_meta_contact(meta_contact.uid())?;
        }
        Ok(())
    }

    fn log_failure(operation: &str, result: Result<()>) {
        if let Err(e) = result {
            error!(operation, error = %e, "failed to persist contact list change");
        }
    }
}

impl MetaContactListListener for MclStorage {
    fn meta_contact_added(&self, event: &MetaContactEvent) {
        Self::log_failure("meta_contact_added", self.write_meta_contact(&event.meta_contact));
    }

    fn meta_contact_removed(&self, event: &MetaContactEvent) {
        Self::log_failure(
            "meta_contact_removed",
            self.delete_meta_contact(event.meta_contact.uid()),
        );
    }

    fn meta_contact_renamed(&self, event: &MetaContactRenamedEvent) {
        Self::log_failure("meta_contact_renamed", self.write_meta_contact(&event.meta_contact));
    }

    fn meta_contact_moved(&self, event: &MetaContactMovedEvent) {
        Self::log_failure("meta_contact_moved", self.write_meta_contact(&event.meta_contact));
    }

    fn meta_contact_modified(&self, event: &MetaContactModifiedEvent) {
        Self::log_failure("meta_contact_modified", self.write_meta_contact(&event.meta_contact));
    }

    fn meta_contact_avatar_updated(&self, event: &MetaContactAvatarUpdateEvent) {
        Self::log_failure("avatar_updated", self.write_meta_contact(&event.meta_contact));
    }

    fn meta_contact_group_added(&self, event: &MetaContactGroupEvent) {
        Self::log_failure("group_added", self.write_subtree(event));
    }

    fn meta_contact_group_removed(&self, event: &MetaContactGroupEvent) {
        Self::log_failure("group_removed", self.delete_subtree(event));
    }

    fn meta_contact_group_modified(&self, event: &MetaContactGroupEvent) {
        let result = match (&event.kind, &event.proto_group) {
            (GroupEventKind::ContactGroupRemoved, Some(proto_group)) => self.storage.del(&group_key(
                event.group.uid(),
                proto_group.account(),
                &proto_group.id.uid,
            )),
            _ => self.write_group(&event.group),
        };
        Self::log_failure("group_modified", result);
    }

    fn proto_contact_added(&self, event: &ProtoContactEvent) {
        if let Some(parent) = &event.new_parent {
            Self::log_failure("proto_contact_added", self.write_meta_contact(parent));
        }
    }

    fn proto_contact_moved(&self, event: &ProtoContactEvent) {
        let result = (|| {
            if let Some(old) = &event.old_parent {
                self.delete_contact(old.uid(), &event.contact.key())?;
                self.write_meta_contact(old)?;
            }
            if let Some(new) = &event.new_parent {
                self.write_meta_contact(new)?;
            }
            Ok(())
        })();
        Self::log_failure("proto_contact_moved", result);
    }

    fn proto_contact_removed(&self, event: &ProtoContactEvent) {
        if let Some(old) = &event.old_parent {
            Self::log_failure(
                "proto_contact_removed",
                self.delete_contact(old.uid(), &event.contact.key()),
            );
        }
    }

    fn proto_contact_renamed(&self, event: &ProtoContactEvent) {
        if let Some(parent) = &event.new_parent {
            Self::log_failure("proto_contact_renamed", self.write_meta_contact(parent));
        }
    }

    fn proto_contact_modified(&self, event: &ProtoContactEvent) {
        if let Some(parent) = &event.new_parent {
            Self::log_failure("proto_contact_modified", self.write_meta_contact(parent));
        }
    }

    fn wants_transient_events(&self) -> bool {
        false
    }
}

impl ContactListPersistence for MclStorage {
    /// Loads groups parent-first, then meta contacts. Records whose parent
    /// cannot be found are logged and skipped.
    fn restore_account(&self, service: &MetaContactListService, account: &str) -> Result<()> {
        let mut pending = self.group_records(Some(account))?;
        loop {
            let before = pending.len();
            pending.retain(|record| {
                let parent_proto = ProtoGroupId::new(account, record.parent_proto_group_uid.as_str());
                let Some(parent) = service.find_meta_contact_group_by_contact_group(&parent_proto) else {
                    return true;
                };
                let loaded = service
                    .load_stored_meta_contact_group(parent.uid(), &record.group_uid, &record.name)
                    .and_then(|_| {
                        service.load_stored_contact_group(
                            &record.group_uid,
                            &record.proto_group_uid,
                            &record.name,
                            &parent_proto,
                            record.persistent_data.as_deref(),
                            account,
                        )
                    });
                if let Err(e) = loaded {
                    warn!(group = %record.group_uid, error = %e, "failed to restore stored group");
                }
                false
            });
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }
        for orphan in &pending {
            warn!(
                group = %orphan.group_uid,
                parent = %orphan.parent_proto_group_uid,
                "stored group has no known parent, skipped"
            );
        }

        let mut by_meta: BTreeMap<String, Vec<StoredContactRecord>> = BTreeMap::new();
        for record in self.contact_records(Some(account))? {
            by_meta.entry(record.meta_uid.clone()).or_default().push(record);
        }
        let mut restored = 0;
        for (meta_uid, records) in by_meta {
            let first = &records[0];
            let proto_group = ProtoGroupId::new(account, first.proto_group_uid.as_str());
            let Some(parent) = service.find_meta_contact_group_by_contact_group(&proto_group) else {
                warn!(meta = %meta_uid, group = %proto_group, "stored contact has no known group, skipped");
                continue;
            };
            let descriptors: Vec<StoredContactDescriptor> = records
                .iter()
                .map(|r| StoredContactDescriptor {
                    address: r.address.clone(),
                    display_name: r.contact_display_name.clone(),
                    proto_group_uid: r.proto_group_uid.clone(),
                    persistent_data: r.persistent_data.clone(),
                })
                .collect();
            match service.load_stored_meta_contact(
                parent.uid(),
                &meta_uid,
                &first.display_name,
                first.user_defined,
                first.details.clone(),
                &descriptors,
                account,
            ) {
                Ok(_) => restored += 1,
                Err(e) => warn!(meta = %meta_uid, error = %e, "failed to restore stored meta contact"),
            }
        }
        debug!(account = %account, meta_contacts = restored, "stored contact list restored");
        Ok(())
    }

    fn purge(&self) -> Result<()> {
        let removed = self.storage.del_prefix(KEY_PREFIX)?;
        debug!(records = removed, "stored contact list purged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MclConfig;
    use crate::events::{MetaContactEventKind, MetaContactListEvent};
    use crate::offline::OfflineProvider;
    use crate::storage::InMemoryStorage;
    use crate::types::{CapabilitySet, ProtoContact, ProtoGroup};

    fn group_with_proto(name: &str, proto: ProtoGroup) -> MetaContactGroup {
        let mut group = MetaContactGroup::new(name);
        group.add_proto_group(proto);
        group
    }

    #[test]
    fn restores_groups_and_contacts_for_account() {
        let storage = Arc::new(InMemoryStorage::new());
        let mcl = MclStorage::new(storage.clone());

        let root = ProtoGroup::root("acc");
        let friends_proto = ProtoGroup::new(&root.id, "friends", "Friends");
        let close_proto = ProtoGroup::new(&friends_proto.id, "close", "Close");
        let friends = group_with_proto("Friends", friends_proto.clone());
        let close = group_with_proto("Close", close_proto.clone());

        let mut alice = MetaContact::new();
        alice.add_proto_contact(
            ProtoContact::new(close_proto.id.clone(), "alice@x").with_display_name("Alice"),
            CapabilitySet::empty(),
        );
        alice.add_detail("phone", "123".to_string());

        // Child group arrives before its parent.
        mcl.write_group(&close).unwrap();
        mcl.write_group(&friends).unwrap();
        mcl.write_meta_contact(&alice).unwrap();
        assert_eq!(mcl.accounts().unwrap(), vec!["acc".to_string()]);

        let service = MetaContactListService::with_persistence(MclConfig::default(), Arc::new(mcl));
        service.add_provider(Arc::new(OfflineProvider::new("acc"))).unwrap();

        let restored_friends = service.group(friends.uid()).expect("friends restored");
        assert_eq!(restored_friends.name(), "Friends");
        let restored_close = service.group(close.uid()).expect("close restored");
        assert_eq!(restored_close.parent_group(), Some(friends.uid()));

        let restored = service.meta_contact(alice.uid()).expect("alice restored");
        assert_eq!(restored.parent_group(), Some(close.uid()));
        assert_eq!(restored.display_name(), "Alice");
        assert_eq!(restored.details_for("phone"), ["123".to_string()]);
        assert!(!restored.contacts()[0].resolved);

        // Loading is transient: nothing new was written.
        assert_eq!(storage.list(KEY_PREFIX).unwrap().len(), 3);
    }

    #[test]
    fn orphaned_records_are_skipped() {
        let storage = Arc::new(InMemoryStorage::new());
        let record = StoredContactRecord {
            account: "acc".into(),
            meta_uid: "m1".into(),
            proto_group_uid: "missing".into(),
            address: "bob@x".into(),
            display_name: "Bob".into(),
            user_defined: false,
            contact_display_name: "Bob".into(),
            details: BTreeMap::new(),
            persistent_data: None,
        };
        storage
            .put(&contact_key("m1", "acc", "bob@x"), serde_json::to_string(&record).unwrap())
            .unwrap();
        storage.put("v1/mcl/group/broken", "not json".into()).unwrap();

        let service =
            MetaContactListService::with_persistence(MclConfig::default(), Arc::new(MclStorage::new(storage)));
        service.add_provider(Arc::new(OfflineProvider::new("acc"))).unwrap();
        assert!(service.meta_contact("m1").is_none());
    }

    #[test]
    fn removal_events_delete_records() {
        let storage = Arc::new(InMemoryStorage::new());
        let mcl = MclStorage::new(storage.clone());
        let root = ProtoGroup::root("acc");
        let mut bob = MetaContact::new();
        bob.add_proto_contact(ProtoContact::new(root.id.clone(), "bob@x"), CapabilitySet::empty());

        let added = MetaContactListEvent::meta_contact(MetaContactEventKind::Added, bob.clone(), None);
        let MetaContactListEvent::MetaContact(added) = added else {
            unreachable!()
        };
        mcl.meta_contact_added(&added);
        assert_eq!(storage.len(), 1);

        mcl.meta_contact_removed(&added);
        assert!(storage.is_empty());
    }

    #[test]
    fn purge_removes_everything() {
        let storage = Arc::new(InMemoryStorage::new());
        let mcl = MclStorage::new(storage.clone());
        let root = ProtoGroup::root("acc");
        mcl.write_group(&group_with_proto("Work", ProtoGroup::new(&root.id, "w", "Work")))
            .unwrap();
        storage.put("unrelated", "x".into()).unwrap();
        mcl.purge().unwrap();
        assert_eq!(storage.list("").unwrap(), vec!["unrelated".to_string()]);
    }
}

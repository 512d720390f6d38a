//! Rebuilding the tree from persisted records.
//!
//! Everything here is idempotent and fires its events as transient, so
//! persistence listeners do not write back what they are reading.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::sync::subtree_event;
use super::MetaContactListService;
use crate::events::{GroupEventKind, MetaContactEventKind, MetaContactListEvent, ProtoContactEventKind};
use crate::meta_contact::MetaContact;
use crate::meta_group::MetaContactGroup;
use crate::protocol::capabilities_of;
use crate::types::{ContactKey, ProtoGroup, ProtoGroupId};
use crate::{Error, Result};

/// A protocol contact as it was stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContactDescriptor {
    pub address: String,
    pub display_name: String,
    /// Uid of the server group holding the contact, within its account.
    pub proto_group_uid: String,
    pub persistent_data: Option<String>,
}

impl MetaContactListService {
    /// Returns the group `uid`, creating it under `parent` if it is not
    /// loaded yet.
    pub fn load_stored_meta_contact_group(
        &self,
        parent: &str,
        uid: &str,
        name: &str,
    ) -> Result<MetaContactGroup> {
        let (group, event) = {
            let mut tree = self.lock_tree();
            if let Some(existing) = tree.group(uid) {
                return Ok(existing.clone());
            }
            tree.require_group(parent)?;
            tree.insert_group(parent, MetaContactGroup::with_uid(uid, name))?;
            let group = tree.require_group(uid)?.clone();
            (group, subtree_event(&tree, GroupEventKind::Added, uid))
        };
        self.fire_transient(event.into_iter().collect());
        Ok(group)
    }

    /// Attaches an unresolved server group, built by the account's provider,
    /// to the meta group `meta_group`.
    pub fn load_stored_contact_group(
        &self,
        meta_group: &str,
        uid: &str,
        name: &str,
        parent_proto: &ProtoGroupId,
        persistent_data: Option<&str>,
        account: &str,
    ) -> Result<ProtoGroup> {
        let id = ProtoGroupId::new(account, uid);
        {
            let tree = self.lock_tree();
            tree.require_group(meta_group)?;
            if let Some(owner) = tree.find_group_by_proto_group(&id) {
                if let Some(existing) = owner.contact_groups().iter().find(|g| g.id == id) {
                    return Ok(existing.clone());
                }
            }
        }

        let provider = self.require_provider(account)?;
        let proto_group = provider.create_unresolved_group(uid, name, persistent_data, parent_proto)?;

        let snapshot = {
            let mut tree = self.lock_tree();
            if !tree.add_proto_group(meta_group, proto_group.clone()) {
                return Err(Error::InvalidArgument(format!(
                    "unknown meta contact group {}",
                    meta_group
                )));
            }
            tree.group(meta_group).cloned()
        };
        if let Some(snapshot) = snapshot {
            self.fire_transient(vec![MetaContactListEvent::group(
                GroupEventKind::ContactGroupAdded,
                snapshot,
                Some(account.to_string()),
                Some(proto_group.clone()),
            )]);
        }
        Ok(proto_group)
    }

    /// Returns the meta contact `uid`, creating it under `parent` from the
    /// stored members of `account` if it is not loaded yet.
    ///
    /// Members already in the list are skipped. A meta contact loaded earlier
    /// from another account gains this account's members.
    #[allow(clippy::too_many_arguments)]
    pub fn load_stored_meta_contact(
        &self,
        parent: &str,
        uid: &str,
        display_name: &str,
        name_user_defined: bool,
        details: BTreeMap<String, Vec<String>>,
        descriptors: &[StoredContactDescriptor],
        account: &str,
    ) -> Result<MetaContact> {
        let provider = self.require_provider(account)?;

        let mut members = Vec::new();
        {
            let tree = self.lock_tree();
            for descriptor in descriptors {
                let key = ContactKey::new(account, descriptor.address.as_str());
                if tree.find_meta_contact_by_contact(&key).is_some() {
                    warn!(contact = %key, meta = %uid, "stored contact is already in the list, skipped");
                    continue;
                }
                members.push((descriptor, key));
            }
        }

        let mut contacts = Vec::new();
        for (descriptor, key) in members {
            let parent_proto = ProtoGroupId::new(account, descriptor.proto_group_uid.as_str());
            let mut contact = provider.create_unresolved_contact(
                &descriptor.address,
                descriptor.persistent_data.as_deref(),
                &parent_proto,
            )?;
            if !descriptor.display_name.is_empty() {
                contact.display_name = descriptor.display_name.clone();
            }
            let capabilities = capabilities_of(provider.as_ref(), &key);
            contacts.push((contact, capabilities));
        }

        let mut events = Vec::new();
        let loaded = {
            let mut tree = self.lock_tree();
            if tree.meta_contact(uid).is_some() {
                for (contact, capabilities) in contacts {
                    tree.add_proto_contact(uid, contact.clone(), capabilities)?;
                    events.push(MetaContactListEvent::proto_contact(
                        ProtoContactEventKind::Added,
                        contact,
                        None,
                        tree.meta_contact(uid).cloned(),
                    ));
                }
                tree.require_meta_contact(uid)?.clone()
            } else {
                if contacts.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "stored meta contact {} has no loadable contacts",
                        uid
                    )));
                }
                tree.require_group(parent)?;
                let mut meta_contact = MetaContact::with_uid(uid);
                for (contact, capabilities) in contacts {
                    meta_contact.add_proto_contact(contact, capabilities);
                }
                if !display_name.is_empty() {
                    meta_contact.set_display_name(display_name);
                }
                meta_contact.set_display_name_user_defined(name_user_defined);
                meta_contact.set_details(details);
                tree.insert_meta_contact(parent, meta_contact)?;
                let loaded = tree.require_meta_contact(uid)?.clone();
                events.push(MetaContactListEvent::meta_contact(
                    MetaContactEventKind::Added,
                    loaded.clone(),
                    Some(parent.to_string()),
                ));
                loaded
            }
        };
        debug!(meta = %uid, account = %account, contacts = loaded.contact_count(), "stored meta contact loaded");
        self.fire_transient(events);
        Ok(loaded)
    }
}

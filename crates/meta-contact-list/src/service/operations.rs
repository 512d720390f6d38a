//! Caller-invoked mutations.
//!
//! Each operation that needs the server follows the same sequence: resolve
//! the server group path, suppress the echo of the change through the ignore
//! lists, issue the provider call, block on the confirmation and only then
//! mutate the tree. Guards release the ignore entries and retrievers on every
//! exit path.

use tracing::{debug, info, warn};

use super::sync::{remove_proto_group_locally, subtree_event};
use super::{log_provider_failure, map_provider_error, MetaContactListService};
use crate::events::{
    GroupEventKind, MetaContactAvatarUpdateEvent, MetaContactEventKind, MetaContactListEvent,
    MetaContactModifiedEvent, MetaContactMovedEvent, MetaContactRenamedEvent,
    ProtoContactEventKind,
};
use crate::meta_contact::MetaContact;
use crate::meta_group::MetaContactGroup;
use crate::protocol::{capabilities_of, ProtocolProvider};
use crate::retriever::{Awaited, Confirmation};
use crate::types::{ContactKey, MetaUid, ProtoContact, ProtoGroup, ProtoGroupId};
use crate::{Error, Result};

impl MetaContactListService {
    /// Subscribes to `address` on `account` and puts the new contact into a
    /// fresh meta contact under `group`.
    pub fn create_meta_contact(&self, account: &str, group: &str, address: &str) -> Result<MetaUid> {
        let provider = self.require_provider(account)?;
        let key = ContactKey::new(account, address);
        {
            let tree = self.lock_tree();
            tree.require_group(group)?;
            if tree.find_meta_contact_by_contact(&key).is_some() {
                return Err(Error::ContactAlreadyExists(key.to_string()));
            }
        }

        let parent = self.resolve_proto_path(provider.as_ref(), group)?;
        let contact = self.subscribe_confirmed(provider.as_ref(), &parent, address)?;
        let capabilities = capabilities_of(provider.as_ref(), &key);

        let mut meta_contact = MetaContact::new();
        meta_contact.add_proto_contact(contact, capabilities);
        let uid = meta_contact.uid().to_string();

        let snapshot = {
            let mut tree = self.lock_tree();
            if tree.find_meta_contact_by_contact(&key).is_some() {
                return Err(Error::ContactAlreadyExists(key.to_string()));
            }
            tree.insert_meta_contact(group, meta_contact)?;
            tree.meta_contact(&uid).cloned()
        };
        info!(meta = %uid, contact = %key, "meta contact created");
        self.fire(
            snapshot
                .map(|mc| {
                    MetaContactListEvent::meta_contact(
                        MetaContactEventKind::Added,
                        mc,
                        Some(group.to_string()),
                    )
                })
                .into_iter()
                .collect(),
        );
        Ok(uid)
    }

    /// Subscribes to `address` on `account` and adds it to an existing meta
    /// contact.
    pub fn add_new_contact_to_meta_contact(
        &self,
        account: &str,
        meta_contact: &str,
        address: &str,
    ) -> Result<()> {
        let provider = self.require_provider(account)?;
        let key = ContactKey::new(account, address);
        let group = {
            let tree = self.lock_tree();
            if tree.find_meta_contact_by_contact(&key).is_some() {
                return Err(Error::ContactAlreadyExists(key.to_string()));
            }
            let mc = tree.require_meta_contact(meta_contact)?;
            mc.parent_group()
                .map(str::to_string)
                .ok_or_else(|| Error::InvalidArgument(format!("meta contact {} is detached", meta_contact)))?
        };

        let parent = self.resolve_proto_path(provider.as_ref(), &group)?;
        let contact = self.subscribe_confirmed(provider.as_ref(), &parent, address)?;
        let capabilities = capabilities_of(provider.as_ref(), &key);

        let snapshot = {
            let mut tree = self.lock_tree();
            tree.add_proto_contact(meta_contact, contact.clone(), capabilities)?;
            tree.meta_contact(meta_contact).cloned()
        };
        self.fire(vec![MetaContactListEvent::proto_contact(
            ProtoContactEventKind::Added,
            contact,
            None,
            snapshot,
        )]);
        Ok(())
    }

    /// Creates a local group. Server groups for it are created lazily, the
    /// first time a contact is added to it.
    pub fn create_meta_contact_group(&self, parent: &str, name: &str) -> Result<MetaUid> {
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument("group name must not be empty".to_string()));
        }
        let (uid, snapshot) = {
            let mut tree = self.lock_tree();
            tree.require_group(parent)?;
            if tree.subgroup_by_name(parent, name).is_some() {
                return Err(Error::GroupAlreadyExists(name.to_string()));
            }
            let group = MetaContactGroup::new(name);
            let uid = group.uid().to_string();
            tree.insert_group(parent, group)?;
            (uid.clone(), subtree_event(&tree, GroupEventKind::Added, &uid))
        };
        self.fire(snapshot.into_iter().collect());
        Ok(uid)
    }

    pub fn rename_meta_contact_group(&self, group: &str, name: &str) -> Result<()> {
        let (snapshot, proto_groups) = {
            let mut tree = self.lock_tree();
            tree.require_group(group)?;
            tree.rename_group(group, name);
            let snapshot = tree.require_group(group)?.clone();
            let proto_groups: Vec<ProtoGroup> = snapshot
                .contact_groups()
                .iter()
                .filter(|pg| !pg.is_root())
                .cloned()
                .collect();
            (snapshot, proto_groups)
        };

        for proto_group in proto_groups {
            let Some(provider) = self.provider(proto_group.account()) else {
                continue;
            };
            if let Err(e) = provider.rename_server_stored_group(&proto_group.id, name) {
                log_provider_failure("rename_server_stored_group", proto_group.account(), &e);
            }
        }
        self.fire(vec![MetaContactListEvent::group(
            GroupEventKind::Renamed,
            snapshot,
            None,
            None,
        )]);
        Ok(())
    }

    /// Gives a meta contact a user-chosen name that later protocol renames
    /// will not override.
    pub fn rename_meta_contact(&self, meta_contact: &str, name: &str) -> Result<()> {
        self.rename_meta_contact_inner(meta_contact, name, true, true)
    }

    /// Forgets a user-chosen name. A single-member meta contact takes its
    /// member's name again.
    pub fn clear_user_defined_display_name(&self, meta_contact: &str) -> Result<()> {
        let default_name = {
            let tree = self.lock_tree();
            let mc = tree.require_meta_contact(meta_contact)?;
            if mc.contact_count() == 1 {
                mc.default_contact().map(|c| c.display_name.clone())
            } else {
                None
            }
        };
        match default_name {
            Some(name) => self.rename_meta_contact_inner(meta_contact, &name, false, false),
            None => {
                let snapshot = {
                    let mut tree = self.lock_tree();
                    tree.mutate_meta_contact(meta_contact, |mc| {
                        mc.set_display_name_user_defined(false)
                    });
                    tree.require_meta_contact(meta_contact)?.clone()
                };
                let name = snapshot.display_name().to_string();
                self.fire(vec![MetaContactListEvent::Renamed(MetaContactRenamedEvent {
                    meta_contact: snapshot,
                    old_name: name.clone(),
                    new_name: name,
                })]);
                Ok(())
            }
        }
    }

    fn rename_meta_contact_inner(
        &self,
        meta_contact: &str,
        name: &str,
        user_defined: bool,
        push_to_server: bool,
    ) -> Result<()> {
        let (old_name, snapshot, parent) = {
            let mut tree = self.lock_tree();
            tree.require_meta_contact(meta_contact)?;
            let (old_name, _) = tree
                .mutate_meta_contact(meta_contact, |mc| {
                    let old = mc.display_name().to_string();
                    mc.set_display_name(name);
                    mc.set_display_name_user_defined(user_defined);
                    old
                })
                .ok_or_else(|| Error::InvalidArgument(format!("unknown meta contact {}", meta_contact)))?;
            let snapshot = tree.require_meta_contact(meta_contact)?.clone();
            let parent = snapshot.parent_group().and_then(|p| tree.group(p)).cloned();
            (old_name, snapshot, parent)
        };

        if push_to_server {
            for contact in snapshot.contacts() {
                let Some(provider) = self.provider(&contact.account) else {
                    continue;
                };
                if let Err(e) = provider.set_display_name(&contact.key(), name) {
                    log_provider_failure("set_display_name", &contact.account, &e);
                }
            }
        }

        let mut events = vec![MetaContactListEvent::Renamed(MetaContactRenamedEvent {
            meta_contact: snapshot,
            old_name,
            new_name: name.to_string(),
        })];
        if let Some(parent) = parent {
            events.push(MetaContactListEvent::group(
                GroupEventKind::ChildContactsReordered,
                parent,
                None,
                None,
            ));
        }
        self.fire(events);
        Ok(())
    }

    pub fn change_meta_contact_avatar(
        &self,
        meta_contact: &str,
        old_avatar_id: Option<String>,
        new_avatar_id: Option<String>,
        avatar: Option<Vec<u8>>,
    ) -> Result<()> {
        let snapshot = {
            let mut tree = self.lock_tree();
            tree.mutate_meta_contact(meta_contact, |mc| mc.cache_avatar(avatar));
            tree.require_meta_contact(meta_contact)?.clone()
        };
        self.fire(vec![MetaContactListEvent::AvatarUpdated(
            MetaContactAvatarUpdateEvent {
                meta_contact: snapshot,
                old_avatar_id,
                new_avatar_id,
            },
        )]);
        Ok(())
    }

    /// Moves one protocol contact to `group`, splitting it off into a new
    /// meta contact there. A sole member moves its whole meta contact.
    pub fn move_contact(&self, contact: &ContactKey, group: &str) -> Result<()> {
        let (old_uid, member) = {
            let tree = self.lock_tree();
            tree.require_group(group)?;
            let mc = tree
                .find_meta_contact_by_contact(contact)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown contact {}", contact)))?;
            if mc.contact_count() == 1 {
                let uid = mc.uid().to_string();
                drop(tree);
                return self.move_meta_contact(&uid, group);
            }
            let member = mc
                .contact(&contact.address, &contact.account)
                .cloned()
                .ok_or_else(|| Error::InvalidArgument(format!("unknown contact {}", contact)))?;
            (mc.uid().to_string(), member)
        };

        let provider = self.require_provider(&contact.account)?;
        let target = self.resolve_proto_path(provider.as_ref(), group)?;
        let _guard = self.contact_ignore.guard(&contact.address, &contact.account);
        let moved = self.move_on_server(provider.as_ref(), &member, &target)?;
        let capabilities = capabilities_of(provider.as_ref(), contact);

        let mut events = Vec::new();
        {
            let mut tree = self.lock_tree();
            let mut meta_contact = MetaContact::new();
            meta_contact.add_proto_contact(moved.clone(), capabilities);
            let new_uid = meta_contact.uid().to_string();
            if let Err(e) = tree.insert_meta_contact(group, meta_contact) {
                drop(tree);
                self.move_back_on_server(provider.as_ref(), &moved, &member.parent);
                return Err(Error::MoveContact(format!(
                    "failed to move {} to group {}: {}",
                    contact, group, e
                )));
            }
            tree.remove_proto_contact(&old_uid, contact);

            let mut emptied = Vec::new();

            let old_snapshot = tree.meta_contact(&old_uid).cloned();
            if old_snapshot.as_ref().is_some_and(MetaContact::is_empty) {
                let parent = old_snapshot
                    .as_ref()
                    .and_then(|mc| mc.parent_group())
                    .map(str::to_string);
                if let Some(mc) = tree.remove_meta_contact(&old_uid) {
                    emptied.push(MetaContactListEvent::meta_contact(
                        MetaContactEventKind::Removed,
                        mc,
                        parent,
                    ));
                }
            }
            let new_snapshot = tree.meta_contact(&new_uid).cloned();
            if let Some(added) = new_snapshot.clone() {
                events.push(MetaContactListEvent::meta_contact(
                    MetaContactEventKind::Added,
                    added,
                    Some(group.to_string()),
                ));
            }
            events.push(MetaContactListEvent::proto_contact(
                ProtoContactEventKind::Moved,
                moved,
                old_snapshot,
                new_snapshot,
            ));
            events.extend(emptied);
        }
        self.fire(events);
        Ok(())
    }

    /// Moves one protocol contact into another meta contact, moving it on the
    /// server when the two live in different server groups.
    pub fn move_contact_to_meta_contact(&self, contact: &ContactKey, meta_contact: &str) -> Result<()> {
        let (old_uid, member, group) = {
            let tree = self.lock_tree();
            let target = tree.require_meta_contact(meta_contact)?;
            let group = target
                .parent_group()
                .map(str::to_string)
                .ok_or_else(|| Error::InvalidArgument(format!("meta contact {} is detached", meta_contact)))?;
            let mc = tree
                .find_meta_contact_by_contact(contact)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown contact {}", contact)))?;
            if mc.uid() == meta_contact {
                return Ok(());
            }
            let member = mc
                .contact(&contact.address, &contact.account)
                .cloned()
                .ok_or_else(|| Error::InvalidArgument(format!("unknown contact {}", contact)))?;
            (mc.uid().to_string(), member, group)
        };

        let provider = self.require_provider(&contact.account)?;
        let target = self.resolve_proto_path(provider.as_ref(), &group)?;
        let _guard = self.contact_ignore.guard(&contact.address, &contact.account);
        let moved = self.move_on_server(provider.as_ref(), &member, &target)?;
        let capabilities = capabilities_of(provider.as_ref(), contact);

        let mut events = Vec::new();
        {
            let mut tree = self.lock_tree();
            if let Err(e) = tree.add_proto_contact(meta_contact, moved.clone(), capabilities) {
                drop(tree);
                self.move_back_on_server(provider.as_ref(), &moved, &member.parent);
                return Err(Error::MoveContact(format!(
                    "failed to move {} into {}: {}",
                    contact, meta_contact, e
                )));
            }
            tree.remove_proto_contact(&old_uid, contact);

            let old_snapshot = tree.meta_contact(&old_uid).cloned();
            events.push(MetaContactListEvent::proto_contact(
                ProtoContactEventKind::Moved,
                moved,
                old_snapshot.clone(),
                tree.meta_contact(meta_contact).cloned(),
            ));
            if old_snapshot.as_ref().is_some_and(MetaContact::is_empty) {
                let parent = old_snapshot
                    .as_ref()
                    .and_then(|mc| mc.parent_group())
                    .map(str::to_string);
                if let Some(mc) = tree.remove_meta_contact(&old_uid) {
                    events.push(MetaContactListEvent::meta_contact(
                        MetaContactEventKind::Removed,
                        mc,
                        parent,
                    ));
                }
            }
        }
        self.fire(events);
        Ok(())
    }

    /// Moves a meta contact with all of its members. When any member cannot
    /// be moved on the server the local move is rolled back.
    pub fn move_meta_contact(&self, meta_contact: &str, group: &str) -> Result<()> {
        let (old_group, members) = {
            let mut tree = self.lock_tree();
            tree.require_group(group)?;
            let mc = tree.require_meta_contact(meta_contact)?;
            if mc.parent_group() == Some(group) {
                return Ok(());
            }
            let members = mc.contacts().to_vec();
            let old_group = tree
                .move_meta_contact(meta_contact, group)?
                .ok_or_else(|| Error::InvalidArgument(format!("meta contact {} is detached", meta_contact)))?;
            (old_group, members)
        };

        let mut guards = Vec::new();
        let mut moved = Vec::new();
        for member in &members {
            let result = self.require_provider(&member.account).and_then(|provider| {
                let target = self.resolve_proto_path(provider.as_ref(), group)?;
                guards.push(self.contact_ignore.guard(&member.address, &member.account));
                self.move_on_server(provider.as_ref(), member, &target)
            });
            match result {
                Ok(contact) => moved.push(contact),
                Err(e) => {
                    warn!(meta = %meta_contact, contact = %member.key(), error = %e, "move failed, rolling back");
                    if let Err(rollback) = self.lock_tree().move_meta_contact(meta_contact, &old_group) {
                        warn!(meta = %meta_contact, error = %rollback, "rollback failed");
                    }
                    return Err(Error::MoveContact(format!(
                        "failed to move {} to group {}: {}",
                        member.key(),
                        group,
                        e
                    )));
                }
            }
        }

        let snapshot = {
            let mut tree = self.lock_tree();
            for contact in moved {
                tree.update_proto_contact(contact);
            }
            tree.require_meta_contact(meta_contact)?.clone()
        };
        drop(guards);
        self.fire(vec![MetaContactListEvent::Moved(MetaContactMovedEvent {
            meta_contact: snapshot,
            old_parent: old_group,
            new_parent: group.to_string(),
        })]);
        Ok(())
    }

    /// Unsubscribes from a contact. The tree follows once the server confirms
    /// the removal.
    pub fn remove_contact(&self, contact: &ContactKey) -> Result<()> {
        if self.find_meta_contact_by_contact(contact).is_none() {
            return Err(Error::InvalidArgument(format!("unknown contact {}", contact)));
        }
        let provider = self.require_provider(&contact.account)?;
        provider
            .unsubscribe(contact)
            .map_err(|e| Error::Network(format!("failed to unsubscribe {}: {}", contact, e)))
    }

    pub fn remove_meta_contact(&self, meta_contact: &str) -> Result<()> {
        let members = self
            .meta_contact(meta_contact)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown meta contact {}", meta_contact)))?
            .contacts()
            .to_vec();
        for member in members {
            self.remove_contact(&member.key())?;
        }
        Ok(())
    }

    /// Removes a group from every server that stores it, then locally with
    /// everything below it.
    pub fn remove_meta_contact_group(&self, group: &str) -> Result<()> {
        let proto_groups: Vec<ProtoGroup> = {
            let tree = self.lock_tree();
            if tree.is_root(group) {
                return Err(Error::InvalidArgument("the root group cannot be removed".to_string()));
            }
            tree.require_group(group)?
                .contact_groups()
                .iter()
                .filter(|pg| !pg.is_root())
                .cloned()
                .collect()
        };

        let mut guards = Vec::new();
        let mut removed = Vec::new();
        for proto_group in &proto_groups {
            let result = self.require_provider(proto_group.account()).and_then(|provider| {
                guards.push(self.group_ignore.guard(&proto_group.name, proto_group.account()));
                provider.remove_server_stored_group(&proto_group.id)
            });
            match result {
                Ok(()) => {
                    debug!(group = %group, proto_group = %proto_group.id, "server group removed");
                    removed.push(proto_group.id.clone());
                }
                Err(e) => {
                    warn!(group = %group, proto_group = %proto_group.id, error = %e, "server group removal failed");
                    self.forget_proto_groups(group, &removed);
                    return Err(Error::RemoveGroup(format!("{}: {}", proto_group.id, e)));
                }
            }
        }

        let event = {
            let mut tree = self.lock_tree();
            let event = subtree_event(&tree, GroupEventKind::Removed, group);
            tree.remove_group(group);
            event
        };
        drop(guards);
        info!(group = %group, "meta contact group removed");
        self.fire(event.into_iter().collect());
        Ok(())
    }

    pub fn add_detail(&self, meta_contact: &str, name: &str, value: &str) -> Result<()> {
        self.edit_details(meta_contact, name, |mc| {
            mc.add_detail(name, value.to_string());
            Some((Vec::new(), vec![value.to_string()]))
        })
        .map(|_| ())
    }

    /// Returns false when the value was not present.
    pub fn remove_detail(&self, meta_contact: &str, name: &str, value: &str) -> Result<bool> {
        self.edit_details(meta_contact, name, |mc| {
            mc.remove_detail(name, value)
                .then(|| (vec![value.to_string()], Vec::new()))
        })
    }

    pub fn remove_details(&self, meta_contact: &str, name: &str) -> Result<bool> {
        self.edit_details(meta_contact, name, |mc| {
            let removed = mc.remove_details(name);
            (!removed.is_empty()).then(|| (removed, Vec::new()))
        })
    }

    /// Returns false when `old` was not a value of the detail.
    pub fn change_detail(&self, meta_contact: &str, name: &str, old: &str, new: &str) -> Result<bool> {
        self.edit_details(meta_contact, name, |mc| {
            mc.change_detail(name, old, new.to_string())
                .then(|| (vec![old.to_string()], vec![new.to_string()]))
        })
    }

    fn edit_details(
        &self,
        meta_contact: &str,
        name: &str,
        edit: impl FnOnce(&mut MetaContact) -> Option<(Vec<String>, Vec<String>)>,
    ) -> Result<bool> {
        let (change, snapshot) = {
            let mut tree = self.lock_tree();
            tree.require_meta_contact(meta_contact)?;
            let (change, _) = tree
                .mutate_meta_contact(meta_contact, edit)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown meta contact {}", meta_contact)))?;
            (change, tree.require_meta_contact(meta_contact)?.clone())
        };
        let Some((old_values, new_values)) = change else {
            return Ok(false);
        };
        self.fire(vec![MetaContactListEvent::Modified(MetaContactModifiedEvent {
            meta_contact: snapshot,
            name: name.to_string(),
            old_values,
            new_values,
        })]);
        Ok(true)
    }

    pub fn set_unread_count(&self, meta_contact: &str, count: u32) -> Result<()> {
        let mut tree = self.lock_tree();
        tree.require_meta_contact(meta_contact)?;
        tree.mutate_meta_contact(meta_contact, |mc| mc.set_unread_count(count));
        Ok(())
    }

    /// Finds or creates the server group of `provider` that backs the meta
    /// group `group`, creating missing ancestors first.
    pub(crate) fn resolve_proto_path(
        &self,
        provider: &dyn ProtocolProvider,
        group: &str,
    ) -> Result<ProtoGroup> {
        let account = provider.account_id();
        let (existing, parent, name, is_root) = {
            let tree = self.lock_tree();
            let meta_group = tree.require_group(group)?;
            let values = (
                meta_group.contact_groups_for_provider(&account).next().cloned(),
                meta_group.parent_group().map(str::to_string),
                meta_group.name().to_string(),
                tree.is_root(group),
            );
            values
        };
        if let Some(existing) = existing {
            return Ok(existing);
        }
        if is_root {
            let root = provider.root_group();
            self.lock_tree().add_proto_group(group, root.clone());
            return Ok(root);
        }
        let parent = parent
            .ok_or_else(|| Error::InvalidArgument(format!("meta contact group {} is detached", group)))?;
        let parent_proto = self.resolve_proto_path(provider, &parent)?;

        let proto_group = match provider
            .server_stored_groups(&parent_proto.id)
            .into_iter()
            .find(|g| g.name == name)
        {
            Some(found) => found,
            None => self.create_group_confirmed(provider, &parent_proto, &name)?,
        };

        let snapshot = {
            let mut tree = self.lock_tree();
            tree.add_proto_group(group, proto_group.clone());
            tree.group(group).cloned()
        };
        if let Some(snapshot) = snapshot {
            self.fire(vec![MetaContactListEvent::group(
                GroupEventKind::ContactGroupAdded,
                snapshot,
                Some(account),
                Some(proto_group.clone()),
            )]);
        }
        Ok(proto_group)
    }

    fn create_group_confirmed(
        &self,
        provider: &dyn ProtocolProvider,
        parent: &ProtoGroup,
        name: &str,
    ) -> Result<ProtoGroup> {
        let account = provider.account_id();
        let pending = self.retrievers.register(Awaited::GroupCreation {
            account: account.clone(),
            name: name.to_string(),
        });
        let mut guard = self.group_ignore.guard(name, &account);
        provider
            .create_server_stored_group(&parent.id, name)
            .map_err(map_provider_error)?;

        match pending.wait(self.config.modification_timeout()) {
            Some(Confirmation::GroupCreated(group)) => {
                debug!(group = %group.id, "server group created");
                Ok(group)
            }
            _ => {
                guard.drain_on_release();
                Err(Error::Network(format!(
                    "no confirmation for group {} on {} within {:?}",
                    name,
                    account,
                    self.config.modification_timeout()
                )))
            }
        }
    }

    fn subscribe_confirmed(
        &self,
        provider: &dyn ProtocolProvider,
        parent: &ProtoGroup,
        address: &str,
    ) -> Result<ProtoContact> {
        let account = provider.account_id();
        let pending = self.retrievers.register(Awaited::Subscription {
            account: account.clone(),
            address: address.to_string(),
        });
        let mut guard = self.contact_ignore.guard(address, &account);
        provider
            .subscribe(&parent.id, address)
            .map_err(map_provider_error)?;

        match pending.wait(self.config.modification_timeout()) {
            Some(Confirmation::Subscribed(contact)) => Ok(contact),
            Some(Confirmation::SubscriptionFailed(reason)) => Err(Error::Unknown(format!(
                "subscription to {} failed: {}",
                address, reason
            ))),
            _ => {
                guard.drain_on_release();
                Err(Error::Network(format!(
                    "no confirmation for {} on {} within {:?}",
                    address,
                    account,
                    self.config.modification_timeout()
                )))
            }
        }
    }

    /// Moves `contact` into `target` on the server unless it is already
    /// there, and returns the contact as it now looks.
    /// Detaches server groups that are already gone from a meta group that
    /// itself stays.
    fn forget_proto_groups(&self, group: &str, removed: &[ProtoGroupId]) {
        if removed.is_empty() {
            return;
        }
        let mut events = Vec::new();
        {
            let mut tree = self.lock_tree();
            for id in removed {
                remove_proto_group_locally(&mut tree, group, id, &mut events);
            }
        }
        self.fire(events);
    }

    /// Undoes a server move whose local half could not be applied.
    fn move_back_on_server(&self, provider: &dyn ProtocolProvider, moved: &ProtoContact, parent: &ProtoGroupId) {
        if &moved.parent == parent {
            return;
        }
        warn!(contact = %moved.key(), group = %parent, "local move target vanished, moving contact back");
        if let Err(e) = provider.move_contact_to_group(&moved.key(), parent) {
            warn!(contact = %moved.key(), error = %e, "failed to move contact back on the server");
        }
    }

    fn move_on_server(
        &self,
        provider: &dyn ProtocolProvider,
        contact: &ProtoContact,
        target: &ProtoGroup,
    ) -> Result<ProtoContact> {
        if contact.parent == target.id {
            return Ok(contact.clone());
        }
        provider
            .move_contact_to_group(&contact.key(), &target.id)
            .map_err(|e| Error::MoveContact(format!("{}: {}", contact.key(), e)))?;
        let mut moved = contact.clone();
        moved.parent = target.id.clone();
        Ok(moved)
    }
}


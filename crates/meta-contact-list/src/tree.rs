use std::collections::HashMap;

use crate::meta_contact::MetaContact;
use crate::meta_group::MetaContactGroup;
use crate::types::{
    ContactKey, MetaUid, ProtoContact, ProtoGroup, ProtoGroupId, ROOT_GROUP_NAME, ROOT_GROUP_UID,
};
use crate::{Error, Result};

/// Flat tables of every group and meta contact, with parent/child links held
/// as uids. All structural changes go through here while the owner holds the
/// single tree lock.
#[derive(Debug)]
pub(crate) struct ContactTree {
    root: MetaUid,
    groups: HashMap<MetaUid, MetaContactGroup>,
    contacts: HashMap<MetaUid, MetaContact>,
    contact_owner: HashMap<ContactKey, MetaUid>,
    group_owner: HashMap<ProtoGroupId, MetaUid>,
}

impl ContactTree {
    pub fn new() -> Self {
        let root = MetaContactGroup::with_uid(ROOT_GROUP_UID, ROOT_GROUP_NAME);
        let mut groups = HashMap::new();
        groups.insert(root.uid().to_string(), root);
        Self {
            root: ROOT_GROUP_UID.to_string(),
            groups,
            contacts: HashMap::new(),
            contact_owner: HashMap::new(),
            group_owner: HashMap::new(),
        }
    }

    pub fn root_uid(&self) -> &str {
        &self.root
    }

    pub fn is_root(&self, uid: &str) -> bool {
        self.root == uid
    }

    pub fn group(&self, uid: &str) -> Option<&MetaContactGroup> {
        self.groups.get(uid)
    }

    pub fn meta_contact(&self, uid: &str) -> Option<&MetaContact> {
        self.contacts.get(uid)
    }

    pub fn require_group(&self, uid: &str) -> Result<&MetaContactGroup> {
        self.groups
            .get(uid)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown meta contact group {}", uid)))
    }

    pub fn require_meta_contact(&self, uid: &str) -> Result<&MetaContact> {
        self.contacts
            .get(uid)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown meta contact {}", uid)))
    }

    pub fn meta_contacts(&self) -> impl Iterator<Item = &MetaContact> {
        self.contacts.values()
    }

    pub fn find_meta_contact_by_contact(&self, key: &ContactKey) -> Option<&MetaContact> {
        self.contact_owner
            .get(key)
            .and_then(|uid| self.contacts.get(uid))
    }

    pub fn find_group_by_proto_group(&self, id: &ProtoGroupId) -> Option<&MetaContactGroup> {
        self.group_owner.get(id).and_then(|uid| self.groups.get(uid))
    }

    pub fn subgroup_by_name(&self, parent: &str, name: &str) -> Option<&MetaContactGroup> {
        self.groups.get(parent)?.subgroups().iter().find_map(|uid| {
            self.groups
                .get(uid)
                .filter(|g| g.name() == name)
        })
    }

    /// Snapshots of the children of `group`, in display order.
    pub fn child_contacts(&self, group: &str) -> Vec<MetaContact> {
        self.groups
            .get(group)
            .map(|g| {
                g.child_contacts()
                    .iter()
                    .filter_map(|uid| self.contacts.get(uid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subgroups(&self, group: &str) -> Vec<MetaContactGroup> {
        self.groups
            .get(group)
            .map(|g| {
                g.subgroups()
                    .iter()
                    .filter_map(|uid| self.groups.get(uid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All groups and meta contacts below `group`, parents before children.
    pub fn subtree(&self, group: &str) -> (Vec<MetaContactGroup>, Vec<MetaContact>) {
        let mut groups = Vec::new();
        let mut contacts = self.child_contacts(group);
        let mut pending: Vec<MetaUid> = self
            .groups
            .get(group)
            .map(|g| g.subgroups().to_vec())
            .unwrap_or_default();
        while let Some(uid) = pending.pop() {
            if let Some(g) = self.groups.get(&uid) {
                pending.extend(g.subgroups().iter().rev().cloned());
                contacts.extend(self.child_contacts(&uid));
                groups.push(g.clone());
            }
        }
        (groups, contacts)
    }

    pub fn insert_meta_contact(&mut self, group: &str, mut meta_contact: MetaContact) -> Result<usize> {
        let parent = self
            .groups
            .get_mut(group)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown meta contact group {}", group)))?;
        let index = parent.add_meta_contact(&mut meta_contact);

        let uid = meta_contact.uid().to_string();
        for contact in meta_contact.contacts() {
            self.contact_owner.insert(contact.key(), uid.clone());
        }
        self.contacts.insert(uid, meta_contact);
        Ok(index)
    }

    pub fn remove_meta_contact(&mut self, uid: &str) -> Option<MetaContact> {
        let mut meta_contact = self.contacts.remove(uid)?;
        for contact in meta_contact.contacts() {
            let key = contact.key();
            if self.contact_owner.get(&key).is_some_and(|owner| owner == uid) {
                self.contact_owner.remove(&key);
            }
        }
        let parent = meta_contact.parent_group().map(str::to_string);
        if let Some(parent) = parent.and_then(|p| self.groups.get_mut(&p)) {
            parent.remove_meta_contact(&mut meta_contact);
        }
        meta_contact.set_parent(None);
        Some(meta_contact)
    }

    /// Re-parents a meta contact and returns the uid of its previous group.
    pub fn move_meta_contact(&mut self, uid: &str, new_group: &str) -> Result<Option<MetaUid>> {
        if !self.groups.contains_key(new_group) {
            return Err(Error::InvalidArgument(format!(
                "unknown meta contact group {}",
                new_group
            )));
        }
        let meta_contact = self
            .contacts
            .get_mut(uid)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown meta contact {}", uid)))?;

        let old = meta_contact.parent_group().map(str::to_string);
        if let Some(parent) = old.as_deref().and_then(|p| self.groups.get_mut(p)) {
            parent.remove_meta_contact(meta_contact);
        }
        if let Some(parent) = self.groups.get_mut(new_group) {
            parent.add_meta_contact(meta_contact);
        }
        Ok(old)
    }

    /// Applies `f` to a meta contact while it is detached from its parent's
    /// ordering, then re-inserts it. Returns `f`'s result and the new index.
    pub fn mutate_meta_contact<R>(
        &mut self,
        uid: &str,
        f: impl FnOnce(&mut MetaContact) -> R,
    ) -> Option<(R, Option<usize>)> {
        let meta_contact = self.contacts.get_mut(uid)?;
        let parent = meta_contact
            .parent_group()
            .and_then(|p| self.groups.get_mut(p));

        match parent {
            Some(parent) => {
                parent.light_remove_meta_contact(uid);
                let result = f(meta_contact);
                let index = parent.light_add_meta_contact(meta_contact.order_key());
                Some((result, Some(index)))
            }
            None => Some((f(meta_contact), None)),
        }
    }

    pub fn add_proto_contact(
        &mut self,
        uid: &str,
        contact: ProtoContact,
        capabilities: crate::types::CapabilitySet,
    ) -> Result<()> {
        let key = contact.key();
        self.mutate_meta_contact(uid, |mc| mc.add_proto_contact(contact, capabilities))
            .ok_or_else(|| Error::InvalidArgument(format!("unknown meta contact {}", uid)))?;
        self.contact_owner.insert(key, uid.to_string());
        Ok(())
    }

    pub fn remove_proto_contact(&mut self, uid: &str, key: &ContactKey) -> Option<ProtoContact> {
        let (removed, _) = self.mutate_meta_contact(uid, |mc| mc.remove_proto_contact(key))?;
        if removed.is_some() && self.contact_owner.get(key).is_some_and(|owner| owner == uid) {
            self.contact_owner.remove(key);
        }
        removed
    }

    /// Drops every member of `uid` that belongs to `account`.
    pub fn remove_contacts_for_provider(&mut self, uid: &str, account: &str) -> Vec<ProtoContact> {
        let removed = self
            .mutate_meta_contact(uid, |mc| mc.remove_contacts_for_provider(account))
            .map(|(removed, _)| removed)
            .unwrap_or_default();
        self.unindex_contacts(uid, &removed);
        removed
    }

    /// Drops every member of `uid` held in the server group `group`.
    pub fn remove_contacts_for_group(&mut self, uid: &str, group: &ProtoGroupId) -> Vec<ProtoContact> {
        let removed = self
            .mutate_meta_contact(uid, |mc| mc.remove_contacts_for_group(group))
            .map(|(removed, _)| removed)
            .unwrap_or_default();
        self.unindex_contacts(uid, &removed);
        removed
    }

    fn unindex_contacts(&mut self, uid: &str, removed: &[ProtoContact]) {
        for contact in removed {
            let key = contact.key();
            if self.contact_owner.get(&key).is_some_and(|owner| owner == uid) {
                self.contact_owner.remove(&key);
            }
        }
    }

    /// Replaces the stored snapshot of a known protocol contact.
    ///
    /// Returns the owning meta contact uid and the previous snapshot.
    pub fn update_proto_contact(&mut self, contact: ProtoContact) -> Option<(MetaUid, ProtoContact)> {
        let uid = self.contact_owner.get(&contact.key())?.clone();
        let (old, _) = self.mutate_meta_contact(&uid, |mc| mc.update_proto_contact(contact))?;
        old.map(|old| (uid, old))
    }

    /// Recomputes default contact and online count; the new index in the
    /// parent, or `None` for a detached meta contact.
    pub fn reeval_contact(&mut self, uid: &str) -> Option<usize> {
        self.mutate_meta_contact(uid, |mc| mc.reevaluate())
            .and_then(|(_, index)| index)
    }

    pub fn index_of_meta_contact(&self, uid: &str) -> Option<usize> {
        let parent = self.contacts.get(uid)?.parent_group()?;
        self.groups.get(parent)?.index_of_contact(uid)
    }

    pub fn insert_group(&mut self, parent: &str, mut group: MetaContactGroup) -> Result<()> {
        let parent_group = self
            .groups
            .get_mut(parent)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown meta contact group {}", parent)))?;
        parent_group.add_subgroup(&mut group);

        let uid = group.uid().to_string();
        for proto_group in group.contact_groups() {
            self.group_owner.insert(proto_group.id.clone(), uid.clone());
        }
        self.groups.insert(uid, group);
        Ok(())
    }

    /// Unlinks a group from its parent and drops it together with everything
    /// below it. The root cannot be removed.
    pub fn remove_group(&mut self, uid: &str) -> Option<MetaContactGroup> {
        if self.is_root(uid) {
            return None;
        }
        let mut group = self.groups.remove(uid)?;
        let parent = group.parent_group().map(str::to_string);
        if let Some(parent) = parent.and_then(|p| self.groups.get_mut(&p)) {
            parent.remove_subgroup(&mut group);
        }
        self.unindex_group(uid, &group);
        for child in group.child_contacts().to_vec() {
            self.remove_meta_contact(&child);
        }
        for sub in group.subgroups().to_vec() {
            self.remove_group(&sub);
        }
        group.set_parent(None);
        Some(group)
    }

    pub fn rename_group(&mut self, uid: &str, name: &str) -> Option<String> {
        let group = self.groups.get_mut(uid)?;
        let old = group.name().to_string();
        group.set_name(name);
        let key = group.order_key();
        let parent_uid = group.parent_group().map(str::to_string);
        if let Some(parent) = parent_uid.and_then(|p| self.groups.get_mut(&p)) {
            parent.remove_subgroup_key(uid);
            parent.add_subgroup_key(key);
        }
        Some(old)
    }

    pub fn group_mut(&mut self, uid: &str) -> Option<&mut MetaContactGroup> {
        self.groups.get_mut(uid)
    }

    pub fn add_proto_group(&mut self, uid: &str, proto_group: ProtoGroup) -> bool {
        let Some(group) = self.groups.get_mut(uid) else {
            return false;
        };
        self.group_owner.insert(proto_group.id.clone(), uid.to_string());
        group.add_proto_group(proto_group);
        true
    }

    pub fn remove_proto_group(&mut self, uid: &str, id: &ProtoGroupId) -> Option<ProtoGroup> {
        let removed = self.groups.get_mut(uid)?.remove_proto_group(id)?;
        if self.group_owner.get(id).is_some_and(|owner| owner == uid) {
            self.group_owner.remove(id);
        }
        Some(removed)
    }

    /// Replaces the stored snapshot of a known server group.
    pub fn update_proto_group(&mut self, proto_group: ProtoGroup) -> Option<MetaUid> {
        let uid = self.group_owner.get(&proto_group.id)?.clone();
        self.groups.get_mut(&uid)?.add_proto_group(proto_group);
        Some(uid)
    }

    fn unindex_group(&mut self, uid: &str, group: &MetaContactGroup) {
        for proto_group in group.contact_groups() {
            if self
                .group_owner
                .get(&proto_group.id)
                .is_some_and(|owner| owner == uid)
            {
                self.group_owner.remove(&proto_group.id);
            }
        }
    }

    /// Checks parent links and lookup indexes against the tables.
    #[cfg(test)]
    pub fn assert_consistent(&self) {
        for (uid, group) in &self.groups {
            for child in group.child_contacts() {
                let mc = self.contacts.get(child).expect("child contact in table");
                assert_eq!(mc.parent_group(), Some(uid.as_str()));
            }
            for sub in group.subgroups() {
                let g = self.groups.get(sub).expect("subgroup in table");
                assert_eq!(g.parent_group(), Some(uid.as_str()));
            }
        }
        for (uid, mc) in &self.contacts {
            let parent = mc.parent_group().expect("meta contact has a parent");
            assert!(self.groups[parent].contains_contact(uid));
            for contact in mc.contacts() {
                assert_eq!(self.contact_owner.get(&contact.key()), Some(uid));
            }
        }
        for (key, owner) in &self.contact_owner {
            assert!(self.contacts[owner].contains_contact(key));
        }
        for (id, owner) in &self.group_owner {
            assert!(self.groups[owner].contains_proto_group(id));
        }
    }
}

impl Default for ContactTree {
    fn default() -> Self {
        Self::new()
    }
}

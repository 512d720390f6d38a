use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::meta_contact::{ContactOrderKey, MetaContact};
use crate::types::{MetaUid, ProtoGroup, ProtoGroupId};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct GroupOrderKey {
    folded_name: String,
    uid: MetaUid,
}

pub type UserDataValue = Arc<dyn Any + Send + Sync>;

/// Key/value slots attached to a group by other subsystems.
///
/// Stored as a flat slice, reallocated to the exact size on every insert and
/// removal.
#[derive(Clone, Default)]
pub struct UserData {
    entries: Box<[(Box<str>, UserDataValue)]>,
}

impl UserData {
    pub fn get(&self, key: &str) -> Option<UserDataValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v.clone())
    }

    /// Sets or, with `None`, removes the value stored under `key`.
    pub fn set(&mut self, key: &str, value: Option<UserDataValue>) {
        let index = self.entries.iter().position(|(k, _)| k.as_ref() == key);
        match (index, value) {
            (Some(i), Some(value)) => self.entries[i].1 = value,
            (Some(i), None) => {
                let mut entries = Vec::with_capacity(self.entries.len() - 1);
                entries.extend(
                    self.entries
                        .iter()
                        .enumerate()
                        .filter(|(j, _)| *j != i)
                        .map(|(_, e)| e.clone()),
                );
                self.entries = entries.into_boxed_slice();
            }
            (None, Some(value)) => {
                let mut entries = Vec::with_capacity(self.entries.len() + 1);
                entries.extend(self.entries.iter().cloned());
                entries.push((Box::from(key), value));
                self.entries = entries.into_boxed_slice();
            }
            (None, None) => {}
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(k, _)| k))
            .finish()
    }
}

/// A folder of meta contacts and subgroups, aggregating one server stored
/// group per participating account.
#[derive(Debug, Clone)]
pub struct MetaContactGroup {
    uid: MetaUid,
    name: String,
    parent: Option<MetaUid>,
    contact_keys: BTreeSet<ContactOrderKey>,
    contact_index: HashMap<MetaUid, ContactOrderKey>,
    child_contacts: Vec<MetaUid>,
    subgroup_keys: BTreeSet<GroupOrderKey>,
    subgroup_index: HashMap<MetaUid, GroupOrderKey>,
    subgroups: Vec<MetaUid>,
    proto_groups: Vec<ProtoGroup>,
    user_data: UserData,
}

impl MetaContactGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_uid(crate::types::generate_meta_uid(), name)
    }

    pub fn with_uid(uid: impl Into<MetaUid>, name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            parent: None,
            contact_keys: BTreeSet::new(),
            contact_index: HashMap::new(),
            child_contacts: Vec::new(),
            subgroup_keys: BTreeSet::new(),
            subgroup_index: HashMap::new(),
            subgroups: Vec::new(),
            proto_groups: Vec::new(),
            user_data: UserData::default(),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_group(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Ordered uids of the child meta contacts.
    pub fn child_contacts(&self) -> &[MetaUid] {
        &self.child_contacts
    }

    /// Ordered uids of the subgroups.
    pub fn subgroups(&self) -> &[MetaUid] {
        &self.subgroups
    }

    pub fn count_child_contacts(&self) -> usize {
        self.child_contacts.len()
    }

    pub fn count_subgroups(&self) -> usize {
        self.subgroups.len()
    }

    pub fn contains_contact(&self, uid: &str) -> bool {
        self.contact_index.contains_key(uid)
    }

    pub fn contains_subgroup(&self, uid: &str) -> bool {
        self.subgroup_index.contains_key(uid)
    }

    pub fn index_of_contact(&self, uid: &str) -> Option<usize> {
        self.child_contacts.iter().position(|c| c == uid)
    }

    pub fn index_of_subgroup(&self, uid: &str) -> Option<usize> {
        self.subgroups.iter().position(|g| g == uid)
    }

    pub fn is_empty(&self) -> bool {
        self.child_contacts.is_empty() && self.subgroups.is_empty() && self.proto_groups.is_empty()
    }

    /// True when any aggregated server group is persistent, or when none is
    /// aggregated yet.
    pub fn is_persistent(&self) -> bool {
        self.proto_groups.is_empty() || self.proto_groups.iter().any(|g| g.persistent)
    }

    pub fn contact_groups(&self) -> &[ProtoGroup] {
        &self.proto_groups
    }

    pub fn contact_group(&self, name: &str, account: &str) -> Option<&ProtoGroup> {
        self.proto_groups
            .iter()
            .find(|g| g.name == name && g.account() == account)
    }

    pub fn contact_groups_for_provider<'a>(
        &'a self,
        account: &'a str,
    ) -> impl Iterator<Item = &'a ProtoGroup> + 'a {
        self.proto_groups.iter().filter(move |g| g.account() == account)
    }

    pub fn contains_proto_group(&self, id: &ProtoGroupId) -> bool {
        self.proto_groups.iter().any(|g| &g.id == id)
    }

    pub fn count_contact_groups(&self) -> usize {
        self.proto_groups.len()
    }

    pub fn get_data(&self, key: &str) -> Option<UserDataValue> {
        self.user_data.get(key)
    }

    pub fn set_data(&mut self, key: &str, value: Option<UserDataValue>) {
        self.user_data.set(key, value);
    }

    pub(crate) fn order_key(&self) -> GroupOrderKey {
        GroupOrderKey {
            folded_name: self.name.to_lowercase(),
            uid: self.uid.clone(),
        }
    }

    pub(crate) fn set_parent(&mut self, parent: Option<MetaUid>) {
        self.parent = parent;
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Inserts a child under its current sort key and returns its new index.
    pub(crate) fn light_add_meta_contact(&mut self, key: ContactOrderKey) -> usize {
        if let Some(old) = self.contact_index.insert(key.uid().to_string(), key.clone()) {
            self.contact_keys.remove(&old);
        }
        let index = self.contact_keys.range(..&key).count();
        self.contact_keys.insert(key);
        self.regenerate_contacts();
        index
    }

    pub(crate) fn light_remove_meta_contact(&mut self, uid: &str) -> bool {
        match self.contact_index.remove(uid) {
            Some(key) => {
                self.contact_keys.remove(&key);
                self.regenerate_contacts();
                true
            }
            None => false,
        }
    }

    /// Adopts `meta_contact` and returns its index among the children.
    pub(crate) fn add_meta_contact(&mut self, meta_contact: &mut MetaContact) -> usize {
        meta_contact.set_parent(Some(self.uid.clone()));
        self.light_add_meta_contact(meta_contact.order_key())
    }

    /// Drops `meta_contact` from the children. Its parent link is cleared
    /// only while it still points here.
    pub(crate) fn remove_meta_contact(&mut self, meta_contact: &mut MetaContact) -> bool {
        let removed = self.light_remove_meta_contact(meta_contact.uid());
        if meta_contact.parent_group() == Some(self.uid.as_str()) {
            meta_contact.set_parent(None);
        }
        removed
    }

    pub(crate) fn add_subgroup(&mut self, group: &mut MetaContactGroup) {
        group.set_parent(Some(self.uid.clone()));
        self.add_subgroup_key(group.order_key());
    }

    pub(crate) fn remove_subgroup(&mut self, group: &mut MetaContactGroup) -> bool {
        let removed = self.remove_subgroup_key(group.uid());
        if group.parent_group() == Some(self.uid.as_str()) {
            group.set_parent(None);
        }
        removed
    }

    pub(crate) fn add_subgroup_key(&mut self, key: GroupOrderKey) {
        if let Some(old) = self.subgroup_index.insert(key.uid.clone(), key.clone()) {
            self.subgroup_keys.remove(&old);
        }
        self.subgroup_keys.insert(key);
        self.regenerate_subgroups();
    }

    pub(crate) fn remove_subgroup_key(&mut self, uid: &str) -> bool {
        match self.subgroup_index.remove(uid) {
            Some(key) => {
                self.subgroup_keys.remove(&key);
                self.regenerate_subgroups();
                true
            }
            None => false,
        }
    }

    /// Adds the server group, replacing an older snapshot with the same id.
    pub(crate) fn add_proto_group(&mut self, group: ProtoGroup) {
        match self.proto_groups.iter_mut().find(|g| g.id == group.id) {
            Some(existing) => *existing = group,
            None => self.proto_groups.push(group),
        }
    }

    pub(crate) fn remove_proto_group(&mut self, id: &ProtoGroupId) -> Option<ProtoGroup> {
        let index = self.proto_groups.iter().position(|g| &g.id == id)?;
        Some(self.proto_groups.remove(index))
    }

    fn regenerate_contacts(&mut self) {
        self.child_contacts = self.contact_keys.iter().map(|k| k.uid().to_string()).collect();
    }

    fn regenerate_subgroups(&mut self) {
        self.subgroups = self.subgroup_keys.iter().map(|k| k.uid.clone()).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CapabilitySet, PresenceStatus, ProtoContact};

    fn named(uid: &str, name: &str, online: bool) -> MetaContact {
        let mut mc = MetaContact::with_uid(uid);
        mc.set_display_name(name);
        if online {
            mc.add_proto_contact(
                ProtoContact::new(ProtoGroup::root("acc").id, format!("{uid}@acc"))
                    .with_presence(PresenceStatus::AVAILABLE),
                CapabilitySet::empty(),
            );
        }
        mc
    }

    #[test]
    fn children_sorted_online_then_name_then_uid() {
        let mut group = MetaContactGroup::new("Friends");
        group.light_add_meta_contact(named("3", "bob", false).order_key());
        group.light_add_meta_contact(named("2", "Alice", false).order_key());
        group.light_add_meta_contact(named("1", "alice", false).order_key());
        group.light_add_meta_contact(named("4", "zed", true).order_key());

        assert_eq!(group.child_contacts(), ["4", "1", "2", "3"]);
    }

    #[test]
    fn light_add_returns_index_and_reinsert_is_stable() {
        let mut group = MetaContactGroup::new("Friends");
        group.light_add_meta_contact(named("a", "Anna", false).order_key());
        let carl = named("c", "Carl", false);
        let index = group.light_add_meta_contact(carl.order_key());
        group.light_add_meta_contact(named("b", "Bert", false).order_key());
        assert_eq!(index, 1);

        let before = group.child_contacts().to_vec();
        group.light_remove_meta_contact("c");
        let again = group.light_add_meta_contact(carl.order_key());
        assert_eq!(again, 2);
        assert_eq!(group.child_contacts(), before.as_slice());
    }

    #[test]
    fn parenting_add_and_remove() {
        let mut friends = MetaContactGroup::new("Friends");
        let mut work = MetaContactGroup::new("Work");
        let mut alice = named("a", "Alice", false);

        assert_eq!(friends.add_meta_contact(&mut alice), 0);
        assert_eq!(alice.parent_group(), Some(friends.uid()));

        work.add_meta_contact(&mut alice);
        assert!(friends.remove_meta_contact(&mut alice));
        assert_eq!(alice.parent_group(), Some(work.uid()));
        assert!(work.remove_meta_contact(&mut alice));
        assert_eq!(alice.parent_group(), None);

        let mut team = MetaContactGroup::new("Team");
        work.add_subgroup(&mut team);
        assert!(work.contains_subgroup(team.uid()));
        assert_eq!(team.parent_group(), Some(work.uid()));
        assert!(work.remove_subgroup(&mut team));
        assert!(team.parent_group().is_none());
        assert!(!work.remove_subgroup(&mut team));
    }

    #[test]
    fn persistence_follows_proto_groups() {
        let mut group = MetaContactGroup::new("Work");
        assert!(group.is_persistent());

        let root = ProtoGroup::root("acc");
        let mut volatile = ProtoGroup::new(&root.id, "g1", "Work");
        volatile.persistent = false;
        group.add_proto_group(volatile.clone());
        assert!(!group.is_persistent());

        group.add_proto_group(ProtoGroup::new(&root.id, "g2", "Work"));
        assert!(group.is_persistent());
        assert_eq!(group.count_contact_groups(), 2);

        group.add_proto_group(volatile);
        assert_eq!(group.count_contact_groups(), 2);
    }

    #[test]
    fn user_data_slots_resize_exactly() {
        let mut group = MetaContactGroup::new("Work");
        group.set_data("ui.expanded", Some(Arc::new(true)));
        group.set_data("ui.color", Some(Arc::new("blue".to_string())));
        assert_eq!(group.user_data.len(), 2);

        let expanded = group.get_data("ui.expanded").unwrap();
        assert_eq!(expanded.downcast_ref::<bool>(), Some(&true));

        group.set_data("ui.expanded", None);
        assert_eq!(group.user_data.len(), 1);
        assert!(group.get_data("ui.expanded").is_none());
        assert!(group.get_data("ui.color").is_some());
    }
}

use std::collections::{BTreeMap, HashMap};

use crate::types::{Capability, CapabilitySet, ContactKey, MetaUid, ProtoContact, ProtoGroupId};

/// Sort key of a meta contact inside its parent group.
///
/// Online contacts come first, then display names compared case-insensitively,
/// then the uid so that no two children ever compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ContactOrderKey {
    offline: bool,
    folded_name: String,
    uid: MetaUid,
}

impl ContactOrderKey {
    pub(crate) fn uid(&self) -> &str {
        &self.uid
    }
}

/// One person, merged from the protocol contacts of one or more accounts.
#[derive(Debug, Clone)]
pub struct MetaContact {
    uid: MetaUid,
    display_name: String,
    user_defined_name: bool,
    contacts: Vec<ProtoContact>,
    default_contact: Option<usize>,
    online_count: usize,
    details: BTreeMap<String, Vec<String>>,
    parent: Option<MetaUid>,
    capabilities: HashMap<ContactKey, CapabilitySet>,
    resource_capabilities: BTreeMap<ContactKey, CapabilitySet>,
    avatar: Option<Vec<u8>>,
    unread_count: u32,
}

impl MetaContact {
    pub fn new() -> Self {
        Self::with_uid(crate::types::generate_meta_uid())
    }

    pub fn with_uid(uid: impl Into<MetaUid>) -> Self {
        Self {
            uid: uid.into(),
            display_name: String::new(),
            user_defined_name: false,
            contacts: Vec::new(),
            default_contact: None,
            online_count: 0,
            details: BTreeMap::new(),
            parent: None,
            capabilities: HashMap::new(),
            resource_capabilities: BTreeMap::new(),
            avatar: None,
            unread_count: 0,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn is_display_name_user_defined(&self) -> bool {
        self.user_defined_name
    }

    pub fn parent_group(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.online_count
    }

    pub fn is_online(&self) -> bool {
        self.online_count > 0
    }

    pub fn unread_count(&self) -> u32 {
        self.unread_count
    }

    pub fn avatar(&self) -> Option<&[u8]> {
        self.avatar.as_deref()
    }

    pub fn contacts(&self) -> &[ProtoContact] {
        &self.contacts
    }

    pub fn contacts_for_provider<'a>(
        &'a self,
        account: &'a str,
    ) -> impl Iterator<Item = &'a ProtoContact> + 'a {
        self.contacts.iter().filter(move |c| c.account == account)
    }

    pub fn contacts_for_group<'a>(
        &'a self,
        group: &'a ProtoGroupId,
    ) -> impl Iterator<Item = &'a ProtoContact> + 'a {
        self.contacts.iter().filter(move |c| &c.parent == group)
    }

    pub fn contact(&self, address: &str, account: &str) -> Option<&ProtoContact> {
        self.contacts
            .iter()
            .find(|c| c.address == address && c.account == account)
    }

    pub fn contains_contact(&self, key: &ContactKey) -> bool {
        self.contact(&key.address, &key.account).is_some()
    }

    /// The member with the highest presence status.
    pub fn default_contact(&self) -> Option<&ProtoContact> {
        self.default_contact.and_then(|i| self.contacts.get(i))
    }

    /// The highest-presence member supporting `capability`.
    ///
    /// The overall default contact wins when it supports the capability.
    pub fn default_contact_for(&self, capability: Capability) -> Option<&ProtoContact> {
        if let Some(default) = self.default_contact() {
            if self.supports(&default.key(), capability) {
                return Some(default);
            }
        }
        self.contacts_for_capability(capability)
            .max_by_key(|c| c.presence)
    }

    pub fn contacts_for_capability(
        &self,
        capability: Capability,
    ) -> impl Iterator<Item = &ProtoContact> + '_ {
        self.contacts
            .iter()
            .filter(move |c| self.supports(&c.key(), capability))
    }

    /// The first member with a resource that advertises `capability`.
    ///
    /// When no resource-level entries are known for the capability at all,
    /// falls back to [`MetaContact::default_contact_for`].
    pub fn op_set_supported_contact(&self, capability: Capability) -> Option<&ProtoContact> {
        let resources: Vec<&ContactKey> = self
            .resource_capabilities
            .iter()
            .filter(|(_, caps)| caps.contains(capability))
            .map(|(resource, _)| resource)
            .collect();

        if resources.is_empty() {
            return self.default_contact_for(capability);
        }

        self.contacts.iter().find(|contact| {
            resources
                .iter()
                .any(|resource| is_resource_of(contact, resource))
        })
    }

    pub fn capabilities(&self, contact: &ContactKey) -> CapabilitySet {
        self.capabilities.get(contact).copied().unwrap_or_default()
    }

    pub fn details(&self) -> &BTreeMap<String, Vec<String>> {
        &self.details
    }

    pub fn details_for(&self, name: &str) -> &[String] {
        self.details.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn order_key(&self) -> ContactOrderKey {
        ContactOrderKey {
            offline: !self.is_online(),
            folded_name: self.display_name.to_lowercase(),
            uid: self.uid.clone(),
        }
    }

    pub(crate) fn set_parent(&mut self, parent: Option<MetaUid>) {
        self.parent = parent;
    }

    pub(crate) fn set_display_name(&mut self, name: impl Into<String>) {
        self.display_name = name.into();
    }

    pub(crate) fn set_display_name_user_defined(&mut self, user_defined: bool) {
        self.user_defined_name = user_defined;
    }

    pub(crate) fn set_unread_count(&mut self, count: u32) {
        self.unread_count = count;
    }

    pub(crate) fn cache_avatar(&mut self, avatar: Option<Vec<u8>>) {
        self.avatar = avatar;
    }

    pub(crate) fn add_proto_contact(&mut self, contact: ProtoContact, capabilities: CapabilitySet) {
        let key = contact.key();
        if let Some(existing) = self.contacts.iter_mut().find(|c| c.key() == key) {
            *existing = contact;
        } else {
            if self.contacts.is_empty() && self.display_name.trim().is_empty() {
                self.display_name = contact.display_name.clone();
            }
            self.contacts.push(contact);
        }
        if !capabilities.is_empty() {
            self.capabilities.insert(key, capabilities);
        }
        self.reevaluate();
    }

    /// Removes the contact and returns its last snapshot.
    pub(crate) fn remove_proto_contact(&mut self, key: &ContactKey) -> Option<ProtoContact> {
        let index = self.contacts.iter().position(|c| &c.key() == key)?;
        let removed = self.contacts.remove(index);

        self.capabilities.remove(key);
        self.resource_capabilities
            .retain(|resource, _| !is_resource_of(&removed, resource));
        self.reevaluate();

        if !self.user_defined_name && self.display_name == removed.display_name {
            if let Some(default) = self.default_contact() {
                self.display_name = default.display_name.clone();
            }
        }
        Some(removed)
    }

    /// Drops every member of `account`, returning them in list order.
    pub(crate) fn remove_contacts_for_provider(&mut self, account: &str) -> Vec<ProtoContact> {
        let keys: Vec<ContactKey> = self
            .contacts_for_provider(account)
            .map(ProtoContact::key)
            .collect();
        keys.iter()
            .filter_map(|key| self.remove_proto_contact(key))
            .collect()
    }

    pub(crate) fn remove_contacts_for_group(&mut self, group: &ProtoGroupId) -> Vec<ProtoContact> {
        let keys: Vec<ContactKey> = self
            .contacts_for_group(group)
            .map(ProtoContact::key)
            .collect();
        keys.iter()
            .filter_map(|key| self.remove_proto_contact(key))
            .collect()
    }

    /// Replaces the stored snapshot of a member, keeping its position.
    pub(crate) fn update_proto_contact(&mut self, contact: ProtoContact) -> Option<ProtoContact> {
        let key = contact.key();
        let slot = self.contacts.iter_mut().find(|c| c.key() == key)?;
        let old = std::mem::replace(slot, contact);
        self.reevaluate();
        Some(old)
    }

    /// Recomputes the default contact and online count from scratch.
    pub(crate) fn reevaluate(&mut self) {
        self.online_count = self.contacts.iter().filter(|c| c.is_online()).count();
        self.default_contact = self
            .contacts
            .iter()
            .enumerate()
            .fold(None::<(usize, &ProtoContact)>, |best, (i, c)| match best {
                Some((_, b)) if b.presence >= c.presence => best,
                _ => Some((i, c)),
            })
            .map(|(i, _)| i);
    }

    /// Replaces the capability sets recorded for a contact and one of its resources.
    ///
    /// Stale entries go before new ones are recorded, within the same borrow.
    pub(crate) fn update_capabilities(
        &mut self,
        contact: &ContactKey,
        resource: Option<&str>,
        capabilities: CapabilitySet,
    ) {
        self.capabilities.remove(contact);
        if !capabilities.is_empty() {
            self.capabilities.insert(contact.clone(), capabilities);
        }

        if let Some(resource) = resource {
            let resource_key = ContactKey::new(contact.account.clone(), resource);
            self.resource_capabilities.remove(&resource_key);
            if !capabilities.is_empty() {
                self.resource_capabilities.insert(resource_key, capabilities);
            }
        }
    }

    fn supports(&self, contact: &ContactKey, capability: Capability) -> bool {
        self.capabilities
            .get(contact)
            .is_some_and(|caps| caps.contains(capability))
    }

    pub(crate) fn add_detail(&mut self, name: &str, value: String) {
        self.details.entry(name.to_string()).or_default().push(value);
    }

    pub(crate) fn remove_detail(&mut self, name: &str, value: &str) -> bool {
        let Some(values) = self.details.get_mut(name) else {
            return false;
        };
        let Some(index) = values.iter().position(|v| v == value) else {
            return false;
        };
        values.remove(index);
        if values.is_empty() {
            self.details.remove(name);
        }
        true
    }

    pub(crate) fn remove_details(&mut self, name: &str) -> Vec<String> {
        self.details.remove(name).unwrap_or_default()
    }

    pub(crate) fn change_detail(&mut self, name: &str, old: &str, new: String) -> bool {
        match self
            .details
            .get_mut(name)
            .and_then(|values| values.iter_mut().find(|v| v.as_str() == old))
        {
            Some(slot) => {
                *slot = new;
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_details(&mut self, details: BTreeMap<String, Vec<String>>) {
        self.details = details;
    }
}

impl Default for MetaContact {
    fn default() -> Self {
        Self::new()
    }
}

/// `resource` is either the bare address or `address/resource`.
fn is_resource_of(contact: &ProtoContact, resource: &ContactKey) -> bool {
    if contact.account != resource.account {
        return false;
    }
    match resource.address.strip_prefix(contact.address.as_str()) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

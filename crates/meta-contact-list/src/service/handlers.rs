//! Reactions to protocol events. Nothing here returns an error: there is no
//! caller to report to, so inconsistencies are logged and the event dropped.

use tracing::{debug, trace, warn};

use super::sync::{remove_contact_locally, remove_proto_group_locally, subtree_event, ProtoSubtree};
use super::{Events, MetaContactListService};
use crate::events::{
    GroupEventKind, MetaContactAvatarUpdateEvent, MetaContactEventKind, MetaContactListEvent,
    MetaContactMovedEvent, MetaContactRenamedEvent, ProtoContactEventKind,
};
use crate::meta_contact::MetaContact;
use crate::meta_group::MetaContactGroup;
use crate::protocol::{capabilities_of, ContactProperty, ProtocolEvent, ProtocolProvider};
use crate::tree::ContactTree;
use crate::types::{CapabilitySet, MetaUid, ProtoContact, ProtoGroup, ProtoGroupId};

impl MetaContactListService {
    /// Entry point for everything a provider reports.
    ///
    /// Whether the event echoes a local operation is decided before waiting
    /// callers are woken, while their ignore entries are still registered.
    pub(crate) fn handle_event(&self, account: &str, event: ProtocolEvent) {
        trace!(account = %account, event = event.name(), "protocol event");
        let echo = self.is_local_echo(&event);
        let provider = self.provider(account);
        let lookup = |group: &ProtoGroupId, address: &str| {
            provider.as_ref().and_then(|p| {
                p.server_stored_contacts(group)
                    .into_iter()
                    .find(|c| c.address == address)
            })
        };
        self.retrievers.offer(&event, &lookup);
        if echo {
            debug!(account = %account, event = event.name(), "event caused by a local operation, ignored");
            return;
        }

        let provider = provider.as_deref();
        match event {
            ProtocolEvent::SubscriptionCreated { contact } => {
                self.on_subscription_created(provider, contact)
            }
            ProtocolEvent::SubscriptionFailed {
                address,
                code,
                reason,
                ..
            } => {
                warn!(account = %account, address = %address, ?code, reason = %reason, "subscription failed");
            }
            ProtocolEvent::SubscriptionMoved {
                contact,
                new_parent,
                ..
            } => self.on_subscription_moved(provider, contact, new_parent),
            ProtocolEvent::SubscriptionRemoved { contact } => self.on_subscription_removed(contact),
            ProtocolEvent::SubscriptionResolved { contact } => {
                self.on_subscription_resolved(contact)
            }
            ProtocolEvent::ContactModified { contact, property } => {
                self.on_contact_modified(contact, property)
            }
            ProtocolEvent::GroupCreated { group } => self.on_group_created(provider, group),
            ProtocolEvent::GroupRemoved { group } => self.on_group_removed(group),
            ProtocolEvent::GroupRenamed { group } => self.on_group_renamed(group),
            ProtocolEvent::GroupResolved { group } => {
                if self.lock_tree().update_proto_group(group.clone()).is_none() {
                    debug!(group = %group.id, "resolved group is not in the list");
                }
            }
            ProtocolEvent::PresenceChanged { contact } => self.on_presence_changed(contact),
            ProtocolEvent::CapabilitiesChanged {
                contact,
                resource,
                capabilities,
            } => self.on_capabilities_changed(contact, resource, capabilities),
        }
    }

    /// Consumes a draining ignore entry when the event is its late echo.
    fn is_local_echo(&self, event: &ProtocolEvent) -> bool {
        match event {
            ProtocolEvent::SubscriptionCreated { contact }
            | ProtocolEvent::SubscriptionMoved { contact, .. } => self
                .contact_ignore
                .should_ignore(&contact.address, &contact.account),
            ProtocolEvent::GroupCreated { group } | ProtocolEvent::GroupRemoved { group } => {
                self.group_ignore.should_ignore(&group.name, group.account())
            }
            _ => false,
        }
    }

    fn on_subscription_created(&self, provider: Option<&dyn ProtocolProvider>, contact: ProtoContact) {
        let capabilities = provider
            .map(|p| capabilities_of(p, &contact.key()))
            .unwrap_or_default();
        let root_proto = provider.map(|p| p.root_group().id);

        let event = {
            let mut tree = self.lock_tree();
            let Some(group) = meta_group_for(&tree, &contact.parent, root_proto.as_ref()) else {
                warn!(address = %contact.address, parent = %contact.parent, "subscription in an unknown group, dropped");
                return;
            };
            if tree.find_meta_contact_by_contact(&contact.key()).is_some() {
                warn!(address = %contact.address, "subscription for a contact already in the list, dropped");
                return;
            }
            let mut meta_contact = MetaContact::new();
            meta_contact.add_proto_contact(contact, capabilities);
            let uid = meta_contact.uid().to_string();
            if let Err(e) = tree.insert_meta_contact(&group, meta_contact) {
                warn!(error = %e, "failed to add subscribed contact");
                return;
            }
            tree.meta_contact(&uid).cloned().map(|mc| {
                MetaContactListEvent::meta_contact(MetaContactEventKind::Added, mc, Some(group))
            })
        };
        self.fire(event.into_iter().collect());
    }

    fn on_subscription_moved(
        &self,
        provider: Option<&dyn ProtocolProvider>,
        mut contact: ProtoContact,
        new_parent: ProtoGroupId,
    ) {
        contact.parent = new_parent.clone();
        let capabilities = provider
            .map(|p| capabilities_of(p, &contact.key()))
            .unwrap_or_default();
        let root_proto = provider.map(|p| p.root_group().id);

        let mut events = Vec::new();
        {
            let mut tree = self.lock_tree();
            let Some(target) = meta_group_for(&tree, &new_parent, root_proto.as_ref()) else {
                warn!(address = %contact.address, group = %new_parent, "move into an unknown group, dropped");
                return;
            };
            let Some(current) = tree.find_meta_contact_by_contact(&contact.key()) else {
                warn!(address = %contact.address, "move of an unknown contact, dropped");
                return;
            };
            let uid = current.uid().to_string();
            let old_group = current.parent_group().map(str::to_string);
            let sole = current.contact_count() == 1;

            if old_group.as_deref() == Some(target.as_str()) {
                tree.update_proto_contact(contact);
                return;
            }

            if sole {
                tree.update_proto_contact(contact);
                if let Err(e) = tree.move_meta_contact(&uid, &target) {
                    warn!(meta = %uid, error = %e, "failed to move meta contact");
                    return;
                }
                if let Some(mc) = tree.meta_contact(&uid) {
                    events.push(MetaContactListEvent::Moved(MetaContactMovedEvent {
                        meta_contact: mc.clone(),
                        old_parent: old_group.unwrap_or_default(),
                        new_parent: target,
                    }));
                }
            } else {
                let mut split = MetaContact::new();
                split.add_proto_contact(contact.clone(), capabilities);
                let split_uid = split.uid().to_string();
                if let Err(e) = tree.insert_meta_contact(&target, split) {
                    warn!(error = %e, "failed to split moved contact");
                    return;
                }
                tree.remove_proto_contact(&uid, &contact.key());
                let new_snapshot = tree.meta_contact(&split_uid).cloned();
                if let Some(added) = new_snapshot.clone() {
                    events.push(MetaContactListEvent::meta_contact(
                        MetaContactEventKind::Added,
                        added,
                        Some(target),
                    ));
                }
                events.push(MetaContactListEvent::proto_contact(
                    ProtoContactEventKind::Moved,
                    contact,
                    tree.meta_contact(&uid).cloned(),
                    new_snapshot,
                ));
            }
        }
        self.fire(events);
    }

    fn on_subscription_removed(&self, contact: ProtoContact) {
        let mut events = Vec::new();
        {
            let mut tree = self.lock_tree();
            let Some(uid) = tree
                .find_meta_contact_by_contact(&contact.key())
                .map(|mc| mc.uid().to_string())
            else {
                debug!(address = %contact.address, "removal of a contact not in the list");
                return;
            };
            remove_contact_locally(&mut tree, &uid, &contact.key(), &mut events);
        }
        self.fire(events);
    }

    fn on_subscription_resolved(&self, contact: ProtoContact) {
        let name = contact.display_name.clone();
        let mut events = Vec::new();
        {
            let mut tree = self.lock_tree();
            let Some((uid, _)) = tree.update_proto_contact(contact) else {
                debug!("resolved contact is not in the list");
                return;
            };
            let rename = tree.meta_contact(&uid).is_some_and(|mc| {
                mc.contact_count() == 1
                    && !mc.is_display_name_user_defined()
                    && mc.display_name() != name
            });
            if rename {
                rename_locally(&mut tree, &uid, &name, &mut events);
            }
        }
        self.fire(events);
    }

    fn on_contact_modified(&self, contact: ProtoContact, property: ContactProperty) {
        let mut events = Vec::new();
        {
            let mut tree = self.lock_tree();
            let Some((uid, _)) = tree.update_proto_contact(contact.clone()) else {
                debug!(address = %contact.address, "modified contact is not in the list");
                return;
            };
            let Some(snapshot) = tree.meta_contact(&uid).cloned() else {
                return;
            };
            match property {
                ContactProperty::DisplayName { old, new } => {
                    if snapshot.display_name() == old && !snapshot.is_display_name_user_defined() {
                        rename_locally(&mut tree, &uid, &new, &mut events);
                    } else {
                        events.push(MetaContactListEvent::proto_contact(
                            ProtoContactEventKind::Renamed,
                            contact,
                            Some(snapshot.clone()),
                            Some(snapshot),
                        ));
                    }
                }
                ContactProperty::Image => {
                    events.push(MetaContactListEvent::AvatarUpdated(
                        MetaContactAvatarUpdateEvent {
                            meta_contact: snapshot,
                            old_avatar_id: None,
                            new_avatar_id: None,
                        },
                    ));
                }
                ContactProperty::PersistentData | ContactProperty::DisplayDetails => {
                    events.push(MetaContactListEvent::proto_contact(
                        ProtoContactEventKind::Modified,
                        contact,
                        Some(snapshot.clone()),
                        Some(snapshot),
                    ));
                }
            }
        }
        self.fire(events);
    }

    fn on_group_created(&self, provider: Option<&dyn ProtocolProvider>, group: ProtoGroup) {
        let Some(parent) = group.parent.clone() else {
            debug!(group = %group.id, "root group announced, nothing to merge");
            return;
        };
        let Some(provider) = provider else {
            warn!(group = %group.id, "group event from an unregistered provider, dropped");
            return;
        };
        let root_proto = provider.root_group().id;
        let subtree = ProtoSubtree::fetch(provider, group.clone());

        let mut events = Vec::new();
        {
            let mut tree = self.lock_tree();
            if tree.find_group_by_proto_group(&group.id).is_some() {
                tree.update_proto_group(group);
                return;
            }
            let Some(parent_meta) = meta_group_for(&tree, &parent, Some(&root_proto)) else {
                warn!(group = %group.name, parent = %parent, "group created in an unknown parent, dropped");
                return;
            };
            let existing = tree
                .subgroup_by_name(&parent_meta, &group.name)
                .map(|g| g.uid().to_string());
            match existing {
                Some(uid) => {
                    self.merge_proto_subtree(&mut tree, &uid, &subtree, true, &mut events);
                    if let Some(snapshot) = tree.group(&uid).cloned() {
                        events.push(MetaContactListEvent::group(
                            GroupEventKind::ContactGroupAdded,
                            snapshot,
                            Some(group.account().to_string()),
                            Some(group),
                        ));
                    }
                }
                None => {
                    let meta_group = MetaContactGroup::new(group.name.clone());
                    let uid = meta_group.uid().to_string();
                    if let Err(e) = tree.insert_group(&parent_meta, meta_group) {
                        warn!(group = %group.name, error = %e, "failed to add created group");
                        return;
                    }
                    self.merge_proto_subtree(&mut tree, &uid, &subtree, false, &mut events);
                    events.extend(subtree_event(&tree, GroupEventKind::Added, &uid));
                }
            }
        }
        self.fire(events);
    }

    fn on_group_removed(&self, group: ProtoGroup) {
        let mut events = Vec::new();
        {
            let mut tree = self.lock_tree();
            let Some(uid) = tree
                .find_group_by_proto_group(&group.id)
                .map(|g| g.uid().to_string())
            else {
                debug!(group = %group.id, "removed group is not in the list");
                return;
            };
            remove_proto_group_locally(&mut tree, &uid, &group.id, &mut events);
        }
        self.fire(events);
    }

    fn on_group_renamed(&self, group: ProtoGroup) {
        let event = {
            let mut tree = self.lock_tree();
            let Some(uid) = tree.update_proto_group(group.clone()) else {
                debug!(group = %group.id, "renamed group is not in the list");
                return;
            };
            let sole = tree
                .group(&uid)
                .is_some_and(|g| g.count_contact_groups() == 1 && g.name() != group.name);
            if sole {
                tree.rename_group(&uid, &group.name);
            }
            tree.group(&uid).cloned().map(|snapshot| {
                MetaContactListEvent::group(
                    GroupEventKind::ContactGroupRenamed,
                    snapshot,
                    Some(group.account().to_string()),
                    Some(group),
                )
            })
        };
        self.fire(event.into_iter().collect());
    }

    fn on_presence_changed(&self, contact: ProtoContact) {
        let event = {
            let mut tree = self.lock_tree();
            let Some(uid) = tree
                .find_meta_contact_by_contact(&contact.key())
                .map(|mc| mc.uid().to_string())
            else {
                return;
            };
            let before = tree.index_of_meta_contact(&uid);
            tree.update_proto_contact(contact);
            let after = tree.index_of_meta_contact(&uid);
            if before == after {
                return;
            }
            tree.meta_contact(&uid)
                .and_then(|mc| mc.parent_group())
                .and_then(|parent| tree.group(parent))
                .cloned()
                .map(|parent| {
                    MetaContactListEvent::group(GroupEventKind::ChildContactsReordered, parent, None, None)
                })
        };
        self.fire(event.into_iter().collect());
    }

    fn on_capabilities_changed(
        &self,
        contact: ProtoContact,
        resource: Option<String>,
        capabilities: CapabilitySet,
    ) {
        let key = contact.key();
        let event = {
            let mut tree = self.lock_tree();
            let Some(uid) = tree.find_meta_contact_by_contact(&key).map(|mc| mc.uid().to_string())
            else {
                return;
            };
            tree.mutate_meta_contact(&uid, |mc| {
                mc.update_capabilities(&key, resource.as_deref(), capabilities)
            });
            tree.meta_contact(&uid).cloned().map(|snapshot| {
                MetaContactListEvent::proto_contact(
                    ProtoContactEventKind::Modified,
                    contact,
                    Some(snapshot.clone()),
                    Some(snapshot),
                )
            })
        };
        self.fire(event.into_iter().collect());
    }
}

/// The meta group holding server group `proto`; the provider's own root
/// maps to the root group.
fn meta_group_for(tree: &ContactTree, proto: &ProtoGroupId, root_proto: Option<&ProtoGroupId>) -> Option<MetaUid> {
    if let Some(group) = tree.find_group_by_proto_group(proto) {
        return Some(group.uid().to_string());
    }
    (root_proto == Some(proto)).then(|| tree.root_uid().to_string())
}

/// Renames a meta contact to a protocol-provided name and queues the rename
/// and reorder events.
fn rename_locally(tree: &mut ContactTree, uid: &str, name: &str, events: &mut Events) {
    let Some((old_name, _)) = tree.mutate_meta_contact(uid, |mc| {
        let old = mc.display_name().to_string();
        mc.set_display_name(name);
        old
    }) else {
        return;
    };
    let Some(snapshot) = tree.meta_contact(uid).cloned() else {
        return;
    };
    let parent = snapshot.parent_group().and_then(|p| tree.group(p)).cloned();
    events.push(MetaContactListEvent::Renamed(MetaContactRenamedEvent {
        meta_contact: snapshot,
        old_name,
        new_name: name.to_string(),
    }));
    if let Some(parent) = parent {
        events.push(MetaContactListEvent::group(
            GroupEventKind::ChildContactsReordered,
            parent,
            None,
            None,
        ));
    }
}

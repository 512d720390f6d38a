//! Merging server stored lists into the tree and tearing them down again.

use tracing::{debug, warn};

use super::{Events, MetaContactListService};
use crate::events::{GroupEventKind, MetaContactEventKind, MetaContactGroupEvent, MetaContactListEvent, ProtoContactEventKind};
use crate::meta_contact::MetaContact;
use crate::meta_group::MetaContactGroup;
use crate::protocol::{capabilities_of, ProtocolProvider};
use crate::tree::ContactTree;
use crate::types::{CapabilitySet, ContactKey, MetaUid, ProtoContact, ProtoGroup, ProtoGroupId};

/// A server group with everything below it, fetched without holding the
/// tree lock.
pub(super) struct ProtoSubtree {
    pub group: ProtoGroup,
    contacts: Vec<(ProtoContact, CapabilitySet)>,
    subgroups: Vec<ProtoSubtree>,
}

impl ProtoSubtree {
    pub fn fetch(provider: &dyn ProtocolProvider, group: ProtoGroup) -> Self {
        let contacts = provider
            .server_stored_contacts(&group.id)
            .into_iter()
            .map(|contact| {
                let capabilities = capabilities_of(provider, &contact.key());
                (contact, capabilities)
            })
            .collect();
        let subgroups = provider
            .server_stored_groups(&group.id)
            .into_iter()
            .map(|child| Self::fetch(provider, child))
            .collect();
        Self {
            group,
            contacts,
            subgroups,
        }
    }
}

impl MetaContactListService {
    /// Imports a provider's whole server stored list under the root group.
    pub(super) fn synchronize_with_server(&self, provider: &dyn ProtocolProvider) {
        let subtree = ProtoSubtree::fetch(provider, provider.root_group());
        let mut events = Vec::new();
        {
            let mut tree = self.lock_tree();
            let root = tree.root_uid().to_string();
            self.merge_proto_subtree(&mut tree, &root, &subtree, true, &mut events);
        }
        debug!(
            account = %subtree.group.account(),
            events = events.len(),
            "server stored list merged"
        );
        self.fire(events);
    }

    /// Adds `subtree` to the meta group `meta_uid`.
    ///
    /// Server subgroups merge into a subgroup already holding them or one with
    /// the same name; otherwise a new meta group is created and announced by a
    /// single group-added event carrying its contents. With `fire` unset only
    /// such enclosing events are produced.
    pub(super) fn merge_proto_subtree(
        &self,
        tree: &mut ContactTree,
        meta_uid: &str,
        subtree: &ProtoSubtree,
        fire: bool,
        events: &mut Events,
    ) {
        let account = subtree.group.account().to_string();
        tree.add_proto_group(meta_uid, subtree.group.clone());

        for (contact, capabilities) in &subtree.contacts {
            if self.contact_ignore.is_ignored(&contact.address, &account) {
                debug!(address = %contact.address, account = %account, "contact pending a local operation, not merged");
                continue;
            }
            if tree.find_meta_contact_by_contact(&contact.key()).is_some() {
                tree.update_proto_contact(contact.clone());
                continue;
            }
            let mut meta_contact = MetaContact::new();
            meta_contact.add_proto_contact(contact.clone(), *capabilities);
            let uid = meta_contact.uid().to_string();
            if let Err(e) = tree.insert_meta_contact(meta_uid, meta_contact) {
                warn!(address = %contact.address, error = %e, "failed to add server stored contact");
                continue;
            }
            if fire {
                if let Some(snapshot) = tree.meta_contact(&uid) {
                    events.push(MetaContactListEvent::meta_contact(
                        MetaContactEventKind::Added,
                        snapshot.clone(),
                        Some(meta_uid.to_string()),
                    ));
                }
            }
        }

        for child in &subtree.subgroups {
            let existing = tree
                .find_group_by_proto_group(&child.group.id)
                .or_else(|| tree.subgroup_by_name(meta_uid, &child.group.name))
                .map(|g| g.uid().to_string());
            match existing {
                Some(uid) => self.merge_proto_subtree(tree, &uid, child, fire, events),
                None => {
                    let group = MetaContactGroup::new(child.group.name.clone());
                    let uid = group.uid().to_string();
                    if let Err(e) = tree.insert_group(meta_uid, group) {
                        warn!(group = %child.group.name, error = %e, "failed to add server stored group");
                        continue;
                    }
                    self.merge_proto_subtree(tree, &uid, child, false, events);
                    if fire {
                        events.extend(subtree_event(tree, GroupEventKind::Added, &uid));
                    }
                }
            }
        }
    }
}

/// Group event carrying everything below the group at this moment.
pub(super) fn subtree_event(
    tree: &ContactTree,
    kind: GroupEventKind,
    uid: &str,
) -> Option<MetaContactListEvent> {
    let group = tree.group(uid)?.clone();
    let (descendant_groups, descendant_contacts) = tree.subtree(uid);
    Some(MetaContactListEvent::Group(MetaContactGroupEvent {
        kind,
        group,
        account: None,
        proto_group: None,
        descendant_groups,
        descendant_contacts,
    }))
}

/// Drops one protocol contact from a meta contact, removing the meta contact
/// once it has no members left.
pub(super) fn remove_contact_locally(
    tree: &mut ContactTree,
    uid: &str,
    key: &ContactKey,
    events: &mut Events,
) {
    if let Some(removed) = tree.remove_proto_contact(uid, key) {
        report_removed_contacts(tree, uid, vec![removed], events);
    }
}

/// Fires one `proto_contact_removed` per dropped member, or a single
/// `meta_contact_removed` when nothing is left of the meta contact.
fn report_removed_contacts(
    tree: &mut ContactTree,
    uid: &str,
    removed: Vec<ProtoContact>,
    events: &mut Events,
) {
    if removed.is_empty() {
        return;
    }
    let Some(meta_contact) = tree.meta_contact(uid) else {
        return;
    };
    if meta_contact.is_empty() {
        let parent = meta_contact.parent_group().map(str::to_string);
        if let Some(meta_contact) = tree.remove_meta_contact(uid) {
            events.push(MetaContactListEvent::meta_contact(
                MetaContactEventKind::Removed,
                meta_contact,
                parent,
            ));
        }
    } else {
        let snapshot = meta_contact.clone();
        events.extend(removed.into_iter().map(|contact| {
            MetaContactListEvent::proto_contact(
                ProtoContactEventKind::Removed,
                contact,
                Some(snapshot.clone()),
                None,
            )
        }));
    }
}

/// Removes the server group `proto_id` from the meta group `meta_uid`, with
/// every contact it held and every server group nested in it. Meta groups
/// left without server groups go too; the root always stays.
pub(super) fn remove_proto_group_locally(
    tree: &mut ContactTree,
    meta_uid: &str,
    proto_id: &ProtoGroupId,
    events: &mut Events,
) {
    let nested: Vec<(MetaUid, ProtoGroupId)> = tree
        .subgroups(meta_uid)
        .iter()
        .flat_map(|group| {
            group
                .contact_groups()
                .iter()
                .filter(|pg| pg.parent.as_ref() == Some(proto_id))
                .map(|pg| (group.uid().to_string(), pg.id.clone()))
                .collect::<Vec<_>>()
        })
        .collect();
    for (uid, id) in nested {
        remove_proto_group_locally(tree, &uid, &id, events);
    }

    for meta_contact in tree.child_contacts(meta_uid) {
        let removed = tree.remove_contacts_for_group(meta_contact.uid(), proto_id);
        report_removed_contacts(tree, meta_contact.uid(), removed, events);
    }

    let Some(removed) = tree.remove_proto_group(meta_uid, proto_id) else {
        return;
    };
    if tree.is_root(meta_uid) {
        return;
    }
    let Some(group) = tree.group(meta_uid).cloned() else {
        return;
    };
    let orphaned = group.count_contact_groups() == 0;
    events.push(MetaContactListEvent::group(
        GroupEventKind::ContactGroupRemoved,
        group,
        Some(proto_id.account.clone()),
        Some(removed),
    ));
    if orphaned {
        events.extend(subtree_event(tree, GroupEventKind::Removed, meta_uid));
        tree.remove_group(meta_uid);
    }
}

/// Removes whatever of `account` is still in the tree after its root group
/// was torn down.
pub(super) fn remove_account_leftovers(tree: &mut ContactTree, account: &str, events: &mut Events) {
    let (groups, _) = tree.subtree(tree.root_uid());
    for group in groups {
        let ids: Vec<ProtoGroupId> = group
            .contact_groups_for_provider(account)
            .map(|pg| pg.id.clone())
            .collect();
        for id in ids {
            remove_proto_group_locally(tree, group.uid(), &id, events);
        }
    }

    let owners: Vec<MetaUid> = tree
        .meta_contacts()
        .filter(|mc| mc.contacts_for_provider(account).next().is_some())
        .map(|mc| mc.uid().to_string())
        .collect();
    for uid in owners {
        let removed = tree.remove_contacts_for_provider(&uid, account);
        report_removed_contacts(tree, &uid, removed, events);
    }
}

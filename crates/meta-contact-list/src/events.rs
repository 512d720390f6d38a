use std::sync::{Arc, Mutex, RwLock, TryLockError};

use crossbeam_channel::{Receiver, Sender};
use tracing::trace;

use crate::meta_contact::MetaContact;
use crate::meta_group::MetaContactGroup;
use crate::types::{AccountId, MetaUid, ProtoContact, ProtoGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaContactEventKind {
    Added,
    Removed,
}

#[derive(Debug, Clone)]
pub struct MetaContactEvent {
    pub kind: MetaContactEventKind,
    pub meta_contact: MetaContact,
    pub parent_group: Option<MetaUid>,
}

#[derive(Debug, Clone)]
pub struct MetaContactRenamedEvent {
    pub meta_contact: MetaContact,
    pub old_name: String,
    pub new_name: String,
}

#[derive(Debug, Clone)]
pub struct MetaContactMovedEvent {
    pub meta_contact: MetaContact,
    pub old_parent: MetaUid,
    pub new_parent: MetaUid,
}

/// A detail of a meta contact changed. Removing a whole detail reports all
/// of its former values.
#[derive(Debug, Clone)]
pub struct MetaContactModifiedEvent {
    pub meta_contact: MetaContact,
    pub name: String,
    pub old_values: Vec<String>,
    pub new_values: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MetaContactAvatarUpdateEvent {
    pub meta_contact: MetaContact,
    pub old_avatar_id: Option<String>,
    pub new_avatar_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupEventKind {
    Added,
    Removed,
    Renamed,
    ContactGroupAdded,
    ContactGroupRenamed,
    ContactGroupRemoved,
    ChildContactsReordered,
}

#[derive(Debug, Clone)]
pub struct MetaContactGroupEvent {
    pub kind: GroupEventKind,
    pub group: MetaContactGroup,
    pub account: Option<AccountId>,
    pub proto_group: Option<ProtoGroup>,
    /// Descendant groups (parents first) and meta contacts at firing time.
    /// Only filled for [`GroupEventKind::Added`] and [`GroupEventKind::Removed`].
    pub descendant_groups: Vec<MetaContactGroup>,
    pub descendant_contacts: Vec<MetaContact>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoContactEventKind {
    Added,
    Moved,
    Removed,
    Renamed,
    Modified,
}

#[derive(Debug, Clone)]
pub struct ProtoContactEvent {
    pub kind: ProtoContactEventKind,
    pub contact: ProtoContact,
    pub old_parent: Option<MetaContact>,
    pub new_parent: Option<MetaContact>,
}

#[derive(Debug, Clone)]
pub enum MetaContactListEvent {
    MetaContact(MetaContactEvent),
    Renamed(MetaContactRenamedEvent),
    Moved(MetaContactMovedEvent),
    Modified(MetaContactModifiedEvent),
    AvatarUpdated(MetaContactAvatarUpdateEvent),
    Group(MetaContactGroupEvent),
    ProtoContact(ProtoContactEvent),
}

/// Receives every change to the meta contact list.
///
/// All methods default to no-ops. Callbacks run after the tree lock is
/// released, so a listener may query or modify the list from inside one.
pub trait MetaContactListListener: Send + Sync {
    fn meta_contact_added(&self, _event: &MetaContactEvent) {}
    fn meta_contact_removed(&self, _event: &MetaContactEvent) {}
    fn meta_contact_renamed(&self, _event: &MetaContactRenamedEvent) {}
    fn meta_contact_moved(&self, _event: &MetaContactMovedEvent) {}
    fn meta_contact_modified(&self, _event: &MetaContactModifiedEvent) {}
    fn meta_contact_avatar_updated(&self, _event: &MetaContactAvatarUpdateEvent) {}
    fn meta_contact_group_added(&self, _event: &MetaContactGroupEvent) {}
    fn meta_contact_group_removed(&self, _event: &MetaContactGroupEvent) {}
    fn meta_contact_group_modified(&self, _event: &MetaContactGroupEvent) {}
    fn child_contacts_reordered(&self, _event: &MetaContactGroupEvent) {}
    fn proto_contact_added(&self, _event: &ProtoContactEvent) {}
    fn proto_contact_moved(&self, _event: &ProtoContactEvent) {}
    fn proto_contact_removed(&self, _event: &ProtoContactEvent) {}
    fn proto_contact_renamed(&self, _event: &ProtoContactEvent) {}
    fn proto_contact_modified(&self, _event: &ProtoContactEvent) {}

    /// Whether to receive events fired while restoring stored contacts or
    /// unloading an account. Persistence layers return false.
    fn wants_transient_events(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    All,
    Transient,
}

struct Queued {
    event: MetaContactListEvent,
    delivery: Delivery,
}

/// Serializes event delivery across threads.
///
/// Events are queued and drained by whichever thread currently holds the
/// delivery lock; a listener that triggers new events from inside a callback
/// gets them delivered after its callback returns.
pub(crate) struct EventDispatcher {
    listeners: RwLock<Vec<Arc<dyn MetaContactListListener>>>,
    tx: Sender<Queued>,
    rx: Receiver<Queued>,
    delivering: Mutex<()>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            listeners: RwLock::new(Vec::new()),
            tx,
            rx,
            delivering: Mutex::new(()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn MetaContactListListener>) {
        let mut listeners = self.listeners.write().unwrap();
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MetaContactListListener>) {
        self.listeners
            .write()
            .unwrap()
            .retain(|l| !same_listener(l, listener));
    }

    pub fn fire(&self, events: Vec<MetaContactListEvent>, delivery: Delivery) {
        if events.is_empty() {
            return;
        }
        for event in events {
            // Both channel ends live in `self`.
            let _ = self.tx.send(Queued { event, delivery });
        }
        self.drain();
    }

    fn drain(&self) {
        loop {
            let _guard = match self.delivering.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            while let Ok(queued) = self.rx.try_recv() {
                let listeners = self.listeners.read().unwrap().clone();
                for listener in listeners {
                    if queued.delivery == Delivery::Transient && !listener.wants_transient_events() {
                        continue;
                    }
                    dispatch(listener.as_ref(), &queued.event);
                }
            }
            drop(_guard);
            if self.rx.is_empty() {
                return;
            }
        }
    }
}

fn same_listener(a: &Arc<dyn MetaContactListListener>, b: &Arc<dyn MetaContactListListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn dispatch(listener: &dyn MetaContactListListener, event: &MetaContactListEvent) {
    match event {
        MetaContactListEvent::MetaContact(e) => match e.kind {
            MetaContactEventKind::Added => listener.meta_contact_added(e),
            MetaContactEventKind::Removed => listener.meta_contact_removed(e),
        },
        MetaContactListEvent::Renamed(e) => listener.meta_contact_renamed(e),
        MetaContactListEvent::Moved(e) => listener.meta_contact_moved(e),
        MetaContactListEvent::Modified(e) => listener.meta_contact_modified(e),
        MetaContactListEvent::AvatarUpdated(e) => listener.meta_contact_avatar_updated(e),
        MetaContactListEvent::Group(e) => match e.kind {
            GroupEventKind::Added => listener.meta_contact_group_added(e),
            GroupEventKind::Removed => listener.meta_contact_group_removed(e),
            GroupEventKind::ChildContactsReordered => listener.child_contacts_reordered(e),
            GroupEventKind::Renamed
            | GroupEventKind::ContactGroupAdded
            | GroupEventKind::ContactGroupRenamed
            | GroupEventKind::ContactGroupRemoved => listener.meta_contact_group_modified(e),
        },
        MetaContactListEvent::ProtoContact(e) => match e.kind {
            ProtoContactEventKind::Added => listener.proto_contact_added(e),
            ProtoContactEventKind::Moved => listener.proto_contact_moved(e),
            ProtoContactEventKind::Removed => listener.proto_contact_removed(e),
            ProtoContactEventKind::Renamed => listener.proto_contact_renamed(e),
            ProtoContactEventKind::Modified => listener.proto_contact_modified(e),
        },
    }
    trace!(event = ?std::mem::discriminant(event), "event dispatched");
}

/// Shorthand constructors used by the service when assembling event batches.
impl MetaContactListEvent {
    pub(crate) fn meta_contact(
        kind: MetaContactEventKind,
        meta_contact: MetaContact,
        parent_group: Option<MetaUid>,
    ) -> Self {
        MetaContactListEvent::MetaContact(MetaContactEvent {
            kind,
            meta_contact,
            parent_group,
        })
    }

    pub(crate) fn group(
        kind: GroupEventKind,
        group: MetaContactGroup,
        account: Option<AccountId>,
        proto_group: Option<ProtoGroup>,
    ) -> Self {
        MetaContactListEvent::Group(MetaContactGroupEvent {
            kind,
            group,
            account,
            proto_group,
            descendant_groups: Vec::new(),
            descendant_contacts: Vec::new(),
        })
    }

    pub(crate) fn proto_contact(
        kind: ProtoContactEventKind,
        contact: ProtoContact,
        old_parent: Option<MetaContact>,
        new_parent: Option<MetaContact>,
    ) -> Self {
        MetaContactListEvent::ProtoContact(ProtoContactEvent {
            kind,
            contact,
            old_parent,
            new_parent,
        })
    }
}

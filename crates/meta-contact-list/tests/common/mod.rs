//! Test utilities: a scriptable protocol provider and a recording listener.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use meta_contact_list::{
    CapabilitySet, ContactKey, Error, MclConfig, MetaContactAvatarUpdateEvent, MetaContactEvent,
    MetaContactGroupEvent, MetaContactListListener, MetaContactModifiedEvent,
    MetaContactMovedEvent, MetaContactRenamedEvent, ProtoContact, ProtoContactEvent, ProtoGroup,
    ProtoGroupId, ProtocolEvent, ProtocolEventSink, ProtocolProvider, ProviderErrorCode, Result,
};

/// How the fake server answers operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Applies the change and delivers the confirming event from inside the call.
    Confirm,
    /// Applies the change but stays quiet; the test delivers the event later.
    Silent,
    /// Rejects the call.
    Fail(ProviderErrorCode),
}

#[derive(Default)]
struct ServerState {
    groups: Vec<ProtoGroup>,
    contacts: Vec<ProtoContact>,
}

pub struct MockProvider {
    account: String,
    reply: Mutex<Reply>,
    state: Mutex<ServerState>,
    sink: Mutex<Option<ProtocolEventSink>>,
    calls: Mutex<Vec<String>>,
    supported: Mutex<CapabilitySet>,
    per_contact: Mutex<Option<HashMap<String, CapabilitySet>>>,
    move_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl MockProvider {
    pub fn new(account: &str) -> Arc<Self> {
        Arc::new(Self {
            account: account.to_string(),
            reply: Mutex::new(Reply::Confirm),
            state: Mutex::new(ServerState::default()),
            sink: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            supported: Mutex::new(CapabilitySet::empty()),
            per_contact: Mutex::new(None),
            move_hook: Mutex::new(None),
        })
    }

    pub fn root(&self) -> ProtoGroupId {
        ProtoGroup::root(self.account.clone()).id
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    pub fn set_supported_capabilities(&self, capabilities: CapabilitySet) {
        *self.supported.lock().unwrap() = capabilities;
    }

    /// Switches to per-contact capability tracking and records `address`'s set.
    pub fn set_contact_capabilities(&self, address: &str, capabilities: CapabilitySet) {
        self.per_contact
            .lock()
            .unwrap()
            .get_or_insert_with(HashMap::new)
            .insert(address.to_string(), capabilities);
    }

    /// Runs `f` once, right after the next server-side move went through.
    pub fn on_move(&self, f: impl FnOnce() + Send + 'static) {
        *self.move_hook.lock().unwrap() = Some(Box::new(f));
    }

    pub fn is_attached(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Puts a group on the server without telling anyone.
    pub fn seed_group(&self, parent: &ProtoGroupId, uid: &str, name: &str) -> ProtoGroup {
        let group = ProtoGroup::new(parent, uid, name);
        self.state.lock().unwrap().groups.push(group.clone());
        group
    }

    /// Puts a contact on the server without telling anyone.
    pub fn seed_contact(&self, parent: &ProtoGroupId, address: &str) -> ProtoContact {
        let contact = ProtoContact::new(parent.clone(), address);
        self.state.lock().unwrap().contacts.push(contact.clone());
        contact
    }

    pub fn server_contact(&self, address: &str) -> Option<ProtoContact> {
        self.state
            .lock()
            .unwrap()
            .contacts
            .iter()
            .find(|c| c.address == address)
            .cloned()
    }

    pub fn server_group(&self, name: &str) -> Option<ProtoGroup> {
        self.state
            .lock()
            .unwrap()
            .groups
            .iter()
            .find(|g| g.name == name)
            .cloned()
    }

    /// Delivers an event the way a connected server would.
    pub fn emit(&self, event: ProtocolEvent) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.deliver(event);
        }
    }

    fn record(&self, call: String) -> Reply {
        self.calls.lock().unwrap().push(call);
        *self.reply.lock().unwrap()
    }

    fn fail(&self, code: ProviderErrorCode) -> Result<()> {
        Err(Error::provider(code, format!("{} refused the operation", self.account)))
    }
}

impl ProtocolProvider for MockProvider {
    fn account_id(&self) -> String {
        self.account.clone()
    }

    fn protocol_name(&self) -> &str {
        "mock"
    }

    fn tracks_contact_capabilities(&self) -> bool {
        self.per_contact.lock().unwrap().is_some()
    }

    fn supported_capabilities(&self) -> CapabilitySet {
        *self.supported.lock().unwrap()
    }

    fn contact_capabilities(&self, contact: &ContactKey) -> CapabilitySet {
        self.per_contact
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|sets| sets.get(&contact.address).copied())
            .unwrap_or_default()
    }

    fn attach(&self, sink: ProtocolEventSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn detach(&self) {
        self.sink.lock().unwrap().take();
    }

    fn server_stored_groups(&self, parent: &ProtoGroupId) -> Vec<ProtoGroup> {
        self.state
            .lock()
            .unwrap()
            .groups
            .iter()
            .filter(|g| g.parent.as_ref() == Some(parent))
            .cloned()
            .collect()
    }

    fn server_stored_contacts(&self, group: &ProtoGroupId) -> Vec<ProtoContact> {
        self.state
            .lock()
            .unwrap()
            .contacts
            .iter()
            .filter(|c| &c.parent == group)
            .cloned()
            .collect()
    }

    fn subscribe(&self, parent: &ProtoGroupId, address: &str) -> Result<()> {
        let reply = self.record(format!("subscribe {}", address));
        if let Reply::Fail(code) = reply {
            return self.fail(code);
        }
        let contact = self.seed_contact(parent, address);
        if reply == Reply::Confirm {
            self.emit(ProtocolEvent::SubscriptionCreated { contact });
        }
        Ok(())
    }

    fn unsubscribe(&self, contact: &ContactKey) -> Result<()> {
        let reply = self.record(format!("unsubscribe {}", contact.address));
        if let Reply::Fail(code) = reply {
            return self.fail(code);
        }
        let removed = {
            let mut state = self.state.lock().unwrap();
            let index = state.contacts.iter().position(|c| c.address == contact.address);
            index.map(|i| state.contacts.remove(i))
        };
        if let (Some(contact), Reply::Confirm) = (removed, reply) {
            self.emit(ProtocolEvent::SubscriptionRemoved { contact });
        }
        Ok(())
    }

    fn move_contact_to_group(&self, contact: &ContactKey, new_parent: &ProtoGroupId) -> Result<()> {
        let reply = self.record(format!("move {} {}", contact.address, new_parent.uid));
        if let Reply::Fail(code) = reply {
            return self.fail(code);
        }
        let moved = {
            let mut state = self.state.lock().unwrap();
            state
                .contacts
                .iter_mut()
                .find(|c| c.address == contact.address)
                .map(|c| {
                    let old = std::mem::replace(&mut c.parent, new_parent.clone());
                    (c.clone(), old)
                })
        };
        if let (Some((contact, old_parent)), Reply::Confirm) = (moved, reply) {
            self.emit(ProtocolEvent::SubscriptionMoved {
                contact,
                old_parent,
                new_parent: new_parent.clone(),
            });
        }
        let hook = self.move_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    fn create_server_stored_group(&self, parent: &ProtoGroupId, name: &str) -> Result<()> {
        let reply = self.record(format!("create_group {}", name));
        if let Reply::Fail(code) = reply {
            return self.fail(code);
        }
        let group = self.seed_group(parent, &format!("srv-{}", name.to_lowercase()), name);
        if reply == Reply::Confirm {
            self.emit(ProtocolEvent::GroupCreated { group });
        }
        Ok(())
    }

    fn rename_server_stored_group(&self, group: &ProtoGroupId, name: &str) -> Result<()> {
        let reply = self.record(format!("rename_group {} {}", group.uid, name));
        if let Reply::Fail(code) = reply {
            return self.fail(code);
        }
        let renamed = {
            let mut state = self.state.lock().unwrap();
            state.groups.iter_mut().find(|g| &g.id == group).map(|g| {
                g.name = name.to_string();
                g.clone()
            })
        };
        if let (Some(group), Reply::Confirm) = (renamed, reply) {
            self.emit(ProtocolEvent::GroupRenamed { group });
        }
        Ok(())
    }

    fn remove_server_stored_group(&self, group: &ProtoGroupId) -> Result<()> {
        let reply = self.record(format!("remove_group {}", group.uid));
        if let Reply::Fail(code) = reply {
            return self.fail(code);
        }
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.contacts.retain(|c| &c.parent != group);
            let index = state.groups.iter().position(|g| &g.id == group);
            index.map(|i| state.groups.remove(i))
        };
        if let (Some(group), Reply::Confirm) = (removed, reply) {
            self.emit(ProtocolEvent::GroupRemoved { group });
        }
        Ok(())
    }

    fn set_display_name(&self, contact: &ContactKey, name: &str) -> Result<()> {
        self.record(format!("set_display_name {} {}", contact.address, name));
        Ok(())
    }

    fn create_unresolved_contact(
        &self,
        address: &str,
        persistent_data: Option<&str>,
        parent: &ProtoGroupId,
    ) -> Result<ProtoContact> {
        let mut contact = ProtoContact::new(parent.clone(), address);
        contact.resolved = false;
        contact.persistent_data = persistent_data.map(str::to_string);
        Ok(contact)
    }

    fn create_unresolved_group(
        &self,
        uid: &str,
        name: &str,
        persistent_data: Option<&str>,
        parent: &ProtoGroupId,
    ) -> Result<ProtoGroup> {
        let mut group = ProtoGroup::new(parent, uid, name);
        group.resolved = false;
        group.persistent_data = persistent_data.map(str::to_string);
        Ok(group)
    }
}

/// Listener events flattened to something easy to assert on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Added(String),
    Removed(String),
    Renamed(String, String),
    Moved(String, String),
    Modified(String, String),
    Avatar(String),
    GroupAdded(String),
    GroupRemoved(String),
    GroupModified(String),
    Reordered(String),
    ProtoAdded(String),
    ProtoMoved(String),
    ProtoRemoved(String),
    ProtoRenamed(String),
    ProtoModified(String),
}

pub struct RecordingListener {
    tx: Sender<Seen>,
    transient: bool,
}

impl RecordingListener {
    pub fn new() -> (Arc<Self>, Receiver<Seen>) {
        Self::with_transient(true)
    }

    pub fn with_transient(transient: bool) -> (Arc<Self>, Receiver<Seen>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Arc::new(Self { tx, transient }), rx)
    }

    fn push(&self, seen: Seen) {
        let _ = self.tx.send(seen);
    }
}

impl MetaContactListListener for RecordingListener {
    fn meta_contact_added(&self, event: &MetaContactEvent) {
        self.push(Seen::Added(event.meta_contact.display_name().to_string()));
    }

    fn meta_contact_removed(&self, event: &MetaContactEvent) {
        self.push(Seen::Removed(event.meta_contact.display_name().to_string()));
    }

    fn meta_contact_renamed(&self, event: &MetaContactRenamedEvent) {
        self.push(Seen::Renamed(event.old_name.clone(), event.new_name.clone()));
    }

    fn meta_contact_moved(&self, event: &MetaContactMovedEvent) {
        self.push(Seen::Moved(event.old_parent.clone(), event.new_parent.clone()));
    }

    fn meta_contact_modified(&self, event: &MetaContactModifiedEvent) {
        self.push(Seen::Modified(
            event.meta_contact.display_name().to_string(),
            event.name.clone(),
        ));
    }

    fn meta_contact_avatar_updated(&self, event: &MetaContactAvatarUpdateEvent) {
        self.push(Seen::Avatar(event.meta_contact.display_name().to_string()));
    }

    fn meta_contact_group_added(&self, event: &MetaContactGroupEvent) {
        self.push(Seen::GroupAdded(event.group.name().to_string()));
    }

    fn meta_contact_group_removed(&self, event: &MetaContactGroupEvent) {
        self.push(Seen::GroupRemoved(event.group.name().to_string()));
    }

    fn meta_contact_group_modified(&self, event: &MetaContactGroupEvent) {
        self.push(Seen::GroupModified(event.group.name().to_string()));
    }

    fn child_contacts_reordered(&self, event: &MetaContactGroupEvent) {
        self.push(Seen::Reordered(event.group.name().to_string()));
    }

    fn proto_contact_added(&self, event: &ProtoContactEvent) {
        self.push(Seen::ProtoAdded(event.contact.address.clone()));
    }

    fn proto_contact_moved(&self, event: &ProtoContactEvent) {
        self.push(Seen::ProtoMoved(event.contact.address.clone()));
    }

    fn proto_contact_removed(&self, event: &ProtoContactEvent) {
        self.push(Seen::ProtoRemoved(event.contact.address.clone()));
    }

    fn proto_contact_renamed(&self, event: &ProtoContactEvent) {
        self.push(Seen::ProtoRenamed(event.contact.address.clone()));
    }

    fn proto_contact_modified(&self, event: &ProtoContactEvent) {
        self.push(Seen::ProtoModified(event.contact.address.clone()));
    }

    fn wants_transient_events(&self) -> bool {
        self.transient
    }
}

/// Everything recorded so far.
pub fn drain(rx: &Receiver<Seen>) -> Vec<Seen> {
    rx.try_iter().collect()
}

pub fn fast_config() -> MclConfig {
    MclConfig {
        modification_timeout_ms: 150,
        late_event_grace_ms: 5_000,
        ..MclConfig::default()
    }
}

pub fn short_wait() -> Duration {
    Duration::from_millis(50)
}

//! The contact list service: owns the tree, talks to protocol providers and
//! fires listener events.

mod handlers;
mod loader;
mod operations;
mod sync;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tracing::{debug, error, info, warn};

use crate::config::MclConfig;
use crate::events::{Delivery, EventDispatcher, MetaContactListEvent, MetaContactListListener};
use crate::ignore_list::EventIgnoreList;
use crate::meta_contact::MetaContact;
use crate::meta_group::MetaContactGroup;
use crate::persistence::ContactListPersistence;
use crate::protocol::{ProtocolEventSink, ProtocolProvider};
use crate::retriever::EventRetrievers;
use crate::tree::ContactTree;
use crate::types::{AccountId, ContactKey, ProtoGroupId};
use crate::{Error, ErrorCode, ProviderErrorCode, Result};

pub use loader::StoredContactDescriptor;

/// Why a provider is going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderRemoval {
    /// The account was deleted; persistence listeners drop its records.
    Uninstalled,
    /// The account is only going offline for this session; its removals are
    /// transient and persistence listeners keep their records.
    Unloaded,
}

/// Merges the contact lists of every registered account into one tree of
/// [`MetaContactGroup`]s and [`MetaContact`]s.
///
/// Caller operations that need the server's confirmation block for at most
/// [`MclConfig::modification_timeout`]. Protocol events arrive through the
/// [`ProtocolEventSink`] handed to each provider.
pub struct MetaContactListService {
    config: MclConfig,
    tree: Mutex<ContactTree>,
    providers: RwLock<HashMap<AccountId, Arc<dyn ProtocolProvider>>>,
    contact_ignore: EventIgnoreList,
    group_ignore: EventIgnoreList,
    retrievers: EventRetrievers,
    dispatcher: EventDispatcher,
    persistence: RwLock<Option<Arc<dyn ContactListPersistence>>>,
    self_ref: Weak<MetaContactListService>,
}

impl MetaContactListService {
    pub fn new(config: MclConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            contact_ignore: EventIgnoreList::new(config.late_event_grace()),
            group_ignore: EventIgnoreList::new(config.late_event_grace()),
            config,
            tree: Mutex::new(ContactTree::new()),
            providers: RwLock::new(HashMap::new()),
            retrievers: EventRetrievers::new(),
            dispatcher: EventDispatcher::new(),
            persistence: RwLock::new(None),
            self_ref: self_ref.clone(),
        })
    }

    /// Creates a service whose list is restored from and written back to
    /// `persistence`.
    pub fn with_persistence<P>(config: MclConfig, persistence: Arc<P>) -> Arc<Self>
    where
        P: ContactListPersistence + 'static,
    {
        let service = Self::new(config);
        service.dispatcher.add_listener(persistence.clone());
        *service.persistence.write().unwrap() = Some(persistence as Arc<dyn ContactListPersistence>);
        service
    }

    pub fn config(&self) -> &MclConfig {
        &self.config
    }

    pub fn add_listener(&self, listener: Arc<dyn MetaContactListListener>) {
        self.dispatcher.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MetaContactListListener>) {
        self.dispatcher.remove_listener(listener);
    }

    /// Registers an account: restores its stored contacts, merges its server
    /// stored list and starts receiving its events.
    pub fn add_provider(&self, provider: Arc<dyn ProtocolProvider>) -> Result<()> {
        let account = provider.account_id();
        if let Some(mask) = &self.config.provider_mask {
            if provider.provider_mask().as_deref() != Some(mask.as_str()) {
                debug!(account = %account, "provider does not match the configured mask, ignoring");
                return Ok(());
            }
        }

        {
            let mut providers = self.providers.write().unwrap();
            if providers.contains_key(&account) {
                warn!(account = %account, "provider already registered");
                return Ok(());
            }
            providers.insert(account.clone(), provider.clone());
        }
        info!(account = %account, protocol = provider.protocol_name(), "provider added");

        // Restored contacts in the root group point at the provider's root.
        {
            let mut tree = self.lock_tree();
            let root = tree.root_uid().to_string();
            tree.add_proto_group(&root, provider.root_group());
        }

        let persistence = self.persistence.read().unwrap().clone();
        if let Some(persistence) = persistence {
            if let Err(e) = persistence.restore_account(self, &account) {
                error!(account = %account, error = %e, "failed to restore stored contact list");
            }
        }

        if !provider.supports_persistent_presence() {
            debug!(account = %account, "provider keeps no server stored list");
            return Ok(());
        }

        self.synchronize_with_server(provider.as_ref());
        provider.attach(ProtocolEventSink::new(self.self_ref.clone(), account));
        Ok(())
    }

    /// Detaches an account and removes its contacts and groups from the tree.
    pub fn remove_provider(&self, account: &str, removal: ProviderRemoval) {
        let Some(provider) = self.providers.write().unwrap().remove(account) else {
            debug!(account = %account, "remove_provider: unknown account");
            return;
        };
        provider.detach();

        let mut events = Vec::new();
        {
            let mut tree = self.lock_tree();
            let root = tree.root_uid().to_string();
            let root_proto = provider.root_group().id;
            sync::remove_proto_group_locally(&mut tree, &root, &root_proto, &mut events);
            sync::remove_account_leftovers(&mut tree, account, &mut events);
        }
        let delivery = match removal {
            ProviderRemoval::Uninstalled => Delivery::All,
            ProviderRemoval::Unloaded => Delivery::Transient,
        };
        info!(account = %account, ?removal, "provider removed");
        self.dispatcher.fire(events, delivery);
    }

    pub fn provider(&self, account: &str) -> Option<Arc<dyn ProtocolProvider>> {
        self.providers.read().unwrap().get(account).cloned()
    }

    pub fn accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<_> = self.providers.read().unwrap().keys().cloned().collect();
        accounts.sort();
        accounts
    }

    /// Deletes the persisted copy of the list, leaving the in-memory tree.
    pub fn purge_locally_stored_contact_list_copy(&self) -> Result<()> {
        let persistence = self.persistence.read().unwrap().clone();
        match persistence {
            Some(persistence) => persistence.purge(),
            None => Ok(()),
        }
    }

    pub fn root(&self) -> MetaContactGroup {
        let tree = self.lock_tree();
        let root = tree.root_uid().to_string();
        tree.group(&root).cloned().unwrap_or_else(|| MetaContactGroup::with_uid(root, ""))
    }

    pub fn group(&self, uid: &str) -> Option<MetaContactGroup> {
        self.lock_tree().group(uid).cloned()
    }

    pub fn meta_contact(&self, uid: &str) -> Option<MetaContact> {
        self.lock_tree().meta_contact(uid).cloned()
    }

    pub fn child_contacts(&self, group: &str) -> Vec<MetaContact> {
        self.lock_tree().child_contacts(group)
    }

    pub fn subgroups(&self, group: &str) -> Vec<MetaContactGroup> {
        self.lock_tree().subgroups(group)
    }

    pub fn parent_group_of(&self, meta_contact: &str) -> Option<MetaContactGroup> {
        let tree = self.lock_tree();
        let parent = tree.meta_contact(meta_contact)?.parent_group()?;
        tree.group(parent).cloned()
    }

    pub fn find_meta_contact_by_contact(&self, contact: &ContactKey) -> Option<MetaContact> {
        self.lock_tree().find_meta_contact_by_contact(contact).cloned()
    }

    pub fn find_meta_contact_by_meta_uid(&self, uid: &str) -> Option<MetaContact> {
        self.meta_contact(uid)
    }

    pub fn find_meta_contact_group_by_meta_uid(&self, uid: &str) -> Option<MetaContactGroup> {
        self.group(uid)
    }

    pub fn find_meta_contact_group_by_contact_group(
        &self,
        proto_group: &ProtoGroupId,
    ) -> Option<MetaContactGroup> {
        self.lock_tree().find_group_by_proto_group(proto_group).cloned()
    }

    /// Meta contacts with at least one contact of `account`, searched below
    /// `group` (or the root) recursively.
    pub fn find_all_meta_contacts_for_provider(
        &self,
        account: &str,
        group: Option<&str>,
    ) -> Vec<MetaContact> {
        let tree = self.lock_tree();
        let start = group.unwrap_or(tree.root_uid()).to_string();
        let (_, contacts) = tree.subtree(&start);
        contacts
            .into_iter()
            .filter(|mc| mc.contacts_for_provider(account).next().is_some())
            .collect()
    }

    /// Meta contacts with a member whose address or display name is `address`.
    pub fn find_all_meta_contacts_for_address(&self, address: &str) -> Vec<MetaContact> {
        self.lock_tree()
            .meta_contacts()
            .filter(|mc| {
                mc.contacts()
                    .iter()
                    .any(|c| c.address == address || c.display_name == address)
            })
            .cloned()
            .collect()
    }

    pub fn count_online_child_contacts(&self, group: &str) -> usize {
        self.lock_tree()
            .child_contacts(group)
            .iter()
            .filter(|mc| mc.is_online())
            .count()
    }

    pub(crate) fn lock_tree(&self) -> MutexGuard<'_, ContactTree> {
        self.tree.lock().unwrap()
    }

    pub(crate) fn fire(&self, events: Vec<MetaContactListEvent>) {
        self.dispatcher.fire(events, Delivery::All);
    }

    pub(crate) fn fire_transient(&self, events: Vec<MetaContactListEvent>) {
        self.dispatcher.fire(events, Delivery::Transient);
    }

    pub(crate) fn require_provider(&self, account: &str) -> Result<Arc<dyn ProtocolProvider>> {
        self.provider(account)
            .ok_or_else(|| Error::InvalidArgument(format!("no provider registered for {}", account)))
    }
}

/// Maps a provider failure onto the caller-facing taxonomy.
pub(crate) fn map_provider_error(err: Error) -> Error {
    match err {
        Error::OperationFailed { code, message } => match code {
            ProviderErrorCode::SubscriptionAlreadyExists => Error::ContactAlreadyExists(message),
            ProviderErrorCode::NotSupportedOperation => Error::NotSupported(message),
            _ => Error::Network(message),
        },
        other => other,
    }
}

/// Not-supported answers are expected from offline providers and only
/// logged at debug level.
pub(crate) fn log_provider_failure(operation: &str, account: &str, err: &Error) {
    if err.code() == ErrorCode::NotSupported {
        debug!(operation, account = %account, error = %err, "provider does not support operation");
    } else {
        warn!(operation, account = %account, error = %err, "provider operation failed");
    }
}

pub(crate) type Events = Vec<MetaContactListEvent>;

use std::sync::Weak;

use crate::error::ProviderErrorCode;
use crate::service::MetaContactListService;
use crate::types::{AccountId, CapabilitySet, ContactKey, ProtoContact, ProtoGroup, ProtoGroupId};
use crate::Result;

/// Which property of a protocol contact changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactProperty {
    DisplayName { old: String, new: String },
    Image,
    PersistentData,
    DisplayDetails,
}

/// Notifications a protocol provider delivers about its server stored list.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    SubscriptionCreated {
        contact: ProtoContact,
    },
    SubscriptionFailed {
        account: AccountId,
        address: String,
        code: ProviderErrorCode,
        reason: String,
    },
    SubscriptionRemoved {
        contact: ProtoContact,
    },
    SubscriptionMoved {
        contact: ProtoContact,
        old_parent: ProtoGroupId,
        new_parent: ProtoGroupId,
    },
    SubscriptionResolved {
        contact: ProtoContact,
    },
    ContactModified {
        contact: ProtoContact,
        property: ContactProperty,
    },
    GroupCreated {
        group: ProtoGroup,
    },
    GroupRemoved {
        group: ProtoGroup,
    },
    GroupRenamed {
        group: ProtoGroup,
    },
    GroupResolved {
        group: ProtoGroup,
    },
    PresenceChanged {
        contact: ProtoContact,
    },
    /// `resource` is the full resource address the set was advertised for.
    CapabilitiesChanged {
        contact: ProtoContact,
        resource: Option<String>,
        capabilities: CapabilitySet,
    },
}

impl ProtocolEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolEvent::SubscriptionCreated { .. } => "subscription_created",
            ProtocolEvent::SubscriptionFailed { .. } => "subscription_failed",
            ProtocolEvent::SubscriptionRemoved { .. } => "subscription_removed",
            ProtocolEvent::SubscriptionMoved { .. } => "subscription_moved",
            ProtocolEvent::SubscriptionResolved { .. } => "subscription_resolved",
            ProtocolEvent::ContactModified { .. } => "contact_modified",
            ProtocolEvent::GroupCreated { .. } => "group_created",
            ProtocolEvent::GroupRemoved { .. } => "group_removed",
            ProtocolEvent::GroupRenamed { .. } => "group_renamed",
            ProtocolEvent::GroupResolved { .. } => "group_resolved",
            ProtocolEvent::PresenceChanged { .. } => "presence_changed",
            ProtocolEvent::CapabilitiesChanged { .. } => "capabilities_changed",
        }
    }
}

/// Handle a provider uses to push [`ProtocolEvent`]s into the contact list.
///
/// Holds only a weak reference, so a provider outliving the service simply
/// delivers into nothing.
#[derive(Clone)]
pub struct ProtocolEventSink {
    service: Weak<MetaContactListService>,
    account: AccountId,
}

impl ProtocolEventSink {
    pub(crate) fn new(service: Weak<MetaContactListService>, account: AccountId) -> Self {
        Self { service, account }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn deliver(&self, event: ProtocolEvent) {
        if let Some(service) = self.service.upgrade() {
            service.handle_event(&self.account, event);
        }
    }
}

/// The capability set recorded for `contact` when it enters the list.
pub(crate) fn capabilities_of(provider: &dyn ProtocolProvider, contact: &ContactKey) -> CapabilitySet {
    if provider.tracks_contact_capabilities() {
        provider.contact_capabilities(contact)
    } else {
        provider.supported_capabilities()
    }
}

/// One account's view of a server stored contact list.
///
/// Operations only start the change on the server; the outcome arrives later
/// as a [`ProtocolEvent`] through the attached sink. Providers may deliver
/// that event on any thread, including synchronously from inside the call.
pub trait ProtocolProvider: Send + Sync {
    fn account_id(&self) -> AccountId;

    fn protocol_name(&self) -> &str {
        "unknown"
    }

    /// Tag compared against the configured provider mask.
    fn provider_mask(&self) -> Option<String> {
        None
    }

    /// Whether the provider keeps a server stored contact list at all.
    fn supports_persistent_presence(&self) -> bool {
        true
    }

    /// Whether capability sets are reported per contact. When false every
    /// contact is assumed to support [`ProtocolProvider::supported_capabilities`].
    fn tracks_contact_capabilities(&self) -> bool {
        false
    }

    fn supported_capabilities(&self) -> CapabilitySet {
        CapabilitySet::empty()
    }

    /// Only consulted when [`ProtocolProvider::tracks_contact_capabilities`]
    /// holds.
    fn contact_capabilities(&self, _contact: &ContactKey) -> CapabilitySet {
        self.supported_capabilities()
    }

    fn attach(&self, sink: ProtocolEventSink);

    fn detach(&self);

    fn root_group(&self) -> ProtoGroup {
        ProtoGroup::root(self.account_id())
    }

    fn server_stored_groups(&self, parent: &ProtoGroupId) -> Vec<ProtoGroup>;

    fn server_stored_contacts(&self, group: &ProtoGroupId) -> Vec<ProtoContact>;

    fn subscribe(&self, parent: &ProtoGroupId, address: &str) -> Result<()>;

    fn unsubscribe(&self, contact: &ContactKey) -> Result<()>;

    fn move_contact_to_group(&self, contact: &ContactKey, new_parent: &ProtoGroupId) -> Result<()>;

    fn create_server_stored_group(&self, parent: &ProtoGroupId, name: &str) -> Result<()>;

    fn rename_server_stored_group(&self, group: &ProtoGroupId, name: &str) -> Result<()>;

    fn remove_server_stored_group(&self, group: &ProtoGroupId) -> Result<()>;

    fn set_display_name(&self, contact: &ContactKey, name: &str) -> Result<()>;

    /// Builds a contact from stored data without a server round trip.
    fn create_unresolved_contact(
        &self,
        address: &str,
        persistent_data: Option<&str>,
        parent: &ProtoGroupId,
    ) -> Result<ProtoContact>;

    /// Builds a group from stored data without a server round trip.
    fn create_unresolved_group(
        &self,
        uid: &str,
        name: &str,
        persistent_data: Option<&str>,
        parent: &ProtoGroupId,
    ) -> Result<ProtoGroup>;
}

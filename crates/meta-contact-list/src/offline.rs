use crate::error::ProviderErrorCode;
use crate::protocol::{ProtocolEventSink, ProtocolProvider};
use crate::types::{AccountId, ContactKey, ProtoContact, ProtoGroup, ProtoGroupId};
use crate::{Error, Result};

/// Provider for an account that is not connected.
///
/// Builds unresolved contacts and groups so a stored list can be opened and
/// edited locally; every server operation fails with
/// [`ProviderErrorCode::NotSupportedOperation`].
#[derive(Debug, Clone)]
pub struct OfflineProvider {
    account: AccountId,
}

impl OfflineProvider {
    pub fn new(account: impl Into<AccountId>) -> Self {
        Self {
            account: account.into(),
        }
    }

    fn unsupported<T>(&self, operation: &str) -> Result<T> {
        Err(Error::provider(
            ProviderErrorCode::NotSupportedOperation,
            format!("{} is offline, cannot {}", self.account, operation),
        ))
    }
}

impl ProtocolProvider for OfflineProvider {
    fn account_id(&self) -> AccountId {
        self.account.clone()
    }

    fn protocol_name(&self) -> &str {
        "offline"
    }

    fn supports_persistent_presence(&self) -> bool {
        false
    }

    fn attach(&self, _sink: ProtocolEventSink) {}

    fn detach(&self) {}

    fn server_stored_groups(&self, _parent: &ProtoGroupId) -> Vec<ProtoGroup> {
        Vec::new()
    }

    fn server_stored_contacts(&self, _group: &ProtoGroupId) -> Vec<ProtoContact> {
        Vec::new()
    }

    fn subscribe(&self, _parent: &ProtoGroupId, _address: &str) -> Result<()> {
        self.unsupported("subscribe")
    }

    fn unsubscribe(&self, _contact: &ContactKey) -> Result<()> {
        self.unsupported("unsubscribe")
    }

    fn move_contact_to_group(&self, _contact: &ContactKey, _new_parent: &ProtoGroupId) -> Result<()> {
        self.unsupported("move contacts")
    }

    fn create_server_stored_group(&self, _parent: &ProtoGroupId, _name: &str) -> Result<()> {
        self.unsupported("create groups")
    }

    fn rename_server_stored_group(&self, _group: &ProtoGroupId, _name: &str) -> Result<()> {
        self.unsupported("rename groups")
    }

    fn remove_server_stored_group(&self, _group: &ProtoGroupId) -> Result<()> {
        self.unsupported("remove groups")
    }

    fn set_display_name(&self, _contact: &ContactKey, _name: &str) -> Result<()> {
        self.unsupported("rename contacts")
    }

    fn create_unresolved_contact(
        &self,
        address: &str,
        persistent_data: Option<&str>,
        parent: &ProtoGroupId,
    ) -> Result<ProtoContact> {
        if parent.account != self.account {
            return Err(Error::provider(
                ProviderErrorCode::IllegalArgument,
                format!("group {} belongs to another account", parent),
            ));
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    #[test]
    fn server_operations_are_not_supported() {
        let provider = OfflineProvider::new("acc");
        let root = provider.root_group();
        let err = provider.subscribe(&root.id, "alice@x").unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotSupported);
        assert!(provider.server_stored_groups(&root.id).is_empty());
    }

    #[test]
    fn unresolved_entities_keep_stored_data() {
        let provider = OfflineProvider::new("acc");
        let root = provider.root_group();
        let group = provider
            .create_unresolved_group("friends", "Friends", Some("g-data"), &root.id)
            .unwrap();
        assert!(!group.resolved);
        assert_eq!(group.parent.as_ref(), Some(&root.id));

        let contact = provider
            .create_unresolved_contact("alice@x", Some("c-data"), &group.id)
            .unwrap();
        assert!(!contact.resolved);
        assert_eq!(contact.persistent_data.as_deref(), Some("c-data"));
        assert_eq!(contact.parent, group.id);

        let foreign = ProtoGroup::root("other");
        assert!(provider
            .create_unresolved_contact("bob@x", None, &foreign.id)
            .is_err());
    }
}

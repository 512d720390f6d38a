use crate::events::MetaContactListListener;
use crate::service::MetaContactListService;
use crate::Result;

/// A listener that keeps a durable copy of the list.
///
/// The service calls [`ContactListPersistence::restore_account`] when an
/// account's provider is added, before the server stored list is merged.
/// Restoration goes through the `load_stored_*` operations of the service.
pub trait ContactListPersistence: MetaContactListListener {
    fn restore_account(&self, service: &MetaContactListService, account: &str) -> Result<()>;

    /// Deletes the durable copy.
    fn purge(&self) -> Result<()>;
}

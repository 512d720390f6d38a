use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use meta_contact_list::{
    FileStorageAdapter, MclConfig, MclStorage, MessageHistory, MetaContactListService,
    OfflineProvider, RecentMessages, StorageAdapter,
};
use tracing::debug;

/// The stored contact list, opened offline: one [`OfflineProvider`] per
/// account found in storage.
pub struct ContactList {
    pub service: Arc<MetaContactListService>,
    pub storage: Arc<MclStorage>,
    pub history: MessageHistory,
    pub recent: Arc<RecentMessages>,
}

impl ContactList {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let config = MclConfig::load(&data_dir.join("config.json"))
            .context("Failed to load config file")?;
        let adapter = FileStorageAdapter::new(data_dir.join("contacts"))
            .context("Failed to open contact storage")?;
        let storage = Arc::new(MclStorage::new(Arc::new(adapter)));
        let history_adapter: Arc<dyn StorageAdapter> = Arc::new(
            FileStorageAdapter::new(data_dir.join("history"))
                .context("Failed to open history storage")?,
        );
        let recent = Arc::new(
            RecentMessages::load(history_adapter.clone(), config.recent_messages_limit)
                .context("Failed to load recent messages")?,
        );
        let service = MetaContactListService::with_persistence(config, storage.clone());
        service.add_listener(recent.clone());

        let accounts = storage
            .accounts()
            .context("Failed to read stored accounts")?;
        debug!(data_dir = %data_dir.display(), accounts = accounts.len(), "opening stored contact list");
        for account in accounts {
            service
                .add_provider(Arc::new(OfflineProvider::new(account.clone())))
                .with_context(|| format!("Failed to open account {}", account))?;
        }
        Ok(Self {
            service,
            storage,
            history: MessageHistory::new(history_adapter),
            recent,
        })
    }
}

/// Writes one contact record the way a connected client would have.
#[cfg(test)]
pub(crate) fn seed_contact(data_dir: &Path, meta_uid: &str, address: &str) {
    use meta_contact_list::{StorageAdapter, StoredContactRecord};

    let adapter = FileStorageAdapter::new(data_dir.join("contacts")).unwrap();
    let record = StoredContactRecord {
        account: "xmpp".into(),
        meta_uid: meta_uid.into(),
        proto_group_uid: meta_contact_list::ROOT_GROUP_UID.into(),
        address: address.into(),
        display_name: address.into(),
        user_defined: false,
        contact_display_name: address.into(),
        details: Default::default(),
        persistent_data: None,
    };
    adapter
        .put(
            &format!("v1/mcl/contact/{}/xmpp/{}", meta_uid, address),
            serde_json::to_string(&record).unwrap(),
        )
        .unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use meta_contact_list::ContactListPersistence;
    use tempfile::TempDir;

    #[test]
    fn test_open_empty_data_dir() {
        let temp = TempDir::new().unwrap();
        let list = ContactList::open(temp.path()).unwrap();
        assert!(list.service.accounts().is_empty());
        assert!(list.service.root().is_empty());
    }

    #[test]
    fn test_open_restores_accounts() {
        let temp = TempDir::new().unwrap();
        seed_contact(temp.path(), "m1", "alice@x");

        let list = ContactList::open(temp.path()).unwrap();
        assert_eq!(list.service.accounts(), vec!["xmpp".to_string()]);
        let alice = list.service.meta_contact("m1").unwrap();
        assert_eq!(alice.display_name(), "alice@x");

        list.storage.purge().unwrap();
        assert!(list.storage.accounts().unwrap().is_empty());
    }
}

mod common;

use std::sync::Arc;

use common::{fast_config, MockProvider};
use meta_contact_list::{
    ContactKey, ContactListPersistence, FileStorageAdapter, MclStorage, MetaContactListService,
    OfflineProvider, ProviderRemoval, Result, StorageAdapter, ROOT_GROUP_UID,
};
use tempfile::TempDir;

fn open_storage(dir: &TempDir) -> Result<Arc<MclStorage>> {
    let adapter = FileStorageAdapter::new(dir.path().join("contacts"))?;
    Ok(Arc::new(MclStorage::new(Arc::new(adapter))))
}

#[test]
fn test_contact_list_survives_restart() -> Result<()> {
    let dir = TempDir::new()?;

    let (zed_uid, work_uid) = {
        let xmpp = MockProvider::new("xmpp");
        let work = xmpp.seed_group(&xmpp.root(), "w1", "Work");
        xmpp.seed_contact(&work.id, "eve@x");
        xmpp.seed_contact(&xmpp.root(), "zed@x");

        let storage = open_storage(&dir)?;
        let service = MetaContactListService::with_persistence(fast_config(), storage.clone());
        service.add_provider(xmpp.clone())?;

        let zed = service
            .find_meta_contact_by_contact(&ContactKey::new("xmpp", "zed@x"))
            .expect("zed synced");
        service.rename_meta_contact(zed.uid(), "Zed")?;
        service.add_detail(zed.uid(), "email", "zed@mail")?;

        assert_eq!(storage.accounts()?, vec!["xmpp".to_string()]);
        assert_eq!(storage.group_records(Some("xmpp"))?.len(), 1);
        assert_eq!(storage.contact_records(Some("xmpp"))?.len(), 2);

        let work_uid = service.subgroups(ROOT_GROUP_UID)[0].uid().to_string();
        (zed.uid().to_string(), work_uid)
    };

    // Reopen without a connection.
    let storage = open_storage(&dir)?;
    let service = MetaContactListService::with_persistence(fast_config(), storage);
    service.add_provider(Arc::new(OfflineProvider::new("xmpp")))?;

    let work = service.group(&work_uid).expect("work restored");
    assert_eq!(work.name(), "Work");
    assert_eq!(work.parent_group(), Some(ROOT_GROUP_UID));
    let eve = service
        .find_meta_contact_by_contact(&ContactKey::new("xmpp", "eve@x"))
        .expect("eve restored");
    assert_eq!(eve.parent_group(), Some(work_uid.as_str()));
    assert!(!eve.contacts()[0].resolved);

    let zed = service.meta_contact(&zed_uid).expect("zed restored");
    assert_eq!(zed.parent_group(), Some(ROOT_GROUP_UID));
    assert_eq!(zed.display_name(), "Zed");
    assert!(zed.is_display_name_user_defined());
    assert_eq!(zed.details_for("email"), ["zed@mail".to_string()]);
    Ok(())
}

#[test]
fn test_restore_is_idempotent_and_merges_with_server() -> Result<()> {
    let dir = TempDir::new()?;
    let xmpp = MockProvider::new("xmpp");
    let work = xmpp.seed_group(&xmpp.root(), "w1", "Work");
    xmpp.seed_contact(&work.id, "eve@x");

    {
        let service = MetaContactListService::with_persistence(fast_config(), open_storage(&dir)?);
        service.add_provider(xmpp.clone())?;
    }

    // Same server list on the next start: restored entries are reused, not duplicated.
    let storage = open_storage(&dir)?;
    let service = MetaContactListService::with_persistence(fast_config(), storage.clone());
    service.add_provider(xmpp.clone())?;

    assert_eq!(service.subgroups(ROOT_GROUP_UID).len(), 1);
    assert_eq!(service.find_all_meta_contacts_for_address("eve@x").len(), 1);
    let eve = service
        .find_meta_contact_by_contact(&ContactKey::new("xmpp", "eve@x"))
        .expect("eve");
    assert!(eve.contacts()[0].resolved, "server snapshot replaces the stored one");

    // Restoring the same account twice changes nothing.
    storage.restore_account(&service, "xmpp")?;
    assert_eq!(service.find_all_meta_contacts_for_address("eve@x").len(), 1);
    Ok(())
}

#[test]
fn test_unload_keeps_records_uninstall_deletes_them() -> Result<()> {
    let dir = TempDir::new()?;
    let xmpp = MockProvider::new("xmpp");
    let work = xmpp.seed_group(&xmpp.root(), "w1", "Work");
    xmpp.seed_contact(&work.id, "eve@x");
    xmpp.seed_contact(&xmpp.root(), "zed@x");

    let storage = open_storage(&dir)?;
    let service = MetaContactListService::with_persistence(fast_config(), storage.clone());
    service.add_provider(xmpp.clone())?;

    service.remove_provider("xmpp", ProviderRemoval::Unloaded);
    assert_eq!(storage.contact_records(None)?.len(), 2);
    assert_eq!(storage.group_records(None)?.len(), 1);

    service.add_provider(xmpp.clone())?;
    assert_eq!(service.find_all_meta_contacts_for_provider("xmpp", None).len(), 2);

    service.remove_provider("xmpp", ProviderRemoval::Uninstalled);
    assert!(storage.contact_records(None)?.is_empty());
    assert!(storage.group_records(None)?.is_empty());
    Ok(())
}

#[test]
fn test_purge_empties_storage_but_not_tree() -> Result<()> {
    let dir = TempDir::new()?;
    let xmpp = MockProvider::new("xmpp");
    xmpp.seed_contact(&xmpp.root(), "zed@x");

    let adapter = Arc::new(FileStorageAdapter::new(dir.path().join("contacts"))?);
    let storage = Arc::new(MclStorage::new(adapter.clone()));
    let service = MetaContactListService::with_persistence(fast_config(), storage);
    service.add_provider(xmpp)?;
    assert_eq!(adapter.list("")?.len(), 1);

    service.purge_locally_stored_contact_list_copy()?;
    assert!(adapter.list("")?.is_empty());
    assert_eq!(service.child_contacts(ROOT_GROUP_UID).len(), 1);
    Ok(())
}

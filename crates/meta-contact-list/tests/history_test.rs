mod common;

use std::sync::Arc;

use common::{fast_config, MockProvider};
use meta_contact_list::{
    ContactKey, InMemoryStorage, MessageDirection, MessageHistory, MessageRecord,
    MetaContactListService, RecentMessages, Result, ROOT_GROUP_UID,
};

struct Chat {
    service: Arc<MetaContactListService>,
    history: MessageHistory,
    recent: Arc<RecentMessages>,
}

impl Chat {
    fn new(provider: &Arc<MockProvider>) -> Result<Self> {
        let storage = Arc::new(InMemoryStorage::new());
        let service = MetaContactListService::new(fast_config());
        let recent = Arc::new(RecentMessages::load(
            storage.clone(),
            service.config().recent_messages_limit,
        )?);
        service.add_listener(recent.clone());
        service.add_provider(provider.clone())?;
        Ok(Self {
            service,
            history: MessageHistory::new(storage),
            recent,
        })
    }

    fn receive(&self, account: &str, address: &str, text: &str, at: u64) -> Result<()> {
        let record = MessageRecord::at(
            &ContactKey::new(account, address),
            MessageDirection::Incoming,
            text,
            at,
        );
        self.history.record_message(&record)?;
        self.recent.on_message(&self.service, &record)
    }
}

#[test]
fn test_recent_messages_follow_the_contact_list() -> Result<()> {
    let xmpp = MockProvider::new("xmpp");
    let chat = Chat::new(&xmpp)?;
    let ann = chat.service.create_meta_contact("xmpp", ROOT_GROUP_UID, "ann@x")?;
    chat.service.create_meta_contact("xmpp", ROOT_GROUP_UID, "ben@x")?;

    chat.receive("xmpp", "ann@x", "hello", 10)?;
    chat.receive("xmpp", "ben@x", "hey", 20)?;
    chat.receive("xmpp", "stranger@x", "buy now", 30)?;

    let recent = chat.recent.recent(10, None, None);
    let names: Vec<&str> = recent.iter().map(|r| r.display_name.as_str()).collect();
    assert_eq!(names, vec!["ben@x", "ann@x"]);
    assert_eq!(recent[1].meta_uid.as_deref(), Some(ann.as_str()));

    chat.service.rename_meta_contact(&ann, "Ann")?;
    let only_ann = chat.recent.recent(10, Some("xmpp"), Some("ann@x"));
    assert_eq!(only_ann.len(), 1);
    assert_eq!(only_ann[0].display_name, "Ann");

    chat.service.remove_meta_contact(&ann)?;
    let left: Vec<String> = chat
        .recent
        .recent(10, None, None)
        .into_iter()
        .map(|r| r.address)
        .collect();
    assert_eq!(left, vec!["ben@x".to_string()]);
    Ok(())
}

#[test]
fn test_history_merges_meta_contact_members() -> Result<()> {
    let xmpp = MockProvider::new("xmpp");
    let sip = MockProvider::new("sip");
    let chat = Chat::new(&xmpp)?;
    chat.service.add_provider(sip.clone())?;
    let cat = chat.service.create_meta_contact("xmpp", ROOT_GROUP_UID, "cat@x")?;
    chat.service.add_new_contact_to_meta_contact("sip", &cat, "cat@sip")?;

    chat.receive("xmpp", "cat@x", "on xmpp", 10)?;
    chat.receive("sip", "cat@sip", "on sip", 20)?;
    chat.receive("xmpp", "dog@x", "not listed", 30)?;

    let cat_mc = chat.service.meta_contact(&cat).expect("cat exists");
    let texts: Vec<String> = chat
        .history
        .find_last(&cat_mc, 10)?
        .into_iter()
        .map(|r| r.text)
        .collect();
    assert_eq!(texts, vec!["on xmpp".to_string(), "on sip".to_string()]);

    let recent = chat
        .history
        .find_recent_messages_per_contact(&chat.service, 10, None, None)?;
    let addresses: Vec<&str> = recent.iter().map(|r| r.address.as_str()).collect();
    assert_eq!(addresses, vec!["cat@sip", "cat@x"]);
    let sip_only = chat
        .history
        .find_recent_messages_per_contact(&chat.service, 10, Some("sip"), None)?;
    assert_eq!(sip_only.len(), 1);

    assert_eq!(chat.history.erase_for_meta_contact(&cat_mc, None)?, 2);
    assert!(chat.history.find_last(&cat_mc, 10)?.is_empty());
    assert_eq!(chat.history.erase_all()?, 1);
    Ok(())
}

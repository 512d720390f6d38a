use std::fmt::Write;

use anyhow::{Context, Result};
use meta_contact_list::{MessageDirection, MessageRecord};

use crate::contact_list::ContactList;
use crate::output::Output;

fn render(records: &[MessageRecord]) -> String {
    let mut out = String::new();
    for record in records {
        let arrow = match record.direction {
            MessageDirection::Incoming => "<-",
            MessageDirection::Outgoing => "->",
        };
        let _ = writeln!(
            out,
            "{} {} {}:{} {}",
            record.timestamp_ms, arrow, record.account, record.address, record.text
        );
    }
    out
}

pub fn show(uid: &str, count: usize, list: &ContactList, output: &Output) -> Result<()> {
    let meta_contact = list
        .service
        .meta_contact(uid)
        .with_context(|| format!("Meta contact '{}' not found", uid))?;
    let records = list
        .history
        .find_last(&meta_contact, count)
        .context("Failed to read message history")?;
    output.success_text("history_show", &render(&records), records);
    Ok(())
}

pub fn erase(uid: Option<&str>, list: &ContactList, output: &Output) -> Result<()> {
    let removed = match uid {
        Some(uid) => {
            let meta_contact = list
                .service
                .meta_contact(uid)
                .with_context(|| format!("Meta contact '{}' not found", uid))?;
            list.history.erase_for_meta_contact(&meta_contact, None)
        }
        None => list.history.erase_all(),
    }
    .context("Failed to erase message history")?;
    output.success("history_erase", serde_json::json!({ "removed": removed }));
    Ok(())
}

pub fn recent(count: usize, list: &ContactList, output: &Output) -> Result<()> {
    let entries = list.recent.recent(count, None, None);
    let mut text = String::new();
    for entry in &entries {
        let _ = writeln!(text, "{} {}: {}", entry.timestamp_ms, entry.display_name, entry.text);
    }
    output.success_text("recent", &text, entries);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact_list::seed_contact;
    use meta_contact_list::ContactKey;
    use tempfile::TempDir;

    #[test]
    fn test_recent_names_restored_contacts() {
        let temp = TempDir::new().unwrap();
        seed_contact(temp.path(), "m1", "alice@x");
        let list = ContactList::open(temp.path()).unwrap();
        let record = MessageRecord::at(
            &ContactKey::new("xmpp", "alice@x"),
            MessageDirection::Incoming,
            "hi",
            42,
        );
        list.history.record_message(&record).unwrap();
        list.recent.on_message(&list.service, &record).unwrap();
        drop(list);

        let reopened = ContactList::open(temp.path()).unwrap();
        let entries = reopened.recent.recent(5, None, None);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].meta_uid.as_deref(), Some("m1"));
        let alice = reopened.service.meta_contact("m1").unwrap();
        assert_eq!(reopened.history.find_last(&alice, 5).unwrap()[0].text, "hi");

        erase(Some("m1"), &reopened, &Output::new(true)).unwrap();
        assert!(reopened.history.find_last(&alice, 5).unwrap().is_empty());
    }

    #[test]
    fn test_history_of_unknown_contact_fails() {
        let temp = TempDir::new().unwrap();
        let list = ContactList::open(temp.path()).unwrap();
        assert!(show("missing", 10, &list, &Output::new(true)).is_err());
    }
}

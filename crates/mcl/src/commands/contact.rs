use anyhow::{Context, Result};

use crate::contact_list::ContactList;
use crate::output::Output;

pub fn rename(uid: &str, name: &str, list: &ContactList, output: &Output) -> Result<()> {
    list.service
        .rename_meta_contact(uid, name)
        .with_context(|| format!("Failed to rename contact '{}'", uid))?;
    output.success(
        "contact_rename",
        serde_json::json!({ "uid": uid, "name": name }),
    );
    Ok(())
}

pub fn clear_name(uid: &str, list: &ContactList, output: &Output) -> Result<()> {
    list.service
        .clear_user_defined_display_name(uid)
        .with_context(|| format!("Failed to clear name of contact '{}'", uid))?;
    let name = list
        .service
        .meta_contact(uid)
        .map(|mc| mc.display_name().to_string())
        .unwrap_or_default();
    output.success(
        "contact_clear_name",
        serde_json::json!({ "uid": uid, "name": name }),
    );
    Ok(())
}

pub fn add_detail(uid: &str, name: &str, value: &str, list: &ContactList, output: &Output) -> Result<()> {
    list.service
        .add_detail(uid, name, value)
        .with_context(|| format!("Failed to add detail to contact '{}'", uid))?;
    output.success(
        "contact_detail_add",
        serde_json::json!({ "uid": uid, "name": name, "value": value }),
    );
    Ok(())
}

/// Without `value` every value of the detail goes.
pub fn remove_detail(
    uid: &str,
    name: &str,
    value: Option<&str>,
    list: &ContactList,
    output: &Output,
) -> Result<()> {
    let removed = match value {
        Some(value) => list.service.remove_detail(uid, name, value),
        None => list.service.remove_details(uid, name),
    }
    .with_context(|| format!("Failed to remove detail from contact '{}'", uid))?;
    if !removed {
        anyhow::bail!("Detail '{}' not found on contact '{}'", name, uid);
    }
    output.success_message(
        "contact_detail_remove",
        &format!("Removed detail '{}' from '{}'", name, uid),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact_list::seed_contact;
    use tempfile::TempDir;

    #[test]
    fn test_rename_is_persisted() {
        let temp = TempDir::new().unwrap();
        seed_contact(temp.path(), "m1", "alice@x");
        let output = Output::new(true);

        let list = ContactList::open(temp.path()).unwrap();
        rename("m1", "Alice", &list, &output).unwrap();

        let reopened = ContactList::open(temp.path()).unwrap();
        let alice = reopened.service.meta_contact("m1").unwrap();
        assert_eq!(alice.display_name(), "Alice");
        assert!(alice.is_display_name_user_defined());

        clear_name("m1", &reopened, &output).unwrap();
        let reopened = ContactList::open(temp.path()).unwrap();
        let alice = reopened.service.meta_contact("m1").unwrap();
        assert_eq!(alice.display_name(), "alice@x");
        assert!(!alice.is_display_name_user_defined());
    }

    #[test]
    fn test_details_are_persisted() {
        let temp = TempDir::new().unwrap();
        seed_contact(temp.path(), "m1", "alice@x");
        let output = Output::new(true);

        let list = ContactList::open(temp.path()).unwrap();
        add_detail("m1", "phone", "111", &list, &output).unwrap();
        add_detail("m1", "phone", "222", &list, &output).unwrap();
        remove_detail("m1", "phone", Some("111"), &list, &output).unwrap();
        assert!(remove_detail("m1", "phone", Some("111"), &list, &output).is_err());

        let reopened = ContactList::open(temp.path()).unwrap();
        let alice = reopened.service.meta_contact("m1").unwrap();
        assert_eq!(alice.details_for("phone"), ["222".to_string()]);

        remove_detail("m1", "phone", None, &reopened, &output).unwrap();
        let reopened = ContactList::open(temp.path()).unwrap();
        assert!(reopened.service.meta_contact("m1").unwrap().details().is_empty());
    }

    #[test]
    fn test_unknown_contact_fails() {
        let temp = TempDir::new().unwrap();
        let list = ContactList::open(temp.path()).unwrap();
        assert!(rename("nope", "X", &list, &Output::new(true)).is_err());
    }
}

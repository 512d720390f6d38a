use anyhow::{Context, Result};

use crate::contact_list::ContactList;
use crate::output::Output;

pub fn rename(uid: &str, name: &str, list: &ContactList, output: &Output) -> Result<()> {
    let old = list
        .service
        .group(uid)
        .with_context(|| format!("Group '{}' not found", uid))?
        .name()
        .to_string();
    list.service
        .rename_meta_contact_group(uid, name)
        .with_context(|| format!("Failed to rename group '{}'", uid))?;
    output.success(
        "group_rename",
        serde_json::json!({ "uid": uid, "old_name": old, "name": name }),
    );
    Ok(())
}

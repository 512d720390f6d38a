use std::collections::BTreeMap;
use std::fmt::Write;

use anyhow::{Context, Result};
use meta_contact_list::{MetaContact, MetaContactListService, ROOT_GROUP_UID};
use serde::Serialize;

use crate::contact_list::ContactList;
use crate::output::Output;

#[derive(Debug, Serialize)]
struct GroupView {
    uid: String,
    name: String,
    server_groups: Vec<String>,
    contacts: Vec<ContactView>,
    groups: Vec<GroupView>,
}

#[derive(Debug, Serialize)]
struct ContactView {
    uid: String,
    name: String,
    user_defined_name: bool,
    members: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    details: BTreeMap<String, Vec<String>>,
}

impl From<&MetaContact> for ContactView {
    fn from(mc: &MetaContact) -> Self {
        Self {
            uid: mc.uid().to_string(),
            name: mc.display_name().to_string(),
            user_defined_name: mc.is_display_name_user_defined(),
            members: mc
                .contacts()
                .iter()
                .map(|c| format!("{}:{}", c.account, c.address))
                .collect(),
            details: mc.details().clone(),
        }
    }
}

fn group_view(service: &MetaContactListService, uid: &str) -> Option<GroupView> {
    let group = service.group(uid)?;
    Some(GroupView {
        uid: group.uid().to_string(),
        name: group.name().to_string(),
        server_groups: group
            .contact_groups()
            .iter()
            .map(|g| g.id.to_string())
            .collect(),
        contacts: service
            .child_contacts(uid)
            .iter()
            .map(ContactView::from)
            .collect(),
        groups: service
            .subgroups(uid)
            .iter()
            .filter_map(|g| group_view(service, g.uid()))
            .collect(),
    })
}

fn render(view: &GroupView, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    let _ = writeln!(out, "{}[{}] ({})", indent, view.name, view.uid);
    for contact in &view.contacts {
        let marker = if contact.user_defined_name { "*" } else { "" };
        let _ = writeln!(
            out,
            "{}  {}{} ({}) {}",
            indent,
            contact.name,
            marker,
            contact.uid,
            contact.members.join(", ")
        );
        for (name, values) in &contact.details {
            let _ = writeln!(out, "{}      {}: {}", indent, name, values.join(", "));
        }
    }
    for group in &view.groups {
        render(group, depth + 1, out);
    }
}

pub fn show(group: Option<&str>, list: &ContactList, output: &Output) -> Result<()> {
    let uid = group.unwrap_or(ROOT_GROUP_UID);
    let view = group_view(&list.service, uid).with_context(|| format!("Group '{}' not found", uid))?;
    let mut text = String::new();
    render(&view, 0, &mut text);
    output.success_text("show", &text, view);
    Ok(())
}

pub fn accounts(list: &ContactList, output: &Output) -> Result<()> {
    let accounts: Vec<_> = list
        .service
        .accounts()
        .into_iter()
        .map(|account| {
            let contacts = list
                .service
                .find_all_meta_contacts_for_provider(&account, None)
                .len();
            serde_json::json!({ "account": account, "meta_contacts": contacts })
        })
        .collect();
    output.success("accounts", serde_json::json!({ "accounts": accounts }));
    Ok(())
}

pub fn purge(list: &ContactList, output: &Output) -> Result<()> {
    list.service
        .purge_locally_stored_contact_list_copy()
        .context("Failed to purge stored contact list")?;
    output.success_message("purge", "Stored contact list deleted");
    Ok(())
}

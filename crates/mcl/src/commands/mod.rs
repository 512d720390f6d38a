pub mod contact;
pub mod group;
pub mod history;
pub mod show;

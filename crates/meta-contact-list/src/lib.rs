//! Merges the contact lists of several protocol accounts into one tree of
//! meta contacts and meta groups, kept in sync with each account's server
//! stored list and persisted through a [`StorageAdapter`]. Chat history and
//! the recent messages list are keyed by the same protocol contacts.

pub mod config;
pub mod error;
pub mod events;
pub mod file_storage;
pub mod history;
pub mod ignore_list;
pub mod mcl_storage;
pub mod meta_contact;
pub mod meta_group;
pub mod offline;
pub mod persistence;
pub mod protocol;
pub mod recent;
mod retriever;
pub mod service;
pub mod storage;
mod tree;
pub mod types;

pub use config::MclConfig;
pub use error::{Error, ErrorCode, ProviderErrorCode, Result};
pub use events::{
    GroupEventKind, MetaContactAvatarUpdateEvent, MetaContactEvent, MetaContactEventKind,
    MetaContactGroupEvent, MetaContactListEvent, MetaContactListListener,
    MetaContactModifiedEvent, MetaContactMovedEvent, MetaContactRenamedEvent, ProtoContactEvent,
    ProtoContactEventKind,
};
pub use file_storage::FileStorageAdapter;
pub use history::{MessageDirection, MessageHistory, MessageRecord};
pub use mcl_storage::{MclStorage, StoredContactRecord, StoredGroupRecord};
pub use meta_contact::MetaContact;
pub use meta_group::{MetaContactGroup, UserDataValue};
pub use offline::OfflineProvider;
pub use persistence::ContactListPersistence;
pub use protocol::{ContactProperty, ProtocolEvent, ProtocolEventSink, ProtocolProvider};
pub use recent::{RecentMessage, RecentMessages};
pub use service::{MetaContactListService, ProviderRemoval, StoredContactDescriptor};
pub use storage::{InMemoryStorage, StorageAdapter};
pub use types::*;

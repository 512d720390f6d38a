use serde::{Deserialize, Serialize};
use std::fmt;

/// Uid of the single root group of every contact list.
pub const ROOT_GROUP_UID: &str = "ContactListRoot";
/// Display name of the root group.
pub const ROOT_GROUP_NAME: &str = "Contacts";

/// Opaque, restart-stable identifier of a meta contact or meta contact group.
pub type MetaUid = String;

/// Identifies the account (and therefore the protocol provider) a contact belongs to.
pub type AccountId = String;

pub fn generate_meta_uid() -> MetaUid {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactKey {
    pub account: AccountId,
    pub address: String,
}

impl ContactKey {
    pub fn new(account: impl Into<AccountId>, address: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for ContactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.account)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtoGroupId {
    pub account: AccountId,
    pub uid: String,
}

impl ProtoGroupId {
    pub fn new(account: impl Into<AccountId>, uid: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            uid: uid.into(),
        }
    }
}

impl fmt::Display for ProtoGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.uid, self.account)
    }
}

/// Presence of a protocol contact on a 0..=100 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PresenceStatus(u8);

impl PresenceStatus {
    pub const OFFLINE: PresenceStatus = PresenceStatus(0);
    pub const ONLINE_THRESHOLD: u8 = 20;
    pub const AVAILABLE_THRESHOLD: u8 = 50;
    pub const EAGER_TO_COMMUNICATE_THRESHOLD: u8 = 80;
    pub const MAX_STATUS_VALUE: u8 = 100;

    pub const ONLINE: PresenceStatus = PresenceStatus(Self::ONLINE_THRESHOLD);
    pub const AVAILABLE: PresenceStatus = PresenceStatus(Self::AVAILABLE_THRESHOLD);

    pub fn new(status: u8) -> Self {
        Self(status.min(Self::MAX_STATUS_VALUE))
    }

    pub fn status(&self) -> u8 {
        self.0
    }

    pub fn is_online(&self) -> bool {
        self.0 >= Self::ONLINE_THRESHOLD
    }

    pub fn name(&self) -> &'static str {
        match self.0 {
            s if s >= Self::EAGER_TO_COMMUNICATE_THRESHOLD => "Eager to communicate",
            s if s >= Self::AVAILABLE_THRESHOLD => "Available",
            s if s >= Self::ONLINE_THRESHOLD => "Away",
            _ => "Offline",
        }
    }
}

/// Features a protocol contact may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    BasicInstantMessaging,
    TypingNotifications,
    ChatStateNotifications,
    BasicTelephony,
    VideoTelephony,
    FileTransfer,
    MultiUserChat,
    ServerStoredInfo,
    PersistentPresence,
}

impl Capability {
    pub const ALL: [Capability; 9] = [
        Capability::BasicInstantMessaging,
        Capability::TypingNotifications,
        Capability::ChatStateNotifications,
        Capability::BasicTelephony,
        Capability::VideoTelephony,
        Capability::FileTransfer,
        Capability::MultiUserChat,
        Capability::ServerStoredInfo,
        Capability::PersistentPresence,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// Small bitset of [`Capability`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CapabilitySet(u16);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Capability::ALL.into_iter().collect()
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.insert(capability);
        self
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0 |= capability.bit();
    }

    pub fn remove(&mut self, capability: Capability) {
        self.0 &= !capability.bit();
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = CapabilitySet::empty();
        for capability in iter {
            set.insert(capability);
        }
        set
    }
}

/// Snapshot of a contact as known by one protocol provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtoContact {
    pub account: AccountId,
    pub address: String,
    pub display_name: String,
    pub parent: ProtoGroupId,
    #[serde(default)]
    pub presence: PresenceStatus,
    #[serde(default = "default_true")]
    pub persistent: bool,
    #[serde(default = "default_true")]
    pub resolved: bool,
    #[serde(default)]
    pub persistent_data: Option<String>,
}

impl ProtoContact {
    pub fn new(parent: ProtoGroupId, address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            account: parent.account.clone(),
            display_name: address.clone(),
            address,
            parent,
            presence: PresenceStatus::OFFLINE,
            persistent: true,
            resolved: true,
            persistent_data: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_presence(mut self, presence: PresenceStatus) -> Self {
        self.presence = presence;
        self
    }

    pub fn key(&self) -> ContactKey {
        ContactKey::new(self.account.clone(), self.address.clone())
    }

    pub fn is_online(&self) -> bool {
        self.presence.is_online()
    }
}

/// Snapshot of a server stored group as known by one protocol provider.
///
/// `parent` is `None` only for the provider's own contact list root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtoGroup {
    pub id: ProtoGroupId,
    pub name: String,
    pub parent: Option<ProtoGroupId>,
    #[serde(default = "default_true")]
    pub persistent: bool,
    #[serde(default = "default_true")]
    pub resolved: bool,
    #[serde(default)]
    pub persistent_data: Option<String>,
}

impl ProtoGroup {
    pub fn root(account: impl Into<AccountId>) -> Self {
        Self {
            id: ProtoGroupId::new(account, ROOT_GROUP_UID),
            name: ROOT_GROUP_NAME.to_string(),
            parent: None,
            persistent: true,
            resolved: true,
            persistent_data: None,
        }
    }

    pub fn new(parent: &ProtoGroupId, uid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ProtoGroupId::new(parent.account.clone(), uid),
            name: name.into(),
            parent: Some(parent.clone()),
            persistent: true,
            resolved: true,
            persistent_data: None,
        }
    }

    pub fn account(&self) -> &str {
        &self.id.account
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

fn default_true() -> bool {
    true
}

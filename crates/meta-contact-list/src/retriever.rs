use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::trace;

use crate::protocol::ProtocolEvent;
use crate::types::{AccountId, ProtoContact, ProtoGroup, ProtoGroupId};

/// What a pending caller operation is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Awaited {
    Subscription { account: AccountId, address: String },
    GroupCreation { account: AccountId, name: String },
}

/// Confirmation delivered to a waiting caller.
#[derive(Debug, Clone)]
pub(crate) enum Confirmation {
    Subscribed(ProtoContact),
    SubscriptionFailed(String),
    GroupCreated(ProtoGroup),
}

struct Waiter {
    id: u64,
    awaited: Awaited,
    tx: Sender<Confirmation>,
}

/// Registry of callers blocked on an asynchronous protocol confirmation.
///
/// Every incoming protocol event is offered here before normal handling.
pub(crate) struct EventRetrievers {
    waiters: Mutex<Vec<Waiter>>,
    next_id: AtomicU64,
}

/// One pending wait. Dropping it unregisters the waiter, so a confirmation
/// arriving after the caller gave up is not delivered anywhere.
pub(crate) struct PendingConfirmation<'a> {
    registry: &'a EventRetrievers,
    id: u64,
    rx: Receiver<Confirmation>,
}

impl EventRetrievers {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, awaited: Awaited) -> PendingConfirmation<'_> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.waiters.lock().unwrap().push(Waiter { id, awaited, tx });
        PendingConfirmation {
            registry: self,
            id,
            rx,
        }
    }

    /// Hands `event` to every waiter it confirms.
    ///
    /// `contact_in_group` looks up an address inside a freshly created server
    /// group, for subscriptions that implicitly created their group.
    pub fn offer(
        &self,
        event: &ProtocolEvent,
        contact_in_group: &dyn Fn(&ProtoGroupId, &str) -> Option<ProtoContact>,
    ) {
        let waiters = self.waiters.lock().unwrap();
        if waiters.is_empty() {
            return;
        }
        for waiter in waiters.iter() {
            if let Some(confirmation) = Self::confirms(&waiter.awaited, event, contact_in_group) {
                trace!(waiter = waiter.id, "confirmation delivered to waiting operation");
                // A full channel means this waiter was already confirmed.
                let _ = waiter.tx.try_send(confirmation);
            }
        }
    }

    fn confirms(
        awaited: &Awaited,
        event: &ProtocolEvent,
        contact_in_group: &dyn Fn(&ProtoGroupId, &str) -> Option<ProtoContact>,
    ) -> Option<Confirmation> {
        match (awaited, event) {
            (
                Awaited::Subscription { account, address },
                ProtocolEvent::SubscriptionCreated { contact },
            ) if &contact.account == account && &contact.address == address => {
                Some(Confirmation::Subscribed(contact.clone()))
            }
            (
                Awaited::Subscription { account, address },
                ProtocolEvent::SubscriptionFailed {
                    account: failed_account,
                    address: failed_address,
                    reason,
                    ..
                },
            ) if failed_account == account && failed_address == address => {
                Some(Confirmation::SubscriptionFailed(reason.clone()))
            }
            (Awaited::Subscription { account, address }, ProtocolEvent::GroupCreated { group })
                if group.account() == account =>
            {
                contact_in_group(&group.id, address).map(Confirmation::Subscribed)
            }
            (Awaited::GroupCreation { account, name }, ProtocolEvent::GroupCreated { group })
                if group.account() == account && &group.name == name =>
            {
                Some(Confirmation::GroupCreated(group.clone()))
            }
            _ => None,
        }
    }

    fn unregister(&self, id: u64) {
        self.waiters.lock().unwrap().retain(|w| w.id != id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

impl PendingConfirmation<'_> {
    /// Blocks until the confirmation arrives or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<Confirmation> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Drop for PendingConfirmation<'_> {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorCode;

    fn no_lookup(_: &ProtoGroupId, _: &str) -> Option<ProtoContact> {
        None
    }

    #[test]
    fn subscription_waiter_receives_matching_event() {
        let retrievers = EventRetrievers::new();
        let pending = retrievers.register(Awaited::Subscription {
            account: "acc".into(),
            address: "alice@x".into(),
        });

        let root = ProtoGroup::root("acc");
        let other = ProtocolEvent::SubscriptionCreated {
            contact: ProtoContact::new(root.id.clone(), "bob@x"),
        };
        retrievers.offer(&other, &no_lookup);
        assert!(pending.wait(Duration::from_millis(10)).is_none());

        let event = ProtocolEvent::SubscriptionCreated {
            contact: ProtoContact::new(root.id, "alice@x"),
        };
        retrievers.offer(&event, &no_lookup);
        match pending.wait(Duration::from_millis(10)) {
            Some(Confirmation::Subscribed(contact)) => assert_eq!(contact.address, "alice@x"),
            other => panic!("unexpected confirmation: {:?}", other),
        }
    }

    #[test]
    fn failure_event_is_a_confirmation() {
        let retrievers = EventRetrievers::new();
        let pending = retrievers.register(Awaited::Subscription {
            account: "acc".into(),
            address: "alice@x".into(),
        });
        retrievers.offer(
            &ProtocolEvent::SubscriptionFailed {
                account: "acc".into(),
                address: "alice@x".into(),
                code: ProviderErrorCode::General,
                reason: "rejected".into(),
            },
            &no_lookup,
        );
        assert!(matches!(
            pending.wait(Duration::from_millis(10)),
            Some(Confirmation::SubscriptionFailed(reason)) if reason == "rejected"
        ));
    }

    #[test]
    fn implicit_group_creation_confirms_subscription() {
        let retrievers = EventRetrievers::new();
        let pending = retrievers.register(Awaited::Subscription {
            account: "acc".into(),
            address: "alice@x".into(),
        });
        let group = ProtoGroup::new(&ProtoGroup::root("acc").id, "g", "Friends");
        let lookup = |id: &ProtoGroupId, address: &str| {
            Some(ProtoContact::new(id.clone(), address))
        };
        retrievers.offer(&ProtocolEvent::GroupCreated { group }, &lookup);
        match pending.wait(Duration::from_millis(10)) {
            Some(Confirmation::Subscribed(contact)) => assert_eq!(contact.parent.uid, "g"),
            other => panic!("unexpected confirmation: {:?}", other),
        }
    }

    #[test]
    fn dropping_pending_unregisters() {
        let retrievers = EventRetrievers::new();
        {
            let _pending = retrievers.register(Awaited::GroupCreation {
                account: "acc".into(),
                name: "Friends".into(),
            });
            assert_eq!(retrievers.len(), 1);
        }
        assert_eq!(retrievers.len(), 0);
    }
}

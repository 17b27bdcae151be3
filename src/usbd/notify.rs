//! Dynamic attach/removal notification.

use super::client::ClientMsg;
use super::node::collect_tree;
use super::{Registry, Shared, Usbd};
use crate::error::{Result, UsbdError};
use crate::handle::{ClientHandle, NodeId};
use crate::model::ClassTuple;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Class/subclass/protocol filter. `None` matches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClassPattern {
    pub class: Option<u8>,
    pub subclass: Option<u8>,
    pub protocol: Option<u8>,
}

impl ClassPattern {
    pub const ANY: Self = Self {
        class: None,
        subclass: None,
        protocol: None,
    };

    pub fn class(class: u8) -> Self {
        Self {
            class: Some(class),
            ..Self::ANY
        }
    }

    pub fn with_subclass(mut self, subclass: u8) -> Self {
        self.subclass = Some(subclass);
        self
    }

    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn matches(&self, tuple: &ClassTuple) -> bool {
        self.class.is_none_or(|c| c == tuple.class)
            && self.subclass.is_none_or(|s| s == tuple.subclass)
            && self.protocol.is_none_or(|p| p == tuple.protocol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachKind {
    Attach,
    Remove,
}

/// One matching (configuration, interface) of a node that came or went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyEvent {
    pub node: NodeId,
    pub kind: AttachKind,
    pub configuration: u8,
    pub interface: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

pub type NotifyCallback = Arc<dyn Fn(&NotifyEvent) + Send + Sync>;

/// Names one notification registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifyId(u64);

impl fmt::Display for NotifyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notify#{}", self.0)
    }
}

pub(crate) struct Subscription {
    pub id: NotifyId,
    pub pattern: ClassPattern,
    pub callback: NotifyCallback,
}

fn event(node: NodeId, kind: AttachKind, tuple: &ClassTuple) -> NotifyEvent {
    NotifyEvent {
        node,
        kind,
        configuration: tuple.configuration,
        interface: tuple.interface,
        class: tuple.class,
        subclass: tuple.subclass,
        protocol: tuple.protocol,
    }
}

/// Tell every matching registration that `node` came or went.
pub(crate) fn node_event(shared: &Shared, reg: &Registry, node: NodeId, kind: AttachKind) {
    let Ok(n) = reg.node(node) else {
        return;
    };
    for &handle in &reg.clients {
        let Ok(client) = reg.client(handle) else {
            continue;
        };
        for sub in &client.subscriptions {
            for tuple in n.classes.iter().filter(|t| sub.pattern.matches(t)) {
                client.post(
                    ClientMsg::Notify {
                        callback: sub.callback.clone(),
                        event: event(node, kind, tuple),
                    },
                    shared.post_timeout(),
                );
            }
        }
    }
}

impl Usbd {
    /// Register for attach and removal of nodes exposing a matching class.
    ///
    /// Nodes already present are reported as attaches right away.
    pub fn register_notification(
        &self,
        client: ClientHandle,
        pattern: ClassPattern,
        callback: NotifyCallback,
    ) -> Result<NotifyId> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            let id = NotifyId(reg.next_notify);
            reg.next_notify += 1;

            let present: Vec<NodeId> = reg
                .bus_keys()
                .into_iter()
                .filter_map(|key| reg.bus(key).ok()?.root)
                .flat_map(|root| collect_tree(reg, root))
                .collect();

            let c = reg.client(client)?;
            for node in present {
                let Ok(n) = reg.node(node) else {
                    continue;
                };
                if !n.announced {
                    continue;
                }
                for tuple in n.classes.iter().filter(|t| pattern.matches(t)) {
                    c.post(
                        ClientMsg::Notify {
                            callback: callback.clone(),
                            event: event(node, AttachKind::Attach, tuple),
                        },
                        self.shared.post_timeout(),
                    );
                }
            }

            reg.client_mut(client)?.subscriptions.push(Subscription {
                id,
                pattern,
                callback,
            });
            debug!(%client, %id, ?pattern, "notification registered");
            Ok(id)
        })
    }

    pub fn unregister_notification(&self, client: ClientHandle, id: NotifyId) -> Result<()> {
        self.shared.locked(|reg, _| {
            let subs = &mut reg.client_mut(client)?.subscriptions;
            let before = subs.len();
            subs.retain(|s| s.id != id);
            if subs.len() == before {
                return Err(UsbdError::BadParam("no such notification"));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(class: u8, subclass: u8, protocol: u8) -> ClassTuple {
        ClassTuple {
            configuration: 1,
            interface: 0,
            class,
            subclass,
            protocol,
        }
    }

    #[test]
    fn test_pattern_wildcards() {
        let hid = tuple(3, 1, 1);
        assert!(ClassPattern::ANY.matches(&hid));
        assert!(ClassPattern::class(3).matches(&hid));
        assert!(!ClassPattern::class(8).matches(&hid));
        assert!(ClassPattern::class(3).with_protocol(1).matches(&hid));
        assert!(!ClassPattern::class(3).with_subclass(0).matches(&hid));
    }

    #[test]
    fn test_event_carries_tuple() {
        let mut reg = crate::handle::HandleRegistry::with_capacity(1);
        let node = NodeId(reg.allocate(0, ()).unwrap());
        let e = event(node, AttachKind::Remove, &tuple(8, 6, 0x50));
        assert_eq!(e.kind, AttachKind::Remove);
        assert_eq!((e.class, e.subclass, e.protocol), (8, 6, 0x50));
    }
}

//! The per-request collection of request-on-connection execution slots.

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use super::{on_conn::TaskInput, RequestType};
use crate::{addr::NodeAddr, id_pool::PoolId};

use std::sync::{Arc, Mutex};

/// The reusable per-slot working buffer, aliased by the running handler task and by the
/// controller's working-data visitor.
pub(crate) type WorkingData = Arc<Mutex<Vec<u8>>>;

/// Registry-side state of one request-on-connection.
#[derive(Debug)]
pub(crate) struct RocSlot {
    pub(crate) pool_id: PoolId,
    /// Channel feeding the handler task: payloads, reconnect wakeups, resumes, aborts.
    pub(crate) input: mpsc::UnboundedSender<TaskInput>,
    /// The node the slot's task is currently exchanging messages with, if any.
    pub(crate) bound: Option<NodeAddr>,
    /// Still counted in `num_active`; cleared when the task exits.
    pub(crate) active: bool,
    pub(crate) working: WorkingData,
}

/// Type-tagged container for a request's slots: a plain list for single/round-robin/multi
/// requests, a per-node map for all-nodes requests.
#[derive(Debug, Default)]
pub(crate) enum RequestOnConnSet {
    #[default]
    None,
    List(Vec<RocSlot>),
    ByNode(BTreeMap<u64, RocSlot>),
}

impl RequestOnConnSet {
    pub(crate) fn for_type(request_type: RequestType) -> Self {
        match request_type {
            RequestType::AllNodes => Self::ByNode(BTreeMap::new()),
            _ => Self::List(Vec::new()),
        }
    }

    /// Inserts a slot. All-nodes slots must be bound; they key the map.
    pub(crate) fn insert(&mut self, slot: RocSlot) {
        match self {
            Self::None => unreachable!("slot inserted into a reset request"),
            Self::List(slots) => slots.push(slot),
            Self::ByNode(slots) => {
                let key = slot
                    .bound
                    .expect("all-nodes slot must be bound to a node")
                    .cmp_id();
                slots.insert(key, slot);
            }
        }
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut RocSlot> {
        let (list, map) = match self {
            Self::None => (None, None),
            Self::List(slots) => (Some(slots.iter_mut()), None),
            Self::ByNode(slots) => (None, Some(slots.values_mut())),
        };
        list.into_iter()
            .flatten()
            .chain(map.into_iter().flatten())
    }

    pub(crate) fn find_by_pool_id(&mut self, pool_id: PoolId) -> Option<&mut RocSlot> {
        self.iter_mut().find(|slot| slot.pool_id == pool_id)
    }

    /// The active slot currently bound to `address`, if any.
    pub(crate) fn find_bound(&mut self, address: &NodeAddr) -> Option<&mut RocSlot> {
        match self {
            Self::ByNode(slots) => slots
                .get_mut(&address.cmp_id())
                .filter(|slot| slot.active),
            _ => self
                .iter_mut()
                .find(|slot| slot.active && slot.bound.as_ref() == Some(address)),
        }
    }

    pub(crate) fn has_node(&self, cmp_id: u64) -> bool {
        match self {
            Self::ByNode(slots) => slots.contains_key(&cmp_id),
            _ => false,
        }
    }

    /// Drops every slot and returns the container to the inactive state.
    pub(crate) fn reset(&mut self) -> Vec<RocSlot> {
        let slots = match std::mem::take(self) {
            Self::None => Vec::new(),
            Self::List(slots) => slots,
            Self::ByNode(slots) => slots.into_values().collect(),
        };
        slots
    }
}

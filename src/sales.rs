//! Sale records exchanged with the server and kept in the offline queue.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a medicine or customer. The server uses integer ids, but
/// ids captured from forms may arrive as strings, so both are accepted and
/// echoed back exactly as given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    Text(String),
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(i) => write!(f, "{i}"),
            EntityId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(v: i64) -> Self {
        EntityId::Int(v)
    }
}

impl From<&str> for EntityId {
    fn from(v: &str) -> Self {
        EntityId::Text(v.to_string())
    }
}

/// Wire body of `POST /sales/new` and `POST /sales/sync`.
///
/// `customer_id` is always serialized, as `null` when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalePayload {
    pub medicine_id: EntityId,
    pub quantity: i64,
    #[serde(default)]
    pub customer_id: Option<EntityId>,
}

impl SalePayload {
    pub fn new(medicine_id: impl Into<EntityId>, quantity: i64) -> Self {
        Self {
            medicine_id: medicine_id.into(),
            quantity,
            customer_id: None,
        }
    }

    pub fn with_customer(mut self, customer_id: impl Into<EntityId>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }
}

/// A sale recorded while offline, waiting to be replayed.
///
/// `queued_at` (unix ms) is the entry's identity in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSale {
    #[serde(flatten)]
    pub sale: SalePayload,
    #[serde(rename = "timestamp")]
    pub queued_at: i64,
    #[serde(default)]
    pub synced: bool,
    #[serde(default = "offline_marker")]
    pub offline: bool,
}

fn offline_marker() -> bool {
    true
}

impl PendingSale {
    pub fn new(sale: SalePayload, queued_at: i64) -> Self {
        Self {
            sale,
            queued_at,
            synced: false,
            offline: true,
        }
    }
}

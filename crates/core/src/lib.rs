//! Gantry core types: the generic object/list/event envelope every store returns,
//! caller identities, verbs, GVK keys and the gateway error kinds.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

mod error;
mod gvk;
mod identity;
mod object;

pub use error::{GatewayError, GatewayResult};
pub use gvk::{type_name_for, Gvk};
pub use identity::{Identity, Verb};
pub use object::{split_id, ApiEvent, ApiObject, ApiObjectList, EventKind, ListOptions, WatchSpec};

pub type Uid = [u8; 16];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// A normalized backend change, as consumed by the summary cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub uid: Uid,
    pub kind: DeltaKind,
    /// Raw object with `metadata.managedFields` stripped.
    pub raw: serde_json::Value,
}

pub mod prelude {
    pub use super::{
        ApiEvent, ApiObject, ApiObjectList, Delta, DeltaKind, EventKind, GatewayError, GatewayResult, Gvk,
        Identity, ListOptions, Uid, Verb, WatchSpec,
    };
}

/// Reads a string field at `metadata.<field>` of a raw object.
pub fn meta_str<'a>(raw: &'a serde_json::Value, field: &str) -> Option<&'a str> {
    raw.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str())
}

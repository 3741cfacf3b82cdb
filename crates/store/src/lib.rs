//! Gantry stores.
//!
//! Every schema the gateway serves is backed by one of these [`Store`] variants:
//! [`ProxyStore`] forwards to the control plane as the caller, [`SyntheticStore`] serves
//! locally constructed objects, [`AggregateStore`] answers from the summary cache.
//! [`PreferenceStore`] keeps each caller's UI preferences in memory.

#![forbid(unsafe_code)]

use gantry_core::{GatewayError, GatewayResult};
use gantry_kubehub::{BackendError, DiscoveredResource};
use gantry_schema::ResourceSchema;

mod aggregate;
mod apply;
mod preference;
mod proxy;
mod synthetic;

pub use aggregate::{AggregateStore, Counts, ItemCount, TypeCount, COUNT_TYPE};
pub use apply::{parse_documents, ApplyAction, FIELD_MANAGER};
pub use gantry_schema::Store;
pub use preference::{PreferenceStore, PREFERENCE_TYPE};
pub use proxy::ProxyStore;
pub use synthetic::{ApiGroupSource, LocalClusterSource, SyntheticSource, SyntheticStore, APIGROUP_TYPE, CLUSTER_GROUP, CLUSTER_TYPE, LOCAL_CLUSTER};

/// Map a control-plane failure onto the gateway's error kinds.
pub fn map_backend_error(err: BackendError) -> GatewayError {
    match err {
        BackendError::Status { code, reason, message } => {
            let msg = if message.is_empty() { reason } else { message };
            match code {
                404 => GatewayError::NotFound(msg),
                401 | 403 => GatewayError::Forbidden(msg),
                // 410: the resource version or continue token expired.
                409 | 410 => GatewayError::Conflict(msg),
                405 => GatewayError::MethodNotAllowed(msg),
                429 | 500..=599 => GatewayError::BackendUnavailable(msg),
                _ => GatewayError::Invalid(msg),
            }
        }
        BackendError::Unreachable(msg) | BackendError::Decode(msg) => GatewayError::BackendUnavailable(msg),
    }
}

/// Backend coordinates of a schema; only schemas with a GVK are backend-backed.
pub fn resource_of(schema: &ResourceSchema) -> GatewayResult<DiscoveredResource> {
    let gvk = schema.gvk.as_ref().ok_or_else(|| GatewayError::Invalid(format!("{} is not a backend resource", schema.id)))?;
    Ok(DiscoveredResource {
        group: gvk.group.clone(),
        version: gvk.version.clone(),
        kind: gvk.kind.clone(),
        plural: schema.plural.clone(),
        namespaced: schema.namespaced,
        verbs: schema.allowed_verbs.iter().map(|v| v.as_str().to_string()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_kinds() {
        let kind = |code| map_backend_error(BackendError::status(code, "X", "m")).kind();
        assert_eq!(kind(404), "not_found");
        assert_eq!(kind(401), "forbidden");
        assert_eq!(kind(403), "forbidden");
        assert_eq!(kind(409), "conflict");
        assert_eq!(kind(410), "conflict");
        assert_eq!(kind(405), "method_not_allowed");
        assert_eq!(kind(400), "invalid");
        assert_eq!(kind(422), "invalid");
        assert_eq!(kind(503), "backend_unavailable");
        assert_eq!(map_backend_error(BackendError::Unreachable("dial tcp".into())).kind(), "backend_unavailable");
    }
}

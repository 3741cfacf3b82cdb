use gantry_schema::SchemaView;
use serde::{Deserialize, Serialize};

/// Path variables of a resource URL: `/v1/{type}`, `/v1/{type}/{nameorns}`,
/// `/v1/{type}/{namespace}/{name}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteParams {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nameorns: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// What a route addresses once `nameorns` has been interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub type_name: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl Route {
    /// Object id as stores expect it, when the route names one object.
    pub fn id(&self) -> Option<String> {
        let name = self.name.as_deref()?;
        Some(match self.namespace.as_deref() {
            Some(ns) => format!("{}/{}", ns, name),
            None => name.to_string(),
        })
    }
}

impl RouteParams {
    pub fn new(type_name: impl Into<String>) -> Self { Self { type_name: type_name.into(), ..Default::default() } }

    pub fn with_nameorns(mut self, v: impl Into<String>) -> Self {
        self.nameorns = Some(v.into());
        self
    }

    pub fn with_name(mut self, v: impl Into<String>) -> Self {
        self.name = Some(v.into());
        self
    }

    pub fn with_namespace(mut self, v: impl Into<String>) -> Self {
        self.namespace = Some(v.into());
        self
    }

    /// `nameorns` is a namespace for namespaced types and a name otherwise. Types the
    /// view does not know are treated as cluster-scoped.
    pub fn resolve(&self, view: &SchemaView) -> Route {
        let nonempty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        let mut namespace = nonempty(&self.namespace);
        let mut name = nonempty(&self.name);
        if let Some(v) = nonempty(&self.nameorns) {
            let namespaced = view.lookup(&self.type_name).map_or(false, |s| s.namespaced);
            if namespaced {
                namespace = Some(v);
            } else {
                name = Some(v);
            }
        }
        Route { type_name: self.type_name.clone(), namespace, name }
    }
}

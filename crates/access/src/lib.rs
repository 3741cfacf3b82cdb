//! Gantry access sets.
//!
//! An [`AccessSet`] is the union of every grant an identity receives through its role
//! bindings, expanded to `(group, resource, verb) -> {namespace, name}` entries. It is
//! computed in one piece from one enumeration of bindings and never patched afterwards;
//! changes produce a new set through [`AccessSetLookup`].

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use gantry_core::{Identity, Verb};
use serde::{Deserialize, Serialize};

mod lookup;
mod rbac;

pub use lookup::{AccessSetLookup, DEFAULT_TTL};
pub use rbac::{spawn_rbac_invalidator, subject_matches, KubeBindingSource};

pub const WILDCARD: &str = "*";

/// One RBAC policy rule, reduced to the fields that matter for resource access.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
    /// Empty means every name.
    pub resource_names: Vec<String>,
    pub verbs: Vec<String>,
}

impl PolicyRule {
    pub fn new<S: Into<String>>(
        api_groups: impl IntoIterator<Item = S>,
        resources: impl IntoIterator<Item = S>,
        verbs: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            api_groups: api_groups.into_iter().map(Into::into).collect(),
            resources: resources.into_iter().map(Into::into).collect(),
            resource_names: Vec::new(),
            verbs: verbs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.resource_names = names.into_iter().map(Into::into).collect();
        self
    }
}

/// A rule together with where its binding applies: `None` for cluster-wide
/// (ClusterRoleBinding), `Some(ns)` for a RoleBinding in `ns`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedRule {
    pub namespace: Option<String>,
    pub rule: PolicyRule,
}

impl ScopedRule {
    pub fn cluster(rule: PolicyRule) -> Self { Self { namespace: None, rule } }

    pub fn namespaced(namespace: impl Into<String>, rule: PolicyRule) -> Self { Self { namespace: Some(namespace.into()), rule } }
}

/// Where a grant applies. `*` in either field is a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Access {
    pub namespace: String,
    pub resource_name: String,
}

impl Access {
    fn all() -> Self { Self { namespace: WILDCARD.into(), resource_name: WILDCARD.into() } }

    pub fn is_all(&self) -> bool { self.namespace == WILDCARD && self.resource_name == WILDCARD }

    fn covers_namespace(&self, namespace: Option<&str>) -> bool {
        self.namespace == WILDCARD || namespace == Some(self.namespace.as_str())
    }

    fn covers_name(&self, name: Option<&str>) -> bool { self.resource_name == WILDCARD || name == Some(self.resource_name.as_str()) }
}

/// Slice of a collection the caller may read: one namespace (or all of them) and
/// optionally only some names in it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Partition {
    /// `None` is every namespace.
    pub namespace: Option<String>,
    /// `None` is every name.
    pub names: Option<BTreeSet<String>>,
}

impl Partition {
    pub fn is_passthrough(&self) -> bool { self.names.is_none() }
}

type GrantKey = (String, String, String);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessSet {
    grants: BTreeMap<GrantKey, BTreeSet<Access>>,
    generation: u64,
}

impl AccessSet {
    /// Denies everything.
    pub fn empty() -> Self { Self::default() }

    pub fn from_rules(rules: &[ScopedRule], generation: u64) -> Self {
        let mut set = AccessSet { grants: BTreeMap::new(), generation };
        for scoped in rules {
            let namespace = scoped.namespace.clone().unwrap_or_else(|| WILDCARD.to_string());
            let names: Vec<String> =
                if scoped.rule.resource_names.is_empty() { vec![WILDCARD.to_string()] } else { scoped.rule.resource_names.clone() };
            for group in &scoped.rule.api_groups {
                for resource in &scoped.rule.resources {
                    for verb in &scoped.rule.verbs {
                        let entry = set.grants.entry((group.clone(), resource.clone(), verb.to_lowercase())).or_default();
                        for name in &names {
                            entry.insert(Access { namespace: namespace.clone(), resource_name: name.clone() });
                        }
                    }
                }
            }
        }
        set
    }

    /// Grants everything; used for the gateway's own service identity.
    pub fn all(generation: u64) -> Self {
        Self::from_rules(&[ScopedRule::cluster(PolicyRule::new([WILDCARD], [WILDCARD], [WILDCARD]))], generation)
    }

    pub fn generation(&self) -> u64 { self.generation }

    pub fn is_empty(&self) -> bool { self.grants.is_empty() }

    /// Every access entry granting `verb` on `group/resource`, wildcards included.
    pub fn accesses<'a>(&'a self, verb: Verb, group: &'a str, resource: &'a str) -> impl Iterator<Item = &'a Access> + 'a {
        self.grants
            .iter()
            .filter(move |((g, r, v), _)| {
                (g == group || g == WILDCARD) && (r == resource || r == WILDCARD) && (v == verb.as_str() || v == WILDCARD)
            })
            .flat_map(|(_, accesses)| accesses.iter())
    }

    /// Whether `verb` is granted on the object (or collection when `name` is `None`)
    /// in `namespace` (`None` for all namespaces or a cluster-scoped kind).
    pub fn grants(&self, verb: Verb, group: &str, resource: &str, namespace: Option<&str>, name: Option<&str>) -> bool {
        self.accesses(verb, group, resource).any(|a| a.covers_namespace(namespace) && a.covers_name(name))
    }

    /// Whether any grant at all names this resource.
    pub fn any_verb(&self, group: &str, resource: &str) -> bool { Verb::ALL.iter().any(|v| self.accesses(*v, group, resource).next().is_some()) }

    /// Verbs with at least one grant on the resource, in any namespace.
    pub fn verbs_for(&self, group: &str, resource: &str) -> BTreeSet<Verb> {
        Verb::ALL.iter().copied().filter(|v| self.accesses(*v, group, resource).next().is_some()).collect()
    }

    /// Splits a collection read into the slices the caller may see. An empty result
    /// means nothing is visible.
    pub fn partitions(&self, verb: Verb, group: &str, resource: &str, namespace: Option<&str>) -> Vec<Partition> {
        let requested = namespace.map(str::to_string);
        let mut by_namespace: BTreeMap<&str, Option<BTreeSet<String>>> = BTreeMap::new();
        for access in self.accesses(verb, group, resource) {
            if access.is_all() {
                return vec![Partition { namespace: requested, names: None }];
            }
            if let Some(ns) = namespace {
                if access.namespace != WILDCARD && access.namespace != ns {
                    continue;
                }
            }
            let slot = by_namespace.entry(access.namespace.as_str()).or_insert_with(|| Some(BTreeSet::new()));
            match (slot, access.resource_name.as_str()) {
                (slot, WILDCARD) => *slot = None,
                (Some(names), name) => {
                    names.insert(name.to_string());
                }
                (None, _) => {}
            }
        }
        by_namespace
            .into_iter()
            .map(|(ns, names)| Partition {
                namespace: if ns == WILDCARD { requested.clone() } else { Some(ns.to_string()) },
                names,
            })
            .collect()
    }
}

/// Enumerates the policy rules an identity receives from its role bindings.
#[async_trait::async_trait]
pub trait BindingSource: Send + Sync {
    async fn rules_for(&self, identity: &Identity) -> anyhow::Result<Vec<ScopedRule>>;
}

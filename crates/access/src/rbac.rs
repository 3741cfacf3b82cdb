//! RBAC-backed binding source and push invalidation.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::StreamExt;
use gantry_core::Identity;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding, Subject};
use kube::api::{Api, ListParams};
use kube::runtime::watcher;
use kube::Client;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{AccessSetLookup, BindingSource, PolicyRule, ScopedRule};

/// Lists bindings and roles from the cluster on every computation.
pub struct KubeBindingSource {
    client: Client,
}

impl KubeBindingSource {
    pub fn new(client: Client) -> Self { Self { client } }
}

/// Whether a binding subject refers to this identity.
pub fn subject_matches(subject: &Subject, identity: &Identity) -> bool {
    match subject.kind.as_str() {
        "User" => subject.name == identity.name,
        "Group" => identity.in_group(&subject.name),
        "ServiceAccount" => {
            let ns = subject.namespace.as_deref().unwrap_or_default();
            identity.name == format!("system:serviceaccount:{}:{}", ns, subject.name)
        }
        _ => false,
    }
}

fn convert(rule: &k8s_openapi::api::rbac::v1::PolicyRule) -> PolicyRule {
    PolicyRule {
        api_groups: rule.api_groups.clone().unwrap_or_default(),
        resources: rule.resources.clone().unwrap_or_default(),
        resource_names: rule.resource_names.clone().unwrap_or_default(),
        verbs: rule.verbs.clone(),
    }
}

fn bound(subjects: &Option<Vec<Subject>>, identity: &Identity) -> bool {
    subjects.as_deref().unwrap_or_default().iter().any(|s| subject_matches(s, identity))
}

#[async_trait::async_trait]
impl BindingSource for KubeBindingSource {
    async fn rules_for(&self, identity: &Identity) -> Result<Vec<ScopedRule>> {
        let t0 = Instant::now();
        let lp = ListParams::default();
        let crbs = Api::<ClusterRoleBinding>::all(self.client.clone()).list(&lp).await.context("listing ClusterRoleBindings")?;
        let rbs = Api::<RoleBinding>::all(self.client.clone()).list(&lp).await.context("listing RoleBindings")?;
        let cluster_roles: HashMap<String, Vec<PolicyRule>> = Api::<ClusterRole>::all(self.client.clone())
            .list(&lp)
            .await
            .context("listing ClusterRoles")?
            .into_iter()
            .map(|r| (r.metadata.name.unwrap_or_default(), r.rules.unwrap_or_default().iter().map(convert).collect()))
            .collect();
        let roles: HashMap<(String, String), Vec<PolicyRule>> = Api::<Role>::all(self.client.clone())
            .list(&lp)
            .await
            .context("listing Roles")?
            .into_iter()
            .map(|r| {
                let key = (r.metadata.namespace.unwrap_or_default(), r.metadata.name.unwrap_or_default());
                (key, r.rules.unwrap_or_default().iter().map(convert).collect())
            })
            .collect();

        let mut out = Vec::new();
        for b in crbs.iter().filter(|b| bound(&b.subjects, identity)) {
            if b.role_ref.kind != "ClusterRole" {
                continue;
            }
            for rule in cluster_roles.get(&b.role_ref.name).into_iter().flatten() {
                out.push(ScopedRule::cluster(rule.clone()));
            }
        }
        for b in rbs.iter().filter(|b| bound(&b.subjects, identity)) {
            let ns = b.metadata.namespace.clone().unwrap_or_default();
            let rules = match b.role_ref.kind.as_str() {
                "ClusterRole" => cluster_roles.get(&b.role_ref.name),
                "Role" => roles.get(&(ns.clone(), b.role_ref.name.clone())),
                _ => None,
            };
            for rule in rules.into_iter().flatten() {
                out.push(ScopedRule::namespaced(ns.clone(), rule.clone()));
            }
        }
        info!(identity = %identity, rules = out.len(), took_ms = %t0.elapsed().as_millis(), "access: rbac rules listed");
        Ok(out)
    }
}

/// Watches the four RBAC kinds and drops every cached access set on any change.
/// Stream errors back off exponentially up to `backoff_max`.
pub fn spawn_rbac_invalidator(
    client: Client,
    lookup: Arc<AccessSetLookup>,
    backoff_max: Duration,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(invalidate_on_change(Api::<ClusterRoleBinding>::all(client.clone()), Arc::clone(&lookup), backoff_max, cancel.clone())),
        tokio::spawn(invalidate_on_change(Api::<RoleBinding>::all(client.clone()), Arc::clone(&lookup), backoff_max, cancel.clone())),
        tokio::spawn(invalidate_on_change(Api::<ClusterRole>::all(client.clone()), Arc::clone(&lookup), backoff_max, cancel.clone())),
        tokio::spawn(invalidate_on_change(Api::<Role>::all(client), lookup, backoff_max, cancel)),
    ]
}

async fn invalidate_on_change<K>(api: Api<K>, lookup: Arc<AccessSetLookup>, backoff_max: Duration, cancel: CancellationToken)
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    K::DynamicType: Default,
{
    let kind = K::kind(&Default::default()).to_string();
    let base = Duration::from_millis(500);
    let mut delay = base;
    let mut stream = watcher::watcher(api.clone(), watcher::Config::default()).boxed();
    info!(kind = %kind, "access: rbac invalidator started");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(ev)) => {
                delay = base;
                if let watcher::Event::Restarted(list) = &ev {
                    debug!(kind = %kind, count = list.len(), "access: rbac watch restart");
                }
                lookup.invalidate_all();
            }
            Some(Err(e)) => {
                warn!(kind = %kind, error = %e, backoff_ms = %delay.as_millis(), "access: rbac watch error");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(backoff_max);
            }
            None => {
                warn!(kind = %kind, "access: rbac watch ended; restarting");
                stream = watcher::watcher(api.clone(), watcher::Config::default()).boxed();
            }
        }
    }
    debug!(kind = %kind, "access: rbac invalidator stopped");
}

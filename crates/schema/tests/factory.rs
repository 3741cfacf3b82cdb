#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gantry_access::{AccessSetLookup, BindingSource, PolicyRule, ScopedRule};
use gantry_core::{Identity, Verb};
use gantry_kubehub::mock::resource;
use gantry_schema::{Method, Registry, ResourceSchema, SchemaFactory, Template};

/// Rules per user name; unknown users get nothing.
#[derive(Default)]
struct StaticRules(Mutex<HashMap<String, Vec<ScopedRule>>>);

impl StaticRules {
    fn grant(&self, user: &str, rule: ScopedRule) { self.0.lock().unwrap().entry(user.to_string()).or_default().push(rule); }
}

#[async_trait::async_trait]
impl BindingSource for StaticRules {
    async fn rules_for(&self, identity: &Identity) -> anyhow::Result<Vec<ScopedRule>> {
        Ok(self.0.lock().unwrap().get(&identity.name).cloned().unwrap_or_default())
    }
}

struct Fixture {
    rules: Arc<StaticRules>,
    lookup: Arc<AccessSetLookup>,
    registry: Arc<Registry>,
    factory: SchemaFactory,
}

fn fixture() -> Fixture {
    let rules = Arc::new(StaticRules::default());
    rules.grant("admin", ScopedRule::cluster(PolicyRule::new(["*"], ["*"], ["*"])));
    rules.grant("dev", ScopedRule::namespaced("ns1", PolicyRule::new([""], ["pods"], ["list"])));
    let lookup = Arc::new(AccessSetLookup::new(rules.clone(), Duration::from_secs(60)));
    let registry = Arc::new(Registry::new());
    registry.replace_discovered(vec![
        ResourceSchema::from_discovered(&resource("", "v1", "Pod", "pods", true)),
        ResourceSchema::from_discovered(&resource("", "v1", "Secret", "secrets", true)),
        ResourceSchema::from_discovered(&resource("apps", "v1", "Deployment", "deployments", true)),
    ]);
    let factory = SchemaFactory::new(Arc::clone(&registry), Arc::clone(&lookup));
    Fixture { rules, lookup, registry, factory }
}

#[tokio::test]
async fn types_without_grants_are_never_visible() {
    let f = fixture();
    let view = f.factory.for_identity(&Identity::user("dev")).await.unwrap();
    assert_eq!(view.ids().collect::<Vec<_>>(), vec!["pod"]);
    let pod = view.lookup("pods").unwrap();
    assert!(pod.permits(Verb::List));
    assert!(!pod.permits(Verb::Get));
    let (collection, resource_methods) = pod.effective_methods();
    assert_eq!(collection, BTreeSet::from([Method::Get]));
    assert!(resource_methods.is_empty());
    assert!(view.lookup("secret").is_none());
    assert!(view.lookup("apps.deployment").is_none());
}

#[tokio::test]
async fn identity_without_bindings_gets_an_empty_view() {
    let f = fixture();
    let view = f.factory.for_identity(&Identity::user("nobody")).await.unwrap();
    assert!(view.is_empty());
}

#[tokio::test]
async fn lookup_is_case_insensitive_by_id_or_plural() {
    let f = fixture();
    let view = f.factory.for_identity(&Identity::user("admin")).await.unwrap();
    assert_eq!(view.len(), 3);
    assert_eq!(view.lookup("Apps.Deployment").unwrap().id, "apps.deployment");
    assert_eq!(view.lookup("apps.deployments").unwrap().id, "apps.deployment");
    assert_eq!(view.lookup("POD").unwrap().id, "pod");
}

#[tokio::test]
async fn discovery_refresh_is_visible_without_restart() {
    let f = fixture();
    let admin = Identity::user("admin");
    let before = f.factory.for_identity(&admin).await.unwrap();
    assert!(before.lookup("cert-manager.io.certificate").is_none());

    f.registry.replace_discovered(
        [
            resource("", "v1", "Pod", "pods", true),
            resource("", "v1", "Secret", "secrets", true),
            resource("apps", "v1", "Deployment", "deployments", true),
            resource("cert-manager.io", "v1", "Certificate", "certificates", true),
        ]
        .iter()
        .map(ResourceSchema::from_discovered)
        .collect(),
    );

    let after = f.factory.for_identity(&admin).await.unwrap();
    assert!(after.lookup("cert-manager.io.certificate").is_some());
    assert!(after.revision() > before.revision());
    // The earlier view is untouched.
    assert!(before.lookup("cert-manager.io.certificate").is_none());
}

#[tokio::test]
async fn reregistering_shows_only_the_later_definition() {
    let f = fixture();
    let admin = Identity::user("admin");
    f.registry.register(ResourceSchema::new("widget", "x.io", "widgets", true).with_methods([Method::Get], []));
    let v1 = f.factory.for_identity(&admin).await.unwrap();
    f.registry.register(ResourceSchema::new("widget", "x.io", "widgets", false).with_methods([Method::Get, Method::Post], [Method::Get]));
    let v2 = f.factory.for_identity(&admin).await.unwrap();
    let w = v2.lookup("widget").unwrap();
    assert!(!w.namespaced);
    assert!(w.collection_methods.contains(&Method::Post));
    assert!(w.resource_methods.contains(&Method::Get));
    assert!(v1.lookup("widget").unwrap().namespaced);
}

#[tokio::test]
async fn views_are_cached_until_access_or_registry_changes() {
    let f = fixture();
    let dev = Identity::user("dev");
    let a = f.factory.for_identity(&dev).await.unwrap();
    let b = f.factory.for_identity(&dev).await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    f.rules.grant("dev", ScopedRule::cluster(PolicyRule::new([""], ["secrets"], ["get"])));
    // Still cached: bindings changed but nothing invalidated yet.
    assert!(Arc::ptr_eq(&a, &f.factory.for_identity(&dev).await.unwrap()));

    f.lookup.invalidate(&dev);
    let c = f.factory.for_identity(&dev).await.unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
    assert!(c.lookup("secret").is_some());

    f.registry.register(ResourceSchema::new("widget", "x.io", "widgets", true));
    let d = f.factory.for_identity(&dev).await.unwrap();
    assert!(!Arc::ptr_eq(&c, &d));
}

#[tokio::test]
async fn views_are_cached_per_identity_not_per_flattened_name() {
    let f = fixture();
    let admin = f.factory.for_identity(&Identity::new("admin", ["ops"])).await.unwrap();
    assert!(admin.lookup("secret").is_some());
    let lookalike = f.factory.for_identity(&Identity::user("admin|ops")).await.unwrap();
    assert!(!Arc::ptr_eq(&admin, &lookalike));
    assert!(lookalike.is_empty());
}

#[tokio::test]
async fn static_access_makes_a_schema_visible_to_everyone() {
    let f = fixture();
    f.registry.register(
        ResourceSchema::new("management.gantry.io.cluster", "management.gantry.io", "clusters", false)
            .with_methods([Method::Get], [Method::Get])
            .with_static_access([Verb::Watch]),
    );
    let view = f.factory.for_identity(&Identity::user("nobody")).await.unwrap();
    let cluster = view.lookup("management.gantry.io.clusters").unwrap();
    assert!(cluster.permits(Verb::Watch));
    assert!(!cluster.permits(Verb::List));
}

#[tokio::test]
async fn templates_apply_in_registration_order_to_copies() {
    let f = fixture();
    f.factory.add_template(Template::for_all().with_customize(|s| s.columns.truncate(1)));
    f.factory.add_template(Template::for_id("pod").with_customize(|s| s.columns.push(gantry_schema::Column::new("Node", "spec.nodeName", "string"))));
    let view = f.factory.for_identity(&Identity::user("admin")).await.unwrap();
    let names: Vec<_> = view.lookup("pod").unwrap().columns.iter().map(|c| c.name.clone()).collect();
    assert_eq!(names, vec!["Namespace".to_string(), "Node".to_string()]);
    assert_eq!(view.lookup("secret").unwrap().columns.len(), 1);
    // The shared snapshot keeps its defaults.
    assert_eq!(f.registry.snapshot().get("pod").unwrap().columns.len(), 3);
}

#[tokio::test]
async fn unreachable_bindings_surface_as_authorization_unavailable() {
    struct Down;
    #[async_trait::async_trait]
    impl BindingSource for Down {
        async fn rules_for(&self, _: &Identity) -> anyhow::Result<Vec<ScopedRule>> { anyhow::bail!("apiserver down") }
    }
    let lookup = Arc::new(AccessSetLookup::new(Arc::new(Down), Duration::from_secs(60)));
    let factory = SchemaFactory::new(Arc::new(Registry::new()), lookup);
    let err = factory.for_identity(&Identity::user("dev")).await.unwrap_err();
    assert!(matches!(err, gantry_core::GatewayError::AuthorizationUnavailable(_)));
}

#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;

use common::{configmaps, harness};
use gantry_access::{PolicyRule, ScopedRule};
use gantry_core::{GatewayError, Identity};
use gantry_kubehub::Impersonation;
use gantry_schema::ActionHandler;
use gantry_store::{parse_documents, ApplyAction};
use serde_json::json;

const TWO_CONFIGMAPS: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: one
data:
  k: v
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: two
  namespace: ns2
---
"#;

#[test]
fn empty_documents_are_skipped() {
    let docs = parse_documents(TWO_CONFIGMAPS).unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[1]["metadata"]["namespace"], "ns2");
    assert!(matches!(parse_documents("a: [unclosed"), Err(GatewayError::Invalid(_))));
}

#[tokio::test]
async fn applies_every_document_as_the_caller() {
    let h = harness();
    h.rules.grant("dev", ScopedRule::cluster(PolicyRule::new([""], ["configmaps"], ["get", "patch"])));
    let action = ApplyAction::new(h.backend.clone());
    let req = h.request("dev").await;
    let schema = req.view.lookup("configmap").unwrap().clone();

    let out = action.run(&req, &schema, json!({"yaml": TWO_CONFIGMAPS, "defaultNamespace": "ns1"})).await.unwrap();
    let ids: Vec<_> = out["objects"].as_array().unwrap().iter().map(|o| o["id"].as_str().unwrap().to_string()).collect();
    assert_eq!(ids, vec!["ns1/one", "ns2/two"]);
    assert_eq!(h.backend.object(&configmaps(), Some("ns1"), "one").unwrap()["data"]["k"], "v");
    assert!(h.backend.calls_of("apply").iter().all(|c| c.who == Impersonation::User(Identity::user("dev"))));
}

#[tokio::test]
async fn kinds_outside_the_view_apply_nothing() {
    let h = harness();
    h.rules.grant("dev", ScopedRule::cluster(PolicyRule::new([""], ["configmaps"], ["patch"])));
    let action = ApplyAction::new(h.backend.clone());
    let req = h.request("dev").await;
    let schema = req.view.lookup("configmap").unwrap().clone();

    let yaml = format!("{}\napiVersion: v1\nkind: Pod\nmetadata:\n  name: p\n", TWO_CONFIGMAPS);
    let err = action.run(&req, &schema, json!(yaml)).await.unwrap_err();
    assert!(matches!(err, GatewayError::Forbidden(_)));
    assert!(h.backend.calls_of("apply").is_empty());

    let anonymous = json!("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n");
    assert!(matches!(action.run(&req, &schema, anonymous).await, Err(GatewayError::Invalid(_))));
}

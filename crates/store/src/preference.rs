use std::collections::HashMap;
use std::sync::Mutex;

use gantry_core::{ApiObject, ApiObjectList, GatewayError, GatewayResult};
use gantry_schema::{ApiRequest, ResourceSchema, Store};
use serde_json::{json, Map, Value};
use tracing::debug;

pub const PREFERENCE_TYPE: &str = "userpreference";

/// Per-caller UI preferences kept in memory. Every caller sees exactly one object,
/// their own, whose id is their user name. Values are strings.
#[derive(Default)]
pub struct PreferenceStore {
    prefs: Mutex<HashMap<String, Map<String, Value>>>,
}

impl PreferenceStore {
    pub fn new() -> Self { Self::default() }

    fn object(&self, name: &str) -> ApiObject {
        let data = self.prefs.lock().unwrap_or_else(|e| e.into_inner()).get(name).cloned().unwrap_or_default();
        ApiObject::new(PREFERENCE_TYPE, name, json!({ "metadata": { "name": name }, "data": data }))
    }

    fn own<'a>(req: &'a ApiRequest, id: &str) -> GatewayResult<&'a str> {
        let name = req.identity().name.as_str();
        if id == name {
            Ok(name)
        } else {
            Err(GatewayError::not_found(format!("{} {}", PREFERENCE_TYPE, id)))
        }
    }
}

fn string_values(data: &Value) -> GatewayResult<Map<String, Value>> {
    let Some(map) = data.get("data").and_then(Value::as_object) else {
        return Ok(Map::new());
    };
    if let Some((key, _)) = map.iter().find(|(_, v)| !v.is_string()) {
        return Err(GatewayError::Invalid(format!("preference {} must be a string", key)));
    }
    Ok(map.clone())
}

#[async_trait::async_trait]
impl Store for PreferenceStore {
    async fn by_id(&self, req: &ApiRequest, schema: &ResourceSchema, id: &str) -> GatewayResult<ApiObject> {
        req.check_cancelled()?;
        let mut obj = self.object(Self::own(req, id)?);
        schema.format(req, &mut obj);
        Ok(obj)
    }

    async fn list(&self, req: &ApiRequest, schema: &ResourceSchema) -> GatewayResult<ApiObjectList> {
        req.check_cancelled()?;
        let mut obj = self.object(&req.identity().name);
        schema.format(req, &mut obj);
        Ok(ApiObjectList { objects: vec![obj], ..Default::default() })
    }

    /// Replaces the caller's preferences with `data.data`.
    async fn update(&self, req: &ApiRequest, schema: &ResourceSchema, id: &str, data: Value) -> GatewayResult<ApiObject> {
        req.check_cancelled()?;
        let name = Self::own(req, id)?;
        let values = string_values(&data)?;
        debug!(user = %name, keys = values.len(), "preferences: updated");
        self.prefs.lock().unwrap_or_else(|e| e.into_inner()).insert(name.to_string(), values);
        let mut obj = self.object(name);
        schema.format(req, &mut obj);
        Ok(obj)
    }

    async fn delete(&self, req: &ApiRequest, schema: &ResourceSchema, id: &str) -> GatewayResult<ApiObject> {
        req.check_cancelled()?;
        let name = Self::own(req, id)?;
        let mut obj = self.object(name);
        self.prefs.lock().unwrap_or_else(|e| e.into_inner()).remove(name);
        schema.format(req, &mut obj);
        Ok(obj)
    }
}

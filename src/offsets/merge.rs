//! Pure merge/projection of the two upstream documents.
//!
//! Document A (`offsets.json`) maps module names to flat key→value maps.
//! Document B (`client_dll.json`) nests `"client.dll"` → `classes` →
//! per-class `fields` maps. Both flatten to one map each; B overlays A on
//! key collision. Shape surprises degrade to empty contributions, never
//! errors.

use serde_json::{Map, Value, json};

/// Top-level section of document B holding the class/field tree.
const CLIENT_SECTION: &str = "client.dll";

/// The keys the response contract promises, plus defaults for keys that may
/// legitimately be absent upstream. Declaration order is the order keys are
/// projected and reported missing in.
#[derive(Debug, Clone)]
pub struct RequiredKeys {
    pub required: Vec<String>,
    pub defaults: Map<String, Value>,
}

impl Default for RequiredKeys {
    fn default() -> Self {
        let required = [
            "dwViewMatrix",
            "dwLocalPlayerPawn",
            "dwEntityList",
            "m_hPlayerPawn",
            "m_iHealth",
            "m_lifeState",
            "m_iTeamNum",
            "m_vOldOrigin",
            "m_pGameSceneNode",
            "m_modelState",
            "m_boneArray",
            "m_nodeToWorld",
            "m_sSanitizedPlayerName",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let mut defaults = Map::new();
        defaults.insert("m_boneArray".into(), json!(128));

        Self { required, defaults }
    }
}

/// Flatten document A: union of every module's key→value map, in document
/// order, later modules winning on collision.
pub fn flatten_module_map(doc: &Value) -> Map<String, Value> {
    let mut flat = Map::new();
    let Some(modules) = doc.as_object() else {
        return flat;
    };
    for module in modules.values() {
        if let Some(entries) = module.as_object() {
            for (key, value) in entries {
                flat.insert(key.clone(), value.clone());
            }
        }
    }
    flat
}

/// Flatten document B: union of every class's `fields` map under the
/// `client.dll` section, in document order, later classes winning. Any
/// missing or non-object nesting level contributes nothing.
pub fn flatten_client_fields(doc: &Value) -> Map<String, Value> {
    let mut flat = Map::new();
    let Some(classes) = doc
        .get(CLIENT_SECTION)
        .and_then(|section| section.get("classes"))
        .and_then(Value::as_object)
    else {
        return flat;
    };
    for class in classes.values() {
        if let Some(fields) = class.get("fields").and_then(Value::as_object) {
            for (key, value) in fields {
                flat.insert(key.clone(), value.clone());
            }
        }
    }
    flat
}

/// Combine both documents: flattened A overlaid by flattened B (B wins).
pub fn merge_documents(doc_a: &Value, doc_b: &Value) -> Map<String, Value> {
    let mut merged = flatten_module_map(doc_a);
    for (key, value) in flatten_client_fields(doc_b) {
        merged.insert(key, value);
    }
    merged
}

/// Project the merged map onto the required-key set.
///
/// Copies each required key present in `merged` (declaration order), then
/// fills defaults for default-bearing keys that are absent or null. Returns
/// the projection and the required keys still absent after defaulting.
pub fn project(merged: &Map<String, Value>, keys: &RequiredKeys) -> (Map<String, Value>, Vec<String>) {
    let mut result = Map::new();
    for key in &keys.required {
        if let Some(value) = merged.get(key) {
            result.insert(key.clone(), value.clone());
        }
    }

    for (key, default) in &keys.defaults {
        let needs_default = matches!(result.get(key), None | Some(Value::Null));
        if needs_default {
            result.insert(key.clone(), default.clone());
        }
    }

    let missing_keys = keys
        .required
        .iter()
        .filter(|key| !result.contains_key(*key))
        .cloned()
        .collect();

    (result, missing_keys)
}

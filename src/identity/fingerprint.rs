//! Content fingerprints for step definitions and whole pipelines.
//!
//! Both hashes are SHA-256 prefixes over canonically ordered input so they
//! are stable across implementations: map entries are visited in ascending
//! key order and JSON is encoded with sorted object keys and no
//! insignificant whitespace.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::model::StepDefinition;

/// Hex length of a step definition hash.
const STEP_HASH_LEN: usize = 16;
/// Hex length of a pipeline identity hash.
const IDENTITY_HASH_LEN: usize = 32;

/// Encodes a JSON value canonically: object keys sorted recursively, no
/// insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => other.to_string(),
    }
}

/// Fingerprints a single step definition.
///
/// The byte stream feeds `step_id`, `name`, the agent config fields (when
/// present), every variable and tool option in ascending key order, and
/// finally the step-level options in ascending key order. Returns the
/// first 16 hex chars of the SHA-256 digest.
pub fn step_definition_hash(def: &StepDefinition) -> String {
    let mut hasher = Sha256::new();
    hasher.update(def.step_id.as_bytes());
    hasher.update(def.name.as_bytes());

    if let Some(agent) = &def.agent {
        hasher.update(agent.tool_name.as_bytes());
        hasher.update(agent.tool_version.as_bytes());
        hasher.update(agent.prompt_template.as_bytes());
        hasher.update(agent.flag_format.as_str().as_bytes());

        // BTreeMap iteration is already in ascending key order.
        for (key, value) in &agent.variables {
            hasher.update(key.as_bytes());
            hasher.update(value.as_bytes());
        }
        for (key, value) in &agent.tool_options {
            hasher.update(key.as_bytes());
            hasher.update(canonical_json(value).as_bytes());
        }
    }

    for (key, value) in &def.options {
        hasher.update(key.as_bytes());
        hasher.update(canonical_json(value).as_bytes());
    }

    hex::encode(hasher.finalize())[..STEP_HASH_LEN].to_string()
}

/// Fingerprints a whole pipeline submission.
///
/// Hashes the canonical JSON of
/// `{pipeline_id, steps, prompt_prefix, prompt_suffix, base_commit}` and
/// returns the first 32 hex chars. Two submissions with the same identity
/// hash are the same run.
pub fn pipeline_identity_hash(
    pipeline_id: &str,
    steps: &[StepDefinition],
    prompt_prefix: &str,
    prompt_suffix: &str,
    base_commit: &str,
) -> String {
    let value = serde_json::json!({
        "pipeline_id": pipeline_id,
        "steps": steps,
        "prompt_prefix": prompt_prefix,
        "prompt_suffix": prompt_suffix,
        "base_commit": base_commit,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&value).as_bytes());
    hex::encode(hasher.finalize())[..IDENTITY_HASH_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentConfig, FlagFormat};
    use serde_json::json;

    fn sample_step() -> StepDefinition {
        StepDefinition::new("lint", "Lint pass").with_agent(
            AgentConfig::new("claude", "run the linter")
                .with_variable("lang", "rust")
                .with_variable("strict", "yes")
                .with_option("model", json!("opus"))
                .with_option("max-turns", json!(30)),
        )
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": {"z": true, "y": [1, 2]}});
        assert_eq!(canonical_json(&value), r#"{"a":{"y":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn test_canonical_json_scalars() {
        assert_eq!(canonical_json(&json!(null)), "null");
        assert_eq!(canonical_json(&json!("x")), "\"x\"");
        assert_eq!(canonical_json(&json!(3)), "3");
    }

    #[test]
    fn test_step_hash_is_stable() {
        let a = step_definition_hash(&sample_step());
        let b = step_definition_hash(&sample_step());
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_step_hash_insertion_order_invariant() {
        // Same entries, inserted in a different order.
        let reordered = StepDefinition::new("lint", "Lint pass").with_agent(
            AgentConfig::new("claude", "run the linter")
                .with_option("max-turns", json!(30))
                .with_option("model", json!("opus"))
                .with_variable("strict", "yes")
                .with_variable("lang", "rust"),
        );
        assert_eq!(
            step_definition_hash(&sample_step()),
            step_definition_hash(&reordered)
        );
    }

    #[test]
    fn test_step_hash_changes_with_prompt() {
        let mut other = sample_step();
        other.agent.as_mut().unwrap().prompt_template = "run the linter!".to_string();
        assert_ne!(step_definition_hash(&sample_step()), step_definition_hash(&other));
    }

    #[test]
    fn test_step_hash_changes_with_flag_format() {
        let mut other = sample_step();
        other.agent.as_mut().unwrap().flag_format = FlagFormat::Equals;
        assert_ne!(step_definition_hash(&sample_step()), step_definition_hash(&other));
    }

    #[test]
    fn test_step_hash_without_agent() {
        let bare = StepDefinition::new("noop", "No-op");
        assert_eq!(step_definition_hash(&bare).len(), 16);
    }

    #[test]
    fn test_identity_hash_changes_with_base_commit() {
        let steps = vec![sample_step()];
        let a = pipeline_identity_hash("pl", &steps, "", "", "c0ffee");
        let b = pipeline_identity_hash("pl", &steps, "", "", "c0ffef");
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_identity_hash_changes_with_prompt_wrappers() {
        let steps = vec![sample_step()];
        let a = pipeline_identity_hash("pl", &steps, "", "", "c0ffee");
        let b = pipeline_identity_hash("pl", &steps, "please ", "", "c0ffee");
        let c = pipeline_identity_hash("pl", &steps, "", " thanks", "c0ffee");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }
}

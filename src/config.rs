//! Graph definition loading: YAML files with `$include` composition and
//! `${ENV:default}` expansion, deep-merged the way node configs layer
//! defaults under caller-supplied overrides.

use crate::error::ConfigError;
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use std::env;
use std::path::Path;

/// Load a YAML file, resolving `$include: path` mappings relative to the
/// including file and expanding `${VAR:default}` references in every
/// string scalar.
pub fn load_yaml_file<P: AsRef<Path>>(path: P) -> Result<YamlValue, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut value: YamlValue = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    process_includes(&mut value, base_dir)?;
    expand_variables(&mut value);
    Ok(value)
}

/// Load and deserialize a YAML graph definition into `T` (typically the
/// `GraphDefinition` the `graphflow-run` binary consumes).
pub fn load_yaml_config<T: serde::de::DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T, ConfigError> {
    let yaml = load_yaml_file(path)?;
    let json = yaml_to_json(&yaml)?;
    serde_json::from_value(json).map_err(|e| ConfigError::Deserialize(e.to_string()))
}

fn process_includes(value: &mut YamlValue, base_dir: &Path) -> Result<(), ConfigError> {
    match value {
        YamlValue::Mapping(map) => {
            if let Some(YamlValue::String(include_path)) =
                map.get(&YamlValue::String("$include".to_string()))
            {
                let full_path = base_dir.join(include_path);
                let included = load_yaml_file(&full_path)?;
                *value = included;
                return Ok(());
            }
            for (_, v) in map.iter_mut() {
                process_includes(v, base_dir)?;
            }
        }
        YamlValue::Sequence(seq) => {
            for item in seq.iter_mut() {
                process_includes(item, base_dir)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn expand_variables(value: &mut YamlValue) {
    match value {
        YamlValue::String(s) => {
            if let Some(expanded) = expand_env_in_string(s) {
                *s = expanded;
            }
        }
        YamlValue::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_variables(v);
            }
        }
        YamlValue::Sequence(seq) => {
            for item in seq.iter_mut() {
                expand_variables(item);
            }
        }
        _ => {}
    }
}

fn expand_env_in_string(s: &str) -> Option<String> {
    if !s.contains("${") {
        return None;
    }
    let re = regex::Regex::new(r"\$\{([^:}]+)(?::([^}]*))?\}").ok()?;
    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        let full_match = cap.get(0)?.as_str();
        let var_name = cap.get(1)?.as_str();
        let default_value = cap.get(2).map(|m| m.as_str()).unwrap_or("");
        let value = env::var(var_name).unwrap_or_else(|_| default_value.to_string());
        result = result.replace(full_match, &value);
    }
    Some(result)
}

fn yaml_to_json(yaml: &YamlValue) -> Result<JsonValue, ConfigError> {
    Ok(match yaml {
        YamlValue::Null => JsonValue::Null,
        YamlValue::Bool(b) => JsonValue::Bool(*b),
        YamlValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                JsonValue::Number(i.into())
            } else if let Some(u) = n.as_u64() {
                JsonValue::Number(u.into())
            } else if let Some(f) = n.as_f64() {
                serde_json::Number::from_f64(f)
                    .map(JsonValue::Number)
                    .ok_or_else(|| ConfigError::Invalid(format!("non-finite number: {f}")))?
            } else {
                return Err(ConfigError::Invalid("unrepresentable number".into()));
            }
        }
        YamlValue::String(s) => JsonValue::String(s.clone()),
        YamlValue::Sequence(seq) => {
            JsonValue::Array(seq.iter().map(yaml_to_json).collect::<Result<_, _>>()?)
        }
        YamlValue::Mapping(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                let key = match k {
                    YamlValue::String(s) => s.clone(),
                    other => return Err(ConfigError::Invalid(format!("non-string map key: {other:?}"))),
                };
                out.insert(key, yaml_to_json(v)?);
            }
            JsonValue::Object(out)
        }
        YamlValue::Tagged(tagged) => yaml_to_json(&tagged.value)?,
    })
}

/// Deep-merge `override_val` onto `base` in place: objects merge key by
/// key recursively, everything else is replaced outright. Used to layer
/// a node type's defaults under a caller's config.
pub fn deep_merge(base: &mut JsonValue, override_val: &JsonValue) {
    match (base, override_val) {
        (JsonValue::Object(base_map), JsonValue::Object(other_map)) => {
            for (key, other_value) in other_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, other_value),
                    None => {
                        base_map.insert(key.clone(), other_value.clone());
                    }
                }
            }
        }
        (base, other) => {
            *base = other.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deep_merge_overlays_nested_objects() {
        let mut base = json!({"credential": {"port": 1883, "use_tls": false}, "keepalive": 60});
        let over = json!({"credential": {"hostname": "broker.local"}});
        deep_merge(&mut base, &over);
        assert_eq!(
            base,
            json!({"credential": {"port": 1883, "use_tls": false, "hostname": "broker.local"}, "keepalive": 60})
        );
    }

    #[test]
    fn deep_merge_replaces_non_object_leaves() {
        let mut base = json!({"retries": 3});
        deep_merge(&mut base, &json!({"retries": 5}));
        assert_eq!(base, json!({"retries": 5}));
    }

    #[test]
    fn env_expansion_uses_default_when_unset() {
        std::env::remove_var("GRAPHFLOW_TEST_VAR_UNSET");
        assert_eq!(
            expand_env_in_string("${GRAPHFLOW_TEST_VAR_UNSET:fallback}"),
            Some("fallback".to_string())
        );
    }

    #[test]
    fn load_yaml_file_resolves_include_relative_to_parent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("credential.yaml"), "hostname: broker.local\nport: 1883\n").unwrap();
        std::fs::write(
            dir.path().join("main.yaml"),
            "credential:\n  $include: credential.yaml\nclient:\n  client_id: sub-1\n",
        )
        .unwrap();

        let value = load_yaml_file(dir.path().join("main.yaml")).unwrap();
        let json = yaml_to_json(&value).unwrap();
        assert_eq!(json["credential"]["hostname"], "broker.local");
        assert_eq!(json["client"]["client_id"], "sub-1");
    }

    #[test]
    fn load_yaml_config_deserializes_into_target_type() {
        #[derive(serde::Deserialize)]
        struct Settings {
            hostname: String,
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::env::set_var("GRAPHFLOW_TEST_HOSTNAME", "broker.example.com");
        std::fs::write(&path, "hostname: ${GRAPHFLOW_TEST_HOSTNAME:localhost}\n").unwrap();

        let settings: Settings = load_yaml_config(&path).unwrap();
        assert_eq!(settings.hostname, "broker.example.com");
    }

    #[test]
    fn missing_config_file_is_a_read_error() {
        let err = load_yaml_file("/nonexistent/graphflow-config.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

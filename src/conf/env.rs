//! Environment-variable overlay for the configuration tree
//!
//! Every variable under the `MEDIARELAY_` namespace overrides the value at
//! the matching position of the YAML tree before typed decoding. Nested keys
//! are flattened with underscores and uppercased:
//!
//! ```text
//! MEDIARELAY_LOGLEVEL=debug            -> logLevel: debug
//! MEDIARELAY_PATHS_CAM1_SOURCE=rtsp:// -> paths.cam1.source
//! ```
//!
//! Configuration keys are camelCase and therefore contain no underscores, so
//! each underscore-separated segment maps to exactly one nesting level. Path
//! names containing underscores cannot be addressed from the environment.

use serde_yaml::{Mapping, Value};

/// Environment prefix of the tool.
pub const ENV_PREFIX: &str = "MEDIARELAY_";

/// Overlays all matching environment variables onto `root`.
pub fn overlay(root: &mut Value) {
    let mut vars: Vec<(String, String)> = std::env::vars()
        .filter_map(|(k, v)| {
            k.strip_prefix(ENV_PREFIX)
                .filter(|rest| !rest.is_empty())
                .map(|rest| (rest.to_string(), v))
        })
        .collect();
    // deterministic application order
    vars.sort();

    for (key, value) in vars {
        let segments: Vec<&str> = key.split('_').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            continue;
        }
        apply(root, &segments, &value);
    }
}

fn apply(node: &mut Value, segments: &[&str], value: &str) {
    if !node.is_mapping() {
        *node = Value::Mapping(Mapping::new());
    }
    let map = node.as_mapping_mut().unwrap();

    let segment = segments[0];
    let key = existing_key(map, segment).unwrap_or_else(|| segment.to_lowercase());
    let key = Value::String(key);

    if segments.len() == 1 {
        map.insert(key, parse_scalar(value));
        return;
    }

    let child = map.entry(key).or_insert(Value::Mapping(Mapping::new()));
    apply(child, &segments[1..], value);
}

/// Finds a key already present in the mapping whose flattened form equals the
/// env segment, so `PATHS` matches `paths` and `LOGLEVEL` matches `logLevel`.
fn existing_key(map: &Mapping, segment: &str) -> Option<String> {
    map.keys().find_map(|k| {
        k.as_str()
            .filter(|s| s.to_uppercase() == segment)
            .map(str::to_string)
    })
}

/// Interprets an env value the way the YAML parser would, with one addition:
/// a comma-separated value becomes a sequence.
fn parse_scalar(value: &str) -> Value {
    if value.contains(',') {
        return Value::Sequence(
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_scalar_single(s))
                .collect(),
        );
    }
    parse_scalar_single(value)
}

fn parse_scalar_single(value: &str) -> Value {
    serde_yaml::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_scalar_override() {
        let mut root = yaml("logLevel: info\n");
        apply(&mut root, &["LOGLEVEL"], "debug");
        assert_eq!(root["logLevel"], Value::String("debug".into()));
    }

    #[test]
    fn test_nested_create() {
        let mut root = yaml("{}");
        apply(&mut root, &["PATHS", "CAM1", "SOURCE"], "rtsp://testing");
        assert_eq!(
            root["paths"]["cam1"]["source"],
            Value::String("rtsp://testing".into())
        );
    }

    #[test]
    fn test_existing_key_case_preserved() {
        let mut root = yaml("paths:\n  Cam1:\n    source: publisher\n");
        apply(&mut root, &["PATHS", "CAM1", "SOURCE"], "rtsp://x");
        // matches the existing key instead of inserting a lowercase twin
        assert_eq!(root["paths"]["Cam1"]["source"], Value::String("rtsp://x".into()));
        assert!(root["paths"].as_mapping().unwrap().len() == 1);
    }

    #[test]
    fn test_typed_scalars() {
        assert_eq!(parse_scalar("true"), Value::Bool(true));
        assert_eq!(parse_scalar("512"), yaml("512"));
        assert_eq!(parse_scalar("hello"), Value::String("hello".into()));
        assert_eq!(
            parse_scalar("10.0.0.0/8, 127.0.0.1"),
            Value::Sequence(vec![
                Value::String("10.0.0.0/8".into()),
                Value::String("127.0.0.1".into()),
            ])
        );
    }
}

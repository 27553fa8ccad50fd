//! Static endpoint registry and path resolver.
//!
//! The backend's REST surface is described declaratively in
//! `registry.json`: a mapping from a major entity (`"experiments"`,
//! `"models"`, ...) through nested path keys down to a
//! `{ method, path }` template. Templates carry `{placeholder}` tokens
//! that are substituted from caller-supplied params at resolution time.
//!
//! Resolution is pure and cheap; lookup failures are programmer errors
//! (a typo'd entity or path key), surfaced loudly as [`EndpointError`]
//! rather than silently returning nothing.

use std::collections::HashMap;
use std::sync::OnceLock;

use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// The embedded registry, parsed once on first use.
const REGISTRY_JSON: &str = include_str!("registry.json");

/// Params supplied to [`resolve`]: placeholder name to value.
/// Values are stringified on substitution (strings unquoted).
pub type Params = HashMap<String, Value>;

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("unknown endpoint entity '{0}'")]
    UnknownEntity(String),

    #[error("unknown endpoint path '{segment}' under '{entity}'")]
    UnknownPath { entity: String, segment: String },

    #[error("path '{0}' names a group, not an endpoint")]
    NotAnEndpoint(String),

    #[error("invalid HTTP method '{method}' in registry for '{path}'")]
    InvalidMethod { method: String, path: String },
}

/// A node in the registry tree: either a concrete endpoint template or
/// a group of further path keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RegistryNode {
    Endpoint(EndpointTemplate),
    Group(HashMap<String, RegistryNode>),
}

#[derive(Debug, Clone, Deserialize)]
struct EndpointTemplate {
    method: String,
    path: String,
}

/// A fully resolved endpoint: concrete method and path with params
/// substituted.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub method: Method,
    pub path: String,
}

fn registry() -> &'static HashMap<String, RegistryNode> {
    static REGISTRY: OnceLock<HashMap<String, RegistryNode>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        // The registry ships inside the binary; a parse failure is a
        // build defect, caught by the tests below.
        serde_json::from_str(REGISTRY_JSON).expect("embedded endpoint registry is invalid JSON")
    })
}

/// Render a param value into a path segment. Strings are used verbatim
/// (no surrounding quotes); everything else uses its JSON rendering.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Look up `entity` / `segments` in the registry and substitute
/// `params` into the path template.
///
/// Every `{key}` occurrence with a matching param is replaced.
/// Placeholders with no matching param are left verbatim; some
/// templates carry optional trailing placeholders that the server
/// tolerates.
pub fn resolve(
    entity: &str,
    segments: &[&str],
    params: &Params,
) -> Result<ResolvedEndpoint, EndpointError> {
    let root = registry()
        .get(entity)
        .ok_or_else(|| EndpointError::UnknownEntity(entity.to_string()))?;

    let mut node = root;
    for segment in segments {
        node = match node {
            RegistryNode::Group(children) => {
                children
                    .get(*segment)
                    .ok_or_else(|| EndpointError::UnknownPath {
                        entity: entity.to_string(),
                        segment: segment.to_string(),
                    })?
            }
            RegistryNode::Endpoint(_) => {
                return Err(EndpointError::UnknownPath {
                    entity: entity.to_string(),
                    segment: segment.to_string(),
                })
            }
        };
    }

    let template = match node {
        RegistryNode::Endpoint(template) => template,
        RegistryNode::Group(_) => {
            return Err(EndpointError::NotAnEndpoint(format!(
                "{}/{}",
                entity,
                segments.join("/")
            )))
        }
    };

    let mut path = template.path.clone();
    for (key, value) in params {
        path = path.replace(&format!("{{{}}}", key), &stringify(value));
    }

    let method = Method::from_bytes(template.method.as_bytes()).map_err(|_| {
        EndpointError::InvalidMethod {
            method: template.method.clone(),
            path: template.path.clone(),
        }
    })?;

    Ok(ResolvedEndpoint { method, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_registry_parses() {
        // Force the OnceLock to initialize; panics if registry.json is bad.
        assert!(!registry().is_empty());
    }

    #[test]
    fn test_resolve_simple_endpoint() {
        let ep = resolve("users", &["me"], &Params::new()).unwrap();
        assert_eq!(ep.method, Method::GET);
        assert_eq!(ep.path, "/users/me");
    }

    #[test]
    fn test_resolve_substitutes_each_placeholder_once() {
        let ep = resolve(
            "experiments",
            &["jobs", "get"],
            &params(&[
                ("experiment_id", json!("exp-7")),
                ("job_id", json!(42)),
            ]),
        )
        .unwrap();
        assert_eq!(ep.method, Method::GET);
        assert_eq!(ep.path, "/experiments/exp-7/jobs/42");
    }

    #[test]
    fn test_resolve_preserves_literal_text() {
        let ep = resolve(
            "experiments",
            &["jobs", "stop"],
            &params(&[
                ("experiment_id", json!("a")),
                ("job_id", json!("b")),
            ]),
        )
        .unwrap();
        assert_eq!(ep.path, "/experiments/a/jobs/b/stop");
    }

    #[test]
    fn test_unmatched_placeholder_left_verbatim() {
        let ep = resolve(
            "experiments",
            &["jobs", "output"],
            &params(&[
                ("experiment_id", json!("e1")),
                ("job_id", json!("j1")),
            ]),
        )
        .unwrap();
        assert_eq!(ep.path, "/experiments/e1/jobs/j1/output?sweep={sweep}");
    }

    #[test]
    fn test_unknown_entity_is_loud() {
        let err = resolve("bogus", &["list"], &Params::new()).unwrap_err();
        assert!(matches!(err, EndpointError::UnknownEntity(_)));
    }

    #[test]
    fn test_unknown_segment_is_loud() {
        let err = resolve("models", &["explode"], &Params::new()).unwrap_err();
        assert!(matches!(err, EndpointError::UnknownPath { .. }));
    }

    #[test]
    fn test_group_path_is_not_an_endpoint() {
        let err = resolve("experiments", &["jobs"], &Params::new()).unwrap_err();
        assert!(matches!(err, EndpointError::NotAnEndpoint(_)));
    }

    #[test]
    fn test_numeric_params_stringified_without_quotes() {
        let ep = resolve(
            "tasks",
            &["get"],
            &params(&[("task_id", json!(17))]),
        )
        .unwrap();
        assert_eq!(ep.path, "/tasks/17");
    }
}

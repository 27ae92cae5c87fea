use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One placeholder in a path template, after name resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathParam {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
}

/// Canonical description of one upstream endpoint. Published catalogs are
/// immutable; a refresh replaces the whole operation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: String,
    pub method: String,
    pub path_template: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_params: Vec<PathParam>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_params: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_schema: Option<Value>,
    pub is_mutating: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub search_text: String,
}

#[derive(Debug, Clone)]
pub struct NormalizedCatalog {
    pub operations: Vec<Operation>,
    pub root_schema: Value,
}

/// Turn the upstream hypermedia schema (`definitions/*/links[]`) into the
/// canonical operation catalog. Definitions are walked in name order so
/// repeated runs over the same schema produce identical output.
pub fn normalize_root_schema(root: &Value) -> NormalizedCatalog {
    let mut operations: Vec<Operation> = Vec::new();
    let mut by_key: HashMap<(String, String), usize> = HashMap::new();

    if let Some(definitions) = root.get("definitions").and_then(Value::as_object) {
        let mut names: Vec<&String> = definitions.keys().collect();
        names.sort();

        for def_name in names {
            let Some(links) = definitions[def_name].get("links").and_then(Value::as_array) else {
                continue;
            };
            for link in links {
                let Some(candidate) = operation_from_link(def_name, link) else {
                    continue;
                };
                let key = (candidate.method.clone(), candidate.path_template.clone());
                match by_key.get(&key) {
                    Some(&index) => merge_operation(&mut operations[index], candidate),
                    None => {
                        by_key.insert(key, operations.len());
                        operations.push(candidate);
                    }
                }
            }
        }
    }

    NormalizedCatalog {
        operations,
        root_schema: root.clone(),
    }
}

fn operation_from_link(def_name: &str, link: &Value) -> Option<Operation> {
    let href = link.get("href").and_then(Value::as_str)?;

    let method = link
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_ascii_uppercase)
        .unwrap_or_else(|| "GET".to_string());
    let is_mutating = !matches!(method.as_str(), "GET" | "HEAD");

    let (path_template, path_params) = resolve_path_template(href);
    let operation_id = format!("{method} {path_template}");

    let title = non_empty_str(link.get("title"));
    let description = non_empty_str(link.get("description"));
    let rel = non_empty_str(link.get("rel"));
    let request_schema = link.get("schema").filter(|s| !s.is_null()).cloned();

    let mut required_params: Vec<String> = path_params
        .iter()
        .map(|param| param.name.clone())
        .collect();
    if let Some(required) = request_schema
        .as_ref()
        .and_then(|schema| schema.get("required"))
        .and_then(Value::as_array)
    {
        for entry in required {
            if let Some(field) = entry.as_str() {
                push_unique(&mut required_params, format!("body.{field}"));
            }
        }
    }

    let search_text = [
        Some(operation_id.as_str()),
        Some(def_name),
        title.as_deref(),
        description.as_deref(),
        rel.as_deref(),
        Some(href),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ")
    .to_lowercase();

    Some(Operation {
        operation_id,
        method,
        path_template,
        path_params,
        required_params,
        request_schema,
        is_mutating,
        definition_name: Some(def_name.to_string()),
        title,
        description,
        rel,
        search_text,
    })
}

/// Duplicate `(method, path_template)` links collapse into one operation:
/// descriptions concatenate, required params union in first-seen order,
/// search text appends.
fn merge_operation(existing: &mut Operation, incoming: Operation) {
    match (&mut existing.description, incoming.description) {
        (Some(current), Some(extra)) => {
            let joined = format!("{} {}", current.trim(), extra.trim());
            *current = joined.trim().to_string();
        }
        (slot @ None, Some(extra)) => *slot = Some(extra.trim().to_string()),
        _ => {}
    }
    if existing.title.is_none() {
        existing.title = incoming.title;
    }
    if existing.rel.is_none() {
        existing.rel = incoming.rel;
    }
    if existing.request_schema.is_none() {
        existing.request_schema = incoming.request_schema;
    }
    for param in incoming.required_params {
        push_unique(&mut existing.required_params, param);
    }
    if !incoming.search_text.is_empty() {
        existing.search_text.push(' ');
        existing.search_text.push_str(&incoming.search_text);
    }
}

/// Rewrite a raw href into a canonical template: every placeholder becomes
/// `{name}` with a sanitized identifier, whether it started as a plain
/// `{name}` or as a URI-encoded JSON-pointer reference `{(...)}`.
fn resolve_path_template(href: &str) -> (String, Vec<PathParam>) {
    let mut template = String::with_capacity(href.len());
    let mut params: Vec<PathParam> = Vec::new();
    let mut used_names: Vec<String> = Vec::new();
    let mut placeholder_index = 0usize;

    let mut rest = href;
    while let Some(open) = rest.find('{') {
        template.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        let Some(close) = after_open.find('}') else {
            // Unbalanced brace: keep the tail verbatim.
            template.push_str(&rest[open..]);
            rest = "";
            break;
        };
        let raw = &after_open[..close];

        let (base_name, source_ref) = if raw.starts_with('(') && raw.ends_with(')') && raw.len() >= 2
        {
            let pointer = percent_decode_str(&raw[1..raw.len() - 1])
                .decode_utf8_lossy()
                .to_string();
            (
                name_from_pointer(&pointer, placeholder_index),
                Some(pointer),
            )
        } else {
            (sanitize(raw, placeholder_index), None)
        };

        let name = dedupe_name(base_name, &used_names);
        used_names.push(name.clone());
        template.push('{');
        template.push_str(&name);
        template.push('}');
        params.push(PathParam { name, source_ref });

        placeholder_index += 1;
        rest = &after_open[close + 1..];
    }
    template.push_str(rest);

    (template, params)
}

/// Derive a parameter name from a decoded JSON pointer like
/// `#/definitions/app/definitions/identity`: collect the value after each
/// `definitions` segment and combine first and last.
fn name_from_pointer(pointer: &str, placeholder_index: usize) -> String {
    let segments: Vec<&str> = pointer
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != "#")
        .collect();

    let mut collected: Vec<&str> = Vec::new();
    for window in segments.windows(2) {
        if window[0] == "definitions" {
            collected.push(window[1]);
        }
    }

    match collected.as_slice() {
        [] => sanitize(segments.last().copied().unwrap_or(""), placeholder_index),
        [only] => sanitize(only, placeholder_index),
        [first, .., last] => sanitize(&format!("{first}_{last}"), placeholder_index),
    }
}

/// Lowercase, collapse runs of non-alphanumerics into `_`, trim `_`; an
/// empty result becomes `param_<i>` and a leading digit gets a `p_` prefix.
fn sanitize(raw: &str, placeholder_index: usize) -> String {
    let mut name = String::with_capacity(raw.len());
    let mut pending_underscore = false;
    for ch in raw.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_underscore && !name.is_empty() {
                name.push('_');
            }
            pending_underscore = false;
            name.push(ch);
        } else {
            pending_underscore = true;
        }
    }

    if name.is_empty() {
        return format!("param_{placeholder_index}");
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return format!("p_{name}");
    }
    name
}

/// Collisions within one template take a monotonic counter suffix, so two
/// collisions can never alias each other.
fn dedupe_name(base: String, used: &[String]) -> String {
    if !used.iter().any(|existing| *existing == base) {
        return base;
    }
    let mut counter = 2usize;
    loop {
        let candidate = format!("{base}_{counter}");
        if !used.iter().any(|existing| *existing == candidate) {
            return candidate;
        }
        counter += 1;
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.iter().any(|existing| *existing == value) {
        list.push(value);
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        name_from_pointer, normalize_root_schema, resolve_path_template, sanitize,
    };

    fn heroku_like_schema() -> serde_json::Value {
        json!({
            "definitions": {
                "app": {
                    "links": [
                        {
                            "href": "/apps",
                            "method": "GET",
                            "rel": "instances",
                            "title": "List",
                            "description": "List existing apps."
                        },
                        {
                            "href": "/apps",
                            "method": "POST",
                            "rel": "create",
                            "title": "Create",
                            "description": "Create a new app.",
                            "schema": {
                                "type": "object",
                                "properties": {
                                    "name": {"type": "string"},
                                    "region": {"type": "string"}
                                },
                                "required": ["name"]
                            }
                        },
                        {
                            "href": "/apps/{(%23%2Fdefinitions%2Fapp%2Fdefinitions%2Fidentity)}",
                            "method": "GET",
                            "rel": "self",
                            "title": "Info",
                            "description": "Info for existing app."
                        }
                    ]
                },
                "release": {
                    "links": [
                        {
                            "href": "/apps/{(%23%2Fdefinitions%2Fapp%2Fdefinitions%2Fidentity)}/releases",
                            "method": "GET",
                            "rel": "instances",
                            "title": "List releases"
                        }
                    ]
                }
            }
        })
    }

    #[test]
    fn sanitize_applies_all_rules() {
        assert_eq!(sanitize("Identity", 0), "identity");
        assert_eq!(sanitize("App--Name!!", 0), "app_name");
        assert_eq!(sanitize("__trim__", 0), "trim");
        assert_eq!(sanitize("", 3), "param_3");
        assert_eq!(sanitize("***", 5), "param_5");
        assert_eq!(sanitize("2fa-code", 0), "p_2fa_code");
    }

    #[test]
    fn pointer_names_combine_first_and_last_definition() {
        assert_eq!(
            name_from_pointer("#/definitions/app/definitions/identity", 0),
            "app_identity"
        );
        assert_eq!(name_from_pointer("#/definitions/app", 0), "app");
        assert_eq!(name_from_pointer("#/properties/name", 0), "name");
        assert_eq!(
            name_from_pointer(
                "#/definitions/pipeline/definitions/coupling/definitions/identity",
                0
            ),
            "pipeline_identity"
        );
    }

    #[test]
    fn templates_resolve_encoded_and_plain_placeholders() {
        let (template, params) = resolve_path_template(
            "/apps/{(%23%2Fdefinitions%2Fapp%2Fdefinitions%2Fidentity)}/dynos/{Dyno-Name}",
        );
        assert_eq!(template, "/apps/{app_identity}/dynos/{dyno_name}");
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].name, "app_identity");
        assert_eq!(
            params[0].source_ref.as_deref(),
            Some("#/definitions/app/definitions/identity")
        );
        assert_eq!(params[1].name, "dyno_name");
        assert!(params[1].source_ref.is_none());
    }

    #[test]
    fn colliding_placeholder_names_get_counter_suffixes() {
        let (template, params) = resolve_path_template("/links/{id}/to/{id}/and/{id}");
        assert_eq!(template, "/links/{id}/to/{id_2}/and/{id_3}");
        let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["id", "id_2", "id_3"]);
    }

    #[test]
    fn catalog_has_unique_ids_and_mutation_flags() {
        let catalog = normalize_root_schema(&heroku_like_schema());
        let ids: Vec<&str> = catalog
            .operations
            .iter()
            .map(|op| op.operation_id.as_str())
            .collect();
        assert_eq!(
            ids,
            [
                "GET /apps",
                "POST /apps",
                "GET /apps/{app_identity}",
                "GET /apps/{app_identity}/releases"
            ]
        );

        for op in &catalog.operations {
            assert_eq!(op.is_mutating, !matches!(op.method.as_str(), "GET" | "HEAD"));
        }
    }

    #[test]
    fn body_required_fields_join_required_params() {
        let catalog = normalize_root_schema(&heroku_like_schema());
        let create = catalog
            .operations
            .iter()
            .find(|op| op.operation_id == "POST /apps")
            .expect("create op present");
        assert_eq!(create.required_params, ["body.name"]);

        let info = catalog
            .operations
            .iter()
            .find(|op| op.operation_id == "GET /apps/{app_identity}")
            .expect("info op present");
        assert_eq!(info.required_params, ["app_identity"]);
    }

    #[test]
    fn missing_method_defaults_to_get() {
        let root = json!({
            "definitions": {
                "thing": {"links": [{"href": "/things", "title": "List"}]}
            }
        });
        let catalog = normalize_root_schema(&root);
        assert_eq!(catalog.operations[0].method, "GET");
        assert!(!catalog.operations[0].is_mutating);
    }

    #[test]
    fn duplicate_links_merge_descriptions_and_required_params() {
        let root = json!({
            "definitions": {
                "a": {
                    "links": [{
                        "href": "/shared",
                        "method": "POST",
                        "description": "First half.",
                        "schema": {"required": ["alpha"]}
                    }]
                },
                "b": {
                    "links": [{
                        "href": "/shared",
                        "method": "POST",
                        "description": "Second half.",
                        "schema": {"required": ["beta", "alpha"]}
                    }]
                }
            }
        });
        let catalog = normalize_root_schema(&root);
        assert_eq!(catalog.operations.len(), 1);
        let merged = &catalog.operations[0];
        assert_eq!(merged.description.as_deref(), Some("First half. Second half."));
        assert_eq!(merged.required_params, ["body.alpha", "body.beta"]);
        assert!(merged.search_text.contains("first half"));
        assert!(merged.search_text.contains("second half"));
    }

    #[test]
    fn normalization_is_deterministic() {
        let root = heroku_like_schema();
        let first = serde_json::to_string(&normalize_root_schema(&root).operations)
            .expect("serialize");
        let second = serde_json::to_string(&normalize_root_schema(&root).operations)
            .expect("serialize");
        assert_eq!(first, second);
    }

    #[test]
    fn path_param_names_are_valid_identifiers() {
        let catalog = normalize_root_schema(&heroku_like_schema());
        for op in &catalog.operations {
            for param in &op.path_params {
                assert!(
                    param
                        .name
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'),
                    "bad param name {}",
                    param.name
                );
                assert!(!param.name.starts_with(|c: char| c.is_ascii_digit()));
                let placeholder = format!("{{{}}}", param.name);
                assert_eq!(op.path_template.matches(&placeholder).count(), 1);
            }
        }
    }
}

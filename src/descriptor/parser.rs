//! Descriptor loading and field-by-field validation.
//!
//! The YAML document is first read into a generic [`serde_yaml::Value`] and
//! then walked field by field. This keeps one bad field from hiding the
//! others: fatal problems are collected as errors, malformed optional
//! fields become warnings and are dropped, and the descriptor is built from
//! whatever validated.

use regex::Regex;
use serde_json::Value as JsonValue;
use serde_yaml::{Mapping, Value as YamlValue};
use std::collections::BTreeMap;
use std::path::Path;
use strsim::levenshtein;

use super::expression;
use super::steps::validate_steps;
use super::{
    DependencyEntry, DependencySpec, DependencyType, Hooks, Include, ParsedTemplate, Settings,
    TemplateDescriptor, ValidationIssue, VariableDefinition, VariableType, locate_descriptor,
};
use crate::compose::ConflictStrategy;
use crate::core::TemplateConfigError;

/// Maximum Levenshtein distance, as a percentage of the input length, for a
/// "did you mean" suggestion.
const SIMILARITY_THRESHOLD_PERCENT: usize = 50;

const TOP_LEVEL_KEYS: &[&str] = &[
    "name",
    "version",
    "description",
    "author",
    "category",
    "tags",
    "variables",
    "steps",
    "dependencies",
    "outputs",
    "extends",
    "includes",
    "hooks",
    "settings",
];

const VARIABLE_KEYS: &[&str] =
    &["type", "description", "required", "default", "pattern", "values", "min", "max", "prompt"];

/// Accumulates errors and warnings during one validation run.
#[derive(Debug, Default)]
pub(super) struct Issues {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl Issues {
    pub fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue::new(field, message));
    }

    pub fn warn(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ValidationIssue::new(field, message));
    }

    /// Warn about a condition that is degenerate or does not parse.
    pub fn check_expression(&mut self, field: &str, text: &str) {
        if expression::is_degenerate(text) {
            self.warn(field, format!("expression '{text}' looks degenerate"));
        } else if let Err(e) = expression::parse(text) {
            self.warn(field, format!("expression '{text}' does not parse: {e}"));
        }
    }
}

/// Closest candidate to `target`, if any is close enough to suggest.
pub(super) fn suggest<'a>(
    target: &str,
    candidates: impl IntoIterator<Item = &'a str>,
) -> Option<String> {
    let limit = target.len() * SIMILARITY_THRESHOLD_PERCENT / 100;
    candidates
        .into_iter()
        .map(|candidate| (candidate, levenshtein(target, candidate)))
        .filter(|(_, distance)| *distance <= limit)
        .min_by_key(|(_, distance)| *distance)
        .map(|(candidate, _)| candidate.to_string())
}

/// Human readable name of a YAML node's kind.
pub(super) const fn kind_of(value: &YamlValue) -> &'static str {
    match value {
        YamlValue::Null => "null",
        YamlValue::Bool(_) => "boolean",
        YamlValue::Number(_) => "number",
        YamlValue::String(_) => "string",
        YamlValue::Sequence(_) => "list",
        YamlValue::Mapping(_) => "mapping",
        YamlValue::Tagged(_) => "tagged value",
    }
}

/// Convert a YAML node to JSON; fails for non-string keys and tags.
pub(super) fn to_json(value: &YamlValue) -> Option<JsonValue> {
    serde_json::to_value(value).ok()
}

/// String keys of a mapping, in document order.
pub(super) fn string_keys(map: &Mapping) -> impl Iterator<Item = (&str, &YamlValue)> {
    map.iter().filter_map(|(k, v)| k.as_str().map(|k| (k, v)))
}

/// A scalar rendered as a string (versions are often written as numbers).
fn scalar_string(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A list of strings; non-string entries are reported and skipped.
pub(super) fn string_list(value: &YamlValue, field: &str, issues: &mut Issues) -> Vec<String> {
    match value {
        YamlValue::String(s) => vec![s.clone()],
        YamlValue::Sequence(items) => items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| match scalar_string(item) {
                Some(s) => Some(s),
                None => {
                    issues.warn(format!("{field}[{i}]"), "expected a string; entry dropped");
                    None
                }
            })
            .collect(),
        other => {
            issues.warn(field, format!("expected a list of strings, got {}; dropped", kind_of(other)));
            Vec::new()
        }
    }
}

/// A mapping of string keys to JSON values.
pub(super) fn json_map(
    value: &YamlValue,
    field: &str,
    issues: &mut Issues,
) -> BTreeMap<String, JsonValue> {
    let YamlValue::Mapping(map) = value else {
        issues.warn(field, format!("expected a mapping, got {}; dropped", kind_of(value)));
        return BTreeMap::new();
    };
    let mut result = BTreeMap::new();
    for (key, item) in map {
        let Some(key) = key.as_str() else {
            issues.warn(field, "non-string key dropped");
            continue;
        };
        match to_json(item) {
            Some(json) => {
                result.insert(key.to_string(), json);
            }
            None => issues.warn(format!("{field}.{key}"), "unsupported value; dropped"),
        }
    }
    result
}

/// Stateless descriptor parser.
///
/// # Examples
///
/// ```
/// use tplkit::descriptor::DescriptorParser;
///
/// let parsed = DescriptorParser::new()
///     .parse_str("name: app\nvariables:\n  port:\n    type: number\n    default: 3000\n", "inline")
///     .unwrap();
/// assert!(parsed.is_valid);
/// assert_eq!(parsed.descriptor.variables["port"].default, Some(serde_json::json!(3000)));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorParser;

impl DescriptorParser {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Load and validate the descriptor at `path`.
    ///
    /// A directory is searched for `template.yaml`, then `template.yml`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateConfigError`] when no descriptor exists, it cannot be
    /// read, or it is not well-formed YAML.
    pub async fn parse_file(&self, path: &Path) -> Result<ParsedTemplate, TemplateConfigError> {
        let file = locate_descriptor(path).ok_or_else(|| TemplateConfigError::NotFound {
            path: path.display().to_string(),
        })?;

        tracing::debug!("Parsing descriptor {}", file.display());
        let text = tokio::fs::read_to_string(&file).await.map_err(|e| {
            TemplateConfigError::ReadFailed {
                path: file.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        self.parse_str(&text, &file.display().to_string())
    }

    /// Validate descriptor text. `origin` labels the text in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateConfigError::Malformed`] when the text is not
    /// well-formed YAML or its root is not a mapping.
    pub fn parse_str(&self, text: &str, origin: &str) -> Result<ParsedTemplate, TemplateConfigError> {
        let malformed = |reason: String| TemplateConfigError::Malformed {
            origin: origin.to_string(),
            reason,
        };

        let document: YamlValue =
            serde_yaml::from_str(text).map_err(|e| malformed(e.to_string()))?;
        let root = match document {
            YamlValue::Mapping(map) => map,
            YamlValue::Null => return Err(malformed("document is empty".to_string())),
            other => {
                return Err(malformed(format!(
                    "top-level document must be a mapping, got {}",
                    kind_of(&other)
                )));
            }
        };

        let mut issues = Issues::default();
        let descriptor = validate_root(&root, &mut issues);

        if !issues.errors.is_empty() {
            tracing::debug!(
                "Descriptor {} has {} error(s), {} warning(s)",
                origin,
                issues.errors.len(),
                issues.warnings.len()
            );
        }

        Ok(ParsedTemplate {
            descriptor,
            is_valid: issues.errors.is_empty(),
            errors: issues.errors,
            warnings: issues.warnings,
        })
    }
}

fn optional_string(root: &Mapping, key: &str, issues: &mut Issues) -> Option<String> {
    match root.get(key)? {
        YamlValue::Null => None,
        value => scalar_string(value).or_else(|| {
            issues.warn(key, format!("expected a string, got {}; dropped", kind_of(value)));
            None
        }),
    }
}

fn validate_root(root: &Mapping, issues: &mut Issues) -> TemplateDescriptor {
    for (key, _) in root {
        match key.as_str() {
            Some(k) if TOP_LEVEL_KEYS.contains(&k) => {}
            Some(k) => {
                let hint = suggest(k, TOP_LEVEL_KEYS.iter().copied())
                    .map(|s| format!(" (did you mean '{s}'?)"))
                    .unwrap_or_default();
                issues.warn(k, format!("unknown field ignored{hint}"));
            }
            None => issues.warn("", "non-string top-level key ignored"),
        }
    }

    let name = match root.get("name") {
        Some(YamlValue::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(YamlValue::String(_)) => {
            issues.error("name", "must not be empty");
            String::new()
        }
        Some(other) => {
            issues.error("name", format!("must be a string, got {}", kind_of(other)));
            String::new()
        }
        None => {
            issues.error("name", "required field is missing");
            String::new()
        }
    };

    TemplateDescriptor {
        name,
        version: optional_string(root, "version", issues),
        description: optional_string(root, "description", issues),
        author: optional_string(root, "author", issues),
        category: optional_string(root, "category", issues),
        tags: root.get("tags").map(|v| string_list(v, "tags", issues)).unwrap_or_default(),
        variables: validate_variables(root.get("variables"), issues),
        steps: root.get("steps").map(|v| validate_steps(v, issues)).unwrap_or_default(),
        dependencies: root
            .get("dependencies")
            .map(|v| validate_dependencies(v, issues))
            .unwrap_or_default(),
        outputs: root.get("outputs").map(|v| string_list(v, "outputs", issues)).unwrap_or_default(),
        extends: validate_extends(root.get("extends"), issues),
        includes: root.get("includes").map(|v| validate_includes(v, issues)).unwrap_or_default(),
        hooks: root.get("hooks").map(|v| validate_hooks(v, issues)).unwrap_or_default(),
        settings: root.get("settings").map(|v| validate_settings(v, issues)).unwrap_or_default(),
    }
}

fn validate_variables(
    value: Option<&YamlValue>,
    issues: &mut Issues,
) -> BTreeMap<String, VariableDefinition> {
    let mut variables = BTreeMap::new();
    let map = match value {
        None => {
            issues.error("variables", "required field is missing");
            return variables;
        }
        Some(YamlValue::Null) => return variables,
        Some(YamlValue::Mapping(map)) => map,
        Some(other) => {
            issues.error("variables", format!("must be a mapping, got {}", kind_of(other)));
            return variables;
        }
    };

    for (key, definition) in map {
        let Some(name) = key.as_str() else {
            issues.error("variables", "variable names must be strings");
            continue;
        };
        let field = format!("variables.{name}");
        if let Some(def) = validate_variable(&field, definition, issues) {
            variables.insert(name.to_string(), def);
        }
    }
    variables
}

fn validate_variable(
    field: &str,
    value: &YamlValue,
    issues: &mut Issues,
) -> Option<VariableDefinition> {
    let YamlValue::Mapping(map) = value else {
        issues.error(field, format!("definition must be a mapping, got {}", kind_of(value)));
        return None;
    };

    let var_type = match map.get("type") {
        None => {
            issues.error(format!("{field}.type"), "required field is missing");
            return None;
        }
        Some(YamlValue::String(s)) => match s.parse::<VariableType>() {
            Ok(t) => t,
            Err(e) => {
                let hint = suggest(s, VariableType::ALL.iter().map(|t| t.as_str()))
                    .map(|s| format!(" (did you mean '{s}'?)"))
                    .unwrap_or_default();
                issues.error(format!("{field}.type"), format!("{e}{hint}"));
                return None;
            }
        },
        Some(other) => {
            issues.error(format!("{field}.type"), format!("must be a string, got {}", kind_of(other)));
            return None;
        }
    };

    let mut def = VariableDefinition::new(var_type);

    for (key, item) in string_keys(map) {
        let sub = format!("{field}.{key}");
        match key {
            "type" => {}
            "description" | "prompt" => match item.as_str() {
                Some(s) if key == "description" => def.description = Some(s.to_string()),
                Some(s) => def.prompt = Some(s.to_string()),
                None => issues.warn(sub, "expected a string; dropped"),
            },
            "required" => match item.as_bool() {
                Some(b) => def.required = b,
                None => issues.warn(sub, "expected a boolean; dropped"),
            },
            "default" => match to_json(item) {
                Some(json) if var_type.accepts(&json) => def.default = Some(json),
                Some(_) => issues.warn(
                    sub,
                    format!("default is not a valid {var_type} value; dropped"),
                ),
                None => issues.warn(sub, "unsupported default value; dropped"),
            },
            "pattern" => {
                if var_type != VariableType::String {
                    issues.warn(sub, format!("only applies to string variables, not {var_type}; dropped"));
                } else if let Some(pattern) = item.as_str() {
                    match Regex::new(pattern) {
                        Ok(_) => def.pattern = Some(pattern.to_string()),
                        Err(e) => issues.warn(sub, format!("invalid regular expression: {e}; dropped")),
                    }
                } else {
                    issues.warn(sub, "expected a string; dropped");
                }
            }
            "values" => {
                if var_type != VariableType::Enum {
                    issues.warn(sub, format!("only applies to enum variables, not {var_type}; dropped"));
                } else if let Some(JsonValue::Array(values)) = to_json(item) {
                    def.values = Some(values);
                } else {
                    issues.warn(sub, "expected a list; dropped");
                }
            }
            "min" | "max" => {
                if var_type != VariableType::Number {
                    issues.warn(sub, format!("only applies to number variables, not {var_type}; dropped"));
                } else if let Some(n) = item.as_f64() {
                    if key == "min" {
                        def.min = Some(n);
                    } else {
                        def.max = Some(n);
                    }
                } else {
                    issues.warn(sub, "expected a number; dropped");
                }
            }
            other => {
                let hint = suggest(other, VARIABLE_KEYS.iter().copied())
                    .map(|s| format!(" (did you mean '{s}'?)"))
                    .unwrap_or_default();
                issues.warn(sub, format!("unknown field ignored{hint}"));
            }
        }
    }

    if var_type == VariableType::Enum && def.values.as_ref().is_none_or(Vec::is_empty) {
        issues.error(format!("{field}.values"), "enum variables require a non-empty list of values");
    }

    if let (Some(min), Some(max)) = (def.min, def.max)
        && min > max
    {
        issues.warn(format!("{field}.min"), format!("min ({min}) is greater than max ({max})"));
    }

    if def.required && def.default.is_some() {
        issues.warn(format!("{field}.default"), "ignored because the variable is required");
        def.default = None;
    }

    if let (Some(default), Some(values)) = (&def.default, &def.values)
        && !values.contains(default)
    {
        issues.warn(format!("{field}.default"), "not one of the allowed values");
    }

    Some(def)
}

fn validate_dependencies(value: &YamlValue, issues: &mut Issues) -> Vec<DependencySpec> {
    let YamlValue::Sequence(items) = value else {
        issues.warn("dependencies", format!("expected a list, got {}; dropped", kind_of(value)));
        return Vec::new();
    };

    let mut dependencies = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let field = format!("dependencies[{i}]");
        match item {
            YamlValue::String(s) if !s.trim().is_empty() => {
                dependencies.push(DependencySpec::Simple(s.trim().to_string()));
            }
            YamlValue::Mapping(map) => {
                if let Some(entry) = validate_dependency_entry(&field, map, issues) {
                    dependencies.push(DependencySpec::Detailed(entry));
                }
            }
            other => issues.warn(
                field,
                format!("expected a name or a mapping, got {}; dropped", kind_of(other)),
            ),
        }
    }
    dependencies
}

fn validate_dependency_entry(
    field: &str,
    map: &Mapping,
    issues: &mut Issues,
) -> Option<DependencyEntry> {
    let Some(name) = map.get("name").and_then(YamlValue::as_str).filter(|s| !s.is_empty()) else {
        issues.warn(field, "dependency without a name; dropped");
        return None;
    };

    let mut entry = DependencyEntry {
        name: name.to_string(),
        version: None,
        dep_type: None,
        url: None,
        optional: false,
        dev: false,
    };

    for (key, item) in string_keys(map) {
        let sub = format!("{field}.{key}");
        match key {
            "name" => {}
            "version" => entry.version = scalar_string(item),
            "url" => entry.url = item.as_str().map(str::to_string),
            "type" => match item.as_str().map(str::parse::<DependencyType>) {
                Some(Ok(t)) => entry.dep_type = Some(t),
                Some(Err(e)) => {
                    issues.warn(sub, format!("{e}; dependency dropped"));
                    return None;
                }
                None => {
                    issues.warn(sub, "expected a string; dependency dropped");
                    return None;
                }
            },
            "optional" | "dev" => match item.as_bool() {
                Some(b) if key == "optional" => entry.optional = b,
                Some(b) => entry.dev = b,
                None => issues.warn(sub, "expected a boolean; dropped"),
            },
            other => issues.warn(format!("{field}.{other}"), "unknown field ignored"),
        }
    }

    if entry.url.is_none()
        && matches!(entry.dep_type, Some(DependencyType::Local | DependencyType::Http))
    {
        issues.warn(format!("{field}.url"), "no url given; the name is used as the reference");
    }

    Some(entry)
}

fn validate_extends(value: Option<&YamlValue>, issues: &mut Issues) -> Option<String> {
    match value? {
        YamlValue::Null => None,
        YamlValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        YamlValue::Sequence(items) if items.len() > 1 => {
            issues.error("extends", "only one parent template may be extended");
            None
        }
        YamlValue::Sequence(items) => {
            let single = items.first().and_then(YamlValue::as_str).map(str::to_string);
            if single.is_some() {
                issues.warn("extends", "expected a single reference, not a list");
            }
            single
        }
        other => {
            issues.warn("extends", format!("expected a reference, got {}; dropped", kind_of(other)));
            None
        }
    }
}

fn validate_includes(value: &YamlValue, issues: &mut Issues) -> Vec<Include> {
    let YamlValue::Sequence(items) = value else {
        issues.warn("includes", format!("expected a list, got {}; dropped", kind_of(value)));
        return Vec::new();
    };

    let mut includes = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let field = format!("includes[{i}]");
        match item {
            YamlValue::String(url) if !url.trim().is_empty() => {
                includes.push(Include::new(url.trim()));
            }
            YamlValue::Mapping(map) => {
                let Some(url) = map.get("url").and_then(YamlValue::as_str).filter(|s| !s.is_empty())
                else {
                    issues.warn(format!("{field}.url"), "include without a url; dropped");
                    continue;
                };
                let mut include = Include::new(url.trim());
                for (key, entry) in string_keys(map) {
                    let sub = format!("{field}.{key}");
                    match key {
                        "url" => {}
                        "version" => include.version = scalar_string(entry),
                        "variables" => include.variables = json_map(entry, &sub, issues),
                        "condition" => match entry.as_str() {
                            Some(text) => {
                                issues.check_expression(&sub, text);
                                include.condition = Some(text.to_string());
                            }
                            None => issues.warn(sub, "expected an expression string; dropped"),
                        },
                        "strategy" => match entry.as_str().map(str::parse::<ConflictStrategy>) {
                            Some(Ok(strategy)) => include.strategy = Some(strategy),
                            Some(Err(e)) => issues.warn(sub, format!("{e}; default strategy used")),
                            None => issues.warn(sub, "expected a string; default strategy used"),
                        },
                        other => issues.warn(format!("{field}.{other}"), "unknown field ignored"),
                    }
                }
                includes.push(include);
            }
            other => issues.warn(
                field,
                format!("expected a reference or a mapping, got {}; dropped", kind_of(other)),
            ),
        }
    }
    includes
}

fn validate_hooks(value: &YamlValue, issues: &mut Issues) -> Hooks {
    let YamlValue::Mapping(map) = value else {
        issues.warn("hooks", format!("expected a mapping, got {}; dropped", kind_of(value)));
        return Hooks::default();
    };

    let mut hooks = Hooks::default();
    for (key, item) in string_keys(map) {
        let field = format!("hooks.{key}");
        match key {
            "pre" => hooks.pre = string_list(item, &field, issues),
            "post" => hooks.post = string_list(item, &field, issues),
            "error" => hooks.error = string_list(item, &field, issues),
            _ => issues.warn(field, "unknown hook ignored"),
        }
    }
    hooks
}

fn validate_settings(value: &YamlValue, issues: &mut Issues) -> Settings {
    let YamlValue::Mapping(map) = value else {
        issues.warn("settings", format!("expected a mapping, got {}; dropped", kind_of(value)));
        return Settings::default();
    };

    let mut settings = Settings::default();
    for (key, item) in string_keys(map) {
        let field = format!("settings.{key}");
        match key {
            "timeout" => match item.as_u64().filter(|t| *t > 0) {
                Some(t) => settings.timeout = Some(t),
                None => issues.warn(field, "expected a positive integer; dropped"),
            },
            "retries" => match item.as_u64().and_then(|r| u32::try_from(r).ok()) {
                Some(r) => settings.retries = Some(r),
                None => issues.warn(field, "expected a non-negative integer; dropped"),
            },
            "maxParallelSteps" => {
                match item.as_u64().filter(|n| *n > 0).and_then(|n| usize::try_from(n).ok()) {
                    Some(n) => settings.max_parallel_steps = Some(n),
                    None => issues.warn(field, "expected a positive integer; dropped"),
                }
            }
            _ => issues.warn(field, "unknown setting ignored"),
        }
    }
    settings
}

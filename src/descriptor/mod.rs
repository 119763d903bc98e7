//! Template descriptors and their validation.
//!
//! A descriptor is the YAML document (`template.yaml`) that defines one
//! template: its identity, the variables it takes, the generation steps a
//! separate execution engine would run, its external dependencies and the
//! composition directives (`extends`, `includes`) that pull in other
//! templates.
//!
//! # Module Structure
//!
//! - [`parser`] - YAML loading and field-by-field validation into a [`ParsedTemplate`]
//! - [`steps`] - step validation, tool inference and `dependsOn` cycle detection
//! - [`dependency`] - dependency entries in their string and object forms
//! - [`expression`] - the restricted evaluator for `when` and `condition`
//!
//! # Descriptor Format
//!
//! ```yaml
//! name: react-app
//! version: 1.2.0
//! extends: base
//! tags: [web, react]
//!
//! variables:
//!   projectName:
//!     type: string
//!     required: true
//!     pattern: "^[a-z][a-z0-9-]*$"
//!   port:
//!     type: number
//!     default: 3000
//!     min: 1
//!     max: 65535
//!
//! steps:
//!   - name: scaffold
//!     template: templates/app
//!   - name: install
//!     command: npm install
//!     dependsOn: [scaffold]
//!     when: "skipInstall != true"
//!
//! dependencies:
//!   - react@^18.0.0
//!   - name: shared-config
//!     type: local
//!     url: ./shared
//!
//! includes:
//!   - url: acme/templates/eslint
//!     condition: "lint == true"
//!     strategy: extend
//! ```
//!
//! Parsing never stops at the first bad field: errors and warnings are
//! accumulated and returned together with whatever descriptor could be
//! built, see [`ParsedTemplate`].

pub mod dependency;
pub mod expression;
pub mod parser;
pub mod steps;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::compose::ConflictStrategy;
use crate::constants::DESCRIPTOR_FILE_NAMES;

pub use dependency::{Dependency, DependencyEntry, DependencySpec, DependencyType};
pub use parser::DescriptorParser;
pub use steps::StepGraph;

/// A validated template descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Variable definitions keyed by variable name
    #[serde(default)]
    pub variables: BTreeMap<String, VariableDefinition>,
    /// Steps in declared order
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    /// Paths this template produces
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Single parent template reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default)]
    pub includes: Vec<Include>,
    #[serde(default)]
    pub hooks: Hooks,
    #[serde(default)]
    pub settings: Settings,
}

impl TemplateDescriptor {
    /// An otherwise empty descriptor with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Default values of all variables that declare one.
    ///
    /// This is the base layer of the context include conditions are
    /// evaluated against.
    #[must_use]
    pub fn variable_defaults(&self) -> Map<String, Value> {
        self.variables
            .iter()
            .filter_map(|(name, def)| def.default.clone().map(|value| (name.clone(), value)))
            .collect()
    }

    /// Look up a step by name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.name == name)
    }
}

/// Supported variable types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Enum,
    Array,
    Object,
    File,
    Directory,
}

impl VariableType {
    pub const ALL: [Self; 8] = [
        Self::String,
        Self::Number,
        Self::Boolean,
        Self::Enum,
        Self::Array,
        Self::Object,
        Self::File,
        Self::Directory,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Enum => "enum",
            Self::Array => "array",
            Self::Object => "object",
            Self::File => "file",
            Self::Directory => "directory",
        }
    }

    /// Whether `value` is an acceptable default for this type.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String | Self::File | Self::Directory => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Enum => value.is_string() || value.is_number() || value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariableType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown variable type '{s}'"))
    }
}

/// Definition of one template variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDefinition {
    #[serde(rename = "type")]
    pub var_type: VariableType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Regex the value must match (string only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Allowed values (enum only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Question shown by interactive front ends
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl VariableDefinition {
    /// A bare definition of the given type.
    #[must_use]
    pub const fn new(var_type: VariableType) -> Self {
        Self {
            var_type,
            description: None,
            required: false,
            default: None,
            pattern: None,
            values: None,
            min: None,
            max: None,
            prompt: None,
        }
    }

    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// The kind of generation tool a step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Template,
    Action,
    Codemod,
    Recipe,
    Shell,
}

impl ToolKind {
    pub const ALL: [Self; 5] =
        [Self::Template, Self::Action, Self::Codemod, Self::Recipe, Self::Shell];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::Action => "action",
            Self::Codemod => "codemod",
            Self::Recipe => "recipe",
            Self::Shell => "shell",
        }
    }

    /// The step key whose presence implies this tool when `tool` is omitted.
    #[must_use]
    pub const fn shorthand_key(self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::Action => "action",
            Self::Codemod => "codemod",
            Self::Recipe => "recipe",
            Self::Shell => "command",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown tool '{s}'"))
    }
}

/// Tool-specific step configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "lowercase")]
pub enum ToolConfig {
    Template {
        template: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        engine: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        files: Vec<String>,
    },
    Action {
        action: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        args: BTreeMap<String, Value>,
    },
    Codemod {
        codemod: String,
        files: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        params: BTreeMap<String, Value>,
    },
    Recipe {
        recipe: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        variables: BTreeMap<String, Value>,
    },
    Shell {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
}

impl ToolConfig {
    #[must_use]
    pub const fn kind(&self) -> ToolKind {
        match self {
            Self::Template { .. } => ToolKind::Template,
            Self::Action { .. } => ToolKind::Action,
            Self::Codemod { .. } => ToolKind::Codemod,
            Self::Recipe { .. } => ToolKind::Recipe,
            Self::Shell { .. } => ToolKind::Shell,
        }
    }
}

/// One unit of generation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    #[serde(flatten)]
    pub config: ToolConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub continue_on_error: bool,
    /// Timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl Step {
    /// A step with no ordering constraints.
    pub fn new(name: impl Into<String>, config: ToolConfig) -> Self {
        Self {
            name: name.into(),
            config,
            depends_on: Vec::new(),
            when: None,
            parallel: false,
            continue_on_error: false,
            timeout: None,
            retries: None,
        }
    }

    #[must_use]
    pub const fn tool(&self) -> ToolKind {
        self.config.kind()
    }
}

/// A conditionally included sub-template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Include {
    /// Reference to the included template
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Variable overrides applied when the include is merged
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Conflict strategy; the composition default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ConflictStrategy>,
}

impl Include {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            version: None,
            variables: BTreeMap::new(),
            condition: None,
            strategy: None,
        }
    }
}

/// Lifecycle hook commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error: Vec<String>,
}

impl Hooks {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty() && self.error.is_empty()
    }
}

/// Execution settings for the step runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Overall timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_steps: Option<usize>,
}

/// A single validation finding with the dotted path of the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Result of parsing one descriptor.
///
/// `descriptor` holds everything that validated; `is_valid` is false when
/// any fatal error was collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTemplate {
    pub descriptor: TemplateDescriptor,
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ParsedTemplate {
    /// Errors rendered as `field: message` strings.
    #[must_use]
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

/// Find the descriptor file for `path`.
///
/// A file path is returned as is; a directory is searched for the
/// conventional descriptor names in order.
#[must_use]
pub fn locate_descriptor(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    if path.is_dir() {
        return DESCRIPTOR_FILE_NAMES.iter().map(|name| path.join(name)).find(|p| p.is_file());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_variable_type_from_str() {
        assert_eq!("number".parse::<VariableType>().unwrap(), VariableType::Number);
        assert_eq!("directory".parse::<VariableType>().unwrap(), VariableType::Directory);
        assert!("integer".parse::<VariableType>().is_err());
    }

    #[test]
    fn test_variable_type_accepts() {
        assert!(VariableType::Number.accepts(&json!(3000)));
        assert!(!VariableType::Number.accepts(&json!("3000")));
        assert!(VariableType::File.accepts(&json!("./a.txt")));
        assert!(VariableType::Array.accepts(&json!([])));
    }

    #[test]
    fn test_variable_defaults() {
        let mut descriptor = TemplateDescriptor::new("app");
        descriptor.variables.insert(
            "port".to_string(),
            VariableDefinition::new(VariableType::Number).with_default(json!(3000)),
        );
        descriptor
            .variables
            .insert("name".to_string(), VariableDefinition::new(VariableType::String));

        let defaults = descriptor.variable_defaults();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults["port"], json!(3000));
    }

    #[test]
    fn test_step_serializes_flat() {
        let step = Step::new(
            "install",
            ToolConfig::Shell {
                command: "npm install".to_string(),
                cwd: None,
                env: BTreeMap::new(),
            },
        );
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["tool"], "shell");
        assert_eq!(value["command"], "npm install");
        assert_eq!(step.tool(), ToolKind::Shell);
    }

    #[test]
    fn test_locate_descriptor() {
        let temp = TempDir::new().unwrap();
        assert!(locate_descriptor(temp.path()).is_none());

        std::fs::write(temp.path().join("template.yml"), "name: a").unwrap();
        assert_eq!(locate_descriptor(temp.path()).unwrap(), temp.path().join("template.yml"));

        std::fs::write(temp.path().join("template.yaml"), "name: a").unwrap();
        assert_eq!(locate_descriptor(temp.path()).unwrap(), temp.path().join("template.yaml"));

        let file = temp.path().join("template.yml");
        assert_eq!(locate_descriptor(&file).unwrap(), file);
    }

    #[test]
    fn test_validation_issue_display() {
        assert_eq!(
            ValidationIssue::new("variables.port", "missing type").to_string(),
            "variables.port: missing type"
        );
        assert_eq!(ValidationIssue::new("", "empty").to_string(), "empty");
    }
}

//! Step validation and the `dependsOn` graph.
//!
//! Steps name their tool explicitly (`tool: shell`) or through a shorthand
//! key (`command: npm install`). Each tool has its own required fields.
//! After the individual steps are validated the `dependsOn` edges are
//! checked: references to unknown steps are warnings, and a cycle is a
//! fatal error reported once with its full path.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_yaml::{Mapping, Value as YamlValue};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::parser::{Issues, json_map, kind_of, string_keys, string_list, suggest};
use super::{Step, ToolConfig, ToolKind};

const COMMON_STEP_KEYS: &[&str] = &[
    "name",
    "tool",
    "description",
    "dependsOn",
    "when",
    "parallel",
    "continueOnError",
    "timeout",
    "retries",
];

/// Keys owned by each tool's configuration.
const fn tool_keys(kind: ToolKind) -> &'static [&'static str] {
    match kind {
        ToolKind::Template => &["template", "engine", "files"],
        ToolKind::Action => &["action", "args"],
        ToolKind::Codemod => &["codemod", "files", "params"],
        ToolKind::Recipe => &["recipe", "variables"],
        ToolKind::Shell => &["command", "cwd", "env"],
    }
}

/// DFS visit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Directed graph of steps with an edge from each step to the steps it
/// depends on.
pub struct StepGraph {
    graph: DiGraph<String, ()>,
    node_map: HashMap<String, NodeIndex>,
}

impl StepGraph {
    /// Build the graph from validated steps. Edges to unknown steps are skipped.
    #[must_use]
    pub fn from_steps(steps: &[Step]) -> Self {
        let mut graph = DiGraph::new();
        let mut node_map = HashMap::new();
        for step in steps {
            node_map
                .entry(step.name.clone())
                .or_insert_with(|| graph.add_node(step.name.clone()));
        }
        for step in steps {
            let from = node_map[&step.name];
            for dep in &step.depends_on {
                if let Some(&to) = node_map.get(dep)
                    && !graph.contains_edge(from, to)
                {
                    graph.add_edge(from, to, ());
                }
            }
        }
        Self { graph, node_map }
    }

    /// Find a dependency cycle.
    ///
    /// Returns the cycle path closed with its first step repeated
    /// (`a → b → a`), or `None` when the graph is acyclic. Traversal starts
    /// from steps in declared order, so the result is deterministic.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut colors: HashMap<NodeIndex, Color> =
            self.graph.node_indices().map(|n| (n, Color::White)).collect();
        let mut path = Vec::new();

        for node in self.graph.node_indices() {
            if colors.get(&node) == Some(&Color::White)
                && let Some(cycle) = self.dfs_visit(node, &mut colors, &mut path)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_visit(
        &self,
        node: NodeIndex,
        colors: &mut HashMap<NodeIndex, Color>,
        path: &mut Vec<NodeIndex>,
    ) -> Option<Vec<String>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        let mut neighbors: Vec<NodeIndex> = self.graph.neighbors(node).collect();
        neighbors.sort_unstable();

        for neighbor in neighbors {
            match colors.get(&neighbor) {
                Some(Color::Gray) => {
                    let start = path.iter().position(|n| *n == neighbor).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|n| self.graph[*n].clone()).collect();
                    cycle.push(self.graph[neighbor].clone());
                    return Some(cycle);
                }
                Some(Color::White) => {
                    if let Some(cycle) = self.dfs_visit(neighbor, colors, path) {
                        return Some(cycle);
                    }
                }
                _ => {}
            }
        }

        path.pop();
        colors.insert(node, Color::Black);
        None
    }

    /// Step names ordered so every step follows the steps it depends on.
    ///
    /// Returns `None` when the graph has a cycle.
    #[must_use]
    pub fn execution_order(&self) -> Option<Vec<String>> {
        toposort(&self.graph, None)
            .ok()
            .map(|indices| indices.into_iter().rev().map(|idx| self.graph[idx].clone()).collect())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.node_map.contains_key(name)
    }
}

/// Cycle path rendered the way it is reported: `a → b → a`.
#[must_use]
pub fn format_cycle(cycle: &[String]) -> String {
    cycle.join(" → ")
}

fn required_string(
    map: &Mapping,
    key: &str,
    field: &str,
    kind: ToolKind,
    issues: &mut Issues,
) -> Option<String> {
    match map.get(key) {
        Some(YamlValue::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(YamlValue::String(_) | YamlValue::Null) => {
            issues.error(format!("{field}.{key}"), format!("must not be empty for {kind} steps"));
            None
        }
        Some(other) => {
            issues.error(format!("{field}.{key}"), format!("must be a string, got {}", kind_of(other)));
            None
        }
        None => {
            issues.error(format!("{field}.{key}"), format!("required for {kind} steps"));
            None
        }
    }
}

fn optional_str(map: &Mapping, key: &str, field: &str, issues: &mut Issues) -> Option<String> {
    match map.get(key)? {
        YamlValue::String(s) => Some(s.clone()),
        other => {
            issues.warn(format!("{field}.{key}"), format!("expected a string, got {}; dropped", kind_of(other)));
            None
        }
    }
}

fn tool_config(
    kind: ToolKind,
    map: &Mapping,
    field: &str,
    issues: &mut Issues,
) -> Option<ToolConfig> {
    let list = |key: &str, issues: &mut Issues| {
        map.get(key).map(|v| string_list(v, &format!("{field}.{key}"), issues)).unwrap_or_default()
    };
    let object = |key: &str, issues: &mut Issues| {
        map.get(key).map(|v| json_map(v, &format!("{field}.{key}"), issues)).unwrap_or_default()
    };

    let config = match kind {
        ToolKind::Template => ToolConfig::Template {
            template: required_string(map, "template", field, kind, issues)?,
            engine: optional_str(map, "engine", field, issues),
            files: list("files", issues),
        },
        ToolKind::Action => ToolConfig::Action {
            action: required_string(map, "action", field, kind, issues)?,
            args: object("args", issues),
        },
        ToolKind::Codemod => {
            let codemod = required_string(map, "codemod", field, kind, issues);
            let files = list("files", issues);
            if files.is_empty() {
                issues.error(format!("{field}.files"), "codemod steps require at least one file");
            }
            let codemod = codemod?;
            if files.is_empty() {
                return None;
            }
            ToolConfig::Codemod {
                codemod,
                files,
                params: object("params", issues),
            }
        }
        ToolKind::Recipe => ToolConfig::Recipe {
            recipe: required_string(map, "recipe", field, kind, issues)?,
            variables: object("variables", issues),
        },
        ToolKind::Shell => {
            let command = required_string(map, "command", field, kind, issues)?;
            let env = object("env", issues)
                .into_iter()
                .filter_map(|(key, value)| match value {
                    serde_json::Value::String(s) => Some((key, s)),
                    serde_json::Value::Number(_) | serde_json::Value::Bool(_) => {
                        Some((key, value.to_string()))
                    }
                    _ => {
                        issues.warn(format!("{field}.env.{key}"), "expected a scalar; dropped");
                        None
                    }
                })
                .collect::<BTreeMap<_, _>>();
            ToolConfig::Shell {
                command,
                cwd: optional_str(map, "cwd", field, issues),
                env,
            }
        }
    };
    Some(config)
}

/// Determine the tool: explicit `tool`, else the first shorthand key present.
fn step_tool(map: &Mapping, field: &str, issues: &mut Issues) -> Option<ToolKind> {
    match map.get("tool") {
        Some(YamlValue::String(s)) => match s.parse::<ToolKind>() {
            Ok(kind) => Some(kind),
            Err(e) => {
                let hint = suggest(s, ToolKind::ALL.iter().map(|t| t.as_str()))
                    .map(|s| format!(" (did you mean '{s}'?)"))
                    .unwrap_or_default();
                issues.error(format!("{field}.tool"), format!("{e}{hint}"));
                None
            }
        },
        Some(other) => {
            issues.error(format!("{field}.tool"), format!("must be a string, got {}", kind_of(other)));
            None
        }
        None => {
            let inferred =
                ToolKind::ALL.into_iter().find(|kind| map.contains_key(kind.shorthand_key()));
            if inferred.is_none() {
                issues.error(
                    format!("{field}.tool"),
                    "cannot infer the tool; set `tool` or one of template, action, codemod, recipe, command",
                );
            }
            inferred
        }
    }
}

fn validate_step(
    index: usize,
    value: &YamlValue,
    seen: &mut HashSet<String>,
    issues: &mut Issues,
) -> Option<Step> {
    let YamlValue::Mapping(map) = value else {
        issues.error(format!("steps[{index}]"), format!("step must be a mapping, got {}", kind_of(value)));
        return None;
    };

    let name = match map.get("name") {
        Some(YamlValue::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => {
            issues.error(format!("steps[{index}].name"), "required field is missing");
            return None;
        }
    };
    let field = format!("steps.{name}");

    if !seen.insert(name.clone()) {
        issues.error(format!("{field}.name"), format!("duplicate step name '{name}'"));
        return None;
    }

    let tool = step_tool(map, &field, issues)?;
    let owned = tool_keys(tool);

    for (key, _) in string_keys(map) {
        if COMMON_STEP_KEYS.contains(&key) || owned.contains(&key) {
            continue;
        }
        if ToolKind::ALL.iter().any(|kind| tool_keys(*kind).contains(&key)) {
            issues.warn(format!("{field}.{key}"), format!("does not apply to {tool} steps; ignored"));
        } else {
            issues.warn(format!("{field}.{key}"), "unknown field ignored");
        }
    }

    let config = tool_config(tool, map, &field, issues)?;
    let mut step = Step::new(name, config);

    if let Some(value) = map.get("dependsOn") {
        step.depends_on = string_list(value, &format!("{field}.dependsOn"), issues);
    }

    match map.get("when") {
        Some(YamlValue::String(text)) => {
            issues.check_expression(&format!("{field}.when"), text);
            step.when = Some(text.clone());
        }
        Some(other) => issues.warn(
            format!("{field}.when"),
            format!("expected an expression string, got {}; dropped", kind_of(other)),
        ),
        None => {}
    }

    for key in ["parallel", "continueOnError"] {
        match map.get(key).map(YamlValue::as_bool) {
            Some(Some(flag)) if key == "parallel" => step.parallel = flag,
            Some(Some(flag)) => step.continue_on_error = flag,
            Some(None) => issues.warn(format!("{field}.{key}"), "expected a boolean; dropped"),
            None => {}
        }
    }

    if let Some(value) = map.get("timeout") {
        match value.as_u64().filter(|t| *t > 0) {
            Some(t) => step.timeout = Some(t),
            None => issues.warn(format!("{field}.timeout"), "expected a positive integer; dropped"),
        }
    }
    if let Some(value) = map.get("retries") {
        match value.as_u64().and_then(|r| u32::try_from(r).ok()) {
            Some(r) => step.retries = Some(r),
            None => issues.warn(format!("{field}.retries"), "expected a non-negative integer; dropped"),
        }
    }

    Some(step)
}

/// Validate the `steps` list, then its `dependsOn` references and cycles.
pub(super) fn validate_steps(value: &YamlValue, issues: &mut Issues) -> Vec<Step> {
    let items = match value {
        YamlValue::Sequence(items) => items,
        YamlValue::Null => return Vec::new(),
        other => {
            issues.error("steps", format!("must be a list, got {}", kind_of(other)));
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let steps: Vec<Step> = items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| validate_step(i, item, &mut seen, issues))
        .collect();

    let graph = StepGraph::from_steps(&steps);
    for step in &steps {
        for dep in &step.depends_on {
            if graph.contains(dep) {
                continue;
            }
            let hint = suggest(dep, steps.iter().map(|s| s.name.as_str()))
                .map(|s| format!(" (did you mean '{s}'?)"))
                .unwrap_or_default();
            issues.warn(
                format!("steps.{}.dependsOn", step.name),
                format!("unknown step '{dep}'{hint}"),
            );
        }
    }

    if let Some(cycle) = graph.find_cycle() {
        issues.error("steps", format!("circular dependsOn detected: {}", format_cycle(&cycle)));
    }

    steps
}

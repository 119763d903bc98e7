//! Merging descriptors during composition.
//!
//! Two operations build the composed descriptor:
//!
//! - [`inherit`] lays a child over its `extends` parent. The child always
//!   wins; every collision is logged.
//! - [`apply_include`] folds an included template into the accumulator under
//!   one [`ConflictStrategy`].
//!
//! [`deduplicate`] is the final pass over the composed result.
//!
//! Keyed categories (variables, steps, dependencies) collide when the same
//! key carries a different value; identical redeclarations never conflict.
//! Dependencies are keyed by name and type, so a registry package and a
//! local path of the same name both survive and surface later as a
//! dependency conflict.
//! List categories (tags, outputs) never conflict.

use std::collections::{BTreeMap, HashSet};

use super::{
    ConflictDecision, ConflictHandler, ConflictKind, ConflictRecord, ConflictResolution,
    ConflictStrategy, PendingConflict,
};
use crate::core::CompositionError;
use crate::descriptor::{
    DependencySpec, DependencyType, Step, TemplateDescriptor, VariableDefinition,
};

/// Who is merging into whom, under which rules.
pub struct MergeScope<'a> {
    pub strategy: ConflictStrategy,
    /// Label of the template being merged into
    pub existing_source: &'a str,
    /// Label of the template being merged in
    pub incoming_source: &'a str,
    pub handler: Option<&'a dyn ConflictHandler>,
    pub conflicts: &'a mut Vec<ConflictRecord>,
}

impl MergeScope<'_> {
    fn record(&mut self, kind: ConflictKind, name: &str, resolution: ConflictResolution) {
        tracing::debug!(
            "{} '{}' collided between '{}' and '{}': {}",
            kind,
            name,
            self.existing_source,
            self.incoming_source,
            resolution
        );
        self.conflicts.push(ConflictRecord {
            kind,
            name: name.to_string(),
            sources: vec![self.existing_source.to_string(), self.incoming_source.to_string()],
            strategy: Some(self.strategy),
            resolution,
        });
    }

    fn conflict_error(&self, kind: ConflictKind, name: &str) -> CompositionError {
        CompositionError::Conflict {
            kind,
            name: name.to_string(),
            source_ref: self.incoming_source.to_string(),
            strategy: self.strategy,
        }
    }

    /// Decide a keyed collision. Only called for non-replace strategies.
    fn decide(&self, kind: ConflictKind, name: &str) -> Result<ConflictDecision, CompositionError> {
        match self.strategy {
            ConflictStrategy::Merge | ConflictStrategy::Replace => Ok(ConflictDecision::UseIncoming),
            ConflictStrategy::Extend => Ok(ConflictDecision::KeepExisting),
            ConflictStrategy::Fail | ConflictStrategy::Error => Err(self.conflict_error(kind, name)),
            ConflictStrategy::Prompt => {
                let Some(handler) = self.handler else {
                    return Err(self.conflict_error(kind, name));
                };
                let decision = handler.resolve(&PendingConflict {
                    kind,
                    name,
                    existing_source: self.existing_source,
                    incoming_source: self.incoming_source,
                });
                match decision {
                    ConflictDecision::Abort => Err(self.conflict_error(kind, name)),
                    other => Ok(other),
                }
            }
        }
    }

    /// Merge a keyed category in place.
    fn merge_keyed<T, Q, K>(
        &mut self,
        kind: ConflictKind,
        existing: &mut Vec<T>,
        incoming: &[T],
        key: K,
    ) -> Result<(), CompositionError>
    where
        T: Clone + PartialEq,
        Q: MergeKey,
        K: Fn(&T) -> Q,
    {
        if self.strategy == ConflictStrategy::Replace {
            if incoming.is_empty() {
                return Ok(());
            }
            let replaced: Vec<Q> = incoming
                .iter()
                .map(&key)
                .filter(|k| existing.iter().any(|e| key(e) == *k))
                .collect();
            for item_key in replaced {
                self.record(kind, item_key.label(), ConflictResolution::Replaced);
            }
            *existing = incoming.to_vec();
            return Ok(());
        }

        for item in incoming {
            let item_key = key(item);
            let name = item_key.label();
            match existing.iter().position(|e| key(e) == item_key) {
                None => existing.push(item.clone()),
                Some(index) if existing[index] == *item => {}
                Some(index) => match self.decide(kind, name)? {
                    ConflictDecision::UseIncoming => {
                        existing[index] = item.clone();
                        self.record(kind, name, ConflictResolution::Overridden);
                    }
                    ConflictDecision::KeepExisting | ConflictDecision::Abort => {
                        self.record(kind, name, ConflictResolution::KeptExisting);
                    }
                },
            }
        }
        Ok(())
    }

    /// Merge a plain list category in place.
    fn merge_list(&self, existing: &mut Vec<String>, incoming: &[String]) {
        match self.strategy {
            ConflictStrategy::Replace => {
                if !incoming.is_empty() {
                    *existing = incoming.to_vec();
                }
            }
            ConflictStrategy::Extend => existing.extend(incoming.iter().cloned()),
            _ => {
                for item in incoming {
                    if !existing.contains(item) {
                        existing.push(item.clone());
                    }
                }
            }
        }
    }
}

fn variable_pairs(map: &BTreeMap<String, VariableDefinition>) -> Vec<(String, VariableDefinition)> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Identity of an item in a keyed category.
trait MergeKey: PartialEq {
    /// Name used when reporting a collision
    fn label(&self) -> &str;
}

impl MergeKey for String {
    fn label(&self) -> &str {
        self
    }
}

#[derive(Debug, PartialEq, Eq)]
struct DependencyKey {
    name: String,
    dep_type: DependencyType,
}

impl MergeKey for DependencyKey {
    fn label(&self) -> &str {
        &self.name
    }
}

fn dependency_key(spec: &DependencySpec) -> DependencyKey {
    let dependency = spec.normalize();
    DependencyKey {
        name: dependency.name,
        dep_type: dependency.dep_type,
    }
}

fn step_key(step: &Step) -> String {
    step.name.clone()
}

/// Fold `incoming` into `accumulator` under the scope's strategy.
///
/// Variables, dependencies, steps, outputs and tags are merged. Identity,
/// hooks and settings of the accumulator are left alone.
///
/// # Errors
///
/// Returns [`CompositionError::Conflict`] on the first collision under
/// `fail`/`error`, or under `prompt` without a handler or when the handler
/// aborts.
pub fn apply_include(
    accumulator: &mut TemplateDescriptor,
    incoming: &TemplateDescriptor,
    scope: &mut MergeScope<'_>,
) -> Result<(), CompositionError> {
    let mut variables = variable_pairs(&accumulator.variables);
    scope.merge_keyed(
        ConflictKind::Variable,
        &mut variables,
        &variable_pairs(&incoming.variables),
        |(name, _)| name.clone(),
    )?;
    accumulator.variables = variables.into_iter().collect();

    scope.merge_keyed(
        ConflictKind::Dependency,
        &mut accumulator.dependencies,
        &incoming.dependencies,
        dependency_key,
    )?;
    scope.merge_keyed(ConflictKind::Step, &mut accumulator.steps, &incoming.steps, step_key)?;

    scope.merge_list(&mut accumulator.outputs, &incoming.outputs);
    scope.merge_list(&mut accumulator.tags, &incoming.tags);
    Ok(())
}

/// Lay `child` over its composed `parent`.
///
/// Child identity fields win when set. Variables and dependencies are
/// child-over-parent. Parent steps come first, and a child step with the
/// same name takes the parent step's place. Hooks concatenate parent first
/// and settings are child-over-parent per field. The result keeps the
/// child's `includes` and has no `extends`.
#[must_use]
pub fn inherit(
    parent: TemplateDescriptor,
    child: TemplateDescriptor,
    parent_source: &str,
    child_source: &str,
    strategy: ConflictStrategy,
    conflicts: &mut Vec<ConflictRecord>,
) -> TemplateDescriptor {
    let mut record = |kind: ConflictKind, name: &str| {
        tracing::debug!("'{}' overrides {} '{}' of '{}'", child_source, kind, name, parent_source);
        conflicts.push(ConflictRecord {
            kind,
            name: name.to_string(),
            sources: vec![parent_source.to_string(), child_source.to_string()],
            strategy: Some(strategy),
            resolution: ConflictResolution::Overridden,
        });
    };

    let mut variables = parent.variables;
    for (name, definition) in child.variables {
        if variables.get(&name).is_some_and(|existing| *existing != definition) {
            record(ConflictKind::Variable, &name);
        }
        variables.insert(name, definition);
    }

    let mut steps = parent.steps;
    for step in child.steps {
        match steps.iter().position(|s| s.name == step.name) {
            Some(index) => {
                if steps[index] != step {
                    record(ConflictKind::Step, &step.name);
                }
                steps[index] = step;
            }
            None => steps.push(step),
        }
    }

    let mut dependencies = parent.dependencies;
    for dependency in child.dependencies {
        let key = dependency_key(&dependency);
        match dependencies.iter().position(|d| dependency_key(d) == key) {
            Some(index) => {
                if dependencies[index] != dependency {
                    record(ConflictKind::Dependency, key.label());
                }
                dependencies[index] = dependency;
            }
            None => dependencies.push(dependency),
        }
    }

    let mut tags = parent.tags;
    tags.extend(child.tags);
    let mut outputs = parent.outputs;
    outputs.extend(child.outputs);

    let mut hooks = parent.hooks;
    hooks.pre.extend(child.hooks.pre);
    hooks.post.extend(child.hooks.post);
    hooks.error.extend(child.hooks.error);

    let settings = crate::descriptor::Settings {
        timeout: child.settings.timeout.or(parent.settings.timeout),
        retries: child.settings.retries.or(parent.settings.retries),
        max_parallel_steps: child.settings.max_parallel_steps.or(parent.settings.max_parallel_steps),
    };

    TemplateDescriptor {
        name: child.name,
        version: child.version.or(parent.version),
        description: child.description.or(parent.description),
        author: child.author.or(parent.author),
        category: child.category.or(parent.category),
        tags,
        variables,
        steps,
        dependencies,
        outputs,
        extends: None,
        includes: child.includes,
        hooks,
        settings,
    }
}

/// Final pass: drop duplicate dependencies by (name, type), outputs and tags.
///
/// The first occurrence wins. Dependencies that collapse while differing in
/// version or URL are logged as conflicts.
pub fn deduplicate(descriptor: &mut TemplateDescriptor, conflicts: &mut Vec<ConflictRecord>) {
    let mut kept: Vec<DependencySpec> = Vec::with_capacity(descriptor.dependencies.len());
    for spec in std::mem::take(&mut descriptor.dependencies) {
        let dependency = spec.normalize();
        let duplicate = kept.iter().find(|k| {
            let existing = k.normalize();
            existing.name == dependency.name && existing.dep_type == dependency.dep_type
        });
        match duplicate {
            Some(existing) => {
                if existing.normalize() != dependency {
                    conflicts.push(ConflictRecord {
                        kind: ConflictKind::Dependency,
                        name: dependency.name.clone(),
                        sources: vec![descriptor.name.clone()],
                        strategy: None,
                        resolution: ConflictResolution::Deduplicated,
                    });
                }
            }
            None => kept.push(spec),
        }
    }
    descriptor.dependencies = kept;

    dedup_strings(&mut descriptor.outputs);
    dedup_strings(&mut descriptor.tags);
}

fn dedup_strings(items: &mut Vec<String>) {
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Dependency, DependencyType, ToolConfig, VariableType};
    use serde_json::json;

    fn with_tags(name: &str, tags: &[&str]) -> TemplateDescriptor {
        let mut descriptor = TemplateDescriptor::new(name);
        descriptor.tags = tags.iter().map(|t| (*t).to_string()).collect();
        descriptor
    }

    fn number(default: i64) -> VariableDefinition {
        VariableDefinition::new(VariableType::Number).with_default(json!(default))
    }

    fn shell(name: &str, command: &str) -> Step {
        Step::new(
            name,
            ToolConfig::Shell {
                command: command.to_string(),
                cwd: None,
                env: BTreeMap::new(),
            },
        )
    }

    fn apply(
        acc: &mut TemplateDescriptor,
        incoming: &TemplateDescriptor,
        strategy: ConflictStrategy,
        conflicts: &mut Vec<ConflictRecord>,
    ) -> Result<(), CompositionError> {
        let mut scope = MergeScope {
            strategy,
            existing_source: "root",
            incoming_source: "inc",
            handler: None,
            conflicts,
        };
        apply_include(acc, incoming, &mut scope)
    }

    #[test]
    fn test_extend_tags_accumulate() {
        let mut acc = TemplateDescriptor::new("root");
        let mut conflicts = Vec::new();
        apply(&mut acc, &with_tags("a", &["web"]), ConflictStrategy::Extend, &mut conflicts).unwrap();
        apply(&mut acc, &with_tags("b", &["api"]), ConflictStrategy::Extend, &mut conflicts).unwrap();
        assert_eq!(acc.tags, vec!["web", "api"]);
    }

    #[test]
    fn test_replace_tags_keep_last() {
        let mut acc = TemplateDescriptor::new("root");
        let mut conflicts = Vec::new();
        apply(&mut acc, &with_tags("a", &["web"]), ConflictStrategy::Replace, &mut conflicts)
            .unwrap();
        apply(&mut acc, &with_tags("b", &["api"]), ConflictStrategy::Replace, &mut conflicts)
            .unwrap();
        assert_eq!(acc.tags, vec!["api"]);
    }

    #[test]
    fn test_merge_overwrites_and_extend_keeps() {
        let mut incoming = TemplateDescriptor::new("inc");
        incoming.variables.insert("port".to_string(), number(8080));

        let mut acc = TemplateDescriptor::new("root");
        acc.variables.insert("port".to_string(), number(3000));
        let mut conflicts = Vec::new();
        apply(&mut acc, &incoming, ConflictStrategy::Merge, &mut conflicts).unwrap();
        assert_eq!(acc.variables["port"].default, Some(json!(8080)));
        assert_eq!(conflicts[0].resolution, ConflictResolution::Overridden);

        let mut acc = TemplateDescriptor::new("root");
        acc.variables.insert("port".to_string(), number(3000));
        let mut conflicts = Vec::new();
        apply(&mut acc, &incoming, ConflictStrategy::Extend, &mut conflicts).unwrap();
        assert_eq!(acc.variables["port"].default, Some(json!(3000)));
        assert_eq!(conflicts[0].resolution, ConflictResolution::KeptExisting);
    }

    #[test]
    fn test_fail_aborts_on_collision_only() {
        let mut incoming = TemplateDescriptor::new("inc");
        incoming.variables.insert("port".to_string(), number(8080));
        incoming.variables.insert("host".to_string(), VariableDefinition::new(VariableType::String));

        let mut acc = TemplateDescriptor::new("root");
        acc.variables.insert("host".to_string(), VariableDefinition::new(VariableType::String));
        let mut conflicts = Vec::new();
        apply(&mut acc, &incoming, ConflictStrategy::Fail, &mut conflicts).unwrap();
        assert_eq!(acc.variables.len(), 2);

        acc.variables.insert("port".to_string(), number(1));
        let error = apply(&mut acc, &incoming, ConflictStrategy::Error, &mut conflicts).unwrap_err();
        assert!(matches!(
            error,
            CompositionError::Conflict {
                kind: ConflictKind::Variable,
                ..
            }
        ));
    }

    #[derive(Debug)]
    struct KeepMine;

    impl ConflictHandler for KeepMine {
        fn resolve(&self, _conflict: &PendingConflict<'_>) -> ConflictDecision {
            ConflictDecision::KeepExisting
        }
    }

    #[test]
    fn test_prompt_uses_handler_or_fails() {
        let mut incoming = TemplateDescriptor::new("inc");
        incoming.steps.push(shell("build", "make"));
        let mut acc = TemplateDescriptor::new("root");
        acc.steps.push(shell("build", "cargo build"));

        let mut conflicts = Vec::new();
        let error = apply(&mut acc, &incoming, ConflictStrategy::Prompt, &mut conflicts);
        assert!(error.is_err());

        let handler = KeepMine;
        let mut scope = MergeScope {
            strategy: ConflictStrategy::Prompt,
            existing_source: "root",
            incoming_source: "inc",
            handler: Some(&handler),
            conflicts: &mut conflicts,
        };
        apply_include(&mut acc, &incoming, &mut scope).unwrap();
        assert!(matches!(acc.steps[0].config, ToolConfig::Shell { ref command, .. } if command == "cargo build"));
    }

    #[test]
    fn test_inherit_child_wins() {
        let mut parent = TemplateDescriptor::new("base");
        parent.version = Some("1.0.0".to_string());
        parent.variables.insert("port".to_string(), number(3000));
        parent.steps.push(shell("install", "npm install"));
        parent.steps.push(shell("build", "npm run build"));
        parent.hooks.pre.push("echo parent".to_string());
        parent.settings.timeout = Some(60);
        parent.settings.retries = Some(2);

        let mut child = TemplateDescriptor::new("app");
        child.variables.insert("port".to_string(), number(8080));
        child.steps.push(shell("build", "vite build"));
        child.steps.push(shell("test", "vitest"));
        child.hooks.pre.push("echo child".to_string());
        child.settings.timeout = Some(120);
        child.extends = Some("base".to_string());

        let mut conflicts = Vec::new();
        let merged =
            inherit(parent, child, "base", "app", ConflictStrategy::Merge, &mut conflicts);

        assert_eq!(merged.name, "app");
        assert_eq!(merged.version.as_deref(), Some("1.0.0"));
        assert_eq!(merged.variables["port"].default, Some(json!(8080)));
        let names: Vec<&str> = merged.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["install", "build", "test"]);
        assert_eq!(merged.hooks.pre, vec!["echo parent", "echo child"]);
        assert_eq!(merged.settings.timeout, Some(120));
        assert_eq!(merged.settings.retries, Some(2));
        assert!(merged.extends.is_none());
        assert_eq!(conflicts.len(), 2);
    }

    fn local_dependency(name: &str, url: &str) -> DependencySpec {
        Dependency {
            name: name.to_string(),
            version: None,
            dep_type: DependencyType::Local,
            url: Some(url.to_string()),
            optional: false,
            dev: false,
        }
        .into()
    }

    #[test]
    fn test_same_name_different_type_dependencies_both_kept() {
        let mut acc = TemplateDescriptor::new("root");
        acc.dependencies.push(DependencySpec::Simple("shared@^1.0.0".to_string()));
        let mut incoming = TemplateDescriptor::new("inc");
        incoming.dependencies.push(local_dependency("shared", "./vendor/shared"));
        incoming.dependencies.push(DependencySpec::Simple("shared@^2.0.0".to_string()));

        let mut conflicts = Vec::new();
        apply(&mut acc, &incoming, ConflictStrategy::Merge, &mut conflicts).unwrap();

        assert_eq!(acc.dependencies.len(), 2);
        assert!(acc.dependencies.contains(&DependencySpec::Simple("shared@^2.0.0".to_string())));
        assert!(acc.dependencies.contains(&local_dependency("shared", "./vendor/shared")));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].name, "shared");

        let mut parent = TemplateDescriptor::new("base");
        parent.dependencies.push(DependencySpec::Simple("shared".to_string()));
        let mut child = TemplateDescriptor::new("app");
        child.dependencies.push(local_dependency("shared", "./shared"));
        let merged = inherit(parent, child, "base", "app", ConflictStrategy::Merge, &mut conflicts);
        assert_eq!(merged.dependencies.len(), 2);

        let resolved = crate::resolver::normalize_dependencies(&merged.dependencies);
        let types: Vec<DependencyType> = resolved.iter().map(|d| d.dep_type).collect();
        assert_eq!(types, vec![DependencyType::RegistryPackage, DependencyType::Local]);
    }

    #[test]
    fn test_deduplicate() {
        let mut descriptor = TemplateDescriptor::new("app");
        descriptor.tags = vec!["web".into(), "api".into(), "web".into()];
        descriptor.outputs = vec!["src".into(), "src".into()];
        descriptor.dependencies = vec![
            DependencySpec::Simple("react@18".to_string()),
            DependencySpec::Simple("react@17".to_string()),
            Dependency {
                name: "react".to_string(),
                version: None,
                dep_type: DependencyType::Local,
                url: Some("./react".to_string()),
                optional: false,
                dev: false,
            }
            .into(),
        ];

        let mut conflicts = Vec::new();
        deduplicate(&mut descriptor, &mut conflicts);
        assert_eq!(descriptor.tags, vec!["web", "api"]);
        assert_eq!(descriptor.outputs, vec!["src"]);
        assert_eq!(descriptor.dependencies.len(), 2);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].resolution, ConflictResolution::Deduplicated);
    }
}

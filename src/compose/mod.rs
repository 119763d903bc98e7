//! Template composition: `extends` inheritance and ordered `includes`.
//!
//! [`CompositionEngine::compose`] expands a descriptor into one effective
//! descriptor:
//!
//! 1. **Inheritance**: the `extends` parent is resolved through the
//!    [`SourceManager`], composed recursively, and the child is laid over it
//!    (child wins, collisions logged).
//! 2. **Includes**: processed strictly in declared order. A `condition` is
//!    evaluated with the restricted evaluator against the accumulator's
//!    variable defaults, then caller-supplied values, then overrides from
//!    earlier includes. A false condition records the include as skipped.
//!    Otherwise the include is resolved, composed recursively, its
//!    `variables` overrides applied, and it is merged under its strategy.
//! 3. **Final pass**: dependencies (by name and type), outputs and tags are
//!    de-duplicated, and the merged steps are checked for `dependsOn` cycles.
//!
//! A reference that is already on the composition stack is a
//! [`CompositionError::CircularComposition`]; nesting is bounded by
//! [`CompositionContext::max_depth`].
//!
//! # Failure policy
//!
//! Resolving a parent or include can fail (network, missing file, invalid
//! descriptor). Under `fail`/`error`, and under `prompt` without a
//! [`ConflictHandler`], that aborts composition. Under any other strategy the
//! failure is recorded: as a skipped include with its reason, or as a
//! warning for `extends`.

pub mod merge;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::config::CompositionConfig;
use crate::constants::DEFAULT_MAX_COMPOSITION_DEPTH;
use crate::core::CompositionError;
use crate::descriptor::expression::evaluate_condition;
use crate::descriptor::steps::format_cycle;
use crate::descriptor::{DescriptorParser, StepGraph, TemplateDescriptor};
use crate::source::{SourceManager, TemplateMetadata};

use merge::MergeScope;

/// How collisions between templates are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Incoming map entries overwrite, lists are unioned
    #[default]
    Merge,
    /// Each category the incoming template declares replaces the existing one
    Replace,
    /// Only missing map entries are added, lists are concatenated
    Extend,
    /// Abort on the first collision or resolution failure
    Fail,
    /// Same as `fail`
    Error,
    /// Ask the configured [`ConflictHandler`]; `fail` without one
    Prompt,
}

impl ConflictStrategy {
    pub const ALL: [Self; 6] =
        [Self::Merge, Self::Replace, Self::Extend, Self::Fail, Self::Error, Self::Prompt];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Replace => "replace",
            Self::Extend => "extend",
            Self::Fail => "fail",
            Self::Error => "error",
            Self::Prompt => "prompt",
        }
    }

    /// Whether a resolution failure aborts composition under this strategy.
    #[must_use]
    pub const fn aborts_on_failure(self, has_handler: bool) -> bool {
        match self {
            Self::Fail | Self::Error => true,
            Self::Prompt => !has_handler,
            Self::Merge | Self::Replace | Self::Extend => false,
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|strategy| strategy.as_str() == s).ok_or_else(|| {
            let expected: Vec<&str> = Self::ALL.iter().map(|s| s.as_str()).collect();
            format!("unknown conflict strategy '{s}' (expected one of: {})", expected.join(", "))
        })
    }
}

/// The category a collision happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    Variable,
    Dependency,
    Step,
    Output,
    Tag,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Variable => "variable",
            Self::Dependency => "dependency",
            Self::Step => "step",
            Self::Output => "output",
            Self::Tag => "tag",
        })
    }
}

/// What happened to a collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    /// The later (child or included) entry replaced the earlier one
    Overridden,
    /// The earlier entry was kept
    KeptExisting,
    /// The whole category was replaced by the include's
    Replaced,
    /// Dropped by the final de-duplication pass
    Deduplicated,
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Overridden => "overridden",
            Self::KeptExisting => "kept existing",
            Self::Replaced => "replaced",
            Self::Deduplicated => "deduplicated",
        })
    }
}

/// One entry of the conflict log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub kind: ConflictKind,
    pub name: String,
    /// Templates that contributed the colliding entries, earliest first
    pub sources: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ConflictStrategy>,
    pub resolution: ConflictResolution,
}

/// A collision handed to a [`ConflictHandler`].
#[derive(Debug, Clone, Copy)]
pub struct PendingConflict<'a> {
    pub kind: ConflictKind,
    pub name: &'a str,
    pub existing_source: &'a str,
    pub incoming_source: &'a str,
}

/// A [`ConflictHandler`]'s answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    KeepExisting,
    UseIncoming,
    Abort,
}

/// Decides collisions for includes using the `prompt` strategy.
///
/// Interactive front ends implement this; the core never prompts itself.
pub trait ConflictHandler: fmt::Debug + Send + Sync {
    fn resolve(&self, conflict: &PendingConflict<'_>) -> ConflictDecision;
}

/// Inputs of one composition run.
#[derive(Debug, Clone)]
pub struct CompositionContext {
    /// Relative references of the root descriptor resolve against this
    pub project_root: PathBuf,
    /// Caller-supplied variable values, visible to include conditions
    pub variables: Map<String, Value>,
    /// Strategy for includes without one, and the label for `extends` collisions
    pub default_strategy: ConflictStrategy,
    pub max_depth: usize,
    pub conflict_handler: Option<Arc<dyn ConflictHandler>>,
}

impl CompositionContext {
    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            variables: Map::new(),
            default_strategy: ConflictStrategy::default(),
            max_depth: DEFAULT_MAX_COMPOSITION_DEPTH,
            conflict_handler: None,
        }
    }

    #[must_use]
    pub fn from_config(project_root: impl Into<PathBuf>, config: &CompositionConfig) -> Self {
        Self {
            default_strategy: config.default_strategy,
            max_depth: config.max_depth,
            ..Self::new(project_root)
        }
    }

    #[must_use]
    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    #[must_use]
    pub const fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_conflict_handler(mut self, handler: Arc<dyn ConflictHandler>) -> Self {
        self.conflict_handler = Some(handler);
        self
    }
}

/// How one include was handled, in declared order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedInclude {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub included: bool,
    /// Why the include was skipped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub strategy: ConflictStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TemplateMetadata>,
}

/// The result of composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposedTemplate {
    pub descriptor: TemplateDescriptor,
    pub resolved_includes: Vec<ResolvedInclude>,
    pub conflicts: Vec<ConflictRecord>,
    pub warnings: Vec<String>,
    /// Composed step names, each after the steps it depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_order: Vec<String>,
}

impl ComposedTemplate {
    fn new(descriptor: TemplateDescriptor) -> Self {
        Self {
            descriptor,
            resolved_includes: Vec::new(),
            conflicts: Vec::new(),
            warnings: Vec::new(),
            step_order: Vec::new(),
        }
    }

    /// The includes that were actually merged.
    pub fn included(&self) -> impl Iterator<Item = &ResolvedInclude> {
        self.resolved_includes.iter().filter(|include| include.included)
    }
}

/// A frame of the composition stack.
#[derive(Debug, Clone)]
struct Frame {
    /// Normalized reference, used for cycle detection
    key: String,
    /// The reference as written
    label: String,
}

/// A parent or include, resolved and composed.
struct Loaded {
    composed: ComposedTemplate,
    metadata: TemplateMetadata,
}

/// Expands `extends` and `includes` through a [`SourceManager`].
#[derive(Debug, Clone)]
pub struct CompositionEngine {
    manager: SourceManager,
    parser: DescriptorParser,
}

impl CompositionEngine {
    #[must_use]
    pub const fn new(manager: SourceManager) -> Self {
        Self {
            manager,
            parser: DescriptorParser::new(),
        }
    }

    #[must_use]
    pub const fn manager(&self) -> &SourceManager {
        &self.manager
    }

    /// Compose a descriptor whose relative references resolve against the
    /// context's project root.
    ///
    /// # Errors
    ///
    /// See the module documentation for which failures abort.
    pub async fn compose(
        &self,
        descriptor: &TemplateDescriptor,
        ctx: &CompositionContext,
    ) -> Result<ComposedTemplate, CompositionError> {
        let root = Frame {
            key: format!("root:{}", descriptor.name),
            label: descriptor.name.clone(),
        };
        self.compose_root(descriptor, &ctx.project_root, root, ctx).await
    }

    /// Compose a descriptor loaded from `location`.
    ///
    /// Relative references resolve against the descriptor's directory, and a
    /// template that extends or includes this file is reported as circular.
    ///
    /// # Errors
    ///
    /// See the module documentation for which failures abort.
    pub async fn compose_at(
        &self,
        descriptor: &TemplateDescriptor,
        location: &Path,
        ctx: &CompositionContext,
    ) -> Result<ComposedTemplate, CompositionError> {
        let base = location.parent().unwrap_or(location).to_path_buf();
        let label = location.display().to_string();
        let key = self.manager.normalize(&label, &base).unwrap_or_else(|_| label.clone());
        self.compose_root(
            descriptor,
            &base,
            Frame {
                key,
                label,
            },
            ctx,
        )
        .await
    }

    async fn compose_root(
        &self,
        descriptor: &TemplateDescriptor,
        base_path: &Path,
        root: Frame,
        ctx: &CompositionContext,
    ) -> Result<ComposedTemplate, CompositionError> {
        let mut composed =
            self.compose_inner(descriptor.clone(), base_path.to_path_buf(), vec![root], ctx).await?;

        merge::deduplicate(&mut composed.descriptor, &mut composed.conflicts);

        let graph = StepGraph::from_steps(&composed.descriptor.steps);
        if let Some(cycle) = graph.find_cycle() {
            return Err(CompositionError::InvalidTemplate {
                reference: composed.descriptor.name.clone(),
                errors: vec![format!(
                    "steps: circular dependsOn detected after composition: {}",
                    format_cycle(&cycle)
                )],
            });
        }
        composed.step_order = graph.execution_order().unwrap_or_default();

        tracing::debug!(
            "Composed '{}': {} include(s), {} conflict(s)",
            composed.descriptor.name,
            composed.resolved_includes.len(),
            composed.conflicts.len()
        );
        Ok(composed)
    }

    fn compose_inner<'a>(
        &'a self,
        descriptor: TemplateDescriptor,
        base_path: PathBuf,
        stack: Vec<Frame>,
        ctx: &'a CompositionContext,
    ) -> BoxFuture<'a, Result<ComposedTemplate, CompositionError>> {
        async move {
            let has_handler = ctx.conflict_handler.is_some();
            let includes = descriptor.includes.clone();
            let current = stack.last().map(|f| f.label.clone()).unwrap_or_default();
            let mut composed = ComposedTemplate::new(descriptor);

            if let Some(parent_ref) = composed.descriptor.extends.clone() {
                match self.load(&parent_ref, &base_path, &stack, ctx).await {
                    Ok(parent) => {
                        let child = std::mem::take(&mut composed.descriptor);
                        composed.conflicts.extend(parent.composed.conflicts);
                        composed.warnings.extend(parent.composed.warnings);
                        composed.descriptor = merge::inherit(
                            parent.composed.descriptor,
                            child,
                            &parent_ref,
                            &current,
                            ctx.default_strategy,
                            &mut composed.conflicts,
                        );
                    }
                    Err(error) if is_structural(&error) => return Err(error),
                    Err(error) if ctx.default_strategy.aborts_on_failure(has_handler) => {
                        return Err(error);
                    }
                    Err(error) => {
                        tracing::warn!("Ignoring parent '{}': {}", parent_ref, error);
                        composed.warnings.push(format!("extends '{parent_ref}' skipped: {error}"));
                        composed.descriptor.extends = None;
                    }
                }
            }

            let mut overrides = Map::new();
            for include in &includes {
                let strategy = include.strategy.unwrap_or(ctx.default_strategy);
                let mut record = ResolvedInclude {
                    url: include.url.clone(),
                    version: include.version.clone(),
                    included: false,
                    reason: None,
                    strategy,
                    metadata: None,
                };

                if let Some(condition) = &include.condition {
                    let mut scope = composed.descriptor.variable_defaults();
                    scope.extend(ctx.variables.clone());
                    scope.extend(overrides.clone());

                    match evaluate_condition(condition, &scope) {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::debug!("Skipping include '{}': condition false", include.url);
                            record.reason = Some(format!("condition '{condition}' is false"));
                            composed.resolved_includes.push(record);
                            continue;
                        }
                        Err(e) if strategy.aborts_on_failure(has_handler) => {
                            return Err(CompositionError::Condition {
                                reference: include.url.clone(),
                                expression: condition.clone(),
                                reason: e.to_string(),
                            });
                        }
                        Err(e) => {
                            tracing::warn!("Skipping include '{}': {}", include.url, e);
                            record.reason = Some(format!("invalid condition '{condition}': {e}"));
                            composed.resolved_includes.push(record);
                            continue;
                        }
                    }
                }

                let mut loaded = match self.load(&include.url, &base_path, &stack, ctx).await {
                    Ok(loaded) => loaded,
                    Err(error) if is_structural(&error) => return Err(error),
                    Err(error) if strategy.aborts_on_failure(has_handler) => return Err(error),
                    Err(error) => {
                        tracing::warn!("Skipping include '{}': {}", include.url, error);
                        record.reason = Some(error.to_string());
                        composed.resolved_includes.push(record);
                        continue;
                    }
                };

                for (name, value) in &include.variables {
                    match loaded.composed.descriptor.variables.get_mut(name) {
                        Some(definition) => definition.default = Some(value.clone()),
                        None => composed.warnings.push(format!(
                            "include '{}' overrides undeclared variable '{name}'",
                            include.url
                        )),
                    }
                    overrides.insert(name.clone(), value.clone());
                }

                composed.conflicts.append(&mut loaded.composed.conflicts);
                composed.warnings.append(&mut loaded.composed.warnings);

                let handler = ctx.conflict_handler.as_deref();
                let mut scope = MergeScope {
                    strategy,
                    existing_source: &current,
                    incoming_source: &include.url,
                    handler,
                    conflicts: &mut composed.conflicts,
                };
                merge::apply_include(&mut composed.descriptor, &loaded.composed.descriptor, &mut scope)?;

                record.included = true;
                record.version =
                    record.version.or_else(|| loaded.metadata.version.clone());
                record.metadata = Some(loaded.metadata);
                composed.resolved_includes.push(record);
            }

            composed.descriptor.includes = includes;
            Ok(composed)
        }
        .boxed()
    }

    /// Resolve, parse and compose a parent or include.
    async fn load(
        &self,
        reference: &str,
        base_path: &Path,
        stack: &[Frame],
        ctx: &CompositionContext,
    ) -> Result<Loaded, CompositionError> {
        let key = self.manager.normalize(reference, base_path).map_err(|source| {
            CompositionError::Resolution {
                reference: reference.to_string(),
                source,
            }
        })?;

        if stack.iter().any(|frame| frame.key == key) {
            let mut chain: Vec<String> = stack.iter().map(|f| f.label.clone()).collect();
            chain.push(reference.to_string());
            return Err(CompositionError::CircularComposition {
                chain,
            });
        }
        if stack.len() > ctx.max_depth {
            return Err(CompositionError::DepthExceeded {
                reference: reference.to_string(),
                max_depth: ctx.max_depth,
            });
        }

        let resolved = self.manager.resolve_one(reference, Some(base_path)).await.map_err(
            |source| CompositionError::Resolution {
                reference: reference.to_string(),
                source,
            },
        )?;

        let parsed = self.parser.parse_str(resolved.content(), reference).map_err(|e| {
            CompositionError::InvalidTemplate {
                reference: reference.to_string(),
                errors: vec![e.to_string()],
            }
        })?;
        if !parsed.is_valid {
            return Err(CompositionError::InvalidTemplate {
                reference: reference.to_string(),
                errors: parsed.error_messages(),
            });
        }

        let mut frames = stack.to_vec();
        frames.push(Frame {
            key,
            label: reference.to_string(),
        });
        let mut composed = self
            .compose_inner(parsed.descriptor, resolved.base_path().to_path_buf(), frames, ctx)
            .await?;
        composed
            .warnings
            .extend(parsed.warnings.iter().map(|w| format!("{reference}: {w}")));

        Ok(Loaded {
            composed,
            metadata: resolved.metadata().clone(),
        })
    }
}

/// Errors that abort regardless of strategy.
const fn is_structural(error: &CompositionError) -> bool {
    matches!(
        error,
        CompositionError::CircularComposition { .. }
            | CompositionError::DepthExceeded { .. }
            | CompositionError::Conflict { .. }
    )
}

//! The atom graph and its incremental scheduler.
//!
//! A [`Workflow`] owns the registered atoms, the memoization cache, the
//! render buffer and the bookkeeping of the current pass. Atoms run strictly
//! sequentially in topological order; independent branches are not
//! parallelized.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::atom::{Atom, AtomResult, AtomStatus, RetryPolicy};
use crate::cache::{AtomCache, InputHash, compute_input_hash};
use crate::config::EngineConfig;
use crate::directive::DirectiveRegistry;
use crate::error::{FlowError, GraphError, Result};
use crate::graph::DependencyGraph;
use crate::payload::{PayloadLimits, reduce};
use crate::render::{Callsite, Component, RenderBuffer, RenderDecision, component_id};
use crate::state::ComponentState;
use crate::tracking::{DependencyTracker, DynamicEdges, TrackedValue};
use crate::value::AtomValue;

/// Resolved variables and the results of the latest pass.
#[derive(Debug, Default)]
pub struct WorkflowContext {
    pub variables: BTreeMap<String, Value>,
    pub results: BTreeMap<String, AtomResult>,
}

pub struct Workflow {
    atoms: HashMap<String, Atom>,
    registration_order: Vec<String>,
    dynamic: DynamicEdges,
    context: WorkflowContext,
    cache: AtomCache,
    producers: HashMap<String, String>,
    render: RenderBuffer,
    state: ComponentState,
    registry: Arc<DirectiveRegistry>,
    limits: PayloadLimits,
    default_retry: RetryPolicy,
    tracker: DependencyTracker,
}

impl Workflow {
    pub fn new(registry: Arc<DirectiveRegistry>) -> Self {
        Self {
            atoms: HashMap::new(),
            registration_order: Vec::new(),
            dynamic: DynamicEdges::new(),
            context: WorkflowContext::default(),
            cache: AtomCache::new(),
            producers: HashMap::new(),
            render: RenderBuffer::new(),
            state: ComponentState::new(),
            registry,
            limits: PayloadLimits::default(),
            default_retry: RetryPolicy::default(),
            tracker: DependencyTracker::new(),
        }
    }

    pub fn with_config(config: &EngineConfig, registry: Arc<DirectiveRegistry>) -> Self {
        let mut workflow = Self::new(registry);
        workflow.limits = config.payload.clone();
        workflow.default_retry = config.default_retry_policy();
        workflow
    }

    /// Shares an existing component state map instead of a private one.
    pub fn with_component_state(mut self, state: ComponentState) -> Self {
        self.state = state;
        self
    }

    /// Policy for atoms registered without one.
    pub fn with_default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Registers an atom. Registering a name twice is a no-op and returns
    /// `false`, so reruns of a program can re-declare their atoms freely.
    pub fn register(&mut self, atom: Atom) -> bool {
        let name = atom.name().to_string();
        if self.atoms.contains_key(&name) {
            debug!("Atom already registered, ignoring: {}", name);
            return false;
        }
        debug!(
            "Registered atom {} (dependencies: {:?})",
            name,
            atom.dependencies()
        );
        self.registration_order.push(name.clone());
        self.atoms.insert(name, atom);
        true
    }

    /// Removes an atom together with its discovered edges and cached result.
    pub fn unregister(&mut self, name: &str) -> Option<Atom> {
        let atom = self.atoms.remove(name)?;
        self.registration_order.retain(|n| n != name);
        self.dynamic.remove_atom(name);
        self.cache.remove(name);
        self.context.results.remove(name);
        self.producers.retain(|_, producer| producer != name);
        info!("Unregistered atom {}", name);
        Some(atom)
    }

    /// Adds a runtime-discovered edge. Returns whether it was new.
    pub fn register_dependency(&mut self, consumer: &str, producer: &str) -> bool {
        self.dynamic.register(consumer, producer)
    }

    pub fn atom(&self, name: &str) -> Option<&Atom> {
        self.atoms.get(name)
    }

    /// Atom names in registration order.
    pub fn atom_names(&self) -> &[String] {
        &self.registration_order
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Declared dependencies followed by any discovered at runtime.
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        let mut deps: Vec<String> = self
            .atoms
            .get(name)
            .map(|atom| atom.dependencies().to_vec())
            .unwrap_or_default();
        for producer in self.dynamic.dependencies_of(name) {
            if !deps.iter().any(|d| d == producer) {
                deps.push(producer.to_string());
            }
        }
        deps
    }

    pub fn graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for name in &self.registration_order {
            graph.add_node(name, self.dependencies_of(name));
        }
        graph
    }

    pub fn validate(&self) -> Result<()> {
        self.graph().validate()?;
        Ok(())
    }

    pub fn execution_order(&self) -> Result<Vec<String>> {
        let graph = self.graph();
        graph.validate()?;
        Ok(graph.execution_order())
    }

    /// Runs a pass over the whole graph.
    ///
    /// Without a seed every atom whose inputs are unchanged is served from the
    /// cache. With a seed, the seed atoms and everything downstream of them
    /// are recomputed unconditionally; atoms outside that set are only run
    /// when they have no valid cached result. The pass stops at the first
    /// atom that fails; results committed before it are kept.
    pub fn execute(&mut self, recompute_seed: Option<&[&str]>) -> Result<ExecutionOutcome> {
        let graph = self.graph();
        if let Err(e) = graph.validate() {
            error!("Graph validation failed: {}", e);
            return Err(e.into());
        }
        let order = graph.execution_order();
        let forced = match recompute_seed {
            Some(seed) => graph.affected(seed.iter().copied()),
            None => BTreeSet::new(),
        };
        info!(
            "Executing {} atoms ({} forced to recompute)",
            order.len(),
            forced.len()
        );

        self.begin_pass();
        let mut pass = self.pass(forced);
        for name in &order {
            if !pass.run_step(name)? {
                break;
            }
        }
        Ok(pass.finish())
    }

    /// Runs only the atoms without declared dependencies. Everything else is
    /// evaluated lazily when an atom body pulls it, which records the edge.
    pub fn execute_relevant_atoms(&mut self) -> Result<ExecutionOutcome> {
        let graph = self.graph();
        graph.validate()?;
        let roots: Vec<String> = graph
            .execution_order()
            .into_iter()
            .filter(|name| {
                self.atoms
                    .get(name)
                    .is_some_and(|atom| atom.dependencies().is_empty())
            })
            .collect();
        info!("Executing {} root atoms", roots.len());

        self.begin_pass();
        let mut pass = self.pass(BTreeSet::new());
        for name in &roots {
            if !pass.run_step(name)? {
                break;
            }
        }
        Ok(pass.finish())
    }

    fn begin_pass(&mut self) {
        let atoms = &self.atoms;
        self.cache.sweep(|name| atoms.contains_key(name));
        self.context.results.clear();
        self.producers.retain(|_, producer| atoms.contains_key(producer.as_str()));
        self.render.begin_pass();
    }

    fn pass(&mut self, forced: BTreeSet<String>) -> Pass<'_> {
        let Workflow {
            atoms,
            dynamic,
            context,
            cache,
            producers,
            render,
            state,
            registry,
            limits,
            default_retry,
            tracker,
            ..
        } = self;
        let WorkflowContext { variables, results } = context;
        Pass {
            atoms,
            registry,
            state,
            limits,
            default_retry,
            variables,
            dynamic,
            cache,
            results,
            producers,
            render,
            tracker,
            forced,
            order: Vec::new(),
            components: Vec::new(),
            failed: None,
        }
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.context.variables.insert(name.into(), value.into());
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.context.variables.get(name)
    }

    pub fn context(&self) -> &WorkflowContext {
        &self.context
    }

    pub fn result(&self, name: &str) -> Option<&AtomResult> {
        self.context.results.get(name)
    }

    /// The atom that emitted `component_id` during the latest pass.
    pub fn producer_of(&self, component_id: &str) -> Option<&str> {
        self.producers.get(component_id).map(String::as_str)
    }

    pub fn producers(&self) -> &HashMap<String, String> {
        &self.producers
    }

    pub fn component_state(&self) -> &ComponentState {
        &self.state
    }

    pub fn render_buffer(&self) -> &RenderBuffer {
        &self.render
    }

    pub fn cache(&self) -> &AtomCache {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<DirectiveRegistry> {
        &self.registry
    }
}

/// What a pass produced.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    /// One result per evaluated atom, in evaluation order.
    pub results: Vec<AtomResult>,
    /// Components emitted during the pass, duplicates excluded.
    pub components: Vec<Component>,
    /// The atom whose failure stopped the pass.
    pub failed: Option<String>,
}

impl ExecutionOutcome {
    pub fn result(&self, name: &str) -> Option<&AtomResult> {
        self.results.iter().find(|result| result.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&AtomValue> {
        self.result(name).and_then(|result| result.value.as_ref())
    }

    pub fn status(&self, name: &str) -> Option<AtomStatus> {
        self.result(name).map(|result| result.status)
    }

    /// Atoms whose callable was invoked in this pass.
    pub fn executed(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|result| result.status != AtomStatus::Skipped)
            .map(|result| result.name.as_str())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }

    /// Components that differ from their last delivery.
    pub fn rendered(&self) -> Vec<&Component> {
        self.components
            .iter()
            .filter(|component| component.should_render)
            .collect()
    }
}

/// Why evaluation of an atom did not produce a value.
enum Halt {
    Failed(String),
    Graph(GraphError),
}

/// Mutable view of a workflow for the duration of one pass.
struct Pass<'w> {
    atoms: &'w HashMap<String, Atom>,
    registry: &'w DirectiveRegistry,
    state: &'w ComponentState,
    limits: &'w PayloadLimits,
    default_retry: &'w RetryPolicy,
    variables: &'w BTreeMap<String, Value>,
    dynamic: &'w mut DynamicEdges,
    cache: &'w mut AtomCache,
    results: &'w mut BTreeMap<String, AtomResult>,
    producers: &'w mut HashMap<String, String>,
    render: &'w mut RenderBuffer,
    tracker: &'w mut DependencyTracker,
    forced: BTreeSet<String>,
    order: Vec<String>,
    components: Vec<Component>,
    failed: Option<String>,
}

impl<'w> Pass<'w> {
    /// Evaluates one top-level atom. Returns `Ok(false)` when the pass must stop.
    fn run_step(&mut self, name: &str) -> Result<bool> {
        match self.evaluate(name) {
            Ok(_) => Ok(true),
            Err(Halt::Failed(atom)) => {
                warn!("Atom {} failed, halting the rest of the pass", atom);
                self.failed = Some(atom);
                Ok(false)
            }
            Err(Halt::Graph(e)) => {
                error!("Aborting pass: {}", e);
                Err(e.into())
            }
        }
    }

    fn finish(self) -> ExecutionOutcome {
        let results = self
            .order
            .iter()
            .filter_map(|name| self.results.get(name).cloned())
            .collect();
        ExecutionOutcome {
            results,
            components: self.components,
            failed: self.failed,
        }
    }

    fn evaluate(&mut self, name: &str) -> std::result::Result<AtomValue, Halt> {
        if let Some(result) = self.results.get(name) {
            return if result.status.is_success() {
                Ok(result.value.clone().unwrap_or_default())
            } else {
                Err(Halt::Failed(name.to_string()))
            };
        }

        if self.tracker.is_active(name) {
            let mut path = self.tracker.stack();
            let start = path.iter().position(|n| n == name).unwrap_or(0);
            let mut cycle = path.split_off(start);
            cycle.push(name.to_string());
            return Err(Halt::Graph(GraphError::Cycle { path: cycle }));
        }

        let atoms = self.atoms;
        let Some(atom) = atoms.get(name) else {
            return Err(Halt::Graph(GraphError::UnknownAtom(name.to_string())));
        };

        let mut resolved = BTreeMap::new();
        let mut args = Vec::with_capacity(atom.dependencies().len());
        for (index, dep) in atom.dependencies().iter().enumerate() {
            let value = self.evaluate(dep)?;
            let param = atom.param_name(index).unwrap_or(dep).to_string();
            resolved.insert(dep.clone(), value.clone());
            args.push((param, TrackedValue::new(value, dep.clone())));
        }

        let hash = compute_input_hash(name, &resolved);
        if self.cache.is_valid(name, &hash, self.forced.contains(name)) {
            if let Some(cached) = self.cache.get(name) {
                debug!("Skipping atom {} (inputs unchanged)", name);
                let result = AtomResult::skipped(cached);
                let value = result.value.clone().unwrap_or_default();
                self.record(result);
                return Ok(value);
            }
        }

        let result = self.run_with_retry(atom, &args, &hash)?;
        self.cache.store(result.clone(), &hash);
        let outcome = match (&result.status, &result.value) {
            (AtomStatus::Completed, value) => Ok(value.clone().unwrap_or_default()),
            _ => Err(Halt::Failed(name.to_string())),
        };
        self.record(result);
        outcome
    }

    fn record(&mut self, result: AtomResult) {
        self.order.push(result.name.clone());
        self.results.insert(result.name.clone(), result);
    }

    fn run_with_retry(
        &mut self,
        atom: &'w Atom,
        args: &[(String, TrackedValue)],
        hash: &InputHash,
    ) -> std::result::Result<AtomResult, Halt> {
        let name = atom.name();
        let policy = atom.retry_policy().unwrap_or(self.default_retry);

        // Re-recorded from what this run emits.
        self.producers.retain(|_, producer| producer != name);

        let mut result = AtomResult::pending(name);
        result.input_hash = Some(hash.digest.clone());
        result.started_at = Some(Utc::now());

        loop {
            result.attempts += 1;
            result.status = AtomStatus::Running;
            info!(
                "Executing atom {} (attempt {}/{})",
                name,
                result.attempts,
                policy.max_attempts()
            );

            self.tracker.enter(name);
            let outcome = {
                let mut ctx = AtomContext {
                    name,
                    args,
                    pass: &mut *self,
                };
                (atom.callable())(&mut ctx)
            };
            self.tracker.exit();

            match outcome {
                Ok(value) => {
                    result.status = AtomStatus::Completed;
                    result.value = Some(value);
                    info!("Completed atom {}", name);
                    break;
                }
                Err(e) => {
                    if let Some(graph_error) = graph_error_in(&e) {
                        return Err(Halt::Graph(graph_error));
                    }
                    if policy.should_retry(result.attempts, &e) {
                        let delay = policy.delay_for(result.attempts);
                        result.status = AtomStatus::Retry;
                        warn!(
                            "Atom {} failed on attempt {}: {:#}; retrying in {:?}",
                            name, result.attempts, e, delay
                        );
                        if !delay.is_zero() {
                            std::thread::sleep(delay);
                        }
                        continue;
                    }
                    error!(
                        "Atom {} failed after {} attempt(s): {:#}",
                        name, result.attempts, e
                    );
                    result.status = AtomStatus::Failed;
                    result.error = Some(format!("{:#}", e));
                    break;
                }
            }
        }

        result.finished_at = Some(Utc::now());
        Ok(result)
    }

    fn failure(&self, atom: &str) -> FlowError {
        match self.results.get(atom) {
            Some(result) => FlowError::AtomExecution {
                atom: atom.to_string(),
                attempts: result.attempts,
                message: result.error.clone().unwrap_or_default(),
            },
            None => FlowError::AtomExecution {
                atom: atom.to_string(),
                attempts: 0,
                message: "not evaluated".to_string(),
            },
        }
    }
}

fn graph_error_in(error: &anyhow::Error) -> Option<GraphError> {
    if let Some(graph_error) = error.downcast_ref::<GraphError>() {
        return Some(graph_error.clone());
    }
    error
        .downcast_ref::<FlowError>()
        .and_then(FlowError::as_graph_error)
        .cloned()
}

/// Handle passed to an atom body while it runs.
///
/// Dependency values read through the context are tracked: the read records
/// an edge from this atom to the producer.
pub struct AtomContext<'p, 'w> {
    name: &'p str,
    args: &'p [(String, TrackedValue)],
    pass: &'p mut Pass<'w>,
}

impl AtomContext<'_, '_> {
    /// Name of the running atom.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Argument by parameter name or by the name of the producing atom.
    pub fn arg(&mut self, name: &str) -> Result<AtomValue> {
        let args = self.args;
        let tracked = args
            .iter()
            .find(|(param, tracked)| param == name || tracked.producer() == name)
            .map(|(_, tracked)| tracked)
            .ok_or_else(|| FlowError::MissingArgument {
                atom: self.name.to_string(),
                argument: name.to_string(),
            })?;
        Ok(self.read(tracked))
    }

    pub fn arg_as<T: DeserializeOwned>(&mut self, name: &str) -> Result<T> {
        self.arg(name)?.deserialize()
    }

    pub fn positional(&mut self, index: usize) -> Result<AtomValue> {
        let args = self.args;
        let (_, tracked) = args
            .get(index)
            .ok_or_else(|| FlowError::MissingArgument {
                atom: self.name.to_string(),
                argument: format!("#{}", index),
            })?;
        Ok(self.read(tracked))
    }

    /// Arguments in declaration order, without tracking.
    pub fn args(&self) -> impl Iterator<Item = (&str, &TrackedValue)> {
        self.args
            .iter()
            .map(|(param, tracked)| (param.as_str(), tracked))
    }

    pub fn read(&mut self, value: &TrackedValue) -> AtomValue {
        let pass = &mut *self.pass;
        value.read(&*pass.tracker, &mut *pass.dynamic).clone()
    }

    /// Evaluates another atom on demand and records the edge.
    pub fn pull(&mut self, atom: &str) -> Result<AtomValue> {
        let pass = &mut *self.pass;
        pass.tracker.track_dependency(atom, &mut *pass.dynamic);
        match pass.evaluate(atom) {
            Ok(value) => Ok(value),
            Err(Halt::Graph(e)) => Err(e.into()),
            Err(Halt::Failed(failed)) => Err(pass.failure(&failed)),
        }
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.pass.variables.get(name).cloned()
    }

    /// Emits the directive with an id derived from the caller's position.
    #[track_caller]
    pub fn directive(&mut self, name: &str, args: Value) -> Result<AtomValue> {
        let callsite = Callsite::caller();
        self.emit_component(name, &component_id(name, &callsite, None), args)
    }

    #[track_caller]
    pub fn directive_with_id(
        &mut self,
        name: &str,
        identifier: &str,
        args: Value,
    ) -> Result<AtomValue> {
        let callsite = Callsite::caller();
        self.emit_component(name, &component_id(name, &callsite, Some(identifier)), args)
    }

    /// Renders a directive call into a component and runs it through the
    /// render buffer.
    ///
    /// Returns the externally set value for the component when there is one,
    /// otherwise the payload's `value` field, otherwise the whole payload.
    pub fn emit_component(&mut self, directive: &str, id: &str, args: Value) -> Result<AtomValue> {
        let pass = &mut *self.pass;
        let spec = pass
            .registry
            .get(directive)
            .ok_or_else(|| FlowError::UnknownDirective(directive.to_string()))?;

        let state = pass.state.get(id);
        let mut payload = spec.render(&args);
        if let (Some(value), Value::Object(map)) = (&state, &mut payload) {
            map.insert("value".to_string(), value.clone());
        }
        let payload = reduce(&payload, pass.limits);

        let mut component = Component::new(id, spec.component_type.clone(), payload);
        let decision = pass.render.observe(&mut component);

        if let Some(producer) = pass.tracker.current() {
            pass.producers
                .entry(id.to_string())
                .or_insert_with(|| producer.to_string());
        }

        let value = state
            .or_else(|| component.payload.get("value").cloned())
            .unwrap_or_else(|| component.payload.clone());
        if decision != RenderDecision::Duplicate {
            pass.components.push(component);
        }
        Ok(AtomValue::Data(value))
    }
}

//! Static lifting of JavaScript/TypeScript programs into atom declarations.
//!
//! Top-level calls to liftable directives become atoms with stable component
//! ids, variables bound to their results become explicit dependencies, and
//! top-level function declarations become atoms of their own. The rewritten
//! program creates one workflow object, declares every atom on it and runs it.

mod template;
mod visitor;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use oxc::allocator::Allocator;
use oxc::ast::Visit;
use oxc::ast::ast::{
    Argument, BindingPatternKind, CallExpression, Expression, Function, Statement,
};
use oxc::parser::Parser;
use oxc::span::SourceType;
use serde_json::Value;

use crate::atom::{Atom, AtomFn};
use crate::config::EngineConfig;
use crate::directive::DirectiveRegistry;
use crate::error::{FlowError, Result};
use crate::graph::DependencyGraph;
use crate::render::{Callsite, component_id};
use crate::value::AtomValue;
use crate::workflow::{AtomContext, Workflow};

pub use template::{ArgTemplate, TemplatePart, evaluate_arguments};
use template::TemplateBuilder;
use visitor::{ReferenceCollector, RewriteMode, line_of, splice};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiftOptions {
    /// Identifier the rewritten program binds its workflow object to.
    pub workflow_binding: String,
    /// Function called in the prologue to create the workflow object.
    pub factory: String,
}

impl Default for LiftOptions {
    fn default() -> Self {
        Self {
            workflow_binding: "__workflow".to_string(),
            factory: "createWorkflow".to_string(),
        }
    }
}

impl LiftOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            workflow_binding: config.workflow_binding.clone(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeclarationKind {
    Directive {
        directive: String,
        component_id: String,
        identifier: Option<String>,
        args: Vec<ArgTemplate>,
    },
    Function,
}

/// One atom declared by the rewritten program.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomDeclaration {
    pub name: String,
    pub kind: DeclarationKind,
    pub params: Vec<String>,
    pub dependencies: Vec<String>,
    pub callsite: Callsite,
    /// Variable the input program bound the result to.
    pub binding: Option<String>,
    /// Rewritten source of the atom body.
    pub body: String,
}

impl AtomDeclaration {
    pub fn is_directive(&self) -> bool {
        matches!(self.kind, DeclarationKind::Directive { .. })
    }

    pub fn component_id(&self) -> Option<&str> {
        match &self.kind {
            DeclarationKind::Directive { component_id, .. } => Some(component_id),
            DeclarationKind::Function => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiftedProgram {
    pub declarations: Vec<AtomDeclaration>,
    /// The rewritten program text.
    pub source: String,
}

impl LiftedProgram {
    pub fn declaration(&self, name: &str) -> Option<&AtomDeclaration> {
        self.declarations.iter().find(|decl| decl.name == name)
    }

    /// The declaration whose directive call produces `component_id`.
    pub fn declaration_for_component(&self, component_id: &str) -> Option<&AtomDeclaration> {
        self.declarations
            .iter()
            .find(|decl| decl.component_id() == Some(component_id))
    }

    pub fn graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for decl in &self.declarations {
            graph.add_node(&decl.name, decl.dependencies.iter().cloned());
        }
        graph
    }

    /// Registers every declaration on the workflow.
    ///
    /// Directive atoms evaluate their argument templates and emit a component.
    /// Function atoms need an implementation in `functions`. Returns the number
    /// of newly registered atoms.
    pub fn install(&self, workflow: &mut Workflow, functions: &FunctionTable) -> Result<usize> {
        let mut installed = 0;
        for decl in &self.declarations {
            let atom = match &decl.kind {
                DeclarationKind::Directive {
                    directive,
                    component_id,
                    args,
                    ..
                } => directive_atom(&decl.name, directive, component_id, args),
                DeclarationKind::Function => {
                    let callable = functions.get(&decl.name).ok_or_else(|| {
                        FlowError::Lift(format!(
                            "No implementation bound for function atom '{}'",
                            decl.name
                        ))
                    })?;
                    Atom::from_fn(decl.name.clone(), Arc::clone(callable))
                }
            };
            let atom = atom
                .with_params(decl.params.clone())
                .with_dependencies(decl.dependencies.clone());
            if workflow.register(atom) {
                installed += 1;
            }
        }
        tracing::info!("Installed {} lifted atoms", installed);
        Ok(installed)
    }
}

fn directive_atom(name: &str, directive: &str, component_id: &str, args: &[ArgTemplate]) -> Atom {
    let directive = directive.to_string();
    let component_id = component_id.to_string();
    let args = args.to_vec();
    Atom::new(name, move |ctx| {
        let count = ctx.args().count();
        let mut params = Vec::with_capacity(count);
        for index in 0..count {
            let value = ctx.positional(index)?;
            params.push(value.as_data().cloned().unwrap_or(Value::Null));
        }
        let payload = evaluate_arguments(&args, &params);
        Ok(ctx.emit_component(&directive, &component_id, payload)?)
    })
}

/// Implementations for lifted function atoms, keyed by function name.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: HashMap<String, AtomFn>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind<F>(&mut self, name: impl Into<String>, callable: F) -> &mut Self
    where
        F: Fn(&mut AtomContext<'_, '_>) -> anyhow::Result<AtomValue> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(callable));
        self
    }

    pub fn with<F>(mut self, name: impl Into<String>, callable: F) -> Self
    where
        F: Fn(&mut AtomContext<'_, '_>) -> anyhow::Result<AtomValue> + Send + Sync + 'static,
    {
        self.bind(name, callable);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AtomFn> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionTable").field("functions", &names).finish()
    }
}

/// A directive call site after id assignment.
#[derive(Debug, Clone)]
struct Site {
    id: String,
    atom: String,
}

/// Assigns component ids and atom names to directive calls, keyed by the
/// call's source offset.
///
/// Two calls that would share an id (same directive on the same line) are
/// told apart with a per-pass counter, as is any call the first pass did not
/// map.
struct SiteResolver {
    sites: HashMap<u32, Site>,
    taken: HashSet<String>,
    counter: u32,
}

impl SiteResolver {
    fn new() -> Self {
        Self {
            sites: HashMap::new(),
            taken: HashSet::new(),
            counter: 0,
        }
    }

    fn resolve(
        &mut self,
        offset: u32,
        directive: &str,
        callsite: &Callsite,
        identifier: Option<&str>,
    ) -> Site {
        if let Some(site) = self.sites.get(&offset) {
            return site.clone();
        }

        let mut id = component_id(directive, callsite, identifier);
        while !self.taken.insert(id.clone()) {
            self.counter += 1;
            let fallback = format!("{}#{}", identifier.unwrap_or_default(), self.counter);
            tracing::debug!(
                "Component id {} already assigned at {}, regenerating",
                id,
                callsite
            );
            id = component_id(directive, callsite, Some(&fallback));
        }

        let site = Site {
            atom: atom_name(directive, &id),
            id,
        };
        self.sites.insert(offset, site.clone());
        site
    }
}

/// `text-1a2b3c4d` becomes `text_1a2b3c4d`.
fn atom_name(directive: &str, component_id: &str) -> String {
    let suffix = component_id
        .strip_prefix(directive)
        .and_then(|rest| rest.strip_prefix('-'))
        .unwrap_or(component_id);
    format!("{}_{}", directive, suffix)
}

/// A top-level statement that is a liftable directive call, optionally bound
/// to a variable.
fn top_level_directive<'p, 'a>(
    stmt: &'p Statement<'a>,
    registry: &DirectiveRegistry,
) -> Option<(Option<String>, &'p CallExpression<'a>)> {
    match stmt {
        Statement::VariableDeclaration(decl) if decl.declarations.len() == 1 => {
            let declarator = decl.declarations.first()?;
            let call = as_directive_call(declarator.init.as_ref()?, registry)?;
            let binding = match &declarator.id.kind {
                BindingPatternKind::BindingIdentifier(ident) => Some(ident.name.to_string()),
                _ => None,
            };
            Some((binding, call))
        }
        Statement::ExpressionStatement(stmt) => {
            Some((None, as_directive_call(&stmt.expression, registry)?))
        }
        _ => None,
    }
}

fn as_directive_call<'p, 'a>(
    expr: &'p Expression<'a>,
    registry: &DirectiveRegistry,
) -> Option<&'p CallExpression<'a>> {
    match expr {
        Expression::CallExpression(call) => match &call.callee {
            Expression::Identifier(ident) if registry.is_liftable(ident.name.as_str()) => {
                Some(&**call)
            }
            _ => None,
        },
        _ => None,
    }
}

fn callee_name(call: &CallExpression<'_>) -> String {
    match &call.callee {
        Expression::Identifier(ident) => ident.name.to_string(),
        _ => String::new(),
    }
}

fn visit_arguments(collector: &mut ReferenceCollector<'_>, args: &[Argument<'_>]) {
    for arg in args {
        match arg {
            Argument::SpreadElement(spread) => collector.visit_expression(&spread.argument),
            _ => {
                if let Some(expr) = arg.as_expression() {
                    collector.visit_expression(expr);
                }
            }
        }
    }
}

fn function_params(func: &Function<'_>) -> Result<Vec<String>> {
    let mut params = Vec::with_capacity(func.params.items.len());
    for param in &func.params.items {
        match &param.pattern.kind {
            BindingPatternKind::BindingIdentifier(ident) => params.push(ident.name.to_string()),
            _ => {
                return Err(FlowError::Lift(format!(
                    "Unsupported parameter pattern in function '{}'",
                    func.id.as_ref().map(|id| id.name.as_str()).unwrap_or("<anonymous>")
                )));
            }
        }
    }
    Ok(params)
}

fn quoted_list(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("{:?}", name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Rewrites `source` into explicit atom declarations.
pub fn transform(
    source: &str,
    file_name: &str,
    registry: &DirectiveRegistry,
    options: &LiftOptions,
) -> Result<LiftedProgram> {
    let allocator = Allocator::default();
    let source_type = SourceType::from_path(Path::new(file_name)).unwrap_or_default();
    let parsed = Parser::new(&allocator, source, source_type).parse();
    if !parsed.errors.is_empty() {
        let errors: Vec<String> = parsed.errors.iter().map(|e| e.to_string()).collect();
        return Err(FlowError::Lift(errors.join("\n")));
    }
    let program = &parsed.program;
    let binding = options.workflow_binding.as_str();

    // Pass 1: ids, atom names, variable aliases and function atoms.
    let mut resolver = SiteResolver::new();
    let mut aliases: HashMap<String, String> = HashMap::new();
    let mut functions: HashSet<String> = HashSet::new();
    for stmt in &program.body {
        if let Some((variable, call)) = top_level_directive(stmt, registry) {
            let directive = callee_name(call);
            let callsite = Callsite::new(file_name, line_of(source, call.span.start));
            let identifier = first_identifier(source, call, &aliases);
            let site = resolver.resolve(call.span.start, &directive, &callsite, identifier.as_deref());
            if let Some(variable) = variable {
                aliases.insert(variable, site.atom);
            }
        } else if let Statement::FunctionDeclaration(func) = stmt {
            if let Some(id) = &func.id {
                functions.insert(id.name.to_string());
            }
        }
    }
    tracing::debug!(
        "Lift pass 1 over {}: {} aliased variables, {} functions",
        file_name,
        aliases.len(),
        functions.len()
    );

    // Pass 2: rewrite.
    let mut declarations = Vec::new();
    let mut imports = Vec::new();
    let mut statements = Vec::new();
    for stmt in &program.body {
        if let Some((variable, call)) = top_level_directive(stmt, registry) {
            let directive = callee_name(call);
            let callsite = Callsite::new(file_name, line_of(source, call.span.start));
            let identifier = first_identifier(source, call, &aliases);
            let site = resolver.resolve(call.span.start, &directive, &callsite, identifier.as_deref());

            let no_functions = HashSet::new();
            let mut collector = ReferenceCollector::new(RewriteMode::Params, &aliases, &no_functions);
            visit_arguments(&mut collector, &call.arguments);
            let dependencies = collector.atoms.clone();
            let params: Vec<String> = (0..dependencies.len()).map(|i| format!("param{}", i)).collect();

            let builder = TemplateBuilder {
                source,
                aliases: &aliases,
                params: &dependencies,
            };
            let args = call
                .arguments
                .iter()
                .map(|arg| match arg.as_expression() {
                    Some(expr) => builder.build(expr),
                    None => ArgTemplate::Opaque(String::new()),
                })
                .collect();

            let body = format!(
                "({}) => {}",
                params.join(", "),
                splice(source, call.span.start, call.span.end, &collector.edits)
            );
            statements.push(format!(
                "{}.atom({:?}, {{ dependencies: [{}], componentId: {:?} }}, {});",
                binding,
                site.atom,
                quoted_list(&dependencies),
                site.id,
                body
            ));
            declarations.push(AtomDeclaration {
                name: site.atom,
                kind: DeclarationKind::Directive {
                    directive,
                    component_id: site.id,
                    identifier,
                    args,
                },
                params,
                dependencies,
                callsite,
                binding: variable,
                body,
            });
            continue;
        }

        match stmt {
            Statement::ImportDeclaration(import) => {
                imports.push(source[import.span.start as usize..import.span.end as usize].to_string());
            }
            Statement::FunctionDeclaration(func) if func.id.is_some() => {
                let name = func.id.as_ref().map(|id| id.name.to_string()).unwrap_or_default();
                let params = function_params(func)?;
                let mut dependencies: Vec<String> = Vec::new();
                for param in &params {
                    let dep = aliases.get(param).cloned().unwrap_or_else(|| param.clone());
                    if !dependencies.contains(&dep) {
                        dependencies.push(dep);
                    }
                }

                let mut callees = functions.clone();
                callees.remove(&name);
                let mut collector = ReferenceCollector::new(RewriteMode::Reads { binding }, &aliases, &callees)
                    .shadow(params.iter().cloned());
                if let Some(body) = &func.body {
                    for inner in &body.statements {
                        collector.visit_statement(inner);
                    }
                }
                for atom in &collector.atoms {
                    if !dependencies.contains(atom) {
                        dependencies.push(atom.clone());
                    }
                }

                let body = splice(source, func.span.start, func.span.end, &collector.edits);
                statements.push(format!(
                    "{}.atom({:?}, {{ dependencies: [{}] }}, {});",
                    binding,
                    name,
                    quoted_list(&dependencies),
                    body
                ));
                declarations.push(AtomDeclaration {
                    callsite: Callsite::new(file_name, line_of(source, func.span.start)),
                    name,
                    kind: DeclarationKind::Function,
                    params,
                    dependencies,
                    binding: None,
                    body,
                });
            }
            _ => {
                let no_functions = HashSet::new();
                let mut collector = ReferenceCollector::new(RewriteMode::Reads { binding }, &aliases, &no_functions);
                collector.visit_statement(stmt);
                let span = statement_span(stmt);
                statements.push(splice(source, span.0, span.1, &collector.edits));
            }
        }
    }

    let mut rewritten = String::new();
    for import in &imports {
        rewritten.push_str(import);
        rewritten.push('\n');
    }
    rewritten.push_str(&format!("const {} = {}();\n", binding, options.factory));
    for statement in &statements {
        rewritten.push_str(statement);
        rewritten.push('\n');
    }
    rewritten.push_str(&format!("{}.execute();\n", binding));

    tracing::info!(
        "Lifted {} atoms from {} ({} directive calls)",
        declarations.len(),
        file_name,
        declarations.iter().filter(|d| d.is_directive()).count()
    );
    Ok(LiftedProgram {
        declarations,
        source: rewritten,
    })
}

fn statement_span(stmt: &Statement<'_>) -> (u32, u32) {
    use oxc::span::GetSpan;
    let span = stmt.span();
    (span.start, span.end)
}

/// The `identifier` property of the call's first object argument.
fn first_identifier(
    source: &str,
    call: &CallExpression<'_>,
    aliases: &HashMap<String, String>,
) -> Option<String> {
    let expr = call.arguments.first()?.as_expression()?;
    let builder = TemplateBuilder {
        source,
        aliases,
        params: &[],
    };
    builder.build(expr).identifier().map(str::to_string)
}

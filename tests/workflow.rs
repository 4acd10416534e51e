use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use atomflow::{
    Atom, AtomStatus, AtomValue, DirectiveRegistry, DirectiveSpec, FlowError, GraphError,
    RetryPolicy, Workflow,
};
use serde_json::json;

fn registry() -> Arc<DirectiveRegistry> {
    let mut registry = DirectiveRegistry::new();
    registry.register(DirectiveSpec::new("text"));
    Arc::new(registry)
}

fn counter() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

/// load -> double -> label, plus an unrelated sibling.
fn pipeline(sibling_calls: &Arc<AtomicU32>) -> Workflow {
    let mut workflow =
        Workflow::new(registry()).with_default_retry_policy(RetryPolicy::no_retry());
    workflow.set_variable("input", 10);

    workflow.register(Atom::new("load", |ctx| {
        let input = ctx.variable("input").unwrap_or_default();
        Ok(AtomValue::Data(input))
    }));
    workflow.register(
        Atom::new("double", |ctx| {
            let load: i64 = ctx.arg_as("load")?;
            Ok((load * 2).into())
        })
        .with_params(["load"]),
    );
    workflow.register(
        Atom::new("label", |ctx| {
            let value: i64 = ctx.arg_as("double")?;
            Ok(ctx.directive("text", json!({ "value": format!("value={}", value) }))?)
        })
        .with_params(["double"]),
    );

    let calls = Arc::clone(sibling_calls);
    workflow.register(Atom::new("sibling", move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok("idle".into())
    }));
    workflow
}

#[test]
fn test_pipeline_recomputes_downstream_of_seed() {
    let sibling_calls = counter();
    let mut workflow = pipeline(&sibling_calls);

    let first = workflow.execute(None).unwrap();
    assert!(first.is_success());
    assert_eq!(first.value("load"), Some(&AtomValue::from(10)));
    assert_eq!(first.value("double"), Some(&AtomValue::from(20)));
    assert_eq!(first.value("label"), Some(&AtomValue::from("value=20")));
    assert_eq!(first.rendered().len(), 1);
    assert_eq!(sibling_calls.load(Ordering::SeqCst), 1);

    workflow.set_variable("input", 5);
    let second = workflow.execute(Some(&["load"])).unwrap();
    assert_eq!(second.value("load"), Some(&AtomValue::from(5)));
    assert_eq!(second.value("double"), Some(&AtomValue::from(10)));
    assert_eq!(second.value("label"), Some(&AtomValue::from("value=10")));
    assert_eq!(second.status("sibling"), Some(AtomStatus::Skipped));
    assert_eq!(sibling_calls.load(Ordering::SeqCst), 1);

    let mut executed = second.executed();
    executed.sort();
    assert_eq!(executed, vec!["double", "label", "load"]);
}

#[test]
fn test_unchanged_pass_is_idempotent() {
    let sibling_calls = counter();
    let mut workflow = pipeline(&sibling_calls);

    workflow.execute(None).unwrap();
    let again = workflow.execute(None).unwrap();

    assert!(again.executed().is_empty());
    assert!(again.rendered().is_empty());
    assert_eq!(again.value("label"), Some(&AtomValue::from("value=20")));
    assert_eq!(sibling_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_forced_rerun_with_same_output_renders_nothing() {
    let sibling_calls = counter();
    let mut workflow = pipeline(&sibling_calls);

    workflow.execute(None).unwrap();
    let forced = workflow.execute(Some(&["load"])).unwrap();

    assert_eq!(forced.status("label"), Some(AtomStatus::Completed));
    assert_eq!(forced.components.len(), 1);
    assert!(forced.rendered().is_empty());
}

#[test]
fn test_retry_policy_bounds_attempts() {
    let attempts = counter();
    let seen = Arc::clone(&attempts);
    let mut workflow = Workflow::new(registry());
    workflow.register(
        Atom::new("flaky", move |_| {
            let attempt = seen.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < 5 {
                anyhow::bail!("attempt {} failed", attempt);
            }
            Ok(attempt.to_string().into())
        })
        .with_retry_policy(RetryPolicy::new(3, Duration::ZERO, 1.0)),
    );
    workflow.register(
        Atom::new("consumer", |ctx| Ok(ctx.arg("flaky")?)).with_params(["flaky"]),
    );

    let outcome = workflow.execute(None).unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.failed.as_deref(), Some("flaky"));

    let failed = outcome.result("flaky").unwrap();
    assert_eq!(failed.status, AtomStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert!(failed.error.as_deref().unwrap().contains("attempt 3 failed"));
    assert!(outcome.result("consumer").is_none());
}

#[test]
fn test_cycle_is_reported_before_any_atom_runs() {
    let calls = counter();
    let mut workflow = Workflow::new(registry());
    for (name, dependency) in [("a", "b"), ("b", "a")] {
        let calls = Arc::clone(&calls);
        workflow.register(
            Atom::new(name, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(AtomValue::null())
            })
            .with_params([dependency]),
        );
    }

    let err = workflow.execute(None).unwrap_err();
    assert!(matches!(err, FlowError::Graph(GraphError::Cycle { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_lazy_pull_records_dynamic_dependency() {
    let mut workflow = Workflow::new(registry());
    workflow.register(Atom::new("config", |_| Ok(json!({"limit": 3}).into())));
    workflow.register(Atom::new("rows", |ctx| {
        let config = ctx.pull("config")?;
        let limit = config
            .as_data()
            .and_then(|value| value["limit"].as_i64())
            .unwrap_or(0);
        Ok(json!((0..limit).collect::<Vec<_>>()).into())
    }));

    let outcome = workflow.execute_relevant_atoms().unwrap();
    assert_eq!(outcome.value("rows"), Some(&AtomValue::from(json!([0, 1, 2]))));
    assert!(workflow.dependencies_of("rows").contains(&"config".to_string()));
    assert_eq!(
        workflow.execution_order().unwrap(),
        vec!["config".to_string(), "rows".to_string()]
    );
}

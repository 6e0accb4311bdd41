//! Handler wrappers that add behavior around a resolver.
//!
//! Each enhancer takes a [`Handler`] and returns a handler, so they compose by
//! nesting. [`enhance`] is the stack applied by [`Resolver::enhanced`]:
//! dependencies are resolved first, then the required-argument gate sees the
//! merged results as available names.
//!
//! [`Resolver::enhanced`]: crate::registry::Resolver::enhanced

use serde_json::Value;
use stepwise_types::Step;
use tracing::{debug, warn};

use crate::{
    config::ErrorPolicy,
    continuation::{Outcome, Suspension},
    registry::{Handler, handler},
};

/// Skip the wrapped handler unless every name in `requiredArgs` is available.
///
/// Available names are the keys present on the step (see [`Step::has_key`]),
/// plus `previous` when the incoming value is non-null. A skipped handler continues the chain with
/// `null`.
pub fn require_args(inner: Handler) -> Handler {
    handler(move |previous, current, next| {
        let Some(required) = current.required_args.as_deref() else {
            return inner(previous, current, next);
        };

        let missing: Vec<&str> = required
            .iter()
            .map(String::as_str)
            .filter(|name| !is_available(name, &previous, current))
            .collect();
        if missing.is_empty() {
            return inner(previous, current, next);
        }

        debug!(kind = %current.kind, missing = ?missing, "required arguments unavailable; skipping handler");
        next.proceed(Value::Null)
    })
}

fn is_available(name: &str, previous: &Value, current: &Step) -> bool {
    current.has_key(name) || (name == "previous" && !previous.is_null())
}

/// Resolve each dependency's sub-pipeline and merge its result under the
/// dependency name before calling the wrapped handler.
///
/// Dependencies are visited in declaration order. A suspended dependency does
/// not stop the remaining ones from being visited, so one pass reports every
/// awaited key; the owning step then suspends with the union. Failures follow
/// the configured [`ErrorPolicy`], except fatal errors which always abort.
pub fn with_dependencies(inner: Handler) -> Handler {
    handler(move |previous, current, next| {
        if !current.has_dependencies() {
            return inner(previous, current, next);
        }

        let scope = next.scope();
        let mut resolved = Vec::with_capacity(current.dependencies.len());
        let mut pending: Option<Suspension> = None;

        for dependency in &current.dependencies {
            match scope.resolve_nested(current, &dependency.sub_steps) {
                Ok(Outcome::Done(completion)) => {
                    resolved.push((dependency.name.clone(), completion.into_value()));
                }
                Ok(Outcome::Suspended(suspension)) => match pending.as_mut() {
                    Some(joined) => joined.merge(suspension),
                    None => pending = Some(suspension),
                },
                Err(error) if error.is_fatal() || scope.config().error_policy == ErrorPolicy::Abort => {
                    return Err(error);
                }
                Err(error) => {
                    warn!(
                        kind = %current.kind,
                        dependency = %dependency.name,
                        error = %error,
                        "dependency failed; continuing with an error marker"
                    );
                    resolved.push((dependency.name.clone(), error.to_value()));
                }
            }
        }

        if let Some(suspension) = pending {
            debug!(
                kind = %current.kind,
                awaiting = suspension.awaiting.len(),
                "dependencies not ready; suspending"
            );
            return Outcome::suspend(suspension);
        }

        inner(previous, &current.merged_with(resolved), next)
    })
}

/// Dependency resolution around the required-argument gate around `inner`.
pub fn enhance(inner: Handler) -> Handler {
    with_dependencies(require_args(inner))
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{
        config::EngineConfig,
        continuation::{Scope, StepResult},
        error::PipelineError,
        pipeline::Pipeline,
        registry::{Resolver, ResolverRegistry},
    };
    use serde_json::json;
    use stepwise_types::Dependency;

    fn run_with(registry: &ResolverRegistry, config: &EngineConfig, steps: &[Step]) -> StepResult {
        let scope = Scope::root(registry, config, None);
        Pipeline::new(steps).invoke(&scope, Value::Null)
    }

    fn literal(kind: &'static str, value: Value) -> Resolver {
        Resolver::new(kind, move |_previous, _current, next| next.proceed(value.clone()))
    }

    #[test]
    fn gate_skips_handler_when_argument_missing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = ResolverRegistry::new([Resolver::enhanced("needs_x", move |_previous, _current, next| {
            counter.fetch_add(1, Ordering::SeqCst);
            next.proceed(json!("ran"))
        })]);
        let config = EngineConfig::default();

        let skipped = run_with(&registry, &config, &[Step::new("needs_x").with_required_args(["x"])]).expect("run");
        assert_eq!(skipped.into_value(), Some(Value::Null));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let step = Step::new("needs_x").with_required_args(["x"]).with_property("x", json!(1));
        let ran = run_with(&registry, &config, &[step]).expect("run");
        assert_eq!(ran.into_value(), Some(json!("ran")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gate_counts_non_null_previous() {
        let registry = ResolverRegistry::new([
            literal("start", json!(3)),
            Resolver::enhanced("double", |previous, _current, next| {
                next.proceed(json!(previous.as_i64().unwrap_or_default() * 2))
            }),
        ]);
        let config = EngineConfig::default();

        let without = run_with(&registry, &config, &[Step::new("double").with_required_args(["previous"])]).expect("run");
        assert_eq!(without.into_value(), Some(Value::Null));

        let with = run_with(
            &registry,
            &config,
            &[Step::new("start"), Step::new("double").with_required_args(["previous"])],
        )
        .expect("run");
        assert_eq!(with.into_value(), Some(json!(6)));
    }

    #[test]
    fn gate_counts_the_kind_key() {
        let registry = ResolverRegistry::new([Resolver::enhanced("tagged", |_previous, current, next| {
            next.proceed(json!(current.kind))
        })]);
        let config = EngineConfig::default();

        let step = Step::new("tagged").with_required_args(["kind"]);
        let ran = run_with(&registry, &config, &[step]).expect("run");
        assert_eq!(ran.into_value(), Some(json!("tagged")));
    }

    #[test]
    fn nested_dependencies_resolve_depth_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let record = move |label: &'static str| {
            let seen = Arc::clone(&seen);
            Resolver::enhanced(label, move |_previous, current, next| {
                seen.lock().unwrap().push(label);
                next.proceed(json!({ "from": label, "props": current.properties.clone() }))
            })
        };
        let registry = ResolverRegistry::new([record("outer"), record("middle"), record("inner")]);
        let config = EngineConfig::default();

        let step = Step::new("outer").with_dependency(Dependency::new(
            "d",
            vec![Step::new("middle").with_dependency(Dependency::new("e", vec![Step::new("inner")]))],
        ));
        let value = run_with(&registry, &config, &[step]).expect("run").into_value().expect("done");

        assert_eq!(*order.lock().unwrap(), vec!["inner", "middle", "outer"]);
        assert_eq!(value["props"]["d"]["from"], "middle");
        assert_eq!(value["props"]["d"]["props"]["e"]["from"], "inner");
    }

    #[test]
    fn original_step_is_left_untouched() {
        let registry = ResolverRegistry::new([
            literal("seven", json!(7)),
            Resolver::enhanced("echo", |_previous, current, next| next.proceed(current.property("d").cloned().unwrap_or_default())),
        ]);
        let config = EngineConfig::default();
        let steps = [Step::new("echo").with_dependency(Dependency::new("d", vec![Step::new("seven")]))];
        let before = steps[0].clone();

        let value = run_with(&registry, &config, &steps).expect("run").into_value();
        assert_eq!(value, Some(json!(7)));
        assert_eq!(steps[0], before);
    }

    #[test]
    fn suspended_dependencies_are_joined() {
        let registry = ResolverRegistry::new([
            Resolver::new("wait_a", |_previous, _current, _next| {
                Outcome::suspend(Suspension::awaiting("a").with_placeholder(json!("loading")))
            }),
            Resolver::new("wait_b", |_previous, _current, _next| Outcome::suspend(Suspension::awaiting("b"))),
            Resolver::enhanced("owner", |_previous, _current, next| next.proceed(json!("unreachable"))),
        ]);
        let config = EngineConfig::default();
        let step = Step::new("owner")
            .with_dependency(Dependency::new("first", vec![Step::new("wait_a")]))
            .with_dependency(Dependency::new("second", vec![Step::new("wait_b")]));

        let outcome = run_with(&registry, &config, &[step]).expect("run");
        let suspension = outcome.suspension().expect("suspended");
        assert_eq!(suspension.awaiting, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(suspension.placeholder, Some(json!("loading")));
    }

    #[test]
    fn isolate_policy_merges_error_marker() {
        let registry = ResolverRegistry::new([
            Resolver::new("boom", |_previous, _current, _next| Err(PipelineError::handler("boom", "exploded"))),
            Resolver::enhanced("echo", |_previous, current, next| next.proceed(current.property("d").cloned().unwrap_or_default())),
        ]);
        let step = Step::new("echo").with_dependency(Dependency::new("d", vec![Step::new("boom")]));

        let aborting = EngineConfig::default();
        let error = run_with(&registry, &aborting, std::slice::from_ref(&step)).expect_err("abort");
        assert_eq!(error, PipelineError::handler("boom", "exploded"));

        let isolating = EngineConfig {
            error_policy: ErrorPolicy::Isolate,
            ..Default::default()
        };
        let value = run_with(&registry, &isolating, &[step]).expect("run").into_value().expect("done");
        assert_eq!(value["$error"]["kind"], "handler");
    }

    #[test]
    fn fatal_errors_abort_even_when_isolating() {
        let registry = ResolverRegistry::new([Resolver::enhanced("echo", |previous, _current, next| next.proceed(previous))]);
        let config = EngineConfig {
            error_policy: ErrorPolicy::Isolate,
            ..Default::default()
        };
        let step = Step::new("echo").with_dependency(Dependency::new("d", vec![Step::new("nope")]));

        let error = run_with(&registry, &config, &[step]).expect_err("fatal");
        assert_eq!(error, PipelineError::UnresolvedKind { kind: "nope".into() });
    }
}

//! Composition of a step sequence into one continuation chain.
//!
//! Steps are folded last-to-first: the running continuation starts as the
//! terminal, and each step wraps it in a continuation that looks up the step's
//! handler and calls it with the downstream continuation as `next`. Invoking
//! the outermost continuation runs the whole chain. Nothing is cached between
//! invocations, so invoking again re-runs every handler.

use serde_json::Value;
use stepwise_types::Step;
use tracing::trace;

use crate::{
    continuation::{Completion, Continuation, Next, Outcome, Scope, StepResult},
    error::PipelineError,
};

/// Caller-supplied terminal continuation applied to the last step's value.
pub type Render = dyn Fn(Value) -> Result<Value, PipelineError> + Send + Sync;

/// A step sequence ready to be invoked against a [`Scope`].
#[derive(Clone, Copy)]
pub struct Pipeline<'a> {
    steps: &'a [Step],
    render: Option<&'a Render>,
}

impl<'a> Pipeline<'a> {
    /// Pipeline whose terminal is the identity.
    pub fn new(steps: &'a [Step]) -> Self {
        Self { steps, render: None }
    }

    pub fn with_render(mut self, render: Option<&'a Render>) -> Self {
        self.render = render;
        self
    }

    pub fn steps(&self) -> &'a [Step] {
        self.steps
    }

    /// Run the chain with `seed` as the first handler's `previous`.
    ///
    /// An empty pipeline hands `seed` straight to the terminal.
    pub fn invoke(&self, scope: &Scope<'_>, seed: Value) -> StepResult {
        let render = self.render;
        let mut chain: Box<Continuation<'_>> = Box::new(move |value: Value| {
            let value = match render {
                Some(render) => render(value)?,
                None => value,
            };
            Ok(Outcome::Done(Completion::new(value)))
        });

        for (index, step) in self.steps.iter().enumerate().rev() {
            let downstream = chain;
            chain = Box::new(move |previous: Value| {
                trace!(kind = %step.kind, index, depth = scope.depth(), "dispatching step");
                let handler = scope.registry().lookup(&step.kind)?;
                handler(previous, step, Next::new(&*downstream, scope))
            });
        }

        chain(seed)
    }
}

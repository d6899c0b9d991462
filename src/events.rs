//! Event hooks for chain execution.
//!
//! Provides an optional, non-intrusive way to observe a run: the executor
//! emits events as steps move through their phases, and the orchestrator
//! emits one whenever a fallback model is used. Implement [`EventHandler`]
//! for progress tracking or audit logs. Structured `tracing` output is
//! emitted regardless.

use crate::types::{StepPhase, StepStatus};
use std::sync::Arc;

/// Events emitted during chain execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A chain run has started.
    ChainStart {
        /// Total steps in the chain, disabled ones included.
        steps: usize,
        enabled: usize,
    },
    /// A step entered a new phase.
    StepPhase { order: u32, phase: StepPhase },
    /// A step reached a terminal status.
    StepEnd {
        order: u32,
        status: StepStatus,
        duration_ms: u64,
    },
    /// The requested model could not be resolved and the fallback served instead.
    Fallback { requested: String, used: String },
    /// A safety-blocked call was retried once on the safety fallback model.
    SafetyFallback {
        blocked: String,
        used: String,
        /// Whether the retry produced a usable response.
        ok: bool,
    },
    /// A chain run has finished (always emitted, even when cancelled).
    ChainEnd {
        succeeded: usize,
        failed: usize,
        cancelled: bool,
        duration_ms: u64,
    },
}

/// Handler for chain execution events.
///
/// This is entirely optional; chains run the same without one.
///
/// # Example
///
/// ```
/// use novel_rulechain::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         match event {
///             Event::StepEnd { order, status, .. } => println!("step {order}: {status:?}"),
///             Event::Fallback { requested, used } => println!("{requested} -> {used}"),
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use novel_rulechain::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     if let Event::ChainEnd { failed, .. } = event {
///         eprintln!("{failed} step(s) failed");
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}

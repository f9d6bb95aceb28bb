use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::error;
use tokio::runtime::Handle;

use crate::config::CallbackMode;
use crate::eval::{Error, EvaluationWarning};
use crate::flag_value::{FlagType, FlagValue};
use crate::loader::{LoadError, RawSpec};
use crate::spec::Specification;
use crate::validation::ValidationError;

/// Something observable that happened inside a [crate::Client].
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// A load try failed: the loader returned an error, panicked or timed out.
    SpecLoaderFailure { attempt: u32, error: LoadError },
    /// A load try returned a result that did not come from the validator it was given.
    ValidatorFailure { attempt: u32, error: LoadError },
    /// The loader's payload failed validation.
    SpecValidationFailure {
        attempt: u32,
        raw: RawSpec,
        error: ValidationError,
    },
    /// A new specification was loaded and is now in use.
    SpecLoaded { specification: Arc<Specification> },
    /// An evaluation returned an emergency fallback.
    EmergencyFallbackUsed {
        flag_name: String,
        flag_type: FlagType,
        reason: Error,
        value: FlagValue,
    },
    /// An evaluation met a missing or mistyped context value.
    EvaluationWarning {
        flag_name: String,
        warning: EvaluationWarning,
    },
}

impl ClientEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::SpecLoaderFailure { .. } => "spec-loader-failure",
            ClientEvent::ValidatorFailure { .. } => "validator-failure",
            ClientEvent::SpecValidationFailure { .. } => "spec-validation-failure",
            ClientEvent::SpecLoaded { .. } => "spec-loaded",
            ClientEvent::EmergencyFallbackUsed { .. } => "emergency-fallback-used",
            ClientEvent::EvaluationWarning { .. } => "evaluation-warning",
        }
    }
}

/// Receives [ClientEvent]s. Any `Fn(&ClientEvent)` closure is a recorder.
pub trait EventRecorder: Send + Sync + 'static {
    fn record(&self, event: &ClientEvent);
}

impl<F> EventRecorder for F
where
    F: Fn(&ClientEvent) + Send + Sync + 'static,
{
    fn record(&self, event: &ClientEvent) {
        (self)(event)
    }
}

/// Delivers events to the configured recorder. A panicking recorder is logged and otherwise
/// ignored, in either mode.
#[derive(Clone)]
pub(crate) struct EventDispatcher {
    recorder: Option<Arc<dyn EventRecorder>>,
    mode: CallbackMode,
}

impl EventDispatcher {
    pub(crate) fn new(recorder: Option<Arc<dyn EventRecorder>>, mode: CallbackMode) -> Self {
        Self { recorder, mode }
    }

    pub(crate) fn dispatch(&self, event: ClientEvent) {
        let recorder = match &self.recorder {
            Some(recorder) => recorder,
            None => return,
        };

        if self.mode == CallbackMode::Blocking {
            deliver(recorder.as_ref(), &event);
            return;
        }

        // The yield defers a current-thread runtime past the caller's turn. Other workers of a
        // multi-thread runtime may deliver sooner. Outside a runtime there is no task to defer to.
        match Handle::try_current() {
            Ok(handle) => {
                let recorder = recorder.clone();
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    deliver(recorder.as_ref(), &event);
                });
            }
            Err(_) => deliver(recorder.as_ref(), &event),
        }
    }
}

fn deliver(recorder: &dyn EventRecorder, event: &ClientEvent) {
    if catch_unwind(AssertUnwindSafe(|| recorder.record(event))).is_err() {
        error!("Event recorder panicked while handling a {} event", event.kind());
    }
}

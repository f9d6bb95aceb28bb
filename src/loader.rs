use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::spec::Specification;
use crate::validation::{self, ValidationError};

/// Error type a [SpecLoader] may fail with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A specification payload as fetched by a loader, before validation.
#[derive(Clone, Debug, PartialEq)]
pub enum RawSpec {
    /// JSON text.
    Text(String),
    /// An already-parsed JSON document.
    Json(Value),
}

impl From<String> for RawSpec {
    fn from(text: String) -> Self {
        RawSpec::Text(text)
    }
}

impl From<&str> for RawSpec {
    fn from(text: &str) -> Self {
        RawSpec::Text(text.to_string())
    }
}

impl From<Value> for RawSpec {
    fn from(json: Value) -> Self {
        RawSpec::Json(json)
    }
}

/// What a [SpecValidator] made of a [RawSpec].
#[derive(Clone, Debug)]
pub enum ValidationOutcome {
    Valid(Arc<Specification>),
    Invalid { raw: RawSpec, error: ValidationError },
}

/// The result of [SpecValidator::validate].
///
/// A loader cannot build one of these itself, and the client only accepts the one produced by the
/// validator it handed out for the current try; anything else fails the try with
/// [LoadError::ValidatorContractViolation].
#[derive(Debug)]
pub struct ValidatedSpec {
    token: u64,
    outcome: ValidationOutcome,
}

impl ValidatedSpec {
    pub fn outcome(&self) -> &ValidationOutcome {
        &self.outcome
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.outcome, ValidationOutcome::Valid(_))
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    pub(crate) fn into_outcome(self) -> ValidationOutcome {
        self.outcome
    }
}

static NEXT_VALIDATOR_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A single-use capability to validate one payload, handed to a [SpecLoader] for each try.
///
/// [SpecValidator::validate] consumes the validator, so a loader can validate at most once per
/// try, and must return the [ValidatedSpec] it got back.
#[derive(Debug)]
pub struct SpecValidator {
    token: u64,
    skip_validation: bool,
}

impl SpecValidator {
    pub(crate) fn new(skip_validation: bool) -> Self {
        Self {
            token: NEXT_VALIDATOR_TOKEN.fetch_add(1, Ordering::Relaxed),
            skip_validation,
        }
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    /// Validates `raw` structurally and semantically. When the client is configured with
    /// `dangerously_skip_validation`, only the structural step runs.
    pub fn validate(self, raw: impl Into<RawSpec>) -> ValidatedSpec {
        let raw = raw.into();
        let parsed = match &raw {
            RawSpec::Text(text) => validation::parse_str(text),
            RawSpec::Json(json) => validation::parse_value(json),
        };
        let checked = parsed.and_then(|spec| {
            if !self.skip_validation {
                validation::validate(&spec)?;
            }
            Ok(spec)
        });

        let outcome = match checked {
            Ok(spec) => ValidationOutcome::Valid(Arc::new(spec)),
            Err(error) => ValidationOutcome::Invalid { raw, error },
        };
        ValidatedSpec {
            token: self.token,
            outcome,
        }
    }
}

/// Fetches a specification from wherever the host keeps it.
///
/// An implementation receives a fresh [SpecValidator] on every try, must pass the payload it
/// fetched to it, and return the resulting [ValidatedSpec] unchanged. Any `Fn(SpecValidator)`
/// closure returning a suitable future is a loader.
///
/// # Example
///
/// ```
/// use flagspec::{BoxError, SpecValidator, ValidatedSpec};
///
/// async fn load_from_disk(validator: SpecValidator) -> Result<ValidatedSpec, BoxError> {
///     let text = std::fs::read_to_string("flags.json")?;
///     Ok(validator.validate(text))
/// }
/// ```
#[async_trait]
pub trait SpecLoader: Send + Sync + 'static {
    async fn load(&self, validator: SpecValidator) -> Result<ValidatedSpec, BoxError>;
}

#[async_trait]
impl<F, Fut> SpecLoader for F
where
    F: Fn(SpecValidator) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ValidatedSpec, BoxError>> + Send + 'static,
{
    async fn load(&self, validator: SpecValidator) -> Result<ValidatedSpec, BoxError> {
        (self)(validator).await
    }
}

/// Why a single load try failed.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum LoadError {
    #[error("spec loader failed: {0}")]
    Loader(String),

    #[error("spec loader panicked")]
    Panicked,

    #[error("spec loader did not finish within {0:?}")]
    Timeout(Duration),

    #[error("spec loader did not return the result of the validator it was given")]
    ValidatorContractViolation,

    #[error("spec loader returned an invalid specification: {0}")]
    Invalid(#[from] ValidationError),
}

/// Every try of one load sequence failed.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("failed to load a specification after {attempts} attempt(s): {last_error}")]
pub struct LoadSequenceError {
    pub attempts: u32,
    pub last_error: LoadError,
}

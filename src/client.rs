use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, error, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::time::{sleep, timeout, Instant};

use crate::config::{ClientConfig, TypeMismatchPolicy};
use crate::context::EvaluationContext;
use crate::eval::{self, Detail, EvaluationMetadata, EvaluationWarning, WarningRecorder};
use crate::events::{ClientEvent, EventDispatcher, EventRecorder};
use crate::flag::FeatureFlag;
use crate::flag_value::{FlagType, FlagValue};
use crate::loader::{LoadError, LoadSequenceError, SpecLoader, SpecValidator, ValidationOutcome};
use crate::spec::Specification;
use crate::store::Store;

/// The only error an evaluation returns, and only under [TypeMismatchPolicy::Error].
#[derive(Clone, Debug, PartialEq, Error)]
pub enum EvaluationError {
    #[error("flag '{flag_name}' is a {actual} flag but was evaluated as {expected}")]
    TypeMismatch {
        flag_name: String,
        expected: FlagType,
        actual: FlagType,
    },
}

type LoadResult = Result<Arc<Specification>, LoadSequenceError>;
type LoadFuture = Shared<BoxFuture<'static, LoadResult>>;

#[derive(Default)]
struct State {
    specification: Option<Arc<Specification>>,
    loaded_at: Option<Instant>,
    load_failed_at: Option<Instant>,
    in_flight: Option<LoadFuture>,
}

struct ClientInner {
    config: ClientConfig,
    loader: Arc<dyn SpecLoader>,
    events: EventDispatcher,
    state: Mutex<State>,
}

/// Client owns the lifecycle of a specification and evaluates flags against it.
///
/// Loads are single-flight: however many evaluations need a specification at once, the loader runs
/// one sequence of tries at a time and everyone shares its result. A cached specification is served
/// until it goes stale, then refreshed in the background while evaluations wait for at most
/// `refresh_wait_ms`. Whenever no usable specification or flag is available, evaluations return an
/// emergency fallback instead of failing.
///
/// The client runs its loads on the ambient tokio runtime. Cloning a client is cheap and clones share
/// all state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Creates a client. With `initial_load` configured, loading starts immediately if a tokio
    /// runtime is available, or on the first evaluation otherwise.
    pub fn new(config: ClientConfig, loader: impl SpecLoader) -> Self {
        Self::build(config, Arc::new(loader), None)
    }

    /// Creates a client that reports [ClientEvent]s to `recorder`.
    pub fn with_event_recorder(
        config: ClientConfig,
        loader: impl SpecLoader,
        recorder: impl EventRecorder,
    ) -> Self {
        Self::build(config, Arc::new(loader), Some(Arc::new(recorder)))
    }

    fn build(
        config: ClientConfig,
        loader: Arc<dyn SpecLoader>,
        recorder: Option<Arc<dyn EventRecorder>>,
    ) -> Self {
        let inner = Arc::new(ClientInner {
            events: EventDispatcher::new(recorder, config.callback_mode),
            config,
            loader,
            state: Mutex::new(State::default()),
        });

        if inner.config.initial_load {
            if Handle::try_current().is_ok() {
                // Runs to completion whether or not anyone waits for it.
                let _ = inner.load_in_flight();
            } else {
                warn!("No tokio runtime is available; the specification will be loaded on first use");
            }
        }
        Client { inner }
    }

    /// Loads a specification now, or joins the load already in flight.
    pub async fn load_spec(&self) -> Result<Arc<Specification>, LoadSequenceError> {
        self.inner.load_in_flight().await
    }

    /// The specification currently in use, without loading or refreshing it.
    pub fn specification(&self) -> Option<Arc<Specification>> {
        self.inner.state.lock().specification.clone()
    }

    /// Evaluates the flag named `flag_name` as `flag_type` and explains the result.
    ///
    /// The returned detail always holds a value of `flag_type`. When the flag could not be
    /// evaluated its reason is [eval::Reason::Error] and the value is an emergency fallback.
    pub async fn evaluate_detail(
        &self,
        flag_name: &str,
        context: &EvaluationContext,
        flag_type: FlagType,
    ) -> Result<Detail<FlagValue>, EvaluationError> {
        match self.inner.specification_for_evaluation().await {
            Some(spec) => self.inner.evaluate_in(&spec, flag_name, context, flag_type),
            None => Ok(self
                .inner
                .fallback(flag_name, flag_type, eval::Error::SpecNotAvailable, true)),
        }
    }

    pub async fn bool_value(
        &self,
        flag_name: &str,
        context: &EvaluationContext,
    ) -> Result<bool, EvaluationError> {
        let detail = self
            .evaluate_detail(flag_name, context, FlagType::Boolean)
            .await?;
        Ok(detail
            .value
            .as_bool()
            .unwrap_or(self.inner.config.emergency_fallbacks_by_type.boolean))
    }

    pub async fn number_value(
        &self,
        flag_name: &str,
        context: &EvaluationContext,
    ) -> Result<f64, EvaluationError> {
        let detail = self
            .evaluate_detail(flag_name, context, FlagType::Number)
            .await?;
        Ok(detail
            .value
            .as_number()
            .unwrap_or(self.inner.config.emergency_fallbacks_by_type.number))
    }

    pub async fn string_value(
        &self,
        flag_name: &str,
        context: &EvaluationContext,
    ) -> Result<String, EvaluationError> {
        let detail = self
            .evaluate_detail(flag_name, context, FlagType::String)
            .await?;
        Ok(detail.value.as_string().unwrap_or_else(|| {
            self.inner
                .config
                .emergency_fallbacks_by_type
                .string
                .clone()
        }))
    }

    /// Evaluates every flag of the specification, each as its declared type, keyed by flag name.
    ///
    /// Without a specification the result holds the by-name emergency fallbacks, each reported as a
    /// [ClientEvent::EmergencyFallbackUsed].
    pub async fn evaluate_all(&self, context: &EvaluationContext) -> HashMap<String, FlagValue> {
        let spec = match self.inner.specification_for_evaluation().await {
            Some(spec) => spec,
            None => {
                return self
                    .inner
                    .config
                    .emergency_fallbacks_by_name
                    .iter()
                    .map(|(flag_name, value)| {
                        let detail = self.inner.fallback(
                            flag_name,
                            value.flag_type(),
                            eval::Error::SpecNotAvailable,
                            true,
                        );
                        (flag_name.clone(), detail.value)
                    })
                    .collect()
            }
        };

        spec.feature_flags()
            .iter()
            .filter_map(|flag| {
                let detail = self
                    .inner
                    .evaluate_in(&spec, &flag.name, context, flag.flag_type)
                    .ok()?;
                Some((flag.name.clone(), detail.value))
            })
            .collect()
    }
}

#[derive(Default)]
struct CollectedWarnings {
    warnings: RefCell<Vec<EvaluationWarning>>,
}

impl WarningRecorder for CollectedWarnings {
    fn record(&self, warning: EvaluationWarning) {
        self.warnings.borrow_mut().push(warning);
    }
}

impl ClientInner {
    /// Returns the shared future of the load in flight, starting a new load sequence if there is
    /// none.
    fn load_in_flight(self: &Arc<Self>) -> LoadFuture {
        let mut state = self.state.lock();
        if let Some(in_flight) = &state.in_flight {
            return in_flight.clone();
        }

        let inner = self.clone();
        let sequence = tokio::spawn(async move { inner.run_load_sequence().await });
        let load = async move {
            sequence.await.unwrap_or_else(|_| {
                Err(LoadSequenceError {
                    attempts: 0,
                    last_error: LoadError::Panicked,
                })
            })
        }
        .boxed()
        .shared();

        state.in_flight = Some(load.clone());
        load
    }

    async fn run_load_sequence(self: Arc<Self>) -> LoadResult {
        let attempts = self.config.max_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            debug!("Loading specification, attempt {} of {}", attempt, attempts);
            match self.try_load(attempt).await {
                Ok(spec) => {
                    {
                        let mut state = self.state.lock();
                        state.specification = Some(spec.clone());
                        state.loaded_at = Some(Instant::now());
                        state.in_flight = None;
                    }
                    debug!("Loaded specification on attempt {}", attempt);
                    self.events.dispatch(ClientEvent::SpecLoaded {
                        specification: spec.clone(),
                    });
                    return Ok(spec);
                }
                Err(error) => {
                    self.report_failure(attempt, &error);
                    if attempt >= attempts {
                        let mut state = self.state.lock();
                        state.load_failed_at = Some(Instant::now());
                        state.in_flight = None;
                        return Err(LoadSequenceError {
                            attempts,
                            last_error: error,
                        });
                    }
                }
            }
            attempt += 1;
            sleep(self.config.retry_delay()).await;
        }
    }

    async fn try_load(&self, attempt: u32) -> Result<Arc<Specification>, LoadError> {
        let validator = SpecValidator::new(self.config.dangerously_skip_validation);
        let token = validator.token();
        let loader = self.loader.clone();
        let task = tokio::spawn(async move {
            loader
                .load(validator)
                .await
                .map_err(|e| LoadError::Loader(e.to_string()))
        });

        // A timed out task is left to finish on its own; its result is dropped.
        let joined = match self.config.loader_timeout() {
            Some(limit) => timeout(limit, task)
                .await
                .map_err(|_| LoadError::Timeout(limit))?,
            None => task.await,
        };
        let validated = joined.map_err(|_| LoadError::Panicked)??;

        if validated.token() != token {
            return Err(LoadError::ValidatorContractViolation);
        }
        match validated.into_outcome() {
            ValidationOutcome::Valid(spec) => Ok(spec),
            ValidationOutcome::Invalid { raw, error } => {
                self.events.dispatch(ClientEvent::SpecValidationFailure {
                    attempt,
                    raw,
                    error: error.clone(),
                });
                Err(LoadError::Invalid(error))
            }
        }
    }

    fn report_failure(&self, attempt: u32, error: &LoadError) {
        warn!("Specification load attempt {} failed: {}", attempt, error);
        let event = match error {
            // Reported along with the rejected payload when it was validated.
            LoadError::Invalid(_) => return,
            LoadError::ValidatorContractViolation => ClientEvent::ValidatorFailure {
                attempt,
                error: error.clone(),
            },
            _ => ClientEvent::SpecLoaderFailure {
                attempt,
                error: error.clone(),
            },
        };
        self.events.dispatch(event);
    }

    /// The specification an evaluation should use, loading or refreshing it as needed. None means
    /// the evaluation falls back.
    async fn specification_for_evaluation(self: &Arc<Self>) -> Option<Arc<Specification>> {
        let (current, stale, failed_before) = {
            let state = self.state.lock();
            let stale = match (state.loaded_at, self.config.cache_stale_time()) {
                (Some(loaded_at), Some(stale_time)) => loaded_at.elapsed() > stale_time,
                _ => true,
            };
            (
                state.specification.clone(),
                stale,
                state.load_failed_at.is_some(),
            )
        };

        match current {
            // After a failed sequence nobody waits for the backing store again.
            None if failed_before => {
                let _ = self.load_in_flight();
                None
            }
            None => self.load_in_flight().await.ok(),
            Some(spec) if !stale => Some(spec),
            Some(spec) => {
                debug!("Cached specification is stale, refreshing");
                let refresh = self.load_in_flight();
                if let (Some(wait), false) = (self.config.refresh_wait(), failed_before) {
                    let _ = timeout(wait, refresh).await;
                }
                let latest = self.state.lock().specification.clone();
                Some(latest.unwrap_or(spec))
            }
        }
    }

    fn evaluate_in(
        &self,
        spec: &Specification,
        flag_name: &str,
        context: &EvaluationContext,
        flag_type: FlagType,
    ) -> Result<Detail<FlagValue>, EvaluationError> {
        let flag = match spec.flag_by_name(flag_name) {
            Some(flag) => flag,
            None => return Ok(self.fallback(flag_name, flag_type, eval::Error::FlagNotFound, true)),
        };

        if flag.flag_type != flag_type {
            if self.config.type_mismatch_policy == TypeMismatchPolicy::Error {
                return Err(EvaluationError::TypeMismatch {
                    flag_name: flag_name.to_string(),
                    expected: flag_type,
                    actual: flag.flag_type,
                });
            }
            return Ok(self.fallback(flag_name, flag_type, eval::Error::WrongType, false));
        }

        let warnings = CollectedWarnings::default();
        let outcome = catch_unwind(AssertUnwindSafe(|| evaluate_flag(spec, flag, context, &warnings)));
        for warning in warnings.warnings.into_inner() {
            self.events.dispatch(ClientEvent::EvaluationWarning {
                flag_name: flag_name.to_string(),
                warning,
            });
        }

        match outcome {
            Ok(detail) if detail.value.is_type(flag_type) => Ok(detail),
            Ok(_) => {
                warn!("Flag {} yielded a value that is not a {}", flag_name, flag_type);
                Ok(self.fallback(flag_name, flag_type, eval::Error::WrongType, false))
            }
            Err(_) => {
                error!("Evaluation of flag {} panicked", flag_name);
                Ok(self.fallback(flag_name, flag_type, eval::Error::Exception, true))
            }
        }
    }

    fn fallback(
        &self,
        flag_name: &str,
        flag_type: FlagType,
        reason: eval::Error,
        consult_by_name: bool,
    ) -> Detail<FlagValue> {
        let value = self
            .config
            .emergency_fallback(flag_name, flag_type, consult_by_name);
        debug!(
            "Using emergency fallback {:?} for flag {} ({:?})",
            value, flag_name, reason
        );
        self.events.dispatch(ClientEvent::EmergencyFallbackUsed {
            flag_name: flag_name.to_string(),
            flag_type,
            reason,
            value: value.clone(),
        });
        Detail::err_default(reason, value)
    }
}

fn evaluate_flag(
    spec: &Specification,
    flag: &FeatureFlag,
    context: &EvaluationContext,
    warnings: &CollectedWarnings,
) -> Detail<FlagValue> {
    let mut metadata = EvaluationMetadata::for_context(spec, context).with_warning_recorder(warnings);
    eval::evaluate(spec, flag, context, &mut metadata).map(FlagValue::clone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CallbackMode, TypeFallbacks};
    use crate::eval::Reason;
    use crate::loader::{BoxError, RawSpec, ValidatedSpec};
    use crate::test_common::{context, RecordingEvents, FIXTURE_SPEC};
    use async_trait::async_trait;
    use maplit::hashmap;
    use serde_json::json;
    use spectral::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn blocking_config() -> ClientConfig {
        ClientConfig::new().with_callback_mode(CallbackMode::Blocking)
    }

    fn fixture_loader(
        calls: Arc<AtomicUsize>,
    ) -> impl Fn(SpecValidator) -> BoxFuture<'static, Result<ValidatedSpec, BoxError>> + Send + Sync
    {
        move |validator: SpecValidator| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(validator.validate(FIXTURE_SPEC)) }.boxed()
        }
    }

    /// Fails the first `failures` calls, then serves the fixture.
    fn flaky_loader(
        calls: Arc<AtomicUsize>,
        failures: usize,
    ) -> impl Fn(SpecValidator) -> BoxFuture<'static, Result<ValidatedSpec, BoxError>> + Send + Sync
    {
        move |validator: SpecValidator| {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call <= failures {
                    Err(format!("backend unavailable ({})", call).into())
                } else {
                    Ok(validator.validate(FIXTURE_SPEC))
                }
            }
            .boxed()
        }
    }

    fn slow_loader(
        calls: Arc<AtomicUsize>,
        delay: Duration,
    ) -> impl Fn(SpecValidator) -> BoxFuture<'static, Result<ValidatedSpec, BoxError>> + Send + Sync
    {
        move |validator: SpecValidator| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                sleep(delay).await;
                Ok(validator.validate(FIXTURE_SPEC))
            }
            .boxed()
        }
    }

    struct PanickingLoader;

    #[async_trait]
    impl SpecLoader for PanickingLoader {
        async fn load(&self, _validator: SpecValidator) -> Result<ValidatedSpec, BoxError> {
            panic!("loader bug")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn evaluates_against_loaded_spec() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = Client::new(blocking_config(), fixture_loader(calls.clone()));

        let acme = context(json!({"email": "x@acme.com"}));
        let other = context(json!({"email": "x@foo.com"}));
        assert_that!(client.bool_value("ai-pilot", &acme).await).is_equal_to(Ok(true));
        assert_that!(client.bool_value("ai-pilot", &other).await).is_equal_to(Ok(false));
        assert_that!(client.number_value("max-upload-mb", &context(json!({"age": 30}))).await)
            .is_equal_to(Ok(100.0));
        assert_that!(client.string_value("dark-launch", &acme).await)
            .is_equal_to(Ok("off".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_loader_without_retries_falls_back() {
        let calls = Arc::new(AtomicUsize::new(0));
        let events = RecordingEvents::default();
        let config = blocking_config()
            .with_max_retries(0)
            .with_emergency_fallback("ai-pilot", true);
        let client = Client::with_event_recorder(
            config,
            flaky_loader(calls.clone(), usize::MAX),
            events.clone(),
        );

        let detail = client
            .evaluate_detail("ai-pilot", &context(json!({})), FlagType::Boolean)
            .await
            .unwrap();
        assert_that!(detail.value).is_equal_to(FlagValue::Bool(true));
        assert_that!(detail.reason).is_equal_to(Reason::Error {
            error: eval::Error::SpecNotAvailable,
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_that!(events.kinds())
            .is_equal_to(vec!["spec-loader-failure", "emergency-fallback-used"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_the_loader_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let events = RecordingEvents::default();
        let config = blocking_config().with_max_retries(5).with_initial_load(false);
        let client =
            Client::with_event_recorder(config, flaky_loader(calls.clone(), 5), events.clone());

        let started = Instant::now();
        let spec = client.load_spec().await.expect("sixth try should succeed");
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_that!(started.elapsed()).is_equal_to(Duration::from_millis(5 * 2_500));
        assert_that!(client.specification()).is_some();
        assert!(Arc::ptr_eq(&spec, &client.specification().unwrap()));

        let kinds = events.kinds();
        assert_that!(kinds).has_length(6);
        assert_that!(kinds[..5].to_vec()).is_equal_to(vec!["spec-loader-failure"; 5]);
        assert_that!(kinds[5]).is_equal_to("spec-loaded");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_the_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = blocking_config().with_max_retries(2).with_initial_load(false);
        let client = Client::new(config, flaky_loader(calls.clone(), usize::MAX));

        let error = client.load_spec().await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_that!(error).is_equal_to(LoadSequenceError {
            attempts: 3,
            last_error: LoadError::Loader("backend unavailable (3)".into()),
        });
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_evaluations_share_one_load() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = blocking_config().with_initial_load(false);
        let client = Client::new(config, slow_loader(calls.clone(), Duration::from_secs(1)));
        let ctx = context(json!({"email": "x@acme.com"}));

        let (a, b, c) = tokio::join!(
            client.bool_value("ai-pilot", &ctx),
            client.bool_value("ai-pilot", &ctx),
            client.bool_value("ai-pilot", &ctx),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_that!(vec![a, b, c]).is_equal_to(vec![Ok(true), Ok(true), Ok(true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_spec_is_refreshed_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = blocking_config()
            .with_cache_stale_time_ms(250)
            .with_initial_load(false);
        let client = Client::new(config, fixture_loader(calls.clone()));
        let ctx = context(json!({}));

        let first = client.load_spec().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(200)).await;
        client.bool_value("ai-pilot", &ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(100)).await;
        client.bool_value("ai-pilot", &ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&first, &client.specification().unwrap()));

        client.bool_value("ai-pilot", &ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_wait_is_bounded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = blocking_config()
            .with_cache_stale_time_ms(-1)
            .with_refresh_wait_ms(100)
            .with_loader_timeout_ms(-1)
            .with_initial_load(false);
        let client = Client::new(config, slow_loader(calls.clone(), Duration::from_secs(5)));
        let first = client.load_spec().await.unwrap();

        let started = Instant::now();
        let detail = client
            .evaluate_detail("ai-pilot", &context(json!({})), FlagType::Boolean)
            .await
            .unwrap();
        assert_that!(started.elapsed()).is_equal_to(Duration::from_millis(100));
        assert_that!(detail.reason).is_equal_to(Reason::Default);
        assert!(Arc::ptr_eq(&first, &client.specification().unwrap()));

        // the refresh keeps running after the caller stopped waiting
        sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&first, &client.specification().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_serving_the_stale_spec() {
        let calls = Arc::new(AtomicUsize::new(0));
        let served = calls.clone();
        let loader = move |validator: SpecValidator| {
            let call = served.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call == 1 {
                    Ok(validator.validate(FIXTURE_SPEC))
                } else {
                    Err::<ValidatedSpec, BoxError>("backend unavailable".into())
                }
            }
        };
        let config = blocking_config()
            .with_cache_stale_time_ms(-1)
            .with_max_retries(0)
            .with_initial_load(false);
        let client = Client::new(config, loader);
        client.load_spec().await.unwrap();

        let ctx = context(json!({"email": "x@acme.com"}));
        assert_that!(client.bool_value("ai-pilot", &ctx).await).is_equal_to(Ok(true));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_that!(client.bool_value("ai-pilot", &ctx).await).is_equal_to(Ok(true));
    }

    #[tokio::test(start_paused = true)]
    async fn no_blocking_after_a_failed_sequence() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = blocking_config()
            .with_max_retries(0)
            .with_loader_timeout_ms(-1)
            .with_initial_load(false);
        let client = Client::new(config, slow_loader(calls.clone(), Duration::from_secs(10)));

        // the first sequence never returns a usable spec
        let failing = Client::new(
            blocking_config().with_max_retries(0),
            flaky_loader(Arc::new(AtomicUsize::new(0)), usize::MAX),
        );
        assert_that!(failing.load_spec().await).is_err();
        let started = Instant::now();
        assert_that!(failing.bool_value("ai-pilot", &context(json!({}))).await)
            .is_equal_to(Ok(false));
        assert_that!(started.elapsed()).is_equal_to(Duration::ZERO);

        // while the very first evaluation of a fresh client does wait for its load
        let started = Instant::now();
        assert_that!(client.bool_value("ai-pilot", &context(json!({}))).await)
            .is_equal_to(Ok(false));
        assert_that!(started.elapsed()).is_equal_to(Duration::from_secs(10));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_tries_fail() {
        let calls = Arc::new(AtomicUsize::new(0));
        let events = RecordingEvents::default();
        let config = blocking_config()
            .with_loader_timeout_ms(100)
            .with_max_retries(1)
            .with_retry_delay_ms(10)
            .with_initial_load(false);
        let client = Client::with_event_recorder(
            config,
            slow_loader(calls.clone(), Duration::from_secs(60)),
            events.clone(),
        );

        let started = Instant::now();
        let error = client.load_spec().await.unwrap_err();
        assert_that!(started.elapsed()).is_equal_to(Duration::from_millis(210));
        assert_that!(error.last_error).is_equal_to(LoadError::Timeout(Duration::from_millis(100)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_that!(events.kinds())
            .is_equal_to(vec!["spec-loader-failure", "spec-loader-failure"]);

        // late results of abandoned tries are discarded
        sleep(Duration::from_secs(120)).await;
        assert_that!(client.specification()).is_none();
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_validation_results_are_rejected() {
        let events = RecordingEvents::default();
        let loader = |_validator: SpecValidator| async move {
            Ok::<_, BoxError>(SpecValidator::new(false).validate(FIXTURE_SPEC))
        };
        let config = blocking_config().with_max_retries(0).with_initial_load(false);
        let client = Client::with_event_recorder(config, loader, events.clone());

        let error = client.load_spec().await.unwrap_err();
        assert_that!(error.last_error).is_equal_to(LoadError::ValidatorContractViolation);
        assert_that!(events.kinds()).is_equal_to(vec!["validator-failure"]);
        assert_that!(client.specification()).is_none();
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_payloads_are_reported_with_their_input() {
        let events = RecordingEvents::default();
        let loader = |validator: SpecValidator| async move {
            Ok::<_, BoxError>(validator.validate(json!({"schemaVersion": 2})))
        };
        let config = blocking_config().with_max_retries(0).with_initial_load(false);
        let client = Client::with_event_recorder(config, loader, events.clone());

        let error = client.load_spec().await.unwrap_err();
        assert!(matches!(error.last_error, LoadError::Invalid(_)));
        match &events.events()[..] {
            [ClientEvent::SpecValidationFailure { attempt, raw, .. }] => {
                assert_eq!(*attempt, 1);
                assert_eq!(raw, &RawSpec::Json(json!({"schemaVersion": 2})));
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_loader_fails_the_try() {
        let config = blocking_config().with_max_retries(0).with_initial_load(false);
        let client = Client::new(config, PanickingLoader);

        let error = client.load_spec().await.unwrap_err();
        assert_that!(error.last_error).is_equal_to(LoadError::Panicked);
    }

    #[tokio::test(start_paused = true)]
    async fn dangerous_mode_accepts_semantically_invalid_specs() {
        let unsupported = json!({
            "schemaVersion": 9,
            "featureFlags": [],
            "segments": [],
            "properties": []
        });
        let loader = move |validator: SpecValidator| {
            let payload = unsupported.clone();
            async move { Ok::<_, BoxError>(validator.validate(payload)) }
        };
        let config = blocking_config()
            .with_dangerously_skip_validation(true)
            .with_initial_load(false);
        let client = Client::new(config, loader);

        let spec = client.load_spec().await.unwrap();
        assert_that!(spec.schema_version()).is_equal_to(9);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_resolution() {
        let events = RecordingEvents::default();
        let config = blocking_config()
            .with_emergency_fallback("missing-flag", "by-name")
            .with_emergency_fallback("ai-pilot", "by-name")
            .with_type_fallbacks(TypeFallbacks {
                boolean: true,
                number: 7.0,
                string: "by-type".into(),
            });
        let calls = Arc::new(AtomicUsize::new(0));
        let client = Client::with_event_recorder(config, fixture_loader(calls), events.clone());
        let ctx = context(json!({}));

        let detail = client
            .evaluate_detail("missing-flag", &ctx, FlagType::String)
            .await
            .unwrap();
        assert_that!(detail.value).is_equal_to(FlagValue::from("by-name"));
        assert_that!(detail.reason).is_equal_to(Reason::Error {
            error: eval::Error::FlagNotFound,
        });

        // by-name fallbacks of the wrong type are skipped
        assert_that!(client.number_value("missing-flag", &ctx).await).is_equal_to(Ok(7.0));

        // an existing flag of another type never uses its by-name fallback
        let detail = client
            .evaluate_detail("ai-pilot", &ctx, FlagType::String)
            .await
            .unwrap();
        assert_that!(detail.value).is_equal_to(FlagValue::from("by-type"));
        assert_that!(detail.reason).is_equal_to(Reason::Error {
            error: eval::Error::WrongType,
        });

        let fallbacks: Vec<_> = events
            .events()
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::EmergencyFallbackUsed { flag_name, reason, .. } => {
                    Some((flag_name, reason))
                }
                _ => None,
            })
            .collect();
        assert_that!(fallbacks).is_equal_to(vec![
            ("missing-flag".to_string(), eval::Error::FlagNotFound),
            ("missing-flag".to_string(), eval::Error::FlagNotFound),
            ("ai-pilot".to_string(), eval::Error::WrongType),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn type_mismatch_can_be_an_error() {
        let config = blocking_config().with_type_mismatch_policy(TypeMismatchPolicy::Error);
        let client = Client::new(config, fixture_loader(Arc::new(AtomicUsize::new(0))));

        let result = client.string_value("ai-pilot", &context(json!({}))).await;
        assert_that!(result).is_equal_to(Err(EvaluationError::TypeMismatch {
            flag_name: "ai-pilot".into(),
            expected: FlagType::String,
            actual: FlagType::Boolean,
        }));

        // unknown flags still fall back
        assert_that!(client.string_value("nope", &context(json!({}))).await)
            .is_equal_to(Ok(String::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn evaluation_warnings_become_events() {
        let events = RecordingEvents::default();
        let client = Client::with_event_recorder(
            blocking_config(),
            fixture_loader(Arc::new(AtomicUsize::new(0))),
            events.clone(),
        );

        let value = client
            .number_value("max-upload-mb", &context(json!({"age": "old"})))
            .await;
        assert_that!(value).is_equal_to(Ok(25.0));

        let warnings: Vec<_> = events
            .events()
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::EvaluationWarning { flag_name, warning } => Some((flag_name, warning)),
                _ => None,
            })
            .collect();
        assert_that!(warnings).has_length(1);
        assert_that!(warnings[0].0).is_equal_to("max-upload-mb".to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn evaluate_all_flags() {
        let client = Client::new(blocking_config(), fixture_loader(Arc::new(AtomicUsize::new(0))));

        let values = client
            .evaluate_all(&context(json!({"email": "x@acme.com", "age": 40})))
            .await;
        assert_that!(values.get("ai-pilot")).contains_value(&FlagValue::Bool(true));
        assert_that!(values.get("dark-launch")).contains_value(&FlagValue::from("off"));
        assert_that!(values.get("max-upload-mb")).contains_value(&FlagValue::Number(100.0));
        let spec = client.specification().unwrap();
        assert_that!(values.len()).is_equal_to(spec.feature_flags().len());
    }

    #[tokio::test(start_paused = true)]
    async fn evaluate_all_without_spec_returns_named_fallbacks() {
        let config = blocking_config()
            .with_max_retries(0)
            .with_emergency_fallback("ai-pilot", true)
            .with_emergency_fallback("max-upload-mb", 5.0);
        let events = RecordingEvents::default();
        let client = Client::with_event_recorder(
            config,
            flaky_loader(Arc::new(AtomicUsize::new(0)), usize::MAX),
            events.clone(),
        );

        let values = client.evaluate_all(&context(json!({}))).await;
        assert_that!(values).is_equal_to(hashmap! {
            "ai-pilot".to_string() => FlagValue::Bool(true),
            "max-upload-mb".to_string() => FlagValue::Number(5.0),
        });

        let mut fallbacks: Vec<_> = events
            .events()
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::EmergencyFallbackUsed {
                    flag_name,
                    flag_type,
                    reason,
                    value,
                } => Some((flag_name, flag_type, reason, value)),
                _ => None,
            })
            .collect();
        fallbacks.sort_by(|a, b| a.0.cmp(&b.0));
        assert_that!(fallbacks).is_equal_to(vec![
            (
                "ai-pilot".to_string(),
                FlagType::Boolean,
                eval::Error::SpecNotAvailable,
                FlagValue::Bool(true),
            ),
            (
                "max-upload-mb".to_string(),
                FlagType::Number,
                eval::Error::SpecNotAvailable,
                FlagValue::Number(5.0),
            ),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn non_blocking_events_arrive_after_the_call_returns_on_a_current_thread_runtime() {
        let events = RecordingEvents::default();
        let config = ClientConfig::new().with_max_retries(0);
        let client = Client::with_event_recorder(
            config,
            flaky_loader(Arc::new(AtomicUsize::new(0)), usize::MAX),
            events.clone(),
        );

        let value = client.bool_value("ai-pilot", &context(json!({}))).await;
        assert_that!(value).is_equal_to(Ok(false));
        assert!(!events.kinds().contains(&"emergency-fallback-used"));

        sleep(Duration::from_millis(1)).await;
        assert!(events.kinds().contains(&"emergency-fallback-used"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_blocking_events_are_delivered_on_a_multi_thread_runtime() {
        let events = RecordingEvents::default();
        let config = ClientConfig::new().with_max_retries(0);
        let client = Client::with_event_recorder(
            config,
            flaky_loader(Arc::new(AtomicUsize::new(0)), usize::MAX),
            events.clone(),
        );

        let value = client.bool_value("ai-pilot", &context(json!({}))).await;
        assert_that!(value).is_equal_to(Ok(false));

        // delivery runs on another task, possibly before the call returned
        let delivered = timeout(Duration::from_secs(5), async {
            while !events.kinds().contains(&"emergency-fallback-used") {
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert_that!(delivered).is_ok();
    }

    #[test]
    fn builds_outside_a_runtime() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = Client::new(ClientConfig::new(), fixture_loader(calls.clone()));
        assert_that!(client.specification()).is_none();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let value = runtime.block_on(client.bool_value("ai-pilot", &context(json!({"email": "a@acme.com"}))));
        assert_that!(value).is_equal_to(Ok(true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

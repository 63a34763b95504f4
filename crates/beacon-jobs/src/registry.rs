//! Processor registration and dispatch.

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobContext, JobType};
use async_trait::async_trait;
use beacon_resilience::{BackoffPolicy, CircuitBreakerRegistry};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A handler for one job type.
///
/// The payload is decoded from the stored JSON before [`process`](Self::process)
/// is called; a payload that does not decode is rejected at submit time.
///
/// # Example
///
/// ```rust,ignore
/// use beacon_jobs::prelude::*;
///
/// #[derive(Deserialize)]
/// struct SendEmail { to: String, subject: String }
///
/// struct EmailProcessor;
///
/// #[async_trait]
/// impl Processor for EmailProcessor {
///     type Payload = SendEmail;
///     type Output = ();
///     const JOB_TYPE: JobType = JobType::EmailNotification;
///
///     async fn process(&self, payload: SendEmail, ctx: JobContext) -> JobResult<()> {
///         ctx.update_progress(50, Some("sending".into())).await?;
///         mailer::send(&payload.to, &payload.subject).await.map_err(JobError::transient)
///     }
/// }
/// ```
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Decoded payload type.
    type Payload: DeserializeOwned + Send + 'static;

    /// Result stored on the job when processing succeeds.
    type Output: Serialize + Send + 'static;

    /// Job type this processor handles.
    const JOB_TYPE: JobType;

    /// Checks a decoded payload before the job is accepted.
    fn validate(&self, _payload: &Self::Payload) -> JobResult<()> {
        Ok(())
    }

    /// Runs one attempt.
    async fn process(&self, payload: Self::Payload, ctx: JobContext) -> JobResult<Self::Output>;
}

/// Per-registration settings. Unset values fall back to queue configuration.
#[derive(Debug, Clone, Default)]
pub struct ProcessorOptions {
    concurrency: Option<usize>,
    max_attempts: Option<u32>,
    backoff: Option<BackoffPolicy>,
    breaker: Option<String>,
    timeout: Option<Duration>,
}

impl ProcessorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concurrency ceiling for the job type.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Default attempt ceiling for jobs of this type.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Backoff between attempts.
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Runs every invocation through the named circuit breaker.
    pub fn breaker(mut self, name: impl Into<String>) -> Self {
        self.breaker = Some(name.into());
        self
    }

    /// Invocation timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

type Handler = Arc<dyn Fn(Value, JobContext) -> BoxFuture<'static, JobResult<Value>> + Send + Sync>;
type Validator = Arc<dyn Fn(&Value) -> JobResult<()> + Send + Sync>;

/// A registered processor with its options.
pub struct Registration {
    job_type: JobType,
    options: ProcessorOptions,
    handler: Handler,
    validator: Validator,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("job_type", &self.job_type)
            .field("options", &self.options)
            .finish()
    }
}

impl Registration {
    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn concurrency(&self) -> Option<usize> {
        self.options.concurrency
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.options.max_attempts
    }

    pub fn backoff(&self) -> Option<&BackoffPolicy> {
        self.options.backoff.as_ref()
    }

    pub fn breaker(&self) -> Option<&str> {
        self.options.breaker.as_deref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.options.timeout
    }

    /// Validates a raw payload.
    pub fn validate(&self, payload: &Value) -> JobResult<()> {
        (self.validator)(payload)
    }
}

fn decode_payload<T: DeserializeOwned>(job_type: JobType, payload: &Value) -> JobResult<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| JobError::Validation(format!("Invalid {} payload: {}", job_type, e)))
}

/// Maps job types to processors.
///
/// Built once at startup and handed to [`JobQueue::new`](crate::JobQueue::new).
pub struct ProcessorRegistry {
    entries: HashMap<JobType, Arc<Registration>>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new(Arc::new(CircuitBreakerRegistry::default()))
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl ProcessorRegistry {
    /// Creates an empty registry whose breakers come from `breakers`.
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            entries: HashMap::new(),
            breakers,
        }
    }

    /// Registers a [`Processor`] implementation.
    pub fn register<P: Processor>(&mut self, processor: P, options: ProcessorOptions) -> JobResult<()> {
        let processor = Arc::new(processor);

        let validating = processor.clone();
        let validator: Validator = Arc::new(move |value: &Value| {
            let payload: P::Payload = decode_payload(P::JOB_TYPE, value)?;
            validating.validate(&payload)
        });

        let handler: Handler = Arc::new(move |value, ctx| {
            let processor = processor.clone();
            Box::pin(async move {
                let payload: P::Payload = decode_payload(P::JOB_TYPE, &value)?;
                let output = processor.process(payload, ctx).await?;
                Ok(serde_json::to_value(output)?)
            })
        });

        self.insert(P::JOB_TYPE, options, handler, validator)
    }

    /// Registers a closure as the processor for `job_type`.
    pub fn register_fn<T, O, F, Fut>(&mut self, job_type: JobType, options: ProcessorOptions, f: F) -> JobResult<()>
    where
        T: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(T, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<O>> + Send + 'static,
    {
        let f = Arc::new(f);
        let validator: Validator = Arc::new(move |value: &Value| decode_payload::<T>(job_type, value).map(|_| ()));
        let handler: Handler = Arc::new(move |value, ctx| {
            let f = f.clone();
            Box::pin(async move {
                let payload: T = decode_payload(job_type, &value)?;
                let output = f(payload, ctx).await?;
                Ok(serde_json::to_value(output)?)
            })
        });

        self.insert(job_type, options, handler, validator)
    }

    fn insert(
        &mut self,
        job_type: JobType,
        options: ProcessorOptions,
        handler: Handler,
        validator: Validator,
    ) -> JobResult<()> {
        if self.entries.contains_key(&job_type) {
            return Err(JobError::Configuration(format!(
                "A processor is already registered for {}",
                job_type
            )));
        }
        if options.concurrency == Some(0) {
            return Err(JobError::Configuration(format!(
                "Concurrency for {} must be at least 1",
                job_type
            )));
        }
        if options.max_attempts == Some(0) {
            return Err(JobError::Configuration(format!(
                "max_attempts for {} must be at least 1",
                job_type
            )));
        }

        debug!(job_type = %job_type, options = ?options, "Registered processor");
        self.entries.insert(
            job_type,
            Arc::new(Registration {
                job_type,
                options,
                handler,
                validator,
            }),
        );
        Ok(())
    }

    /// Returns the registration for `job_type`.
    pub fn registration(&self, job_type: JobType) -> Option<&Registration> {
        self.entries.get(&job_type).map(Arc::as_ref)
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.entries.contains_key(&job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.entries.keys().copied().collect();
        types.sort();
        types
    }

    /// Validates a payload against the processor for `job_type`.
    pub fn validate(&self, job_type: JobType, payload: &Value) -> JobResult<()> {
        self.registration(job_type)
            .ok_or_else(|| JobError::UnknownJobType(job_type.to_string()))?
            .validate(payload)
    }

    /// Breakers used for processor invocations.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Runs one attempt of `job`, through its breaker when one is configured.
    pub async fn dispatch(&self, job: &Job, ctx: JobContext) -> JobResult<Value> {
        let registration = self
            .entries
            .get(&job.job_type)
            .ok_or_else(|| JobError::UnknownJobType(job.job_type.to_string()))?;

        let invocation = (registration.handler)(job.payload.clone(), ctx);
        match registration.breaker() {
            Some(name) => {
                let breaker = self.breakers.get_or_create(name);
                breaker.call(|| invocation).await.map_err(JobError::from)
            }
            None => invocation.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Priority;
    use beacon_resilience::{CircuitBreakerConfig, CircuitState};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct DoublePayload {
        n: u64,
    }

    struct Doubler;

    #[async_trait]
    impl Processor for Doubler {
        type Payload = DoublePayload;
        type Output = u64;
        const JOB_TYPE: JobType = JobType::Demo;

        fn validate(&self, payload: &DoublePayload) -> JobResult<()> {
            if payload.n > 1_000 {
                return Err(JobError::Validation("n too large".into()));
            }
            Ok(())
        }

        async fn process(&self, payload: DoublePayload, _ctx: JobContext) -> JobResult<u64> {
            Ok(payload.n * 2)
        }
    }

    fn job(job_type: JobType, payload: Value) -> Job {
        Job::new(job_type, payload, Priority::Normal, 3, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_register_and_dispatch_processor() {
        let mut registry = ProcessorRegistry::default();
        registry.register(Doubler, ProcessorOptions::new()).unwrap();

        let job = job(JobType::Demo, json!({"n": 21}));
        let output = registry.dispatch(&job, JobContext::detached(&job)).await.unwrap();
        assert_eq!(output, json!(42));
        assert!(registry.contains(JobType::Demo));
        assert_eq!(registry.job_types(), vec![JobType::Demo]);
    }

    #[test]
    fn test_validate_decodes_and_checks_payload() {
        let mut registry = ProcessorRegistry::default();
        registry.register(Doubler, ProcessorOptions::new()).unwrap();

        assert!(registry.validate(JobType::Demo, &json!({"n": 3})).is_ok());
        assert!(matches!(
            registry.validate(JobType::Demo, &json!({"n": 5000})),
            Err(JobError::Validation(_))
        ));
        assert!(matches!(
            registry.validate(JobType::Demo, &json!({"m": 1})),
            Err(JobError::Validation(_))
        ));
        assert!(matches!(
            registry.validate(JobType::DataSync, &json!({})),
            Err(JobError::UnknownJobType(_))
        ));
    }

    #[test]
    fn test_invalid_registrations_are_rejected() {
        let mut registry = ProcessorRegistry::default();
        registry.register(Doubler, ProcessorOptions::new()).unwrap();

        assert!(matches!(
            registry.register(Doubler, ProcessorOptions::new()),
            Err(JobError::Configuration(_))
        ));
        assert!(matches!(
            registry.register_fn(JobType::DataSync, ProcessorOptions::new().concurrency(0), |_: Value, _| async {
                Ok(())
            }),
            Err(JobError::Configuration(_))
        ));
        assert!(matches!(
            registry.register_fn(JobType::DataSync, ProcessorOptions::new().max_attempts(0), |_: Value, _| async {
                Ok(())
            }),
            Err(JobError::Configuration(_))
        ));
        assert!(!registry.contains(JobType::DataSync));
    }

    #[tokio::test]
    async fn test_dispatch_through_breaker() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 0.5,
            minimum_calls: 2,
            ..Default::default()
        }));
        let mut registry = ProcessorRegistry::new(breakers.clone());
        registry
            .register_fn(
                JobType::SeoAnalysis,
                ProcessorOptions::new().breaker("serp-api"),
                |_: Value, _| async { Err::<(), _>(JobError::transient("502 from upstream")) },
            )
            .unwrap();

        let job = job(JobType::SeoAnalysis, json!({}));
        for _ in 0..2 {
            let err = registry.dispatch(&job, JobContext::detached(&job)).await.unwrap_err();
            assert!(matches!(err, JobError::Transient(_)));
        }

        assert_eq!(breakers.get_or_create("serp-api").state(), CircuitState::Open);
        let err = registry.dispatch(&job, JobContext::detached(&job)).await.unwrap_err();
        assert!(matches!(err, JobError::CircuitOpen { ref resource, .. } if resource == "serp-api"));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_type() {
        let registry = ProcessorRegistry::default();
        let job = job(JobType::KeywordResearch, json!({}));
        let err = registry.dispatch(&job, JobContext::detached(&job)).await.unwrap_err();
        assert!(matches!(err, JobError::UnknownJobType(_)));
    }
}

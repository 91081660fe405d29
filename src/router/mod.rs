//! Failover routing across providers.
//!
//! The router walks the registry's ordered candidate list and invokes each
//! adapter until one produces its first fragment. Failures before any
//! fragment is emitted are retried on the next candidate; once a fragment
//! has been handed to the caller the provider is committed and a later
//! failure surfaces as [`Error::PartialFailure`]. A committed provider that
//! goes quiet for longer than the idle timeout is treated the same way.

mod attempts;

pub use attempts::{format_attempts, AttemptRecord};

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::provider::{
    AdapterError, Fragment, FragmentStream, GenerationParams, Prompt, ProviderAdapter,
};
use crate::registry::{Outcome, ProviderRegistry, Requirements};

/// Fragments from the committed provider. Ends after an `Err` item.
pub type DispatchStream = BoxStream<'static, Result<Fragment>>;

/// A provider that has produced (or is about to produce) output.
pub struct Dispatch {
    /// Id of the provider that won.
    pub provider: String,
    /// Failed attempts that preceded the winner.
    pub attempts: Vec<AttemptRecord>,
    pub stream: DispatchStream,
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("provider", &self.provider)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct Router {
    registry: Arc<ProviderRegistry>,
    max_attempts: usize,
    first_fragment_timeout: Duration,
    /// Longest gap allowed between fragments once a provider is committed.
    idle_timeout: Duration,
}

impl Router {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        max_attempts: usize,
        first_fragment_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            max_attempts,
            first_fragment_timeout,
            idle_timeout,
        }
    }

    pub fn from_config(registry: Arc<ProviderRegistry>, config: &GatewayConfig) -> Self {
        Self::new(
            registry,
            config.max_attempts,
            config.first_fragment_timeout(),
            config.idle_timeout(),
        )
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Route a prompt to the first candidate that starts streaming.
    ///
    /// Returns once a provider has produced its first fragment (or finished
    /// with no output). Errors:
    /// - [`Error::NoProviders`] when nothing matches `requirements`
    /// - [`Error::InvalidRequest`] when a provider rejects the request itself
    /// - [`Error::Cancelled`] when `cancel` fires while waiting on a provider
    /// - [`Error::RoutingExhausted`] when every attempt failed
    pub async fn dispatch(
        &self,
        prompt: &Prompt,
        params: &GenerationParams,
        requirements: &Requirements,
        cancel: &CancellationToken,
    ) -> Result<Dispatch> {
        let candidates = self.registry.list_candidates(requirements);
        if candidates.is_empty() {
            tracing::warn!(requirements = %requirements, "No providers match");
            return Err(Error::NoProviders {
                requirements: requirements.to_string(),
            });
        }

        let mut attempts: Vec<AttemptRecord> = Vec::new();

        for candidate in candidates.into_iter().take(self.max_attempts) {
            let provider = candidate.descriptor.id.clone();
            let started = Instant::now();

            tracing::debug!(
                provider = %provider,
                health = %candidate.health,
                attempt = attempts.len() + 1,
                "Attempting provider"
            );

            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(provider = %provider, "Dispatch cancelled while waiting on provider");
                    return Err(Error::Cancelled);
                }
                result = tokio::time::timeout(
                    self.first_fragment_timeout,
                    first_fragment(candidate.adapter.as_ref(), prompt, params),
                ) => result.unwrap_or_else(|_| {
                    Err(AdapterError::Timeout(format!(
                        "no output within {}s",
                        self.first_fragment_timeout.as_secs()
                    )))
                }),
            };

            match first {
                Ok(head) => {
                    let latency = started.elapsed();
                    if !attempts.is_empty() {
                        tracing::info!(
                            provider = %provider,
                            attempts = %format_attempts(&attempts).unwrap_or_default(),
                            "Failover succeeded"
                        );
                    }
                    let stream = self.committed_stream(provider.clone(), head, latency);
                    return Ok(Dispatch {
                        provider,
                        attempts,
                        stream,
                    });
                }
                Err(err) if !err.is_retryable() => {
                    tracing::warn!(
                        provider = %provider,
                        error = %err,
                        "Provider rejected request, not retrying"
                    );
                    return Err(Error::InvalidRequest(err.to_string()));
                }
                Err(err) => {
                    tracing::warn!(
                        provider = %provider,
                        kind = err.kind(),
                        error = %err,
                        "Provider failed before first fragment"
                    );
                    self.registry.report_outcome(
                        &provider,
                        Outcome::Failure {
                            reason: err.to_string(),
                        },
                        None,
                    );
                    attempts.push(AttemptRecord {
                        provider,
                        error: err,
                    });
                }
            }
        }

        let summary = format_attempts(&attempts).unwrap_or_default();
        tracing::error!(attempted = attempts.len(), attempts = %summary, "All providers failed");
        Err(Error::RoutingExhausted {
            attempted: attempts.len(),
            summary: describe_failures(&attempts),
        })
    }

    /// Wrap a committed provider's remaining output, reporting its outcome
    /// to the registry when the stream ends.
    fn committed_stream(
        &self,
        provider: String,
        head: Option<(Fragment, FragmentStream)>,
        latency: Duration,
    ) -> DispatchStream {
        let registry = self.registry.clone();
        let idle_timeout = self.idle_timeout;

        let stream = async_stream::stream! {
            let Some((first, mut rest)) = head else {
                registry.report_outcome(&provider, Outcome::Success, Some(latency));
                return;
            };
            yield Ok(first);

            loop {
                let item = match tokio::time::timeout(idle_timeout, rest.next()).await {
                    Ok(Some(item)) => item,
                    Ok(None) => break,
                    Err(_) => Err(AdapterError::Timeout(format!(
                        "no output for {}s",
                        idle_timeout.as_secs()
                    ))),
                };
                match item {
                    Ok(fragment) => yield Ok(fragment),
                    Err(err) => {
                        tracing::warn!(provider = %provider, error = %err, "Provider failed mid-stream");
                        registry.report_outcome(
                            &provider,
                            Outcome::Failure { reason: err.to_string() },
                            None,
                        );
                        yield Err(Error::PartialFailure {
                            provider: provider.clone(),
                            reason: err.to_string(),
                        });
                        return;
                    }
                }
            }

            registry.report_outcome(&provider, Outcome::Success, Some(latency));
        };

        Box::pin(stream)
    }
}

/// Invoke an adapter and wait for its first item. `Ok(None)` is a stream
/// that completed without output.
async fn first_fragment(
    adapter: &dyn ProviderAdapter,
    prompt: &Prompt,
    params: &GenerationParams,
) -> std::result::Result<Option<(Fragment, FragmentStream)>, AdapterError> {
    let mut stream = adapter.invoke(prompt, params).await?;
    match stream.next().await {
        Some(Ok(fragment)) => Ok(Some((fragment, stream))),
        Some(Err(err)) => Err(err),
        None => Ok(None),
    }
}

fn describe_failures(attempts: &[AttemptRecord]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.provider, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HealthStatus, ProviderDescriptor};
    use std::sync::atomic::{AtomicU32, Ordering};

    enum Script {
        Fail(AdapterError),
        FailFirstItem(AdapterError),
        Emit(Vec<&'static str>),
        EmitThenFail(Vec<&'static str>, AdapterError),
        EmitThenHang(Vec<&'static str>),
        Hang,
    }

    struct TestAdapter {
        script: Script,
        calls: AtomicU32,
    }

    impl TestAdapter {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn fragments(texts: &[&'static str]) -> Vec<std::result::Result<Fragment, AdapterError>> {
        texts.iter().map(|t| Ok(Fragment::new(*t))).collect()
    }

    #[async_trait::async_trait]
    impl ProviderAdapter for TestAdapter {
        async fn invoke(
            &self,
            _prompt: &Prompt,
            _params: &GenerationParams,
        ) -> std::result::Result<FragmentStream, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Fail(err) => Err(err.clone()),
                Script::FailFirstItem(err) => {
                    Ok(Box::pin(futures::stream::iter(vec![Err(err.clone())])))
                }
                Script::Emit(texts) => Ok(Box::pin(futures::stream::iter(fragments(texts)))),
                Script::EmitThenFail(texts, err) => {
                    let mut items = fragments(texts);
                    items.push(Err(err.clone()));
                    Ok(Box::pin(futures::stream::iter(items)))
                }
                Script::EmitThenHang(texts) => Ok(Box::pin(
                    futures::stream::iter(fragments(texts)).chain(futures::stream::pending()),
                )),
                Script::Hang => Ok(Box::pin(futures::stream::pending())),
            }
        }
    }

    fn setup(adapters: Vec<(&str, Arc<TestAdapter>)>) -> (Router, Arc<ProviderRegistry>) {
        let registry = Arc::new(ProviderRegistry::default());
        for (id, adapter) in adapters {
            registry.register(ProviderDescriptor::new(id), adapter);
        }
        let router = Router::new(
            registry.clone(),
            3,
            Duration::from_secs(30),
            Duration::from_secs(60),
        );
        (router, registry)
    }

    async fn collect(dispatch: Dispatch) -> (String, Option<Error>) {
        let mut text = String::new();
        let mut stream = dispatch.stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(fragment) => text.push_str(&fragment.text),
                Err(err) => return (text, Some(err)),
            }
        }
        (text, None)
    }

    fn unreachable() -> AdapterError {
        AdapterError::Unreachable("connection refused".to_string())
    }

    async fn dispatch(router: &Router) -> Result<Dispatch> {
        router
            .dispatch(
                &Prompt::default(),
                &GenerationParams::default(),
                &Requirements::default(),
                &CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn test_failover_to_third_provider() {
        let alpha = TestAdapter::new(Script::Fail(unreachable()));
        let beta = TestAdapter::new(Script::FailFirstItem(AdapterError::RateLimited(
            "slow down".to_string(),
        )));
        let gamma = TestAdapter::new(Script::Emit(vec!["Hi", " there"]));
        let (router, registry) = setup(vec![
            ("alpha", alpha.clone()),
            ("beta", beta.clone()),
            ("gamma", gamma.clone()),
        ]);

        let dispatch = dispatch(&router).await.unwrap();
        assert_eq!(dispatch.provider, "gamma");
        assert_eq!(
            format_attempts(&dispatch.attempts),
            Some("1/alpha, 1/beta".to_string())
        );

        let (text, err) = collect(dispatch).await;
        assert_eq!(text, "Hi there");
        assert!(err.is_none());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].total_failures, 1);
        assert_eq!(snapshot[1].total_failures, 1);
        assert_eq!(snapshot[2].total_successes, 1);
        assert_eq!(alpha.calls() + beta.calls() + gamma.calls(), 3);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_not_retried() {
        let alpha = TestAdapter::new(Script::EmitThenFail(vec!["Hello", " wor"], unreachable()));
        let beta = TestAdapter::new(Script::Emit(vec!["never"]));
        let (router, registry) = setup(vec![("alpha", alpha), ("beta", beta.clone())]);

        let dispatch = dispatch(&router).await.unwrap();
        let (text, err) = collect(dispatch).await;
        assert_eq!(text, "Hello wor");
        assert!(matches!(err, Some(Error::PartialFailure { ref provider, .. }) if provider == "alpha"));
        assert_eq!(beta.calls(), 0);
        assert_eq!(registry.snapshot()[0].total_failures, 1);
    }

    #[tokio::test]
    async fn test_invalid_request_not_retried_or_charged() {
        let alpha = TestAdapter::new(Script::Fail(AdapterError::InvalidRequest(
            "context too long".to_string(),
        )));
        let beta = TestAdapter::new(Script::Emit(vec!["never"]));
        let (router, registry) = setup(vec![("alpha", alpha), ("beta", beta.clone())]);

        let err = dispatch(&router).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(beta.calls(), 0);
        assert_eq!(registry.snapshot()[0].total_failures, 0);
        assert_eq!(registry.health("alpha"), Some(HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn test_exhausted_after_max_attempts() {
        let adapters: Vec<_> = (0..4)
            .map(|_| TestAdapter::new(Script::Fail(unreachable())))
            .collect();
        let (router, _registry) = setup(vec![
            ("a", adapters[0].clone()),
            ("b", adapters[1].clone()),
            ("c", adapters[2].clone()),
            ("d", adapters[3].clone()),
        ]);

        let err = dispatch(&router).await.unwrap_err();
        match err {
            Error::RoutingExhausted { attempted, summary } => {
                assert_eq!(attempted, 3);
                assert!(summary.contains("a: provider unreachable"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(adapters[3].calls(), 0);
    }

    #[tokio::test]
    async fn test_no_providers() {
        let (router, _registry) = setup(vec![]);
        assert!(matches!(
            dispatch(&router).await,
            Err(Error::NoProviders { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_fragment_timeout_fails_over() {
        let alpha = TestAdapter::new(Script::Hang);
        let beta = TestAdapter::new(Script::Emit(vec!["ok"]));
        let (router, registry) = setup(vec![("alpha", alpha), ("beta", beta)]);

        let dispatch = dispatch(&router).await.unwrap();
        assert_eq!(dispatch.provider, "beta");
        assert!(matches!(dispatch.attempts[0].error, AdapterError::Timeout(_)));
        assert_eq!(registry.snapshot()[0].total_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_stream_times_out() {
        let alpha = TestAdapter::new(Script::EmitThenHang(vec!["Once upon", " a"]));
        let beta = TestAdapter::new(Script::Emit(vec!["never"]));
        let (router, registry) = setup(vec![("alpha", alpha), ("beta", beta.clone())]);

        let dispatch = dispatch(&router).await.unwrap();
        let started = Instant::now();
        let (text, err) = collect(dispatch).await;

        assert_eq!(text, "Once upon a");
        match err {
            Some(Error::PartialFailure { provider, reason }) => {
                assert_eq!(provider, "alpha");
                assert!(reason.contains("no output for 60s"), "{}", reason);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(beta.calls(), 0);
        assert_eq!(registry.snapshot()[0].total_failures, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_output() {
        let alpha = TestAdapter::new(Script::Hang);
        let (router, registry) = setup(vec![("alpha", alpha)]);
        let cancel = CancellationToken::new();

        let task = {
            let router = router.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = router
                    .dispatch(
                        &Prompt::default(),
                        &GenerationParams::default(),
                        &Requirements::default(),
                        &cancel,
                    )
                    .await;
                result.map(|d| d.provider)
            })
        };
        tokio::task::yield_now().await;
        cancel.cancel();

        assert!(matches!(task.await.unwrap(), Err(Error::Cancelled)));
        // Cancellation is not a provider failure
        assert_eq!(registry.snapshot()[0].total_failures, 0);
    }

    #[tokio::test]
    async fn test_empty_stream_is_success() {
        let alpha = TestAdapter::new(Script::Emit(vec![]));
        let (router, registry) = setup(vec![("alpha", alpha)]);

        let dispatch = dispatch(&router).await.unwrap();
        let (text, err) = collect(dispatch).await;
        assert!(text.is_empty());
        assert!(err.is_none());
        assert_eq!(registry.snapshot()[0].total_successes, 1);
    }
}

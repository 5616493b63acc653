use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{Error, Result};

/// A runner drives one set of watchers, queues and reconcilers. `run` is
/// re-invoked by the supervisor after a backoff whenever it returns an
/// error, so it must rebuild its watchers and queues on every call.
pub trait Runner: Send + Sync + 'static {
    fn name(&self) -> &str;
    /// True once the runner's primary watchers have been launched.
    fn initialised(&self) -> bool;
    fn stop(&self);
    fn run(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Per-runner initialised flags backing the health endpoint.
#[derive(Clone, Default)]
pub struct Readiness {
    flags: Arc<RwLock<Vec<(String, Arc<AtomicBool>)>>>,
}

impl Readiness {
    pub fn register(&self, name: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.flags.write().unwrap().push((name.to_string(), flag.clone()));
        flag
    }

    /// Healthy only when every registered runner has initialised. An empty
    /// registry is reported unhealthy: the probe must not go green before
    /// the runners exist.
    pub fn all_initialised(&self) -> bool {
        let flags = self.flags.read().unwrap();
        !flags.is_empty() && flags.iter().all(|(_, flag)| flag.load(Ordering::SeqCst))
    }
}

/// Restart backoff between failed `run` invocations.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { initial_delay: Duration::from_secs(1), max_delay: Duration::from_secs(60) }
    }
}

/// Runs a runner under a retry loop, re-invoking `run` with exponential
/// backoff and jitter on any returned error. Returns once the runner stops
/// cleanly or the token is cancelled.
pub fn supervise<R: Runner>(
    runner: Arc<R>,
    cancel: CancellationToken,
    retry: RetryConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut delay = retry.initial_delay;
        loop {
            match runner.run().await {
                Ok(()) => {
                    info!(runner = %runner.name(), "runner stopped");
                    return;
                }
                Err(err) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    // Jitter the restart so runners failing together do not
                    // hammer the API servers in lockstep.
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    let backoff = delay.mul_f64(jitter);
                    error!(
                        runner = %runner.name(),
                        error = %err,
                        delay_ms = backoff.as_millis() as u64,
                        "runner failed, restarting",
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return,
                    }
                    delay = (delay * 2).min(retry.max_delay);
                }
            }
        }
    })
}

/// Waits until a runner's watcher and queue tasks are cancelled, surfacing
/// the first unexpected exit or error so the retry loop can rebuild them.
pub(crate) async fn wait_for_tasks(
    name: &str,
    cancel: &CancellationToken,
    mut tasks: JoinSet<Result<()>>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Let in-flight reconciles finish their current call.
                while tasks.join_next().await.is_some() {}
                return Ok(());
            }
            joined = tasks.join_next() => match joined {
                None => return Ok(()),
                Some(Ok(Ok(()))) if cancel.is_cancelled() => return Ok(()),
                Some(Ok(Ok(()))) => {
                    return Err(Error::Other(format!("task of runner {name} exited unexpectedly")))
                }
                Some(Ok(Err(err))) => return Err(err),
                Some(Err(join_err)) => {
                    return Err(Error::Other(format!("task of runner {name} failed: {join_err}")))
                }
            },
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicU32;

    use super::*;

    struct FlakyRunner {
        attempts: AtomicU32,
        failures: u32,
        initialised: AtomicBool,
        cancel: CancellationToken,
    }

    impl Runner for FlakyRunner {
        fn name(&self) -> &str {
            "flaky"
        }

        fn initialised(&self) -> bool {
            self.initialised.load(Ordering::SeqCst)
        }

        fn stop(&self) {
            self.cancel.cancel();
        }

        async fn run(&self) -> Result<()> {
            self.initialised.store(true, Ordering::SeqCst);
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(crate::Error::Other("cache failed to sync".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_supervise_retries_until_clean_stop() {
        let runner = Arc::new(FlakyRunner {
            attempts: AtomicU32::new(0),
            failures: 2,
            initialised: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        let retry = RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        };
        let handle = supervise(runner.clone(), CancellationToken::new(), retry);
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(runner.attempts.load(Ordering::SeqCst), 3);
        assert!(runner.initialised());
    }

    #[tokio::test]
    async fn test_supervise_stops_on_cancel() {
        let runner = Arc::new(FlakyRunner {
            attempts: AtomicU32::new(0),
            failures: u32::MAX,
            initialised: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        let retry = RetryConfig {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
        };
        let cancel = CancellationToken::new();
        let handle = supervise(runner, cancel.clone(), retry);
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    #[test]
    fn test_readiness_requires_all_runners() {
        let readiness = Readiness::default();
        assert!(!readiness.all_initialised());

        let first = readiness.register("a");
        let second = readiness.register("b");
        assert!(!readiness.all_initialised());

        first.store(true, Ordering::SeqCst);
        assert!(!readiness.all_initialised());

        second.store(true, Ordering::SeqCst);
        assert!(readiness.all_initialised());
    }
}

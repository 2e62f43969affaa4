// src/orchestrator/activity.rs

//! Activity options, retries and heartbeats

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Exponential backoff between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff: f64,
    pub max_interval: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff: 2.0,
            max_interval: Duration::from_secs(100),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn attempts(max: u32) -> Self {
        Self {
            max_attempts: Some(max),
            ..Default::default()
        }
    }

    /// Delay before the attempt following `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_interval.mul_f64(factor.max(0.0));
        delay.min(self.max_interval)
    }
}

/// Timeouts and retry policy of one activity invocation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityOptions {
    pub start_to_close: Duration,
    /// Fail the attempt when no heartbeat arrives within this window
    pub heartbeat_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl ActivityOptions {
    pub fn new(start_to_close: Duration) -> Self {
        Self {
            start_to_close,
            heartbeat_timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.retry.initial_interval = interval;
        self
    }

    /// A single attempt with no heartbeat requirement
    pub fn once(start_to_close: Duration) -> Self {
        Self::new(start_to_close).with_retry(RetryPolicy::attempts(1))
    }

    pub fn srpm_build() -> Self {
        Self::new(Duration::from_secs(3600))
            .with_heartbeat(Duration::from_secs(120))
            .with_retry(RetryPolicy::attempts(1))
    }

    pub fn arch_build() -> Self {
        Self::new(Duration::from_secs(48 * 3600))
            .with_heartbeat(Duration::from_secs(2 * 3600))
            .with_retry(RetryPolicy::attempts(1))
    }

    pub fn upload() -> Self {
        Self::new(Duration::from_secs(24 * 3600))
            .with_heartbeat(Duration::from_secs(120))
            .with_retry(RetryPolicy::attempts(3))
    }

    /// The composer competes for the project lease, so it retries forever
    pub fn composer() -> Self {
        Self::new(Duration::from_secs(30 * 3600))
            .with_heartbeat(Duration::from_secs(30))
            .with_retry(RetryPolicy {
                initial_interval: Duration::from_secs(5),
                backoff: 1.1,
                max_interval: Duration::from_secs(25),
                max_attempts: None,
            })
    }

    pub fn signing() -> Self {
        Self::new(Duration::from_secs(24 * 3600))
            .with_heartbeat(Duration::from_secs(15))
            .with_retry(RetryPolicy::attempts(3))
    }

    pub fn worker() -> Self {
        Self::new(Duration::from_secs(10 * 3600))
            .with_heartbeat(Duration::from_secs(10))
            .with_retry(RetryPolicy::attempts(3))
    }

    pub fn import() -> Self {
        Self::new(Duration::from_secs(2 * 3600))
            .with_heartbeat(Duration::from_secs(10))
            .with_retry(RetryPolicy::attempts(6))
    }
}

/// Passed to each activity attempt
#[derive(Clone)]
pub struct ActivityContext {
    name: Arc<str>,
    attempt: u32,
    last_heartbeat: Arc<Mutex<Instant>>,
    cancel: watch::Receiver<bool>,
}

impl ActivityContext {
    pub(crate) fn new(name: &str, attempt: u32, cancel: watch::Receiver<bool>) -> Self {
        Self {
            name: Arc::from(name),
            attempt,
            last_heartbeat: Arc::new(Mutex::new(Instant::now())),
            cancel,
        }
    }

    /// A context outside any workflow, for direct calls and tests
    pub fn detached(name: &str) -> Self {
        let (_, rx) = watch::channel(false);
        Self::new(name, 1, rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Record liveness; fails once the workflow has been canceled
    pub fn heartbeat(&self) -> Result<()> {
        if let Ok(mut last) = self.last_heartbeat.lock() {
            *last = Instant::now();
        }
        if self.is_canceled() {
            return Err(Error::Canceled(format!("activity {} canceled", self.name)));
        }
        Ok(())
    }

    fn since_heartbeat(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    /// Heartbeat in the background until the guard is dropped
    pub fn keep_alive(&self, interval: Duration) -> KeepAlive {
        let ctx = self.clone();
        KeepAlive {
            handle: tokio::spawn(async move {
                loop {
                    if ctx.heartbeat().is_err() {
                        return;
                    }
                    tokio::time::sleep(interval).await;
                }
            }),
        }
    }
}

/// Background heartbeat guard
pub struct KeepAlive {
    handle: JoinHandle<()>,
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn watchdog(ctx: &ActivityContext, timeout: Option<Duration>) -> Error {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };
    let tick = (timeout / 4).max(Duration::from_millis(10));
    loop {
        tokio::time::sleep(tick).await;
        if ctx.since_heartbeat() > timeout {
            return Error::TimeoutError(format!(
                "activity {} missed its heartbeat ({:?})",
                ctx.name(),
                timeout
            ));
        }
    }
}

pub(crate) async fn run_attempt<T, Fut>(
    ctx: &ActivityContext,
    options: &ActivityOptions,
    fut: Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let bounded = tokio::time::timeout(options.start_to_close, fut);
    tokio::select! {
        res = bounded => match res {
            Ok(inner) => inner,
            Err(_) => Err(Error::TimeoutError(format!(
                "activity {} exceeded {:?}",
                ctx.name(),
                options.start_to_close
            ))),
        },
        err = watchdog(ctx, options.heartbeat_timeout) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composer_backoff_is_bounded() {
        let retry = ActivityOptions::composer().retry;
        assert_eq!(retry.delay_for(1), Duration::from_secs(5));
        assert!(retry.delay_for(2) > Duration::from_secs(5));
        assert_eq!(retry.delay_for(100), Duration::from_secs(25));
        assert_eq!(retry.max_attempts, None);
    }

    #[test]
    fn test_build_activities_run_once() {
        assert_eq!(ActivityOptions::srpm_build().retry.max_attempts, Some(1));
        assert_eq!(ActivityOptions::arch_build().retry.max_attempts, Some(1));
        assert_eq!(ActivityOptions::upload().retry.max_attempts, Some(3));
    }

    #[tokio::test]
    async fn test_missing_heartbeat_times_out() {
        let ctx = ActivityContext::detached("silent");
        let options = ActivityOptions::once(Duration::from_secs(10))
            .with_heartbeat(Duration::from_millis(40));
        let err = run_attempt(&ctx, &options, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Error>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::TimeoutError(_)));
    }

    #[tokio::test]
    async fn test_keep_alive_satisfies_watchdog() {
        let ctx = ActivityContext::detached("busy");
        let options = ActivityOptions::once(Duration::from_secs(10))
            .with_heartbeat(Duration::from_millis(60));
        let _guard = ctx.keep_alive(Duration::from_millis(10));
        let value = run_attempt(&ctx, &options, async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, Error>(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
    }
}

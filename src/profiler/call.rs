//! Profiled Calls
//!
//! [`ProfiledCall`] names an operation; [`ActiveCall`] is one running
//! instance of it. An `ActiveCall` is consumed by `stop` or `close`, and
//! dropping it unstopped closes it, so every exit path (early return, `?`,
//! panic, cancelled future) releases its active-call slot.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::engine::Engine;
use crate::identity::Identity;

/// Payload recorded when none is given
pub const DEFAULT_PAYLOAD: i64 = 1;

/// Named operation that can be started, or recorded in one shot
#[derive(Clone)]
pub struct ProfiledCall {
    engine: Arc<Engine>,
    identity: Identity,
}

impl ProfiledCall {
    pub(crate) fn new(engine: Arc<Engine>, identity: Identity) -> Self {
        Self { engine, identity }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Begin timing a call
    pub fn start(&self) -> ActiveCall {
        let (call_id, started_at) = self.engine.record_start(&self.identity);
        ActiveCall {
            engine: self.engine.clone(),
            identity: self.identity.clone(),
            call_id,
            started_at,
            finished: false,
        }
    }

    /// Record a completed call with zero latency
    pub fn call(&self) {
        self.call_with_payload(DEFAULT_PAYLOAD);
    }

    /// Record a completed call with zero latency and the given payload
    pub fn call_with_payload(&self, payload: i64) {
        self.engine.record_call(&self.identity, 0, payload);
    }

    /// Record a completed call that began at `started_at`
    pub fn call_started_at(&self, started_at: Instant, payload: i64) {
        let latency_ms = started_at.elapsed().as_millis() as u64;
        self.engine.record_call(&self.identity, latency_ms, payload);
    }

    /// Run `f` as one call
    pub fn profile<R>(&self, f: impl FnOnce() -> R) -> R {
        let call = self.start();
        let result = f();
        call.stop();
        result
    }

    /// Run `f` as one call; an `Err` closes the call instead of stopping it
    pub fn profile_result<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let call = self.start();
        let result = f();
        match &result {
            Ok(_) => call.stop(),
            Err(_) => call.close(),
        }
        result
    }

    /// Await `future` as one call. Dropping the returned future early closes the call.
    pub async fn profile_future<F: Future>(&self, future: F) -> F::Output {
        let call = self.start();
        let output = future.await;
        call.stop();
        output
    }
}

impl std::fmt::Debug for ProfiledCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfiledCall")
            .field("identity", &self.identity)
            .finish()
    }
}

/// A started call. Finish with [`ActiveCall::stop`]; dropping it closes it.
#[must_use = "dropping an ActiveCall closes it without recording a stop"]
pub struct ActiveCall {
    engine: Arc<Engine>,
    identity: Identity,
    call_id: u64,
    started_at: Instant,
    finished: bool,
}

impl ActiveCall {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Record the stop with the default payload
    pub fn stop(self) {
        self.stop_with_payload(DEFAULT_PAYLOAD);
    }

    /// Record the stop, its latency and payload
    pub fn stop_with_payload(mut self, payload: i64) {
        self.finished = true;
        self.engine
            .record_stop(&self.identity, self.call_id, self.started_at, payload);
    }

    /// Release the call without recording a stop or latency
    pub fn close(mut self) {
        self.finished = true;
        self.engine.record_close(&self.identity, self.call_id);
    }
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        if !self.finished {
            self.engine.record_close(&self.identity, self.call_id);
        }
    }
}

impl std::fmt::Debug for ActiveCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveCall")
            .field("identity", &self.identity)
            .field("call_id", &self.call_id)
            .field("elapsed", &self.started_at.elapsed())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::profiler::Profiler;
    use std::time::Duration;

    #[test]
    fn test_start_stop() {
        let profiler = Profiler::new();
        let reporter = profiler.create_reporter();
        let call = profiler.profiled_call("op");

        let active = call.start();
        std::thread::sleep(Duration::from_millis(15));
        active.stop_with_payload(4);

        let report = reporter.build_report_and_reset();
        let op = &report.profiler_call_reports[0];
        assert_eq!(op.start_sum, 1);
        assert_eq!(op.stop_sum, 1);
        assert!(op.latency_max >= 15);
        assert_eq!(op.payload_sum, 4);
    }

    #[test]
    fn test_drop_closes_call() {
        let profiler = Profiler::new();
        let reporter = profiler.create_reporter();
        let call = profiler.profiled_call("op");

        drop(call.start());
        call.start().close();

        let report = reporter.build_report_and_reset();
        let op = &report.profiler_call_reports[0];
        assert_eq!(op.start_sum, 2);
        assert_eq!(op.stop_sum, 0);
        assert_eq!(op.latency_max, 0);

        reporter.build_report_and_reset();
        assert_eq!(reporter.aggregate_count(), 0);
    }

    #[test]
    fn test_profile_closure() {
        let profiler = Profiler::new();
        let reporter = profiler.create_reporter();
        let call = profiler.profiled_call("op");

        let value = call.profile(|| 21 * 2);
        assert_eq!(value, 42);

        let ok: Result<u8, String> = call.profile_result(|| Ok(1));
        assert!(ok.is_ok());
        let err: Result<u8, String> = call.profile_result(|| Err("failed".to_string()));
        assert!(err.is_err());

        let report = reporter.build_report_and_reset();
        let op = &report.profiler_call_reports[0];
        assert_eq!(op.start_sum, 3);
        assert_eq!(op.stop_sum, 2);
    }

    #[test]
    fn test_panic_inside_profile_releases_slot() {
        let profiler = Profiler::new();
        let reporter = profiler.create_reporter();
        let call = profiler.profiled_call("op");

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            call.profile(|| -> u32 { panic!("inside profiled code") })
        }));
        assert!(outcome.is_err());

        let report = reporter.build_report_and_reset();
        assert_eq!(report.profiler_call_reports[0].stop_sum, 0);
        assert_eq!(reporter.tracked_active_calls(call.identity()), 0);
    }

    #[test]
    fn test_one_shot_calls() {
        let profiler = Profiler::new();
        let reporter = profiler.create_reporter();
        let call = profiler.profiled_call("op");

        call.call();
        call.call_with_payload(10);
        call.call_started_at(std::time::Instant::now() - Duration::from_millis(30), 5);

        let report = reporter.build_report_and_reset();
        let op = &report.profiler_call_reports[0];
        assert_eq!(op.start_sum, 3);
        assert_eq!(op.stop_sum, 3);
        assert_eq!(op.payload_sum, 16);
        assert!(op.latency_max >= 30);
        assert_eq!(op.latency_min, 0);
    }

    #[tokio::test]
    async fn test_profile_future() {
        let profiler = Profiler::new();
        let reporter = profiler.create_reporter();
        let call = profiler.profiled_call("async.op");

        let value = call
            .profile_future(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                7
            })
            .await;
        assert_eq!(value, 7);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(5),
            call.profile_future(tokio::time::sleep(Duration::from_secs(10))),
        )
        .await;
        assert!(cancelled.is_err());

        let report = reporter.build_report_and_reset();
        let op = &report.profiler_call_reports[0];
        assert_eq!(op.start_sum, 2);
        assert_eq!(op.stop_sum, 1);
        assert!(op.latency_max >= 10);
        assert_eq!(op.active_calls_count_max, 1);
        assert_eq!(reporter.tracked_active_calls(call.identity()), 0);
    }

    #[test]
    fn test_profile_ready_future() {
        let profiler = Profiler::new();
        let reporter = profiler.create_reporter();
        let call = profiler.profiled_call("ready.op");

        let value = tokio_test::block_on(call.profile_future(async { "done" }));
        assert_eq!(value, "done");

        let report = reporter.build_report_and_reset();
        assert_eq!(report.profiler_call_reports[0].stop_sum, 1);
    }
}

//! Runs one unit from environment scoping to signal release.
//!
//! [`supervise`] is the whole body of a unit's execution context. It never
//! returns an error and never lets a panic escape: every failure is
//! classified by [`Phase`], logged, and turned into signal state that the
//! orchestrating parent can observe.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{error, info, Instrument};

use crate::config::{Backend, ControlAddresses, UnitConfig};
use crate::env_scope::EnvScope;
use crate::error::RuntimeError;
use crate::runtime::{ProcessRuntime, RemoteDaemonRuntime, RuntimeFactory, ThreadRuntime};
use crate::signal::Signal;

const QUIET_ERROR_HINT: &str = "add \"--quiet-error\" to suppress the exception details";

/// Where a unit's lifecycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Environment scoping failed.
    Construction,
    /// The runtime could not be built (e.g. its control address is taken).
    Initialization,
    /// The serving loop never reached a servable state.
    Start,
    Graceful,
    TerminatedByPeer,
    UserInterrupt,
    Unexpected,
    /// Teardown failed after the serving loop ended.
    Teardown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Construction => "construction",
            Phase::Initialization => "initialization",
            Phase::Start => "start",
            Phase::Graceful => "graceful",
            Phase::TerminatedByPeer => "terminated-by-peer",
            Phase::UserInterrupt => "user-interrupt",
            Phase::Unexpected => "unexpected",
            Phase::Teardown => "teardown",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            Phase::Graceful | Phase::TerminatedByPeer | Phase::UserInterrupt
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one `supervise` call.
///
/// `phase` is where the serving lifecycle ended; a teardown failure is
/// reported separately so it never hides the original outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub phase: Phase,
    pub ready_was_set: bool,
    pub teardown_failed: bool,
}

impl Outcome {
    fn before_ready(phase: Phase) -> Self {
        Self {
            phase,
            ready_was_set: false,
            teardown_failed: false,
        }
    }
}

/// Releases the unit on every exit path, including unwinding and
/// cancellation of the supervising future.
struct Release<'a> {
    ready: &'a Signal,
    shutdown: &'a Signal,
    scope: EnvScope,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.shutdown.set();
        self.ready.clear();
        self.scope.revert();
    }
}

/// Supervises one unit.
///
/// Order of events: environment applied, runtime built, `ready` set,
/// `run_forever`, teardown, then `shutdown` set, `ready` cleared and the
/// environment reverted. `ready` is never set if construction fails.
pub async fn supervise(
    config: &UnitConfig,
    span: &tracing::Span,
    factory: &dyn RuntimeFactory,
    addresses: &ControlAddresses,
    ready: &Signal,
    shutdown: &Signal,
) -> Outcome {
    let mut release = Release {
        ready,
        shutdown,
        scope: EnvScope::new(config.backend),
    };

    let outcome = run_phases(config, factory, addresses, ready, &mut release.scope)
        .instrument(span.clone())
        .await;

    drop(release);
    span.in_scope(|| {
        tracing::debug!(unit = %config.name, phase = %outcome.phase, "Unit released");
    });
    outcome
}

async fn run_phases(
    config: &UnitConfig,
    factory: &dyn RuntimeFactory,
    addresses: &ControlAddresses,
    ready: &Signal,
    scope: &mut EnvScope,
) -> Outcome {
    let expected = expected_runtime(config.backend);

    if let Err(e) = scope.apply(&config.env) {
        report(config, Phase::Construction, expected, Failure::error(&e, "construction_failure"));
        return Outcome::before_ready(Phase::Construction);
    }

    let built = std::panic::catch_unwind(AssertUnwindSafe(|| factory.build(config, addresses)));
    let mut runtime = match built {
        Ok(Ok(runtime)) => runtime,
        Ok(Err(e)) => {
            report(config, Phase::Initialization, expected, Failure::error(&e, e.as_label()));
            return Outcome::before_ready(Phase::Initialization);
        }
        Err(payload) => {
            report(config, Phase::Initialization, expected, Failure::panic(payload));
            return Outcome::before_ready(Phase::Initialization);
        }
    };
    let name = runtime.name();

    ready.set();
    info!(
        unit = %config.name,
        runtime = name,
        address = %runtime.control_address(),
        "Unit is ready"
    );

    let phase = match AssertUnwindSafe(runtime.run_forever()).catch_unwind().await {
        Ok(Ok(())) => {
            info!(unit = %config.name, phase = "graceful", runtime = name, "{} ended gracefully", name);
            Phase::Graceful
        }
        Ok(Err(RuntimeError::Terminated { reason })) => {
            info!(
                unit = %config.name,
                phase = "terminated-by-peer",
                runtime = name,
                reason = %reason,
                "{} is end",
                name
            );
            Phase::TerminatedByPeer
        }
        Ok(Err(RuntimeError::Interrupted)) => {
            info!(unit = %config.name, phase = "user-interrupt", runtime = name, "{} is interrupted by user", name);
            Phase::UserInterrupt
        }
        Ok(Err(e @ RuntimeError::FailToStart { .. })) => {
            report(config, Phase::Start, name, Failure::error(&e, e.as_label()));
            Phase::Start
        }
        Ok(Err(e)) => {
            report(config, Phase::Unexpected, name, Failure::error(&e, e.as_label()));
            Phase::Unexpected
        }
        Err(payload) => {
            report(config, Phase::Unexpected, name, Failure::panic(payload));
            Phase::Unexpected
        }
    };

    let teardown_failed = match AssertUnwindSafe(runtime.teardown()).catch_unwind().await {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            report(config, Phase::Teardown, name, Failure::error(&e, "teardown_failure"));
            true
        }
        Err(payload) => {
            report(config, Phase::Teardown, name, Failure::panic(payload));
            true
        }
    };
    drop(runtime);

    Outcome {
        phase,
        ready_was_set: true,
        teardown_failed,
    }
}

fn expected_runtime(backend: Backend) -> &'static str {
    match backend {
        Backend::Thread => ThreadRuntime::NAME,
        Backend::Process => ProcessRuntime::NAME,
        Backend::RemoteDaemon => RemoteDaemonRuntime::NAME,
    }
}

struct Failure {
    kind: &'static str,
    message: String,
    detail: String,
}

impl Failure {
    fn error(e: &(dyn StdError + 'static), kind: &'static str) -> Self {
        let mut detail = format!("{:?}", e);
        let mut source = e.source();
        while let Some(cause) = source {
            detail.push_str(&format!("\n  caused by: {}", cause));
            source = cause.source();
        }
        Self {
            kind,
            message: e.to_string(),
            detail,
        }
    }

    fn panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self {
            kind: "unexpected_failure",
            detail: format!("panicked: {}", message),
            message,
        }
    }
}

fn report(config: &UnitConfig, phase: Phase, runtime: &str, failure: Failure) {
    if config.quiet_error {
        error!(
            unit = %config.name,
            phase = phase.as_str(),
            runtime,
            kind = failure.kind,
            error = %failure.message,
            "{} during {} {}",
            failure.message,
            runtime,
            phase
        );
    } else {
        error!(
            unit = %config.name,
            phase = phase.as_str(),
            runtime,
            kind = failure.kind,
            error = %failure.message,
            detail = %failure.detail,
            "{} during {} {}\n {}",
            failure.message,
            runtime,
            phase,
            QUIET_ERROR_HINT
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControlAddress, ControlTimeout};
    use crate::control::{ControlClient, LifecycleState};
    use crate::runtime::{BackendFactory, Runtime};
    use crate::test_support::{CountingEvent, LogCapture};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tracing::Level;

    #[derive(Clone, Copy)]
    enum Behavior {
        Graceful,
        Terminated,
        Interrupted,
        FailToStart,
        Error,
        Panic,
    }

    #[derive(Default)]
    struct Probe {
        teardowns: AtomicUsize,
        ready_during_run: AtomicBool,
        shutdown_during_teardown: AtomicBool,
        env_during_run: Mutex<Option<String>>,
    }

    struct StubRuntime {
        behavior: Behavior,
        fail_teardown: bool,
        address: ControlAddress,
        probe: Arc<Probe>,
        ready: Signal,
        shutdown: Signal,
        env_key: Option<String>,
    }

    #[async_trait]
    impl Runtime for StubRuntime {
        fn name(&self) -> &'static str {
            "StubRuntime"
        }

        fn control_address(&self) -> &ControlAddress {
            &self.address
        }

        fn state(&self) -> LifecycleState {
            LifecycleState::Running
        }

        async fn run_forever(&mut self) -> Result<(), RuntimeError> {
            self.probe
                .ready_during_run
                .store(self.ready.is_set(), Ordering::SeqCst);
            if let Some(key) = &self.env_key {
                *self.probe.env_during_run.lock().unwrap() = std::env::var(key).ok();
            }
            match self.behavior {
                Behavior::Graceful => Ok(()),
                Behavior::Terminated => Err(RuntimeError::terminated("peer said bye")),
                Behavior::Interrupted => Err(RuntimeError::Interrupted),
                Behavior::FailToStart => Err(RuntimeError::fail_to_start("no workers")),
                Behavior::Error => Err(RuntimeError::Other(
                    anyhow::anyhow!("disk on fire").context("while serving"),
                )),
                Behavior::Panic => panic!("stub exploded"),
            }
        }

        async fn teardown(&mut self) -> Result<(), RuntimeError> {
            self.probe.teardowns.fetch_add(1, Ordering::SeqCst);
            self.probe
                .shutdown_during_teardown
                .store(self.shutdown.is_set(), Ordering::SeqCst);
            if self.fail_teardown {
                return Err(RuntimeError::Other(anyhow::anyhow!("socket stuck")));
            }
            Ok(())
        }
    }

    struct StubFactory {
        behavior: Behavior,
        fail_build: bool,
        fail_teardown: bool,
        probe: Arc<Probe>,
        ready: Signal,
        shutdown: Signal,
        env_key: Option<String>,
        builds: AtomicUsize,
    }

    impl StubFactory {
        fn new(behavior: Behavior, ready: &Signal, shutdown: &Signal) -> Self {
            Self {
                behavior,
                fail_build: false,
                fail_teardown: false,
                probe: Arc::new(Probe::default()),
                ready: ready.clone(),
                shutdown: shutdown.clone(),
                env_key: None,
                builds: AtomicUsize::new(0),
            }
        }
    }

    impl RuntimeFactory for StubFactory {
        fn build(
            &self,
            _config: &UnitConfig,
            addresses: &ControlAddresses,
        ) -> Result<Box<dyn Runtime>, RuntimeError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if self.fail_build {
                return Err(RuntimeError::Bind {
                    address: addresses.unit.to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
                });
            }
            Ok(Box::new(StubRuntime {
                behavior: self.behavior,
                fail_teardown: self.fail_teardown,
                address: addresses.unit.clone(),
                probe: self.probe.clone(),
                ready: self.ready.clone(),
                shutdown: self.shutdown.clone(),
                env_key: self.env_key.clone(),
            }))
        }
    }

    fn addresses() -> ControlAddresses {
        ControlAddresses::new(
            ControlAddress::tcp("127.0.0.1", 0).resolved(),
            ControlAddress::tcp("127.0.0.1", 0).resolved(),
        )
    }

    fn config(backend: Backend) -> UnitConfig {
        UnitConfig::new("unit-under-test", backend).control_timeout_ms(2000)
    }

    async fn run_stub(
        config: &UnitConfig,
        factory: &StubFactory,
        ready: &Signal,
        shutdown: &Signal,
    ) -> Outcome {
        let span = tracing::info_span!("pea", unit = %config.name);
        supervise(config, &span, factory, &addresses(), ready, shutdown).await
    }

    #[tokio::test]
    async fn test_graceful_run_orders_signals() {
        let ready = Signal::in_memory();
        let (shutdown, counter) = CountingEvent::signal();
        let factory = StubFactory::new(Behavior::Graceful, &ready, &shutdown);

        let outcome = run_stub(&config(Backend::Process), &factory, &ready, &shutdown).await;

        assert_eq!(outcome.phase, Phase::Graceful);
        assert!(outcome.ready_was_set);
        assert!(!outcome.teardown_failed);
        assert!(factory.probe.ready_during_run.load(Ordering::SeqCst));
        assert!(!factory.probe.shutdown_during_teardown.load(Ordering::SeqCst));
        assert_eq!(factory.probe.teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(counter.sets(), 1);
        assert!(!ready.is_set());
        assert!(ready.has_fired());
    }

    #[tokio::test]
    async fn test_construction_failure_never_sets_ready() {
        let (logs, _guard) = LogCapture::install();
        let ready = Signal::in_memory();
        let (shutdown, counter) = CountingEvent::signal();
        let mut factory = StubFactory::new(Behavior::Graceful, &ready, &shutdown);
        factory.fail_build = true;

        let outcome = run_stub(&config(Backend::Process), &factory, &ready, &shutdown).await;

        assert_eq!(outcome.phase, Phase::Initialization);
        assert!(!outcome.ready_was_set);
        assert!(!ready.has_fired());
        assert_eq!(counter.sets(), 1);
        assert_eq!(factory.probe.teardowns.load(Ordering::SeqCst), 0);

        let failures = logs.with_field("phase", "initialization");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].level, Level::ERROR);
        assert_eq!(failures[0].field("kind"), Some("construction_failure"));
    }

    #[tokio::test]
    async fn test_invalid_env_is_construction_phase() {
        let (logs, _guard) = LogCapture::install();
        let ready = Signal::in_memory();
        let (shutdown, counter) = CountingEvent::signal();
        let factory = StubFactory::new(Behavior::Graceful, &ready, &shutdown);
        let config = config(Backend::Process).env("BAD=NAME", "1");

        let outcome = run_stub(&config, &factory, &ready, &shutdown).await;

        assert_eq!(outcome.phase, Phase::Construction);
        assert_eq!(factory.builds.load(Ordering::SeqCst), 0);
        assert!(!ready.has_fired());
        assert_eq!(counter.sets(), 1);
        assert_eq!(logs.with_field("phase", "construction").len(), 1);
    }

    #[tokio::test]
    async fn test_unexpected_error_logs_detail_and_tears_down() {
        let (logs, _guard) = LogCapture::install();
        let ready = Signal::in_memory();
        let (shutdown, counter) = CountingEvent::signal();
        let factory = StubFactory::new(Behavior::Error, &ready, &shutdown);

        let outcome = run_stub(&config(Backend::Process), &factory, &ready, &shutdown).await;

        assert_eq!(outcome.phase, Phase::Unexpected);
        assert_eq!(factory.probe.teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(counter.sets(), 1);

        let failures = logs.with_field("phase", "unexpected");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].level, Level::ERROR);
        assert_eq!(failures[0].field("runtime"), Some("StubRuntime"));
        assert_eq!(failures[0].field("kind"), Some("unexpected_failure"));
        assert!(failures[0].field("detail").unwrap().contains("disk on fire"));
        assert!(failures[0].message().contains("--quiet-error"));
    }

    #[tokio::test]
    async fn test_quiet_error_omits_detail() {
        let (logs, _guard) = LogCapture::install();
        let ready = Signal::in_memory();
        let shutdown = Signal::in_memory();
        let factory = StubFactory::new(Behavior::Error, &ready, &shutdown);
        let config = config(Backend::Process).quiet_error(true);

        run_stub(&config, &factory, &ready, &shutdown).await;

        let failures = logs.with_field("phase", "unexpected");
        assert_eq!(failures.len(), 1);
        assert!(failures[0].field("detail").is_none());
        assert!(!failures[0].message().contains("--quiet-error"));
        assert_eq!(factory.probe.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_in_run_forever_is_contained() {
        let (logs, _guard) = LogCapture::install();
        let ready = Signal::in_memory();
        let (shutdown, counter) = CountingEvent::signal();
        let factory = StubFactory::new(Behavior::Panic, &ready, &shutdown);

        let outcome = run_stub(&config(Backend::Process), &factory, &ready, &shutdown).await;

        assert_eq!(outcome.phase, Phase::Unexpected);
        assert_eq!(factory.probe.teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(counter.sets(), 1);
        let failures = logs.with_field("phase", "unexpected");
        assert!(failures[0].field("error").unwrap().contains("stub exploded"));
    }

    #[tokio::test]
    async fn test_teardown_failure_still_releases() {
        let (logs, _guard) = LogCapture::install();
        let ready = Signal::in_memory();
        let (shutdown, counter) = CountingEvent::signal();
        let mut factory = StubFactory::new(Behavior::Graceful, &ready, &shutdown);
        factory.fail_teardown = true;

        let outcome = run_stub(&config(Backend::Process), &factory, &ready, &shutdown).await;

        assert_eq!(outcome.phase, Phase::Graceful);
        assert!(outcome.teardown_failed);
        assert!(!factory.probe.shutdown_during_teardown.load(Ordering::SeqCst));
        assert_eq!(counter.sets(), 1);
        assert!(!ready.is_set());
        assert_eq!(logs.with_field("phase", "teardown").len(), 1);
    }

    #[tokio::test]
    async fn test_peer_termination_and_interrupt_are_not_errors() {
        for (behavior, phase) in [
            (Behavior::Terminated, "terminated-by-peer"),
            (Behavior::Interrupted, "user-interrupt"),
        ] {
            let (logs, _guard) = LogCapture::install();
            let ready = Signal::in_memory();
            let shutdown = Signal::in_memory();
            let factory = StubFactory::new(behavior, &ready, &shutdown);

            let outcome = run_stub(&config(Backend::Process), &factory, &ready, &shutdown).await;

            assert_eq!(outcome.phase.as_str(), phase);
            assert!(!outcome.phase.is_failure());
            let events = logs.with_field("phase", phase);
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].level, Level::INFO);
            assert!(shutdown.is_set());
        }
    }

    #[tokio::test]
    async fn test_fail_to_start_is_start_phase() {
        let (logs, _guard) = LogCapture::install();
        let ready = Signal::in_memory();
        let shutdown = Signal::in_memory();
        let factory = StubFactory::new(Behavior::FailToStart, &ready, &shutdown);

        let outcome = run_stub(&config(Backend::Process), &factory, &ready, &shutdown).await;

        assert_eq!(outcome.phase, Phase::Start);
        let events = logs.with_field("phase", "start");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, Level::ERROR);
    }

    #[tokio::test]
    async fn test_thread_backend_warns_and_leaves_env_alone() {
        let (logs, _guard) = LogCapture::install();
        let ready = Signal::in_memory();
        let shutdown = Signal::in_memory();
        let mut factory = StubFactory::new(Behavior::Graceful, &ready, &shutdown);
        factory.env_key = Some("PEA_SUPERVISE_THREAD_X".into());
        let config = config(Backend::Thread).env("PEA_SUPERVISE_THREAD_X", "1");

        let outcome = run_stub(&config, &factory, &ready, &shutdown).await;

        assert_eq!(outcome.phase, Phase::Graceful);
        assert!(logs.events().iter().any(|e| e.level == Level::WARN
            && e.message()
                .contains("environment variables should not be set when runtime=\"thread\"")));
        assert_eq!(*factory.probe.env_during_run.lock().unwrap(), None);
        assert!(std::env::var("PEA_SUPERVISE_THREAD_X").is_err());
    }

    #[tokio::test]
    async fn test_process_env_present_during_run_only() {
        let ready = Signal::in_memory();
        let shutdown = Signal::in_memory();
        let mut factory = StubFactory::new(Behavior::Graceful, &ready, &shutdown);
        factory.env_key = Some("PEA_SUPERVISE_PROCESS_X".into());
        let config = config(Backend::Process).env("PEA_SUPERVISE_PROCESS_X", "1");

        run_stub(&config, &factory, &ready, &shutdown).await;

        assert_eq!(
            factory.probe.env_during_run.lock().unwrap().as_deref(),
            Some("1")
        );
        assert!(std::env::var("PEA_SUPERVISE_PROCESS_X").is_err());
    }

    #[tokio::test]
    async fn test_process_runtime_cancelled_over_control_channel() {
        let config = config(Backend::Process).control_port(0);
        let addresses = ControlAddresses::allocate(&config);
        let ready = Signal::in_memory();
        let shutdown = Signal::in_memory();
        let client = ControlClient::new(addresses.unit.clone(), ControlTimeout::from_millis(2000));

        let waiter = ready.clone();
        let canceller = tokio::spawn(async move {
            for _ in 0..200 {
                if waiter.is_set() && client.is_ready().await.unwrap_or(false) {
                    client.cancel().await.unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("unit never became ready");
        });

        let span = tracing::info_span!("pea", unit = %config.name);
        let outcome = tokio::time::timeout(
            Duration::from_millis(4000),
            supervise(&config, &span, &BackendFactory::new(), &addresses, &ready, &shutdown),
        )
        .await
        .expect("cancel did not end the unit within the control timeout");

        canceller.await.unwrap();
        assert_eq!(outcome.phase, Phase::Graceful);
        assert!(shutdown.is_set());
        assert!(!ready.is_set());
    }

    #[tokio::test]
    async fn test_colliding_address_fails_initialization() {
        let (logs, _guard) = LogCapture::install();
        let config = config(Backend::Process).control_port(0);
        let addresses = ControlAddresses::allocate(&config);
        let holder =
            crate::control::ControlServer::bind(&addresses.unit, config.control_timeout).unwrap();

        let ready = Signal::in_memory();
        let shutdown = Signal::in_memory();
        let span = tracing::info_span!("pea", unit = %config.name);
        let outcome =
            supervise(&config, &span, &BackendFactory::new(), &addresses, &ready, &shutdown).await;

        assert_eq!(outcome.phase, Phase::Initialization);
        assert!(!ready.has_fired());
        assert!(shutdown.is_set());
        let failures = logs.with_field("phase", "initialization");
        assert_eq!(failures[0].field("kind"), Some("construction_failure"));
        drop(holder);
    }
}

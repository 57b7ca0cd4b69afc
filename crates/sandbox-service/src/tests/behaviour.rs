//! Behavioural tests for the service bootstrap sequence.

use std::cell::RefCell;
use std::sync::Arc;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

use sandbox_config::Config;

use super::support::{FailingConfigLoader, HealthEvent, RecordingHealthReporter, bootstrap};
use crate::bootstrap::{BootstrapError, ConfigLoader, SandboxService, StaticConfigLoader};

/// Scenario world shared across BDD steps.
struct TestWorld {
    loader: Box<dyn ConfigLoader>,
    reporter: Arc<RecordingHealthReporter>,
    service: Option<SandboxService>,
    error: Option<BootstrapError>,
}

impl Default for TestWorld {
    fn default() -> Self {
        Self {
            loader: Box::new(StaticConfigLoader::new(Config::default())),
            reporter: Arc::new(RecordingHealthReporter::default()),
            service: None,
            error: None,
        }
    }
}

#[fixture]
fn world() -> RefCell<TestWorld> {
    RefCell::new(TestWorld::default())
}

#[given("a healthy configuration loader")]
fn given_healthy_loader(world: &RefCell<TestWorld>) {
    world.borrow_mut().loader = Box::new(StaticConfigLoader::new(Config::default()));
}

#[given("a failing configuration loader")]
fn given_failing_loader(world: &RefCell<TestWorld>) {
    world.borrow_mut().loader = Box::new(FailingConfigLoader);
}

#[given("a configuration with a bind retry limit of {limit}")]
fn given_retry_limit(world: &RefCell<TestWorld>, limit: u32) {
    world.borrow_mut().loader = Box::new(StaticConfigLoader::new(Config {
        bind_retry_limit: limit,
        ..Config::default()
    }));
}

#[when("the service bootstrap runs")]
fn when_bootstrap_runs(world: &RefCell<TestWorld>) {
    let mut state = world.borrow_mut();
    let (reporter, result) = bootstrap(&*state.loader);
    state.reporter = reporter;
    match result {
        Ok(service) => state.service = Some(service),
        Err(error) => state.error = Some(error),
    }
}

#[when("the sandbox state is reported")]
fn when_state_reported(world: &RefCell<TestWorld>) {
    let state = world.borrow();
    let service = state.service.as_ref().expect("service should be running");
    service.report_state();
}

#[then("bootstrap succeeds")]
fn then_bootstrap_succeeds(world: &RefCell<TestWorld>) {
    let state = world.borrow();
    assert!(state.error.is_none(), "bootstrap error: {:?}", state.error);
    assert!(state.service.is_some(), "service should have been started");
}

#[then("bootstrap fails")]
fn then_bootstrap_fails(world: &RefCell<TestWorld>) {
    assert!(
        world.borrow().error.is_some(),
        "bootstrap succeeded unexpectedly"
    );
}

#[then("the failure mentions {text}")]
fn then_failure_mentions(world: &RefCell<TestWorld>, text: String) {
    let needle = text.trim_matches('"');
    let state = world.borrow();
    let error = state.error.as_ref().expect("bootstrap error missing");
    assert!(error.to_string().contains(needle), "error: {error}");
}

#[then("the reporter recorded bootstrap start")]
fn then_reporter_start(world: &RefCell<TestWorld>) {
    assert!(
        world
            .borrow()
            .reporter
            .events()
            .contains(&HealthEvent::BootstrapStarting),
        "bootstrap start event missing"
    );
}

#[then("the reporter recorded bootstrap success")]
fn then_reporter_success(world: &RefCell<TestWorld>) {
    assert!(
        world
            .borrow()
            .reporter
            .events()
            .contains(&HealthEvent::BootstrapSucceeded),
        "bootstrap success event missing"
    );
}

#[then("the reporter recorded bootstrap failure")]
fn then_reporter_failure(world: &RefCell<TestWorld>) {
    let events = world.borrow().reporter.events();
    let failed = events
        .iter()
        .any(|event| matches!(event, HealthEvent::BootstrapFailed(_)));
    assert!(failed, "bootstrap failure event missing: {events:?}");
}

#[then("the reporter recorded a state with {count} tokens")]
fn then_reporter_state(world: &RefCell<TestWorld>, count: usize) {
    let events = world.borrow().reporter.events();
    assert!(
        events.contains(&HealthEvent::StateReported(count)),
        "state event missing: {events:?}"
    );
}

#[scenario(
    path = "tests/features/service_bootstrap.feature",
    name = "Bootstrap with a healthy configuration"
)]
fn healthy_bootstrap(world: RefCell<TestWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/service_bootstrap.feature",
    name = "Bootstrap with a failing configuration loader"
)]
fn failing_loader_bootstrap(world: RefCell<TestWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/service_bootstrap.feature",
    name = "Bootstrap rejects an excessive retry limit"
)]
fn excessive_retry_limit(world: RefCell<TestWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/service_bootstrap.feature",
    name = "Operators can report the sandbox state"
)]
fn state_reporting(world: RefCell<TestWorld>) {
    let _ = world;
}

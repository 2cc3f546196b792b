//! End-to-end runs through `Engine` with simulated collaborators.

use std::sync::Arc;
use std::time::Duration;

use convoy::config::{ConvoyConfig, SolverMode};
use convoy::events::RunEvent;
use convoy::prefetch::CredentialProvider;
use convoy::relay::{ChannelRelay, HumanRelay};
use convoy::scheduler::HaltReason;
use convoy::sim::{
    SimBehavior, SimDriver, SimPoller, SimProvider, SimSession, SimSessionFactory, SimSolver,
};
use convoy::{Collaborators, ConvoyError, Engine};

const TARGET: &str = "https://target.test/signup";

fn fast_config() -> ConvoyConfig {
    let mut config = ConvoyConfig::default();
    config.prefetch.refill_interval_ms = 5;
    config.challenge.signal_checks = 2;
    config.challenge.signal_interval_ms = 1;
    config.confirmation.initial_backoff_ms = 1;
    config.confirmation.max_backoff_ms = 2;
    config.confirmation.max_probes = 5;
    config.finalize.settle_checks = 2;
    config.finalize.settle_interval_ms = 1;
    config
}

fn collaborators(
    behavior: SimBehavior,
    factory: Arc<SimSessionFactory>,
) -> Collaborators<SimSession> {
    Collaborators {
        sessions: factory,
        driver: Arc::new(SimDriver::new(behavior)),
        providers: vec![
            SimProvider::failing("primary") as Arc<dyn CredentialProvider>,
            SimProvider::new("secondary") as Arc<dyn CredentialProvider>,
        ],
        poller: Arc::new(SimPoller::ready_after(2)),
        solver: Some(Arc::new(SimSolver::answering("x7k2"))),
        relay: None,
    }
}

#[tokio::test]
async fn reaches_target_despite_intermittent_failures() {
    let config = fast_config();
    let engine = Engine::new(
        config.clone(),
        collaborators(
            SimBehavior {
                identity_fail_every: Some(2),
                ..SimBehavior::default()
            },
            Arc::new(SimSessionFactory::new()),
        ),
    )
    .unwrap();
    let mut events = engine.subscribe();

    let summary = engine
        .start_run(TARGET, 4, &config.concurrency, &config.challenge)
        .await
        .unwrap();

    assert_eq!(summary.halt_reason, HaltReason::TargetReached);
    assert_eq!(summary.actual_successful, 4);
    assert_eq!(summary.target_successful, 4);
    assert!(summary.failed >= 1);
    assert_eq!(
        summary.total_attempts,
        summary.actual_successful + summary.failed + summary.skipped
    );
    assert!(summary.total_attempts <= 4 * config.concurrency.attempt_multiplier);

    let mut last = None;
    let mut settled = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            RunEvent::Progress(progress) => {
                if let Some(prev) = last {
                    assert!(progress.attempts > prev);
                }
                last = Some(progress.attempts);
            }
            RunEvent::TaskSettled(_) => settled += 1,
            _ => {}
        }
    }
    assert_eq!(last, Some(summary.total_attempts));
    assert_eq!(settled, summary.total_attempts);

    let stats = engine.arbiter_stats();
    assert_eq!(stats.holder, None);
    assert_eq!(stats.grants, stats.releases);
    engine.cleanup().await;
}

#[tokio::test]
async fn hopeless_run_stops_at_attempt_ceiling_and_backs_off() {
    let mut config = fast_config();
    config.concurrency.attempt_multiplier = 3;
    config.challenge.rounds = 1;
    config.challenge.attempts_per_round = 1;

    let engine = Engine::new(
        config.clone(),
        collaborators(
            SimBehavior {
                pass_on_submission: None,
                ..SimBehavior::default()
            },
            Arc::new(SimSessionFactory::new()),
        ),
    )
    .unwrap();

    let summary = engine
        .start_run(TARGET, 2, &config.concurrency, &config.challenge)
        .await
        .unwrap();

    assert_eq!(summary.halt_reason, HaltReason::AttemptCeiling);
    assert_eq!(summary.actual_successful, 0);
    assert_eq!(summary.total_attempts, 6);
    assert_eq!(summary.failed, 6);
    let first = summary
        .concurrency_history
        .first()
        .expect("concurrency should have been lowered");
    assert_eq!((first.from, first.to), (3, 2));
    engine.cleanup().await;
}

#[tokio::test]
async fn cleanup_mid_run_cancels_and_releases_everything() {
    let config = fast_config();
    let factory = Arc::new(SimSessionFactory::new());
    let engine = Arc::new(
        Engine::new(
            config.clone(),
            collaborators(
                SimBehavior {
                    latency: Duration::from_millis(30),
                    ..SimBehavior::default()
                },
                Arc::clone(&factory),
            ),
        )
        .unwrap(),
    );

    let killer = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            engine.cleanup().await;
        })
    };

    let summary = engine
        .start_run(TARGET, 500, &config.concurrency, &config.challenge)
        .await
        .unwrap();
    killer.await.unwrap();

    assert_eq!(summary.halt_reason, HaltReason::Cancelled);
    assert!(summary.actual_successful < 500);
    let stats = engine.pool_stats();
    assert_eq!(stats.free, 0);
    assert_eq!(stats.in_use, 0);
    assert!(factory.created() > 0);
    assert_eq!(factory.torn_down(), factory.created());

    assert!(matches!(
        engine
            .start_run(TARGET, 1, &config.concurrency, &config.challenge)
            .await,
        Err(ConvoyError::Closed)
    ));
}

#[tokio::test]
async fn broken_session_backend_fails_setup() {
    let config = fast_config();
    let engine = Engine::new(
        config.clone(),
        collaborators(SimBehavior::default(), Arc::new(SimSessionFactory::broken())),
    )
    .unwrap();

    let err = engine
        .start_run(TARGET, 1, &config.concurrency, &config.challenge)
        .await
        .unwrap_err();
    assert!(matches!(err, ConvoyError::Setup(_)));
}

#[tokio::test]
async fn operator_skips_are_neither_success_nor_failure() {
    let mut config = fast_config();
    config.concurrency.attempt_multiplier = 2;
    config.challenge.mode = SolverMode::Human;

    let (relay, mut prompts) = ChannelRelay::new(16);
    let mut c = collaborators(SimBehavior::default(), Arc::new(SimSessionFactory::new()));
    c.relay = Some(Arc::clone(&relay) as Arc<dyn HumanRelay>);
    let engine = Engine::new(config.clone(), c).unwrap();

    let operator = tokio::spawn(async move {
        while let Some(prompt) = prompts.recv().await {
            relay.skip(prompt.task);
        }
    });

    let summary = engine
        .start_run(TARGET, 2, &config.concurrency, &config.challenge)
        .await
        .unwrap();
    operator.abort();

    assert_eq!(summary.halt_reason, HaltReason::AttemptCeiling);
    assert_eq!(summary.total_attempts, 4);
    assert_eq!(summary.skipped, 4);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.actual_successful, 0);
    assert_eq!(engine.arbiter_stats().holder, None);
    engine.cleanup().await;
}

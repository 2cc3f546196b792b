use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use convoy::cli::{Cli, Command};
use convoy::config::{ConvoyConfig, SolverMode};
use convoy::prefetch::CredentialProvider;
use convoy::relay::{ChannelRelay, HumanRelay, RelayReply};
use convoy::sim::{
    SimBehavior, SimDriver, SimPoller, SimProvider, SimSessionFactory, SimSolver,
};
use convoy::ui::{RunProgress, print_summary};
use convoy::{Collaborators, Engine};

fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt)
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ConvoyConfig> {
    let mut config = match &cli.config {
        Some(path) => ConvoyConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConvoyConfig::load()?,
    };

    if let Some(max) = cli.max_concurrency {
        let concurrency = &mut config.concurrency;
        concurrency.max = max;
        concurrency.min = concurrency.min.min(max);
        concurrency.initial = concurrency.initial.clamp(concurrency.min, max);
        config.pool.capacity = config.pool.capacity.max(max);
        config.validate()?;
    }
    Ok(config)
}

async fn run_demo(
    config: ConvoyConfig,
    successes: u32,
    fail_every: Option<u64>,
    target: String,
) -> anyhow::Result<()> {
    let driver = SimDriver::new(SimBehavior {
        identity_fail_every: fail_every,
        latency: Duration::from_millis(40),
        ..SimBehavior::default()
    });

    // In human mode a scripted operator answers every prompt after a pause.
    let (relay, operator) = if config.challenge.mode == SolverMode::Human {
        let (relay, mut prompts) = ChannelRelay::new(16);
        let responder = Arc::clone(&relay);
        let operator = tokio::spawn(async move {
            while let Some(prompt) = prompts.recv().await {
                tokio::time::sleep(Duration::from_millis(300)).await;
                responder.respond(prompt.task, RelayReply::Answer("demo".into()));
            }
        });
        (Some(relay as Arc<dyn HumanRelay>), Some(operator))
    } else {
        (None, None)
    };

    let collaborators = Collaborators {
        sessions: Arc::new(SimSessionFactory::new()),
        driver: Arc::new(driver),
        providers: vec![
            SimProvider::failing("primary") as Arc<dyn CredentialProvider>,
            SimProvider::new("fallback") as Arc<dyn CredentialProvider>,
        ],
        poller: Arc::new(SimPoller::ready_after(2)),
        solver: Some(Arc::new(SimSolver::answering("demo"))),
        relay,
    };

    let engine = Arc::new(Engine::new(config, collaborators)?);

    let progress = RunProgress::start(successes).follow(engine.subscribe());
    let interrupt = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted - cleaning up");
                engine.cleanup().await;
            }
        })
    };

    let settings = engine.config();
    let result = engine
        .start_run(&target, successes, &settings.concurrency, &settings.challenge)
        .await;
    interrupt.abort();
    if let Some(operator) = operator {
        operator.abort();
    }
    if let Err(e) = progress.await {
        tracing::debug!(error = %e, "Progress display stopped abnormally");
    }
    engine.cleanup().await;

    let summary = result?;
    print_summary(&summary);
    let stats = engine.pool_stats();
    tracing::debug!(
        created = stats.created,
        reused = stats.reused,
        discarded = stats.discarded,
        "Pool totals"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "convoy=debug" } else { "convoy=info" };
    init_tracing(default_filter, cli.log_json);

    let config = load_config(&cli)?;

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Demo {
            successes,
            fail_every,
            target,
        } => {
            run_demo(config, successes, fail_every, target).await?;
        }
    }
    Ok(())
}

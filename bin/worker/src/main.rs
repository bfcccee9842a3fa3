mod config;

use config::WorkerConfig;
use std::sync::Arc;
use std::time::Duration;
use tideflow_engine::{
    CancellationManager, Engine, EngineDeps, InMemoryExecutionStore, InMemoryNodeRunStore,
    InMemoryProgressStore, InMemoryWaitStore, InMemoryWorkflowStore, NodeRegistry, WaitManager,
};
use tideflow_guard::{BreakerManager, InMemoryCredentials};
use tideflow_queue::{
    ExecutionProducer, NatsCancelBus, NatsJobQueue, NatsJobSource, NatsQueueConfig, WorkerPool,
    WorkerPoolConfig,
};
use tideflow_scheduler::{InMemoryScheduleStore, ScheduleLoop, ScheduleLoopConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = WorkerConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    // Shared engine plumbing. Persistence adapters plug in through the
    // store traits; this daemon wires the in-memory implementations for
    // single-node operation.
    let credentials = Arc::new(InMemoryCredentials::new());
    let breakers = Arc::new(BreakerManager::default());
    let registry = Arc::new(NodeRegistry::builtin(credentials.clone(), breakers));

    let workflows = Arc::new(InMemoryWorkflowStore::new());
    let executions = Arc::new(InMemoryExecutionStore::new());
    let node_runs = Arc::new(InMemoryNodeRunStore::new());
    let progress = Arc::new(InMemoryProgressStore::default());
    let wait_manager = Arc::new(WaitManager::new(Arc::new(InMemoryWaitStore::new())));
    let cancellations = Arc::new(CancellationManager::new());

    let engine = Arc::new(Engine::new(EngineDeps {
        registry,
        workflows: workflows.clone(),
        executions: executions.clone(),
        node_runs,
        progress,
        wait_manager: wait_manager.clone(),
        cancellations: cancellations.clone(),
        credentials,
        env: serde_json::Map::new(),
    }));

    // Broker wiring.
    let queue_config = NatsQueueConfig {
        visibility_timeout: Duration::from_secs(config.queue.visibility_timeout_seconds),
        max_deliver: config.queue.max_deliver,
        ..NatsQueueConfig::new(config.nats_url.clone())
    };

    tracing::info!(url = %config.nats_url, "Connecting to NATS...");
    let job_queue = Arc::new(
        NatsJobQueue::connect(queue_config.clone())
            .await
            .expect("failed to connect job queue"),
    );
    let job_source = Arc::new(
        NatsJobSource::connect(queue_config)
            .await
            .expect("failed to connect job source"),
    );
    let cancel_bus = Arc::new(
        NatsCancelBus::connect(&config.nats_url)
            .await
            .expect("failed to connect cancel bus"),
    );

    let producer = Arc::new(ExecutionProducer::new(
        workflows.clone(),
        executions,
        job_queue,
        None,
    ));

    let shutdown = CancellationToken::new();

    // Cancellation listener: cluster-wide cancel notices cancel local
    // executions.
    let cancel_listener = tokio::spawn(
        cancellations
            .clone()
            .run_listener(cancel_bus, shutdown.clone()),
    );

    // Schedule loop.
    let schedule_loop = ScheduleLoop::new(
        Arc::new(InMemoryScheduleStore::new()),
        workflows,
        producer.clone(),
        ScheduleLoopConfig {
            tick: Duration::from_secs(config.schedule.tick_seconds),
        },
    );
    let schedule_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { schedule_loop.run(shutdown).await })
    };

    // Wait timeout sweeper: expired waits resume with a timed-out
    // payload.
    let sweeper_task = {
        let shutdown = shutdown.clone();
        let wait_manager = wait_manager.clone();
        let producer = producer.clone();
        let tick = Duration::from_secs(config.wait.tick_seconds);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(tick);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = timer.tick() => {
                        match wait_manager.sweep(chrono::Utc::now()).await {
                            Ok(resumes) => {
                                for resume in resumes {
                                    if let Err(e) = producer.submit_resume(resume).await {
                                        tracing::warn!(error = %e, "timed-out resume enqueue failed");
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "wait sweep failed");
                            }
                        }
                    }
                }
            }
        })
    };

    // Worker pool.
    let pool = WorkerPool::new(
        engine,
        job_source,
        WorkerPoolConfig {
            concurrency: config.pool.concurrency,
            max_attempts: config.pool.max_attempts,
            extend_every: Duration::from_secs(config.pool.extend_every_seconds),
        },
    );

    tracing::info!(
        concurrency = config.pool.concurrency,
        "tideflow worker running"
    );

    let pool_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pool.run(shutdown).await })
    };

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    tracing::info!("Shutdown requested; draining in-flight executions...");
    shutdown.cancel();

    let _ = pool_task.await;
    let _ = schedule_task.await;
    let _ = sweeper_task.await;
    let _ = cancel_listener.await;
    tracing::info!("tideflow worker stopped");
}

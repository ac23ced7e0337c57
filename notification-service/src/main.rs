use anyhow::Result;
use clap::Parser;
use notification_service::channels;
use notification_service::{api, Channel, ChannelWorker, NotificationRouter};
use shared::{consume, init_tracing, shutdown_signal, Backoff, KafkaBus, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "notification-service")]
struct Args {
    #[arg(long, env = "KAFKA_BROKERS", default_value = "localhost:9092")]
    kafka_brokers: String,

    #[arg(long, env = "NOTIFICATION_GROUP_ID", default_value = "notification-service-group")]
    group_id: String,

    #[arg(long, env = "MAX_RETRIES", default_value = "3")]
    max_retries: u32,

    #[arg(long, env = "RETRY_BASE_MS", default_value = "1000")]
    retry_base_ms: u64,

    #[arg(long, env = "FAILURE_RATE", default_value = "0.1")]
    failure_rate: f64,

    #[arg(long, env = "PORT", default_value = "3004")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let bus = KafkaBus::connect(&args.kafka_brokers, "notification-service")?;
    let result = run(&args, &bus).await;
    bus.close();
    result
}

async fn run(args: &Args, bus: &KafkaBus) -> Result<()> {
    let publisher = Arc::new(bus.clone());
    let policy = RetryPolicy::new(
        args.max_retries,
        Backoff::Exponential {
            base: Duration::from_millis(args.retry_base_ms),
        },
    );

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let topics = NotificationRouter::topics();
    let subscription = bus.subscribe(&args.group_id, &topics)?;
    let router = NotificationRouter::new(publisher.clone());
    tasks.spawn({
        let shutdown = shutdown.clone();
        async move { consume(subscription, &router, shutdown).await }
    });

    for channel in Channel::ALL {
        let group_id = format!("{}-{}-worker", args.group_id, channel);
        let subscription = bus.subscribe(&group_id, &[channel.queue()])?;
        let worker = ChannelWorker::new(
            channels::simulated(channel, args.failure_rate),
            publisher.clone(),
            policy,
        );
        tasks.spawn({
            let shutdown = shutdown.clone();
            async move { consume(subscription, &worker, shutdown).await }
        });
        info!(%channel, queue = channel.queue(), "Channel worker started");
    }

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    info!("Notification service started on port {}", args.port);

    let served = axum::serve(listener, api::create_router())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    shutdown.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("Notification task failed: {}", e);
        }
    }
    info!("Notification service stopped");

    served.map_err(Into::into)
}

//! CLI for PopQueue
//!
//! Subcommands:
//! - `server`: run the broker behind its WebSocket server
//! - `produce`: publish numbered jobs to a queue (useful for smoke tests)
//! - `work`: consume and ack jobs, optionally crashing after N of them to
//!   watch redelivery happen

use std::error::Error;
use std::time::Duration;

use clap::Parser;
use popqueue::broker::message::MessageId;
use popqueue::broker::{Broker, lock_broker};
use popqueue::client::RemoteClient;
use popqueue::config::{Settings, load_config};
use popqueue::transport::websocket::start_websocket_server;
use popqueue::utils::logging;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "popqueue", version, about = "A durable work-queue broker")]
enum Command {
    /// Start the broker and its WebSocket server
    Server,
    /// Publish `count` jobs to a queue
    Produce {
        /// WebSocket server URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long, default_value = "jobs")]
        queue: String,
        #[arg(long, default_value_t = 10)]
        count: u32,
        /// Publish non-persistent messages
        #[arg(long)]
        transient: bool,
    },
    /// Consume jobs from a queue, acking each after a simulated unit of work
    Work {
        /// WebSocket server URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long, default_value = "jobs")]
        queue: String,
        /// Name used in log lines
        #[arg(long, default_value = "worker")]
        worker_id: String,
        #[arg(long, default_value_t = 1)]
        prefetch: u32,
        /// Milliseconds spent on each job
        #[arg(long, default_value_t = 100)]
        work_ms: u64,
        /// Exit without acking once this many jobs were processed
        #[arg(long)]
        crash_after: Option<u32>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);

    let result = match cmd {
        Command::Server => run_server(settings).await,
        Command::Produce {
            url,
            queue,
            count,
            transient,
        } => run_produce(&url, &queue, count, transient).await,
        Command::Work {
            url,
            queue,
            worker_id,
            prefetch,
            work_ms,
            crash_after,
        } => {
            let job = WorkJob {
                queue,
                worker_id,
                prefetch,
                work: Duration::from_millis(work_ms),
                crash_after,
                heartbeat_every: Duration::from_secs(settings.broker.heartbeat_interval_secs.max(1)),
            };
            run_work(&url, job).await
        }
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_server(settings: Settings) -> Result<(), Box<dyn Error>> {
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let broker = Broker::open(&settings)?.into_shared();

    tokio::spawn(Broker::start_liveness_loop(broker.clone()));

    tokio::select! {
        result = start_websocket_server(&addr, broker.clone()) => {
            if let Err(e) = result {
                error!("WebSocket server failed: {e}");
            } else {
                error!("WebSocket server exited unexpectedly.");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    lock_broker(&broker).flush()?;
    Ok(())
}

async fn run_produce(
    url: &str,
    queue: &str,
    count: u32,
    transient: bool,
) -> Result<(), Box<dyn Error>> {
    let mut client = RemoteClient::connect(url).await?;
    client.declare(queue).await?;

    for i in 1..=count {
        let body = serde_json::json!({ "task": i, "payload": format!("job-{i}") }).to_string();
        let id = client.publish(queue, &body, !transient).await?;
        info!(queue, %id, body, "published");
    }

    client.close().await?;
    Ok(())
}

struct WorkJob {
    queue: String,
    worker_id: String,
    prefetch: u32,
    work: Duration,
    crash_after: Option<u32>,
    heartbeat_every: Duration,
}

async fn run_work(url: &str, job: WorkJob) -> Result<(), Box<dyn Error>> {
    let mut client = RemoteClient::connect(url).await?;
    client.declare(&job.queue).await?;
    let consumer = client.consume(&job.queue, job.prefetch).await?;
    info!(worker = %job.worker_id, consumer = %consumer, queue = %job.queue, "worker started");

    let mut processed = 0u32;
    loop {
        let delivery = match tokio::time::timeout(job.heartbeat_every, client.next_delivery()).await {
            Ok(delivery) => delivery?,
            Err(_) => {
                client.heartbeat(&consumer).await?;
                continue;
            }
        };

        if job.crash_after.is_some_and(|limit| processed >= limit) {
            warn!(
                worker = %job.worker_id,
                message_id = delivery.message_id,
                "simulating a crash, exiting without ack"
            );
            std::process::exit(1);
        }

        info!(
            worker = %job.worker_id,
            message_id = delivery.message_id,
            body = %delivery.body,
            redelivered = delivery.redelivered,
            "processing"
        );
        tokio::time::sleep(job.work).await;

        client.ack(&consumer, MessageId(delivery.message_id)).await?;
        processed += 1;
    }
}

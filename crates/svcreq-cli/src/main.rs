use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use svcreq_core::{NewServiceRequest, RequestBoard, RequestStatus, ServiceRequest, TRANSITIONS};
use svcreq_storage::{MemoryStore, RealtimeHub, RestStore};
use svcreq_sync::{Coordinator, CoordinatorConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "svcreq-cli")]
#[command(about = "Service request lifecycle coordinator")]
struct Cli {
    /// Tracing filter, e.g. `info` or `svcreq_sync=debug`. Falls back to RUST_LOG.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the lifecycle transition table.
    Table,
    /// Run one request through the whole lifecycle against the in-memory backend.
    Simulate {
        #[arg(long)]
        json: bool,
    },
    /// Fetch and bucket one user's requests from the REST backend.
    Board {
        #[arg(long)]
        viewer: String,
        /// Bearer token of the viewer, if the backend scopes rows per user.
        #[arg(long, env = "SVCREQ_ACCESS_TOKEN")]
        access_token: Option<String>,
    },
    /// Keep a user's board fresh on the configured cron schedule until interrupted.
    Follow {
        #[arg(long)]
        viewer: String,
        #[arg(long, env = "SVCREQ_ACCESS_TOKEN")]
        access_token: Option<String>,
    },
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .context("building log filter")?;
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command.unwrap_or(Commands::Table) {
        Commands::Table => print_table(),
        Commands::Simulate { json } => simulate(json).await?,
        Commands::Board { viewer, access_token } => {
            let config = CoordinatorConfig::from_env()?;
            let coordinator = rest_coordinator(&config, &viewer, access_token)?;
            let board = coordinator.refresh().await.context("fetching requests")?;
            println!("{}", serde_json::to_string_pretty(&board)?);
        }
        Commands::Follow { viewer, access_token } => {
            let config = CoordinatorConfig::from_env()?;
            follow(&config, &viewer, access_token).await?;
        }
    }

    Ok(())
}

fn print_table() {
    println!("{:<30} {:<16} {:<9} {}", "from", "event", "actor", "to");
    for rule in TRANSITIONS {
        println!("{:<30} {:<16} {:<9} {}", rule.from, rule.event, rule.actor, rule.to);
    }
}

fn rest_coordinator(
    config: &CoordinatorConfig,
    viewer: &str,
    access_token: Option<String>,
) -> Result<Coordinator> {
    let mut rest = config.rest_store_config();
    rest.access_token = access_token;
    let store = Arc::new(RestStore::new(rest)?);
    Ok(Coordinator::new(viewer, store.clone(), store).with_policy(config.bucket_policy()))
}

async fn follow(
    config: &CoordinatorConfig,
    viewer: &str,
    access_token: Option<String>,
) -> Result<()> {
    if !config.refetch_enabled {
        bail!("scheduled refetch is disabled; set SVCREQ_REFETCH_ENABLED=true");
    }
    let coordinator = rest_coordinator(config, viewer, access_token)?;
    print_summary(&coordinator.refresh().await.context("initial fetch")?);

    let mut sched = coordinator
        .build_refresh_scheduler(config)
        .await?
        .context("scheduler was not built")?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.refetch_cron, "following board");

    let mut changes = coordinator.changes();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                print_summary(&coordinator.board());
            }
        }
    }

    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

fn print_summary(board: &RequestBoard) {
    println!(
        "sent={} received={} active_jobs={}",
        board.sent.len(),
        board.received.len(),
        board.active_jobs.len()
    );
}

/// Client and provider coordinators over one in-memory store. Each watches the
/// table, so every step waits until the other side has seen the previous one.
async fn simulate(json: bool) -> Result<()> {
    let hub = RealtimeHub::new();
    let store = MemoryStore::new().with_realtime(hub.clone());
    let client = Coordinator::new("client-demo", Arc::new(store.clone()), Arc::new(store.clone()));
    let provider =
        Coordinator::new("provider-demo", Arc::new(store.clone()), Arc::new(store.clone()));
    client.refresh().await?;
    provider.refresh().await?;
    let _client_watch = client.watch_all(&hub).await?;
    let _provider_watch = provider.watch_all(&hub).await?;

    let created = client
        .create(NewServiceRequest {
            client_id: "client-demo".into(),
            provider_id: "provider-demo".into(),
            listing_id: "listing-demo".into(),
            message: Some("Bathroom tap is dripping".into()),
            preferred_date: Some(chrono::Utc::now().date_naive()),
            address_detail: Some("Apartment 8, entrance 2".into()),
            ..Default::default()
        })
        .await?;
    let id = created.id.clone();
    let mut steps = vec![("create", created)];

    converge(&provider, &id, RequestStatus::Pending).await?;
    steps.push(("propose_price", provider.propose_price(&id, 40_000, None).await?));
    converge(&client, &id, RequestStatus::PriceProposed).await?;
    steps.push(("confirm_price", client.confirm_price(&id).await?));
    converge(&provider, &id, RequestStatus::Accepted).await?;
    steps.push(("start_work", provider.start_work(&id).await?));
    steps.push((
        "submit_details",
        provider
            .submit_details(&id, "Replaced the cartridge", vec!["photos/demo-after.jpg".into()])
            .await?,
    ));
    converge(&client, &id, RequestStatus::AwaitingClientConfirmation).await?;
    steps.push(("confirm", client.confirm(&id, 5, Some("Fast and clean".into())).await?));
    converge(&provider, &id, RequestStatus::AwaitingPayment).await?;
    steps.push(("payment_complete", provider.payment_complete(&id).await?));
    converge(&client, &id, RequestStatus::Completed).await?;

    client.flush_notifications().await;
    provider.flush_notifications().await;
    let notifications = store.notifications().await;
    let client_board = client.board();

    if json {
        let report = serde_json::json!({
            "steps": steps
                .iter()
                .map(|(step, record)| serde_json::json!({"step": step, "record": record}))
                .collect::<Vec<_>>(),
            "notifications": notifications,
            "client_board": client_board,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for (step, record) in &steps {
        print_step(step, record);
    }
    for notification in &notifications {
        println!(
            "notify {:<14} {:?}: {}",
            notification.user_id, notification.kind, notification.title
        );
    }
    print_summary(&client_board);
    Ok(())
}

/// Waits for the realtime push that brings `id` to `status` in this coordinator's cache.
async fn converge(coordinator: &Coordinator, id: &str, status: RequestStatus) -> Result<()> {
    let mut changes = coordinator.changes();
    let wait = async {
        while coordinator.request(id).map(|r| r.status) != Some(status) {
            changes.changed().await?;
        }
        Ok::<_, anyhow::Error>(())
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .with_context(|| format!("{} never saw {id} reach {status}", coordinator.viewer_id()))?
}

fn print_step(step: &str, record: &ServiceRequest) {
    let price = record
        .proposed_price
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("{step:<17} -> {:<30} price={price}", record.status);
}

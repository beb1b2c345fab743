//! AquaScan command-line client
//!
//! Submits water-sample images to the detection service, follows jobs until
//! they finish, and browses past detections.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use aquascan_client::render::{self, RenderBoundary};
use aquascan_client::{Client, DetectionApi, ImageKind, ImageUpload, PollPhase, PollSnapshot};
use aquascan_common::models::DetectionJob;
use aquascan_common::{ClientConfig, Notification, NotificationLevel};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for aquascan
#[derive(Parser, Debug)]
#[command(name = "aquascan")]
#[command(about = "Client for the water-sample microorganism detection service")]
#[command(version)]
struct Args {
    /// Detection service base URL
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Configuration file (default: <config dir>/aquascan/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the service is reachable
    Health,
    /// Upload an image for asynchronous detection and follow the job
    Upload {
        image: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        /// Print the job id and exit instead of following the job
        #[arg(long)]
        no_watch: bool,
    },
    /// Run synchronous detection on an image
    Detect {
        image: PathBuf,
        /// Also e-mail the results to this address
        #[arg(long)]
        email: Option<String>,
    },
    /// Follow a job until it completes or fails
    Watch { id: String },
    /// List past detections
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long)]
        per_page: Option<u32>,
    },
    /// Delete a detection and show the page it was on
    Delete {
        id: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long)]
        per_page: Option<u32>,
    },
    /// Show aggregate statistics
    Stats,
    /// E-mail the results of a detection
    Email { id: String, email: String },
    /// Download the original or processed image of a detection
    Image {
        id: String,
        /// `original` or `processed`
        kind: ImageKind,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ClientConfig::resolve(args.api_url.as_deref(), args.config.as_deref())
        .context("Failed to load configuration")?;

    // Initialize tracing
    let default_filter = format!(
        "aquascan={0},aquascan_client={0},aquascan_common={0}",
        config.log_level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    debug!(api_url = %config.api_url, "Configuration resolved");

    let client = Client::new(config).context("Failed to set up the detection client")?;
    let printer = tokio::spawn(print_notifications(client.context().notifier().subscribe()));

    let result = run(args.command, client).await;

    // Every bus sender is gone once `run` returns; the printer drains and exits
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        debug!("Notification printer did not finish in time");
    }
    result
}

async fn run(command: Command, client: Client) -> Result<()> {
    let boundary = RenderBoundary::new(client.context().notifier().clone());
    let api = client.api.clone();

    match command {
        Command::Health => {
            let body = api.health().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Command::Upload {
            image,
            name,
            email,
            no_watch,
        } => {
            let upload = ImageUpload::from_path(&image).await?;
            let id = api.upload_image(upload, &name, &email).await?;
            println!("Submitted detection {id}");
            if !no_watch {
                watch(&client, &boundary, &id).await?;
            }
        }
        Command::Detect { image, email } => {
            let upload = ImageUpload::from_path(&image).await?;
            let outcome = api.detect(upload, email.as_deref()).await?;
            match DetectionJob::from_value(outcome.payload.clone()) {
                Ok(job) => println!("{}", boundary.render(|| render::render_job(&job, None))),
                Err(_) => println!("{}", serde_json::to_string_pretty(&outcome.payload)?),
            }
        }
        Command::Watch { id } => watch(&client, &boundary, &id).await?,
        Command::List { page, per_page } => {
            let mut fetcher = client.collection();
            let per_page = per_page.unwrap_or(fetcher.page_size());
            let page = fetcher.fetch_page(page, per_page).await?;
            println!("{}", boundary.render(|| render::render_page(&page)));
        }
        Command::Delete { id, page, per_page } => {
            let mut fetcher = client.collection();
            let per_page = per_page.unwrap_or(fetcher.page_size());
            fetcher.fetch_page(page, per_page).await?;
            let page = fetcher.delete(&id).await?;
            println!("{}", boundary.render(|| render::render_page(&page)));
        }
        Command::Stats => {
            let stats = api.statistics().await?;
            println!("{}", boundary.render(|| render::render_statistics(&stats)));
        }
        Command::Email { id, email } => {
            let message = api.send_results_email(&email, &id).await?;
            info!(id = %id, "Results e-mail requested");
            println!("{message}");
        }
        Command::Image { id, kind, output } => save_image(&api, &id, kind, output).await?,
    }
    Ok(())
}

/// Follow one job, printing each status change, until it settles or Ctrl+C
async fn watch(client: &Client, boundary: &RenderBoundary, id: &str) -> Result<()> {
    let session = client.poller.watch(id);
    let mut updates = session.subscribe();
    let mut last_line = String::new();

    loop {
        let snapshot: PollSnapshot = updates.borrow_and_update().clone();
        let line = render::poll_status_line(&snapshot);
        if line != last_line {
            eprintln!("{line}");
            last_line = line;
        }
        if snapshot.phase.is_final() {
            break;
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(id, "Interrupted, stopping poll session");
                session.destroy();
            }
        }
    }

    let snapshot = session.snapshot();
    session.destroy();
    if let (PollPhase::Abandoned, Some(err)) = (snapshot.phase, snapshot.last_error.clone()) {
        return Err(err).with_context(|| format!("Stopped watching detection {id}"));
    }
    if let Some(job) = snapshot.job.as_ref().filter(|job| job.is_terminal()) {
        println!("{}", boundary.render(|| render::render_job(job, Some(&snapshot))));
    }
    Ok(())
}

async fn save_image(
    api: &DetectionApi,
    id: &str,
    kind: ImageKind,
    output: Option<PathBuf>,
) -> Result<()> {
    let bytes = api.fetch_image(id, kind).await?;
    let path = output.unwrap_or_else(|| PathBuf::from(format!("detection_{id}_{kind}.png")));
    tokio::fs::write(&path, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Saved {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

async fn print_notifications(mut rx: broadcast::Receiver<Notification>) {
    loop {
        match rx.recv().await {
            Ok(notification) => {
                let tag = match notification.level {
                    NotificationLevel::Info => "info",
                    NotificationLevel::Success => "ok",
                    NotificationLevel::Error => "error",
                };
                eprintln!("[{tag}] {}", notification.message);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Notification printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

mod config;
mod error;

use clap::{Parser, Subcommand};
use config::{AppConfig, DEFAULT_CONFIG_PATH};
use error::AppError;
use photo_gallery::{
    format_file_size, BackgroundSync, ConditionsProvider, FixedConditions, ImageFile, NewPhoto,
    PhotoGalleryService, PhotoStore, PhotoSyncEngine, ProbedConditions, ProgressBus, SyncOptions,
    SyncResult, SyncStatus, UploadPhase, WebDavGateway,
};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "listing-photos", version, about = "Offline-first listing photo capture and sync")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a photo into the local gallery as pending upload
    Add {
        file: PathBuf,
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        product: Option<String>,
        #[arg(long, default_value = "general")]
        category: String,
    },
    /// Run one sync pass now
    Sync {
        /// Start even if another pass is running
        #[arg(long)]
        force: bool,
        #[arg(long)]
        wifi_only: bool,
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Reset failed photos and sync them again
    Retry,
    /// Show pending and failed counts and the last sync time
    Status,
    /// List a user's photos
    Gallery {
        #[arg(short, long)]
        user: String,
        #[arg(long)]
        json: bool,
    },
    /// Delete a photo
    Delete { id: Uuid },
    /// Delete a user's oldest photos beyond the configured cap
    Cleanup {
        #[arg(short, long)]
        user: String,
    },
    /// Keep syncing in the background until Ctrl-C
    Watch,
}

fn open_store(config: &AppConfig) -> Result<Arc<PhotoStore>, AppError> {
    Ok(Arc::new(PhotoStore::open(
        &config.database_path,
        config.store.clone(),
    )?))
}

fn build_engine(config: &AppConfig, store: Arc<PhotoStore>) -> Result<PhotoSyncEngine, AppError> {
    if !config.webdav.is_configured() {
        return Err(AppError::Config(
            "[webdav] server_url and username are required for syncing".to_string(),
        ));
    }
    let gateway = Arc::new(WebDavGateway::new(&config.webdav)?);

    let fixed: Arc<dyn ConditionsProvider> = Arc::new(FixedConditions::default());
    let conditions: Arc<dyn ConditionsProvider> = match &config.probe_url {
        Some(url) => Arc::new(ProbedConditions::new(fixed, url.clone())?),
        None => fixed,
    };

    let progress = ProgressBus::new();
    // Lives as long as the bus; the CLI never unsubscribes
    let _subscription = progress.subscribe(|event| match event.phase {
        UploadPhase::Complete => log::info!("Photo {} uploaded", event.record_id),
        UploadPhase::Error => log::warn!(
            "Photo {}: {}",
            event.record_id,
            event.error.as_deref().unwrap_or("upload failed")
        ),
        _ => log::debug!(
            "Photo {}: {:?} {}%",
            event.record_id,
            event.phase,
            event.progress_percent
        ),
    });

    Ok(PhotoSyncEngine::new(
        store,
        gateway,
        conditions,
        progress,
        config.sync.clone(),
    ))
}

fn print_result(result: &SyncResult) {
    println!(
        "Synced {} photos, {} failed",
        result.synced_count, result.failed_count
    );
    for error in &result.errors {
        println!("  {}: {}", error.record_id, error.error);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config = AppConfig::load(&cli.config)?;
    let store = open_store(&config)?;

    match cli.command {
        Command::Add {
            file,
            user,
            product,
            category,
        } => {
            let image = ImageFile::from_path(&file)?;
            let gallery = PhotoGalleryService::new(store, config.codec.clone());
            let photo = NewPhoto {
                owner_user_id: user,
                product_id: product,
                category,
                file: image,
            };
            let record = tokio::task::spawn_blocking(move || gallery.add_photo(photo))
                .await
                .map_err(|e| AppError::Other(format!("Image processing task failed: {}", e)))??;
            println!(
                "Added {} ({}x{}, {})",
                record.id,
                record.width,
                record.height,
                format_file_size(record.size)
            );
        }
        Command::Sync {
            force,
            wifi_only,
            max_retries,
        } => {
            let engine = build_engine(&config, store)?;
            let options = SyncOptions {
                force,
                wifi_only: wifi_only.then_some(true),
                max_retries,
            };
            print_result(&engine.start_sync(options).await?);
        }
        Command::Retry => {
            let engine = build_engine(&config, store)?;
            print_result(&engine.retry_failed_uploads(SyncOptions::default()).await?);
        }
        Command::Status => {
            // Read straight from the store so status works without a server configured
            let usage = store.estimate_usage()?;
            println!("Pending: {}", store.count_by_sync_status(SyncStatus::Pending)?);
            println!("Failed:  {}", store.count_by_sync_status(SyncStatus::Failed)?);
            match store.last_sync()? {
                Some(at) => println!("Last sync: {}", at.to_rfc3339()),
                None => println!("Last sync: never"),
            }
            println!(
                "Storage: {} of {} used",
                format_file_size(usage.used),
                format_file_size(usage.quota)
            );
        }
        Command::Gallery { user, json } => {
            let gallery = PhotoGalleryService::new(store, config.codec.clone());
            let summary = gallery.gallery_summary(&user)?;
            if json {
                let out = serde_json::to_string_pretty(&summary)
                    .map_err(|e| AppError::Other(e.to_string()))?;
                println!("{}", out);
            } else {
                for photo in &summary.photos {
                    println!(
                        "{}  {:<8} {:>10}  {}",
                        photo.id,
                        photo.sync_status,
                        format_file_size(photo.size),
                        photo.timestamp.format("%Y-%m-%d %H:%M")
                    );
                }
                println!(
                    "{} photos, {}, {} awaiting upload",
                    summary.photos.len(),
                    format_file_size(summary.total_size),
                    summary.sync_pending
                );
            }
        }
        Command::Delete { id } => {
            PhotoGalleryService::new(store, config.codec.clone()).delete_photo(&id)?;
            println!("Deleted {}", id);
        }
        Command::Cleanup { user } => {
            let deleted =
                PhotoGalleryService::new(store, config.codec.clone()).cleanup_old_photos(&user)?;
            println!("Deleted {} old photos", deleted);
        }
        Command::Watch => {
            let engine = Arc::new(build_engine(&config, store)?);
            let background = BackgroundSync::spawn(engine, config.sync.interval());
            tokio::signal::ctrl_c().await?;
            log::info!("Shutting down");
            background.stop().await;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        log::error!("{}", e);
        eprintln!("{}", e.user_message());
        std::process::exit(1);
    }
}

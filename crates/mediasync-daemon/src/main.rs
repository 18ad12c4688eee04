mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};

use mediasync_core::dispatcher::Dispatcher;
use mediasync_core::generator::watch_folder::WatchFolderPolicy;
use mediasync_core::generator::Generator;
use mediasync_core::local_fs::LocalFsHandler;
use mediasync_core::scanner::ScannerClient;
use mediasync_core::storage::{StorageHandler, StorageObject};
use mediasync_core::tracked_media::{InMemoryTrackedMediaIndex, TrackedMediaIndex};

use crate::config::DeviceSettingsFile;

fn default_worker_count() -> usize {
    num_cpus::get().max(1)
}

#[derive(Parser, Debug)]
#[command(name = "mediasyncd", about = "Media-file synchronisation daemon")]
struct DaemonArgs {
    /// Path to the TOML device settings file.
    #[arg(long, default_value = "mediasync.toml")]
    config: PathBuf,

    /// Number of concurrent workers. Defaults to the host's CPU count.
    #[arg(long, default_value_t = default_worker_count())]
    workers: usize,

    /// Path to the tracked-media index JSON side-car; omit for in-memory only.
    #[arg(long)]
    index_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = DaemonArgs::parse();

    let settings = DeviceSettingsFile::load(&args.config)
        .await
        .wrap_err_with(|| format!("failed to load {}", args.config.display()))?;

    let storages = build_storages(&settings);
    let index: Arc<dyn TrackedMediaIndex> = Arc::new(InMemoryTrackedMediaIndex::spawn(args.index_path.clone()));
    let scanner = Arc::new(ScannerClient::new(settings.media_scanner.clone().map(Into::into)));

    log::info!(
        "mediasyncd starting: {} storage(s), scanner {}",
        storages.len(),
        if scanner.is_enabled() { "enabled" } else { "disabled" }
    );

    let (mut generator, events) = Generator::new(storages, Arc::clone(&index), Arc::new(WatchFolderPolicy::new()));
    generator.init().await;

    let dispatcher = Dispatcher::new(args.workers, index, scanner);
    dispatcher.run(events).await;

    generator.destroy();
    Ok(())
}

fn build_storages(settings: &DeviceSettingsFile) -> Vec<StorageObject> {
    settings
        .storages
        .iter()
        .map(|(id, section)| {
            let handler: Arc<dyn StorageHandler> = Arc::new(LocalFsHandler::new(id.clone(), section.path.clone()));
            StorageObject {
                id: id.clone(),
                handler,
                watch_folder: section.watch_folder,
                watch_folder_target_id: section.watch_folder_target_id.clone(),
                options: section.options(),
            }
        })
        .collect()
}

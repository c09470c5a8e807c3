use std::process::ExitCode;

use log::{error, info};

use program_queuer::app::{cli, config::Config};
use program_queuer::manager::queue_manager::QueueManager;
use program_queuer::persistence::store::FileStore;
use program_queuer::worker::worker::spawn_worker_thread;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env();
    info!("Using settings file {}.", config.settings_path.display());

    let manager = QueueManager::new(
        Box::new(FileStore::new(&config.settings_path)),
        config.save_delay,
    );
    if let Err(e) = manager.load() {
        error!("Failed to load saved queue: {}", e);
    }
    let worker = spawn_worker_thread(manager.clone());

    let result = cli::run_cli(manager.clone());

    manager.shutdown();
    let _ = worker.join();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Terminal error: {}", e);
            ExitCode::FAILURE
        }
    }
}

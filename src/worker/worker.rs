use std::thread::{self, JoinHandle};

use log::{error, info};

use crate::manager::queue_manager::QueueManager;

/// Spawns the thread that applies process events (output chunks, exits)
/// to the queue, one at a time, until [`QueueManager::shutdown`] is called.
pub fn spawn_worker_thread(manager: QueueManager) -> JoinHandle<()> {
    let receiver = manager.messages();
    thread::spawn(move || loop {
        match receiver.recv() {
            Ok(message) => {
                if !manager.dispatch(message) {
                    info!("Queue worker stopped.");
                    break;
                }
            }
            Err(e) => {
                error!("Failed to receive message: {}", e);
                break;
            }
        }
    })
}

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config;
use crate::engine::CompiledConfig;

/// Watches the pipeline config file and hot-swaps a freshly compiled
/// `CompiledConfig` into `shared` on every change, so every `Engine`
/// sharing it (UDP/TCP/DoT/DoH front-ends) picks up the new pipeline on
/// their very next query.
pub fn spawn(path: PathBuf, shared: Arc<ArcSwap<CompiledConfig>>) {
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, shared) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(path: PathBuf, shared: Arc<ArcSwap<CompiledConfig>>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(_event) => {
                // Retries handle a write race (e.g. truncate-then-write)
                // racing the watch event.
                let mut retries = 3;
                while retries > 0 {
                    match config::load_config(&path).and_then(|cfg| CompiledConfig::compile(cfg)) {
                        Ok(new_cfg) => {
                            shared.store(Arc::new(new_cfg));
                            info!(target = "watcher", path = %path.display(), "config reloaded");
                            break;
                        }
                        Err(err) => {
                            retries -= 1;
                            if retries == 0 {
                                warn!(target = "watcher", path = %path.display(), error = %err, "config reload failed, keeping old config");
                            } else {
                                std::thread::sleep(std::time::Duration::from_millis(50));
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

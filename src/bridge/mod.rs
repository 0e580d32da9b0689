//! RTMP bridge: browser media chunks in, platform ingest out.

pub mod manager;
pub mod routes;
pub mod transcoder;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

pub use manager::{
    BridgeLimits, BridgeManager, RtmpTarget, StartRequest, StartedStream, StreamStatus, StreamSummary,
};
pub use transcoder::{EncoderSettings, Ffmpeg, Transcoder};

/// The bridge managers of every configured platform, keyed by the name
/// used in the route (`youtube`, `facebook`).
#[derive(Clone, Default)]
pub struct Bridges {
    managers: Arc<HashMap<String, Arc<BridgeManager>>>,
}

impl Bridges {
    pub fn new(managers: impl IntoIterator<Item = BridgeManager>) -> Self {
        let managers = managers
            .into_iter()
            .map(|manager| (manager.platform().to_string(), Arc::new(manager)))
            .collect();
        Bridges {
            managers: Arc::new(managers),
        }
    }

    pub fn get(&self, platform: &str) -> Option<Arc<BridgeManager>> {
        self.managers.get(platform).cloned()
    }

    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.managers.keys().map(String::as_str)
    }

    /// Largest chunk any platform accepts; bounds request bodies.
    pub fn max_chunk_bytes(&self) -> usize {
        self.managers
            .values()
            .map(|manager| manager.limits().max_chunk_bytes)
            .max()
            .unwrap_or(0)
    }

    pub fn spawn_reaper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let bridges = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for manager in bridges.managers.values() {
                    let reaped = manager.reap_exited();
                    if reaped > 0 {
                        debug!(platform = %manager.platform(), reaped, "stream reaper pass");
                    }
                }
            }
        })
    }

    pub async fn shutdown_all(&self) {
        for manager in self.managers.values() {
            manager.shutdown_all().await;
        }
    }
}

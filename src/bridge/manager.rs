//! Per-platform registry of transcoder processes.
//!
//! Each started stream owns one external encoder process. Chunks posted for
//! a stream go through a bounded queue to a single writer task, so they hit
//! the process input in arrival order and a slow encoder is reported as
//! backpressure instead of growing memory.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::transcoder::Transcoder;
use crate::error::BridgeError;
use crate::utils::{lock, stream_handle};

/// Ingest endpoint of a platform. The stream key is a secret: it is never
/// logged and `Debug` does not print it.
#[derive(Clone)]
pub struct RtmpTarget {
    base_url: String,
    stream_key: Option<String>,
}

impl RtmpTarget {
    pub fn new(base_url: impl Into<String>, stream_key: Option<String>) -> Self {
        RtmpTarget {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            stream_key: stream_key.filter(|key| !key.trim().is_empty()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.stream_key.is_some() && !self.base_url.is_empty()
    }

    fn destination(&self, platform: &str) -> Result<String, BridgeError> {
        match &self.stream_key {
            Some(key) if !self.base_url.is_empty() => Ok(format!("{}/{}", self.base_url, key.trim())),
            _ => Err(BridgeError::Config(format!(
                "{} RTMP URL or stream key is not configured",
                platform
            ))),
        }
    }
}

impl fmt::Debug for RtmpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtmpTarget")
            .field("configured", &self.is_configured())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct BridgeLimits {
    /// Chunks accepted but not yet written to the encoder, per stream.
    pub max_pending_chunks: usize,
    pub max_chunk_bytes: usize,
    /// How long `stop` waits for the writer to drain and again for the
    /// process to exit before killing it.
    pub stop_grace: Duration,
}

impl Default for BridgeLimits {
    fn default() -> Self {
        BridgeLimits {
            max_pending_chunks: 64,
            max_chunk_bytes: 8 * 1024 * 1024,
            stop_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Created,
    Streaming,
    Stopped,
    Exited,
}

impl StreamStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StreamStatus::Created,
            1 => StreamStatus::Streaming,
            2 => StreamStatus::Stopped,
            _ => StreamStatus::Exited,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, StreamStatus::Created | StreamStatus::Streaming)
    }
}

/// Optional metadata of a start request. Only the destination matters to
/// the bridge; the rest is recorded in the logs.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub privacy: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedStream {
    pub stream_id: String,
    pub destination_url: String,
    pub platform: String,
    pub created_at: DateTime<Utc>,
}

/// Operator view of a stream. Carries no destination.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub stream_id: String,
    pub platform: String,
    pub status: StreamStatus,
    pub created_at: DateTime<Utc>,
}

struct BridgeStream {
    handle: String,
    created_at: DateTime<Utc>,
    pid: Option<u32>,
    status: AtomicU8,
    input: Mutex<Option<mpsc::Sender<Bytes>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    exited: watch::Sender<bool>,
}

impl BridgeStream {
    fn status(&self) -> StreamStatus {
        StreamStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn push(&self, chunk: Bytes) -> Result<usize, BridgeError> {
        let input = lock(&self.input);
        let tx = match input.as_ref() {
            Some(tx) if self.status().is_active() => tx,
            _ => return Err(BridgeError::NotActive(self.handle.clone())),
        };

        let size = chunk.len();
        match tx.try_send(chunk) {
            Ok(()) => {
                let _ = self.status.compare_exchange(
                    StreamStatus::Created as u8,
                    StreamStatus::Streaming as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                Ok(size)
            }
            Err(TrySendError::Full(_)) => Err(BridgeError::Backpressure(self.handle.clone())),
            Err(TrySendError::Closed(_)) => Err(BridgeError::NotActive(self.handle.clone())),
        }
    }

    /// Move to `Stopped`. Returns false if a stop already happened.
    ///
    /// Holds the input lock so no chunk is queued once the swap is visible.
    fn begin_stop(&self) -> bool {
        let _input = lock(&self.input);
        let previous = self.status.swap(StreamStatus::Stopped as u8, Ordering::SeqCst);
        StreamStatus::from_u8(previous) != StreamStatus::Stopped
    }

    /// Record that the process is gone, unless it was stopped on purpose.
    fn mark_exited(&self) {
        let _ = self
            .status
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                match StreamStatus::from_u8(current) {
                    StreamStatus::Stopped | StreamStatus::Exited => None,
                    _ => Some(StreamStatus::Exited as u8),
                }
            });
        self.close_input();
    }

    /// Drop the queue sender so the writer drains what is queued and then
    /// closes the process input.
    fn close_input(&self) {
        lock(&self.input).take();
    }

    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    async fn wait_exit(&self, grace: Duration) -> bool {
        let mut exited = self.exited.subscribe();
        tokio::time::timeout(grace, exited.wait_for(|done| *done))
            .await
            .map_or(false, |changed| changed.is_ok())
    }

    #[cfg(unix)]
    fn interrupt(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else { return };
        if self.has_exited() {
            return;
        }
        if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            debug!(stream = %self.handle, "could not interrupt transcoder: {}", err);
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&self) {}

    fn force_kill(&self) {
        if let Some(kill) = lock(&self.kill).take() {
            let _ = kill.send(());
        }
    }

    fn summary(&self, platform: &str) -> StreamSummary {
        StreamSummary {
            stream_id: self.handle.clone(),
            platform: platform.to_string(),
            status: self.status(),
            created_at: self.created_at,
        }
    }
}

/// Writes queued chunks to the encoder, one at a time, in order.
async fn pump(stream: Arc<BridgeStream>, mut stdin: ChildStdin, mut chunks: mpsc::Receiver<Bytes>) {
    while let Some(chunk) = chunks.recv().await {
        if stream.status() == StreamStatus::Exited {
            break;
        }
        if let Err(err) = stdin.write_all(&chunk).await {
            warn!(stream = %stream.handle, "transcoder input closed: {}", err);
            stream.mark_exited();
            break;
        }
    }
    let _ = stdin.shutdown().await;
    debug!(stream = %stream.handle, "input writer finished");
}

/// Forwards encoder diagnostics to the log with the destination masked.
async fn log_stderr(handle: String, stderr: ChildStderr, destination: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.replace(&destination, "[destination]");
                debug!(stream = %handle, "transcoder: {}", line);
            }
            Ok(None) => break,
            Err(err) => {
                debug!(stream = %handle, "stopped reading transcoder output: {}", err);
                break;
            }
        }
    }
}

async fn monitor(stream: Arc<BridgeStream>, mut child: Child, mut kill: oneshot::Receiver<()>) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    match &status {
        Ok(status) if status.success() => info!(stream = %stream.handle, "transcoder exited"),
        Ok(status) => warn!(stream = %stream.handle, code = ?status.code(), "transcoder exited with error"),
        Err(err) => error!(stream = %stream.handle, "could not wait for transcoder: {}", err),
    }
    stream.mark_exited();
    stream.exited.send_replace(true);
}

pub struct BridgeManager {
    platform: String,
    prefix: String,
    target: RtmpTarget,
    transcoder: Arc<dyn Transcoder>,
    limits: BridgeLimits,
    streams: Mutex<HashMap<String, Arc<BridgeStream>>>,
}

impl BridgeManager {
    pub fn new(
        platform: impl Into<String>,
        prefix: impl Into<String>,
        target: RtmpTarget,
        transcoder: Arc<dyn Transcoder>,
        limits: BridgeLimits,
    ) -> Self {
        BridgeManager {
            platform: platform.into(),
            prefix: prefix.into(),
            target,
            transcoder,
            limits,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn limits(&self) -> &BridgeLimits {
        &self.limits
    }

    fn not_found(&self, handle: &str) -> BridgeError {
        BridgeError::NotFound {
            platform: self.platform.clone(),
            stream_id: handle.to_string(),
        }
    }

    /// Spawn an encoder pushing to this platform's ingest.
    pub fn start(&self, request: &StartRequest) -> Result<StartedStream, BridgeError> {
        let destination = self.target.destination(&self.platform)?;

        let mut command = self.transcoder.command(&destination);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(BridgeError::Spawn)?;

        let (Some(stdin), Some(stderr)) = (child.stdin.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            return Err(BridgeError::Spawn(io::Error::new(
                io::ErrorKind::Other,
                "transcoder pipes are not available",
            )));
        };

        let handle = stream_handle(&self.prefix);
        let (input, chunks) = mpsc::channel(self.limits.max_pending_chunks.max(1));
        let (kill, kill_rx) = oneshot::channel();
        let (exited, _) = watch::channel(false);
        let stream = Arc::new(BridgeStream {
            handle: handle.clone(),
            created_at: Utc::now(),
            pid: child.id(),
            status: AtomicU8::new(StreamStatus::Created as u8),
            input: Mutex::new(Some(input)),
            writer: Mutex::new(None),
            kill: Mutex::new(Some(kill)),
            exited,
        });

        let writer = tokio::spawn(pump(stream.clone(), stdin, chunks));
        *lock(&stream.writer) = Some(writer);
        tokio::spawn(log_stderr(handle.clone(), stderr, destination.clone()));
        tokio::spawn(monitor(stream.clone(), child, kill_rx));

        lock(&self.streams).insert(handle.clone(), stream.clone());
        info!(
            platform = %self.platform,
            stream = %handle,
            pid = ?stream.pid,
            title = ?request.title,
            privacy = ?request.privacy,
            "stream started"
        );

        Ok(StartedStream {
            stream_id: handle,
            destination_url: destination,
            platform: self.platform.clone(),
            created_at: stream.created_at,
        })
    }

    /// Queue a chunk for the encoder. Returns the number of bytes accepted.
    pub fn feed_chunk(&self, handle: &str, chunk: Bytes) -> Result<usize, BridgeError> {
        if chunk.len() > self.limits.max_chunk_bytes {
            return Err(BridgeError::ChunkTooLarge {
                size: chunk.len(),
                limit: self.limits.max_chunk_bytes,
            });
        }
        let stream = lock(&self.streams)
            .get(handle)
            .cloned()
            .ok_or_else(|| self.not_found(handle))?;

        let result = stream.push(chunk);
        if let Err(err @ BridgeError::Backpressure(_)) = &result {
            warn!(platform = %self.platform, stream = %handle, "{}", err);
        }
        result
    }

    /// Stop a stream: close the encoder input, interrupt the process and
    /// kill it if it does not exit within the grace period. A stopped
    /// handle stays registered as inactive until the reaper drops it.
    pub async fn stop(&self, handle: &str) -> Result<(), BridgeError> {
        let stream = {
            let streams = lock(&self.streams);
            match streams.get(handle) {
                Some(stream) if stream.begin_stop() => stream.clone(),
                _ => return Err(self.not_found(handle)),
            }
        };
        info!(platform = %self.platform, stream = %handle, "stopping stream");

        stream.close_input();
        let writer = lock(&stream.writer).take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(self.limits.stop_grace, &mut writer).await.is_err() {
                warn!(stream = %handle, "input writer did not drain in time");
                writer.abort();
            }
        }

        stream.interrupt();
        if !stream.wait_exit(self.limits.stop_grace).await {
            warn!(stream = %handle, "transcoder ignored interrupt, killing it");
            stream.force_kill();
            stream.wait_exit(self.limits.stop_grace).await;
        }
        Ok(())
    }

    pub fn status(&self, handle: &str) -> Option<StreamStatus> {
        lock(&self.streams).get(handle).map(|stream| stream.status())
    }

    pub fn list(&self) -> Vec<StreamSummary> {
        let mut streams: Vec<_> = lock(&self.streams)
            .values()
            .map(|stream| stream.summary(&self.platform))
            .collect();
        streams.sort_by_key(|summary| summary.created_at);
        streams
    }

    pub fn active_count(&self) -> usize {
        lock(&self.streams)
            .values()
            .filter(|stream| stream.status().is_active())
            .count()
    }

    /// Forget stopped and exited streams.
    pub fn reap_exited(&self) -> usize {
        let mut streams = lock(&self.streams);
        let before = streams.len();
        streams.retain(|handle, stream| {
            let keep = stream.status().is_active();
            if !keep {
                stream.close_input();
                debug!(platform = %self.platform, stream = %handle, "reaped stream");
            }
            keep
        });
        before - streams.len()
    }

    /// Stop every active stream, e.g. on shutdown.
    pub async fn shutdown_all(&self) {
        let handles: Vec<String> = lock(&self.streams)
            .iter()
            .filter(|(_, stream)| stream.status().is_active())
            .map(|(handle, _)| handle.clone())
            .collect();

        let stops = handles.iter().map(|handle| self.stop(handle));
        for result in futures_util::future::join_all(stops).await {
            if let Err(err) = result {
                debug!(platform = %self.platform, "shutdown: {}", err);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::process::Command;

    /// Stand-in encoder: a shell script, with the destination ignored.
    struct Script(&'static str);

    impl Transcoder for Script {
        fn command(&self, _destination: &str) -> Command {
            let mut command = Command::new("sh");
            command.arg("-c").arg(self.0);
            command
        }
    }

    fn manager(script: &'static str, limits: BridgeLimits) -> BridgeManager {
        BridgeManager::new(
            "youtube",
            "yt",
            RtmpTarget::new("rtmp://x/", Some("key".into())),
            Arc::new(Script(script)),
            limits,
        )
    }

    fn quick() -> BridgeLimits {
        BridgeLimits {
            stop_grace: Duration::from_millis(500),
            ..Default::default()
        }
    }

    async fn wait_for_status(manager: &BridgeManager, handle: &str, status: StreamStatus) {
        for _ in 0..100 {
            if manager.status(handle) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("stream never reached {:?}", status);
    }

    #[tokio::test]
    async fn start_feed_stop_then_feed_fails() {
        let manager = manager("cat > /dev/null", quick());
        let started = manager.start(&StartRequest::default()).unwrap();

        assert!(started.stream_id.starts_with("yt-"));
        assert_eq!(started.destination_url, "rtmp://x/key");
        assert_eq!(started.platform, "youtube");

        assert_eq!(manager.feed_chunk(&started.stream_id, Bytes::from_static(b"chunk1")).unwrap(), 6);
        assert_eq!(manager.status(&started.stream_id), Some(StreamStatus::Streaming));

        manager.stop(&started.stream_id).await.unwrap();
        let err = manager
            .feed_chunk(&started.stream_id, Bytes::from_static(b"chunk2"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotActive(_)));
        assert!(err.to_string().contains("not active"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_while_feeding_rejects_every_later_chunk() {
        let manager = Arc::new(manager("cat > /dev/null", quick()));
        let handle = manager.start(&StartRequest::default()).unwrap().stream_id;

        let feeder = {
            let manager = Arc::clone(&manager);
            let handle = handle.clone();
            tokio::spawn(async move {
                let (mut accepted, mut rejected) = (0usize, 0usize);
                while rejected < 50 {
                    match manager.feed_chunk(&handle, Bytes::from_static(b"chunk")) {
                        Ok(_) => {
                            assert_eq!(rejected, 0, "chunk accepted after the stream stopped");
                            accepted += 1;
                        }
                        Err(BridgeError::NotActive(_)) => rejected += 1,
                        Err(BridgeError::Backpressure(_)) => {}
                        Err(err) => panic!("unexpected error: {}", err),
                    }
                    tokio::task::yield_now().await;
                }
                accepted
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.stop(&handle).await.unwrap();
        let accepted = feeder.await.unwrap();

        assert!(accepted > 0);
        assert_eq!(manager.status(&handle), Some(StreamStatus::Stopped));
        assert!(matches!(
            manager.feed_chunk(&handle, Bytes::from_static(b"late")),
            Err(BridgeError::NotActive(_))
        ));
    }

    #[tokio::test]
    async fn second_stop_is_not_found() {
        let manager = manager("cat > /dev/null", quick());
        let started = manager.start(&StartRequest::default()).unwrap();

        let (first, second) = tokio::join!(manager.stop(&started.stream_id), manager.stop(&started.stream_id));
        assert_eq!(
            [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(),
            1
        );
        assert!(matches!(
            manager.stop(&started.stream_id).await,
            Err(BridgeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn process_exit_rejects_further_chunks() {
        let manager = manager("exit 3", quick());
        let started = manager.start(&StartRequest::default()).unwrap();

        wait_for_status(&manager, &started.stream_id, StreamStatus::Exited).await;
        assert!(matches!(
            manager.feed_chunk(&started.stream_id, Bytes::from_static(b"late")),
            Err(BridgeError::NotActive(_))
        ));

        assert_eq!(manager.reap_exited(), 1);
        assert!(matches!(
            manager.feed_chunk(&started.stream_id, Bytes::from_static(b"late")),
            Err(BridgeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn full_queue_is_reported_as_backpressure() {
        let limits = BridgeLimits {
            max_pending_chunks: 1,
            ..quick()
        };
        // never reads its input, so the pipe fills up
        let manager = manager("sleep 5", limits);
        let started = manager.start(&StartRequest::default()).unwrap();

        let chunk = Bytes::from(vec![0u8; 256 * 1024]);
        let mut saw_backpressure = false;
        for _ in 0..16 {
            match manager.feed_chunk(&started.stream_id, chunk.clone()) {
                Ok(_) => {}
                Err(BridgeError::Backpressure(_)) => {
                    saw_backpressure = true;
                    break;
                }
                Err(err) => panic!("unexpected error: {}", err),
            }
        }
        assert!(saw_backpressure);
        manager.stop(&started.stream_id).await.unwrap();
    }

    #[tokio::test]
    async fn oversized_chunk_is_rejected() {
        let limits = BridgeLimits {
            max_chunk_bytes: 4,
            ..quick()
        };
        let manager = manager("cat > /dev/null", limits);
        let started = manager.start(&StartRequest::default()).unwrap();

        assert!(matches!(
            manager.feed_chunk(&started.stream_id, Bytes::from_static(b"too big")),
            Err(BridgeError::ChunkTooLarge { size: 7, limit: 4 })
        ));
        manager.shutdown_all().await;
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn missing_stream_key_fails_without_spawning() {
        let manager = BridgeManager::new(
            "facebook",
            "fb",
            RtmpTarget::new("rtmps://fb", None),
            Arc::new(Script("exit 0")),
            quick(),
        );
        assert!(matches!(
            manager.start(&StartRequest::default()),
            Err(BridgeError::Config(_))
        ));
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn unknown_handle_is_not_found() {
        let manager = manager("cat > /dev/null", quick());
        assert!(matches!(
            manager.feed_chunk("yt-nope", Bytes::from_static(b"x")),
            Err(BridgeError::NotFound { .. })
        ));
    }

    #[test]
    fn target_debug_hides_the_key() {
        let target = RtmpTarget::new("rtmp://a.rtmp.youtube.com/live2/", Some("secret".into()));
        assert_eq!(target.destination("youtube").unwrap(), "rtmp://a.rtmp.youtube.com/live2/secret");
        assert!(!format!("{:?}", target).contains("secret"));
    }
}

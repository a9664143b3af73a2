//! Collecting browser downloads into a job-scoped directory.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use super::session::{DownloadEvent, DownloadFeed, InFlightDownloads};

/// Suffixes Chrome and Firefox use while a download is still in flight.
const IN_FLIGHT_SUFFIXES: &[&str] = &[".crdownload", ".part", ".tmp"];

/// A downloaded file that was saved into the job directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadArtifact {
    pub path: PathBuf,
    pub suggested_name: String,
    pub size: u64,
    /// True iff the file exists and is non-empty after saving.
    pub validated: bool,
}

/// Persists download events into one directory and keeps the ones that
/// validate. Downloads are one-shot, so a failed save is dropped, never
/// retried.
#[derive(Debug)]
pub struct DownloadCollector {
    dir: PathBuf,
    artifacts: Vec<DownloadArtifact>,
    dropped: usize,
}

impl DownloadCollector {
    pub async fn create(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            artifacts: Vec::new(),
            dropped: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifacts(&self) -> &[DownloadArtifact] {
        &self.artifacts
    }

    pub fn into_artifacts(self) -> Vec<DownloadArtifact> {
        self.artifacts
    }

    /// Number of events that did not produce a valid artifact.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Save one download and validate it. Returns the artifact when valid.
    pub async fn record(&mut self, event: DownloadEvent) -> Option<&DownloadArtifact> {
        let Some(name) = safe_file_name(&event.suggested_name) else {
            warn!(suggested = %event.suggested_name, "download has no usable file name, dropping");
            self.dropped += 1;
            return None;
        };
        let dest = self.dir.join(&name);

        if let Err(err) = persist(&event.source, &dest).await {
            warn!(file = %dest.display(), error = %err, "failed to save download, dropping");
            self.dropped += 1;
            return None;
        }

        let size = match tokio::fs::metadata(&dest).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) | Err(_) => {
                warn!(file = %dest.display(), "download missing after save, dropping");
                self.dropped += 1;
                return None;
            }
        };
        if size == 0 {
            warn!(file = %dest.display(), "download is empty, dropping");
            // Keep empty files out of the directory the uploader will read.
            if let Err(err) = tokio::fs::remove_file(&dest).await {
                warn!(file = %dest.display(), error = %err, "failed to remove empty download");
            }
            self.dropped += 1;
            return None;
        }

        info!(file = %dest.display(), size, "download validated");
        self.artifacts.push(DownloadArtifact {
            path: dest,
            suggested_name: event.suggested_name,
            size,
            validated: true,
        });
        self.artifacts.last()
    }

    /// Record events until the stream closes or stays quiet for `quiet`
    /// with nothing in flight. Downloads still in flight keep the drain
    /// going, up to `max_wait` in total. Returns the number of events handled.
    pub async fn drain(&mut self, feed: &mut DownloadFeed, quiet: Duration, max_wait: Duration) -> usize {
        let deadline = Instant::now() + max_wait;
        let mut handled = 0;
        loop {
            match timeout(quiet, feed.events.recv()).await {
                Ok(Some(event)) => {
                    handled += 1;
                    self.record(event).await;
                }
                Ok(None) => {
                    debug!("download stream closed");
                    break;
                }
                Err(_) => {
                    let pending = feed.in_flight.count();
                    if pending == 0 {
                        debug!(quiet_ms = quiet.as_millis() as u64, "no downloads within quiet period");
                        break;
                    }
                    if Instant::now() >= deadline {
                        warn!(
                            pending,
                            max_wait_ms = max_wait.as_millis() as u64,
                            "downloads still in flight at the wait limit, leaving them behind"
                        );
                        break;
                    }
                    debug!(pending, "downloads still in flight, waiting");
                }
            }
        }
        handled
    }
}

/// Strip any directory components from a browser-suggested name.
fn safe_file_name(suggested: &str) -> Option<String> {
    let name = Path::new(suggested).file_name()?.to_str()?.trim();
    (!name.is_empty() && name != "." && name != "..").then(|| name.to_string())
}

/// Move the file into place, copying when a rename crosses filesystems.
async fn persist(source: &Path, dest: &Path) -> io::Result<()> {
    if tokio::fs::rename(source, dest).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(source, dest).await?;
    if let Err(err) = tokio::fs::remove_file(source).await {
        debug!(file = %source.display(), error = %err, "could not remove staged download");
    }
    Ok(())
}

fn in_flight(name: &str) -> bool {
    IN_FLIGHT_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) || name.starts_with('.')
}

/// Poll a browser download directory and emit an event for every file
/// whose size held still across two polls. Files still being written are
/// counted in `in_flight`. Stops once the receiver is gone.
pub fn spawn_staging_watcher(
    staging: PathBuf,
    events: mpsc::Sender<DownloadEvent>,
    in_flight: InFlightDownloads,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sizes: HashMap<String, u64> = HashMap::new();
        let mut emitted: HashSet<String> = HashSet::new();

        while !events.is_closed() {
            sleep(interval).await;

            let mut entries = match tokio::fs::read_dir(&staging).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(dir = %staging.display(), error = %err, "cannot read download staging directory");
                    continue;
                }
            };

            let mut pending = 0;
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                if emitted.contains(&name) {
                    continue;
                }
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if !meta.is_file() {
                    continue;
                }
                if self::in_flight(&name) {
                    pending += 1;
                    continue;
                }

                let size = meta.len();
                if sizes.insert(name.clone(), size) != Some(size) {
                    // Not settled yet.
                    pending += 1;
                    continue;
                }
                let event = DownloadEvent {
                    suggested_name: name.clone(),
                    source: entry.path(),
                };
                if events.send(event).await.is_err() {
                    return;
                }
                debug!(file = %name, size, "download finished");
                emitted.insert(name);
            }
            in_flight.set(pending);
        }
    })
}

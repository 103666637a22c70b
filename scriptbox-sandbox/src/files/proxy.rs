//! Per-execution proxy state: memoized bytes plus the two read paths.
//!
//! All fetches run on the I/O runtime handle captured when the pool was
//! configured, never on the interpreter thread. That is what makes the
//! blocking path safe: the interpreter thread parks on a channel while the
//! fetch makes progress elsewhere, and it wakes every `poll_interval` to check
//! whether the execution was interrupted. A cancelled execution therefore
//! never stays stuck inside `readContents()`.

use super::{serialize_contents, ContentMode, FileFetcher};
use crate::error::FetchError;
use crate::runtime::ExecutionControl;
use bytes::Bytes;
use std::future::Future;
use std::sync::mpsc::{sync_channel, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::OnceCell;

/// One file reference as seen by the running script
pub struct FileProxyEntry {
    location: String,
    contents: Arc<OnceCell<Bytes>>,
}

impl FileProxyEntry {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            contents: Arc::new(OnceCell::new()),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Bytes already fetched in this execution, if any
    pub fn cached(&self) -> Option<&Bytes> {
        self.contents.get()
    }
}

/// The file proxies of one execution, indexed by proxy id
pub struct FileProxies {
    entries: Vec<FileProxyEntry>,
    fetcher: Arc<dyn FileFetcher>,
    io: Handle,
    poll_interval: Duration,
    control: ExecutionControl,
}

impl FileProxies {
    pub fn new(
        locations: impl IntoIterator<Item = String>,
        fetcher: Arc<dyn FileFetcher>,
        io: Handle,
        poll_interval: Duration,
        control: ExecutionControl,
    ) -> Self {
        Self {
            entries: locations.into_iter().map(FileProxyEntry::new).collect(),
            fetcher,
            io,
            poll_interval,
            control,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, id: usize) -> Option<&FileProxyEntry> {
        self.entries.get(id)
    }

    /// Non-blocking read used by `readContentsAsync(mode)`
    pub async fn read_async(&self, id: usize, mode: ContentMode) -> Result<String, FetchError> {
        let entry = self.require(id)?;
        if let Some(bytes) = entry.cached() {
            return Ok(serialize_contents(bytes, mode));
        }

        let bytes = self
            .io
            .spawn(fetch_once(entry, Arc::clone(&self.fetcher)))
            .await
            .map_err(|_| FetchError::Dropped {
                location: entry.location.clone(),
            })??;
        Ok(serialize_contents(&bytes, mode))
    }

    /// Blocking read used by `readContents(mode)`.
    ///
    /// Must be called from the interpreter thread, never from a task running on
    /// the I/O runtime itself.
    pub fn read_blocking(&self, id: usize, mode: ContentMode) -> Result<String, FetchError> {
        let entry = self.require(id)?;
        if let Some(bytes) = entry.cached() {
            return Ok(serialize_contents(bytes, mode));
        }

        let (tx, rx) = sync_channel(1);
        let fetch = fetch_once(entry, Arc::clone(&self.fetcher));
        self.io.spawn(async move {
            let _ = tx.send(fetch.await);
        });

        loop {
            match rx.recv_timeout(self.poll_interval) {
                Ok(result) => return result.map(|bytes| serialize_contents(&bytes, mode)),
                Err(RecvTimeoutError::Timeout) => {
                    if self.control.is_interrupted() {
                        tracing::debug!(location = %entry.location, "Blocking read interrupted");
                        return Err(FetchError::Interrupted {
                            location: entry.location.clone(),
                        });
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(FetchError::Dropped {
                        location: entry.location.clone(),
                    })
                }
            }
        }
    }

    fn require(&self, id: usize) -> Result<&FileProxyEntry, FetchError> {
        self.entries.get(id).ok_or_else(|| FetchError::InvalidLocation {
            location: format!("#{}", id),
            reason: "unknown file proxy".to_string(),
        })
    }
}

/// Fetch through the entry's memo cell; concurrent callers share one fetch and
/// a failed fetch leaves the cell empty so a later read can retry.
fn fetch_once(
    entry: &FileProxyEntry,
    fetcher: Arc<dyn FileFetcher>,
) -> impl Future<Output = Result<Bytes, FetchError>> + Send + 'static {
    let cell = Arc::clone(&entry.contents);
    let location = entry.location.clone();
    async move {
        cell.get_or_try_init(|| fetcher.fetch(&location))
            .await
            .cloned()
    }
}

//! Append-only file of RESP encoded commands.
//!
//! Every mutating command is appended in its wire form, and the whole file is replayed through
//! the frame decoder at startup to rebuild in-memory state. Durability is bounded by the fsync
//! policy: with [`FsyncPolicy::EverySec`] a crash loses at most the last interval of writes.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use thiserror::Error as ThisError;
use tokio::runtime::{self, Handle};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::frame::{self, Frame};

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("append only file is closed")]
    Closed,
    #[error("corrupt record at offset {offset}: {source}")]
    Decode {
        offset: u64,
        #[source]
        source: frame::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// The file ends in the middle of a record, usually because the process died during a
    /// write. Everything before `offset` is intact.
    pub fn is_truncation(&self) -> bool {
        matches!(
            self,
            Error::Decode {
                source: frame::Error::Incomplete,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// When appended records are flushed to stable storage, after Redis' `appendfsync`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum FsyncPolicy {
    /// After every append, before it returns.
    Always,
    /// From a background task, once per `fsync_interval`.
    #[value(name = "everysec")]
    EverySec,
    /// Never explicitly; the OS decides.
    No,
}

#[derive(Clone, Debug)]
pub struct AofConfig {
    pub fsync: FsyncPolicy,
    pub fsync_interval: Duration,
}

impl Default for AofConfig {
    fn default() -> Self {
        Self {
            fsync: FsyncPolicy::EverySec,
            fsync_interval: Duration::from_secs(1),
        }
    }
}

/// Handle to an open append-only file.
///
/// All file access (appends, replay, syncs and close) is serialized through one mutex, so
/// concurrent appends never interleave their bytes. Share it between tasks with an `Arc`.
pub struct Aof {
    inner: Arc<Inner>,
    config: AofConfig,
    cancel: CancellationToken,
    flusher: Mutex<Option<Flusher>>,
}

/// Where the periodic fsync runs: on the caller's runtime when there is one, otherwise on a
/// dedicated thread.
enum Flusher {
    Task(JoinHandle<()>),
    Thread(thread::JoinHandle<()>),
}

struct Inner {
    path: PathBuf,
    // `None` once closed.
    file: Mutex<Option<File>>,
}

impl Aof {
    /// Opens the file at `path` with the default config.
    pub fn open(path: impl AsRef<Path>) -> Result<Aof> {
        Self::open_with(path, AofConfig::default())
    }

    pub fn open_with(path: impl AsRef<Path>, config: AofConfig) -> Result<Aof> {
        let path = path.as_ref().to_path_buf();

        // Existing content is kept. Opening in append mode makes every write land at the end of
        // the file, wherever a replay left the cursor.
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        info!(path = %path.display(), fsync = ?config.fsync, "opened append only file");

        let inner = Arc::new(Inner {
            path,
            file: Mutex::new(Some(file)),
        });
        let cancel = CancellationToken::new();

        let flusher = match config.fsync {
            FsyncPolicy::EverySec => Some(spawn_flusher(
                inner.clone(),
                config.fsync_interval,
                cancel.clone(),
            )?),
            FsyncPolicy::Always | FsyncPolicy::No => None,
        };

        Ok(Aof {
            inner,
            config,
            cancel,
            flusher: Mutex::new(flusher),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Writes the encoded `frame` at the end of the file.
    ///
    /// A failed write may leave part of the record behind. Replay reports such a tail as a
    /// truncation rather than misreading it.
    pub fn append(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.serialize();

        let mut file = self.inner.lock();
        let file = file.as_mut().ok_or(Error::Closed)?;
        file.write_all(&bytes)?;

        if self.config.fsync == FsyncPolicy::Always {
            file.sync_data()?;
        }

        Ok(())
    }

    /// Decodes the file from its first byte, calling `f` once per record in write order.
    /// Returns the number of records replayed.
    ///
    /// Stops at the first record that fails to decode, after delivering every record before it.
    /// The file is left as is; dropping a torn tail is up to the caller, see [`Aof::truncate`].
    pub fn replay<F>(&self, mut f: F) -> Result<u64>
    where
        F: FnMut(Frame),
    {
        let mut file = self.inner.lock();
        let file = file.as_mut().ok_or(Error::Closed)?;

        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);
        let mut replayed = 0;

        loop {
            let offset = reader.stream_position()?;
            match Frame::decode(&mut reader) {
                Ok(frame) => {
                    f(frame);
                    replayed += 1;
                }
                Err(frame::Error::EndOfStream) => break,
                Err(frame::Error::Io(err)) => return Err(Error::Io(err)),
                Err(source) => {
                    warn!(offset, error = %source, "replay stopped at a bad record");
                    return Err(Error::Decode { offset, source });
                }
            }
        }

        debug!(records = replayed, "replayed append only file");
        Ok(replayed)
    }

    /// Flushes written records to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    /// Cuts the file down to `len` bytes, e.g. to the offset of a torn record.
    pub fn truncate(&self, len: u64) -> Result<()> {
        let mut file = self.inner.lock();
        let file = file.as_mut().ok_or(Error::Closed)?;

        file.set_len(len)?;
        file.sync_all()?;

        warn!(path = %self.inner.path.display(), len, "truncated append only file");
        Ok(())
    }

    /// Stops the periodic fsync, flushes outstanding writes and closes the file. Every later
    /// call, including another `close`, fails with [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        self.cancel.cancel();

        // A task is left to notice the cancellation on its own, a thread is joined.
        if let Some(Flusher::Thread(handle)) = self.take_flusher() {
            if handle.join().is_err() {
                error!("fsync thread panicked");
            }
        }

        let file = self.inner.lock().take().ok_or(Error::Closed)?;
        file.sync_all()?;

        info!(path = %self.inner.path.display(), "closed append only file");
        Ok(())
    }

    /// Like [`Aof::close`], also waiting for the fsync task to finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();

        let joined = match self.take_flusher() {
            Some(Flusher::Task(handle)) => handle.await,
            Some(Flusher::Thread(handle)) => {
                tokio::task::spawn_blocking(move || {
                    if handle.join().is_err() {
                        error!("fsync thread panicked");
                    }
                })
                .await
            }
            None => Ok(()),
        };
        if let Err(err) = joined {
            error!(error = %err, "fsync task failed");
        }

        self.close()
    }

    /// Replays the file and, if it ends in a torn record, cuts it off. Returns the offset the
    /// file was truncated at, or `None` when every record decoded. Corruption before the tail is
    /// still an error and leaves the file untouched.
    pub fn repair(&self) -> Result<Option<u64>> {
        match self.replay(|_| {}) {
            Ok(_) => Ok(None),
            Err(Error::Decode {
                offset,
                source: frame::Error::Incomplete,
            }) => {
                self.truncate(offset)?;
                Ok(Some(offset))
            }
            Err(err) => Err(err),
        }
    }

    fn take_flusher(&self) -> Option<Flusher> {
        self.flusher.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl Drop for Aof {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        // A panic while holding the lock can at worst leave a torn record, which replay
        // already detects.
        self.file.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sync(&self) -> Result<()> {
        let file = self.lock();
        file.as_ref().ok_or(Error::Closed)?.sync_all()?;
        Ok(())
    }
}

fn spawn_flusher(
    inner: Arc<Inner>,
    period: Duration,
    cancel: CancellationToken,
) -> Result<Flusher> {
    if let Ok(handle) = Handle::try_current() {
        let task = handle.spawn(flush_periodically(inner, period, cancel));
        return Ok(Flusher::Task(task));
    }

    // No runtime to borrow, e.g. the log is opened from a plain thread. Drive the same loop on a
    // small runtime of our own.
    let rt = runtime::Builder::new_current_thread().enable_time().build()?;
    let thread = thread::Builder::new()
        .name("aof-fsync".to_string())
        .spawn(move || rt.block_on(flush_periodically(inner, period, cancel)))?;

    Ok(Flusher::Thread(thread))
}

async fn flush_periodically(inner: Arc<Inner>, period: Duration, cancel: CancellationToken) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        // fsync blocks, keep it off the async workers.
        let inner = inner.clone();
        match tokio::task::spawn_blocking(move || inner.sync()).await {
            Ok(Ok(())) => {}
            Ok(Err(Error::Closed)) => break,
            Ok(Err(err)) => error!(error = %err, "failed to fsync append only file"),
            Err(err) => error!(error = %err, "fsync task panicked"),
        }
    }

    debug!("stopped periodic fsync");
}

//! Streaming of daemon log files.
use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader, Seek, SeekFrom},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    time::Duration,
};

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

/// Why [`follow`] stopped without an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEnd {
    /// The caller asked to stop.
    Cancelled,
    /// The file was deleted.
    Removed,
    /// Another file now lives at the path (rotation).
    Replaced,
}

/// Follows `path` from its first byte, handing every complete line to `on_line`.
///
/// At end of file the follower sleeps until the file system reports a change in the
/// file's directory, or at most `poll`. A truncated file is read again from the start,
/// while a deleted or replaced file ends the stream. `keep_going` is consulted before
/// every read so a watcher can be retired without touching the file.
pub fn follow<F, L>(
    path: &Path,
    poll: Duration,
    mut keep_going: F,
    mut on_line: L,
) -> io::Result<LogEnd>
where
    F: FnMut() -> bool,
    L: FnMut(&str),
{
    let file = File::open(path)?;
    let inode = file.metadata()?.ino();
    let mut reader = BufReader::new(file);
    let mut position: u64 = 0;
    let mut line = Vec::new();

    let (tx, events) = mpsc::channel();
    // Without a watcher the follower degrades to waking up every `poll`.
    let _watcher = match watch_directory(path, tx.clone()) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!("Cannot watch {:?} for changes, polling instead: {err}", path);
            None
        }
    };
    let target = watched_path(path);

    loop {
        if !keep_going() {
            return Ok(LogEnd::Cancelled);
        }

        let read = reader.read_until(b'\n', &mut line)?;
        if read > 0 {
            position += read as u64;
            if line.ends_with(b"\n") {
                let text = String::from_utf8_lossy(&line);
                on_line(text.trim_end_matches(['\n', '\r']));
                line.clear();
            }
            continue;
        }

        match fs::metadata(path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(LogEnd::Removed),
            Err(err) => return Err(err),
            Ok(meta) if meta.ino() != inode => return Ok(LogEnd::Replaced),
            Ok(meta) if meta.len() < position => {
                debug!("Log file {:?} was truncated; reading from the start", path);
                reader.seek(SeekFrom::Start(0))?;
                position = 0;
                line.clear();
                continue;
            }
            Ok(_) => {}
        }

        wait_for_change(&events, &target, poll)?;
    }
}

/// Watches the directory holding `path`, so removal and rename are reported as well as
/// writes.
fn watch_directory(
    path: &Path,
    tx: mpsc::Sender<notify::Result<Event>>,
) -> io::Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(tx, Config::default()).map_err(io::Error::other)?;
    watcher
        .watch(&parent_dir(path)?, RecursiveMode::NonRecursive)
        .map_err(io::Error::other)?;
    Ok(watcher)
}

fn parent_dir(path: &Path) -> io::Result<PathBuf> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::canonicalize(parent),
        _ => fs::canonicalize("."),
    }
}

/// The path events for `path` are reported under.
fn watched_path(path: &Path) -> PathBuf {
    match (parent_dir(path), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}

/// Blocks until an event touches `target` or `poll` elapsed.
fn wait_for_change(
    events: &Receiver<notify::Result<Event>>,
    target: &Path,
    poll: Duration,
) -> io::Result<()> {
    loop {
        match events.recv_timeout(poll) {
            Ok(Ok(event)) if event.paths.iter().any(|changed| changed == target) => {
                // Collapse a burst of writes into one read pass.
                for queued in events.try_iter() {
                    queued.map_err(io::Error::other)?;
                }
                return Ok(());
            }
            Ok(Ok(_)) => continue,
            Ok(Err(err)) => return Err(io::Error::other(err)),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

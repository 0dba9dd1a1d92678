use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::Result;

/// Advisory, file-scoped lock held by one process per symbol
///
/// The marker file `.lock_{symbol}` holds `pid|epoch_seconds`. Acquisition
/// never blocks; a marker older than the stale window is treated as
/// abandoned and reclaimed. A marker without readable contents is aged by
/// its modification time instead. The marker is removed on drop only while
/// it still carries this holder's contents.
#[derive(Debug)]
pub struct SymbolLock {
    path: PathBuf,
    symbol: String,
    marker: String,
}

/// Parsed marker contents
#[derive(Debug, Clone, Copy, PartialEq)]
struct Holder {
    pid: u32,
    acquired_at: f64,
}

impl Holder {
    fn parse(content: &str) -> Option<Self> {
        let (pid, acquired_at) = content.trim().split_once('|')?;
        Some(Self {
            pid: pid.parse().ok()?,
            acquired_at: acquired_at.parse().ok()?,
        })
    }
}

fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Seconds since the marker was last written; zero for a future mtime
fn modified_age(path: &Path) -> Result<f64> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .map_or(0.0, |age| age.as_secs_f64()))
}

fn read_marker(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl SymbolLock {
    /// Try to take the lock for `symbol`
    ///
    /// Returns `Ok(None)` when another live holder has it.
    pub fn acquire(dir: &Path, symbol: &str, stale_after: Duration) -> Result<Option<Self>> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(".lock_{}", symbol));

        if let Some(marker) = Self::try_create(&path)? {
            return Ok(Some(Self::held(path, symbol, marker)));
        }

        let Some(content) = read_marker(&path)? else {
            // Released between our attempt and the read
            return Ok(Self::try_create(&path)?.map(|marker| Self::held(path, symbol, marker)));
        };
        let stale_secs = stale_after.as_secs_f64();

        match Holder::parse(&content) {
            Some(holder) if now_secs() - holder.acquired_at <= stale_secs => {
                tracing::debug!(
                    "Lock for {} held by pid {} since {:.0}",
                    symbol,
                    holder.pid,
                    holder.acquired_at
                );
                return Ok(None);
            }
            Some(holder) => {
                tracing::warn!(
                    "Reclaiming stale lock for {} (pid {}, {:.0}s old)",
                    symbol,
                    holder.pid,
                    now_secs() - holder.acquired_at
                );
            }
            None => {
                // Empty while a holder is still writing it, or garbage
                let age = match modified_age(&path) {
                    Ok(age) => age,
                    Err(crate::Error::Io(e)) if e.kind() == ErrorKind::NotFound => {
                        return Ok(Self::try_create(&path)?.map(|marker| Self::held(path, symbol, marker)));
                    }
                    Err(e) => return Err(e),
                };
                if age <= stale_secs {
                    tracing::debug!("Lock for {} has no readable holder yet ({:.0}s old)", symbol, age);
                    return Ok(None);
                }
                tracing::warn!("Reclaiming unreadable lock for {} ({:.0}s old)", symbol, age);
            }
        }

        // Only remove the marker we judged stale, not a fresh one that replaced it
        if read_marker(&path)?.as_deref() == Some(content.as_str()) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        // Another process may have reclaimed it first
        Ok(Self::try_create(&path)?.map(|marker| Self::held(path, symbol, marker)))
    }

    fn held(path: PathBuf, symbol: &str, marker: String) -> Self {
        tracing::debug!("Acquired lock for {}", symbol);
        Self {
            path,
            symbol: symbol.to_string(),
            marker,
        }
    }

    /// Atomically create the marker; `None` if it already exists
    fn try_create(path: &Path) -> Result<Option<String>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let marker = format!("{}|{}", std::process::id(), now_secs());
                file.write_all(marker.as_bytes())?;
                Ok(Some(marker))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for SymbolLock {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(content) if content == self.marker => {}
            Ok(_) => {
                tracing::warn!("Lock for {} was reclaimed by another holder", self.symbol);
                return;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!("Failed to read lock for {}: {}", self.symbol, e);
                return;
            }
        }

        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Released lock for {}", self.symbol),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to release lock for {}: {}", self.symbol, e),
        }
    }
}

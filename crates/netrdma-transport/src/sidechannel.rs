//! Out-of-band channel used to exchange [`ConnectionInfo`] records.
//!
//! A channel has two slots. Each slot is an info payload plus a readiness
//! signal; the payload is always in place before the signal is asserted, and
//! the signal is withdrawn before the payload is removed.
//!
//! [`ConnectionInfo`]: crate::wire::ConnectionInfo

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::RdmaConfig;

/// Content of a ready file.
pub const READY_MARKER: &[u8] = b"1";
/// Suffix appended to the offer paths to name the answer slot.
pub const ANSWER_SUFFIX: &str = "answer";

/// One direction of the rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Listener to connector.
    Offer,
    /// Connector to listener.
    Answer,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Offer => write!(f, "offer"),
            Slot::Answer => write!(f, "answer"),
        }
    }
}

/// Transport for the rendezvous.
pub trait SideChannel: Send + Sync {
    /// Withdraws the slot's readiness signal, then its payload. A slot that is
    /// already empty is not an error.
    fn retract(&self, slot: Slot) -> io::Result<()>;
    /// Stores `bytes` in the slot and then asserts its readiness signal.
    fn publish(&self, slot: Slot, bytes: &[u8]) -> io::Result<()>;
    /// Whether the readiness signal is asserted.
    fn is_ready(&self, slot: Slot) -> io::Result<bool>;
    /// The slot's payload, or `None` if nothing is stored.
    fn read(&self, slot: Slot) -> io::Result<Option<Vec<u8>>>;
}

/// File pair per slot on a filesystem both processes can see.
#[derive(Debug, Clone)]
pub struct FileSideChannel {
    info_file: PathBuf,
    ready_file: PathBuf,
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl FileSideChannel {
    /// Offer slot at the given paths; the answer slot sits beside them.
    pub fn new(info_file: impl Into<PathBuf>, ready_file: impl Into<PathBuf>) -> Self {
        Self {
            info_file: info_file.into(),
            ready_file: ready_file.into(),
        }
    }

    /// Uses `info_file` and `ready_file` from `config`.
    pub fn from_config(config: &RdmaConfig) -> Self {
        Self::new(config.info_file.clone(), config.ready_file.clone())
    }

    /// `(info, ready)` paths of a slot.
    pub fn paths(&self, slot: Slot) -> (PathBuf, PathBuf) {
        match slot {
            Slot::Offer => (self.info_file.clone(), self.ready_file.clone()),
            Slot::Answer => (
                with_suffix(&self.info_file, ANSWER_SUFFIX),
                with_suffix(&self.ready_file, ANSWER_SUFFIX),
            ),
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Writes to a unique sibling temp file, syncs it, and renames it over
/// `path` so readers see either the old content or the new, never a mix.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = dir.join(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    {
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(bytes)?;
        tmp_file.sync_all()?;
    }
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        e
    })
}

impl SideChannel for FileSideChannel {
    fn retract(&self, slot: Slot) -> io::Result<()> {
        let (info, ready) = self.paths(slot);
        remove_if_present(&ready)?;
        remove_if_present(&info)?;
        debug!(%slot, path = %info.display(), "retracted side-channel slot");
        Ok(())
    }

    fn publish(&self, slot: Slot, bytes: &[u8]) -> io::Result<()> {
        let (info, ready) = self.paths(slot);
        write_atomic(&info, bytes)?;
        write_atomic(&ready, READY_MARKER)?;
        debug!(%slot, path = %info.display(), len = bytes.len(), "published side-channel slot");
        Ok(())
    }

    fn is_ready(&self, slot: Slot) -> io::Result<bool> {
        let (_, ready) = self.paths(slot);
        match fs::metadata(&ready) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read(&self, slot: Slot) -> io::Result<Option<Vec<u8>>> {
        let (info, _) = self.paths(slot);
        match fs::read(&info) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Default)]
struct MemorySlot {
    payload: Option<Vec<u8>>,
    ready: bool,
}

/// In-process side channel. Clones share the same slots.
#[derive(Debug, Clone, Default)]
pub struct MemorySideChannel {
    slots: Arc<Mutex<HashMap<Slot, MemorySlot>>>,
}

impl MemorySideChannel {
    /// Empty slots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a payload and asserts readiness in one step, bypassing
    /// encoding. Lets tests plant arbitrary bytes.
    pub fn plant(&self, slot: Slot, bytes: Vec<u8>) {
        let mut slots = self.slots.lock();
        let entry = slots.entry(slot).or_default();
        entry.payload = Some(bytes);
        entry.ready = true;
    }
}

impl SideChannel for MemorySideChannel {
    fn retract(&self, slot: Slot) -> io::Result<()> {
        self.slots.lock().remove(&slot);
        Ok(())
    }

    fn publish(&self, slot: Slot, bytes: &[u8]) -> io::Result<()> {
        self.plant(slot, bytes.to_vec());
        Ok(())
    }

    fn is_ready(&self, slot: Slot) -> io::Result<bool> {
        Ok(self.slots.lock().get(&slot).map(|s| s.ready).unwrap_or(false))
    }

    fn read(&self, slot: Slot) -> io::Result<Option<Vec<u8>>> {
        Ok(self
            .slots
            .lock()
            .get(&slot)
            .and_then(|s| s.payload.clone()))
    }
}

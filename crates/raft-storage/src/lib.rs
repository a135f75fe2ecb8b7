//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: written by raft-node's peer before any reply leaves, read once at boot
//! what: Storage trait, FileStorage implementation, InMemoryStorage for testing
//!
//! the store knows nothing about raft. it holds two opaque blobs, the encoded
//! persistent state and a snapshot slot that stays empty while compaction is
//! not implemented, and replaces them together.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

/// trait for durable storage of raft state
///
/// every call must be synchronous: when `save` returns `Ok`, a crash
/// afterwards must not lose the pair it stored.
pub trait Storage: Send + Sync {
    /// atomically replace the stored state and snapshot blobs
    fn save(&self, state: &[u8], snapshot: &[u8]) -> io::Result<()>;

    /// load the stored (state, snapshot) pair; both are empty if nothing was saved
    fn read(&self) -> io::Result<(Vec<u8>, Vec<u8>)>;

    /// size in bytes of the stored state blob
    fn state_size(&self) -> io::Result<usize>;

    /// clear all persisted state (for testing)
    fn clear(&self) -> io::Result<()>;
}

// -- file storage implementation --

const STATE_FILE: &str = "raft_state.bin";
const TEMP_FILE: &str = "raft_state.tmp";

/// width of the state-length prefix at the start of the file
const LEN_PREFIX: usize = 8;

/// file-based storage implementation using std::fs
///
/// stores both blobs in `raft_state.bin`:
/// - 8 bytes: big-endian length of the state blob
/// - the state blob
/// - the snapshot blob, up to end of file
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
    /// serializes writers so two saves never race on the temp file
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// get the path to the state file
    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// read the whole file; a missing file is an empty store
    fn read_file(&self) -> io::Result<Vec<u8>> {
        match File::open(self.state_path()) {
            Ok(mut file) => {
                let mut contents = Vec::new();
                file.read_to_end(&mut contents)?;
                Ok(contents)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

/// split a stored file back into (state, snapshot)
fn split_pair(mut contents: Vec<u8>) -> io::Result<(Vec<u8>, Vec<u8>)> {
    if contents.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }
    if contents.len() < LEN_PREFIX {
        return Err(invalid_data(format!(
            "state file is {} bytes, shorter than its length prefix",
            contents.len()
        )));
    }
    let mut prefix = [0u8; LEN_PREFIX];
    prefix.copy_from_slice(&contents[..LEN_PREFIX]);
    let state_len = usize::try_from(u64::from_be_bytes(prefix))
        .map_err(|_| invalid_data("state length does not fit in memory".into()))?;

    let body = contents.len() - LEN_PREFIX;
    if state_len > body {
        return Err(invalid_data(format!(
            "state file truncated: header claims {state_len} bytes, {body} present"
        )));
    }
    let snapshot = contents.split_off(LEN_PREFIX + state_len);
    contents.drain(..LEN_PREFIX);
    Ok((contents, snapshot))
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl Storage for FileStorage {
    fn save(&self, state: &[u8], snapshot: &[u8]) -> io::Result<()> {
        let _guard = self.write_lock.lock();

        // atomic write: write to temp file then rename
        let temp_path = self.dir.join(TEMP_FILE);
        let mut file = File::create(&temp_path)?;
        file.write_all(&(state.len() as u64).to_be_bytes())?;
        file.write_all(state)?;
        file.write_all(snapshot)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;

        // make the rename itself durable where the platform allows it
        #[cfg(unix)]
        File::open(&self.dir)?.sync_all()?;

        Ok(())
    }

    fn read(&self) -> io::Result<(Vec<u8>, Vec<u8>)> {
        split_pair(self.read_file()?)
    }

    fn state_size(&self) -> io::Result<usize> {
        Ok(self.read()?.0.len())
    }

    fn clear(&self) -> io::Result<()> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(self.state_path()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

// -- in-memory storage implementation --

#[derive(Debug, Default, Clone)]
struct Blobs {
    state: Vec<u8>,
    snapshot: Vec<u8>,
}

/// in-memory storage for testing
///
/// clones share the same blobs, so a peer rebuilt on a clone sees exactly
/// what its predecessor saved. `deep_copy` forks an independent store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorage {
    blobs: Arc<Mutex<Blobs>>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// an independent store holding a copy of the current blobs
    pub fn deep_copy(&self) -> Self {
        let blobs = self.blobs.lock().clone();
        Self {
            blobs: Arc::new(Mutex::new(blobs)),
        }
    }
}

impl Storage for InMemoryStorage {
    fn save(&self, state: &[u8], snapshot: &[u8]) -> io::Result<()> {
        let mut blobs = self.blobs.lock();
        blobs.state = state.to_vec();
        blobs.snapshot = snapshot.to_vec();
        Ok(())
    }

    fn read(&self) -> io::Result<(Vec<u8>, Vec<u8>)> {
        let blobs = self.blobs.lock();
        Ok((blobs.state.clone(), blobs.snapshot.clone()))
    }

    fn state_size(&self) -> io::Result<usize> {
        Ok(self.blobs.lock().state.len())
    }

    fn clear(&self) -> io::Result<()> {
        *self.blobs.lock() = Blobs::default();
        Ok(())
    }
}

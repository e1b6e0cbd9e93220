//! Control-volume store.
//!
//! The authoritative cluster configuration lives on a small replicated
//! volume that every node's daemon reads and writes. The engine never
//! inspects the store's layout; it only uses the contract below: open
//! (writable opening is the cluster-wide mutual-exclusion point, since
//! the control volume is a single-writer replicated device), a stored
//! content digest for cheap change detection, load, save, close.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error};

use flock_model::digest::content_digest;
use flock_model::{ClusterState, FlockError, FlockResult};

/// Store file magic ("FLOCKCV1").
const CTRLVOL_MAGIC: [u8; 8] = *b"FLOCKCV1";
/// Header: magic + digest + payload length.
const HEADER_LEN: usize = 24;

/// Contract of the control-volume store.
#[async_trait]
pub trait ControlVolume: Send + Sync {
    /// Open the store. Opening writable acquires exclusive access and
    /// fails while another opener holds it.
    async fn open(&self, writable: bool) -> FlockResult<()>;

    /// Digest of the currently stored configuration.
    async fn stored_hash(&self) -> FlockResult<u64>;

    /// Load the stored configuration.
    async fn load(&self) -> FlockResult<ClusterState>;

    /// Persist `state`, returning the digest of the stored form.
    async fn save(&self, state: &ClusterState) -> FlockResult<u64>;

    /// Release the store handle. Must be safe to call after errors.
    async fn close(&self);
}

/// File-backed store on the control device.
///
/// `open` really opens the device and keeps the descriptor until
/// `close`: a device that refuses a writable open (a replicated volume
/// whose local replica is not the writer, say) fails the cycle before
/// any action runs, not at `save`.
pub struct FileCtrlVol {
    path: PathBuf,
    handle: Mutex<Option<OpenHandle>>,
}

struct OpenHandle {
    /// None only for a read-only open of a not-yet-created store, which
    /// reads as a blank control volume.
    file: Option<File>,
    writable: bool,
}

impl FileCtrlVol {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            handle: Mutex::new(None),
        }
    }

    async fn read_raw(&self, file: &mut File) -> FlockResult<Option<(u64, Vec<u8>)>> {
        file.seek(SeekFrom::Start(0)).await.map_err(|e| {
            error!("failed to seek control volume {}: {}", self.path.display(), e);
            FlockError::Io
        })?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await.map_err(|e| {
            error!("failed to read control volume {}: {}", self.path.display(), e);
            FlockError::Io
        })?;
        if data.is_empty() {
            return Ok(None);
        }
        if data.len() < HEADER_LEN || data[..8] != CTRLVOL_MAGIC {
            error!("control volume {} has no valid header", self.path.display());
            return Err(FlockError::CtrlVolCorrupt);
        }
        let digest = u64::from_le_bytes(data[8..16].try_into().unwrap_or_default());
        let len = u64::from_le_bytes(data[16..24].try_into().unwrap_or_default()) as usize;
        if data.len() < HEADER_LEN + len {
            error!("control volume {} is truncated", self.path.display());
            return Err(FlockError::CtrlVolCorrupt);
        }
        let payload = data[HEADER_LEN..HEADER_LEN + len].to_vec();
        if content_digest(&payload) != digest {
            error!("control volume {} digest mismatch", self.path.display());
            return Err(FlockError::CtrlVolCorrupt);
        }
        Ok(Some((digest, payload)))
    }
}

#[async_trait]
impl ControlVolume for FileCtrlVol {
    async fn open(&self, writable: bool) -> FlockResult<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Err(FlockError::Io);
        }
        let opened = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .open(&self.path)
            .await;
        let file = match opened {
            Ok(file) => Some(file),
            // A store nobody has written yet reads as blank
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !writable => None,
            Err(e) => {
                error!(
                    "cannot open control volume {} ({}): {}",
                    self.path.display(),
                    if writable { "rw" } else { "ro" },
                    e
                );
                return Err(FlockError::Io);
            }
        };
        *handle = Some(OpenHandle { file, writable });
        debug!(
            "opened control volume {} ({})",
            self.path.display(),
            if writable { "rw" } else { "ro" }
        );
        Ok(())
    }

    async fn stored_hash(&self) -> FlockResult<u64> {
        let mut handle = self.handle.lock().await;
        let open = handle.as_mut().ok_or(FlockError::CtrlVolClosed)?;
        match open.file.as_mut() {
            None => Ok(0),
            Some(file) => Ok(self
                .read_raw(file)
                .await?
                .map(|(digest, _)| digest)
                .unwrap_or(0)),
        }
    }

    async fn load(&self) -> FlockResult<ClusterState> {
        let mut handle = self.handle.lock().await;
        let open = handle.as_mut().ok_or(FlockError::CtrlVolClosed)?;
        let raw = match open.file.as_mut() {
            None => None,
            Some(file) => self.read_raw(file).await?,
        };
        match raw {
            // A blank control volume is an empty cluster, not an error
            None => Ok(ClusterState::new()),
            Some((_, payload)) => bincode::deserialize(&payload).map_err(|e| {
                error!("corrupt control volume payload: {}", e);
                FlockError::CtrlVolCorrupt
            }),
        }
    }

    async fn save(&self, state: &ClusterState) -> FlockResult<u64> {
        let mut handle = self.handle.lock().await;
        let open = handle.as_mut().ok_or(FlockError::CtrlVolClosed)?;
        if !open.writable {
            return Err(FlockError::CtrlVolReadOnly);
        }
        let file = open.file.as_mut().ok_or(FlockError::CtrlVolClosed)?;
        let payload = bincode::serialize(state).map_err(|e| {
            error!("failed to serialize cluster state: {}", e);
            FlockError::Io
        })?;
        let digest = content_digest(&payload);
        let mut data = Vec::with_capacity(HEADER_LEN + payload.len());
        data.extend_from_slice(&CTRLVOL_MAGIC);
        data.extend_from_slice(&digest.to_le_bytes());
        data.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        data.extend_from_slice(&payload);
        let written = async {
            file.seek(SeekFrom::Start(0)).await?;
            file.write_all(&data).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            error!("failed to write control volume {}: {}", self.path.display(), e);
            return Err(FlockError::Io);
        }
        debug!("saved cluster state, serial {}", state.serial());
        Ok(digest)
    }

    async fn close(&self) {
        *self.handle.lock().await = None;
    }
}

/// In-memory store used by the engine tests.
#[cfg(test)]
pub struct MemCtrlVol {
    inner: Mutex<MemInner>,
}

#[cfg(test)]
struct MemInner {
    payload: Option<Vec<u8>>,
    digest: u64,
    open: Option<bool>,
}

#[cfg(test)]
impl MemCtrlVol {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemInner {
                payload: None,
                digest: 0,
                open: None,
            }),
        }
    }

    /// Seed the store with a state, as if a peer had written it.
    pub async fn prime(&self, state: &ClusterState) {
        let payload = bincode::serialize(state).unwrap();
        let mut inner = self.inner.lock().await;
        inner.digest = content_digest(&payload);
        inner.payload = Some(payload);
    }
}

#[cfg(test)]
#[async_trait]
impl ControlVolume for MemCtrlVol {
    async fn open(&self, writable: bool) -> FlockResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.open.is_some() {
            return Err(FlockError::Io);
        }
        inner.open = Some(writable);
        Ok(())
    }

    async fn stored_hash(&self) -> FlockResult<u64> {
        let inner = self.inner.lock().await;
        if inner.open.is_none() {
            return Err(FlockError::CtrlVolClosed);
        }
        Ok(inner.digest)
    }

    async fn load(&self) -> FlockResult<ClusterState> {
        let inner = self.inner.lock().await;
        if inner.open.is_none() {
            return Err(FlockError::CtrlVolClosed);
        }
        match &inner.payload {
            None => Ok(ClusterState::new()),
            Some(payload) => {
                bincode::deserialize(payload).map_err(|_| FlockError::CtrlVolCorrupt)
            }
        }
    }

    async fn save(&self, state: &ClusterState) -> FlockResult<u64> {
        let mut inner = self.inner.lock().await;
        match inner.open {
            None => return Err(FlockError::CtrlVolClosed),
            Some(false) => return Err(FlockError::CtrlVolReadOnly),
            Some(true) => {}
        }
        let payload = bincode::serialize(state).map_err(|_| FlockError::Io)?;
        inner.digest = content_digest(&payload);
        inner.payload = Some(payload);
        Ok(inner.digest)
    }

    async fn close(&self) {
        self.inner.lock().await.open = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_model::node::AddressFamily;
    use flock_model::SerialGen;

    fn sample_state() -> ClusterState {
        let mut serial = SerialGen::default();
        let mut state = ClusterState::new();
        state
            .create_node("n1", "10.0.0.1", AddressFamily::Ipv4, 0, &mut serial)
            .unwrap();
        state.set_serial(serial.peek());
        state
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCtrlVol::new(dir.path().join("ctrlvol"));
        let state = sample_state();

        store.open(true).await.unwrap();
        let digest = store.save(&state).await.unwrap();
        assert_eq!(store.stored_hash().await.unwrap(), digest);
        let loaded = store.load().await.unwrap();
        store.close().await;
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCtrlVol::new(dir.path().join("ctrlvol"));
        store.open(false).await.unwrap();
        assert_eq!(store.stored_hash().await.unwrap(), 0);
        assert_eq!(store.load().await.unwrap(), ClusterState::new());
        store.close().await;
    }

    #[tokio::test]
    async fn test_save_requires_writable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCtrlVol::new(dir.path().join("ctrlvol"));
        store.open(false).await.unwrap();
        assert_eq!(
            store.save(&sample_state()).await,
            Err(FlockError::CtrlVolReadOnly)
        );
        store.close().await;
        assert_eq!(
            store.save(&sample_state()).await,
            Err(FlockError::CtrlVolClosed)
        );
    }

    #[tokio::test]
    async fn test_digest_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCtrlVol::new(dir.path().join("ctrlvol"));
        let mut state = sample_state();

        store.open(true).await.unwrap();
        let d1 = store.save(&state).await.unwrap();
        state.set_serial(state.serial() + 1);
        let d2 = store.save(&state).await.unwrap();
        store.close().await;
        assert_ne!(d1, d2);
    }

    #[tokio::test]
    async fn test_corrupt_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctrlvol");
        let store = FileCtrlVol::new(path.clone());

        store.open(true).await.unwrap();
        store.save(&sample_state()).await.unwrap();
        store.close().await;

        // Flip one payload byte
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&path, &data).unwrap();

        store.open(false).await.unwrap();
        assert_eq!(store.load().await, Err(FlockError::CtrlVolCorrupt));
        store.close().await;
    }

    #[tokio::test]
    async fn test_open_acquires_device() {
        // A path that cannot be opened must fail at open(), before the
        // engine runs any actions against a store it cannot write back
        let store = FileCtrlVol::new(PathBuf::from("/nonexistent-dir/ctrlvol"));
        assert_eq!(store.open(true).await, Err(FlockError::Io));
        assert_eq!(store.load().await, Err(FlockError::CtrlVolClosed));
    }

    #[tokio::test]
    async fn test_writes_go_through_held_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctrlvol");
        let store = FileCtrlVol::new(path.clone());

        store.open(true).await.unwrap();
        assert!(path.exists());
        store.save(&sample_state()).await.unwrap();

        // Replacing the file behind the handle must not affect the
        // already-open store, which keeps its own descriptor
        std::fs::remove_file(&path).unwrap();
        let loaded = store.load().await.unwrap();
        store.close().await;
        assert_eq!(loaded, sample_state());
    }

    #[tokio::test]
    async fn test_double_open_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCtrlVol::new(dir.path().join("ctrlvol"));
        store.open(true).await.unwrap();
        assert!(store.open(false).await.is_err());
        store.close().await;
        assert!(store.open(false).await.is_ok());
        store.close().await;
    }
}

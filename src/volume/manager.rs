//! Volume orchestration: fetch, materialize, mount, describe, destroy.
//!
//! ```text
//! create(volume)
//!   ├─ producer.produce(volume)          network, cancellable
//!   └─ spawn_blocking
//!        ├─ create_dir(root/id)          exclusive: AlreadyExists → Conflict
//!        ├─ mounter.mount(volume)
//!        ├─ entries → files              exclusive create, implicit parents
//!        ├─ merged secrets file          optional
//!        ├─ metadata file                written last
//!        └─ bundle.close()               always
//! ```
//!
//! Failures after the directory exists are not rolled back. Such a volume
//! has no metadata file, so it is reported by [`VolumeManager::is_complete`],
//! fails `get` with a decode error, is skipped by `list` and can still be
//! destroyed.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{IdLocks, Mounter, OsFs, VolumeError, VolumeFs};
use crate::secrets::{Merger, ProducerRegistry, SecretBundle, SecretsError};
use crate::types::Volume;

pub const DEFAULT_METADATA_FILE: &str = ".meta";
pub const DEFAULT_DIR_MODE: u32 = 0o700;
pub const DEFAULT_FILE_MODE: u32 = 0o600;

const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// Creates, destroys, describes and lists secret volumes.
///
/// Operations on the same id are serialized in-process, until their
/// filesystem work ends even if the caller stopped waiting. Operations on
/// different ids run concurrently.
#[derive(Clone)]
pub struct VolumeManager {
    mounter: Arc<dyn Mounter>,
    producers: ProducerRegistry,
    fs: Arc<dyn VolumeFs>,
    metadata_file: String,
    merged_secrets_file: Option<String>,
    dir_mode: u32,
    file_mode: u32,
    locks: IdLocks,
}

impl VolumeManager {
    pub fn new(mounter: Arc<dyn Mounter>, producers: ProducerRegistry) -> Self {
        Self {
            mounter,
            producers,
            fs: Arc::new(OsFs),
            metadata_file: DEFAULT_METADATA_FILE.to_string(),
            merged_secrets_file: None,
            dir_mode: DEFAULT_DIR_MODE,
            file_mode: DEFAULT_FILE_MODE,
            locks: IdLocks::new(),
        }
    }

    pub fn with_filesystem(mut self, fs: Arc<dyn VolumeFs>) -> Self {
        self.fs = fs;
        self
    }

    /// Name of the metadata file at the root of each volume.
    pub fn with_metadata_file(mut self, name: impl Into<String>) -> Self {
        self.metadata_file = name.into();
        self
    }

    /// Also write every secret, merged into one JSON object, to `name` at the
    /// root of each volume.
    pub fn with_merged_secrets_file(mut self, name: impl Into<String>) -> Self {
        self.merged_secrets_file = Some(name.into());
        self
    }

    pub fn with_dir_mode(mut self, mode: u32) -> Self {
        self.dir_mode = mode;
        self
    }

    pub fn with_file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    pub fn metadata_file(&self) -> &str {
        &self.metadata_file
    }

    pub fn root(&self) -> &Path {
        self.mounter.root()
    }

    /// Directory of the volume with the given id. It need not exist.
    pub fn path(&self, id: &str) -> PathBuf {
        self.mounter.path(id)
    }

    /// Fetch a volume's secrets and materialize them. Returns the stored
    /// volume, which never carries the credential.
    pub async fn create(&self, volume: Volume) -> Result<Volume, VolumeError> {
        validate_id(&volume.id)?;
        let guard = self.locks.lock(&volume.id).await;

        // Advisory: avoids a fetch for an obvious conflict. The exclusive
        // create_dir below is what decides.
        if self.fs.exists(&self.path(&volume.id)) {
            return Err(VolumeError::AlreadyExists(volume.id));
        }
        let producer = self
            .producers
            .get(volume.source)
            .ok_or(VolumeError::UnhandledSource(volume.source))?;

        let bundle = producer.produce(&volume).await?;
        let stored = volume.without_credential();
        drop(volume);

        // The guard moves into the blocking task: it must outlive the work
        // even when the caller stops waiting.
        self.blocking(move |manager| {
            let _guard = guard;
            let mut bundle = bundle;
            let result = manager.materialize(&stored, bundle.as_mut());
            bundle.close();
            result.map(|()| stored)
        })
        .await
    }

    /// Unmount a volume and remove its directory.
    pub async fn destroy(&self, id: &str) -> Result<(), VolumeError> {
        validate_id(id)?;
        let guard = self.locks.lock(id).await;
        let id = id.to_string();
        self.blocking(move |manager| {
            let _guard = guard;
            let path = manager.path(&id);
            if !manager.fs.is_dir(&path) {
                return Err(VolumeError::NotFound(id));
            }
            manager
                .mounter
                .unmount(&id)
                .map_err(|source| VolumeError::io("unmount", &path, source))?;
            manager
                .fs
                .remove_dir_all(&path)
                .map_err(|source| VolumeError::io("remove volume directory", &path, source))?;
            info!(id = %id, path = %path.display(), "destroyed volume");
            Ok(())
        })
        .await
    }

    /// Describe a volume from its metadata file.
    pub async fn get(&self, id: &str) -> Result<Volume, VolumeError> {
        validate_id(id)?;
        let guard = self.locks.lock(id).await;
        let id = id.to_string();
        self.blocking(move |manager| {
            let _guard = guard;
            if !manager.fs.is_dir(&manager.path(&id)) {
                return Err(VolumeError::NotFound(id));
            }
            manager.read_metadata(&id)
        })
        .await
    }

    /// Whether a volume was fully created. Volumes whose creation failed
    /// part-way are present but incomplete.
    pub async fn is_complete(&self, id: &str) -> Result<bool, VolumeError> {
        validate_id(id)?;
        let guard = self.locks.lock(id).await;
        let id = id.to_string();
        self.blocking(move |manager| {
            let _guard = guard;
            if !manager.fs.is_dir(&manager.path(&id)) {
                return Err(VolumeError::NotFound(id));
            }
            Ok(manager.read_metadata(&id).is_ok())
        })
        .await
    }

    /// Every volume with readable metadata, sorted by id. Volumes that cannot
    /// be described are logged and left out.
    pub async fn list(&self) -> Result<Vec<Volume>, VolumeError> {
        self.blocking(|manager| {
            let root = manager.root();
            if !manager.fs.is_dir(root) {
                return Err(VolumeError::RootUnavailable(root.to_path_buf()));
            }
            let mut ids = manager
                .fs
                .read_dir_names(root)
                .map_err(|source| VolumeError::io("read volume root", root, source))?;
            ids.sort();

            let mut volumes = Vec::with_capacity(ids.len());
            for id in ids {
                if !manager.fs.is_dir(&manager.path(&id)) {
                    continue;
                }
                match manager.read_metadata(&id) {
                    Ok(volume) => volumes.push(volume),
                    Err(e) => warn!(id = %id, error = %e, "skipping unreadable volume"),
                }
            }
            Ok(volumes)
        })
        .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, VolumeError>
    where
        F: FnOnce(&VolumeManager) -> Result<T, VolumeError> + Send + 'static,
        T: Send + 'static,
    {
        let manager = self.clone();
        let root = self.root().to_path_buf();
        tokio::task::spawn_blocking(move || f(&manager))
            .await
            .map_err(|e| VolumeError::io("run volume task", &root, io::Error::other(e)))?
    }

    fn read_metadata(&self, id: &str) -> Result<Volume, VolumeError> {
        let path = self.path(id).join(&self.metadata_file);
        let file = self
            .fs
            .open(&path)
            .map_err(|source| VolumeError::MetadataUnreadable {
                id: id.to_string(),
                source,
            })?;
        let volume =
            Volume::from_json_reader(file).map_err(|source| VolumeError::MetadataCorrupt {
                id: id.to_string(),
                source,
            })?;
        debug!(id = %id, "read metadata");
        Ok(volume)
    }

    fn materialize(&self, volume: &Volume, bundle: &mut dyn SecretBundle) -> Result<(), VolumeError> {
        let root = self.path(&volume.id);
        self.fs
            .create_dir(&root, self.dir_mode)
            .map_err(|source| match source.kind() {
                io::ErrorKind::AlreadyExists => VolumeError::AlreadyExists(volume.id.clone()),
                io::ErrorKind::NotFound => VolumeError::RootUnavailable(self.root().to_path_buf()),
                _ => VolumeError::io("create volume directory", &root, source),
            })?;
        self.mounter
            .mount(volume)
            .map_err(|source| VolumeError::io("mount", &root, source))?;

        let mut merger = self.merged_secrets_file.as_ref().map(|_| Merger::new());
        let mut files = 0usize;
        for entry in bundle.entries()? {
            let mut entry = entry?;
            let header = entry.header().clone();
            let relative = header.relative_path()?;
            let target = root.join(&relative);

            if header.is_dir() {
                if relative.as_os_str().is_empty() {
                    continue;
                }
                debug!(path = %target.display(), "creating directory");
                self.fs
                    .create_dir_all(&target, self.dir_mode)
                    .map_err(|source| VolumeError::io("create directory", &target, source))?;
                continue;
            }
            if relative.as_os_str().is_empty() {
                return Err(SecretsError::UnsafePath(header.path).into());
            }

            // Archives need not list a file's directories before the file.
            if let Some(parent) = target.parent() {
                if !self.fs.is_dir(parent) {
                    debug!(path = %parent.display(), "creating implicit directory");
                    self.fs
                        .create_dir_all(parent, self.dir_mode)
                        .map_err(|source| VolumeError::io("create directory", parent, source))?;
                }
            }

            debug!(path = %target.display(), "creating file");
            let mut file = self
                .fs
                .create_new(&target, self.file_mode)
                .map_err(|source| VolumeError::io("create file", &target, source))?;
            let mut captured = merger.as_ref().map(|_| Vec::new());
            copy_entry(&mut entry, &mut file, &target, captured.as_mut())?;
            file.flush()
                .map_err(|source| VolumeError::io("write file", &target, source))?;
            if let (Some(merger), Some(data)) = (merger.as_mut(), captured) {
                merger.add(&header, data.as_slice());
            }
            files += 1;
        }

        if let (Some(name), Some(merger)) = (&self.merged_secrets_file, merger) {
            let path = root.join(name);
            let file = self
                .fs
                .create_new(&path, self.file_mode)
                .map_err(|source| VolumeError::io("create merged secrets file", &path, source))?;
            merger
                .write_json(file)
                .map_err(|source| VolumeError::io("write merged secrets file", &path, source))?;
        }

        let meta = root.join(&self.metadata_file);
        let file = self
            .fs
            .create_new(&meta, self.file_mode)
            .map_err(|source| VolumeError::io("create metadata file", &meta, source))?;
        volume
            .to_json_writer(file)
            .map_err(|source| VolumeError::io("write metadata file", &meta, source))?;

        info!(id = %volume.id, path = %root.display(), files, "created volume");
        Ok(())
    }
}

impl std::fmt::Debug for VolumeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeManager")
            .field("root", &self.root())
            .field("producers", &self.producers)
            .field("metadata_file", &self.metadata_file)
            .field("merged_secrets_file", &self.merged_secrets_file)
            .finish_non_exhaustive()
    }
}

/// Copy one entry. Read failures are the bundle's fault (decode), write
/// failures the filesystem's.
fn copy_entry(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    target: &Path,
    mut capture: Option<&mut Vec<u8>>,
) -> Result<u64, VolumeError> {
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(SecretsError::decode("cannot read secret file", e).into()),
        };
        writer
            .write_all(&buf[..n])
            .map_err(|source| VolumeError::io("write file", target, source))?;
        if let Some(capture) = capture.as_deref_mut() {
            capture.extend_from_slice(&buf[..n]);
        }
        total += n as u64;
    }
}

/// Ids name a single directory under the root.
fn validate_id(id: &str) -> Result<(), VolumeError> {
    let reason = if id.is_empty() {
        "must not be empty"
    } else if id == "." || id == ".." {
        "must not be a relative path component"
    } else if id.contains('/') {
        "must not contain '/'"
    } else if id.contains('\0') {
        "must not contain NUL"
    } else {
        return Ok(());
    };
    Err(VolumeError::InvalidId(id.to_string(), reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::secrets::testutil::{tar_gz, Fixture};
    use crate::secrets::{ArchiveBundle, SecretProducer, SingleFileBundle};
    use crate::types::{KeyPair, SecretSource, SecretType};
    use crate::volume::{MemoryFs, NoopMounter};
    use async_trait::async_trait;
    use sha2::{Digest, Sha256};
    use std::io::Cursor;
    use std::time::Duration;

    const ROOT: &str = "/secrets";

    /// Serves a fixed tarball, and only to volumes that carry a credential.
    struct Tarball(Vec<u8>);

    #[async_trait]
    impl SecretProducer for Tarball {
        async fn produce(&self, volume: &Volume) -> Result<Box<dyn SecretBundle>, SecretsError> {
            if volume.key_pair.is_none() {
                return Err(SecretsError::MissingCredential(volume.id.clone()));
            }
            let bundle = ArchiveBundle::new(volume.without_credential(), Cursor::new(self.0.clone()))?
                .with_secret_type(SecretType::Yaml);
            Ok(Box::new(bundle))
        }
    }

    struct FailingMounter(PathBuf);

    impl Mounter for FailingMounter {
        fn mount(&self, _volume: &Volume) -> io::Result<()> {
            Err(io::Error::from_raw_os_error(libc::EPERM))
        }

        fn unmount(&self, _id: &str) -> io::Result<()> {
            Ok(())
        }

        fn root(&self) -> &Path {
            &self.0
        }
    }

    /// Yields `head`, then blocks until the gate opens before ending the file.
    struct GatedReader {
        head: Option<&'static [u8]>,
        gate: std::sync::mpsc::Receiver<()>,
    }

    impl Read for GatedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(head) = self.head.take() {
                buf[..head.len()].copy_from_slice(head);
                return Ok(head.len());
            }
            let _ = self.gate.recv();
            Ok(0)
        }
    }

    struct Gated(std::sync::Mutex<Option<GatedReader>>);

    #[async_trait]
    impl SecretProducer for Gated {
        async fn produce(&self, volume: &Volume) -> Result<Box<dyn SecretBundle>, SecretsError> {
            let reader = self.0.lock().unwrap().take().ok_or(SecretsError::Consumed)?;
            Ok(Box::new(SingleFileBundle::new(
                volume.without_credential(),
                "secrets.json",
                reader,
                SecretType::Json,
            )))
        }
    }

    fn fixture() -> Vec<u8> {
        tar_gz(&[
            ("a.yaml", Fixture::File(b"secret: A\nsecretA: A\n")),
            ("nested/b.yaml", Fixture::File(b"secret: B\nsecretB: B\n")),
            ("link", Fixture::Symlink("a.yaml")),
            ("nested/deeper/c.yaml", Fixture::File(b"secretC: C\n")),
        ])
    }

    fn registry(data: Vec<u8>) -> ProducerRegistry {
        ProducerRegistry::new().with(SecretSource::Talos, Arc::new(Tarball(data)))
    }

    fn memory_manager() -> (VolumeManager, MemoryFs) {
        let fs = MemoryFs::with_dir(ROOT).unwrap();
        let manager = VolumeManager::new(Arc::new(NoopMounter::new(ROOT)), registry(fixture()))
            .with_filesystem(Arc::new(fs.clone()));
        (manager, fs)
    }

    fn volume(id: &str) -> Volume {
        Volume::new(id, SecretSource::Talos)
            .with_tag("tag", "awesome")
            .with_key_pair(KeyPair::new("CERT", "KEY"))
    }

    fn sha256(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[tokio::test]
    async fn create_materializes_regular_files() {
        let (manager, fs) = memory_manager();
        let stored = manager.create(volume("hash")).await.unwrap();
        assert!(stored.key_pair.is_none());

        let root = Path::new(ROOT).join("hash");
        let expected = [
            ("a.yaml", &b"secret: A\nsecretA: A\n"[..]),
            ("nested/b.yaml", &b"secret: B\nsecretB: B\n"[..]),
            ("nested/deeper/c.yaml", &b"secretC: C\n"[..]),
        ];
        for (path, content) in expected {
            let written = fs.read(&root.join(path)).unwrap();
            assert_eq!(sha256(&written), sha256(content), "{path}");
        }
        assert!(!fs.exists(&root.join("link")));

        let mut names = fs.read_dir_names(&root).unwrap();
        names.sort();
        assert_eq!(names, vec![".meta", "a.yaml", "nested"]);
    }

    #[tokio::test]
    async fn second_create_conflicts() {
        let (manager, _) = memory_manager();
        manager.create(volume("hash")).await.unwrap();
        let err = manager.create(volume("hash")).await.unwrap_err();
        assert!(matches!(err, VolumeError::AlreadyExists(ref id) if id == "hash"));
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn get_returns_volume_without_credential() {
        let (manager, fs) = memory_manager();
        let original = volume("hash");
        manager.create(original.clone()).await.unwrap();

        let got = manager.get("hash").await.unwrap();
        assert_eq!(got, original.without_credential());

        let meta = fs.read(&Path::new(ROOT).join("hash/.meta")).unwrap();
        let meta = String::from_utf8(meta).unwrap();
        assert!(!meta.contains("KEY"));
        assert!(!meta.contains("CERT"));
    }

    #[tokio::test]
    async fn destroy_removes_volume() {
        let (manager, _) = memory_manager();
        manager.create(volume("hash")).await.unwrap();
        manager.destroy("hash").await.unwrap();

        assert!(matches!(
            manager.get("hash").await,
            Err(VolumeError::NotFound(_))
        ));
        assert!(manager.list().await.unwrap().is_empty());
        let err = manager.destroy("hash").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn list_skips_corrupt_volumes() {
        let (manager, fs) = memory_manager();
        manager.create(volume("good")).await.unwrap();

        let bad = Path::new(ROOT).join("bad");
        fs.create_dir(&bad, 0o700).unwrap();
        fs.create_new(&bad.join(".meta"), 0o600)
            .unwrap()
            .write_all(b"{not json")
            .unwrap();
        drop(fs.create_new(&Path::new(ROOT).join("stray-file"), 0o600).unwrap());

        let listed = manager.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "good");

        let err = manager.get("bad").await.unwrap_err();
        assert!(matches!(err, VolumeError::MetadataCorrupt { .. }));
        assert_eq!(err.kind(), ErrorKind::DecodeFailure);
    }

    #[tokio::test]
    async fn list_requires_root() {
        let manager = VolumeManager::new(Arc::new(NoopMounter::new(ROOT)), registry(fixture()))
            .with_filesystem(Arc::new(MemoryFs::new()));
        let err = manager.list().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);

        let err = manager.create(volume("hash")).await.unwrap_err();
        assert!(matches!(err, VolumeError::RootUnavailable(_)));
    }

    #[tokio::test]
    async fn unhandled_source_touches_nothing() {
        let (manager, fs) = memory_manager();
        let vol = Volume::new("hash", SecretSource::Unknown);
        let err = manager.create(vol).await.unwrap_err();
        assert!(matches!(err, VolumeError::UnhandledSource(SecretSource::Unknown)));
        assert!(!fs.exists(&Path::new(ROOT).join("hash")));
    }

    #[tokio::test]
    async fn producer_failure_touches_nothing() {
        let (manager, fs) = memory_manager();
        let err = manager
            .create(volume("hash").without_credential())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFailure);
        assert!(!fs.exists(&Path::new(ROOT).join("hash")));
    }

    #[tokio::test]
    async fn failed_mount_leaves_incomplete_volume() {
        let fs = MemoryFs::with_dir(ROOT).unwrap();
        let manager = VolumeManager::new(Arc::new(FailingMounter(ROOT.into())), registry(fixture()))
            .with_filesystem(Arc::new(fs.clone()));

        let err = manager.create(volume("hash")).await.unwrap_err();
        assert!(matches!(err, VolumeError::Io { op: "mount", .. }));

        assert!(!manager.is_complete("hash").await.unwrap());
        let err = manager.get("hash").await.unwrap_err();
        assert!(matches!(err, VolumeError::MetadataUnreadable { .. }));
        assert!(manager.list().await.unwrap().is_empty());

        manager.destroy("hash").await.unwrap();
        assert!(!fs.exists(&Path::new(ROOT).join("hash")));
    }

    #[tokio::test]
    async fn duplicate_entries_fail_create() {
        let data = tar_gz(&[("a", Fixture::File(b"1")), ("a", Fixture::File(b"2"))]);
        let fs = MemoryFs::with_dir(ROOT).unwrap();
        let manager = VolumeManager::new(Arc::new(NoopMounter::new(ROOT)), registry(data))
            .with_filesystem(Arc::new(fs.clone()));

        let err = manager.create(volume("hash")).await.unwrap_err();
        assert!(matches!(err, VolumeError::Io { op: "create file", .. }));
        assert_eq!(fs.read(&Path::new(ROOT).join("hash/a")).unwrap(), b"1");
        assert!(!manager.is_complete("hash").await.unwrap());
    }

    #[tokio::test]
    async fn escaping_entries_are_refused() {
        let data = tar_gz(&[("../escape", Fixture::File(b"x"))]);
        let fs = MemoryFs::with_dir(ROOT).unwrap();
        let manager = VolumeManager::new(Arc::new(NoopMounter::new(ROOT)), registry(data))
            .with_filesystem(Arc::new(fs.clone()));

        let err = manager.create(volume("hash")).await.unwrap_err();
        assert!(matches!(err, VolumeError::Secrets(SecretsError::UnsafePath(_))));
        assert!(!fs.exists(Path::new("/escape")));
    }

    #[tokio::test]
    async fn merged_secrets_file_is_written() {
        let (manager, fs) = memory_manager();
        let manager = manager.with_merged_secrets_file("secrets.json");
        manager.create(volume("hash")).await.unwrap();

        let merged = fs.read(&Path::new(ROOT).join("hash/secrets.json")).unwrap();
        assert_eq!(
            String::from_utf8(merged).unwrap(),
            "{\"secret\":\"A\",\"secretA\":\"A\",\"secretB\":\"B\",\"secretC\":\"C\"}\n"
        );
    }

    #[tokio::test]
    async fn invalid_ids_are_rejected() {
        let (manager, _) = memory_manager();
        for id in ["", ".", "..", "a/b"] {
            let err = manager.get(id).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Invalid, "{id:?}");
        }
    }

    #[tokio::test]
    async fn works_on_the_host_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let manager = VolumeManager::new(Arc::new(NoopMounter::new(dir.path())), registry(fixture()))
            .with_metadata_file("volume.json");
        assert_eq!(manager.metadata_file(), "volume.json");

        manager.create(volume("hash")).await.unwrap();
        let written = std::fs::read(dir.path().join("hash/nested/deeper/c.yaml")).unwrap();
        assert_eq!(written, b"secretC: C\n");
        assert!(dir.path().join("hash/volume.json").is_file());
        assert!(!dir.path().join("hash/link").exists());

        assert_eq!(manager.list().await.unwrap().len(), 1);
        manager.destroy("hash").await.unwrap();
        assert!(!dir.path().join("hash").exists());
    }

    #[tokio::test]
    async fn host_volumes_use_configured_modes() {
        use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

        let dir = tempfile::tempdir().unwrap();
        let mode = |path: &str| {
            std::fs::metadata(dir.path().join(path))
                .unwrap()
                .permissions()
                .mode()
                & 0o777
        };
        // Whatever the umask leaves of a fully open mode.
        std::fs::DirBuilder::new()
            .mode(0o777)
            .create(dir.path().join("open"))
            .unwrap();
        let allowed = mode("open");

        let manager = VolumeManager::new(Arc::new(NoopMounter::new(dir.path())), registry(fixture()))
            .with_dir_mode(0o750)
            .with_file_mode(0o640);
        manager.create(volume("hash")).await.unwrap();

        assert_eq!(mode("hash"), 0o750 & allowed);
        assert_eq!(mode("hash/nested/deeper"), 0o750 & allowed);
        assert_eq!(mode("hash/a.yaml"), 0o640 & allowed);
        assert_eq!(mode("hash/.meta"), 0o640 & allowed);
    }

    #[tokio::test]
    async fn concurrent_creates_of_one_id_yield_one_volume() {
        let (manager, _) = memory_manager();
        let (a, b) = tokio::join!(
            manager.create(volume("hash")),
            manager.create(volume("hash"))
        );
        assert!(a.is_ok() ^ b.is_ok());
        assert_eq!(manager.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn destroy_waits_for_an_abandoned_create() {
        let (open, gate) = std::sync::mpsc::channel();
        let reader = GatedReader {
            head: Some(&b"{\"a\":"[..]),
            gate,
        };
        let fs = MemoryFs::with_dir(ROOT).unwrap();
        let producers = ProducerRegistry::new().with(
            SecretSource::Talos,
            Arc::new(Gated(std::sync::Mutex::new(Some(reader)))),
        );
        let manager = VolumeManager::new(Arc::new(NoopMounter::new(ROOT)), producers)
            .with_filesystem(Arc::new(fs.clone()));

        let creating = manager.clone();
        let create = tokio::spawn(async move { creating.create(volume("hash")).await });
        let file = Path::new(ROOT).join("hash/secrets.json");
        for _ in 0..500 {
            if fs.exists(&file) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fs.exists(&file), "create never reached the secrets file");

        // The caller goes away while the copy is still blocked.
        create.abort();
        let _ = create.await;

        let destroying = manager.clone();
        let destroy = tokio::spawn(async move { destroying.destroy("hash").await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!destroy.is_finished(), "destroy ran while create was still writing");

        open.send(()).unwrap();
        destroy.await.unwrap().unwrap();

        assert!(matches!(
            manager.get("hash").await,
            Err(VolumeError::NotFound(_))
        ));
        assert!(manager.list().await.unwrap().is_empty());
        assert!(!fs.exists(&Path::new(ROOT).join("hash")));
    }
}

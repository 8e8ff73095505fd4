//! Filesystem seam for the volume manager.
//!
//! - `OsFs`: the host filesystem, with explicit permission bits
//! - `MemoryFs`: a purely in-memory tree (virtual mode and tests)

use std::collections::BTreeMap;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// The filesystem operations a volume needs.
///
/// `create_dir` and `create_new` are exclusive: they fail with
/// [`io::ErrorKind::AlreadyExists`] when anything is already at the path, and
/// with [`io::ErrorKind::NotFound`] when the parent directory is missing.
pub trait VolumeFs: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    fn create_dir(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Create a directory and any missing parents. Existing directories are
    /// left alone.
    fn create_dir_all(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn create_new(&self, path: &Path, mode: u32) -> io::Result<Box<dyn Write + Send>>;

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Names of the immediate children of a directory, in no particular order.
    fn read_dir_names(&self, path: &Path) -> io::Result<Vec<String>>;

    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// The host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl VolumeFs for OsFs {
    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn is_dir(&self, path: &Path) -> bool {
        fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
    }

    fn create_dir(&self, path: &Path, mode: u32) -> io::Result<()> {
        DirBuilder::new().mode(mode).create(path)
    }

    fn create_dir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        DirBuilder::new().recursive(true).mode(mode).create(path)
    }

    fn create_new(&self, path: &Path, mode: u32) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(path)?;
        Ok(Box::new(file))
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(path)?))
    }

    fn read_dir_names(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Arc<Mutex<Vec<u8>>>),
}

/// An in-memory filesystem. Paths are compared as given; `/` always exists.
/// Permission bits are accepted and ignored.
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    nodes: Arc<Mutex<BTreeMap<PathBuf, Node>>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// A filesystem in which `root` and its ancestors already exist.
    pub fn with_dir(root: impl AsRef<Path>) -> io::Result<Self> {
        let fs = Self::new();
        fs.create_dir_all(root.as_ref(), 0o755)?;
        Ok(fs)
    }

    fn nodes(&self) -> MutexGuard<'_, BTreeMap<PathBuf, Node>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read a whole file. Test and tooling convenience.
    pub fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        self.open(path)?.read_to_end(&mut data)?;
        Ok(data)
    }
}

fn is_root(path: &Path) -> bool {
    path.parent().is_none()
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{}: no such file or directory", path.display()),
    )
}

fn already_exists(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("{}: already exists", path.display()),
    )
}

fn not_a_directory(path: &Path) -> io::Error {
    io::Error::other(format!("{}: not a directory", path.display()))
}

fn parent_is_dir(nodes: &BTreeMap<PathBuf, Node>, path: &Path) -> bool {
    match path.parent() {
        None => true,
        Some(parent) if is_root(parent) || parent.as_os_str().is_empty() => true,
        Some(parent) => matches!(nodes.get(parent), Some(Node::Dir)),
    }
}

/// Appends to a file owned by a [`MemoryFs`].
struct MemoryFile(Arc<Mutex<Vec<u8>>>);

impl Write for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl VolumeFs for MemoryFs {
    fn exists(&self, path: &Path) -> bool {
        is_root(path) || self.nodes().contains_key(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        is_root(path) || matches!(self.nodes().get(path), Some(Node::Dir))
    }

    fn create_dir(&self, path: &Path, _mode: u32) -> io::Result<()> {
        let mut nodes = self.nodes();
        if is_root(path) || nodes.contains_key(path) {
            return Err(already_exists(path));
        }
        if !parent_is_dir(&nodes, path) {
            return Err(not_found(path));
        }
        nodes.insert(path.to_path_buf(), Node::Dir);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path, _mode: u32) -> io::Result<()> {
        let mut nodes = self.nodes();
        let mut missing: Vec<&Path> = Vec::new();
        for ancestor in path.ancestors() {
            if is_root(ancestor) || ancestor.as_os_str().is_empty() {
                break;
            }
            match nodes.get(ancestor) {
                Some(Node::Dir) => break,
                Some(Node::File(_)) => return Err(not_a_directory(ancestor)),
                None => missing.push(ancestor),
            }
        }
        for dir in missing.into_iter().rev() {
            nodes.insert(dir.to_path_buf(), Node::Dir);
        }
        Ok(())
    }

    fn create_new(&self, path: &Path, _mode: u32) -> io::Result<Box<dyn Write + Send>> {
        let mut nodes = self.nodes();
        if is_root(path) || nodes.contains_key(path) {
            return Err(already_exists(path));
        }
        if !parent_is_dir(&nodes, path) {
            return Err(not_found(path));
        }
        let data = Arc::new(Mutex::new(Vec::new()));
        nodes.insert(path.to_path_buf(), Node::File(data.clone()));
        Ok(Box::new(MemoryFile(data)))
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        match self.nodes().get(path) {
            Some(Node::File(data)) => {
                let snapshot = data.lock().unwrap_or_else(|e| e.into_inner()).clone();
                Ok(Box::new(Cursor::new(snapshot)))
            }
            Some(Node::Dir) => Err(io::Error::other(format!(
                "{}: is a directory",
                path.display()
            ))),
            None => Err(not_found(path)),
        }
    }

    fn read_dir_names(&self, path: &Path) -> io::Result<Vec<String>> {
        let nodes = self.nodes();
        if !is_root(path) {
            match nodes.get(path) {
                Some(Node::Dir) => {}
                Some(Node::File(_)) => return Err(not_a_directory(path)),
                None => return Err(not_found(path)),
            }
        }
        Ok(nodes
            .keys()
            .filter(|candidate| candidate.parent() == Some(path))
            .filter_map(|candidate| candidate.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect())
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut nodes = self.nodes();
        if !nodes.contains_key(path) {
            return Err(not_found(path));
        }
        nodes.retain(|candidate, _| !candidate.starts_with(path));
        Ok(())
    }
}

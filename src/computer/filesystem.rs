// CLASSIFICATION: COMMUNITY
// Filename: filesystem.rs v0.4
// Author: Lukas Bower
// Date Modified: 2027-08-24

//! Quota-checked private filesystem for one computer.
//!
//! Each [`FileSystem`] is rooted at a host directory and charges stored bytes
//! to a storage owner (the computer itself, or a removable disk) and open
//! handles to the computer. Writes are all-or-nothing: a write that would
//! cross the byte ceiling is refused before any byte reaches disk.
//! Removable media are attached as mounts under a top-level name, the same
//! way an overlay maps a local prefix onto another tree.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::quota::{QuotaOwner, QuotaPermit, QuotaTracker, ResourceKind};

pub type FileHandle = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Truncates an existing file.
    Write,
    Append,
}

#[derive(Debug)]
struct OpenFile {
    mount: Option<String>,
    path: PathBuf,
    mode: OpenMode,
    file: File,
    _handle: QuotaPermit,
}

/// One storage tree with its own byte owner.
#[derive(Debug)]
struct Store {
    root: PathBuf,
    owner: QuotaOwner,
}

impl Store {
    fn open(root: PathBuf, owner: QuotaOwner, quotas: &Arc<QuotaTracker>) -> CoreResult<Self> {
        fs::create_dir_all(&root)?;
        let existing = tree_size(&root)?;
        let already = quotas.in_use(owner, ResourceKind::FilesystemBytes);
        if existing > already {
            match quotas.try_acquire(owner, ResourceKind::FilesystemBytes, existing - already) {
                Ok(permit) => {
                    permit.into_persistent();
                }
                Err(r) => warn!(
                    "{} already holds {existing} bytes, over its {} byte limit",
                    root.display(),
                    r.limit
                ),
            }
        }
        Ok(Self { root, owner })
    }
}

/// A computer's filesystem view: its own store plus any mounted media.
#[derive(Debug)]
pub struct FileSystem {
    main: Store,
    mounts: BTreeMap<String, Store>,
    handle_owner: QuotaOwner,
    quotas: Arc<QuotaTracker>,
    open: HashMap<FileHandle, OpenFile>,
    next_handle: FileHandle,
}

impl FileSystem {
    /// Open the tree at `root`. Bytes already on disk are charged to
    /// `owner`; open handles are charged to `owner` as well.
    pub fn new(root: impl Into<PathBuf>, owner: QuotaOwner, quotas: Arc<QuotaTracker>) -> CoreResult<Self> {
        let main = Store::open(root.into(), owner, &quotas)?;
        Ok(Self {
            main,
            mounts: BTreeMap::new(),
            handle_owner: owner,
            quotas,
            open: HashMap::new(),
            next_handle: 1,
        })
    }

    pub fn root(&self) -> &Path {
        &self.main.root
    }

    /// Attach removable media under `/<name>`. Its bytes are charged to
    /// `owner`, which must already be registered with the tracker.
    pub fn mount(&mut self, name: &str, root: impl Into<PathBuf>, owner: QuotaOwner) -> CoreResult<()> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(CoreError::InvalidPath(name.to_string()));
        }
        let store = Store::open(root.into(), owner, &self.quotas)?;
        debug!("mounted {owner} at /{name}");
        self.mounts.insert(name.to_string(), store);
        Ok(())
    }

    /// Detach a mount, closing any handle into it.
    pub fn unmount(&mut self, name: &str) -> bool {
        self.open.retain(|_, f| f.mount.as_deref() != Some(name));
        self.mounts.remove(name).is_some()
    }

    /// Split a script path into (mount, sanitised relative path).
    fn locate(&self, path: &str) -> CoreResult<(Option<String>, PathBuf)> {
        let mut parts: Vec<&str> = Vec::new();
        for part in path.split(['/', '\\']) {
            match part {
                "" | "." => {}
                ".." => {
                    if parts.pop().is_none() {
                        return Err(CoreError::InvalidPath(path.to_string()));
                    }
                }
                p if p.contains('\0') => return Err(CoreError::InvalidPath(path.to_string())),
                p => parts.push(p),
            }
        }
        if let Some(first) = parts.first() {
            if self.mounts.contains_key(*first) {
                let mount = first.to_string();
                return Ok((Some(mount), parts[1..].iter().collect()));
            }
        }
        Ok((None, parts.iter().collect()))
    }

    fn store(&self, mount: &Option<String>) -> &Store {
        match mount {
            Some(name) => self.mounts.get(name).unwrap_or(&self.main),
            None => &self.main,
        }
    }

    fn host_path(&self, path: &str) -> CoreResult<(Option<String>, PathBuf)> {
        let (mount, rel) = self.locate(path)?;
        let full = self.store(&mount).root.join(rel);
        Ok((mount, full))
    }

    pub fn exists(&self, path: &str) -> CoreResult<bool> {
        Ok(self.host_path(path)?.1.exists())
    }

    pub fn is_dir(&self, path: &str) -> CoreResult<bool> {
        Ok(self.host_path(path)?.1.is_dir())
    }

    pub fn size(&self, path: &str) -> CoreResult<u64> {
        let (_, full) = self.host_path(path)?;
        Ok(fs::metadata(full)?.len())
    }

    pub fn list(&self, path: &str) -> CoreResult<Vec<String>> {
        let (mount, full) = self.host_path(path)?;
        let mut names: Vec<String> = fs::read_dir(full)?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        if mount.is_none() && self.locate(path)?.1.as_os_str().is_empty() {
            names.extend(self.mounts.keys().cloned());
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    pub fn make_dir(&self, path: &str) -> CoreResult<()> {
        let (_, full) = self.host_path(path)?;
        fs::create_dir_all(full)?;
        Ok(())
    }

    /// Bytes charged against the store holding `path`, and its capacity
    /// under the limits currently registered for its owner.
    pub fn space(&self, path: &str) -> CoreResult<(u64, u64)> {
        let (mount, _) = self.locate(path)?;
        let owner = self.store(&mount).owner;
        let capacity = self
            .quotas
            .usage(owner)
            .map(|u| u.limits.filesystem_bytes)
            .unwrap_or(0);
        Ok((self.quotas.in_use(owner, ResourceKind::FilesystemBytes), capacity))
    }

    pub fn free_space(&self, path: &str) -> CoreResult<u64> {
        let (used, capacity) = self.space(path)?;
        Ok(capacity.saturating_sub(used))
    }

    pub fn open(&mut self, path: &str, mode: OpenMode) -> CoreResult<FileHandle> {
        let (mount, full) = self.host_path(path)?;
        if full.is_dir() {
            return Err(CoreError::InvalidPath(format!("{path} is a directory")));
        }
        let permit = self
            .quotas
            .try_acquire(self.handle_owner, ResourceKind::OpenFileHandles, 1)?;
        let file = match mode {
            OpenMode::Read => File::open(&full)?,
            OpenMode::Write | OpenMode::Append => {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)?;
                }
                let previous = fs::metadata(&full).map(|m| m.len()).unwrap_or(0);
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(mode == OpenMode::Append)
                    .truncate(mode == OpenMode::Write)
                    .open(&full)?;
                if mode == OpenMode::Write && previous > 0 {
                    let owner = self.store(&mount).owner;
                    self.quotas
                        .release(owner, ResourceKind::FilesystemBytes, previous);
                }
                file
            }
        };
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.open.insert(
            handle,
            OpenFile {
                mount,
                path: full,
                mode,
                file,
                _handle: permit,
            },
        );
        Ok(handle)
    }

    /// Write all of `data` or nothing.
    pub fn write(&mut self, handle: FileHandle, data: &[u8]) -> CoreResult<()> {
        let file = self
            .open
            .get_mut(&handle)
            .ok_or(CoreError::NoSuchHandle(handle as u64))?;
        if file.mode == OpenMode::Read {
            return Err(CoreError::InvalidPath(format!(
                "{} is open for reading",
                file.path.display()
            )));
        }
        let owner = match &file.mount {
            Some(name) => self.mounts.get(name).map(|s| s.owner).unwrap_or(self.main.owner),
            None => self.main.owner,
        };
        let len = data.len() as u64;
        let permit = self
            .quotas
            .try_acquire(owner, ResourceKind::FilesystemBytes, len)?;
        let before = file.file.metadata()?.len();
        if let Err(e) = file.file.write_all(data) {
            // Roll back a partial write; whatever stays on disk stays charged.
            let rollback = file
                .file
                .set_len(before)
                .and_then(|()| file.file.seek(SeekFrom::Start(before)));
            if let Err(re) = rollback {
                warn!("could not roll back {}: {re}", file.path.display());
            }
            let kept = file
                .file
                .metadata()
                .map(|m| m.len().saturating_sub(before))
                .unwrap_or(len)
                .min(len);
            permit.into_persistent();
            self.quotas
                .release(owner, ResourceKind::FilesystemBytes, len - kept);
            return Err(e.into());
        }
        permit.into_persistent();
        Ok(())
    }

    pub fn read(&mut self, handle: FileHandle, max: usize) -> CoreResult<Vec<u8>> {
        let file = self
            .open
            .get_mut(&handle)
            .ok_or(CoreError::NoSuchHandle(handle as u64))?;
        if file.mode != OpenMode::Read {
            return Err(CoreError::InvalidPath(format!(
                "{} is open for writing",
                file.path.display()
            )));
        }
        let mut buf = Vec::new();
        (&mut file.file).take(max as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn close(&mut self, handle: FileHandle) -> CoreResult<()> {
        let mut file = self
            .open
            .remove(&handle)
            .ok_or(CoreError::NoSuchHandle(handle as u64))?;
        file.file.flush()?;
        Ok(())
    }

    pub fn close_all(&mut self) {
        self.open.clear();
    }

    pub fn open_handles(&self) -> usize {
        self.open.len()
    }

    /// Remove a file or directory tree, returning its bytes to the quota.
    pub fn delete(&mut self, path: &str) -> CoreResult<()> {
        let (mount, full) = self.host_path(path)?;
        if full == self.store(&mount).root {
            return Err(CoreError::InvalidPath(format!("cannot delete {path}")));
        }
        self.open.retain(|_, f| !f.path.starts_with(&full));
        let freed = tree_size(&full)?;
        if full.is_dir() {
            fs::remove_dir_all(&full)?;
        } else {
            fs::remove_file(&full)?;
        }
        let owner = self.store(&mount).owner;
        self.quotas.release(owner, ResourceKind::FilesystemBytes, freed);
        Ok(())
    }

    /// Convenience: replace a file's contents in one call.
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> CoreResult<()> {
        let handle = self.open(path, OpenMode::Write)?;
        let result = self.write(handle, data);
        self.close(handle)?;
        result
    }

    pub fn read_file(&mut self, path: &str) -> CoreResult<Vec<u8>> {
        let handle = self.open(path, OpenMode::Read)?;
        let result = self.read(handle, usize::MAX);
        self.close(handle)?;
        result
    }
}

fn tree_size(path: &Path) -> std::io::Result<u64> {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    if meta.is_file() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        total += tree_size(&entry?.path())?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::QuotaLimits;

    fn limits(bytes: u64, files: u64) -> QuotaLimits {
        QuotaLimits {
            filesystem_bytes: bytes,
            open_file_handles: files,
            network_requests: 0,
            websocket_connections: 0,
            websocket_message_bytes: 0,
        }
    }

    #[test]
    fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let quotas = QuotaTracker::new();
        let owner = QuotaOwner::Computer(1);
        quotas.register(owner, limits(1000, 4));
        let mut fs = FileSystem::new(dir.path().join("c1"), owner, quotas).unwrap();
        assert!(matches!(fs.open("../escape", OpenMode::Write), Err(CoreError::InvalidPath(_))));
        fs.write_file("a/../b.txt", b"hi").unwrap();
        assert!(dir.path().join("c1/b.txt").exists());
    }

    #[test]
    fn overwrite_returns_old_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let quotas = QuotaTracker::new();
        let owner = QuotaOwner::Computer(2);
        quotas.register(owner, limits(100, 4));
        let mut fs = FileSystem::new(dir.path(), owner, Arc::clone(&quotas)).unwrap();
        fs.write_file("f", &[0u8; 80]).unwrap();
        fs.write_file("f", &[1u8; 90]).unwrap();
        assert_eq!(quotas.in_use(owner, ResourceKind::FilesystemBytes), 90);
        fs.delete("f").unwrap();
        assert_eq!(quotas.in_use(owner, ResourceKind::FilesystemBytes), 0);
    }

    #[test]
    fn open_handles_are_limited() {
        let dir = tempfile::tempdir().unwrap();
        let quotas = QuotaTracker::new();
        let owner = QuotaOwner::Computer(3);
        quotas.register(owner, limits(100, 1));
        let mut fs = FileSystem::new(dir.path(), owner, quotas).unwrap();
        let h = fs.open("one", OpenMode::Write).unwrap();
        let err = fs.open("two", OpenMode::Write).unwrap_err();
        assert_eq!(err.quota_kind(), Some(ResourceKind::OpenFileHandles));
        fs.close(h).unwrap();
        assert!(fs.open("two", OpenMode::Write).is_ok());
    }

    #[test]
    fn failed_write_leaves_no_charge() {
        let Ok(full) = OpenOptions::new().write(true).open("/dev/full") else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let quotas = QuotaTracker::new();
        let owner = QuotaOwner::Computer(5);
        quotas.register(owner, limits(1000, 4));
        let mut fs = FileSystem::new(dir.path(), owner, Arc::clone(&quotas)).unwrap();
        let permit = quotas
            .try_acquire(owner, ResourceKind::OpenFileHandles, 1)
            .unwrap();
        fs.open.insert(
            7,
            OpenFile {
                mount: None,
                path: PathBuf::from("/dev/full"),
                mode: OpenMode::Append,
                file: full,
                _handle: permit,
            },
        );
        assert!(matches!(fs.write(7, &[0u8; 64]), Err(CoreError::Io(_))));
        assert_eq!(quotas.in_use(owner, ResourceKind::FilesystemBytes), 0);
    }

    #[test]
    fn space_follows_reregistered_limits() {
        let dir = tempfile::tempdir().unwrap();
        let quotas = QuotaTracker::new();
        let owner = QuotaOwner::Computer(6);
        quotas.register(owner, limits(100, 4));
        let mut fs = FileSystem::new(dir.path(), owner, Arc::clone(&quotas)).unwrap();
        fs.write_file("f", &[0u8; 40]).unwrap();
        assert_eq!(fs.space("/").unwrap(), (40, 100));
        quotas.register(owner, limits(500, 4));
        assert_eq!(fs.space("/").unwrap(), (40, 500));
        assert_eq!(fs.free_space("/").unwrap(), 460);
    }

    #[test]
    fn mounted_disk_charges_its_own_owner() {
        let dir = tempfile::tempdir().unwrap();
        let quotas = QuotaTracker::new();
        let computer = QuotaOwner::Computer(4);
        let disk = QuotaOwner::Disk(9);
        quotas.register(computer, limits(1000, 4));
        quotas.register(disk, QuotaLimits::storage_only(10));
        let mut fs = FileSystem::new(dir.path().join("c"), computer, Arc::clone(&quotas)).unwrap();
        fs.mount("disk", dir.path().join("d"), disk).unwrap();
        fs.write_file("disk/small", b"0123456789").unwrap();
        assert!(fs.write_file("disk/more", b"x").is_err());
        assert_eq!(quotas.in_use(disk, ResourceKind::FilesystemBytes), 10);
        assert_eq!(quotas.in_use(computer, ResourceKind::FilesystemBytes), 0);
        assert!(fs.list("/").unwrap().contains(&"disk".to_string()));
    }
}

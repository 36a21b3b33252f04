use std::{
    fs::{self, File},
    io::{self, ErrorKind, Read},
    path::PathBuf,
};

use bytes::Bytes;
use fs4::FileExt;
use log::warn;
use walkdir::WalkDir;

use super::{ListableStore, ReadableStore, Store, WriteableStore};
use crate::keys::ObjectKey;

/// Backend mapping each key component to one path component under a base
/// directory.
pub struct FileSystemStore {
    base_path: PathBuf,
    readonly: bool,
}

impl FileSystemStore {
    /// Canonicalizes path and checks that it is an extant directory.
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let base_path = path.canonicalize()?;
        let meta = fs::metadata(&base_path)?;
        if meta.is_file() {
            Err(io::Error::new(
                ErrorKind::Other,
                "Path exists, but it is a file",
            ))
        } else {
            Ok(Self {
                base_path,
                readonly: false,
            })
        }
    }

    /// As [FileSystemStore::open], but all mutation is rejected with
    /// [crate::TensorError::ReadOnly] at the cache layer.
    pub fn open_readonly(path: PathBuf) -> io::Result<Self> {
        let mut out = Self::open(path)?;
        out.readonly = true;
        Ok(out)
    }

    /// Creates the directory (with parents if `parents`), then opens it.
    pub fn create(path: PathBuf, parents: bool) -> io::Result<Self> {
        if path.exists() {
            return Err(io::Error::new(ErrorKind::AlreadyExists, "Already exists"));
        } else if parents {
            fs::create_dir_all(&path)?;
        } else {
            fs::create_dir(&path)?;
        }
        Ok(Self {
            base_path: path.canonicalize()?,
            readonly: false,
        })
    }

    /// Canonicalizes path and, if the directory does not exist, creates it.
    pub fn open_or_create(path: PathBuf, parents: bool) -> io::Result<Self> {
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path, parents)
        }
    }

    fn get_path(&self, key: &ObjectKey) -> PathBuf {
        let mut p = self.base_path.clone();
        for c in key.components() {
            p.push(c);
        }
        p
    }
}

impl Store for FileSystemStore {
    fn is_readonly(&self) -> bool {
        self.readonly
    }
}

impl ReadableStore for FileSystemStore {
    fn get(&self, key: &ObjectKey) -> io::Result<Option<Bytes>> {
        let target = self.get_path(key);
        let mut f = match File::open(target) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        f.lock_shared()?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        Ok(Some(buf.into()))
    }

    fn has_key(&self, key: &ObjectKey) -> io::Result<bool> {
        Ok(self.get_path(key).is_file())
    }
}

impl ListableStore for FileSystemStore {
    fn list_prefix(&self, prefix: &ObjectKey) -> io::Result<Vec<ObjectKey>> {
        let target = self.get_path(prefix);
        if !target.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&target) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.base_path)
                .expect("walked outside base path");
            let mut key = ObjectKey::new(Vec::<String>::new()).expect("empty key is valid");
            let mut ok = true;
            for part in rel.components() {
                let name = part.as_os_str();
                match name.to_str() {
                    Some(s) => {
                        if key.push(s.to_owned()).is_err() {
                            ok = false;
                            break;
                        }
                    }
                    None => {
                        warn!("Skipping object with non-UTF8 name: {:?}", name);
                        ok = false;
                        break;
                    }
                }
            }
            if ok {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

impl WriteableStore for FileSystemStore {
    fn set(&self, key: &ObjectKey, value: Bytes) -> io::Result<()> {
        let path = self.get_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut f = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .open(path)?;
        f.lock_exclusive()?;
        io::Write::write_all(&mut f, &value)?;
        Ok(())
    }

    fn erase(&self, key: &ObjectKey) -> io::Result<bool> {
        let path = self.get_path(key);

        match File::open(&path) {
            Ok(f) => {
                f.lock_exclusive()?;
                fs::remove_file(&path)?;
                Ok(false)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn erase_prefix(&self, key_prefix: &ObjectKey) -> io::Result<bool> {
        let path = self.get_path(key_prefix);

        if path.exists() {
            for entry in WalkDir::new(&path).contents_first(true) {
                let entry = entry.map_err(io::Error::from)?;

                if entry.file_type().is_dir() {
                    fs::remove_dir(entry.path())?;
                } else {
                    let file = File::open(entry.path())?;
                    file.lock_exclusive()?;
                    fs::remove_file(entry.path())?;
                }
            }
        }

        Ok(path.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn roundtrip_on_disk() {
        let dir = TempDir::new("tenstore-fs").unwrap();
        let store = FileSystemStore::open_or_create(dir.path().join("data"), true).unwrap();

        let key = ObjectKey::chunk("t", "0011223344556677");
        store.set(&key, Bytes::from_static(b"payload")).unwrap();
        assert_eq!(store.get(&key).unwrap().unwrap().as_ref(), b"payload");

        let listed = store.list_prefix(&ObjectKey::tensor_prefix("t")).unwrap();
        assert_eq!(listed, vec![key.clone()]);

        store.erase_prefix(&ObjectKey::tensor_prefix("t")).unwrap();
        assert!(store.get(&key).unwrap().is_none());
    }

    #[test]
    fn missing_key_is_none() {
        let dir = TempDir::new("tenstore-fs").unwrap();
        let store = FileSystemStore::open_or_create(dir.path().join("data"), true).unwrap();
        assert!(store
            .get(&ObjectKey::tensor_meta("nope"))
            .unwrap()
            .is_none());
        assert!(!store.has_key(&ObjectKey::tensor_meta("nope")).unwrap());
    }

    #[test]
    fn readonly_flag() {
        let dir = TempDir::new("tenstore-fs").unwrap();
        FileSystemStore::create(dir.path().join("data"), false).unwrap();
        let store = FileSystemStore::open_readonly(dir.path().join("data")).unwrap();
        assert!(store.is_readonly());
    }
}

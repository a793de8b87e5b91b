//! On-disk descriptor store.
//!
//! Known routers live under `netDb/r<c>/routerInfo-<b32>.dat`, where `<c>`
//! is the first base32 character of the identity hash. The format of each
//! file is the signed descriptor itself.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use veil_core::IdentHash;

use crate::NetDbError;

pub struct NetDbStorage {
    root: PathBuf,
}

impl NetDbStorage {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("netDb"),
        }
    }

    fn router_path(&self, hash: &IdentHash) -> PathBuf {
        let b32 = hash.to_base32();
        self.root
            .join(format!("r{}", &b32[..1]))
            .join(format!("routerInfo-{b32}.dat"))
    }

    pub fn save_router(&self, hash: &IdentHash, buf: &[u8]) -> Result<(), NetDbError> {
        let path = self.router_path(hash);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, buf)?;
        Ok(())
    }

    pub fn remove_router(&self, hash: &IdentHash) {
        let _ = fs::remove_file(self.router_path(hash));
    }

    /// Load every stored descriptor, skipping unreadable files.
    pub fn load_all(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let Ok(dirs) = fs::read_dir(&self.root) else {
            return out;
        };
        for dir in dirs.flatten() {
            let Ok(files) = fs::read_dir(dir.path()) else {
                continue;
            };
            for file in files.flatten() {
                match fs::read(file.path()) {
                    Ok(buf) => out.push(buf),
                    Err(e) => warn!("NetDb: cannot read {:?}: {e}", file.path()),
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_remove() {
        let dir = std::env::temp_dir().join(format!("veil-netdb-test-{}", std::process::id()));
        let storage = NetDbStorage::new(&dir);
        let hash = IdentHash::new([5u8; 32]);
        storage.save_router(&hash, b"descriptor bytes").unwrap();

        let loaded = storage.load_all();
        assert_eq!(loaded, vec![b"descriptor bytes".to_vec()]);

        // hashed-prefix directory layout
        let b32 = hash.to_base32();
        assert!(dir
            .join("netDb")
            .join(format!("r{}", &b32[..1]))
            .join(format!("routerInfo-{b32}.dat"))
            .exists());

        storage.remove_router(&hash);
        assert!(storage.load_all().is_empty());
        let _ = fs::remove_dir_all(dir);
    }
}

//! Process-wide registry of open trees.
//!
//! A storage location is a directory holding the conventional file pair:
//! the node store and its element mapper table. The manager guarantees at
//! most one live [`Tree`] per location and closes the pair only when the
//! last registered owner lets go. One mutex guards the instance map and the
//! owner sets together. `reset` keeps that lock for its whole
//! delete-and-recreate sequence so a concurrent `get` cannot observe a
//! half-deleted location.
//!
//! Concurrent access to one location from *different processes* is
//! undefined behavior: nothing in the file format arbitrates between two
//! writing processes.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::errors::IndexResult;
use crate::file_store::FileNodeStore;
use crate::mapper::FileElementMapper;
use crate::tree::{Tree, TreeOptions};

/// Node store file name inside a location directory.
pub const TREE_FILE_NAME: &str = "spatial.rtree";

/// Element mapper file name inside a location directory.
pub const MAPPER_FILE_NAME: &str = "spatial.emap";

struct RegistryEntry {
    tree: Tree,
    owners: HashSet<String>,
}

/// Shared-ownership cache of open trees, one entry per storage location.
///
/// Construct one manager per process (or per isolated subsystem) and route
/// every open/close through it. Dropping the manager does not close the
/// registered trees; release them with [`close`](TreeManager::close).
pub struct TreeManager {
    registry: Mutex<HashMap<PathBuf, RegistryEntry>>,
}

impl TreeManager {
    pub fn new() -> TreeManager {
        TreeManager {
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the tree at `location`, opening or creating the file pair
    /// with default parameters on first access, and registers `owner`.
    /// Repeated calls return the identical instance; registering the same
    /// owner twice is a no-op.
    pub fn get(&self, location: &Path, owner: &str) -> IndexResult<Tree> {
        self.get_with_options(location, &TreeOptions::default(), owner)
    }

    /// Like [`get`](TreeManager::get), but a newly created tree uses
    /// `options`. An already existing tree keeps its persisted parameters.
    pub fn get_with_options(
        &self,
        location: &Path,
        options: &TreeOptions,
        owner: &str,
    ) -> IndexResult<Tree> {
        let key = normalize(location)?;
        let mut registry = self.registry.lock();

        if let Some(entry) = registry.get_mut(&key) {
            entry.owners.insert(owner.to_string());
            return Ok(entry.tree.clone());
        }

        let tree = open_pair(&key, options)?;
        let mut owners = HashSet::new();
        owners.insert(owner.to_string());
        registry.insert(
            key,
            RegistryEntry {
                tree: tree.clone(),
                owners,
            },
        );
        Ok(tree)
    }

    /// Deregisters `owner` from the tree at `location`. The file pair is
    /// closed only when no owners remain. Unknown locations, unknown owners
    /// and mismatched instances are logged no-ops, not errors.
    pub fn close(&self, location: &Path, tree: &Tree, owner: &str) -> IndexResult<()> {
        let key = normalize(location)?;
        let mut registry = self.registry.lock();

        let deserted = match registry.get_mut(&key) {
            Some(entry) => {
                if !entry.tree.same_instance(tree) {
                    log::warn!("close with a stale tree instance for {:?}", key);
                }
                if !entry.owners.remove(owner) {
                    log::debug!("close for unknown owner {:?} at {:?}, ignoring", owner, key);
                    return Ok(());
                }
                if !entry.owners.is_empty() {
                    log::debug!(
                        "{} owners still registered at {:?}, keeping the tree open",
                        entry.owners.len(),
                        key
                    );
                    return Ok(());
                }
                true
            }
            None => {
                log::debug!("close for unregistered location {:?}, ignoring", key);
                false
            }
        };

        if deserted {
            if let Some(entry) = registry.remove(&key) {
                entry.tree.close()?;
            }
        }
        Ok(())
    }

    /// Destroys the tree at `location` and recreates an empty pair,
    /// regardless of how many owners are registered. The fresh tree keeps
    /// the parameters of the destroyed one and has `owner` registered. The
    /// registry lock is held for the whole sequence.
    pub fn reset(&self, location: &Path, tree: &Tree, owner: &str) -> IndexResult<Tree> {
        let key = normalize(location)?;
        let mut registry = self.registry.lock();

        let options = match registry.remove(&key) {
            Some(entry) => {
                if !entry.tree.same_instance(tree) {
                    log::warn!("reset with a stale tree instance for {:?}", key);
                }
                if let Err(err) = entry.tree.close() {
                    log::warn!("closing {:?} during reset failed: {}", key, err);
                }
                entry.tree.options()
            }
            None => tree.options(),
        };

        for name in [TREE_FILE_NAME, MAPPER_FILE_NAME] {
            match fs::remove_file(key.join(name)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        let fresh = open_pair(&key, &options)?;
        let mut owners = HashSet::new();
        owners.insert(owner.to_string());
        registry.insert(
            key,
            RegistryEntry {
                tree: fresh.clone(),
                owners,
            },
        );
        Ok(fresh)
    }

    /// Number of registered locations.
    pub fn open_count(&self) -> usize {
        self.registry.lock().len()
    }
}

impl Default for TreeManager {
    fn default() -> Self {
        TreeManager::new()
    }
}

/// Registry keys must be stable whatever path spelling the caller uses.
fn normalize(location: &Path) -> IndexResult<PathBuf> {
    fs::create_dir_all(location)?;
    Ok(location.canonicalize()?)
}

fn open_pair(location: &Path, options: &TreeOptions) -> IndexResult<Tree> {
    let tree_path = location.join(TREE_FILE_NAME);
    let store = if tree_path.exists() {
        FileNodeStore::open(&tree_path, options.buffer_capacity)?
    } else {
        FileNodeStore::create(&tree_path, options)?
    };
    let mapper = FileElementMapper::open(&location.join(MAPPER_FILE_NAME))?;
    Tree::new(Box::new(store), Arc::new(mapper))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::SearchPredicate;
    use crate::envelope::Envelope;
    use tempfile::tempdir;

    fn everywhere() -> Envelope {
        Envelope::new(vec![-1e12, -1e12], vec![1e12, 1e12]).unwrap()
    }

    fn count(tree: &Tree) -> usize {
        tree.search(&everywhere(), SearchPredicate::Intersects)
            .unwrap()
            .map(|r| r.unwrap())
            .count()
    }

    #[test]
    fn test_get_creates_pair() {
        let dir = tempdir().unwrap();
        let manager = TreeManager::new();
        let tree = manager.get(dir.path(), "a").unwrap();
        assert!(dir.path().join(TREE_FILE_NAME).exists());
        assert_eq!(tree.dimension(), 2);
        manager.close(dir.path(), &tree, "a").unwrap();
    }

    #[test]
    fn test_get_returns_same_instance() {
        let dir = tempdir().unwrap();
        let manager = TreeManager::new();
        let a = manager.get(dir.path(), "owner-a").unwrap();
        let b = manager.get(dir.path(), "owner-b").unwrap();
        assert!(a.same_instance(&b));
        assert_eq!(manager.open_count(), 1);
    }

    #[test]
    fn test_close_waits_for_last_owner() {
        let dir = tempdir().unwrap();
        let manager = TreeManager::new();
        let tree = manager.get(dir.path(), "a").unwrap();
        manager.get(dir.path(), "b").unwrap();

        tree.insert(&Envelope::point(&[1.0, 2.0]).unwrap(), 1).unwrap();

        manager.close(dir.path(), &tree, "a").unwrap();
        assert!(tree.is_open());
        assert_eq!(count(&tree), 1);

        manager.close(dir.path(), &tree, "b").unwrap();
        assert!(!tree.is_open());
        assert_eq!(manager.open_count(), 0);
    }

    #[test]
    fn test_close_unknown_owner_is_noop() {
        let dir = tempdir().unwrap();
        let manager = TreeManager::new();
        let tree = manager.get(dir.path(), "a").unwrap();

        manager.close(dir.path(), &tree, "stranger").unwrap();
        assert!(tree.is_open());

        // Unregistered location is also a no-op.
        let other = tempdir().unwrap();
        manager.close(other.path(), &tree, "a").unwrap();
        assert!(tree.is_open());
    }

    #[test]
    fn test_idempotent_owner_registration() {
        let dir = tempdir().unwrap();
        let manager = TreeManager::new();
        let tree = manager.get(dir.path(), "a").unwrap();
        manager.get(dir.path(), "a").unwrap();

        // One close must fully release the single registered owner.
        manager.close(dir.path(), &tree, "a").unwrap();
        assert!(!tree.is_open());
    }

    #[test]
    fn test_roundtrip_through_reopen() {
        let dir = tempdir().unwrap();
        let manager = TreeManager::new();

        let tree = manager.get(dir.path(), "writer").unwrap();
        for i in 0..50u64 {
            let p = Envelope::point(&[(i % 10) as f64, (i / 10) as f64]).unwrap();
            tree.insert(&p, i).unwrap();
        }
        manager.close(dir.path(), &tree, "writer").unwrap();

        let reopened = manager.get(dir.path(), "reader").unwrap();
        assert!(!reopened.same_instance(&tree));
        assert_eq!(reopened.len().unwrap(), 50);
        assert_eq!(count(&reopened), 50);
        reopened.verify().unwrap();
        manager.close(dir.path(), &reopened, "reader").unwrap();
    }

    #[test]
    fn test_reset_with_active_owner() {
        let dir = tempdir().unwrap();
        let manager = TreeManager::new();

        let tree = manager.get(dir.path(), "a").unwrap();
        tree.insert(&Envelope::point(&[5.0, 5.0]).unwrap(), 1).unwrap();

        let fresh = manager.reset(dir.path(), &tree, "a").unwrap();
        assert!(!fresh.same_instance(&tree));
        assert!(!tree.is_open());
        assert_eq!(count(&fresh), 0);
        assert_eq!(fresh.len().unwrap(), 0);

        // The fresh tree is registered and usable.
        fresh.insert(&Envelope::point(&[1.0, 1.0]).unwrap(), 2).unwrap();
        manager.close(dir.path(), &fresh, "a").unwrap();
    }

    #[test]
    fn test_reset_keeps_parameters() {
        let dir = tempdir().unwrap();
        let manager = TreeManager::new();
        let options = TreeOptions {
            dimension: 3,
            max_elements: 8,
            ..TreeOptions::default()
        };
        let tree = manager
            .get_with_options(dir.path(), &options, "a")
            .unwrap();
        let fresh = manager.reset(dir.path(), &tree, "a").unwrap();
        assert_eq!(fresh.dimension(), 3);
        assert_eq!(fresh.max_elements(), 8);
    }

    #[test]
    fn test_concurrent_get_and_search() {
        let dir = tempdir().unwrap();
        let manager = Arc::new(TreeManager::new());
        let seed = manager.get(dir.path(), "seed").unwrap();
        for i in 0..200u64 {
            let p = Envelope::point(&[(i % 20) as f64, (i / 20) as f64]).unwrap();
            seed.insert(&p, i).unwrap();
        }

        let mut handles = Vec::new();
        for t in 0..4 {
            let manager = Arc::clone(&manager);
            let location = dir.path().to_path_buf();
            handles.push(std::thread::spawn(move || {
                let owner = format!("reader-{}", t);
                let tree = manager.get(&location, &owner).unwrap();
                for _ in 0..20 {
                    let found = tree
                        .search(&everywhere(), SearchPredicate::Intersects)
                        .unwrap()
                        .map(|r| r.unwrap())
                        .count();
                    assert_eq!(found, 200);
                }
                manager.close(&location, &tree, &owner).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(seed.is_open());
        manager.close(dir.path(), &seed, "seed").unwrap();
    }
}

//! Element mappers: the collaborator that owns id translation.
//!
//! The tree stores opaque element ids and returns them unchanged; whatever
//! those ids mean (documents, features, rows) is the mapper's business. The
//! tree consults its mapper for authoritative envelopes when it reinserts
//! entries while condensing, and closes it together with itself.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::errors::{IndexError, IndexResult};
use crate::types::ElementId;

/// Translates opaque element ids back to their envelopes.
///
/// Implementations are external collaborators (a document store, a full-text
/// index, ...). [`envelope_of`](ElementMapper::envelope_of) returns `None`
/// for an id the mapper does not know; the tree then falls back to the
/// envelope it has stored. A mapper lives exactly as long as its tree.
pub trait ElementMapper: Send + Sync {
    fn envelope_of(&self, element_id: ElementId) -> IndexResult<Option<Envelope>>;

    fn close(&self) -> IndexResult<()>;
}

/// Mapper that knows nothing. For trees whose callers keep id translation
/// entirely on their side.
pub struct NullElementMapper;

impl ElementMapper for NullElementMapper {
    fn envelope_of(&self, _element_id: ElementId) -> IndexResult<Option<Envelope>> {
        Ok(None)
    }

    fn close(&self) -> IndexResult<()> {
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Default)]
struct MapperTable {
    entries: Vec<(ElementId, Envelope)>,
}

/// Minimal file-backed mapper: an id → envelope table persisted next to the
/// node store file. The owning store maintains it through
/// [`record`](FileElementMapper::record) and
/// [`forget`](FileElementMapper::forget); the whole table is loaded on open
/// and written back on flush and close.
pub struct FileElementMapper {
    state: RwLock<MapperState>,
}

struct MapperState {
    path: PathBuf,
    entries: HashMap<ElementId, Envelope>,
    dirty: bool,
    closed: bool,
}

impl FileElementMapper {
    /// Opens the table at `path`, creating an empty one when the file does
    /// not exist yet.
    pub fn open(path: &Path) -> IndexResult<FileElementMapper> {
        let entries = if path.exists() {
            let mut bytes = Vec::new();
            OpenOptions::new()
                .read(true)
                .open(path)?
                .read_to_end(&mut bytes)?;
            if bytes.is_empty() {
                HashMap::new()
            } else {
                let (table, _): (MapperTable, usize) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())
                        .map_err(|e| {
                            IndexError::format(format!("corrupt element mapper file: {}", e))
                        })?;
                table.entries.into_iter().collect()
            }
        } else {
            HashMap::new()
        };

        Ok(FileElementMapper {
            state: RwLock::new(MapperState {
                path: path.to_path_buf(),
                entries,
                dirty: false,
                closed: false,
            }),
        })
    }

    /// Records or replaces the envelope of an element.
    pub fn record(&self, element_id: ElementId, envelope: Envelope) -> IndexResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state.entries.insert(element_id, envelope);
        state.dirty = true;
        Ok(())
    }

    /// Drops an element from the table.
    pub fn forget(&self, element_id: ElementId) -> IndexResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        if state.entries.remove(&element_id).is_some() {
            state.dirty = true;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the table back to its file.
    pub fn flush(&self) -> IndexResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state.flush_table()
    }
}

impl MapperState {
    fn ensure_open(&self) -> IndexResult<()> {
        if self.closed {
            Err(IndexError::argument("element mapper is closed"))
        } else {
            Ok(())
        }
    }

    fn flush_table(&mut self) -> IndexResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut entries: Vec<(ElementId, Envelope)> =
            self.entries.iter().map(|(&id, env)| (id, env.clone())).collect();
        entries.sort_by_key(|(id, _)| *id);
        let table = MapperTable { entries };
        let bytes = bincode::serde::encode_to_vec(&table, bincode::config::legacy())
            .map_err(|e| IndexError::format(format!("element mapper encoding failed: {}", e)))?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        self.dirty = false;
        Ok(())
    }
}

impl ElementMapper for FileElementMapper {
    fn envelope_of(&self, element_id: ElementId) -> IndexResult<Option<Envelope>> {
        let state = self.state.read();
        state.ensure_open()?;
        Ok(state.entries.get(&element_id).cloned())
    }

    fn close(&self) -> IndexResult<()> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }
        state.flush_table()?;
        state.closed = true;
        Ok(())
    }
}

impl Drop for FileElementMapper {
    fn drop(&mut self) {
        let mut state = self.state.write();
        if !state.closed {
            let _ = state.flush_table();
        }
    }
}

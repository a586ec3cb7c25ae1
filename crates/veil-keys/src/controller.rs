//! Lifecycle contract shared by the persistable entities.
//!
//! Exactly two kinds are persisted per client id: the key store and the
//! runtime store owned by the session layer. Both live under
//! `<root>/<id>/`.

use std::io::ErrorKind;
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerKind {
    Keys,
    Store,
}

impl ControllerKind {
    pub const ALL: [ControllerKind; 2] = [ControllerKind::Keys, ControllerKind::Store];

    pub fn file_name(self) -> &'static str {
        match self {
            ControllerKind::Keys => "keys.bin",
            ControllerKind::Store => "store.bin",
        }
    }
}

/// Whether a save blocks until the snapshot is durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// Schedule the write and return immediately.
    Async,
    /// Write before returning.
    Sync,
}

pub trait Controller {
    const KIND: ControllerKind;

    fn id(&self) -> u32;

    /// Persist a full snapshot.
    fn save(&self, mode: SaveMode) -> Result<()>;

    /// Entity-specific partial reset of in-memory state.
    fn clear(&self);

    /// Remove the persisted snapshot. In-memory state is untouched.
    fn delete(&self) -> Result<()>;
}

/// Ids with persisted state under `root`: every direct child whose name
/// parses as an id. Other entries are skipped, a missing root yields none.
pub fn known_ids(root: &Path) -> Result<Vec<u32>> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

//! Append-only tables consulted by later lowering stages.
//!
//! `RegistrationTable` maps an ensemble to the buffers threaded through
//! the predict function; `CacheTable` maps a cache directive to the
//! block-shared scratch buffer it staged. Entries are inserted once and
//! never updated.

use std::collections::BTreeMap;

use super::layout::LayoutPlan;
use super::{DirectiveId, EnsembleId};
use crate::diagnostic::Diagnostic;
use crate::ir::{BufferType, Value};
use crate::model::{Packing, TreeType};

/// A buffer appended to the predict function's parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct BufferSlot {
    pub value: Value,
    pub ty: BufferType,
    pub arg_index: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnsembleLoweringInfo {
    pub model: BufferSlot,
    pub offsets: BufferSlot,
    pub lengths: BufferSlot,
    pub class_info: BufferSlot,
    /// Tiled representations only.
    pub lookup_table: Option<BufferSlot>,
    pub plan: LayoutPlan,
    /// Largest per-tree tile count, from the length table.
    pub max_tree_length: i64,
    pub tree_type: TreeType,
    pub packing: Packing,
}

impl EnsembleLoweringInfo {
    /// Every buffer in parameter order.
    pub fn slots(&self) -> Vec<&BufferSlot> {
        let mut slots = vec![&self.model, &self.offsets, &self.lengths, &self.class_info];
        slots.extend(self.lookup_table.as_ref());
        slots
    }
}

#[derive(Default)]
pub struct RegistrationTable {
    entries: BTreeMap<EnsembleId, EnsembleLoweringInfo>,
}

impl RegistrationTable {
    pub fn insert(&mut self, id: EnsembleId, info: EnsembleLoweringInfo) -> Result<(), Diagnostic> {
        if self.entries.contains_key(&id) {
            return Err(Diagnostic::fatal(format!(
                "ensemble {} already has model buffers",
                id
            )));
        }
        self.entries.insert(id, info);
        Ok(())
    }

    pub fn get(&self, id: EnsembleId) -> Result<&EnsembleLoweringInfo, Diagnostic> {
        self.entries.get(&id).ok_or_else(|| {
            Diagnostic::fatal(format!("ensemble {} has no model buffers", id))
                .with_help("generate the model globals before lowering tree accesses".to_string())
        })
    }

    pub fn contains(&self, id: EnsembleId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scratch buffer staged for one cache directive.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub ensemble: EnsembleId,
    /// Module global backing the scratch buffer.
    pub global: String,
    pub buffer: Value,
    pub buffer_ty: BufferType,
    /// First cached tree, as a run-time index.
    pub start_tree: Value,
    /// `[start_index, end_index)` of the model buffer, in tiles.
    pub start_index: Value,
    pub end_index: Value,
    pub capacity: usize,
}

#[derive(Default)]
pub struct CacheTable {
    entries: BTreeMap<DirectiveId, CacheEntry>,
}

impl CacheTable {
    pub fn insert(&mut self, id: DirectiveId, entry: CacheEntry) -> Result<(), Diagnostic> {
        if self.entries.contains_key(&id) {
            return Err(Diagnostic::fatal(format!(
                "cache directive {} was already lowered",
                id
            )));
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    pub fn get(&self, id: DirectiveId) -> Result<&CacheEntry, Diagnostic> {
        self.entries.get(&id).ok_or_else(|| {
            Diagnostic::fatal(format!("no cache entry for directive {}", id))
                .with_note("a cached tree was read before its cache directive was lowered".to_string())
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

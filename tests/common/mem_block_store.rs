/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A simple, volatile, in-memory implementation of [`BlockStore`].

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use tendermint_rs::{
    pluggables::BlockStore,
    types::{
        block::{Block, BlockMeta},
        commit::{Commit, ExtendedCommit},
        data_types::Height,
        part_set::{Part, PartSet},
    },
};

#[derive(Clone)]
struct StoredBlock {
    block: Block,
    parts: PartSet,
    seen_commit: Commit,
    extended_commit: Option<ExtendedCommit>,
}

/// An in-memory implementation of [`BlockStore`]. Clones share the same blocks.
#[derive(Clone, Default)]
pub(crate) struct MemBlockStore(Arc<Mutex<BTreeMap<Height, StoredBlock>>>);

impl MemBlockStore {
    /// Create a new, empty `MemBlockStore`.
    pub(crate) fn new() -> MemBlockStore {
        MemBlockStore::default()
    }

    fn get(&self, height: Height) -> Option<StoredBlock> {
        self.0.lock().unwrap().get(&height).cloned()
    }

    fn insert(&self, block: &Block, parts: &PartSet, seen_commit: Commit, extended_commit: Option<ExtendedCommit>) {
        self.0.lock().unwrap().insert(
            block.height(),
            StoredBlock {
                block: block.clone(),
                parts: parts.clone(),
                seen_commit,
                extended_commit,
            },
        );
    }
}

impl BlockStore for MemBlockStore {
    fn save_block(&mut self, block: &Block, parts: &PartSet, seen_commit: &Commit) {
        self.insert(block, parts, seen_commit.clone(), None)
    }

    fn save_block_with_extended_commit(
        &mut self,
        block: &Block,
        parts: &PartSet,
        seen_extended_commit: &ExtendedCommit,
    ) {
        self.insert(
            block,
            parts,
            seen_extended_commit.to_commit(),
            Some(seen_extended_commit.clone()),
        )
    }

    fn load_block(&self, height: Height) -> Option<Block> {
        self.get(height).map(|stored| stored.block)
    }

    fn load_block_meta(&self, height: Height) -> Option<BlockMeta> {
        self.get(height)
            .map(|stored| BlockMeta::new(&stored.block, &stored.parts))
    }

    fn load_block_part(&self, height: Height, index: u32) -> Option<Part> {
        self.get(height)
            .and_then(|stored| stored.parts.get_part(index as usize).cloned())
    }

    fn load_seen_commit(&self, height: Height) -> Option<Commit> {
        self.get(height).map(|stored| stored.seen_commit)
    }

    fn load_block_commit(&self, height: Height) -> Option<Commit> {
        self.get(height + 1).and_then(|stored| stored.block.last_commit)
    }

    fn load_block_extended_commit(&self, height: Height) -> Option<ExtendedCommit> {
        self.get(height).and_then(|stored| stored.extended_commit)
    }

    fn height(&self) -> Height {
        self.0.lock().unwrap().keys().next_back().copied().unwrap_or_default()
    }

    fn base(&self) -> Height {
        self.0.lock().unwrap().keys().next().copied().unwrap_or_default()
    }
}

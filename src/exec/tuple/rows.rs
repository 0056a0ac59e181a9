// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::row::RowConverter;

use crate::exec::agg::AggStatePtr;
use crate::exec::tuple::layout::TupleLayout;

/// Block size for row storage; also the unit the radix policy's block-fill
/// heuristic reasons about.
pub const STORAGE_BLOCK_SIZE: usize = 256 * 1024;

/// Reference to one group key's bytes inside a [`BlockStorage`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct RowKey {
    ptr: usize,
    len: usize,
}

impl RowKey {
    pub(crate) fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    #[cfg(test)]
    pub(crate) fn empty() -> Self {
        Self {
            ptr: std::ptr::NonNull::<u8>::dangling().as_ptr() as usize,
            len: 0,
        }
    }
}

/// Bump allocator over boxed blocks. Addresses are stable for the storage's
/// lifetime, including across [`BlockStorage::absorb`].
#[derive(Debug)]
pub(crate) struct BlockStorage {
    blocks: Vec<Box<[u8]>>,
    cursor: usize,
    block_size: usize,
}

impl BlockStorage {
    pub(crate) fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            cursor: 0,
            block_size: block_size.max(1),
        }
    }

    pub(crate) fn alloc_copy(&mut self, bytes: &[u8]) -> RowKey {
        let ptr = self.alloc(bytes.len(), 1);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
        }
        RowKey {
            ptr,
            len: bytes.len(),
        }
    }

    pub(crate) fn alloc_zeroed(&mut self, size: usize, align: usize) -> usize {
        self.alloc(size, align)
    }

    fn alloc(&mut self, size: usize, align: usize) -> usize {
        let align_mask = align.max(1) - 1;
        let needed = size.max(1);
        if let Some(ptr) = self.alloc_in_last_block(needed, align_mask) {
            return ptr;
        }
        // Over-allocate by align-1: block bases are only byte-aligned, so the
        // returned ADDRESS must be aligned, not the block offset.
        let block_size = self.block_size.max(needed + align_mask);
        self.blocks.push(vec![0u8; block_size].into_boxed_slice());
        self.cursor = 0;
        self.alloc_in_last_block(needed, align_mask)
            .expect("fresh storage block fits allocation")
    }

    fn alloc_in_last_block(&mut self, needed: usize, align_mask: usize) -> Option<usize> {
        let block = self.blocks.last_mut()?;
        let base = block.as_mut_ptr() as usize;
        let addr = (base + self.cursor + align_mask) & !align_mask;
        let end = addr - base + needed;
        if end > block.len() {
            return None;
        }
        self.cursor = end;
        Some(addr)
    }

    /// Move the other storage's blocks into this one. Existing pointers into
    /// either storage stay valid; future allocations continue in the absorbed
    /// tail block.
    pub(crate) fn absorb(&mut self, mut other: BlockStorage) {
        if other.blocks.is_empty() {
            return;
        }
        self.blocks.append(&mut other.blocks);
        self.cursor = other.cursor;
    }

    pub(crate) fn allocated_bytes(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }

    pub(crate) fn reset(&mut self) {
        self.blocks.clear();
        self.cursor = 0;
    }
}

/// One partition's row collection: group key bytes, hashes, and aggregate
/// state blocks. State addresses are stable for the collection's lifetime, so
/// raw state pointers collected during an insert pass stay valid.
#[derive(Debug)]
pub struct TupleRows {
    layout: Arc<TupleLayout>,
    keys: Vec<RowKey>,
    hashes: Vec<u64>,
    state_bases: Vec<AggStatePtr>,
    key_storage: BlockStorage,
    state_storage: BlockStorage,
}

impl TupleRows {
    pub fn new(layout: Arc<TupleLayout>) -> Self {
        Self {
            layout,
            keys: Vec::new(),
            hashes: Vec::new(),
            state_bases: Vec::new(),
            key_storage: BlockStorage::new(STORAGE_BLOCK_SIZE),
            state_storage: BlockStorage::new(STORAGE_BLOCK_SIZE),
        }
    }

    pub fn layout(&self) -> &Arc<TupleLayout> {
        &self.layout
    }

    pub fn count(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.key_storage.allocated_bytes()
            + self.state_storage.allocated_bytes()
            + self.keys.len() * std::mem::size_of::<RowKey>()
            + self.hashes.len() * std::mem::size_of::<u64>()
            + self.state_bases.len() * std::mem::size_of::<AggStatePtr>()
    }

    /// Append one row. With `state_src == None` the state block is freshly
    /// initialized; otherwise the source state bytes are moved in verbatim
    /// (the source row must not be destroyed afterwards).
    pub(crate) fn append_row(
        &mut self,
        key: &[u8],
        hash: u64,
        state_src: Option<AggStatePtr>,
    ) -> usize {
        let row = self.keys.len();
        let key = self.key_storage.alloc_copy(key);
        let state_width = self.layout.state_width();
        let base = self
            .state_storage
            .alloc_zeroed(state_width, self.layout.state_align());
        match state_src {
            Some(src) => unsafe {
                std::ptr::copy_nonoverlapping(src as *const u8, base as *mut u8, state_width);
            },
            None => self.layout.init_states(base),
        }
        self.keys.push(key);
        self.hashes.push(hash);
        self.state_bases.push(base);
        row
    }

    pub(crate) fn key(&self, row: usize) -> &[u8] {
        self.keys[row].as_slice()
    }

    pub(crate) fn hash(&self, row: usize) -> u64 {
        self.hashes[row]
    }

    pub fn state_base(&self, row: usize) -> AggStatePtr {
        self.state_bases[row]
    }

    pub fn state_bases(&self) -> &[AggStatePtr] {
        &self.state_bases
    }

    /// Move every row of `other` into this collection. Storage blocks are
    /// stolen, not copied, so row addresses survive the move.
    pub fn absorb(&mut self, other: TupleRows) {
        let TupleRows {
            layout: _,
            mut keys,
            mut hashes,
            mut state_bases,
            key_storage,
            state_storage,
        } = other;
        self.keys.append(&mut keys);
        self.hashes.append(&mut hashes);
        self.state_bases.append(&mut state_bases);
        self.key_storage.absorb(key_storage);
        self.state_storage.absorb(state_storage);
    }

    /// Drop all rows and storage. States are NOT destroyed; callers that need
    /// destructors run them first.
    pub fn reset(&mut self) {
        self.keys.clear();
        self.hashes.clear();
        self.state_bases.clear();
        self.key_storage.reset();
        self.state_storage.reset();
    }

    /// Run aggregate-state destructors for every row. Used at teardown when
    /// rows were retained past the scan.
    pub fn destroy_all_states(&self) {
        self.layout.destroy_states(&self.state_bases);
    }

    pub fn init_scan(&self) -> Result<TupleScanState, String> {
        Ok(TupleScanState {
            converter: self.layout.row_converter()?,
            next: 0,
        })
    }

    /// Pull up to `max_rows` rows: decoded group columns plus the rows' state
    /// base pointers. Returns `None` once exhausted. Row order is stable
    /// across calls.
    pub fn scan(
        &self,
        state: &mut TupleScanState,
        max_rows: usize,
    ) -> Result<Option<(Vec<ArrayRef>, Vec<AggStatePtr>)>, String> {
        if state.next >= self.keys.len() {
            return Ok(None);
        }
        let start = state.next;
        let end = (start + max_rows.max(1)).min(self.keys.len());
        let parser = state.converter.parser();
        let rows = (start..end)
            .map(|row| parser.parse(self.key(row)))
            .collect::<Vec<_>>();
        let columns = state
            .converter
            .convert_rows(rows)
            .map_err(|e| e.to_string())?;
        let bases = self.state_bases[start..end].to_vec();
        state.next = end;
        Ok(Some((columns, bases)))
    }
}

// Row data is plain bytes addressed through raw pointers; ownership is
// per-collection and transfers with it.
unsafe impl Send for TupleRows {}
unsafe impl Sync for TupleRows {}

/// Cursor over a [`TupleRows`] collection.
pub struct TupleScanState {
    converter: RowConverter,
    next: usize,
}

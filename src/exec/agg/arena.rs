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
use std::sync::{Arc, Mutex};

use super::AggStatePtr;

#[derive(Debug)]
struct ArenaBlocks {
    blocks: Vec<Box<[u8]>>,
    cursor: usize,
    block_size: usize,
}

impl ArenaBlocks {
    fn alloc(&mut self, size: usize, align: usize) -> AggStatePtr {
        let align_mask = align.max(1) - 1;
        let needed = size.max(1);
        if let Some(ptr) = self.alloc_in_last_block(needed, align_mask) {
            return ptr;
        }
        // Over-allocate by align-1: block bases are only byte-aligned, so the
        // returned ADDRESS must be aligned, not the block offset.
        let block_size = self.block_size.max(needed + align_mask);
        self.blocks.push(vec![0u8; block_size].into_boxed_slice());
        self.block_size = self.block_size.max(block_size);
        self.cursor = 0;
        self.alloc_in_last_block(needed, align_mask)
            .expect("fresh arena block fits allocation")
    }

    fn alloc_in_last_block(&mut self, needed: usize, align_mask: usize) -> Option<AggStatePtr> {
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
}

/// Shared block arena that aggregate states park variable-width data in.
///
/// States hold raw pointers into the arena, so the arena must outlive every
/// state that references it. The engine guarantees this by transferring
/// allocators to a global keepalive list when a hash table is combined away.
#[derive(Clone, Debug)]
pub struct AggAllocator {
    inner: Arc<Mutex<ArenaBlocks>>,
}

impl AggAllocator {
    pub fn new(block_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ArenaBlocks {
                blocks: Vec::new(),
                cursor: 0,
                block_size: block_size.max(1),
            })),
        }
    }

    /// Allocate `size` zeroed bytes at the requested alignment. The returned
    /// address is stable for the arena's lifetime.
    pub fn alloc(&self, size: usize, align: usize) -> AggStatePtr {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.alloc(size, align)
    }

    /// Copy `bytes` into the arena and return the stable address of the copy.
    pub fn alloc_copy(&self, bytes: &[u8]) -> AggStatePtr {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let ptr = inner.alloc(bytes.len(), 1);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
        }
        ptr
    }

    pub fn allocated_bytes(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.blocks.iter().map(|b| b.len()).sum()
    }
}

impl Default for AggAllocator {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

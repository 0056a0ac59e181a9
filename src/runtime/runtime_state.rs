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

use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::temp_memory::TempMemoryManager;

/// Default query memory limit when the embedder does not configure one.
pub const DEFAULT_MEMORY_LIMIT: usize = 2 * 1024 * 1024 * 1024;

/// Per-query execution context.
///
/// Provides the knobs the aggregation engine reads at runtime: the worker
/// thread count, the query memory limit, the temporary-memory manager the
/// engine reserves intermediate memory from, and the root memory tracker.
#[derive(Debug)]
pub struct RuntimeState {
    num_threads: usize,
    memory_limit: usize,
    temp_memory_manager: Arc<TempMemoryManager>,
    mem_tracker: Arc<MemTracker>,
}

impl RuntimeState {
    pub fn new(num_threads: usize, memory_limit: usize) -> Self {
        Self {
            num_threads: num_threads.max(1),
            memory_limit,
            temp_memory_manager: TempMemoryManager::new(memory_limit),
            mem_tracker: MemTracker::new_root("query"),
        }
    }

    pub fn number_of_threads(&self) -> usize {
        self.num_threads
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    pub fn temp_memory_manager(&self) -> &Arc<TempMemoryManager> {
        &self.temp_memory_manager
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(num_threads, DEFAULT_MEMORY_LIMIT)
    }
}

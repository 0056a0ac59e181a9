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
//! Radix partitioning policy for the aggregation sink.
//!
//! Chooses how many radix partitions local hash tables produce, how large the
//! sink probe tables are, and which bit count an external (spilling)
//! aggregation escalates to. `sink_radix_bits` only ever increases; the
//! escalation itself is driven through the global sink state, which rechecks
//! under its lock (double-checked locking, see the sink module).

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::common::util::{next_power_of_two, radix_bits_for};
use crate::exec::hash_table::grouped::{ENTRY_SLOT_SIZE, LOAD_FACTOR, MINIMUM_CAPACITY};

/// Assumed per-core L1 cache available to one worker.
const L1_CACHE_SIZE: usize = 16 * 1024;
/// Assumed per-core L2 cache available to one worker.
const L2_CACHE_SIZE: usize = 512 * 1024;
/// Assumed shared L3 cache per core.
const L3_CACHE_SIZE: usize = 768 * 1024;

/// Sink radix bits to initialize with.
const MAXIMUM_INITIAL_SINK_RADIX_BITS: usize = 3;
/// Maximum sink radix bits (independent of threads).
const MAXIMUM_FINAL_SINK_RADIX_BITS: usize = 7;
/// By how many radix bits to increment when going external.
const EXTERNAL_RADIX_BITS_INCREMENT: usize = 3;

/// If partitions fill this many blocks on average, a repartition triggers.
pub(crate) const BLOCK_FILL_FACTOR: f64 = 1.8;
/// By how many bits to repartition when the block-fill threshold is crossed.
pub(crate) const REPARTITION_RADIX_BITS: usize = 2;

pub struct RadixAggConfig {
    /// Current thread-global sink radix bits.
    sink_radix_bits: AtomicUsize,
    /// Maximum sink radix bits (set based on number of threads).
    maximum_sink_radix_bits: usize,
    /// Radix bits if we go external.
    external_radix_bits: usize,
    /// Capacity of local hash tables during the sink.
    pub sink_capacity: usize,
}

impl RadixAggConfig {
    pub fn new(num_threads: usize) -> Self {
        let maximum_sink_radix_bits = Self::maximum_sink_radix_bits(num_threads);
        Self {
            sink_radix_bits: AtomicUsize::new(Self::initial_sink_radix_bits(num_threads)),
            maximum_sink_radix_bits,
            external_radix_bits: Self::external_radix_bits(maximum_sink_radix_bits),
            sink_capacity: Self::sink_capacity(num_threads),
        }
    }

    pub fn radix_bits(&self) -> usize {
        self.sink_radix_bits.load(Ordering::Acquire)
    }

    pub(crate) fn store_radix_bits(&self, radix_bits: usize) {
        self.sink_radix_bits.store(radix_bits, Ordering::Release);
    }

    pub(crate) fn maximum_sink_radix_bits_value(&self) -> usize {
        self.maximum_sink_radix_bits
    }

    pub(crate) fn external_radix_bits_value(&self) -> usize {
        self.external_radix_bits
    }

    fn initial_sink_radix_bits(num_threads: usize) -> usize {
        radix_bits_for(next_power_of_two(num_threads)).min(MAXIMUM_INITIAL_SINK_RADIX_BITS)
    }

    fn maximum_sink_radix_bits(num_threads: usize) -> usize {
        radix_bits_for(next_power_of_two(num_threads)).min(MAXIMUM_FINAL_SINK_RADIX_BITS)
    }

    fn external_radix_bits(maximum_sink_radix_bits: usize) -> usize {
        (maximum_sink_radix_bits + EXTERNAL_RADIX_BITS_INCREMENT).min(MAXIMUM_FINAL_SINK_RADIX_BITS)
    }

    fn sink_capacity(num_threads: usize) -> usize {
        // Cache available to one worker, assuming L3 is shared evenly.
        let total_shared_cache_size = num_threads * L3_CACHE_SIZE;
        let cache_per_active_thread =
            L1_CACHE_SIZE + L2_CACHE_SIZE + total_shared_cache_size / num_threads.max(1);

        let size_per_entry = ENTRY_SLOT_SIZE as f64 * LOAD_FACTOR;
        let capacity = next_power_of_two((cache_per_active_thread as f64 / size_per_entry) as usize);

        capacity.max(MINIMUM_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_bits_scale_with_threads() {
        assert_eq!(RadixAggConfig::new(1).radix_bits(), 0);
        assert_eq!(RadixAggConfig::new(2).radix_bits(), 1);
        assert_eq!(RadixAggConfig::new(4).radix_bits(), 2);
        assert_eq!(RadixAggConfig::new(8).radix_bits(), 3);
        // Clamped at the initial maximum.
        assert_eq!(RadixAggConfig::new(64).radix_bits(), 3);
    }

    #[test]
    fn maximum_bits_clamp_at_final_limit() {
        assert_eq!(RadixAggConfig::new(4).maximum_sink_radix_bits_value(), 2);
        assert_eq!(RadixAggConfig::new(64).maximum_sink_radix_bits_value(), 6);
        assert_eq!(RadixAggConfig::new(1024).maximum_sink_radix_bits_value(), 7);
    }

    #[test]
    fn external_bits_add_increment_up_to_limit() {
        assert_eq!(RadixAggConfig::new(4).external_radix_bits_value(), 5);
        assert_eq!(RadixAggConfig::new(32).external_radix_bits_value(), 7);
        assert_eq!(RadixAggConfig::new(1024).external_radix_bits_value(), 7);
    }

    #[test]
    fn sink_capacity_is_power_of_two_with_floor() {
        for threads in [1, 2, 8, 64] {
            let config = RadixAggConfig::new(threads);
            assert!(config.sink_capacity.is_power_of_two());
            assert!(config.sink_capacity >= MINIMUM_CAPACITY);
        }
        // Cache budget is per-thread, so capacity does not shrink with more threads.
        assert_eq!(
            RadixAggConfig::new(1).sink_capacity,
            RadixAggConfig::new(16).sink_capacity
        );
    }
}

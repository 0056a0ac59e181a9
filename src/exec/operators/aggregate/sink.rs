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
//! Sink phase: per-thread ingestion, adaptive repartitioning, combine, and
//! finalize.
//!
//! Every worker accumulates into its own hash table and only coordinates on
//! two policy decisions: raising the global radix-bit count and switching the
//! aggregation external. Both go through double-checked locking on the global
//! sink lock; once any worker has combined, the bit count is frozen.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::common::util::{AtomicF64, radix_bits_for};
use crate::exec::agg::AggAllocator;
use crate::exec::chunk::Chunk;
use crate::exec::hash_table::GroupedAggHashTable;
use crate::exec::hash_table::grouped::{ENTRY_SLOT_SIZE, LOAD_FACTOR};
use crate::exec::interrupt::InterruptHandle;
use crate::exec::operators::aggregate::RadixAggregation;
use crate::exec::operators::aggregate::config::{
    BLOCK_FILL_FACTOR, RadixAggConfig, REPARTITION_RADIX_BITS,
};
use crate::exec::tuple::partitioned::radix_partition_count;
use crate::exec::tuple::rows::STORAGE_BLOCK_SIZE;
use crate::exec::tuple::{PartitionedTupleRows, TupleLayout, TupleRows};
use crate::radixagg_logging::debug;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::runtime_state::RuntimeState;
use crate::runtime::temp_memory::TempMemoryState;

/// What scanning a partition does to its rows once the scan is done.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanPinProperty {
    /// Single-shot: aggregate states are destroyed while scanning and the
    /// partition's rows are dropped afterwards.
    DestroyAfterDone,
    /// Multi-scan: rows are retained so the partition can be scanned again.
    UnpinAfterDone,
}

impl ScanPinProperty {
    fn to_u8(self) -> u8 {
        match self {
            ScanPinProperty::DestroyAfterDone => 0,
            ScanPinProperty::UnpinAfterDone => 1,
        }
    }

    fn from_u8(value: u8) -> Self {
        if value == 0 {
            ScanPinProperty::DestroyAfterDone
        } else {
            ScanPinProperty::UnpinAfterDone
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AggregatePartitionState {
    /// Can be finalized.
    ReadyToFinalize,
    /// Finalize is in progress.
    FinalizeInProgress,
    /// Finalized, ready to scan.
    ReadyToScan,
}

pub(crate) struct PartitionSync {
    pub(crate) state: AggregatePartitionState,
    pub(crate) blocked_tasks: Vec<InterruptHandle>,
}

/// One radix bucket's rows in the source phase, with its own state machine.
pub struct AggregatePartition {
    pub(crate) sync: Mutex<PartitionSync>,
    pub(crate) data: Mutex<Option<Arc<TupleRows>>>,
    pub(crate) progress: AtomicF64,
}

impl AggregatePartition {
    fn new(rows: TupleRows, ready_to_scan: bool) -> Self {
        Self {
            sync: Mutex::new(PartitionSync {
                state: if ready_to_scan {
                    AggregatePartitionState::ReadyToScan
                } else {
                    AggregatePartitionState::ReadyToFinalize
                },
                blocked_tasks: Vec::new(),
            }),
            data: Mutex::new(Some(Arc::new(rows))),
            progress: AtomicF64::new(if ready_to_scan { 1.0 } else { 0.0 }),
        }
    }
}

pub(crate) struct SinkInner {
    pub(crate) uncombined_data: Option<PartitionedTupleRows>,
    pub(crate) stored_allocators: Vec<AggAllocator>,
}

pub struct RadixAggGlobalSinkState {
    /// Temporary memory state for managing this aggregation's memory usage.
    temp_memory_state: Arc<TempMemoryState>,
    /// Config for partitioning.
    pub(crate) config: RadixAggConfig,
    /// Whether finalize has run.
    finalized: AtomicBool,
    /// Whether we are doing an external aggregation.
    pub(crate) external: AtomicBool,
    /// Threads that have called sink.
    pub(crate) active_threads: AtomicUsize,
    /// Whether any thread has called combine.
    pub(crate) any_combined: AtomicBool,
    /// Guards `uncombined_data` / `stored_allocators` and the policy
    /// double-check.
    pub(crate) inner: Mutex<SinkInner>,
    /// Partitions that are finalized during the source phase.
    pub(crate) partitions: OnceLock<Vec<Arc<AggregatePartition>>>,
    /// Finalize tasks completed.
    pub(crate) finalize_done: AtomicUsize,
    scan_pin: AtomicU8,
    pub(crate) count_before_combining: AtomicUsize,
    /// Worst-case single-partition footprint, set by finalize.
    pub(crate) max_partition_size: AtomicUsize,
    layout: Arc<TupleLayout>,
    mem_tracker: Arc<MemTracker>,
}

impl RadixAggGlobalSinkState {
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    pub fn is_external(&self) -> bool {
        self.external.load(Ordering::Acquire)
    }

    pub fn radix_bits(&self) -> usize {
        self.config.radix_bits()
    }

    pub(crate) fn temp_memory_state(&self) -> &Arc<TempMemoryState> {
        &self.temp_memory_state
    }

    pub(crate) fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub(crate) fn scan_pin(&self) -> ScanPinProperty {
        ScanPinProperty::from_u8(self.scan_pin.load(Ordering::Acquire))
    }

    fn set_scan_pin(&self, property: ScanPinProperty) {
        self.scan_pin.store(property.to_u8(), Ordering::Release);
    }

    /// Raise the sink radix bits, clamped to the maximum. No-op once any
    /// worker has combined, or if the bits would not increase.
    pub fn set_radix_bits(&self, radix_bits: usize) {
        self.set_radix_bits_internal(
            radix_bits.min(self.config.maximum_sink_radix_bits_value()),
            false,
        );
    }

    /// Switch to the external bit count and flag the aggregation external.
    /// Returns whether the aggregation is external afterwards (regardless of
    /// which thread flipped it).
    pub fn set_radix_bits_to_external(&self) -> bool {
        self.set_radix_bits_internal(self.config.external_radix_bits_value(), true);
        self.external.load(Ordering::Acquire)
    }

    fn set_radix_bits_internal(&self, radix_bits: usize, external: bool) {
        if self.config.radix_bits() >= radix_bits || self.any_combined.load(Ordering::Acquire) {
            return;
        }

        let _guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if self.config.radix_bits() >= radix_bits || self.any_combined.load(Ordering::Acquire) {
            return;
        }

        if external {
            self.external.store(true, Ordering::Release);
        }
        debug!(
            "sink radix bits {} -> {} (external={})",
            self.config.radix_bits(),
            radix_bits,
            external
        );
        self.config.store_radix_bits(radix_bits);
    }

    /// Destroys remaining aggregate states (multi-scan teardown only).
    fn destroy(&self) {
        if self.scan_pin() == ScanPinProperty::DestroyAfterDone
            || self.count_before_combining.load(Ordering::Acquire) == 0
        {
            // Already destroyed inline during the scan, or empty.
            return;
        }
        let Some(partitions) = self.partitions.get() else {
            return;
        };
        if partitions.is_empty() || !self.layout.has_destructor() {
            return;
        }
        for partition in partitions {
            let mut data = partition.data.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(rows) = data.take() {
                if rows.count() != 0 {
                    rows.destroy_all_states();
                }
            }
        }
    }
}

impl Drop for RadixAggGlobalSinkState {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Per-worker sink state.
pub struct RadixAggLocalSinkState {
    /// Thread-local hash table, created on the worker's first batch.
    pub(crate) ht: Option<GroupedAggHashTable>,
    /// Partitioned data given up when going external; combined back in at the
    /// end of the sink.
    pub(crate) abandoned_data: Option<PartitionedTupleRows>,
}

impl RadixAggregation {
    pub fn get_global_sink_state(&self, rt: &RuntimeState) -> RadixAggGlobalSinkState {
        let config = RadixAggConfig::new(rt.number_of_threads());
        let temp_memory_state = rt.temp_memory_manager().register();

        // Estimate one worker's sink footprint: partitioned row blocks plus
        // the probe table.
        let row_width = self.layout().row_width().max(1);
        let tuples_per_block = (STORAGE_BLOCK_SIZE / row_width).max(1);
        let ht_count = (config.sink_capacity as f64 * LOAD_FACTOR) as usize;
        let num_partitions = radix_partition_count(config.radix_bits());
        let count_per_partition = ht_count / num_partitions;
        let blocks_per_partition = (count_per_partition + tuples_per_block) / tuples_per_block + 1;
        let ht_size =
            blocks_per_partition * STORAGE_BLOCK_SIZE + config.sink_capacity * ENTRY_SLOT_SIZE;

        // This really is the minimum reservation we can do.
        let minimum_reservation = rt.number_of_threads() * ht_size;
        temp_memory_state.set_minimum_reservation(minimum_reservation);
        temp_memory_state.set_remaining_size(minimum_reservation);

        RadixAggGlobalSinkState {
            temp_memory_state,
            config,
            finalized: AtomicBool::new(false),
            external: AtomicBool::new(false),
            active_threads: AtomicUsize::new(0),
            any_combined: AtomicBool::new(false),
            inner: Mutex::new(SinkInner {
                uncombined_data: None,
                stored_allocators: Vec::new(),
            }),
            partitions: OnceLock::new(),
            finalize_done: AtomicUsize::new(0),
            scan_pin: AtomicU8::new(ScanPinProperty::DestroyAfterDone.to_u8()),
            count_before_combining: AtomicUsize::new(0),
            max_partition_size: AtomicUsize::new(0),
            layout: Arc::clone(self.layout()),
            mem_tracker: MemTracker::new_child("RadixAggregation", rt.mem_tracker()),
        }
    }

    pub fn get_local_sink_state(&self) -> RadixAggLocalSinkState {
        RadixAggLocalSinkState {
            ht: None,
            abandoned_data: None,
        }
    }

    /// Append one batch: `chunk` carries the group-by columns, `payload` the
    /// aggregate inputs, `filter` an optional row selection.
    pub fn sink(
        &self,
        _rt: &RuntimeState,
        gstate: &RadixAggGlobalSinkState,
        lstate: &mut RadixAggLocalSinkState,
        chunk: &Chunk,
        payload: &Chunk,
        filter: Option<&[usize]>,
    ) -> Result<(), String> {
        if lstate.ht.is_none() {
            let mut ht = self.create_ht(gstate.config.sink_capacity, gstate.config.radix_bits())?;
            ht.set_mem_tracker(MemTracker::new_child("SinkHashTable", gstate.mem_tracker()));
            lstate.ht = Some(ht);
            gstate.active_threads.fetch_add(1, Ordering::AcqRel);
        }

        let group_arrays = self.populate_group_arrays(chunk)?;
        let batch_size = chunk.len();
        {
            let ht = lstate.ht.as_mut().ok_or_else(|| "local sink hash table missing".to_string())?;
            ht.add_chunk(&group_arrays, payload.columns(), filter)?;

            if ht.count() + batch_size < ht.resize_threshold() {
                return Ok(()); // We can fit another batch.
            }
        }

        let active_threads = gstate.active_threads.load(Ordering::Acquire);
        if active_threads > 2 {
            // 'Reset' the table without taking its data; we can keep appending
            // to the same collection. This only works because the sink never
            // resizes the probe table.
            let ht = lstate.ht.as_mut().ok_or_else(|| "local sink hash table missing".to_string())?;
            ht.clear_probe_table();
            ht.reset_count();
            // Not worth doing on 1 or 2 threads.
        }

        let repartitioned = maybe_repartition(self, gstate, lstate, active_threads)?;

        if repartitioned {
            let ht = lstate.ht.as_mut().ok_or_else(|| "local sink hash table missing".to_string())?;
            if ht.count() != 0 {
                // Repartitioned on 1 or 2 threads, where we did not pre-reset.
                ht.clear_probe_table();
                ht.reset_count();
            }
        }
        Ok(())
    }

    /// End-of-input per worker: repartition to the final bit count and hand
    /// the worker's data off to the global state.
    pub fn combine(
        &self,
        _rt: &RuntimeState,
        gstate: &RadixAggGlobalSinkState,
        lstate: &mut RadixAggLocalSinkState,
    ) -> Result<(), String> {
        if lstate.ht.is_none() {
            return Ok(());
        }

        // Publish before the final repartition check so the bit count freezes.
        gstate.any_combined.store(true, Ordering::Release);
        let active_threads = gstate.active_threads.load(Ordering::Acquire);
        maybe_repartition(self, gstate, lstate, active_threads)?;

        let ht = lstate
            .ht
            .as_mut()
            .ok_or_else(|| "local sink hash table missing".to_string())?;
        ht.unpin_data();

        let data = ht.take_partitioned_data();
        match lstate.abandoned_data.as_mut() {
            Some(abandoned_data) => {
                debug_assert!(gstate.is_external());
                abandoned_data.combine(data)?;
            }
            None => lstate.abandoned_data = Some(data),
        }
        let abandoned_data = lstate
            .abandoned_data
            .take()
            .ok_or_else(|| "abandoned data missing".to_string())?;

        let mut inner = gstate.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.uncombined_data.as_mut() {
            Some(uncombined_data) => uncombined_data.combine(abandoned_data)?,
            None => inner.uncombined_data = Some(abandoned_data),
        }
        // Aggregate states may point into this worker's arena; keep it alive.
        inner.stored_allocators.push(ht.allocator());
        Ok(())
    }

    /// Single-threaded, once every worker has combined: split the uncombined
    /// data into per-partition containers and size the source-phase
    /// reservation.
    pub fn finalize(
        &self,
        rt: &RuntimeState,
        gstate: &RadixAggGlobalSinkState,
    ) -> Result<(), String> {
        let uncombined_data = {
            let mut inner = gstate.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.uncombined_data.take()
        };

        let mut partitions = Vec::new();
        let mut max_partition_size = 0usize;
        if let Some(uncombined_data) = uncombined_data {
            gstate
                .count_before_combining
                .store(uncombined_data.count(), Ordering::Release);

            // All done by a single thread in a single table: nothing to
            // combine per partition.
            let single_ht =
                !gstate.is_external() && gstate.active_threads.load(Ordering::Acquire) == 1;

            let parts = uncombined_data.take_partitions();
            partitions.reserve(parts.len());
            for rows in parts {
                let partition_size = rows.size_in_bytes()
                    + GroupedAggHashTable::capacity_for_count(rows.count()) * ENTRY_SLOT_SIZE;
                max_partition_size = max_partition_size.max(partition_size);
                partitions.push(Arc::new(AggregatePartition::new(rows, single_ht)));
            }
            if single_ht {
                gstate.finalize_done.store(partitions.len(), Ordering::Release);
            }
        } else {
            gstate.count_before_combining.store(0, Ordering::Release);
        }

        gstate
            .max_partition_size
            .store(max_partition_size, Ordering::Release);
        let num_partitions = partitions.len();
        gstate
            .partitions
            .set(partitions)
            .map_err(|_| "aggregation finalized twice".to_string())?;

        // Minimum of combining one partition at a time, maximum of combining
        // all partitions in parallel.
        let temp_memory_state = gstate.temp_memory_state();
        temp_memory_state.set_minimum_reservation(max_partition_size);
        let max_threads = rt.number_of_threads().min(num_partitions);
        temp_memory_state.set_remaining_size(max_threads * max_partition_size);

        gstate.finalized.store(true, Ordering::Release);
        Ok(())
    }

    /// How many workers the source phase can use given the memory
    /// reservation.
    pub fn max_threads(&self, rt: &RuntimeState, gstate: &RadixAggGlobalSinkState) -> usize {
        let Some(partitions) = gstate.partitions.get() else {
            return 0;
        };
        if partitions.is_empty() {
            return 0;
        }
        let max_partition_size = gstate.max_partition_size.load(Ordering::Acquire).max(1);
        // This many partitions fit in the reservation (at least 1).
        let partitions_fit =
            (gstate.temp_memory_state().reservation() / max_partition_size).max(1);
        let max_possible = partitions.len().min(rt.number_of_threads());
        partitions_fit.min(max_possible)
    }

    /// Retain partition rows after scanning so the result can be scanned
    /// again. Must be set before the source phase starts.
    pub fn set_multi_scan(&self, gstate: &RadixAggGlobalSinkState) {
        gstate.set_scan_pin(ScanPinProperty::UnpinAfterDone);
    }
}

/// Check this worker against its memory share and the global bit count,
/// repartitioning its data when out of sync. Returns whether the local
/// collection was replaced (so the caller knows to reset the probe table).
fn maybe_repartition(
    radix: &RadixAggregation,
    gstate: &RadixAggGlobalSinkState,
    lstate: &mut RadixAggLocalSinkState,
    active_threads: usize,
) -> Result<bool, String> {
    let active_threads = active_threads.max(1);
    let temp_memory_state = gstate.temp_memory_state();
    let ht = lstate
        .ht
        .as_mut()
        .ok_or_else(|| "local sink hash table missing".to_string())?;

    // Check if we're approaching the memory limit.
    let total_size = ht.partitioned_data().size_in_bytes() + ht.capacity() * ENTRY_SLOT_SIZE;
    let mut thread_limit = temp_memory_state.reservation() / active_threads;
    if total_size > thread_limit && !gstate.is_external() {
        // Out-of-core would trigger below; grab the lock, re-check, and try to
        // raise the reservation first.
        let _guard = gstate.inner.lock().unwrap_or_else(|e| e.into_inner());
        thread_limit = temp_memory_state.reservation() / active_threads;
        if total_size > thread_limit {
            let remaining_size =
                (active_threads * total_size).max(temp_memory_state.remaining_size());
            temp_memory_state.set_remaining_size(2 * remaining_size);
            // Best-effort grant: re-read what we actually got.
            thread_limit = temp_memory_state.reservation() / active_threads;
        }
    }

    if total_size > thread_limit && gstate.set_radix_bits_to_external() {
        debug!(
            "sink going external: total_size={} thread_limit={} radix_bits={}",
            total_size,
            thread_limit,
            gstate.config.radix_bits()
        );
        ht.unpin_data();
        if lstate.abandoned_data.is_none() {
            lstate.abandoned_data = Some(PartitionedTupleRows::new(
                Arc::clone(radix.layout()),
                gstate.config.radix_bits(),
            ));
        }
        let abandoned_data = lstate
            .abandoned_data
            .as_mut()
            .ok_or_else(|| "abandoned data missing".to_string())?;
        let old_partitioned_data = ht.take_partitioned_data();
        old_partitioned_data.repartition_into(abandoned_data)?;
        ht.set_radix_bits(gstate.config.radix_bits());
        ht.init_partitioned_data();
        return Ok(true);
    }

    // We can go external with one active thread, but repartitioning is never
    // worth it there.
    if active_threads < 2 {
        return Ok(false);
    }

    let partition_count = ht.partitioned_data().partition_count();
    let current_radix_bits = radix_bits_for(partition_count);
    debug_assert!(current_radix_bits <= gstate.config.radix_bits());

    let row_size_per_partition =
        ht.partitioned_data().count() * radix.layout().row_width() / partition_count;
    if row_size_per_partition as f64 > BLOCK_FILL_FACTOR * STORAGE_BLOCK_SIZE as f64 {
        // Crossed the block-fill threshold; try to raise the bit count.
        gstate.set_radix_bits(current_radix_bits + REPARTITION_RADIX_BITS);
    }

    let global_radix_bits = gstate.config.radix_bits();
    if current_radix_bits == global_radix_bits {
        return Ok(false); // Already on the right number of radix bits.
    }

    // Out of sync with the global bit count: repartition.
    ht.unpin_data();
    let old_partitioned_data = ht.take_partitioned_data();
    ht.set_radix_bits(global_radix_bits);
    ht.init_partitioned_data();
    old_partitioned_data.repartition_into(ht.partitioned_data_mut())?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use arrow::datatypes::DataType;

    use crate::exec::agg::AggregateExpr;
    use crate::exec::agg::functions::CountAgg;
    use crate::exec::operators::aggregate::GroupedAggregateData;

    fn test_radix() -> RadixAggregation {
        RadixAggregation::try_new(
            BTreeSet::from([0]),
            Arc::new(GroupedAggregateData {
                group_types: vec![DataType::Int64],
                payload_types: vec![],
                aggregates: vec![AggregateExpr::new(Arc::new(CountAgg::star()), None)],
                grouping_functions: vec![],
            }),
        )
        .unwrap()
    }

    #[test]
    fn radix_bits_are_monotone_and_clamped() {
        let radix = test_radix();
        let rt = RuntimeState::new(8, 1 << 30);
        let gstate = radix.get_global_sink_state(&rt);
        assert_eq!(gstate.radix_bits(), 3);

        gstate.set_radix_bits(2);
        assert_eq!(gstate.radix_bits(), 3, "bits never decrease");
        gstate.set_radix_bits(5);
        assert_eq!(gstate.radix_bits(), 3, "clamped to the thread maximum");
    }

    #[test]
    fn any_combined_freezes_radix_bits() {
        let radix = test_radix();
        let rt = RuntimeState::new(256, 1 << 30);
        let gstate = radix.get_global_sink_state(&rt);
        assert_eq!(gstate.radix_bits(), 3);
        gstate.set_radix_bits(5);
        assert_eq!(gstate.radix_bits(), 5);

        gstate.any_combined.store(true, Ordering::Release);
        gstate.set_radix_bits(7);
        assert_eq!(gstate.radix_bits(), 5, "frozen after first combine");
        assert!(!gstate.set_radix_bits_to_external());
        assert!(!gstate.is_external());
    }

    #[test]
    fn external_switch_is_one_way() {
        let radix = test_radix();
        let rt = RuntimeState::new(4, 1 << 30);
        let gstate = radix.get_global_sink_state(&rt);
        assert!(!gstate.is_external());
        assert!(gstate.set_radix_bits_to_external());
        assert!(gstate.is_external());
        assert_eq!(
            gstate.radix_bits(),
            gstate.config.external_radix_bits_value()
        );
        // Second caller sees external too.
        assert!(gstate.set_radix_bits_to_external());
    }

    #[test]
    fn finalize_without_data_yields_zero_partitions() {
        let radix = test_radix();
        let rt = RuntimeState::new(2, 1 << 30);
        let gstate = radix.get_global_sink_state(&rt);
        radix.finalize(&rt, &gstate).unwrap();
        assert!(gstate.is_finalized());
        assert_eq!(gstate.count_before_combining.load(Ordering::Acquire), 0);
        assert!(gstate.partitions.get().unwrap().is_empty());
        assert_eq!(radix.max_threads(&rt, &gstate), 0);
        assert!(radix.finalize(&rt, &gstate).is_err(), "finalize runs once");
    }
}

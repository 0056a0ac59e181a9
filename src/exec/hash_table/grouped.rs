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
//! Single-table grouped aggregate hash table.
//!
//! Responsibilities:
//! - Groups input rows by their encoded key, accumulating aggregate states
//!   stored inline in radix-partitioned tuple rows.
//! - Combines previously materialized tuple rows back into live states.
//!
//! Key exported interfaces:
//! - Types: `GroupedAggHashTable`.
//!
//! The probe table maps a row hash to the row's location in the partitioned
//! backing store; clearing it detaches the accumulated rows without touching
//! them, which is what the sink's reset-without-move policy relies on.

use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::row::RowConverter;
use hashbrown::raw::RawTable;

use crate::common::util::{AtomicF64, next_power_of_two};
use crate::exec::agg::AggAllocator;
use crate::exec::hash_table::hash::hash_row_bytes;
use crate::exec::tuple::layout::TupleLayout;
use crate::exec::tuple::partitioned::PartitionedTupleRows;
use crate::exec::tuple::rows::TupleRows;
use crate::runtime::mem_tracker::MemTracker;

/// Target occupancy of the probe table.
pub const LOAD_FACTOR: f64 = 0.7;
/// Smallest probe-table slot count.
pub const MINIMUM_CAPACITY: usize = 4096;
/// Bytes per probe-table slot, as the radix policy accounts for them.
pub const ENTRY_SLOT_SIZE: usize = std::mem::size_of::<HtEntry>();

/// Rows pulled per combine batch.
const COMBINE_BATCH_ROWS: usize = 1024;

#[derive(Clone, Copy, Debug)]
pub struct HtEntry {
    hash: u64,
    partition: u32,
    row: u32,
}

pub struct GroupedAggHashTable {
    layout: Arc<TupleLayout>,
    converter: RowConverter,
    capacity: usize,
    table: RawTable<HtEntry>,
    count: usize,
    radix_bits: usize,
    data: PartitionedTupleRows,
    allocator: AggAllocator,
    mem_tracker: Option<Arc<MemTracker>>,
    accounted_bytes: i64,
}

impl GroupedAggHashTable {
    pub fn try_new(
        layout: Arc<TupleLayout>,
        capacity: usize,
        radix_bits: usize,
    ) -> Result<Self, String> {
        let capacity = next_power_of_two(capacity.max(MINIMUM_CAPACITY));
        let converter = layout.row_converter()?;
        let threshold = (capacity as f64 * LOAD_FACTOR) as usize;
        Ok(Self {
            converter,
            capacity,
            table: RawTable::with_capacity(threshold),
            count: 0,
            radix_bits,
            data: PartitionedTupleRows::new(Arc::clone(&layout), radix_bits),
            allocator: AggAllocator::default(),
            mem_tracker: None,
            accounted_bytes: 0,
            layout,
        })
    }

    /// Probe-table slot count that keeps `count` groups under the load factor.
    pub fn capacity_for_count(count: usize) -> usize {
        next_power_of_two(((count as f64 / LOAD_FACTOR).ceil() as usize).max(MINIMUM_CAPACITY))
    }

    pub fn layout(&self) -> &Arc<TupleLayout> {
        &self.layout
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn resize_threshold(&self) -> usize {
        (self.capacity as f64 * LOAD_FACTOR) as usize
    }

    pub fn radix_bits(&self) -> usize {
        self.radix_bits
    }

    /// Forget every probed group without touching the accumulated rows.
    /// Subsequent inserts append fresh rows to the same backing store.
    pub fn clear_probe_table(&mut self) {
        self.table.clear();
    }

    pub fn reset_count(&mut self) {
        self.count = 0;
    }

    /// Record the partitioning the NEXT `init_partitioned_data` call uses.
    /// Existing data is left at its current bit count.
    pub fn set_radix_bits(&mut self, radix_bits: usize) {
        self.radix_bits = radix_bits;
    }

    pub fn init_partitioned_data(&mut self) {
        self.data = PartitionedTupleRows::new(Arc::clone(&self.layout), self.radix_bits);
    }

    pub fn partitioned_data(&self) -> &PartitionedTupleRows {
        &self.data
    }

    pub(crate) fn partitioned_data_mut(&mut self) -> &mut PartitionedTupleRows {
        &mut self.data
    }

    /// Move the backing store out, leaving an empty one at the current bits.
    /// The probe table is stale afterwards; callers clear or rebuild it.
    pub fn take_partitioned_data(&mut self) -> PartitionedTupleRows {
        std::mem::replace(
            &mut self.data,
            PartitionedTupleRows::new(Arc::clone(&self.layout), self.radix_bits),
        )
    }

    pub fn allocator(&self) -> AggAllocator {
        self.allocator.clone()
    }

    pub fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        if let Some(current) = self.mem_tracker.take() {
            current.release(self.accounted_bytes);
        }
        self.accounted_bytes = 0;
        self.mem_tracker = Some(tracker);
        self.sync_mem_tracker();
    }

    /// Re-sync logical memory accounting with the current footprint. Stands in
    /// for releasing buffer pins; call sites mirror where a paged tuple store
    /// would unpin.
    pub fn unpin_data(&mut self) {
        self.sync_mem_tracker();
    }

    fn sync_mem_tracker(&mut self) {
        let Some(tracker) = self.mem_tracker.as_ref() else {
            return;
        };
        let bytes = self.data.size_in_bytes()
            + self.capacity * ENTRY_SLOT_SIZE
            + self.allocator.allocated_bytes();
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        if bytes > self.accounted_bytes {
            tracker.consume(bytes - self.accounted_bytes);
        } else {
            tracker.release(self.accounted_bytes - bytes);
        }
        self.accounted_bytes = bytes;
    }

    /// Group the selected input rows and accumulate their payload into
    /// aggregate states. `filter` selects input row indices; `None` takes
    /// every row.
    pub fn add_chunk(
        &mut self,
        groups: &[ArrayRef],
        payload: &[ArrayRef],
        filter: Option<&[usize]>,
    ) -> Result<(), String> {
        let num_rows = groups
            .first()
            .map(|array| array.len())
            .ok_or_else(|| "at least one group column required".to_string())?;
        if num_rows == 0 {
            return Ok(());
        }
        let rows = self
            .converter
            .convert_columns(groups)
            .map_err(|e| e.to_string())?;
        let sel: Vec<usize> = match filter {
            Some(filter) => filter.to_vec(),
            None => (0..num_rows).collect(),
        };

        let seed = self.layout.hash_seed();
        let mut state_bases = Vec::with_capacity(sel.len());
        for &row in &sel {
            let bytes = rows.row(row).data();
            let hash = hash_row_bytes(seed, bytes);
            let (partition, row_idx) = self.find_or_insert(bytes, hash);
            state_bases.push(self.data.partitions()[partition].state_base(row_idx));
        }
        self.maybe_grow();

        self.layout
            .update_states(&state_bases, &sel, payload, &self.allocator)
    }

    fn find_or_insert(&mut self, bytes: &[u8], hash: u64) -> (usize, usize) {
        let result = {
            let data = &self.data;
            let table = &mut self.table;
            table.find_or_find_insert_slot(
                hash,
                |entry| {
                    entry.hash == hash
                        && data.partitions()[entry.partition as usize].key(entry.row as usize)
                            == bytes
                },
                |entry| entry.hash,
            )
        };
        match result {
            Ok(bucket) => {
                let entry = unsafe { bucket.as_ref() };
                (entry.partition as usize, entry.row as usize)
            }
            Err(slot) => {
                let (partition, row_idx) = self.data.append_row(bytes, hash, None);
                let entry = HtEntry {
                    hash,
                    partition: partition as u32,
                    row: row_idx as u32,
                };
                unsafe {
                    self.table.insert_in_slot(hash, slot, entry);
                }
                self.count += 1;
                (partition, row_idx)
            }
        }
    }

    /// Fold previously materialized rows back into this table's states,
    /// consuming the source collection. Existing groups are merged
    /// state-by-state, fresh groups are moved in wholesale. `progress`
    /// advances from 0 to 1 over the source rows.
    pub fn combine(&mut self, src: TupleRows, progress: Option<&AtomicF64>) -> Result<(), String> {
        let total = src.count();
        if total == 0 {
            return Ok(());
        }
        let mut src_bases = Vec::new();
        let mut dst_bases = Vec::new();
        let mut start = 0;
        while start < total {
            let end = (start + COMBINE_BATCH_ROWS).min(total);
            src_bases.clear();
            dst_bases.clear();
            for row in start..end {
                let bytes = src.key(row);
                let hash = src.hash(row);
                let found = {
                    let data = &self.data;
                    let table = &mut self.table;
                    table.find_or_find_insert_slot(
                        hash,
                        |entry| {
                            entry.hash == hash
                                && data.partitions()[entry.partition as usize]
                                    .key(entry.row as usize)
                                    == bytes
                        },
                        |entry| entry.hash,
                    )
                };
                match found {
                    Ok(bucket) => {
                        let entry = unsafe { bucket.as_ref() };
                        src_bases.push(src.state_base(row));
                        dst_bases.push(
                            self.data.partitions()[entry.partition as usize]
                                .state_base(entry.row as usize),
                        );
                    }
                    Err(slot) => {
                        let (partition, row_idx) =
                            self.data.append_row(bytes, hash, Some(src.state_base(row)));
                        let entry = HtEntry {
                            hash,
                            partition: partition as u32,
                            row: row_idx as u32,
                        };
                        unsafe {
                            self.table.insert_in_slot(hash, slot, entry);
                        }
                        self.count += 1;
                    }
                }
            }
            self.layout
                .combine_states(&src_bases, &dst_bases, &self.allocator)?;
            start = end;
            if let Some(progress) = progress {
                progress.store(start as f64 / total as f64);
            }
        }
        self.maybe_grow();
        Ok(())
    }

    /// Track probe-table growth past the threshold, mirroring what an
    /// open-addressed resize would do to capacity.
    fn maybe_grow(&mut self) {
        while self.count > self.resize_threshold() {
            self.capacity *= 2;
        }
    }
}

impl Drop for GroupedAggHashTable {
    fn drop(&mut self) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.release(self.accounted_bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array, StringArray};
    use arrow::datatypes::DataType;
    use crate::exec::agg::AggregateExpr;
    use crate::exec::agg::functions::{CountAgg, SumAgg};

    fn test_layout() -> Arc<TupleLayout> {
        TupleLayout::try_new(
            vec![DataType::Utf8],
            vec![
                AggregateExpr::new(Arc::new(CountAgg::star()), None),
                AggregateExpr::new(
                    Arc::new(SumAgg::try_new(&DataType::Int64).unwrap()),
                    Some(0),
                ),
            ],
        )
        .unwrap()
    }

    fn group_array(keys: &[&str]) -> ArrayRef {
        Arc::new(StringArray::from(keys.to_vec()))
    }

    fn payload_array(values: &[i64]) -> ArrayRef {
        Arc::new(Int64Array::from(values.to_vec()))
    }

    fn finalized_sums(ht: &GroupedAggHashTable) -> std::collections::HashMap<String, (i64, i64)> {
        let mut out = std::collections::HashMap::new();
        let layout = Arc::clone(ht.layout());
        for partition in ht.partitioned_data().partitions() {
            let mut scan = partition.init_scan().unwrap();
            while let Some((columns, bases)) = partition.scan(&mut scan, 1024).unwrap() {
                let keys = columns[0].as_any().downcast_ref::<StringArray>().unwrap();
                let aggs = layout.finalize_states(&bases).unwrap();
                let counts = aggs[0].as_any().downcast_ref::<Int64Array>().unwrap();
                let sums = aggs[1].as_any().downcast_ref::<Int64Array>().unwrap();
                for i in 0..keys.len() {
                    out.insert(keys.value(i).to_string(), (counts.value(i), sums.value(i)));
                }
            }
        }
        out
    }

    #[test]
    fn groups_and_accumulates() {
        let mut ht = GroupedAggHashTable::try_new(test_layout(), 4096, 2).unwrap();
        ht.add_chunk(
            &[group_array(&["a", "b", "a", "c", "b", "a"])],
            &[payload_array(&[1, 2, 3, 4, 5, 6])],
            None,
        )
        .unwrap();
        assert_eq!(ht.count(), 3);
        let result = finalized_sums(&ht);
        assert_eq!(result["a"], (3, 10));
        assert_eq!(result["b"], (2, 7));
        assert_eq!(result["c"], (1, 4));
    }

    #[test]
    fn filter_selects_rows() {
        let mut ht = GroupedAggHashTable::try_new(test_layout(), 4096, 0).unwrap();
        ht.add_chunk(
            &[group_array(&["a", "a", "a"])],
            &[payload_array(&[1, 10, 100])],
            Some(&[0, 2]),
        )
        .unwrap();
        let result = finalized_sums(&ht);
        assert_eq!(result["a"], (2, 101));
    }

    #[test]
    fn clear_probe_table_keeps_rows() {
        let mut ht = GroupedAggHashTable::try_new(test_layout(), 4096, 1).unwrap();
        ht.add_chunk(&[group_array(&["a"])], &[payload_array(&[1])], None)
            .unwrap();
        ht.clear_probe_table();
        ht.reset_count();
        ht.add_chunk(&[group_array(&["a"])], &[payload_array(&[2])], None)
            .unwrap();
        // Same group twice: the probe table was cleared in between.
        assert_eq!(ht.partitioned_data().count(), 2);
        assert_eq!(ht.count(), 1);
    }

    #[test]
    fn combine_merges_duplicate_groups() {
        let layout = test_layout();
        let mut producer = GroupedAggHashTable::try_new(Arc::clone(&layout), 4096, 0).unwrap();
        producer
            .add_chunk(
                &[group_array(&["a", "b"])],
                &[payload_array(&[1, 2])],
                None,
            )
            .unwrap();
        producer.clear_probe_table();
        producer.reset_count();
        producer
            .add_chunk(
                &[group_array(&["a", "c"])],
                &[payload_array(&[10, 20])],
                None,
            )
            .unwrap();

        let mut consumer = GroupedAggHashTable::try_new(Arc::clone(&layout), 4096, 0).unwrap();
        let progress = AtomicF64::new(0.0);
        let partitions = producer.take_partitioned_data().take_partitions();
        for partition in partitions {
            consumer.combine(partition, Some(&progress)).unwrap();
        }
        assert_eq!(progress.load(), 1.0);
        assert_eq!(consumer.count(), 3);
        let result = finalized_sums(&consumer);
        assert_eq!(result["a"], (2, 11));
        assert_eq!(result["b"], (1, 2));
        assert_eq!(result["c"], (1, 20));
    }

    #[test]
    fn capacity_tracks_growth() {
        assert_eq!(GroupedAggHashTable::capacity_for_count(100), 4096);
        assert_eq!(
            GroupedAggHashTable::capacity_for_count(100_000),
            next_power_of_two((100_000f64 / LOAD_FACTOR) as usize)
        );
        let mut ht = GroupedAggHashTable::try_new(test_layout(), 16, 0).unwrap();
        assert_eq!(ht.capacity(), MINIMUM_CAPACITY);
        let keys = (0..5000).map(|i| format!("k{i}")).collect::<Vec<_>>();
        let refs = keys.iter().map(String::as_str).collect::<Vec<_>>();
        let values = vec![1i64; 5000];
        ht.add_chunk(&[group_array(&refs)], &[payload_array(&values)], None)
            .unwrap();
        assert_eq!(ht.count(), 5000);
        assert!(ht.resize_threshold() >= 5000);
    }
}

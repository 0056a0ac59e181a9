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
//! Source phase: a task pool over the finalized partitions.
//!
//! Each partition runs a finalize-then-scan state machine. A worker that
//! draws a partition someone else is finalizing parks a wakeup handle on it
//! and reports BLOCKED; the finalizing worker fires every parked handle when
//! the partition becomes scannable. Lock order is global source lock, then
//! partition lock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::util::next_power_of_two;
use crate::exec::agg::AggAllocator;
use crate::exec::chunk::Chunk;
use crate::exec::hash_table::GroupedAggHashTable;
use crate::exec::hash_table::grouped::{ENTRY_SLOT_SIZE, LOAD_FACTOR};
use crate::exec::interrupt::InterruptHandle;
use crate::exec::operators::aggregate::RadixAggregation;
use crate::exec::operators::aggregate::sink::{
    AggregatePartitionState, RadixAggGlobalSinkState, ScanPinProperty,
};
use crate::exec::tuple::{TupleRows, TupleScanState};
use crate::runtime::runtime_state::RuntimeState;

/// Rows pulled per scan call.
const SCAN_BATCH_ROWS: usize = 1024;

/// Result of one `get_data` call.
#[derive(Debug)]
pub enum SourceResult {
    /// A chunk was produced; call again for more.
    HaveMoreOutput(Chunk),
    /// The worker parked a wakeup handle on a partition being finalized.
    Blocked,
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SourceTask {
    NoTask,
    Finalize,
    Scan,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScanStatus {
    Init,
    InProgress,
    Done,
}

enum TaskAssignment {
    Assigned,
    Blocked,
    Finished,
}

pub(crate) struct SourceInner {
    pub(crate) task_idx: usize,
}

/// Shared state of one source pass over the partitions.
pub struct RadixAggGlobalSourceState {
    pub(crate) finished: AtomicBool,
    pub(crate) inner: Mutex<SourceInner>,
    pub(crate) task_done: AtomicUsize,
}

/// Per-worker source state.
pub struct RadixAggLocalSourceState {
    task: SourceTask,
    task_idx: usize,
    /// Scratch hash table reused across finalize tasks.
    ht: Option<GroupedAggHashTable>,
    scan_status: ScanStatus,
    scan_data: Option<Arc<TupleRows>>,
    scan_state: Option<TupleScanState>,
}

impl RadixAggLocalSourceState {
    fn task_finished(&self) -> bool {
        match self.task {
            SourceTask::NoTask | SourceTask::Finalize => true,
            SourceTask::Scan => self.scan_status == ScanStatus::Done,
        }
    }
}

impl RadixAggregation {
    pub fn get_global_source_state(&self) -> RadixAggGlobalSourceState {
        RadixAggGlobalSourceState {
            finished: AtomicBool::new(false),
            inner: Mutex::new(SourceInner { task_idx: 0 }),
            task_done: AtomicUsize::new(0),
        }
    }

    pub fn get_local_source_state(&self) -> RadixAggLocalSourceState {
        RadixAggLocalSourceState {
            task: SourceTask::NoTask,
            task_idx: 0,
            ht: None,
            scan_status: ScanStatus::Done,
            scan_data: None,
            scan_state: None,
        }
    }

    /// Pull one output chunk, finalizing partitions along the way.
    pub fn get_data(
        &self,
        rt: &RuntimeState,
        sink: &RadixAggGlobalSinkState,
        gstate: &RadixAggGlobalSourceState,
        lstate: &mut RadixAggLocalSourceState,
        interrupt: &InterruptHandle,
    ) -> Result<SourceResult, String> {
        if !sink.is_finalized() {
            return Err("aggregation source started before finalize".to_string());
        }
        if gstate.finished.load(Ordering::Acquire) {
            return Ok(SourceResult::Finished);
        }

        if sink.count_before_combining.load(Ordering::Acquire) == 0 {
            if !self.grouping_set().is_empty() {
                gstate.finished.store(true, Ordering::Release);
                return Ok(SourceResult::Finished);
            }
            // Aggregation without groups over empty input produces exactly one
            // row of empty-input aggregate results.
            let _guard = gstate.inner.lock().unwrap_or_else(|e| e.into_inner());
            if gstate.finished.load(Ordering::Acquire) {
                return Ok(SourceResult::Finished);
            }
            let chunk = self.build_empty_input_chunk()?;
            gstate.finished.store(true, Ordering::Release);
            return Ok(SourceResult::HaveMoreOutput(chunk));
        }

        loop {
            if gstate.finished.load(Ordering::Acquire) {
                return Ok(SourceResult::Finished);
            }
            if lstate.task_finished() {
                match assign_task(sink, gstate, lstate, interrupt)? {
                    TaskAssignment::Finished => return Ok(SourceResult::Finished),
                    TaskAssignment::Blocked => return Ok(SourceResult::Blocked),
                    TaskAssignment::Assigned => {}
                }
            }
            match lstate.task {
                SourceTask::Finalize => finalize_task(rt, self, sink, gstate, lstate)?,
                SourceTask::Scan => {
                    if let Some(chunk) = scan_task(self, sink, gstate, lstate)? {
                        return Ok(SourceResult::HaveMoreOutput(chunk));
                    }
                }
                SourceTask::NoTask => {
                    return Err("source worker executed without a task".to_string());
                }
            }
        }
    }

    /// Combined finalize/scan progress in [0, 100].
    pub fn get_progress(
        &self,
        sink: &RadixAggGlobalSinkState,
        gstate: &RadixAggGlobalSourceState,
    ) -> f64 {
        let partitions = match sink.partitions.get() {
            Some(partitions) if !partitions.is_empty() => partitions,
            _ => {
                return if gstate.finished.load(Ordering::Acquire) {
                    100.0
                } else {
                    0.0
                };
            }
        };

        // Partition combine progress weighs 2x, scan completion 1x.
        let mut total_progress = 0.0;
        for partition in partitions {
            total_progress += 2.0 * partition.progress.load();
        }
        total_progress += gstate.task_done.load(Ordering::Acquire) as f64;

        100.0 * total_progress / (3.0 * partitions.len() as f64)
    }

    /// One output row where every group is NULL and every aggregate is
    /// `finalize(init())`.
    fn build_empty_input_chunk(&self) -> Result<Chunk, String> {
        let allocator = AggAllocator::default();
        let mut agg_columns = Vec::with_capacity(self.op().aggregates.len());
        for aggregate in &self.op().aggregates {
            let function = &aggregate.function;
            let (size, align) = function.state_layout();
            let state = allocator.alloc(size, align);
            function.init_state(state);
            let column = function.finalize_batch(&[state])?;
            if function.has_destructor() {
                function.destroy_state(state);
            }
            agg_columns.push(column);
        }
        self.assemble_output(&[], agg_columns, 1)
    }
}

fn assign_task(
    sink: &RadixAggGlobalSinkState,
    gstate: &RadixAggGlobalSourceState,
    lstate: &mut RadixAggLocalSourceState,
    interrupt: &InterruptHandle,
) -> Result<TaskAssignment, String> {
    let mut inner = gstate.inner.lock().unwrap_or_else(|e| e.into_inner());
    if gstate.finished.load(Ordering::Acquire) {
        return Ok(TaskAssignment::Finished);
    }
    let partitions = sink
        .partitions
        .get()
        .ok_or_else(|| "partitions missing in source phase".to_string())?;
    if inner.task_idx == partitions.len() {
        return Ok(TaskAssignment::Finished);
    }
    lstate.task_idx = inner.task_idx;
    inner.task_idx += 1;

    let partition = &partitions[lstate.task_idx];
    let mut sync = partition.sync.lock().unwrap_or_else(|e| e.into_inner());
    match sync.state {
        AggregatePartitionState::ReadyToFinalize => {
            sync.state = AggregatePartitionState::FinalizeInProgress;
            lstate.task = SourceTask::Finalize;
            Ok(TaskAssignment::Assigned)
        }
        AggregatePartitionState::FinalizeInProgress => {
            lstate.task = SourceTask::Scan;
            lstate.scan_status = ScanStatus::Init;
            sync.blocked_tasks.push(interrupt.clone());
            Ok(TaskAssignment::Blocked)
        }
        AggregatePartitionState::ReadyToScan => {
            lstate.task = SourceTask::Scan;
            lstate.scan_status = ScanStatus::Init;
            Ok(TaskAssignment::Assigned)
        }
    }
}

/// Combine one partition's partial states into a scratch table, then flatten
/// the result back into the partition as scannable rows.
fn finalize_task(
    rt: &RuntimeState,
    radix: &RadixAggregation,
    sink: &RadixAggGlobalSinkState,
    gstate: &RadixAggGlobalSourceState,
    lstate: &mut RadixAggLocalSourceState,
) -> Result<(), String> {
    let partitions = sink
        .partitions
        .get()
        .ok_or_else(|| "partitions missing in source phase".to_string())?;
    let partition = &partitions[lstate.task_idx];

    let result = (|| -> Result<(), String> {
        let data = partition
            .data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| "partition data missing for finalize".to_string())?;
        let rows =
            Arc::try_unwrap(data).map_err(|_| "partition data still shared".to_string())?;

        if lstate.ht.is_none() {
            // This capacity would always be sufficient for all data, but cap
            // the initial allocation by a share of the memory limit.
            let capacity = GroupedAggHashTable::capacity_for_count(rows.count());
            let thread_limit =
                (0.6 * rt.memory_limit() as f64 / rt.number_of_threads() as f64) as usize;
            let size_per_entry = rows.size_in_bytes() / rows.count().max(1)
                + (LOAD_FACTOR * ENTRY_SLOT_SIZE as f64) as usize;
            let capacity_limit = next_power_of_two(thread_limit / size_per_entry.max(1));
            lstate.ht = Some(radix.create_ht(capacity.min(capacity_limit), 0)?);
        } else {
            let ht = lstate
                .ht
                .as_mut()
                .ok_or_else(|| "finalize hash table missing".to_string())?;
            ht.init_partitioned_data();
            ht.clear_probe_table();
            ht.reset_count();
        }
        let ht = lstate
            .ht
            .as_mut()
            .ok_or_else(|| "finalize hash table missing".to_string())?;

        ht.combine(rows, Some(&partition.progress))?;
        ht.unpin_data();
        partition.progress.store(1.0);

        // Move the combined rows back into the partition (bits 0: a single
        // flattened collection).
        let mut flattened = ht.take_partitioned_data().take_partitions();
        let rows = flattened
            .pop()
            .filter(|_| flattened.is_empty())
            .ok_or_else(|| "finalize table must have exactly one partition".to_string())?;
        *partition.data.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(rows));

        {
            let mut inner = sink.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.stored_allocators.push(ht.allocator());
        }
        {
            let _guard = gstate.inner.lock().unwrap_or_else(|e| e.into_inner());
            let finalizes_done = sink.finalize_done.fetch_add(1, Ordering::AcqRel) + 1;
            if finalizes_done == partitions.len() {
                // All finalizes done; release the temporary reservation.
                sink.temp_memory_state().set_remaining_size(0);
            }
        }
        Ok(())
    })();

    // Wake parked workers on both success and failure: a partition must never
    // stay in FINALIZE_IN_PROGRESS behind an error.
    let mut sync = partition.sync.lock().unwrap_or_else(|e| e.into_inner());
    sync.state = if result.is_ok() {
        AggregatePartitionState::ReadyToScan
    } else {
        AggregatePartitionState::ReadyToFinalize
    };
    for blocked_task in sync.blocked_tasks.drain(..) {
        blocked_task.fire();
    }
    drop(sync);
    result?;

    // This worker scans the partition it just finalized.
    lstate.task = SourceTask::Scan;
    lstate.scan_status = ScanStatus::Init;
    Ok(())
}

/// Pull the next chunk from the assigned partition. Returns `Ok(None)` when
/// the partition is exhausted (the task is then finished).
fn scan_task(
    radix: &RadixAggregation,
    sink: &RadixAggGlobalSinkState,
    gstate: &RadixAggGlobalSourceState,
    lstate: &mut RadixAggLocalSourceState,
) -> Result<Option<Chunk>, String> {
    let partitions = sink
        .partitions
        .get()
        .ok_or_else(|| "partitions missing in source phase".to_string())?;
    let partition = &partitions[lstate.task_idx];

    if lstate.scan_status == ScanStatus::Init {
        let data = partition
            .data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| "partition data missing for scan".to_string())?;
        lstate.scan_state = Some(data.init_scan()?);
        lstate.scan_data = Some(data);
        lstate.scan_status = ScanStatus::InProgress;
    }

    let data = lstate
        .scan_data
        .as_ref()
        .ok_or_else(|| "scan data missing".to_string())?;
    let scan_state = lstate
        .scan_state
        .as_mut()
        .ok_or_else(|| "scan state missing".to_string())?;

    let Some((group_columns, state_bases)) = data.scan(scan_state, SCAN_BATCH_ROWS)? else {
        if sink.scan_pin() == ScanPinProperty::DestroyAfterDone {
            // States were destroyed inline; drop the rows.
            partition
                .data
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
        }
        lstate.scan_data = None;
        lstate.scan_state = None;
        lstate.scan_status = ScanStatus::Done;

        let _guard = gstate.inner.lock().unwrap_or_else(|e| e.into_inner());
        let task_done = gstate.task_done.fetch_add(1, Ordering::AcqRel) + 1;
        if task_done == partitions.len() {
            gstate.finished.store(true, Ordering::Release);
        }
        return Ok(None);
    };

    let num_rows = state_bases.len();
    let layout = radix.layout();
    let agg_columns = layout.finalize_states(&state_bases)?;
    if sink.scan_pin() == ScanPinProperty::DestroyAfterDone && layout.has_destructor() {
        layout.destroy_states(&state_bases);
    }

    let chunk = radix.assemble_output(&group_columns, agg_columns, num_rows)?;
    Ok(Some(chunk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;

    use arrow::array::{ArrayRef, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};

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

    fn group_chunk(values: &[i64]) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "group0",
            DataType::Int64,
            false,
        )]));
        let array: ArrayRef = Arc::new(Int64Array::from(values.to_vec()));
        Chunk::try_from_arrays(schema, vec![array], values.len()).unwrap()
    }

    fn empty_payload(num_rows: usize) -> Chunk {
        Chunk::try_from_arrays(Arc::new(Schema::empty()), vec![], num_rows).unwrap()
    }

    /// Two workers sink disjoint values, combine, finalize.
    fn sink_two_workers(
        radix: &RadixAggregation,
        rt: &RuntimeState,
    ) -> RadixAggGlobalSinkState {
        let gstate = radix.get_global_sink_state(rt);
        for base in [0i64, 1000] {
            let mut lstate = radix.get_local_sink_state();
            let values = (base..base + 100).collect::<Vec<_>>();
            let chunk = group_chunk(&values);
            radix
                .sink(rt, &gstate, &mut lstate, &chunk, &empty_payload(values.len()), None)
                .unwrap();
            radix.combine(rt, &gstate, &mut lstate).unwrap();
        }
        radix.finalize(rt, &gstate).unwrap();
        gstate
    }

    #[test]
    fn blocked_worker_is_woken_exactly_once_and_scans() {
        let radix = test_radix();
        let rt = RuntimeState::new(2, 1 << 30);
        let sink = sink_two_workers(&radix, &rt);
        let partitions = sink.partitions.get().unwrap();
        assert!(partitions.len() >= 2);

        // Another worker holds partition 0 in FINALIZE_IN_PROGRESS.
        partitions[0]
            .sync
            .lock()
            .unwrap()
            .state = AggregatePartitionState::FinalizeInProgress;

        let gstate = radix.get_global_source_state();
        let mut lstate = radix.get_local_source_state();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let interrupt = InterruptHandle::new(move || {
            fired_clone.fetch_add(1, Ordering::AcqRel);
        });

        let result = radix
            .get_data(&rt, &sink, &gstate, &mut lstate, &interrupt)
            .unwrap();
        assert!(matches!(result, SourceResult::Blocked));
        assert_eq!(fired.load(Ordering::Acquire), 0);

        // The finalizing worker completes: state flips, parked tasks fire.
        {
            let mut sync = partitions[0].sync.lock().unwrap();
            sync.state = AggregatePartitionState::ReadyToScan;
            partitions[0].progress.store(1.0);
            for task in sync.blocked_tasks.drain(..) {
                task.fire();
            }
        }
        assert_eq!(fired.load(Ordering::Acquire), 1);

        // The woken worker drains the rest of the source phase.
        let mut rows = 0usize;
        loop {
            match radix
                .get_data(&rt, &sink, &gstate, &mut lstate, &interrupt)
                .unwrap()
            {
                SourceResult::HaveMoreOutput(chunk) => rows += chunk.len(),
                SourceResult::Finished => break,
                SourceResult::Blocked => panic!("nothing left to block on"),
            }
        }
        assert_eq!(rows, 200);
        assert_eq!(fired.load(Ordering::Acquire), 1, "wakeup fired exactly once");
        assert!(gstate.finished.load(Ordering::Acquire));
        assert_eq!(radix.get_progress(&sink, &gstate), 100.0);
    }

    #[test]
    fn single_worker_drains_all_partitions() {
        let radix = test_radix();
        let rt = RuntimeState::new(2, 1 << 30);
        let sink = sink_two_workers(&radix, &rt);

        let gstate = radix.get_global_source_state();
        let mut lstate = radix.get_local_source_state();
        let interrupt = InterruptHandle::noop();

        let mut progress = radix.get_progress(&sink, &gstate);
        assert!(progress <= 0.01);
        let mut rows = 0usize;
        loop {
            match radix
                .get_data(&rt, &sink, &gstate, &mut lstate, &interrupt)
                .unwrap()
            {
                SourceResult::HaveMoreOutput(chunk) => {
                    rows += chunk.len();
                    let now = radix.get_progress(&sink, &gstate);
                    assert!(now >= progress, "progress is monotone");
                    progress = now;
                }
                SourceResult::Finished => break,
                SourceResult::Blocked => panic!("single worker cannot block"),
            }
        }
        assert_eq!(rows, 200);
        assert_eq!(radix.get_progress(&sink, &gstate), 100.0);
        assert_eq!(
            sink.finalize_done.load(Ordering::Acquire),
            sink.partitions.get().unwrap().len()
        );
        // All finalizes done: temporary reservation released.
        assert_eq!(sink.temp_memory_state().reservation(), 0);
    }

    #[test]
    fn empty_input_with_groups_produces_no_rows() {
        let radix = test_radix();
        let rt = RuntimeState::new(2, 1 << 30);
        let sink = {
            let gstate = radix.get_global_sink_state(&rt);
            radix.finalize(&rt, &gstate).unwrap();
            gstate
        };
        let gstate = radix.get_global_source_state();
        let mut lstate = radix.get_local_source_state();
        let result = radix
            .get_data(&rt, &sink, &gstate, &mut lstate, &InterruptHandle::noop())
            .unwrap();
        assert!(matches!(result, SourceResult::Finished));
        assert_eq!(radix.get_progress(&sink, &gstate), 100.0);
    }
}

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
//! Parallel radix-partitioned hash aggregation.
//!
//! Responsibilities:
//! - Coordinates per-thread grouped hash tables through sink, combine,
//!   finalize, and source phases, adapting the partition count to thread
//!   count and memory pressure.
//! - Assembles output rows with grouping-set NULL fill-in and GROUPING()
//!   values.
//!
//! Key exported interfaces:
//! - Types: `RadixAggregation`, `GroupedAggregateData`, sink/source states,
//!   `SourceResult`.
//!
//! One `RadixAggregation` materializes one grouping set; the enclosing
//! operator owns one instance per set.

use std::collections::BTreeSet;
use std::sync::Arc;

use arrow::array::{ArrayRef, Int8Array, Int64Array, new_null_array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use crate::exec::agg::AggregateExpr;
use crate::exec::chunk::Chunk;
use crate::exec::hash_table::GroupedAggHashTable;
use crate::exec::tuple::TupleLayout;

pub mod config;
pub mod sink;
pub mod source;

pub use config::RadixAggConfig;
pub use sink::{RadixAggGlobalSinkState, RadixAggLocalSinkState, ScanPinProperty};
pub use source::{RadixAggGlobalSourceState, RadixAggLocalSourceState, SourceResult};

/// Value of the synthetic constant group used when the grouping set is empty,
/// so that every input row collapses into one output row.
const EMPTY_GROUPING_SET_VALUE: i8 = 42;

/// The grouped aggregation an operator was planned with: the full group-by
/// column list, the payload columns feeding the aggregates, the aggregates
/// themselves, and the argument lists of any GROUPING() calls.
#[derive(Debug)]
pub struct GroupedAggregateData {
    pub group_types: Vec<DataType>,
    pub payload_types: Vec<DataType>,
    pub aggregates: Vec<AggregateExpr>,
    pub grouping_functions: Vec<Vec<usize>>,
}

impl GroupedAggregateData {
    pub fn group_count(&self) -> usize {
        self.group_types.len()
    }
}

/// Radix-partitioned hash aggregation for one grouping set.
pub struct RadixAggregation {
    op: Arc<GroupedAggregateData>,
    /// Indices of the group columns this instance actually groups on.
    grouping_set: BTreeSet<usize>,
    /// Complement of the grouping set: emitted as constant NULL columns.
    null_groups: Vec<usize>,
    /// Types of the materialized group columns (synthetic group included).
    group_types: Vec<DataType>,
    /// Precomputed GROUPING() output values, constant for the query.
    grouping_values: Vec<i64>,
    layout: Arc<TupleLayout>,
    output_schema: SchemaRef,
}

impl RadixAggregation {
    pub fn try_new(
        grouping_set: BTreeSet<usize>,
        op: Arc<GroupedAggregateData>,
    ) -> Result<Self, String> {
        let groups_count = op.group_count();
        if let Some(&max) = grouping_set.iter().next_back() {
            if max >= groups_count {
                return Err(format!(
                    "grouping set index {} out of bounds (group count {})",
                    max, groups_count
                ));
            }
        }
        let null_groups = (0..groups_count)
            .filter(|idx| !grouping_set.contains(idx))
            .collect::<Vec<_>>();

        let mut group_types = Vec::with_capacity(grouping_set.len().max(1));
        if grouping_set.is_empty() {
            // Fake a single group with a constant value for aggregation
            // without groups.
            group_types.push(DataType::Int8);
        }
        for &entry in &grouping_set {
            group_types.push(op.group_types[entry].clone());
        }

        let grouping_values = op
            .grouping_functions
            .iter()
            .map(|grouping| grouping_value(grouping, &grouping_set))
            .collect::<Vec<_>>();

        let layout = TupleLayout::try_new(group_types.clone(), op.aggregates.clone())?;
        let output_schema = build_output_schema(&op);

        Ok(Self {
            op,
            grouping_set,
            null_groups,
            group_types,
            grouping_values,
            layout,
            output_schema,
        })
    }

    pub fn grouping_set(&self) -> &BTreeSet<usize> {
        &self.grouping_set
    }

    pub fn null_groups(&self) -> &[usize] {
        &self.null_groups
    }

    pub fn grouping_values(&self) -> &[i64] {
        &self.grouping_values
    }

    pub fn layout(&self) -> &Arc<TupleLayout> {
        &self.layout
    }

    pub fn group_types(&self) -> &[DataType] {
        &self.group_types
    }

    pub(crate) fn op(&self) -> &GroupedAggregateData {
        &self.op
    }

    pub fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    pub(crate) fn create_ht(
        &self,
        capacity: usize,
        radix_bits: usize,
    ) -> Result<GroupedAggHashTable, String> {
        GroupedAggHashTable::try_new(Arc::clone(&self.layout), capacity, radix_bits)
    }

    /// Project the group columns out of the input chunk (no copy). With an
    /// empty grouping set this is the synthetic constant group.
    pub(crate) fn populate_group_arrays(&self, chunk: &Chunk) -> Result<Vec<ArrayRef>, String> {
        if self.grouping_set.is_empty() {
            let array: ArrayRef = Arc::new(Int8Array::from(vec![
                EMPTY_GROUPING_SET_VALUE;
                chunk.len()
            ]));
            return Ok(vec![array]);
        }
        let mut arrays = Vec::with_capacity(self.grouping_set.len());
        for &group_idx in &self.grouping_set {
            arrays.push(chunk.column(group_idx)?);
        }
        Ok(arrays)
    }

    /// Assemble one output chunk: scanned group columns at their original
    /// positions, NULL columns for ungrouped columns, aggregate results, and
    /// the constant GROUPING() values.
    pub(crate) fn assemble_output(
        &self,
        group_columns: &[ArrayRef],
        agg_columns: Vec<ArrayRef>,
        num_rows: usize,
    ) -> Result<Chunk, String> {
        let groups_count = self.op.group_count();
        let mut columns: Vec<ArrayRef> =
            Vec::with_capacity(groups_count + agg_columns.len() + self.grouping_values.len());
        let mut group_slots: Vec<Option<ArrayRef>> = vec![None; groups_count];
        for (position, &group_idx) in self.grouping_set.iter().enumerate() {
            let column = group_columns
                .get(position)
                .cloned()
                .ok_or_else(|| "scanned group column missing".to_string())?;
            group_slots[group_idx] = Some(column);
        }
        for &null_group in &self.null_groups {
            group_slots[null_group] =
                Some(new_null_array(&self.op.group_types[null_group], num_rows));
        }
        for slot in group_slots {
            columns.push(slot.ok_or_else(|| "output group column missing".to_string())?);
        }
        columns.extend(agg_columns);
        for &value in &self.grouping_values {
            columns.push(Arc::new(Int64Array::from(vec![value; num_rows])) as ArrayRef);
        }
        Chunk::try_from_arrays(self.output_schema(), columns, num_rows)
    }
}

/// For each parameter of a GROUPING() call, bit `len-1-i` is set iff the hash
/// table does NOT group on that column.
fn grouping_value(grouping: &[usize], grouping_set: &BTreeSet<usize>) -> i64 {
    debug_assert!(grouping.len() < i64::BITS as usize);
    let mut value = 0i64;
    for (i, group) in grouping.iter().enumerate() {
        if !grouping_set.contains(group) {
            value += 1i64 << (grouping.len() - (i + 1));
        }
    }
    value
}

fn build_output_schema(op: &GroupedAggregateData) -> SchemaRef {
    let mut fields =
        Vec::with_capacity(op.group_count() + op.aggregates.len() + op.grouping_functions.len());
    for (idx, data_type) in op.group_types.iter().enumerate() {
        fields.push(Field::new(format!("group{idx}"), data_type.clone(), true));
    }
    for (idx, aggregate) in op.aggregates.iter().enumerate() {
        fields.push(Field::new(
            format!("{}{idx}", aggregate.function.name()),
            aggregate.function.output_type(),
            true,
        ));
    }
    for idx in 0..op.grouping_functions.len() {
        fields.push(Field::new(
            format!("grouping_id{idx}"),
            DataType::Int64,
            false,
        ));
    }
    Arc::new(Schema::new(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::agg::functions::CountAgg;

    fn test_op(
        group_types: Vec<DataType>,
        grouping_functions: Vec<Vec<usize>>,
    ) -> Arc<GroupedAggregateData> {
        Arc::new(GroupedAggregateData {
            group_types,
            payload_types: vec![],
            aggregates: vec![AggregateExpr::new(Arc::new(CountAgg::star()), None)],
            grouping_functions,
        })
    }

    #[test]
    fn grouping_value_sets_bits_for_ungrouped_columns() {
        let grouping_set = BTreeSet::from([0]);
        // GROUPING(col0, col1) with only col0 grouped: binary 01.
        assert_eq!(grouping_value(&[0, 1], &grouping_set), 1);
        assert_eq!(grouping_value(&[1, 0], &grouping_set), 2);
        assert_eq!(grouping_value(&[0], &grouping_set), 0);
        assert_eq!(grouping_value(&[1], &grouping_set), 1);
        assert_eq!(grouping_value(&[1, 1, 1], &grouping_set), 7);
    }

    #[test]
    fn empty_grouping_set_synthesizes_constant_group() {
        let radix =
            RadixAggregation::try_new(BTreeSet::new(), test_op(vec![DataType::Utf8], vec![]))
                .unwrap();
        assert_eq!(radix.group_types(), &[DataType::Int8]);
        assert_eq!(radix.null_groups(), &[0]);
    }

    #[test]
    fn null_groups_complement_grouping_set() {
        let radix = RadixAggregation::try_new(
            BTreeSet::from([1]),
            test_op(
                vec![DataType::Utf8, DataType::Int64, DataType::Int32],
                vec![vec![0, 1]],
            ),
        )
        .unwrap();
        assert_eq!(radix.null_groups(), &[0, 2]);
        assert_eq!(radix.group_types(), &[DataType::Int64]);
        // GROUPING(col0, col1): col0 not grouped -> bit 1; col1 grouped -> bit 0.
        assert_eq!(radix.grouping_values(), &[2]);
    }

    #[test]
    fn grouping_set_index_must_be_in_bounds() {
        let result =
            RadixAggregation::try_new(BTreeSet::from([3]), test_op(vec![DataType::Utf8], vec![]));
        assert!(result.is_err());
    }

    #[test]
    fn output_schema_orders_groups_aggs_groupings() {
        let radix = RadixAggregation::try_new(
            BTreeSet::from([0]),
            test_op(vec![DataType::Utf8, DataType::Int64], vec![vec![0, 1]]),
        )
        .unwrap();
        let schema = radix.output_schema();
        assert_eq!(schema.fields().len(), 4);
        assert_eq!(schema.field(0).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(1).data_type(), &DataType::Int64);
        assert_eq!(schema.field(2).data_type(), &DataType::Int64);
        assert_eq!(schema.field(3).data_type(), &DataType::Int64);
        assert_eq!(schema.field(3).name(), "grouping_id0");
    }
}

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
//! Row layout shared by the hash table and the tuple store.
//!
//! A stored row is `(group key row bytes, hash, aggregate state block)`. The
//! group key uses the Arrow row format; the hash column is implicit and always
//! follows the group columns; the state block packs one state per aggregate at
//! a fixed offset.

use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::datatypes::DataType;
use arrow::row::{RowConverter, SortField};
use hashbrown::hash_map::DefaultHashBuilder;

use crate::exec::agg::{AggAllocator, AggStatePtr, AggregateExpr};
use crate::exec::hash_table::hash::seed_from_hasher;

/// Width of the implicit hash column.
pub const HASH_WIDTH: usize = std::mem::size_of::<u64>();

#[derive(Debug)]
pub struct TupleLayout {
    group_types: Vec<DataType>,
    aggregates: Vec<AggregateExpr>,
    state_offsets: Vec<usize>,
    state_width: usize,
    state_align: usize,
    row_width: usize,
    has_destructor: bool,
    hash_seed: u64,
}

impl TupleLayout {
    pub fn try_new(
        group_types: Vec<DataType>,
        aggregates: Vec<AggregateExpr>,
    ) -> Result<Arc<Self>, String> {
        if group_types.is_empty() {
            return Err("tuple layout requires at least one group column".to_string());
        }
        let mut state_offsets = Vec::with_capacity(aggregates.len());
        let mut offset = 0usize;
        let mut state_align = 1usize;
        let mut has_destructor = false;
        for expr in &aggregates {
            let (size, align) = expr.function.state_layout();
            let align_mask = align.max(1) - 1;
            offset = (offset + align_mask) & !align_mask;
            state_offsets.push(offset);
            offset += size;
            state_align = state_align.max(align.max(1));
            has_destructor |= expr.function.has_destructor();
        }
        let state_width = offset;
        let group_width: usize = group_types.iter().map(estimated_value_width).sum();
        let row_width = (group_width + HASH_WIDTH + state_width).max(1);
        Ok(Arc::new(Self {
            group_types,
            aggregates,
            state_offsets,
            state_width,
            state_align,
            row_width,
            has_destructor,
            hash_seed: seed_from_hasher(&DefaultHashBuilder::default()),
        }))
    }

    pub fn group_types(&self) -> &[DataType] {
        &self.group_types
    }

    pub fn aggregates(&self) -> &[AggregateExpr] {
        &self.aggregates
    }

    pub fn state_width(&self) -> usize {
        self.state_width
    }

    pub fn state_align(&self) -> usize {
        self.state_align
    }

    /// Estimated fixed width of one stored row. Used for policy math only;
    /// the actual group key encoding is variable-width.
    pub fn row_width(&self) -> usize {
        self.row_width
    }

    pub fn has_destructor(&self) -> bool {
        self.has_destructor
    }

    /// Hash seed shared by every hash table built over this layout, so all
    /// threads agree on radix partition assignment.
    pub fn hash_seed(&self) -> u64 {
        self.hash_seed
    }

    /// Converter for the group key columns. Built per consumer; the encoding
    /// is deterministic for a fixed set of sort fields.
    pub fn row_converter(&self) -> Result<RowConverter, String> {
        let fields = self
            .group_types
            .iter()
            .cloned()
            .map(SortField::new)
            .collect::<Vec<_>>();
        RowConverter::new(fields).map_err(|e| e.to_string())
    }

    /// Initialize every aggregate state in a freshly allocated row state block.
    pub fn init_states(&self, base: AggStatePtr) {
        for (expr, &offset) in self.aggregates.iter().zip(self.state_offsets.iter()) {
            expr.function.init_state(base + offset);
        }
    }

    /// Accumulate payload rows into row states: `bases[i]` receives payload
    /// row `sel[i]`.
    pub fn update_states(
        &self,
        bases: &[AggStatePtr],
        sel: &[usize],
        payload: &[ArrayRef],
        allocator: &AggAllocator,
    ) -> Result<(), String> {
        if bases.len() != sel.len() {
            return Err("update selection count mismatch".to_string());
        }
        if bases.is_empty() {
            return Ok(());
        }
        for (expr, &offset) in self.aggregates.iter().zip(self.state_offsets.iter()) {
            let states = bases.iter().map(|&b| b + offset).collect::<Vec<_>>();
            let input = match expr.payload_index {
                Some(idx) => Some(payload.get(idx).ok_or_else(|| {
                    format!(
                        "aggregate payload column {} missing (payload has {})",
                        idx,
                        payload.len()
                    )
                })?),
                None => None,
            };
            expr.function.update_batch(&states, sel, input, allocator)?;
        }
        Ok(())
    }

    /// Merge `src[i]`'s states into `dst[i]`'s, aggregate by aggregate.
    /// Source states are consumed (see the `AggregateFunction` contract).
    pub fn combine_states(
        &self,
        src_bases: &[AggStatePtr],
        dst_bases: &[AggStatePtr],
        allocator: &AggAllocator,
    ) -> Result<(), String> {
        if src_bases.len() != dst_bases.len() {
            return Err("combine state count mismatch".to_string());
        }
        if src_bases.is_empty() {
            return Ok(());
        }
        for (expr, &offset) in self.aggregates.iter().zip(self.state_offsets.iter()) {
            let src = src_bases.iter().map(|&b| b + offset).collect::<Vec<_>>();
            let dst = dst_bases.iter().map(|&b| b + offset).collect::<Vec<_>>();
            expr.function.combine_batch(&src, &dst, allocator)?;
        }
        Ok(())
    }

    /// Finalize every aggregate into an output column, one column per
    /// aggregate in declaration order.
    pub fn finalize_states(&self, bases: &[AggStatePtr]) -> Result<Vec<ArrayRef>, String> {
        let mut columns = Vec::with_capacity(self.aggregates.len());
        for (expr, &offset) in self.aggregates.iter().zip(self.state_offsets.iter()) {
            let states = bases.iter().map(|&b| b + offset).collect::<Vec<_>>();
            columns.push(expr.function.finalize_batch(&states)?);
        }
        Ok(columns)
    }

    /// Run destructors for every state in `bases`. Only aggregates that carry
    /// a destructor are visited.
    pub fn destroy_states(&self, bases: &[AggStatePtr]) {
        if !self.has_destructor {
            return;
        }
        for (expr, &offset) in self.aggregates.iter().zip(self.state_offsets.iter()) {
            if !expr.function.has_destructor() {
                continue;
            }
            for &base in bases {
                expr.function.destroy_state(base + offset);
            }
        }
    }
}

fn estimated_value_width(data_type: &DataType) -> usize {
    match data_type {
        DataType::Boolean | DataType::Int8 => 1,
        DataType::Int16 => 2,
        DataType::Int32 | DataType::Float32 | DataType::Date32 => 4,
        DataType::Utf8 | DataType::Binary => 16,
        _ => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::agg::functions::{CountAgg, SumAgg, StringAggAgg};

    #[test]
    fn state_offsets_are_aligned() {
        let layout = TupleLayout::try_new(
            vec![DataType::Utf8],
            vec![
                AggregateExpr::new(Arc::new(CountAgg::star()), None),
                AggregateExpr::new(Arc::new(SumAgg::try_new(&DataType::Int64).unwrap()), Some(0)),
            ],
        )
        .unwrap();
        assert_eq!(layout.state_offsets[0], 0);
        assert_eq!(layout.state_offsets[1] % 8, 0);
        assert!(layout.state_width() >= 16);
        assert!(!layout.has_destructor());
    }

    #[test]
    fn destructor_flag_propagates() {
        let layout = TupleLayout::try_new(
            vec![DataType::Int64],
            vec![AggregateExpr::new(Arc::new(StringAggAgg::new(",")), Some(0))],
        )
        .unwrap();
        assert!(layout.has_destructor());
    }

    #[test]
    fn layout_requires_group_columns() {
        assert!(TupleLayout::try_new(vec![], vec![]).is_err());
    }
}

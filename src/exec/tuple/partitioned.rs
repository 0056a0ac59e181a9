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

use crate::exec::agg::AggStatePtr;
use crate::exec::tuple::layout::TupleLayout;
use crate::exec::tuple::rows::TupleRows;

/// Number of partitions for a radix-bit count.
pub fn radix_partition_count(radix_bits: usize) -> usize {
    1 << radix_bits
}

/// Partition a 64-bit hash by its top `radix_bits` bits.
pub fn radix_partition_index(hash: u64, radix_bits: usize) -> usize {
    if radix_bits == 0 {
        return 0;
    }
    (hash >> (64 - radix_bits)) as usize
}

/// Tuple rows partitioned by the top radix bits of the row hash.
#[derive(Debug)]
pub struct PartitionedTupleRows {
    layout: Arc<TupleLayout>,
    radix_bits: usize,
    partitions: Vec<TupleRows>,
}

impl PartitionedTupleRows {
    pub fn new(layout: Arc<TupleLayout>, radix_bits: usize) -> Self {
        let partitions = (0..radix_partition_count(radix_bits))
            .map(|_| TupleRows::new(Arc::clone(&layout)))
            .collect();
        Self {
            layout,
            radix_bits,
            partitions,
        }
    }

    pub fn layout(&self) -> &Arc<TupleLayout> {
        &self.layout
    }

    pub fn radix_bits(&self) -> usize {
        self.radix_bits
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn count(&self) -> usize {
        self.partitions.iter().map(TupleRows::count).sum()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.partitions.iter().map(TupleRows::size_in_bytes).sum()
    }

    pub fn partitions(&self) -> &[TupleRows] {
        &self.partitions
    }

    /// Append one row, assigning it to the partition selected by its hash.
    /// Returns `(partition, row)`.
    pub(crate) fn append_row(
        &mut self,
        key: &[u8],
        hash: u64,
        state_src: Option<AggStatePtr>,
    ) -> (usize, usize) {
        let partition = radix_partition_index(hash, self.radix_bits);
        let row = self.partitions[partition].append_row(key, hash, state_src);
        (partition, row)
    }

    /// Move the other store's partitions into this one, one-to-one. Both
    /// stores must be partitioned at the same radix bits.
    pub fn combine(&mut self, other: PartitionedTupleRows) -> Result<(), String> {
        if other.radix_bits != self.radix_bits {
            return Err(format!(
                "cannot combine partitioned data: radix bits mismatch ({} vs {})",
                self.radix_bits, other.radix_bits
            ));
        }
        for (dst, src) in self.partitions.iter_mut().zip(other.partitions) {
            dst.absorb(src);
        }
        Ok(())
    }

    /// Re-distribute every row into `target`, which must be partitioned at
    /// the same or a larger radix-bit count. Row states move with the rows.
    pub fn repartition_into(self, target: &mut PartitionedTupleRows) -> Result<(), String> {
        if target.radix_bits < self.radix_bits {
            return Err(format!(
                "cannot repartition from {} to fewer bits {}",
                self.radix_bits, target.radix_bits
            ));
        }
        if target.radix_bits == self.radix_bits {
            return target.combine(self);
        }
        for partition in self.partitions {
            for row in 0..partition.count() {
                target.append_row(
                    partition.key(row),
                    partition.hash(row),
                    Some(partition.state_base(row)),
                );
            }
        }
        Ok(())
    }

    pub fn take_partitions(self) -> Vec<TupleRows> {
        self.partitions
    }
}

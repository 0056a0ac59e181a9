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
use arrow::array::{ArrayRef, RecordBatch, RecordBatchOptions};
use arrow::datatypes::SchemaRef;

/// A chunk of data, consisting of multiple rows. Wrapper around Arrow RecordBatch;
/// columns are addressed positionally.
#[derive(Debug, Clone)]
pub struct Chunk {
    batch: RecordBatch,
}

impl Chunk {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    /// Build a chunk from a schema and columns. `num_rows` carries the row count
    /// for the zero-column case (e.g. aggregation output with no projected columns).
    pub fn try_from_arrays(
        schema: SchemaRef,
        arrays: Vec<ArrayRef>,
        num_rows: usize,
    ) -> Result<Self, String> {
        let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
        let batch = RecordBatch::try_new_with_options(schema, arrays, &options)
            .map_err(|e| e.to_string())?;
        Ok(Self { batch })
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn column(&self, index: usize) -> Result<ArrayRef, String> {
        self.batch
            .columns()
            .get(index)
            .cloned()
            .ok_or_else(|| {
                format!(
                    "column index {} out of bounds (num_columns={})",
                    index,
                    self.batch.num_columns()
                )
            })
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn estimated_bytes(&self) -> usize {
        self.batch.get_array_memory_size()
    }
}

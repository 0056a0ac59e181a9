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

use arrow::array::{Array, ArrayRef, StringArray, StringBuilder};
use arrow::datatypes::DataType;

use super::super::{AggAllocator, AggStatePtr, AggregateFunction};
use super::common::{downcast, required};

/// State is a single nullable heap pointer (`Box<String>` as usize, 0 = none).
/// This is the one shipped aggregate with a real destructor; the engine's
/// destroy bookkeeping is exercised through it.
#[derive(Clone, Copy)]
struct StringAggState {
    value: usize,
}

/// `string_agg(col, separator)`: concatenates non-null values in arrival order.
pub struct StringAggAgg {
    separator: String,
}

impl StringAggAgg {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }

    fn state_at(state: AggStatePtr) -> *mut StringAggState {
        state as *mut StringAggState
    }

    /// Take the boxed string out of a state, leaving it empty.
    unsafe fn take(state: AggStatePtr) -> Option<Box<String>> {
        let slot = unsafe { &mut *Self::state_at(state) };
        if slot.value == 0 {
            return None;
        }
        let boxed = unsafe { Box::from_raw(slot.value as *mut String) };
        slot.value = 0;
        Some(boxed)
    }
}

impl AggregateFunction for StringAggAgg {
    fn name(&self) -> &str {
        "string_agg"
    }

    fn output_type(&self) -> DataType {
        DataType::Utf8
    }

    fn state_layout(&self) -> (usize, usize) {
        (
            std::mem::size_of::<StringAggState>(),
            std::mem::align_of::<StringAggState>(),
        )
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe {
            std::ptr::write(Self::state_at(state), StringAggState { value: 0 });
        }
    }

    fn update_batch(
        &self,
        states: &[AggStatePtr],
        sel: &[usize],
        input: Option<&ArrayRef>,
        _allocator: &AggAllocator,
    ) -> Result<(), String> {
        let array = required(input, "string_agg")?;
        let arr = downcast::<StringArray>(array)?;
        for (&state, &row) in states.iter().zip(sel.iter()) {
            if arr.is_null(row) {
                continue;
            }
            let slot = unsafe { &mut *Self::state_at(state) };
            if slot.value == 0 {
                let boxed = Box::new(arr.value(row).to_string());
                slot.value = Box::into_raw(boxed) as usize;
            } else {
                let current = unsafe { &mut *(slot.value as *mut String) };
                current.push_str(&self.separator);
                current.push_str(arr.value(row));
            }
        }
        Ok(())
    }

    fn combine_batch(
        &self,
        src: &[AggStatePtr],
        dst: &[AggStatePtr],
        _allocator: &AggAllocator,
    ) -> Result<(), String> {
        for (&src, &dst) in src.iter().zip(dst.iter()) {
            let Some(taken) = (unsafe { Self::take(src) }) else {
                continue;
            };
            let slot = unsafe { &mut *Self::state_at(dst) };
            if slot.value == 0 {
                slot.value = Box::into_raw(taken) as usize;
            } else {
                let current = unsafe { &mut *(slot.value as *mut String) };
                current.push_str(&self.separator);
                current.push_str(&taken);
            }
        }
        Ok(())
    }

    fn finalize_batch(&self, states: &[AggStatePtr]) -> Result<ArrayRef, String> {
        let mut builder = StringBuilder::new();
        for &state in states {
            let slot = unsafe { &*Self::state_at(state) };
            if slot.value == 0 {
                builder.append_null();
            } else {
                let current = unsafe { &*(slot.value as *const String) };
                builder.append_value(current.as_str());
            }
        }
        Ok(Arc::new(builder.finish()))
    }

    fn has_destructor(&self) -> bool {
        true
    }

    fn destroy_state(&self, state: AggStatePtr) {
        unsafe {
            drop(Self::take(state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc_state(arena: &AggAllocator, agg: &dyn AggregateFunction) -> AggStatePtr {
        let (size, align) = agg.state_layout();
        let ptr = arena.alloc(size, align);
        agg.init_state(ptr);
        ptr
    }

    #[test]
    fn concatenates_with_separator() {
        let arena = AggAllocator::default();
        let agg = StringAggAgg::new(",");
        let state = alloc_state(&arena, &agg);
        let input: ArrayRef = Arc::new(StringArray::from(vec![Some("a"), None, Some("b")]));
        agg.update_batch(&[state; 3], &[0, 1, 2], Some(&input), &arena)
            .unwrap();
        let out = agg.finalize_batch(&[state]).unwrap();
        let out = out.as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(out.value(0), "a,b");
        agg.destroy_state(state);
    }

    #[test]
    fn combine_moves_source_state() {
        let arena = AggAllocator::default();
        let agg = StringAggAgg::new("-");
        let a = alloc_state(&arena, &agg);
        let b = alloc_state(&arena, &agg);
        let input: ArrayRef = Arc::new(StringArray::from(vec![Some("x"), Some("y")]));
        agg.update_batch(&[a, b], &[0, 1], Some(&input), &arena)
            .unwrap();
        agg.combine_batch(&[b], &[a], &arena).unwrap();
        // Source was drained; destroying it must be a no-op.
        agg.destroy_state(b);
        let out = agg.finalize_batch(&[a]).unwrap();
        let out = out.as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(out.value(0), "x-y");
        agg.destroy_state(a);
    }

    #[test]
    fn destroy_is_idempotent_on_drained_state() {
        let arena = AggAllocator::default();
        let agg = StringAggAgg::new(",");
        let state = alloc_state(&arena, &agg);
        let input: ArrayRef = Arc::new(StringArray::from(vec![Some("v")]));
        agg.update_batch(&[state], &[0], Some(&input), &arena)
            .unwrap();
        agg.destroy_state(state);
        agg.destroy_state(state);
    }
}

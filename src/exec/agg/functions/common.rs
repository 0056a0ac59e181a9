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
use arrow::array::{
    Array, ArrayRef, Float32Array, Float64Array, Int8Array, Int16Array, Int32Array, Int64Array,
};
use arrow::datatypes::DataType;

/// Normalized read-only view over signed integer input arrays.
pub(super) enum IntArrayView<'a> {
    Int8(&'a Int8Array),
    Int16(&'a Int16Array),
    Int32(&'a Int32Array),
    Int64(&'a Int64Array),
}

impl<'a> IntArrayView<'a> {
    pub(super) fn new(array: &'a ArrayRef) -> Result<Self, String> {
        match array.data_type() {
            DataType::Int8 => Ok(Self::Int8(downcast(array)?)),
            DataType::Int16 => Ok(Self::Int16(downcast(array)?)),
            DataType::Int32 => Ok(Self::Int32(downcast(array)?)),
            DataType::Int64 => Ok(Self::Int64(downcast(array)?)),
            other => Err(format!("expected integer input, got {:?}", other)),
        }
    }

    pub(super) fn value_at(&self, row: usize) -> Option<i64> {
        match self {
            Self::Int8(arr) => (!arr.is_null(row)).then(|| i64::from(arr.value(row))),
            Self::Int16(arr) => (!arr.is_null(row)).then(|| i64::from(arr.value(row))),
            Self::Int32(arr) => (!arr.is_null(row)).then(|| i64::from(arr.value(row))),
            Self::Int64(arr) => (!arr.is_null(row)).then(|| arr.value(row)),
        }
    }
}

/// Normalized read-only view over floating-point input arrays.
pub(super) enum FloatArrayView<'a> {
    Float32(&'a Float32Array),
    Float64(&'a Float64Array),
}

impl<'a> FloatArrayView<'a> {
    pub(super) fn new(array: &'a ArrayRef) -> Result<Self, String> {
        match array.data_type() {
            DataType::Float32 => Ok(Self::Float32(downcast(array)?)),
            DataType::Float64 => Ok(Self::Float64(downcast(array)?)),
            other => Err(format!("expected float input, got {:?}", other)),
        }
    }

    pub(super) fn value_at(&self, row: usize) -> Option<f64> {
        match self {
            Self::Float32(arr) => (!arr.is_null(row)).then(|| f64::from(arr.value(row))),
            Self::Float64(arr) => (!arr.is_null(row)).then(|| arr.value(row)),
        }
    }
}

/// Numeric view that widens both integer and float inputs to f64.
pub(super) enum NumericArrayView<'a> {
    Int(IntArrayView<'a>),
    Float(FloatArrayView<'a>),
}

impl<'a> NumericArrayView<'a> {
    pub(super) fn new(array: &'a ArrayRef) -> Result<Self, String> {
        match array.data_type() {
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => {
                Ok(Self::Int(IntArrayView::new(array)?))
            }
            DataType::Float32 | DataType::Float64 => Ok(Self::Float(FloatArrayView::new(array)?)),
            other => Err(format!("expected numeric input, got {:?}", other)),
        }
    }

    pub(super) fn value_at(&self, row: usize) -> Option<f64> {
        match self {
            Self::Int(view) => view.value_at(row).map(|v| v as f64),
            Self::Float(view) => view.value_at(row),
        }
    }
}

pub(super) fn downcast<'a, T: 'static>(array: &'a ArrayRef) -> Result<&'a T, String> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| format!("failed to downcast {:?} input", array.data_type()))
}

pub(super) fn required<'a>(input: Option<&'a ArrayRef>, name: &str) -> Result<&'a ArrayRef, String> {
    input.ok_or_else(|| format!("{name} input missing"))
}

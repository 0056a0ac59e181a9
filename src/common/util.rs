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

use std::sync::atomic::{AtomicU64, Ordering};

/// Smallest power of two that is >= `value` (and >= 1).
pub fn next_power_of_two(value: usize) -> usize {
    value.max(1).next_power_of_two()
}

/// Number of bits needed to address `count` slots, where `count` is a power of two.
/// `radix_bits_for(1) == 0`, `radix_bits_for(8) == 3`.
pub fn radix_bits_for(count: usize) -> usize {
    debug_assert!(count.is_power_of_two());
    count.max(1).trailing_zeros() as usize
}

/// An f64 with atomic store/load, for cross-thread progress reporting.
#[derive(Debug)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    pub fn store(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Release);
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_f64_round_trips() {
        let value = AtomicF64::new(0.0);
        value.store(0.625);
        assert_eq!(value.load(), 0.625);
    }

    #[test]
    fn next_power_of_two_rounds_up() {
        assert_eq!(next_power_of_two(0), 1);
        assert_eq!(next_power_of_two(1), 1);
        assert_eq!(next_power_of_two(3), 4);
        assert_eq!(next_power_of_two(4), 4);
        assert_eq!(next_power_of_two(1000), 1024);
    }

    #[test]
    fn radix_bits_for_powers_of_two() {
        assert_eq!(radix_bits_for(1), 0);
        assert_eq!(radix_bits_for(2), 1);
        assert_eq!(radix_bits_for(128), 7);
    }
}

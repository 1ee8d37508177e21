// This file is part of babe-producer.

// Copyright (C) 2021-2022 the babe-producer authors.
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Slot arithmetic.
//!
//! Slots are fixed-duration time windows counted from the Unix epoch:
//! slot `s` covers `[s * duration, (s + 1) * duration)`. All functions here
//! are pure except for reading the wall clock.

use std::time::{Duration, SystemTime};

/// Returns the current duration since the Unix epoch.
pub fn duration_now() -> Duration {
	let now = SystemTime::now();
	now.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_else(|e| {
		panic!("Current time {:?} is before unix epoch. Something is wrong: {:?}", now, e)
	})
}

/// The slot number containing the current wall-clock time.
pub fn current_slot(slot_duration: Duration) -> u64 {
	(duration_now().as_nanos() / slot_duration.as_nanos()) as u64
}

/// The wall-clock time (as duration since the Unix epoch) at which the
/// given slot starts.
pub fn slot_start_time(slot: u64, slot_duration: Duration) -> Duration {
	Duration::from_nanos(slot.saturating_mul(slot_duration.as_nanos() as u64))
}

/// The duration until the given slot starts, zero if it already has.
pub fn time_until_slot(slot: u64, slot_duration: Duration) -> Duration {
	slot_start_time(slot, slot_duration).saturating_sub(duration_now())
}

/// Information about a slot this node is handling.
#[derive(Clone, Debug)]
pub struct Slot {
	/// The slot number.
	pub number: u64,
	/// Wall-clock time (since the Unix epoch) at which handling started.
	pub start: Duration,
	/// Slot duration.
	pub duration: Duration,
}

/// The proportion of a slot dedicated to proposing, in `[0, 1]`.
///
/// The block builder stops draining the transaction pool once this share of
/// the slot has elapsed, leaving the remainder for finalization, sealing and
/// import.
#[derive(Clone, Copy, Debug)]
pub struct SlotProportion(f32);

impl SlotProportion {
	/// Create a new proportion, clamped to `[0, 1]`.
	pub fn new(inner: f32) -> Self {
		SlotProportion(inner.clamp(0.0, 1.0))
	}

	/// The proportion as a float.
	pub fn get(self) -> f32 {
		self.0
	}
}

impl Default for SlotProportion {
	fn default() -> Self {
		SlotProportion(0.75)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const SLOT_DURATION: Duration = Duration::from_secs(6);

	#[test]
	fn slot_start_times_are_spaced_by_the_duration() {
		assert_eq!(slot_start_time(0, SLOT_DURATION), Duration::ZERO);
		assert_eq!(
			slot_start_time(11, SLOT_DURATION) - slot_start_time(10, SLOT_DURATION),
			SLOT_DURATION,
		);
	}

	#[test]
	fn current_slot_is_monotone() {
		let a = current_slot(SLOT_DURATION);
		let b = current_slot(SLOT_DURATION);
		assert!(a <= b);
	}

	#[test]
	fn current_slot_matches_its_own_start_time() {
		let slot = current_slot(SLOT_DURATION);
		assert!(slot_start_time(slot, SLOT_DURATION) <= duration_now());
		assert!(duration_now() < slot_start_time(slot + 1, SLOT_DURATION));
	}

	#[test]
	fn time_until_elapsed_slot_is_zero() {
		let slot = current_slot(SLOT_DURATION);
		assert_eq!(time_until_slot(slot.saturating_sub(10), SLOT_DURATION), Duration::ZERO);
	}

	#[test]
	fn slot_proportion_is_clamped() {
		assert_eq!(SlotProportion::new(2.0).get(), 1.0);
		assert_eq!(SlotProportion::new(-1.0).get(), 0.0);
		assert_eq!(SlotProportion::new(0.5).get(), 0.5);
		assert_eq!(SlotProportion::default().get(), 0.75);
	}
}

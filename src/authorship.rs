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

//! BABE leader election.
//!
//! On every slot each authority evaluates a VRF over a transcript derived
//! from the epoch randomness, the slot number and the epoch index. If the
//! output is below the epoch threshold the authority is entitled to author
//! a block in that slot, and the output and proof are embedded in the block
//! so any peer can check the claim.

use std::collections::HashMap;

use merlin::Transcript;
use schnorrkel::Keypair;

use crate::{
	epochs::EpochData,
	error::Error,
	primitives::{Randomness, VrfOutputAndProof, BABE_ENGINE_ID, VRF_OUTPUT_LENGTH},
};

/// Calculates the primary selection threshold for an epoch, given the
/// slot-fill ratio `c = c1 / c2` (`1 - c` is the probability of a slot
/// staying empty) and the size of the authority set.
pub fn calculate_primary_threshold(
	c: (u64, u64),
	authorities: usize,
) -> Result<u128, Error> {
	use num_bigint::BigUint;
	use num_rational::BigRational;
	use num_traits::{cast::ToPrimitive, identities::One};

	let (c1, c2) = c;
	if c2 == 0 || c1 > c2 || authorities == 0 {
		return Err(Error::InvalidThresholdParameters { c1, c2, authorities })
	}

	let c = c1 as f64 / c2 as f64;
	let theta = 1f64 / authorities as f64;

	let calc = || -> Option<u128> {
		let p = BigRational::from_float(1f64 - (1f64 - c).powf(theta))?;
		let numer = p.numer().to_biguint()?;
		let denom = p.denom().to_biguint()?;
		let base: BigUint = BigUint::one() << 128;
		(base * numer / denom).to_u128()
	};

	// 2^128 itself (c = 1) does not fit a u128, saturate to "always elected".
	Ok(calc().unwrap_or(u128::MAX))
}

/// Returns true if the given VRF output is below the given threshold.
///
/// The output is interpreted as the big-endian u128 of its first 16 bytes.
pub fn check_primary_threshold(output: &[u8; VRF_OUTPUT_LENGTH], threshold: u128) -> bool {
	let mut semi = [0u8; 16];
	semi.copy_from_slice(&output[..16]);
	u128::from_be_bytes(semi) < threshold
}

/// Build the VRF transcript for the given slot.
pub fn make_transcript(randomness: &Randomness, slot_number: u64, epoch: u64) -> Transcript {
	let mut transcript = Transcript::new(&BABE_ENGINE_ID);
	transcript.append_message(b"slot number", &slot_number.to_le_bytes());
	transcript.append_message(b"current epoch", &epoch.to_le_bytes());
	transcript.append_message(b"chain randomness", &randomness[..]);
	transcript
}

/// Try to claim the given slot, returning the VRF output and proof if the
/// output passes the epoch threshold.
///
/// The VRF output is a pure function of the transcript and the keypair, so
/// claims can be computed for the whole epoch up front.
pub(crate) fn claim_slot(
	keypair: &Keypair,
	slot_number: u64,
	epoch: u64,
	epoch_data: &EpochData,
) -> Option<VrfOutputAndProof> {
	let transcript = make_transcript(&epoch_data.randomness, slot_number, epoch);
	let (inout, proof, _) = keypair.vrf_sign(transcript);
	let output = inout.to_output().to_bytes();

	if check_primary_threshold(&output, epoch_data.threshold) {
		Some(VrfOutputAndProof { output, proof: proof.to_bytes() })
	} else {
		None
	}
}

/// Run the lottery for every slot of an epoch, returning the map of slots
/// this node is elected leader for.
pub(crate) fn run_epoch_lottery(
	keypair: &Keypair,
	epoch: u64,
	epoch_start: u64,
	epoch_length: u64,
	epoch_data: &EpochData,
) -> HashMap<u64, VrfOutputAndProof> {
	(epoch_start..epoch_start.saturating_add(epoch_length))
		.filter_map(|slot| {
			claim_slot(keypair, slot, epoch, epoch_data).map(|proof| (slot, proof))
		})
		.collect()
}

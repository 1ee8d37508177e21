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

//! BABE digest items.
//!
//! A sealed header carries two BABE digest items: a pre-runtime digest with
//! the leader-election evidence, and a seal with the author's signature over
//! the pre-seal header hash.

use codec::{Decode, Encode};

use crate::{
	error::Error,
	primitives::{
		AuthorityIndex, DigestItem, Header, BABE_ENGINE_ID, VRF_OUTPUT_LENGTH, VRF_PROOF_LENGTH,
	},
};

/// The sr25519 signing context used for seal signatures.
pub const SEAL_SIGNING_CONTEXT: &[u8] = b"substrate";

/// The payload of a BABE pre-runtime digest.
///
/// This contains all data required to validate the slot claim: the claiming
/// authority, the slot, and the VRF output and proof for the slot's
/// transcript. Scalars are encoded little-endian.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct PreDigest {
	/// Index of the claiming authority in the epoch's authority set.
	pub authority_index: AuthorityIndex,
	/// The claimed slot.
	pub slot_number: u64,
	/// VRF pre-output for the slot transcript.
	pub vrf_output: [u8; VRF_OUTPUT_LENGTH],
	/// VRF proof for the slot transcript.
	pub vrf_proof: [u8; VRF_PROOF_LENGTH],
}

impl DigestItem {
	/// Construct a digest item carrying a BABE pre-runtime digest.
	pub fn babe_pre_digest(digest: &PreDigest) -> Self {
		DigestItem::PreRuntime(BABE_ENGINE_ID, digest.encode())
	}

	/// Construct a digest item carrying a BABE seal.
	pub fn babe_seal(signature: [u8; 64]) -> Self {
		DigestItem::Seal(BABE_ENGINE_ID, signature.to_vec())
	}

	/// If this item is a BABE pre-runtime digest, return its payload.
	pub fn as_babe_pre_digest(&self) -> Option<PreDigest> {
		match self {
			DigestItem::PreRuntime(id, data) if *id == BABE_ENGINE_ID =>
				PreDigest::decode(&mut &data[..]).ok(),
			_ => None,
		}
	}

	/// If this item is a BABE seal, return the signature bytes.
	pub fn as_babe_seal(&self) -> Option<[u8; 64]> {
		match self {
			DigestItem::Seal(id, data) if *id == BABE_ENGINE_ID =>
				<[u8; 64]>::try_from(&data[..]).ok(),
			_ => None,
		}
	}
}

/// Extract the BABE pre-runtime digest from the given header.
///
/// Exactly one pre-runtime digest is expected on any header produced by this
/// engine; zero or several is an error.
pub fn find_pre_digest(header: &Header) -> Result<PreDigest, Error> {
	let mut pre_digest = None;
	for log in header.digest.logs() {
		match (log.as_babe_pre_digest(), pre_digest.is_some()) {
			(Some(_), true) => return Err(Error::MultiplePreRuntimeDigests),
			(None, _) => {},
			(s, false) => pre_digest = s,
		}
	}
	pre_digest.ok_or(Error::NoPreRuntimeDigest)
}

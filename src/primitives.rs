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

//! Chain primitives used by the block production engine.

use std::fmt;

use blake2::{digest::consts::U32, Blake2b, Digest as _};
use codec::{Decode, Encode};
use schnorrkel::{Keypair, PublicKey, SignatureError};

/// Block hash type.
pub type Hash = primitive_types::H256;

/// Consensus engine identifier carried by digest items.
pub type ConsensusEngineId = [u8; 4];

/// The engine id for BABE digest items.
pub const BABE_ENGINE_ID: ConsensusEngineId = *b"BABE";

/// Index of an authority in the epoch's authority set.
pub type AuthorityIndex = u32;

/// Weight of an authority in the epoch's authority set.
pub type BabeAuthorityWeight = u64;

/// Length of a VRF pre-output in bytes.
pub const VRF_OUTPUT_LENGTH: usize = 32;

/// Length of a VRF proof in bytes.
pub const VRF_PROOF_LENGTH: usize = 64;

/// Length of the per-epoch randomness in bytes.
pub const RANDOMNESS_LENGTH: usize = 32;

/// Per-epoch randomness mixed into every VRF transcript.
pub type Randomness = [u8; RANDOMNESS_LENGTH];

/// Compute the 256-bit BLAKE2b hash of the given data.
pub fn blake2_256(data: &[u8]) -> [u8; 32] {
	let mut hasher = Blake2b::<U32>::new();
	hasher.update(data);
	hasher.finalize().into()
}

/// An sr25519 authority identifier.
#[derive(Clone, PartialEq, Eq, Encode, Decode)]
pub struct AuthorityId(pub [u8; 32]);

impl AuthorityId {
	/// The authority id of the given keypair.
	pub fn from_keypair(keypair: &Keypair) -> Self {
		AuthorityId(keypair.public.to_bytes())
	}

	/// Interpret the id as an sr25519 public key.
	pub fn to_public(&self) -> Result<PublicKey, SignatureError> {
		PublicKey::from_bytes(&self.0)
	}
}

impl fmt::Debug for AuthorityId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{:02x}{:02x}…{:02x}{:02x}",
			self.0[0], self.0[1], self.0[30], self.0[31]
		)
	}
}

/// A VRF pre-output together with the proof any observer can check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VrfOutputAndProof {
	/// The VRF pre-output.
	pub output: [u8; VRF_OUTPUT_LENGTH],
	/// The VRF proof.
	pub proof: [u8; VRF_PROOF_LENGTH],
}

/// An item attached to a block header's digest.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum DigestItem {
	/// Consensus data placed before block execution. For BABE this carries
	/// the leader-election evidence for the block.
	PreRuntime(ConsensusEngineId, Vec<u8>),
	/// A seal placed after execution, carrying the author's signature over
	/// the pre-seal header hash.
	Seal(ConsensusEngineId, Vec<u8>),
}

/// The digest of a block header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct Digest {
	/// All digest items, in the order they were pushed.
	pub logs: Vec<DigestItem>,
}

impl Digest {
	/// Append a digest item.
	pub fn push(&mut self, item: DigestItem) {
		self.logs.push(item);
	}

	/// All digest items.
	pub fn logs(&self) -> &[DigestItem] {
		&self.logs
	}
}

/// A block header.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Header {
	/// Hash of the parent header.
	pub parent_hash: Hash,
	/// Block number, starting at zero for genesis.
	pub number: u64,
	/// Root of the state trie after executing this block.
	pub state_root: Hash,
	/// Root of the extrinsics trie.
	pub extrinsics_root: Hash,
	/// Consensus digest items.
	pub digest: Digest,
}

impl Header {
	/// Create a new header.
	pub fn new(
		parent_hash: Hash,
		number: u64,
		state_root: Hash,
		extrinsics_root: Hash,
		digest: Digest,
	) -> Self {
		Header { parent_hash, number, state_root, extrinsics_root, digest }
	}

	/// The BLAKE2b-256 hash of the SCALE-encoded header.
	pub fn hash(&self) -> Hash {
		blake2_256(&self.encode()).into()
	}
}

/// An opaque extrinsic.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Extrinsic(pub Vec<u8>);

/// A block: header plus body.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Block {
	/// The sealed header.
	pub header: Header,
	/// The extrinsics included in the block.
	pub body: Vec<Extrinsic>,
}

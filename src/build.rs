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

//! Assembling and sealing blocks.

use std::sync::Arc;

use log::{debug, trace};
use schnorrkel::{signing_context, Keypair};

use crate::{
	digests::{PreDigest, SEAL_SIGNING_CONTEXT},
	error::Error,
	primitives::{Block, DigestItem, Extrinsic, Header},
	slots::{duration_now, Slot, SlotProportion},
	traits::{ApplyExtrinsicOutcome, Runtime, TransactionState},
};

/// Builds and seals one block per claimed slot.
pub(crate) struct BlockBuilder {
	keypair: Arc<Keypair>,
	transaction_state: Arc<dyn TransactionState>,
	block_proposal_slot_portion: SlotProportion,
}

impl BlockBuilder {
	pub fn new(
		keypair: Arc<Keypair>,
		transaction_state: Arc<dyn TransactionState>,
		block_proposal_slot_portion: SlotProportion,
	) -> Self {
		BlockBuilder { keypair, transaction_state, block_proposal_slot_portion }
	}

	/// Build a block on top of `parent` for the given slot and seal it.
	///
	/// The caller must hold the storage lock and have installed the parent's
	/// trie state on `runtime` before calling this.
	pub fn build_block(
		&self,
		parent: &Header,
		slot: &Slot,
		pre_digest: PreDigest,
		runtime: &dyn Runtime,
	) -> Result<Block, Error> {
		debug!(
			target: "babe",
			"initialising block: parent {} number {} slot {}",
			parent.hash(), parent.number, slot.number,
		);
		runtime.initialize_block(parent)?;

		let body = self.apply_extrinsics(slot, runtime)?;
		let mut header = runtime.finalize_block()?;

		header.digest.push(DigestItem::babe_pre_digest(&pre_digest));

		// the seal commits to everything above it, including the pre-digest
		let pre_seal_hash = header.hash();
		let signature =
			self.keypair.sign(signing_context(SEAL_SIGNING_CONTEXT).bytes(pre_seal_hash.as_bytes()));
		header.digest.push(DigestItem::babe_seal(signature.to_bytes()));

		Ok(Block { header, body })
	}

	/// Drain ready extrinsics into the block until the pool is empty, the
	/// runtime reports the block full, or the slot's proposal share elapses.
	fn apply_extrinsics(&self, slot: &Slot, runtime: &dyn Runtime) -> Result<Vec<Extrinsic>, Error> {
		let deadline = slot.start + slot.duration.mul_f32(self.block_proposal_slot_portion.get());
		debug!(
			target: "babe",
			"pool has {} ready extrinsics for slot {}",
			self.transaction_state.pending().len(), slot.number,
		);

		let mut included = Vec::new();
		loop {
			if duration_now() >= deadline {
				debug!(
					target: "babe",
					"proposal deadline for slot {} reached, proceeding with {} extrinsics",
					slot.number, included.len(),
				);
				break
			}

			let extrinsic = match self.transaction_state.pop() {
				Some(extrinsic) => extrinsic,
				None => break,
			};

			match runtime.apply_extrinsic(extrinsic.clone())? {
				ApplyExtrinsicOutcome::Included => {
					trace!(target: "babe", "pushed extrinsic {:?} to the block", extrinsic);
					included.push(extrinsic);
				},
				ApplyExtrinsicOutcome::ExhaustsResources => {
					debug!(target: "babe", "block is full, proceeding with proposing");
					break
				},
				ApplyExtrinsicOutcome::Invalid => {
					debug!(target: "babe", "dropping invalid extrinsic {:?}", extrinsic);
				},
			}
		}

		Ok(included)
	}
}

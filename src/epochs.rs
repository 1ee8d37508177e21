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

//! Per-epoch authoring data.

use log::debug;
use schnorrkel::Keypair;

use crate::{
	authorship::calculate_primary_threshold,
	error::Error,
	primitives::{AuthorityId, AuthorityIndex, BabeAuthorityWeight, Randomness},
};

/// Epoch parameters as stored by the epoch store: the randomness and the
/// authority set, announced one epoch in advance by the runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EpochDescriptor {
	/// Randomness for this epoch.
	pub randomness: Randomness,
	/// The authorities and their weights.
	pub authorities: Vec<(AuthorityId, BabeAuthorityWeight)>,
}

/// Epoch configuration: `c1 / c2` is the slot-fill ratio the threshold is
/// derived from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfigData {
	/// Numerator of the slot-fill ratio.
	pub c1: u64,
	/// Denominator of the slot-fill ratio.
	pub c2: u64,
}

/// Everything this node needs to author during one epoch.
#[derive(Clone, Debug)]
pub struct EpochData {
	/// Randomness for this epoch, mixed into every slot transcript.
	pub randomness: Randomness,
	/// The authorities and their weights.
	pub authorities: Vec<(AuthorityId, BabeAuthorityWeight)>,
	/// This node's position in the authority set, if it is in it.
	pub authority_index: Option<AuthorityIndex>,
	/// The VRF acceptance cutoff for this epoch.
	pub threshold: u128,
}

impl EpochData {
	/// Derive the authoring data for an epoch from the stored descriptor and
	/// configuration. `keypair` is this node's authority key, if it has one.
	///
	/// A key that is not in the epoch's authority set is not an error here:
	/// the set may change on any epoch boundary, so the node keeps following
	/// epochs without claiming slots.
	pub(crate) fn new(
		descriptor: EpochDescriptor,
		config: &ConfigData,
		keypair: Option<&Keypair>,
	) -> Result<Self, Error> {
		let threshold =
			calculate_primary_threshold((config.c1, config.c2), descriptor.authorities.len())?;

		let authority_index = match keypair {
			Some(keypair) => match find_authority_index(&descriptor.authorities, keypair) {
				Ok(index) => Some(index),
				Err(Error::NotAuthority) => {
					debug!(target: "babe", "local key is not in the authority set for this epoch");
					None
				},
				Err(err) => return Err(err),
			},
			None => None,
		};

		Ok(EpochData {
			randomness: descriptor.randomness,
			authorities: descriptor.authorities,
			authority_index,
			threshold,
		})
	}
}

/// Find the index of the given keypair's public key in the authority set.
pub(crate) fn find_authority_index(
	authorities: &[(AuthorityId, BabeAuthorityWeight)],
	keypair: &Keypair,
) -> Result<AuthorityIndex, Error> {
	let public = keypair.public.to_bytes();
	authorities
		.iter()
		.position(|(id, _)| id.0 == public)
		.map(|index| index as AuthorityIndex)
		.ok_or(Error::NotAuthority)
}

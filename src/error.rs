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

//! Errors encountered by the block production service.

use crate::primitives::Hash;

/// Errors encountered by the block production service.
#[derive(derive_more::Display, Debug)]
pub enum Error {
	/// The service was configured as an authority without a keypair.
	#[display(fmt = "cannot create block producer as authority; no keypair provided")]
	NoKeypairProvided,
	/// The epoch store reported a slot duration of zero.
	#[display(fmt = "slot duration must be greater than zero")]
	ZeroSlotDuration,
	/// The epoch store reported an epoch length of zero.
	#[display(fmt = "epoch length must be greater than zero")]
	ZeroEpochLength,
	/// The epoch configuration cannot yield a valid VRF threshold.
	#[display(
		fmt = "invalid threshold parameters: c1={}, c2={}, authorities={}",
		c1,
		c2,
		authorities
	)]
	InvalidThresholdParameters {
		/// Numerator of the slot-fill ratio.
		c1: u64,
		/// Denominator of the slot-fill ratio.
		c2: u64,
		/// Size of the authority set.
		authorities: usize,
	},
	/// The local key is not part of the epoch's authority set.
	#[display(fmt = "key is not in the authority set for this epoch")]
	NotAuthority,
	/// Not elected leader for this slot. Expected, non-fatal.
	#[display(fmt = "not authorized to produce a block in this slot")]
	NotAuthorized,
	/// Trie state missing or the storage backend failed.
	#[display(fmt = "storage unavailable: {}", _0)]
	StorageUnavailable(String),
	/// A runtime call failed while building the block.
	#[display(fmt = "runtime failure: {}", _0)]
	RuntimeFailure(String),
	/// No runtime is registered for the parent block.
	#[display(fmt = "no registered runtime for parent block {}", _0)]
	NoRuntimeForParent(Hash),
	/// The block state backend failed.
	#[display(fmt = "block state error: {}", _0)]
	BlockState(String),
	/// The epoch store could not answer.
	#[display(fmt = "epoch data unavailable: {}", _0)]
	EpochDataUnavailable(String),
	/// A non-lead node saw no first block within the configured timeout.
	#[display(fmt = "timed out waiting for the first imported block")]
	FirstBlockTimeout,
	/// The imported-block notification channel was closed by the backend.
	#[display(fmt = "imported block notification channel closed")]
	NotifierChannelClosed,
	/// The operation was interrupted by `Stop` or `Pause`.
	#[display(fmt = "block production cancelled")]
	Cancelled,
	/// Lifecycle misuse after `Stop`.
	#[display(fmt = "service already stopped")]
	AlreadyStopped,
	/// The block authoring task could not be spawned.
	#[display(fmt = "failed to spawn block authoring task: {}", _0)]
	TaskSpawn(std::io::Error),
	/// A header carried more than one BABE pre-runtime digest.
	#[display(fmt = "multiple BABE pre-runtime digests, rejecting")]
	MultiplePreRuntimeDigests,
	/// A header carried no BABE pre-runtime digest.
	#[display(fmt = "no BABE pre-runtime digest found")]
	NoPreRuntimeDigest,
}

impl std::error::Error for Error {}

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

//! Interfaces to the collaborators of the block production service.
//!
//! The service does not own the chain database, the storage trie, the
//! transaction pool, the epoch store, the runtime or the import pipeline;
//! it drives them through the traits below. Implementations must be
//! thread-safe: the authoring task calls into them concurrently with the
//! rest of the node.

use std::{sync::Arc, time::Duration};

use futures::channel::mpsc::UnboundedReceiver;
use parking_lot::MutexGuard;

use crate::{
	epochs::{ConfigData, EpochDescriptor},
	error::Error,
	primitives::{Block, Extrinsic, Hash, Header},
};

/// Stream of imported-block notifications handed out by [`BlockState`].
pub type ImportNotifications = UnboundedReceiver<Block>;

/// Access to the chain of imported blocks.
pub trait BlockState: Send + Sync {
	/// Hash of the current best block.
	fn best_block_hash(&self) -> Hash;

	/// Header of the current best block.
	fn best_block_header(&self) -> Result<Header, Error>;

	/// The runtime instance registered for the given block hash.
	fn get_runtime(&self, hash: &Hash) -> Result<Arc<dyn Runtime>, Error>;

	/// Register a runtime instance for the given block hash.
	fn store_runtime(&self, hash: Hash, runtime: Arc<dyn Runtime>);

	/// Subscribe to imported-block notifications.
	fn import_notification_stream(&self) -> ImportNotifications;

	/// Return a subscription obtained from [`Self::import_notification_stream`].
	fn free_import_notification_stream(&self, stream: ImportNotifications);
}

/// Handle to a trie state rooted at a specific state root.
pub trait TrieState: Send + Sync {
	/// The state root this trie state is based on.
	fn root(&self) -> Hash;
}

/// Access to the versioned trie storage shared with import and sync.
pub trait StorageState: Send + Sync {
	/// Acquire the storage lock. The returned guard must be held for the
	/// whole of a block build, including the hand-off to the import
	/// pipeline.
	fn lock(&self) -> MutexGuard<'_, ()>;

	/// The trie state rooted at the given state root.
	fn trie_state(&self, root: &Hash) -> Result<Arc<dyn TrieState>, Error>;

	/// Hash of the runtime code under the given state root, or the best
	/// block's state root if `None`.
	fn load_code_hash(&self, root: Option<&Hash>) -> Result<Hash, Error>;
}

/// Access to the transaction pool.
pub trait TransactionState: Send + Sync {
	/// All extrinsics currently ready for inclusion.
	fn pending(&self) -> Vec<Extrinsic>;

	/// Remove and return the next ready extrinsic.
	fn pop(&self) -> Option<Extrinsic>;

	/// Add an extrinsic to the pool.
	fn submit(&self, extrinsic: Extrinsic);
}

/// Access to the epoch store.
pub trait EpochState: Send + Sync {
	/// The epoch the current slot belongs to.
	fn get_current_epoch(&self) -> Result<u64, Error>;

	/// The descriptor of the latest known epoch.
	fn get_latest_epoch_data(&self) -> Result<EpochDescriptor, Error>;

	/// The latest known epoch configuration.
	fn get_latest_config_data(&self) -> Result<ConfigData, Error>;

	/// The chain's slot duration.
	fn get_slot_duration(&self) -> Result<Duration, Error>;

	/// The chain's epoch length, in slots.
	fn get_epoch_length(&self) -> Result<u64, Error>;

	/// The first slot of the given epoch.
	fn get_start_slot_for_epoch(&self, epoch: u64) -> Result<u64, Error>;
}

/// The outcome of applying one extrinsic during block construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyExtrinsicOutcome {
	/// The extrinsic was included in the block.
	Included,
	/// The extrinsic would exceed the remaining block resources; the block
	/// should be finalized without it.
	ExhaustsResources,
	/// The extrinsic is invalid and was dropped.
	Invalid,
}

/// A runtime instance capable of executing a block being authored.
///
/// Calls are made in a fixed sequence per build: `set_context_storage`,
/// `initialize_block`, zero or more `apply_extrinsic`, `finalize_block`.
pub trait Runtime: Send + Sync {
	/// Install the trie state all subsequent calls execute against.
	fn set_context_storage(&self, trie_state: Arc<dyn TrieState>);

	/// Begin constructing a block on top of the given parent header.
	fn initialize_block(&self, parent: &Header) -> Result<(), Error>;

	/// Apply one extrinsic to the block under construction.
	fn apply_extrinsic(&self, extrinsic: Extrinsic) -> Result<ApplyExtrinsicOutcome, Error>;

	/// Finish construction, returning the new header with the computed
	/// state and extrinsics roots.
	fn finalize_block(&self) -> Result<Header, Error>;
}

/// The import pipeline produced blocks are handed to.
pub trait BlockImportHandler: Send + Sync {
	/// Import a block this node has produced, together with the trie state
	/// the build mutated.
	fn handle_block_produced(
		&self,
		block: Block,
		trie_state: Arc<dyn TrieState>,
	) -> Result<(), Error>;
}

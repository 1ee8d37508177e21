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

//! # BABE (Blind Assignment for Blockchain Extension) block production
//!
//! BABE is a slot-based block production mechanism which uses a VRF PRNG to
//! randomly perform the slot allocation. On every slot, all the authorities
//! generate a new random number with the VRF function and if it is lower
//! than a given threshold (derived from the epoch configuration and the size
//! of the authority set) they have a right to produce a block. The proof of
//! the VRF function execution is embedded in the block so other peers can
//! validate the legitimacy of the slot claim.
//!
//! An epoch is a contiguous number of slots under which the same authority
//! set and randomness are used. Because the randomness is fixed per epoch,
//! the slot lottery for a whole epoch is run up front when the epoch is
//! entered, and the per-slot claim becomes a map lookup.
//!
//! This crate implements the authoring half of the protocol: the
//! [`BabeService`] owns a slot-by-slot authoring loop which waits for each
//! slot of the current epoch, builds and seals a block whenever the local
//! key won the lottery for the slot, and hands the block to the node's
//! import pipeline. Verification of externally produced blocks is the
//! verifier's job and out of scope here.
//!
//! The service is driven through its lifecycle surface: [`BabeService::start`]
//! launches the loop (after waiting for the first imported block on non-lead
//! nodes), [`BabeService::pause`] halts authoring until
//! [`BabeService::resume`], and [`BabeService::stop`] shuts it down
//! terminally.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod authorship;
mod build;
mod digests;
mod epochs;
mod error;
mod metrics;
mod primitives;
mod slots;
mod traits;

#[cfg(test)]
mod tests;

pub use authorship::{calculate_primary_threshold, check_primary_threshold, make_transcript};
pub use digests::{find_pre_digest, PreDigest, SEAL_SIGNING_CONTEXT};
pub use epochs::{ConfigData, EpochData, EpochDescriptor};
pub use error::Error;
pub use primitives::{
	blake2_256, AuthorityId, AuthorityIndex, BabeAuthorityWeight, Block, ConsensusEngineId,
	Digest, DigestItem, Extrinsic, Hash, Header, Randomness, VrfOutputAndProof, BABE_ENGINE_ID,
	RANDOMNESS_LENGTH, VRF_OUTPUT_LENGTH, VRF_PROOF_LENGTH,
};
pub use slots::{current_slot, duration_now, slot_start_time, Slot, SlotProportion};
pub use traits::{
	ApplyExtrinsicOutcome, BlockImportHandler, BlockState, EpochState, ImportNotifications,
	Runtime, StorageState, TransactionState, TrieState,
};

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	thread,
	time::{Duration, Instant},
};

use exit_future::{Exit, Signal};
use futures::{select, FutureExt, StreamExt};
use futures_timer::Delay;
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use prometheus_endpoint::Registry;

pub use schnorrkel::Keypair;

use crate::{build::BlockBuilder, metrics::MetricsLink, slots::time_until_slot};

/// How long a non-lead authority waits for the first imported block before
/// giving up, unless overridden in [`BabeParams`].
pub const DEFAULT_FIRST_BLOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Parameters for the BABE block production service.
pub struct BabeParams {
	/// This node's sr25519 authority keypair. Required when `authority` is
	/// true.
	pub keypair: Option<Arc<Keypair>>,

	/// Access to the chain of imported blocks.
	pub block_state: Arc<dyn BlockState>,

	/// Access to the versioned trie storage.
	pub storage_state: Arc<dyn StorageState>,

	/// Access to the transaction pool.
	pub transaction_state: Arc<dyn TransactionState>,

	/// Access to the epoch store.
	pub epoch_state: Arc<dyn EpochState>,

	/// The import pipeline produced blocks are handed to.
	pub block_import_handler: Arc<dyn BlockImportHandler>,

	/// Whether this node is a block producer.
	pub authority: bool,

	/// Whether the chain runs in development mode. In dev mode the loop
	/// self-heals after falling behind instead of pausing for sync.
	pub is_dev: bool,

	/// Whether this node is designated to build block 1 on a fresh network.
	/// All other nodes wait for block 1 to arrive before authoring.
	pub lead: bool,

	/// Override for the first-block wait timeout. Defaults to
	/// [`DEFAULT_FIRST_BLOCK_TIMEOUT`].
	pub first_block_timeout: Option<Duration>,

	/// The proportion of a slot dedicated to proposing.
	pub block_proposal_slot_portion: SlotProportion,

	/// Registry for block production metrics, if metrics are enabled.
	pub prometheus_registry: Option<Registry>,
}

/// The BABE block production service.
///
/// Cheap to clone into other subsystems; all clones drive the same producer.
#[derive(Clone)]
pub struct BabeService {
	inner: Arc<Inner>,
}

/// Signals used to interrupt the authoring task. The pause signal is
/// replaced on every resume; the stop signal is fired exactly once.
struct Lifecycle {
	stop_signal: Option<Signal>,
	pause_signal: Option<Signal>,
	pause_exit: Exit,
}

struct Inner {
	authority: bool,
	is_dev: bool,
	lead: bool,

	keypair: Option<Arc<Keypair>>,
	block_state: Arc<dyn BlockState>,
	storage_state: Arc<dyn StorageState>,
	transaction_state: Arc<dyn TransactionState>,
	epoch_state: Arc<dyn EpochState>,
	block_import_handler: Arc<dyn BlockImportHandler>,

	slot_duration: Duration,
	epoch_length: u64,
	first_block_timeout: Duration,
	builder: Option<BlockBuilder>,

	epoch_data: RwLock<EpochData>,
	// for slots where we are elected leader, the vrf output and proof
	slot_to_proof: RwLock<HashMap<u64, VrfOutputAndProof>>,

	lifecycle: Mutex<Lifecycle>,
	on_stop: Exit,
	paused: AtomicBool,
	stopped: AtomicBool,

	metrics: MetricsLink,
}

impl BabeService {
	/// Create a new service from the given parameters.
	///
	/// Loads the chain constants and the current epoch from the epoch store,
	/// so configuration problems surface here rather than from the authoring
	/// task.
	pub fn new(params: BabeParams) -> Result<Self, Error> {
		if params.authority && params.keypair.is_none() {
			return Err(Error::NoKeypairProvided)
		}

		let slot_duration = params.epoch_state.get_slot_duration()?;
		if slot_duration.is_zero() {
			return Err(Error::ZeroSlotDuration)
		}

		let epoch_length = params.epoch_state.get_epoch_length()?;
		if epoch_length == 0 {
			return Err(Error::ZeroEpochLength)
		}

		let epoch = params.epoch_state.get_current_epoch()?;
		let descriptor = params.epoch_state.get_latest_epoch_data()?;
		let config = params.epoch_state.get_latest_config_data()?;
		let epoch_data =
			EpochData::new(descriptor, &config, params.keypair.as_deref())?;

		let builder = match (&params.keypair, params.authority) {
			(Some(keypair), true) => Some(BlockBuilder::new(
				keypair.clone(),
				params.transaction_state.clone(),
				params.block_proposal_slot_portion,
			)),
			_ => None,
		};

		let (stop_signal, on_stop) = exit_future::signal();
		let (pause_signal, pause_exit) = exit_future::signal();

		debug!(
			target: "babe",
			"created service with epoch {}, block producer={}, slot duration {:?}, \
			epoch length (slots) {}, authorities {:?}, authority index {:?}, threshold {} \
			and randomness {:?}",
			epoch, params.authority, slot_duration, epoch_length, epoch_data.authorities,
			epoch_data.authority_index, epoch_data.threshold, epoch_data.randomness,
		);

		if params.lead {
			debug!(target: "babe", "node designated to build block 1");
		}

		Ok(BabeService {
			inner: Arc::new(Inner {
				authority: params.authority,
				is_dev: params.is_dev,
				lead: params.lead,
				keypair: params.keypair,
				block_state: params.block_state,
				storage_state: params.storage_state,
				transaction_state: params.transaction_state,
				epoch_state: params.epoch_state,
				block_import_handler: params.block_import_handler,
				slot_duration,
				epoch_length,
				first_block_timeout: params
					.first_block_timeout
					.unwrap_or(DEFAULT_FIRST_BLOCK_TIMEOUT),
				builder,
				epoch_data: RwLock::new(epoch_data),
				slot_to_proof: RwLock::new(HashMap::new()),
				lifecycle: Mutex::new(Lifecycle {
					stop_signal: Some(stop_signal),
					pause_signal: Some(pause_signal),
					pause_exit,
				}),
				on_stop,
				paused: AtomicBool::new(false),
				stopped: AtomicBool::new(false),
				metrics: MetricsLink::new(params.prometheus_registry.as_ref()),
			}),
		})
	}

	/// Start block production.
	///
	/// Returns immediately with success on a non-authority node. On a
	/// non-lead authority this first blocks until another node's block 1 is
	/// imported, then the authoring task is spawned.
	pub fn start(&self) -> Result<(), Error> {
		if !self.inner.authority {
			return Ok(())
		}

		if !self.inner.lead {
			self.inner.wait_for_first_block()?;
		}

		let pause_exit = self.inner.lifecycle.lock().pause_exit.clone();
		Inner::spawn_authoring_task(&self.inner, pause_exit)
	}

	/// Halt block production. Idempotent.
	///
	/// A slot already being handled completes and is submitted; no further
	/// slot is started until [`Self::resume`].
	pub fn pause(&self) -> Result<(), Error> {
		self.inner.pause()
	}

	/// Resume block production after [`Self::pause`]. Idempotent; invalid
	/// after [`Self::stop`].
	pub fn resume(&self) -> Result<(), Error> {
		let mut lifecycle = self.inner.lifecycle.lock();
		if self.inner.stopped.load(Ordering::Acquire) {
			return Err(Error::AlreadyStopped)
		}
		if !self.inner.paused.load(Ordering::Acquire) {
			return Ok(())
		}

		let (pause_signal, pause_exit) = exit_future::signal();
		lifecycle.pause_signal = Some(pause_signal);
		lifecycle.pause_exit = pause_exit.clone();
		self.inner.paused.store(false, Ordering::Release);
		drop(lifecycle);

		Inner::spawn_authoring_task(&self.inner, pause_exit)?;
		debug!(target: "babe", "service resumed");
		Ok(())
	}

	/// Stop block production terminally. A second call returns
	/// [`Error::AlreadyStopped`].
	pub fn stop(&self) -> Result<(), Error> {
		if !self.inner.authority {
			return Ok(())
		}

		let mut lifecycle = self.inner.lifecycle.lock();
		if self.inner.stopped.swap(true, Ordering::AcqRel) {
			return Err(Error::AlreadyStopped)
		}

		if let Some(signal) = lifecycle.stop_signal.take() {
			let _ = signal.fire();
		}
		Ok(())
	}

	/// Whether the service is paused.
	pub fn is_paused(&self) -> bool {
		self.inner.paused.load(Ordering::Acquire)
	}

	/// Whether the service has been stopped.
	pub fn is_stopped(&self) -> bool {
		self.inner.stopped.load(Ordering::Acquire)
	}

	/// The chain's slot duration in milliseconds.
	pub fn slot_duration(&self) -> u64 {
		self.inner.slot_duration.as_millis() as u64
	}

	/// The chain's epoch length in slots.
	pub fn epoch_length(&self) -> u64 {
		self.inner.epoch_length
	}

	/// The current epoch's authority set.
	pub fn authorities(&self) -> Vec<(AuthorityId, BabeAuthorityWeight)> {
		self.inner.epoch_data.read().authorities.clone()
	}

	/// Inbox for extrinsics arriving from the network; forwards into the
	/// transaction pool for inclusion in a future block.
	pub fn handle_transaction(&self, extrinsic: Extrinsic) {
		self.inner.transaction_state.submit(extrinsic);
	}
}

impl Inner {
	fn pause(&self) -> Result<(), Error> {
		let mut lifecycle = self.lifecycle.lock();
		if self.stopped.load(Ordering::Acquire) {
			return Err(Error::AlreadyStopped)
		}
		if self.paused.load(Ordering::Acquire) {
			return Ok(())
		}

		if let Some(signal) = lifecycle.pause_signal.take() {
			let _ = signal.fire();
		}
		self.paused.store(true, Ordering::Release);
		Ok(())
	}

	fn spawn_authoring_task(inner: &Arc<Inner>, pause: Exit) -> Result<(), Error> {
		let inner = inner.clone();
		thread::Builder::new()
			.name("babe-authoring".into())
			.spawn(move || {
				match futures::executor::block_on(inner.clone().authoring_loop(pause)) {
					Ok(()) => debug!(target: "babe", "block authoring stopped"),
					Err(Error::Cancelled) => debug!(target: "babe", "block authoring cancelled"),
					Err(err) => error!(target: "babe", "block authoring error: {}", err),
				}
			})
			.map_err(Error::TaskSpawn)?;
		Ok(())
	}

	/// Block until another node's block 1 has been imported.
	fn wait_for_first_block(&self) -> Result<(), Error> {
		let mut notifications = self.block_state.import_notification_stream();
		let result =
			futures::executor::block_on(self.first_block_or_timeout(&mut notifications));
		self.block_state.free_import_notification_stream(notifications);
		result
	}

	async fn first_block_or_timeout(
		&self,
		notifications: &mut ImportNotifications,
	) -> Result<(), Error> {
		let mut timeout = Delay::new(self.first_block_timeout).fuse();
		let mut stop = self.on_stop.clone().fuse();

		loop {
			select! {
				block = notifications.next() => match block {
					Some(block) if block.header.number > 0 => return Ok(()),
					Some(_) => {},
					None => return Err(Error::NotifierChannelClosed),
				},
				_ = timeout => return Err(Error::FirstBlockTimeout),
				_ = stop => return Err(Error::Cancelled),
			}
		}
	}

	/// The authoring loop: epoch by epoch, slot by slot, until paused or
	/// stopped.
	async fn authoring_loop(self: Arc<Self>, pause: Exit) -> Result<(), Error> {
		let mut stop = self.on_stop.clone().fuse();
		let mut paused = pause.clone().fuse();

		let mut epoch = self.epoch_state.get_current_epoch()?;

		loop {
			self.initiate_epoch(epoch)?;

			let epoch_start = self.wait_for_epoch_start(epoch, &pause).await?;
			let start_slot = current_slot(self.slot_duration);
			let mut into_epoch = start_slot.saturating_sub(epoch_start);

			// more than a whole epoch behind means we have been offline and
			// must sync first; the syncer resumes the service when caught up
			if into_epoch >= self.epoch_length && !self.is_dev {
				debug!(
					target: "babe",
					"pausing block production to sync: {} slots into the epoch starting at slot {}",
					into_epoch, epoch_start,
				);
				return self.pause()
			}

			if self.is_dev {
				into_epoch %= self.epoch_length;
			}

			info!(
				target: "babe",
				"epoch {} starts at slot {}, currently {} slots into it",
				epoch, epoch_start, into_epoch,
			);

			let next_epoch_start = self.epoch_state.get_start_slot_for_epoch(epoch + 1)?;
			let mut epoch_timer =
				Delay::new(time_until_slot(next_epoch_start, self.slot_duration)).fuse();

			'slot_loop: for slot_number in
				epoch_start + into_epoch..epoch_start + self.epoch_length
			{
				let mut slot_timer =
					Delay::new(time_until_slot(slot_number, self.slot_duration)).fuse();

				select! {
					_ = stop => {
						debug!(target: "babe", "block production stopped");
						return Ok(())
					},
					_ = paused => {
						debug!(target: "babe", "block production paused");
						return Ok(())
					},
					_ = epoch_timer => break 'slot_loop,
					_ = slot_timer => match self.handle_slot(epoch, slot_number) {
						Ok(()) => {},
						Err(Error::NotAuthorized) => debug!(
							target: "babe",
							"not authorized to produce a block in slot {} of epoch {}",
							slot_number, epoch,
						),
						Err(err) => warn!(
							target: "babe",
							"failed to handle slot {}: {}",
							slot_number, err,
						),
					},
				}
			}

			info!(target: "babe", "epoch {} complete, upcoming epoch: {}", epoch, epoch + 1);
			epoch += 1;
		}
	}

	/// Load the epoch's parameters and run the slot lottery for all of its
	/// slots. The previous epoch's claims are discarded.
	fn initiate_epoch(&self, epoch: u64) -> Result<(), Error> {
		let descriptor = self.epoch_state.get_latest_epoch_data()?;
		let config = self.epoch_state.get_latest_config_data()?;
		let epoch_data = EpochData::new(descriptor, &config, self.keypair.as_deref())?;

		let epoch_start = self.epoch_state.get_start_slot_for_epoch(epoch)?;
		let proofs = match (&self.keypair, epoch_data.authority_index) {
			(Some(keypair), Some(_)) => authorship::run_epoch_lottery(
				keypair,
				epoch,
				epoch_start,
				self.epoch_length,
				&epoch_data,
			),
			_ => HashMap::new(),
		};

		debug!(
			target: "babe",
			"initiated epoch {} with threshold {} and randomness {:?}, elected leader \
			for {} of {} slots",
			epoch, epoch_data.threshold, epoch_data.randomness, proofs.len(), self.epoch_length,
		);

		*self.slot_to_proof.write() = proofs;
		*self.epoch_data.write() = epoch_data;
		Ok(())
	}

	/// Wait until the wall clock reaches the epoch's first slot. Returns
	/// that slot number.
	async fn wait_for_epoch_start(&self, epoch: u64, pause: &Exit) -> Result<u64, Error> {
		let epoch_start = self.epoch_state.get_start_slot_for_epoch(epoch)?;
		let wait = time_until_slot(epoch_start, self.slot_duration);

		if !wait.is_zero() {
			debug!(target: "babe", "waiting {:?} for epoch {} to start", wait, epoch);
			let mut timer = Delay::new(wait).fuse();
			let mut stop = self.on_stop.clone().fuse();
			let mut paused = pause.clone().fuse();
			select! {
				_ = timer => {},
				_ = stop => return Err(Error::Cancelled),
				_ = paused => return Err(Error::Cancelled),
			}
		}

		Ok(epoch_start)
	}

	/// Build, seal and import a block for a slot this node was elected
	/// leader for.
	fn handle_slot(&self, epoch: u64, slot_number: u64) -> Result<(), Error> {
		let proof = self
			.slot_to_proof
			.read()
			.get(&slot_number)
			.cloned()
			.ok_or(Error::NotAuthorized)?;
		let authority_index =
			self.epoch_data.read().authority_index.ok_or(Error::NotAuthorized)?;
		let builder = self.builder.as_ref().ok_or(Error::NotAuthorized)?;

		// the best block may change underneath us while we build, so work on
		// an owned copy of the header
		let parent = self.block_state.best_block_header()?;
		let slot = Slot {
			number: slot_number,
			start: duration_now(),
			duration: self.slot_duration,
		};

		let _storage_guard = self.storage_state.lock();

		let trie_state = self.storage_state.trie_state(&parent.state_root)?;
		let runtime = self.block_state.get_runtime(&parent.hash())?;
		runtime.set_context_storage(trie_state.clone());

		let pre_digest = PreDigest {
			authority_index,
			slot_number,
			vrf_output: proof.output,
			vrf_proof: proof.proof,
		};

		let constructed_at = Instant::now();
		let block = match builder.build_block(&parent, &slot, pre_digest, &*runtime) {
			Ok(block) => {
				self.metrics.report(|metrics| {
					metrics
						.block_constructed
						.observe(constructed_at.elapsed().as_secs_f64())
				});
				block
			},
			Err(err) => {
				self.metrics
					.report(|metrics| metrics.block_construction_errors.inc());
				return Err(err)
			},
		};

		info!(
			target: "babe",
			"🎁 built block {} with hash {}, state root {}, epoch {} and slot {}",
			block.header.number, block.header.hash(), block.header.state_root, epoch, slot_number,
		);
		trace!(
			target: "babe",
			"built block with parent hash {}, header {:?} and body {:?}",
			parent.hash(), block.header, block.body,
		);

		self.block_import_handler.handle_block_produced(block, trie_state).map_err(|err| {
			warn!(target: "babe", "failed to import built block: {}", err);
			err
		})
	}
}

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

//! Service tests driving the authoring loop against in-memory state.

use super::*;

use std::{
	collections::{HashMap as StdHashMap, VecDeque},
	sync::atomic::{AtomicUsize, Ordering},
	time::Duration,
};

use codec::Encode;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use parking_lot::{Mutex, MutexGuard, RwLock};
use schnorrkel::{
	vrf::{VRFOutput, VRFProof},
	ExpansionMode, MiniSecretKey, PublicKey,
};

const SLOT_DURATION: Duration = Duration::from_millis(100);

fn init_log() {
	let _ = env_logger::builder().is_test(true).try_init();
}

fn keypair(seed: u8) -> Arc<Keypair> {
	Arc::new(
		MiniSecretKey::from_bytes(&[seed; 32])
			.expect("static length matches; qed")
			.expand_to_keypair(ExpansionMode::Ed25519),
	)
}

fn genesis_header() -> Header {
	Header::new(Hash::zero(), 0, Hash::repeat_byte(9), Hash::zero(), Digest::default())
}

struct TestTrieState {
	root: Hash,
}

impl TrieState for TestTrieState {
	fn root(&self) -> Hash {
		self.root
	}
}

#[derive(Default)]
struct TestStorageState {
	lock: Mutex<()>,
}

impl StorageState for TestStorageState {
	fn lock(&self) -> MutexGuard<'_, ()> {
		self.lock.lock()
	}

	fn trie_state(&self, root: &Hash) -> Result<Arc<dyn TrieState>, Error> {
		Ok(Arc::new(TestTrieState { root: *root }))
	}

	fn load_code_hash(&self, _root: Option<&Hash>) -> Result<Hash, Error> {
		Ok(Hash::repeat_byte(0xcc))
	}
}

struct TestBlockState {
	best: RwLock<Header>,
	runtimes: RwLock<StdHashMap<Hash, Arc<dyn Runtime>>>,
	subscribers: Mutex<Vec<UnboundedSender<Block>>>,
	freed_streams: AtomicUsize,
}

impl TestBlockState {
	fn new() -> Arc<Self> {
		Arc::new(TestBlockState {
			best: RwLock::new(genesis_header()),
			runtimes: RwLock::new(StdHashMap::new()),
			subscribers: Mutex::new(Vec::new()),
			freed_streams: AtomicUsize::new(0),
		})
	}

	fn set_best(&self, header: Header) {
		*self.best.write() = header;
	}

	fn notify(&self, block: Block) {
		self.subscribers.lock().retain(|sink| sink.unbounded_send(block.clone()).is_ok());
	}
}

impl BlockState for TestBlockState {
	fn best_block_hash(&self) -> Hash {
		self.best.read().hash()
	}

	fn best_block_header(&self) -> Result<Header, Error> {
		Ok(self.best.read().clone())
	}

	fn get_runtime(&self, hash: &Hash) -> Result<Arc<dyn Runtime>, Error> {
		self.runtimes.read().get(hash).cloned().ok_or(Error::NoRuntimeForParent(*hash))
	}

	fn store_runtime(&self, hash: Hash, runtime: Arc<dyn Runtime>) {
		self.runtimes.write().insert(hash, runtime);
	}

	fn import_notification_stream(&self) -> ImportNotifications {
		let (sink, stream) = unbounded();
		self.subscribers.lock().push(sink);
		stream
	}

	fn free_import_notification_stream(&self, stream: ImportNotifications) {
		drop(stream);
		self.freed_streams.fetch_add(1, Ordering::SeqCst);
	}
}

#[derive(Default)]
struct TestTransactionState {
	ready: Mutex<VecDeque<Extrinsic>>,
}

impl TransactionState for TestTransactionState {
	fn pending(&self) -> Vec<Extrinsic> {
		self.ready.lock().iter().cloned().collect()
	}

	fn pop(&self) -> Option<Extrinsic> {
		self.ready.lock().pop_front()
	}

	fn submit(&self, extrinsic: Extrinsic) {
		self.ready.lock().push_back(extrinsic);
	}
}

struct TestEpochState {
	slot_duration: Duration,
	epoch_length: u64,
	genesis_slot: u64,
	config: ConfigData,
	// handed out in order, the last one repeating; lets tests change the
	// descriptor on an epoch boundary
	descriptors: Mutex<VecDeque<EpochDescriptor>>,
}

impl EpochState for TestEpochState {
	fn get_current_epoch(&self) -> Result<u64, Error> {
		Ok(0)
	}

	fn get_latest_epoch_data(&self) -> Result<EpochDescriptor, Error> {
		let mut descriptors = self.descriptors.lock();
		if descriptors.len() > 1 {
			descriptors
				.pop_front()
				.ok_or_else(|| Error::EpochDataUnavailable("no descriptor".into()))
		} else {
			descriptors
				.front()
				.cloned()
				.ok_or_else(|| Error::EpochDataUnavailable("no descriptor".into()))
		}
	}

	fn get_latest_config_data(&self) -> Result<ConfigData, Error> {
		Ok(self.config)
	}

	fn get_slot_duration(&self) -> Result<Duration, Error> {
		Ok(self.slot_duration)
	}

	fn get_epoch_length(&self) -> Result<u64, Error> {
		Ok(self.epoch_length)
	}

	fn get_start_slot_for_epoch(&self, epoch: u64) -> Result<u64, Error> {
		Ok(self.genesis_slot + epoch * self.epoch_length)
	}
}

/// Applies everything it is given and derives the child header from the
/// parent installed by `initialize_block`.
#[derive(Default)]
struct TestRuntime {
	parent: Mutex<Option<Header>>,
	applied: Mutex<Vec<Extrinsic>>,
}

impl Runtime for TestRuntime {
	fn set_context_storage(&self, _trie_state: Arc<dyn TrieState>) {}

	fn initialize_block(&self, parent: &Header) -> Result<(), Error> {
		*self.parent.lock() = Some(parent.clone());
		Ok(())
	}

	fn apply_extrinsic(&self, extrinsic: Extrinsic) -> Result<ApplyExtrinsicOutcome, Error> {
		self.applied.lock().push(extrinsic);
		Ok(ApplyExtrinsicOutcome::Included)
	}

	fn finalize_block(&self) -> Result<Header, Error> {
		let parent = self
			.parent
			.lock()
			.take()
			.ok_or_else(|| Error::RuntimeFailure("block not initialized".into()))?;
		let applied = std::mem::take(&mut *self.applied.lock());
		Ok(Header::new(
			parent.hash(),
			parent.number + 1,
			blake2_256(&(parent.state_root, applied.len() as u32).encode()).into(),
			blake2_256(&applied.encode()).into(),
			Digest::default(),
		))
	}
}

/// Mimics the import pipeline: records the block, advances the best block,
/// keeps the runtime registered for the new head and fans out the imported
/// block notification.
struct TestImportHandler {
	block_state: Arc<TestBlockState>,
	runtime: Arc<dyn Runtime>,
	imported: Mutex<Vec<Block>>,
}

impl TestImportHandler {
	fn imported_blocks(&self) -> Vec<Block> {
		self.imported.lock().clone()
	}
}

impl BlockImportHandler for TestImportHandler {
	fn handle_block_produced(
		&self,
		block: Block,
		_trie_state: Arc<dyn TrieState>,
	) -> Result<(), Error> {
		self.imported.lock().push(block.clone());
		self.block_state.store_runtime(block.header.hash(), self.runtime.clone());
		self.block_state.set_best(block.header.clone());
		self.block_state.notify(block);
		Ok(())
	}
}

struct TestSetup {
	keypair: Arc<Keypair>,
	authorities: Vec<AuthorityId>,
	config: ConfigData,
	epoch_length: u64,
	genesis_slot: u64,
	authority: bool,
	lead: bool,
	is_dev: bool,
	first_block_timeout: Option<Duration>,
	extra_descriptors: Vec<EpochDescriptor>,
}

impl Default for TestSetup {
	fn default() -> Self {
		let keypair = keypair(42);
		let authorities = vec![AuthorityId::from_keypair(&keypair)];
		TestSetup {
			keypair,
			authorities,
			config: ConfigData { c1: 1, c2: 1 },
			epoch_length: 10,
			// the next slot boundary, so the first handled slot is the
			// epoch's slot zero
			genesis_slot: current_slot(SLOT_DURATION) + 1,
			authority: true,
			lead: true,
			is_dev: false,
			first_block_timeout: None,
			extra_descriptors: Vec::new(),
		}
	}
}

struct TestContext {
	service: BabeService,
	block_state: Arc<TestBlockState>,
	import_handler: Arc<TestImportHandler>,
	public: PublicKey,
	genesis_slot: u64,
	epoch_length: u64,
	randomness: Vec<Randomness>,
}

impl TestContext {
	fn imported_blocks(&self) -> Vec<Block> {
		self.import_handler.imported_blocks()
	}

	/// Decode and fully verify the slot claim of an imported block.
	fn verify_block_claim(&self, block: &Block) {
		let pre_digest = find_pre_digest(&block.header).unwrap();
		assert_eq!(pre_digest.authority_index, 0);

		let epoch = (pre_digest.slot_number - self.genesis_slot) / self.epoch_length;
		let randomness =
			self.randomness[std::cmp::min(epoch as usize, self.randomness.len() - 1)];

		let output = VRFOutput::from_bytes(&pre_digest.vrf_output).unwrap();
		let proof = VRFProof::from_bytes(&pre_digest.vrf_proof).unwrap();
		let transcript = make_transcript(&randomness, pre_digest.slot_number, epoch);
		assert!(
			self.public.vrf_verify(transcript, &output, &proof).is_ok(),
			"VRF claim of slot {} does not verify",
			pre_digest.slot_number,
		);

		let threshold = calculate_primary_threshold((1, 1), 1).unwrap();
		assert!(check_primary_threshold(&pre_digest.vrf_output, threshold));

		// seal over the pre-seal header hash
		let mut pre_seal = block.header.clone();
		let seal = pre_seal.digest.logs.pop().unwrap();
		let signature =
			schnorrkel::Signature::from_bytes(&seal.as_babe_seal().unwrap()).unwrap();
		let context = schnorrkel::signing_context(SEAL_SIGNING_CONTEXT);
		assert!(self
			.public
			.verify(context.bytes(pre_seal.hash().as_bytes()), &signature)
			.is_ok());
	}
}

fn test_service(setup: TestSetup) -> TestContext {
	init_log();

	let block_state = TestBlockState::new();
	let storage_state = Arc::new(TestStorageState::default());
	let transaction_state = Arc::new(TestTransactionState::default());
	let runtime: Arc<dyn Runtime> = Arc::new(TestRuntime::default());
	block_state.store_runtime(genesis_header().hash(), runtime.clone());

	let base_descriptor = EpochDescriptor {
		randomness: [1; 32],
		authorities: setup.authorities.iter().cloned().map(|id| (id, 1)).collect(),
	};
	let mut randomness = vec![base_descriptor.randomness];
	randomness.extend(setup.extra_descriptors.iter().map(|descriptor| descriptor.randomness));

	// one for construction, one for the first initiate_epoch, then the rest
	let mut descriptors = VecDeque::new();
	descriptors.push_back(base_descriptor.clone());
	descriptors.push_back(base_descriptor);
	descriptors.extend(setup.extra_descriptors);

	let epoch_state = Arc::new(TestEpochState {
		slot_duration: SLOT_DURATION,
		epoch_length: setup.epoch_length,
		genesis_slot: setup.genesis_slot,
		config: setup.config,
		descriptors: Mutex::new(descriptors),
	});

	let import_handler = Arc::new(TestImportHandler {
		block_state: block_state.clone(),
		runtime,
		imported: Mutex::new(Vec::new()),
	});

	let public = setup.keypair.public;
	let service = BabeService::new(BabeParams {
		keypair: if setup.authority { Some(setup.keypair) } else { None },
		block_state: block_state.clone(),
		storage_state,
		transaction_state,
		epoch_state,
		block_import_handler: import_handler.clone(),
		authority: setup.authority,
		is_dev: setup.is_dev,
		lead: setup.lead,
		first_block_timeout: setup.first_block_timeout,
		block_proposal_slot_portion: SlotProportion::default(),
		prometheus_registry: None,
	})
	.unwrap();

	TestContext {
		service,
		block_state,
		import_handler,
		public,
		genesis_slot: setup.genesis_slot,
		epoch_length: setup.epoch_length,
		randomness,
	}
}

fn sleep_slots(n: u64) {
	std::thread::sleep(SLOT_DURATION * n as u32);
}

#[test]
fn authority_without_keypair_is_rejected() {
	let block_state = TestBlockState::new();
	let result = BabeService::new(BabeParams {
		keypair: None,
		block_state,
		storage_state: Arc::new(TestStorageState::default()),
		transaction_state: Arc::new(TestTransactionState::default()),
		epoch_state: Arc::new(TestEpochState {
			slot_duration: SLOT_DURATION,
			epoch_length: 10,
			genesis_slot: 0,
			config: ConfigData { c1: 1, c2: 1 },
			descriptors: Mutex::new(VecDeque::from([EpochDescriptor {
				randomness: [0; 32],
				authorities: Vec::new(),
			}])),
		}),
		block_import_handler: Arc::new(TestImportHandler {
			block_state: TestBlockState::new(),
			runtime: Arc::new(TestRuntime::default()),
			imported: Mutex::new(Vec::new()),
		}),
		authority: true,
		is_dev: false,
		lead: true,
		first_block_timeout: None,
		block_proposal_slot_portion: SlotProportion::default(),
		prometheus_registry: None,
	});

	assert!(matches!(result, Err(Error::NoKeypairProvided)));
}

#[test]
fn bad_threshold_parameters_surface_from_construction() {
	let setup = TestSetup { config: ConfigData { c1: 2, c2: 1 }, ..Default::default() };

	let keypair = setup.keypair.clone();
	let block_state = TestBlockState::new();
	let result = BabeService::new(BabeParams {
		keypair: Some(keypair),
		block_state,
		storage_state: Arc::new(TestStorageState::default()),
		transaction_state: Arc::new(TestTransactionState::default()),
		epoch_state: Arc::new(TestEpochState {
			slot_duration: SLOT_DURATION,
			epoch_length: setup.epoch_length,
			genesis_slot: setup.genesis_slot,
			config: setup.config,
			descriptors: Mutex::new(VecDeque::from([EpochDescriptor {
				randomness: [1; 32],
				authorities: setup
					.authorities
					.iter()
					.cloned()
					.map(|id| (id, 1))
					.collect(),
			}])),
		}),
		block_import_handler: Arc::new(TestImportHandler {
			block_state: TestBlockState::new(),
			runtime: Arc::new(TestRuntime::default()),
			imported: Mutex::new(Vec::new()),
		}),
		authority: true,
		is_dev: false,
		lead: true,
		first_block_timeout: None,
		block_proposal_slot_portion: SlotProportion::default(),
		prometheus_registry: None,
	});

	assert!(matches!(result, Err(Error::InvalidThresholdParameters { .. })));
}

#[test]
fn lead_node_produces_from_genesis() {
	let context = test_service(TestSetup::default());

	context.service.start().unwrap();
	sleep_slots(4);
	context.service.stop().unwrap();

	let blocks = context.imported_blocks();
	assert!(!blocks.is_empty(), "no blocks produced");

	// block 1 is claimed in the epoch's first slot
	assert_eq!(blocks[0].header.number, 1);
	let first_claim = find_pre_digest(&blocks[0].header).unwrap();
	assert_eq!(first_claim.slot_number, context.genesis_slot);

	for block in &blocks {
		context.verify_block_claim(block);
	}
}

#[test]
fn produced_slots_are_strictly_monotone() {
	let context = test_service(TestSetup::default());

	context.service.start().unwrap();
	sleep_slots(5);
	context.service.stop().unwrap();

	let slots: Vec<u64> = context
		.imported_blocks()
		.iter()
		.map(|block| find_pre_digest(&block.header).unwrap().slot_number)
		.collect();

	assert!(!slots.is_empty());
	assert!(slots.windows(2).all(|pair| pair[0] < pair[1]), "slots not monotone: {:?}", slots);
}

#[test]
fn catch_up_gap_pauses_the_service() {
	let setup = TestSetup {
		genesis_slot: current_slot(SLOT_DURATION).saturating_sub(15),
		..Default::default()
	};
	let context = test_service(setup);

	context.service.start().unwrap();
	std::thread::sleep(Duration::from_millis(100));

	assert!(context.service.is_paused());
	assert!(context.imported_blocks().is_empty());
}

#[test]
fn dev_mode_self_heals_when_behind() {
	let setup = TestSetup {
		genesis_slot: current_slot(SLOT_DURATION).saturating_sub(15),
		is_dev: true,
		..Default::default()
	};
	let context = test_service(setup);

	context.service.start().unwrap();
	sleep_slots(4);
	context.service.stop().unwrap();

	assert!(!context.service.is_paused());
	assert!(!context.imported_blocks().is_empty());
}

#[test]
fn key_outside_authority_set_idles() {
	let outsider = keypair(7);
	let setup = TestSetup {
		authorities: vec![AuthorityId::from_keypair(&keypair(8))],
		keypair: outsider,
		..Default::default()
	};
	let context = test_service(setup);

	context.service.start().unwrap();
	sleep_slots(3);

	assert!(context.imported_blocks().is_empty());
	assert!(!context.service.is_paused());
	assert!(!context.service.is_stopped());

	context.service.stop().unwrap();
}

#[test]
fn pause_then_resume_restarts_production() {
	// one long epoch so the whole test stays inside it
	let setup = TestSetup { epoch_length: 600, ..Default::default() };
	let context = test_service(setup);

	context.service.start().unwrap();
	sleep_slots(3);

	context.service.pause().unwrap();
	assert!(context.service.is_paused());
	// an in-flight slot is allowed to finish, let it drain
	sleep_slots(1);
	let after_pause = context.imported_blocks().len();
	assert!(after_pause > 0);

	sleep_slots(2);
	assert_eq!(context.imported_blocks().len(), after_pause, "produced while paused");

	context.service.resume().unwrap();
	assert!(!context.service.is_paused());
	sleep_slots(3);
	assert!(context.imported_blocks().len() > after_pause, "no blocks after resume");

	context.service.stop().unwrap();
}

#[test]
fn pause_is_idempotent() {
	let context = test_service(TestSetup { epoch_length: 600, ..Default::default() });

	context.service.start().unwrap();
	context.service.pause().unwrap();
	context.service.pause().unwrap();
	assert!(context.service.is_paused());

	context.service.resume().unwrap();
	context.service.resume().unwrap();
	assert!(!context.service.is_paused());

	context.service.stop().unwrap();
}

#[test]
fn stop_is_terminal() {
	let context = test_service(TestSetup::default());

	context.service.start().unwrap();
	context.service.stop().unwrap();
	assert!(context.service.is_stopped());

	assert!(matches!(context.service.resume(), Err(Error::AlreadyStopped)));
	assert!(matches!(context.service.pause(), Err(Error::AlreadyStopped)));
	assert!(matches!(context.service.stop(), Err(Error::AlreadyStopped)));
	assert!(context.service.is_stopped());
}

#[test]
fn epoch_rollover_uses_the_new_randomness() {
	let setup = TestSetup {
		epoch_length: 3,
		extra_descriptors: vec![EpochDescriptor {
			randomness: [2; 32],
			authorities: vec![(AuthorityId::from_keypair(&keypair(42)), 1)],
		}],
		..Default::default()
	};
	let context = test_service(setup);

	context.service.start().unwrap();
	sleep_slots(8);
	context.service.stop().unwrap();

	let blocks = context.imported_blocks();
	let claims: Vec<PreDigest> =
		blocks.iter().map(|block| find_pre_digest(&block.header).unwrap()).collect();

	assert!(
		claims
			.iter()
			.any(|claim| claim.slot_number >= context.genesis_slot + context.epoch_length),
		"no block produced after the epoch rollover",
	);

	// claims verify against the randomness of the epoch they fall into
	for block in &blocks {
		context.verify_block_claim(block);
	}
}

#[test]
fn at_most_one_block_per_slot() {
	let context = test_service(TestSetup { epoch_length: 3, ..Default::default() });

	context.service.start().unwrap();
	sleep_slots(7);
	context.service.stop().unwrap();

	let slots: Vec<u64> = context
		.imported_blocks()
		.iter()
		.map(|block| find_pre_digest(&block.header).unwrap().slot_number)
		.collect();
	let unique: std::collections::HashSet<u64> = slots.iter().copied().collect();

	assert_eq!(slots.len(), unique.len(), "a slot was claimed twice: {:?}", slots);
}

#[test]
fn non_lead_node_waits_for_the_first_block() {
	let context = test_service(TestSetup { lead: false, ..Default::default() });

	let block_state = context.block_state.clone();
	let notifier = std::thread::spawn(move || {
		std::thread::sleep(Duration::from_millis(150));
		// a genesis notification must not release the waiter
		block_state.notify(Block { header: genesis_header(), body: Vec::new() });
		let mut first = genesis_header();
		first.number = 1;
		block_state.notify(Block { header: first, body: Vec::new() });
	});

	let started = std::time::Instant::now();
	context.service.start().unwrap();
	assert!(started.elapsed() >= Duration::from_millis(100));
	notifier.join().unwrap();

	assert_eq!(context.block_state.freed_streams.load(Ordering::SeqCst), 1);
	context.service.stop().unwrap();
}

#[test]
fn first_block_wait_times_out() {
	let setup = TestSetup {
		lead: false,
		first_block_timeout: Some(Duration::from_millis(50)),
		..Default::default()
	};
	let context = test_service(setup);

	assert!(matches!(context.service.start(), Err(Error::FirstBlockTimeout)));
	assert_eq!(context.block_state.freed_streams.load(Ordering::SeqCst), 1);
}

#[test]
fn non_authority_start_and_stop_are_no_ops() {
	let setup = TestSetup { authority: false, ..Default::default() };
	let context = test_service(setup);

	context.service.start().unwrap();
	sleep_slots(2);

	assert!(context.imported_blocks().is_empty());
	context.service.stop().unwrap();
	assert!(!context.service.is_stopped());
}

#[test]
fn built_blocks_include_pool_extrinsics() {
	let context = test_service(TestSetup { epoch_length: 600, ..Default::default() });

	context.service.handle_transaction(Extrinsic(vec![1, 2, 3]));
	context.service.handle_transaction(Extrinsic(vec![4]));

	context.service.start().unwrap();
	sleep_slots(3);
	context.service.stop().unwrap();

	let blocks = context.imported_blocks();
	assert!(!blocks.is_empty());
	let all_extrinsics: Vec<Extrinsic> =
		blocks.iter().flat_map(|block| block.body.clone()).collect();
	assert!(all_extrinsics.contains(&Extrinsic(vec![1, 2, 3])));
	assert!(all_extrinsics.contains(&Extrinsic(vec![4])));
}

#[test]
fn service_exposes_chain_constants() {
	let context = test_service(TestSetup::default());

	assert_eq!(context.service.slot_duration(), SLOT_DURATION.as_millis() as u64);
	assert_eq!(context.service.epoch_length(), 10);
	assert_eq!(context.service.authorities().len(), 1);
}

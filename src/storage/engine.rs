//! Storage engine facade: transactions, commit, batch application and
//! recovery from the command log.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::admin::verify_chains;
use crate::primitives::concurrency::{
    LockManager, OrderVerifyingLocker, ResourceLocker, ResourceType,
};
use crate::primitives::io::{FileIo, MemFileIo, StdFileIo};
use crate::primitives::log::CommandLog;
use crate::storage::apply::{
    ApplicationMode, ApplierChain, ConsistencyCheckingApplierFactory, CountsApplierFactory,
    HighIdApplierFactory, IndexApplierFactory, IndexUpdateListener, StoreApplierFactory,
    TransactionApplierFactory,
};
use crate::storage::chain::{RelationshipCreator, RelationshipDeleter, RelationshipModifier};
use crate::storage::command::{decode_batch, encode_batch, CommandBatch};
use crate::storage::metrics::{default_metrics, StorageMetrics};
use crate::storage::options::{ConfigError, EngineConfig, EngineOptions};
use crate::storage::record::TokenKind;
use crate::storage::store::Stores;
use crate::storage::transaction::TransactionRecordState;
use crate::types::{
    LabelId, MetaId, NodeId, PropKeyId, RelId, Result, SchemaId, SombraError, TokenId, TxId,
    TypeId,
};

/// Outcome of [`RecordStorageEngine::recover`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct RecoveryStats {
    /// Log entries applied.
    pub batches_replayed: u64,
    /// Commands across the applied entries.
    pub commands_replayed: u64,
    /// Last transaction found in the log.
    pub last_tx: Option<u64>,
    /// Offset the log was cut back to.
    pub log_valid_up_to: u64,
    /// Chain verifier result, when it ran.
    pub verified: Option<bool>,
}

/// Mutation core over a set of record stores.
///
/// Transactions stage their changes privately and take entity locks; commit
/// serializes only the log append and the apply step.
pub struct RecordStorageEngine {
    stores: Stores,
    options: EngineOptions,
    modifier: RelationshipModifier,
    internal: ApplierChain,
    external: ApplierChain,
    recovery: ApplierChain,
    log: CommandLog,
    locks: LockManager,
    commit_lock: Mutex<()>,
    next_tx: AtomicU64,
    panicked: AtomicBool,
    metrics: Arc<dyn StorageMetrics>,
}

impl RecordStorageEngine {
    /// Builds an engine whose command log lives in memory.
    pub fn new(
        stores: Stores,
        options: EngineOptions,
        index_listener: Arc<dyn IndexUpdateListener>,
    ) -> Result<Self> {
        Self::with_log_io(stores, options, index_listener, Arc::new(MemFileIo::new()))
    }

    /// Builds an engine logging to `io`.
    pub fn with_log_io(
        stores: Stores,
        options: EngineOptions,
        index_listener: Arc<dyn IndexUpdateListener>,
        io: Arc<dyn FileIo>,
    ) -> Result<Self> {
        let log = CommandLog::open(io)?;
        let chain = |mode: ApplicationMode| {
            let mut factories: Vec<Arc<dyn TransactionApplierFactory>> =
                vec![Arc::new(StoreApplierFactory::new(stores.clone()))];
            if options.consistency_check_on_apply {
                factories.push(Arc::new(ConsistencyCheckingApplierFactory::new(
                    stores.clone(),
                )));
            }
            if mode.tracks_high_ids() {
                factories.push(Arc::new(HighIdApplierFactory::new(stores.clone())));
            }
            factories.push(Arc::new(CountsApplierFactory::new(stores.counts.clone())));
            factories.push(Arc::new(IndexApplierFactory::new(index_listener.clone())));
            ApplierChain::new(mode, factories)
        };
        let internal = chain(ApplicationMode::Internal);
        let external = chain(ApplicationMode::External);
        let recovery = chain(ApplicationMode::Recovery);

        let last_logged = log.last_tx_id().map_or(0, |tx| tx.0);
        let last_counted = stores.counts.last_applied_tx().0;
        let next_tx = last_logged.max(last_counted) + 1;
        let modifier = RelationshipModifier::new(
            RelationshipCreator::new(
                options.dense_node_threshold,
                options.external_degrees_threshold,
            ),
            RelationshipDeleter::default(),
        );
        let metrics = options.metrics.clone().unwrap_or_else(default_metrics);
        debug!(
            next_tx,
            consistency = options.consistency_check_on_apply,
            dense_threshold = options.dense_node_threshold,
            "engine.open"
        );
        Ok(Self {
            stores,
            options,
            modifier,
            internal,
            external,
            recovery,
            log,
            locks: LockManager::new(),
            commit_lock: Mutex::new(()),
            next_tx: AtomicU64::new(next_tx),
            panicked: AtomicBool::new(false),
            metrics,
        })
    }

    /// Builds an engine from a config file's settings. A configured
    /// `log_path` is opened as the command log.
    pub fn from_config(
        stores: Stores,
        config: &EngineConfig,
        index_listener: Arc<dyn IndexUpdateListener>,
    ) -> std::result::Result<Self, EngineOpenError> {
        let options = config.to_options();
        let engine = match &config.log_path {
            Some(path) => {
                let io = StdFileIo::open(path)?;
                Self::with_log_io(stores, options, index_listener, Arc::new(io))?
            }
            None => Self::new(stores, options, index_listener)?,
        };
        Ok(engine)
    }

    /// Record stores the engine applies to.
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Options the engine was built with.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Command log committed batches are appended to.
    pub fn log(&self) -> &CommandLog {
        &self.log
    }

    /// Lock table shared by the engine's transactions.
    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    /// Applier names of the chain used for `mode`, in start order.
    pub fn applier_names(&self, mode: ApplicationMode) -> Vec<&'static str> {
        self.chain(mode).names()
    }

    /// False once a failed batch application or a storage failure has left
    /// the stores in an unknown state.
    pub fn is_healthy(&self) -> bool {
        !self.panicked.load(Ordering::Acquire)
    }

    fn chain(&self, mode: ApplicationMode) -> &ApplierChain {
        match mode {
            ApplicationMode::Internal => &self.internal,
            ApplicationMode::External => &self.external,
            ApplicationMode::Recovery => &self.recovery,
        }
    }

    fn check_health(&self) -> Result<()> {
        if self.is_healthy() {
            Ok(())
        } else {
            Err(SombraError::Unavailable(
                "storage engine stopped after a failed batch or storage error".into(),
            ))
        }
    }

    /// Flags the engine unavailable when `err` is fatal to it.
    fn observe(&self, err: &SombraError) {
        if err.is_fatal_to_engine() {
            self.mark_failed(err);
        }
    }

    fn mark_failed(&self, err: &SombraError) {
        if !self.panicked.swap(true, Ordering::AcqRel) {
            error!(error = %err, "engine.health.panicked");
        }
    }

    /// Applies `batch` through the chain for `mode`.
    ///
    /// The batch is not written to the command log. Appliers write as they
    /// visit, so a batch rejected part way may be partly applied: any failure
    /// here leaves the engine unavailable.
    pub fn apply(&self, batch: &CommandBatch, mode: ApplicationMode) -> Result<()> {
        self.check_health()?;
        let _guard = self.commit_lock.lock();
        self.apply_locked(batch, mode)
    }

    fn apply_locked(&self, batch: &CommandBatch, mode: ApplicationMode) -> Result<()> {
        debug!(
            tx_id = batch.tx_id.0,
            commands = batch.len(),
            mode = %mode,
            "engine.apply.start"
        );
        match self.chain(mode).apply(batch) {
            Ok(()) => {
                self.next_tx.fetch_max(batch.tx_id.0 + 1, Ordering::AcqRel);
                self.metrics.batch_applied(mode.as_str(), batch.len());
                debug!(tx_id = batch.tx_id.0, mode = %mode, "engine.apply.done");
                Ok(())
            }
            Err(err) => {
                self.mark_failed(&err);
                self.metrics.batch_failed(mode.as_str());
                error!(tx_id = batch.tx_id.0, mode = %mode, error = %err, "engine.apply.failed");
                Err(err)
            }
        }
    }

    /// Starts a transaction.
    pub fn begin(&self) -> Result<Transaction> {
        self.check_health()?;
        let client = self.locks.client();
        let locker: Box<dyn ResourceLocker> = if self.options.verify_lock_order {
            Box::new(OrderVerifyingLocker::new(client))
        } else {
            Box::new(client)
        };
        Ok(Transaction {
            locker,
            state: TransactionRecordState::new(self.stores.clone()),
        })
    }

    /// Commits `tx`: runs its relationship changes under lock, logs the
    /// resulting batch, then applies it. Returns the id the batch was logged
    /// under, or `None` when the transaction changed nothing.
    ///
    /// The transaction's locks are released once the batch is applied or
    /// the commit fails.
    pub fn commit(&self, mut tx: Transaction) -> Result<Option<TxId>> {
        self.check_health()?;
        let commands = tx
            .state
            .extract_commands(&self.modifier, tx.locker.as_ref())?;
        if commands.is_empty() {
            return Ok(None);
        }

        // A batch that cannot be encoded or logged is refused before it
        // takes a transaction id.
        let payload = encode_batch(&commands)?;
        if payload.len() > CommandLog::MAX_PAYLOAD_LEN {
            return Err(SombraError::InvalidOwned(format!(
                "command batch of {} bytes exceeds the log entry limit",
                payload.len()
            )));
        }

        let _guard = self.commit_lock.lock();
        let tx_id = TxId(self.next_tx.fetch_add(1, Ordering::AcqRel));
        let batch = CommandBatch::new(tx_id, commands);
        let logged = self.log.append(tx_id, &payload).and_then(|_| {
            if self.options.sync_log_on_commit {
                self.log.sync()
            } else {
                Ok(())
            }
        });
        if let Err(err) = logged {
            self.observe(&err);
            error!(tx_id = tx_id.0, error = %err, "engine.commit.log_failed");
            return Err(err);
        }
        self.apply_locked(&batch, ApplicationMode::Internal)?;

        if let Some(outcome) = tx.state.outcome() {
            for _ in 0..outcome.created {
                self.metrics.relationship_created();
            }
            for _ in 0..outcome.deleted {
                self.metrics.relationship_deleted();
            }
            for _ in &outcome.promoted {
                self.metrics.node_promoted();
            }
        }
        info!(tx_id = tx_id.0, commands = batch.len(), "engine.commit.done");
        Ok(Some(tx_id))
    }

    /// Replays every intact log entry in recovery mode and cuts a torn tail.
    pub fn recover(&self) -> Result<RecoveryStats> {
        self.check_health()?;
        let _guard = self.commit_lock.lock();
        let mut stats = RecoveryStats::default();
        let mut entries = self.log.iter()?;
        while let Some(entry) = entries.next_entry()? {
            let commands = decode_batch(&entry.payload).map_err(|err| {
                self.observe(&err);
                err
            })?;
            let batch = CommandBatch::new(entry.tx_id, commands);
            self.apply_locked(&batch, ApplicationMode::Recovery)?;
            stats.batches_replayed += 1;
            stats.commands_replayed += batch.len() as u64;
            stats.last_tx = Some(entry.tx_id.0);
        }
        stats.log_valid_up_to = entries.valid_up_to();
        if stats.log_valid_up_to == self.log.append_offset() {
            self.log.truncate_to(stats.log_valid_up_to)?;
        } else {
            warn!(
                valid_up_to = stats.log_valid_up_to,
                append_offset = self.log.append_offset(),
                "engine.recover.log_moved"
            );
        }

        if self.options.verify_after_recovery {
            let report = verify_chains(&self.stores)?;
            stats.verified = Some(report.success);
            if !report.success {
                let detail = report
                    .findings
                    .iter()
                    .map(|f| f.message.as_str())
                    .collect::<Vec<_>>()
                    .join("; ");
                error!(findings = report.findings.len(), "engine.recover.verify_failed");
                return Err(SombraError::integrity("chain-verification", detail));
            }
        }
        info!(
            batches = stats.batches_replayed,
            commands = stats.commands_replayed,
            last_tx = stats.last_tx,
            "engine.recover.complete"
        );
        Ok(stats)
    }
}

/// Failure to build an engine from a config file.
#[derive(Debug, thiserror::Error)]
pub enum EngineOpenError {
    /// The config file could not be read or parsed.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The engine itself failed to open.
    #[error(transparent)]
    Storage(#[from] SombraError),
}

/// An open transaction: its lock client plus its staged changes.
///
/// Node-level operations lock the node exclusively before staging it, so a
/// staged image cannot go stale while the transaction runs. Dropping the
/// transaction without committing discards the changes and releases its
/// locks.
///
/// Node locks are taken call by call and held until the transaction ends,
/// so two transactions touching the same nodes in opposite orders can wait
/// on each other. The lock manager detects such a cycle and fails the
/// acquisition that would close it with [`SombraError::Deadlock`]; the
/// caller should drop that transaction and retry it.
pub struct Transaction {
    locker: Box<dyn ResourceLocker>,
    state: TransactionRecordState,
}

impl Transaction {
    /// Staged changes so far.
    pub fn state(&self) -> &TransactionRecordState {
        &self.state
    }

    /// Locker the transaction's locks are held by.
    pub fn locker(&self) -> &dyn ResourceLocker {
        self.locker.as_ref()
    }

    fn lock_nodes(&self, nodes: &[NodeId]) -> Result<()> {
        let mut ids: Vec<u64> = nodes.iter().map(|n| n.0).collect();
        ids.sort_unstable();
        ids.dedup();
        self.locker.acquire_exclusive(ResourceType::Node, &ids)
    }

    /// Creates a node and locks it.
    pub fn node_create(&mut self) -> Result<NodeId> {
        let node = self.state.node_create()?;
        self.lock_nodes(&[node])?;
        Ok(node)
    }

    /// Deletes `node`; it must end the transaction without relationships.
    pub fn node_delete(&mut self, node: NodeId) -> Result<()> {
        self.lock_nodes(&[node])?;
        self.state.node_delete(node)
    }

    /// See [`TransactionRecordState::node_add_label`].
    pub fn node_add_label(&mut self, node: NodeId, label: LabelId) -> Result<bool> {
        self.lock_nodes(&[node])?;
        self.state.node_add_label(node, label)
    }

    /// See [`TransactionRecordState::node_remove_label`].
    pub fn node_remove_label(&mut self, node: NodeId, label: LabelId) -> Result<bool> {
        self.lock_nodes(&[node])?;
        self.state.node_remove_label(node, label)
    }

    /// Sets property `key` on `node`.
    pub fn node_set_property(&mut self, node: NodeId, key: PropKeyId, value: &[u8]) -> Result<()> {
        self.lock_nodes(&[node])?;
        self.state.node_set_property(node, key, value)
    }

    /// Removes property `key` from `node`.
    pub fn node_remove_property(&mut self, node: NodeId, key: PropKeyId) -> Result<bool> {
        self.lock_nodes(&[node])?;
        self.state.node_remove_property(node, key)
    }

    /// Locks both nodes, lowest id first, and queues the relationship.
    pub fn relationship_create(
        &mut self,
        ty: TypeId,
        first: NodeId,
        second: NodeId,
    ) -> Result<RelId> {
        self.lock_nodes(&[first, second])?;
        self.state.relationship_create(ty, first, second)
    }

    /// Queues deletion of `id`; the relationship itself is locked at commit.
    pub fn relationship_delete(&mut self, id: RelId) -> Result<()> {
        self.state.relationship_delete(id)
    }

    /// Locks relationship `id` and sets property `key` on it.
    pub fn relationship_set_property(
        &mut self,
        id: RelId,
        key: PropKeyId,
        value: &[u8],
    ) -> Result<()> {
        self.locker
            .acquire_exclusive(ResourceType::Relationship, &[id.0])?;
        self.state.relationship_set_property(id, key, value)
    }

    /// Locks relationship `id` and removes property `key` from it.
    pub fn relationship_remove_property(&mut self, id: RelId, key: PropKeyId) -> Result<bool> {
        self.locker
            .acquire_exclusive(ResourceType::Relationship, &[id.0])?;
        self.state.relationship_remove_property(id, key)
    }

    /// Creates a public token named `name`.
    pub fn token_create(&mut self, kind: TokenKind, name: &str) -> Result<TokenId> {
        self.state.token_create(kind, name, false)
    }

    /// Stores an opaque schema rule.
    pub fn schema_rule_create(&mut self, rule: Vec<u8>, constraint: bool) -> Result<SchemaId> {
        self.state.schema_rule_create(rule, constraint)
    }

    /// Marks schema rule `id` unused.
    pub fn schema_rule_drop(&mut self, id: SchemaId) -> Result<()> {
        self.state.schema_rule_drop(id)
    }

    /// Sets metadata slot `id`.
    pub fn metadata_set(&mut self, id: MetaId, value: u64) -> Result<()> {
        self.state.metadata_set(id, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::apply::NoopIndexListener;
    use crate::storage::command::Command;
    use crate::storage::metrics::CounterMetrics;
    use crate::storage::store::{CountsKey, RecordLoad};

    fn engine_with(stores: Stores, options: EngineOptions) -> Result<RecordStorageEngine> {
        RecordStorageEngine::new(stores, options, Arc::new(NoopIndexListener))
    }

    #[test]
    fn chains_follow_mode() -> Result<()> {
        let engine = engine_with(
            Stores::in_memory(),
            EngineOptions::new().consistency_check_on_apply(true),
        )?;
        assert_eq!(
            engine.applier_names(ApplicationMode::Internal),
            vec!["store", "consistency", "counts", "index"]
        );
        assert_eq!(
            engine.applier_names(ApplicationMode::Recovery),
            vec!["store", "consistency", "high_id", "counts", "index"]
        );
        Ok(())
    }

    #[test]
    fn commit_applies_and_counts() -> Result<()> {
        let metrics = Arc::new(CounterMetrics::default());
        let engine = engine_with(
            Stores::in_memory(),
            EngineOptions::new()
                .dense_node_threshold(3)
                .verify_lock_order(true)
                .metrics(metrics.clone()),
        )?;
        let mut tx = engine.begin()?;
        let hub = tx.node_create()?;
        let mut rels = Vec::new();
        for _ in 0..4 {
            let leaf = tx.node_create()?;
            rels.push(tx.relationship_create(TypeId(1), hub, leaf)?);
        }
        assert_eq!(engine.commit(tx)?, Some(TxId(1)));

        let stored = engine.stores().nodes.get_record(hub, RecordLoad::Normal)?;
        assert!(stored.is_dense());
        let counts = &engine.stores().counts;
        assert_eq!(counts.get(&CountsKey::Nodes { label: None }), 5);
        assert_eq!(
            counts.get(&CountsKey::Relationships {
                start_label: None,
                ty: Some(TypeId(1)),
                end_label: None
            }),
            4
        );
        assert_eq!(metrics.relationships_created.load(Ordering::Relaxed), 4);
        assert_eq!(metrics.nodes_promoted.load(Ordering::Relaxed), 1);
        assert_eq!(engine.lock_manager().active_lock_count(), 0);
        assert!(verify_chains(engine.stores())?.success);

        let mut tx = engine.begin()?;
        tx.relationship_delete(rels[2])?;
        assert_eq!(engine.commit(tx)?, Some(TxId(2)));
        let gone = engine
            .stores()
            .relationships
            .get_record(rels[2], RecordLoad::Always)?;
        assert!(!gone.in_use);
        assert!(verify_chains(engine.stores())?.success);
        Ok(())
    }

    #[test]
    fn empty_transaction_logs_nothing() -> Result<()> {
        let engine = engine_with(Stores::in_memory(), EngineOptions::new())?;
        assert_eq!(engine.commit(engine.begin()?)?, None);
        assert!(engine.log().last_tx_id().is_none());
        Ok(())
    }

    #[test]
    fn recovery_rebuilds_fresh_stores() -> Result<()> {
        let io = Arc::new(MemFileIo::new());
        let first = RecordStorageEngine::with_log_io(
            Stores::in_memory(),
            EngineOptions::new(),
            Arc::new(NoopIndexListener),
            io.clone(),
        )?;
        let mut tx = first.begin()?;
        let a = tx.node_create()?;
        let b = tx.node_create()?;
        let rel = tx.relationship_create(TypeId(0), a, b)?;
        tx.node_set_property(a, PropKeyId(2), b"value")?;
        first.commit(tx)?;
        let mut tx = first.begin()?;
        tx.node_add_label(b, LabelId(4))?;
        first.commit(tx)?;
        drop(first);

        let stores = Stores::in_memory();
        let second = RecordStorageEngine::with_log_io(
            stores.clone(),
            EngineOptions::new(),
            Arc::new(NoopIndexListener),
            io,
        )?;
        let stats = second.recover()?;
        assert_eq!(stats.batches_replayed, 2);
        assert_eq!(stats.last_tx, Some(2));
        assert_eq!(stats.verified, Some(true));
        let relationship = stores.relationships.get_record(rel, RecordLoad::Normal)?;
        assert_eq!((relationship.first_node, relationship.second_node), (a, b));
        assert_eq!(stores.nodes.high_id(), 2);
        assert_eq!(stores.counts.get(&CountsKey::Nodes { label: Some(LabelId(4)) }), 1);

        let mut tx = second.begin()?;
        let c = tx.node_create()?;
        assert_eq!(c, NodeId(2));
        assert_eq!(second.commit(tx)?, Some(TxId(3)));
        Ok(())
    }

    #[test]
    fn torn_tail_is_cut_during_recovery() -> Result<()> {
        let io = Arc::new(MemFileIo::new());
        let engine = RecordStorageEngine::with_log_io(
            Stores::in_memory(),
            EngineOptions::new(),
            Arc::new(NoopIndexListener),
            io.clone(),
        )?;
        let mut tx = engine.begin()?;
        tx.node_create()?;
        engine.commit(tx)?;
        let intact = io.len()?;
        drop(engine);
        io.write_at(intact, &[0xAB; 20])?;

        let engine = RecordStorageEngine::with_log_io(
            Stores::in_memory(),
            EngineOptions::new(),
            Arc::new(NoopIndexListener),
            io.clone(),
        )?;
        let stats = engine.recover()?;
        assert_eq!(stats.batches_replayed, 1);
        assert_eq!(stats.log_valid_up_to, intact);
        assert_eq!(io.len()?, intact);
        Ok(())
    }

    #[test]
    fn fatal_error_makes_engine_unavailable() -> Result<()> {
        let engine = engine_with(Stores::in_memory(), EngineOptions::new())?;
        let batch = CommandBatch::new(
            TxId(7),
            vec![Command::NodeCount {
                label: None,
                delta: 1,
            }],
        );
        engine.apply(&batch, ApplicationMode::External)?;
        assert!(engine.is_healthy());

        engine.observe(&SombraError::Corruption("simulated"));
        assert!(!engine.is_healthy());
        let err = engine.begin().err().expect("engine unavailable");
        assert!(matches!(err, SombraError::Unavailable(_)));
        assert!(matches!(
            engine.apply(&batch, ApplicationMode::External),
            Err(SombraError::Unavailable(_))
        ));
        Ok(())
    }

    #[test]
    fn rejected_batch_makes_engine_unavailable() -> Result<()> {
        use crate::storage::command::RecordCommand;
        use crate::storage::record::{PrevLink, RelationshipRecord};

        let metrics = Arc::new(CounterMetrics::default());
        let engine = engine_with(
            Stores::in_memory(),
            EngineOptions::new()
                .consistency_check_on_apply(true)
                .metrics(metrics.clone()),
        )?;
        let mut rel = RelationshipRecord::unused(RelId(10));
        rel.initialize(NodeId(1), NodeId(2), TypeId(0));
        rel.in_use = true;
        rel.first_prev = PrevLink::Rel(RelId(5));
        let batch = CommandBatch::new(
            TxId(3),
            vec![Command::Relationship(RecordCommand::new(
                RelationshipRecord::unused(RelId(10)),
                rel,
            ))],
        );

        let err = engine
            .apply(&batch, ApplicationMode::External)
            .err()
            .expect("dangling prev is rejected");
        assert!(matches!(err, SombraError::Integrity { .. }));
        assert!(err.to_string().contains("prev refers to unused"), "{err}");
        // The store applier already wrote the record.
        let stored = engine
            .stores()
            .relationships
            .get_record(RelId(10), RecordLoad::Always)?;
        assert!(stored.in_use);
        assert!(!engine.is_healthy());
        assert_eq!(metrics.batches_failed.load(Ordering::Relaxed), 1);
        assert!(matches!(engine.begin(), Err(SombraError::Unavailable(_))));
        assert!(matches!(
            engine.apply(&batch, ApplicationMode::External),
            Err(SombraError::Unavailable(_))
        ));
        Ok(())
    }

    #[test]
    fn oversized_value_is_refused_before_logging() -> Result<()> {
        use crate::storage::transaction::MAX_VALUE_LEN;

        let engine = engine_with(Stores::in_memory(), EngineOptions::new())?;
        let mut tx = engine.begin()?;
        let node = tx.node_create()?;
        assert!(tx
            .node_set_property(node, PropKeyId(0), &vec![0u8; MAX_VALUE_LEN + 1])
            .is_err());
        tx.node_set_property(node, PropKeyId(0), &[1, 2, 3])?;
        assert_eq!(engine.commit(tx)?, Some(TxId(1)));
        assert!(engine.is_healthy());

        let mut entries = engine.log().iter()?;
        let entry = entries.next_entry()?.expect("one entry");
        let commands = decode_batch(&entry.payload)?;
        assert!(commands.iter().any(|c| matches!(c, Command::Property(_))));
        assert!(entries.next_entry()?.is_none());
        Ok(())
    }

    #[test]
    fn crossing_transactions_get_a_deadlock_not_a_hang() -> Result<()> {
        let engine = engine_with(Stores::in_memory(), EngineOptions::new())?;
        let mut setup = engine.begin()?;
        let a = setup.node_create()?;
        let b = setup.node_create()?;
        engine.commit(setup)?;

        let mut first = engine.begin()?;
        first.node_set_property(a, PropKeyId(1), b"first")?;
        std::thread::scope(|scope| -> Result<()> {
            let (locked_b, ready) = std::sync::mpsc::channel();
            let engine = &engine;
            let second = scope.spawn(move || -> Result<Option<TxId>> {
                let mut tx = engine.begin()?;
                tx.node_set_property(b, PropKeyId(1), b"second")?;
                locked_b.send(()).expect("test thread alive");
                tx.node_set_property(a, PropKeyId(2), b"second")?;
                engine.commit(tx)
            });
            ready.recv().expect("second transaction locked b");
            while engine.lock_manager().waiting_count() == 0 {
                std::thread::yield_now();
            }
            let err = first
                .node_set_property(b, PropKeyId(2), b"first")
                .unwrap_err();
            assert!(matches!(err, SombraError::Deadlock(_)), "{err}");
            drop(first);
            assert_eq!(second.join().expect("second transaction")?, Some(TxId(2)));
            Ok(())
        })?;
        assert!(engine.is_healthy());
        assert_eq!(engine.lock_manager().active_lock_count(), 0);
        Ok(())
    }

    #[test]
    fn external_batches_advance_transaction_ids() -> Result<()> {
        let engine = engine_with(Stores::in_memory(), EngineOptions::new())?;
        let batch = CommandBatch::new(
            TxId(7),
            vec![Command::NodeCount {
                label: None,
                delta: 1,
            }],
        );
        engine.apply(&batch, ApplicationMode::External)?;
        let mut tx = engine.begin()?;
        tx.node_create()?;
        assert_eq!(engine.commit(tx)?, Some(TxId(8)));
        Ok(())
    }
}

//! Replaying the command log after a reopen.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use sombra_recstore::storage::apply::NoopIndexListener;
use sombra_recstore::storage::record::TokenKind;
use sombra_recstore::storage::store::{RecordLoad, RecordStore, Stores};
use sombra_recstore::storage::{EngineConfig, RecordStorageEngine};
use sombra_recstore::types::{LabelId, MetaId, NodeId, PropKeyId, RelId, Result, TxId, TypeId};
use tempfile::tempdir;

fn config_for(path: &std::path::Path) -> EngineConfig {
    EngineConfig::from_toml(&format!(
        "[engine]\ndense_node_threshold = 3\nconsistency_check_on_apply = true\nlog_path = {:?}\n",
        path.display().to_string()
    ))
    .expect("config parses")
}

fn open(stores: Stores, config: &EngineConfig) -> RecordStorageEngine {
    RecordStorageEngine::from_config(stores, config, Arc::new(NoopIndexListener))
        .expect("engine opens")
}

/// Writes a small graph over several transactions and returns the hub node.
fn populate(engine: &RecordStorageEngine) -> Result<NodeId> {
    let mut tx = engine.begin()?;
    let person = tx.token_create(TokenKind::Label, "Person")?;
    let knows = tx.token_create(TokenKind::RelationshipType, "KNOWS")?;
    let name = tx.token_create(TokenKind::PropertyKey, "name")?;
    tx.metadata_set(MetaId(1), 42)?;
    let hub = tx.node_create()?;
    tx.node_add_label(hub, LabelId(person.0))?;
    tx.node_set_property(
        hub,
        PropKeyId(name.0),
        b"a name long enough to spill into value records",
    )?;
    engine.commit(tx)?;

    let mut rels = Vec::new();
    for _ in 0..3 {
        let mut tx = engine.begin()?;
        for _ in 0..2 {
            let other = tx.node_create()?;
            let rel = tx.relationship_create(TypeId(knows.0), hub, other)?;
            tx.relationship_set_property(rel, PropKeyId(name.0), b"since")?;
            rels.push(rel);
        }
        engine.commit(tx)?;
    }

    let mut tx = engine.begin()?;
    tx.relationship_delete(rels[1])?;
    tx.relationship_remove_property(rels[4], PropKeyId(name.0))?;
    tx.node_remove_property(hub, PropKeyId(name.0))?;
    engine.commit(tx)?;
    Ok(hub)
}

fn assert_same_records(expected: &Stores, actual: &Stores) -> Result<()> {
    for raw in 0..expected.nodes.high_id() {
        assert_eq!(
            expected.nodes.get_record(NodeId(raw), RecordLoad::Always)?,
            actual.nodes.get_record(NodeId(raw), RecordLoad::Always)?,
            "node {raw}"
        );
    }
    for raw in 0..expected.relationships.high_id() {
        assert_eq!(
            expected.relationships.get_record(RelId(raw), RecordLoad::Always)?,
            actual.relationships.get_record(RelId(raw), RecordLoad::Always)?,
            "relationship {raw}"
        );
    }
    assert_eq!(expected.counts.snapshot(), actual.counts.snapshot());
    Ok(())
}

#[test]
fn replay_rebuilds_identical_stores() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let config = config_for(&dir.path().join("commands.log"));

    let original = Stores::in_memory();
    let engine = open(original.clone(), &config);
    let hub = populate(&engine)?;
    drop(engine);

    let replayed = Stores::in_memory();
    let engine = open(replayed.clone(), &config);
    let stats = engine.recover()?;
    assert_eq!(stats.batches_replayed, 5);
    assert_eq!(stats.last_tx, Some(5));
    assert_eq!(stats.verified, Some(true));
    assert!(replayed.nodes.get_record(hub, RecordLoad::Normal)?.is_dense());
    assert_same_records(&original, &replayed)?;

    let mut tx = engine.begin()?;
    let fresh = tx.node_create()?;
    assert_eq!(fresh, NodeId(original.nodes.high_id()));
    assert_eq!(engine.commit(tx)?, Some(TxId(6)));
    Ok(())
}

#[test]
fn replay_is_idempotent() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let config = config_for(&dir.path().join("commands.log"));
    let stores = Stores::in_memory();
    let engine = open(stores.clone(), &config);
    populate(&engine)?;
    let counts_before = stores.counts.snapshot();

    let stats = engine.recover()?;
    assert_eq!(stats.batches_replayed, 5);
    assert_eq!(stores.counts.snapshot(), counts_before);
    Ok(())
}

#[test]
fn torn_tail_is_discarded() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("commands.log");
    let config = config_for(&path);
    let original = Stores::in_memory();
    let engine = open(original.clone(), &config);
    populate(&engine)?;
    drop(engine);
    let intact = std::fs::metadata(&path).expect("log metadata").len();

    let mut file = OpenOptions::new().append(true).open(&path).expect("log opens");
    file.write_all(&[0x5A; 45]).expect("garbage written");
    drop(file);

    let replayed = Stores::in_memory();
    let engine = open(replayed.clone(), &config);
    let stats = engine.recover()?;
    assert_eq!(stats.batches_replayed, 5);
    assert_eq!(stats.log_valid_up_to, intact);
    assert_eq!(std::fs::metadata(&path).expect("log metadata").len(), intact);
    assert_same_records(&original, &replayed)?;
    Ok(())
}

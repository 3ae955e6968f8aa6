//! Randomised mutation sequences checked against the chain verifier.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use sombra_recstore::admin::verify_chains;
use sombra_recstore::storage::apply::NoopIndexListener;
use sombra_recstore::storage::store::{CountsKey, RecordLoad, RecordStore, Stores};
use sombra_recstore::storage::{EngineOptions, RecordStorageEngine};
use sombra_recstore::types::{NodeId, RelId, Result, TypeId};

const NODES: u64 = 6;

#[derive(Debug, Clone)]
enum Op {
    Create { first: u64, second: u64, ty: u32 },
    Delete { pick: usize },
    Commit,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        5 => (0..NODES, 0..NODES, 0u32..3)
            .prop_map(|(first, second, ty)| Op::Create { first, second, ty }),
        2 => any::<usize>().prop_map(|pick| Op::Delete { pick }),
        1 => Just(Op::Commit),
    ]
}

fn engine(dense_threshold: u64) -> Result<RecordStorageEngine> {
    RecordStorageEngine::new(
        Stores::in_memory(),
        EngineOptions::new()
            .dense_node_threshold(dense_threshold)
            .external_degrees_threshold(3)
            .consistency_check_on_apply(true)
            .verify_lock_order(true),
        Arc::new(NoopIndexListener),
    )
}

fn run(ops: &[Op], dense_threshold: u64) -> Result<()> {
    let engine = engine(dense_threshold)?;
    let mut tx = engine.begin()?;
    let nodes: Vec<NodeId> = (0..NODES).map(|_| tx.node_create()).collect::<Result<_>>()?;
    engine.commit(tx)?;

    let mut live: Vec<(RelId, TypeId)> = Vec::new();
    let mut deleted: Vec<RelId> = Vec::new();
    let mut tx = engine.begin()?;
    for op in ops {
        match op {
            Op::Create { first, second, ty } => {
                let ty = TypeId(*ty);
                let (first, second) = (nodes[*first as usize], nodes[*second as usize]);
                let id = tx.relationship_create(ty, first, second)?;
                live.push((id, ty));
            }
            Op::Delete { pick } => {
                if live.is_empty() {
                    continue;
                }
                let (id, _) = live.remove(pick % live.len());
                tx.relationship_delete(id)?;
                deleted.push(id);
            }
            Op::Commit => {
                engine.commit(tx)?;
                tx = engine.begin()?;
            }
        }
    }
    engine.commit(tx)?;

    let stores = engine.stores();
    let report = verify_chains(stores)?;
    assert!(report.success, "{:#?}", report.findings);
    assert_eq!(report.counts.relationships_found, live.len() as u64);

    let mut per_type: BTreeMap<TypeId, i64> = BTreeMap::new();
    for (id, ty) in &live {
        *per_type.entry(*ty).or_default() += 1;
        assert!(stores.relationships.get_record(*id, RecordLoad::Normal)?.in_use);
    }
    for id in &deleted {
        assert!(!stores.relationships.get_record(*id, RecordLoad::Always)?.in_use);
    }
    for ty in 0..3 {
        let key = CountsKey::Relationships {
            start_label: None,
            ty: Some(TypeId(ty)),
            end_label: None,
        };
        assert_eq!(
            stores.counts.get(&key),
            per_type.get(&TypeId(ty)).copied().unwrap_or(0)
        );
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn chains_stay_consistent_under_random_edits(ops in prop::collection::vec(arb_op(), 1..80)) {
        run(&ops, 4).map_err(|err| TestCaseError::fail(err.to_string()))?;
    }

    #[test]
    fn sparse_only_chains_stay_consistent(ops in prop::collection::vec(arb_op(), 1..60)) {
        run(&ops, 1_000).map_err(|err| TestCaseError::fail(err.to_string()))?;
    }
}

#[test]
fn dense_hub_survives_full_teardown() -> Result<()> {
    let engine = engine(5)?;
    let mut tx = engine.begin()?;
    let hub = tx.node_create()?;
    let mut rels = Vec::new();
    for i in 0..20u32 {
        let leaf = tx.node_create()?;
        let (first, second) = if i % 2 == 0 { (hub, leaf) } else { (leaf, hub) };
        rels.push(tx.relationship_create(TypeId(i % 3), first, second)?);
    }
    rels.push(tx.relationship_create(TypeId(7), hub, hub)?);
    engine.commit(tx)?;
    assert!(engine.stores().nodes.get_record(hub, RecordLoad::Normal)?.is_dense());
    assert!(verify_chains(engine.stores())?.success);

    for chunk in rels.chunks(4) {
        let mut tx = engine.begin()?;
        for id in chunk {
            tx.relationship_delete(*id)?;
        }
        engine.commit(tx)?;
        let report = verify_chains(engine.stores())?;
        assert!(report.success, "{:#?}", report.findings);
    }

    let mut tx = engine.begin()?;
    tx.node_delete(hub)?;
    engine.commit(tx)?;
    let node = engine.stores().nodes.get_record(hub, RecordLoad::Always)?;
    assert!(!node.in_use);
    assert_eq!(engine.stores().counts.get(&CountsKey::Nodes { label: None }), 20);
    Ok(())
}

//! Parallel writers sharing a dense hub node.

use std::sync::{Arc, Once};
use std::thread;

use sombra_recstore::admin::verify_chains;
use sombra_recstore::storage::apply::NoopIndexListener;
use sombra_recstore::storage::store::{CountsKey, RecordLoad, RecordStore, Stores};
use sombra_recstore::storage::{EngineOptions, RecordStorageEngine};
use sombra_recstore::types::{NodeId, RelId, Result, TypeId};
use tracing_subscriber::EnvFilter;

const THREADS: usize = 4;
const ROUNDS: usize = 25;
const RING: usize = 3;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sombra_recstore=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn total_relationships() -> CountsKey {
    CountsKey::Relationships {
        start_label: None,
        ty: None,
        end_label: None,
    }
}

/// One worker: an anchor node tied to the shared hub every round, plus
/// private rings whose edges are occasionally removed again.
fn worker(engine: &RecordStorageEngine, hub: NodeId, index: usize) -> Result<usize> {
    let ty = TypeId(index as u32);
    let mut tx = engine.begin()?;
    let anchor = tx.node_create()?;
    engine.commit(tx)?;

    let mut live = 0usize;
    let mut previous_ring: Vec<RelId> = Vec::new();
    for round in 0..ROUNDS {
        let mut tx = engine.begin()?;
        let ring: Vec<NodeId> = (0..RING).map(|_| tx.node_create()).collect::<Result<_>>()?;
        let mut ring_rels = Vec::with_capacity(RING);
        for i in 0..RING {
            ring_rels.push(tx.relationship_create(ty, ring[i], ring[(i + 1) % RING])?);
        }
        tx.relationship_create(ty, anchor, hub)?;
        engine.commit(tx)?;
        live += RING + 1;

        if round % 3 == 2 {
            let mut tx = engine.begin()?;
            for id in previous_ring.drain(..).take(2) {
                tx.relationship_delete(id)?;
                live -= 1;
            }
            engine.commit(tx)?;
        }
        previous_ring = ring_rels;
    }
    Ok(live)
}

#[test]
fn parallel_writers_keep_chains_intact() -> Result<()> {
    init_tracing();
    let engine = Arc::new(RecordStorageEngine::new(
        Stores::in_memory(),
        EngineOptions::new()
            .dense_node_threshold(8)
            .external_degrees_threshold(4)
            .consistency_check_on_apply(true),
        Arc::new(NoopIndexListener),
    )?);
    let mut tx = engine.begin()?;
    let hub = tx.node_create()?;
    engine.commit(tx)?;

    let live: usize = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|index| {
                let engine = Arc::clone(&engine);
                scope.spawn(move || worker(&engine, hub, index))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("worker panicked"))
            .sum::<Result<usize>>()
    })?;

    assert!(engine.is_healthy());
    assert_eq!(engine.lock_manager().active_lock_count(), 0);
    let stores = engine.stores();
    assert!(stores.nodes.get_record(hub, RecordLoad::Normal)?.is_dense());

    let report = verify_chains(stores)?;
    assert!(report.success, "{:#?}", report.findings);
    assert_eq!(report.counts.relationships_found, live as u64);
    assert_eq!(stores.counts.get(&total_relationships()), live as i64);
    for index in 0..THREADS {
        let key = CountsKey::Relationships {
            start_label: None,
            ty: Some(TypeId(index as u32)),
            end_label: None,
        };
        assert_eq!(stores.counts.get(&key), (live / THREADS) as i64);
    }
    Ok(())
}

#[test]
fn hub_degree_matches_committed_edges() -> Result<()> {
    init_tracing();
    let engine = Arc::new(RecordStorageEngine::new(
        Stores::in_memory(),
        EngineOptions::new().dense_node_threshold(4),
        Arc::new(NoopIndexListener),
    )?);
    let mut tx = engine.begin()?;
    let hub = tx.node_create()?;
    engine.commit(tx)?;

    thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|index| {
                let engine = Arc::clone(&engine);
                scope.spawn(move || -> Result<()> {
                    for _ in 0..10 {
                        let mut tx = engine.begin()?;
                        let leaf = tx.node_create()?;
                        let (first, second) = if index % 2 == 0 { (hub, leaf) } else { (leaf, hub) };
                        tx.relationship_create(TypeId(0), first, second)?;
                        engine.commit(tx)?;
                    }
                    Ok(())
                })
            })
            .collect();
        handles
            .into_iter()
            .try_for_each(|handle| handle.join().expect("writer panicked"))
    })?;

    let report = verify_chains(engine.stores())?;
    assert!(report.success, "{:#?}", report.findings);
    assert_eq!(report.counts.relationships_found, (THREADS * 10) as u64);
    assert_eq!(report.counts.dense_nodes, 1);
    Ok(())
}

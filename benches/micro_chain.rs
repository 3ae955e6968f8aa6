//! Relationship create/delete and codec throughput.

#![forbid(unsafe_code)]

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sombra_recstore::storage::apply::NoopIndexListener;
use sombra_recstore::storage::command::{decode_batch, encode_batch};
use sombra_recstore::storage::store::Stores;
use sombra_recstore::storage::{EngineOptions, RecordStorageEngine};
use sombra_recstore::types::{NodeId, RelId, TypeId};

const NODE_COUNT: usize = 512;
const SEED_EDGES: usize = 4_096;
const TYPES: u32 = 4;

fn micro_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/chain");
    group.sample_size(40);
    group.throughput(Throughput::Elements(1));

    for threshold in [8u64, 50, 10_000] {
        let mut harness = ChainHarness::new(threshold);
        group.bench_with_input(
            BenchmarkId::new("create_delete", threshold),
            &threshold,
            |b, _| {
                b.iter(|| black_box(harness.create_then_delete()));
            },
        );
    }

    let harness = ChainHarness::new(50);
    group.bench_function("codec_roundtrip", |b| {
        b.iter(|| black_box(harness.encode_decode()));
    });
    group.finish();
}

struct ChainHarness {
    engine: RecordStorageEngine,
    nodes: Vec<NodeId>,
    rng: ChaCha8Rng,
}

impl ChainHarness {
    fn new(dense_threshold: u64) -> Self {
        let engine = RecordStorageEngine::new(
            Stores::in_memory(),
            EngineOptions::new()
                .dense_node_threshold(dense_threshold)
                .sync_log_on_commit(false),
            Arc::new(NoopIndexListener),
        )
        .expect("engine");
        let mut harness = Self {
            engine,
            nodes: Vec::with_capacity(NODE_COUNT),
            rng: ChaCha8Rng::seed_from_u64(0x5EED_C4A1),
        };
        harness.seed();
        harness
    }

    fn seed(&mut self) {
        let mut tx = self.engine.begin().expect("begin");
        for _ in 0..NODE_COUNT {
            self.nodes.push(tx.node_create().expect("node"));
        }
        self.engine.commit(tx).expect("commit nodes");
        for _ in 0..SEED_EDGES / 256 {
            let mut tx = self.engine.begin().expect("begin");
            for _ in 0..256 {
                let (first, second, ty) = self.pick();
                tx.relationship_create(ty, first, second).expect("edge");
            }
            self.engine.commit(tx).expect("commit edges");
        }
    }

    fn pick(&mut self) -> (NodeId, NodeId, TypeId) {
        // Skew towards the first few nodes so some of them turn dense.
        let first = if self.rng.gen_bool(0.3) {
            self.nodes[self.rng.gen_range(0..4)]
        } else {
            self.nodes[self.rng.gen_range(0..self.nodes.len())]
        };
        let second = self.nodes[self.rng.gen_range(0..self.nodes.len())];
        (first, second, TypeId(self.rng.gen_range(0..TYPES)))
    }

    fn create_then_delete(&mut self) -> RelId {
        let (first, second, ty) = self.pick();
        let mut tx = self.engine.begin().expect("begin");
        let id = tx.relationship_create(ty, first, second).expect("create");
        self.engine.commit(tx).expect("commit create");
        let mut tx = self.engine.begin().expect("begin");
        tx.relationship_delete(id).expect("delete");
        self.engine.commit(tx).expect("commit delete");
        id
    }

    fn encode_decode(&self) -> usize {
        let mut entries = self.engine.log().iter().expect("log iter");
        let mut commands = 0;
        while let Some(entry) = entries.next_entry().expect("entry") {
            let decoded = decode_batch(&entry.payload).expect("decode");
            commands += encode_batch(&decoded).expect("encode").len();
        }
        commands
    }
}

criterion_group!(benches, micro_chain);
criterion_main!(benches);

//! Matching throughput benchmark.
//!
//! Measures:
//! 1. Post-then-arrive with a deep posted queue, with and without learned
//!    hashing
//! 2. Arrive-then-post through the unexpected queue
//!
//! Run with:
//! ```bash
//! cargo bench --package tagmq --bench match_bench
//! ```

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::Rng;
use rand::seq::SliceRandom;

use tagmq::{
    BufferDesc, Context, Envelope, HostMemory, MatchConfig, MsgHeader, Path, PeerId, Selector, Tag,
};

// =============================================================================
// Constants
// =============================================================================

const DEPTHS: [usize; 3] = [16, 256, 4096];
const NUM_PEERS: u64 = 64;

// =============================================================================
// Helpers
// =============================================================================

fn context(learn: bool) -> Context {
    let config = MatchConfig::default().with_learning(learn);
    Context::new(Arc::new(config), Arc::new(HostMemory)).unwrap()
}

fn header(tag: u64, sender: u64) -> MsgHeader {
    MsgHeader {
        tag: Tag(tag),
        sender: PeerId(sender),
        path: Path::Shm,
        msg_len: 8,
        gpu_resident: false,
        envelope: Envelope::Tiny(vec![0; 8]),
    }
}

/// Random (tag, sender) keys, each distinct.
fn keys(n: usize) -> Vec<(u64, u64)> {
    let mut rng = rand::thread_rng();
    let mut keys: Vec<(u64, u64)> = (0..n as u64)
        .map(|i| (i * 7919 + rng.gen_range(0..7), i % NUM_PEERS))
        .collect();
    keys.shuffle(&mut rng);
    keys
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_posted(c: &mut Criterion) {
    let mut group = c.benchmark_group("posted_queue");
    for depth in DEPTHS {
        group.throughput(Throughput::Elements(depth as u64));
        for (name, learn, selector) in [
            ("any_tag", true, Selector::ANY),
            ("learned", true, Selector::ALL),
            ("fixed", false, Selector::ALL),
        ] {
            group.bench_with_input(BenchmarkId::new(name, depth), &depth, |b, &depth| {
                let keys = keys(depth);
                let ctx = context(learn);
                b.iter(|| {
                    for &(tag, peer) in &keys {
                        ctx.post_receive(Tag(tag), selector, Some(PeerId(peer)), BufferDesc::new(0, 8));
                    }
                    for &(tag, peer) in keys.iter().rev() {
                        black_box(ctx.message_arrived(header(tag, peer)));
                    }
                });
            });
        }
    }
    group.finish();
}

fn bench_unexpected(c: &mut Criterion) {
    let mut group = c.benchmark_group("unexpected_queue");
    for depth in DEPTHS {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::new("arrive_then_post", depth), &depth, |b, &depth| {
            let keys = keys(depth);
            let ctx = context(true);
            b.iter(|| {
                for &(tag, peer) in &keys {
                    black_box(ctx.message_arrived(header(tag, peer)));
                }
                for &(tag, peer) in keys.iter().rev() {
                    black_box(ctx.post_receive(Tag(tag), Selector::ALL, Some(PeerId(peer)), BufferDesc::new(0, 8)));
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_posted, bench_unexpected);
criterion_main!(benches);

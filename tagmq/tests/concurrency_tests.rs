//! Multi-threaded access to one context under every lock discipline.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use tagmq::{Arrival, LockKind, PeerId, RecvHandle, Selector, Tag};

use common::{buffer, context_with_lock, eager};

const THREADS: u64 = 4;
const PER_THREAD: u64 = 500;

fn all_kinds() -> [LockKind; 4] {
    [
        LockKind::Spin,
        LockKind::Mutex,
        LockKind::MutexDebug,
        LockKind::MutexDebugLogContention,
    ]
}

#[test]
fn test_concurrent_post_and_arrive() {
    for kind in all_kinds() {
        let ctx = Arc::new(context_with_lock(kind));
        let delivered = Arc::new(AtomicUsize::new(0));

        // Each thread owns one sender id; tags collide across threads.
        let posters: Vec<_> = (0..THREADS)
            .map(|t| {
                let ctx = ctx.clone();
                thread::spawn(move || -> Vec<RecvHandle> {
                    (0..PER_THREAD)
                        .map(|i| {
                            ctx.post_receive(Tag(i % 16), Selector::ALL, Some(PeerId(t)), buffer(8))
                                .handle
                        })
                        .collect()
                })
            })
            .collect();
        let senders: Vec<_> = (0..THREADS)
            .map(|t| {
                let ctx = ctx.clone();
                let delivered = delivered.clone();
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        if let Arrival::Delivered(_) = ctx.message_arrived(eager(i % 16, t, 4)) {
                            delivered.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        let handles: Vec<RecvHandle> = posters.into_iter().flat_map(|h| h.join().unwrap()).collect();
        for s in senders {
            s.join().unwrap();
        }

        // Every message has exactly one matching receive, so nothing is left.
        let stats = ctx.stats();
        assert_eq!(stats.queue.posted_depth, 0, "{:?}", kind);
        assert_eq!(stats.queue.unexpected_depth, 0, "{:?}", kind);
        assert!(handles.iter().all(|h| h.outcome().unwrap().is_success()), "{:?}", kind);
        assert!(delivered.load(Ordering::Relaxed) <= (THREADS * PER_THREAD) as usize);
    }
}

#[test]
fn test_close_races_posts() {
    let ctx = Arc::new(context_with_lock(LockKind::Mutex));
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let ctx = ctx.clone();
            thread::spawn(move || -> Vec<RecvHandle> {
                (0..PER_THREAD)
                    .map(|i| ctx.post_receive(Tag(i), Selector::ALL, Some(PeerId(t)), buffer(8)).handle)
                    .collect()
            })
        })
        .collect();
    let cancelled = ctx.on_context_closing();
    let handles: Vec<RecvHandle> = workers.into_iter().flat_map(|h| h.join().unwrap()).collect();

    assert!(cancelled <= handles.len());
    assert!(handles.iter().all(|h| h.outcome().unwrap().is_cancelled()));
    assert_eq!(ctx.stats().queue.posted_depth, 0);
}

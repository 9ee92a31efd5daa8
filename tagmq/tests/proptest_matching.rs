//! Property-based tests for match queue correctness.
//!
//! A low hashing threshold forces the learning engine to assign, evict and
//! release configs constantly while random posts and arrivals run against a
//! plain reference list.

mod common;

use std::collections::{HashMap, VecDeque};

use proptest::prelude::*;

use tagmq::{Arrival, Envelope, MatchConfig, MsgHeader, Outcome, Path, PeerId, RequestId, Selector, Tag};

use common::{buffer, context};

// ============================================================================
// Test Strategies
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Post {
        tag: u64,
        selector: u64,
        source: Option<u64>,
    },
    Arrive {
        tag: u64,
        sender: u64,
    },
}

fn selector_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![Just(u64::MAX), Just(0), Just(0x1), Just(0x2)]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..4u64, selector_strategy(), prop::option::of(0..3u64))
            .prop_map(|(tag, selector, source)| Op::Post { tag, selector, source }),
        (0..4u64, 0..3u64).prop_map(|(tag, sender)| Op::Arrive { tag, sender }),
    ]
}

fn config_strategy() -> impl Strategy<Value = MatchConfig> {
    (any::<bool>(), 0..4usize)
        .prop_map(|(learn, thresh)| MatchConfig::default().with_learning(learn).with_hash_thresh(thresh))
}

fn matches(tag: u64, selector: u64, source: Option<u64>, msg_tag: u64, sender: u64) -> bool {
    (tag ^ msg_tag) & selector == 0 && source.is_none_or(|s| s == sender)
}

type Key = (u64, u64, Option<u64>);

#[derive(Debug)]
struct PostedModel {
    id: RequestId,
    key: Key,
}

// ============================================================================
// Matching Property Tests
// ============================================================================

proptest! {
    /// Every match satisfies the predicate, nothing is matched twice, a
    /// posted receive takes the oldest matching unexpected message, and
    /// same-key receives complete in posting order.
    #[test]
    fn prop_matching_is_unique_and_ordered(
        config in config_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..300),
    ) {
        let ctx = context(config);
        let mut posted: Vec<PostedModel> = Vec::new();
        let mut unexpected: VecDeque<(usize, u64, u64)> = VecDeque::new();
        let mut pending_by_key: HashMap<Key, VecDeque<RequestId>> = HashMap::new();
        let mut arrivals = 0usize;

        for op in ops {
            match op {
                Op::Post { tag, selector, source } => {
                    let key = (tag, selector, source);
                    let post = ctx.post_receive(Tag(tag), Selector(selector), source.map(PeerId), buffer(1 << 20));
                    let expected = unexpected
                        .iter()
                        .position(|&(_, t, s)| matches(tag, selector, source, t, s));
                    match (post.handle.outcome(), expected) {
                        (Some(Outcome::Success(status)), Some(pos)) => {
                            let (seq, t, s) = unexpected.remove(pos).unwrap();
                            prop_assert_eq!(status.msg_len, seq);
                            prop_assert_eq!(status.tag, Tag(t));
                            prop_assert_eq!(status.sender, PeerId(s));
                        }
                        (None, None) => {
                            posted.push(PostedModel { id: post.handle.id(), key });
                            pending_by_key.entry(key).or_default().push_back(post.handle.id());
                        }
                        (outcome, expected) => {
                            prop_assert!(false, "post outcome {:?}, model expected {:?}", outcome, expected);
                        }
                    }
                }
                Op::Arrive { tag, sender } => {
                    arrivals += 1;
                    let header = MsgHeader {
                        tag: Tag(tag),
                        sender: PeerId(sender),
                        path: Path::Shm,
                        msg_len: arrivals,
                        gpu_resident: false,
                        envelope: Envelope::Eager(Vec::new()),
                    };
                    let any_match = posted
                        .iter()
                        .any(|p| matches(p.key.0, p.key.1, p.key.2, tag, sender));
                    match ctx.message_arrived(header) {
                        Arrival::Delivered(id) => {
                            prop_assert!(any_match);
                            let pos = posted.iter().position(|p| p.id == id);
                            prop_assert!(pos.is_some(), "receive {:?} matched twice", id);
                            let p = posted.remove(pos.unwrap());
                            prop_assert!(matches(p.key.0, p.key.1, p.key.2, tag, sender));
                            let queue = pending_by_key.get_mut(&p.key).unwrap();
                            prop_assert_eq!(queue.pop_front(), Some(id));
                        }
                        Arrival::Unexpected(_) => {
                            prop_assert!(!any_match);
                            unexpected.push_back((arrivals, tag, sender));
                        }
                        other => prop_assert!(false, "unexpected arrival {:?}", other),
                    }
                }
            }

            let stats = ctx.stats();
            prop_assert_eq!(stats.queue.posted_depth, posted.len());
            prop_assert_eq!(stats.queue.unexpected_depth, unexpected.len());
            prop_assert!(stats.queue.configs.len() <= ctx.config().num_hash_configs());
        }
    }

    /// Closing cancels every outstanding receive exactly once.
    #[test]
    fn prop_close_cancels_all_pending(
        ops in prop::collection::vec(op_strategy(), 1..200),
    ) {
        let ctx = context(MatchConfig::default().with_hash_thresh(1));
        let mut handles = Vec::new();
        for op in ops {
            match op {
                Op::Post { tag, selector, source } => {
                    handles.push(ctx.post_receive(Tag(tag), Selector(selector), source.map(PeerId), buffer(64)).handle);
                }
                Op::Arrive { tag, sender } => {
                    let header = MsgHeader {
                        tag: Tag(tag),
                        sender: PeerId(sender),
                        path: Path::Shm,
                        msg_len: 0,
                        gpu_resident: false,
                        envelope: Envelope::Tiny(Vec::new()),
                    };
                    ctx.message_arrived(header);
                }
            }
        }
        let pending = handles.iter().filter(|h| !h.is_complete()).count();
        prop_assert_eq!(ctx.on_context_closing(), pending);
        for h in &handles {
            prop_assert!(h.is_complete());
        }
        prop_assert_eq!(handles.iter().filter(|h| h.outcome().unwrap().is_cancelled()).count(), pending);
    }
}

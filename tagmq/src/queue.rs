//! Match queue and tag-matching algorithm.
//!
//! A [`MatchQueue`] belongs to one communication context and holds two
//! logical queues: posted receives and unexpected messages. Each logical
//! queue is a linear list plus one bucket table per hash config slot. An
//! entry is linked into exactly one of those lists.
//!
//! # Posted receives
//!
//! A receive whose pattern class has a live hash config is hashed under it;
//! everything else, including fully wildcarded receives, sits on the linear
//! list. An arriving message probes one bucket per live config and then
//! scans the linear list. Entries that can match the same message always
//! share a list, so FIFO holds per key, but a hashed receive may win over an
//! older linear one of a different class.
//!
//! # Unexpected messages
//!
//! Unexpected messages are hashed under a single anchor config (the lowest
//! live slot), or kept linear when no config is live. When the anchor
//! changes they are rehashed in arrival order, so same-key messages are
//! always matched oldest first. A receive whose class covers the anchor's
//! bits probes one bucket; a wilder receive scans the anchor's buckets.

use std::collections::HashMap;

use bitflags::bitflags;
use slab::Slab;
use tracing::trace;

use crate::completion::{Completer, RequestId};
use crate::config::MatchConfig;
use crate::error::{Error, fatal};
use crate::learn::{ConfigId, HashConfig, HashConfigTable, Observation};
use crate::list::{Linked, Links, ListHead};
use crate::protocol::MsgHeader;
use crate::tag::{PatternClass, PeerId, Selector, Tag, tag_matches};
use crate::transport::BufferDesc;

bitflags! {
    /// Search behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MatchFlags: u8 {
        /// Unlink the matched entry.
        const REMOVE_ENTRY = 1;
    }
}

/// A receive waiting for a message.
pub struct PostedRecv {
    pub id: RequestId,
    pub tag: Tag,
    pub selector: Selector,
    pub source: Option<PeerId>,
    pub buffer: BufferDesc,
    pub completer: Completer,
}

impl PostedRecv {
    #[inline]
    pub fn class(&self) -> PatternClass {
        PatternClass::of(self.selector, self.source)
    }

    #[inline]
    pub fn accepts(&self, tag: Tag, sender: PeerId) -> bool {
        tag_matches(self.tag, self.selector, self.source, tag, sender)
    }
}

/// A message that arrived before any receive wanted it.
#[derive(Debug)]
pub struct UnexpectedMsg {
    pub id: RequestId,
    pub header: MsgHeader,
}

/// Entry of either logical queue.
pub enum MatchEntry {
    Posted(PostedRecv),
    Unexpected(UnexpectedMsg),
}

impl MatchEntry {
    fn bucket_under(&self, class: &PatternClass, num_buckets: usize) -> usize {
        match self {
            MatchEntry::Posted(r) => class.bucket(r.tag, r.source, num_buckets),
            MatchEntry::Unexpected(m) => {
                class.bucket(m.header.tag, Some(m.header.sender), num_buckets)
            }
        }
    }
}

/// A posted receive paired with the message it consumes.
pub struct Pairing {
    pub recv: PostedRecv,
    pub msg: UnexpectedMsg,
}

/// Result of a search of the unexpected queue.
pub enum Hit<'a> {
    Removed(UnexpectedMsg),
    Peeked(&'a UnexpectedMsg),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Home {
    Linear,
    Hashed { config: ConfigId, bucket: usize },
}

struct Node {
    entry: MatchEntry,
    seq: u64,
    home: Home,
    links: Links,
}

impl Linked for Node {
    fn links(&self) -> &Links {
        &self.links
    }
    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

struct BucketTable {
    buckets: Vec<ListHead>,
    len: usize,
}

/// One logical queue: linear list plus a bucket table per config slot.
struct SubQueues {
    arena: Slab<Node>,
    linear: ListHead,
    tables: Vec<BucketTable>,
}

impl SubQueues {
    fn new(num_configs: usize, num_buckets: usize) -> Self {
        Self {
            arena: Slab::new(),
            linear: ListHead::new(),
            tables: (0..num_configs)
                .map(|_| BucketTable {
                    buckets: vec![ListHead::new(); num_buckets],
                    len: 0,
                })
                .collect(),
        }
    }

    #[inline]
    fn depth(&self) -> usize {
        self.arena.len()
    }

    #[inline]
    fn table_len(&self, id: ConfigId) -> usize {
        self.tables[id.index()].len
    }

    fn push(&mut self, entry: MatchEntry, seq: u64, home: Home) {
        let idx = self.arena.insert(Node {
            entry,
            seq,
            home,
            links: Links::default(),
        });
        match home {
            Home::Linear => self.linear.push_back(&mut self.arena, idx),
            Home::Hashed { config, bucket } => {
                let table = &mut self.tables[config.index()];
                table.buckets[bucket].push_back(&mut self.arena, idx);
                table.len += 1;
            }
        }
    }

    fn remove(&mut self, idx: usize) -> MatchEntry {
        match self.arena[idx].home {
            Home::Linear => self.linear.unlink(&mut self.arena, idx),
            Home::Hashed { config, bucket } => {
                let table = &mut self.tables[config.index()];
                table.buckets[bucket].unlink(&mut self.arena, idx);
                table.len -= 1;
            }
        }
        self.arena.remove(idx).entry
    }

    fn find_linear(&self, pred: impl FnMut(&Node) -> bool) -> Option<usize> {
        self.linear.find(&self.arena, pred)
    }

    fn find_bucket(&self, id: ConfigId, bucket: usize, pred: impl FnMut(&Node) -> bool) -> Option<usize> {
        self.tables[id.index()].buckets[bucket].find(&self.arena, pred)
    }

    fn find_table(&self, id: ConfigId, mut pred: impl FnMut(&Node) -> bool) -> Option<usize> {
        let table = &self.tables[id.index()];
        if table.len == 0 {
            return None;
        }
        // Oldest match across buckets.
        table
            .buckets
            .iter()
            .filter_map(|b| b.find(&self.arena, &mut pred))
            .min_by_key(|&idx| self.arena[idx].seq)
    }

    /// Move every entry hashed under `id` back to the linear list, merged
    /// by arrival order.
    fn demote(&mut self, id: ConfigId) -> usize {
        let SubQueues {
            arena,
            linear,
            tables,
        } = self;
        let table = &mut tables[id.index()];
        let mut moved: Vec<usize> = Vec::with_capacity(table.len);
        for bucket in table.buckets.iter_mut() {
            moved.extend(bucket.take_all(arena));
        }
        table.len = 0;
        moved.sort_unstable_by_key(|&idx| arena[idx].seq);

        let mut cursor = linear.front();
        for &idx in &moved {
            let seq = arena[idx].seq;
            while let Some(c) = cursor {
                if arena[c].seq > seq {
                    break;
                }
                cursor = arena[c].links.next();
            }
            linear.insert_before(arena, cursor, idx);
            arena[idx].home = Home::Linear;
        }
        moved.len()
    }

    /// Move linear entries selected by `filter` into the buckets of `id`,
    /// keeping their relative order.
    fn promote(
        &mut self,
        id: ConfigId,
        class: &PatternClass,
        num_buckets: usize,
        filter: impl Fn(&MatchEntry) -> bool,
    ) -> usize {
        let SubQueues {
            arena,
            linear,
            tables,
        } = self;
        let selected: Vec<usize> = linear
            .iter(arena)
            .filter(|&idx| filter(&arena[idx].entry))
            .collect();
        let table = &mut tables[id.index()];
        for &idx in &selected {
            linear.unlink(arena, idx);
            let bucket = arena[idx].entry.bucket_under(class, num_buckets);
            arena[idx].home = Home::Hashed { config: id, bucket };
            table.buckets[bucket].push_back(arena, idx);
            table.len += 1;
        }
        selected.len()
    }

    /// Remove everything, oldest first.
    fn drain(&mut self) -> Vec<MatchEntry> {
        let mut nodes: Vec<Node> = self.arena.drain().collect();
        nodes.sort_unstable_by_key(|n| n.seq);
        self.linear = ListHead::new();
        for table in &mut self.tables {
            table.buckets.fill(ListHead::new());
            table.len = 0;
        }
        nodes.into_iter().map(|n| n.entry).collect()
    }
}

/// Depths of one hash config's subqueues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigStats {
    pub id: ConfigId,
    pub class: PatternClass,
    pub activity: u32,
    /// Decayed observation count of the class.
    pub frequency: u32,
    pub posted: usize,
    pub unexpected: usize,
}

/// Read-only snapshot of a match queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub posted_depth: usize,
    pub unexpected_depth: usize,
    pub posted_linear: usize,
    pub unexpected_linear: usize,
    pub configs: Vec<ConfigStats>,
}

/// Posted-receive and unexpected-message queues of one context.
pub struct MatchQueue {
    configs: HashConfigTable,
    posted: SubQueues,
    unexpected: SubQueues,
    posted_class_depth: HashMap<PatternClass, usize>,
    anchor: Option<ConfigId>,
    num_buckets: usize,
    next_seq: u64,
}

impl MatchQueue {
    pub fn new(config: &MatchConfig) -> Self {
        let configs = HashConfigTable::new(config);
        let n = configs.capacity();
        Self {
            configs,
            posted: SubQueues::new(n, config.num_hash_buckets),
            unexpected: SubQueues::new(n, config.num_hash_buckets),
            posted_class_depth: HashMap::new(),
            anchor: None,
            num_buckets: config.num_hash_buckets,
            next_seq: 0,
        }
    }

    #[inline]
    pub fn posted_depth(&self) -> usize {
        self.posted.depth()
    }

    #[inline]
    pub fn unexpected_depth(&self) -> usize {
        self.unexpected.depth()
    }

    /// Posted receives currently queued for `class`.
    pub fn class_depth(&self, class: &PatternClass) -> usize {
        self.posted_class_depth.get(class).copied().unwrap_or(0)
    }

    /// Config bound to `class`, if any.
    pub fn config_for(&self, class: &PatternClass) -> Option<ConfigId> {
        self.configs.lookup(class)
    }

    /// Live hash configs in slot order.
    pub fn live_configs(&self) -> impl Iterator<Item = (ConfigId, &HashConfig)> {
        self.configs.live()
    }

    /// Match `recv` against the unexpected queue, or queue it.
    pub fn post_receive(&mut self, recv: PostedRecv) -> Option<Pairing> {
        let class = recv.class();
        let depth = self.class_depth(&class) + 1;
        self.learn(class, depth);

        if let Some(msg) = self.take_unexpected(recv.tag, recv.selector, recv.source) {
            recv.completer.mark_matched();
            self.maybe_release(&class);
            return Some(Pairing { recv, msg });
        }

        let home = match self.configs.lookup(&class) {
            Some(config) => Home::Hashed {
                config,
                bucket: class.bucket(recv.tag, recv.source, self.num_buckets),
            },
            None => Home::Linear,
        };
        let seq = self.bump_seq();
        self.posted.push(MatchEntry::Posted(recv), seq, home);
        *self.posted_class_depth.entry(class).or_insert(0) += 1;
        None
    }

    /// Match an arrived message against posted receives, or queue it as
    /// unexpected.
    pub fn message_arrived(&mut self, msg: UnexpectedMsg) -> Option<Pairing> {
        let (tag, sender) = (msg.header.tag, msg.header.sender);
        if let Some(idx) = self.find_posted(tag, sender) {
            let recv = match self.posted.remove(idx) {
                MatchEntry::Posted(r) => r,
                MatchEntry::Unexpected(_) => {
                    fatal(Error::QueueCorrupted("unexpected entry on posted queue"))
                }
            };
            let class = recv.class();
            self.dec_class_depth(&class);
            self.maybe_release(&class);
            recv.completer.mark_matched();
            return Some(Pairing { recv, msg });
        }

        let home = match self.anchor.and_then(|id| self.configs.get(id).map(|c| (id, c.class))) {
            Some((config, class)) => Home::Hashed {
                config,
                bucket: class.bucket(tag, Some(sender), self.num_buckets),
            },
            None => Home::Linear,
        };
        let seq = self.bump_seq();
        self.unexpected.push(MatchEntry::Unexpected(msg), seq, home);
        None
    }

    /// Search the unexpected queue for a message matching the predicate,
    /// unlinking it if `flags` contains `REMOVE_ENTRY`.
    pub fn search_unexpected(
        &mut self,
        tag: Tag,
        selector: Selector,
        source: Option<PeerId>,
        flags: MatchFlags,
    ) -> Option<Hit<'_>> {
        if flags.contains(MatchFlags::REMOVE_ENTRY) {
            return self.take_unexpected(tag, selector, source).map(Hit::Removed);
        }
        let idx = self.find_unexpected(tag, selector, source)?;
        match &self.unexpected.arena[idx].entry {
            MatchEntry::Unexpected(m) => Some(Hit::Peeked(m)),
            MatchEntry::Posted(_) => fatal(Error::QueueCorrupted("posted entry on unexpected queue")),
        }
    }

    fn take_unexpected(
        &mut self,
        tag: Tag,
        selector: Selector,
        source: Option<PeerId>,
    ) -> Option<UnexpectedMsg> {
        let idx = self.find_unexpected(tag, selector, source)?;
        if let Home::Hashed { config, .. } = self.unexpected.arena[idx].home {
            self.configs.touch(config);
        }
        match self.unexpected.remove(idx) {
            MatchEntry::Unexpected(m) => Some(m),
            MatchEntry::Posted(_) => fatal(Error::QueueCorrupted("posted entry on unexpected queue")),
        }
    }

    /// Remove every entry. Posted receives are returned oldest first;
    /// unexpected messages are discarded.
    pub fn drain(&mut self) -> Vec<PostedRecv> {
        self.unexpected.drain();
        self.posted_class_depth.clear();
        self.posted
            .drain()
            .into_iter()
            .map(|e| match e {
                MatchEntry::Posted(r) => r,
                MatchEntry::Unexpected(_) => {
                    fatal(Error::QueueCorrupted("unexpected entry on posted queue"))
                }
            })
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            posted_depth: self.posted.depth(),
            unexpected_depth: self.unexpected.depth(),
            posted_linear: self.posted.linear.len(),
            unexpected_linear: self.unexpected.linear.len(),
            configs: self
                .configs
                .live()
                .map(|(id, c)| ConfigStats {
                    id,
                    class: c.class,
                    activity: c.activity,
                    frequency: self.configs.frequency(&c.class),
                    posted: self.posted.table_len(id),
                    unexpected: self.unexpected.table_len(id),
                })
                .collect(),
        }
    }

    #[inline]
    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn find_posted(&mut self, tag: Tag, sender: PeerId) -> Option<usize> {
        let nb = self.num_buckets;
        let mut hit = None;
        for (id, cfg) in self.configs.live() {
            if self.posted.table_len(id) == 0 {
                continue;
            }
            let bucket = cfg.class.bucket(tag, Some(sender), nb);
            if let Some(idx) = self.posted.find_bucket(id, bucket, |n| posted_accepts(n, tag, sender)) {
                hit = Some((idx, id));
                break;
            }
        }
        if let Some((idx, id)) = hit {
            self.configs.touch(id);
            return Some(idx);
        }
        self.posted.find_linear(|n| posted_accepts(n, tag, sender))
    }

    fn find_unexpected(&self, tag: Tag, selector: Selector, source: Option<PeerId>) -> Option<usize> {
        let pred = |n: &Node| match &n.entry {
            MatchEntry::Unexpected(m) => {
                tag_matches(tag, selector, source, m.header.tag, m.header.sender)
            }
            MatchEntry::Posted(_) => false,
        };
        if let Some(id) = self.anchor
            && self.unexpected.table_len(id) > 0
            && let Some(cfg) = self.configs.get(id)
        {
            let class = PatternClass::of(selector, source);
            let found = if class.covers(&cfg.class) {
                let bucket = cfg.class.bucket(tag, source, self.num_buckets);
                self.unexpected.find_bucket(id, bucket, pred)
            } else {
                self.unexpected.find_table(id, pred)
            };
            if found.is_some() {
                return found;
            }
        }
        self.unexpected.find_linear(pred)
    }

    fn learn(&mut self, class: PatternClass, depth: usize) {
        match self.configs.observe(class, depth) {
            Ok(Observation::Linear) | Ok(Observation::Hit(_)) => {}
            Ok(Observation::Assigned(id)) => {
                self.bind(id, class);
                self.reanchor();
            }
            Ok(Observation::Reassigned { id, evicted }) => {
                let moved = self.posted.demote(id);
                trace!(config = id.0, ?evicted, moved, "evicted class back to linear");
                if self.anchor == Some(id) {
                    self.unexpected.demote(id);
                    self.anchor = None;
                }
                self.bind(id, class);
                self.reanchor();
            }
            Err(Error::CapacityExceeded { class }) => {
                trace!(?class, depth, "no hash config available");
            }
            Err(e) => fatal(e),
        }
    }

    fn bind(&mut self, id: ConfigId, class: PatternClass) {
        let moved = self
            .posted
            .promote(id, &class, self.num_buckets, |e| match e {
                MatchEntry::Posted(r) => r.class() == class,
                MatchEntry::Unexpected(_) => false,
            });
        trace!(config = id.0, ?class, moved, "posted receives hashed");
    }

    /// Keep unexpected messages hashed under the lowest live config.
    fn reanchor(&mut self) {
        let desired = self.configs.live().map(|(id, _)| id).next();
        if desired == self.anchor {
            return;
        }
        if let Some(old) = self.anchor.take() {
            self.unexpected.demote(old);
        }
        if let Some(id) = desired
            && let Some(class) = self.configs.get(id).map(|c| c.class)
        {
            self.unexpected.promote(id, &class, self.num_buckets, |_| true);
        }
        self.anchor = desired;
    }

    fn dec_class_depth(&mut self, class: &PatternClass) {
        match self.posted_class_depth.get_mut(class) {
            Some(d) if *d > 1 => *d -= 1,
            Some(_) => {
                self.posted_class_depth.remove(class);
            }
            None => fatal(Error::QueueCorrupted("class depth underflow")),
        }
    }

    /// Give up the config of `class` once nothing is queued under it.
    fn maybe_release(&mut self, class: &PatternClass) {
        let Some(id) = self.configs.lookup(class) else {
            return;
        };
        if self.class_depth(class) > 0 {
            return;
        }
        if self.anchor == Some(id) && self.unexpected.depth() > 0 {
            return;
        }
        self.posted.demote(id);
        if self.anchor == Some(id) {
            self.unexpected.demote(id);
            self.anchor = None;
        }
        self.configs.release(id);
        tracing::debug!(config = id.0, ?class, "hash config released");
        self.reanchor();
    }
}

#[inline]
fn posted_accepts(n: &Node, tag: Tag, sender: PeerId) -> bool {
    match &n.entry {
        MatchEntry::Posted(r) => r.accepts(tag, sender),
        MatchEntry::Unexpected(_) => false,
    }
}

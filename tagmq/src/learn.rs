//! Selector learning engine.
//!
//! Middleware differ in how they use tag bits and source constraints. Rather
//! than hard-coding which pattern classes get a hash subqueue, the engine
//! counts how often each class is posted and hands one of a small number of
//! hash configs to any class whose queue depth crosses the threshold.
//!
//! When every config is taken, the config with the lowest decayed activity
//! is given up to the newcomer, provided the newcomer has been seen more
//! often than that config has been used recently. Otherwise the newcomer
//! stays on the linear list and `CapacityExceeded` is reported.
//!
//! With learning disabled only the three canonical classes
//! ([`PatternClass::TAG_SRC`], [`PatternClass::TAG_ANYSRC`],
//! [`PatternClass::ANYTAG_SRC`]) are ever hashed, each in its own fixed slot.

use std::collections::HashMap;

use tracing::debug;

use crate::config::{LEARN_DECAY_PERIOD, MatchConfig};
use crate::error::{Error, Result};
use crate::tag::PatternClass;

const CANONICAL: [PatternClass; 3] = [
    PatternClass::TAG_SRC,
    PatternClass::TAG_ANYSRC,
    PatternClass::ANYTAG_SRC,
];

/// Small integer naming a hash config slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigId(pub u8);

impl ConfigId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A live hash config: the class it serves and its decayed activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashConfig {
    pub class: PatternClass,
    pub activity: u32,
}

/// What the queue must do after an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// No config for this class; use the linear list.
    Linear,
    /// The class already has a config.
    Hit(ConfigId),
    /// A free slot was bound to the class.
    Assigned(ConfigId),
    /// A slot was taken from `evicted` and bound to the class.
    Reassigned { id: ConfigId, evicted: PatternClass },
}

/// The per-context table of hash configs.
pub struct HashConfigTable {
    slots: Vec<Option<HashConfig>>,
    by_class: HashMap<PatternClass, ConfigId>,
    /// Decayed observation count per class.
    freq: HashMap<PatternClass, u32>,
    learning: bool,
    thresh: usize,
    observations: u64,
}

impl HashConfigTable {
    pub fn new(config: &MatchConfig) -> Self {
        Self {
            slots: vec![None; config.num_hash_configs()],
            by_class: HashMap::new(),
            freq: HashMap::new(),
            learning: config.learn_hash_selector,
            thresh: config.hash_thresh,
            observations: 0,
        }
    }

    /// Number of config slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently bound to a class.
    pub fn live_count(&self) -> usize {
        self.by_class.len()
    }

    /// Config bound to `class`, if any.
    #[inline]
    pub fn lookup(&self, class: &PatternClass) -> Option<ConfigId> {
        self.by_class.get(class).copied()
    }

    #[inline]
    pub fn get(&self, id: ConfigId) -> Option<&HashConfig> {
        self.slots.get(id.index()).and_then(|s| s.as_ref())
    }

    /// Live configs in slot order.
    pub fn live(&self) -> impl Iterator<Item = (ConfigId, &HashConfig)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|c| (ConfigId(i as u8), c)))
    }

    /// Decayed observation count of a class.
    pub fn frequency(&self, class: &PatternClass) -> u32 {
        self.freq.get(class).copied().unwrap_or(0)
    }

    /// Record one insertion attempt of `class` while the queue holds `depth`
    /// entries for it, and decide whether the class gets a config.
    pub fn observe(&mut self, class: PatternClass, depth: usize) -> Result<Observation> {
        self.observations += 1;
        if self.observations % LEARN_DECAY_PERIOD == 0 {
            self.decay();
        }

        let freq = {
            let f = self.freq.entry(class).or_insert(0);
            *f = f.saturating_add(1);
            *f
        };

        if let Some(id) = self.lookup(&class) {
            self.touch(id);
            return Ok(Observation::Hit(id));
        }
        if !class.is_hashable() || depth <= self.thresh {
            return Ok(Observation::Linear);
        }

        if !self.learning {
            let Some(slot) = CANONICAL.iter().position(|c| *c == class) else {
                return Ok(Observation::Linear);
            };
            let id = ConfigId(slot as u8);
            self.bind(id, class);
            return Ok(Observation::Assigned(id));
        }

        if let Some(slot) = self.slots.iter().position(Option::is_none) {
            let id = ConfigId(slot as u8);
            self.bind(id, class);
            return Ok(Observation::Assigned(id));
        }

        let (victim, victim_activity) = self
            .live()
            .min_by(|(ia, a), (ib, b)| a.activity.cmp(&b.activity).then(ia.cmp(ib)))
            .map(|(id, c)| (id, c.activity))
            .ok_or(Error::CapacityExceeded { class })?;
        if freq <= victim_activity {
            return Err(Error::CapacityExceeded { class });
        }
        let evicted = self
            .release(victim)
            .map(|c| c.class)
            .ok_or(Error::CapacityExceeded { class })?;
        self.bind(victim, class);
        debug!(
            config = victim.0,
            ?evicted,
            ?class,
            victim_activity,
            freq,
            "hash config reassigned"
        );
        Ok(Observation::Reassigned {
            id: victim,
            evicted,
        })
    }

    /// Credit a config with one unit of activity.
    #[inline]
    pub fn touch(&mut self, id: ConfigId) {
        if let Some(Some(c)) = self.slots.get_mut(id.index()) {
            c.activity = c.activity.saturating_add(1);
        }
    }

    /// Unbind a slot, returning what it held.
    pub fn release(&mut self, id: ConfigId) -> Option<HashConfig> {
        let old = self.slots.get_mut(id.index())?.take()?;
        self.by_class.remove(&old.class);
        Some(old)
    }

    fn bind(&mut self, id: ConfigId, class: PatternClass) {
        self.slots[id.index()] = Some(HashConfig { class, activity: 1 });
        self.by_class.insert(class, id);
        debug!(config = id.0, ?class, "hash config assigned");
    }

    fn decay(&mut self) {
        for c in self.slots.iter_mut().flatten() {
            c.activity >>= 1;
        }
        let by_class = &self.by_class;
        self.freq.retain(|class, f| {
            *f >>= 1;
            *f > 0 || by_class.contains_key(class)
        });
    }
}

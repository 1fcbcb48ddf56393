//! Bounded cache of Paxos machines.
//!
//! The cache owns every [`Machine`]; tasks hold `Rc` clones and pins. A
//! machine comes into existence the first time its synod is touched
//! ([`MachineCache::force_get`]) and leaves when the cache shrinks past it.
//!
//! Eviction never touches a machine that is pinned, locked by a proposer,
//! or at/after the executor's cursor — those are exactly the machines some
//! task may be in the middle of a multi-suspension round on.

use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::machine::Machine;
use crate::synode::Synode;

/// Bounded LRU cache of Paxos machines, keyed by synod.
pub struct MachineCache {
    machines: HashMap<Synode, Rc<Machine>>,
    stamp: u64,
    size: u64,
    limit: u64,
    /// Highest message number ever evicted; anything at or below it may
    /// have been forgotten.
    forgotten_below: u64,
}

impl MachineCache {
    /// Create a cache with a payload-byte limit.
    pub fn new(limit: u64) -> Self {
        Self {
            machines: HashMap::new(),
            stamp: 0,
            size: 0,
            limit,
            forgotten_below: 0,
        }
    }

    fn touch(&mut self, machine: &Rc<Machine>) {
        self.stamp += 1;
        machine.lru.set(self.stamp);
    }

    /// Look up a machine, refreshing its LRU position.
    pub fn get(&mut self, synode: Synode) -> Option<Rc<Machine>> {
        let machine = self.machines.get(&synode).cloned()?;
        self.touch(&machine);
        Some(machine)
    }

    /// Look up without refreshing. Used when pushing recovery logs, where
    /// touching would churn the LRU order.
    pub fn get_no_touch(&self, synode: Synode) -> Option<Rc<Machine>> {
        self.machines.get(&synode).cloned()
    }

    /// Look up or materialize the machine for a synod.
    pub fn force_get(&mut self, synode: Synode) -> Rc<Machine> {
        if let Some(machine) = self.get(synode) {
            return machine;
        }
        let machine = Rc::new(Machine::new(synode));
        self.touch(&machine);
        self.machines.insert(synode, machine.clone());
        machine
    }

    /// Whether a machine currently exists for the synod.
    pub fn is_cached(&self, synode: Synode) -> bool {
        self.machines.contains_key(&synode)
    }

    /// Whether the synod may have been evicted in the past. Used to decide
    /// between "machine not yet created" and "machine long gone" when a
    /// lagging peer asks about an old synod.
    pub fn was_removed(&self, synode: Synode) -> bool {
        synode.msgno <= self.forgotten_below && !self.is_cached(synode)
    }

    /// Account the payload bytes of a machine's learned value.
    pub fn add_size(&mut self, machine: &Machine, bytes: u64) {
        machine.size.set(machine.size.get() + bytes);
        self.size += bytes;
    }

    /// Accounted payload bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of cached machines.
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    /// Whether the cache holds no machines.
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Change the size limit.
    pub fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }

    /// Whether the accounted bytes exceed the limit.
    pub fn over_limit(&self) -> bool {
        self.size > self.limit
    }

    /// Shrink towards the limit by evicting old, finished, unpinned
    /// machines strictly before `protect_from` (the executor's cursor),
    /// least recently used first.
    ///
    /// Returns `false` when the cache is over the limit and nothing was
    /// evictable — the fatal "cache exhausted" condition.
    pub fn shrink(&mut self, protect_from: Synode) -> bool {
        while self.size > self.limit {
            let victim = self
                .machines
                .values()
                .filter(|m| {
                    !m.pinned()
                        && m.synode.before(&protect_from)
                        && !m.state().locked
                        && m.state().finished()
                })
                .min_by_key(|m| m.lru.get())
                .map(|m| m.synode);

            match victim {
                Some(synode) => self.evict(synode),
                None => return false,
            }
        }
        true
    }

    fn evict(&mut self, synode: Synode) {
        if let Some(machine) = self.machines.remove(&synode) {
            self.size = self.size.saturating_sub(machine.size.get());
            self.forgotten_below = self.forgotten_below.max(synode.msgno);
            debug!(synode = %synode, "evicted machine from cache");
        }
    }

    /// Forget everything. Used on lifecycle terminate.
    pub fn clear(&mut self) {
        self.machines.clear();
        self.size = 0;
        self.forgotten_below = 0;
    }
}

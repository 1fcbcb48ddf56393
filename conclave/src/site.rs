//! Configurations ("sites") and their history.
//!
//! A [`Site`] is one installed configuration: the member list, the event
//! horizon, the group protocol version, plus the per-member runtime state
//! (detection timestamps, peer handles). Sites are immutable after install;
//! membership changes clone the active site, mutate the clone and install
//! it with a *future* start synod, so every member switches configurations
//! at exactly the same point in the total order.
//!
//! The [`SiteHistory`] keeps installed sites newest-first, so resolving a
//! synod to its governing configuration is a scan for the first site whose
//! `start` is not after the synod.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use conclave_core::NetworkAddress;

use crate::msg::{Member, ProtoVersion};
use crate::peer::Peer;
use crate::synode::Synode;

/// Smallest allowed event horizon, and the default.
pub const EVENT_HORIZON_MIN: u32 = 10;

/// Largest allowed event horizon.
pub const EVENT_HORIZON_MAX: u32 = 200;

/// One installed configuration.
pub struct Site {
    /// First synod this configuration governs.
    pub start: Synode,

    /// The synod the configuration command was decided at. The start is
    /// derived from it by adding the activation delay.
    pub boot_key: Synode,

    /// The member list. Node indices into every other per-member vector
    /// are indices into this list.
    pub nodes: Vec<Member>,

    /// Event horizon of this configuration.
    pub event_horizon: u32,

    /// Protocol version common to the whole group.
    pub x_proto: ProtoVersion,

    /// This process's index in `nodes`, if it is a member.
    pub nodeno: Option<u16>,

    /// Liveness view: which members the detector currently believes in.
    /// Delivered to the application as view messages.
    pub global_node_set: RefCell<Vec<bool>>,

    /// Per-member last-heard timestamps maintained by the detector.
    pub detected: RefCell<Vec<Duration>>,

    /// Per-member delivered cursors, gossiped on every message.
    pub delivered_by: RefCell<Vec<Synode>>,

    /// Outbound peer handles, index-aligned with `nodes`.
    pub servers: RefCell<Vec<Rc<Peer>>>,

    /// Largest observed round-trip to any member, seconds. Seeds the
    /// proposer's wakeup backoff.
    pub max_rtt: Cell<f64>,
}

impl Site {
    /// Build a site over a member list, resolving our own index by
    /// address.
    pub fn new(
        nodes: Vec<Member>,
        event_horizon: u32,
        x_proto: ProtoVersion,
        self_addr: &NetworkAddress,
    ) -> Self {
        let nodeno = nodes
            .iter()
            .position(|m| m.address == *self_addr)
            .map(|i| i as u16);
        let n = nodes.len();
        Self {
            start: Synode::default(),
            boot_key: Synode::default(),
            nodes,
            event_horizon,
            x_proto,
            nodeno,
            global_node_set: RefCell::new(vec![true; n]),
            detected: RefCell::new(vec![Duration::ZERO; n]),
            delivered_by: RefCell::new(vec![Synode::default(); n]),
            servers: RefCell::new(Vec::new()),
            max_rtt: Cell::new(0.0),
        }
    }

    /// Clone for mutation during a reconfiguration. Runtime state
    /// (detection, peers) is re-derived on install, not copied.
    pub fn clone_for_reconfig(&self, self_addr: &NetworkAddress) -> Site {
        let mut site = Site::new(
            self.nodes.clone(),
            self.event_horizon,
            self.x_proto,
            self_addr,
        );
        site.start = self.start;
        site.boot_key = self.boot_key;
        site
    }

    /// Number of members.
    pub fn max_nodes(&self) -> u16 {
        self.nodes.len() as u16
    }

    /// Whether this process is a member of the site.
    pub fn is_member(&self) -> bool {
        self.nodeno.is_some()
    }

    /// Whether the site has no members at all.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Find a member's index by address.
    pub fn find_node(&self, address: &NetworkAddress) -> Option<u16> {
        self.nodes
            .iter()
            .position(|m| m.address == *address)
            .map(|i| i as u16)
    }

    /// Whether a member with the same address exists.
    pub fn has_address(&self, member: &Member) -> bool {
        self.nodes.iter().any(|m| m.address == member.address)
    }

    /// Whether the exact incarnation (same UID) exists.
    pub fn has_uid(&self, member: &Member) -> bool {
        self.nodes.iter().any(|m| m.uid == member.uid)
    }

    /// The peer handle for a member, if the index is in range.
    pub fn server(&self, node: u16) -> Option<Rc<Peer>> {
        self.servers.borrow().get(node as usize).cloned()
    }

    /// Resize per-member runtime vectors after install.
    pub fn reset_runtime_state(&self) {
        let n = self.nodes.len();
        *self.global_node_set.borrow_mut() = vec![true; n];
        *self.detected.borrow_mut() = vec![Duration::ZERO; n];
        *self.delivered_by.borrow_mut() = vec![Synode::default(); n];
    }

    /// The activation point of a configuration decided at `boot_key`:
    /// `boot_key.msgno + event_horizon + 1`, first slot of that message
    /// number.
    pub fn activation_point(boot_key: Synode, event_horizon: u32) -> Synode {
        Synode::new(
            boot_key.group_id,
            boot_key.msgno + event_horizon as u64 + 1,
            0,
        )
    }
}

impl std::fmt::Debug for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Site")
            .field("start", &self.start)
            .field("boot_key", &self.boot_key)
            .field("nodes", &self.nodes.len())
            .field("event_horizon", &self.event_horizon)
            .field("nodeno", &self.nodeno)
            .finish()
    }
}

/// Installed configurations, newest first.
#[derive(Default)]
pub struct SiteHistory {
    sites: Vec<Rc<Site>>,
}

impl SiteHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a configuration. Sites arrive in increasing start order;
    /// the newest goes to the front.
    pub fn install(&mut self, site: Rc<Site>) {
        self.sites.insert(0, site);
    }

    /// The newest configuration, installed or pending.
    pub fn latest(&self) -> Option<Rc<Site>> {
        self.sites.first().cloned()
    }

    /// The configuration governing a synod: the latest site of the same
    /// group whose start is at or before it.
    pub fn find(&self, synode: Synode) -> Option<Rc<Site>> {
        self.sites
            .iter()
            .find(|s| s.start.group_id == synode.group_id && !s.start.after(&synode))
            .cloned()
    }

    /// Whether the given site is the newest one.
    pub fn is_latest(&self, site: &Rc<Site>) -> bool {
        self.latest().is_some_and(|l| Rc::ptr_eq(&l, site))
    }

    /// All sites, newest first.
    pub fn all(&self) -> &[Rc<Site>] {
        &self.sites
    }

    /// The earliest pending configuration (start after the active one's
    /// governing range) that changes the event horizon, if any. Drives
    /// the conservative horizon threshold while a shrink is in flight.
    pub fn first_horizon_reconfig(&self, active: &Rc<Site>) -> Option<Rc<Site>> {
        // Pending sites are in front of the active one; walk them from
        // oldest pending to newest.
        self.sites
            .iter()
            .take_while(|s| !Rc::ptr_eq(s, active))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .find(|s| s.event_horizon != active.event_horizon)
            .cloned()
    }

    /// The newest configuration that changed the event horizon relative
    /// to its predecessor. Governs where a pending config's activation
    /// delay is measured from.
    pub fn latest_horizon_reconfig(&self, active: &Rc<Site>) -> Option<Rc<Site>> {
        let mut previous_h = active.event_horizon;
        let mut found = None;
        for site in self
            .sites
            .iter()
            .take_while(|s| !Rc::ptr_eq(s, active))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
        {
            if site.event_horizon != previous_h {
                previous_h = site.event_horizon;
                found = Some(site.clone());
            }
        }
        found
    }

    /// Swap the newest configuration for an adjusted copy. Used when the
    /// executor inflates the start of an empty final configuration.
    pub fn replace_latest(&mut self, site: Rc<Site>) {
        if !self.sites.is_empty() {
            self.sites[0] = site;
        } else {
            self.sites.push(site);
        }
    }

    /// Drop configurations that can no longer govern anything: every site
    /// older than the newest one at or before `delivered`.
    pub fn garbage_collect(&mut self, delivered: Synode) {
        if let Some(pos) = self.sites.iter().position(|s| !s.start.after(&delivered)) {
            self.sites.truncate(pos + 1);
        }
    }

    /// Forget everything. Used on lifecycle terminate.
    pub fn clear(&mut self) {
        self.sites.clear();
    }
}

/// Ring of recently retired group ids. Messages from a buried group are
/// zombie traffic and get ignored.
#[derive(Debug, Default)]
pub struct DeadSiteRing {
    ids: [u32; Self::LEN],
    next: usize,
}

impl DeadSiteRing {
    const LEN: usize = 10;

    /// Retire a group id.
    pub fn bury(&mut self, group_id: u32) {
        if group_id == 0 {
            return;
        }
        self.ids[self.next] = group_id;
        self.next = (self.next + 1) % Self::LEN;
    }

    /// Whether a group id has been retired recently.
    pub fn is_dead(&self, group_id: u32) -> bool {
        group_id != 0 && self.ids.contains(&group_id)
    }
}

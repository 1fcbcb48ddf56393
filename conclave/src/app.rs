//! Application collaborator contract.
//!
//! The engine orders messages; the application consumes them. Everything
//! the embedder must provide is behind [`Application`]: delivery of decided
//! payloads in synod order, view change notifications, and snapshot
//! production/consumption for joiner catch-up.

use crate::msg::AppData;
use crate::site::Site;
use crate::synode::Synode;

/// Whether a payload reached its decided slot or was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Delivered in order at its synod.
    Ok,
    /// The engine could not place the payload (no site, shutdown).
    Failure,
}

/// What the embedding application must provide.
///
/// `deliver` calls arrive in strict synod order; every live member sees
/// the same sequence. The snapshot pair is the joiner catch-up path: one
/// member exports, the recovering member installs.
pub trait Application {
    /// A decided payload, in order. `site` is the configuration governing
    /// the synod, absent when the payload failed before placement.
    fn deliver(&self, site: Option<&Site>, data: &AppData, status: DeliveryStatus);

    /// A new membership view took effect at `synode`.
    fn deliver_view(&self, site: &Site, synode: Synode);

    /// Export the application's own snapshot and the synod it covers up
    /// to (null synode when unknown).
    fn app_snapshot(&self) -> (Vec<u8>, Synode);

    /// Install a peer's application snapshot covering `(.., log_start]`;
    /// decided values in `(log_start, log_end]` will follow as ordinary
    /// deliveries.
    fn handle_app_snapshot(&self, blob: &[u8], log_start: Synode, log_end: Synode);
}

/// An application that ignores everything. Useful for tests of the
/// protocol plumbing and as a default.
#[derive(Debug, Default)]
pub struct NullApplication;

impl Application for NullApplication {
    fn deliver(&self, _site: Option<&Site>, _data: &AppData, _status: DeliveryStatus) {}

    fn deliver_view(&self, _site: &Site, _synode: Synode) {}

    fn app_snapshot(&self) -> (Vec<u8>, Synode) {
        (Vec::new(), crate::synode::NULL_SYNODE)
    }

    fn handle_app_snapshot(&self, _blob: &[u8], _log_start: Synode, _log_end: Synode) {}
}

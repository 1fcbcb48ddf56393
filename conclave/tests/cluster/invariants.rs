//! Safety checks applied across a whole cluster.

use conclave::msg::Cargo;
use conclave::synode::Synode;

use crate::harness::Cluster;

/// Agreement: any synod decided at two members carries the same value.
pub fn assert_agreement(cluster: &Cluster) {
    let mut decided: std::collections::HashMap<Synode, Vec<u8>> =
        std::collections::HashMap::new();

    for (i, engine) in cluster.engines.iter().enumerate() {
        let cache = engine.cache.borrow();
        // Walk the delivered range; undecided or evicted synods are fine.
        let mut synode = Synode::new(
            engine.delivered.get().group_id,
            1,
            0,
        );
        let end = engine.delivered.get();
        let max_nodes = engine.site().map(|s| s.max_nodes()).unwrap_or(1).max(1);
        while synode.before(&end) {
            if let Some(machine) = cache.get_no_touch(synode) {
                let st = machine.state();
                if let Some(learned) = &st.learner.msg {
                    let value = fingerprint(learned.payloads.iter().map(|a| &a.cargo));
                    match decided.get(&synode) {
                        None => {
                            decided.insert(synode, value);
                        }
                        Some(existing) => {
                            assert_eq!(
                                *existing, value,
                                "AGREEMENT VIOLATION: node {i} learned a different \
                                 value for {synode}"
                            );
                        }
                    }
                }
            }
            synode = synode.incr(max_nodes);
        }
    }
}

fn fingerprint<'a>(cargos: impl Iterator<Item = &'a Cargo>) -> Vec<u8> {
    let mut out = Vec::new();
    for cargo in cargos {
        match cargo {
            Cargo::App(bytes) => {
                out.push(1);
                out.extend_from_slice(bytes);
            }
            other => {
                out.push(2);
                out.extend_from_slice(format!("{other:?}").as_bytes());
            }
        }
    }
    out
}

/// Order: every member's delivered sequence is a prefix of the longest
/// one.
pub fn assert_prefix_order(cluster: &Cluster) {
    let sequences: Vec<Vec<Vec<u8>>> = cluster
        .apps
        .iter()
        .take(cluster.members.len())
        .map(|app| app.delivered.borrow().clone())
        .collect();
    let longest = sequences
        .iter()
        .max_by_key(|s| s.len())
        .cloned()
        .unwrap_or_default();
    for (i, seq) in sequences.iter().enumerate() {
        assert!(
            longest.starts_with(seq),
            "ORDER VIOLATION: node {i} delivered {seq:?}, which is not a \
             prefix of {longest:?}"
        );
    }
}

/// Validity: everything delivered was previously submitted.
pub fn assert_validity(cluster: &Cluster, submitted: &[&[u8]]) {
    for (i, app) in cluster.apps.iter().enumerate() {
        for delivered in app.delivered.borrow().iter() {
            assert!(
                submitted.iter().any(|s| s == &delivered.as_slice()),
                "VALIDITY VIOLATION: node {i} delivered {delivered:?}, \
                 which nobody submitted"
            );
        }
    }
}

use std::collections::{BTreeMap, BTreeSet};

use crate::state::{CacheState, CacheStatus, CrStates, DeliveryServiceState, PeerStates};
use crate::topology::Topology;

/// Build the local availability view from the latest status of every
/// configured cache. A delivery service is available when any of its caches
/// is; its disabled locations are the cachegroups with no available cache.
pub fn local_states(topology: &Topology, statuses: &BTreeMap<String, CacheStatus>) -> CrStates {
    let available = |id: &str| statuses.get(id).is_some_and(|s| s.availability.available);

    let caches = topology
        .servers
        .keys()
        .map(|id| {
            (
                id.clone(),
                CacheState {
                    is_available: available(id),
                },
            )
        })
        .collect();

    let delivery_services = topology
        .delivery_service_servers()
        .into_iter()
        .map(|(ds, servers)| {
            let mut cachegroups: BTreeMap<&str, bool> = BTreeMap::new();
            for id in &servers {
                let Some(server) = topology.servers.get(id) else {
                    continue;
                };
                *cachegroups.entry(server.cachegroup.as_str()).or_default() |= available(id);
            }

            let state = DeliveryServiceState {
                is_available: cachegroups.values().any(|up| *up),
                disabled_locations: cachegroups
                    .iter()
                    .filter(|(_, up)| !**up)
                    .map(|(cg, _)| cg.to_string())
                    .collect(),
            };
            (ds, state)
        })
        .collect();

    CrStates {
        caches,
        delivery_services,
    }
}

/// Combine the local view with every reachable peer's view. Recomputed from
/// scratch on every call.
pub fn combine(local: &CrStates, peers: &PeerStates, optimistic: bool) -> CrStates {
    if !optimistic {
        return local.clone();
    }

    let caches = local
        .caches
        .iter()
        .map(|(id, state)| {
            let is_available = combine_cache(id, state.is_available, peers);
            (id.clone(), CacheState { is_available })
        })
        .collect();

    let delivery_services = local
        .delivery_services
        .iter()
        .map(|(ds, state)| (ds.clone(), combine_delivery_service(ds, state, peers)))
        .collect();

    CrStates {
        caches,
        delivery_services,
    }
}

/// A cache is up if the local view says so, or if any reachable peer does.
/// Marking it down takes a unanimous down vote from the local view and every
/// reachable peer. Peers are consulted in id order and the first up vote
/// wins.
pub fn combine_cache(id: &str, local_available: bool, peers: &PeerStates) -> bool {
    local_available
        || peers
            .values()
            .filter(|p| p.available)
            .any(|p| p.states.is_cache_available(id))
}

fn combine_delivery_service(
    ds: &str,
    local: &DeliveryServiceState,
    peers: &PeerStates,
) -> DeliveryServiceState {
    let mut combined = DeliveryServiceState {
        is_available: local.is_available,
        disabled_locations: sorted(&local.disabled_locations),
    };

    for peer in peers.values().filter(|p| p.available) {
        let Some(theirs) = peer.states.delivery_services.get(ds) else {
            continue;
        };
        combined.is_available |= theirs.is_available;
        combined.disabled_locations =
            intersection(&combined.disabled_locations, &theirs.disabled_locations);
    }

    combined
}

/// Sorted, deduplicated intersection of two location lists.
pub fn intersection(a: &[String], b: &[String]) -> Vec<String> {
    let a = sorted(a);
    let b = sorted(b);

    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    out
}

fn sorted(list: &[String]) -> Vec<String> {
    list.iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

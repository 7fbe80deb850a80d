use std::collections::{BTreeSet, HashMap};

use settld_core::{AgreementDelegation, HashHex};

/// Bottom-up parent order for cascade settlement: starting from a settled
/// child agreement, the ancestors that must settle next, nearest first.
///
/// Pure function of its inputs; output is identical for any permutation of
/// `delegations`. Ties at the same level break lexicographically on the
/// agreement hash.
pub fn cascade_settlement_check(
    delegations: &[AgreementDelegation],
    start_child_hash: &str,
) -> Vec<HashHex> {
    let mut parents_of: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for d in delegations {
        parents_of
            .entry(d.child_agreement_hash.as_str())
            .or_default()
            .insert(d.parent_agreement_hash.as_str());
    }
    walk(&parents_of, start_child_hash)
}

/// Top-down child order for refund unwind: starting from a refunded parent
/// agreement, the descendants whose funds must unwind, nearest first.
pub fn refund_unwind_check(
    delegations: &[AgreementDelegation],
    start_parent_hash: &str,
) -> Vec<HashHex> {
    let mut children_of: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for d in delegations {
        children_of
            .entry(d.parent_agreement_hash.as_str())
            .or_default()
            .insert(d.child_agreement_hash.as_str());
    }
    walk(&children_of, start_parent_hash)
}

/// Breadth-first walk over an adjacency map. Levels are emitted in order and
/// each level is sorted (BTreeSet iteration); a node reached through several
/// paths is emitted once, at its first (nearest) level.
fn walk(adjacency: &HashMap<&str, BTreeSet<&str>>, start: &str) -> Vec<HashHex> {
    let mut out: Vec<HashHex> = Vec::new();
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    seen.insert(start);
    let mut frontier: Vec<&str> = vec![start];

    while !frontier.is_empty() {
        let mut next_level: BTreeSet<&str> = BTreeSet::new();
        for node in &frontier {
            if let Some(neighbors) = adjacency.get(node) {
                for n in neighbors {
                    if seen.insert(n) {
                        next_level.insert(n);
                    }
                }
            }
        }
        out.extend(next_level.iter().map(|s| s.to_string()));
        frontier = next_level.into_iter().collect();
    }
    out
}

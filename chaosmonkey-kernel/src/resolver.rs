//! Target resolution against an inventory snapshot

use crate::errors::ResolutionError;
use crate::models::Target;
use std::collections::{BTreeSet, HashSet};
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Matched targets in inventory order
    pub matched: Vec<Target>,
    pub unmatched: BTreeSet<String>,
}

/// Map requested identifiers to inventory targets by exact identifier equality
///
/// Duplicate identifiers in the inventory keep the first occurrence and log a
/// warning. An empty match is a hard error; a partial match is not.
pub fn resolve(identifiers: &BTreeSet<String>, inventory: &[Target]) -> Result<Resolution, ResolutionError> {
    if identifiers.is_empty() {
        return Err(ResolutionError::NothingRequested);
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut matched = Vec::new();
    for target in inventory {
        if !identifiers.contains(&target.identifier) {
            continue;
        }
        if !seen.insert(target.identifier.as_str()) {
            warn!(
                "duplicate inventory identifier {} ({}), keeping the first match",
                target.identifier, target.display_name
            );
            continue;
        }
        matched.push(target.clone());
    }

    let unmatched: BTreeSet<String> = identifiers.iter().filter(|id| !seen.contains(id.as_str())).cloned().collect();

    if matched.is_empty() {
        return Err(ResolutionError::NoneMatched { requested: identifiers.iter().cloned().collect() });
    }
    if !unmatched.is_empty() {
        warn!("targets not found in inventory: {}", unmatched.iter().cloned().collect::<Vec<_>>().join(", "));
    }
    Ok(Resolution { matched, unmatched })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlatformKind, TargetKind};

    fn ids(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_partial_match() {
        let inventory = vec![Target::new("vm1", TargetKind::Vm), Target::new("vm2", TargetKind::Vm)];
        let resolution = resolve(&ids(&["vm1", "vm9"]), &inventory).unwrap();
        assert_eq!(resolution.matched, vec![Target::new("vm1", TargetKind::Vm)]);
        assert_eq!(resolution.unmatched, ids(&["vm9"]));
    }

    #[test]
    fn test_nothing_matches() {
        let inventory = vec![Target::new("vm1", TargetKind::Vm)];
        let err = resolve(&ids(&["vm8", "vm9"]), &inventory).unwrap_err();
        assert_eq!(err, ResolutionError::NoneMatched { requested: vec!["vm8".into(), "vm9".into()] });
    }

    #[test]
    fn test_empty_request() {
        assert_eq!(resolve(&BTreeSet::new(), &[]), Err(ResolutionError::NothingRequested));
    }

    #[test]
    fn test_duplicates_keep_first_match() {
        let inventory = vec![
            Target::new("node-a", TargetKind::Node).with_hint(PlatformKind::Nomad),
            Target::new("node-a", TargetKind::Vm).with_hint(PlatformKind::Vsphere),
        ];
        let resolution = resolve(&ids(&["node-a"]), &inventory).unwrap();
        assert_eq!(resolution.matched.len(), 1);
        assert_eq!(resolution.matched[0].platform_hint, Some(PlatformKind::Nomad));
        assert!(resolution.unmatched.is_empty());
    }

    #[test]
    fn test_matched_keeps_inventory_order() {
        let inventory = vec![
            Target::new("c", TargetKind::Vm),
            Target::new("a", TargetKind::Vm),
            Target::new("b", TargetKind::Vm),
        ];
        let resolution = resolve(&ids(&["a", "b", "c"]), &inventory).unwrap();
        let order: Vec<_> = resolution.matched.iter().map(|t| t.identifier.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }
}

use std::collections::HashSet;
use tracing::{debug, warn};

use crate::variants::{Activation, PageState, VariantGroup, VariantOption};

/// Turns detected variant groups into the page states to visit
pub trait EnumerationPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Candidate states in visiting order, produced lazily; may contain duplicates
    fn expand<'a>(&self, groups: &'a [VariantGroup]) -> Box<dyn Iterator<Item = PageState> + 'a>;

    /// Policy-specific bound on the number of states, on top of the caller's
    fn max_states(&self) -> Option<usize> {
        None
    }
}

/// Base state, then each non-default option of each group with the others left at default.
///
/// Yields `1 + Σ(nᵢ − 1)` states. Joint combinations of groups are not visited.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndependentAxes;

impl EnumerationPolicy for IndependentAxes {
    fn name(&self) -> &'static str {
        "independent"
    }

    fn expand<'a>(&self, groups: &'a [VariantGroup]) -> Box<dyn Iterator<Item = PageState> + 'a> {
        let variants = groups.iter().flat_map(|group| {
            let default = group.default_index();
            group
                .options
                .iter()
                .enumerate()
                .filter(move |(index, _)| *index != default)
                .map(move |(_, option)| PageState::with_activations(vec![activation(group, option)]))
        });

        Box::new(std::iter::once(PageState::base()).chain(variants))
    }
}

/// Every combination of every group's options, capped at `max_states`
#[derive(Debug, Clone, Copy)]
pub struct Cartesian {
    pub max_states: usize,
}

impl EnumerationPolicy for Cartesian {
    fn name(&self) -> &'static str {
        "cartesian"
    }

    fn expand<'a>(&self, groups: &'a [VariantGroup]) -> Box<dyn Iterator<Item = PageState> + 'a> {
        let groups: Vec<&VariantGroup> = groups.iter().filter(|g| !g.options.is_empty()).collect();

        // Default option first in every axis, so the all-zero cursor is the base state
        let axes: Vec<Vec<usize>> = groups
            .iter()
            .map(|g| {
                let default = g.default_index();
                std::iter::once(default)
                    .chain((0..g.options.len()).filter(|i| *i != default))
                    .collect()
            })
            .collect();
        let cursor = Some(vec![0usize; axes.len()]);

        Box::new(Odometer { groups, axes, cursor })
    }

    fn max_states(&self) -> Option<usize> {
        Some(self.max_states)
    }
}

struct Odometer<'a> {
    groups: Vec<&'a VariantGroup>,
    axes: Vec<Vec<usize>>,
    cursor: Option<Vec<usize>>,
}

impl Iterator for Odometer<'_> {
    type Item = PageState;

    fn next(&mut self) -> Option<PageState> {
        let cursor = self.cursor.as_mut()?;
        let activations = cursor
            .iter()
            .enumerate()
            .filter(|(_, position)| **position != 0)
            .map(|(axis, position)| {
                let group = self.groups[axis];
                activation(group, &group.options[self.axes[axis][*position]])
            })
            .collect();
        let state = PageState::with_activations(activations);

        // Advance, last axis fastest; wrapping the first axis ends the walk
        let mut axis = self.axes.len();
        loop {
            if axis == 0 {
                self.cursor = None;
                break;
            }
            axis -= 1;
            cursor[axis] += 1;
            if cursor[axis] < self.axes[axis].len() {
                break;
            }
            cursor[axis] = 0;
        }

        Some(state)
    }
}

fn activation(group: &VariantGroup, option: &VariantOption) -> Activation {
    Activation {
        group: group.key.clone(),
        label: option.label.clone(),
        handle: option.handle.clone(),
        article_hint: option.article_hint.clone(),
    }
}

/// Expand `groups` under `policy` into a deduplicated, ordered state list.
///
/// The same input always yields the same list; the base state is always first.
/// Duplicates are dropped before the cap is applied.
pub fn enumerate(policy: &dyn EnumerationPolicy, groups: &[VariantGroup], max_states: usize) -> Vec<PageState> {
    let limit = policy.max_states().map_or(max_states, |cap| cap.min(max_states)).max(1);

    let mut seen = HashSet::new();
    let mut states = Vec::new();
    for state in policy.expand(groups) {
        let key: Vec<(String, String)> = state
            .key()
            .into_iter()
            .map(|(g, l)| (g.to_string(), l.to_string()))
            .collect();
        if !seen.insert(key) {
            debug!("Dropping duplicate page state {}", state);
            continue;
        }
        if states.len() == limit {
            warn!("Variant expansion stopped at the cap of {} states ({} policy)", limit, policy.name());
            break;
        }
        states.push(state);
    }

    states
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variants::{OptionHandle, SelectorKind};

    fn group(key: &str, labels: &[&str]) -> VariantGroup {
        VariantGroup {
            key: key.to_string(),
            kind: SelectorKind::Radio,
            options: labels
                .iter()
                .enumerate()
                .map(|(i, label)| VariantOption {
                    label: label.to_string(),
                    handle: OptionHandle {
                        kind: SelectorKind::Radio,
                        selector: format!("input[name=\"{}\"][value=\"{}\"]", key, i),
                        value: None,
                    },
                    article_hint: None,
                    is_default: i == 0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_no_groups_yields_base_only() {
        let states = enumerate(&IndependentAxes, &[], 64);
        assert_eq!(states.len(), 1);
        assert!(states[0].is_base());
    }

    #[test]
    fn test_single_group_of_three() {
        let groups = vec![group("size", &["S", "M", "L"])];
        let states = enumerate(&IndependentAxes, &groups, 64);

        let keys: Vec<String> = states.iter().map(|s| s.key_string()).collect();
        assert_eq!(keys, vec!["base", "size=M", "size=L"]);
    }

    #[test]
    fn test_independent_groups_are_not_multiplied() {
        let groups = vec![group("size", &["S", "M", "L"]), group("flavor", &["Mint", "Lemon"])];
        let states = enumerate(&IndependentAxes, &groups, 64);

        assert_eq!(states.len(), 1 + (3 - 1) + (2 - 1));
        let keys: Vec<String> = states.iter().map(|s| s.key_string()).collect();
        assert_eq!(keys, vec!["base", "size=M", "size=L", "flavor=Lemon"]);
    }

    #[test]
    fn test_enumeration_is_repeatable() {
        let groups = vec![group("size", &["S", "M", "L"]), group("flavor", &["Mint", "Lemon"])];

        let first: Vec<String> = enumerate(&IndependentAxes, &groups, 64).iter().map(|s| s.key_string()).collect();
        let second: Vec<String> = enumerate(&IndependentAxes, &groups, 64).iter().map(|s| s.key_string()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_duplicate_groups_do_not_duplicate_states() {
        // The same control reported twice, e.g. a radio set and its mirrored button bar
        let groups = vec![group("size", &["S", "M"]), group("size", &["S", "M"])];
        let states = enumerate(&IndependentAxes, &groups, 64);

        assert_eq!(states.len(), 2);
        let unique: HashSet<PageState> = states.iter().cloned().collect();
        assert_eq!(unique.len(), states.len());
    }

    #[test]
    fn test_default_option_not_first() {
        let mut size = group("size", &["S", "M", "L"]);
        size.options[0].is_default = false;
        size.options[1].is_default = true;

        let keys: Vec<String> = enumerate(&IndependentAxes, &[size], 64).iter().map(|s| s.key_string()).collect();
        assert_eq!(keys, vec!["base", "size=S", "size=L"]);
    }

    #[test]
    fn test_cap_limits_states() {
        let groups = vec![group("size", &["A", "B", "C", "D", "E"])];
        let states = enumerate(&IndependentAxes, &groups, 3);
        assert_eq!(states.len(), 3);
        assert!(states[0].is_base());
    }

    #[test]
    fn test_duplicates_do_not_consume_the_cap() {
        let groups = vec![group("size", &["S", "M"]), group("size", &["S", "M"]), group("flavor", &["Mint", "Lemon"])];
        let keys: Vec<String> = enumerate(&IndependentAxes, &groups, 3).iter().map(|s| s.key_string()).collect();

        assert_eq!(keys, vec!["base", "size=M", "flavor=Lemon"]);
    }

    #[test]
    fn test_cap_exactly_reached_keeps_every_state() {
        let groups = vec![group("size", &["S", "M", "L"])];
        let keys: Vec<String> = enumerate(&IndependentAxes, &groups, 3).iter().map(|s| s.key_string()).collect();

        assert_eq!(keys, vec!["base", "size=M", "size=L"]);
    }

    #[test]
    fn test_cartesian_covers_joint_combinations() {
        let groups = vec![group("size", &["S", "M", "L"]), group("flavor", &["Mint", "Lemon"])];
        let states = enumerate(&Cartesian { max_states: 64 }, &groups, 64);

        assert_eq!(states.len(), 6);
        assert!(states[0].is_base());
        assert!(states.iter().any(|s| s.key_string() == "size=L;flavor=Lemon"));
        let unique: HashSet<PageState> = states.iter().cloned().collect();
        assert_eq!(unique.len(), 6);
    }

    #[test]
    fn test_cartesian_respects_cap() {
        let groups = vec![group("a", &["1", "2", "3"]), group("b", &["1", "2", "3"])];
        let states = enumerate(&Cartesian { max_states: 4 }, &groups, 64);

        assert_eq!(states.len(), 4);
        assert!(states[0].is_base());
    }
}

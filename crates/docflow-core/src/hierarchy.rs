//! Role hierarchy resolution.
//!
//! A hierarchy is an ordered list of levels; every level is a set of roles
//! that act together before work moves on to the next level. Roles that share
//! a parent form one level. Parentless roles that head a tree share the root
//! level, while a parentless role without children stands alone.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::assignment::{Direction, HierarchyConfig};
use crate::{RoleId, WorkflowError};

/// Every known role mapped to its parent.
pub type RoleDirectory = BTreeMap<RoleId, Option<RoleId>>;

/// Ordered hierarchy levels, persisted as a JSON array of arrays.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct RoleHierarchy {
    levels: Vec<Vec<RoleId>>,
}

impl RoleHierarchy {
    #[must_use]
    pub fn from_levels(levels: Vec<Vec<RoleId>>) -> Self {
        Self { levels }
    }

    #[must_use]
    pub fn levels(&self) -> &[Vec<RoleId>] {
        &self.levels
    }

    #[must_use]
    pub fn level(&self, index: u32) -> Option<&[RoleId]> {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.levels.get(index))
            .map(Vec::as_slice)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    #[must_use]
    pub fn is_last_level(&self, index: u32) -> bool {
        usize::try_from(index).map_or(true, |index| index + 1 >= self.levels.len())
    }

    #[must_use]
    pub fn all_roles(&self) -> BTreeSet<RoleId> {
        self.levels.iter().flatten().copied().collect()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
enum LevelKey {
    Root,
    Singleton(RoleId),
    Parent(RoleId),
}

/// Groups the selected roles into ordered levels.
///
/// # Errors
/// Returns [`WorkflowError::InvalidAssignment`] when the selection is empty,
/// names a role missing from `directory`, or walks into a broken or cyclic
/// parent chain.
pub fn resolve_role_hierarchy(
    directory: &RoleDirectory,
    selected: &[RoleId],
    config: HierarchyConfig,
) -> Result<RoleHierarchy, WorkflowError> {
    let selected: BTreeSet<RoleId> = selected.iter().copied().collect();
    if selected.is_empty() {
        return Err(WorkflowError::InvalidAssignment(
            "empty role set".to_string(),
        ));
    }
    if let Some(missing) = selected.iter().find(|role| !directory.contains_key(role)) {
        return Err(WorkflowError::InvalidAssignment(format!(
            "unknown role {missing}"
        )));
    }

    if config.allow_parallel {
        return Ok(RoleHierarchy::from_levels(vec![selected
            .into_iter()
            .collect()]));
    }

    let parents_with_children: BTreeSet<RoleId> = directory.values().flatten().copied().collect();
    let mut grouped: BTreeMap<(usize, LevelKey), Vec<RoleId>> = BTreeMap::new();
    for role in selected {
        let depth = depth_of(directory, role)?;
        let key = match directory.get(&role).copied().flatten() {
            Some(parent) => LevelKey::Parent(parent),
            None if parents_with_children.contains(&role) => LevelKey::Root,
            None => LevelKey::Singleton(role),
        };
        grouped.entry((depth, key)).or_default().push(role);
    }

    let mut levels: Vec<Vec<RoleId>> = grouped.into_values().collect();
    if config.direction == Direction::Upwards {
        levels.reverse();
    }
    Ok(RoleHierarchy::from_levels(levels))
}

fn depth_of(directory: &RoleDirectory, role: RoleId) -> Result<usize, WorkflowError> {
    let mut visited = BTreeSet::from([role]);
    let mut depth = 0_usize;
    let mut cursor = role;
    loop {
        let parent = match directory.get(&cursor) {
            Some(parent) => *parent,
            None => {
                return Err(WorkflowError::InvalidAssignment(format!(
                    "broken hierarchy reference to role {cursor}"
                )))
            }
        };
        let Some(parent) = parent else {
            return Ok(depth);
        };
        if !visited.insert(parent) {
            return Err(WorkflowError::InvalidAssignment(format!(
                "role hierarchy cycle through {parent}"
            )));
        }
        depth += 1;
        cursor = parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn sequential(direction: Direction) -> HierarchyConfig {
        HierarchyConfig {
            direction,
            allow_parallel: false,
        }
    }

    /// director -> manager -> {clerk, analyst}
    fn fixture_chain() -> (RoleDirectory, [RoleId; 4]) {
        let director = RoleId::new();
        let manager = RoleId::new();
        let clerk = RoleId::new();
        let analyst = RoleId::new();
        let directory = RoleDirectory::from([
            (director, None),
            (manager, Some(director)),
            (clerk, Some(manager)),
            (analyst, Some(manager)),
        ]);
        (directory, [director, manager, clerk, analyst])
    }

    #[test]
    fn downwards_keeps_root_to_leaf_order() {
        let (directory, [director, manager, clerk, analyst]) = fixture_chain();
        let hierarchy = must_ok(resolve_role_hierarchy(
            &directory,
            &[clerk, director, analyst, manager],
            sequential(Direction::Downwards),
        ));

        let mut leaves = vec![clerk, analyst];
        leaves.sort();
        assert_eq!(hierarchy.levels(), &[vec![director], vec![manager], leaves]);
    }

    #[test]
    fn upwards_starts_at_most_junior_level() {
        let (directory, [director, manager, clerk, _]) = fixture_chain();
        let hierarchy = must_ok(resolve_role_hierarchy(
            &directory,
            &[director, manager, clerk],
            sequential(Direction::Upwards),
        ));

        assert_eq!(hierarchy.levels(), &[vec![clerk], vec![manager], vec![director]]);
        assert!(hierarchy.is_last_level(2));
        assert!(!hierarchy.is_last_level(1));
    }

    #[test]
    fn parallel_collapses_into_one_level() {
        let (directory, roles) = fixture_chain();
        let hierarchy = must_ok(resolve_role_hierarchy(
            &directory,
            &roles,
            HierarchyConfig {
                direction: Direction::Upwards,
                allow_parallel: true,
            },
        ));
        assert_eq!(hierarchy.len(), 1);
        assert_eq!(hierarchy.all_roles().len(), 4);
    }

    #[test]
    fn isolated_role_forms_singleton_level() {
        let (mut directory, [director, _, _, _]) = fixture_chain();
        let auditor = RoleId::new();
        let legal = RoleId::new();
        directory.insert(auditor, None);
        directory.insert(legal, None);

        let hierarchy = must_ok(resolve_role_hierarchy(
            &directory,
            &[director, auditor, legal],
            sequential(Direction::Downwards),
        ));

        assert_eq!(hierarchy.len(), 3);
        assert_eq!(hierarchy.levels()[0], vec![director]);
        assert!(hierarchy.levels()[1..].iter().all(|level| level.len() == 1));
    }

    #[test]
    fn unknown_role_fails_whole_resolution() {
        let (directory, [director, _, _, _]) = fixture_chain();
        let err = match resolve_role_hierarchy(
            &directory,
            &[director, RoleId::new()],
            sequential(Direction::Downwards),
        ) {
            Ok(value) => panic!("expected failure, got {value:?}"),
            Err(err) => err,
        };
        assert_eq!(err.code(), "invalid_assignment");
    }

    #[test]
    fn cyclic_parent_chain_is_rejected() {
        let a = RoleId::new();
        let b = RoleId::new();
        let directory = RoleDirectory::from([(a, Some(b)), (b, Some(a))]);
        assert!(
            resolve_role_hierarchy(&directory, &[a], sequential(Direction::Downwards)).is_err()
        );
    }

    #[test]
    fn hierarchy_serializes_as_array_of_arrays() {
        let (directory, [director, manager, _, _]) = fixture_chain();
        let hierarchy = must_ok(resolve_role_hierarchy(
            &directory,
            &[director, manager],
            sequential(Direction::Downwards),
        ));
        let value = must_ok(serde_json::to_value(&hierarchy));
        assert_eq!(
            value,
            serde_json::json!([[director.to_string()], [manager.to_string()]])
        );
    }

    fn arbitrary_forest() -> impl Strategy<Value = (RoleDirectory, Vec<RoleId>)> {
        (1_usize..12)
            .prop_flat_map(|size| {
                (
                    proptest::collection::vec(
                        proptest::option::of(any::<prop::sample::Index>()),
                        size,
                    ),
                    proptest::collection::vec(any::<bool>(), size),
                )
            })
            .prop_map(|(parents, picks)| {
                let roles: Vec<RoleId> = (0..parents.len()).map(|_| RoleId::new()).collect();
                let mut directory = RoleDirectory::new();
                for (position, parent) in parents.iter().enumerate() {
                    let parent = match parent {
                        Some(index) if position > 0 => Some(roles[index.index(position)]),
                        _ => None,
                    };
                    directory.insert(roles[position], parent);
                }
                let mut selected: Vec<RoleId> = roles
                    .iter()
                    .zip(picks)
                    .filter_map(|(role, pick)| pick.then_some(*role))
                    .collect();
                if selected.is_empty() {
                    selected.push(roles[0]);
                }
                (directory, selected)
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn each_selected_role_lands_in_one_level((directory, selected) in arbitrary_forest()) {
            let hierarchy = must_ok(resolve_role_hierarchy(
                &directory,
                &selected,
                sequential(Direction::Downwards),
            ));
            let flattened: Vec<RoleId> = hierarchy.levels().iter().flatten().copied().collect();
            let unique: BTreeSet<RoleId> = flattened.iter().copied().collect();
            prop_assert_eq!(flattened.len(), unique.len());
            prop_assert_eq!(unique, selected.iter().copied().collect::<BTreeSet<_>>());
            prop_assert!(hierarchy.levels().iter().all(|level| !level.is_empty()));
        }

        #[test]
        fn upwards_is_reverse_of_downwards((directory, selected) in arbitrary_forest()) {
            let down = must_ok(resolve_role_hierarchy(
                &directory,
                &selected,
                sequential(Direction::Downwards),
            ));
            let up = must_ok(resolve_role_hierarchy(
                &directory,
                &selected,
                sequential(Direction::Upwards),
            ));
            let mut reversed = down.levels().to_vec();
            reversed.reverse();
            prop_assert_eq!(up.levels(), reversed.as_slice());
        }
    }
}

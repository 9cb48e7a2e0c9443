// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Module-name resolution strategy. The default is a single flat
//! namespace; embedders composing super-projects out of subprojects with
//! private module names substitute their own implementation at context
//! construction.

use std::collections::BTreeMap;

use crate::error::{BlueprintError, Position};
use crate::module::GroupId;

pub trait NameInterface: Send + Sync {
    /// Registers a new module group. `namespace_dir` is the directory of
    /// the defining file, for namespace-aware implementations.
    fn register(
        &mut self,
        name: &str,
        group: GroupId,
        namespace_dir: &str,
        pos: &Position,
    ) -> Result<(), BlueprintError>;

    /// Resolves a dependency name, as seen from a module defined in
    /// `requesting_dir`.
    fn lookup(&self, name: &str, requesting_dir: &str) -> Option<GroupId>;

    fn rename(
        &mut self,
        old: &str,
        new: &str,
        group: GroupId,
        pos: &Position,
    ) -> Result<(), BlueprintError>;

    /// All groups in the deterministic order used for traversal and
    /// manifest emission.
    fn sorted_groups(&self) -> Vec<GroupId>;

    /// The globally unique name a group is emitted under.
    fn unique_name(&self, name: &str) -> String {
        name.to_string()
    }
}

/// A single flat namespace: one group per name, sorted lexicographically.
#[derive(Default)]
pub struct SimpleNameInterface {
    names: BTreeMap<String, (GroupId, Position)>,
}

impl SimpleNameInterface {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NameInterface for SimpleNameInterface {
    fn register(
        &mut self,
        name: &str,
        group: GroupId,
        _namespace_dir: &str,
        pos: &Position,
    ) -> Result<(), BlueprintError> {
        if let Some((_, previous)) = self.names.get(name) {
            return Err(BlueprintError::DuplicateModule {
                name: name.to_string(),
                pos: pos.clone(),
                previous: previous.clone(),
            });
        }
        self.names
            .insert(name.to_string(), (group, pos.clone()));
        Ok(())
    }

    fn lookup(&self, name: &str, _requesting_dir: &str) -> Option<GroupId> {
        self.names.get(name).map(|(group, _)| *group)
    }

    fn rename(
        &mut self,
        old: &str,
        new: &str,
        group: GroupId,
        pos: &Position,
    ) -> Result<(), BlueprintError> {
        if let Some((_, previous)) = self.names.get(new) {
            return Err(BlueprintError::DuplicateModule {
                name: new.to_string(),
                pos: pos.clone(),
                previous: previous.clone(),
            });
        }
        let entry = self.names.remove(old);
        let pos = entry.map(|(_, p)| p).unwrap_or_else(|| pos.clone());
        self.names.insert(new.to_string(), (group, pos));
        Ok(())
    }

    fn sorted_groups(&self) -> Vec<GroupId> {
        self.names.values().map(|(group, _)| *group).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_reports_previous_position() {
        let mut names = SimpleNameInterface::new();
        let first = Position::new("a/Blueprints", 1, 1);
        names.register("lib", GroupId(0), "a", &first).unwrap();
        let err = names
            .register("lib", GroupId(1), "b", &Position::new("b/Blueprints", 9, 1))
            .unwrap_err();
        match err {
            BlueprintError::DuplicateModule { previous, .. } => assert_eq!(previous, first),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn sorted_groups_follow_name_order() {
        let mut names = SimpleNameInterface::new();
        let pos = Position::default();
        names.register("zlib", GroupId(0), "", &pos).unwrap();
        names.register("alib", GroupId(1), "", &pos).unwrap();
        assert_eq!(names.sorted_groups(), vec![GroupId(1), GroupId(0)]);
    }

    #[test]
    fn rename_moves_the_entry() {
        let mut names = SimpleNameInterface::new();
        let pos = Position::default();
        names.register("old", GroupId(0), "", &pos).unwrap();
        names.rename("old", "new", GroupId(0), &pos).unwrap();
        assert!(names.lookup("old", "").is_none());
        assert_eq!(names.lookup("new", ""), Some(GroupId(0)));
    }
}

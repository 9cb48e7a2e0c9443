// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The module graph: groups, variants, aliases, and dependency edges.
//!
//! Variants live in a contiguous arena indexed by [`ModuleId`]; groups and
//! edges refer to them by id, so the bidirectional dependency links never
//! form strong reference cycles. A variant that has been split is left in
//! the arena as a tombstone (`logic == None`, `split_modules` set) until
//! every edge pointing at it has been re-resolved.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{BlueprintError, Position};
use crate::ninja::BuildDef;
use crate::properties::PropertyRecord;
use crate::scope::{Rule, Variable};

/// Arena index of a module variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub(crate) u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Arena index of a module group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub(crate) u32);

/// One axis-value pair introduced by a variant-creating mutator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variation {
    pub mutator: String,
    pub variation: String,
}

impl Variation {
    pub fn new(mutator: impl Into<String>, variation: impl Into<String>) -> Self {
        Self {
            mutator: mutator.into(),
            variation: variation.into(),
        }
    }
}

/// Ordered axis→value map identifying a variant. Insertion order follows
/// the order the axes were introduced; equality ignores order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariationMap {
    entries: IndexMap<String, String>,
}

impl VariationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, axis: &str) -> Option<&str> {
        self.entries.get(axis).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn insert(&mut self, axis: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(axis.into(), value.into());
    }

    pub(crate) fn merged_with(&self, overrides: &[Variation]) -> VariationMap {
        let mut merged = self.clone();
        for v in overrides {
            merged.insert(v.mutator.clone(), v.variation.clone());
        }
        merged
    }

    pub(crate) fn merge_from(&mut self, other: &VariationMap) {
        for (axis, value) in &other.entries {
            self.insert(axis.clone(), value.clone());
        }
    }

    /// Whether every axis-value pair of `self` also appears in `other`.
    pub(crate) fn subset_of(&self, other: &VariationMap) -> bool {
        self.entries
            .iter()
            .all(|(axis, value)| other.get(axis) == Some(value.as_str()))
    }

    /// `axis:value` pairs joined by commas, in axis introduction order.
    pub fn display(&self) -> String {
        if self.entries.is_empty() {
            return "<empty variant>".to_string();
        }
        self.entries
            .iter()
            .map(|(axis, value)| format!("{axis}:{value}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// The values joined by underscores, used as the variant's short name.
    pub fn variant_name(&self) -> String {
        self.entries
            .values()
            .cloned()
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Embedder-defined marker distinguishing kinds of dependencies. The
/// engine compares tags by identity only.
pub trait DependencyTag: Any + Send + Sync + fmt::Debug {}

pub type DepTag = Arc<dyn DependencyTag>;

#[derive(Debug)]
struct BaseDependencyTag;

impl DependencyTag for BaseDependencyTag {}

/// The reserved tag used for engine-added edges (dynamic dependencies).
/// Embedders must not pass it to `add_dependency`.
pub(crate) fn base_dep_tag() -> DepTag {
    static BASE: Lazy<DepTag> = Lazy::new(|| Arc::new(BaseDependencyTag));
    BASE.clone()
}

pub(crate) fn is_base_tag(tag: &DepTag) -> bool {
    Arc::ptr_eq(tag, &base_dep_tag())
}

/// A direct dependency edge. `requested` keeps the variations the depender
/// named explicitly so the edge can be re-resolved when its target is
/// split by a later mutator.
#[derive(Clone, Debug)]
pub(crate) struct DepEdge {
    pub(crate) module: ModuleId,
    pub(crate) tag: DepTag,
    pub(crate) requested: VariationMap,
    pub(crate) far: bool,
}

/// The embedder-supplied logic object: the closed capability surface the
/// engine dispatches through.
pub trait Module: Any + Send + Sync {
    fn generate_build_actions(&mut self, ctx: &mut crate::context::ModuleContext<'_>);

    /// Extra dependency names resolved before any mutator runs.
    fn dynamic_dependencies(
        &self,
        _ctx: &mut crate::context::DynamicDependerContext<'_>,
    ) -> Vec<String> {
        Vec::new()
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub type ModuleFactory =
    Arc<dyn Fn() -> (Box<dyn Module>, Vec<Box<dyn PropertyRecord>>) + Send + Sync>;

/// Build output collected from one variant during the generate phase.
#[derive(Default)]
pub(crate) struct ModuleActions {
    pub(crate) local_variables: Vec<Variable>,
    pub(crate) local_rules: Vec<Rule>,
    pub(crate) build_defs: Vec<BuildDef>,
}

/// Mutable state of one variant, guarded by its own lock. Parallel
/// visitors only write the state of the module they were invoked on.
pub(crate) struct ModuleState {
    pub(crate) logic: Option<Box<dyn Module>>,
    pub(crate) properties: Vec<Box<dyn PropertyRecord>>,
    pub(crate) property_pos: IndexMap<String, Position>,
    pub(crate) variant: VariationMap,
    pub(crate) dependency_variant: VariationMap,
    pub(crate) direct_deps: Vec<DepEdge>,
    pub(crate) forward_deps: Vec<ModuleId>,
    pub(crate) reverse_deps: Vec<ModuleId>,
    /// Set when this variant was superseded by a split.
    pub(crate) split_modules: Vec<ModuleId>,
    /// Axis and default variation of the split that superseded this
    /// variant, for the edge re-resolution defaulting rule.
    pub(crate) split_axis: Option<String>,
    pub(crate) default_variation: Option<String>,
    pub(crate) providers: Vec<Option<Arc<dyn Any + Send + Sync>>>,
    pub(crate) current_mutator: Option<String>,
    /// How many mutator passes have completed for this variant; gates
    /// provider reads.
    pub(crate) mutators_done: usize,
    pub(crate) generated: bool,
    pub(crate) failed: bool,
    pub(crate) missing_deps: Vec<String>,
    pub(crate) handled_missing_deps: bool,
    pub(crate) ninja_file_deps: Vec<String>,
    pub(crate) actions: ModuleActions,
}

impl ModuleState {
    pub(crate) fn new(
        logic: Box<dyn Module>,
        properties: Vec<Box<dyn PropertyRecord>>,
        property_pos: IndexMap<String, Position>,
    ) -> Self {
        Self {
            logic: Some(logic),
            properties,
            property_pos,
            variant: VariationMap::new(),
            dependency_variant: VariationMap::new(),
            direct_deps: Vec::new(),
            forward_deps: Vec::new(),
            reverse_deps: Vec::new(),
            split_modules: Vec::new(),
            split_axis: None,
            default_variation: None,
            providers: Vec::new(),
            current_mutator: None,
            mutators_done: 0,
            generated: false,
            failed: false,
            missing_deps: Vec::new(),
            handled_missing_deps: false,
            ninja_file_deps: Vec::new(),
            actions: ModuleActions::default(),
        }
    }

    pub(crate) fn is_superseded(&self) -> bool {
        self.logic.is_none() && !self.split_modules.is_empty()
    }
}

/// One variant in the arena. Identity and defining location never change;
/// everything else lives in `state`.
pub(crate) struct ModuleInfo {
    pub(crate) id: ModuleId,
    pub(crate) group: GroupId,
    pub(crate) type_name: String,
    pub(crate) factory: ModuleFactory,
    pub(crate) pos: Position,
    /// Directory of the defining blueprint file, relative to the root.
    pub(crate) dir: String,
    pub(crate) state: RwLock<ModuleState>,
}

impl ModuleInfo {
    pub(crate) fn variant_name(&self) -> String {
        self.state.read().variant.variant_name()
    }
}

/// A variant descriptor that resolves to a real variant in the same group.
#[derive(Clone, Debug)]
pub(crate) struct Alias {
    pub(crate) variant: VariationMap,
    pub(crate) dependency_variant: VariationMap,
    pub(crate) target: ModuleId,
}

pub(crate) struct ModuleGroup {
    pub(crate) id: GroupId,
    pub(crate) name: String,
    /// Live variants, in creation order. Superseded variants are replaced
    /// by their splits in place.
    pub(crate) modules: Vec<ModuleId>,
    pub(crate) aliases: Vec<Alias>,
}

/// Outcome of resolving a named dependency inside a group.
pub(crate) enum ResolvedDep {
    Module(ModuleId),
    Missing { available: Vec<String> },
}

#[derive(Default)]
pub(crate) struct ModuleGraph {
    pub(crate) modules: Vec<Arc<ModuleInfo>>,
    pub(crate) groups: Vec<ModuleGroup>,
    /// Topological order: every forward dependency precedes its depender.
    pub(crate) modules_sorted: Vec<ModuleId>,
}

impl ModuleGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn module(&self, id: ModuleId) -> &Arc<ModuleInfo> {
        &self.modules[id.0 as usize]
    }

    pub(crate) fn group(&self, id: GroupId) -> &ModuleGroup {
        &self.groups[id.0 as usize]
    }

    pub(crate) fn group_mut(&mut self, id: GroupId) -> &mut ModuleGroup {
        &mut self.groups[id.0 as usize]
    }

    pub(crate) fn group_of(&self, id: ModuleId) -> &ModuleGroup {
        self.group(self.module(id).group)
    }

    pub(crate) fn module_name(&self, id: ModuleId) -> String {
        self.group_of(id).name.clone()
    }

    /// `name` or `name(variations)` for error messages.
    pub(crate) fn module_desc(&self, id: ModuleId) -> String {
        let name = self.module_name(id);
        let variant = self.module(id).state.read().variant.clone();
        if variant.is_empty() {
            name
        } else {
            format!("{name}({})", variant.display())
        }
    }

    pub(crate) fn add_group(&mut self, name: impl Into<String>) -> GroupId {
        let id = GroupId(self.groups.len() as u32);
        self.groups.push(ModuleGroup {
            id,
            name: name.into(),
            modules: Vec::new(),
            aliases: Vec::new(),
        });
        id
    }

    pub(crate) fn add_module(
        &mut self,
        group: GroupId,
        type_name: String,
        factory: ModuleFactory,
        pos: Position,
        dir: String,
        state: ModuleState,
    ) -> ModuleId {
        let id = ModuleId(self.modules.len() as u32);
        self.modules.push(Arc::new(ModuleInfo {
            id,
            group,
            type_name,
            factory,
            pos,
            dir,
            state: RwLock::new(state),
        }));
        self.group_mut(group).modules.push(id);
        id
    }

    /// Replaces a superseded parent's entry in its group with the new
    /// variant ids, preserving creation order, and records the split on
    /// the parent.
    pub(crate) fn apply_split(
        &mut self,
        parent: ModuleId,
        new_ids: Vec<ModuleId>,
        axis: String,
        default_variation: Option<String>,
    ) {
        {
            let parent_info = self.module(parent).clone();
            let mut state = parent_info.state.write();
            state.split_modules = new_ids.clone();
            state.split_axis = Some(axis);
            state.default_variation = default_variation;
        }
        let group_id = self.module(parent).group;
        let group = self.group_mut(group_id);
        if let Some(index) = group.modules.iter().position(|&m| m == parent) {
            group.modules.splice(index..index + 1, new_ids);
        }
    }

    /// Resolves a dependency request inside a group: an exact variant
    /// match, then an alias match, then the split defaulting rules.
    pub(crate) fn resolve_in_group(
        &self,
        group: GroupId,
        wanted: &VariationMap,
        far: bool,
    ) -> ResolvedDep {
        let group = self.group(group);
        for &candidate in &group.modules {
            let state = self.module(candidate).state.read();
            let matched = if far {
                wanted.subset_of(&state.variant)
            } else {
                state.dependency_variant == *wanted
            };
            if matched {
                return ResolvedDep::Module(candidate);
            }
        }
        for alias in &group.aliases {
            let matched = if far {
                wanted.subset_of(&alias.variant)
            } else {
                alias.dependency_variant == *wanted
            };
            if matched {
                return ResolvedDep::Module(alias.target);
            }
        }
        ResolvedDep::Missing {
            available: self.group_variant_names(group.id),
        }
    }

    pub(crate) fn group_variant_names(&self, group: GroupId) -> Vec<String> {
        self.group(group)
            .modules
            .iter()
            .map(|&m| self.module(m).state.read().variant.display())
            .collect()
    }

    /// Re-resolves one edge whose target was superseded by a split.
    /// Returns the replacement, or the candidate listing for the error.
    ///
    /// The defaulting rules (`default_variation`, first-variant for a
    /// depender that matched the pre-split descriptor exactly) only apply
    /// with `allow_fallback` set: mid-pass fixups must not commit an edge
    /// to a fallback before the depender itself had a chance to split.
    pub(crate) fn resolve_superseded_edge(
        &self,
        edge: &DepEdge,
        depender_variant: &VariationMap,
        allow_fallback: bool,
    ) -> Result<ModuleId, Vec<String>> {
        let mut target = edge.module;
        // Splits of splits: follow tombstones until a live variant or a
        // failed match.
        for _ in 0..self.modules.len() {
            let info = self.module(target);
            let (superseded, old_descriptor, axis, default) = {
                let state = info.state.read();
                (
                    state.is_superseded(),
                    state.dependency_variant.clone(),
                    state.split_axis.clone(),
                    state.default_variation.clone(),
                )
            };
            if !superseded {
                return Ok(target);
            }
            let wanted = if edge.far {
                edge.requested.clone()
            } else {
                let mut wanted = depender_variant.clone();
                wanted.merge_from(&edge.requested);
                wanted
            };
            match self.resolve_in_group(info.group, &wanted, edge.far) {
                ResolvedDep::Module(m) => {
                    target = m;
                    continue;
                }
                ResolvedDep::Missing { available } => {
                    if !allow_fallback {
                        return Err(available);
                    }
                    // Defaulting rules for dependers that do not carry the
                    // new axis.
                    let split = info.state.read().split_modules.clone();
                    if let (Some(axis), Some(default)) = (axis.as_deref(), default.as_deref()) {
                        let mut defaulted = wanted.clone();
                        defaulted.insert(axis, default);
                        if let Some(found) = split.iter().copied().find(|&m| {
                            self.module(m).state.read().dependency_variant == defaulted
                        }) {
                            target = found;
                            continue;
                        }
                    }
                    if wanted == old_descriptor {
                        if let Some(&first) = split.first() {
                            target = first;
                            continue;
                        }
                    }
                    return Err(available);
                }
            }
        }
        Err(self.group_variant_names(self.module(edge.module).group))
    }

    /// Walks every group's aliases after a mutator pass: aliases whose
    /// target was superseded are re-pointed at the surviving entry with
    /// the matching descriptor, or pruned when none exists. Sibling
    /// aliases participate in the match, which is how an alias chain
    /// flattens to a real variant.
    pub(crate) fn update_aliases(&mut self) {
        for group_index in 0..self.groups.len() {
            let group_id = self.groups[group_index].id;
            let mut retargeted: Vec<Option<ModuleId>> = Vec::new();
            for alias in &self.groups[group_index].aliases {
                let mut target = alias.target;
                let mut keep = true;
                // Bounded: each retarget lands on a distinct entry.
                for _ in 0..self.modules.len() {
                    let target_state = self.module(target).state.read();
                    if !target_state.is_superseded() {
                        break;
                    }
                    let old_descriptor = target_state.dependency_variant.clone();
                    drop(target_state);
                    match self.resolve_in_group(group_id, &old_descriptor, false) {
                        ResolvedDep::Module(new_target) if new_target != target => {
                            target = new_target;
                        }
                        _ => {
                            keep = false;
                            break;
                        }
                    }
                }
                if keep && self.module(target).state.read().is_superseded() {
                    keep = false;
                }
                retargeted.push(keep.then_some(target));
            }
            let group = &mut self.groups[group_index];
            let mut retargeted = retargeted.into_iter();
            group.aliases.retain_mut(|alias| match retargeted.next().unwrap() {
                Some(target) => {
                    alias.target = target;
                    true
                }
                None => false,
            });
        }
    }

    /// Recomputes forward and reverse dependency lists from direct deps
    /// plus the implicit in-group ordering, checks for cycles, and
    /// refreshes the global topological order. `group_order` fixes the
    /// deterministic iteration order.
    pub(crate) fn update_dependencies(
        &mut self,
        group_order: &[GroupId],
    ) -> Vec<BlueprintError> {
        let mut errors = Vec::new();

        let ordered_modules: Vec<ModuleId> = group_order
            .iter()
            .flat_map(|&g| self.group(g).modules.iter().copied())
            .collect();

        // Forward deps: direct deps (dedup'd, live targets only) plus all
        // earlier variants of the same group, so the first-created variant
        // runs first.
        for &id in &ordered_modules {
            let info = self.module(id).clone();
            let group = self.group(info.group);
            let position = group.modules.iter().position(|&m| m == id);
            let implicit: Vec<ModuleId> = match position {
                Some(index) => group.modules[..index].to_vec(),
                None => Vec::new(),
            };
            let mut state = info.state.write();
            let mut forward = Vec::new();
            let mut seen = std::collections::HashSet::new();
            for edge in &state.direct_deps {
                let target = edge.module;
                if target == id || self.module(target).state.read().is_superseded() {
                    continue;
                }
                if seen.insert(target) {
                    forward.push(target);
                }
            }
            for target in implicit {
                if target != id && seen.insert(target) {
                    forward.push(target);
                }
            }
            state.forward_deps = forward;
            state.reverse_deps.clear();
        }

        for &id in &ordered_modules {
            let forward = self.module(id).state.read().forward_deps.clone();
            for target in forward {
                self.module(target).state.write().reverse_deps.push(id);
            }
        }

        // Iterative depth-first topological sort; a back edge is a
        // dependency cycle.
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }
        let mut marks = vec![Mark::Unvisited; self.modules.len()];
        let mut sorted = Vec::with_capacity(ordered_modules.len());
        let mut reported_cycles = 0usize;

        for &root in &ordered_modules {
            if marks[root.0 as usize] != Mark::Unvisited {
                continue;
            }
            // (module, next forward-dep index to descend into)
            let mut stack: Vec<(ModuleId, usize)> = vec![(root, 0)];
            marks[root.0 as usize] = Mark::InProgress;
            while let Some(frame) = stack.last_mut() {
                let (current, next) = (frame.0, frame.1);
                frame.1 += 1;
                let forward = self.module(current).state.read().forward_deps.clone();
                if next < forward.len() {
                    let child = forward[next];
                    match marks[child.0 as usize] {
                        Mark::Unvisited => {
                            marks[child.0 as usize] = Mark::InProgress;
                            stack.push((child, 0));
                        }
                        Mark::InProgress => {
                            if reported_cycles == 0 {
                                let mut cycle: Vec<String> = stack
                                    .iter()
                                    .skip_while(|(m, _)| *m != child)
                                    .map(|(m, _)| self.module_name(*m))
                                    .collect();
                                cycle.reverse();
                                errors.push(BlueprintError::DependencyCycle { cycle });
                            }
                            reported_cycles += 1;
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[current.0 as usize] = Mark::Done;
                    sorted.push(current);
                    stack.pop();
                }
            }
        }

        self.modules_sorted = sorted;
        errors
    }

    /// Post-order depth-first visit of `from`'s transitive direct deps.
    /// With `dedup` disabled a module reachable over independent edges is
    /// visited once per path.
    pub(crate) fn visit_deps_depth_first(
        &self,
        from: ModuleId,
        dedup: bool,
        visit: &mut dyn FnMut(&Arc<ModuleInfo>),
    ) {
        let mut visited = std::collections::HashSet::new();
        self.visit_deps_inner(from, dedup, &mut visited, visit);
    }

    fn visit_deps_inner(
        &self,
        from: ModuleId,
        dedup: bool,
        visited: &mut std::collections::HashSet<ModuleId>,
        visit: &mut dyn FnMut(&Arc<ModuleInfo>),
    ) {
        let edges = self.module(from).state.read().direct_deps.clone();
        for edge in edges {
            if dedup && visited.contains(&edge.module) {
                continue;
            }
            self.visit_deps_inner(edge.module, dedup, visited, visit);
            if dedup {
                visited.insert(edge.module);
            }
            visit(self.module(edge.module));
        }
    }

    /// Two-callback walk: `down` gates recursion into a dependency,
    /// `up` runs after the dependency's subtree was walked. Each module is
    /// walked at most once.
    pub(crate) fn walk_deps(
        &self,
        from: ModuleId,
        down: &mut dyn FnMut(&Arc<ModuleInfo>, &Arc<ModuleInfo>) -> bool,
        up: &mut dyn FnMut(&Arc<ModuleInfo>, &Arc<ModuleInfo>),
    ) {
        let mut visited = std::collections::HashSet::new();
        self.walk_deps_inner(from, down, up, &mut visited);
    }

    fn walk_deps_inner(
        &self,
        from: ModuleId,
        down: &mut dyn FnMut(&Arc<ModuleInfo>, &Arc<ModuleInfo>) -> bool,
        up: &mut dyn FnMut(&Arc<ModuleInfo>, &Arc<ModuleInfo>),
        visited: &mut std::collections::HashSet<ModuleId>,
    ) {
        let parent = self.module(from).clone();
        let edges = parent.state.read().direct_deps.clone();
        for edge in edges {
            if !visited.insert(edge.module) {
                continue;
            }
            let child = self.module(edge.module).clone();
            if down(&child, &parent) {
                self.walk_deps_inner(edge.module, down, up, visited);
                up(&child, &parent);
            }
        }
    }
}

// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The mutator engine: registered callbacks that reshape the module graph
//! during the resolve phase.
//!
//! Early mutators run unordered before dependencies are resolved and may
//! only split. Bottom-up mutators run after all of a module's forward
//! deps; top-down mutators run before any of its reverse deps. Structural
//! edits that touch other modules (reverse deps, replacements, renames,
//! new modules) are funneled through a single aggregator thread and
//! applied atomically when the pass ends; splits apply immediately under
//! the graph lock because dependers are visited strictly later.

use std::any::Any;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use parking_lot::Mutex;
use tracing::debug;

use crate::context::{Config, Context};
use crate::error::{BlueprintError, Position};
use crate::module::{
    is_base_tag, DepEdge, DepTag, GroupId, Module, ModuleId, ModuleInfo, Variation, VariationMap,
};
use crate::properties::PropertyRecord;
use crate::provider::ProviderKey;
use crate::visitor::{parallel_visit, PauseHandle, VisitOrder, CANCEL, CONTINUE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MutatorKind {
    Early,
    BottomUp,
    TopDown,
}

#[derive(Clone)]
pub(crate) enum MutatorFunc {
    Early(Arc<dyn Fn(&mut EarlyMutatorContext<'_>) + Send + Sync>),
    BottomUp(Arc<dyn Fn(&mut BottomUpMutatorContext<'_>) + Send + Sync>),
    TopDown(Arc<dyn Fn(&mut TopDownMutatorContext<'_>) + Send + Sync>),
}

pub struct MutatorInfo {
    pub(crate) name: String,
    pub(crate) kind: MutatorKind,
    pub(crate) parallel: bool,
    pub(crate) func: MutatorFunc,
}

impl MutatorInfo {
    /// Allows this mutator's visits to run concurrently. A parallel
    /// mutator must only manipulate the module it is invoked on plus
    /// thread-safe global facilities.
    pub fn parallel(&mut self) -> &mut Self {
        self.parallel = true;
        self
    }
}

pub(crate) type ReplacePredicate = Arc<dyn Fn(&DepTag) -> bool + Send + Sync>;

pub(crate) struct NewModulePayload {
    pub(crate) type_name: String,
    pub(crate) name: String,
    pub(crate) logic: Box<dyn Module>,
    pub(crate) properties: Vec<Box<dyn PropertyRecord>>,
    pub(crate) dir: String,
    pub(crate) pos: Position,
}

/// One result message from a mutator invocation, serialized through the
/// pass aggregator.
pub(crate) enum PassMessage {
    Errors(Vec<BlueprintError>),
    AddEdge {
        on: ModuleId,
        edge: DepEdge,
    },
    Replace {
        from: ModuleId,
        to: ModuleId,
        predicate: Option<ReplacePredicate>,
    },
    Rename {
        group: GroupId,
        new_name: String,
    },
    NewModule(NewModulePayload),
    NinjaFileDeps(Vec<String>),
}

#[derive(Default)]
pub(crate) struct PassResults {
    pub(crate) errors: Vec<BlueprintError>,
    pub(crate) add_edges: Vec<(ModuleId, DepEdge)>,
    pub(crate) replacements: Vec<(ModuleId, ModuleId, Option<ReplacePredicate>)>,
    pub(crate) renames: Vec<(GroupId, String)>,
    pub(crate) new_modules: Vec<NewModulePayload>,
    pub(crate) ninja_deps: Vec<String>,
}

fn collect_pass_results(rx: mpsc::Receiver<PassMessage>) -> PassResults {
    let mut results = PassResults::default();
    for message in rx {
        match message {
            PassMessage::Errors(errors) => results.errors.extend(errors),
            PassMessage::AddEdge { on, edge } => results.add_edges.push((on, edge)),
            PassMessage::Replace {
                from,
                to,
                predicate,
            } => results.replacements.push((from, to, predicate)),
            PassMessage::Rename { group, new_name } => results.renames.push((group, new_name)),
            PassMessage::NewModule(payload) => results.new_modules.push(payload),
            PassMessage::NinjaFileDeps(deps) => results.ninja_deps.extend(deps),
        }
    }
    results
}

/// State shared by every mutator context class.
pub struct MutatorCore<'a> {
    pub(crate) core: &'a Context,
    pub(crate) module: &'a Arc<ModuleInfo>,
    pub(crate) config: &'a Config,
    pub(crate) mutator_name: &'a str,
    pub(crate) pass_index: usize,
    pub(crate) tx: mpsc::Sender<PassMessage>,
    pub(crate) errors: Vec<BlueprintError>,
    pub(crate) deps_modified: &'a AtomicBool,
}

/// Bookkeeping for alias registration after a split.
struct LastSplit {
    axis: String,
    old_variant: VariationMap,
    old_dependency_variant: VariationMap,
    new_ids: Vec<ModuleId>,
}

impl<'a> MutatorCore<'a> {
    pub fn module_name(&self) -> String {
        self.core.graph.read().module_name(self.module.id)
    }

    pub fn module_dir(&self) -> &str {
        &self.module.dir
    }

    pub fn module_type(&self) -> &str {
        &self.module.type_name
    }

    /// The variations of the module this mutator was invoked on.
    pub fn module_variant(&self) -> VariationMap {
        self.module.state.read().variant.clone()
    }

    pub fn config(&self) -> &Config {
        self.config
    }

    /// Reports an error against this module's definition.
    pub fn error(&mut self, message: impl fmt::Display) {
        self.module.state.write().failed = true;
        self.errors.push(BlueprintError::ModuleError {
            module: self.module_name(),
            message: message.to_string(),
            pos: self.module.pos.clone(),
        });
    }

    /// Whether this module has already collected errors.
    pub fn failed(&self) -> bool {
        self.module.state.read().failed
    }

    pub fn glob(
        &self,
        pattern: &str,
        excludes: &[String],
    ) -> Result<Vec<String>, BlueprintError> {
        self.core.glob(pattern, excludes)
    }

    pub fn visit_direct_deps(&self, mut f: impl FnMut(ModuleId, &DepTag)) {
        let edges = self.module.state.read().direct_deps.clone();
        for edge in edges {
            f(edge.module, &edge.tag);
        }
    }

    pub fn other_module_name(&self, module: ModuleId) -> String {
        self.core.graph.read().module_name(module)
    }

    pub fn other_module_type(&self, module: ModuleId) -> String {
        self.core.graph.read().module(module).type_name.clone()
    }

    pub fn other_module_exists(&self, name: &str) -> bool {
        self.core
            .names
            .read()
            .lookup(name, &self.module.dir)
            .is_some()
    }

    /// Runs `f` against this module's logic object.
    pub fn module_logic<R>(&self, f: impl FnOnce(&mut dyn Module) -> R) -> R {
        let mut state = self.module.state.write();
        let logic = state
            .logic
            .as_mut()
            .expect("module logic is gone: the module was split");
        f(logic.as_mut())
    }

    /// Runs `f` against this module's property records.
    pub fn mutate_properties<R>(&self, f: impl FnOnce(&mut [Box<dyn PropertyRecord>]) -> R) -> R {
        let mut state = self.module.state.write();
        f(&mut state.properties)
    }

    pub fn other_module_properties<R>(
        &self,
        module: ModuleId,
        f: impl FnOnce(&[Box<dyn PropertyRecord>]) -> R,
    ) -> R {
        let info = self.core.graph.read().module(module).clone();
        let state = info.state.read();
        f(&state.properties)
    }

    /// Reads a provider from any module whose access window has closed.
    pub fn module_provider<T: Any + Send + Sync>(
        &self,
        module: ModuleId,
        key: ProviderKey<T>,
    ) -> Option<Arc<T>> {
        self.core.read_provider(module, key)
    }

    /// Sets a provider on this module. The key must be tied to the
    /// running mutator.
    pub fn set_provider<T: Any + Send + Sync>(&self, key: ProviderKey<T>, value: T) {
        self.core
            .write_mutator_provider(self.module, key, value, self.mutator_name);
    }

    pub fn add_ninja_file_deps(&self, deps: &[String]) {
        let _ = self.tx.send(PassMessage::NinjaFileDeps(deps.to_vec()));
    }

    fn push_edge(&self, edge: DepEdge) {
        self.module.state.write().direct_deps.push(edge);
        self.deps_modified.store(true, Ordering::Relaxed);
    }

    /// Resolves `name` and appends an edge, recording or reporting
    /// failures per the missing-deps mode. Returns the resolved target so
    /// ordered callers can pause on it.
    fn add_dependency_edge(
        &mut self,
        tag: DepTag,
        name: &str,
        requested: &[Variation],
        far: bool,
    ) -> Option<ModuleId> {
        if is_base_tag(&tag) {
            panic!("the base dependency tag is reserved for the engine");
        }
        match self.core.resolve_dependency(self.module, name, requested, far) {
            Ok(Some(target)) => {
                let mut map = VariationMap::new();
                for v in requested {
                    map.insert(v.mutator.clone(), v.variation.clone());
                }
                self.push_edge(DepEdge {
                    module: target,
                    tag,
                    requested: map,
                    far,
                });
                Some(target)
            }
            Ok(None) => None,
            Err(error) => {
                self.module.state.write().failed = true;
                self.errors.push(error);
                None
            }
        }
    }

    /// Splits this module along a new axis named after the running
    /// mutator. The first variation keeps the existing logic object; the
    /// rest clone the property records. Returns the new variant ids in
    /// variation order.
    fn create_variations_impl(
        &mut self,
        variations: &[&str],
        local: bool,
        default_variation: Option<String>,
    ) -> (Vec<ModuleId>, LastSplit) {
        assert!(
            !variations.is_empty(),
            "create_variations requires at least one variation"
        );
        let axis = self.mutator_name.to_string();
        let parent = self.module;

        let (logic, properties, property_pos, old_variant, old_dependency_variant, edges, providers, missing)
            = {
            let mut state = parent.state.write();
            let logic = state
                .logic
                .take()
                .expect("module has already been split in this pass");
            (
                logic,
                std::mem::take(&mut state.properties),
                state.property_pos.clone(),
                state.variant.clone(),
                state.dependency_variant.clone(),
                state.direct_deps.clone(),
                state.providers.clone(),
                state.missing_deps.clone(),
            )
        };

        // Clone records for every variation but the first before the
        // originals move.
        let mut clones: Vec<Vec<Box<dyn PropertyRecord>>> = (1..variations.len())
            .map(|_| self.core.unpacker.clone_records(&properties))
            .collect();

        let mut graph = self.core.graph.write();
        let mut new_ids = Vec::with_capacity(variations.len());
        let mut first = Some((logic, properties));
        for variation in variations {
            let (logic, properties) = match first.take() {
                Some(original) => original,
                None => {
                    let (fresh_logic, _) = (parent.factory)();
                    (fresh_logic, clones.remove(0))
                }
            };
            let mut state =
                crate::module::ModuleState::new(logic, properties, property_pos.clone());
            state.variant = old_variant.clone();
            state.variant.insert(axis.clone(), variation.to_string());
            state.dependency_variant = old_dependency_variant.clone();
            if !local {
                state
                    .dependency_variant
                    .insert(axis.clone(), variation.to_string());
            }
            state.direct_deps = edges.clone();
            state.providers = providers.clone();
            state.missing_deps = missing.clone();
            state.mutators_done = self.pass_index + 1;
            new_ids.push(graph.add_module(
                parent.group,
                parent.type_name.clone(),
                parent.factory.clone(),
                parent.pos.clone(),
                parent.dir.clone(),
                state,
            ));
        }
        graph.apply_split(parent.id, new_ids.clone(), axis.clone(), default_variation);
        drop(graph);

        self.deps_modified.store(true, Ordering::Relaxed);
        let split = LastSplit {
            axis,
            old_variant,
            old_dependency_variant,
            new_ids: new_ids.clone(),
        };
        (new_ids, split)
    }
}

/// Context for early mutators: split-only, before dependency resolution.
pub struct EarlyMutatorContext<'a> {
    base: MutatorCore<'a>,
    default_variation: Option<String>,
    last_split: Option<LastSplit>,
}

/// Context for bottom-up mutators.
pub struct BottomUpMutatorContext<'a> {
    base: MutatorCore<'a>,
    pause: &'a PauseHandle<'a>,
    default_variation: Option<String>,
    last_split: Option<LastSplit>,
}

/// Context for top-down mutators.
pub struct TopDownMutatorContext<'a> {
    base: MutatorCore<'a>,
}

macro_rules! deref_base {
    ($ty:ident) => {
        impl<'a> Deref for $ty<'a> {
            type Target = MutatorCore<'a>;

            fn deref(&self) -> &Self::Target {
                &self.base
            }
        }

        impl<'a> DerefMut for $ty<'a> {
            fn deref_mut(&mut self) -> &mut Self::Target {
                &mut self.base
            }
        }
    };
}

deref_base!(EarlyMutatorContext);
deref_base!(BottomUpMutatorContext);
deref_base!(TopDownMutatorContext);

fn alias_variation_impl(core: &MutatorCore<'_>, split: &LastSplit, variation: &str) {
    let graph = &core.core.graph;
    let target = split
        .new_ids
        .iter()
        .copied()
        .find(|&id| {
            graph.read().module(id).state.read().variant.get(&split.axis) == Some(variation)
        })
        .unwrap_or_else(|| {
            panic!(
                "alias_variation: no variation {variation:?} on axis {:?}",
                split.axis
            )
        });
    let mut graph = graph.write();
    let group = graph.module(target).group;
    graph.group_mut(group).aliases.push(crate::module::Alias {
        variant: split.old_variant.clone(),
        dependency_variant: split.old_dependency_variant.clone(),
        target,
    });
}

impl EarlyMutatorContext<'_> {
    pub fn create_variations(&mut self, variations: &[&str]) -> Vec<ModuleId> {
        let default = self.default_variation.clone();
        let (ids, split) = self.base.create_variations_impl(variations, false, default);
        self.last_split = Some(split);
        ids
    }

    pub fn create_local_variations(&mut self, variations: &[&str]) -> Vec<ModuleId> {
        let default = self.default_variation.clone();
        let (ids, split) = self.base.create_variations_impl(variations, true, default);
        self.last_split = Some(split);
        ids
    }

    pub fn set_default_dependency_variation(&mut self, variation: Option<&str>) {
        self.default_variation = variation.map(str::to_string);
    }

    pub fn alias_variation(&mut self, variation: &str) {
        let split = self
            .last_split
            .as_ref()
            .expect("alias_variation requires a preceding create_variations");
        alias_variation_impl(&self.base, split, variation);
    }
}

impl BottomUpMutatorContext<'_> {
    /// Adds direct dependencies on the named modules and waits until each
    /// target has been visited by this mutator, preserving the bottom-up
    /// ordering guarantee for the remainder of this visit.
    pub fn add_dependency(&mut self, tag: DepTag, names: &[&str]) {
        for name in names {
            if let Some(target) = self.base.add_dependency_edge(tag.clone(), name, &[], false) {
                if self.pause.pause_until(target).is_err() {
                    return;
                }
            }
        }
    }

    /// Like `add_dependency`, with explicit variations overriding this
    /// module's own dependency descriptor.
    pub fn add_variation_dependencies(
        &mut self,
        variations: &[Variation],
        tag: DepTag,
        names: &[&str],
    ) {
        for name in names {
            if let Some(target) =
                self.base
                    .add_dependency_edge(tag.clone(), name, variations, false)
            {
                if self.pause.pause_until(target).is_err() {
                    return;
                }
            }
        }
    }

    /// Matches the named variations against candidates' self descriptors,
    /// ignoring axes this module does not name.
    pub fn add_far_variation_dependencies(
        &mut self,
        variations: &[Variation],
        tag: DepTag,
        names: &[&str],
    ) {
        for name in names {
            if let Some(target) =
                self.base
                    .add_dependency_edge(tag.clone(), name, variations, true)
            {
                if self.pause.pause_until(target).is_err() {
                    return;
                }
            }
        }
    }

    /// Queues an edge from the named module onto this one, applied when
    /// the pass ends.
    pub fn add_reverse_dependency(&mut self, tag: DepTag, name: &str) {
        if is_base_tag(&tag) {
            panic!("the base dependency tag is reserved for the engine");
        }
        match self.base.core.resolve_dependency(self.base.module, name, &[], false) {
            Ok(Some(target)) => {
                let _ = self.base.tx.send(PassMessage::AddEdge {
                    on: target,
                    edge: DepEdge {
                        module: self.base.module.id,
                        tag,
                        requested: VariationMap::new(),
                        far: false,
                    },
                });
            }
            Ok(None) => {}
            Err(error) => {
                self.base.module.state.write().failed = true;
                self.base.errors.push(error);
            }
        }
    }

    pub fn create_variations(&mut self, variations: &[&str]) -> Vec<ModuleId> {
        let default = self.default_variation.clone();
        let (ids, split) = self.base.create_variations_impl(variations, false, default);
        self.last_split = Some(split);
        ids
    }

    pub fn create_local_variations(&mut self, variations: &[&str]) -> Vec<ModuleId> {
        let default = self.default_variation.clone();
        let (ids, split) = self.base.create_variations_impl(variations, true, default);
        self.last_split = Some(split);
        ids
    }

    /// Sets the variation edges from axis-unaware dependers default to.
    /// Must be called before `create_variations`.
    pub fn set_default_dependency_variation(&mut self, variation: Option<&str>) {
        self.default_variation = variation.map(str::to_string);
    }

    /// Registers an alias from this module's pre-split descriptor to the
    /// named variation, preserving dependers that do not know the new
    /// axis.
    pub fn alias_variation(&mut self, variation: &str) {
        let split = self
            .last_split
            .as_ref()
            .expect("alias_variation requires a preceding create_variations");
        alias_variation_impl(&self.base, split, variation);
    }

    /// Runs `f` against the property records of a variant created by the
    /// preceding `create_variations` call.
    pub fn variant_properties<R>(
        &self,
        variant: ModuleId,
        f: impl FnOnce(&mut [Box<dyn PropertyRecord>]) -> R,
    ) -> R {
        let info = self.base.core.graph.read().module(variant).clone();
        let mut state = info.state.write();
        f(&mut state.properties)
    }

    /// Renames this module's group, applied when the pass ends.
    pub fn rename(&mut self, new_name: &str) {
        let _ = self.base.tx.send(PassMessage::Rename {
            group: self.base.module.group,
            new_name: new_name.to_string(),
        });
    }

    /// Rewrites every dependency on the named module (in the variant
    /// matching this module's descriptor) to point at this module.
    pub fn replace_dependencies(&mut self, name: &str) {
        self.replace_dependencies_if(name, None);
    }

    pub fn replace_dependencies_if(&mut self, name: &str, predicate: Option<ReplacePredicate>) {
        match self.base.core.resolve_dependency(self.base.module, name, &[], false) {
            Ok(Some(from)) => {
                let _ = self.base.tx.send(PassMessage::Replace {
                    from,
                    to: self.base.module.id,
                    predicate,
                });
            }
            Ok(None) => {}
            Err(error) => {
                self.base.module.state.write().failed = true;
                self.base.errors.push(error);
            }
        }
    }
}

impl TopDownMutatorContext<'_> {
    /// Queues far-variation dependencies, applied when the pass ends so
    /// the targets' top-down visits are not reordered.
    pub fn add_far_variation_dependencies(
        &mut self,
        variations: &[Variation],
        tag: DepTag,
        names: &[&str],
    ) {
        if is_base_tag(&tag) {
            panic!("the base dependency tag is reserved for the engine");
        }
        for name in names {
            match self
                .base
                .core
                .resolve_dependency(self.base.module, name, variations, true)
            {
                Ok(Some(target)) => {
                    let mut map = VariationMap::new();
                    for v in variations {
                        map.insert(v.mutator.clone(), v.variation.clone());
                    }
                    let _ = self.base.tx.send(PassMessage::AddEdge {
                        on: self.base.module.id,
                        edge: DepEdge {
                            module: target,
                            tag: tag.clone(),
                            requested: map,
                            far: true,
                        },
                    });
                }
                Ok(None) => {}
                Err(error) => {
                    self.base.module.state.write().failed = true;
                    self.base.errors.push(error);
                }
            }
        }
    }

    /// Creates a new module of a registered type, added to the graph when
    /// the pass ends. `setup` runs against the fresh property records.
    pub fn create_module(
        &mut self,
        type_name: &str,
        name: &str,
        setup: impl FnOnce(&mut [Box<dyn PropertyRecord>]),
    ) {
        let Some(factory) = self.base.core.factories.get(type_name).cloned() else {
            self.base.errors.push(BlueprintError::UnknownModuleType {
                type_name: type_name.to_string(),
                pos: self.base.module.pos.clone(),
            });
            return;
        };
        let (logic, mut properties) = factory();
        setup(&mut properties);
        let _ = self.base.tx.send(PassMessage::NewModule(NewModulePayload {
            type_name: type_name.to_string(),
            name: name.to_string(),
            logic,
            properties,
            dir: self.base.module.dir.clone(),
            pos: self.base.module.pos.clone(),
        }));
    }

    pub fn visit_deps_depth_first(&self, dedup: bool, f: &mut dyn FnMut(ModuleId)) {
        let graph = self.base.core.graph.read();
        graph.visit_deps_depth_first(self.base.module.id, dedup, &mut |m| f(m.id));
    }

    pub fn walk_deps(
        &self,
        down: &mut dyn FnMut(ModuleId, ModuleId) -> bool,
        up: &mut dyn FnMut(ModuleId, ModuleId),
    ) {
        let graph = self.base.core.graph.read();
        graph.walk_deps(
            self.base.module.id,
            &mut |child, parent| down(child.id, parent.id),
            &mut |child, parent| up(child.id, parent.id),
        );
    }
}

impl Context {
    /// Runs one registered mutator over the whole graph, applies its
    /// aggregated results, and refreshes aliases, edges, and dependency
    /// links.
    pub(crate) fn run_mutator_pass(&self, index: usize, config: &Config) -> Vec<BlueprintError> {
        let name = self.mutators[index].name.clone();
        let kind = self.mutators[index].kind;
        let func = self.mutators[index].func.clone();
        let parallel = self.mutators[index].parallel;
        debug!(mutator = %name, ?kind, parallel, "starting mutator pass");

        let (order, modules) = match kind {
            MutatorKind::Early => (VisitOrder::Unordered, self.modules_in_name_order()),
            MutatorKind::BottomUp => (VisitOrder::BottomUp, self.modules_in_sorted_order()),
            MutatorKind::TopDown => (VisitOrder::TopDown, self.modules_in_sorted_order()),
        };
        let limit = if parallel { self.options.parallelism } else { 1 };

        let (tx, rx) = mpsc::channel::<PassMessage>();
        let aggregator = std::thread::spawn(move || collect_pass_results(rx));
        let tx = Mutex::new(tx);

        let deps_modified = AtomicBool::new(false);
        let error_count = AtomicUsize::new(0);
        let max_errors = self.options.max_errors;

        let describe = |id: ModuleId| self.graph.read().module_desc(id);
        let visit = |module: &Arc<ModuleInfo>, pause: &PauseHandle<'_>| -> bool {
            if error_count.load(Ordering::Relaxed) >= max_errors {
                return CANCEL;
            }
            // Edges to targets split earlier in this pass are re-resolved
            // before the mutator observes them; failures are reported in
            // the authoritative end-of-pass sweep.
            self.fix_module_edges(module, false);

            module.state.write().current_mutator = Some(name.clone());
            let sender = tx.lock().clone();
            let base = MutatorCore {
                core: self,
                module,
                config,
                mutator_name: &name,
                pass_index: index,
                tx: sender.clone(),
                errors: Vec::new(),
                deps_modified: &deps_modified,
            };

            let mut errors;
            match &func {
                MutatorFunc::Early(f) => {
                    let mut ctx = EarlyMutatorContext {
                        base,
                        default_variation: None,
                        last_split: None,
                    };
                    let result = catch_unwind(AssertUnwindSafe(|| f(&mut ctx)));
                    errors = std::mem::take(&mut ctx.base.errors);
                    if let Err(payload) = result {
                        errors.push(panicked(&name, &describe(module.id), payload));
                    }
                }
                MutatorFunc::BottomUp(f) => {
                    let mut ctx = BottomUpMutatorContext {
                        base,
                        pause,
                        default_variation: None,
                        last_split: None,
                    };
                    let result = catch_unwind(AssertUnwindSafe(|| f(&mut ctx)));
                    errors = std::mem::take(&mut ctx.base.errors);
                    if let Err(payload) = result {
                        errors.push(panicked(&name, &describe(module.id), payload));
                    }
                }
                MutatorFunc::TopDown(f) => {
                    let mut ctx = TopDownMutatorContext { base };
                    let result = catch_unwind(AssertUnwindSafe(|| f(&mut ctx)));
                    errors = std::mem::take(&mut ctx.base.errors);
                    if let Err(payload) = result {
                        errors.push(panicked(&name, &describe(module.id), payload));
                    }
                }
            }

            {
                let mut state = module.state.write();
                state.current_mutator = None;
                state.mutators_done = index + 1;
            }

            let new_errors = errors.len();
            if new_errors > 0 {
                let _ = sender.send(PassMessage::Errors(errors));
            }
            let total = error_count.fetch_add(new_errors, Ordering::Relaxed) + new_errors;
            if total >= max_errors {
                CANCEL
            } else {
                CONTINUE
            }
        };

        let scheduler_errors = parallel_visit(&modules, order, limit, &describe, visit);
        drop(tx);
        let results = aggregator.join().expect("pass aggregator panicked");

        let mut errors = results.errors;
        errors.extend(scheduler_errors);
        let structurally_modified = self.apply_pass_results(
            results.add_edges,
            results.replacements,
            results.renames,
            results.new_modules,
            results.ninja_deps,
            index,
            &mut errors,
        );

        self.graph.write().update_aliases();
        errors.extend(self.fix_all_edges());
        if deps_modified.load(Ordering::Relaxed) || structurally_modified {
            errors.extend(self.update_dependency_links());
        }
        debug!(mutator = %name, errors = errors.len(), "finished mutator pass");
        errors
    }
}

fn panicked(
    mutator: &str,
    module: &str,
    payload: Box<dyn Any + Send>,
) -> BlueprintError {
    BlueprintError::PanickedCallback {
        context: format!("mutator {mutator:?} for module {module}"),
        message: crate::visitor::panic_message(payload),
    }
}

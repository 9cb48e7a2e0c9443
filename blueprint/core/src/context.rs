// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The orchestrator: owns the module graph and drives the staged pipeline
//! register → parse → resolve → generate → emit.
//!
//! The `Context` is the only owner of graph structure. During parallel
//! passes it is shared immutably; per-variant state hides behind each
//! variant's own lock, and structural edits are funneled through the
//! mutator engine's aggregator. Phase methods take `&mut self`, which
//! statically rules out overlapping phases.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::ast::{Assignment, ModuleDef, ParsedFile, Parser, StaticParser};
use crate::error::{BlueprintError, Position};
use crate::fs::{FileSystem, MemFileSystem};
use crate::glob::{glob_cache_key, GlobCache};
use crate::live::LiveTracker;
use crate::module::{
    base_dep_tag, DepEdge, DepTag, GroupId, Module, ModuleActions, ModuleFactory, ModuleId,
    ModuleInfo, ModuleState, Variation, VariationMap,
};
use crate::mutator::{MutatorFunc, MutatorInfo, MutatorKind, NewModulePayload, ReplacePredicate};
use crate::name_interface::{NameInterface, SimpleNameInterface};
use crate::ninja::{BuildDef, BuildParams, NinjaString};
use crate::properties::{BagUnpacker, PropertyRecord, PropertyUnpacker};
use crate::provider::{self, ProviderKey};
use crate::scope::{
    EntityScope, PackageContext, Rule, RuleParams, Variable, VariableLookup,
};
use crate::singleton::{Singleton, SingletonInfo};
use crate::visitor::{parallel_visit, VisitOrder, CANCEL, CONTINUE};
use crate::writer::NinjaWriter;

/// The embedder's build configuration, threaded opaquely through every
/// phase and callback.
pub type Config = Arc<dyn Any + Send + Sync>;

/// Engine tuning knobs.
#[derive(Clone, Debug)]
pub struct Options {
    /// Concurrent visitors in parallel passes.
    pub parallelism: usize,
    /// Per-pass error cap; a pass short-circuits once it is reached.
    pub max_errors: usize,
    /// Bound on concurrently open blueprint files during parse.
    pub file_open_limit: usize,
    /// File name looked for in directories nominated by `subdirs`.
    pub blueprints_file_name: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            parallelism: num_cpus::get(),
            max_errors: 10,
            file_open_limit: 200,
            blueprints_file_name: "Blueprints".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Registration,
    Parsed,
    Resolved,
    Generated,
}

pub struct Context {
    pub(crate) options: Options,
    pub(crate) fs: Arc<dyn FileSystem>,
    pub(crate) parser: Arc<dyn Parser>,
    pub(crate) unpacker: Arc<dyn PropertyUnpacker>,
    pub(crate) factories: IndexMap<String, ModuleFactory>,
    pub(crate) mutators: Vec<MutatorInfo>,
    pub(crate) singletons: Vec<Arc<SingletonInfo>>,
    pub(crate) graph: RwLock<crate::module::ModuleGraph>,
    pub(crate) names: RwLock<Box<dyn NameInterface>>,
    pub(crate) glob_cache: GlobCache,
    pub(crate) live: Mutex<LiveTracker>,
    pub(crate) allow_missing_deps: bool,
    pub(crate) ignore_unknown_module_types: bool,
    ninja_build_dir: Mutex<Option<String>>,
    subninjas: Mutex<Vec<String>>,
    ninja_file_deps: Mutex<BTreeSet<String>>,
    required_ninja_version: String,
    phase: Phase,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Self {
            options: Options::default(),
            fs: Arc::new(MemFileSystem::new()),
            parser: Arc::new(StaticParser::new()),
            unpacker: Arc::new(BagUnpacker),
            factories: IndexMap::new(),
            mutators: Vec::new(),
            singletons: Vec::new(),
            graph: RwLock::new(crate::module::ModuleGraph::new()),
            names: RwLock::new(Box::new(SimpleNameInterface::new())),
            glob_cache: GlobCache::new(),
            live: Mutex::new(LiveTracker::new()),
            allow_missing_deps: false,
            ignore_unknown_module_types: false,
            ninja_build_dir: Mutex::new(None),
            subninjas: Mutex::new(Vec::new()),
            ninja_file_deps: Mutex::new(BTreeSet::new()),
            required_ninja_version: "1.7.0".to_string(),
            phase: Phase::Registration,
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    pub fn set_filesystem(&mut self, fs: impl FileSystem + 'static) {
        self.fs = Arc::new(fs);
    }

    pub fn set_parser(&mut self, parser: impl Parser + 'static) {
        self.parser = Arc::new(parser);
    }

    pub fn set_property_unpacker(&mut self, unpacker: impl PropertyUnpacker + 'static) {
        self.unpacker = Arc::new(unpacker);
    }

    pub fn set_name_interface(&mut self, names: impl NameInterface + 'static) {
        *self.names.write() = Box::new(names);
    }

    /// Record unresolved dependency names on their modules instead of
    /// failing; unhandled ones re-raise at generation.
    pub fn set_allow_missing_dependencies(&mut self, allow: bool) {
        self.allow_missing_deps = allow;
    }

    /// Silently drop definitions whose type has no registered factory.
    pub fn set_ignore_unknown_module_types(&mut self, ignore: bool) {
        self.ignore_unknown_module_types = ignore;
    }

    pub fn register_module_type(
        &mut self,
        name: &str,
        factory: impl Fn() -> (Box<dyn Module>, Vec<Box<dyn PropertyRecord>>) + Send + Sync + 'static,
    ) {
        assert_eq!(self.phase, Phase::Registration, "registration after parse");
        if self
            .factories
            .insert(name.to_string(), Arc::new(factory))
            .is_some()
        {
            panic!("duplicate module type {name:?}");
        }
    }

    pub fn register_singleton_type(
        &mut self,
        name: &str,
        factory: impl Fn() -> Box<dyn Singleton> + Send + Sync + 'static,
    ) {
        assert_eq!(self.phase, Phase::Registration, "registration after parse");
        let factory: crate::singleton::SingletonFactory = Arc::new(factory);
        self.singletons
            .push(SingletonInfo::new(name, &factory, false));
    }

    /// Registers a singleton that runs during resolve, before any
    /// mutator. Pre-singletons typically declare shared globals.
    pub fn register_pre_singleton_type(
        &mut self,
        name: &str,
        factory: impl Fn() -> Box<dyn Singleton> + Send + Sync + 'static,
    ) {
        assert_eq!(self.phase, Phase::Registration, "registration after parse");
        let factory: crate::singleton::SingletonFactory = Arc::new(factory);
        self.singletons.push(SingletonInfo::new(name, &factory, true));
    }

    pub fn register_early_mutator(
        &mut self,
        name: &str,
        f: impl Fn(&mut crate::mutator::EarlyMutatorContext<'_>) + Send + Sync + 'static,
    ) -> &mut MutatorInfo {
        self.register_mutator(name, MutatorKind::Early, MutatorFunc::Early(Arc::new(f)))
    }

    pub fn register_bottom_up_mutator(
        &mut self,
        name: &str,
        f: impl Fn(&mut crate::mutator::BottomUpMutatorContext<'_>) + Send + Sync + 'static,
    ) -> &mut MutatorInfo {
        self.register_mutator(
            name,
            MutatorKind::BottomUp,
            MutatorFunc::BottomUp(Arc::new(f)),
        )
    }

    pub fn register_top_down_mutator(
        &mut self,
        name: &str,
        f: impl Fn(&mut crate::mutator::TopDownMutatorContext<'_>) + Send + Sync + 'static,
    ) -> &mut MutatorInfo {
        self.register_mutator(name, MutatorKind::TopDown, MutatorFunc::TopDown(Arc::new(f)))
    }

    fn register_mutator(
        &mut self,
        name: &str,
        kind: MutatorKind,
        func: MutatorFunc,
    ) -> &mut MutatorInfo {
        assert_eq!(self.phase, Phase::Registration, "registration after parse");
        if self.mutators.iter().any(|m| m.name == name) {
            panic!("duplicate mutator {name:?}");
        }
        self.mutators.push(MutatorInfo {
            name: name.to_string(),
            kind,
            parallel: false,
            func,
        });
        self.mutators.last_mut().unwrap()
    }

    pub fn set_ninja_build_dir(&self, dir: &str) {
        let mut build_dir = self.ninja_build_dir.lock();
        if build_dir.is_none() {
            *build_dir = Some(dir.to_string());
        }
    }

    pub fn add_subninja(&self, path: &str) {
        self.subninjas.lock().push(path.to_string());
    }

    /// Every file the emitted manifest depends on: parsed blueprint files
    /// plus recorded glob expansions, deduplicated and sorted.
    pub fn ninja_file_deps(&self) -> Vec<String> {
        self.ninja_file_deps.lock().iter().cloned().collect()
    }

    pub(crate) fn glob(
        &self,
        pattern: &str,
        excludes: &[String],
    ) -> Result<Vec<String>, BlueprintError> {
        self.glob_cache
            .glob(self.fs.as_ref(), pattern, excludes)
            .map(|r| r.matches)
    }

    pub(crate) fn glob_with_deps(
        &self,
        pattern: &str,
        excludes: &[String],
    ) -> Result<Vec<String>, BlueprintError> {
        let matches = self.glob(pattern, excludes)?;
        self.ninja_file_deps
            .lock()
            .insert(glob_cache_key(pattern, excludes));
        Ok(matches)
    }

    // ------------------------------------------------------------------
    // Parse
    // ------------------------------------------------------------------

    /// Parses the given blueprint files plus everything they nominate via
    /// `subdirs` / `optional_subdirs` / `build` assignments. Ancestor
    /// files are always handled before the files they nominate. Returns
    /// the files read, for the embedder's regeneration dependencies.
    pub fn parse_file_list(
        &mut self,
        files: &[&str],
        _config: &Config,
    ) -> (Vec<String>, Vec<BlueprintError>) {
        assert_eq!(self.phase, Phase::Registration, "parse may only run once");
        info!(files = files.len(), "parsing blueprint files");
        let mut errors = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut wave: Vec<String> = Vec::new();
        for f in files {
            if seen.insert(f.to_string()) {
                wave.push(f.to_string());
            }
        }
        let mut parsed_paths = Vec::new();

        while !wave.is_empty() {
            let results = self.parse_files_bounded(&wave);
            let mut next = Vec::new();
            for (path, result) in results {
                parsed_paths.push(path.clone());
                match result {
                    Ok(file) => self.handle_parsed_file(&path, &file, &mut next, &mut errors),
                    Err(file_errors) => errors.extend(file_errors),
                }
            }
            wave = next
                .into_iter()
                .filter(|f| seen.insert(f.clone()))
                .collect();
            if errors.len() >= self.options.max_errors {
                break;
            }
        }

        {
            let mut deps = self.ninja_file_deps.lock();
            deps.extend(parsed_paths.iter().cloned());
        }
        self.phase = Phase::Parsed;
        parsed_paths.sort();
        (parsed_paths, errors)
    }

    /// Parses one wave of files with bounded concurrency.
    fn parse_files_bounded(
        &self,
        paths: &[String],
    ) -> Vec<(String, Result<ParsedFile, Vec<BlueprintError>>)> {
        let limit = self.options.file_open_limit.max(1);
        let mut out = Vec::with_capacity(paths.len());
        for chunk in paths.chunks(limit) {
            let results: Vec<Result<ParsedFile, Vec<BlueprintError>>> =
                std::thread::scope(|scope| {
                    let handles: Vec<_> = chunk
                        .iter()
                        .map(|path| {
                            scope.spawn(move || {
                                let contents = self.fs.open(path).map_err(|e| {
                                    vec![BlueprintError::Io {
                                        path: path.clone(),
                                        source: e,
                                    }]
                                })?;
                                self.parser.parse(path, &contents)
                            })
                        })
                        .collect();
                    handles
                        .into_iter()
                        .map(|h| h.join().expect("parser thread panicked"))
                        .collect()
                });
            out.extend(chunk.iter().cloned().zip(results));
        }
        out
    }

    fn handle_parsed_file(
        &mut self,
        path: &str,
        file: &ParsedFile,
        next: &mut Vec<String>,
        errors: &mut Vec<BlueprintError>,
    ) {
        let dir = Path::new(path)
            .parent()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        for def in &file.defs {
            match def {
                crate::ast::Definition::Module(module_def) => {
                    self.process_module_def(&dir, module_def, errors);
                }
                crate::ast::Definition::Assignment(assignment) => match assignment.name.as_str() {
                    "subdirs" => self.subdir_files(&dir, assignment, false, next, errors),
                    "optional_subdirs" => self.subdir_files(&dir, assignment, true, next, errors),
                    "build" => self.build_files(&dir, assignment, next, errors),
                    _ => {}
                },
            }
        }
    }

    fn subdir_files(
        &self,
        dir: &str,
        assignment: &Assignment,
        optional: bool,
        next: &mut Vec<String>,
        errors: &mut Vec<BlueprintError>,
    ) {
        let Some(entries) = assignment.value.as_string_list() else {
            errors.push(BlueprintError::PropertyTypeMismatch {
                name: assignment.name.clone(),
                expected: "list of strings",
                found: assignment.value.kind_name(),
                pos: assignment.pos.clone(),
            });
            return;
        };
        for entry in entries {
            let pattern = join_path(dir, &entry);
            let dirs = if has_glob_meta(&pattern) {
                match self.fs.glob(&pattern) {
                    Ok(matches) => matches
                        .into_iter()
                        .filter(|m| self.fs.lstat(m).map(|i| i.is_dir).unwrap_or(false))
                        .collect(),
                    Err(e) => {
                        errors.push(e);
                        continue;
                    }
                }
            } else {
                if !self.fs.exists(&pattern) {
                    if !optional {
                        errors.push(BlueprintError::Io {
                            path: pattern,
                            source: io::Error::new(
                                io::ErrorKind::NotFound,
                                "subdirectory does not exist",
                            ),
                        });
                    }
                    continue;
                }
                vec![pattern]
            };
            for subdir in dirs {
                let child = join_path(&subdir, &self.options.blueprints_file_name);
                if self.fs.exists(&child) {
                    next.push(child);
                }
            }
        }
    }

    fn build_files(
        &self,
        dir: &str,
        assignment: &Assignment,
        next: &mut Vec<String>,
        errors: &mut Vec<BlueprintError>,
    ) {
        let Some(entries) = assignment.value.as_string_list() else {
            errors.push(BlueprintError::PropertyTypeMismatch {
                name: assignment.name.clone(),
                expected: "list of strings",
                found: assignment.value.kind_name(),
                pos: assignment.pos.clone(),
            });
            return;
        };
        for entry in entries {
            let pattern = join_path(dir, &entry);
            if has_glob_meta(&pattern) {
                match self.fs.glob(&pattern) {
                    Ok(matches) => next.extend(matches),
                    Err(e) => errors.push(e),
                }
            } else if self.fs.exists(&pattern) {
                next.push(pattern);
            } else {
                errors.push(BlueprintError::Io {
                    path: pattern,
                    source: io::Error::new(io::ErrorKind::NotFound, "build file does not exist"),
                });
            }
        }
    }

    fn process_module_def(
        &mut self,
        dir: &str,
        def: &ModuleDef,
        errors: &mut Vec<BlueprintError>,
    ) {
        let Some(factory) = self.factories.get(&def.type_name).cloned() else {
            if !self.ignore_unknown_module_types {
                errors.push(BlueprintError::UnknownModuleType {
                    type_name: def.type_name.clone(),
                    pos: def.pos.clone(),
                });
            }
            return;
        };
        let (logic, mut properties) = factory();
        let property_pos = match self.unpacker.unpack(def, &mut properties) {
            Ok(positions) => positions,
            Err(unpack_errors) => {
                errors.extend(unpack_errors);
                return;
            }
        };
        let Some(name) = def.name() else {
            errors.push(BlueprintError::MissingModuleName {
                type_name: def.type_name.clone(),
                pos: def.pos.clone(),
            });
            return;
        };
        let name = name.to_string();
        let state = ModuleState::new(logic, properties, property_pos);
        if let Err(e) = self.install_module(
            &def.type_name,
            &name,
            factory,
            state,
            dir,
            &def.pos,
        ) {
            errors.push(e);
        }
    }

    fn install_module(
        &self,
        type_name: &str,
        name: &str,
        factory: ModuleFactory,
        state: ModuleState,
        dir: &str,
        pos: &Position,
    ) -> Result<ModuleId, BlueprintError> {
        let mut names = self.names.write();
        let mut graph = self.graph.write();
        let group = graph.add_group(name);
        names.register(name, group, dir, pos)?;
        Ok(graph.add_module(
            group,
            type_name.to_string(),
            factory,
            pos.clone(),
            dir.to_string(),
            state,
        ))
    }

    // ------------------------------------------------------------------
    // Resolve
    // ------------------------------------------------------------------

    /// Initializes providers, runs pre-singletons, resolves dynamic
    /// dependencies, runs every registered mutator in order, and freezes
    /// logic objects by replacing them with fresh clones of their
    /// property records.
    pub fn resolve_dependencies(&mut self, config: &Config) -> (Vec<String>, Vec<BlueprintError>) {
        assert_eq!(self.phase, Phase::Parsed, "resolve requires a parsed graph");
        info!("resolving dependencies");

        // Early mutators run before anything else; the stable partition
        // keeps registration order within each class.
        self.mutators.sort_by_key(|m| m.kind != MutatorKind::Early);

        let mut errors = Vec::new();
        let pre_singletons: Vec<Arc<SingletonInfo>> = self
            .singletons
            .iter()
            .filter(|s| s.pre)
            .cloned()
            .collect();
        for singleton in pre_singletons {
            errors.extend(self.run_singleton(&singleton, config));
        }
        if !errors.is_empty() {
            return (self.ninja_file_deps(), errors);
        }

        for index in 0..self.mutators.len() {
            if self.mutators[index].kind != MutatorKind::Early {
                continue;
            }
            let pass_errors = self.run_mutator_pass(index, config);
            if !pass_errors.is_empty() {
                return (self.ninja_file_deps(), pass_errors);
            }
        }

        errors.extend(self.resolve_dynamic_dependencies(config));
        if !errors.is_empty() {
            return (self.ninja_file_deps(), errors);
        }

        errors.extend(self.update_dependency_links());
        if !errors.is_empty() {
            return (self.ninja_file_deps(), errors);
        }

        for index in 0..self.mutators.len() {
            if self.mutators[index].kind == MutatorKind::Early {
                continue;
            }
            let pass_errors = self.run_mutator_pass(index, config);
            if !pass_errors.is_empty() {
                return (self.ninja_file_deps(), pass_errors);
            }
        }

        self.clone_module_records();
        self.phase = Phase::Resolved;
        (self.ninja_file_deps(), errors)
    }

    /// Collects extra dependency names from each logic object before any
    /// registered mutator runs; edges carry the reserved base tag.
    fn resolve_dynamic_dependencies(&mut self, config: &Config) -> Vec<BlueprintError> {
        let mut errors = Vec::new();
        for module in self.modules_in_name_order() {
            let Some(mut logic) = module.state.write().logic.take() else {
                continue;
            };
            let mut ctx = DynamicDependerContext {
                core: self,
                module: &module,
                config,
                errors: Vec::new(),
            };
            let result = catch_unwind(AssertUnwindSafe(|| ctx_dynamic_deps(&mut ctx, &mut logic)));
            let names = match result {
                Ok(names) => names,
                Err(payload) => {
                    errors.push(BlueprintError::PanickedCallback {
                        context: format!(
                            "dynamic dependencies for module {}",
                            self.graph.read().module_desc(module.id)
                        ),
                        message: crate::visitor::panic_message(payload),
                    });
                    Vec::new()
                }
            };
            errors.append(&mut ctx.errors);
            module.state.write().logic = Some(logic);

            for name in names {
                match self.resolve_dependency(&module, &name, &[], false) {
                    Ok(Some(target)) => {
                        module.state.write().direct_deps.push(DepEdge {
                            module: target,
                            tag: base_dep_tag(),
                            requested: VariationMap::new(),
                            far: false,
                        });
                    }
                    Ok(None) => {}
                    Err(e) => errors.push(e),
                }
            }
            if errors.len() >= self.options.max_errors {
                break;
            }
        }
        errors
    }

    /// Resolves `name` for `depender`, applying the missing-deps mode.
    /// `Ok(None)` means the miss was recorded on the module.
    pub(crate) fn resolve_dependency(
        &self,
        depender: &Arc<ModuleInfo>,
        name: &str,
        requested: &[Variation],
        far: bool,
    ) -> Result<Option<ModuleId>, BlueprintError> {
        let group = self.names.read().lookup(name, &depender.dir);
        let Some(group) = group else {
            if self.allow_missing_deps {
                depender.state.write().missing_deps.push(name.to_string());
                return Ok(None);
            }
            return Err(BlueprintError::MissingDependency {
                module: self.graph.read().module_name(depender.id),
                dep: name.to_string(),
                pos: depender.pos.clone(),
            });
        };

        let graph = self.graph.read();
        let wanted = if far {
            VariationMap::new().merged_with(requested)
        } else {
            depender
                .state
                .read()
                .dependency_variant
                .merged_with(requested)
        };
        match graph.resolve_in_group(group, &wanted, far) {
            crate::module::ResolvedDep::Module(target) => {
                let target_info = graph.module(target);
                if target_info.group == depender.group {
                    if target == depender.id {
                        return Err(BlueprintError::SelfDependency {
                            name: name.to_string(),
                            pos: depender.pos.clone(),
                        });
                    }
                    let members = &graph.group_of(depender.id).modules;
                    let target_index = members.iter().position(|&m| m == target);
                    let self_index = members.iter().position(|&m| m == depender.id);
                    if let (Some(t), Some(s)) = (target_index, self_index) {
                        if t > s {
                            return Err(BlueprintError::LaterVariantDependency {
                                name: name.to_string(),
                                variant: target_info.state.read().variant.display(),
                                pos: depender.pos.clone(),
                            });
                        }
                    }
                }
                Ok(Some(target))
            }
            crate::module::ResolvedDep::Missing { available } => {
                if self.allow_missing_deps {
                    drop(graph);
                    depender.state.write().missing_deps.push(name.to_string());
                    return Ok(None);
                }
                Err(BlueprintError::MissingVariant {
                    module: graph.module_name(depender.id),
                    dep: name.to_string(),
                    variant: wanted.display(),
                    available,
                    pos: depender.pos.clone(),
                })
            }
        }
    }

    /// Re-resolves this module's edges whose targets were superseded by a
    /// split. With `report` unset, failures are left for the
    /// authoritative end-of-pass sweep.
    pub(crate) fn fix_module_edges(
        &self,
        module: &Arc<ModuleInfo>,
        report: bool,
    ) -> Vec<BlueprintError> {
        let graph = self.graph.read();
        let (edges, depender_variant) = {
            let state = module.state.read();
            (state.direct_deps.clone(), state.dependency_variant.clone())
        };

        let mut rewrites: Vec<(usize, ModuleId)> = Vec::new();
        let mut failures: Vec<(usize, String, String, Vec<String>)> = Vec::new();
        for (i, edge) in edges.iter().enumerate() {
            if !graph.module(edge.module).state.read().is_superseded() {
                continue;
            }
            match graph.resolve_superseded_edge(edge, &depender_variant, report) {
                Ok(new_target) => rewrites.push((i, new_target)),
                // Failures are only reported by the end-of-pass sweep.
                Err(_) if !report => {}
                Err(available) => {
                    let dep_name = graph.module_name(edge.module);
                    let wanted = {
                        let mut wanted = depender_variant.clone();
                        wanted.merge_from(&edge.requested);
                        wanted
                    };
                    failures.push((i, dep_name, wanted.display(), available));
                }
            }
        }

        let module_name = graph.module_name(module.id);
        drop(graph);

        let mut errors = Vec::new();
        let mut state = module.state.write();
        for (i, target) in rewrites {
            state.direct_deps[i].module = target;
        }
        if report {
            let mut remove: Vec<usize> = Vec::new();
            for (i, dep_name, wanted, available) in failures {
                if self.allow_missing_deps {
                    state.missing_deps.push(dep_name);
                    remove.push(i);
                } else {
                    state.failed = true;
                    errors.push(BlueprintError::MissingVariant {
                        module: module_name.clone(),
                        dep: dep_name,
                        variant: wanted,
                        available,
                        pos: module.pos.clone(),
                    });
                }
            }
            for i in remove.into_iter().rev() {
                state.direct_deps.remove(i);
            }
        }
        errors
    }

    pub(crate) fn fix_all_edges(&self) -> Vec<BlueprintError> {
        let modules: Vec<Arc<ModuleInfo>> = self.graph.read().modules.to_vec();
        let mut errors = Vec::new();
        for module in modules {
            if module.state.read().is_superseded() {
                continue;
            }
            errors.extend(self.fix_module_edges(&module, true));
            if errors.len() >= self.options.max_errors {
                break;
            }
        }
        errors
    }

    pub(crate) fn update_dependency_links(&self) -> Vec<BlueprintError> {
        let order = self.names.read().sorted_groups();
        self.graph.write().update_dependencies(&order)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn apply_pass_results(
        &self,
        add_edges: Vec<(ModuleId, DepEdge)>,
        replacements: Vec<(ModuleId, ModuleId, Option<ReplacePredicate>)>,
        renames: Vec<(GroupId, String)>,
        new_modules: Vec<NewModulePayload>,
        ninja_deps: Vec<String>,
        pass_index: usize,
        errors: &mut Vec<BlueprintError>,
    ) -> bool {
        let mut modified = false;

        for (on, edge) in add_edges {
            if edge.module == on {
                let graph = self.graph.read();
                errors.push(BlueprintError::SelfDependency {
                    name: graph.module_name(on),
                    pos: graph.module(on).pos.clone(),
                });
                continue;
            }
            let info = self.graph.read().module(on).clone();
            info.state.write().direct_deps.push(edge);
            modified = true;
        }

        if !replacements.is_empty() {
            let modules: Vec<Arc<ModuleInfo>> = self.graph.read().modules.to_vec();
            for (from, to, predicate) in replacements {
                for module in &modules {
                    if module.id == to || module.state.read().is_superseded() {
                        continue;
                    }
                    let mut state = module.state.write();
                    for edge in &mut state.direct_deps {
                        if edge.module == from
                            && predicate.as_ref().map_or(true, |p| p(&edge.tag))
                        {
                            edge.module = to;
                            modified = true;
                        }
                    }
                }
            }
        }

        for (group, new_name) in renames {
            let (old_name, pos) = {
                let graph = self.graph.read();
                let group_data = graph.group(group);
                let pos = group_data
                    .modules
                    .first()
                    .map(|&m| graph.module(m).pos.clone())
                    .unwrap_or_default();
                (group_data.name.clone(), pos)
            };
            match self.names.write().rename(&old_name, &new_name, group, &pos) {
                Ok(()) => self.graph.write().group_mut(group).name = new_name,
                Err(e) => errors.push(e),
            }
        }

        for payload in new_modules {
            let factory = self
                .factories
                .get(&payload.type_name)
                .cloned()
                .expect("new module of unregistered type");
            let mut state = ModuleState::new(payload.logic, payload.properties, IndexMap::new());
            state.mutators_done = pass_index + 1;
            match self.install_module(
                &payload.type_name,
                &payload.name,
                factory,
                state,
                &payload.dir,
                &payload.pos,
            ) {
                Ok(_) => modified = true,
                Err(e) => errors.push(e),
            }
        }

        if !ninja_deps.is_empty() {
            self.ninja_file_deps.lock().extend(ninja_deps);
        }

        modified
    }

    /// Replaces every logic object with a fresh instance and deep-clones
    /// the property records, freezing generate-phase inputs.
    fn clone_module_records(&self) {
        debug!("cloning module records");
        let modules: Vec<Arc<ModuleInfo>> = self.graph.read().modules.to_vec();
        for module in modules {
            let mut state = module.state.write();
            if state.is_superseded() {
                continue;
            }
            let (fresh_logic, _) = (module.factory)();
            state.logic = Some(fresh_logic);
            let cloned = self.unpacker.clone_records(&state.properties);
            state.properties = cloned;
        }
    }

    pub(crate) fn modules_in_name_order(&self) -> Vec<Arc<ModuleInfo>> {
        let names = self.names.read();
        let graph = self.graph.read();
        let mut modules = Vec::new();
        for group in names.sorted_groups() {
            for &id in &graph.group(group).modules {
                let module = graph.module(id);
                if !module.state.read().is_superseded() {
                    modules.push(module.clone());
                }
            }
        }
        modules
    }

    pub(crate) fn modules_in_sorted_order(&self) -> Vec<Arc<ModuleInfo>> {
        let graph = self.graph.read();
        graph
            .modules_sorted
            .iter()
            .map(|&id| graph.module(id).clone())
            .filter(|m| !m.state.read().is_superseded())
            .collect()
    }

    // ------------------------------------------------------------------
    // Providers
    // ------------------------------------------------------------------

    pub(crate) fn read_provider<T: Any + Send + Sync>(
        &self,
        module: ModuleId,
        key: ProviderKey<T>,
    ) -> Option<Arc<T>> {
        let info = provider::provider_info(key.id());
        let module = self.graph.read().module(module).clone();
        let state = module.state.read();
        match &info.mutator {
            Some(mutator) => {
                let index = self
                    .mutators
                    .iter()
                    .position(|m| &m.name == mutator)
                    .unwrap_or_else(|| {
                        panic!("provider misuse: mutator {mutator:?} is not registered")
                    });
                if state.mutators_done <= index {
                    panic!(
                        "provider misuse: reading {} before mutator {mutator:?} finished",
                        info.type_name
                    );
                }
            }
            None => {
                if !state.generated {
                    panic!(
                        "provider misuse: reading {} before generate finished",
                        info.type_name
                    );
                }
            }
        }
        provider::load(&state.providers, key)
    }

    pub(crate) fn write_mutator_provider<T: Any + Send + Sync>(
        &self,
        module: &Arc<ModuleInfo>,
        key: ProviderKey<T>,
        value: T,
        current_mutator: &str,
    ) {
        let info = provider::provider_info(key.id());
        match info.mutator.as_deref() {
            Some(owner) if owner == current_mutator => {}
            _ => panic!(
                "provider misuse: {} may not be set by mutator {current_mutator:?}",
                info.type_name
            ),
        }
        let desc = self.graph.read().module_desc(module.id);
        let mut state = module.state.write();
        provider::store(&mut state.providers, key, value, &desc);
    }

    pub(crate) fn write_generate_provider<T: Any + Send + Sync>(
        &self,
        module: &Arc<ModuleInfo>,
        key: ProviderKey<T>,
        value: T,
    ) {
        let info = provider::provider_info(key.id());
        if let Some(owner) = &info.mutator {
            panic!(
                "provider misuse: {} belongs to mutator {owner:?} and may not be set during generate",
                info.type_name
            );
        }
        let desc = self.graph.read().module_desc(module.id);
        let mut state = module.state.write();
        provider::store(&mut state.providers, key, value, &desc);
    }

    // ------------------------------------------------------------------
    // Generate
    // ------------------------------------------------------------------

    /// Runs per-module generate calls in bottom-up parallel order, then
    /// singletons sequentially, folding everything into the live tracker.
    pub fn prepare_build_actions(&mut self, config: &Config) -> (Vec<String>, Vec<BlueprintError>) {
        assert_eq!(self.phase, Phase::Resolved, "generate requires resolve");
        info!("generating build actions");
        let modules = self.modules_in_sorted_order();
        let shared_errors: Mutex<Vec<BlueprintError>> = Mutex::new(Vec::new());
        let error_count = AtomicUsize::new(0);
        let max_errors = self.options.max_errors;

        let this: &Context = self;
        let describe = |id: ModuleId| this.graph.read().module_desc(id);
        let visit = |module: &Arc<ModuleInfo>, _pause: &crate::visitor::PauseHandle<'_>| -> bool {
            let local_errors = this.generate_module(module, config);
            let n = local_errors.len();
            if n > 0 {
                shared_errors.lock().extend(local_errors);
            }
            let total = error_count.fetch_add(n, Ordering::Relaxed) + n;
            if total >= max_errors {
                CANCEL
            } else {
                CONTINUE
            }
        };
        let scheduler_errors = parallel_visit(
            &modules,
            VisitOrder::BottomUp,
            self.options.parallelism,
            &describe,
            visit,
        );

        let mut errors = shared_errors.into_inner();
        errors.extend(scheduler_errors);
        if !errors.is_empty() {
            return (self.ninja_file_deps(), errors);
        }

        let singletons: Vec<Arc<SingletonInfo>> = self
            .singletons
            .iter()
            .filter(|s| !s.pre)
            .cloned()
            .collect();
        for singleton in singletons {
            errors.extend(self.run_singleton(&singleton, config));
            if errors.len() >= max_errors {
                break;
            }
        }
        if !errors.is_empty() {
            return (self.ninja_file_deps(), errors);
        }

        self.check_variable_cycles();
        self.phase = Phase::Generated;
        (self.ninja_file_deps(), errors)
    }

    fn generate_module(&self, module: &Arc<ModuleInfo>, config: &Config) -> Vec<BlueprintError> {
        let Some(mut logic) = module.state.write().logic.take() else {
            return Vec::new();
        };
        let mut ctx = ModuleContext {
            core: self,
            module,
            config,
            recorder: ActionRecorder::new(self.module_scope_prefix(module)),
            errors: Vec::new(),
            ninja_deps: Vec::new(),
        };
        let result = catch_unwind(AssertUnwindSafe(|| {
            logic.generate_build_actions(&mut ctx)
        }));
        let ModuleContext {
            recorder,
            mut errors,
            ninja_deps,
            ..
        } = ctx;
        if let Err(payload) = result {
            errors.push(BlueprintError::PanickedCallback {
                context: format!("generate for module {}", self.graph.read().module_desc(module.id)),
                message: crate::visitor::panic_message(payload),
            });
        }

        // A module may declare during its generate call that it tolerates
        // its missing dependencies; otherwise they re-raise here.
        let (missing, handled) = {
            let state = module.state.read();
            (state.missing_deps.clone(), state.handled_missing_deps)
        };
        if !missing.is_empty() && !handled {
            let module_name = self.graph.read().module_name(module.id);
            errors.extend(missing.into_iter().map(|dep| {
                BlueprintError::MissingDependency {
                    module: module_name.clone(),
                    dep,
                    pos: module.pos.clone(),
                }
            }));
        }

        let actions = recorder.into_actions();
        {
            let mut live = self.live.lock();
            for def in &actions.build_defs {
                live.add_build_def(def);
            }
        }
        {
            let mut state = module.state.write();
            state.logic = Some(logic);
            state.actions = actions;
            state.generated = true;
        }
        if !ninja_deps.is_empty() {
            self.ninja_file_deps.lock().extend(ninja_deps);
        }
        errors
    }

    pub(crate) fn run_singleton(
        &self,
        info: &Arc<SingletonInfo>,
        config: &Config,
    ) -> Vec<BlueprintError> {
        debug!(singleton = %info.name, pre = info.pre, "running singleton");
        let mut singleton = info.singleton.lock();
        let mut ctx = SingletonContext {
            core: self,
            name: &info.name,
            config,
            recorder: ActionRecorder::new(sanitize_ninja_name(&info.name)),
            errors: Vec::new(),
        };
        let result = catch_unwind(AssertUnwindSafe(|| {
            singleton.generate_build_actions(&mut ctx)
        }));
        let SingletonContext {
            recorder,
            mut errors,
            ..
        } = ctx;
        if let Err(payload) = result {
            errors.push(BlueprintError::PanickedCallback {
                context: format!("singleton {:?}", info.name),
                message: crate::visitor::panic_message(payload),
            });
        }
        let actions = recorder.into_actions();
        {
            let mut live = self.live.lock();
            for def in &actions.build_defs {
                live.add_build_def(def);
            }
        }
        *info.actions.lock() = actions;
        errors
    }

    /// A reference cycle among global variable values is unrecoverable:
    /// the manifest cannot order their definitions.
    fn check_variable_cycles(&self) {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }
        fn visit(
            variable: &Variable,
            marks: &mut std::collections::HashMap<u64, Mark>,
            path: &mut Vec<String>,
        ) {
            match marks.get(&variable.id()) {
                Some(Mark::Done) => return,
                Some(Mark::InProgress) => {
                    path.push(variable.full_name());
                    panic!("variable reference cycle: {}", path.join(" -> "));
                }
                None => {}
            }
            marks.insert(variable.id(), Mark::InProgress);
            path.push(variable.full_name());
            if let Some(value) = variable.value() {
                for reference in value.variables() {
                    if reference.value().is_some() {
                        visit(reference, marks, path);
                    }
                }
            }
            path.pop();
            marks.insert(variable.id(), Mark::Done);
        }

        let live = self.live.lock();
        let mut marks = std::collections::HashMap::new();
        for variable in live.live_global_variables() {
            visit(&variable, &mut marks, &mut Vec::new());
        }
    }

    fn module_scope_prefix(&self, module: &Arc<ModuleInfo>) -> String {
        let names = self.names.read();
        let graph = self.graph.read();
        let unique = names.unique_name(&graph.group_of(module.id).name);
        let variant = module.variant_name();
        let raw = if variant.is_empty() {
            unique
        } else {
            format!("{unique}.{variant}")
        };
        sanitize_ninja_name(&raw)
    }

    // ------------------------------------------------------------------
    // Emit
    // ------------------------------------------------------------------

    /// Serializes the manifest. Deterministic: consecutive calls on the
    /// same prepared context produce identical bytes.
    pub fn write_build_file(&self, out: &mut dyn io::Write) -> io::Result<()> {
        assert_eq!(self.phase, Phase::Generated, "emit requires generate");
        // Work on a copy of the tracker: emission consumes liveness
        // marks as it promotes locals.
        let mut live = self.live.lock().clone();
        let mut w = NinjaWriter::new(out);

        self.write_header(&mut w, &live)?;
        w.blank_line()?;
        w.variable("ninja_required_version", &self.required_ninja_version, 0)?;

        let subninjas = self.subninjas.lock().clone();
        if !subninjas.is_empty() {
            w.blank_line()?;
            for path in &subninjas {
                w.subninja(path)?;
            }
        }

        self.write_globals(&mut w, &live)?;

        if let Some(build_dir) = self.ninja_build_dir.lock().as_ref() {
            w.blank_line()?;
            w.variable("builddir", build_dir, 0)?;
        }

        let names = self.names.read();
        let graph = self.graph.read();
        for group_id in names.sorted_groups() {
            let group = graph.group(group_id);
            let unique = names.unique_name(&group.name);
            for &module_id in &group.modules {
                let module = graph.module(module_id);
                let state = module.state.read();
                w.blank_line()?;
                w.banner()?;
                w.comment(&format!("Module:  {unique}"))?;
                let variant = state.variant.variant_name();
                if !variant.is_empty() {
                    w.comment(&format!("Variant: {variant}"))?;
                }
                w.comment(&format!("Type:    {}", module.type_name))?;
                w.comment(&format!("Defined: {}", module.pos))?;
                write_actions(&mut w, &state.actions, &mut live)?;
            }
        }

        for singleton in &self.singletons {
            let actions = singleton.actions.lock();
            if actions.build_defs.is_empty()
                && actions.local_variables.is_empty()
                && actions.local_rules.is_empty()
            {
                continue;
            }
            w.blank_line()?;
            w.banner()?;
            w.comment(&format!("Singleton: {}", singleton.name))?;
            write_actions(&mut w, &actions, &mut live)?;
        }

        Ok(())
    }

    fn write_header(&self, w: &mut NinjaWriter<'_>, live: &LiveTracker) -> io::Result<()> {
        let mut packages: BTreeSet<String> = BTreeSet::new();
        for variable in live.live_global_variables() {
            if let Some(pkg) = variable.package() {
                packages.insert(pkg.path().to_string());
            }
        }
        for rule in live.live_global_rules() {
            if let Some(pkg) = rule.package() {
                packages.insert(pkg.path().to_string());
            }
        }
        for pool in live.live_pools() {
            if let Some(pkg) = pool.package() {
                packages.insert(pkg.path().to_string());
            }
        }

        let stars = "*".repeat(76);
        w.comment(&stars)?;
        w.comment("***        This file is generated and should not be edited        ***")?;
        w.comment(&stars)?;
        if !packages.is_empty() {
            w.comment("")?;
            w.comment(
                "This file contains variables, rules, and pools with name prefixes \
                 indicating they were generated by the following packages:",
            )?;
            w.comment("")?;
            for pkg in packages {
                w.comment(&format!("    {pkg}"))?;
            }
        }
        Ok(())
    }

    fn write_globals(&self, w: &mut NinjaWriter<'_>, live: &LiveTracker) -> io::Result<()> {
        // Variables first, each emitted after the variables its value
        // references; the resolve-time cycle check guarantees termination.
        let variables = live.live_global_variables();
        let mut emitted: BTreeSet<u64> = BTreeSet::new();
        if !variables.is_empty() {
            w.blank_line()?;
        }
        for variable in &variables {
            self.write_variable_with_deps(w, variable, &mut emitted)?;
        }

        for pool in live.live_pools() {
            w.blank_line()?;
            if let Some(comment) = &pool.params().comment {
                w.comment(comment)?;
            }
            w.pool(&pool.full_name())?;
            w.variable("depth", &pool.params().depth.to_string(), 1)?;
        }

        for rule in live.live_global_rules() {
            w.blank_line()?;
            write_rule(w, &rule)?;
        }
        Ok(())
    }

    fn write_variable_with_deps(
        &self,
        w: &mut NinjaWriter<'_>,
        variable: &Variable,
        emitted: &mut BTreeSet<u64>,
    ) -> io::Result<()> {
        if !emitted.insert(variable.id()) {
            return Ok(());
        }
        let Some(value) = variable.value() else {
            return Ok(());
        };
        for reference in value.variables() {
            if reference.is_global() {
                self.write_variable_with_deps(w, reference, emitted)?;
            }
        }
        w.variable(&variable.full_name(), &value.value_string(), 0)
    }
}

fn ctx_dynamic_deps(
    ctx: &mut DynamicDependerContext<'_>,
    logic: &mut Box<dyn Module>,
) -> Vec<String> {
    logic.dynamic_dependencies(ctx)
}

fn write_rule(w: &mut NinjaWriter<'_>, rule: &Rule) -> io::Result<()> {
    w.rule(&rule.full_name())?;
    let Some(params) = rule.params() else {
        return Ok(());
    };
    if let Some(pool) = &params.pool {
        w.variable("pool", &pool.full_name(), 1)?;
    }
    w.variable("command", &params.command.value_string(), 1)?;
    if let Some(depfile) = &params.depfile {
        w.variable("depfile", &depfile.value_string(), 1)?;
    }
    if let Some(deps) = &params.deps {
        w.variable("deps", &deps.value_string(), 1)?;
    }
    if let Some(description) = &params.description {
        w.variable("description", &description.value_string(), 1)?;
    }
    if params.generator {
        w.variable("generator", "true", 1)?;
    }
    if params.restat {
        w.variable("restat", "true", 1)?;
    }
    if let Some(rspfile) = &params.rspfile {
        w.variable("rspfile", &rspfile.value_string(), 1)?;
    }
    if let Some(rspfile_content) = &params.rspfile_content {
        w.variable("rspfile_content", &rspfile_content.value_string(), 1)?;
    }
    Ok(())
}

fn write_actions(
    w: &mut NinjaWriter<'_>,
    actions: &ModuleActions,
    live: &mut LiveTracker,
) -> io::Result<()> {
    for variable in &actions.local_variables {
        // Locals referenced by a build statement are promoted into the
        // manifest proper; dead ones disappear.
        if live.remove_variable_if_live(variable) {
            if let Some(value) = variable.value() {
                w.variable(&variable.full_name(), &value.value_string(), 0)?;
            }
        }
    }
    for rule in &actions.local_rules {
        if live.remove_rule_if_live(rule) {
            write_rule(w, rule)?;
        }
    }
    for def in &actions.build_defs {
        w.blank_line()?;
        if let Some(comment) = &def.comment {
            w.comment(comment)?;
        }
        let paths = |list: &[NinjaString]| -> Vec<String> {
            list.iter().map(NinjaString::path_string).collect()
        };
        w.build(
            &paths(&def.outputs),
            &paths(&def.implicit_outputs),
            &def.rule.full_name(),
            &paths(&def.inputs),
            &paths(&def.implicits),
            &paths(&def.order_only),
        )?;
        for (arg, value) in &def.args {
            w.variable(arg.name(), &value.value_string(), 1)?;
        }
    }
    Ok(())
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn has_glob_meta(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn sanitize_ninja_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Records the ninja output of one module or singleton while its
/// generate callback runs.
pub(crate) struct ActionRecorder {
    scope_prefix: String,
    locals: IndexMap<String, Variable>,
    local_rules: Vec<Rule>,
    build_defs: Vec<BuildDef>,
}

struct RecorderRuleLookup<'a> {
    pkg: &'a Arc<PackageContext>,
    locals: &'a IndexMap<String, Variable>,
    args: &'a [String],
}

impl VariableLookup for RecorderRuleLookup<'_> {
    fn lookup(&self, name: &str) -> Option<Variable> {
        if name == "in" || name == "out" {
            return Some(Variable::new(
                EntityScope::Builtin,
                name.to_string(),
                None,
            ));
        }
        if self.args.iter().any(|a| a == name) {
            return Some(Variable::new(EntityScope::RuleArg, name.to_string(), None));
        }
        if let Some(local) = self.locals.get(name) {
            return Some(local.clone());
        }
        self.pkg.lookup_variable(name)
    }
}

impl ActionRecorder {
    fn new(scope_prefix: String) -> Self {
        Self {
            scope_prefix,
            locals: IndexMap::new(),
            local_rules: Vec::new(),
            build_defs: Vec::new(),
        }
    }

    fn variable(
        &mut self,
        pkg: &Arc<PackageContext>,
        name: &str,
        value: &str,
    ) -> Result<(), String> {
        let lookup = crate::scope::ModuleLookup {
            pkg,
            locals: &self.locals,
        };
        let parsed = NinjaString::parse(&lookup, value)?;
        let variable = Variable::new(EntityScope::Local, name.to_string(), Some(parsed));
        self.locals.insert(name.to_string(), variable);
        Ok(())
    }

    fn rule(
        &mut self,
        pkg: &Arc<PackageContext>,
        name: &str,
        params: RuleParams,
        args: &[&str],
    ) -> Result<Rule, String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let lookup = RecorderRuleLookup {
            pkg,
            locals: &self.locals,
            args: &args,
        };
        let parse = |s: &str| NinjaString::parse(&lookup, s);
        let parsed = crate::scope::ParsedRuleParams {
            command: parse(&params.command)?,
            depfile: params.depfile.as_deref().map(parse).transpose()?,
            deps: params.deps.as_deref().map(parse).transpose()?,
            description: params.description.as_deref().map(parse).transpose()?,
            generator: params.generator,
            pool: params.pool.clone(),
            restat: params.restat,
            rspfile: params.rspfile.as_deref().map(parse).transpose()?,
            rspfile_content: params.rspfile_content.as_deref().map(parse).transpose()?,
        };
        let rule = Rule::new_local(
            format!("{}.{name}", self.scope_prefix),
            args,
            parsed,
        );
        self.local_rules.push(rule.clone());
        Ok(rule)
    }

    fn build(&mut self, pkg: &Arc<PackageContext>, params: BuildParams) -> Result<(), String> {
        let lookup = crate::scope::ModuleLookup {
            pkg,
            locals: &self.locals,
        };
        let def = BuildDef::parse(&lookup, params)?;
        self.build_defs.push(def);
        Ok(())
    }

    fn into_actions(self) -> ModuleActions {
        ModuleActions {
            local_variables: self.locals.into_values().collect(),
            local_rules: self.local_rules,
            build_defs: self.build_defs,
        }
    }
}

/// Context passed to each logic object's generate call.
pub struct ModuleContext<'a> {
    core: &'a Context,
    module: &'a Arc<ModuleInfo>,
    config: &'a Config,
    recorder: ActionRecorder,
    errors: Vec<BlueprintError>,
    ninja_deps: Vec<String>,
}

impl ModuleContext<'_> {
    pub fn module_name(&self) -> String {
        self.core.graph.read().module_name(self.module.id)
    }

    pub fn module_dir(&self) -> &str {
        &self.module.dir
    }

    pub fn module_type(&self) -> &str {
        &self.module.type_name
    }

    /// The variant's short name, empty for unsplit modules.
    pub fn module_subdir(&self) -> String {
        self.module.variant_name()
    }

    pub fn config(&self) -> &Config {
        self.config
    }

    pub fn error(&mut self, message: impl fmt::Display) {
        self.module.state.write().failed = true;
        self.errors.push(BlueprintError::ModuleError {
            module: self.module_name(),
            message: message.to_string(),
            pos: self.module.pos.clone(),
        });
    }

    pub fn failed(&self) -> bool {
        self.module.state.read().failed
    }

    /// Read-only access to this module's property records. The records
    /// were frozen by the post-mutator clone; generate must not reshape
    /// them.
    pub fn properties<R>(&self, f: impl FnOnce(&[Box<dyn PropertyRecord>]) -> R) -> R {
        let state = self.module.state.read();
        f(&state.properties)
    }

    pub fn glob(&self, pattern: &str, excludes: &[String]) -> Result<Vec<String>, BlueprintError> {
        self.core.glob(pattern, excludes)
    }

    /// Globs and records the expansion as a manifest regeneration
    /// dependency.
    pub fn glob_with_deps(
        &mut self,
        pattern: &str,
        excludes: &[String],
    ) -> Result<Vec<String>, BlueprintError> {
        self.core.glob_with_deps(pattern, excludes)
    }

    /// Defines a module-scoped variable usable in later values.
    pub fn variable(&mut self, pkg: &Arc<PackageContext>, name: &str, value: &str) {
        if let Err(message) = self.recorder.variable(pkg, name, value) {
            self.error(message);
        }
    }

    /// Defines a module-scoped rule.
    pub fn rule(
        &mut self,
        pkg: &Arc<PackageContext>,
        name: &str,
        params: RuleParams,
        args: &[&str],
    ) -> Option<Rule> {
        match self.recorder.rule(pkg, name, params, args) {
            Ok(rule) => Some(rule),
            Err(message) => {
                self.error(message);
                None
            }
        }
    }

    /// Emits one build statement.
    pub fn build(&mut self, pkg: &Arc<PackageContext>, params: BuildParams) {
        if let Err(message) = self.recorder.build(pkg, params) {
            self.error(message);
        }
    }

    pub fn visit_direct_deps(&self, mut f: impl FnMut(ModuleId, &DepTag)) {
        let edges = self.module.state.read().direct_deps.clone();
        for edge in edges {
            f(edge.module, &edge.tag);
        }
    }

    pub fn visit_deps_depth_first(&self, dedup: bool, f: &mut dyn FnMut(ModuleId)) {
        let graph = self.core.graph.read();
        graph.visit_deps_depth_first(self.module.id, dedup, &mut |m| f(m.id));
    }

    pub fn walk_deps(
        &self,
        down: &mut dyn FnMut(ModuleId, ModuleId) -> bool,
        up: &mut dyn FnMut(ModuleId, ModuleId),
    ) {
        let graph = self.core.graph.read();
        graph.walk_deps(
            self.module.id,
            &mut |child, parent| down(child.id, parent.id),
            &mut |child, parent| up(child.id, parent.id),
        );
    }

    /// Visits every live variant of this module's group, in creation
    /// order.
    pub fn visit_all_module_variants(&self, mut f: impl FnMut(ModuleId)) {
        let graph = self.core.graph.read();
        for &id in &graph.group_of(self.module.id).modules {
            f(id);
        }
    }

    /// Whether this variant is the last of its group, which is the
    /// conventional place to emit group-wide actions.
    pub fn final_module(&self) -> bool {
        let graph = self.core.graph.read();
        graph.group_of(self.module.id).modules.last() == Some(&self.module.id)
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

    pub fn module_provider<T: Any + Send + Sync>(
        &self,
        module: ModuleId,
        key: ProviderKey<T>,
    ) -> Option<Arc<T>> {
        self.core.read_provider(module, key)
    }

    /// Sets a generate-phase provider on this module.
    pub fn set_provider<T: Any + Send + Sync>(&self, key: ProviderKey<T>, value: T) {
        self.core.write_generate_provider(self.module, key, value);
    }

    pub fn add_ninja_file_deps(&mut self, deps: &[String]) {
        self.ninja_deps.extend(deps.iter().cloned());
    }

    /// The dependency names recorded as missing on this module.
    pub fn missing_dependencies(&self) -> Vec<String> {
        self.module.state.read().missing_deps.clone()
    }

    /// Declares that this module tolerates its missing dependencies;
    /// without this the engine re-raises them as errors.
    pub fn handle_missing_dependencies(&self) {
        self.module.state.write().handled_missing_deps = true;
    }
}

/// Context passed to singleton generate calls.
pub struct SingletonContext<'a> {
    core: &'a Context,
    name: &'a str,
    config: &'a Config,
    recorder: ActionRecorder,
    errors: Vec<BlueprintError>,
}

impl SingletonContext<'_> {
    pub fn config(&self) -> &Config {
        self.config
    }

    pub fn error(&mut self, message: impl fmt::Display) {
        self.errors.push(BlueprintError::SingletonError {
            singleton: self.name.to_string(),
            message: message.to_string(),
        });
    }

    pub fn variable(&mut self, pkg: &Arc<PackageContext>, name: &str, value: &str) {
        if let Err(message) = self.recorder.variable(pkg, name, value) {
            self.error(message);
        }
    }

    pub fn rule(
        &mut self,
        pkg: &Arc<PackageContext>,
        name: &str,
        params: RuleParams,
        args: &[&str],
    ) -> Option<Rule> {
        match self.recorder.rule(pkg, name, params, args) {
            Ok(rule) => Some(rule),
            Err(message) => {
                self.error(message);
                None
            }
        }
    }

    pub fn build(&mut self, pkg: &Arc<PackageContext>, params: BuildParams) {
        if let Err(message) = self.recorder.build(pkg, params) {
            self.error(message);
        }
    }

    /// Visits every live module variant in deterministic name order.
    pub fn visit_all_modules(&self, mut f: impl FnMut(ModuleId)) {
        for module in self.core.modules_in_name_order() {
            f(module.id);
        }
    }

    pub fn module_name(&self, module: ModuleId) -> String {
        self.core.graph.read().module_name(module)
    }

    pub fn module_type(&self, module: ModuleId) -> String {
        self.core.graph.read().module(module).type_name.clone()
    }

    pub fn module_dir(&self, module: ModuleId) -> String {
        self.core.graph.read().module(module).dir.clone()
    }

    pub fn module_provider<T: Any + Send + Sync>(
        &self,
        module: ModuleId,
        key: ProviderKey<T>,
    ) -> Option<Arc<T>> {
        self.core.read_provider(module, key)
    }

    pub fn glob(&self, pattern: &str, excludes: &[String]) -> Result<Vec<String>, BlueprintError> {
        self.core.glob(pattern, excludes)
    }

    pub fn add_ninja_file_deps(&self, deps: &[String]) {
        self.core.ninja_file_deps.lock().extend(deps.iter().cloned());
    }

    pub fn set_ninja_build_dir(&self, dir: &str) {
        self.core.set_ninja_build_dir(dir);
    }

    pub fn add_subninja(&self, path: &str) {
        self.core.add_subninja(path);
    }
}

/// Context passed to `dynamic_dependencies`.
pub struct DynamicDependerContext<'a> {
    core: &'a Context,
    module: &'a Arc<ModuleInfo>,
    config: &'a Config,
    errors: Vec<BlueprintError>,
}

impl DynamicDependerContext<'_> {
    pub fn module_name(&self) -> String {
        self.core.graph.read().module_name(self.module.id)
    }

    pub fn module_dir(&self) -> &str {
        &self.module.dir
    }

    pub fn config(&self) -> &Config {
        self.config
    }

    pub fn error(&mut self, message: impl fmt::Display) {
        self.module.state.write().failed = true;
        self.errors.push(BlueprintError::ModuleError {
            module: self.module_name(),
            message: message.to_string(),
            pos: self.module.pos.clone(),
        });
    }
}

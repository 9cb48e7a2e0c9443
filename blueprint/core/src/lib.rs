// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! A meta-build engine: reads declarative module definitions delivered as
//! an abstract syntax tree, runs embedder-registered mutators over the
//! resulting module graph, and emits a ninja build manifest for a
//! downstream executor.
//!
//! The embedding program (the primary builder) supplies the domain logic:
//! it registers module factories, mutators, and singletons on a
//! [`Context`], then drives the phases in order: parse, resolve,
//! generate, emit. The engine owns the graph data model (variant
//! splitting, aliasing, dependency edges), the dependency-ordered
//! parallel scheduler with its pause/resume primitive, the typed provider
//! store, and deterministic manifest assembly. The configuration-language
//! parser, the property reflection layer, and the filesystem are seams
//! the embedder may replace.

mod ast;
mod context;
mod error;
mod fs;
mod glob;
mod live;
mod module;
mod mutator;
mod name_interface;
mod ninja;
mod properties;
mod provider;
mod scope;
mod singleton;
mod visitor;
mod writer;

#[cfg(test)]
mod tests;

pub use ast::{Assignment, Definition, ModuleDef, ParsedFile, Parser, Property, StaticParser, Value};
pub use context::{
    Config, Context, DynamicDependerContext, ModuleContext, Options, SingletonContext,
};
pub use error::{BlueprintError, BlueprintResult, Position};
pub use fs::{FileInfo, FileSystem, MemFileSystem, OsFileSystem};
pub use module::{
    DepTag, DependencyTag, GroupId, Module, ModuleFactory, ModuleId, Variation, VariationMap,
};
pub use mutator::{
    BottomUpMutatorContext, EarlyMutatorContext, MutatorCore, MutatorInfo, TopDownMutatorContext,
};
pub use name_interface::{NameInterface, SimpleNameInterface};
pub use ninja::BuildParams;
pub use properties::{
    record_as_bag, record_as_bag_mut, BagUnpacker, FieldAccess, PropertyBag, PropertyKind,
    PropertyRecord, PropertyUnpacker, PropertyValue,
};
pub use provider::{new_mutator_provider, new_provider, ProviderKey};
pub use scope::{phony_rule, PackageContext, Pool, PoolParams, Rule, RuleKind, RuleParams, Variable};
pub use singleton::{Singleton, SingletonFactory};

// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Named ninja entities and the scopes that resolve references to them.
//!
//! Variables, rules, and pools are registered against a [`PackageContext`]
//! and carry fully qualified names derived from the package path. Scopes
//! form a lexical chain: a package scope resolves its own public entities
//! plus imported packages; a rule scope layers argument placeholders on
//! top; a module scope layers module-local definitions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::ninja::NinjaString;

static NEXT_ENTITY_ID: AtomicU64 = AtomicU64::new(1);

fn next_entity_id() -> u64 {
    NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed)
}

/// Where a named entity was defined, which decides its qualified name and
/// whether it is emitted in the globals section.
#[derive(Debug, Clone)]
pub(crate) enum EntityScope {
    /// Public entity of a package context; qualified as `g.<pkg>.<name>`.
    Package(Arc<PackageContext>),
    /// Module-local definition, emitted inside the module's block.
    Local,
    /// Rule argument placeholder; never defined, only referenced.
    RuleArg,
    /// Predefined by ninja itself (`in`, `out`, the `phony` rule).
    Builtin,
}

/// A rule is either predefined by the downstream executor or scoped to the
/// package that declared it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Builtin,
    PackageScoped,
}

#[derive(Debug)]
pub(crate) struct VariableData {
    pub(crate) id: u64,
    pub(crate) scope: EntityScope,
    pub(crate) name: String,
    /// `None` for placeholders (rule args and builtins).
    pub(crate) value: Option<NinjaString>,
}

/// Cheap-to-clone handle to a variable definition. Identity (the `id`
/// field) is what the live tracker and emitter key on.
#[derive(Clone, Debug)]
pub struct Variable(pub(crate) Arc<VariableData>);

impl Variable {
    pub(crate) fn new(scope: EntityScope, name: String, value: Option<NinjaString>) -> Self {
        Self(Arc::new(VariableData {
            id: next_entity_id(),
            scope,
            name,
            value,
        }))
    }

    pub(crate) fn id(&self) -> u64 {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub(crate) fn value(&self) -> Option<&NinjaString> {
        self.0.value.as_ref()
    }

    /// The name this variable is referenced and defined by in the manifest.
    pub fn full_name(&self) -> String {
        match &self.0.scope {
            EntityScope::Package(pkg) => format!("g.{}.{}", pkg.qualified(), self.0.name),
            EntityScope::Local | EntityScope::RuleArg | EntityScope::Builtin => {
                self.0.name.clone()
            }
        }
    }

    pub(crate) fn is_global(&self) -> bool {
        matches!(self.0.scope, EntityScope::Package(_))
    }

    pub(crate) fn package(&self) -> Option<&Arc<PackageContext>> {
        match &self.0.scope {
            EntityScope::Package(pkg) => Some(pkg),
            _ => None,
        }
    }
}

/// Parameters accepted when declaring a rule. String fields are parsed into
/// interpolated values against the rule's scope at declaration time.
#[derive(Debug, Clone, Default)]
pub struct RuleParams {
    pub command: String,
    pub depfile: Option<String>,
    pub deps: Option<String>,
    pub description: Option<String>,
    pub generator: bool,
    pub pool: Option<Pool>,
    pub restat: bool,
    pub rspfile: Option<String>,
    pub rspfile_content: Option<String>,
}

/// Rule parameters after parsing, ready for emission.
#[derive(Debug)]
pub(crate) struct ParsedRuleParams {
    pub(crate) command: NinjaString,
    pub(crate) depfile: Option<NinjaString>,
    pub(crate) deps: Option<NinjaString>,
    pub(crate) description: Option<NinjaString>,
    pub(crate) generator: bool,
    pub(crate) pool: Option<Pool>,
    pub(crate) restat: bool,
    pub(crate) rspfile: Option<NinjaString>,
    pub(crate) rspfile_content: Option<NinjaString>,
}

#[derive(Debug)]
pub(crate) struct RuleData {
    pub(crate) id: u64,
    pub(crate) scope: EntityScope,
    pub(crate) name: String,
    pub(crate) kind: RuleKind,
    /// Argument placeholders callers may bind per build statement.
    pub(crate) args: Vec<String>,
    pub(crate) params: Option<ParsedRuleParams>,
}

#[derive(Clone, Debug)]
pub struct Rule(pub(crate) Arc<RuleData>);

impl Rule {
    pub(crate) fn id(&self) -> u64 {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> RuleKind {
        self.0.kind
    }

    pub fn full_name(&self) -> String {
        match &self.0.scope {
            EntityScope::Package(pkg) => format!("g.{}.{}", pkg.qualified(), self.0.name),
            _ => self.0.name.clone(),
        }
    }

    pub(crate) fn params(&self) -> Option<&ParsedRuleParams> {
        self.0.params.as_ref()
    }

    pub(crate) fn has_arg(&self, name: &str) -> bool {
        self.0.args.iter().any(|a| a == name)
    }

    pub(crate) fn package(&self) -> Option<&Arc<PackageContext>> {
        match &self.0.scope {
            EntityScope::Package(pkg) => Some(pkg),
            _ => None,
        }
    }

    /// A rule scoped to one module's or singleton's output block.
    pub(crate) fn new_local(name: String, args: Vec<String>, params: ParsedRuleParams) -> Rule {
        Rule(Arc::new(RuleData {
            id: next_entity_id(),
            scope: EntityScope::Local,
            name,
            kind: RuleKind::PackageScoped,
            args,
            params: Some(params),
        }))
    }

    /// A placeholder variable for one of this rule's arguments.
    pub(crate) fn arg_variable(&self, name: &str) -> Option<Variable> {
        self.has_arg(name)
            .then(|| Variable::new(EntityScope::RuleArg, name.to_string(), None))
    }
}

/// The one rule ninja predefines.
pub fn phony_rule() -> Rule {
    static PHONY: Lazy<Rule> = Lazy::new(|| {
        Rule(Arc::new(RuleData {
            id: next_entity_id(),
            scope: EntityScope::Builtin,
            name: "phony".to_string(),
            kind: RuleKind::Builtin,
            args: Vec::new(),
            params: None,
        }))
    });
    PHONY.clone()
}

#[derive(Debug, Clone, Default)]
pub struct PoolParams {
    pub comment: Option<String>,
    pub depth: i32,
}

#[derive(Debug)]
pub(crate) struct PoolData {
    pub(crate) id: u64,
    pub(crate) scope: EntityScope,
    pub(crate) name: String,
    pub(crate) params: PoolParams,
}

#[derive(Clone, Debug)]
pub struct Pool(pub(crate) Arc<PoolData>);

impl Pool {
    pub(crate) fn id(&self) -> u64 {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn full_name(&self) -> String {
        match &self.0.scope {
            EntityScope::Package(pkg) => format!("g.{}.{}", pkg.qualified(), self.0.name),
            _ => self.0.name.clone(),
        }
    }

    pub(crate) fn params(&self) -> &PoolParams {
        &self.0.params
    }

    pub(crate) fn package(&self) -> Option<&Arc<PackageContext>> {
        match &self.0.scope {
            EntityScope::Package(pkg) => Some(pkg),
            _ => None,
        }
    }
}

#[derive(Default)]
struct PackageScope {
    variables: IndexMap<String, Variable>,
    rules: IndexMap<String, Rule>,
    pools: IndexMap<String, Pool>,
    imports: IndexMap<String, Arc<PackageContext>>,
}

/// A namespace for ninja entities, identified by a package path. Entities
/// registered here appear in the manifest's globals section qualified by
/// the dotted package path.
pub struct PackageContext {
    path: String,
    qualified: String,
    scope: Mutex<PackageScope>,
}

impl std::fmt::Debug for PackageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageContext")
            .field("path", &self.path)
            .finish()
    }
}

impl PackageContext {
    pub fn new(path: impl Into<String>) -> Arc<Self> {
        let path = path.into();
        let qualified = path.replace('/', ".");
        Arc::new(Self {
            path,
            qualified,
            scope: Mutex::new(PackageScope::default()),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The dotted form of the package path used in qualified names.
    pub fn qualified(&self) -> &str {
        &self.qualified
    }

    /// The short alias other packages refer to this one by: the last
    /// path component.
    pub fn short_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Makes `pkg`'s public entities referenceable here as
    /// `<short_name>.<Name>`.
    pub fn import(self: &Arc<Self>, pkg: &Arc<PackageContext>) {
        let alias = pkg.short_name().to_string();
        self.scope.lock().imports.insert(alias, pkg.clone());
    }

    /// Declares a variable with a fixed interpolated value. Panics on a
    /// duplicate name or an unresolvable reference: package registration
    /// happens at embedder startup, and a bad declaration there is a
    /// programming error.
    pub fn static_variable(self: &Arc<Self>, name: &str, value: &str) -> Variable {
        let parsed = NinjaString::parse(&PackageLookup { pkg: self }, value)
            .unwrap_or_else(|e| panic!("package {}: variable {name}: {e}", self.path));
        let variable = Variable::new(
            EntityScope::Package(self.clone()),
            name.to_string(),
            Some(parsed),
        );
        let mut scope = self.scope.lock();
        if scope.variables.contains_key(name) {
            panic!("package {}: duplicate variable {name:?}", self.path);
        }
        scope.variables.insert(name.to_string(), variable.clone());
        variable
    }

    /// Declares a rule. `args` lists the argument placeholders build
    /// statements may bind. Panics under the same conditions as
    /// [`Self::static_variable`].
    pub fn static_rule(self: &Arc<Self>, name: &str, params: RuleParams, args: &[&str]) -> Rule {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let lookup = RuleLookup { pkg: self, args: &args };
        let parse = |s: &str| {
            NinjaString::parse(&lookup, s)
                .unwrap_or_else(|e| panic!("package {}: rule {name}: {e}", self.path))
        };
        let parsed = ParsedRuleParams {
            command: parse(&params.command),
            depfile: params.depfile.as_deref().map(parse),
            deps: params.deps.as_deref().map(parse),
            description: params.description.as_deref().map(parse),
            generator: params.generator,
            pool: params.pool.clone(),
            restat: params.restat,
            rspfile: params.rspfile.as_deref().map(parse),
            rspfile_content: params.rspfile_content.as_deref().map(parse),
        };
        let rule = Rule(Arc::new(RuleData {
            id: next_entity_id(),
            scope: EntityScope::Package(self.clone()),
            name: name.to_string(),
            kind: RuleKind::PackageScoped,
            args,
            params: Some(parsed),
        }));
        let mut scope = self.scope.lock();
        if scope.rules.contains_key(name) {
            panic!("package {}: duplicate rule {name:?}", self.path);
        }
        scope.rules.insert(name.to_string(), rule.clone());
        rule
    }

    pub fn static_pool(self: &Arc<Self>, name: &str, params: PoolParams) -> Pool {
        let pool = Pool(Arc::new(PoolData {
            id: next_entity_id(),
            scope: EntityScope::Package(self.clone()),
            name: name.to_string(),
            params,
        }));
        let mut scope = self.scope.lock();
        if scope.pools.contains_key(name) {
            panic!("package {}: duplicate pool {name:?}", self.path);
        }
        scope.pools.insert(name.to_string(), pool.clone());
        pool
    }

    /// Resolves a variable reference in this package's scope. A dotted name
    /// `alias.Name` requires `alias` to be an imported package and `Name`
    /// to start with an upper-case letter; an unqualified name resolves
    /// against this package's own variables.
    pub(crate) fn lookup_variable(&self, name: &str) -> Option<Variable> {
        if let Some((alias, rest)) = name.split_once('.') {
            if rest.contains('.') || !rest.starts_with(char::is_uppercase) {
                return None;
            }
            // Clone the import out before locking its scope; packages may
            // import each other.
            let imported = self.scope.lock().imports.get(alias).cloned()?;
            let found = imported.scope.lock().variables.get(rest).cloned();
            return found;
        }
        self.scope.lock().variables.get(name).cloned()
    }
}

/// Name-to-variable resolution used while parsing interpolated strings.
pub(crate) trait VariableLookup {
    fn lookup(&self, name: &str) -> Option<Variable>;
}

pub(crate) struct PackageLookup<'a> {
    pub(crate) pkg: &'a Arc<PackageContext>,
}

impl VariableLookup for PackageLookup<'_> {
    fn lookup(&self, name: &str) -> Option<Variable> {
        self.pkg.lookup_variable(name)
    }
}

/// Rule-body scope: argument placeholders and the builtin `in`/`out`
/// shadow package variables.
pub(crate) struct RuleLookup<'a> {
    pub(crate) pkg: &'a Arc<PackageContext>,
    pub(crate) args: &'a [String],
}

impl VariableLookup for RuleLookup<'_> {
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
        self.pkg.lookup_variable(name)
    }
}

/// Module scope: module-local variables layered over the package scope.
pub(crate) struct ModuleLookup<'a> {
    pub(crate) pkg: &'a Arc<PackageContext>,
    pub(crate) locals: &'a IndexMap<String, Variable>,
}

impl VariableLookup for ModuleLookup<'_> {
    fn lookup(&self, name: &str) -> Option<Variable> {
        if let Some(local) = self.locals.get(name) {
            return Some(local.clone());
        }
        self.pkg.lookup_variable(name)
    }
}

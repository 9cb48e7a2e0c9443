// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use itertools::Itertools;
use thiserror::Error;

/// Location of a definition or property in a parsed blueprint file.
/// A zero position (empty file name) renders as `<unknown>`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Position {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.file.is_empty()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            write!(f, "<unknown>")
        } else {
            write!(f, "{}:{}:{}", self.file, self.line, self.column)
        }
    }
}

fn format_cycle(cycle: &[String]) -> String {
    cycle
        .iter()
        .enumerate()
        .map(|(i, module)| {
            let next = &cycle[(i + 1) % cycle.len()];
            format!("    {module:?} depends on {next:?}")
        })
        .join("\n")
}

/// Errors surfaced from parsing, resolution, and generation. Every variant
/// that originates from a definition carries its source position.
///
/// Engine-internal invariant violations (provider misuse, glob mismatch,
/// variable reference cycles, scheduler deadlock without a cycle) are not
/// represented here: those panic.
#[derive(Debug, Error)]
pub enum BlueprintError {
    /// Delegated from the external parser.
    #[error("{pos}: {message}")]
    Parse { message: String, pos: Position },

    /// A module type name with no registered factory.
    #[error("{pos}: unrecognized module type {type_name:?}")]
    UnknownModuleType { type_name: String, pos: Position },

    /// A property in the definition that no property record declares.
    #[error("{pos}: unrecognized property {name:?}")]
    UnrecognizedProperty { name: String, pos: Position },

    /// A property whose AST value kind does not match the declared field.
    #[error("{pos}: can't assign {found} value to {expected} property {name:?}")]
    PropertyTypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
        pos: Position,
    },

    /// A property marked as mutated by the engine was set in a definition.
    #[error("{pos}: mutated field {name:?} cannot be set in a module definition")]
    MutatedFieldSet { name: String, pos: Position },

    /// A property filtered out of the record was set in a definition.
    #[error("{pos}: filtered field {name:?} cannot be set in a module definition")]
    FilteredFieldSet { name: String, pos: Position },

    /// A module definition with no `name` property.
    #[error("{pos}: module of type {type_name:?} is missing a \"name\" property")]
    MissingModuleName { type_name: String, pos: Position },

    /// Two module groups share a name within one namespace.
    #[error("{pos}: module {name:?} already defined\n  {previous}: <-- previous definition here")]
    DuplicateModule {
        name: String,
        pos: Position,
        previous: Position,
    },

    /// A named dependency has no module group.
    #[error("{pos}: {module:?} depends on undefined module {dep:?}")]
    MissingDependency {
        module: String,
        dep: String,
        pos: Position,
    },

    /// A dependency resolved to a group, but no variant matched.
    #[error(
        "{pos}: dependency {dep:?} of {module:?} missing variant:\n  {variant}\navailable variants:\n  {}",
        .available.join("\n  ")
    )]
    MissingVariant {
        module: String,
        dep: String,
        variant: String,
        available: Vec<String>,
        pos: Position,
    },

    /// A module depends on itself by exact name and variant.
    #[error("{pos}: module {name:?} depends on itself")]
    SelfDependency { name: String, pos: Position },

    /// A module depends on a variant of itself that was created after it.
    #[error("{pos}: module {name:?} depends on later variant {variant:?} of itself")]
    LaterVariantDependency {
        name: String,
        variant: String,
        pos: Position,
    },

    /// The dependency graph (including pause edges) contains a cycle.
    #[error("encountered dependency cycle:\n{}", format_cycle(.cycle))]
    DependencyCycle { cycle: Vec<String> },

    /// An embedder callback panicked; the payload is preserved as text.
    #[error("panic in {context}: {message}")]
    PanickedCallback { context: String, message: String },

    /// Reported by an embedder callback through a module context.
    #[error("{pos}: {message}")]
    ModuleError {
        module: String,
        message: String,
        pos: Position,
    },

    /// Reported by an embedder callback through a singleton context.
    #[error("singleton {singleton:?}: {message}")]
    SingletonError { singleton: String, message: String },

    /// A glob pattern that the filesystem rejected.
    #[error("invalid glob pattern {pattern:?}: {message}")]
    GlobPattern { pattern: String, message: String },

    /// Filesystem failure while walking or reading blueprint files.
    #[error("failed to read {path:?}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl BlueprintError {
    /// The source position attached to this error, when one exists.
    pub fn position(&self) -> Option<&Position> {
        match self {
            BlueprintError::Parse { pos, .. }
            | BlueprintError::UnknownModuleType { pos, .. }
            | BlueprintError::UnrecognizedProperty { pos, .. }
            | BlueprintError::PropertyTypeMismatch { pos, .. }
            | BlueprintError::MutatedFieldSet { pos, .. }
            | BlueprintError::FilteredFieldSet { pos, .. }
            | BlueprintError::MissingModuleName { pos, .. }
            | BlueprintError::DuplicateModule { pos, .. }
            | BlueprintError::MissingDependency { pos, .. }
            | BlueprintError::MissingVariant { pos, .. }
            | BlueprintError::SelfDependency { pos, .. }
            | BlueprintError::LaterVariantDependency { pos, .. }
            | BlueprintError::ModuleError { pos, .. } => Some(pos),
            BlueprintError::DependencyCycle { .. }
            | BlueprintError::PanickedCallback { .. }
            | BlueprintError::SingletonError { .. }
            | BlueprintError::GlobPattern { .. }
            | BlueprintError::Io { .. } => None,
        }
    }
}

pub type BlueprintResult<T> = Result<T, BlueprintError>;

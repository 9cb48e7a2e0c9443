// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Abstract model of a parsed blueprint file.
//!
//! The configuration-language grammar is not this crate's concern. An
//! embedder supplies a [`Parser`] that turns file contents into
//! [`ParsedFile`] values; the engine consumes the resulting definitions and
//! never looks at concrete syntax.

use crate::error::{BlueprintError, Position};

/// A property value. The engine relies on exactly these kinds: strings,
/// booleans, lists of values, and nested maps.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Bool(bool),
    List(Vec<Value>),
    Map(Vec<Property>),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Bool(_) => "bool",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Interprets this value as a list of strings, rejecting mixed lists.
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        match self {
            Value::List(values) => values
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => None,
        }
    }
}

/// A named property inside a module definition or nested map.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub pos: Position,
    pub value: Value,
}

/// A module definition: a type name plus a property map.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDef {
    pub type_name: String,
    pub pos: Position,
    pub properties: Vec<Property>,
}

impl ModuleDef {
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// The `name` property, which every module definition must carry.
    pub fn name(&self) -> Option<&str> {
        self.property("name").and_then(|p| p.value.as_str())
    }
}

/// A top-level assignment, e.g. `subdirs = ["foo", "bar"]`. Assignments
/// other than the file-walker directives are the parser's business and are
/// ignored by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub name: String,
    pub pos: Position,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Definition {
    Module(ModuleDef),
    Assignment(Assignment),
}

/// One parsed blueprint file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedFile {
    /// Path of the file relative to the source root.
    pub path: String,
    pub defs: Vec<Definition>,
}

impl ParsedFile {
    pub fn assignment(&self, name: &str) -> Option<&Assignment> {
        self.defs.iter().find_map(|d| match d {
            Definition::Assignment(a) if a.name == name => Some(a),
            _ => None,
        })
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleDef> {
        self.defs.iter().filter_map(|d| match d {
            Definition::Module(m) => Some(m),
            _ => None,
        })
    }
}

/// The external parser seam. `parse` consumes raw file contents and returns
/// the abstract file; `print` is the pretty-printer used by reformatting
/// tools layered on top of the engine.
pub trait Parser: Send + Sync {
    fn parse(&self, path: &str, contents: &[u8]) -> Result<ParsedFile, Vec<BlueprintError>>;

    fn print(&self, file: &ParsedFile) -> Vec<u8>;
}

/// A parser that serves pre-built ASTs keyed by path. Embedder tests build
/// module definitions programmatically and register them here instead of
/// shipping a grammar.
#[derive(Default)]
pub struct StaticParser {
    files: indexmap::IndexMap<String, ParsedFile>,
}

impl StaticParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, file: ParsedFile) -> &mut Self {
        self.files.insert(file.path.clone(), file);
        self
    }
}

impl Parser for StaticParser {
    fn parse(&self, path: &str, _contents: &[u8]) -> Result<ParsedFile, Vec<BlueprintError>> {
        match self.files.get(path) {
            Some(file) => Ok(file.clone()),
            None => Err(vec![BlueprintError::Parse {
                message: format!("no such file {path:?}"),
                pos: Position::new(path, 0, 0),
            }]),
        }
    }

    fn print(&self, file: &ParsedFile) -> Vec<u8> {
        // Line-per-definition rendering, sufficient for diffing in tests.
        let mut out = String::new();
        for def in &file.defs {
            out.push_str(&format!("{def:?}\n"));
        }
        out.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_list_rejects_mixed_lists() {
        let ok = Value::List(vec![
            Value::String("a".to_string()),
            Value::String("b".to_string()),
        ]);
        assert_eq!(
            ok.as_string_list(),
            Some(vec!["a".to_string(), "b".to_string()])
        );

        let mixed = Value::List(vec![Value::String("a".to_string()), Value::Bool(true)]);
        assert_eq!(mixed.as_string_list(), None);
    }

    #[test]
    fn module_name_lookup() {
        let def = ModuleDef {
            type_name: "library".to_string(),
            pos: Position::default(),
            properties: vec![Property {
                name: "name".to_string(),
                pos: Position::default(),
                value: Value::String("libfoo".to_string()),
            }],
        };
        assert_eq!(def.name(), Some("libfoo"));
    }
}

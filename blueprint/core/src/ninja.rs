// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The ninja value model: strings with embedded variable references.
//!
//! Values are parsed once, at definition time, against a scope. From then
//! on a value is a sequence of literal spans and resolved references, so
//! emission never needs the scope again and the live tracker can walk
//! references without string matching.

use indexmap::IndexMap;

use crate::scope::{Rule, Variable, VariableLookup};

#[derive(Clone, Debug)]
pub(crate) enum Piece {
    Literal(String),
    Var(Variable),
}

/// An interpolated string. `$$` escapes a dollar sign; `${name}` references
/// a variable resolvable in the scope the string was parsed against.
#[derive(Clone, Debug, Default)]
pub struct NinjaString {
    pub(crate) pieces: Vec<Piece>,
}

impl NinjaString {
    /// A value with no references; the text is taken as-is.
    pub(crate) fn literal(s: impl Into<String>) -> Self {
        Self {
            pieces: vec![Piece::Literal(s.into())],
        }
    }

    pub(crate) fn parse(scope: &dyn VariableLookup, s: &str) -> Result<Self, String> {
        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut chars = s.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '$' {
                literal.push(c);
                continue;
            }
            match chars.next() {
                Some('$') => literal.push('$'),
                Some('{') => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) if c.is_ascii_alphanumeric() || "_.-".contains(c) => {
                                name.push(c)
                            }
                            Some(c) => {
                                return Err(format!(
                                    "invalid character {c:?} in reference in {s:?}"
                                ))
                            }
                            None => return Err(format!("unterminated reference in {s:?}")),
                        }
                    }
                    let variable = scope
                        .lookup(&name)
                        .ok_or_else(|| format!("undefined variable {name:?} in {s:?}"))?;
                    if !literal.is_empty() {
                        pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                    }
                    pieces.push(Piece::Var(variable));
                }
                Some(c) => return Err(format!("invalid character {c:?} after '$' in {s:?}")),
                None => return Err(format!("trailing '$' in {s:?}")),
            }
        }
        if !literal.is_empty() {
            pieces.push(Piece::Literal(literal));
        }
        Ok(Self { pieces })
    }

    pub(crate) fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.pieces.iter().filter_map(|p| match p {
            Piece::Var(v) => Some(v),
            Piece::Literal(_) => None,
        })
    }

    /// Renders for a variable-value position: only `$` needs re-escaping.
    pub(crate) fn value_string(&self) -> String {
        self.render(escape_value)
    }

    /// Renders for a path position on a build line, where spaces and
    /// colons must also be escaped.
    pub(crate) fn path_string(&self) -> String {
        self.render(escape_path)
    }

    fn render(&self, escape: fn(&str) -> String) -> String {
        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Literal(l) => out.push_str(&escape(l)),
                Piece::Var(v) => {
                    out.push_str("${");
                    out.push_str(&v.full_name());
                    out.push('}');
                }
            }
        }
        out
    }
}

pub(crate) fn escape_value(s: &str) -> String {
    s.replace('$', "$$")
}

pub(crate) fn escape_path(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '$' => out.push_str("$$"),
            ' ' => out.push_str("$ "),
            ':' => out.push_str("$:"),
            _ => out.push(c),
        }
    }
    out
}

/// One build statement as supplied by an embedder. Paths and argument
/// values may contain `${}` references resolvable in the calling scope.
#[derive(Clone, Debug, Default)]
pub struct BuildParams {
    pub comment: Option<String>,
    pub rule: Option<Rule>,
    pub outputs: Vec<String>,
    pub implicit_outputs: Vec<String>,
    pub inputs: Vec<String>,
    pub implicits: Vec<String>,
    pub order_only: Vec<String>,
    pub args: IndexMap<String, String>,
}

/// A build statement after parsing, ready for live tracking and emission.
#[derive(Debug)]
pub(crate) struct BuildDef {
    pub(crate) comment: Option<String>,
    pub(crate) rule: Rule,
    pub(crate) outputs: Vec<NinjaString>,
    pub(crate) implicit_outputs: Vec<NinjaString>,
    pub(crate) inputs: Vec<NinjaString>,
    pub(crate) implicits: Vec<NinjaString>,
    pub(crate) order_only: Vec<NinjaString>,
    pub(crate) args: Vec<(Variable, NinjaString)>,
}

impl BuildDef {
    pub(crate) fn parse(
        scope: &dyn VariableLookup,
        params: BuildParams,
    ) -> Result<BuildDef, String> {
        let rule = params.rule.ok_or("build statement has no rule")?;
        if params.outputs.is_empty() {
            return Err(format!(
                "build statement for rule {:?} has no outputs",
                rule.name()
            ));
        }
        let parse_list = |list: &[String]| -> Result<Vec<NinjaString>, String> {
            list.iter()
                .map(|s| NinjaString::parse(scope, s))
                .collect()
        };
        let mut args = Vec::with_capacity(params.args.len());
        for (name, value) in &params.args {
            let placeholder = rule.arg_variable(name).ok_or_else(|| {
                format!("unknown argument {name:?} for rule {:?}", rule.name())
            })?;
            args.push((placeholder, NinjaString::parse(scope, value)?));
        }
        Ok(BuildDef {
            comment: params.comment,
            rule,
            outputs: parse_list(&params.outputs)?,
            implicit_outputs: parse_list(&params.implicit_outputs)?,
            inputs: parse_list(&params.inputs)?,
            implicits: parse_list(&params.implicits)?,
            order_only: parse_list(&params.order_only)?,
            args,
        })
    }

    /// Every value whose references must stay live for this statement.
    pub(crate) fn referenced_values(&self) -> impl Iterator<Item = &NinjaString> {
        self.outputs
            .iter()
            .chain(self.implicit_outputs.iter())
            .chain(self.inputs.iter())
            .chain(self.implicits.iter())
            .chain(self.order_only.iter())
            .chain(self.args.iter().map(|(_, v)| v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{PackageContext, PackageLookup};

    #[test]
    fn parse_splits_literals_and_references() {
        let pctx = PackageContext::new("p");
        pctx.static_variable("cc", "clang");
        let lookup = PackageLookup { pkg: &pctx };

        let value = NinjaString::parse(&lookup, "${cc} -c $$HOME x").unwrap();
        assert_eq!(value.variables().count(), 1);
        assert_eq!(value.value_string(), "${g.p.cc} -c $$HOME x");
    }

    #[test]
    fn parse_rejects_undefined_and_malformed() {
        let pctx = PackageContext::new("p");
        let lookup = PackageLookup { pkg: &pctx };

        assert!(NinjaString::parse(&lookup, "${nope}").is_err());
        assert!(NinjaString::parse(&lookup, "${unterminated").is_err());
        assert!(NinjaString::parse(&lookup, "bare$x").is_err());
        assert!(NinjaString::parse(&lookup, "trailing$").is_err());
    }

    #[test]
    fn path_escaping_covers_ninja_specials() {
        assert_eq!(escape_path("a b:c$d"), "a$ b$:c$$d");
        assert_eq!(escape_value("a b:c$d"), "a b:c$$d");
    }
}

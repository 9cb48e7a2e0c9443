// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Line-oriented ninja output. The writer knows ninja's statement shapes
//! and the wrapping policy; everything it receives is already escaped and
//! rendered to plain text.

use std::io::{self, Write};

const LINE_WIDTH: usize = 80;
const INDENT: &str = "    ";
/// Continuation lines are double-indented.
const WRAP_INDENT: &str = "        ";

pub(crate) struct NinjaWriter<'a> {
    w: &'a mut dyn Write,
}

impl<'a> NinjaWriter<'a> {
    pub(crate) fn new(w: &'a mut dyn Write) -> Self {
        Self { w }
    }

    pub(crate) fn blank_line(&mut self) -> io::Result<()> {
        self.w.write_all(b"\n")
    }

    /// Writes a comment, wrapped at the line width on word boundaries.
    pub(crate) fn comment(&mut self, comment: &str) -> io::Result<()> {
        let mut line = String::from("#");
        for word in comment.split_whitespace() {
            if line.len() + 1 + word.len() > LINE_WIDTH && line.len() > 1 {
                writeln!(self.w, "{line}")?;
                line = String::from("#");
            }
            line.push(' ');
            line.push_str(word);
        }
        writeln!(self.w, "{line}")
    }

    /// A full-width separator line used for module banners.
    pub(crate) fn banner(&mut self) -> io::Result<()> {
        writeln!(self.w, "# {}", "# ".repeat((LINE_WIDTH - 4) / 2).trim_end())
    }

    pub(crate) fn subninja(&mut self, path: &str) -> io::Result<()> {
        self.statement(&["subninja".to_string(), path.to_string()])
    }

    pub(crate) fn pool(&mut self, name: &str) -> io::Result<()> {
        self.statement(&["pool".to_string(), name.to_string()])
    }

    pub(crate) fn rule(&mut self, name: &str) -> io::Result<()> {
        self.statement(&["rule".to_string(), name.to_string()])
    }

    /// `name = value` at the given indent level. The value may wrap.
    pub(crate) fn variable(&mut self, name: &str, value: &str, indent: usize) -> io::Result<()> {
        let mut tokens = vec![format!(
            "{}{} =",
            INDENT.repeat(indent),
            name
        )];
        tokens.extend(split_wrappable(value));
        self.statement(&tokens)
    }

    /// A build statement line:
    /// `build outs | implicit_outs: rule ins | implicits || order_only`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build(
        &mut self,
        outputs: &[String],
        implicit_outputs: &[String],
        rule: &str,
        inputs: &[String],
        implicits: &[String],
        order_only: &[String],
    ) -> io::Result<()> {
        let mut tokens = Vec::new();
        tokens.push("build".to_string());
        tokens.extend(outputs.iter().cloned());
        if !implicit_outputs.is_empty() {
            tokens.push("|".to_string());
            tokens.extend(implicit_outputs.iter().cloned());
        }
        // The rule is attached to the last output token after a colon; the
        // colon must not become a wrap point.
        match tokens.last_mut() {
            Some(last) => last.push(':'),
            None => unreachable!("build statement without outputs"),
        }
        tokens.push(rule.to_string());
        tokens.extend(inputs.iter().cloned());
        if !implicits.is_empty() {
            tokens.push("|".to_string());
            tokens.extend(implicits.iter().cloned());
        }
        if !order_only.is_empty() {
            tokens.push("||".to_string());
            tokens.extend(order_only.iter().cloned());
        }
        self.statement(&tokens)
    }

    /// Writes space-separated tokens, wrapping with ` $` + a double indent
    /// whenever the next token would push the line past the width.
    fn statement(&mut self, tokens: &[String]) -> io::Result<()> {
        let mut line = String::new();
        for token in tokens {
            if line.is_empty() {
                line.push_str(token);
                continue;
            }
            // Reserve room for the ` $` continuation marker.
            if line.len() + 1 + token.len() + 2 > LINE_WIDTH {
                writeln!(self.w, "{line} $")?;
                line = String::from(WRAP_INDENT);
                line.push_str(token);
            } else {
                line.push(' ');
                line.push_str(token);
            }
        }
        writeln!(self.w, "{line}")
    }
}

/// Splits a rendered value into wrappable tokens: spaces are separators
/// unless escaped (preceded by `$`).
fn split_wrappable(value: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev_dollar = false;
    for c in value.chars() {
        if c == ' ' && !prev_dollar {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
        prev_dollar = c == '$' && !prev_dollar;
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(f: impl FnOnce(&mut NinjaWriter<'_>)) -> String {
        let mut buf = Vec::new();
        {
            let mut writer = NinjaWriter::new(&mut buf);
            f(&mut writer);
        }
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn build_line_shape() {
        let out = render(|w| {
            w.build(
                &["out/a.o".to_string()],
                &[],
                "g.cc.compile",
                &["src/a.c".to_string()],
                &["cc.conf".to_string()],
                &["gen/stamp".to_string()],
            )
            .unwrap()
        });
        assert_eq!(
            out,
            "build out/a.o: g.cc.compile src/a.c | cc.conf || gen/stamp\n"
        );
    }

    #[test]
    fn long_statements_wrap_with_double_indent() {
        let inputs: Vec<String> = (0..12).map(|i| format!("src/source_file_{i}.c")).collect();
        let out = render(|w| {
            w.build(&["out/a.o".to_string()], &[], "cc", &inputs, &[], &[])
                .unwrap()
        });
        for line in out.lines() {
            assert!(line.len() <= LINE_WIDTH, "overlong line: {line:?}");
        }
        assert!(out.contains(" $\n        "));
    }

    #[test]
    fn escaped_spaces_are_not_wrap_points() {
        let tokens = split_wrappable("a$ b c");
        assert_eq!(tokens, vec!["a$ b".to_string(), "c".to_string()]);
    }

    #[test]
    fn variable_lines_are_indented() {
        let out = render(|w| w.variable("cFlags", "-O2 -g", 1).unwrap());
        assert_eq!(out, "    cFlags = -O2 -g\n");
    }
}

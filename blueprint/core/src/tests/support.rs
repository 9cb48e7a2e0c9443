// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! A miniature embedder used by the scenario tests: a `touch` module type
//! whose build statements copy their sources to an output stamp, a `deps`
//! mutator driven by the `deps` property, and helpers for building parsed
//! files programmatically.

use std::any::Any;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::ast::{Definition, ModuleDef, ParsedFile, Property, Value};
use crate::context::{Config, Context, ModuleContext};
use crate::error::Position;
use crate::fs::MemFileSystem;
use crate::module::{DepTag, DependencyTag, Module};
use crate::properties::{record_as_bag, PropertyBag, PropertyKind, PropertyRecord};
use crate::provider::{new_provider, ProviderKey};
use crate::scope::{PackageContext, Rule, RuleParams};
use crate::StaticParser;

#[derive(Debug)]
struct TestDepTag;

impl DependencyTag for TestDepTag {}

pub(crate) fn test_tag() -> DepTag {
    static TAG: Lazy<DepTag> = Lazy::new(|| Arc::new(TestDepTag));
    TAG.clone()
}

/// Output path provider, set by every `touch` module during generate.
pub(crate) static OUTPUT_FILE: Lazy<ProviderKey<String>> = Lazy::new(new_provider::<String>);

pub(crate) struct TouchModule {
    rule: Rule,
    pkg: Arc<PackageContext>,
}

impl Module for TouchModule {
    fn generate_build_actions(&mut self, ctx: &mut ModuleContext<'_>) {
        let tolerate = ctx.properties(|records| {
            record_as_bag(records[0].as_ref())
                .and_then(|bag| bag.bool_value("tolerate_missing"))
                .unwrap_or(false)
        });
        if tolerate {
            ctx.handle_missing_dependencies();
        }

        let srcs = ctx.properties(|records| {
            record_as_bag(records[0].as_ref())
                .map(|bag| bag.string_list("srcs").to_vec())
                .unwrap_or_default()
        });

        let mut implicits = Vec::new();
        ctx.visit_direct_deps(|dep, _tag| {
            if let Some(out) = ctx.module_provider(dep, *OUTPUT_FILE) {
                implicits.push(String::clone(&out));
            }
        });

        let name = ctx.module_name();
        let subdir = ctx.module_subdir();
        let out = if subdir.is_empty() {
            format!("out/{name}.stamp")
        } else {
            format!("out/{name}.{subdir}.stamp")
        };
        ctx.build(
            &self.pkg,
            crate::ninja::BuildParams {
                rule: Some(self.rule.clone()),
                outputs: vec![out.clone()],
                inputs: srcs,
                implicits,
                ..Default::default()
            },
        );
        ctx.set_provider(*OUTPUT_FILE, out);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn touch_bag() -> PropertyBag {
    PropertyBag::new()
        .declare("srcs", PropertyKind::StringList)
        .declare("deps", PropertyKind::StringList)
        .declare("tolerate_missing", PropertyKind::OptionalBool)
}

/// A context wired with the miniature embedder: the `touch` module type
/// and a `deps` bottom-up mutator.
pub(crate) struct TestFixture {
    pub(crate) ctx: Context,
    pub(crate) pkg: Arc<PackageContext>,
}

pub(crate) fn fixture(files: Vec<ParsedFile>) -> TestFixture {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("blueprint_core=debug")
        .try_init();

    let pkg = PackageContext::new("test/build");
    let rule = pkg.static_rule(
        "touch",
        RuleParams {
            command: "touch ${out}".to_string(),
            description: Some("touch ${out}".to_string()),
            ..Default::default()
        },
        &[],
    );

    let mut ctx = Context::new();
    let fs = MemFileSystem::new();
    for file in &files {
        fs.add(file.path.clone(), Vec::new());
    }
    ctx.set_filesystem(fs);
    let mut parser = StaticParser::new();
    for file in files {
        parser.add_file(file);
    }
    ctx.set_parser(parser);

    let factory_pkg = pkg.clone();
    ctx.register_module_type("touch", move || {
        (
            Box::new(TouchModule {
                rule: rule.clone(),
                pkg: factory_pkg.clone(),
            }) as Box<dyn Module>,
            vec![Box::new(touch_bag()) as Box<dyn PropertyRecord>],
        )
    });

    ctx.register_bottom_up_mutator("deps", |mctx| {
        let deps = mctx.mutate_properties(|records| {
            record_as_bag(records[0].as_ref())
                .map(|bag| bag.string_list("deps").to_vec())
                .unwrap_or_default()
        });
        for dep in deps {
            mctx.add_dependency(test_tag(), &[&dep]);
        }
    });

    TestFixture { ctx, pkg }
}

pub(crate) fn test_config() -> Config {
    Arc::new(())
}

pub(crate) fn pos(file: &str, line: u32) -> Position {
    Position::new(file, line, 1)
}

pub(crate) fn string_list(items: &[&str]) -> Value {
    Value::List(items.iter().map(|s| Value::String(s.to_string())).collect())
}

pub(crate) fn module_def(
    file: &str,
    line: u32,
    type_name: &str,
    name: &str,
    props: Vec<(&str, Value)>,
) -> Definition {
    let mut properties = vec![Property {
        name: "name".to_string(),
        pos: pos(file, line),
        value: Value::String(name.to_string()),
    }];
    for (i, (prop_name, value)) in props.into_iter().enumerate() {
        properties.push(Property {
            name: prop_name.to_string(),
            pos: pos(file, line + 1 + i as u32),
            value,
        });
    }
    Definition::Module(ModuleDef {
        type_name: type_name.to_string(),
        pos: pos(file, line),
        properties,
    })
}

pub(crate) fn blueprint_file(path: &str, defs: Vec<Definition>) -> ParsedFile {
    ParsedFile {
        path: path.to_string(),
        defs,
    }
}

/// A file of `touch` modules from (name, srcs, deps) triples.
pub(crate) fn touch_file(path: &str, modules: &[(&str, &[&str], &[&str])]) -> ParsedFile {
    let defs = modules
        .iter()
        .enumerate()
        .map(|(i, (name, srcs, deps))| {
            module_def(
                path,
                (i as u32) * 10 + 1,
                "touch",
                name,
                vec![("srcs", string_list(srcs)), ("deps", string_list(deps))],
            )
        })
        .collect();
    blueprint_file(path, defs)
}

/// Runs parse and resolve, asserting neither phase reports errors.
pub(crate) fn parse_and_resolve(fixture: &mut TestFixture, files: &[&str]) {
    let config = test_config();
    let (_, errors) = fixture.ctx.parse_file_list(files, &config);
    assert!(errors.is_empty(), "parse errors: {errors:?}");
    let (_, errors) = fixture.ctx.resolve_dependencies(&config);
    assert!(errors.is_empty(), "resolve errors: {errors:?}");
}

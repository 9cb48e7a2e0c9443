// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios through the whole pipeline: parse walking,
//! binding errors, the missing-deps mode, singletons, and deterministic
//! manifest emission.

use std::sync::Arc;

use pretty_assertions::assert_eq as assert_text_eq;

use super::support::{
    blueprint_file, fixture, module_def, parse_and_resolve, string_list, test_config, touch_file,
};
use crate::ast::Value;
use crate::error::BlueprintError;
use crate::ninja::BuildParams;
use crate::scope::{phony_rule, PackageContext};
use crate::singleton::Singleton;

fn generate(f: &mut super::support::TestFixture) {
    let config = test_config();
    let (_, errors) = f.ctx.prepare_build_actions(&config);
    assert!(errors.is_empty(), "generate errors: {errors:?}");
}

fn manifest(f: &super::support::TestFixture) -> String {
    let mut out = Vec::new();
    f.ctx.write_build_file(&mut out).unwrap();
    String::from_utf8(out).unwrap()
}

#[test]
fn subdirs_are_walked_ancestors_first() {
    let root = blueprint_file(
        "Blueprints",
        vec![crate::ast::Definition::Assignment(crate::ast::Assignment {
            name: "subdirs".to_string(),
            pos: super::support::pos("Blueprints", 1),
            value: string_list(&["lib"]),
        })],
    );
    let child = touch_file("lib/Blueprints", &[("liba", &["a.c"], &[])]);

    let mut f = fixture(vec![root, child]);
    let config = test_config();
    let (deps, errors) = f.ctx.parse_file_list(&["Blueprints"], &config);
    assert!(errors.is_empty(), "parse errors: {errors:?}");
    assert_eq!(deps, ["Blueprints", "lib/Blueprints"]);

    let (_, errors) = f.ctx.resolve_dependencies(&config);
    assert!(errors.is_empty());
}

#[test]
fn missing_subdir_is_an_error_unless_optional() {
    let root = blueprint_file(
        "Blueprints",
        vec![
            crate::ast::Definition::Assignment(crate::ast::Assignment {
                name: "subdirs".to_string(),
                pos: super::support::pos("Blueprints", 1),
                value: string_list(&["nonexistent"]),
            }),
            crate::ast::Definition::Assignment(crate::ast::Assignment {
                name: "optional_subdirs".to_string(),
                pos: super::support::pos("Blueprints", 2),
                value: string_list(&["also_nonexistent"]),
            }),
        ],
    );
    let mut f = fixture(vec![root]);
    let config = test_config();
    let (_, errors) = f.ctx.parse_file_list(&["Blueprints"], &config);
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], BlueprintError::Io { path, .. } if path == "nonexistent"));
}

#[test]
fn duplicate_module_names_collide() {
    let mut f = fixture(vec![touch_file(
        "Blueprints",
        &[("same", &[], &[]), ("same", &[], &[])],
    )]);
    let config = test_config();
    let (_, errors) = f.ctx.parse_file_list(&["Blueprints"], &config);
    assert!(matches!(
        &errors[0],
        BlueprintError::DuplicateModule { name, .. } if name == "same"
    ));
}

#[test]
fn unknown_module_type_respects_ignore_mode() {
    let file = blueprint_file(
        "Blueprints",
        vec![module_def("Blueprints", 1, "mystery", "m", vec![])],
    );
    let config = test_config();

    let mut strict = fixture(vec![file.clone()]);
    let (_, errors) = strict.ctx.parse_file_list(&["Blueprints"], &config);
    assert!(matches!(
        &errors[0],
        BlueprintError::UnknownModuleType { type_name, .. } if type_name == "mystery"
    ));

    let mut lenient = fixture(vec![file]);
    lenient.ctx.set_ignore_unknown_module_types(true);
    let (_, errors) = lenient.ctx.parse_file_list(&["Blueprints"], &config);
    assert!(errors.is_empty());
}

#[test]
fn module_without_name_is_rejected() {
    let file = blueprint_file(
        "Blueprints",
        vec![crate::ast::Definition::Module(crate::ast::ModuleDef {
            type_name: "touch".to_string(),
            pos: super::support::pos("Blueprints", 1),
            properties: vec![crate::ast::Property {
                name: "srcs".to_string(),
                pos: super::support::pos("Blueprints", 2),
                value: string_list(&["a.c"]),
            }],
        })],
    );
    let mut f = fixture(vec![file]);
    let config = test_config();
    let (_, errors) = f.ctx.parse_file_list(&["Blueprints"], &config);
    assert!(matches!(
        &errors[0],
        BlueprintError::MissingModuleName { type_name, .. } if type_name == "touch"
    ));
}

#[test]
fn unrecognized_property_carries_its_position() {
    let file = blueprint_file(
        "Blueprints",
        vec![module_def(
            "Blueprints",
            1,
            "touch",
            "A",
            vec![("bogus", Value::Bool(true))],
        )],
    );
    let mut f = fixture(vec![file]);
    let config = test_config();
    let (_, errors) = f.ctx.parse_file_list(&["Blueprints"], &config);
    match &errors[0] {
        BlueprintError::UnrecognizedProperty { name, pos } => {
            assert_eq!(name, "bogus");
            assert_eq!(pos.file, "Blueprints");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn missing_dependency_is_an_error_by_default() {
    let mut f = fixture(vec![touch_file(
        "Blueprints",
        &[("A", &[], &["ghost"])],
    )]);
    let config = test_config();
    let (_, errors) = f.ctx.parse_file_list(&["Blueprints"], &config);
    assert!(errors.is_empty());
    let (_, errors) = f.ctx.resolve_dependencies(&config);
    assert!(matches!(
        &errors[0],
        BlueprintError::MissingDependency { module, dep, .. }
            if module == "A" && dep == "ghost"
    ));
}

#[test]
fn allowed_missing_dependency_reraises_at_generate() {
    let mut f = fixture(vec![touch_file(
        "Blueprints",
        &[("A", &[], &["ghost"])],
    )]);
    f.ctx.set_allow_missing_dependencies(true);
    parse_and_resolve(&mut f, &["Blueprints"]);

    let config = test_config();
    let (_, errors) = f.ctx.prepare_build_actions(&config);
    assert!(matches!(
        &errors[0],
        BlueprintError::MissingDependency { module, dep, .. }
            if module == "A" && dep == "ghost"
    ));
}

#[test]
fn handled_missing_dependency_generates_with_stubbed_edges() {
    let file = blueprint_file(
        "Blueprints",
        vec![module_def(
            "Blueprints",
            1,
            "touch",
            "A",
            vec![
                ("deps", string_list(&["ghost"])),
                ("tolerate_missing", Value::Bool(true)),
            ],
        )],
    );
    let mut f = fixture(vec![file]);
    f.ctx.set_allow_missing_dependencies(true);
    parse_and_resolve(&mut f, &["Blueprints"]);
    generate(&mut f);

    let rendered = manifest(&f);
    assert!(rendered.contains("build out/A.stamp"));
}

#[test]
fn manifest_shape_and_determinism() {
    let mut f = fixture(vec![touch_file(
        "Blueprints",
        &[
            ("A", &["a.c"], &["B"]),
            ("B", &["b.c"], &[]),
        ],
    )]);
    parse_and_resolve(&mut f, &["Blueprints"]);
    generate(&mut f);

    let first = manifest(&f);
    let second = manifest(&f);
    assert_text_eq!(first, second);

    // Ordering: version, globals, then module blocks sorted by name.
    let version = first.find("ninja_required_version = 1.7.0").unwrap();
    let rule = first.find("rule g.test.build.touch").unwrap();
    let module_a = first.find("# Module:  A").unwrap();
    let module_b = first.find("# Module:  B").unwrap();
    assert!(version < rule && rule < module_a && module_a < module_b);

    // B's stamp feeds A's build statement as an implicit input.
    assert!(first.contains("build out/A.stamp: g.test.build.touch a.c | out/B.stamp"));
    assert!(first.contains("build out/B.stamp: g.test.build.touch b.c"));
    assert!(first.lines().all(|l| l.len() <= 80));
}

#[test]
fn variant_split_emits_one_block_per_variant() {
    let mut f = fixture(vec![touch_file("Blueprints", &[("B", &["b.c"], &[])])]);
    f.ctx.register_bottom_up_mutator("arch", |mctx| {
        mctx.create_variations(&["arm", "arm64"]);
    });
    parse_and_resolve(&mut f, &["Blueprints"]);
    generate(&mut f);

    let rendered = manifest(&f);
    assert!(rendered.contains("# Variant: arm"));
    assert!(rendered.contains("# Variant: arm64"));
    assert!(rendered.contains("build out/B.arm.stamp"));
    assert!(rendered.contains("build out/B.arm64.stamp"));
}

struct PhonySingleton {
    pkg: Arc<PackageContext>,
}

impl Singleton for PhonySingleton {
    fn generate_build_actions(&mut self, ctx: &mut crate::context::SingletonContext<'_>) {
        let mut stamps = Vec::new();
        ctx.visit_all_modules(|module| {
            if let Some(out) = ctx.module_provider(module, *super::support::OUTPUT_FILE) {
                stamps.push(String::clone(&out));
            }
        });
        ctx.build(
            &self.pkg,
            BuildParams {
                rule: Some(phony_rule()),
                outputs: vec!["everything".to_string()],
                inputs: stamps,
                ..Default::default()
            },
        );
    }
}

#[test]
fn singleton_emits_after_modules() {
    let mut f = fixture(vec![touch_file(
        "Blueprints",
        &[("A", &["a.c"], &[]), ("B", &["b.c"], &[])],
    )]);
    let pkg = f.pkg.clone();
    f.ctx
        .register_singleton_type("everything", move || {
            Box::new(PhonySingleton { pkg: pkg.clone() })
        });
    parse_and_resolve(&mut f, &["Blueprints"]);
    generate(&mut f);

    let rendered = manifest(&f);
    let singleton = rendered.find("# Singleton: everything").unwrap();
    let module_b = rendered.find("# Module:  B").unwrap();
    assert!(module_b < singleton);
    // The phony rule is builtin and must not be defined in the manifest.
    assert!(rendered.contains("build everything: phony out/A.stamp out/B.stamp"));
    assert!(!rendered.contains("rule phony"));
}

#[test]
fn glob_with_deps_records_the_expansion() {
    let mut f = fixture(vec![touch_file("Blueprints", &[("A", &[], &[])])]);
    {
        // Seed some source files next to the blueprint.
        let fs = crate::fs::MemFileSystem::new();
        fs.add("Blueprints", "");
        fs.add("src/a.c", "");
        fs.add("src/b.c", "");
        fs.add("src/b_test.c", "");
        f.ctx.set_filesystem(fs);
    }
    parse_and_resolve(&mut f, &["Blueprints"]);

    let matches = f
        .ctx
        .glob_with_deps("src/*.c", &["src/*_test.c".to_string()])
        .unwrap();
    assert_eq!(matches, ["src/a.c".to_string(), "src/b.c".to_string()]);

    // Parsed files and recorded expansions both count as manifest
    // dependencies.
    let deps = f.ctx.ninja_file_deps();
    assert!(deps.contains(&"Blueprints".to_string()));
    assert!(deps.iter().any(|d| d.starts_with("src/*.c")));
}

#[test]
fn build_dir_and_subninjas_are_emitted() {
    let mut f = fixture(vec![touch_file("Blueprints", &[("A", &["a.c"], &[])])]);
    f.ctx.set_ninja_build_dir("out");
    f.ctx.set_ninja_build_dir("ignored_second_write");
    f.ctx.add_subninja("extra.ninja");
    parse_and_resolve(&mut f, &["Blueprints"]);
    generate(&mut f);

    let rendered = manifest(&f);
    assert!(rendered.contains("\nbuilddir = out\n"));
    assert!(rendered.contains("\nsubninja extra.ninja\n"));
    assert!(!rendered.contains("ignored_second_write"));
}

// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Property records and the unpacker seam.
//!
//! Property records are opaque to the engine: it stores them, hands them to
//! the unpacker, clones them around variant splits, and never looks
//! inside. The [`PropertyUnpacker`] seam is where an embedder plugs in its
//! own reflection; [`BagUnpacker`] is the default implementation over
//! schema-carrying [`PropertyBag`] records.

use std::any::Any;

use indexmap::IndexMap;

use crate::ast::{ModuleDef, Property, Value};
use crate::error::{BlueprintError, Position};

/// Field categories the engine's default unpacker recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    String,
    Bool,
    StringList,
    OptionalString,
    OptionalBool,
    Nested,
}

impl PropertyKind {
    fn describe(self) -> &'static str {
        match self {
            PropertyKind::String | PropertyKind::OptionalString => "string",
            PropertyKind::Bool | PropertyKind::OptionalBool => "bool",
            PropertyKind::StringList => "list of strings",
            PropertyKind::Nested => "map",
        }
    }
}

/// How a declared field may be populated from a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldAccess {
    #[default]
    Normal,
    /// Owned by mutators; a definition setting it is an error.
    Mutated,
    /// Removed from this record by the embedder; definitions cannot set it.
    Filtered,
}

/// A typed property value held by a [`PropertyBag`].
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Bool(bool),
    StringList(Vec<String>),
    Nested(PropertyBag),
}

/// One record of typed properties attached to a module variant. The trait
/// exists so embedders can supply their own typed structs; the engine only
/// needs cloning and downcasting.
pub trait PropertyRecord: Any + Send + Sync {
    fn clone_record(&self) -> Box<dyn PropertyRecord>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Maps parsed definitions into property records and clones records for
/// variant splits. Implementations live outside the engine; the engine
/// calls them and interprets the returned name→position map.
pub trait PropertyUnpacker: Send + Sync {
    /// Populates `records` from the definition's property map. Returns the
    /// positions of every recognized property (dotted paths for nested
    /// properties), or the binding errors.
    fn unpack(
        &self,
        def: &ModuleDef,
        records: &mut [Box<dyn PropertyRecord>],
    ) -> Result<IndexMap<String, Position>, Vec<BlueprintError>>;

    fn clone_records(&self, records: &[Box<dyn PropertyRecord>]) -> Vec<Box<dyn PropertyRecord>> {
        records.iter().map(|r| r.clone_record()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Field {
    kind: PropertyKind,
    access: FieldAccess,
    /// Nested schema for `Nested` fields; also doubles as the anonymous
    /// embedded record when `embedded` is set.
    nested: Option<PropertyBag>,
    embedded: bool,
    value: Option<PropertyValue>,
}

/// A schema-carrying dynamic property record: field names declared up
/// front with kinds, values filled in by the unpacker, read back by the
/// embedder's module logic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyBag {
    fields: IndexMap<String, Field>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(self, name: &str, kind: PropertyKind) -> Self {
        self.declare_with_access(name, kind, FieldAccess::Normal)
    }

    pub fn declare_mutated(self, name: &str, kind: PropertyKind) -> Self {
        self.declare_with_access(name, kind, FieldAccess::Mutated)
    }

    pub fn declare_filtered(self, name: &str, kind: PropertyKind) -> Self {
        self.declare_with_access(name, kind, FieldAccess::Filtered)
    }

    fn declare_with_access(mut self, name: &str, kind: PropertyKind, access: FieldAccess) -> Self {
        self.fields.insert(
            name.to_string(),
            Field {
                kind,
                access,
                nested: None,
                embedded: false,
                value: None,
            },
        );
        self
    }

    /// Declares a nested struct property addressed as `name.field`.
    pub fn declare_nested(mut self, name: &str, nested: PropertyBag) -> Self {
        self.fields.insert(
            name.to_string(),
            Field {
                kind: PropertyKind::Nested,
                access: FieldAccess::Normal,
                nested: Some(nested),
                embedded: false,
                value: None,
            },
        );
        self
    }

    /// Declares an anonymous embedded record: its fields are addressed at
    /// this record's own level. Support for this convention is advisory;
    /// no behavior in the engine depends on it.
    pub fn declare_embedded(mut self, name: &str, nested: PropertyBag) -> Self {
        self.fields.insert(
            name.to_string(),
            Field {
                kind: PropertyKind::Nested,
                access: FieldAccess::Normal,
                nested: Some(nested),
                embedded: true,
                value: None,
            },
        );
        self
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        match self.lookup(name)?.value.as_ref()? {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn bool_value(&self, name: &str) -> Option<bool> {
        match self.lookup(name)?.value.as_ref()? {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn string_list(&self, name: &str) -> &[String] {
        match self.lookup(name).and_then(|f| f.value.as_ref()) {
            Some(PropertyValue::StringList(l)) => l,
            _ => &[],
        }
    }

    pub fn nested(&self, name: &str) -> Option<&PropertyBag> {
        match self.lookup(name)?.value.as_ref()? {
            PropertyValue::Nested(bag) => Some(bag),
            _ => None,
        }
    }

    /// Overwrites a field's value; mutators use this on cloned records.
    pub fn set(&mut self, name: &str, value: PropertyValue) {
        if let Some(field) = self.fields.get_mut(name) {
            field.value = Some(value);
        }
    }

    fn lookup(&self, name: &str) -> Option<&Field> {
        if let Some(field) = self.fields.get(name) {
            return Some(field);
        }
        // Fall back to anonymous embedded records.
        self.fields
            .values()
            .filter(|f| f.embedded)
            .find_map(|f| f.nested.as_ref()?.lookup(name))
    }

    fn field_mut_for(&mut self, name: &str) -> Option<&mut Field> {
        if self.fields.contains_key(name) {
            return self.fields.get_mut(name);
        }
        self.fields
            .values_mut()
            .filter(|f| f.embedded)
            .find_map(|f| f.nested.as_mut()?.field_mut_for(name))
    }

    fn bind(
        &mut self,
        prefix: &str,
        properties: &[Property],
        positions: &mut IndexMap<String, Position>,
        errors: &mut Vec<BlueprintError>,
    ) -> usize {
        let mut bound = 0;
        for property in properties {
            let path = if prefix.is_empty() {
                property.name.clone()
            } else {
                format!("{prefix}.{}", property.name)
            };
            let Some(field) = self.field_mut_for(&property.name) else {
                continue;
            };
            bound += 1;
            match field.access {
                FieldAccess::Mutated => {
                    errors.push(BlueprintError::MutatedFieldSet {
                        name: path,
                        pos: property.pos.clone(),
                    });
                    continue;
                }
                FieldAccess::Filtered => {
                    errors.push(BlueprintError::FilteredFieldSet {
                        name: path,
                        pos: property.pos.clone(),
                    });
                    continue;
                }
                FieldAccess::Normal => {}
            }
            match (field.kind, &property.value) {
                (PropertyKind::String | PropertyKind::OptionalString, Value::String(s)) => {
                    field.value = Some(PropertyValue::String(s.clone()));
                    positions.insert(path, property.pos.clone());
                }
                (PropertyKind::Bool | PropertyKind::OptionalBool, Value::Bool(b)) => {
                    field.value = Some(PropertyValue::Bool(*b));
                    positions.insert(path, property.pos.clone());
                }
                (PropertyKind::StringList, Value::List(_)) => {
                    match property.value.as_string_list() {
                        Some(list) => {
                            field.value = Some(PropertyValue::StringList(list));
                            positions.insert(path, property.pos.clone());
                        }
                        None => errors.push(BlueprintError::PropertyTypeMismatch {
                            name: path,
                            expected: "list of strings",
                            found: "mixed list",
                            pos: property.pos.clone(),
                        }),
                    }
                }
                (PropertyKind::Nested, Value::Map(nested_props)) => {
                    let Some(nested) = field.nested.as_mut() else {
                        continue;
                    };
                    positions.insert(path.clone(), property.pos.clone());
                    let nested_bound = nested.bind(&path, nested_props, positions, errors);
                    if nested_bound < nested_props.len() {
                        for p in nested_props {
                            if nested.lookup(&p.name).is_none() {
                                errors.push(BlueprintError::UnrecognizedProperty {
                                    name: format!("{path}.{}", p.name),
                                    pos: p.pos.clone(),
                                });
                            }
                        }
                    }
                    field.value = Some(PropertyValue::Nested(nested.clone()));
                }
                (kind, value) => errors.push(BlueprintError::PropertyTypeMismatch {
                    name: path,
                    expected: kind.describe(),
                    found: value.kind_name(),
                    pos: property.pos.clone(),
                }),
            }
        }
        bound
    }
}

impl PropertyRecord for PropertyBag {
    fn clone_record(&self) -> Box<dyn PropertyRecord> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Convenience downcast for embedders reading their records back.
pub fn record_as_bag(record: &dyn PropertyRecord) -> Option<&PropertyBag> {
    record.as_any().downcast_ref::<PropertyBag>()
}

pub fn record_as_bag_mut(record: &mut dyn PropertyRecord) -> Option<&mut PropertyBag> {
    record.as_any_mut().downcast_mut::<PropertyBag>()
}

/// Default unpacker over [`PropertyBag`] records. A property binds to the
/// first record that declares it; a property no record declares is an
/// `unrecognized-property` error. The `name` property is always accepted:
/// the engine itself consumes it.
#[derive(Default)]
pub struct BagUnpacker;

impl PropertyUnpacker for BagUnpacker {
    fn unpack(
        &self,
        def: &ModuleDef,
        records: &mut [Box<dyn PropertyRecord>],
    ) -> Result<IndexMap<String, Position>, Vec<BlueprintError>> {
        let mut positions = IndexMap::new();
        let mut errors = Vec::new();

        for property in &def.properties {
            if property.name == "name" {
                positions.insert("name".to_string(), property.pos.clone());
                continue;
            }
            let mut bound = false;
            for record in records.iter_mut() {
                let Some(bag) = record_as_bag_mut(record.as_mut()) else {
                    continue;
                };
                if bag
                    .bind(
                        "",
                        std::slice::from_ref(property),
                        &mut positions,
                        &mut errors,
                    )
                    > 0
                {
                    bound = true;
                    break;
                }
            }
            if !bound {
                errors.push(BlueprintError::UnrecognizedProperty {
                    name: property.name.clone(),
                    pos: property.pos.clone(),
                });
            }
        }

        if errors.is_empty() {
            Ok(positions)
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(properties: Vec<Property>) -> ModuleDef {
        ModuleDef {
            type_name: "library".to_string(),
            pos: Position::default(),
            properties,
        }
    }

    fn prop(name: &str, value: Value) -> Property {
        Property {
            name: name.to_string(),
            pos: Position::new("Blueprints", 1, 1),
            value,
        }
    }

    fn library_bag() -> PropertyBag {
        PropertyBag::new()
            .declare("srcs", PropertyKind::StringList)
            .declare("shared", PropertyKind::OptionalBool)
            .declare_mutated("generated", PropertyKind::Bool)
            .declare_nested(
                "link",
                PropertyBag::new().declare("static_libs", PropertyKind::StringList),
            )
    }

    fn unpack(
        def: &ModuleDef,
    ) -> (
        Vec<Box<dyn PropertyRecord>>,
        Result<IndexMap<String, Position>, Vec<BlueprintError>>,
    ) {
        let mut records: Vec<Box<dyn PropertyRecord>> = vec![Box::new(library_bag())];
        let result = BagUnpacker.unpack(def, &mut records);
        (records, result)
    }

    #[test]
    fn binds_typed_fields_and_reports_positions() {
        let def = def(vec![
            prop("name", Value::String("libfoo".to_string())),
            prop(
                "srcs",
                Value::List(vec![Value::String("a.c".to_string())]),
            ),
            prop("shared", Value::Bool(true)),
            prop(
                "link",
                Value::Map(vec![prop(
                    "static_libs",
                    Value::List(vec![Value::String("libbar".to_string())]),
                )]),
            ),
        ]);
        let (records, result) = unpack(&def);
        let positions = result.unwrap();
        assert!(positions.contains_key("srcs"));
        assert!(positions.contains_key("link.static_libs"));

        let bag = record_as_bag(records[0].as_ref()).unwrap();
        assert_eq!(bag.string_list("srcs"), ["a.c".to_string()]);
        assert_eq!(bag.bool_value("shared"), Some(true));
        assert_eq!(
            bag.nested("link").unwrap().string_list("static_libs"),
            ["libbar".to_string()]
        );
    }

    #[test]
    fn unknown_property_is_an_error() {
        let def = def(vec![prop("bogus", Value::Bool(true))]);
        let (_, result) = unpack(&def);
        let errors = result.unwrap_err();
        assert!(matches!(
            &errors[0],
            BlueprintError::UnrecognizedProperty { name, .. } if name == "bogus"
        ));
    }

    #[test]
    fn type_mismatch_names_both_kinds() {
        let def = def(vec![prop("srcs", Value::Bool(true))]);
        let (_, result) = unpack(&def);
        let errors = result.unwrap_err();
        assert!(matches!(
            &errors[0],
            BlueprintError::PropertyTypeMismatch { expected, found, .. }
                if *expected == "list of strings" && *found == "bool"
        ));
    }

    #[test]
    fn mutated_field_cannot_be_set_in_a_definition() {
        let def = def(vec![prop("generated", Value::Bool(true))]);
        let (_, result) = unpack(&def);
        let errors = result.unwrap_err();
        assert!(matches!(
            &errors[0],
            BlueprintError::MutatedFieldSet { name, .. } if name == "generated"
        ));
    }

    #[test]
    fn embedded_record_binds_at_parent_level() {
        let bag = PropertyBag::new().declare_embedded(
            "base",
            PropertyBag::new().declare("enabled", PropertyKind::Bool),
        );
        let mut records: Vec<Box<dyn PropertyRecord>> = vec![Box::new(bag)];
        let def = def(vec![prop("enabled", Value::Bool(true))]);
        BagUnpacker.unpack(&def, &mut records).unwrap();
        let bag = record_as_bag(records[0].as_ref()).unwrap();
        assert_eq!(bag.bool_value("enabled"), Some(true));
    }

    #[test]
    fn cloned_records_are_independent() {
        let mut bag = PropertyBag::new().declare("srcs", PropertyKind::StringList);
        bag.set(
            "srcs",
            PropertyValue::StringList(vec!["a.c".to_string()]),
        );
        let clone = bag.clone_record();
        bag.set("srcs", PropertyValue::StringList(vec![]));
        let cloned_bag = record_as_bag(clone.as_ref()).unwrap();
        assert_eq!(cloned_bag.string_list("srcs"), ["a.c".to_string()]);
    }
}

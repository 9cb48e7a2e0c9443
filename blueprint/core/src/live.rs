// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Tracks which variables, rules, and pools are reachable from emitted
//! build statements. Only live entities appear in the manifest.
//!
//! Reachability is transitive: a build statement keeps its rule live, a
//! rule keeps the variables in its command live, and a variable keeps the
//! variables in its own value live.

use std::collections::HashMap;

use crate::ninja::{BuildDef, NinjaString};
use crate::scope::{Pool, Rule, RuleKind, Variable};

#[derive(Clone, Default)]
pub(crate) struct LiveTracker {
    variables: HashMap<u64, Variable>,
    rules: HashMap<u64, Rule>,
    pools: HashMap<u64, Pool>,
}

impl LiveTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_build_def(&mut self, def: &BuildDef) {
        self.add_rule(&def.rule);
        for value in def.referenced_values() {
            self.add_value(value);
        }
    }

    pub(crate) fn add_rule(&mut self, rule: &Rule) {
        if rule.kind() == RuleKind::Builtin {
            return;
        }
        if self.rules.insert(rule.id(), rule.clone()).is_some() {
            return;
        }
        if let Some(params) = rule.params() {
            self.add_value(&params.command);
            for value in [
                &params.depfile,
                &params.deps,
                &params.description,
                &params.rspfile,
                &params.rspfile_content,
            ]
            .into_iter()
            .flatten()
            {
                self.add_value(value);
            }
            if let Some(pool) = &params.pool {
                self.add_pool(pool);
            }
        }
    }

    pub(crate) fn add_value(&mut self, value: &NinjaString) {
        for variable in value.variables() {
            self.add_variable(variable);
        }
    }

    pub(crate) fn add_variable(&mut self, variable: &Variable) {
        // Rule arguments and builtins are placeholders, not definitions.
        let Some(value) = variable.value() else {
            return;
        };
        if self
            .variables
            .insert(variable.id(), variable.clone())
            .is_some()
        {
            return;
        }
        let value = value.clone();
        self.add_value(&value);
    }

    pub(crate) fn add_pool(&mut self, pool: &Pool) {
        self.pools.insert(pool.id(), pool.clone());
    }

    /// Consumes liveness of a module-local definition: returns whether the
    /// variable was live, and removes it so it is emitted exactly once.
    pub(crate) fn remove_variable_if_live(&mut self, variable: &Variable) -> bool {
        self.variables.remove(&variable.id()).is_some()
    }

    pub(crate) fn remove_rule_if_live(&mut self, rule: &Rule) -> bool {
        self.rules.remove(&rule.id()).is_some()
    }

    pub(crate) fn live_global_variables(&self) -> Vec<Variable> {
        let mut variables: Vec<Variable> = self
            .variables
            .values()
            .filter(|v| v.is_global())
            .cloned()
            .collect();
        variables.sort_by_key(|v| v.full_name());
        variables
    }

    pub(crate) fn live_global_rules(&self) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self.rules.values().cloned().collect();
        rules.sort_by_key(|r| r.full_name());
        rules
    }

    pub(crate) fn live_pools(&self) -> Vec<Pool> {
        let mut pools: Vec<Pool> = self.pools.values().cloned().collect();
        pools.sort_by_key(|p| p.full_name());
        pools
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ninja::BuildParams;
    use crate::scope::{PackageContext, PackageLookup, PoolParams, RuleParams};

    #[test]
    fn build_def_keeps_rule_and_transitive_variables_live() {
        let pctx = PackageContext::new("cc");
        let cc_bin = pctx.static_variable("Bin", "/usr/bin/cc");
        pctx.static_variable("Flags", "-O2 ${Bin}");
        let pool = pctx.static_pool("link_pool", PoolParams {
            comment: None,
            depth: 2,
        });
        let rule = pctx.static_rule(
            "compile",
            RuleParams {
                command: "${Flags} -o ${out} ${in}".to_string(),
                pool: Some(pool),
                ..Default::default()
            },
            &[],
        );
        let unused = pctx.static_variable("Unused", "x");

        let lookup = PackageLookup { pkg: &pctx };
        let def = BuildDef::parse(
            &lookup,
            BuildParams {
                rule: Some(rule),
                outputs: vec!["a.o".to_string()],
                inputs: vec!["a.c".to_string()],
                ..Default::default()
            },
        )
        .unwrap();

        let mut tracker = LiveTracker::new();
        tracker.add_build_def(&def);

        let live: Vec<String> = tracker
            .live_global_variables()
            .iter()
            .map(|v| v.full_name())
            .collect();
        // Flags is referenced by the command; Bin transitively by Flags.
        assert_eq!(live, vec!["g.cc.Bin".to_string(), "g.cc.Flags".to_string()]);
        assert!(!live.contains(&unused.full_name()));
        assert_eq!(tracker.live_pools().len(), 1);
        assert_eq!(tracker.live_global_rules().len(), 1);

        // Consuming liveness removes the entry.
        assert!(tracker.remove_variable_if_live(&cc_bin));
        assert!(!tracker.remove_variable_if_live(&cc_bin));
    }
}

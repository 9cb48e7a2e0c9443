// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Singletons: registered callbacks that emit build statements once per
//! build. Regular singletons run after every module's generate call;
//! pre-singletons run during resolve, before any mutator, and typically
//! define shared globals.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::module::ModuleActions;

pub trait Singleton: Any + Send + Sync {
    fn generate_build_actions(&mut self, ctx: &mut crate::context::SingletonContext<'_>);
}

pub type SingletonFactory = Arc<dyn Fn() -> Box<dyn Singleton> + Send + Sync>;

pub(crate) struct SingletonInfo {
    pub(crate) name: String,
    pub(crate) singleton: Mutex<Box<dyn Singleton>>,
    /// Output recorded when the singleton ran, emitted after all modules.
    pub(crate) actions: Mutex<ModuleActions>,
    /// Pre-singletons run during resolve rather than generate.
    pub(crate) pre: bool,
}

impl SingletonInfo {
    pub(crate) fn new(name: &str, factory: &SingletonFactory, pre: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            singleton: Mutex::new(factory()),
            actions: Mutex::new(ModuleActions::default()),
            pre,
        })
    }
}

// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Dependency-ordered parallel visitor with bounded parallelism,
//! cooperative pause/resume, cancellation, and deadlock detection.
//!
//! Each module carries a wait count derived from the visit order. Ready
//! modules run on worker threads up to the parallelism limit. A visitor
//! may pause itself until another module finishes; the pause releases its
//! active slot, and resumed visitors take priority over new starts since
//! pausers may hold resources. When nothing can run but paused visitors
//! remain, the scheduler searches the wait graph plus the pause records
//! for the cycle that must exist; not finding one is an engine bug and
//! panics.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::error::BlueprintError;
use crate::module::{ModuleId, ModuleInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VisitOrder {
    Unordered,
    /// Forward dependencies are visited before their dependers.
    BottomUp,
    /// Reverse dependencies are visited before the modules they depend on.
    TopDown,
}

/// Returned by a visitor to stop the pass after in-flight work drains.
pub(crate) const CANCEL: bool = true;
pub(crate) const CONTINUE: bool = false;

/// The pause failed because the scheduler is shutting down (cancellation
/// or a detected cycle). The visitor should give up and return.
#[derive(Debug)]
pub(crate) struct PauseInterrupted;

struct SchedState {
    wait_counts: Vec<usize>,
    ready: VecDeque<usize>,
    /// Paused visitors granted a slot again, drained before `ready`.
    resume_queue: VecDeque<usize>,
    resume_granted: HashSet<usize>,
    /// until-index → paused waiter indices.
    paused: HashMap<usize, Vec<usize>>,
    /// Per-module pause edge, for the deadlock search.
    pause_edges: Vec<Option<usize>>,
    paused_count: usize,
    finished: Vec<bool>,
    active: usize,
    visited: usize,
    cancel: bool,
    shutdown: bool,
    errors: Vec<BlueprintError>,
}

struct Shared {
    state: Mutex<SchedState>,
    /// Wakes the coordinator when state changed.
    coord: Condvar,
    /// Wakes paused workers to re-check their resume grant.
    pause: Condvar,
}

/// Lets a visitor suspend itself until another module has been visited.
pub(crate) struct PauseHandle<'a> {
    shared: &'a Shared,
    index_of: &'a HashMap<ModuleId, usize>,
    self_index: usize,
}

impl PauseHandle<'_> {
    /// Blocks until `until` has finished. Returns immediately when it
    /// already has, or when it is not part of this pass at all.
    pub(crate) fn pause_until(&self, until: ModuleId) -> Result<(), PauseInterrupted> {
        let Some(&until) = self.index_of.get(&until) else {
            return Ok(());
        };
        let mut st = self.shared.state.lock();
        if st.finished[until] {
            return Ok(());
        }
        if st.shutdown || st.cancel {
            return Err(PauseInterrupted);
        }
        trace!(pauser = self.self_index, until, "visitor pausing");
        st.active -= 1;
        st.paused.entry(until).or_default().push(self.self_index);
        st.pause_edges[self.self_index] = Some(until);
        st.paused_count += 1;
        self.shared.coord.notify_one();
        loop {
            self.shared.pause.wait(&mut st);
            if st.resume_granted.remove(&self.self_index) {
                st.pause_edges[self.self_index] = None;
                trace!(pauser = self.self_index, "visitor resumed");
                return Ok(());
            }
            if st.shutdown {
                // Reacquire a slot so the uniform finish path balances the
                // books, then bail out.
                st.active += 1;
                st.pause_edges[self.self_index] = None;
                if let Some(waiters) = st.paused.get_mut(&until) {
                    waiters.retain(|&w| w != self.self_index);
                }
                st.paused_count -= 1;
                return Err(PauseInterrupted);
            }
        }
    }
}

/// Invokes `visit` on every module exactly once, respecting `order`, with
/// at most `limit` visitors running concurrently. Returns the errors the
/// scheduler itself produced (callback panics and pause cycles); visitors
/// report their own errors through their contexts.
pub(crate) fn parallel_visit<F>(
    modules: &[Arc<ModuleInfo>],
    order: VisitOrder,
    limit: usize,
    describe: &(dyn Fn(ModuleId) -> String + Sync),
    visit: F,
) -> Vec<BlueprintError>
where
    F: Fn(&Arc<ModuleInfo>, &PauseHandle<'_>) -> bool + Sync,
{
    let n = modules.len();
    if n == 0 {
        return Vec::new();
    }
    let limit = limit.max(1);

    let index_of: HashMap<ModuleId, usize> =
        modules.iter().enumerate().map(|(i, m)| (m.id, i)).collect();

    // Wait-direction adjacency (who each module waits for) and its
    // reverse (who to notify on finish), restricted to this pass.
    let mut waits_on: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut propagate: Vec<Vec<usize>> = vec![Vec::new(); n];
    if order != VisitOrder::Unordered {
        for (i, module) in modules.iter().enumerate() {
            let state = module.state.read();
            let blockers = match order {
                VisitOrder::BottomUp => &state.forward_deps,
                VisitOrder::TopDown => &state.reverse_deps,
                VisitOrder::Unordered => unreachable!(),
            };
            for blocker in blockers {
                if let Some(&b) = index_of.get(blocker) {
                    waits_on[i].push(b);
                    propagate[b].push(i);
                }
            }
        }
    }

    let ready: VecDeque<usize> = (0..n).filter(|&i| waits_on[i].is_empty()).collect();
    let shared = Shared {
        state: Mutex::new(SchedState {
            wait_counts: waits_on.iter().map(Vec::len).collect(),
            ready,
            resume_queue: VecDeque::new(),
            resume_granted: HashSet::new(),
            paused: HashMap::new(),
            pause_edges: vec![None; n],
            paused_count: 0,
            finished: vec![false; n],
            active: 0,
            visited: 0,
            cancel: false,
            shutdown: false,
            errors: Vec::new(),
        }),
        coord: Condvar::new(),
        pause: Condvar::new(),
    };

    // Defined outside the scope so spawned threads may borrow it until
    // the implicit join.
    let worker = |i: usize| {
        let handle = PauseHandle {
            shared: &shared,
            index_of: &index_of,
            self_index: i,
        };
        let result = catch_unwind(AssertUnwindSafe(|| visit(&modules[i], &handle)));
        let mut st = shared.state.lock();
        match result {
            Ok(cancel) => {
                if cancel {
                    debug!(module = %describe(modules[i].id), "visitor requested cancellation");
                    st.cancel = true;
                }
            }
            Err(payload) => {
                st.errors.push(BlueprintError::PanickedCallback {
                    context: describe(modules[i].id),
                    message: panic_message(payload),
                });
                st.cancel = true;
            }
        }
        st.active -= 1;
        st.visited += 1;
        st.finished[i] = true;
        for &t in &propagate[i] {
            st.wait_counts[t] -= 1;
            if st.wait_counts[t] == 0 {
                st.ready.push_back(t);
            }
        }
        if let Some(waiters) = st.paused.remove(&i) {
            st.paused_count -= waiters.len();
            st.resume_queue.extend(waiters);
        }
        shared.coord.notify_one();
    };
    let worker = &worker;

    std::thread::scope(|scope| {
        let mut st = shared.state.lock();
        loop {
            // Grant slots: resumed pausers first, then fresh work.
            while st.active < limit {
                if let Some(i) = st.resume_queue.pop_front() {
                    st.active += 1;
                    st.resume_granted.insert(i);
                    shared.pause.notify_all();
                } else if !st.cancel {
                    let Some(i) = st.ready.pop_front() else {
                        break;
                    };
                    st.active += 1;
                    drop(st);
                    scope.spawn(move || worker(i));
                    st = shared.state.lock();
                } else {
                    break;
                }
            }

            if st.active == 0 && st.resume_queue.is_empty() {
                if st.paused_count > 0 && !st.shutdown {
                    if !st.cancel {
                        // Nothing can run but visitors are paused: there
                        // must be a cycle through the wait graph and the
                        // pause records.
                        let errors = find_pause_cycle(&st, &waits_on, modules, describe);
                        st.errors.extend(errors);
                        st.cancel = true;
                    }
                    // Cancellation strands pausers; release them so the
                    // scope can join.
                    st.shutdown = true;
                    shared.pause.notify_all();
                } else if st.paused_count == 0 && (st.cancel || st.ready.is_empty()) {
                    break;
                }
            }
            shared.coord.wait(&mut st);
        }

        if !st.cancel {
            // Invariants at a clean finish.
            debug_assert_eq!(st.visited, n);
            debug_assert!(st.ready.is_empty());
            debug_assert!(st.paused.values().all(Vec::is_empty) || st.paused.is_empty());
        }
        std::mem::take(&mut st.errors)
    })
}

/// Searches for a cycle through unfinished modules' wait edges and the
/// pause map, starting from each pause record's `until`. Panics when no
/// cycle exists: the scheduler's invariants were violated.
fn find_pause_cycle(
    st: &SchedState,
    waits_on: &[Vec<usize>],
    modules: &[Arc<ModuleInfo>],
    describe: &(dyn Fn(ModuleId) -> String + Sync),
) -> Vec<BlueprintError> {
    for (&until, waiters) in &st.paused {
        for &pauser in waiters {
            let mut path = Vec::new();
            let mut visited = HashSet::new();
            if search(st, waits_on, until, pauser, &mut path, &mut visited) {
                let mut cycle = Vec::with_capacity(path.len() + 1);
                cycle.push(describe(modules[pauser].id));
                cycle.extend(path.iter().map(|&i| describe(modules[i].id)));
                return vec![BlueprintError::DependencyCycle { cycle }];
            }
        }
    }
    panic!("parallel visit deadlocked without a dependency cycle");
}

/// Depth-first search from `from` to `target` over unfinished wait edges
/// and pause edges. On success `path` holds the nodes from `from` up to,
/// but excluding, `target`.
fn search(
    st: &SchedState,
    waits_on: &[Vec<usize>],
    from: usize,
    target: usize,
    path: &mut Vec<usize>,
    visited: &mut HashSet<usize>,
) -> bool {
    if !visited.insert(from) {
        return false;
    }
    path.push(from);
    let mut successors: Vec<usize> = waits_on[from]
        .iter()
        .copied()
        .filter(|&b| !st.finished[b])
        .collect();
    if let Some(until) = st.pause_edges[from] {
        successors.push(until);
    }
    for next in successors {
        if next == target {
            return true;
        }
        if search(st, waits_on, next, target, path, visited) {
            return true;
        }
    }
    path.pop();
    false
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Position;
    use crate::module::{
        base_dep_tag, DepEdge, GroupId, Module, ModuleGraph, ModuleState, VariationMap,
    };
    use crate::properties::PropertyBag;
    use indexmap::IndexMap;
    use parking_lot::Mutex;

    struct NullModule;

    impl Module for NullModule {
        fn generate_build_actions(&mut self, _ctx: &mut crate::context::ModuleContext<'_>) {}

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    fn build_graph(names: &[&str], edges: &[(usize, usize)]) -> (ModuleGraph, Vec<ModuleId>) {
        let mut graph = ModuleGraph::new();
        let mut ids = Vec::new();
        for name in names {
            let group = graph.add_group(*name);
            let state = ModuleState::new(
                Box::new(NullModule),
                vec![Box::new(PropertyBag::new())],
                IndexMap::new(),
            );
            ids.push(graph.add_module(
                group,
                "test".to_string(),
                Arc::new(|| {
                    (
                        Box::new(NullModule) as Box<dyn Module>,
                        vec![Box::new(PropertyBag::new()) as Box<dyn crate::properties::PropertyRecord>],
                    )
                }),
                Position::default(),
                String::new(),
                state,
            ));
        }
        for &(from, to) in edges {
            graph.module(ids[from]).state.write().direct_deps.push(DepEdge {
                module: ids[to],
                tag: base_dep_tag(),
                requested: VariationMap::new(),
                far: false,
            });
        }
        let order: Vec<GroupId> = graph.groups.iter().map(|g| g.id).collect();
        let errors = graph.update_dependencies(&order);
        assert!(errors.is_empty());
        (graph, ids)
    }

    fn names_of(graph: &ModuleGraph, visited: &Mutex<Vec<ModuleId>>) -> Vec<String> {
        visited
            .lock()
            .iter()
            .map(|&id| graph.module_name(id))
            .collect()
    }

    #[test]
    fn bottom_up_visits_dependencies_first() {
        let (graph, _) = build_graph(&["A", "B", "C"], &[(0, 1), (1, 2)]);
        let modules: Vec<_> = graph.modules_sorted.iter().map(|&id| graph.module(id).clone()).collect();
        let visited = Mutex::new(Vec::new());
        let describe = |id: ModuleId| graph.module_name(id);

        let errors = parallel_visit(&modules, VisitOrder::BottomUp, 4, &describe, |m, _| {
            visited.lock().push(m.id);
            CONTINUE
        });
        assert!(errors.is_empty());
        assert_eq!(names_of(&graph, &visited), ["C", "B", "A"]);
    }

    #[test]
    fn top_down_visits_dependers_first() {
        let (graph, _) = build_graph(&["A", "B", "C"], &[(0, 1), (1, 2)]);
        let modules: Vec<_> = graph.modules_sorted.iter().map(|&id| graph.module(id).clone()).collect();
        let visited = Mutex::new(Vec::new());
        let describe = |id: ModuleId| graph.module_name(id);

        let errors = parallel_visit(&modules, VisitOrder::TopDown, 1, &describe, |m, _| {
            visited.lock().push(m.id);
            CONTINUE
        });
        assert!(errors.is_empty());
        assert_eq!(names_of(&graph, &visited), ["A", "B", "C"]);
    }

    #[test]
    fn pause_until_finished_target_returns_immediately() {
        let (graph, ids) = build_graph(&["A", "B"], &[(0, 1)]);
        let modules: Vec<_> = graph.modules_sorted.iter().map(|&id| graph.module(id).clone()).collect();
        let describe = |id: ModuleId| graph.module_name(id);

        // A runs after B in bottom-up order, so B is already finished.
        let errors = parallel_visit(&modules, VisitOrder::BottomUp, 2, &describe, |m, pause| {
            if m.id == ids[0] {
                pause.pause_until(ids[1]).unwrap();
            }
            CONTINUE
        });
        assert!(errors.is_empty());
    }

    #[test]
    fn mutual_pause_reports_dependency_cycle() {
        let (graph, ids) = build_graph(&["A", "B", "C", "D"], &[(0, 1), (1, 2)]);
        let modules: Vec<_> = graph.modules_sorted.iter().map(|&id| graph.module(id).clone()).collect();
        let describe = |id: ModuleId| graph.module_name(id);
        let (c, d) = (ids[2], ids[3]);

        let errors = parallel_visit(&modules, VisitOrder::BottomUp, 4, &describe, |m, pause| {
            if m.id == c {
                let _ = pause.pause_until(d);
            } else if m.id == d {
                let _ = pause.pause_until(c);
            }
            CONTINUE
        });
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            BlueprintError::DependencyCycle { cycle } => {
                assert_eq!(cycle.len(), 2);
                assert!(cycle.contains(&"C".to_string()));
                assert!(cycle.contains(&"D".to_string()));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn cancellation_stops_new_work() {
        let (graph, _) = build_graph(&["A", "B", "C"], &[(0, 1), (1, 2)]);
        let modules: Vec<_> = graph.modules_sorted.iter().map(|&id| graph.module(id).clone()).collect();
        let visited = Mutex::new(Vec::new());
        let describe = |id: ModuleId| graph.module_name(id);

        let errors = parallel_visit(&modules, VisitOrder::BottomUp, 1, &describe, |m, _| {
            visited.lock().push(m.id);
            CANCEL
        });
        assert!(errors.is_empty());
        // C cancels the pass before B and A run.
        assert_eq!(names_of(&graph, &visited), ["C"]);
    }

    #[test]
    fn randomized_dags_respect_bottom_up_order() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::from_seed([7; 32]);
        for _ in 0..10 {
            let n = 12;
            let names: Vec<String> = (0..n).map(|i| format!("m{i}")).collect();
            let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
            // Edges from lower to higher index keep the graph acyclic.
            let mut edges = Vec::new();
            for i in 0..n {
                for j in (i + 1)..n {
                    if rng.gen_bool(0.2) {
                        edges.push((i, j));
                    }
                }
            }

            let (graph, ids) = build_graph(&name_refs, &edges);
            let modules: Vec<_> = graph
                .modules_sorted
                .iter()
                .map(|&id| graph.module(id).clone())
                .collect();
            let describe = |id: ModuleId| graph.module_name(id);
            let finished = Mutex::new(Vec::new());

            let errors =
                parallel_visit(&modules, VisitOrder::BottomUp, 4, &describe, |m, _| {
                    finished.lock().push(m.id);
                    CONTINUE
                });
            assert!(errors.is_empty());

            let finished = finished.lock();
            assert_eq!(finished.len(), n);
            let position = |id: ModuleId| finished.iter().position(|&f| f == id).unwrap();
            for &(depender, dep) in &edges {
                assert!(
                    position(ids[dep]) < position(ids[depender]),
                    "dependency visited after its depender"
                );
            }
        }
    }

    #[test]
    fn panicking_visitor_becomes_an_error() {
        let (graph, ids) = build_graph(&["A", "B"], &[]);
        let modules: Vec<_> = graph.modules_sorted.iter().map(|&id| graph.module(id).clone()).collect();
        let describe = |id: ModuleId| graph.module_name(id);
        let a = ids[0];

        let errors = parallel_visit(&modules, VisitOrder::Unordered, 1, &describe, |m, _| {
            if m.id == a {
                panic!("boom");
            }
            CONTINUE
        });
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            BlueprintError::PanickedCallback { context, message } => {
                assert_eq!(context, "A");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}

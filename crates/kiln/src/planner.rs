//! Deterministic traversals over the dependency DAG.
//!
//! All walks are depth-first post-order: an element appears after every
//! dependency the walk reaches, the first visit of a node fixes its
//! position, and ties break by declaration order of the edges. Two visited
//! bitmaps (build and run components) let one walk answer BUILD and RUN
//! traversals without revisiting.

use kiln_types::Scope;

use crate::element::{ElementId, Graph};

/// Ordered iteration over `targets`' dependencies in the given scope.
///
/// - `All`: each target and its transitive dependencies of both kinds.
/// - `Build`: build dependencies plus their run closures, excluding the
///   targets themselves.
/// - `Run`: each target plus its transitive runtime dependencies.
pub fn dependencies(graph: &Graph, targets: &[ElementId], scope: Scope) -> Vec<ElementId> {
    let mut all_visited = vec![false; graph.len()];
    let mut run_visited = vec![false; graph.len()];
    let mut out = Vec::new();

    for &target in targets {
        match scope {
            Scope::All => visit_all(graph, target, &mut all_visited, &mut out),
            Scope::Run => visit_run(graph, target, &mut run_visited, &mut out),
            Scope::Build => {
                let deps: Vec<ElementId> = graph.get(target).direct_build_deps().collect();
                for dep in deps {
                    visit_run(graph, dep, &mut run_visited, &mut out);
                }
            }
        }
    }
    out
}

fn visit_all(graph: &Graph, id: ElementId, visited: &mut [bool], out: &mut Vec<ElementId>) {
    if visited[id.index()] {
        return;
    }
    visited[id.index()] = true;
    let deps: Vec<ElementId> = graph.get(id).dependencies.iter().map(|d| d.id).collect();
    for dep in deps {
        visit_all(graph, dep, visited, out);
    }
    out.push(id);
}

fn visit_run(graph: &Graph, id: ElementId, visited: &mut [bool], out: &mut Vec<ElementId>) {
    if visited[id.index()] {
        return;
    }
    visited[id.index()] = true;
    let deps: Vec<ElementId> = graph.get(id).direct_runtime_deps().collect();
    for dep in deps {
        visit_run(graph, dep, visited, out);
    }
    out.push(id);
}

/// A depth-annotated build ordering: leaves first, each element's depth one
/// past its deepest dependency.
pub fn plan(graph: &Graph, targets: &[ElementId]) -> Vec<(ElementId, u32)> {
    let closure = dependencies(graph, targets, Scope::All);

    let mut in_plan = vec![false; graph.len()];
    for id in &closure {
        in_plan[id.index()] = true;
    }

    // The closure is post-ordered, so dependency depths resolve before
    // their dependents are reached.
    let mut depth = vec![0u32; graph.len()];
    for id in &closure {
        let deepest = graph
            .get(*id)
            .dependencies
            .iter()
            .filter(|d| in_plan[d.id.index()])
            .map(|d| depth[d.id.index()] + 1)
            .max()
            .unwrap_or(0);
        depth[id.index()] = deepest;
    }

    let mut out: Vec<(ElementId, u32)> = closure
        .iter()
        .map(|id| (*id, depth[id.index()]))
        .collect();
    out.sort_by_key(|(id, d)| (*d, closure.iter().position(|c| c == id)));
    out
}

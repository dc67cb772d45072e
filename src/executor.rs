//! Parallel execution of the task graph.
//!
//! The scheduler performs a parallel topological traversal: tasks are handed
//! to rayon workers as soon as their dependency count reaches zero, and
//! results flow back over a channel. A cycle anywhere in the graph is a
//! configuration error and is rejected before any task runs.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crossbeam_channel::unbounded;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use petgraph::algo::toposort;
use petgraph::graph::NodeIndex;
use petgraph::visit::Dfs;

use crate::blueprint::Workbench;
use crate::error::{BuildError, ConfigError};
use crate::process::{CancelToken, ToolRunner};
use crate::task::{Dynamic, TaskContext};

/// Executes `nodes_to_run` (which must be closed under predecessors) on a
/// thread pool and returns the cache of task outputs.
///
/// The algorithm works as follows:
/// 1. The graph is toposorted once, purely to detect cycles.
/// 2. Tasks whose dependency count is zero are sent to rayon workers.
/// 3. The main thread waits for results. Each completed task decrements the
///    dependency counts of its dependents; counts reaching zero dispatch
///    immediately.
/// 4. A task whose freshness probe fires is not executed; its probed output
///    enters the cache as if it had run.
/// 5. A failed task poisons its transitive dependents, which are never
///    dispatched; unrelated tasks keep running. The first failure is
///    reported once the graph has drained.
pub(crate) fn run_parallel(
    workbench: &Workbench,
    tools: &dyn ToolRunner,
    cancel: &CancelToken,
    nodes_to_run: &HashSet<NodeIndex>,
) -> Result<HashMap<NodeIndex, Dynamic>, BuildError> {
    let graph = &workbench.graph;

    toposort(graph, None)
        .map_err(|cycle| ConfigError::Cycle(graph[cycle.node_id()].get_name()))?;

    let mut cache: HashMap<NodeIndex, Dynamic> = HashMap::new();

    let total_tasks = nodes_to_run.len() as u64;
    if total_tasks == 0 {
        return Ok(cache);
    }

    // Build a map from a dependency to the nodes that depend on it.
    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for edge in graph.raw_edges() {
        dependents
            .entry(edge.source())
            .or_default()
            .push(edge.target());
    }

    // Count dependencies for each node that we intend to run.
    // A dependency only counts if it's also in the set of nodes to run.
    let mut dependency_counts: HashMap<NodeIndex, usize> = nodes_to_run
        .iter()
        .map(|&i| {
            (
                i,
                graph
                    .neighbors_directed(i, petgraph::Direction::Incoming)
                    .filter(|dep| nodes_to_run.contains(dep))
                    .count(),
            )
        })
        .collect();

    let mut completed_tasks = 0u64;
    let mut in_flight = 0u64;
    // Nodes that can never run because an ancestor failed.
    let mut dead: HashSet<NodeIndex> = HashSet::new();
    let mut failures: Vec<(String, anyhow::Error)> = Vec::new();

    // Setup MultiProgress and the main overall progress bar
    let mp = MultiProgress::new();
    let main_pb = mp.add(ProgressBar::new(total_tasks));
    main_pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .expect("invalid progress bar template")
            .progress_chars("=>-"),
    );
    main_pb.set_message("Running tasks...");

    // Define the style for the per-task spinners
    let spinner_style = ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .expect("invalid progress bar template");

    // We only need a channel for results; tasks are distributed by rayon.
    let (result_sender, result_receiver) = unbounded::<(NodeIndex, anyhow::Result<Dynamic>)>();

    rayon::scope(|s| {
        // A helper closure to dispatch a single task to the pool.
        let spawn_task = |cache: &HashMap<NodeIndex, Dynamic>, index: NodeIndex| {
            // Outputs of all predecessors, in declaration order.
            let dependencies: Vec<Dynamic> = graph[index]
                .dependencies()
                .iter()
                .map(|dep| cache.get(dep).unwrap().clone())
                .collect();

            let task = graph[index].clone();

            // Clone variables for the worker
            let sender = result_sender.clone();
            let mp_clone = mp.clone();
            let style_clone = spinner_style.clone();

            s.spawn(move |_| {
                // Freshness short-circuit: the prior output still stands.
                if let Some(output) = task.fresh() {
                    tracing::debug!(task = %task.get_name(), "output current, skipping");
                    sender.send((index, Ok(output))).unwrap();
                    return;
                }

                let task_pb = mp_clone.add(ProgressBar::new_spinner());
                task_pb.set_style(style_clone);
                task_pb.set_message(task.get_name());
                task_pb.enable_steady_tick(Duration::from_millis(100));

                let context = TaskContext { tools, cancel };
                let output = task.execute(&context, &dependencies);

                task_pb.finish_and_clear();

                // Send result back to main thread
                sender.send((index, output)).unwrap();
            });
        };

        // Seed initial tasks
        for &node_index in nodes_to_run {
            if cancel.is_cancelled() {
                break;
            }
            if dependency_counts.get(&node_index).copied().unwrap_or(0) == 0 {
                spawn_task(&cache, node_index);
                in_flight += 1;
            }
        }

        // Scheduler loop
        // The main thread sits here while rayon workers execute tasks.
        while completed_tasks + (dead.len() as u64) < total_tasks {
            if in_flight == 0 {
                break;
            }

            // Wait for any task to finish
            let (completed_index, output) = result_receiver.recv().unwrap();
            in_flight -= 1;
            completed_tasks += 1;
            main_pb.inc(1);

            match output {
                Ok(output) => {
                    cache.insert(completed_index, output);

                    // Once cancelled, nothing new gets dispatched; in-flight
                    // work is drained and the loop winds down.
                    if cancel.is_cancelled() {
                        continue;
                    }

                    // Unlock dependents
                    if let Some(dependents_of_completed) = dependents.get(&completed_index) {
                        for &index in dependents_of_completed {
                            if let Some(count) = dependency_counts.get_mut(&index) {
                                *count -= 1;
                                if *count == 0 && !dead.contains(&index) {
                                    // Dependency satisfied, dispatch immediately
                                    spawn_task(&cache, index);
                                    in_flight += 1;
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    let name = graph[completed_index].get_name();
                    tracing::error!(task = %name, "task failed: {:#}", err);

                    // Everything downstream of the failure is unreachable.
                    let mut dfs = Dfs::new(graph, completed_index);
                    while let Some(index) = dfs.next(graph) {
                        if index != completed_index
                            && nodes_to_run.contains(&index)
                            && !cache.contains_key(&index)
                        {
                            dead.insert(index);
                        }
                    }

                    failures.push((name, err));
                }
            }
        }
    });

    if cancel.is_cancelled() {
        main_pb.abandon_with_message("Build cancelled");
        return Err(BuildError::Cancelled);
    }

    if let Some((name, err)) = failures.into_iter().next() {
        main_pb.abandon_with_message("Build failed");
        return Err(BuildError::Task(name, err));
    }

    main_pb.finish_with_message("Build complete");
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::Blueprint;
    use crate::process::SystemTools;

    #[test]
    fn predecessors_run_strictly_before_dependents() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut blueprint = Blueprint::new();

        let log_a = log.clone();
        let a = blueprint.task().name("a").run(move |_| {
            log_a.lock().unwrap().push("a");
            Ok(1u32)
        });

        let log_b = log.clone();
        let b = blueprint
            .task()
            .name("b")
            .depends_on(a)
            .run(move |_, n: &u32| {
                log_b.lock().unwrap().push("b");
                Ok(n + 1)
            });

        let log_c = log.clone();
        let c = blueprint
            .task()
            .name("c")
            .depends_on((a, b))
            .run(move |_, (x, y): (&u32, &u32)| {
                log_c.lock().unwrap().push("c");
                Ok(x + y)
            });

        let outcome = blueprint.finish().run(&SystemTools).unwrap();

        assert_eq!(outcome.get(c), Some(&3));
        let log = log.lock().unwrap();
        assert!(log.iter().position(|&s| s == "a") < log.iter().position(|&s| s == "b"));
        assert!(log.iter().position(|&s| s == "b") < log.iter().position(|&s| s == "c"));
    }

    #[test]
    fn cycle_is_rejected_before_any_task_runs() {
        let ran = Arc::new(AtomicUsize::new(0));

        let mut blueprint = Blueprint::new();

        let ran_a = ran.clone();
        let a = blueprint.task().name("a").run(move |_| {
            ran_a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let ran_b = ran.clone();
        let b = blueprint.task().name("b").depends_on(a).run(move |_, _| {
            ran_b.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        // Close the loop behind the typed API's back.
        blueprint.graph.add_edge(b.index(), a.index(), ());

        let result = blueprint.finish().run(&SystemTools);

        assert!(matches!(
            result,
            Err(BuildError::Config(ConfigError::Cycle(_)))
        ));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fresh_task_is_skipped_but_output_remains() {
        let ran = Arc::new(AtomicUsize::new(0));

        let mut blueprint = Blueprint::new();

        let ran_probe = ran.clone();
        let cached = blueprint.task().name("cached").run_unless(
            || Some(41u32),
            move |_| {
                ran_probe.fetch_add(1, Ordering::SeqCst);
                Ok(0u32)
            },
        );

        let next = blueprint
            .task()
            .name("next")
            .depends_on(cached)
            .run(|_, n: &u32| Ok(n + 1));

        let workbench = blueprint.finish();

        for _ in 0..2 {
            let outcome = workbench.run(&SystemTools).unwrap();
            assert_eq!(outcome.get(next), Some(&42));
        }

        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failure_poisons_dependents_but_not_siblings() {
        let sibling_ran = Arc::new(AtomicUsize::new(0));
        let dependent_ran = Arc::new(AtomicUsize::new(0));

        let mut blueprint = Blueprint::new();

        let failing = blueprint
            .task()
            .name("failing")
            .run(|_| Err::<u32, _>(anyhow::anyhow!("boom")));

        let dep = dependent_ran.clone();
        let _dependent = blueprint
            .task()
            .name("dependent")
            .depends_on(failing)
            .run(move |_, _| {
                dep.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let sib = sibling_ran.clone();
        let sibling = blueprint.task().name("sibling").run(move |_| {
            sib.fetch_add(1, Ordering::SeqCst);
            Ok(7u32)
        });

        let workbench = blueprint.finish();
        let result = workbench.run(&SystemTools);

        assert!(matches!(result, Err(BuildError::Task(name, _)) if name == "failing"));
        assert_eq!(dependent_ran.load(Ordering::SeqCst), 0);
        assert_eq!(sibling_ran.load(Ordering::SeqCst), 1);
        let _ = sibling;
    }

    #[test]
    fn run_for_executes_only_ancestors() {
        let other_ran = Arc::new(AtomicUsize::new(0));

        let mut blueprint = Blueprint::new();

        let base = blueprint.task().name("base").run(|_| Ok(10u32));
        let goal = blueprint
            .task()
            .name("goal")
            .depends_on(base)
            .run(|_, n: &u32| Ok(n * 2));

        let other = other_ran.clone();
        let unrelated = blueprint.task().name("unrelated").run(move |_| {
            other.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let workbench = blueprint.finish();
        let outcome = workbench.run_for(&SystemTools, goal.index()).unwrap();

        assert_eq!(outcome.get(goal), Some(&20));
        assert_eq!(outcome.get(unrelated), None);
        assert_eq!(other_ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancelled_build_reports_cancellation() {
        let mut blueprint = Blueprint::new();
        let _task = blueprint.task().name("anything").run(|_| Ok(()));

        let cancel = CancelToken::new();
        cancel.cancel();

        let result = blueprint.finish().run_cancellable(&SystemTools, &cancel);
        assert!(matches!(result, Err(BuildError::Cancelled)));
    }
}

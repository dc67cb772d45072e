//! Declarative wiring of the build graph.
//!
//! A [`Blueprint`] collects tasks and the edges between them; calling
//! [`Blueprint::finish`] turns it into a [`Workbench`] that can execute the
//! graph. Wiring uses a small fluent API:
//!
//! ```rust
//! use bootsmith::{Blueprint, process::SystemTools};
//!
//! let mut blueprint = Blueprint::new();
//! let first = blueprint.task().name("first").run(|_| Ok(1u32));
//! let second = blueprint
//!     .task()
//!     .name("second")
//!     .depends_on(first)
//!     .run(|_, n: &u32| Ok(n * 2));
//!
//! let outcome = blueprint.finish().run(&SystemTools).unwrap();
//! assert_eq!(outcome.get(second), Some(&2));
//! ```

use std::any::type_name;
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::{Dfs, Reversed};

use crate::error::BuildError;
use crate::executor;
use crate::process::{CancelToken, ToolRunner};
use crate::task::{Dependencies, Dynamic, Handle, Task, TaskContext, TypedTask};

/// The blueprint of a build: tasks and their predecessor relations.
pub struct Blueprint {
    pub(crate) graph: Graph<Arc<dyn Task>, ()>,
}

impl Blueprint {
    /// Creates a new, empty blueprint.
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
        }
    }

    /// The entry point for registering a task.
    pub fn task(&mut self) -> TaskDef<'_> {
        TaskDef {
            blueprint: self,
            name: None,
        }
    }

    /// Seals the blueprint into an executable [`Workbench`].
    pub fn finish(self) -> Workbench {
        Workbench { graph: self.graph }
    }

    pub(crate) fn add_task<O, T>(&mut self, task: T) -> Handle<O>
    where
        O: Send + Sync + 'static,
        T: TypedTask<Output = O> + 'static,
    {
        let dependencies = task.dependencies();
        let index = self.graph.add_node(Arc::new(task));

        for dependency in dependencies {
            self.graph.add_edge(dependency, index, ());
        }

        Handle::new(index)
    }
}

impl Default for Blueprint {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Blueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let name = task.get_name().replace('"', "\\\""); // Simple escape
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_indices() {
            let (source, target) = self.graph.edge_endpoints(edge).unwrap();
            writeln!(f, "    {:?} --> {:?}", source.index(), target.index())?;
        }

        Ok(())
    }
}

pub struct TaskDef<'a> {
    blueprint: &'a mut Blueprint,
    name: Option<Cow<'static, str>>,
}

impl<'a> TaskDef<'a> {
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn depends_on<D>(self, dependencies: D) -> TaskBinder<'a, D>
    where
        D: Dependencies,
    {
        TaskBinder {
            blueprint: self.blueprint,
            name: self.name,
            dependencies,
        }
    }

    pub fn run<F, R>(self, callback: F) -> Handle<R>
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        self.depends_on(()).run(move |ctx, _| callback(ctx))
    }

    /// Like [`TaskDef::run`], but skips the callback whenever `probe` reports
    /// the previous output as still current.
    pub fn run_unless<P, F, R>(self, probe: P, callback: F) -> Handle<R>
    where
        P: Fn() -> Option<R> + Send + Sync + 'static,
        F: Fn(&TaskContext<'_>) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        self.depends_on(())
            .run_unless(probe, move |ctx, _| callback(ctx))
    }
}

pub struct TaskBinder<'a, D> {
    blueprint: &'a mut Blueprint,
    name: Option<Cow<'static, str>>,
    dependencies: D,
}

impl<'a, D> TaskBinder<'a, D>
where
    D: Dependencies + Send + Sync + 'static,
{
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn run<F, R>(self, callback: F) -> Handle<R>
    where
        F: for<'b> Fn(&TaskContext<'b>, D::Output<'b>) -> anyhow::Result<R>
            + Send
            + Sync
            + 'static,
        R: Send + Sync + 'static,
    {
        self.blueprint.add_task(TaskNode {
            name: self.name.unwrap_or(type_name::<F>().into()),
            dependencies: self.dependencies,
            callback,
            probe: None,
        })
    }

    /// Registers the task with a freshness probe. A task whose probe returns
    /// `Some` is not executed; the probed value stands in for its output.
    pub fn run_unless<P, F, R>(self, probe: P, callback: F) -> Handle<R>
    where
        P: Fn() -> Option<R> + Send + Sync + 'static,
        F: for<'b> Fn(&TaskContext<'b>, D::Output<'b>) -> anyhow::Result<R>
            + Send
            + Sync
            + 'static,
        R: Send + Sync + 'static,
    {
        self.blueprint.add_task(TaskNode {
            name: self.name.unwrap_or(type_name::<F>().into()),
            dependencies: self.dependencies,
            callback,
            probe: Some(Box::new(probe)),
        })
    }
}

pub(crate) struct TaskNode<R, D, F>
where
    R: Send + Sync + 'static,
    D: Dependencies,
    F: for<'a> Fn(&TaskContext<'a>, D::Output<'a>) -> anyhow::Result<R> + Send + Sync,
{
    name: Cow<'static, str>,
    dependencies: D,
    callback: F,
    probe: Option<Box<dyn Fn() -> Option<R> + Send + Sync>>,
}

impl<R, D, F> TypedTask for TaskNode<R, D, F>
where
    R: Send + Sync + 'static,
    D: Dependencies + Send + Sync,
    F: for<'a> Fn(&TaskContext<'a>, D::Output<'a>) -> anyhow::Result<R> + Send + Sync,
{
    type Output = R;

    fn get_name(&self) -> String {
        self.name.to_string()
    }

    fn dependencies(&self) -> Vec<NodeIndex> {
        self.dependencies.dependencies()
    }

    fn fresh(&self) -> Option<R> {
        self.probe.as_ref().and_then(|probe| probe())
    }

    fn execute(&self, context: &TaskContext, dependencies: &[Dynamic]) -> anyhow::Result<R> {
        let dependencies = self.dependencies.resolve(dependencies);
        (self.callback)(context, dependencies)
    }
}

/// The sealed, executable form of a [`Blueprint`].
pub struct Workbench {
    pub(crate) graph: Graph<Arc<dyn Task>, ()>,
}

impl Workbench {
    pub fn design() -> Blueprint {
        Blueprint::new()
    }

    /// Executes the entire graph.
    pub fn run(&self, tools: &dyn ToolRunner) -> Result<Outcome, BuildError> {
        eprintln!(
            "Running {} over {} tasks.",
            console::style("bootsmith").red(),
            console::style(self.graph.node_count()).blue()
        );

        self.run_cancellable(tools, &CancelToken::new())
    }

    /// Executes the entire graph, honoring `cancel`.
    pub fn run_cancellable(
        &self,
        tools: &dyn ToolRunner,
        cancel: &CancelToken,
    ) -> Result<Outcome, BuildError> {
        let nodes = self.graph.node_indices().collect();
        let cache = executor::run_parallel(self, tools, cancel, &nodes)?;
        Ok(Outcome { cache })
    }

    /// Executes only `goal` and its transitive predecessors.
    pub fn run_for(&self, tools: &dyn ToolRunner, goal: NodeIndex) -> Result<Outcome, BuildError> {
        let reversed = Reversed(&self.graph);
        let mut nodes = HashSet::new();

        let mut dfs = Dfs::new(reversed, goal);
        while let Some(index) = dfs.next(reversed) {
            nodes.insert(index);
        }

        let cache = executor::run_parallel(self, tools, &CancelToken::new(), &nodes)?;
        Ok(Outcome { cache })
    }
}

/// The cached outputs of one graph execution.
pub struct Outcome {
    pub(crate) cache: std::collections::HashMap<NodeIndex, Dynamic>,
}

impl Outcome {
    /// Typed access to a task's output. `None` when the task did not run
    /// (for example because an upstream failure cut its chain short).
    pub fn get<T: Send + Sync + 'static>(&self, handle: Handle<T>) -> Option<&T> {
        self.cache
            .get(&handle.index())
            .and_then(|output| output.downcast_ref::<T>())
    }
}

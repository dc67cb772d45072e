//! All the generic task-related abstractions.
//!
//! A task is a unit of build work with an identity, declared predecessors and
//! a freshness probe. Tasks are organized into a directed acyclic graph; the
//! scheduler in [`crate::executor`] runs each task at most once, after all of
//! its predecessors.
//!
//! Under the hood the graph is entirely type-erased: every output is stored as
//! `Arc<dyn Any + Send + Sync>`. A phantom [`Handle<T>`] bridges the gap:
//! at compile time it carries the output type `T` so wiring mistakes are
//! caught by the compiler, and at runtime the [`Dependencies`] trait performs
//! the matching `downcast_ref`.

use std::any::Any;
use std::sync::Arc;

use petgraph::graph::NodeIndex;

use crate::process::{CancelToken, ToolRunner};

pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// Context handed to every executing task.
pub struct TaskContext<'a> {
    /// The seam through which tasks invoke external tools.
    pub tools: &'a dyn ToolRunner,
    /// Cooperative cancellation flag for the whole build.
    pub cancel: &'a CancelToken,
}

pub(crate) trait TypedTask: Send + Sync {
    /// The concrete output type of this task.
    type Output: Send + Sync + 'static;

    fn get_name(&self) -> String;
    fn dependencies(&self) -> Vec<NodeIndex>;

    /// Freshness probe. Returning `Some` means the prior output is still
    /// current: the work closure is skipped, but the output is still placed
    /// in the cache for downstream tasks.
    fn fresh(&self) -> Option<Self::Output> {
        None
    }

    fn execute(
        &self,
        context: &TaskContext,
        dependencies: &[Dynamic],
    ) -> anyhow::Result<Self::Output>;
}

pub(crate) trait Task: Send + Sync {
    fn get_name(&self) -> String;
    fn dependencies(&self) -> Vec<NodeIndex>;
    fn fresh(&self) -> Option<Dynamic>;
    fn execute(&self, context: &TaskContext, dependencies: &[Dynamic]) -> anyhow::Result<Dynamic>;
}

// A blanket implementation to automatically bridge the two. This is where the
// type erasure actually happens.
impl<T> Task for T
where
    T: TypedTask + 'static,
{
    fn get_name(&self) -> String {
        T::get_name(self)
    }

    fn dependencies(&self) -> Vec<NodeIndex> {
        T::dependencies(self)
    }

    fn fresh(&self) -> Option<Dynamic> {
        T::fresh(self).map(|output| Arc::new(output) as Dynamic)
    }

    fn execute(&self, context: &TaskContext, dependencies: &[Dynamic]) -> anyhow::Result<Dynamic> {
        // Call the typed method, then erase the result.
        Ok(Arc::new(T::execute(self, context, dependencies)?))
    }
}

/// A type-safe reference to a task in the build graph.
///
/// A `Handle<T>` is a lightweight, copyable token that represents the future
/// result of type `T`. When one task depends on another, it holds a handle to
/// that dependency; the scheduler guarantees the dependency executes first.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Handle<T> {
    pub(crate) index: NodeIndex,
    _phantom: std::marker::PhantomData<T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Handle<T> {
    pub(crate) fn new(index: NodeIndex) -> Self {
        Self {
            index,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Returns the underlying `NodeIndex` of the task in the graph.
    pub fn index(&self) -> NodeIndex {
        self.index
    }
}

/// A trait that enables a collection of `Handle<T>`s to be used as
/// dependencies for a task.
///
/// This trait is implemented for tuples of `Handle<T>`s (and for
/// `Vec<Handle<T>>`), allowing them to be passed to
/// [`crate::Blueprint::task`] wiring. It provides the logic for the scheduler
/// to extract dependency indices and resolve type-erased outputs.
pub trait Dependencies {
    /// The resulting type when all dependencies are resolved.
    /// For a tuple of `Handle<T>`s, this will be a tuple of `&'a T`s.
    type Output<'a>;

    /// Returns the `NodeIndex` for each dependency in the collection.
    fn dependencies(&self) -> Vec<NodeIndex>;

    /// Takes a slice of type-erased dependency outputs and resolves them into
    /// a concrete `Output` type.
    ///
    /// # Panics
    /// Panics if the type-erased outputs cannot be downcast to their expected
    /// concrete types, indicating a severe logic error in the build system.
    fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Self::Output<'a>;
}

impl Dependencies for () {
    type Output<'a> = ();

    fn dependencies(&self) -> Vec<NodeIndex> {
        vec![]
    }

    fn resolve<'a>(&self, _outputs: &'a [Dynamic]) -> Self::Output<'a> {}
}

impl<T> Dependencies for Handle<T>
where
    T: Send + Sync + 'static,
{
    type Output<'a> = &'a T;

    fn dependencies(&self) -> Vec<NodeIndex> {
        vec![self.index]
    }

    fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Self::Output<'a> {
        outputs[0].downcast_ref::<T>().unwrap_or_else(|| {
            panic!(
                "Expected {} but got something else",
                std::any::type_name::<T>()
            )
        })
    }
}

impl<T> Dependencies for Vec<Handle<T>>
where
    T: Send + Sync + 'static,
{
    type Output<'a> = Vec<&'a T>;

    fn dependencies(&self) -> Vec<NodeIndex> {
        self.iter().map(|handle| handle.index).collect()
    }

    fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Self::Output<'a> {
        outputs
            .iter()
            .map(|output| {
                output.downcast_ref::<T>().unwrap_or_else(|| {
                    panic!(
                        "Expected {} but got something else",
                        std::any::type_name::<T>()
                    )
                })
            })
            .collect()
    }
}

macro_rules! impl_deps {
    ($($T:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($T: Send + Sync + 'static),*> Dependencies for ($(Handle<$T>,)*) {
            type Output<'a> = ($(&'a $T,)*);

            fn dependencies(&self) -> Vec<NodeIndex> {
                let ($($T,)*) = self;
                vec![$($T.index),*]
            }

            fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Self::Output<'a> {
                let mut iter = outputs.iter();
                ($({
                    let out = iter.next().unwrap();
                    out.downcast_ref::<$T>().unwrap_or_else(|| {
                        panic!("Expected {} but got something else", std::any::type_name::<$T>())
                    })
                },)*)
            }
        }
    };
}

impl_deps!(A);
impl_deps!(A, B);
impl_deps!(A, B, C);
impl_deps!(A, B, C, D);
impl_deps!(A, B, C, D, E);
impl_deps!(A, B, C, D, E, F);
impl_deps!(A, B, C, D, E, F, G);
impl_deps!(A, B, C, D, E, F, G, H);

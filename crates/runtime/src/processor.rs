//! Processing capability interface
//!
//! The NLP/model layer (entity and relation extraction, embedding
//! generation, ...) lives outside this crate and plugs into a
//! [`WorkerPool`](crate::WorkerPool) by implementing [`Processor`].

use async_trait::async_trait;

use crate::error::ProcessingError;

/// A unit-of-work processor run by every worker of a pool
///
/// One processor instance is shared by all workers of its pool, so
/// `process` takes `&self` and may be called concurrently.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use kgflow_runtime::{ProcessingError, Processor};
///
/// struct Uppercase;
///
/// #[async_trait]
/// impl Processor for Uppercase {
///     type Task = String;
///     type Output = String;
///
///     fn name(&self) -> &str {
///         "uppercase"
///     }
///
///     async fn process(&self, task: String) -> Result<String, ProcessingError> {
///         if task.is_empty() {
///             return Err(ProcessingError::new("empty input"));
///         }
///         Ok(task.to_uppercase())
///     }
/// }
/// ```
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Input payload
    type Task: Send + 'static;

    /// Result pushed to the pool's output queue
    type Output: Send + 'static;

    /// Name used in logs and validation errors
    fn name(&self) -> &str;

    /// Pre-flight check, run exactly once when the pool starts
    ///
    /// Returning `false` aborts the start before any worker is spawned.
    async fn validate(&self) -> bool {
        true
    }

    /// Process one task
    ///
    /// Errors are isolated to this task: the worker logs them, marks the
    /// task done and moves on to the next one.
    async fn process(&self, task: Self::Task) -> Result<Self::Output, ProcessingError>;
}

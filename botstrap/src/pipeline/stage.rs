//! Stage definition for table-driven pipeline execution.

/// A named group of tasks.
///
/// Stages are executed in order and a stage's tasks run one after another.
/// The next stage starts only once every task of the current stage has
/// returned, so its effects are fully visible.
///
/// Generic over task type T to allow different pipeline implementations.
#[derive(Debug, Clone)]
pub struct Stage<T> {
    pub name: String,
    pub tasks: Vec<T>,
}

impl<T> Stage<T> {
    pub fn new(name: impl Into<String>, tasks: Vec<T>) -> Self {
        Self {
            name: name.into(),
            tasks,
        }
    }

    /// Stage holding a single task.
    pub fn single(name: impl Into<String>, task: T) -> Self {
        Self::new(name, vec![task])
    }
}

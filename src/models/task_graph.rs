//! Builder for the static part of a run's task graph.

use super::task::{FanOutTemplate, Task, TaskId, TaskParameters};
use super::task_kind::TaskKind;
use crate::error::{ReelforgeError, Result};

/// Static tasks of a run plus the root whose completion completes the run
#[derive(Debug, Clone)]
pub struct TaskGraph {
    pub root: TaskId,
    pub tasks: Vec<Task>,
}

impl TaskGraph {
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }
}

#[derive(Debug)]
pub struct TaskGraphBuilder {
    job_id: String,
    tasks: Vec<Task>,
}

impl TaskGraphBuilder {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            tasks: Vec::new(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Add a task of the parameters' kind depending on `dependencies`
    pub fn add(&mut self, parameters: TaskParameters, dependencies: &[TaskId]) -> TaskId {
        let task = Task::new(&self.job_id, parameters, None, dependencies.iter().cloned());
        self.add_task(task)
    }

    pub fn add_task(&mut self, task: Task) -> TaskId {
        let id = task.id.clone();
        self.tasks.push(task);
        id
    }

    pub fn set_priority(&mut self, id: &TaskId, priority: i32) -> Result<()> {
        self.task_mut(id)?.priority = priority;
        Ok(())
    }

    /// Declare `generator` as producing batch `batch_name` joined by `join`.
    ///
    /// Member chains are created from the generator's output at runtime, one
    /// task per entry in `member_kinds`.
    pub fn fan_out(
        &mut self,
        generator: &TaskId,
        batch_name: &str,
        member_kinds: Vec<TaskKind>,
        join: &TaskId,
    ) -> Result<()> {
        if member_kinds.is_empty() {
            return Err(ReelforgeError::Structural(format!(
                "fan-out '{batch_name}' declares no member kinds"
            )));
        }
        self.task_mut(join)?.join_batch = Some(batch_name.to_string());
        self.task_mut(generator)?.fan_out = Some(FanOutTemplate {
            batch_name: batch_name.to_string(),
            member_kinds,
            join_task_id: join.clone(),
        });
        Ok(())
    }

    pub fn build(self, root: TaskId) -> TaskGraph {
        TaskGraph {
            root,
            tasks: self.tasks,
        }
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| &t.id == id)
            .ok_or_else(|| ReelforgeError::Structural(format!("unknown task {id}")))
    }
}

//! Task attempt identifiers and the scope in which the current one is known

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

/// Identifier of the task attempt on whose behalf a block operation runs.
///
/// Lock ownership in the block info manager is recorded per task attempt
/// so that everything a task leaked can be released when it ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskAttemptId(pub i64);

/// Pseudo task attempt under which administrative operations (removal,
/// eviction, registration) take locks when no task scope is active.
pub const NON_TASK_WRITER: TaskAttemptId = TaskAttemptId(-1024);

impl fmt::Display for TaskAttemptId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if *self == NON_TASK_WRITER {
			write!(f, "non-task")
		} else {
			write!(f, "task {}", self.0)
		}
	}
}

tokio::task_local! {
	static TASK_ATTEMPT_ID: TaskAttemptId;
}

/// Run a future with the given task attempt as the current one.
/// Every block lock taken inside is recorded against it.
pub async fn with_task_attempt_id<F>(id: TaskAttemptId, f: F) -> F::Output
where
	F: Future,
{
	TASK_ATTEMPT_ID.scope(id, f).await
}

/// The task attempt the calling future runs under, or `NON_TASK_WRITER`
/// outside any task scope
pub fn current_task_attempt_id() -> TaskAttemptId {
	TASK_ATTEMPT_ID
		.try_with(|id| *id)
		.unwrap_or(NON_TASK_WRITER)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_task_scope() {
		assert_eq!(current_task_attempt_id(), NON_TASK_WRITER);
		let inner = with_task_attempt_id(TaskAttemptId(7), async {
			assert_eq!(current_task_attempt_id(), TaskAttemptId(7));
			current_task_attempt_id()
		})
		.await;
		assert_eq!(inner, TaskAttemptId(7));
		assert_eq!(current_task_attempt_id(), NON_TASK_WRITER);
	}
}

//! Task poller.
//!
//! Submits calls through the `Async.` namespace and polls the resulting task
//! object with exponential backoff until it reaches a terminal state, the
//! deadline passes, or the caller cancels.

use std::future::Future;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError, CallOutcome, OpaqueRef, RemoteCall, TaskRecord, TaskStatus, parse_task_result};
use crate::backoff::BackoffPolicy;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// Local view of a task's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled)
    }
}

/// In-flight asynchronous remote operation.
///
/// Only the [`TaskPoller`] changes its state.
#[derive(Debug)]
pub struct TaskHandle {
    task_ref: OpaqueRef,
    method: String,
    state: TaskState,
    result: Option<String>,
    submitted_at: Instant,
}

impl TaskHandle {
    fn new(task_ref: OpaqueRef, method: &str) -> Self {
        Self {
            task_ref,
            method: method.to_string(),
            state: TaskState::Pending,
            result: None,
            submitted_at: Instant::now(),
        }
    }

    pub fn task_ref(&self) -> &str {
        &self.task_ref
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Object reference the task produced, if any.
    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn elapsed(&self) -> Duration {
        self.submitted_at.elapsed()
    }
}

/// What a single poll observed.
enum Poll {
    Continue,
    Done(Option<String>),
}

pub struct TaskPoller {
    api: ApiClient,
    backoff: BackoffPolicy,
    transient_attempts: u32,
}

impl TaskPoller {
    pub fn new(api: ApiClient, backoff: BackoffPolicy, transient_attempts: u32) -> Self {
        Self {
            api,
            backoff,
            transient_attempts,
        }
    }

    /// Submit `call` as a task.
    pub async fn submit(&self, call: RemoteCall) -> Result<TaskHandle> {
        let call = RemoteCall {
            asynchronous: true,
            ..call
        };
        match self.api.invoke(&call).await? {
            CallOutcome::Task(task_ref) => {
                debug!(task = %task_ref, method = %call.method, "Task submitted");
                Ok(TaskHandle::new(task_ref, &call.method))
            }
            CallOutcome::Value(value) => Err(Error::RemoteInternal(format!(
                "{} did not return a task: {}",
                call.method, value
            ))),
        }
    }

    /// Poll `handle` to completion and return the produced object reference.
    ///
    /// If the task object disappears before reporting a final status,
    /// `post_condition` decides the outcome: the task counts as succeeded only
    /// when it returns `Ok(true)`.
    ///
    /// On timeout the handle is marked [`TaskState::Failed`] and the remote
    /// task is left running. On cancellation it is marked
    /// [`TaskState::Cancelled`]; nothing is sent to the remote side.
    pub async fn await_task<F, Fut>(
        &self,
        handle: &mut TaskHandle,
        timeout: Duration,
        cancel: &CancelToken,
        post_condition: F,
    ) -> Result<Option<String>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        if handle.state.is_terminal() {
            return match handle.state {
                TaskState::Succeeded => Ok(handle.result.clone()),
                TaskState::Cancelled => Err(Error::Cancelled),
                _ => Err(Error::RemoteInternal(format!(
                    "task {} already failed",
                    handle.task_ref
                ))),
            };
        }

        let deadline = Instant::now() + timeout;
        let mut intervals = self.backoff.intervals();
        let mut transient_failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                handle.state = TaskState::Cancelled;
                return Err(Error::Cancelled);
            }

            match self.poll_once(handle, &mut transient_failures, &post_condition).await {
                Ok(Poll::Done(result)) => return Ok(result),
                Ok(Poll::Continue) => {}
                Err(err) => {
                    if !handle.state.is_terminal() {
                        handle.state = TaskState::Failed;
                    }
                    return Err(err);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                handle.state = TaskState::Failed;
                warn!(task = %handle.task_ref, method = %handle.method, "Task timed out; leaving it running remotely");
                return Err(Error::Timeout {
                    what: format!("task {} ({})", handle.task_ref, handle.method),
                    elapsed_secs: handle.elapsed().as_secs(),
                });
            }

            let delay = intervals
                .next()
                .unwrap_or(self.backoff.max_interval)
                .min(deadline - now);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    handle.state = TaskState::Cancelled;
                    info!(task = %handle.task_ref, "Task wait cancelled");
                    return Err(Error::Cancelled);
                }
            }
        }
    }

    /// Submit and wait in one step.
    pub async fn run<F, Fut>(
        &self,
        call: RemoteCall,
        timeout: Duration,
        cancel: &CancelToken,
        post_condition: F,
    ) -> Result<Option<String>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let mut handle = self.submit(call).await?;
        self.await_task(&mut handle, timeout, cancel, post_condition).await
    }

    async fn poll_once<F, Fut>(
        &self,
        handle: &mut TaskHandle,
        transient_failures: &mut u32,
        post_condition: &F,
    ) -> Result<Poll>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let record = match self
            .api
            .call_once("task.get_record", vec![json!(handle.task_ref)])
            .await
            .and_then(|value| {
                serde_json::from_value::<TaskRecord>(value)
                    .map_err(|e| Error::RemoteInternal(format!("malformed task record: {}", e)))
            }) {
            Ok(record) => {
                *transient_failures = 0;
                record
            }
            Err(Error::NotFound(_)) => return self.vanished(handle, post_condition).await,
            Err(Error::TransientNetwork { message, .. }) => {
                *transient_failures += 1;
                if *transient_failures > self.transient_attempts {
                    return Err(Error::TransientNetwork {
                        attempts: *transient_failures,
                        message,
                    });
                }
                warn!(task = %handle.task_ref, attempt = *transient_failures, "Transient failure while polling: {}", message);
                return Ok(Poll::Continue);
            }
            Err(err) => return Err(err),
        };

        match record.status {
            TaskStatus::Pending | TaskStatus::Cancelling => {
                handle.state = if record.progress > 0.0 {
                    TaskState::Running
                } else {
                    TaskState::Pending
                };
                debug!(task = %handle.task_ref, progress = record.progress, "Task in progress");
                Ok(Poll::Continue)
            }
            TaskStatus::Success => {
                handle.state = TaskState::Succeeded;
                handle.result = parse_task_result(&record.result);
                self.destroy(handle).await;
                Ok(Poll::Done(handle.result.clone()))
            }
            TaskStatus::Failure => {
                handle.state = TaskState::Failed;
                self.destroy(handle).await;
                Err(ApiError::remote(record.error_info).into())
            }
            TaskStatus::Cancelled => {
                handle.state = TaskState::Cancelled;
                self.destroy(handle).await;
                Err(Error::Cancelled)
            }
        }
    }

    async fn vanished<F, Fut>(&self, handle: &mut TaskHandle, post_condition: &F) -> Result<Poll>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        warn!(task = %handle.task_ref, method = %handle.method, "Task object vanished; checking post-condition");
        match post_condition().await {
            Ok(true) => {
                handle.state = TaskState::Succeeded;
                Ok(Poll::Done(None))
            }
            Ok(false) => {
                handle.state = TaskState::Failed;
                Err(Error::RemoteInternal(format!(
                    "task {} ({}) vanished and its effect is not visible",
                    handle.task_ref, handle.method
                )))
            }
            Err(err) => {
                handle.state = TaskState::Failed;
                Err(err)
            }
        }
    }

    async fn destroy(&self, handle: &TaskHandle) {
        if let Err(e) = self
            .api
            .call_once("task.destroy", vec![json!(handle.task_ref)])
            .await
        {
            debug!(task = %handle.task_ref, "Failed to destroy finished task: {}", e);
        }
    }
}

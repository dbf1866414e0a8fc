//! Fan-out/fan-in over independent operations.
//!
//! Each operation runs as its own task in a `JoinSet`, under the label it
//! was submitted with. The coordinator collects outcomes until all have
//! reported or the deadline passes. Returning drops the set, which aborts
//! every task still in flight, so a timed-out or short-circuited call
//! leaves no work running behind it. The labels of aborted operations are
//! reported so callers can name what was left unfinished.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::task::{Id, JoinError, JoinSet};
use tracing::debug;

/// Why a fan-out did not complete cleanly.
#[derive(Debug)]
pub enum FanOutError<E> {
    /// An operation returned an error.
    Failed(E),
    /// The deadline passed; `pending` holds the labels of the operations
    /// still outstanding, sorted.
    Timeout { pending: Vec<String> },
    /// An operation's task panicked.
    Panicked { label: String, message: String },
}

/// Spawned operations, by task id.
struct Labeled<E> {
    set: JoinSet<Result<(), E>>,
    labels: HashMap<Id, String>,
}

impl<E: Send + 'static> Labeled<E> {
    fn spawn<I, F>(ops: I) -> Self
    where
        I: IntoIterator<Item = (String, F)>,
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        let mut set = JoinSet::new();
        let mut labels = HashMap::new();
        for (label, op) in ops {
            let handle = set.spawn(op);
            labels.insert(handle.id(), label);
        }
        Self { set, labels }
    }

    /// The next outcome, or `None` once every task has reported.
    async fn next(&mut self) -> Option<Result<(), FanOutError<E>>> {
        let outcome = match self.set.join_next_with_id().await? {
            Ok((id, result)) => {
                self.labels.remove(&id);
                result.map_err(FanOutError::Failed)
            }
            Err(e) => Err(self.panicked(e)),
        };
        Some(outcome)
    }

    fn panicked(&mut self, e: JoinError) -> FanOutError<E> {
        FanOutError::Panicked {
            label: self.labels.remove(&e.id()).unwrap_or_default(),
            message: e.to_string(),
        }
    }

    fn pending(&self) -> Vec<String> {
        let mut pending: Vec<String> = self.labels.values().cloned().collect();
        pending.sort();
        pending
    }
}

/// Run all operations concurrently; return the first error without waiting
/// for the rest.
pub async fn first_failure<I, F, E>(ops: I, deadline: Duration) -> Result<(), FanOutError<E>>
where
    I: IntoIterator<Item = (String, F)>,
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Send + 'static,
{
    let mut tasks = Labeled::spawn(ops);
    let total = tasks.labels.len();

    let collect = async {
        while let Some(outcome) = tasks.next().await {
            if let Err(failure) = outcome {
                return Err(failure);
            }
        }
        Ok(())
    };
    match tokio::time::timeout(deadline, collect).await {
        Ok(result) => {
            if result.is_err() {
                debug!(total, aborted = tasks.labels.len(), "fan-out short-circuited");
            }
            result
        }
        Err(_) => Err(FanOutError::Timeout {
            pending: tasks.pending(),
        }),
    }
}

/// Run all operations concurrently and wait for every one of them, up to
/// the deadline. Returns every failure; empty means all succeeded.
pub async fn all_failures<I, F, E>(ops: I, deadline: Duration) -> Vec<FanOutError<E>>
where
    I: IntoIterator<Item = (String, F)>,
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Send + 'static,
{
    let mut tasks = Labeled::spawn(ops);

    let mut failures = Vec::new();
    let collect = async {
        while let Some(outcome) = tasks.next().await {
            if let Err(failure) = outcome {
                failures.push(failure);
            }
        }
    };
    let finished = tokio::time::timeout(deadline, collect).await.is_ok();

    if !finished {
        failures.push(FanOutError::Timeout {
            pending: tasks.pending(),
        });
    }
    failures
}

use crossbeam_channel::{bounded, unbounded, RecvTimeoutError};
use log::{debug, info, warn};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Timeout and retry budget of the tasks of one stage.
#[derive(Debug, Clone, Copy)]
pub struct TaskPolicy {
    /// Wall-clock limit of a single attempt.
    pub timeout: Duration,
    /// Attempts after the first one.
    pub retries: usize,
    /// Failed attempts are only retried when this returns true.
    pub retry_if: fn(&anyhow::Error) -> bool,
}

fn always(_: &anyhow::Error) -> bool {
    true
}

impl TaskPolicy {
    pub fn new(timeout: Duration, retries: usize) -> Self {
        TaskPolicy {
            timeout,
            retries,
            retry_if: always,
        }
    }

    pub fn with_retry_if(self, retry_if: fn(&anyhow::Error) -> bool) -> Self {
        TaskPolicy { retry_if, ..self }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{task}[{index}] failed after {attempts} attempt(s)")]
    Failed {
        task: String,
        index: usize,
        attempts: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("{task}[{index}] timed out after {timeout:?} ({attempts} attempt(s))")]
    TimedOut {
        task: String,
        index: usize,
        attempts: usize,
        timeout: Duration,
    },

    #[error("{task}[{index}] panicked: {message}")]
    Panicked {
        task: String,
        index: usize,
        message: String,
    },

    #[error("{task}[{index}] produced no result")]
    Missing { task: String, index: usize },
}

impl TaskError {
    /// Index of the argument whose task failed.
    pub fn index(&self) -> usize {
        match self {
            TaskError::Failed { index, .. }
            | TaskError::TimedOut { index, .. }
            | TaskError::Panicked { index, .. }
            | TaskError::Missing { index, .. } => *index,
        }
    }
}

/// Runs bags of independent tasks.
pub trait Executor: Send + Sync {
    /// Run `func` once per argument and return the results in argument order.
    /// The first failing task (by argument index) is reported.
    fn map<A, T, F>(
        &self,
        task: &str,
        policy: &TaskPolicy,
        func: F,
        args: Vec<A>,
    ) -> Result<Vec<T>, TaskError>
    where
        A: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(A) -> anyhow::Result<T> + Send + Sync + 'static;

    fn call<A, T, F>(&self, task: &str, policy: &TaskPolicy, func: F, arg: A) -> Result<T, TaskError>
    where
        A: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(A) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.map(task, policy, func, vec![arg])?
            .pop()
            .ok_or_else(|| TaskError::Missing {
                task: task.to_string(),
                index: 0,
            })
    }
}

/// Runs tasks on local threads.
///
/// A fixed set of worker threads pulls arguments from a bounded channel. Each
/// attempt runs on its own thread so a timed-out attempt can be abandoned;
/// it is left to finish in the background and its result is discarded.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    max_workers: usize,
}

impl LocalExecutor {
    pub fn new(max_workers: usize) -> Self {
        LocalExecutor {
            max_workers: max_workers.max(1),
        }
    }
}

enum AttemptError {
    Failed(anyhow::Error),
    TimedOut,
    Panicked(String),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Failed(e) => write!(f, "{e:#}"),
            AttemptError::TimedOut => write!(f, "timed out"),
            AttemptError::Panicked(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

fn decipher_panic(p: Box<dyn Any + Send + 'static>) -> String {
    if let Some(&s) = p.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Ok(s) = p.downcast::<String>() {
        *s
    } else {
        "thread panicked with unrecognized type".to_string()
    }
}

fn run_once<A, T, F>(func: &Arc<F>, arg: A, timeout: Duration) -> Result<T, AttemptError>
where
    A: Send + 'static,
    T: Send + 'static,
    F: Fn(A) -> anyhow::Result<T> + Send + Sync + 'static,
{
    let (tx, rx) = bounded(1);
    let func = Arc::clone(func);
    let handle = thread::spawn(move || {
        // the receiver is gone if the attempt timed out
        let _ = tx.send(func(arg));
    });
    match rx.recv_timeout(timeout) {
        Ok(Ok(t)) => Ok(t),
        Ok(Err(e)) => Err(AttemptError::Failed(e)),
        Err(RecvTimeoutError::Timeout) => Err(AttemptError::TimedOut),
        Err(RecvTimeoutError::Disconnected) => Err(AttemptError::Panicked(match handle.join() {
            Err(p) => decipher_panic(p),
            Ok(()) => "task exited without a result".to_string(),
        })),
    }
}

fn run_with_retries<A, T, F>(
    task: &str,
    index: usize,
    policy: &TaskPolicy,
    func: &Arc<F>,
    arg: A,
) -> Result<T, TaskError>
where
    A: Clone + Send + 'static,
    T: Send + 'static,
    F: Fn(A) -> anyhow::Result<T> + Send + Sync + 'static,
{
    let attempts = policy.retries + 1;
    let mut attempt = 1;
    loop {
        let start = Instant::now();
        let err = match run_once(func, arg.clone(), policy.timeout) {
            Ok(t) => {
                debug!("{task}[{index}] finished in {:?}", start.elapsed());
                return Ok(t);
            }
            Err(e) => e,
        };
        let retry = attempt < attempts
            && match &err {
                AttemptError::Failed(e) => (policy.retry_if)(e),
                AttemptError::TimedOut | AttemptError::Panicked(_) => true,
            };
        if !retry {
            let task = task.to_string();
            return Err(match err {
                AttemptError::Failed(source) => TaskError::Failed {
                    task,
                    index,
                    attempts: attempt,
                    source,
                },
                AttemptError::TimedOut => TaskError::TimedOut {
                    task,
                    index,
                    attempts: attempt,
                    timeout: policy.timeout,
                },
                AttemptError::Panicked(message) => TaskError::Panicked {
                    task,
                    index,
                    message,
                },
            });
        }
        warn!("{task}[{index}] attempt {attempt}/{attempts} failed, retrying: {err}");
        attempt += 1;
    }
}

impl Executor for LocalExecutor {
    fn map<A, T, F>(
        &self,
        task: &str,
        policy: &TaskPolicy,
        func: F,
        args: Vec<A>,
    ) -> Result<Vec<T>, TaskError>
    where
        A: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(A) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let n = args.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        let workers = self.max_workers.min(n);
        info!("{task}: {n} task(s) on {workers} worker(s)");

        let func = Arc::new(func);
        let failed = AtomicBool::new(false);
        let (job_tx, job_rx) = bounded::<(usize, A)>(workers);
        let (res_tx, res_rx) = unbounded::<(usize, Result<T, TaskError>)>();

        thread::scope(|s| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let res_tx = res_tx.clone();
                let func = Arc::clone(&func);
                let failed = &failed;
                s.spawn(move || {
                    for (index, arg) in job_rx {
                        // drain without running once any task has failed
                        if failed.load(Ordering::SeqCst) {
                            continue;
                        }
                        let result = run_with_retries(task, index, policy, &func, arg);
                        if result.is_err() {
                            failed.store(true, Ordering::SeqCst);
                        }
                        if res_tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(res_tx);

            for job in args.into_iter().enumerate() {
                if failed.load(Ordering::SeqCst) || job_tx.send(job).is_err() {
                    break;
                }
            }
            drop(job_tx);
        });

        let mut slots: Vec<Option<T>> = (0..n).map(|_| None).collect();
        let mut first_err: Option<TaskError> = None;
        for (index, result) in res_rx.try_iter() {
            match result {
                Ok(t) => slots[index] = Some(t),
                Err(e) => {
                    if first_err.as_ref().map_or(true, |f| e.index() < f.index()) {
                        first_err = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(index, t)| {
                t.ok_or_else(|| TaskError::Missing {
                    task: task.to_string(),
                    index,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    fn policy() -> TaskPolicy {
        TaskPolicy::new(Duration::from_secs(10), 1)
    }

    #[test]
    fn test_results_in_submission_order() {
        let exec = LocalExecutor::new(4);
        let out = exec
            .map(
                "square",
                &policy(),
                |x: u64| {
                    thread::sleep(Duration::from_millis((10 - x) * 3));
                    Ok(x * x)
                },
                (0..10).collect(),
            )
            .unwrap();
        assert_eq!(out, (0..10).map(|x| x * x).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_bag() {
        let exec = LocalExecutor::new(4);
        let out: Vec<u8> = exec.map("noop", &policy(), Ok, Vec::<u8>::new()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_retry_then_succeed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let exec = LocalExecutor::new(1);
        let out = exec
            .call(
                "flaky",
                &policy(),
                move |x: u32| {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        bail!("first attempt fails");
                    }
                    Ok(x + 1)
                },
                41,
            )
            .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retries_exhausted() {
        let exec = LocalExecutor::new(2);
        let err = exec
            .map(
                "broken",
                &policy(),
                |x: u32| -> anyhow::Result<u32> {
                    if x == 3 {
                        bail!("aligner exited with 1");
                    }
                    Ok(x)
                },
                (0..6).collect(),
            )
            .unwrap_err();
        match err {
            TaskError::Failed {
                task,
                index,
                attempts,
                source,
            } => {
                assert_eq!(task, "broken");
                assert_eq!(index, 3);
                assert_eq!(attempts, 2);
                assert!(source.to_string().contains("aligner"));
            }
            e => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn test_retry_predicate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let exec = LocalExecutor::new(1);
        let policy = policy().with_retry_if(|e| !e.to_string().contains("deterministic"));
        let err = exec
            .call(
                "once",
                &policy,
                move |_: ()| -> anyhow::Result<()> {
                    c.fetch_add(1, Ordering::SeqCst);
                    bail!("deterministic failure")
                },
                (),
            )
            .unwrap_err();
        assert!(matches!(err, TaskError::Failed { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout() {
        let exec = LocalExecutor::new(1);
        let policy = TaskPolicy::new(Duration::from_millis(50), 1);
        let err = exec
            .call(
                "slow",
                &policy,
                |_: ()| {
                    thread::sleep(Duration::from_secs(2));
                    Ok(())
                },
                (),
            )
            .unwrap_err();
        assert!(matches!(err, TaskError::TimedOut { attempts: 2, .. }));
    }

    #[test]
    fn test_panic_is_reported() {
        let exec = LocalExecutor::new(1);
        let policy = TaskPolicy::new(Duration::from_secs(5), 0);
        let err = exec
            .call(
                "boom",
                &policy,
                |_: ()| -> anyhow::Result<()> { panic!("worker exploded") },
                (),
            )
            .unwrap_err();
        match err {
            TaskError::Panicked { message, .. } => assert!(message.contains("worker exploded")),
            e => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn test_concurrency_bound() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        let exec = LocalExecutor::new(2);
        exec.map(
            "bounded",
            &policy(),
            move |_: usize| {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            },
            (0..8).collect(),
        )
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }
}

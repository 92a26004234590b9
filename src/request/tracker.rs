use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write;
use std::sync::Arc;
use std::sync::mpsc::{Sender, channel};
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use rayon::ThreadPool;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::{BuildError, RequestError};
use crate::graph::NodeId;
use crate::request::{RequestDesc, RequestGraph, RequestResult, RequestType, RunApi, RunContext, run_request};
use crate::signal::AbortSignal;
use crate::types::FileEvent;

#[derive(Debug, Clone)]
pub struct RequestExecution {
    pub request_type: RequestType,
    pub name: String,
    pub start: Instant,
    pub duration: Duration,
}

/// Timings of the requests that ran during the last drain.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub execution_times: HashMap<NodeId, RequestExecution>,
    /// Requests served from a stored result instead of running.
    pub cached: usize,
}

impl Diagnostics {
    pub fn total(&self) -> Duration {
        self.execution_times.values().map(|e| e.duration).sum()
    }

    /// The `n` longest running requests, slowest first.
    pub fn slowest(&self, n: usize) -> Vec<&RequestExecution> {
        let mut executions: Vec<_> = self.execution_times.values().collect();
        executions.sort_by(|a, b| b.duration.cmp(&a.duration));
        executions.truncate(n);
        executions
    }

    /// Plain text waterfall of the executions, ordered by start time.
    pub fn render_waterfall(&self, width: usize) -> String {
        let mut executions: Vec<_> = self.execution_times.values().collect();
        executions.sort_by_key(|e| e.start);

        let Some(first) = executions.first().map(|e| e.start) else {
            return String::new();
        };
        let end = executions
            .iter()
            .map(|e| e.start + e.duration)
            .max()
            .unwrap_or(first);
        let span = (end - first).as_secs_f64().max(f64::EPSILON);

        let mut out = String::new();
        for e in executions {
            let offset = ((e.start - first).as_secs_f64() / span * width as f64) as usize;
            let length = ((e.duration.as_secs_f64() / span * width as f64) as usize).max(1);
            let _ = writeln!(
                out,
                "{:>8.2}ms {:<width$} {} {}",
                e.duration.as_secs_f64() * 1000.0,
                format!("{}{}", " ".repeat(offset), "#".repeat(length)),
                e.request_type,
                e.name,
            );
        }
        out
    }
}

type Outcome = Result<(RequestResult, RunApi), RequestError>;

/// A request whose runner failed. It keeps no result and stays invalid, so
/// the next drain runs it again unless it is removed first.
#[derive(Debug)]
pub struct RequestFailure {
    pub id: NodeId,
    pub name: String,
    pub error: RequestError,
}

impl From<RequestFailure> for BuildError {
    fn from(failure: RequestFailure) -> Self {
        BuildError::Request(failure.name, failure.error)
    }
}

/// A request that ran but waits for sub-requests before it resolves.
struct Waiting {
    result: Arc<RequestResult>,
    remaining: HashSet<NodeId>,
}

/// Per drain bookkeeping of the coordinator.
#[derive(Default)]
struct Schedule {
    queue: VecDeque<NodeId>,
    queued: HashSet<NodeId>,
    in_progress: HashSet<NodeId>,
    /// Requests whose results go to the handler.
    requested: HashSet<NodeId>,
    /// Resolved requests waiting to be handed to the handler.
    ready: VecDeque<NodeId>,
    waiting: HashMap<NodeId, Waiting>,
    /// Child to the parents waiting on it.
    waiters: HashMap<NodeId, Vec<NodeId>>,
}

impl Schedule {
    /// Queues a request unless it is already queued, running or waiting on
    /// its children.
    fn enqueue(&mut self, id: NodeId, requested: bool) {
        if requested {
            self.requested.insert(id.clone());
        }

        if self.in_progress.contains(&id) || self.waiting.contains_key(&id) {
            return;
        }

        if self.queued.insert(id.clone()) {
            self.queue.push_back(id);
        }
    }
}

/// Runs requests on a worker pool and memoizes their results in a
/// [`RequestGraph`].
///
/// All graph updates happen on the thread calling
/// [`complete_requests`](Self::complete_requests); workers only run request
/// bodies and send the outcome back over a channel.
pub struct RequestTracker {
    graph: RequestGraph,
    pool: Arc<ThreadPool>,
    max_concurrent: usize,
    signal: AbortSignal,
    diagnostics: Diagnostics,
}

impl RequestTracker {
    /// `max_concurrent` of `0` allows one request per pool thread.
    pub fn new(graph: RequestGraph, pool: Arc<ThreadPool>, max_concurrent: usize, signal: AbortSignal) -> Self {
        let max_concurrent = match max_concurrent {
            0 => pool.current_num_threads().max(1),
            n => n,
        };

        Self {
            graph,
            pool,
            max_concurrent,
            signal,
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn graph(&self) -> &RequestGraph {
        &self.graph
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn get_result(&self, id: &str) -> Option<&Arc<RequestResult>> {
        self.graph.get_result(id)
    }

    pub fn respond_to_fs_events(&mut self, events: &[FileEvent]) -> bool {
        self.graph.respond_to_fs_events(events)
    }

    pub fn invalidate_request(&mut self, id: &str) {
        self.graph.invalidate_request(id);
    }

    pub fn remove_request(&mut self, id: &str) {
        self.graph.remove_request(id);
    }

    /// Runs `requests` together with every invalid top level request until
    /// nothing is left to do.
    ///
    /// Each result is handed to `handler`, which returns the follow-up
    /// requests it needs. A request already in flight is awaited rather than
    /// started again, and a request with a valid stored result is handed
    /// over without running.
    ///
    /// A failing request doesn't stop the drain: everything else still runs
    /// and the failures are returned in the order they happened. Only an
    /// abort ends the drain early.
    pub fn complete_requests<F>(
        &mut self,
        ctx: &Arc<RunContext>,
        requests: Vec<RequestDesc>,
        mut handler: F,
    ) -> Result<Vec<RequestFailure>, BuildError>
    where
        F: FnMut(&RequestDesc, &Arc<RequestResult>) -> Vec<RequestDesc>,
    {
        self.diagnostics = Diagnostics::default();

        let mut schedule = Schedule::default();
        let mut failures = Vec::new();

        let invalid: Vec<NodeId> = self
            .graph
            .invalid_requests()
            .filter(|id| self.graph.is_top_level(id))
            .cloned()
            .collect();
        for id in invalid {
            schedule.enqueue(id, true);
        }
        for desc in requests {
            let id = self.graph.add_request(desc);
            schedule.enqueue(id, true);
        }

        let root_span = tracing::span!(Level::INFO, "requests");
        root_span.pb_set_style(&bar_style());
        root_span.pb_set_length(schedule.queue.len() as u64);
        root_span.pb_set_message("Running requests...");
        let _enter = root_span.enter();

        let mut total = schedule.queue.len() as u64;
        let mut done = 0;
        let (sender, receiver) = channel::<(NodeId, Outcome, Instant, Duration)>();

        loop {
            if self.signal.is_aborted() {
                return Err(BuildError::Aborted);
            }

            while let Some(id) = schedule.ready.pop_front() {
                let Some(request) = self.graph.get_request(&id) else {
                    continue;
                };
                let Some(result) = request.result.clone() else {
                    continue;
                };
                let desc = request.desc.clone();

                for follow_up in handler(&desc, &result) {
                    let id = self.graph.add_request(follow_up);
                    schedule.enqueue(id, true);
                }
            }

            while schedule.in_progress.len() < self.max_concurrent
                && let Some(id) = schedule.queue.pop_front()
            {
                schedule.queued.remove(&id);

                if self.signal.is_aborted() {
                    return Err(BuildError::Aborted);
                }

                if self.graph.is_valid(&id) {
                    self.diagnostics.cached += 1;
                    // parents may be waiting on it too
                    if let Some(result) = self.graph.get_result(&id).cloned() {
                        self.resolve(&mut schedule, id, result);
                    }
                    continue;
                }

                if !schedule.in_progress.insert(id.clone()) {
                    continue;
                }

                self.spawn(ctx, id, sender.clone());
            }

            if schedule.in_progress.is_empty() {
                if schedule.ready.is_empty() && schedule.queue.is_empty() {
                    break;
                }
                continue;
            }

            let Ok((id, outcome, start, duration)) = receiver.recv() else {
                return Err(BuildError::Aborted);
            };

            schedule.in_progress.remove(&id);
            root_span.pb_inc(1);
            done += 1;

            if self.signal.is_aborted() {
                return Err(BuildError::Aborted);
            }

            let Some(desc) = self.graph.get_request(&id).map(|r| r.desc.clone()) else {
                continue;
            };

            let (result, api) = match outcome {
                Ok(ok) => ok,
                Err(error) => {
                    tracing::debug!("Request '{}' failed", desc.name());
                    failures.push(RequestFailure {
                        id,
                        name: desc.name(),
                        error,
                    });
                    continue;
                }
            };

            self.diagnostics.execution_times.insert(
                id.clone(),
                RequestExecution {
                    request_type: desc.request_type(),
                    name: desc.name(),
                    start,
                    duration,
                },
            );

            let result = Arc::new(result);
            let pending: HashSet<NodeId> = self
                .graph
                .apply(&id, api)
                .into_iter()
                .filter(|child| !self.graph.is_valid(child))
                .collect();

            if pending.is_empty() {
                self.resolve(&mut schedule, id, result);
            } else {
                for child in &pending {
                    schedule.waiters.entry(child.clone()).or_default().push(id.clone());
                    schedule.enqueue(child.clone(), false);
                }
                schedule.waiting.insert(
                    id,
                    Waiting {
                        result,
                        remaining: pending,
                    },
                );
            }

            let queued = (schedule.queue.len() + schedule.in_progress.len()) as u64;
            if done + queued > total {
                total = done + queued;
                root_span.pb_set_length(total);
            }
        }

        tracing::debug!(
            "Ran {} requests, {} served from the graph",
            self.diagnostics.execution_times.len(),
            self.diagnostics.cached
        );

        // parents of failed requests are expected to be left waiting
        if failures.is_empty() {
            for id in schedule.waiting.into_keys() {
                let name = match self.graph.get_request(&id) {
                    Some(request) => request.desc.name(),
                    None => id.to_string(),
                };
                failures.push(RequestFailure {
                    id,
                    name,
                    error: RequestError::Unresolved,
                });
            }
        }

        Ok(failures)
    }

    /// Stores a result, then resolves every parent that was only waiting
    /// for this request.
    fn resolve(&mut self, schedule: &mut Schedule, id: NodeId, result: Arc<RequestResult>) {
        let mut stack = vec![(id, result)];

        while let Some((id, result)) = stack.pop() {
            self.graph.set_result(&id, result);
            if schedule.requested.contains(&id) {
                schedule.ready.push_back(id.clone());
            }

            for parent in schedule.waiters.remove(&id).unwrap_or_default() {
                let Some(waiting) = schedule.waiting.get_mut(&parent) else {
                    continue;
                };
                waiting.remaining.remove(&id);
                if waiting.remaining.is_empty()
                    && let Some(waiting) = schedule.waiting.remove(&parent)
                {
                    stack.push((parent, waiting.result));
                }
            }
        }
    }

    fn spawn(&self, ctx: &Arc<RunContext>, id: NodeId, sender: Sender<(NodeId, Outcome, Instant, Duration)>) {
        let Some(request) = self.graph.get_request(&id) else {
            return;
        };

        let desc = request.desc.clone();
        let cached = self
            .graph
            .sub_requests(&id)
            .into_iter()
            .filter_map(|child| Some((child.clone(), self.graph.get_result(&child)?.clone())))
            .collect();
        let ctx = ctx.clone();

        self.pool.spawn(move || {
            let span = tracing::span!(Level::INFO, "request", kind = desc.request_type().as_str());
            span.pb_set_style(&task_style());
            span.pb_set_message(&desc.name());
            let _enter = span.enter();

            let start = Instant::now();

            let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut api = RunApi::with_cached(cached);
                run_request(&desc, &ctx, &mut api).map(|result| (result, api))
            })) {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        String::from("unknown payload")
                    };

                    Err(RequestError::Panic(msg))
                }
            };

            // the coordinator stops listening once a build is aborted
            let _ = sender.send((id, outcome, start, start.elapsed()));
        });
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

fn task_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.dim} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

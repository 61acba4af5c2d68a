//! Dispatch of targets in dependency order.
//!
//! The scheduler loop is the only owner of the schedule. Workers receive a
//! [`Job`] and send back a [`Done`]; everything else, including metadata of
//! the current run, is touched on the calling thread only.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;
use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use super::{Failure, FailureKind, Job, Record, Report, Run, Unit, dynamic, persist};
use crate::cache::{Cache, Event, Progress};
use crate::error::{CacheError, EngineError, ExecError};
use crate::executor::{self, Executor};
use crate::graph::Node;
use crate::meta::Metadata;
use crate::plan::Caching;
use crate::scope::{Layer, MemoryStrategy};
use crate::trigger::Decision;
use crate::utils::{as_overhead, get_style_run, get_style_task};
use crate::value::Value;
use crate::workflow::Compiled;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for upstream targets.
    Blocked,
    Ready,
    Running,
    /// A dynamic target waiting for its sub-targets.
    Expanded,
    /// Built in this run or found up to date.
    Current,
    Failed,
    Skipped,
}

impl State {
    fn is_terminal(self) -> bool {
        matches!(self, State::Current | State::Failed | State::Skipped)
    }
}

enum Kind {
    Target,
    Subtarget {
        parent: NodeIndex,
        bindings: Vec<(String, Value)>,
        layer: Layer,
    },
}

/// Bookkeeping of an expanded dynamic target.
struct Expansion {
    record: Record,
    subtargets: Vec<String>,
    remaining: usize,
    /// Whether any sub-target ran in this run.
    rebuilt: bool,
}

struct Item<'a> {
    name: String,
    compiled: &'a Compiled,
    kind: Kind,
    state: State,
    attempts: u32,
    wave: usize,
    /// Plan position, then expansion position.
    order: (usize, usize),
    /// Kept for retries.
    job: Option<Job>,
    expansion: Option<Expansion>,
}

impl Item<'_> {
    fn unit(&self) -> Unit<'_> {
        match &self.kind {
            Kind::Target => Unit {
                name: &self.name,
                compiled: self.compiled,
                bindings: &[],
                layer: Layer::Static,
            },
            Kind::Subtarget { bindings, layer, .. } => Unit {
                name: &self.name,
                compiled: self.compiled,
                bindings,
                layer: *layer,
            },
        }
    }

    fn parent(&self) -> Option<NodeIndex> {
        match self.kind {
            Kind::Subtarget { parent, .. } => Some(parent),
            Kind::Target => None,
        }
    }

    fn ticket(&self, node: NodeIndex) -> Ticket {
        Ticket {
            wave: self.wave,
            priority: self.compiled.target.priority,
            order: self.order,
            node,
        }
    }
}

/// Entry of the ready queue. The greatest ticket is dispatched first: the
/// earliest discovery wave, then the highest priority, then plan order.
#[derive(Debug, PartialEq, Eq)]
struct Ticket {
    wave: usize,
    priority: i32,
    order: (usize, usize),
    node: NodeIndex,
}

impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wave
            .cmp(&self.wave)
            .then(self.priority.cmp(&other.priority))
            .then(other.order.cmp(&self.order))
            .then(other.node.cmp(&self.node))
    }
}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// What a worker hands back.
pub(crate) struct Done {
    result: Result<Value, ExecError>,
    duration: Duration,
    /// Metadata written by the worker itself.
    stored: Option<Result<Metadata, CacheError>>,
}

/// Executes a job, on a worker or on the calling thread.
pub(crate) fn work(job: &Job, executor: &Arc<dyn Executor>, cache: &Cache, span: Span) -> Done {
    let _enter = span.enter();

    let start = Instant::now();
    let result = executor::run(executor, job.request.clone());
    let duration = start.elapsed();

    let stored = match (&result, job.caching) {
        (Ok(value), Caching::Worker) => Some(persist(cache, job, value, duration)),
        _ => None,
    };

    Done {
        result,
        duration,
        stored,
    }
}

pub(crate) struct Scheduler<'a> {
    run: Run<'a>,
    items: HashMap<NodeIndex, Item<'a>>,
    queue: BinaryHeap<Ticket>,
    report: Report,
    /// Set by a failure without `keep_going`.
    stopped: bool,
    cancelled: bool,
    span: Span,
}

impl<'a> Scheduler<'a> {
    pub(crate) fn new(run: Run<'a>) -> Result<Self, EngineError> {
        let workflow = run.workflow;
        let patterns = run.options.patterns()?;
        let selected = run.graph.select(&patterns);

        let mut items = HashMap::new();
        for &node in &selected {
            let Node::Target(name) = run.graph.node(node) else {
                continue;
            };
            let Some(compiled) = workflow.compiled(name) else {
                continue;
            };

            items.insert(
                node,
                Item {
                    name: name.clone(),
                    compiled,
                    kind: Kind::Target,
                    state: State::Blocked,
                    attempts: 0,
                    wave: 0,
                    order: (compiled.order, 0),
                    job: None,
                    expansion: None,
                },
            );
        }

        let mut queue = BinaryHeap::new();
        for (&node, item) in items.iter_mut() {
            if run.graph.upstream(node).is_empty() {
                item.state = State::Ready;
                queue.push(item.ticket(node));
            }
        }

        let span = match run.options.progress {
            true => {
                let span = tracing::span!(Level::INFO, "build");
                span.pb_set_length(items.len() as u64);
                span.pb_set_style(&get_style_run());
                span.pb_set_message("Building targets...");
                span
            }
            false => Span::none(),
        };

        Ok(Self {
            run,
            items,
            queue,
            report: Report::default(),
            stopped: false,
            cancelled: false,
            span,
        })
    }

    pub(crate) fn run(mut self) -> Result<Report, EngineError> {
        let started = Instant::now();
        let span = self.span.clone();
        let _enter = span.enter();

        tracing::info!("Building {} targets with {} jobs", self.items.len(), self.run.options.jobs);

        match self.run.options.jobs {
            1 => self.sequential()?,
            jobs => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(jobs)
                    .thread_name(|i| format!("nagare-worker-{i}"))
                    .build()?;
                pool.in_place_scope(|scope| self.parallel(scope, jobs))?;
            }
        }

        self.finish(started)
    }

    fn sequential(&mut self) -> Result<(), EngineError> {
        while let Some(node) = self.next() {
            if let Some((job, span)) = self.start(node)? {
                let done = work(&job, &self.run.executor, self.run.cache, span);
                self.complete(node, done)?;
            }
        }
        Ok(())
    }

    fn parallel<'s>(&mut self, scope: &rayon::Scope<'s>, jobs: usize) -> Result<(), EngineError>
    where
        'a: 's,
    {
        let (sender, receiver) = crossbeam_channel::unbounded::<(NodeIndex, Done)>();
        let cache: &'a Cache = self.run.cache;
        let mut in_flight = 0;

        loop {
            while in_flight < jobs {
                let Some(node) = self.next() else {
                    break;
                };
                let Some((job, span)) = self.start(node)? else {
                    continue;
                };

                let sender = sender.clone();
                let executor = self.run.executor.clone();
                scope.spawn(move |_| {
                    let done = work(&job, &executor, cache, span);
                    // the receiver is only gone when the run already failed
                    let _ = sender.send((node, done));
                });
                in_flight += 1;
            }

            if in_flight == 0 {
                return Ok(());
            }

            let Ok((node, done)) = receiver.recv() else {
                return Ok(());
            };
            in_flight -= 1;
            self.complete(node, done)?;
        }
    }

    /// Pops the next ready item, unless the run is stopping.
    fn next(&mut self) -> Option<NodeIndex> {
        if self.stopped {
            return None;
        }
        if self.run.options.cancel.is_cancelled() {
            if !self.cancelled {
                tracing::warn!("Build cancelled, waiting for running targets");
                self.cancelled = true;
            }
            return None;
        }

        while let Some(ticket) = self.queue.pop() {
            if self.items.get(&ticket.node).is_some_and(|item| item.state == State::Ready) {
                return Some(ticket.node);
            }
        }
        None
    }

    /// Checks a ready item. Returns the job to execute when it is outdated.
    fn start(&mut self, node: NodeIndex) -> Result<Option<(Job, Span)>, EngineError> {
        let Some(item) = self.items.get(&node) else {
            return Ok(None);
        };

        if let Some(job) = item.job.clone() {
            return self.dispatch(node, job).map(Some);
        }

        if matches!(item.kind, Kind::Target) && item.compiled.target.dynamic.is_some() {
            self.expand(node)?;
            return Ok(None);
        }

        let verdict = self.run.assess(&item.unit());
        let verdict = match verdict {
            Ok(verdict) => verdict,
            Err(failure) => {
                self.fail(node, failure)?;
                return Ok(None);
            }
        };

        if verdict.decision == Decision::Skip {
            tracing::debug!("'{}' is up to date", item.name);
            self.report.up_to_date.insert(item.name.clone());
            self.settle(node, State::Current)?;
            return Ok(None);
        }

        let job = self.run.job(&item.unit(), verdict.record);
        match job {
            Ok(job) => {
                if let Some(item) = self.items.get_mut(&node) {
                    item.job = Some(job.clone());
                }
                self.dispatch(node, job).map(Some)
            }
            Err(failure) => {
                self.fail(node, failure)?;
                Ok(None)
            }
        }
    }

    fn dispatch(&mut self, node: NodeIndex, job: Job) -> Result<(Job, Span), EngineError> {
        let Some(item) = self.items.get_mut(&node) else {
            return Ok((job, Span::none()));
        };
        item.attempts += 1;
        item.state = State::Running;

        let name = item.name.clone();
        let attempts = item.attempts;
        let compiled = item.compiled;

        let event = match attempts {
            1 => Event::new(&name, Progress::Running),
            n => Event::new(&name, Progress::Running).message(format!("attempt {n}")),
        };
        self.run.cache.record(&event)?;

        if self.run.options.memory == MemoryStrategy::Unload {
            for dependency in &compiled.spec.targets {
                self.run.unload(dependency);
            }
        }

        let span = match self.run.options.progress {
            true => {
                let span = tracing::span!(Level::INFO, "target", name = %name);
                span.pb_set_style(&get_style_task());
                span.pb_set_message(&format!("Building {name}"));
                span
            }
            false => Span::none(),
        };

        Ok((job, span))
    }

    /// Expands a dynamic target and queues its sub-targets.
    fn expand(&mut self, node: NodeIndex) -> Result<(), EngineError> {
        let Some(item) = self.items.get(&node) else {
            return Ok(());
        };
        let compiled = item.compiled;
        let Some(dynamic) = &compiled.target.dynamic else {
            return Ok(());
        };
        let name = item.name.clone();
        let (wave, order) = (item.wave, item.order);
        let layer = dynamic::layer(dynamic);

        let record = self.run.record(&item.unit());
        let expansions = match self.run.expand(compiled) {
            Ok(expansions) => expansions,
            Err(failure) => return self.fail(node, failure),
        };

        if let Some(taken) = expansions.iter().find(|sub| self.run.graph.contains(&sub.name)) {
            let message = format!("sub-target name '{}' is already taken", taken.name);
            return self.fail(node, Failure::new(FailureKind::Expansion, message, 0));
        }

        let subtargets: Vec<String> = expansions.iter().map(|sub| sub.name.clone()).collect();
        tracing::info!("Expanded '{name}' into {} sub-targets", subtargets.len());
        self.report.subtargets.insert(name, subtargets.clone());
        self.span.pb_inc_length(subtargets.len() as u64);

        if let Some(item) = self.items.get_mut(&node) {
            item.state = State::Expanded;
            item.expansion = Some(Expansion {
                record,
                subtargets,
                remaining: expansions.len(),
                rebuilt: false,
            });
        }

        if expansions.is_empty() {
            return self.finish_parent(node);
        }

        for sub in expansions {
            let index = self.run.graph.insert_subtarget(node, &sub.name);
            let item = Item {
                name: sub.name,
                compiled,
                kind: Kind::Subtarget {
                    parent: node,
                    bindings: sub.bindings,
                    layer,
                },
                state: State::Ready,
                attempts: 0,
                wave: wave + 1,
                order: (order.0, sub.index),
                job: None,
                expansion: None,
            };
            self.queue.push(item.ticket(index));
            self.items.insert(index, item);
        }

        Ok(())
    }

    fn complete(&mut self, node: NodeIndex, done: Done) -> Result<(), EngineError> {
        let Done {
            result,
            duration,
            stored,
        } = done;

        let Some(item) = self.items.get_mut(&node) else {
            return Ok(());
        };
        let name = item.name.clone();

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                let attempts = item.attempts;
                let retries = item.compiled.target.retries.unwrap_or(self.run.options.retries);

                if attempts <= retries && !self.stopped && !self.run.options.cancel.is_cancelled() {
                    tracing::warn!("'{name}' failed on attempt {attempts} of {}, retrying: {err}", retries + 1);
                    item.state = State::Ready;
                    let ticket = item.ticket(node);
                    self.queue.push(ticket);
                    return Ok(());
                }

                return self.fail(node, Failure::exec(&err, attempts));
            }
        };

        let Some(job) = item.job.take() else {
            let failure = Failure::new(FailureKind::Infrastructure, "completed without a job", item.attempts);
            return self.fail(node, failure);
        };
        let parent = item.parent();

        let meta = match stored {
            Some(stored) => stored?,
            None => persist(self.run.cache, &job, &value, duration)?,
        };
        for path in &job.record.outputs {
            self.run.meta.forget(path);
        }
        self.run.meta.set_current(meta);

        tracing::info!("Built '{name}' in {duration:.2?}");
        self.run.cache.record(&Event::new(&name, Progress::Built))?;
        self.report.durations.insert(name.clone(), duration);
        self.report.built.insert(name);

        if let Some(parent) = parent
            && let Some(expansion) = self.items.get_mut(&parent).and_then(|item| item.expansion.as_mut())
        {
            expansion.rebuilt = true;
        }

        self.settle(node, State::Current)
    }

    fn fail(&mut self, node: NodeIndex, failure: Failure) -> Result<(), EngineError> {
        let Some(item) = self.items.get_mut(&node) else {
            return Ok(());
        };
        item.job = None;
        let name = item.name.clone();

        tracing::error!("'{name}' failed: {}", failure.message);
        let event = Event::new(&name, Progress::Failed).message(failure.message.clone());
        self.run.cache.record(&event)?;
        self.report.failed.insert(name, failure);

        self.settle(node, State::Failed)
    }

    fn skip(&mut self, node: NodeIndex) -> Result<(), EngineError> {
        let Some(item) = self.items.get(&node) else {
            return Ok(());
        };
        let name = item.name.clone();

        tracing::debug!("Skipping '{name}'");
        self.run.cache.record(&Event::new(&name, Progress::Skipped))?;
        self.report.skipped.insert(name);

        self.settle(node, State::Skipped)
    }

    /// Moves an item into a final state and propagates it.
    fn settle(&mut self, node: NodeIndex, state: State) -> Result<(), EngineError> {
        let Some(item) = self.items.get_mut(&node) else {
            return Ok(());
        };
        item.state = state;
        let parent = item.parent();
        self.span.pb_inc(1);

        match state {
            State::Current => {
                for next in self.run.graph.downstream(node) {
                    let blocked = self.items.get(&next).is_some_and(|item| item.state == State::Blocked);
                    if blocked && self.run.graph.is_ready(next, |up| self.is(up, State::Current)) {
                        if let Some(item) = self.items.get_mut(&next) {
                            item.state = State::Ready;
                            self.queue.push(item.ticket(next));
                        }
                    }
                }
            }
            State::Failed if self.run.options.keep_going => {
                let mut descendants: Vec<NodeIndex> = self.run.graph.descendants(node).into_iter().collect();
                descendants.sort();
                for next in descendants {
                    if self.is(next, State::Blocked) || self.is(next, State::Ready) {
                        self.skip(next)?;
                    }
                }
            }
            State::Failed => self.stopped = true,
            _ => {}
        }

        if let Some(parent) = parent {
            self.child_done(parent, node, state)?;
        }

        if self.run.options.memory == MemoryStrategy::Autoclean {
            self.autoclean(node);
        }

        Ok(())
    }

    fn is(&self, node: NodeIndex, state: State) -> bool {
        self.items.get(&node).is_some_and(|item| item.state == state)
    }

    /// Notifies a dynamic target that one of its sub-targets finished.
    fn child_done(&mut self, parent: NodeIndex, child: NodeIndex, state: State) -> Result<(), EngineError> {
        if !self.is(parent, State::Expanded) {
            return Ok(());
        }

        match state {
            State::Failed => {
                let (kind, attempts) = self
                    .items
                    .get(&child)
                    .and_then(|item| self.report.failed.get(&item.name))
                    .map_or((FailureKind::User, 0), |failure| (failure.kind, failure.attempts));
                let name = self.items.get(&child).map_or("", |item| item.name.as_str());
                let failure = Failure::new(kind, format!("sub-target '{name}' failed"), attempts);
                self.fail(parent, failure)
            }
            State::Skipped => self.skip(parent),
            _ => {
                let Some(expansion) = self.items.get_mut(&parent).and_then(|item| item.expansion.as_mut()) else {
                    return Ok(());
                };
                expansion.remaining = expansion.remaining.saturating_sub(1);
                match expansion.remaining {
                    0 => self.finish_parent(parent),
                    _ => Ok(()),
                }
            }
        }
    }

    fn finish_parent(&mut self, node: NodeIndex) -> Result<(), EngineError> {
        let Some(item) = self.items.get_mut(&node) else {
            return Ok(());
        };
        let Some(expansion) = item.expansion.take() else {
            return Ok(());
        };
        let name = item.name.clone();

        let changed = self
            .run
            .finish_parent(&expansion.record, &expansion.subtargets, expansion.rebuilt)?;

        if changed {
            tracing::info!("Built '{name}' from {} sub-targets", expansion.subtargets.len());
            self.run.cache.record(&Event::new(&name, Progress::Built))?;
            self.report.built.insert(name);
        } else {
            self.report.up_to_date.insert(name);
        }

        self.settle(node, State::Current)
    }

    /// Drops values nobody is waiting for anymore.
    fn autoclean(&mut self, node: NodeIndex) {
        for up in self.run.graph.upstream(node) {
            let done = self
                .run
                .graph
                .downstream(up)
                .into_iter()
                .all(|down| self.items.get(&down).is_none_or(|item| item.state.is_terminal()));

            if done && let Some(item) = self.items.get(&up) {
                self.run.unload(&item.name);
            }
        }
    }

    fn finish(mut self, started: Instant) -> Result<Report, EngineError> {
        let mut pending: Vec<((usize, usize), String)> = self
            .items
            .values()
            .filter(|item| !item.state.is_terminal())
            .map(|item| (item.order, item.name.clone()))
            .collect();
        pending.sort();

        for (_, name) in pending {
            self.run.cache.record(&Event::new(&name, Progress::Skipped))?;
            self.report.skipped.insert(name);
        }

        self.report.elapsed = started.elapsed();

        let report = &self.report;
        tracing::info!(
            "Finished {} targets: {} built, {} up to date, {} failed, {} skipped {}",
            report.len(),
            report.built.len(),
            report.up_to_date.len(),
            report.failed.len(),
            report.skipped.len(),
            as_overhead(started)
        );

        Ok(self.report)
    }
}

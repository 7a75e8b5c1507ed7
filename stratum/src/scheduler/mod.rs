//! Distributed task scheduling.
//!
//! Tasks run on fixed intervals or cron expressions, select their input
//! entity set through the query engine, and coordinate across instances via
//! the advisory lock service. Per-task failures never stop the loop.

pub mod cron;

use crate::config::SchedulerConfig;
use crate::entity::store::EntityStore;
use crate::entity::Entity;
use crate::error::{Result, StratumError};
use crate::hooks::ComponentTarget;
use crate::lock::DistributedLock;
use crate::query::Query;
use chrono::{DateTime, Months, Utc};
use self::cron::CronExpr;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Probe period cap for intervals longer than a day.
const MAX_PROBE_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Supported trigger intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interval {
    Minute,
    Hour,
    Daily,
    Weekly,
    Monthly,
    Cron(String),
}

impl Interval {
    /// Fixed period, when the interval is not cron-driven.
    fn period(&self) -> Option<Duration> {
        match self {
            Interval::Minute => Some(Duration::from_secs(60)),
            Interval::Hour => Some(Duration::from_secs(60 * 60)),
            Interval::Daily => Some(Duration::from_secs(24 * 60 * 60)),
            Interval::Weekly => Some(Duration::from_secs(7 * 24 * 60 * 60)),
            Interval::Monthly => None,
            Interval::Cron(_) => None,
        }
    }

    /// Advances a fire time by one interval.
    fn advance(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Interval::Minute => from + chrono::Duration::minutes(1),
            Interval::Hour => from + chrono::Duration::hours(1),
            Interval::Daily => from + chrono::Duration::days(1),
            Interval::Weekly => from + chrono::Duration::weeks(1),
            Interval::Monthly => from
                .checked_add_months(Months::new(1))
                .unwrap_or(from + chrono::Duration::days(30)),
            Interval::Cron(_) => from,
        }
    }

    /// True when the repeating-timer path applies (period of at most 24 h).
    fn is_short(&self) -> bool {
        self.period().map(|p| p <= MAX_PROBE_PERIOD).unwrap_or(false)
    }
}

/// How a task produces its input entity set.
pub enum EntitySelection {
    /// Preferred: a builder returning a full query.
    Query(Arc<dyn Fn(&EntityStore) -> Query + Send + Sync>),
    /// Legacy: all entities carrying a single component class.
    Component(String),
    /// Legacy: a component-target composition filter.
    Target(ComponentTarget),
}

pub type TaskHandler = Arc<dyn Fn(Vec<Entity>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TaskOptions {
    /// Per-run timeout; the scheduler default applies when unset.
    pub timeout: Option<Duration>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Higher starts first.
    pub priority: i32,
    /// Applied to the entity query via LIMIT.
    pub max_entities_per_execution: Option<i64>,
    pub enable_logging: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            max_retries: 0,
            retry_delay: Duration::from_secs(5),
            priority: 0,
            max_entities_per_execution: None,
            enable_logging: true,
        }
    }
}

/// A task as registered by the application.
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    pub interval: Interval,
    pub selection: EntitySelection,
    pub options: TaskOptions,
    pub handler: TaskHandler,
}

impl TaskDefinition {
    pub fn new<F, Fut>(
        id: impl Into<String>,
        name: impl Into<String>,
        interval: Interval,
        selection: EntitySelection,
        handler: F,
    ) -> Self
    where
        F: Fn(Vec<Entity>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            interval,
            selection,
            options: TaskOptions::default(),
            handler: Arc::new(move |entities| Box::pin(handler(entities))),
        }
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    ConcurrencyCap,
    LockMiss,
}

/// Scheduler event stream payloads.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    TaskExecuted {
        task_id: String,
        entity_count: usize,
        duration: Duration,
    },
    TaskSkipped {
        task_id: String,
        reason: SkipReason,
    },
    TaskRetry {
        task_id: String,
        attempt: u32,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    TaskTimedOut {
        task_id: String,
    },
    LockFailed {
        task_id: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub retried: u64,
    pub skipped: u64,
    pub lock_attempts: u64,
    pub lock_acquired: u64,
    pub lock_failures: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TaskMetrics {
    pub executions: u64,
    pub failures: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub skips: u64,
    pub total_duration: Duration,
    pub last_duration: Option<Duration>,
    pub last_error: Option<String>,
}

struct ScheduledTask {
    def: TaskDefinition,
    cron: Option<CronExpr>,
    running: AtomicBool,
    next_execution: Mutex<DateTime<Utc>>,
    metrics: Mutex<TaskMetrics>,
}

/// Runs registered tasks across one or more process instances.
pub struct Scheduler {
    store: EntityStore,
    lock: Arc<DistributedLock>,
    config: SchedulerConfig,
    tasks: DashMap<String, Arc<ScheduledTask>>,
    running: AtomicUsize,
    events: broadcast::Sender<SchedulerEvent>,
    metrics: Mutex<SchedulerMetrics>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(store: EntityStore, lock: Arc<DistributedLock>, config: SchedulerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            lock,
            config,
            tasks: DashMap::new(),
            running: AtomicUsize::new(0),
            events,
            metrics: Mutex::new(SchedulerMetrics::default()),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Subscribes to the scheduler event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Registers a task. Fails on duplicate ids, invalid cron expressions,
    /// and target selections whose OR semantics the query engine cannot
    /// serve.
    pub fn register(&self, def: TaskDefinition) -> Result<()> {
        if def.id.is_empty() {
            return Err(StratumError::Scheduling("task id must not be empty".into()));
        }
        if self.tasks.contains_key(&def.id) {
            return Err(StratumError::Scheduling(format!(
                "task '{}' is already registered",
                def.id
            )));
        }
        let cron = match &def.interval {
            Interval::Cron(expr) => Some(CronExpr::parse(expr)?),
            _ => None,
        };
        if let EntitySelection::Target(target) = &def.selection {
            if !target.require_all_included || !target.require_all_excluded {
                return Err(StratumError::Scheduling(
                    "component-target selection supports AND semantics only".into(),
                ));
            }
            if target.archetype.is_some() || !target.archetypes.is_empty() {
                return Err(StratumError::Scheduling(
                    "component-target selection does not resolve archetypes".into(),
                ));
            }
        }
        let now = Utc::now();
        let next = match &cron {
            Some(cron) => cron.next_after(now).ok_or_else(|| StratumError::InvalidCron {
                expr: cron.source().to_string(),
                detail: "expression never fires".into(),
            })?,
            None => def.interval.advance(now),
        };
        let task = Arc::new(ScheduledTask {
            def,
            cron,
            running: AtomicBool::new(false),
            next_execution: Mutex::new(next),
            metrics: Mutex::new(TaskMetrics::default()),
        });
        self.tasks.insert(task.def.id.clone(), task);
        Ok(())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task_metrics(&self, task_id: &str) -> Option<TaskMetrics> {
        self.tasks.get(task_id).map(|t| t.metrics.lock().clone())
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.lock().clone()
    }

    pub fn next_execution(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.tasks.get(task_id).map(|t| *t.next_execution.lock())
    }

    /// Starts every registered task, highest priority first.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            log::info!("scheduler: disabled by configuration");
            return;
        }
        let mut tasks: Vec<Arc<ScheduledTask>> =
            self.tasks.iter().map(|entry| entry.value().clone()).collect();
        tasks.sort_by(|a, b| b.def.options.priority.cmp(&a.def.options.priority));
        let mut handles = self.handles.lock();
        for task in tasks {
            let scheduler = self.clone();
            handles.push(tokio::spawn(async move {
                scheduler.run_loop(task).await;
            }));
        }
        log::info!("scheduler: started {} task(s)", self.tasks.len());
    }

    /// Signals every loop to stop and releases held locks.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        if let Err(err) = self.lock.release_all().await {
            log::warn!("scheduler: releasing locks at shutdown failed: {}", err);
        }
    }

    async fn run_loop(self: Arc<Self>, task: Arc<ScheduledTask>) {
        let mut shutdown = self.shutdown.subscribe();
        if self.config.run_on_start {
            self.execute(&task).await;
        }
        loop {
            let now = Utc::now();
            let next = *task.next_execution.lock();
            let until_next = (next - now).to_std().unwrap_or(Duration::ZERO);
            // Long intervals probe at most daily and fire only when due.
            let sleep_for = if task.def.interval.is_short() || task.cron.is_some() {
                until_next
            } else {
                until_next.min(MAX_PROBE_PERIOD)
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => return,
            }
            let now = Utc::now();
            if now < *task.next_execution.lock() {
                continue;
            }
            self.execute(&task).await;
            let mut next = task.next_execution.lock();
            *next = match &task.cron {
                Some(cron) => match cron.next_after(now) {
                    Some(fire) => fire,
                    None => {
                        log::warn!(
                            "scheduler: cron task '{}' has no further fire time",
                            task.def.id
                        );
                        return;
                    }
                },
                None => task.def.interval.advance(now),
            };
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    /// Runs one task invocation: concurrency and lock gates, entity
    /// selection, handler with timeout, retry policy, metrics and events.
    async fn execute(&self, task: &ScheduledTask) {
        let task_id = task.def.id.clone();

        if task.running.swap(true, Ordering::SeqCst) {
            self.skip(task, SkipReason::AlreadyRunning);
            return;
        }
        if self.running.fetch_add(1, Ordering::SeqCst) >= self.config.max_concurrent_tasks {
            self.running.fetch_sub(1, Ordering::SeqCst);
            task.running.store(false, Ordering::SeqCst);
            self.skip(task, SkipReason::ConcurrencyCap);
            return;
        }

        let mut locked = false;
        if self.config.distributed_locking && self.lock.is_enabled() {
            self.metrics.lock().lock_attempts += 1;
            match self.lock.try_acquire(&task_id).await {
                Ok(true) => {
                    self.metrics.lock().lock_acquired += 1;
                    locked = true;
                }
                Ok(false) => {
                    self.metrics.lock().lock_failures += 1;
                    self.emit(SchedulerEvent::LockFailed {
                        task_id: task_id.clone(),
                    });
                    self.skip_unwind(task, SkipReason::LockMiss);
                    return;
                }
                Err(err) => {
                    log::warn!("scheduler: lock attempt for '{}' failed: {}", task_id, err);
                    self.metrics.lock().lock_failures += 1;
                    self.emit(SchedulerEvent::LockFailed {
                        task_id: task_id.clone(),
                    });
                    self.skip_unwind(task, SkipReason::LockMiss);
                    return;
                }
            }
        }

        self.run_with_retries(task).await;

        if locked {
            if let Err(err) = self.lock.release(&task_id).await {
                log::warn!("scheduler: releasing lock for '{}' failed: {}", task_id, err);
            }
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        task.running.store(false, Ordering::SeqCst);
    }

    async fn run_with_retries(&self, task: &ScheduledTask) {
        let task_id = &task.def.id;
        let timeout = task
            .def
            .options
            .timeout
            .unwrap_or_else(|| Duration::from_millis(self.config.default_timeout_ms));
        let mut attempt: u32 = 0;
        loop {
            let started = Instant::now();
            let outcome = self.run_once(task, timeout).await;
            let elapsed = started.elapsed();
            match outcome {
                Ok(count) => {
                    {
                        let mut metrics = task.metrics.lock();
                        metrics.executions += 1;
                        metrics.total_duration += elapsed;
                        metrics.last_duration = Some(elapsed);
                        metrics.last_error = None;
                    }
                    self.metrics.lock().completed += 1;
                    if task.def.options.enable_logging && self.config.enable_logging {
                        log::info!(
                            "scheduler: task '{}' processed {} entit{} in {:?}",
                            task_id,
                            count,
                            if count == 1 { "y" } else { "ies" },
                            elapsed
                        );
                    }
                    self.emit(SchedulerEvent::TaskExecuted {
                        task_id: task_id.clone(),
                        entity_count: count,
                        duration: elapsed,
                    });
                    return;
                }
                Err(TaskRunError::Timeout) => {
                    task.metrics.lock().timeouts += 1;
                    self.metrics.lock().timed_out += 1;
                    self.emit(SchedulerEvent::TaskTimedOut {
                        task_id: task_id.clone(),
                    });
                    if !self.retry_or_fail(task, &mut attempt, "task timed out").await {
                        return;
                    }
                }
                Err(TaskRunError::Failed(error)) => {
                    if !self.retry_or_fail(task, &mut attempt, &error).await {
                        return;
                    }
                }
            }
        }
    }

    /// Returns true when a retry was scheduled, false when the failure is
    /// final. Exhausted tasks wait for their next normal trigger.
    async fn retry_or_fail(&self, task: &ScheduledTask, attempt: &mut u32, error: &str) -> bool {
        let task_id = &task.def.id;
        if *attempt < task.def.options.max_retries {
            *attempt += 1;
            task.metrics.lock().retries += 1;
            self.metrics.lock().retried += 1;
            self.emit(SchedulerEvent::TaskRetry {
                task_id: task_id.clone(),
                attempt: *attempt,
            });
            if self.config.enable_logging {
                log::warn!(
                    "scheduler: task '{}' failed ({}), retry {} of {}",
                    task_id,
                    error,
                    attempt,
                    task.def.options.max_retries
                );
            }
            tokio::time::sleep(task.def.options.retry_delay).await;
            true
        } else {
            {
                let mut metrics = task.metrics.lock();
                metrics.failures += 1;
                metrics.last_error = Some(error.to_string());
            }
            self.metrics.lock().failed += 1;
            log::error!("scheduler: task '{}' failed: {}", task_id, error);
            self.emit(SchedulerEvent::TaskFailed {
                task_id: task_id.clone(),
                error: error.to_string(),
            });
            false
        }
    }

    async fn run_once(
        &self,
        task: &ScheduledTask,
        timeout: Duration,
    ) -> std::result::Result<usize, TaskRunError> {
        let entities = self
            .build_entity_set(task)
            .await
            .map_err(|e| TaskRunError::Failed(e.to_string()))?;
        let count = entities.len();
        match tokio::time::timeout(timeout, (task.def.handler)(entities)).await {
            Ok(Ok(())) => Ok(count),
            Ok(Err(err)) => Err(TaskRunError::Failed(err.to_string())),
            Err(_) => Err(TaskRunError::Timeout),
        }
    }

    async fn build_entity_set(&self, task: &ScheduledTask) -> Result<Vec<Entity>> {
        let mut query = match &task.def.selection {
            EntitySelection::Query(builder) => builder(&self.store),
            EntitySelection::Component(name) => {
                self.store.query().with_component(name, Vec::new())
            }
            EntitySelection::Target(target) => {
                let mut query = self.store.query();
                for type_id in &target.include_components {
                    let name = self
                        .store
                        .registry()
                        .component_by_type_id(type_id)
                        .map(|c| c.name.clone())
                        .ok_or_else(|| StratumError::UnknownComponent(type_id.to_string()))?;
                    query = query.with_component(&name, Vec::new());
                }
                for type_id in &target.exclude_components {
                    let name = self
                        .store
                        .registry()
                        .component_by_type_id(type_id)
                        .map(|c| c.name.clone())
                        .ok_or_else(|| StratumError::UnknownComponent(type_id.to_string()))?;
                    query = query.without_component(&name);
                }
                query
            }
        };
        if let Some(cap) = task.def.options.max_entities_per_execution {
            query = query.take(cap);
        }
        query.exec().await
    }

    /// Triggers one immediate invocation, outside the schedule. Used by
    /// operational tooling and tests.
    pub async fn trigger_now(&self, task_id: &str) -> Result<()> {
        let task = self
            .tasks
            .get(task_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| StratumError::Scheduling(format!("unknown task '{}'", task_id)))?;
        self.execute(&task).await;
        Ok(())
    }

    fn skip(&self, task: &ScheduledTask, reason: SkipReason) {
        task.metrics.lock().skips += 1;
        self.metrics.lock().skipped += 1;
        self.emit(SchedulerEvent::TaskSkipped {
            task_id: task.def.id.clone(),
            reason,
        });
    }

    fn skip_unwind(&self, task: &ScheduledTask, reason: SkipReason) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        task.running.store(false, Ordering::SeqCst);
        self.skip(task, reason);
    }
}

enum TaskRunError {
    Timeout,
    Failed(String),
}

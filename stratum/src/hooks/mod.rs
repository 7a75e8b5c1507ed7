//! Lifecycle hook dispatch.
//!
//! Callbacks register against an event kind with a priority, an optional
//! predicate, and an optional component target. Dispatch snapshots the hook
//! table, pre-filters against the batch, runs sync hooks sequentially in
//! priority order and async hooks concurrently. Hook failures are recorded
//! in metrics and never propagate to the emitter.

use crate::component::TypeId;
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Kinds of entity and component mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    EntityCreated,
    EntityUpdated,
    EntityDeleted,
    ComponentAdded,
    ComponentUpdated,
    ComponentRemoved,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::EntityCreated,
        EventKind::EntityUpdated,
        EventKind::EntityDeleted,
        EventKind::ComponentAdded,
        EventKind::ComponentUpdated,
        EventKind::ComponentRemoved,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::EntityCreated => "entity.created",
            EventKind::EntityUpdated => "entity.updated",
            EventKind::EntityDeleted => "entity.deleted",
            EventKind::ComponentAdded => "component.added",
            EventKind::ComponentUpdated => "component.updated",
            EventKind::ComponentRemoved => "component.removed",
        }
    }
}

/// One mutation, as seen by hooks.
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub kind: EventKind,
    pub entity_id: Uuid,
    /// Live component composition of the entity when the event was emitted.
    pub composition: Vec<TypeId>,
    /// The component concerned, for `component.*` kinds.
    pub component: Option<TypeId>,
    /// Changed type ids, for `entity.updated`.
    pub changed: Vec<TypeId>,
    /// Previous component data, for `component.updated`.
    pub old_data: Option<Value>,
    /// Current component data, for `component.added` / `component.updated`.
    pub new_data: Option<Value>,
    /// Whether an `entity.deleted` was a soft delete.
    pub is_soft_delete: bool,
    pub timestamp: DateTime<Utc>,
}

impl HookEvent {
    pub fn new(kind: EventKind, entity_id: Uuid, composition: Vec<TypeId>) -> Self {
        Self {
            kind,
            entity_id,
            composition,
            component: None,
            changed: Vec::new(),
            old_data: None,
            new_data: None,
            is_soft_delete: false,
            timestamp: Utc::now(),
        }
    }

    pub fn with_component(mut self, type_id: TypeId) -> Self {
        self.component = Some(type_id);
        self
    }

    pub fn with_changed(mut self, changed: Vec<TypeId>) -> Self {
        self.changed = changed;
        self
    }

    pub fn with_data(mut self, old: Option<Value>, new: Option<Value>) -> Self {
        self.old_data = old;
        self.new_data = new;
        self
    }

    pub fn soft_delete(mut self, soft: bool) -> Self {
        self.is_soft_delete = soft;
        self
    }
}

/// Selects entities by component composition.
#[derive(Debug, Clone, Default)]
pub struct ComponentTarget {
    pub include_components: Vec<TypeId>,
    /// AND (default) vs OR over `include_components`.
    pub require_all_included: bool,
    pub exclude_components: Vec<TypeId>,
    /// AND (default): all listed components must be absent. OR: at least one
    /// absent.
    pub require_all_excluded: bool,
    /// Exact composition match against this archetype; superset match when
    /// combined with include/exclude lists.
    pub archetype: Option<String>,
    /// Match any of these archetypes.
    pub archetypes: Vec<String>,
}

impl ComponentTarget {
    pub fn new() -> Self {
        Self {
            require_all_included: true,
            require_all_excluded: true,
            ..Default::default()
        }
    }

    pub fn include(mut self, type_id: TypeId) -> Self {
        self.include_components.push(type_id);
        self
    }

    pub fn exclude(mut self, type_id: TypeId) -> Self {
        self.exclude_components.push(type_id);
        self
    }

    pub fn archetype(mut self, name: impl Into<String>) -> Self {
        self.archetype = Some(name.into());
        self
    }

    /// Evaluates the target against an entity composition.
    pub fn matches(&self, composition: &[TypeId], registry: &Registry) -> bool {
        let present: HashSet<&TypeId> = composition.iter().collect();

        if !self.include_components.is_empty() {
            let hits = self
                .include_components
                .iter()
                .filter(|t| present.contains(t))
                .count();
            let ok = if self.require_all_included {
                hits == self.include_components.len()
            } else {
                hits > 0
            };
            if !ok {
                return false;
            }
        }

        if !self.exclude_components.is_empty() {
            let absent = self
                .exclude_components
                .iter()
                .filter(|t| !present.contains(t))
                .count();
            let ok = if self.require_all_excluded {
                absent == self.exclude_components.len()
            } else {
                absent > 0
            };
            if !ok {
                return false;
            }
        }

        let has_filters =
            !self.include_components.is_empty() || !self.exclude_components.is_empty();
        if let Some(name) = &self.archetype {
            if !self.matches_archetype(name, &present, has_filters, registry) {
                return false;
            }
        }
        if !self.archetypes.is_empty()
            && !self
                .archetypes
                .iter()
                .any(|name| self.matches_archetype(name, &present, has_filters, registry))
        {
            return false;
        }
        true
    }

    fn matches_archetype(
        &self,
        name: &str,
        present: &HashSet<&TypeId>,
        superset_ok: bool,
        registry: &Registry,
    ) -> bool {
        let Some(archetype) = registry.archetype(name) else {
            return false;
        };
        let declared: HashSet<TypeId> = archetype
            .component_names()
            .map(|n| TypeId::of(n))
            .collect();
        let covers = declared.iter().all(|t| present.contains(t));
        if superset_ok {
            covers
        } else {
            covers && present.len() == declared.len()
        }
    }
}

type HookCallback = Arc<dyn Fn(HookEvent) -> BoxFuture<'static, crate::error::Result<()>> + Send + Sync>;
type HookFilter = Arc<dyn Fn(&HookEvent) -> bool + Send + Sync>;

/// Registration options for one hook.
#[derive(Default)]
pub struct HookOptions {
    /// Higher runs first. Default 0.
    pub priority: i32,
    /// Async hooks for one event run concurrently; sync hooks sequentially.
    pub is_async: bool,
    pub timeout: Option<Duration>,
    pub name: Option<String>,
    pub filter: Option<HookFilter>,
    pub target: Option<ComponentTarget>,
}

impl HookOptions {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn filter(mut self, f: impl Fn(&HookEvent) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(f));
        self
    }

    pub fn target(mut self, target: ComponentTarget) -> Self {
        self.target = Some(target);
        self
    }
}

struct Hook {
    id: u64,
    priority: i32,
    is_async: bool,
    timeout: Option<Duration>,
    name: Option<String>,
    filter: Option<HookFilter>,
    target: Option<ComponentTarget>,
    callback: HookCallback,
}

impl Hook {
    fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("hook#{}", self.id))
    }
}

/// Execution counters, per event kind and global.
#[derive(Debug, Clone, Default)]
pub struct HookMetrics {
    pub total_executions: u64,
    pub total_execution_time: Duration,
    pub error_count: u64,
    pub last_execution_time: Option<Duration>,
}

impl HookMetrics {
    pub fn average_execution_time(&self) -> Duration {
        if self.total_executions == 0 {
            Duration::ZERO
        } else {
            self.total_execution_time / self.total_executions as u32
        }
    }

    fn record(&mut self, elapsed: Duration, failed: bool) {
        self.total_executions += 1;
        self.total_execution_time += elapsed;
        self.last_execution_time = Some(elapsed);
        if failed {
            self.error_count += 1;
        }
    }
}

/// Opaque id returned by registration, usable for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Registers callbacks and fans events out to them.
pub struct HookDispatcher {
    registry: Arc<Registry>,
    hooks: RwLock<HashMap<EventKind, Vec<Arc<Hook>>>>,
    next_id: AtomicU64,
    metrics: Mutex<HashMap<EventKind, HookMetrics>>,
    global_metrics: Mutex<HookMetrics>,
}

impl HookDispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            hooks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics: Mutex::new(HashMap::new()),
            global_metrics: Mutex::new(HookMetrics::default()),
        }
    }

    /// Registers a callback for one event kind. Returns an id for removal.
    pub fn register<F, Fut>(&self, kind: EventKind, options: HookOptions, callback: F) -> HookId
    where
        F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = crate::error::Result<()>> + Send + 'static,
    {
        let callback: HookCallback = Arc::new(move |event| Box::pin(callback(event)));
        self.register_boxed(kind, options, callback)
    }

    /// Registers the same callback under every event kind.
    pub fn register_lifecycle<F, Fut>(&self, options: HookOptions, callback: F) -> Vec<HookId>
    where
        F: Fn(HookEvent) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = crate::error::Result<()>> + Send + 'static,
    {
        EventKind::ALL
            .iter()
            .map(|kind| {
                let cb = callback.clone();
                self.register(
                    *kind,
                    HookOptions {
                        priority: options.priority,
                        is_async: options.is_async,
                        timeout: options.timeout,
                        name: options.name.clone(),
                        filter: options.filter.clone(),
                        target: options.target.clone(),
                    },
                    cb,
                )
            })
            .collect()
    }

    fn register_boxed(&self, kind: EventKind, options: HookOptions, callback: HookCallback) -> HookId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let hook = Arc::new(Hook {
            id,
            priority: options.priority,
            is_async: options.is_async,
            timeout: options.timeout,
            name: options.name,
            filter: options.filter,
            target: options.target,
            callback,
        });
        let mut hooks = self.hooks.write();
        let list = hooks.entry(kind).or_default();
        list.push(hook);
        // Higher priority first; registration order breaks ties.
        list.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        HookId(id)
    }

    /// Removes a hook everywhere it is registered.
    pub fn remove(&self, id: HookId) -> bool {
        let mut removed = false;
        let mut hooks = self.hooks.write();
        for list in hooks.values_mut() {
            let before = list.len();
            list.retain(|h| h.id != id.0);
            removed |= list.len() != before;
        }
        removed
    }

    pub fn hook_count(&self, kind: EventKind) -> usize {
        self.hooks.read().get(&kind).map(|l| l.len()).unwrap_or(0)
    }

    /// Dispatches a single event.
    pub async fn dispatch(&self, event: HookEvent) {
        self.dispatch_batch(vec![event]).await;
    }

    /// Dispatches a batch: events are grouped by kind; for each kind, hooks
    /// that cannot match any event in the group are skipped wholesale, then
    /// sync hooks run per event in priority order and async hooks fan out
    /// concurrently.
    pub async fn dispatch_batch(&self, events: Vec<HookEvent>) {
        let mut groups: HashMap<EventKind, Vec<HookEvent>> = HashMap::new();
        for event in events {
            groups.entry(event.kind).or_default().push(event);
        }
        for (kind, group) in groups {
            // Snapshot so registration during dispatch cannot shift the list.
            let snapshot: Vec<Arc<Hook>> = {
                let hooks = self.hooks.read();
                hooks.get(&kind).cloned().unwrap_or_default()
            };
            if snapshot.is_empty() {
                continue;
            }
            let candidates: Vec<Arc<Hook>> = snapshot
                .into_iter()
                .filter(|hook| self.could_match_any(hook, &group))
                .collect();

            let (sync_hooks, async_hooks): (Vec<_>, Vec<_>) =
                candidates.into_iter().partition(|h| !h.is_async);

            for event in &group {
                for hook in &sync_hooks {
                    self.run_hook(hook, event).await;
                }
            }

            let mut futures = Vec::new();
            for event in &group {
                for hook in &async_hooks {
                    let hook = hook.clone();
                    let event = event.clone();
                    futures.push(async move { self.run_hook(&hook, &event).await });
                }
            }
            futures::future::join_all(futures).await;
        }
    }

    fn could_match_any(&self, hook: &Hook, events: &[HookEvent]) -> bool {
        match &hook.target {
            None => true,
            Some(target) => events
                .iter()
                .any(|e| target.matches(&e.composition, &self.registry)),
        }
    }

    async fn run_hook(&self, hook: &Hook, event: &HookEvent) {
        if let Some(target) = &hook.target {
            if !target.matches(&event.composition, &self.registry) {
                return;
            }
        }
        if let Some(filter) = &hook.filter {
            if !filter(event) {
                return;
            }
        }
        let started = Instant::now();
        let fut = (hook.callback)(event.clone());
        let outcome = match hook.timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(crate::error::StratumError::Validation(format!(
                    "hook '{}' timed out after {:?}",
                    hook.label(),
                    limit
                ))),
            },
            None => fut.await,
        };
        let elapsed = started.elapsed();
        let failed = outcome.is_err();
        if let Err(err) = outcome {
            log::warn!(
                "hook '{}' failed on {}: {}",
                hook.label(),
                event.kind.as_str(),
                err
            );
        }
        self.metrics
            .lock()
            .entry(event.kind)
            .or_default()
            .record(elapsed, failed);
        self.global_metrics.lock().record(elapsed, failed);
    }

    pub fn metrics(&self, kind: EventKind) -> HookMetrics {
        self.metrics.lock().get(&kind).cloned().unwrap_or_default()
    }

    pub fn global_metrics(&self) -> HookMetrics {
        self.global_metrics.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentDescriptor, FieldDescriptor, FieldKind};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    fn registry_with(names: &[&str]) -> Arc<Registry> {
        let registry = Arc::new(Registry::new());
        for name in names {
            registry
                .register_component(
                    ComponentDescriptor::new(*name)
                        .field(FieldDescriptor::new("value", FieldKind::String)),
                )
                .unwrap();
        }
        registry
    }

    fn event_with(kind: EventKind, composition: &[&str]) -> HookEvent {
        HookEvent::new(
            kind,
            Uuid::now_v7(),
            composition.iter().map(|n| TypeId::of(n)).collect(),
        )
    }

    #[tokio::test]
    async fn sync_hooks_run_in_priority_order() {
        let dispatcher = HookDispatcher::new(registry_with(&[]));
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, priority) in [("low", 1), ("high", 10), ("mid", 5)] {
            let order = order.clone();
            dispatcher.register(
                EventKind::EntityCreated,
                HookOptions::default().priority(priority).named(name),
                move |_event| {
                    let order = order.clone();
                    async move {
                        order.lock().push(name);
                        Ok(())
                    }
                },
            );
        }

        dispatcher
            .dispatch(event_with(EventKind::EntityCreated, &[]))
            .await;
        assert_eq!(*order.lock(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn component_targeting_filters_hooks() {
        let registry = registry_with(&["Tag", "Other"]);
        let dispatcher = HookDispatcher::new(registry);
        let ran = Arc::new(Mutex::new(Vec::new()));

        for (name, priority, component) in [("h1", 10, "Tag"), ("h2", 1, "Other")] {
            let ran = ran.clone();
            dispatcher.register(
                EventKind::EntityCreated,
                HookOptions::default()
                    .priority(priority)
                    .named(name)
                    .target(ComponentTarget::new().include(TypeId::of(component))),
                move |_event| {
                    let ran = ran.clone();
                    async move {
                        ran.lock().push(name);
                        Ok(())
                    }
                },
            );
        }

        dispatcher
            .dispatch(event_with(EventKind::EntityCreated, &["Tag"]))
            .await;
        assert_eq!(*ran.lock(), vec!["h1"]);

        ran.lock().clear();
        dispatcher
            .dispatch(event_with(EventKind::EntityCreated, &["Other"]))
            .await;
        assert_eq!(*ran.lock(), vec!["h2"]);

        ran.lock().clear();
        dispatcher
            .dispatch(event_with(EventKind::EntityCreated, &["Tag", "Other"]))
            .await;
        assert_eq!(*ran.lock(), vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn failures_are_counted_not_propagated() {
        let dispatcher = HookDispatcher::new(registry_with(&[]));
        dispatcher.register(
            EventKind::EntityUpdated,
            HookOptions::default(),
            |_event| async { Err(crate::error::StratumError::Validation("boom".into())) },
        );
        dispatcher
            .dispatch(event_with(EventKind::EntityUpdated, &[]))
            .await;
        let metrics = dispatcher.metrics(EventKind::EntityUpdated);
        assert_eq!(metrics.total_executions, 1);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(dispatcher.global_metrics().error_count, 1);
    }

    #[tokio::test]
    async fn timeouts_count_as_errors_and_do_not_starve_peers() {
        let dispatcher = HookDispatcher::new(registry_with(&[]));
        let ran_after = Arc::new(AtomicUsize::new(0));

        dispatcher.register(
            EventKind::EntityCreated,
            HookOptions::default()
                .priority(10)
                .timeout(Duration::from_millis(10)),
            |_event| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        );
        {
            let ran_after = ran_after.clone();
            dispatcher.register(
                EventKind::EntityCreated,
                HookOptions::default().priority(1),
                move |_event| {
                    let ran_after = ran_after.clone();
                    async move {
                        ran_after.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            );
        }

        dispatcher
            .dispatch(event_with(EventKind::EntityCreated, &[]))
            .await;
        assert_eq!(ran_after.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.metrics(EventKind::EntityCreated).error_count, 1);
    }

    #[tokio::test]
    async fn filter_predicate_skips_events() {
        let dispatcher = HookDispatcher::new(registry_with(&[]));
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            dispatcher.register(
                EventKind::EntityDeleted,
                HookOptions::default().filter(|e| !e.is_soft_delete),
                move |_event| {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            );
        }

        dispatcher
            .dispatch(event_with(EventKind::EntityDeleted, &[]).soft_delete(true))
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        dispatcher
            .dispatch(event_with(EventKind::EntityDeleted, &[]))
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn removal_unregisters_everywhere() {
        let dispatcher = HookDispatcher::new(registry_with(&[]));
        let ids = dispatcher.register_lifecycle(HookOptions::default(), |_event| async { Ok(()) });
        assert_eq!(ids.len(), 6);
        assert_eq!(dispatcher.hook_count(EventKind::EntityCreated), 1);
        for id in ids {
            dispatcher.remove(id);
        }
        assert_eq!(dispatcher.hook_count(EventKind::EntityCreated), 0);
    }
}

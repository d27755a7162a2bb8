//! Interval scheduler for rule evaluation
//!
//! Per-rule scheduling state lives in an arena (`ScheduleTable`) indexed by
//! rule id. Each tick syncs the table with the rule store, picks the due rules
//! and spawns one evaluation task per rule. A rule still in flight when it
//! comes due again is skipped for that tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::dispatcher::Dispatcher;
use super::evaluator::{EvaluationResult, Evaluator};
use super::tracker::AlertStateTracker;
use crate::model::{AlertRule, PoolKey, RuleId};
use crate::rules::RuleStore;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due rules are collected
    pub tick: Duration,
    /// Evaluations running at once across all targets
    pub max_workers: usize,
    /// Evaluations running at once against one (type, host, port)
    pub per_target_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(1000),
            max_workers: num_cpus::get() * 4,
            per_target_concurrency: 4,
        }
    }
}

/// `t + interval`, saturating at roughly thirty years out
fn advance(t: Instant, interval: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);
    t.checked_add(interval.min(FAR_FUTURE))
        .or_else(|| t.checked_add(interval.min(Duration::from_secs(86_400))))
        .unwrap_or(t)
}

#[derive(Debug, Clone)]
struct ScheduleSlot {
    rule_id: RuleId,
    target: PoolKey,
    interval: Duration,
    next_due: Instant,
    in_flight: bool,
    /// Rule was removed or disabled while in flight; dropped on completion
    retired: bool,
    last_started: Option<Instant>,
    last_completed: Option<Instant>,
}

/// Arena of schedule slots plus a rule id index
#[derive(Debug, Default)]
pub struct ScheduleTable {
    slots: Vec<Option<ScheduleSlot>>,
    index: HashMap<RuleId, usize>,
    free: Vec<usize>,
}

impl ScheduleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn slot_mut(&mut self, rule_id: &str) -> Option<&mut ScheduleSlot> {
        let idx = *self.index.get(rule_id)?;
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn insert(&mut self, slot: ScheduleSlot) {
        let rule_id = slot.rule_id.clone();
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(rule_id, idx);
    }

    fn remove(&mut self, rule_id: &str) {
        if let Some(idx) = self.index.remove(rule_id) {
            self.slots[idx] = None;
            self.free.push(idx);
        }
    }

    /// Reconcile with the current enabled rules.
    ///
    /// New rules are due immediately. Interval changes reschedule from the last
    /// start. Rules that vanished or were disabled are dropped, or retired if
    /// an evaluation is still running.
    pub fn sync(&mut self, rules: &[AlertRule], now: Instant) {
        let enabled: HashMap<&str, &AlertRule> = rules
            .iter()
            .filter(|r| r.enabled)
            .map(|r| (r.id.as_str(), r))
            .collect();

        let stale: Vec<RuleId> = self
            .index
            .keys()
            .filter(|id| !enabled.contains_key(id.as_str()))
            .cloned()
            .collect();
        for rule_id in stale {
            let in_flight = self.slot_mut(&rule_id).map(|s| s.in_flight).unwrap_or(false);
            if in_flight {
                if let Some(slot) = self.slot_mut(&rule_id) {
                    slot.retired = true;
                }
            } else {
                self.remove(&rule_id);
            }
        }

        for rule in enabled.values() {
            let interval = rule.interval();
            let target = rule.target.pool_key();
            match self.slot_mut(&rule.id) {
                Some(slot) => {
                    slot.retired = false;
                    slot.target = target;
                    if slot.interval != interval {
                        slot.interval = interval;
                        slot.next_due = slot.last_started.map(|t| advance(t, interval)).unwrap_or(now);
                    }
                }
                None => self.insert(ScheduleSlot {
                    rule_id: rule.id.clone(),
                    target,
                    interval,
                    next_due: now,
                    in_flight: false,
                    retired: false,
                    last_started: None,
                    last_completed: None,
                }),
            }
        }
    }

    /// Claim every due slot. Returns the claimed rule ids and the ids skipped
    /// because their previous evaluation is still running.
    pub fn claim_due(&mut self, now: Instant) -> (Vec<RuleId>, Vec<RuleId>) {
        let mut claimed = Vec::new();
        let mut missed = Vec::new();

        for slot in self.slots.iter_mut().flatten() {
            if slot.retired || slot.next_due > now {
                continue;
            }
            slot.next_due = advance(now, slot.interval);
            if slot.in_flight {
                missed.push(slot.rule_id.clone());
                continue;
            }
            slot.in_flight = true;
            slot.last_started = Some(now);
            claimed.push(slot.rule_id.clone());
        }
        (claimed, missed)
    }

    /// Mark an evaluation finished
    pub fn complete(&mut self, rule_id: &str, now: Instant) {
        let retired = match self.slot_mut(rule_id) {
            Some(slot) => {
                slot.in_flight = false;
                slot.last_completed = Some(now);
                slot.retired
            }
            None => false,
        };
        if retired {
            self.remove(rule_id);
        }
    }

    pub fn is_in_flight(&self, rule_id: &str) -> bool {
        self.index
            .get(rule_id)
            .and_then(|&idx| self.slots[idx].as_ref())
            .map(|s| s.in_flight)
            .unwrap_or(false)
    }

    pub fn in_flight_count(&self) -> usize {
        self.slots.iter().flatten().filter(|s| s.in_flight).count()
    }
}

#[derive(Debug, Default)]
pub struct SchedulerStats {
    ticks: AtomicU64,
    dispatched: AtomicU64,
    missed_ticks: AtomicU64,
    evaluation_errors: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStatsSnapshot {
    pub ticks: u64,
    pub dispatched: u64,
    pub missed_ticks: u64,
    pub evaluation_errors: u64,
    pub discarded: u64,
    pub scheduled_rules: usize,
    pub in_flight: usize,
}

/// Drives evaluations on each rule's interval
pub struct Scheduler {
    store: Arc<RuleStore>,
    evaluator: Arc<Evaluator>,
    tracker: Arc<AlertStateTracker>,
    dispatcher: Arc<Dispatcher>,
    config: SchedulerConfig,
    table: Mutex<ScheduleTable>,
    workers: Arc<Semaphore>,
    target_limits: DashMap<PoolKey, Arc<Semaphore>>,
    stats: SchedulerStats,
    running: AtomicBool,
    shutdown: Notify,
}

impl Scheduler {
    pub fn new(
        store: Arc<RuleStore>,
        evaluator: Arc<Evaluator>,
        tracker: Arc<AlertStateTracker>,
        dispatcher: Arc<Dispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            evaluator,
            tracker,
            dispatcher,
            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
            config,
            table: Mutex::new(ScheduleTable::new()),
            target_limits: DashMap::new(),
            stats: SchedulerStats::default(),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Start the background scheduling loop
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            tracing::info!(
                tick = ?self.config.tick,
                max_workers = self.config.max_workers,
                per_target = self.config.per_target_concurrency,
                "Scheduler started"
            );

            let mut ticker = tokio::time::interval(self.config.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            while self.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick(Instant::now());
                    }
                    _ = self.shutdown.notified() => break,
                }
            }

            tracing::info!("Scheduler stopped");
        })
    }

    /// Stop scheduling. In-flight evaluations run to completion.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one scheduling pass and spawn evaluations for due rules
    pub fn tick(self: &Arc<Self>, now: Instant) -> Vec<JoinHandle<()>> {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let rules = self.store.snapshot();
        let (claimed, missed) = {
            let mut table = self.table.lock();
            table.sync(&rules, now);
            table.claim_due(now)
        };

        for rule_id in &missed {
            self.stats.missed_ticks.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(rule_id = %rule_id, "Previous evaluation still running, skipping tick");
        }

        let mut by_id: HashMap<RuleId, AlertRule> =
            rules.into_iter().map(|r| (r.id.clone(), r)).collect();

        claimed
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .map(|rule| {
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                let this = Arc::clone(self);
                tokio::spawn(async move { this.run(rule).await })
            })
            .collect()
    }

    fn target_limit(&self, key: &PoolKey) -> Arc<Semaphore> {
        let limit = self.config.per_target_concurrency.max(1);
        let sem = self
            .target_limits
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(limit)));
        Arc::clone(&sem)
    }

    async fn run(&self, rule: AlertRule) {
        // Per-target slot first, so a saturated backend does not hold global workers
        let target_permit = self.target_limit(&rule.target.pool_key()).acquire_owned().await;
        let worker_permit = Arc::clone(&self.workers).acquire_owned().await;

        if target_permit.is_err() || worker_permit.is_err() {
            tracing::error!(rule_id = %rule.id, "Scheduler semaphores closed");
            self.table.lock().complete(&rule.id, Instant::now());
            return;
        }

        let result = self.evaluator.evaluate(&rule).await;
        drop(worker_permit);
        drop(target_permit);

        self.complete(&rule, result);
    }

    /// Apply a finished evaluation unless the rule changed while it ran
    fn complete(&self, rule: &AlertRule, result: EvaluationResult) {
        if result.is_error() {
            self.stats.evaluation_errors.fetch_add(1, Ordering::Relaxed);
        }

        let applied = self.store.with_rule(&rule.id, |current| match current {
            Some(current) if current.enabled && current.revision == result.revision => {
                Some(self.tracker.apply(current, &result))
            }
            _ => None,
        });

        match applied {
            Some(Some(event)) => self.dispatcher.notify(event),
            Some(None) => {}
            None => {
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    rule_id = %rule.id,
                    revision = result.revision,
                    "Rule changed during evaluation, discarding result"
                );
            }
        }

        self.table.lock().complete(&rule.id, Instant::now());
    }

    pub fn stats(&self) -> SchedulerStatsSnapshot {
        let table = self.table.lock();
        SchedulerStatsSnapshot {
            ticks: self.stats.ticks.load(Ordering::Relaxed),
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            missed_ticks: self.stats.missed_ticks.load(Ordering::Relaxed),
            evaluation_errors: self.stats.evaluation_errors.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
            scheduled_rules: table.len(),
            in_flight: table.in_flight_count(),
        }
    }
}

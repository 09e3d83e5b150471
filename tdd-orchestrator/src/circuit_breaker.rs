//! Three-level circuit breakers (stage, worker, system).
//!
//! Each `(level, identifier)` pair is an independent closed/open/half-open
//! state machine:
//!
//! ```text
//! closed --(failures >= threshold)--> open --(cooldown elapsed, next check)--> half_open
//!   ^                                   ^                                          |
//!   |                                   +-------------(probe failed)---------------+
//!   +--------------------------------(probe succeeded)-----------------------------+
//! ```
//!
//! Every transition is persisted to the store and published as
//! `OrchestratorEvent::CircuitStateChanged`. A half-open breaker admits a
//! single probe; further checks are rejected until the probe reports back.
//! The probe slot belongs to the [`Admission`] that took it: only that
//! admission's outcome resolves the half-open state, and dropping it without
//! an outcome frees the slot for the next caller.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tdd_orchestrator_sdk::{BreakerLevel, CircuitState, EventBus, OrchestratorEvent, Stage};
use tracing::{debug, info, warn};

use crate::config::{BreakerSettings, BreakersConfig};
use crate::database::Database;
use crate::models::BreakerRecord;

/// Identifier of the single system-scope breaker.
pub const SYSTEM_IDENTIFIER: &str = "system";

type BreakerKey = (BreakerLevel, String);

/// One breaker scope a stage invocation is guarded by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub level: BreakerLevel,
    pub identifier: String,
}

impl Scope {
    pub fn new(level: BreakerLevel, identifier: impl Into<String>) -> Self {
        Self {
            level,
            identifier: identifier.into(),
        }
    }

    pub fn system() -> Self {
        Self::new(BreakerLevel::System, SYSTEM_IDENTIFIER)
    }

    /// The three scopes consulted before a stage runs on a worker.
    pub fn for_stage(stage: Stage, worker_id: &str) -> [Scope; 3] {
        [
            Scope::new(BreakerLevel::Stage, stage.as_str()),
            Scope::new(BreakerLevel::Worker, worker_id),
            Scope::system(),
        ]
    }
}

/// Result of [`CircuitBreakerRegistry::try_acquire`].
pub enum Acquire<'a> {
    Admitted(Admission<'a>),
    /// The first scope that refused the invocation.
    Rejected(Scope),
}

impl Acquire<'_> {
    pub fn rejected(&self) -> Option<&Scope> {
        match self {
            Acquire::Admitted(_) => None,
            Acquire::Rejected(scope) => Some(scope),
        }
    }
}

/// Permission to run one invocation, holding any half-open probe slots it was
/// granted. Report the invocation with [`Admission::record`]; dropping it
/// instead releases the slots without a verdict.
#[must_use = "dropping an admission releases its probe slots without an outcome"]
pub struct Admission<'a> {
    registry: &'a CircuitBreakerRegistry,
    scopes: Vec<Scope>,
    probes: Vec<BreakerKey>,
}

impl Admission<'_> {
    /// Whether this invocation is the half-open probe of any scope.
    pub fn holds_probe(&self) -> bool {
        !self.probes.is_empty()
    }

    /// Report the invocation's outcome against every scope it was admitted by.
    pub fn record(self, success: bool) -> Result<()> {
        self.record_at(success, Utc::now())
    }

    pub(crate) fn record_at(mut self, success: bool, now: DateTime<Utc>) -> Result<()> {
        let probes = std::mem::take(&mut self.probes);
        self.registry.record_outcome_at(&self.scopes, success, now, &probes)
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.probes.is_empty() {
            return;
        }
        match self.registry.lock() {
            Ok(mut state) => {
                for key in &self.probes {
                    state.probes_in_flight.remove(key);
                }
                debug!(probes = self.probes.len(), "probe slots released without an outcome");
            }
            Err(e) => warn!("could not release probe slots: {e:#}"),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    records: HashMap<BreakerKey, BreakerRecord>,
    probes_in_flight: HashSet<BreakerKey>,
}

/// Registry of every breaker, backed by the store.
pub struct CircuitBreakerRegistry {
    db: Database,
    config: BreakersConfig,
    bus: EventBus,
    state: Mutex<RegistryState>,
}

impl CircuitBreakerRegistry {
    /// Build the registry, restoring any persisted breaker rows.
    pub fn new(db: Database, config: BreakersConfig, bus: EventBus) -> Result<Self> {
        let mut state = RegistryState::default();
        for record in db.load_breakers()? {
            state
                .records
                .insert((record.level, record.identifier.clone()), record);
        }
        Ok(Self {
            db,
            config,
            bus,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("circuit breaker registry lock poisoned"))
    }

    fn settings(&self, level: BreakerLevel) -> &BreakerSettings {
        self.config.for_level(level)
    }

    /// Admit an invocation guarded by `scopes`.
    ///
    /// Returns the first rejecting scope, or an [`Admission`] when every scope
    /// admits. Nothing is mutated unless all scopes admit, so a rejection
    /// never consumes another scope's half-open probe.
    pub fn try_acquire(&self, scopes: &[Scope]) -> Result<Acquire<'_>> {
        self.try_acquire_at(scopes, Utc::now())
    }

    pub(crate) fn try_acquire_at(
        &self,
        scopes: &[Scope],
        now: DateTime<Utc>,
    ) -> Result<Acquire<'_>> {
        let mut state = self.lock()?;

        for scope in scopes {
            if rejects(&state, scope, now) {
                return Ok(Acquire::Rejected(scope.clone()));
            }
        }

        let mut admission = Admission {
            registry: self,
            scopes: scopes.to_vec(),
            probes: Vec::new(),
        };
        for scope in scopes {
            let key = (scope.level, scope.identifier.clone());
            let cooled = state.records.get(&key).and_then(|record| {
                (record.state == CircuitState::Open && cooldown_elapsed(record, now))
                    .then(|| record.clone())
            });
            if let Some(mut record) = cooled {
                self.transition(&mut record, CircuitState::HalfOpen, now);
                self.db.save_breaker(&record)?;
                state.records.insert(key.clone(), record);
            }
            if state
                .records
                .get(&key)
                .is_some_and(|r| r.state == CircuitState::HalfOpen)
            {
                state.probes_in_flight.insert(key.clone());
                admission.probes.push(key);
            }
        }
        Ok(Acquire::Admitted(admission))
    }

    /// Whether `level:identifier` would currently reject. Does not transition.
    pub fn is_rejecting(&self, level: BreakerLevel, identifier: &str) -> Result<bool> {
        let state = self.lock()?;
        Ok(rejects(&state, &Scope::new(level, identifier), Utc::now()))
    }

    /// Record one outcome against every scope without holding a probe slot.
    /// It counts, but cannot resolve a half-open breaker.
    pub fn record_outcome(&self, scopes: &[Scope], success: bool) -> Result<()> {
        self.record_outcome_at(scopes, success, Utc::now(), &[])
    }

    /// `probes` are the half-open slots the reporting invocation holds.
    fn record_outcome_at(
        &self,
        scopes: &[Scope],
        success: bool,
        now: DateTime<Utc>,
        probes: &[BreakerKey],
    ) -> Result<()> {
        let mut state = self.lock()?;
        for key in probes {
            state.probes_in_flight.remove(key);
        }
        for scope in scopes {
            let key = (scope.level, scope.identifier.clone());
            let is_probe = probes.contains(&key);

            let mut record = state
                .records
                .get(&key)
                .cloned()
                .unwrap_or_else(|| closed_record(scope, now));
            let settings = self.settings(scope.level).clone();

            match (record.state, success) {
                (CircuitState::Closed, true) => {
                    record.success_count += 1;
                    if settings.failure_rate.is_none() {
                        record.failure_count = 0;
                    }
                }
                (CircuitState::Closed, false) => {
                    record.failure_count += 1;
                    if should_open(&settings, &record) {
                        record.consecutive_opens = 0;
                        self.open(&mut record, &settings, now);
                    }
                }
                // Admitted before the breaker opened; only the probe decides
                (CircuitState::HalfOpen, true) if !is_probe => record.success_count += 1,
                (CircuitState::HalfOpen, false) if !is_probe => record.failure_count += 1,
                (CircuitState::HalfOpen, true) => {
                    self.transition(&mut record, CircuitState::Closed, now);
                    record.failure_count = 0;
                    record.success_count = 0;
                    record.consecutive_opens = 0;
                    record.cooldown_until = None;
                }
                (CircuitState::HalfOpen, false) => {
                    record.failure_count += 1;
                    record.consecutive_opens += 1;
                    self.open(&mut record, &settings, now);
                }
                // Outcome of an invocation admitted before the breaker opened
                (CircuitState::Open, true) => record.success_count += 1,
                (CircuitState::Open, false) => record.failure_count += 1,
            }

            self.db.save_breaker(&record)?;
            state.records.insert(key, record);
        }
        Ok(())
    }

    /// Force a breaker closed with zeroed counters (operator recovery).
    pub fn reset(&self, level: BreakerLevel, identifier: &str) -> Result<()> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let scope = Scope::new(level, identifier);
        let key = (level, identifier.to_string());
        state.probes_in_flight.remove(&key);

        let mut record = state
            .records
            .get(&key)
            .cloned()
            .unwrap_or_else(|| closed_record(&scope, now));
        if record.state != CircuitState::Closed {
            self.transition(&mut record, CircuitState::Closed, now);
        }
        record.failure_count = 0;
        record.success_count = 0;
        record.consecutive_opens = 0;
        record.cooldown_until = None;

        self.db.save_breaker(&record)?;
        state.records.insert(key, record);
        info!(level = %level, identifier, "circuit breaker reset");
        Ok(())
    }

    /// Reset every breaker at `level`.
    pub fn reset_level(&self, level: BreakerLevel) -> Result<usize> {
        let identifiers: Vec<String> = {
            let state = self.lock()?;
            state
                .records
                .keys()
                .filter(|(l, _)| *l == level)
                .map(|(_, id)| id.clone())
                .collect()
        };
        for id in &identifiers {
            self.reset(level, id)?;
        }
        Ok(identifiers.len())
    }

    pub fn get(&self, level: BreakerLevel, identifier: &str) -> Result<Option<BreakerRecord>> {
        let state = self.lock()?;
        Ok(state.records.get(&(level, identifier.to_string())).cloned())
    }

    pub fn snapshot(&self) -> Result<Vec<BreakerRecord>> {
        let state = self.lock()?;
        let mut records: Vec<_> = state.records.values().cloned().collect();
        records.sort_by(|a, b| (a.level, &a.identifier).cmp(&(b.level, &b.identifier)));
        Ok(records)
    }

    fn open(&self, record: &mut BreakerRecord, settings: &BreakerSettings, now: DateTime<Utc>) {
        let cooldown = backoff_cooldown(settings, record.consecutive_opens);
        self.transition(record, CircuitState::Open, now);
        record.cooldown_until = Some(now + cooldown);
    }

    fn transition(&self, record: &mut BreakerRecord, new_state: CircuitState, now: DateTime<Utc>) {
        let old_state = record.state;
        record.state = new_state;
        record.last_state_change = now;

        if new_state == CircuitState::Open {
            warn!(
                level = %record.level,
                identifier = %record.identifier,
                failure_count = record.failure_count,
                "circuit opened"
            );
        } else {
            info!(
                level = %record.level,
                identifier = %record.identifier,
                from = %old_state,
                to = %new_state,
                "circuit state changed"
            );
        }

        self.bus.publish(OrchestratorEvent::CircuitStateChanged {
            level: record.level,
            identifier: record.identifier.clone(),
            old_state,
            new_state,
            failure_count: record.failure_count,
            at: now,
        });
    }
}

// ============================================================================
// State machine helpers
// ============================================================================

fn closed_record(scope: &Scope, now: DateTime<Utc>) -> BreakerRecord {
    BreakerRecord {
        level: scope.level,
        identifier: scope.identifier.clone(),
        state: CircuitState::Closed,
        failure_count: 0,
        success_count: 0,
        consecutive_opens: 0,
        last_state_change: now,
        cooldown_until: None,
    }
}

fn cooldown_elapsed(record: &BreakerRecord, now: DateTime<Utc>) -> bool {
    record.cooldown_until.map_or(true, |until| now >= until)
}

fn rejects(state: &RegistryState, scope: &Scope, now: DateTime<Utc>) -> bool {
    let key = (scope.level, scope.identifier.clone());
    match state.records.get(&key) {
        None => false,
        Some(record) => match record.state {
            CircuitState::Closed => false,
            CircuitState::Open => !cooldown_elapsed(record, now),
            CircuitState::HalfOpen => state.probes_in_flight.contains(&key),
        },
    }
}

fn should_open(settings: &BreakerSettings, record: &BreakerRecord) -> bool {
    if record.failure_count < settings.failure_threshold {
        return false;
    }
    match settings.failure_rate {
        None => true,
        Some(rate) => {
            let samples = record.failure_count + record.success_count;
            samples >= settings.min_samples
                && record.failure_count as f64 / samples as f64 >= rate
        }
    }
}

fn backoff_cooldown(settings: &BreakerSettings, consecutive_opens: u32) -> ChronoDuration {
    let base = settings.cooldown_secs as f64;
    let scaled = base * settings.backoff_multiplier.powi(consecutive_opens.min(32) as i32);
    let secs = scaled.min(settings.max_cooldown_secs as f64).max(0.0);
    ChronoDuration::milliseconds((secs * 1000.0) as i64)
}

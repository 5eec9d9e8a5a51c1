//! Capacity planning and assignee placement.
//!
//! A planning pass counts the genuinely new assignees in a batch, compares
//! that demand with the free slots of active units, and clones the
//! template when capacity is short. Placement then binds each new assignee
//! to the first active unit with room.

use std::collections::{HashMap, HashSet};
use std::io;

use emufleet_events::{
    event_types, AssigneeUnassignedPayload, CapacityInputPayload, CapacityPlanPayload,
    CloneAttemptPayload, FailurePayload, IngestFinishedPayload, PlanPhase, UnitRefPayload,
    UnitSkippedPayload, UnitsProvisionedPayload,
};
use emufleet_id::SessionId;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::error::{FleetError, Result};
use crate::provisioner::Provisioner;
use crate::registry::{NewAssignee, Registry, SharedRegistry, Unit, UnitStatus, UNIT_CAPACITY};

/// Free slots across active units.
pub fn available_capacity(units: &[Unit], counts: &HashMap<String, usize>) -> usize {
    units
        .iter()
        .filter(|unit| unit.status == UnitStatus::Active)
        .map(|unit| {
            let used = counts.get(&unit.name).copied().unwrap_or(0);
            UNIT_CAPACITY.saturating_sub(used)
        })
        .sum()
}

/// Units to clone to cover `deficit` assignees.
pub fn clones_needed(deficit: usize) -> usize {
    deficit.div_ceil(UNIT_CAPACITY)
}

/// First occurrence of each non-blank id, in batch order.
pub fn dedupe(batch: &[NewAssignee]) -> Vec<&NewAssignee> {
    let mut seen = HashSet::new();
    batch
        .iter()
        .filter(|a| !a.id.trim().is_empty())
        .filter(|a| seen.insert(a.id.as_str()))
        .collect()
}

/// Where each new assignee of a batch ended up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssignmentReport {
    /// `(assignee_id, unit_name)` in batch order.
    pub assigned: Vec<(String, String)>,
    /// Recorded without a unit because capacity was still short.
    pub unassigned: Vec<String>,
    /// Already in the registry; left untouched.
    pub skipped_existing: usize,
}

/// Outcome of [`CapacityPlanner::ingest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub provisioned: Vec<String>,
    #[serde(flatten)]
    pub assignment: AssignmentReport,
}

/// Keeps unit capacity ahead of assignee demand.
pub struct CapacityPlanner {
    registry: SharedRegistry,
    provisioner: Provisioner,
    bus: EventBus,
    /// Serializes planning passes.
    pass: Mutex<()>,
}

impl CapacityPlanner {
    pub fn new(registry: SharedRegistry, provisioner: Provisioner, bus: EventBus) -> Self {
        Self {
            registry,
            provisioner,
            bus,
            pass: Mutex::new(()),
        }
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// Make sure active units can take every new assignee in `batch`.
    ///
    /// Returns the names of units cloned by this pass. Units registered
    /// from clones already on disk are not included.
    pub async fn ensure_capacity(
        &self,
        session: SessionId,
        batch: &[NewAssignee],
    ) -> Result<Vec<String>> {
        let _pass = self.pass.lock().await;
        self.ensure_capacity_locked(session, batch).await
    }

    async fn ensure_capacity_locked(
        &self,
        session: SessionId,
        batch: &[NewAssignee],
    ) -> Result<Vec<String>> {
        let unique = dedupe(batch);

        let (demand, already_registered) = {
            let registry = self.registry.lock().await;
            let existing = registry.assignee_ids()?;
            let new = unique.iter().filter(|a| !existing.contains(&a.id)).count();
            (new, unique.len() - new)
        };

        self.bus.emit(
            session,
            event_types::CAPACITY_INPUT,
            &CapacityInputPayload {
                incoming_total: batch.len(),
                incoming_unique: unique.len(),
                already_registered,
                required_new: demand,
            },
        );

        if demand == 0 {
            self.bus.emit(
                session,
                event_types::CAPACITY_PLAN,
                &CapacityPlanPayload::new(PlanPhase::NoNewAssignees, 0, 0),
            );
            return Ok(Vec::new());
        }

        let (units, mut capacity) = {
            let registry = self.registry.lock().await;
            let units = registry.list_units()?;
            let capacity = available_capacity(&units, &registry.assigned_counts()?);
            (units, capacity)
        };

        if units.is_empty() {
            self.bus.emit(
                session,
                event_types::CAPACITY_PLAN,
                &CapacityPlanPayload::new(PlanPhase::Bootstrap, demand, capacity),
            );
            let registered = self.register_existing_clones(session).await?;

            let registry = self.registry.lock().await;
            capacity = available_capacity(&registry.list_units()?, &registry.assigned_counts()?);
            drop(registry);

            let mut plan = CapacityPlanPayload::new(PlanPhase::AfterBootstrap, demand, capacity);
            plan.registered = Some(registered);
            self.bus.emit(session, event_types::CAPACITY_PLAN, &plan);
        }

        if capacity >= demand {
            self.bus.emit(
                session,
                event_types::CAPACITY_PLAN,
                &CapacityPlanPayload::new(PlanPhase::RegistryOnly, demand, capacity),
            );
            return Ok(Vec::new());
        }

        let deficit = demand - capacity;
        let needed = clones_needed(deficit);
        let mut plan = CapacityPlanPayload::new(PlanPhase::Cloning, demand, capacity);
        plan.deficit = Some(deficit);
        plan.clones_needed = Some(needed);
        self.bus.emit(session, event_types::CAPACITY_PLAN, &plan);

        info!(
            session_id = %session,
            demand,
            capacity,
            deficit,
            clones_needed = needed,
            "Capacity short, cloning units"
        );

        // Every clone would fail without a template.
        if let Err(e) = self.provisioner.verify_template() {
            self.report_failure(session, event_types::UNIT_TEMPLATE_ERROR, &e);
            return Err(e);
        }

        self.clone_units_locked(session, needed).await
    }

    /// Clone `count` units and register them as active.
    pub async fn clone_units(&self, session: SessionId, count: usize) -> Result<Vec<String>> {
        let _pass = self.pass.lock().await;
        if let Err(e) = self.provisioner.verify_template() {
            self.report_failure(session, event_types::UNIT_TEMPLATE_ERROR, &e);
            return Err(e);
        }
        self.clone_units_locked(session, count).await
    }

    async fn clone_units_locked(&self, session: SessionId, count: usize) -> Result<Vec<String>> {
        let mut created = Vec::new();

        for attempt in 1..=count {
            self.bus.emit(
                session,
                event_types::UNIT_CLONE_STARTED,
                &CloneAttemptPayload {
                    attempt,
                    total: count,
                },
            );

            let provisioner = self.provisioner.clone();
            let result = tokio::task::spawn_blocking(move || provisioner.clone_template())
                .await
                .map_err(|e| FleetError::Io(io::Error::other(e)))
                .and_then(|r| r);

            match result {
                Ok(name) => {
                    self.registry.lock().await.create_unit(&name)?;
                    info!(session_id = %session, unit = %name, attempt, "Unit cloned");
                    self.bus.emit(
                        session,
                        event_types::UNIT_CLONE_FINISHED,
                        &UnitRefPayload { unit: name.clone() },
                    );
                    created.push(name);
                }
                Err(e) => {
                    warn!(session_id = %session, attempt, error = %e, "Clone failed");
                    self.report_failure(session, event_types::UNIT_CLONE_ERROR, &e);
                }
            }
        }

        Ok(created)
    }

    /// Register clones found on disk. Returns the names newly registered.
    async fn register_existing_clones(&self, session: SessionId) -> Result<Vec<String>> {
        if let Err(e) = self.provisioner.verify_template() {
            self.report_failure(session, event_types::UNIT_TEMPLATE_ERROR, &e);
        }

        let ordinals = match self.provisioner.list_existing_clones() {
            Ok(ordinals) => ordinals,
            Err(e) => {
                self.report_failure(session, event_types::UNIT_SCAN_ERROR, &e);
                Vec::new()
            }
        };

        let mut registered = Vec::new();
        {
            let registry = self.registry.lock().await;
            for ordinal in ordinals {
                let name = self.provisioner.clone_name(ordinal);
                if registry.create_unit(&name)? {
                    self.bus.emit(
                        session,
                        event_types::UNIT_EXISTING_REGISTERED,
                        &UnitRefPayload { unit: name.clone() },
                    );
                    registered.push(name);
                }
            }
        }

        if let Ok(incomplete) = self.provisioner.list_incomplete_clones() {
            for ordinal in incomplete {
                let name = self.provisioner.clone_name(ordinal);
                self.bus.emit(
                    session,
                    event_types::UNIT_EXISTING_SKIPPED,
                    &UnitSkippedPayload {
                        directory: self.provisioner.unit_directory(&name).display().to_string(),
                        descriptor: self
                            .provisioner
                            .unit_descriptor(&name)
                            .display()
                            .to_string(),
                        unit: name,
                    },
                );
            }
        }

        if !registered.is_empty() {
            info!(session_id = %session, count = registered.len(), "Registered existing clones");
        }
        Ok(registered)
    }

    /// Bind each new assignee in `batch` to the first active unit with room.
    pub async fn assign(&self, session: SessionId, batch: &[NewAssignee]) -> Result<AssignmentReport> {
        let _pass = self.pass.lock().await;
        self.assign_locked(session, batch).await
    }

    async fn assign_locked(
        &self,
        session: SessionId,
        batch: &[NewAssignee],
    ) -> Result<AssignmentReport> {
        let registry = self.registry.lock().await;
        let report = place(&registry, batch)?;
        drop(registry);

        for id in &report.unassigned {
            warn!(session_id = %session, assignee_id = %id, "No unit capacity, assignee left unassigned");
            self.bus.emit(
                session,
                event_types::ASSIGNEE_UNASSIGNED,
                &AssigneeUnassignedPayload {
                    assignee_id: id.clone(),
                },
            );
        }
        Ok(report)
    }

    /// Plan capacity for `batch`, then place it.
    pub async fn ingest(&self, session: SessionId, batch: &[NewAssignee]) -> Result<IngestReport> {
        let _pass = self.pass.lock().await;

        let provisioned = self.ensure_capacity_locked(session, batch).await?;
        if !provisioned.is_empty() {
            self.bus.emit(
                session,
                event_types::UNITS_PROVISIONED,
                &UnitsProvisionedPayload {
                    created: provisioned.clone(),
                },
            );
        }

        let assignment = self.assign_locked(session, batch).await?;
        self.bus.emit(
            session,
            event_types::INGEST_FINISHED,
            &IngestFinishedPayload {
                rows: batch.len(),
                assigned: assignment.assigned.len(),
                unassigned: assignment.unassigned.len(),
                skipped_existing: assignment.skipped_existing,
            },
        );

        Ok(IngestReport {
            provisioned,
            assignment,
        })
    }

    fn report_failure(&self, session: SessionId, event_type: &str, error: &FleetError) {
        self.bus.emit(
            session,
            event_type,
            &FailurePayload {
                reason_code: error.reason_code().to_string(),
                error: error.to_string(),
            },
        );
    }
}

fn place(registry: &Registry, batch: &[NewAssignee]) -> Result<AssignmentReport> {
    let existing = registry.assignee_ids()?;
    let mut counts = registry.assigned_counts()?;
    let mut open: Vec<String> = registry
        .list_units()?
        .into_iter()
        .filter(|unit| unit.status == UnitStatus::Active)
        .map(|unit| unit.name)
        .collect();

    let mut report = AssignmentReport::default();
    for new in dedupe(batch) {
        if existing.contains(&new.id) {
            report.skipped_existing += 1;
            continue;
        }

        open.retain(|name| counts.get(name).copied().unwrap_or(0) < UNIT_CAPACITY);
        let Some(unit) = open.first().cloned() else {
            registry.create_assignee(new, None)?;
            report.unassigned.push(new.id.clone());
            continue;
        };

        registry.create_assignee(new, Some(&unit))?;
        let count = counts.entry(unit.clone()).or_insert(0);
        *count += 1;
        if *count >= UNIT_CAPACITY {
            registry.update_unit_status(&unit, UnitStatus::Completed)?;
        }
        report.assigned.push((new.id.clone(), unit));
    }

    Ok(report)
}

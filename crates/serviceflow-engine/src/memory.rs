//! In-memory store with the same plan semantics as the sqlite backend:
//! compare-and-set on the version column, all-or-nothing plan application,
//! and an append-only history list. Intended for unit tests and ephemeral
//! tooling; plans are applied to a staged copy so a rejected plan leaves no
//! partial writes.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serviceflow_domain::{
    AssignmentChange, AssignmentId, AssignmentStatus, FirmId, RequestId, RequestTransitionPlan,
    Service, ServiceAssignment, ServiceId, ServiceRequest, ServiceStatusHistory, TransitionPlan,
    WorkflowError,
};
use serviceflow_store_core::WorkflowStore;

#[derive(Debug, Default, Clone)]
struct MemoryInner {
    services: BTreeMap<(FirmId, ServiceId), Service>,
    assignments: BTreeMap<(FirmId, AssignmentId), ServiceAssignment>,
    history: Vec<ServiceStatusHistory>,
    requests: BTreeMap<(FirmId, RequestId), ServiceRequest>,
}

impl MemoryInner {
    fn chain_head(&self, firm_id: FirmId, service_id: ServiceId) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|record| record.firm_id == firm_id && record.service_id == service_id)
            .map(|record| record.record_hash.as_str())
    }

    fn apply_assignment_change(
        &mut self,
        firm_id: FirmId,
        change: &AssignmentChange,
    ) -> Result<(), WorkflowError> {
        match change {
            AssignmentChange::Insert(assignment) => {
                let clash = self.assignments.values().any(|existing| {
                    existing.firm_id == firm_id
                        && existing.service_id == assignment.service_id
                        && existing.status == AssignmentStatus::Active
                });
                if clash {
                    return Err(WorkflowError::InvariantViolation(format!(
                        "service {} already has an active assignment",
                        assignment.service_id
                    )));
                }
                self.assignments
                    .insert((firm_id, assignment.assignment_id), assignment.clone());
            }
            AssignmentChange::SetStatus {
                assignment_id,
                status,
                revoked_by,
                revoke_reason,
                updated_at,
            } => {
                let assignment = self
                    .assignments
                    .get_mut(&(firm_id, *assignment_id))
                    .ok_or(WorkflowError::NotFound {
                        entity: "assignment",
                        id: assignment_id.to_string(),
                    })?;
                assignment.status = *status;
                if revoked_by.is_some() {
                    assignment.revoked_by.clone_from(revoked_by);
                }
                if revoke_reason.is_some() {
                    assignment.revoke_reason.clone_from(revoke_reason);
                }
                assignment.updated_at = *updated_at;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryWorkflowStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorkflowStore for MemoryWorkflowStore {
    fn migrate(&self) -> Result<(), WorkflowError> {
        Ok(())
    }

    fn insert_service(
        &self,
        service: &Service,
        creation_history: &ServiceStatusHistory,
    ) -> Result<(), WorkflowError> {
        let mut inner = self.lock();
        let key = (service.firm_id, service.service_id);
        if inner.services.contains_key(&key) {
            return Err(WorkflowError::InvariantViolation(format!(
                "service {} already exists",
                service.service_id
            )));
        }
        inner.services.insert(key, service.clone());
        inner.history.push(creation_history.clone());
        Ok(())
    }

    fn get_service(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Option<Service>, WorkflowError> {
        Ok(self.lock().services.get(&(firm_id, service_id)).cloned())
    }

    fn list_services(&self, firm_id: FirmId) -> Result<Vec<Service>, WorkflowError> {
        let inner = self.lock();
        let mut services: Vec<Service> = inner
            .services
            .values()
            .filter(|service| service.firm_id == firm_id)
            .cloned()
            .collect();
        services.sort_by(|a, b| {
            (a.created_at, a.service_id).cmp(&(b.created_at, b.service_id))
        });
        Ok(services)
    }

    fn apply_transition(&self, plan: &TransitionPlan) -> Result<(), WorkflowError> {
        let mut inner = self.lock();
        // Stage the whole plan on a copy; commit by replacement.
        let mut staged = inner.clone();

        let service = staged
            .services
            .get_mut(&(plan.firm_id, plan.service_id))
            .ok_or(WorkflowError::NotFound {
                entity: "service",
                id: plan.service_id.to_string(),
            })?;
        if service.version != plan.expected_version || service.status != plan.from_status {
            return Err(WorkflowError::Conflict);
        }
        service.status = plan.to_status;
        if plan.set_completed_at.is_some() {
            service.completed_at = plan.set_completed_at;
        }
        service.version += 1;
        service.updated_at = plan.updated_at;

        for change in &plan.assignment_changes {
            staged.apply_assignment_change(plan.firm_id, change)?;
        }

        if staged.chain_head(plan.firm_id, plan.service_id)
            != plan.history.prev_record_hash.as_deref()
        {
            return Err(WorkflowError::InvariantViolation(format!(
                "audit chain head moved for service {}",
                plan.service_id
            )));
        }
        staged.history.push(plan.history.clone());

        *inner = staged;
        Ok(())
    }

    fn active_assignment(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Option<ServiceAssignment>, WorkflowError> {
        let inner = self.lock();
        Ok(inner
            .assignments
            .values()
            .find(|assignment| {
                assignment.firm_id == firm_id
                    && assignment.service_id == service_id
                    && assignment.status == AssignmentStatus::Active
            })
            .cloned())
    }

    fn get_assignment(
        &self,
        firm_id: FirmId,
        assignment_id: AssignmentId,
    ) -> Result<Option<ServiceAssignment>, WorkflowError> {
        Ok(self
            .lock()
            .assignments
            .get(&(firm_id, assignment_id))
            .cloned())
    }

    fn list_assignments(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Vec<ServiceAssignment>, WorkflowError> {
        let inner = self.lock();
        let mut assignments: Vec<ServiceAssignment> = inner
            .assignments
            .values()
            .filter(|assignment| {
                assignment.firm_id == firm_id && assignment.service_id == service_id
            })
            .cloned()
            .collect();
        assignments.sort_by(|a, b| {
            (a.delegation_level, a.created_at).cmp(&(b.delegation_level, b.created_at))
        });
        Ok(assignments)
    }

    fn history(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Vec<ServiceStatusHistory>, WorkflowError> {
        let inner = self.lock();
        Ok(inner
            .history
            .iter()
            .filter(|record| record.firm_id == firm_id && record.service_id == service_id)
            .cloned()
            .collect())
    }

    fn last_history(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Option<ServiceStatusHistory>, WorkflowError> {
        let inner = self.lock();
        Ok(inner
            .history
            .iter()
            .rev()
            .find(|record| record.firm_id == firm_id && record.service_id == service_id)
            .cloned())
    }

    fn insert_request(&self, request: &ServiceRequest) -> Result<(), WorkflowError> {
        let mut inner = self.lock();
        let key = (request.firm_id, request.request_id);
        if inner.requests.contains_key(&key) {
            return Err(WorkflowError::InvariantViolation(format!(
                "request {} already exists",
                request.request_id
            )));
        }
        inner.requests.insert(key, request.clone());
        Ok(())
    }

    fn get_request(
        &self,
        firm_id: FirmId,
        request_id: RequestId,
    ) -> Result<Option<ServiceRequest>, WorkflowError> {
        Ok(self.lock().requests.get(&(firm_id, request_id)).cloned())
    }

    fn list_requests(&self, firm_id: FirmId) -> Result<Vec<ServiceRequest>, WorkflowError> {
        let inner = self.lock();
        let mut requests: Vec<ServiceRequest> = inner
            .requests
            .values()
            .filter(|request| request.firm_id == firm_id)
            .cloned()
            .collect();
        requests.sort_by(|a, b| {
            (a.created_at, a.request_id).cmp(&(b.created_at, b.request_id))
        });
        Ok(requests)
    }

    fn apply_request_transition(&self, plan: &RequestTransitionPlan) -> Result<(), WorkflowError> {
        let mut inner = self.lock();
        let mut staged = inner.clone();

        let request = staged
            .requests
            .get_mut(&(plan.firm_id, plan.request_id))
            .ok_or(WorkflowError::NotFound {
                entity: "service_request",
                id: plan.request_id.to_string(),
            })?;
        if request.version != plan.expected_version || request.status != plan.from_status {
            return Err(WorkflowError::Conflict);
        }
        request.status = plan.to_status;
        if plan.reviewed_by.is_some() {
            request.reviewed_by.clone_from(&plan.reviewed_by);
        }
        if plan.reviewed_at.is_some() {
            request.reviewed_at = plan.reviewed_at;
        }
        if plan.decision_note.is_some() {
            request.decision_note.clone_from(&plan.decision_note);
        }
        if plan.quoted_fee_minor.is_some() {
            request.quoted_fee_minor = plan.quoted_fee_minor;
        }
        if plan.converted_service_id.is_some() {
            request.converted_service_id = plan.converted_service_id;
        }
        request.version += 1;
        request.updated_at = plan.updated_at;

        if let Some(new_service) = &plan.new_service {
            let key = (new_service.service.firm_id, new_service.service.service_id);
            if staged.services.contains_key(&key) {
                return Err(WorkflowError::InvariantViolation(format!(
                    "service {} already exists",
                    new_service.service.service_id
                )));
            }
            staged.services.insert(key, new_service.service.clone());
            staged.history.push(new_service.creation_history.clone());
        }

        *inner = staged;
        Ok(())
    }
}

#![forbid(unsafe_code)]

use serviceflow_domain::{
    AssignmentId, FirmId, RequestId, RequestTransitionPlan, Service, ServiceAssignment,
    ServiceId, ServiceRequest, ServiceStatusHistory, TransitionPlan, WorkflowError,
};

/// Persistence seam for the lifecycle engine. Everything a single accepted
/// operation writes arrives as one plan and must be applied atomically;
/// reads must observe a consistent snapshot (never a half-applied plan).
pub trait WorkflowStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<(), WorkflowError>;

    /// Insert a new service together with its creation audit record
    /// (`from: None, to: PENDING`) in one transaction.
    #[allow(clippy::missing_errors_doc)]
    fn insert_service(
        &self,
        service: &Service,
        creation_history: &ServiceStatusHistory,
    ) -> Result<(), WorkflowError>;

    #[allow(clippy::missing_errors_doc)]
    fn get_service(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Option<Service>, WorkflowError>;

    #[allow(clippy::missing_errors_doc)]
    fn list_services(&self, firm_id: FirmId) -> Result<Vec<Service>, WorkflowError>;

    /// Apply one transition plan atomically. Fails with
    /// [`WorkflowError::Conflict`] when the compare-and-set version guard
    /// misses, [`WorkflowError::NotFound`] when the service does not exist,
    /// and [`WorkflowError::InvariantViolation`] when the write would break
    /// the ledger or audit-chain invariants; in every failure case nothing
    /// is written.
    #[allow(clippy::missing_errors_doc)]
    fn apply_transition(&self, plan: &TransitionPlan) -> Result<(), WorkflowError>;

    #[allow(clippy::missing_errors_doc)]
    fn active_assignment(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Option<ServiceAssignment>, WorkflowError>;

    #[allow(clippy::missing_errors_doc)]
    fn get_assignment(
        &self,
        firm_id: FirmId,
        assignment_id: AssignmentId,
    ) -> Result<Option<ServiceAssignment>, WorkflowError>;

    #[allow(clippy::missing_errors_doc)]
    fn list_assignments(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Vec<ServiceAssignment>, WorkflowError>;

    /// Audit trail for one service in append order. The store exposes no
    /// update or delete for history records.
    #[allow(clippy::missing_errors_doc)]
    fn history(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Vec<ServiceStatusHistory>, WorkflowError>;

    #[allow(clippy::missing_errors_doc)]
    fn last_history(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Option<ServiceStatusHistory>, WorkflowError>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_request(&self, request: &ServiceRequest) -> Result<(), WorkflowError>;

    #[allow(clippy::missing_errors_doc)]
    fn get_request(
        &self,
        firm_id: FirmId,
        request_id: RequestId,
    ) -> Result<Option<ServiceRequest>, WorkflowError>;

    #[allow(clippy::missing_errors_doc)]
    fn list_requests(&self, firm_id: FirmId) -> Result<Vec<ServiceRequest>, WorkflowError>;

    /// Apply one request-machine plan atomically, including the converted
    /// service and its creation audit record when present. Same guard
    /// semantics as [`WorkflowStore::apply_transition`].
    #[allow(clippy::missing_errors_doc)]
    fn apply_request_transition(&self, plan: &RequestTransitionPlan) -> Result<(), WorkflowError>;
}

// Every method takes `&self`, so a shared reference is itself a store. This
// lets several engine instances drive one store concurrently.
impl<S: WorkflowStore + ?Sized> WorkflowStore for &S {
    fn migrate(&self) -> Result<(), WorkflowError> {
        (**self).migrate()
    }

    fn insert_service(
        &self,
        service: &Service,
        creation_history: &ServiceStatusHistory,
    ) -> Result<(), WorkflowError> {
        (**self).insert_service(service, creation_history)
    }

    fn get_service(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Option<Service>, WorkflowError> {
        (**self).get_service(firm_id, service_id)
    }

    fn list_services(&self, firm_id: FirmId) -> Result<Vec<Service>, WorkflowError> {
        (**self).list_services(firm_id)
    }

    fn apply_transition(&self, plan: &TransitionPlan) -> Result<(), WorkflowError> {
        (**self).apply_transition(plan)
    }

    fn active_assignment(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Option<ServiceAssignment>, WorkflowError> {
        (**self).active_assignment(firm_id, service_id)
    }

    fn get_assignment(
        &self,
        firm_id: FirmId,
        assignment_id: AssignmentId,
    ) -> Result<Option<ServiceAssignment>, WorkflowError> {
        (**self).get_assignment(firm_id, assignment_id)
    }

    fn list_assignments(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Vec<ServiceAssignment>, WorkflowError> {
        (**self).list_assignments(firm_id, service_id)
    }

    fn history(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Vec<ServiceStatusHistory>, WorkflowError> {
        (**self).history(firm_id, service_id)
    }

    fn last_history(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Option<ServiceStatusHistory>, WorkflowError> {
        (**self).last_history(firm_id, service_id)
    }

    fn insert_request(&self, request: &ServiceRequest) -> Result<(), WorkflowError> {
        (**self).insert_request(request)
    }

    fn get_request(
        &self,
        firm_id: FirmId,
        request_id: RequestId,
    ) -> Result<Option<ServiceRequest>, WorkflowError> {
        (**self).get_request(firm_id, request_id)
    }

    fn list_requests(&self, firm_id: FirmId) -> Result<Vec<ServiceRequest>, WorkflowError> {
        (**self).list_requests(firm_id)
    }

    fn apply_request_transition(&self, plan: &RequestTransitionPlan) -> Result<(), WorkflowError> {
        (**self).apply_request_transition(plan)
    }
}

#![forbid(unsafe_code)]

//! Service lifecycle engine: role-gated status transitions, the assignment
//! ledger, the request-to-service converter, and audit-chain verification.
//!
//! Every accepted operation is computed as a plan and handed to the store
//! for atomic application; a concurrent writer that commits first makes the
//! plan fail with [`WorkflowError::Conflict`] and nothing is written.

use serde::Serialize;
use serde_json::{json, Map, Value};
use serviceflow_domain::{
    compute_history_hash, find_rule, is_valid_edge, now_utc, ActionGate, ActionInput, Actor,
    ActorRole, AssigneeKind, AssigneeRef, AssignmentChange, AssignmentId, AssignmentKind,
    AssignmentStatus, ClientId, DateTimeUtc, FirmId, HistoryId, NewServiceRecord, RequestId,
    RequestStatus, RequestTransitionPlan, Service, ServiceAssignment, ServiceId, ServiceOrigin,
    ServiceRequest, ServiceStatus, ServiceStatusHistory, ServiceType, TransitionPlan, Urgency,
    WorkflowAction, WorkflowError,
};
use serviceflow_store_core::WorkflowStore;

mod memory;

pub use memory::MemoryWorkflowStore;

/// Time source injected into the engine so tests can pin timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTimeUtc;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTimeUtc {
        now_utc()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTimeUtc);

impl Clock for FixedClock {
    fn now(&self) -> DateTimeUtc {
        self.0
    }
}

/// What one accepted transition produced: the service after the write, the
/// audit record that was appended, and the assignment created by
/// assign/delegate/reassign/take-back when applicable.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub service: Service,
    pub history: ServiceStatusHistory,
    pub assignment: Option<ServiceAssignment>,
}

/// Input for creating a service directly (firm-created, recurring, or
/// compliance-triggered origins). Client-request services are created by
/// [`TransitionEngine::approve_request`] instead.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDraft {
    pub firm_id: FirmId,
    pub client_id: ClientId,
    pub service_type: ServiceType,
    pub origin: ServiceOrigin,
    pub due_at: Option<DateTimeUtc>,
    pub fee_minor: Option<i64>,
    pub notes: String,
}

/// Input for a client filing a service request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDraft {
    pub firm_id: FirmId,
    pub client_id: ClientId,
    pub service_type: ServiceType,
    pub title: String,
    pub description: String,
    pub urgency: Urgency,
    pub preferred_due_at: Option<DateTimeUtc>,
    pub attachments: Vec<String>,
}

/// Result of recomputing a service's audit chain.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HistoryReport {
    pub records: usize,
    pub replayed_status: Option<ServiceStatus>,
    pub issues: Vec<String>,
}

impl HistoryReport {
    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Recompute the hash chain and replay status continuity over one service's
/// audit trail, in append order. Every defect is reported with the index of
/// the offending record; the replayed status is the last `to_status` seen.
#[must_use]
pub fn verify_history(records: &[ServiceStatusHistory]) -> HistoryReport {
    let mut issues = Vec::new();
    let mut prev: Option<&ServiceStatusHistory> = None;

    for (idx, record) in records.iter().enumerate() {
        match compute_history_hash(record) {
            Ok(expected) if expected == record.record_hash => {}
            Ok(_) => issues.push(format!("record {idx}: stored hash does not match contents")),
            Err(err) => issues.push(format!("record {idx}: {err}")),
        }

        if let Some(previous) = prev {
            if record.prev_record_hash.as_deref() != Some(previous.record_hash.as_str()) {
                issues.push(format!("record {idx}: chain link to record {} is broken", idx - 1));
            }
            if record.from_status != Some(previous.to_status) {
                issues.push(format!(
                    "record {idx}: from_status does not continue record {}",
                    idx - 1
                ));
            }
        } else {
            if record.prev_record_hash.is_some() {
                issues.push(format!("record {idx}: creation record links to a predecessor"));
            }
            if record.from_status.is_some() {
                issues.push(format!("record {idx}: creation record has a from_status"));
            }
        }

        if !is_valid_edge(record.from_status, record.to_status) {
            let from = record
                .from_status
                .map_or_else(|| "(none)".to_string(), |status| status.to_string());
            issues.push(format!(
                "record {idx}: edge {from} -> {} is not producible",
                record.to_status
            ));
        }

        prev = Some(record);
    }

    HistoryReport {
        records: records.len(),
        replayed_status: records.last().map(|record| record.to_status),
        issues,
    }
}

/// The lifecycle engine. One instance per store handle; all operations are
/// synchronous and serialize against concurrent writers through the store's
/// version compare-and-set.
pub struct TransitionEngine<S, C = SystemClock> {
    store: S,
    clock: C,
}

impl<S: WorkflowStore> TransitionEngine<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: SystemClock,
        }
    }
}

impl<S: WorkflowStore, C: Clock> TransitionEngine<S, C> {
    pub fn with_clock(store: S, clock: C) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create a service with a firm-side origin, together with its creation
    /// audit record.
    ///
    /// # Errors
    /// Rejects non-manager actors and the `client_request` origin, which is
    /// reserved for request approval.
    pub fn create_service(
        &self,
        draft: &ServiceDraft,
        actor: &Actor,
    ) -> Result<Service, WorkflowError> {
        require_assignment_manager(actor)?;
        if draft.origin == ServiceOrigin::ClientRequest {
            return Err(WorkflowError::InvariantViolation(
                "client_request services are created by approving a request".to_string(),
            ));
        }

        let now = self.clock.now();
        let service = Service {
            service_id: ServiceId::new(),
            firm_id: draft.firm_id,
            client_id: draft.client_id,
            service_type: draft.service_type,
            status: ServiceStatus::Pending,
            origin: draft.origin,
            due_at: draft.due_at,
            completed_at: None,
            fee_minor: draft.fee_minor,
            notes: draft.notes.clone(),
            service_request_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        let creation = creation_record(&service, actor, Value::Object(Map::new()), now)?;
        self.store.insert_service(&service, &creation)?;
        Ok(service)
    }

    /// Attempt one workflow action against a service. The transition table
    /// is the single source of truth; `record-invoice` is not in the table
    /// and must go through [`Self::record_invoice_issued`].
    ///
    /// # Errors
    /// `InvalidAction` for edges the table does not allow, `Unauthorized`
    /// when the actor fails the rule's gate, `MissingInput` for a missing
    /// required note or assignee, `Conflict` when a concurrent transition
    /// committed first. Rejections write nothing.
    pub fn attempt(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
        actor: &Actor,
        action: WorkflowAction,
        input: &ActionInput,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let service = self.load_service(firm_id, service_id)?;
        if action == WorkflowAction::RecordInvoice {
            return Err(WorkflowError::InvalidAction {
                status: service.status,
                action,
            });
        }
        let rule = find_rule(service.status, action).ok_or(WorkflowError::InvalidAction {
            status: service.status,
            action,
        })?;
        let active = self.store.active_assignment(firm_id, service_id)?;
        check_gate(rule.gate, actor, active.as_ref())?;
        if rule.requires_note && !input.has_note() {
            return Err(WorkflowError::MissingInput {
                action,
                field: "note",
            });
        }

        let now = self.clock.now();
        let mut changes = Vec::new();
        let mut metadata = Map::new();
        let mut created = None;

        match action {
            WorkflowAction::Assign => {
                let target = input.assignee.clone().ok_or(WorkflowError::MissingInput {
                    action,
                    field: "assignee",
                })?;
                if active.is_some() {
                    return Err(WorkflowError::InvariantViolation(
                        "service already has an active assignment".to_string(),
                    ));
                }
                let assignment = new_assignment(
                    &service,
                    &target,
                    actor,
                    AssignmentKind::Initial,
                    0,
                    None,
                    input.note.clone(),
                    now,
                );
                metadata.insert("assignment_id".to_string(), json!(assignment.assignment_id));
                changes.push(AssignmentChange::Insert(assignment.clone()));
                created = Some(assignment);
            }
            WorkflowAction::Delegate => {
                let target = input.assignee.clone().ok_or(WorkflowError::MissingInput {
                    action,
                    field: "assignee",
                })?;
                let Some(current) = active else {
                    return Err(WorkflowError::Unauthorized {
                        reason: "service has no active assignment".to_string(),
                    });
                };
                changes.push(AssignmentChange::SetStatus {
                    assignment_id: current.assignment_id,
                    status: AssignmentStatus::Delegated,
                    revoked_by: None,
                    revoke_reason: None,
                    updated_at: now,
                });
                let assignment = new_assignment(
                    &service,
                    &target,
                    actor,
                    AssignmentKind::Delegation,
                    current.delegation_level + 1,
                    Some(current.assignment_id),
                    input.note.clone(),
                    now,
                );
                metadata.insert(
                    "superseded_assignment_id".to_string(),
                    json!(current.assignment_id),
                );
                metadata.insert("assignment_id".to_string(), json!(assignment.assignment_id));
                changes.push(AssignmentChange::Insert(assignment.clone()));
                created = Some(assignment);
            }
            WorkflowAction::MarkComplete | WorkflowAction::Approve => {
                if let Some(current) = &active {
                    changes.push(AssignmentChange::SetStatus {
                        assignment_id: current.assignment_id,
                        status: AssignmentStatus::Completed,
                        revoked_by: None,
                        revoke_reason: None,
                        updated_at: now,
                    });
                }
            }
            WorkflowAction::Cancel => {
                if let Some(current) = &active {
                    changes.push(AssignmentChange::SetStatus {
                        assignment_id: current.assignment_id,
                        status: AssignmentStatus::Revoked,
                        revoked_by: Some(actor.actor_id.clone()),
                        revoke_reason: input.note.clone(),
                        updated_at: now,
                    });
                }
            }
            _ => {}
        }

        let set_completed_at = (rule.to == ServiceStatus::Completed
            && service.completed_at.is_none())
        .then_some(now);

        self.commit_transition(
            &service,
            rule.to,
            action.as_str(),
            actor,
            input.note.clone(),
            Value::Object(metadata),
            set_completed_at,
            changes,
            created,
            now,
        )
    }

    /// Record the externally-driven billing event: DELIVERED -> INVOICED.
    ///
    /// # Errors
    /// `InvalidAction` unless the service is DELIVERED; assignment-manager
    /// gate; `Conflict` on a concurrent write.
    pub fn record_invoice_issued(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
        actor: &Actor,
        reference: Option<&str>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let service = self.load_service(firm_id, service_id)?;
        if service.status != ServiceStatus::Delivered {
            return Err(WorkflowError::InvalidAction {
                status: service.status,
                action: WorkflowAction::RecordInvoice,
            });
        }
        require_assignment_manager(actor)?;

        let now = self.clock.now();
        let mut metadata = Map::new();
        if let Some(reference) = reference {
            metadata.insert("invoice_reference".to_string(), json!(reference));
        }

        self.commit_transition(
            &service,
            ServiceStatus::Invoiced,
            WorkflowAction::RecordInvoice.as_str(),
            actor,
            None,
            Value::Object(metadata),
            None,
            Vec::new(),
            None,
            now,
        )
    }

    /// Revoke an ACTIVE or DELEGATED assignment without changing the service
    /// status. Appends a ledger-only audit record (`from == to`).
    ///
    /// # Errors
    /// Assignment-manager gate; `InvalidAssignmentState` for assignments
    /// that are already settled; the ledger of a terminal service is frozen.
    pub fn revoke_assignment(
        &self,
        firm_id: FirmId,
        assignment_id: AssignmentId,
        actor: &Actor,
        reason: &str,
    ) -> Result<ServiceAssignment, WorkflowError> {
        require_assignment_manager(actor)?;
        let assignment = self.load_assignment(firm_id, assignment_id)?;
        if !matches!(
            assignment.status,
            AssignmentStatus::Active | AssignmentStatus::Delegated
        ) {
            return Err(WorkflowError::InvalidAssignmentState {
                status: assignment.status,
                operation: "revoke",
            });
        }
        let service = self.load_service(firm_id, assignment.service_id)?;
        require_open_ledger(&service)?;

        let now = self.clock.now();
        let mut metadata = Map::new();
        metadata.insert("assignment_id".to_string(), json!(assignment_id));

        self.commit_transition(
            &service,
            service.status,
            "revoke",
            actor,
            Some(reason.to_string()),
            Value::Object(metadata),
            None,
            vec![AssignmentChange::SetStatus {
                assignment_id,
                status: AssignmentStatus::Revoked,
                revoked_by: Some(actor.actor_id.clone()),
                revoke_reason: Some(reason.to_string()),
                updated_at: now,
            }],
            None,
            now,
        )?;
        self.load_assignment(firm_id, assignment_id)
    }

    /// Replace the active assignee: the current ACTIVE record is REVOKED and
    /// a new ACTIVE one is inserted with kind `re_assignment` and the next
    /// delegation level.
    ///
    /// # Errors
    /// Assignment-manager gate; `NotFound` when the service has no active
    /// assignment; `Conflict` on a concurrent write.
    pub fn reassign(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
        actor: &Actor,
        to: &AssigneeRef,
        reason: Option<&str>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        require_assignment_manager(actor)?;
        let service = self.load_service(firm_id, service_id)?;
        require_open_ledger(&service)?;
        let current = self.require_active(firm_id, service_id)?;

        let now = self.clock.now();
        let reason = reason.map(ToString::to_string);
        let assignment = new_assignment(
            &service,
            to,
            actor,
            AssignmentKind::Reassignment,
            current.delegation_level + 1,
            Some(current.assignment_id),
            reason.clone(),
            now,
        );
        let mut metadata = Map::new();
        metadata.insert(
            "superseded_assignment_id".to_string(),
            json!(current.assignment_id),
        );
        metadata.insert("assignment_id".to_string(), json!(assignment.assignment_id));

        self.commit_transition(
            &service,
            service.status,
            "reassign",
            actor,
            reason.clone(),
            Value::Object(metadata),
            None,
            vec![
                AssignmentChange::SetStatus {
                    assignment_id: current.assignment_id,
                    status: AssignmentStatus::Revoked,
                    revoked_by: Some(actor.actor_id.clone()),
                    revoke_reason: reason,
                    updated_at: now,
                },
                AssignmentChange::Insert(assignment.clone()),
            ],
            Some(assignment),
            now,
        )
    }

    /// A prior holder in the delegation chain reclaims the service: the
    /// current ACTIVE record is REVOKED and a new ACTIVE one is inserted
    /// with kind `take_back` and the next delegation level.
    ///
    /// # Errors
    /// `Unauthorized` unless the actor appears earlier in the chain.
    pub fn take_back(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
        actor: &Actor,
        reason: Option<&str>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let service = self.load_service(firm_id, service_id)?;
        require_open_ledger(&service)?;
        let current = self.require_active(firm_id, service_id)?;

        let chain = self.delegation_chain(firm_id, current.assignment_id)?;
        let held_before = chain
            .iter()
            .take(chain.len().saturating_sub(1))
            .any(|link| link.assignee_id == actor.actor_id);
        if !held_before {
            return Err(WorkflowError::Unauthorized {
                reason: "actor has not previously held this service".to_string(),
            });
        }

        let now = self.clock.now();
        let reason = reason.map(ToString::to_string);
        let target = AssigneeRef {
            assignee_id: actor.actor_id.clone(),
            kind: AssigneeKind::Employee,
        };
        let assignment = new_assignment(
            &service,
            &target,
            actor,
            AssignmentKind::TakeBack,
            current.delegation_level + 1,
            Some(current.assignment_id),
            reason.clone(),
            now,
        );
        let mut metadata = Map::new();
        metadata.insert(
            "superseded_assignment_id".to_string(),
            json!(current.assignment_id),
        );
        metadata.insert("assignment_id".to_string(), json!(assignment.assignment_id));

        self.commit_transition(
            &service,
            service.status,
            "take-back",
            actor,
            reason.clone(),
            Value::Object(metadata),
            None,
            vec![
                AssignmentChange::SetStatus {
                    assignment_id: current.assignment_id,
                    status: AssignmentStatus::Revoked,
                    revoked_by: Some(actor.actor_id.clone()),
                    revoke_reason: reason,
                    updated_at: now,
                },
                AssignmentChange::Insert(assignment.clone()),
            ],
            Some(assignment),
            now,
        )
    }

    /// Walk an assignment's provenance back-pointers to the root. Returned
    /// root-first; delegation levels strictly decrease toward the root, so a
    /// chain that fails to terminate is a ledger corruption.
    ///
    /// # Errors
    /// `NotFound` for a dangling back-pointer, `InvariantViolation` for a
    /// non-monotone or non-terminating chain.
    pub fn delegation_chain(
        &self,
        firm_id: FirmId,
        assignment_id: AssignmentId,
    ) -> Result<Vec<ServiceAssignment>, WorkflowError> {
        let head = self.load_assignment(firm_id, assignment_id)?;
        let mut chain = vec![head];
        while let Some(prev_id) = chain
            .last()
            .and_then(|link| link.previous_assignment_id)
        {
            let tail_level = chain
                .last()
                .map_or(0, |link| link.delegation_level);
            let prev = self.load_assignment(firm_id, prev_id)?;
            if prev.delegation_level >= tail_level {
                return Err(WorkflowError::InvariantViolation(format!(
                    "assignment chain of {assignment_id} does not decrease toward the root"
                )));
            }
            chain.push(prev);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Client files a service request; it starts PENDING.
    ///
    /// # Errors
    /// Storage faults only; any role may file (staff file on behalf of
    /// clients, ownership resolution is the caller's concern).
    pub fn submit_request(
        &self,
        draft: &RequestDraft,
        _actor: &Actor,
    ) -> Result<ServiceRequest, WorkflowError> {
        let now = self.clock.now();
        let request = ServiceRequest {
            request_id: RequestId::new(),
            firm_id: draft.firm_id,
            client_id: draft.client_id,
            service_type: draft.service_type,
            title: draft.title.clone(),
            description: draft.description.clone(),
            urgency: draft.urgency,
            preferred_due_at: draft.preferred_due_at,
            status: RequestStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
            decision_note: None,
            quoted_fee_minor: None,
            attachments: draft.attachments.clone(),
            converted_service_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_request(&request)?;
        Ok(request)
    }

    /// PENDING -> `UNDER_REVIEW`, stamping the reviewer.
    ///
    /// # Errors
    /// Assignment-manager gate; `InvalidRequestState` outside PENDING.
    pub fn open_review(
        &self,
        firm_id: FirmId,
        request_id: RequestId,
        reviewer: &Actor,
    ) -> Result<ServiceRequest, WorkflowError> {
        require_assignment_manager(reviewer)?;
        let request = self.load_request(firm_id, request_id)?;
        if request.status != RequestStatus::Pending {
            return Err(WorkflowError::InvalidRequestState {
                status: request.status,
                operation: "open-review",
            });
        }

        let now = self.clock.now();
        self.store.apply_request_transition(&RequestTransitionPlan {
            firm_id,
            request_id,
            expected_version: request.version,
            from_status: request.status,
            to_status: RequestStatus::UnderReview,
            reviewed_by: Some(reviewer.actor_id.clone()),
            reviewed_at: Some(now),
            decision_note: None,
            quoted_fee_minor: None,
            converted_service_id: None,
            new_service: None,
            updated_at: now,
        })?;
        self.load_request(firm_id, request_id)
    }

    /// Approve a request under review: the request becomes CONVERTED and the
    /// linked Service (PENDING, origin `client_request`) is inserted with its
    /// creation audit record, all in one store transaction.
    ///
    /// # Errors
    /// Assignment-manager gate; `InvalidRequestState` outside `UNDER_REVIEW`;
    /// `Conflict` when a concurrent reviewer committed first, in which case
    /// no service is created.
    pub fn approve_request(
        &self,
        firm_id: FirmId,
        request_id: RequestId,
        reviewer: &Actor,
        quoted_fee_minor: Option<i64>,
        note: Option<&str>,
    ) -> Result<(ServiceRequest, Service), WorkflowError> {
        require_assignment_manager(reviewer)?;
        let request = self.load_request(firm_id, request_id)?;
        if request.status != RequestStatus::UnderReview {
            return Err(WorkflowError::InvalidRequestState {
                status: request.status,
                operation: "approve",
            });
        }

        let now = self.clock.now();
        let service = Service {
            service_id: ServiceId::new(),
            firm_id,
            client_id: request.client_id,
            service_type: request.service_type,
            status: ServiceStatus::Pending,
            origin: ServiceOrigin::ClientRequest,
            due_at: request.preferred_due_at,
            completed_at: None,
            fee_minor: quoted_fee_minor.or(request.quoted_fee_minor),
            notes: request.title.clone(),
            service_request_id: Some(request_id),
            version: 0,
            created_at: now,
            updated_at: now,
        };
        let mut metadata = Map::new();
        metadata.insert("request_id".to_string(), json!(request_id));
        let creation = creation_record(&service, reviewer, Value::Object(metadata), now)?;

        self.store.apply_request_transition(&RequestTransitionPlan {
            firm_id,
            request_id,
            expected_version: request.version,
            from_status: request.status,
            to_status: RequestStatus::Converted,
            reviewed_by: Some(reviewer.actor_id.clone()),
            reviewed_at: Some(now),
            decision_note: note.map(ToString::to_string),
            quoted_fee_minor,
            converted_service_id: Some(service.service_id),
            new_service: Some(NewServiceRecord {
                service: service.clone(),
                creation_history: creation,
            }),
            updated_at: now,
        })?;

        let request = self.load_request(firm_id, request_id)?;
        let service = self.load_service(firm_id, service.service_id)?;
        Ok((request, service))
    }

    /// `UNDER_REVIEW` -> REJECTED with a mandatory decision note.
    ///
    /// # Errors
    /// Assignment-manager gate; `InvalidRequestState` outside `UNDER_REVIEW`.
    pub fn reject_request(
        &self,
        firm_id: FirmId,
        request_id: RequestId,
        reviewer: &Actor,
        note: &str,
    ) -> Result<ServiceRequest, WorkflowError> {
        require_assignment_manager(reviewer)?;
        let request = self.load_request(firm_id, request_id)?;
        if request.status != RequestStatus::UnderReview {
            return Err(WorkflowError::InvalidRequestState {
                status: request.status,
                operation: "reject",
            });
        }

        let now = self.clock.now();
        self.store.apply_request_transition(&RequestTransitionPlan {
            firm_id,
            request_id,
            expected_version: request.version,
            from_status: request.status,
            to_status: RequestStatus::Rejected,
            reviewed_by: Some(reviewer.actor_id.clone()),
            reviewed_at: Some(now),
            decision_note: Some(note.to_string()),
            quoted_fee_minor: None,
            converted_service_id: None,
            new_service: None,
            updated_at: now,
        })?;
        self.load_request(firm_id, request_id)
    }

    /// Withdraw a request that has not been decided yet.
    ///
    /// # Errors
    /// `InvalidRequestState` once the request is decided or converted.
    pub fn cancel_request(
        &self,
        firm_id: FirmId,
        request_id: RequestId,
        _actor: &Actor,
    ) -> Result<ServiceRequest, WorkflowError> {
        let request = self.load_request(firm_id, request_id)?;
        if !matches!(
            request.status,
            RequestStatus::Pending | RequestStatus::UnderReview
        ) {
            return Err(WorkflowError::InvalidRequestState {
                status: request.status,
                operation: "cancel",
            });
        }

        let now = self.clock.now();
        self.store.apply_request_transition(&RequestTransitionPlan {
            firm_id,
            request_id,
            expected_version: request.version,
            from_status: request.status,
            to_status: RequestStatus::Cancelled,
            reviewed_by: None,
            reviewed_at: None,
            decision_note: None,
            quoted_fee_minor: None,
            converted_service_id: None,
            new_service: None,
            updated_at: now,
        })?;
        self.load_request(firm_id, request_id)
    }

    fn load_service(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Service, WorkflowError> {
        self.store
            .get_service(firm_id, service_id)?
            .ok_or(WorkflowError::NotFound {
                entity: "service",
                id: service_id.to_string(),
            })
    }

    fn load_assignment(
        &self,
        firm_id: FirmId,
        assignment_id: AssignmentId,
    ) -> Result<ServiceAssignment, WorkflowError> {
        self.store
            .get_assignment(firm_id, assignment_id)?
            .ok_or(WorkflowError::NotFound {
                entity: "assignment",
                id: assignment_id.to_string(),
            })
    }

    fn require_active(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<ServiceAssignment, WorkflowError> {
        self.store
            .active_assignment(firm_id, service_id)?
            .ok_or(WorkflowError::NotFound {
                entity: "active assignment",
                id: service_id.to_string(),
            })
    }

    fn load_request(
        &self,
        firm_id: FirmId,
        request_id: RequestId,
    ) -> Result<ServiceRequest, WorkflowError> {
        self.store
            .get_request(firm_id, request_id)?
            .ok_or(WorkflowError::NotFound {
                entity: "service_request",
                id: request_id.to_string(),
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_transition(
        &self,
        service: &Service,
        to_status: ServiceStatus,
        action: &str,
        actor: &Actor,
        note: Option<String>,
        metadata: Value,
        set_completed_at: Option<DateTimeUtc>,
        assignment_changes: Vec<AssignmentChange>,
        created: Option<ServiceAssignment>,
        now: DateTimeUtc,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let prev = self
            .store
            .last_history(service.firm_id, service.service_id)?
            .map(|record| record.record_hash);
        let mut history = ServiceStatusHistory {
            history_id: HistoryId::new(),
            firm_id: service.firm_id,
            service_id: service.service_id,
            from_status: Some(service.status),
            to_status,
            action: action.to_string(),
            actor_id: actor.actor_id.clone(),
            actor_role: actor.role,
            note,
            metadata,
            recorded_at: now,
            prev_record_hash: prev,
            record_hash: String::new(),
        };
        history.record_hash = compute_history_hash(&history)?;

        self.store.apply_transition(&TransitionPlan {
            firm_id: service.firm_id,
            service_id: service.service_id,
            expected_version: service.version,
            from_status: service.status,
            to_status,
            set_completed_at,
            assignment_changes,
            history: history.clone(),
            updated_at: now,
        })?;

        let service = self.load_service(service.firm_id, service.service_id)?;
        Ok(TransitionOutcome {
            service,
            history,
            assignment: created,
        })
    }
}

fn require_assignment_manager(actor: &Actor) -> Result<(), WorkflowError> {
    if actor.role.is_assignment_manager() {
        Ok(())
    } else {
        Err(WorkflowError::Unauthorized {
            reason: format!("role {} is not assignment-manager tier", actor.role),
        })
    }
}

// Ledger-only events record `from == to`, which the audit edge check rejects
// for terminal statuses; the ledger of a closed or cancelled service is
// immutable along with everything else about it.
fn require_open_ledger(service: &Service) -> Result<(), WorkflowError> {
    if service.status.is_terminal() {
        return Err(WorkflowError::InvariantViolation(format!(
            "service {} is {}; its ledger is frozen",
            service.service_id, service.status
        )));
    }
    Ok(())
}

fn check_gate(
    gate: ActionGate,
    actor: &Actor,
    active: Option<&ServiceAssignment>,
) -> Result<(), WorkflowError> {
    let is_assignee = active.is_some_and(|assignment| assignment.assignee_id == actor.actor_id);
    let allowed = match gate {
        ActionGate::AssignmentManager => actor.role.is_assignment_manager(),
        ActionGate::Assignee => is_assignee,
        ActionGate::AssigneeOrAdmin => is_assignee || actor.role == ActorRole::Admin,
        ActionGate::AssigneeWorkerTier => is_assignee && actor.role.is_worker_tier(),
    };
    if allowed {
        Ok(())
    } else {
        Err(WorkflowError::Unauthorized {
            reason: match gate {
                ActionGate::AssignmentManager => {
                    format!("role {} is not assignment-manager tier", actor.role)
                }
                ActionGate::Assignee => "only the active assignee may do this".to_string(),
                ActionGate::AssigneeOrAdmin => {
                    "only the active assignee or an admin may do this".to_string()
                }
                ActionGate::AssigneeWorkerTier => {
                    "only a worker-tier active assignee may do this".to_string()
                }
            },
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn new_assignment(
    service: &Service,
    target: &AssigneeRef,
    actor: &Actor,
    kind: AssignmentKind,
    delegation_level: u32,
    previous_assignment_id: Option<AssignmentId>,
    reason: Option<String>,
    now: DateTimeUtc,
) -> ServiceAssignment {
    ServiceAssignment {
        assignment_id: AssignmentId::new(),
        firm_id: service.firm_id,
        service_id: service.service_id,
        assignee_id: target.assignee_id.clone(),
        assignee_kind: target.kind,
        assigned_by: actor.actor_id.clone(),
        delegation_level,
        previous_assignment_id,
        kind,
        status: AssignmentStatus::Active,
        reason,
        revoked_by: None,
        revoke_reason: None,
        created_at: now,
        updated_at: now,
    }
}

fn creation_record(
    service: &Service,
    actor: &Actor,
    metadata: Value,
    now: DateTimeUtc,
) -> Result<ServiceStatusHistory, WorkflowError> {
    let mut record = ServiceStatusHistory {
        history_id: HistoryId::new(),
        firm_id: service.firm_id,
        service_id: service.service_id,
        from_status: None,
        to_status: ServiceStatus::Pending,
        action: "create".to_string(),
        actor_id: actor.actor_id.clone(),
        actor_role: actor.role,
        note: None,
        metadata,
        recorded_at: now,
        prev_record_hash: None,
        record_hash: String::new(),
    };
    record.record_hash = compute_history_hash(&record)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::{
        verify_history, FixedClock, MemoryWorkflowStore, RequestDraft, ServiceDraft,
        TransitionEngine,
    };
    use serviceflow_domain::{
        ActionInput, Actor, ActorRole, AssigneeKind, AssigneeRef, AssignmentKind,
        AssignmentStatus, ClientId, ErrorKind, FirmId, RequestStatus, ServiceOrigin,
        ServiceStatus, ServiceType, Urgency, WorkflowAction, WorkflowError,
    };
    use serviceflow_store_core::WorkflowStore;

    fn actor(id: &str, role: ActorRole) -> Actor {
        Actor {
            actor_id: id.to_string(),
            role,
        }
    }

    fn employee(id: &str) -> AssigneeRef {
        AssigneeRef {
            assignee_id: id.to_string(),
            kind: AssigneeKind::Employee,
        }
    }

    fn assign_input(id: &str) -> ActionInput {
        ActionInput {
            note: None,
            assignee: Some(employee(id)),
        }
    }

    fn engine() -> TransitionEngine<MemoryWorkflowStore> {
        TransitionEngine::new(MemoryWorkflowStore::new())
    }

    fn draft(firm_id: FirmId) -> ServiceDraft {
        ServiceDraft {
            firm_id,
            client_id: ClientId::new(),
            service_type: ServiceType::Bookkeeping,
            origin: ServiceOrigin::FirmCreated,
            due_at: None,
            fee_minor: Some(120_000),
            notes: "quarterly books".to_string(),
        }
    }

    fn request_draft(firm_id: FirmId) -> RequestDraft {
        RequestDraft {
            firm_id,
            client_id: ClientId::new(),
            service_type: ServiceType::TaxFiling,
            title: "FY25 tax filing".to_string(),
            description: "annual return".to_string(),
            urgency: Urgency::High,
            preferred_due_at: None,
            attachments: vec!["balance-sheet.pdf".to_string()],
        }
    }

    #[test]
    fn full_lifecycle_reaches_closed_with_an_intact_chain() {
        let engine = engine();
        let firm_id = FirmId::new();
        let partner = actor("partner-1", ActorRole::Partner);
        let manager = actor("manager-1", ActorRole::Manager);
        let staff = actor("staff-1", ActorRole::Staff);
        let client = actor("client-1", ActorRole::Client);

        let request = engine
            .submit_request(&request_draft(firm_id), &client)
            .unwrap_or_else(|_| unreachable!());
        engine
            .open_review(firm_id, request.request_id, &partner)
            .unwrap_or_else(|_| unreachable!());
        let (request, service) = engine
            .approve_request(firm_id, request.request_id, &partner, Some(500_000), None)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(request.status, RequestStatus::Converted);
        assert_eq!(request.converted_service_id, Some(service.service_id));
        assert_eq!(service.service_request_id, Some(request.request_id));
        assert_eq!(service.origin, ServiceOrigin::ClientRequest);
        assert_eq!(service.fee_minor, Some(500_000));

        let service_id = service.service_id;
        engine
            .attempt(
                firm_id,
                service_id,
                &partner,
                WorkflowAction::Assign,
                &assign_input("staff-1"),
            )
            .unwrap_or_else(|_| unreachable!());
        engine
            .attempt(
                firm_id,
                service_id,
                &staff,
                WorkflowAction::StartWork,
                &ActionInput::default(),
            )
            .unwrap_or_else(|_| unreachable!());
        engine
            .attempt(
                firm_id,
                service_id,
                &staff,
                WorkflowAction::RequestDocuments,
                &ActionInput::with_note("need bank statements"),
            )
            .unwrap_or_else(|_| unreachable!());
        engine
            .attempt(
                firm_id,
                service_id,
                &staff,
                WorkflowAction::ResumeWork,
                &ActionInput::default(),
            )
            .unwrap_or_else(|_| unreachable!());
        engine
            .attempt(
                firm_id,
                service_id,
                &staff,
                WorkflowAction::SubmitReview,
                &ActionInput::default(),
            )
            .unwrap_or_else(|_| unreachable!());
        let approved = engine
            .attempt(
                firm_id,
                service_id,
                &manager,
                WorkflowAction::Approve,
                &ActionInput::default(),
            )
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(approved.service.status, ServiceStatus::Completed);
        assert!(approved.service.completed_at.is_some());

        // The active assignment settled as COMPLETED on approval.
        let assignments = engine
            .store()
            .list_assignments(firm_id, service_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].status, AssignmentStatus::Completed);

        engine
            .attempt(
                firm_id,
                service_id,
                &manager,
                WorkflowAction::Deliver,
                &ActionInput::default(),
            )
            .unwrap_or_else(|_| unreachable!());
        engine
            .record_invoice_issued(firm_id, service_id, &partner, Some("INV-2026-014"))
            .unwrap_or_else(|_| unreachable!());
        let closed = engine
            .attempt(
                firm_id,
                service_id,
                &partner,
                WorkflowAction::Close,
                &ActionInput::default(),
            )
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(closed.service.status, ServiceStatus::Closed);

        let history = engine
            .store()
            .history(firm_id, service_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(history.len(), 10);
        let report = verify_history(&history);
        assert!(report.is_intact(), "issues: {:?}", report.issues);
        assert_eq!(report.replayed_status, Some(ServiceStatus::Closed));
    }

    #[test]
    fn delegation_builds_a_monotone_chain_with_one_active_holder() {
        let engine = engine();
        let firm_id = FirmId::new();
        let partner = actor("partner-1", ActorRole::Partner);
        let staff1 = actor("staff-1", ActorRole::Staff);
        let senior = actor("senior-1", ActorRole::Senior);

        let service = engine
            .create_service(&draft(firm_id), &partner)
            .unwrap_or_else(|_| unreachable!());
        let service_id = service.service_id;

        engine
            .attempt(
                firm_id,
                service_id,
                &partner,
                WorkflowAction::Assign,
                &assign_input("staff-1"),
            )
            .unwrap_or_else(|_| unreachable!());
        engine
            .attempt(
                firm_id,
                service_id,
                &staff1,
                WorkflowAction::StartWork,
                &ActionInput::default(),
            )
            .unwrap_or_else(|_| unreachable!());
        let first = engine
            .attempt(
                firm_id,
                service_id,
                &staff1,
                WorkflowAction::Delegate,
                &assign_input("senior-1"),
            )
            .unwrap_or_else(|_| unreachable!());
        // Delegation is ledger-only: the status does not move.
        assert_eq!(first.service.status, ServiceStatus::InProgress);
        let second = engine
            .attempt(
                firm_id,
                service_id,
                &senior,
                WorkflowAction::Delegate,
                &assign_input("staff-2"),
            )
            .unwrap_or_else(|_| unreachable!());

        let active = engine
            .store()
            .active_assignment(firm_id, service_id)
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(active.assignee_id, "staff-2");
        assert_eq!(active.delegation_level, 2);
        assert_eq!(active.kind, AssignmentKind::Delegation);

        let assignments = engine
            .store()
            .list_assignments(firm_id, service_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(assignments.len(), 3);
        let active_count = assignments
            .iter()
            .filter(|a| a.status == AssignmentStatus::Active)
            .count();
        assert_eq!(active_count, 1);

        assert_eq!(
            second.assignment.as_ref().map(|a| a.delegation_level),
            Some(2)
        );
        let chain = engine
            .delegation_chain(firm_id, active.assignment_id)
            .unwrap_or_else(|_| unreachable!());
        let levels: Vec<u32> = chain.iter().map(|a| a.delegation_level).collect();
        assert_eq!(levels, vec![0, 1, 2]);
        assert_eq!(chain[0].assignee_id, "staff-1");
        assert_eq!(chain[2].assignment_id, active.assignment_id);

        let history = engine
            .store()
            .history(firm_id, service_id)
            .unwrap_or_else(|_| unreachable!());
        let delegates: Vec<_> = history
            .iter()
            .filter(|record| record.action == "delegate")
            .collect();
        assert_eq!(delegates.len(), 2);
        assert!(delegates
            .iter()
            .all(|record| record.from_status == Some(record.to_status)));
    }

    #[test]
    fn rejections_have_zero_side_effects() {
        let engine = engine();
        let firm_id = FirmId::new();
        let partner = actor("partner-1", ActorRole::Partner);
        let staff = actor("staff-1", ActorRole::Staff);

        let service = engine
            .create_service(&draft(firm_id), &partner)
            .unwrap_or_else(|_| unreachable!());
        let service_id = service.service_id;

        // Staff cannot assign.
        let denied = engine.attempt(
            firm_id,
            service_id,
            &staff,
            WorkflowAction::Assign,
            &assign_input("staff-1"),
        );
        assert!(matches!(denied, Err(WorkflowError::Unauthorized { .. })));

        // Cancel requires a note.
        let missing = engine.attempt(
            firm_id,
            service_id,
            &partner,
            WorkflowAction::Cancel,
            &ActionInput::default(),
        );
        assert!(matches!(missing, Err(WorkflowError::MissingInput { .. })));

        // Deliver is not an edge out of PENDING.
        let invalid = engine.attempt(
            firm_id,
            service_id,
            &partner,
            WorkflowAction::Deliver,
            &ActionInput::default(),
        );
        assert!(matches!(invalid, Err(WorkflowError::InvalidAction { .. })));

        // record-invoice never goes through the table.
        let invoice = engine.attempt(
            firm_id,
            service_id,
            &partner,
            WorkflowAction::RecordInvoice,
            &ActionInput::default(),
        );
        assert!(matches!(invoice, Err(WorkflowError::InvalidAction { .. })));

        let reloaded = engine
            .store()
            .get_service(firm_id, service_id)
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(reloaded.status, ServiceStatus::Pending);
        assert_eq!(reloaded.version, 0);
        let history = engine
            .store()
            .history(firm_id, service_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn concurrent_assigns_resolve_to_exactly_one_winner() {
        let store = MemoryWorkflowStore::new();
        let firm_id = FirmId::new();
        let partner = actor("partner-1", ActorRole::Partner);
        let service = TransitionEngine::new(&store)
            .create_service(&draft(firm_id), &partner)
            .unwrap_or_else(|_| unreachable!());
        let service_id = service.service_id;

        let results: Vec<Result<_, WorkflowError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = ["staff-1", "staff-2"]
                .into_iter()
                .map(|assignee| {
                    let store = &store;
                    let partner = partner.clone();
                    scope.spawn(move || {
                        TransitionEngine::new(store).attempt(
                            firm_id,
                            service_id,
                            &partner,
                            WorkflowAction::Assign,
                            &assign_input(assignee),
                        )
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|_| unreachable!()))
                .collect()
        });

        let wins = results.iter().filter(|result| result.is_ok()).count();
        assert_eq!(wins, 1);
        for result in &results {
            if let Err(err) = result {
                assert!(
                    matches!(err.kind(), ErrorKind::Conflict | ErrorKind::InvalidAction),
                    "unexpected loser error: {err}"
                );
            }
        }

        let assignments = store
            .list_assignments(firm_id, service_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(assignments.len(), 1);
        let history = store
            .history(firm_id, service_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(history.len(), 2);
        let report = verify_history(&history);
        assert!(report.is_intact(), "issues: {:?}", report.issues);
    }

    #[test]
    fn double_approval_converts_exactly_once() {
        let store = MemoryWorkflowStore::new();
        let firm_id = FirmId::new();
        let partner = actor("partner-1", ActorRole::Partner);
        let client = actor("client-1", ActorRole::Client);
        let setup = TransitionEngine::new(&store);
        let request = setup
            .submit_request(&request_draft(firm_id), &client)
            .unwrap_or_else(|_| unreachable!());
        setup
            .open_review(firm_id, request.request_id, &partner)
            .unwrap_or_else(|_| unreachable!());
        let request_id = request.request_id;

        let results: Vec<Result<_, WorkflowError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let store = &store;
                    let partner = partner.clone();
                    scope.spawn(move || {
                        TransitionEngine::new(store).approve_request(
                            firm_id,
                            request_id,
                            &partner,
                            Some(300_000),
                            None,
                        )
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|_| unreachable!()))
                .collect()
        });

        let wins = results.iter().filter(|result| result.is_ok()).count();
        assert_eq!(wins, 1);
        for result in &results {
            if let Err(err) = result {
                assert!(
                    matches!(err.kind(), ErrorKind::Conflict | ErrorKind::InvalidAction),
                    "unexpected loser error: {err}"
                );
            }
        }

        let services = store
            .list_services(firm_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(services.len(), 1);
        let request = store
            .get_request(firm_id, request_id)
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(request.status, RequestStatus::Converted);
        assert_eq!(request.converted_service_id, Some(services[0].service_id));
    }

    #[test]
    fn take_back_returns_the_service_to_a_prior_holder() {
        let engine = engine();
        let firm_id = FirmId::new();
        let partner = actor("partner-1", ActorRole::Partner);
        let staff1 = actor("staff-1", ActorRole::Staff);

        let service = engine
            .create_service(&draft(firm_id), &partner)
            .unwrap_or_else(|_| unreachable!());
        let service_id = service.service_id;
        engine
            .attempt(
                firm_id,
                service_id,
                &partner,
                WorkflowAction::Assign,
                &assign_input("staff-1"),
            )
            .unwrap_or_else(|_| unreachable!());
        engine
            .attempt(
                firm_id,
                service_id,
                &staff1,
                WorkflowAction::StartWork,
                &ActionInput::default(),
            )
            .unwrap_or_else(|_| unreachable!());
        engine
            .attempt(
                firm_id,
                service_id,
                &staff1,
                WorkflowAction::Delegate,
                &assign_input("senior-1"),
            )
            .unwrap_or_else(|_| unreachable!());

        // A stranger to the chain cannot take the service back.
        let stranger = actor("staff-9", ActorRole::Staff);
        let denied = engine.take_back(firm_id, service_id, &stranger, None);
        assert!(matches!(denied, Err(WorkflowError::Unauthorized { .. })));

        let outcome = engine
            .take_back(firm_id, service_id, &staff1, Some("workload freed up"))
            .unwrap_or_else(|_| unreachable!());
        let reclaimed = outcome.assignment.unwrap_or_else(|| unreachable!());
        assert_eq!(reclaimed.assignee_id, "staff-1");
        assert_eq!(reclaimed.kind, AssignmentKind::TakeBack);
        assert_eq!(reclaimed.delegation_level, 2);
        assert_eq!(reclaimed.status, AssignmentStatus::Active);

        let assignments = engine
            .store()
            .list_assignments(firm_id, service_id)
            .unwrap_or_else(|_| unreachable!());
        let revoked = assignments
            .iter()
            .find(|a| a.delegation_level == 1)
            .unwrap_or_else(|| unreachable!());
        assert_eq!(revoked.status, AssignmentStatus::Revoked);
        assert_eq!(revoked.revoked_by.as_deref(), Some("staff-1"));
    }

    #[test]
    fn reassign_replaces_the_active_assignee() {
        let engine = engine();
        let firm_id = FirmId::new();
        let manager = actor("manager-1", ActorRole::Manager);

        let service = engine
            .create_service(&draft(firm_id), &manager)
            .unwrap_or_else(|_| unreachable!());
        let service_id = service.service_id;
        engine
            .attempt(
                firm_id,
                service_id,
                &manager,
                WorkflowAction::Assign,
                &assign_input("staff-1"),
            )
            .unwrap_or_else(|_| unreachable!());

        let outcome = engine
            .reassign(
                firm_id,
                service_id,
                &manager,
                &employee("staff-2"),
                Some("staff-1 on leave"),
            )
            .unwrap_or_else(|_| unreachable!());
        let replacement = outcome.assignment.unwrap_or_else(|| unreachable!());
        assert_eq!(replacement.assignee_id, "staff-2");
        assert_eq!(replacement.kind, AssignmentKind::Reassignment);
        assert_eq!(replacement.delegation_level, 1);

        let assignments = engine
            .store()
            .list_assignments(firm_id, service_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments[0].status, AssignmentStatus::Revoked);
        assert_eq!(assignments[0].revoke_reason.as_deref(), Some("staff-1 on leave"));
        // Ledger-only: the status did not move.
        assert_eq!(outcome.service.status, ServiceStatus::Assigned);
    }

    #[test]
    fn revoke_settles_the_assignment_and_rejects_a_second_attempt() {
        let engine = engine();
        let firm_id = FirmId::new();
        let partner = actor("partner-1", ActorRole::Partner);

        let service = engine
            .create_service(&draft(firm_id), &partner)
            .unwrap_or_else(|_| unreachable!());
        let service_id = service.service_id;
        let assigned = engine
            .attempt(
                firm_id,
                service_id,
                &partner,
                WorkflowAction::Assign,
                &assign_input("staff-1"),
            )
            .unwrap_or_else(|_| unreachable!());
        let assignment_id = assigned
            .assignment
            .unwrap_or_else(|| unreachable!())
            .assignment_id;

        let revoked = engine
            .revoke_assignment(firm_id, assignment_id, &partner, "client escalation")
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(revoked.status, AssignmentStatus::Revoked);
        assert_eq!(revoked.revoked_by.as_deref(), Some("partner-1"));
        assert_eq!(revoked.revoke_reason.as_deref(), Some("client escalation"));

        let again = engine.revoke_assignment(firm_id, assignment_id, &partner, "again");
        assert!(matches!(
            again,
            Err(WorkflowError::InvalidAssignmentState { .. })
        ));
    }

    #[test]
    fn cancel_revokes_the_active_assignment() {
        let engine = engine();
        let firm_id = FirmId::new();
        let partner = actor("partner-1", ActorRole::Partner);

        let service = engine
            .create_service(&draft(firm_id), &partner)
            .unwrap_or_else(|_| unreachable!());
        let service_id = service.service_id;
        engine
            .attempt(
                firm_id,
                service_id,
                &partner,
                WorkflowAction::Assign,
                &assign_input("staff-1"),
            )
            .unwrap_or_else(|_| unreachable!());

        let cancelled = engine
            .attempt(
                firm_id,
                service_id,
                &partner,
                WorkflowAction::Cancel,
                &ActionInput::with_note("client withdrew"),
            )
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(cancelled.service.status, ServiceStatus::Cancelled);

        let assignments = engine
            .store()
            .list_assignments(firm_id, service_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(assignments[0].status, AssignmentStatus::Revoked);
        assert_eq!(assignments[0].revoke_reason.as_deref(), Some("client withdrew"));

        // Terminal: nothing moves anymore.
        let frozen = engine.attempt(
            firm_id,
            service_id,
            &partner,
            WorkflowAction::Assign,
            &assign_input("staff-2"),
        );
        assert!(matches!(frozen, Err(WorkflowError::InvalidAction { .. })));
    }

    #[test]
    fn rejected_requests_stay_rejected() {
        let engine = engine();
        let firm_id = FirmId::new();
        let partner = actor("partner-1", ActorRole::Partner);
        let client = actor("client-1", ActorRole::Client);

        let request = engine
            .submit_request(&request_draft(firm_id), &client)
            .unwrap_or_else(|_| unreachable!());
        engine
            .open_review(firm_id, request.request_id, &partner)
            .unwrap_or_else(|_| unreachable!());
        let rejected = engine
            .reject_request(firm_id, request.request_id, &partner, "out of scope")
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(rejected.status, RequestStatus::Rejected);
        assert_eq!(rejected.decision_note.as_deref(), Some("out of scope"));

        let approve = engine.approve_request(firm_id, request.request_id, &partner, None, None);
        assert!(matches!(
            approve,
            Err(WorkflowError::InvalidRequestState { .. })
        ));
        let cancel = engine.cancel_request(firm_id, request.request_id, &client);
        assert!(matches!(
            cancel,
            Err(WorkflowError::InvalidRequestState { .. })
        ));
    }

    #[test]
    fn injected_clock_pins_timestamps() {
        let at = time::macros::datetime!(2026-03-01 09:30:00 UTC);
        let engine = TransitionEngine::with_clock(MemoryWorkflowStore::new(), FixedClock(at));
        let firm_id = FirmId::new();
        let partner = actor("partner-1", ActorRole::Partner);

        let service = engine
            .create_service(&draft(firm_id), &partner)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(service.created_at, at);
        assert_eq!(service.updated_at, at);
    }

    #[test]
    fn verify_history_flags_tampering() {
        let engine = engine();
        let firm_id = FirmId::new();
        let partner = actor("partner-1", ActorRole::Partner);
        let service = engine
            .create_service(&draft(firm_id), &partner)
            .unwrap_or_else(|_| unreachable!());
        engine
            .attempt(
                firm_id,
                service.service_id,
                &partner,
                WorkflowAction::Assign,
                &assign_input("staff-1"),
            )
            .unwrap_or_else(|_| unreachable!());

        let mut history = engine
            .store()
            .history(firm_id, service.service_id)
            .unwrap_or_else(|_| unreachable!());
        assert!(verify_history(&history).is_intact());

        history[1].note = Some("edited after the fact".to_string());
        let report = verify_history(&history);
        assert!(!report.is_intact());
        assert!(report.issues[0].contains("record 1"));

        history[1].note = None;
        history[1].prev_record_hash = Some("0".repeat(64));
        let report = verify_history(&history);
        assert!(report
            .issues
            .iter()
            .any(|issue| issue.contains("chain link")));
    }

    #[test]
    fn firm_scoping_hides_other_tenants() {
        let engine = engine();
        let firm_a = FirmId::new();
        let firm_b = FirmId::new();
        let partner = actor("partner-1", ActorRole::Partner);

        let service = engine
            .create_service(&draft(firm_a), &partner)
            .unwrap_or_else(|_| unreachable!());

        let other = engine
            .store()
            .get_service(firm_b, service.service_id)
            .unwrap_or_else(|_| unreachable!());
        assert!(other.is_none());
        let attempt = engine.attempt(
            firm_b,
            service.service_id,
            &partner,
            WorkflowAction::Assign,
            &assign_input("staff-1"),
        );
        assert!(matches!(attempt, Err(WorkflowError::NotFound { .. })));
    }
}

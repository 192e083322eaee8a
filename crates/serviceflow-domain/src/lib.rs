#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FirmId(pub Ulid);

impl FirmId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for FirmId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FirmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ClientId(pub Ulid);

impl ClientId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ServiceId(pub Ulid);

impl ServiceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AssignmentId(pub Ulid);

impl AssignmentId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for AssignmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AssignmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequestId(pub Ulid);

impl RequestId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HistoryId(pub Ulid);

impl HistoryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for HistoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HistoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coarse lifecycle phase used for grouping statuses in reporting surfaces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StatusPhase {
    Creation,
    Assignment,
    Execution,
    Review,
    Completion,
    Billing,
    Final,
}

impl StatusPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creation => "creation",
            Self::Assignment => "assignment",
            Self::Execution => "execution",
            Self::Review => "review",
            Self::Completion => "completion",
            Self::Billing => "billing",
            Self::Final => "final",
        }
    }
}

/// The finite status registry for a service. CLOSED and CANCELLED are the
/// only terminal statuses; no transition originates from them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Pending,
    Assigned,
    InProgress,
    WaitingForClient,
    OnHold,
    UnderReview,
    ChangesRequested,
    Completed,
    Delivered,
    Invoiced,
    Closed,
    Cancelled,
}

impl ServiceStatus {
    pub const ALL: [Self; 12] = [
        Self::Pending,
        Self::Assigned,
        Self::InProgress,
        Self::WaitingForClient,
        Self::OnHold,
        Self::UnderReview,
        Self::ChangesRequested,
        Self::Completed,
        Self::Delivered,
        Self::Invoiced,
        Self::Closed,
        Self::Cancelled,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::WaitingForClient => "waiting_for_client",
            Self::OnHold => "on_hold",
            Self::UnderReview => "under_review",
            Self::ChangesRequested => "changes_requested",
            Self::Completed => "completed",
            Self::Delivered => "delivered",
            Self::Invoiced => "invoiced",
            Self::Closed => "closed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "assigned" => Some(Self::Assigned),
            "in_progress" => Some(Self::InProgress),
            "waiting_for_client" => Some(Self::WaitingForClient),
            "on_hold" => Some(Self::OnHold),
            "under_review" => Some(Self::UnderReview),
            "changes_requested" => Some(Self::ChangesRequested),
            "completed" => Some(Self::Completed),
            "delivered" => Some(Self::Delivered),
            "invoiced" => Some(Self::Invoiced),
            "closed" => Some(Self::Closed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub fn phase(self) -> StatusPhase {
        match self {
            Self::Pending => StatusPhase::Creation,
            Self::Assigned => StatusPhase::Assignment,
            Self::InProgress | Self::WaitingForClient | Self::OnHold => StatusPhase::Execution,
            Self::UnderReview | Self::ChangesRequested => StatusPhase::Review,
            Self::Completed | Self::Delivered => StatusPhase::Completion,
            Self::Invoiced => StatusPhase::Billing,
            Self::Closed | Self::Cancelled => StatusPhase::Final,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    TaxFiling,
    GstFiling,
    Audit,
    Bookkeeping,
    CompanyFiling,
    Advisory,
}

impl ServiceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaxFiling => "tax_filing",
            Self::GstFiling => "gst_filing",
            Self::Audit => "audit",
            Self::Bookkeeping => "bookkeeping",
            Self::CompanyFiling => "company_filing",
            Self::Advisory => "advisory",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tax_filing" => Some(Self::TaxFiling),
            "gst_filing" => Some(Self::GstFiling),
            "audit" => Some(Self::Audit),
            "bookkeeping" => Some(Self::Bookkeeping),
            "company_filing" => Some(Self::CompanyFiling),
            "advisory" => Some(Self::Advisory),
            _ => None,
        }
    }
}

/// How a service came into existence. Immutable once set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServiceOrigin {
    ClientRequest,
    FirmCreated,
    Recurring,
    ComplianceTriggered,
}

impl ServiceOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientRequest => "client_request",
            Self::FirmCreated => "firm_created",
            Self::Recurring => "recurring",
            Self::ComplianceTriggered => "compliance_triggered",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "client_request" => Some(Self::ClientRequest),
            "firm_created" => Some(Self::FirmCreated),
            "recurring" => Some(Self::Recurring),
            "compliance_triggered" => Some(Self::ComplianceTriggered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeKind {
    Employee,
    Team,
}

impl AssigneeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Employee => "employee",
            Self::Team => "team",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "employee" => Some(Self::Employee),
            "team" => Some(Self::Team),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentKind {
    Initial,
    Delegation,
    Reassignment,
    TakeBack,
}

impl AssignmentKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Delegation => "delegation",
            Self::Reassignment => "re_assignment",
            Self::TakeBack => "take_back",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initial" => Some(Self::Initial),
            "delegation" => Some(Self::Delegation),
            "re_assignment" => Some(Self::Reassignment),
            "take_back" => Some(Self::TakeBack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Delegated,
    Completed,
    Revoked,
}

impl AssignmentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Delegated => "delegated",
            Self::Completed => "completed",
            Self::Revoked => "revoked",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "delegated" => Some(Self::Delegated),
            "completed" => Some(Self::Completed),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

impl std::fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    UnderReview,
    Approved,
    Rejected,
    Cancelled,
    Converted,
}

impl RequestStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Converted => "converted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "under_review" => Some(Self::UnderReview),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            "converted" => Some(Self::Converted),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Cancelled | Self::Converted)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Normal,
    High,
    Urgent,
}

impl Urgency {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

/// Firm staff tiers plus the client role. Role resolution happens upstream
/// (identity provider); the engine only evaluates the resolved role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Admin,
    Partner,
    Manager,
    Senior,
    Staff,
    Client,
}

impl ActorRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Partner => "partner",
            Self::Manager => "manager",
            Self::Senior => "senior",
            Self::Staff => "staff",
            Self::Client => "client",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "partner" => Some(Self::Partner),
            "manager" => Some(Self::Manager),
            "senior" => Some(Self::Senior),
            "staff" => Some(Self::Staff),
            "client" => Some(Self::Client),
            _ => None,
        }
    }

    /// Supervisory tier permitted to assign, approve, deliver, and close work.
    #[must_use]
    pub fn is_assignment_manager(self) -> bool {
        matches!(self, Self::Admin | Self::Partner | Self::Manager)
    }

    /// Tier that performs the work and may submit it for review.
    #[must_use]
    pub fn is_worker_tier(self) -> bool {
        matches!(self, Self::Manager | Self::Senior | Self::Staff)
    }
}

impl std::fmt::Display for ActorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved caller identity: opaque external id plus firm role.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Actor {
    pub actor_id: String,
    pub role: ActorRole,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowAction {
    Assign,
    StartWork,
    Delegate,
    RequestDocuments,
    PutOnHold,
    SubmitReview,
    MarkComplete,
    ResumeWork,
    Approve,
    RequestChanges,
    Deliver,
    RecordInvoice,
    Close,
    Cancel,
}

impl WorkflowAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assign => "assign",
            Self::StartWork => "start-work",
            Self::Delegate => "delegate",
            Self::RequestDocuments => "request-documents",
            Self::PutOnHold => "put-on-hold",
            Self::SubmitReview => "submit-review",
            Self::MarkComplete => "mark-complete",
            Self::ResumeWork => "resume-work",
            Self::Approve => "approve",
            Self::RequestChanges => "request-changes",
            Self::Deliver => "deliver",
            Self::RecordInvoice => "record-invoice",
            Self::Close => "close",
            Self::Cancel => "cancel",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "assign" => Some(Self::Assign),
            "start-work" => Some(Self::StartWork),
            "delegate" => Some(Self::Delegate),
            "request-documents" => Some(Self::RequestDocuments),
            "put-on-hold" => Some(Self::PutOnHold),
            "submit-review" => Some(Self::SubmitReview),
            "mark-complete" => Some(Self::MarkComplete),
            "resume-work" => Some(Self::ResumeWork),
            "approve" => Some(Self::Approve),
            "request-changes" => Some(Self::RequestChanges),
            "deliver" => Some(Self::Deliver),
            "record-invoice" => Some(Self::RecordInvoice),
            "close" => Some(Self::Close),
            "cancel" => Some(Self::Cancel),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkflowAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who may perform an action in a given status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ActionGate {
    /// Supervisory tier (admin, partner, manager).
    AssignmentManager,
    /// The holder of the current ACTIVE assignment.
    Assignee,
    /// The current assignee, or an admin acting on their behalf.
    AssigneeOrAdmin,
    /// The current assignee, who must also hold a worker-tier role.
    AssigneeWorkerTier,
}

/// One edge of the transition graph. The whole graph is the `TRANSITION_RULES`
/// table; the engine never encodes transitions outside it, with the single
/// exception of the externally-driven DELIVERED -> INVOICED edge
/// (`WorkflowAction::RecordInvoice`), which is deliberately absent here.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct TransitionRule {
    pub from: ServiceStatus,
    pub action: WorkflowAction,
    pub gate: ActionGate,
    pub requires_note: bool,
    pub to: ServiceStatus,
}

const fn rule(
    from: ServiceStatus,
    action: WorkflowAction,
    gate: ActionGate,
    requires_note: bool,
    to: ServiceStatus,
) -> TransitionRule {
    TransitionRule {
        from,
        action,
        gate,
        requires_note,
        to,
    }
}

/// Status graph as declarative data. `cancel` is listed explicitly for every
/// non-terminal status so the table alone answers "what can happen next".
pub const TRANSITION_RULES: &[TransitionRule] = &[
    rule(
        ServiceStatus::Pending,
        WorkflowAction::Assign,
        ActionGate::AssignmentManager,
        false,
        ServiceStatus::Assigned,
    ),
    rule(
        ServiceStatus::Assigned,
        WorkflowAction::StartWork,
        ActionGate::AssigneeOrAdmin,
        false,
        ServiceStatus::InProgress,
    ),
    rule(
        ServiceStatus::Assigned,
        WorkflowAction::Delegate,
        ActionGate::Assignee,
        false,
        ServiceStatus::Assigned,
    ),
    rule(
        ServiceStatus::InProgress,
        WorkflowAction::RequestDocuments,
        ActionGate::Assignee,
        true,
        ServiceStatus::WaitingForClient,
    ),
    rule(
        ServiceStatus::InProgress,
        WorkflowAction::PutOnHold,
        ActionGate::Assignee,
        true,
        ServiceStatus::OnHold,
    ),
    rule(
        ServiceStatus::InProgress,
        WorkflowAction::SubmitReview,
        ActionGate::AssigneeWorkerTier,
        false,
        ServiceStatus::UnderReview,
    ),
    rule(
        ServiceStatus::InProgress,
        WorkflowAction::MarkComplete,
        ActionGate::AssignmentManager,
        false,
        ServiceStatus::Completed,
    ),
    rule(
        ServiceStatus::InProgress,
        WorkflowAction::Delegate,
        ActionGate::Assignee,
        false,
        ServiceStatus::InProgress,
    ),
    rule(
        ServiceStatus::WaitingForClient,
        WorkflowAction::ResumeWork,
        ActionGate::Assignee,
        false,
        ServiceStatus::InProgress,
    ),
    rule(
        ServiceStatus::WaitingForClient,
        WorkflowAction::PutOnHold,
        ActionGate::Assignee,
        true,
        ServiceStatus::OnHold,
    ),
    rule(
        ServiceStatus::OnHold,
        WorkflowAction::ResumeWork,
        ActionGate::Assignee,
        false,
        ServiceStatus::InProgress,
    ),
    rule(
        ServiceStatus::UnderReview,
        WorkflowAction::Approve,
        ActionGate::AssignmentManager,
        false,
        ServiceStatus::Completed,
    ),
    rule(
        ServiceStatus::UnderReview,
        WorkflowAction::RequestChanges,
        ActionGate::AssignmentManager,
        true,
        ServiceStatus::ChangesRequested,
    ),
    rule(
        ServiceStatus::ChangesRequested,
        WorkflowAction::ResumeWork,
        ActionGate::Assignee,
        false,
        ServiceStatus::InProgress,
    ),
    rule(
        ServiceStatus::Completed,
        WorkflowAction::Deliver,
        ActionGate::AssignmentManager,
        false,
        ServiceStatus::Delivered,
    ),
    rule(
        ServiceStatus::Invoiced,
        WorkflowAction::Close,
        ActionGate::AssignmentManager,
        false,
        ServiceStatus::Closed,
    ),
    rule(
        ServiceStatus::Pending,
        WorkflowAction::Cancel,
        ActionGate::AssignmentManager,
        true,
        ServiceStatus::Cancelled,
    ),
    rule(
        ServiceStatus::Assigned,
        WorkflowAction::Cancel,
        ActionGate::AssignmentManager,
        true,
        ServiceStatus::Cancelled,
    ),
    rule(
        ServiceStatus::InProgress,
        WorkflowAction::Cancel,
        ActionGate::AssignmentManager,
        true,
        ServiceStatus::Cancelled,
    ),
    rule(
        ServiceStatus::WaitingForClient,
        WorkflowAction::Cancel,
        ActionGate::AssignmentManager,
        true,
        ServiceStatus::Cancelled,
    ),
    rule(
        ServiceStatus::OnHold,
        WorkflowAction::Cancel,
        ActionGate::AssignmentManager,
        true,
        ServiceStatus::Cancelled,
    ),
    rule(
        ServiceStatus::UnderReview,
        WorkflowAction::Cancel,
        ActionGate::AssignmentManager,
        true,
        ServiceStatus::Cancelled,
    ),
    rule(
        ServiceStatus::ChangesRequested,
        WorkflowAction::Cancel,
        ActionGate::AssignmentManager,
        true,
        ServiceStatus::Cancelled,
    ),
    rule(
        ServiceStatus::Completed,
        WorkflowAction::Cancel,
        ActionGate::AssignmentManager,
        true,
        ServiceStatus::Cancelled,
    ),
    rule(
        ServiceStatus::Delivered,
        WorkflowAction::Cancel,
        ActionGate::AssignmentManager,
        true,
        ServiceStatus::Cancelled,
    ),
    rule(
        ServiceStatus::Invoiced,
        WorkflowAction::Cancel,
        ActionGate::AssignmentManager,
        true,
        ServiceStatus::Cancelled,
    ),
];

#[must_use]
pub fn find_rule(from: ServiceStatus, action: WorkflowAction) -> Option<&'static TransitionRule> {
    TRANSITION_RULES
        .iter()
        .find(|rule| rule.from == from && rule.action == action)
}

#[must_use]
pub fn rules_from(from: ServiceStatus) -> Vec<&'static TransitionRule> {
    TRANSITION_RULES
        .iter()
        .filter(|rule| rule.from == from)
        .collect()
}

/// Whether an edge observed in the audit trail is one the graph can produce:
/// the creation edge, a table rule, a ledger-only event (`from == to`), or
/// the external invoice edge.
#[must_use]
pub fn is_valid_edge(from: Option<ServiceStatus>, to: ServiceStatus) -> bool {
    match from {
        None => to == ServiceStatus::Pending,
        Some(from) if from == to => !from.is_terminal(),
        Some(ServiceStatus::Delivered) if to == ServiceStatus::Invoiced => true,
        Some(from) => TRANSITION_RULES
            .iter()
            .any(|rule| rule.from == from && rule.to == to),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssigneeRef {
    pub assignee_id: String,
    pub kind: AssigneeKind,
}

/// Caller-supplied payload for an action: free-text note/reason plus the
/// target assignee for assign/delegate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ActionInput {
    pub note: Option<String>,
    pub assignee: Option<AssigneeRef>,
}

impl ActionInput {
    #[must_use]
    pub fn with_note(note: &str) -> Self {
        Self {
            note: Some(note.to_string()),
            assignee: None,
        }
    }

    #[must_use]
    pub fn has_note(&self) -> bool {
        self.note
            .as_deref()
            .is_some_and(|note| !note.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub service_id: ServiceId,
    pub firm_id: FirmId,
    pub client_id: ClientId,
    pub service_type: ServiceType,
    pub status: ServiceStatus,
    pub origin: ServiceOrigin,
    pub due_at: Option<DateTimeUtc>,
    pub completed_at: Option<DateTimeUtc>,
    pub fee_minor: Option<i64>,
    pub notes: String,
    pub service_request_id: Option<RequestId>,
    pub version: i64,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceAssignment {
    pub assignment_id: AssignmentId,
    pub firm_id: FirmId,
    pub service_id: ServiceId,
    pub assignee_id: String,
    pub assignee_kind: AssigneeKind,
    pub assigned_by: String,
    pub delegation_level: u32,
    pub previous_assignment_id: Option<AssignmentId>,
    pub kind: AssignmentKind,
    pub status: AssignmentStatus,
    pub reason: Option<String>,
    pub revoked_by: Option<String>,
    pub revoke_reason: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

/// One immutable audit record per accepted engine operation. Records are
/// hash-chained per service: `record_hash` covers every field except itself,
/// and `prev_record_hash` links to the preceding record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceStatusHistory {
    pub history_id: HistoryId,
    pub firm_id: FirmId,
    pub service_id: ServiceId,
    pub from_status: Option<ServiceStatus>,
    pub to_status: ServiceStatus,
    pub action: String,
    pub actor_id: String,
    pub actor_role: ActorRole,
    pub note: Option<String>,
    pub metadata: Value,
    pub recorded_at: DateTimeUtc,
    pub prev_record_hash: Option<String>,
    pub record_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRequest {
    pub request_id: RequestId,
    pub firm_id: FirmId,
    pub client_id: ClientId,
    pub service_type: ServiceType,
    pub title: String,
    pub description: String,
    pub urgency: Urgency,
    pub preferred_due_at: Option<DateTimeUtc>,
    pub status: RequestStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTimeUtc>,
    pub decision_note: Option<String>,
    pub quoted_fee_minor: Option<i64>,
    pub attachments: Vec<String>,
    pub converted_service_id: Option<ServiceId>,
    pub version: i64,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

/// A ledger write carried inside a transition plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AssignmentChange {
    Insert(ServiceAssignment),
    SetStatus {
        assignment_id: AssignmentId,
        status: AssignmentStatus,
        revoked_by: Option<String>,
        revoke_reason: Option<String>,
        updated_at: DateTimeUtc,
    },
}

/// Everything one accepted engine operation writes, applied by the store as a
/// single transaction. `expected_version` is the compare-and-set guard: a
/// concurrent writer that committed first makes this plan fail with
/// [`WorkflowError::Conflict`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionPlan {
    pub firm_id: FirmId,
    pub service_id: ServiceId,
    pub expected_version: i64,
    pub from_status: ServiceStatus,
    pub to_status: ServiceStatus,
    pub set_completed_at: Option<DateTimeUtc>,
    pub assignment_changes: Vec<AssignmentChange>,
    pub history: ServiceStatusHistory,
    pub updated_at: DateTimeUtc,
}

/// The service (plus its creation audit record) materialized by an approved
/// request, written in the same transaction as the request update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewServiceRecord {
    pub service: Service,
    pub creation_history: ServiceStatusHistory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestTransitionPlan {
    pub firm_id: FirmId,
    pub request_id: RequestId,
    pub expected_version: i64,
    pub from_status: RequestStatus,
    pub to_status: RequestStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTimeUtc>,
    pub decision_note: Option<String>,
    pub quoted_fee_minor: Option<i64>,
    pub converted_service_id: Option<ServiceId>,
    pub new_service: Option<NewServiceRecord>,
    pub updated_at: DateTimeUtc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidAction,
    Unauthorized,
    MissingInput,
    Conflict,
    NotFound,
    InvariantViolation,
    Storage,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidAction => "invalid_action",
            Self::Unauthorized => "unauthorized",
            Self::MissingInput => "missing_input",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::InvariantViolation => "invariant_violation",
            Self::Storage => "storage",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum WorkflowError {
    #[error("action {action} is not valid while status is {status}")]
    InvalidAction {
        status: ServiceStatus,
        action: WorkflowAction,
    },
    #[error("operation {operation} is not valid while request status is {status}")]
    InvalidRequestState {
        status: RequestStatus,
        operation: &'static str,
    },
    #[error("operation {operation} is not valid while assignment status is {status}")]
    InvalidAssignmentState {
        status: AssignmentStatus,
        operation: &'static str,
    },
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },
    #[error("action {action} requires input that was not supplied: {field}")]
    MissingInput {
        action: WorkflowAction,
        field: &'static str,
    },
    #[error("a concurrent transition committed first; reload and retry")]
    Conflict,
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("workflow invariant violated: {0}")]
    InvariantViolation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl WorkflowError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAction { .. }
            | Self::InvalidRequestState { .. }
            | Self::InvalidAssignmentState { .. } => ErrorKind::InvalidAction,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::MissingInput { .. } => ErrorKind::MissingInput,
            Self::Conflict => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns [`WorkflowError::InvariantViolation`] if serialization fails.
pub fn hash_json(value: &Value) -> Result<String, WorkflowError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|err| WorkflowError::InvariantViolation(format!("unhashable payload: {err}")))?;
    Ok(hash_bytes(&bytes))
}

/// Compute the hash of an audit record over every field except `record_hash`.
///
/// # Errors
/// Returns [`WorkflowError::InvariantViolation`] if the record cannot be
/// serialized, which indicates a malformed metadata payload.
pub fn compute_history_hash(record: &ServiceStatusHistory) -> Result<String, WorkflowError> {
    let payload = serde_json::json!({
        "history_id": record.history_id,
        "firm_id": record.firm_id,
        "service_id": record.service_id,
        "from_status": record.from_status,
        "to_status": record.to_status,
        "action": record.action,
        "actor_id": record.actor_id,
        "actor_role": record.actor_role,
        "note": record.note,
        "metadata": record.metadata,
        "recorded_at": record.recorded_at,
        "prev_record_hash": record.prev_record_hash,
    });
    hash_json(&payload)
}

#[cfg(test)]
mod tests {
    use super::{
        compute_history_hash, find_rule, is_valid_edge, rules_from, ActionGate, ActorRole, FirmId,
        HistoryId, ServiceId, ServiceStatus, ServiceStatusHistory, StatusPhase, WorkflowAction,
        TRANSITION_RULES,
    };
    use serde_json::json;

    #[test]
    fn every_status_round_trips_through_as_str() {
        for status in ServiceStatus::ALL {
            assert_eq!(ServiceStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ServiceStatus::parse("shipped"), None);
    }

    #[test]
    fn terminal_statuses_have_no_outgoing_rules() {
        assert!(rules_from(ServiceStatus::Closed).is_empty());
        assert!(rules_from(ServiceStatus::Cancelled).is_empty());
    }

    #[test]
    fn cancel_is_available_from_every_non_terminal_status() {
        for status in ServiceStatus::ALL {
            let rule = find_rule(status, WorkflowAction::Cancel);
            if status.is_terminal() {
                assert!(rule.is_none(), "cancel must not leave {status}");
            } else {
                let rule = rule.unwrap_or_else(|| unreachable!());
                assert_eq!(rule.to, ServiceStatus::Cancelled);
                assert!(rule.requires_note);
                assert_eq!(rule.gate, ActionGate::AssignmentManager);
            }
        }
    }

    #[test]
    fn delegation_rules_keep_status_unchanged() {
        for rule in TRANSITION_RULES
            .iter()
            .filter(|rule| rule.action == WorkflowAction::Delegate)
        {
            assert_eq!(rule.from, rule.to);
            assert_eq!(rule.gate, ActionGate::Assignee);
        }
    }

    #[test]
    fn review_path_matches_the_graph() {
        let submit = find_rule(ServiceStatus::InProgress, WorkflowAction::SubmitReview)
            .unwrap_or_else(|| unreachable!());
        assert_eq!(submit.to, ServiceStatus::UnderReview);
        assert_eq!(submit.gate, ActionGate::AssigneeWorkerTier);

        let changes = find_rule(ServiceStatus::UnderReview, WorkflowAction::RequestChanges)
            .unwrap_or_else(|| unreachable!());
        assert_eq!(changes.to, ServiceStatus::ChangesRequested);
        assert!(changes.requires_note);

        assert!(find_rule(ServiceStatus::UnderReview, WorkflowAction::StartWork).is_none());
    }

    #[test]
    fn record_invoice_is_not_a_table_action() {
        for status in ServiceStatus::ALL {
            assert!(find_rule(status, WorkflowAction::RecordInvoice).is_none());
        }
        assert!(is_valid_edge(
            Some(ServiceStatus::Delivered),
            ServiceStatus::Invoiced
        ));
    }

    #[test]
    fn phases_cover_the_registry() {
        assert_eq!(ServiceStatus::Pending.phase(), StatusPhase::Creation);
        assert_eq!(ServiceStatus::OnHold.phase(), StatusPhase::Execution);
        assert_eq!(ServiceStatus::Invoiced.phase(), StatusPhase::Billing);
        assert_eq!(ServiceStatus::Cancelled.phase(), StatusPhase::Final);
    }

    #[test]
    fn valid_edges_reject_terminal_and_backward_moves() {
        assert!(is_valid_edge(None, ServiceStatus::Pending));
        assert!(!is_valid_edge(None, ServiceStatus::Assigned));
        assert!(!is_valid_edge(
            Some(ServiceStatus::Closed),
            ServiceStatus::Closed
        ));
        assert!(!is_valid_edge(
            Some(ServiceStatus::Completed),
            ServiceStatus::InProgress
        ));
        assert!(is_valid_edge(
            Some(ServiceStatus::InProgress),
            ServiceStatus::InProgress
        ));
    }

    fn fixture_record() -> ServiceStatusHistory {
        ServiceStatusHistory {
            history_id: HistoryId::new(),
            firm_id: FirmId::new(),
            service_id: ServiceId::new(),
            from_status: Some(ServiceStatus::Pending),
            to_status: ServiceStatus::Assigned,
            action: "assign".to_string(),
            actor_id: "partner-1".to_string(),
            actor_role: ActorRole::Partner,
            note: None,
            metadata: json!({}),
            recorded_at: time::OffsetDateTime::now_utc(),
            prev_record_hash: None,
            record_hash: String::new(),
        }
    }

    #[test]
    fn history_hash_is_stable_and_binds_the_chain_link() {
        let record = fixture_record();
        let first = compute_history_hash(&record).unwrap_or_else(|_| unreachable!());
        let second = compute_history_hash(&record).unwrap_or_else(|_| unreachable!());
        assert_eq!(first, second);

        let mut relinked = record;
        relinked.prev_record_hash = Some("other".to_string());
        let relinked_hash = compute_history_hash(&relinked).unwrap_or_else(|_| unreachable!());
        assert_ne!(first, relinked_hash);
    }
}

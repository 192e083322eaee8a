#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};
use serviceflow_domain::{
    ActorRole, AssigneeKind, AssignmentChange, AssignmentId, AssignmentKind, AssignmentStatus,
    ClientId, DateTimeUtc, FirmId, HistoryId, RequestId, RequestStatus, RequestTransitionPlan,
    Service, ServiceAssignment, ServiceId, ServiceOrigin, ServiceRequest, ServiceStatus,
    ServiceStatusHistory, ServiceType, TransitionPlan, Urgency, WorkflowError,
};
use serviceflow_store_core::WorkflowStore;
use time::OffsetDateTime;
use ulid::Ulid;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS services (
  service_id TEXT PRIMARY KEY,
  firm_id TEXT NOT NULL,
  client_id TEXT NOT NULL,
  service_type TEXT NOT NULL CHECK (service_type IN
    ('tax_filing','gst_filing','audit','bookkeeping','company_filing','advisory')),
  status TEXT NOT NULL CHECK (status IN
    ('pending','assigned','in_progress','waiting_for_client','on_hold','under_review',
     'changes_requested','completed','delivered','invoiced','closed','cancelled')),
  origin TEXT NOT NULL CHECK (origin IN
    ('client_request','firm_created','recurring','compliance_triggered')),
  due_at TEXT,
  completed_at TEXT,
  fee_minor INTEGER,
  notes TEXT NOT NULL DEFAULT '',
  service_request_id TEXT,
  version INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS assignments (
  assignment_id TEXT PRIMARY KEY,
  firm_id TEXT NOT NULL,
  service_id TEXT NOT NULL,
  assignee_id TEXT NOT NULL,
  assignee_kind TEXT NOT NULL CHECK (assignee_kind IN ('employee','team')),
  assigned_by TEXT NOT NULL,
  delegation_level INTEGER NOT NULL CHECK (delegation_level >= 0),
  previous_assignment_id TEXT,
  kind TEXT NOT NULL CHECK (kind IN ('initial','delegation','re_assignment','take_back')),
  status TEXT NOT NULL CHECK (status IN ('active','delegated','completed','revoked')),
  reason TEXT,
  revoked_by TEXT,
  revoke_reason TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (service_id) REFERENCES services(service_id),
  FOREIGN KEY (previous_assignment_id) REFERENCES assignments(assignment_id)
);

CREATE TABLE IF NOT EXISTS status_history (
  history_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  history_id TEXT NOT NULL UNIQUE,
  firm_id TEXT NOT NULL,
  service_id TEXT NOT NULL,
  from_status TEXT CHECK (from_status IS NULL OR from_status IN
    ('pending','assigned','in_progress','waiting_for_client','on_hold','under_review',
     'changes_requested','completed','delivered','invoiced','closed','cancelled')),
  to_status TEXT NOT NULL,
  action TEXT NOT NULL,
  actor_id TEXT NOT NULL,
  actor_role TEXT NOT NULL,
  note TEXT,
  metadata_json TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  prev_record_hash TEXT,
  record_hash TEXT NOT NULL,
  FOREIGN KEY (service_id) REFERENCES services(service_id)
);

CREATE TABLE IF NOT EXISTS service_requests (
  request_id TEXT PRIMARY KEY,
  firm_id TEXT NOT NULL,
  client_id TEXT NOT NULL,
  service_type TEXT NOT NULL CHECK (service_type IN
    ('tax_filing','gst_filing','audit','bookkeeping','company_filing','advisory')),
  title TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  urgency TEXT NOT NULL CHECK (urgency IN ('low','normal','high','urgent')),
  preferred_due_at TEXT,
  status TEXT NOT NULL CHECK (status IN
    ('pending','under_review','approved','rejected','cancelled','converted')),
  reviewed_by TEXT,
  reviewed_at TEXT,
  decision_note TEXT,
  quoted_fee_minor INTEGER,
  attachments_json TEXT NOT NULL,
  converted_service_id TEXT,
  version INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_services_firm ON services(firm_id, created_at);
CREATE INDEX IF NOT EXISTS idx_assignments_service ON assignments(service_id, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_one_active
  ON assignments(service_id) WHERE status = 'active';
CREATE INDEX IF NOT EXISTS idx_history_service_seq ON status_history(service_id, history_seq);
CREATE INDEX IF NOT EXISTS idx_requests_firm ON service_requests(firm_id, created_at);

CREATE TRIGGER IF NOT EXISTS trg_status_history_no_update
BEFORE UPDATE ON status_history
BEGIN
  SELECT RAISE(FAIL, 'status_history is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_status_history_no_delete
BEFORE DELETE ON status_history
BEGIN
  SELECT RAISE(FAIL, 'status_history is append-only');
END;
";

/// Results from rusqlite/serde carry no workflow meaning; wrap them with a
/// short operation description before they cross the store boundary.
trait StoreContext<T> {
    fn ctx(self, what: &str) -> Result<T, WorkflowError>;
}

impl<T, E: std::fmt::Display> StoreContext<T> for Result<T, E> {
    fn ctx(self, what: &str) -> Result<T, WorkflowError> {
        self.map_err(|err| WorkflowError::Storage(format!("{what}: {err}")))
    }
}

pub struct SqliteWorkflowStore {
    conn: Connection,
}

impl SqliteWorkflowStore {
    /// Open or create a `SQLite` workflow database and configure pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self, WorkflowError> {
        let conn = Connection::open(path)
            .ctx(&format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .ctx("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// In-process database for tests and ephemeral tooling.
    ///
    /// # Errors
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self, WorkflowError> {
        let conn = Connection::open_in_memory().ctx("failed to open in-memory sqlite")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .ctx("failed to configure sqlite pragmas")?;
        Ok(Self { conn })
    }

    fn apply_assignment_change(
        conn: &Connection,
        firm_id: FirmId,
        change: &AssignmentChange,
    ) -> Result<(), WorkflowError> {
        match change {
            AssignmentChange::Insert(assignment) => {
                conn.execute(
                    "INSERT INTO assignments(
                        assignment_id, firm_id, service_id, assignee_id, assignee_kind,
                        assigned_by, delegation_level, previous_assignment_id, kind,
                        status, reason, revoked_by, revoke_reason, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    params![
                        assignment.assignment_id.to_string(),
                        assignment.firm_id.to_string(),
                        assignment.service_id.to_string(),
                        assignment.assignee_id,
                        assignment.assignee_kind.as_str(),
                        assignment.assigned_by,
                        i64::from(assignment.delegation_level),
                        assignment.previous_assignment_id.map(|id| id.to_string()),
                        assignment.kind.as_str(),
                        assignment.status.as_str(),
                        assignment.reason,
                        assignment.revoked_by,
                        assignment.revoke_reason,
                        rfc3339(assignment.created_at)?,
                        rfc3339(assignment.updated_at)?,
                    ],
                )
                .ctx("failed to insert assignment")?;
            }
            AssignmentChange::SetStatus {
                assignment_id,
                status,
                revoked_by,
                revoke_reason,
                updated_at,
            } => {
                let changed = conn
                    .execute(
                        "UPDATE assignments SET
                            status = ?3,
                            revoked_by = COALESCE(?4, revoked_by),
                            revoke_reason = COALESCE(?5, revoke_reason),
                            updated_at = ?6
                         WHERE assignment_id = ?1 AND firm_id = ?2",
                        params![
                            assignment_id.to_string(),
                            firm_id.to_string(),
                            status.as_str(),
                            revoked_by,
                            revoke_reason,
                            rfc3339(*updated_at)?,
                        ],
                    )
                    .ctx("failed to update assignment status")?;
                if changed == 0 {
                    return Err(WorkflowError::NotFound {
                        entity: "assignment",
                        id: assignment_id.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn insert_history(
        conn: &Connection,
        record: &ServiceStatusHistory,
    ) -> Result<(), WorkflowError> {
        conn.execute(
            "INSERT INTO status_history(
                history_id, firm_id, service_id, from_status, to_status, action,
                actor_id, actor_role, note, metadata_json, recorded_at,
                prev_record_hash, record_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.history_id.to_string(),
                record.firm_id.to_string(),
                record.service_id.to_string(),
                record.from_status.map(ServiceStatus::as_str),
                record.to_status.as_str(),
                record.action,
                record.actor_id,
                record.actor_role.as_str(),
                record.note,
                serde_json::to_string(&record.metadata).ctx("failed to encode metadata")?,
                rfc3339(record.recorded_at)?,
                record.prev_record_hash,
                record.record_hash,
            ],
        )
        .ctx("failed to append status history")?;
        Ok(())
    }

    fn chain_head(
        conn: &Connection,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Option<String>, WorkflowError> {
        conn.query_row(
            "SELECT record_hash FROM status_history
             WHERE firm_id = ?1 AND service_id = ?2
             ORDER BY history_seq DESC LIMIT 1",
            params![firm_id.to_string(), service_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .ctx("failed to read audit chain head")
    }

    fn insert_service_row(conn: &Connection, service: &Service) -> Result<(), WorkflowError> {
        conn.execute(
            "INSERT INTO services(
                service_id, firm_id, client_id, service_type, status, origin,
                due_at, completed_at, fee_minor, notes, service_request_id,
                version, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                service.service_id.to_string(),
                service.firm_id.to_string(),
                service.client_id.to_string(),
                service.service_type.as_str(),
                service.status.as_str(),
                service.origin.as_str(),
                service.due_at.map(rfc3339).transpose()?,
                service.completed_at.map(rfc3339).transpose()?,
                service.fee_minor,
                service.notes,
                service.service_request_id.map(|id| id.to_string()),
                service.version,
                rfc3339(service.created_at)?,
                rfc3339(service.updated_at)?,
            ],
        )
        .ctx("failed to insert service")?;
        Ok(())
    }
}

impl WorkflowStore for SqliteWorkflowStore {
    fn migrate(&self) -> Result<(), WorkflowError> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .ctx("failed to apply workflow schema")?;

        let now = rfc3339(OffsetDateTime::now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, now],
            )
            .ctx("failed to record migration")?;
        Ok(())
    }

    fn insert_service(
        &self,
        service: &Service,
        creation_history: &ServiceStatusHistory,
    ) -> Result<(), WorkflowError> {
        let tx = self
            .conn
            .unchecked_transaction()
            .ctx("failed to begin transaction")?;
        Self::insert_service_row(&tx, service)?;
        Self::insert_history(&tx, creation_history)?;
        tx.commit().ctx("failed to commit service insert")?;
        Ok(())
    }

    fn get_service(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Option<Service>, WorkflowError> {
        let row = self
            .conn
            .query_row(
                "SELECT service_id, firm_id, client_id, service_type, status, origin,
                        due_at, completed_at, fee_minor, notes, service_request_id,
                        version, created_at, updated_at
                 FROM services WHERE firm_id = ?1 AND service_id = ?2",
                params![firm_id.to_string(), service_id.to_string()],
                service_row,
            )
            .optional()
            .ctx("failed to read service")?;
        row.map(parse_service).transpose()
    }

    fn list_services(&self, firm_id: FirmId) -> Result<Vec<Service>, WorkflowError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT service_id, firm_id, client_id, service_type, status, origin,
                        due_at, completed_at, fee_minor, notes, service_request_id,
                        version, created_at, updated_at
                 FROM services WHERE firm_id = ?1
                 ORDER BY created_at ASC, service_id ASC",
            )
            .ctx("failed to prepare service list")?;
        let rows = stmt
            .query_map(params![firm_id.to_string()], service_row)
            .ctx("failed to list services")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(parse_service(row.ctx("failed to read service row")?)?);
        }
        Ok(out)
    }

    fn apply_transition(&self, plan: &TransitionPlan) -> Result<(), WorkflowError> {
        let tx = self
            .conn
            .unchecked_transaction()
            .ctx("failed to begin transaction")?;

        let changed = tx
            .execute(
                "UPDATE services SET
                    status = ?5,
                    completed_at = COALESCE(?6, completed_at),
                    updated_at = ?7,
                    version = version + 1
                 WHERE firm_id = ?1 AND service_id = ?2
                   AND version = ?3 AND status = ?4",
                params![
                    plan.firm_id.to_string(),
                    plan.service_id.to_string(),
                    plan.expected_version,
                    plan.from_status.as_str(),
                    plan.to_status.as_str(),
                    plan.set_completed_at.map(rfc3339).transpose()?,
                    rfc3339(plan.updated_at)?,
                ],
            )
            .ctx("failed to update service status")?;

        if changed == 0 {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT version FROM services WHERE firm_id = ?1 AND service_id = ?2",
                    params![plan.firm_id.to_string(), plan.service_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .ctx("failed to probe service version")?;
            return Err(match exists {
                Some(_) => WorkflowError::Conflict,
                None => WorkflowError::NotFound {
                    entity: "service",
                    id: plan.service_id.to_string(),
                },
            });
        }

        for change in &plan.assignment_changes {
            Self::apply_assignment_change(&tx, plan.firm_id, change)?;
        }

        let head = Self::chain_head(&tx, plan.firm_id, plan.service_id)?;
        if head != plan.history.prev_record_hash {
            // The version CAS should have serialized us; a mismatched chain
            // head means the plan was built against a different trail.
            return Err(WorkflowError::InvariantViolation(format!(
                "audit chain head moved for service {}",
                plan.service_id
            )));
        }
        Self::insert_history(&tx, &plan.history)?;

        tx.commit().ctx("failed to commit transition")?;
        Ok(())
    }

    fn active_assignment(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Option<ServiceAssignment>, WorkflowError> {
        let row = self
            .conn
            .query_row(
                "SELECT assignment_id, firm_id, service_id, assignee_id, assignee_kind,
                        assigned_by, delegation_level, previous_assignment_id, kind,
                        status, reason, revoked_by, revoke_reason, created_at, updated_at
                 FROM assignments
                 WHERE firm_id = ?1 AND service_id = ?2 AND status = 'active'",
                params![firm_id.to_string(), service_id.to_string()],
                assignment_row,
            )
            .optional()
            .ctx("failed to read active assignment")?;
        row.map(parse_assignment).transpose()
    }

    fn get_assignment(
        &self,
        firm_id: FirmId,
        assignment_id: AssignmentId,
    ) -> Result<Option<ServiceAssignment>, WorkflowError> {
        let row = self
            .conn
            .query_row(
                "SELECT assignment_id, firm_id, service_id, assignee_id, assignee_kind,
                        assigned_by, delegation_level, previous_assignment_id, kind,
                        status, reason, revoked_by, revoke_reason, created_at, updated_at
                 FROM assignments WHERE firm_id = ?1 AND assignment_id = ?2",
                params![firm_id.to_string(), assignment_id.to_string()],
                assignment_row,
            )
            .optional()
            .ctx("failed to read assignment")?;
        row.map(parse_assignment).transpose()
    }

    fn list_assignments(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Vec<ServiceAssignment>, WorkflowError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT assignment_id, firm_id, service_id, assignee_id, assignee_kind,
                        assigned_by, delegation_level, previous_assignment_id, kind,
                        status, reason, revoked_by, revoke_reason, created_at, updated_at
                 FROM assignments
                 WHERE firm_id = ?1 AND service_id = ?2
                 ORDER BY delegation_level ASC, created_at ASC",
            )
            .ctx("failed to prepare assignment list")?;
        let rows = stmt
            .query_map(params![firm_id.to_string(), service_id.to_string()], assignment_row)
            .ctx("failed to list assignments")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(parse_assignment(row.ctx("failed to read assignment row")?)?);
        }
        Ok(out)
    }

    fn history(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Vec<ServiceStatusHistory>, WorkflowError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT history_id, firm_id, service_id, from_status, to_status, action,
                        actor_id, actor_role, note, metadata_json, recorded_at,
                        prev_record_hash, record_hash
                 FROM status_history
                 WHERE firm_id = ?1 AND service_id = ?2
                 ORDER BY history_seq ASC",
            )
            .ctx("failed to prepare history query")?;
        let rows = stmt
            .query_map(params![firm_id.to_string(), service_id.to_string()], history_row)
            .ctx("failed to list history")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(parse_history(row.ctx("failed to read history row")?)?);
        }
        Ok(out)
    }

    fn last_history(
        &self,
        firm_id: FirmId,
        service_id: ServiceId,
    ) -> Result<Option<ServiceStatusHistory>, WorkflowError> {
        let row = self
            .conn
            .query_row(
                "SELECT history_id, firm_id, service_id, from_status, to_status, action,
                        actor_id, actor_role, note, metadata_json, recorded_at,
                        prev_record_hash, record_hash
                 FROM status_history
                 WHERE firm_id = ?1 AND service_id = ?2
                 ORDER BY history_seq DESC LIMIT 1",
                params![firm_id.to_string(), service_id.to_string()],
                history_row,
            )
            .optional()
            .ctx("failed to read last history record")?;
        row.map(parse_history).transpose()
    }

    fn insert_request(&self, request: &ServiceRequest) -> Result<(), WorkflowError> {
        self.conn
            .execute(
                "INSERT INTO service_requests(
                    request_id, firm_id, client_id, service_type, title, description,
                    urgency, preferred_due_at, status, reviewed_by, reviewed_at,
                    decision_note, quoted_fee_minor, attachments_json,
                    converted_service_id, version, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    request.request_id.to_string(),
                    request.firm_id.to_string(),
                    request.client_id.to_string(),
                    request.service_type.as_str(),
                    request.title,
                    request.description,
                    request.urgency.as_str(),
                    request.preferred_due_at.map(rfc3339).transpose()?,
                    request.status.as_str(),
                    request.reviewed_by,
                    request.reviewed_at.map(rfc3339).transpose()?,
                    request.decision_note,
                    request.quoted_fee_minor,
                    serde_json::to_string(&request.attachments)
                        .ctx("failed to encode attachments")?,
                    request.converted_service_id.map(|id| id.to_string()),
                    request.version,
                    rfc3339(request.created_at)?,
                    rfc3339(request.updated_at)?,
                ],
            )
            .ctx("failed to insert service request")?;
        Ok(())
    }

    fn get_request(
        &self,
        firm_id: FirmId,
        request_id: RequestId,
    ) -> Result<Option<ServiceRequest>, WorkflowError> {
        let row = self
            .conn
            .query_row(
                "SELECT request_id, firm_id, client_id, service_type, title, description,
                        urgency, preferred_due_at, status, reviewed_by, reviewed_at,
                        decision_note, quoted_fee_minor, attachments_json,
                        converted_service_id, version, created_at, updated_at
                 FROM service_requests WHERE firm_id = ?1 AND request_id = ?2",
                params![firm_id.to_string(), request_id.to_string()],
                request_row,
            )
            .optional()
            .ctx("failed to read service request")?;
        row.map(parse_request).transpose()
    }

    fn list_requests(&self, firm_id: FirmId) -> Result<Vec<ServiceRequest>, WorkflowError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT request_id, firm_id, client_id, service_type, title, description,
                        urgency, preferred_due_at, status, reviewed_by, reviewed_at,
                        decision_note, quoted_fee_minor, attachments_json,
                        converted_service_id, version, created_at, updated_at
                 FROM service_requests WHERE firm_id = ?1
                 ORDER BY created_at ASC, request_id ASC",
            )
            .ctx("failed to prepare request list")?;
        let rows = stmt
            .query_map(params![firm_id.to_string()], request_row)
            .ctx("failed to list service requests")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(parse_request(row.ctx("failed to read request row")?)?);
        }
        Ok(out)
    }

    fn apply_request_transition(&self, plan: &RequestTransitionPlan) -> Result<(), WorkflowError> {
        let tx = self
            .conn
            .unchecked_transaction()
            .ctx("failed to begin transaction")?;

        let changed = tx
            .execute(
                "UPDATE service_requests SET
                    status = ?5,
                    reviewed_by = COALESCE(?6, reviewed_by),
                    reviewed_at = COALESCE(?7, reviewed_at),
                    decision_note = COALESCE(?8, decision_note),
                    quoted_fee_minor = COALESCE(?9, quoted_fee_minor),
                    converted_service_id = COALESCE(?10, converted_service_id),
                    updated_at = ?11,
                    version = version + 1
                 WHERE firm_id = ?1 AND request_id = ?2
                   AND version = ?3 AND status = ?4",
                params![
                    plan.firm_id.to_string(),
                    plan.request_id.to_string(),
                    plan.expected_version,
                    plan.from_status.as_str(),
                    plan.to_status.as_str(),
                    plan.reviewed_by,
                    plan.reviewed_at.map(rfc3339).transpose()?,
                    plan.decision_note,
                    plan.quoted_fee_minor,
                    plan.converted_service_id.map(|id| id.to_string()),
                    rfc3339(plan.updated_at)?,
                ],
            )
            .ctx("failed to update service request")?;

        if changed == 0 {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT version FROM service_requests
                     WHERE firm_id = ?1 AND request_id = ?2",
                    params![plan.firm_id.to_string(), plan.request_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .ctx("failed to probe request version")?;
            return Err(match exists {
                Some(_) => WorkflowError::Conflict,
                None => WorkflowError::NotFound {
                    entity: "service_request",
                    id: plan.request_id.to_string(),
                },
            });
        }

        if let Some(new_service) = &plan.new_service {
            Self::insert_service_row(&tx, &new_service.service)?;
            Self::insert_history(&tx, &new_service.creation_history)?;
        }

        tx.commit().ctx("failed to commit request transition")?;
        Ok(())
    }
}

type ServiceRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<i64>,
    String,
    Option<String>,
    i64,
    String,
    String,
);

fn service_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServiceRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

fn parse_service(raw: ServiceRow) -> Result<Service, WorkflowError> {
    let (
        service_id,
        firm_id,
        client_id,
        service_type,
        status,
        origin,
        due_at,
        completed_at,
        fee_minor,
        notes,
        service_request_id,
        version,
        created_at,
        updated_at,
    ) = raw;
    Ok(Service {
        service_id: ServiceId(parse_ulid("service_id", &service_id)?),
        firm_id: FirmId(parse_ulid("firm_id", &firm_id)?),
        client_id: ClientId(parse_ulid("client_id", &client_id)?),
        service_type: parse_enum("service_type", &service_type, ServiceType::parse)?,
        status: parse_enum("status", &status, ServiceStatus::parse)?,
        origin: parse_enum("origin", &origin, ServiceOrigin::parse)?,
        due_at: due_at.as_deref().map(parse_rfc3339).transpose()?,
        completed_at: completed_at.as_deref().map(parse_rfc3339).transpose()?,
        fee_minor,
        notes,
        service_request_id: service_request_id
            .map(|value| parse_ulid("service_request_id", &value).map(RequestId))
            .transpose()?,
        version,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

type AssignmentRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn assignment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssignmentRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
    ))
}

fn parse_assignment(raw: AssignmentRow) -> Result<ServiceAssignment, WorkflowError> {
    let (
        assignment_id,
        firm_id,
        service_id,
        assignee_id,
        assignee_kind,
        assigned_by,
        delegation_level,
        previous_assignment_id,
        kind,
        status,
        reason,
        revoked_by,
        revoke_reason,
        created_at,
        updated_at,
    ) = raw;
    Ok(ServiceAssignment {
        assignment_id: AssignmentId(parse_ulid("assignment_id", &assignment_id)?),
        firm_id: FirmId(parse_ulid("firm_id", &firm_id)?),
        service_id: ServiceId(parse_ulid("service_id", &service_id)?),
        assignee_id,
        assignee_kind: parse_enum("assignee_kind", &assignee_kind, AssigneeKind::parse)?,
        assigned_by,
        delegation_level: u32::try_from(delegation_level).map_err(|_| {
            WorkflowError::Storage(format!("invalid delegation_level: {delegation_level}"))
        })?,
        previous_assignment_id: previous_assignment_id
            .map(|value| parse_ulid("previous_assignment_id", &value).map(AssignmentId))
            .transpose()?,
        kind: parse_enum("kind", &kind, AssignmentKind::parse)?,
        status: parse_enum("status", &status, AssignmentStatus::parse)?,
        reason,
        revoked_by,
        revoke_reason,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

type HistoryRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    String,
);

fn history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

fn parse_history(raw: HistoryRow) -> Result<ServiceStatusHistory, WorkflowError> {
    let (
        history_id,
        firm_id,
        service_id,
        from_status,
        to_status,
        action,
        actor_id,
        actor_role,
        note,
        metadata_json,
        recorded_at,
        prev_record_hash,
        record_hash,
    ) = raw;
    Ok(ServiceStatusHistory {
        history_id: HistoryId(parse_ulid("history_id", &history_id)?),
        firm_id: FirmId(parse_ulid("firm_id", &firm_id)?),
        service_id: ServiceId(parse_ulid("service_id", &service_id)?),
        from_status: from_status
            .map(|value| parse_enum("from_status", &value, ServiceStatus::parse))
            .transpose()?,
        to_status: parse_enum("to_status", &to_status, ServiceStatus::parse)?,
        action,
        actor_id,
        actor_role: parse_enum("actor_role", &actor_role, ActorRole::parse)?,
        note,
        metadata: serde_json::from_str(&metadata_json).ctx("invalid metadata_json")?,
        recorded_at: parse_rfc3339(&recorded_at)?,
        prev_record_hash,
        record_hash,
    })
}

type RequestRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i64>,
    String,
    Option<String>,
    i64,
    String,
    String,
);

fn request_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
        row.get(16)?,
        row.get(17)?,
    ))
}

fn parse_request(raw: RequestRow) -> Result<ServiceRequest, WorkflowError> {
    let (
        request_id,
        firm_id,
        client_id,
        service_type,
        title,
        description,
        urgency,
        preferred_due_at,
        status,
        reviewed_by,
        reviewed_at,
        decision_note,
        quoted_fee_minor,
        attachments_json,
        converted_service_id,
        version,
        created_at,
        updated_at,
    ) = raw;
    Ok(ServiceRequest {
        request_id: RequestId(parse_ulid("request_id", &request_id)?),
        firm_id: FirmId(parse_ulid("firm_id", &firm_id)?),
        client_id: ClientId(parse_ulid("client_id", &client_id)?),
        service_type: parse_enum("service_type", &service_type, ServiceType::parse)?,
        title,
        description,
        urgency: parse_enum("urgency", &urgency, Urgency::parse)?,
        preferred_due_at: preferred_due_at.as_deref().map(parse_rfc3339).transpose()?,
        status: parse_enum("status", &status, RequestStatus::parse)?,
        reviewed_by,
        reviewed_at: reviewed_at.as_deref().map(parse_rfc3339).transpose()?,
        decision_note,
        quoted_fee_minor,
        attachments: serde_json::from_str(&attachments_json).ctx("invalid attachments_json")?,
        converted_service_id: converted_service_id
            .map(|value| parse_ulid("converted_service_id", &value).map(ServiceId))
            .transpose()?,
        version,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

fn parse_ulid(field: &str, value: &str) -> Result<Ulid, WorkflowError> {
    Ulid::from_str(value)
        .map_err(|err| WorkflowError::Storage(format!("invalid {field} ULID: {err}")))
}

fn parse_enum<T>(
    field: &str,
    value: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, WorkflowError> {
    parse(value).ok_or_else(|| WorkflowError::Storage(format!("unknown {field}: {value}")))
}

fn rfc3339(value: DateTimeUtc) -> Result<String, WorkflowError> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| WorkflowError::Storage(format!("invalid datetime format: {err}")))
}

fn parse_rfc3339(value: &str) -> Result<DateTimeUtc, WorkflowError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| WorkflowError::Storage(format!("invalid RFC3339 datetime: {err}")))
}

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use serviceflow_domain::{
    ActionInput, Actor, ActorRole, AssigneeKind, AssigneeRef, AssignmentId, ClientId, FirmId,
    RequestId, ServiceId, ServiceOrigin, ServiceType, Urgency, WorkflowAction, WorkflowError,
};
use serviceflow_engine::{verify_history, RequestDraft, ServiceDraft, TransitionEngine};
use serviceflow_store_core::WorkflowStore;
use serviceflow_store_sqlite::SqliteWorkflowStore;
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "sfw")]
#[command(about = "Service lifecycle workflows with a SQLite audit trail")]
struct Cli {
    /// Path to the workflow database.
    #[arg(long)]
    db: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply the schema; safe to run repeatedly.
    Migrate,
    #[command(subcommand)]
    Service(ServiceCommand),
    #[command(subcommand)]
    Assignment(AssignmentCommand),
    #[command(subcommand)]
    Request(RequestCommand),
}

#[derive(Debug, Args)]
struct ActorArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    role: String,
}

impl ActorArgs {
    fn resolve(&self) -> Result<Actor> {
        let role = ActorRole::parse(&self.role)
            .ok_or_else(|| anyhow!("invalid role '{}'", self.role))?;
        Ok(Actor {
            actor_id: self.actor.clone(),
            role,
        })
    }
}

#[derive(Debug, Subcommand)]
enum ServiceCommand {
    /// Create a firm-originated service.
    New {
        #[arg(long)]
        firm: String,
        #[arg(long)]
        client: String,
        #[arg(long)]
        service_type: String,
        #[arg(long, default_value = "firm_created")]
        origin: String,
        #[arg(long)]
        due: Option<String>,
        #[arg(long)]
        fee_minor: Option<i64>,
        #[arg(long, default_value = "")]
        notes: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    Show {
        #[arg(long)]
        firm: String,
        #[arg(long)]
        service: String,
    },
    List {
        #[arg(long)]
        firm: String,
    },
    /// Apply one workflow action from the transition table.
    Transition {
        #[arg(long)]
        firm: String,
        #[arg(long)]
        service: String,
        #[arg(long)]
        action: String,
        #[arg(long)]
        note: Option<String>,
        #[arg(long)]
        assignee: Option<String>,
        #[arg(long, default_value = "employee")]
        assignee_kind: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    /// Record the external billing event (DELIVERED -> INVOICED).
    Invoice {
        #[arg(long)]
        firm: String,
        #[arg(long)]
        service: String,
        #[arg(long)]
        reference: Option<String>,
        #[command(flatten)]
        actor: ActorArgs,
    },
    /// Print the audit trail; `--verify` recomputes the hash chain.
    History {
        #[arg(long)]
        firm: String,
        #[arg(long)]
        service: String,
        #[arg(long, default_value_t = false)]
        verify: bool,
    },
}

#[derive(Debug, Subcommand)]
enum AssignmentCommand {
    List {
        #[arg(long)]
        firm: String,
        #[arg(long)]
        service: String,
    },
    /// Walk an assignment's provenance back to the initial assignment.
    Chain {
        #[arg(long)]
        firm: String,
        #[arg(long)]
        assignment: String,
    },
    Revoke {
        #[arg(long)]
        firm: String,
        #[arg(long)]
        assignment: String,
        #[arg(long)]
        reason: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    Reassign {
        #[arg(long)]
        firm: String,
        #[arg(long)]
        service: String,
        #[arg(long)]
        assignee: String,
        #[arg(long, default_value = "employee")]
        assignee_kind: String,
        #[arg(long)]
        reason: Option<String>,
        #[command(flatten)]
        actor: ActorArgs,
    },
    TakeBack {
        #[arg(long)]
        firm: String,
        #[arg(long)]
        service: String,
        #[arg(long)]
        reason: Option<String>,
        #[command(flatten)]
        actor: ActorArgs,
    },
}

#[derive(Debug, Subcommand)]
enum RequestCommand {
    /// File a client service request.
    Submit {
        #[arg(long)]
        firm: String,
        #[arg(long)]
        client: String,
        #[arg(long)]
        service_type: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "normal")]
        urgency: String,
        #[arg(long)]
        preferred_due: Option<String>,
        #[arg(long = "attachment")]
        attachments: Vec<String>,
        #[command(flatten)]
        actor: ActorArgs,
    },
    OpenReview {
        #[arg(long)]
        firm: String,
        #[arg(long)]
        request: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    /// Approve and convert: writes the request and the new service together.
    Approve {
        #[arg(long)]
        firm: String,
        #[arg(long)]
        request: String,
        #[arg(long)]
        fee_minor: Option<i64>,
        #[arg(long)]
        note: Option<String>,
        #[command(flatten)]
        actor: ActorArgs,
    },
    Reject {
        #[arg(long)]
        firm: String,
        #[arg(long)]
        request: String,
        #[arg(long)]
        note: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    Cancel {
        #[arg(long)]
        firm: String,
        #[arg(long)]
        request: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    List {
        #[arg(long)]
        firm: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match dispatch(&cli) {
        Ok(()) => Ok(()),
        Err(err) => match err.downcast_ref::<WorkflowError>() {
            Some(workflow) => {
                println!(
                    "{}",
                    serde_json::to_string(&json!({
                        "error": {
                            "kind": workflow.kind().as_str(),
                            "message": workflow.to_string(),
                        }
                    }))?
                );
                std::process::exit(1);
            }
            None => Err(err),
        },
    }
}

fn dispatch(cli: &Cli) -> Result<()> {
    let store = SqliteWorkflowStore::open(&cli.db)?;
    store.migrate()?;
    let engine = TransitionEngine::new(&store);

    match &cli.command {
        Commands::Migrate => {
            println!("{}", serde_json::to_string(&json!({ "migrated": true }))?);
        }
        Commands::Service(command) => service_command(&engine, command)?,
        Commands::Assignment(command) => assignment_command(&engine, command)?,
        Commands::Request(command) => request_command(&engine, command)?,
    }
    Ok(())
}

fn service_command(
    engine: &TransitionEngine<&SqliteWorkflowStore>,
    command: &ServiceCommand,
) -> Result<()> {
    match command {
        ServiceCommand::New {
            firm,
            client,
            service_type,
            origin,
            due,
            fee_minor,
            notes,
            actor,
        } => {
            let draft = ServiceDraft {
                firm_id: FirmId(parse_ulid("firm", firm)?),
                client_id: ClientId(parse_ulid("client", client)?),
                service_type: parse_service_type(service_type)?,
                origin: parse_origin(origin)?,
                due_at: due.as_deref().map(parse_rfc3339).transpose()?,
                fee_minor: *fee_minor,
                notes: notes.clone(),
            };
            let service = engine.create_service(&draft, &actor.resolve()?)?;
            println!("{}", serde_json::to_string(&service)?);
        }
        ServiceCommand::Show { firm, service } => {
            let firm_id = FirmId(parse_ulid("firm", firm)?);
            let service_id = ServiceId(parse_ulid("service", service)?);
            let service = engine
                .store()
                .get_service(firm_id, service_id)?
                .ok_or(WorkflowError::NotFound {
                    entity: "service",
                    id: service_id.to_string(),
                })?;
            println!("{}", serde_json::to_string(&service)?);
        }
        ServiceCommand::List { firm } => {
            let firm_id = FirmId(parse_ulid("firm", firm)?);
            for service in engine.store().list_services(firm_id)? {
                println!("{}", serde_json::to_string(&service)?);
            }
        }
        ServiceCommand::Transition {
            firm,
            service,
            action,
            note,
            assignee,
            assignee_kind,
            actor,
        } => {
            let firm_id = FirmId(parse_ulid("firm", firm)?);
            let service_id = ServiceId(parse_ulid("service", service)?);
            let action = WorkflowAction::parse(action)
                .ok_or_else(|| anyhow!("invalid action '{action}'"))?;
            let input = ActionInput {
                note: note.clone(),
                assignee: assignee
                    .as_ref()
                    .map(|id| {
                        Ok::<_, anyhow::Error>(AssigneeRef {
                            assignee_id: id.clone(),
                            kind: parse_assignee_kind(assignee_kind)?,
                        })
                    })
                    .transpose()?,
            };
            let outcome = engine.attempt(firm_id, service_id, &actor.resolve()?, action, &input)?;
            println!(
                "{}",
                serde_json::to_string(&json!({
                    "service": outcome.service,
                    "assignment": outcome.assignment,
                    "history": outcome.history,
                }))?
            );
        }
        ServiceCommand::Invoice {
            firm,
            service,
            reference,
            actor,
        } => {
            let firm_id = FirmId(parse_ulid("firm", firm)?);
            let service_id = ServiceId(parse_ulid("service", service)?);
            let outcome = engine.record_invoice_issued(
                firm_id,
                service_id,
                &actor.resolve()?,
                reference.as_deref(),
            )?;
            println!(
                "{}",
                serde_json::to_string(&json!({
                    "service": outcome.service,
                    "history": outcome.history,
                }))?
            );
        }
        ServiceCommand::History {
            firm,
            service,
            verify,
        } => {
            let firm_id = FirmId(parse_ulid("firm", firm)?);
            let service_id = ServiceId(parse_ulid("service", service)?);
            let history = engine.store().history(firm_id, service_id)?;
            for record in &history {
                println!("{}", serde_json::to_string(record)?);
            }
            if *verify {
                let report = verify_history(&history);
                println!("{}", serde_json::to_string(&report)?);
            }
        }
    }
    Ok(())
}

fn assignment_command(
    engine: &TransitionEngine<&SqliteWorkflowStore>,
    command: &AssignmentCommand,
) -> Result<()> {
    match command {
        AssignmentCommand::List { firm, service } => {
            let firm_id = FirmId(parse_ulid("firm", firm)?);
            let service_id = ServiceId(parse_ulid("service", service)?);
            for assignment in engine.store().list_assignments(firm_id, service_id)? {
                println!("{}", serde_json::to_string(&assignment)?);
            }
        }
        AssignmentCommand::Chain { firm, assignment } => {
            let firm_id = FirmId(parse_ulid("firm", firm)?);
            let assignment_id = AssignmentId(parse_ulid("assignment", assignment)?);
            for link in engine.delegation_chain(firm_id, assignment_id)? {
                println!("{}", serde_json::to_string(&link)?);
            }
        }
        AssignmentCommand::Revoke {
            firm,
            assignment,
            reason,
            actor,
        } => {
            let firm_id = FirmId(parse_ulid("firm", firm)?);
            let assignment_id = AssignmentId(parse_ulid("assignment", assignment)?);
            let revoked =
                engine.revoke_assignment(firm_id, assignment_id, &actor.resolve()?, reason)?;
            println!("{}", serde_json::to_string(&revoked)?);
        }
        AssignmentCommand::Reassign {
            firm,
            service,
            assignee,
            assignee_kind,
            reason,
            actor,
        } => {
            let firm_id = FirmId(parse_ulid("firm", firm)?);
            let service_id = ServiceId(parse_ulid("service", service)?);
            let to = AssigneeRef {
                assignee_id: assignee.clone(),
                kind: parse_assignee_kind(assignee_kind)?,
            };
            let outcome =
                engine.reassign(firm_id, service_id, &actor.resolve()?, &to, reason.as_deref())?;
            println!(
                "{}",
                serde_json::to_string(&json!({
                    "service": outcome.service,
                    "assignment": outcome.assignment,
                }))?
            );
        }
        AssignmentCommand::TakeBack {
            firm,
            service,
            reason,
            actor,
        } => {
            let firm_id = FirmId(parse_ulid("firm", firm)?);
            let service_id = ServiceId(parse_ulid("service", service)?);
            let outcome =
                engine.take_back(firm_id, service_id, &actor.resolve()?, reason.as_deref())?;
            println!(
                "{}",
                serde_json::to_string(&json!({
                    "service": outcome.service,
                    "assignment": outcome.assignment,
                }))?
            );
        }
    }
    Ok(())
}

fn request_command(
    engine: &TransitionEngine<&SqliteWorkflowStore>,
    command: &RequestCommand,
) -> Result<()> {
    match command {
        RequestCommand::Submit {
            firm,
            client,
            service_type,
            title,
            description,
            urgency,
            preferred_due,
            attachments,
            actor,
        } => {
            let draft = RequestDraft {
                firm_id: FirmId(parse_ulid("firm", firm)?),
                client_id: ClientId(parse_ulid("client", client)?),
                service_type: parse_service_type(service_type)?,
                title: title.clone(),
                description: description.clone(),
                urgency: Urgency::parse(urgency)
                    .ok_or_else(|| anyhow!("invalid urgency '{urgency}'"))?,
                preferred_due_at: preferred_due.as_deref().map(parse_rfc3339).transpose()?,
                attachments: attachments.clone(),
            };
            let request = engine.submit_request(&draft, &actor.resolve()?)?;
            println!("{}", serde_json::to_string(&request)?);
        }
        RequestCommand::OpenReview {
            firm,
            request,
            actor,
        } => {
            let firm_id = FirmId(parse_ulid("firm", firm)?);
            let request_id = RequestId(parse_ulid("request", request)?);
            let request = engine.open_review(firm_id, request_id, &actor.resolve()?)?;
            println!("{}", serde_json::to_string(&request)?);
        }
        RequestCommand::Approve {
            firm,
            request,
            fee_minor,
            note,
            actor,
        } => {
            let firm_id = FirmId(parse_ulid("firm", firm)?);
            let request_id = RequestId(parse_ulid("request", request)?);
            let (request, service) = engine.approve_request(
                firm_id,
                request_id,
                &actor.resolve()?,
                *fee_minor,
                note.as_deref(),
            )?;
            println!(
                "{}",
                serde_json::to_string(&json!({
                    "request": request,
                    "service": service,
                }))?
            );
        }
        RequestCommand::Reject {
            firm,
            request,
            note,
            actor,
        } => {
            let firm_id = FirmId(parse_ulid("firm", firm)?);
            let request_id = RequestId(parse_ulid("request", request)?);
            let request = engine.reject_request(firm_id, request_id, &actor.resolve()?, note)?;
            println!("{}", serde_json::to_string(&request)?);
        }
        RequestCommand::Cancel {
            firm,
            request,
            actor,
        } => {
            let firm_id = FirmId(parse_ulid("firm", firm)?);
            let request_id = RequestId(parse_ulid("request", request)?);
            let request = engine.cancel_request(firm_id, request_id, &actor.resolve()?)?;
            println!("{}", serde_json::to_string(&request)?);
        }
        RequestCommand::List { firm } => {
            let firm_id = FirmId(parse_ulid("firm", firm)?);
            for request in engine.store().list_requests(firm_id)? {
                println!("{}", serde_json::to_string(&request)?);
            }
        }
    }
    Ok(())
}

fn parse_ulid(label: &str, input: &str) -> Result<Ulid> {
    Ulid::from_str(input).map_err(|err| anyhow!("invalid {label} ULID: {err}"))
}

fn parse_service_type(input: &str) -> Result<ServiceType> {
    ServiceType::parse(input).ok_or_else(|| anyhow!("invalid service_type '{input}'"))
}

fn parse_origin(input: &str) -> Result<ServiceOrigin> {
    ServiceOrigin::parse(input).ok_or_else(|| anyhow!("invalid origin '{input}'"))
}

fn parse_assignee_kind(input: &str) -> Result<AssigneeKind> {
    AssigneeKind::parse(input).ok_or_else(|| anyhow!("invalid assignee kind '{input}'"))
}

fn parse_rfc3339(input: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(input, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 timestamp: {err}"))
}

//! `whm`: command surface over the warehouse store.
//!
//! Every successful command prints one JSON document on stdout. Failures
//! print an [`ErrorEnvelope`] on stderr and exit with the code returned by
//! [`exit_code`]. Hosts can embed the same behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_settings`] to execute a command against configured storage.
//! - [`run_command`] to execute against an already opened store.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{json, Value};
use warehouse_core::access::{Principal, Role};
use warehouse_core::audit::{AuditEventType, AuditFilter, EntityType};
use warehouse_core::config::WarehouseSettings;
use warehouse_core::flow::{GraphSchema, NewFlow};
use warehouse_core::genealogy::NewGenealogyLink;
use warehouse_core::inventory::{
    BufferType, BufferUpdate, InventoryFilter, LotStatus, LotType, MoveFilter, MoveRequest,
    MoveType, NewBuffer, NewLot,
};
use warehouse_core::quality::{
    Decision, InspectionFilter, MeasurementType, NewInspection, NewQcDecision,
    NewTemperatureReading, TemperatureFilter,
};
use warehouse_core::run::{NewRun, RunStatus, RunTransition};
use warehouse_core::{
    BufferId, FlowDefinitionId, FlowVersionId, IdempotencyKey, InspectionId, LotId, Page,
    Quantity, RunId, TemperatureLogId, WarehouseError,
};
use warehouse_store_sqlite::{SqliteWarehouseStore, StoreOptions};

mod output;
mod settings;
mod telemetry;

pub use output::{exit_code, report_failure, ErrorEnvelope};
pub use settings::load_settings;
pub use telemetry::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "whm")]
#[command(about = "Warehouse production, inventory, and traceability CLI")]
pub struct Cli {
    /// `SQLite` database path; overrides `database_path` from settings.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Settings file (TOML). Defaults to ./warehouse.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// User id recorded on audit events.
    #[arg(long, global = true, default_value = "cli")]
    actor: String,

    #[arg(long, global = true, value_enum, default_value_t = RoleArg::Operator)]
    role: RoleArg,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn principal(&self) -> Principal {
        Principal::new(self.actor.clone(), self.role.into())
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Run {
        #[command(subcommand)]
        command: Box<RunCommand>,
    },
    Lot {
        #[command(subcommand)]
        command: Box<LotCommand>,
    },
    Buffer {
        #[command(subcommand)]
        command: Box<BufferCommand>,
    },
    Inventory {
        #[command(subcommand)]
        command: Box<InventoryCommand>,
    },
    Qc {
        #[command(subcommand)]
        command: Box<QcCommand>,
    },
    Temperature {
        #[command(subcommand)]
        command: Box<TemperatureCommand>,
    },
    Genealogy {
        #[command(subcommand)]
        command: Box<GenealogyCommand>,
    },
    Flow {
        #[command(subcommand)]
        command: Box<FlowCommand>,
    },
    Audit {
        #[command(subcommand)]
        command: Box<AuditCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    /// Applies pending migrations and reports the schema version.
    Migrate,
    /// Reports the schema version without migrating.
    Status,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Prints the effective settings with the secret redacted.
    Check,
}

#[derive(Debug, Args)]
pub struct PageArgs {
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long)]
    offset: Option<u32>,
}

impl PageArgs {
    fn page(&self) -> Result<Page> {
        Ok(Page::new(self.limit, self.offset, Page::default().limit)?)
    }
}

#[derive(Debug, Subcommand)]
pub enum RunCommand {
    Create(RunCreateArgs),
    Start(RunIdArgs),
    Advance(RunIdArgs),
    Hold(RunReasonArgs),
    Resume(RunResumeArgs),
    Complete(RunIdArgs),
    Abort(RunReasonArgs),
    Get(RunIdArgs),
    List(RunListArgs),
    Steps(RunIdArgs),
}

#[derive(Debug, Args)]
pub struct RunCreateArgs {
    #[arg(long)]
    flow_version_id: String,
    /// Reusing a key returns the run it created.
    #[arg(long)]
    idempotency_key: String,
}

#[derive(Debug, Args)]
pub struct RunIdArgs {
    run_id: String,
}

#[derive(Debug, Args)]
pub struct RunReasonArgs {
    run_id: String,
    #[arg(long)]
    reason: String,
}

#[derive(Debug, Args)]
pub struct RunResumeArgs {
    run_id: String,
    #[arg(long)]
    resolution: String,
}

#[derive(Debug, Args)]
pub struct RunListArgs {
    #[arg(long)]
    status: Option<String>,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Debug, Subcommand)]
pub enum LotCommand {
    Create(LotCreateArgs),
    Status(LotStatusArgs),
    Get(LotGetArgs),
    List(LotListArgs),
}

#[derive(Debug, Args)]
pub struct LotCreateArgs {
    #[arg(long)]
    code: String,
    #[arg(long)]
    lot_type: String,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    step: Option<u8>,
    #[arg(long)]
    weight_kg: Option<String>,
    #[arg(long, allow_negative_numbers = true)]
    temperature_c: Option<f64>,
    #[arg(long, default_value = "{}")]
    metadata_json: String,
}

#[derive(Debug, Args)]
pub struct LotStatusArgs {
    lot_id: String,
    #[arg(long)]
    to: String,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("lookup").required(true).args(["lot_id", "code"])))]
pub struct LotGetArgs {
    lot_id: Option<String>,
    #[arg(long)]
    code: Option<String>,
}

#[derive(Debug, Args)]
pub struct LotListArgs {
    #[arg(long)]
    run_id: Option<String>,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Debug, Subcommand)]
pub enum BufferCommand {
    Create(BufferCreateArgs),
    Update(BufferUpdateArgs),
    Get(BufferIdArgs),
    List(BufferListArgs),
}

#[derive(Debug, Args)]
pub struct BufferCreateArgs {
    #[arg(long)]
    code: String,
    #[arg(long)]
    buffer_type: String,
    /// Lot type accepted by the buffer; repeat for several.
    #[arg(long = "allow", required = true)]
    allowed_lot_types: Vec<String>,
    #[arg(long)]
    capacity_kg: String,
    #[arg(long, allow_negative_numbers = true)]
    temp_min_c: f64,
    #[arg(long, allow_negative_numbers = true)]
    temp_max_c: f64,
}

#[derive(Debug, Args)]
pub struct BufferUpdateArgs {
    buffer_id: String,
    #[arg(long)]
    capacity_kg: Option<String>,
    #[arg(long, allow_negative_numbers = true)]
    temp_min_c: Option<f64>,
    #[arg(long, allow_negative_numbers = true)]
    temp_max_c: Option<f64>,
    #[arg(long)]
    active: Option<bool>,
}

#[derive(Debug, Args)]
pub struct BufferIdArgs {
    buffer_id: String,
}

#[derive(Debug, Args)]
pub struct BufferListArgs {
    #[arg(long)]
    buffer_type: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum InventoryCommand {
    Receive(ReceiveArgs),
    Transfer(TransferArgs),
    Consume(WithdrawArgs),
    Ship(WithdrawArgs),
    List(InventoryListArgs),
    Moves(MoveListArgs),
}

#[derive(Debug, Args)]
pub struct ReceiveArgs {
    #[arg(long)]
    lot_id: String,
    #[arg(long)]
    to_buffer_id: String,
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    quantity_kg: String,
    #[arg(long)]
    idempotency_key: String,
}

#[derive(Debug, Args)]
pub struct TransferArgs {
    #[arg(long)]
    lot_id: String,
    #[arg(long)]
    from_buffer_id: String,
    #[arg(long)]
    to_buffer_id: String,
    #[arg(long)]
    quantity_kg: String,
    #[arg(long)]
    idempotency_key: String,
}

#[derive(Debug, Args)]
pub struct WithdrawArgs {
    #[arg(long)]
    lot_id: String,
    #[arg(long)]
    from_buffer_id: String,
    #[arg(long)]
    quantity_kg: String,
    #[arg(long)]
    idempotency_key: String,
}

#[derive(Debug, Args)]
pub struct InventoryListArgs {
    #[arg(long)]
    buffer_id: Option<String>,
    #[arg(long)]
    lot_id: Option<String>,
    /// Also list items whose stock has left the buffer.
    #[arg(long)]
    include_exited: bool,
}

#[derive(Debug, Args)]
pub struct MoveListArgs {
    #[arg(long)]
    lot_id: Option<String>,
    #[arg(long)]
    buffer_id: Option<String>,
    #[arg(long)]
    move_type: Option<String>,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Debug, Subcommand)]
pub enum QcCommand {
    Inspect(InspectArgs),
    Get(InspectionIdArgs),
    List(InspectionListArgs),
    /// Records a gate decision outside the step-indexed inspection flow.
    Decide(DecideArgs),
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    lot_id: String,
    #[arg(long)]
    step: u8,
    #[arg(long)]
    inspection_type: String,
    #[arg(long)]
    decision: String,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long)]
    ccp: bool,
    #[arg(long)]
    idempotency_key: String,
}

#[derive(Debug, Args)]
pub struct InspectionIdArgs {
    inspection_id: String,
}

#[derive(Debug, Args)]
pub struct InspectionListArgs {
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    lot_id: Option<String>,
    #[arg(long)]
    step: Option<u8>,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Debug, Args)]
pub struct DecideArgs {
    #[arg(long)]
    lot_id: Option<String>,
    #[arg(long)]
    gate_id: Option<String>,
    #[arg(long)]
    decision: String,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long, allow_negative_numbers = true)]
    temperature_c: Option<f64>,
    #[arg(long)]
    signature: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum TemperatureCommand {
    Log(TemperatureLogArgs),
    Get(TemperatureIdArgs),
    List(TemperatureListArgs),
}

#[derive(Debug, Args)]
pub struct TemperatureLogArgs {
    #[arg(long, allow_negative_numbers = true)]
    value_c: f64,
    #[arg(long)]
    measurement: String,
    #[arg(long)]
    lot_id: Option<String>,
    #[arg(long)]
    buffer_id: Option<String>,
    #[arg(long)]
    inspection_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct TemperatureIdArgs {
    log_id: String,
}

#[derive(Debug, Args)]
pub struct TemperatureListArgs {
    #[arg(long)]
    lot_id: Option<String>,
    #[arg(long)]
    buffer_id: Option<String>,
    #[arg(long)]
    inspection_id: Option<String>,
    #[arg(long)]
    violations_only: bool,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Debug, Subcommand)]
pub enum GenealogyCommand {
    Link(LinkArgs),
    Parents(LineageArgs),
    Children(LineageArgs),
    Tree(LineageArgs),
    /// Full ancestor/descendant trace by lot code, cached.
    Trace(TraceArgs),
}

#[derive(Debug, Args)]
pub struct LinkArgs {
    #[arg(long)]
    parent_lot_id: String,
    #[arg(long)]
    child_lot_id: String,
    #[arg(long)]
    quantity_kg: Option<String>,
}

#[derive(Debug, Args)]
pub struct LineageArgs {
    lot_id: String,
    #[arg(long)]
    depth: Option<u8>,
}

#[derive(Debug, Args)]
pub struct TraceArgs {
    lot_code: String,
    #[arg(long)]
    refresh: bool,
}

#[derive(Debug, Subcommand)]
pub enum FlowCommand {
    Create(FlowCreateArgs),
    Update(FlowUpdateArgs),
    Submit(VersionIdArgs),
    Publish(VersionIdArgs),
    Fork(VersionIdArgs),
    Deprecate(VersionIdArgs),
    Get(FlowIdArgs),
    List(PageArgs),
    Versions(FlowIdArgs),
    Version(VersionIdArgs),
    Draft(FlowIdArgs),
}

#[derive(Debug, Args)]
pub struct FlowCreateArgs {
    /// Localized name as `LOCALE=LABEL`; repeat per locale.
    #[arg(long = "name", required = true)]
    names: Vec<String>,
    #[arg(long)]
    description: Option<String>,
}

#[derive(Debug, Args)]
pub struct FlowUpdateArgs {
    version_id: String,
    /// JSON file holding `{nodes, edges, viewport}`.
    #[arg(long)]
    graph_file: PathBuf,
}

#[derive(Debug, Args)]
pub struct FlowIdArgs {
    flow_id: String,
}

#[derive(Debug, Args)]
pub struct VersionIdArgs {
    version_id: String,
}

#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    List(AuditListArgs),
    Get(AuditGetArgs),
    Trail(AuditTrailArgs),
}

#[derive(Debug, Args)]
pub struct AuditListArgs {
    #[arg(long)]
    entity_type: Option<String>,
    #[arg(long)]
    entity_id: Option<String>,
    #[arg(long)]
    event_type: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Debug, Args)]
pub struct AuditGetArgs {
    event_id: i64,
}

#[derive(Debug, Args)]
pub struct AuditTrailArgs {
    #[arg(long)]
    entity_type: String,
    #[arg(long)]
    entity_id: String,
    #[arg(long, default_value_t = 100)]
    limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RoleArg {
    Admin,
    Manager,
    Auditor,
    Operator,
    Viewer,
}

impl From<RoleArg> for Role {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Admin => Role::Admin,
            RoleArg::Manager => Role::Manager,
            RoleArg::Auditor => Role::Auditor,
            RoleArg::Operator => Role::Operator,
            RoleArg::Viewer => Role::Viewer,
        }
    }
}

/// Executes the parsed top-level CLI command graph and prints its output.
///
/// # Errors
/// Returns an error when settings are invalid, storage cannot be opened or
/// migrated, or the command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    telemetry::init(cli.log_format);
    let settings = load_settings(cli.config.as_deref(), cli.db.as_deref())?;
    let actor = cli.principal();

    let value = match cli.command {
        Command::Config {
            command: ConfigCommand::Check,
        } => to_json(&settings.redacted())?,
        command => run_with_settings(&settings, &actor, command)?,
    };
    output::print_json(&value)
}

/// Opens the configured database and executes `command` against it.
///
/// Every command except `db status` migrates first.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_with_settings(
    settings: &WarehouseSettings,
    actor: &Principal,
    command: Command,
) -> Result<Value> {
    let mut store = SqliteWarehouseStore::open(&settings.database_path)?
        .with_options(StoreOptions::from(settings));
    if !matches!(
        command,
        Command::Db {
            command: DbCommand::Status
        }
    ) {
        store.migrate()?;
    }
    run_command(command, &mut store, actor)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when argument parsing, validation, authorization, or
/// persistence fails.
pub fn run_command(
    command: Command,
    store: &mut SqliteWarehouseStore,
    actor: &Principal,
) -> Result<Value> {
    match command {
        Command::Db { command } => run_db(&command, store),
        Command::Config { .. } => Err(anyhow!(
            "internal dispatch error: config commands are handled before store initialization"
        )),
        Command::Run { command } => run_runs(*command, store, actor),
        Command::Lot { command } => run_lots(*command, store, actor),
        Command::Buffer { command } => run_buffers(*command, store, actor),
        Command::Inventory { command } => run_inventory(*command, store, actor),
        Command::Qc { command } => run_qc(*command, store, actor),
        Command::Temperature { command } => run_temperature(*command, store, actor),
        Command::Genealogy { command } => run_genealogy(*command, store, actor),
        Command::Flow { command } => run_flows(*command, store, actor),
        Command::Audit { command } => run_audit(*command, store),
    }
}

fn run_db(command: &DbCommand, store: &SqliteWarehouseStore) -> Result<Value> {
    match command {
        DbCommand::Migrate => {
            store.migrate()?;
            to_json(&store.schema_status()?)
        }
        DbCommand::Status => to_json(&store.schema_status()?),
    }
}

fn run_runs(
    command: RunCommand,
    store: &mut SqliteWarehouseStore,
    actor: &Principal,
) -> Result<Value> {
    match command {
        RunCommand::Create(args) => {
            let new = NewRun {
                flow_version_id: FlowVersionId::parse(&args.flow_version_id)?,
                idempotency_key: IdempotencyKey::parse(&args.idempotency_key)?,
            };
            to_json(&store.create_run(actor, &new)?)
        }
        RunCommand::Start(args) => transition(store, actor, &args.run_id, &RunTransition::Start),
        RunCommand::Advance(args) => {
            transition(store, actor, &args.run_id, &RunTransition::Advance)
        }
        RunCommand::Hold(args) => transition(
            store,
            actor,
            &args.run_id,
            &RunTransition::Hold {
                reason: args.reason,
            },
        ),
        RunCommand::Resume(args) => transition(
            store,
            actor,
            &args.run_id,
            &RunTransition::Resume {
                resolution: args.resolution,
            },
        ),
        RunCommand::Complete(args) => {
            transition(store, actor, &args.run_id, &RunTransition::Complete)
        }
        RunCommand::Abort(args) => transition(
            store,
            actor,
            &args.run_id,
            &RunTransition::Abort {
                reason: args.reason,
            },
        ),
        RunCommand::Get(args) => to_json(&store.get_run(RunId::parse(&args.run_id)?)?),
        RunCommand::List(args) => {
            let status = args
                .status
                .as_deref()
                .map(|raw| parse_code("run status", raw, RunStatus::parse))
                .transpose()?;
            to_json(&store.list_runs(status, args.page.page()?)?)
        }
        RunCommand::Steps(args) => {
            to_json(&store.list_step_executions(RunId::parse(&args.run_id)?)?)
        }
    }
}

fn transition(
    store: &mut SqliteWarehouseStore,
    actor: &Principal,
    run_id: &str,
    transition: &RunTransition,
) -> Result<Value> {
    let run_id = RunId::parse(run_id)?;
    to_json(&store.transition_run(actor, run_id, transition)?)
}

fn run_lots(
    command: LotCommand,
    store: &mut SqliteWarehouseStore,
    actor: &Principal,
) -> Result<Value> {
    match command {
        LotCommand::Create(args) => {
            let new = NewLot {
                lot_code: args.code,
                lot_type: parse_code("lot type", &args.lot_type, LotType::parse)?,
                production_run_id: optional_id(args.run_id.as_deref(), RunId::parse)?,
                step_index: args.step,
                weight_kg: args
                    .weight_kg
                    .as_deref()
                    .map(Quantity::from_kg_str)
                    .transpose()?,
                temperature_c: args.temperature_c,
                metadata: parse_json_arg("metadata_json", &args.metadata_json)?,
            };
            to_json(&store.create_lot(actor, &new)?)
        }
        LotCommand::Status(args) => {
            let status = parse_code("lot status", &args.to, LotStatus::parse)?;
            to_json(&store.set_lot_status(actor, LotId::parse(&args.lot_id)?, status)?)
        }
        LotCommand::Get(args) => match (args.lot_id, args.code) {
            (Some(raw), _) => to_json(&store.get_lot(LotId::parse(&raw)?)?),
            (None, Some(code)) => to_json(&store.get_lot_by_code(&code)?),
            (None, None) => Err(WarehouseError::Validation(
                "either a lot id or --code is required".to_string(),
            )
            .into()),
        },
        LotCommand::List(args) => to_json(&store.list_lots(
            optional_id(args.run_id.as_deref(), RunId::parse)?,
            args.page.page()?,
        )?),
    }
}

fn run_buffers(
    command: BufferCommand,
    store: &mut SqliteWarehouseStore,
    actor: &Principal,
) -> Result<Value> {
    match command {
        BufferCommand::Create(args) => {
            let new = NewBuffer {
                buffer_code: args.code,
                buffer_type: parse_code("buffer type", &args.buffer_type, BufferType::parse)?,
                allowed_lot_types: args
                    .allowed_lot_types
                    .iter()
                    .map(|raw| parse_code("lot type", raw, LotType::parse))
                    .collect::<Result<Vec<_>>>()?,
                capacity_kg: Quantity::from_kg_str(&args.capacity_kg)?,
                temp_min_c: args.temp_min_c,
                temp_max_c: args.temp_max_c,
            };
            to_json(&store.create_buffer(actor, &new)?)
        }
        BufferCommand::Update(args) => {
            let update = BufferUpdate {
                capacity_kg: args
                    .capacity_kg
                    .as_deref()
                    .map(Quantity::from_kg_str)
                    .transpose()?,
                temp_min_c: args.temp_min_c,
                temp_max_c: args.temp_max_c,
                is_active: args.active,
            };
            to_json(&store.update_buffer(actor, BufferId::parse(&args.buffer_id)?, &update)?)
        }
        BufferCommand::Get(args) => to_json(&store.get_buffer(BufferId::parse(&args.buffer_id)?)?),
        BufferCommand::List(args) => {
            let buffer_type = args
                .buffer_type
                .as_deref()
                .map(|raw| parse_code("buffer type", raw, BufferType::parse))
                .transpose()?;
            to_json(&store.list_buffers(buffer_type)?)
        }
    }
}

fn run_inventory(
    command: InventoryCommand,
    store: &mut SqliteWarehouseStore,
    actor: &Principal,
) -> Result<Value> {
    let (request, key) = match command {
        InventoryCommand::Receive(args) => (
            MoveRequest::Receive {
                lot_id: LotId::parse(&args.lot_id)?,
                to_buffer_id: BufferId::parse(&args.to_buffer_id)?,
                run_id: RunId::parse(&args.run_id)?,
                quantity_kg: Quantity::from_kg_str(&args.quantity_kg)?,
            },
            args.idempotency_key,
        ),
        InventoryCommand::Transfer(args) => (
            MoveRequest::Transfer {
                lot_id: LotId::parse(&args.lot_id)?,
                from_buffer_id: BufferId::parse(&args.from_buffer_id)?,
                to_buffer_id: BufferId::parse(&args.to_buffer_id)?,
                quantity_kg: Quantity::from_kg_str(&args.quantity_kg)?,
            },
            args.idempotency_key,
        ),
        InventoryCommand::Consume(args) => (
            MoveRequest::Consume {
                lot_id: LotId::parse(&args.lot_id)?,
                from_buffer_id: BufferId::parse(&args.from_buffer_id)?,
                quantity_kg: Quantity::from_kg_str(&args.quantity_kg)?,
            },
            args.idempotency_key,
        ),
        InventoryCommand::Ship(args) => (
            MoveRequest::Ship {
                lot_id: LotId::parse(&args.lot_id)?,
                from_buffer_id: BufferId::parse(&args.from_buffer_id)?,
                quantity_kg: Quantity::from_kg_str(&args.quantity_kg)?,
            },
            args.idempotency_key,
        ),
        InventoryCommand::List(args) => {
            let filter = InventoryFilter {
                buffer_id: optional_id(args.buffer_id.as_deref(), BufferId::parse)?,
                lot_id: optional_id(args.lot_id.as_deref(), LotId::parse)?,
                active_only: !args.include_exited,
            };
            return to_json(&store.list_inventory(&filter)?);
        }
        InventoryCommand::Moves(args) => {
            let filter = MoveFilter {
                lot_id: optional_id(args.lot_id.as_deref(), LotId::parse)?,
                buffer_id: optional_id(args.buffer_id.as_deref(), BufferId::parse)?,
                move_type: args
                    .move_type
                    .as_deref()
                    .map(|raw| parse_code("move type", raw, MoveType::parse))
                    .transpose()?,
                page: args.page.page()?,
            };
            return to_json(&store.list_moves(&filter)?);
        }
    };
    to_json(&store.move_stock(actor, &request, IdempotencyKey::parse(&key)?)?)
}

fn run_qc(
    command: QcCommand,
    store: &mut SqliteWarehouseStore,
    actor: &Principal,
) -> Result<Value> {
    match command {
        QcCommand::Inspect(args) => {
            let new = NewInspection {
                run_id: RunId::parse(&args.run_id)?,
                lot_id: LotId::parse(&args.lot_id)?,
                step_index: args.step,
                inspection_type: args.inspection_type,
                decision: parse_code("decision", &args.decision, Decision::parse)?,
                notes: args.notes,
                is_ccp: args.ccp,
                idempotency_key: IdempotencyKey::parse(&args.idempotency_key)?,
            };
            to_json(&store.record_inspection(actor, &new)?)
        }
        QcCommand::Get(args) => {
            to_json(&store.get_inspection(InspectionId::parse(&args.inspection_id)?)?)
        }
        QcCommand::List(args) => {
            let filter = InspectionFilter {
                run_id: optional_id(args.run_id.as_deref(), RunId::parse)?,
                lot_id: optional_id(args.lot_id.as_deref(), LotId::parse)?,
                step_index: args.step,
                page: args.page.page()?,
            };
            to_json(&store.list_inspections(&filter)?)
        }
        QcCommand::Decide(args) => {
            let new = NewQcDecision {
                lot_id: optional_id(args.lot_id.as_deref(), LotId::parse)?,
                gate_id: args.gate_id,
                decision: parse_code("decision", &args.decision, Decision::parse)?,
                notes: args.notes,
                temperature_c: args.temperature_c,
                digital_signature: args.signature,
            };
            to_json(&store.record_qc_decision(actor, &new)?)
        }
    }
}

fn run_temperature(
    command: TemperatureCommand,
    store: &mut SqliteWarehouseStore,
    actor: &Principal,
) -> Result<Value> {
    match command {
        TemperatureCommand::Log(args) => {
            let reading = NewTemperatureReading {
                temperature_c: args.value_c,
                measurement_type: parse_code(
                    "measurement type",
                    &args.measurement,
                    MeasurementType::parse,
                )?,
                lot_id: optional_id(args.lot_id.as_deref(), LotId::parse)?,
                buffer_id: optional_id(args.buffer_id.as_deref(), BufferId::parse)?,
                inspection_id: optional_id(args.inspection_id.as_deref(), InspectionId::parse)?,
            };
            to_json(&store.record_temperature(actor, &reading)?)
        }
        TemperatureCommand::Get(args) => {
            to_json(&store.get_temperature_log(TemperatureLogId::parse(&args.log_id)?)?)
        }
        TemperatureCommand::List(args) => {
            let filter = TemperatureFilter {
                lot_id: optional_id(args.lot_id.as_deref(), LotId::parse)?,
                buffer_id: optional_id(args.buffer_id.as_deref(), BufferId::parse)?,
                inspection_id: optional_id(args.inspection_id.as_deref(), InspectionId::parse)?,
                violations_only: args.violations_only,
                page: args.page.page()?,
            };
            to_json(&store.list_temperature_logs(&filter)?)
        }
    }
}

fn run_genealogy(
    command: GenealogyCommand,
    store: &mut SqliteWarehouseStore,
    actor: &Principal,
) -> Result<Value> {
    match command {
        GenealogyCommand::Link(args) => {
            let link = NewGenealogyLink {
                parent_lot_id: LotId::parse(&args.parent_lot_id)?,
                child_lot_id: LotId::parse(&args.child_lot_id)?,
                quantity_used_kg: args
                    .quantity_kg
                    .as_deref()
                    .map(Quantity::from_kg_str)
                    .transpose()?,
            };
            to_json(&store.link_lots(actor, &link)?)
        }
        GenealogyCommand::Parents(args) => {
            to_json(&store.parents(LotId::parse(&args.lot_id)?, args.depth)?)
        }
        GenealogyCommand::Children(args) => {
            to_json(&store.children(LotId::parse(&args.lot_id)?, args.depth)?)
        }
        GenealogyCommand::Tree(args) => {
            to_json(&store.tree(LotId::parse(&args.lot_id)?, args.depth)?)
        }
        GenealogyCommand::Trace(args) => to_json(&store.deep_trace(&args.lot_code, args.refresh)?),
    }
}

fn run_flows(
    command: FlowCommand,
    store: &mut SqliteWarehouseStore,
    actor: &Principal,
) -> Result<Value> {
    match command {
        FlowCommand::Create(args) => {
            let new = NewFlow {
                name: parse_localized_names(&args.names)?,
                description: args.description,
            };
            let (flow, draft) = store.create_flow(actor, &new)?;
            Ok(json!({"flow": to_json(&flow)?, "draft": to_json(&draft)?}))
        }
        FlowCommand::Update(args) => {
            let body = std::fs::read_to_string(&args.graph_file).with_context(|| {
                format!("failed to read graph file {}", args.graph_file.display())
            })?;
            let graph: GraphSchema = serde_json::from_str(&body).map_err(|err| {
                WarehouseError::Validation(format!(
                    "graph file {} is not a valid flow graph: {err}",
                    args.graph_file.display()
                ))
            })?;
            let version_id = FlowVersionId::parse(&args.version_id)?;
            to_json(&store.update_draft(actor, version_id, &graph)?)
        }
        FlowCommand::Submit(args) => {
            to_json(&store.submit_for_review(actor, FlowVersionId::parse(&args.version_id)?)?)
        }
        FlowCommand::Publish(args) => {
            to_json(&store.publish_version(actor, FlowVersionId::parse(&args.version_id)?)?)
        }
        FlowCommand::Fork(args) => {
            to_json(&store.fork_version(actor, FlowVersionId::parse(&args.version_id)?)?)
        }
        FlowCommand::Deprecate(args) => {
            to_json(&store.deprecate_version(actor, FlowVersionId::parse(&args.version_id)?)?)
        }
        FlowCommand::Get(args) => {
            to_json(&store.get_flow(FlowDefinitionId::parse(&args.flow_id)?)?)
        }
        FlowCommand::List(args) => to_json(&store.list_flows(args.page()?)?),
        FlowCommand::Versions(args) => {
            to_json(&store.list_versions(FlowDefinitionId::parse(&args.flow_id)?)?)
        }
        FlowCommand::Version(args) => {
            to_json(&store.get_version(FlowVersionId::parse(&args.version_id)?)?)
        }
        FlowCommand::Draft(args) => {
            to_json(&store.latest_draft(FlowDefinitionId::parse(&args.flow_id)?)?)
        }
    }
}

fn run_audit(command: AuditCommand, store: &SqliteWarehouseStore) -> Result<Value> {
    match command {
        AuditCommand::List(args) => {
            let filter = AuditFilter {
                entity_type: args
                    .entity_type
                    .as_deref()
                    .map(parse_entity_type)
                    .transpose()?,
                entity_id: args.entity_id,
                event_type: args
                    .event_type
                    .as_deref()
                    .map(|raw| parse_code("event type", raw, AuditEventType::parse))
                    .transpose()?,
                user_id: args.user_id,
                page: args.page.page()?,
            };
            to_json(&store.list_audit_events(&filter)?)
        }
        AuditCommand::Get(args) => to_json(&store.get_audit_event(args.event_id)?),
        AuditCommand::Trail(args) => to_json(&store.entity_trail(
            parse_entity_type(&args.entity_type)?,
            &args.entity_id,
            args.limit,
        )?),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).context("failed to serialize command output")
}

/// Parses an upper-case domain code, accepting any input case.
fn parse_code<T>(field: &str, raw: &str, parse: fn(&str) -> Option<T>) -> Result<T> {
    parse(&raw.trim().to_ascii_uppercase())
        .ok_or_else(|| WarehouseError::Validation(format!("unknown {field}: {raw}")).into())
}

fn parse_entity_type(raw: &str) -> Result<EntityType> {
    EntityType::parse(&raw.trim().to_ascii_lowercase())
        .ok_or_else(|| WarehouseError::Validation(format!("unknown entity type: {raw}")).into())
}

fn optional_id<T>(
    raw: Option<&str>,
    parse: fn(&str) -> Result<T, WarehouseError>,
) -> Result<Option<T>> {
    Ok(raw.map(parse).transpose()?)
}

fn parse_json_arg(field: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|err| {
        WarehouseError::Validation(format!("{field} must be valid JSON: {err}")).into()
    })
}

fn parse_localized_names(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|entry| -> Result<(String, String)> {
            let (locale, label) = entry.split_once('=').ok_or_else(|| {
                WarehouseError::Validation(format!("--name must be LOCALE=LABEL, got `{entry}`"))
            })?;
            Ok((locale.trim().to_string(), label.to_string()))
        })
        .collect()
}

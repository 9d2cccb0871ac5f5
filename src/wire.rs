use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use serde_json::json;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::SlotdAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, format_range_list, Command, StatementKind};
use crate::tenant::TenantManager;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SlotdFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct SlotdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotdQueryParser>,
}

impl SlotdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotdQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Execute with RED metrics around it.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertService {
                id,
                reference_minutes,
                active,
            } => {
                engine
                    .upsert_service(id, reference_minutes, active)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertSchedule {
                provider_id,
                schedule,
                rows,
            } => {
                engine
                    .set_schedule(provider_id, schedule)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(rows)))
            }
            Command::InsertServiceConfig {
                provider_id,
                service_id,
                config,
            } => {
                engine
                    .set_service_config(provider_id, service_id, config)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertExecutionTime {
                provider_id,
                service_id,
                minutes,
            } => {
                engine
                    .set_execution_time(provider_id, service_id, minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteExecutionTime {
                provider_id,
                service_id,
            } => {
                engine
                    .restore_execution_time(provider_id, service_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertAppointment(req) => {
                let receipt = engine.commit(req).await.map_err(engine_err)?;
                text_response(Table::Booking.schema(), vec![booking_row(&receipt)])
            }
            Command::InsertTransition(req) => {
                let appointment = engine.transition(req).await.map_err(engine_err)?;
                text_response(Table::Appointments.schema(), vec![appointment_row(&appointment)])
            }
            Command::SelectSlots {
                provider_id,
                service_id,
                date,
            } => {
                let slots = engine
                    .generate_slots(provider_id, service_id, date)
                    .await
                    .map_err(engine_err)?;
                let rows = slots
                    .iter()
                    .map(|s| vec![Some(fmt_minute(s.start)), Some(fmt_minute(s.end))])
                    .collect();
                text_response(Table::Slots.schema(), rows)
            }
            Command::SelectAppointment { id } => {
                let rows = match engine.get_appointment(id).await {
                    Ok(a) => vec![appointment_row(&a)],
                    Err(EngineError::NotFound(_)) => vec![],
                    Err(e) => return Err(engine_err(e)),
                };
                text_response(Table::Appointments.schema(), rows)
            }
            Command::SelectAppointments { provider_id, date } => {
                let rows = engine
                    .list_appointments(provider_id, date)
                    .await
                    .iter()
                    .map(appointment_row)
                    .collect();
                text_response(Table::Appointments.schema(), rows)
            }
            Command::SelectSchedule { provider_id } => {
                let schedule = engine.get_schedule(provider_id).await;
                let rows = schedule
                    .days
                    .iter()
                    .enumerate()
                    .map(|(weekday, day)| {
                        vec![
                            Some(weekday.to_string()),
                            Some(day.is_working.to_string()),
                            Some(format_range_list(&day.work_blocks)),
                            Some(format_range_list(&day.break_blocks)),
                        ]
                    })
                    .collect();
                text_response(Table::Schedules.schema(), rows)
            }
            Command::SelectServiceConfig {
                provider_id,
                service_id,
            } => {
                let c = engine.get_service_config(provider_id, service_id).await;
                let days: Vec<String> = c.days_of_week.iter().map(u8::to_string).collect();
                let row = vec![
                    Some(provider_id.to_string()),
                    Some(service_id.to_string()),
                    Some(c.restrict_to_time_ranges.to_string()),
                    Some(format_range_list(&c.time_ranges)),
                    Some(days.join(",")),
                    Some(c.use_intelligent_scheduling.to_string()),
                    Some(c.preferences.prioritize_even_spacing.to_string()),
                    Some(c.preferences.prioritize_consecutive_slots.to_string()),
                    c.preferences.time_of_day_preference.map(|t| t.as_str().to_string()),
                ];
                text_response(Table::ServiceConfigs.schema(), vec![row])
            }
            Command::SelectExecutionTime {
                provider_id,
                service_id,
            } => {
                let effective = engine
                    .resolve(provider_id, service_id)
                    .await
                    .map_err(engine_err)?;
                let custom = engine.get_execution_time(provider_id, service_id).await;
                let row = vec![
                    Some(provider_id.to_string()),
                    Some(service_id.to_string()),
                    custom.map(|o| o.execution_time_minutes.to_string()),
                    Some(custom.is_some_and(|o| o.is_active).to_string()),
                    Some(effective.to_string()),
                ];
                text_response(Table::ExecutionTimes.schema(), vec![row])
            }
        }
    }
}

// ── Result shapes ────────────────────────────────────────────────

/// Every row-returning statement has one of these shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Slots,
    Booking,
    Appointments,
    Schedules,
    ServiceConfigs,
    ExecutionTimes,
}

impl Table {
    fn of(kind: StatementKind, table: &str) -> Option<Self> {
        match (kind, table) {
            (StatementKind::Select, "slots") => Some(Table::Slots),
            (StatementKind::Insert, "appointments") => Some(Table::Booking),
            (StatementKind::Select, "appointments")
            | (StatementKind::Insert, "appointment_transitions") => Some(Table::Appointments),
            (StatementKind::Select, "schedules") => Some(Table::Schedules),
            (StatementKind::Select, "service_configs") => Some(Table::ServiceConfigs),
            (StatementKind::Select, "execution_times") => Some(Table::ExecutionTimes),
            _ => None,
        }
    }

    fn columns(self) -> &'static [&'static str] {
        match self {
            Table::Slots => &["start_time", "end_time"],
            Table::Booking => &["id", "status", "date", "start_time", "end_time", "blocked_adjacent"],
            Table::Appointments => &[
                "id",
                "provider_id",
                "service_id",
                "client_id",
                "date",
                "start_time",
                "end_time",
                "status",
                "created_at",
                "cancel_reason",
                "cancelled_by",
                "cancelled_at",
            ],
            Table::Schedules => &["weekday", "working", "work_blocks", "break_blocks"],
            Table::ServiceConfigs => &[
                "provider_id",
                "service_id",
                "restrict_to_time_ranges",
                "time_ranges",
                "days_of_week",
                "intelligent",
                "even_spacing",
                "consecutive",
                "time_of_day",
            ],
            Table::ExecutionTimes => &["provider_id", "service_id", "minutes", "is_active", "effective_minutes"],
        }
    }

    /// All columns travel as text; VARCHAR reads the same in text and binary.
    fn schema(self) -> Vec<FieldInfo> {
        self.columns()
            .iter()
            .map(|name| FieldInfo::new((*name).into(), None, None, Type::VARCHAR, FieldFormat::Text))
            .collect()
    }
}

fn result_schema(sql: &str) -> Vec<FieldInfo> {
    sql::statement_target(sql)
        .and_then(|(kind, table)| Table::of(kind, &table))
        .map(Table::schema)
        .unwrap_or_default()
}

fn text_response(schema: Vec<FieldInfo>, rows: Vec<Vec<Option<String>>>) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|row| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for field in &row {
                encoder.encode_field(field)?;
            }
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn appointment_row(a: &Appointment) -> Vec<Option<String>> {
    let cancellation = a.cancellation.as_ref();
    vec![
        Some(a.id.to_string()),
        Some(a.provider_id.to_string()),
        Some(a.service_id.to_string()),
        Some(a.client_id.to_string()),
        Some(a.date.to_string()),
        Some(fmt_minute(a.span.start)),
        Some(fmt_minute(a.span.end)),
        Some(a.status.as_str().to_string()),
        Some(a.created_at.to_string()),
        cancellation.map(|c| c.reason.clone()),
        cancellation.map(|c| c.cancelled_by.to_string()),
        cancellation.map(|c| c.cancelled_at.to_string()),
    ]
}

fn booking_row(receipt: &BookingReceipt) -> Vec<Option<String>> {
    let a = &receipt.appointment;
    let blocked: Vec<_> = receipt
        .blocked_adjacent_slots
        .iter()
        .map(|s| json!({ "start_time": fmt_minute(s.start), "end_time": fmt_minute(s.end) }))
        .collect();
    vec![
        Some(a.id.to_string()),
        Some(a.status.as_str().to_string()),
        Some(a.date.to_string()),
        Some(fmt_minute(a.span.start)),
        Some(fmt_minute(a.span.end)),
        Some(serde_json::Value::Array(blocked).to_string()),
    ]
}

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.run(&engine, cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        debug!("extended query: {sql}");
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&engine, cmd).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// SQLSTATE for each engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_)
        | EngineError::OutsideAvailability { .. }
        | EngineError::ServiceInactive(_) => "22023",
        EngineError::ScheduleIntegrity(_) => "XX001",
        EngineError::SlotUnavailable { .. } => "23P01",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::CompletionRejected(_) => "28000",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{Sink, SinkExt};
use futures::stream;
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
use tokio::net::TcpStream;

use crate::auth::SlotbookAuthSource;
use crate::engine::{BookingRequest, EngineError, SlotQuery, SlotReport, now_ms};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::{Tenant, TenantManager};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SlotbookFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct SlotbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    fn resolve_tenant<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Tenant>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            user_error("08006", format!("tenant error: {e}"))
        })
    }

    /// Parse, execute and record one statement.
    async fn run(&self, tenant: &Tenant, query: &str, notices: &mut Vec<ErrorInfo>) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(|e| {
            metrics::counter!(observability::QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                .increment(1);
            sql_err(e)
        })?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(tenant, cmd, notices).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(
        &self,
        tenant: &Tenant,
        cmd: Command,
        notices: &mut Vec<ErrorInfo>,
    ) -> PgWireResult<Response> {
        let engine = &tenant.engine;
        let org_id = tenant.store.organization().id;
        match cmd {
            Command::SelectSlots {
                service_id,
                date,
                location_id,
                employee,
            } => {
                let report = engine
                    .find_slots(&SlotQuery { org_id, location_id, service_id, employee, date })
                    .await
                    .map_err(engine_err)?;
                notices.extend(degraded_notice(&report));
                Ok(rows(slots_schema(), &report.slots, |enc, slot| {
                    let name = report
                        .roster
                        .iter()
                        .find(|e| e.id == slot.employee_id)
                        .map(|e| e.name.clone());
                    enc.encode_field(&slot.start)?;
                    enc.encode_field(&slot.end)?;
                    enc.encode_field(&slot.employee_id.to_string())?;
                    enc.encode_field(&name)?;
                    enc.encode_field(&i64::from(slot.free_employee_count))
                }))
            }
            Command::SelectEmployees { service_id, location_id } => {
                let roster = engine
                    .roster(org_id, service_id, location_id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(employees_schema(), &roster, |enc, e| {
                    enc.encode_field(&e.id.to_string())?;
                    enc.encode_field(&e.name)?;
                    enc.encode_field(&e.location_id.map(|l| l.to_string()))
                }))
            }
            Command::SelectServices => {
                let services = engine.services(org_id).await.map_err(engine_err)?;
                Ok(rows(services_schema(), &services, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.name)?;
                    enc.encode_field(&(s.duration_min as i32))
                }))
            }
            Command::SelectLocations => {
                let locations = engine.locations(org_id).await.map_err(engine_err)?;
                Ok(rows(locations_schema(), &locations, |enc, l| {
                    enc.encode_field(&l.id.to_string())?;
                    enc.encode_field(&l.name)?;
                    enc.encode_field(&l.utc_offset_min)
                }))
            }
            Command::SelectAppointments { phone, email, from } => {
                let appointments = engine
                    .client_appointments(org_id, phone.as_deref(), email.as_deref(), from.unwrap_or_else(now_ms))
                    .await
                    .map_err(engine_err)?;
                Ok(rows(appointments_schema(), &appointments, encode_appointment))
            }
            Command::InsertAppointment {
                id,
                location_id,
                service_id,
                employee_id,
                start,
                client,
                returning,
            } => {
                let appointment = engine
                    .book(BookingRequest { id, org_id, location_id, service_id, employee_id, start, client })
                    .await
                    .map_err(engine_err)?;
                if returning {
                    Ok(rows(appointments_schema(), &[appointment], encode_appointment))
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::UpdateAppointmentStatus { id, status } => {
                engine.set_status(org_id, id, status).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::CancelAppointment { id } => {
                engine.cancel(org_id, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::Setup(change) => {
                let tag = match change {
                    SetupChange::ServiceUnlinked { .. }
                    | SetupChange::AvailabilityRemoved { .. }
                    | SetupChange::TimeOffRemoved { .. }
                    | SetupChange::BlockRemoved { .. } => Tag::new("DELETE").with_rows(1),
                    _ => Tag::new("INSERT").with_rows(1),
                };
                engine.apply_setup(org_id, change).await.map_err(engine_err)?;
                Ok(Response::Execution(tag))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        field("start_at", Type::INT8),
        field("end_at", Type::INT8),
        field("employee_id", Type::VARCHAR),
        field("employee_name", Type::VARCHAR),
        field("free_employee_count", Type::INT8),
    ]
}

fn employees_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("location_id", Type::VARCHAR),
    ]
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("duration_minutes", Type::INT4),
    ]
}

fn locations_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("utc_offset_minutes", Type::INT4),
    ]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("location_id", Type::VARCHAR),
        field("service_id", Type::VARCHAR),
        field("employee_id", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("start_at", Type::INT8),
        field("end_at", Type::INT8),
        field("status", Type::VARCHAR),
    ]
}

fn encode_appointment(enc: &mut DataRowEncoder, a: &Appointment) -> PgWireResult<()> {
    enc.encode_field(&a.id.to_string())?;
    enc.encode_field(&a.location_id.map(|l| l.to_string()))?;
    enc.encode_field(&a.service_id.to_string())?;
    enc.encode_field(&a.employee_id.to_string())?;
    enc.encode_field(&a.client_id.to_string())?;
    enc.encode_field(&a.span.start)?;
    enc.encode_field(&a.span.end)?;
    enc.encode_field(&a.status.as_str().to_string())
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns a statement will produce, judged from its text.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    if upper.starts_with("SELECT") {
        if upper.contains("FROM SLOTS") {
            return slots_schema();
        }
        if upper.contains("FROM EMPLOYEES") {
            return employees_schema();
        }
        if upper.contains("FROM SERVICES") {
            return services_schema();
        }
        if upper.contains("FROM LOCATIONS") {
            return locations_schema();
        }
        if upper.contains("FROM APPOINTMENTS") {
            return appointments_schema();
        }
    }
    if upper.starts_with("INSERT INTO APPOINTMENTS") && upper.contains("RETURNING") {
        return appointments_schema();
    }
    vec![]
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
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
        let tenant = self.resolve_tenant(client)?;
        let statements = sql::split_statements(query);
        if statements.is_empty() {
            return Ok(vec![Response::EmptyQuery]);
        }
        // No implicit transaction: statements before a failure stay applied and
        // keep their responses; the failure ends the batch.
        let mut responses = Vec::with_capacity(statements.len());
        let mut notices = Vec::new();
        for statement in statements {
            let result = self.run(&tenant, statement, &mut notices).await;
            send_notices(client, &mut notices).await?;
            match result {
                Ok(response) => responses.push(response),
                Err(e) => {
                    responses.push(Response::Error(Box::new(e.into())));
                    break;
                }
            }
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        let tenant = self.resolve_tenant(client)?;
        let sql = bind_params(&portal.statement.statement, &portal.parameters);
        let mut notices = Vec::new();
        let result = self.run(&tenant, &sql, &mut notices).await;
        send_notices(client, &mut notices).await?;
        result
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// `$N` placeholders outside quoted literals, as (byte start, byte end, N).
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_quote = !in_quote;
                i += 1;
            }
            b'$' if !in_quote => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start, i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|&(_, _, n)| n).max().unwrap_or(0)
}

/// Fill $1, $2, ... with bound values (text format) in one pass over the
/// statement. Bound text is never rescanned. Unbound placeholders stay as written.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for (start, end, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[last..start]);
        match param {
            Some(bytes) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        last = end;
    }
    out.push_str(&sql[last..]);
    out
}

/// Warning sent ahead of a slot list that skipped employees.
fn degraded_notice(report: &SlotReport) -> Option<ErrorInfo> {
    if report.errors.is_empty() {
        return None;
    }
    let skipped: Vec<String> = report.errors.iter().map(|(id, e)| format!("{id} ({e})")).collect();
    Some(ErrorInfo::new(
        "WARNING".into(),
        "01000".into(),
        format!("slot list is partial, skipped employees: {}", skipped.join(", ")),
    ))
}

/// Feed queued notices to the client ahead of the statement responses.
async fn send_notices<C>(client: &mut C, notices: &mut Vec<ErrorInfo>) -> PgWireResult<()>
where
    C: Sink<PgWireBackendMessage> + Unpin + Send,
    PgWireError: From<C::Error>,
{
    for notice in notices.drain(..) {
        client.feed(PgWireBackendMessage::NoticeResponse(notice.into())).await?;
    }
    Ok(())
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine failure.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) | EngineError::InvalidTransition { .. } => "22023",
        EngineError::NotFound { .. } => "P0002",
        EngineError::AlreadyExists { .. } => "23505",
        EngineError::Conflict { .. } => "23P01",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Store(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::UnknownTable(_) => "42P01",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn params_counted_by_highest_index() {
        assert_eq!(count_params("SELECT * FROM slots"), 0);
        assert_eq!(count_params("SELECT * FROM slots WHERE service_id = $1 AND date = $2"), 2);
        assert_eq!(count_params("INSERT INTO appointments VALUES ($3, $1, $10)"), 10);
        assert_eq!(count_params("SELECT '$' FROM services"), 0);
    }

    #[test]
    fn placeholders_inside_literals_are_not_params() {
        assert_eq!(count_params("SELECT * FROM appointments WHERE client_email = '$5' AND client_phone = $1"), 1);
        assert_eq!(count_params("SELECT 'it''s $2' FROM services"), 0);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let sql = "INSERT INTO services (id, name) VALUES ($1, $2)";
        let bound = bind_params(sql, &[Some("SVC"), Some("Room $1")]);
        assert_eq!(bound, "INSERT INTO services (id, name) VALUES ('SVC', 'Room $1')");

        let bound = bind_params("VALUES ($2, $1)", &[Some("a', 'b"), Some("$2")]);
        assert_eq!(bound, "VALUES ('$2', 'a'', ''b')");
    }

    #[test]
    fn bind_handles_nulls_and_wide_indexes() {
        let params: Vec<Option<&str>> = (1..=10).map(|i| if i == 3 { None } else { Some("x") }).collect();
        let bound = bind_params("VALUES ($10, $1, $3)", &params);
        assert_eq!(bound, "VALUES ('x', 'x', NULL)");

        // Unbound indexes are left for the parser to reject.
        assert_eq!(bind_params("VALUES ($2, $0)", &[Some("x")]), "VALUES ($2, $0)");
        assert_eq!(bind_params("name = 'O''Neil $1'", &[Some("x")]), "name = 'O''Neil $1'");
    }

    fn report(errors: Vec<(Ulid, EngineError)>) -> SlotReport {
        SlotReport {
            service: Service {
                id: Ulid::new(),
                org_id: Ulid::new(),
                name: "Corte".into(),
                duration_min: 30,
                active: true,
            },
            roster: vec![],
            slots: vec![],
            errors,
        }
    }

    #[test]
    fn degraded_slot_list_carries_warning() {
        assert!(degraded_notice(&report(vec![])).is_none());

        let skipped = Ulid::new();
        let notice = degraded_notice(&report(vec![(skipped, EngineError::Store("disk gone".into()))])).unwrap();
        assert_eq!(notice.severity, "WARNING");
        assert_eq!(notice.code, "01000");
        assert!(notice.message.contains(&skipped.to_string()));
        assert!(notice.message.contains("disk gone"));
    }

    #[test]
    fn schema_follows_statement() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names("select *\n  from slots where date = $1")[0], "start_at");
        assert_eq!(names("SELECT * FROM services").len(), 3);
        assert_eq!(names("INSERT INTO appointments (service_id) VALUES ($1) RETURNING *").len(), 8);
        assert!(names("INSERT INTO appointments (service_id) VALUES ($1)").is_empty());
        assert!(names("DELETE FROM blocks WHERE id = $1").is_empty());
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        let id = Ulid::new();
        assert_eq!(engine_sqlstate(&EngineError::validation("x")), "22023");
        assert_eq!(engine_sqlstate(&EngineError::not_found("service", id)), "P0002");
        assert_eq!(engine_sqlstate(&EngineError::Conflict { employee_id: id, with: id }), "23P01");
        assert_eq!(
            engine_sqlstate(&EngineError::InvalidTransition {
                from: AppointmentStatus::Cancelled,
                to: AppointmentStatus::Confirmed
            }),
            "22023"
        );
        assert_eq!(engine_sqlstate(&EngineError::LimitExceeded("x")), "54000");
        assert_eq!(engine_sqlstate(&EngineError::Store("down".into())), "58030");
    }
}

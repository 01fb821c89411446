use std::collections::HashMap;

use chrono::{NaiveDate, Weekday};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::calendar::{self, ClockTime};
use crate::engine::EmployeeChoice;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectSlots {
        service_id: Ulid,
        date: NaiveDate,
        location_id: Option<Ulid>,
        employee: EmployeeChoice,
    },
    SelectEmployees {
        service_id: Ulid,
        location_id: Option<Ulid>,
    },
    SelectServices,
    SelectLocations,
    SelectAppointments {
        phone: Option<String>,
        email: Option<String>,
        from: Option<Ms>,
    },
    InsertAppointment {
        id: Option<Ulid>,
        location_id: Option<Ulid>,
        service_id: Ulid,
        employee_id: Ulid,
        start: Ms,
        client: ClientIdentity,
        returning: bool,
    },
    UpdateAppointmentStatus {
        id: Ulid,
        status: AppointmentStatus,
    },
    /// `DELETE FROM appointments` cancels; the row stays.
    CancelAppointment {
        id: Ulid,
    },
    /// Records carry a nil organization id; the engine stamps the tenant's.
    Setup(SetupChange),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("UPDATE ")) {
        return parse_update(trimmed);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Split a simple-query string on `;` outside single-quoted literals.
/// Blank statements are dropped.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut in_quote = false;
    let mut start = 0;
    for (i, c) in sql.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            ';' if !in_quote => {
                statements.push(&sql[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    statements.push(&sql[start..]);
    statements.into_iter().map(str::trim).filter(|s| !s.is_empty()).collect()
}

// ── INSERT ────────────────────────────────────────────────────

/// Writable tables and the column order assumed when an INSERT names none.
const TABLES: [(&str, &[&str]); 9] = [
    (
        "appointments",
        &[
            "id",
            "location_id",
            "service_id",
            "employee_id",
            "start_at",
            "client_name",
            "client_phone",
            "client_email",
        ],
    ),
    ("locations", &["id", "name", "utc_offset_minutes"]),
    ("services", &["id", "name", "duration_minutes", "active"]),
    ("employees", &["id", "location_id", "name", "active"]),
    ("employee_services", &["employee_id", "service_id"]),
    ("business_hours", &["location_id", "weekday", "open_time", "close_time", "active"]),
    ("staff_availability", &["id", "employee_id", "weekday", "start_time", "end_time", "active"]),
    ("staff_time_off", &["id", "employee_id", "starts_at", "ends_at"]),
    ("blocks", &["id", "location_id", "employee_id", "starts_at", "ends_at"]),
];

fn writable_table(name: &str) -> Option<(&'static str, &'static [&'static str])> {
    TABLES.iter().find(|(t, _)| *t == name).copied()
}

/// One VALUES row addressed by column name.
struct Row<'a> {
    table: &'static str,
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn get(&self, col: &'static str) -> Option<&'a Expr> {
        self.values.get(col).copied().filter(|e| !is_null(e))
    }

    fn require(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.require(col)?)
    }

    fn ulid_or_new(&self, col: &'static str) -> Result<Ulid, SqlError> {
        self.opt_ulid(col).map(|id| id.unwrap_or_else(Ulid::new))
    }

    fn opt_ulid(&self, col: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map(parse_ulid_expr).transpose()
    }

    fn string(&self, col: &'static str) -> Result<String, SqlError> {
        parse_string_expr(self.require(col)?)
    }

    fn opt_string(&self, col: &'static str) -> Result<Option<String>, SqlError> {
        self.get(col).map(parse_string_expr).transpose()
    }

    fn bool_or(&self, col: &'static str, default: bool) -> Result<bool, SqlError> {
        self.get(col).map_or(Ok(default), parse_bool_expr)
    }

    fn timestamp(&self, col: &'static str) -> Result<Ms, SqlError> {
        parse_timestamp_expr(self.require(col)?)
    }

    fn clock(&self, col: &'static str) -> Result<ClockTime, SqlError> {
        let s = parse_string_expr(self.require(col)?)?;
        ClockTime::parse(&s).map_err(|e| SqlError::Parse(e.to_string()))
    }

    fn weekday(&self, col: &'static str) -> Result<Weekday, SqlError> {
        let s = parse_string_expr(self.require(col)?)?;
        calendar::parse_weekday(&s).map_err(|e| SqlError::Parse(e.to_string()))
    }

    fn span(&self, start: &'static str, end: &'static str) -> Result<Span, SqlError> {
        let (s, e) = (self.timestamp(start)?, self.timestamp(end)?);
        Span::try_new(s, e).ok_or_else(|| SqlError::Parse(format!("{start} must be before {end}")))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, defaults) = writable_table(&table).ok_or(SqlError::UnknownTable(table))?;
    let values = extract_insert_values(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    let row = Row {
        table,
        values: columns.into_iter().zip(values.iter()).collect(),
    };

    let nil = Ulid::nil();
    let setup = |change: SetupChange| -> Result<Command, SqlError> { Ok(Command::Setup(change)) };
    match table {
        "appointments" => Ok(Command::InsertAppointment {
            id: row.opt_ulid("id")?,
            location_id: row.opt_ulid("location_id")?,
            service_id: row.ulid("service_id")?,
            employee_id: row.ulid("employee_id")?,
            start: row.timestamp("start_at")?,
            client: ClientIdentity {
                name: row.opt_string("client_name")?.unwrap_or_default(),
                phone: row.opt_string("client_phone")?,
                email: row.opt_string("client_email")?,
            },
            returning: insert.returning.is_some(),
        }),
        "locations" => setup(SetupChange::LocationSaved(Location {
            id: row.ulid_or_new("id")?,
            org_id: nil,
            name: row.string("name")?,
            utc_offset_min: row
                .get("utc_offset_minutes")
                .map(parse_i64_expr)
                .transpose()?
                .map(|v| i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range"))))
                .transpose()?
                .unwrap_or(0),
        })),
        "services" => setup(SetupChange::ServiceSaved(Service {
            id: row.ulid_or_new("id")?,
            org_id: nil,
            name: row.string("name")?,
            duration_min: parse_u32(row.require("duration_minutes")?)?,
            active: row.bool_or("active", true)?,
        })),
        "employees" => setup(SetupChange::EmployeeSaved(Employee {
            id: row.ulid_or_new("id")?,
            org_id: nil,
            location_id: row.opt_ulid("location_id")?,
            name: row.string("name")?,
            active: row.bool_or("active", true)?,
        })),
        "employee_services" => setup(SetupChange::ServiceLinked {
            employee_id: row.ulid("employee_id")?,
            service_id: row.ulid("service_id")?,
        }),
        "business_hours" => setup(SetupChange::BusinessHoursSaved(BusinessHours {
            org_id: nil,
            location_id: row.ulid("location_id")?,
            weekday: row.weekday("weekday")?,
            open: row.clock("open_time")?,
            close: row.clock("close_time")?,
            active: row.bool_or("active", true)?,
        })),
        "staff_availability" => setup(SetupChange::AvailabilityAdded(StaffAvailability {
            id: row.ulid_or_new("id")?,
            org_id: nil,
            employee_id: row.ulid("employee_id")?,
            weekday: row.weekday("weekday")?,
            start: row.clock("start_time")?,
            end: row.clock("end_time")?,
            active: row.bool_or("active", true)?,
        })),
        "staff_time_off" => setup(SetupChange::TimeOffAdded(StaffTimeOff {
            id: row.ulid_or_new("id")?,
            org_id: nil,
            employee_id: row.ulid("employee_id")?,
            span: row.span("starts_at", "ends_at")?,
        })),
        "blocks" => setup(SetupChange::BlockAdded(Block {
            id: row.ulid_or_new("id")?,
            org_id: nil,
            location_id: row.ulid("location_id")?,
            employee_id: row.opt_ulid("employee_id")?,
            span: row.span("starts_at", "ends_at")?,
        })),
        other => Err(SqlError::UnknownTable(other.to_string())),
    }
}

// ── DELETE / UPDATE ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::collect(delete.selection.as_ref())?;

    match table.as_str() {
        "appointments" => Ok(Command::CancelAppointment { id: filters.ulid("id")? }),
        "staff_availability" => Ok(Command::Setup(SetupChange::AvailabilityRemoved { id: filters.ulid("id")? })),
        "staff_time_off" => Ok(Command::Setup(SetupChange::TimeOffRemoved { id: filters.ulid("id")? })),
        "blocks" => Ok(Command::Setup(SetupChange::BlockRemoved { id: filters.ulid("id")? })),
        "employee_services" => Ok(Command::Setup(SetupChange::ServiceUnlinked {
            employee_id: filters.ulid("employee_id")?,
            service_id: filters.ulid("service_id")?,
        })),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `UPDATE appointments SET status = '…' WHERE id = '…'`, split by keyword
/// and parsed as two expressions.
fn parse_update(sql: &str) -> Result<Command, SqlError> {
    let upper = sql.to_ascii_uppercase();
    let set_at = upper.find(" SET ").ok_or_else(|| SqlError::Parse("UPDATE without SET".into()))?;
    let where_at = upper
        .find(" WHERE ")
        .ok_or(SqlError::MissingFilter("id"))?;
    if set_at < 7 {
        return Err(SqlError::Parse("UPDATE without a table".into()));
    }
    if where_at < set_at {
        return Err(SqlError::Parse("WHERE before SET".into()));
    }
    let table = sql[7..set_at].trim().trim_matches('"').to_lowercase();
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }

    let dialect = PostgreSqlDialect {};
    let parse_expr = |text: &str| {
        Parser::new(&dialect)
            .try_with_sql(text)
            .and_then(|mut p| p.parse_expr())
            .map_err(|e| SqlError::Parse(e.to_string()))
    };
    let assignment = parse_expr(&sql[set_at + 5..where_at])?;
    let selection = parse_expr(&sql[where_at + 7..])?;

    let set = Filters::collect(Some(&assignment))?;
    let status_text = parse_string_expr(set.eq.get("status").ok_or(SqlError::MissingColumn("appointments", "status"))?)?;
    let status = AppointmentStatus::parse(&status_text)
        .ok_or_else(|| SqlError::Parse(format!("unknown status {status_text:?}")))?;
    let filters = Filters::collect(Some(&selection))?;
    Ok(Command::UpdateAppointmentStatus { id: filters.ulid("id")?, status })
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::collect(select.selection.as_ref())?;

    match table.as_str() {
        "slots" => {
            let employee = match filters.opt_string("employee_id")? {
                None => EmployeeChoice::Any,
                Some(s) if s.eq_ignore_ascii_case("any") => EmployeeChoice::Any,
                Some(s) => EmployeeChoice::Specific(parse_ulid_str(&s)?),
            };
            let date = filters
                .opt_string("date")?
                .ok_or(SqlError::MissingFilter("date"))?;
            Ok(Command::SelectSlots {
                service_id: filters.ulid("service_id")?,
                date: calendar::parse_date(&date).map_err(|e| SqlError::Parse(e.to_string()))?,
                location_id: filters.opt_ulid("location_id")?,
                employee,
            })
        }
        "employees" => Ok(Command::SelectEmployees {
            service_id: filters.ulid("service_id")?,
            location_id: filters.opt_ulid("location_id")?,
        }),
        "services" => Ok(Command::SelectServices),
        "locations" => Ok(Command::SelectLocations),
        "appointments" => {
            let phone = filters.opt_string("client_phone")?;
            let email = filters.opt_string("client_email")?;
            if phone.is_none() && email.is_none() {
                return Err(SqlError::MissingFilter("client_phone or client_email"));
            }
            let from = filters.gte.get("start_at").map(|e| parse_timestamp_expr(e)).transpose()?;
            Ok(Command::SelectAppointments { phone, email, from })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = v` and `col >= v` terms of an AND-only WHERE clause.
#[derive(Default)]
struct Filters {
    eq: HashMap<String, Expr>,
    gte: HashMap<String, Expr>,
}

impl Filters {
    fn collect(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.visit(expr)?;
        }
        Ok(filters)
    }

    fn visit(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.visit(inner),
            Expr::BinaryOp { left, op, right } => {
                match op {
                    BinaryOperator::And => {
                        self.visit(left)?;
                        self.visit(right)?;
                    }
                    BinaryOperator::Eq => {
                        if let Some(col) = expr_column_name(left) {
                            self.eq.insert(col, right.as_ref().clone());
                        }
                    }
                    BinaryOperator::GtEq => {
                        if let Some(col) = expr_column_name(left) {
                            self.gte.insert(col, right.as_ref().clone());
                        }
                    }
                    BinaryOperator::Or => {
                        return Err(SqlError::Unsupported("OR in WHERE".into()));
                    }
                    _ => {}
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        self.opt_ulid(col)?.ok_or(SqlError::MissingFilter(col))
    }

    fn opt_ulid(&self, col: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.eq.get(col).filter(|e| !is_null(e)).map(parse_ulid_expr).transpose()
    }

    fn opt_string(&self, col: &'static str) -> Result<Option<String>, SqlError> {
        self.eq.get(col).filter(|e| !is_null(e)).map(parse_string_expr).transpose()
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// First VALUES row; bookings are one per statement.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid_str(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => parse_ulid_str(s),
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(Value::Boolean(b)) => Ok(b.to_string()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => match expr {
            Expr::UnaryOp { op: UnaryOperator::Minus, expr } => Ok(format!("-{}", parse_string_expr(expr)?)),
            _ => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
        },
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp { op: UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_i64_expr(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

/// Unix milliseconds or an RFC 3339 string.
fn parse_timestamp_expr(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            calendar::parse_timestamp(s).map_err(|e| SqlError::Parse(e.to_string()))
        }
        _ => parse_i64_expr(expr),
    }
}

fn parse_bool_expr(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing value for {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

use std::collections::BTreeSet;

use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, Ident, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{BookingRequest, TransitionRequest};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertService {
        id: Ulid,
        reference_minutes: u32,
        active: bool,
    },
    /// Whole-week replacement; weekdays without a row are days off.
    /// `rows` is the number of weekday rows the statement carried.
    InsertSchedule {
        provider_id: Ulid,
        schedule: WeeklySchedule,
        rows: usize,
    },
    InsertServiceConfig {
        provider_id: Ulid,
        service_id: Ulid,
        config: ServiceScheduleConfig,
    },
    InsertExecutionTime {
        provider_id: Ulid,
        service_id: Ulid,
        minutes: u32,
    },
    DeleteExecutionTime {
        provider_id: Ulid,
        service_id: Ulid,
    },
    InsertAppointment(BookingRequest),
    InsertTransition(TransitionRequest),
    SelectSlots {
        provider_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
    },
    SelectAppointment {
        id: Ulid,
    },
    SelectAppointments {
        provider_id: Ulid,
        date: Option<NaiveDate>,
    },
    SelectSchedule {
        provider_id: Ulid,
    },
    SelectServiceConfig {
        provider_id: Ulid,
        service_id: Ulid,
    },
    SelectExecutionTime {
        provider_id: Ulid,
        service_id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Insert,
    Delete,
    Select,
}

/// Statement kind and table name, without interpreting any values. Prepared
/// statements are described this way before their parameters are bound.
pub fn statement_target(sql: &str) -> Option<(StatementKind, String)> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => Some((StatementKind::Insert, insert_table_name(insert).ok()?)),
        Statement::Delete(delete) => Some((StatementKind::Delete, delete_table_name(delete).ok()?)),
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => {
                let from = select.from.first()?;
                Some((StatementKind::Select, table_factor_name(&from.relation).ok()?))
            }
            _ => None,
        },
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let shape = TableShape::of(&table).ok_or_else(|| SqlError::UnknownTable(table.clone()))?;
    let rows = extract_insert_rows(insert)?;
    if table != "schedules" && rows.len() > 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let rows = shape.align(&insert.columns, rows)?;
    let values = &rows[0];

    match table.as_str() {
        "services" => {
            Ok(Command::InsertService {
                id: parse_ulid(&values[0])?,
                reference_minutes: parse_u32(&values[1])?,
                active: optional(values, 2, parse_bool)?.unwrap_or(true),
            })
        }
        "schedules" => parse_schedule_rows(&rows),
        "service_configs" => {
            let mut config = ServiceScheduleConfig::default();
            if let Some(restrict) = optional(values, 2, parse_bool)? {
                config.restrict_to_time_ranges = restrict;
            }
            if let Some(ranges) = optional(values, 3, parse_ranges)? {
                config.time_ranges = ranges;
            }
            if let Some(days) = optional(values, 4, parse_day_set)? {
                config.days_of_week = days;
            }
            if let Some(intelligent) = optional(values, 5, parse_bool)? {
                config.use_intelligent_scheduling = intelligent;
            }
            if let Some(even) = optional(values, 6, parse_bool)? {
                config.preferences.prioritize_even_spacing = even;
            }
            if let Some(consecutive) = optional(values, 7, parse_bool)? {
                config.preferences.prioritize_consecutive_slots = consecutive;
            }
            config.preferences.time_of_day_preference = optional(values, 8, parse_time_of_day)?;
            Ok(Command::InsertServiceConfig {
                provider_id: parse_ulid(&values[0])?,
                service_id: parse_ulid(&values[1])?,
                config,
            })
        }
        "execution_times" => {
            Ok(Command::InsertExecutionTime {
                provider_id: parse_ulid(&values[0])?,
                service_id: parse_ulid(&values[1])?,
                minutes: parse_u32(&values[2])?,
            })
        }
        "appointments" => {
            let auto_confirm = match optional(values, 6, parse_status)? {
                None | Some(AppointmentStatus::Pending) => false,
                Some(AppointmentStatus::Confirmed) => true,
                Some(other) => {
                    return Err(SqlError::Parse(format!(
                        "new appointments are pending or confirmed, not {other}"
                    )));
                }
            };
            Ok(Command::InsertAppointment(BookingRequest {
                id: parse_ulid(&values[0])?,
                provider_id: parse_ulid(&values[1])?,
                service_id: parse_ulid(&values[2])?,
                client_id: parse_ulid(&values[3])?,
                date: parse_date(&values[4])?,
                start: parse_minute(&values[5])?,
                auto_confirm,
            }))
        }
        "appointment_transitions" => {
            Ok(Command::InsertTransition(TransitionRequest {
                appointment_id: parse_ulid(&values[0])?,
                status: parse_status(&values[1])?,
                reason: optional(values, 2, parse_text)?,
                actor: optional(values, 3, parse_ulid)?,
                completion_code: optional(values, 4, parse_text)?,
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_schedule_rows(rows: &[Vec<Expr>]) -> Result<Command, SqlError> {
    let mut provider_id = None;
    let mut schedule = WeeklySchedule::default();
    let mut seen = [false; 7];

    for (i, row) in rows.iter().enumerate() {
        let at = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
        let pid = parse_ulid(&row[0]).map_err(at)?;
        if provider_id.is_some_and(|p| p != pid) {
            return Err(SqlError::Parse("all schedule rows must share one provider_id".into()));
        }
        provider_id = Some(pid);

        let weekday = parse_weekday(&row[1]).map_err(at)?;
        if std::mem::replace(&mut seen[weekday as usize], true) {
            return Err(SqlError::Parse(format!("weekday {weekday} listed twice")));
        }
        let working = parse_bool(&row[2]).map_err(at)?;
        let work_blocks = parse_ranges(&row[3]).map_err(at)?;
        let break_blocks = optional(row, 4, parse_ranges).map_err(at)?.unwrap_or_default();
        schedule.days[weekday as usize] = DaySchedule {
            is_working: working,
            work_blocks,
            break_blocks,
        };
    }

    Ok(Command::InsertSchedule {
        provider_id: provider_id.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?,
        schedule,
        rows: rows.len(),
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "execution_times" => Ok(Command::DeleteExecutionTime {
            provider_id: filters.ulid("provider_id")?,
            service_id: filters.ulid("service_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            provider_id: filters.ulid("provider_id")?,
            service_id: filters.ulid("service_id")?,
            date: filters.date("date")?,
        }),
        "appointments" => {
            if filters.has("id") {
                return Ok(Command::SelectAppointment {
                    id: filters.ulid("id")?,
                });
            }
            Ok(Command::SelectAppointments {
                provider_id: filters.ulid("provider_id")?,
                date: if filters.has("date") {
                    Some(filters.date("date")?)
                } else {
                    None
                },
            })
        }
        "schedules" => Ok(Command::SelectSchedule {
            provider_id: filters.ulid("provider_id")?,
        }),
        "service_configs" => Ok(Command::SelectServiceConfig {
            provider_id: filters.ulid("provider_id")?,
            service_id: filters.ulid("service_id")?,
        }),
        "execution_times" => Ok(Command::SelectExecutionTime {
            provider_id: filters.ulid("provider_id")?,
            service_id: filters.ulid("service_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column = value` conjuncts of a WHERE clause.
struct Filters(Vec<(String, Expr)>);

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut out = Vec::new();
        if let Some(expr) = selection {
            collect_eq_filters(expr, &mut out)?;
        }
        Ok(Self(out))
    }

    fn get(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.0
            .iter()
            .find(|(c, _)| c == col)
            .map(|(_, e)| e)
            .ok_or(SqlError::MissingFilter(col))
    }

    fn has(&self, col: &str) -> bool {
        self.0.iter().any(|(c, _)| c == col)
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.get(col)?)
    }

    fn date(&self, col: &'static str) -> Result<NaiveDate, SqlError> {
        parse_date(self.get(col)?)
    }
}

fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref().clone()));
            }
            other => return Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        Expr::Nested(inner) => collect_eq_filters(inner, out)?,
        other => return Err(SqlError::Unsupported(format!("filter {other}"))),
    }
    Ok(())
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Column order of an insertable table. The first `required` columns are
/// mandatory; the rest may be omitted or NULL.
struct TableShape {
    name: &'static str,
    columns: &'static [&'static str],
    required: usize,
}

const INSERT_TABLES: &[TableShape] = &[
    TableShape {
        name: "services",
        columns: &["id", "reference_minutes", "active"],
        required: 2,
    },
    TableShape {
        name: "schedules",
        columns: &["provider_id", "weekday", "working", "work_blocks", "break_blocks"],
        required: 4,
    },
    TableShape {
        name: "service_configs",
        columns: &[
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
        required: 2,
    },
    TableShape {
        name: "execution_times",
        columns: &["provider_id", "service_id", "minutes"],
        required: 3,
    },
    TableShape {
        name: "appointments",
        columns: &["id", "provider_id", "service_id", "client_id", "date", "start_time", "status"],
        required: 6,
    },
    TableShape {
        name: "appointment_transitions",
        columns: &["appointment_id", "status", "reason", "actor", "code"],
        required: 2,
    },
];

impl TableShape {
    fn of(table: &str) -> Option<&'static TableShape> {
        INSERT_TABLES.iter().find(|t| t.name == table)
    }

    /// Put every row into this table's column order. Without a column list
    /// values are positional; with one they are matched by name and omitted
    /// columns become NULL.
    fn align(&self, columns: &[Ident], rows: Vec<Vec<Expr>>) -> Result<Vec<Vec<Expr>>, SqlError> {
        if columns.is_empty() {
            for row in &rows {
                if row.len() < self.required || row.len() > self.columns.len() {
                    return Err(SqlError::WrongArity {
                        table: self.name,
                        min: self.required,
                        max: self.columns.len(),
                        got: row.len(),
                    });
                }
            }
            return Ok(rows);
        }

        let mut positions = Vec::with_capacity(columns.len());
        for ident in columns {
            let name = ident.value.to_lowercase();
            let pos = self
                .columns
                .iter()
                .position(|c| *c == name)
                .ok_or_else(|| SqlError::UnknownColumn(self.name, name.clone()))?;
            if positions.contains(&pos) {
                return Err(SqlError::Parse(format!("{}: column {name} listed twice", self.name)));
            }
            positions.push(pos);
        }
        if let Some(missing) = (0..self.required).find(|i| !positions.contains(i)) {
            return Err(SqlError::MissingColumn(self.name, self.columns[missing]));
        }

        rows.into_iter()
            .map(|row| {
                if row.len() != positions.len() {
                    return Err(SqlError::Parse(format!(
                        "{}: {} columns but {} values",
                        self.name,
                        positions.len(),
                        row.len()
                    )));
                }
                let mut aligned = vec![Expr::Value(Value::Null.into()); self.columns.len()];
                for (&pos, expr) in positions.iter().zip(row) {
                    aligned[pos] = expr;
                }
                Ok(aligned)
            })
            .collect()
    }
}

/// Trailing column that may be omitted or NULL.
fn optional<T>(
    values: &[Expr],
    idx: usize,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    match values.get(idx) {
        None => Ok(None),
        Some(expr) if matches!(extract_value(expr), Some(Value::Null)) => Ok(None),
        Some(expr) => parse(expr).map(Some),
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

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    parse_text(expr)?
        .trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_minute(expr: &Expr) -> Result<Minute, SqlError> {
    parse_hhmm(&parse_text(expr)?)
}

fn parse_weekday(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    match u8::try_from(v) {
        Ok(d) if d < 7 => Ok(d),
        _ => Err(SqlError::Parse(format!("weekday {v} out of range 0..6"))),
    }
}

fn parse_status(expr: &Expr) -> Result<AppointmentStatus, SqlError> {
    let s = parse_text(expr)?;
    AppointmentStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown status: {s}")))
}

fn parse_time_of_day(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    let s = parse_text(expr)?;
    TimeOfDay::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown time of day: {s}")))
}

fn parse_ranges(expr: &Expr) -> Result<Vec<TimeRange>, SqlError> {
    parse_range_list(&parse_text(expr)?)
}

fn parse_day_set(expr: &Expr) -> Result<BTreeSet<u8>, SqlError> {
    parse_day_list(&parse_text(expr)?)
}

/// `HH:MM`, with `24:00` allowed as an end of day.
pub fn parse_hhmm(s: &str) -> Result<Minute, SqlError> {
    let bad = || SqlError::Parse(format!("bad time {s:?}, expected HH:MM"));
    let (h, m) = s.trim().split_once(':').ok_or_else(bad)?;
    let h: Minute = h.parse().map_err(|_| bad())?;
    let m: Minute = m.parse().map_err(|_| bad())?;
    if m >= 60 || h > 24 || (h == 24 && m != 0) {
        return Err(bad());
    }
    Ok(h * 60 + m)
}

/// `'09:00-12:00,13:00-17:00'`; the empty string is the empty list.
pub fn parse_range_list(s: &str) -> Result<Vec<TimeRange>, SqlError> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (start, end) = part
                .split_once('-')
                .ok_or_else(|| SqlError::Parse(format!("bad range {part:?}, expected HH:MM-HH:MM")))?;
            let (start, end) = (parse_hhmm(start)?, parse_hhmm(end)?);
            TimeRange::try_new(start, end)
                .ok_or_else(|| SqlError::Parse(format!("range {part:?} must end after it starts")))
        })
        .collect()
}

/// `'1,3,5'`, 0 = Sunday.
pub fn parse_day_list(s: &str) -> Result<BTreeSet<u8>, SqlError> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.parse::<u8>() {
            Ok(d) if d < 7 => Ok(d),
            _ => Err(SqlError::Parse(format!("bad weekday {part:?}"))),
        })
        .collect()
}

/// Inverse of `parse_range_list`.
pub fn format_range_list(ranges: &[TimeRange]) -> String {
    ranges
        .iter()
        .map(TimeRange::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity {
        table: &'static str,
        min: usize,
        max: usize,
        got: usize,
    },
    UnknownColumn(&'static str, String),
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
            SqlError::WrongArity { table, min, max, got } => {
                write!(f, "{table}: expected {min} to {max} values, got {got}")
            }
            SqlError::UnknownColumn(table, col) => write!(f, "{table}: unknown column {col}"),
            SqlError::MissingColumn(table, col) => write!(f, "{table}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

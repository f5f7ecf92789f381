use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_IN_CLAUSE_IDS;
use crate::model::*;
use crate::store::BookingFilter;

/// How a `purchase_orders` SELECT picks its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoLookup {
    Id(Ulid),
    Swimmer(Ulid),
}

/// Weekly pattern shared by the recurrence queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub weekday: u8,
    pub time: NaiveTime,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSession {
        id: Ulid,
        instructor_id: Ulid,
        start: Ms,
        end: Ms,
        capacity: u32,
        location: Option<String>,
        external_id: Option<String>,
    },
    CancelSession {
        id: Ulid,
    },
    CompleteSession {
        session_id: Ulid,
    },
    MarkNoShow {
        booking_id: Ulid,
    },
    InsertHold {
        id: Ulid,
        owner: String,
        session_ids: Vec<Ulid>,
        ttl_ms: Option<Ms>,
    },
    ReleaseHold {
        id: Ulid,
    },
    RenewHold {
        hold_id: Ulid,
        owner: String,
    },
    ConfirmBooking {
        hold_id: Ulid,
        owner: String,
        swimmer_id: Ulid,
        parent_id: Option<Ulid>,
        po_id: Option<Ulid>,
    },
    CancelBooking {
        booking_id: Ulid,
        source: CancelSource,
        reason: Option<String>,
    },
    InsertPurchaseOrder {
        id: Ulid,
        swimmer_id: Ulid,
        funding_source_id: Ulid,
        po_type: PoType,
        start_date: NaiveDate,
        end_date: NaiveDate,
        sessions_authorized: u32,
        parent_po_id: Option<Ulid>,
        external_id: Option<String>,
    },
    InsertAssessmentPair {
        swimmer_id: Ulid,
        funding_source_id: Ulid,
        assessment_date: NaiveDate,
    },
    RenewPurchaseOrder {
        po_id: Ulid,
        last_lesson_date: NaiveDate,
    },
    CancelPurchaseOrder {
        id: Ulid,
    },
    ApprovePurchaseOrder {
        po_id: Ulid,
        authorization_number: Option<String>,
        override_pending_auth: bool,
    },
    AttachAuthorization {
        po_id: Ulid,
        authorization_number: String,
    },
    RecordBilling {
        po_id: Ulid,
        status: BillingStatus,
        billed_amount_cents: Option<i64>,
        paid_amount_cents: Option<i64>,
        invoice_number: Option<String>,
        due_date: Option<NaiveDate>,
        note: Option<String>,
    },
    RecordPayment {
        po_id: Ulid,
        amount_cents: i64,
        reference: Option<String>,
    },
    SelectAvailability {
        session_ids: Vec<Ulid>,
    },
    SelectHolds {
        id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectPurchaseOrders {
        lookup: PoLookup,
    },
    SelectRecurrence {
        pattern: Pattern,
        instructors: Vec<Ulid>,
    },
    /// Plan for one instructor; conflicted weeks go to `candidates` when
    /// any are given and are skipped otherwise.
    SelectRecurrencePlan {
        pattern: Pattern,
        instructor_id: Ulid,
        candidates: Vec<Ulid>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
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

// ── INSERT ────────────────────────────────────────────────────

const SESSION_COLUMNS: &[&str] = &["id", "instructor_id", "start", "end", "capacity", "location", "external_id"];
const HOLD_COLUMNS: &[&str] = &["id", "owner", "session_ids", "ttl_ms"];
const BOOKING_COLUMNS: &[&str] = &["hold_id", "owner", "swimmer_id", "parent_id", "po_id"];
const CANCELLATION_COLUMNS: &[&str] = &["booking_id", "source", "reason"];
const PO_COLUMNS: &[&str] = &[
    "id",
    "swimmer_id",
    "funding_source_id",
    "po_type",
    "start_date",
    "end_date",
    "sessions_authorized",
    "parent_po_id",
    "external_id",
];
const BILLING_COLUMNS: &[&str] = &[
    "po_id",
    "status",
    "billed_amount",
    "paid_amount",
    "invoice_number",
    "due_date",
    "note",
];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = single_insert_row(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();

    match table.as_str() {
        "sessions" => {
            let row = Row::new("sessions", SESSION_COLUMNS, &columns, values)?;
            Ok(Command::InsertSession {
                id: parse_ulid(row.required("id")?)?,
                instructor_id: parse_ulid(row.required("instructor_id")?)?,
                start: parse_i64(row.required("start")?)?,
                end: parse_i64(row.required("end")?)?,
                capacity: parse_u32(row.required("capacity")?)?,
                location: row.optional("location", parse_text)?,
                external_id: row.optional("external_id", parse_text)?,
            })
        }
        "session_completions" => {
            let row = Row::new("session_completions", &["session_id"], &columns, values)?;
            Ok(Command::CompleteSession {
                session_id: parse_ulid(row.required("session_id")?)?,
            })
        }
        "no_shows" => {
            let row = Row::new("no_shows", &["booking_id"], &columns, values)?;
            Ok(Command::MarkNoShow {
                booking_id: parse_ulid(row.required("booking_id")?)?,
            })
        }
        "holds" => {
            let row = Row::new("holds", HOLD_COLUMNS, &columns, values)?;
            Ok(Command::InsertHold {
                id: parse_ulid(row.required("id")?)?,
                owner: parse_text(row.required("owner")?)?,
                session_ids: parse_ulid_list(row.required("session_ids")?)?,
                ttl_ms: row.optional("ttl_ms", parse_i64)?,
            })
        }
        "hold_renewals" => {
            let row = Row::new("hold_renewals", &["hold_id", "owner"], &columns, values)?;
            Ok(Command::RenewHold {
                hold_id: parse_ulid(row.required("hold_id")?)?,
                owner: parse_text(row.required("owner")?)?,
            })
        }
        "bookings" => {
            let row = Row::new("bookings", BOOKING_COLUMNS, &columns, values)?;
            Ok(Command::ConfirmBooking {
                hold_id: parse_ulid(row.required("hold_id")?)?,
                owner: parse_text(row.required("owner")?)?,
                swimmer_id: parse_ulid(row.required("swimmer_id")?)?,
                parent_id: row.optional("parent_id", parse_ulid)?,
                po_id: row.optional("po_id", parse_ulid)?,
            })
        }
        "cancellations" => {
            let row = Row::new("cancellations", CANCELLATION_COLUMNS, &columns, values)?;
            let source = parse_text(row.required("source")?)?;
            Ok(Command::CancelBooking {
                booking_id: parse_ulid(row.required("booking_id")?)?,
                source: CancelSource::parse(&source)
                    .ok_or_else(|| SqlError::Parse(format!("unknown cancellation source: {source}")))?,
                reason: row.optional("reason", parse_text)?,
            })
        }
        "purchase_orders" => {
            let row = Row::new("purchase_orders", PO_COLUMNS, &columns, values)?;
            let po_type = parse_text(row.required("po_type")?)?;
            Ok(Command::InsertPurchaseOrder {
                id: parse_ulid(row.required("id")?)?,
                swimmer_id: parse_ulid(row.required("swimmer_id")?)?,
                funding_source_id: parse_ulid(row.required("funding_source_id")?)?,
                po_type: PoType::parse(&po_type)
                    .ok_or_else(|| SqlError::Parse(format!("unknown po_type: {po_type}")))?,
                start_date: parse_date(row.required("start_date")?)?,
                end_date: parse_date(row.required("end_date")?)?,
                sessions_authorized: parse_u32(row.required("sessions_authorized")?)?,
                parent_po_id: row.optional("parent_po_id", parse_ulid)?,
                external_id: row.optional("external_id", parse_text)?,
            })
        }
        "assessment_pairs" => {
            let row = Row::new(
                "assessment_pairs",
                &["swimmer_id", "funding_source_id", "assessment_date"],
                &columns,
                values,
            )?;
            Ok(Command::InsertAssessmentPair {
                swimmer_id: parse_ulid(row.required("swimmer_id")?)?,
                funding_source_id: parse_ulid(row.required("funding_source_id")?)?,
                assessment_date: parse_date(row.required("assessment_date")?)?,
            })
        }
        "po_renewals" => {
            let row = Row::new("po_renewals", &["po_id", "last_lesson_date"], &columns, values)?;
            Ok(Command::RenewPurchaseOrder {
                po_id: parse_ulid(row.required("po_id")?)?,
                last_lesson_date: parse_date(row.required("last_lesson_date")?)?,
            })
        }
        "po_approvals" => {
            let row = Row::new(
                "po_approvals",
                &["po_id", "authorization_number", "override"],
                &columns,
                values,
            )?;
            Ok(Command::ApprovePurchaseOrder {
                po_id: parse_ulid(row.required("po_id")?)?,
                authorization_number: row.optional("authorization_number", parse_text)?,
                override_pending_auth: row.optional("override", parse_bool)?.unwrap_or(false),
            })
        }
        "po_authorizations" => {
            let row = Row::new(
                "po_authorizations",
                &["po_id", "authorization_number"],
                &columns,
                values,
            )?;
            Ok(Command::AttachAuthorization {
                po_id: parse_ulid(row.required("po_id")?)?,
                authorization_number: parse_text(row.required("authorization_number")?)?,
            })
        }
        "po_billing" => {
            let row = Row::new("po_billing", BILLING_COLUMNS, &columns, values)?;
            let status = parse_text(row.required("status")?)?;
            Ok(Command::RecordBilling {
                po_id: parse_ulid(row.required("po_id")?)?,
                status: BillingStatus::parse(&status)
                    .ok_or_else(|| SqlError::Parse(format!("unknown billing status: {status}")))?,
                billed_amount_cents: row.optional("billed_amount", parse_i64)?,
                paid_amount_cents: row.optional("paid_amount", parse_i64)?,
                invoice_number: row.optional("invoice_number", parse_text)?,
                due_date: row.optional("due_date", parse_date)?,
                note: row.optional("note", parse_text)?,
            })
        }
        "po_payments" => {
            let row = Row::new("po_payments", &["po_id", "amount", "reference"], &columns, values)?;
            Ok(Command::RecordPayment {
                po_id: parse_ulid(row.required("po_id")?)?,
                amount_cents: parse_i64(row.required("amount")?)?,
                reference: row.optional("reference", parse_text)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One VALUES row with its values addressed by column name. Without an
/// explicit column list the table's columns are taken in declared order.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        known: &[&str],
        columns: &[String],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let columns: Vec<String> = if columns.is_empty() {
            if values.len() > known.len() {
                return Err(SqlError::WrongArity(table, known.len(), values.len()));
            }
            known[..values.len()].iter().map(|c| c.to_string()).collect()
        } else {
            if columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            if let Some(unknown) = columns.iter().find(|c| !known.contains(&c.as_str())) {
                return Err(SqlError::UnknownColumn(table, unknown.clone()));
            }
            columns.to_vec()
        };
        Ok(Self {
            table,
            columns,
            values,
        })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        match self.get(column) {
            Some(expr) if !is_null(expr) => Ok(expr),
            _ => Err(SqlError::MissingColumn(self.table, column)),
        }
    }

    /// Absent and NULL both read as `None`.
    fn optional<T>(
        &self,
        column: &str,
        parse: fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        match self.get(column) {
            Some(expr) if !is_null(expr) => parse(expr).map(Some),
            _ => Ok(None),
        }
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "sessions" => Ok(Command::CancelSession { id }),
        "holds" => Ok(Command::ReleaseHold { id }),
        "purchase_orders" => Ok(Command::CancelPurchaseOrder { id }),
        "bookings" => Err(SqlError::Unsupported(
            "bookings are cancelled with INSERT INTO cancellations".into(),
        )),
        _ => Err(SqlError::UnknownTable(table)),
    }
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "availability" => {
            let ids = filters.required("session_id")?;
            Ok(Command::SelectAvailability {
                session_ids: parse_ulids(ids)?,
            })
        }
        "holds" => Ok(Command::SelectHolds {
            id: filters.single_ulid("id")?,
        }),
        "bookings" => {
            let filter = if filters.get("swimmer_id").is_some() {
                BookingFilter::Swimmer(filters.single_ulid("swimmer_id")?)
            } else if filters.get("session_id").is_some() {
                BookingFilter::Session(filters.single_ulid("session_id")?)
            } else if filters.get("hold_id").is_some() {
                BookingFilter::Hold(filters.single_ulid("hold_id")?)
            } else {
                return Err(SqlError::MissingFilter("swimmer_id, session_id or hold_id"));
            };
            Ok(Command::SelectBookings { filter })
        }
        "purchase_orders" => {
            let lookup = if filters.get("swimmer_id").is_some() {
                PoLookup::Swimmer(filters.single_ulid("swimmer_id")?)
            } else {
                PoLookup::Id(filters.single_ulid("id")?)
            };
            Ok(Command::SelectPurchaseOrders { lookup })
        }
        "recurrence" => Ok(Command::SelectRecurrence {
            pattern: filters.pattern()?,
            instructors: parse_ulids(filters.required("instructor_id")?)?,
        }),
        "recurrence_plan" => Ok(Command::SelectRecurrencePlan {
            pattern: filters.pattern()?,
            instructor_id: filters.single_ulid("instructor_id")?,
            candidates: match filters.get("candidate_id") {
                Some(list) => parse_ulids(list)?,
                None => Vec::new(),
            },
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` and `col IN (...)` terms joined by AND.
#[derive(Default)]
struct Filters {
    terms: Vec<(String, Vec<Expr>)>,
}

impl Filters {
    fn get(&self, column: &str) -> Option<&[Expr]> {
        self.terms
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_slice())
    }

    fn required(&self, column: &'static str) -> Result<&[Expr], SqlError> {
        self.get(column).ok_or(SqlError::MissingFilter(column))
    }

    fn single(&self, column: &'static str) -> Result<&Expr, SqlError> {
        match self.required(column)? {
            [one] => Ok(one),
            _ => Err(SqlError::Parse(format!("{column} takes a single value"))),
        }
    }

    fn single_ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.single(column)?)
    }

    fn pattern(&self) -> Result<Pattern, SqlError> {
        let weekday = parse_i64(self.single("weekday")?)?;
        let weekday = u8::try_from(weekday)
            .ok()
            .filter(|d| *d <= 6)
            .ok_or_else(|| SqlError::Parse(format!("weekday {weekday} out of range 0..=6")))?;
        let time = match self.get("start_time") {
            Some(_) => self.single("start_time")?,
            None => self.single("time")?,
        };
        Ok(Pattern {
            weekday,
            time: parse_time(time)?,
            from_date: parse_date(self.single("from_date")?)?,
            to_date: parse_date(self.single("to_date")?)?,
        })
    }
}

fn collect_filters(expr: &Expr, out: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.terms.push((column, vec![right.as_ref().clone()]));
            Ok(())
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            let column = expr_column_name(expr)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {expr}")))?;
            if list.len() > MAX_IN_CLAUSE_IDS {
                return Err(SqlError::TooManyValues(list.len()));
            }
            out.terms.push((column, list.clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

fn single_insert_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_ulids(exprs: &[Expr]) -> Result<Vec<Ulid>, SqlError> {
    exprs.iter().map(parse_ulid).collect()
}

/// `ARRAY['a', 'b']` or a single `'a,b'` string.
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    let ids = match expr {
        Expr::Array(array) => parse_ulids(&array.elem)?,
        _ => parse_text(expr)?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}"))))
            .collect::<Result<_, _>>()?,
    };
    if ids.len() > MAX_IN_CLAUSE_IDS {
        return Err(SqlError::TooManyValues(ids.len()));
    }
    Ok(ids)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
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

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_text(expr)?;
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s}: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    TooManyValues(usize),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: {c} is required"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::TooManyValues(n) => {
                write!(f, "{n} values in one list (max {MAX_IN_CLAUSE_IDS})")
            }
        }
    }
}

impl std::error::Error for SqlError {}

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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::LaneholdAuthSource;
use crate::engine::{
    Approval, BillingUpdate, BookingPlan, BookingRequest, ConflictPolicy, DateWindow, Engine,
    EngineError, NewPurchaseOrder, NewSession, RecurrenceRequest, Resolution,
};
use crate::facility::FacilityManager;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, Pattern, PoLookup};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    facilities: Arc<FacilityManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(LaneholdFactory::new(facilities, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct LaneholdHandler {
    facilities: Arc<FacilityManager>,
    query_parser: Arc<LaneholdQueryParser>,
}

impl LaneholdHandler {
    pub fn new(facilities: Arc<FacilityManager>) -> Self {
        Self {
            facilities,
            query_parser: Arc::new(LaneholdQueryParser),
        }
    }

    /// The connection's database name picks the facility.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.facilities.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("facility error: {e}"),
            )))
        })
    }

    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "parse", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            // ── Sessions ─────────────────────────────────────
            Command::InsertSession {
                id,
                instructor_id,
                start,
                end,
                capacity,
                location,
                external_id,
            } => {
                engine
                    .capacity
                    .publish(NewSession {
                        id,
                        instructor_id,
                        span: Span { start, end },
                        capacity,
                        location,
                        external_id,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::CancelSession { id } => {
                engine
                    .orchestrator
                    .cancel_session(id, None)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::CompleteSession { session_id } => {
                let completion = engine
                    .orchestrator
                    .complete_session(session_id)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(completion.completed.len()))
            }
            Command::MarkNoShow { booking_id } => {
                engine
                    .orchestrator
                    .mark_no_show(booking_id)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }

            // ── Holds and bookings ───────────────────────────
            Command::InsertHold {
                id,
                owner,
                session_ids,
                ttl_ms,
            } => {
                engine
                    .holds
                    .create_hold_with_id(id, &session_ids, &owner, ttl_ms)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::ReleaseHold { id } => {
                engine.release_hold(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::RenewHold { hold_id, owner } => {
                engine.renew_hold(hold_id, &owner).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::ConfirmBooking {
                hold_id,
                owner,
                swimmer_id,
                parent_id,
                po_id,
            } => {
                let confirmation = engine
                    .confirm_booking(
                        hold_id,
                        &owner,
                        BookingRequest {
                            swimmer_id,
                            parent_id,
                            po_id,
                        },
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(booking_rows(confirmation.bookings))
            }
            Command::CancelBooking {
                booking_id,
                source,
                reason,
            } => {
                let outcome = engine
                    .cancel_booking(booking_id, source, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(usize::from(!outcome.already_cancelled)))
            }

            // ── Purchase orders ──────────────────────────────
            Command::InsertPurchaseOrder {
                id,
                swimmer_id,
                funding_source_id,
                po_type,
                start_date,
                end_date,
                sessions_authorized,
                parent_po_id,
                external_id,
            } => {
                engine
                    .ledger
                    .open(NewPurchaseOrder {
                        id,
                        swimmer_id,
                        funding_source_id,
                        po_type,
                        start_date,
                        end_date,
                        sessions_authorized,
                        parent_po_id,
                        external_id,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertAssessmentPair {
                swimmer_id,
                funding_source_id,
                assessment_date,
            } => {
                let (assessment, lessons) = engine
                    .ledger
                    .open_assessment_pair(swimmer_id, funding_source_id, assessment_date)
                    .await
                    .map_err(engine_err)?;
                Ok(purchase_order_rows(vec![assessment, lessons]))
            }
            Command::RenewPurchaseOrder {
                po_id,
                last_lesson_date,
            } => {
                let renewal = engine
                    .ledger
                    .open_renewal(po_id, last_lesson_date)
                    .await
                    .map_err(engine_err)?;
                Ok(purchase_order_rows(vec![renewal]))
            }
            Command::CancelPurchaseOrder { id } => {
                engine.ledger.cancel(id, None).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::ApprovePurchaseOrder {
                po_id,
                authorization_number,
                override_pending_auth,
            } => {
                engine
                    .approve_po(
                        po_id,
                        Approval {
                            authorization_number,
                            override_pending_auth,
                        },
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::AttachAuthorization {
                po_id,
                authorization_number,
            } => {
                engine
                    .ledger
                    .attach_authorization_number(po_id, &authorization_number)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::RecordBilling {
                po_id,
                status,
                billed_amount_cents,
                paid_amount_cents,
                invoice_number,
                due_date,
                note,
            } => {
                engine
                    .record_billing(
                        po_id,
                        BillingUpdate {
                            status,
                            billed_amount_cents,
                            paid_amount_cents,
                            invoice_number,
                            due_date,
                            note,
                        },
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::RecordPayment {
                po_id,
                amount_cents,
                reference,
            } => {
                engine
                    .ledger
                    .record_payment(po_id, amount_cents, reference)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }

            // ── Reads ────────────────────────────────────────
            Command::SelectAvailability { session_ids } => {
                let now = engine.now_ms();
                let mut states = Vec::with_capacity(session_ids.len());
                for id in session_ids {
                    states.push(engine.capacity.session(id).await.map_err(engine_err)?);
                }
                Ok(availability_rows(states, now))
            }
            Command::SelectHolds { id } => {
                let hold = engine.store().hold(id).await.map_err(engine_err)?;
                Ok(hold_rows(hold.into_iter().collect()))
            }
            Command::SelectBookings { filter } => {
                let bookings = engine.store().bookings(filter).await.map_err(engine_err)?;
                Ok(booking_rows(bookings))
            }
            Command::SelectPurchaseOrders { lookup } => {
                let pos = match lookup {
                    PoLookup::Id(id) => engine
                        .store()
                        .purchase_order(id)
                        .await
                        .map_err(engine_err)?
                        .into_iter()
                        .collect(),
                    PoLookup::Swimmer(swimmer_id) => engine
                        .store()
                        .purchase_orders()
                        .await
                        .map_err(engine_err)?
                        .into_iter()
                        .filter(|po| po.swimmer_id == swimmer_id)
                        .collect(),
                };
                Ok(purchase_order_rows(pos))
            }
            Command::SelectRecurrence {
                pattern,
                instructors,
            } => {
                let resolution = engine
                    .resolve_recurrence(&recurrence_request(pattern, instructors).map_err(engine_err)?)
                    .await
                    .map_err(engine_err)?;
                Ok(recurrence_rows(&resolution))
            }
            Command::SelectRecurrencePlan {
                pattern,
                instructor_id,
                candidates,
            } => {
                let mut instructors = vec![instructor_id];
                instructors.extend(candidates.iter().copied().filter(|c| *c != instructor_id));
                let resolution = engine
                    .resolve_recurrence(&recurrence_request(pattern, instructors).map_err(engine_err)?)
                    .await
                    .map_err(engine_err)?;
                let policy = if candidates.is_empty() {
                    ConflictPolicy::SkipConflicted
                } else {
                    ConflictPolicy::FindAlternative { candidates }
                };
                let plan = engine
                    .plan_recurring(&resolution, instructor_id, &policy)
                    .await
                    .map_err(engine_err)?;
                Ok(plan_rows(&resolution, &plan))
            }
        }
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn recurrence_request(pattern: Pattern, instructors: Vec<Ulid>) -> Result<RecurrenceRequest, EngineError> {
    Ok(RecurrenceRequest {
        weekday: pattern.weekday,
        time: pattern.time,
        window: DateWindow::new(pattern.from_date, pattern.to_date)?,
        instructors,
    })
}

// ── Result sets ──────────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn boolean(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text("session_id"),
        text("instructor_id"),
        int8("start"),
        int8("end"),
        int8("capacity"),
        int8("confirmed"),
        int8("held"),
        int8("available"),
        text("status"),
    ]
}

fn hold_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("owner"),
        text("session_ids"),
        int8("created_at"),
        int8("expires_at"),
        text("status"),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("session_id"),
        text("swimmer_id"),
        text("parent_id"),
        text("po_id"),
        text("hold_id"),
        text("status"),
        text("cancel_source"),
        text("cancel_reason"),
    ]
}

fn purchase_order_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("swimmer_id"),
        text("funding_source_id"),
        text("po_type"),
        text("start_date"),
        text("end_date"),
        text("status"),
        int8("sessions_authorized"),
        int8("sessions_booked"),
        int8("sessions_used"),
        int8("remaining"),
        text("authorization_number"),
        text("billing_status"),
        int8("billed_amount"),
        int8("paid_amount"),
        text("parent_po_id"),
    ]
}

fn recurrence_schema() -> Vec<FieldInfo> {
    vec![
        text("instructor_id"),
        text("date"),
        int8("start"),
        text("session_id"),
        int8("available_capacity"),
        text("conflict"),
        boolean("available_for_all"),
    ]
}

fn plan_schema() -> Vec<FieldInfo> {
    vec![
        text("date"),
        text("outcome"),
        text("instructor_id"),
        text("session_id"),
    ]
}

/// Pick the result schema from the statement text alone, before parameters
/// are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    let verb = words.first().copied().unwrap_or("");
    let target = words
        .windows(2)
        .find(|w| w[0] == "from" || w[0] == "into")
        .map(|w| w[1])
        .unwrap_or("");
    match (verb, target) {
        ("select", "availability") => availability_schema(),
        ("select", "holds") => hold_schema(),
        ("select", "bookings") | ("insert", "bookings") => booking_schema(),
        ("select", "purchase_orders")
        | ("insert", "assessment_pairs")
        | ("insert", "po_renewals") => purchase_order_schema(),
        ("select", "recurrence") => recurrence_schema(),
        ("select", "recurrence_plan") => plan_schema(),
        _ => vec![],
    }
}

fn query_response(schema: Vec<FieldInfo>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(Arc::new(schema), stream::iter(rows)))
}

fn availability_rows(states: Vec<SessionState>, now: Ms) -> Response {
    let schema = Arc::new(availability_schema());
    let rows: Vec<PgWireResult<DataRow>> = states
        .into_iter()
        .map(|state| {
            let session = &state.session;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&session.id.to_string())?;
            encoder.encode_field(&session.instructor_id.to_string())?;
            encoder.encode_field(&session.span.start)?;
            encoder.encode_field(&session.span.end)?;
            encoder.encode_field(&i64::from(session.capacity))?;
            encoder.encode_field(&i64::from(session.confirmed_count))?;
            encoder.encode_field(&i64::from(state.live_reservations(now)))?;
            encoder.encode_field(&i64::from(state.available(now)))?;
            encoder.encode_field(&session.status.as_str().to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(availability_schema(), rows)
}

fn hold_rows(holds: Vec<Hold>) -> Response {
    let schema = Arc::new(hold_schema());
    let rows: Vec<PgWireResult<DataRow>> = holds
        .into_iter()
        .map(|hold| {
            let session_ids = hold
                .session_ids
                .iter()
                .map(Ulid::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&hold.id.to_string())?;
            encoder.encode_field(&hold.owner)?;
            encoder.encode_field(&session_ids)?;
            encoder.encode_field(&hold.created_at)?;
            encoder.encode_field(&hold.expires_at)?;
            encoder.encode_field(&hold.status.as_str().to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(hold_schema(), rows)
}

fn booking_rows(bookings: Vec<Booking>) -> Response {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<DataRow>> = bookings
        .into_iter()
        .map(|booking| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&booking.id.to_string())?;
            encoder.encode_field(&booking.session_id.to_string())?;
            encoder.encode_field(&booking.swimmer_id.to_string())?;
            encoder.encode_field(&booking.parent_id.map(|id| id.to_string()))?;
            encoder.encode_field(&booking.po_id.map(|id| id.to_string()))?;
            encoder.encode_field(&booking.hold_id.map(|id| id.to_string()))?;
            encoder.encode_field(&booking.status.as_str().to_string())?;
            encoder.encode_field(
                &booking
                    .cancellation
                    .as_ref()
                    .map(|c| c.source.as_str().to_string()),
            )?;
            encoder.encode_field(&booking.cancellation.and_then(|c| c.reason))?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(booking_schema(), rows)
}

fn purchase_order_rows(pos: Vec<PurchaseOrder>) -> Response {
    let schema = Arc::new(purchase_order_schema());
    let rows: Vec<PgWireResult<DataRow>> = pos
        .into_iter()
        .map(|po| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&po.id.to_string())?;
            encoder.encode_field(&po.swimmer_id.to_string())?;
            encoder.encode_field(&po.funding_source_id.to_string())?;
            encoder.encode_field(&po.po_type.as_str().to_string())?;
            encoder.encode_field(&po.start_date.to_string())?;
            encoder.encode_field(&po.end_date.to_string())?;
            encoder.encode_field(&po.status.as_str().to_string())?;
            encoder.encode_field(&i64::from(po.sessions_authorized))?;
            encoder.encode_field(&i64::from(po.sessions_booked))?;
            encoder.encode_field(&i64::from(po.sessions_used))?;
            encoder.encode_field(&i64::from(po.remaining()))?;
            encoder.encode_field(&po.authorization_number)?;
            encoder.encode_field(&po.billing.status.as_str().to_string())?;
            encoder.encode_field(&po.billing.billed_amount_cents)?;
            encoder.encode_field(&po.billing.paid_amount_cents)?;
            encoder.encode_field(&po.parent_po_id.map(|id| id.to_string()))?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(purchase_order_schema(), rows)
}

/// One row per instructor per occurrence.
fn recurrence_rows(resolution: &Resolution) -> Response {
    let schema = Arc::new(recurrence_schema());
    let rows: Vec<PgWireResult<DataRow>> = resolution
        .instructors
        .iter()
        .flat_map(|instructor| instructor.slots.iter().map(move |slot| (instructor, slot)))
        .map(|(instructor, slot)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&instructor.instructor_id.to_string())?;
            encoder.encode_field(&slot.date.to_string())?;
            encoder.encode_field(&slot.start)?;
            encoder.encode_field(&slot.session_id.map(|id| id.to_string()))?;
            encoder.encode_field(&i64::from(slot.available_capacity))?;
            encoder.encode_field(&slot.conflict.map(|c| c.as_str().to_string()))?;
            encoder.encode_field(&instructor.available_for_all)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(recurrence_schema(), rows)
}

/// Every week of the pattern with how the plan covers it, in date order.
fn plan_rows(resolution: &Resolution, plan: &BookingPlan) -> Response {
    let mut entries: Vec<(chrono::NaiveDate, &'static str, Option<Ulid>, Option<Ulid>)> = Vec::new();
    if let Some(primary) = resolution.instructor(plan.instructor_id) {
        for slot in &primary.slots {
            if let Some(session_id) = slot.session_id.filter(|id| plan.session_ids.contains(id)) {
                entries.push((slot.date, "primary", Some(plan.instructor_id), Some(session_id)));
            }
        }
    }
    for alt in &plan.alternatives {
        entries.push((alt.date, "alternative", Some(alt.instructor_id), Some(alt.session_id)));
    }
    for date in &plan.skipped_dates {
        entries.push((*date, "skipped", None, None));
    }
    for date in &plan.unresolved_dates {
        entries.push((*date, "unresolved", None, None));
    }
    entries.sort_by_key(|(date, ..)| *date);

    let schema = Arc::new(plan_schema());
    let rows: Vec<PgWireResult<DataRow>> = entries
        .into_iter()
        .map(|(date, outcome, instructor_id, session_id)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&date.to_string())?;
            encoder.encode_field(&outcome.to_string())?;
            encoder.encode_field(&instructor_id.map(|id| id.to_string()))?;
            encoder.encode_field(&session_id.map(|id| id.to_string()))?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(plan_schema(), rows)
}

#[async_trait]
impl SimpleQueryHandler for LaneholdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LaneholdQueryParser;

#[async_trait]
impl QueryParser for LaneholdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
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
impl ExtendedQueryHandler for LaneholdHandler {
    type Statement = String;
    type QueryParser = LaneholdQueryParser;

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
        self.run(&engine, &sql).await
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

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Runs highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LaneholdFactory {
    handler: Arc<LaneholdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<LaneholdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LaneholdFactory {
    pub fn new(facilities: Arc<FacilityManager>, password: String) -> Self {
        let auth_source = LaneholdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(LaneholdHandler::new(facilities)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LaneholdFactory {
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

/// Engine failures carry their kind in the message so clients can branch on it.
fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        format!("{}: {e}", e.kind()),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed, LinesCodec, LinesCodecError};
use tracing::debug;
use ulid::Ulid;

use crate::engine::{now_ms, quantity_from_i64, Engine, EngineError};
use crate::limits::MAX_COMMAND_LEN;
use crate::model::*;
use crate::observability::{command_label, COMMANDS_TOTAL, COMMAND_DURATION_SECONDS};
use crate::pricing::PriceTable;
use crate::sql::{self, Command, SqlError};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error(transparent)]
    Sql(#[from] SqlError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl WireError {
    pub fn kind(&self) -> &'static str {
        match self {
            WireError::Sql(_) => "syntax",
            WireError::Engine(e) => e.kind(),
        }
    }
}

/// One answer line: a command tag plus zero or more JSON rows.
#[derive(Debug)]
pub struct Reply {
    pub tag: &'static str,
    pub rows: Vec<Value>,
}

impl Reply {
    fn done(tag: &'static str) -> Self {
        Self { tag, rows: Vec::new() }
    }

    fn rows(tag: &'static str, rows: Vec<Value>) -> Self {
        Self { tag, rows }
    }

    fn row(tag: &'static str, row: Value) -> Self {
        Self { tag, rows: vec![row] }
    }
}

fn encode_reply(result: &Result<Reply, WireError>) -> String {
    let body = match result {
        Ok(reply) => json!({ "ok": true, "tag": reply.tag, "rows": reply.rows }),
        Err(e) => json!({ "ok": false, "error": { "kind": e.kind(), "message": e.to_string() } }),
    };
    body.to_string()
}

// ── Row encoders ─────────────────────────────────────────────

fn park_row(park: &ParkProfile) -> Value {
    json!({ "id": park.id.to_string(), "name": park.name, "schedule": park.schedule })
}

fn template_row(t: &TimeSlotTemplate) -> Value {
    json!({
        "id": t.id.to_string(),
        "park_id": t.park_id.to_string(),
        "start_time": t.start_time.to_string(),
        "end_time": t.end_time.to_string(),
        "days_of_week": t.days_of_week,
        "valid_from": t.valid_from.to_string(),
        "valid_until": t.valid_until.map(|d| d.to_string()),
        "ticket_limit": t.ticket_limit,
        "price_adjustment": t.price_adjustment,
        "pricing_ids": t.pricing_ids.iter().map(Ulid::to_string).collect::<Vec<_>>(),
    })
}

fn instance_row(i: &SlotInstance) -> Value {
    let source = match i.source {
        SlotSource::Template(_) => "template",
        SlotSource::AutoFill => "autofill",
    };
    json!({
        "id": i.id.to_string(),
        "park_id": i.park_id.to_string(),
        "date": i.date.to_string(),
        "start": i.start.to_string(),
        "end": i.end.to_string(),
        "source": source,
        "template_id": i.template_id().map(|id| id.to_string()),
        "ticket_limit": i.ticket_limit,
        "available_tickets": i.available_tickets,
        "price_adjustment": i.price_adjustment,
        "pricing_ids": i.pricing_ids.iter().map(Ulid::to_string).collect::<Vec<_>>(),
    })
}

fn availability_row(a: &Availability) -> Value {
    json!({
        "instance_id": a.instance_id.to_string(),
        "available_tickets": a.available_tickets,
        "ticket_limit": a.ticket_limit,
    })
}

fn line_row(l: &CartLine) -> Value {
    json!({
        "id": l.id.to_string(),
        "cart_id": l.cart_id.to_string(),
        "instance_id": l.instance_id.to_string(),
        "pricing_id": l.pricing_id.to_string(),
        "quantity": l.quantity,
        "unit_price": l.unit_price,
        "total_price": l.total_price(),
        "status": l.status.as_str(),
        "used": l.used,
        "expires_at": l.expires_at,
    })
}

/// Executes protocol commands against one engine and its price list.
pub struct ParkSlotHandler {
    engine: Arc<Engine>,
    prices: Arc<PriceTable>,
}

impl ParkSlotHandler {
    pub fn new(engine: Arc<Engine>, prices: Arc<PriceTable>) -> Self {
        Self { engine, prices }
    }

    /// Parse, run and encode one command line.
    pub async fn execute_line(&self, line: &str) -> String {
        let result = match sql::parse_sql(line) {
            Ok(cmd) => {
                let label = command_label(&cmd);
                let start = Instant::now();
                let result = self.execute_command(cmd).await;
                let status = if result.is_ok() { "ok" } else { "error" };
                metrics::counter!(COMMANDS_TOTAL, "command" => label, "status" => status).increment(1);
                metrics::histogram!(COMMAND_DURATION_SECONDS, "command" => label)
                    .record(start.elapsed().as_secs_f64());
                result
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = &result {
            debug!(kind = e.kind(), "command failed: {e}");
        }
        encode_reply(&result)
    }

    pub async fn execute_command(&self, cmd: Command) -> Result<Reply, WireError> {
        let engine = &self.engine;
        let reply = match cmd {
            Command::InsertPark { id, name, schedule } => {
                engine.save_park(ParkProfile { id, name, schedule }).await?;
                Reply::done("INSERT")
            }
            Command::SelectParks { id: Some(id) } => Reply::row("SELECT", park_row(&engine.get_park(id)?)),
            Command::SelectParks { id: None } => {
                let mut parks = engine.list_parks();
                parks.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
                Reply::rows("SELECT", parks.iter().map(park_row).collect())
            }
            Command::InsertTemplate { id, draft } => {
                let template = if engine.get_template(id).is_ok() {
                    engine.update_template(id, draft).await?
                } else {
                    engine.create_template(id, draft).await?
                };
                Reply::row("INSERT", template_row(&template))
            }
            Command::DeleteTemplate { id } => {
                engine.delete_template(id).await?;
                Reply::done("DELETE")
            }
            Command::SelectTemplates { park_id, active_on } => {
                let templates = match active_on {
                    Some(date) => engine.active_templates(park_id, date)?,
                    None => engine.list_templates(park_id)?,
                };
                Reply::rows("SELECT", templates.iter().map(template_row).collect())
            }
            Command::InsertPrice { pricing_id, amount } => {
                if amount < 0 {
                    return Err(EngineError::InvalidInput("price must not be negative".into()).into());
                }
                self.prices.set(pricing_id, amount);
                Reply::done("INSERT")
            }
            Command::DeletePrice { pricing_id } => {
                self.prices
                    .remove(&pricing_id)
                    .ok_or(EngineError::not_found("pricing", pricing_id))?;
                Reply::done("DELETE")
            }
            Command::SelectHours { park_id, date } => {
                let hours = engine.resolve_hours(park_id, date)?;
                Reply::row(
                    "SELECT",
                    json!({
                        "park_id": park_id.to_string(),
                        "date": date.to_string(),
                        "open": hours.open.to_string(),
                        "close": hours.close.to_string(),
                    }),
                )
            }
            Command::Materialize { park_id, date } => {
                let instances = engine.materialize_for_date(park_id, date).await?;
                Reply::rows("INSERT", instances.iter().map(instance_row).collect())
            }
            Command::SelectSlots { park_id, date } => {
                let instances = engine.bookable_slots(park_id, date).await?;
                Reply::rows("SELECT", instances.iter().map(instance_row).collect())
            }
            Command::SelectInstances { park_id, date } => {
                let instances = engine.instances_for_date(park_id, date).await?;
                Reply::rows("SELECT", instances.iter().map(instance_row).collect())
            }
            Command::SelectAvailability { instance_id } => {
                Reply::row("SELECT", availability_row(&engine.query(instance_id).await?))
            }
            Command::Reserve { instance_id, quantity } => {
                let availability = engine.reserve(instance_id, quantity_from_i64(quantity)?).await?;
                Reply::row("INSERT", availability_row(&availability))
            }
            Command::Release { instance_id, quantity } => {
                let availability = engine.release(instance_id, quantity_from_i64(quantity)?).await?;
                Reply::row("INSERT", availability_row(&availability))
            }
            Command::InsertLine {
                id,
                cart_id,
                instance_id,
                pricing_id,
                quantity,
            } => {
                let quantity = quantity_from_i64(quantity)?;
                let line = engine
                    .add_line(id, cart_id, instance_id, pricing_id, quantity)
                    .await?;
                Reply::row("INSERT", line_row(&line))
            }
            Command::ResizeLine { line_id, quantity } => {
                let line = engine
                    .change_quantity(line_id, quantity_from_i64(quantity)?)
                    .await?;
                Reply::row("INSERT", line_row(&line))
            }
            Command::DeleteLine { line_id } => Reply::row("DELETE", line_row(&engine.remove_line(line_id).await?)),
            Command::SelectLines { cart_id, line_id } => {
                let lines = match (cart_id, line_id) {
                    (_, Some(line_id)) => {
                        let line = engine.get_line(line_id).await?;
                        if cart_id.is_some_and(|c| c != line.cart_id) {
                            Vec::new()
                        } else {
                            vec![line]
                        }
                    }
                    (Some(cart_id), None) => engine.cart_lines(cart_id).await,
                    (None, None) => Vec::new(),
                };
                Reply::rows("SELECT", lines.iter().map(line_row).collect())
            }
            Command::ConfirmLine { line_id } => Reply::row("INSERT", line_row(&engine.confirm_line(line_id).await?)),
            Command::Checkout { cart_id } => {
                let lines = engine.confirm_cart(cart_id).await?;
                Reply::rows("INSERT", lines.iter().map(line_row).collect())
            }
            Command::CancelLine { line_id } => Reply::row("INSERT", line_row(&engine.cancel_line(line_id).await?)),
            Command::UseLine { line_id } => Reply::row("INSERT", line_row(&engine.mark_used(line_id).await?)),
            Command::AbandonCart { cart_id } => {
                let lines = engine.abandon_cart(cart_id).await?;
                Reply::rows("DELETE", lines.iter().map(line_row).collect())
            }
            Command::ExpireHolds => {
                let released = engine.expire_holds(now_ms()).await;
                Reply::row("DELETE", json!({ "released": released }))
            }
        };
        Ok(reply)
    }
}

/// Serve one client: each newline-terminated command gets exactly one JSON line back.
/// A decoded command line, or the marker left by one that was too long.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    TooLong,
}

/// `LinesCodec` with an overlong line turned into a frame instead of an
/// error. The inner codec skips to the next newline, so the stream keeps
/// going after it.
pub struct CommandCodec {
    lines: LinesCodec,
}

impl CommandCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
        }
    }
}

fn too_long_as_frame(
    decoded: Result<Option<String>, LinesCodecError>,
) -> Result<Option<Frame>, LinesCodecError> {
    match decoded {
        Ok(line) => Ok(line.map(Frame::Line)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::TooLong)),
        Err(e) => Err(e),
    }
}

impl Decoder for CommandCodec {
    type Item = Frame;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, LinesCodecError> {
        too_long_as_frame(self.lines.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, LinesCodecError> {
        too_long_as_frame(self.lines.decode_eof(buf))
    }
}

impl<T: AsRef<str>> Encoder<T> for CommandCodec {
    type Error = LinesCodecError;

    fn encode(&mut self, line: T, dst: &mut BytesMut) -> Result<(), LinesCodecError> {
        self.lines.encode(line, dst)
    }
}

pub async fn process_connection(
    socket: TcpStream,
    handler: Arc<ParkSlotHandler>,
) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, CommandCodec::new(MAX_COMMAND_LEN));
    while let Some(frame) = framed.next().await {
        let line = match frame? {
            Frame::Line(line) => line,
            Frame::TooLong => {
                debug!("dropped overlong command line");
                let body = json!({
                    "ok": false,
                    "error": { "kind": "limit_exceeded", "message": "command line too long" },
                });
                framed.send(body.to_string()).await?;
                continue;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = handler.execute_line(line).await;
        framed.send(reply).await?;
    }
    Ok(())
}

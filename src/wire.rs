//! JSON-lines protocol: one request object per line in, one response object per line out.
//!
//! ```text
//! {"id":1,"op":"commit","candidate":{"room_id":"01J...","requester":{"id":"01J..."},"date":"2026-10-19","start":"10:00","end":"11:00"}}
//! {"id":1,"ok":true,"result":{"booking_id":"01J..."}}
//! ```

use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{AvailabilityQuery, Engine, EngineError, ValidationError};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability::{op_label, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};
use crate::policy::SettingValue;
use crate::violation::{Decision, Violation};

fn one() -> u32 {
    1
}

fn yes() -> bool {
    true
}

/// A candidate as sent by clients. Times stay strings until validated so a
/// malformed time is reported as a validation failure, not a framing error.
#[derive(Debug, Clone, Deserialize)]
pub struct CandidateInput {
    pub room_id: RoomId,
    pub requester: Requester,
    pub date: NaiveDate,
    pub start: String,
    pub end: String,
    #[serde(default = "one")]
    pub party_size: u32,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub participants: Vec<UserId>,
}

impl CandidateInput {
    pub fn into_candidate(self) -> Result<Candidate, ValidationError> {
        let span = Span::parse(&self.start, &self.end)?;
        let mut candidate =
            Candidate::new(self.room_id, self.requester, self.date, span).with_party_size(self.party_size);
        candidate.title = self.title;
        candidate.description = self.description;
        candidate.participants = self.participants;
        Ok(candidate)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomInput {
    #[serde(default)]
    pub id: Option<RoomId>,
    pub name: String,
    pub capacity: u32,
    #[serde(default)]
    pub floor: i32,
    #[serde(default)]
    pub equipment: BTreeSet<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "yes")]
    pub active: bool,
    #[serde(default)]
    pub constraints: Option<ConstraintSet>,
}

impl RoomInput {
    fn into_room(self, id: RoomId) -> Room {
        Room {
            id,
            name: self.name,
            capacity: self.capacity,
            floor: self.floor,
            equipment: self.equipment,
            description: self.description,
            active: self.active,
            constraints: self.constraints.filter(|c| !c.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Evaluate {
        candidate: CandidateInput,
        #[serde(default)]
        skip_min_participants: bool,
        #[serde(default)]
        exclude_booking_id: Option<BookingId>,
    },
    Commit {
        candidate: CandidateInput,
    },
    UpdateBooking {
        booking_id: BookingId,
        candidate: CandidateInput,
    },
    CancelBooking {
        booking_id: BookingId,
        requester: Requester,
    },
    ListAvailable {
        requester: Requester,
        date: NaiveDate,
        start: String,
        end: String,
        #[serde(default = "one")]
        party_size: u32,
        #[serde(default)]
        min_capacity: Option<u32>,
        #[serde(default)]
        required_equipment: BTreeSet<String>,
        #[serde(default)]
        exclude_booking_id: Option<BookingId>,
    },
    CreateRoom {
        room: RoomInput,
    },
    UpdateRoom {
        room_id: RoomId,
        room: RoomInput,
    },
    SetRoomActive {
        room_id: RoomId,
        active: bool,
    },
    GetRoom {
        room_id: RoomId,
    },
    ListRooms {
        #[serde(default)]
        include_inactive: bool,
    },
    GetBooking {
        booking_id: BookingId,
    },
    ListBookings {
        #[serde(default)]
        room_id: Option<RoomId>,
        #[serde(default)]
        requester_id: Option<UserId>,
        #[serde(default)]
        date: Option<NaiveDate>,
    },
    SetSetting {
        key: String,
        value: SettingValue,
    },
    GetSetting {
        key: String,
    },
    ListSettings {
        #[serde(default)]
        group: Option<String>,
    },
    GetPolicy,
    AddFavorite {
        user_id: UserId,
        room_id: RoomId,
    },
    RemoveFavorite {
        user_id: UserId,
        room_id: RoomId,
    },
    ListFavorites {
        user_id: UserId,
    },
}

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub op: Op,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub holders: Vec<Booking>,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub id: Option<Value>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn failed(id: Option<Value>, error: ErrorBody) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

/// Why a request produced no result.
#[derive(Debug)]
enum Failure {
    BadRequest(String),
    Engine(EngineError),
    Encode(serde_json::Error),
}

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        Failure::Engine(e)
    }
}

impl From<ValidationError> for Failure {
    fn from(e: ValidationError) -> Self {
        Failure::Engine(e.into())
    }
}

impl From<serde_json::Error> for Failure {
    fn from(e: serde_json::Error) -> Self {
        Failure::Encode(e)
    }
}

impl Failure {
    fn into_body(self) -> ErrorBody {
        let message = match &self {
            Failure::BadRequest(msg) => msg.clone(),
            Failure::Engine(e) => e.to_string(),
            Failure::Encode(e) => format!("failed to encode result: {e}"),
        };
        match self {
            Failure::BadRequest(_) => body("bad_request", message),
            Failure::Encode(_) => body("internal", message),
            Failure::Engine(EngineError::Rejected(violations)) => ErrorBody {
                violations,
                ..body("rejected", message)
            },
            Failure::Engine(EngineError::Conflict { holders, .. }) => ErrorBody {
                holders,
                ..body("conflict", message)
            },
            Failure::Engine(e) => body(e.kind(), message),
        }
    }
}

fn body(kind: &'static str, message: String) -> ErrorBody {
    ErrorBody {
        kind,
        message,
        violations: Vec::new(),
        holders: Vec::new(),
    }
}

fn decision_json(decision: &Decision) -> Value {
    json!({
        "admitted": decision.is_admitted(),
        "violations": decision.violations(),
    })
}

async fn dispatch(engine: &Engine, op: Op) -> Result<Value, Failure> {
    let value = match op {
        Op::Evaluate {
            candidate,
            skip_min_participants,
            exclude_booking_id,
        } => {
            let candidate = candidate.into_candidate()?;
            let opts = EvaluateOptions {
                skip_min_participants,
                exclude_booking_id,
            };
            decision_json(&engine.evaluate(&candidate, opts).await?)
        }
        Op::Commit { candidate } => {
            let id = engine.commit(candidate.into_candidate()?).await?;
            json!({ "booking_id": id })
        }
        Op::UpdateBooking { booking_id, candidate } => {
            let booking = engine.update_booking(booking_id, candidate.into_candidate()?).await?;
            serde_json::to_value(booking)?
        }
        Op::CancelBooking { booking_id, requester } => {
            let booking = engine.cancel_booking(booking_id, requester).await?;
            serde_json::to_value(booking)?
        }
        Op::ListAvailable {
            requester,
            date,
            start,
            end,
            party_size,
            min_capacity,
            required_equipment,
            exclude_booking_id,
        } => {
            let query = AvailabilityQuery {
                party_size,
                min_capacity,
                required_equipment,
                exclude_booking_id,
                ..AvailabilityQuery::new(requester, date, Span::parse(&start, &end)?)
            };
            serde_json::to_value(engine.list_available(&query).await?)?
        }
        Op::CreateRoom { room } => {
            let id = room.id.unwrap_or_else(Ulid::new);
            engine.create_room(room.into_room(id)).await?;
            json!({ "room_id": id })
        }
        Op::UpdateRoom { room_id, room } => {
            if room.id.is_some_and(|id| id != room_id) {
                return Err(Failure::BadRequest("room.id does not match room_id".into()));
            }
            engine.update_room(room.into_room(room_id)).await?;
            json!({ "room_id": room_id })
        }
        Op::SetRoomActive { room_id, active } => {
            engine.set_room_active(room_id, active).await?;
            json!({ "room_id": room_id, "active": active })
        }
        Op::GetRoom { room_id } => {
            let room = engine.get_room(room_id).await?;
            json!({ "room": room, "summary": RoomSummary::from(&room) })
        }
        Op::ListRooms { include_inactive } => serde_json::to_value(engine.list_rooms(include_inactive).await?)?,
        Op::GetBooking { booking_id } => serde_json::to_value(engine.get_booking(booking_id).await?)?,
        Op::ListBookings {
            room_id,
            requester_id,
            date,
        } => match (room_id, requester_id, date) {
            (Some(room_id), None, Some(date)) => serde_json::to_value(engine.bookings_for_room(room_id, date).await?)?,
            (None, Some(requester_id), from) => {
                serde_json::to_value(engine.bookings_for_requester(requester_id, from).await?)?
            }
            _ => {
                return Err(Failure::BadRequest(
                    "list_bookings needs either room_id and date, or requester_id".into(),
                ));
            }
        },
        Op::SetSetting { key, value } => {
            engine.set_setting(&key, value).await?;
            json!({ "key": key })
        }
        Op::GetSetting { key } => serde_json::to_value(engine.get_setting(&key))?,
        Op::ListSettings { group } => {
            let mut settings = serde_json::Map::new();
            for (key, setting) in engine.list_settings(group.as_deref()) {
                settings.insert(key, serde_json::to_value(setting)?);
            }
            Value::Object(settings)
        }
        Op::GetPolicy => serde_json::to_value(engine.policy())?,
        Op::AddFavorite { user_id, room_id } => {
            let added = engine.add_favorite(user_id, room_id).await?;
            json!({ "changed": added })
        }
        Op::RemoveFavorite { user_id, room_id } => {
            let removed = engine.remove_favorite(user_id, room_id).await?;
            json!({ "changed": removed })
        }
        Op::ListFavorites { user_id } => serde_json::to_value(engine.favorites(user_id))?,
    };
    Ok(value)
}

/// Parse, execute and answer one request line.
pub async fn handle_line(engine: &Engine, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            metrics::counter!(REQUESTS_TOTAL, "op" => "unknown", "status" => "bad_request").increment(1);
            return Response::failed(None, body("bad_request", format!("malformed request: {e}")));
        }
    };
    let label = op_label(&request.op);
    let start = Instant::now();
    let outcome = dispatch(engine, request.op).await;
    metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => label).record(start.elapsed().as_secs_f64());

    match outcome {
        Ok(result) => {
            metrics::counter!(REQUESTS_TOTAL, "op" => label, "status" => "ok").increment(1);
            Response::ok(request.id, result)
        }
        Err(failure) => {
            let body = failure.into_body();
            metrics::counter!(REQUESTS_TOTAL, "op" => label, "status" => body.kind).increment(1);
            if body.kind == "storage" || body.kind == "internal" {
                warn!(op = label, "{}", body.message);
            } else {
                debug!(op = label, kind = body.kind, "{}", body.message);
            }
            Response::failed(request.id, body)
        }
    }
}

/// Serve one client until it disconnects. An oversized line is answered and
/// then the connection is closed, since the framing can no longer be trusted.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    while let Some(frame) = framed.next().await {
        let (response, close) = match frame {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => (handle_line(&engine, &line).await, false),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!("request line over {MAX_LINE_LEN} bytes, closing connection");
                let body = body("bad_request", format!("request line exceeds {MAX_LINE_LEN} bytes"));
                (Response::failed(None, body), true)
            }
            Err(LinesCodecError::Io(e)) => return Err(e),
        };
        let encoded = serde_json::to_string(&response).map_err(io::Error::other)?;
        framed.send(encoded).await.map_err(|e| match e {
            LinesCodecError::Io(e) => e,
            other => io::Error::other(other),
        })?;
        if close {
            break;
        }
    }
    Ok(())
}

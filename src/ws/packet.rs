//! Packet envelopes.
//!
//! Every outbound frame is `{ "id": ..., "goal": n, ...fields }`. Replies echo
//! the id and goal and add `resultCode` and an optional `resultCodeMessage`.

use std::sync::Mutex;
use std::time::Instant;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::error::ProtocolError;
use super::goal::Goal;
use super::subscription::Subscription;
use crate::core::constants::RESULT_CODE_SUCCESS;
use crate::core::{Deferred, ResultCode};

const ID_LEN: usize = 16;

/// Random packet/subscription id.
pub(crate) fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect()
}

/// Outbound packet body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketRequest {
    id: String,
    goal: Goal,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl PacketRequest {
    /// Packet with a fresh id and no extra fields.
    pub fn new(goal: Goal) -> Self {
        Self::with_id(random_id(), goal)
    }

    /// Packet with an explicit id.
    pub fn with_id(id: impl Into<String>, goal: Goal) -> Self {
        Self {
            id: id.into(),
            goal,
            fields: Map::new(),
        }
    }

    /// Add a goal-specific field.
    pub fn field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Authenticate with `token`.
    pub fn auth(token: &str) -> Self {
        Self::new(Goal::Auth).field("token", json!(token))
    }

    /// Announce presence.
    pub fn presence(online: bool) -> Self {
        Self::new(Goal::Presence).field("online", json!(online))
    }

    /// Open `subscription`. The packet id is the subscription's client id.
    pub fn subscribe(subscription: &Subscription) -> Self {
        Self::with_id(subscription.id(), Goal::Subscribe)
            .field("type", json!(subscription.kind()))
            .field("operation", json!(subscription.operations().bits()))
            .field("params", subscription.params())
    }

    /// Close the subscription opened by `request_id`.
    pub fn unsubscribe(request_id: &str, subscription_id: Option<&str>) -> Self {
        let packet = Self::new(Goal::Unsubscribe).field("requestId", json!(request_id));
        match subscription_id {
            Some(id) => packet.field("subscriptionId", json!(id)),
            None => packet,
        }
    }

    /// Query connection status.
    pub fn status() -> Self {
        Self::new(Goal::Status)
    }

    /// Packet id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Packet goal.
    pub fn goal(&self) -> Goal {
        self.goal
    }

    /// Goal-specific fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Encode as a text frame.
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

fn success_code() -> i64 {
    RESULT_CODE_SUCCESS
}

/// Inbound packet body: a reply or a data push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketResponse {
    /// Echoed request id. Data pushes may omit it.
    #[serde(default)]
    pub id: Option<String>,

    /// Packet goal.
    pub goal: Goal,

    /// Result code, `0` when absent.
    #[serde(rename = "resultCode", default = "success_code")]
    pub result_code: i64,

    /// Optional server message.
    #[serde(
        rename = "resultCodeMessage",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub result_code_message: Option<String>,

    /// Goal-specific fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl PacketResponse {
    /// Decode a text frame.
    pub fn from_frame(frame: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Tagged result code.
    pub fn code(&self) -> ResultCode {
        ResultCode::from_code(self.result_code)
    }

    /// Whether the server reported success.
    pub fn is_success(&self) -> bool {
        self.code().is_success()
    }

    /// A goal-specific field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Fail with [`ProtocolError::Rejected`] unless the code is success.
    pub fn into_result(self) -> Result<Self, ProtocolError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ProtocolError::Rejected {
                goal: self.goal,
                code: self.result_code,
                message: self.result_code_message,
            })
        }
    }
}

#[derive(Debug, Default)]
struct Exchange {
    response: Option<PacketResponse>,
    sent_at: Option<Instant>,
    received_at: Option<Instant>,
    attempts: u32,
}

/// One outbound request and its eventual reply.
///
/// The id and goal come from the request and never change. The response slot
/// is filled at most once and must echo both.
#[derive(Debug)]
pub struct Packet {
    request: PacketRequest,
    created_at: Instant,
    exchange: Mutex<Exchange>,
    reply: Deferred<PacketResponse, ProtocolError>,
}

impl Packet {
    /// Wrap `request`.
    pub fn new(request: PacketRequest) -> Self {
        Self {
            request,
            created_at: Instant::now(),
            exchange: Mutex::new(Exchange::default()),
            reply: Deferred::new(),
        }
    }

    fn exchange(&self) -> std::sync::MutexGuard<'_, Exchange> {
        self.exchange
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Packet id.
    pub fn id(&self) -> &str {
        self.request.id()
    }

    /// Packet goal.
    pub fn goal(&self) -> Goal {
        self.request.goal()
    }

    /// The request body.
    pub fn request(&self) -> &PacketRequest {
        &self.request
    }

    /// The reply, once received.
    pub fn response(&self) -> Option<PacketResponse> {
        self.exchange().response.clone()
    }

    /// When the packet was built.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the packet was last written to the socket.
    pub fn sent_at(&self) -> Option<Instant> {
        self.exchange().sent_at
    }

    /// When the reply arrived.
    pub fn received_at(&self) -> Option<Instant> {
        self.exchange().received_at
    }

    /// Times the packet was written to the socket.
    pub fn attempts(&self) -> u32 {
        self.exchange().attempts
    }

    /// Record a write to the socket.
    pub fn mark_sent(&self) {
        let mut exchange = self.exchange();
        exchange.sent_at = Some(Instant::now());
        exchange.attempts += 1;
    }

    /// Reply handle.
    pub fn reply(&self) -> &Deferred<PacketResponse, ProtocolError> {
        &self.reply
    }

    /// Store the reply and resolve the handle.
    ///
    /// A reply whose id or goal differs from the request rejects the handle.
    pub fn set_response(&self, response: PacketResponse) -> Result<(), ProtocolError> {
        if let Some(id) = response.id.as_deref() {
            if id != self.id() {
                let error = ProtocolError::IdMismatch {
                    expected: self.id().to_string(),
                    actual: id.to_string(),
                };
                self.reply.reject(error.clone())?;
                return Err(error);
            }
        }
        if response.goal != self.goal() {
            let error = ProtocolError::GoalMismatch {
                expected: self.goal(),
                actual: response.goal,
            };
            self.reply.reject(error.clone())?;
            return Err(error);
        }

        {
            let mut exchange = self.exchange();
            if exchange.response.is_none() {
                exchange.response = Some(response.clone());
                exchange.received_at = Some(Instant::now());
            }
        }
        self.reply.resolve(response)?;
        Ok(())
    }

    /// Reject the reply handle.
    pub fn fail(&self, error: ProtocolError) -> Result<(), ProtocolError> {
        self.reply.reject(error)?;
        Ok(())
    }
}

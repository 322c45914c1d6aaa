//! Message types for the weft wire protocol
//!
//! Every message shares a versioned [`Header`]; the four variants add their
//! own fields on top of it. The wire type tags are fixed by the protocol and
//! must never be renumbered.

use bytes::Bytes;
use uuid::Uuid;

/// Current wire format version written by this client.
pub const DEFAULT_MESSAGE_VERSION: i32 = 2;

/// Wire type tag for each message variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Event = 2,
    Error = 3,
}

impl MessageType {
    pub fn from_wire(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(MessageType::Request),
            1 => Some(MessageType::Response),
            2 => Some(MessageType::Event),
            3 => Some(MessageType::Error),
            _ => None,
        }
    }
}

/// Fields shared by every message variant.
///
/// `message_id` is generated at construction and is globally unique per
/// message instance. The `other_fields` list keeps insertion order because
/// the v1 wire section is an ordered, flattened key/value sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub message_id: String,
    pub version: i32,
    pub destination_topic: String,
    pub payload: Bytes,
    pub source_client_id: String,
    pub source_broker_id: String,
    pub broker_ids: Vec<String>,
    pub client_ids: Vec<String>,
    // Version 1 fields
    pub other_fields: Vec<(String, String)>,
    // Version 2 fields
    pub source_tenant_guid: String,
    pub destination_tenant_guids: Vec<String>,
}

impl Header {
    pub fn new(destination_topic: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            version: DEFAULT_MESSAGE_VERSION,
            destination_topic: destination_topic.into(),
            payload: Bytes::new(),
            source_client_id: String::new(),
            source_broker_id: String::new(),
            broker_ids: Vec::new(),
            client_ids: Vec::new(),
            other_fields: Vec::new(),
            source_tenant_guid: String::new(),
            destination_tenant_guids: Vec::new(),
        }
    }

    /// Look up a value in the ordered `other_fields` list.
    pub fn other_field(&self, key: &str) -> Option<&str> {
        self.other_fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Event messages are fire-and-forget notifications published to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub header: Header,
}

impl Event {
    pub fn new(destination_topic: impl Into<String>) -> Self {
        Self {
            header: Header::new(destination_topic),
        }
    }
}

/// Request messages address a service and carry the topic replies go to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub header: Header,
    pub reply_to_topic: String,
    pub service_id: String,
}

impl Request {
    pub fn new(destination_topic: impl Into<String>) -> Self {
        Self {
            header: Header::new(destination_topic),
            reply_to_topic: String::new(),
            service_id: String::new(),
        }
    }
}

/// Response messages are sent by service instances upon receiving a Request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub header: Header,
    pub request_message_id: String,
    pub service_id: String,
}

impl Response {
    pub fn new() -> Self {
        Self {
            header: Header::new(""),
            request_message_id: String::new(),
            service_id: String::new(),
        }
    }

    /// Build a response addressed back to the sender of `request`.
    pub fn for_request(request: &Request) -> Self {
        let mut header = Header::new(request.reply_to_topic.clone());
        if !request.header.source_client_id.is_empty() {
            header.client_ids = vec![request.header.source_client_id.clone()];
        }
        if !request.header.source_broker_id.is_empty() {
            header.broker_ids = vec![request.header.source_broker_id.clone()];
        }
        Self {
            header,
            request_message_id: request.header.message_id.clone(),
            service_id: request.service_id.clone(),
        }
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

/// Error responses are sent by the fabric or a service instead of a Response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub header: Header,
    pub request_message_id: String,
    pub service_id: String,
    pub error_code: i32,
    pub error_message: String,
}

impl ErrorResponse {
    pub fn new(error_code: i32, error_message: impl Into<String>) -> Self {
        Self {
            header: Header::new(""),
            request_message_id: String::new(),
            service_id: String::new(),
            error_code,
            error_message: error_message.into(),
        }
    }

    /// Build an error response addressed back to the sender of `request`.
    pub fn for_request(request: &Request, error_code: i32, error_message: impl Into<String>) -> Self {
        let response = Response::for_request(request);
        Self {
            header: response.header,
            request_message_id: response.request_message_id,
            service_id: response.service_id,
            error_code,
            error_message: error_message.into(),
        }
    }
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Event(Event),
    Request(Request),
    Response(Response),
    Error(ErrorResponse),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Event(_) => MessageType::Event,
            Message::Request(_) => MessageType::Request,
            Message::Response(_) => MessageType::Response,
            Message::Error(_) => MessageType::Error,
        }
    }

    pub fn header(&self) -> &Header {
        match self {
            Message::Event(m) => &m.header,
            Message::Request(m) => &m.header,
            Message::Response(m) => &m.header,
            Message::Error(m) => &m.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut Header {
        match self {
            Message::Event(m) => &mut m.header,
            Message::Request(m) => &mut m.header,
            Message::Response(m) => &mut m.header,
            Message::Error(m) => &mut m.header,
        }
    }
}

/// A reply correlated to an in-flight request: either a normal response or an
/// error response from the fabric or service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Response(Response),
    Error(ErrorResponse),
}

impl Reply {
    /// The `request_message_id` this reply correlates to.
    pub fn request_message_id(&self) -> &str {
        match self {
            Reply::Response(r) => &r.request_message_id,
            Reply::Error(e) => &e.request_message_id,
        }
    }

    pub fn header(&self) -> &Header {
        match self {
            Reply::Response(r) => &r.header,
            Reply::Error(e) => &e.header,
        }
    }

    /// Split the two cases: a normal response becomes `Ok`, an error reply
    /// becomes `Err` with its code and message intact.
    pub fn into_result(self) -> std::result::Result<Response, ErrorResponse> {
        match self {
            Reply::Response(r) => Ok(r),
            Reply::Error(e) => Err(e),
        }
    }
}

impl From<Reply> for Message {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Response(r) => Message::Response(r),
            Reply::Error(e) => Message::Error(e),
        }
    }
}

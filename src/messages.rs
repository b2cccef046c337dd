//! # Wire Protocol Messages
//!
//! Every datagram carries exactly one bencoded dictionary with single-digit
//! keys:
//!
//! | Key | Request | Response | Error |
//! |-----|---------|----------|-------|
//! | `0` | `0` | `1` | `2` |
//! | `1` | transaction id (20 bytes) | same | same |
//! | `2` | sender node id | same | same |
//! | `3` | method | payload | exception type |
//! | `4` | args (always present) | - | response strings |
//!
//! Because bencoded dictionaries are key-sorted, every message starts with
//! `d1:0i<type>e`. [`peek_kind`] reads the type from that fixed prefix so the
//! node can pick the right decoder without a speculative full parse.
//!
//! ## Response payload shapes
//!
//! Responses carry no explicit discriminant; the payload shape tells them
//! apart, so [`Response::to_bencode`] checks the optional fields in this
//! order:
//!
//! 1. `data` set: a plain string (`"pong"`, `"OK"`)
//! 2. `find_value_key` set: `{<hash>: [compact contacts], "token": token}`
//! 3. `token` set: `{"contacts": [contacts], "token": token}`
//! 4. otherwise: `[contacts]`

use std::fmt;

use rand::RngCore;

use crate::bencode::{BencodeError, DictBuilder, Value};
use crate::bits::{Bitmap, BitmapError};
use crate::contact::Contact;

pub const MESSAGE_ID_LENGTH: usize = 20;

const HEADER_TYPE_FIELD: &str = "0";
const HEADER_MESSAGE_ID_FIELD: &str = "1";
const HEADER_NODE_ID_FIELD: &str = "2";
const HEADER_PAYLOAD_FIELD: &str = "3";
const HEADER_ARGS_FIELD: &str = "4";

const CONTACTS_FIELD: &str = "contacts";
const TOKEN_FIELD: &str = "token";

const STORE_VALUE_TOKEN_FIELD: &str = "token";
const STORE_VALUE_PUBLISHER_FIELD: &str = "publisher";
const STORE_VALUE_PORT_FIELD: &str = "port";

/// Payload of a successful ping.
pub const PING_SUCCESS_RESPONSE: &str = "pong";

/// Payload of a successful store.
pub const STORE_SUCCESS_RESPONSE: &str = "OK";

pub const ERROR_INVALID_TOKEN: &str = "invalid-token";
pub const ERROR_INVALID_METHOD: &str = "invalid-request-method";
pub const ERROR_MISSING_ARG: &str = "missing-arg";

/// Prefix shared by every encoded message: `d`, key `1:0`, integer opener `i`.
const KIND_PREFIX: &[u8] = b"d1:0i";

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageId(pub [u8; MESSAGE_ID_LENGTH]);

impl MessageId {
    pub fn random() -> Self {
        let mut id = [0u8; MESSAGE_ID_LENGTH];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        let arr: [u8; MESSAGE_ID_LENGTH] =
            bytes.try_into().map_err(|_| DecodeError::BadLength {
                field: "message id",
                expected: MESSAGE_ID_LENGTH,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Debug)]
pub enum DecodeError {
    Bencode(BencodeError),
    UnknownMessageType,
    NotADict,
    MissingField(&'static str),
    WrongType(&'static str),
    BadLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    Identifier(BitmapError),
    MalformedArgs(String),
    MalformedContact(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Bencode(e) => write!(f, "bencode: {}", e),
            DecodeError::UnknownMessageType => write!(f, "unknown message type"),
            DecodeError::NotADict => write!(f, "message is not a dictionary"),
            DecodeError::MissingField(field) => write!(f, "missing field {}", field),
            DecodeError::WrongType(field) => write!(f, "field {} has the wrong type", field),
            DecodeError::BadLength {
                field,
                expected,
                actual,
            } => write!(f, "{} is {} bytes, expected {}", field, actual, expected),
            DecodeError::Identifier(e) => write!(f, "identifier: {}", e),
            DecodeError::MalformedArgs(reason) => write!(f, "malformed store args: {}", reason),
            DecodeError::MalformedContact(reason) => write!(f, "malformed contact: {}", reason),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<BencodeError> for DecodeError {
    fn from(err: BencodeError) -> Self {
        DecodeError::Bencode(err)
    }
}

impl From<BitmapError> for DecodeError {
    fn from(err: BitmapError) -> Self {
        DecodeError::Identifier(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// A found-value response must carry a token for the follow-up store.
    MissingToken,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::MissingToken => write!(f, "find-value response without a token"),
        }
    }
}

impl std::error::Error for EncodeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request = 0,
    Response = 1,
    Error = 2,
}

/// Read the message type from the fixed header prefix without decoding the rest.
pub fn peek_kind(data: &[u8]) -> Option<MessageKind> {
    if data.len() < KIND_PREFIX.len() + 2 || !data.starts_with(KIND_PREFIX) {
        return None;
    }
    if data[KIND_PREFIX.len() + 1] != b'e' {
        return None;
    }
    match data[KIND_PREFIX.len()] {
        b'0' => Some(MessageKind::Request),
        b'1' => Some(MessageKind::Response),
        b'2' => Some(MessageKind::Error),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Ping,
    Store,
    FindNode,
    FindValue,
    /// Anything else a peer sent; answered with an error.
    Unknown(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Ping => "ping",
            Method::Store => "store",
            Method::FindNode => "findNode",
            Method::FindValue => "findValue",
            Method::Unknown(name) => name,
        }
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        match bytes {
            b"ping" => Method::Ping,
            b"store" => Method::Store,
            b"findNode" => Method::FindNode,
            b"findValue" => Method::FindValue,
            other => Method::Unknown(String::from_utf8_lossy(other).into_owned()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `value` element of store args.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreArgsValue {
    pub token: Vec<u8>,
    /// Node that holds the blob.
    pub publisher: Bitmap,
    /// Port the publisher serves blobs on.
    pub port: u16,
}

/// Arguments of a `store` request: `[blob_hash, value, node_id, self_store]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreArgs {
    pub blob_hash: Bitmap,
    pub value: StoreArgsValue,
    /// Node that originally published the blob.
    pub node_id: Bitmap,
    pub self_store: bool,
}

impl StoreArgs {
    pub fn to_bencode(&self) -> Value {
        let value = DictBuilder::new()
            .insert(STORE_VALUE_TOKEN_FIELD, Value::bytes(self.value.token.clone()))
            .insert(
                STORE_VALUE_PUBLISHER_FIELD,
                Value::bytes(self.value.publisher.as_bytes().to_vec()),
            )
            .insert(STORE_VALUE_PORT_FIELD, Value::Int(i64::from(self.value.port)))
            .build();
        Value::List(vec![
            Value::bytes(self.blob_hash.as_bytes().to_vec()),
            value,
            Value::bytes(self.node_id.as_bytes().to_vec()),
            Value::Int(i64::from(self.self_store)),
        ])
    }

    pub fn from_bencode(value: &Value) -> Result<Self, DecodeError> {
        let items = value
            .as_list()
            .ok_or_else(|| DecodeError::MalformedArgs("args are not a list".into()))?;
        let [blob_hash, inner, node_id, self_store] = items else {
            return Err(DecodeError::MalformedArgs(format!(
                "expected 4 elements, got {}",
                items.len()
            )));
        };

        let blob_hash = bitmap_from(blob_hash, "blob hash")?;
        let node_id = bitmap_from(node_id, "node id")?;
        let self_store = match self_store.as_int() {
            Some(0) => false,
            Some(1) => true,
            _ => {
                return Err(DecodeError::MalformedArgs(
                    "self-store flag must be 0 or 1".into(),
                ));
            }
        };

        let inner = inner
            .as_dict()
            .ok_or_else(|| DecodeError::MalformedArgs("value is not a dictionary".into()))?;
        let token = inner
            .get(STORE_VALUE_TOKEN_FIELD.as_bytes())
            .and_then(Value::as_bytes)
            .ok_or_else(|| DecodeError::MalformedArgs("value has no token".into()))?
            .to_vec();
        let publisher = inner
            .get(STORE_VALUE_PUBLISHER_FIELD.as_bytes())
            .ok_or_else(|| DecodeError::MalformedArgs("value has no publisher".into()))
            .and_then(|v| bitmap_from(v, "publisher"))?;
        let port = inner
            .get(STORE_VALUE_PORT_FIELD.as_bytes())
            .and_then(Value::as_int)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| DecodeError::MalformedArgs("value port missing or out of range".into()))?;

        Ok(Self {
            blob_hash,
            value: StoreArgsValue {
                token,
                publisher,
                port,
            },
            node_id,
            self_store,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: MessageId,
    pub node_id: Bitmap,
    pub method: Method,
    pub arg: Option<Bitmap>,
    pub store_args: Option<StoreArgs>,
}

impl Request {
    /// Transaction and sender ids are filled in by the node when sending.
    fn with_method(method: Method) -> Self {
        Self {
            id: MessageId::default(),
            node_id: Bitmap::zero(),
            method,
            arg: None,
            store_args: None,
        }
    }

    pub fn ping() -> Self {
        Self::with_method(Method::Ping)
    }

    pub fn find_node(target: Bitmap) -> Self {
        Self {
            arg: Some(target),
            ..Self::with_method(Method::FindNode)
        }
    }

    pub fn find_value(target: Bitmap) -> Self {
        Self {
            arg: Some(target),
            ..Self::with_method(Method::FindValue)
        }
    }

    pub fn store(args: StoreArgs) -> Self {
        Self {
            store_args: Some(args),
            ..Self::with_method(Method::Store)
        }
    }

    pub fn to_bencode(&self) -> Value {
        let args = if let Some(store_args) = &self.store_args {
            store_args.to_bencode()
        } else if let Some(arg) = &self.arg {
            Value::List(vec![Value::bytes(arg.as_bytes().to_vec())])
        } else {
            // the decoder relies on key 4 always being present
            Value::List(Vec::new())
        };
        header(MessageKind::Request, &self.id, &self.node_id)
            .insert(HEADER_PAYLOAD_FIELD, Value::bytes(self.method.as_str()))
            .insert(HEADER_ARGS_FIELD, args)
            .build()
    }

    pub fn from_bencode(value: &Value) -> Result<Self, DecodeError> {
        let (id, node_id) = decode_header(value)?;
        let method = field(value, HEADER_PAYLOAD_FIELD)?
            .as_bytes()
            .map(Method::from_bytes)
            .ok_or(DecodeError::WrongType(HEADER_PAYLOAD_FIELD))?;
        let args = field(value, HEADER_ARGS_FIELD)?;

        let mut request = Self {
            id,
            node_id,
            method,
            arg: None,
            store_args: None,
        };
        if request.method == Method::Store {
            request.store_args = Some(StoreArgs::from_bencode(args)?);
        } else {
            let list = args
                .as_list()
                .ok_or(DecodeError::WrongType(HEADER_ARGS_FIELD))?;
            if let Some(first) = list.first() {
                request.arg = Some(bitmap_from(first, "arg")?);
            }
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    pub id: MessageId,
    pub node_id: Bitmap,
    pub data: Option<String>,
    pub contacts: Vec<Contact>,
    pub find_value_key: Option<Bitmap>,
    pub token: Option<Vec<u8>>,
}

impl Response {
    /// Empty reply to `request` from `node_id`.
    pub fn to(request: &Request, node_id: Bitmap) -> Self {
        Self {
            id: request.id,
            node_id,
            ..Self::default()
        }
    }

    pub fn to_bencode(&self) -> Result<Value, EncodeError> {
        let payload = if let Some(data) = &self.data {
            Value::bytes(data.as_str())
        } else if let Some(key) = &self.find_value_key {
            let token = self.token.as_ref().ok_or(EncodeError::MissingToken)?;
            let compact = self
                .contacts
                .iter()
                .map(|c| Value::bytes(c.marshal_compact()))
                .collect();
            DictBuilder::new()
                .insert(key.as_bytes(), Value::List(compact))
                .insert(TOKEN_FIELD, Value::bytes(token.clone()))
                .build()
        } else if let Some(token) = &self.token {
            DictBuilder::new()
                .insert(CONTACTS_FIELD, contact_list(&self.contacts))
                .insert(TOKEN_FIELD, Value::bytes(token.clone()))
                .build()
        } else {
            contact_list(&self.contacts)
        };
        Ok(header(MessageKind::Response, &self.id, &self.node_id)
            .insert(HEADER_PAYLOAD_FIELD, payload)
            .build())
    }

    pub fn from_bencode(value: &Value) -> Result<Self, DecodeError> {
        let (id, node_id) = decode_header(value)?;
        let mut response = Self {
            id,
            node_id,
            ..Self::default()
        };
        match field(value, HEADER_PAYLOAD_FIELD)? {
            Value::Bytes(data) => {
                response.data = Some(String::from_utf8_lossy(data).into_owned());
            }
            Value::List(items) => {
                response.contacts = decode_contact_list(items)?;
            }
            Value::Dict(payload) => {
                response.token = payload
                    .get(TOKEN_FIELD.as_bytes())
                    .map(|t| {
                        t.as_bytes()
                            .map(<[u8]>::to_vec)
                            .ok_or(DecodeError::WrongType(TOKEN_FIELD))
                    })
                    .transpose()?;
                if let Some(contacts) = payload.get(CONTACTS_FIELD.as_bytes()) {
                    let items = contacts
                        .as_list()
                        .ok_or(DecodeError::WrongType(CONTACTS_FIELD))?;
                    response.contacts = decode_contact_list(items)?;
                } else {
                    let (key, found) = payload
                        .iter()
                        .find(|(k, _)| k.as_slice() != TOKEN_FIELD.as_bytes())
                        .ok_or(DecodeError::MissingField(CONTACTS_FIELD))?;
                    response.find_value_key = Some(Bitmap::try_from_slice(key)?);
                    let items = found
                        .as_list()
                        .ok_or(DecodeError::WrongType("find value contacts"))?;
                    response.contacts = items
                        .iter()
                        .map(|item| {
                            item.as_bytes()
                                .ok_or(DecodeError::WrongType("compact contact"))
                                .and_then(Contact::unmarshal_compact)
                        })
                        .collect::<Result<_, _>>()?;
                }
            }
            Value::Int(_) => return Err(DecodeError::WrongType(HEADER_PAYLOAD_FIELD)),
        }
        Ok(response)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorMessage {
    pub id: MessageId,
    pub node_id: Bitmap,
    pub exception_type: String,
    pub response: Vec<String>,
}

impl ErrorMessage {
    pub fn to(request: &Request, node_id: Bitmap, exception_type: &str) -> Self {
        Self {
            id: request.id,
            node_id,
            exception_type: exception_type.to_string(),
            response: Vec::new(),
        }
    }

    pub fn to_bencode(&self) -> Value {
        let response = self
            .response
            .iter()
            .map(|s| Value::bytes(s.as_str()))
            .collect();
        header(MessageKind::Error, &self.id, &self.node_id)
            .insert(HEADER_PAYLOAD_FIELD, Value::bytes(self.exception_type.as_str()))
            .insert(HEADER_ARGS_FIELD, Value::List(response))
            .build()
    }

    pub fn from_bencode(value: &Value) -> Result<Self, DecodeError> {
        let (id, node_id) = decode_header(value)?;
        let exception_type = field(value, HEADER_PAYLOAD_FIELD)?
            .as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .ok_or(DecodeError::WrongType(HEADER_PAYLOAD_FIELD))?;
        // peers send nothing, a list, or something else entirely here
        let response = match value.as_dict().and_then(|d| d.get(HEADER_ARGS_FIELD.as_bytes())) {
            Some(Value::List(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
                    Value::Int(i) => Some(i.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        Ok(Self {
            id,
            node_id,
            exception_type,
            response,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Error(ErrorMessage),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(_) => MessageKind::Request,
            Message::Response(_) => MessageKind::Response,
            Message::Error(_) => MessageKind::Error,
        }
    }

    pub fn id(&self) -> MessageId {
        match self {
            Message::Request(r) => r.id,
            Message::Response(r) => r.id,
            Message::Error(e) => e.id,
        }
    }

    pub fn node_id(&self) -> Bitmap {
        match self {
            Message::Request(r) => r.node_id,
            Message::Response(r) => r.node_id,
            Message::Error(e) => e.node_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let value = match self {
            Message::Request(r) => r.to_bencode(),
            Message::Response(r) => r.to_bencode()?,
            Message::Error(e) => e.to_bencode(),
        };
        Ok(value.encode())
    }

    /// Peek the type tag, then decode with the matching variant's decoder.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let kind = peek_kind(data).ok_or(DecodeError::UnknownMessageType)?;
        let value = Value::decode(data)?;
        Ok(match kind {
            MessageKind::Request => Message::Request(Request::from_bencode(&value)?),
            MessageKind::Response => Message::Response(Response::from_bencode(&value)?),
            MessageKind::Error => Message::Error(ErrorMessage::from_bencode(&value)?),
        })
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Message::Request(r)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Message::Response(r)
    }
}

impl From<ErrorMessage> for Message {
    fn from(e: ErrorMessage) -> Self {
        Message::Error(e)
    }
}

fn header(kind: MessageKind, id: &MessageId, node_id: &Bitmap) -> DictBuilder {
    DictBuilder::new()
        .insert(HEADER_TYPE_FIELD, Value::Int(kind as i64))
        .insert(HEADER_MESSAGE_ID_FIELD, Value::bytes(id.0.to_vec()))
        .insert(HEADER_NODE_ID_FIELD, Value::bytes(node_id.as_bytes().to_vec()))
}

fn field<'a>(value: &'a Value, name: &'static str) -> Result<&'a Value, DecodeError> {
    value
        .as_dict()
        .ok_or(DecodeError::NotADict)?
        .get(name.as_bytes())
        .ok_or(DecodeError::MissingField(name))
}

fn decode_header(value: &Value) -> Result<(MessageId, Bitmap), DecodeError> {
    let id = field(value, HEADER_MESSAGE_ID_FIELD)?
        .as_bytes()
        .ok_or(DecodeError::WrongType(HEADER_MESSAGE_ID_FIELD))?;
    let id = MessageId::from_slice(id)?;
    let node_id = bitmap_from(field(value, HEADER_NODE_ID_FIELD)?, "node id")?;
    Ok((id, node_id))
}

fn bitmap_from(value: &Value, name: &'static str) -> Result<Bitmap, DecodeError> {
    let bytes = value.as_bytes().ok_or(DecodeError::WrongType(name))?;
    Ok(Bitmap::try_from_slice(bytes)?)
}

fn contact_list(contacts: &[Contact]) -> Value {
    Value::List(contacts.iter().map(Contact::to_bencode).collect())
}

fn decode_contact_list(items: &[Value]) -> Result<Vec<Contact>, DecodeError> {
    items.iter().map(Contact::from_bencode).collect()
}

use super::error::DhtError;
use super::node::NodeId;
use crate::bencode::{decode, encode, Dict, Value};
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;

pub const TRANSACTION_ID_MAX_LEN: usize = 20;
pub const TYPE_MAX_LEN: usize = 20;
pub const QUERY_MAX_LEN: usize = 20;
pub const ERROR_MAX_LEN: usize = 256;

const KEY_TRANSACTION: &[u8] = b"t";
const KEY_TYPE: &[u8] = b"y";
const KEY_QUERY: &[u8] = b"q";
const KEY_ARGS: &[u8] = b"a";
const KEY_RESPONSE: &[u8] = b"r";
const KEY_ERROR: &[u8] = b"e";
const KEY_ID: &[u8] = b"id";

/// Protocol error codes carried in the `e` list of an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Generic = 201,
    Server = 202,
    Protocol = 203,
    MethodUnknown = 204,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Generic => "Generic Error",
            ErrorCode::Server => "Server Error",
            ErrorCode::Protocol => "Protocol Error",
            ErrorCode::MethodUnknown => "Method Unknown",
        }
    }
}

/// Raw transaction id as seen on the wire: 1 to 20 bytes.
///
/// Queries sent by this node always carry a 4-byte big-endian counter value,
/// but peers are free to pick any id for the queries they send us, and we
/// echo those back verbatim.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId {
    bytes: [u8; TRANSACTION_ID_MAX_LEN],
    len: u8,
}

impl TransactionId {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.is_empty() || bytes.len() > TRANSACTION_ID_MAX_LEN {
            return Err(DhtError::InvalidTransactionId(bytes.len()));
        }
        let mut buf = [0u8; TRANSACTION_ID_MAX_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            bytes: buf,
            len: bytes.len() as u8,
        })
    }

    pub fn from_u32(id: u32) -> Self {
        let mut bytes = [0u8; TRANSACTION_ID_MAX_LEN];
        bytes[..4].copy_from_slice(&id.to_be_bytes());
        Self { bytes, len: 4 }
    }

    /// The counter value, if this id has the 4-byte shape we generate.
    pub fn as_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.as_bytes().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl AsRef<[u8]> for TransactionId {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId(")?;
        for byte in self.as_bytes() {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Query { method: String, args: Dict },
    Response { args: Dict },
    Error { code: i64, description: String },
    /// Any other `y` tag. Only the type registry sees these.
    Other { tag: String, body: Dict },
}

impl MessageKind {
    /// The `y` value this kind travels under.
    pub fn type_name(&self) -> &str {
        match self {
            MessageKind::Query { .. } => "q",
            MessageKind::Response { .. } => "r",
            MessageKind::Error { .. } => "e",
            MessageKind::Other { tag, .. } => tag,
        }
    }
}

/// A decoded DHT message together with the addresses it travelled between.
///
/// `local` names the endpoint the datagram arrived on, which is also where
/// any reply has to leave from.
#[derive(Debug, Clone)]
pub struct Message {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub transaction_id: TransactionId,
    pub kind: MessageKind,
}

impl Message {
    /// Decodes one datagram.
    ///
    /// Every structural problem is reported as an error; nothing here can
    /// panic on hostile input.
    pub fn parse(local: SocketAddr, remote: SocketAddr, data: &[u8]) -> Result<Self, DhtError> {
        let mut dict = decode(data)?
            .into_dict()
            .ok_or_else(|| DhtError::InvalidMessage("expected dict".into()))?;

        let transaction_id = dict
            .get(KEY_TRANSACTION)
            .and_then(Value::as_bytes)
            .ok_or_else(|| DhtError::InvalidMessage("missing transaction id".into()))
            .and_then(|t| TransactionId::from_slice(t))?;

        let tag = dict
            .get(KEY_TYPE)
            .and_then(Value::as_bytes)
            .ok_or_else(|| DhtError::InvalidMessage("missing message type".into()))
            .and_then(|y| bounded_str(y, TYPE_MAX_LEN, "message type"))?;

        let kind = match tag.as_str() {
            "q" => {
                let method = dict
                    .get(KEY_QUERY)
                    .and_then(Value::as_bytes)
                    .ok_or_else(|| DhtError::InvalidMessage("missing query name".into()))
                    .and_then(|q| bounded_str(q, QUERY_MAX_LEN, "query name"))?;
                let args = take_dict(&mut dict, KEY_ARGS, "missing query args")?;
                MessageKind::Query { method, args }
            }
            "r" => MessageKind::Response {
                args: take_dict(&mut dict, KEY_RESPONSE, "missing response dict")?,
            },
            "e" => parse_error(&dict)?,
            _ => MessageKind::Other { tag, body: dict },
        };

        Ok(Self {
            local,
            remote,
            transaction_id,
            kind,
        })
    }

    pub fn method(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Query { method, .. } => Some(method),
            _ => None,
        }
    }

    /// Query arguments or response values.
    pub fn args(&self) -> Option<&Dict> {
        match &self.kind {
            MessageKind::Query { args, .. } | MessageKind::Response { args } => Some(args),
            _ => None,
        }
    }

    /// The `id` the remote node put in its arguments, if well formed.
    pub fn sender_id(&self) -> Option<NodeId> {
        self.args()?
            .get(KEY_ID)
            .and_then(Value::as_bytes)
            .and_then(|b| NodeId::from_bytes(b).ok())
    }

    pub fn encode_query(transaction_id: u32, method: &str, args: Dict) -> Result<Bytes, DhtError> {
        if method.is_empty() || method.len() > QUERY_MAX_LEN {
            return Err(DhtError::InvalidMessage(format!(
                "query name must be 1..={} bytes",
                QUERY_MAX_LEN
            )));
        }

        let mut dict = envelope(&TransactionId::from_u32(transaction_id), "q");
        dict.insert(Bytes::from_static(KEY_QUERY), Value::string(method));
        dict.insert(Bytes::from_static(KEY_ARGS), Value::Dict(args));
        Ok(encode(&Value::Dict(dict)))
    }

    pub fn encode_response(transaction_id: &TransactionId, args: Dict) -> Result<Bytes, DhtError> {
        let mut dict = envelope(transaction_id, "r");
        dict.insert(Bytes::from_static(KEY_RESPONSE), Value::Dict(args));
        Ok(encode(&Value::Dict(dict)))
    }

    pub fn encode_error(
        transaction_id: &TransactionId,
        code: i64,
        description: &str,
    ) -> Result<Bytes, DhtError> {
        if description.len() > ERROR_MAX_LEN {
            return Err(DhtError::InvalidMessage(format!(
                "error description longer than {} bytes",
                ERROR_MAX_LEN
            )));
        }

        let mut dict = envelope(transaction_id, "e");
        dict.insert(
            Bytes::from_static(KEY_ERROR),
            Value::List(vec![Value::Integer(code), Value::string(description)]),
        );
        Ok(encode(&Value::Dict(dict)))
    }
}

fn envelope(transaction_id: &TransactionId, tag: &str) -> Dict {
    let mut dict = Dict::new();
    dict.insert(
        Bytes::from_static(KEY_TRANSACTION),
        Value::bytes(transaction_id.as_bytes()),
    );
    dict.insert(Bytes::from_static(KEY_TYPE), Value::string(tag));
    dict
}

fn bounded_str(bytes: &[u8], max: usize, what: &str) -> Result<String, DhtError> {
    if bytes.is_empty() || bytes.len() > max {
        return Err(DhtError::InvalidMessage(format!(
            "{} must be 1..={} bytes, got {}",
            what,
            max,
            bytes.len()
        )));
    }
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| DhtError::InvalidMessage(format!("{} is not utf-8", what)))
}

fn take_dict(dict: &mut Dict, key: &[u8], missing: &str) -> Result<Dict, DhtError> {
    dict.remove(key)
        .and_then(Value::into_dict)
        .ok_or_else(|| DhtError::InvalidMessage(missing.into()))
}

fn parse_error(dict: &Dict) -> Result<MessageKind, DhtError> {
    let list = dict
        .get(KEY_ERROR)
        .and_then(Value::as_list)
        .ok_or_else(|| DhtError::InvalidMessage("missing error list".into()))?;

    match list.as_slice() {
        [Value::Integer(code), Value::Bytes(description)] => {
            if description.len() > ERROR_MAX_LEN {
                return Err(DhtError::InvalidMessage("error description too long".into()));
            }
            Ok(MessageKind::Error {
                code: *code,
                description: String::from_utf8_lossy(description).into_owned(),
            })
        }
        _ => Err(DhtError::InvalidMessage(
            "error must be [code, description]".into(),
        )),
    }
}

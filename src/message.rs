//! Wire messages.
//!
//! A tagged union of nine kinds inside a `{source, id}` envelope, one
//! JSON object per newline-delimited frame. The integer tag, not the
//! field shape, selects the kind; unknown tags are rejected at decode.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::config::RunEnv;
use crate::error::{Result, SyncError};
use crate::registry::{CacheScope, ModuleDescriptor};

/// Upper bound on one frame, including the trailing newline.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Every frame names its origin and carries a per-origin counter.
/// Counters start at 1; only hello frames use 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub source: String,
    pub id: u64,
}

/// First frame in each direction of every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub version: String,
    pub env: RunEnv,
    pub user_id: String,
}

/// A peer's self-description: advertised endpoint and election rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub address: Option<String>,
    pub priority: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(Hello),
    Heartbeat,
    InstanceInfo(InstanceInfo),
    LostPeer { name: String },
    AssignModule { peer: String, module: String },
    RequestModule { module: String },
    ControlSwitch { controller: String },
    ModuleInfo { modules: Vec<ModuleDescriptor> },
    ExpireConfigCache { config: String, scope: CacheScope, id: String },
}

const TAG_HELLO: u64 = 0;
const TAG_HEARTBEAT: u64 = 1;
const TAG_INSTANCE_INFO: u64 = 2;
const TAG_LOST_PEER: u64 = 3;
const TAG_ASSIGN_MODULE: u64 = 4;
const TAG_REQUEST_MODULE: u64 = 5;
const TAG_CONTROL_SWITCH: u64 = 6;
const TAG_MODULE_INFO: u64 = 7;
const TAG_EXPIRE_CONFIG_CACHE: u64 = 8;

impl Message {
    pub fn tag(&self) -> u64 {
        match self {
            Message::Hello(_) => TAG_HELLO,
            Message::Heartbeat => TAG_HEARTBEAT,
            Message::InstanceInfo(_) => TAG_INSTANCE_INFO,
            Message::LostPeer { .. } => TAG_LOST_PEER,
            Message::AssignModule { .. } => TAG_ASSIGN_MODULE,
            Message::RequestModule { .. } => TAG_REQUEST_MODULE,
            Message::ControlSwitch { .. } => TAG_CONTROL_SWITCH,
            Message::ModuleInfo { .. } => TAG_MODULE_INFO,
            Message::ExpireConfigCache { .. } => TAG_EXPIRE_CONFIG_CACHE,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::Heartbeat => "heartbeat",
            Message::InstanceInfo(_) => "instanceInfo",
            Message::LostPeer { .. } => "lostPeer",
            Message::AssignModule { .. } => "assignModule",
            Message::RequestModule { .. } => "requestModule",
            Message::ControlSwitch { .. } => "controlSwitch",
            Message::ModuleInfo { .. } => "moduleInfo",
            Message::ExpireConfigCache { .. } => "expireConfigCache",
        }
    }
}

// Bodies that do not have a standalone public type.

#[derive(Serialize, Deserialize)]
struct LostPeerBody {
    name: String,
}

#[derive(Serialize, Deserialize)]
struct AssignModuleBody {
    peer: String,
    module: String,
}

#[derive(Serialize, Deserialize)]
struct RequestModuleBody {
    module: String,
}

#[derive(Serialize, Deserialize)]
struct ControlSwitchBody {
    controller: String,
}

#[derive(Serialize, Deserialize)]
struct ModuleInfoBody {
    modules: Vec<ModuleDescriptor>,
}

// The expired entry's own id travels as "key": the envelope already
// owns the top-level "id" field.
#[derive(Serialize, Deserialize)]
struct ExpireBody {
    #[serde(rename = "configName")]
    config: String,
    scope: CacheScope,
    key: String,
}

/// Encode one message as a newline-terminated JSON frame.
pub fn encode(envelope: &Envelope, message: &Message) -> Result<Vec<u8>> {
    let mut obj = Map::new();
    obj.insert("type".into(), Value::from(message.tag()));
    obj.insert("source".into(), Value::from(envelope.source.clone()));
    obj.insert("id".into(), Value::from(envelope.id));

    let body = match message {
        Message::Hello(h) => serde_json::to_value(h)?,
        Message::Heartbeat => Value::Object(Map::new()),
        Message::InstanceInfo(i) => serde_json::to_value(i)?,
        Message::LostPeer { name } => serde_json::to_value(LostPeerBody { name: name.clone() })?,
        Message::AssignModule { peer, module } => serde_json::to_value(AssignModuleBody {
            peer: peer.clone(),
            module: module.clone(),
        })?,
        Message::RequestModule { module } => serde_json::to_value(RequestModuleBody {
            module: module.clone(),
        })?,
        Message::ControlSwitch { controller } => serde_json::to_value(ControlSwitchBody {
            controller: controller.clone(),
        })?,
        Message::ModuleInfo { modules } => serde_json::to_value(ModuleInfoBody {
            modules: modules.clone(),
        })?,
        Message::ExpireConfigCache { config, scope, id } => serde_json::to_value(ExpireBody {
            config: config.clone(),
            scope: *scope,
            key: id.clone(),
        })?,
    };
    if let Value::Object(fields) = body {
        obj.extend(fields);
    }

    let mut frame = serde_json::to_vec(&Value::Object(obj))?;
    frame.push(b'\n');
    Ok(frame)
}

/// Decode one frame. Unknown tags and missing fields are protocol errors.
pub fn decode(frame: &[u8]) -> Result<(Envelope, Message)> {
    let value: Value = serde_json::from_slice(frame)?;
    let Value::Object(mut obj) = value else {
        return Err(SyncError::Protocol("frame is not an object".into()));
    };

    let tag = obj
        .remove("type")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| SyncError::Protocol("missing or invalid type tag".into()))?;
    let source = match obj.remove("source") {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => return Err(SyncError::Protocol("missing source".into())),
    };
    let id = obj
        .remove("id")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| SyncError::Protocol("missing or invalid id".into()))?;

    let message = match tag {
        TAG_HELLO => Message::Hello(body(obj)?),
        TAG_HEARTBEAT => Message::Heartbeat,
        TAG_INSTANCE_INFO => Message::InstanceInfo(body(obj)?),
        TAG_LOST_PEER => {
            let b: LostPeerBody = body(obj)?;
            Message::LostPeer { name: b.name }
        }
        TAG_ASSIGN_MODULE => {
            let b: AssignModuleBody = body(obj)?;
            Message::AssignModule {
                peer: b.peer,
                module: b.module,
            }
        }
        TAG_REQUEST_MODULE => {
            let b: RequestModuleBody = body(obj)?;
            Message::RequestModule { module: b.module }
        }
        TAG_CONTROL_SWITCH => {
            let b: ControlSwitchBody = body(obj)?;
            Message::ControlSwitch {
                controller: b.controller,
            }
        }
        TAG_MODULE_INFO => {
            let b: ModuleInfoBody = body(obj)?;
            Message::ModuleInfo { modules: b.modules }
        }
        TAG_EXPIRE_CONFIG_CACHE => {
            let b: ExpireBody = body(obj)?;
            Message::ExpireConfigCache {
                config: b.config,
                scope: b.scope,
                id: b.key,
            }
        }
        other => return Err(SyncError::Protocol(format!("unknown message tag {other}"))),
    };

    Ok((Envelope { source, id }, message))
}

fn body<T: DeserializeOwned>(fields: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(fields)).map_err(SyncError::Codec)
}

/// Read one newline-delimited frame. Returns `None` at clean EOF. The
/// returned bytes include the newline so they can be relayed verbatim.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    loop {
        let n = reader.read_until(b'\n', &mut frame).await?;
        if n == 0 {
            if frame.is_empty() {
                return Ok(None);
            }
            return Err(SyncError::Protocol("truncated frame at EOF".into()));
        }
        if frame.len() > MAX_FRAME_LEN {
            return Err(SyncError::Protocol(format!(
                "frame exceeds {MAX_FRAME_LEN} bytes"
            )));
        }
        if frame.ends_with(b"\n") {
            // Skip blank keepalive lines.
            if frame.iter().all(|b| b.is_ascii_whitespace()) {
                frame.clear();
                continue;
            }
            return Ok(Some(frame));
        }
    }
}

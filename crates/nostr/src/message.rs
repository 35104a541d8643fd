use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NostrError, Result};
use crate::event::Event;

/// Messages sent from a client to a relay (NIP-01, NIP-42, NIP-45, NIP-77).
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Event),
    Req { sub_id: String, filters: Vec<Value> },
    Close { sub_id: String },
    Count { sub_id: String, filters: Vec<Value> },
    Auth(Event),
    NegOpen { sub_id: String, filter: Value, initial_message: String },
    NegMsg { sub_id: String, message: String },
    NegClose { sub_id: String },
}

/// Messages sent from a relay to a client.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event { sub_id: String, event: Event },
    Ok { event_id: String, accepted: bool, message: String },
    Eose { sub_id: String },
    Closed { sub_id: String, message: String },
    Notice { message: String },
    Count { sub_id: String, count: u64, hll: Option<String> },
    Auth { challenge: String },
    NegMsg { sub_id: String, message: String },
    NegErr { sub_id: String, message: String },
}

impl ClientMessage {
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        let arr = value.as_array().ok_or(NostrError::NotAnArray)?;
        let tag = arr.first().and_then(Value::as_str).ok_or(NostrError::EmptyFrame)?;

        let as_string = |v: &Value| -> Result<String> {
            v.as_str().map(str::to_string).ok_or(NostrError::UnknownMessageKind(tag.to_string()))
        };

        match tag {
            "EVENT" => {
                let event_value = arr.get(1).ok_or_else(|| NostrError::UnknownMessageKind(tag.into()))?;
                let event: Event = serde_json::from_value(event_value.clone())?;
                Ok(ClientMessage::Event(event))
            }
            "REQ" => {
                let sub_id = as_string(arr.get(1).unwrap_or(&Value::Null))?;
                let filters = arr.get(2..).unwrap_or(&[]).to_vec();
                Ok(ClientMessage::Req { sub_id, filters })
            }
            "CLOSE" => {
                let sub_id = as_string(arr.get(1).unwrap_or(&Value::Null))?;
                Ok(ClientMessage::Close { sub_id })
            }
            "COUNT" => {
                let sub_id = as_string(arr.get(1).unwrap_or(&Value::Null))?;
                let filters = arr.get(2..).unwrap_or(&[]).to_vec();
                Ok(ClientMessage::Count { sub_id, filters })
            }
            "AUTH" => {
                let event_value = arr.get(1).ok_or_else(|| NostrError::UnknownMessageKind(tag.into()))?;
                let event: Event = serde_json::from_value(event_value.clone())?;
                Ok(ClientMessage::Auth(event))
            }
            "NEG-OPEN" => {
                let sub_id = as_string(arr.get(1).unwrap_or(&Value::Null))?;
                let filter = arr.get(2).cloned().unwrap_or(Value::Null);
                let initial_message = as_string(arr.get(3).unwrap_or(&Value::Null))?;
                Ok(ClientMessage::NegOpen { sub_id, filter, initial_message })
            }
            "NEG-MSG" => {
                let sub_id = as_string(arr.get(1).unwrap_or(&Value::Null))?;
                let message = as_string(arr.get(2).unwrap_or(&Value::Null))?;
                Ok(ClientMessage::NegMsg { sub_id, message })
            }
            "NEG-CLOSE" => {
                let sub_id = as_string(arr.get(1).unwrap_or(&Value::Null))?;
                Ok(ClientMessage::NegClose { sub_id })
            }
            other => Err(NostrError::UnknownMessageKind(other.to_string())),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            ClientMessage::Event(event) => serde_json::json!(["EVENT", event]),
            ClientMessage::Req { sub_id, filters } => {
                let mut arr = vec![Value::String("REQ".into()), Value::String(sub_id.clone())];
                arr.extend(filters.iter().cloned());
                Value::Array(arr)
            }
            ClientMessage::Close { sub_id } => serde_json::json!(["CLOSE", sub_id]),
            ClientMessage::Count { sub_id, filters } => {
                let mut arr = vec![Value::String("COUNT".into()), Value::String(sub_id.clone())];
                arr.extend(filters.iter().cloned());
                Value::Array(arr)
            }
            ClientMessage::Auth(event) => serde_json::json!(["AUTH", event]),
            ClientMessage::NegOpen { sub_id, filter, initial_message } => {
                serde_json::json!(["NEG-OPEN", sub_id, filter, initial_message])
            }
            ClientMessage::NegMsg { sub_id, message } => serde_json::json!(["NEG-MSG", sub_id, message]),
            ClientMessage::NegClose { sub_id } => serde_json::json!(["NEG-CLOSE", sub_id]),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

impl RelayMessage {
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        let arr = value.as_array().ok_or(NostrError::NotAnArray)?;
        let tag = arr.first().and_then(Value::as_str).ok_or(NostrError::EmptyFrame)?;

        let as_string = |v: &Value| -> Result<String> {
            v.as_str().map(str::to_string).ok_or(NostrError::UnknownMessageKind(tag.to_string()))
        };

        match tag {
            "EVENT" => {
                let sub_id = as_string(arr.get(1).unwrap_or(&Value::Null))?;
                let event_value = arr.get(2).ok_or_else(|| NostrError::UnknownMessageKind(tag.into()))?;
                let event: Event = serde_json::from_value(event_value.clone())?;
                Ok(RelayMessage::Event { sub_id, event })
            }
            "OK" => {
                let event_id = as_string(arr.get(1).unwrap_or(&Value::Null))?;
                let accepted = arr.get(2).and_then(Value::as_bool).unwrap_or(false);
                let message = arr.get(3).and_then(Value::as_str).unwrap_or("").to_string();
                Ok(RelayMessage::Ok { event_id, accepted, message })
            }
            "EOSE" => {
                let sub_id = as_string(arr.get(1).unwrap_or(&Value::Null))?;
                Ok(RelayMessage::Eose { sub_id })
            }
            "CLOSED" => {
                let sub_id = as_string(arr.get(1).unwrap_or(&Value::Null))?;
                let message = arr.get(2).and_then(Value::as_str).unwrap_or("").to_string();
                Ok(RelayMessage::Closed { sub_id, message })
            }
            "NOTICE" => {
                let message = as_string(arr.get(1).unwrap_or(&Value::Null))?;
                Ok(RelayMessage::Notice { message })
            }
            "COUNT" => {
                let sub_id = as_string(arr.get(1).unwrap_or(&Value::Null))?;
                let payload = arr.get(2).and_then(Value::as_object);
                let count = payload.and_then(|o| o.get("count")).and_then(Value::as_u64).unwrap_or(0);
                let hll = payload
                    .and_then(|o| o.get("hll"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(RelayMessage::Count { sub_id, count, hll })
            }
            "AUTH" => {
                let challenge = as_string(arr.get(1).unwrap_or(&Value::Null))?;
                Ok(RelayMessage::Auth { challenge })
            }
            "NEG-MSG" => {
                let sub_id = as_string(arr.get(1).unwrap_or(&Value::Null))?;
                let message = as_string(arr.get(2).unwrap_or(&Value::Null))?;
                Ok(RelayMessage::NegMsg { sub_id, message })
            }
            "NEG-ERR" => {
                let sub_id = as_string(arr.get(1).unwrap_or(&Value::Null))?;
                let message = as_string(arr.get(2).unwrap_or(&Value::Null))?;
                Ok(RelayMessage::NegErr { sub_id, message })
            }
            other => Err(NostrError::UnknownMessageKind(other.to_string())),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            RelayMessage::Event { sub_id, event } => serde_json::json!(["EVENT", sub_id, event]),
            RelayMessage::Ok { event_id, accepted, message } => {
                serde_json::json!(["OK", event_id, accepted, message])
            }
            RelayMessage::Eose { sub_id } => serde_json::json!(["EOSE", sub_id]),
            RelayMessage::Closed { sub_id, message } => serde_json::json!(["CLOSED", sub_id, message]),
            RelayMessage::Notice { message } => serde_json::json!(["NOTICE", message]),
            RelayMessage::Count { sub_id, count, hll } => match hll {
                Some(hll) => serde_json::json!(["COUNT", sub_id, { "count": count, "hll": hll }]),
                None => serde_json::json!(["COUNT", sub_id, { "count": count }]),
            },
            RelayMessage::Auth { challenge } => serde_json::json!(["AUTH", challenge]),
            RelayMessage::NegMsg { sub_id, message } => serde_json::json!(["NEG-MSG", sub_id, message]),
            RelayMessage::NegErr { sub_id, message } => serde_json::json!(["NEG-ERR", sub_id, message]),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// One decoded object from a prediction stream.
///
/// On the wire every event is `{"event": "<kind>", "data": <payload>}`. Known
/// kinds get their own variant; anything else (including objects that don't
/// fit the envelope) is carried as `Other` so it can be forwarded untouched.
/// Envelope fields besides `event` and `data` are not kept for known kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start(Option<Value>),
    /// Incremental text fragment.
    Token(String),
    Content(Value),
    AgentFlowEvent(Value),
    NextAgentFlow(Value),
    AgentFlowExecutedData(Value),
    CalledTools(Value),
    UsageMetadata(Value),
    Metadata(Value),
    /// End of the turn, optionally with the final answer.
    End(Option<Value>),
    /// The backend assigned a new session mid-stream.
    SessionId(String),
    /// Unrecognized kind, or a known kind whose payload has the wrong shape.
    /// An object with no string `event` field has an empty `kind` and the
    /// whole object as `data`.
    Other { kind: String, data: Value },
}

impl Event {
    /// Classify a decoded JSON value by its `event` field.
    pub fn from_value(value: Value) -> Self {
        let mut obj = match value {
            Value::Object(obj) => obj,
            other => {
                return Event::Other {
                    kind: String::new(),
                    data: other,
                }
            }
        };

        let kind = match obj.get("event").and_then(Value::as_str) {
            Some(k) => k.to_string(),
            None => {
                return Event::Other {
                    kind: String::new(),
                    data: Value::Object(obj),
                }
            }
        };
        let data = obj.remove("data");

        match (kind.as_str(), data) {
            // `"data": null` and no `data` are the same marker.
            ("start", data) => Event::Start(data.filter(|d| !d.is_null())),
            ("end", data) => Event::End(data.filter(|d| !d.is_null())),
            ("token", Some(Value::String(text))) => Event::Token(text),
            ("session_id", Some(Value::String(id))) => Event::SessionId(id),
            ("content", data) => Event::Content(data.unwrap_or(Value::Null)),
            ("agentFlowEvent", data) => Event::AgentFlowEvent(data.unwrap_or(Value::Null)),
            ("nextAgentFlow", data) => Event::NextAgentFlow(data.unwrap_or(Value::Null)),
            ("agentFlowExecutedData", data) => {
                Event::AgentFlowExecutedData(data.unwrap_or(Value::Null))
            }
            ("calledTools", data) => Event::CalledTools(data.unwrap_or(Value::Null)),
            ("usageMetadata", data) => Event::UsageMetadata(data.unwrap_or(Value::Null)),
            ("metadata", data) => Event::Metadata(data.unwrap_or(Value::Null)),
            (other, data) => Event::Other {
                kind: other.to_string(),
                data: data.unwrap_or(Value::Null),
            },
        }
    }

    /// Back to the wire envelope.
    pub fn to_value(&self) -> Value {
        let data = match self {
            Event::Start(data) | Event::End(data) => data.clone(),
            Event::Token(text) => Some(Value::String(text.clone())),
            Event::SessionId(id) => Some(Value::String(id.clone())),
            Event::Content(data)
            | Event::AgentFlowEvent(data)
            | Event::NextAgentFlow(data)
            | Event::AgentFlowExecutedData(data)
            | Event::CalledTools(data)
            | Event::UsageMetadata(data)
            | Event::Metadata(data) => Some(data.clone()),
            Event::Other { kind, data } if kind.is_empty() => return data.clone(),
            Event::Other { data, .. } => Some(data.clone()),
        };

        let mut obj = Map::new();
        obj.insert("event".into(), Value::String(self.kind().to_string()));
        if let Some(data) = data.filter(|d| !d.is_null()) {
            obj.insert("data".into(), data);
        }
        Value::Object(obj)
    }

    /// The wire kind string.
    pub fn kind(&self) -> &str {
        match self {
            Event::Start(_) => "start",
            Event::Token(_) => "token",
            Event::Content(_) => "content",
            Event::AgentFlowEvent(_) => "agentFlowEvent",
            Event::NextAgentFlow(_) => "nextAgentFlow",
            Event::AgentFlowExecutedData(_) => "agentFlowExecutedData",
            Event::CalledTools(_) => "calledTools",
            Event::UsageMetadata(_) => "usageMetadata",
            Event::Metadata(_) => "metadata",
            Event::End(_) => "end",
            Event::SessionId(_) => "session_id",
            Event::Other { kind, .. } => kind,
        }
    }

    pub fn is_token(&self) -> bool {
        self.kind() == "token"
    }

    /// Text of a well-formed `token` event.
    pub fn token_text(&self) -> Option<&str> {
        match self {
            Event::Token(text) => Some(text),
            _ => None,
        }
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Event::from_value)
    }
}

//! Control wire protocol: the JSON message envelope exchanged with the
//! controller and typed views over the per-command request bodies.
//!
//! Every message is either a request or a response. Responses echo the
//! request's transaction id and carry `{Success, Message}`. Messages the
//! agent originates (liveness registration, link state changes) are
//! requests with an agent-assigned transaction id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, AgentResult};

/// Recipient stamped on every delivered message.
pub const RECIPIENT: &str = "TincanTunnel";

pub const CONTROL_TYPE_REQUEST: &str = "Request";
pub const CONTROL_TYPE_RESPONSE: &str = "Response";

/// Command names recognized by the dispatcher, plus those the agent sends.
pub mod commands {
    pub const CONFIGURE_LOGGING: &str = "ConfigureLogging";
    pub const CREATE_TUNNEL: &str = "CreateTunnel";
    pub const CREATE_LINK: &str = "CreateLink";
    pub const ECHO: &str = "Echo";
    pub const QUERY_CAS: &str = "QueryCandidateAddressSet";
    pub const QUERY_LINK_STATS: &str = "QueryLinkStats";
    pub const QUERY_TUNNEL_INFO: &str = "QueryTunnelInfo";
    pub const REMOVE_LINK: &str = "RemoveLink";
    pub const REMOVE_TUNNEL: &str = "RemoveTunnel";
    pub const REGISTER_DATAPLANE: &str = "RegisterDataplane";
    pub const LINK_STATE_CHANGE: &str = "LinkStateChange";
}

/// Link state markers carried in `LinkStateChange` notifications.
pub const LINK_CONNECTED: &str = "LinkConnected";
pub const LINK_DISCONNECTED: &str = "LinkDisconnected";

/// Response body: success flag and a free-form message (string or object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    #[serde(rename = "Success")]
    pub success: bool,
    #[serde(rename = "Message", default)]
    pub message: Value,
}

/// A control message, request or response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "ControlType")]
    pub control_type: String,
    #[serde(rename = "TransactionId")]
    pub transaction_id: u64,
    #[serde(rename = "Recipient", skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(rename = "SessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u32>,
    #[serde(rename = "Request", skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(rename = "Response", skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseBody>,
}

impl ControlMessage {
    /// Build an agent-originated request for `command`.
    pub fn new_request(transaction_id: u64, command: &str) -> Self {
        Self {
            control_type: CONTROL_TYPE_REQUEST.to_string(),
            transaction_id,
            recipient: None,
            session_id: None,
            request: Some(serde_json::json!({ "Command": command })),
            response: None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.control_type == CONTROL_TYPE_REQUEST
    }

    /// The command name from the request body, if present.
    pub fn command(&self) -> Option<&str> {
        self.request.as_ref()?.get("Command")?.as_str()
    }

    /// The request body, or an error for a body-less message.
    pub fn request_body(&self) -> AgentResult<&Value> {
        self.request
            .as_ref()
            .ok_or_else(|| AgentError::protocol("control message carries no request body"))
    }

    /// Set a request body field.
    pub fn set_request_field(&mut self, key: &str, value: Value) {
        let body = self
            .request
            .get_or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(map) = body {
            map.insert(key.to_string(), value);
        }
    }

    /// Turn this message into a response carrying `message`. The request
    /// body is dropped; the transaction id ties the response back.
    pub fn set_response(&mut self, success: bool, message: Value) {
        self.control_type = CONTROL_TYPE_RESPONSE.to_string();
        self.request = None;
        self.response = Some(ResponseBody { success, message });
    }

    /// Serialize to the UTF-8 JSON text sent on the wire. The framed length
    /// is 16 bits, so oversized messages are a protocol error.
    pub fn serialize(&self) -> AgentResult<String> {
        let text = serde_json::to_string(self)
            .map_err(|e| AgentError::protocol(format!("control serialization failed: {}", e)))?;
        if text.len() > u16::MAX as usize {
            return Err(AgentError::protocol(format!(
                "control message exceeds frame limit: {} bytes",
                text.len()
            )));
        }
        Ok(text)
    }

    /// Parse a received message body.
    pub fn deserialize(data: &[u8]) -> AgentResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| AgentError::protocol(format!("malformed control message: {}", e)))
    }
}

/// TURN server descriptor as carried on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnParams {
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "User", default)]
    pub user: String,
    #[serde(rename = "Password", default)]
    pub password: String,
}

/// `CreateTunnel` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTunnelParams {
    #[serde(rename = "TunnelId")]
    pub tunnel_id: String,
    #[serde(rename = "NodeId")]
    pub node_id: String,
    #[serde(rename = "TapName")]
    pub tap_name: String,
    #[serde(rename = "MTU", alias = "MTU4", default = "default_mtu")]
    pub mtu: u32,
    #[serde(rename = "StunServers", default)]
    pub stun_servers: Vec<String>,
    #[serde(rename = "TurnServers", default)]
    pub turn_servers: Vec<TurnParams>,
    #[serde(rename = "IgnoredNetInterfaces", default)]
    pub ignored_net_interfaces: Vec<String>,
}

fn default_mtu() -> u32 {
    1410
}

/// `PeerInfo` object within a `CreateLink` request.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerInfoParams {
    #[serde(rename = "UID")]
    pub uid: String,
    #[serde(rename = "CAS", default)]
    pub cas: String,
    #[serde(rename = "FPR", default)]
    pub fingerprint: String,
    #[serde(rename = "MAC", default)]
    pub mac_address: String,
}

/// `CreateLink` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateLinkParams {
    #[serde(rename = "TunnelId")]
    pub tunnel_id: String,
    #[serde(rename = "LinkId")]
    pub link_id: String,
    #[serde(rename = "PeerInfo")]
    pub peer_info: PeerInfoParams,
}

/// Extract a typed view over a request body.
pub fn parse_request<T: serde::de::DeserializeOwned>(body: &Value) -> AgentResult<T> {
    serde_json::from_value(body.clone())
        .map_err(|e| AgentError::protocol(format!("malformed request parameters: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_preserves_message() {
        let mut msg = ControlMessage::new_request(42, commands::ECHO);
        msg.set_request_field("Message", Value::String("ping".into()));
        msg.recipient = Some(RECIPIENT.to_string());
        msg.session_id = Some(1234);
        let wire = msg.serialize().unwrap();
        let back = ControlMessage::deserialize(wire.as_bytes()).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn test_response_roundtrip() {
        let mut msg = ControlMessage::new_request(7, commands::CREATE_TUNNEL);
        msg.set_response(true, serde_json::json!({ "MAC": "AABBCCDDEEFF" }));
        let wire = msg.serialize().unwrap();
        let back = ControlMessage::deserialize(wire.as_bytes()).unwrap();
        assert_eq!(back.control_type, CONTROL_TYPE_RESPONSE);
        assert_eq!(back.transaction_id, 7);
        assert!(back.response.as_ref().unwrap().success);
        assert_eq!(msg, back);
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(ControlMessage::deserialize(b"{not json").is_err());
        assert!(ControlMessage::deserialize(b"{\"ControlType\":\"Request\"}").is_err());
    }

    #[test]
    fn test_create_tunnel_params() {
        let body = serde_json::json!({
            "Command": "CreateTunnel",
            "TunnelId": "T1",
            "NodeId": "N1",
            "TapName": "tap0",
            "MTU": 1410,
            "StunServers": ["stun.example:3478"],
            "TurnServers": [{"Address": "turn.example:3478", "User": "u", "Password": "p"}],
            "IgnoredNetInterfaces": ["lo"]
        });
        let params: CreateTunnelParams = parse_request(&body).unwrap();
        assert_eq!(params.tunnel_id, "T1");
        assert_eq!(params.mtu, 1410);
        assert_eq!(params.turn_servers[0].user, "u");
        assert_eq!(params.ignored_net_interfaces, vec!["lo".to_string()]);
    }

    #[test]
    fn test_create_link_params_default_cas() {
        let body = serde_json::json!({
            "Command": "CreateLink",
            "TunnelId": "T1",
            "LinkId": "L1",
            "PeerInfo": {"UID": "N2", "FPR": "ab12", "MAC": "AABBCCDDEEFF"}
        });
        let params: CreateLinkParams = parse_request(&body).unwrap();
        assert_eq!(params.peer_info.uid, "N2");
        assert!(params.peer_info.cas.is_empty());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut msg = ControlMessage::new_request(1, commands::ECHO);
        msg.set_request_field("Message", Value::String("x".repeat(70_000)));
        assert!(msg.serialize().is_err());
    }
}

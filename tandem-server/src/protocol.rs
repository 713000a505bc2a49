//! JSON messages exchanged over the WebSocket.
//!
//! Clients send [`ClientRequest`]s tagged by `"command"`. The first request
//! of a connection must open a document (`create`, `edit` or `read`); after
//! that a client may `submit` transforms and `update` its presence.
//! Operators may send `get_users` and `kick_user` at any time, carrying the
//! configured admin token.
//! The server answers with [`ServerResponse`]s tagged by `"response_type"`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tandem_collab::{ClientUpdate, Document};
use tandem_text::Transform;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ClientRequest {
    /// Store a new document and start editing it.
    Create {
        #[serde(default)]
        token: String,
        #[serde(default)]
        user_id: String,
        document: NewDocument,
    },
    Edit {
        #[serde(default)]
        token: String,
        #[serde(default)]
        user_id: String,
        document_id: String,
    },
    Read {
        #[serde(default)]
        token: String,
        #[serde(default)]
        user_id: String,
        document_id: String,
    },
    Submit {
        transform: Transform,
    },
    Update {
        #[serde(default)]
        message: String,
        #[serde(default)]
        position: Option<i64>,
    },
    Ping,
    /// List the users of every open document.
    #[serde(rename = "get_users")]
    GetUsers {
        #[serde(default)]
        admin_token: String,
    },
    /// Drop every session of a user from an open document.
    #[serde(rename = "kick_user")]
    KickUser {
        #[serde(default)]
        admin_token: String,
        document_id: String,
        user_id: String,
    },
}

/// Content of a document to create. The server assigns its id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDocument {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response_type", rename_all = "lowercase")]
pub enum ServerResponse {
    /// The opened document and the version it is at.
    Document { document: Document, version: i64 },
    /// The version a submitted transform was accepted at.
    Correction { version: i64 },
    Transforms { transforms: Vec<Transform> },
    Update { user_updates: Vec<ClientUpdate> },
    Pong,
    /// Document id to the users with a session on it.
    Users { users: HashMap<String, Vec<String>> },
    Kicked { document_id: String, user_id: String },
    Error { error: String },
}

impl ServerResponse {
    pub fn error(error: impl ToString) -> Self {
        Self::Error {
            error: error.to_string(),
        }
    }
}

#[cfg(test)]
mod test_protocol {
    use super::*;
    use serde_json::json;
    use tandem_collab::{ClientInfo, Message};

    #[test]
    fn test_parse_requests() {
        let create: ClientRequest = serde_json::from_value(json!({
            "command": "create",
            "token": "t",
            "user_id": "alice",
            "document": {"id": "ignored", "content": "hello"}
        }))
        .unwrap();
        assert_eq!(
            create,
            ClientRequest::Create {
                token: "t".into(),
                user_id: "alice".into(),
                document: NewDocument {
                    content: "hello".into()
                },
            }
        );

        let edit: ClientRequest =
            serde_json::from_value(json!({"command": "edit", "document_id": "d1"})).unwrap();
        assert_eq!(
            edit,
            ClientRequest::Edit {
                token: String::new(),
                user_id: String::new(),
                document_id: "d1".into(),
            }
        );

        let submit: ClientRequest = serde_json::from_value(json!({
            "command": "submit",
            "transform": {"position": 3, "num_delete": 1, "insert": "x", "version": 4}
        }))
        .unwrap();
        assert_eq!(
            submit,
            ClientRequest::Submit {
                transform: Transform::new(3, 1, "x", 4)
            }
        );

        let ping: ClientRequest = serde_json::from_str(r#"{"command":"ping"}"#).unwrap();
        assert_eq!(ping, ClientRequest::Ping);

        let kick: ClientRequest = serde_json::from_value(json!({
            "command": "kick_user",
            "admin_token": "root",
            "document_id": "d1",
            "user_id": "mallory"
        }))
        .unwrap();
        assert_eq!(
            kick,
            ClientRequest::KickUser {
                admin_token: "root".into(),
                document_id: "d1".into(),
                user_id: "mallory".into(),
            }
        );

        let users: ClientRequest = serde_json::from_str(r#"{"command":"get_users"}"#).unwrap();
        assert_eq!(
            users,
            ClientRequest::GetUsers {
                admin_token: String::new()
            }
        );

        assert!(serde_json::from_str::<ClientRequest>(r#"{"command":"dance"}"#).is_err());
    }

    #[test]
    fn test_response_wire_format() {
        let json = serde_json::to_value(ServerResponse::Correction { version: 7 }).unwrap();
        assert_eq!(json, json!({"response_type": "correction", "version": 7}));

        let json = serde_json::to_value(ServerResponse::Pong).unwrap();
        assert_eq!(json, json!({"response_type": "pong"}));

        let users = ServerResponse::Users {
            users: HashMap::from([("d1".to_string(), vec!["alice".to_string()])]),
        };
        let json = serde_json::to_value(users).unwrap();
        assert_eq!(json, json!({"response_type": "users", "users": {"d1": ["alice"]}}));

        let json = serde_json::to_value(ServerResponse::error("unauthorized")).unwrap();
        assert_eq!(json, json!({"response_type": "error", "error": "unauthorized"}));

        let update = ServerResponse::Update {
            user_updates: vec![ClientUpdate {
                client: ClientInfo {
                    user_id: "bob".into(),
                    session_id: "s".into(),
                },
                message: Message {
                    message: String::new(),
                    position: None,
                    active: false,
                },
            }],
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["response_type"], "update");
        assert_eq!(json["user_updates"][0]["client"]["user_id"], "bob");
        assert_eq!(json["user_updates"][0]["message"], json!({"active": false}));
    }
}

use serde::{Deserialize, Serialize};

pub mod active_session;
pub mod turn_queue;

pub use active_session::{
    ActiveSession, ActiveSessionRef, FrameSender, GREETING_RESPONSE_ID, SessionOptions,
};
pub use turn_queue::TurnQueue;

/// Turn-taking marker on transcript pushes. Only this exact value means the
/// caller has started a new utterance while the agent is speaking.
pub const USER_TURN: &str = "user_turn";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TranscriptEntry {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// Inbound frame from the voice transport. Unrecognized interaction kinds
/// (ping, call-ended, ...) fold into `Other` and are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "interaction_type", rename_all = "snake_case")]
pub enum InboundFrame {
    UpdateOnly {
        turntaking: Option<String>,
    },
    ResponseRequired {
        response_id: u64,
        #[serde(default)]
        transcript: Vec<TranscriptEntry>,
    },
    #[serde(other)]
    Other,
}

/// Outbound frame to the voice transport. `response_id` echoes the inbound
/// request (`0` for the greeting); `end_call` is reserved and serialized for
/// forward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub response_type: String,
    pub response_id: u64,
    pub content: String,
    pub content_complete: bool,
    pub end_call: bool,
}

impl OutboundFrame {
    pub fn partial(response_id: u64, content: impl Into<String>) -> Self {
        Self {
            response_type: "response".to_string(),
            response_id,
            content: content.into(),
            content_complete: false,
            end_call: false,
        }
    }

    pub fn complete(response_id: u64, content: impl Into<String>) -> Self {
        Self {
            response_type: "response".to_string(),
            response_id,
            content: content.into(),
            content_complete: true,
            end_call: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_update_only_with_turntaking() {
        let frame: InboundFrame = serde_json::from_str(
            r#"{"interaction_type":"update_only","turntaking":"user_turn","transcript":[]}"#,
        )
        .unwrap();
        match frame {
            InboundFrame::UpdateOnly { turntaking } => {
                assert_eq!(turntaking.as_deref(), Some(USER_TURN));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn parses_response_required() {
        let frame: InboundFrame = serde_json::from_str(
            r#"{"interaction_type":"response_required","response_id":3,"transcript":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();
        match frame {
            InboundFrame::ResponseRequired {
                response_id,
                transcript,
            } => {
                assert_eq!(response_id, 3);
                assert_eq!(transcript[0].content, "hi");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn unknown_interaction_kinds_fold_into_other() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"interaction_type":"ping_pong","timestamp":1}"#).unwrap();
        assert!(matches!(frame, InboundFrame::Other));
    }

    #[test]
    fn non_json_frames_do_not_parse() {
        assert!(serde_json::from_str::<InboundFrame>("hello there").is_err());
    }

    #[test]
    fn outbound_frames_serialize_the_full_shape() {
        let frame = OutboundFrame::complete(7, "");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "response_type": "response",
                "response_id": 7,
                "content": "",
                "content_complete": true,
                "end_call": false,
            })
        );
    }
}

//! Serde round-trip tests for core types.

use turnloop::*;

fn roundtrip<T: serde::Serialize + serde::de::DeserializeOwned + PartialEq + std::fmt::Debug>(
    value: &T,
) {
    let json = serde_json::to_string(value).expect("serialize");
    let back: T = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(*value, back);
}

#[test]
fn test_message_user_roundtrip() {
    let msg = Message::User {
        content: vec![Content::Text {
            text: "Hello".into(),
        }],
        timestamp: 123456,
    };
    roundtrip(&msg);
}

#[test]
fn test_message_assistant_roundtrip() {
    let msg = Message::Assistant {
        content: vec![
            Content::Text {
                text: "Hi there".into(),
            },
            Content::ToolCall {
                id: "tc-1".into(),
                name: "read_file".into(),
                arguments: serde_json::json!({"path": "foo.rs"}),
                intent: Some("check the config".into()),
            },
        ],
        stop_reason: StopReason::ToolUse,
        model: "claude-sonnet".into(),
        provider: "anthropic".into(),
        usage: Usage {
            input: 100,
            output: 50,
            cache_read: 10,
            cache_write: 5,
            total_tokens: 165,
            cost: 0.0042,
        },
        timestamp: 789,
        error_message: None,
    };
    roundtrip(&msg);
}

#[test]
fn test_message_tool_result_roundtrip() {
    let msg = Message::ToolResult {
        tool_call_id: "tc-1".into(),
        tool_name: "read_file".into(),
        content: vec![Content::Text {
            text: "file contents".into(),
        }],
        is_error: false,
        details: serde_json::json!({"bytes": 512}),
        timestamp: 42,
    };
    roundtrip(&msg);
}

#[test]
fn test_agent_message_extension_roundtrip() {
    let msg = AgentMessage::Extension {
        role: "ui-banner".into(),
        data: serde_json::json!({"text": "compacting...", "level": "info"}),
    };
    roundtrip(&msg);
}

#[test]
fn test_tool_call_without_intent_omits_field() {
    let content = Content::ToolCall {
        id: "tc-1".into(),
        name: "echo".into(),
        arguments: serde_json::json!({}),
        intent: None,
    };
    let json = serde_json::to_value(&content).unwrap();
    assert!(json.get("intent").is_none());
}

#[test]
fn test_tool_result_null_details_omitted() {
    let msg = Message::ToolResult {
        tool_call_id: "tc-1".into(),
        tool_name: "echo".into(),
        content: vec![],
        is_error: true,
        details: serde_json::Value::Null,
        timestamp: 0,
    };
    let json = serde_json::to_value(&msg).unwrap();
    assert!(json.get("details").is_none());
    roundtrip(&msg);
}

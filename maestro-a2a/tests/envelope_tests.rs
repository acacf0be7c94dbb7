use maestro_a2a::{
    A2aMessage, JsonRpcRequest, JsonRpcResponse, MessageSendParams, Part, TaskState, TransferData,
    extract_transfer, transfer_task,
};
use proptest::prelude::*;
use serde_json::{Value, json};

#[test]
fn message_send_params_roundtrip() {
    let raw = json!({
        "message": {
            "messageId": "m1",
            "contextId": "c1",
            "parts": [
                { "kind": "text", "text": "Hi" },
                { "kind": "data", "data": { "x": 1 } }
            ]
        },
        "configuration": { "blocking": true }
    });

    let params: MessageSendParams = serde_json::from_value(raw).unwrap();
    assert_eq!(params.message.message_id, "m1");
    assert_eq!(params.message.context_id.as_deref(), Some("c1"));
    assert_eq!(params.message.parts.len(), 2);
    assert_eq!(params.configuration.unwrap().blocking, Some(true));
}

#[test]
fn transfer_envelope_matches_wire_shape() {
    let data = TransferData::new("billing", Some("router".to_string()), "t1", "routing", "Hi");
    let task = transfer_task("t1", Some("conv-1"), &data);
    let wire = serde_json::to_value(&task).unwrap();

    let part = &wire["artifacts"][0]["parts"][0];
    assert_eq!(part["kind"], json!("data"));
    assert_eq!(part["data"]["type"], json!("transfer"));
    assert_eq!(part["data"]["target_subagent_id"], json!("billing"));
    assert_eq!(part["data"]["task_id"], json!("t1"));
    assert_eq!(part["data"]["original_message"], json!("Hi"));
    assert_eq!(task.status.state, TaskState::Completed);

    let parsed: maestro_a2a::A2aTask = serde_json::from_value(wire).unwrap();
    assert_eq!(extract_transfer(&parsed).unwrap(), data);
}

#[test]
fn agent_message_text_content_joins_parts() {
    let msg = A2aMessage::agent("m2", vec![Part::text("Hello"), Part::text(" there")]);
    assert_eq!(msg.text_content(), "Hello there");
}

fn arb_id() -> impl Strategy<Value = Option<Value>> {
    prop_oneof![
        Just(None),
        any::<i64>().prop_map(|n| Some(Value::Number(n.into()))),
        "[a-z0-9-]{1,24}".prop_map(|s| Some(Value::String(s))),
    ]
}

proptest! {
    #[test]
    fn jsonrpc_id_roundtrips(id in arb_id(), method in "[a-z/.]{1,20}") {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method,
            params: Some(json!({})),
            id: id.clone(),
        };
        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: JsonRpcRequest = serde_json::from_str(&encoded).unwrap();
        prop_assert_eq!(decoded.id, id.clone());

        let response = JsonRpcResponse::success(id.clone(), json!({"ok": true}));
        let encoded = serde_json::to_string(&response).unwrap();
        let decoded: JsonRpcResponse = serde_json::from_str(&encoded).unwrap();
        prop_assert_eq!(decoded.id, id);
    }
}

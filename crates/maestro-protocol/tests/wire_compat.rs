// Verify the public_sse_v1 wire format never drifts. Clients parse these
// frames by `kind`; field names and envelope shape are a contract.

use maestro_protocol::frames::{
    FrameEnvelope, FrameKind, GuardrailOutcome, StreamFrame, WorkflowMeta,
};
use maestro_protocol::sse;

fn envelope() -> FrameEnvelope {
    FrameEnvelope::new("11111111-2222-3333-4444-555555555555").with_agent("triage")
}

#[test]
fn every_frame_carries_the_schema_marker() {
    let frame = envelope().lifecycle(1, "run_started", serde_json::Value::Null);
    let json = serde_json::to_string(&frame).unwrap();
    assert!(json.contains(r#""schema":"public_sse_v1""#));
    assert!(json.contains(r#""kind":"lifecycle""#));
    assert!(json.contains(r#""event_id":1"#));
    assert!(json.contains(r#""stream_id":"stream_"#));
}

#[test]
fn raw_response_round_trip() {
    let frame = envelope().raw_response(
        7,
        "response.output_text.delta",
        Some("Hel".to_string()),
        None,
        Some("resp_42".to_string()),
    );
    let json = serde_json::to_string(&frame).unwrap();
    let back: StreamFrame = serde_json::from_str(&json).unwrap();
    assert_eq!(back.kind, FrameKind::RawResponse);
    assert_eq!(back.text_delta.as_deref(), Some("Hel"));
    assert_eq!(back.response_id.as_deref(), Some("resp_42"));
    // unset payload fields must be absent on the wire, not null
    assert!(!json.contains("reasoning_delta"));
    assert!(!json.contains("error_code"));
}

#[test]
fn terminal_kinds_are_final_and_error_only() {
    assert!(FrameKind::Final.is_terminal());
    assert!(FrameKind::Error.is_terminal());
    for kind in [
        FrameKind::RawResponse,
        FrameKind::RunItem,
        FrameKind::AgentUpdate,
        FrameKind::Lifecycle,
        FrameKind::GuardrailResult,
    ] {
        assert!(!kind.is_terminal());
    }
}

#[test]
fn final_frame_carries_response_text() {
    let frame = envelope().final_frame(3, Some("Hello!".to_string()), None, Some("resp_1".into()));
    let json = serde_json::to_string(&frame).unwrap();
    assert!(json.contains(r#""kind":"final""#));
    assert!(json.contains(r#""response_text":"Hello!""#));
}

#[test]
fn error_frame_carries_code_and_message() {
    let frame = envelope().error_frame(9, "cancelled", "client disconnected");
    let json = serde_json::to_string(&frame).unwrap();
    assert!(json.contains(r#""error_code":"cancelled""#));
    assert!(json.contains(r#""error_message":"client disconnected""#));
}

#[test]
fn guardrail_fields_flatten_into_the_envelope() {
    let frame = envelope().guardrail_result(
        4,
        GuardrailOutcome {
            guardrail_key: "pii_detection_output".to_string(),
            guardrail_stage: "output".to_string(),
            guardrail_tripwire_triggered: true,
            guardrail_suppressed: false,
            guardrail_token_usage: None,
            info: serde_json::json!({"matches": ["123-45-6789"]}),
        },
    );
    let json = serde_json::to_string(&frame).unwrap();
    // flattened: no nested "guardrail" object on the wire
    assert!(!json.contains(r#""guardrail":{"#));
    assert!(json.contains(r#""guardrail_key":"pii_detection_output""#));
    assert!(json.contains(r#""guardrail_tripwire_triggered":true"#));
}

#[test]
fn workflow_meta_appears_only_on_workflow_streams() {
    let plain = envelope().lifecycle(1, "run_started", serde_json::Value::Null);
    assert!(!serde_json::to_string(&plain).unwrap().contains("workflow"));

    let env = envelope().with_workflow(WorkflowMeta {
        workflow_key: "analysis_code".to_string(),
        workflow_run_id: "run-1".to_string(),
        step_name: Some("analysis".to_string()),
        step_agent: Some("analysis".to_string()),
        stage_name: Some("analysis".to_string()),
        parallel_group: None,
        branch_index: None,
    });
    let tagged = env.lifecycle(1, "step_started", serde_json::Value::Null);
    let json = serde_json::to_string(&tagged).unwrap();
    assert!(json.contains(r#""workflow_key":"analysis_code""#));
    assert!(json.contains(r#""step_name":"analysis""#));
    // absent optional workflow fields stay off the wire
    assert!(!json.contains("parallel_group"));
}

#[test]
fn sse_line_is_data_prefixed_json() {
    let frame = envelope().lifecycle(1, "run_started", serde_json::Value::Null);
    let line = sse::encode(&frame).unwrap();
    assert!(line.starts_with("data: {\"schema\":\"public_sse_v1\""));
    assert!(line.ends_with("\n\n"));
    // no event names, no retry fields
    assert!(!line.contains("event:"));
    assert!(!line.contains("retry:"));
}

#[test]
fn stream_ids_are_unique_and_well_formed() {
    let a = maestro_protocol::frames::new_stream_id();
    let b = maestro_protocol::frames::new_stream_id();
    assert_ne!(a, b);
    assert!(a.starts_with("stream_"));
    assert_eq!(a.len(), "stream_".len() + 16);
    assert!(a["stream_".len()..].chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn replay_reserialization_is_stable() {
    // A recorded frame decoded and re-encoded must be byte-equal: replay
    // parity depends on it.
    let frame = envelope().raw_response(2, "response.output_text.delta", Some("x".into()), None, None);
    let json = serde_json::to_string(&frame).unwrap();
    let back: StreamFrame = serde_json::from_str(&json).unwrap();
    assert_eq!(serde_json::to_string(&back).unwrap(), json);
}

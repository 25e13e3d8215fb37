use crate::frames::StreamFrame;

/// SSE keepalive comment. Not a frame; clients ignore it and it is never
/// recorded to the ledger.
pub const HEARTBEAT: &str = ":\n\n";

/// Encode a frame as a wire line: `data: <json>\n\n`.
pub fn encode(frame: &StreamFrame) -> Result<String, serde_json::Error> {
    Ok(format!("data: {}\n\n", serde_json::to_string(frame)?))
}

/// Encode pre-serialized frame JSON (ledger replay path, where the recorded
/// payload is re-emitted byte-for-byte apart from the stream id).
pub fn encode_json(json: &str) -> String {
    format!("data: {json}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::FrameEnvelope;

    #[test]
    fn encode_produces_single_data_line() {
        let env = FrameEnvelope::new("c-1");
        let frame = env.lifecycle(1, "run_started", serde_json::Value::Null);
        let line = encode(&frame).unwrap();
        assert!(line.starts_with("data: {"));
        assert!(line.ends_with("\n\n"));
        assert_eq!(line.matches('\n').count(), 2);
    }

    #[test]
    fn heartbeat_has_no_data_payload() {
        assert!(!HEARTBEAT.contains("data:"));
        assert!(HEARTBEAT.starts_with(':'));
    }
}

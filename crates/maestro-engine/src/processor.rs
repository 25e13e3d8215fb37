//! Stream processor: normalize provider events into `public_sse_v1`
//! frames and project completed run items into audit rows.

use maestro_protocol::frames::{
    FrameEnvelope, MessageAttachment, StreamFrame, ToolCallPayload,
};
use maestro_providers::{AgentStreamEvent, RunItem};
use maestro_store::types::NewRunItem;

/// Build the frame for one provider event. The ledger writer assigns
/// `event_id`; everything else comes from the envelope and the event.
pub fn build_frame(
    env: &FrameEnvelope,
    event: &AgentStreamEvent,
    event_id: u64,
    extra_attachments: Option<Vec<MessageAttachment>>,
) -> StreamFrame {
    match event {
        AgentStreamEvent::RawDelta {
            raw_type,
            text_delta,
            reasoning_delta,
            response_id,
        } => env.raw_response(
            event_id,
            raw_type.clone(),
            text_delta.clone(),
            reasoning_delta.clone(),
            response_id.clone(),
        ),

        AgentStreamEvent::RunItem(item) => {
            let mut frame = env.run_item(event_id);
            frame.run_item_type = Some(item.item_type.clone());
            frame.run_item_name = item.name.clone();
            frame.response_id = item.response_id.clone();
            frame.response_text = item.response_text.clone();
            frame.structured_output = item.structured_output.clone();
            frame.tool_call_id = item.tool_call_id.clone();
            frame.tool_name = item.tool_name.clone();
            frame.annotations = item.annotations.clone();
            if item.tool_call_id.is_some() || item.call_arguments.is_some() {
                frame.tool_call = Some(ToolCallPayload {
                    id: item.tool_call_id.clone(),
                    name: item.tool_name.clone(),
                    arguments: item.call_arguments.clone(),
                    output: item.call_output.clone(),
                });
            }
            if let Some(attachments) = extra_attachments {
                if !attachments.is_empty() {
                    frame.attachments = Some(attachments);
                }
            }
            frame
        }

        AgentStreamEvent::AgentUpdate {
            new_agent,
            display_name,
        } => env.agent_update(event_id, new_agent.clone(), display_name.clone()),

        AgentStreamEvent::Lifecycle { event, payload } => {
            env.lifecycle(event_id, event.clone(), payload.clone())
        }

        AgentStreamEvent::Final {
            response_id,
            response_text,
            structured_output,
            ..
        } => env.final_frame(
            event_id,
            response_text.clone(),
            structured_output.clone(),
            response_id.clone(),
        ),

        AgentStreamEvent::Error { code, message } => {
            env.error_frame(event_id, code.clone(), message.clone())
        }
    }
}

/// Project a completed run item into its audit row.
pub fn project_run_item(
    item: &RunItem,
    agent: &str,
    model: &str,
    attachments: Option<&[MessageAttachment]>,
) -> NewRunItem {
    NewRunItem {
        response_id: item.response_id.clone(),
        run_item_type: item.item_type.clone(),
        run_item_name: item.name.clone(),
        role: item.role.clone(),
        agent: Some(agent.to_string()),
        tool_call_id: item.tool_call_id.clone(),
        tool_name: item.tool_name.clone(),
        model: Some(model.to_string()),
        content_text: item.response_text.clone(),
        reasoning_text: item.reasoning_text.clone(),
        call_arguments: item.call_arguments.clone(),
        call_output: item.call_output.clone(),
        attachments: attachments
            .filter(|a| !a.is_empty())
            .map(|a| serde_json::to_value(a).unwrap_or_default()),
    }
}

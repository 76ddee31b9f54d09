//! Workflow streaming: typed events, run/resume requests and the interrupt
//! loop.
//!
//! # Design
//! A workflow run can pause on an `Interrupt` event that needs caller input.
//! Answering it opens a new resume stream, which may interrupt again. The
//! loop keeps the streams still to be consumed in a worklist instead of
//! recursing, so long chains of interrupts use constant stack.

use std::collections::{HashMap, VecDeque};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::async_client::AsyncCozeClient;
use crate::chat::payload;
use crate::error::CozeError;
use crate::http::RequestDescriptor;
use crate::stream::{Frame, StreamEvent};
use crate::sync_client::CozeClient;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkflowMessage {
    pub content: String,
    pub node_title: String,
    pub node_seq_id: String,
    pub node_is_finish: bool,
    pub ext: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct InterruptData {
    pub event_id: String,
    #[serde(rename = "type")]
    pub kind: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkflowInterrupt {
    pub interrupt_data: InterruptData,
    pub node_title: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    Message { id: Option<String>, message: WorkflowMessage },
    Interrupt { id: Option<String>, interrupt: WorkflowInterrupt },
    Ping { id: Option<String> },
    Unknown(Frame),
}

impl WorkflowEvent {
    pub fn id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::Message { id, .. } | WorkflowEvent::Interrupt { id, .. } | WorkflowEvent::Ping { id } => {
                id.as_deref()
            }
            WorkflowEvent::Unknown(frame) => frame.id.as_deref(),
        }
    }
}

impl StreamEvent for WorkflowEvent {
    const DONE: &'static str = "Done";
    const ERROR: &'static str = "Error";

    fn from_frame(frame: Frame, logid: &str) -> Result<Self, CozeError> {
        let event = match frame.event.as_str() {
            "Message" => WorkflowEvent::Message {
                message: payload(&frame, logid)?,
                id: frame.id,
            },
            "Interrupt" => WorkflowEvent::Interrupt {
                interrupt: payload(&frame, logid)?,
                id: frame.id,
            },
            "PING" => WorkflowEvent::Ping { id: frame.id },
            _ => WorkflowEvent::Unknown(frame),
        };
        Ok(event)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunWorkflow {
    pub workflow_id: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
}

impl RunWorkflow {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            parameters: HashMap::new(),
            bot_id: None,
        }
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeWorkflow {
    pub workflow_id: String,
    pub event_id: String,
    pub resume_data: String,
    pub interrupt_type: i32,
}

impl ResumeWorkflow {
    pub fn answer(workflow_id: impl Into<String>, interrupt: &WorkflowInterrupt, resume_data: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            event_id: interrupt.interrupt_data.event_id.clone(),
            resume_data: resume_data.into(),
            interrupt_type: interrupt.interrupt_data.kind,
        }
    }
}

pub fn stream_run_request(run: &RunWorkflow) -> Result<RequestDescriptor, CozeError> {
    RequestDescriptor::post("/v1/workflow/stream_run").json(run)
}

pub fn stream_resume_request(resume: &ResumeWorkflow) -> Result<RequestDescriptor, CozeError> {
    RequestDescriptor::post("/v1/workflow/stream_resume").json(resume)
}

/// Next request implied by one handled event, if any.
fn follow_up(workflow_id: &str, event: &WorkflowEvent, answer: Option<String>) -> Result<Option<RequestDescriptor>, CozeError> {
    match (event, answer) {
        (WorkflowEvent::Interrupt { interrupt, .. }, Some(resume_data)) => {
            debug!(event_id = %interrupt.interrupt_data.event_id, "resuming interrupted workflow");
            stream_resume_request(&ResumeWorkflow::answer(workflow_id, interrupt, resume_data)).map(Some)
        }
        _ => Ok(None),
    }
}

/// Run a workflow, handing every event to `handler`.
///
/// When `handler` returns `Some(resume_data)` for an `Interrupt`, the run is
/// resumed with that data and the resumed stream is fed to `handler` too.
/// Returning `Some` for any other event has no effect.
pub fn run_with_interrupts<H>(client: &CozeClient, run: &RunWorkflow, mut handler: H) -> Result<(), CozeError>
where
    H: FnMut(&WorkflowEvent) -> Result<Option<String>, CozeError>,
{
    let mut pending = VecDeque::from([stream_run_request(run)?]);
    while let Some(desc) = pending.pop_front() {
        for event in client.stream::<WorkflowEvent>(&desc)? {
            let event = event?;
            let answer = handler(&event)?;
            pending.extend(follow_up(&run.workflow_id, &event, answer)?);
        }
    }
    Ok(())
}

/// Async counterpart of [`run_with_interrupts`].
pub async fn run_with_interrupts_async<H>(client: &AsyncCozeClient, run: &RunWorkflow, mut handler: H) -> Result<(), CozeError>
where
    H: FnMut(&WorkflowEvent) -> Result<Option<String>, CozeError>,
{
    let mut pending = VecDeque::from([stream_run_request(run)?]);
    while let Some(desc) = pending.pop_front() {
        let mut events = client.stream::<WorkflowEvent>(&desc).await?;
        while let Some(event) = events.next().await {
            let event = event?;
            let answer = handler(&event)?;
            pending.extend(follow_up(&run.workflow_id, &event, answer)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use crate::http::RequestBody;

    fn frame(event: &str, data: &str, id: &str) -> Frame {
        Frame {
            event: event.to_string(),
            data: data.to_string(),
            id: Some(id.to_string()),
        }
    }

    fn body(desc: &RequestDescriptor) -> serde_json::Value {
        let RequestBody::Json(bytes) = &desc.body else {
            panic!("expected json body");
        };
        serde_json::from_slice(bytes).unwrap()
    }

    fn interrupt(event_id: &str) -> WorkflowEvent {
        WorkflowEvent::from_frame(
            frame(
                "Interrupt",
                &format!(r#"{{"interrupt_data":{{"event_id":"{event_id}","type":2}},"node_title":"Question"}}"#),
                "1",
            ),
            "",
        )
        .unwrap()
    }

    #[test]
    fn message_event_keeps_frame_id() {
        let event = WorkflowEvent::from_frame(
            frame("Message", r#"{"content":"42","node_title":"End","node_is_finish":true}"#, "7"),
            "",
        )
        .unwrap();
        assert_eq!(event.id(), Some("7"));
        let WorkflowEvent::Message { message, .. } = event else {
            panic!("expected message");
        };
        assert_eq!(message.content, "42");
        assert!(message.node_is_finish);
    }

    #[test]
    fn interrupt_event_is_typed() {
        let WorkflowEvent::Interrupt { interrupt, .. } = interrupt("evt-1") else {
            panic!("expected interrupt");
        };
        assert_eq!(interrupt.interrupt_data.event_id, "evt-1");
        assert_eq!(interrupt.interrupt_data.kind, 2);
        assert_eq!(interrupt.node_title, "Question");
    }

    #[test]
    fn ping_and_unknown_events() {
        assert_eq!(
            WorkflowEvent::from_frame(frame("PING", "{}", "3"), "").unwrap(),
            WorkflowEvent::Ping { id: Some("3".to_string()) }
        );
        let raw = frame("NodeStarted", "{}", "4");
        assert_eq!(WorkflowEvent::from_frame(raw.clone(), "").unwrap(), WorkflowEvent::Unknown(raw));
    }

    #[test]
    fn malformed_message_is_invalid_event() {
        let err = WorkflowEvent::from_frame(frame("Message", "[", "1"), "log").unwrap_err();
        assert!(matches!(err, CozeError::Stream(StreamError::InvalidEvent { ref field, .. }) if field == "Message"));
    }

    #[test]
    fn run_and_resume_requests() {
        let run = RunWorkflow::new("wf-1").parameter("city", "Paris");
        let desc = stream_run_request(&run).unwrap();
        assert_eq!(desc.path, "/v1/workflow/stream_run");
        assert_eq!(body(&desc)["parameters"]["city"], "Paris");

        let WorkflowEvent::Interrupt { interrupt, .. } = interrupt("evt-9") else {
            panic!("expected interrupt");
        };
        let desc = stream_resume_request(&ResumeWorkflow::answer("wf-1", &interrupt, "yes")).unwrap();
        assert_eq!(desc.path, "/v1/workflow/stream_resume");
        let body = body(&desc);
        assert_eq!(body["workflow_id"], "wf-1");
        assert_eq!(body["event_id"], "evt-9");
        assert_eq!(body["resume_data"], "yes");
        assert_eq!(body["interrupt_type"], 2);
    }

    #[test]
    fn only_answered_interrupts_resume() {
        let event = interrupt("evt-1");
        assert!(follow_up("wf", &event, None).unwrap().is_none());
        assert!(follow_up("wf", &event, Some("x".to_string())).unwrap().is_some());

        let ping = WorkflowEvent::Ping { id: None };
        assert!(follow_up("wf", &ping, Some("x".to_string())).unwrap().is_none());
    }
}

//! CLI event stream → Anthropic SSE timeline.
//!
//! The CLI runs its own tools; the client gateway must never see tool_use
//! blocks or it will try to execute the tools itself and loop. The
//! translator therefore filters all tool traffic, renumbers the surviving
//! content blocks into a contiguous client-side index space, injects
//! human-readable compaction notices, and guarantees the terminal
//! `message_delta` / `message_stop` pair on child close.

use serde_json::{json, Value};
use tracing::{debug, trace};

use switchboard_core::events::{BlockKind, CliEvent, Delta, TurnResult};
use switchboard_core::text::strip_gateway_tags;

/// One outbound SSE frame: `event: <name>\ndata: <json>\n\n`.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: &'static str,
    pub data: Value,
}

impl SseFrame {
    fn new(event: &'static str, data: Value) -> Self {
        Self { event, data }
    }
}

/// What the CLI is currently doing - selects the idle-watchdog threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Text,
    Tool,
    Compacting,
}

/// Frames plus monitor events produced by one CLI event.
#[derive(Debug, Default)]
pub struct Step {
    pub frames: Vec<SseFrame>,
    pub monitor: Vec<Value>,
}

impl Step {
    fn frame(&mut self, event: &'static str, data: Value) {
        self.frames.push(SseFrame::new(event, data));
    }

    fn watch(&mut self, data: Value) {
        self.monitor.push(data);
    }
}

pub struct Translator {
    message_id: String,
    model: String,

    started: bool,
    /// SSE index of the currently open forwarded block, if any.
    open_sse: Option<u64>,
    next_sse: u64,
    /// The CLI-side block currently open is a tool_use we are filtering.
    inside_tool: bool,
    tool_input_json: String,
    tool_name: String,

    tool_executing: bool,
    compacting: bool,
    text_sent: bool,
    errored: bool,

    input_tokens: u64,
    output_tokens: u64,
    result: Option<TurnResult>,
}

impl Translator {
    pub fn new(message_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            started: false,
            open_sse: None,
            next_sse: 0,
            inside_tool: false,
            tool_input_json: String::new(),
            tool_name: String::new(),
            tool_executing: false,
            compacting: false,
            text_sent: false,
            errored: false,
            input_tokens: 0,
            output_tokens: 0,
            result: None,
        }
    }

    pub fn phase(&self) -> Phase {
        if self.compacting {
            Phase::Compacting
        } else if self.tool_executing {
            Phase::Tool
        } else {
            Phase::Text
        }
    }

    /// Final token counts as reported by the CLI.
    pub fn usage(&self) -> (u64, u64) {
        (self.input_tokens, self.output_tokens)
    }

    /// The CLI's final summary, once seen.
    pub fn result(&self) -> Option<&TurnResult> {
        self.result.as_ref()
    }

    pub fn errored(&self) -> bool {
        self.errored
    }

    /// Whether anything has been emitted to the client yet. Spawn retries
    /// are only safe while this is false.
    pub fn emitted(&self) -> bool {
        self.started
    }

    /// Translate one CLI event.
    pub fn handle(&mut self, event: CliEvent) -> Step {
        let mut step = Step::default();
        match event {
            CliEvent::ContentBlockStart { index, block } => {
                self.on_block_start(index, block, &mut step)
            }
            CliEvent::ContentBlockDelta { delta, .. } => self.on_block_delta(delta, &mut step),
            CliEvent::ContentBlockStop { .. } => self.on_block_stop(&mut step),
            CliEvent::MessageDelta {
                stop_reason,
                output_tokens,
            } => {
                if let Some(out) = output_tokens {
                    self.output_tokens = out;
                }
                // A tool_use stop belongs to a block the client never saw.
                if stop_reason.as_deref() != Some("tool_use") {
                    self.ensure_started(&mut step);
                    step.frame(
                        "message_delta",
                        json!({
                            "type": "message_delta",
                            "delta": {
                                "stop_reason": stop_reason,
                                "stop_sequence": null
                            },
                            "usage": {"output_tokens": self.output_tokens}
                        }),
                    );
                }
            }
            CliEvent::System {
                subtype,
                status,
                pre_tokens,
            } => self.on_system(&subtype, status.as_deref(), pre_tokens, &mut step),
            CliEvent::Result(result) => self.on_result(result, &mut step),
            CliEvent::Error { message } => {
                self.errored = true;
                step.watch(json!({"type": "cli_error", "message": message}));
                step.frame(
                    "error",
                    json!({
                        "type": "error",
                        "error": {"type": "api_error", "message": message}
                    }),
                );
            }
            CliEvent::Init(v) => {
                trace!("CLI init event");
                step.watch(json!({"type": "cli_init", "payload": v}));
            }
            CliEvent::Assistant(v) => {
                step.watch(json!({"type": "cli_assistant", "payload": v}));
            }
            CliEvent::User(v) => {
                step.watch(json!({"type": "cli_tool_result", "payload": v}));
            }
            CliEvent::Unknown(v) => {
                debug!(event = %v, "unrecognised CLI event ignored");
                step.watch(json!({"type": "cli_unknown", "payload": v}));
            }
        }
        step
    }

    /// The child's stdout closed. Emits the closing frames still owed to
    /// the client; empty after an `error` event.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut step = Step::default();
        if self.errored {
            return step.frames;
        }
        self.ensure_started(&mut step);
        self.close_open_block(&mut step);
        step.frame(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                "usage": {"output_tokens": self.output_tokens}
            }),
        );
        step.frame("message_stop", json!({"type": "message_stop"}));
        step.frames
    }

    fn on_block_start(&mut self, index: u64, block: BlockKind, step: &mut Step) {
        trace!(index, kind = block.as_str(), "content_block_start");
        if block.is_tool_use() {
            // Hidden from the client: the CLI executes its own tools.
            self.inside_tool = true;
            self.tool_executing = true;
            self.tool_input_json.clear();
            if let BlockKind::ToolUse { ref name, ref id } = block {
                self.tool_name = name.clone();
                step.watch(json!({
                    "type": "tool_use",
                    "name": name,
                    "id": id,
                }));
            }
            return;
        }

        match block {
            BlockKind::Text | BlockKind::Thinking => {
                self.compacting = false;
                self.tool_executing = false;
                self.ensure_started(step);
                self.close_open_block(step);

                let sse_index = self.next_sse;
                self.next_sse += 1;
                let content_block = match block {
                    BlockKind::Text => json!({"type": "text", "text": ""}),
                    _ => json!({"type": "thinking", "thinking": ""}),
                };
                step.frame(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": sse_index,
                        "content_block": content_block
                    }),
                );
                self.open_sse = Some(sse_index);
            }
            other => {
                debug!(kind = other.as_str(), "unhandled block kind filtered");
                step.watch(json!({"type": "cli_block", "kind": other.as_str()}));
            }
        }
    }

    fn on_block_delta(&mut self, delta: Delta, step: &mut Step) {
        match delta {
            Delta::InputJson(partial) => {
                // Filtered while inside a tool block; kept for monitoring.
                if self.inside_tool {
                    self.tool_input_json.push_str(&partial);
                }
            }
            Delta::Text(text) => {
                if self.inside_tool {
                    return;
                }
                let Some(index) = self.open_sse else { return };
                let clean = strip_gateway_tags(&text);
                if clean.is_empty() {
                    return;
                }
                self.text_sent = true;
                step.frame(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "text_delta", "text": clean}
                    }),
                );
            }
            Delta::Thinking(text) => {
                if self.inside_tool {
                    return;
                }
                let Some(index) = self.open_sse else { return };
                step.frame(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "thinking_delta", "thinking": text}
                    }),
                );
            }
            Delta::Other(kind) => {
                trace!(kind, "unhandled delta type");
            }
        }
    }

    fn on_block_stop(&mut self, step: &mut Step) {
        if self.inside_tool {
            // Close the tool block silently. `tool_executing` stays on until
            // the next text/thinking block: the CLI is now running the tool.
            self.inside_tool = false;
            let input: Value =
                serde_json::from_str(&self.tool_input_json).unwrap_or_else(|_| json!({}));
            step.watch(json!({
                "type": "tool_input",
                "name": std::mem::take(&mut self.tool_name),
                "input": input,
            }));
            self.tool_input_json.clear();
            return;
        }
        self.close_open_block(step);
    }

    fn on_system(
        &mut self,
        subtype: &str,
        status: Option<&str>,
        pre_tokens: Option<u64>,
        step: &mut Step,
    ) {
        match (subtype, status) {
            ("compact_boundary", _) => {
                self.compacting = true;
                let notice = match pre_tokens {
                    Some(n) => format!(
                        "[Auto context compaction ({n} tokens) - summarizing conversation history...]"
                    ),
                    None => "[Auto context compaction - summarizing conversation history...]"
                        .to_string(),
                };
                step.watch(json!({"type": "compaction", "pre_tokens": pre_tokens}));
                self.inject_notice(&notice, step);
            }
            ("status", Some("compacting")) => {
                self.compacting = true;
                step.watch(json!({"type": "compaction"}));
                self.inject_notice(
                    "[Context compaction in progress - this may take a few minutes, please wait...]",
                    step,
                );
            }
            _ => {
                step.watch(json!({"type": "cli_system", "subtype": subtype, "status": status}));
            }
        }
    }

    fn on_result(&mut self, result: TurnResult, step: &mut Step) {
        self.input_tokens = result.usage.total_input();
        if result.usage.output_tokens > 0 {
            self.output_tokens = result.usage.output_tokens;
        }
        step.watch(json!({
            "type": "turn_result",
            "is_error": result.is_error,
            "usage": result.usage,
        }));

        // If the stream carried no text (tool-only turns, or plain-json
        // mode), the final text lives only in the result summary. Surface it
        // as a synthetic block so the client always sees the reply.
        if !self.text_sent {
            if let Some(text) = result.text.as_deref() {
                let clean = strip_gateway_tags(text);
                if !clean.is_empty() {
                    self.inject_notice(&clean, step);
                    self.text_sent = true;
                }
            }
        }
        self.result = Some(result);
    }

    /// Emit a complete synthetic text block (start/delta/stop).
    fn inject_notice(&mut self, text: &str, step: &mut Step) {
        self.ensure_started(step);
        self.close_open_block(step);
        let index = self.next_sse;
        self.next_sse += 1;
        step.frame(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {"type": "text", "text": ""}
            }),
        );
        step.frame(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "text_delta", "text": text}
            }),
        );
        step.frame(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": index}),
        );
    }

    fn ensure_started(&mut self, step: &mut Step) {
        if self.started {
            return;
        }
        self.started = true;
        step.frames.insert(
            0,
            SseFrame::new(
                "message_start",
                json!({
                    "type": "message_start",
                    "message": {
                        "id": self.message_id,
                        "type": "message",
                        "role": "assistant",
                        "model": self.model,
                        "content": [],
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": {"input_tokens": 0, "output_tokens": 0}
                    }
                }),
            ),
        );
    }

    fn close_open_block(&mut self, step: &mut Step) {
        if let Some(index) = self.open_sse.take() {
            step.frame(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": index}),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(v: Value) -> CliEvent {
        CliEvent::from_value(v)
    }

    fn run(events: Vec<Value>) -> (Vec<SseFrame>, Translator) {
        let mut t = Translator::new("msg_test", "sonnet");
        let mut frames = Vec::new();
        for v in events {
            frames.extend(t.handle(ev(v)).frames);
        }
        frames.extend(t.finish());
        (frames, t)
    }

    fn names(frames: &[SseFrame]) -> Vec<&'static str> {
        frames.iter().map(|f| f.event).collect()
    }

    #[test]
    fn tool_blocks_are_filtered_and_indices_renumbered() {
        // Mirrors the tool-then-text shape: the tool block at CLI index 0
        // must vanish and the text block must surface at SSE index 0.
        let (frames, _) = run(vec![
            json!({"type":"content_block_start","index":0,
                   "content_block":{"type":"tool_use","id":"t1","name":"Bash"}}),
            json!({"type":"content_block_delta","index":0,
                   "delta":{"type":"input_json_delta","partial_json":"{\"cmd\":1}"}}),
            json!({"type":"content_block_stop","index":0}),
            json!({"type":"content_block_start","index":1,
                   "content_block":{"type":"text","text":""}}),
            json!({"type":"content_block_delta","index":1,
                   "delta":{"type":"text_delta","text":"Result"}}),
            json!({"type":"content_block_stop","index":1}),
            json!({"type":"result","result":"Result","usage":{"output_tokens":3}}),
        ]);

        assert_eq!(
            names(&frames),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        // Remapped to SSE index 0.
        assert_eq!(frames[1].data["index"], 0);
        assert_eq!(frames[2].data["delta"]["text"], "Result");
        assert_eq!(frames[3].data["index"], 0);
        // Nothing tool-shaped leaks.
        for f in &frames {
            assert_ne!(f.data["content_block"]["type"], "tool_use");
            assert_ne!(f.data["delta"]["type"], "input_json_delta");
        }
    }

    #[test]
    fn sse_indices_are_contiguous_from_zero() {
        let (frames, _) = run(vec![
            json!({"type":"content_block_start","index":3,
                   "content_block":{"type":"thinking","thinking":""}}),
            json!({"type":"content_block_delta","index":3,
                   "delta":{"type":"thinking_delta","thinking":"hmm"}}),
            json!({"type":"content_block_stop","index":3}),
            json!({"type":"content_block_start","index":7,
                   "content_block":{"type":"tool_use","id":"t","name":"Read"}}),
            json!({"type":"content_block_stop","index":7}),
            json!({"type":"content_block_start","index":9,
                   "content_block":{"type":"text","text":""}}),
            json!({"type":"content_block_delta","index":9,
                   "delta":{"type":"text_delta","text":"answer"}}),
            json!({"type":"content_block_stop","index":9}),
        ]);

        let starts: Vec<u64> = frames
            .iter()
            .filter(|f| f.event == "content_block_start")
            .map(|f| f.data["index"].as_u64().unwrap())
            .collect();
        assert_eq!(starts, vec![0, 1]);
        // Every start has a matching stop at the same index before stop.
        let stops: Vec<u64> = frames
            .iter()
            .filter(|f| f.event == "content_block_stop")
            .map(|f| f.data["index"].as_u64().unwrap())
            .collect();
        assert_eq!(stops, vec![0, 1]);
        assert_eq!(frames.last().unwrap().event, "message_stop");
    }

    #[test]
    fn result_only_stream_synthesizes_text_block() {
        let (frames, t) = run(vec![json!({
            "type":"result",
            "result":"The answer is 42. [[reply_to_message_id: 9]]",
            "usage":{"input_tokens":7,"cache_read_input_tokens":100,"output_tokens":12}
        })]);

        assert_eq!(
            names(&frames),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(frames[2].data["delta"]["text"], "The answer is 42. ");
        assert_eq!(t.usage(), (107, 12));
    }

    #[test]
    fn result_before_block_stop_is_tolerated() {
        let (frames, _) = run(vec![
            json!({"type":"content_block_start","index":0,
                   "content_block":{"type":"text","text":""}}),
            json!({"type":"content_block_delta","index":0,
                   "delta":{"type":"text_delta","text":"hi"}}),
            json!({"type":"result","result":"hi","usage":{"output_tokens":1}}),
            json!({"type":"content_block_stop","index":0}),
        ]);
        // One start, one stop, stop before message_stop, no duplicates.
        let starts = frames.iter().filter(|f| f.event == "content_block_start").count();
        let stops = frames.iter().filter(|f| f.event == "content_block_stop").count();
        assert_eq!(starts, 1);
        assert_eq!(stops, 1);
        assert_eq!(frames.last().unwrap().event, "message_stop");
    }

    #[test]
    fn compaction_injects_notice_and_extends_phase() {
        let mut t = Translator::new("m", "sonnet");
        let step = t.handle(ev(json!({
            "type":"system","subtype":"compact_boundary",
            "compact_metadata":{"trigger":"auto","pre_tokens":155000}
        })));
        assert_eq!(t.phase(), Phase::Compacting);
        let text = step
            .frames
            .iter()
            .find(|f| f.event == "content_block_delta")
            .unwrap()
            .data["delta"]["text"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(text.contains("155000 tokens"), "notice was: {text}");
        // message_start was injected ahead of the notice.
        assert_eq!(step.frames[0].event, "message_start");

        // The next text block clears the compaction phase.
        t.handle(ev(json!({"type":"content_block_start","index":1,
                            "content_block":{"type":"text","text":""}})));
        assert_eq!(t.phase(), Phase::Text);
    }

    #[test]
    fn tool_phase_persists_until_next_text_block() {
        let mut t = Translator::new("m", "sonnet");
        t.handle(ev(json!({"type":"content_block_start","index":0,
                           "content_block":{"type":"tool_use","id":"t","name":"Bash"}})));
        assert_eq!(t.phase(), Phase::Tool);
        // Tool block closes; the CLI is now executing the tool.
        t.handle(ev(json!({"type":"content_block_stop","index":0})));
        assert_eq!(t.phase(), Phase::Tool);
        t.handle(ev(json!({"type":"content_block_start","index":1,
                           "content_block":{"type":"text","text":""}})));
        assert_eq!(t.phase(), Phase::Text);
    }

    #[test]
    fn error_suppresses_message_stop() {
        let (frames, t) = run(vec![
            json!({"type":"error","error":{"message":"boom"}}),
        ]);
        assert!(t.errored());
        assert_eq!(names(&frames), vec!["error"]);
        assert!(frames.iter().all(|f| f.event != "message_stop"));
    }

    #[test]
    fn gateway_tags_are_stripped_from_deltas() {
        let (frames, _) = run(vec![
            json!({"type":"content_block_start","index":0,
                   "content_block":{"type":"text","text":""}}),
            json!({"type":"content_block_delta","index":0,
                   "delta":{"type":"text_delta","text":"ok [[reply_to_message_id: 123]] done"}}),
            json!({"type":"content_block_stop","index":0}),
        ]);
        let delta = frames
            .iter()
            .find(|f| f.event == "content_block_delta")
            .unwrap();
        assert_eq!(delta.data["delta"]["text"], "ok done");
    }

    #[test]
    fn message_delta_updates_output_tokens() {
        let mut t = Translator::new("m", "sonnet");
        let step = t.handle(ev(json!({
            "type":"message_delta",
            "delta":{"stop_reason":"end_turn"},
            "usage":{"output_tokens":55}
        })));
        assert!(step.frames.iter().any(|f| f.event == "message_delta"));
        assert_eq!(t.usage().1, 55);
    }
}

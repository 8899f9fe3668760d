// Verify the SSE timeline contract the client gateway depends on.
// These tests feed recorded CLI stdout through the parser and translator
// exactly as the run loop does, and check the invariants end to end.

use serde_json::{json, Value};
use switchboard_core::events::CliEvent;
use switchboard_runner::parser::ObjectParser;
use switchboard_runner::translate::{SseFrame, Translator};

/// Pump raw stdout bytes through parser + translator, then close.
fn replay(stdout: &[u8]) -> Vec<SseFrame> {
    let mut parser = ObjectParser::new();
    let mut translator = Translator::new("msg_fixture", "sonnet");
    let mut frames = Vec::new();
    // Feed in small chunks to exercise buffering.
    for chunk in stdout.chunks(7) {
        for value in parser.push(chunk) {
            frames.extend(translator.handle(CliEvent::from_value(value)).frames);
        }
    }
    frames.extend(translator.finish());
    frames
}

fn stdout_of(events: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for e in events {
        out.extend_from_slice(e.to_string().as_bytes());
        out.push(b'\n');
    }
    out
}

fn event_names(frames: &[SseFrame]) -> Vec<&'static str> {
    frames.iter().map(|f| f.event).collect()
}

#[test]
fn tool_turn_produces_the_filtered_timeline() {
    // A tool call at CLI index 0 followed by text at CLI index 1: the
    // client must see only message_start, one text block at index 0, the
    // terminal delta, and message_stop.
    let stdout = stdout_of(&[
        json!({"type":"content_block_start","index":0,
               "content_block":{"type":"tool_use","id":"tu_1","name":"Bash"}}),
        json!({"type":"content_block_delta","index":0,
               "delta":{"type":"input_json_delta","partial_json":"{\"command\":\"ls\"}"}}),
        json!({"type":"content_block_stop","index":0}),
        json!({"type":"content_block_start","index":1,
               "content_block":{"type":"text","text":""}}),
        json!({"type":"content_block_delta","index":1,
               "delta":{"type":"text_delta","text":"Result"}}),
        json!({"type":"content_block_stop","index":1}),
        json!({"type":"result","result":"Result",
               "usage":{"input_tokens":5,"output_tokens":2}}),
    ]);

    let frames = replay(&stdout);
    assert_eq!(
        event_names(&frames),
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    assert_eq!(frames[1].data["index"], 0);
    assert_eq!(frames[1].data["content_block"]["type"], "text");
    assert_eq!(frames[2].data["delta"]["text"], "Result");
}

#[test]
fn exactly_one_start_and_stop_and_stop_is_last() {
    let stdout = stdout_of(&[
        json!({"type":"content_block_start","index":0,
               "content_block":{"type":"thinking","thinking":""}}),
        json!({"type":"content_block_delta","index":0,
               "delta":{"type":"thinking_delta","thinking":"let me think"}}),
        json!({"type":"content_block_stop","index":0}),
        json!({"type":"content_block_start","index":1,
               "content_block":{"type":"text","text":""}}),
        json!({"type":"content_block_delta","index":1,
               "delta":{"type":"text_delta","text":"done"}}),
        json!({"type":"content_block_stop","index":1}),
        json!({"type":"result","result":"done","usage":{"output_tokens":1}}),
    ]);

    let frames = replay(&stdout);
    let starts = frames.iter().filter(|f| f.event == "message_start").count();
    let stops = frames.iter().filter(|f| f.event == "message_stop").count();
    assert_eq!(starts, 1);
    assert_eq!(stops, 1);
    assert_eq!(frames.last().unwrap().event, "message_stop");
}

#[test]
fn block_indices_are_contiguous_from_zero() {
    // Tool blocks interleaved between forwarded blocks must not leave holes
    // in the client-side numbering.
    let stdout = stdout_of(&[
        json!({"type":"content_block_start","index":0,
               "content_block":{"type":"thinking","thinking":""}}),
        json!({"type":"content_block_stop","index":0}),
        json!({"type":"content_block_start","index":1,
               "content_block":{"type":"tool_use","id":"a","name":"Read"}}),
        json!({"type":"content_block_stop","index":1}),
        json!({"type":"content_block_start","index":2,
               "content_block":{"type":"tool_use","id":"b","name":"Grep"}}),
        json!({"type":"content_block_stop","index":2}),
        json!({"type":"content_block_start","index":3,
               "content_block":{"type":"text","text":""}}),
        json!({"type":"content_block_delta","index":3,
               "delta":{"type":"text_delta","text":"found it"}}),
        json!({"type":"content_block_stop","index":3}),
    ]);

    let frames = replay(&stdout);
    let indices: Vec<u64> = frames
        .iter()
        .filter(|f| f.event == "content_block_start")
        .map(|f| f.data["index"].as_u64().unwrap())
        .collect();
    assert_eq!(indices, vec![0, 1]);
}

#[test]
fn no_tool_traffic_reaches_the_client() {
    let stdout = stdout_of(&[
        json!({"type":"content_block_start","index":0,
               "content_block":{"type":"tool_use","id":"tu","name":"Write"}}),
        json!({"type":"content_block_delta","index":0,
               "delta":{"type":"input_json_delta","partial_json":"{\"path\":\"x\"}"}}),
        json!({"type":"content_block_stop","index":0}),
        json!({"type":"result","result":"wrote the file","usage":{"output_tokens":4}}),
    ]);

    for frame in replay(&stdout) {
        assert_ne!(frame.data["content_block"]["type"], "tool_use");
        assert_ne!(frame.data["delta"]["type"], "input_json_delta");
    }
}

#[test]
fn result_only_stream_still_delivers_text() {
    // Plain `--output-format json` runs emit a single result object and no
    // content blocks; the client must still get the reply as one block.
    let stdout = stdout_of(&[json!({
        "type":"result",
        "result":"Final answer. [[reply_to_message_id: 77]]",
        "usage":{"input_tokens":3,"cache_creation_input_tokens":1,
                 "cache_read_input_tokens":2,"output_tokens":9}
    })]);

    let frames = replay(&stdout);
    assert_eq!(
        event_names(&frames),
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    // Gateway tags never reach the client.
    assert_eq!(frames[2].data["delta"]["text"], "Final answer. ");
    // Terminal usage sums base + cache creation + cache reads.
    assert_eq!(frames[4].data["usage"]["output_tokens"], 9);
}

#[test]
fn concatenated_stdout_objects_survive_translation() {
    // No newline between the two objects: the brace scanner must split them.
    let mut stdout = Vec::new();
    stdout.extend_from_slice(
        json!({"type":"content_block_start","index":0,
               "content_block":{"type":"text","text":""}})
        .to_string()
        .as_bytes(),
    );
    stdout.extend_from_slice(
        json!({"type":"content_block_delta","index":0,
               "delta":{"type":"text_delta","text":"glued"}})
        .to_string()
        .as_bytes(),
    );

    let frames = replay(&stdout);
    assert!(frames
        .iter()
        .any(|f| f.event == "content_block_delta" && f.data["delta"]["text"] == "glued"));
}

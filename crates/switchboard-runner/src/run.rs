//! The per-turn run loop.
//!
//! One logical task per request: join the session queue, (for regenerate)
//! fork the stored conversation and preempt the active run, await the queue
//! head, spawn the CLI with the retry ladder, then pump its stdout through
//! the parser and translator until the child closes. Client disconnect,
//! regenerate preemption, and idle timeout all funnel through the same
//! close path, which releases the queue and active-run slots exactly once.

use std::time::Duration;

use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use switchboard_core::events::{CliEvent, TurnResult};
use switchboard_sessions::fork::fork_session;

use crate::engine::Engine;
use crate::error::{Result, RunnerError};
use crate::parser::ObjectParser;
use crate::queue::ActiveRun;
use crate::supervisor::{idle_window, spawn_with_prompt, terminate, SessionMode, SpawnSpec};
use crate::translate::{SseFrame, Translator};

/// Everything the handler resolved about a request before running it.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_key: String,
    pub uuid: String,
    /// Resume the stored conversation instead of starting fresh.
    pub resume: bool,
    pub prompt: String,
    /// Full system prompt (new sessions only).
    pub system: Option<String>,
    /// Per-turn fragment appended on resume (metadata block + reminder).
    pub append_system: Option<String>,
    pub model: String,
    pub stream: bool,
    pub request_id: String,
    pub identity: Option<String>,
    pub sender: Option<String>,
    pub regenerate: bool,
}

/// How a turn ended.
#[derive(Debug)]
pub struct TurnOutcome {
    /// The CLI's final summary, when one was parsed.
    pub result: Option<TurnResult>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Terminated by disconnect, preemption, or shutdown - not an error.
    pub cancelled: bool,
    /// The CLI reported a stream error; no `message_stop` was emitted.
    pub errored: bool,
}

/// Run one turn. `frames` receives the SSE timeline when streaming; a
/// closed receiver is treated as client disconnect. `kill` is this run's
/// cancellation signal (disconnect guard, preemption, shutdown).
pub async fn run_turn(
    engine: &Engine,
    mut req: TurnRequest,
    frames: Option<mpsc::Sender<SseFrame>>,
    kill: CancellationToken,
) -> Result<TurnOutcome> {
    let mut ticket = engine.queues.join(&req.session_key);

    if req.regenerate {
        // Fork first so the preempted run's final writes cannot land in the
        // timeline we are rewinding, then signal it to terminate.
        if engine.store.exists(&req.uuid) {
            match fork_session(&engine.store, &req.uuid) {
                Ok(fork_uuid) => {
                    engine
                        .registry
                        .record(&req.session_key, &fork_uuid, req.identity.as_deref());
                    req.uuid = fork_uuid;
                    req.resume = true;
                }
                Err(e) => warn!(uuid = %req.uuid, error = %e, "regeneration fork failed; continuing unforked"),
            }
        }
        if engine.active.kill(&req.session_key) {
            info!(session_key = %req.session_key, "regenerate preempted active run");
        }
    }

    // Wait for earlier runs - unless the client goes away first.
    tokio::select! {
        _ = ticket.wait_turn() => {}
        _ = kill.cancelled() => {
            engine.queues.release(&ticket);
            debug!(session_key = %req.session_key, "cancelled while queued");
            return Ok(TurnOutcome {
                result: None,
                input_tokens: 0,
                output_tokens: 0,
                cancelled: true,
                errored: false,
            });
        }
    }

    engine.active.insert(
        &req.session_key,
        ActiveRun {
            request_id: req.request_id.clone(),
            kill: kill.clone(),
            is_priority: req.regenerate,
            sender: req.sender.clone(),
        },
    );
    engine.monitor.publish(json!({
        "type": "run_started",
        "request_id": req.request_id,
        "session_key": req.session_key,
        "uuid": req.uuid,
        "resume": req.resume,
        "model": req.model,
        "sender": req.sender,
    }));

    let outcome = drive_with_retry(engine, &mut req, frames.as_ref(), &kill).await;

    // Single close path: exactly one release of both slots.
    engine.active.remove(&req.session_key, &req.request_id);
    engine.queues.release(&ticket);

    match &outcome {
        Ok(out) => {
            let success = !out.errored && !out.cancelled;
            if success {
                engine
                    .registry
                    .record(&req.session_key, &req.uuid, req.identity.as_deref());
            }
            engine.monitor.publish(json!({
                "type": "run_finished",
                "request_id": req.request_id,
                "session_key": req.session_key,
                "cancelled": out.cancelled,
                "errored": out.errored,
                "input_tokens": out.input_tokens,
                "output_tokens": out.output_tokens,
            }));
        }
        Err(e) => {
            engine.monitor.publish(json!({
                "type": "run_failed",
                "request_id": req.request_id,
                "session_key": req.session_key,
                "error": e.to_string(),
            }));
        }
    }

    outcome
}

/// Spawn and pump the child, applying the immediate-failure retry ladder:
/// "already in use" clears the lock file; a failed resume drops the
/// registry record; anything else clears the JSONL - each respawning as a
/// new session exactly once.
async fn drive_with_retry(
    engine: &Engine,
    req: &mut TurnRequest,
    frames: Option<&mpsc::Sender<SseFrame>>,
    kill: &CancellationToken,
) -> Result<TurnOutcome> {
    let mut mode = if req.resume {
        SessionMode::Resume {
            uuid: req.uuid.clone(),
            append_system: req.append_system.clone(),
        }
    } else {
        SessionMode::New {
            uuid: req.uuid.clone(),
            system: req.system.clone(),
        }
    };

    for attempt in 0..2 {
        let spec = SpawnSpec {
            command: engine.config.cli.command.clone(),
            workspace_dir: engine.config.cli.workspace_dir.clone(),
            model: req.model.clone(),
            stream: req.stream,
            mode: mode.clone(),
        };
        let child = spawn_with_prompt(&spec, &req.prompt).await?;

        match drive(engine, req, child, frames, kill).await? {
            Drive::Done(outcome) => return Ok(outcome),
            Drive::EarlyExit { code, stderr } => {
                if attempt > 0 {
                    return Err(RunnerError::SpawnFailed { code, stderr });
                }
                if stderr.contains("already in use") {
                    warn!(uuid = %req.uuid, "session file locked; clearing and respawning");
                    let _ = engine.store.delete(&req.uuid);
                } else if mode.is_resume() {
                    warn!(uuid = %req.uuid, code, "resume failed; dropping session record");
                    engine.registry.remove(&req.session_key);
                } else {
                    warn!(uuid = %req.uuid, code, "immediate exit; clearing session file for retry");
                    let _ = engine.store.delete(&req.uuid);
                }
                // All recovery paths respawn as a fresh session under the
                // same UUID.
                req.resume = false;
                mode = SessionMode::New {
                    uuid: req.uuid.clone(),
                    system: req.system.clone(),
                };
            }
        }
    }
    unreachable!("retry loop always returns by the second attempt");
}

enum Drive {
    Done(TurnOutcome),
    /// Exited within the spawn-probe window, nonzero, before any output
    /// reached the client - the only state a retry is safe in.
    EarlyExit { code: i32, stderr: String },
}

async fn drive(
    engine: &Engine,
    req: &TurnRequest,
    mut child: Child,
    frames: Option<&mpsc::Sender<SseFrame>>,
    kill: &CancellationToken,
) -> Result<Drive> {
    let _tracked = engine.children.track(&child);
    let timeouts = &engine.config.timeouts;
    let probe = Duration::from_secs(timeouts.spawn_probe_secs);
    let started = Instant::now();

    // Drain stderr on the side; it only matters for spawn-failure triage.
    let stderr_task = child.stderr.take().map(|mut err| {
        tokio::spawn(async move {
            let mut buf = Vec::with_capacity(1024);
            let _ = tokio::io::copy(&mut err, &mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        })
    });

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| RunnerError::Unavailable("child stdout not captured".into()))?;

    let mut parser = ObjectParser::new();
    let mut translator = Translator::new(req.request_id.clone(), req.model.clone());
    let mut chunk = vec![0u8; 8192];
    let mut deadline = started + idle_window(timeouts, translator.phase());
    let mut cancelled = false;
    let mut timed_out = false;

    loop {
        tokio::select! {
            read = stdout.read(&mut chunk) => {
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "child stdout read failed");
                        break;
                    }
                };
                for value in parser.push(&chunk[..n]) {
                    let step = translator.handle(CliEvent::from_value(value));
                    for event in step.monitor {
                        engine.monitor.publish(event);
                    }
                    if let Some(tx) = frames {
                        for frame in step.frames {
                            if tx.send(frame).await.is_err() {
                                // Client hung up mid-stream.
                                debug!(request_id = %req.request_id, "SSE receiver gone; killing child");
                                cancelled = true;
                                terminate(&child);
                                break;
                            }
                        }
                    }
                    if cancelled {
                        break;
                    }
                }
                if cancelled {
                    break;
                }
                // Every chunk resets the watchdog; phase changes pick up
                // their new threshold here too.
                deadline = Instant::now() + idle_window(timeouts, translator.phase());
            }
            _ = kill.cancelled() => {
                debug!(request_id = %req.request_id, "run cancelled; terminating child");
                cancelled = true;
                terminate(&child);
                break;
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    request_id = %req.request_id,
                    phase = ?translator.phase(),
                    "idle timeout; terminating child"
                );
                timed_out = true;
                terminate(&child);
                break;
            }
        }
    }

    // Reap the child; escalate if SIGTERM is ignored.
    let status = match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            warn!(request_id = %req.request_id, "child ignored SIGTERM; killing");
            child.start_kill().ok();
            child.wait().await?
        }
    };
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    let exit_code = status.code().unwrap_or(-1);
    let immediate = started.elapsed() < probe;
    let produced_output = translator.emitted() || translator.result().is_some();

    if immediate && !status.success() && !produced_output && !cancelled && !timed_out {
        debug!(exit_code, stderr = %stderr, "immediate CLI exit");
        return Ok(Drive::EarlyExit {
            code: exit_code,
            stderr,
        });
    }

    // A nonzero exit with parseable output is how the CLI reports quota and
    // credit conditions; the text passes through as a normal reply.
    if !status.success() && produced_output {
        info!(exit_code, "CLI exited nonzero with parseable output; passing through");
    }

    if !produced_output && !cancelled && !timed_out && !translator.errored() {
        return Err(RunnerError::NoOutput);
    }

    // Closing frames (block stop, message_delta, message_stop) - skipped
    // when the client is gone or the stream already errored out.
    if !cancelled {
        if let Some(tx) = frames {
            for frame in translator.finish() {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        } else {
            translator.finish();
        }
    }

    let (input_tokens, output_tokens) = translator.usage();
    Ok(Drive::Done(TurnOutcome {
        result: translator.result().cloned(),
        input_tokens,
        output_tokens,
        cancelled: cancelled || timed_out,
        errored: translator.errored(),
    }))
}

//! Child-process construction and lifecycle primitives.
//!
//! Each turn spawns the CLI once (twice at most, when the spawn-retry ladder
//! fires). The prompt travels over stdin - never argv, which has a length
//! limit - and conversation continuity comes from the CLI's own session
//! store, selected by session-id / resume flags.

use std::process::Stdio;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use switchboard_core::config::TimeoutConfig;

use crate::error::{Result, RunnerError};
use crate::translate::Phase;

/// How the child joins the stored conversation.
#[derive(Debug, Clone)]
pub enum SessionMode {
    /// First turn under this UUID. Carries the full system prompt.
    New {
        uuid: String,
        system: Option<String>,
    },
    /// Later turn: resume the stored conversation. Only an appended
    /// fragment is passed - re-sending the full system prompt would
    /// overwrite the stored one and erase history.
    Resume {
        uuid: String,
        append_system: Option<String>,
    },
}

impl SessionMode {
    pub fn uuid(&self) -> &str {
        match self {
            SessionMode::New { uuid, .. } | SessionMode::Resume { uuid, .. } => uuid,
        }
    }

    pub fn is_resume(&self) -> bool {
        matches!(self, SessionMode::Resume { .. })
    }
}

#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub workspace_dir: String,
    pub model: String,
    pub stream: bool,
    pub mode: SessionMode,
}

/// Build the CLI invocation for a turn.
pub fn build_command(spec: &SpawnSpec) -> Command {
    let mut cmd = Command::new(&spec.command);
    cmd.arg("-p")
        .arg("--output-format")
        .arg(if spec.stream { "stream-json" } else { "json" })
        .arg("--dangerously-skip-permissions")
        .arg("--model")
        .arg(&spec.model);

    if spec.stream {
        cmd.arg("--verbose").arg("--include-partial-messages");
    }

    match &spec.mode {
        SessionMode::New { uuid, system } => {
            cmd.arg("--session-id").arg(uuid);
            if let Some(system) = system {
                cmd.arg("--system-prompt").arg(system);
            }
        }
        SessionMode::Resume {
            uuid,
            append_system,
        } => {
            cmd.arg("--resume").arg(uuid);
            if let Some(fragment) = append_system {
                cmd.arg("--append-system-prompt").arg(fragment);
            }
        }
    }

    cmd.current_dir(&spec.workspace_dir)
        // The CLI must use its own auth, not a key inherited from us.
        .env_remove("ANTHROPIC_API_KEY")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Spawn the child and write the prompt to its stdin, closing it after.
pub async fn spawn_with_prompt(spec: &SpawnSpec, prompt: &str) -> Result<Child> {
    let mut cmd = build_command(spec);
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RunnerError::Unavailable(format!(
                "CLI not found at '{}' - install it or set cli.command",
                spec.command
            ))
        } else {
            RunnerError::Unavailable(format!("failed to spawn CLI: {e}"))
        }
    })?;

    debug!(
        uuid = spec.mode.uuid(),
        resume = spec.mode.is_resume(),
        stream = spec.stream,
        prompt_len = prompt.len(),
        "CLI spawned"
    );

    if let Some(mut stdin) = child.stdin.take() {
        // A write failure means the child already died; the exit status and
        // stderr carry the real story, so let the retry ladder see those.
        if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
            warn!(error = %e, "failed to write CLI stdin");
        }
        drop(stdin);
    }
    Ok(child)
}

/// Ask the child to terminate. SIGTERM so the CLI can flush its session
/// file; `kill_on_drop` remains the SIGKILL backstop.
pub fn terminate(child: &Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = child;
}

/// The idle window for the watchdog, by CLI phase. Tool execution and
/// context compaction legitimately go quiet for minutes.
pub fn idle_window(timeouts: &TimeoutConfig, phase: Phase) -> Duration {
    let secs = match phase {
        Phase::Text => timeouts.idle_secs,
        Phase::Tool => timeouts.tool_secs,
        Phase::Compacting => timeouts.compact_secs,
    };
    Duration::from_secs(secs)
}

/// PIDs of all live children, for graceful shutdown.
#[derive(Default)]
pub struct ChildTracker {
    pids: DashMap<u64, u32>,
    next: std::sync::atomic::AtomicU64,
}

impl ChildTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a child; returns a handle to untrack it on close.
    pub fn track(&self, child: &Child) -> Option<TrackedChild<'_>> {
        let pid = child.id()?;
        let id = self
            .next
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.pids.insert(id, pid);
        Some(TrackedChild { tracker: self, id })
    }

    /// SIGTERM every live child (process shutdown path).
    pub fn terminate_all(&self) {
        for entry in self.pids.iter() {
            let pid = *entry.value();
            warn!(pid, "terminating child on shutdown");
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

/// RAII guard: dropping untracks the child.
pub struct TrackedChild<'a> {
    tracker: &'a ChildTracker,
    id: u64,
}

impl Drop for TrackedChild<'_> {
    fn drop(&mut self) {
        self.tracker.pids.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(mode: SessionMode, stream: bool) -> SpawnSpec {
        SpawnSpec {
            command: "cli".into(),
            workspace_dir: "/tmp".into(),
            model: "sonnet".into(),
            stream,
            mode,
        }
    }

    fn argv(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn new_session_gets_session_id_and_full_system() {
        let cmd = build_command(&spec(
            SessionMode::New {
                uuid: "u-1".into(),
                system: Some("You are helpful.".into()),
            },
            true,
        ));
        let args = argv(&cmd);
        assert!(args.contains(&"--session-id".to_string()));
        assert!(args.contains(&"u-1".to_string()));
        assert!(args.contains(&"--system-prompt".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&"--include-partial-messages".to_string()));
        assert!(!args.contains(&"--resume".to_string()));
    }

    #[test]
    fn resume_gets_append_fragment_never_full_system() {
        let cmd = build_command(&spec(
            SessionMode::Resume {
                uuid: "u-1".into(),
                append_system: Some("```json\n{\"chat_id\":1}\n```".into()),
            },
            false,
        ));
        let args = argv(&cmd);
        assert!(args.contains(&"--resume".to_string()));
        assert!(args.contains(&"--append-system-prompt".to_string()));
        assert!(!args.contains(&"--system-prompt".to_string()));
        assert!(args.contains(&"json".to_string()));
        assert!(!args.contains(&"--include-partial-messages".to_string()));
    }

    #[test]
    fn api_key_is_scrubbed_from_child_env() {
        let cmd = build_command(&spec(
            SessionMode::New {
                uuid: "u".into(),
                system: None,
            },
            false,
        ));
        let removed: Vec<_> = cmd
            .as_std()
            .get_envs()
            .filter(|(k, v)| *k == "ANTHROPIC_API_KEY" && v.is_none())
            .collect();
        assert_eq!(removed.len(), 1);
    }

    #[test]
    fn idle_window_tracks_phase() {
        let t = TimeoutConfig::default();
        assert_eq!(idle_window(&t, Phase::Text), Duration::from_secs(60));
        assert_eq!(idle_window(&t, Phase::Tool), Duration::from_secs(300));
        assert_eq!(idle_window(&t, Phase::Compacting), Duration::from_secs(600));
    }
}

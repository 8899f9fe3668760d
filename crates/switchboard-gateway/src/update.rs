//! Detached self-update launch.
//!
//! The deploy webhook cannot rebuild the gateway in-process - the binary
//! replaces itself - so the actual work happens in a shell script spawned
//! with null stdio that outlives this process.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

/// Launch the update script as a detached child. When no script is
/// configured, a default one (git pull + cargo build + service restart) is
/// written to the temp dir and used.
pub fn launch_update(script: Option<&str>) -> Result<()> {
    let path = match script {
        Some(path) => PathBuf::from(path),
        None => write_default_script()?,
    };

    std::process::Command::new("sh")
        .arg(&path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("failed to spawn update script")?;

    info!(script = %path.display(), "update script spawned");
    Ok(())
}

/// Write the fallback update script. It re-execs the current binary after
/// pulling; systemd users should configure `deploy.update_script` instead.
fn write_default_script() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot determine current executable path")?;
    let exe_str = exe.to_string_lossy();

    let script = format!(
        "#!/bin/sh\nsleep 1\nsystemctl --user restart switchboard-gateway.service 2>/dev/null || \\\n  systemctl restart switchboard-gateway.service 2>/dev/null || \\\n  \"{}\" &\nrm -f \"$0\"\n",
        exe_str
    );

    let script_path =
        std::env::temp_dir().join(format!("switchboard-update-{}.sh", std::process::id()));
    std::fs::write(&script_path, &script)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&script_path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script_path, perms)?;
    }

    Ok(script_path)
}

//! External processes driven by a render run.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

/// Packages the renderer needs inside a dependency-managed project.
pub const RENDER_PACKAGES: [&str; 2] = ["rmarkdown", "knitr"];

const MAX_LOGGED_OUTPUT_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("`{program}` is not available: {source}")]
    NotFound {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` exited with code {exit_code:?}")]
    Exit {
        program: String,
        exit_code: Option<i32>,
    },
    #[error("`{program}` did not finish within {limit:?}")]
    Timeout { program: String, limit: Duration },
}

/// Renders an extracted project into an output directory.
#[async_trait]
pub trait RenderToolchain: Send + Sync {
    async fn render(&self, project: &Path, output: &Path) -> Result<(), ToolchainError>;
}

/// Installs what a project declares before it is rendered.
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    /// Restore the locked dependency set.
    async fn restore(&self, project: &Path) -> Result<(), ToolchainError>;

    /// Make sure [`RENDER_PACKAGES`] are installed.
    async fn install_render_packages(&self, project: &Path) -> Result<(), ToolchainError>;
}

/// The Quarto CLI.
#[derive(Debug, Clone)]
pub struct QuartoToolchain {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl QuartoToolchain {
    pub fn new(program: PathBuf, timeout: Option<Duration>) -> Self {
        Self { program, timeout }
    }

    fn command(&self, project: &Path, output: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("render")
            .arg(project)
            .args(["--to", "html"])
            .arg("--output-dir")
            .arg(output)
            .arg("--no-cache")
            .args(["-M", "author:", "-M", "date:", "-M", "title:"])
            .current_dir(project);
        command
    }
}

#[async_trait]
impl RenderToolchain for QuartoToolchain {
    async fn render(&self, project: &Path, output: &Path) -> Result<(), ToolchainError> {
        run_tool(self.command(project, output), &self.program, "render", self.timeout).await
    }
}

/// `Rscript` driving the renv dependency manager.
#[derive(Debug, Clone)]
pub struct RscriptInstaller {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl RscriptInstaller {
    pub fn new(program: PathBuf, timeout: Option<Duration>) -> Self {
        Self { program, timeout }
    }

    fn command(&self, project: &Path, expression: &str) -> Command {
        let mut command = Command::new(&self.program);
        command.arg("-e").arg(expression).current_dir(project);
        command
    }
}

#[async_trait]
impl DependencyInstaller for RscriptInstaller {
    async fn restore(&self, project: &Path) -> Result<(), ToolchainError> {
        let command = self.command(project, "renv::restore(prompt = FALSE)");
        run_tool(command, &self.program, "restore", self.timeout).await
    }

    async fn install_render_packages(&self, project: &Path) -> Result<(), ToolchainError> {
        let packages = RENDER_PACKAGES
            .iter()
            .map(|name| format!("'{name}'"))
            .collect::<Vec<_>>()
            .join(", ");
        let command = self.command(
            project,
            &format!("renv::install(c({packages}), prompt = FALSE)"),
        );
        run_tool(command, &self.program, "install", self.timeout).await
    }
}

/// Run a tool to completion, capturing its combined output for the logs only.
async fn run_tool(
    mut command: Command,
    program: &Path,
    op: &'static str,
    timeout: Option<Duration>,
) -> Result<(), ToolchainError> {
    let started_at = Instant::now();
    let program_name = program.display().to_string();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|err| {
        warn!(
            target = "application::render::toolchain",
            op,
            program = %program_name,
            result = "error",
            error_code = "spawn",
            error = %err,
            "Failed to spawn external tool"
        );
        if err.kind() == ErrorKind::NotFound {
            ToolchainError::NotFound {
                program: program_name.clone(),
                source: err,
            }
        } else {
            ToolchainError::Spawn {
                program: program_name.clone(),
                source: err,
            }
        }
    })?;

    // Dropping the wait future on timeout kills the child (`kill_on_drop`).
    let waited = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    target = "application::render::toolchain",
                    op,
                    program = %program_name,
                    result = "error",
                    error_code = "timeout",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "External tool timed out and was killed"
                );
                return Err(ToolchainError::Timeout {
                    program: program_name,
                    limit,
                });
            }
        },
        None => child.wait_with_output().await,
    };
    let output = waited.map_err(|source| ToolchainError::Spawn {
        program: program_name.clone(),
        source,
    })?;

    let elapsed_ms = started_at.elapsed().as_millis() as u64;
    metrics::histogram!("pressroom_toolchain_ms", "op" => op).record(elapsed_ms as f64);

    if !output.status.success() {
        let exit_code = output.status.code();
        let combined = combined_output(&output.stdout, &output.stderr);
        warn!(
            target = "application::render::toolchain",
            op,
            program = %program_name,
            result = "error",
            error_code = "exit_status",
            exit_code = exit_code.map(i64::from).unwrap_or(-1),
            elapsed_ms,
            output = %combined,
            "External tool exited unsuccessfully"
        );
        return Err(ToolchainError::Exit {
            program: program_name,
            exit_code,
        });
    }

    info!(
        target = "application::render::toolchain",
        op,
        program = %program_name,
        result = "ok",
        elapsed_ms,
        "External tool finished"
    );
    Ok(())
}

fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    if !stderr.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&String::from_utf8_lossy(stderr));
    }
    truncate_tail(combined, MAX_LOGGED_OUTPUT_BYTES)
}

/// Keep the last `limit` bytes; the end of a failed run holds the error.
fn truncate_tail(text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[truncated]…{}", &text[start..])
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt};
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\nset -eu\n{body}")).expect("write script");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("set perms");
        path
    }

    #[tokio::test]
    async fn quarto_receives_reproducible_render_flags() {
        let dir = TempDir::new().expect("temp dir");
        let args_log = dir.path().join("args.log");
        let fake = script(
            dir.path(),
            "fake-quarto",
            &format!(
                r#"echo "$@" > "{log}"
out=""
while [ "$#" -gt 0 ]; do
  case "$1" in
    --output-dir) shift; out="$1" ;;
  esac
  shift
done
mkdir -p "$out"
echo '<html></html>' > "$out/index.html"
"#,
                log = args_log.display()
            ),
        );
        let project = dir.path().join("project");
        let output = dir.path().join("render");
        fs::create_dir_all(&project).expect("project dir");

        QuartoToolchain::new(fake, None)
            .render(&project, &output)
            .await
            .expect("render");

        let args = fs::read_to_string(&args_log).expect("args");
        assert!(args.starts_with("render "));
        assert!(args.contains("--to html"));
        assert!(args.contains("--no-cache"));
        assert!(args.contains("-M author: -M date: -M title:"));
        assert!(output.join("index.html").exists());
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_without_output() {
        let dir = TempDir::new().expect("temp dir");
        let fake = script(dir.path(), "failing", "echo 'secret stack trace' >&2\nexit 3\n");

        let err = QuartoToolchain::new(fake, None)
            .render(dir.path(), &dir.path().join("out"))
            .await
            .expect_err("should fail");
        assert!(matches!(err, ToolchainError::Exit { exit_code: Some(3), .. }));
        assert!(!err.to_string().contains("secret stack trace"));
    }

    #[tokio::test]
    async fn slow_tools_are_killed_on_timeout() {
        let dir = TempDir::new().expect("temp dir");
        let fake = script(dir.path(), "slow", "sleep 5\n");

        let started = Instant::now();
        let err = QuartoToolchain::new(fake, Some(Duration::from_millis(100)))
            .render(dir.path(), &dir.path().join("out"))
            .await
            .expect_err("should time out");
        assert!(matches!(err, ToolchainError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let err = QuartoToolchain::new(PathBuf::from("/nonexistent/quarto"), None)
            .render(Path::new("/"), Path::new("/tmp/out"))
            .await
            .expect_err("missing");
        assert!(matches!(err, ToolchainError::NotFound { .. }));
    }

    #[tokio::test]
    async fn rscript_installs_render_packages() {
        let dir = TempDir::new().expect("temp dir");
        let args_log = dir.path().join("args.log");
        let fake = script(
            dir.path(),
            "fake-rscript",
            &format!("echo \"$@\" >> \"{}\"\n", args_log.display()),
        );

        let installer = RscriptInstaller::new(fake, None);
        installer.restore(dir.path()).await.expect("restore");
        installer
            .install_render_packages(dir.path())
            .await
            .expect("install");

        let log = fs::read_to_string(&args_log).expect("log");
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines[0], "-e renv::restore(prompt = FALSE)");
        assert_eq!(
            lines[1],
            "-e renv::install(c('rmarkdown', 'knitr'), prompt = FALSE)"
        );
    }

    #[test]
    fn truncation_keeps_the_tail() {
        let text = format!("{}END", "x".repeat(100));
        let truncated = truncate_tail(text, 10);
        assert!(truncated.ends_with("END"));
        assert!(truncated.starts_with("[truncated]"));
    }
}

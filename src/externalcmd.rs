//! External command pool
//!
//! Paths start helper processes (`runOnInit`, `runOnDemand`, `runOnPublish`,
//! `runOnRead`). The pool owns their lifecycle so shutdown can wait for every
//! child to terminate. Actual process spawning sits behind [`Launcher`] so
//! tests can substitute a recording fake.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Pause before restarting a command that exited.
const RESTART_PAUSE: Duration = Duration::from_secs(5);

/// Environment variable carrying the path name into helper commands.
pub const ENV_PATH: &str = "MEDIARELAY_PATH";

/// Spawns commands. The default implementation shells out; tests record.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(
        &self,
        cmdline: &str,
        env: &[(String, String)],
    ) -> io::Result<Box<dyn Running>>;
}

/// A running command instance.
#[async_trait]
pub trait Running: Send {
    /// Waits for the command to exit and returns its status code.
    async fn wait(&mut self) -> io::Result<i32>;
    async fn kill(&mut self);
}

/// Shell-based launcher (`sh -c <cmdline>`).
pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        cmdline: &str,
        env: &[(String, String)],
    ) -> io::Result<Box<dyn Running>> {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmdline)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true)
            .spawn()?;
        Ok(Box::new(Process(child)))
    }
}

struct Process(tokio::process::Child);

#[async_trait]
impl Running for Process {
    async fn wait(&mut self) -> io::Result<i32> {
        let status = self.0.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) {
        let _ = self.0.kill().await;
    }
}

/// Owns every helper command of the process.
#[derive(Clone)]
pub struct Pool {
    launcher: Arc<dyn Launcher>,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Pool {
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self {
            launcher,
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        }
    }

    /// Starts `cmdline` and keeps it running per `restart` until the returned
    /// handle (or the pool) is closed.
    pub fn start(&self, cmdline: &str, restart: bool, env: Vec<(String, String)>) -> Cmd {
        let token = self.token.child_token();
        let launcher = self.launcher.clone();
        let cmdline = cmdline.to_string();

        let task_token = token.clone();
        self.tracker.spawn(async move {
            run_command(launcher, &cmdline, restart, &env, task_token).await;
        });

        Cmd { token }
    }

    /// Stops every command and waits for the children to go away.
    pub async fn close(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn run_command(
    launcher: Arc<dyn Launcher>,
    cmdline: &str,
    restart: bool,
    env: &[(String, String)],
    token: CancellationToken,
) {
    loop {
        let mut child = match launcher.launch(cmdline, env).await {
            Ok(child) => {
                tracing::debug!(cmd = %cmdline, "external command started");
                child
            }
            Err(e) => {
                tracing::warn!(cmd = %cmdline, error = %e, "external command failed to start");
                if !restart {
                    return;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(RESTART_PAUSE) => continue,
                }
            }
        };

        tokio::select! {
            _ = token.cancelled() => {
                child.kill().await;
                return;
            }
            status = child.wait() => {
                match status {
                    Ok(code) => {
                        tracing::debug!(cmd = %cmdline, code, "external command exited")
                    }
                    Err(e) => tracing::warn!(cmd = %cmdline, error = %e, "external command wait failed"),
                }
                if !restart {
                    return;
                }
            }
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(RESTART_PAUSE) => {}
        }
    }
}

/// Handle to one running command; closing it kills the child.
pub struct Cmd {
    token: CancellationToken,
}

impl Cmd {
    pub fn close(&self) {
        self.token.cancel();
    }
}

impl Drop for Cmd {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("unable to run `{0}`: {1}")]
    SpawnError(String, std::io::Error),
    #[error("`{0}` did not complete within {1:?}")]
    TimeoutError(String, Duration),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_owned()
    }
}

/// Runs external programs. A non-zero exit is not an error at this level,
/// callers inspect [`CommandOutput::exit_code`].
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn exec(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError>;
}

pub struct TokioCommandExecutor {
    timeout: Duration,
}

impl TokioCommandExecutor {
    pub fn new(timeout: Duration) -> TokioCommandExecutor {
        TokioCommandExecutor { timeout }
    }
}

impl Default for TokioCommandExecutor {
    fn default() -> Self {
        TokioCommandExecutor::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait::async_trait]
impl CommandExecutor for TokioCommandExecutor {
    async fn exec(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        let command_line = format_command(program, args);
        debug!("executing {}", command_line);

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| CommandError::TimeoutError(command_line.clone(), self.timeout))?
            .map_err(|err| CommandError::SpawnError(command_line, err))?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

pub fn format_command(program: &str, args: &[&str]) -> String {
    let mut line = program.to_owned();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

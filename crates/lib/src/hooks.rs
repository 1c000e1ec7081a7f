//! External filter and escape commands.
//!
//! Sites customize provisioning with small local programs: a *filter* decides
//! whether a row should be processed, an *escape* performs some extra action.
//! Both are invoked the same way: the row's columns are exported as
//! environment variables and the operation name is appended as the last
//! argument. Exit status 0 means "go ahead".

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ConfigError;

/// Default prefix for exported column variables.
pub const ENV_PREFIX: &str = "AGENT_";

/// Result of running a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookVerdict {
    Proceed,
    /// Nonzero exit status, or -1 if the hook could not be run.
    Skip(i32),
}

impl HookVerdict {
    pub fn proceeds(self) -> bool {
        self == HookVerdict::Proceed
    }
}

/// A validated hook command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterHook {
    program: PathBuf,
    args: Vec<String>,
    prefix: String,
}

impl FilterHook {
    /// Parse a whitespace-separated command line and check that its program
    /// is an existing executable file.
    pub fn parse(command: &str) -> Result<Self, ConfigError> {
        let mut words = command.split_whitespace();
        let Some(program) = words.next() else {
            return Err(ConfigError::Hook {
                command: command.to_string(),
                reason: "empty command".to_string(),
            });
        };
        let program = PathBuf::from(program);
        check_executable(&program).map_err(|reason| ConfigError::Hook {
            command: command.to_string(),
            reason,
        })?;
        Ok(Self {
            program,
            args: words.map(str::to_string).collect(),
            prefix: ENV_PREFIX.to_string(),
        })
    }

    /// Use `prefix` instead of [`ENV_PREFIX`] for exported variables.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run the hook for `operation` with `vars` exported.
    ///
    /// Variable names are upper-cased and prefixed; `None` values export as
    /// empty strings.
    pub async fn run<'a, I>(&self, operation: &str, vars: I) -> HookVerdict
    where
        I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
    {
        let envs: Vec<(String, String)> = vars
            .into_iter()
            .map(|(name, value)| {
                (
                    format!("{}{}", self.prefix, name.to_ascii_uppercase()),
                    value.unwrap_or_default().to_string(),
                )
            })
            .collect();

        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(operation)
            .envs(envs)
            .stdin(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => {
                debug!(hook = %self.program.display(), operation, "Hook passed");
                HookVerdict::Proceed
            }
            Ok(status) => {
                let code = status.code().unwrap_or(-1);
                debug!(hook = %self.program.display(), operation, code, "Hook declined");
                HookVerdict::Skip(code)
            }
            Err(e) => {
                warn!(hook = %self.program.display(), operation, "Failed running hook: {e}");
                HookVerdict::Skip(-1)
            }
        }
    }
}

/// Run `hook` if configured; an absent hook always proceeds.
pub async fn run_optional<'a, I>(hook: Option<&FilterHook>, operation: &str, vars: I) -> HookVerdict
where
    I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
{
    match hook {
        Some(hook) => hook.run(operation, vars).await,
        None => HookVerdict::Proceed,
    }
}

fn check_executable(path: &Path) -> Result<(), String> {
    let metadata =
        std::fs::metadata(path).map_err(|e| format!("{}: {e}", path.display()))?;
    if !metadata.is_file() {
        return Err(format!("{} is not a file", path.display()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(format!("{} is not executable", path.display()));
        }
    }
    Ok(())
}

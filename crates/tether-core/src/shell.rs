//! Shell command construction for the AI tool.
//!
//! The tool is either executed directly or wrapped in the user's login
//! shell so it picks up the PATH and environment an interactive session
//! would have (node version managers, Homebrew, etc.).
//!
//! # Example
//!
//! ```ignore
//! use tether_core::shell::{build_tool_command, ShellMode};
//!
//! let cmd = build_tool_command(
//!     "claude",
//!     &["-p".to_string(), "add a README".to_string()],
//!     Some(Path::new("/srv/tether/acme/widgets")),
//!     &ShellMode::Login { prefix: None },
//! )?;
//! ```

use std::path::Path;
use std::process::Command;

/// How the tool binary is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellMode {
    /// Execute the binary directly.
    Direct,
    /// Wrap in a shell. `prefix` overrides the default `$SHELL -l -c`.
    Login { prefix: Option<String> },
}

impl Default for ShellMode {
    fn default() -> Self {
        ShellMode::Login { prefix: None }
    }
}

/// Prepend the binary's parent directory to PATH so sibling tools (node) are found.
pub fn prepare_path_env(cmd: &mut Command, binary_path: &str) {
    if !binary_path.contains('/') {
        return;
    }
    let Some(dir) = Path::new(binary_path).parent().and_then(|d| d.to_str()) else {
        return;
    };
    let existing = std::env::var("PATH").unwrap_or_default();
    let combined = if existing.is_empty() {
        dir.to_string()
    } else {
        format!("{}:{}", dir, existing)
    };
    cmd.env("PATH", combined);
}

/// Build the command that runs `binary_path` with `args`.
///
/// In [`ShellMode::Login`] the final command is `<prefix> '<quoted command>'`
/// with every argument shell-quoted.
pub fn build_tool_command(
    binary_path: &str,
    args: &[String],
    working_dir: Option<&Path>,
    mode: &ShellMode,
) -> Result<Command, String> {
    let mut cmd = match mode {
        ShellMode::Direct => {
            let mut cmd = Command::new(binary_path);
            cmd.args(args);
            cmd
        }
        ShellMode::Login { prefix } => login_shell_command(binary_path, args, prefix.as_deref())?,
    };

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    prepare_path_env(&mut cmd, binary_path);

    Ok(cmd)
}

#[cfg(unix)]
fn login_shell_command(
    binary_path: &str,
    args: &[String],
    prefix: Option<&str>,
) -> Result<Command, String> {
    let prefix = get_shell_prefix(prefix);

    let prefix_parts: Vec<&str> = prefix.split_whitespace().collect();
    let Some((shell_program, shell_args)) = prefix_parts.split_first() else {
        return Err("Empty shell prefix".to_string());
    };

    let mut command_parts = Vec::with_capacity(args.len() + 1);
    command_parts.push(
        shlex::try_quote(binary_path)
            .map_err(|_| format!("Invalid path: {}", binary_path))?
            .into_owned(),
    );
    for arg in args {
        command_parts.push(
            shlex::try_quote(arg)
                .map_err(|_| "Invalid argument: contains a NUL byte".to_string())?
                .into_owned(),
        );
    }

    let mut cmd = Command::new(shell_program);
    cmd.args(shell_args).arg(command_parts.join(" "));
    Ok(cmd)
}

/// Windows has no login shell; run the binary directly.
#[cfg(windows)]
fn login_shell_command(
    binary_path: &str,
    args: &[String],
    _prefix: Option<&str>,
) -> Result<Command, String> {
    let mut cmd = Command::new(binary_path);
    cmd.args(args);
    Ok(cmd)
}

/// Shell prefix for [`ShellMode::Login`].
///
/// A non-empty custom prefix is used as-is. Otherwise `$SHELL -l -c`,
/// falling back to bash/sh for shells without POSIX `-l -c` semantics.
#[cfg(unix)]
fn get_shell_prefix(custom_prefix: Option<&str>) -> String {
    if let Some(prefix) = custom_prefix.filter(|p| !p.is_empty()) {
        return prefix.to_string();
    }

    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let shell_name = Path::new(&shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    let non_posix = ["fish", "nu", "nushell", "elvish", "xonsh", "ion"];

    let effective_shell = if non_posix.contains(&shell_name) {
        if Path::new("/bin/bash").exists() {
            "/bin/bash"
        } else {
            "/bin/sh"
        }
    } else {
        &shell
    };

    format!("{} -l -c", effective_shell)
}

// ============================================================================
// TESTS
// ============================================================================

//! Command whitelist for transparent SSH sessions.
//!
//! The daemon terminates the SSH protocol only to decide whether a request
//! may pass. The rules are deliberately narrow: scp in source or sink mode
//! with a known flag set, the three git-over-ssh commands, and the sftp
//! subsystem. Everything else is rejected with a reason the operator sees.

/// scp flags we pass through. Anything else rejects the command.
const SCP_ALLOWED_FLAGS: &[&str] = &["-t", "-f", "-r", "-p", "-d", "-v", "-q"];

/// git-over-ssh server commands.
const GIT_COMMANDS: &[&str] = &["git-receive-pack", "git-upload-pack", "git-upload-archive"];

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovedCommand {
    /// `exec` with an approved scp invocation.
    Scp { command: String },
    /// `exec` with a git-over-ssh server command.
    Git { command: String },
    /// `subsystem sftp`.
    Sftp,
}

impl ApprovedCommand {
    /// The command line to run on the agent side.
    pub fn command_line(&self) -> &str {
        match self {
            ApprovedCommand::Scp { command } | ApprovedCommand::Git { command } => command,
            ApprovedCommand::Sftp => "sftp-server",
        }
    }
}

/// Validate an `exec` request payload.
pub fn validate_command(command: &str) -> Result<ApprovedCommand, String> {
    let trimmed = command.trim();
    let mut parts = trimmed.split_whitespace();
    let Some(program) = parts.next() else {
        return Err("unauthorized command ''".to_string());
    };

    if program == "scp" {
        let mut saw_mode = false;
        for part in parts.clone() {
            if part.starts_with('-') {
                if !SCP_ALLOWED_FLAGS.contains(&part) {
                    return Err(format!("unauthorized scp flag '{}'", part));
                }
                if part == "-t" || part == "-f" {
                    saw_mode = true;
                }
            }
        }
        if !saw_mode {
            return Err("scp without -t or -f".to_string());
        }
        return Ok(ApprovedCommand::Scp {
            command: trimmed.to_string(),
        });
    }

    if GIT_COMMANDS.contains(&program) {
        return Ok(ApprovedCommand::Git {
            command: trimmed.to_string(),
        });
    }

    Err(format!("unauthorized command '{}'", trimmed))
}

/// Validate a `subsystem` request name.
pub fn validate_subsystem(name: &str) -> Result<ApprovedCommand, String> {
    if name == "sftp" {
        Ok(ApprovedCommand::Sftp)
    } else {
        Err(format!("unauthorized subsystem '{}'", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scp_sink_and_source_pass() {
        assert!(matches!(
            validate_command("scp -t /tmp/upload"),
            Ok(ApprovedCommand::Scp { .. })
        ));
        assert!(matches!(
            validate_command("scp -f /etc/hostname"),
            Ok(ApprovedCommand::Scp { .. })
        ));
        assert!(matches!(
            validate_command("scp -r -p -t /srv/data"),
            Ok(ApprovedCommand::Scp { .. })
        ));
    }

    #[test]
    fn test_scp_with_unknown_flag_rejected() {
        assert!(validate_command("scp -o ProxyCommand=evil -t /tmp").is_err());
        assert!(validate_command("scp /tmp/file").is_err());
    }

    #[test]
    fn test_git_commands_pass() {
        for command in ["git-receive-pack 'repo.git'", "git-upload-pack repo", "git-upload-archive repo"] {
            assert!(matches!(validate_command(command), Ok(ApprovedCommand::Git { .. })));
        }
    }

    #[test]
    fn test_shell_like_commands_rejected_with_reason() {
        let err = validate_command("shellfake").unwrap_err();
        assert_eq!(err, "unauthorized command 'shellfake'");
        assert!(validate_command("bash -i").is_err());
        assert!(validate_command("").is_err());
    }

    #[test]
    fn test_subsystem_only_sftp() {
        assert_eq!(validate_subsystem("sftp"), Ok(ApprovedCommand::Sftp));
        assert!(validate_subsystem("netconf").is_err());
    }
}

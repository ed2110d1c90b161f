//! Human-readable command transcripts.
//!
//! Every command is preceded in the build log by the lines a person would
//! type to reproduce it: `cd`, `export` and `exec`.

use builder_core::ProcessState;
use builder_core::executor::{CommandSpec, StopMode};

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '/' | '.' | '@' | ':' | '-')
}

/// Quote `arg` for a POSIX shell when it contains anything outside
/// `[A-Za-z0-9_=+/.@:-]`.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(is_safe) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r#"'"'"'"#))
}

/// Transcript header written before the command starts.
pub fn header(spec: &CommandSpec) -> String {
    let mut out = String::new();
    out.push_str(&format!("cd {}\n", shell_quote(&spec.working_dir.to_string_lossy())));
    for (key, value) in &spec.env {
        out.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }
    let argv: Vec<String> = spec.argv().into_iter().map(shell_quote).collect();
    out.push_str(&format!("exec {}\n\n", argv.join(" ")));
    out
}

pub fn success_trailer() -> &'static str {
    "\nSuccess\n\n"
}

pub fn failure_trailer(reason: &str) -> String {
    format!("\nFailed: {}\n\n", reason)
}

pub fn cancelled_trailer(mode: StopMode, state: Option<&ProcessState>) -> String {
    let action = match mode {
        StopMode::Kill => "killed",
        StopMode::Terminate => "terminated",
    };
    match state {
        Some(state) => format!("\nCancelled, command {} ({})\n\n", action, state),
        None => format!("\nCancelled, command {}\n\n", action),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_args_are_bare() {
        assert_eq!(shell_quote("git@github.com:org/repo.git"), "git@github.com:org/repo.git");
        assert_eq!(shell_quote("--depth"), "--depth");
        assert_eq!(shell_quote("a=b+c/d.e"), "a=b+c/d.e");
    }

    #[test]
    fn test_unsafe_args_are_quoted() {
        assert_eq!(shell_quote("hello world"), "'hello world'");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_header_layout() {
        let spec = CommandSpec::new("git", "/tmp/build")
            .args(["clone", "--depth", "1", "https://h/r.git", "/tmp/build/workspace/r"])
            .env("HOME", "/tmp/build")
            .env("GIT_SSH_COMMAND", "ssh -o StrictHostKeyChecking=no");

        let header = header(&spec);
        let lines: Vec<&str> = header.lines().collect();
        assert_eq!(lines[0], "cd /tmp/build");
        assert_eq!(lines[1], "export GIT_SSH_COMMAND='ssh -o StrictHostKeyChecking=no'");
        assert_eq!(lines[2], "export HOME=/tmp/build");
        assert_eq!(
            lines[3],
            "exec git clone --depth 1 https://h/r.git /tmp/build/workspace/r"
        );
        assert!(header.ends_with("\n\n"));
    }

    #[test]
    fn test_trailers() {
        assert_eq!(failure_trailer("exit status: 1"), "\nFailed: exit status: 1\n\n");
        assert!(cancelled_trailer(StopMode::Terminate, None).contains("terminated"));
        assert!(cancelled_trailer(StopMode::Kill, None).contains("killed"));
    }
}

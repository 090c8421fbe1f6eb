//! The three command runners named in spec.md §4.7. Each wraps
//! `std::process::Command` -- the teacher's own `services.rs`-style direct
//! use, not a process-spawning crate.
use std::process::{Command, Stdio};

use crate::error::Error;

/// One configured command, tagged by which runner executes it.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "runner", rename_all = "kebab-case")]
pub enum CommandSpec {
    /// Forks `program` directly with `args`, no shell involved.
    Exec { program: String, args: Vec<String> },
    /// A single command line, whitespace-split into `program`/`args`.
    Memtier { line: String },
    /// A full prompt line handed to `sh -c`, allowing pipes and redirects.
    MemtierPrompt { line: String },
}

impl CommandSpec {
    pub fn run(&self) -> Result<(), Error> {
        match self {
            CommandSpec::Exec { program, args } => spawn(Command::new(program).args(args)),
            CommandSpec::Memtier { line } => {
                let mut tokens = line.split_whitespace();
                let program = tokens.next().ok_or_else(|| Error::Config { reason: "empty memtier command line".to_string() })?;
                spawn(Command::new(program).args(tokens))
            }
            CommandSpec::MemtierPrompt { line } => spawn(Command::new("sh").arg("-c").arg(line)),
        }
    }
}

fn spawn(cmd: &mut Command) -> Result<(), Error> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_child| ())
        .map_err(|source| Error::IO {
            source,
            #[cfg(feature = "nightly")]
            backtrace: std::backtrace::Backtrace::capture(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_runs_true() {
        let spec = CommandSpec::Exec { program: "true".to_string(), args: vec![] };
        assert!(spec.run().is_ok());
    }

    #[test]
    fn memtier_splits_command_line() {
        let spec = CommandSpec::Memtier { line: "true --ignored".to_string() };
        assert!(spec.run().is_ok());
    }

    #[test]
    fn memtier_prompt_allows_pipes() {
        let spec = CommandSpec::MemtierPrompt { line: "true | true".to_string() };
        assert!(spec.run().is_ok());
    }

    #[test]
    fn memtier_rejects_empty_line() {
        let spec = CommandSpec::Memtier { line: "   ".to_string() };
        assert!(spec.run().is_err());
    }
}

//! Transformation step as an external command (`dbt run` and friends).

use super::{CollaboratorError, Transformer};
use std::path::PathBuf;
use std::process::Command;
use tracing::{info, warn};

/// Trailing stderr kept in the error.
const STDERR_TAIL: usize = 2000;

#[derive(Debug, Clone)]
pub struct CommandTransformer {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandTransformer {
    pub fn new(program: impl Into<String>, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir,
        }
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(|a| a.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn tail(text: &str, max: usize) -> &str {
    let text = text.trim_end();
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

impl Transformer for CommandTransformer {
    fn name(&self) -> &str {
        &self.program
    }

    fn run(&self) -> Result<(), CollaboratorError> {
        info!(command = %self.command_line(), dir = ?self.working_dir, "running transformation");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().map_err(|source| CollaboratorError::Launch {
            program: self.program.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            info!(target: "marketpulse::transform", "{line}");
        }
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            warn!(target: "marketpulse::transform", "{line}");
        }

        if !output.status.success() {
            return Err(CollaboratorError::NonZeroExit {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: tail(&stderr, STDERR_TAIL).to_string(),
            });
        }
        Ok(())
    }
}

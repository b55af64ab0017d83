//! Request scripts for the ext filesystem shell (`debugfs`) and parsing of its replies.

use crate::error::Result;
use crate::tools::{Tool, ToolPaths};
use std::path::Path;

/// Quote one argument for the debugfs command parser. A literal `"` is written as `""`.
pub fn quote(arg: &str) -> String {
    format!("\"{}\"", arg.replace('"', "\"\""))
}

/// A multi-line debugfs request, fed on stdin
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Script {
    lines: Vec<String>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    fn request(mut self, command: &str, args: &[&str]) -> Self {
        let mut line = command.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(&quote(arg));
        }
        self.lines.push(line);
        self
    }

    pub fn cd(self, dir: &str) -> Self {
        self.request("cd", &[dir])
    }

    /// Copy local file `local` into the current directory as `name`
    pub fn write(self, local: &str, name: &str) -> Self {
        self.request("write", &[local, name])
    }

    /// Dump a single file to a local path
    pub fn dump(self, path: &str, local: &str) -> Self {
        self.request("dump", &[path, local])
    }

    /// Dump a directory tree into a local directory
    pub fn rdump(self, path: &str, local: &str) -> Self {
        self.request("rdump", &[path, local])
    }

    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

/// Run a single request against `image`
pub fn request(
    tools: &ToolPaths,
    image: &Path,
    writable: bool,
    command: &str,
    path: &str,
) -> Result<String> {
    let mut cmd = tools.command(Tool::Debugfs)?;
    if writable {
        cmd = cmd.arg("-w");
    }
    cmd.arg("-R")
        .arg(format!("{} {}", command, quote(path)))
        .arg_path(image)
        .run()
}

/// Run a script against `image`
pub fn run_script(
    tools: &ToolPaths,
    image: &Path,
    writable: bool,
    script: &Script,
) -> Result<String> {
    let mut cmd = tools.command(Tool::Debugfs)?;
    if writable {
        cmd = cmd.arg("-w");
    }
    cmd.args(["-f", "-"]).arg_path(image).stdin(script.render()).run()
}

/// Error lines printed by any of `commands`.
///
/// debugfs exits 0 even when a request fails; failures only show up as
/// `<command>: <message>` lines in its output.
pub fn command_errors<'a>(output: &'a str, commands: &[&str]) -> Vec<&'a str> {
    output
        .lines()
        .map(str::trim_start)
        .filter(|line| {
            commands
                .iter()
                .any(|cmd| line.strip_prefix(cmd).is_some_and(|rest| rest.starts_with(':')))
        })
        .collect()
}

/// True if `path` names an existing directory in `image`
pub fn is_directory(tools: &ToolPaths, image: &Path, path: &str) -> Result<bool> {
    let out = request(tools, image, false, "cd", path)?;
    Ok(command_errors(&out, &["cd"]).is_empty())
}

/// Entry names from `ls -l` output.
///
/// Each entry line ends with `<date> <HH:MM> <name>`; the name is whatever
/// follows the time, so names containing spaces or colons survive.
pub fn parse_listing(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with("debugfs "))
        .filter_map(|line| {
            let (_, after_hour) = line.split_once(':')?;
            let (_, name) = after_hour.split_once(' ')?;
            Some(name.to_string())
        })
        .collect()
}

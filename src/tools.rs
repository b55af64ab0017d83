//! External program resolution and invocation.
//!
//! Every filesystem or partition-table mutation is delegated to a host
//! program. Their paths are resolved once into a [`ToolPaths`] table and
//! invoked through [`Invocation`], which captures output and turns a nonzero
//! exit into [`Error::ToolFailed`].

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Directories searched after `$PATH`, and under the native sysroot
const FALLBACK_DIRS: &[&str] = &["/bin", "/usr/bin", "/usr/sbin", "/sbin"];

/// Host programs the engine delegates to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tool {
    Parted,
    Sfdisk,
    Mdir,
    Mcopy,
    Mdel,
    Mdeltree,
    Debugfs,
    E2fsck,
    Resize2fs,
    Mkswap,
    Mkdosfs,
    Blkid,
}

impl Tool {
    pub const ALL: [Tool; 12] = [
        Tool::Parted,
        Tool::Sfdisk,
        Tool::Mdir,
        Tool::Mcopy,
        Tool::Mdel,
        Tool::Mdeltree,
        Tool::Debugfs,
        Tool::E2fsck,
        Tool::Resize2fs,
        Tool::Mkswap,
        Tool::Mkdosfs,
        Tool::Blkid,
    ];

    /// Executable name looked up on the search path
    pub fn name(self) -> &'static str {
        match self {
            Tool::Parted => "parted",
            Tool::Sfdisk => "sfdisk",
            Tool::Mdir => "mdir",
            Tool::Mcopy => "mcopy",
            Tool::Mdel => "mdel",
            Tool::Mdeltree => "mdeltree",
            Tool::Debugfs => "debugfs",
            Tool::E2fsck => "e2fsck",
            Tool::Resize2fs => "resize2fs",
            Tool::Mkswap => "mkswap",
            Tool::Mkdosfs => "mkdosfs",
            Tool::Blkid => "blkid",
        }
    }

    /// Package that usually provides the executable
    pub fn package(self) -> &'static str {
        match self {
            Tool::Parted => "parted",
            Tool::Sfdisk | Tool::Mkswap | Tool::Blkid => "util-linux",
            Tool::Mdir | Tool::Mcopy | Tool::Mdel | Tool::Mdeltree => "mtools",
            Tool::Debugfs | Tool::E2fsck | Tool::Resize2fs => "e2fsprogs",
            Tool::Mkdosfs => "dosfstools",
        }
    }

    fn not_found(self) -> Error {
        Error::ToolNotFound {
            tool: self.name().to_string(),
            hint: format!(
                "Please install '{}' or point --native-sysroot at a sysroot that has it.",
                self.package()
            ),
        }
    }
}

/// Settings that shape how the engine finds and drives its tools
#[derive(Debug, Clone, Default)]
pub struct ToolConfig {
    /// Sysroot whose bin/sbin directories are searched before `$PATH`
    pub native_sysroot: Option<PathBuf>,
    /// Sector size forced onto the table reader
    pub sector_size: Option<u32>,
    /// Directory for staging copies and scratch images
    pub staging_dir: Option<PathBuf>,
}

impl ToolConfig {
    /// Build the colon-separated search path used for every lookup
    pub fn search_path(&self) -> OsString {
        let mut dirs: Vec<PathBuf> = Vec::new();

        if let Some(sysroot) = &self.native_sysroot {
            for dir in FALLBACK_DIRS {
                dirs.push(sysroot.join(dir.trim_start_matches('/')));
            }
        }
        if let Some(path) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&path));
        }
        dirs.extend(FALLBACK_DIRS.iter().map(PathBuf::from));

        std::env::join_paths(dirs).unwrap_or_default()
    }
}

/// Resolved absolute path of every known tool
#[derive(Debug, Clone)]
pub struct ToolPaths {
    found: BTreeMap<Tool, PathBuf>,
}

impl ToolPaths {
    /// Look up every tool once. Missing tools are only an error when asked for.
    pub fn resolve(config: &ToolConfig) -> Self {
        let search_path = config.search_path();
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));

        let mut found = BTreeMap::new();
        for tool in Tool::ALL {
            match which::which_in(tool.name(), Some(&search_path), &cwd) {
                Ok(path) => {
                    debug!("Found {} at {:?}", tool.name(), path);
                    found.insert(tool, path);
                }
                Err(_) => debug!("{} not found on search path", tool.name()),
            }
        }

        Self { found }
    }

    /// Build a table from explicit paths
    pub fn from_paths(paths: impl IntoIterator<Item = (Tool, PathBuf)>) -> Self {
        Self {
            found: paths.into_iter().collect(),
        }
    }

    pub fn get(&self, tool: Tool) -> Result<&Path> {
        self.found
            .get(&tool)
            .map(PathBuf::as_path)
            .ok_or_else(|| tool.not_found())
    }

    /// Fail unless every listed tool was found
    pub fn require(&self, tools: &[Tool]) -> Result<()> {
        for tool in tools {
            self.get(*tool)?;
        }
        Ok(())
    }

    /// Start building an invocation of `tool`
    pub fn command(&self, tool: Tool) -> Result<Invocation> {
        Ok(Invocation::new(self.get(tool)?))
    }
}

/// A single external program run with captured, combined output
#[derive(Debug)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
    stdin: Option<String>,
    allow_fail: bool,
    ok_codes: &'static [i32],
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stdin: None,
            allow_fail: false,
            ok_codes: &[0],
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_owned());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Feed a control script on stdin
    pub fn stdin(mut self, script: impl Into<String>) -> Self {
        self.stdin = Some(script.into());
        self
    }

    /// Return the output even when the program exits nonzero
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Treat these exit codes as success
    pub fn ok_codes(mut self, codes: &'static [i32]) -> Self {
        self.ok_codes = codes;
        self
    }

    /// Printable form of the command line, for logs and errors
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    /// Run to completion and return stdout followed by stderr, trimmed
    pub fn run(self) -> Result<String> {
        let command_line = self.display();
        debug!("exec: {}", command_line);

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ToolNotFound {
                    tool: self.program.display().to_string(),
                    hint: "Cannot run command, lost dependency?".to_string(),
                }
            } else {
                Error::Io(e)
            }
        })?;

        if let Some(script) = &self.stdin {
            debug!("stdin for {}:\n{}", command_line, script);
            if let Some(mut pipe) = child.stdin.take() {
                // a program that exits early still owes us its output and status
                match pipe.write_all(script.as_bytes()) {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e.into()),
                    _ => {}
                }
            }
        }

        let output = child.wait_with_output()?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim().to_string();

        let status = output.status.code().unwrap_or(-1);
        debug!("output for {} (rc = {}): {}", command_line, status, combined);

        let accepted = output
            .status
            .code()
            .is_some_and(|code| self.ok_codes.contains(&code));
        if !accepted && !self.allow_fail {
            return Err(Error::ToolFailed {
                command: command_line,
                status,
                output: combined,
            });
        }

        Ok(combined)
    }
}

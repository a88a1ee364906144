use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn {command}: {source}")]
    SpawnCommand {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("working directory does not exist: {0}")]
    InvalidCwd(PathBuf),
}

/// What to run inside a new pseudo-terminal.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub shell: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub rows: u16,
    pub cols: u16,
}

impl SpawnConfig {
    /// `$SHELL`, or `/bin/sh` when unset.
    pub fn default_shell() -> String {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }

    /// Command line as shown to clients.
    pub fn display(&self) -> String {
        std::iter::once(self.shell.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn build_command(&self) -> Result<CommandBuilder, PtyError> {
        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.args(&self.args);
        match &self.cwd {
            Some(dir) if !dir.is_dir() => return Err(PtyError::InvalidCwd(dir.clone())),
            Some(dir) => cmd.cwd(dir),
            None => {
                if let Some(home) = dirs::home_dir() {
                    cmd.cwd(home);
                }
            }
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("TERMBRIDGE", "1");
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        Ok(cmd)
    }
}

pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    child: Option<Box<dyn Child + Send + Sync>>,
}

impl Pty {
    pub fn spawn(config: &SpawnConfig) -> Result<Self, PtyError> {
        let cmd = config.build_command()?;
        let pair = native_pty_system()
            .openpty(size(config.rows, config.cols))
            .map_err(PtyError::OpenPty)?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|source| PtyError::SpawnCommand {
                command: config.shell.clone(),
                source,
            })?;

        // Our copy of the slave must go, or the reader never sees EOF.
        drop(pair.slave);

        Ok(Self {
            master: pair.master,
            child: Some(child),
        })
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master.try_clone_reader().map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.master.take_writer().map_err(PtyError::TakeWriter)
    }

    /// Hand the child handle to whoever waits for its exit. Returns `None`
    /// on the second call.
    pub fn take_child(&mut self) -> Option<Box<dyn Child + Send + Sync>> {
        self.child.take()
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(size(rows, cols))
            .map_err(PtyError::Resize)
    }
}

fn size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

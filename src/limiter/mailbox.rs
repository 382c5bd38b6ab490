//! On-disk mailbox shared by the parent and the spawned child
//!
//! One directory per invocation holding `config`, `input`, `output`,
//! `error`, `stdout` and `stderr`. The directory is removed when the
//! [`Mailbox`] is dropped.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::traceback::TracebackSurrogate;
use crate::error::{Result, RunnerError};
use crate::logging::ExecutionContext;

pub const CONFIG_FILE: &str = "config";
pub const INPUT_FILE: &str = "input";
pub const OUTPUT_FILE: &str = "output";
pub const ERROR_FILE: &str = "error";
pub const STDOUT_FILE: &str = "stdout";
pub const STDERR_FILE: &str = "stderr";
pub const CHILD_LOG_FILE: &str = "child.log";

/// Prefix of every mailbox directory name
pub const DIR_PREFIX: &str = "kolosal-run-";

/// Contents of the `input` file
pub type InputEnvelope = (String, Vec<u8>);

/// Contents of the `error` file
pub type ErrorEnvelope = Option<(RunnerError, Option<TracebackSurrogate>)>;

/// Parent-side handle on a mailbox directory
#[derive(Debug)]
pub struct Mailbox {
    dir: PathBuf,
}

impl Mailbox {
    /// Create `<working_dir>/kolosal-run-<uuid>`, falling back to the system
    /// temp dir when the working dir cannot hold it
    pub fn create(working_dir: &Path) -> Result<Self> {
        let name = format!("{}{}", DIR_PREFIX, Uuid::new_v4());
        let preferred = working_dir.join(&name);
        let dir = match fs::create_dir_all(&preferred) {
            Ok(()) => preferred,
            Err(e) => {
                warn!(
                    working_dir = %working_dir.display(),
                    error = %e,
                    "Cannot create mailbox in working dir, using temp dir"
                );
                let fallback = std::env::temp_dir().join(&name);
                fs::create_dir_all(&fallback)?;
                fallback
            }
        };
        debug!(dir = %dir.display(), "Created mailbox");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    pub fn write_config(&self, context: &ExecutionContext) -> Result<()> {
        fs::write(self.path(CONFIG_FILE), context.to_json()?)?;
        Ok(())
    }

    pub fn write_input<I: Serialize>(&self, task_name: &str, input: &I) -> Result<()> {
        let envelope: InputEnvelope = (task_name.to_string(), bincode::serialize(input)?);
        write_bincode(&self.path(INPUT_FILE), &envelope)
    }

    /// Value written by the child; absent or empty means no value
    pub fn read_output<O: DeserializeOwned>(&self) -> Result<Option<O>> {
        let path = self.path(OUTPUT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes: Option<Vec<u8>> = read_bincode(&path)?;
        bytes.map(|b| bincode::deserialize(&b).map_err(RunnerError::from)).transpose()
    }

    pub fn read_error(&self) -> Result<ErrorEnvelope> {
        let path = self.path(ERROR_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_bincode(&path)
    }

    /// Captured child stderr, empty when unreadable
    pub fn stderr_text(&self) -> String {
        fs::read_to_string(self.path(STDERR_FILE)).unwrap_or_default()
    }

    /// Child log lines, when the child logged into this mailbox
    pub fn child_log_lines(&self) -> Vec<String> {
        fs::read_to_string(self.path(CHILD_LOG_FILE))
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "Failed to remove mailbox directory");
        }
    }
}

pub(crate) fn write_bincode<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, bincode::serialize(value)?)?;
    Ok(())
}

pub(crate) fn read_bincode<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    Ok(bincode::deserialize(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_and_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = {
            let mailbox = Mailbox::create(tmp.path()).unwrap();
            mailbox.write_config(&ExecutionContext::default()).unwrap();
            mailbox.write_input("echo", &vec![1u8, 2, 3]).unwrap();
            assert!(mailbox.path(CONFIG_FILE).exists());
            assert!(mailbox.dir().file_name().unwrap().to_string_lossy().starts_with(DIR_PREFIX));

            let (name, payload): InputEnvelope = read_bincode(&mailbox.path(INPUT_FILE)).unwrap();
            assert_eq!(name, "echo");
            assert_eq!(bincode::deserialize::<Vec<u8>>(&payload).unwrap(), vec![1, 2, 3]);
            mailbox.dir().to_path_buf()
        };
        assert!(!dir.exists());
    }

    #[test]
    fn test_missing_output_and_error_read_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::create(tmp.path()).unwrap();
        assert!(mailbox.read_output::<u32>().unwrap().is_none());
        assert!(mailbox.read_error().unwrap().is_none());
        assert_eq!(mailbox.stderr_text(), "");
        assert!(mailbox.child_log_lines().is_empty());
    }

    #[test]
    fn test_child_log_lives_in_mailbox() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mailbox = Mailbox::create(tmp.path()).unwrap();
            fs::write(mailbox.path(CHILD_LOG_FILE), "first\nsecond\n").unwrap();
            assert_eq!(mailbox.child_log_lines(), vec!["first", "second"]);
        }
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_falls_back_to_temp_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let mailbox = Mailbox::create(&blocker).unwrap();
        assert!(mailbox.dir().starts_with(std::env::temp_dir()));
    }
}

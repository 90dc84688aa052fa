//! Write-back of field edits to image files through the `exiftool` CLI.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::FieldEdit;

/// Suffix exiftool appends to the temporary file it writes before swapping it
/// over the original.
pub const TEMP_SUFFIX: &str = "_exiftool_tmp";

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("exiftool not found at {0}")]
    ToolNotFound(PathBuf),

    #[error("target file does not exist: {0}")]
    MissingTarget(PathBuf),

    #[error("exiftool exited with {status}: {stderr}")]
    ToolFailed { status: String, stderr: String },

    #[error("exiftool timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Applies a set of field edits to one file.
#[async_trait]
pub trait MetadataWriter: Send + Sync {
    /// Apply `edits` to `path` in a single invocation.
    async fn write(&self, path: &Path, edits: &[FieldEdit]) -> Result<(), WriteError>;

    /// Put the original back if an interrupted write left only the temp file.
    /// Returns true when a file was restored.
    fn recover(&self, path: &Path) -> Result<bool, WriteError> {
        Ok(recover_temp_file(path)?)
    }
}

/// The temp artifact exiftool leaves next to `path` mid-write.
pub fn temp_artifact_path(path: &Path) -> Option<PathBuf> {
    let file_name = path.file_name()?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(TEMP_SUFFIX);
    Some(path.with_file_name(temp_name))
}

/// If `path` is missing but its temp artifact exists, rename the artifact
/// back into place.
pub fn recover_temp_file(path: &Path) -> std::io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    let Some(temp) = temp_artifact_path(path) else {
        return Ok(false);
    };
    if !temp.exists() {
        return Ok(false);
    }

    std::fs::rename(&temp, path)?;
    warn!(
        path = %path.display(),
        temp = %temp.display(),
        "Restored image from interrupted exiftool write"
    );
    Ok(true)
}

/// Runs one `exiftool` process per write.
#[derive(Debug, Clone)]
pub struct ExifToolWriter {
    program: PathBuf,
    timeout: Duration,
}

impl ExifToolWriter {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// Full argument list for one invocation, target path last.
    pub fn build_args(path: &Path, edits: &[FieldEdit]) -> Vec<String> {
        let mut args = vec![
            // Minor errors (e.g. oversized legacy IPTC fields) become warnings.
            "-m".to_string(),
            "-overwrite_original".to_string(),
        ];
        args.extend(edits.iter().flat_map(FieldEdit::exiftool_args));
        args.push(path.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl MetadataWriter for ExifToolWriter {
    async fn write(&self, path: &Path, edits: &[FieldEdit]) -> Result<(), WriteError> {
        if !path.exists() {
            return Err(WriteError::MissingTarget(path.to_path_buf()));
        }

        let args = Self::build_args(path, edits);
        debug!(program = %self.program.display(), ?args, "Running exiftool");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            // Pin the locale so tool output and text encoding don't depend on the host.
            .env("LANG", "C")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WriteError::ToolNotFound(self.program.clone())
            } else {
                WriteError::Io(e)
            }
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| WriteError::Timeout(self.timeout))??;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(WriteError::ToolFailed {
                status: output.status.to_string(),
                stderr,
            });
        }
        if !stderr.is_empty() {
            warn!(path = %path.display(), %stderr, "exiftool reported warnings");
        }

        info!(
            path = %path.display(),
            edits = edits.len(),
            output = %String::from_utf8_lossy(&output.stdout).trim(),
            "Wrote metadata to file"
        );
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::OperationType;
    use std::fs;
    use tempfile::tempdir;

    fn keyword(keyword: &str, op: OperationType) -> FieldEdit {
        FieldEdit::Keyword {
            keyword: keyword.to_string(),
            op,
        }
    }

    #[test]
    fn test_build_args_order() {
        let edits = vec![
            keyword("sunset", OperationType::Add),
            keyword("beach", OperationType::Remove),
            FieldEdit::Rating(Some(4)),
        ];
        let args = ExifToolWriter::build_args(Path::new("/photos/a.jpg"), &edits);

        assert_eq!(
            args,
            vec![
                "-m",
                "-overwrite_original",
                "-Keywords-=sunset",
                "-Keywords+=sunset",
                "-Keywords-=beach",
                "-XMP:Rating=4",
                "/photos/a.jpg",
            ]
        );
    }

    #[test]
    fn test_temp_artifact_path() {
        assert_eq!(
            temp_artifact_path(Path::new("/photos/IMG_1.JPG")),
            Some(PathBuf::from("/photos/IMG_1.JPG_exiftool_tmp"))
        );
    }

    #[test]
    fn test_recover_restores_missing_original() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("photo.jpg");
        let temp = dir.path().join("photo.jpg_exiftool_tmp");
        fs::write(&temp, b"image bytes").unwrap();

        assert!(recover_temp_file(&original).unwrap());
        assert_eq!(fs::read(&original).unwrap(), b"image bytes");
        assert!(!temp.exists());
    }

    #[test]
    fn test_recover_leaves_existing_original_alone() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("photo.jpg");
        let temp = dir.path().join("photo.jpg_exiftool_tmp");
        fs::write(&original, b"original").unwrap();
        fs::write(&temp, b"partial").unwrap();

        assert!(!recover_temp_file(&original).unwrap());
        assert_eq!(fs::read(&original).unwrap(), b"original");
        assert!(temp.exists());
    }

    #[test]
    fn test_recover_without_artifact() {
        let dir = tempdir().unwrap();
        assert!(!recover_temp_file(&dir.path().join("gone.jpg")).unwrap());
    }

    #[tokio::test]
    async fn test_missing_target_is_reported() {
        let dir = tempdir().unwrap();
        let writer = ExifToolWriter::new("exiftool", Duration::from_secs(5));
        let result = writer
            .write(&dir.path().join("gone.jpg"), &[keyword("a", OperationType::Add)])
            .await;
        assert!(matches!(result, Err(WriteError::MissingTarget(_))));
    }

    #[tokio::test]
    async fn test_tool_not_found() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a.jpg");
        fs::write(&target, b"x").unwrap();

        let writer = ExifToolWriter::new(dir.path().join("no-such-exiftool"), Duration::from_secs(5));
        let result = writer.write(&target, &[keyword("a", OperationType::Add)]).await;
        assert!(matches!(result, Err(WriteError::ToolNotFound(_))));
    }

    #[cfg(unix)]
    fn fake_tool(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake-exiftool");
        fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invocation_pins_locale_and_passes_clauses() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a.jpg");
        fs::write(&target, b"x").unwrap();
        let log = dir.path().join("calls.log");
        let tool = fake_tool(
            dir.path(),
            &format!("echo \"$LC_ALL|$LANG|$*\" >> '{}'", log.display()),
        );

        let writer = ExifToolWriter::new(tool, Duration::from_secs(10));
        writer
            .write(&target, &[keyword("sunset", OperationType::Add)])
            .await
            .unwrap();

        let calls = fs::read_to_string(&log).unwrap();
        assert_eq!(calls.lines().count(), 1);
        assert_eq!(
            calls.trim(),
            format!(
                "C|C|-m -overwrite_original -Keywords-=sunset -Keywords+=sunset {}",
                target.display()
            )
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a.jpg");
        fs::write(&target, b"x").unwrap();
        let tool = fake_tool(dir.path(), "echo 'Error: corrupt JPEG' >&2\nexit 1");

        let writer = ExifToolWriter::new(tool, Duration::from_secs(10));
        let result = writer.write(&target, &[FieldEdit::Rating(Some(2))]).await;

        match result {
            Err(WriteError::ToolFailed { stderr, .. }) => assert_eq!(stderr, "Error: corrupt JPEG"),
            other => panic!("expected ToolFailed, got {other:?}"),
        }
    }
}

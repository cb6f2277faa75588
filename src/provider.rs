//! Sources of image content.
//!
//! Ingestion consumes two uncompressed tar streams per image: the merged
//! container filesystem and the image-save archive. [`ImageSource`] is the
//! seam that produces them. Two implementations exist:
//!
//! - [`EngineSource`] drives a docker-compatible command line (`docker`,
//!   `podman`) and streams the command's stdout
//! - [`ArchiveSource`] reads `export.tar` and `save.tar` that were written
//!   ahead of time into one directory
//!
//! Streams are returned as `Box<dyn Read + Send>` so each can be moved into
//! its own ingestion task.

use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use cap_std::ambient_authority;
use cap_std::fs::Dir;

use crate::error::{IngestError, Result};

/// File name of the filesystem export inside an archive directory.
pub const EXPORT_ARCHIVE: &str = "export.tar";

/// File name of the image save inside an archive directory.
pub const SAVE_ARCHIVE: &str = "save.tar";

/// A provider of the two content streams of an image.
pub trait ImageSource: Send + Sync {
    /// Resolve a user-supplied reference to the id the other calls accept.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::ImageNotFound`] if no image matches.
    fn resolve(&self, reference: &str) -> Result<String>;

    /// One tar of the image's merged filesystem.
    fn export_filesystem(&self, image: &str) -> Result<Box<dyn Read + Send>>;

    /// The image-save tar: nested layer tars, manifest and configs.
    fn save_image(&self, image: &str) -> Result<Box<dyn Read + Send>>;
}

/// Image content from a docker-compatible container engine CLI.
#[derive(Debug, Clone)]
pub struct EngineSource {
    command: String,
}

impl EngineSource {
    /// Use the engine executable `command`, e.g. `docker` or `podman`.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn engine(&self) -> Command {
        Command::new(&self.command)
    }

    /// Run an engine subcommand to completion and return its trimmed stdout.
    fn run(&self, args: &[&str]) -> Result<std::result::Result<String, String>> {
        let output = self
            .engine()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| IngestError::Provider(format!("failed to run {}: {}", self.command, e)))?;
        if output.status.success() {
            Ok(Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned()))
        } else {
            Ok(Err(String::from_utf8_lossy(&output.stderr).trim().to_owned()))
        }
    }

    fn stream(&self, args: &[&str], container: Option<ContainerGuard>) -> Result<CommandStream> {
        let mut cmd = self.engine();
        cmd.args(args);
        let description = format!("{} {}", self.command, args.join(" "));
        CommandStream::spawn(cmd, description, container)
    }
}

impl ImageSource for EngineSource {
    fn resolve(&self, reference: &str) -> Result<String> {
        match self.run(&["image", "inspect", "--format", "{{.Id}}", reference])? {
            Ok(id) if !id.is_empty() => {
                tracing::debug!(reference, id = %id, "resolved image");
                Ok(id)
            }
            Ok(_) => Err(IngestError::ImageNotFound(reference.to_owned())),
            Err(stderr) if is_missing_image(&stderr) => {
                Err(IngestError::ImageNotFound(reference.to_owned()))
            }
            Err(stderr) => Err(IngestError::Provider(format!(
                "{} image inspect failed: {}",
                self.command, stderr
            ))),
        }
    }

    fn export_filesystem(&self, image: &str) -> Result<Box<dyn Read + Send>> {
        // The container is never started; the command only satisfies images without one.
        let container = match self.run(&["create", image, "true"])? {
            Ok(id) => id,
            Err(stderr) => {
                return Err(IngestError::Provider(format!(
                    "{} create failed: {}",
                    self.command, stderr
                )))
            }
        };
        tracing::debug!(image, container = %container, "created export container");

        let guard = ContainerGuard {
            command: self.command.clone(),
            id: container.clone(),
        };
        Ok(Box::new(self.stream(&["export", container.as_str()], Some(guard))?))
    }

    fn save_image(&self, image: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.stream(&["save", image], None)?))
    }
}

fn is_missing_image(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    ["no such image", "no such object", "image not known", "not found"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

/// Removes a created container when dropped.
#[derive(Debug)]
struct ContainerGuard {
    command: String,
    id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let result = Command::new(&self.command)
            .args(["rm", "-f", self.id.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match result {
            Ok(status) if status.success() => {
                tracing::debug!(container = %self.id, "removed export container")
            }
            Ok(status) => {
                tracing::warn!(container = %self.id, %status, "failed to remove export container")
            }
            Err(e) => tracing::warn!(container = %self.id, "failed to remove export container: {}", e),
        }
    }
}

/// The stdout of a running command as a byte stream.
///
/// At end of stream the command is waited for; a non-zero exit turns the
/// final read into an error carrying the command's stderr. Dropping the
/// stream early kills the command.
#[derive(Debug)]
pub(crate) struct CommandStream {
    child: Child,
    stdout: ChildStdout,
    description: String,
    finished: bool,
    _container: Option<ContainerGuard>,
}

impl CommandStream {
    fn spawn(
        mut cmd: Command,
        description: String,
        container: Option<ContainerGuard>,
    ) -> Result<Self> {
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| IngestError::Provider(format!("failed to run {}: {}", description, e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IngestError::Provider(format!("{} has no stdout", description)))?;
        Ok(Self {
            child,
            stdout,
            description,
            finished: false,
            _container: container,
        })
    }

    fn finish(&mut self) -> io::Result<()> {
        self.finished = true;
        let mut stderr = String::new();
        if let Some(mut pipe) = self.child.stderr.take() {
            pipe.read_to_string(&mut stderr)?;
        }
        let status = self.child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} exited with {}: {}", self.description, status, stderr.trim()),
            ))
        }
    }
}

impl Read for CommandStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() && !self.finished {
            self.finish()?;
        }
        Ok(n)
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Image content from pre-exported archives in one directory.
///
/// The directory holds [`EXPORT_ARCHIVE`] and [`SAVE_ARCHIVE`], as written
/// by `docker export` and `docker save`.
#[derive(Debug)]
pub struct ArchiveSource {
    dir: Dir,
}

impl ArchiveSource {
    /// Open an archive directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let dir = Dir::open_ambient_dir(path, ambient_authority()).map_err(|e| {
            IngestError::Provider(format!(
                "cannot open archive directory {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self { dir })
    }

    fn open_archive(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.dir.open(name)?))
    }
}

impl ImageSource for ArchiveSource {
    /// Every reference resolves to itself once both archives are present.
    fn resolve(&self, reference: &str) -> Result<String> {
        if self.dir.exists(EXPORT_ARCHIVE) && self.dir.exists(SAVE_ARCHIVE) {
            Ok(reference.to_owned())
        } else {
            Err(IngestError::ImageNotFound(reference.to_owned()))
        }
    }

    fn export_filesystem(&self, _image: &str) -> Result<Box<dyn Read + Send>> {
        self.open_archive(EXPORT_ARCHIVE)
    }

    fn save_image(&self, _image: &str) -> Result<Box<dyn Read + Send>> {
        self.open_archive(SAVE_ARCHIVE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandStream {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        CommandStream::spawn(cmd, format!("sh -c {script}"), None).unwrap()
    }

    #[test]
    fn test_command_stream_success() {
        let mut out = String::new();
        sh("printf hello").read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_command_stream_failure_surfaces_at_eof() {
        let mut out = String::new();
        let err = sh("printf partial; echo boom >&2; exit 3")
            .read_to_string(&mut out)
            .unwrap_err();
        assert!(err.to_string().contains("boom"), "{err}");
    }

    #[test]
    fn test_missing_engine_is_provider_error() {
        let source = EngineSource::new("/nonexistent/engine-binary");
        assert!(matches!(
            source.resolve("alpine"),
            Err(IngestError::Provider(_))
        ));
    }

    #[test]
    fn test_missing_image_detection() {
        assert!(is_missing_image("Error: No such image: nope:latest"));
        assert!(is_missing_image("Error: nope: image not known"));
        assert!(!is_missing_image("Cannot connect to the Docker daemon"));
    }

    #[test]
    fn test_archive_source() {
        let tmp = tempfile::tempdir().unwrap();
        let source = ArchiveSource::open(tmp.path()).unwrap();
        assert!(matches!(
            source.resolve("app"),
            Err(IngestError::ImageNotFound(_))
        ));

        std::fs::write(tmp.path().join(EXPORT_ARCHIVE), b"export").unwrap();
        std::fs::write(tmp.path().join(SAVE_ARCHIVE), b"save").unwrap();
        assert_eq!(source.resolve("app").unwrap(), "app");

        let mut content = String::new();
        source
            .save_image("app")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "save");
    }

    #[test]
    fn test_archive_source_missing_dir() {
        assert!(matches!(
            ArchiveSource::open("/nonexistent/layertree-archives"),
            Err(IngestError::Provider(_))
        ));
    }
}

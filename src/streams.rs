use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::PipelineError;
use crate::session::RunOptions;

/// Instruction what to do with a standard stream at one end of a pipeline.
#[derive(Debug, Clone)]
pub enum Redirection {
    /// Inherit the stream from the parent.
    None,

    /// Redirect the stream to a pipe whose other end stays with the parent.
    Pipe,

    /// Redirect the stream to an open file.
    ///
    /// The file is shared, so the same target can serve as stderr of every stage.
    File(Arc<File>),

    /// Send stderr wherever the stage's stdout goes, like `2>&1`. Only valid for
    /// stderr.
    Merge,
}

/// Concrete stream handles resolved from a [`RunOptions`].
///
/// The parent's only handles to the opened files live here: spawning a stage clones
/// a redirection for the child and releases the clone once the child has its own
/// descriptor. The files are closed in this process when the `PreparedStreams` is
/// dropped.
#[derive(Debug)]
pub struct PreparedStreams {
    pub stdin: Redirection,
    pub stdout: Redirection,
    pub stderr: Redirection,
}

impl PreparedStreams {
    /// Resolve stream directives into redirections.
    ///
    /// All conflicts are reported before any file is opened, so a rejected call never
    /// creates or truncates a file.
    pub fn prepare(options: &RunOptions) -> Result<PreparedStreams, PipelineError> {
        if options.input_text.is_some() && options.input_file.is_some() {
            return Err(PipelineError::Configuration(
                "arguments conflict: input_text and input_file".into(),
            ));
        }
        if options.error_file.is_some() && options.merge_stderr {
            return Err(PipelineError::Configuration(
                "arguments conflict: error_file and merge_stderr".into(),
            ));
        }

        let stdin = match (&options.input_text, &options.input_file) {
            (Some(_), _) => Redirection::Pipe,
            (None, Some(path)) => Redirection::File(Arc::new(open_read(path)?)),
            (None, None) => Redirection::None,
        };
        let stdout = match &options.output_file {
            Some(path) => Redirection::File(Arc::new(open_write(path)?)),
            None => Redirection::None,
        };
        let stderr = match (&options.error_file, options.merge_stderr) {
            (_, true) => Redirection::Merge,
            (Some(path), false) => Redirection::File(Arc::new(open_write(path)?)),
            (None, false) => Redirection::None,
        };

        Ok(PreparedStreams {
            stdin,
            stdout,
            stderr,
        })
    }
}

/// Split the leading `+` append marker off a redirection target and trim surrounding
/// whitespace. Returns the cleaned path and whether append mode was requested.
pub fn parse_target(path: &Path) -> (PathBuf, bool) {
    let bytes = path.as_os_str().as_bytes();
    let (append, rest) = match bytes.strip_prefix(b"+") {
        Some(rest) => (true, rest),
        None => (false, bytes),
    };
    (PathBuf::from(OsStr::from_bytes(rest.trim_ascii())), append)
}

fn open_write(target: &Path) -> Result<File, PipelineError> {
    let (path, append) = parse_target(target);
    let mut opts = OpenOptions::new();
    if append {
        opts.append(true).create(true);
    } else {
        opts.write(true).create(true).truncate(true);
    }
    opts.open(&path)
        .map_err(|source| PipelineError::Redirect { path, source })
}

fn open_read(target: &Path) -> Result<File, PipelineError> {
    // a `+` means nothing for input, but is stripped all the same
    let (path, _) = parse_target(target);
    File::open(&path).map_err(|source| PipelineError::Redirect { path, source })
}

use std::io::Write;
use std::process::{Command, Stdio};

use thiserror::Error;

/// Errors that can occur when piping code through esbuild.
#[derive(Debug, Error)]
pub enum EsbuildError {
    /// An I/O error occurred during process execution.
    #[error("Couldn't run '{0}'.\n{1}")]
    Io(String, std::io::Error),

    /// The esbuild process returned a non-zero exit code.
    #[error("Esbuild execution failed:\n{0}")]
    Failed(String),

    #[error("Esbuild produced invalid UTF-8.\n{0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Feed `input` to esbuild on stdin and return what it prints.
///
/// **Note:** This requires the `esbuild` binary (or whatever `binary` names)
/// to be available in the system PATH.
pub(crate) fn transform_stdin(
    binary: &str,
    args: &[&str],
    input: &str,
) -> Result<String, EsbuildError> {
    let io_error = |err| EsbuildError::Io(binary.to_string(), err);

    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(io_error)?;

    // Writing from another thread, esbuild may start printing before the
    // whole input has been consumed.
    let output = std::thread::scope(|scope| {
        let stdin = child.stdin.take();
        let writer = scope.spawn(move || match stdin {
            Some(mut stdin) => stdin.write_all(input.as_bytes()),
            None => Ok(()),
        });

        let output = child.wait_with_output();
        let written = writer
            .join()
            .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));

        let output = output?;
        match written {
            Err(err) if err.kind() != std::io::ErrorKind::BrokenPipe => Err(err),
            _ => Ok(output),
        }
    })
    .map_err(io_error)?;

    if !output.status.success() {
        return Err(EsbuildError::Failed(String::from_utf8(output.stderr)?));
    }

    Ok(String::from_utf8(output.stdout)?)
}

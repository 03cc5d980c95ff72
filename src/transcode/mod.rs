//! Transcoder driving: probing, command construction, process supervision

pub mod command;
pub mod pool;
pub mod probe;

pub use command::{
    build_slate_command, build_stream_command, cold_start_timeout_for, ChannelEncoding,
    StreamMode, TranscodePlan,
};
pub use pool::{AcquireError, PoolStatus, ProcessHandle, ProcessPool};
pub use probe::{probe_input, Accelerator, AcceleratorSelection, ProbeError, ProbeResult};

use std::io;
use std::process::Stdio;

/// Check that the external transcoder toolchain is on PATH.
///
/// Called once at startup; a missing binary is a configuration error worth
/// failing loudly for.
pub fn check_transcoder_available() -> Result<(), io::Error> {
    for bin in ["ffmpeg", "ffprobe"] {
        match std::process::Command::new(bin)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(_) => {
                return Err(io::Error::other(format!(
                    "{} returned non-zero exit code",
                    bin
                )))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!(
                        "{} not found. Please install FFmpeg and ensure it's in your PATH.",
                        bin
                    ),
                ))
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_transcoder_available() {
        // Result depends on the environment; the error, if any, must be
        // actionable
        if let Err(e) = check_transcoder_available() {
            let msg = e.to_string();
            assert!(
                msg.contains("not found") || msg.contains("non-zero"),
                "unexpected error message: {}",
                msg
            );
        }
    }
}

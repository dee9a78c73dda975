//! Audio codec operations, shelled out to an external binary (`ffmpeg` by
//! convention) rather than linked in-process - decoding arbitrary
//! user-uploaded audio containers is an explicit non-goal for this crate,
//! so the codec collaborator only normalises, measures, and fingerprints.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{Error, Result};

/// A content fingerprint of a normalised audio file, used for near-
/// duplicate detection. Not a perceptual/acoustic hash - `blake3` over the
/// decoded PCM bytes, cheap to compute and stable across re-uploads of the
/// same audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcousticFingerprint([u8; 32]);

impl AcousticFingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for AcousticFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Re-encode an arbitrary audio container into the canonical
/// serving format (44.1kHz stereo MP3) via `ffmpeg`.
pub async fn normalise(input: &Path, output: &Path) -> Result<()> {
    run_ffmpeg(&[
        "-y",
        "-i",
        path_str(input)?,
        "-ar",
        "44100",
        "-ac",
        "2",
        "-codec:a",
        "libmp3lame",
        path_str(output)?,
    ])
    .await
}

/// Render a waveform peak-data PNG for `input` via `ffmpeg`'s `showwavespic`
/// filter.
pub async fn waveform_png(input: &Path, output: &Path) -> Result<()> {
    run_ffmpeg(&[
        "-y",
        "-i",
        path_str(input)?,
        "-filter_complex",
        "showwavespic=s=1200x200:colors=white",
        "-frames:v",
        "1",
        path_str(output)?,
    ])
    .await
}

/// Probe the duration of `input`, in seconds, via `ffprobe`.
pub async fn duration(input: &Path) -> Result<f32> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path_str(input)?)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::Internal(format!("spawning ffprobe: {}", e)))?;

    if !output.status.success() {
        return Err(Error::Internal(format!(
            "ffprobe exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<f32>()
        .map_err(|e| Error::Internal(format!("parsing ffprobe duration: {}", e)))
}

async fn run_ffmpeg(args: &[&str]) -> Result<()> {
    let output = Command::new("ffmpeg")
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::Internal(format!("spawning ffmpeg: {}", e)))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "ffmpeg exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::Internal(format!("non-utf8 path: {}", path.display())))
}

mod hex {
    pub fn encode(bytes: [u8; 32]) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(64);
        for byte in bytes {
            write!(out, "{:02x}", byte).expect("writing to String cannot fail");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = AcousticFingerprint::of(b"some pcm bytes");
        let b = AcousticFingerprint::of(b"some pcm bytes");
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 64);
    }

    #[test]
    fn fingerprint_differs_for_different_input() {
        let a = AcousticFingerprint::of(b"track one");
        let b = AcousticFingerprint::of(b"track two");
        assert_ne!(a, b);
    }

    #[test]
    fn display_matches_to_hex() {
        let fp = AcousticFingerprint::of(b"x");
        assert_eq!(fp.to_string(), fp.to_hex());
    }
}

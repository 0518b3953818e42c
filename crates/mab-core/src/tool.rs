use std::path::PathBuf;

use async_trait::async_trait;

use crate::Result;

/// Closed parameter set for the external transformation tool.
///
/// Values the menus do not collect (trim bounds, GIF window, speed factor)
/// are filled in from configuration defaults by the dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformSpec {
    /// Strip the audio track, copying video.
    RemoveAudio,
    /// Extract the audio track into `format` (e.g. "mp3").
    ExtractAudio { format: String },
    /// Copy the stream between two `HH:MM:SS` bounds.
    Trim { start: String, end: String },
    /// Concatenate every input into one container.
    Concat { inputs: Vec<PathBuf> },
    /// Render a bounded window as an animation.
    ToGif { start_secs: u32, duration_secs: u32 },
    /// Grab a single frame at an offset (seconds).
    Screenshot { at_secs: f64 },
    /// Slow + reverb filter chain.
    SlowReverb,
    /// Stereo pan rotation ("8D") filter.
    EightD,
    /// Playback speed change.
    Speed { factor: f64 },
    /// Container/codec conversion decided by the output extension.
    Convert,
}

#[derive(Clone, Debug)]
pub struct TransformRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub spec: TransformSpec,
}

/// External transformation tool collaborator (ffmpeg-family).
///
/// An implementation runs the tool to completion and maps a non-zero exit
/// into `Error::Processing` carrying a bounded diagnostic tail.
#[async_trait]
pub trait MediaToolPort: Send + Sync {
    async fn transform(&self, req: TransformRequest) -> Result<()>;

    /// Container duration in seconds (for screenshot spacing).
    async fn probe_duration(&self, input: &std::path::Path) -> Result<f64>;
}

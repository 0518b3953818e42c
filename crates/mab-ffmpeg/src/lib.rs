//! ffmpeg/ffprobe adapter for the media tool port.
//!
//! Invocations are plain child processes; a non-zero exit becomes
//! `Error::Processing` carrying a bounded tail of stderr. Passwords and
//! other secrets never pass through here: this adapter only ever sees
//! input/output paths and filter parameters.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use mab_core::{
    errors::Error,
    tool::{MediaToolPort, TransformRequest, TransformSpec},
    Result,
};

const STDERR_TAIL_MAX_CHARS: usize = 2000;

#[derive(Clone, Debug)]
pub struct FfmpegTool {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegTool {
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }

    async fn run(&self, program: &Path, args: &[String]) -> Result<Vec<u8>> {
        tracing::debug!(program = %program.display(), ?args, "running tool");

        let out = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Processing(format!("failed to run {}: {e}", program.display())))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(Error::Processing(format!(
                "{} exited with {}: {}",
                program.display(),
                out.status,
                tail(&stderr, STDERR_TAIL_MAX_CHARS)
            )));
        }

        Ok(out.stdout)
    }
}

#[async_trait]
impl MediaToolPort for FfmpegTool {
    async fn transform(&self, req: TransformRequest) -> Result<()> {
        // The concat demuxer wants its inputs listed in a file.
        let mut list_file: Option<PathBuf> = None;
        let args = match &req.spec {
            TransformSpec::Concat { inputs } => {
                let list = req.output.with_extension("ffconcat");
                let mut body = String::new();
                for input in inputs {
                    body.push_str(&format!("file '{}'\n", input.display()));
                }
                tokio::fs::write(&list, body).await?;
                list_file = Some(list.clone());
                concat_args(&list, &req.output)
            }
            spec => build_args(&req.input, &req.output, spec),
        };

        let result = self.run(&self.ffmpeg, &args).await;

        if let Some(list) = list_file {
            let _ = tokio::fs::remove_file(list).await;
        }

        result.map(|_| ())
    }

    async fn probe_duration(&self, input: &Path) -> Result<f64> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_format".to_string(),
            input.display().to_string(),
        ];
        let stdout = self.run(&self.ffprobe, &args).await?;
        parse_probe_duration(&String::from_utf8_lossy(&stdout))
    }
}

fn build_args(input: &Path, output: &Path, spec: &TransformSpec) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".to_string()];

    // Seek flags go before the input so ffmpeg seeks instead of decoding
    // everything up to the mark.
    match spec {
        TransformSpec::Trim { start, end } => {
            args.extend(["-ss".to_string(), start.clone(), "-to".to_string(), end.clone()]);
        }
        TransformSpec::ToGif {
            start_secs,
            duration_secs,
        } => {
            args.extend([
                "-ss".to_string(),
                start_secs.to_string(),
                "-t".to_string(),
                duration_secs.to_string(),
            ]);
        }
        TransformSpec::Screenshot { at_secs } => {
            args.extend(["-ss".to_string(), format!("{at_secs:.3}")]);
        }
        _ => {}
    }

    args.extend(["-i".to_string(), input.display().to_string()]);

    match spec {
        TransformSpec::RemoveAudio => {
            args.extend(["-c:v".to_string(), "copy".to_string(), "-an".to_string()]);
        }
        TransformSpec::ExtractAudio { format } => {
            args.push("-vn".to_string());
            if format == "mp3" {
                args.extend(["-acodec".to_string(), "libmp3lame".to_string()]);
            }
        }
        TransformSpec::Trim { .. } => {
            args.extend(["-c".to_string(), "copy".to_string()]);
        }
        TransformSpec::ToGif { .. } => {
            args.extend(["-vf".to_string(), "fps=10,scale=-1:240".to_string()]);
        }
        TransformSpec::Screenshot { .. } => {
            args.extend([
                "-frames:v".to_string(),
                "1".to_string(),
                "-q:v".to_string(),
                "2".to_string(),
            ]);
        }
        TransformSpec::SlowReverb => {
            args.extend([
                "-af".to_string(),
                "atempo=0.8,aecho=0.8:0.9:1000:0.3".to_string(),
            ]);
        }
        TransformSpec::EightD => {
            args.extend([
                "-af".to_string(),
                "pan=stereo|FL=0.5*FC+0.707*FL+0.707*BL|FR=0.5*FC+0.707*FR+0.707*BR".to_string(),
            ]);
        }
        TransformSpec::Speed { factor } => {
            args.extend(["-af".to_string(), format!("atempo={factor}")]);
        }
        TransformSpec::Convert => {}
        TransformSpec::Concat { .. } => unreachable!("concat builds its own args"),
    }

    args.push(output.display().to_string());
    args
}

fn concat_args(list: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        list.display().to_string(),
        "-c".to_string(),
        "copy".to_string(),
        output.display().to_string(),
    ]
}

fn parse_probe_duration(json: &str) -> Result<f64> {
    #[derive(Deserialize)]
    struct ProbeOutput {
        format: ProbeFormat,
    }

    #[derive(Deserialize)]
    struct ProbeFormat {
        duration: Option<String>,
    }

    let probe: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| Error::Processing(format!("unparseable ffprobe output: {e}")))?;

    probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| Error::Processing("ffprobe reported no duration".to_string()))
}

fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    s.chars().skip(count - max_chars).collect()
}

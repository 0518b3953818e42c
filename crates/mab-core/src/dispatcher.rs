//! Executes a resolved operation against staged inputs.
//!
//! The dispatcher owns limit enforcement, progress reporting and the
//! collaborator calls (archive codec, media tool, URL fetcher). Every
//! output path is allocated through the caller's `StagingScope`, so a
//! failure at any stage releases partial artifacts before the error
//! propagates. Partial outputs are never delivered.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::{
    archive::{self, ExtractLimits},
    config::Config,
    domain::ChatId,
    errors::Error,
    fetch::UrlFetcher,
    messaging::{
        port::MessagingPort,
        types::{Artifact, ArtifactKind},
    },
    registry::{ArchiveFormat, AudioOp, DocOp, OperationId, UrlOp, VideoOp},
    staging::{StagedFile, StagingScope},
    tool::{MediaToolPort, TransformRequest, TransformSpec},
    Result,
};

/// Everything captured from the session before the lock is released.
#[derive(Clone, Debug)]
pub struct OperationRequest {
    pub op: OperationId,
    pub inputs: Vec<StagedFile>,
    pub url: Option<String>,
    pub archive_format: Option<ArchiveFormat>,
    pub password: Option<String>,
}

#[derive(Debug, Default)]
pub struct OperationResult {
    pub artifacts: Vec<Artifact>,
}

pub struct Dispatcher {
    cfg: Arc<Config>,
    tool: Arc<dyn MediaToolPort>,
    fetcher: Arc<dyn UrlFetcher>,
    messenger: Arc<dyn MessagingPort>,
}

impl Dispatcher {
    pub fn new(
        cfg: Arc<Config>,
        tool: Arc<dyn MediaToolPort>,
        fetcher: Arc<dyn UrlFetcher>,
        messenger: Arc<dyn MessagingPort>,
    ) -> Self {
        Self {
            cfg,
            tool,
            fetcher,
            messenger,
        }
    }

    /// Run one operation to completion. Outputs are staged through `scope`;
    /// the caller decides when (and whether) they are delivered and releases
    /// the scope afterwards.
    pub async fn execute(
        &self,
        chat_id: ChatId,
        req: OperationRequest,
        scope: &mut StagingScope,
    ) -> Result<OperationResult> {
        self.enforce_limits(&req)?;

        match req.op {
            OperationId::Document(DocOp::MakeArchive) => {
                self.make_archive(chat_id, &req, scope).await
            }
            OperationId::Document(DocOp::Extract) => {
                let input = single_input(&req)?;
                self.extract(&input.path, &input.name, req.password.as_deref(), scope)
                    .await
            }
            OperationId::Url(UrlOp::Download) => {
                let (path, fetched) = self.fetch_url(&req, scope).await?;
                Ok(OperationResult {
                    artifacts: vec![Artifact {
                        path,
                        caption: format!("Downloaded: {}", fetched.name),
                        kind: ArtifactKind::Document,
                    }],
                })
            }
            OperationId::Url(UrlOp::Extract) => {
                let (path, fetched) = self.fetch_url(&req, scope).await?;
                self.extract(&path, &fetched.name, req.password.as_deref(), scope)
                    .await
            }
            OperationId::Video(op) => self.video_op(op, &req, scope).await,
            OperationId::Audio(op) => self.audio_op(op, &req, scope).await,
        }
    }

    /// Hand artifacts to the transport, chunked to the batch cap.
    pub async fn deliver(&self, chat_id: ChatId, artifacts: &[Artifact]) -> Result<()> {
        match artifacts {
            [] => Ok(()),
            [one] => {
                self.messenger.send_artifact(chat_id, one).await?;
                Ok(())
            }
            many => {
                for chunk in many.chunks(self.cfg.max_batch) {
                    self.messenger.send_artifact_batch(chat_id, chunk).await?;
                }
                Ok(())
            }
        }
    }

    fn enforce_limits(&self, req: &OperationRequest) -> Result<()> {
        if req.inputs.len() > self.cfg.max_files {
            return Err(Error::LimitExceeded(format!(
                "{} files (maximum {})",
                req.inputs.len(),
                self.cfg.max_files
            )));
        }
        let total: u64 = req.inputs.iter().map(|f| f.size).sum();
        if total > self.cfg.max_total_bytes {
            return Err(Error::LimitExceeded(format!(
                "{} bytes total (maximum {})",
                total, self.cfg.max_total_bytes
            )));
        }
        Ok(())
    }

    async fn make_archive(
        &self,
        chat_id: ChatId,
        req: &OperationRequest,
        scope: &mut StagingScope,
    ) -> Result<OperationResult> {
        let format = req
            .archive_format
            .ok_or_else(|| Error::Validation("no archive type selected".to_string()))?;
        let password = match (&req.password, format.supports_password()) {
            (Some(pw), true) => Some(pw.clone()),
            _ => None,
        };

        let dest = scope.allocate(format.extension());
        let entries: Vec<(PathBuf, String)> = req
            .inputs
            .iter()
            .map(|f| (f.path.clone(), f.name.clone()))
            .collect();

        let progress_msg = self
            .messenger
            .send_text(chat_id, "⏳ Creating archive... 0%")
            .await
            .ok();

        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, usize)>();
        let dest_for_task = dest.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut on_entry = |done: usize, total: usize| {
                let _ = tx.send((done, total));
            };
            archive::create_archive(
                format,
                &entries,
                password.as_deref(),
                &dest_for_task,
                &mut on_entry,
            )
        });

        let mut throttle = ProgressThrottle::new(
            self.cfg.progress_step_percent,
            self.cfg.progress_min_interval,
        );
        while let Some((done, total)) = rx.recv().await {
            let percent = (done * 100 / total.max(1)) as u8;
            if throttle.should_emit(percent) {
                if let Some(msg) = progress_msg {
                    let _ = self
                        .messenger
                        .edit_text(msg, &format!("⏳ Creating archive... {percent}%"))
                        .await;
                }
            }
        }

        let build = task
            .await
            .map_err(|e| Error::External(format!("archive task failed: {e}")))?;

        if let Some(msg) = progress_msg {
            let _ = self.messenger.delete_message(msg).await;
        }
        build?;

        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let display = format!("archive_{stamp}{}", format.extension());
        let mut caption = format!("📦 {} files archived ({display})", req.inputs.len());
        if req.password.is_some() && format.supports_password() {
            caption.push_str("\n🔐 password protected");
        }

        Ok(OperationResult {
            artifacts: vec![Artifact {
                path: dest,
                caption,
                kind: ArtifactKind::Document,
            }],
        })
    }

    async fn extract(
        &self,
        archive_path: &std::path::Path,
        display_name: &str,
        password: Option<&str>,
        scope: &mut StagingScope,
    ) -> Result<OperationResult> {
        let dest_dir = scope.allocate("_extracted");
        let limits = ExtractLimits {
            max_files: 200,
            max_total_bytes: self.cfg.max_total_bytes,
            max_file_bytes: self.cfg.max_total_bytes,
        };

        let report = {
            let archive_path = archive_path.to_path_buf();
            let display_name = display_name.to_string();
            let dest_dir = dest_dir.clone();
            let password = password.map(|s| s.to_string());
            tokio::task::spawn_blocking(move || {
                archive::extract_archive(
                    &archive_path,
                    &display_name,
                    &dest_dir,
                    password.as_deref(),
                    limits,
                )
            })
            .await
            .map_err(|e| Error::External(format!("extract task failed: {e}")))??
        };

        if report.extracted_files.is_empty() {
            return Err(Error::Archive("archive contains no files".to_string()));
        }

        let artifacts = report
            .extracted_files
            .iter()
            .map(|rel| Artifact {
                path: dest_dir.join(rel),
                caption: format!("Extracted: {}", rel.display()),
                kind: ArtifactKind::Document,
            })
            .collect();

        Ok(OperationResult { artifacts })
    }

    async fn fetch_url(
        &self,
        req: &OperationRequest,
        scope: &mut StagingScope,
    ) -> Result<(PathBuf, crate::fetch::FetchedFile)> {
        let url = req
            .url
            .as_deref()
            .ok_or_else(|| Error::Validation("no URL recorded".to_string()))?;

        let suffix = crate::fetch::infer_filename(url)
            .rsplit_once('.')
            .map(|(_, ext)| format!(".{ext}"))
            .unwrap_or_default();
        let dest = scope.allocate(&suffix);
        let fetched = self.fetcher.fetch(url, &dest).await?;
        Ok((dest, fetched))
    }

    async fn video_op(
        &self,
        op: VideoOp,
        req: &OperationRequest,
        scope: &mut StagingScope,
    ) -> Result<OperationResult> {
        let cfg = &self.cfg;

        if op == VideoOp::Screenshots {
            return self.screenshots(req, scope).await;
        }

        if op == VideoOp::Merge {
            let inputs: Vec<PathBuf> = req.inputs.iter().map(|f| f.path.clone()).collect();
            let first = req
                .inputs
                .first()
                .ok_or_else(|| Error::Validation("no files to merge".to_string()))?;
            let output = scope.allocate(".mp4");
            self.tool
                .transform(TransformRequest {
                    input: first.path.clone(),
                    output: output.clone(),
                    spec: TransformSpec::Concat { inputs },
                })
                .await?;
            return Ok(OperationResult {
                artifacts: vec![Artifact {
                    path: output,
                    caption: "Videos merged successfully".to_string(),
                    kind: ArtifactKind::Video,
                }],
            });
        }

        let input = single_input(req)?;
        let (suffix, spec, caption, kind) = match op {
            VideoOp::RemoveAudio => (
                ".mp4".to_string(),
                TransformSpec::RemoveAudio,
                "Audio removed from video".to_string(),
                ArtifactKind::Video,
            ),
            VideoOp::ExtractAudio => (
                format!(".{}", cfg.extract_audio_format),
                TransformSpec::ExtractAudio {
                    format: cfg.extract_audio_format.clone(),
                },
                format!("Audio extracted as {}", cfg.extract_audio_format),
                ArtifactKind::Audio,
            ),
            VideoOp::Trim => (
                ".mp4".to_string(),
                TransformSpec::Trim {
                    start: cfg.trim_start.clone(),
                    end: cfg.trim_end.clone(),
                },
                format!("Video trimmed from {} to {}", cfg.trim_start, cfg.trim_end),
                ArtifactKind::Video,
            ),
            VideoOp::ToGif => (
                ".gif".to_string(),
                TransformSpec::ToGif {
                    start_secs: cfg.gif_start_secs,
                    duration_secs: cfg.gif_duration_secs,
                },
                format!(
                    "GIF created from {}s to {}s",
                    cfg.gif_start_secs,
                    cfg.gif_start_secs + cfg.gif_duration_secs
                ),
                ArtifactKind::Animation,
            ),
            VideoOp::Convert => (
                format!(".{}", cfg.video_convert_format),
                TransformSpec::Convert,
                format!("Video converted to {}", cfg.video_convert_format),
                ArtifactKind::Video,
            ),
            VideoOp::Screenshots | VideoOp::Merge => unreachable!("handled above"),
        };

        let output = scope.allocate(&suffix);
        self.tool
            .transform(TransformRequest {
                input: input.path.clone(),
                output: output.clone(),
                spec,
            })
            .await?;

        Ok(OperationResult {
            artifacts: vec![Artifact {
                path: output,
                caption,
                kind,
            }],
        })
    }

    async fn screenshots(
        &self,
        req: &OperationRequest,
        scope: &mut StagingScope,
    ) -> Result<OperationResult> {
        let input = single_input(req)?;
        let duration = self.tool.probe_duration(&input.path).await?;
        let count = self.cfg.screenshot_count;

        let mut artifacts = Vec::with_capacity(count);
        for i in 0..count {
            let at_secs = duration * (i as f64 + 1.0) / (count as f64 + 1.0);
            let output = scope.allocate(&format!("_{i}.jpg"));
            self.tool
                .transform(TransformRequest {
                    input: input.path.clone(),
                    output: output.clone(),
                    spec: TransformSpec::Screenshot { at_secs },
                })
                .await?;
            artifacts.push(Artifact {
                path: output,
                caption: format!("Screenshot at {at_secs:.1}s"),
                kind: ArtifactKind::Photo,
            });
        }

        Ok(OperationResult { artifacts })
    }

    async fn audio_op(
        &self,
        op: AudioOp,
        req: &OperationRequest,
        scope: &mut StagingScope,
    ) -> Result<OperationResult> {
        let cfg = &self.cfg;
        let input = single_input(req)?;

        let (suffix, spec, caption) = match op {
            AudioOp::SlowReverb => (
                ".mp3".to_string(),
                TransformSpec::SlowReverb,
                "Slow + reverb effect applied".to_string(),
            ),
            AudioOp::Convert => (
                format!(".{}", cfg.audio_convert_format),
                TransformSpec::Convert,
                format!("Audio converted to {}", cfg.audio_convert_format),
            ),
            AudioOp::EightD => (
                ".mp3".to_string(),
                TransformSpec::EightD,
                "8D audio effect applied".to_string(),
            ),
            AudioOp::Speed => (
                ".mp3".to_string(),
                TransformSpec::Speed {
                    factor: cfg.speed_factor,
                },
                format!("Audio speed changed to {}x", cfg.speed_factor),
            ),
        };

        let output = scope.allocate(&suffix);
        self.tool
            .transform(TransformRequest {
                input: input.path.clone(),
                output: output.clone(),
                spec,
            })
            .await?;

        Ok(OperationResult {
            artifacts: vec![Artifact {
                path: output,
                caption,
                kind: ArtifactKind::Audio,
            }],
        })
    }
}

fn single_input(req: &OperationRequest) -> Result<&StagedFile> {
    req.inputs
        .last()
        .ok_or_else(|| Error::Validation("no file staged for this operation".to_string()))
}

/// Progress-edit throttle: at most one edit per percentage step, spaced by
/// a minimum interval. Advisory UI feedback, not a correctness mechanism.
struct ProgressThrottle {
    step: u8,
    min_interval: Duration,
    last_percent: Option<u8>,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    fn new(step: u8, min_interval: Duration) -> Self {
        Self {
            step: step.max(1),
            min_interval,
            last_percent: None,
            last_emit: None,
        }
    }

    fn should_emit(&mut self, percent: u8) -> bool {
        let stepped = match self.last_percent {
            None => true,
            Some(last) => percent >= last.saturating_add(self.step) || percent >= 100,
        };
        if !stepped {
            return false;
        }
        if percent < 100 {
            if let Some(last) = self.last_emit {
                if last.elapsed() < self.min_interval {
                    return false;
                }
            }
        }
        if self.last_percent == Some(percent) {
            return false;
        }
        self.last_percent = Some(percent);
        self.last_emit = Some(Instant::now());
        true
    }
}

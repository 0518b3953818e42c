use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Typed configuration for the bot.
///
/// Everything comes from the environment (with a `.env` fallback) so the
/// deployed process and the container image stay config-free.
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub bot_token: String,
    pub temp_dir: PathBuf,

    // External tools
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,

    // Operation limits
    pub max_files: usize,
    pub max_total_bytes: u64,
    pub max_batch: usize,
    pub download_timeout: Duration,

    // Progress reporting
    pub progress_step_percent: u8,
    pub progress_min_interval: Duration,

    // Operation parameter defaults (the menus do not collect these)
    pub trim_start: String,
    pub trim_end: String,
    pub gif_start_secs: u32,
    pub gif_duration_secs: u32,
    pub screenshot_count: usize,
    pub speed_factor: f64,
    pub extract_audio_format: String,
    pub audio_convert_format: String,
    pub video_convert_format: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let bot_token = env_str("BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(Error::Config(
                "BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let temp_dir =
            PathBuf::from(env_str("TEMP_DIR").unwrap_or("/tmp/media-archive-bot".to_string()));
        fs::create_dir_all(&temp_dir)?;

        let ffmpeg_path = env_path("FFMPEG_PATH")
            .or_else(|| which_in_path("ffmpeg"))
            .unwrap_or_else(|| PathBuf::from("/usr/bin/ffmpeg"));
        let ffprobe_path = env_path("FFPROBE_PATH")
            .or_else(|| which_in_path("ffprobe"))
            .unwrap_or_else(|| PathBuf::from("/usr/bin/ffprobe"));

        let max_files = env_usize("MAX_ARCHIVE_FILES").unwrap_or(20);
        let max_total_bytes = env_u64("MAX_ARCHIVE_BYTES").unwrap_or(2 * 1024 * 1024 * 1024);
        let max_batch = env_usize("MAX_DELIVERY_BATCH").unwrap_or(10).clamp(1, 10);
        let download_timeout =
            Duration::from_millis(env_u64("DOWNLOAD_TIMEOUT_MS").unwrap_or(120_000));

        let progress_step_percent = env_u64("PROGRESS_STEP_PERCENT")
            .unwrap_or(10)
            .clamp(1, 100) as u8;
        let progress_min_interval =
            Duration::from_millis(env_u64("PROGRESS_MIN_INTERVAL_MS").unwrap_or(1000));

        let trim_start = env_str("TRIM_START").unwrap_or("00:00:10".to_string());
        let trim_end = env_str("TRIM_END").unwrap_or("00:00:20".to_string());
        let gif_start_secs = env_u64("GIF_START_SECS").unwrap_or(0) as u32;
        let gif_duration_secs = env_u64("GIF_DURATION_SECS").unwrap_or(5).max(1) as u32;
        let screenshot_count = env_usize("SCREENSHOT_COUNT").unwrap_or(3).clamp(1, 10);
        let speed_factor = env_f64("SPEED_FACTOR").unwrap_or(1.5);

        let extract_audio_format = env_str("EXTRACT_AUDIO_FORMAT").unwrap_or("mp3".to_string());
        let audio_convert_format = env_str("AUDIO_CONVERT_FORMAT").unwrap_or("wav".to_string());
        let video_convert_format = env_str("VIDEO_CONVERT_FORMAT").unwrap_or("mp4".to_string());

        Ok(Self {
            bot_token,
            temp_dir,
            ffmpeg_path,
            ffprobe_path,
            max_files,
            max_total_bytes,
            max_batch,
            download_timeout,
            progress_step_percent,
            progress_min_interval,
            trim_start,
            trim_end,
            gif_start_secs,
            gif_duration_secs,
            screenshot_count,
            speed_factor,
            extract_audio_format,
            audio_convert_format,
            video_convert_format,
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    env_str(key).and_then(|s| s.trim().parse::<f64>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(binary);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

#[cfg(test)]
pub(crate) fn test_config(temp_dir: PathBuf) -> Config {
    Config {
        bot_token: "x".to_string(),
        temp_dir,
        ffmpeg_path: "/usr/bin/ffmpeg".into(),
        ffprobe_path: "/usr/bin/ffprobe".into(),
        max_files: 20,
        max_total_bytes: 2 * 1024 * 1024 * 1024,
        max_batch: 10,
        download_timeout: Duration::from_secs(5),
        progress_step_percent: 10,
        progress_min_interval: Duration::from_millis(0),
        trim_start: "00:00:10".to_string(),
        trim_end: "00:00:20".to_string(),
        gif_start_secs: 0,
        gif_duration_secs: 5,
        screenshot_count: 3,
        speed_factor: 1.5,
        extract_audio_format: "mp3".to_string(),
        audio_convert_format: "wav".to_string(),
        video_convert_format: "mp4".to_string(),
    }
}

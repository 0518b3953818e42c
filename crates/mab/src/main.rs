use std::sync::Arc;

use mab_core::{config::Config, tool::MediaToolPort};
use mab_ffmpeg::FfmpegTool;

#[tokio::main]
async fn main() -> Result<(), mab_core::Error> {
    mab_core::logging::init("mab")?;

    let cfg = Arc::new(Config::load()?);

    let tool: Arc<dyn MediaToolPort> = Arc::new(FfmpegTool::new(
        cfg.ffmpeg_path.clone(),
        cfg.ffprobe_path.clone(),
    ));

    mab_telegram::router::run_polling(cfg, tool)
        .await
        .map_err(|e| mab_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}

use std::sync::Arc;

use hls_enrich::callback::WebhookCallback;
use hls_enrich::config::Settings;
use hls_enrich::inference::OpenAiClient;
use hls_enrich::media::FfmpegTranscoder;
use hls_enrich::pipeline::variants::{OcrPipeline, TranscriptPipeline};
use hls_enrich::pipeline::{PipelineTask, PipelineWorker, SqlitePipelineStore};
use hls_enrich::streams::MemoryStreamRegistry;
use hls_enrich::{database, logging};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let settings = Settings::from_env()?;

    let (logging_config, _log_guard) = logging::init_logging(&settings.log_dir)?;
    if let Some(directive) = &settings.log_filter {
        logging_config.set_filter(directive)?;
    }
    tracing::info!(
        filter = %logging_config.get_filter(),
        log_dir = %logging_config.log_dir().display(),
        "Logging initialized"
    );
    let shutdown = CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown.clone());

    // Initialize database
    let pool = database::init_pool(&settings.database_url).await?;
    database::run_migrations(&pool).await?;
    let store = Arc::new(SqlitePipelineStore::new(pool));

    let transcoder = Arc::new(FfmpegTranscoder::new(
        settings.ffmpeg_path.clone(),
        settings.ffprobe_path.clone(),
    ));
    let ai = Arc::new(OpenAiClient::new(settings.request_timeout)?);
    let callback = Arc::new(WebhookCallback::new(
        settings.callback_url.clone(),
        settings.request_timeout,
    )?);
    // Fed by the media server's publish/unpublish hooks; the on_hls hook calls
    // `PipelineTask::on_hls_segment` on both tasks below.
    let registry = Arc::new(MemoryStreamRegistry::new());

    let transcript = Arc::new(PipelineTask::new(
        TranscriptPipeline::new(transcoder.clone(), ai.clone()),
        settings.engine.clone(),
        settings.workdir.join("transcript"),
        store.clone(),
    ));
    let ocr = Arc::new(PipelineTask::new(
        OcrPipeline::new(transcoder, ai, callback),
        settings.engine.clone(),
        settings.workdir.join("ocr"),
        store,
    ));

    let transcript_worker = PipelineWorker::new(transcript, registry.clone());
    let ocr_worker = PipelineWorker::new(ocr, registry);
    transcript_worker.start().await?;
    ocr_worker.start().await?;

    tracing::info!("hls-enrich initialized successfully");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    shutdown.cancel();
    transcript_worker.stop().await;
    ocr_worker.stop().await;

    Ok(())
}

use std::sync::Arc;

use transform_bus::transform::TransformProvider;

mod config;
mod pipe;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("transform_bus", log::LevelFilter::Debug)
        .filter_module("hw_transcode", log::LevelFilter::Debug)
        .init();
}

#[cfg(feature = "ffmpeg")]
fn provider() -> anyhow::Result<Arc<dyn TransformProvider>> {
    transform_bus::init()?;
    Ok(Arc::new(transform_bus::hw::FfmpegProvider))
}

#[cfg(not(feature = "ffmpeg"))]
fn provider() -> anyhow::Result<Arc<dyn TransformProvider>> {
    anyhow::bail!("no transform provider compiled in, rebuild with `--features ffmpeg`")
}

async fn run() -> anyhow::Result<()> {
    let config = config::config()?;
    let provider = provider()?;
    let pipe = pipe::Pipe::new(config);

    tokio::select! {
        stats = pipe.run(provider) => {
            let stats = stats?;
            log::info!(
                "transcoded {} -> {}: {}",
                config.input.display(),
                config.output.display(),
                stats
            );
        },
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted");
            pipe.stop();
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(e) = run().await {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

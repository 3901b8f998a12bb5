//! `lamafill` CLI - Remove objects from images with an on-device LaMa model.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lamafill::{Config, Inpainter, Progress, ProgressSink, Stage};

/// Repaint masked regions of an image using a cached LaMa ONNX model.
#[derive(Parser, Debug)]
#[command(name = "lamafill")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Model cache directory. Defaults to the platform cache directory.
    #[arg(long, global = true, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Model mirror URL. Repeat to try several in order.
    #[arg(long = "mirror", global = true, value_name = "URL")]
    mirrors: Vec<String>,

    /// Inference threads. Defaults to the runtime's choice.
    #[arg(long, global = true, value_name = "INT")]
    threads: Option<usize>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Repaint the pixels of IMAGE whose MASK red channel is 255.
    Inpaint {
        /// Input image path.
        #[arg(value_name = "IMAGE")]
        image: PathBuf,

        /// Mask image path; pure red (255) marks pixels to remove.
        #[arg(value_name = "MASK")]
        mask: PathBuf,

        /// Output image path.
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        /// Letterbox to this square size before inference.
        #[arg(long, value_name = "PIXELS")]
        fixed_size: Option<u32>,

        /// Output JPEG quality (1-100).
        #[arg(short, long, default_value = "95", value_name = "INT")]
        quality: u8,
    },

    /// Download the model into the cache.
    Download,

    /// Report whether the model is cached.
    Status,

    /// Delete the cached model.
    ClearCache,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("lamafill={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(err) = run(args).await {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config {
        cache_dir: args.cache_dir,
        intra_threads: args.threads,
        ..Config::default()
    };
    if !args.mirrors.is_empty() {
        config.mirrors = args.mirrors;
    }

    match args.command {
        Command::Inpaint {
            image,
            mask,
            output,
            fixed_size,
            quality,
        } => {
            if !(1..=100).contains(&quality) {
                anyhow::bail!("--quality must be between 1 and 100, got {quality}");
            }
            config.fixed_input_size = fixed_size;
            let inpainter = Inpainter::new(config).context("Failed to initialize pipeline")?;

            let source = lamafill::image::load_image(&image).context("Failed to read image")?;
            let marks = lamafill::image::load_image(&mask).context("Failed to read mask")?;

            let reporter = Reporter::new();
            let repaired = inpainter
                .inpaint(&source, &marks, &reporter)
                .await
                .context("Failed to inpaint image");
            reporter.finish();
            let repaired = repaired?;

            lamafill::image::save_image(&repaired, &output, quality)
                .context("Failed to write output")?;

            println!("Successfully processed {} -> {}", image.display(), output.display());
        }
        Command::Download => {
            let inpainter = Inpainter::new(config).context("Failed to initialize pipeline")?;
            let reporter = Reporter::new();
            let blob = inpainter.download_model(&reporter).await;
            reporter.finish();
            let blob = blob.context("Failed to download model")?;

            println!("Model ready ({} bytes)", blob.len());
        }
        Command::Status => {
            let inpainter = Inpainter::new(config).context("Failed to initialize pipeline")?;
            let cached = inpainter.is_model_cached().await;
            println!(
                "Model {} is {}",
                inpainter.config().cache_key,
                if cached { "cached" } else { "not cached" }
            );
        }
        Command::ClearCache => {
            let inpainter = Inpainter::new(config).context("Failed to initialize pipeline")?;
            inpainter
                .clear_model_cache()
                .await
                .context("Failed to clear model cache")?;
            println!("Model cache cleared");
        }
    }

    Ok(())
}

/// Renders pipeline progress on the terminal.
struct Reporter {
    bar: ProgressBar,
    /// Download size the bar is currently styled for.
    styled_for: Mutex<Option<Option<u64>>>,
}

impl Reporter {
    fn new() -> Self {
        let bar = ProgressBar::no_length();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .expect("valid template"),
        );
        Self {
            bar,
            styled_for: Mutex::new(None),
        }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn style_download(&self, total: Option<u64>) {
        let mut styled_for = self.styled_for.lock().unwrap_or_else(PoisonError::into_inner);
        if *styled_for == Some(total) {
            return;
        }
        *styled_for = Some(total);

        match total {
            Some(total) => {
                self.bar.set_style(
                    ProgressStyle::default_bar()
                        .template(
                            "{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                        )
                        .expect("valid template")
                        .progress_chars("#>-"),
                );
                self.bar.set_length(total);
            }
            // No content-length: show bytes received, no total or ETA.
            None => self.bar.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} {msg} {bytes} ({bytes_per_sec})")
                    .expect("valid template"),
            ),
        }
    }
}

impl ProgressSink for Reporter {
    fn report(&self, progress: &Progress) {
        self.bar.set_message(progress.stage.label());
        if progress.stage == Stage::DownloadingModel {
            self.style_download(progress.total_bytes);
            self.bar.set_position(progress.loaded_bytes);
        } else {
            self.bar.tick();
            tracing::debug!("{}", progress.stage);
        }
    }
}

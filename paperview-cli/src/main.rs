use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use image::RgbaImage;
use paperview_core::{
    DocumentBackend, DocumentProvider, FileStateStore, Highlight, StateStore, ViewerSession,
};
use paperview_overlay::{apply_highlights, TextLayer};
use paperview_render::PdfiumProvider;
use serde::{Deserialize, Serialize};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "paperview",
    version,
    about = "renders research-paper pages with an aligned, selectable text layer"
)]
struct Args {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Rasterize one page to PNG and report its text layer
    Render {
        /// Path or file:// locator of the document
        locator: String,

        /// Page to render (0-based)
        #[arg(short, long, default_value_t = 0)]
        page: usize,

        /// Zoom factor; clamped to the configured range
        #[arg(short, long)]
        scale: Option<f32>,

        /// Output PNG path
        #[arg(short, long, default_value = "page.png")]
        out: PathBuf,

        /// Highlight string to decorate wherever it appears in extracted text
        #[arg(long = "highlight")]
        highlights: Vec<String>,
    },
    /// Print the extracted text runs for one page
    Text {
        locator: String,

        /// Page to extract (0-based)
        #[arg(short, long, default_value_t = 0)]
        page: usize,
    },
    /// Print document metadata
    Info { locator: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ViewerConfig {
    min_scale: f32,
    max_scale: f32,
    default_scale: f32,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            min_scale: 0.5,
            max_scale: 3.0,
            default_scale: 1.0,
        }
    }
}

fn load_config(dirs: &ProjectDirs) -> ViewerConfig {
    let path = dirs.config_dir().join("config.toml");
    let Ok(raw) = fs::read_to_string(&path) else {
        return ViewerConfig::default();
    };
    match toml::from_str(&raw) {
        Ok(config) => config,
        Err(err) => {
            warn!(%err, path = %path.display(), "ignoring unparsable config");
            ViewerConfig::default()
        }
    }
}

fn clamp_scale(config: &ViewerConfig, requested: f32) -> f32 {
    if !requested.is_finite() || requested <= 0.0 {
        return config.default_scale;
    }
    requested.clamp(config.min_scale, config.max_scale)
}

fn init_logging(dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory at {:?}", log_dir))?;
    let appender = tracing_appender::rolling::daily(log_dir, "paperview.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false),
        )
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "paperview", "paperview")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;
    let config = load_config(&project_dirs);
    let state_dir = project_dirs.data_local_dir().join("state");
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(state_dir)?);

    match args.command {
        CliCommand::Render {
            locator,
            page,
            scale,
            out,
            highlights,
        } => render_command(store, &config, &locator, page, scale, &out, highlights).await,
        CliCommand::Text { locator, page } => text_command(&locator, page).await,
        CliCommand::Info { locator } => info_command(&locator).await,
    }
}

async fn render_command(
    store: Arc<dyn StateStore>,
    config: &ViewerConfig,
    locator: &str,
    page: usize,
    scale: Option<f32>,
    out: &PathBuf,
    highlights: Vec<String>,
) -> Result<()> {
    let provider = PdfiumProvider::from_shared()?;
    let session = ViewerSession::new(Arc::new(provider), store);
    session
        .open(locator)
        .await
        .with_context(|| format!("failed to open {locator:?}"))?;

    let scale = clamp_scale(config, scale.unwrap_or(config.default_scale));
    let output = session
        .render(page, scale)
        .await
        .with_context(|| format!("failed to render page {page}"))?
        .ok_or_else(|| anyhow!("render was superseded before completion"))?;

    let highlights: Vec<Highlight> = highlights
        .into_iter()
        .enumerate()
        .map(|(index, match_text)| Highlight {
            id: format!("cli-{index}"),
            match_text,
            color: None,
        })
        .collect();
    session.set_highlights(highlights.clone());

    let mut layer = TextLayer::build(&output);
    let decorated = apply_highlights(&mut layer.nodes, &highlights);

    let image = RgbaImage::from_raw(
        output.bitmap.width,
        output.bitmap.height,
        output.bitmap.pixels.clone(),
    )
    .ok_or_else(|| anyhow!("bitmap dimensions do not match pixel buffer"))?;
    image
        .save(out)
        .with_context(|| format!("failed to write {:?}", out))?;

    println!(
        "page {page} at {scale:.2}x -> {}x{} px, {} text runs, {} highlighted, saved to {}",
        layer.width,
        layer.height,
        layer.nodes.len(),
        decorated,
        out.display()
    );
    session.close();
    Ok(())
}

async fn text_command(locator: &str, page: usize) -> Result<()> {
    let provider = PdfiumProvider::from_shared()?;
    let backend = provider
        .open(locator)
        .await
        .with_context(|| format!("failed to open {locator:?}"))?;
    let runs = backend.text_runs(page).await?;
    for run in &runs {
        println!(
            "[{:>4}] ({:>7.1}, {:>7.1}) {:?}",
            run.source_index, run.transform[4], run.transform[5], run.text
        );
    }
    println!("{} text runs on page {page}", runs.len());
    Ok(())
}

async fn info_command(locator: &str) -> Result<()> {
    let provider = PdfiumProvider::from_shared()?;
    let backend = provider
        .open(locator)
        .await
        .with_context(|| format!("failed to open {locator:?}"))?;
    let info = backend.info();
    println!("locator:    {}", info.locator);
    println!("id:         {}", info.id);
    println!("pages:      {}", info.page_count);
    if let Some(title) = &info.metadata.title {
        println!("title:      {title}");
    }
    if let Some(author) = &info.metadata.author {
        println!("author:     {author}");
    }
    if !info.metadata.keywords.is_empty() {
        println!("keywords:   {}", info.metadata.keywords.join(", "));
    }
    Ok(())
}

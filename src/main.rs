use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use crosspoint_send::core::{
    DiscoveryClient, ProgressReporter, TransferStatus, UploadRequest, UploadResult, Uploader,
};
use crosspoint_send::device::DeviceFiles;
use crosspoint_send::epub::{ArchiveRewriter, RewriteOptions, default_output_path};
use crosspoint_send::logging::{self, LogConfig, format_bytes};
use crosspoint_send::simulator::{Behavior, DeviceSimulator, SimulatorConfig};
use crosspoint_send::{config, context};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "crosspoint-send")]
#[command(about = "Send EPUB books to a CrossPoint e-reader over WiFi", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./crosspoint.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload one or more EPUB files
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Look for a device on the local network
    Discover,
    /// Rewrite an EPUB locally without uploading it
    Convert {
        file: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List EPUB files stored on the device
    List {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Download a file from the device
    Get {
        /// Device path, e.g. /books/a.epub
        path: String,
        /// Local destination; defaults to the file name in the current directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete files from the device
    Delete {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Run a simulated device
    Simulate(SimulateArgs),
    /// Print the effective configuration
    Config,
}

/// Command-line layer of the configuration. Unset flags are skipped so the
/// file and environment layers show through.
#[derive(Args, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    json_logs: Option<bool>,

    #[command(flatten)]
    device: DeviceOverrides,

    #[command(flatten)]
    discovery: DiscoveryOverrides,

    #[command(flatten)]
    conversion: ConversionOverrides,
}

#[derive(Args, Serialize)]
struct DeviceOverrides {
    /// Device address used when discovery finds nothing
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    http_port: Option<u16>,

    /// Device directory uploads land in
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    upload_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    chunk_size: Option<usize>,
}

#[derive(Args, Serialize)]
struct DiscoveryOverrides {
    #[serde(rename = "enabled", skip_serializing_if = "Option::is_none")]
    #[arg(long = "discovery", global = true, num_args = 0..=1, default_missing_value = "true")]
    discovery_enabled: Option<bool>,
}

#[derive(Args, Serialize)]
struct ConversionOverrides {
    /// Convert images to baseline JPEG before uploading
    #[serde(rename = "enabled", skip_serializing_if = "Option::is_none")]
    #[arg(long = "convert", global = true, num_args = 0..=1, default_missing_value = "true")]
    convert: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    jpeg_quality: Option<u8>,

    /// Rotate and split wide images into screen-sized pages
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    light_novel_mode: Option<bool>,
}

#[derive(Args)]
struct SimulateArgs {
    /// Directory uploaded files are stored in
    #[arg(long, default_value = "crosspoint-sim")]
    root: PathBuf,

    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    #[arg(long, default_value_t = 8181)]
    ws_port: u16,

    #[arg(long, default_value_t = 8180)]
    http_port: u16,

    /// UDP discovery port; 0 disables the responder
    #[arg(long, default_value_t = 8134)]
    discovery_port: u16,

    #[arg(long, value_enum, default_value_t = BehaviorKind::Normal)]
    behavior: BehaviorKind,

    /// Message used by the failing behaviors
    #[arg(long, default_value = "simulated failure")]
    error_message: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum BehaviorKind {
    Normal,
    RejectStart,
    FailAfterUpload,
    Silent,
}

impl SimulateArgs {
    fn into_config(self) -> SimulatorConfig {
        let behavior = match self.behavior {
            BehaviorKind::Normal => Behavior::Normal,
            BehaviorKind::RejectStart => Behavior::RejectStart(self.error_message),
            BehaviorKind::FailAfterUpload => Behavior::FailAfterUpload(self.error_message),
            BehaviorKind::Silent => Behavior::Silent,
        };
        SimulatorConfig {
            root: self.root,
            bind: self.bind,
            ws_port: self.ws_port,
            http_port: self.http_port,
            discovery_port: (self.discovery_port != 0).then_some(self.discovery_port),
            behavior,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))?;
    logging::init(LogConfig::from_config(&config));

    let ctx = context::AppContext::new(config);
    let shutdown = ctx.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, shutting down");
            shutdown.cancel();
        }
    });

    match cli.command {
        Commands::Upload { files } => run_upload(ctx, files).await.context("Upload failed")?,
        Commands::Discover => run_discover(ctx).await?,
        Commands::Convert { file, output } => {
            run_convert(ctx, file, output).await.context("Conversion failed")?
        }
        Commands::List { path } => run_list(ctx, path).await.context("Listing failed")?,
        Commands::Get { path, output } => run_get(ctx, path, output).await.context("Download failed")?,
        Commands::Delete { paths } => run_delete(ctx, paths).await.context("Delete failed")?,
        Commands::Simulate(args) => run_simulate(ctx, args).await?,
        Commands::Config => print!("{}", ctx.config.to_toml()?),
    }

    Ok(())
}

async fn run_upload(ctx: context::AppContext, files: Vec<PathBuf>) -> Result<()> {
    let upload_path = ctx.config.device.upload_path.clone();
    let chunk_size = ctx.config.device.chunk_size;
    let uploader = Uploader::new(ctx.clone());
    let mut failures = 0usize;

    for file in files {
        let request = UploadRequest::new(&file, upload_path.as_str(), chunk_size)
            .context("chunk size must be greater than 0")?;

        let (tx, rx) = mpsc::channel(64);
        let printer = tokio::spawn(print_progress(rx));
        let report = uploader.upload(request, ProgressReporter::new(tx)).await;
        let _ = printer.await;

        if let Some(conversion) = &report.conversion {
            let stats = &conversion.stats;
            println!(
                "  converted {} image(s), {} -> {}",
                stats.images_converted,
                format_bytes(stats.original_size),
                format_bytes(stats.new_size)
            );
        }

        match &report.result {
            UploadResult::Done => println!(
                "{} -> {} ({})",
                file.display(),
                report.device_path,
                format_bytes(report.bytes_sent)
            ),
            UploadResult::Failed(reason) => {
                failures += 1;
                match &report.error {
                    Some(e) => eprintln!("{}: failed ({})", file.display(), e),
                    None => eprintln!("{}: failed ({})", file.display(), reason),
                }
            }
            UploadResult::Cancelled => {
                eprintln!("{}: cancelled", file.display());
                bail!("cancelled");
            }
        }
    }

    if failures > 0 {
        bail!("{} upload(s) failed", failures);
    }
    Ok(())
}

async fn print_progress(mut rx: mpsc::Receiver<TransferStatus>) {
    let mut last_pct = None;
    while let Some(status) = rx.recv().await {
        match status {
            TransferStatus::Converting { file } => println!("Converting {}", file),
            TransferStatus::InProgress {
                percentage,
                current_file,
                ..
            } => {
                if last_pct != Some(percentage) {
                    last_pct = Some(percentage);
                    eprint!("\r{} {:>3}%", current_file, percentage);
                }
            }
            TransferStatus::Complete | TransferStatus::Failed(_) => {
                if last_pct.is_some() {
                    eprintln!();
                }
            }
            _ => {}
        }
    }
}

async fn run_discover(ctx: context::AppContext) -> Result<()> {
    let config = &ctx.config;
    let client =
        DiscoveryClient::new(config.discovery.clone()).with_host(config.device.host.clone());

    match client.discover().await {
        Some(endpoint) => println!("Found device at {}", endpoint),
        None => {
            println!(
                "No device answered; configured address is {}:{}",
                config.device.host, config.device.port
            );
        }
    }
    Ok(())
}

async fn run_convert(ctx: context::AppContext, file: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let mut options = RewriteOptions::from_config(&ctx.config.conversion);
    options.enabled = true;
    let dest = output.unwrap_or_else(|| default_output_path(&file));

    let source = file.clone();
    let target = dest.clone();
    let report = tokio::task::spawn_blocking(move || {
        ArchiveRewriter::new(options).try_rewrite(&source, &target)
    })
    .await
    .context("Conversion task panicked")??;

    for image in &report.images {
        info!(
            path = %image.asset.archive_path,
            outcome = ?image.outcome,
            "Image"
        );
    }

    let stats = &report.stats;
    println!(
        "{} -> {}: {} converted, {} skipped, {} failed, {} page(s) added, {} -> {}",
        file.display(),
        report.output.display(),
        stats.images_converted,
        stats.images_skipped,
        stats.images_failed,
        stats.pages_added,
        format_bytes(stats.original_size),
        format_bytes(stats.new_size)
    );
    Ok(())
}

async fn device_files(ctx: &context::AppContext) -> Result<DeviceFiles> {
    let endpoint = Uploader::new(ctx.clone()).resolve_endpoint().await;
    let mut device = ctx.config.device.clone();
    device.host = endpoint.host;
    Ok(DeviceFiles::from_config(&device)?)
}

async fn run_get(ctx: context::AppContext, path: String, output: Option<PathBuf>) -> Result<()> {
    let output = match output {
        Some(output) => output,
        None => {
            let name = path.rsplit('/').next().filter(|n| !n.is_empty());
            PathBuf::from(name.context("Device path has no file name")?)
        }
    };

    let client = device_files(&ctx).await?;
    let mut file = tokio::fs::File::create(&output)
        .await
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let written = match client.download(&path, &mut file).await {
        Ok(written) => written,
        Err(e) => {
            drop(file);
            let _ = tokio::fs::remove_file(&output).await;
            return Err(e.into());
        }
    };

    println!("{} -> {} ({})", path, output.display(), format_bytes(written));
    Ok(())
}

async fn run_list(ctx: context::AppContext, path: String) -> Result<()> {
    let client = device_files(&ctx).await?;
    let books = client.list_books(&path).await?;

    for book in &books {
        println!("{:>10}  {}", format_bytes(book.size), book.path);
    }
    println!("{} book(s)", books.len());
    Ok(())
}

async fn run_delete(ctx: context::AppContext, paths: Vec<String>) -> Result<()> {
    let report = Uploader::new(ctx).delete(&paths).await?;

    for path in &report.deleted {
        println!("deleted {}", path);
    }
    for (path, reason) in &report.failed {
        eprintln!("{}: {}", path, reason);
    }

    if !report.failed.is_empty() {
        bail!("{} file(s) could not be deleted", report.failed.len());
    }
    Ok(())
}

async fn run_simulate(ctx: context::AppContext, args: SimulateArgs) -> Result<()> {
    let handle = DeviceSimulator::new(args.into_config())
        .start()
        .await
        .context("Failed to start simulator")?;

    println!("WebSocket: ws://{}/", handle.ws_addr);
    println!("HTTP:      http://{}/api/files", handle.http_addr);
    if let Some(addr) = handle.discovery_addr {
        println!("Discovery: udp://{}", addr);
    }
    println!("Storing files in {}", handle.root().display());

    ctx.shutdown.cancelled().await;

    let stats = handle.stats();
    handle.shutdown().await;
    println!(
        "{} connection(s), {} upload(s), {} delete(s)",
        stats.connections,
        stats.uploads.len(),
        stats.deleted.len()
    );
    Ok(())
}

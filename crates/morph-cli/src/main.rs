use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use morph_core::{models, AgeBracket, Device, FaceOrder, Gender};
use morph_pipeline::config::{FaceSelectorMode, ProcessorKind};
use morph_pipeline::{CancelToken, Orchestrator, PipelineConfig, RunReport};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "morph", about = "Morph face-swap pipeline CLI")]
struct Cli {
    /// TOML config file; `MORPH_*` environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured processors over one target image
    Run(RunArgs),
    /// Validate the configuration and report missing models
    Check,
    /// List the model catalog
    Models {
        /// Fetch models missing from the model directory
        #[arg(long)]
        download: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Source image(s) providing the identity
    #[arg(short, long = "source")]
    sources: Vec<PathBuf>,
    /// Target image
    #[arg(short, long)]
    target: Option<PathBuf>,
    /// Output file or directory
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Comma-separated processors, applied in order
    #[arg(long, value_delimiter = ',')]
    processors: Option<Vec<ProcessorKind>>,
    /// Execution device (cpu, cuda, tensorrt, coreml, directml, rocm, openvino)
    #[arg(long)]
    device: Option<Device>,
    #[arg(long)]
    face_selector_mode: Option<FaceSelectorMode>,
    #[arg(long)]
    reference_face_position: Option<usize>,
    #[arg(long)]
    reference_face_distance: Option<f32>,
    #[arg(long)]
    face_detector_size: Option<usize>,
    #[arg(long)]
    face_detector_score: Option<f32>,
    #[arg(long)]
    face_analyser_order: Option<FaceOrder>,
    #[arg(long)]
    face_analyser_age: Option<AgeBracket>,
    #[arg(long)]
    face_analyser_gender: Option<Gender>,
    #[arg(long)]
    face_mask_blur: Option<f32>,
    /// One to four padding percentages (top right bottom left)
    #[arg(long, num_args = 1..=4)]
    face_mask_padding: Option<Vec<u32>>,
    #[arg(long)]
    face_enhancer_blend: Option<u8>,
    #[arg(long)]
    frame_enhancer_blend: Option<u8>,
    #[arg(long)]
    output_image_quality: Option<u8>,
    /// Maximum memory in GiB, 0 for unlimited
    #[arg(long)]
    max_memory: Option<u64>,
    /// Do not screen the target for unsafe content
    #[arg(long)]
    allow_nsfw: bool,
    /// Never download missing models
    #[arg(long)]
    skip_download: bool,
    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if !self.sources.is_empty() {
            config.sources = self.sources.clone();
        }
        if self.target.is_some() {
            config.target = self.target.clone();
        }
        if self.output.is_some() {
            config.output = self.output.clone();
        }
        if let Some(processors) = &self.processors {
            config.processors = processors.clone();
        }
        config.device = self.device.or(config.device);
        if let Some(mode) = self.face_selector_mode {
            config.face_selector_mode = mode;
        }
        if let Some(position) = self.reference_face_position {
            config.reference_face_position = position;
        }
        if let Some(distance) = self.reference_face_distance {
            config.reference_face_distance = distance;
        }
        if let Some(size) = self.face_detector_size {
            config.face_detector_size = size;
        }
        if let Some(score) = self.face_detector_score {
            config.face_detector_score = score;
        }
        if let Some(order) = self.face_analyser_order {
            config.face_analyser_order = order;
        }
        config.face_analyser_age = self.face_analyser_age.or(config.face_analyser_age);
        config.face_analyser_gender = self.face_analyser_gender.or(config.face_analyser_gender);
        if let Some(blur) = self.face_mask_blur {
            config.face_mask_blur = blur;
        }
        if let Some(padding) = &self.face_mask_padding {
            config.face_mask_padding = padding.clone();
        }
        if let Some(blend) = self.face_enhancer_blend {
            config.face_enhancer_blend = blend;
        }
        if let Some(blend) = self.frame_enhancer_blend {
            config.frame_enhancer_blend = blend;
        }
        if let Some(quality) = self.output_image_quality {
            config.output_image_quality = quality;
        }
        if let Some(gib) = self.max_memory {
            config.max_memory = gib;
        }
        if self.allow_nsfw {
            config.skip_nsfw = false;
        }
        config.skip_download |= self.skip_download;
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Run(args) => {
            args.apply(&mut config);
            let report = run(config).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
            } else {
                print_report(&report);
            }
            Ok(if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Check => check(&config),
        Commands::Models { download } => list_models(&config, download),
    }
}

/// Drive one run on a blocking thread; Ctrl-C cancels between stages.
async fn run(config: PipelineConfig) -> Result<RunReport> {
    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();
    let mut worker = tokio::task::spawn_blocking(move || {
        let mut orchestrator = Orchestrator::from_config(&config);
        orchestrator.run(&config, &worker_cancel)
    });

    tokio::select! {
        report = &mut worker => Ok(report?),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::warn!("interrupt received, cancelling after the current stage");
            cancel.cancel();
            Ok(worker.await?)
        }
    }
}

fn report_json(report: &RunReport) -> serde_json::Value {
    serde_json::json!({
        "run_id": report.run_id.to_string(),
        "state": format!("{:?}", report.state).to_lowercase(),
        "aborted_in": report.aborted_in.map(|s| format!("{s:?}").to_lowercase()),
        "reason": report.reason.as_ref().map(ToString::to_string),
        "output": report.output.as_ref().map(|p| p.display().to_string()),
        "device": report.device.as_str(),
        "applied": report.applied.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
    })
}

fn print_report(report: &RunReport) {
    match (&report.reason, &report.output) {
        (None, Some(output)) => println!("{}", output.display()),
        (Some(reason), _) => {
            eprintln!("run {} aborted: {reason}", report.run_id);
        }
        (None, None) => eprintln!("run {} produced no output", report.run_id),
    }
}

fn check(config: &PipelineConfig) -> Result<ExitCode> {
    config.validate_settings().context("invalid configuration")?;
    println!("Config:     ok");
    if config.processors.contains(&ProcessorKind::FaceSwapper) && config.sources.is_empty() {
        println!("  warning   no source images configured; pass --source to `morph run`");
    }
    println!(
        "Device:     {}",
        config.device.map(|d| d.to_string()).unwrap_or_else(|| "from last run".into())
    );
    println!(
        "Processors: {}",
        config
            .processors
            .iter()
            .map(ProcessorKind::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("Models:     {}", config.model_dir.display());

    let missing: Vec<_> = models::catalog()
        .iter()
        .filter(|spec| !spec.path_in(&config.model_dir).exists())
        .collect();
    for spec in &missing {
        println!("  missing   {} ({})", spec.id, spec.file);
    }
    Ok(if missing.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn list_models(config: &PipelineConfig, download: bool) -> Result<ExitCode> {
    let mut failed = false;
    for spec in models::catalog() {
        let present = spec.path_in(&config.model_dir).exists();
        let status = if present {
            "present".to_string()
        } else if download {
            match models::ensure_asset(spec, &config.model_dir, false) {
                Ok(_) => "downloaded".to_string(),
                Err(e) => {
                    failed = true;
                    format!("failed: {e}")
                }
            }
        } else {
            "missing".to_string()
        };
        println!("{:<22} {:<16} {}", spec.id, format!("{:?}", spec.role), status);
    }
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

use std::{
    io::{self, IsTerminal, Write},
    path::PathBuf,
    process::ExitCode,
    time::Instant,
};

use clap::Parser;
use imagegen_rs_core::{
    generate, GenerationConfig, GenerationRequest, ModelDType, Pipeline, TokenSource,
    DEFAULT_BASE_CHECKPOINT, DEFAULT_GUIDANCE_SCALE, DEFAULT_IMAGE_SIZE, DEFAULT_STEPS,
    DEFAULT_TOKENIZER,
};
use serde::Serialize;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

/// Generate one image from a text prompt with fine-tuned weights merged into Stable Diffusion.
///
/// Prints `{"imageData": "<base64 PNG>"}` on stdout, or `{"error": "..."}` as the last line of
/// stderr on failure.
#[derive(Parser, Debug)]
#[command(name = "imagegen", version)]
struct Args {
    /// Directory holding the fine-tuned weights at `model/pytorch_lora_weights.safetensors`.
    #[arg(long = "model_path", visible_alias = "model-path")]
    model_path: PathBuf,

    /// Text prompt.
    #[arg(long)]
    prompt: String,

    /// Number of denoising steps.
    #[arg(long, default_value_t = DEFAULT_STEPS)]
    steps: usize,

    /// Classifier-free guidance scale. Values of 1 or less disable guidance.
    #[arg(long, default_value_t = DEFAULT_GUIDANCE_SCALE)]
    guidance_scale: f64,

    /// Base checkpoint: a Hugging Face model ID or a local diffusers directory.
    #[arg(long, default_value = DEFAULT_BASE_CHECKPOINT)]
    base_checkpoint: String,

    /// Where `tokenizer.json` is read from: a Hugging Face model ID or a local directory.
    #[arg(long, default_value = DEFAULT_TOKENIZER)]
    tokenizer: String,

    /// Revision of the base checkpoint.
    #[arg(long)]
    revision: Option<String>,

    #[arg(long, default_value_t = DEFAULT_IMAGE_SIZE)]
    height: usize,

    #[arg(long, default_value_t = DEFAULT_IMAGE_SIZE)]
    width: usize,

    /// Seed for the initial noise. Random if not specified.
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_enum, default_value_t = ModelDType::F32)]
    dtype: ModelDType,

    /// Multiplier for LoRA deltas in the overlay.
    #[arg(long, default_value_t = 1.0)]
    overlay_scale: f64,

    /// Fail if any overlay key cannot be applied.
    #[arg(long)]
    strict_overlay: bool,

    /// Run on the CPU even if an accelerator is available.
    #[arg(long)]
    cpu: bool,

    /// Hugging Face token source: `literal:<token>`, `env:<var>`, `path:<file>`, `cache` or `none`.
    #[arg(long, default_value = "cache")]
    token: TokenSource,

    /// Only log warnings and hide progress bars.
    #[arg(long)]
    silent: bool,
}

impl Args {
    fn request(&self) -> GenerationRequest {
        GenerationRequest {
            model_path: self.model_path.clone(),
            prompt: self.prompt.clone(),
            config: GenerationConfig {
                steps: self.steps,
                guidance_scale: self.guidance_scale,
                base_checkpoint: self.base_checkpoint.clone(),
                tokenizer: self.tokenizer.clone(),
                revision: self.revision.clone(),
                height: self.height,
                width: self.width,
                seed: self.seed,
                dtype: self.dtype,
                overlay_scale: self.overlay_scale,
                strict_overlay: self.strict_overlay,
                cpu: self.cpu,
            },
        }
    }
}

#[derive(Serialize)]
struct ImageOutput {
    #[serde(rename = "imageData")]
    image_data: String,
}

#[derive(Serialize)]
struct ErrorOutput {
    error: String,
}

fn emit<W: Write, T: Serialize>(mut out: W, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut out, value)?;
    writeln!(out)?;
    out.flush()
}

fn run(args: &Args) -> anyhow::Result<ImageOutput> {
    let start = Instant::now();
    let token = args.token.clone();
    let image = generate(
        &args.request(),
        |cfg| Pipeline::from_config(cfg, token, args.silent),
        args.silent,
    )?;
    info!(
        "image generation took: {:.2}s",
        start.elapsed().as_secs_f32()
    );
    Ok(ImageOutput {
        image_data: image.to_base64(),
    })
}

/// Progress chatter is only useful to a person watching the terminal.
fn default_level(silent: bool, interactive: bool) -> LevelFilter {
    if silent || !interactive {
        LevelFilter::WARN
    } else {
        LevelFilter::INFO
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = default_level(args.silent, io::stderr().is_terminal());
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match run(&args) {
        Ok(output) => match emit(io::stdout().lock(), &output) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                let _ = emit(
                    io::stderr().lock(),
                    &ErrorOutput {
                        error: format!("failed to write image: {e}"),
                    },
                );
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            let _ = emit(
                io::stderr().lock(),
                &ErrorOutput {
                    error: format!("{e:#}"),
                },
            );
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Args::command().debug_assert();
    }

    #[test]
    fn both_required_flags_are_needed() {
        assert!(Args::try_parse_from(["imagegen", "--prompt", "a cat"]).is_err());
        assert!(Args::try_parse_from(["imagegen", "--model_path", "m"]).is_err());
    }

    #[test]
    fn defaults_match_the_core_config() {
        let args =
            Args::try_parse_from(["imagegen", "--model-path", "m", "--prompt", "a cat"]).unwrap();
        let request = args.request();
        assert_eq!(request.model_path, PathBuf::from("m"));
        assert_eq!(request.prompt, "a cat");
        assert_eq!(request.config, GenerationConfig::default());
        assert_eq!(args.token, TokenSource::HubCache);
    }

    #[test]
    fn parses_overrides() {
        let args = Args::try_parse_from([
            "imagegen",
            "--model_path",
            "m",
            "--prompt",
            "a cat",
            "--steps",
            "12",
            "--guidance-scale",
            "3",
            "--seed",
            "9",
            "--dtype",
            "bf16",
            "--strict-overlay",
            "--token",
            "env:HF_TOKEN",
        ])
        .unwrap();
        let cfg = args.request().config;
        assert_eq!(cfg.steps, 12);
        assert_eq!(cfg.guidance_scale, 3.);
        assert_eq!(cfg.seed, Some(9));
        assert_eq!(cfg.dtype, ModelDType::BF16);
        assert!(cfg.strict_overlay);
        assert_eq!(args.token, TokenSource::EnvVar("HF_TOKEN".to_string()));
    }

    #[test]
    fn info_logs_only_on_an_interactive_stderr() {
        assert_eq!(default_level(false, true), LevelFilter::INFO);
        assert_eq!(default_level(false, false), LevelFilter::WARN);
        assert_eq!(default_level(true, true), LevelFilter::WARN);
        assert_eq!(default_level(true, false), LevelFilter::WARN);
    }

    #[test]
    fn outputs_serialize_with_expected_fields() {
        let mut buf = Vec::new();
        emit(
            &mut buf,
            &ImageOutput {
                image_data: "aGk=".to_string(),
            },
        )
        .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "{\"imageData\":\"aGk=\"}\n");

        let mut buf = Vec::new();
        emit(
            &mut buf,
            &ErrorOutput {
                error: "boom".to_string(),
            },
        )
        .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "{\"error\":\"boom\"}\n");
    }
}

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use label_scan::report::render_markdown;
use label_scan::{
    build_request, normalize_image, normalize_response, output_schema, Config, GeminiBackend,
    NoPreviews, NormalizeSettings, Phase, RawFile, ScanController, INSTRUCTION,
};
use serde_json::{json, Value};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "label-scan",
    version,
    about = "Analyze packaged-food label photos for ingredients and child suitability"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// Print the response schema declared to the backend
    Schema,
    /// Print the fixed analysis instruction
    Prompt,
    /// Normalize one photo (resize + JPEG re-encode) and write the result
    Normalize(NormalizeArgs),
    /// Build the backend request body offline, without sending it
    Request(RequestArgs),
    /// Normalize a saved backend response and render the report
    Parse(ParseArgs),
    /// Stage photos, send them for analysis and render the report
    Analyze(AnalyzeArgs),
}

#[derive(Args, Debug, Clone, Copy, Default)]
struct EncodeArgs {
    /// Cap for the longer image edge in pixels (default: LABEL_SCAN_MAX_EDGE / 1024)
    #[arg(long)]
    max_edge: Option<u32>,
    /// JPEG quality 1-100 (default: LABEL_SCAN_JPEG_QUALITY / 80)
    #[arg(long)]
    quality: Option<u8>,
}

impl EncodeArgs {
    fn resolve(self, base: NormalizeSettings) -> NormalizeSettings {
        NormalizeSettings::new(
            self.max_edge.unwrap_or(base.max_edge),
            self.quality.unwrap_or(base.jpeg_quality),
        )
    }
}

#[derive(Args, Debug)]
struct NormalizeArgs {
    /// Input image path
    input: PathBuf,
    /// Output JPEG path (default: <input-stem>-normalized.jpg)
    #[arg(long)]
    out: Option<PathBuf>,
    /// Print normalization metadata JSON to stdout
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
    #[command(flatten)]
    encode: EncodeArgs,
}

#[derive(Args, Debug)]
struct RequestArgs {
    /// Label photos in capture order
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Write the request body here instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
    #[command(flatten)]
    encode: EncodeArgs,
}

#[derive(Args, Debug)]
struct ParseArgs {
    /// Saved response text file (or - for stdin)
    input: String,
    /// Print the normalized result JSON instead of Markdown
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
    /// Also write the Markdown report to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// Label photos in capture order
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Print the final pipeline snapshot JSON instead of Markdown
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
    /// Also write the Markdown report to this path
    #[arg(long)]
    report: Option<PathBuf>,
    /// Model override (default: LABEL_SCAN_MODEL / gemini-2.5-flash)
    #[arg(long)]
    model: Option<String>,
    /// Backend timeout override in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
    #[command(flatten)]
    encode: EncodeArgs,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Commands => print_commands(),
        Commands::Schema => print_json(&output_schema()),
        Commands::Prompt => {
            println!("{INSTRUCTION}");
            Ok(())
        }
        Commands::Normalize(args) => command_normalize(args),
        Commands::Request(args) => command_request(args),
        Commands::Parse(args) => command_parse(args),
        Commands::Analyze(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            runtime.block_on(command_analyze(args))
        }
    }
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({
            "name": "schema",
            "description": "Print the response schema declared to the analysis backend.",
            "needs_api_key": false
        }),
        json!({
            "name": "prompt",
            "description": "Print the fixed analysis instruction.",
            "needs_api_key": false
        }),
        json!({
            "name": "normalize",
            "description": "Resize and re-encode one photo the way it is uploaded.",
            "needs_api_key": false
        }),
        json!({
            "name": "request",
            "description": "Build the backend request body offline.",
            "needs_api_key": false
        }),
        json!({
            "name": "parse",
            "description": "Normalize a saved backend response and render the report.",
            "needs_api_key": false
        }),
        json!({
            "name": "analyze",
            "description": "Stage photos, run the analysis and render the report.",
            "needs_api_key": true
        }),
    ];
    print_json(&json!({ "commands": rows }))
}

fn command_normalize(args: NormalizeArgs) -> Result<()> {
    let config = Config::from_env();
    let settings = args.encode.resolve(config.normalize);
    let raw = fs::read(&args.input)
        .with_context(|| format!("failed to read image: {}", args.input.display()))?;
    let normalized = normalize_image(&raw, &settings)
        .with_context(|| format!("failed to normalize {}", args.input.display()))?;

    let out = args
        .out
        .unwrap_or_else(|| default_output_for(&args.input, "normalized", "jpg"));
    write_bytes_file(&out, &normalized.jpeg_bytes()?)?;

    if args.json {
        let mut payload = serde_json::to_value(&normalized)?;
        payload["inputPath"] = json!(abs_path(&args.input).display().to_string());
        payload["outputPath"] = json!(abs_path(&out).display().to_string());
        payload["inputBytes"] = json!(raw.len());
        print_json(&payload)
    } else {
        println!("{}", abs_path(&out).display());
        Ok(())
    }
}

fn command_request(args: RequestArgs) -> Result<()> {
    let config = Config::from_env();
    let settings = args.encode.resolve(config.normalize);

    let mut images = Vec::with_capacity(args.inputs.len());
    for file in read_input_files(&args.inputs)? {
        let image = normalize_image(&file.bytes, &settings)
            .with_context(|| format!("failed to normalize {}", file.name))?;
        images.push(image);
    }
    let body = build_request(&images)?.to_body();

    match args.out {
        Some(path) => {
            write_json_pretty(&path, &body)?;
            println!("{}", abs_path(&path).display());
            Ok(())
        }
        None => print_json(&body),
    }
}

fn command_parse(args: ParseArgs) -> Result<()> {
    let raw = read_text_input(&args.input)?;
    let result = normalize_response(&raw).context("backend response is unusable")?;
    let markdown = render_markdown(&result);

    if let Some(path) = &args.report {
        write_text_file(path, &markdown)?;
    }
    if args.json {
        print_json(&serde_json::to_value(&result)?)
    } else {
        print!("{markdown}");
        Ok(())
    }
}

async fn command_analyze(args: AnalyzeArgs) -> Result<()> {
    let mut config = Config::from_env();
    if let Some(model) = args.model.as_deref() {
        config.backend.model = model.trim().to_string();
    }
    if let Some(secs) = args.timeout_secs {
        config.backend.timeout = Duration::from_secs(secs.max(1));
    }
    let api_key = config
        .require_api_key()
        .map_err(|err| anyhow!(err.user_message()))?;
    let backend = GeminiBackend::new(&config.backend, api_key)?;
    let files = read_input_files(&args.inputs)?;

    let mut controller = ScanController::new(NoPreviews, args.encode.resolve(config.normalize));
    let mut updates = controller.subscribe();
    let progress = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let (phase, staged) = {
                let snapshot = updates.borrow_and_update();
                (snapshot.phase, snapshot.staged_images.len())
            };
            match phase {
                Phase::Preview => eprintln!("staged {staged} image(s)"),
                Phase::Analyzing => eprintln!("analyzing {staged} image(s)..."),
                Phase::Home | Phase::Result => {}
            }
        }
    });

    let outcome = controller.add_images(files).await;
    for (name, message) in &outcome.failed {
        eprintln!("skipped {name}: {message}");
    }
    controller.analyze(&backend).await;

    let snapshot = controller.snapshot();
    drop(controller);
    let _ = progress.await;

    let payload = json!({
        "analyzed_at": timestamp_iso(),
        "model": backend.model(),
        "inputs": args.inputs.iter().map(|p| abs_path(p).display().to_string()).collect::<Vec<String>>(),
        "snapshot": &snapshot,
    });

    let Some(result) = snapshot.result.as_ref().filter(|_| snapshot.phase == Phase::Result) else {
        if args.json {
            print_json(&payload)?;
        }
        bail!(
            "{}",
            snapshot
                .last_error
                .as_deref()
                .unwrap_or("no usable images to analyze")
        );
    };

    let markdown = render_markdown(result);
    if let Some(path) = &args.report {
        write_text_file(path, &markdown)?;
    }
    if args.json {
        print_json(&payload)
    } else {
        print!("{markdown}");
        Ok(())
    }
}

fn read_input_files(paths: &[PathBuf]) -> Result<Vec<RawFile>> {
    paths
        .iter()
        .map(|path| {
            let bytes = fs::read(path)
                .with_context(|| format!("failed to read image: {}", path.display()))?;
            let name = path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("image")
                .to_string();
            Ok(RawFile::new(name, bytes))
        })
        .collect()
}

fn read_text_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read response from stdin")?;
        return Ok(buf);
    }
    fs::read_to_string(path).with_context(|| format!("failed to read response file: {path}"))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn write_text_file(path: &Path, content: &str) -> Result<()> {
    ensure_parent_dir(path)?;
    fs::write(path, content).with_context(|| format!("failed to write text: {}", path.display()))
}

fn write_bytes_file(path: &Path, content: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;
    fs::write(path, content).with_context(|| format!("failed to write file: {}", path.display()))
}

fn write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    ensure_parent_dir(path)?;
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).with_context(|| format!("failed to write JSON: {}", path.display()))?;
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory: {}", parent.display())
            })?;
        }
    }
    Ok(())
}

fn default_output_for(path: &Path, suffix: &str, extension: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output")
        .to_string();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    parent.join(format!("{stem}-{suffix}.{extension}"))
}

fn abs_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(path)
}

fn timestamp_iso() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_output_sits_next_to_input() {
        let out = default_output_for(Path::new("shots/label.HEIC.png"), "normalized", "jpg");
        assert_eq!(out, PathBuf::from("shots/label.HEIC-normalized.jpg"));
        let bare = default_output_for(Path::new("front.png"), "normalized", "jpg");
        assert_eq!(bare, PathBuf::from("front-normalized.jpg"));
    }

    #[test]
    fn writes_text_into_missing_directories() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("reports").join("scan.md");
        write_text_file(&target, "# ok\n").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "# ok\n");
    }

    #[test]
    fn writes_json_pretty() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a").join("request.json");
        write_json_pretty(&target, &json!({"ok": true})).unwrap();
        let parsed: Value = serde_json::from_str(&fs::read_to_string(&target).unwrap()).unwrap();
        assert_eq!(parsed["ok"], true);
    }

    #[test]
    fn reads_input_files_in_given_order() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("front.jpg");
        let second = dir.path().join("back.jpg");
        fs::write(&first, b"one").unwrap();
        fs::write(&second, b"two").unwrap();

        let files = read_input_files(&[second.clone(), first.clone()]).unwrap();

        assert_eq!(files[0].name, "back.jpg");
        assert_eq!(files[0].bytes, b"two");
        assert_eq!(files[1].name, "front.jpg");
        assert!(read_input_files(&[dir.path().join("missing.jpg")]).is_err());
    }

    #[test]
    fn reads_saved_response_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("response.txt");
        fs::write(&path, "{\"productName\":\"X\"}").unwrap();
        let raw = read_text_input(path.to_str().unwrap()).unwrap();
        assert_eq!(normalize_response(&raw).unwrap().product_name, "X");
    }

    #[test]
    fn encode_flags_override_configured_settings() {
        let base = NormalizeSettings::new(1024, 80);
        let args = EncodeArgs {
            max_edge: Some(640),
            quality: None,
        };
        assert_eq!(args.resolve(base), NormalizeSettings::new(640, 80));
        assert_eq!(EncodeArgs::default().resolve(base), base);
    }

    #[test]
    fn cli_requires_at_least_one_photo() {
        assert!(Cli::try_parse_from(["label-scan", "analyze"]).is_err());
        let cli = Cli::try_parse_from([
            "label-scan",
            "analyze",
            "a.jpg",
            "b.jpg",
            "--max-edge",
            "800",
            "--json",
        ])
        .unwrap();
        match cli.command {
            Commands::Analyze(args) => {
                assert_eq!(args.inputs, vec![PathBuf::from("a.jpg"), PathBuf::from("b.jpg")]);
                assert_eq!(args.encode.max_edge, Some(800));
                assert!(args.json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

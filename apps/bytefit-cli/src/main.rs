use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Result};
use bytefit_core::{resolve_search_config, OutputFormat, OvershootPolicy, SearchOverrides};
use bytefit_runtime::{default_output_path, resize_to_target_filesize, ResizeRequest};
use bytefit_telemetry::sink_from_env;
use clap::Parser;
use regex::Regex;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(name = "bytefit", version, about = "Resize images to hit a target file size")]
struct Cli {
    /// Image file, directory, or file-name regex matched under --input-root.
    input: String,
    /// Target size such as 500KB, 1.5MB or a plain byte count.
    #[arg(value_parser = parse_target_size)]
    target: u64,
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short = 'f', value_parser = parse_format)]
    format: Option<OutputFormat>,
    #[arg(long)]
    min_dimension: Option<u32>,
    /// Skip padding the output up to the exact target size.
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    no_exact: bool,
    /// Only print output paths.
    #[arg(long, short = 'q', default_value_t = false, action = clap::ArgAction::SetTrue)]
    quiet: bool,
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    debug: bool,
    /// Output directory used when processing multiple inputs.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Root directory for regex input matching (defaults to current directory).
    #[arg(long, short = 'r')]
    input_root: Option<PathBuf>,
    /// Recurse when scanning directories / regex matches.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    recursive: bool,
    /// If set, abort the whole run on the first input error.
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    strict: bool,
    /// Never pick a candidate above the target, even when it is closer.
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    no_overshoot: bool,
    #[arg(long)]
    quality_iterations: Option<u32>,
    #[arg(long)]
    scale_iterations: Option<u32>,
    #[arg(long)]
    max_dimension: Option<u32>,
    /// Allowed distance in bytes between the output and the target.
    #[arg(long)]
    tolerance: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let total_start = Instant::now();
    let inputs = resolve_inputs(&cli)?;
    if inputs.is_empty() {
        return Err(anyhow!("no input images matched"));
    }
    let config = resolve_search_config(SearchOverrides {
        quality_iterations: cli.quality_iterations,
        scale_iterations: cli.scale_iterations,
        size_tolerance: cli.tolerance,
        max_dimension: cli.max_dimension,
        overshoot_policy: cli.no_overshoot.then_some(OvershootPolicy::Forbid),
    });
    // stdout carries the report, so progress lines go to stderr instead.
    let sink = sink_from_env(true);
    let sink_ref = sink.as_ref().map(|s| s.as_ref());

    let bulk_mode = is_bulk_input(&cli.input);
    let mut results = Vec::with_capacity(inputs.len());
    let mut failures = 0usize;
    for input_path in inputs {
        let request = ResizeRequest {
            output_path: resolve_output_for_input(&cli, bulk_mode, &input_path)?,
            format: cli.format,
            min_dimension: cli.min_dimension,
            exact_size: !cli.no_exact,
            quiet: cli.quiet,
            ..ResizeRequest::new(&input_path, cli.target)
        };
        match resize_to_target_filesize(&request, &config, sink_ref) {
            Ok(report) => {
                if cli.quiet {
                    println!("{}", report.output_path.display());
                }
                results.push(serde_json::to_value(&report)?);
            }
            Err(err) => {
                if bulk_mode && !cli.strict {
                    tracing::error!(input = %input_path.display(), error = %err, "skipping input");
                    failures += 1;
                    results.push(serde_json::json!({
                        "input": input_path,
                        "error": err.as_error_info(),
                    }));
                    continue;
                }
                return Err(anyhow!("{}: {}", input_path.display(), err));
            }
        }
    }

    if !cli.quiet {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "results": results,
                "failed": failures,
                "elapsedMs": total_start.elapsed().as_millis() as u64,
            }))?
        );
    }
    Ok(())
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.debug {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Parses `500KB`, `1.5MB`, `2GB`, `800B` or a plain byte count (1024-based).
fn parse_target_size(value: &str) -> Result<u64, String> {
    let normalized = value.trim().to_ascii_uppercase();
    if normalized.is_empty() {
        return Err("target size cannot be empty".to_string());
    }
    let invalid = || format!("invalid target size '{}': use B, KB, MB or GB suffix", value.trim());
    let (number, multiplier) = if let Some(n) = normalized.strip_suffix("KB") {
        (n, 1024.0)
    } else if let Some(n) = normalized.strip_suffix("MB") {
        (n, 1024.0 * 1024.0)
    } else if let Some(n) = normalized.strip_suffix("GB") {
        (n, 1024.0 * 1024.0 * 1024.0)
    } else if let Some(n) = normalized.strip_suffix('B') {
        (n, 1.0)
    } else {
        (normalized.as_str(), 1.0)
    };
    let amount: f64 = number.trim().parse().map_err(|_| invalid())?;
    if !amount.is_finite() || amount < 0.0 {
        return Err(invalid());
    }
    Ok((amount * multiplier) as u64)
}

fn parse_format(value: &str) -> Result<OutputFormat, String> {
    OutputFormat::from_name(value).ok_or_else(|| format!("unsupported format '{}': use jpg, jpeg, png or webp", value))
}

fn is_bulk_input(input: &str) -> bool {
    let as_path = PathBuf::from(input);
    (as_path.exists() && as_path.is_dir()) || !as_path.exists()
}

fn resolve_inputs(cli: &Cli) -> Result<Vec<PathBuf>> {
    let candidate = PathBuf::from(&cli.input);
    if candidate.exists() {
        if candidate.is_dir() {
            return collect_images_in_dir(&candidate, cli.recursive);
        }
        return Ok(vec![candidate]);
    }
    // Treat as regex matching file name under input_root.
    let root = match cli.input_root.clone() {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let re = Regex::new(&cli.input).map_err(|e| anyhow!("invalid regex: {}", e))?;
    collect_images_by_regex(&root, cli.recursive, &re)
}

fn walker(root: &Path, recursive: bool) -> WalkDir {
    if recursive {
        WalkDir::new(root)
    } else {
        WalkDir::new(root).max_depth(1)
    }
}

fn collect_images_in_dir(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let mut out: Vec<PathBuf> = walker(dir, recursive)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|p| is_supported_image(p) && !is_resized_output(p))
        .collect();
    out.sort();
    Ok(out)
}

fn collect_images_by_regex(root: &Path, recursive: bool, re: &Regex) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in walker(root, recursive).into_iter().filter_map(std::result::Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let p = entry.into_path();
        if !is_supported_image(&p) || is_resized_output(&p) {
            continue;
        }
        let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if re.is_match(name) {
            out.push(p);
        }
    }
    out.sort();
    Ok(out)
}

fn is_supported_image(path: &Path) -> bool {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    OutputFormat::from_name(ext).is_some()
}

/// Outputs of an earlier run, which would otherwise be picked up again.
fn is_resized_output(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.ends_with("_resized"))
        .unwrap_or(false)
}

/// In bulk mode `-o` names a directory unless `--output-dir` is given.
fn resolve_output_for_input(cli: &Cli, bulk_mode: bool, input_path: &Path) -> Result<Option<PathBuf>> {
    if !bulk_mode {
        return Ok(cli.output.clone());
    }
    let Some(dir) = cli.output_dir.clone().or_else(|| cli.output.clone()) else {
        return Ok(None);
    };
    let format = match cli.format {
        Some(format) => format,
        None => {
            let ext = input_path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            OutputFormat::from_name(ext).ok_or_else(|| anyhow!("cannot infer output format for {}", input_path.display()))?
        }
    };
    let file_name = default_output_path(input_path, format)
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| anyhow!("input file must include a valid file name"))?;
    Ok(Some(dir.join(file_name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_sizes_use_binary_units() {
        assert_eq!(parse_target_size("500KB"), Ok(512_000));
        assert_eq!(parse_target_size("1mb"), Ok(1_048_576));
        assert_eq!(parse_target_size(" 1.5MB "), Ok(1_572_864));
        assert_eq!(parse_target_size("2GB"), Ok(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_target_size("800B"), Ok(800));
        assert_eq!(parse_target_size("1234"), Ok(1234));
    }

    #[test]
    fn malformed_target_sizes_are_rejected() {
        assert!(parse_target_size("").is_err());
        assert!(parse_target_size("KB").is_err());
        assert!(parse_target_size("12XB").is_err());
        assert!(parse_target_size("-5KB").is_err());
        assert!(parse_target_size("infKB").is_err());
    }

    #[test]
    fn zero_and_fractional_byte_targets_round_down() {
        assert_eq!(parse_target_size("0"), Ok(0));
        assert_eq!(parse_target_size("0KB"), Ok(0));
        assert_eq!(parse_target_size("0.0001B"), Ok(0));
    }

    #[test]
    fn format_flag_accepts_aliases() {
        assert_eq!(parse_format("jpeg"), Ok(OutputFormat::Jpeg));
        assert_eq!(parse_format("JPG"), Ok(OutputFormat::Jpeg));
        assert!(parse_format("bmp").is_err());
    }

    #[test]
    fn directory_scan_skips_previous_outputs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("nested"))?;
        for name in ["a.jpg", "b.PNG", "a_resized.jpg", "notes.txt", "nested/c.webp"] {
            std::fs::write(dir.path().join(name), b"x")?;
        }
        let found = collect_images_in_dir(dir.path(), true)?;
        let names: Vec<_> = found.iter().filter_map(|p| p.file_name()?.to_str()).collect();
        assert_eq!(names, vec!["a.jpg", "b.PNG", "c.webp"]);

        let shallow = collect_images_in_dir(dir.path(), false)?;
        assert_eq!(shallow.len(), 2);

        let re = Regex::new(r"^b\.")?;
        assert_eq!(collect_images_by_regex(dir.path(), true, &re)?.len(), 1);
        Ok(())
    }

    #[test]
    fn bulk_outputs_land_in_output_dir() -> Result<()> {
        let cli = Cli::try_parse_from(["bytefit", "photos", "100KB", "--output-dir", "/out", "-f", "webp"])?;
        let output = resolve_output_for_input(&cli, true, Path::new("/photos/cat.jpg"))?;
        assert_eq!(output, Some(PathBuf::from("/out/cat_resized.webp")));

        let single = Cli::try_parse_from(["bytefit", "cat.jpg", "1MB", "-o", "small.jpg"])?;
        assert_eq!(single.target, 1_048_576);
        assert_eq!(resolve_output_for_input(&single, false, Path::new("cat.jpg"))?, Some(PathBuf::from("small.jpg")));
        Ok(())
    }
}

//! mzdiff CLI
//!
//! Command-line tool for comparing a reference DOS executable against a
//! target, optionally guided by map files.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use mzdiff::formats::guess_target_map;
use mzdiff::formatter::{HumanFormatter, JsonFormatter, ReportFormatter};
use mzdiff::{Analyzer, CodeMap, CompareOptions, DiffError, Executable, VariantTable};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Structural comparison of DOS MZ executables.
///
/// Walks both executables from their entry points and reports where the
/// target stops being instruction-for-instruction equivalent to the
/// reference. With --data, compares a data segment described by map files.
#[derive(Parser, Debug)]
#[command(name = "mzdiff")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Reference executable
    reference: PathBuf,

    /// Target executable
    target: PathBuf,

    /// Reference map file
    #[arg(long, env = "MZDIFF_MAP")]
    map: Option<PathBuf>,

    /// Target map file (default: reference map with a .tgt extension)
    #[arg(long)]
    tmap: Option<PathBuf>,

    /// Compare the named data segment instead of code
    #[arg(long, value_name = "SEGMENT")]
    data: Option<String>,

    /// Ignore differing immediate values and displacements
    #[arg(long)]
    idiff: bool,

    /// Do not check or follow call targets
    #[arg(long)]
    nocall: bool,

    /// Also compare routines marked as assembly in the map
    #[arg(long)]
    asm: bool,

    /// Do not print statistics
    #[arg(long)]
    nostat: bool,

    /// Reference instructions to skip at the first divergence of each routine
    #[arg(long, value_name = "N", default_value_t = 0)]
    rskip: usize,

    /// Target instructions to skip at the first divergence of each routine
    #[arg(long, value_name = "N", default_value_t = 0)]
    tskip: usize,

    /// Instructions of context after a code divergence
    #[arg(long, value_name = "N", default_value_t = 10)]
    ctx: usize,

    /// Hex-dump lines of context around a data divergence
    #[arg(long, value_name = "N", default_value_t = 4)]
    dctx: usize,

    /// Tolerate correspondence conflicts
    #[arg(long)]
    loose: bool,

    /// Accept instruction variants
    #[arg(long)]
    variant: bool,

    /// JSON variant dictionary replacing the built-in one
    #[arg(long, value_name = "PATH", env = "MZDIFF_VARIANTS")]
    variants: Option<PathBuf>,

    /// Allow data segments of different sizes, comparing the common part
    #[arg(long)]
    extdata: bool,

    /// Maximum data offset fan-out
    #[arg(long, value_name = "N", default_value_t = 2)]
    max_data: usize,

    /// Maximum duplicate distance in percent of the routine length
    #[arg(long, value_name = "PERCENT", default_value_t = 10)]
    dup_threshold: usize,

    /// Load segment, hexadecimal
    #[arg(long, value_name = "SEG", default_value = "0", value_parser = parse_segment)]
    load: u16,

    /// Output format
    #[arg(short, long, default_value = "human")]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Trace every compared instruction
    #[arg(long)]
    debug: bool,
}

/// Output format options.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

fn parse_segment(text: &str) -> std::result::Result<u16, String> {
    u16::from_str_radix(text.trim_start_matches("0x"), 16)
        .map_err(|e| format!("invalid segment '{}': {}", text, e))
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn init_logging(args: &Args) {
    let default = if args.debug {
        "mzdiff=trace"
    } else if args.verbose {
        "mzdiff=debug"
    } else {
        "mzdiff=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn options(args: &Args) -> CompareOptions {
    let base = if args.loose {
        CompareOptions::loose()
    } else {
        CompareOptions::strict()
    };
    CompareOptions {
        ignore_diff: args.idiff,
        no_call: args.nocall,
        check_asm: args.asm,
        no_stats: args.nostat,
        ref_skip: args.rskip,
        tgt_skip: args.tskip,
        ctx_count: args.ctx,
        data_ctx_count: args.dctx,
        variant: args.variant,
        ext_data: args.extdata,
        max_data: args.max_data,
        dup_threshold: args.dup_threshold,
        load_segment: args.load,
        ..base
    }
}

/// Target map location for a data comparison.
fn target_map_path(args: &Args) -> std::result::Result<PathBuf, DiffError> {
    if let Some(ref tmap) = args.tmap {
        return Ok(tmap.clone());
    }
    let Some(ref map) = args.map else {
        return Err(DiffError::Config {
            message: "data comparison requires a reference map (--map)".to_string(),
        });
    };
    let guess = guess_target_map(map);
    if !guess.exists() {
        return Err(DiffError::Config {
            message: format!(
                "target map not given and {} does not exist (use --tmap)",
                guess.display()
            ),
        });
    }
    Ok(guess)
}

fn load_map(path: &Path, load_segment: u16) -> Result<CodeMap> {
    let mut map =
        CodeMap::load(path).with_context(|| format!("loading map {}", path.display()))?;
    map.rebase(load_segment);
    Ok(map)
}

fn run(args: &Args) -> Result<bool> {
    let options = options(args);
    let variants = match args.variants {
        Some(ref path) => VariantTable::load(path)
            .with_context(|| format!("loading variants {}", path.display()))?,
        None => VariantTable::builtin(),
    };
    let analyzer = Analyzer::with_variants(options.clone(), variants);

    let reference = Executable::load(&args.reference, options.load_segment)
        .with_context(|| format!("loading {}", args.reference.display()))?;
    let target = Executable::load(&args.target, options.load_segment)
        .with_context(|| format!("loading {}", args.target.display()))?;

    let report = if let Some(ref segment) = args.data {
        let tmap = target_map_path(args)?;
        let ref_map = match args.map {
            Some(ref path) => load_map(path, options.load_segment)?,
            None => CodeMap::default(),
        };
        let tgt_map = load_map(&tmap, options.load_segment)?;
        analyzer.compare_data(&reference, &target, &ref_map, &tgt_map, segment)?
    } else {
        let ref_map = match args.map {
            Some(ref path) => load_map(path, options.load_segment)?,
            None => CodeMap::default(),
        };
        let tgt_map = match args.tmap {
            Some(ref path) => Some(load_map(path, options.load_segment)?),
            None => None,
        };
        analyzer.compare_code(&reference, &target, &ref_map, tgt_map.as_ref())?
    };

    let output = match args.format {
        OutputFormat::Human => {
            let formatter = if args.verbose {
                HumanFormatter::verbose()
            } else {
                HumanFormatter::new()
            };
            let formatter = if options.no_stats {
                formatter.without_stats()
            } else {
                formatter
            };
            formatter.format_report(&report, &args.reference, &args.target)
        }
        OutputFormat::Json => JsonFormatter {
            show_stats: !options.no_stats,
            ..JsonFormatter::new()
        }
        .format_report(&report, &args.reference, &args.target),
    };
    print!("{}", output);

    Ok(report.matched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::try_parse_from(["mzdiff", "a.exe", "b.exe"]).unwrap();
        assert_eq!(args.reference, PathBuf::from("a.exe"));
        assert!(!args.verbose);
        assert_eq!(options(&args), CompareOptions::strict());
    }

    #[test]
    fn test_flags_map_to_options() {
        let args = Args::try_parse_from([
            "mzdiff", "a.exe", "b.exe", "--loose", "--idiff", "--nocall", "--rskip", "2",
            "--tskip", "3", "--ctx", "5", "--max-data", "4", "--load", "1000",
        ])
        .unwrap();
        let opts = options(&args);
        assert!(!opts.strict);
        assert!(!opts.variant);
        assert!(opts.ignore_diff);
        assert!(opts.no_call);
        assert_eq!((opts.ref_skip, opts.tgt_skip, opts.ctx_count), (2, 3, 5));
        assert_eq!(opts.max_data, 4);
        assert_eq!(opts.load_segment, 0x1000);
    }

    #[test]
    fn test_loose_and_variant_are_independent() {
        let args = Args::try_parse_from(["mzdiff", "a", "b", "--loose"]).unwrap();
        let opts = options(&args);
        assert!(!opts.strict);
        assert!(!opts.variant);

        let args = Args::try_parse_from(["mzdiff", "a", "b", "--variant"]).unwrap();
        let opts = options(&args);
        assert!(opts.strict);
        assert!(opts.variant);
    }

    #[test]
    fn test_format_options() {
        let args = Args::try_parse_from(["mzdiff", "-f", "json", "a", "b"]).unwrap();
        assert!(matches!(args.format, OutputFormat::Json));
        assert!(Args::try_parse_from(["mzdiff", "a"]).is_err());
        assert!(Args::try_parse_from(["mzdiff", "a", "b", "--load", "zz"]).is_err());
    }

    #[test]
    fn test_target_map_guess() {
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("game.map");
        let arg_map = map.to_string_lossy().into_owned();
        let args =
            Args::try_parse_from(["mzdiff", "a", "b", "--data", "DATA", "--map", &arg_map]).unwrap();

        assert!(matches!(target_map_path(&args), Err(DiffError::Config { .. })));
        std::fs::write(dir.path().join("game.tgt"), "{}").unwrap();
        assert_eq!(target_map_path(&args).unwrap(), dir.path().join("game.tgt"));
    }

    #[test]
    fn test_data_requires_map() {
        let args = Args::try_parse_from(["mzdiff", "a", "b", "--data", "DATA"]).unwrap();
        assert!(matches!(target_map_path(&args), Err(DiffError::Config { .. })));
    }
}

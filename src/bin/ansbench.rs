//! File encode/decode driver with a benchmarking repeat count.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use log::{error, info, LevelFilter};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use ans_simd::{build_table, compressed_bound, decode, encode_with_table};

#[derive(Parser)]
#[command(
    name = "ansbench",
    version,
    about = "Encode or decode a file with the interleaved rANS codec"
)]
struct Cli {
    /// e9, e10 or e11 to encode at that probability resolution, d to decode
    mode: String,

    /// Timed repetitions of the codec call
    runs: u64,

    /// Input file
    infile: PathBuf,

    /// Output file; `-` writes to stdout
    outfile: Option<PathBuf>,

    /// Verbose logs (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            // Usage errors exit 1; --help and --version are not errors.
            return if err.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .ok();

    let prob_bits = match cli.mode.as_str() {
        "e9" => Some(9),
        "e10" => Some(10),
        "e11" => Some(11),
        "d" => None,
        other => {
            eprintln!("mode must be e9, e10, e11 or d, got {other:?}");
            return ExitCode::from(1);
        }
    };
    if cli.runs == 0 {
        eprintln!("RUNS must be positive");
        return ExitCode::from(1);
    }

    match run(&cli, prob_bits) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: &Cli, prob_bits: Option<u32>) -> ans_simd::Result<()> {
    let data = fs::read(&cli.infile)?;

    let (coded, verb) = match prob_bits {
        Some(pb) => {
            // Statistics are hoisted out of the timed loop.
            let table = build_table(&data, pb)?;
            let mut out = vec![0u8; compressed_bound(data.len())];
            let mut written = 0;
            let t0 = Instant::now();
            for _ in 0..cli.runs {
                written = encode_with_table(&mut out, &data, &table)?;
            }
            report(&cli.infile, data.len(), written, cli.runs, t0);
            out.truncate(written);
            (out, "encoded")
        }
        None => {
            let mut out = vec![0u8; 100 * 1024 * 1024];
            let mut written = 0;
            let t0 = Instant::now();
            for _ in 0..cli.runs {
                written = decode(&mut out, &data)?;
            }
            report(&cli.infile, data.len(), written, cli.runs, t0);
            out.truncate(written);
            (out, "decoded")
        }
    };

    if let Some(outfile) = &cli.outfile {
        if outfile.as_os_str() == "-" {
            std::io::stdout().write_all(&coded)?;
        } else {
            fs::write(outfile, &coded)?;
            info!("{verb} {} -> {}", cli.infile.display(), outfile.display());
        }
    }
    Ok(())
}

fn report(infile: &std::path::Path, in_bytes: usize, out_bytes: usize, runs: u64, t0: Instant) {
    let secs = t0.elapsed().as_secs_f64();
    let mb = (in_bytes as f64 * runs as f64) / (1024.0 * 1024.0);
    info!(
        "{}: {} -> {} bytes, {} run(s) in {:.3}s ({:.1} MB/s)",
        infile.display(),
        in_bytes,
        out_bytes,
        runs,
        secs,
        if secs > 0.0 { mb / secs } else { 0.0 }
    );
}

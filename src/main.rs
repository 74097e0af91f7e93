mod cli;

use anyhow::{Context, Result};
use bytesize::ByteSize;
use cli::expect_arg;
use env_logger::{Env, TimestampPrecision};
use log::info;
use mc2gen::{
    codegen::{threads_extract, threads_size},
    emulate::Schedule,
    harness::{write_code, Harness, HarnessOptions},
    program::load_program,
    witness::write_witness,
};
use std::{
    fs::File,
    io::{stdout, BufWriter, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

fn main() -> Result<()> {
    let matches = cli::args().get_matches();

    init_logger(expect_arg::<String>(&matches, "verbose"));

    match matches.subcommand() {
        Some(("emit", args)) => {
            let input = expect_arg::<PathBuf>(args, "input-file");
            let options = HarnessOptions {
                code_base: *expect_arg::<u64>(args, "code-base"),
                ..HarnessOptions::default()
            };

            let mut harness = load(input, &options)?;
            harness.emit()?;

            let out = output(args.get_one::<PathBuf>("output-file"))?;
            write_code(harness.code(), out)
        }
        Some(("run", args)) => {
            let input = expect_arg::<PathBuf>(args, "input-file");
            let schedule = Schedule::from_str(expect_arg::<String>(args, "schedule"))?;
            let options = HarnessOptions {
                schedule,
                memory_size: ByteSize::mib(*expect_arg::<u64>(args, "memory")),
                max_steps: *expect_arg::<u64>(args, "max-steps"),
                strict: args.get_flag("strict"),
                ..HarnessOptions::default()
            };

            let mut harness = load(input, &options)?;
            let summary = harness
                .run_epoch()
                .with_context(|| format!("failed to run {}", input.display()))?;

            info!(
                "{} observations, {} unresolved",
                summary.observations, summary.unresolved
            );

            let asms = harness.compiler().asms();
            let out = output(args.get_one::<PathBuf>("output-file"))?;
            write_witness(asms.witness(), asms.arch(), out)
        }
        _ => unreachable!(),
    }
}

fn init_logger(level: &str) {
    env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();
}

fn load(input: &Path, options: &HarnessOptions) -> Result<Harness> {
    let ops = load_program(input)?;
    let threads = threads_extract(&ops);

    info!(
        "loaded {}: {} threads, {} operations",
        input.display(),
        threads.len(),
        threads_size(&threads)
    );

    Harness::new(threads, options).context("invalid harness configuration")
}

fn output(path: Option<&PathBuf>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => Box::new(stdout()),
    })
}

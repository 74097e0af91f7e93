use clap::{
    builder::PossibleValuesParser, command, value_parser, Arg, ArgAction, ArgMatches, Command,
};
use mc2gen::emulate::Schedule;
use mc2gen::harness::defaults;
use mc2gen::util::parse_address;
use std::path::PathBuf;
use strum::VariantNames;

pub const LOGGING_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

pub fn expect_arg<'a, T>(m: &'a ArgMatches, arg: &str) -> &'a T
where
    T: Clone + Send + Sync + 'static,
{
    m.get_one::<T>(arg)
        .unwrap_or_else(|| panic!("argument \"{}\" has to be set in CLI at all times", arg))
}

fn is_valid_memory_size(v: &str) -> Result<u64, String> {
    let memory_size = v.parse::<u64>().map_err(|e| e.to_string())?;

    let valid_range = 1_u64..=1024_u64;

    if valid_range.contains(&memory_size) {
        Ok(memory_size)
    } else {
        Err(String::from("memory size has to be in range: 1 - 1024"))
    }
}

fn program_arg() -> Arg {
    Arg::new("input-file")
        .help("Test program, one operation per line")
        .value_name("FILE")
        .value_parser(value_parser!(PathBuf))
        .required(true)
}

fn output_arg() -> Arg {
    Arg::new("output-file")
        .help("Output file to write to [default: stdout]")
        .short('o')
        .long("output-file")
        .value_name("FILE")
        .value_parser(value_parser!(PathBuf))
}

pub fn args() -> Command {
    command!()
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("configure logging level to use")
                .value_name("LEVEL")
                .value_parser(LOGGING_LEVELS)
                .default_value(LOGGING_LEVELS[2])
                .global(true),
        )
        .subcommand(
            Command::new("emit")
                .about("Emit x86-64 code for every thread of a test program")
                .arg(program_arg())
                .arg(
                    Arg::new("code-base")
                        .help("Address of the code of thread 0")
                        .short('b')
                        .long("code-base")
                        .value_name("ADDRESS")
                        .value_parser(parse_address)
                        .default_value("0x400000"),
                )
                .arg(output_arg()),
        )
        .subcommand(
            Command::new("run")
                .about("Emit and execute one epoch of a test program and print its witness")
                .arg(program_arg())
                .arg(
                    Arg::new("schedule")
                        .help("Interleaving of threads during execution")
                        .short('s')
                        .long("schedule")
                        .value_name("SCHEDULE")
                        .value_parser(PossibleValuesParser::new(Schedule::VARIANTS.iter().copied()))
                        .default_value(<&str>::from(defaults::SCHEDULE)),
                )
                .arg(
                    Arg::new("memory")
                        .help("Amount of data memory in megabytes [possible_values: 1 .. 1024]")
                        .short('m')
                        .long("memory")
                        .value_name("NUMBER")
                        .value_parser(is_valid_memory_size)
                        .default_value("1"),
                )
                .arg(
                    Arg::new("max-steps")
                        .help("Number of instructions after which execution is aborted")
                        .short('d')
                        .long("max-steps")
                        .value_name("NUMBER")
                        .value_parser(value_parser!(u64))
                        .default_value("1000000"),
                )
                .arg(
                    Arg::new("strict")
                        .help("Fail on observations that resolve to no write")
                        .long("strict")
                        .action(ArgAction::SetTrue),
                )
                .arg(output_arg()),
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
}

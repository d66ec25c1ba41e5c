use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use log::{error, info};
use pico_llama_inference::{InferenceConfig, InferenceConfigBuilder, inspect_model, run_inference};

fn model_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("model")
                .help("Weight blob: 7-field header followed by f32 tensors")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("tokenizer")
                .help("Vocabulary blob with token strings and merge scores")
                .required(true)
                .index(2),
        )
        .arg(
            Arg::new("region-size")
                .long("region-size")
                .value_name("BYTES")
                .help("Size of the external memory region the model is copied into [default: 16 MiB]")
                .value_parser(clap::value_parser!(usize)),
        )
}

/// Define the generate subcommand.
fn generate_subcommand() -> Command {
    model_args(Command::new("generate").about("Generate text from a prompt"))
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .help("Temperature for sampling in [0, inf], 0 is greedy, default 1.0")
                .default_value("1.0")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("topp")
                .short('p')
                .long("topp")
                .value_name("FLOAT")
                .help("Top-p for nucleus sampling in [0,1], default 0.9")
                .default_value("0.9")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed, 0 maps to a fixed non-zero seed [default: current time]")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("steps")
                .short('n')
                .long("steps")
                .value_name("INT")
                .help("Number of positions to run, 0 = seq_len")
                .default_value("256")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("INT")
                .help("Context window size, (default) = seq_len")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("STRING")
                .help("Input prompt"),
        )
}

/// Define the inspect subcommand.
fn inspect_subcommand() -> Command {
    model_args(Command::new("inspect").about("Report the model header, blob size, capacity fit and vocabulary usage"))
}

fn base_config(matches: &ArgMatches) -> InferenceConfigBuilder {
    InferenceConfig::builder()
        .model_path(matches.get_one::<String>("model"))
        .tokenizer_path(matches.get_one::<String>("tokenizer"))
        .region_size(matches.get_one::<usize>("region-size").copied())
}

/// Run the generate command with the provided arguments
fn run_generate_command(matches: &ArgMatches) -> Result<()> {
    let config = base_config(matches)
        .temperature(matches.get_one::<f32>("temperature").copied())
        .topp(matches.get_one::<f32>("topp").copied())
        .steps(matches.get_one::<usize>("steps").copied())
        .ctx_length(matches.get_one::<usize>("context").copied())
        .prompt(matches.get_one::<String>("input"))
        .seed(matches.get_one::<u64>("seed").copied())
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    let report = run_inference(config).map_err(|e| anyhow::anyhow!("Inference failed: {e:#}"))?;

    info!(
        "Prompt tokens: {}, positions: {}, generated: {}{}",
        report.prompt_tokens,
        report.positions,
        report.generated,
        if report.stopped_on_bos { " (stopped on BOS)" } else { "" }
    );

    Ok(())
}

/// Run the inspect command with the provided arguments
fn run_inspect_command(matches: &ArgMatches) -> Result<()> {
    let config = base_config(matches).build().map_err(|e| anyhow::anyhow!(e))?;

    inspect_model(&config).map_err(|e| anyhow::anyhow!("Inspection failed: {e:#}"))
}

fn execute_commands() -> Result<()> {
    // Clean format (no timestamp/module prefix), info unless RUST_LOG says otherwise
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("pico-llama")
        .about("pico-llama CLI: llama2 inference within fixed, microcontroller-sized memory bounds")
        .subcommand(generate_subcommand())
        .subcommand(inspect_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("generate", matches)) => run_generate_command(matches),
        Some(("inspect", matches)) => run_inspect_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e}");
        std::process::exit(1);
    }
}

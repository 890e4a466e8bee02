use std::path::PathBuf;

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use dreams_inference::{InferenceConfigBuilder, run_encode, run_inference};
use log::{error, info};

/// Define the generate subcommand.
fn generate_subcommand() -> Command {
    Command::new("generate")
        .about("Generate text from a llama2-style checkpoint")
        .arg(
            Arg::new("checkpoint")
                .help("Model checkpoint file")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .index(1),
        )
        .arg(
            Arg::new("tokenizer")
                .short('z')
                .long("tokenizer")
                .value_name("PATH")
                .help("Vocabulary file, (default) = tok512.bin next to the checkpoint")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .help("Temperature for sampling in (0, 2], default 0.7")
                .default_value("0.7")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("topp")
                .short('p')
                .long("topp")
                .value_name("FLOAT")
                .help("Top-p for nucleus sampling in [0,1], default 0.8")
                .default_value("0.8")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("steps")
                .short('n')
                .long("steps")
                .value_name("INT")
                .help("Number of steps to run, 0 = max_seq_len [default: 1024]")
                .default_value("1024")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed, (default) = current time")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("INT")
                .help("Context window size, (default) = max_seq_len")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(Arg::new("input").short('i').long("input").value_name("STRING").help("Input prompt"))
}

/// Define the encode subcommand.
fn encode_subcommand() -> Command {
    Command::new("encode")
        .about("Print the token ids of a text")
        .arg(
            Arg::new("checkpoint")
                .help("Model checkpoint file, only its header is read")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .index(1),
        )
        .arg(Arg::new("text").help("Text to encode").required(true).index(2))
        .arg(
            Arg::new("tokenizer")
                .short('z')
                .long("tokenizer")
                .value_name("PATH")
                .help("Vocabulary file, (default) = tok512.bin next to the checkpoint")
                .value_parser(clap::value_parser!(PathBuf)),
        )
}

/// Run the generate command with the provided arguments
fn run_generate_command(matches: &ArgMatches) -> Result<()> {
    let config = InferenceConfigBuilder::default()
        .checkpoint_path(matches.get_one::<PathBuf>("checkpoint"))
        .tokenizer_path(matches.get_one::<PathBuf>("tokenizer"))
        .temperature(matches.get_one::<f32>("temperature").copied())
        .topp(matches.get_one::<f32>("topp").copied())
        .steps(matches.get_one::<usize>("steps").copied())
        .ctx_length(matches.get_one::<usize>("context").copied())
        .prompt(matches.get_one::<String>("input"))
        .seed(matches.get_one::<u64>("seed").copied())
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    let generation = run_inference(config).map_err(|e| anyhow::anyhow!("Inference failed: {e:#}"))?;
    info!("Generated {} tokens, {} bytes of text", generation.tokens.len(), generation.text.len());

    Ok(())
}

/// Run the encode command with the provided arguments
fn run_encode_command(matches: &ArgMatches) -> Result<()> {
    let checkpoint = matches.get_one::<PathBuf>("checkpoint").ok_or_else(|| anyhow::anyhow!("Missing checkpoint"))?;
    let text = matches.get_one::<String>("text").ok_or_else(|| anyhow::anyhow!("Missing text"))?;
    let tokenizer = matches
        .get_one::<PathBuf>("tokenizer")
        .cloned()
        .unwrap_or_else(|| checkpoint.with_file_name(dreams_inference::DEFAULT_TOKENIZER_FILE));

    let tokens = run_encode(checkpoint, &tokenizer, text)?;
    let ids: Vec<String> = tokens.iter().map(ToString::to_string).collect();
    println!("{}", ids.join(" "));

    Ok(())
}

fn execute_commands() -> Result<()> {
    // Initialize logger with clean format (no timestamp/module prefix)
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("dreams")
        .about("Dreams CLI: tiny llama2 text generation with a two-lane fork/join forward pass")
        .subcommand(generate_subcommand())
        .subcommand(encode_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("generate", matches)) => run_generate_command(matches),
        Some(("encode", matches)) => run_encode_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}

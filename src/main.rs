use clap::{Arg, ArgMatches, Command};
use segtile::utils::init_tracing;
use segtile::{runner, EvalConfig, PredictorRegistry};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

fn interface() -> ArgMatches {
    Command::new("segtile")
        .about("Sliding-window multi-scale inference and evaluation for segmentation models")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("CONFIG_PATH")
                .help("Sets the JSON run configuration")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("opts")
                .value_name("KEY VALUE")
                .help("Overrides config entries, e.g. `scales [0.75,1.0,1.25]`")
                .num_args(0..)
                .trailing_var_arg(true)
                .allow_hyphen_values(true)
                .value_parser(clap::value_parser!(String)),
        )
        .get_matches()
}

fn try_main(arg_matches: &ArgMatches) -> segtile::Result<()> {
    let config_path = arg_matches
        .get_one::<PathBuf>("config")
        .ok_or_else(|| segtile::SegError::config("--config is required"))?;
    let opts: Vec<String> = arg_matches
        .get_many::<String>("opts")
        .map(|vals| vals.cloned().collect())
        .unwrap_or_default();

    let cfg = EvalConfig::load(config_path, &opts)?;
    runner::run(cfg, &PredictorRegistry::default())?;
    Ok(())
}

fn main() -> ExitCode {
    let arg_matches = interface();
    init_tracing();

    match try_main(&arg_matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let mut chain = err.to_string();
            let mut source = err.source();
            while let Some(cause) = source {
                chain.push_str(&format!(": {cause}"));
                source = cause.source();
            }
            tracing::error!("{chain}");
            ExitCode::FAILURE
        }
    }
}

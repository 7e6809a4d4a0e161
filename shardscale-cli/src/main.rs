use std::io::stdout;

use anyhow::Result;
use clap::{crate_version, value_parser, Arg, Command};
use clap_complete::Shell;

pub mod config;

pub mod model;

pub mod progress;

mod subcommands;

pub mod traits;
use traits::ShardScaleApp;

fn main() -> Result<()> {
    // Known subapplications.
    let apps = vec![
        subcommands::SimulateApp::app(),
        subcommands::StateApp::app(),
    ];

    env_logger::init();

    let cli = Command::new("shardscale")
        .arg_required_else_help(true)
        .subcommand_required(true)
        .about("Shard-aware gradient scaling")
        .version(crate_version!())
        .subcommands(apps)
        .subcommand(
            Command::new("completions")
                .about("Generate completion scripts for your shell")
                .arg_required_else_help(true)
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(value_parser!(Shell)),
                ),
        );
    let matches = cli.clone().get_matches();

    match matches.subcommand() {
        Some(("completions", matches)) => {
            let shell = *matches.get_one::<Shell>("shell").unwrap();
            write_completion_script(cli, shell);
            Ok(())
        }
        Some(("simulate", matches)) => subcommands::SimulateApp::parse(matches)?.run(),
        Some(("state", matches)) => subcommands::StateApp::parse(matches)?.run(),
        _unknown => unreachable!(),
    }
}

fn write_completion_script(mut cli: Command, shell: Shell) {
    clap_complete::generate(shell, &mut cli, "shardscale", &mut stdout());
}

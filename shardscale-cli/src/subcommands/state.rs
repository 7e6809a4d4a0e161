use std::io::BufRead;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use shardscale::state::ScalerState;
use stdinout::Input;

use crate::traits::ShardScaleApp;

const INPUT: &str = "INPUT";

pub struct StateApp {
    input: Option<String>,
}

/// Read a scaler state that was saved as JSON.
///
/// A state of `null` is the state of a disabled scaler.
pub fn read_state(read: impl BufRead) -> Result<Option<ScalerState>> {
    serde_json::from_reader(read).context("Cannot deserialize scaler state")
}

impl ShardScaleApp for StateApp {
    fn app() -> Command {
        Command::new("state")
            .about("Print a saved gradient scaler state")
            .arg(
                Arg::new(INPUT)
                    .help("Scaler state (JSON), read from stdin when absent")
                    .index(1),
            )
    }

    fn parse(matches: &ArgMatches) -> Result<Self> {
        let input = matches.get_one::<String>(INPUT).map(ToOwned::to_owned);

        Ok(StateApp { input })
    }

    fn run(&self) -> Result<()> {
        let input = Input::from(self.input.as_ref());
        let state = read_state(input.buf_read().context("Cannot open scaler state")?)?;

        match state {
            Some(state) => {
                println!("scale: {}", state.scale);
                println!("growth factor: {}", state.growth_factor);
                println!("backoff factor: {}", state.backoff_factor);
                println!("growth interval: {}", state.growth_interval);
                println!("growth tracker: {}", state.growth_tracker);
            }
            None => println!("Gradient scaling disabled"),
        }

        Ok(())
    }
}

use anyhow::Result;
use clap::{ArgMatches, Command};

pub trait ShardScaleApp
where
    Self: Sized,
{
    fn app() -> Command;

    fn parse(matches: &ArgMatches) -> Result<Self>;

    fn run(&self) -> Result<()>;
}

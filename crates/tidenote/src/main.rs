#![doc = include_str!("../README.md")]

mod cli;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    cli::run_cli();
}

use clap::Parser as _;
use goodwe_price_plan::commands;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const LOG_ENV: &str = "GOODWE_PRICE_PLAN_LOG";

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Registers(commands::registers::Args),
    Mask(commands::mask::Args),
    Show(commands::show::Args),
    Set(commands::set::Args),
    Serve(commands::serve::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter_description = std::env::var(LOG_ENV).unwrap_or_else(|_| "info".to_string());
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("error: {LOG_ENV} is not a valid filter: {e}");
            std::process::exit(2);
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Registers(args) => end(commands::registers::run(args)),
        Commands::Mask(args) => end(commands::mask::run(args)),
        Commands::Show(args) => end(commands::show::run(args)),
        Commands::Set(args) => end(commands::set::run(args)),
        Commands::Serve(args) => end(commands::serve::run(args)),
    }
}

use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::{error, info, LevelFilter};

use mailroom::config::Config;
use mailroom::logger;
use mailroom::server;

//------------ Args ---------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "mailroom", version,
          about = "A forking store-and-forward SMTP server")]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level: error, warn, info, debug or trace.
    #[arg(short = 'l', long, value_name = "LEVEL")]
    log_level: Option<LevelFilter>,
}

//------------ main ---------------------------------------------------------

fn main() {
    let args = Args::parse();
    logger::init(args.log_level);

    let config = match args.config {
        Some(ref path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(err) => {
                error!("Can't read {}: {}", path.display(), err);
                process::exit(1);
            }
        },
        None => Config::default(),
    };
    info!("Starting up with {}", config);

    if let Err(err) = server::run(config) {
        error!("{:#}", err);
        process::exit(1);
    }
}

use std::path::PathBuf;

use clap::ArgMatches;
use server::Settings;

/// Starts the server. Flags override the matching environment variables.
pub async fn run(matches: &ArgMatches) {
    let settings = match Settings::from_env() {
        Ok(s) => apply_overrides(s, matches),
        Err(e) => {
            eprintln!("invalid environment: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server::run(settings).await {
        eprintln!("server failed: {e:#}");
        std::process::exit(1);
    }
}

fn apply_overrides(mut settings: Settings, matches: &ArgMatches) -> Settings {
    if let Some(dir) = matches.get_one::<String>("dir") {
        settings.data_dir = PathBuf::from(dir);
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        settings.port = *port;
    }
    if let Some(config) = matches.get_one::<String>("config") {
        settings.config = Some(PathBuf::from(config));
    }
    settings
}

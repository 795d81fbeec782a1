use clap::{arg, command, crate_name, value_parser, ArgMatches, Command};
use cli::client::{list_container, upload_single_file};
use client::UploadParams;

mod cli;

#[tokio::main]
async fn main() {
    let cli = build_cli().get_matches();

    if cli.subcommand_matches(cli::VERSION_SUBCOMMAND).is_some() {
        cli::version::run();
    } else if cli.subcommand_matches(cli::BUGREPORT_SUBCOMMAND).is_some() {
        cli::bugreport::run();
    } else if let Some(server_matches) = cli.subcommand_matches(cli::SERVER_SUBCOMMAND) {
        cli::server::run(server_matches).await;
    } else if let Some(upload_matches) = cli.subcommand_matches(cli::UPLOAD_SUBCOMMAND) {
        upload_single_file(upload_params(upload_matches)).await;
    } else if let Some(list_matches) = cli.subcommand_matches(cli::LIST_SUBCOMMAND) {
        let uri = required::<String>(list_matches, "uri");
        let container = required::<i64>(list_matches, "container");
        list_container(&uri, container).await;
    }
}

fn build_cli() -> Command {
    command!(crate_name!())
        .version(clap::crate_version!())
        .about(clap::crate_description!())
        .subcommand(Command::new(cli::VERSION_SUBCOMMAND).about(cli::VERSION_DESCRIPTION))
        .subcommand(Command::new(cli::BUGREPORT_SUBCOMMAND).about(cli::BUGREPORT_DESCRIPTION))
        .subcommand(
            Command::new(cli::SERVER_SUBCOMMAND)
                .about(cli::SERVER_DESCRIPTION)
                .arg(
                    arg!(-d --dir <DIR>)
                        .required(false)
                        .help("Data directory, overrides EGISTORE_DATA_DIR"),
                )
                .arg(
                    arg!(-p --port <PORT>)
                        .required(false)
                        .value_parser(value_parser!(u16))
                        .help("Port to listen on, overrides EGISTORE_PORT"),
                )
                .arg(
                    arg!(-c --config <CONFIG>)
                        .required(false)
                        .help("Storage config file, overrides EGISTORE_CONFIG"),
                ),
        )
        .subcommand(
            Command::new(cli::UPLOAD_SUBCOMMAND)
                .about(cli::UPLOAD_DESCRIPTION)
                .arg(arg!(-u --uri <URI>).required(true).help("Egistore URI"))
                .arg(
                    arg!(-f --file <FILE>)
                        .required(true)
                        .help("Path to file to upload"),
                )
                .arg(
                    arg!(-o --owner <OWNER>)
                        .required(true)
                        .value_parser(value_parser!(i64))
                        .help("Owner of the asset"),
                )
                .arg(
                    arg!(-c --container <CONTAINER>)
                        .required(true)
                        .value_parser(value_parser!(i64))
                        .help("Container to upload the file into"),
                ),
        )
        .subcommand(
            Command::new(cli::LIST_SUBCOMMAND)
                .about(cli::LIST_DESCRIPTION)
                .arg(arg!(-u --uri <URI>).required(true).help("Egistore URI"))
                .arg(
                    arg!(-c --container <CONTAINER>)
                        .required(true)
                        .value_parser(value_parser!(i64))
                        .help("Container to list"),
                ),
        )
        .arg_required_else_help(true)
        .disable_version_flag(true)
}

fn upload_params(matches: &ArgMatches) -> UploadParams {
    UploadParams {
        uri: required::<String>(matches, "uri"),
        file: required::<String>(matches, "file"),
        owner: required::<i64>(matches, "owner"),
        container: required::<i64>(matches, "container"),
    }
}

/// Value of an argument clap already enforced as required.
fn required<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, id: &str) -> T {
    matches
        .get_one::<T>(id)
        .cloned()
        .unwrap_or_else(|| unreachable!("clap enforces required argument '{id}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn cli_definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn upload_arguments_are_parsed() {
        // Arrange
        let args = [
            "egistore", "upload", "-u", "http://localhost:5000", "-f", "a.png", "-o", "7", "-c",
            "9",
        ];

        // Act
        let matches = build_cli().try_get_matches_from(args).unwrap();

        // Assert
        let upload = matches.subcommand_matches(cli::UPLOAD_SUBCOMMAND).unwrap();
        let params = upload_params(upload);
        assert_eq!(params.uri, "http://localhost:5000");
        assert_eq!(params.file, "a.png");
        assert_eq!(params.owner, 7);
        assert_eq!(params.container, 9);
    }

    #[rstest]
    #[case(&["egistore", "upload", "-u", "http://x", "-f", "a.png", "-o", "seven", "-c", "1"])]
    #[case(&["egistore", "list", "-u", "http://x"])]
    #[case(&["egistore", "server", "-p", "70000"])]
    #[trace]
    fn invalid_arguments_are_rejected(#[case] args: &[&str]) {
        assert!(build_cli().try_get_matches_from(args).is_err());
    }
}

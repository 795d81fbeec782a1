use bugreport::{
    bugreport,
    collector::{CompileTimeInformation, EnvironmentVariables, OperatingSystem, SoftwareVersion},
    format::Markdown,
};

const REPORTED_VARIABLES: &[&str] = &[
    "SHELL",
    "TERM",
    "RUST_LOG",
    "EGISTORE_DATA_DIR",
    "EGISTORE_DATA_FILE",
    "EGISTORE_PORT",
    "EGISTORE_CONFIG",
];

pub fn run() {
    bugreport!()
        .info(SoftwareVersion::default())
        .info(OperatingSystem::default())
        .info(EnvironmentVariables::list(REPORTED_VARIABLES))
        .info(CompileTimeInformation::default())
        .print::<Markdown>();
}

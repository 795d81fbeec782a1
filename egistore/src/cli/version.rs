use std::env;

const DISK_BACKENDS: &[&str] = &["local", "s3"];

struct VersionInfo {
    name: &'static str,
    version: &'static str,
    os: &'static str,
    architecture: &'static str,
}

impl VersionInfo {
    fn current() -> Self {
        Self {
            name: clap::crate_name!(),
            version: clap::crate_version!(),
            os: env::consts::OS,
            architecture: env::consts::ARCH,
        }
    }

    fn lines(&self) -> Vec<String> {
        vec![
            format!("Name           : {}", self.name),
            format!("Version        : {}", self.version),
            format!("OS             : {}", self.os),
            format!("Architecture   : {}", self.architecture),
            format!("Disk backends  : {}", DISK_BACKENDS.join(", ")),
        ]
    }
}

pub fn run() {
    for line in VersionInfo::current().lines() {
        println!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_lists_backends() {
        let lines = VersionInfo::current().lines();

        assert_eq!(lines.len(), 5);
        assert!(lines[0].ends_with("egistore"));
        assert!(lines[4].ends_with("local, s3"));
    }
}

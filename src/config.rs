use eyre::{Result, WrapErr};
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::{Cli, ScanArgs};
use crate::options::{PortSpec, ScanOptions, ScanType, Timing};
use crate::target::{Target, TargetScope};
use crate::types::ScanRequest;

const DEFAULT_MAX_RECORDS: usize = 50;

/// Settings shared by every subcommand, resolved from flags and environment
#[derive(Debug, Clone)]
pub struct Config {
    pub nmap_path: Option<PathBuf>,
    pub session_dir: PathBuf,
    pub max_records: usize,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let session_dir = match &cli.session_dir {
            Some(dir) => dir.clone(),
            None => default_session_dir()?,
        };
        log::debug!("[config] from_cli: nmap_path={:?} session_dir={}", cli.nmap_path, session_dir.display());

        Ok(Self {
            nmap_path: cli.nmap_path.clone(),
            session_dir,
            max_records: DEFAULT_MAX_RECORDS,
        })
    }
}

pub fn default_session_dir() -> Result<PathBuf> {
    Ok(dirs::data_local_dir()
        .ok_or_else(|| eyre::eyre!("Could not find local data directory"))?
        .join("nscan")
        .join("sessions"))
}

impl ScanArgs {
    /// Collect targets from positional args and the input file, then apply exclusions
    pub fn scope(&self) -> Result<TargetScope> {
        let mut scope = TargetScope::parse_many(&self.targets)?;
        if let Some(file) = &self.input_file {
            for target in TargetScope::from_file(file)?.iter() {
                scope.add(target.clone());
            }
        }
        for entry in &self.exclude {
            scope.exclude(Target::parse(entry).wrap_err("Invalid --exclude entry")?);
        }
        if scope.is_empty() {
            eyre::bail!("No targets given; pass targets or --input-file");
        }
        Ok(scope)
    }

    pub fn options(&self) -> Result<ScanOptions> {
        let mut options = ScanOptions::new();

        if let Some(scan_type) = &self.scan_type {
            options = options.with_scan_type(ScanType::parse(scan_type)?);
        }
        if let Some(ports) = &self.ports {
            options = options.with_ports(PortSpec::parse(ports)?);
        }
        if let Some(top) = self.top_ports {
            options = options.with_ports(PortSpec::Top(top));
        }
        if let Some(level) = self.timing {
            options = options.with_timing(Timing::from_level(level)?);
        }
        if self.service_version || self.version_intensity.is_some() {
            options = options.with_service_detection(self.version_intensity);
        }
        if self.os_detection {
            options = options.with_os_detection();
        }
        if self.default_scripts {
            options = options.with_default_scripts();
        }
        for script in &self.script {
            options = options.with_script(script.clone());
        }
        for arg in &self.script_args {
            options = options.with_script_arg(arg.clone());
        }
        if self.skip_discovery {
            options = options.with_skip_discovery();
        }
        if self.no_dns {
            options = options.with_no_dns();
        }
        if self.ipv6 {
            options = options.with_ipv6();
        }
        if let Some(secs) = self.host_timeout {
            options = options.with_host_timeout(Duration::from_secs(secs));
        }
        if let Some(retries) = self.max_retries {
            options = options.with_max_retries(retries);
        }
        if let Some(rate) = self.min_rate {
            options = options.with_min_rate(rate);
        }
        for arg in &self.extra {
            options = options.with_extra_arg(arg.clone());
        }

        options.validate()?;
        Ok(options)
    }

    pub fn request(&self) -> Result<ScanRequest> {
        Ok(ScanRequest::new(self.scope()?, self.options()?))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn scan_args(argv: &[&str]) -> ScanArgs {
        let mut full = vec!["nscan", "scan"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            crate::cli::Command::Scan(args) => args,
            _ => panic!("expected scan"),
        }
    }

    #[test]
    fn test_request_from_args() {
        let args = scan_args(&[
            "10.0.0.0/30", "-s", "connect", "--top-ports", "50", "-T", "3",
            "--version-intensity", "2", "--exclude", "10.0.0.2", "--timeout", "60",
        ]);
        let request = args.request().unwrap();

        let argv = request.options.to_args(&request.scope, None).unwrap();
        assert_eq!(
            argv.join(" "),
            "-oX - -sT --top-ports 50 -T3 -sV --version-intensity 2 --exclude 10.0.0.2 10.0.0.0/30"
        );
        assert_eq!(args.timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_scope_merges_input_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("targets.txt");
        std::fs::write(&file, "10.0.0.1\n10.0.0.2\n").unwrap();

        let args = scan_args(&["10.0.0.1", "-i", file.to_str().unwrap()]);
        let scope = args.scope().unwrap();
        assert_eq!(scope.len(), 2);
    }

    #[test]
    fn test_invalid_args() {
        assert!(scan_args(&[]).scope().is_err());
        assert!(scan_args(&["10.0.0.1", "-T", "9"]).options().is_err());
        assert!(scan_args(&["10.0.0.1", "-s", "warp"]).options().is_err());
        assert!(scan_args(&["10.0.0.1", "-p", "99999"]).options().is_err());
        assert!(scan_args(&["bad!target"]).scope().is_err());
    }

    #[test]
    fn test_config_session_dir() {
        let cli = Cli::try_parse_from(["nscan", "--session-dir", "/tmp/nscan-sessions", "sessions"]).unwrap();
        let config = Config::from_cli(&cli).unwrap();
        assert_eq!(config.session_dir, PathBuf::from("/tmp/nscan-sessions"));
        assert!(default_session_dir().unwrap().ends_with("nscan/sessions"));
    }
}

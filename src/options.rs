use eyre::Result;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use crate::target::TargetScope;

/// Scopes larger than this are passed through an input-list file
pub const MAX_INLINE_TARGETS: usize = 64;
const MAX_VERSION_INTENSITY: u8 = 9;
const MAX_PORT: u32 = 65535;

/// Output and input-list options are owned by the runner. Matched as prefixes so
/// attached forms like `-oN=out.txt` or `-iLhosts` are caught too.
const RESERVED_ARGS: &[&str] = &["-oX", "-oN", "-oG", "-oA", "-oS", "-iL", "-iR"];

static PORT_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[TUS]:)?(?:(\d*)-(\d*)|(\d+)|[a-z][a-z0-9*?_-]*)$")
        .expect("port token pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    Connect,
    Syn,
    Udp,
    Ack,
    Fin,
    Null,
    Xmas,
    Ping,
    List,
}

impl ScanType {
    pub fn flag(&self) -> &'static str {
        match self {
            Self::Connect => "-sT",
            Self::Syn => "-sS",
            Self::Udp => "-sU",
            Self::Ack => "-sA",
            Self::Fin => "-sF",
            Self::Null => "-sN",
            Self::Xmas => "-sX",
            Self::Ping => "-sn",
            Self::List => "-sL",
        }
    }

    /// Raw-socket scan types need root
    pub fn requires_root(&self) -> bool {
        !matches!(self, Self::Connect | Self::Ping | Self::List)
    }

    /// Accepts a name (`syn`, `ping`, ...) or the scanner's own flag letters
    /// (`sS`, `-sn`). Flag letters are case-sensitive: `sn` is a ping sweep, `sN` a NULL scan.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let flag = match value.trim_start_matches('-') {
            "sT" => Some(Self::Connect),
            "sS" => Some(Self::Syn),
            "sU" => Some(Self::Udp),
            "sA" => Some(Self::Ack),
            "sF" => Some(Self::Fin),
            "sN" => Some(Self::Null),
            "sX" => Some(Self::Xmas),
            "sn" => Some(Self::Ping),
            "sL" => Some(Self::List),
            _ => None,
        };
        if let Some(scan_type) = flag {
            return Ok(scan_type);
        }

        Ok(match value.to_ascii_lowercase().as_str() {
            "connect" | "tcp" => Self::Connect,
            "syn" => Self::Syn,
            "udp" => Self::Udp,
            "ack" => Self::Ack,
            "fin" => Self::Fin,
            "null" => Self::Null,
            "xmas" => Self::Xmas,
            "ping" => Self::Ping,
            "list" => Self::List,
            _ => eyre::bail!("Unknown scan type: {}", value),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Timing {
    Paranoid,
    Sneaky,
    Polite,
    Normal,
    Aggressive,
    Insane,
}

impl Timing {
    pub fn from_level(level: u8) -> Result<Self> {
        Ok(match level {
            0 => Self::Paranoid,
            1 => Self::Sneaky,
            2 => Self::Polite,
            3 => Self::Normal,
            4 => Self::Aggressive,
            5 => Self::Insane,
            other => eyre::bail!("Timing template must be 0-5, got {}", other),
        })
    }

    pub fn level(&self) -> u8 {
        *self as u8
    }

    pub fn flag(&self) -> String {
        format!("-T{}", self.level())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PortSpec {
    /// Whatever the scanner scans by default
    #[default]
    Default,
    List(String),
    Top(u32),
    All,
}

impl PortSpec {
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value == "-" || value.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        let spec = Self::List(value.to_string());
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Default | Self::All => Ok(()),
            Self::Top(0) => eyre::bail!("Top port count must be at least 1"),
            Self::Top(_) => Ok(()),
            Self::List(list) => validate_port_list(list),
        }
    }

    fn push_args(&self, args: &mut Vec<String>) {
        match self {
            Self::Default => {}
            Self::List(list) => {
                args.push("-p".to_string());
                args.push(list.clone());
            }
            Self::Top(count) => {
                args.push("--top-ports".to_string());
                args.push(count.to_string());
            }
            Self::All => args.push("-p-".to_string()),
        }
    }
}

fn validate_port_list(list: &str) -> Result<()> {
    if list.is_empty() {
        eyre::bail!("Empty port list");
    }
    for token in list.split(',') {
        let caps = PORT_TOKEN.captures(token)
            .ok_or_else(|| eyre::eyre!("Invalid port specification: {}", token))?;

        let bound = |i: usize| -> Result<Option<u32>> {
            match caps.get(i).map(|m| m.as_str()).filter(|s| !s.is_empty()) {
                Some(s) => {
                    let port: u32 = s.parse()
                        .map_err(|_| eyre::eyre!("Invalid port number: {}", s))?;
                    if port > MAX_PORT {
                        eyre::bail!("Port {} is out of range", port);
                    }
                    Ok(Some(port))
                }
                None => Ok(None),
            }
        };

        bound(3)?;
        if let (Some(low), Some(high)) = (bound(1)?, bound(2)?) {
            if low > high {
                eyre::bail!("Port range {} is reversed", token);
            }
        }
    }
    Ok(())
}

/// Everything that shapes one scanner invocation apart from its targets
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub scan_type: Option<ScanType>,
    pub ports: PortSpec,
    pub timing: Option<Timing>,
    pub service_detection: bool,
    pub version_intensity: Option<u8>,
    pub os_detection: bool,
    pub default_scripts: bool,
    pub scripts: Vec<String>,
    pub script_args: Vec<String>,
    pub skip_discovery: bool,
    pub no_dns: bool,
    pub ipv6: bool,
    pub host_timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub min_rate: Option<u32>,
    pub extra_args: Vec<String>,
}

impl ScanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scan_type(mut self, scan_type: ScanType) -> Self {
        self.scan_type = Some(scan_type);
        self
    }

    pub fn with_ports(mut self, ports: PortSpec) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = Some(timing);
        self
    }

    pub fn with_service_detection(mut self, intensity: Option<u8>) -> Self {
        self.service_detection = true;
        self.version_intensity = intensity;
        self
    }

    pub fn with_os_detection(mut self) -> Self {
        self.os_detection = true;
        self
    }

    pub fn with_default_scripts(mut self) -> Self {
        self.default_scripts = true;
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.scripts.push(script.into());
        self
    }

    pub fn with_script_arg(mut self, arg: impl Into<String>) -> Self {
        self.script_args.push(arg.into());
        self
    }

    pub fn with_skip_discovery(mut self) -> Self {
        self.skip_discovery = true;
        self
    }

    pub fn with_no_dns(mut self) -> Self {
        self.no_dns = true;
        self
    }

    pub fn with_ipv6(mut self) -> Self {
        self.ipv6 = true;
        self
    }

    pub fn with_host_timeout(mut self, timeout: Duration) -> Self {
        self.host_timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_min_rate(mut self, rate: u32) -> Self {
        self.min_rate = Some(rate);
        self
    }

    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn requires_root(&self) -> bool {
        self.os_detection || self.scan_type.is_some_and(|t| t.requires_root())
    }

    /// True when the scope should go through an input-list file
    pub fn needs_input_list(scope: &TargetScope) -> bool {
        scope.len() > MAX_INLINE_TARGETS
    }

    pub fn validate(&self) -> Result<()> {
        self.ports.validate()?;
        if let Some(intensity) = self.version_intensity {
            if intensity > MAX_VERSION_INTENSITY {
                eyre::bail!("Version intensity must be 0-{}, got {}", MAX_VERSION_INTENSITY, intensity);
            }
        }
        if let Some(script) = self.scripts.iter().find(|s| s.trim().is_empty() || s.contains(',')) {
            eyre::bail!("Invalid script name: {:?}", script);
        }
        if let Some(reserved) = self.extra_args.iter().find(|a| RESERVED_ARGS.iter().any(|r| a.trim_start().starts_with(r))) {
            eyre::bail!("Argument {} is managed by nscan and cannot be passed through", reserved);
        }
        Ok(())
    }

    /// Build the argument vector. XML goes to stdout; targets come last,
    /// either inline or via `input_list` when one is given.
    pub fn to_args(&self, scope: &TargetScope, input_list: Option<&Path>) -> Result<Vec<String>> {
        if scope.is_empty() {
            eyre::bail!("No targets to scan");
        }
        self.validate()?;

        let mut args = vec!["-oX".to_string(), "-".to_string()];

        if let Some(scan_type) = self.scan_type {
            args.push(scan_type.flag().to_string());
        }
        self.ports.push_args(&mut args);
        if let Some(timing) = self.timing {
            args.push(timing.flag());
        }
        if self.service_detection {
            args.push("-sV".to_string());
            if let Some(intensity) = self.version_intensity {
                args.push("--version-intensity".to_string());
                args.push(intensity.to_string());
            }
        }
        if self.os_detection {
            args.push("-O".to_string());
        }
        if self.default_scripts {
            args.push("-sC".to_string());
        }
        if !self.scripts.is_empty() {
            args.push("--script".to_string());
            args.push(self.scripts.join(","));
        }
        if !self.script_args.is_empty() {
            args.push("--script-args".to_string());
            args.push(self.script_args.join(","));
        }
        if self.skip_discovery {
            args.push("-Pn".to_string());
        }
        if self.no_dns {
            args.push("-n".to_string());
        }
        if self.ipv6 {
            args.push("-6".to_string());
        }
        if let Some(timeout) = self.host_timeout {
            args.push("--host-timeout".to_string());
            args.push(format!("{}s", timeout.as_secs().max(1)));
        }
        if let Some(retries) = self.max_retries {
            args.push("--max-retries".to_string());
            args.push(retries.to_string());
        }
        if let Some(rate) = self.min_rate {
            args.push("--min-rate".to_string());
            args.push(rate.to_string());
        }
        args.extend(self.extra_args.iter().cloned());

        if !scope.excluded().is_empty() {
            let excluded: Vec<String> = scope.excluded().iter().map(|t| t.to_arg()).collect();
            args.push("--exclude".to_string());
            args.push(excluded.join(","));
        }

        match input_list {
            Some(path) => {
                args.push("-iL".to_string());
                args.push(path.display().to_string());
            }
            None => args.extend(scope.iter().map(|t| t.to_arg())),
        }

        log::debug!("[options] to_args: targets={} args={}", scope.len(), args.join(" "));
        Ok(args)
    }
}

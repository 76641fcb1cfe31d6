use eyre::{Result, WrapErr};
use ipnetwork::IpNetwork;
use std::fmt;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Ip(IpAddr),
    Network(IpNetwork),
    Range { base: [u8; 3], start: u8, end: u8 },
    Hostname(String),
}

impl Target {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            eyre::bail!("Empty target");
        }
        if input.chars().any(char::is_whitespace) {
            eyre::bail!("Target contains whitespace: {}", input);
        }

        // Try IP address
        if let Ok(ip) = input.parse::<IpAddr>() {
            return Ok(Self::Ip(ip));
        }

        // CIDR block
        if input.contains('/') {
            let network = input.parse::<IpNetwork>()
                .map_err(|e| eyre::eyre!("Invalid network {}: {}", input, e))?;
            return Ok(Self::Network(network));
        }

        // Last-octet range like 10.0.0.1-20
        if let Some((head, end)) = input.split_once('-') {
            if let Ok(start_ip) = head.parse::<Ipv4Addr>() {
                let end = end.parse::<u8>()
                    .map_err(|_| eyre::eyre!("Invalid range end in {}", input))?;
                let [a, b, c, start] = start_ip.octets();
                if start > end {
                    eyre::bail!("Range start {} is greater than end {} in {}", start, end, input);
                }
                return Ok(Self::Range { base: [a, b, c], start, end });
            }
        }

        // Assume hostname; a leading '-' would be read as a scanner option
        if input.starts_with('-') {
            eyre::bail!("Target cannot start with '-': {}", input);
        }
        if !input.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')) {
            eyre::bail!("Invalid hostname: {}", input);
        }
        Ok(Self::Hostname(input.to_string()))
    }

    /// The string handed to the scanner for this target
    pub fn to_arg(&self) -> String {
        self.to_string()
    }

    /// Number of addresses covered; a hostname counts as one
    pub fn host_count(&self) -> u128 {
        match self {
            Self::Ip(_) | Self::Hostname(_) => 1,
            Self::Network(IpNetwork::V4(net)) => 1u128 << (32 - u32::from(net.prefix())),
            Self::Network(IpNetwork::V6(net)) => net.size(),
            Self::Range { start, end, .. } => (*end - *start) as u128 + 1,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(ip) => write!(f, "{}", ip),
            Self::Network(net) => write!(f, "{}", net),
            Self::Range { base, start, end } => {
                if start == end {
                    write!(f, "{}.{}.{}.{}", base[0], base[1], base[2], start)
                } else {
                    write!(f, "{}.{}.{}.{}-{}", base[0], base[1], base[2], start, end)
                }
            }
            Self::Hostname(name) => write!(f, "{}", name),
        }
    }
}

/// Ordered set of targets for one scan, plus exclusions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetScope {
    targets: Vec<Target>,
    excluded: Vec<Target>,
}

impl TargetScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_many<S: AsRef<str>>(inputs: &[S]) -> Result<Self> {
        let mut scope = Self::new();
        for input in inputs {
            for entry in split_entries(input.as_ref()) {
                scope.add(Target::parse(entry)?);
            }
        }
        Ok(scope)
    }

    /// Read a target file: whitespace or comma separated, `#` comments
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("[target] from_file: path={}", path.display());

        if !path.is_file() {
            eyre::bail!("Target file not found: {}", path.display());
        }
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read target file {}", path.display()))?;

        let scope = Self::from_lines(&content)
            .wrap_err_with(|| format!("Invalid target file {}", path.display()))?;
        log::debug!("[target] from_file_loaded: path={} targets={}", path.display(), scope.len());
        Ok(scope)
    }

    pub fn from_lines(content: &str) -> Result<Self> {
        let mut scope = Self::new();
        for (line_num, line) in content.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default();
            for entry in split_entries(line) {
                let target = Target::parse(entry)
                    .wrap_err_with(|| format!("line {}", line_num + 1))?;
                scope.add(target);
            }
        }
        Ok(scope)
    }

    /// Write one target per line, suitable for the scanner's input-list option
    pub fn write_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)
            .wrap_err_with(|| format!("Failed to create target file {}", path.display()))?;
        self.write_to(file)
            .wrap_err_with(|| format!("Failed to write target file {}", path.display()))?;
        log::debug!("[target] write_file: path={} targets={}", path.display(), self.len());
        Ok(())
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        for target in &self.targets {
            writeln!(writer, "{}", target.to_arg())?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Returns false when the target was already present
    pub fn add(&mut self, target: Target) -> bool {
        if self.targets.contains(&target) {
            log::trace!("[target] duplicate_ignored: target={}", target);
            return false;
        }
        self.targets.push(target);
        true
    }

    pub fn exclude(&mut self, target: Target) {
        if !self.excluded.contains(&target) {
            self.excluded.push(target);
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }

    pub fn excluded(&self) -> &[Target] {
        &self.excluded
    }

    pub fn host_count(&self) -> u128 {
        self.targets.iter().map(Target::host_count).sum()
    }

    pub fn display_name(&self) -> String {
        match self.targets.as_slice() {
            [] => "(empty)".to_string(),
            [only] => only.to_string(),
            [first, rest @ ..] => format!("{} (+{} more)", first, rest.len()),
        }
    }
}

fn split_entries(line: &str) -> impl Iterator<Item = &str> {
    line.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
}

impl From<Target> for TargetScope {
    fn from(target: Target) -> Self {
        let mut scope = Self::new();
        scope.add(target);
        scope
    }
}

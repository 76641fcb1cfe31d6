use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nscan")]
#[command(about = "Run nmap, parse its XML report, and keep the results as sessions")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the nmap executable (defaults to NSCAN_NMAP_PATH, then PATH)
    #[arg(long, global = true)]
    pub nmap_path: Option<PathBuf>,

    /// Directory holding saved sessions
    #[arg(long, global = true, env = "NSCAN_SESSION_DIR")]
    pub session_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a scan and parse its report
    Scan(ScanArgs),

    /// Parse an existing XML report
    Parse {
        /// XML report written by nmap -oX
        xml: PathBuf,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Export a saved session to CSV
    Export {
        /// Session JSON file
        session: PathBuf,

        /// CSV file to write
        #[arg(long)]
        csv: PathBuf,
    },

    /// Rebuild a session from an exported CSV file
    Import {
        /// CSV file to read
        csv: PathBuf,

        /// Session JSON file to write
        #[arg(long)]
        json: PathBuf,
    },

    /// Print a saved session
    Show {
        /// Session JSON file
        session: PathBuf,
    },

    /// List sessions in the session directory
    Sessions,

    /// Validate a target file and print its contents
    Targets {
        /// Target file, one or more targets per line
        file: PathBuf,
    },
}

#[derive(Args, Default)]
pub struct OutputArgs {
    /// Write the session as JSON
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Write the results as CSV
    #[arg(long)]
    pub csv: Option<PathBuf>,

    /// Save the session into the session directory
    #[arg(long)]
    pub save: bool,

    /// Name recorded with the session
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Args, Default)]
pub struct ScanArgs {
    /// Targets: IPs, CIDR blocks, ranges like 10.0.0.1-20, or hostnames
    pub targets: Vec<String>,

    /// Read targets from a file
    #[arg(short = 'i', long)]
    pub input_file: Option<PathBuf>,

    /// Targets to leave out
    #[arg(long, value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Scan type: connect, syn, udp, ack, fin, null, xmas, ping, list
    #[arg(short = 's', long)]
    pub scan_type: Option<String>,

    /// Ports, e.g. 22,80,8000-8100 or "-" for all
    #[arg(short, long, conflicts_with = "top_ports")]
    pub ports: Option<String>,

    /// Scan the N most common ports
    #[arg(long)]
    pub top_ports: Option<u32>,

    /// Timing template 0-5
    #[arg(short = 'T', long)]
    pub timing: Option<u8>,

    /// Probe open ports for service and version
    #[arg(long)]
    pub service_version: bool,

    /// Version detection intensity 0-9 (implies --service-version)
    #[arg(long)]
    pub version_intensity: Option<u8>,

    /// Enable OS detection
    #[arg(short = 'O', long)]
    pub os_detection: bool,

    /// Run the default script set
    #[arg(long)]
    pub default_scripts: bool,

    /// Scripts to run
    #[arg(long, value_delimiter = ',')]
    pub script: Vec<String>,

    /// Script arguments, key=value
    #[arg(long)]
    pub script_args: Vec<String>,

    /// Treat all hosts as online
    #[arg(long)]
    pub skip_discovery: bool,

    /// Never do DNS resolution
    #[arg(short = 'n', long)]
    pub no_dns: bool,

    /// Scan IPv6 targets
    #[arg(long)]
    pub ipv6: bool,

    /// Give up on a host after this many seconds
    #[arg(long)]
    pub host_timeout: Option<u64>,

    /// Cap on probe retransmissions
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Send packets no slower than this many per second
    #[arg(long)]
    pub min_rate: Option<u32>,

    /// Kill the scan after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Extra arguments passed to nmap as-is (after --)
    #[arg(last = true)]
    pub extra: Vec<String>,

    #[command(flatten)]
    pub output: OutputArgs,
}

pub fn parse() -> Cli {
    Cli::parse()
}

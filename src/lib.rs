pub mod cli;
pub mod config;
pub mod logging;
pub mod model;
pub mod options;
pub mod parser;
pub mod pretty;
pub mod scan;
pub mod scanner;
pub mod session;
pub mod target;
pub mod types;

// Re-export key types and functions at the crate root
pub use config::Config;
pub use logging::{get_log_file_path, init_logging};
pub use model::{Host, Port, ScanReport};
pub use options::{PortSpec, ScanOptions, ScanType, Timing};
pub use parser::{parse_report, parse_report_file};
pub use scan::{NmapScanner, resolve_executable};
pub use scanner::Scanner;
pub use session::{Session, SessionStore};
pub use target::{Target, TargetScope};
pub use types::{ScanRecord, ScanRequest, ScanStatus};

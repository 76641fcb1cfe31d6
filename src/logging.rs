use eyre::{Result, WrapErr};
use log::LevelFilter;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Initialize logging to a system-specific log file. `verbose` raises the
/// default level to debug; `RUST_LOG` still wins when set.
pub fn init_logging(verbose: bool) -> Result<PathBuf> {
    let log_path = get_log_file_path()?;

    // Ensure the log directory exists
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .wrap_err_with(|| format!("Failed to create log directory {}", parent.display()))?;
    }

    let log_level = resolve_level(std::env::var("RUST_LOG").ok().as_deref(), verbose);

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .wrap_err_with(|| format!("Failed to open log file {}", log_path.display()))?;

    env_logger::Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {} - {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .try_init()
        .wrap_err("Logger already initialized")?;

    log::info!("Logging initialized to: {}", log_path.display());
    log::info!("Log level: {}", log_level);

    Ok(log_path)
}

fn resolve_level(env_value: Option<&str>, verbose: bool) -> LevelFilter {
    let fallback = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    env_value
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(fallback)
}

/// Get the system-specific log file path
pub fn get_log_file_path() -> Result<PathBuf> {
    let log_dir = if cfg!(target_os = "macos") {
        // macOS: ~/Library/Logs/nscan/
        dirs::home_dir()
            .ok_or_else(|| eyre::eyre!("Could not find home directory"))?
            .join("Library")
            .join("Logs")
            .join("nscan")
    } else if cfg!(target_os = "linux") && nix::unistd::getuid().is_root() {
        PathBuf::from("/var/log/nscan")
    } else {
        dirs::data_local_dir()
            .ok_or_else(|| eyre::eyre!("Could not find local data directory"))?
            .join("nscan")
            .join("logs")
    };

    Ok(log_dir.join("nscan.log"))
}

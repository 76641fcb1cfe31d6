pub mod nmap;

pub use nmap::{NmapScanner, resolve_executable, NMAP_PATH_ENV};

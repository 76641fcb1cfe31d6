//! Scan sessions: an ordered history of scan records that can be saved to and
//! restored from JSON, flattened to CSV, and rebuilt from that CSV.

use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::model::{
    Address, AddressType, Host, HostState, HostStatus, Hostname, Port, PortStatus, Protocol,
    RunStats, ScanReport, Service,
};
use crate::types::{ScanRecord, ScanStatus};

const DEFAULT_MAX_RECORDS: usize = 50;
const SESSION_EXTENSION: &str = "json";
const IMPORT_SCANNER: &str = "csv-import";

/// Per-process sequence so sessions created in the same millisecond get distinct ids
static SESSION_SEQUENCE: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub max_records: usize,
    pub records: Vec<ScanRecord>,
}

impl Session {
    pub fn new(name: Option<String>) -> Self {
        let created_at = Utc::now();
        let sequence = SESSION_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("{}-{}-{}",
                created_at.format("%Y%m%d-%H%M%S-%3f"), std::process::id(), sequence),
            name,
            created_at,
            max_records: DEFAULT_MAX_RECORDS,
            records: Vec::new(),
        }
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.max(1);
        self
    }

    /// Append a record, dropping the oldest ones beyond `max_records`.
    /// Returns the index of the new record.
    pub fn begin(&mut self, record: ScanRecord) -> usize {
        self.records.push(record);
        let excess = self.records.len().saturating_sub(self.max_records);
        if excess > 0 {
            self.records.drain(..excess);
            log::trace!("[session] history_trimmed: session={} dropped={} kept={}",
                self.id, excess, self.records.len());
        }
        self.records.len() - 1
    }

    pub fn record_success(&mut self, index: usize, report: ScanReport) {
        match self.records.get_mut(index) {
            Some(record) => record.complete(report),
            None => log::warn!("[session] record_not_found: session={} index={}", self.id, index),
        }
    }

    pub fn record_failure(&mut self, index: usize, error: &eyre::Error) {
        match self.records.get_mut(index) {
            Some(record) => record.fail(error),
            None => log::warn!("[session] record_not_found: session={} index={}", self.id, index),
        }
    }

    pub fn latest(&self) -> Option<&ScanRecord> {
        self.records.last()
    }

    pub fn reports(&self) -> impl Iterator<Item = &ScanReport> {
        self.records.iter()
            .filter(|r| r.status == ScanStatus::Complete)
            .filter_map(|r| r.report.as_ref())
    }

    /// Hosts across all completed records, in first-seen order. A host seen
    /// again in a later record replaces the earlier data.
    pub fn hosts(&self) -> Vec<Host> {
        let mut merged: Vec<Host> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for host in self.reports().flat_map(|r| r.hosts.iter()) {
            match index.get(&host.key()) {
                Some(&pos) => merged[pos] = host.clone(),
                None => {
                    index.insert(host.key(), merged.len());
                    merged.push(host.clone());
                }
            }
        }
        merged
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)
            .wrap_err("Failed to serialize session")?;
        std::fs::write(path, json)
            .wrap_err_with(|| format!("Failed to write session file {}", path.display()))?;

        log::info!("[session] saved: session={} path={} records={}", self.id, path.display(), self.records.len());
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            eyre::bail!("Session file not found: {}", path.display());
        }
        let json = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read session file {}", path.display()))?;
        let session: Self = serde_json::from_str(&json)
            .wrap_err_with(|| format!("Invalid session file {}", path.display()))?;

        log::info!("[session] loaded: session={} path={} records={}", session.id, path.display(), session.records.len());
        Ok(session)
    }

    pub fn to_csv_rows(&self) -> Vec<CsvRow> {
        let mut rows = Vec::new();
        for host in self.hosts() {
            if host.ports.is_empty() {
                rows.push(CsvRow::for_host(&host, None));
            } else {
                rows.extend(host.ports.iter().map(|port| CsvRow::for_host(&host, Some(port))));
            }
        }
        rows
    }

    /// One row per (host, port); hosts without ports get a single row
    pub fn export_csv(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .wrap_err_with(|| format!("Failed to create CSV file {}", path.display()))?;

        let rows = self.to_csv_rows();
        for row in &rows {
            writer.serialize(row).wrap_err("Failed to write CSV row")?;
        }
        writer.flush().wrap_err("Failed to flush CSV file")?;

        log::info!("[session] exported_csv: session={} path={} rows={}", self.id, path.display(), rows.len());
        Ok(rows.len())
    }

    /// Rebuild a session holding one completed record from exported CSV
    pub fn import_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            eyre::bail!("CSV file not found: {}", path.display());
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .wrap_err_with(|| format!("Failed to open CSV file {}", path.display()))?;

        let mut rows = Vec::new();
        for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
            let row = result.wrap_err_with(|| format!("Invalid CSV row {} in {}", line + 1, path.display()))?;
            rows.push(row);
        }

        let session = Self::from_csv_rows(rows, path.file_stem().map(|s| s.to_string_lossy().into_owned()));
        log::info!("[session] imported_csv: session={} path={} hosts={}",
            session.id, path.display(), session.hosts().len());
        Ok(session)
    }

    pub fn from_csv_rows(rows: Vec<CsvRow>, name: Option<String>) -> Self {
        let mut hosts: Vec<Host> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for row in rows {
            let pos = *index.entry(row.host.clone()).or_insert_with(|| {
                hosts.push(row.to_host());
                hosts.len() - 1
            });
            if let Some(port) = row.to_port() {
                hosts[pos].ports.push(port);
            }
        }

        let hosts_up = hosts.iter().filter(|h| h.is_up()).count() as u32;
        let hosts_total = hosts.len() as u32;
        let report = ScanReport {
            scanner: IMPORT_SCANNER.to_string(),
            hosts,
            stats: RunStats {
                exit: "success".to_string(),
                hosts_up,
                hosts_down: hosts_total - hosts_up,
                hosts_total,
                ..Default::default()
            },
            ..Default::default()
        };

        Self::from_report(report, name)
    }

    /// Wrap an already parsed report, e.g. one read from an XML file
    pub fn from_report(report: ScanReport, name: Option<String>) -> Self {
        let command_line = report.args.as_deref()
            .map(|args| args.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let mut session = Self::new(name);
        let index = session.begin(ScanRecord::running(command_line));
        session.record_success(index, report);
        session
    }
}

/// Flat CSV representation of one host/port pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvRow {
    pub host: String,
    pub hostname: Option<String>,
    pub host_state: String,
    pub protocol: Option<String>,
    pub port: Option<u16>,
    pub state: Option<String>,
    pub service: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
}

impl CsvRow {
    fn for_host(host: &Host, port: Option<&Port>) -> Self {
        let service = port.and_then(|p| p.service.as_ref());
        Self {
            host: host.key(),
            hostname: host.hostname().map(str::to_string),
            host_state: host.status.state.as_str().to_string(),
            protocol: port.map(|p| p.protocol.to_string()),
            port: port.map(|p| p.number),
            state: port.map(|p| p.state.to_string()),
            service: service.map(|s| s.name.clone()),
            product: service.and_then(|s| s.product.clone()),
            version: service.and_then(|s| s.version.clone()),
        }
    }

    fn to_host(&self) -> Host {
        Host {
            status: HostStatus {
                state: HostState::parse(&self.host_state),
                reason: None,
                reason_ttl: None,
            },
            addresses: vec![Address {
                addr: self.host.clone(),
                addr_type: guess_address_type(&self.host),
                vendor: None,
            }],
            hostnames: self.hostname.iter()
                .map(|name| Hostname { name: name.clone(), kind: None })
                .collect(),
            ..Default::default()
        }
    }

    fn to_port(&self) -> Option<Port> {
        let number = self.port?;
        let service = self.service.as_ref().map(|name| Service {
            name: name.clone(),
            product: self.product.clone(),
            version: self.version.clone(),
            ..Default::default()
        });
        Some(Port {
            protocol: Protocol::parse(self.protocol.as_deref().unwrap_or("tcp")),
            number,
            state: PortStatus::parse(self.state.as_deref().unwrap_or("unknown")),
            reason: None,
            reason_ttl: None,
            service,
            scripts: Vec::new(),
        })
    }
}

fn guess_address_type(addr: &str) -> AddressType {
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => AddressType::Ipv4,
        Ok(IpAddr::V6(_)) => AddressType::Ipv6,
        Err(_) if addr.len() == 17 && addr.split(':').count() == 6 => AddressType::Mac,
        Err(_) => AddressType::Other("unknown".to_string()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub records: usize,
    pub hosts: usize,
    pub path: PathBuf,
}

/// Directory of `<id>.json` session files
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, SESSION_EXTENSION))
    }

    /// Save a session, replacing only an earlier save of the same session
    pub fn save(&self, session: &Session) -> Result<PathBuf> {
        let path = self.path_for(&session.id);
        if path.exists() {
            let existing = Session::load_json(&path)
                .wrap_err_with(|| format!("Refusing to overwrite {}", path.display()))?;
            if existing.created_at != session.created_at || existing.name != session.name {
                eyre::bail!("Refusing to overwrite {}: it holds a different session with id {}",
                    path.display(), existing.id);
            }
        }
        session.save_json(&path)?;
        Ok(path)
    }

    pub fn load(&self, id: &str) -> Result<Session> {
        Session::load_json(self.path_for(id))
    }

    /// Stored sessions, newest first. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        if !self.dir.exists() {
            log::debug!("[session] store_missing: dir={}", self.dir.display());
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&self.dir)
            .wrap_err_with(|| format!("Failed to read session directory {}", self.dir.display()))?;

        let mut summaries = Vec::new();
        for entry in entries {
            let path = entry.wrap_err("Failed to read directory entry")?.path();
            if path.extension().is_none_or(|ext| ext != SESSION_EXTENSION) {
                continue;
            }
            match Session::load_json(&path) {
                Ok(session) => summaries.push(SessionSummary {
                    id: session.id.clone(),
                    name: session.name.clone(),
                    created_at: session.created_at,
                    records: session.records.len(),
                    hosts: session.hosts().len(),
                    path,
                }),
                Err(e) => log::warn!("[session] skipped_unreadable: path={} error={:#}", path.display(), e),
            }
        }

        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(addr: &str, state: HostState, ports: Vec<Port>) -> Host {
        Host {
            status: HostStatus { state, reason: None, reason_ttl: None },
            addresses: vec![Address {
                addr: addr.to_string(),
                addr_type: guess_address_type(addr),
                vendor: None,
            }],
            ports,
            ..Default::default()
        }
    }

    fn port(number: u16, state: PortStatus, service: Option<&str>) -> Port {
        Port {
            protocol: Protocol::Tcp,
            number,
            state,
            reason: None,
            reason_ttl: None,
            service: service.map(|name| Service {
                name: name.to_string(),
                product: Some("Product".to_string()),
                version: Some("1.0".to_string()),
                ..Default::default()
            }),
            scripts: Vec::new(),
        }
    }

    fn session_with(reports: Vec<Vec<Host>>) -> Session {
        let mut session = Session::new(Some("lab".to_string()));
        for hosts in reports {
            let index = session.begin(ScanRecord::running(vec!["nmap".to_string()]));
            session.record_success(index, ScanReport { hosts, ..Default::default() });
        }
        session
    }

    #[test]
    fn test_history_is_bounded() {
        let mut session = Session::new(None).with_max_records(2);
        for i in 0..3 {
            let index = session.begin(ScanRecord::running(vec![i.to_string()]));
            assert_eq!(index, session.records.len() - 1);
        }
        assert_eq!(session.records.len(), 2);
        assert_eq!(session.records[0].command_line, vec!["1"]);
    }

    #[test]
    fn test_hosts_merge_later_wins() {
        let session = session_with(vec![
            vec![
                host("10.0.0.1", HostState::Up, vec![port(22, PortStatus::Open, Some("ssh"))]),
                host("10.0.0.2", HostState::Up, Vec::new()),
            ],
            vec![host("10.0.0.1", HostState::Down, Vec::new())],
        ]);

        let hosts = session.hosts();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].key(), "10.0.0.1");
        assert_eq!(hosts[0].status.state, HostState::Down);
        assert_eq!(hosts[1].key(), "10.0.0.2");
    }

    #[test]
    fn test_failed_records_are_not_merged() {
        let mut session = session_with(vec![vec![host("10.0.0.1", HostState::Up, Vec::new())]]);
        let index = session.begin(ScanRecord::running(Vec::new()));
        session.record_failure(index, &eyre::eyre!("boom"));

        assert_eq!(session.reports().count(), 1);
        assert_eq!(session.hosts().len(), 1);
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");
        let session = session_with(vec![vec![
            host("10.0.0.1", HostState::Up, vec![port(80, PortStatus::Open, Some("http"))]),
        ]]);

        session.save_json(&path).unwrap();
        let loaded = Session::load_json(&path).unwrap();
        assert_eq!(loaded, session);
    }

    #[test]
    fn test_load_json_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Session::load_json(dir.path().join("none.json")).unwrap_err();
        assert!(missing.to_string().contains("none.json"));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(Session::load_json(&bad).is_err());
    }

    #[test]
    fn test_csv_rows() {
        let session = session_with(vec![vec![
            host("10.0.0.1", HostState::Up, vec![
                port(22, PortStatus::Open, Some("ssh")),
                port(161, PortStatus::OpenFiltered, None),
            ]),
            host("10.0.0.2", HostState::Down, Vec::new()),
        ]]);

        let rows = session.to_csv_rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].port, Some(22));
        assert_eq!(rows[0].service.as_deref(), Some("ssh"));
        assert_eq!(rows[1].state.as_deref(), Some("open|filtered"));
        assert_eq!(rows[1].service, None);
        assert_eq!(rows[2].host, "10.0.0.2");
        assert_eq!(rows[2].host_state, "down");
        assert_eq!(rows[2].port, None);
    }

    #[test]
    fn test_csv_export_import() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.csv");
        let session = session_with(vec![vec![
            host("10.0.0.1", HostState::Up, vec![
                port(22, PortStatus::Open, Some("ssh")),
                port(443, PortStatus::Filtered, None),
            ]),
            host("fe80::1", HostState::Up, vec![port(80, PortStatus::Open, Some("http"))]),
            host("10.0.0.3", HostState::Down, Vec::new()),
        ]]);

        assert_eq!(session.export_csv(&path).unwrap(), 4);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("host,hostname,host_state,protocol,port,state,service,product,version\n"));

        let imported = Session::import_csv(&path).unwrap();
        assert_eq!(imported.name.as_deref(), Some("scan"));
        assert_eq!(imported.records.len(), 1);

        let hosts = imported.hosts();
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts[0].ports.len(), 2);
        assert_eq!(hosts[0].ports[0].service.as_ref().unwrap().product.as_deref(), Some("Product"));
        assert_eq!(hosts[0].ports[1].state, PortStatus::Filtered);
        assert!(hosts[0].ports[1].service.is_none());
        assert_eq!(hosts[1].addresses[0].addr_type, AddressType::Ipv6);
        assert!(hosts[2].ports.is_empty());
        assert!(!hosts[2].is_up());

        let stats = &imported.latest().unwrap().report.as_ref().unwrap().stats;
        assert_eq!((stats.hosts_up, stats.hosts_down, stats.hosts_total), (2, 1, 3));
    }

    #[test]
    fn test_import_csv_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Session::import_csv(dir.path().join("missing.csv")).is_err());

        let bad = dir.path().join("bad.csv");
        std::fs::write(&bad, "host,hostname,host_state,protocol,port,state,service,product,version\n10.0.0.1,,up,tcp,notaport,open,,,\n").unwrap();
        let err = Session::import_csv(&bad).unwrap_err();
        assert!(format!("{:#}", err).contains("row 1"));
    }

    #[test]
    fn test_guess_address_type() {
        assert_eq!(guess_address_type("10.0.0.1"), AddressType::Ipv4);
        assert_eq!(guess_address_type("::1"), AddressType::Ipv6);
        assert_eq!(guess_address_type("00:11:22:33:44:55"), AddressType::Mac);
        assert_eq!(guess_address_type("???"), AddressType::Other("unknown".to_string()));
    }

    #[test]
    fn test_from_report_keeps_command_line() {
        let report = ScanReport {
            args: Some("nmap -oX - -sV 10.0.0.1".to_string()),
            hosts: vec![host("10.0.0.1", HostState::Up, Vec::new())],
            ..Default::default()
        };
        let session = Session::from_report(report, None);
        let record = session.latest().unwrap();
        assert_eq!(record.status, ScanStatus::Complete);
        assert_eq!(record.command_line, vec!["nmap", "-oX", "-", "-sV", "10.0.0.1"]);
    }

    #[test]
    fn test_store_save_load_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        assert!(store.list().unwrap().is_empty());

        let mut older = session_with(vec![vec![host("10.0.0.1", HostState::Up, Vec::new())]]);
        older.id = "older".to_string();
        older.created_at = Utc::now() - chrono::Duration::hours(1);
        let mut newer = Session::new(Some("newer".to_string()));
        newer.id = "newer".to_string();

        store.save(&older).unwrap();
        store.save(&newer).unwrap();
        std::fs::write(store.dir().join("junk.json"), "nope").unwrap();
        std::fs::write(store.dir().join("notes.txt"), "ignored").unwrap();

        let listed = store.list().unwrap();
        let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["newer", "older"]);
        assert_eq!(listed[1].hosts, 1);

        assert_eq!(store.load("older").unwrap(), older);
        assert!(store.load("absent").is_err());
    }

    #[test]
    fn test_session_ids_are_unique() {
        let ids: std::collections::HashSet<String> = (0..100).map(|_| Session::new(None).id).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_store_does_not_clobber_other_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let mut first = session_with(vec![vec![host("10.0.0.1", HostState::Up, Vec::new())]]);
        store.save(&first).unwrap();
        first.max_records = 10;
        store.save(&first).unwrap();

        let mut impostor = Session::new(Some("other".to_string()));
        impostor.id = first.id.clone();
        let err = store.save(&impostor).unwrap_err();
        assert!(err.to_string().contains("Refusing to overwrite"));

        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.load(&first.id).unwrap(), first);
    }
}

use async_trait::async_trait;
use eyre::Result;
use std::time::Instant;

use crate::model::ScanReport;
use crate::session::Session;
use crate::types::{ScanRecord, ScanRequest};

#[async_trait]
pub trait Scanner: Send + Sync {
    /// Scanner identifier for logs and records
    fn name(&self) -> &'static str;

    /// Program and arguments exactly as they will be executed
    fn command_line(&self, request: &ScanRequest) -> Result<Vec<String>>;

    /// Perform the scan and return the parsed report
    async fn scan(&self, request: &ScanRequest) -> Result<ScanReport>;

    /// Run one scan and record its outcome in the session
    async fn run(&self, request: &ScanRequest, session: &mut Session) -> Result<()> {
        let command_line = self.command_line(request)?;
        log::debug!("[scanner] run: scanner={} targets={} command={}",
            self.name(), request.scope.display_name(), command_line.join(" "));

        let index = session.begin(ScanRecord::running(command_line));
        log::debug!("[scanner] status_updated: scanner={} status=Running index={}", self.name(), index);

        let scan_start = Instant::now();
        match self.scan(request).await {
            Ok(report) => {
                log::debug!("[scanner] scan_completed: scanner={} duration={}ms hosts={} open_ports={}",
                    self.name(), scan_start.elapsed().as_millis(), report.hosts.len(), report.open_port_count());
                session.record_success(index, report);
                Ok(())
            }
            Err(error) => {
                log::error!("[scanner] scan_failed: scanner={} duration={}ms error={:#}",
                    self.name(), scan_start.elapsed().as_millis(), error);
                session.record_failure(index, &error);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Address, AddressType, Host};
    use crate::options::ScanOptions;
    use crate::target::TargetScope;
    use crate::types::ScanStatus;

    struct FixedScanner {
        fail: bool,
    }

    #[async_trait]
    impl Scanner for FixedScanner {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn command_line(&self, request: &ScanRequest) -> Result<Vec<String>> {
            let mut line = vec!["fixed".to_string()];
            line.extend(request.options.to_args(&request.scope, None)?);
            Ok(line)
        }

        async fn scan(&self, _request: &ScanRequest) -> Result<ScanReport> {
            if self.fail {
                eyre::bail!("scanner exploded");
            }
            Ok(ScanReport {
                hosts: vec![Host {
                    addresses: vec![Address {
                        addr: "10.0.0.1".to_string(),
                        addr_type: AddressType::Ipv4,
                        vendor: None,
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            })
        }
    }

    fn request() -> ScanRequest {
        ScanRequest::new(TargetScope::parse_many(&["10.0.0.1"]).unwrap(), ScanOptions::new())
    }

    #[tokio::test]
    async fn test_run_records_success() {
        let mut session = Session::new(Some("test".to_string()));
        FixedScanner { fail: false }.run(&request(), &mut session).await.unwrap();

        let record = session.latest().unwrap();
        assert_eq!(record.status, ScanStatus::Complete);
        assert_eq!(record.command_line, vec!["fixed", "-oX", "-", "10.0.0.1"]);
        assert_eq!(record.report.as_ref().unwrap().hosts.len(), 1);
    }

    #[tokio::test]
    async fn test_run_records_failure() {
        let mut session = Session::new(None);
        let result = FixedScanner { fail: true }.run(&request(), &mut session).await;
        assert!(result.is_err());

        let record = session.latest().unwrap();
        assert_eq!(record.status, ScanStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("scanner exploded"));
    }

    #[tokio::test]
    async fn test_run_rejects_bad_request_before_recording() {
        let mut session = Session::new(None);
        let bad = ScanRequest::new(TargetScope::new(), ScanOptions::new());
        assert!(FixedScanner { fail: false }.run(&bad, &mut session).await.is_err());
        assert!(session.records.is_empty());
    }
}

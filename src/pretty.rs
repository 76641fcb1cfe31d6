use crate::model::{Host, ScanReport};
use crate::session::{Session, SessionSummary};
use crate::target::TargetScope;
use crate::types::{ScanRecord, ScanStatus};
use std::time::Duration;

const MAX_PORTS_DISPLAY: usize = 4;
const SECONDS_PER_MINUTE: u64 = 60;
const SECONDS_PER_HOUR: u64 = 3600;
const SECONDS_PER_DAY: u64 = 86400;
const SEPARATOR_WIDTH: usize = 80;

pub fn print_session(session: &Session) {
    println!("📁 Session {}{}", session.id,
        session.name.as_ref().map(|n| format!(" ({})", n)).unwrap_or_default());
    print_separator();

    for (index, record) in session.records.iter().enumerate() {
        print_record(index, record);
    }

    let hosts = session.hosts();
    if !hosts.is_empty() {
        print_separator();
        for host in &hosts {
            print_host(host);
        }
    }
}

pub fn print_record(index: usize, record: &ScanRecord) {
    let status_icon = match record.status {
        ScanStatus::Running => "🔄",
        ScanStatus::Complete => "✅",
        ScanStatus::Failed => "❌",
    };

    let elapsed = record.duration()
        .and_then(|d| d.to_std().ok())
        .map(format_duration)
        .unwrap_or_else(|| "?".to_string());

    print!("{} #{} {}: ", status_icon, index + 1, record.started_at.format("%Y-%m-%d %H:%M:%S UTC"));

    if let Some(report) = &record.report {
        println!("{} ({})", summarize_report(report), elapsed);
    } else if let Some(error) = &record.error {
        println!("Error - {}", error);
    } else {
        println!("Running...");
    }

    if !record.command_line.is_empty() {
        println!("  └─ {}", record.command_line.join(" "));
    }
}

pub fn print_report(report: &ScanReport) {
    println!("{}", summarize_report(report));
    if let Some(summary) = &report.stats.summary {
        println!("  └─ {}", summary);
    }
    print_separator();
    for host in &report.hosts {
        print_host(host);
    }
}

pub fn print_host(host: &Host) {
    println!("{}", format_host_line(host));

    for port in &host.ports {
        let service = port.service.as_ref()
            .map(|s| {
                let banner = s.banner();
                if banner.is_empty() { s.name.clone() } else { format!("{} {}", s.name, banner) }
            })
            .unwrap_or_default();
        println!("    {:>5}/{:<4} {:<15} {}", port.number, port.protocol, port.state.as_str(), service);
    }
    for extra in &host.extra_ports {
        println!("    ({} {} ports not shown)", extra.count, extra.state);
    }
    if let Some(os) = host.best_os() {
        println!("    OS: {} ({}%)", os.name, os.accuracy);
    }
    if let Some(uptime) = &host.uptime {
        println!("    Uptime: {}", format_duration(Duration::from_secs(uptime.seconds)));
    }
}

pub fn print_session_list(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No saved sessions");
        return;
    }
    for summary in sessions {
        println!("{}  {}  {} records, {} hosts{}",
            summary.id,
            summary.created_at.format("%Y-%m-%d %H:%M:%S"),
            summary.records,
            summary.hosts,
            summary.name.as_ref().map(|n| format!("  [{}]", n)).unwrap_or_default(),
        );
    }
}

pub fn print_scope(scope: &TargetScope) {
    for target in scope.iter() {
        println!("{}", target);
    }
    print_separator();
    println!("{} targets, {} addresses", scope.len(), scope.host_count());
}

pub fn summarize_report(report: &ScanReport) -> String {
    let up = report.hosts_up().count();
    let elapsed = report.stats.elapsed
        .map(|secs| format!(", {:.2}s", secs))
        .unwrap_or_default();
    let incomplete = if report.stats.is_complete() { "" } else { " [incomplete]" };

    format!("{} hosts ({} up), {} open ports{}{}",
        report.hosts.len(), up, report.open_port_count(), elapsed, incomplete)
}

pub fn format_host_line(host: &Host) -> String {
    let address = host.primary_address().map(|a| a.addr.as_str()).unwrap_or("?");
    let name = host.hostname().map(|n| format!(" ({})", n)).unwrap_or_default();
    let open: Vec<u16> = host.open_ports().map(|p| p.number).collect();

    let ports_str = if open.is_empty() {
        "no open ports".to_string()
    } else {
        let shown: Vec<String> = open.iter().take(MAX_PORTS_DISPLAY).map(u16::to_string).collect();
        if open.len() > MAX_PORTS_DISPLAY {
            format!("open {}, +{} more", shown.join(", "), open.len() - MAX_PORTS_DISPLAY)
        } else {
            format!("open {}", shown.join(", "))
        }
    };

    format!("{} {}{} [{}] {}", if host.is_up() { "🟢" } else { "🔴" },
        address, name, host.status.state.as_str(), ports_str)
}

fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();

    if total_secs < SECONDS_PER_MINUTE {
        format!("{}s", total_secs)
    } else if total_secs < SECONDS_PER_HOUR {
        format!("{}m{}s", total_secs / SECONDS_PER_MINUTE, total_secs % SECONDS_PER_MINUTE)
    } else if total_secs < SECONDS_PER_DAY {
        let hours = total_secs / SECONDS_PER_HOUR;
        let minutes = (total_secs % SECONDS_PER_HOUR) / SECONDS_PER_MINUTE;
        format!("{}h{}m", hours, minutes)
    } else {
        format!("{}d{}h", total_secs / SECONDS_PER_DAY, (total_secs % SECONDS_PER_DAY) / SECONDS_PER_HOUR)
    }
}

pub fn print_separator() {
    println!("{}", "─".repeat(SEPARATOR_WIDTH));
}

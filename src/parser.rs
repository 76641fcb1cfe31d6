//! Scanner XML report parsing.
//!
//! The report is walked with `roxmltree` and mapped field by field onto the
//! records in [`crate::model`]. Missing or malformed optional attributes become
//! `None`; only a missing or wrong root element is an error.

use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use roxmltree::{Document, Node, ParsingOptions};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use crate::model::{
    Address, AddressType, ExtraPorts, Host, HostState, HostStatus, Hostname, OsClass, OsMatch,
    Port, PortStatus, Protocol, RunStats, ScanInfo, ScanReport, Script, Service, TraceHop, Uptime,
};

const ROOT_ELEMENT: &str = "nmaprun";
const CLOSING_ROOT: &str = "</nmaprun>";
const CLOSING_HOST: &str = "</host>";

pub fn parse_report_file(path: impl AsRef<Path>) -> Result<ScanReport> {
    let path = path.as_ref();
    log::debug!("[parser] parse_report_file: path={}", path.display());

    if !path.is_file() {
        eyre::bail!("Report file not found: {}", path.display());
    }
    let xml = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read report file {}", path.display()))?;

    parse_report(&xml)
        .wrap_err_with(|| format!("Failed to parse report file {}", path.display()))
}

pub fn parse_report(xml: &str) -> Result<ScanReport> {
    log::debug!("[parser] parse_report: input_len={}", xml.len());
    let parse_start = Instant::now();

    let report = match Document::parse_with_options(xml, parsing_options()) {
        Ok(doc) => build_report(&doc)?,
        Err(e) if !xml.contains(CLOSING_ROOT) => {
            log::warn!("[parser] truncated_report: error={} - recovering completed hosts", e);
            let repaired = repair_truncated(xml)
                .ok_or_else(|| eyre::eyre!("Report is truncated before any usable content: {}", e))?;
            let doc = Document::parse_with_options(&repaired, parsing_options())
                .wrap_err("Failed to parse truncated report")?;
            let mut report = build_report(&doc)?;
            report.stats.exit = RunStats::INCOMPLETE.to_string();
            report
        }
        Err(e) => return Err(e).wrap_err("Malformed XML report"),
    };

    log::debug!("[parser] parse_report_completed: duration={}μs hosts={} open_ports={}",
        parse_start.elapsed().as_micros(), report.hosts.len(), report.open_port_count());
    Ok(report)
}

/// The scanner emits a bare `<!DOCTYPE nmaprun>` which must be accepted
fn parsing_options() -> ParsingOptions {
    let mut options = ParsingOptions::default();
    options.allow_dtd = true;
    options
}

/// Cut an interrupted report back to its last complete host and close the root
fn repair_truncated(xml: &str) -> Option<String> {
    let cut = match xml.rfind(CLOSING_HOST) {
        Some(pos) => pos + CLOSING_HOST.len(),
        None => {
            let root = xml.find(&format!("<{}", ROOT_ELEMENT))?;
            root + xml[root..].find('>')? + 1
        }
    };
    let mut repaired = xml[..cut].to_string();
    repaired.push('\n');
    repaired.push_str(CLOSING_ROOT);
    Some(repaired)
}

fn build_report(doc: &Document) -> Result<ScanReport> {
    let root = doc.root_element();
    if root.tag_name().name() != ROOT_ELEMENT {
        eyre::bail!("Unexpected root element <{}>, expected <{}>", root.tag_name().name(), ROOT_ELEMENT);
    }

    let mut report = ScanReport {
        scanner: root.attribute("scanner").unwrap_or(ROOT_ELEMENT).to_string(),
        args: text_attr(root, "args"),
        version: text_attr(root, "version"),
        xml_version: text_attr(root, "xmloutputversion"),
        started_at: time_attr(root, "start"),
        finished_at: None,
        scan_info: children(root, "scaninfo").map(parse_scan_info).collect(),
        hosts: Vec::new(),
        stats: RunStats {
            exit: RunStats::INCOMPLETE.to_string(),
            ..Default::default()
        },
    };

    for (index, host_node) in children(root, "host").enumerate() {
        let host = parse_host(host_node);
        if host.addresses.is_empty() {
            log::warn!("[parser] host_without_address: index={} - skipped", index);
            continue;
        }
        report.hosts.push(host);
    }

    if let Some(stats) = child(root, "runstats") {
        report.stats = parse_run_stats(stats);
        report.finished_at = report.stats.finished_at;
    }

    Ok(report)
}

fn parse_scan_info(node: Node) -> ScanInfo {
    ScanInfo {
        scan_type: node.attribute("type").unwrap_or_default().to_string(),
        protocol: Protocol::parse(node.attribute("protocol").unwrap_or_default()),
        num_services: attr(node, "numservices"),
        services: node.attribute("services").unwrap_or_default().to_string(),
    }
}

fn parse_run_stats(node: Node) -> RunStats {
    let mut stats = RunStats::default();
    match child(node, "finished") {
        Some(finished) => {
            stats.finished_at = time_attr(finished, "time");
            stats.elapsed = attr(finished, "elapsed");
            stats.summary = text_attr(finished, "summary");
            stats.exit = finished.attribute("exit").unwrap_or("success").to_string();
        }
        None => stats.exit = RunStats::INCOMPLETE.to_string(),
    }
    if let Some(hosts) = child(node, "hosts") {
        stats.hosts_up = attr(hosts, "up").unwrap_or(0);
        stats.hosts_down = attr(hosts, "down").unwrap_or(0);
        stats.hosts_total = attr(hosts, "total").unwrap_or(0);
    }
    stats
}

fn parse_host(node: Node) -> Host {
    let mut host = Host {
        started_at: time_attr(node, "starttime"),
        ended_at: time_attr(node, "endtime"),
        ..Default::default()
    };

    if let Some(status) = child(node, "status") {
        host.status = HostStatus {
            state: HostState::parse(status.attribute("state").unwrap_or_default()),
            reason: text_attr(status, "reason"),
            reason_ttl: attr(status, "reason_ttl"),
        };
    }

    host.addresses = children(node, "address")
        .filter_map(|addr_node| {
            Some(Address {
                addr: addr_node.attribute("addr")?.to_string(),
                addr_type: AddressType::parse(addr_node.attribute("addrtype").unwrap_or("ipv4")),
                vendor: text_attr(addr_node, "vendor"),
            })
        })
        .collect();

    if let Some(hostnames) = child(node, "hostnames") {
        host.hostnames = children(hostnames, "hostname")
            .filter_map(|h| {
                Some(Hostname {
                    name: h.attribute("name")?.to_string(),
                    kind: text_attr(h, "type"),
                })
            })
            .collect();
    }

    if let Some(ports) = child(node, "ports") {
        host.extra_ports = children(ports, "extraports")
            .map(|extra| ExtraPorts {
                state: PortStatus::parse(extra.attribute("state").unwrap_or_default()),
                count: attr(extra, "count").unwrap_or(0),
            })
            .collect();
        host.ports = children(ports, "port").filter_map(parse_port).collect();
    }

    if let Some(os) = child(node, "os") {
        host.os_ports_used = children(os, "portused")
            .filter_map(|p| attr(p, "portid"))
            .collect();
        host.os = children(os, "osmatch").map(parse_os_match).collect();
    }

    host.uptime = child(node, "uptime").and_then(|u| {
        Some(Uptime {
            seconds: attr(u, "seconds")?,
            last_boot: text_attr(u, "lastboot"),
        })
    });
    host.distance = child(node, "distance").and_then(|d| attr(d, "value"));

    if let Some(trace) = child(node, "trace") {
        host.trace = children(trace, "hop")
            .filter_map(|hop| {
                Some(TraceHop {
                    ttl: attr(hop, "ttl")?,
                    addr: text_attr(hop, "ipaddr"),
                    host: text_attr(hop, "host"),
                    rtt_ms: attr(hop, "rtt"),
                })
            })
            .collect();
    }

    if let Some(hostscript) = child(node, "hostscript") {
        host.scripts = children(hostscript, "script").map(parse_script).collect();
    }

    host
}

fn parse_port(node: Node) -> Option<Port> {
    let number = match attr::<u16>(node, "portid") {
        Some(n) => n,
        None => {
            log::debug!("[parser] port_without_number: protocol={:?}", node.attribute("protocol"));
            return None;
        }
    };
    let state = child(node, "state");

    Some(Port {
        protocol: Protocol::parse(node.attribute("protocol").unwrap_or("tcp")),
        number,
        state: PortStatus::parse(state.and_then(|s| s.attribute("state")).unwrap_or("unknown")),
        reason: state.and_then(|s| text_attr(s, "reason")),
        reason_ttl: state.and_then(|s| attr(s, "reason_ttl")),
        service: child(node, "service").map(parse_service),
        scripts: children(node, "script").map(parse_script).collect(),
    })
}

fn parse_service(node: Node) -> Service {
    Service {
        name: node.attribute("name").unwrap_or("unknown").to_string(),
        product: text_attr(node, "product"),
        version: text_attr(node, "version"),
        extra_info: text_attr(node, "extrainfo"),
        os_type: text_attr(node, "ostype"),
        device_type: text_attr(node, "devicetype"),
        hostname: text_attr(node, "hostname"),
        method: text_attr(node, "method"),
        confidence: attr(node, "conf"),
        tunnel: text_attr(node, "tunnel"),
        cpes: cpes(node),
    }
}

fn parse_os_match(node: Node) -> OsMatch {
    OsMatch {
        name: node.attribute("name").unwrap_or_default().to_string(),
        accuracy: attr(node, "accuracy").unwrap_or(0),
        classes: children(node, "osclass")
            .map(|class| OsClass {
                vendor: text_attr(class, "vendor"),
                family: text_attr(class, "osfamily"),
                generation: text_attr(class, "osgen"),
                device_type: text_attr(class, "type"),
                accuracy: attr(class, "accuracy"),
                cpes: cpes(class),
            })
            .collect(),
    }
}

fn parse_script(node: Node) -> Script {
    let mut elements = BTreeMap::new();
    flatten_elements(node, "", &mut elements);
    Script {
        id: node.attribute("id").unwrap_or_default().to_string(),
        output: node.attribute("output").unwrap_or_default().to_string(),
        elements,
    }
}

/// Flatten nested `<table>`/`<elem>` structure into dotted keys; unkeyed
/// entries use their position among siblings.
fn flatten_elements(node: Node, prefix: &str, out: &mut BTreeMap<String, String>) {
    for (index, item) in node.children().filter(|n| n.is_element()).enumerate() {
        let key = item.attribute("key")
            .map(str::to_string)
            .unwrap_or_else(|| index.to_string());
        let path = if prefix.is_empty() { key } else { format!("{}.{}", prefix, key) };

        match item.tag_name().name() {
            "elem" => {
                out.insert(path, item.text().unwrap_or_default().trim().to_string());
            }
            "table" => flatten_elements(item, &path, out),
            _ => {}
        }
    }
}

fn cpes(node: Node) -> Vec<String> {
    children(node, "cpe")
        .filter_map(|c| c.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.tag_name().name() == name)
}

fn children<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children().filter(move |n| n.is_element() && n.tag_name().name() == name)
}

fn text_attr(node: Node, name: &str) -> Option<String> {
    node.attribute(name)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn attr<T: FromStr>(node: Node, name: &str) -> Option<T> {
    let raw = node.attribute(name)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::debug!("[parser] attribute_parse_failed: element={} attribute={} value={}",
                node.tag_name().name(), name, raw);
            None
        }
    }
}

fn time_attr(node: Node, name: &str) -> Option<DateTime<Utc>> {
    attr::<i64>(node, name).and_then(|secs| DateTime::from_timestamp(secs, 0))
}

//! Plain-text rendering for command output.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use devbox_control::{
    format_time_remaining, Catalog, Deployment, ProfileInfo, SweepReport,
};

/// Widest an owner or target column may get before it is shortened.
const MAX_CELL: usize = 32;

/// Render rows under headers, left-aligned, two spaces between columns.
fn table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    push_row(&mut out, &widths, headers);
    for row in rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        push_row(&mut out, &widths, &cells);
    }
    out
}

fn push_row(out: &mut String, widths: &[usize], cells: &[&str]) {
    let mut line = String::new();
    for (i, (cell, &width)) in cells.iter().zip(widths).enumerate() {
        if i > 0 {
            line.push_str("  ");
        }
        let _ = write!(line, "{cell:<width$}");
    }
    out.push_str(line.trim_end());
    out.push('\n');
}

/// Truncate a string in the middle with ellipsis if it exceeds `max_len`.
fn truncate_middle(s: &str, max_len: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max_len {
        return s.to_string();
    }
    if max_len < 5 {
        return chars[..max_len].iter().collect();
    }
    let keep = (max_len - 3) / 2;
    let start: String = chars[..keep].iter().collect();
    let end: String = chars[chars.len() - keep..].iter().collect();
    format!("{start}...{end}")
}

fn remaining(record: &Deployment, now: DateTime<Utc>) -> String {
    if record.state.is_terminal() {
        return "-".to_string();
    }
    record
        .time_remaining(now)
        .map_or_else(|| "never".to_string(), format_time_remaining)
}

fn ports(record: &Deployment) -> String {
    let ports: Vec<String> = record.ports().iter().map(|(_, p)| p.to_string()).collect();
    if ports.is_empty() {
        "-".to_string()
    } else {
        ports.join(",")
    }
}

/// Table for `list`.
pub fn deployments(records: &[Deployment], now: DateTime<Utc>) -> String {
    if records.is_empty() {
        return "No deployments found.\n".to_string();
    }
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|d| {
            vec![
                d.id.to_string(),
                d.name.clone(),
                d.state.to_string(),
                d.preset.to_string(),
                ports(d),
                remaining(d, now),
                truncate_middle(&d.owner, MAX_CELL),
            ]
        })
        .collect();
    table(
        &["ID", "NAME", "STATE", "PRESET", "PORTS", "EXPIRES IN", "OWNER"],
        &rows,
    )
}

/// Detail block printed after a lifecycle command.
pub fn deployment(record: &Deployment, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Deployment:  {}", record.id);
    let _ = writeln!(out, "State:       {}", record.state);
    let _ = writeln!(
        out,
        "Preset:      {} ({} control plane, {} workers, {} CPU, {})",
        record.preset,
        record.node_spec.control_planes,
        record.node_spec.workers,
        record.node_spec.cpu,
        record.node_spec.memory
    );
    let _ = writeln!(out, "Context:     {}", record.kubeconfig_context);
    if let Some(port) = record.ingress_port {
        let _ = writeln!(out, "Ingress:     http://localhost:{port}");
    }
    if let Some(port) = record.postgres_port {
        let _ = writeln!(out, "PostgreSQL:  localhost:{port}");
    }
    if let Some(at) = record.expires_at {
        let _ = writeln!(
            out,
            "Expires:     {} ({})",
            at.format("%Y-%m-%d %H:%M UTC"),
            remaining(record, now)
        );
    }
    if let Some(failure) = &record.failure {
        let _ = writeln!(out, "Failure:     {}: {}", failure.reason, failure.message);
    }
    out
}

/// Table for `connect list`.
pub fn profiles(infos: &[ProfileInfo]) -> String {
    if infos.is_empty() {
        return "No connections. Run `devbox connect sources` to see what is available.\n"
            .to_string();
    }
    let rows: Vec<Vec<String>> = infos
        .iter()
        .map(|info| {
            let profile = info.profile.as_ref();
            vec![
                info.source_id.to_string(),
                info.status.to_string(),
                info.local_port()
                    .map_or_else(|| "-".to_string(), |p| format!("localhost:{p}")),
                profile.map_or_else(String::new, |p| {
                    truncate_middle(&format!("{}:{}", p.target_host, p.remote_port), MAX_CELL)
                }),
                profile
                    .and_then(|p| p.tunnel_pid)
                    .map_or_else(|| "-".to_string(), |pid| pid.to_string()),
                profile
                    .and_then(|p| p.last_error.clone())
                    .unwrap_or_default(),
            ]
        })
        .collect();
    table(
        &["SOURCE", "STATUS", "LOCAL", "TARGET", "PID", "LAST ERROR"],
        &rows,
    )
}

/// Detail block for `connect info` and `connect enable`.
pub fn profile(info: &ProfileInfo) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Source:      {}", info.source_id);
    let _ = writeln!(out, "Status:      {}", info.status);
    if let Some(source) = &info.source {
        let _ = writeln!(out, "Provider:    {}", source.provider);
        let _ = writeln!(out, "Description: {}", source.description);
        let _ = writeln!(out, "Bastion:     {}", source.bastion_host);
    }
    if let Some(port) = info.local_port() {
        let _ = writeln!(out, "Connect to:  localhost:{port}");
    }
    if let Some(profile) = &info.profile {
        let _ = writeln!(
            out,
            "Target:      {}:{}",
            profile.target_host, profile.remote_port
        );
        if let Some(pid) = profile.tunnel_pid {
            let _ = writeln!(out, "Tunnel pid:  {pid}");
        }
        if let Some(error) = &profile.last_error {
            let _ = writeln!(out, "Last error:  {error}");
        }
    }
    out
}

/// Table for `connect sources`.
pub fn sources(catalog: &Catalog) -> String {
    let rows: Vec<Vec<String>> = catalog
        .iter()
        .map(|source| {
            vec![
                source.source_id.to_string(),
                source.provider.to_string(),
                source.local_port.to_string(),
                truncate_middle(
                    &format!("{}:{}", source.target_host, source.remote_port),
                    MAX_CELL,
                ),
                source.description.clone(),
            ]
        })
        .collect();
    table(
        &["SOURCE", "PROVIDER", "LOCAL PORT", "TARGET", "DESCRIPTION"],
        &rows,
    )
}

/// Summary printed by `sweep`.
pub fn sweep(report: &SweepReport) -> String {
    if report.is_empty() {
        return "Nothing to reconcile.\n".to_string();
    }
    let mut out = String::new();
    let mut section = |label: &str, items: Vec<String>| {
        if !items.is_empty() {
            let _ = writeln!(out, "{label}: {}", items.join(", "));
        }
    };
    section("Expired", strings(&report.expired));
    section("Failed", strings(&report.failed));
    section("Resolved", strings(&report.resolved));
    section("Degraded", strings(&report.degraded));
    section("Released ports", strings(&report.released_ports));
    section("Skipped (busy)", report.skipped.clone());
    for error in &report.errors {
        let _ = writeln!(out, "Error: {error}");
    }
    out
}

fn strings<T: ToString>(items: &[T]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

use super::{ConnectionEntry, SnapshotSource};
use crate::error::{FlowError, FlowResult};
use crate::flow::{FlowKey, Protocol, TcpStats, TcpStatus};
use crate::net::normalize;
use async_trait::async_trait;
use log::{debug, trace};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const CONGESTION_ALGORITHMS: &[&str] = &[
    "bbr", "bbr2", "bic", "cdg", "cubic", "dctcp", "highspeed", "htcp", "hybla", "illinois",
    "lp", "nv", "reno", "scalable", "vegas", "veno", "westwood", "yeah",
];

/// Connection listing with TCP statistics from the `ss` utility.
pub struct SsSource {
    path: PathBuf,
    timeout: Duration,
}

impl Default for SsSource {
    fn default() -> Self {
        Self::new("/sbin/ss")
    }
}

impl SsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self) -> FlowResult<String> {
        let mut command = Command::new(&self.path);
        command.arg("-tinH").stdin(Stdio::null()).kill_on_drop(true);

        // Dropping the pending output on timeout kills the child
        let output = timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                FlowError::TransientQuery(format!("{:?} did not finish in {:?}", self.path, self.timeout))
            })?
            .map_err(|e| FlowError::TransientQuery(format!("failed to run {:?}: {}", self.path, e)))?;

        if !output.status.success() {
            return Err(FlowError::TransientQuery(format!(
                "{:?} exited with {}",
                self.path, output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SnapshotSource for SsSource {
    async fn poll(&mut self) -> FlowResult<Vec<ConnectionEntry>> {
        let stdout = self.run().await?;
        let entries = parse_ss(&stdout);
        debug!("ss query: {} connections", entries.len());
        Ok(entries)
    }

    fn name(&self) -> &'static str {
        "ss"
    }
}

/// Parse `ss -tinH` output: a socket line followed by an indented
/// statistics line.
pub fn parse_ss(output: &str) -> Vec<ConnectionEntry> {
    let mut entries = Vec::new();
    let mut lines = output.lines().peekable();

    while let Some(header) = lines.next() {
        if header.trim().is_empty() || header.starts_with(char::is_whitespace) {
            continue;
        }
        let info = match lines.peek() {
            Some(next) if next.starts_with(char::is_whitespace) => lines.next(),
            _ => None,
        };
        match parse_header(header) {
            Some(mut entry) => {
                if let Some(info) = info {
                    entry.stats = Some(parse_info(info));
                }
                entries.push(entry);
            }
            None => trace!("Skipping ss line: {}", header),
        }
    }
    entries
}

fn parse_header(line: &str) -> Option<ConnectionEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return None;
    }
    let status: TcpStatus = fields[0].parse().ok()?;
    let (src_ip, src_port) = parse_endpoint(fields[3])?;
    let (dst_ip, dst_port) = parse_endpoint(fields[4])?;
    Some(ConnectionEntry::new(
        FlowKey {
            protocol: Protocol::Tcp,
            src_ip,
            src_port,
            dst_ip,
            dst_port,
        },
        status,
    ))
}

/// `10.0.0.5:22`, `[2001:db8::1]:443`, `[fe80::1%eth0]:22`, `10.0.0.5%vlan2:22`
fn parse_endpoint(field: &str) -> Option<(IpAddr, u16)> {
    let (host, port) = field.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = host.split('%').next()?;
    let ip: IpAddr = host.parse().ok()?;
    Some((normalize(ip), port))
}

fn parse_info(line: &str) -> TcpStats {
    let mut stats = TcpStats::default();
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut i = 0;

    while i < tokens.len() {
        let token = tokens[i];
        i += 1;

        // Nested groups such as skmem:(...) and bbr:(...)
        if token.contains('(') {
            continue;
        }

        if let Some((key, value)) = token.split_once(':') {
            match key {
                "wscale" => {
                    if let Some((snd, rcv)) = value.split_once(',') {
                        stats.snd_wscale = snd.parse().ok();
                        stats.rcv_wscale = rcv.parse().ok();
                    }
                }
                "rtt" => {
                    if let Some((rtt, var)) = value.split_once('/') {
                        stats.rtt = rtt.parse().ok();
                        stats.rtt_var = var.parse().ok();
                    }
                }
                "cwnd" => stats.cwnd = value.parse().ok(),
                // current/total
                "retrans" => {
                    stats.retrans = value.rsplit('/').next().and_then(|v| v.parse().ok())
                }
                _ => {
                    if let Some(v) = parse_number(value) {
                        stats.counters.insert(key.to_string(), v);
                    }
                }
            }
            continue;
        }

        match token {
            // Rates are printed as a bare name followed by the value
            "send" | "pacing_rate" | "delivery_rate" => {
                if let Some(rate) = tokens.get(i).and_then(|v| parse_rate(v)) {
                    stats.counters.insert(format!("{}_bps", token), rate);
                    i += 1;
                }
            }
            "app_limited" => {}
            t if CONGESTION_ALGORITHMS.contains(&t) => stats.cong_algo = Some(t.to_string()),
            t if t.ends_with("bps") => {}
            t => stats.opts.push(t.to_string()),
        }
    }
    stats
}

fn parse_number(value: &str) -> Option<f64> {
    let value = value.trim_end_matches("ms");
    let value = value.rsplit('/').next()?;
    value.parse().ok()
}

fn parse_rate(value: &str) -> Option<f64> {
    let value = value.strip_suffix("bps")?;
    let (digits, scale) = match value.chars().last()? {
        'K' => (&value[..value.len() - 1], 1e3),
        'M' => (&value[..value.len() - 1], 1e6),
        'G' => (&value[..value.len() - 1], 1e9),
        _ => (value, 1.0),
    };
    digits.parse::<f64>().ok().map(|v| v * scale)
}

//! Named-pipe producer (np-api).
//!
//! Local tools write one flow per line:
//!
//! ```text
//! start tcp 2001:db8::5 51000 2001:db8::1 443 atlas production
//! ```
//!
//! The pipe is created with mode 0666 when missing and removed on exit.

use crate::bus::EventBus;
use crate::error::{FlowError, FlowResult};
use crate::flow::{FlowKey, FlowRecord, FlowState, Identifier, Protocol};
use crate::metrics::Metrics;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::ffi::CString;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PIPE_PATH: &str = "/var/run/flowd";

const FIELDS: usize = 8;

pub struct NpApiPipe {
    path: PathBuf,
    metrics: Option<Arc<Metrics>>,
}

impl NpApiPipe {
    /// Create the FIFO at `path` unless one already exists.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match std::fs::metadata(&path) {
            Ok(meta) if meta.file_type().is_fifo() => {
                debug!("Reusing command pipe {:?}", path);
            }
            Ok(_) => anyhow::bail!("{:?} exists and is not a named pipe", path),
            Err(_) => {
                mkfifo(&path, 0o666)
                    .with_context(|| format!("Unable to create command pipe {:?}", path))?;
                info!("Created command pipe {:?}", path);
            }
        }
        Ok(Self {
            path,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn run(self, bus: EventBus, cancel: CancellationToken) -> Result<()> {
        // Read-write keeps the pipe open while no writer is attached
        let receiver = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&self.path)
            .with_context(|| format!("Failed to open command pipe {:?}", self.path))?;
        let mut lines = BufReader::new(receiver).lines();
        info!("Listening for flows on {:?}", self.path);

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read command pipe {:?}: {}", self.path, e);
                    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match parse_line(&line, Utc::now()) {
                Ok(record) => {
                    debug!("--> {}", record);
                    bus.publish(record);
                }
                Err(e) => {
                    warn!("Unable to parse flow identifier '{}': {}", line.trim(), e);
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_malformed_records();
                    }
                }
            }
        }
        info!("Command pipe reader stopped");
        Ok(())
    }
}

fn mkfifo(path: &Path, mode: libc::mode_t) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    if unsafe { libc::mkfifo(c_path.as_ptr(), mode) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl Drop for NpApiPipe {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed command pipe {:?}", self.path),
            Err(e) => debug!("Command pipe {:?} not removed: {}", self.path, e),
        }
    }
}

/// Parse `state protocol src sport dst dport experiment activity`.
pub fn parse_line(line: &str, now: DateTime<Utc>) -> FlowResult<FlowRecord> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != FIELDS {
        return Err(FlowError::MalformedInput(format!(
            "expected {} fields, got {}",
            FIELDS,
            fields.len()
        )));
    }

    let state: FlowState = fields[0].parse()?;
    let protocol: Protocol = fields[1].parse()?;
    let endpoint = |ip: &str, port: &str| -> FlowResult<SocketAddr> {
        let ip: IpAddr = ip
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|_| FlowError::MalformedInput(format!("bad address '{}'", ip)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| FlowError::MalformedInput(format!("bad port '{}'", port)))?;
        Ok(SocketAddr::new(ip, port))
    };
    let mut key = FlowKey::tcp(endpoint(fields[2], fields[3])?, endpoint(fields[4], fields[5])?);
    key.protocol = protocol;

    let experiment = Identifier::from_text(fields[6]);
    let activity = match fields[7] {
        "-" | "0" => None,
        act => Some(Identifier::from_text(act)),
    };

    match state {
        FlowState::Start => Ok(FlowRecord::start(key, experiment, activity, now)),
        FlowState::End => Ok(FlowRecord::end(key, experiment, activity, None, now)),
        _ => FlowRecord::from_parts(state, key, experiment, activity, None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Recv;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_line() {
        let now = Utc::now();
        let record = parse_line(
            "start tcp 2001:db8::5 51000 2001:db8::1 443 atlas production",
            now,
        )
        .unwrap();
        assert_eq!(record.state(), FlowState::Start);
        assert_eq!(record.key().dst_port, 443);
        assert_eq!(record.experiment(), &Identifier::from("atlas"));
        assert_eq!(record.activity(), Some(&Identifier::from("production")));
        assert_eq!(record.start_time(), Some(now));

        let end = parse_line("end tcp 10.0.0.5 51000 203.0.113.7 443 16 14", now).unwrap();
        assert_eq!(end.state(), FlowState::End);
        assert_eq!(end.experiment(), &Identifier::Id(16));
        assert_eq!(end.end_time(), Some(now));
        assert_eq!(end.start_time(), None);
    }

    #[test]
    fn test_parse_line_malformed() {
        let now = Utc::now();
        for line in [
            "start tcp 2001:db8::5 51000 2001:db8::1 443 atlas",
            "start tcp 2001:db8::5 51000 2001:db8::1 443 atlas production extra",
            "begin tcp 2001:db8::5 51000 2001:db8::1 443 atlas production",
            "start sctp 2001:db8::5 51000 2001:db8::1 443 atlas production",
            "start tcp not-an-ip 51000 2001:db8::1 443 atlas production",
            "start tcp 2001:db8::5 99999 2001:db8::1 443 atlas production",
        ] {
            assert!(
                matches!(parse_line(line, now), Err(FlowError::MalformedInput(_))),
                "{}",
                line
            );
        }
    }

    #[test]
    fn test_create_reuses_fifo_and_rejects_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowd.pipe");
        mkfifo(&path, 0o600).unwrap();
        let np_pipe = NpApiPipe::create(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());
        drop(np_pipe);
        assert!(!path.exists());

        let regular = dir.path().join("regular");
        std::fs::write(&regular, b"").unwrap();
        assert!(NpApiPipe::create(&regular).is_err());
        assert!(regular.exists());
    }

    #[test]
    fn test_create_reports_os_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("flowd.pipe");
        let err = NpApiPipe::create(&path).err().unwrap();
        assert!(format!("{:#}", err).contains("Unable to create command pipe"));
        assert_eq!(
            err.downcast_ref::<io::Error>().map(io::Error::kind),
            Some(io::ErrorKind::NotFound)
        );
    }

    #[tokio::test]
    async fn test_pipe_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowd.pipe");
        let np_pipe = NpApiPipe::create(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());

        let bus = EventBus::new();
        let mut sub = bus.register();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(np_pipe.run(bus.clone(), cancel.clone()));

        let mut writer = loop {
            match pipe::OpenOptions::new().open_sender(&path) {
                Ok(writer) => break writer,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };
        writer
            .write_all(b"bad line\nstart tcp 2001:db8::5 51000 2001:db8::1 443 atlas production\n")
            .await
            .unwrap();

        match sub.recv_timeout(Duration::from_secs(5)).await {
            Recv::Record(record) => assert_eq!(record.state(), FlowState::Start),
            other => panic!("expected a record, got {:?}", other),
        }

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(!path.exists());
    }
}

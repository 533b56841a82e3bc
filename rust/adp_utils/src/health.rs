// Copyright (c) Advanced Micro Devices, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Per-GPU health feed
//!
//! The metrics exporter, when deployed, serves device health over a local
//! unix socket as line-oriented JSON. The connection is short-lived because
//! the exporter can come and go independently of this daemon; when the
//! socket is missing or does not answer within the query timeout the caller
//! falls back to [`crate::topology::simple_health_check`].

use std::collections::HashMap;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::trace;
use serde::Deserialize;
use serde::Serialize;

/// Socket the amd-metrics-exporter listens on.
pub const HEALTH_SOCKET: &str =
    "/var/lib/amd-metrics-exporter/amdgpu_device_metrics_exporter_grpc.socket";

/// How long one health query may take end to end.
pub const HEALTH_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Health as advertised to the device manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Unhealthy => "Unhealthy",
        }
    }

    pub fn from_bool(healthy: bool) -> Self {
        if healthy {
            Health::Healthy
        } else {
            Health::Unhealthy
        }
    }
}

#[derive(Serialize)]
struct HealthRequest<'a> {
    req: &'a str,
}

#[derive(Deserialize)]
struct GpuState {
    #[serde(rename = "Device")]
    device: String,
    #[serde(rename = "Health")]
    health: String,
}

#[derive(Deserialize)]
struct HealthResponse {
    #[serde(rename = "GPUState", default)]
    gpu_state: Vec<GpuState>,
}

pub struct HealthClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl Default for HealthClient {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(HEALTH_SOCKET),
            timeout: HEALTH_QUERY_TIMEOUT,
        }
    }
}

impl HealthClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_socket_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.socket_path = PathBuf::from(path.as_ref());
        self
    }

    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Query per-device health. Errors out fast when the exporter socket is
    /// not there at all so the caller can fall back without waiting on the
    /// timeout.
    pub fn gpu_health(&self) -> Result<HashMap<String, Health>> {
        if !self.socket_path.exists() {
            bail!("health socket {:?} does not exist", self.socket_path);
        }

        let stream = UnixStream::connect(&self.socket_path)
            .with_context(|| format!("connecting to {:?}", self.socket_path))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let req = serde_json::to_string(&HealthRequest { req: "list" })? + "\n";
        trace!("health request: {}", req.trim());
        stream
            .try_clone()?
            .write_all(req.as_bytes())
            .context("sending health request")?;

        let mut line = String::new();
        BufReader::new(stream)
            .read_line(&mut line)
            .context("reading health response")?;
        trace!("health response: {}", line.trim());

        let resp: HealthResponse = serde_json::from_str(&line)?;
        let mut map = HashMap::new();
        for gpu in resp.gpu_state {
            let health = if gpu.health.eq_ignore_ascii_case("healthy") {
                Health::Healthy
            } else {
                Health::Unhealthy
            };
            map.insert(gpu.device, health);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;

    #[test]
    fn missing_socket_errors() {
        let client = HealthClient::new().set_socket_path("/nonexistent/health.socket");
        assert!(client.gpu_health().is_err());
    }

    #[test]
    fn list_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health.socket");
        let listener = UnixListener::bind(&path).unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert!(line.contains("list"));

            let resp = concat!(
                r#"{"GPUState":[{"Device":"0000:19:00.0","Health":"healthy"},"#,
                r#"{"Device":"0000:1a:00.0","Health":"unhealthy"}]}"#,
                "\n"
            );
            let mut w = stream.try_clone().unwrap();
            w.write_all(resp.as_bytes()).unwrap();
        });

        let client = HealthClient::new()
            .set_socket_path(&path)
            .set_timeout(Duration::from_secs(1));
        let map = client.gpu_health().unwrap();
        server.join().unwrap();

        assert_eq!(map.get("0000:19:00.0"), Some(&Health::Healthy));
        assert_eq!(map.get("0000:1a:00.0"), Some(&Health::Unhealthy));
    }

    #[test]
    fn health_strings() {
        assert_eq!(Health::from_bool(true).as_str(), "Healthy");
        assert_eq!(Health::from_bool(false).as_str(), "Unhealthy");
    }
}

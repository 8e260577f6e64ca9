//! One-shot remote commands: arbitrary exec and a `/proc` based resource
//! snapshot for the status panel.

use crate::SessionError;
use serde::Serialize;
use transport::{ExecOutput, Transport};

/// Reads everything [`parse_resource_usage`] needs in a single exec.
pub const RESOURCE_COMMAND: &str = "cat /proc/loadavg /proc/meminfo /proc/uptime";

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Resource probe failed (exit code {code:?}): {stderr}")]
    CommandFailed { code: Option<u32>, stderr: String },
    #[error("Unexpected /proc output: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<u32>,
}

impl From<ExecOutput> for CommandOutput {
    fn from(output: ExecOutput) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub mem_total_kb: u64,
    pub mem_available_kb: u64,
    pub uptime_secs: u64,
}

pub async fn exec_command(
    transport: &dyn Transport,
    command: &str,
) -> Result<CommandOutput, SessionError> {
    if command.trim().is_empty() {
        return Err(SessionError::missing("command"));
    }
    let output = transport.exec(command).await?;
    tracing::debug!(exit_code = ?output.exit_code, "Remote command finished");
    Ok(output.into())
}

pub async fn resource_usage(transport: &dyn Transport) -> Result<ResourceUsage, SessionError> {
    let output = transport.exec(RESOURCE_COMMAND).await?;
    if !output.success() {
        return Err(ProbeError::CommandFailed {
            code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        }
        .into());
    }
    Ok(parse_resource_usage(&output.stdout)?)
}

/// Parse the concatenation of `/proc/loadavg`, `/proc/meminfo` and
/// `/proc/uptime`.
///
/// Kernels older than 3.14 have no `MemAvailable`; it is estimated from
/// `MemFree + Buffers + Cached` there.
pub fn parse_resource_usage(text: &str) -> Result<ResourceUsage, ProbeError> {
    let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());

    let loadavg = lines
        .next()
        .ok_or_else(|| ProbeError::Parse("empty output".into()))?;
    let mut loads = loadavg.split_whitespace().map(|field| field.parse::<f64>());
    let mut next_load = || {
        loads
            .next()
            .and_then(Result::ok)
            .ok_or_else(|| ProbeError::Parse(format!("bad loadavg line {loadavg:?}")))
    };
    let (load1, load5, load15) = (next_load()?, next_load()?, next_load()?);

    let mut mem_total = None;
    let mut mem_available = None;
    let mut mem_fallback = 0u64;
    let mut uptime = None;
    for line in lines {
        match line.split_once(':') {
            Some((key, value)) => {
                let kb = value
                    .split_whitespace()
                    .next()
                    .and_then(|number| number.parse::<u64>().ok());
                match (key, kb) {
                    ("MemTotal", Some(kb)) => mem_total = Some(kb),
                    ("MemAvailable", Some(kb)) => mem_available = Some(kb),
                    ("MemFree" | "Buffers" | "Cached", Some(kb)) => mem_fallback += kb,
                    _ => {}
                }
            }
            None => {
                uptime = line
                    .split_whitespace()
                    .next()
                    .and_then(|secs| secs.parse::<f64>().ok());
            }
        }
    }

    let mem_total_kb = mem_total.ok_or_else(|| ProbeError::Parse("missing MemTotal".into()))?;
    let uptime = uptime.ok_or_else(|| ProbeError::Parse("missing uptime".into()))?;
    Ok(ResourceUsage {
        load1,
        load5,
        load15,
        mem_total_kb,
        mem_available_kb: mem_available.unwrap_or(mem_fallback),
        uptime_secs: uptime as u64,
    })
}

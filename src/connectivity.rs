use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::AccessPoint;

/// Association attempts per `ensure_connected` call. The loop retries on the
/// next tick, so the update listener is never starved longer than this many
/// bounded attempts.
const MAX_ATTEMPTS_PER_CALL: usize = 3;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// The wireless interface as the supervisor sees it: association against one
/// candidate, and a cheap signal-strength probe. The production
/// implementation drives `nmcli`; tests substitute a scripted link.
#[async_trait]
pub trait NetworkLink: Send {
    async fn associate(&mut self, ap: &AccessPoint) -> anyhow::Result<()>;

    /// Signal strength of the current association, `None` when the interface
    /// reports no active network. A reading of 0 is the "likely lost"
    /// sentinel.
    async fn signal_strength(&mut self) -> Option<i32>;
}

/// Owns the network association state. The only externally observable state
/// machine in the agent: `Disconnected` -> `Connected` -> `Disconnected`.
pub struct ConnectivitySupervisor<L> {
    link: L,
    candidates: Vec<AccessPoint>,
    state: ConnectionState,
}

impl<L: NetworkLink> ConnectivitySupervisor<L> {
    pub fn new(link: L, candidates: Vec<AccessPoint>) -> Self {
        Self {
            link,
            candidates,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Cheap liveness probe, run once per tick. A false negative (declaring
    /// connected while actually lost) is acceptable and self-corrects on the
    /// next failed publish.
    pub async fn is_likely_lost(&mut self) -> bool {
        if self.state == ConnectionState::Disconnected {
            return true;
        }
        match self.link.signal_strength().await {
            Some(rssi) if rssi != 0 => false,
            _ => {
                warn!("Wifi connection lost");
                self.state = ConnectionState::Disconnected;
                true
            }
        }
    }

    /// No-op when connected. Otherwise walks the candidate list in order,
    /// capped at [`MAX_ATTEMPTS_PER_CALL`] bounded attempts, then returns and
    /// leaves the retry to the next tick.
    pub async fn ensure_connected(&mut self) -> ConnectionState {
        if self.state == ConnectionState::Connected || self.candidates.is_empty() {
            return self.state;
        }
        info!("Connecting to wifi");
        for attempt in 0..MAX_ATTEMPTS_PER_CALL {
            let ap = &self.candidates[attempt % self.candidates.len()];
            match self.link.associate(ap).await {
                Ok(()) => {
                    info!(ssid = %ap.ssid, "Wifi connected");
                    self.state = ConnectionState::Connected;
                    return self.state;
                }
                Err(e) => {
                    warn!(ssid = %ap.ssid, "Association failed: {e:#}");
                }
            }
        }
        warn!("No wifi candidate reachable, retrying next tick");
        self.state
    }
}

/// Drives NetworkManager through `nmcli`. Every invocation is bounded by
/// [`COMMAND_TIMEOUT`] so a wedged command cannot stall the loop forever.
pub struct NmcliLink {
    iface: String,
}

impl NmcliLink {
    pub fn new(iface: impl Into<String>) -> Self {
        Self {
            iface: iface.into(),
        }
    }

    async fn run(args: &[&str]) -> anyhow::Result<String> {
        let output = tokio::time::timeout(COMMAND_TIMEOUT, Command::new("nmcli").args(args).output())
            .await
            .map_err(|_| anyhow!("nmcli timed out"))?
            .context("failed to run nmcli")?;
        if !output.status.success() {
            bail!(
                "nmcli exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl NetworkLink for NmcliLink {
    async fn associate(&mut self, ap: &AccessPoint) -> anyhow::Result<()> {
        Self::run(&[
            "device", "wifi", "connect", &ap.ssid, "password", &ap.psk, "ifname", &self.iface,
        ])
        .await?;
        Ok(())
    }

    async fn signal_strength(&mut self) -> Option<i32> {
        let stdout = Self::run(&[
            "-t", "-f", "IN-USE,SIGNAL", "device", "wifi", "list", "ifname", &self.iface,
            "--rescan", "no",
        ])
        .await
        .ok()?;
        parse_in_use_signal(&stdout)
    }
}

/// Parses terse `nmcli -t -f IN-USE,SIGNAL` output, e.g. `*:73` for the
/// in-use network and `:41` for the rest.
fn parse_in_use_signal(stdout: &str) -> Option<i32> {
    stdout.lines().find_map(|line| {
        let (in_use, signal) = line.split_once(':')?;
        if in_use.trim() == "*" {
            signal.trim().parse().ok()
        } else {
            None
        }
    })
}

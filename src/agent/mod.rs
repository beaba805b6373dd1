//! Agent
//!
//! Management facade over the [`Bridge`]: start with a cloud target, stop,
//! and report status. The [`ControlBus`] exposes the same operations over
//! MQTT on the local broker.

mod bus;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use crate::bridge::{Bridge, BridgeError, BridgeStatus};

pub use bus::{
    ControlBus, ControlResponse, CONNECT_TOPIC, DISCONNECT_TOPIC, RESPONSE_TOPIC, STATUS_TOPIC,
};

/// Periodic status report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(flatten)]
    pub bridge: BridgeStatus,
    /// Unix time the report was taken
    pub time: u64,
    /// Seconds since the agent was created
    pub uptime: u64,
}

pub struct Agent {
    bridge: Bridge,
    started_at: Instant,
}

impl Agent {
    pub fn new(bridge: Bridge) -> Self {
        Self {
            bridge,
            started_at: Instant::now(),
        }
    }

    pub async fn start_bridge(&self, url: &str, token: &str) -> Result<(), BridgeError> {
        info!("start bridge requested");
        self.bridge.start(url, token).await
    }

    pub async fn stop_bridge(&self) -> Result<(), BridgeError> {
        info!("stop bridge requested");
        self.bridge.stop().await
    }

    pub fn query_status(&self) -> StatusReport {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        StatusReport {
            bridge: self.bridge.status(),
            time,
            uptime: self.started_at.elapsed().as_secs(),
        }
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }
}

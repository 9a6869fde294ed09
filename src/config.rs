use std::{path::PathBuf, time::Duration};

use bitcoin::Network;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Root directory for file backed persistence.
    pub data_dir: PathBuf,
    pub network: Network,
    /// Upper bound for a single task. `None` lets a task wait indefinitely.
    pub task_timeout: Option<Duration>,
    pub request_channel_size: usize,
    /// Capacity of the channel handed out by `TradeManager::subscribe_notifs`.
    pub notif_channel_size: usize,
    /// Depth at which a payout counts as settled.
    pub payout_confirmations: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("fiatswap_data"),
            network: Network::Regtest,
            task_timeout: Some(Duration::from_secs(60)),
            request_channel_size: 10,
            notif_channel_size: 20,
            payout_confirmations: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_partial_json_falls_back_to_defaults() {
        let json = r#"{ "data_dir": "/tmp/swap", "payout_confirmations": 3 }"#;
        let config: ProtocolConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/swap"));
        assert_eq!(config.payout_confirmations, 3);
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.request_channel_size, 10);
    }
}

use serde::Deserialize;

pub const STATE_VERSION: u8 = 1;
pub const TX_VERSION: u32 = 1;
pub const MAX_CONTRACTS: usize = 100;
/// Seconds a transaction timestamp may run ahead of the local clock.
pub const MAX_UNIFIED_DRIFT: u64 = 10;

// compact size markers
pub const COMPACT_U16: u8 = 0xfd;
pub const COMPACT_U32: u8 = 0xfe;
pub const COMPACT_U64: u8 = 0xff;

/// Runtime switches shared by the engine and the mempool.
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Enables AUTHORIZE (permissioned networks only).
    pub private_mode: bool,
    /// Unified time at which the current transaction version activates.
    pub activation_timestamp: u64,
    pub max_drift: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            private_mode: false,
            activation_timestamp: 0,
            max_drift: MAX_UNIFIED_DRIFT,
        }
    }
}

#[test]
fn test_config_defaults() {
    let c: Config = serde_json::from_str(r#"{"privateMode": true}"#).unwrap();
    assert!(c.private_mode);
    assert_eq!(c.max_drift, MAX_UNIFIED_DRIFT);
    assert_eq!(c.activation_timestamp, 0);
}

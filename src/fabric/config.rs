use std::path::PathBuf;
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::options::DEFAULT_TIMEOUT;

/// Gateway identity and network coordinates of a [`FabricTransport`](super::FabricTransport).
#[derive(TypedBuilder, Debug, Clone)]
pub struct FabricSettings {
    /// Wallet label of the identity used to submit transactions.
    #[builder(setter(into))]
    pub identity: String,
    #[builder(setter(into))]
    pub msp_id: String,
    /// PEM encoded certificate of the identity.
    #[builder(setter(into))]
    pub certificate: String,
    /// PEM encoded private key of the identity.
    #[builder(setter(into))]
    pub private_key: String,
    #[builder(setter(into))]
    pub network_name: String,
    #[builder(default, setter(into))]
    pub channel_name: String,
    #[builder(setter(into))]
    pub chaincode_name: String,
    /// Path of the connection profile describing peers and orderers.
    #[builder(setter(into))]
    pub connection_profile_path: PathBuf,
    #[builder(default)]
    pub is_discovery_enabled: bool,
    #[builder(default = Duration::from_secs(1))]
    pub reconnect_delay: Duration,
    /// Extra attempts after the first failed connection.
    #[builder(default)]
    pub reconnect_max_attempts: u32,
    #[builder(default = DEFAULT_TIMEOUT)]
    pub default_timeout: Duration,
}

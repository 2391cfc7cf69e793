//! Connection parameters (§6 "Recognized configuration options"). The core reads
//! no environment variables and touches no files; everything is passed in here.

use crate::keystore::Identity;
use crate::transport::TlsVerifyPolicy;
use crate::version::{MAX_DATA_API_28, V_SKIP_CHECKSUM};
use std::time::Duration;

/// Policy for the optional in-band TLS upgrade after CNXN/AUTH.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TlsPolicy {
    /// Upgrade to TLS if the daemon offers STLS.
    PreferIfOffered,
    /// Never upgrade, even if offered.
    Forbid,
}

pub struct Config {
    pub(crate) advertised_version: u32,
    pub(crate) advertised_max_data: u32,
    pub(crate) system_banner: String,
    pub(crate) identities: Vec<Identity>,
    pub(crate) tls: TlsPolicy,
    pub(crate) tls_server_name: String,
    pub(crate) tls_verify_policy: TlsVerifyPolicy,
    pub(crate) handshake_deadline: Duration,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

pub struct ConfigBuilder {
    advertised_version: u32,
    advertised_max_data: u32,
    system_banner: String,
    identities: Vec<Identity>,
    tls: TlsPolicy,
    tls_server_name: String,
    tls_verify_policy: TlsVerifyPolicy,
    handshake_deadline: Duration,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            advertised_version: V_SKIP_CHECKSUM,
            advertised_max_data: MAX_DATA_API_28,
            system_banner: "host::\0".to_string(),
            identities: Vec::new(),
            tls: TlsPolicy::PreferIfOffered,
            tls_server_name: "adbd".to_string(),
            // adbd's TLS certificate is self-signed with no CA to verify against;
            // callers pairing against real hardware should supply the pinned
            // certificate captured during pairing instead of this default.
            tls_verify_policy: TlsVerifyPolicy::InsecureSkipVerify,
            handshake_deadline: Duration::from_secs(10),
        }
    }
}

impl ConfigBuilder {
    pub fn advertised_version(mut self, version: u32) -> Self {
        self.advertised_version = version;
        self
    }

    pub fn advertised_max_data(mut self, max_data: u32) -> Self {
        self.advertised_max_data = max_data;
        self
    }

    pub fn system_banner(mut self, banner: impl Into<String>) -> Self {
        let mut banner = banner.into();
        if !banner.ends_with('\0') {
            banner.push('\0');
        }
        self.system_banner = banner;
        self
    }

    pub fn add_identity(mut self, identity: Identity) -> Self {
        self.identities.push(identity);
        self
    }

    pub fn tls(mut self, policy: TlsPolicy) -> Self {
        self.tls = policy;
        self
    }

    pub fn tls_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.tls_server_name = server_name.into();
        self
    }

    pub fn tls_verify_policy(mut self, policy: TlsVerifyPolicy) -> Self {
        self.tls_verify_policy = policy;
        self
    }

    pub fn handshake_deadline(mut self, deadline: Duration) -> Self {
        self.handshake_deadline = deadline;
        self
    }

    pub fn build(self) -> Config {
        Config {
            advertised_version: self.advertised_version,
            advertised_max_data: self.advertised_max_data,
            system_banner: self.system_banner,
            identities: self.identities,
            tls: self.tls,
            tls_server_name: self.tls_server_name,
            tls_verify_policy: self.tls_verify_policy,
            handshake_deadline: self.handshake_deadline,
        }
    }
}

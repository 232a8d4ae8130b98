//! Relay and reachability servers handed to clients
//!
//! Every connection receives one `Config` envelope listing the servers its
//! connectivity layer may use. Providers may tailor the list (and TURN
//! credentials) per user.

use devnet_protocol::{Config, IceServer};

/// Supplies the ICE servers for an authenticated user
pub trait IceServerProvider: Send + Sync {
    fn ice_servers(&self, name: &str) -> Vec<IceServer>;

    /// The `Config` payload pushed to `name` after registration
    fn config_for(&self, name: &str) -> Config {
        Config {
            ice_servers: self.ice_servers(name),
        }
    }
}

/// The same servers for every user
impl IceServerProvider for Vec<IceServer> {
    fn ice_servers(&self, _name: &str) -> Vec<IceServer> {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_list_builds_config() {
        let servers = vec![
            IceServer::open("stun:stun.devnet.test:3478"),
            IceServer {
                urls: vec!["turn:turn.devnet.test:3478".into()],
                username: Some("alice".into()),
                credential: Some("secret".into()),
            },
        ];
        let config = servers.config_for("alice");
        assert_eq!(config.ice_servers, servers);
    }
}

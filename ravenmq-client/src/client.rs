//! High-level client interface

use std::sync::Arc;

use crate::config::LocatorConfig;
use crate::locator::ServerLocator;
use crate::topology::Endpoint;
use crate::transport::Connector;
use crate::Result;

/// Entry point for creating server locators
pub struct RavenClient;

impl RavenClient {
    /// Locator over a fixed list of servers; topology pushed by the
    /// servers is ignored
    pub fn create_locator_without_ha<I>(
        connector: Arc<dyn Connector>,
        endpoints: I,
        config: LocatorConfig,
    ) -> Result<ServerLocator>
    where
        I: IntoIterator<Item = Endpoint>,
    {
        ServerLocator::new(connector, endpoints.into_iter().collect(), false, config)
    }

    /// Locator that follows the cluster topology; `endpoints` are only used
    /// to reach the cluster the first time
    pub fn create_locator_with_ha<I>(
        connector: Arc<dyn Connector>,
        endpoints: I,
        config: LocatorConfig,
    ) -> Result<ServerLocator>
    where
        I: IntoIterator<Item = Endpoint>,
    {
        ServerLocator::new(connector, endpoints.into_iter().collect(), true, config)
    }

    /// Non-HA locator with default configuration
    pub fn with_endpoints<I>(connector: Arc<dyn Connector>, endpoints: I) -> Result<ServerLocator>
    where
        I: IntoIterator<Item = Endpoint>,
    {
        Self::create_locator_without_ha(connector, endpoints, LocatorConfig::default())
    }
}

use thiserror::Error;

use crate::bus::BusError;
use crate::config::ConfigError;
use crate::publisher::PublishError;
use crate::registrar::ProvisioningError;
use crate::registry::RegistryError;
use crate::router::RouterError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Router error: {0}")]
    Router(#[from] RouterError),
    #[error("Provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ProcessorResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}

//! Backend selection.

use super::{Broker, DurableBroker, DurableOptions, InProcessBroker};
use crate::config::{BackendKind, BrokerConfig};
use crate::error::Result;
use crate::log::KafkaLog;
use std::sync::Arc;
use tracing::info;

/// Build the backend `config` selects.
///
/// Fails when the configuration is invalid or when no durable node can be
/// reached. A topic that cannot be provisioned is not an error here.
pub async fn connect(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    config.validate()?;

    let broker: Arc<dyn Broker> = match config.backend {
        BackendKind::InProcess => Arc::new(InProcessBroker::with_capacity(config.buffer_capacity)),
        BackendKind::Durable => {
            let log = KafkaLog::connect(&config.nodes, config.partitions, config.connect_timeout)
                .await?;
            let options = DurableOptions::from_config(config);
            Arc::new(DurableBroker::start(Arc::new(log), options).await)
        }
    };

    info!(
        backend = broker.backend().as_str(),
        capacity = config.buffer_capacity,
        "broker ready"
    );
    Ok(broker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;

    #[tokio::test]
    async fn test_default_is_in_process() {
        let broker = connect(&BrokerConfig::default()).await.unwrap();
        assert_eq!(broker.backend(), BackendKind::InProcess);
        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = BrokerConfig {
            buffer_capacity: 0,
            ..BrokerConfig::default()
        };
        assert!(matches!(connect(&config).await, Err(BrokerError::Config(_))));
    }
}

//! The librdkafka backed administrative client.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, ResourceSpecifier};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::ClientConfig;
use tokio::time::timeout;

use super::{bootstrap_servers, AdminConnector, ClusterAdmin, PartitionInfo, TopicDescription, TopicListing};
use crate::cluster::ClusterIdentity;
use crate::error::AdminError;

/// Creates rdkafka admin clients against the brokers of managed clusters.
#[derive(Clone, Debug)]
pub struct KafkaAdminConnector {
    /// The timeout of each administrative call.
    timeout: Duration,
}

impl KafkaAdminConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl AdminConnector for KafkaAdminConnector {
    async fn connect(&self, cluster: &ClusterIdentity) -> Result<Arc<dyn ClusterAdmin>, AdminError> {
        let servers = bootstrap_servers(cluster);
        tracing::debug!(%cluster, %servers, "creating admin client");
        let client: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &servers)
            .set("socket.timeout.ms", self.timeout.as_millis().to_string())
            .create()
            .map_err(|err| AdminError::Unavailable(format!("error creating admin client for {}: {}", servers, err)))?;
        Ok(Arc::new(KafkaAdmin {
            client: Arc::new(client),
            timeout: self.timeout,
        }))
    }
}

/// An admin client connected to one managed cluster.
struct KafkaAdmin {
    client: Arc<AdminClient<DefaultClientContext>>,
    timeout: Duration,
}

impl KafkaAdmin {
    /// Fetch cluster metadata, which is a blocking call in librdkafka.
    async fn fetch_metadata(&self, topic: Option<String>) -> Result<Vec<TopicDescription>, AdminError> {
        let (client, wait) = (self.client.clone(), self.timeout);
        let topics = tokio::task::spawn_blocking(move || -> Result<Vec<TopicDescription>, AdminError> {
            let metadata = client.inner().fetch_metadata(topic.as_deref(), wait).map_err(map_kafka_error)?;
            metadata
                .topics()
                .iter()
                .map(|topic| {
                    if let Some(code) = topic.error() {
                        return Err(map_error_code(topic.name(), code.into()));
                    }
                    Ok(TopicDescription {
                        name: topic.name().into(),
                        internal: topic.name().starts_with("__"),
                        partitions: topic
                            .partitions()
                            .iter()
                            .map(|p| {
                                let leader = if p.leader() < 0 { None } else { Some(p.leader()) };
                                PartitionInfo::new(p.id(), leader, p.replicas().iter().copied(), p.isr().iter().copied())
                            })
                            .collect(),
                    })
                })
                .collect()
        })
        .await
        .map_err(|err| AdminError::Other(format!("error joining metadata task: {}", err)))??;
        Ok(topics)
    }
}

#[async_trait]
impl ClusterAdmin for KafkaAdmin {
    async fn list_topics(&self) -> Result<Vec<TopicListing>, AdminError> {
        let topics = self.fetch_metadata(None).await?;
        Ok(topics
            .into_iter()
            .map(|topic| TopicListing {
                name: topic.name,
                internal: topic.internal,
            })
            .collect())
    }

    async fn describe_topics(&self, names: &[String]) -> Result<Vec<TopicDescription>, AdminError> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let mut topics = self.fetch_metadata(Some(name.clone())).await?;
            match topics.pop() {
                Some(topic) => out.push(topic),
                None => return Err(AdminError::NotFound(name.clone())),
            }
        }
        Ok(out)
    }

    async fn describe_config(&self, topic: &str) -> Result<BTreeMap<String, String>, AdminError> {
        let opts = AdminOptions::new().request_timeout(Some(self.timeout));
        let results = timeout(self.timeout, self.client.describe_configs(&[ResourceSpecifier::Topic(topic)], &opts))
            .await
            .map_err(|_| AdminError::Timeout(format!("describing config of topic {}", topic)))?
            .map_err(map_kafka_error)?;

        let mut config = BTreeMap::new();
        for res in results {
            let resource = res.map_err(|code| map_error_code(topic, code))?;
            for entry in resource.entries {
                if let Some(value) = entry.value {
                    config.insert(entry.name, value);
                }
            }
        }
        Ok(config)
    }
}

fn map_kafka_error(err: KafkaError) -> AdminError {
    match err.rdkafka_error_code() {
        Some(code) => map_error_code(&err.to_string(), code),
        None => AdminError::Other(err.to_string()),
    }
}

fn map_error_code(subject: &str, code: RDKafkaErrorCode) -> AdminError {
    match code {
        RDKafkaErrorCode::OperationTimedOut | RDKafkaErrorCode::RequestTimedOut => AdminError::Timeout(format!("{}: {}", subject, code)),
        RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic => AdminError::NotFound(format!("{}: {}", subject, code)),
        _ => AdminError::Other(format!("{}: {}", subject, code)),
    }
}

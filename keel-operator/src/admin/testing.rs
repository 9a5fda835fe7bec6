//! In-memory administrative interface used by tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{AdminConnector, ClusterAdmin, PartitionInfo, TopicDescription, TopicListing, MIN_INSYNC_REPLICAS};
use crate::cluster::ClusterIdentity;
use crate::error::AdminError;

#[derive(Clone, Debug, Default)]
struct FakeTopic {
    internal: bool,
    partitions: Vec<PartitionInfo>,
    config: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct FakeState {
    topics: BTreeMap<String, FakeTopic>,
    list_error: Option<AdminError>,
    describe_error: Option<AdminError>,
    config_errors: BTreeMap<String, AdminError>,
}

/// An in-memory cluster admin with failure injection.
#[derive(Clone, Debug, Default)]
pub struct FakeAdmin {
    state: Arc<Mutex<FakeState>>,
    /// The number of `list_topics` calls, one per roll decision.
    pub queries: Arc<AtomicUsize>,
}

impl FakeAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a topic, optionally configuring its `min.insync.replicas`.
    pub fn with_topic(self, name: &str, min_isr: Option<i32>, partitions: Vec<PartitionInfo>) -> Self {
        let mut config = BTreeMap::new();
        if let Some(min_isr) = min_isr {
            config.insert(MIN_INSYNC_REPLICAS.to_string(), min_isr.to_string());
        }
        self.with_topic_config(name, config, partitions)
    }

    pub fn with_topic_config(self, name: &str, config: BTreeMap<String, String>, partitions: Vec<PartitionInfo>) -> Self {
        self.lock().topics.insert(
            name.into(),
            FakeTopic {
                internal: name.starts_with("__"),
                partitions,
                config,
            },
        );
        self
    }

    /// Replace the partitions of an existing topic.
    pub fn set_partitions(&self, name: &str, partitions: Vec<PartitionInfo>) {
        if let Some(topic) = self.lock().topics.get_mut(name) {
            topic.partitions = partitions;
        }
    }

    pub fn fail_list(&self, err: AdminError) {
        self.lock().list_error = Some(err);
    }

    pub fn fail_describe(&self, err: AdminError) {
        self.lock().describe_error = Some(err);
    }

    pub fn fail_config(&self, topic: &str, err: AdminError) {
        self.lock().config_errors.insert(topic.into(), err);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake admin state poisoned")
    }
}

#[async_trait]
impl ClusterAdmin for FakeAdmin {
    async fn list_topics(&self) -> Result<Vec<TopicListing>, AdminError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        if let Some(err) = &state.list_error {
            return Err(err.clone());
        }
        Ok(state
            .topics
            .iter()
            .map(|(name, topic)| TopicListing {
                name: name.clone(),
                internal: topic.internal,
            })
            .collect())
    }

    async fn describe_topics(&self, names: &[String]) -> Result<Vec<TopicDescription>, AdminError> {
        let state = self.lock();
        if let Some(err) = &state.describe_error {
            return Err(err.clone());
        }
        names
            .iter()
            .map(|name| -> Result<TopicDescription, AdminError> {
                let topic = state.topics.get(name).ok_or_else(|| AdminError::NotFound(name.clone()))?;
                Ok(TopicDescription {
                    name: name.clone(),
                    internal: topic.internal,
                    partitions: topic.partitions.clone(),
                })
            })
            .collect()
    }

    async fn describe_config(&self, topic: &str) -> Result<BTreeMap<String, String>, AdminError> {
        let state = self.lock();
        if let Some(err) = state.config_errors.get(topic) {
            return Err(err.clone());
        }
        state.topics.get(topic).map(|t| t.config.clone()).ok_or_else(|| AdminError::NotFound(topic.into()))
    }
}

/// A connector always handing out the same fake admin.
#[derive(Clone, Debug, Default)]
pub struct FakeConnector {
    pub admin: FakeAdmin,
    pub connections: Arc<AtomicUsize>,
    pub connect_error: Option<AdminError>,
}

impl FakeConnector {
    pub fn new(admin: FakeAdmin) -> Self {
        Self {
            admin,
            connections: Default::default(),
            connect_error: None,
        }
    }
}

#[async_trait]
impl AdminConnector for FakeConnector {
    async fn connect(&self, _cluster: &ClusterIdentity) -> Result<Arc<dyn ClusterAdmin>, AdminError> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.connect_error {
            return Err(err.clone());
        }
        Ok(Arc::new(self.admin.clone()))
    }
}

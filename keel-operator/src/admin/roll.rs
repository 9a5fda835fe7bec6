//! The availability-aware roll decision.
//!
//! Restarting a broker takes all of its replicas out of sync. A restart is only safe when no
//! partition hosted by the broker would drop below its topic's `min.insync.replicas`.

use std::collections::BTreeMap;

use futures::future::try_join_all;

use super::{ClusterAdmin, ReplicationSnapshot, TopicReplication, DEFAULT_MIN_INSYNC_REPLICAS, MIN_INSYNC_REPLICAS};
use crate::error::AdminError;

/// Decide whether the given broker may be restarted, based on the given snapshot.
///
/// Partitions whose replica count does not exceed their minimum in-sync count can never be
/// protected by withholding a restart, so they never block one. Every other partition hosted
/// by the broker must keep at least the minimum in-sync count without the broker. A broker
/// which is a replica but out of sync does not lower the count, so an already degraded
/// partition blocks every one of its replicas.
pub fn can_roll_with(broker: i32, snapshot: &ReplicationSnapshot) -> bool {
    for (name, topic) in snapshot.topics.iter() {
        for partition in topic.partitions.iter().filter(|p| p.replicas.contains(&broker)) {
            let replicas = partition.replicas.len() as i32;
            if replicas <= topic.min_isr {
                continue;
            }
            let resulting_isr = partition.isr.len() as i32 - i32::from(partition.isr.contains(&broker));
            if resulting_isr < topic.min_isr {
                tracing::debug!(
                    broker,
                    topic = %name,
                    partition = partition.id,
                    isr = ?partition.isr,
                    min_isr = topic.min_isr,
                    "restart of broker would leave partition below min in-sync replicas"
                );
                return false;
            }
        }
    }
    true
}

/// Query the replication state of all topics with a partition hosted by the given broker.
///
/// Configs are only described for the topics hosted by the broker, so a config failure of an
/// unrelated topic does not affect the broker.
#[tracing::instrument(level = "debug", skip(admin))]
pub async fn replication_snapshot(admin: &dyn ClusterAdmin, broker: i32) -> Result<ReplicationSnapshot, AdminError> {
    let names: Vec<String> = admin.list_topics().await?.into_iter().map(|listing| listing.name).collect();
    if names.is_empty() {
        return Ok(ReplicationSnapshot::default());
    }
    let hosted: Vec<_> = admin
        .describe_topics(&names)
        .await?
        .into_iter()
        .filter(|desc| desc.partitions.iter().any(|p| p.replicas.contains(&broker)))
        .collect();

    let topics = try_join_all(hosted.into_iter().map(|desc| async move {
        let config = admin.describe_config(&desc.name).await?;
        let min_isr = min_insync_replicas(&desc.name, &config)?;
        Ok::<_, AdminError>((
            desc.name,
            TopicReplication {
                internal: desc.internal,
                min_isr,
                partitions: desc.partitions,
            },
        ))
    }))
    .await?;

    Ok(ReplicationSnapshot {
        topics: topics.into_iter().collect(),
    })
}

/// Decide whether the given broker may be restarted, querying a fresh snapshot.
///
/// Any failure of the administrative interface is returned as is.
#[tracing::instrument(level = "debug", skip(admin))]
pub async fn can_roll(admin: &dyn ClusterAdmin, broker: i32) -> Result<bool, AdminError> {
    let snapshot = replication_snapshot(admin, broker).await?;
    Ok(can_roll_with(broker, &snapshot))
}

/// Get the `min.insync.replicas` of a topic from its config, defaulting to 1.
pub fn min_insync_replicas(topic: &str, config: &BTreeMap<String, String>) -> Result<i32, AdminError> {
    match config.get(MIN_INSYNC_REPLICAS) {
        None => Ok(DEFAULT_MIN_INSYNC_REPLICAS),
        Some(value) => value.trim().parse::<i32>().map_err(|_| AdminError::InvalidConfig {
            topic: topic.into(),
            key: MIN_INSYNC_REPLICAS.into(),
            value: value.clone(),
        }),
    }
}

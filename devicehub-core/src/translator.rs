//! Name translator: republishes UUID-namespaced device messages onto
//! name-namespaced application topics.
//!
//! Applications consume `$devicehub/devicedata/{name}/...`; devices publish
//! under their UUID. Resolution goes through a TTL cache backed by the
//! registry, and a background monitor re-resolves cached entries so renames
//! propagate without restarting the service.

use crate::mqtt_client::MqttClientTrait;
use crate::store::IdentityStore;
use crate::{topics, MqttError, MqttMessage, MqttResult};

use parking_lot::RwLock;
use rumqttc::QoS;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

struct CacheEntry {
    name: String,
    resolved_at: Instant,
}

pub struct NameTranslator {
    client: Arc<dyn MqttClientTrait>,
    store: IdentityStore,
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

impl NameTranslator {
    pub fn new(
        client: Arc<dyn MqttClientTrait>,
        store: IdentityStore,
        ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            store,
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        })
    }

    /// Subscribe to the source topics, start the republish loop and the
    /// cache monitor.
    pub async fn start(self: &Arc<Self>) -> MqttResult<()> {
        self.client
            .subscribe(topics::TRANSLATOR_SOURCE_FILTER, QoS::AtLeastOnce)
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<MqttMessage>();
        self.client.set_message_callback(Arc::new(move |message| {
            tx.send(message)
                .map_err(|e| MqttError::MessageParsing(format!("Handler queue closed: {}", e)))
        }));

        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                service.handle_message(message).await;
            }
        });

        // Re-resolve cached names at twice the TTL so renames and deletions
        // are picked up even for devices that publish continuously.
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.ttl * 2);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                monitor.refresh_cache().await;
            }
        });

        info!("Name translator started (cache TTL {:?})", self.ttl);
        Ok(())
    }

    pub async fn handle_message(&self, message: MqttMessage) {
        let Some((uuid, rest)) = topics::parse_translator_source(&message.topic) else {
            debug!("Ignoring message on topic {}", message.topic);
            return;
        };
        let uuid = uuid.to_string();
        let rest = rest.to_string();

        let Some(name) = self.resolve(&uuid).await else {
            // Unknown device: drop silently
            debug!("No name for device {}, dropping message", uuid);
            return;
        };

        let target = topics::devicedata(&name, &rest);
        if let Err(e) = self
            .client
            .publish(&target, &message.payload, QoS::AtLeastOnce)
            .await
        {
            error!("Republish to {} failed: {}", target, e);
        }
    }

    /// Resolve a UUID to its device name through the cache.
    pub async fn resolve(&self, uuid: &str) -> Option<String> {
        {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(uuid) {
                if entry.resolved_at.elapsed() < self.ttl {
                    return Some(entry.name.clone());
                }
            }
        }

        match self.store.device_resolve_name_by_uuid(uuid).await {
            Ok(Some(name)) => {
                self.cache.write().insert(
                    uuid.to_string(),
                    CacheEntry {
                        name: name.clone(),
                        resolved_at: Instant::now(),
                    },
                );
                Some(name)
            }
            Ok(None) => {
                self.cache.write().remove(uuid);
                None
            }
            Err(e) => {
                warn!("Name resolution for {} failed: {}", uuid, e);
                None
            }
        }
    }

    /// Re-resolve every cached UUID, invalidating entries whose name changed
    /// or whose device disappeared. The next message then performs a fresh
    /// lookup.
    pub async fn refresh_cache(&self) {
        let uuids: Vec<String> = self.cache.read().keys().cloned().collect();
        for uuid in uuids {
            match self.store.device_resolve_name_by_uuid(&uuid).await {
                Ok(Some(name)) => {
                    let mut cache = self.cache.write();
                    let renamed = cache
                        .get(&uuid)
                        .map(|entry| entry.name != name)
                        .unwrap_or(false);
                    if renamed {
                        debug!("Device {} renamed, invalidating cache entry", uuid);
                        cache.remove(&uuid);
                    }
                }
                Ok(None) => {
                    debug!("Device {} gone, dropping cache entry", uuid);
                    self.cache.write().remove(&uuid);
                }
                Err(e) => {
                    warn!("Cache refresh for {} failed: {}", uuid, e);
                }
            }
        }
    }

    #[cfg(test)]
    fn cached_name(&self, uuid: &str) -> Option<String> {
        self.cache.read().get(uuid).map(|entry| entry.name.clone())
    }
}

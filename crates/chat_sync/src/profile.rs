use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use shared::{domain::UserId, protocol::ProfileSummary};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::warn;

use crate::transport::ProfileLookup;

/// Cache of sender profiles for the rendering layer. Reads never wait on the
/// network; unknown senders are resolved in the background.
pub struct ProfileDirectory {
    lookup: Arc<dyn ProfileLookup>,
    cache: RwLock<HashMap<UserId, Option<ProfileSummary>>>,
    inflight: Mutex<HashSet<UserId>>,
    updates: broadcast::Sender<UserId>,
}

impl ProfileDirectory {
    pub fn new(lookup: Arc<dyn ProfileLookup>) -> Arc<Self> {
        let (updates, _) = broadcast::channel(64);
        Arc::new(Self {
            lookup,
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashSet::new()),
            updates,
        })
    }

    pub async fn profile(&self, user_id: UserId) -> Option<ProfileSummary> {
        self.cache.read().await.get(&user_id).cloned().flatten()
    }

    pub async fn display_name(&self, user_id: UserId) -> Option<String> {
        self.profile(user_id)
            .await
            .and_then(|profile| profile.display_name)
    }

    /// Fires when a lookup for the user completes.
    pub fn subscribe(&self) -> broadcast::Receiver<UserId> {
        self.updates.subscribe()
    }

    /// Resolves users that are neither cached nor already being looked up.
    pub fn prefetch(self: &Arc<Self>, user_ids: impl IntoIterator<Item = UserId>) {
        let user_ids: Vec<UserId> = user_ids.into_iter().collect();
        let directory = Arc::clone(self);
        tokio::spawn(async move {
            let pending = directory.claim_unknown(user_ids).await;
            for user_id in pending {
                directory.resolve(user_id).await;
            }
        });
    }

    async fn claim_unknown(&self, user_ids: Vec<UserId>) -> Vec<UserId> {
        let cache = self.cache.read().await;
        let mut inflight = self.inflight.lock().await;
        let mut claimed = Vec::new();
        for user_id in user_ids {
            if cache.contains_key(&user_id) || !inflight.insert(user_id) {
                continue;
            }
            claimed.push(user_id);
        }
        claimed
    }

    async fn resolve(&self, user_id: UserId) {
        match self.lookup.lookup(user_id).await {
            Ok(profile) => {
                self.cache.write().await.insert(user_id, profile);
                let _ = self.updates.send(user_id);
            }
            Err(error) => {
                warn!(user_id = user_id.0, %error, "profile lookup failed");
            }
        }
        self.inflight.lock().await.remove(&user_id);
    }
}

#[cfg(test)]
#[path = "tests/profile_tests.rs"]
mod tests;

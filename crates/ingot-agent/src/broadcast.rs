use std::{collections::HashMap, sync::Arc};

use ingot_process::{SessionEvent, TenantId};
use tokio::sync::{RwLock, broadcast};

const ROOM_CAPACITY: usize = 1024;

/// Room-per-tenant fan-out of console output and status changes.
///
/// There is no replay: a viewer sees only what is published after it
/// subscribed, and is expected to read the transcript for history.
#[derive(Clone, Default)]
pub struct SessionBroadcastHub {
    rooms: Arc<RwLock<HashMap<TenantId, broadcast::Sender<SessionEvent>>>>,
}

impl SessionBroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, tenant: &TenantId) -> broadcast::Receiver<SessionEvent> {
        if let Some(tx) = self.rooms.read().await.get(tenant) {
            return tx.subscribe();
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(tenant.clone())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .subscribe()
    }

    /// Deliver to everyone currently in the room. Returns how many viewers got it.
    pub async fn publish(&self, tenant: &TenantId, event: SessionEvent) -> usize {
        let rooms = self.rooms.read().await;
        let Some(tx) = rooms.get(tenant) else {
            return 0;
        };
        tx.send(event).unwrap_or(0)
    }

    pub async fn viewer_count(&self, tenant: &TenantId) -> usize {
        self.rooms
            .read()
            .await
            .get(tenant)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop a room. Subscribers see the channel close.
    pub async fn close_room(&self, tenant: &TenantId) {
        self.rooms.write().await.remove(tenant);
    }
}

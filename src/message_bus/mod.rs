//! Inter-Agent Message Bus (§4.11). Durable, priority-ordered store-and-
//! forward mailbox between agents within an organization. Grounded on the
//! teacher's `policy::approval::ApprovalRouter` for the lock-guarded map plus
//! `broadcast`-notify-waiters shape, and on the teacher's scheduler modules'
//! use of a `BinaryHeap` with a custom `Ord` for priority dispatch.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

use crate::domain::InterAgentMessage;
use crate::storage::Storage;

/// Wraps a message for the heap: higher `priority` sorts first; ties broken
/// by earlier `created_at` (FIFO within a priority band).
struct QueuedMessage(InterAgentMessage);

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.created_at == other.0.created_at
    }
}
impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.created_at.cmp(&self.0.created_at))
    }
}

pub struct MessageBus {
    /// agent_id -> pending (unread) messages addressed directly to it.
    inboxes: RwLock<HashMap<String, BinaryHeap<QueuedMessage>>>,
    /// Messages with `to_agent: None` delivered to every agent of the org.
    broadcasts: RwLock<HashMap<String, BinaryHeap<QueuedMessage>>>,
    /// All messages ever sent, keyed by id, for history/audit lookups.
    all: RwLock<HashMap<String, InterAgentMessage>>,
    tx: broadcast::Sender<String>,
    /// Durable mirror (§4.10 "durable queue", §6.3). `None` in unit tests
    /// that only exercise in-memory ordering; production wiring always
    /// supplies one via `with_storage`.
    storage: Option<Arc<Storage>>,
}

pub type SharedMessageBus = Arc<MessageBus>;

impl MessageBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            inboxes: RwLock::new(HashMap::new()),
            broadcasts: RwLock::new(HashMap::new()),
            all: RwLock::new(HashMap::new()),
            tx,
            storage: None,
        }
    }

    pub fn with_storage(storage: Arc<Storage>) -> Self {
        Self {
            storage: Some(storage),
            ..Self::new()
        }
    }

    /// Enqueue a message. `to_agent: None` fans out to every organization
    /// mailbox lazily — readers consult `broadcasts` in addition to their
    /// own inbox rather than materializing N copies up front.
    pub async fn send(
        &self,
        organization_id: &str,
        from_agent: &str,
        to_agent: Option<String>,
        message_type: &str,
        subject: &str,
        content: &str,
        response_to_id: Option<String>,
        requires_response: bool,
        priority: i32,
    ) -> InterAgentMessage {
        let message = InterAgentMessage {
            id: crate::domain::new_id("msg"),
            organization_id: organization_id.to_string(),
            from_agent: from_agent.to_string(),
            to_agent: to_agent.clone(),
            message_type: message_type.to_string(),
            subject: subject.to_string(),
            content: content.to_string(),
            response_to_id,
            requires_response,
            priority,
            created_at: Utc::now(),
            read_at: None,
            responded_at: None,
        };

        self.all
            .write()
            .await
            .insert(message.id.clone(), message.clone());

        match &to_agent {
            Some(agent_id) => {
                self.inboxes
                    .write()
                    .await
                    .entry(agent_id.clone())
                    .or_default()
                    .push(QueuedMessage(message.clone()));
            }
            None => {
                self.broadcasts
                    .write()
                    .await
                    .entry(organization_id.to_string())
                    .or_default()
                    .push(QueuedMessage(message.clone()));
            }
        }

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.insert_message(&message).await {
                warn!(message_id = %message.id, err = %e, "failed to persist inter-agent message");
            }
        }

        let _ = self.tx.send(message.id.clone());
        message
    }

    /// Pop the highest-priority unread message for `agent_id`, preferring a
    /// direct message over a broadcast when both are available and at equal
    /// priority (direct addressing is more specific).
    pub async fn receive(&self, organization_id: &str, agent_id: &str) -> Option<InterAgentMessage> {
        let mut inboxes = self.inboxes.write().await;
        let direct_top = inboxes.get(agent_id).and_then(|h| h.peek()).map(|m| m.0.priority);

        let mut broadcasts = self.broadcasts.write().await;
        let broadcast_top = broadcasts
            .get(organization_id)
            .and_then(|h| h.peek())
            .map(|m| m.0.priority);

        let take_direct = match (direct_top, broadcast_top) {
            (Some(d), Some(b)) => d >= b,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return None,
        };

        let message = if take_direct {
            inboxes.get_mut(agent_id).and_then(|h| h.pop()).map(|m| m.0)
        } else {
            broadcasts
                .get_mut(organization_id)
                .and_then(|h| h.pop())
                .map(|m| m.0)
        };

        if let Some(mut message) = message {
            let read_at = Utc::now();
            message.read_at = Some(read_at);
            self.all.write().await.insert(message.id.clone(), message.clone());
            if let Some(storage) = &self.storage {
                if let Err(e) = storage.mark_message_read(&message.id, read_at).await {
                    warn!(message_id = %message.id, err = %e, "failed to persist message read_at");
                }
            }
            Some(message)
        } else {
            None
        }
    }

    pub async fn mark_responded(&self, message_id: &str) -> bool {
        let responded_at = Utc::now();
        let found = {
            let mut all = self.all.write().await;
            if let Some(message) = all.get_mut(message_id) {
                message.responded_at = Some(responded_at);
                true
            } else {
                false
            }
        };
        if found {
            if let Some(storage) = &self.storage {
                if let Err(e) = storage.mark_message_responded(message_id, responded_at).await {
                    warn!(message_id, err = %e, "failed to persist message responded_at");
                }
            }
        }
        found
    }

    pub async fn get(&self, message_id: &str) -> Option<InterAgentMessage> {
        self.all.read().await.get(message_id).cloned()
    }

    pub async fn pending_count(&self, agent_id: &str) -> usize {
        self.inboxes
            .read()
            .await
            .get(agent_id)
            .map(|h| h.len())
            .unwrap_or(0)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

use tokio::sync::Mutex;

use crate::error::{CoordinatorError, Result};

/// One unit of external meeting-hosting capacity. Free iff no meeting id is
/// bound.
#[derive(Debug, Clone)]
struct ResourceSlot {
    host: String,
    meeting_id: Option<String>,
}

/// Fixed-size pool of meeting-host accounts. Slots are allocated by the
/// single-threaded admission worker and released by lifecycle timers; every
/// read-modify-write goes through the pool-wide mutex so those two paths can
/// never double-allocate a slot.
pub struct HostPool {
    slots: Mutex<Vec<ResourceSlot>>,
    capacity: usize,
}

impl HostPool {
    pub fn new(hosts: Vec<String>) -> Self {
        let capacity = hosts.len();
        Self {
            slots: Mutex::new(
                hosts
                    .into_iter()
                    .map(|host| ResourceSlot {
                        host,
                        meeting_id: None,
                    })
                    .collect(),
            ),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// First free host, in slot order. Does not bind; the admission worker
    /// binds only after meeting provisioning succeeds.
    pub async fn find_free(&self) -> Option<String> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .find(|slot| slot.meeting_id.is_none())
            .map(|slot| slot.host.clone())
    }

    pub async fn bind(&self, host: &str, meeting_id: &str) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .iter_mut()
            .find(|slot| slot.host == host)
            .ok_or_else(|| CoordinatorError::internal(format!("unknown host {host}")))?;
        if slot.meeting_id.is_some() {
            return Err(CoordinatorError::SlotOccupied(host.to_string()));
        }
        slot.meeting_id = Some(meeting_id.to_string());
        tracing::info!(host = %host, meeting_id = %meeting_id, "Bound host slot");
        Ok(())
    }

    /// Frees the slot bound to `meeting_id`. A no-op when no slot holds the
    /// meeting, so timers and webhooks can race without harm.
    pub async fn release_meeting(&self, meeting_id: &str) -> bool {
        let mut slots = self.slots.lock().await;
        for slot in slots.iter_mut() {
            if slot.meeting_id.as_deref() == Some(meeting_id) {
                slot.meeting_id = None;
                tracing::info!(host = %slot.host, meeting_id = %meeting_id, "Released host slot");
                return true;
            }
        }
        tracing::warn!(meeting_id = %meeting_id, "No slot bound to meeting");
        false
    }

    pub async fn bound_count(&self) -> usize {
        let slots = self.slots.lock().await;
        slots.iter().filter(|slot| slot.meeting_id.is_some()).count()
    }
}

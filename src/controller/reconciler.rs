use tracing::{debug, warn};

use crate::domain::{parse_control_value, ControlState, DeviceSlot};
use crate::hardware::Actuator;
use crate::remote::{RemoteStore, SyncError};

/// Pulls the desired state of each output slot from the store and drives the lines to match.
pub struct ControlReconciler {
    prefix: String,
}

impl ControlReconciler {
    pub fn new(controller_path: impl Into<String>) -> Self {
        Self {
            prefix: controller_path.into(),
        }
    }

    pub fn path_for(&self, slot: DeviceSlot) -> String {
        slot.path(&self.prefix)
    }

    /// Refresh every slot from the store, then drive its line.
    ///
    /// A slot whose read fails keeps its previous value. When the backend is not
    /// ready no reads are attempted at all. Lines are driven regardless.
    /// Returns the number of slots that got no fresh value.
    pub async fn reconcile(
        &self,
        control: &mut ControlState,
        store: &dyn RemoteStore,
        actuator: &dyn Actuator,
    ) -> usize {
        let ready = store.ready().await;
        let mut stale = 0;

        for slot in DeviceSlot::all() {
            let fresh = if ready {
                self.read_slot(slot, store).await
            } else {
                None
            };
            match fresh {
                Some(on) => control.set(slot, on),
                None => stale += 1,
            }

            if let Err(e) = actuator.set_line(slot, control.get(slot)).await {
                warn!(%slot, error = %e, "failed to drive output line");
            }
        }
        stale
    }

    async fn read_slot(&self, slot: DeviceSlot, store: &dyn RemoteStore) -> Option<bool> {
        let path = self.path_for(slot);
        match store.read_string(&path).await {
            Ok(raw) => Some(parse_control_value(&raw)),
            Err(SyncError::Missing(_)) => None,
            Err(e) if e.is_transient() => {
                debug!(%path, error = %e, "control read failed, keeping last state");
                None
            }
            Err(e) => {
                warn!(%path, error = %e, "unusable control value, keeping last state");
                None
            }
        }
    }
}

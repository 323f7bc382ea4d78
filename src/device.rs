use crate::plan::{BankId, PlanReader, PricePlan, PricePlanStore};
use crate::writer::{self, PlanWrite, RegisterWriter, WriteError};
use tracing::{debug, info};

/// Opaque name of a managed inverter.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for DeviceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RolloverState {
    Idle,
    RollingOver,
}

pub(crate) struct DeviceState {
    pub(crate) store: PricePlanStore,
    /// Calendar day of the last completed rollover.
    pub(crate) rolled_over_on: Option<jiff::civil::Date>,
    /// Whether the store has been seeded with what the device holds.
    pub(crate) loaded: bool,
}

/// An inverter together with the plan it is supposed to hold.
///
/// Everything that mutates the plan goes through the one async mutex in here, so a dispatched
/// update and the daily rollover of the same device never interleave. Separate devices do not
/// share any locks.
pub struct ManagedDevice<W> {
    id: DeviceId,
    writer: W,
    reader: PlanReader,
    pub(crate) rollover: tokio::sync::watch::Sender<RolloverState>,
    pub(crate) state: tokio::sync::Mutex<DeviceState>,
}

impl<W: RegisterWriter> ManagedDevice<W> {
    pub fn new(id: DeviceId, writer: W) -> Self {
        let store = PricePlanStore::new();
        let reader = store.subscribe();
        let state = DeviceState { store, rolled_over_on: None, loaded: false };
        let (rollover, _) = tokio::sync::watch::channel(RolloverState::Idle);
        Self { id, writer, reader, rollover, state: tokio::sync::Mutex::new(state) }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// A reader that sees every plan once it has reached the device.
    pub fn subscribe(&self) -> PlanReader {
        self.reader.clone()
    }

    /// The last committed plan.
    pub fn plan(&self) -> PricePlan {
        self.reader.borrow().clone()
    }

    pub fn rollover_state(&self) -> RolloverState {
        *self.rollover.borrow()
    }

    /// Replace the store with the plan the device currently holds.
    pub async fn load(&self) -> Result<(), WriteError> {
        let mut state = self.state.lock().await;
        self.load_locked(&mut state).await
    }

    pub(crate) async fn load_locked(&self, state: &mut DeviceState) -> Result<(), WriteError> {
        let snapshot = writer::read_plan(&self.writer).await?.ok_or(WriteError::UnexpectedResponse)?;
        for id in BankId::ALL {
            state.store.set(id, snapshot.plan.bank(id));
        }
        state.store.set_flags(snapshot.plan.buy_switch, snapshot.plan.neg_price_enable);
        state.loaded = true;
        state.store.publish();
        debug!(device = %self.id, rtc_today = %snapshot.rtc_today, "plan loaded from the device");
        Ok(())
    }

    /// Write `write` to the device, and only once that succeeded, to the store.
    ///
    /// On failure the store and everything observing it are left exactly as they were.
    pub async fn commit(&self, write: &PlanWrite, today: jiff::civil::Date) -> Result<(), WriteError> {
        let mut state = self.state.lock().await;
        if write.is_empty() {
            debug!(device = %self.id, "nothing to commit");
            return Ok(());
        }
        writer::write_plan(&self.writer, write, today).await?;
        for (id, bank) in write.banks() {
            debug!(device = %self.id, bank = %id, value = %bank, "bank committed");
            state.store.set(id, bank);
        }
        state.store.set_flags(write.buy_switch, write.neg_price_enable);
        state.store.publish();
        info!(device = %self.id, "plan committed");
        Ok(())
    }
}

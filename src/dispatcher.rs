//! Turning update requests from price optimizers into committed plans.

use crate::device::{DeviceId, ManagedDevice};
use crate::mask::{self, BankError, RegisterBank, SlotMinutes};
use crate::plan::{BankId, BuySwitch, Direction, PricePlan};
use crate::writer::{PlanWrite, RegisterWriter, WriteError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

fn default_slot_minutes() -> i64 {
    60
}

/// An update as it arrives from a caller.
///
/// Numbers are kept wide here so that out-of-range values can be reported instead of failing
/// deserialization with an opaque message.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    pub sell_today_masks: Option<Vec<serde_json::Number>>,
    pub sell_tomorrow_masks: Option<Vec<serde_json::Number>>,
    pub buy_today_masks: Option<Vec<serde_json::Number>>,
    pub buy_tomorrow_masks: Option<Vec<serde_json::Number>>,
    pub sell_today_prices: Option<Vec<f64>>,
    pub sell_tomorrow_prices: Option<Vec<f64>>,
    pub buy_today_prices: Option<Vec<f64>>,
    pub buy_tomorrow_prices: Option<Vec<f64>>,
    #[serde(default)]
    pub sell_threshold: f64,
    #[serde(default)]
    pub buy_threshold: f64,
    #[serde(default)]
    pub flip_sell: bool,
    #[serde(default)]
    pub flip_buy: bool,
    #[serde(default = "default_slot_minutes")]
    pub slot_minutes: i64,
    pub buy_switch: Option<i64>,
    pub neg_price_enable: Option<bool>,
}

impl UpdateRequest {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            slot_minutes: default_slot_minutes(),
            ..Self::default()
        }
    }

    fn masks(&self, id: BankId) -> Option<&[serde_json::Number]> {
        match id {
            BankId::SELL_TODAY => self.sell_today_masks.as_deref(),
            BankId::SELL_TOMORROW => self.sell_tomorrow_masks.as_deref(),
            BankId::BUY_TODAY => self.buy_today_masks.as_deref(),
            _ => self.buy_tomorrow_masks.as_deref(),
        }
    }

    fn prices(&self, id: BankId) -> Option<&[f64]> {
        match id {
            BankId::SELL_TODAY => self.sell_today_prices.as_deref(),
            BankId::SELL_TOMORROW => self.sell_tomorrow_prices.as_deref(),
            BankId::BUY_TODAY => self.buy_today_prices.as_deref(),
            _ => self.buy_tomorrow_prices.as_deref(),
        }
    }

    fn threshold_and_flip(&self, direction: Direction) -> (f64, bool) {
        match direction {
            Direction::Sell => (self.sell_threshold, self.flip_sell),
            Direction::Buy => (self.buy_threshold, self.flip_buy),
        }
    }

    /// Check everything and decide where every bank comes from. Nothing is touched yet.
    pub fn validate(&self) -> Result<ValidatedUpdate, ValidationError> {
        let device = match self.device_id.as_deref().map(str::trim) {
            None | Some("") => return Err(ValidationError::MissingDevice),
            Some(id) => DeviceId::new(id),
        };
        let slot_minutes =
            SlotMinutes::try_from(self.slot_minutes).map_err(ValidationError::SlotMinutes)?;
        let buy_switch = self
            .buy_switch
            .map(|raw| BuySwitch::from_raw(raw).ok_or(ValidationError::BuySwitch(raw)))
            .transpose()?;
        let mut sources = BTreeMap::new();
        for id in BankId::ALL {
            let source = if let Some(values) = self.masks(id) {
                let bank = mask_integers(values)
                    .and_then(|values| RegisterBank::from_values(&values))
                    .map_err(|source| ValidationError::Mask { bank: id, source })?;
                BankSource::DirectMask(bank)
            } else if let Some(prices) = self.prices(id) {
                if prices.is_empty() {
                    return Err(ValidationError::EmptyPrices(id));
                }
                let (threshold, flip) = self.threshold_and_flip(id.direction);
                BankSource::FromPrices { prices: prices.to_vec(), threshold, flip }
            } else {
                BankSource::Unset
            };
            sources.insert(id, source);
        }
        Ok(ValidatedUpdate {
            device,
            sources,
            slot_minutes,
            buy_switch,
            neg_price_enable: self.neg_price_enable,
        })
    }
}

/// Mask values as integers. Whole numbers written with a fraction or exponent are accepted.
fn mask_integers(values: &[serde_json::Number]) -> Result<Vec<i64>, BankError> {
    let integer = |(index, number): (usize, &serde_json::Number)| {
        if let Some(value) = number.as_i64() {
            return Ok(value);
        }
        match number.as_f64() {
            // Saturates, so values beyond i64 are still reported as out of range.
            Some(value) if value.fract() == 0.0 => Ok(value as i64),
            _ => Err(BankError::NotAWholeNumber { index, value: number.to_string() }),
        }
    };
    values.iter().enumerate().map(integer).collect()
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("the request does not name a device")]
    MissingDevice,
    #[error("there is no managed inverter named `{0}`")]
    UnknownDevice(String),
    #[error("masks for {bank} are malformed")]
    Mask {
        bank: BankId,
        #[source]
        source: BankError,
    },
    #[error("price series for {0} is empty and no masks were given for it")]
    EmptyPrices(BankId),
    #[error("slot_minutes must be one of 15, 30 or 60, got {0}")]
    SlotMinutes(i64),
    #[error("buy_switch must be one of 0, 1 or 2, got {0}")]
    BuySwitch(i64),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("the update request is invalid")]
    Validation(#[from] ValidationError),
    #[error("could not write the plan to inverter `{1}`")]
    DeviceWrite(#[source] WriteError, DeviceId),
}

/// Where the new value of one bank comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum BankSource {
    /// Leave the bank as it is.
    Unset,
    DirectMask(RegisterBank),
    FromPrices { prices: Vec<f64>, threshold: f64, flip: bool },
}

impl BankSource {
    pub fn resolve(&self, slot_minutes: SlotMinutes) -> Option<RegisterBank> {
        match self {
            Self::Unset => None,
            Self::DirectMask(bank) => Some(*bank),
            Self::FromPrices { prices, threshold, flip } => {
                Some(mask::build_mask(prices, *threshold, *flip, slot_minutes.minutes()))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedUpdate {
    pub device: DeviceId,
    pub sources: BTreeMap<BankId, BankSource>,
    pub slot_minutes: SlotMinutes,
    pub buy_switch: Option<BuySwitch>,
    pub neg_price_enable: Option<bool>,
}

impl ValidatedUpdate {
    pub fn resolve(&self) -> PlanWrite {
        let mut write = PlanWrite {
            buy_switch: self.buy_switch,
            neg_price_enable: self.neg_price_enable,
            ..PlanWrite::default()
        };
        for (&id, source) in &self.sources {
            if let Some(bank) = source.resolve(self.slot_minutes) {
                write.set_bank(id, bank);
            }
        }
        write
    }
}

/// Routes updates to the inverters it manages.
pub struct Dispatcher<W> {
    devices: BTreeMap<DeviceId, Arc<ManagedDevice<W>>>,
    time_zone: jiff::tz::TimeZone,
}

impl<W: RegisterWriter> Dispatcher<W> {
    pub fn new(time_zone: jiff::tz::TimeZone) -> Self {
        Self { devices: BTreeMap::new(), time_zone }
    }

    pub fn add_device(&mut self, device: ManagedDevice<W>) -> Arc<ManagedDevice<W>> {
        let device = Arc::new(device);
        if self.devices.insert(device.id().clone(), Arc::clone(&device)).is_some() {
            warn!(device = %device.id(), "replaced an already managed device");
        }
        device
    }

    pub fn device(&self, id: &str) -> Option<&Arc<ManagedDevice<W>>> {
        self.devices.get(id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<ManagedDevice<W>>> {
        self.devices.values()
    }

    pub fn time_zone(&self) -> &jiff::tz::TimeZone {
        &self.time_zone
    }

    pub fn today(&self) -> jiff::civil::Date {
        jiff::Timestamp::now().to_zoned(self.time_zone.clone()).date()
    }

    /// Validate, resolve and commit an update, returning the plan as committed.
    pub async fn apply_update(&self, request: &UpdateRequest) -> Result<PricePlan, Error> {
        self.apply_update_on(request, self.today()).await
    }

    pub async fn apply_update_on(
        &self,
        request: &UpdateRequest,
        today: jiff::civil::Date,
    ) -> Result<PricePlan, Error> {
        let update = request.validate()?;
        let device = self
            .devices
            .get(update.device.as_str())
            .ok_or_else(|| ValidationError::UnknownDevice(update.device.to_string()))?;
        let write = update.resolve();
        debug!(device = %device.id(), ?write, "resolved update");
        device
            .commit(&write, today)
            .await
            .map_err(|e| Error::DeviceWrite(e, device.id().clone()))?;
        info!(device = %device.id(), banks = write.banks().count(), "update applied");
        Ok(device.plan())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::testing::MemoryInverter;
    use jiff::civil::date;

    fn masks(values: &[i64]) -> Option<Vec<serde_json::Number>> {
        Some(values.iter().map(|&value| value.into()).collect())
    }

    fn dispatcher() -> Dispatcher<MemoryInverter> {
        let mut dispatcher = Dispatcher::new(jiff::tz::TimeZone::UTC);
        dispatcher.add_device(ManagedDevice::new(DeviceId::new("inv"), MemoryInverter::new()));
        dispatcher
    }

    async fn seed(dispatcher: &Dispatcher<MemoryInverter>) -> PricePlan {
        let mut request = UpdateRequest::new("inv");
        request.sell_today_masks = masks(&[1, 2, 3, 4, 5, 6]);
        request.sell_tomorrow_masks = masks(&[7, 8, 9, 10, 11, 12]);
        request.buy_today_masks = masks(&[13, 14, 15, 16, 17, 18]);
        request.buy_tomorrow_masks = masks(&[19, 20, 21, 22, 23, 24]);
        dispatcher.apply_update_on(&request, date(2026, 4, 2)).await.unwrap()
    }

    #[tokio::test]
    async fn direct_masks_round_trip() {
        let dispatcher = dispatcher();
        let mut request = UpdateRequest::new("inv");
        request.sell_tomorrow_masks = masks(&[0, 0, 0, 65535, 65535, 65535]);
        dispatcher.apply_update(&request).await.unwrap();
        let sensor = serde_json::to_string(&dispatcher.device("inv").unwrap().plan().sell_tomorrow);
        assert_eq!(sensor.unwrap(), "[0,0,0,65535,65535,65535]");
    }

    #[tokio::test]
    async fn prices_only_touch_their_bank() {
        let dispatcher = dispatcher();
        let before = seed(&dispatcher).await;
        let mut request = UpdateRequest::new("inv");
        request.buy_tomorrow_prices = Some(vec![-1.0; 24]);
        request.buy_threshold = 0.0;
        let after = dispatcher.apply_update_on(&request, date(2026, 4, 2)).await.unwrap();
        assert_eq!(after.sell_today, before.sell_today);
        assert_eq!(after.sell_tomorrow, before.sell_tomorrow);
        assert_eq!(after.buy_today, before.buy_today);
        assert_eq!(after.buy_tomorrow.words(), [u16::MAX; 6]);
    }

    #[tokio::test]
    async fn short_mask_is_rejected_without_effect() {
        let dispatcher = dispatcher();
        let before = seed(&dispatcher).await;
        let writes = dispatcher.device("inv").unwrap().writer().writes();
        let mut request = UpdateRequest::new("inv");
        request.sell_today_masks = masks(&[1, 2, 3, 4, 5]);
        request.buy_tomorrow_masks = masks(&[0; 6]);
        let err = dispatcher.apply_update(&request).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::Mask {
                bank: BankId::SELL_TODAY,
                source: BankError::Length(5)
            })
        ));
        let device = dispatcher.device("inv").unwrap();
        assert_eq!(device.plan(), before);
        assert_eq!(device.writer().writes(), writes);
        assert_eq!(device.writer().snapshot().plan.buy_tomorrow, before.buy_tomorrow);
    }

    #[tokio::test]
    async fn masks_win_over_prices() {
        let dispatcher = dispatcher();
        let mut request = UpdateRequest::new("inv");
        request.sell_today_masks = masks(&[1, 0, 0, 0, 0, 0]);
        request.sell_today_prices = Some(vec![]);
        request.sell_tomorrow_prices = Some(vec![-1.0; 24]);
        let plan = dispatcher.apply_update(&request).await.unwrap();
        assert_eq!(plan.sell_today.words(), [1, 0, 0, 0, 0, 0]);
        assert_eq!(plan.sell_tomorrow.words(), [u16::MAX; 6]);
    }

    #[tokio::test]
    async fn thresholds_and_flips_are_per_direction() {
        let dispatcher = dispatcher();
        let mut request = UpdateRequest::new("inv");
        request.sell_tomorrow_prices = Some(vec![5.0; 96]);
        request.buy_tomorrow_prices = Some(vec![5.0; 96]);
        request.slot_minutes = 15;
        request.sell_threshold = 10.0;
        request.buy_threshold = 10.0;
        request.flip_buy = true;
        let plan = dispatcher.apply_update(&request).await.unwrap();
        assert_eq!(plan.sell_tomorrow.words(), [u16::MAX; 6]);
        assert_eq!(plan.buy_tomorrow, RegisterBank::ZERO);
    }

    #[test]
    fn rejects_malformed_requests() {
        let mut request = UpdateRequest::new("inv");
        request.device_id = None;
        assert_eq!(request.validate(), Err(ValidationError::MissingDevice));
        request.device_id = Some(" ".into());
        assert_eq!(request.validate(), Err(ValidationError::MissingDevice));

        let mut request = UpdateRequest::new("inv");
        request.slot_minutes = 20;
        assert_eq!(request.validate(), Err(ValidationError::SlotMinutes(20)));

        let mut request = UpdateRequest::new("inv");
        request.buy_switch = Some(3);
        assert_eq!(request.validate(), Err(ValidationError::BuySwitch(3)));

        let mut request = UpdateRequest::new("inv");
        request.buy_today_prices = Some(vec![]);
        assert_eq!(request.validate(), Err(ValidationError::EmptyPrices(BankId::BUY_TODAY)));

        let mut request = UpdateRequest::new("inv");
        request.buy_today_masks = masks(&[0, 0, 0, 0, 0, 70000]);
        assert_eq!(
            request.validate(),
            Err(ValidationError::Mask {
                bank: BankId::BUY_TODAY,
                source: BankError::OutOfRange { index: 5, value: 70000 }
            })
        );
    }

    #[test]
    fn mask_values_must_be_whole_numbers() {
        let parse = |masks: &str| {
            let json = format!(r#"{{"device_id": "inv", "sell_today_masks": {masks}}}"#);
            serde_json::from_str::<UpdateRequest>(&json).unwrap().validate()
        };
        let update = parse("[5.0, 0, 0, 0, 0, 6.5e4]").unwrap();
        assert_eq!(
            update.sources[&BankId::SELL_TODAY],
            BankSource::DirectMask(RegisterBank::new([5, 0, 0, 0, 0, 65000]))
        );
        let mask_error = |masks: &str| match parse(masks) {
            Err(ValidationError::Mask { bank: BankId::SELL_TODAY, source }) => source,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(
            mask_error("[0, 5.5, 0, 0, 0, 0]"),
            BankError::NotAWholeNumber { index: 1, value: "5.5".into() }
        );
        assert_eq!(
            mask_error("[1e10, 0, 0, 0, 0, 0]"),
            BankError::OutOfRange { index: 0, value: 10_000_000_000 }
        );
        assert_eq!(mask_error("[1, 2, 3]"), BankError::Length(3));
    }

    #[tokio::test]
    async fn unknown_device_is_a_validation_error() {
        let dispatcher = dispatcher();
        let request = UpdateRequest::new("shed");
        let err = dispatcher.apply_update(&request).await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::UnknownDevice(id)) if id == "shed"));
    }

    #[tokio::test]
    async fn failed_device_write_keeps_the_old_plan() {
        let dispatcher = dispatcher();
        let before = seed(&dispatcher).await;
        let device = dispatcher.device("inv").unwrap();
        device.writer().fail_writes(true);
        let mut request = UpdateRequest::new("inv");
        request.sell_tomorrow_masks = masks(&[0; 6]);
        request.neg_price_enable = Some(true);
        let err = dispatcher.apply_update(&request).await.unwrap_err();
        assert!(matches!(err, Error::DeviceWrite(WriteError::Exception(_), _)));
        assert_eq!(device.plan(), before);
    }

    #[tokio::test]
    async fn flags_are_written_and_kept() {
        let dispatcher = dispatcher();
        let mut request = UpdateRequest::new("inv");
        request.buy_switch = Some(2);
        request.neg_price_enable = Some(true);
        dispatcher.apply_update(&request).await.unwrap();
        let plan = dispatcher.apply_update(&UpdateRequest::new("inv")).await.unwrap();
        assert_eq!(plan.buy_switch, Some(BuySwitch::ChargeAndSell));
        assert_eq!(plan.neg_price_enable, Some(true));
        let snapshot = dispatcher.device("inv").unwrap().writer().snapshot();
        assert_eq!(snapshot.buy_switch_raw, 2);
        assert_eq!(snapshot.plan.neg_price_enable, Some(true));
    }

    #[test]
    fn request_defaults_follow_the_service_schema() {
        let request: UpdateRequest =
            serde_json::from_str(r#"{"device_id": "inv", "sell_today_prices": [1.5, -2]}"#)
                .unwrap();
        assert_eq!(request.slot_minutes, 60);
        assert_eq!(request.sell_threshold, 0.0);
        assert!(!request.flip_sell);
        let update = request.validate().unwrap();
        assert_eq!(
            update.sources[&BankId::SELL_TODAY],
            BankSource::FromPrices { prices: vec![1.5, -2.0], threshold: 0.0, flip: false }
        );
        assert_eq!(update.sources[&BankId::BUY_TODAY], BankSource::Unset);
        assert!(serde_json::from_str::<UpdateRequest>(r#"{"device": "inv"}"#).is_err());
    }
}

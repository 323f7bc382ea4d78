use crate::mask::RegisterBank;
use tokio::sync::watch;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Direction {
    Sell,
    Buy,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Day {
    Today,
    Tomorrow,
}

/// One of the four banks of a plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BankId {
    pub direction: Direction,
    pub day: Day,
}

impl BankId {
    pub const SELL_TODAY: Self = Self::new(Direction::Sell, Day::Today);
    pub const SELL_TOMORROW: Self = Self::new(Direction::Sell, Day::Tomorrow);
    pub const BUY_TODAY: Self = Self::new(Direction::Buy, Day::Today);
    pub const BUY_TOMORROW: Self = Self::new(Direction::Buy, Day::Tomorrow);
    pub const ALL: [Self; 4] =
        [Self::SELL_TODAY, Self::SELL_TOMORROW, Self::BUY_TODAY, Self::BUY_TOMORROW];

    pub const fn new(direction: Direction, day: Day) -> Self {
        Self { direction, day }
    }
}

impl std::fmt::Display for BankId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.direction, self.day)
    }
}

/// What favorable buy periods make the inverter do.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    serde::Serialize,
    num_derive::FromPrimitive,
    num_derive::ToPrimitive,
    strum::Display,
)]
#[repr(u16)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BuySwitch {
    Disabled = 0,
    ChargeOnly = 1,
    /// Charge, and also sell during positive-price periods.
    ChargeAndSell = 2,
}

impl BuySwitch {
    pub fn from_raw(raw: i64) -> Option<Self> {
        num_traits::FromPrimitive::from_i64(raw)
    }

    pub fn to_register(self) -> u16 {
        num_traits::ToPrimitive::to_u16(&self).unwrap_or_default()
    }
}

/// The four banks of a device plus the two device-level flags.
///
/// Flags stay `None` until something sets them; the device keeps whatever it had before.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct PricePlan {
    pub sell_today: RegisterBank,
    pub sell_tomorrow: RegisterBank,
    pub buy_today: RegisterBank,
    pub buy_tomorrow: RegisterBank,
    pub buy_switch: Option<BuySwitch>,
    pub neg_price_enable: Option<bool>,
}

impl PricePlan {
    pub fn bank(&self, id: BankId) -> RegisterBank {
        match (id.direction, id.day) {
            (Direction::Sell, Day::Today) => self.sell_today,
            (Direction::Sell, Day::Tomorrow) => self.sell_tomorrow,
            (Direction::Buy, Day::Today) => self.buy_today,
            (Direction::Buy, Day::Tomorrow) => self.buy_tomorrow,
        }
    }

    pub fn bank_mut(&mut self, id: BankId) -> &mut RegisterBank {
        match (id.direction, id.day) {
            (Direction::Sell, Day::Today) => &mut self.sell_today,
            (Direction::Sell, Day::Tomorrow) => &mut self.sell_tomorrow,
            (Direction::Buy, Day::Today) => &mut self.buy_today,
            (Direction::Buy, Day::Tomorrow) => &mut self.buy_tomorrow,
        }
    }

    /// The plan as it looks after the daily rollover.
    pub fn promoted(&self) -> Self {
        Self {
            sell_today: self.sell_tomorrow,
            sell_tomorrow: RegisterBank::ZERO,
            buy_today: self.buy_tomorrow,
            buy_tomorrow: RegisterBank::ZERO,
            ..self.clone()
        }
    }
}

/// Read accessor handed to whatever presents the plan (sensors, logs, service responses).
///
/// It only ever observes plans that were committed to the device.
pub type PlanReader = watch::Receiver<PricePlan>;

/// Holds the current plan of a single device.
///
/// Mutations are staged with [`Self::set`] and [`Self::set_flags`] and become visible to
/// readers with [`Self::publish`].
pub struct PricePlanStore {
    plan: PricePlan,
    published: watch::Sender<PricePlan>,
}

impl PricePlanStore {
    pub fn new() -> Self {
        let plan = PricePlan::default();
        let (published, _) = watch::channel(plan.clone());
        Self { plan, published }
    }

    pub fn plan(&self) -> &PricePlan {
        &self.plan
    }

    pub fn get(&self, id: BankId) -> RegisterBank {
        self.plan.bank(id)
    }

    /// Replace exactly one bank. [`RegisterBank`] can only hold six valid words, so this
    /// cannot leave a bank half written.
    pub fn set(&mut self, id: BankId, bank: RegisterBank) {
        *self.plan.bank_mut(id) = bank;
    }

    pub fn set_flags(&mut self, buy_switch: Option<BuySwitch>, neg_price_enable: Option<bool>) {
        if let Some(buy_switch) = buy_switch {
            self.plan.buy_switch = Some(buy_switch);
        }
        if let Some(enable) = neg_price_enable {
            self.plan.neg_price_enable = Some(enable);
        }
    }

    pub fn promote_tomorrow(&mut self) {
        self.plan = self.plan.promoted();
    }

    pub fn subscribe(&self) -> PlanReader {
        self.published.subscribe()
    }

    /// Make the current plan visible to readers. Readers are only woken when something changed.
    pub fn publish(&self) {
        self.published.send_if_modified(|published| {
            if *published == self.plan {
                return false;
            }
            *published = self.plan.clone();
            true
        });
    }
}

impl Default for PricePlanStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_ids_are_named_like_the_sensors() {
        let names = BankId::ALL.map(|id| id.to_string());
        assert_eq!(names, ["sell_today", "sell_tomorrow", "buy_today", "buy_tomorrow"]);
    }

    #[test]
    fn buy_switch_only_knows_three_values() {
        assert_eq!(BuySwitch::from_raw(0), Some(BuySwitch::Disabled));
        assert_eq!(BuySwitch::from_raw(2), Some(BuySwitch::ChargeAndSell));
        assert_eq!(BuySwitch::from_raw(3), None);
        assert_eq!(BuySwitch::from_raw(-1), None);
        assert_eq!(BuySwitch::ChargeOnly.to_register(), 1);
    }

    #[test]
    fn store_starts_out_empty() {
        let store = PricePlanStore::new();
        for id in BankId::ALL {
            assert_eq!(store.get(id), RegisterBank::ZERO);
        }
        assert_eq!(store.plan().buy_switch, None);
        assert_eq!(store.plan().neg_price_enable, None);
    }

    #[test]
    fn set_touches_a_single_bank() {
        let mut store = PricePlanStore::new();
        let bank = RegisterBank::new([1, 2, 3, 4, 5, 6]);
        store.set(BankId::BUY_TOMORROW, bank);
        assert_eq!(store.get(BankId::BUY_TOMORROW), bank);
        assert_eq!(store.get(BankId::BUY_TODAY), RegisterBank::ZERO);
        assert_eq!(store.get(BankId::SELL_TOMORROW), RegisterBank::ZERO);
    }

    #[test]
    fn absent_flags_are_left_alone() {
        let mut store = PricePlanStore::new();
        store.set_flags(Some(BuySwitch::ChargeOnly), Some(true));
        store.set_flags(None, Some(false));
        assert_eq!(store.plan().buy_switch, Some(BuySwitch::ChargeOnly));
        assert_eq!(store.plan().neg_price_enable, Some(false));
    }

    #[test]
    fn promotion_moves_tomorrow_into_today() {
        let mut store = PricePlanStore::new();
        store.set(BankId::SELL_TODAY, RegisterBank::new([9; 6]));
        store.set(BankId::SELL_TOMORROW, RegisterBank::new([1, 2, 3, 4, 5, 6]));
        store.set(BankId::BUY_TOMORROW, RegisterBank::new([7; 6]));
        store.promote_tomorrow();
        assert_eq!(store.get(BankId::SELL_TODAY).words(), [1, 2, 3, 4, 5, 6]);
        assert_eq!(store.get(BankId::BUY_TODAY).words(), [7; 6]);
        assert!(store.get(BankId::SELL_TOMORROW).is_zero());
        assert!(store.get(BankId::BUY_TOMORROW).is_zero());
    }

    #[test]
    fn readers_see_changes_only_once_published() {
        let mut store = PricePlanStore::new();
        let mut reader = store.subscribe();
        store.set(BankId::SELL_TOMORROW, RegisterBank::new([1; 6]));
        assert!(!reader.has_changed().unwrap());
        assert!(reader.borrow().sell_tomorrow.is_zero());
        store.publish();
        assert!(reader.has_changed().unwrap());
        assert_eq!(reader.borrow_and_update().sell_tomorrow.words(), [1; 6]);
        store.publish();
        assert!(!reader.has_changed().unwrap());
    }
}

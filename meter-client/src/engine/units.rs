use rust_decimal::{Decimal, RoundingStrategy};

pub fn pulses_to_units(pulses: i64, per_pulse: Decimal) -> Decimal {
    Decimal::from(pulses) * per_pulse
}

/// Display precision for physical quantities; pulse accounting never rounds.
pub fn round3(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(3, RoundingStrategy::MidpointAwayFromZero)
}

/// Rounded to three places and always rendered with three decimals.
pub fn fixed3(value: Decimal) -> String {
    let mut v = round3(value);
    v.rescale(3);
    v.to_string()
}

//! Exact parsing of Kubernetes resource quantities (`"500m"`, `"2Gi"`, `"1e3"`).
//!
//! Values are kept as integer milli-units so that reporting `milli / 1000` never loses the
//! precision a direct float parse of the string would.

// Third Party
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid quantity {0:?}")]
    Invalid(String),
    #[error("quantity {0:?} out of range")]
    Overflow(String),
}

enum Multiplier {
    Decimal(i32),
    Binary(u32),
}

/// Returns the quantity scaled to milli-units, rounding any remaining fraction away from zero.
pub fn milli_value(quantity: &Quantity) -> Result<i64, QuantityError> {
    parse_milli(&quantity.0)
}

/// `milli_value / 1000` as reported in metrics.
pub fn metric_value(quantity: &Quantity) -> Result<f64, QuantityError> {
    milli_value(quantity).map(|milli| milli as f64 / 1000.0)
}

pub fn parse_milli(raw: &str) -> Result<i64, QuantityError> {
    let input = raw.trim();
    if input.is_empty() {
        return Err(QuantityError::Empty);
    }
    let invalid = || QuantityError::Invalid(raw.to_string());
    let overflow = || QuantityError::Overflow(raw.to_string());

    let (negative, unsigned) = match input.as_bytes()[0] {
        b'-' => (true, &input[1..]),
        b'+' => (false, &input[1..]),
        _ => (false, input),
    };

    let number_len = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_len);

    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if fraction.contains('.') {
        return Err(invalid());
    }

    let mut mantissa: u128 = 0;
    for digit in whole.bytes().chain(fraction.bytes()) {
        mantissa = mantissa
            .checked_mul(10)
            .and_then(|m| m.checked_add(u128::from(digit - b'0')))
            .ok_or_else(overflow)?;
    }
    let fraction_digits = i32::try_from(fraction.len()).map_err(|_| invalid())?;

    let multiplier = match suffix {
        "" => Multiplier::Decimal(0),
        "n" => Multiplier::Decimal(-9),
        "u" => Multiplier::Decimal(-6),
        "m" => Multiplier::Decimal(-3),
        "k" => Multiplier::Decimal(3),
        "M" => Multiplier::Decimal(6),
        "G" => Multiplier::Decimal(9),
        "T" => Multiplier::Decimal(12),
        "P" => Multiplier::Decimal(15),
        "E" => Multiplier::Decimal(18),
        "Ki" => Multiplier::Binary(10),
        "Mi" => Multiplier::Binary(20),
        "Gi" => Multiplier::Binary(30),
        "Ti" => Multiplier::Binary(40),
        "Pi" => Multiplier::Binary(50),
        "Ei" => Multiplier::Binary(60),
        exponent if exponent.starts_with(['e', 'E']) => {
            Multiplier::Decimal(exponent[1..].parse::<i32>().map_err(|_| invalid())?)
        }
        _ => return Err(invalid()),
    };

    let magnitude = match multiplier {
        Multiplier::Decimal(exponent) => {
            let scale = exponent
                .checked_add(3)
                .and_then(|e| e.checked_sub(fraction_digits))
                .ok_or_else(overflow)?;
            scale_decimal(mantissa, scale).ok_or_else(overflow)?
        }
        Multiplier::Binary(shift) => {
            let numerator = mantissa
                .checked_mul(1u128 << shift)
                .and_then(|m| m.checked_mul(1000))
                .ok_or_else(overflow)?;
            let denominator = pow10(fraction_digits).ok_or_else(overflow)?;
            ceil_div(numerator, denominator)
        }
    };

    let magnitude = i64::try_from(magnitude).map_err(|_| overflow())?;
    Ok(if negative { -magnitude } else { magnitude })
}

fn pow10(exponent: i32) -> Option<u128> {
    10u128.checked_pow(u32::try_from(exponent).ok()?)
}

fn scale_decimal(mantissa: u128, scale: i32) -> Option<u128> {
    if scale >= 0 {
        return mantissa.checked_mul(pow10(scale)?);
    }
    match pow10(-scale) {
        Some(divisor) => Some(ceil_div(mantissa, divisor)),
        // Anything non-zero this small still rounds up to one milli-unit.
        None => Some(u128::from(mantissa > 0)),
    }
}

fn ceil_div(numerator: u128, denominator: u128) -> u128 {
    numerator / denominator + u128::from(numerator % denominator != 0)
}

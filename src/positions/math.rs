/// sqrt(price) at a tick: `1.0001^(tick/2)`.
pub fn sqrt_price(tick: f64) -> f64 {
    1.0001f64.powf(tick / 2.0)
}

/// Current token amounts of a range position, in raw token units.
///
/// Below the range everything sits in token0; at or above the upper tick
/// everything sits in token1; inside the range both legs are live.
pub fn token_amounts(
    liquidity: f64,
    tick_lower: i32,
    tick_upper: i32,
    current_tick: i32,
) -> (f64, f64) {
    let sl = sqrt_price(tick_lower as f64);
    let su = sqrt_price(tick_upper as f64);
    let sc = sqrt_price(current_tick as f64);

    if current_tick < tick_lower {
        (liquidity * (su - sl) / (su * sl), 0.0)
    } else if current_tick >= tick_upper {
        (0.0, liquidity * (su - sl))
    } else {
        (
            liquidity * (su - sc) / (su * sc),
            liquidity * (sc - sl),
        )
    }
}

/// Presentation scaling only: `raw · 10^-decimals`.
pub fn scale_amount(raw: f64, decimals: u32) -> f64 {
    raw * 10f64.powi(-(decimals as i32))
}

#[cfg(test)]
mod tests {
    use super::{scale_amount, sqrt_price, token_amounts};

    #[test]
    fn sqrt_price_at_zero_tick_is_one() {
        assert!((sqrt_price(0.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn below_range_is_all_token0() {
        let (a0, a1) = token_amounts(1e9, 10, 20, 5);
        assert!(a0 > 0.0);
        assert_eq!(a1, 0.0);
    }

    #[test]
    fn above_range_is_all_token1() {
        let (a0, a1) = token_amounts(1e9, 10, 20, 25);
        assert_eq!(a0, 0.0);
        assert!(a1 > 0.0);
    }

    #[test]
    fn in_range_splits_both_legs() {
        let (a0, a1) = token_amounts(1e9, -100, 100, 0);
        assert!(a0 > 0.0);
        assert!(a1 > 0.0);
        // Symmetric range around the current tick holds near-equal value.
        assert!((a0 - a1).abs() / a0 < 0.02);
    }

    #[test]
    fn amounts_are_continuous_at_the_lower_bound() {
        let inside = token_amounts(1e9, 10, 20, 10);
        let below = token_amounts(1e9, 10, 20, 9);
        assert!((inside.0 - below.0).abs() / below.0 < 0.01);
    }

    #[test]
    fn scaling_moves_the_decimal_point() {
        assert!((scale_amount(1_500_000.0, 6) - 1.5).abs() < 1e-12);
    }
}

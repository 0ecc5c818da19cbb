//! Number formatting used by the rendered report.

/// `1234567` -> `1,234,567`.
pub fn add_commas(number: u64) -> String {
    let digits = number.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// `950` -> `950`, `12_400` -> `12 k`, `1_540_000` -> `1.5 million`.
pub fn abbreviate(number: f64) -> String {
    if number < 1_000.0 {
        if number.fract() == 0.0 {
            format!("{}", number as i64)
        } else {
            format!("{number}")
        }
    } else if number < 1_000_000.0 {
        format!("{} k", (number / 1_000.0) as i64)
    } else {
        format!("{:.1} million", number / 1_000_000.0)
    }
}

/// A ratio as a whole percentage, ties rounded to even: `0.4567` -> `46%`.
pub fn percentage(ratio: f64) -> String {
    format!("{}%", (ratio * 100.0).round_ties_even() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commas_group_thousands() {
        assert_eq!(add_commas(0), "0");
        assert_eq!(add_commas(999), "999");
        assert_eq!(add_commas(1_000), "1,000");
        assert_eq!(add_commas(31_250_400), "31,250,400");
    }

    #[test]
    fn abbreviations_follow_magnitude() {
        assert_eq!(abbreviate(950.0), "950");
        assert_eq!(abbreviate(12.5), "12.5");
        assert_eq!(abbreviate(12_400.0), "12 k");
        assert_eq!(abbreviate(999_999.0), "999 k");
        assert_eq!(abbreviate(1_540_000.0), "1.5 million");
        assert_eq!(abbreviate(31_000_000.0), "31.0 million");
    }

    #[test]
    fn percentages_are_whole_numbers() {
        assert_eq!(percentage(0.4567), "46%");
        assert_eq!(percentage(0.0), "0%");
        assert_eq!(percentage(1.0), "100%");
        assert_eq!(percentage(0.125), "12%");
    }
}

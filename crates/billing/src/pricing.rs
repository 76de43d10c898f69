//! Per-subject pricing
//!
//! The subscription is priced by subject count: a flat fee for the first
//! subject plus a linear fee for every additional one. All amounts are euro
//! cents.

/// Monthly price of the first subject (€4.99)
pub const FIRST_SUBJECT_PRICE_CENTS: i64 = 499;

/// Monthly price of each subject after the first (€2.49)
pub const ADDITIONAL_SUBJECT_PRICE_CENTS: i64 = 249;

/// Monthly price for `subject_count` subjects
///
/// `first + max(0, count - 1) * additional`. A count of zero still yields
/// the first-subject price.
pub fn monthly_price_cents(subject_count: usize) -> i64 {
    let additional = subject_count.saturating_sub(1) as i64;
    FIRST_SUBJECT_PRICE_CENTS + additional * ADDITIONAL_SUBJECT_PRICE_CENTS
}

/// Render cents as a euro amount, e.g. `€7.48`
pub fn format_eur(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}€{}.{:02}", sign, abs / 100, abs % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_subject_price() {
        assert_eq!(monthly_price_cents(1), 499);
    }

    #[test]
    fn test_linear_additional_price() {
        assert_eq!(monthly_price_cents(2), 748);
        assert_eq!(monthly_price_cents(3), 997);
        for n in 1..=12 {
            assert_eq!(monthly_price_cents(n), 499 + (n as i64 - 1) * 249);
        }
    }

    #[test]
    fn test_zero_subjects_uses_first_subject_price() {
        assert_eq!(monthly_price_cents(0), FIRST_SUBJECT_PRICE_CENTS);
    }

    #[test]
    fn test_format_eur() {
        assert_eq!(format_eur(499), "€4.99");
        assert_eq!(format_eur(1245), "€12.45");
        assert_eq!(format_eur(-249), "-€2.49");
        assert_eq!(format_eur(0), "€0.00");
    }
}

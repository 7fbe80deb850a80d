use chrono::Duration;
use settld_core::IsoMillis;

/// When the dispute window for a receipt closes:
/// `settledAt + disputeWindowDays`.
pub fn dispute_window_closes_at(settled_at: IsoMillis, dispute_window_days: i64) -> IsoMillis {
    IsoMillis(settled_at.0 + Duration::days(dispute_window_days))
}

/// A dispute can be opened only while `now ≤ settledAt + disputeWindowDays`.
/// A zero-day window closes at the instant of settlement.
pub fn dispute_window_open(
    settled_at: IsoMillis,
    dispute_window_days: i64,
    now: IsoMillis,
) -> bool {
    now <= dispute_window_closes_at(settled_at, dispute_window_days)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> IsoMillis {
        IsoMillis::parse(s).unwrap()
    }

    #[test]
    fn window_is_inclusive_of_its_last_instant() {
        let settled = t("2026-08-01T12:00:00.000Z");
        assert!(dispute_window_open(settled, 1, t("2026-08-02T12:00:00.000Z")));
        assert!(!dispute_window_open(settled, 1, t("2026-08-02T12:00:00.001Z")));
    }

    #[test]
    fn zero_day_window_closes_at_settlement() {
        let settled = t("2026-08-01T12:00:00.000Z");
        assert!(dispute_window_open(settled, 0, settled));
        assert!(!dispute_window_open(settled, 0, t("2026-08-01T12:00:00.001Z")));
    }

    #[test]
    fn closes_at_is_exact_days_after_settlement() {
        let settled = t("2026-08-01T12:00:00.000Z");
        assert_eq!(
            dispute_window_closes_at(settled, 3),
            t("2026-08-04T12:00:00.000Z")
        );
    }
}

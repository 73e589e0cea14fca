//! Freezing guardian financial configuration onto an invoice.
//!
//! Once written, the snapshot is the authority for that invoice: later
//! guardian profile edits do not propagate unless an admin explicitly
//! re-snapshots via a coverage update.

use rust_decimal::Decimal;
use tutora_core::{
    amount::Amount,
    invoice::{
        FinancialSnapshot, TransferFee, TransferFeeMode, TransferFeeSource,
    },
    party::Guardian,
};

/// Build the financial snapshot for a new invoice from the guardian's
/// current configuration.
pub fn build_guardian_financial_snapshot(
    guardian: &Guardian,
) -> FinancialSnapshot {
    let transfer_fee = match &guardian.transfer_fee {
        Some(config) => TransferFee {
            mode: config.mode,
            value: config.value,
            amount: Amount::ZERO,
            source: TransferFeeSource::GuardianDefault,
            waived: false,
            waived_by_coverage: false,
        },
        None => TransferFee::none(),
    };

    FinancialSnapshot { hourly_rate: guardian.hourly_rate, transfer_fee }
}

/// A manually-entered fee overriding the guardian default.
pub fn manual_transfer_fee(mode: TransferFeeMode, value: Decimal) -> TransferFee {
    TransferFee {
        mode,
        value,
        amount: Amount::ZERO,
        source: TransferFeeSource::Manual,
        waived: false,
        waived_by_coverage: false,
    }
}

#[cfg(test)]
mod test {
    use rust_decimal_macros::dec;
    use tutora_core::{party::TransferFeeConfig, test_utils::fixtures};

    use super::*;

    #[test]
    fn snapshot_freezes_guardian_config() {
        let mut guardian = fixtures::guardian(1);
        guardian.hourly_rate = Amount::from_major(15);
        guardian.transfer_fee = Some(TransferFeeConfig {
            mode: TransferFeeMode::Percent,
            value: dec!(3),
        });

        let snapshot = build_guardian_financial_snapshot(&guardian);
        assert_eq!(snapshot.hourly_rate, Amount::from_major(15));
        assert_eq!(snapshot.transfer_fee.mode, TransferFeeMode::Percent);
        assert_eq!(snapshot.transfer_fee.value, dec!(3));
        assert_eq!(
            snapshot.transfer_fee.source,
            TransferFeeSource::GuardianDefault
        );

        // Editing the guardian afterwards must not affect the snapshot.
        guardian.hourly_rate = Amount::from_major(99);
        assert_eq!(snapshot.hourly_rate, Amount::from_major(15));
    }
}

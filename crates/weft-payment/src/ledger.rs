//! Reservation ledger: the operations the upload service drives.
//!
//! Wraps the DAO with pricing, ban enforcement, and the buffer policy:
//! `reserveCredit` over-reserves by the configured percentage to absorb
//! oracle drift, and `consumeReservation` releases the unused buffer.

use std::sync::Arc;
use weft::{SignatureKind, WeftError};

use crate::db::{CreditReason, PaymentDb, ReservationRow};
use crate::error::PaymentError;
use crate::pricing::PriceOracle;

pub struct Ledger {
    db: Arc<PaymentDb>,
    oracle: Arc<dyn PriceOracle>,
    buffer_pct: u64,
    reservation_ttl_secs: u64,
}

impl Ledger {
    pub fn new(
        db: Arc<PaymentDb>,
        oracle: Arc<dyn PriceOracle>,
        buffer_pct: u64,
        reservation_ttl_secs: u64,
    ) -> Self {
        Self {
            db,
            oracle,
            buffer_pct,
            reservation_ttl_secs,
        }
    }

    pub fn oracle(&self) -> &dyn PriceOracle {
        self.oracle.as_ref()
    }

    /// Base price plus the over-reservation buffer.
    pub fn priced_with_buffer(&self, bytes: u64) -> (u64, u64) {
        let base = self.oracle.credits_for_bytes(bytes);
        let reserved = base + (base * self.buffer_pct) / 100;
        (base, reserved)
    }

    pub(crate) fn ensure_not_banned(
        &self,
        address: &str,
        kind: SignatureKind,
    ) -> Result<(), PaymentError> {
        if let Some(ban) = self.db.active_ban(address, kind.as_str())? {
            tracing::warn!(
                address,
                reason = %ban.reason,
                "rejected request from banned user"
            );
            return Err(PaymentError::Core(WeftError::UserBanned(
                address.to_string(),
            )));
        }
        Ok(())
    }

    /// Price the upload and hold the funds.
    pub fn reserve_credit(
        &self,
        address: &str,
        kind: SignatureKind,
        item_id: Option<&str>,
        bytes: u64,
    ) -> Result<ReservationRow, PaymentError> {
        if bytes == 0 {
            return Err(PaymentError::bad_request("cannot reserve for zero bytes"));
        }
        self.ensure_not_banned(address, kind)?;

        let (base, reserved) = self.priced_with_buffer(bytes);
        let row = self.db.reserve(
            address,
            kind,
            item_id,
            base,
            reserved,
            self.reservation_ttl_secs,
        )?;
        tracing::info!(
            address,
            kind = %kind,
            bytes,
            credits = reserved,
            reservation = %row.reservation_id,
            "credits reserved"
        );
        Ok(row)
    }

    /// Hold explicit amounts (used by x402 settlement, where the price
    /// was already fixed by the paid value).
    pub fn reserve_exact(
        &self,
        address: &str,
        kind: SignatureKind,
        item_id: Option<&str>,
        credits: u64,
    ) -> Result<ReservationRow, PaymentError> {
        self.db.reserve(
            address,
            kind,
            item_id,
            credits,
            credits,
            self.reservation_ttl_secs,
        )
    }

    pub fn consume_reservation(&self, reservation_id: &str) -> Result<(u64, u64), PaymentError> {
        let (charged, released) = self.db.consume(reservation_id)?;
        tracing::info!(
            reservation = reservation_id,
            charged,
            released,
            "reservation consumed"
        );
        Ok((charged, released))
    }

    pub fn refund_reservation(&self, reservation_id: &str) -> Result<(), PaymentError> {
        self.db.refund(reservation_id)?;
        tracing::info!(reservation = reservation_id, "reservation refunded");
        Ok(())
    }

    pub fn adjust_balance(
        &self,
        address: &str,
        kind: SignatureKind,
        delta: i64,
        reason: CreditReason,
        reference_id: &str,
    ) -> Result<u64, PaymentError> {
        self.db.adjust(address, kind, delta, reason, reference_id)
    }

    /// Spawn the background sweeper that expires overdue holds.
    pub fn start_sweeper(self: &Arc<Self>, interval_secs: u64) {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                match ledger.db.expire_reservations() {
                    Ok(0) => {}
                    Ok(expired) => tracing::info!(expired, "expired overdue reservations"),
                    Err(e) => tracing::error!(error = %e, "reservation sweep failed"),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::FixedRateOracle;

    fn test_ledger() -> Ledger {
        Ledger::new(
            Arc::new(PaymentDb::open(":memory:").unwrap()),
            Arc::new(FixedRateOracle::new(10_000, 1_000_000_000)),
            15,
            3_600,
        )
    }

    #[test]
    fn reserve_includes_buffer() {
        let ledger = test_ledger();
        ledger
            .adjust_balance("alice", SignatureKind::Arweave, 1_000_000, CreditReason::Topup, "seed")
            .unwrap();

        // 1 KiB at 10_000 credits/KiB with a 15% buffer.
        let row = ledger
            .reserve_credit("alice", SignatureKind::Arweave, None, 1024)
            .unwrap();
        assert_eq!(row.credits_base, 10_000);
        assert_eq!(row.credits_reserved, 11_500);
    }

    #[test]
    fn consume_returns_buffer_to_balance() {
        let ledger = test_ledger();
        ledger
            .adjust_balance("bob", SignatureKind::Arweave, 100_000, CreditReason::Topup, "seed")
            .unwrap();
        let row = ledger
            .reserve_credit("bob", SignatureKind::Arweave, None, 1024)
            .unwrap();
        let (charged, released) = ledger.consume_reservation(&row.reservation_id).unwrap();
        assert_eq!(charged, 10_000);
        assert_eq!(released, 1_500);
        assert_eq!(
            ledger.db.balance("bob", SignatureKind::Arweave).unwrap(),
            90_000
        );
    }

    #[test]
    fn banned_user_cannot_reserve() {
        let ledger = test_ledger();
        ledger
            .adjust_balance("mallory", SignatureKind::Arweave, 100_000, CreditReason::Topup, "seed")
            .unwrap();
        ledger
            .db
            .insert_ban("mallory", "arweave", "fraud", 30, 3)
            .unwrap();

        let err = ledger
            .reserve_credit("mallory", SignatureKind::Arweave, None, 1024)
            .unwrap_err();
        assert_eq!(err.as_wire().error, "user_banned");
    }
}

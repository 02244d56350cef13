//! `finalizePayment`: settle the ledger for one item.
//!
//! Runs on its own queue so settlement never blocks the upload path.
//! `Consume` fires when the item reached `Permanent`; `Refund` when it
//! failed. Transient payment-service errors retry the whole job; the
//! ledger operations are idempotent on redelivery.

use weft::private_api::X402FinalizeRequest;

use crate::error::UploadError;
use crate::pipeline::{parse_payload, FinalizeJob, PipelineCtx, SettleAction};

pub async fn handle(ctx: &PipelineCtx, payload: &serde_json::Value) -> Result<(), UploadError> {
    let job: FinalizeJob = parse_payload(payload)?;

    match job.action {
        SettleAction::Consume => {
            if let Some(reservation_id) = &job.reservation_id {
                match ctx.payment.consume(reservation_id).await {
                    Ok(resp) => tracing::info!(
                        item = %job.item_id,
                        reservation = %reservation_id,
                        charged = resp.credits_charged,
                        released = resp.buffer_released,
                        "reservation consumed"
                    ),
                    Err(e) if e.is_transient() => return Err(e.into()),
                    Err(e) => tracing::error!(
                        item = %job.item_id,
                        reservation = %reservation_id,
                        error = %e,
                        "consume rejected"
                    ),
                }
            }
            if job.payment_id.is_some() {
                // Declared-vs-actual fraud verdict; the upload already
                // succeeded, only the refund can be withheld.
                match ctx
                    .payment
                    .x402_finalize(X402FinalizeRequest {
                        payment_id: job.payment_id.clone(),
                        item_id: Some(job.item_id.clone()),
                        actual_byte_count: job.byte_count,
                    })
                    .await
                {
                    Ok(resp) => tracing::info!(
                        item = %job.item_id,
                        status = %resp.status,
                        refund = resp.refund_credits,
                        fraud = resp.fraud_type.as_deref().unwrap_or("none"),
                        "x402 payment finalized"
                    ),
                    Err(e) if e.is_transient() => return Err(e.into()),
                    Err(e) => tracing::error!(
                        item = %job.item_id,
                        error = %e,
                        "x402 finalize rejected"
                    ),
                }
            }
        }
        SettleAction::Refund => {
            if let Some(reservation_id) = &job.reservation_id {
                match ctx.payment.refund(reservation_id).await {
                    Ok(_) => tracing::info!(
                        item = %job.item_id,
                        reservation = %reservation_id,
                        "reservation refunded"
                    ),
                    Err(e) if e.is_transient() => return Err(e.into()),
                    Err(e) => tracing::error!(
                        item = %job.item_id,
                        reservation = %reservation_id,
                        error = %e,
                        "refund rejected"
                    ),
                }
            }
            // The x402 payment row is preserved on the failure path; the
            // funds are on-chain and reconciliation owns them.
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testsupport::test_ctx;

    #[tokio::test]
    async fn consume_settles_reservation_and_x402() {
        let t = test_ctx();
        let payload = serde_json::to_value(FinalizeJob {
            item_id: "item-1".into(),
            reservation_id: Some("res-1".into()),
            payment_id: Some("pay-1".into()),
            byte_count: 2_048,
            action: SettleAction::Consume,
        })
        .unwrap();

        handle(&t.ctx, &payload).await.unwrap();

        assert_eq!(*t.payment.consumed.lock().unwrap(), vec!["res-1"]);
        let finalized = t.payment.finalized.lock().unwrap();
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].actual_byte_count, 2_048);
        assert_eq!(finalized[0].payment_id.as_deref(), Some("pay-1"));
    }

    #[tokio::test]
    async fn refund_releases_hold_without_finalizing() {
        let t = test_ctx();
        let payload = serde_json::to_value(FinalizeJob {
            item_id: "item-2".into(),
            reservation_id: Some("res-2".into()),
            payment_id: Some("pay-2".into()),
            byte_count: 100,
            action: SettleAction::Refund,
        })
        .unwrap();

        handle(&t.ctx, &payload).await.unwrap();

        assert_eq!(*t.payment.refunded.lock().unwrap(), vec!["res-2"]);
        assert!(t.payment.finalized.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn item_without_ledger_state_is_a_noop() {
        let t = test_ctx();
        let payload = serde_json::to_value(FinalizeJob {
            item_id: "item-3".into(),
            reservation_id: None,
            payment_id: None,
            byte_count: 1,
            action: SettleAction::Consume,
        })
        .unwrap();
        handle(&t.ctx, &payload).await.unwrap();
        assert!(t.payment.consumed.lock().unwrap().is_empty());
    }
}

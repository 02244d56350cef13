//! x402 verification, settlement, and finalize.
//!
//! The verification sequence claims the nonce first — atomically, via
//! the UNIQUE constraint — so a replayed header is rejected before any
//! signature work or facilitator traffic. A claimed nonce is never
//! released: a settlement that failed after submission may still mine,
//! and releasing the nonce would reopen the replay window.

use std::sync::Arc;
use uuid::Uuid;
use weft::eip3009::recover_signer;
use weft::facilitator::FacilitatorClient;
use weft::private_api::{X402FinalizeRequest, X402FinalizeResponse, X402SettleRequest, X402SettleResponse};
use weft::x402::{PaymentHeader, PaymentMode};
use weft::{NetworkConfig, WeftError};

use crate::db::{CreditReason, PaymentDb, PaymentRow};
use crate::error::PaymentError;
use crate::ledger::Ledger;
use crate::pricing::requirements_for;

/// Payment statuses persisted on the `x402_payment` row.
pub mod status {
    pub const PENDING_VALIDATION: &str = "pending_validation";
    pub const CONFIRMED: &str = "confirmed";
    pub const FRAUD_PENALTY: &str = "fraud_penalty";
    pub const REFUNDED: &str = "refunded";
    pub const FAILED: &str = "failed";
}

#[derive(Debug, Clone)]
pub struct FraudPolicy {
    /// Deviation (pct) silently consumed.
    pub tolerance_pct: f64,
    /// Deviation (pct) logged as a warning record.
    pub warning_pct: f64,
    /// Deviation (pct) above which the penalty is `major`.
    pub major_pct: f64,
    /// Under-use (pct) beyond which a proportional refund is issued.
    pub overpayment_pct: f64,
    pub ban_count: u32,
    /// 0 = permanent.
    pub ban_days: i64,
    /// Rolling window for counting fraud attempts.
    pub window_days: i64,
}

pub struct X402Processor {
    db: Arc<PaymentDb>,
    ledger: Arc<Ledger>,
    facilitator: FacilitatorClient,
    networks: Vec<NetworkConfig>,
    pay_to: alloy::primitives::Address,
    max_timeout_secs: u64,
    fraud: FraudPolicy,
}

impl X402Processor {
    pub fn new(
        db: Arc<PaymentDb>,
        ledger: Arc<Ledger>,
        facilitator: FacilitatorClient,
        networks: Vec<NetworkConfig>,
        pay_to: alloy::primitives::Address,
        max_timeout_secs: u64,
        fraud: FraudPolicy,
    ) -> Self {
        Self {
            db,
            ledger,
            facilitator,
            networks,
            pay_to,
            max_timeout_secs,
            fraud,
        }
    }

    pub fn networks(&self) -> &[NetworkConfig] {
        &self.networks
    }

    pub fn pay_to(&self) -> alloy::primitives::Address {
        self.pay_to
    }

    pub fn max_timeout_secs(&self) -> u64 {
        self.max_timeout_secs
    }

    /// Verify a payment header and settle it through the facilitator.
    pub async fn verify_and_settle(
        &self,
        req: X402SettleRequest,
    ) -> Result<X402SettleResponse, PaymentError> {
        if req.byte_count == 0 {
            return Err(PaymentError::bad_request("byte count must be positive"));
        }
        let header = PaymentHeader::decode(&req.payment_header).map_err(PaymentError::Core)?;
        let auth = header.payload.authorization.clone();

        let network = NetworkConfig::lookup(&self.networks, &header.network)
            .cloned()
            .ok_or_else(|| {
                PaymentError::bad_request(format!("network not enabled: {}", header.network))
            })?;

        let nonce = format!(
            "0x{}",
            alloy::hex::encode(auth.nonce_bytes().map_err(PaymentError::Core)?)
        );
        let from = format!("{:#x}", auth.from);

        // Claim the nonce before signature verification or settlement.
        // A replay stops here with no further side effects.
        if !self.db.try_record_nonce(&nonce, &from, &network.network)? {
            tracing::warn!(nonce = %nonce, payer = %from, "replayed x402 nonce rejected");
            return Err(PaymentError::Core(WeftError::NonceReplayed));
        }

        self.ledger.ensure_not_banned(&req.address, req.address_kind)?;

        let recovered = recover_signer(&auth, &header.payload.signature, &network)
            .map_err(PaymentError::Core)?;
        if recovered != auth.from {
            return Err(PaymentError::Core(WeftError::SignatureInvalid(
                "recovered signer does not match authorization".to_string(),
            )));
        }

        let now = chrono::Utc::now().timestamp() as u64;
        if now < auth.valid_after {
            return Err(PaymentError::bad_request("authorization not yet valid"));
        }
        if now > auth.valid_before {
            return Err(PaymentError::bad_request("authorization expired"));
        }
        let window = auth.valid_before.saturating_sub(auth.valid_after);
        if window > self.max_timeout_secs + 60 {
            return Err(PaymentError::bad_request(format!(
                "validity window of {window}s exceeds maximum"
            )));
        }

        if auth.to != self.pay_to {
            return Err(PaymentError::bad_request(
                "recipient does not match the advertised pay-to address",
            ));
        }

        // Price the upload in the token's smallest unit. One unit of
        // tolerance covers conversion rounding on the client side.
        let (base_credits, buffered_credits) = self.ledger.priced_with_buffer(req.byte_count);
        let required_units = self
            .ledger
            .oracle()
            .token_units_for_credits(buffered_credits, network.token_decimals);
        let value = auth.value_units().map_err(PaymentError::Core)?;
        if value + 1 < required_units {
            return Err(PaymentError::Core(WeftError::InsufficientCredit {
                required: buffered_credits,
                available: self
                    .ledger
                    .oracle()
                    .credits_for_token_units(value, network.token_decimals),
            }));
        }

        let requirements = requirements_for(
            self.ledger.oracle(),
            &network,
            self.pay_to,
            buffered_credits,
            req.byte_count,
            self.max_timeout_secs,
        );

        let settlement = self
            .facilitator
            .settle(&header, &requirements)
            .await
            .map_err(|e| {
                // The nonce stays claimed: the transfer may have reached
                // the chain even though we saw a failure.
                tracing::error!(
                    nonce = %nonce,
                    payer = %from,
                    error = %e,
                    "settlement failed — nonce remains claimed"
                );
                PaymentError::Core(e)
            })?;

        let payment_id = Uuid::new_v4().to_string();
        let credits_paid = self
            .ledger
            .oracle()
            .credits_for_token_units(value, network.token_decimals);

        let row = PaymentRow {
            payment_id: payment_id.clone(),
            tx_hash: settlement.tx_hash.clone(),
            nonce: nonce.clone(),
            from_address: from.clone(),
            to_address: format!("{:#x}", auth.to),
            network: network.network.clone(),
            token_amount: auth.value.clone(),
            credit_amount: credits_paid,
            declared_bytes: req.byte_count,
            actual_bytes: None,
            mode: req.mode.as_str().to_string(),
            status: status::PENDING_VALIDATION.to_string(),
            address: req.address.clone(),
            address_kind: req.address_kind.as_str().to_string(),
            item_id: req.item_id.clone(),
            reservation_id: None,
            created_at: chrono::Utc::now().timestamp(),
            finalized_at: None,
        };
        if let Err(e) = self.db.insert_payment(&row) {
            // Funds are on-chain regardless of the local row; leave the
            // nonce claimed and surface for reconciliation.
            tracing::error!(
                tx = %settlement.tx_hash,
                payer = %from,
                error = %e,
                "reconciliation: settled payment could not be recorded"
            );
            return Err(e);
        }
        self.db
            .bind_nonce_to_payment(&nonce, &from, &network.network, &payment_id)?;

        let kind = req.address_kind;
        let (credits_reserved, credits_credited, reservation_id) = match req.mode {
            PaymentMode::Topup => {
                self.ledger.adjust_balance(
                    &req.address,
                    kind,
                    credits_paid as i64,
                    CreditReason::Topup,
                    &payment_id,
                )?;
                (0, credits_paid, None)
            }
            PaymentMode::Payg | PaymentMode::Hybrid => {
                let reserve_amount = base_credits.min(credits_paid);
                let excess = credits_paid.saturating_sub(reserve_amount);
                self.ledger.adjust_balance(
                    &req.address,
                    kind,
                    reserve_amount as i64,
                    CreditReason::Payment,
                    &payment_id,
                )?;
                if excess > 0 {
                    self.ledger.adjust_balance(
                        &req.address,
                        kind,
                        excess as i64,
                        CreditReason::HybridExcess,
                        &payment_id,
                    )?;
                }
                let reservation = self.ledger.reserve_exact(
                    &req.address,
                    kind,
                    req.item_id.as_deref(),
                    reserve_amount,
                )?;
                self.db
                    .set_payment_reservation(&payment_id, &reservation.reservation_id)?;
                (reserve_amount, excess, Some(reservation.reservation_id))
            }
        };

        tracing::info!(
            payment = %payment_id,
            tx = %settlement.tx_hash,
            payer = %from,
            mode = req.mode.as_str(),
            credits_paid,
            credits_reserved,
            "x402 payment settled"
        );

        Ok(X402SettleResponse {
            payment_id,
            tx_hash: settlement.tx_hash,
            credits_paid,
            credits_reserved,
            credits_credited,
            mode: req.mode,
            reservation_id,
        })
    }

    /// Compare declared and actual byte counts, settle the verdict.
    /// Runs when the item reaches `Permanent`; retried from a dedicated
    /// queue, so re-delivery of a finalized payment is a no-op.
    pub fn finalize(
        &self,
        req: X402FinalizeRequest,
    ) -> Result<X402FinalizeResponse, PaymentError> {
        let payment = match (&req.payment_id, &req.item_id) {
            (Some(id), _) => self.db.payment_by_id(id)?,
            (None, Some(item)) => self.db.payment_by_item(item)?,
            (None, None) => {
                return Err(PaymentError::bad_request(
                    "finalize needs a payment id or item id",
                ))
            }
        };
        let Some(payment) = payment else {
            return Err(PaymentError::bad_request("no matching x402 payment"));
        };

        if payment.finalized_at.is_some() {
            return Ok(X402FinalizeResponse {
                status: payment.status,
                actual_byte_count: payment.actual_bytes.unwrap_or(req.actual_byte_count),
                refund_credits: 0,
                fraud_type: None,
                action_taken: Some("already_finalized".to_string()),
            });
        }
        if payment.declared_bytes == 0 {
            return Err(PaymentError::internal("payment has no declared byte count"));
        }

        let actual = req.actual_byte_count;
        let declared = payment.declared_bytes;
        let deviation_pct =
            (actual as f64 - declared as f64) / (declared as f64) * 100.0;

        let mut refund_credits = 0u64;
        let mut fraud_type = None;
        let mut action_taken = None;

        let final_status = if deviation_pct > self.fraud.major_pct {
            fraud_type = Some("major".to_string());
            action_taken = Some("payment_kept".to_string());
            status::FRAUD_PENALTY
        } else if deviation_pct > self.fraud.tolerance_pct {
            fraud_type = Some("minor".to_string());
            action_taken = Some("payment_kept".to_string());
            status::FRAUD_PENALTY
        } else if deviation_pct > self.fraud.warning_pct {
            fraud_type = Some("warning".to_string());
            action_taken = Some("logged".to_string());
            tracing::warn!(
                payment = %payment.payment_id,
                declared,
                actual,
                deviation_pct,
                "declared size deviation above warning threshold"
            );
            status::CONFIRMED
        } else if deviation_pct < -self.fraud.overpayment_pct {
            // Substantially smaller than paid for: refund the unused share.
            refund_credits = ((payment.credit_amount as f64) * (-deviation_pct) / 100.0) as u64;
            action_taken = Some("refunded".to_string());
            status::REFUNDED
        } else {
            status::CONFIRMED
        };

        if let Some(severity) = &fraud_type {
            self.db.insert_fraud(
                &payment.address,
                &payment.address_kind,
                &payment.payment_id,
                declared,
                actual,
                deviation_pct,
                severity,
                action_taken.as_deref().unwrap_or("logged"),
            )?;

            if severity != "warning" {
                let since = chrono::Utc::now().timestamp()
                    - self.fraud.window_days * 86_400;
                let count =
                    self.db
                        .fraud_count_since(&payment.address, &payment.address_kind, since)?;
                if count >= self.fraud.ban_count {
                    self.db.insert_ban(
                        &payment.address,
                        &payment.address_kind,
                        "repeated declared-size fraud",
                        self.fraud.ban_days,
                        count,
                    )?;
                    action_taken = Some("banned".to_string());
                    tracing::warn!(
                        address = %payment.address,
                        count,
                        "user banned for repeated fraud"
                    );
                }
            }
        }

        if refund_credits > 0 {
            let kind = weft::SignatureKind::parse(&payment.address_kind)
                .map_err(PaymentError::Core)?;
            self.ledger.adjust_balance(
                &payment.address,
                kind,
                refund_credits as i64,
                CreditReason::OverpaymentRefund,
                &payment.payment_id,
            )?;
        }

        self.db
            .finalize_payment(&payment.payment_id, final_status, actual)?;

        tracing::info!(
            payment = %payment.payment_id,
            status = final_status,
            deviation_pct,
            refund_credits,
            "x402 payment finalized"
        );

        Ok(X402FinalizeResponse {
            status: final_status.to_string(),
            actual_byte_count: actual,
            refund_credits,
            fraud_type,
            action_taken,
        })
    }
}

//! Payment schema and data access.
//!
//! Owns `user`, `reservation`, `x402_payment`, `x402_nonce`,
//! `fraud_attempt`, `ban`, and `audit_log`. Every balance mutation runs
//! inside a transaction that also appends the matching audit row, so
//! `balance = Σ audit_log.delta` holds at every commit boundary.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;
use uuid::Uuid;
use weft::{SignatureKind, WeftError};

use crate::error::{is_unique_violation, PaymentError};

/// Reason attached to every audit-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditReason {
    Payment,
    Topup,
    HybridExcess,
    ReservationHold,
    ReservationConsume,
    ReservationRefund,
    OverpaymentRefund,
    FraudPenalty,
}

impl CreditReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditReason::Payment => "payment",
            CreditReason::Topup => "topup",
            CreditReason::HybridExcess => "hybrid_excess",
            CreditReason::ReservationHold => "reservation_hold",
            CreditReason::ReservationConsume => "reservation_consume",
            CreditReason::ReservationRefund => "reservation_refund",
            CreditReason::OverpaymentRefund => "overpayment_refund",
            CreditReason::FraudPenalty => "fraud_penalty",
        }
    }

    pub fn parse(s: &str) -> Result<Self, WeftError> {
        match s {
            "payment" => Ok(CreditReason::Payment),
            "topup" => Ok(CreditReason::Topup),
            "hybrid_excess" => Ok(CreditReason::HybridExcess),
            "reservation_hold" => Ok(CreditReason::ReservationHold),
            "reservation_consume" => Ok(CreditReason::ReservationConsume),
            "reservation_refund" => Ok(CreditReason::ReservationRefund),
            "overpayment_refund" => Ok(CreditReason::OverpaymentRefund),
            "fraud_penalty" => Ok(CreditReason::FraudPenalty),
            other => Err(WeftError::BadRequest(format!(
                "unknown credit reason: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationStatus {
    Held,
    Consumed,
    Refunded,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Held => "held",
            ReservationStatus::Consumed => "consumed",
            ReservationStatus::Refunded => "refunded",
            ReservationStatus::Expired => "expired",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "consumed" => ReservationStatus::Consumed,
            "refunded" => ReservationStatus::Refunded,
            "expired" => ReservationStatus::Expired,
            _ => ReservationStatus::Held,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReservationRow {
    pub reservation_id: String,
    pub address: String,
    pub address_kind: String,
    pub item_id: Option<String>,
    pub credits_reserved: u64,
    pub credits_base: u64,
    pub status: ReservationStatus,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct PaymentRow {
    pub payment_id: String,
    pub tx_hash: String,
    pub nonce: String,
    pub from_address: String,
    pub to_address: String,
    pub network: String,
    pub token_amount: String,
    pub credit_amount: u64,
    pub declared_bytes: u64,
    pub actual_bytes: Option<u64>,
    pub mode: String,
    pub status: String,
    pub address: String,
    pub address_kind: String,
    pub item_id: Option<String>,
    pub reservation_id: Option<String>,
    pub created_at: i64,
    pub finalized_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct BanRow {
    pub address: String,
    pub reason: String,
    pub banned_at: i64,
    pub expires_at: Option<i64>,
    pub attempt_count: u32,
}

pub struct PaymentDb {
    conn: Mutex<Connection>,
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

impl PaymentDb {
    pub fn open(path: &str) -> Result<Self, PaymentError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, PaymentError> {
        self.conn
            .lock()
            .map_err(|_| PaymentError::internal("database lock poisoned"))
    }

    fn init_schema(&self) -> Result<(), PaymentError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS user (
                address TEXT NOT NULL,
                address_kind TEXT NOT NULL,
                balance INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (address, address_kind)
            );

            CREATE TABLE IF NOT EXISTS reservation (
                reservation_id TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                address_kind TEXT NOT NULL,
                item_id TEXT,
                credits_reserved INTEGER NOT NULL,
                credits_base INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'held',
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                settled_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_reservation_user
                ON reservation(address, address_kind, status);
            CREATE INDEX IF NOT EXISTS idx_reservation_expiry
                ON reservation(status, expires_at);

            CREATE TABLE IF NOT EXISTS x402_payment (
                payment_id TEXT PRIMARY KEY,
                tx_hash TEXT NOT NULL UNIQUE,
                nonce TEXT NOT NULL,
                from_address TEXT NOT NULL,
                to_address TEXT NOT NULL,
                network TEXT NOT NULL,
                token_amount TEXT NOT NULL,
                credit_amount INTEGER NOT NULL,
                declared_bytes INTEGER NOT NULL,
                actual_bytes INTEGER,
                mode TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending_validation',
                address TEXT NOT NULL,
                address_kind TEXT NOT NULL,
                item_id TEXT,
                reservation_id TEXT,
                created_at INTEGER NOT NULL,
                finalized_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_x402_item ON x402_payment(item_id);

            CREATE TABLE IF NOT EXISTS x402_nonce (
                nonce TEXT NOT NULL,
                from_address TEXT NOT NULL,
                network TEXT NOT NULL,
                payment_id TEXT,
                recorded_at INTEGER NOT NULL,
                UNIQUE (nonce, from_address, network)
            );

            CREATE TABLE IF NOT EXISTS fraud_attempt (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL,
                address_kind TEXT NOT NULL,
                payment_id TEXT NOT NULL,
                declared_bytes INTEGER NOT NULL,
                actual_bytes INTEGER NOT NULL,
                deviation_pct REAL NOT NULL,
                severity TEXT NOT NULL,
                action TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_fraud_user
                ON fraud_attempt(address, address_kind, created_at);

            CREATE TABLE IF NOT EXISTS ban (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL,
                address_kind TEXT NOT NULL,
                reason TEXT NOT NULL,
                banned_at INTEGER NOT NULL,
                expires_at INTEGER,
                attempt_count INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ban_user ON ban(address, address_kind);

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL,
                address_kind TEXT NOT NULL,
                delta INTEGER NOT NULL,
                reason TEXT NOT NULL,
                reference_id TEXT NOT NULL,
                resulting_balance INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_user
                ON audit_log(address, address_kind);
            "#,
        )?;
        Ok(())
    }

    // --- user & audit helpers (run inside an open transaction) ---

    fn ensure_user(
        tx: &rusqlite::Transaction<'_>,
        address: &str,
        kind: &str,
        now: i64,
    ) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT OR IGNORE INTO user (address, address_kind, balance, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?3)",
            params![address, kind, now],
        )?;
        Ok(())
    }

    fn balance_in_tx(
        tx: &rusqlite::Transaction<'_>,
        address: &str,
        kind: &str,
    ) -> rusqlite::Result<i64> {
        tx.query_row(
            "SELECT balance FROM user WHERE address = ?1 AND address_kind = ?2",
            params![address, kind],
            |row| row.get(0),
        )
        .optional()
        .map(|b| b.unwrap_or(0))
    }

    fn held_in_tx(
        tx: &rusqlite::Transaction<'_>,
        address: &str,
        kind: &str,
    ) -> rusqlite::Result<i64> {
        tx.query_row(
            "SELECT COALESCE(SUM(credits_reserved), 0) FROM reservation
             WHERE address = ?1 AND address_kind = ?2 AND status = 'held'",
            params![address, kind],
            |row| row.get(0),
        )
    }

    /// Apply a balance delta and append the audit row. The caller has
    /// already validated the delta keeps the balance non-negative.
    fn apply_delta(
        tx: &rusqlite::Transaction<'_>,
        address: &str,
        kind: &str,
        delta: i64,
        reason: CreditReason,
        reference_id: &str,
        now: i64,
    ) -> rusqlite::Result<i64> {
        tx.execute(
            "UPDATE user SET balance = balance + ?3, updated_at = ?4
             WHERE address = ?1 AND address_kind = ?2",
            params![address, kind, delta, now],
        )?;
        let resulting = Self::balance_in_tx(tx, address, kind)?;
        tx.execute(
            "INSERT INTO audit_log
                 (address, address_kind, delta, reason, reference_id, resulting_balance, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![address, kind, delta, reason.as_str(), reference_id, resulting, now],
        )?;
        Ok(resulting)
    }

    // --- public operations ---

    pub fn balance(&self, address: &str, kind: SignatureKind) -> Result<u64, PaymentError> {
        let conn = self.lock()?;
        let balance: Option<i64> = conn
            .query_row(
                "SELECT balance FROM user WHERE address = ?1 AND address_kind = ?2",
                params![address, kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance.unwrap_or(0).max(0) as u64)
    }

    /// Create a held reservation after verifying
    /// `balance ≥ held + reserved` under the transaction.
    pub fn reserve(
        &self,
        address: &str,
        kind: SignatureKind,
        item_id: Option<&str>,
        credits_base: u64,
        credits_reserved: u64,
        ttl_secs: u64,
    ) -> Result<ReservationRow, PaymentError> {
        let now = now_ts();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        Self::ensure_user(&tx, address, kind.as_str(), now)?;
        let balance = Self::balance_in_tx(&tx, address, kind.as_str())?;
        let held = Self::held_in_tx(&tx, address, kind.as_str())?;
        let available = (balance - held).max(0) as u64;
        if credits_reserved > available {
            return Err(PaymentError::Core(WeftError::InsufficientCredit {
                required: credits_reserved,
                available,
            }));
        }

        let reservation_id = Uuid::new_v4().to_string();
        let expires_at = now + ttl_secs as i64;
        tx.execute(
            "INSERT INTO reservation
                 (reservation_id, address, address_kind, item_id, credits_reserved,
                  credits_base, status, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'held', ?7, ?8)",
            params![
                reservation_id,
                address,
                kind.as_str(),
                item_id,
                credits_reserved as i64,
                credits_base as i64,
                now,
                expires_at
            ],
        )?;
        Self::apply_delta(
            &tx,
            address,
            kind.as_str(),
            0,
            CreditReason::ReservationHold,
            &reservation_id,
            now,
        )?;
        tx.commit()?;

        Ok(ReservationRow {
            reservation_id,
            address: address.to_string(),
            address_kind: kind.as_str().to_string(),
            item_id: item_id.map(String::from),
            credits_reserved,
            credits_base,
            status: ReservationStatus::Held,
            created_at: now,
            expires_at,
        })
    }

    pub fn reservation(&self, reservation_id: &str) -> Result<Option<ReservationRow>, PaymentError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT reservation_id, address, address_kind, item_id, credits_reserved,
                        credits_base, status, created_at, expires_at
                 FROM reservation WHERE reservation_id = ?1",
                params![reservation_id],
                |row| {
                    Ok(ReservationRow {
                        reservation_id: row.get(0)?,
                        address: row.get(1)?,
                        address_kind: row.get(2)?,
                        item_id: row.get(3)?,
                        credits_reserved: row.get::<_, i64>(4)? as u64,
                        credits_base: row.get::<_, i64>(5)? as u64,
                        status: ReservationStatus::from_str(&row.get::<_, String>(6)?),
                        created_at: row.get(7)?,
                        expires_at: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// `held → consumed`: debit the full reserved amount, then release
    /// the unused pricing buffer back. Re-delivery of an already-consumed
    /// reservation is a no-op success.
    pub fn consume(&self, reservation_id: &str) -> Result<(u64, u64), PaymentError> {
        let now = now_ts();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let row = tx
            .query_row(
                "SELECT address, address_kind, credits_reserved, credits_base, status, expires_at
                 FROM reservation WHERE reservation_id = ?1",
                params![reservation_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((address, kind, reserved, base, status, expires_at)) = row else {
            return Err(PaymentError::bad_request(format!(
                "unknown reservation: {reservation_id}"
            )));
        };

        let buffer = (reserved - base).max(0);
        match status.as_str() {
            "held" => {}
            // At-least-once job delivery makes double-consume normal.
            "consumed" => return Ok((base.max(0) as u64, buffer as u64)),
            "expired" => {
                return Err(PaymentError::Core(WeftError::Timeout(format!(
                    "reservation {reservation_id} expired"
                ))))
            }
            _ => {
                return Err(PaymentError::bad_request(format!(
                    "reservation {reservation_id} is not held (status: {status})"
                )))
            }
        }
        if now > expires_at {
            tx.execute(
                "UPDATE reservation SET status = 'expired' WHERE reservation_id = ?1",
                params![reservation_id],
            )?;
            tx.commit()?;
            return Err(PaymentError::Core(WeftError::Timeout(format!(
                "reservation {reservation_id} expired"
            ))));
        }

        let balance = Self::balance_in_tx(&tx, &address, &kind)?;
        if balance < reserved {
            return Err(PaymentError::internal(format!(
                "ledger inconsistency: balance {balance} below reserved {reserved}"
            )));
        }

        tx.execute(
            "UPDATE reservation SET status = 'consumed', settled_at = ?2
             WHERE reservation_id = ?1",
            params![reservation_id, now],
        )?;
        Self::apply_delta(
            &tx,
            &address,
            &kind,
            -reserved,
            CreditReason::ReservationConsume,
            reservation_id,
            now,
        )?;
        if buffer > 0 {
            Self::apply_delta(
                &tx,
                &address,
                &kind,
                buffer,
                CreditReason::OverpaymentRefund,
                reservation_id,
                now,
            )?;
        }
        tx.commit()?;
        Ok((base.max(0) as u64, buffer as u64))
    }

    /// `held → refunded`: funds were never debited, so no balance change.
    pub fn refund(&self, reservation_id: &str) -> Result<(), PaymentError> {
        let now = now_ts();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let status: Option<(String, String, String)> = tx
            .query_row(
                "SELECT address, address_kind, status FROM reservation
                 WHERE reservation_id = ?1",
                params![reservation_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((address, kind, status)) = status else {
            return Err(PaymentError::bad_request(format!(
                "unknown reservation: {reservation_id}"
            )));
        };

        match status.as_str() {
            "held" => {}
            "refunded" => return Ok(()),
            other => {
                return Err(PaymentError::bad_request(format!(
                    "reservation {reservation_id} is not held (status: {other})"
                )))
            }
        }

        tx.execute(
            "UPDATE reservation SET status = 'refunded', settled_at = ?2
             WHERE reservation_id = ?1",
            params![reservation_id, now],
        )?;
        Self::apply_delta(
            &tx,
            &address,
            &kind,
            0,
            CreditReason::ReservationRefund,
            reservation_id,
            now,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Apply a signed balance delta with its audit entry.
    pub fn adjust(
        &self,
        address: &str,
        kind: SignatureKind,
        delta: i64,
        reason: CreditReason,
        reference_id: &str,
    ) -> Result<u64, PaymentError> {
        let now = now_ts();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        Self::ensure_user(&tx, address, kind.as_str(), now)?;
        let balance = Self::balance_in_tx(&tx, address, kind.as_str())?;
        if balance + delta < 0 {
            return Err(PaymentError::bad_request(format!(
                "balance would go negative (balance {balance}, delta {delta})"
            )));
        }
        let resulting =
            Self::apply_delta(&tx, address, kind.as_str(), delta, reason, reference_id, now)?;
        tx.commit()?;
        Ok(resulting.max(0) as u64)
    }

    /// Sweep `held` reservations past their expiry.
    pub fn expire_reservations(&self) -> Result<u64, PaymentError> {
        let now = now_ts();
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE reservation SET status = 'expired', settled_at = ?1
             WHERE status = 'held' AND expires_at < ?1",
            params![now],
        )?;
        Ok(changed as u64)
    }

    // --- x402 ---

    /// Atomically claim a nonce. Returns `false` when the `(nonce, from,
    /// network)` triple has been recorded before (replay attempt). The
    /// UNIQUE constraint makes this race-free across connections.
    pub fn try_record_nonce(
        &self,
        nonce: &str,
        from_address: &str,
        network: &str,
    ) -> Result<bool, PaymentError> {
        let now = now_ts();
        let conn = self.lock()?;
        match conn.execute(
            "INSERT INTO x402_nonce (nonce, from_address, network, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![nonce, from_address, network, now],
        ) {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn bind_nonce_to_payment(
        &self,
        nonce: &str,
        from_address: &str,
        network: &str,
        payment_id: &str,
    ) -> Result<(), PaymentError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE x402_nonce SET payment_id = ?4
             WHERE nonce = ?1 AND from_address = ?2 AND network = ?3",
            params![nonce, from_address, network, payment_id],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_payment(&self, row: &PaymentRow) -> Result<(), PaymentError> {
        let conn = self.lock()?;
        let result = conn.execute(
            "INSERT INTO x402_payment
                 (payment_id, tx_hash, nonce, from_address, to_address, network,
                  token_amount, credit_amount, declared_bytes, actual_bytes, mode,
                  status, address, address_kind, item_id, reservation_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                row.payment_id,
                row.tx_hash,
                row.nonce,
                row.from_address,
                row.to_address,
                row.network,
                row.token_amount,
                row.credit_amount as i64,
                row.declared_bytes as i64,
                row.actual_bytes.map(|b| b as i64),
                row.mode,
                row.status,
                row.address,
                row.address_kind,
                row.item_id,
                row.reservation_id,
                row.created_at
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(PaymentError::Core(WeftError::Duplicate(
                format!("transaction {} already recorded", row.tx_hash),
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_payment_reservation(
        &self,
        payment_id: &str,
        reservation_id: &str,
    ) -> Result<(), PaymentError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE x402_payment SET reservation_id = ?2 WHERE payment_id = ?1",
            params![payment_id, reservation_id],
        )?;
        Ok(())
    }

    fn payment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentRow> {
        Ok(PaymentRow {
            payment_id: row.get(0)?,
            tx_hash: row.get(1)?,
            nonce: row.get(2)?,
            from_address: row.get(3)?,
            to_address: row.get(4)?,
            network: row.get(5)?,
            token_amount: row.get(6)?,
            credit_amount: row.get::<_, i64>(7)? as u64,
            declared_bytes: row.get::<_, i64>(8)? as u64,
            actual_bytes: row.get::<_, Option<i64>>(9)?.map(|b| b as u64),
            mode: row.get(10)?,
            status: row.get(11)?,
            address: row.get(12)?,
            address_kind: row.get(13)?,
            item_id: row.get(14)?,
            reservation_id: row.get(15)?,
            created_at: row.get(16)?,
            finalized_at: row.get(17)?,
        })
    }

    const PAYMENT_COLS: &'static str =
        "payment_id, tx_hash, nonce, from_address, to_address, network, token_amount,
         credit_amount, declared_bytes, actual_bytes, mode, status, address, address_kind,
         item_id, reservation_id, created_at, finalized_at";

    pub fn payment_by_id(&self, payment_id: &str) -> Result<Option<PaymentRow>, PaymentError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM x402_payment WHERE payment_id = ?1",
                    Self::PAYMENT_COLS
                ),
                params![payment_id],
                Self::payment_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn payment_by_item(&self, item_id: &str) -> Result<Option<PaymentRow>, PaymentError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM x402_payment WHERE item_id = ?1
                     ORDER BY created_at DESC LIMIT 1",
                    Self::PAYMENT_COLS
                ),
                params![item_id],
                Self::payment_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn finalize_payment(
        &self,
        payment_id: &str,
        status: &str,
        actual_bytes: u64,
    ) -> Result<(), PaymentError> {
        let now = now_ts();
        let conn = self.lock()?;
        conn.execute(
            "UPDATE x402_payment SET status = ?2, actual_bytes = ?3, finalized_at = ?4
             WHERE payment_id = ?1",
            params![payment_id, status, actual_bytes as i64, now],
        )?;
        Ok(())
    }

    // --- fraud & bans ---

    #[allow(clippy::too_many_arguments)]
    pub fn insert_fraud(
        &self,
        address: &str,
        kind: &str,
        payment_id: &str,
        declared_bytes: u64,
        actual_bytes: u64,
        deviation_pct: f64,
        severity: &str,
        action: &str,
    ) -> Result<(), PaymentError> {
        let now = now_ts();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO fraud_attempt
                 (address, address_kind, payment_id, declared_bytes, actual_bytes,
                  deviation_pct, severity, action, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                address,
                kind,
                payment_id,
                declared_bytes as i64,
                actual_bytes as i64,
                deviation_pct,
                severity,
                action,
                now
            ],
        )?;
        Ok(())
    }

    /// Count penalized fraud attempts (warnings excluded) since `since`.
    pub fn fraud_count_since(
        &self,
        address: &str,
        kind: &str,
        since: i64,
    ) -> Result<u32, PaymentError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM fraud_attempt
             WHERE address = ?1 AND address_kind = ?2 AND created_at >= ?3
               AND severity IN ('minor', 'major')",
            params![address, kind, since],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    pub fn insert_ban(
        &self,
        address: &str,
        kind: &str,
        reason: &str,
        ban_days: i64,
        attempt_count: u32,
    ) -> Result<(), PaymentError> {
        let now = now_ts();
        let expires_at = if ban_days > 0 {
            Some(now + ban_days * 86_400)
        } else {
            None
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ban (address, address_kind, reason, banned_at, expires_at, attempt_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![address, kind, reason, now, expires_at, attempt_count],
        )?;
        Ok(())
    }

    /// The most recent ban still in effect, if any.
    pub fn active_ban(&self, address: &str, kind: &str) -> Result<Option<BanRow>, PaymentError> {
        let now = now_ts();
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT address, reason, banned_at, expires_at, attempt_count FROM ban
                 WHERE address = ?1 AND address_kind = ?2
                   AND (expires_at IS NULL OR expires_at > ?3)
                 ORDER BY banned_at DESC LIMIT 1",
                params![address, kind, now],
                |row| {
                    Ok(BanRow {
                        address: row.get(0)?,
                        reason: row.get(1)?,
                        banned_at: row.get(2)?,
                        expires_at: row.get(3)?,
                        attempt_count: row.get::<_, i64>(4)? as u32,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Sum of audit deltas for a user; equals the balance at every
    /// commit boundary.
    pub fn audit_sum(&self, address: &str, kind: SignatureKind) -> Result<i64, PaymentError> {
        let conn = self.lock()?;
        let sum: i64 = conn.query_row(
            "SELECT COALESCE(SUM(delta), 0) FROM audit_log
             WHERE address = ?1 AND address_kind = ?2",
            params![address, kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    pub fn held_total(&self, address: &str, kind: SignatureKind) -> Result<u64, PaymentError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let held = Self::held_in_tx(&tx, address, kind.as_str())?;
        tx.commit()?;
        Ok(held.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> PaymentDb {
        PaymentDb::open(":memory:").unwrap()
    }

    fn fund(db: &PaymentDb, address: &str, credits: i64) {
        db.adjust(
            address,
            SignatureKind::Arweave,
            credits,
            CreditReason::Topup,
            "seed",
        )
        .unwrap();
    }

    #[test]
    fn balance_equals_audit_sum() {
        let db = test_db();
        fund(&db, "alice", 1_000_000);
        let r = db
            .reserve("alice", SignatureKind::Arweave, None, 100, 115, 3600)
            .unwrap();
        db.consume(&r.reservation_id).unwrap();

        let balance = db.balance("alice", SignatureKind::Arweave).unwrap();
        let sum = db.audit_sum("alice", SignatureKind::Arweave).unwrap();
        assert_eq!(balance as i64, sum);
        assert_eq!(balance, 1_000_000 - 100);
    }

    #[test]
    fn reserve_then_refund_is_a_noop_on_balance() {
        let db = test_db();
        fund(&db, "bob", 10_000);
        let before = db.balance("bob", SignatureKind::Arweave).unwrap();

        let r = db
            .reserve("bob", SignatureKind::Arweave, None, 500, 575, 3600)
            .unwrap();
        db.refund(&r.reservation_id).unwrap();

        assert_eq!(db.balance("bob", SignatureKind::Arweave).unwrap(), before);
        assert_eq!(db.held_total("bob", SignatureKind::Arweave).unwrap(), 0);
    }

    #[test]
    fn reserve_rejects_beyond_available() {
        let db = test_db();
        fund(&db, "carol", 1_000);
        db.reserve("carol", SignatureKind::Arweave, None, 600, 690, 3600)
            .unwrap();

        let err = db
            .reserve("carol", SignatureKind::Arweave, None, 300, 345, 3600)
            .unwrap_err();
        match err {
            PaymentError::Core(WeftError::InsufficientCredit { available, .. }) => {
                assert_eq!(available, 310);
            }
            other => panic!("expected InsufficientCredit, got {other:?}"),
        }
    }

    #[test]
    fn consume_debits_base_and_releases_buffer() {
        let db = test_db();
        fund(&db, "dave", 10_000);
        let r = db
            .reserve("dave", SignatureKind::Arweave, None, 1_000, 1_150, 3600)
            .unwrap();
        let (charged, released) = db.consume(&r.reservation_id).unwrap();
        assert_eq!(charged, 1_000);
        assert_eq!(released, 150);
        assert_eq!(db.balance("dave", SignatureKind::Arweave).unwrap(), 9_000);

        // Redelivery is a no-op success.
        let (charged2, _) = db.consume(&r.reservation_id).unwrap();
        assert_eq!(charged2, 1_000);
        assert_eq!(db.balance("dave", SignatureKind::Arweave).unwrap(), 9_000);
    }

    #[test]
    fn refund_after_consume_is_rejected() {
        let db = test_db();
        fund(&db, "erin", 10_000);
        let r = db
            .reserve("erin", SignatureKind::Arweave, None, 100, 115, 3600)
            .unwrap();
        db.consume(&r.reservation_id).unwrap();
        assert!(db.refund(&r.reservation_id).is_err());
    }

    #[test]
    fn expiry_sweeps_overdue_holds() {
        let db = test_db();
        fund(&db, "frank", 10_000);
        // expires_at in the past
        let r = {
            let mut conn = db.conn.lock().unwrap();
            let tx = conn.transaction().unwrap();
            tx.execute(
                "INSERT INTO reservation
                     (reservation_id, address, address_kind, item_id, credits_reserved,
                      credits_base, status, created_at, expires_at)
                 VALUES ('res-old', 'frank', 'arweave', NULL, 100, 100, 'held', 0, 1)",
                [],
            )
            .unwrap();
            tx.commit().unwrap();
            "res-old"
        };

        assert_eq!(db.expire_reservations().unwrap(), 1);
        let row = db.reservation(r).unwrap().unwrap();
        assert_eq!(row.status, ReservationStatus::Expired);
        assert!(db.consume(r).is_err());
    }

    #[test]
    fn adjust_refuses_negative_balance() {
        let db = test_db();
        fund(&db, "gail", 50);
        let err = db
            .adjust(
                "gail",
                SignatureKind::Arweave,
                -100,
                CreditReason::FraudPenalty,
                "ref",
            )
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn nonce_claim_is_once_only() {
        let db = test_db();
        assert!(db.try_record_nonce("0xabc", "0xfrom", "base-mainnet").unwrap());
        assert!(!db.try_record_nonce("0xabc", "0xfrom", "base-mainnet").unwrap());
        // Different network is a different triple.
        assert!(db.try_record_nonce("0xabc", "0xfrom", "base-sepolia").unwrap());
    }

    #[test]
    fn duplicate_tx_hash_is_rejected() {
        let db = test_db();
        let row = PaymentRow {
            payment_id: "p1".into(),
            tx_hash: "0xT".into(),
            nonce: "0xn".into(),
            from_address: "0xf".into(),
            to_address: "0xt".into(),
            network: "base-mainnet".into(),
            token_amount: "150000".into(),
            credit_amount: 10,
            declared_bytes: 100,
            actual_bytes: None,
            mode: "hybrid".into(),
            status: "pending_validation".into(),
            address: "alice".into(),
            address_kind: "arweave".into(),
            item_id: None,
            reservation_id: None,
            created_at: 0,
            finalized_at: None,
        };
        db.insert_payment(&row).unwrap();

        let mut dup = row.clone();
        dup.payment_id = "p2".into();
        let err = db.insert_payment(&dup).unwrap_err();
        assert_eq!(err.as_wire().error, "duplicate");
    }

    #[test]
    fn ban_expiry_respected() {
        let db = test_db();
        db.insert_ban("henry", "arweave", "fraud", 30, 3).unwrap();
        assert!(db.active_ban("henry", "arweave").unwrap().is_some());

        // A permanent ban has no expiry.
        db.insert_ban("iris", "arweave", "fraud", 0, 5).unwrap();
        let ban = db.active_ban("iris", "arweave").unwrap().unwrap();
        assert!(ban.expires_at.is_none());
    }

    #[test]
    fn fraud_count_excludes_warnings() {
        let db = test_db();
        db.insert_fraud("jane", "arweave", "p1", 100, 200, 100.0, "major", "payment_kept")
            .unwrap();
        db.insert_fraud("jane", "arweave", "p2", 100, 103, 3.0, "minor", "payment_kept")
            .unwrap();
        db.insert_fraud("jane", "arweave", "p3", 100, 101, 1.0, "warning", "logged")
            .unwrap();
        assert_eq!(db.fraud_count_since("jane", "arweave", 0).unwrap(), 2);
    }
}

// service/escrow_service.rs
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    db::Store,
    models::escrowmodel::*,
    service::{error::ServiceError, payment_gateway::PaymentGateway},
};

const SETTLEMENT_BATCH: i64 = 100;

/// Largest budget a job may carry, in centavos (₱10,000,000,000.00).
pub const MAX_BUDGET: i64 = 1_000_000_000_000;

/// How a budget is divided between the downpayment and the remaining payment,
/// in basis points of the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscrowSplit {
    downpayment_bps: i64,
}

impl EscrowSplit {
    pub const HALF: EscrowSplit = EscrowSplit { downpayment_bps: 5_000 };

    pub fn new(downpayment_bps: i64) -> Result<Self, ServiceError> {
        if !(1..=10_000).contains(&downpayment_bps) {
            return Err(ServiceError::Validation(format!(
                "Downpayment ratio must be between 1 and 10000 basis points, got {}",
                downpayment_bps
            )));
        }
        Ok(Self { downpayment_bps })
    }

    /// Returns `(downpayment, remaining)`. The remaining portion absorbs rounding.
    pub fn split(&self, budget: i64) -> (i64, i64) {
        // bps <= 10_000, so the quotient never exceeds the budget and fits back in i64.
        let downpayment = (budget as i128 * self.downpayment_bps as i128 / 10_000) as i64;
        (downpayment, budget - downpayment)
    }
}

impl Default for EscrowSplit {
    fn default() -> Self {
        Self::HALF
    }
}

/// Result of one ledger operation: the record as it should be persisted and
/// the money movement to journal, if any. `movement == None` is a no-op.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerStep {
    pub escrow: EscrowTransaction,
    pub movement: Option<EscrowMovement>,
}

impl LedgerStep {
    fn moved(escrow: EscrowTransaction, kind: MovementKind, amount: i64) -> Self {
        let movement = EscrowMovement::new(escrow.job_id, kind, amount);
        Self { escrow, movement: Some(movement) }
    }

    fn noop(escrow: EscrowTransaction) -> Self {
        Self { escrow, movement: None }
    }

    pub fn is_noop(&self) -> bool {
        self.movement.is_none()
    }
}

/// The Escrow Ledger. Ledger operations are pure: they take the current record
/// and return the next one plus the movement to journal, and the caller commits
/// both in the same write as the job transition. Callers decide when money
/// moves; the ledger only decides whether the movement is valid.
#[derive(Debug, Clone)]
pub struct EscrowService {
    db_client: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    split: EscrowSplit,
    settling: Arc<Mutex<()>>,
}

impl EscrowService {
    pub fn new(db_client: Arc<dyn Store>, gateway: Arc<dyn PaymentGateway>, split: EscrowSplit) -> Self {
        Self {
            db_client,
            gateway,
            split,
            settling: Arc::new(Mutex::new(())),
        }
    }

    pub fn downpayment_for(&self, budget: i64) -> i64 {
        self.split.split(budget).0
    }

    /// Holds the downpayment. Capturing an already captured downpayment is a no-op.
    pub fn capture(
        &self,
        current: Option<&EscrowTransaction>,
        job_id: Uuid,
        budget: i64,
        amount: i64,
    ) -> Result<LedgerStep, ServiceError> {
        let (downpayment, remaining) = self.split.split(budget);
        if amount != downpayment {
            return Err(inconsistent(
                job_id,
                format!("capture of {} does not match downpayment {}", amount, downpayment),
            ));
        }

        match current {
            None => {
                let now = Utc::now();
                let escrow = EscrowTransaction {
                    job_id,
                    budget,
                    downpayment_amount: downpayment,
                    remaining_amount: remaining,
                    downpayment_state: DownpaymentState::Held,
                    remaining_state: RemainingState::Unpaid,
                    created_at: now,
                    updated_at: now,
                };
                Ok(LedgerStep::moved(escrow, MovementKind::Capture, amount))
            }
            Some(existing) => {
                check_record(existing, job_id)?;
                match existing.downpayment_state {
                    DownpaymentState::Held | DownpaymentState::Released => {
                        Ok(LedgerStep::noop(existing.clone()))
                    }
                    DownpaymentState::Refunded => Err(inconsistent(
                        job_id,
                        "capture after the downpayment was refunded".to_string(),
                    )),
                }
            }
        }
    }

    /// Pays the held downpayment to the worker.
    pub fn release(
        &self,
        current: Option<&EscrowTransaction>,
        job_id: Uuid,
        amount: i64,
    ) -> Result<LedgerStep, ServiceError> {
        let existing = current
            .ok_or_else(|| inconsistent(job_id, "release without a captured downpayment".to_string()))?;
        check_record(existing, job_id)?;
        check_amount(existing, job_id, amount, "release")?;

        match existing.downpayment_state {
            DownpaymentState::Held => {
                let mut escrow = existing.clone();
                escrow.downpayment_state = DownpaymentState::Released;
                escrow.updated_at = Utc::now();
                Ok(LedgerStep::moved(escrow, MovementKind::Release, amount))
            }
            DownpaymentState::Released => Ok(LedgerStep::noop(existing.clone())),
            DownpaymentState::Refunded => Err(inconsistent(
                job_id,
                "release after refund".to_string(),
            )),
        }
    }

    /// Returns the held downpayment to the client.
    pub fn refund(
        &self,
        current: Option<&EscrowTransaction>,
        job_id: Uuid,
        amount: i64,
    ) -> Result<LedgerStep, ServiceError> {
        let existing = current
            .ok_or_else(|| inconsistent(job_id, "refund without a captured downpayment".to_string()))?;
        check_record(existing, job_id)?;
        check_amount(existing, job_id, amount, "refund")?;

        match existing.downpayment_state {
            DownpaymentState::Held => {
                let mut escrow = existing.clone();
                escrow.downpayment_state = DownpaymentState::Refunded;
                escrow.updated_at = Utc::now();
                Ok(LedgerStep::moved(escrow, MovementKind::Refund, amount))
            }
            DownpaymentState::Refunded => Ok(LedgerStep::noop(existing.clone())),
            DownpaymentState::Released => Err(inconsistent(
                job_id,
                "refund after release".to_string(),
            )),
        }
    }

    /// Pays the remaining portion. Only valid once the downpayment was released.
    pub fn mark_remaining_paid(
        &self,
        current: Option<&EscrowTransaction>,
        job_id: Uuid,
    ) -> Result<LedgerStep, ServiceError> {
        let existing = current
            .ok_or_else(|| inconsistent(job_id, "remaining payment without an escrow record".to_string()))?;
        check_record(existing, job_id)?;

        if existing.remaining_state == RemainingState::Paid {
            return Ok(LedgerStep::noop(existing.clone()));
        }

        if existing.downpayment_state != DownpaymentState::Released {
            return Err(inconsistent(
                job_id,
                format!(
                    "remaining payment while downpayment is {:?}",
                    existing.downpayment_state
                ),
            ));
        }

        let mut escrow = existing.clone();
        escrow.remaining_state = RemainingState::Paid;
        escrow.updated_at = Utc::now();
        let amount = escrow.remaining_amount;
        Ok(LedgerStep::moved(escrow, MovementKind::RemainingPayment, amount))
    }

    pub async fn get_escrow(&self, job_id: Uuid) -> Result<Option<EscrowTransaction>, ServiceError> {
        Ok(self.db_client.get_escrow_by_job_id(job_id).await?)
    }

    pub async fn get_movements(&self, job_id: Uuid) -> Result<Vec<EscrowMovement>, ServiceError> {
        Ok(self.db_client.get_job_movements(job_id).await?)
    }

    /// Pushes journaled movements to the payment gateway. A failed movement
    /// stays unsettled and is picked up by the next pass. Returns how many settled.
    pub async fn settle_pending(&self) -> Result<usize, ServiceError> {
        let _settling = self.settling.lock().await;
        let pending = self.db_client.get_unsettled_movements(SETTLEMENT_BATCH).await?;
        self.settle(pending).await
    }

    /// Settles whatever is still unsettled for one job.
    pub async fn settle_job(&self, job_id: Uuid) -> Result<usize, ServiceError> {
        let _settling = self.settling.lock().await;
        let pending = self
            .db_client
            .get_job_movements(job_id)
            .await?
            .into_iter()
            .filter(|movement| movement.settled_at.is_none())
            .collect();
        self.settle(pending).await
    }

    async fn settle(&self, pending: Vec<EscrowMovement>) -> Result<usize, ServiceError> {
        let mut settled = 0;

        for movement in pending {
            match self.gateway.execute(&movement).await {
                Ok(reference) => {
                    self.db_client
                        .mark_movement_settled(movement.id, reference.clone())
                        .await?;
                    settled += 1;
                    tracing::info!(
                        job_id = %movement.job_id,
                        kind = movement.kind.to_str(),
                        amount = movement.amount,
                        reference = %reference,
                        "Escrow movement settled"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %movement.job_id,
                        key = %movement.idempotency_key,
                        error = %e,
                        "Escrow movement settlement failed, will retry"
                    );
                }
            }
        }

        Ok(settled)
    }
}

fn inconsistent(job_id: Uuid, detail: String) -> ServiceError {
    tracing::error!(job_id = %job_id, detail = %detail, "Escrow ledger rejected a movement");
    ServiceError::EscrowInconsistent { job_id, detail }
}

fn check_record(escrow: &EscrowTransaction, job_id: Uuid) -> Result<(), ServiceError> {
    if escrow.job_id != job_id {
        return Err(inconsistent(job_id, format!("record belongs to job {}", escrow.job_id)));
    }
    if escrow.downpayment_amount + escrow.remaining_amount != escrow.budget {
        return Err(inconsistent(job_id, "portions do not sum to the budget".to_string()));
    }
    Ok(())
}

fn check_amount(
    escrow: &EscrowTransaction,
    job_id: Uuid,
    amount: i64,
    operation: &str,
) -> Result<(), ServiceError> {
    if amount != escrow.downpayment_amount {
        return Err(inconsistent(
            job_id,
            format!(
                "{} of {} does not match downpayment {}",
                operation, amount, escrow.downpayment_amount
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::MemoryDb,
        service::{
            payment_gateway::LedgerOnlyGateway,
            test_support::{RejectingGateway, TestServices},
        },
    };
    use proptest::prelude::*;

    fn ledger() -> EscrowService {
        EscrowService::new(
            Arc::new(MemoryDb::default()),
            Arc::new(LedgerOnlyGateway),
            EscrowSplit::HALF,
        )
    }

    #[test]
    fn split_is_half_and_half_by_default() {
        assert_eq!(EscrowSplit::HALF.split(100_000), (50_000, 50_000));
        assert_eq!(EscrowSplit::HALF.split(101), (50, 51));
        assert_eq!(EscrowSplit::new(3_000).unwrap().split(100_000), (30_000, 70_000));
        assert!(EscrowSplit::new(0).is_err());
        assert!(EscrowSplit::new(10_001).is_err());
    }

    #[test]
    fn split_of_extreme_budgets_does_not_overflow() {
        let (downpayment, remaining) = EscrowSplit::HALF.split(i64::MAX);
        assert_eq!(downpayment, i64::MAX / 2);
        assert_eq!(downpayment + remaining, i64::MAX);

        let (all, none) = EscrowSplit::new(10_000).unwrap().split(i64::MAX);
        assert_eq!((all, none), (i64::MAX, 0));

        let (downpayment, remaining) = EscrowSplit::HALF.split(MAX_BUDGET);
        assert_eq!(downpayment + remaining, MAX_BUDGET);
    }

    #[tokio::test]
    async fn settle_job_only_touches_that_job() {
        let s = TestServices::with_gateway(Arc::new(RejectingGateway));
        let client = Uuid::new_v4();
        let job_a = s.jobs.hire_directly(client, Uuid::new_v4(), "Fix sink", 100_000).await.unwrap().job.id;
        let job_b = s.jobs.hire_directly(client, Uuid::new_v4(), "Fix roof", 100_000).await.unwrap().job.id;

        let ledger = EscrowService::new(s.store.clone(), Arc::new(LedgerOnlyGateway), EscrowSplit::HALF);
        assert_eq!(ledger.settle_job(job_a).await.unwrap(), 1);
        assert!(ledger.get_movements(job_a).await.unwrap()[0].settled_at.is_some());
        assert!(ledger.get_movements(job_b).await.unwrap()[0].settled_at.is_none());

        assert_eq!(ledger.settle_job(job_a).await.unwrap(), 0);
        assert_eq!(ledger.settle_pending().await.unwrap(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Capture,
        Release,
        Refund,
        PayRemaining,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Capture),
            Just(Op::Release),
            Just(Op::Refund),
            Just(Op::PayRemaining),
        ]
    }

    proptest! {
        #[test]
        fn portions_always_sum_to_budget(
            budget in 1i64..10_000_000,
            bps in 1i64..=10_000,
            ops in proptest::collection::vec(op(), 0..12),
        ) {
            let split = EscrowSplit::new(bps).unwrap();
            let ledger = EscrowService::new(
                Arc::new(MemoryDb::default()),
                Arc::new(LedgerOnlyGateway),
                split,
            );
            let job_id = Uuid::new_v4();
            let (downpayment, _) = split.split(budget);
            let mut current: Option<EscrowTransaction> = None;
            let mut released_once = false;

            for op in ops {
                let step = match op {
                    Op::Capture => ledger.capture(current.as_ref(), job_id, budget, downpayment),
                    Op::Release => ledger.release(current.as_ref(), job_id, downpayment),
                    Op::Refund => ledger.refund(current.as_ref(), job_id, downpayment),
                    Op::PayRemaining => ledger.mark_remaining_paid(current.as_ref(), job_id),
                };

                if let Ok(step) = step {
                    let before = current.as_ref().map(|e| e.downpayment_state);
                    if before == Some(DownpaymentState::Released) {
                        prop_assert_ne!(step.escrow.downpayment_state, DownpaymentState::Held);
                    }
                    if let Some(movement) = &step.movement {
                        if movement.kind == MovementKind::Release {
                            prop_assert!(!released_once);
                            released_once = true;
                        }
                    }
                    current = Some(step.escrow);
                }

                if let Some(escrow) = &current {
                    prop_assert_eq!(escrow.downpayment_amount + escrow.remaining_amount, budget);
                }
            }
        }
    }
}

use chunk::{ChunkStripe, StripeStatistics};
use std::sync::Arc;

/// SuspendableStripe wraps a registered input stripe with suspension
/// state. Statistics are snapshotted at registration and re-snapshotted
/// only on resume, when a replacement stripe supersedes the original.
#[derive(Debug, Clone)]
pub struct SuspendableStripe {
    stripe: Arc<ChunkStripe>,
    suspended: bool,
    statistics: StripeStatistics,
}

impl SuspendableStripe {
    pub fn new(stripe: Arc<ChunkStripe>) -> Self {
        let statistics = stripe.statistics();
        Self {
            stripe,
            suspended: false,
            statistics,
        }
    }

    pub fn stripe(&self) -> &Arc<ChunkStripe> {
        &self.stripe
    }

    pub fn statistics(&self) -> StripeStatistics {
        self.statistics
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn suspend(&mut self) {
        assert!(!self.suspended, "stripe is already suspended");
        self.suspended = true;
    }

    pub fn save(&self, out: &mut Vec<u8>) {
        use crate::persist::{put_bool, put_i64, put_stripe, record, tags};
        record(out, tags::SUSPENDABLE_STRIPE, |out| {
            put_stripe(out, &self.stripe);
            put_bool(out, self.suspended);
            put_i64(out, self.statistics.chunk_count);
            put_i64(out, self.statistics.data_weight);
            put_i64(out, self.statistics.row_count);
        });
    }

    pub fn load(input: &mut &[u8]) -> Result<Self, crate::persist::PersistError> {
        use crate::persist::{expect_record, get_bool, get_i64, get_stripe, parse_payload, tags};
        let payload = expect_record(input, tags::SUSPENDABLE_STRIPE)?;
        parse_payload(payload, |input| {
            Ok(Self {
                stripe: Arc::new(get_stripe(input)?),
                suspended: get_bool(input)?,
                statistics: StripeStatistics {
                    chunk_count: get_i64(input)?,
                    data_weight: get_i64(input)?,
                    row_count: get_i64(input)?,
                },
            })
        })
    }

    pub fn resume(&mut self, stripe: Arc<ChunkStripe>) {
        assert!(self.suspended, "stripe is not suspended");

        let statistics = stripe.statistics();
        if statistics != self.statistics {
            tracing::debug!(
                old = ?self.statistics,
                new = ?statistics,
                "resumed stripe statistics drifted",
            );
        }

        self.statistics = statistics;
        self.suspended = false;
        self.stripe = stripe;
    }
}

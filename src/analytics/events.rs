use std::collections::BTreeMap;

/// Structured metric emitted by the core. Converted to a flat string map only at the sink.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricEvent {
    ProfileCreated {
        offline: bool,
    },
    ScoreSubmitted {
        score: i64,
        bot_used: String,
        partitions: usize,
        queued: bool,
    },
    NewHighScore {
        score: i64,
        previous: Option<i64>,
    },
    RankChanged {
        partition_id: String,
        previous_rank: Option<u32>,
        new_rank: u32,
    },
    TournamentJoined {
        tournament_id: String,
    },
    CurrencyEarned {
        currency: String,
        amount: i64,
        source: String,
    },
    CurrencySpent {
        currency: String,
        amount: i64,
        purpose: String,
    },
    PurchaseCompleted {
        product_id: String,
        price_cents: u64,
        currency_code: String,
    },
    PurchaseDeclined {
        product_id: String,
        reason: String,
    },
    SubscriptionChanged {
        product_id: String,
        status: String,
    },
    AdRewarded {
        placement: String,
        currency: String,
        amount: i64,
    },
    SyncDegraded {
        reason: String,
    },
    QueueDrained {
        applied: usize,
        remaining: usize,
    },
}

impl MetricEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MetricEvent::ProfileCreated { .. } => "profile_created",
            MetricEvent::ScoreSubmitted { .. } => "score_submitted",
            MetricEvent::NewHighScore { .. } => "new_high_score",
            MetricEvent::RankChanged { .. } => "rank_changed",
            MetricEvent::TournamentJoined { .. } => "tournament_joined",
            MetricEvent::CurrencyEarned { .. } => "currency_earned",
            MetricEvent::CurrencySpent { .. } => "currency_spent",
            MetricEvent::PurchaseCompleted { .. } => "purchase_completed",
            MetricEvent::PurchaseDeclined { .. } => "purchase_declined",
            MetricEvent::SubscriptionChanged { .. } => "subscription_changed",
            MetricEvent::AdRewarded { .. } => "ad_rewarded",
            MetricEvent::SyncDegraded { .. } => "sync_degraded",
            MetricEvent::QueueDrained { .. } => "queue_drained",
        }
    }

    pub fn params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        let mut put = |key: &str, value: String| {
            params.insert(key.to_string(), value);
        };
        match self {
            MetricEvent::ProfileCreated { offline } => put("offline", offline.to_string()),
            MetricEvent::ScoreSubmitted {
                score,
                bot_used,
                partitions,
                queued,
            } => {
                put("score", score.to_string());
                put("bot_used", bot_used.clone());
                put("partitions", partitions.to_string());
                put("queued", queued.to_string());
            }
            MetricEvent::NewHighScore { score, previous } => {
                put("score", score.to_string());
                if let Some(previous) = previous {
                    put("previous", previous.to_string());
                }
            }
            MetricEvent::RankChanged {
                partition_id,
                previous_rank,
                new_rank,
            } => {
                put("partition", partition_id.clone());
                if let Some(previous) = previous_rank {
                    put("previous_rank", previous.to_string());
                }
                put("new_rank", new_rank.to_string());
            }
            MetricEvent::TournamentJoined { tournament_id } => {
                put("tournament_id", tournament_id.clone())
            }
            MetricEvent::CurrencyEarned {
                currency,
                amount,
                source,
            } => {
                put("currency", currency.clone());
                put("amount", amount.to_string());
                put("source", source.clone());
            }
            MetricEvent::CurrencySpent {
                currency,
                amount,
                purpose,
            } => {
                put("currency", currency.clone());
                put("amount", amount.to_string());
                put("purpose", purpose.clone());
            }
            MetricEvent::PurchaseCompleted {
                product_id,
                price_cents,
                currency_code,
            } => {
                put("product_id", product_id.clone());
                put("price_cents", price_cents.to_string());
                put("currency_code", currency_code.clone());
            }
            MetricEvent::PurchaseDeclined { product_id, reason } => {
                put("product_id", product_id.clone());
                put("reason", reason.clone());
            }
            MetricEvent::SubscriptionChanged { product_id, status } => {
                put("product_id", product_id.clone());
                put("status", status.clone());
            }
            MetricEvent::AdRewarded {
                placement,
                currency,
                amount,
            } => {
                put("placement", placement.clone());
                put("currency", currency.clone());
                put("amount", amount.to_string());
            }
            MetricEvent::SyncDegraded { reason } => put("reason", reason.clone()),
            MetricEvent::QueueDrained { applied, remaining } => {
                put("applied", applied.to_string());
                put("remaining", remaining.to_string());
            }
        }
        params
    }
}

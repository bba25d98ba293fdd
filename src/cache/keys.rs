//! Conceptual key layout of the device cache.

pub const OPERATION_QUEUE: &str = "opqueue";

pub fn profile(player_id: &str) -> String {
    format!("profile:{player_id}")
}

pub fn bots(player_id: &str) -> String {
    format!("bots:{player_id}")
}

pub fn leaderboard(partition_id: &str) -> String {
    format!("leaderboard:{partition_id}")
}

pub fn currency(currency: &str) -> String {
    format!("currency:{currency}")
}

pub fn subscription(product_id: &str) -> String {
    format!("subscriptions:{product_id}")
}

pub fn purchases(player_id: &str) -> String {
    format!("purchases:{player_id}")
}

/// Per-product suspicious-activity counters.
pub fn fraud_flags(player_id: &str) -> String {
    format!("fraud:{player_id}")
}

pub fn tournament(tournament_id: &str) -> String {
    format!("tournament:{tournament_id}")
}

pub fn memberships(player_id: &str) -> String {
    format!("memberships:{player_id}")
}

pub fn ad_rewards(player_id: &str) -> String {
    format!("ad_rewards:{player_id}")
}

/// Keys holding data that belongs to a single signed-in player and must go on sign-out.
pub fn player_scoped(player_id: &str) -> Vec<String> {
    vec![
        profile(player_id),
        bots(player_id),
        purchases(player_id),
        fraud_flags(player_id),
        memberships(player_id),
        ad_rewards(player_id),
    ]
}

/// Prefixes for device-wide data that is also cleared on sign-out.
pub const SESSION_PREFIXES: &[&str] = &["currency:", "subscriptions:", "leaderboard:", "tournament:"];

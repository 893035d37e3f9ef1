// VaultStream Engine — Sliding-Window Rate Limiter
//
// Per target: at most `rate_limit` pushes per `time_window` seconds.
// The window is computed on read from `pushed_records` at every scheduling
// decision — no in-memory bucket, so any number of workers stay correct
// without shared locks. A full window shifts `scheduled_at` forward by
// `round(window / limit)` and records the reason on the queue item.

use crate::atoms::error::EngineResult;
use crate::atoms::types::DistributionRule;
use crate::engine::clock::{iso_in_secs, now_iso};
use crate::engine::store::Store;

/// The scheduling decision for one `(rule, target)` expansion.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub scheduled_at: String,
    pub passed: bool,
    pub reason: Option<String>,
}

/// Decide when a new item for `target_id` may go out under `rule`'s limit.
pub fn schedule_under_limit(store: &Store, target_id: i64, rule: &DistributionRule) -> EngineResult<RateDecision> {
    let (Some(limit), Some(window)) = (rule.rate_limit, rule.time_window_secs) else {
        return Ok(RateDecision { scheduled_at: now_iso(), passed: true, reason: None });
    };
    if limit == 0 {
        // A zero limit means the target accepts nothing inside the window.
        return Ok(RateDecision {
            scheduled_at: iso_in_secs(window as i64),
            passed: false,
            reason: Some(format!("rate limit 0/{window}s defers all pushes")),
        });
    }

    let window_start = iso_in_secs(-(window as i64));
    let count = store.count_pushed_since(target_id, &window_start)?;

    if count + 1 > limit {
        let shift = ((window as f64) / (limit as f64)).round() as i64;
        Ok(RateDecision {
            scheduled_at: iso_in_secs(shift),
            passed: false,
            reason: Some(format!("window full: {count}/{limit} in {window}s, deferred {shift}s")),
        })
    } else {
        Ok(RateDecision { scheduled_at: now_iso(), passed: true, reason: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{MatchConditions, NsfwPolicy, RenderConfig};
    use crate::engine::clock::parse_iso;

    fn rule(limit: Option<u32>, window: Option<u32>) -> DistributionRule {
        DistributionRule {
            id: 1,
            name: "r".into(),
            description: String::new(),
            enabled: true,
            priority: 0,
            match_conditions: MatchConditions::default(),
            nsfw_policy: NsfwPolicy::Allow,
            approval_required: false,
            auto_approve_conditions: None,
            rate_limit: limit,
            time_window_secs: window,
            render_config: RenderConfig::default(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn seed_contents(store: &Store, count: usize) {
        let conn = store.conn.lock();
        for n in 0..count {
            conn.execute(
                "INSERT INTO contents (platform, url, canonical_url, created_at, updated_at)
                 VALUES ('web', ?1, ?1, '2026-01-01T00:00:00+00:00', '2026-01-01T00:00:00+00:00')",
                rusqlite::params![format!("https://example.com/{n}")],
            )
            .unwrap();
        }
    }

    #[test]
    fn unlimited_rules_pass_immediately() {
        let store = Store::open_in_memory().unwrap();
        let decision = schedule_under_limit(&store, 1, &rule(None, None)).unwrap();
        assert!(decision.passed);
        assert!(decision.reason.is_none());
    }

    #[test]
    fn full_window_defers_by_window_over_limit() {
        let store = Store::open_in_memory().unwrap();
        seed_contents(&store, 2);
        // 2 pushes to target 5 in the last hour against a 2-per-hour limit.
        store.upsert_pushed_record(1, 5, "m1", "success", None).unwrap();
        store.upsert_pushed_record(2, 5, "m2", "success", None).unwrap();

        let decision = schedule_under_limit(&store, 5, &rule(Some(2), Some(3600))).unwrap();
        assert!(!decision.passed);
        assert!(decision.reason.as_deref().unwrap().contains("2/2"));

        // Deferred ~window/limit = 1800s into the future.
        let at = parse_iso(&decision.scheduled_at).unwrap();
        let delta = (at - chrono::Utc::now()).num_seconds();
        assert!((1700..=1900).contains(&delta), "deferred {delta}s");
    }

    #[test]
    fn below_limit_passes_now() {
        let store = Store::open_in_memory().unwrap();
        seed_contents(&store, 1);
        store.upsert_pushed_record(1, 5, "m1", "success", None).unwrap();
        let decision = schedule_under_limit(&store, 5, &rule(Some(2), Some(3600))).unwrap();
        assert!(decision.passed);
    }
}

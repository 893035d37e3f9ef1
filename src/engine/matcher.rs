// VaultStream Engine — Match & Approval Engine
//
// Single entry point `match_and_enqueue`: evaluate every enabled rule
// against a content (priority order), apply the NSFW and approval gates,
// and expand the surviving `(rule, target)` pairs into queue items. The
// expansion is idempotent — the queue upsert refreshes rather than
// duplicates — so re-parses and re-reviews can call this freely.

use std::sync::Arc;

use log::{debug, info};
use serde_json::json;

use crate::atoms::error::EngineResult;
use crate::atoms::types::{
    Content, DistributionRule, EventKind, MatchConditions, NsfwPolicy, TagMatchMode,
};
use crate::engine::events::EventBus;
use crate::engine::ratelimit::schedule_under_limit;
use crate::engine::store::{QueueUpsert, Store, UpsertOutcome};

/// What one `match_and_enqueue` run did.
#[derive(Debug, Default, Clone)]
pub struct MatchOutcome {
    pub rules_matched: usize,
    pub items_created: usize,
    pub items_refreshed: usize,
    pub targets_skipped: usize,
}

impl MatchOutcome {
    pub fn touched_queue(&self) -> bool {
        self.items_created + self.items_refreshed > 0
    }
}

/// Does a rule's condition set accept this content?
pub fn conditions_match(conditions: &MatchConditions, content: &Content) -> bool {
    if let Some(platform) = &conditions.platform {
        if platform != "*" && platform != &content.platform {
            return false;
        }
    }
    if !conditions.tags.is_empty() {
        let hit = match conditions.tags_match_mode {
            TagMatchMode::Any => conditions.tags.iter().any(|t| content.tags.contains(t)),
            TagMatchMode::All => conditions.tags.iter().all(|t| content.tags.contains(t)),
        };
        if !hit {
            return false;
        }
    }
    if conditions.tags_exclude.iter().any(|t| content.tags.contains(t)) {
        return false;
    }
    if let Some(nsfw) = conditions.is_nsfw {
        if nsfw != content.is_nsfw {
            return false;
        }
    }
    true
}

/// True when some enabled rule both matches the content and declares
/// satisfied auto-approve conditions. The parse worker uses this to flip
/// `pending → auto_approved` before expansion.
pub fn qualifies_for_auto_approval(rules: &[DistributionRule], content: &Content) -> bool {
    rules.iter().any(|rule| {
        conditions_match(&rule.match_conditions, content)
            && rule
                .auto_approve_conditions
                .as_ref()
                .is_some_and(|c| c.satisfied_by(content))
    })
}

/// Evaluate rules and expand matches into queue items.
pub fn match_and_enqueue(store: &Store, bus: &Arc<EventBus>, content: &Content) -> EngineResult<MatchOutcome> {
    let rules = store.list_rules(true)?;
    let mut outcome = MatchOutcome::default();

    for rule in &rules {
        if !conditions_match(&rule.match_conditions, content) {
            continue;
        }

        // NSFW gate, rule level.
        if content.is_nsfw && rule.nsfw_policy == NsfwPolicy::Block {
            debug!("[matcher] rule '{}' blocks nsfw content {}", rule.name, content.id);
            continue;
        }

        outcome.rules_matched += 1;
        let needs_approval = rule.approval_required && !content.review_status.is_approved();

        for target in store.list_targets(rule.id)? {
            if !target.enabled {
                continue;
            }
            let chat = match store.get_chat(target.bot_chat_id) {
                Ok(chat) => chat,
                Err(_) => {
                    outcome.targets_skipped += 1;
                    continue;
                }
            };
            if !chat.enabled || !chat.can_post {
                outcome.targets_skipped += 1;
                continue;
            }

            // NSFW gate, target level: `separate_channel` reroutes to the
            // chat's NSFW sibling and skips targets that have none.
            let nsfw_routing = if content.is_nsfw && rule.nsfw_policy == NsfwPolicy::SeparateChannel {
                match &chat.nsfw_chat_id {
                    Some(redirect) => Some(redirect.clone()),
                    None => {
                        outcome.targets_skipped += 1;
                        continue;
                    }
                }
            } else {
                None
            };

            // Dedup: an existing pushed record blocks the target unless the
            // content was re-approved after that push. A reopened target
            // also resurrects its terminal queue row as a fresh attempt.
            let mut reopened = false;
            if let Some(record) = store.get_pushed_record(content.id, target.id)? {
                reopened = content
                    .reviewed_at
                    .as_deref()
                    .is_some_and(|reviewed| reviewed > record.pushed_at.as_str());
                if !reopened {
                    outcome.targets_skipped += 1;
                    continue;
                }
            }

            let decision = schedule_under_limit(store, target.id, rule)?;
            let upsert = QueueUpsert {
                content_id: content.id,
                rule_id: rule.id,
                bot_chat_id: target.bot_chat_id,
                needs_approval,
                scheduled_at: decision.scheduled_at,
                priority: rule.priority,
                nsfw_routing_result: nsfw_routing,
                passed_rate_limit: decision.passed,
                rate_limit_reason: decision.reason,
                reopen_terminal: reopened,
            };
            match store.upsert_queue_item(&upsert)? {
                UpsertOutcome::Created(_) => outcome.items_created += 1,
                UpsertOutcome::Refreshed(_) => outcome.items_refreshed += 1,
                UpsertOutcome::Untouched(_) => outcome.targets_skipped += 1,
            }
        }
    }

    if outcome.touched_queue() {
        info!(
            "[matcher] content {} matched {} rule(s): {} new, {} refreshed",
            content.id, outcome.rules_matched, outcome.items_created, outcome.items_refreshed
        );
        bus.publish(
            EventKind::QueueUpdated,
            json!({
                "content_id": content.id,
                "created": outcome.items_created,
                "refreshed": outcome.items_refreshed,
            }),
        );
    }
    Ok(outcome)
}

/// Human review decision. Approval releases the content's gated items and
/// re-runs matching so re-approval can reopen already-pushed targets;
/// rejection skips whatever was waiting.
pub fn review_content(
    store: &Store,
    bus: &Arc<EventBus>,
    content_id: i64,
    approve: bool,
    by: Option<&str>,
    note: Option<&str>,
) -> EngineResult<Content> {
    use crate::atoms::types::ReviewStatus;

    let status = if approve { ReviewStatus::Approved } else { ReviewStatus::Rejected };
    let content = store.set_review(content_id, status, by, note)?;

    if approve {
        let released = store.release_approved_items(content_id, by)?;
        let outcome = match_and_enqueue(store, bus, &content)?;
        if released > 0 && !outcome.touched_queue() {
            bus.publish(
                EventKind::QueueUpdated,
                json!({ "content_id": content_id, "op": "approved", "released": released }),
            );
        }
    } else {
        let skipped = store.skip_pending_items(content_id)?;
        if skipped > 0 {
            bus.publish(
                EventKind::QueueUpdated,
                json!({ "content_id": content_id, "op": "rejected", "skipped": skipped }),
            );
        }
    }

    bus.publish(
        EventKind::ContentUpdated,
        json!({ "content_id": content_id, "review_status": content.review_status }),
    );
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::*;
    use crate::engine::store::{NewShare, RuleDraft, TargetDraft};

    fn store_with_chat() -> (Arc<Store>, i64) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bot_id = store
            .create_bot(&BotConfig {
                id: 0,
                platform: BotPlatform::Telegram,
                name: "b".into(),
                enabled: true,
                is_primary: true,
                bot_token: Some("t".into()),
                napcat_http_url: None,
                napcat_ws_url: None,
                bot_id: None,
                bot_username: None,
                created_at: String::new(),
                updated_at: String::new(),
            })
            .unwrap();
        store
            .upsert_chat(
                bot_id,
                &crate::engine::store::DiscoveredChat {
                    chat_id: "-100".into(),
                    chat_type: "channel".into(),
                    title: "main".into(),
                    username: None,
                    can_post: true,
                },
            )
            .unwrap();
        let chat_id = store.list_chats(bot_id).unwrap()[0].id;
        (store, chat_id)
    }

    fn content(store: &Store, tags: &[&str], nsfw: bool) -> Content {
        let (content, _) = store
            .submit_share(&NewShare {
                platform: "bilibili".into(),
                url: format!("https://b23.tv/{}", uuid::Uuid::new_v4()),
                canonical_url: format!("https://b23.tv/{}", uuid::Uuid::new_v4()),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                source: None,
                note: None,
                is_nsfw: Some(nsfw),
                layout_type_override: None,
            })
            .unwrap();
        content
    }

    fn rule(tags: &[&str], nsfw_policy: NsfwPolicy, approval: bool, priority: i64) -> RuleDraft {
        RuleDraft {
            name: "r".into(),
            description: String::new(),
            enabled: true,
            priority,
            match_conditions: MatchConditions {
                tags: tags.iter().map(|t| t.to_string()).collect(),
                ..Default::default()
            },
            nsfw_policy,
            approval_required: approval,
            auto_approve_conditions: None,
            rate_limit: None,
            time_window_secs: None,
            render_config: RenderConfig::default(),
        }
    }

    fn target(chat_id: i64) -> TargetDraft {
        TargetDraft {
            bot_chat_id: chat_id,
            enabled: true,
            merge_forward: false,
            use_author_name: true,
            summary: None,
            render_config_override: None,
        }
    }

    #[test]
    fn matching_rule_expands_into_scheduled_item() {
        let (store, chat_id) = store_with_chat();
        let bus = Arc::new(EventBus::new(Arc::clone(&store)));
        store.create_rule(&rule(&["tech"], NsfwPolicy::Block, false, 5), &[target(chat_id)]).unwrap();

        let c = content(&store, &["tech"], false);
        let outcome = match_and_enqueue(&store, &bus, &c).unwrap();
        assert_eq!(outcome.items_created, 1);

        let items = store.items_for_content(c.id).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, QueueStatus::Scheduled);
        assert_eq!(items[0].priority, 5);
        assert!(!items[0].needs_approval);
    }

    #[test]
    fn nsfw_block_skips_rule_entirely() {
        let (store, chat_id) = store_with_chat();
        let bus = Arc::new(EventBus::new(Arc::clone(&store)));
        store.create_rule(&rule(&["tech"], NsfwPolicy::Block, false, 0), &[target(chat_id)]).unwrap();

        let c = content(&store, &["tech"], true);
        let outcome = match_and_enqueue(&store, &bus, &c).unwrap();
        assert_eq!(outcome.items_created, 0);
        assert!(store.items_for_content(c.id).unwrap().is_empty());
    }

    #[test]
    fn separate_channel_without_redirect_skips_target() {
        let (store, chat_id) = store_with_chat();
        let bus = Arc::new(EventBus::new(Arc::clone(&store)));
        store
            .create_rule(&rule(&["tech"], NsfwPolicy::SeparateChannel, false, 0), &[target(chat_id)])
            .unwrap();

        let c = content(&store, &["tech"], true);
        let outcome = match_and_enqueue(&store, &bus, &c).unwrap();
        assert_eq!(outcome.items_created, 0);
        assert_eq!(outcome.targets_skipped, 1);

        // With a redirect configured the target routes instead of skipping.
        {
            let conn = store.conn.lock();
            conn.execute("UPDATE bot_chats SET nsfw_chat_id='-200'", []).unwrap();
        }
        let outcome = match_and_enqueue(&store, &bus, &c).unwrap();
        assert_eq!(outcome.items_created, 1);
        let items = store.items_for_content(c.id).unwrap();
        assert_eq!(items[0].nsfw_routing_result.as_deref(), Some("-200"));
    }

    #[test]
    fn approval_gate_parks_items_as_pending() {
        let (store, chat_id) = store_with_chat();
        let bus = Arc::new(EventBus::new(Arc::clone(&store)));
        store.create_rule(&rule(&["tech"], NsfwPolicy::Allow, true, 0), &[target(chat_id)]).unwrap();

        let c = content(&store, &["tech"], false);
        match_and_enqueue(&store, &bus, &c).unwrap();
        let items = store.items_for_content(c.id).unwrap();
        assert_eq!(items[0].status, QueueStatus::Pending);
        assert!(items[0].needs_approval);

        // Approved contents pass the gate directly.
        let approved = store.set_review(c.id, ReviewStatus::Approved, Some("admin"), None).unwrap();
        match_and_enqueue(&store, &bus, &approved).unwrap();
        let items = store.items_for_content(c.id).unwrap();
        assert_eq!(items[0].status, QueueStatus::Scheduled);
    }

    #[test]
    fn pushed_record_blocks_until_reapproval() {
        let (store, chat_id) = store_with_chat();
        let bus = Arc::new(EventBus::new(Arc::clone(&store)));
        let rule_id =
            store.create_rule(&rule(&["tech"], NsfwPolicy::Allow, false, 0), &[target(chat_id)]).unwrap();
        let target_id = store.list_targets(rule_id).unwrap()[0].id;

        let c = content(&store, &["tech"], false);
        store.upsert_pushed_record(c.id, target_id, "m1", "success", None).unwrap();

        let outcome = match_and_enqueue(&store, &bus, &c).unwrap();
        assert_eq!(outcome.items_created, 0, "already pushed, not reopened");

        // A review stamped after the push reopens the target.
        let reapproved = store.set_review(c.id, ReviewStatus::Approved, Some("admin"), None).unwrap();
        let outcome = match_and_enqueue(&store, &bus, &reapproved).unwrap();
        assert_eq!(outcome.items_created, 1);
    }

    #[test]
    fn condition_evaluation_covers_modes() {
        let mk = |tags: &[&str], exclude: &[&str], mode| MatchConditions {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            tags_exclude: exclude.iter().map(|t| t.to_string()).collect(),
            tags_match_mode: mode,
            ..Default::default()
        };
        let store = Store::open_in_memory().unwrap();
        let mut c = content(&store, &["a", "b"], false);

        assert!(conditions_match(&mk(&["a"], &[], TagMatchMode::Any), &c));
        assert!(conditions_match(&mk(&["a", "b"], &[], TagMatchMode::All), &c));
        assert!(!conditions_match(&mk(&["a", "z"], &[], TagMatchMode::All), &c));
        assert!(!conditions_match(&mk(&["a"], &["b"], TagMatchMode::Any), &c));

        let platform_gate = MatchConditions { platform: Some("weibo".into()), ..Default::default() };
        assert!(!conditions_match(&platform_gate, &c));
        let wildcard = MatchConditions { platform: Some("*".into()), ..Default::default() };
        assert!(conditions_match(&wildcard, &c));

        c.is_nsfw = true;
        let nsfw_only = MatchConditions { is_nsfw: Some(false), ..Default::default() };
        assert!(!conditions_match(&nsfw_only, &c));
    }
}

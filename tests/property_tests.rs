//! Property-based tests for killfeed's pure building blocks.
//!
//! These tests use the `proptest` framework to check invariants across many
//! randomly generated inputs instead of a handful of examples.
//!
//! # Prerequisites
//!
//! - No database or network access required for the cursor, proximity and
//!   classifier properties.
//! - The achievement property runs against an in-memory SQLite store.
//!
//! # How to run
//!
//! ```bash
//! cargo test --test property_tests
//! PROPTEST_CASES=10000 cargo test --test property_tests
//! ```
//!
//! Each property is named `prop_<function>_<invariant>`.

use chrono::Utc;
use killfeed::classifier::{classify_detailed, classify_lines, Classification};
use killfeed::cursor::{complete_lines, plan, CursorState};
use killfeed::store::{EffectPlan, EventStore, NewBatch, ProgressStep, SqliteStore};
use killfeed::territory::{tier_for, ProximityTier};
use killfeed::DomainEvent;
use proptest::prelude::*;

fn state(generation: i64, offset: i64, path: &str) -> CursorState {
    CursorState {
        generation,
        offset,
        remote_path: Some(path.to_string()),
        last_fetch: None,
    }
}

proptest! {
    /// Without rotation the planned range starts exactly at the stored offset
    /// and never moves backwards.
    #[test]
    fn prop_plan_never_moves_backwards(offset in 0i64..10_000, grow in 0i64..10_000, generation in 0i64..50) {
        let current = state(generation, offset, "p/a.ADM");
        let p = plan(Some(&current), "p/a.ADM", offset + grow, false);
        prop_assert!(!p.rotated);
        prop_assert_eq!(p.generation, generation);
        prop_assert_eq!(p.start, offset);
        prop_assert!(p.end >= current.offset);
    }

    /// A shorter file resets to line 0 and bumps the generation exactly once.
    #[test]
    fn prop_plan_rotation_resets_once(offset in 1i64..10_000, shrink in 1i64..10_000, generation in 0i64..50) {
        let count = (offset - shrink).max(0);
        let current = state(generation, offset, "p/a.ADM");
        let p = plan(Some(&current), "p/a.ADM", count, false);
        prop_assert!(p.rotated);
        prop_assert_eq!(p.generation, generation + 1);
        prop_assert_eq!((p.start, p.end), (0, count));

        // the persisted result of that plan is steady on the next identical fetch
        let after = state(p.generation, p.end, "p/a.ADM");
        let again = plan(Some(&after), "p/a.ADM", count, false);
        prop_assert!(!again.rotated);
        prop_assert_eq!(again.new_lines(), 0);
    }

    /// Only newline-terminated lines are counted.
    #[test]
    fn prop_complete_lines_ignores_unterminated_tail(lines in prop::collection::vec("[a-zA-Z0-9 ]{0,20}", 0..20), tail in "[a-zA-Z0-9 ]{0,20}") {
        let mut text: String = lines.iter().map(|l| format!("{}\n", l)).collect();
        text.push_str(&tail);
        let parsed = complete_lines(&text);
        prop_assert_eq!(parsed.len(), lines.len());
        for (a, b) in parsed.iter().zip(lines.iter()) {
            prop_assert_eq!(*a, b.as_str());
        }
    }

    /// Tiers partition the distance axis in order: violation, alert, safe.
    #[test]
    fn prop_tier_for_is_monotone(radius in 1.0f64..500.0, margin in 0.0f64..1000.0, d1 in 0.0f64..5000.0, d2 in 0.0f64..5000.0) {
        let rank = |t: ProximityTier| match t {
            ProximityTier::Violation => 0,
            ProximityTier::Alert => 1,
            ProximityTier::Safe => 2,
        };
        let (near, far) = if d1 <= d2 { (d1, d2) } else { (d2, d1) };
        prop_assert!(rank(tier_for(near, radius, margin)) <= rank(tier_for(far, radius, margin)));
        prop_assert_eq!(tier_for(radius, radius, margin), ProximityTier::Violation);
        prop_assert_eq!(
            tier_for(radius + margin + 0.5, radius, margin),
            ProximityTier::Safe
        );
    }

    /// Classification never panics and offsets stay attached to their lines.
    #[test]
    fn prop_classify_lines_keeps_offsets(lines in prop::collection::vec(".{0,80}", 0..30), first in 0i64..1000) {
        let (events, stats) = classify_lines(&lines, first);
        prop_assert_eq!(stats.events() + stats.ignored + stats.unmatched, lines.len() as u64);
        for (offset, event) in &events {
            let idx = (offset - first) as usize;
            match classify_detailed(&lines[idx]) {
                Classification::Event { event: again, .. } => prop_assert_eq!(&again, event),
                other => prop_assert!(false, "offset {} reclassified as {:?}", offset, other),
            }
        }
    }

    /// Progress never decreases and unlock happens once, when target is first reached.
    #[test]
    fn prop_achievement_progress_is_monotone(target in 1i64..8, steps in prop::collection::vec(0i64..3, 1..12)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = SqliteStore::in_memory().await.unwrap();
            let stream = store.register_stream("prop").await.unwrap();
            let events: Vec<(i64, DomainEvent)> = (0..steps.len() as i64)
                .map(|i| (i, DomainEvent::ZombieKill { gamertag: "p".into() }))
                .collect();
            let batch = NewBatch {
                stream_id: stream,
                plan: plan(None, "p/a.ADM", events.len() as i64, true),
                remote_path: "p/a.ADM",
                events: &events,
                fetched_at: Utc::now(),
            };
            store.append_batch(&batch).await.unwrap();
            let pending = store.pending_events(stream, 100).await.unwrap();

            let mut last = 0;
            let mut unlocks = 0;
            let mut expected = 0;
            for (stored, amount) in pending.iter().zip(steps.iter()) {
                let mut effects = EffectPlan::empty(stored.id, Utc::now());
                effects.progress.push(ProgressStep {
                    identity: "u1".into(),
                    gamertag: "p".into(),
                    key: "grinder".into(),
                    name: "Grinder".into(),
                    target,
                    reward: 0,
                    amount: *amount,
                });
                if let killfeed::store::EffectOutcome::Applied(applied) =
                    store.apply_effects(&effects).await.unwrap()
                {
                    unlocks += applied.unlocked.len();
                }
                if expected < target {
                    expected += amount;
                }

                let row = store.achievement_progress("u1", "grinder").await.unwrap().unwrap();
                assert!(row.progress >= last);
                assert_eq!(row.progress, expected);
                assert_eq!(row.unlocked, row.progress >= target);
                last = row.progress;
            }
            assert_eq!(unlocks, usize::from(expected >= target));
        });
    }
}

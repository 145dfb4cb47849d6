// tests/selection.rs
//
// Selection against the in-process store:
// - uniqueness of fingerprint and company, source cap, under shuffled pools
// - the company A / company B / source X scenario across slots 2..4
// - crash recovery: slot 4 fails after slots 1-3 are persisted

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;

use issue_pipeline::classify::{SlotRule, SlotRules};
use issue_pipeline::config::SelectionConfig;
use issue_pipeline::error::{ErrorKind, PipelineError, Result};
use issue_pipeline::jobs::JobContext;
use issue_pipeline::model::{Candidate, Slot};
use issue_pipeline::retry::RetryPolicy;
use issue_pipeline::select::{
    RankPick, RankingDelegate, SelectionInputs, SelectionState, Selector, SimilarHeadlines, SlotOutcome,
};
use issue_pipeline::store::{MemoryStore, Repository};

const WORDS: [&str; 12] = [
    "orbit", "harvest", "lantern", "quartz", "meadow", "glacier", "copper", "falcon", "violet", "summit",
    "canyon", "ember",
];
const NOUNS: [&str; 12] = [
    "merger", "lawsuit", "rollout", "recall", "earnings", "hiring", "patent", "outage", "rebrand", "audit",
    "listing", "breach",
];

fn cand(fp: &str, title: &str, company: Option<&str>, source: &str, now: DateTime<Utc>) -> Candidate {
    Candidate {
        fingerprint: fp.into(),
        title: title.into(),
        url: Some(format!("https://news.test/{fp}")),
        source: source.into(),
        published_at: now - Duration::hours(1),
        ingested_at: now,
        company: company.map(str::to_string),
        classified_at: Some(now),
    }
}

fn repo() -> Arc<Repository> {
    Arc::new(Repository::new(Arc::new(MemoryStore::new()), RetryPolicy::default()))
}

fn selector(ranker: Arc<dyn RankingDelegate>, repo: Arc<Repository>) -> Selector {
    Selector::new(
        ranker,
        Arc::new(SimilarHeadlines::default()),
        repo,
        SlotRules::default_seed(),
        SelectionConfig::default(),
    )
}

fn pick(c: &Candidate) -> RankPick {
    RankPick {
        fingerprint: c.fingerprint.clone(),
        company: c.company.clone(),
        source: Some(c.source.clone()),
        reasoning: "test pick".into(),
    }
}

/// Takes whatever comes first in the (pre-shuffled) pool.
struct FirstPick;

#[async_trait]
impl RankingDelegate for FirstPick {
    async fn rank(&self, _rule: &SlotRule, pool: &[Candidate], _s: &SelectionState) -> Result<RankPick> {
        Ok(pick(&pool[0]))
    }
}

/// Prefers a given company when the pool still offers it.
struct PreferCompany(&'static str);

#[async_trait]
impl RankingDelegate for PreferCompany {
    async fn rank(&self, _rule: &SlotRule, pool: &[Candidate], _s: &SelectionState) -> Result<RankPick> {
        let c = pool
            .iter()
            .find(|c| c.company.as_deref() == Some(self.0))
            .unwrap_or(&pool[0]);
        Ok(pick(c))
    }
}

/// Fails on one slot; cancels the job there too when asked to.
struct FailOnSlot {
    slot: u8,
    cancel: Option<CancellationToken>,
}

#[async_trait]
impl RankingDelegate for FailOnSlot {
    async fn rank(&self, rule: &SlotRule, pool: &[Candidate], _s: &SelectionState) -> Result<RankPick> {
        if rule.slot.number() == self.slot {
            if let Some(token) = &self.cancel {
                token.cancel();
            }
            return Err(PipelineError::Fatal("ranking service exploded".into()));
        }
        Ok(pick(&pool[0]))
    }
}

fn shared_pools(now: DateTime<Utc>) -> Vec<Candidate> {
    let companies = ["Acme", "Beta", "Cobalt", "Delta"];
    let sources = ["X", "Y", "Z"];
    (0..12)
        .map(|i| {
            cand(
                &format!("p_{i:02}"),
                &format!("{} {}", WORDS[i], NOUNS[i]),
                Some(companies[i % companies.len()]),
                sources[i % sources.len()],
                now,
            )
        })
        .collect()
}

#[tokio::test]
async fn shuffled_pools_never_break_uniqueness_or_caps() {
    let now = Utc::now();
    for seed in 0..25u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut pools = BTreeMap::new();
        for slot in Slot::all() {
            let mut pool = shared_pools(now);
            pool.shuffle(&mut rng);
            pools.insert(slot, pool);
        }

        let repo = repo();
        let issue_id = format!("seed-{seed}");
        let report = selector(Arc::new(FirstPick), repo.clone())
            .select(
                &issue_id,
                SelectionInputs {
                    pools,
                    ..Default::default()
                },
                &JobContext::detached(),
                now,
            )
            .await
            .unwrap();

        let chosen = repo.selected_slots(&issue_id).await.unwrap();
        assert_eq!(chosen.len(), report.selected().len(), "seed {seed}");
        // Four companies and a source cap of 2 over three sources: exactly four fills.
        assert_eq!(chosen.len(), 4, "seed {seed}");

        let fps: HashSet<_> = chosen.iter().map(|s| s.fingerprint.clone()).collect();
        assert_eq!(fps.len(), chosen.len(), "seed {seed}: duplicate fingerprint");

        let companies: HashSet<_> = chosen
            .iter()
            .filter_map(|s| s.company.as_deref().map(str::to_lowercase))
            .collect();
        assert_eq!(companies.len(), chosen.len(), "seed {seed}: duplicate company");

        let mut per_source: HashMap<String, usize> = HashMap::new();
        for s in &chosen {
            *per_source.entry(s.source.clone().unwrap_or_default()).or_default() += 1;
        }
        assert!(per_source.values().all(|&n| n <= 2), "seed {seed}: {per_source:?}");

        let slots: Vec<u8> = chosen.iter().map(|s| s.slot.number()).collect();
        let mut sorted = slots.clone();
        sorted.sort();
        assert_eq!(slots, sorted);
    }
}

#[tokio::test]
async fn company_a_then_b_then_source_cap_on_x() {
    let now = Utc::now();
    let x_pool = vec![
        cand("p_a1", "Acme ships orbit lantern", Some("A"), "X", now),
        cand("p_a2", "Acme quartz meadow deal", Some("A"), "X", now),
        cand("p_a3", "Acme glacier copper layoffs", Some("A"), "X", now),
        cand("p_b1", "Beta falcon violet funding", Some("B"), "X", now),
        cand("p_b2", "Beta summit canyon outage", Some("B"), "X", now),
    ];
    let mut later_pool = x_pool.clone();
    later_pool.push(cand("p_d1", "Delta ember patent fight", Some("D"), "X", now));
    later_pool.push(cand("p_y1", "Cobalt harvest policy shift", Some("C"), "Y", now));

    let mut pools = BTreeMap::new();
    pools.insert(Slot::new(2).unwrap(), x_pool.clone());
    pools.insert(Slot::new(3).unwrap(), x_pool);
    pools.insert(Slot::new(4).unwrap(), later_pool);

    let repo = repo();
    let report = selector(Arc::new(PreferCompany("A")), repo.clone())
        .select(
            "2026-10-17",
            SelectionInputs {
                pools,
                ..Default::default()
            },
            &JobContext::detached(),
            now,
        )
        .await
        .unwrap();

    let slot = |n: u8| &report.outcomes[&Slot::new(n).unwrap()];
    assert!(matches!(slot(1), SlotOutcome::Empty { .. }));
    assert_eq!(slot(2).selected().unwrap().company.as_deref(), Some("A"));
    // Company A is taken, so slot 3 can only go to B.
    assert_eq!(slot(3).selected().unwrap().company.as_deref(), Some("B"));
    // Two from X already: only the Y story survives the source cap.
    assert_eq!(slot(4).selected().unwrap().fingerprint, "p_y1");
    assert_eq!(report.summary.get("excluded_source_cap"), 1);
    assert_eq!(report.summary.get("excluded_company"), 5);

    let persisted = repo.selected_slots("2026-10-17").await.unwrap();
    assert_eq!(persisted.len(), 3);
}

fn five_slot_pools(now: DateTime<Utc>) -> BTreeMap<Slot, Vec<Candidate>> {
    Slot::all()
        .map(|slot| {
            let n = slot.number() as usize;
            let c = cand(
                &format!("p_slot{n}"),
                &format!("{} {} update", WORDS[n], WORDS[n + 6]),
                Some(&format!("Company{n}")),
                &format!("Source{n}"),
                now,
            );
            (slot, vec![c])
        })
        .collect()
}

#[tokio::test]
async fn slot_four_failure_keeps_slots_one_to_three() {
    let now = Utc::now();
    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(Repository::new(store.clone(), RetryPolicy::default()));

    let report = selector(Arc::new(FailOnSlot { slot: 4, cancel: None }), repo.clone())
        .select(
            "2026-10-17",
            SelectionInputs {
                pools: five_slot_pools(now),
                ..Default::default()
            },
            &JobContext::detached(),
            now,
        )
        .await
        .unwrap();
    assert!(matches!(report.outcomes[&Slot::new(4).unwrap()], SlotOutcome::Failed { .. }));
    assert_eq!(report.errors().len(), 1);

    let persisted = repo.selected_slots("2026-10-17").await.unwrap();
    let slots: Vec<u8> = persisted.iter().map(|s| s.slot.number()).collect();
    assert_eq!(slots, vec![1, 2, 3, 5]);
    assert_eq!(persisted[0].fingerprint, "p_slot1");
    assert_eq!(persisted[2].fingerprint, "p_slot3");

    // A rerun resumes the persisted slots; slot 4 sits below slot 5 and stays empty.
    let rerun = selector(Arc::new(FirstPick), repo.clone())
        .select(
            "2026-10-17",
            SelectionInputs {
                pools: five_slot_pools(now),
                existing: persisted,
                recent_headlines: vec![],
            },
            &JobContext::detached(),
            now,
        )
        .await
        .unwrap();
    assert_eq!(rerun.summary.get("resumed"), 4);
    assert_eq!(rerun.summary.get("frozen"), 1);
    match &rerun.outcomes[&Slot::new(4).unwrap()] {
        SlotOutcome::Empty { reason } => assert!(reason.contains("later slot")),
        other => panic!("slot 4 should stay empty, got {other:?}"),
    }

    // Insertion order in the store is still increasing by slot.
    let written: Vec<u64> = store
        .rows("selected_slots")
        .iter()
        .filter_map(|r| r.fields.get("slot").and_then(|v| v.as_u64()))
        .collect();
    assert_eq!(written, vec![1, 2, 3, 5]);
}

#[tokio::test]
async fn interrupted_run_leaves_earlier_slots_intact() {
    let now = Utc::now();
    let repo = repo();
    let ctx = JobContext::detached();

    let err = selector(
        Arc::new(FailOnSlot {
            slot: 4,
            cancel: Some(ctx.token().clone()),
        }),
        repo.clone(),
    )
    .select(
        "2026-10-17",
        SelectionInputs {
            pools: five_slot_pools(now),
            ..Default::default()
        },
        &ctx,
        now,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let persisted = repo.selected_slots("2026-10-17").await.unwrap();
    let slots: Vec<u8> = persisted.iter().map(|s| s.slot.number()).collect();
    assert_eq!(slots, vec![1, 2, 3]);
    for s in &persisted {
        assert_eq!(s.fingerprint, format!("p_slot{}", s.slot.number()));
    }
}

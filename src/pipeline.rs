// src/pipeline.rs
//! Stage handlers and the issue lifecycle that ties them together.
//!
//! Every collaborator is built once (see [`Pipeline::from_config`]) and
//! handed in as a trait object; handlers only borrow them.
//!
//! | stage    | issue before          | issue after                         |
//! |----------|-----------------------|-------------------------------------|
//! | ingest   | -                     | -                                   |
//! | classify | -                     | -                                   |
//! | select   | pending / selecting   | selecting (failed if nothing fills) |
//! | enrich   | selecting / decorated | decorated (failed if nothing usable)|
//! | images   | any but failed        | unchanged                           |
//! | compile  | decorated / compiled  | compiled                            |
//! | deliver  | compiled              | sent, or failed on partial delivery |
//! | archive  | sent                  | archived                            |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use metrics::counter;
use tokio::sync::Mutex;

use crate::ai::{DisabledClient, DynImage, DynText, OpenAiProvider};
use crate::classify::{AiEligibilityJudge, Classifier, FlagshipMatcher, SlotRules};
use crate::compile;
use crate::config::ai::AiProviderKind;
use crate::config::{AiConfig, PipelineConfig};
use crate::delivery::{self, DeliveryService};
use crate::enrich::{Enricher, HttpTextFetcher, SourceTextFetcher};
use crate::error::{PipelineError, Result};
use crate::ingest::providers::RssProvider;
use crate::ingest::{self, SourceProvider};
use crate::issue::{issue_id_for, Issue, IssueStatus};
use crate::jobs::{Executor, ExecutorConfig, JobContext, JobRecord, JobSummary, Stage, StageHandler};
use crate::retry::RetryPolicy;
use crate::select::{AiRankingDelegate, CredibilityRanker, RankingDelegate, Selector, SimilarHeadlines};
use crate::source_weights::SourceWeightsConfig;
use crate::store::{HttpRecordStore, MemoryStore, RecordStore, Repository, Stored};

/// Collaborators, already built.
pub struct PipelineParts {
    pub repo: Arc<Repository>,
    pub providers: Vec<Arc<dyn SourceProvider>>,
    pub classifier: Arc<Classifier>,
    pub selector: Arc<Selector>,
    pub enricher: Arc<Enricher>,
    pub delivery: Arc<dyn DeliveryService>,
    pub artifact_dir: PathBuf,
    pub title: String,
    pub delivery_timeout: Duration,
}

pub struct Pipeline {
    parts: PipelineParts,
    /// Ingestion runs never overlap.
    ingest_lock: Mutex<()>,
}

fn ai_clients(cfg: &AiConfig) -> Result<(DynText, DynImage)> {
    Ok(match cfg.provider {
        AiProviderKind::OpenAi => {
            let p = Arc::new(OpenAiProvider::new(cfg)?);
            let text: DynText = p.clone();
            let images: DynImage = p;
            (text, images)
        }
        AiProviderKind::Disabled => {
            let text: DynText = Arc::new(DisabledClient);
            let images: DynImage = Arc::new(DisabledClient);
            (text, images)
        }
    })
}

impl Pipeline {
    pub fn new(parts: PipelineParts) -> Self {
        Self {
            parts,
            ingest_lock: Mutex::new(()),
        }
    }

    /// Build every collaborator from configuration.
    pub fn from_config(cfg: &PipelineConfig) -> Result<Self> {
        let store: Arc<dyn RecordStore> = match &cfg.store {
            Some(sc) => Arc::new(HttpRecordStore::new(sc)?),
            None => {
                tracing::warn!(target: "pipeline", "STORE_URL not set, using the in-process store");
                Arc::new(MemoryStore::new())
            }
        };
        let repo = Arc::new(Repository::new(store, cfg.retry.clone()));

        let providers = cfg
            .feeds
            .iter()
            .map(|f| {
                RssProvider::from_url(&f.name, &f.url, cfg.retry.clone())
                    .map(|p| Arc::new(p) as Arc<dyn SourceProvider>)
                    .map_err(|e| PipelineError::Config(format!("feed {}: {e:#}", f.name)))
            })
            .collect::<Result<Vec<_>>>()?;

        let rules = SlotRules::load_default(cfg.slot_rules_path.as_deref())
            .map_err(|e| PipelineError::Config(format!("slot rules: {e:#}")))?;
        let weights = Arc::new(
            SourceWeightsConfig::load_default(cfg.source_weights_path.as_deref())
                .map_err(|e| PipelineError::Config(format!("source weights: {e:#}")))?,
        );
        let (text, images) = ai_clients(&cfg.ai)?;

        let classifier = Classifier::new(
            Arc::new(AiEligibilityJudge::new(text.clone(), cfg.retry.clone())),
            rules.clone(),
            FlagshipMatcher::new(&cfg.selection.flagship_companies)?,
        );
        // Without a generative provider, rank on source credibility alone.
        let ranker: Arc<dyn RankingDelegate> = match cfg.ai.provider {
            AiProviderKind::OpenAi => Arc::new(AiRankingDelegate::new(text.clone(), cfg.retry.clone(), weights)),
            AiProviderKind::Disabled => Arc::new(CredibilityRanker::new(weights)),
        };
        let selector = Selector::new(
            ranker,
            Arc::new(SimilarHeadlines::default()),
            repo.clone(),
            rules,
            cfg.selection.clone(),
        );
        let fetcher: Arc<dyn SourceTextFetcher> = Arc::new(HttpTextFetcher::new(cfg.retry.call_timeout)?);
        let enricher = Enricher::new(text, images, fetcher, cfg.retry.clone(), cfg.enrich.clone());

        Ok(Self::new(PipelineParts {
            repo,
            providers,
            classifier: Arc::new(classifier),
            selector: Arc::new(selector),
            enricher: Arc::new(enricher),
            delivery: delivery::from_config(&cfg.delivery, cfg.delivery_timeout)?,
            artifact_dir: cfg.artifact_dir.clone(),
            title: cfg.newsletter_title.clone(),
            delivery_timeout: cfg.delivery_timeout,
        }))
    }

    pub fn repo(&self) -> &Arc<Repository> {
        &self.parts.repo
    }

    /// Executor with one handler per stage and job records persisted to the
    /// store.
    pub fn executor(self: &Arc<Self>, config: ExecutorConfig) -> Executor {
        let mut exec = Executor::new(config).with_sink(self.parts.repo.clone());
        for stage in Stage::ALL {
            exec = exec.register(
                stage,
                Arc::new(StageJob {
                    pipeline: self.clone(),
                    stage,
                }),
            );
        }
        exec
    }

    // ---- issue bookkeeping ----

    /// Issue the job targets: explicit id, else date, else today (UTC).
    fn target(job: &JobRecord) -> Result<(String, NaiveDate)> {
        if let Some(id) = job.params.issue_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let date = NaiveDate::parse_from_str(id, "%Y-%m-%d")
                .map_err(|_| PipelineError::InvalidInput(format!("issue id '{id}' is not YYYY-MM-DD")))?;
            return Ok((id.to_string(), date));
        }
        let date = job.params.date.unwrap_or_else(|| Utc::now().date_naive());
        Ok((issue_id_for(date), date))
    }

    async fn load_issue(&self, issue_id: &str) -> Result<Stored<Issue>> {
        self.parts
            .repo
            .issue(issue_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("issue {issue_id}")))
    }

    async fn load_or_create_issue(&self, issue_id: &str, date: NaiveDate) -> Result<Stored<Issue>> {
        match self.parts.repo.issue(issue_id).await? {
            Some(i) => Ok(i),
            None => {
                let issue = Issue::new(date, Utc::now());
                tracing::info!(target: "pipeline", issue_id, "issue created");
                self.parts.repo.create_issue(&issue).await
            }
        }
    }

    async fn advance(&self, issue: &mut Stored<Issue>, to: IssueStatus, reason: Option<String>) -> Result<()> {
        issue.value.transition(to, reason, Utc::now())?;
        self.parts.repo.save_issue(issue).await?;
        counter!("issue_transitions_total", "to" => to.as_str()).increment(1);
        Ok(())
    }

    async fn fail_issue(&self, issue: &mut Stored<Issue>, reason: &str) -> Result<()> {
        issue.value.fail(reason, Utc::now())?;
        self.parts.repo.save_issue(issue).await?;
        counter!("issue_transitions_total", "to" => "failed").increment(1);
        Ok(())
    }

    /// Reopen a failed issue when asked to; otherwise a failed issue stays put.
    async fn reopen_if_asked(&self, issue: &mut Stored<Issue>, restart: bool) -> Result<()> {
        if issue.value.status != IssueStatus::Failed {
            return Ok(());
        }
        if !restart {
            return Err(PipelineError::InvalidTransition {
                from: issue.value.status.to_string(),
                to: "restart required".into(),
            });
        }
        issue.value.restart(Utc::now())?;
        self.parts.repo.save_issue(issue).await?;
        counter!("issue_transitions_total", "to" => "pending").increment(1);
        Ok(())
    }

    fn expect_status(issue: &Stored<Issue>, allowed: &[IssueStatus], stage: Stage) -> Result<()> {
        if allowed.contains(&issue.value.status) {
            return Ok(());
        }
        Err(PipelineError::InvalidTransition {
            from: issue.value.status.to_string(),
            to: format!("{stage} stage"),
        })
    }

    // ---- stages ----

    pub async fn ingest(&self, ctx: &JobContext) -> Result<JobSummary> {
        let _guard = self.ingest_lock.lock().await;
        ctx.checkpoint()?;
        let stats = ingest::run_once(&self.parts.providers, &self.parts.repo, Utc::now()).await?;
        Ok(stats.to_summary())
    }

    pub async fn classify(&self, ctx: &JobContext) -> Result<JobSummary> {
        self.parts.classifier.run(&self.parts.repo, Utc::now(), ctx).await
    }

    pub async fn select(&self, job: &JobRecord, ctx: &JobContext) -> Result<JobSummary> {
        let (issue_id, date) = Self::target(job)?;
        let mut issue = self.load_or_create_issue(&issue_id, date).await?;
        self.reopen_if_asked(&mut issue, job.params.restart).await?;
        // A decorated issue may rerun selection to fill slots a failed run left open.
        Self::expect_status(
            &issue,
            &[IssueStatus::Pending, IssueStatus::Selecting, IssueStatus::Decorated],
            Stage::Select,
        )?;
        if issue.value.status == IssueStatus::Pending {
            self.advance(&mut issue, IssueStatus::Selecting, None).await?;
        }

        let report = self
            .parts
            .selector
            .run(&self.parts.repo, &issue_id, ctx, Utc::now())
            .await?;
        let mut summary = report.summary.clone();
        summary.set("selected", report.selected().len() as u64);
        if report.selected().is_empty() {
            self.fail_issue(&mut issue, "no slot could be filled").await?;
        } else if issue.value.status == IssueStatus::Selecting {
            // Every slot has been attempted.
            self.advance(&mut issue, IssueStatus::Decorated, None).await?;
        }
        Ok(summary)
    }

    pub async fn enrich(&self, job: &JobRecord, ctx: &JobContext) -> Result<JobSummary> {
        let (issue_id, _) = Self::target(job)?;
        let mut issue = self.load_issue(&issue_id).await?;
        Self::expect_status(&issue, &[IssueStatus::Decorated, IssueStatus::Compiled], Stage::Enrich)?;

        let summary = self.parts.enricher.run(&self.parts.repo, &issue_id, ctx).await?;
        let stories = self.parts.repo.stories(&issue_id).await?;
        let usable = stories
            .iter()
            .filter(|s| !compile::publishable(std::slice::from_ref(&s.value)).is_empty())
            .count();

        if issue.value.status == IssueStatus::Decorated {
            if usable == 0 {
                self.fail_issue(&mut issue, "no publishable stories").await?;
            } else {
                self.advance(&mut issue, IssueStatus::Compiled, None).await?;
            }
        }
        Ok(summary)
    }

    pub async fn images(&self, job: &JobRecord, ctx: &JobContext) -> Result<JobSummary> {
        let (issue_id, _) = Self::target(job)?;
        let issue = self.load_issue(&issue_id).await?;
        Self::expect_status(
            &issue,
            &[
                IssueStatus::Decorated,
                IssueStatus::Compiled,
                IssueStatus::Sent,
                IssueStatus::Archived,
            ],
            Stage::Images,
        )?;
        self.parts.enricher.run_images(&self.parts.repo, &issue_id, ctx).await
    }

    /// Writes the artifact `deliver` sends. The issue is already `compiled`
    /// once enrichment completes; this stage does not move it.
    pub async fn compile(&self, job: &JobRecord, ctx: &JobContext) -> Result<JobSummary> {
        let (issue_id, _) = Self::target(job)?;
        let mut issue = self.load_issue(&issue_id).await?;
        Self::expect_status(&issue, &[IssueStatus::Compiled], Stage::Compile)?;

        let stories: Vec<_> = self
            .parts
            .repo
            .stories(&issue_id)
            .await?
            .into_iter()
            .map(|s| s.value)
            .collect();
        let artifact = match compile::compile(&issue_id, issue.value.date, &self.parts.title, &stories) {
            Ok(a) => a,
            Err(e) => {
                self.fail_issue(&mut issue, &format!("compile: {e}")).await?;
                return Err(e);
            }
        };
        ctx.checkpoint()?;
        let path = compile::save(&self.parts.artifact_dir, &artifact).await?;
        tracing::info!(target: "pipeline", issue_id, path = %path.display(), stories = artifact.stories, "artifact written");

        let mut summary = JobSummary::new();
        summary.set("stories", artifact.stories as u64);
        summary.set("skipped_stories", (stories.len() - artifact.stories) as u64);
        Ok(summary)
    }

    pub async fn deliver(&self, job: &JobRecord, ctx: &JobContext) -> Result<JobSummary> {
        let (issue_id, _) = Self::target(job)?;
        let mut issue = self.load_issue(&issue_id).await?;
        Self::expect_status(&issue, &[IssueStatus::Compiled], Stage::Deliver)?;
        let artifact = compile::load(&self.parts.artifact_dir, &issue_id).await?;
        ctx.checkpoint()?;

        // Sends are not idempotent: one attempt, bounded by its own timeout.
        let retry = RetryPolicy::once(self.parts.delivery_timeout);
        let receipt = retry
            .run("delivery.send", || self.parts.delivery.send(&artifact))
            .await?;

        let mut summary = JobSummary::new();
        summary.set("delivered", receipt.delivered);
        summary.set("failed", receipt.failed);
        if receipt.is_complete() {
            self.advance(&mut issue, IssueStatus::Sent, None).await?;
            return Ok(summary);
        }

        let reason = format!(
            "partial delivery: {} delivered, {} failed",
            receipt.delivered, receipt.failed
        );
        tracing::error!(target: "delivery", issue_id, delivered = receipt.delivered, failed = receipt.failed, "issue not sent");
        self.fail_issue(&mut issue, &reason).await?;
        Err(PipelineError::Fatal(reason))
    }

    pub async fn archive(&self, job: &JobRecord) -> Result<JobSummary> {
        let (issue_id, _) = Self::target(job)?;
        let mut issue = self.load_issue(&issue_id).await?;
        self.advance(&mut issue, IssueStatus::Archived, None).await?;
        Ok(JobSummary::new())
    }

    pub async fn run_stage(&self, stage: Stage, job: &JobRecord, ctx: &JobContext) -> Result<JobSummary> {
        match stage {
            Stage::Ingest => self.ingest(ctx).await,
            Stage::Classify => self.classify(ctx).await,
            Stage::Select => self.select(job, ctx).await,
            Stage::Enrich => self.enrich(job, ctx).await,
            Stage::Images => self.images(job, ctx).await,
            Stage::Compile => self.compile(job, ctx).await,
            Stage::Deliver => self.deliver(job, ctx).await,
            Stage::Archive => self.archive(job).await,
        }
    }
}

/// Binds one stage of a shared [`Pipeline`] to the executor.
struct StageJob {
    pipeline: Arc<Pipeline>,
    stage: Stage,
}

#[async_trait]
impl StageHandler for StageJob {
    async fn run(&self, job: &JobRecord, ctx: &JobContext) -> Result<JobSummary> {
        self.pipeline.run_stage(self.stage, job, ctx).await
    }
}

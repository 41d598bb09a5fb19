//! Per-invocation workflow engine.
//!
//! Each invocation drives at most one feature one step further through
//! `ready → in_progress → review → done/blocked`, with a fix/re-review cycle
//! while the reviewer requests changes. The invocation is bounded by the run
//! deadline, so every stage persists its resumption anchor before and after
//! polling: a later run continues an in-flight session instead of creating a
//! second one, and never regresses a feature's observed status.
//!
//! Ordering within one invocation: backlog reads happen before any mutation,
//! and every mutation is persisted (and published) before the next stage
//! begins.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{info, warn};

use crate::backlog::{BacklogStore, ReconcileMode};
use crate::config::{require, Config, StatusMode};
use crate::error::OrchestratorError;
use crate::github::{CodeHost, GithubClient};
use crate::intake;
use crate::model::{
    Feature, FeaturePatch, FeatureStatus, ReviewPayload, StageAnchor, StoryStatus, Verdict,
};
use crate::poller::{self, Poll};
use crate::prompts;
use crate::session::{session_name_from, SessionClient, SessionService, SessionSpec};
use crate::status;
use crate::vcs::{GitVcs, Vcs};

/// The external collaborators the engine drives. Role slots are populated
/// only when their credential is configured; a stage that needs a missing
/// slot fails fast with a config error.
pub struct Collaborators {
    pub architect: Option<Arc<dyn SessionService>>,
    pub developer: Option<Arc<dyn SessionService>>,
    pub reviewer: Option<Arc<dyn SessionService>>,
    pub host: Option<Arc<dyn CodeHost>>,
    pub vcs: Arc<dyn Vcs>,
}

impl Collaborators {
    pub fn from_config(cfg: &Config, root: &std::path::Path) -> Self {
        let session = |key: &Option<String>| -> Option<Arc<dyn SessionService>> {
            key.as_ref()
                .map(|key| Arc::new(SessionClient::new(key, &cfg.api_base)) as _)
        };
        let host: Option<Arc<dyn CodeHost>> = cfg
            .github_token
            .as_ref()
            .map(|token| Arc::new(GithubClient::new(token, &cfg.github_api_url)) as _);
        Self {
            architect: session(&cfg.key_arch),
            developer: session(&cfg.key_dev),
            reviewer: session(&cfg.key_review),
            host,
            vcs: Arc::new(GitVcs::new(root)),
        }
    }

    fn role<'a>(
        slot: &'a Option<Arc<dyn SessionService>>,
        key: &'static str,
    ) -> Result<&'a dyn SessionService> {
        slot.as_deref()
            .ok_or_else(|| OrchestratorError::MissingConfig(key).into())
    }

    fn architect(&self) -> Result<&dyn SessionService> {
        Self::role(&self.architect, "AGENT_KEY_ARCH")
    }

    fn developer(&self) -> Result<&dyn SessionService> {
        Self::role(&self.developer, "AGENT_KEY_DEV")
    }

    fn reviewer(&self) -> Result<&dyn SessionService> {
        Self::role(&self.reviewer, "AGENT_KEY_REVIEW")
    }
}

pub struct Engine<'a> {
    cfg: &'a Config,
    store: BacklogStore,
    collab: &'a Collaborators,
}

impl<'a> Engine<'a> {
    pub fn new(cfg: &'a Config, store: BacklogStore, collab: &'a Collaborators) -> Self {
        Self { cfg, store, collab }
    }

    pub fn store(&self) -> &BacklogStore {
        &self.store
    }

    /// Run one invocation to its clean exit. `Ok(())` covers no-op runs and
    /// deferred-for-resumption runs alike; errors are fatal.
    pub async fn run(&mut self) -> Result<()> {
        let (trigger, mode) = self.resolve_trigger()?;
        if let Some(product_prompt) = trigger {
            if self.cfg.dry_run {
                info!("dry run: skipping architecture stage");
            } else if !self.run_architecture(&product_prompt, mode).await? {
                // backlog payload still pending; retried by the next run
                return Ok(());
            }
        }

        let Some(feature_id) = self.select_feature() else {
            info!("no ready features");
            self.persist(None, "No ready features", "status: no ready features")?;
            return Ok(());
        };
        info!(feature = %feature_id, "processing feature");

        if self.cfg.dry_run {
            info!(feature = %feature_id, "dry run: stopping before development/review stages");
            return Ok(());
        }

        let feature = self
            .store
            .feature(&feature_id)
            .cloned()
            .ok_or_else(|| anyhow!("selected feature {feature_id} not found"))?;

        // Resumption shortcut: review already passed, merge never completed.
        if let (Some(Verdict::Pass), Some(pr_url)) = (&feature.review_verdict, &feature.pr_url) {
            let pr_url = pr_url.clone();
            return self.handle_merge(&feature_id, &pr_url).await;
        }

        // Resume an in-flight fix session before creating anything new.
        if matches!(feature.review_verdict, Some(Verdict::NeedsChanges)) {
            if let StageAnchor::Pending { session, .. } = &feature.fix {
                let session = session.clone();
                if !self.resume_fix(&feature_id, &session).await? {
                    return Ok(());
                }
                let pr_url = feature
                    .pr_url
                    .clone()
                    .ok_or_else(|| anyhow!("feature {feature_id} has a fix session but no PR"))?;
                return self.run_review_cycle(&feature_id, &pr_url, true).await;
            }
        }

        // Mark the feature started before the first remote call so a crash
        // from here on is visibly resumable.
        if feature.status != FeatureStatus::Review {
            self.store
                .update_feature_status(&feature_id, FeatureStatus::InProgress);
            self.persist(
                Some(&feature_id),
                "Feature in progress",
                &format!("backlog: start feature {feature_id}"),
            )?;
        }

        let pr_url = match feature.pr_url.clone() {
            Some(url) => url,
            None => match self.run_development(&feature).await? {
                Some(url) => url,
                None => return Ok(()),
            },
        };

        self.run_review_cycle(&feature_id, &pr_url, false).await
    }

    /// Architecture trigger: explicit prompt, else the inbound event.
    fn resolve_trigger(&self) -> Result<(Option<String>, ReconcileMode)> {
        let mut mode = self.cfg.reconcile_mode;
        if let Some(prompt) = &self.cfg.product_prompt {
            return Ok((Some(prompt.clone()), mode));
        }
        if let Some(event_path) = &self.cfg.event_path {
            if let Some(trigger) = intake::prompt_from_event(event_path)? {
                if let Some(event_mode) = trigger.mode {
                    mode = event_mode;
                }
                return Ok((Some(trigger.prompt), mode));
            }
        }
        Ok((None, mode))
    }

    /// Returns `false` when the backlog payload was still pending at the
    /// deadline; the run exits without touching the later stages.
    async fn run_architecture(&mut self, product_prompt: &str, mode: ReconcileMode) -> Result<bool> {
        let svc = self.collab.architect()?;
        let source = require(&self.cfg.source, "AGENT_SOURCE")?;
        let prompt = prompts::architect_prompt(product_prompt, mode, &self.store.snapshot());

        let resp = svc
            .create_session(SessionSpec {
                prompt: &prompt,
                source,
                title: Some("Backlog architecture".into()),
                starting_branch: Some(&self.cfg.starting_branch),
                automation_mode: None,
                require_plan_approval: self.cfg.require_plan_approval,
            })
            .await?;
        let session = session_name_from(&resp)?;
        info!(%session, "architecture session created");
        if self.cfg.require_plan_approval {
            svc.approve_plan(&session).await?;
        }

        match poller::poll_for_backlog(svc, self.cfg, &session).await? {
            Poll::Found(payload) => {
                self.store.reconcile(payload, mode);
                for problem in self.store.dangling_references() {
                    warn!(%problem, "backlog reference check");
                }
                self.persist(
                    None,
                    &format!("Backlog updated ({mode})"),
                    "backlog: update from architecture stage",
                )?;
                Ok(true)
            }
            Poll::Pending(pending) => {
                info!(reason = ?pending.reason, "backlog payload not found yet, deferring");
                self.persist(None, "Backlog generation pending", "status: backlog pending")?;
                Ok(false)
            }
        }
    }

    /// Resumable work takes priority over starting new work: a feature in
    /// review with a PR first, then an in-progress feature with a live
    /// development anchor, then the first ready feature.
    fn select_feature(&self) -> Option<String> {
        self.store
            .next_review_feature()
            .or_else(|| self.store.next_resumable_feature())
            .or_else(|| self.store.next_ready_feature())
            .map(|f| f.id.clone())
    }

    /// Development stage: resume the anchored session or create one, then
    /// poll for a PR URL. Returns `None` when the PR is still pending.
    async fn run_development(&mut self, feature: &Feature) -> Result<Option<String>> {
        let svc = self.collab.developer()?;
        let session = match feature.build.pending_session() {
            Some(session) => {
                info!(%session, feature = %feature.id, "resuming development session");
                session.to_string()
            }
            None => {
                let source = require(&self.cfg.source, "AGENT_SOURCE")?;
                let stories = self.store.stories_for_feature(&feature.id);
                let story_ids: Vec<&str> = stories.iter().map(|s| s.id.as_str()).collect();
                let acceptance = self.store.acceptance_for_stories(&story_ids);
                let prompt = prompts::developer_prompt(feature, &stories, &acceptance);

                let resp = svc
                    .create_session(SessionSpec {
                        prompt: &prompt,
                        source,
                        title: Some(format!("Develop {}", feature.id)),
                        starting_branch: Some(&self.cfg.starting_branch),
                        automation_mode: Some("AUTO_CREATE_PR"),
                        require_plan_approval: self.cfg.require_plan_approval,
                    })
                    .await?;
                let session = session_name_from(&resp)?;
                info!(%session, feature = %feature.id, "development session created");
                if self.cfg.require_plan_approval {
                    svc.approve_plan(&session).await?;
                }

                // Persist the anchor before polling: a restart must resume
                // this session, never create a second one.
                self.store.update_feature_fields(
                    &feature.id,
                    FeaturePatch {
                        build: Some(StageAnchor::Pending {
                            session: session.clone(),
                            last_state: None,
                        }),
                        ..Default::default()
                    },
                );
                self.persist(
                    Some(&feature.id),
                    "Development session started",
                    &format!("backlog: development session for {}", feature.id),
                )?;
                session
            }
        };

        let host = self.collab.host.as_deref();
        match poller::poll_for_pr(svc, host, self.cfg, &session, &feature.id).await? {
            Poll::Found(pr_url) => {
                info!(%pr_url, feature = %feature.id, "PR found");
                self.store.update_feature_fields(
                    &feature.id,
                    FeaturePatch {
                        status: Some(FeatureStatus::Review),
                        pr_url: Some(pr_url.clone()),
                        build: Some(StageAnchor::Done { session }),
                        ..Default::default()
                    },
                );
                self.persist(
                    Some(&feature.id),
                    "Feature in review",
                    &format!("backlog: review feature {}", feature.id),
                )?;
                Ok(Some(pr_url))
            }
            Poll::Pending(pending) => {
                info!(reason = ?pending.reason, feature = %feature.id, "no PR yet, deferring");
                self.store.update_feature_fields(
                    &feature.id,
                    FeaturePatch {
                        build: Some(StageAnchor::Pending {
                            session,
                            last_state: pending.last_state,
                        }),
                        ..Default::default()
                    },
                );
                self.persist(
                    Some(&feature.id),
                    "Development still running",
                    &format!("backlog: development pending {}", feature.id),
                )?;
                Ok(None)
            }
        }
    }

    /// Review stage with at most one fix + re-review per invocation.
    async fn run_review_cycle(
        &mut self,
        feature_id: &str,
        pr_url: &str,
        mut fixed: bool,
    ) -> Result<()> {
        let head_ref = match self.collab.host.as_deref() {
            Some(host) => host.pr_info(pr_url).await?.head_ref,
            None => None,
        };

        loop {
            let review = match self
                .run_review_once(feature_id, pr_url, head_ref.as_deref())
                .await?
            {
                Some(review) => review,
                None => {
                    self.store.update_feature_fields(
                        feature_id,
                        FeaturePatch {
                            review_verdict: Some(Verdict::Pending),
                            ..Default::default()
                        },
                    );
                    self.persist(
                        Some(feature_id),
                        "Review pending (no verdict)",
                        &format!("backlog: review pending {feature_id}"),
                    )?;
                    return Ok(());
                }
            };

            let verdict = review.verdict.clone();
            info!(%verdict, feature = %feature_id, "review verdict");
            self.store.update_feature_fields(
                feature_id,
                FeaturePatch {
                    review_verdict: Some(verdict.clone()),
                    ..Default::default()
                },
            );

            match verdict {
                Verdict::Pass => return self.handle_merge(feature_id, pr_url).await,
                Verdict::NeedsChanges if !fixed => {
                    fixed = true;
                    if !self
                        .run_fix(feature_id, pr_url, &review, head_ref.as_deref())
                        .await?
                    {
                        return Ok(());
                    }
                    // fix session finished: re-review once, then fall through
                }
                other => {
                    self.persist(
                        Some(feature_id),
                        "Review did not pass; manual follow-up required",
                        &format!("backlog: review verdict {other} for {feature_id}"),
                    )?;
                    return Ok(());
                }
            }
        }
    }

    /// One review session scoped to the PR branch. `None` means no verdict
    /// before the deadline.
    async fn run_review_once(
        &mut self,
        feature_id: &str,
        pr_url: &str,
        head_ref: Option<&str>,
    ) -> Result<Option<ReviewPayload>> {
        let svc = self.collab.reviewer()?;
        let source = require(&self.cfg.source, "AGENT_SOURCE")?;
        let feature = self
            .store
            .feature(feature_id)
            .cloned()
            .ok_or_else(|| anyhow!("feature {feature_id} not found"))?;
        let stories = self.store.stories_for_feature(feature_id);
        let story_ids: Vec<&str> = stories.iter().map(|s| s.id.as_str()).collect();
        let acceptance = self.store.acceptance_for_stories(&story_ids);
        let prompt = prompts::reviewer_prompt(pr_url, &feature, &stories, &acceptance);

        let resp = svc
            .create_session(SessionSpec {
                prompt: &prompt,
                source,
                title: Some(format!("Review {feature_id}")),
                starting_branch: Some(head_ref.unwrap_or(&self.cfg.starting_branch)),
                automation_mode: None,
                require_plan_approval: self.cfg.require_plan_approval,
            })
            .await?;
        let session = session_name_from(&resp)?;
        info!(%session, feature = %feature_id, "review session created");
        if self.cfg.require_plan_approval {
            svc.approve_plan(&session).await?;
        }

        match poller::poll_for_review(svc, self.cfg, &session).await? {
            Poll::Found(review) => Ok(Some(review)),
            Poll::Pending(pending) => {
                info!(reason = ?pending.reason, feature = %feature_id, "no verdict yet");
                Ok(None)
            }
        }
    }

    /// Create a fix session for the reviewer's findings. Returns `true` when
    /// the session completed within this invocation.
    async fn run_fix(
        &mut self,
        feature_id: &str,
        pr_url: &str,
        review: &ReviewPayload,
        head_ref: Option<&str>,
    ) -> Result<bool> {
        let svc = self.collab.developer()?;
        let source = require(&self.cfg.source, "AGENT_SOURCE")?;
        let prompt = prompts::fix_prompt(pr_url, review);

        let resp = svc
            .create_session(SessionSpec {
                prompt: &prompt,
                source,
                title: Some(format!("Fix {feature_id}")),
                starting_branch: Some(head_ref.unwrap_or(&self.cfg.starting_branch)),
                automation_mode: None,
                require_plan_approval: self.cfg.require_plan_approval,
            })
            .await?;
        let session = session_name_from(&resp)?;
        info!(%session, feature = %feature_id, "fix session created");
        if self.cfg.require_plan_approval {
            svc.approve_plan(&session).await?;
        }

        self.store.update_feature_fields(
            feature_id,
            FeaturePatch {
                fix: Some(StageAnchor::Pending {
                    session: session.clone(),
                    last_state: None,
                }),
                ..Default::default()
            },
        );
        self.persist(
            Some(feature_id),
            "Fix session started",
            &format!("backlog: fix session for {feature_id}"),
        )?;

        self.await_fix_completion(feature_id, &session).await
    }

    /// Resume a persisted fix session. Returns `true` once it completed.
    async fn resume_fix(&mut self, feature_id: &str, session: &str) -> Result<bool> {
        info!(%session, feature = %feature_id, "resuming fix session");
        self.await_fix_completion(feature_id, session).await
    }

    async fn await_fix_completion(&mut self, feature_id: &str, session: &str) -> Result<bool> {
        let svc = self.collab.developer()?;
        match poller::poll_session_completion(svc, self.cfg, session).await? {
            Poll::Found(_) => {
                self.store.update_feature_fields(
                    feature_id,
                    FeaturePatch {
                        fix: Some(StageAnchor::Done {
                            session: session.to_string(),
                        }),
                        ..Default::default()
                    },
                );
                Ok(true)
            }
            Poll::Pending(pending) => {
                info!(reason = ?pending.reason, feature = %feature_id, "fix still running, deferring");
                self.store.update_feature_fields(
                    feature_id,
                    FeaturePatch {
                        fix: Some(StageAnchor::Pending {
                            session: session.to_string(),
                            last_state: pending.last_state,
                        }),
                        ..Default::default()
                    },
                );
                self.persist(
                    Some(feature_id),
                    "Fix session still running",
                    &format!("backlog: fix pending {feature_id}"),
                )?;
                Ok(false)
            }
        }
    }

    /// Merge handling after a PASS verdict.
    async fn handle_merge(&mut self, feature_id: &str, pr_url: &str) -> Result<()> {
        // record the verdict even when arriving via the resumption shortcut
        self.store.update_feature_fields(
            feature_id,
            FeaturePatch {
                review_verdict: Some(Verdict::Pass),
                ..Default::default()
            },
        );

        let Some(host) = self.collab.host.as_deref() else {
            self.store.update_feature_fields(
                feature_id,
                FeaturePatch {
                    merge_status: Some(
                        "Review passed; no code-host credential available, manual merge required"
                            .into(),
                    ),
                    ..Default::default()
                },
            );
            self.persist(
                Some(feature_id),
                "Review passed; awaiting manual merge",
                &format!("backlog: awaiting manual merge {feature_id}"),
            )?;
            return Ok(());
        };

        if host.is_merged(pr_url).await? {
            return self.complete_feature(feature_id);
        }

        if self.cfg.auto_merge {
            let outcome = host.merge_pr(pr_url, self.cfg.merge_method).await?;
            if outcome.merged || outcome.message.to_ascii_lowercase().contains("already merged") {
                return self.complete_feature(feature_id);
            }
            warn!(feature = %feature_id, message = %outcome.message, "merge failed");
            self.store.update_feature_fields(
                feature_id,
                FeaturePatch {
                    merge_status: Some(format!("Merge failed: {}", outcome.message)),
                    ..Default::default()
                },
            );
            self.persist(
                Some(feature_id),
                "Merge failed; manual intervention required",
                &format!("backlog: merge failed {feature_id}"),
            )?;
            return Ok(());
        }

        self.store.update_feature_fields(
            feature_id,
            FeaturePatch {
                merge_status: Some("Review passed; manual merge required".into()),
                ..Default::default()
            },
        );
        self.persist(
            Some(feature_id),
            "Review passed; awaiting manual merge",
            &format!("backlog: awaiting manual merge {feature_id}"),
        )?;
        Ok(())
    }

    /// The PR is merged: close out the feature and its stories.
    fn complete_feature(&mut self, feature_id: &str) -> Result<()> {
        self.store.update_feature_fields(
            feature_id,
            FeaturePatch {
                status: Some(FeatureStatus::Done),
                merge_status: Some("merged".into()),
                ..Default::default()
            },
        );
        self.store.update_story_status(feature_id, StoryStatus::Done);
        self.persist(
            Some(feature_id),
            "Feature done",
            &format!("backlog: complete feature {feature_id}"),
        )?;
        info!(feature = %feature_id, "feature complete");
        Ok(())
    }

    /// Persist the backlog and status snapshot, then publish. Runs after
    /// every mutation so the next invocation observes a consistent view.
    fn persist(&self, current_feature: Option<&str>, note: &str, commit_msg: &str) -> Result<()> {
        self.store.save_all()?;
        status::write_status(self.store.root(), &self.store, current_feature, note)?;

        let mut paths: Vec<&str> = BacklogStore::paths().to_vec();
        if self.cfg.status_mode == StatusMode::Commit {
            paths.extend(status::status_paths());
        }
        let committed = self.collab.vcs.commit_and_push(&paths, commit_msg)?;
        if !committed {
            tracing::debug!(commit_msg, "no backlog changes to publish");
        }
        Ok(())
    }
}

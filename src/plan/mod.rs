//! Plan-mode state machine (spec §4.5). Per-chat FSM driving intake →
//! clarification → ready → execution, with bounded clarification rounds and
//! a soft-reset execution session. Grounded in the teacher's `engine::plan`
//! `Plan`/`PlanStatus` merge-vs-replace machinery (`handle_update_plan_action`
//! in the teacher's `engine/plan.rs`), extended from its 4-state lifecycle
//! into this spec's 8-state FSM — the teacher has no clarify-round counter or
//! forced-generation trigger, that part is new code in the same idiom.

use crate::errors::{GatewayError, GatewayResult};
use crate::state::chats::{Chat, MessageRole};
use crate::state::plan::{PlanModeState, PlanSpec, PlanTask, DEFAULT_CLARIFY_MAX_COUNT};
use crate::state::Dependencies;
use chrono::Utc;

#[derive(Debug, Clone, Default)]
pub struct CompileRequest {
    pub goal: String,
    pub scope_in: Vec<String>,
    pub scope_out: Vec<String>,
    pub constraints: Vec<String>,
    pub tasks: Vec<PlanTask>,
    pub acceptance_criteria: Vec<String>,
    pub risks: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CompileOutcome {
    pub state: PlanModeState,
    pub pending_questions: Vec<String>,
    pub plan_spec: PlanSpec,
}

/// `POST /agent/plan/toggle`. Enabling moves `off → planning_intake`;
/// disabling requires `confirm=true` (spec §4.5) and resets all ephemeral
/// plan-mode fields back to a clean slate.
pub async fn toggle(deps: &Dependencies, chat_id: &str, enabled: bool, confirm: bool) -> GatewayResult<PlanModeState> {
    if !enabled && !confirm {
        return Err(GatewayError::PlanToggleConfirmationRequired);
    }

    deps.chats
        .write(|agg| {
            let chat = agg
                .chats
                .get_mut(chat_id)
                .ok_or_else(|| anyhow::anyhow!("chat not found"))?;
            if enabled {
                chat.set_plan_mode_state(PlanModeState::PlanningIntake);
            } else {
                chat.set_plan_mode_state(PlanModeState::Off);
            }
            chat.set_clarify_asked_count(0);
            chat.set_plan_pending_questions(Vec::new());
            Ok(())
        })
        .await
        .map_err(GatewayError::Internal)?;

    deps.chats
        .read(|agg| agg.chats.get(chat_id).map(|c| c.plan_mode_state()))
        .await
        .ok_or_else(|| GatewayError::ChatNotFound(chat_id.to_string()))
}

fn missing_fields(req: &CompileRequest) -> Vec<String> {
    let mut questions = Vec::new();
    if req.tasks.is_empty() {
        questions.push("What concrete tasks make up this plan?".to_string());
    }
    if req.acceptance_criteria.is_empty() {
        questions.push("How will we know this plan is complete (acceptance criteria)?".to_string());
    }
    questions
}

/// `POST /agent/plan/compile`. Builds a draft [`PlanSpec`] from the request;
/// an incomplete draft (no tasks, no acceptance criteria) moves the chat into
/// `planning_clarify` with the unresolved questions recorded; a complete one
/// moves straight to `planning_ready`.
pub async fn compile(deps: &Dependencies, chat_id: &str, req: CompileRequest) -> GatewayResult<CompileOutcome> {
    if req.goal.trim().is_empty() {
        return Err(GatewayError::InvalidPlanSpec("goal must not be empty".to_string()));
    }

    let mut spec = PlanSpec {
        goal: req.goal.clone(),
        scope_in: req.scope_in.clone(),
        scope_out: req.scope_out.clone(),
        constraints: req.constraints.clone(),
        tasks: req.tasks.clone(),
        acceptance_criteria: req.acceptance_criteria.clone(),
        risks: req.risks.clone(),
        updated_at: Some(Utc::now()),
        ..PlanSpec::default()
    };

    let questions = missing_fields(&req);
    let next_state = if questions.is_empty() {
        spec.validate()?;
        PlanModeState::PlanningReady
    } else {
        PlanModeState::PlanningClarify
    };

    deps.chats
        .write(|agg| {
            let chat = agg
                .chats
                .get_mut(chat_id)
                .ok_or_else(|| anyhow::anyhow!("chat not found"))?;
            spec.revision = chat.plan_spec().map(|s| s.revision).unwrap_or(0);
            chat.set_plan_spec(spec.clone());
            chat.set_plan_mode_state(next_state);
            chat.set_clarify_asked_count(0);
            chat.set_plan_pending_questions(questions.clone());
            Ok(())
        })
        .await
        .map_err(GatewayError::Internal)?;

    Ok(CompileOutcome {
        state: next_state,
        pending_questions: questions,
        plan_spec: spec,
    })
}

#[derive(Debug, Clone)]
pub struct ClarifyOutcome {
    pub state: PlanModeState,
    pub pending_questions: Vec<String>,
    pub clarify_asked_count: u32,
    pub plan_spec: PlanSpec,
}

/// `POST /agent/plan/clarify/answer`. `answers` is aligned positionally with
/// the chat's current `plan_pending_questions`; an empty/blank answer leaves
/// that question unresolved. Forces `planning_ready` once
/// `clarify_asked_count == clarify_max_count` (spec §3/§8 scenario 9),
/// recording an assumption for every question that was never answered.
pub async fn clarify_answer(deps: &Dependencies, chat_id: &str, answers: Vec<String>) -> GatewayResult<ClarifyOutcome> {
    deps.chats
        .write(|agg| {
            let chat = agg
                .chats
                .get_mut(chat_id)
                .ok_or_else(|| anyhow::anyhow!("chat not found"))?;
            if chat.plan_mode_state() != PlanModeState::PlanningClarify {
                return Ok(Err(GatewayError::PlanNotInClarify));
            }

            let mut spec = chat.plan_spec().unwrap_or_default();
            let pending = chat.plan_pending_questions();
            let mut unresolved = Vec::new();
            for (idx, question) in pending.iter().enumerate() {
                let answered = answers.get(idx).map(|a| !a.trim().is_empty()).unwrap_or(false);
                if !answered {
                    unresolved.push(question.clone());
                }
            }

            let asked_count = (chat.clarify_asked_count() + 1).min(DEFAULT_CLARIFY_MAX_COUNT);
            let forced = asked_count >= DEFAULT_CLARIFY_MAX_COUNT;

            let next_state = if unresolved.is_empty() {
                if spec.tasks.is_empty() {
                    spec.tasks.push(PlanTask {
                        id: "t1".to_string(),
                        title: "Deliver the stated goal".to_string(),
                        depends_on: Vec::new(),
                        status: crate::state::plan::PlanTaskStatus::Pending,
                        deliverables: Vec::new(),
                        verification: Vec::new(),
                    });
                }
                if spec.acceptance_criteria.is_empty() {
                    spec.acceptance_criteria.push("Goal achieved as stated.".to_string());
                }
                PlanModeState::PlanningReady
            } else if forced {
                for question in &unresolved {
                    spec.assumptions.push(format!("Unanswered after {DEFAULT_CLARIFY_MAX_COUNT} rounds, assumed default for: {question}"));
                }
                if spec.tasks.is_empty() {
                    spec.tasks.push(PlanTask {
                        id: "t1".to_string(),
                        title: "Deliver the stated goal".to_string(),
                        depends_on: Vec::new(),
                        status: crate::state::plan::PlanTaskStatus::Pending,
                        deliverables: Vec::new(),
                        verification: Vec::new(),
                    });
                }
                if spec.acceptance_criteria.is_empty() {
                    spec.acceptance_criteria.push("Goal achieved as stated.".to_string());
                }
                PlanModeState::PlanningReady
            } else {
                PlanModeState::PlanningClarify
            };

            spec.updated_at = Some(Utc::now());
            let pending_questions = if next_state == PlanModeState::PlanningReady { Vec::new() } else { unresolved };

            chat.set_plan_spec(spec.clone());
            chat.set_plan_mode_state(next_state);
            chat.set_clarify_asked_count(asked_count);
            chat.set_plan_pending_questions(pending_questions.clone());

            Ok(Ok(ClarifyOutcome {
                state: next_state,
                pending_questions,
                clarify_asked_count: asked_count,
                plan_spec: spec,
            }))
        })
        .await
        .map_err(GatewayError::Internal)?
}

/// `POST /agent/plan/revise`. Requires non-empty feedback and `planning_ready`
/// state; records the feedback as a new constraint and bumps `revision`
/// (spec leaves the exact mutation of the plan body to "natural-language
/// feedback [that] regenerates the plan" — an LLM-driven step out of scope
/// here per spec §1; see DESIGN.md for this Open Question resolution).
pub async fn revise(deps: &Dependencies, chat_id: &str, feedback: &str) -> GatewayResult<PlanSpec> {
    if feedback.trim().is_empty() {
        return Err(GatewayError::PlanFeedbackRequired);
    }
    deps.chats
        .write(|agg| {
            let chat = agg
                .chats
                .get_mut(chat_id)
                .ok_or_else(|| anyhow::anyhow!("chat not found"))?;
            if chat.plan_mode_state() != PlanModeState::PlanningReady {
                return Ok(Err(GatewayError::PlanNotReady));
            }
            chat.set_plan_mode_state(PlanModeState::PlanningRevising);
            let mut spec = chat.plan_spec().unwrap_or_default();
            spec.constraints.push(format!("revision feedback: {feedback}"));
            spec.revision += 1;
            spec.updated_at = Some(Utc::now());
            chat.set_plan_spec(spec.clone());
            chat.set_plan_mode_state(PlanModeState::PlanningReady);
            Ok(Ok(spec))
        })
        .await
        .map_err(GatewayError::Internal)?
}

#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub execution_session_id: String,
    pub execution_chat_id: String,
}

/// `POST /agent/plan/execute`. Spawns a soft-reset execution session: a fresh
/// chat/session seeded with one user message carrying the serialized plan
/// summary (spec §4.5, §9 glossary "Soft reset"). The source chat's state
/// becomes `executing` with `plan_execution_session_id` pointing at the new
/// session — a value reference, never a true cycle (spec §9).
pub async fn execute(deps: &Dependencies, chat_id: &str) -> GatewayResult<ExecuteOutcome> {
    let (user_id, channel, spec) = deps
        .chats
        .read(|agg| agg.chats.get(chat_id).map(|c| (c.user_id.clone(), c.channel.clone(), c.plan_spec())))
        .await
        .ok_or_else(|| GatewayError::ChatNotFound(chat_id.to_string()))?;
    let spec = spec.ok_or(GatewayError::PlanNotReady)?;

    let execution_session_id = uuid::Uuid::new_v4().to_string();
    let seed_message = format!(
        "Execute the following approved plan.\n\nGoal: {}\n\nTasks:\n{}\n\nAcceptance criteria:\n{}\n\nSummary: {}",
        spec.goal,
        spec.tasks
            .iter()
            .map(|t| format!("- [{:?}] {} ({})", t.status, t.title, t.id))
            .collect::<Vec<_>>()
            .join("\n"),
        spec.acceptance_criteria.iter().map(|c| format!("- {c}")).collect::<Vec<_>>().join("\n"),
        spec.summary_for_execution,
    );

    let execution_chat_id = deps
        .chats
        .write(|agg| {
            let source = agg
                .chats
                .get(chat_id)
                .ok_or_else(|| anyhow::anyhow!("chat not found"))?;
            if source.plan_mode_state() != PlanModeState::PlanningReady {
                return Ok(Err(GatewayError::PlanNotReady));
            }

            let mut new_chat = Chat::new(uuid::Uuid::new_v4().to_string(), execution_session_id.clone(), user_id.clone(), channel.clone());
            new_chat.append(MessageRole::User, seed_message.clone(), None, None);
            let new_chat_id = new_chat.id.clone();
            agg.chats.insert(new_chat_id.clone(), new_chat);

            let source = agg.chats.get_mut(chat_id).expect("checked above");
            source.set_plan_mode_state(PlanModeState::Executing);
            source.set_plan_execution_session_id(execution_session_id.clone());

            Ok(Ok(new_chat_id))
        })
        .await
        .map_err(GatewayError::Internal)??;

    Ok(ExecuteOutcome {
        execution_session_id,
        execution_chat_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::chats::Chat;

    async fn deps_with_chat() -> (std::sync::Arc<Dependencies>, tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let deps = Dependencies::open_temp(dir.path());
        let chat_id = deps
            .chats
            .write(|agg| {
                let chat = Chat::new("c1", "s1", "u1", "console");
                let id = chat.id.clone();
                agg.chats.insert(id.clone(), chat);
                Ok(id)
            })
            .await
            .unwrap();
        (deps, dir, chat_id)
    }

    #[tokio::test]
    async fn toggle_on_moves_to_planning_intake() {
        let (deps, _dir, chat_id) = deps_with_chat().await;
        let state = toggle(&deps, &chat_id, true, false).await.unwrap();
        assert_eq!(state, PlanModeState::PlanningIntake);
    }

    #[tokio::test]
    async fn toggle_off_without_confirm_is_rejected() {
        let (deps, _dir, chat_id) = deps_with_chat().await;
        toggle(&deps, &chat_id, true, false).await.unwrap();
        let err = toggle(&deps, &chat_id, false, false).await.unwrap_err();
        assert!(matches!(err, GatewayError::PlanToggleConfirmationRequired));
        let state = deps
            .chats
            .read(|agg| agg.chats.get(&chat_id).map(|c| c.plan_mode_state()))
            .await
            .unwrap();
        assert_eq!(state, PlanModeState::PlanningIntake, "rejected toggle must not mutate state");
    }

    #[tokio::test]
    async fn compile_with_ambiguous_input_enters_clarify() {
        let (deps, _dir, chat_id) = deps_with_chat().await;
        toggle(&deps, &chat_id, true, false).await.unwrap();
        let outcome = compile(
            &deps,
            &chat_id,
            CompileRequest {
                goal: "ship the feature".to_string(),
                ..CompileRequest::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome.state, PlanModeState::PlanningClarify);
        assert!(!outcome.pending_questions.is_empty());
    }

    #[tokio::test]
    async fn five_empty_clarify_rounds_force_ready_with_assumptions() {
        let (deps, _dir, chat_id) = deps_with_chat().await;
        toggle(&deps, &chat_id, true, false).await.unwrap();
        compile(
            &deps,
            &chat_id,
            CompileRequest {
                goal: "ship the feature".to_string(),
                ..CompileRequest::default()
            },
        )
        .await
        .unwrap();

        let mut last = None;
        for _ in 0..5 {
            last = Some(clarify_answer(&deps, &chat_id, vec![String::new(), String::new()]).await.unwrap());
        }
        let last = last.unwrap();
        assert_eq!(last.state, PlanModeState::PlanningReady);
        assert_eq!(last.clarify_asked_count, 5);
        assert!(!last.plan_spec.assumptions.is_empty());
    }

    #[tokio::test]
    async fn execute_spawns_soft_reset_session() {
        let (deps, _dir, chat_id) = deps_with_chat().await;
        toggle(&deps, &chat_id, true, false).await.unwrap();
        compile(
            &deps,
            &chat_id,
            CompileRequest {
                goal: "ship the feature".to_string(),
                tasks: vec![PlanTask {
                    id: "t1".to_string(),
                    title: "Do it".to_string(),
                    depends_on: vec![],
                    status: crate::state::plan::PlanTaskStatus::Pending,
                    deliverables: vec![],
                    verification: vec![],
                }],
                acceptance_criteria: vec!["It works".to_string()],
                ..CompileRequest::default()
            },
        )
        .await
        .unwrap();

        let outcome = execute(&deps, &chat_id).await.unwrap();
        assert_ne!(outcome.execution_session_id, "s1");

        let seeded_count = deps
            .chats
            .read(|agg| agg.chats.get(&outcome.execution_chat_id).map(|c| c.history.len()))
            .await
            .unwrap();
        assert_eq!(seeded_count, 1);

        let source_state = deps.chats.read(|agg| agg.chats.get(&chat_id).unwrap().plan_mode_state()).await;
        assert_eq!(source_state, PlanModeState::Executing);
    }
}

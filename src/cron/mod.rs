//! Cron scheduler (spec §4.2). Tick-driven: given `now`, selects due jobs and
//! reconciles every job's `next_run_at` in one pass. Grounded in the
//! teacher's `server::idle_scheduler` tick-loop shape (`tokio::time::interval`
//! driving a periodic scan), generalized from a single hardcoded idle check
//! into interval/cron-expression resolution plus per-job concurrency slots.

use crate::errors::{GatewayError, GatewayResult};
use crate::registry::channels::ChannelRegistry;
use crate::registry::node_handlers::{NodeContext, NodeHandlerRegistry};
use crate::state::cron::{CronAggregate, CronJobSpec, LastStatus, ScheduleType, TaskType};
use crate::state::Dependencies;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Per-job in-memory concurrency counters (spec §5: "guarded by a single
/// mutex"). Slots are released in every exit path via [`SlotGuard`]'s `Drop`,
/// including panic unwinding.
pub struct ConcurrencySlots(Mutex<HashMap<String, u32>>);

impl ConcurrencySlots {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(HashMap::new())))
    }

    fn try_acquire(self: &Arc<Self>, job_id: &str, max: u32) -> GatewayResult<SlotGuard> {
        let mut map = self.0.lock().expect("concurrency slot mutex poisoned");
        let count = map.entry(job_id.to_string()).or_insert(0);
        if *count >= max {
            return Err(GatewayError::CronMaxConcurrencyReached(job_id.to_string()));
        }
        *count += 1;
        drop(map);
        Ok(SlotGuard {
            slots: Arc::clone(self),
            job_id: job_id.to_string(),
        })
    }
}

struct SlotGuard {
    slots: Arc<ConcurrencySlots>,
    job_id: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut map = self.slots.0.lock().expect("concurrency slot mutex poisoned");
        if let Some(count) = map.get_mut(&self.job_id) {
            *count = count.saturating_sub(1);
        }
    }
}

const MAX_ADVANCE_STEPS: u32 = 2048;

fn parse_interval_seconds(raw: &str) -> GatewayResult<i64> {
    let trimmed = raw.trim();
    if let Ok(secs) = trimmed.parse::<i64>() {
        return Ok(secs);
    }
    let (number_part, unit) = trimmed.split_at(trimmed.len().saturating_sub(1));
    let value: i64 = number_part
        .parse()
        .map_err(|_| GatewayError::InvalidRequest(format!("invalid interval duration: {raw}")))?;
    match unit {
        "s" => Ok(value),
        "m" => Ok(value * 60),
        "h" => Ok(value * 3600),
        "d" => Ok(value * 86400),
        _ => Err(GatewayError::InvalidRequest(format!("invalid interval duration: {raw}"))),
    }
}

/// Normalizes descriptor shortcuts and variable field counts (5/6/7 fields)
/// into the 7-field `sec min hour dom month dow year` the `cron` crate parses.
fn normalize_cron_expr(raw: &str) -> String {
    let descriptor = match raw.trim() {
        "@yearly" | "@annually" => Some("0 0 0 1 1 * *"),
        "@monthly" => Some("0 0 0 1 * * *"),
        "@weekly" => Some("0 0 0 * * 0 *"),
        "@daily" | "@midnight" => Some("0 0 0 * * * *"),
        "@hourly" => Some("0 0 * * * * *"),
        _ => None,
    };
    if let Some(expanded) = descriptor {
        return expanded.to_string();
    }
    let field_count = raw.split_whitespace().count();
    match field_count {
        5 => format!("0 {raw} *"),
        6 => format!("{raw} *"),
        _ => raw.to_string(),
    }
}

fn resolve_interval(current: Option<DateTime<Utc>>, interval_seconds: i64, now: DateTime<Utc>) -> (bool, DateTime<Utc>, DateTime<Utc>) {
    let interval = ChronoDuration::seconds(interval_seconds.max(1));
    let mut next = current.unwrap_or(now + interval);
    if next > now {
        return (false, next, next);
    }
    let due_at = next;
    let mut steps = 0;
    while next <= now && steps < MAX_ADVANCE_STEPS {
        next += interval;
        steps += 1;
    }
    (true, due_at, next)
}

fn resolve_cron(current: Option<DateTime<Utc>>, schedule: &cron::Schedule, now: DateTime<Utc>) -> (bool, DateTime<Utc>, DateTime<Utc>) {
    let next = current.unwrap_or_else(|| schedule.after(&now).next().unwrap_or(now));
    if next > now {
        return (false, next, next);
    }
    let due_at = next;
    let new_next = schedule.after(&now).next().unwrap_or(due_at);
    (true, due_at, new_next)
}

/// `SchedulerTick(now) → due job ids`. Mutates `agg` in place; the caller is
/// expected to run this inside `deps.cron.write(...)` for atomic persistence
/// (spec §4.2 step 7: "Write state updates in one atomic batch").
pub fn tick(agg: &mut CronAggregate, now: DateTime<Utc>) -> Vec<String> {
    let mut due = Vec::new();
    for (job_id, entry) in agg.jobs.iter_mut() {
        entry.state.normalize();

        if !entry.spec.enabled || entry.state.paused {
            entry.state.next_run_at = None;
            continue;
        }

        let (is_due, due_at, new_next_run_at) = match entry.spec.schedule.kind {
            ScheduleType::Interval => match parse_interval_seconds(&entry.spec.schedule.cron) {
                Ok(secs) => resolve_interval(entry.state.next_run_at, secs, now),
                Err(_) => continue,
            },
            ScheduleType::Cron => {
                let normalized = normalize_cron_expr(&entry.spec.schedule.cron);
                match cron::Schedule::from_str(&normalized) {
                    Ok(schedule) => resolve_cron(entry.state.next_run_at, &schedule, now),
                    Err(_) => continue,
                }
            }
        };

        if !is_due {
            entry.state.next_run_at = Some(new_next_run_at);
            continue;
        }

        let overdue_seconds = (now - due_at).num_seconds().max(0) as u64;
        if entry.spec.runtime.misfire_grace_seconds > 0 && overdue_seconds > entry.spec.runtime.misfire_grace_seconds {
            entry.state.last_status = Some(LastStatus::Failed);
            entry.state.last_error = Some(format!("misfire: job was due at {due_at} ({overdue_seconds}s overdue)"));
            entry.state.next_run_at = Some(new_next_run_at);
            continue;
        }

        entry.state.next_run_at = Some(new_next_run_at);
        due.push(job_id.clone());
    }
    due
}

/// Executes one job attempt end to end (spec §4.2 "Execution"): acquires a
/// concurrency slot, dispatches by `task_type`, and writes the outcome back.
pub async fn execute_job(
    deps: &Dependencies,
    channels: &Arc<ChannelRegistry>,
    node_handlers: &Arc<NodeHandlerRegistry>,
    slots: &Arc<ConcurrencySlots>,
    job_id: &str,
) -> GatewayResult<()> {
    let spec: CronJobSpec = deps
        .cron
        .read(|agg| agg.jobs.get(job_id).map(|e| e.spec.clone()))
        .await
        .ok_or_else(|| GatewayError::CronJobNotFound(job_id.to_string()))?;

    let _slot = match slots.try_acquire(job_id, spec.runtime.max_concurrency) {
        Ok(guard) => guard,
        Err(_) => {
            deps.cron
                .write(|agg| {
                    if let Some(entry) = agg.jobs.get_mut(job_id) {
                        entry.state.last_status = Some(LastStatus::Failed);
                        entry.state.last_error = Some("max concurrency reached, run skipped".to_string());
                    }
                    Ok(())
                })
                .await
                .map_err(GatewayError::Internal)?;
            return Ok(());
        }
    };

    deps.cron
        .write(|agg| {
            if let Some(entry) = agg.jobs.get_mut(job_id) {
                entry.state.last_run_at = Some(Utc::now());
                entry.state.last_status = Some(LastStatus::Running);
                entry.state.last_error = None;
            }
            Ok(())
        })
        .await
        .map_err(GatewayError::Internal)?;

    let timeout = Duration::from_secs(spec.runtime.timeout_seconds.max(1));
    let run_result = tokio::time::timeout(timeout, run_dispatch(deps, channels, node_handlers, &spec)).await;

    let (status, error, execution_trace) = match run_result {
        Ok(Ok(trace)) => (LastStatus::Succeeded, None, trace),
        Ok(Err(e)) => (LastStatus::Failed, Some(e.to_string()), None),
        Err(_) => (
            LastStatus::Failed,
            Some(format!("timeout after {}s", spec.runtime.timeout_seconds)),
            None,
        ),
    };

    deps.cron
        .write(|agg| {
            if let Some(entry) = agg.jobs.get_mut(job_id) {
                entry.state.last_status = Some(status);
                entry.state.last_error = error;
                entry.state.last_execution = execution_trace;
            }
            Ok(())
        })
        .await
        .map_err(GatewayError::Internal)?;

    Ok(())
}

async fn run_dispatch(
    deps: &Dependencies,
    channels: &Arc<ChannelRegistry>,
    node_handlers: &Arc<NodeHandlerRegistry>,
    spec: &CronJobSpec,
) -> GatewayResult<Option<serde_json::Value>> {
    match spec.task_type {
        TaskType::Text => {
            let text = spec.text.as_deref().unwrap_or_default();
            crate::registry::channels::dispatch_text(
                channels,
                &spec.dispatch.channel,
                spec.dispatch.target.user_id.as_deref(),
                spec.dispatch.target.session_id.as_deref(),
                text,
            )
            .await?;
            Ok(None)
        }
        TaskType::Workflow => {
            let workflow = spec
                .workflow
                .as_ref()
                .ok_or(GatewayError::InvalidCronTaskType)?;
            let plan = crate::workflow::build_plan(workflow, node_handlers)?;
            let ctx = NodeContext {
                job_id: spec.id.clone(),
                job_name: spec.name.clone(),
                channel: Some(spec.dispatch.channel.clone()),
                user_id: spec.dispatch.target.user_id.clone(),
                session_id: spec.dispatch.target.session_id.clone(),
                task_type: "workflow".to_string(),
                ..NodeContext::default()
            };
            let (trace, first_failure) = crate::workflow::execute(&plan, ctx, node_handlers).await;
            let trace_json = serde_json::to_value(&trace).map_err(|e| GatewayError::Internal(e.into()))?;
            let _ = deps; // workspace/chat writes are not part of workflow dispatch
            match first_failure {
                Some(message) => Err(GatewayError::ToolError(message)),
                None => Ok(Some(trace_json)),
            }
        }
    }
}

/// Spawns the background tick loop (spec §4.2, grounded in the teacher's
/// `idle_scheduler` interval shape). Each tick reads due jobs then executes
/// them concurrently; the loop itself never exits except on process shutdown.
pub fn spawn_tick_loop(
    deps: Arc<Dependencies>,
    channels: Arc<ChannelRegistry>,
    node_handlers: Arc<NodeHandlerRegistry>,
    slots: Arc<ConcurrencySlots>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let due = match deps.cron.write(|agg| Ok(tick(agg, Utc::now()))).await {
                Ok(due) => due,
                Err(e) => {
                    tracing::error!(error = %e, "cron tick failed to read/write aggregate");
                    continue;
                }
            };
            for job_id in due {
                let deps = Arc::clone(&deps);
                let channels = Arc::clone(&channels);
                let node_handlers = Arc::clone(&node_handlers);
                let slots = Arc::clone(&slots);
                tokio::spawn(async move {
                    if let Err(e) = execute_job(&deps, &channels, &node_handlers, &slots, &job_id).await {
                        tracing::warn!(job_id, error = %e, "cron job execution failed");
                    }
                });
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::cron::{CronJobEntry, Dispatch, Runtime, Schedule};

    fn interval_job(id: &str, secs: &str) -> CronJobEntry {
        CronJobEntry {
            spec: CronJobSpec {
                id: id.to_string(),
                name: id.to_string(),
                enabled: true,
                task_type: TaskType::Text,
                schedule: Schedule {
                    kind: ScheduleType::Interval,
                    cron: secs.to_string(),
                    timezone: None,
                },
                dispatch: Dispatch {
                    channel: "console".to_string(),
                    target: Default::default(),
                },
                runtime: Runtime {
                    max_concurrency: 1,
                    timeout_seconds: 5,
                    misfire_grace_seconds: 0,
                },
                text: Some("hello".to_string()),
                workflow: None,
            },
            state: Default::default(),
        }
    }

    #[test]
    fn disabled_job_clears_next_run_at() {
        let mut agg = CronAggregate::default();
        let mut entry = interval_job("j1", "60");
        entry.spec.enabled = false;
        entry.state.next_run_at = Some(Utc::now());
        agg.jobs.insert("j1".to_string(), entry);
        let due = tick(&mut agg, Utc::now());
        assert!(due.is_empty());
        assert!(agg.jobs["j1"].state.next_run_at.is_none());
    }

    #[test]
    fn first_tick_seeds_next_run_at_one_interval_ahead() {
        let mut agg = CronAggregate::default();
        agg.jobs.insert("j1".to_string(), interval_job("j1", "60"));
        let now = Utc::now();
        let due = tick(&mut agg, now);
        assert!(due.is_empty());
        let next = agg.jobs["j1"].state.next_run_at.unwrap();
        assert!(next > now);
    }

    #[test]
    fn job_becomes_due_once_next_run_at_elapses() {
        let mut agg = CronAggregate::default();
        let mut entry = interval_job("j1", "60");
        let now = Utc::now();
        entry.state.next_run_at = Some(now - ChronoDuration::seconds(1));
        agg.jobs.insert("j1".to_string(), entry);
        let due = tick(&mut agg, now);
        assert_eq!(due, vec!["j1".to_string()]);
        assert!(agg.jobs["j1"].state.next_run_at.unwrap() > now);
    }

    #[test]
    fn misfire_beyond_grace_skips_without_enqueueing() {
        let mut agg = CronAggregate::default();
        let mut entry = interval_job("j1", "60");
        entry.spec.runtime.misfire_grace_seconds = 5;
        let now = Utc::now();
        entry.state.next_run_at = Some(now - ChronoDuration::seconds(30));
        agg.jobs.insert("j1".to_string(), entry);
        let due = tick(&mut agg, now);
        assert!(due.is_empty());
        assert_eq!(agg.jobs["j1"].state.last_status, Some(LastStatus::Failed));
        assert!(agg.jobs["j1"].state.last_error.as_ref().unwrap().contains("misfire"));
    }

    #[test]
    fn concurrency_slots_reject_beyond_max() {
        let slots = ConcurrencySlots::new();
        let _g1 = slots.try_acquire("j1", 1).unwrap();
        let err = slots.try_acquire("j1", 1).unwrap_err();
        assert!(matches!(err, GatewayError::CronMaxConcurrencyReached(_)));
    }

    #[test]
    fn concurrency_slot_releases_on_drop() {
        let slots = ConcurrencySlots::new();
        {
            let _g1 = slots.try_acquire("j1", 1).unwrap();
        }
        assert!(slots.try_acquire("j1", 1).is_ok());
    }

    #[test]
    fn parse_interval_seconds_supports_suffixed_durations() {
        assert_eq!(parse_interval_seconds("60").unwrap(), 60);
        assert_eq!(parse_interval_seconds("5m").unwrap(), 300);
        assert_eq!(parse_interval_seconds("2h").unwrap(), 7200);
    }

    #[test]
    fn normalize_cron_expr_expands_hourly_descriptor() {
        assert_eq!(normalize_cron_expr("@hourly"), "0 0 * * * * *");
    }
}

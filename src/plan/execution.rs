//! 执行计划：步骤的唯一事实来源
//!
//! 步骤以稳定 ID 存放在 arena 中，每个步骤一把独立的锁（不同步骤可并行更新）；
//! 就绪扫描与状态聚合在短暂的全局读锁下取一致快照。结构性变更（插入修复链）持有全局写锁，并在变更后重新校验无环。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::core::PlanError;
use crate::plan::decomposer::StepProposal;
use crate::plan::graph::validate_acyclic;
use crate::plan::types::*;

type StepSlot = Arc<Mutex<TaskStep>>;

#[derive(Default)]
struct StepArena {
    /// 插入顺序
    order: Vec<StepId>,
    slots: HashMap<StepId, StepSlot>,
    next_seq: u64,
}

/// 执行计划
pub struct ExecutionPlan {
    id: PlanId,
    goal: String,
    created_at: DateTime<Utc>,
    arena: RwLock<StepArena>,
    /// 紧急停止后置位，计划状态即为 Cancelled
    stopped: AtomicBool,
}

impl ExecutionPlan {
    /// 由已校验的步骤构造（见 PlanBuilder）
    pub(crate) fn new(goal: impl Into<String>, steps: Vec<TaskStep>) -> Self {
        let mut arena = StepArena::default();
        for mut step in steps {
            step.seq = arena.next_seq;
            arena.next_seq += 1;
            arena.order.push(step.id.clone());
            arena
                .slots
                .insert(step.id.clone(), Arc::new(Mutex::new(step)));
        }
        Self {
            id: format!("plan_{}", uuid::Uuid::new_v4()),
            goal: goal.into(),
            created_at: Utc::now(),
            arena: RwLock::new(arena),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn len(&self) -> usize {
        self.arena.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn step_ids(&self) -> Vec<StepId> {
        self.arena.read().await.order.clone()
    }

    async fn slot(&self, id: &str) -> Result<StepSlot, PlanError> {
        self.arena
            .read()
            .await
            .slots
            .get(id)
            .cloned()
            .ok_or_else(|| PlanError::StepNotFound(id.to_string()))
    }

    /// 读取单个步骤的副本
    pub async fn step(&self, id: &str) -> Option<TaskStep> {
        let slot = self.slot(id).await.ok()?;
        let step = slot.lock().await;
        Some(step.clone())
    }

    /// 在该步骤的独占锁内修改它（不持有全局锁）
    pub async fn update<F, R>(&self, id: &str, f: F) -> Result<R, PlanError>
    where
        F: FnOnce(&mut TaskStep) -> R,
    {
        let slot = self.slot(id).await?;
        let mut step = slot.lock().await;
        Ok(f(&mut step))
    }

    /// 状态转换，返回转换前的状态
    pub async fn transition(&self, id: &str, to: StepState) -> Result<StepState, PlanError> {
        self.update(id, |step| step.transition(to)).await?
    }

    /// 一致快照（按插入顺序）
    pub async fn snapshot(&self) -> Vec<TaskStep> {
        let arena = self.arena.read().await;
        let mut steps = Vec::with_capacity(arena.order.len());
        for id in &arena.order {
            if let Some(slot) = arena.slots.get(id) {
                steps.push(slot.lock().await.clone());
            }
        }
        steps
    }

    /// 预估总耗时（分钟），各步骤复杂度估算之和
    pub async fn estimated_duration_minutes(&self) -> u32 {
        self.snapshot()
            .await
            .iter()
            .filter_map(|s| s.complexity.map(|c| c.time_estimate_minutes))
            .sum()
    }

    /// 从快照聚合计划状态
    pub async fn status(&self) -> PlanStatus {
        if self.is_stopped() {
            return PlanStatus::Cancelled;
        }
        aggregate_status(&self.snapshot().await)
    }

    /// 推进 Pending 步骤：依赖全部成功 → Ready；任一依赖失败/取消 → Cancelled（级联）。
    /// 重复扫描直到不动点，返回本次发生的转换。
    pub async fn promote_ready(&self) -> Vec<(StepId, StepState)> {
        let arena = self.arena.read().await;
        let mut changed = Vec::new();

        loop {
            let mut states: HashMap<StepId, StepState> = HashMap::with_capacity(arena.order.len());
            let mut pending: Vec<(StepId, BTreeSet<StepId>)> = Vec::new();
            for id in &arena.order {
                let Some(slot) = arena.slots.get(id) else { continue };
                let step = slot.lock().await;
                states.insert(id.clone(), step.state);
                if step.state == StepState::Pending {
                    pending.push((id.clone(), step.depends_on.clone()));
                }
            }

            let mut progressed = false;
            for (id, deps) in pending {
                let dep_states: Vec<StepState> =
                    deps.iter().filter_map(|d| states.get(d).copied()).collect();
                let blocked = dep_states
                    .iter()
                    .any(|s| matches!(s, StepState::Failed | StepState::Cancelled));
                let all_succeeded = dep_states.len() == deps.len()
                    && dep_states.iter().all(|s| *s == StepState::Succeeded);

                let Some(slot) = arena.slots.get(&id) else { continue };
                let mut step = slot.lock().await;
                if step.state != StepState::Pending {
                    continue;
                }
                if blocked {
                    if step.cancel("dependency did not succeed").is_ok() {
                        tracing::info!(plan_id = %self.id, step_id = %id, "step cancelled by failed dependency");
                        changed.push((id, StepState::Cancelled));
                        progressed = true;
                    }
                } else if all_succeeded && step.transition(StepState::Ready).is_ok() {
                    changed.push((id, StepState::Ready));
                    progressed = true;
                }
            }

            if !progressed {
                break;
            }
        }

        changed
    }

    /// 当前 Ready 步骤，按调度契约排序：显式优先级降序，其次提出顺序
    pub async fn ready_steps(&self) -> Vec<TaskStep> {
        let mut ready: Vec<TaskStep> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|s| s.state == StepState::Ready)
            .collect();
        ready.sort_by(|a, b| {
            let pa = a.priority.map_or(i64::MIN, i64::from);
            let pb = b.priority.map_or(i64::MIN, i64::from);
            pb.cmp(&pa).then(a.seq.cmp(&b.seq))
        });
        ready
    }

    /// 将修复链插入计划：首个修复步骤依赖失败步骤已成功的前驱（从不依赖失败步骤本身），
    /// 链内顺序依赖；原先依赖失败步骤的步骤改为依赖修复链末端。插入前在变更后的图上重新校验无环。
    pub async fn insert_fix_chain(
        &self,
        failed_id: &str,
        fixes: Vec<StepProposal>,
    ) -> Result<Vec<StepId>, PlanError> {
        if fixes.is_empty() {
            return Ok(Vec::new());
        }
        let mut arena = self.arena.write().await;

        let failed_slot = arena
            .slots
            .get(failed_id)
            .cloned()
            .ok_or_else(|| PlanError::StepNotFound(failed_id.to_string()))?;
        let (failed_deps, depth) = {
            let failed = failed_slot.lock().await;
            if failed.state != StepState::Failed {
                return Err(PlanError::InvalidTransition {
                    step: failed.id.clone(),
                    from: failed.state,
                    to: StepState::Failed,
                });
            }
            (failed.depends_on.clone(), failed.origin.fix_depth() + 1)
        };

        let mut deps_map: HashMap<StepId, BTreeSet<StepId>> = HashMap::new();
        let mut succeeded: HashSet<StepId> = HashSet::new();
        for id in &arena.order {
            if let Some(slot) = arena.slots.get(id) {
                let step = slot.lock().await;
                if step.state == StepState::Succeeded {
                    succeeded.insert(id.clone());
                }
                deps_map.insert(id.clone(), step.depends_on.clone());
            }
        }
        let predecessors: BTreeSet<StepId> = failed_deps
            .into_iter()
            .filter(|d| succeeded.contains(d))
            .collect();

        let mut new_steps = Vec::with_capacity(fixes.len());
        let mut previous: Option<StepId> = None;
        for (index, proposal) in fixes.into_iter().enumerate() {
            let mut id = format!("{}.fix{}", failed_id, index + 1);
            let mut suffix = 1;
            while deps_map.contains_key(&id) {
                suffix += 1;
                id = format!("{}.fix{}-{}", failed_id, index + 1, suffix);
            }
            let mut step = step_from_proposal(id.clone(), proposal);
            step.origin = StepOrigin::Fix {
                for_step: failed_id.to_string(),
                depth,
            };
            step.depends_on = match &previous {
                Some(prev) => BTreeSet::from([prev.clone()]),
                None => predecessors.clone(),
            };
            deps_map.insert(id.clone(), step.depends_on.clone());
            previous = Some(id);
            new_steps.push(step);
        }
        let Some(terminal) = previous else {
            return Ok(Vec::new());
        };

        let rewired: Vec<StepId> = arena
            .order
            .iter()
            .filter(|id| deps_map.get(*id).is_some_and(|d| d.contains(failed_id)))
            .cloned()
            .collect();
        for id in &rewired {
            if let Some(deps) = deps_map.get_mut(id) {
                deps.remove(failed_id);
                deps.insert(terminal.clone());
            }
        }

        let mut check_order: Vec<StepId> = arena.order.clone();
        check_order.extend(new_steps.iter().map(|s| s.id.clone()));
        validate_acyclic(
            check_order
                .iter()
                .filter_map(|id| deps_map.get(id).map(|d| (id, d))),
        )?;

        // 校验通过后才落地变更
        for id in &rewired {
            if let (Some(slot), Some(deps)) = (arena.slots.get(id), deps_map.get(id)) {
                slot.lock().await.depends_on = deps.clone();
            }
        }
        failed_slot.lock().await.superseded_by = Some(terminal.clone());

        let mut inserted = Vec::with_capacity(new_steps.len());
        for mut step in new_steps {
            step.seq = arena.next_seq;
            arena.next_seq += 1;
            arena.order.push(step.id.clone());
            inserted.push(step.id.clone());
            arena
                .slots
                .insert(step.id.clone(), Arc::new(Mutex::new(step)));
        }

        tracing::info!(
            plan_id = %self.id,
            failed_step = %failed_id,
            fix_steps = ?inserted,
            rewired = ?rewired,
            "fix chain inserted"
        );
        Ok(inserted)
    }

    /// 取消所有非终态且不在 `skip` 中的步骤（紧急停止）
    pub async fn cancel_non_terminal(&self, skip: &HashSet<StepId>, reason: &str) -> Vec<StepId> {
        let arena = self.arena.read().await;
        let mut cancelled = Vec::new();
        for id in &arena.order {
            if skip.contains(id) {
                continue;
            }
            if let Some(slot) = arena.slots.get(id) {
                let mut step = slot.lock().await;
                if !step.state.is_terminal() && step.cancel(reason).is_ok() {
                    cancelled.push(id.clone());
                }
            }
        }
        cancelled
    }

    /// 置位停止标记（单次，不可撤销）
    pub fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// 提案 → 步骤（依赖由调用方填写）
pub(crate) fn step_from_proposal(id: StepId, proposal: StepProposal) -> TaskStep {
    let mut step = TaskStep::new(id, proposal.description);
    step.priority = proposal.priority;
    step.capability = proposal.capability;
    step.tool_hint = proposal.tool;
    if !proposal.params.is_null() {
        step.params = proposal.params;
    }
    step.justification = proposal.justification;
    step
}

/// 失败后被修复链接替、且修复链末端（沿 superseded_by 追溯）最终成功的步骤
pub fn recovered_steps(steps: &[TaskStep]) -> HashSet<StepId> {
    let by_id: HashMap<&str, &TaskStep> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
    steps
        .iter()
        .filter(|s| s.state == StepState::Failed)
        .filter(|s| {
            let mut current = s.superseded_by.as_deref();
            // 每一跳都指向新插入的步骤，跳数不会超过步骤总数
            for _ in 0..steps.len() {
                let Some(next) = current.and_then(|id| by_id.get(id)) else {
                    return false;
                };
                match next.state {
                    StepState::Succeeded => return true,
                    StepState::Failed => current = next.superseded_by.as_deref(),
                    _ => return false,
                }
            }
            false
        })
        .map(|s| s.id.clone())
        .collect()
}

/// 由步骤状态聚合计划状态（不含紧急停止标记）
pub fn aggregate_status(steps: &[TaskStep]) -> PlanStatus {
    if steps.iter().any(|s| !s.state.is_terminal()) {
        return PlanStatus::Running;
    }
    let recovered = recovered_steps(steps);
    if steps
        .iter()
        .all(|s| s.state == StepState::Succeeded || recovered.contains(&s.id))
    {
        PlanStatus::Succeeded
    } else {
        PlanStatus::Failed
    }
}

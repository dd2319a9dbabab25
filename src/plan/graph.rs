//! 步骤依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序；排序后仍有残余节点即存在环

use std::collections::{BTreeSet, HashMap};

use crate::core::PlanError;
use crate::plan::types::StepId;

/// 步骤依赖图
pub struct DependencyGraph {
    /// 节点的声明顺序（拓扑排序时用于稳定输出）
    order: Vec<StepId>,
    /// 邻接表：步骤 ID -> 依赖该步骤的步骤列表
    adjacency: HashMap<StepId, Vec<StepId>>,
    /// 入度表：步骤 ID -> 依赖数
    in_degree: HashMap<StepId, usize>,
}

impl DependencyGraph {
    /// 创建依赖图；依赖必须指向已声明的步骤且不能指向自身
    pub fn new<'a, I>(steps: I) -> Result<Self, PlanError>
    where
        I: IntoIterator<Item = (&'a StepId, &'a BTreeSet<StepId>)>,
    {
        let steps: Vec<_> = steps.into_iter().collect();
        let mut order = Vec::with_capacity(steps.len());
        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();

        for (step_id, _) in &steps {
            if in_degree.insert((*step_id).clone(), 0).is_some() {
                return Err(PlanError::DuplicateStep((*step_id).clone()));
            }
            adjacency.insert((*step_id).clone(), Vec::new());
            order.push((*step_id).clone());
        }

        for (step_id, deps) in &steps {
            for dep_id in deps.iter() {
                if dep_id == *step_id {
                    return Err(PlanError::SelfDependency((*step_id).clone()));
                }
                let Some(dependents) = adjacency.get_mut(dep_id) else {
                    return Err(PlanError::UnknownDependency {
                        step: (*step_id).clone(),
                        dependency: dep_id.clone(),
                    });
                };
                dependents.push((*step_id).clone());
                *in_degree.entry((*step_id).clone()).or_insert(0) += 1;
            }
        }

        Ok(Self {
            order,
            adjacency,
            in_degree,
        })
    }

    /// Kahn 拓扑排序；存在环时返回残余集合
    pub fn topological_order(&self) -> Result<Vec<StepId>, PlanError> {
        let mut in_degree = self.in_degree.clone();
        let mut queue: Vec<StepId> = self
            .order
            .iter()
            .filter(|id| in_degree.get(*id) == Some(&0))
            .cloned()
            .collect();
        queue.reverse();

        let mut sorted = Vec::with_capacity(self.order.len());
        while let Some(step_id) = queue.pop() {
            if let Some(dependents) = self.adjacency.get(&step_id) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.insert(0, dependent.clone());
                        }
                    }
                }
            }
            sorted.push(step_id);
        }

        if sorted.len() < self.order.len() {
            let residual: Vec<StepId> = self
                .order
                .iter()
                .filter(|id| !sorted.contains(id))
                .cloned()
                .collect();
            return Err(PlanError::CyclicDependency(residual));
        }

        Ok(sorted)
    }

    /// 依赖该步骤的直接后继
    pub fn dependents(&self, step_id: &str) -> &[StepId] {
        self.adjacency
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// 校验一组步骤依赖：引用完整、无自环、无环
pub fn validate_acyclic<'a, I>(steps: I) -> Result<Vec<StepId>, PlanError>
where
    I: IntoIterator<Item = (&'a StepId, &'a BTreeSet<StepId>)>,
{
    DependencyGraph::new(steps)?.topological_order()
}

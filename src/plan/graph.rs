//! 计划依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序、就绪步骤计算与下游闭包

use std::collections::{HashMap, HashSet, VecDeque};

use crate::plan::types::*;

/// 计划依赖图（遍历顺序始终跟随计划中的步骤顺序，保证结果确定）
pub struct PlanGraph {
    /// 计划中的步骤顺序
    order: Vec<StepId>,
    /// 邻接表：步骤 ID -> 依赖该步骤的步骤列表
    pub adjacency: HashMap<StepId, Vec<StepId>>,
    /// 入度表：步骤 ID -> 依赖数
    pub in_degree: HashMap<StepId, usize>,
}

impl PlanGraph {
    /// 创建依赖图；指向计划外步骤的边被忽略（由 Plan::validate 负责报告）
    pub fn new(plan: &Plan) -> Self {
        let order = plan.ids();
        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();

        for id in &order {
            in_degree.insert(id.clone(), 0);
            adjacency.insert(id.clone(), Vec::new());
        }

        for step in &plan.steps {
            for dep in &step.spec.depends_on {
                if let Some(dependents) = adjacency.get_mut(dep) {
                    dependents.push(step.id().clone());
                    *in_degree.entry(step.id().clone()).or_insert(0) += 1;
                }
            }
        }

        Self {
            order,
            adjacency,
            in_degree,
        }
    }

    /// Kahn 拓扑排序；存在环时返回环上的某个步骤
    pub fn topological_order(&self) -> Result<Vec<StepId>, PlanError> {
        let mut degree = self.in_degree.clone();
        let mut queue: VecDeque<StepId> = self
            .order
            .iter()
            .filter(|id| degree.get(*id) == Some(&0))
            .cloned()
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(id) = queue.pop_front() {
            if let Some(dependents) = self.adjacency.get(&id) {
                for dependent in dependents {
                    if let Some(d) = degree.get_mut(dependent) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(dependent.clone());
                        }
                    }
                }
            }
            sorted.push(id);
        }

        if sorted.len() < self.order.len() {
            let stuck = self
                .order
                .iter()
                .find(|id| degree.get(*id).copied().unwrap_or(0) > 0)
                .map(|id| id.to_string())
                .unwrap_or_default();
            return Err(PlanError::CyclicDependency(stuck));
        }
        Ok(sorted)
    }

    /// 可晋升为 Ready 的步骤：自身 Pending 且所有依赖都已 Succeeded
    pub fn promotable(plan: &Plan) -> Vec<StepId> {
        plan.steps
            .iter()
            .filter(|step| step.state == StepState::Pending)
            .filter(|step| {
                step.spec.depends_on.iter().all(|dep| {
                    plan.step(dep)
                        .map(|d| d.state == StepState::Succeeded)
                        .unwrap_or(false)
                })
            })
            .map(|step| step.id().clone())
            .collect()
    }

    /// 某步骤的全部下游（传递依赖者），按计划顺序返回
    pub fn dependents_closure(&self, root: &StepId) -> Vec<StepId> {
        let mut seen: HashSet<StepId> = HashSet::new();
        let mut queue = VecDeque::from([root.clone()]);
        while let Some(id) = queue.pop_front() {
            if let Some(dependents) = self.adjacency.get(&id) {
                for dependent in dependents {
                    if seen.insert(dependent.clone()) {
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }
        self.order
            .iter()
            .filter(|id| seen.contains(*id))
            .cloned()
            .collect()
    }
}

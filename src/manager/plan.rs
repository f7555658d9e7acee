// src/manager/plan.rs
//! Ordered broker traversal with per-broker candidate bookkeeping
//!
//! The plan holds every broker in solving order. For one request it keeps
//! the brokers applicable to the move and, for each of them, the candidate
//! list computed when the search first reached it and the index of the
//! candidate tried last. The director drives the search through
//! [`AssignmentPlan::try_next_assignment`], [`AssignmentPlan::advance`] and
//! [`AssignmentPlan::backtrack`].

use crate::broker::{
    AssignContext, AssignRequest, Broker, BrokerContext, BrokerKind, BusBroker, ExecutionPipelineBroker,
    ITemplateBroker, IuBroker, Peers, ResourceBroker, ResourceMapper,
};
use crate::error::{RmError, RmResult};
use crate::resource::{ResourceId, ResourceStore};
use crate::tta::instruction::{BasicBlock, NodeId};
use crate::tta::processor::Machine;

/// Everything a broker call needs besides the broker itself
pub struct PlanEnv<'a> {
    pub machine: &'a Machine,
    pub store: &'a mut ResourceStore,
    pub mapper: &'a ResourceMapper,
    pub block: &'a mut BasicBlock,
}

/// Search state of one applicable broker
#[derive(Clone, Debug)]
pub struct PendingAssignment {
    broker: usize,
    candidates: Option<Vec<ResourceId>>,
    last_tried: Option<usize>,
}

impl PendingAssignment {
    fn new(broker: usize) -> Self {
        Self {
            broker,
            candidates: None,
            last_tried: None,
        }
    }

    fn next_index(&self) -> usize {
        self.last_tried.map(|i| i + 1).unwrap_or(0)
    }

    fn has_untried(&self) -> bool {
        self.candidates
            .as_ref()
            .map(|c| self.next_index() < c.len())
            .unwrap_or(false)
    }

    fn reset(&mut self) {
        self.candidates = None;
        self.last_tried = None;
    }
}

#[derive(Clone, Copy, Debug)]
struct Request {
    cycle: i32,
    node: NodeId,
    request: AssignRequest,
}

pub struct AssignmentPlan {
    brokers: Vec<Broker>,
    pending: Vec<PendingAssignment>,
    current: usize,
    request: Option<Request>,
}

impl AssignmentPlan {
    pub fn new(brokers: Vec<Broker>) -> Self {
        Self {
            brokers,
            pending: Vec::new(),
            current: 0,
            request: None,
        }
    }

    pub fn brokers(&self) -> &[Broker] {
        &self.brokers
    }

    pub fn brokers_mut(&mut self) -> &mut [Broker] {
        &mut self.brokers
    }

    /// Read-only context in which every broker is a peer
    pub fn context<'a>(
        &'a self,
        machine: &'a Machine,
        store: &'a ResourceStore,
        mapper: &'a ResourceMapper,
        block: &'a BasicBlock,
    ) -> BrokerContext<'a> {
        BrokerContext {
            machine,
            store,
            mapper,
            block,
            peers: Peers::new(&self.brokers, &[]),
        }
    }

    pub fn bus_broker(&self) -> Option<&BusBroker> {
        Peers::new(&self.brokers, &[]).bus()
    }

    pub fn iu_broker(&self) -> Option<&IuBroker> {
        Peers::new(&self.brokers, &[]).iu()
    }

    pub fn itemplate_broker(&self) -> Option<&ITemplateBroker> {
        Peers::new(&self.brokers, &[]).itemplate()
    }

    pub fn itemplate_broker_mut(&mut self) -> Option<&mut ITemplateBroker> {
        self.brokers.iter_mut().find_map(|b| match b {
            Broker::InstructionTemplate(b) => Some(b),
            _ => None,
        })
    }

    pub fn pipeline_broker(&self) -> Option<&ExecutionPipelineBroker> {
        Peers::new(&self.brokers, &[]).pipeline()
    }

    pub fn broker_of_kind(&self, kind: BrokerKind) -> Option<&Broker> {
        self.brokers.iter().find(|b| b.kind() == kind)
    }

    /// Run `f` on broker `index` with every other broker visible as a peer
    fn with_broker<R>(
        &mut self,
        index: usize,
        env: &mut PlanEnv<'_>,
        f: impl FnOnce(&mut dyn ResourceBroker, &mut AssignContext<'_>) -> R,
    ) -> RmResult<R> {
        let (before, rest) = self.brokers.split_at_mut(index);
        let (broker, after) = rest
            .split_first_mut()
            .ok_or_else(|| RmError::invalid_use(format!("no broker at plan position {}", index)))?;
        let mut ctx = AssignContext {
            machine: env.machine,
            store: &mut *env.store,
            mapper: env.mapper,
            block: &mut *env.block,
            peers: Peers::new(before, after),
        };
        Ok(f(broker.as_dyn_mut(), &mut ctx))
    }

    fn active(&self) -> RmResult<Request> {
        self.request
            .ok_or_else(|| RmError::invalid_use("assignment plan has no request"))
    }

    /// Start a search for placing `node` at `cycle`
    ///
    /// Marks the node with the cycle and collects the applicable brokers.
    pub fn set_request(
        &mut self,
        env: &mut PlanEnv<'_>,
        cycle: i32,
        node: NodeId,
        request: AssignRequest,
    ) -> RmResult<()> {
        let moved = env.block.node_mut(node);
        match moved.cycle {
            Some(placed) if placed != cycle => {
                return Err(RmError::invalid_use(format!(
                    "{} is placed at cycle {}, not {}",
                    node, placed, cycle
                )))
            }
            _ => moved.cycle = Some(cycle),
        }

        let ctx = self.context(env.machine, &*env.store, env.mapper, &*env.block);
        let pending: Vec<PendingAssignment> = self
            .brokers
            .iter()
            .enumerate()
            .filter(|(_, b)| b.as_dyn().is_applicable(&ctx, node, &request))
            .map(|(i, _)| PendingAssignment::new(i))
            .collect();
        if pending.is_empty() {
            return Err(RmError::invalid_use(format!("no broker applies to {}", node)));
        }
        log::trace!(
            "[plan] {} @ {}: {}",
            node,
            cycle,
            pending
                .iter()
                .map(|p| self.brokers[p.broker].kind().to_string())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        self.pending = pending;
        self.current = 0;
        self.request = Some(Request { cycle, node, request });
        Ok(())
    }

    pub fn is_first_broker(&self) -> bool {
        self.current == 0
    }

    pub fn is_last_broker(&self) -> bool {
        self.current + 1 >= self.pending.len()
    }

    /// Kind of the broker the search stands at
    pub fn current_kind(&self) -> Option<BrokerKind> {
        self.pending
            .get(self.current)
            .map(|p| self.brokers[p.broker].kind())
    }

    /// Does the current broker have a candidate left to try
    pub fn is_tested_assignment_possible(&mut self, env: &PlanEnv<'_>) -> RmResult<bool> {
        let active = self.active()?;
        let index = self.current;
        if self.pending[index].candidates.is_none() {
            let candidates = {
                let ctx = self.context(env.machine, &*env.store, env.mapper, &*env.block);
                let broker = self.brokers[self.pending[index].broker].as_dyn();
                broker.all_available_resources(&ctx, active.cycle, active.node, &active.request)
            };
            log::trace!(
                "[plan] {} candidates for {}: {:?}",
                self.brokers[self.pending[index].broker].kind(),
                active.node,
                candidates.iter().map(|r| env.store.name(*r)).collect::<Vec<_>>()
            );
            self.pending[index].candidates = Some(candidates);
        }
        Ok(self.pending[index].has_untried())
    }

    /// Candidates of the current broker, computing them if needed
    pub fn current_candidates(&mut self, env: &PlanEnv<'_>) -> RmResult<Vec<ResourceId>> {
        self.is_tested_assignment_possible(env)?;
        Ok(self.pending[self.current].candidates.clone().unwrap_or_default())
    }

    /// Assign the next untried candidate of the current broker
    ///
    /// Returns false when the broker turns the candidate down; the search
    /// then goes on with the next one.
    pub fn try_next_assignment(&mut self, env: &mut PlanEnv<'_>) -> RmResult<bool> {
        let active = self.active()?;
        let index = self.current;
        if !self.pending[index].has_untried() {
            return Err(RmError::invalid_use("no untried candidate left"));
        }
        let broker = self.pending[index].broker;
        let next = self.pending[index].next_index();
        let resource = match &self.pending[index].candidates {
            Some(candidates) => candidates[next],
            None => return Err(RmError::invalid_use("candidates not computed")),
        };
        self.pending[index].last_tried = Some(next);
        let assigned = self.with_broker(broker, env, |b, ctx| -> RmResult<RmResult<()>> {
            if b.is_already_assigned(active.cycle, active.node) {
                b.unassign(ctx, active.node)?;
            }
            Ok(b.assign(ctx, active.cycle, active.node, resource, &active.request))
        })??;
        match assigned {
            Ok(()) => Ok(true),
            Err(err @ (RmError::NotImplemented { .. } | RmError::Config(_))) => Err(err),
            Err(err) => {
                log::trace!(
                    "[plan] {} turned down {} for {}: {}",
                    self.brokers[broker].kind(),
                    env.store.name(resource),
                    active.node,
                    err
                );
                Ok(false)
            }
        }
    }

    pub fn advance(&mut self) -> RmResult<()> {
        if self.is_last_broker() {
            return Err(RmError::invalid_use("cannot advance past the last broker"));
        }
        self.current += 1;
        Ok(())
    }

    /// Drop the current broker's candidates and step back, undoing the previous broker
    pub fn backtrack(&mut self, env: &mut PlanEnv<'_>) -> RmResult<()> {
        if self.is_first_broker() {
            return Err(RmError::invalid_use("cannot backtrack past the first broker"));
        }
        self.forget(self.current, env)?;
        self.current -= 1;
        let active = self.active()?;
        let broker = self.pending[self.current].broker;
        self.with_broker(broker, env, |b, ctx| b.unassign(ctx, active.node))?
    }

    fn forget(&mut self, index: usize, env: &mut PlanEnv<'_>) -> RmResult<()> {
        let active = self.active()?;
        let broker = self.pending[index].broker;
        self.with_broker(broker, env, |b, ctx| b.unassign(ctx, active.node))??;
        self.pending[index].reset();
        Ok(())
    }

    /// Undo every assignment of the request, last broker first
    pub fn reset_assignments(&mut self, env: &mut PlanEnv<'_>) -> RmResult<()> {
        if self.request.is_none() {
            return Ok(());
        }
        for index in (0..self.pending.len()).rev() {
            self.forget(index, env)?;
        }
        self.current = 0;
        Ok(())
    }

    /// Undo every broker's assignment of an already placed `node`
    pub fn unassign_node(&mut self, env: &mut PlanEnv<'_>, node: NodeId) -> RmResult<()> {
        for index in (0..self.brokers.len()).rev() {
            self.with_broker(index, env, |b, ctx| b.unassign(ctx, node))??;
        }
        Ok(())
    }

    /// Finish the request; the plan keeps no reference to the node
    pub fn finish(&mut self) {
        self.pending.clear();
        self.current = 0;
        self.request = None;
    }

    pub fn clear(&mut self) {
        self.finish();
        for broker in &mut self.brokers {
            broker.as_dyn_mut().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_assignment_walks_candidates() {
        let mut pending = PendingAssignment::new(3);
        assert!(!pending.has_untried());
        pending.candidates = Some(vec![ResourceId(4), ResourceId(7)]);
        assert!(pending.has_untried());
        pending.last_tried = Some(0);
        assert_eq!(pending.next_index(), 1);
        pending.last_tried = Some(1);
        assert!(!pending.has_untried());
        pending.reset();
        assert!(pending.candidates.is_none());
        assert_eq!(pending.next_index(), 0);
    }
}

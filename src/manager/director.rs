// src/manager/director.rs
//! Backtracking search over the assignment plan
//!
//! For one move at one cycle the director walks the plan's brokers in
//! order. Each broker commits its next candidate and the search moves on;
//! a broker without candidates left sends the search back to the previous
//! broker. Committing a candidate at the last broker places the move;
//! feasibility probes run the same search and roll it back.

use super::plan::{AssignmentPlan, PlanEnv};
use crate::broker::{AssignRequest, Broker, BrokerKind, CycleBound, ResourceBroker};
use crate::error::{RmError, RmResult};
use crate::resource::{ResourceId, ResourceStore};
use crate::tta::instruction::{MoveNode, NodeId, Terminal};
use crate::tta::processor::{BusId, Guard};
use std::collections::{BTreeMap, HashMap};

/// Terminals of a move before any broker rewrote them
#[derive(Clone, Debug)]
struct Original {
    source: Terminal,
    destination: Terminal,
    bus: Option<BusId>,
    guard: Option<Guard>,
}

impl Original {
    fn of(node: &MoveNode) -> Self {
        Self {
            source: node.transport.source.clone(),
            destination: node.transport.destination.clone(),
            bus: node.transport.bus,
            guard: node.transport.guard.clone(),
        }
    }

    fn restore(self, node: &mut MoveNode) {
        node.transport.source = self.source;
        node.transport.destination = self.destination;
        node.transport.bus = self.bus;
        node.transport.guard = self.guard;
    }
}

pub struct SimpleBrokerDirector {
    plan: AssignmentPlan,
    scheduling_window: i32,
    /// Highest cycle holding a move or a long immediate, -1 if none
    known_max: i32,
    /// Lowest such cycle, `i32::MAX` if none
    known_min: i32,
    move_counts: BTreeMap<i32, usize>,
    originals: HashMap<NodeId, Original>,
}

impl SimpleBrokerDirector {
    pub fn new(plan: AssignmentPlan, scheduling_window: i32) -> Self {
        Self {
            plan,
            scheduling_window,
            known_max: -1,
            known_min: i32::MAX,
            move_counts: BTreeMap::new(),
            originals: HashMap::new(),
        }
    }

    pub fn plan(&self) -> &AssignmentPlan {
        &self.plan
    }

    pub fn plan_mut(&mut self) -> &mut AssignmentPlan {
        &mut self.plan
    }

    pub fn move_count(&self, cycle: i32) -> usize {
        self.move_counts.get(&cycle).copied().unwrap_or(0)
    }

    /// Run the search to a complete assignment, leaving it in place;
    /// false when every combination of candidates was turned down
    fn search(&mut self, env: &mut PlanEnv<'_>, cycle: i32, node: NodeId, request: AssignRequest) -> RmResult<bool> {
        self.plan.set_request(env, cycle, node, request)?;
        loop {
            if self.plan.is_tested_assignment_possible(env)? {
                if !self.plan.try_next_assignment(env)? {
                    continue;
                }
                if self.plan.is_last_broker() {
                    return Ok(true);
                }
                self.plan.advance()?;
            } else {
                if self.plan.is_first_broker() {
                    return Ok(false);
                }
                log::trace!("[director] backtrack from {:?} for {}", self.plan.current_kind(), node);
                self.plan.backtrack(env)?;
            }
        }
    }

    /// Undo whatever the last search left behind and put the move back as it was
    fn roll_back(&mut self, env: &mut PlanEnv<'_>, node: NodeId, original: Original) -> RmResult<()> {
        let reset = self.plan.reset_assignments(env);
        self.plan.finish();
        let moved = env.block.node_mut(node);
        original.restore(moved);
        moved.cycle = None;
        reset
    }

    /// Could `node` be placed at `cycle`; nothing stays assigned
    pub fn can_assign(
        &mut self,
        env: &mut PlanEnv<'_>,
        cycle: i32,
        node: NodeId,
        request: AssignRequest,
    ) -> RmResult<bool> {
        if cycle < 0 {
            return Ok(false);
        }
        let moved = env.block.node(node);
        if moved.is_placed() {
            return Ok(false);
        }
        if self.move_count(cycle) >= env.machine.bus_count() {
            return Ok(false);
        }
        let original = Original::of(moved);
        let found = self.search(env, cycle, node, request);
        let rolled_back = self.roll_back(env, node, original);
        let found = found?;
        rolled_back?;
        Ok(found)
    }

    /// Place `node` at `cycle`, binding every applicable broker's resource
    pub fn assign(&mut self, env: &mut PlanEnv<'_>, cycle: i32, node: NodeId, request: AssignRequest) -> RmResult<()> {
        if cycle < 0 || cycle == i32::MAX {
            return Err(RmError::invalid_use(format!("cannot assign {} at cycle {}", node, cycle)));
        }
        let moved = env.block.node(node);
        if let Some(placed) = moved.cycle {
            return Err(RmError::invalid_use(format!(
                "{} is already placed at cycle {}",
                node, placed
            )));
        }
        let original = Original::of(moved);
        let placed = match self.search(env, cycle, node, request) {
            Ok(true) => Ok(()),
            Ok(false) => Err(RmError::NoAssignment { node, cycle }),
            Err(err) => Err(err),
        };
        if let Err(err) = placed {
            log::debug!("[director] assign {} @ {} failed: {}", node, cycle, err);
            self.roll_back(env, node, original)?;
            return Err(err);
        }
        self.plan.finish();
        self.originals.insert(node, original);

        self.known_max = self.known_max.max(cycle);
        self.known_min = self.known_min.min(cycle);
        if env.block.node(node).transport.source.is_immediate_register() {
            if let Some(definition) = self
                .plan
                .iu_broker()
                .and_then(|iu| iu.immediate_write_cycle(&*env.store, node))
            {
                self.known_min = self.known_min.min(definition);
            }
        }
        *self.move_counts.entry(cycle).or_insert(0) += 1;
        log::debug!("[director] assign {} @ {}", node, cycle);
        Ok(())
    }

    /// Release every resource held by `node` and restore its terminals
    pub fn unassign(&mut self, env: &mut PlanEnv<'_>, node: NodeId) -> RmResult<()> {
        let cycle = env
            .block
            .node(node)
            .cycle
            .ok_or_else(|| RmError::invalid_use(format!("{} is not placed", node)))?;
        if let Some(count) = self.move_counts.get_mut(&cycle) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.move_counts.remove(&cycle);
            }
        }
        self.plan.unassign_node(env, node)?;
        let moved = env.block.node_mut(node);
        if let Some(original) = self.originals.remove(&node) {
            original.restore(moved);
        }
        moved.cycle = None;
        log::debug!("[director] unassign {} from {}", node, cycle);
        self.shrink_known_cycles();
        Ok(())
    }

    fn shrink_known_cycles(&mut self) {
        let templates = match self.plan.itemplate_broker() {
            Some(templates) => templates,
            None => return,
        };
        while self.known_max >= 0 && self.known_max >= self.known_min && templates.instruction_is_empty(self.known_max) {
            self.known_max -= 1;
        }
        while self.known_min <= self.known_max && templates.instruction_is_empty(self.known_min) {
            self.known_min += 1;
        }
        if self.known_max < self.known_min {
            self.known_max = -1;
            self.known_min = i32::MAX;
        }
    }

    /// Earliest cycle from `cycle` on at which `node` can be placed
    pub fn earliest_cycle(
        &mut self,
        env: &mut PlanEnv<'_>,
        cycle: i32,
        node: NodeId,
        request: AssignRequest,
    ) -> RmResult<CycleBound> {
        let cycle = cycle.max(self.known_max - self.scheduling_window).max(0);
        let mut min_cycle = match self.pipeline_earliest(env, cycle, node, &request)? {
            CycleBound::Cycle(c) => c.max(cycle),
            other => return Ok(other),
        };
        let last_to_test = self.largest_cycle(&*env.store);
        while !self.can_assign(env, min_cycle, node, request)? {
            if min_cycle > last_to_test + 1 {
                log::debug!("[director] {} does not fit even an empty instruction", node);
                return Ok(CycleBound::Infeasible);
            }
            min_cycle = match self.pipeline_earliest(env, min_cycle + 1, node, &request)? {
                CycleBound::Cycle(c) => c,
                other => return Ok(other),
            };
        }
        log::debug!("[director] earliest {} from {} = {}", node, cycle, min_cycle);
        Ok(CycleBound::Cycle(min_cycle))
    }

    /// Latest cycle not after `cycle` at which `node` can be placed
    pub fn latest_cycle(
        &mut self,
        env: &mut PlanEnv<'_>,
        cycle: i32,
        node: NodeId,
        request: AssignRequest,
    ) -> RmResult<CycleBound> {
        let pipeline = self.pipeline_broker_latest(env, cycle, node, &request)?;
        let max_cycle = match pipeline {
            CycleBound::Infeasible => return Ok(CycleBound::Infeasible),
            CycleBound::Unbounded if cycle == i32::MAX => return Ok(CycleBound::Unbounded),
            CycleBound::Unbounded => cycle,
            CycleBound::Cycle(c) => c.min(cycle),
        };
        let mut last_to_test = self.largest_cycle(&*env.store);
        if last_to_test == 0 {
            last_to_test = cycle;
        }
        let longest = self
            .plan
            .pipeline_broker()
            .map(|p| p.longest_latency())
            .unwrap_or(0);
        let known_min = cycle.min(self.known_min);
        let limit = if known_min > longest + 1 { known_min - longest } else { 0 };

        let start = if max_cycle <= last_to_test {
            max_cycle
        } else {
            if self.can_assign(env, max_cycle, node, request)? {
                return Ok(CycleBound::Cycle(max_cycle));
            }
            last_to_test
        };
        let mut candidate = start;
        while candidate >= limit {
            if self.can_assign(env, candidate, node, request)? {
                log::debug!("[director] latest {} up to {} = {}", node, cycle, candidate);
                return Ok(CycleBound::Cycle(candidate));
            }
            candidate -= 1;
        }
        Ok(CycleBound::Infeasible)
    }

    fn pipeline_earliest(
        &self,
        env: &PlanEnv<'_>,
        cycle: i32,
        node: NodeId,
        request: &AssignRequest,
    ) -> RmResult<CycleBound> {
        let ctx = self.plan.context(env.machine, &*env.store, env.mapper, &*env.block);
        match self.plan.pipeline_broker() {
            Some(pipeline) => pipeline.earliest_cycle(&ctx, cycle, node, request),
            None => Ok(CycleBound::Cycle(cycle)),
        }
    }

    fn pipeline_broker_latest(
        &self,
        env: &PlanEnv<'_>,
        cycle: i32,
        node: NodeId,
        request: &AssignRequest,
    ) -> RmResult<CycleBound> {
        let ctx = self.plan.context(env.machine, &*env.store, env.mapper, &*env.block);
        match self.plan.pipeline_broker() {
            Some(pipeline) => pipeline.latest_cycle(&ctx, cycle, node, request),
            None if cycle == i32::MAX => Ok(CycleBound::Unbounded),
            None => Ok(CycleBound::Cycle(cycle)),
        }
    }

    /// Highest cycle in use, counting pipeline reservations
    pub fn largest_cycle(&self, store: &ResourceStore) -> i32 {
        let pipeline = self
            .plan
            .pipeline_broker()
            .and_then(|p| p.highest_known_cycle(store))
            .unwrap_or(-1);
        self.known_max.max(pipeline)
    }

    pub fn smallest_cycle(&self) -> i32 {
        self.known_min
    }

    /// Can every move of `nodes` be placed, in order, after the current high-water mark
    ///
    /// Moves are placed one after another at their earliest fitting cycle
    /// without revisiting earlier choices, then all of them are released.
    pub fn has_connection(&mut self, env: &mut PlanEnv<'_>, nodes: &[NodeId]) -> RmResult<bool> {
        let start = self.largest_cycle(&*env.store) + 1;
        let end = start.saturating_add(self.scheduling_window);
        let mut placed = Vec::with_capacity(nodes.len());
        let mut connected = true;
        for node in nodes {
            let mut fitted = false;
            for cycle in start..=end {
                if self.can_assign(env, cycle, *node, AssignRequest::default())? {
                    self.assign(env, cycle, *node, AssignRequest::default())?;
                    placed.push(*node);
                    fitted = true;
                    break;
                }
            }
            if !fitted {
                connected = false;
                break;
            }
        }
        for node in placed.into_iter().rev() {
            self.unassign(env, node)?;
        }
        Ok(connected)
    }

    /// Candidates the broker of `kind` offers once every broker before it
    /// has committed a resource; nothing stays assigned
    pub fn available_resources(
        &mut self,
        env: &mut PlanEnv<'_>,
        kind: BrokerKind,
        cycle: i32,
        node: NodeId,
        request: AssignRequest,
    ) -> RmResult<Vec<ResourceId>> {
        let moved = env.block.node(node);
        if cycle < 0 || moved.is_placed() {
            return Ok(Vec::new());
        }
        let original = Original::of(moved);
        let found = self.candidates_of(env, kind, cycle, node, request);
        let rolled_back = self.roll_back(env, node, original);
        let found = found?;
        rolled_back?;
        Ok(found)
    }

    fn candidates_of(
        &mut self,
        env: &mut PlanEnv<'_>,
        kind: BrokerKind,
        cycle: i32,
        node: NodeId,
        request: AssignRequest,
    ) -> RmResult<Vec<ResourceId>> {
        self.plan.set_request(env, cycle, node, request)?;
        loop {
            if self.plan.current_kind() == Some(kind) {
                let candidates = self.plan.current_candidates(env)?;
                if !candidates.is_empty() || self.plan.is_first_broker() {
                    return Ok(candidates);
                }
                self.plan.backtrack(env)?;
            } else if self.plan.is_tested_assignment_possible(env)? {
                if !self.plan.try_next_assignment(env)? {
                    continue;
                }
                if self.plan.is_last_broker() {
                    // the broker does not apply to this move
                    return Ok(Vec::new());
                }
                self.plan.advance()?;
            } else {
                if self.plan.is_first_broker() {
                    return Ok(Vec::new());
                }
                self.plan.backtrack(env)?;
            }
        }
    }

    pub fn brokers(&self) -> &[Broker] {
        self.plan.brokers()
    }

    pub fn clear(&mut self) {
        self.plan.clear();
        self.known_max = -1;
        self.known_min = i32::MAX;
        self.move_counts.clear();
        self.originals.clear();
    }
}

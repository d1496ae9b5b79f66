//! Stager
//!
//! Builder of the game plot
//!
//! Steps and stages are registered first, then placed with the fluent
//! sequence API (`next`, `repeat`, `loop_while`, `do_loop`, `gameover`,
//! `step`, blocks). Every placed stage gets an enclosing block holding a
//! stage marker followed by a block of its steps, so stages and steps can
//! both be placed flexibly. [`Stager::finalize`] resolves flexible
//! placements and flattens the block tree into the sequence.
//!
//! A stager with an empty sequence and registered next-deciders drives a
//! flexible plot instead (see [`crate::GamePlot`]).

use std::collections::{HashMap, HashSet};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::block::{
    BlockArena, BlockId, BlockKind, PlanItem, Positions, ROOT_BLOCK, Slot, StageItem,
};
use crate::config::PlanBindings;
use crate::error::{PlotError, PlotResult};
use crate::plan::{
    Callback, GAMEOVER_ID, LoopCondition, NextDecider, Properties, SequenceEntry, SequenceKind,
    Stage, StageDef, StagePatch, StageRef, Step, StepEntry, StepPatch,
};
use crate::rules;

/// Rendering of [`Stager::get_sequence`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceFormat {
    /// One label per stage: `id`, `id [x3]`, `id [loop]`, `gameover`
    Stages,
    /// One label per step: `stage.step`, suffixed like [`SequenceFormat::Stages`]
    Steps,
}

/// How [`Stager::set_state`] combines a state with the current one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateRule {
    /// Clear everything first
    #[default]
    Replace,
    /// Add to the current registrations and sequence
    Append,
}

/// Stages and steps excluded at finalize
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkipList {
    stages: HashSet<String>,
    steps: HashMap<String, HashSet<String>>,
}

impl SkipList {
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty() && self.steps.values().all(HashSet::is_empty)
    }

    fn contains(&self, stage: &str, step: Option<&str>) -> bool {
        match step {
            None => self.stages.contains(stage),
            Some(step) => self.steps.get(stage).is_some_and(|s| s.contains(step)),
        }
    }

    fn merge(&mut self, other: SkipList) {
        self.stages.extend(other.stages);
        for (stage, steps) in other.steps {
            self.steps.entry(stage).or_default().extend(steps);
        }
    }
}

/// Minimal standalone plan extracted by [`Stager::extract_stage`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanBundle {
    pub steps: HashMap<String, Step>,
    pub stages: HashMap<String, Stage>,
    pub sequence: Vec<SequenceEntry>,
}

/// Complete snapshot of a stager, see [`Stager::get_state`].
///
/// The JSON form leaves out functions and blocks. [`StagerState::from_json`]
/// binds step callbacks by step id and loop conditions by the id of the
/// sequence entry they drive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StagerState {
    pub steps: HashMap<String, Step>,
    pub stages: HashMap<String, Stage>,
    pub aliases: HashMap<String, String>,
    pub sequence: Vec<SequenceEntry>,
    #[serde(skip)]
    pub general_next_function: Option<NextDecider>,
    #[serde(skip)]
    pub next_functions: HashMap<String, NextDecider>,
    pub default_step_rule: String,
    pub default_globals: Properties,
    pub default_properties: Properties,
    #[serde(skip)]
    pub on_init: Option<Callback>,
    #[serde(skip)]
    pub on_gameover: Option<Callback>,
    #[serde(skip)]
    pub blocks: Option<BlockArena>,
    /// Sequence entries not produced by `blocks`
    #[serde(skip)]
    pub detached: Vec<SequenceEntry>,
    pub to_skip: SkipList,
    #[serde(skip)]
    pub default_callback: Option<Callback>,
}

impl StagerState {
    /// JSON export of the serializable parts
    pub fn to_json(&self) -> PlotResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load a [`StagerState::to_json`] export, taking functions from
    /// `bindings`
    pub fn from_json(json: &str, bindings: &PlanBindings) -> PlotResult<Self> {
        let mut state: StagerState = serde_json::from_str(json)?;
        for step in state.steps.values_mut() {
            step.callback = bindings.resolve_callback(&step.id)?;
        }
        for entry in &mut state.sequence {
            if let SequenceKind::Loop { condition } | SequenceKind::DoLoop { condition } =
                &mut entry.kind
            {
                *condition = bindings.resolve_condition(&entry.id)?;
            }
        }
        if state.default_callback.is_none() {
            state.default_callback = bindings.default_callback.clone();
        }
        log::debug!(
            "Stager state loaded from JSON: {} steps, {} stages, {} sequence entries",
            state.steps.len(),
            state.stages.len(),
            state.sequence.len()
        );
        Ok(state)
    }
}

/// Game plot builder
#[derive(Debug, Clone)]
pub struct Stager {
    steps: HashMap<String, Step>,
    stages: HashMap<String, Stage>,
    /// alias -> stage id
    aliases: HashMap<String, String>,
    sequence: Vec<SequenceEntry>,
    /// Entries loaded by `set_state` without blocks; appended at finalize
    detached: Vec<SequenceEntry>,

    blocks: BlockArena,
    open: Vec<BlockId>,
    open_backup: Option<Vec<BlockId>>,
    current_stage: Option<String>,
    /// Sequence ids already placed
    placed: HashSet<String>,
    to_skip: SkipList,

    general_next: Option<NextDecider>,
    next_functions: HashMap<String, NextDecider>,

    default_step_rule: String,
    default_globals: Properties,
    default_properties: Properties,
    default_callback: Option<Callback>,
    on_init: Option<Callback>,
    on_gameover: Option<Callback>,

    finalized: bool,
    rng: ChaCha8Rng,
}

impl Default for Stager {
    fn default() -> Self {
        Self::new()
    }
}

impl Stager {
    /// Empty stager; flexible placements use an OS-seeded RNG
    pub fn new() -> Self {
        Self::with_rng(ChaCha8Rng::from_os_rng())
    }

    /// Empty stager with reproducible flexible placements
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(ChaCha8Rng::seed_from_u64(seed))
    }

    fn with_rng(rng: ChaCha8Rng) -> Self {
        Self {
            steps: HashMap::new(),
            stages: HashMap::new(),
            aliases: HashMap::new(),
            sequence: Vec::new(),
            detached: Vec::new(),
            blocks: BlockArena::new(),
            open: vec![ROOT_BLOCK],
            open_backup: None,
            current_stage: None,
            placed: HashSet::new(),
            to_skip: SkipList::default(),
            general_next: None,
            next_functions: HashMap::new(),
            default_step_rule: rules::SOLO.to_string(),
            default_globals: Properties::new(),
            default_properties: Properties::new(),
            default_callback: None,
            on_init: None,
            on_gameover: None,
            finalized: false,
            rng,
        }
    }

    fn check_open(&self, op: &'static str) -> PlotResult<()> {
        if self.finalized {
            Err(PlotError::Finalized(op))
        } else {
            Ok(())
        }
    }

    fn check_id(kind: &str, id: &str) -> PlotResult<()> {
        if id.trim().is_empty() {
            return Err(PlotError::InvalidId(format!("{} id must be a non-empty string", kind)));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // REGISTRATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Register a step
    pub fn add_step(&mut self, step: Step) -> PlotResult<&mut Self> {
        self.check_open("add_step")?;
        Self::check_id("step", &step.id)?;
        if self.steps.contains_key(&step.id) {
            return Err(PlotError::DuplicateId {
                kind: "step",
                id: step.id,
            });
        }
        self.steps.insert(step.id.clone(), step);
        Ok(self)
    }

    /// Register a stage. Inline steps are registered with it; a callback
    /// stage registers a step of the same id.
    pub fn add_stage(&mut self, def: StageDef) -> PlotResult<&mut Self> {
        self.check_open("add_stage")?;
        Self::check_id("stage", &def.id)?;
        let invalid = |reason: &str| PlotError::InvalidStage {
            id: def.id.clone(),
            reason: reason.to_string(),
        };
        if self.stages.contains_key(&def.id) || self.aliases.contains_key(&def.id) {
            return Err(PlotError::DuplicateId {
                kind: "stage",
                id: def.id.clone(),
            });
        }
        if def.rounds == 0 {
            return Err(invalid("rounds must be at least 1"));
        }

        let mut new_steps = Vec::new();
        let step_ids = match (&def.callback, def.steps.is_empty()) {
            (Some(_), false) => return Err(invalid("give either steps or a callback, not both")),
            (None, true) => return Err(invalid("steps must be a non-empty list")),
            (Some(callback), true) => {
                new_steps.push(Step::new(def.id.clone(), callback.clone()));
                vec![def.id.clone()]
            }
            (None, false) => {
                let mut ids = Vec::with_capacity(def.steps.len());
                for entry in &def.steps {
                    Self::check_id("step", entry.id())?;
                    if let StepEntry::Inline(step) = entry {
                        new_steps.push(step.clone());
                    }
                    ids.push(entry.id().to_string());
                }
                ids
            }
        };

        let mut seen = HashSet::new();
        for step in &new_steps {
            if self.steps.contains_key(&step.id) || !seen.insert(step.id.as_str()) {
                return Err(PlotError::DuplicateId {
                    kind: "step",
                    id: step.id.clone(),
                });
            }
        }
        for step in new_steps {
            self.steps.insert(step.id.clone(), step);
        }

        self.stages.insert(
            def.id.clone(),
            Stage {
                id: def.id,
                steps: step_ids,
                rounds: def.rounds,
                globals: def.globals,
                properties: def.properties,
            },
        );
        Ok(self)
    }

    /// Update a registered step with a shallow merge
    pub fn extend_step(&mut self, id: &str, patch: StepPatch) -> PlotResult<&mut Self> {
        self.check_open("extend_step")?;
        let step = self
            .steps
            .get_mut(id)
            .ok_or_else(|| PlotError::UnknownStep(id.to_string()))?;
        step.globals.extend(patch.globals);
        step.properties.extend(patch.properties);
        Ok(self)
    }

    /// Replace a registered step with the result of `update`, which
    /// receives a copy. Id and callback must stay the same.
    pub fn extend_step_with<F>(&mut self, id: &str, update: F) -> PlotResult<&mut Self>
    where
        F: FnOnce(Step) -> Step,
    {
        self.check_open("extend_step")?;
        let current = self
            .steps
            .get(id)
            .ok_or_else(|| PlotError::UnknownStep(id.to_string()))?;
        let updated = update(current.clone());
        if updated.id != current.id {
            return Err(PlotError::ImmutableField {
                id: id.to_string(),
                field: "id",
            });
        }
        if !updated.callback.ptr_eq(&current.callback) {
            return Err(PlotError::ImmutableField {
                id: id.to_string(),
                field: "cb",
            });
        }
        self.steps.insert(id.to_string(), updated);
        Ok(self)
    }

    /// Update a registered stage with a shallow merge
    pub fn extend_stage(&mut self, id: &str, patch: StagePatch) -> PlotResult<&mut Self> {
        self.check_open("extend_stage")?;
        let mut stage = self
            .get_stage(id)
            .cloned()
            .ok_or_else(|| PlotError::UnknownStage(id.to_string()))?;
        if let Some(steps) = patch.steps {
            stage.steps = steps;
        }
        if let Some(rounds) = patch.rounds {
            stage.rounds = rounds;
        }
        stage.globals.extend(patch.globals);
        stage.properties.extend(patch.properties);
        self.replace_stage(id, stage)
    }

    /// Replace a registered stage with the result of `update`, which
    /// receives a copy. The id must stay the same.
    pub fn extend_stage_with<F>(&mut self, id: &str, update: F) -> PlotResult<&mut Self>
    where
        F: FnOnce(Stage) -> Stage,
    {
        self.check_open("extend_stage")?;
        let current = self
            .get_stage(id)
            .cloned()
            .ok_or_else(|| PlotError::UnknownStage(id.to_string()))?;
        let stage_id = current.id.clone();
        let updated = update(current);
        if updated.id != stage_id {
            return Err(PlotError::ImmutableField {
                id: stage_id,
                field: "id",
            });
        }
        self.replace_stage(id, updated)
    }

    fn replace_stage(&mut self, id: &str, stage: Stage) -> PlotResult<&mut Self> {
        if stage.steps.is_empty() {
            return Err(PlotError::InvalidStage {
                id: id.to_string(),
                reason: "steps must be a non-empty list".to_string(),
            });
        }
        if stage.rounds == 0 {
            return Err(PlotError::InvalidStage {
                id: id.to_string(),
                reason: "rounds must be at least 1".to_string(),
            });
        }
        self.stages.insert(stage.id.clone(), stage);
        Ok(self)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SEQUENCE BUILDING
    // ═══════════════════════════════════════════════════════════════════════

    /// Append a plain stage
    pub fn next(&mut self, stage: impl Into<StageRef>) -> PlotResult<&mut Self> {
        self.next_at(stage, Positions::Linear)
    }

    /// Append a plain stage with a placement constraint
    pub fn next_at(
        &mut self,
        stage: impl Into<StageRef>,
        positions: impl Into<Positions>,
    ) -> PlotResult<&mut Self> {
        self.place_stage("next", stage.into(), SequenceKind::Plain, positions.into())
    }

    /// Same as [`Stager::next`]
    pub fn stage(&mut self, stage: impl Into<StageRef>) -> PlotResult<&mut Self> {
        self.next(stage)
    }

    /// Append a stage repeated `num` times
    pub fn repeat(&mut self, stage: impl Into<StageRef>, num: u32) -> PlotResult<&mut Self> {
        self.repeat_at(stage, num, Positions::Linear)
    }

    pub fn repeat_at(
        &mut self,
        stage: impl Into<StageRef>,
        num: u32,
        positions: impl Into<Positions>,
    ) -> PlotResult<&mut Self> {
        let stage: StageRef = stage.into();
        if num == 0 {
            return Err(PlotError::InvalidStage {
                id: format!("{:?}", stage),
                reason: "repeat count must be at least 1".to_string(),
            });
        }
        self.place_stage("repeat", stage, SequenceKind::Repeat { num }, positions.into())
    }

    /// Append a stage played while `condition` holds, possibly never
    pub fn loop_while(
        &mut self,
        stage: impl Into<StageRef>,
        condition: LoopCondition,
    ) -> PlotResult<&mut Self> {
        self.loop_at(stage, condition, Positions::Linear)
    }

    pub fn loop_at(
        &mut self,
        stage: impl Into<StageRef>,
        condition: LoopCondition,
        positions: impl Into<Positions>,
    ) -> PlotResult<&mut Self> {
        self.place_stage("loop", stage.into(), SequenceKind::Loop { condition }, positions.into())
    }

    /// Append a stage played once, then while `condition` holds
    pub fn do_loop(
        &mut self,
        stage: impl Into<StageRef>,
        condition: LoopCondition,
    ) -> PlotResult<&mut Self> {
        self.do_loop_at(stage, condition, Positions::Linear)
    }

    pub fn do_loop_at(
        &mut self,
        stage: impl Into<StageRef>,
        condition: LoopCondition,
        positions: impl Into<Positions>,
    ) -> PlotResult<&mut Self> {
        let kind = SequenceKind::DoLoop { condition };
        self.place_stage("doLoop", stage.into(), kind, positions.into())
    }

    /// Append the end of the game
    pub fn gameover(&mut self) -> PlotResult<&mut Self> {
        self.check_open("gameover")?;
        self.close_stage_blocks()?;
        let parent = self.top();
        self.blocks.add(
            parent,
            Slot::Item(PlanItem::Stage(StageItem {
                id: GAMEOVER_ID.to_string(),
                stage: GAMEOVER_ID.to_string(),
                kind: SequenceKind::Gameover,
            })),
            Positions::Linear,
        )?;
        self.current_stage = None;
        Ok(self)
    }

    /// Add a step to the stage placed last
    pub fn step(&mut self, step: impl Into<StepEntry>) -> PlotResult<&mut Self> {
        self.step_at(step, Positions::Linear)
    }

    pub fn step_at(
        &mut self,
        step: impl Into<StepEntry>,
        positions: impl Into<Positions>,
    ) -> PlotResult<&mut Self> {
        self.check_open("step")?;
        let entry = step.into();
        Self::check_id("step", entry.id())?;
        let stage = self.step_context("step")?;
        let block = self.top();
        if self.blocks.get(block).is_some_and(|b| b.has_item(entry.id())) {
            return Err(PlotError::DuplicateId {
                kind: "step in block",
                id: entry.id().to_string(),
            });
        }
        let step_id = entry.id().to_string();
        if let StepEntry::Inline(step) = entry {
            self.add_step(step)?;
        }
        self.blocks.add(
            block,
            Slot::Item(PlanItem::Step {
                stage,
                step: step_id,
            }),
            positions.into(),
        )?;
        Ok(self)
    }

    /// Open a block grouping the stages placed until [`Stager::end_block`]
    pub fn begin_block(
        &mut self,
        id: &str,
        positions: impl Into<Positions>,
    ) -> PlotResult<&mut Self> {
        self.check_open("begin_block")?;
        Self::check_id("block", id)?;
        self.close_stage_blocks()?;
        let parent = self.top();
        let block = self.blocks.nest(parent, id, BlockKind::StageGroup, positions.into())?;
        self.open.push(block);
        Ok(self)
    }

    /// Open a block grouping steps of the stage placed last
    pub fn begin_step_block(
        &mut self,
        id: &str,
        positions: impl Into<Positions>,
    ) -> PlotResult<&mut Self> {
        self.check_open("begin_step_block")?;
        Self::check_id("block", id)?;
        self.step_context("begin_step_block")?;
        let parent = self.top();
        let block = self.blocks.nest(parent, id, BlockKind::StepGroup, positions.into())?;
        self.open.push(block);
        Ok(self)
    }

    /// Close the innermost block opened with `begin_block` or
    /// `begin_step_block`
    pub fn end_block(&mut self) -> PlotResult<&mut Self> {
        self.check_open("end_block")?;
        let user_block = self.open.iter().rposition(|id| {
            matches!(
                self.blocks.get(*id).map(|b| b.kind()),
                Some(BlockKind::StageGroup | BlockKind::StepGroup)
            )
        });
        let Some(index) = user_block else {
            return Err(PlotError::Block("end_block: no open block".to_string()));
        };
        self.open.truncate(index);
        if !matches!(self.top_kind(), Some(BlockKind::Steps | BlockKind::StepGroup)) {
            self.current_stage = None;
        }
        Ok(self)
    }

    fn top(&self) -> BlockId {
        self.open.last().copied().unwrap_or(ROOT_BLOCK)
    }

    fn top_kind(&self) -> Option<BlockKind> {
        self.blocks.get(self.top()).map(|b| b.kind())
    }

    /// Sequence id of the stage whose steps are open for additions
    fn step_context(&self, op: &'static str) -> PlotResult<String> {
        match (self.top_kind(), &self.current_stage) {
            (Some(BlockKind::Steps | BlockKind::StepGroup), Some(stage)) => Ok(stage.clone()),
            _ => Err(PlotError::NoCurrentStage(op)),
        }
    }

    /// Close the automatic blocks of the stage placed last
    fn close_stage_blocks(&mut self) -> PlotResult<()> {
        while let Some(kind) = self.top_kind() {
            match kind {
                BlockKind::Stage | BlockKind::Steps => {
                    self.open.pop();
                }
                BlockKind::StepGroup => {
                    let id = self.blocks.get(self.top()).map(|b| b.id().to_string());
                    return Err(PlotError::Block(format!(
                        "step block '{}' must be closed first",
                        id.unwrap_or_default()
                    )));
                }
                BlockKind::Root | BlockKind::StageGroup => break,
            }
        }
        if self.open.is_empty() {
            self.open.push(ROOT_BLOCK);
        }
        self.current_stage = None;
        Ok(())
    }

    /// Resolve a stage argument to `(sequence id, stage id)`
    fn resolve_stage_ref(&mut self, stage: StageRef) -> PlotResult<(String, String)> {
        match stage {
            StageRef::ById(id) => {
                Self::check_id("stage", &id)?;
                let stage_id = self.ensure_stage(&id)?;
                Ok((id, stage_id))
            }
            StageRef::ByAlias { id, alias } => {
                Self::check_id("stage", &id)?;
                Self::check_id("alias", &alias)?;
                if alias == id {
                    return Err(PlotError::InvalidId(format!(
                        "alias must differ from stage id: {}",
                        alias
                    )));
                }
                if self.stages.contains_key(&alias) || self.aliases.contains_key(&alias) {
                    return Err(PlotError::DuplicateId {
                        kind: "alias",
                        id: alias,
                    });
                }
                let stage_id = self.ensure_stage(&id)?;
                self.aliases.insert(alias.clone(), stage_id.clone());
                Ok((alias, stage_id))
            }
            StageRef::Inline(def) => {
                let id = def.id.clone();
                self.add_stage(def)?;
                Ok((id.clone(), id))
            }
            StageRef::InlineStep(step) => {
                let id = step.id.clone();
                if self.stages.contains_key(&id) {
                    return Err(PlotError::DuplicateId { kind: "stage", id });
                }
                self.add_step(step)?;
                self.add_stage(StageDef::new(id.clone()).step(id.as_str()))?;
                Ok((id.clone(), id))
            }
        }
    }

    /// Registered stage id for `id`, creating a single-step stage from the
    /// default callback when nothing is registered under that name
    fn ensure_stage(&mut self, id: &str) -> PlotResult<String> {
        if let Some(stage) = self.get_stage(id) {
            return Ok(stage.id.clone());
        }
        let Some(callback) = self.default_callback.clone() else {
            return Err(PlotError::UnknownStage(id.to_string()));
        };
        if !self.steps.contains_key(id) {
            self.add_step(Step::new(id, callback))?;
        }
        self.add_stage(StageDef::new(id).step(id))?;
        Ok(id.to_string())
    }

    fn place_stage(
        &mut self,
        op: &'static str,
        stage: StageRef,
        kind: SequenceKind,
        positions: Positions,
    ) -> PlotResult<&mut Self> {
        self.check_open(op)?;
        self.close_stage_blocks()?;
        let (seq_id, stage_id) = self.resolve_stage_ref(stage)?;
        if self.placed.contains(&seq_id) {
            return Err(PlotError::DuplicateId {
                kind: "sequence (use \"id AS alias\" to place a stage twice)",
                id: seq_id,
            });
        }

        let parent = self.top();
        let enclosing = self
            .blocks
            .nest(parent, format!("__stage_{}", seq_id), BlockKind::Stage, positions)?;
        self.blocks.add(
            enclosing,
            Slot::Item(PlanItem::Stage(StageItem {
                id: seq_id.clone(),
                stage: stage_id.clone(),
                kind,
            })),
            Positions::Linear,
        )?;
        let steps_block = self.blocks.nest(
            enclosing,
            format!("__steps_{}", seq_id),
            BlockKind::Steps,
            Positions::Linear,
        )?;

        let step_ids = self
            .stages
            .get(&stage_id)
            .map(|s| s.steps.clone())
            .unwrap_or_default();
        for step in step_ids {
            let known = self.blocks.get(steps_block).is_some_and(|b| b.has_item(&step));
            if !known {
                self.blocks.add(
                    steps_block,
                    Slot::Item(PlanItem::Step {
                        stage: seq_id.clone(),
                        step,
                    }),
                    Positions::Linear,
                )?;
            }
        }

        self.open.push(enclosing);
        self.open.push(steps_block);
        self.placed.insert(seq_id.clone());
        self.current_stage = Some(seq_id);
        Ok(self)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SKIP
    // ═══════════════════════════════════════════════════════════════════════

    /// Exclude a stage, or one step of it, from the next finalize
    pub fn skip(&mut self, stage: &str, step: Option<&str>) -> PlotResult<&mut Self> {
        self.check_open("skip")?;
        match step {
            None => {
                self.to_skip.stages.insert(stage.to_string());
            }
            Some(step) => {
                self.to_skip
                    .steps
                    .entry(stage.to_string())
                    .or_default()
                    .insert(step.to_string());
            }
        }
        Ok(self)
    }

    /// Undo [`Stager::skip`]
    pub fn unskip(&mut self, stage: &str, step: Option<&str>) -> PlotResult<&mut Self> {
        self.check_open("unskip")?;
        match step {
            None => {
                self.to_skip.stages.remove(stage);
            }
            Some(step) => {
                if let Some(steps) = self.to_skip.steps.get_mut(stage) {
                    steps.remove(step);
                }
            }
        }
        Ok(self)
    }

    pub fn is_skipped(&self, stage: &str, step: Option<&str>) -> bool {
        self.to_skip.contains(stage, step)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // FINALIZE
    // ═══════════════════════════════════════════════════════════════════════

    /// Resolve flexible placements and build the sequence. Idempotent.
    pub fn finalize(&mut self) -> PlotResult<()> {
        if self.finalized {
            return Ok(());
        }
        self.blocks.backup_all();
        self.open_backup = Some(std::mem::take(&mut self.open));

        match self.build_sequence() {
            Ok(sequence) => {
                log::debug!(
                    "Stager finalized: {} sequence entries, {} stages, {} steps",
                    sequence.len(),
                    self.stages.len(),
                    self.steps.len()
                );
                self.sequence = sequence;
                self.finalized = true;
                Ok(())
            }
            Err(e) => {
                self.blocks.restore_all();
                self.open = self.open_backup.take().unwrap_or_else(|| vec![ROOT_BLOCK]);
                Err(e)
            }
        }
    }

    fn build_sequence(&mut self) -> PlotResult<Vec<SequenceEntry>> {
        self.blocks.finalize_all(&mut self.rng)?;
        self.blocks.rewind_all();

        let mut sequence: Vec<SequenceEntry> = Vec::new();
        // (sequence index, registered stage id) of the entry receiving steps
        let mut current: Option<(usize, String)> = None;

        while let Some(item) = self.blocks.next(ROOT_BLOCK) {
            match item {
                PlanItem::Stage(stage) => {
                    let skipped =
                        self.is_skipped(&stage.id, None) || self.is_skipped(&stage.stage, None);
                    if skipped && !stage.kind.is_gameover() {
                        log::trace!("Skipping stage '{}'", stage.id);
                        current = None;
                        continue;
                    }
                    sequence.push(SequenceEntry {
                        id: stage.id,
                        kind: stage.kind,
                        steps: Vec::new(),
                    });
                    current = Some((sequence.len() - 1, stage.stage));
                }
                PlanItem::Step { stage, step } => {
                    let Some((index, stage_id)) = &current else {
                        continue;
                    };
                    if self.is_skipped(&stage, Some(&step))
                        || self.is_skipped(stage_id, Some(&step))
                    {
                        log::trace!("Skipping step '{}.{}'", stage, step);
                        continue;
                    }
                    self.ensure_step(&step)?;
                    if let Some(entry) = sequence.get_mut(*index) {
                        entry.steps.push(step);
                    }
                }
            }
        }

        sequence.extend(self.without_skipped(&self.detached));

        sequence.retain(|entry| {
            let keep = !entry.steps.is_empty() || entry.kind.is_gameover();
            if !keep {
                log::warn!("Stage '{}' has no steps left after skipping; dropped", entry.id);
            }
            keep
        });
        Ok(sequence)
    }

    /// `entries` without skipped stages and steps
    fn without_skipped(&self, entries: &[SequenceEntry]) -> Vec<SequenceEntry> {
        entries
            .iter()
            .filter(|entry| entry.kind.is_gameover() || !self.is_skipped(&entry.id, None))
            .map(|entry| {
                let mut entry = entry.clone();
                let id = entry.id.clone();
                entry.steps.retain(|step| !self.is_skipped(&id, Some(step)));
                entry
            })
            .filter(|entry| entry.kind.is_gameover() || !entry.steps.is_empty())
            .collect()
    }

    /// Register an unknown step with the default callback
    fn ensure_step(&mut self, id: &str) -> PlotResult<()> {
        if self.steps.contains_key(id) {
            return Ok(());
        }
        match &self.default_callback {
            Some(callback) => {
                log::debug!("Step '{}' registered with the default callback", id);
                self.steps.insert(id.to_string(), Step::new(id, callback.clone()));
                Ok(())
            }
            None => Err(PlotError::UnknownStep(id.to_string())),
        }
    }

    /// Undo [`Stager::finalize`] so skip lists can change and the plan can
    /// be finalized again
    pub fn reset(&mut self) {
        if !self.finalized {
            return;
        }
        self.blocks.restore_all();
        self.open = self.open_backup.take().unwrap_or_else(|| vec![ROOT_BLOCK]);
        self.sequence.clear();
        self.finalized = false;
        log::debug!("Stager reset");
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    // ═══════════════════════════════════════════════════════════════════════
    // FLEXIBLE MODE
    // ═══════════════════════════════════════════════════════════════════════

    /// Decider consulted for the next stage when no stage-specific one is
    /// registered
    pub fn register_general_next(&mut self, decider: NextDecider) -> PlotResult<&mut Self> {
        self.check_open("register_general_next")?;
        self.general_next = Some(decider);
        Ok(self)
    }

    /// Decider consulted after the given stage
    pub fn register_next(&mut self, stage: &str, decider: NextDecider) -> PlotResult<&mut Self> {
        self.check_open("register_next")?;
        Self::check_id("stage", stage)?;
        self.next_functions.insert(stage.to_string(), decider);
        Ok(self)
    }

    pub fn general_next(&self) -> Option<&NextDecider> {
        self.general_next.as_ref()
    }

    pub fn next_function(&self, stage: &str) -> Option<&NextDecider> {
        self.next_functions.get(stage)
    }

    pub fn has_next_functions(&self) -> bool {
        !self.next_functions.is_empty()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DEFAULTS & HOOKS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn set_default_step_rule(&mut self, rule: impl Into<String>) -> &mut Self {
        self.default_step_rule = rule.into();
        self
    }

    pub fn default_step_rule(&self) -> &str {
        &self.default_step_rule
    }

    pub fn set_default_globals(&mut self, globals: Properties) -> &mut Self {
        self.default_globals = globals;
        self
    }

    pub fn default_globals(&self) -> &Properties {
        &self.default_globals
    }

    pub fn set_default_properties(&mut self, properties: Properties) -> &mut Self {
        self.default_properties = properties;
        self
    }

    pub fn default_properties(&self) -> &Properties {
        &self.default_properties
    }

    pub(crate) fn default_properties_mut(&mut self) -> &mut Properties {
        &mut self.default_properties
    }

    /// Callback given to steps referenced by id but never registered
    pub fn set_default_callback(&mut self, callback: Callback) -> &mut Self {
        self.default_callback = Some(callback);
        self
    }

    pub fn default_callback(&self) -> Option<&Callback> {
        self.default_callback.as_ref()
    }

    pub fn set_on_init(&mut self, callback: Callback) -> &mut Self {
        self.on_init = Some(callback);
        self
    }

    pub fn on_init(&self) -> Option<&Callback> {
        self.on_init.as_ref()
    }

    pub fn set_on_gameover(&mut self, callback: Callback) -> &mut Self {
        self.on_gameover = Some(callback);
        self
    }

    pub fn on_gameover(&self) -> Option<&Callback> {
        self.on_gameover.as_ref()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LOOKUP
    // ═══════════════════════════════════════════════════════════════════════

    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    pub(crate) fn get_step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.get_mut(id)
    }

    /// Stage by id or alias
    pub fn get_stage(&self, id: &str) -> Option<&Stage> {
        let id = self.aliases.get(id).map(String::as_str).unwrap_or(id);
        self.stages.get(id)
    }

    pub(crate) fn get_stage_mut(&mut self, id: &str) -> Option<&mut Stage> {
        let id = self.aliases.get(id).cloned().unwrap_or_else(|| id.to_string());
        self.stages.get_mut(&id)
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.values()
    }

    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.values()
    }

    /// The finalized plan; empty before finalize and in flexible mode
    pub fn sequence(&self) -> &[SequenceEntry] {
        &self.sequence
    }

    /// Human-readable labels of the sequence
    pub fn get_sequence(&self, format: SequenceFormat) -> Vec<String> {
        let suffix = |kind: &SequenceKind| match kind {
            SequenceKind::Repeat { num } => format!(" [x{}]", num),
            SequenceKind::Loop { .. } => " [loop]".to_string(),
            SequenceKind::DoLoop { .. } => " [doLoop]".to_string(),
            SequenceKind::Plain | SequenceKind::Gameover => String::new(),
        };
        let mut out = Vec::new();
        for entry in &self.sequence {
            if entry.kind.is_gameover() {
                out.push("gameover".to_string());
                continue;
            }
            match format {
                SequenceFormat::Stages => out.push(format!("{}{}", entry.id, suffix(&entry.kind))),
                SequenceFormat::Steps => {
                    for step in &entry.steps {
                        out.push(format!("{}.{}{}", entry.id, step, suffix(&entry.kind)));
                    }
                }
            }
        }
        out
    }

    /// Standalone bundle with the given stages and their steps, plus a
    /// plain one-entry-per-stage sequence when `use_sequence` is set
    pub fn extract_stage(&self, ids: &[&str], use_sequence: bool) -> PlotResult<PlanBundle> {
        let mut bundle = PlanBundle::default();
        for id in ids {
            let stage = self
                .get_stage(id)
                .ok_or_else(|| PlotError::UnknownStage(id.to_string()))?;
            for step_id in &stage.steps {
                let step = self
                    .get_step(step_id)
                    .ok_or_else(|| PlotError::UnknownStep(step_id.clone()))?;
                bundle.steps.insert(step_id.clone(), step.clone());
            }
            bundle.stages.insert(stage.id.clone(), stage.clone());
            if use_sequence {
                bundle.sequence.push(SequenceEntry {
                    id: stage.id.clone(),
                    kind: SequenceKind::Plain,
                    steps: stage.steps.clone(),
                });
            }
        }
        Ok(bundle)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // STATE
    // ═══════════════════════════════════════════════════════════════════════

    /// Snapshot of everything the stager holds
    pub fn get_state(&self) -> StagerState {
        StagerState {
            steps: self.steps.clone(),
            stages: self.stages.clone(),
            aliases: self.aliases.clone(),
            sequence: self.sequence.clone(),
            general_next_function: self.general_next.clone(),
            next_functions: self.next_functions.clone(),
            default_step_rule: self.default_step_rule.clone(),
            default_globals: self.default_globals.clone(),
            default_properties: self.default_properties.clone(),
            on_init: self.on_init.clone(),
            on_gameover: self.on_gameover.clone(),
            blocks: Some(self.blocks.clone()),
            detached: self.detached.clone(),
            to_skip: self.to_skip.clone(),
            default_callback: self.default_callback.clone(),
        }
    }

    /// Load a snapshot. A state with a non-empty sequence leaves the
    /// stager finalized.
    ///
    /// Only a replacing state with blocks rebuilds its sequence on the next
    /// [`Stager::reset`]/[`Stager::finalize`]. Any other loaded entry is kept
    /// aside and appended after the entries built from blocks.
    pub fn set_state(&mut self, state: StagerState, rule: UpdateRule) -> PlotResult<()> {
        let backed = rule == UpdateRule::Replace && state.blocks.is_some();
        match rule {
            UpdateRule::Replace => {
                let rng = self.rng.clone();
                *self = Self::with_rng(rng);
                self.steps = state.steps;
                self.stages = state.stages;
                self.aliases = state.aliases;
                self.blocks = state.blocks.unwrap_or_default();
                self.to_skip = state.to_skip;
                self.default_globals = state.default_globals;
                self.default_properties = state.default_properties;
            }
            UpdateRule::Append => {
                for id in state.steps.keys() {
                    if self.steps.contains_key(id) {
                        return Err(PlotError::DuplicateId {
                            kind: "step",
                            id: id.clone(),
                        });
                    }
                }
                for id in state.stages.keys().chain(state.aliases.keys()) {
                    if self.stages.contains_key(id) || self.aliases.contains_key(id) {
                        return Err(PlotError::DuplicateId {
                            kind: "stage",
                            id: id.clone(),
                        });
                    }
                }
                self.steps.extend(state.steps);
                self.stages.extend(state.stages);
                self.aliases.extend(state.aliases);
                self.to_skip.merge(state.to_skip);
                self.default_globals.extend(state.default_globals);
                self.default_properties.extend(state.default_properties);
            }
        }

        for entry in &state.sequence {
            self.placed.insert(entry.id.clone());
        }
        if backed {
            self.sequence = state.sequence;
            self.detached = state.detached;
        } else {
            if self.finalized {
                let kept = self.without_skipped(&state.sequence);
                self.sequence.extend(kept);
            }
            self.detached.extend(state.sequence);
        }
        if state.general_next_function.is_some() {
            self.general_next = state.general_next_function;
        }
        self.next_functions.extend(state.next_functions);
        if !state.default_step_rule.is_empty() {
            self.default_step_rule = state.default_step_rule;
        }
        if state.on_init.is_some() {
            self.on_init = state.on_init;
        }
        if state.on_gameover.is_some() {
            self.on_gameover = state.on_gameover;
        }
        if state.default_callback.is_some() {
            self.default_callback = state.default_callback;
        }
        if backed && !self.sequence.is_empty() {
            self.open_backup = Some(std::mem::take(&mut self.open));
            self.finalized = true;
        } else if !self.finalized && !self.detached.is_empty() {
            self.finalize()?;
        }
        log::debug!(
            "Stager state loaded ({:?}): {} sequence entries",
            rule,
            self.sequence.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn stager() -> Stager {
        let mut s = Stager::with_seed(42);
        for id in ["a", "b", "c"] {
            s.add_step(Step::new(id, Callback::noop())).unwrap();
        }
        s.add_stage(StageDef::new("game").steps(["a", "b", "c"])).unwrap();
        s.add_stage(StageDef::with_callback("intro", Callback::noop())).unwrap();
        s.add_stage(StageDef::with_callback("outro", Callback::noop())).unwrap();
        s
    }

    fn ids(s: &Stager) -> Vec<String> {
        s.get_sequence(SequenceFormat::Stages)
    }

    #[test]
    fn test_add_step_validation() {
        let mut s = Stager::new();
        assert!(matches!(
            s.add_step(Step::new("", Callback::noop())),
            Err(PlotError::InvalidId(_))
        ));
        s.add_step(Step::new("x", Callback::noop())).unwrap();
        assert!(matches!(
            s.add_step(Step::new("x", Callback::noop())),
            Err(PlotError::DuplicateId { .. })
        ));
    }

    #[test]
    fn test_add_stage_validation() {
        let mut s = stager();
        assert!(s.add_stage(StageDef::new("empty")).is_err());
        let both = StageDef::with_callback("both", Callback::noop()).step("a");
        assert!(s.add_stage(both).is_err());
        assert!(s.add_stage(StageDef::new("game").step("a")).is_err());
        assert!(s.add_stage(StageDef::new("zero").step("a").rounds(0)).is_err());

        // callback stage registers a same-id step
        assert!(s.get_step("intro").is_some());
        assert_eq!(s.get_stage("intro").unwrap().steps, vec!["intro"]);
    }

    #[test]
    fn test_inline_steps_registered() {
        let mut s = Stager::new();
        let def = StageDef::new("quiz")
            .step(Step::new("q1", Callback::noop()))
            .step(Step::new("q2", Callback::noop()).with_property("timer", 3000));
        s.add_stage(def).unwrap();
        assert_eq!(s.get_step("q2").unwrap().properties["timer"], json!(3000));

        let dup = StageDef::new("other").step(Step::new("q1", Callback::noop()));
        assert!(s.add_stage(dup).is_err());
        assert!(s.get_stage("other").is_none());
    }

    #[test]
    fn test_linear_sequence() {
        let mut s = stager();
        s.next("intro")
            .unwrap()
            .repeat("game", 3)
            .unwrap()
            .next("outro")
            .unwrap()
            .gameover()
            .unwrap();
        s.finalize().unwrap();
        assert_eq!(ids(&s), vec!["intro", "game [x3]", "outro", "gameover"]);
        assert_eq!(s.sequence()[1].steps, vec!["a", "b", "c"]);
        assert_eq!(s.sequence()[1].num(), Some(3));
    }

    #[test]
    fn test_sequence_steps_labels() {
        let mut s = stager();
        s.next("intro").unwrap().loop_while("game", LoopCondition::new(|| false)).unwrap();
        s.finalize().unwrap();
        assert_eq!(
            s.get_sequence(SequenceFormat::Steps),
            vec!["intro.intro", "game.a [loop]", "game.b [loop]", "game.c [loop]"]
        );
    }

    #[test]
    fn test_builder_rejected_after_finalize() {
        let mut s = stager();
        s.next("intro").unwrap();
        s.finalize().unwrap();
        assert!(matches!(s.next("outro"), Err(PlotError::Finalized(_))));
        let added = s.add_step(Step::new("z", Callback::noop()));
        assert!(matches!(added, Err(PlotError::Finalized(_))));
        assert!(matches!(s.skip("intro", None), Err(PlotError::Finalized(_))));
        // finalize is idempotent
        s.finalize().unwrap();
    }

    #[test]
    fn test_duplicate_placement_needs_alias() {
        let mut s = stager();
        s.next("game").unwrap();
        assert!(s.next("game").is_err());
        s.next("game AS game2").unwrap();
        assert!(s.next("game AS game2").is_err());
        assert!(s.next("game AS game").is_err());
        s.finalize().unwrap();
        assert_eq!(ids(&s), vec!["game", "game2"]);
        assert_eq!(s.get_stage("game2").unwrap().id, "game");
    }

    #[test]
    fn test_unknown_stage_uses_default_callback() {
        let mut s = Stager::new();
        assert!(matches!(s.next("ghost"), Err(PlotError::UnknownStage(_))));
        s.set_default_callback(Callback::noop());
        s.next("ghost").unwrap();
        s.finalize().unwrap();
        assert_eq!(s.sequence()[0].steps, vec!["ghost"]);
    }

    #[test]
    fn test_unregistered_step_needs_default_callback() {
        let mut s = Stager::new();
        s.add_stage(StageDef::new("st").step("missing")).unwrap();
        s.next("st").unwrap();
        assert!(matches!(s.finalize(), Err(PlotError::UnknownStep(_))));
        assert!(!s.is_finalized());

        s.set_default_callback(Callback::noop());
        s.finalize().unwrap();
        assert!(s.get_step("missing").is_some());
    }

    #[test]
    fn test_custom_steps() {
        let mut s = stager();
        s.add_step(Step::new("d", Callback::noop())).unwrap();
        s.next("game").unwrap().step("d").unwrap();
        assert!(s.step("d").is_err());
        s.step(Step::new("e", Callback::noop())).unwrap();
        s.finalize().unwrap();
        assert_eq!(s.sequence()[0].steps, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_step_requires_stage() {
        let mut s = stager();
        assert!(matches!(s.step("a"), Err(PlotError::NoCurrentStage(_))));
        s.next("intro").unwrap().gameover().unwrap();
        assert!(matches!(s.step("a"), Err(PlotError::NoCurrentStage(_))));
    }

    #[test]
    fn test_skip_and_reset() {
        let mut s = stager();
        s.next("intro").unwrap().next("game").unwrap().next("outro").unwrap().gameover().unwrap();
        s.skip("intro", None).unwrap().skip("game", Some("b")).unwrap();
        assert!(s.is_skipped("intro", None));
        assert!(s.is_skipped("game", Some("b")));
        s.finalize().unwrap();
        assert_eq!(ids(&s), vec!["game", "outro", "gameover"]);
        assert_eq!(s.sequence()[0].steps, vec!["a", "c"]);

        s.reset();
        assert!(!s.is_finalized());
        assert!(s.sequence().is_empty());
        s.unskip("intro", None).unwrap().unskip("game", Some("b")).unwrap();
        s.finalize().unwrap();
        assert_eq!(ids(&s), vec!["intro", "game", "outro", "gameover"]);
        assert_eq!(s.sequence()[1].steps, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_gameover_never_skipped() {
        let mut s = stager();
        s.next("intro").unwrap().gameover().unwrap();
        s.skip(GAMEOVER_ID, None).unwrap();
        s.finalize().unwrap();
        assert_eq!(ids(&s), vec!["intro", "gameover"]);
    }

    #[test]
    fn test_all_steps_skipped_drops_entry() {
        let mut s = stager();
        s.next("intro").unwrap().next("outro").unwrap();
        s.skip("intro", Some("intro")).unwrap();
        s.finalize().unwrap();
        assert_eq!(ids(&s), vec!["outro"]);
    }

    #[test]
    fn test_flexible_stage_positions() {
        for seed in 0..16 {
            let mut s = Stager::with_seed(seed);
            for id in ["s1", "s2", "s3"] {
                s.add_stage(StageDef::with_callback(id, Callback::noop())).unwrap();
            }
            // s2 is more constrained and gets slot 0 before s1 is placed
            s.next_at("s1", "*").unwrap().next_at("s2", "0").unwrap().next("s3").unwrap();
            s.finalize().unwrap();
            assert_eq!(ids(&s), vec!["s2", "s1", "s3"]);
        }
    }

    #[test]
    fn test_unsatisfiable_positions_restore_builder() {
        let mut s = Stager::with_seed(1);
        for id in ["s1", "s2", "s3"] {
            s.add_stage(StageDef::with_callback(id, Callback::noop())).unwrap();
        }
        s.next("s1").unwrap().next_at("s2", "0").unwrap();
        let err = s.finalize().unwrap_err();
        assert!(matches!(err, PlotError::Unsatisfiable { .. }));
        assert!(!s.is_finalized());
    }

    #[test]
    fn test_blocks_group_stages() {
        for seed in 0..16 {
            let mut s = Stager::with_seed(seed);
            for id in ["s1", "s2", "s3", "s4"] {
                s.add_stage(StageDef::with_callback(id, Callback::noop())).unwrap();
            }
            s.next("s1").unwrap();
            s.begin_block("middle", Positions::Linear).unwrap();
            s.next_at("s2", "*").unwrap().next_at("s3", "*").unwrap();
            s.end_block().unwrap();
            s.next("s4").unwrap();
            s.finalize().unwrap();

            let order = ids(&s);
            assert_eq!(order.first().map(String::as_str), Some("s1"));
            assert_eq!(order.last().map(String::as_str), Some("s4"));
            assert!(order.contains(&"s2".to_string()));
            assert!(order.contains(&"s3".to_string()));
        }
    }

    #[test]
    fn test_step_blocks() {
        let mut s = stager();
        s.add_step(Step::new("x", Callback::noop())).unwrap();
        s.add_step(Step::new("y", Callback::noop())).unwrap();
        s.next("game").unwrap();
        s.begin_step_block("extra", Positions::Linear).unwrap();
        s.step_at("x", "1").unwrap().step_at("y", "0").unwrap();
        assert!(s.next("intro").is_err());
        s.end_block().unwrap();
        s.next("intro").unwrap();
        s.finalize().unwrap();
        assert_eq!(s.sequence()[0].steps, vec!["a", "b", "c", "y", "x"]);
        assert_eq!(ids(&s), vec!["game", "intro"]);
    }

    #[test]
    fn test_end_block_without_block() {
        let mut s = stager();
        s.next("intro").unwrap();
        assert!(matches!(s.end_block(), Err(PlotError::Block(_))));
    }

    #[test]
    fn test_extend_step() {
        let mut s = stager();
        let patch = StepPatch {
            properties: [("timer".to_string(), json!(10))].into_iter().collect(),
            ..Default::default()
        };
        s.extend_step("a", patch).unwrap();
        assert_eq!(s.get_step("a").unwrap().properties["timer"], json!(10));

        s.extend_step_with("a", |step| step.with_global("score", 1)).unwrap();
        assert_eq!(s.get_step("a").unwrap().globals["score"], json!(1));

        let err = s
            .extend_step_with("a", |mut step| {
                step.id = "z".to_string();
                step
            })
            .unwrap_err();
        assert!(matches!(err, PlotError::ImmutableField { field: "id", .. }));

        let err = s
            .extend_step_with("a", |mut step| {
                step.callback = Callback::noop();
                step
            })
            .unwrap_err();
        assert!(matches!(err, PlotError::ImmutableField { field: "cb", .. }));
        assert!(s.extend_step("nope", StepPatch::default()).is_err());
    }

    #[test]
    fn test_extend_stage() {
        let mut s = stager();
        let patch = StagePatch {
            steps: Some(vec!["a".to_string()]),
            ..Default::default()
        };
        s.extend_stage("game", patch).unwrap();
        assert_eq!(s.get_stage("game").unwrap().steps, vec!["a"]);

        let empty = StagePatch {
            steps: Some(vec![]),
            ..Default::default()
        };
        assert!(s.extend_stage("game", empty).is_err());

        let err = s
            .extend_stage_with("game", |mut stage| {
                stage.id = "renamed".to_string();
                stage
            })
            .unwrap_err();
        assert!(matches!(err, PlotError::ImmutableField { .. }));
    }

    #[test]
    fn test_extract_stage() {
        let s = stager();
        let bundle = s.extract_stage(&["game"], true).unwrap();
        assert_eq!(bundle.stages.len(), 1);
        assert_eq!(bundle.steps.len(), 3);
        assert_eq!(bundle.sequence.len(), 1);
        assert_eq!(bundle.sequence[0].steps, vec!["a", "b", "c"]);

        let bare = s.extract_stage(&["intro", "outro"], false).unwrap();
        assert!(bare.sequence.is_empty());
        assert_eq!(bare.steps.len(), 2);
        assert!(s.extract_stage(&["nope"], true).is_err());
    }

    #[test]
    fn test_state_replace_and_append() {
        let mut source = stager();
        source.set_default_step_rule(rules::WAIT);
        source.next("intro").unwrap().next("game").unwrap();
        source.finalize().unwrap();
        let state = source.get_state();
        assert!(state.to_json().unwrap().contains("\"defaultStepRule\": \"WAIT\""));

        let mut copy = Stager::new();
        copy.set_state(state, UpdateRule::Replace).unwrap();
        assert!(copy.is_finalized());
        assert_eq!(ids(&copy), vec!["intro", "game"]);
        assert_eq!(copy.default_step_rule(), rules::WAIT);

        let mut other = Stager::new();
        other.add_stage(StageDef::with_callback("extra", Callback::noop())).unwrap();
        other.next("extra").unwrap();
        other.finalize().unwrap();
        copy.set_state(other.get_state(), UpdateRule::Append).unwrap();
        assert_eq!(ids(&copy), vec!["intro", "game", "extra"]);

        // appending the same registrations again collides
        assert!(copy.set_state(other.get_state(), UpdateRule::Append).is_err());
    }

    #[test]
    fn test_appended_entries_survive_reset() {
        let mut copy = Stager::new();
        let mut source = stager();
        source.next("intro").unwrap();
        source.finalize().unwrap();
        copy.set_state(source.get_state(), UpdateRule::Replace).unwrap();

        let mut other = Stager::new();
        other.add_stage(StageDef::with_callback("extra", Callback::noop())).unwrap();
        other.next("extra").unwrap();
        other.finalize().unwrap();
        copy.set_state(other.get_state(), UpdateRule::Append).unwrap();
        assert_eq!(ids(&copy), vec!["intro", "extra"]);

        copy.reset();
        assert!(copy.sequence().is_empty());
        copy.finalize().unwrap();
        assert_eq!(ids(&copy), vec!["intro", "extra"]);

        copy.reset();
        copy.skip("extra", None).unwrap();
        copy.finalize().unwrap();
        assert_eq!(ids(&copy), vec!["intro"]);

        // the copy's own snapshot keeps the appended entry as well
        let mut again = Stager::new();
        copy.reset();
        copy.unskip("extra", None).unwrap();
        copy.finalize().unwrap();
        again.set_state(copy.get_state(), UpdateRule::Replace).unwrap();
        again.reset();
        again.finalize().unwrap();
        assert_eq!(ids(&again), vec!["intro", "extra"]);
    }

    #[test]
    fn test_append_into_open_stager_finalizes() {
        let mut target = stager();
        target.next("intro").unwrap();

        let mut other = Stager::new();
        other.add_stage(StageDef::with_callback("extra", Callback::noop())).unwrap();
        other.next("extra").unwrap();
        other.finalize().unwrap();
        target.set_state(other.get_state(), UpdateRule::Append).unwrap();

        assert!(target.is_finalized());
        assert_eq!(ids(&target), vec!["intro", "extra"]);
    }

    #[test]
    fn test_state_json_round_trip() {
        let rounds = Arc::new(AtomicU32::new(0));
        let counter = rounds.clone();
        let mut source = stager();
        source
            .next("intro")
            .unwrap()
            .do_loop("game", LoopCondition::new(|| true))
            .unwrap()
            .repeat("outro", 2)
            .unwrap()
            .gameover()
            .unwrap();
        source.skip("game", Some("c")).unwrap();
        source.finalize().unwrap();
        let json = source.get_state().to_json().unwrap();

        let played = Callback::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let bindings = PlanBindings::new()
            .default_callback(Callback::noop())
            .callback("intro", played)
            .condition("game", LoopCondition::new(|| false));
        let state = StagerState::from_json(&json, &bindings).unwrap();

        let mut copy = Stager::new();
        copy.set_state(state, UpdateRule::Replace).unwrap();
        assert!(copy.is_finalized());
        assert_eq!(
            ids(&copy),
            vec!["intro", "game [doLoop]", "outro [x2]", "gameover"]
        );
        assert_eq!(copy.sequence()[1].steps, vec!["a", "b"]);
        assert!(copy.is_skipped("game", Some("c")));

        copy.get_step("intro").unwrap().callback.call(&mut ());
        assert_eq!(rounds.load(Ordering::SeqCst), 1);
        let condition = copy.sequence()[1].kind.condition().unwrap();
        assert!(!condition.evaluate());

        // the loaded entries survive another finalize pass
        copy.reset();
        copy.finalize().unwrap();
        assert_eq!(copy.sequence().len(), 4);
    }

    #[test]
    fn test_state_json_needs_loop_conditions() {
        let mut source = stager();
        source.loop_while("game", LoopCondition::new(|| true)).unwrap();
        source.finalize().unwrap();
        let json = source.get_state().to_json().unwrap();

        let bindings = PlanBindings::new().default_callback(Callback::noop());
        assert!(matches!(
            StagerState::from_json(&json, &bindings),
            Err(PlotError::InvalidConfig(_))
        ));
        assert!(matches!(
            StagerState::from_json("{\"steps\": 3}", &bindings),
            Err(PlotError::Json(_))
        ));
    }
}

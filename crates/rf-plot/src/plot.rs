//! Game Plot
//!
//! Navigation over a stager's plan
//!
//! Given a position, answers what comes next or before it, and what data
//! (step, stage, globals, properties, step rule) belongs to it.
//!
//! Two modes:
//! - **Standard**: the stager has a finalized sequence; positions are
//!   `stage.step.round` indices into it.
//! - **Flexible**: the sequence is empty and next-deciders registered on
//!   the stager choose the next stage at runtime; positions carry the stage
//!   id by name.
//!
//! Property lookup walks step → stage → stager defaults and memoizes hits
//! per position. A second, per-step cache (`tmp_cache`) overrides
//! everything for the live position and is cleared by
//! [`GamePlot::set_current`].

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{PlotError, PlotResult};
use crate::plan::{
    NextStage, Properties, STEP_RULE_PROPERTY, SequenceEntry, SequenceKind, Stage, Step,
};
use crate::position::{Ident, Position};
use crate::rules::{PeerState, RuleContext, StageLevel, StepRule, StepRuleRegistry};
use crate::stager::Stager;

/// Transport tag of [`Navigation::GameOver`]
pub const GAMEOVER_TAG: &str = "NODEGAME_GAMEOVER";
/// Transport tag of [`Navigation::EndOfSequence`]
pub const END_SEQ_TAG: &str = "NODEGAME_END_SEQ";
/// Transport tag of [`Navigation::NoSequence`]
pub const NO_SEQ_TAG: &str = "NODEGAME_NO_SEQ";

/// Result of a navigation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    /// A valid position
    At(Position),
    /// The plan reached its gameover entry
    GameOver,
    /// No stage follows
    EndOfSequence,
    /// No plan is bound, or it can't produce stages
    NoSequence,
    /// A loop predicate must be evaluated before the answer is known
    Unresolved,
    /// The input position does not exist in the plan
    Invalid,
}

impl Navigation {
    pub fn position(&self) -> Option<&Position> {
        match self {
            Navigation::At(pos) => Some(pos),
            _ => None,
        }
    }

    pub fn into_position(self) -> Option<Position> {
        match self {
            Navigation::At(pos) => Some(pos),
            _ => None,
        }
    }

    #[inline]
    pub fn is_position(&self) -> bool {
        matches!(self, Navigation::At(_))
    }

    /// String sentinel used when the result is sent over a transport
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            Navigation::GameOver => Some(GAMEOVER_TAG),
            Navigation::EndOfSequence => Some(END_SEQ_TAG),
            Navigation::NoSequence => Some(NO_SEQ_TAG),
            _ => None,
        }
    }
}

/// Round query of [`GamePlot::get_round`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundMode {
    #[default]
    Current,
    Total,
    Remaining,
    Past,
}

/// Property lookup tiers to skip. `true` disables the tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertyMask {
    pub tmp_cache: bool,
    pub cache: bool,
    pub step: bool,
    pub stage: bool,
    pub defaults: bool,
}

/// Property cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered by the per-step or per-position cache
    pub hits: u64,
    /// Lookups that walked step, stage and defaults
    pub walks: u64,
}

/// Stage occurrence a position points into
struct Located<'a> {
    /// Sequence id in standard mode, stage id in flexible mode
    stage_id: &'a str,
    entry: Option<&'a SequenceEntry>,
    steps: &'a [String],
    step_no: u32,
    round: u32,
}

impl Located<'_> {
    fn step_id(&self) -> Option<&str> {
        self.steps
            .get((self.step_no as usize).checked_sub(1)?)
            .map(String::as_str)
    }
}

/// Navigator and property resolver over one stager
#[derive(Debug, Clone)]
pub struct GamePlot {
    stager: Option<Stager>,
    /// position -> memoized properties
    cache: HashMap<String, Properties>,
    /// Overrides for the live position, cleared every step
    tmp_cache: Properties,
    current: Position,
    current_key: String,
    normalized: HashMap<String, Option<Position>>,
    rules: StepRuleRegistry,
    stats: CacheStats,
}

impl Default for GamePlot {
    fn default() -> Self {
        Self {
            stager: None,
            cache: HashMap::new(),
            tmp_cache: Properties::new(),
            current: Position::start(),
            current_key: Position::start().to_string(),
            normalized: HashMap::new(),
            rules: StepRuleRegistry::with_builtins(),
            stats: CacheStats::default(),
        }
    }
}

impl GamePlot {
    /// Plot over `stager`, finalizing it if needed
    pub fn new(stager: Stager) -> PlotResult<Self> {
        let mut plot = Self::default();
        plot.init(Some(stager))?;
        Ok(plot)
    }

    /// Bind a stager (or none) and clear all caches
    pub fn init(&mut self, stager: Option<Stager>) -> PlotResult<()> {
        let stager = match stager {
            Some(mut stager) => {
                stager.finalize()?;
                Some(stager)
            }
            None => None,
        };
        self.stager = stager;
        self.cache.clear();
        self.tmp_cache.clear();
        self.normalized.clear();
        self.stats = CacheStats::default();
        self.current = Position::start();
        self.current_key = self.current.to_string();
        log::debug!(
            "GamePlot initialized: {} sequence entries, flexible: {}",
            self.sequence().len(),
            self.is_flexible_mode()
        );
        Ok(())
    }

    pub fn stager(&self) -> Option<&Stager> {
        self.stager.as_ref()
    }

    fn sequence(&self) -> &[SequenceEntry] {
        self.stager.as_ref().map(Stager::sequence).unwrap_or(&[])
    }

    /// True when no authored sequence exists
    pub fn is_flexible_mode(&self) -> bool {
        self.sequence().is_empty()
    }

    /// True when navigation can produce a stage
    pub fn is_ready(&self) -> bool {
        self.stager.as_ref().is_some_and(|s| {
            !s.sequence().is_empty() || s.general_next().is_some() || s.has_next_functions()
        })
    }

    /// Named rules consulted by [`GamePlot::get_step_rule`]
    pub fn rules(&self) -> &StepRuleRegistry {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut StepRuleRegistry {
        &mut self.rules
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.stats
    }

    // ═══════════════════════════════════════════════════════════════════════
    // NORMALIZATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Resolve stage and step names of `pos` to indices.
    ///
    /// Returns `None` for positions outside the plan and for the transport
    /// tags. Results are cached per input string.
    pub fn normalize(&mut self, pos: &Position) -> PlotResult<Option<Position>> {
        if self.is_flexible_mode() {
            return Err(PlotError::FlexibleMode("normalize"));
        }
        let key = pos.to_string();
        if let Some(hit) = self.normalized.get(&key) {
            return Ok(hit.clone());
        }
        let resolved = self.resolve(pos);
        self.normalized.insert(key, resolved.clone());
        Ok(resolved)
    }

    /// Uncached [`GamePlot::normalize`] for standard mode
    fn resolve(&self, pos: &Position) -> Option<Position> {
        if is_tag(pos) {
            return None;
        }
        if pos.is_start() {
            return Some(Position::start());
        }
        let sequence = self.sequence();
        let stage_no = match pos.stage() {
            Ident::Index(i) => *i as usize,
            Ident::Name(name) => sequence.iter().position(|e| &e.id == name)? + 1,
        };
        let entry = sequence.get(stage_no.checked_sub(1)?)?;
        let step_no = match pos.step() {
            Ident::Index(i) => *i as usize,
            Ident::Name(name) => entry.steps.iter().position(|s| s == name)? + 1,
        };
        let in_range = (1..=entry.steps.len()).contains(&step_no);
        if !in_range && !(entry.kind.is_gameover() && step_no == 1) {
            return None;
        }
        Some(Position::at(stage_no as u32, step_no as u32, pos.round()))
    }

    fn locate(&self, pos: &Position) -> Option<Located<'_>> {
        if self.is_flexible_mode() {
            let stager = self.stager.as_ref()?;
            let name = pos.stage().name()?;
            let stage = stager.get_stage(name)?;
            let step_no = match pos.step() {
                Ident::Index(i) => *i,
                Ident::Name(step) => stage.steps.iter().position(|s| s == step)? as u32 + 1,
            };
            if !(1..=stage.steps.len()).contains(&(step_no as usize)) {
                return None;
            }
            return Some(Located {
                stage_id: &stage.id,
                entry: None,
                steps: &stage.steps,
                step_no,
                round: pos.round(),
            });
        }
        let norm = self.resolve(pos)?;
        let stage_no = norm.stage().index()?;
        let entry = self.sequence().get((stage_no as usize).checked_sub(1)?)?;
        Some(Located {
            stage_id: &entry.id,
            entry: Some(entry),
            steps: &entry.steps,
            step_no: norm.step().index()?,
            round: norm.round(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // NAVIGATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Position after `pos`, evaluating loop predicates
    pub fn next(&mut self, pos: &Position) -> Navigation {
        self.next_with(pos, true)
    }

    /// Position after `pos`. With `exec_loops` off, a step that depends on
    /// a loop predicate yields [`Navigation::Unresolved`].
    pub fn next_with(&mut self, pos: &Position, exec_loops: bool) -> Navigation {
        if !self.is_ready() {
            return Navigation::NoSequence;
        }
        if self.is_flexible_mode() {
            return self.next_flexible(pos);
        }
        let Ok(Some(norm)) = self.normalize(pos) else {
            return Navigation::Invalid;
        };
        if norm.is_start() {
            return self.enter_from(0, exec_loops);
        }
        let (Some(stage_no), Some(step_no)) = (norm.stage().index(), norm.step().index()) else {
            return Navigation::Invalid;
        };
        let round = norm.round();
        let Some(entry) = self.sequence().get(stage_no as usize - 1) else {
            return Navigation::Invalid;
        };

        if entry.kind.is_gameover() {
            return Navigation::GameOver;
        }
        if (step_no as usize) < entry.steps.len() {
            return Navigation::At(Position::at(stage_no, step_no + 1, round));
        }
        match &entry.kind {
            SequenceKind::Repeat { num } if round < *num => {
                Navigation::At(Position::at(stage_no, 1, round + 1))
            }
            SequenceKind::Loop { condition } | SequenceKind::DoLoop { condition } => {
                if !exec_loops {
                    return Navigation::Unresolved;
                }
                if condition.evaluate() {
                    log::trace!("Stage '{}' loops into round {}", entry.id, round + 1);
                    Navigation::At(Position::at(stage_no, 1, round + 1))
                } else {
                    self.enter_from(stage_no as usize, exec_loops)
                }
            }
            _ => self.enter_from(stage_no as usize, exec_loops),
        }
    }

    /// First position of the first playable entry at or after `index`
    fn enter_from(&self, index: usize, exec_loops: bool) -> Navigation {
        let sequence = self.sequence();
        for (i, entry) in sequence.iter().enumerate().skip(index) {
            match &entry.kind {
                SequenceKind::Gameover => return Navigation::GameOver,
                SequenceKind::Loop { condition } => {
                    if !exec_loops {
                        return Navigation::Unresolved;
                    }
                    if !condition.evaluate() {
                        log::trace!("Loop stage '{}' skipped", entry.id);
                        continue;
                    }
                }
                _ => {}
            }
            return Navigation::At(Position::at(i as u32 + 1, 1, 1));
        }
        Navigation::EndOfSequence
    }

    fn next_flexible(&self, pos: &Position) -> Navigation {
        let Some(stager) = self.stager.as_ref() else {
            return Navigation::NoSequence;
        };
        if pos.is_start() {
            return match stager.general_next() {
                Some(decider) => self.apply_decision(decider.decide()),
                None => Navigation::EndOfSequence,
            };
        }
        let Some(located) = self.locate(pos) else {
            return Navigation::Invalid;
        };
        if (located.step_no as usize) < located.steps.len() {
            return Position::new(located.stage_id, located.step_no + 1, 1)
                .map_or(Navigation::Invalid, Navigation::At);
        }
        let decider = stager
            .next_function(located.stage_id)
            .or_else(|| stager.general_next());
        match decider {
            Some(decider) => self.apply_decision(decider.decide()),
            None => Navigation::EndOfSequence,
        }
    }

    fn apply_decision(&self, decision: NextStage) -> Navigation {
        log::trace!("Next-stage decider returned {:?}", decision);
        match decision {
            NextStage::GameOver => Navigation::GameOver,
            NextStage::End => Navigation::EndOfSequence,
            NextStage::Stage(id) if id.is_empty() => Navigation::EndOfSequence,
            NextStage::Stage(id) => {
                let known = self
                    .stager
                    .as_ref()
                    .is_some_and(|s| s.get_stage(&id).is_some());
                if !known {
                    log::warn!("Next-stage decider returned unknown stage '{}'", id);
                    return Navigation::Invalid;
                }
                Position::new(id, 1u32, 1).map_or(Navigation::Invalid, Navigation::At)
            }
        }
    }

    /// Position before `pos`, evaluating loop predicates
    pub fn previous(&mut self, pos: &Position) -> Navigation {
        self.previous_with(pos, true)
    }

    /// Position before `pos`; `0.0.0` before the first stage
    pub fn previous_with(&mut self, pos: &Position, exec_loops: bool) -> Navigation {
        if !self.is_ready() {
            return Navigation::NoSequence;
        }
        if self.is_flexible_mode() {
            return self.previous_flexible(pos);
        }
        let Ok(Some(norm)) = self.normalize(pos) else {
            return Navigation::Invalid;
        };
        if norm.is_start() {
            return Navigation::At(Position::start());
        }
        let (Some(stage_no), Some(step_no)) = (norm.stage().index(), norm.step().index()) else {
            return Navigation::Invalid;
        };
        let round = norm.round();
        let Some(entry) = self.sequence().get(stage_no as usize - 1) else {
            return Navigation::Invalid;
        };

        if !entry.kind.is_gameover() {
            if step_no > 1 {
                return Navigation::At(Position::at(stage_no, step_no - 1, round));
            }
            let repeating = matches!(
                entry.kind,
                SequenceKind::Repeat { .. }
                    | SequenceKind::Loop { .. }
                    | SequenceKind::DoLoop { .. }
            );
            if repeating && round > 1 {
                return Navigation::At(Position::at(stage_no, entry.steps.len() as u32, round - 1));
            }
        }
        self.land_before(stage_no as usize - 1, exec_loops)
    }

    /// Last position of the closest playable entry before `index`
    fn land_before(&self, index: usize, exec_loops: bool) -> Navigation {
        let sequence = self.sequence();
        for i in (0..index.min(sequence.len())).rev() {
            let entry = &sequence[i];
            let round = match &entry.kind {
                SequenceKind::Gameover => continue,
                SequenceKind::Loop { condition } => {
                    if !exec_loops {
                        return Navigation::Unresolved;
                    }
                    if !condition.evaluate() {
                        log::trace!("Loop stage '{}' skipped backwards", entry.id);
                        continue;
                    }
                    1
                }
                SequenceKind::Repeat { num } => *num,
                _ => 1,
            };
            return Navigation::At(Position::at(i as u32 + 1, entry.steps.len() as u32, round));
        }
        Navigation::At(Position::start())
    }

    fn previous_flexible(&self, pos: &Position) -> Navigation {
        if pos.is_start() {
            return Navigation::At(Position::start());
        }
        let Some(located) = self.locate(pos) else {
            return Navigation::Invalid;
        };
        if located.step_no > 1 {
            return Position::new(located.stage_id, located.step_no - 1, 1)
                .map_or(Navigation::Invalid, Navigation::At);
        }
        // Which stage ran before is only known to the runtime.
        Navigation::Unresolved
    }

    /// Apply `next` (positive delta) or `previous` (negative delta)
    /// `|delta|` times
    pub fn jump(&mut self, pos: &Position, delta: i64) -> Navigation {
        self.jump_with(pos, delta, true)
    }

    /// [`GamePlot::jump`] that stops at the first non-position result
    pub fn jump_with(&mut self, pos: &Position, delta: i64, exec_loops: bool) -> Navigation {
        let mut nav = Navigation::At(pos.clone());
        for _ in 0..delta.unsigned_abs() {
            let Navigation::At(current) = nav else {
                return nav;
            };
            nav = if delta > 0 {
                self.next_with(&current, exec_loops)
            } else {
                self.previous_with(&current, exec_loops)
            };
        }
        nav
    }

    // ═══════════════════════════════════════════════════════════════════════
    // COUNTING
    // ═══════════════════════════════════════════════════════════════════════

    /// Steps left in the stage occurrence, current step included. With
    /// `count_repeat`, a repeat stage counts all its rounds; loop stages
    /// have no count.
    pub fn steps_to_next_stage(&self, pos: &Position, count_repeat: bool) -> Option<u32> {
        let located = self.locate(pos)?;
        let (limit, step_no) = Self::counted(&located, count_repeat)?;
        Some(limit.checked_sub(step_no)? + 1)
    }

    /// Steps played in the stage occurrence, current step included
    pub fn steps_from_previous_stage(&self, pos: &Position, count_repeat: bool) -> Option<u32> {
        let located = self.locate(pos)?;
        let (_, step_no) = Self::counted(&located, count_repeat)?;
        Some(step_no)
    }

    /// `(total steps, step number)` of the occurrence
    fn counted(located: &Located<'_>, count_repeat: bool) -> Option<(u32, u32)> {
        let len = located.steps.len() as u32;
        if !count_repeat {
            return Some((len, located.step_no));
        }
        match located.entry.map(|e| &e.kind) {
            Some(SequenceKind::Repeat { num }) => {
                let total = len.checked_mul(*num)?;
                let played = len
                    .checked_mul(located.round.checked_sub(1)?)?
                    .checked_add(located.step_no)?;
                Some((total, played))
            }
            Some(SequenceKind::Loop { .. } | SequenceKind::DoLoop { .. }) => None,
            _ => Some((len, located.step_no)),
        }
    }

    /// Round information; `None` when it can't be known ahead of time
    pub fn get_round(&self, pos: &Position, mode: RoundMode) -> Option<u32> {
        if self.is_flexible_mode() {
            return None;
        }
        let located = self.locate(pos)?;
        let total = match located.entry.map(|e| &e.kind) {
            Some(SequenceKind::Repeat { num }) => Some(*num),
            Some(SequenceKind::Plain) => Some(1),
            _ => None,
        };
        match mode {
            RoundMode::Current => Some(located.round),
            RoundMode::Past => Some(located.round - 1),
            RoundMode::Total => total,
            RoundMode::Remaining => total.map(|t| t.saturating_sub(located.round)),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LOOKUP
    // ═══════════════════════════════════════════════════════════════════════

    /// Sequence entry at `pos` (standard mode only)
    pub fn get_sequence_object(&self, pos: &Position) -> Option<&SequenceEntry> {
        self.locate(pos)?.entry
    }

    /// Registered stage played at `pos`
    pub fn get_stage(&self, pos: &Position) -> Option<&Stage> {
        let located = self.locate(pos)?;
        self.stager.as_ref()?.get_stage(located.stage_id)
    }

    /// Registered step played at `pos`
    pub fn get_step(&self, pos: &Position) -> Option<&Step> {
        let located = self.locate(pos)?;
        self.stager.as_ref()?.get_step(located.step_id()?)
    }

    /// First definition of a global: step, stage, then stager defaults
    pub fn get_global(&self, pos: &Position, name: &str) -> Option<Value> {
        let step = self.get_step(pos).and_then(|s| s.globals.get(name));
        let stage = || self.get_stage(pos).and_then(|s| s.globals.get(name));
        let defaults = || {
            self.stager
                .as_ref()
                .and_then(|s| s.default_globals().get(name))
        };
        step.or_else(stage).or_else(defaults).cloned()
    }

    /// All globals at `pos`: defaults, overridden by stage, overridden by
    /// step
    pub fn get_globals(&self, pos: &Position) -> Properties {
        let mut out = Properties::new();
        if let Some(stager) = &self.stager {
            out.extend(stager.default_globals().clone());
        }
        if let Some(stage) = self.get_stage(pos) {
            out.extend(stage.globals.clone());
        }
        if let Some(step) = self.get_step(pos) {
            out.extend(step.globals.clone());
        }
        out
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PROPERTIES
    // ═══════════════════════════════════════════════════════════════════════

    /// Property at `pos`, see [`GamePlot::get_property_masked`]
    pub fn get_property(&mut self, pos: &Position, name: &str) -> Option<Value> {
        self.get_property_masked(pos, name, PropertyMask::default())
    }

    /// Property at `pos`, or `not_found`
    pub fn get_property_or(&mut self, pos: &Position, name: &str, not_found: Value) -> Value {
        self.get_property(pos, name).unwrap_or(not_found)
    }

    /// Look up a property through the tiers not disabled by `mask`:
    /// per-step cache (live position only), position cache, step, stage,
    /// stager defaults. A hit in the last three is memoized.
    pub fn get_property_masked(
        &mut self,
        pos: &Position,
        name: &str,
        mask: PropertyMask,
    ) -> Option<Value> {
        let key = self.cache_key(pos);

        if !mask.tmp_cache
            && key == self.current_key
            && let Some(value) = self.tmp_cache.get(name)
        {
            self.stats.hits += 1;
            return Some(value.clone());
        }
        if !mask.cache
            && let Some(value) = self.cache.get(&key).and_then(|props| props.get(name))
        {
            let value = value.clone();
            self.stats.hits += 1;
            return Some(value);
        }

        self.stats.walks += 1;
        log::trace!("Property '{}' at {}: cache miss", name, key);
        let step = (!mask.step)
            .then(|| self.get_step(pos).and_then(|s| s.properties.get(name)))
            .flatten();
        let found = step
            .or_else(|| {
                (!mask.stage)
                    .then(|| self.get_stage(pos).and_then(|s| s.properties.get(name)))
                    .flatten()
            })
            .or_else(|| {
                (!mask.defaults)
                    .then(|| {
                        self.stager
                            .as_ref()
                            .and_then(|s| s.default_properties().get(name))
                    })
                    .flatten()
            })
            .cloned();

        if let Some(value) = &found {
            self.cache
                .entry(key)
                .or_default()
                .insert(name.to_string(), value.clone());
        }
        found
    }

    /// Overwrite a property in the tier that defines it. Returns false
    /// when no tier does.
    pub fn update_property(&mut self, pos: &Position, name: &str, value: Value) -> bool {
        let (stage_id, step_id) = self.ids_at(pos);
        let Some(stager) = self.stager.as_mut() else {
            return false;
        };

        let step = step_id
            .as_deref()
            .and_then(|id| stager.get_step_mut(id))
            .and_then(|s| s.properties.get_mut(name));
        let updated = if let Some(slot) = step {
            *slot = value.clone();
            true
        } else if let Some(slot) = stage_id
            .as_deref()
            .and_then(|id| stager.get_stage_mut(id))
            .and_then(|s| s.properties.get_mut(name))
        {
            *slot = value.clone();
            true
        } else if let Some(slot) = stager.default_properties_mut().get_mut(name) {
            *slot = value.clone();
            true
        } else {
            false
        };

        if updated {
            self.invalidate(name);
            let key = self.cache_key(pos);
            self.cache
                .entry(key)
                .or_default()
                .insert(name.to_string(), value);
        }
        updated
    }

    /// Set a property on the step at `pos`. Returns false without a step.
    pub fn set_step_property(&mut self, pos: &Position, name: &str, value: Value) -> bool {
        let (_, Some(step_id)) = self.ids_at(pos) else {
            return false;
        };
        let Some(step) = self.stager.as_mut().and_then(|s| s.get_step_mut(&step_id)) else {
            return false;
        };
        step.properties.insert(name.to_string(), value);
        self.invalidate(name);
        true
    }

    /// Set a property on the stage at `pos`. Returns false without a stage.
    pub fn set_stage_property(&mut self, pos: &Position, name: &str, value: Value) -> bool {
        let (Some(stage_id), _) = self.ids_at(pos) else {
            return false;
        };
        let Some(stage) = self.stager.as_mut().and_then(|s| s.get_stage_mut(&stage_id)) else {
            return false;
        };
        stage.properties.insert(name.to_string(), value);
        self.invalidate(name);
        true
    }

    /// Set a per-step override for the live position
    pub fn set_tmp(&mut self, name: &str, value: Value) {
        self.tmp_cache.insert(name.to_string(), value);
    }

    /// Record the runtime's live position; clears the per-step cache
    pub fn set_current(&mut self, pos: Position) {
        self.tmp_cache.clear();
        self.current_key = self.cache_key(&pos);
        self.current = pos;
    }

    pub fn current(&self) -> &Position {
        &self.current
    }

    fn cache_key(&self, pos: &Position) -> String {
        if self.is_flexible_mode() {
            return pos.to_string();
        }
        self.resolve(pos).unwrap_or_else(|| pos.clone()).to_string()
    }

    fn ids_at(&self, pos: &Position) -> (Option<String>, Option<String>) {
        match self.locate(pos) {
            Some(located) => (
                Some(located.stage_id.to_string()),
                located.step_id().map(str::to_string),
            ),
            None => (None, None),
        }
    }

    fn invalidate(&mut self, name: &str) {
        for props in self.cache.values_mut() {
            props.remove(name);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // STEP RULES
    // ═══════════════════════════════════════════════════════════════════════

    /// Name of the step rule at `pos`: the `stepRule` property, else the
    /// stager default
    pub fn step_rule_name(&mut self, pos: &Position) -> Option<String> {
        let named = self
            .get_property(pos, STEP_RULE_PROPERTY)
            .and_then(|v| v.as_str().map(str::to_string));
        named.or_else(|| self.stager.as_ref().map(|s| s.default_step_rule().to_string()))
    }

    /// Step rule at `pos`, resolved through the registry. Unknown names
    /// fall back to the stager default.
    pub fn get_step_rule(&mut self, pos: &Position) -> Option<StepRule> {
        let name = self.step_rule_name(pos)?;
        if let Some(rule) = self.rules.get(&name) {
            return Some(rule.clone());
        }
        log::warn!("Unknown step rule '{}' at {}", name, pos);
        let fallback = self.stager.as_ref()?.default_step_rule();
        self.rules.get(fallback).cloned()
    }

    /// Evaluate the step rule at `pos` for a player
    pub fn can_advance(
        &mut self,
        pos: &Position,
        stage_level: StageLevel,
        peers: &[PeerState],
    ) -> bool {
        let Some(rule) = self.get_step_rule(pos) else {
            return true;
        };
        let ctx = RuleContext {
            position: pos,
            stage_level,
            peers,
            steps_to_next_stage: self.steps_to_next_stage(pos, false),
        };
        rule.allows(&ctx)
    }
}

fn is_tag(pos: &Position) -> bool {
    matches!(
        pos.stage().name(),
        Some(GAMEOVER_TAG | END_SEQ_TAG | NO_SEQ_TAG)
    )
}

//! Step Rules
//!
//! When a player may leave the current step
//!
//! A step rule looks at the player's own progress and at the progress of
//! the other players and answers whether the player can advance. Rules are
//! referenced by name from the `stepRule` property of steps and stages and
//! resolved through a [`StepRuleRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::position::Position;

/// Advance as soon as the player is done
pub const SOLO: &str = "SOLO";
/// Never advance on its own; the runtime must force the step
pub const WAIT: &str = "WAIT";
/// Advance when every player is done with the step
pub const SYNC_STEP: &str = "SYNC_STEP";
/// Advance freely inside the stage, wait for everyone on its last step
pub const SYNC_STAGE: &str = "SYNC_STAGE";
/// Advance when all other players are done with the step
pub const OTHERS_SYNC_STEP: &str = "OTHERS_SYNC_STEP";
/// Like [`SYNC_STAGE`], ignoring the player's own progress
pub const OTHERS_SYNC_STAGE: &str = "OTHERS_SYNC_STAGE";

/// Progress of a player inside the current step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageLevel {
    #[default]
    Uninitialized,
    Initializing,
    Initialized,
    Playing,
    Paused,
    Done,
}

/// Progress of another player
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    pub position: Position,
    pub stage_level: StageLevel,
}

impl PeerState {
    fn done_at(&self, position: &Position) -> bool {
        self.position == *position && self.stage_level == StageLevel::Done
    }
}

/// Input of a step rule
#[derive(Debug, Clone)]
pub struct RuleContext<'a> {
    pub position: &'a Position,
    pub stage_level: StageLevel,
    pub peers: &'a [PeerState],
    /// Steps left in the stage, current one included
    pub steps_to_next_stage: Option<u32>,
}

impl RuleContext<'_> {
    fn is_done(&self) -> bool {
        self.stage_level == StageLevel::Done
    }

    fn peers_done(&self) -> bool {
        self.peers.iter().all(|p| p.done_at(self.position))
    }

    fn on_last_step(&self) -> bool {
        self.steps_to_next_stage.is_none_or(|n| n <= 1)
    }
}

/// A step rule
#[derive(Clone)]
pub struct StepRule(Arc<dyn Fn(&RuleContext<'_>) -> bool + Send + Sync>);

impl StepRule {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&RuleContext<'_>) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn allows(&self, ctx: &RuleContext<'_>) -> bool {
        (self.0)(ctx)
    }
}

impl fmt::Debug for StepRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StepRule(..)")
    }
}

/// Named step rules
#[derive(Debug, Clone, Default)]
pub struct StepRuleRegistry {
    rules: HashMap<String, StepRule>,
}

impl StepRuleRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in rules
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(SOLO, StepRule::new(|_| true));
        registry.register(WAIT, StepRule::new(|_| false));
        registry.register(
            SYNC_STEP,
            StepRule::new(|ctx| ctx.is_done() && ctx.peers_done()),
        );
        registry.register(
            SYNC_STAGE,
            StepRule::new(|ctx| ctx.is_done() && (!ctx.on_last_step() || ctx.peers_done())),
        );
        registry.register(OTHERS_SYNC_STEP, StepRule::new(|ctx| ctx.peers_done()));
        registry.register(
            OTHERS_SYNC_STAGE,
            StepRule::new(|ctx| !ctx.on_last_step() || ctx.peers_done()),
        );
        registry
    }

    /// Register or replace a rule
    pub fn register(&mut self, name: impl Into<String>, rule: StepRule) {
        self.rules.insert(name.into(), rule);
    }

    pub fn get(&self, name: &str) -> Option<&StepRule> {
        self.rules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(s: &str) -> Position {
        s.parse().unwrap()
    }

    fn check(name: &str, level: StageLevel, peers: &[PeerState], remaining: u32) -> bool {
        let registry = StepRuleRegistry::with_builtins();
        let here = pos("1.1.1");
        let ctx = RuleContext {
            position: &here,
            stage_level: level,
            peers,
            steps_to_next_stage: Some(remaining),
        };
        registry.get(name).unwrap().allows(&ctx)
    }

    fn peer(at: &str, level: StageLevel) -> PeerState {
        PeerState {
            position: pos(at),
            stage_level: level,
        }
    }

    #[test]
    fn test_builtins_registered() {
        let registry = StepRuleRegistry::with_builtins();
        for name in [SOLO, WAIT, SYNC_STEP, SYNC_STAGE, OTHERS_SYNC_STEP, OTHERS_SYNC_STAGE] {
            assert!(registry.contains(name), "missing {}", name);
        }
        assert_eq!(registry.len(), 6);
    }

    #[test]
    fn test_solo_and_wait() {
        assert!(check(SOLO, StageLevel::Playing, &[], 1));
        assert!(!check(WAIT, StageLevel::Done, &[], 1));
    }

    #[test]
    fn test_sync_step() {
        let done = [peer("1.1.1", StageLevel::Done)];
        let behind = [peer("1.1.1", StageLevel::Playing)];
        assert!(check(SYNC_STEP, StageLevel::Done, &done, 2));
        assert!(!check(SYNC_STEP, StageLevel::Playing, &done, 2));
        assert!(!check(SYNC_STEP, StageLevel::Done, &behind, 2));
        assert!(check(OTHERS_SYNC_STEP, StageLevel::Playing, &done, 2));
    }

    #[test]
    fn test_sync_stage_waits_only_on_last_step() {
        let behind = [peer("1.1.1", StageLevel::Playing)];
        assert!(check(SYNC_STAGE, StageLevel::Done, &behind, 3));
        assert!(!check(SYNC_STAGE, StageLevel::Done, &behind, 1));
        assert!(check(OTHERS_SYNC_STAGE, StageLevel::Playing, &behind, 2));
        assert!(!check(OTHERS_SYNC_STAGE, StageLevel::Playing, &behind, 1));
    }

    #[test]
    fn test_custom_rule() {
        let mut registry = StepRuleRegistry::new();
        registry.register("MAJORITY", StepRule::new(|ctx| {
            let done = ctx.peers.iter().filter(|p| p.stage_level == StageLevel::Done).count();
            done * 2 > ctx.peers.len()
        }));
        let here = pos("1.1.1");
        let peers = [
            peer("1.1.1", StageLevel::Done),
            peer("1.1.1", StageLevel::Done),
            peer("1.1.1", StageLevel::Playing),
        ];
        let ctx = RuleContext {
            position: &here,
            stage_level: StageLevel::Playing,
            peers: &peers,
            steps_to_next_stage: None,
        };
        assert!(registry.get("MAJORITY").unwrap().allows(&ctx));
    }
}

//! Plan Definitions
//!
//! Steps, stages and sequence entries
//!
//! Steps and stages are registered on a [`crate::Stager`]; the stager
//! flattens its block tree into a list of [`SequenceEntry`] values which is
//! the runtime plan walked by [`crate::GamePlot`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form key/value map used for globals and properties
pub type Properties = serde_json::Map<String, Value>;

/// Property name holding the step rule of a step or stage
pub const STEP_RULE_PROPERTY: &str = "stepRule";

/// Id of the sequence entry produced by [`crate::Stager::gameover`]
pub const GAMEOVER_ID: &str = "__gameover";

// ═══════════════════════════════════════════════════════════════════════════
// CALLBACKS
// ═══════════════════════════════════════════════════════════════════════════

/// Step callback, executed by the surrounding runtime with its game
/// instance as context. The plot engine only stores it.
#[derive(Clone)]
pub struct Callback(Arc<dyn Fn(&mut dyn Any) + Send + Sync>);

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut dyn Any) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Callback that does nothing
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn call(&self, game: &mut dyn Any) {
        (self.0)(game)
    }

    /// True if both handles point to the same function
    pub fn ptr_eq(&self, other: &Callback) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for Callback {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback(..)")
    }
}

/// Predicate deciding whether a `loop`/`doLoop` stage runs another round
#[derive(Clone)]
pub struct LoopCondition(Arc<dyn Fn() -> bool + Send + Sync>);

impl LoopCondition {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn evaluate(&self) -> bool {
        (self.0)()
    }
}

/// Condition that never holds; placeholder until a real one is bound
impl Default for LoopCondition {
    fn default() -> Self {
        Self::new(|| false)
    }
}

impl fmt::Debug for LoopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LoopCondition(..)")
    }
}

/// Decision returned by a next-stage decider in flexible mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStage {
    /// Continue with the given stage id
    Stage(String),
    /// End the game
    GameOver,
    /// No more stages
    End,
}

/// Runtime decider used by flexible plans
#[derive(Clone)]
pub struct NextDecider(Arc<dyn Fn() -> NextStage + Send + Sync>);

impl NextDecider {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> NextStage + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn decide(&self) -> NextStage {
        (self.0)()
    }
}

impl fmt::Debug for NextDecider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NextDecider(..)")
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// STEPS
// ═══════════════════════════════════════════════════════════════════════════

/// A registered step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(skip)]
    pub callback: Callback,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub globals: Properties,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub properties: Properties,
}

impl Step {
    pub fn new(id: impl Into<String>, callback: Callback) -> Self {
        Self {
            id: id.into(),
            callback,
            globals: Properties::new(),
            properties: Properties::new(),
        }
    }

    pub fn with_global(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.globals.insert(key.into(), value.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Gate advancing from this step with a named rule
    pub fn with_step_rule(self, rule: impl Into<String>) -> Self {
        self.with_property(STEP_RULE_PROPERTY, rule.into())
    }
}

/// Shallow update applied by [`crate::Stager::extend_step`]
#[derive(Debug, Clone, Default)]
pub struct StepPatch {
    pub globals: Properties,
    pub properties: Properties,
}

// ═══════════════════════════════════════════════════════════════════════════
// STAGES
// ═══════════════════════════════════════════════════════════════════════════

/// A registered stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    pub steps: Vec<String>,
    pub rounds: u32,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub globals: Properties,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub properties: Properties,
}

/// Shallow update applied by [`crate::Stager::extend_stage`]
#[derive(Debug, Clone, Default)]
pub struct StagePatch {
    pub steps: Option<Vec<String>>,
    pub rounds: Option<u32>,
    pub globals: Properties,
    pub properties: Properties,
}

/// Step of a stage definition: a registered id or an inline step
#[derive(Debug, Clone)]
pub enum StepEntry {
    Id(String),
    Inline(Step),
}

impl StepEntry {
    pub fn id(&self) -> &str {
        match self {
            StepEntry::Id(id) => id,
            StepEntry::Inline(step) => &step.id,
        }
    }
}

impl From<&str> for StepEntry {
    fn from(value: &str) -> Self {
        StepEntry::Id(value.to_string())
    }
}

impl From<String> for StepEntry {
    fn from(value: String) -> Self {
        StepEntry::Id(value)
    }
}

impl From<Step> for StepEntry {
    fn from(value: Step) -> Self {
        StepEntry::Inline(value)
    }
}

/// Stage definition passed to [`crate::Stager::add_stage`]
///
/// Exactly one of `steps` or `callback` must be set. A callback stage
/// registers a step with the same id.
#[derive(Debug, Clone)]
pub struct StageDef {
    pub id: String,
    pub steps: Vec<StepEntry>,
    pub callback: Option<Callback>,
    pub rounds: u32,
    pub globals: Properties,
    pub properties: Properties,
}

impl StageDef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
            callback: None,
            rounds: 1,
            globals: Properties::new(),
            properties: Properties::new(),
        }
    }

    /// Single-step stage backed by a callback
    pub fn with_callback(id: impl Into<String>, callback: Callback) -> Self {
        let mut def = Self::new(id);
        def.callback = Some(callback);
        def
    }

    pub fn step(mut self, step: impl Into<StepEntry>) -> Self {
        self.steps.push(step.into());
        self
    }

    pub fn steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepEntry>,
    {
        self.steps.extend(steps.into_iter().map(Into::into));
        self
    }

    pub fn rounds(mut self, rounds: u32) -> Self {
        self.rounds = rounds;
        self
    }

    pub fn with_global(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.globals.insert(key.into(), value.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_step_rule(self, rule: impl Into<String>) -> Self {
        self.with_property(STEP_RULE_PROPERTY, rule.into())
    }
}

/// Stage argument of `next`/`repeat`/`loop`/`do_loop`
#[derive(Debug, Clone)]
pub enum StageRef {
    /// Previously registered stage
    ById(String),
    /// Registered stage placed under another name (`"id AS alias"`)
    ByAlias { id: String, alias: String },
    /// Stage registered on the fly
    Inline(StageDef),
    /// Step registered on the fly, wrapped in a stage of the same id
    InlineStep(Step),
}

impl StageRef {
    /// Parse `"id"` or `"id AS alias"`
    pub fn parse(value: &str) -> Self {
        match value.split_once(" AS ") {
            Some((id, alias)) => StageRef::ByAlias {
                id: id.trim().to_string(),
                alias: alias.trim().to_string(),
            },
            None => StageRef::ById(value.trim().to_string()),
        }
    }
}

impl From<&str> for StageRef {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<String> for StageRef {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<StageDef> for StageRef {
    fn from(value: StageDef) -> Self {
        StageRef::Inline(value)
    }
}

impl From<Step> for StageRef {
    fn from(value: Step) -> Self {
        StageRef::InlineStep(value)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SEQUENCE
// ═══════════════════════════════════════════════════════════════════════════

/// How a sequence entry repeats
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SequenceKind {
    Plain,
    /// Runs exactly `num` rounds
    Repeat { num: u32 },
    /// Runs while the condition holds, possibly zero times
    Loop {
        #[serde(skip)]
        condition: LoopCondition,
    },
    /// Runs once, then while the condition holds
    DoLoop {
        #[serde(skip)]
        condition: LoopCondition,
    },
    Gameover,
}

impl SequenceKind {
    pub fn name(&self) -> &'static str {
        match self {
            SequenceKind::Plain => "plain",
            SequenceKind::Repeat { .. } => "repeat",
            SequenceKind::Loop { .. } => "loop",
            SequenceKind::DoLoop { .. } => "doLoop",
            SequenceKind::Gameover => "gameover",
        }
    }

    /// Loop predicate of `loop`/`doLoop` entries
    pub fn condition(&self) -> Option<&LoopCondition> {
        match self {
            SequenceKind::Loop { condition } | SequenceKind::DoLoop { condition } => {
                Some(condition)
            }
            _ => None,
        }
    }

    #[inline]
    pub fn is_looping(&self) -> bool {
        self.condition().is_some()
    }

    #[inline]
    pub fn is_gameover(&self) -> bool {
        matches!(self, SequenceKind::Gameover)
    }
}

/// One stage occurrence in the finalized plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceEntry {
    /// Stage id, or alias when the stage was placed under one
    pub id: String,
    #[serde(flatten)]
    pub kind: SequenceKind,
    pub steps: Vec<String>,
}

impl SequenceEntry {
    /// Repeat count of `repeat` entries
    pub fn num(&self) -> Option<u32> {
        match self.kind {
            SequenceKind::Repeat { num } => Some(num),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_stage_ref_parse() {
        match StageRef::from("intro AS intro2") {
            StageRef::ByAlias { id, alias } => {
                assert_eq!(id, "intro");
                assert_eq!(alias, "intro2");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(StageRef::from("game"), StageRef::ById(id) if id == "game"));
    }

    #[test]
    fn test_callback_identity() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let cb = Callback::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let same = cb.clone();
        same.call(&mut ());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(cb.ptr_eq(&same));
        assert!(!cb.ptr_eq(&Callback::noop()));
    }

    #[test]
    fn test_step_rule_property() {
        let step = Step::new("s", Callback::noop()).with_step_rule("WAIT");
        assert_eq!(step.properties[STEP_RULE_PROPERTY], "WAIT");
    }

    #[test]
    fn test_sequence_entry_serialization() {
        let entry = SequenceEntry {
            id: "bonus".to_string(),
            kind: SequenceKind::Repeat { num: 3 },
            steps: vec!["a".to_string(), "b".to_string()],
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "repeat");
        assert_eq!(json["num"], 3);
        assert_eq!(entry.num(), Some(3));

        let looping = SequenceEntry {
            id: "l".to_string(),
            kind: SequenceKind::DoLoop {
                condition: LoopCondition::new(|| false),
            },
            steps: vec![],
        };
        let json = serde_json::to_value(&looping).unwrap();
        assert_eq!(json["type"], "doLoop");
        assert!(looping.kind.is_looping());
    }
}

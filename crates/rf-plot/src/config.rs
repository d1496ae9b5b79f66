//! Plan configuration
//!
//! JSON description of a whole plan: steps, stages, the placement
//! directives and skip list. Callbacks and loop conditions can't be
//! serialized, so the document names them and [`PlanBindings`] supplies
//! the functions when the plan is built.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::block::Positions;
use crate::error::{PlotError, PlotResult};
use crate::plan::{Callback, LoopCondition, Properties, StageDef, StageRef, Step};
use crate::stager::Stager;

/// Plan document format version
pub const PLAN_VERSION: &str = "1.0";

/// Step declaration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepConfig {
    pub id: String,
    /// Name of the bound callback; the step id when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    #[serde(default)]
    pub globals: Properties,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, rename = "stepRule", skip_serializing_if = "Option::is_none")]
    pub step_rule: Option<String>,
}

/// Stage declaration. A stage without steps is a callback stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub id: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    #[serde(default = "default_rounds")]
    pub rounds: u32,
    #[serde(default)]
    pub globals: Properties,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, rename = "stepRule", skip_serializing_if = "Option::is_none")]
    pub step_rule: Option<String>,
}

fn default_rounds() -> u32 {
    1
}

/// One placement call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlanDirective {
    Next {
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        positions: Option<String>,
    },
    Repeat {
        stage: String,
        num: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        positions: Option<String>,
    },
    Loop {
        stage: String,
        condition: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        positions: Option<String>,
    },
    DoLoop {
        stage: String,
        condition: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        positions: Option<String>,
    },
    Gameover,
    /// Extra step for the stage placed last
    Step {
        step: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        positions: Option<String>,
    },
    /// Group of stages, or of steps when `steps` is set
    BeginBlock {
        id: String,
        #[serde(default)]
        steps: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        positions: Option<String>,
    },
    EndBlock,
}

impl PlanDirective {
    /// `(stage, alias)` of stage-placing directives
    fn placement(&self) -> Option<(&str, Option<&str>)> {
        match self {
            PlanDirective::Next { stage, alias, .. }
            | PlanDirective::Repeat { stage, alias, .. }
            | PlanDirective::Loop { stage, alias, .. }
            | PlanDirective::DoLoop { stage, alias, .. } => {
                Some((stage.as_str(), alias.as_deref()))
            }
            _ => None,
        }
    }
}

/// Stage or step excluded at finalize
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipConfig {
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

/// Stager-wide defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanDefaults {
    #[serde(default, rename = "stepRule", skip_serializing_if = "Option::is_none")]
    pub step_rule: Option<String>,
    #[serde(default)]
    pub globals: Properties,
    #[serde(default)]
    pub properties: Properties,
}

/// Complete plan document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub plan: Vec<PlanDirective>,
    #[serde(default)]
    pub skip: Vec<SkipConfig>,
    #[serde(default)]
    pub defaults: PlanDefaults,
}

fn default_version() -> String {
    PLAN_VERSION.to_string()
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            version: PLAN_VERSION.to_string(),
            name: String::new(),
            steps: Vec::new(),
            stages: Vec::new(),
            plan: Vec::new(),
            skip: Vec::new(),
            defaults: PlanDefaults::default(),
        }
    }
}

/// Functions referenced by name from a [`PlanConfig`]
#[derive(Debug, Clone, Default)]
pub struct PlanBindings {
    callbacks: HashMap<String, Callback>,
    conditions: HashMap<String, LoopCondition>,
    pub(crate) default_callback: Option<Callback>,
    seed: Option<u64>,
}

impl PlanBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(mut self, name: impl Into<String>, callback: Callback) -> Self {
        self.callbacks.insert(name.into(), callback);
        self
    }

    pub fn condition(mut self, name: impl Into<String>, condition: LoopCondition) -> Self {
        self.conditions.insert(name.into(), condition);
        self
    }

    /// Callback for every name without its own binding
    pub fn default_callback(mut self, callback: Callback) -> Self {
        self.default_callback = Some(callback);
        self
    }

    /// Seed for flexible placements
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub(crate) fn resolve_callback(&self, name: &str) -> PlotResult<Callback> {
        self.callbacks
            .get(name)
            .or(self.default_callback.as_ref())
            .cloned()
            .ok_or_else(|| PlotError::InvalidConfig(format!("no callback bound for '{}'", name)))
    }

    pub(crate) fn resolve_condition(&self, name: &str) -> PlotResult<LoopCondition> {
        self.conditions
            .get(name)
            .cloned()
            .ok_or_else(|| {
                PlotError::InvalidConfig(format!("no loop condition bound for '{}'", name))
            })
    }
}

impl PlanConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from JSON, checking the format version
    pub fn from_json(json: &str) -> PlotResult<Self> {
        let raw: serde_json::Value = serde_json::from_str(json)?;
        let version = raw["version"].as_str().unwrap_or(PLAN_VERSION);
        match version {
            PLAN_VERSION => Ok(serde_json::from_value(raw)?),
            _ => Err(PlotError::InvalidConfig(format!(
                "Unknown plan version: {}",
                version
            ))),
        }
    }

    pub fn to_json(&self) -> PlotResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Names of the loop conditions the plan needs
    pub fn condition_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .plan
            .iter()
            .filter_map(|d| match d {
                PlanDirective::Loop { condition, .. } | PlanDirective::DoLoop { condition, .. } => {
                    Some(condition.as_str())
                }
                _ => None,
            })
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Check ids and cross references. Stages must be declared before the
    /// plan places them; steps a stage lists may be left undeclared and get
    /// the default callback.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let mut steps = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                errors.push("Step with empty id".to_string());
            } else if !steps.insert(step.id.as_str()) {
                errors.push(format!("Duplicate step '{}'", step.id));
            }
        }

        let mut stages = HashSet::new();
        for stage in &self.stages {
            if stage.id.trim().is_empty() {
                errors.push("Stage with empty id".to_string());
                continue;
            }
            if !stages.insert(stage.id.as_str()) {
                errors.push(format!("Duplicate stage '{}'", stage.id));
            }
            if stage.rounds == 0 {
                errors.push(format!("Stage '{}': rounds must be at least 1", stage.id));
            }
            if stage.steps.is_empty() && steps.contains(stage.id.as_str()) {
                errors.push(format!(
                    "Callback stage '{}' collides with a step of the same id",
                    stage.id
                ));
            }
        }

        let mut placed = HashSet::new();
        let mut depth = 0usize;
        let mut has_stage = false;
        for (i, directive) in self.plan.iter().enumerate() {
            if let Some((stage, alias)) = directive.placement() {
                if !stages.contains(stage) {
                    errors.push(format!("Plan entry {} places unknown stage '{}'", i, stage));
                }
                let id = alias.unwrap_or(stage);
                if !placed.insert(id) {
                    errors.push(format!(
                        "Plan entry {}: '{}' is placed twice, give it an alias",
                        i, id
                    ));
                }
                has_stage = true;
            }
            match directive {
                PlanDirective::Repeat { num: 0, stage, .. } => {
                    errors.push(format!("Plan entry {}: repeat of '{}' needs num >= 1", i, stage));
                }
                PlanDirective::Step { step, .. } if !has_stage => {
                    errors.push(format!("Plan entry {}: step '{}' before any stage", i, step));
                }
                PlanDirective::BeginBlock { .. } => depth += 1,
                PlanDirective::EndBlock => {
                    if depth == 0 {
                        errors.push(format!("Plan entry {}: endBlock without beginBlock", i));
                    } else {
                        depth -= 1;
                    }
                }
                _ => {}
            }
        }

        for skip in &self.skip {
            if !stages.contains(skip.stage.as_str()) && !placed.contains(skip.stage.as_str()) {
                errors.push(format!("Skip references unknown stage '{}'", skip.stage));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Build an unfinalized stager with skips applied
    pub fn build(&self, bindings: &PlanBindings) -> PlotResult<Stager> {
        self.validate()
            .map_err(|errors| PlotError::InvalidConfig(errors.join("; ")))?;

        let mut stager = match bindings.seed {
            Some(seed) => Stager::with_seed(seed),
            None => Stager::new(),
        };
        if let Some(callback) = &bindings.default_callback {
            stager.set_default_callback(callback.clone());
        }
        if let Some(rule) = &self.defaults.step_rule {
            stager.set_default_step_rule(rule.clone());
        }
        stager
            .set_default_globals(self.defaults.globals.clone())
            .set_default_properties(self.defaults.properties.clone());

        for config in &self.steps {
            let name = config.callback.as_deref().unwrap_or(&config.id);
            let mut step = Step::new(config.id.clone(), bindings.resolve_callback(name)?);
            step.globals = config.globals.clone();
            step.properties = config.properties.clone();
            if let Some(rule) = &config.step_rule {
                step = step.with_step_rule(rule.clone());
            }
            stager.add_step(step)?;
        }

        for config in &self.stages {
            let mut def = if config.steps.is_empty() {
                let name = config.callback.as_deref().unwrap_or(&config.id);
                StageDef::with_callback(config.id.clone(), bindings.resolve_callback(name)?)
            } else {
                StageDef::new(config.id.clone()).steps(config.steps.iter().map(String::as_str))
            };
            def.rounds = config.rounds;
            def.globals = config.globals.clone();
            def.properties = config.properties.clone();
            if let Some(rule) = &config.step_rule {
                def = def.with_step_rule(rule.clone());
            }
            stager.add_stage(def)?;
        }

        for directive in &self.plan {
            apply_directive(&mut stager, directive, bindings)?;
        }

        for skip in &self.skip {
            stager.skip(&skip.stage, skip.step.as_deref())?;
        }

        log::debug!(
            "Plan '{}' built: {} steps, {} stages, {} directives",
            self.name,
            self.steps.len(),
            self.stages.len(),
            self.plan.len()
        );
        Ok(stager)
    }
}

fn stage_ref(stage: &str, alias: Option<&str>) -> StageRef {
    match alias {
        Some(alias) => StageRef::ByAlias {
            id: stage.to_string(),
            alias: alias.to_string(),
        },
        None => StageRef::ById(stage.to_string()),
    }
}

fn apply_directive(
    stager: &mut Stager,
    directive: &PlanDirective,
    bindings: &PlanBindings,
) -> PlotResult<()> {
    let at = |positions: &Option<String>| Positions::from(positions.as_deref());
    match directive {
        PlanDirective::Next { stage, alias, positions } => {
            stager.next_at(stage_ref(stage, alias.as_deref()), at(positions))?;
        }
        PlanDirective::Repeat { stage, num, alias, positions } => {
            stager.repeat_at(stage_ref(stage, alias.as_deref()), *num, at(positions))?;
        }
        PlanDirective::Loop { stage, condition, alias, positions } => {
            let condition = bindings.resolve_condition(condition)?;
            stager.loop_at(stage_ref(stage, alias.as_deref()), condition, at(positions))?;
        }
        PlanDirective::DoLoop { stage, condition, alias, positions } => {
            let condition = bindings.resolve_condition(condition)?;
            stager.do_loop_at(stage_ref(stage, alias.as_deref()), condition, at(positions))?;
        }
        PlanDirective::Gameover => {
            stager.gameover()?;
        }
        PlanDirective::Step { step, positions } => {
            stager.step_at(step.as_str(), at(positions))?;
        }
        PlanDirective::BeginBlock { id, steps, positions } => {
            if *steps {
                stager.begin_step_block(id, at(positions))?;
            } else {
                stager.begin_block(id, at(positions))?;
            }
        }
        PlanDirective::EndBlock => {
            stager.end_block()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stager::SequenceFormat;
    use serde_json::json;

    fn document() -> serde_json::Value {
        json!({
            "version": "1.0",
            "name": "auction",
            "steps": [
                { "id": "bid", "properties": { "timer": 30 } },
                { "id": "results", "stepRule": "SYNC_STEP" }
            ],
            "stages": [
                { "id": "intro" },
                { "id": "game", "steps": ["bid", "results"], "globals": { "currency": "EUR" } },
                { "id": "bonus", "steps": ["bid"] }
            ],
            "plan": [
                { "type": "next", "stage": "intro" },
                { "type": "repeat", "stage": "game", "num": 3 },
                { "type": "doLoop", "stage": "bonus", "condition": "again" },
                { "type": "next", "stage": "game", "alias": "final" },
                { "type": "gameover" }
            ],
            "defaults": { "stepRule": "SOLO", "properties": { "timer": 60 } }
        })
    }

    fn bindings() -> PlanBindings {
        PlanBindings::new()
            .default_callback(Callback::noop())
            .condition("again", LoopCondition::new(|| false))
            .seed(3)
    }

    #[test]
    fn test_load_and_build() {
        let config = PlanConfig::from_json(&document().to_string()).unwrap();
        assert_eq!(config.name, "auction");
        assert_eq!(config.condition_names(), vec!["again"]);

        let mut stager = config.build(&bindings()).unwrap();
        stager.finalize().unwrap();
        assert_eq!(
            stager.get_sequence(SequenceFormat::Stages),
            vec!["intro", "game [x3]", "bonus [doLoop]", "final", "gameover"]
        );
        assert_eq!(stager.default_step_rule(), "SOLO");
        assert_eq!(stager.get_step("results").unwrap().properties["stepRule"], json!("SYNC_STEP"));
        assert_eq!(stager.get_stage("final").unwrap().globals["currency"], json!("EUR"));
    }

    #[test]
    fn test_round_trip_json() {
        let config = PlanConfig::from_json(&document().to_string()).unwrap();
        let again = PlanConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(again.plan.len(), 5);
        assert!(matches!(again.plan[2], PlanDirective::DoLoop { .. }));
    }

    #[test]
    fn test_unknown_version() {
        let mut doc = document();
        doc["version"] = json!("9.0");
        let err = PlanConfig::from_json(&doc.to_string()).unwrap_err();
        assert!(matches!(err, PlotError::InvalidConfig(_)));
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut doc = document();
        doc["plan"] = json!([
            { "type": "step", "step": "bid" },
            { "type": "next", "stage": "missing" },
            { "type": "next", "stage": "intro" },
            { "type": "next", "stage": "intro" },
            { "type": "repeat", "stage": "game", "num": 0 },
            { "type": "endBlock" }
        ]);
        doc["skip"] = json!([{ "stage": "nowhere" }]);
        let config = PlanConfig::from_json(&doc.to_string()).unwrap();
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 7);
        assert!(config.build(&bindings()).is_err());
    }

    #[test]
    fn test_unbound_names() {
        let config = PlanConfig::from_json(&document().to_string()).unwrap();

        let no_condition = PlanBindings::new().default_callback(Callback::noop());
        let err = config.build(&no_condition).unwrap_err();
        assert!(err.to_string().contains("again"));

        let no_callback = PlanBindings::new().condition("again", LoopCondition::new(|| true));
        assert!(matches!(config.build(&no_callback), Err(PlotError::InvalidConfig(_))));
    }

    #[test]
    fn test_blocks_and_skip() {
        let doc = json!({
            "version": "1.0",
            "stages": [
                { "id": "a" }, { "id": "b" }, { "id": "c" }
            ],
            "steps": [{ "id": "extra" }],
            "plan": [
                { "type": "beginBlock", "id": "shuffle" },
                { "type": "next", "stage": "a", "positions": "*" },
                { "type": "next", "stage": "b", "positions": "*" },
                { "type": "endBlock" },
                { "type": "next", "stage": "c" },
                { "type": "step", "step": "extra" }
            ],
            "skip": [{ "stage": "b" }]
        });
        let config = PlanConfig::from_json(&doc.to_string()).unwrap();
        config.validate().unwrap();
        let mut stager = config.build(&bindings()).unwrap();
        assert!(stager.is_skipped("b", None));
        stager.finalize().unwrap();
        assert_eq!(stager.get_sequence(SequenceFormat::Steps), vec!["a.a", "c.c", "c.extra"]);
    }
}

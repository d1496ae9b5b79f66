//! # Game Plot
//!
//! Stage/step sequencing for multiplayer game sessions.
//!
//! ## Architecture
//!
//! - **Position**: `stage.step.round` address, by index or by id
//! - **Blocks**: ordered slot containers with constraint-based placement
//! - **Stager**: fluent plan builder, flattened into a sequence by `finalize`
//! - **GamePlot**: next/previous/jump navigation, globals and cached
//!   property lookup
//! - **Rules**: named step rules gating when a player may advance
//! - **Config**: JSON plan documents with callbacks bound by name
//!
//! ## Example
//!
//! ```
//! use rf_plot::{Callback, GamePlot, Navigation, Position, StageDef, Stager};
//!
//! let mut stager = Stager::with_seed(1);
//! stager.add_stage(StageDef::with_callback("intro", Callback::noop())).unwrap();
//! stager.add_stage(StageDef::with_callback("game", Callback::noop())).unwrap();
//! stager.next("intro").unwrap().repeat("game", 2).unwrap().gameover().unwrap();
//!
//! let mut plot = GamePlot::new(stager).unwrap();
//! let first = plot.next(&Position::start());
//! assert_eq!(first, Navigation::At("1.1.1".parse().unwrap()));
//! ```

pub mod block;
pub mod config;
pub mod error;
pub mod plan;
pub mod plot;
pub mod position;
pub mod rules;
pub mod stager;

pub use block::*;
pub use config::*;
pub use error::*;
pub use plan::*;
pub use plot::*;
pub use position::*;
pub use rules::{PeerState, RuleContext, StageLevel, StepRule, StepRuleRegistry};
pub use stager::*;

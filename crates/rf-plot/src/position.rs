//! Position
//!
//! An addressable point in the game plot
//!
//! A position is the triple `stage.step.round`. Stage and step are either
//! 1-based indices into the finalized sequence or ids that still need to be
//! resolved against it (see [`crate::GamePlot::normalize`]). The all-zero
//! triple `0.0.0` is the pre-game sentinel.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PlotError, PlotResult};

/// Stage or step identifier: a 1-based index or a (not yet resolved) id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ident {
    Index(u32),
    Name(String),
}

impl Ident {
    /// Parse one segment of a hash string.
    ///
    /// All-digit segments become indices, anything else is a name.
    pub fn parse(segment: &str) -> PlotResult<Self> {
        if segment.is_empty() {
            return Err(PlotError::InvalidPosition("empty segment".to_string()));
        }
        if segment.bytes().all(|b| b.is_ascii_digit()) {
            return segment
                .parse::<u32>()
                .map(Ident::Index)
                .map_err(|e| PlotError::InvalidPosition(format!("{}: {}", segment, e)));
        }
        if let Some(rest) = segment.strip_prefix('-')
            && !rest.is_empty()
            && rest.bytes().all(|b| b.is_ascii_digit() || b == b'.')
        {
            return Err(PlotError::InvalidPosition(format!(
                "negative value: {}",
                segment
            )));
        }
        Ok(Ident::Name(segment.to_string()))
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        matches!(self, Ident::Index(0))
    }

    #[inline]
    pub fn index(&self) -> Option<u32> {
        match self {
            Ident::Index(i) => Some(*i),
            Ident::Name(_) => None,
        }
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        match self {
            Ident::Index(_) => None,
            Ident::Name(n) => Some(n),
        }
    }
}

impl From<u32> for Ident {
    fn from(value: u32) -> Self {
        Ident::Index(value)
    }
}

impl From<&str> for Ident {
    fn from(value: &str) -> Self {
        Ident::Name(value.to_string())
    }
}

impl From<String> for Ident {
    fn from(value: String) -> Self {
        Ident::Name(value)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ident::Index(i) => write!(f, "{}", i),
            Ident::Name(n) => f.write_str(n),
        }
    }
}

impl PartialOrd for Ident {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Indices sort before names; names sort lexically.
impl Ord for Ident {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Ident::Index(a), Ident::Index(b)) => a.cmp(b),
            (Ident::Index(_), Ident::Name(_)) => Ordering::Less,
            (Ident::Name(_), Ident::Index(_)) => Ordering::Greater,
            (Ident::Name(a), Ident::Name(b)) => a.cmp(b),
        }
    }
}

/// Loose description of a position, with optional fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionParts {
    pub stage: Option<Ident>,
    pub step: Option<Ident>,
    pub round: Option<u32>,
}

/// Immutable `stage.step.round` triple
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Position {
    stage: Ident,
    step: Ident,
    round: u32,
}

impl Position {
    /// The pre-game sentinel `0.0.0`
    pub const fn start() -> Self {
        Self {
            stage: Ident::Index(0),
            step: Ident::Index(0),
            round: 0,
        }
    }

    /// Create a validated position
    pub fn new(stage: impl Into<Ident>, step: impl Into<Ident>, round: u32) -> PlotResult<Self> {
        let pos = Self {
            stage: stage.into(),
            step: step.into(),
            round,
        };
        pos.validate()?;
        Ok(pos)
    }

    /// Numeric position from indices the caller knows to be 1-based
    pub(crate) const fn at(stage: u32, step: u32, round: u32) -> Self {
        Self {
            stage: Ident::Index(stage),
            step: Ident::Index(step),
            round,
        }
    }

    /// First step of the first round of a stage (`0` yields the sentinel)
    pub fn of_stage(stage: impl Into<Ident>) -> PlotResult<Self> {
        Self::from_parts(PositionParts {
            stage: Some(stage.into()),
            ..Default::default()
        })
    }

    /// Fill in missing fields: step and round default to 1, or to 0 when
    /// the stage is 0.
    pub fn from_parts(parts: PositionParts) -> PlotResult<Self> {
        let stage = parts.stage.unwrap_or(Ident::Index(0));
        let fill = if stage.is_zero() { 0 } else { 1 };
        let step = parts.step.unwrap_or(Ident::Index(fill));
        let round = parts.round.unwrap_or(fill);
        Self::new(stage, step, round)
    }

    fn validate(&self) -> PlotResult<()> {
        for ident in [&self.stage, &self.step] {
            if let Ident::Name(n) = ident
                && n.is_empty()
            {
                return Err(PlotError::InvalidPosition(
                    "stage and step names must be non-empty".to_string(),
                ));
            }
        }
        let zeros = [self.stage.is_zero(), self.step.is_zero(), self.round == 0];
        if zeros.iter().any(|z| *z) && !zeros.iter().all(|z| *z) {
            return Err(PlotError::InvalidPosition(format!(
                "{}: only 0.0.0 may contain zeros",
                self
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn stage(&self) -> &Ident {
        &self.stage
    }

    #[inline]
    pub fn step(&self) -> &Ident {
        &self.step
    }

    #[inline]
    pub fn round(&self) -> u32 {
        self.round
    }

    /// True for the `0.0.0` sentinel
    #[inline]
    pub fn is_start(&self) -> bool {
        self.stage.is_zero()
    }

    /// True when both stage and step are indices
    pub fn is_numeric(&self) -> bool {
        self.stage.index().is_some() && self.step.index().is_some()
    }

    /// Render the position through a template: `S` is replaced by the
    /// stage, `s` by the step and `r` by the round. Other characters are
    /// copied literally.
    pub fn to_hash(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len() + 8);
        for c in template.chars() {
            match c {
                'S' => out.push_str(&self.stage.to_string()),
                's' => out.push_str(&self.step.to_string()),
                'r' => out.push_str(&self.round.to_string()),
                other => out.push(other),
            }
        }
        out
    }

    /// Template rendering of an arbitrary position
    pub fn hash_with(template: &str, pos: &Position) -> String {
        pos.to_hash(template)
    }

    /// Order two optional positions. A missing position sorts after any
    /// present one.
    ///
    /// Names must be resolved (see [`crate::GamePlot::normalize`]) before
    /// comparing positions of a real plot; unresolved names sort after all
    /// indices so the order stays total.
    pub fn compare(a: Option<&Position>, b: Option<&Position>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::start()
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Stage first, then round, then step.
impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.stage
            .cmp(&other.stage)
            .then(self.round.cmp(&other.round))
            .then_with(|| self.step.cmp(&other.step))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.stage, self.step, self.round)
    }
}

impl FromStr for Position {
    type Err = PlotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = s.split('.').collect();
        if segments.len() > 3 {
            return Err(PlotError::InvalidPosition(format!(
                "{}: too many segments",
                s
            )));
        }
        let stage = Ident::parse(segments[0])?;
        let step = match segments.get(1) {
            Some(seg) => Some(Ident::parse(seg)?),
            None => None,
        };
        let round = match segments.get(2) {
            Some(seg) => match Ident::parse(seg)? {
                Ident::Index(r) => Some(r),
                Ident::Name(n) => {
                    return Err(PlotError::InvalidPosition(format!(
                        "round must be a number: {}",
                        n
                    )));
                }
            },
            None => None,
        };
        Self::from_parts(PositionParts {
            stage: Some(stage),
            step,
            round,
        })
    }
}

impl TryFrom<String> for Position {
    type Error = PlotError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Position> for String {
    fn from(value: Position) -> Self {
        value.to_string()
    }
}

/// `0` is the sentinel, `N` is `N.1.1`.
impl From<u32> for Position {
    fn from(stage: u32) -> Self {
        if stage == 0 {
            Self::start()
        } else {
            Self {
                stage: Ident::Index(stage),
                step: Ident::Index(1),
                round: 1,
            }
        }
    }
}

impl TryFrom<i64> for Position {
    type Error = PlotError;

    fn try_from(stage: i64) -> Result<Self, Self::Error> {
        u32::try_from(stage)
            .map(Position::from)
            .map_err(|_| PlotError::InvalidPosition(format!("stage out of range: {}", stage)))
    }
}

//! Reusable agent fixtures.
//!
//! - [`Walker`] moves by a fixed velocity every time it fires.
//! - [`Ticker`] stays put and records the times it fired.
//! - [`RandomWalker`] jitters around using the process random stream.

use std::io::{Read, Write};

use halo_core::codec::{read_f64_le, read_position, read_u32_le, write_f64_le, write_position, write_u32_le};
use halo_core::{Position, WireError};
use halo_engine::{Agent, AgentKind, AgentRegistry, SimError, StepContext};
use rand::Rng;

/// Registry with every fixture kind.
pub fn registry() -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    registry
        .register::<Walker>()
        .register::<Ticker>()
        .register::<RandomWalker>();
    registry
}

/// Moves by `velocity` each time it fires.
#[derive(Clone, Debug, PartialEq)]
pub struct Walker {
    pub velocity: Position,
    pub steps: u32,
}

impl Walker {
    pub fn new(velocity: &[f64]) -> Self {
        Self {
            velocity: velocity.iter().copied().collect(),
            steps: 0,
        }
    }
}

impl Agent for Walker {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), SimError> {
        self.steps += 1;
        let next: Position = ctx
            .position()
            .iter()
            .zip(&self.velocity)
            .map(|(p, v)| p + v)
            .collect();
        ctx.move_to(&next)?;
        ctx.add_stat(self.steps.to_le_bytes().to_vec());
        Ok(())
    }

    fn encode(&self, w: &mut dyn Write) -> Result<(), WireError> {
        write_position(w, &self.velocity)?;
        write_u32_le(w, self.steps)
    }
}

impl AgentKind for Walker {
    const KIND: &'static str = "walker";

    fn decode(r: &mut dyn Read) -> Result<Self, WireError> {
        Ok(Self {
            velocity: read_position(r)?,
            steps: read_u32_le(r)?,
        })
    }
}

/// Never moves; records every firing time as a stat.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ticker {
    pub fired: u32,
}

impl Agent for Ticker {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), SimError> {
        self.fired += 1;
        let time = ctx.time();
        ctx.add_stat(time.to_le_bytes().to_vec());
        Ok(())
    }

    fn encode(&self, w: &mut dyn Write) -> Result<(), WireError> {
        write_u32_le(w, self.fired)
    }
}

impl AgentKind for Ticker {
    const KIND: &'static str = "ticker";

    fn decode(r: &mut dyn Read) -> Result<Self, WireError> {
        Ok(Self {
            fired: read_u32_le(r)?,
        })
    }
}

/// Jumps up to `reach` along every axis each time it fires.
///
/// Only meant for toroidal domains: on a bounded one a jump may leave
/// the domain.
#[derive(Clone, Debug, PartialEq)]
pub struct RandomWalker {
    pub reach: f64,
    pub moves: u32,
}

impl RandomWalker {
    pub fn new(reach: f64) -> Self {
        Self { reach, moves: 0 }
    }
}

impl Agent for RandomWalker {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), SimError> {
        let reach = self.reach;
        let current: Position = ctx.position().iter().copied().collect();
        let next: Position = current
            .iter()
            .map(|p| p + ctx.rng().gen_range(-reach..=reach))
            .collect();
        ctx.move_to(&next)?;
        self.moves += 1;
        Ok(())
    }

    fn encode(&self, w: &mut dyn Write) -> Result<(), WireError> {
        write_f64_le(w, self.reach)?;
        write_u32_le(w, self.moves)
    }
}

impl AgentKind for RandomWalker {
    const KIND: &'static str = "random-walker";

    fn decode(r: &mut dyn Read) -> Result<Self, WireError> {
        Ok(Self {
            reach: read_f64_le(r)?,
            moves: read_u32_le(r)?,
        })
    }
}

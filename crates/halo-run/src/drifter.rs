//! The agent the runner populates its world with.

use std::io::{Read, Write};

use halo::engine::{Agent, AgentKind, SimError, StepContext};
use halo::types::codec::{read_f64_le, read_u32_le, read_u8, write_f64_le, write_u32_le, write_u8};
use halo::types::{Position, WireError};
use rand::Rng;

/// Jumps a uniformly random distance up to `reach` along each axis.
///
/// On a bounded domain the jump is clamped to the edge; on a torus it
/// wraps.
#[derive(Clone, Debug, PartialEq)]
pub struct Drifter {
    pub reach: f64,
    pub wrap: bool,
    pub hops: u32,
}

impl Drifter {
    pub fn new(reach: f64, wrap: bool) -> Self {
        Self {
            reach,
            wrap,
            hops: 0,
        }
    }
}

impl Agent for Drifter {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), SimError> {
        let world = ctx.world();
        let reach = self.reach;
        let current: Position = ctx.position().iter().copied().collect();
        let mut next = Position::with_capacity(current.len());
        for (axis, p) in current.iter().enumerate() {
            let mut x = p + ctx.rng().gen_range(-reach..=reach);
            if !self.wrap {
                let lo = world.min[axis] as f64;
                let hi = world.max[axis] as f64;
                x = x.clamp(lo, hi.next_down());
            }
            next.push(x);
        }
        ctx.move_to(&next)?;
        self.hops += 1;
        Ok(())
    }

    fn encode(&self, w: &mut dyn Write) -> Result<(), WireError> {
        write_f64_le(w, self.reach)?;
        write_u8(w, self.wrap as u8)?;
        write_u32_le(w, self.hops)
    }
}

impl AgentKind for Drifter {
    const KIND: &'static str = "drifter";

    fn decode(r: &mut dyn Read) -> Result<Self, WireError> {
        Ok(Self {
            reach: read_f64_le(r)?,
            wrap: read_u8(r)? != 0,
            hops: read_u32_le(r)?,
        })
    }
}

//! Avalon interface family: the clock and reset interfaces every
//! synchronous Avalon interface carries, plus the streaming instance.
//!
//! The reset control sits at the outermost precedence level of any
//! synchronous interface: whatever else the wires show, an asserted reset
//! parks the machine on reset's fix side.

pub mod st;

use crate::error::Result;
use crate::interface::{Interface, SignalDecl};
use crate::signal::{Control, Signal};
use crate::sim::Entity;

/// Which clock edges the reset is synchronized to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SynchronousEdges {
    None,
    #[default]
    Deassert,
    Both,
}

/// The Avalon clock interface: a single required `clk` wire.
pub fn clock_specification() -> Vec<SignalDecl> {
    vec![Signal::new("clk").meta().required().into()]
}

/// The Avalon reset interface. `reset` is active (fix) when high, so its
/// flow/fix partition is inverted relative to an ordinary control.
pub fn reset_specification() -> Vec<SignalDecl> {
    vec![
        Control::new("reset").required().values([false], [true]).into(),
        Control::new("reset_req").precedence(1).into(),
    ]
}

pub struct ClockInterface {
    core: Interface,
    rate: Option<u32>,
}

impl ClockInterface {
    pub fn new(entity: &dyn Entity, rate: Option<u32>) -> Result<Self> {
        let mut core = Interface::new(None, Some("avalon"));
        core.specify(clock_specification(), false, entity, None)?;
        Ok(Self { core, rate })
    }

    pub fn interface(&self) -> &Interface {
        &self.core
    }

    pub fn rate(&self) -> Option<u32> {
        self.rate
    }

    pub fn rate_known(&self) -> bool {
        self.rate.is_some()
    }
}

pub struct ResetInterface {
    core: Interface,
    edges: SynchronousEdges,
}

impl ResetInterface {
    pub fn new(entity: &dyn Entity, edges: SynchronousEdges) -> Result<Self> {
        let mut core = Interface::new(None, Some("avalon"));
        core.specify(reset_specification(), false, entity, None)?;
        Ok(Self { core, edges })
    }

    pub fn interface(&self) -> &Interface {
        &self.core
    }

    pub fn edges(&self) -> SynchronousEdges {
        self.edges
    }
}

//! Behavioral modeling core for synchronous digital interfaces.
//!
//! An interface is declared as a set of [`signal::Signal`]s and
//! [`signal::Control`]s; assembling them into an [`interface::Interface`]
//! binds the declarations to a simulator's wires. From the controls'
//! precedence order, flow/fix value partitions, and latency/allowance
//! relaxations, [`elaborate`] builds a hierarchical state machine that
//! enforces the interface's legal temporal behavior, and a
//! [`model::Model`] runs that machine tick by tick to translate logical
//! transactions into driven stimulus and sampled stimulus back into
//! logical transactions.
//!
//! The simulator itself stays behind the small facade in [`sim`]; the
//! [`virt`] module implements it in memory for tests and demos. The
//! [`avalon`] module instantiates the core for the Avalon streaming
//! protocol.

pub mod adapters;
pub mod avalon;
pub mod elaborate;
pub mod error;
pub mod hsm;
pub mod interface;
pub mod logic;
pub mod model;
pub mod reaction;
pub mod signal;
pub mod sim;
pub mod virt;

pub use adapters::{Driver, Monitor};
pub use elaborate::elaborate;
pub use error::{Error, Result};
pub use interface::{Interface, SignalDecl};
pub use logic::{Bit, LogicVector};
pub use model::{Behavior, Context, Model, Txn, TxnBuffer};
pub use reaction::{FilterDecl, Reaction, Schedule};
pub use signal::{Control, Direction, LogicalType, LogicalValue, Signal};
pub use sim::{Entity, Tick, Wire};

//! Declarative signal and control-signal specifications.
//!
//! A [`Signal`] describes one logical wire of an interface: permissible
//! widths, direction, polarity, logical type, and an optional validation
//! filter. It is declared unbound and later bound to a simulator wire when
//! its interface is assembled.
//!
//! A [`Control`] is a signal whose transitions partition the interface's
//! behavioral state. Every distinct logical value a control may take on
//! corresponds to a nested state its interface's machine can occupy; values
//! that keep the interface operational are its *flow* values, values that
//! keep it idle are its *fix* values.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::logic::LogicVector;
use crate::sim::Wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    FromPrimary,
    ToPrimary,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalType {
    Bool,
    Int,
    Vector,
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogicalType::Bool => "bool",
            LogicalType::Int => "int",
            LogicalType::Vector => "bit-vector",
        };
        write!(f, "{s}")
    }
}

/// A sampled or driven logical value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalValue {
    Bool(bool),
    Int(u64),
    Vector(LogicVector),
}

impl LogicalValue {
    pub fn kind(&self) -> LogicalType {
        match self {
            LogicalValue::Bool(_) => LogicalType::Bool,
            LogicalValue::Int(_) => LogicalType::Int,
            LogicalValue::Vector(_) => LogicalType::Vector,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            LogicalValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            LogicalValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&LogicVector> {
        match self {
            LogicalValue::Vector(v) => Some(v),
            _ => None,
        }
    }
}

/// Validation callback wrapped around every capture and drive.
///
/// Filters always observe active-high logical values: they run after
/// polarity inversion on capture and before it on drive.
pub type FilterFn = Rc<dyn Fn(&LogicVector) -> Result<()>>;

pub struct Signal {
    name: String,
    widths: BTreeSet<usize>,
    direction: Direction,
    required: bool,
    active_high: bool,
    meta: bool,
    logical_type: LogicalType,
    handle: Option<Rc<dyn Wire>>,
    filter: Option<FilterFn>,
}

impl Signal {
    /// Declares a width-1, from-primary, active-high `bool` signal.
    /// Polarity defaults to active-low for names suffixed `_n`.
    pub fn new(name: &str) -> Self {
        assert!(!name.is_empty(), "signal names must be non-empty");
        Self {
            name: name.to_string(),
            widths: BTreeSet::from([1]),
            direction: Direction::FromPrimary,
            required: false,
            active_high: !name.ends_with("_n"),
            meta: false,
            logical_type: LogicalType::Bool,
            handle: None,
            filter: None,
        }
    }

    pub fn widths(mut self, widths: impl IntoIterator<Item = usize>) -> Self {
        let widths: BTreeSet<usize> = widths.into_iter().collect();
        assert!(!widths.is_empty(), "signal `{}` needs at least one width", self.name);
        assert!(
            widths.iter().all(|w| *w >= 1),
            "signal `{}` widths must be positive",
            self.name
        );
        self.widths = widths;
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Marks the signal as protocol framing; meta signals are excluded from
    /// logical transactions.
    pub fn meta(mut self) -> Self {
        self.meta = true;
        self
    }

    pub fn logical_type(mut self, logical_type: LogicalType) -> Self {
        self.logical_type = logical_type;
        self
    }

    /// Overrides the polarity inferred from the name.
    pub fn active_high(mut self, active_high: bool) -> Self {
        self.active_high = active_high;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_meta(&self) -> bool {
        self.meta
    }

    pub fn is_active_high(&self) -> bool {
        self.active_high
    }

    pub fn get_direction(&self) -> Direction {
        self.direction
    }

    pub fn get_type(&self) -> LogicalType {
        self.logical_type
    }

    pub fn allowed_widths(&self) -> &BTreeSet<usize> {
        &self.widths
    }

    pub fn instantiated(&self) -> bool {
        self.handle.is_some()
    }

    /// Bound width, once instantiated.
    pub fn width(&self) -> Option<usize> {
        self.handle.as_ref().map(|h| h.width())
    }

    /// Binds the simulator wire. The wire's width must be one of the
    /// declared widths; `int`-typed signals additionally cap at 64 bits so
    /// samples fit the integer conversion.
    pub fn bind(&mut self, handle: Rc<dyn Wire>) -> Result<()> {
        let width = handle.width();
        if !self.widths.contains(&width) {
            return Err(Error::Property(format!(
                "invalid width ({width}) for signal `{}`",
                self.name
            )));
        }
        if self.logical_type == LogicalType::Int && width > 64 {
            return Err(Error::Property(format!(
                "signal `{}` is int-typed but {width} bits wide",
                self.name
            )));
        }
        debug!(signal = %self.name, width, "bound");
        self.handle = Some(handle);
        Ok(())
    }

    pub fn set_filter(&mut self, filter: FilterFn) {
        debug!(signal = %self.name, "filter attached");
        self.filter = Some(filter);
    }

    fn bound(&self) -> Result<&Rc<dyn Wire>> {
        self.handle
            .as_ref()
            .ok_or_else(|| Error::NotInstantiated(self.name.clone()))
    }

    /// Samples the wire and converts to the logical type.
    ///
    /// Fails when unbound, and with a protocol error when any sampled bit
    /// is undefined. Active-low signals are inverted before the filter runs.
    pub fn capture(&self) -> Result<LogicalValue> {
        let handle = self.bound()?;
        let mut value = handle.read();
        if !value.is_resolvable() {
            return Err(Error::Protocol(format!(
                "signal `{}` is unresolvable ({value})",
                self.name
            )));
        }
        if !self.active_high {
            value = value.inverted();
        }
        if let Some(filter) = &self.filter {
            filter(&value)?;
        }
        debug!(signal = %self.name, %value, "captured");
        Ok(match self.logical_type {
            LogicalType::Bool => LogicalValue::Bool(value.as_bool().unwrap_or(false)),
            LogicalType::Int => LogicalValue::Int(value.as_u64().unwrap_or(0)),
            LogicalType::Vector => LogicalValue::Vector(value),
        })
    }

    /// Drives a logical value onto the wire.
    ///
    /// Fails when unbound or when the value's type does not match. The
    /// filter sees the value before active-low inversion.
    pub fn drive(&self, value: &LogicalValue) -> Result<()> {
        let handle = self.bound()?;
        if value.kind() != self.logical_type {
            return Err(Error::Type {
                signal: self.name.clone(),
                expected: self.logical_type,
            });
        }
        let width = handle.width();
        let mut vector = match value {
            LogicalValue::Bool(b) => LogicVector::from_u64(u64::from(*b), width),
            LogicalValue::Int(v) => LogicVector::from_u64(*v, width),
            LogicalValue::Vector(v) => v.resized(width),
        };
        if let Some(filter) = &self.filter {
            filter(&vector)?;
        }
        if !self.active_high {
            vector = vector.inverted();
        }
        debug!(signal = %self.name, value = %vector, "driven");
        handle.write(&vector);
        Ok(())
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signal({})", self.name)
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("widths", &self.widths)
            .field("direction", &self.direction)
            .field("required", &self.required)
            .field("active_high", &self.active_high)
            .field("meta", &self.meta)
            .field("logical_type", &self.logical_type)
            .field("instantiated", &self.instantiated())
            .finish()
    }
}

/// Lazy source of values for a generated control.
pub type Generator = Box<dyn Iterator<Item = bool>>;

/// A control signal, restricted to width 1 and two logical values.
///
/// Controls order by precedence: smaller precedence means an outer level of
/// the behavioral hierarchy. Controls at equal precedence form one level.
pub struct Control {
    sig: Signal,
    precedence: u32,
    max_allowance: u32,
    max_latency: u32,
    allowance: Cell<u32>,
    latency: Cell<u32>,
    flow_vals: BTreeSet<bool>,
    fix_vals: BTreeSet<bool>,
    generator: RefCell<Option<Generator>>,
    cache: Cell<Option<bool>>,
}

impl Control {
    /// Controls carry protocol framing, never payload, so they are meta.
    pub fn new(name: &str) -> Self {
        Self {
            sig: Signal::new(name).meta(),
            precedence: 0,
            max_allowance: 0,
            max_latency: 0,
            allowance: Cell::new(0),
            latency: Cell::new(0),
            flow_vals: BTreeSet::from([true]),
            fix_vals: BTreeSet::from([false]),
            generator: RefCell::new(None),
            cache: Cell::new(None),
        }
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.sig = self.sig.direction(direction);
        self
    }

    pub fn required(mut self) -> Self {
        self.sig = self.sig.required();
        self
    }

    pub fn active_high(mut self, active_high: bool) -> Self {
        self.sig = self.sig.active_high(active_high);
        self
    }

    pub fn precedence(mut self, precedence: u32) -> Self {
        self.precedence = precedence;
        self
    }

    pub fn max_allowance(mut self, max_allowance: u32) -> Self {
        self.max_allowance = max_allowance;
        self
    }

    pub fn max_latency(mut self, max_latency: u32) -> Self {
        self.max_latency = max_latency;
        self
    }

    /// Replaces the flow/fix partition; the sets must be disjoint.
    pub fn values(mut self, flow: impl IntoIterator<Item = bool>, fix: impl IntoIterator<Item = bool>) -> Self {
        let flow: BTreeSet<bool> = flow.into_iter().collect();
        let fix: BTreeSet<bool> = fix.into_iter().collect();
        assert!(
            flow.is_disjoint(&fix),
            "control `{}` flow and fix values must be disjoint",
            self.sig.name()
        );
        self.flow_vals = flow;
        self.fix_vals = fix;
        self
    }

    pub fn signal(&self) -> &Signal {
        &self.sig
    }

    pub(crate) fn signal_mut(&mut self) -> &mut Signal {
        &mut self.sig
    }

    /// Binds the underlying signal to a simulator wire.
    pub fn bind(&mut self, handle: Rc<dyn Wire>) -> Result<()> {
        self.sig.bind(handle)
    }

    pub fn name(&self) -> &str {
        self.sig.name()
    }

    pub fn instantiated(&self) -> bool {
        self.sig.instantiated()
    }

    pub fn get_precedence(&self) -> u32 {
        self.precedence
    }

    pub(crate) fn shift_precedence(&mut self, offset: u32) {
        self.precedence += offset;
        debug!(control = %self.name(), precedence = self.precedence, "precedence shifted");
    }

    pub fn flow_vals(&self) -> &BTreeSet<bool> {
        &self.flow_vals
    }

    pub fn fix_vals(&self) -> &BTreeSet<bool> {
        &self.fix_vals
    }

    pub fn allowance(&self) -> u32 {
        self.allowance.get()
    }

    pub fn set_allowance(&self, value: u32) -> Result<()> {
        if value > self.max_allowance {
            return Err(Error::Value(format!(
                "allowance {value} outside defined range 0..={} for `{}`",
                self.max_allowance,
                self.name()
            )));
        }
        self.allowance.set(value);
        Ok(())
    }

    pub fn latency(&self) -> u32 {
        self.latency.get()
    }

    pub fn set_latency(&self, value: u32) -> Result<()> {
        if value > self.max_latency {
            return Err(Error::Value(format!(
                "latency {value} outside defined range 0..={} for `{}`",
                self.max_latency,
                self.name()
            )));
        }
        self.latency.set(value);
        Ok(())
    }

    pub fn generated(&self) -> bool {
        self.generator.borrow().is_some()
    }

    /// Attaches a value generator. Subsequent captures pull from it (and
    /// drive the wire) instead of sampling.
    pub fn set_generator(&self, generator: impl Iterator<Item = bool> + 'static) -> Result<()> {
        if !self.instantiated() {
            return Err(Error::Value(format!(
                "cannot attach a generator to unbound control `{}`",
                self.name()
            )));
        }
        *self.generator.borrow_mut() = Some(Box::new(generator));
        self.clear();
        debug!(control = %self.name(), "generator attached");
        Ok(())
    }

    /// Samples the control.
    ///
    /// A generated control pulls at most one value per cache lifetime: the
    /// pulled value is driven onto the wire, cached, and returned until
    /// [`Control::clear`] empties the cache.
    pub fn capture(&self) -> Result<bool> {
        if !self.generated() {
            return match self.sig.capture()? {
                LogicalValue::Bool(b) => Ok(b),
                other => Err(Error::Value(format!(
                    "control `{}` sampled a non-bool {:?}",
                    self.name(),
                    other.kind()
                ))),
            };
        }
        if let Some(cached) = self.cache.get() {
            return Ok(cached);
        }
        let next = {
            let mut generator = self.generator.borrow_mut();
            generator
                .as_mut()
                .and_then(|g| g.next())
                .ok_or_else(|| {
                    Error::Protocol(format!("generator for `{}` is exhausted", self.name()))
                })?
        };
        self.drive(next)?;
        Ok(next)
    }

    /// Drives the control; a generated control's cache follows the drive.
    pub fn drive(&self, value: bool) -> Result<()> {
        if self.generated() {
            self.cache.set(Some(value));
        }
        self.sig.drive(&LogicalValue::Bool(value))
    }

    /// Empties the sample cache; the next capture re-pulls or re-samples.
    pub fn clear(&self) {
        self.cache.set(None);
    }

    pub fn is_flow(&self) -> Result<bool> {
        Ok(self.flow_vals.contains(&self.capture()?))
    }

    pub fn is_fix(&self) -> Result<bool> {
        Ok(self.fix_vals.contains(&self.capture()?))
    }
}

impl PartialEq for Control {
    fn eq(&self, other: &Self) -> bool {
        self.precedence == other.precedence
    }
}

impl Eq for Control {}

impl PartialOrd for Control {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Control {
    fn cmp(&self, other: &Self) -> Ordering {
        self.precedence.cmp(&other.precedence)
    }
}

impl Hash for Control {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.precedence.hash(state);
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Control({})", self.name())
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Control")
            .field("signal", &self.sig)
            .field("precedence", &self.precedence)
            .field("flow_vals", &self.flow_vals)
            .field("fix_vals", &self.fix_vals)
            .field("allowance", &self.allowance.get())
            .field("latency", &self.latency.get())
            .field("generated", &self.generated())
            .finish()
    }
}

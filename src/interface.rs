//! Interface assembly.
//!
//! An [`Interface`] aggregates the signals and controls declared by a
//! protocol's specification, binds them to the wires of an entity (under an
//! optional bus prefix), and exposes the precedence-ordered view of its
//! controls that elaboration consumes.

use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::signal::{Control, Direction, FilterFn, Signal};
use crate::sim::Entity;

/// One entry of an interface specification.
pub enum SignalDecl {
    Signal(Signal),
    Control(Control),
}

impl SignalDecl {
    fn name(&self) -> &str {
        match self {
            SignalDecl::Signal(s) => s.name(),
            SignalDecl::Control(c) => c.name(),
        }
    }
}

impl From<Signal> for SignalDecl {
    fn from(value: Signal) -> Self {
        SignalDecl::Signal(value)
    }
}

impl From<Control> for SignalDecl {
    fn from(value: Control) -> Self {
        SignalDecl::Control(value)
    }
}

pub struct Interface {
    bus_name: Option<String>,
    separator: String,
    family: Option<String>,
    signals: Vec<Signal>,
    controls: Vec<Control>,
    filters: Vec<(String, FilterFn)>,
}

impl Interface {
    pub fn new(bus_name: Option<&str>, family: Option<&str>) -> Self {
        Self {
            bus_name: bus_name.map(str::to_string),
            separator: "_".to_string(),
            family: family.map(str::to_string),
            signals: Vec::new(),
            controls: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn separator(mut self, separator: &str) -> Self {
        self.separator = separator.to_string();
        self
    }

    pub fn bus_name(&self) -> Option<&str> {
        self.bus_name.as_deref()
    }

    pub fn family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    /// Incorporates a specification into the interface and binds it against
    /// `entity`, aliasing each name with `prefix` when one is given.
    ///
    /// New controls are merged below the existing hierarchy unless
    /// `precedes` is set, in which case the existing controls are shifted
    /// up past the incoming group and the new controls become the outer
    /// levels.
    ///
    /// Signals absent from the entity are kept uninstantiated when
    /// optional and rejected with a protocol error when required.
    pub fn specify(
        &mut self,
        spec: impl IntoIterator<Item = SignalDecl>,
        precedes: bool,
        entity: &dyn Entity,
        prefix: Option<&str>,
    ) -> Result<()> {
        let spec: Vec<SignalDecl> = spec.into_iter().collect();

        for decl in &spec {
            if self.contains(decl.name()) {
                return Err(Error::Duplicate(decl.name().to_string()));
            }
        }

        // Relative precedence of the incoming control group.
        let incoming_pmax = spec
            .iter()
            .filter_map(|d| match d {
                SignalDecl::Control(c) => Some(c.get_precedence()),
                SignalDecl::Signal(_) => None,
            })
            .max();
        let mut spec = spec;
        if let Some(incoming_pmax) = incoming_pmax {
            if precedes {
                let offset = incoming_pmax + 1;
                for c in &mut self.controls {
                    c.shift_precedence(offset);
                }
            } else if let Some(pmax) = self.pmax() {
                let offset = pmax + 1;
                for decl in &mut spec {
                    if let SignalDecl::Control(c) = decl {
                        c.shift_precedence(offset);
                    }
                }
            }
        }

        for decl in spec {
            let alias = match prefix {
                Some(p) => format!("{p}{}{}", self.separator, decl.name()),
                None => decl.name().to_string(),
            };
            let (name, required) = (decl.name().to_string(), self.decl_required(&decl));
            match entity.lookup(&alias) {
                None if required => {
                    return Err(Error::Protocol(format!(
                        "missing required signal `{alias}`"
                    )));
                }
                None => {
                    info!(signal = %alias, "optional signal absent, kept unbound");
                    self.push(decl);
                }
                Some(handle) => {
                    let mut decl = decl;
                    match &mut decl {
                        SignalDecl::Signal(s) => s.bind(handle)?,
                        SignalDecl::Control(c) => c.signal_mut().bind(handle)?,
                    }
                    if let Some((_, filter)) =
                        self.filters.iter().find(|(fname, _)| *fname == name)
                    {
                        let filter = FilterFn::clone(filter);
                        match &mut decl {
                            SignalDecl::Signal(s) => s.set_filter(filter),
                            SignalDecl::Control(c) => c.signal_mut().set_filter(filter),
                        }
                    }
                    self.push(decl);
                }
            }
        }

        debug!(interface = %self, signals = self.signals.len(), controls = self.controls.len(), "specified");
        Ok(())
    }

    fn decl_required(&self, decl: &SignalDecl) -> bool {
        match decl {
            SignalDecl::Signal(s) => s.is_required(),
            SignalDecl::Control(c) => c.signal().is_required(),
        }
    }

    fn push(&mut self, decl: SignalDecl) {
        match decl {
            SignalDecl::Signal(s) => self.signals.push(s),
            SignalDecl::Control(c) => self.controls.push(c),
        }
    }

    /// Registers a validation filter by signal name. The filter attaches to
    /// the signal as soon as both exist.
    pub fn add_filter(&mut self, name: &str, filter: FilterFn) {
        if let Some(s) = self.signals.iter_mut().find(|s| s.name() == name) {
            s.set_filter(FilterFn::clone(&filter));
        } else if let Some(c) = self.controls.iter_mut().find(|c| c.name() == name) {
            c.signal_mut().set_filter(FilterFn::clone(&filter));
        }
        self.filters.push((name.to_string(), filter));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.signals.iter().any(|s| s.name() == name)
            || self.controls.iter().any(|c| c.name() == name)
    }

    /// Looks up any signal, control or not, by logical name.
    pub fn signal(&self, name: &str) -> Option<&Signal> {
        self.signals
            .iter()
            .find(|s| s.name() == name)
            .or_else(|| {
                self.controls
                    .iter()
                    .find(|c| c.name() == name)
                    .map(|c| c.signal())
            })
    }

    pub fn control(&self, name: &str) -> Option<&Control> {
        self.controls.iter().find(|c| c.name() == name)
    }

    pub fn controls(&self) -> &[Control] {
        &self.controls
    }

    pub(crate) fn control_index(&self, name: &str) -> Option<usize> {
        self.controls.iter().position(|c| c.name() == name)
    }

    /// Control indices sorted ascending by precedence: outer levels first.
    pub fn sorted_controls(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.controls.len()).collect();
        indices.sort_by_key(|i| self.controls[*i].get_precedence());
        indices
    }

    pub fn pmin(&self) -> Option<u32> {
        self.controls.iter().map(|c| c.get_precedence()).min()
    }

    pub fn pmax(&self) -> Option<u32> {
        self.controls.iter().map(|c| c.get_precedence()).max()
    }

    /// Controls at the outermost precedence level.
    pub fn floor(&self) -> Vec<&Control> {
        let Some(pmin) = self.pmin() else {
            return Vec::new();
        };
        self.controls
            .iter()
            .filter(|c| c.get_precedence() == pmin)
            .collect()
    }

    /// Controls at the innermost precedence level.
    pub fn ceiling(&self) -> Vec<&Control> {
        let Some(pmax) = self.pmax() else {
            return Vec::new();
        };
        self.controls
            .iter()
            .filter(|c| c.get_precedence() == pmax)
            .collect()
    }

    /// Names of the non-meta, instantiated signals carried by logical
    /// transactions, filtered by direction: primary selects from-primary
    /// signals, non-primary to-primary ones, and `None` bidirectional ones.
    pub fn txn(&self, primary: Option<bool>) -> BTreeSet<String> {
        let direction = match primary {
            Some(true) => Direction::FromPrimary,
            Some(false) => Direction::ToPrimary,
            None => Direction::Bidirectional,
        };
        self.signals
            .iter()
            .filter(|s| s.instantiated() && !s.is_meta() && s.get_direction() == direction)
            .map(|s| s.name().to_string())
            .collect()
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.family, &self.bus_name) {
            (Some(fam), Some(bus)) => write!(f, "{fam}:{bus}"),
            (Some(fam), None) => write!(f, "{fam}"),
            (None, Some(bus)) => write!(f, "{bus}"),
            (None, None) => write!(f, "interface"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::LogicalType;
    use crate::virt::VirtualEntity;
    use pretty_assertions::assert_eq;

    fn streaming_like() -> Vec<SignalDecl> {
        vec![
            Signal::new("data")
                .widths([8])
                .logical_type(LogicalType::Vector)
                .into(),
            Control::new("ready").direction(Direction::ToPrimary).into(),
            Control::new("valid").precedence(1).into(),
        ]
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let entity = VirtualEntity::new();
        entity.wire("valid", 1);
        let mut itf = Interface::new(None, None);
        itf.specify([Control::new("valid").into()], false, &entity, None)
            .unwrap();
        let err = itf.specify([Signal::new("valid").into()], false, &entity, None);
        assert!(matches!(err, Err(Error::Duplicate(name)) if name == "valid"));
    }

    #[test]
    fn missing_required_signal_is_fatal() {
        let entity = VirtualEntity::new();
        let mut itf = Interface::new(None, None);
        let err = itf.specify([Signal::new("clk").required().into()], false, &entity, None);
        assert!(matches!(err, Err(Error::Protocol(_))));
    }

    #[test]
    fn optional_signals_stay_unbound() {
        let entity = VirtualEntity::new();
        let mut itf = Interface::new(None, None);
        itf.specify([Signal::new("error").into()], false, &entity, None)
            .unwrap();
        let error = itf.signal("error").unwrap();
        assert!(!error.instantiated());
        assert!(itf.txn(Some(true)).is_empty());
    }

    #[test]
    fn bus_prefix_aliases_lookups() {
        let entity = VirtualEntity::new();
        entity.wire("asi_data", 8);
        let mut itf = Interface::new(Some("asi"), None);
        itf.specify(
            [Signal::new("data")
                .widths([8])
                .logical_type(LogicalType::Vector)
                .into()],
            false,
            &entity,
            Some("asi"),
        )
        .unwrap();
        // Stored under the logical name, bound through the alias.
        assert!(itf.signal("data").unwrap().instantiated());
    }

    #[test]
    fn later_groups_shift_past_existing_levels() {
        let entity = VirtualEntity::new();
        for name in ["ready", "valid", "halt"] {
            entity.wire(name, 1);
        }
        let mut itf = Interface::new(None, None);
        itf.specify(
            [
                Control::new("ready").into(),
                Control::new("valid").precedence(1).into(),
            ],
            false,
            &entity,
            None,
        )
        .unwrap();
        itf.specify([Control::new("halt").into()], false, &entity, None)
            .unwrap();

        // halt lands past the existing ceiling.
        assert_eq!(itf.control("halt").unwrap().get_precedence(), 2);
        assert_eq!(itf.pmin(), Some(0));
        assert_eq!(itf.pmax(), Some(2));
        let floor: Vec<&str> = itf.floor().iter().map(|c| c.name()).collect();
        assert_eq!(floor, vec!["ready"]);
        let ceiling: Vec<&str> = itf.ceiling().iter().map(|c| c.name()).collect();
        assert_eq!(ceiling, vec!["halt"]);
    }

    #[test]
    fn preceding_groups_shift_existing_levels_up() {
        let entity = VirtualEntity::new();
        for name in ["ready", "valid", "reset", "reset_req"] {
            entity.wire(name, 1);
        }
        let mut itf = Interface::new(None, None);
        itf.specify(
            [
                Control::new("ready").into(),
                Control::new("valid").precedence(1).into(),
            ],
            false,
            &entity,
            None,
        )
        .unwrap();
        itf.specify(
            [
                Control::new("reset").values([false], [true]).into(),
                Control::new("reset_req").precedence(1).into(),
            ],
            true,
            &entity,
            None,
        )
        .unwrap();

        // Offset is (max incoming precedence) + 1 = 2.
        assert_eq!(itf.control("reset").unwrap().get_precedence(), 0);
        assert_eq!(itf.control("reset_req").unwrap().get_precedence(), 1);
        assert_eq!(itf.control("ready").unwrap().get_precedence(), 2);
        assert_eq!(itf.control("valid").unwrap().get_precedence(), 3);

        let order: Vec<&str> = itf
            .sorted_controls()
            .into_iter()
            .map(|i| itf.controls()[i].name())
            .collect();
        assert_eq!(order, vec!["reset", "reset_req", "ready", "valid"]);
    }

    #[test]
    fn txn_filters_by_role_and_meta() {
        let entity = VirtualEntity::new();
        for (name, width) in [("data", 8), ("ready", 1), ("valid", 1), ("sop", 1)] {
            entity.wire(name, width);
        }
        let mut itf = Interface::new(None, None);
        itf.specify(streaming_like(), false, &entity, None).unwrap();
        itf.specify([Signal::new("sop").meta().into()], false, &entity, None)
            .unwrap();

        let from_primary: Vec<String> = itf.txn(Some(true)).into_iter().collect();
        assert_eq!(from_primary, vec!["data".to_string()]);
        // Controls are meta, sop is meta, nothing flows to-primary.
        assert!(itf.txn(Some(false)).is_empty());
        assert!(itf.txn(None).is_empty());
    }

    #[test]
    fn filters_attach_at_bind_time() {
        let entity = VirtualEntity::new();
        entity.wire("data", 8);
        let mut itf = Interface::new(None, None);
        itf.add_filter(
            "data",
            std::rc::Rc::new(|v| {
                if v.as_u64() == Some(0xFF) {
                    Err(Error::Protocol("data must not be all-ones".into()))
                } else {
                    Ok(())
                }
            }),
        );
        itf.specify(
            [Signal::new("data")
                .widths([8])
                .logical_type(LogicalType::Int)
                .into()],
            false,
            &entity,
            None,
        )
        .unwrap();

        entity.get("data").unwrap().set(0xFF);
        assert!(itf.signal("data").unwrap().capture().is_err());
        entity.get("data").unwrap().set(0x12);
        assert!(itf.signal("data").unwrap().capture().is_ok());
    }
}

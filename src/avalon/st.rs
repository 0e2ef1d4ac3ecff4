//! Avalon streaming: interface properties, the source and sink models,
//! and the empty-lane masking of partial words.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::error::{Error, Result};
use crate::interface::{Interface, SignalDecl};
use crate::logic::LogicVector;
use crate::model::{Behavior, Context, Model};
use crate::reaction::{Reaction, Schedule};
use crate::signal::{Control, Direction, LogicalType, LogicalValue, Signal};
use crate::sim::Entity;

/// Streaming interface properties, loadable from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamingConfig {
    pub data_bits_per_symbol: u32,
    pub first_symbol_in_higher_order_bits: bool,
    pub max_channel: u32,
    pub ready_latency: u32,
    pub ready_allowance: u32,
    pub in_packet_timeout: u32,
    pub empty_within_packet: bool,
    pub error_descriptor: Option<Vec<String>>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            data_bits_per_symbol: 8,
            first_symbol_in_higher_order_bits: true,
            max_channel: 0,
            ready_latency: 0,
            ready_allowance: 0,
            in_packet_timeout: 0,
            empty_within_packet: false,
            error_descriptor: None,
        }
    }
}

impl StreamingConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Value(format!("cannot read streaming config: {e}")))?;
        let config: StreamingConfig = toml::from_str(&content)
            .map_err(|e| Error::Property(format!("malformed streaming config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=512).contains(&self.data_bits_per_symbol) {
            return Err(Error::Property(format!(
                "data_bits_per_symbol must be 1-512, got {}",
                self.data_bits_per_symbol
            )));
        }
        if self.max_channel > 255 {
            return Err(Error::Property(format!(
                "max_channel must be 0-255, got {}",
                self.max_channel
            )));
        }
        if self.ready_latency > 8 || self.ready_allowance > 8 {
            return Err(Error::Property(format!(
                "ready_latency/ready_allowance must be 0-8, got {}/{}",
                self.ready_latency, self.ready_allowance
            )));
        }
        if self.ready_latency > self.ready_allowance {
            return Err(Error::Property(format!(
                "ready_latency ({}) must not exceed ready_allowance ({})",
                self.ready_latency, self.ready_allowance
            )));
        }
        Ok(())
    }
}

/// Drops the empty symbols of a partial word. With the first symbol in the
/// higher-order bits the partial symbols sit at the low end of the word,
/// otherwise at the high end.
pub fn mask_data(config: &StreamingConfig, data: &LogicVector, empty: u64) -> Result<LogicVector> {
    let drop_bits = empty as usize * config.data_bits_per_symbol as usize;
    if drop_bits >= data.width() {
        return Err(Error::Protocol(format!(
            "empty ({empty} symbols) covers the whole word"
        )));
    }
    Ok(if config.first_symbol_in_higher_order_bits {
        data.high_from(drop_bits)
    } else {
        data.low(data.width() - drop_bits)
    })
}

pub struct StreamingInterface {
    core: Interface,
    config: StreamingConfig,
    packets: bool,
}

impl StreamingInterface {
    pub fn specification() -> Vec<SignalDecl> {
        vec![
            Signal::new("channel")
                .widths(1..=128)
                .logical_type(LogicalType::Int)
                .into(),
            Signal::new("data")
                .widths(1..=4096)
                .logical_type(LogicalType::Vector)
                .into(),
            Signal::new("error")
                .widths(1..=256)
                .logical_type(LogicalType::Int)
                .into(),
            Signal::new("empty")
                .widths(1..=5)
                .meta()
                .logical_type(LogicalType::Int)
                .into(),
            Signal::new("endofpacket").meta().into(),
            Signal::new("startofpacket").meta().into(),
            Control::new("ready")
                .direction(Direction::ToPrimary)
                .max_allowance(8)
                .max_latency(8)
                .into(),
            Control::new("valid").precedence(1).into(),
        ]
    }

    /// Assembles the interface: streaming signals under the bus prefix,
    /// clock and reset merged in as the outermost levels, and every
    /// property validated against the wires actually present.
    pub fn new(entity: &dyn Entity, bus: Option<&str>, config: StreamingConfig) -> Result<Self> {
        config.validate()?;
        let mut core = Interface::new(bus, Some("avalon"));
        core.specify(Self::specification(), false, entity, bus)?;
        core.specify(super::clock_specification(), true, entity, None)?;
        core.specify(super::reset_specification(), true, entity, None)?;

        let inst = |name: &str| core.signal(name).is_some_and(Signal::instantiated);
        // Any packet-framing wire implies packet support.
        let packets = inst("empty") || inst("startofpacket") || inst("endofpacket");

        if packets {
            if !(inst("startofpacket") && inst("endofpacket")) {
                return Err(Error::Property(
                    "packet support requires both startofpacket and endofpacket".into(),
                ));
            }
            if let Some(width) = core.signal("data").and_then(Signal::width) {
                let bits_per_symbol = config.data_bits_per_symbol as usize;
                if width > bits_per_symbol {
                    let symbols = width.div_ceil(bits_per_symbol);
                    let required =
                        usize::BITS as usize - (symbols - 1).leading_zeros() as usize;
                    if !inst("empty") {
                        return Err(Error::Property(
                            "packet interfaces with more than one symbol per word need an empty signal"
                                .into(),
                        ));
                    }
                    if core.signal("empty").and_then(Signal::width) != Some(required) {
                        return Err(Error::Property(format!(
                            "empty width must be ceil(log2(symbols per word)) = {required}"
                        )));
                    }
                }
            }
        } else {
            if config.in_packet_timeout > 0 {
                warn!("in_packet_timeout set without packet support");
            }
            if config.empty_within_packet {
                warn!("empty_within_packet set without packet support");
            }
        }

        if !inst("channel") && config.max_channel > 0 {
            warn!("max_channel set without an instantiated channel signal");
        }
        if inst("error") {
            if let Some(descriptor) = &config.error_descriptor {
                if core.signal("error").and_then(Signal::width) != Some(descriptor.len()) {
                    return Err(Error::Property(
                        "error descriptor needs one label per error bit".into(),
                    ));
                }
            }
        } else if config.error_descriptor.is_some() {
            warn!("error_descriptor set without an instantiated error signal");
        }

        if inst("ready") {
            let ready = core
                .control("ready")
                .ok_or_else(|| Error::Value("ready is not a control".into()))?;
            ready.set_allowance(config.ready_allowance)?;
            ready.set_latency(config.ready_latency)?;
        } else if config.ready_latency > 0 || config.ready_allowance > 0 {
            warn!("ready relaxations set without an instantiated ready signal");
        }

        Ok(Self {
            core,
            config,
            packets,
        })
    }

    pub fn interface(&self) -> &Interface {
        &self.core
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn packets(&self) -> bool {
        self.packets
    }

    /// Labels of the error bits set in `mask`, when a descriptor is
    /// configured.
    pub fn descriptors(&self, mask: u64) -> Option<Vec<String>> {
        let descriptor = self.config.error_descriptor.as_ref()?;
        Some(
            descriptor
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, label)| label.clone())
                .collect(),
        )
    }
}

/// Passive receive side: captures every accepted beat, checks packet
/// framing, and finishes a transaction on end-of-packet (or per word when
/// the interface carries no packet framing).
pub struct SinkBehavior {
    config: StreamingConfig,
    packets: bool,
    in_pkt: bool,
    prev_channel: Option<u64>,
    idle_ticks: u32,
}

impl SinkBehavior {
    fn on_reset(&mut self, _ctx: &mut Context<'_>) -> Result<()> {
        self.in_pkt = false;
        self.prev_channel = None;
        self.idle_ticks = 0;
        Ok(())
    }

    fn valid_beat(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        let channel = ctx.capture("channel")?.and_then(|v| v.as_u64());
        let data = match ctx.capture("data")? {
            Some(LogicalValue::Vector(v)) => Some(v),
            _ => None,
        };
        let empty = ctx.capture("empty")?.and_then(|v| v.as_u64()).unwrap_or(0);
        let error = ctx.capture("error")?.and_then(|v| v.as_u64());
        let sop = ctx.capture_bool("startofpacket")?.unwrap_or(false);
        let eop = ctx.capture_bool("endofpacket")?.unwrap_or(false);

        if self.packets {
            if sop {
                if self.in_pkt {
                    return Err(Error::Protocol("duplicate startofpacket".into()));
                }
                self.in_pkt = true;
            }
            if !self.in_pkt {
                return Err(Error::Protocol("transfer outside of packet".into()));
            }
            if let (Some(prev), Some(current)) = (self.prev_channel, channel) {
                if prev != current {
                    return Err(Error::Protocol(format!(
                        "channel changed within packet ({prev}->{current})"
                    )));
                }
            }
        }
        if let Some(current) = channel {
            if current > u64::from(self.config.max_channel) {
                return Err(Error::Protocol(format!(
                    "channel {current} above max_channel {}",
                    self.config.max_channel
                )));
            }
        }
        self.prev_channel = channel;
        self.idle_ticks = 0;

        if let Some(data) = data {
            let masked = if self.in_pkt && empty > 0 && (self.config.empty_within_packet || eop)
            {
                mask_data(&self.config, &data, empty)?
            } else {
                data
            };
            ctx.buff.push("data", LogicalValue::Vector(masked))?;
        }
        if let Some(error) = error {
            ctx.buff.push("error", LogicalValue::Int(error))?;
        }

        if !self.packets || eop {
            if let Some(channel) = self.prev_channel {
                if ctx.buff.has("channel") {
                    ctx.buff.push("channel", LogicalValue::Int(channel))?;
                }
            }
            self.in_pkt = false;
            self.prev_channel = None;
            ctx.complete();
        }
        Ok(())
    }

    /// Accounts in-packet dead cycles against the configured timeout.
    fn idle_beat(&mut self, _ctx: &mut Context<'_>) -> Result<()> {
        if self.packets && self.in_pkt && self.config.in_packet_timeout > 0 {
            self.idle_ticks += 1;
            if self.idle_ticks > self.config.in_packet_timeout {
                return Err(Error::Protocol(format!(
                    "in-packet timeout after {} idle ticks",
                    self.idle_ticks
                )));
            }
        }
        Ok(())
    }
}

impl Behavior for SinkBehavior {
    fn reactions() -> Vec<Reaction<Self>> {
        vec![
            Reaction {
                cname: "reset",
                val: true,
                forced: false,
                schedule: Schedule::ReadOnly,
                run: SinkBehavior::on_reset,
            },
            Reaction {
                cname: "valid",
                val: true,
                forced: true,
                schedule: Schedule::ReadOnly,
                run: SinkBehavior::valid_beat,
            },
            Reaction {
                cname: "valid",
                val: false,
                forced: false,
                schedule: Schedule::ReadOnly,
                run: SinkBehavior::idle_beat,
            },
        ]
    }
}

/// Active transmit side: presets `valid` together with the first word, then
/// drives one buffered word per accepted beat, raising `endofpacket` on the
/// last and deasserting `valid` when the buffer drains.
pub struct SourceBehavior {
    packets: bool,
}

impl SourceBehavior {
    fn on_reset(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        let valid = ctx.control("valid")?;
        if !valid.generated() {
            valid.drive(false)?;
        }
        if self.packets {
            ctx.drive("startofpacket", &LogicalValue::Bool(false))?;
            ctx.drive("endofpacket", &LogicalValue::Bool(false))?;
        }
        Ok(())
    }

    /// Runs while the wire shows `valid` low: raise it as soon as there is
    /// something to send, so the next sampling edge sees real data.
    fn preset(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        if ctx.buff.is_empty() {
            return Ok(());
        }
        let valid = ctx.control("valid")?;
        if !valid.generated() {
            valid.drive(true)?;
        }
        self.drive_word(ctx, true)
    }

    /// Runs on every accepted beat: the word on the wire was consumed this
    /// tick, so present the next one or wind down.
    fn beat(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        if ctx.buff.is_empty() {
            let valid = ctx.control("valid")?;
            if !valid.generated() {
                valid.drive(false)?;
            }
            if self.packets {
                ctx.drive("startofpacket", &LogicalValue::Bool(false))?;
                ctx.drive("endofpacket", &LogicalValue::Bool(false))?;
            }
            ctx.complete();
            return Ok(());
        }
        self.drive_word(ctx, false)
    }

    fn drive_word(&mut self, ctx: &mut Context<'_>, first: bool) -> Result<()> {
        if let Some(channel) = ctx.buff.pop("channel") {
            ctx.drive("channel", &channel)?;
        }
        if let Some(data) = ctx.buff.pop("data") {
            ctx.drive("data", &data)?;
        }
        if let Some(error) = ctx.buff.pop("error") {
            ctx.drive("error", &error)?;
        }
        let last = ctx.buff.is_empty();
        if self.packets {
            ctx.drive("startofpacket", &LogicalValue::Bool(first))?;
            ctx.drive("endofpacket", &LogicalValue::Bool(last))?;
        }
        Ok(())
    }
}

impl Behavior for SourceBehavior {
    fn reactions() -> Vec<Reaction<Self>> {
        vec![
            Reaction {
                cname: "reset",
                val: true,
                forced: false,
                schedule: Schedule::NextTimeStep,
                run: SourceBehavior::on_reset,
            },
            Reaction {
                cname: "valid",
                val: false,
                forced: false,
                schedule: Schedule::NextTimeStep,
                run: SourceBehavior::preset,
            },
            Reaction {
                cname: "valid",
                val: true,
                forced: true,
                schedule: Schedule::NextTimeStep,
                run: SourceBehavior::beat,
            },
        ]
    }
}

pub type StreamingSource = Model<SourceBehavior>;
pub type StreamingSink = Model<SinkBehavior>;

/// Builds the primary-side model driving the payload signals.
pub fn source(itf: StreamingInterface) -> Result<StreamingSource> {
    let StreamingInterface { core, packets, .. } = itf;
    Model::new(core, SourceBehavior { packets }, Some(true))
}

/// Builds the non-primary-side model sampling the payload signals.
pub fn sink(itf: StreamingInterface) -> Result<StreamingSink> {
    let StreamingInterface {
        core,
        config,
        packets,
    } = itf;
    Model::new(
        core,
        SinkBehavior {
            config,
            packets,
            in_pkt: false,
            prev_channel: None,
            idle_ticks: 0,
        },
        Some(false),
    )
}

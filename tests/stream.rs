//! End-to-end streaming scenarios against the in-memory simulator.
//!
//! Each test wires a virtual entity, builds source and/or sink models on
//! it, and joins the model futures with the clock. Futures are declared
//! sink-first so a generated `ready` is driven before the source samples
//! it within the same read-only window.

use std::cell::RefCell;

use pretty_assertions::assert_eq;

use strobe::avalon::st::{sink, source, StreamingConfig, StreamingInterface};
use strobe::virt::{TestClock, VirtualEntity};
use strobe::{Driver, Entity, Error, LogicVector, LogicalValue, Monitor, Tick, Txn};

fn wire_stream(entity: &VirtualEntity, extra: &[(&str, usize)]) {
    for (name, width) in [
        ("clk", 1),
        ("reset", 1),
        ("valid", 1),
        ("ready", 1),
        ("data", 8),
    ] {
        entity.wire(name, width);
    }
    for (name, width) in extra {
        entity.wire(name, *width);
    }
}

fn byte(value: u64) -> LogicalValue {
    LogicalValue::Vector(LogicVector::from_u64(value, 8))
}

fn data_txn(bytes: &[u64]) -> Txn {
    let mut txn = Txn::new();
    txn.insert("data".to_string(), bytes.iter().map(|b| byte(*b)).collect());
    txn
}

fn stream_interface(entity: &VirtualEntity, config: StreamingConfig) -> StreamingInterface {
    StreamingInterface::new(entity, None, config).unwrap()
}

#[test_log::test(tokio::test)]
async fn single_word_stream_without_packets() {
    let entity = VirtualEntity::new();
    wire_stream(&entity, &[]);
    entity.get("ready").unwrap().set(1);

    let mut src = source(stream_interface(&entity, StreamingConfig::default())).unwrap();
    let mut snk = sink(stream_interface(&entity, StreamingConfig::default())).unwrap();
    let clock = TestClock::new();

    let valid_wire = entity.get("valid").unwrap();
    let ready_wire = entity.get("ready").unwrap();
    let beats = RefCell::new(0u32);
    let recorder = async {
        for _ in 0..6 {
            clock.rising_edge().await;
            clock.read_only().await;
            if valid_wire.peek() == Some(1) && ready_wire.peek() == Some(1) {
                *beats.borrow_mut() += 1;
            }
        }
    };

    let (received, sent, _, _) = futures::join!(
        snk.output(&clock),
        src.input(data_txn(&[0x5A]), &clock),
        recorder,
        clock.run(6),
    );

    sent.unwrap();
    let received = received.unwrap();
    assert_eq!(received["data"], vec![byte(0x5A)]);
    // Exactly one accepted beat crossed the wire.
    assert_eq!(*beats.borrow(), 1);
    assert!(!src.busy());
    assert!(!snk.busy());
}

#[tokio::test]
async fn back_pressure_within_allowance_delivers_everything() {
    let entity = VirtualEntity::new();
    wire_stream(&entity, &[]);

    let config = StreamingConfig {
        ready_latency: 1,
        ready_allowance: 2,
        ..Default::default()
    };
    let mut src = source(stream_interface(&entity, config.clone())).unwrap();
    let snk_itf = stream_interface(&entity, config);
    let mut snk = sink(snk_itf).unwrap();

    // The sink owns ready: one accepted tick, two stalled ticks inside the
    // allowance window, then released.
    snk.interface()
        .control("ready")
        .unwrap()
        .set_generator([true, false, false].into_iter().chain(std::iter::repeat(true)))
        .unwrap();

    let clock = TestClock::new();
    let sink_fut = async {
        let first = snk.output(&clock).await?;
        let second = snk.output(&clock).await?;
        Ok::<(Txn, Txn), Error>((first, second))
    };
    let (received, sent, _) = futures::join!(
        sink_fut,
        src.input(data_txn(&[0xAA, 0xBB]), &clock),
        clock.run(8),
    );

    sent.unwrap();
    let (first, second) = received.unwrap();
    assert_eq!(first["data"], vec![byte(0xAA)]);
    assert_eq!(second["data"], vec![byte(0xBB)]);
}

#[tokio::test]
async fn back_pressure_past_allowance_violates_the_context() {
    let entity = VirtualEntity::new();
    wire_stream(&entity, &[]);

    let config = StreamingConfig {
        ready_latency: 1,
        ready_allowance: 2,
        ..Default::default()
    };
    let mut src = source(stream_interface(&entity, config.clone())).unwrap();
    let mut snk = sink(stream_interface(&entity, config)).unwrap();

    // ready deasserts and never returns: the allowance counter saturates.
    snk.interface()
        .control("ready")
        .unwrap()
        .set_generator(std::iter::once(true).chain(std::iter::repeat(false)))
        .unwrap();

    let clock = TestClock::new();
    let sink_fut = async {
        let mut words = Vec::new();
        loop {
            match snk.output(&clock).await {
                Ok(txn) => words.push(txn),
                Err(e) => return (words, e),
            }
        }
    };
    let ((words, sink_err), source_res, _) = futures::join!(
        sink_fut,
        src.input(data_txn(&[0xA1, 0xA2, 0xA3, 0xA4]), &clock),
        clock.run(10),
    );

    // Three words transfer during the allowance window, then the third
    // stalled tick after the wait state entered blows the invariant.
    assert_eq!(words.len(), 3);
    assert!(matches!(sink_err, Error::Protocol(_)));
    assert!(sink_err.to_string().contains("context"));
    assert!(matches!(source_res, Err(Error::Protocol(_))));
}

#[tokio::test]
async fn three_word_packet_frames_exactly_once() {
    let entity = VirtualEntity::new();
    wire_stream(&entity, &[("startofpacket", 1), ("endofpacket", 1)]);
    entity.get("ready").unwrap().set(1);

    let mut src = source(stream_interface(&entity, StreamingConfig::default())).unwrap();
    let mut snk = sink(stream_interface(&entity, StreamingConfig::default())).unwrap();
    let clock = TestClock::new();

    let valid = entity.get("valid").unwrap();
    let sop = entity.get("startofpacket").unwrap();
    let eop = entity.get("endofpacket").unwrap();
    let framing = RefCell::new(Vec::new());
    let recorder = async {
        for _ in 0..8 {
            clock.rising_edge().await;
            clock.read_only().await;
            if valid.peek() == Some(1) {
                framing
                    .borrow_mut()
                    .push((sop.peek() == Some(1), eop.peek() == Some(1)));
            }
        }
    };

    let (received, sent, _, _) = futures::join!(
        snk.output(&clock),
        src.input(data_txn(&[0x01, 0x02, 0x03]), &clock),
        recorder,
        clock.run(8),
    );

    sent.unwrap();
    let received = received.unwrap();
    assert_eq!(
        received["data"],
        vec![byte(0x01), byte(0x02), byte(0x03)]
    );
    // SOP on word 0, neither in the middle, EOP on word 2.
    assert_eq!(
        framing.into_inner(),
        vec![(true, false), (false, false), (false, true)]
    );
}

#[tokio::test]
async fn mid_packet_channel_change_is_rejected() {
    let entity = VirtualEntity::new();
    wire_stream(
        &entity,
        &[("startofpacket", 1), ("endofpacket", 1), ("channel", 4)],
    );
    entity.get("ready").unwrap().set(1);

    let config = StreamingConfig {
        max_channel: 1,
        ..Default::default()
    };
    let mut src = source(stream_interface(&entity, config.clone())).unwrap();
    let mut snk = sink(stream_interface(&entity, config)).unwrap();
    let clock = TestClock::new();

    let mut txn = data_txn(&[0x01, 0x02, 0x03]);
    txn.insert(
        "channel".to_string(),
        vec![
            LogicalValue::Int(0),
            LogicalValue::Int(0),
            LogicalValue::Int(1),
        ],
    );

    let (received, sent, _) =
        futures::join!(snk.output(&clock), src.input(txn, &clock), clock.run(8));

    // The source drove what it was told; the sink caught the violation.
    sent.unwrap();
    let err = received.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert!(err.to_string().contains("channel"));
}

#[tokio::test]
async fn packets_round_trip_back_to_back() {
    let entity = VirtualEntity::new();
    wire_stream(&entity, &[("startofpacket", 1), ("endofpacket", 1)]);
    entity.get("ready").unwrap().set(1);

    let mut src = source(stream_interface(&entity, StreamingConfig::default())).unwrap();
    let monitor =
        Monitor::new(sink(stream_interface(&entity, StreamingConfig::default())).unwrap());
    let clock = TestClock::new();

    let sink_fut = async {
        let first = monitor.recv(&clock).await?;
        let second = monitor.recv(&clock).await?;
        Ok::<(Txn, Txn), Error>((first, second))
    };
    let source_fut = async {
        src.input(data_txn(&[0x10, 0x20, 0x30]), &clock).await?;
        src.input(data_txn(&[0x40, 0x50]), &clock).await?;
        Ok::<(), Error>(())
    };
    let (received, sent, _) = futures::join!(sink_fut, source_fut, clock.run(12));

    sent.unwrap();
    let (first, second) = received.unwrap();
    assert_eq!(
        first["data"],
        vec![byte(0x10), byte(0x20), byte(0x30)]
    );
    assert_eq!(second["data"], vec![byte(0x40), byte(0x50)]);
}

#[test_log::test(tokio::test)]
async fn driver_serializes_concurrent_sends_in_call_order() {
    let entity = VirtualEntity::new();
    wire_stream(&entity, &[("startofpacket", 1), ("endofpacket", 1)]);
    entity.get("ready").unwrap().set(1);

    let driver =
        Driver::new(source(stream_interface(&entity, StreamingConfig::default())).unwrap());
    let mut snk = sink(stream_interface(&entity, StreamingConfig::default())).unwrap();
    let clock = TestClock::new();

    let sink_fut = async {
        let first = snk.output(&clock).await?;
        let second = snk.output(&clock).await?;
        Ok::<(Txn, Txn), Error>((first, second))
    };
    let (received, first_send, second_send, _) = futures::join!(
        sink_fut,
        driver.send(data_txn(&[0x77]), &clock),
        driver.send(data_txn(&[0x99]), &clock),
        clock.run(12),
    );

    first_send.unwrap();
    second_send.unwrap();
    let (first, second) = received.unwrap();
    assert_eq!(first["data"], vec![byte(0x77)]);
    assert_eq!(second["data"], vec![byte(0x99)]);
    assert!(!driver.busy());
}

#[tokio::test]
async fn reset_parks_the_machine_without_error() {
    let entity = VirtualEntity::new();
    wire_stream(&entity, &[("startofpacket", 1), ("endofpacket", 1)]);
    entity.get("ready").unwrap().set(1);

    let mut snk = sink(stream_interface(&entity, StreamingConfig::default())).unwrap();
    let clock = TestClock::new();

    let reset = entity.get("reset").unwrap();
    let valid = entity.get("valid").unwrap();
    let sop = entity.get("startofpacket").unwrap();
    let eop = entity.get("endofpacket").unwrap();
    let data = entity.get("data").unwrap();

    let stimulus = async {
        // One tick in reset, then a single-word packet.
        reset.set(1);
        clock.cycle().await;
        reset.set(0);
        valid.set(1);
        sop.set(1);
        eop.set(1);
        data.set(0x33);
        clock.cycle().await;
        valid.set(0);
        sop.set(0);
        eop.set(0);
        clock.run(2).await;
    };
    let (received, _) = futures::join!(snk.output(&clock), stimulus);

    let received = received.unwrap();
    assert_eq!(received["data"], vec![byte(0x33)]);
}

#[tokio::test]
async fn in_packet_timeout_fires_on_dead_cycles() {
    let entity = VirtualEntity::new();
    wire_stream(&entity, &[("startofpacket", 1), ("endofpacket", 1)]);
    entity.get("ready").unwrap().set(1);

    let config = StreamingConfig {
        in_packet_timeout: 2,
        ..Default::default()
    };
    let mut snk = sink(stream_interface(&entity, config)).unwrap();
    let clock = TestClock::new();

    let valid = entity.get("valid").unwrap();
    let sop = entity.get("startofpacket").unwrap();
    let data = entity.get("data").unwrap();

    let stimulus = async {
        // Open a packet, then go dead mid-packet.
        valid.set(1);
        sop.set(1);
        data.set(0x11);
        clock.cycle().await;
        valid.set(0);
        sop.set(0);
        clock.run(4).await;
    };
    let (received, _) = futures::join!(snk.output(&clock), stimulus);

    let err = received.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert!(err.to_string().contains("timeout"));
}

#[tokio::test]
async fn output_flushes_idempotently() {
    let entity = VirtualEntity::new();
    wire_stream(&entity, &[]);
    entity.get("ready").unwrap().set(1);

    let mut src = source(stream_interface(&entity, StreamingConfig::default())).unwrap();
    let mut snk = sink(stream_interface(&entity, StreamingConfig::default())).unwrap();

    // A fresh model flushes to empty, keyed sequences.
    let fresh = snk.flush().unwrap();
    assert_eq!(fresh.keys().map(String::as_str).collect::<Vec<_>>(), vec!["data"]);
    assert!(fresh["data"].is_empty());

    let clock = TestClock::new();
    let (received, sent, _) = futures::join!(
        snk.output(&clock),
        src.input(data_txn(&[0x42]), &clock),
        clock.run(6),
    );
    sent.unwrap();
    assert_eq!(received.unwrap()["data"], vec![byte(0x42)]);

    // Reading drained the buffer.
    let after = snk.flush().unwrap();
    assert!(after["data"].is_empty());
}

#[test]
fn active_low_control_inverts_on_the_wire() {
    let entity = VirtualEntity::new();
    entity.wire("pause_n", 1);
    let mut ctrl = strobe::Control::new("pause_n");
    ctrl.bind(entity.lookup("pause_n").unwrap()).unwrap();

    ctrl.drive(true).unwrap();
    assert_eq!(entity.get("pause_n").unwrap().peek(), Some(0));
    assert!(ctrl.capture().unwrap());

    ctrl.drive(false).unwrap();
    assert_eq!(entity.get("pause_n").unwrap().peek(), Some(1));
    assert!(!ctrl.capture().unwrap());
}

//! End-to-end request handling through a fully assembled core.

mod common;

use std::sync::Arc;

use common::{T0, ns, remote};
use tierline_core::RouterCore;
use tierline_core::catalog::MemoryCatalogStore;
use tierline_core::clock::{Clock, ManualClock};
use tierline_core::config::Config;
use tierline_core::dispatcher::{
    AgentRequestHandler, Dispatcher, DropReason, KeepAliveHandler, MemorySink, Outcome,
    RequestContext,
};
use tierline_core::error::DispatchError;
use tierline_core::protocol::{
    MetricSubmit, OpCode, Writer, encode_connect, encode_disconnect, encode_ping, encode_submit,
};
use tierline_core::types::{MetricType, NO_TOKEN};

struct Harness {
    core: RouterCore,
    clock: Arc<ManualClock>,
    sink: Arc<MemorySink>,
}

fn harness(model: &str) -> Harness {
    let mut config = Config::default();
    config.tiers.model = model.to_string();
    config.registry.agent_ttl_ms = 10_000;
    config.registry.sweep_interval_ms = 1_000;
    let clock = Arc::new(ManualClock::new(T0));
    let sink = Arc::new(MemorySink::new());
    let core = RouterCore::builder(config)
        .with_clock(Arc::clone(&clock) as _)
        .with_store(Arc::new(MemoryCatalogStore::new()))
        .with_sink(Arc::clone(&sink) as _)
        .build()
        .unwrap();
    Harness { core, clock, sink }
}

fn submit(ts: i64, value: i64) -> Vec<u8> {
    encode_submit(&MetricSubmit {
        token: NO_TOKEN,
        host: "web-1".into(),
        agent: "jvm".into(),
        metric_type: MetricType::LongGauge,
        namespace: ns(&["jvm", "heap"]),
        name: "used".into(),
        timestamp_ms: ts,
        value,
    })
}

#[tokio::test]
async fn samples_are_filed_in_finest_covering_tier() {
    let h = harness("raw=1s:10, 10s:6, 1m:60");

    let cases = [
        (T0 - 2_500, 0usize),
        (T0 - 10_000, 0),
        (T0 - 10_001, 1),
        (T0 - 60_001, 2),
    ];
    for (ts, expected_tier) in cases {
        match h.core.process_frame(&submit(ts, 7), remote(), None) {
            Outcome::Filed { sample } => {
                assert_eq!(sample.tier_index, expected_tier, "ts offset {}", T0 - ts);
                let duration = h.core.tier_model().tiers()[expected_tier].duration_ms;
                assert_eq!(sample.tier_address, ts.div_euclid(duration) * duration);
                assert_eq!(sample.timestamp, ts);
            }
            other => panic!("expected a filed sample, got {other:?}"),
        }
    }

    let too_old = h.core.process_frame(&submit(T0 - 3_600_001, 1), remote(), None);
    assert_eq!(
        too_old,
        Outcome::Dropped {
            reason: DropReason::TooOld
        }
    );

    // All samples share one metric id.
    let ids: Vec<i64> = h.sink.samples().iter().map(|s| s.metric_id).collect();
    assert_eq!(ids.len(), 4);
    assert!(ids.iter().all(|id| *id == ids[0]));
    h.core.shutdown().await;
}

#[tokio::test]
async fn future_timestamps_go_to_raw_tier() {
    let h = harness("1s:10, 10s:6");
    match h.core.process_frame(&submit(T0 + 5_000, 1), remote(), None) {
        Outcome::Filed { sample } => assert_eq!(sample.tier_index, 0),
        other => panic!("expected a filed sample, got {other:?}"),
    }
    h.core.shutdown().await;
}

#[tokio::test]
async fn out_of_range_timestamps_are_dropped() {
    let h = harness("raw=1s:10, 10s:6, 1m:60");
    for ts in [i64::MIN, i64::MIN + 5, i64::MAX] {
        assert!(
            matches!(
                h.core.process_frame(&submit(ts, 1), remote(), None),
                Outcome::Dropped { .. }
            ),
            "ts {ts}"
        );
    }
    // Queued through the pool as well.
    h.core.submit_frame(submit(i64::MIN, 1), remote(), None).unwrap();
    let summary = h.core.shutdown().await;
    assert_eq!(summary.requests_completed, 1);

    let stats = h.core.stats();
    assert_eq!(stats.pool.panicked, 0);
    assert_eq!(stats.dispatcher.dropped.get(&DropReason::TooOld), Some(&3));
    assert_eq!(stats.dispatcher.dropped.get(&DropReason::Malformed), Some(&1));
    assert!(h.sink.is_empty());
}

#[tokio::test]
async fn connect_ping_disconnect_cycle() {
    let h = harness("1s:60");
    let core = &h.core;

    let Outcome::Connected {
        serial,
        replaced,
        online_count,
    } = core.process_frame(&encode_connect("web-1", "jvm", "tcp://web-1:9000"), remote(), None)
    else {
        panic!("connect failed");
    };
    assert_eq!(replaced, None);
    assert_eq!(online_count, 1);

    h.clock.advance(9_000);
    assert_eq!(
        core.process_frame(&encode_ping("web-1", "jvm"), remote(), None),
        Outcome::Touched { serial }
    );
    assert_eq!(core.registry().time_to_expiry(serial), Some(10_000));

    assert_eq!(
        core.process_frame(&encode_disconnect("web-1", "jvm"), remote(), None),
        Outcome::Disconnected { serial }
    );
    assert_eq!(
        core.process_frame(&encode_ping("web-1", "jvm"), remote(), None),
        Outcome::Dropped {
            reason: DropReason::NotConnected
        }
    );
    assert_eq!(core.catalog().online_count("web-1"), 0);

    let stats = core.stats();
    assert_eq!(stats.dispatcher.received, 4);
    assert_eq!(stats.dispatcher.completed, 3);
    assert_eq!(stats.dispatcher.dropped.get(&DropReason::NotConnected), Some(&1));
    assert_eq!(stats.registry.expired_disconnect, 1);
    h.core.shutdown().await;
}

#[tokio::test]
async fn submit_keeps_agent_alive() {
    let h = harness("1s:60");
    let core = &h.core;
    core.process_frame(&encode_connect("web-1", "jvm", ""), remote(), None);
    let serial = core.registry().serial_for("web-1", "jvm").unwrap();

    for _ in 0..3 {
        h.clock.advance(8_000);
        let now = h.clock.now_ms();
        assert!(matches!(
            core.process_frame(&submit(now, 1), remote(), None),
            Outcome::Filed { .. }
        ));
        assert!(core.registry().sweep().is_empty());
    }
    assert_eq!(core.registry().serial_for("web-1", "jvm"), Some(serial));
    h.core.shutdown().await;
}

#[tokio::test]
async fn string_metrics_are_cataloged_not_filed() {
    let h = harness("1s:60");
    let frame = encode_submit(&MetricSubmit {
        token: NO_TOKEN,
        host: "web-1".into(),
        agent: "jvm".into(),
        metric_type: MetricType::String,
        namespace: ns(&["build"]),
        name: "version".into(),
        timestamp_ms: T0,
        value: 0,
    });
    let outcome = h.core.process_frame(&frame, remote(), None);
    assert!(matches!(outcome, Outcome::Cataloged { .. }));
    assert!(h.sink.is_empty());
    // Submitting auto-identifies the agent.
    assert!(h.core.registry().serial_for("web-1", "jvm").is_some());
    h.core.shutdown().await;
}

#[tokio::test]
async fn malformed_and_unknown_frames_are_dropped() {
    let h = harness("1s:60");
    let core = &h.core;

    assert_eq!(
        core.process_frame(&[], remote(), None),
        Outcome::Dropped {
            reason: DropReason::Malformed
        }
    );
    assert_eq!(
        core.process_frame(&[0x7f, 1, 2, 3], remote(), None),
        Outcome::Dropped {
            reason: DropReason::UnknownOpCode
        }
    );
    let mut truncated = encode_connect("web-1", "jvm", "");
    truncated.truncate(truncated.len() - 2);
    assert_eq!(
        core.process_frame(&truncated, remote(), None),
        Outcome::Dropped {
            reason: DropReason::Malformed
        }
    );

    let stats = core.stats().dispatcher;
    assert_eq!(stats.received, 3);
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.unknown_opcodes, 1);
    assert_eq!(stats.dropped_total(), 3);
    h.core.shutdown().await;
}

#[tokio::test]
async fn sink_failure_is_request_local() {
    let h = harness("1s:60");
    h.sink.set_failing(true);
    assert_eq!(
        h.core.process_frame(&submit(T0, 1), remote(), None),
        Outcome::Dropped {
            reason: DropReason::SinkFailure
        }
    );
    h.sink.set_failing(false);
    assert!(matches!(
        h.core.process_frame(&submit(T0, 2), remote(), None),
        Outcome::Filed { .. }
    ));
    h.core.shutdown().await;
}

#[tokio::test]
async fn channel_close_reports_remaining_agents() {
    let h = harness("1s:60");
    let core = &h.core;
    let jvm = core.open_channel(remote());
    let os = core.open_channel(remote());
    assert_eq!(core.sessions().channel_count(), 2);

    core.process_frame(&encode_connect("web-1", "jvm", ""), remote(), Some(&jvm));
    core.process_frame(&encode_connect("web-1", "os", ""), remote(), Some(&os));
    let jvm = core.sessions().channel(jvm.channel_id).unwrap();
    let os = core.sessions().channel(os.channel_id).unwrap();

    assert_eq!(core.close_channel(&jvm), 1);
    assert_eq!(core.close_channel(&os), 0);
    assert_eq!(core.sessions().channel_count(), 0);
    h.core.shutdown().await;
}

struct Shadow;

impl AgentRequestHandler for Shadow {
    fn name(&self) -> &str {
        "shadow"
    }

    fn handled_op_codes(&self) -> Vec<OpCode> {
        vec![OpCode(0x42), OpCode::PING]
    }

    fn process_agent_request(&self, _ctx: &RequestContext<'_>) -> Result<Outcome, DispatchError> {
        Ok(Outcome::Touched { serial: 0 })
    }
}

#[test]
fn duplicate_opcode_registration_is_fatal() {
    let catalog = tierline_core::catalog::MetricCatalog::default();
    let registry = Arc::new(tierline_core::registry::VirtualAgentRegistry::new(
        Arc::new(catalog),
        Arc::new(ManualClock::new(T0)),
        tierline_core::events::EventBus::default(),
        1_000,
    ));
    let err = Dispatcher::builder()
        .register(Arc::new(KeepAliveHandler::new(registry, Default::default())))
        .unwrap()
        .register(Arc::new(Shadow))
        .err()
        .unwrap();
    match &err {
        DispatchError::DuplicateOpCode {
            opcode,
            existing,
            duplicate,
        } => {
            assert_eq!(*opcode, OpCode::PING.0);
            assert_eq!(existing, "keepalive");
            assert_eq!(duplicate, "shadow");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.is_config_fatal());
    assert!(tierline_core::Error::from(err).is_config_fatal());
}

#[test]
fn custom_opcodes_route_to_their_handler() {
    let dispatcher = Dispatcher::builder()
        .register(Arc::new(Shadow))
        .unwrap()
        .build();
    assert_eq!(dispatcher.op_codes(), vec![OpCode::PING, OpCode(0x42)]);
    let frame = Writer::frame(OpCode(0x42)).finish();
    assert_eq!(
        dispatcher.process_frame(&frame, remote(), None),
        Outcome::Touched { serial: 0 }
    );
}

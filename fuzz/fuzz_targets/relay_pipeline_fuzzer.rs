//! Fuzz target for the relay pipeline (authenticate → join → send → fan-out)
//!
//! # Strategy
//!
//! - A handful of connections driven through `ServerDriver` in arbitrary
//!   order: joins, leaves, sends, signaling, malformed events, disconnects
//! - Storage wrapped in `ChaoticStorage` with a fuzzed failure rate
//!
//! # Invariants
//!
//! - Every stored message is dense in seq and non-decreasing in time
//! - No member receives a message that is not in storage
//! - A disconnected connection is absent from every room and the registry
//! - The driver never panics

#![no_main]

use std::collections::HashSet;

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use roomcast_core::{HmacTokenVerifier, RoomKey, TokenClaims};
use roomcast_proto::{ClientMessage, ServerMessage};
use roomcast_server::{
    ChaoticStorage, DriverConfig, MemoryStorage, Outbox, OutboxReceiver, ServerDriver, ServerEvent,
    Storage, SystemEnv,
};

const SECRET: &[u8] = b"fuzz-secret";
const ROOMS: [&str; 3] = ["general", "random", "dm_a_b"];

#[derive(Debug, Clone, Arbitrary)]
struct Scenario {
    failure_percent: u8,
    seed: u64,
    ops: Vec<Op>,
}

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    Join { conn: u8, room: u8 },
    Leave { conn: u8, room: u8 },
    Send { conn: u8, room: u8, body: String },
    Signal { conn: u8, to: u8, payload: Vec<u8> },
    Malformed { conn: u8 },
    Disconnect { conn: u8 },
    Tick,
}

struct Conn {
    id: u64,
    rx: OutboxReceiver,
    open: bool,
}

fuzz_target!(|scenario: Scenario| {
    let rate = f64::from(scenario.failure_percent % 101) / 100.0;
    let storage = ChaoticStorage::with_seed(MemoryStorage::new(), rate, scenario.seed);
    let verifier = HmacTokenVerifier::new(SECRET);
    let driver =
        ServerDriver::new(SystemEnv::new(), storage, verifier.clone(), DriverConfig::default());

    let mut conns: Vec<Conn> = Vec::new();
    for user in ["a", "b", "c"] {
        let id = driver.allocate_connection_id();
        let (outbox, rx) = Outbox::channel();
        driver.process_event(ServerEvent::ConnectionAccepted { session_id: id, outbox }).unwrap();
        let token = verifier
            .issue(&TokenClaims { sub: user.into(), name: None, exp: u64::MAX })
            .unwrap();
        driver
            .process_event(ServerEvent::MessageReceived {
                session_id: id,
                message: ClientMessage::Authenticate { token },
            })
            .unwrap();
        conns.push(Conn { id, rx, open: true });
    }

    let mut delivered: HashSet<(String, u64, String)> = HashSet::new();

    for op in scenario.ops.into_iter().take(256) {
        let (conn, message) = match op {
            Op::Join { conn, room } => {
                (conn, ClientMessage::Join { room: ROOMS[room as usize % ROOMS.len()].into() })
            },
            Op::Leave { conn, room } => {
                (conn, ClientMessage::Leave { room: ROOMS[room as usize % ROOMS.len()].into() })
            },
            Op::Send { conn, room, body } => (
                conn,
                ClientMessage::Send { room: ROOMS[room as usize % ROOMS.len()].into(), body },
            ),
            Op::Signal { conn, to, payload } => {
                let to = conns[to as usize % conns.len()].id;
                (conn, ClientMessage::SignalOffer { to, payload: Bytes::from(payload) })
            },
            Op::Malformed { conn } => {
                let c = &conns[conn as usize % conns.len()];
                if c.open {
                    driver
                        .process_event(ServerEvent::MalformedMessage {
                            session_id: c.id,
                            reason: "fuzz".into(),
                        })
                        .unwrap();
                }
                continue;
            },
            Op::Disconnect { conn } => {
                let c = &mut conns[conn as usize % conns.len()];
                driver
                    .process_event(ServerEvent::ConnectionClosed {
                        session_id: c.id,
                        reason: "fuzz".into(),
                    })
                    .unwrap();
                c.open = false;

                for room in ROOMS {
                    let key = RoomKey::parse(room).unwrap();
                    assert!(!driver.rooms().members_of(&key).contains(&c.id));
                }
                assert!(driver.registry().lookup(c.id).is_none());
                continue;
            },
            Op::Tick => {
                let _ = driver.process_event(ServerEvent::Tick);
                continue;
            },
        };

        let c = &conns[conn as usize % conns.len()];
        if c.open {
            driver.process_event(ServerEvent::MessageReceived { session_id: c.id, message }).unwrap();
        }

        for c in &mut conns {
            while let Ok(event) = c.rx.try_recv() {
                if let ServerMessage::Message(m) = event {
                    delivered.insert((m.room, m.seq, m.body));
                }
            }
        }
    }

    let inner = driver.storage().inner();
    for room in ROOMS {
        let key = RoomKey::parse(room).unwrap();
        let stored = inner.recent_messages(&key, usize::MAX).unwrap();

        for (i, m) in stored.iter().enumerate() {
            assert_eq!(m.seq, i as u64);
        }
        assert!(stored.windows(2).all(|w| w[0].time <= w[1].time));

        for (r, seq, body) in &delivered {
            if r == room {
                let m = stored.get(*seq as usize).expect("delivered message must be stored");
                assert_eq!(&m.body, body);
            }
        }
    }
});

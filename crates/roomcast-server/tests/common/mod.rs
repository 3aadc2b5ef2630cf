//! Shared harness for driver-level integration tests.
//!
//! `TestEnv` runs on virtual time and hands out connection ids 1, 2, 3, ...
//! so scenarios are deterministic.

#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use roomcast_core::{Environment, HmacTokenVerifier, TokenClaims};
use roomcast_proto::{ClientMessage, ServerMessage};
use roomcast_server::{
    DriverConfig, MemoryStorage, Outbox, OutboxReceiver, ServerAction, ServerDriver, ServerEvent,
    Storage,
};

pub const SECRET: &[u8] = b"integration-test-secret";

/// Deterministic environment: virtual clock, sequential ids.
#[derive(Clone, Default)]
pub struct TestEnv {
    elapsed_ms: Arc<AtomicU64>,
    next_id: Arc<AtomicU64>,
}

impl TestEnv {
    pub fn advance(&self, by: Duration) {
        self.elapsed_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Environment for TestEnv {
    type Instant = Duration;

    fn now(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms.load(Ordering::SeqCst))
    }

    fn wall_clock_secs(&self) -> u64 {
        1_700_000_000 + self.elapsed_ms.load(Ordering::SeqCst) / 1000
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        for (dst, src) in buffer.iter_mut().zip(id.to_be_bytes().iter().cycle()) {
            *dst = *src;
        }
    }
}

pub type Driver<S = MemoryStorage> = ServerDriver<TestEnv, S, HmacTokenVerifier>;

pub fn driver() -> Driver {
    driver_with_storage(MemoryStorage::new())
}

pub fn driver_with_storage<S: Storage>(storage: S) -> Driver<S> {
    ServerDriver::new(
        TestEnv::default(),
        storage,
        HmacTokenVerifier::new(SECRET),
        DriverConfig::default(),
    )
}

pub fn token(user: &str, name: &str) -> String {
    HmacTokenVerifier::new(SECRET)
        .issue(&TokenClaims { sub: user.into(), name: Some(name.into()), exp: 1_800_000_000 })
        .unwrap()
}

/// A connected, authenticated client as the driver sees it.
pub struct Client {
    pub id: u64,
    pub rx: OutboxReceiver,
}

impl Client {
    /// Accept a connection and authenticate it as `user`.
    pub fn connect<S: Storage>(driver: &Driver<S>, user: &str) -> Self {
        let id = driver.allocate_connection_id();
        let (outbox, rx) = Outbox::channel();
        let actions =
            driver.process_event(ServerEvent::ConnectionAccepted { session_id: id, outbox }).unwrap();
        assert!(actions.is_empty());

        let mut client = Self { id, rx };
        client.send(driver, ClientMessage::Authenticate { token: token(user, user) });
        let events = client.drain();
        assert!(
            matches!(&events[..], [ServerMessage::Authenticated { .. }]),
            "unexpected auth result: {events:?}"
        );
        client
    }

    pub fn send<S: Storage>(&mut self, driver: &Driver<S>, message: ClientMessage) -> Vec<ServerAction> {
        driver
            .process_event(ServerEvent::MessageReceived { session_id: self.id, message })
            .unwrap()
    }

    pub fn join<S: Storage>(&mut self, driver: &Driver<S>, room: &str) {
        self.send(driver, ClientMessage::Join { room: room.into() });
    }

    pub fn say<S: Storage>(&mut self, driver: &Driver<S>, room: &str, body: &str) {
        self.send(driver, ClientMessage::Send { room: room.into(), body: body.into() });
    }

    pub fn disconnect<S: Storage>(&self, driver: &Driver<S>) {
        driver
            .process_event(ServerEvent::ConnectionClosed {
                session_id: self.id,
                reason: "client went away".into(),
            })
            .unwrap();
    }

    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Bodies of the live `message` events received since the last drain.
    pub fn bodies(&mut self) -> Vec<String> {
        self.drain()
            .into_iter()
            .filter_map(|msg| match msg {
                ServerMessage::Message(m) => Some(m.body),
                _ => None,
            })
            .collect()
    }
}

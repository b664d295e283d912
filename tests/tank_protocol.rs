use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tank_ring::broker::Broker;
use tank_ring::common::config::{BrokerConfig, TankConfig};
use tank_ring::common::fish::FishModel;
use tank_ring::common::messages::{Direction, Envelope, FishLocation, Message};
use tank_ring::tank::{TankEvent, TankModel};
use tank_ring::transport::{MemoryEndpoint, MemoryNetwork, Transport};

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], port))
}

const BROKER: u16 = 4711;

/// Broker and tanks on one in-memory network, driven by hand: nothing is
/// delivered until [`Cluster::pump`] runs.
struct Cluster {
    broker: Arc<Broker>,
    broker_endpoint: Arc<MemoryEndpoint>,
    tanks: Vec<(Arc<TankModel>, Arc<MemoryEndpoint>)>,
    network: MemoryNetwork,
    config: TankConfig,
}

impl Cluster {
    fn new(config: TankConfig) -> Self {
        let network = MemoryNetwork::new();
        let broker_endpoint = network.endpoint(addr(BROKER));
        let transport: Arc<dyn Transport> = broker_endpoint.clone();
        let broker = Arc::new(Broker::new(BrokerConfig::default(), transport));
        Self {
            broker,
            broker_endpoint,
            tanks: Vec::new(),
            network,
            config,
        }
    }

    /// Add a tank that has not registered yet.
    fn attach(&mut self) -> Arc<TankModel> {
        let port = 5001 + self.tanks.len() as u16;
        let endpoint = self.network.endpoint(addr(port));
        let transport: Arc<dyn Transport> = endpoint.clone();
        let mut config = self.config.clone();
        config.broker_address = addr(BROKER);

        let model = Arc::new(TankModel::new(config, transport));
        self.tanks.push((Arc::clone(&model), endpoint));
        model
    }

    /// Add a tank and let it register.
    async fn join(&mut self) -> Arc<TankModel> {
        let model = self.attach();
        model.request_registration().await;
        self.pump().await;
        assert!(model.is_registered().await);
        model
    }

    /// Deliver messages until every mailbox is empty.
    async fn pump(&self) {
        loop {
            let mut moved = 0;
            while let Ok(Some(envelope)) = self.broker_endpoint.non_blocking_receive() {
                self.broker.handle_message(envelope).await;
                moved += 1;
            }
            for (model, endpoint) in &self.tanks {
                while let Ok(Some(envelope)) = endpoint.non_blocking_receive() {
                    model.dispatch(envelope).await;
                    moved += 1;
                }
            }
            if moved == 0 {
                return;
            }
        }
    }

    async fn total_swimming(&self) -> usize {
        let mut total = 0;
        for (model, _) in &self.tanks {
            total += model.fishies().await.iter().filter(|f| f.is_swimming()).count();
        }
        total
    }
}

/// A dwell long enough that the token never moves during a test.
fn parked_token() -> TankConfig {
    TankConfig {
        token_dwell_ms: 3_600_000,
        ..TankConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_first_tank_gets_token_and_a_fish() {
    let mut cluster = Cluster::new(parked_token());
    let a = cluster.join().await;
    let b = cluster.join().await;

    assert!(a.has_token().await);
    assert!(!b.has_token().await);
    assert_eq!(a.id().await.as_deref(), Some("tank0"));
    assert_eq!(b.id().await.as_deref(), Some("tank1"));
    assert_eq!(a.neighbors().await, (Some(addr(5002)), Some(addr(5002))));
    assert_eq!(b.neighbors().await, (Some(addr(5001)), Some(addr(5001))));

    let fishies = a.fishies().await;
    assert_eq!(fishies.len(), 1);
    assert_eq!(fishies[0].id, "fish0@tank0");
    assert_eq!(
        a.forwarding_reference("fish0@tank0").await,
        Some(FishLocation::Here)
    );
}

#[tokio::test(start_paused = true)]
async fn test_renewal_response_does_not_respawn_fish() {
    let mut cluster = Cluster::new(parked_token());
    let a = cluster.join().await;

    a.request_registration().await;
    cluster.pump().await;
    a.request_registration().await;
    cluster.pump().await;

    assert_eq!(a.fishies().await.len(), 1);
    assert_eq!(a.id().await.as_deref(), Some("tank0"));
}

#[tokio::test(start_paused = true)]
async fn test_new_fish_is_capped() {
    let mut cluster = Cluster::new(parked_token());
    let a = cluster.join().await;

    let mut created = 1;
    while a.new_fish(100, 100).await.is_some() {
        created += 1;
    }
    assert_eq!(created, TankConfig::default().max_fishies);
    assert_eq!(a.fishies().await.len(), created);
}

#[tokio::test(start_paused = true)]
async fn test_token_holder_hands_fish_to_the_right() {
    let mut cluster = Cluster::new(parked_token());
    let a = cluster.join().await;
    let b = cluster.join().await;
    let c = cluster.join().await;

    // A fish arriving at A from its left neighbor C, swimming right.
    let fish = FishModel::new("fish7@tank2".into(), 0, 100, Direction::Right);
    a.dispatch(Envelope::new(Message::HandoffRequest { fish }, addr(5003)))
        .await;
    assert_eq!(
        a.forwarding_reference("fish7@tank2").await,
        Some(FishLocation::Here)
    );

    let mut ticks = 0;
    while a.forwarding_reference("fish7@tank2").await != Some(FishLocation::Right) {
        a.update().await;
        ticks += 1;
        assert!(ticks < 1_000, "fish never reached the right edge");
    }

    cluster.pump().await;
    assert_eq!(
        b.forwarding_reference("fish7@tank2").await,
        Some(FishLocation::Here)
    );
    assert!(b
        .fishies()
        .await
        .iter()
        .any(|f| f.id == "fish7@tank2" && f.is_swimming()));
    assert_eq!(c.forwarding_reference("fish7@tank2").await, None);
}

#[tokio::test(start_paused = true)]
async fn test_fish_turns_around_without_token() {
    let mut cluster = Cluster::new(parked_token());
    let _a = cluster.join().await;
    let b = cluster.join().await;

    let fish = FishModel::new("fish3@tank0".into(), 0, 100, Direction::Left);
    b.dispatch(Envelope::new(Message::HandoffRequest { fish }, addr(5001)))
        .await;

    // From x = WIDTH to the left edge and back.
    for _ in 0..700 {
        b.update().await;
    }
    let fishies = b.fishies().await;
    let fish = fishies.iter().find(|f| f.id == "fish3@tank0").unwrap();
    assert!(fish.is_swimming());
    assert_eq!(fish.direction, Direction::Right);
    assert_eq!(
        b.forwarding_reference("fish3@tank0").await,
        Some(FishLocation::Here)
    );
}

#[tokio::test(start_paused = true)]
async fn test_location_query_follows_forwarding_references() {
    let mut cluster = Cluster::new(parked_token());
    let a = cluster.join().await;
    let b = cluster.join().await;
    let _c = cluster.join().await;

    let fish = FishModel::new("fish9@tank2".into(), 0, 100, Direction::Right);
    a.dispatch(Envelope::new(Message::HandoffRequest { fish }, addr(5003)))
        .await;
    while a.forwarding_reference("fish9@tank2").await != Some(FishLocation::Right) {
        a.update().await;
    }
    cluster.pump().await;

    let mut events = b.subscribe();
    a.locate_fish_globally("fish9@tank2").await;
    cluster.pump().await;

    let mut located = None;
    while let Ok(event) = events.try_recv() {
        if let TankEvent::FishLocated { fish_id, found } = event {
            located = Some((fish_id, found));
        }
    }
    assert_eq!(located, Some(("fish9@tank2".to_string(), true)));
    assert!(b
        .fishies()
        .await
        .iter()
        .any(|f| f.id == "fish9@tank2" && f.toggled));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_fish_is_not_found_locally() {
    let mut cluster = Cluster::new(parked_token());
    let a = cluster.join().await;

    let mut events = a.subscribe();
    a.locate_fish_globally("fish99@nowhere").await;
    assert_eq!(
        events.try_recv().unwrap(),
        TankEvent::FishLocated {
            fish_id: "fish99@nowhere".into(),
            found: false
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_counts_fish_in_flight() {
    let mut cluster = Cluster::new(parked_token());
    let a = cluster.join().await;
    let b = cluster.join().await;
    let c = cluster.join().await;

    let mut created = 3;
    for tank in [&a, &b, &c] {
        for i in 0..3 {
            if tank.new_fish(50 + 100 * i, 100).await.is_some() {
                created += 1;
            }
        }
    }

    // Only A holds the token; tick it until something is mid-handoff.
    let mut ticks = 0;
    while !a.fishies().await.iter().any(|f| f.is_departing()) {
        a.update().await;
        ticks += 1;
        assert!(ticks < 2_000, "no fish reached an edge");
    }
    assert!(cluster.total_swimming().await < created);

    let mut events = b.subscribe();
    assert!(b.initiate_snapshot().await.is_some());
    assert!(b.initiate_snapshot().await.is_none());
    cluster.pump().await;

    let mut total = None;
    while let Ok(event) = events.try_recv() {
        if let TankEvent::SnapshotCompleted { total: reported } = event {
            total = Some(reported);
        }
    }
    assert_eq!(total, Some(created as u64));
    assert_eq!(cluster.total_swimming().await, created);
}

#[tokio::test(start_paused = true)]
async fn test_single_tank_snapshot() {
    let mut cluster = Cluster::new(parked_token());
    let a = cluster.join().await;
    a.new_fish(200, 200).await.unwrap();

    let mut events = a.subscribe();
    a.initiate_snapshot().await.unwrap();
    cluster.pump().await;

    let mut total = None;
    while let Ok(event) = events.try_recv() {
        if let TankEvent::SnapshotCompleted { total: reported } = event {
            total = Some(reported);
        }
    }
    assert_eq!(total, Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_waits_for_known_neighbors() {
    let mut cluster = Cluster::new(parked_token());
    let a = cluster.attach();

    assert!(a.initiate_snapshot().await.is_none());
    assert!(a.initiate_snapshot().await.is_none());

    // Once registered the same tank can run a round to completion.
    a.request_registration().await;
    cluster.pump().await;
    let mut events = a.subscribe();
    assert!(a.initiate_snapshot().await.is_some());
    cluster.pump().await;

    let mut total = None;
    while let Ok(event) = events.try_recv() {
        if let TankEvent::SnapshotCompleted { total: reported } = event {
            total = Some(reported);
        }
    }
    assert_eq!(total, Some(1));
    assert!(a.initiate_snapshot().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_token_circulates_and_stays_exclusive() {
    let config = TankConfig {
        token_dwell_ms: 50,
        ..TankConfig::default()
    };
    let mut cluster = Cluster::new(config);
    let mut tanks = Vec::new();
    for _ in 0..3 {
        tanks.push(cluster.join().await);
    }

    let mut visited = [false; 3];
    for _ in 0..2_000 {
        tokio::time::advance(Duration::from_millis(10)).await;
        cluster.pump().await;

        let mut holders = 0;
        for (i, tank) in tanks.iter().enumerate() {
            if tank.has_token().await {
                holders += 1;
                visited[i] = true;
            }
        }
        assert!(holders <= 1, "{} tanks hold the token", holders);
    }
    assert!(visited.iter().all(|&v| v), "token did not complete a lap");
}

#[tokio::test(start_paused = true)]
async fn test_leaving_tank_hands_token_on() {
    let mut cluster = Cluster::new(parked_token());
    let a = cluster.join().await;
    let b = cluster.join().await;

    assert!(a.has_token().await);
    let mut events = a.subscribe();
    a.finish().await;
    cluster.pump().await;

    assert_eq!(events.try_recv().unwrap(), TankEvent::TokenChanged(false));
    assert!(!a.has_token().await);
    assert!(b.has_token().await);
    assert_eq!(b.neighbors().await, (Some(addr(5002)), Some(addr(5002))));
    assert_eq!(cluster.broker.ring_view().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_token_arriving_after_leave_moves_on() {
    let mut cluster = Cluster::new(parked_token());
    let _a = cluster.join().await;
    let b = cluster.join().await;
    let c = cluster.join().await;

    b.finish().await;
    cluster.pump().await;
    assert_eq!(cluster.broker.ring_view().await.len(), 2);

    // A passed the token just before learning that B left.
    b.dispatch(Envelope::new(Message::Token, addr(5001))).await;
    cluster.pump().await;

    assert!(!b.has_token().await);
    assert!(c.has_token().await);
}

//! End-to-end session scenarios over the loopback transport.

use std::time::Duration;

use seatsync_client::{ClientConfig, LEAVE_GRACE_MS, RECONNECT_BACKOFF_MS};
use seatsync_core::{AvatarPose, LifecycleState, Quat, Vec3};
use seatsync_server::ServerConfig;
use seatsync_testkit::{ChaosConfig, EmbodimentEvent, LoopbackNetwork, init_tracing};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn pose_at(x: f32) -> AvatarPose {
    AvatarPose {
        expression: 0.5,
        ..AvatarPose::from_root(Vec3::new(x, 0.0, 0.0), Quat::IDENTITY)
    }
}

/// A: first client in an empty 4-seat session gets seat 0 and no relays.
#[test]
fn test_scenario_a_first_join() {
    init_tracing();
    let mut net = LoopbackNetwork::perfect();
    let a = net.join_client();

    assert!(net.client(a).is_active());
    assert_eq!(net.client(a).seat(), Some(0));
    assert_eq!(net.client(a).mirror_count(), 0);
    assert!(
        !net.embodiment(a)
            .events
            .iter()
            .any(|e| matches!(e, EmbodimentEvent::Spawn(_)))
    );
}

/// B: second client mirrors A before being seated on 1; A mirrors B.
#[test]
fn test_scenario_b_second_join() {
    init_tracing();
    let mut net = LoopbackNetwork::perfect();
    let a = net.join_client();
    let b = net.join_client();
    let (id_a, id_b) = (net.transport_id(a).unwrap(), net.transport_id(b).unwrap());

    assert_eq!(net.client(b).seat(), Some(1));

    let b_log = net.embodiment(b);
    let spawn_a = b_log.position(&EmbodimentEvent::Spawn(id_a)).unwrap();
    let seat_1 = b_log.position(&EmbodimentEvent::Seat(1)).unwrap();
    assert!(spawn_a < seat_1, "existing participant must arrive before the seat");
    assert_eq!(b_log.count(&EmbodimentEvent::Spawn(id_b)), 0);

    assert_eq!(net.embodiment(a).live_ids(), vec![id_b]);
    assert_eq!(net.embodiment(b).live_ids(), vec![id_a]);
}

/// C: A disconnects; seat 0 frees and B drops A's mirror after the grace delay.
#[test]
fn test_scenario_c_disconnect() {
    init_tracing();
    let mut net = LoopbackNetwork::perfect();
    let a = net.join_client();
    let b = net.join_client();
    let id_a = net.transport_id(a).unwrap();

    net.sever(a);

    assert!(!net.server().seats().is_occupied(0));
    assert!(!net.client(b).reconciler().is_live(id_a));
    assert_eq!(net.client(b).mirror_count(), 1);

    net.advance(ms(LEAVE_GRACE_MS));
    assert_eq!(net.client(b).mirror_count(), 0);
    assert!(net.embodiment(b).live.is_empty());
}

/// D: a new client after C reuses seat 0.
#[test]
fn test_scenario_d_seat_reuse() {
    init_tracing();
    let mut net = LoopbackNetwork::perfect();
    let a = net.join_client();
    let _b = net.join_client();
    net.sever(a);
    net.set_reachable(a, false);

    let c = net.join_client();
    assert_eq!(net.client(c).seat(), Some(0));
}

/// E: a fifth joiner into four occupied seats is never seated.
#[test]
fn test_scenario_e_seats_exhausted() {
    init_tracing();
    let mut net = LoopbackNetwork::perfect();
    let seated: Vec<_> = (0..4).map(|_| net.join_client()).collect();
    let late = net.join_client();

    assert_eq!(net.client(late).state(), LifecycleState::Authenticated);
    assert!(!net.client(late).is_active());
    assert!(net.embodiment(late).seats().is_empty());
    assert_eq!(net.server().stats().joins_exhausted, 1);

    // Nobody learns about the unseated participant.
    let late_id = net.transport_id(late).unwrap();
    for handle in seated {
        assert!(net.client(handle).mirror(late_id).is_none());
    }
}

#[test]
fn test_seat_pool_partitioned_through_churn() {
    init_tracing();
    let mut net = LoopbackNetwork::perfect();
    let handles: Vec<_> = (0..6).map(|_| net.join_client()).collect();

    for (step, handle) in handles.iter().enumerate() {
        if step % 2 == 0 {
            net.sever(*handle);
        }
        let seats = net.server().seats();
        assert_eq!(seats.free_count() + seats.occupied_count(), seats.capacity());
        assert!(seats.free_seats().all(|s| !seats.is_occupied(s)));
    }

    net.advance(ms(RECONNECT_BACKOFF_MS));
    let seats = net.server().seats();
    assert_eq!(seats.occupied_count(), net.server().participant_count());
    assert_eq!(seats.free_count() + seats.occupied_count(), seats.capacity());
}

#[test]
fn test_poses_reach_every_other_participant() {
    init_tracing();
    let mut net = LoopbackNetwork::perfect();
    let a = net.join_client();
    let b = net.join_client();
    let c = net.join_client();
    let id_a = net.transport_id(a).unwrap();

    assert!(net.send_pose(a, pose_at(3.0)));

    for handle in [b, c] {
        let mirror = net.client(handle).mirror(id_a).unwrap();
        assert_eq!(mirror.pose.position, Vec3::new(3.0, 0.0, 0.0));
        assert_eq!(net.embodiment(handle).live[&id_a].expression, 0.5);
    }
    assert_eq!(
        net.embodiment(a).count(&EmbodimentEvent::Update(id_a)),
        0,
        "sender never receives its own pose"
    );
    assert_eq!(
        net.server().record(id_a).unwrap().position,
        Vec3::new(3.0, 0.0, 0.0)
    );
}

#[test]
fn test_late_joiner_seeded_with_last_known_root() {
    init_tracing();
    let mut net = LoopbackNetwork::perfect();
    let a = net.join_client();
    let id_a = net.transport_id(a).unwrap();
    net.send_pose(a, pose_at(-2.5));

    let b = net.join_client();
    let mirror = net.client(b).mirror(id_a).unwrap();
    assert_eq!(mirror.pose.position, Vec3::new(-2.5, 0.0, 0.0));
}

#[test]
fn test_reconnect_rebuilds_mirrors_without_duplicates() {
    init_tracing();
    let mut net = LoopbackNetwork::perfect();
    let a = net.join_client();
    let b = net.join_client();
    let _c = net.join_client();

    net.sever(b);
    assert_eq!(net.client(b).state(), LifecycleState::Disconnected);
    assert!(net.embodiment(b).live.is_empty());

    net.advance(ms(RECONNECT_BACKOFF_MS));
    assert!(net.client(b).is_active());
    assert_eq!(net.embodiment(b).duplicate_spawns, 0);
    assert_eq!(net.embodiment(b).live_ids(), net.expected_mirrors(b));

    // A saw the old B leave and the new B join.
    net.advance(ms(LEAVE_GRACE_MS));
    assert_eq!(net.embodiment(a).live_ids(), net.expected_mirrors(a));
}

#[test]
fn test_server_stop_drops_everyone_into_retry() {
    init_tracing();
    let mut net = LoopbackNetwork::perfect();
    let a = net.join_client();
    let b = net.join_client();

    let dropped = net.server_mut().stop();
    assert_eq!(dropped.len(), 2);
    for handle in [a, b] {
        net.sever(handle);
        assert_eq!(net.client(handle).state(), LifecycleState::Disconnected);
    }

    // Server not listening: attempts fail and keep retrying.
    net.advance(ms(RECONNECT_BACKOFF_MS));
    assert!(!net.client(a).is_active());

    net.server_mut().start();
    net.advance(ms(RECONNECT_BACKOFF_MS));
    assert!(net.client(a).is_active());
    assert!(net.client(b).is_active());
}

#[test]
fn test_lossy_links_converge() {
    init_tracing();
    let mut duplicated = 0;
    for seed in 0..8 {
        let mut net = LoopbackNetwork::new(
            ServerConfig::default(),
            ClientConfig::default(),
            ChaosConfig::lossy(seed),
        );
        let handles: Vec<_> = (0..4).map(|_| net.join_client()).collect();

        for round in 0..20 {
            for handle in &handles {
                net.send_pose(*handle, pose_at(round as f32));
            }
        }
        net.sever(handles[1]);
        net.advance(ms(LEAVE_GRACE_MS));
        net.advance(ms(RECONNECT_BACKOFF_MS));

        for handle in &handles {
            assert!(net.client(*handle).is_active(), "seed {seed}");
            assert_eq!(
                net.embodiment(*handle).live_ids(),
                net.expected_mirrors(*handle),
                "seed {seed}"
            );
            assert_eq!(net.embodiment(*handle).duplicate_spawns, 0, "seed {seed}");
        }
        duplicated += net.stats().duplicated;
    }
    assert!(duplicated > 0);
}

#[test]
fn test_pose_overtaking_its_join_relay_is_dropped() {
    init_tracing();
    let mut net = LoopbackNetwork::perfect();
    let a = net.join_client();
    net.set_reliable_held(a, true);

    let b = net.join_client();
    let id_b = net.transport_id(b).unwrap();
    assert!(net.send_pose(b, pose_at(7.0)));

    // The pose reached A before the JoinRelay and had nothing to update.
    assert_eq!(net.client(a).mirror_count(), 0);
    assert!(net.embodiment(a).live.is_empty());
    assert_eq!(net.embodiment(a).orphan_updates, 0);

    net.set_reliable_held(a, false);
    net.run_until_idle();
    assert_eq!(net.embodiment(a).live_ids(), vec![id_b]);
    assert_eq!(net.embodiment(a).live[&id_b].position, Vec3::ZERO);
    assert_eq!(net.embodiment(a).count(&EmbodimentEvent::Update(id_b)), 0);
}

#[test]
fn test_pose_trailing_its_leave_relay_is_ignored() {
    init_tracing();
    let mut net = LoopbackNetwork::perfect();
    let a = net.join_client();
    let b = net.join_client();
    let id_a = net.transport_id(a).unwrap();

    net.set_unreliable_held(true);
    assert!(net.send_pose(a, pose_at(5.0)));
    net.sever(a);
    assert!(!net.client(b).reconciler().is_live(id_a));
    let seen = net.embodiment(b).events.len();

    net.set_unreliable_held(false);
    net.run_until_idle();
    assert_eq!(net.embodiment(b).events.len(), seen, "late pose reached the avatar");
    assert_eq!(net.embodiment(b).live[&id_a].position, Vec3::ZERO);

    net.advance(ms(LEAVE_GRACE_MS));
    assert!(net.embodiment(b).live.is_empty());
    assert_eq!(net.embodiment(b).orphan_despawns, 0);
}

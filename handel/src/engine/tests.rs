// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::time::Duration;

use super::*;
use crate::bitset::{BitSet, FieldBitSet};
use crate::blacklist::BlackListStrategy;
use crate::config::{infinite_timeout_factory, linear_timeout_factory, random_partitioner_factory};
use crate::crypto::PublicKey;
use crate::test_utils::{FakeConstructor, FakeSignature, fake_cluster};

const TIMEOUT: Duration = Duration::from_secs(10);

fn config() -> Config<FakeConstructor> {
    Config {
        new_timeout_strategy: infinite_timeout_factory(),
        ..Config::default()
    }
}

/// Checks that `ms` spans the registry and verifies under the aggregate of
/// the keys of its contributors.
fn assert_final(
    ms: &MultiSignature<FakeSignature>,
    reg: &Arc<dyn Registry<PublicKeyOf<FakeConstructor>>>,
) {
    assert_eq!(ms.bit_length(), reg.size());
    let ones = ms.bitset.ones();
    let signers: Vec<i32> = ms.signature.signers().iter().copied().collect();
    assert_eq!(signers, ones.iter().map(|&i| i as i32).collect::<Vec<_>>());
    let aggregate = ones
        .iter()
        .filter_map(|&i| reg.identity(i))
        .fold(FakeConstructor.public_key(), |acc, id| acc.combine(id.public_key()));
    assert!(aggregate.verify_signature(b"handel", &ms.signature).is_ok());
}

fn packet(origin: i32, level: u8, length: usize, ones: &[usize]) -> Packet {
    let mut bs = FieldBitSet::new(length);
    for &i in ones {
        bs.set(i, true);
    }
    let ms = MultiSignature::new(Box::new(bs), FakeSignature::from_signers([origin]));
    Packet {
        origin,
        level,
        multi_sig: ms.marshal_binary().unwrap(),
    }
}

#[test]
fn test_handel_full_aggregation() -> anyhow::Result<()> {
    let cluster = fake_cluster(8, config(), &[])?;
    cluster.start()?;

    let firsts = cluster
        .wait_complete_success(5, TIMEOUT)
        .expect("every node reaches the threshold");
    assert_eq!(firsts.len(), 8);
    for ms in &firsts {
        assert!(ms.cardinality() >= 5);
        assert_final(ms, cluster.registry());
    }

    // the first published signature may already be the full one
    for (node, first) in cluster.online().zip(firsts) {
        let mut ms = first;
        while ms.cardinality() < 8 {
            ms = node.final_signatures().recv_timeout(TIMEOUT)?;
        }
        assert_final(&ms, cluster.registry());
    }
    cluster.stop();
    Ok(())
}

#[test]
fn test_handel_non_power_of_two() -> anyhow::Result<()> {
    let config = Config {
        contributions_perc: 100,
        new_partitioner: random_partitioner_factory(Some([7; 32])),
        ..config()
    };
    let cluster = fake_cluster(13, config, &[])?;
    cluster.start()?;
    let full = cluster
        .wait_complete_success(13, TIMEOUT)
        .expect("every node gets every contribution");
    for ms in &full {
        assert_final(ms, cluster.registry());
    }
    cluster.stop();
    Ok(())
}

#[test]
fn test_handel_offline_node() -> anyhow::Result<()> {
    let config = Config {
        // 7 out of 8
        contributions_perc: 85,
        new_timeout_strategy: linear_timeout_factory(Duration::from_millis(50)),
        ..Config::default()
    };
    let cluster = fake_cluster(8, config, &[1])?;
    cluster.start()?;

    let outs = cluster
        .wait_complete_success(7, TIMEOUT)
        .expect("online nodes reach the threshold");
    assert_eq!(outs.len(), 7);
    for ms in &outs {
        assert_eq!(ms.cardinality(), 7);
        assert!(!ms.bitset.get(1));
        assert_final(ms, cluster.registry());
    }
    cluster.stop();
    Ok(())
}

#[test]
fn test_handel_single_node() -> anyhow::Result<()> {
    let cluster = fake_cluster(1, config(), &[])?;
    cluster.start()?;
    let out = cluster
        .wait_complete_success(1, TIMEOUT)
        .expect("a lone node completes at once");
    assert_eq!(out[0].bitset.ones(), vec![0]);
    Ok(())
}

#[test]
fn test_final_signatures_increase() -> anyhow::Result<()> {
    let config = Config {
        contributions_perc: 1,
        ..config()
    };
    let cluster = fake_cluster(16, config, &[])?;
    cluster.start()?;
    let node = cluster.node(3).unwrap();
    assert_eq!(node.threshold(), 1);

    let finals = node.final_signatures();
    let mut last = 0;
    while last < 16 {
        let ms = finals.recv_timeout(TIMEOUT)?;
        assert!(ms.cardinality() > last);
        last = ms.cardinality();
    }
    cluster.stop();
    // stopping closes the channel
    assert!(finals.recv_timeout(TIMEOUT).is_err());
    Ok(())
}

#[test]
fn test_parse_packet() -> anyhow::Result<()> {
    let cluster = fake_cluster(17, config(), &[])?;
    let node = cluster.node(0).unwrap();
    let inner = &node.inner;
    assert_eq!(inner.part.max_level(), 5);

    let cases = [
        packet(65000, 1, 1, &[0]),
        packet(-1, 1, 1, &[0]),
        packet(1, 6, 1, &[0]),
        packet(1, 200, 1, &[0]),
        // wrong bitset length for level 1
        packet(1, 1, 2, &[0]),
        // no contribution
        packet(1, 1, 1, &[]),
        // origin not in the level
        packet(2, 1, 1, &[0]),
        Packet {
            origin: 1,
            level: 1,
            multi_sig: vec![0, 1],
        },
    ];
    for (i, p) in cases.iter().enumerate() {
        assert!(inner.parse_packet(p).is_err(), "case {i}");
        inner.new_packet(p);
        assert_eq!(inner.proc.pending(), 0, "case {i}");
    }
    assert!(matches!(
        inner.parse_packet(&cases[0]),
        Err(HandelError::OriginOutOfRange { origin: 65000, size: 17 })
    ));
    assert!(matches!(
        inner.parse_packet(&cases[2]),
        Err(HandelError::InvalidPacketLevel { level: 6, max: 5 })
    ));
    assert!(matches!(
        inner.parse_packet(&cases[4]),
        Err(HandelError::InconsistentBitSet { expected: 1, actual: 2 })
    ));
    assert!(matches!(inner.parse_packet(&cases[5]), Err(HandelError::EmptyBitSet)));

    let valid = packet(1, 1, 1, &[0]);
    let sp = inner.parse_packet(&valid)?;
    assert_eq!((sp.origin, sp.level, sp.ms.cardinality()), (1, 1, 1));
    inner.new_packet(&valid);
    assert_eq!(inner.proc.pending(), 1);

    // level 5 of node 0 is [16, 17)
    assert!(inner.parse_packet(&packet(16, 5, 1, &[0])).is_ok());
    Ok(())
}

struct BlackListAll;

impl BlackListStrategy for BlackListAll {
    fn update(&self, _id: i32, _err: &HandelError) {}

    fn is_black_listed(&self, _id: i32) -> bool {
        true
    }
}

#[test]
fn test_black_listed_packets_are_dropped() -> anyhow::Result<()> {
    let config = Config {
        black_list: Arc::new(BlackListAll),
        ..config()
    };
    let cluster = fake_cluster(4, config, &[])?;
    let inner = &cluster.node(0).unwrap().inner;
    inner.new_packet(&packet(1, 1, 1, &[0]));
    assert_eq!(inner.proc.pending(), 0);
    Ok(())
}

#[test]
fn test_start_next_level() -> anyhow::Result<()> {
    let cluster = fake_cluster(5, config(), &[])?;
    // node 4 only has level 3
    let node = cluster.node(4).unwrap();
    assert_eq!(node.partitioner().levels(), vec![3]);
    assert_eq!(node.current_level(), 0);
    assert!(node.start_next_level());
    assert_eq!(node.current_level(), 3);
    assert!(!node.start_next_level());

    let node = cluster.node(0).unwrap();
    for level in 1..=3 {
        assert!(node.start_next_level());
        assert_eq!(node.current_level(), level);
    }
    assert!(!node.start_next_level());
    assert_eq!(node.current_level(), 3);
    Ok(())
}

#[test]
fn test_start_next_level_through_completed_levels() -> anyhow::Result<()> {
    let cluster = fake_cluster(8, config(), &[])?;
    let node = cluster.node(0).unwrap();
    node.inner.state.lock().completed.insert(3);
    assert!(node.start_next_level());
    assert!(node.start_next_level());
    // level 3 is started even though it is already complete
    assert!(node.start_next_level());
    assert_eq!(node.current_level(), 3);
    assert!(node.inner.state.lock().started.contains(&3));
    assert!(!node.start_next_level());
    Ok(())
}

#[test]
fn test_stop_is_idempotent() -> anyhow::Result<()> {
    let cluster = fake_cluster(4, config(), &[])?;
    let node = cluster.node(2).unwrap();
    node.start()?;
    node.start()?;
    node.stop();
    node.stop();
    // a stopped node doesn't restart
    node.start()?;
    assert!(!node.start_next_level());

    let inner = &node.inner;
    inner.new_packet(&packet(3, 1, 1, &[0]));
    assert_eq!(inner.proc.pending(), 0);
    Ok(())
}

#[test]
fn test_unknown_identity() {
    let reg = crate::test_utils::fake_registry(4);
    let nets = crate::test_utils::TestNetwork::cluster(4).unwrap();
    let res = Handel::<FakeConstructor>::new(
        nets[0].clone(),
        reg,
        4,
        Arc::new(FakeConstructor),
        b"handel",
        FakeSignature::from_signers([4]),
        config(),
    );
    assert!(matches!(res, Err(HandelError::UnknownIdentity(4))));
}

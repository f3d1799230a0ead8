#![cfg(feature = "soft")]

mod common;

use rclink::rdma_shim::soft::{install_device, journal, DeviceConfig, FailPoint};
use rclink::rdma_shim::soft::{JournalEntry, JournalEntry::*, ResourceKind::*};
use rclink::rdma_shim::QpState;
use rclink::{
    CMError, Config, ControlpathError, DatapathError, EndpointResources, HandshakeError,
    QueuePairStatus, RcError, Rendezvous,
};

use common::*;

fn config_on(dev: &str) -> Config {
    Config {
        dev_name: Some(dev.to_string()),
        ..Default::default()
    }
}

fn no_leaks(entries: &[JournalEntry]) -> bool {
    !entries.iter().any(|e| matches!(e, Leak(_)))
}

fn create_fails_on(dev: &str, point: FailPoint) -> RcError {
    install_device(DeviceConfig::new(dev).fail_at(point)).unwrap();
    // never reached: every failure below happens before the rendezvous
    let rendezvous = Rendezvous::Listen { port: 0 };
    EndpointResources::create(&config_on(dev), rendezvous).unwrap_err()
}

#[test]
fn mr_failure_releases_cq_pd_context() {
    let err = create_fails_on("fail_mr", FailPoint::RegMr);
    assert!(matches!(
        err,
        RcError::Controlpath(ControlpathError::CreationError("MR", _))
    ));
    assert_eq!(
        journal("fail_mr"),
        vec![
            Create(Context),
            Create(Pd),
            Create(Cq),
            Destroy(Cq),
            Destroy(Pd),
            Destroy(Context),
        ]
    );
}

#[test]
fn qp_failure_releases_everything_before_it() {
    let err = create_fails_on("fail_qp", FailPoint::CreateQp);
    assert!(matches!(
        err,
        RcError::Controlpath(ControlpathError::CreationError("QP", _))
    ));
    assert_eq!(
        journal("fail_qp"),
        vec![
            Create(Context),
            Create(Pd),
            Create(Cq),
            Create(Mr),
            Destroy(Mr),
            Destroy(Cq),
            Destroy(Pd),
            Destroy(Context),
        ]
    );
}

#[test]
fn early_failures_release_only_what_exists() {
    create_fails_on("fail_open", FailPoint::OpenDevice);
    assert!(journal("fail_open").is_empty());

    create_fails_on("fail_pd", FailPoint::AllocPd);
    assert_eq!(
        journal("fail_pd"),
        vec![Create(Context), Destroy(Context)]
    );

    create_fails_on("fail_cq", FailPoint::CreateCq);
    assert_eq!(
        journal("fail_cq"),
        vec![Create(Context), Create(Pd), Destroy(Pd), Destroy(Context)]
    );
}

#[test]
fn unknown_device_is_reported() {
    let err =
        EndpointResources::create(&config_on("no_such_dev"), Rendezvous::Listen { port: 0 })
            .unwrap_err();
    assert!(matches!(
        err,
        RcError::Controlpath(ControlpathError::NoDevice(name)) if name == "no_such_dev"
    ));
}

#[test]
fn connected_teardown_runs_in_reverse_and_twice() {
    install_device(DeviceConfig::new("td_server")).unwrap();
    install_device(DeviceConfig::new("td_client")).unwrap();

    let (mut server, client) = connect_pair(config_on("td_server"), config_on("td_client"));
    server.teardown();
    server.teardown();
    drop(server);

    let entries = journal("td_server");
    assert!(no_leaks(&entries));
    assert_eq!(
        entries,
        vec![
            Create(Context),
            Create(Pd),
            Create(Cq),
            Create(Mr),
            Create(Qp),
            Destroy(Qp),
            Destroy(Mr),
            Destroy(Cq),
            Destroy(Pd),
            Destroy(Context),
        ]
    );

    drop(client);
    let entries = journal("td_client");
    assert!(no_leaks(&entries));
    assert_eq!(entries.len(), 10);
}

#[test]
fn failed_rtr_aborts_both_sides() {
    install_device(DeviceConfig::new("rtr_server").fail_at(FailPoint::ModifyQp(QpState::Rtr)))
        .unwrap();
    install_device(DeviceConfig::new("rtr_client")).unwrap();

    let (server, client) = try_connect_pair(config_on("rtr_server"), config_on("rtr_client"));

    match server {
        Err(RcError::Handshake(HandshakeError::Transition { target, .. })) => {
            assert_eq!(target, QueuePairStatus::ReadyToRecv)
        }
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }
    // the client reaches RTS on its own, then finds the peer gone
    match client {
        Err(RcError::Handshake(HandshakeError::Barrier(err))) => {
            assert!(matches!(err, CMError::Exchange(..)))
        }
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }

    assert!(no_leaks(&journal("rtr_server")));
    assert!(no_leaks(&journal("rtr_client")));
    assert_eq!(journal("rtr_server").last(), Some(&Destroy(Context)));
}

/// Connect a healthy client to a server whose device rejects `point`.
fn server_fails_at(tag: &str, point: FailPoint, gid_idx: Option<u8>) -> (RcError, RcError) {
    let server_dev = format!("{}_server", tag);
    let client_dev = format!("{}_client", tag);
    install_device(DeviceConfig::new(&server_dev).fail_at(point)).unwrap();
    install_device(DeviceConfig::new(&client_dev)).unwrap();

    let server_cfg = Config {
        gid_idx,
        ..config_on(&server_dev)
    };
    let client_cfg = Config {
        gid_idx,
        ..config_on(&client_dev)
    };
    let (server, client) = try_connect_pair(server_cfg, client_cfg);

    assert!(no_leaks(&journal(&server_dev)));
    assert!(no_leaks(&journal(&client_dev)));
    (
        server.map(|_| ()).unwrap_err(),
        client.map(|_| ()).unwrap_err(),
    )
}

fn assert_peer_gone_at_barrier(err: RcError) {
    match err {
        RcError::Handshake(HandshakeError::Barrier(err)) => {
            assert!(matches!(err, CMError::Exchange(..)))
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn failed_init_names_its_target() {
    let (server, client) = server_fails_at("init", FailPoint::ModifyQp(QpState::Init), None);
    match server {
        RcError::Handshake(HandshakeError::Transition { target, .. }) => {
            assert_eq!(target, QueuePairStatus::Init)
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_peer_gone_at_barrier(client);
}

#[test]
fn failed_rts_names_its_target() {
    let (server, client) = server_fails_at("rts", FailPoint::ModifyQp(QpState::Rts), None);
    match server {
        RcError::Handshake(HandshakeError::Transition { target, .. }) => {
            assert_eq!(target, QueuePairStatus::ReadyToSend)
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_peer_gone_at_barrier(client);
}

#[test]
fn local_gid_failure_stops_before_the_exchange() {
    let (server, client) = server_fails_at("gid", FailPoint::QueryGid, Some(0));
    match server {
        RcError::Handshake(HandshakeError::LocalGid(port, index, err)) => {
            assert_eq!((port, index), (1, 0));
            assert!(matches!(err, ControlpathError::QueryError(..)));
        }
        other => panic!("unexpected {:?}", other),
    }
    // the listener never sent its record
    match client {
        RcError::Handshake(HandshakeError::Exchange(err)) => {
            assert!(matches!(err, CMError::Exchange(..)))
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn failed_pre_post_aborts_before_rtr() {
    install_device(DeviceConfig::new("recv_server")).unwrap();
    install_device(DeviceConfig::new("recv_client").fail_at(FailPoint::PostRecv)).unwrap();

    let client_cfg = Config {
        receiving_side: true,
        ..config_on("recv_client")
    };
    let (server, client) = try_connect_pair(config_on("recv_server"), client_cfg);

    match client {
        Err(RcError::Handshake(HandshakeError::PrePostRecv(err))) => {
            assert!(matches!(err, DatapathError::PostRecvError(_)))
        }
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }
    assert_peer_gone_at_barrier(server.map(|_| ()).unwrap_err());
    assert!(no_leaks(&journal("recv_client")));
}

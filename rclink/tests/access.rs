#![cfg(feature = "soft")]

//! Two queue pairs on one device, wired to each other without the OOB
//! rendezvous, to check what the remote side lets through.

use std::sync::Arc;

use rclink::consts::CQ_DEPTH;
use rclink::rdma_shim::{wc_status, AccessFlags, Gid, WorkCompletion};
use rclink::{
    AddressMode, CompletionQueue, DatapathError, MemoryRegion, ProtectionDomain, QueuePair,
    QueuePairBuilder, QueuePairStatus, UDriver,
};

const BUF_SIZE: usize = 85;

struct Side {
    qp: QueuePair,
    mr: MemoryRegion,
}

fn wired_pair(remote_access: AccessFlags) -> (Side, Side) {
    let ctx = UDriver::create()
        .unwrap()
        .find(Some("soft_0"))
        .unwrap()
        .open_context()
        .unwrap();
    let lid = ctx.get_port_attr(1).unwrap().lid;
    let pd = ProtectionDomain::new(&ctx).unwrap();

    let make = |access| {
        let cq = Arc::new(CompletionQueue::create(&ctx, CQ_DEPTH).unwrap());
        let qp = QueuePairBuilder::new(&pd).build_rc(&cq, &cq).unwrap();
        let mr = MemoryRegion::new(&pd, BUF_SIZE, access).unwrap();
        Side { qp, mr }
    };
    let a = make(MemoryRegion::default_access());
    let b = make(remote_access);

    for (local, remote) in [(&a, &b), (&b, &a)] {
        local.qp.modify_to_init().unwrap();
        local
            .qp
            .modify_to_rtr(remote.qp.qp_num(), lid, Gid::zeroed(), AddressMode::Local)
            .unwrap();
        local.qp.modify_to_rts().unwrap();
    }
    (a, b)
}

fn wait_send(qp: &QueuePair) -> Result<(), DatapathError> {
    let mut wcs = [WorkCompletion::default(); 1];
    for _ in 0..1_000_000 {
        if let Some(wc) = qp.poll_send_cq(&mut wcs)?.first() {
            if wc.is_success() {
                return Ok(());
            }
            return Err(DatapathError::CompletionError {
                status: wc.status,
                vendor_err: wc.vendor_err,
                wr_id: wc.wr_id,
            });
        }
    }
    Err(DatapathError::TimeoutError(Default::default()))
}

#[test]
fn in_bounds_write_succeeds() {
    let (a, b) = wired_pair(MemoryRegion::default_access());

    a.mr.write_message("within bounds").unwrap();
    a.qp.post_send_write(
        &a.mr,
        0..BUF_SIZE as u64,
        true,
        b.mr.get_virt_addr(),
        b.mr.rkey().0,
        7,
    )
    .unwrap();
    wait_send(&a.qp).unwrap();
    assert_eq!(b.mr.read_message(), "within bounds");
}

#[test]
fn write_past_remote_buffer_is_a_remote_access_error() {
    let (a, b) = wired_pair(MemoryRegion::default_access());

    a.qp.post_send_write(
        &a.mr,
        0..BUF_SIZE as u64,
        true,
        b.mr.get_virt_addr() + 40,
        b.mr.rkey().0,
        7,
    )
    .unwrap();
    match wait_send(&a.qp) {
        Err(DatapathError::CompletionError { status, wr_id, .. }) => {
            assert_eq!(status, wc_status::REM_ACCESS_ERR);
            assert_eq!(wr_id, 7);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(a.qp.status().unwrap(), QueuePairStatus::Error);
}

#[test]
fn read_without_remote_read_access_is_rejected() {
    let (a, b) = wired_pair(AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE);

    a.qp.post_send_read(
        &a.mr,
        0..BUF_SIZE as u64,
        true,
        b.mr.get_virt_addr(),
        b.mr.rkey().0,
        0,
    )
    .unwrap();
    assert!(matches!(
        wait_send(&a.qp),
        Err(DatapathError::CompletionError { status, .. }) if status == wc_status::REM_ACCESS_ERR
    ));
}

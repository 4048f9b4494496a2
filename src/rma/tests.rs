//! End-to-end engine tests over the loopback transport.

use std::sync::{Arc, Mutex};

use crate::lo::Loopback;
use crate::rma::arena::ReqToken;
use crate::rma::transport::{AmToken, MqContext};
use crate::rma::wire::{AmArgs, AmFlags};
use crate::utils::lock;
use crate::{
    Cntr, Cq, CqFlags, Domain, Endpoint, EndpointConfig, LocalSlice, OpFlags, PeerAddr,
    Permission, RmaError, RmaMem, RmaMsg, TriggerCond, TriggerRegistry, TriggeredOp, Tunables,
};

struct Fabric {
    lo: Arc<Loopback>,
    initiator: Arc<Domain>,
    target: Arc<Domain>,
}

const INITIATOR: u64 = 1;
const TARGET: u64 = 2;

fn fabric(tunables: Tunables) -> Fabric {
    let lo = Loopback::new();
    let initiator = Domain::new(INITIATOR, tunables.clone(), lo.port(INITIATOR));
    let target = Domain::new(TARGET, tunables, lo.port(TARGET));
    lo.attach(&initiator);
    lo.attach(&target);
    Fabric {
        lo,
        initiator,
        target,
    }
}

struct TestEp {
    ep: Arc<Endpoint>,
    send_cq: Arc<Cq>,
    recv_cq: Arc<Cq>,
    write_cntr: Arc<Cntr>,
    read_cntr: Arc<Cntr>,
    remote_write_cntr: Arc<Cntr>,
    remote_read_cntr: Arc<Cntr>,
}

fn bind_ep(domain: &Arc<Domain>, vl: u8) -> TestEp {
    let send_cq = Cq::new(Cq::DEFAULT_CQ_DEPTH);
    let recv_cq = Cq::new(Cq::DEFAULT_CQ_DEPTH);
    let write_cntr = Cntr::new();
    let read_cntr = Cntr::new();
    let remote_write_cntr = Cntr::new();
    let remote_read_cntr = Cntr::new();
    let ep = Endpoint::new(
        domain,
        vl,
        EndpointConfig {
            send_cq: Some(send_cq.clone()),
            recv_cq: Some(recv_cq.clone()),
            write_cntr: Some(write_cntr.clone()),
            read_cntr: Some(read_cntr.clone()),
            remote_write_cntr: Some(remote_write_cntr.clone()),
            remote_read_cntr: Some(remote_read_cntr.clone()),
            ..Default::default()
        },
    )
    .unwrap();
    TestEp {
        ep,
        send_cq,
        recv_cq,
        write_cntr,
        read_cntr,
        remote_write_cntr,
        remote_read_cntr,
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn target_addr() -> PeerAddr {
    PeerAddr {
        epid: TARGET,
        vl: 0,
    }
}

#[test]
fn test_short_write() {
    let f = fabric(Tunables::default());
    let tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);
    let window = RmaMem::new(4096);
    f.target
        .register_mr(7, 0x1000, Permission::default(), &window, None);

    let data = pattern(64);
    let buf = RmaMem::with_content(&data);
    iep.ep
        .write(LocalSlice::whole(&buf), target_addr(), 0x1040, 7, 0xc0ffee)
        .unwrap();
    f.lo.poll().unwrap();

    assert_eq!(&window.to_vec()[0x40..0x40 + 64], &data[..]);
    let ev = iep.send_cq.poll().unwrap();
    assert_eq!(ev.flags, CqFlags::WRITE | CqFlags::RMA);
    assert_eq!(ev.context, 0xc0ffee);
    assert_eq!(ev.len, 64);
    assert_eq!(ev.error, None);
    assert!(iep.send_cq.poll().is_none());
    assert_eq!(iep.write_cntr.value(), 1);
    assert_eq!(tep.remote_write_cntr.value(), 1);

    let stats = f.lo.stats();
    assert_eq!(stats.am_requests, 1);
    assert_eq!(stats.am_replies, 1);
    assert_eq!(stats.mq_sends, 0);
}

#[test]
fn test_fragmented_write() {
    let tunables = Tunables {
        tagged_rma: false,
        ..Default::default()
    };
    let f = fabric(tunables);
    let _tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);
    let window = RmaMem::new(4096);
    f.target
        .register_mr(3, 0, Permission::default(), &window, None);

    let data = pattern(3000);
    let buf = RmaMem::with_content(&data);
    iep.ep
        .write(LocalSlice::whole(&buf), target_addr(), 0, 3, 5)
        .unwrap();
    f.lo.poll().unwrap();

    // 1024 + 1024 + 952, only the last fragment terminal.
    let stats = f.lo.stats();
    assert_eq!(stats.am_requests, 3);
    assert_eq!(stats.am_replies, 1);
    assert_eq!(stats.mq_sends, 0);

    assert_eq!(&window.to_vec()[..3000], &data[..]);
    assert_eq!(iep.send_cq.len(), 1);
    let ev = iep.send_cq.poll().unwrap();
    assert_eq!(ev.len, 3000);
    assert_eq!(iep.write_cntr.value(), 1);
}

#[test]
fn test_long_write_delivery_complete() {
    let f = fabric(Tunables::default());
    let tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);
    let window = RmaMem::new(1 << 20);
    f.target
        .register_mr(11, 0, Permission::default(), &window, None);

    let data = pattern(1 << 20);
    let buf = RmaMem::with_content(&data);
    let msg = RmaMsg {
        iov: vec![LocalSlice::whole(&buf)],
        peer: target_addr(),
        addr: 0,
        key: 11,
        context: 0xfeed,
        data: 0,
        trigger: None,
    };
    iep.ep
        .writemsg(&msg, OpFlags::DELIVERY_COMPLETE)
        .unwrap();

    // The announcement lands and the target parks the request; nothing
    // completes before the pump runs.
    f.lo.poll().unwrap();
    assert!(iep.send_cq.is_empty());

    f.target.progress().unwrap();
    f.lo.poll().unwrap();

    assert_eq!(window.to_vec(), data);
    let ev = iep.send_cq.poll().unwrap();
    assert_eq!(ev.context, 0xfeed);
    assert_eq!(ev.len, 1 << 20);
    assert_eq!(ev.error, None);
    assert!(iep.send_cq.poll().is_none());
    assert_eq!(iep.write_cntr.value(), 1);
    assert_eq!(tep.remote_write_cntr.value(), 1);

    let stats = f.lo.stats();
    // One announcement plus the ack.
    assert_eq!(stats.am_requests, 2);
    assert_eq!(stats.mq_sends, 1);
    assert_eq!(stats.mq_recvs, 1);
}

#[test]
fn test_long_write_mirror_ack_is_stale() {
    let f = fabric(Tunables::default());
    let _tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);
    let window = RmaMem::new(8192);
    f.target
        .register_mr(4, 0, Permission::default(), &window, None);

    let head = pattern(100);
    let tail = pattern(5000);
    let iov = [
        LocalSlice::whole(&RmaMem::with_content(&head)),
        LocalSlice::whole(&RmaMem::with_content(&tail)),
    ];
    iep.ep
        .writev(&iov, target_addr(), 0, 4, 1)
        .unwrap();

    f.lo.poll().unwrap();
    f.target.progress().unwrap();
    // Delivers the MQ completions (completing the initiator) and then the
    // mirror ack, which must find the request gone and change nothing.
    f.lo.poll().unwrap();

    assert_eq!(&window.to_vec()[..100], &head[..]);
    assert_eq!(&window.to_vec()[100..5100], &tail[..]);
    assert_eq!(iep.send_cq.len(), 1);
    let ev = iep.send_cq.poll().unwrap();
    assert_eq!(ev.len, 5100);
    assert_eq!(iep.write_cntr.value(), 1);
}

#[test]
fn test_long_write_bad_key_completes_with_error() {
    let f = fabric(Tunables::default());
    let _tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);

    let buf = RmaMem::new(5000);
    let msg = RmaMsg {
        iov: vec![LocalSlice::whole(&buf)],
        peer: target_addr(),
        addr: 0,
        key: 999,
        context: 2,
        data: 0,
        trigger: None,
    };
    iep.ep
        .writemsg(&msg, OpFlags::DELIVERY_COMPLETE)
        .unwrap();
    f.lo.poll().unwrap();

    let ev = iep.send_cq.poll().unwrap();
    assert_eq!(ev.error, Some(RmaError::Inval));
    assert_eq!(iep.write_cntr.value(), 1);
}

#[test]
fn test_short_read() {
    let f = fabric(Tunables::default());
    let tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);
    let src = pattern(512);
    let window = RmaMem::with_content(&src);
    f.target
        .register_mr(9, 0x100, Permission::default(), &window, None);

    let buf = RmaMem::new(512);
    iep.ep
        .read(LocalSlice::whole(&buf), target_addr(), 0x100, 9, 77)
        .unwrap();
    f.lo.poll().unwrap();

    assert_eq!(buf.to_vec(), src);
    let ev = iep.send_cq.poll().unwrap();
    assert_eq!(ev.flags, CqFlags::READ | CqFlags::RMA);
    assert_eq!(ev.context, 77);
    assert_eq!(ev.len, 512);
    assert_eq!(ev.olen, 0);
    assert_eq!(iep.read_cntr.value(), 1);
    assert_eq!(tep.remote_read_cntr.value(), 1);
}

#[test]
fn test_read_bad_key() {
    let f = fabric(Tunables::default());
    let tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);

    let buf = RmaMem::new(64);
    iep.ep
        .read(LocalSlice::whole(&buf), target_addr(), 0, 999, 5)
        .unwrap();
    f.lo.poll().unwrap();

    let ev = iep.send_cq.poll().unwrap();
    assert_eq!(ev.error, Some(RmaError::Inval));
    assert_eq!(ev.len, 0);
    assert_eq!(ev.olen, 64);
    // The refused read must leave the target-side counters untouched.
    assert_eq!(tep.remote_read_cntr.value(), 0);
    assert_eq!(tep.remote_write_cntr.value(), 0);
    assert!(buf.to_vec().iter().all(|&b| b == 0));
}

#[test]
fn test_long_read() {
    let f = fabric(Tunables::default());
    let tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);
    let src = pattern(100_000);
    let window = RmaMem::with_content(&src);
    f.target
        .register_mr(5, 0, Permission::default(), &window, None);

    let buf = RmaMem::new(100_000);
    iep.ep
        .read(LocalSlice::whole(&buf), target_addr(), 0, 5, 0)
        .unwrap();
    f.lo.poll().unwrap();
    f.target.progress().unwrap();
    f.lo.poll().unwrap();

    assert_eq!(buf.to_vec(), src);
    let ev = iep.send_cq.poll().unwrap();
    assert_eq!(ev.len, 100_000);
    assert_eq!(iep.read_cntr.value(), 1);
    assert_eq!(tep.remote_read_cntr.value(), 1);

    let stats = f.lo.stats();
    assert_eq!(stats.am_requests, 1);
    assert_eq!(stats.mq_recvs, 1);
    assert_eq!(stats.mq_sends, 1);
}

#[test]
fn test_readv_split_short_long() {
    let f = fabric(Tunables::default());
    let _tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);
    let total = 256 + 256 + 32768;
    let src = pattern(total);
    let window = RmaMem::with_content(&src);
    f.target
        .register_mr(6, 0, Permission::default(), &window, None);

    let a = RmaMem::new(256);
    let b = RmaMem::new(256);
    let c = RmaMem::new(32768);
    let iov = [
        LocalSlice::whole(&a),
        LocalSlice::whole(&b),
        LocalSlice::whole(&c),
    ];
    iep.ep.readv(&iov, target_addr(), 0, 6, 8).unwrap();

    // Short replies land first; the request must stay open on 512 of
    // 33280 bytes.
    f.lo.poll().unwrap();
    assert!(iep.send_cq.is_empty());

    f.target.progress().unwrap();
    f.lo.poll().unwrap();

    assert_eq!(a.to_vec(), &src[..256]);
    assert_eq!(b.to_vec(), &src[256..512]);
    assert_eq!(c.to_vec(), &src[512..]);
    let ev = iep.send_cq.poll().unwrap();
    assert_eq!(ev.len, total);
    assert_eq!(ev.olen, 0);
    assert!(iep.send_cq.poll().is_none());
    assert_eq!(iep.read_cntr.value(), 1);
}

#[test]
fn test_readv_long_fill_before_short_reply() {
    // Drive the two terminal signals by hand, long fill first, to pin the
    // either-order completion rule.
    let f = fabric(Tunables::default());
    let _tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);
    let window = RmaMem::new(40_000);
    f.target
        .register_mr(6, 0, Permission::default(), &window, None);

    let a = RmaMem::new(512);
    let c = RmaMem::new(32768);
    let iov = [LocalSlice::whole(&a), LocalSlice::whole(&c)];
    iep.ep.readv(&iov, target_addr(), 0, 6, 8).unwrap();

    // First request allocated on a fresh domain: slot 0, generation 1.
    let token = ReqToken::from_wire(1 << 32);

    // The MQ fill alone must not complete the request.
    f.initiator
        .mq_complete(MqContext::new(token), 32768)
        .unwrap();
    assert!(iep.send_cq.is_empty());

    // The trailing short reply (no EOM when a long tail exists) brings
    // the accumulated length to the total and completes.
    let payload = pattern(512);
    let rep = AmArgs::read_rep(AmFlags::EMPTY, None, token.to_wire(), 0);
    f.initiator
        .handle_am(&AmToken { peer: TARGET }, &rep, &payload)
        .unwrap();

    assert_eq!(a.to_vec(), payload);
    let ev = iep.send_cq.poll().unwrap();
    assert_eq!(ev.len, 512 + 32768);
    assert!(iep.send_cq.poll().is_none());
}

#[test]
fn test_self_path_write_with_data() {
    let lo = Loopback::new();
    let domain = Domain::new(INITIATOR, Tunables::default(), lo.port(INITIATOR));
    lo.attach(&domain);
    let iep = bind_ep(&domain, 0);
    let tep = bind_ep(&domain, 1);
    let window = RmaMem::new(1024);
    domain.register_mr(2, 0, Permission::default(), &window, None);

    let data = pattern(128);
    let buf = RmaMem::with_content(&data);
    iep.ep
        .writedata(
            LocalSlice::whole(&buf),
            0xdead_beef,
            PeerAddr {
                epid: INITIATOR,
                vl: 1,
            },
            0,
            2,
            42,
        )
        .unwrap();

    // No wire traffic at all.
    assert_eq!(lo.stats(), Default::default());

    assert_eq!(&window.to_vec()[..128], &data[..]);
    let rev = tep.recv_cq.poll().unwrap();
    assert_eq!(rev.data, 0xdead_beef);
    assert!(rev
        .flags
        .contains(CqFlags::REMOTE_WRITE | CqFlags::RMA | CqFlags::REMOTE_CQ_DATA));
    assert_eq!(tep.remote_write_cntr.value(), 1);

    let sev = iep.send_cq.poll().unwrap();
    assert_eq!(sev.flags, CqFlags::WRITE | CqFlags::RMA);
    assert_eq!(sev.context, 42);
    assert_eq!(iep.write_cntr.value(), 1);
}

#[test]
fn test_self_path_readv() {
    let lo = Loopback::new();
    let domain = Domain::new(INITIATOR, Tunables::default(), lo.port(INITIATOR));
    lo.attach(&domain);
    let iep = bind_ep(&domain, 0);
    let tep = bind_ep(&domain, 1);
    let src = pattern(300);
    let window = RmaMem::with_content(&src);
    domain.register_mr(2, 0, Permission::default(), &window, None);

    let a = RmaMem::new(100);
    let b = RmaMem::new(200);
    let iov = [LocalSlice::whole(&a), LocalSlice::whole(&b)];
    iep.ep
        .readv(
            &iov,
            PeerAddr {
                epid: INITIATOR,
                vl: 1,
            },
            0,
            2,
            0,
        )
        .unwrap();

    assert_eq!(a.to_vec(), &src[..100]);
    assert_eq!(b.to_vec(), &src[100..]);
    assert_eq!(iep.read_cntr.value(), 1);
    assert_eq!(tep.remote_read_cntr.value(), 1);
    assert!(iep.send_cq.poll().is_some());
}

#[test]
fn test_write_then_read_roundtrip() {
    let f = fabric(Tunables::default());
    let _tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);
    let window = RmaMem::new(1024);
    f.target
        .register_mr(1, 0, Permission::default(), &window, None);

    let data = pattern(600);
    let out = RmaMem::with_content(&data);
    iep.ep
        .write(LocalSlice::whole(&out), target_addr(), 0, 1, 0)
        .unwrap();
    f.lo.poll().unwrap();

    let back = RmaMem::new(600);
    iep.ep
        .read(LocalSlice::whole(&back), target_addr(), 0, 1, 0)
        .unwrap();
    f.lo.poll().unwrap();

    assert_eq!(back.to_vec(), data);
}

#[test]
fn test_progress_is_idempotent() {
    let f = fabric(Tunables::default());
    let tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);
    let window = RmaMem::new(4096);
    f.target
        .register_mr(7, 0, Permission::default(), &window, None);

    let buf = RmaMem::with_content(&pattern(64));
    iep.ep
        .write(LocalSlice::whole(&buf), target_addr(), 0, 7, 0)
        .unwrap();
    f.lo.poll().unwrap();
    assert_eq!(iep.send_cq.len(), 1);

    // Idle polls produce no further events and no state change.
    for _ in 0..3 {
        f.lo.poll().unwrap();
        f.initiator.progress().unwrap();
        f.target.progress().unwrap();
    }
    assert_eq!(iep.send_cq.len(), 1);
    assert_eq!(iep.write_cntr.value(), 1);
    assert_eq!(tep.remote_write_cntr.value(), 1);
}

#[test]
fn test_inject() {
    let f = fabric(Tunables::default());
    let _tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);
    let window = RmaMem::new(256);
    f.target
        .register_mr(8, 0, Permission::default(), &window, None);

    let buf = RmaMem::with_content(&[0xaa; 32]);
    iep.ep
        .inject(LocalSlice::whole(&buf), target_addr(), 0, 8)
        .unwrap();
    // The caller may clobber its buffer right away.
    buf.write_at(0, &[0x55; 32]).unwrap();
    f.lo.poll().unwrap();

    assert_eq!(&window.to_vec()[..32], &[0xaa; 32]);
    // Inject never posts a send event but still counts.
    assert!(iep.send_cq.is_empty());
    assert_eq!(iep.write_cntr.value(), 1);
}

#[test]
fn test_inject_over_limit() {
    let f = fabric(Tunables::default());
    let _tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);

    let buf = RmaMem::new(65);
    assert_eq!(
        iep.ep.inject(LocalSlice::whole(&buf), target_addr(), 0, 8),
        Err(RmaError::Msgsize)
    );
    assert_eq!(f.lo.stats(), Default::default());
}

#[test]
fn test_writev_packs_single_packet() {
    let f = fabric(Tunables::default());
    let _tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);
    let window = RmaMem::new(64);
    f.target
        .register_mr(2, 0, Permission::default(), &window, None);

    let iov = [
        LocalSlice::whole(&RmaMem::with_content(b"one")),
        LocalSlice::whole(&RmaMem::with_content(b"-two-")),
        LocalSlice::whole(&RmaMem::with_content(b"three")),
    ];
    iep.ep.writev(&iov, target_addr(), 0, 2, 0).unwrap();
    f.lo.poll().unwrap();

    assert_eq!(f.lo.stats().am_requests, 1);
    assert_eq!(&window.to_vec()[..13], b"one-two-three");
    assert_eq!(iep.send_cq.len(), 1);
}

#[test]
fn test_writev_inject_multi_fragment() {
    let f = fabric(Tunables::default());
    let _tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);

    let msg = RmaMsg {
        iov: vec![
            LocalSlice::whole(&RmaMem::new(1000)),
            LocalSlice::whole(&RmaMem::new(1000)),
        ],
        peer: target_addr(),
        addr: 0,
        key: 2,
        context: 0,
        data: 0,
        trigger: None,
    };
    assert_eq!(
        iep.ep.writemsg(&msg, OpFlags::INJECT),
        Err(RmaError::Msgsize)
    );
    assert_eq!(f.lo.stats(), Default::default());
}

#[test]
fn test_selective_completion() {
    let f = fabric(Tunables::default());
    let _tep = bind_ep(&f.target, 0);
    let window = RmaMem::new(256);
    f.target
        .register_mr(2, 0, Permission::default(), &window, None);

    let send_cq = Cq::new(16);
    let ep = Endpoint::new(
        &f.initiator,
        0,
        EndpointConfig {
            send_cq: Some(send_cq.clone()),
            send_selective_completion: true,
            ..Default::default()
        },
    )
    .unwrap();

    let buf = RmaMem::with_content(&pattern(32));
    let msg = RmaMsg {
        iov: vec![LocalSlice::whole(&buf)],
        peer: target_addr(),
        addr: 0,
        key: 2,
        context: 0,
        data: 0,
        trigger: None,
    };

    ep.writemsg(&msg, OpFlags::EMPTY).unwrap();
    f.lo.poll().unwrap();
    assert!(send_cq.is_empty());

    ep.writemsg(&msg, OpFlags::COMPLETION).unwrap();
    f.lo.poll().unwrap();
    assert_eq!(send_cq.len(), 1);
}

#[test]
fn test_mr_counter_distinct_from_ep() {
    let f = fabric(Tunables::default());
    let tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);
    let window = RmaMem::new(256);
    let mr_cntr = Cntr::new();
    f.target
        .register_mr(2, 0, Permission::default(), &window, Some(mr_cntr.clone()));

    let buf = RmaMem::with_content(&pattern(16));
    iep.ep
        .write(LocalSlice::whole(&buf), target_addr(), 0, 2, 0)
        .unwrap();
    f.lo.poll().unwrap();

    assert_eq!(tep.remote_write_cntr.value(), 1);
    assert_eq!(mr_cntr.value(), 1);
}

#[test]
fn test_mr_counter_shared_with_ep() {
    let f = fabric(Tunables::default());
    let shared = Cntr::new();
    let window = RmaMem::new(256);
    f.target
        .register_mr(2, 0, Permission::default(), &window, Some(shared.clone()));
    let _tep = Endpoint::new(
        &f.target,
        0,
        EndpointConfig {
            remote_write_cntr: Some(shared.clone()),
            ..Default::default()
        },
    )
    .unwrap();
    let iep = bind_ep(&f.initiator, 0);

    let buf = RmaMem::with_content(&pattern(16));
    iep.ep
        .write(LocalSlice::whole(&buf), target_addr(), 0, 2, 0)
        .unwrap();
    f.lo.poll().unwrap();

    // One increment, not two, when the MR and the EP share a counter.
    assert_eq!(shared.value(), 1);
}

#[test]
fn test_stale_reply_token_dropped() {
    let f = fabric(Tunables::default());
    let _iep = bind_ep(&f.initiator, 0);

    let rep = AmArgs::write_rep(AmFlags::EOM, None, 0);
    assert!(f
        .initiator
        .handle_am(&AmToken { peer: TARGET }, &rep, &[])
        .is_ok());
}

#[test]
fn test_write_access_violation() {
    let f = fabric(Tunables::default());
    let _tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);
    let window = RmaMem::with_content(&pattern(128));
    // Read-only window refuses writes.
    f.target
        .register_mr(2, 0, Permission::REMOTE_READ, &window, None);

    let buf = RmaMem::with_content(&[7; 32]);
    iep.ep
        .write(LocalSlice::whole(&buf), target_addr(), 0, 2, 0)
        .unwrap();
    f.lo.poll().unwrap();

    let ev = iep.send_cq.poll().unwrap();
    assert_eq!(ev.error, Some(RmaError::Inval));
    // The window is untouched.
    assert_eq!(window.to_vec(), pattern(128));
}

#[derive(Default)]
struct CapturingRegistry {
    ops: Mutex<Vec<TriggeredOp>>,
}

impl TriggerRegistry for CapturingRegistry {
    fn register(&self, _cond: TriggerCond, op: TriggeredOp) {
        lock(&self.ops).push(op);
    }
}

#[test]
fn test_triggered_write_deferred() {
    let f = fabric(Tunables::default());
    let _tep = bind_ep(&f.target, 0);
    let iep = bind_ep(&f.initiator, 0);
    let window = RmaMem::new(256);
    f.target
        .register_mr(2, 0, Permission::default(), &window, None);

    let registry = Arc::new(CapturingRegistry::default());
    f.initiator.set_trigger_registry(registry.clone());

    let buf = RmaMem::with_content(&pattern(32));
    let msg = RmaMsg {
        iov: vec![LocalSlice::whole(&buf)],
        peer: target_addr(),
        addr: 0,
        key: 2,
        context: 0,
        data: 0,
        trigger: Some(TriggerCond {
            cntr: Cntr::new(),
            threshold: 1,
        }),
    };
    iep.ep.writemsg(&msg, OpFlags::TRIGGER).unwrap();

    // Captured, not executed.
    assert_eq!(f.lo.stats(), Default::default());
    let op = lock(&registry.ops).pop().unwrap();
    assert!(lock(&registry.ops).is_empty());

    // Firing the captured operation runs it as a normal write.
    op.submit().unwrap();
    f.lo.poll().unwrap();
    assert_eq!(&window.to_vec()[..32], &pattern(32)[..]);
    assert_eq!(iep.send_cq.len(), 1);
}

#[test]
fn test_trigger_without_condition() {
    let f = fabric(Tunables::default());
    let iep = bind_ep(&f.initiator, 0);
    let registry = Arc::new(CapturingRegistry::default());
    f.initiator.set_trigger_registry(registry);

    let msg = RmaMsg {
        iov: vec![LocalSlice::whole(&RmaMem::new(8))],
        peer: target_addr(),
        addr: 0,
        key: 2,
        context: 0,
        data: 0,
        trigger: None,
    };
    assert_eq!(
        iep.ep.writemsg(&msg, OpFlags::TRIGGER),
        Err(RmaError::Inval)
    );
}

#[test]
fn test_cq_overflow_is_handler_error() {
    let f = fabric(Tunables::default());
    let _tep = bind_ep(&f.target, 0);
    let window = RmaMem::new(64);
    f.target
        .register_mr(2, 0, Permission::default(), &window, None);

    let send_cq = Cq::new(0);
    let write_cntr = Cntr::new();
    let ep = Endpoint::new(
        &f.initiator,
        0,
        EndpointConfig {
            send_cq: Some(send_cq.clone()),
            write_cntr: Some(write_cntr.clone()),
            ..Default::default()
        },
    )
    .unwrap();

    let buf = RmaMem::with_content(&pattern(16));
    ep.write(LocalSlice::whole(&buf), target_addr(), 0, 2, 0)
        .unwrap();

    // The undeliverable event surfaces as a handler error, but the
    // transfer itself still happened and the counter still ticks.
    assert_eq!(f.lo.poll(), Err(RmaError::Nomem));
    assert_eq!(&window.to_vec()[..16], &pattern(16)[..]);
    assert_eq!(write_cntr.value(), 1);
}

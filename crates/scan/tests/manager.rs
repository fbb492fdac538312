mod common;

use std::sync::atomic::Ordering;

use common::*;
use lattice_proto::{decode_stream, ResultCode};
use lattice_scan::{start_scan, JobStatus, ScanConfig, ScanError, ScanManager};

fn throttled_msg(trid: u64, pid: u16, rps: u32) -> lattice_proto::ScanMessage {
    let mut msg = scan_msg("prod", trid);
    with_pids(&mut msg, &[pid]);
    with_rps(&mut msg, rps);
    msg
}

#[tokio::test]
async fn abort_is_idempotent() {
    let node = build_node(0);
    populate(&node.store, 50, 200, 0);

    let manager = ScanManager::new(ScanConfig::default());
    let (mut channel, reader) = channel_pair(false);
    let msg = throttled_msg(110, 50, 50);

    start_scan(&node.env, &manager, &msg, &mut channel).await.expect("admitted");
    assert!(manager.abort_job(110));
    assert!(manager.abort_job(110));
    assert!(!manager.abort_job(999));

    let stat = wait_done(&manager, 110).await;
    assert_eq!(stat.result_code, ResultCode::UserAbort.as_u8());
    // Two aborts still count as one.
    assert_eq!(node.ns.stats().scan_basic_abort.load(Ordering::Acquire), 1);

    let frames = decode_stream(&reader.await.unwrap()).unwrap();
    let (_, fin) = split_stream(frames);
    assert_eq!(fin, ResultCode::UserAbort);
}

#[tokio::test]
async fn admission_enforces_trid_uniqueness_and_the_job_cap() {
    let node = build_node(0);
    populate(&node.store, 51, 200, 0);
    populate(&node.store, 52, 200, 0);

    let manager =
        ScanManager::new(ScanConfig { threads: 2, active_cap: 1, finished_cap: 10 });

    let (mut channel, _reader) = channel_pair(false);
    start_scan(&node.env, &manager, &throttled_msg(120, 51, 20), &mut channel)
        .await
        .expect("admitted");

    let (mut channel, _reader) = channel_pair(false);
    let err = start_scan(&node.env, &manager, &throttled_msg(120, 52, 20), &mut channel)
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::Parameter(_)));
    assert!(channel.has_stream());

    let (mut channel, _reader) = channel_pair(false);
    let err = start_scan(&node.env, &manager, &throttled_msg(121, 52, 20), &mut channel)
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::JobLimit));
    assert!(channel.has_stream());

    // Retiring the active job frees its admission slot.
    assert!(manager.abort_job(120));
    wait_done(&manager, 120).await;

    let (mut channel, _reader) = channel_pair(false);
    start_scan(&node.env, &manager, &throttled_msg(122, 52, 0), &mut channel)
        .await
        .expect("admitted after slot freed");
    wait_done(&manager, 122).await;
}

#[tokio::test]
async fn abort_all_cancels_every_active_job() {
    let node = build_node(0);
    populate(&node.store, 53, 200, 0);
    populate(&node.store, 54, 200, 0);

    let manager = ScanManager::new(ScanConfig::default());
    let (mut channel_a, _ra) = channel_pair(false);
    let (mut channel_b, _rb) = channel_pair(false);
    start_scan(&node.env, &manager, &throttled_msg(130, 53, 20), &mut channel_a)
        .await
        .expect("admitted");
    start_scan(&node.env, &manager, &throttled_msg(131, 54, 20), &mut channel_b)
        .await
        .expect("admitted");

    assert_eq!(manager.abort_all(), 2);
    let a = wait_done(&manager, 130).await;
    let b = wait_done(&manager, 131).await;
    assert_eq!(a.result_code, ResultCode::UserAbort.as_u8());
    assert_eq!(b.result_code, ResultCode::UserAbort.as_u8());
}

#[tokio::test]
async fn finished_ring_is_bounded() {
    let node = build_node(0);
    let manager =
        ScanManager::new(ScanConfig { threads: 2, active_cap: 100, finished_cap: 2 });

    for trid in [140u64, 141, 142] {
        let (mut channel, _reader) = channel_pair(false);
        let mut msg = scan_msg("prod", trid);
        with_pids(&mut msg, &[]);
        start_scan(&node.env, &manager, &msg, &mut channel).await.expect("admitted");
        wait_done(&manager, trid).await;
    }

    manager.limit_finished_jobs();
    assert!(manager.get_job_info(140).is_none());
    assert!(manager.get_job_info(141).is_some());
    assert!(manager.get_job_info(142).is_some());
    assert!(manager.get_info().len() <= 2);
}

#[tokio::test]
async fn monitoring_lists_active_jobs_and_serializes() {
    let node = build_node(0);
    populate(&node.store, 55, 200, 0);

    let manager = ScanManager::new(ScanConfig::default());
    let (mut channel, _reader) = channel_pair(false);
    start_scan(&node.env, &manager, &throttled_msg(150, 55, 20), &mut channel)
        .await
        .expect("admitted");

    let stat = manager.get_job_info(150).expect("job is live");
    assert_eq!(stat.status, JobStatus::Active);
    assert_eq!(stat.namespace, "prod");
    assert!(manager.get_info().iter().any(|s| s.trid == 150));

    manager.abort_job(150);
    let stat = wait_done(&manager, 150).await;

    let json = serde_json::to_value(&stat).unwrap();
    assert_eq!(json["kind"], "basic");
    assert_eq!(json["status"], "done");
    assert_eq!(json["trid"], 150);
    assert_eq!(json["result_code"], ResultCode::UserAbort.as_u8() as i64);
}

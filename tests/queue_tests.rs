use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use dispatchq::job::print::JobFields;
use dispatchq::job::{JobEventKind, JobStatus};
use dispatchq::protocol::{CommandArguments, RequestContext};
use dispatchq::{Queue, QueueConfig, QueueError};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 1, 10, 0, 0).unwrap()
}

fn at(seconds: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(seconds)
}

fn submit_args(input: &str) -> CommandArguments {
    let mut args = CommandArguments::default();
    args.input = input.to_string();
    args.ip = "10.2.3.4".to_string();
    args.sid = "test-session".to_string();
    args
}

#[test]
fn test_submit_dispatch_complete_read_lifecycle() {
    init_tracing();
    let mut queue = Queue::new("main", QueueConfig::new());

    let submitted = queue.submit(&submit_args("run me"), t0()).unwrap();
    assert!(submitted.job_key.starts_with("J_1_"));
    {
        let job = queue.job(submitted.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.event_count(), 1);
        assert_eq!(job.events()[0].kind, JobEventKind::Submit);
        assert_eq!(job.events()[0].client_node, "10.2.3.4");
    }

    let dispatched = queue.get_job_for_execution(0x0a000005, "w1", at(1)).unwrap();
    assert_eq!(dispatched.job_id, submitted.job_id);
    assert_eq!(dispatched.input, "run me");
    {
        let job = queue.job(submitted.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.run_count, 1);
    }

    queue
        .put_result(
            dispatched.job_id,
            &dispatched.auth_token,
            0,
            "all done".to_string(),
            at(2),
        )
        .unwrap();
    assert_eq!(queue.job(submitted.job_id).unwrap().status, JobStatus::Done);

    let readable = queue.get_job_for_reading(0x0a000006, "r1", at(3)).unwrap();
    assert_eq!(readable.output, "all done");
    assert_eq!(
        queue.job(submitted.job_id).unwrap().status,
        JobStatus::Reading
    );

    queue
        .confirm_read(readable.job_id, &readable.auth_token, at(4))
        .unwrap();
    let job = queue.job(submitted.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Confirmed);
    assert_eq!(job.read_count, 1);
    assert_eq!(job.event_count(), 5);
}

#[test]
fn test_dispatch_order_is_oldest_first() {
    let mut queue = Queue::new("main", QueueConfig::new());
    let first = queue.submit(&submit_args("a"), t0()).unwrap();
    let _second = queue.submit(&submit_args("b"), at(1)).unwrap();

    let dispatched = queue.get_job_for_execution(0, "w", at(2)).unwrap();
    assert_eq!(dispatched.job_id, first.job_id);
}

#[test]
fn test_stale_and_foreign_tokens_rejected() {
    let mut queue = Queue::new("main", QueueConfig::new());
    let submitted = queue.submit(&submit_args("x"), t0()).unwrap();
    let stale_token = submitted.auth_token.clone();

    let dispatched = queue.get_job_for_execution(0, "w", at(1)).unwrap();

    // The submit-time token no longer matches after the dispatch event.
    let err = queue
        .put_result(dispatched.job_id, &stale_token, 0, String::new(), at(2))
        .unwrap_err();
    match err {
        QueueError::InvalidParameter { field, message } => {
            assert_eq!(field, "auth_token");
            assert!(message.contains("stale"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let err = queue
        .put_result(dispatched.job_id, "1_2", 0, String::new(), at(2))
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidParameter { .. }));

    // The issued token still works.
    queue
        .put_result(
            dispatched.job_id,
            &dispatched.auth_token,
            0,
            String::new(),
            at(2),
        )
        .unwrap();
}

#[test]
fn test_return_requeues_job() {
    let mut queue = Queue::new("main", QueueConfig::new());
    let submitted = queue.submit(&submit_args("x"), t0()).unwrap();
    let dispatched = queue.get_job_for_execution(0, "w", at(1)).unwrap();

    queue
        .return_job(dispatched.job_id, &dispatched.auth_token, true, at(2))
        .unwrap();
    let job = queue.job(submitted.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.last_event().unwrap().kind, JobEventKind::Return);

    // And it can be picked up again.
    assert!(queue.get_job_for_execution(0, "w2", at(3)).is_some());
}

#[test]
fn test_fail_retry_policy() {
    let config = QueueConfig::new().with_failed_retries(1);
    let mut queue = Queue::new("main", config);
    let submitted = queue.submit(&submit_args("x"), t0()).unwrap();

    let d1 = queue.get_job_for_execution(0, "w", at(1)).unwrap();
    let is_final = queue
        .fail_job(d1.job_id, &d1.auth_token, "oom".to_string(), 137, false, at(2))
        .unwrap();
    assert!(!is_final);
    {
        let job = queue.job(submitted.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_event().unwrap().kind, JobEventKind::Fail);
        assert_eq!(job.err_msg(), "oom");
        assert_eq!(job.ret_code(), 137);
    }

    queue.reschedule_job(submitted.job_id, at(3)).unwrap();
    assert_eq!(
        queue.job(submitted.job_id).unwrap().status,
        JobStatus::Pending
    );

    let d2 = queue.get_job_for_execution(0, "w", at(4)).unwrap();
    let is_final = queue
        .fail_job(d2.job_id, &d2.auth_token, "oom again".to_string(), 137, false, at(5))
        .unwrap();
    assert!(is_final);
    assert_eq!(
        queue.job(submitted.job_id).unwrap().last_event().unwrap().kind,
        JobEventKind::FinalFail
    );

    // Permanently failed jobs cannot be rescheduled.
    assert!(queue.reschedule_job(submitted.job_id, at(6)).is_err());
}

#[test]
fn test_no_retries_fails_immediately() {
    let mut queue = Queue::new("main", QueueConfig::new());
    let _ = queue.submit(&submit_args("x"), t0()).unwrap();
    let d = queue.get_job_for_execution(0, "w", at(1)).unwrap();
    let is_final = queue
        .fail_job(d.job_id, &d.auth_token, "bad".to_string(), 1, true, at(2))
        .unwrap();
    assert!(is_final);
}

#[test]
fn test_read_fail_and_reread() {
    let config = QueueConfig::new().with_read_failed_retries(1);
    let mut queue = Queue::new("main", config);
    let submitted = queue.submit(&submit_args("x"), t0()).unwrap();
    let d = queue.get_job_for_execution(0, "w", at(1)).unwrap();
    queue
        .put_result(d.job_id, &d.auth_token, 0, "out".to_string(), at(2))
        .unwrap();

    let r = queue.get_job_for_reading(0, "r", at(3)).unwrap();
    let is_final = queue
        .fail_read(r.job_id, &r.auth_token, "reader died".to_string(), false, at(4))
        .unwrap();
    assert!(!is_final);
    assert_eq!(
        queue.job(submitted.job_id).unwrap().status,
        JobStatus::ReadFailed
    );

    queue.reread_job(submitted.job_id, at(5)).unwrap();
    let job = queue.job(submitted.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Reading);
    assert_eq!(job.read_count, 2);
}

#[test]
fn test_read_rollback_reverts_to_prior_status() {
    let mut queue = Queue::new("main", QueueConfig::new());
    let submitted = queue.submit(&submit_args("x"), t0()).unwrap();
    let d = queue.get_job_for_execution(0, "w", at(1)).unwrap();
    queue
        .put_result(d.job_id, &d.auth_token, 0, "out".to_string(), at(2))
        .unwrap();

    let r = queue.get_job_for_reading(0, "r", at(3)).unwrap();
    queue
        .rollback_read(r.job_id, &r.auth_token, at(4))
        .unwrap();
    let job = queue.job(submitted.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.last_event().unwrap().kind, JobEventKind::ReadRollback);

    // The job can be read again after the rollback.
    assert!(queue.get_job_for_reading(0, "r2", at(5)).is_some());
}

#[test]
fn test_rollback_get_uncounts_dispatch() {
    let mut queue = Queue::new("main", QueueConfig::new());
    let submitted = queue.submit(&submit_args("x"), t0()).unwrap();
    let d = queue.get_job_for_execution(0, "w", at(1)).unwrap();

    queue
        .rollback_get(d.job_id, &d.auth_token, at(2))
        .unwrap();
    let job = queue.job(submitted.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.run_count, 0);
}

#[test]
fn test_clear_resets_running_job() {
    let mut queue = Queue::new("main", QueueConfig::new());
    let submitted = queue.submit(&submit_args("x"), t0()).unwrap();
    queue.get_job_for_execution(0, "w", at(1)).unwrap();

    queue.clear_job(submitted.job_id, at(2)).unwrap();
    let job = queue.job(submitted.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.last_event().unwrap().kind, JobEventKind::Clear);

    // Terminal jobs cannot be cleared.
    let d = queue.get_job_for_execution(0, "w", at(3)).unwrap();
    queue
        .put_result(d.job_id, &d.auth_token, 0, String::new(), at(4))
        .unwrap();
    assert!(queue.clear_job(submitted.job_id, at(5)).is_err());
}

#[test]
fn test_rollback_submit_erases_job() {
    let mut queue = Queue::new("main", QueueConfig::new());
    let mut args = submit_args("x");
    args.groups = vec!["g".to_string()];
    let submitted = queue.submit(&args, t0()).unwrap();

    queue.rollback_submit(submitted.job_id).unwrap();
    assert!(queue.job(submitted.job_id).is_none());
    assert!(queue.groups().jobs("g", false).unwrap().is_empty());
}

#[test]
fn test_cancel_group() {
    let mut queue = Queue::new("main", QueueConfig::new());
    let mut ids = Vec::new();
    for i in 0..3 {
        let mut args = submit_args(&format!("job {}", i));
        args.groups = vec!["doomed".to_string()];
        ids.push(queue.submit(&args, t0()).unwrap().job_id);
    }

    assert_eq!(queue.cancel_group("doomed", at(1)).unwrap(), 3);
    for id in ids {
        assert_eq!(queue.job(id).unwrap().status, JobStatus::Canceled);
    }
    assert!(matches!(
        queue.cancel_group("unknown", at(2)),
        Err(QueueError::GroupNotFound(_))
    ));
}

#[test]
fn test_batch_submit_shares_group() {
    let mut queue = Queue::new("main", QueueConfig::new());
    let batch = vec![
        submit_args("one"),
        submit_args("two"),
        submit_args("three"),
    ];
    let ids = queue.submit_batch(&batch, "batch-group", t0()).unwrap();
    assert_eq!(ids, vec![1, 2, 3]);

    let members = queue.groups().jobs("batch-group", false).unwrap();
    assert_eq!(members.iter().collect::<Vec<u32>>(), vec![1, 2, 3]);
    for id in ids {
        let job = queue.job(id).unwrap();
        assert_eq!(job.events()[0].kind, JobEventKind::BatchSubmit);
        assert_eq!(job.status, JobStatus::Pending);
    }
}

#[test]
fn test_run_timeout_requeues() {
    let config = QueueConfig::new().with_run_timeout(Duration::seconds(10));
    let mut queue = Queue::new("main", config);
    let submitted = queue.submit(&submit_args("slow"), t0()).unwrap();
    queue.get_job_for_execution(0, "w", at(1)).unwrap();

    // Not yet expired.
    assert!(queue.check_expirations(at(5), 100).is_empty());

    let affected = queue.check_expirations(at(12), 100);
    assert_eq!(affected, vec![submitted.job_id]);
    let job = queue.job(submitted.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.last_event().unwrap().kind, JobEventKind::Timeout);
}

#[test]
fn test_read_timeout_reverts() {
    let config = QueueConfig::new().with_read_timeout(Duration::seconds(10));
    let mut queue = Queue::new("main", config);
    let submitted = queue.submit(&submit_args("x"), t0()).unwrap();
    let d = queue.get_job_for_execution(0, "w", at(1)).unwrap();
    queue
        .put_result(d.job_id, &d.auth_token, 0, "out".to_string(), at(2))
        .unwrap();
    queue.get_job_for_reading(0, "r", at(3)).unwrap();

    let affected = queue.check_expirations(at(20), 100);
    assert_eq!(affected, vec![submitted.job_id]);
    let job = queue.job(submitted.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.last_event().unwrap().kind, JobEventKind::ReadTimeout);
}

#[test]
fn test_collect_expired_vacuums_and_frees_group() {
    let config = QueueConfig::new().with_timeout(Duration::seconds(100));
    let mut queue = Queue::new("main", config);
    let mut args = submit_args("x");
    args.groups = vec!["ephemeral".to_string()];
    let submitted = queue.submit(&args, t0()).unwrap();
    queue.cancel_job(submitted.job_id, at(1)).unwrap();

    assert!(queue.collect_expired(at(50), 100).is_empty());

    let removed = queue.collect_expired(at(102), 100);
    assert_eq!(removed, vec![submitted.job_id]);
    assert!(queue.job(submitted.job_id).is_none());

    // The group lost its last job and can now be garbage collected.
    assert_eq!(queue.groups().collect_garbage(10), 1);
}

#[test]
fn test_parse_submit_print_flow() {
    let mut params: BTreeMap<String, String> = [
        ("input", "wire input"),
        ("group", "render-group"),
        ("aff", "fast-node"),
        ("port", "9555"),
        ("timeout", "120"),
        ("msk", "6"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let mut ctx = RequestContext::new(Some("192.168.1.50".parse().unwrap()), true);
    let limits = dispatchq::FieldLimits::default();
    let args = CommandArguments::parse(&mut params, &limits, &mut ctx).unwrap();

    let mut queue = Queue::new("render", QueueConfig::new()).with_endpoint("render-host", 9100);
    let submitted = queue.submit(&args, t0()).unwrap();
    assert_eq!(submitted.job_key, "J_1_render-host_9100");

    let text = queue.print_job(submitted.job_id, JobFields::all()).unwrap();
    assert!(text.contains("OK:id: 1"));
    assert!(text.contains("OK:key: J_1_render-host_9100"));
    assert!(text.contains("OK:status: Pending"));
    assert!(text.contains("OK:input: 'wire input'"));
    assert!(text.contains("OK:group: 'render-group'"));
    assert!(text.contains("OK:affinity: 'fast-node'"));
    assert!(text.contains("OK:subm_notif_port: 9555"));
    assert!(text.contains("OK:mask: 6"));
    assert!(text.contains("OK:remote_client_ip: '192.168.1.50'"));
    // Not-applicable fields keep their place in the schema.
    assert!(text.contains("OK:output: n/a"));
    assert!(text.contains("OK:run_timeout: n/a"));
    assert!(text.contains("OK:listener_notif: n/a"));
    assert!(text.contains("OK:event1: kind=Submit status=Pending"));

    // Selecting a subset renders only that subset.
    let only_status = queue
        .print_job(submitted.job_id, JobFields::STATUS)
        .unwrap();
    assert_eq!(only_status, "OK:status: Pending\n");
}

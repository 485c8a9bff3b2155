use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use raft_client::RaftException;
use raft_client::RequestTarget;

mod fixtures;

use fixtures::Action;
use fixtures::TestTransport;

/// Leader change mid-stream.
///
/// What does this test do?
///
/// - submits writes seq 1, 2, 3; the transport rejects seq 1's first attempt
///   with a not-leader error suggesting server 2.
/// - asserts the not-leader hook ran, the window was re-anchored, seq 1 was
///   re-sent first-flagged with the new leader hint, and all three callers
///   completed with their own replies.
///
/// RUST_LOG=raft_client,leader_change=trace cargo test --test leader_change
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn leader_change_mid_stream() -> Result<()> {
    fixtures::init_tracing();

    let transport = TestTransport::new();
    transport.script(
        "RAFT",
        1,
        vec![Action::NotLeader {
            server: 1,
            suggested: Some(2),
        }],
    );

    let (client, handler) = fixtures::new_client(transport.clone());

    tracing::info!("--- submitting three writes");
    let c1 = client.clone();
    let h1 = tokio::spawn(async move { c1.write("w1".to_string()).await });
    transport.wait_for_requests(1, Duration::from_millis(500), "write 1 on the wire").await?;

    let c2 = client.clone();
    let h2 = tokio::spawn(async move { c2.write("w2".to_string()).await });
    transport.wait_for_requests(2, Duration::from_millis(500), "write 2 on the wire").await?;

    let c3 = client.clone();
    let h3 = tokio::spawn(async move { c3.write("w3".to_string()).await });

    let r1 = h1.await??;
    let r2 = h2.await??;
    let r3 = h3.await??;
    assert_eq!(Some("w1".to_string()), r1.data);
    assert_eq!(Some("w2".to_string()), r2.data);
    assert_eq!(Some("w3".to_string()), r3.data);

    tracing::info!("--- inspecting recovery");
    assert_eq!(1, handler.not_leader.load(Ordering::SeqCst));
    assert_eq!(Some(2), client.current_leader());

    let seq1_attempts: Vec<_> = transport.requests_for("RAFT").into_iter().filter(|r| r.entry.seq == 1).collect();
    assert!(seq1_attempts.len() >= 2, "seq 1 must have been retried");
    let retried = seq1_attempts.last().expect("seq 1 attempts should not be empty");
    assert!(retried.entry.is_first, "the retried first request must re-anchor the window");
    assert_eq!(RequestTarget::Leader { hint: Some(2) }, retried.target);

    fixtures::wait_for_metrics(
        &client,
        |m| m.outstanding_requests == 0 && m.delivered == 3,
        Duration::from_millis(500),
        "outstanding -> 0",
    )
    .await?;

    Ok(())
}

/// A not-leader exception embedded in a normal reply takes the same recovery
/// path as a transport-level rejection, through its own hook.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn embedded_not_leader_exception_is_recovered() -> Result<()> {
    fixtures::init_tracing();

    let transport = TestTransport::new();
    transport.script(
        "RAFT",
        1,
        vec![Action::ReplyException(RaftException::NotLeader {
            server: 1,
            suggested_leader: Some(3),
        })],
    );

    let (client, handler) = fixtures::new_client(transport.clone());

    let reply = client.write("hello".to_string()).await?;
    assert_eq!(Some("hello".to_string()), reply.data);

    assert_eq!(1, handler.leader_exceptions.load(Ordering::SeqCst));
    assert_eq!(0, handler.not_leader.load(Ordering::SeqCst));
    assert_eq!(Some(3), client.current_leader());

    let attempts = transport.requests_for("RAFT");
    assert_eq!(2, attempts.len());
    assert!(attempts.iter().all(|r| r.entry.seq == 1), "retry must not reassign the seq");
    assert!(attempts.last().expect("attempts should not be empty").entry.is_first);

    Ok(())
}

/// Back-to-back leader changes reset the window once per rejection with the
/// same observable outcome as a single reset.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn repeated_not_leader_rejections_recover() -> Result<()> {
    fixtures::init_tracing();

    let transport = TestTransport::new();
    transport.script(
        "RAFT",
        1,
        vec![
            Action::NotLeader {
                server: 1,
                suggested: Some(2),
            },
            Action::NotLeader {
                server: 2,
                suggested: Some(3),
            },
        ],
    );

    let (client, handler) = fixtures::new_client(transport.clone());

    let reply = client.write("persistent".to_string()).await?;
    assert_eq!(Some("persistent".to_string()), reply.data);

    assert_eq!(2, handler.not_leader.load(Ordering::SeqCst));
    assert_eq!(Some(3), client.current_leader());

    let attempts = transport.requests_for("RAFT");
    assert_eq!(3, attempts.len());
    assert!(attempts.iter().all(|r| r.entry.seq == 1 && r.entry.is_first));

    Ok(())
}

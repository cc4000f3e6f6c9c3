//! End-to-end overlay scenarios over loopback TCP.
//!
//! Each node runs a real agent with a seeded RNG; heal and shuffle timers
//! are stretched out so views only change through the protocol actions the
//! tests drive.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::{TcpListener, TcpStream};

use rumor_node::agent::{unix_nanos, Agent, AgentError, MessageHandler};
use rumor_node::config::Config;
use rumor_node::view::NodeInfo;
use rumor_protocol::codec;
use rumor_protocol::message::{JoinReply, Message, UserMessage};

fn overlay_config(addr: String) -> Config {
    Config {
        net: "tcp".into(),
        addr,
        peers: vec![],
        peer_file: None,
        min_aview_size: 3,
        max_aview_size: 5,
        pview_size: 30,
        ka: 1,
        kp: 3,
        arwl: 5,
        prwl: 3,
        srwl: 5,
        msg_life: 5000,
        shuffle_duration: 3600,
        heal: 3600,
        rest_addr: ":0".into(),
        user_message_handler: None,
        purge_duration: 5000,
        verbose: 0,
    }
}

struct TestNode {
    agent: Agent,
    addr: String,
    delivered: Arc<AtomicUsize>,
}

async fn start_node(seed: u64, tweak: impl FnOnce(&mut Config)) -> TestNode {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ln.local_addr().unwrap().to_string();
    let mut cfg = overlay_config(addr.clone());
    tweak(&mut cfg);

    let delivered = Arc::new(AtomicUsize::new(0));
    let d = delivered.clone();
    let handler: MessageHandler = Arc::new(move |_payload| {
        d.fetch_add(1, Ordering::SeqCst);
    });

    let agent = Agent::new(Arc::new(cfg), handler, StdRng::seed_from_u64(seed));
    tokio::spawn(agent.clone().serve_with(ln));
    TestNode {
        agent,
        addr,
        delivered,
    }
}

fn has(view: &[NodeInfo], id: u64) -> bool {
    view.iter().any(|n| n.id == id)
}

async fn wait_until<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn bootstrap_pair_forms_mutual_active_views() {
    let b = start_node(1, |_| {}).await;
    let a = start_node(2, |_| {}).await;

    a.agent.join(&[b.addr.clone()]).await.unwrap();

    let (aa, ba) = (a.agent.clone(), b.agent.clone());
    let (aid, bid) = (aa.id(), ba.id());
    wait_until("mutual active views", move || {
        let (aa, ba) = (aa.clone(), ba.clone());
        async move {
            let sa = aa.snapshot().await;
            let sb = ba.snapshot().await;
            has(&sa.active_view, bid) && has(&sb.active_view, aid)
        }
    })
    .await;

    let sa = a.agent.snapshot().await;
    let sb = b.agent.snapshot().await;
    assert_eq!(sa.active_view.len(), 1);
    assert_eq!(sb.active_view.len(), 1);
    assert!(sa.passive_view.is_empty());
    assert!(sb.passive_view.is_empty());
}

#[tokio::test]
async fn forward_join_spreads_newcomer_to_third_node() {
    let b = start_node(10, |_| {}).await;
    let c = start_node(11, |_| {}).await;
    c.agent.join(&[b.addr.clone()]).await.unwrap();

    let (ba, ca) = (b.agent.clone(), c.agent.clone());
    let (bid, cid) = (ba.id(), ca.id());
    wait_until("b and c peered", move || {
        let (ba, ca) = (ba.clone(), ca.clone());
        async move {
            has(&ba.snapshot().await.active_view, cid)
                && has(&ca.snapshot().await.active_view, bid)
        }
    })
    .await;

    let a = start_node(12, |_| {}).await;
    a.agent.join(&[b.addr.clone()]).await.unwrap();

    // B relays a ForwardJoin for A to C; with a single active link C takes
    // the terminal branch and connects to A directly.
    let (ca, aid) = (c.agent.clone(), a.agent.id());
    wait_until("c learns about a", move || {
        let ca = ca.clone();
        async move {
            let s = ca.snapshot().await;
            has(&s.active_view, aid) || has(&s.passive_view, aid)
        }
    })
    .await;
}

#[tokio::test]
async fn broadcast_delivers_exactly_once_per_node() {
    let b = start_node(20, |_| {}).await;
    let c = start_node(21, |_| {}).await;
    c.agent.join(&[b.addr.clone()]).await.unwrap();
    let a = start_node(22, |_| {}).await;
    a.agent.join(&[b.addr.clone()]).await.unwrap();

    // The ForwardJoin from B makes C dial A, closing the triangle.
    let (aa, ca) = (a.agent.clone(), c.agent.clone());
    let (aid, cid) = (aa.id(), ca.id());
    wait_until("triangle closed", move || {
        let (aa, ca) = (aa.clone(), ca.clone());
        async move {
            has(&aa.snapshot().await.active_view, cid)
                && has(&ca.snapshot().await.active_view, aid)
        }
    })
    .await;

    a.agent.broadcast(b"hello overlay".to_vec()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(a.delivered.load(Ordering::SeqCst), 1, "origin delivers once");
    assert_eq!(b.delivered.load(Ordering::SeqCst), 1);
    assert_eq!(c.delivered.load(Ordering::SeqCst), 1);

    // Same payload inside the purge window is suppressed at the origin.
    a.agent.broadcast(b"hello overlay".to_vec()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.delivered.load(Ordering::SeqCst), 1);
    assert_eq!(b.delivered.load(Ordering::SeqCst), 1);
    assert_eq!(c.delivered.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stale_user_message_is_dropped() {
    let b = start_node(30, |_| {}).await;

    let mut stream = TcpStream::connect(&b.addr).await.unwrap();
    let stale = Message::User(UserMessage {
        id: 7,
        payload: b"ancient news".to_vec(),
        ts: unix_nanos() - 10_000_000_000, // 10 s ago, past the 5 s life
    });
    codec::write_message(&mut stream, &stale).await.unwrap();
    let fresh = Message::User(UserMessage {
        id: 7,
        payload: b"fresh news".to_vec(),
        ts: unix_nanos(),
    });
    codec::write_message(&mut stream, &fresh).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(b.delivered.load(Ordering::SeqCst), 1, "only the fresh payload");
}

#[tokio::test]
async fn dead_peer_repair_drains_to_no_available_peers() {
    // A fake peer that accepts one Join, then dies with its listener.
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake_addr = ln.local_addr().unwrap().to_string();
    let fake = tokio::spawn(async move {
        let (mut stream, _) = ln.accept().await.unwrap();
        match codec::read_message(&mut stream).await.unwrap() {
            Message::Join(_) => {}
            other => panic!("expected Join, got {other:?}"),
        }
        let reply = Message::JoinReply(JoinReply {
            id: 0xDEAD,
            accept: true,
        });
        codec::write_message(&mut stream, &reply).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Dropping the stream and listener kills the "process".
    });

    let a = start_node(40, |_| {}).await;
    a.agent.join(&[fake_addr.clone()]).await.unwrap();

    let aa = a.agent.clone();
    wait_until("fake peer active", move || {
        let aa = aa.clone();
        async move { has(&aa.snapshot().await.active_view, 0xDEAD) }
    })
    .await;

    fake.await.unwrap();

    // Reader errors → repair → empty passive → bootstrap rejoin fails.
    let aa = a.agent.clone();
    wait_until("views drained", move || {
        let aa = aa.clone();
        async move {
            let s = aa.snapshot().await;
            s.active_view.is_empty() && s.passive_view.is_empty()
        }
    })
    .await;

    // With nothing listening anywhere, the failure surfaces to the caller.
    let err = a.agent.join(&["127.0.0.1:9".into()]).await.unwrap_err();
    assert!(matches!(err, AgentError::NoAvailablePeers));
}

#[tokio::test]
async fn join_displaces_random_active_member_when_full() {
    let a = start_node(50, |cfg| cfg.max_aview_size = 2).await;
    let b = start_node(51, |_| {}).await;
    let c = start_node(52, |_| {}).await;

    b.agent.join(&[a.addr.clone()]).await.unwrap();
    c.agent.join(&[a.addr.clone()]).await.unwrap();

    let aa = a.agent.clone();
    wait_until("a saturated", move || {
        let aa = aa.clone();
        async move { aa.snapshot().await.active_view.len() == 2 }
    })
    .await;

    let d = start_node(53, |_| {}).await;
    d.agent.join(&[a.addr.clone()]).await.unwrap();

    let aa = a.agent.clone();
    let ids = [b.agent.id(), c.agent.id(), d.agent.id()];
    wait_until("displacement settled", move || {
        let aa = aa.clone();
        async move {
            let s = aa.snapshot().await;
            let known = |id: u64| has(&s.active_view, id) || has(&s.passive_view, id);
            s.active_view.len() == 2
                && s.passive_view.len() == 1
                && ids.iter().all(|&id| known(id))
        }
    })
    .await;

    // D was just admitted; the displaced node is one of B and C.
    let s = a.agent.snapshot().await;
    let demoted = s.passive_view[0].id;
    assert!(demoted == b.agent.id() || demoted == c.agent.id());
}

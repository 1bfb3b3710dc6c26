//! Integration tests for the Node public API.
//!
//! Nodes run on loopback with discovery pointed at each other's discovery port,
//! short announce and tick intervals, and a private data directory each.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use collabnet::{
    AccessLevel, ConnectionConfig, ConnectionState, DiscoveryConfig, Node, NodeConfig, NodeEvent,
    NodeId,
};
use tempfile::TempDir;
use tokio::time::timeout;

/// Atomic port counter for unique discovery ports across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

const ANNOUNCE_INTERVAL: Duration = Duration::from_millis(500);

/// Allow time for async operations
const TEST_TIMEOUT: Duration = Duration::from_secs(15);

struct TestNode {
    node: Node,
    _dir: TempDir,
}

fn config(dir: &TempDir, discovery_port: u16, peers: &[u16], max_connections: usize) -> NodeConfig {
    NodeConfig {
        data_dir: dir.path().to_path_buf(),
        data_bind: SocketAddr::new(LOCALHOST, 0),
        crypto_workers: 2,
        fetch_timeout: Duration::from_secs(5),
        discovery: DiscoveryConfig {
            bind_addr: LOCALHOST,
            port: discovery_port,
            announce_interval: ANNOUNCE_INTERVAL,
            targets: peers.iter().map(|p| SocketAddr::new(LOCALHOST, *p)).collect(),
            ..DiscoveryConfig::default()
        },
        connection: ConnectionConfig {
            max_connections,
            tick_interval: Duration::from_millis(300),
            ..ConnectionConfig::default()
        },
        ..NodeConfig::default()
    }
}

async fn start_node(discovery_port: u16, peers: &[u16], max_connections: usize) -> TestNode {
    let dir = tempfile::tempdir().expect("tempdir");
    let node = Node::start(config(&dir, discovery_port, peers, max_connections))
        .await
        .expect("node start");
    TestNode { node, _dir: dir }
}

async fn pair() -> (TestNode, TestNode) {
    let (port_a, port_b) = (next_port(), next_port());
    let a = start_node(port_a, &[port_b], 10).await;
    let b = start_node(port_b, &[port_a], 10).await;
    (a, b)
}

/// Poll `check` until it holds or the test timeout passes.
async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn connected(node: &Node, peer: NodeId) -> bool {
    node.get_network_status()
        .await
        .peers
        .iter()
        .any(|p| p.node_id == peer && p.connection == Some(ConnectionState::Established))
}

async fn wait_connected(a: &Node, b: &Node) {
    let (id_a, id_b) = (a.node_id(), b.node_id());
    assert!(
        eventually(TEST_TIMEOUT, || async move {
            connected(a, id_b).await && connected(b, id_a).await
        })
        .await,
        "nodes never connected"
    );
}

async fn wait_remote_file(node: &Node, file_id: &str, need_key: bool) -> bool {
    eventually(TEST_TIMEOUT, || async move {
        node.get_network_status()
            .await
            .remote_files
            .iter()
            .any(|f| f.file_info.file_id == file_id && (!need_key || f.key_received))
    })
    .await
}

#[tokio::test]
async fn nodes_discover_each_other_with_data_port() {
    let (a, b) = pair().await;
    let (a, b) = (&a.node, &b.node);

    let b_id = b.node_id();
    let b_data = b.local_addr();
    let found = eventually(ANNOUNCE_INTERVAL * 2 + Duration::from_secs(1), || async move {
        a.get_network_status()
            .await
            .peers
            .iter()
            .any(|p| p.node_id == b_id && p.address == b_data)
    })
    .await;
    assert!(found, "A never discovered B at its data port");

    let status = a.get_network_status().await;
    assert!(status.running);
    assert_eq!(status.node_id, a.node_id());
    assert!(status.discovered_peer_count >= 1);
    assert!(status.peers.iter().all(|p| p.node_id != a.node_id()));
}

#[tokio::test]
async fn announced_file_is_listed_by_peer() {
    let (a, b) = pair().await;
    wait_connected(&a.node, &b.node).await;

    let source = a._dir.path().join("f1.txt");
    tokio::fs::write(&source, b"first file").await.unwrap();
    let share = a.node.share_file(&source, AccessLevel::Public).await.unwrap();

    assert!(wait_remote_file(&b.node, &share.file_id, false).await);
    let status = b.node.get_network_status().await;
    let remote = status
        .remote_files
        .iter()
        .find(|f| f.file_info.file_id == share.file_id)
        .unwrap();
    assert_eq!(remote.source, a.node.node_id());
    assert_eq!(remote.file_info.file_name, "f1.txt");
    assert_eq!(remote.file_info.encryption_key, None);
    assert!(status.active_connection_count >= 1);

    let dest = b._dir.path().join("fetched-f1.txt");
    let path = b.node.download_file(&remote.file_info, Some(&dest)).await.unwrap();
    assert_eq!(path, Some(dest.clone()));
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"first file");
}

#[tokio::test]
async fn catalog_is_announced_on_connect() {
    let (port_a, port_b) = (next_port(), next_port());
    let a = start_node(port_a, &[port_b], 10).await;

    let source = a._dir.path().join("early.txt");
    tokio::fs::write(&source, b"shared before anyone connected").await.unwrap();
    let share = a.node.share_file(&source, AccessLevel::Team).await.unwrap();

    let b = start_node(port_b, &[port_a], 10).await;
    let mut events = b.node.events().await.unwrap();
    assert!(b.node.events().await.is_err(), "events can only be taken once");

    assert!(wait_remote_file(&b.node, &share.file_id, true).await);

    let announced = timeout(TEST_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if let NodeEvent::FileAnnounced { file_id, source } = event {
                return (file_id, source);
            }
        }
        panic!("event stream ended");
    })
    .await
    .unwrap();
    assert_eq!(announced, (share.file_id.clone(), a.node.node_id()));
}

#[tokio::test]
async fn team_repository_syncs_with_keys() {
    let (a, b) = pair().await;
    wait_connected(&a.node, &b.node).await;
    let mut events = b.node.events().await.unwrap();

    let repo = a._dir.path().join("repo");
    tokio::fs::create_dir_all(repo.join(".git")).await.unwrap();
    tokio::fs::create_dir_all(repo.join("src")).await.unwrap();
    tokio::fs::write(repo.join(".git/config"), b"[core]").await.unwrap();
    tokio::fs::write(repo.join("README.md"), b"# repo").await.unwrap();
    tokio::fs::write(repo.join("src/main.rs"), b"fn main() {}").await.unwrap();

    let shares = a.node.share_repository(&repo, AccessLevel::Team).await.unwrap();
    let mut names: Vec<_> = shares.iter().map(|s| s.file_name.as_str()).collect();
    names.sort();
    assert_eq!(names, ["README.md", "main.rs"]);

    let main_rs = shares.iter().find(|s| s.file_name == "main.rs").unwrap();
    assert!(wait_remote_file(&b.node, &main_rs.file_id, true).await);

    let dest = b._dir.path().join("out/main.rs");
    let path = b
        .node
        .download_file(&main_rs.without_key(), Some(&dest))
        .await
        .unwrap();
    assert_eq!(path, Some(dest.clone()));
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"fn main() {}");

    let received = timeout(TEST_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if let NodeEvent::FileReceived { file_id, .. } = event {
                return file_id;
            }
        }
        panic!("event stream ended");
    })
    .await
    .unwrap();
    assert_eq!(received, main_rs.file_id);

    // A second download is served from B's own store.
    let again = b._dir.path().join("again.rs");
    assert_eq!(
        b.node.download_file(&main_rs.without_key(), Some(&again)).await.unwrap(),
        Some(again.clone())
    );
}

#[tokio::test]
async fn private_files_need_authorization() {
    let (a, b) = pair().await;
    wait_connected(&a.node, &b.node).await;

    let source = a._dir.path().join("secret.txt");
    tokio::fs::write(&source, b"for authorized eyes").await.unwrap();
    let share = a.node.share_file(&source, AccessLevel::Private).await.unwrap();

    assert!(wait_remote_file(&b.node, &share.file_id, false).await);
    let remote = share.without_key();
    let dest = b._dir.path().join("secret.txt");
    assert_eq!(b.node.download_file(&remote, Some(&dest)).await.unwrap(), None);
    assert!(!b.node.get_network_status().await.remote_files[0].key_received);

    a.node.authorize_peer(b.node.node_id()).await;
    assert!(a.node.is_authorized(&b.node.node_id()).await);
    assert!(wait_remote_file(&b.node, &share.file_id, true).await);

    let path = b.node.download_file(&remote, Some(&dest)).await.unwrap();
    assert_eq!(path, Some(dest.clone()));
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"for authorized eyes");
}

#[tokio::test]
async fn unknown_files_are_not_fetchable() {
    let (a, _b) = pair().await;
    assert!(!a.node.request_file("0123456789abcdef0123456789abcdef").await.unwrap());

    let source = a._dir.path().join("mine.txt");
    tokio::fs::write(&source, b"local").await.unwrap();
    let mut share = a.node.share_file(&source, AccessLevel::Public).await.unwrap();
    share.file_id = "ffffffffffffffffffffffffffffffff".to_string();
    assert_eq!(a.node.download_file(&share, None).await.unwrap(), None);
}

#[tokio::test]
async fn hub_never_exceeds_connection_cap() {
    let (hub_port, x_port, y_port) = (next_port(), next_port(), next_port());
    let hub = start_node(hub_port, &[x_port, y_port], 1).await;
    let x = start_node(x_port, &[hub_port], 10).await;
    let y = start_node(y_port, &[hub_port], 10).await;

    let hub_id = hub.node.node_id();
    let deadline = Instant::now() + Duration::from_secs(4);
    let mut saw_connection = false;
    while Instant::now() < deadline {
        let status = hub.node.get_network_status().await;
        assert!(
            status.active_connection_count <= 1,
            "hub has {} connections",
            status.active_connection_count
        );
        saw_connection |= status.active_connection_count == 1;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(saw_connection);
    let spokes_connected =
        connected(&x.node, hub_id).await as usize + connected(&y.node, hub_id).await as usize;
    assert!(spokes_connected <= 1);
}

#[tokio::test]
async fn trust_scores_and_stop() {
    let (a, b) = pair().await;
    let b_id = b.node.node_id();
    let a_node = &a.node;
    assert!(
        eventually(TEST_TIMEOUT, || async move {
            a_node.get_network_status().await.peers.iter().any(|p| p.node_id == b_id)
        })
        .await
    );

    assert!(a.node.set_trust_score(b_id, 1.7).await);
    let status = a.node.get_network_status().await;
    let peer = status.peers.iter().find(|p| p.node_id == b_id).unwrap();
    assert_eq!(peer.trust_score, 1.0);
    assert!(!a.node.set_trust_score(NodeId::random(), 0.2).await);

    a.node.stop().await;
    a.node.stop().await;
    assert!(!a.node.is_running());
    assert!(!a.node.get_network_status().await.running);
}

#[tokio::test]
async fn identity_survives_restart_with_fresh_node_id() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();

    let first = Node::start(config(&dir, port, &[], 10)).await.unwrap();
    let first_id = first.node_id();
    first.stop().await;
    drop(first);

    let key_file = dir.path().join("node_key.pem");
    let key_before = tokio::fs::read(&key_file).await.unwrap();

    let second = Node::start(config(&dir, next_port(), &[], 10)).await.unwrap();
    assert_ne!(second.node_id(), first_id);
    assert_eq!(tokio::fs::read(&key_file).await.unwrap(), key_before);
    second.stop().await;
}

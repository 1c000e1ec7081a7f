//! Peer sets driven by hand over loopback sockets.

use std::collections::BTreeMap;
use std::time::Duration;

use siteagent::{
    Watermark,
    peer::{Catalog, DownstreamSet, MAX_BUFFERED, UpstreamLink, UpstreamSet},
    wire::{Handshake, Refresh},
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::helpers::{RawPeer, SITE};

/// A fixed VSite list.
struct StaticCatalog {
    names: Vec<String>,
    watermarks: BTreeMap<String, Watermark>,
    loaded: bool,
}

impl StaticCatalog {
    fn new(entries: &[(&str, &str)]) -> Self {
        Self {
            names: entries.iter().map(|(n, _)| n.to_string()).collect(),
            watermarks: entries
                .iter()
                .map(|(n, w)| (n.to_string(), Watermark::new(*w)))
                .collect(),
            loaded: true,
        }
    }
}

impl Catalog for StaticCatalog {
    fn site_name(&self) -> &str {
        SITE
    }

    fn vsite_names(&self) -> &[String] {
        &self.names
    }

    fn watermark(&self, vsite: &str) -> Option<Watermark> {
        self.watermarks.get(vsite).cloned()
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }
}

async fn accept(set: &mut DownstreamSet) -> RawPeer {
    let peer = RawPeer::connect(set.local_addr().unwrap()).await;
    let (stream, addr) = set.listener().accept().await.unwrap();
    set.accept(stream, addr);
    peer
}

/// Service `set` until `peer` holds a frame.
async fn pump_until_frame(set: &mut DownstreamSet, catalog: &StaticCatalog, peer: &mut RawPeer) -> Refresh {
    for _ in 0..400 {
        set.read_if_ready(0, catalog);
        set.write_if_ready(0);
        if let Some(frame) = peer.try_frame::<Refresh>() {
            return frame;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no refresh received");
}

#[tokio::test]
async fn test_downstream_catch_up_and_scoped_fan_out() {
    let catalog = StaticCatalog::new(&[
        ("proj1", "2024-01-01T10:00:00"),
        ("proj2", "2024-01-01T11:00:00"),
    ]);
    let mut set = DownstreamSet::bind("127.0.0.1:0").await.unwrap();

    let mut one = accept(&mut set).await;
    let mut two = accept(&mut set).await;
    one.send(&Handshake {
        site: SITE.to_string(),
        vsites: vec!["proj1".to_string()],
    })
    .await;
    two.send(&Handshake {
        site: SITE.to_string(),
        vsites: vec!["proj2".to_string()],
    })
    .await;

    let catch_up = pump_until_frame(&mut set, &catalog, &mut one).await;
    assert_eq!(catch_up, Refresh::new("proj1", Watermark::new("2024-01-01T10:00:00")));
    let catch_up = pump_until_frame(&mut set, &catalog, &mut two).await;
    assert_eq!(catch_up, Refresh::new("proj2", Watermark::new("2024-01-01T11:00:00")));

    let newer = Watermark::new("2024-01-01T12:00:00");
    assert_eq!(set.notify_vsite("proj1", &newer), 1);
    let fanned = pump_until_frame(&mut set, &catalog, &mut one).await;
    assert_eq!(fanned, Refresh::new("proj1", newer));
    assert!(two.try_frame::<Refresh>().is_none());
    assert_eq!(set.len(), 2);
}

#[tokio::test]
async fn test_downstream_holds_handshake_until_loaded() {
    let mut catalog = StaticCatalog::new(&[("proj1", "2024-01-01T10:00:00")]);
    catalog.loaded = false;
    let mut set = DownstreamSet::bind("127.0.0.1:0").await.unwrap();
    let mut peer = accept(&mut set).await;
    peer.send(&Handshake {
        site: SITE.to_string(),
        vsites: vec!["proj1".to_string()],
    })
    .await;

    for _ in 0..10 {
        set.read_if_ready(0, &catalog);
        set.write_if_ready(0);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(peer.try_frame::<Refresh>().is_none());
    assert_eq!(set.len(), 1);

    catalog.loaded = true;
    let catch_up = pump_until_frame(&mut set, &catalog, &mut peer).await;
    assert_eq!(catch_up.vsite, "proj1");
}

#[tokio::test]
async fn test_downstream_drops_out_of_scope_handshakes() {
    let catalog = StaticCatalog::new(&[("proj1", "2024-01-01T10:00:00")]);
    let mut set = DownstreamSet::bind("127.0.0.1:0").await.unwrap();

    let mut wrong_site = accept(&mut set).await;
    wrong_site
        .send(&Handshake {
            site: "siteB".to_string(),
            vsites: vec!["proj1".to_string()],
        })
        .await;
    let mut unknown_vsite = accept(&mut set).await;
    unknown_vsite
        .send(&Handshake {
            site: SITE.to_string(),
            vsites: vec!["proj1".to_string(), "nosuch".to_string()],
        })
        .await;

    for _ in 0..400 {
        set.read_if_ready(0, &catalog);
        if set.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(set.is_empty());
    assert!(unknown_vsite.try_frame::<Refresh>().is_none());
}

#[tokio::test]
async fn test_downstream_drops_slave_flooding_before_load() {
    let mut catalog = StaticCatalog::new(&[("proj1", "2024-01-01T10:00:00")]);
    catalog.loaded = false;
    let mut set = DownstreamSet::bind("127.0.0.1:0").await.unwrap();
    let mut client = TcpStream::connect(set.local_addr().unwrap()).await.unwrap();
    let (stream, addr) = set.listener().accept().await.unwrap();
    set.accept(stream, addr);

    let writer = tokio::spawn(async move {
        let junk = vec![0u8; 2 * MAX_BUFFERED];
        let _ = client.write_all(&junk).await;
    });
    for _ in 0..20_000 {
        set.read_if_ready(0, &catalog);
        if set.is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(set.is_empty());
    writer.abort();
}

#[tokio::test]
async fn test_downstream_drops_slave_that_never_reads() {
    let long_name = "v".repeat(30 * 1024);
    let catalog = StaticCatalog::new(&[(long_name.as_str(), "2024-01-01T10:00:00")]);
    let mut set = DownstreamSet::bind("127.0.0.1:0").await.unwrap();
    let mut quiet = accept(&mut set).await;
    quiet
        .send(&Handshake {
            site: SITE.to_string(),
            vsites: vec![long_name.clone()],
        })
        .await;
    for _ in 0..400 {
        set.read_if_ready(0, &catalog);
        if set.peers().iter().any(|(_, p)| p.scope().is_some()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The slave never reads; once the kernel buffers fill, the backlog grows
    // until the slave is dropped.
    let watermark = Watermark::new("2024-01-01T11:00:00");
    for _ in 0..5_000 {
        set.notify_vsite(&long_name, &watermark);
        set.write_if_ready(0);
        if set.is_empty() {
            break;
        }
    }
    assert!(set.is_empty());
}

#[tokio::test]
async fn test_upstream_sends_handshake_and_yields_refreshes() {
    let master = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let catalog = StaticCatalog::new(&[("proj1", "1900-01-01T00:00:00"), ("proj2", "1900-01-01T00:00:00")]);

    let mut set = UpstreamSet::new();
    set.insert(UpstreamLink::new(
        master.local_addr().unwrap().to_string(),
        Duration::from_secs(60),
        Duration::from_secs(2),
    ));
    assert_eq!(set.compute_wake_time(u64::MAX), 0);

    set.work_if_ready(1_000, &catalog).await;
    assert_eq!(set.compute_wake_time(u64::MAX), u64::MAX);
    let (stream, _) = master.accept().await.unwrap();
    let mut far = RawPeer::new(stream);

    let mut handshake = None;
    for _ in 0..400 {
        set.write_if_ready(1_000);
        handshake = far.try_frame::<Handshake>();
        if handshake.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        handshake,
        Some(Handshake {
            site: SITE.to_string(),
            vsites: vec!["proj1".to_string(), "proj2".to_string()],
        })
    );

    let refresh = Refresh::new("proj2", Watermark::new("2024-01-01T10:00:00"));
    far.send(&refresh).await;
    let mut events = Vec::new();
    for _ in 0..400 {
        set.read_if_ready(1_000, &catalog, &mut events);
        if !events.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(events, vec![refresh]);

    // The master goes away: the link stays and retries later.
    drop(far);
    for _ in 0..400 {
        set.read_if_ready(2_000, &catalog, &mut events);
        if set.compute_wake_time(u64::MAX) != u64::MAX {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(set.len(), 1);
    assert_eq!(set.compute_wake_time(u64::MAX), 62_000);
}

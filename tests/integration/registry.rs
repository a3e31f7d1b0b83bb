use crate::*;

/// Peer 1 publishes, peer 2 finds it at the address it connected from.
#[tokio::test]
async fn test_join_publish_search() -> Result<()> {
    let registry = start_registry().await?;

    let holder = registry.peer(1, &["a.txt", "b.txt"]).await?;
    let holder_at = endpoint_of(&holder)?;

    let mut seeker = registry.client().await?;
    seeker.join(2).await?;

    let found = seeker.search("b.txt").await?.context("b.txt not found")?;
    assert_eq!(found.peer_id, 1);
    assert_eq!(found.endpoint, holder_at);

    assert_eq!(seeker.search("c.txt").await?, None);

    drop(holder);
    registry.stop().await
}

/// A peer that joins and leaves without publishing leaves nothing behind.
#[tokio::test]
async fn test_disconnect_without_publish() -> Result<()> {
    let registry = start_registry().await?;

    let mut quiet = registry.client().await?;
    quiet.join(5).await?;
    sync(&mut quiet).await?;
    drop(quiet);

    let mut seeker = registry.client().await?;
    assert_eq!(seeker.search("a.txt").await?, None);

    registry.stop().await
}

/// Capacity 2: the third join is dropped and its publish is ignored, but the
/// connection stays usable for searches.
#[tokio::test]
async fn test_capacity_refuses_third_peer() -> Result<()> {
    let registry = start_registry_with(RegistryConfig {
        max_peers: 2,
        ..RegistryConfig::default()
    })
    .await?;

    let _first = registry.peer(1, &["one"]).await?;
    let _second = registry.peer(2, &["two"]).await?;
    let mut third = registry.peer(3, &["three"]).await?;

    assert_eq!(third.search("three").await?, None);
    assert_eq!(third.search("one").await?.map(|p| p.peer_id), Some(1));
    assert_eq!(third.search("two").await?.map(|p| p.peer_id), Some(2));

    registry.stop().await
}

/// A freed slot can be taken by a later peer.
#[tokio::test]
async fn test_slot_reused_after_disconnect() -> Result<()> {
    let registry = start_registry_with(RegistryConfig {
        max_peers: 1,
        ..RegistryConfig::default()
    })
    .await?;

    let first = registry.peer(1, &["old"]).await?;
    drop(first);

    let mut seeker = registry.client().await?;
    let registry_ref = &registry;
    eventually(5, || async move {
        // Retried until the first peer's close has been processed.
        let mut late = registry_ref.peer(2, &["new"]).await?;
        let found = late.search("new").await?;
        Ok(found.map(|p| p.peer_id) == Some(2))
    })
    .await?;

    assert_eq!(seeker.search("old").await?, None);
    registry.stop().await
}

/// A second PUBLISH replaces the first list entirely.
#[tokio::test]
async fn test_republish_replaces_list() -> Result<()> {
    let registry = start_registry().await?;

    let mut holder = registry.peer(1, &["a", "b"]).await?;
    holder.publish(&["c"]).await?;
    sync(&mut holder).await?;

    let mut seeker = registry.client().await?;
    assert_eq!(seeker.search("a").await?, None);
    assert_eq!(seeker.search("b").await?, None);
    assert_eq!(seeker.search("c").await?.map(|p| p.peer_id), Some(1));

    // An empty publish withdraws everything.
    holder.publish::<&str>(&[]).await?;
    sync(&mut holder).await?;
    assert_eq!(seeker.search("c").await?, None);

    registry.stop().await
}

/// Several holders of one file: exactly one of them is returned.
#[tokio::test]
async fn test_multiple_holders_return_one() -> Result<()> {
    let registry = start_registry().await?;

    let a = registry.peer(10, &["shared"]).await?;
    let b = registry.peer(20, &["shared"]).await?;
    let holders = [
        (10, endpoint_of(&a)?),
        (20, endpoint_of(&b)?),
    ];

    let mut seeker = registry.client().await?;
    let found = seeker.search("shared").await?.context("shared not found")?;
    assert!(
        holders.contains(&(found.peer_id, found.endpoint)),
        "unexpected holder {found:?}"
    );

    registry.stop().await
}

/// Closing a connection withdraws the peer's files.
#[tokio::test]
async fn test_disconnect_withdraws_files() -> Result<()> {
    let registry = start_registry().await?;

    let holder = registry.peer(1, &["gone.txt"]).await?;
    let mut seeker = registry.client().await?;
    assert!(seeker.search("gone.txt").await?.is_some());

    drop(holder);
    wait_until_gone(&mut seeker, "gone.txt").await?;

    registry.stop().await
}

/// A peer may search before it joins.
#[tokio::test]
async fn test_search_without_join() -> Result<()> {
    let registry = start_registry().await?;
    let _holder = registry.peer(4, &["x"]).await?;

    let mut anonymous = registry.client().await?;
    assert_eq!(anonymous.search("x").await?.map(|p| p.peer_id), Some(4));

    registry.stop().await
}

/// PUBLISH before JOIN is consumed and ignored; the stream stays in sync.
#[tokio::test]
async fn test_publish_before_join_is_ignored() -> Result<()> {
    let registry = start_registry().await?;

    let mut early = registry.client().await?;
    early.publish(&["early.txt"]).await?;
    assert_eq!(early.search("early.txt").await?, None);

    early.join(9).await?;
    early.publish(&["late.txt"]).await?;
    assert_eq!(early.search("late.txt").await?.map(|p| p.peer_id), Some(9));
    assert_eq!(early.search("early.txt").await?, None);

    registry.stop().await
}

/// Many peers joining, publishing and leaving at once; the survivors stay
/// searchable and the departed do not.
#[tokio::test]
async fn test_concurrent_churn() -> Result<()> {
    let registry = start_registry().await?;

    let mut workers = Vec::new();
    for id in 0..8u32 {
        let addr = registry.addr;
        let limits = RegistryConfig::default().wire_limits();
        workers.push(tokio::spawn(async move {
            let mut client = RegistryClient::connect(addr, limits).await?;
            client.join(id).await?;
            client.publish(&[format!("file-{id}")]).await?;
            sync(&mut client).await?;
            Ok::<_, anyhow::Error>((id, client))
        }));
    }

    let mut keep = Vec::new();
    for worker in workers {
        let (id, client) = worker.await??;
        if id % 2 == 0 {
            keep.push(client);
        }
    }

    let mut seeker = registry.client().await?;
    for id in (0..8u32).filter(|id| id % 2 == 0) {
        let found = seeker.search(&format!("file-{id}")).await?;
        assert_eq!(found.map(|p| p.peer_id), Some(id));
    }
    for id in (0..8u32).filter(|id| id % 2 == 1) {
        wait_until_gone(&mut seeker, &format!("file-{id}")).await?;
    }

    drop(keep);
    registry.stop().await
}

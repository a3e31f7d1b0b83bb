//! Configurable registry policies, seen from the wire.

use crate::*;

use peerdex_core::config::DuplicateIdPolicy;

#[tokio::test]
async fn test_duplicate_ids_coexist_by_default() -> Result<()> {
    let registry = start_registry().await?;

    let a = registry.peer(7, &["from-a"]).await?;
    let b = registry.peer(7, &["from-b"]).await?;

    let mut seeker = registry.client().await?;
    let found_a = seeker.search("from-a").await?.context("from-a not found")?;
    let found_b = seeker.search("from-b").await?.context("from-b not found")?;
    assert_eq!((found_a.peer_id, found_b.peer_id), (7, 7));
    assert_eq!(found_a.endpoint, endpoint_of(&a)?);
    assert_eq!(found_b.endpoint, endpoint_of(&b)?);

    registry.stop().await
}

#[tokio::test]
async fn test_duplicate_ids_rejected_when_configured() -> Result<()> {
    let registry = start_registry_with(RegistryConfig {
        duplicate_ids: DuplicateIdPolicy::Reject,
        ..RegistryConfig::default()
    })
    .await?;

    let first = registry.peer(7, &["original"]).await?;
    // Refused silently: the connection stays open but never joins.
    let mut second = registry.peer(7, &["impostor"]).await?;
    assert_eq!(second.search("impostor").await?, None);
    assert_eq!(second.search("original").await?.map(|p| p.peer_id), Some(7));

    // Once the holder leaves, the id is free again.
    drop(first);
    drop(second);
    let registry_ref = &registry;
    eventually(5, || async move {
        let mut retry = registry_ref.peer(7, &["successor"]).await?;
        Ok(retry.search("successor").await?.is_some())
    })
    .await?;

    registry.stop().await
}

#[tokio::test]
async fn test_repeated_join_keeps_first_id() -> Result<()> {
    let registry = start_registry().await?;

    let mut peer = registry.client().await?;
    peer.join(1).await?;
    peer.join(2).await?;
    peer.publish(&["mine"]).await?;

    assert_eq!(peer.search("mine").await?.map(|p| p.peer_id), Some(1));
    registry.stop().await
}

#[tokio::test]
async fn test_self_match_returned_by_default() -> Result<()> {
    let registry = start_registry().await?;

    let mut holder = registry.peer(3, &["own"]).await?;
    let found = holder.search("own").await?.context("own not found")?;
    assert_eq!(found.endpoint, endpoint_of(&holder)?);

    registry.stop().await
}

#[tokio::test]
async fn test_self_exclusion_when_configured() -> Result<()> {
    let registry = start_registry_with(RegistryConfig {
        exclude_self_from_search: true,
        ..RegistryConfig::default()
    })
    .await?;

    let mut holder = registry.peer(3, &["own"]).await?;
    assert_eq!(holder.search("own").await?, None);

    let other = registry.peer(4, &["own"]).await?;
    let found = holder.search("own").await?.context("own not found")?;
    assert_eq!(found.peer_id, 4);
    assert_eq!(found.endpoint, endpoint_of(&other)?);

    registry.stop().await
}

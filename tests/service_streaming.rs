//! Integration tests for the service: live streaming, persistence and shutdown

use skipchain::blockchain::{BlockId, Roster};
use skipchain::config::Config;
use skipchain::crypto::LocalSigner;
use skipchain::error::ChainError;
use skipchain::pagination::PaginateRequest;
use skipchain::service::Service;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Helper to start a service with a fresh roster of `n` members
fn service(config: Config, n: usize) -> (Service, Roster) {
    let signer = LocalSigner::generate(n);
    let roster = Roster::from_keys(signer.keys());
    let service = Service::new(config, Arc::new(signer)).expect("service starts");
    (service, roster)
}

async fn wait_unsubscribed(service: &Service, chain_id: &BlockId) {
    while service.streaming().listener_count(chain_id) > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_stream_delivers_blocks_in_order() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (service, roster) = service(Config::default(), 3);
        let genesis = service.create_chain(roster.clone(), b"genesis".to_vec()).unwrap();
        let chain_id = genesis.hash;

        let (mut listener, _cancel) = service.stream_blocks(chain_id).unwrap();
        assert_eq!(listener.chain_id(), chain_id);

        let mut appended = Vec::new();
        for i in 0..5u8 {
            appended.push(service.append_block(&chain_id, roster.clone(), vec![i]).await.unwrap());
        }

        for expected in &appended {
            let response = listener.recv().await.expect("streamed block");
            assert_eq!(&response.block, expected);
        }
        assert!(listener.try_recv().is_none());

        service.close().await;
    })
    .await
    .expect("test_stream_delivers_blocks_in_order timed out");
}

#[tokio::test]
async fn test_streams_are_per_chain() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (service, roster) = service(Config::default(), 1);
        let chain_a = service.create_chain(roster.clone(), b"a".to_vec()).unwrap().hash;
        let chain_b = service.create_chain(roster.clone(), b"b".to_vec()).unwrap().hash;

        let (mut first, _c1) = service.stream_blocks(chain_a).unwrap();
        let (mut second, _c2) = service.stream_blocks(chain_a).unwrap();
        let (mut other, _c3) = service.stream_blocks(chain_b).unwrap();
        assert_eq!(service.streaming().listener_count(&chain_a), 2);

        let block = service.append_block(&chain_a, roster.clone(), b"a1".to_vec()).await.unwrap();
        assert_eq!(first.recv().await.expect("first listener").block, block);
        assert_eq!(second.recv().await.expect("second listener").block, block);
        assert!(other.try_recv().is_none());

        service.close().await;
    })
    .await
    .expect("test_streams_are_per_chain timed out");
}

#[tokio::test]
async fn test_cancel_ends_stream() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (service, roster) = service(Config::default(), 1);
        let chain_id = service.create_chain(roster.clone(), b"genesis".to_vec()).unwrap().hash;

        let (mut listener, cancel) = service.stream_blocks(chain_id).unwrap();
        cancel.cancel();
        wait_unsubscribed(&service, &chain_id).await;
        assert!(listener.recv().await.is_none());

        // Dropping the handle counts as leaving too
        let (mut listener, cancel) = service.stream_blocks(chain_id).unwrap();
        drop(cancel);
        wait_unsubscribed(&service, &chain_id).await;
        assert!(listener.recv().await.is_none());

        // Appending with nobody listening is fine
        service.append_block(&chain_id, roster, b"quiet".to_vec()).await.unwrap();
        service.close().await;
    })
    .await
    .expect("test_cancel_ends_stream timed out");
}

#[tokio::test]
async fn test_stalled_listener_is_evicted() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let mut config = Config::default();
        config.streaming.channel_capacity = 1;
        config.streaming.send_timeout_ms = 50;
        let (service, roster) = service(config, 1);
        let chain_id = service.create_chain(roster.clone(), b"genesis".to_vec()).unwrap().hash;

        let (mut stalled, _cancel) = service.stream_blocks(chain_id).unwrap();
        let first = service.append_block(&chain_id, roster.clone(), b"1".to_vec()).await.unwrap();
        service.append_block(&chain_id, roster.clone(), b"2".to_vec()).await.unwrap();
        assert_eq!(service.streaming().listener_count(&chain_id), 0);

        // The queued block is still readable, then the stream ends
        assert_eq!(stalled.recv().await.expect("queued block").block, first);
        assert!(stalled.recv().await.is_none());

        service.close().await;
    })
    .await
    .expect("test_stalled_listener_is_evicted timed out");
}

#[tokio::test]
async fn test_close_ends_streams_and_sessions() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (service, roster) = service(Config::default(), 1);
        let genesis = service.create_chain(roster.clone(), b"genesis".to_vec()).unwrap();
        let chain_id = genesis.hash;

        let (mut listener, _cancel) = service.stream_blocks(chain_id).unwrap();
        let session = service
            .paginate_blocks(PaginateRequest::new(chain_id, 1, 1))
            .unwrap();
        assert_eq!(session.responses.recv().await.expect("page").blocks()[0], genesis);

        service.close().await;
        assert!(service.is_closed());
        assert!(listener.recv().await.is_none());
        assert!(session.cancel.is_cancelled());
        while service.pagination().has_session(&session.stream_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(matches!(service.stream_blocks(chain_id), Err(ChainError::ServiceClosed)));
        assert!(matches!(
            service.append_block(&chain_id, roster.clone(), b"late".to_vec()).await,
            Err(ChainError::ServiceClosed)
        ));
        assert!(matches!(
            service.paginate_blocks(PaginateRequest::new(chain_id, 1, 1)),
            Err(ChainError::ServiceClosed)
        ));

        // Closing again is a no-op
        service.close().await;
    })
    .await
    .expect("test_close_ends_streams_and_sessions timed out");
}

#[tokio::test]
async fn test_verify_and_responsible_through_service() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (service, roster) = service(Config::default(), 4);
        let root = service.create_chain(roster.clone(), b"root".to_vec()).unwrap();
        let mut last = root.clone();
        for i in 0..8u8 {
            last = service.append_block(&root.hash, roster.clone(), vec![i]).await.unwrap();
        }
        service.verify_block(&last.hash).unwrap();

        let child = service.create_child_chain(&last.hash, roster.clone(), b"child".to_vec()).unwrap();
        service.verify_block(&child.hash).unwrap();
        assert_eq!(service.get_responsible(&child).unwrap(), last);

        assert!(matches!(
            service.verify_block(&[3u8; 32]),
            Err(ChainError::BlockNotFound(_))
        ));
        service.close().await;
    })
    .await
    .expect("test_verify_and_responsible_through_service timed out");
}

#[tokio::test]
async fn test_service_reopens_database() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.database.path = dir.path().join("chain.db").to_string_lossy().into_owned();

        let signer = LocalSigner::generate(2);
        let roster = Roster::from_keys(signer.keys());
        let signer = Arc::new(signer);

        let (chain_id, tip) = {
            let service = Service::new(config.clone(), signer.clone()).unwrap();
            let genesis = service.create_chain(roster.clone(), b"genesis".to_vec()).unwrap();
            let mut tip = genesis.clone();
            for i in 0..4u8 {
                tip = service.append_block(&genesis.hash, roster.clone(), vec![i]).await.unwrap();
            }
            service.close().await;
            (genesis.hash, tip)
        };

        let service = Service::new(config, signer).unwrap();
        assert_eq!(service.get_block(&tip.hash), Some(tip.clone()));
        assert_eq!(service.store().latest(&chain_id).map(|b| b.hash), Some(tip.hash));
        service.verify_block(&tip.hash).unwrap();

        let next = service.append_block(&chain_id, roster, b"more".to_vec()).await.unwrap();
        assert_eq!(next.index, tip.index + 1);
        service.close().await;
    })
    .await
    .expect("test_service_reopens_database timed out");
}

#[tokio::test]
async fn test_underquorum_block_is_not_published() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let full = LocalSigner::generate(3);
        let roster = Roster::from_keys(full.keys());
        let service = Service::new(Config::default(), Arc::new(full.truncated(2))).unwrap();

        let genesis = service.create_chain(roster.clone(), b"genesis".to_vec()).unwrap();
        let (mut listener, _cancel) = service.stream_blocks(genesis.hash).unwrap();

        let result = service.append_block(&genesis.hash, roster, b"weak".to_vec()).await;
        assert!(matches!(result, Err(ChainError::BadSignature { level: 0, .. })));
        assert!(listener.try_recv().is_none());
        assert_eq!(service.store().len(), 1);

        // Pagination only sees the genesis block
        let session = service
            .paginate_blocks(PaginateRequest::new(genesis.hash, 2, 1))
            .unwrap();
        let response = session.responses.recv().await.expect("response");
        assert_eq!(response.error_code(), 5);
        session.cancel.cancel();

        service.verify_block(&genesis.hash).unwrap();
        service.close().await;
    })
    .await
    .expect("test_underquorum_block_is_not_published timed out");
}

#[test]
#[should_panic]
fn test_stream_blocks_requires_runtime() {
    let (service, roster) = service(Config::default(), 1);
    let genesis = service.create_chain(roster, b"genesis".to_vec()).unwrap();
    let _ = service.stream_blocks(genesis.hash);
}

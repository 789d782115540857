mod common;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use common::{addr, init_tracing, test_config, within, Behavior, Fixture};
use magneto::{
    config::Config,
    error::Error,
    torrent::{DownloadSession, Mode, SessionState},
    wire::BLOCK_LEN,
};

#[tokio::test]
async fn downloads_from_seeders() {
    init_tracing();

    let fixture = Fixture::new(2 * BLOCK_LEN, &[10 * BLOCK_LEN as u64 + 123]);
    let seeders = [(addr(1), Behavior::Honest), (addr(2), Behavior::Honest)];

    let session = DownloadSession::builder(test_config())
        .metadata((*fixture.meta).clone())
        .peers(seeders.iter().map(|(a, _)| *a))
        .connector(fixture.swarm(&seeders))
        .in_memory(true)
        .build()
        .unwrap();

    session.start().await.unwrap();
    assert!(matches!(session.start().await, Err(Error::SessionAlreadyStarted)));

    within(session.wait_complete()).await.unwrap();

    let progress = session.progress();
    assert_eq!(progress.state, SessionState::Completed);
    assert_eq!(progress.verified_pieces, progress.total_pieces);
    assert_eq!(progress.fraction, 1.0);
    assert!(progress.buffer_ready);

    let total = fixture.meta.total_length;
    assert_eq!(session.read(0, total).await.unwrap(), *fixture.data);

    session.cancel().await.unwrap();
    session.cancel().await.unwrap();
    assert_eq!(session.progress().state, SessionState::Cancelled);
}

#[tokio::test]
async fn streams_the_largest_file() {
    init_tracing();

    let piece = 2 * BLOCK_LEN as u64;
    let fixture = Fixture::new(2 * BLOCK_LEN, &[3 * piece + 100, 20 * piece]);
    let seeders = [(addr(1), Behavior::Honest)];

    let fired = Arc::new(AtomicBool::new(false));
    let fired_cb = fired.clone();

    let session = DownloadSession::builder(test_config())
        .metadata((*fixture.meta).clone())
        .peers([addr(1)])
        .connector(fixture.swarm(&seeders))
        .mode(Mode::Stream { file: None })
        .on_buffer_ready(move || fired_cb.store(true, Ordering::SeqCst))
        .in_memory(true)
        .build()
        .unwrap();

    session.start().await.unwrap();

    let target = session.target_file().unwrap().clone();
    assert_eq!(target.offset, 3 * piece + 100);

    within(session.wait_buffer_ready()).await.unwrap();
    assert!(session.is_buffer_ready());
    assert!(fired.load(Ordering::SeqCst));

    // the start of the file can be played
    let start = target.offset as usize;
    let head = within(session.read_wait(target.offset, 1000)).await.unwrap();
    assert_eq!(head, fixture.data[start..start + 1000]);

    within(session.wait_complete()).await.unwrap();
    let end = target.end() as usize;
    let file = session.read(target.offset, target.length).await.unwrap();
    assert_eq!(file, fixture.data[start..end]);

    // the rest of the torrent keeps downloading after the file
    let mut progress = session.subscribe();
    within(progress.wait_for(|p| p.verified_pieces == p.total_pieces))
        .await
        .unwrap();

    session.cancel().await.unwrap();
}

#[tokio::test]
async fn timed_out_requests_go_to_another_peer() {
    init_tracing();

    let fixture = Fixture::new(BLOCK_LEN, &[16 * BLOCK_LEN as u64]);
    // the silent peer sorts first and gets the first requests
    let seeders = [(addr(1), Behavior::Silent), (addr(2), Behavior::Honest)];

    // without endgame a block is only ever asked to one peer
    let config = Config { endgame_blocks: 0, ..test_config() };

    let session = DownloadSession::builder(config)
        .metadata((*fixture.meta).clone())
        .peers([addr(1), addr(2)])
        .connector(fixture.swarm(&seeders))
        .in_memory(true)
        .build()
        .unwrap();

    session.start().await.unwrap();
    within(session.wait_complete()).await.unwrap();

    let total = fixture.meta.total_length;
    assert_eq!(session.read(0, total).await.unwrap(), *fixture.data);

    session.cancel().await.unwrap();
}

#[tokio::test]
async fn corrupt_peer_does_not_spoil_the_download() {
    init_tracing();

    // one block per piece, every bad piece has a single contributor
    let fixture = Fixture::new(BLOCK_LEN, &[12 * BLOCK_LEN as u64]);
    let seeders = [(addr(1), Behavior::Corrupt), (addr(2), Behavior::Honest)];

    let config = Config { max_corruption_strikes: 1, ..test_config() };

    let session = DownloadSession::builder(config)
        .metadata((*fixture.meta).clone())
        .peers([addr(1), addr(2)])
        .connector(fixture.swarm(&seeders))
        .in_memory(true)
        .build()
        .unwrap();

    session.start().await.unwrap();
    within(session.wait_complete()).await.unwrap();

    let total = fixture.meta.total_length;
    assert_eq!(session.read(0, total).await.unwrap(), *fixture.data);

    session.cancel().await.unwrap();
}

#[tokio::test]
async fn corrupt_peer_is_banned() {
    init_tracing();

    let fixture = Fixture::new(BLOCK_LEN, &[4 * BLOCK_LEN as u64]);
    let seeders = [(addr(1), Behavior::Corrupt)];

    let config = Config { max_corruption_strikes: 1, ..test_config() };

    let session = DownloadSession::builder(config)
        .metadata((*fixture.meta).clone())
        .peers([addr(1)])
        .connector(fixture.swarm(&seeders))
        .in_memory(true)
        .build()
        .unwrap();

    session.start().await.unwrap();

    // once banned there is nobody left to download from
    let mut progress = session.subscribe();
    within(progress.wait_for(|p| p.stalled)).await.unwrap();

    let progress = session.progress();
    assert_eq!(progress.peers, 0);
    assert_eq!(progress.verified_pieces, 0);
    assert_eq!(progress.state, SessionState::Active);

    session.cancel().await.unwrap();
}

#[tokio::test]
async fn reads_fail_until_verified() {
    init_tracing();

    let fixture = Fixture::new(BLOCK_LEN, &[4 * BLOCK_LEN as u64]);

    // nobody to download from
    let session = DownloadSession::builder(test_config())
        .metadata((*fixture.meta).clone())
        .connector(fixture.swarm(&[]))
        .in_memory(true)
        .build()
        .unwrap();

    session.start().await.unwrap();

    let r = session.read(0, 10).await;
    assert!(matches!(r, Err(Error::IncompleteRange { offset: 0, len: 10 })));

    let r = session.read(fixture.meta.total_length, 1).await;
    assert!(matches!(r, Err(Error::RangeInvalid { .. })));

    let mut progress = session.subscribe();
    within(progress.wait_for(|p| p.stalled)).await.unwrap();

    // a pending reader is released by the cancel
    let (read, _) = tokio::join!(session.read_wait(0, 10), async {
        session.cancel().await.unwrap()
    });
    assert!(matches!(read, Err(Error::Cancelled)));
    assert_eq!(session.progress().state, SessionState::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_racing_start_stops_the_session() {
    init_tracing();

    let fixture = Fixture::new(BLOCK_LEN, &[BLOCK_LEN as u64]);
    let seeders = [(addr(1), Behavior::Silent)];

    for i in 0..100u64 {
        let session = Arc::new(
            DownloadSession::builder(test_config())
                .metadata((*fixture.meta).clone())
                .peers([addr(1)])
                .connector(fixture.swarm(&seeders))
                .in_memory(true)
                .build()
                .unwrap(),
        );

        let starter = session.clone();
        let start = tokio::spawn(async move { starter.start().await });

        let canceller = session.clone();
        let cancel = tokio::spawn(async move {
            for _ in 0..i % 8 {
                tokio::task::yield_now().await;
            }
            canceller.cancel().await
        });

        let started = within(start).await.unwrap();
        within(cancel).await.unwrap().unwrap();
        assert!(matches!(started, Ok(()) | Err(Error::Cancelled)));

        // nothing is left running to publish over the cancel
        tokio::time::sleep(Duration::from_millis(5)).await;
        let progress = session.progress();
        assert_eq!(progress.state, SessionState::Cancelled, "iteration {i}");
        assert_eq!(progress.peers, 0);
    }
}

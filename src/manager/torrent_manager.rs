use std::{
    collections::HashSet,
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{Context as _, Result};
use size::{Size, Style};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{
        Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore,
        mpsc::{self, Receiver, Sender},
    },
    task::JoinSet,
    time::{self, sleep, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::{
    manager::{
        peer::{PeerError, accept_peer, connect_to_peer, drive_session},
        peer_session::PeerSession,
        piece_scheduler::PieceScheduler,
    },
    metadata::metainfo::Metainfo,
    torrent_protocol::tcp_wire_protocol::PeerLink,
    tracker::{Event, PeerSource},
    util::pretty_info_hash,
};

const ADDR_QUEUE_CAPACITY: usize = 500;
const FINAL_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TorrentManagerConfig {
    pub max_peers: usize,
    pub connectors: usize,
    pub listen_port: u16,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
    pub tracker_retry_interval: Duration,
    pub max_tracker_interval: Duration, // poll at least this often, whatever the tracker says
    pub shutdown_grace: Duration,
    pub stats_interval: Duration,
}

impl Default for TorrentManagerConfig {
    fn default() -> Self {
        TorrentManagerConfig {
            max_peers: 30,
            connectors: 10,
            listen_port: 6881,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(20),
            tracker_retry_interval: Duration::from_secs(30),
            max_tracker_interval: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(10),
            stats_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct PeerSets {
    active: HashSet<SocketAddr>,
    bad: HashSet<SocketAddr>,
    pending: HashSet<SocketAddr>, // queued for a connection attempt
}

/// A handshaken peer waiting for a worker. The permit is its share of the peer budget.
struct ReadyPeer {
    link: PeerLink<TcpStream>,
    permit: OwnedSemaphorePermit,
}

type SharedReceiver<T> = Arc<AsyncMutex<Receiver<T>>>;

/// State shared by every task of one run.
#[derive(Clone)]
struct Context {
    config: Arc<TorrentManagerConfig>,
    metainfo: Arc<Metainfo>,
    peer_id: [u8; 20],
    scheduler: Arc<PieceScheduler>,
    peers: Arc<Mutex<PeerSets>>,
    slots: Arc<Semaphore>,
    fatal: Arc<Mutex<Option<PeerError>>>,
    cancel: CancellationToken,
}

impl Context {
    fn lock_peers(&self) -> std::sync::MutexGuard<'_, PeerSets> {
        self.peers
            .lock()
            .expect("another user panicked while holding the lock")
    }

    /// Filters out known peers and marks the rest as queued.
    fn new_candidates(&self, candidates: Vec<SocketAddr>) -> Vec<SocketAddr> {
        let mut peers = self.lock_peers();
        candidates
            .into_iter()
            .filter(|addr| {
                !peers.active.contains(addr)
                    && !peers.bad.contains(addr)
                    && peers.pending.insert(*addr)
            })
            .collect()
    }

    fn peer_counts(&self) -> (usize, usize) {
        let peers = self.lock_peers();
        (peers.active.len(), peers.bad.len())
    }

    fn set_fatal(&self, error: PeerError) {
        let mut fatal = self
            .fatal
            .lock()
            .expect("another user panicked while holding the lock");
        if fatal.is_none() {
            *fatal = Some(error);
        }
    }
}

/// Finds peers, keeps up to `max_peers` of them busy and stops once the torrent is complete or the run is cancelled.
pub struct TorrentManager<P> {
    config: Arc<TorrentManagerConfig>,
    metainfo: Arc<Metainfo>,
    peer_id: [u8; 20],
    scheduler: Arc<PieceScheduler>,
    peer_source: Arc<AsyncMutex<P>>,
    peers: Arc<Mutex<PeerSets>>,
    fatal: Arc<Mutex<Option<PeerError>>>,
}

impl<P: PeerSource + Send + 'static> TorrentManager<P> {
    pub fn new(
        config: TorrentManagerConfig,
        metainfo: Arc<Metainfo>,
        peer_id: [u8; 20],
        scheduler: Arc<PieceScheduler>,
        peer_source: P,
    ) -> Self {
        TorrentManager {
            config: Arc::new(config),
            metainfo,
            peer_id,
            scheduler,
            peer_source: Arc::new(AsyncMutex::new(peer_source)),
            peers: Arc::new(Mutex::new(PeerSets::default())),
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.scheduler.is_complete() {
            log::info!("all pieces already present, nothing to download");
            self.scheduler.shutdown_storage()?;
            return Ok(());
        }
        log::info!(
            "starting download of {} ({})",
            self.metainfo.name,
            pretty_info_hash(self.metainfo.info_hash)
        );

        let ctx = Context {
            config: self.config.clone(),
            metainfo: self.metainfo.clone(),
            peer_id: self.peer_id,
            scheduler: self.scheduler.clone(),
            peers: self.peers.clone(),
            slots: Arc::new(Semaphore::new(self.config.max_peers)),
            fatal: self.fatal.clone(),
            cancel: cancel.child_token(),
        };

        let (addr_tx, addr_rx) = mpsc::channel(ADDR_QUEUE_CAPACITY);
        let (ready_tx, ready_rx) = mpsc::channel(self.config.max_peers);
        let addr_rx = Arc::new(AsyncMutex::new(addr_rx));
        let ready_rx = Arc::new(AsyncMutex::new(ready_rx));

        let mut tasks = JoinSet::new();
        tasks.spawn(poll_tracker(ctx.clone(), self.peer_source.clone(), addr_tx));
        for _ in 0..self.config.connectors {
            tasks.spawn(run_connector(ctx.clone(), addr_rx.clone(), ready_tx.clone()));
        }
        for _ in 0..self.config.max_peers {
            tasks.spawn(run_worker(ctx.clone(), ready_rx.clone()));
        }
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.listen_port)).await {
            Ok(listener) => {
                if let Ok(local_addr) = listener.local_addr() {
                    log::info!("listening for incoming peers on {local_addr}");
                }
                tasks.spawn(run_listener(ctx.clone(), listener, ready_tx.clone()));
            }
            Err(e) => log::warn!(
                "could not listen on port {}, incoming peers disabled: {e}",
                self.config.listen_port
            ),
        }
        drop(ready_tx);
        tasks.spawn(log_stats(ctx.clone()));

        select! {
            _ = ctx.scheduler.wait_complete() => log::info!("download of {} completed", self.metainfo.name),
            _ = ctx.cancel.cancelled() => log::info!("shutting down"),
        }
        ctx.cancel.cancel();

        let grace = self.config.shutdown_grace;
        if timeout(grace, async { while tasks.join_next().await.is_some() {} })
            .await
            .is_err()
        {
            log::warn!("tasks still running after {grace:?}, aborting them");
            tasks.shutdown().await;
        }

        self.announce_shutdown().await;

        let storage_result = self.scheduler.shutdown_storage();
        let fatal = self
            .fatal
            .lock()
            .expect("another user panicked while holding the lock")
            .take();
        if let Some(e) = fatal {
            return Err(e).context("download aborted");
        }
        storage_result?;
        Ok(())
    }

    async fn announce_shutdown(&self) {
        let mut source = self.peer_source.lock().await;
        let mut events = Vec::new();
        if self.scheduler.is_complete() {
            events.push(Event::Completed);
        }
        events.push(Event::Stopped);
        for event in events {
            let stats = self.scheduler.transfer_stats();
            match timeout(FINAL_ANNOUNCE_TIMEOUT, source.fetch_peers(event, stats)).await {
                Ok(Ok(_)) => log::debug!("tracker notified of event {event}"),
                Ok(Err(e)) => log::warn!("could not notify tracker of event {event}: {e}"),
                Err(_elapsed) => log::warn!("timed out notifying tracker of event {event}"),
            }
        }
    }
}

async fn recv<T>(rx: &AsyncMutex<Receiver<T>>) -> Option<T> {
    rx.lock().await.recv().await
}

async fn poll_tracker<P: PeerSource + Send + 'static>(
    ctx: Context,
    peer_source: Arc<AsyncMutex<P>>,
    addr_tx: Sender<SocketAddr>,
) {
    let mut event = Event::Started;
    loop {
        // only look for more peers when there is room for them
        select! {
            _ = ctx.cancel.cancelled() => return,
            permit = ctx.slots.acquire() => if permit.is_err() { return },
        }

        let stats = ctx.scheduler.transfer_stats();
        let result = select! {
            _ = ctx.cancel.cancelled() => return,
            result = async { peer_source.lock().await.fetch_peers(event, stats).await } => result,
        };
        let wait = match result {
            Ok(announce) => {
                event = Event::None;
                let candidates = ctx.new_candidates(announce.peers);
                log::info!(
                    "tracker returned {} new peers (seeders: {}, leechers: {}), next announce in {:?}",
                    candidates.len(),
                    announce.seeders.map_or("?".to_string(), |s| s.to_string()),
                    announce.leechers.map_or("?".to_string(), |l| l.to_string()),
                    announce.interval.min(ctx.config.max_tracker_interval),
                );
                for addr in candidates {
                    select! {
                        _ = ctx.cancel.cancelled() => return,
                        result = addr_tx.send(addr) => if result.is_err() { return },
                    }
                }
                announce.interval.min(ctx.config.max_tracker_interval)
            }
            Err(e) => {
                log::warn!("tracker announce failed: {e}");
                ctx.config.tracker_retry_interval
            }
        };

        select! {
            _ = ctx.cancel.cancelled() => return,
            _ = sleep(wait) => {}
        }
    }
}

async fn run_connector(
    ctx: Context,
    addr_rx: SharedReceiver<SocketAddr>,
    ready_tx: Sender<ReadyPeer>,
) {
    loop {
        let ready = select! {
            _ = ctx.cancel.cancelled() => return,
            Some(peer_addr) = recv(&addr_rx) => connect_outbound(&ctx, peer_addr).await,
            else => return,
        };
        if let Some(ready) = ready {
            if ready_tx.send(ready).await.is_err() {
                return;
            }
        }
    }
}

async fn connect_outbound(ctx: &Context, peer_addr: SocketAddr) -> Option<ReadyPeer> {
    let permit = select! {
        _ = ctx.cancel.cancelled() => return None,
        permit = ctx.slots.clone().acquire_owned() => permit.ok()?,
    };
    ctx.lock_peers().pending.remove(&peer_addr);

    let result = select! {
        _ = ctx.cancel.cancelled() => return None,
        result = connect_to_peer(
            peer_addr,
            ctx.metainfo.info_hash,
            ctx.peer_id,
            ctx.config.connect_timeout,
            ctx.config.handshake_timeout,
        ) => result,
    };
    match result {
        Ok(link) => {
            log::debug!("peer {peer_addr}: connected");
            ctx.lock_peers().active.insert(peer_addr);
            Some(ReadyPeer { link, permit })
        }
        Err(e) => {
            log::debug!("peer {peer_addr}: marked as bad, could not connect: {e}");
            ctx.lock_peers().bad.insert(peer_addr);
            None
        }
    }
}

async fn handshake_inbound(
    ctx: &Context,
    stream: TcpStream,
    peer_addr: SocketAddr,
    permit: OwnedSemaphorePermit,
) -> Option<ReadyPeer> {
    let result = select! {
        _ = ctx.cancel.cancelled() => return None,
        result = accept_peer(
            stream,
            peer_addr,
            ctx.metainfo.info_hash,
            ctx.peer_id,
            ctx.config.handshake_timeout,
        ) => result,
    };
    match result {
        Ok(link) => {
            log::debug!("peer {peer_addr}: incoming connection accepted");
            ctx.lock_peers().active.insert(peer_addr);
            Some(ReadyPeer { link, permit })
        }
        Err(e) => {
            log::debug!("peer {peer_addr}: incoming handshake failed: {e}");
            None
        }
    }
}

/// Accepts incoming peers while the peer budget allows. Each handshake runs in its own
/// task, so a permit taken here never waits on a connector.
async fn run_listener(ctx: Context, listener: TcpListener, ready_tx: Sender<ReadyPeer>) {
    let mut handshakes = JoinSet::new();
    loop {
        let (stream, peer_addr) = select! {
            _ = ctx.cancel.cancelled() => return,
            Some(_) = handshakes.join_next() => continue,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::debug!("error accepting incoming connection: {e}");
                    continue;
                }
            },
        };
        let Ok(permit) = ctx.slots.clone().try_acquire_owned() else {
            log::trace!("peer {peer_addr}: refusing incoming connection, peer budget reached");
            continue;
        };
        let ctx = ctx.clone();
        let ready_tx = ready_tx.clone();
        handshakes.spawn(async move {
            if let Some(ready) = handshake_inbound(&ctx, stream, peer_addr, permit).await {
                // every ready peer holds a permit, so the queue always has room
                let _ = ready_tx.send(ready).await;
            }
        });
    }
}

async fn run_worker(ctx: Context, ready_rx: SharedReceiver<ReadyPeer>) {
    loop {
        let ReadyPeer { link, permit } = select! {
            _ = ctx.cancel.cancelled() => return,
            Some(ready) = recv(&ready_rx) => ready,
            else => return,
        };
        let peer_addr = link.peer_addr();
        let session = PeerSession::new(peer_addr, ctx.scheduler.clone(), ctx.metainfo.clone());
        let result = drive_session(
            link,
            session,
            ctx.cancel.clone(),
            ctx.scheduler.completion(),
            ctx.config.read_timeout,
        )
        .await;
        ctx.lock_peers().active.remove(&peer_addr);
        drop(permit);

        match result {
            Ok(end) => log::debug!("peer {peer_addr}: session ended ({end:?})"),
            Err(e) if e.is_fatal() => {
                log::error!("peer {peer_addr}: {e}, aborting download");
                ctx.set_fatal(e);
                ctx.cancel.cancel();
            }
            Err(PeerError::ProtocolViolation(reason)) => {
                log::debug!("peer {peer_addr}: marked as bad, {reason}");
                ctx.lock_peers().bad.insert(peer_addr);
            }
            Err(e) => log::debug!("peer {peer_addr}: dropped: {e}"),
        }
    }
}

async fn log_stats(ctx: Context) {
    let mut interval = time::interval(ctx.config.stats_interval);
    interval.tick().await;
    let mut last_poll = Instant::now();
    let mut last_downloaded = ctx.scheduler.transfer_stats().downloaded_bytes;
    loop {
        select! {
            _ = ctx.cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let stats = ctx.scheduler.transfer_stats();
        let elapsed_s = last_poll.elapsed().as_millis().max(1) as f64 / 1000f64;
        let bandwidth_down = (stats.downloaded_bytes - last_downloaded) as f64 / elapsed_s;
        last_poll = Instant::now();
        last_downloaded = stats.downloaded_bytes;
        let (active_peers, bad_peers) = ctx.peer_counts();
        log::info!(
            "left: {left}, pieces: {completed}/{total}{endgame} | Down: {down}/s (tot.: {tot_down}) | connected peers: {active_peers}, bad: {bad_peers}",
            left = Size::from_bytes(stats.left_bytes)
                .format()
                .with_style(Style::Abbreviated),
            completed = stats.downloaded_pieces,
            total = stats.total_pieces,
            endgame = if ctx.scheduler.in_endgame() { " (endgame)" } else { "" },
            down = Size::from_bytes(bandwidth_down)
                .format()
                .with_style(Style::Abbreviated),
            tot_down = Size::from_bytes(stats.downloaded_bytes)
                .format()
                .with_style(Style::Abbreviated),
        );
    }
}

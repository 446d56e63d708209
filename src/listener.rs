use crate::codec::{self, Framing, Response};
use crate::config;
use crate::util::lock;
use crate::worker::{ConnectionWorker, ServerContext};
use anyhow::{Context, Result};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct OriginPolicy {
    pub allow_loopback: bool,
    pub allowed: Vec<IpAddr>,
}

impl OriginPolicy {
    pub fn local_only() -> Self {
        Self {
            allow_loopback: true,
            allowed: Vec::new(),
        }
    }

    pub fn from_config(cfg: &config::Server) -> Result<Self> {
        let allowed = cfg
            .allowed_origins
            .iter()
            .map(|s| {
                s.parse::<IpAddr>()
                    .with_context(|| format!("invalid allowed origin: {s}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            allow_loopback: true,
            allowed,
        })
    }

    pub fn permits(&self, ip: IpAddr) -> bool {
        (self.allow_loopback && is_loopback(ip)) || self.allowed.contains(&ip)
    }
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback()),
    }
}

enum Dispatch {
    PerConnection,
    Pool(Sender<ConnectionWorker>),
}

impl Dispatch {
    fn new(max_workers: usize) -> Result<Self> {
        if max_workers == 0 {
            return Ok(Dispatch::PerConnection);
        }
        let (tx, rx) = mpsc::channel::<ConnectionWorker>();
        let rx = Arc::new(Mutex::new(rx));
        for i in 0..max_workers {
            let rx = Arc::clone(&rx);
            thread::Builder::new()
                .name(format!("conn-worker-{i}"))
                .spawn(move || serve_queue(&rx))
                .with_context(|| format!("spawning connection worker {i}"))?;
        }
        Ok(Dispatch::Pool(tx))
    }

    fn dispatch(&self, worker: ConnectionWorker, id: u64) {
        match self {
            Dispatch::PerConnection => {
                let spawned = thread::Builder::new()
                    .name(format!("conn-{id}"))
                    .spawn(move || worker.run());
                if let Err(e) = spawned {
                    error!("spawning worker thread for connection {id} failed: {e}");
                }
            }
            Dispatch::Pool(tx) => {
                if tx.send(worker).is_err() {
                    error!("worker pool is gone; dropping connection {id}");
                }
            }
        }
    }
}

fn serve_queue(rx: &Mutex<Receiver<ConnectionWorker>>) {
    loop {
        let next = lock(rx).recv();
        match next {
            Ok(worker) => worker.run(),
            Err(_) => return,
        }
    }
}

pub struct Listener {
    socket: TcpListener,
    ctx: Arc<ServerContext>,
    origin: OriginPolicy,
    dispatch: Dispatch,
    next_id: u64,
}

impl Listener {
    pub fn bind(
        addr: SocketAddr,
        ctx: Arc<ServerContext>,
        origin: OriginPolicy,
        max_workers: usize,
    ) -> Result<Self> {
        let socket = TcpListener::bind(addr).with_context(|| format!("binding {addr}"))?;
        Ok(Self {
            socket,
            ctx,
            origin,
            dispatch: Dispatch::new(max_workers)?,
            next_id: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn run(mut self) {
        match self.socket.local_addr() {
            Ok(addr) => info!("listening for clients on {addr}"),
            Err(e) => warn!("listening on unknown address: {e}"),
        }
        loop {
            match self.socket.accept() {
                Ok((stream, peer)) => self.handle(stream, peer),
                Err(e) => error!("accept failed: {e}"),
            }
        }
    }

    fn handle(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;
        if !self.origin.permits(peer.ip()) {
            warn!(id, %peer, "rejecting remote connection");
            reject(stream, self.ctx.framing);
            return;
        }
        let worker = ConnectionWorker::new(Arc::clone(&self.ctx), stream, peer, id);
        self.dispatch.dispatch(worker, id);
    }
}

fn reject(mut stream: TcpStream, framing: Framing) {
    if let Err(e) = codec::write_response(&mut stream, framing, &Response::rejected()) {
        debug!("writing rejection failed: {e}");
    }
    if let Err(e) = stream.shutdown(Shutdown::Write) {
        debug!("socket shutdown after rejection: {e}");
    }
}

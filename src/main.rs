use std::net::Ipv4Addr;
use std::time::Instant;

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tun_tap::{Iface, Mode};

use rust_tcp::{Config, ConnectionId, Error, EventLoop, NetworkInterface, Result};

#[derive(Parser, Debug)]
#[command(name = "tcp")]
#[command(about = "User-space TCP/IP engine over a TUN device", long_about = None)]
struct Args {
    /// Address this engine answers to
    #[arg(long, env = "MY_IP")]
    local_addr: Ipv4Addr,

    /// TUN device to attach to
    #[arg(long, default_value = "tun0")]
    tun: String,

    /// Port to serve the echo service on (repeatable)
    #[arg(short, long = "listen", default_value = "80")]
    listen: Vec<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// One accepted connection and the bytes it still owes the peer
struct Session {
    id: ConnectionId,
    unsent: Vec<u8>,
}

/// Echo every byte back until the peer closes
struct Echo {
    ports: Vec<u16>,
    open: Vec<Session>,
    buf: Vec<u8>,
}

impl Echo {
    fn new(ports: Vec<u16>) -> Self {
        Echo {
            ports,
            open: Vec::new(),
            buf: vec![0u8; 4096],
        }
    }

    fn poll(&mut self, iface: &mut NetworkInterface) {
        for &port in &self.ports {
            while let Some(id) = iface.accept(port) {
                info!("[{id}] accepted on port {port}");
                self.open.push(Session {
                    id,
                    unsent: Vec::new(),
                });
            }
        }

        let now = Instant::now();
        let buf = &mut self.buf;
        self.open
            .retain_mut(|session| Self::serve(iface, session, buf, now));
    }

    /// Returns false once the session is finished
    fn serve(
        iface: &mut NetworkInterface,
        session: &mut Session,
        buf: &mut [u8],
        now: Instant,
    ) -> bool {
        let id = session.id;
        loop {
            // Held bytes go out before anything new is read
            if !session.unsent.is_empty() {
                match iface.send(id, &session.unsent, now) {
                    Ok(sent) => {
                        session.unsent.drain(..sent);
                    }
                    Err(err) => {
                        warn!("[{id}] send failed: {err}");
                        return false;
                    }
                }
                if !session.unsent.is_empty() {
                    debug!("[{id}] send buffer full, holding {} bytes", session.unsent.len());
                    return true;
                }
            }

            match iface.recv(id, buf, now) {
                Ok(0) => {
                    debug!("[{id}] peer closed");
                    if let Err(err) = iface.close(id, now) {
                        warn!("[{id}] close failed: {err}");
                    }
                    return false;
                }
                Ok(nbytes) => session.unsent.extend_from_slice(&buf[..nbytes]),
                Err(Error::WouldBlock) => return true,
                Err(err) => {
                    warn!("[{id}] {err}");
                    return false;
                }
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("rust_tcp={log_level},tcp={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::new(args.local_addr);
    config.tun_name = args.tun;
    config.listen = args.listen;
    config.validate()?;

    let device = Iface::without_packet_info(&config.tun_name, Mode::Tun)?;
    info!("TUN device {} attached, answering as {}", device.name(), config.local_addr);

    let iface = NetworkInterface::from_config(&config)?;
    let mut echo = Echo::new(config.listen.clone());
    let mut event_loop = EventLoop::new(device, iface);
    event_loop.run(|iface| echo.poll(iface))
}

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use mpegts_recorder::{ChannelDescriptor, Recorder, RecorderConfig};

#[derive(Parser)]
struct Opt {
    /// UDP socket to bind + listen (IPv4)
    #[clap(long, default_value = "239.1.1.2:1234")]
    addr: String,

    /// Channel description (JSON) with the PIDs to record
    #[clap(long)]
    channel: PathBuf,

    /// Recording directory (segment files, index, info)
    #[clap(long)]
    dir: PathBuf,

    /// Segment rotation threshold in MiB
    #[clap(long, default_value_t = 2000)]
    max_file_size_mib: u64,

    /// Stop after this many seconds (default: run until SIGINT)
    #[clap(long)]
    duration: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opt = Opt::parse();

    let channel: ChannelDescriptor =
        serde_json::from_str(&std::fs::read_to_string(&opt.channel)?)?;
    let config = RecorderConfig {
        max_video_file_size_mib: opt.max_file_size_mib,
        ..Default::default()
    };

    let mut recorder = Recorder::new(&opt.dir, &channel, config)?;
    recorder.activate(true);

    let socket = create_udp_socket(&opt.addr)?;
    socket.set_read_timeout(Some(Duration::from_millis(500)))?;

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;

    info!("recording {} to {}", opt.addr, opt.dir.display());
    let started = Instant::now();
    let mut buf = [0u8; 2048];
    while !term.load(Ordering::Relaxed) {
        if let Some(limit) = opt.duration {
            if started.elapsed() >= Duration::from_secs(limit) {
                break;
            }
        }
        match socket.recv(&mut buf) {
            Ok(n) if n > 0 => recorder.receive(&buf[..n]),
            Ok(_) => {}
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                warn!("socket error: {e}");
                break;
            }
        }
    }

    info!("stopping (overflowed {} bytes)", recorder.overflow_bytes());
    recorder.activate(false);
    drop(recorder); // joins the analyzer thread
    Ok(())
}

/// Join multicast / bind unicast socket helper
fn create_udp_socket(addr: &str) -> anyhow::Result<UdpSocket> {
    let sock_addr: SocketAddr = addr.parse()?;
    let ip = match sock_addr.ip() {
        IpAddr::V4(v4) => v4,
        _ => anyhow::bail!("only IPv4 is supported"),
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&sock_addr.into())?;

    if ip.is_multicast() {
        let iface = std::net::Ipv4Addr::UNSPECIFIED; // default interface
        socket.join_multicast_v4(&ip, &iface)?;
    }
    Ok(socket.into())
}

//! ustack-demo - drive two stacks over an in-memory link
//!
//! Brings up two complete stacks on simulated NICs, wires them back to
//! back, and runs the classic smoke tests against them: ARP resolution,
//! ICMP echo, a TCP echo session and a DNS lookup answered by the peer.

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ustack::config::StackConfig;
use ustack::inet::Inet;
use ustack::nic::SimNic;
use ustack::timer::{ManualClock, Timers};
use ustack::{MacAddr, Result, Socket};

#[derive(Parser)]
#[command(name = "ustack-demo")]
#[command(about = "Exercise the stack over an in-memory link", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON stack config for the client side (address/netmask/gateway/dns)
    #[arg(short, long)]
    config: Option<String>,

    /// Bytes of TCP payload to echo
    #[arg(short, long, default_value_t = 64 * 1024)]
    bytes: usize,

    /// Print per-layer statistics at the end
    #[arg(short, long)]
    stats: bool,
}

struct Wire {
    clock: ManualClock,
    timers: Timers,
    left: SimNic,
    right: SimNic,
}

impl Wire {
    /// Shuttle frames until the link is idle.
    fn pump(&self) {
        for _ in 0..256 {
            let from_left = self.left.poll_tx();
            let from_right = self.right.poll_tx();
            if from_left.is_empty() && from_right.is_empty() {
                break;
            }
            for frame in from_left {
                self.right.inject(&frame);
            }
            for frame in from_right {
                self.left.inject(&frame);
            }
        }
    }

    fn tick(&self, d: Duration) {
        self.clock.advance(d);
        self.timers.process();
        self.pump();
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let client_config = match &cli.config {
        Some(json) => StackConfig::from_json(json)?,
        None => StackConfig {
            address: Ipv4Addr::new(10, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(10, 0, 0, 254),
            dns: Ipv4Addr::new(10, 0, 0, 2),
            slaac: false,
        },
    };
    let server_addr = Ipv4Addr::new(10, 0, 0, 2);

    let clock = ManualClock::new();
    let timers = Timers::new(Rc::new(clock.clone()));
    let left = SimNic::new(MacAddr::new(0x52, 0x54, 0, 0, 0, 1), 1500);
    let right = SimNic::new(MacAddr::new(0x52, 0x54, 0, 0, 0, 2), 1500);

    let client = Inet::new(Rc::new(left.clone()), timers.clone())?;
    let server = Inet::new(Rc::new(right.clone()), timers.clone())?;
    client_config.apply(&client);
    server.configure(
        server_addr,
        client_config.netmask,
        client_config.gateway,
        client_config.dns,
    );
    let wire = Wire {
        clock,
        timers,
        left,
        right,
    };
    info!(client = %client.ip_addr(), server = %server.ip_addr(), "stacks up");

    // 1. ping across the wire (resolves the MAC on the way)
    let pings = Rc::new(RefCell::new(0));
    {
        let pings = pings.clone();
        client.ping(
            server_addr,
            Box::new(move |reply| {
                if let Some(reply) = reply {
                    info!(from = %reply.from, seq = reply.seq, "ping reply");
                    *pings.borrow_mut() += 1;
                }
            }),
        );
    }
    wire.pump();
    assert_eq!(*pings.borrow(), 1, "ping went unanswered");

    // 2. TCP echo
    server.tcp_bind(7, |conn| {
        info!(conn = %conn, "echo: accepted");
        let c = conn.clone();
        conn.on_read(64 * 1024, move |chunk| c.write(chunk));
    })?;

    let payload: Vec<u8> = (0..cli.bytes).map(|i| (i % 251) as u8).collect();
    let echoed = Rc::new(RefCell::new(Vec::with_capacity(payload.len())));
    {
        let echoed = echoed.clone();
        let payload = payload.clone();
        client.tcp_connect(Socket::v4(server_addr, 7), move |conn| {
            let conn = conn.expect("echo connect failed");
            info!(conn = %conn, "echo: connected");
            {
                let echoed = echoed.clone();
                conn.on_read(64 * 1024, move |chunk| {
                    echoed.borrow_mut().extend_from_slice(&chunk);
                });
            }
            conn.write(payload.clone());
        })?;
    }
    for _ in 0..200 {
        wire.tick(Duration::from_millis(20));
        if echoed.borrow().len() >= payload.len() {
            break;
        }
    }
    assert_eq!(*echoed.borrow(), payload, "echo stream mismatch");
    info!(bytes = payload.len(), "echo: stream verified");

    // 3. DNS: the server side answers for example.test
    {
        let dns_sock = server.udp_bind(Some(53))?;
        let reply_via = dns_sock.clone();
        dns_sock.on_read(move |from, query| {
            let mut msg = Vec::new();
            msg.extend_from_slice(&query[..2]);
            msg.extend_from_slice(&0x8180u16.to_be_bytes());
            msg.extend_from_slice(&1u16.to_be_bytes());
            msg.extend_from_slice(&1u16.to_be_bytes());
            msg.extend_from_slice(&[0; 4]);
            msg.extend_from_slice(&query[12..]);
            msg.extend_from_slice(&[0xc0, 12, 0, 1, 0, 1]);
            msg.extend_from_slice(&60u32.to_be_bytes());
            msg.extend_from_slice(&4u16.to_be_bytes());
            msg.extend_from_slice(&[203, 0, 113, 5]);
            let IpAddr::V4(addr) = from.addr() else { return };
            let _ = reply_via.sendto(addr, from.port(), &msg);
        });
        std::mem::forget(dns_sock);
    }
    let resolved = Rc::new(RefCell::new(None));
    {
        let resolved = resolved.clone();
        client.resolve("example.test", move |res| {
            *resolved.borrow_mut() = Some(res);
        });
    }
    wire.pump();
    match resolved.borrow_mut().take() {
        Some(Ok(addr)) => info!(%addr, "resolved example.test"),
        other => panic!("resolve failed: {other:?}"),
    }

    if cli.stats {
        let ip4 = client.ip4();
        let tcp = client.tcp();
        let stats = serde_json::json!({
            "ip4": {
                "rx": ip4.borrow().stats().packets_rx,
                "tx": ip4.borrow().stats().packets_tx,
                "dropped": ip4.borrow().stats().packets_dropped,
            },
            "tcp": {
                "rx": tcp.borrow().stats().packets_rx,
                "connections": tcp.borrow().active_connections(),
            },
        });
        println!("{stats}");
    }

    info!("all demos passed");
    Ok(())
}

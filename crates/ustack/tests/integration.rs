//! End-to-end tests: two fully assembled stacks wired back to back over
//! an in-memory link, with the test harness in control of frame delivery
//! (so it can drop, withhold or forge traffic) and of time.

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::time::Duration;

use ustack::inet::Inet;
use ustack::nic::SimNic;
use ustack::timer::{ManualClock, Timers};
use ustack::{MacAddr, NetworkError, Socket};

const MAC_A: MacAddr = MacAddr::new(0x52, 0x54, 0, 0, 0, 1);
const MAC_B: MacAddr = MacAddr::new(0x52, 0x54, 0, 0, 0, 2);
const IP_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const IP_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
const GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 254);

struct Net {
    clock: ManualClock,
    timers: Timers,
    nic_a: SimNic,
    nic_b: SimNic,
    a: Inet,
    b: Inet,
}

impl Net {
    fn new() -> Net {
        let clock = ManualClock::new();
        let timers = Timers::new(Rc::new(clock.clone()));
        let nic_a = SimNic::new(MAC_A, 1500);
        let nic_b = SimNic::new(MAC_B, 1500);
        let a = Inet::new(Rc::new(nic_a.clone()), timers.clone()).unwrap();
        let b = Inet::new(Rc::new(nic_b.clone()), timers.clone()).unwrap();
        a.configure(IP_A, NETMASK, GATEWAY, IP_B);
        b.configure(IP_B, NETMASK, GATEWAY, IP_B);
        Net {
            clock,
            timers,
            nic_a,
            nic_b,
            a,
            b,
        }
    }

    /// Shuttle frames both ways until the wire is quiet.
    fn pump(&self) {
        self.pump_filtered(&mut |_, _| true);
    }

    /// Shuttle frames; `keep(direction_a_to_b, frame)` decides delivery.
    fn pump_filtered(&self, keep: &mut dyn FnMut(bool, &[u8]) -> bool) {
        for _ in 0..64 {
            let from_a = self.nic_a.poll_tx();
            let from_b = self.nic_b.poll_tx();
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }
            for frame in from_a {
                if keep(true, &frame) {
                    self.nic_b.inject(&frame);
                }
            }
            for frame in from_b {
                if keep(false, &frame) {
                    self.nic_a.inject(&frame);
                }
            }
        }
    }

    /// Advance time, run timers, deliver whatever that produced.
    fn tick(&self, d: Duration) {
        self.clock.advance(d);
        self.timers.process();
        self.pump();
    }
}

//
// frame dissection helpers
//

fn ethertype(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[12], frame[13]])
}

fn ip_proto(frame: &[u8]) -> Option<u8> {
    (ethertype(frame) == 0x0800).then(|| frame[23])
}

fn ip_total_length(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[16], frame[17]])
}

fn tcp_seq(frame: &[u8]) -> u32 {
    u32::from_be_bytes([frame[38], frame[39], frame[40], frame[41]])
}

fn tcp_payload_len(frame: &[u8]) -> usize {
    let ihl = usize::from(frame[14] & 0x0f) * 4;
    let tcp_off = 14 + ihl;
    let doff = usize::from(frame[tcp_off + 12] >> 4) * 4;
    frame.len() - tcp_off - doff
}

fn is_tcp_data(frame: &[u8]) -> bool {
    ip_proto(frame) == Some(6) && tcp_payload_len(frame) > 0
}

//
// scenarios
//

#[test]
fn test_three_way_handshake() {
    let net = Net::new();

    let server_conns = Rc::new(RefCell::new(Vec::new()));
    {
        let conns = server_conns.clone();
        net.b
            .tcp_bind(80, move |conn| conns.borrow_mut().push(conn))
            .unwrap();
    }

    let client_conn = Rc::new(RefCell::new(None));
    {
        let slot = client_conn.clone();
        net.a
            .tcp_connect(Socket::v4(IP_B, 80), move |conn| {
                *slot.borrow_mut() = Some(conn.expect("connect must succeed"));
            })
            .unwrap();
    }
    net.pump();

    let client = client_conn.borrow().clone().expect("on_connect fired");
    assert_eq!(client.state_name(), "ESTABLISHED");
    assert!(client.is_connected());

    let servers = server_conns.borrow();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].state_name(), "ESTABLISHED");
    assert_eq!(servers[0].remote().addr(), IpAddr::V4(IP_A));
}

#[test]
fn test_tcp_echo_round_trip() {
    let net = Net::new();

    net.b
        .tcp_bind(7, |conn| {
            let c = conn.clone();
            conn.on_read(16 * 1024, move |chunk| c.write(chunk));
        })
        .unwrap();

    let received = Rc::new(RefCell::new(Vec::new()));
    {
        let received = received.clone();
        net.a
            .tcp_connect(Socket::v4(IP_B, 7), move |conn| {
                let conn = conn.expect("connect");
                {
                    let received = received.clone();
                    conn.on_read(16 * 1024, move |chunk| {
                        received.borrow_mut().extend_from_slice(&chunk);
                    });
                }
                conn.write(&b"knock knock"[..]);
            })
            .unwrap();
    }
    net.pump();
    assert_eq!(received.borrow().as_slice(), b"knock knock");
}

#[test]
fn test_ping_reply() {
    let net = Net::new();
    let reply = Rc::new(RefCell::new(None));
    {
        let reply = reply.clone();
        net.a.ping(
            IP_B,
            Box::new(move |echo| *reply.borrow_mut() = Some(echo)),
        );
    }
    net.pump();

    let echo = reply
        .borrow_mut()
        .take()
        .expect("callback fired")
        .expect("got a reply, not a timeout");
    assert_eq!(echo.from, IP_B);
    assert_eq!(echo.payload.len(), 48);
}

#[test]
fn test_arp_resolution_queues_datagram() {
    let net = Net::new();
    let got = Rc::new(RefCell::new(Vec::new()));
    {
        let got = got.clone();
        let sock = net.b.udp_bind(Some(9000)).unwrap();
        sock.on_read(move |from, data| {
            got.borrow_mut().push((from, data.to_vec()));
        });
        std::mem::forget(sock); // keep alive for the test
    }

    let sock = net.a.udp_bind(None).unwrap();
    sock.sendto(IP_B, 9000, b"queued until resolved").unwrap();

    // the first frame on the wire must be the ARP broadcast, not UDP
    let first = net.nic_a.poll_tx();
    assert_eq!(ethertype(&first[0]), 0x0806);
    for frame in &first {
        net.nic_b.inject(frame);
    }
    net.pump();

    let got = got.borrow();
    assert_eq!(got.len(), 1, "exactly one datagram after resolution");
    assert_eq!(got[0].1, b"queued until resolved");
}

#[test]
fn test_arp_exhaustion_reports_error() {
    let net = Net::new();
    let errors = Rc::new(RefCell::new(Vec::new()));

    let sock = net.a.udp_bind(None).unwrap();
    {
        let errors = errors.clone();
        sock.on_error(move |err, dest| errors.borrow_mut().push((err, dest)));
    }
    let ghost = Ipv4Addr::new(10, 0, 0, 99);
    sock.sendto(ghost, 9000, b"going nowhere").unwrap();

    let mut arp_requests = 0;
    for _ in 0..6 {
        arp_requests += net
            .nic_a
            .poll_tx()
            .iter()
            .filter(|f| ethertype(f) == 0x0806)
            .count();
        net.clock.advance(Duration::from_secs(1));
        net.timers.process();
    }
    assert!(arp_requests >= 3, "expected retries, saw {arp_requests}");

    let errors = errors.borrow();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0].0, NetworkError::ResolveFailed(_)));
    assert_eq!(errors[0].1, Socket::v4(ghost, 9000));
}

#[test]
fn test_fast_retransmit_on_dup_acks() {
    let net = Net::new();

    let received = Rc::new(RefCell::new(Vec::new()));
    {
        let received = received.clone();
        net.b
            .tcp_bind(80, move |conn| {
                let received = received.clone();
                conn.on_read(64 * 1024, move |chunk| {
                    received.borrow_mut().extend_from_slice(&chunk);
                });
            })
            .unwrap();
    }

    let client = Rc::new(RefCell::new(None));
    {
        let slot = client.clone();
        net.a
            .tcp_connect(Socket::v4(IP_B, 80), move |conn| {
                *slot.borrow_mut() = conn;
            })
            .unwrap();
    }
    net.pump();
    let conn = client.borrow().clone().expect("established");

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    conn.write(payload.clone());

    // drop the second data-bearing segment once; recovery must come from
    // duplicate ACKs since the clock never advances
    let mut data_segments = 0;
    let mut dropped_seq = None;
    let mut seen_seqs: Vec<u32> = Vec::new();
    net.pump_filtered(&mut |a_to_b, frame| {
        if a_to_b && is_tcp_data(frame) {
            data_segments += 1;
            seen_seqs.push(tcp_seq(frame));
            if data_segments == 2 && dropped_seq.is_none() {
                dropped_seq = Some(tcp_seq(frame));
                return false;
            }
        }
        true
    });

    let lost = dropped_seq.expect("a second segment existed");
    let retransmissions = seen_seqs.iter().filter(|&&s| s == lost).count();
    assert!(
        retransmissions >= 2,
        "lost segment must be retransmitted without an RTO"
    );
    assert_eq!(received.borrow().as_slice(), payload.as_slice());
}

#[test]
fn test_dns_resolve_with_cache() {
    let net = Net::new();

    // stack B doubles as the DNS server on 10.0.0.2:53
    let queries = Rc::new(RefCell::new(0));
    {
        let queries = queries.clone();
        let server = net.b.udp_bind(Some(53)).unwrap();
        let reply_via = server.clone();
        server.on_read(move |from, data| {
            *queries.borrow_mut() += 1;
            // answer "A 203.0.113.5, TTL 60" to whatever was asked
            let mut msg = Vec::new();
            msg.extend_from_slice(&data[..2]);
            msg.extend_from_slice(&0x8180u16.to_be_bytes());
            msg.extend_from_slice(&1u16.to_be_bytes());
            msg.extend_from_slice(&1u16.to_be_bytes());
            msg.extend_from_slice(&[0; 4]);
            msg.extend_from_slice(&data[12..]); // echo the question
            msg.extend_from_slice(&[0xc0, 12]);
            msg.extend_from_slice(&[0, 1, 0, 1]);
            msg.extend_from_slice(&60u32.to_be_bytes());
            msg.extend_from_slice(&4u16.to_be_bytes());
            msg.extend_from_slice(&[203, 0, 113, 5]);
            let IpAddr::V4(addr) = from.addr() else { return };
            reply_via.sendto(addr, from.port(), &msg).unwrap();
        });
        std::mem::forget(server);
    }

    let answers = Rc::new(RefCell::new(Vec::new()));
    {
        let answers = answers.clone();
        net.a.resolve("example.test", move |res| {
            answers.borrow_mut().push(res.ok());
        });
    }
    net.pump();
    assert_eq!(*queries.borrow(), 1);
    assert_eq!(
        *answers.borrow(),
        vec![Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)))]
    );

    // within the TTL the cache answers synchronously, nothing on the wire
    {
        let answers = answers.clone();
        net.a.resolve("example.test", move |res| {
            answers.borrow_mut().push(res.ok());
        });
    }
    assert_eq!(answers.borrow().len(), 2);
    net.pump();
    assert_eq!(*queries.borrow(), 1);

    // after expiry the next resolve hits the network again
    net.tick(Duration::from_secs(121));
    {
        let answers = answers.clone();
        net.a.resolve("example.test", move |res| {
            answers.borrow_mut().push(res.ok());
        });
    }
    net.pump();
    assert_eq!(*queries.borrow(), 2);
    assert_eq!(answers.borrow().len(), 3);
}

#[test]
fn test_pmtu_too_big_shrinks_segments() {
    let net = Net::new();

    let received = Rc::new(RefCell::new(0usize));
    {
        let received = received.clone();
        net.b
            .tcp_bind(80, move |conn| {
                let received = received.clone();
                conn.on_read(64 * 1024, move |chunk| {
                    *received.borrow_mut() += chunk.len();
                });
            })
            .unwrap();
    }
    let client = Rc::new(RefCell::new(None));
    {
        let slot = client.clone();
        net.a
            .tcp_connect(Socket::v4(IP_B, 80), move |conn| {
                *slot.borrow_mut() = conn;
            })
            .unwrap();
    }
    net.pump();
    let conn = client.borrow().clone().expect("established");

    // send full-size segments but withhold them, as a narrow router would
    conn.write(vec![0x5au8; 3000]);
    let swallowed = net.nic_a.poll_tx();
    let big = swallowed
        .iter()
        .find(|f| is_tcp_data(f) && ip_total_length(f) > 1200)
        .expect("a full-size segment was sent");

    // the router reports: Fragmentation Needed, next-hop MTU 1200
    let quoted = &big[14..14 + 28]; // IP header + 8 bytes
    let mut icmp = Vec::new();
    icmp.extend_from_slice(&[3, 4, 0, 0]);
    icmp.extend_from_slice(&[0, 0]);
    icmp.extend_from_slice(&1200u16.to_be_bytes());
    icmp.extend_from_slice(quoted);
    let sum = ustack::util::checksum::checksum(&icmp);
    icmp[2..4].copy_from_slice(&sum.to_be_bytes());

    let mut ip = Vec::new();
    ip.extend_from_slice(&[0x45, 0, 0, 0]);
    let total = (20 + icmp.len()) as u16;
    ip[2..4].copy_from_slice(&total.to_be_bytes());
    ip.extend_from_slice(&[0, 0, 0, 0, 64, 1, 0, 0]);
    ip.extend_from_slice(&GATEWAY.octets());
    ip.extend_from_slice(&IP_A.octets());
    let sum = ustack::util::checksum::checksum(&ip);
    ip[10..12].copy_from_slice(&sum.to_be_bytes());
    ip.extend_from_slice(&icmp);

    let mut frame = Vec::new();
    frame.extend_from_slice(&MAC_A.octets());
    frame.extend_from_slice(&[0x52, 0x54, 0, 0, 0, 0xfe]);
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    frame.extend_from_slice(&ip);
    net.nic_a.inject(&frame);

    // the path estimate dropped and connections were notified
    assert_eq!(net.a.ip4().borrow().pmtu(Socket::v4(IP_B, 80)), 1200);

    // recovery: every subsequent data frame respects the new PMTU, and
    // the receiver still gets the whole stream
    let mut oversized = 0;
    for _ in 0..40 {
        let frames = net.nic_a.poll_tx();
        for f in &frames {
            if is_tcp_data(f) && ip_total_length(f) > 1200 {
                oversized += 1;
            }
            net.nic_b.inject(f);
        }
        for f in net.nic_b.poll_tx() {
            net.nic_a.inject(&f);
        }
        net.clock.advance(Duration::from_secs(2));
        net.timers.process();
    }
    assert_eq!(oversized, 0, "no oversized segment after the Too Big");
    assert_eq!(*received.borrow(), 3000);
}

#[test]
fn test_orderly_close_reaches_time_wait() {
    let net = Net::new();
    net.b.tcp_bind(80, |_conn| {}).unwrap();

    let client = Rc::new(RefCell::new(None));
    {
        let slot = client.clone();
        net.a
            .tcp_connect(Socket::v4(IP_B, 80), move |conn| {
                *slot.borrow_mut() = conn;
            })
            .unwrap();
    }
    net.pump();
    let conn = client.borrow().clone().expect("established");

    let closed = Rc::new(RefCell::new(false));
    {
        let closed = closed.clone();
        conn.on_close(move || *closed.borrow_mut() = true);
    }

    conn.close();
    net.pump();
    assert_eq!(conn.state_name(), "TIME-WAIT");
    assert_eq!(net.b.tcp().borrow().active_connections(), 0);

    // 2 * MSL later the connection evaporates
    net.tick(Duration::from_secs(61));
    assert!(*closed.borrow());
    assert_eq!(net.a.tcp().borrow().active_connections(), 0);
}

#[test]
fn test_write_to_closed_connection_reports_zero() {
    let net = Net::new();
    net.b.tcp_bind(80, |_| {}).unwrap();

    let client = Rc::new(RefCell::new(None));
    {
        let slot = client.clone();
        net.a
            .tcp_connect(Socket::v4(IP_B, 80), move |conn| {
                *slot.borrow_mut() = conn;
            })
            .unwrap();
    }
    net.pump();
    let conn = client.borrow().clone().unwrap();
    conn.close();
    net.pump();

    let written = Rc::new(RefCell::new(None));
    {
        let written = written.clone();
        conn.on_write(move |n| *written.borrow_mut() = Some(n));
    }
    conn.write(&b"too late"[..]);
    net.pump();
    assert_eq!(*written.borrow(), Some(0));
}

#[test]
fn test_accept_filter_resets_connection() {
    let net = Net::new();
    let accepted = Rc::new(RefCell::new(0));
    {
        let accepted = accepted.clone();
        let listener = net
            .b
            .tcp_bind(80, move |_conn| *accepted.borrow_mut() += 1)
            .unwrap();
        listener.on_accept(|remote| remote.port() == 50_000);
        std::mem::forget(listener);
    }

    let conn = net
        .a
        .tcp_connect(Socket::v4(IP_B, 80), |_| {})
        .unwrap();
    let reset = Rc::new(RefCell::new(None));
    {
        let reset = reset.clone();
        conn.on_disconnect(move |_c, reason| *reset.borrow_mut() = Some(reason));
    }
    net.pump();

    // the server discarded the handshake with a RST; no accept happened
    assert_eq!(*accepted.borrow(), 0);
    assert_eq!(net.b.tcp().borrow().active_connections(), 0);
    assert_eq!(*reset.borrow(), Some(ustack::Disconnect::Reset));
    assert!(conn.is_closed());
}

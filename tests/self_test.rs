use ice_agent::agent::{Agent, AgentEvent, AgentState};
use ice_agent::{AddressRecord, AgentConfig};
use std::net::SocketAddr;

struct Packet {
    data: Vec<u8>,
    source: AddressRecord,
}

fn create_pair() -> (Agent, Agent) {
    (Agent::create(AgentConfig::default()), Agent::create(AgentConfig::default()))
}

fn addr(s: &str) -> AddressRecord {
    AddressRecord::new(s.parse::<SocketAddr>().unwrap())
}

fn poll_agents(a: &mut Agent, a_addr: AddressRecord, b: &mut Agent, b_addr: AddressRecord, now: u64) {
    loop {
        let mut a_out = Vec::new();
        let mut b_out = Vec::new();

        a.poll(now, |e| a_out.push(e));
        b.poll(now, |e| b_out.push(e));

        if a_out.is_empty() && b_out.is_empty() {
            return;
        }

        while !a_out.is_empty() || !b_out.is_empty() {
            feed_agent_events(a, a_addr, &mut a_out, &mut b_out, now);
            feed_agent_events(b, b_addr, &mut b_out, &mut a_out, now);
        }
    }
}

fn feed_agent_events(agent: &mut Agent, agent_addr: AddressRecord, to_peer: &mut Vec<AgentEvent>, from_peer: &mut Vec<AgentEvent>, now: u64) {
    let packets: Vec<Packet> = std::mem::take(from_peer)
        .into_iter()
        .filter_map(|e| match e {
            AgentEvent::SendData { data, .. } => Some(Packet { data, source: agent_addr }),
            other => {
                to_peer.push(other);
                None
            }
        })
        .collect();

    for packet in packets {
        agent.receive(now, packet.source, &packet.data, |e| to_peer.push(e));
    }
}

fn run_until_connected(a: &mut Agent, a_addr: AddressRecord, b: &mut Agent, b_addr: AddressRecord, deadline_ms: u64) -> bool {
    let mut now = 0;
    while now < deadline_ms {
        poll_agents(a, a_addr, b, b_addr, now);
        let connected = |s: AgentState| matches!(s, AgentState::Connected | AgentState::Completed);
        if connected(a.state()) && connected(b.state()) {
            return true;
        }
        now += a.timeout(now).min(b.timeout(now)).max(1);
    }
    false
}

fn handshake(a: &mut Agent, a_addr: AddressRecord, b: &mut Agent, b_addr: AddressRecord) {
    a.gather_candidates(0, &[a_addr], |_| {}).unwrap();
    b.gather_candidates(0, &[b_addr], |_| {}).unwrap();

    let a_sdp = a.local_description_sdp();
    let b_sdp = b.local_description_sdp();
    a.set_remote_description(&b_sdp, 0, |_| {}).unwrap();
    b.set_remote_description(&a_sdp, 0, |_| {}).unwrap();
    a.set_remote_gathering_done(0);
    b.set_remote_gathering_done(0);
}

#[test]
fn same_network_connects() {
    let (mut a, mut b) = create_pair();
    let a_addr = addr("192.168.178.2:5555");
    let b_addr = addr("192.168.178.3:5555");

    handshake(&mut a, a_addr, &mut b, b_addr);

    assert!(run_until_connected(&mut a, a_addr, &mut b, b_addr, 20_000));
    assert!(a.get_selected_candidate_pair().is_some());
    assert!(b.get_selected_candidate_pair().is_some());
}

#[test]
fn controlling_side_ends_up_with_a_nominated_pair() {
    let (mut a, mut b) = create_pair();
    let a_addr = addr("192.168.50.2:7000");
    let b_addr = addr("192.168.50.3:7000");

    handshake(&mut a, a_addr, &mut b, b_addr);
    assert!(run_until_connected(&mut a, a_addr, &mut b, b_addr, 20_000));

    // Whichever side ended up Controlling after role negotiation picked
    // the pair; both sides should agree on the same 4-tuple.
    let (a_local, a_remote) = a.get_selected_candidate_pair().unwrap();
    let (b_local, b_remote) = b.get_selected_candidate_pair().unwrap();
    assert_eq!(a_local, b_remote);
    assert_eq!(a_remote, b_local);
}

#[test]
fn isolated_networks_fail_after_timeout() {
    let (mut a, mut b) = create_pair();
    let a_addr = addr("10.1.0.2:5555");
    let b_addr = addr("10.2.0.2:5555");

    handshake(&mut a, a_addr, &mut b, b_addr);

    // Checks are scheduled but never delivered (simulated unreachable
    // networks): drain each agent's own outgoing queue without
    // forwarding it, and advance the clock.
    let mut now = 0;
    while now < 35_000 && a.state() != AgentState::Failed {
        a.poll(now, |_| {});
        b.poll(now, |_| {});
        now += a.timeout(now).min(b.timeout(now)).max(1);
    }

    assert_eq!(a.state(), AgentState::Failed);
    assert_eq!(b.state(), AgentState::Failed);
}

#[test]
fn application_data_flows_over_selected_pair() {
    let (mut a, mut b) = create_pair();
    let a_addr = addr("192.168.1.10:6000");
    let b_addr = addr("192.168.1.11:6000");

    handshake(&mut a, a_addr, &mut b, b_addr);
    assert!(run_until_connected(&mut a, a_addr, &mut b, b_addr, 20_000));

    let mut a_out = Vec::new();
    a.send(b"hello over ice", 20_000, |e| a_out.push(e)).unwrap();
    let data = a_out
        .into_iter()
        .find_map(|e| match e {
            AgentEvent::SendData { data, .. } => Some(data),
            _ => None,
        })
        .expect("a should have emitted a datagram");

    let mut delivered = Vec::new();
    b.receive(20_000, a_addr, &data, |e| delivered.push(e));
    assert!(delivered.iter().any(|e| matches!(e, AgentEvent::DataReceived(d) if d == b"hello over ice")));
}

#[test]
fn trickled_remote_candidate_before_description_stays_frozen() {
    let mut agent = Agent::create(AgentConfig::default());
    agent.gather_candidates(0, &[addr("10.0.0.5:4000")], |_| {}).unwrap();

    // A trickled remote candidate arriving before set_remote_description
    // is stored and paired, but the check stays frozen: there's no
    // remote ufrag yet to address a request with.
    agent.add_remote_candidate("candidate:1 1 UDP 2130706431 203.0.113.50 6000 typ host", 0, |_| {}).unwrap();

    let mut events = Vec::new();
    agent.poll(0, |e| events.push(e));
    assert!(!events.iter().any(|e| matches!(e, AgentEvent::SendData { .. })));
}

#[test]
fn bad_candidate_line_is_rejected() {
    let mut agent = Agent::create(AgentConfig::default());
    assert!(agent.add_remote_candidate("not a candidate line at all", 0, |_| {}).is_err());
}

#[test]
fn local_description_sdp_round_trips_through_a_peer() {
    let mut a = Agent::create(AgentConfig::default());
    a.gather_candidates(0, &[addr("172.16.0.4:9000")], |_| {}).unwrap();
    let sdp = a.local_description_sdp();

    let mut b = Agent::create(AgentConfig::default());
    b.set_remote_description(&sdp, 0, |_| {}).unwrap();

    assert_eq!(b.get_selected_candidate_pair(), None);
}

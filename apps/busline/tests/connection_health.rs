use std::time::Duration;

use busline::protocol::CloseCode;
use busline::transport::{NetworkSignal, TransportEvent};
use busline::{BusClient, BusEvent, ConnectionState, MonitorConfig};
use tokio::sync::{broadcast, mpsc};

use ConnectionState::{Connecting, Lost, Stable, Unstable};

fn client() -> (BusClient, broadcast::Receiver<BusEvent>) {
    let client = BusClient::new(MonitorConfig::default(), None).expect("client");
    let events = client.events();
    (client, events)
}

fn transitions(events: &mut broadcast::Receiver<BusEvent>) -> Vec<ConnectionState> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let BusEvent::StateChanged { to, .. } = event {
            states.push(to);
        }
    }
    states
}

fn abnormal() -> TransportEvent {
    TransportEvent::Disconnect {
        code: CloseCode::ABNORMAL_CLOSURE,
    }
}

async fn advance(duration: Duration) {
    tokio::time::sleep(duration).await;
}

#[tokio::test(start_paused = true)]
async fn start_then_connect_is_stable() {
    let (client, mut events) = client();
    client.start();
    client.handle_event(TransportEvent::Connect);
    assert_eq!(transitions(&mut events), vec![Connecting, Stable]);
    assert!(client.monitor().last_stable_at().is_some());
}

#[tokio::test(start_paused = true)]
async fn blip_within_grace_period_stays_stable() {
    let (client, mut events) = client();
    client.start();
    client.handle_event(TransportEvent::Connect);

    client.handle_event(abnormal());
    advance(Duration::from_millis(800)).await;
    client.handle_event(TransportEvent::Reconnect);
    advance(Duration::from_secs(60)).await;

    assert_eq!(transitions(&mut events), vec![Connecting, Stable]);
    assert_eq!(client.monitor().reconnect_attempt_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn outage_past_grace_period_recovers_through_unstable() {
    let (client, mut events) = client();
    client.start();
    client.handle_event(TransportEvent::Connect);

    client.handle_event(abnormal());
    advance(Duration::from_secs(3)).await;
    assert_eq!(client.monitor().state(), Unstable);
    client.handle_event(TransportEvent::Reconnect);

    assert_eq!(
        transitions(&mut events),
        vec![Connecting, Stable, Unstable, Stable]
    );
}

#[tokio::test(start_paused = true)]
async fn sustained_outage_is_lost_until_reconnect() {
    let (client, mut events) = client();
    client.start();
    client.handle_event(TransportEvent::Connect);

    client.handle_event(abnormal());
    advance(Duration::from_secs(31)).await;
    assert_eq!(client.monitor().state(), Lost);

    client.handle_event(TransportEvent::Reconnect);
    assert_eq!(
        transitions(&mut events),
        vec![Connecting, Stable, Unstable, Lost, Stable]
    );
}

#[tokio::test(start_paused = true)]
async fn offline_disconnect_never_reports_instability() {
    let (client, mut events) = client();
    client.start();
    client.handle_event(TransportEvent::Connect);

    client.handle_network(NetworkSignal::Offline);
    client.handle_event(abnormal());
    advance(Duration::from_secs(120)).await;
    assert_eq!(client.monitor().state(), Connecting);
    assert_eq!(client.monitor().reconnect_attempt_count(), 0);

    client.handle_network(NetworkSignal::Online);
    client.handle_event(TransportEvent::Reconnect);
    advance(Duration::from_secs(60)).await;

    let states = transitions(&mut events);
    assert!(!states.contains(&Unstable), "{states:?}");
    assert_eq!(states.last(), Some(&Stable));
}

#[tokio::test(start_paused = true)]
async fn going_offline_during_grace_exempts_the_outage() {
    let (client, mut events) = client();
    client.start();
    client.handle_event(TransportEvent::Connect);

    client.handle_event(abnormal());
    advance(Duration::from_millis(500)).await;
    client.handle_network(NetworkSignal::Offline);
    advance(Duration::from_secs(5)).await;
    assert_eq!(client.monitor().reconnect_attempt_count(), 0);

    client.handle_network(NetworkSignal::Online);
    client.handle_event(TransportEvent::Reconnect);
    let states = transitions(&mut events);
    assert!(!states.contains(&Unstable), "{states:?}");
    assert_eq!(client.monitor().state(), Stable);
}

#[tokio::test(start_paused = true)]
async fn repeated_short_flaps_escalate_then_settle() {
    let (client, mut events) = client();
    client.start();
    client.handle_event(TransportEvent::Connect);

    for _ in 0..3 {
        client.handle_event(abnormal());
        advance(Duration::from_millis(200)).await;
        client.handle_event(TransportEvent::Reconnect);
        advance(Duration::from_millis(200)).await;
    }
    assert_eq!(client.monitor().state(), Stable);

    client.handle_event(abnormal());
    assert_eq!(client.monitor().state(), Unstable);
    advance(Duration::from_millis(200)).await;
    client.handle_event(TransportEvent::Reconnect);
    assert_eq!(client.monitor().state(), Unstable);

    advance(Duration::from_secs(11)).await;
    assert_eq!(client.monitor().state(), Stable);
    assert_eq!(client.monitor().reconnect_attempt_count(), 0);
    assert_eq!(
        transitions(&mut events),
        vec![Connecting, Stable, Unstable, Stable]
    );
}

#[tokio::test(start_paused = true)]
async fn planned_close_goes_back_to_connecting() {
    let (client, mut events) = client();
    client.start();
    client.handle_event(TransportEvent::Connect);
    client.handle_event(TransportEvent::Disconnect {
        code: CloseCode::RECONNECTING,
    });
    advance(Duration::from_secs(60)).await;
    assert_eq!(client.monitor().reconnect_attempt_count(), 0);
    client.handle_event(TransportEvent::Reconnect);
    assert_eq!(
        transitions(&mut events),
        vec![Connecting, Stable, Connecting, Stable]
    );
}

#[tokio::test(start_paused = true)]
async fn attached_streams_drive_the_monitor_in_order() {
    let (client, mut events) = client();
    let (transport_tx, transport_rx) = mpsc::channel(8);
    let (network_tx, network_rx) = mpsc::channel(8);
    client.attach(transport_rx);
    client.attach_network(network_rx);
    client.start();

    transport_tx.send(TransportEvent::Connect).await.expect("send");
    network_tx.send(NetworkSignal::Offline).await.expect("send");
    advance(Duration::from_millis(10)).await;
    transport_tx.send(abnormal()).await.expect("send");
    advance(Duration::from_secs(5)).await;

    assert!(!client.monitor().is_online());
    assert_eq!(
        transitions(&mut events),
        vec![Connecting, Stable, Connecting]
    );
    client.shutdown();
    assert_eq!(client.monitor().state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn expired_session_ends_disconnected() {
    let (client, mut events) = client();
    client.start();
    client.handle_event(TransportEvent::Connect);
    client.handle_event(TransportEvent::Disconnect {
        code: CloseCode::SESSION_EXPIRED,
    });
    advance(Duration::from_secs(60)).await;

    assert_eq!(client.monitor().state(), ConnectionState::Disconnected);
    assert_eq!(
        transitions(&mut events),
        vec![Connecting, Stable, Connecting, ConnectionState::Disconnected]
    );

    // Nothing revives a session the server ended until it is started again.
    client.handle_event(TransportEvent::Reconnect);
    assert_eq!(client.monitor().state(), ConnectionState::Disconnected);
}

use {
    buslane::{
        Connection, Error, Interface, InterfaceDescriptor, MatchRule, Message, Mode, ObjectPath,
        PendingReply, RequestNameFlags,
    },
    common::{eventually, Broker},
    parking_lot::Mutex,
    std::{sync::Arc, time::Duration},
    tokio::time::timeout,
};

mod common;

const SERVICE: &str = "org.example.pending";
const INTERFACE: &str = "org.example.Pending";

/// Exports `hang`, whose replies are parked until `release` is called.
async fn hanging_server(broker: &Broker) -> (Connection, Arc<Mutex<Vec<PendingReply>>>) {
    let conn = broker.connect().await;
    let parked = Arc::new(Mutex::new(vec![]));
    let descriptor = InterfaceDescriptor::builder(INTERFACE)
        .method("hang", "", "")
        .method("echo", "u", "u")
        .build()
        .unwrap();
    let interface = {
        let parked = parked.clone();
        Interface::builder(descriptor)
            .method_with_reply("hang", move |(): (), pr| parked.lock().push(pr))
            .method("echo", |(v,): (u32,)| Ok((v,)))
            .build()
            .unwrap()
    };
    conn.export("/", interface).unwrap().detach();
    conn.request_name(SERVICE, RequestNameFlags::NONE)
        .await
        .unwrap();
    (conn, parked)
}

fn hang() -> Message {
    Message::method_call(ObjectPath::root(), "hang")
        .with_destination(SERVICE)
        .with_interface(INTERFACE)
}

#[tokio::test]
async fn hello_assigns_a_unique_name() {
    let broker = Broker::start();
    let a = broker.connect().await;
    let b = broker.connect().await;
    assert!(a.unique_name().starts_with(':'));
    assert_ne!(a.unique_name(), b.unique_name());
    assert_ne!(a.id(), b.id());
    assert_eq!(a.mode(), Mode::Cooperative);
    let names = a.list_names().await.unwrap();
    assert!(names.iter().any(|n| n == b.unique_name()));
}

#[tokio::test]
async fn calls_time_out() {
    let broker = Broker::start();
    let (_server, parked) = hanging_server(&broker).await;
    let client = broker.connect().await;
    let res = client
        .call_message_with_timeout(&hang(), Some(Duration::from_millis(100)))
        .await;
    assert!(matches!(res, Err(Error::Timeout)));

    // A late reply is dropped and does not disturb later calls.
    assert!(eventually(|| parked.lock().len() == 1).await);
    parked.lock().pop().unwrap().reply(());
    let (v,): (u32,) = client
        .call(SERVICE, "/", INTERFACE, "echo", (7u32,))
        .await
        .unwrap();
    assert_eq!(v, 7);
}

#[tokio::test]
async fn concurrent_calls_get_their_own_replies() {
    let broker = Broker::start();
    let (_server, _) = hanging_server(&broker).await;
    let client = broker.connect().await;
    let calls: Vec<_> = (0..16u32)
        .map(|i| client.call::<(u32,)>(SERVICE, "/", INTERFACE, "echo", (i,)))
        .collect();
    for (i, call) in calls.into_iter().enumerate().rev() {
        assert_eq!(call.await.unwrap(), (i as u32,));
    }
}

#[tokio::test]
async fn dropped_calls_are_retired() {
    let broker = Broker::start();
    let (_server, parked) = hanging_server(&broker).await;
    let client = broker.connect().await;
    let call = client.call_message(&hang());
    assert!(call.serial().is_some());
    drop(call);
    assert!(eventually(|| parked.lock().len() == 1).await);
    parked.lock().clear();
    let (v,): (u32,) = client
        .call(SERVICE, "/", INTERFACE, "echo", (1u32,))
        .await
        .unwrap();
    assert_eq!(v, 1);
}

#[tokio::test]
async fn disconnect_fails_pending_calls_and_ends_streams() {
    let broker = Broker::start();
    let (_server, parked) = hanging_server(&broker).await;
    let client = broker.connect().await;
    let mut stream = client
        .subscribe(MatchRule::for_signal("org.example.Any", "Tick"))
        .await
        .unwrap();
    let call = client.call_message(&hang());
    assert!(eventually(|| parked.lock().len() == 1).await);
    broker.disconnect(client.unique_name());
    assert!(matches!(call.await, Err(Error::Disconnected)));
    assert_eq!(
        timeout(Duration::from_secs(1), stream.next()).await.unwrap(),
        None
    );
    assert!(stream.is_closed());
    assert!(client.is_closed());
    let res = client.call::<()>(SERVICE, "/", INTERFACE, "hang", ()).await;
    assert!(matches!(res, Err(Error::Disconnected)));
}

#[tokio::test]
async fn close_ends_everything() {
    let broker = Broker::start();
    let client = broker.connect().await;
    let mut stream = client
        .subscribe(MatchRule::for_signal("org.example.Any", "Tick"))
        .await
        .unwrap();
    let clone = client.clone();
    clone.close();
    assert!(client.is_closed());
    assert_eq!(stream.next().await, None);
    assert!(matches!(
        client.send_signal("/", "org.example.Any", "Tick", ()),
        Err(Error::Disconnected)
    ));
}

#[tokio::test]
async fn match_rules_are_reference_counted() {
    let broker = Broker::start();
    let client = broker.connect().await;
    let rule = MatchRule::for_signal("org.example.Any", "Tick");
    let mut streams = vec![];
    for _ in 0..3 {
        streams.push(client.subscribe(rule.clone()).await.unwrap());
    }
    assert_eq!(broker.add_match_count(), 1);
    assert_eq!(broker.rule_count(), 1);

    let sender = broker.connect().await;
    sender
        .send_signal("/", "org.example.Any", "Tick", (1u8,))
        .unwrap();
    for stream in &mut streams {
        let msg = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.args::<(u8,)>().unwrap(), (1,));
    }

    streams.pop();
    streams.pop();
    assert_eq!(broker.remove_match_count(), 0);
    streams.clear();
    assert!(eventually(|| broker.remove_match_count() == 1).await);
    assert!(eventually(|| broker.rule_count() == 0).await);
    assert_eq!(broker.add_match_count(), 1);
}

#[tokio::test]
async fn later_subscribers_wait_for_the_pending_add_match() {
    let broker = Broker::start();
    let client = broker.connect().await;
    let rule = MatchRule::for_signal("org.example.Any", "Tick");
    let first = {
        let client = client.clone();
        let rule = rule.clone();
        tokio::spawn(async move { client.subscribe(rule).await.unwrap() })
    };
    // Let the first subscriber send `AddMatch` before the second one starts.
    tokio::task::yield_now().await;
    let mut second = client.subscribe(rule).await.unwrap();
    assert_eq!(broker.rule_count(), 1);
    let mut first = first.await.unwrap();
    assert_eq!(broker.add_match_count(), 1);

    let sender = broker.connect().await;
    sender
        .send_signal("/", "org.example.Any", "Tick", (2u8,))
        .unwrap();
    for stream in [&mut first, &mut second] {
        let msg = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.args::<(u8,)>().unwrap(), (2,));
    }
}

#[tokio::test]
async fn invalid_match_rules_are_rejected() {
    let broker = Broker::start();
    let client = broker.connect().await;
    let rule = MatchRule::signal().arg(70, "x");
    assert!(client.subscribe(rule).await.is_err());
    assert_eq!(broker.add_match_count(), 0);
}

#[tokio::test]
async fn blocking_calls_on_cooperative_connections_are_misuse() {
    let broker = Broker::start();
    let client = broker.connect().await;
    let msg = Message::method_call(ObjectPath::root(), "Ping")
        .with_destination(client.unique_name())
        .with_interface("org.freedesktop.DBus.Peer");
    assert!(matches!(
        client.call_message_blocking(&msg),
        Err(Error::Misuse(_))
    ));
    assert!(matches!(client.process_blocking(None), Err(Error::Misuse(_))));
    // Peer is served on every path, including our own.
    client.call_message(&msg).await.unwrap();
}

#[tokio::test]
async fn names() {
    let broker = Broker::start();
    let a = broker.connect().await;
    let b = broker.connect().await;
    assert!(!b.name_has_owner("org.example.Names").await.unwrap());
    a.request_name("org.example.Names", RequestNameFlags::NONE)
        .await
        .unwrap();
    assert!(b.name_has_owner("org.example.Names").await.unwrap());
    let again = a
        .request_name("org.example.Names", RequestNameFlags::NONE)
        .await
        .unwrap();
    assert_eq!(again, buslane::RequestNameReply::AlreadyOwner);
    let queued = b
        .request_name("org.example.Names", RequestNameFlags::NONE)
        .await
        .unwrap_err();
    assert!(queued.is_request_name());
    a.release_name("org.example.Names").await.unwrap();
    assert!(a.owned_names().is_empty());
    assert!(!b.name_has_owner("org.example.Names").await.unwrap());
    assert!(matches!(
        a.request_name("invalid", RequestNameFlags::NONE).await,
        Err(Error::InvalidMessage(_))
    ));
}

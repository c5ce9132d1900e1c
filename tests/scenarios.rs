use {
    buslane::{
        Access, Connection, EmitsChange, Error, ExportHandle, Interface, InterfaceDescriptor,
        MatchRule, Proxy, RequestNameError, RequestNameFlags, RequestNameReply,
    },
    common::Broker,
    std::{sync::Arc, time::Duration},
    tokio::time::timeout,
};

mod common;

const SERVICE: &str = "org.example.service";
const INTERFACE: &str = "org.example.interface";

fn descriptor() -> Arc<InterfaceDescriptor> {
    InterfaceDescriptor::builder(INTERFACE)
        .method("upper", "s", "s")
        .property("hello_world", "s", Access::Read, EmitsChange::False)
        .signal("clock", "i")
        .build()
        .unwrap()
}

async fn serve(broker: &Broker) -> (Connection, ExportHandle) {
    let conn = broker.connect().await;
    let interface = Interface::builder(descriptor())
        .method("upper", |(s,): (String,)| Ok((s.to_uppercase(),)))
        .property("hello_world", "Hello, World!".to_string())
        .build()
        .unwrap();
    let handle = conn.export("/", interface).unwrap();
    let reply = conn
        .request_name(SERVICE, RequestNameFlags::DO_NOT_QUEUE)
        .await
        .unwrap();
    assert_eq!(reply, RequestNameReply::PrimaryOwner);
    (conn, handle)
}

#[tokio::test]
async fn upper_echo() {
    let broker = Broker::start();
    let (_server, _handle) = serve(&broker).await;
    let client = broker.connect().await;
    let proxy = Proxy::new(&client, SERVICE, "/", descriptor()).unwrap();
    let (upper,): (String,) = proxy
        .call("upper", ("test string".to_string(),))
        .await
        .unwrap();
    assert_eq!(upper, "TEST STRING");
}

#[tokio::test]
async fn hello_world_property() {
    let broker = Broker::start();
    let (_server, handle) = serve(&broker).await;
    let client = broker.connect().await;
    let rule = MatchRule::for_signal("org.freedesktop.DBus.Properties", "PropertiesChanged");
    let mut changes = client.subscribe(rule).await.unwrap();
    let proxy = Proxy::new(&client, SERVICE, "/", descriptor()).unwrap();
    let value: String = proxy.get_property("hello_world").await.unwrap();
    assert_eq!(value, "Hello, World!");

    handle
        .set_property("hello_world", "Goodbye".to_string())
        .unwrap();
    // The reply is routed after any signal emitted before it.
    let (_,): (String,) = proxy.call("upper", ("x".to_string(),)).await.unwrap();
    assert!(changes.try_next().is_none());
    let value: String = proxy.get_property("hello_world").await.unwrap();
    assert_eq!(value, "Goodbye");
}

#[tokio::test]
async fn clock_signal() {
    let broker = Broker::start();
    let (_server, handle) = serve(&broker).await;
    let client = broker.connect().await;
    let proxy = Proxy::new(&client, SERVICE, "/", descriptor()).unwrap();
    let mut clock = proxy.signal::<(i32,)>("clock").await.unwrap();
    handle.emit_signal("clock", (42i32,)).unwrap();
    let (tick,) = timeout(Duration::from_secs(1), clock.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tick, 42);
    assert!(timeout(Duration::from_millis(100), clock.next())
        .await
        .is_err());
}

#[tokio::test]
async fn unknown_method() {
    let broker = Broker::start();
    let (_server, _handle) = serve(&broker).await;
    let client = broker.connect().await;
    let res = client
        .call::<()>(SERVICE, "/", INTERFACE, "missing", ())
        .await;
    match res {
        Err(Error::UnknownMethod(e)) => {
            assert_eq!(e.name, "org.freedesktop.DBus.Error.UnknownMethod")
        }
        r => panic!("unexpected result {r:?}"),
    }
}

#[tokio::test]
async fn request_name_race() {
    let broker = Broker::start();
    let first = broker.connect().await;
    let second = broker.connect().await;
    let reply = first
        .request_name(SERVICE, RequestNameFlags::DO_NOT_QUEUE)
        .await
        .unwrap();
    assert_eq!(reply, RequestNameReply::PrimaryOwner);
    let err = second
        .request_name(SERVICE, RequestNameFlags::DO_NOT_QUEUE)
        .await
        .unwrap_err();
    assert!(err.is_request_name());
    assert!(matches!(
        err,
        Error::RequestName(RequestNameError::Exists(ref n)) if n == SERVICE
    ));
    assert_eq!(first.owned_names(), [SERVICE]);
    assert!(second.owned_names().is_empty());
    assert_eq!(
        second.get_name_owner(SERVICE).await.unwrap(),
        first.unique_name()
    );
}

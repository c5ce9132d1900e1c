use {
    buslane::{
        default_bus::{self, scope, scope_blocking},
        set_default_bus, set_process_default_bus, Error,
    },
    common::Broker,
};

mod common;

// The process default is global, so everything that touches it lives in one test.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scoped_overrides_do_not_leak() {
    let broker = Broker::start();
    let a = broker.connect().await;
    let b = broker.connect().await;
    let c = broker.connect().await;

    assert!(matches!(set_default_bus(&b), Err(Error::Misuse(_))));
    set_process_default_bus(&a);
    assert_eq!(default_bus::default_bus().await.unwrap().id(), a.id());

    let inner = scope(None, async {
        assert_eq!(default_bus::default_bus().await.unwrap().id(), a.id());
        set_default_bus(&b).unwrap();
        let id = default_bus::default_bus().await.unwrap().id();
        let child = default_bus::spawn(async { default_bus::default_bus().await.unwrap().id() });
        assert_eq!(child.await.unwrap(), b.id());
        id
    })
    .await;
    assert_eq!(inner, b.id());
    assert_eq!(default_bus::default_bus().await.unwrap().id(), a.id());

    // Two contexts running at the same time see their own overrides.
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let first = {
        let b = b.clone();
        tokio::spawn(scope(None, async move {
            set_default_bus(&b).unwrap();
            rx.await.unwrap();
            default_bus::default_bus().await.unwrap().id()
        }))
    };
    let second = {
        let c = c.clone();
        tokio::spawn(scope(Some(c), async move {
            let id = default_bus::default_bus().await.unwrap().id();
            tx.send(()).unwrap();
            id
        }))
    };
    assert_eq!(second.await.unwrap(), c.id());
    assert_eq!(first.await.unwrap(), b.id());
    assert_eq!(default_bus::current().unwrap().id(), a.id());

    // Blocking scopes are per thread.
    let blocking = broker.connect_blocking();
    let other = broker.connect_blocking();
    set_process_default_bus(&blocking);
    tokio::task::spawn_blocking(move || {
        assert_eq!(default_bus::default_bus_blocking().unwrap().id(), blocking.id());
        scope_blocking(None, || {
            set_default_bus(&other).unwrap();
            assert_eq!(default_bus::default_bus_blocking().unwrap().id(), other.id());
        });
        assert_eq!(default_bus::default_bus_blocking().unwrap().id(), blocking.id());
    })
    .await
    .unwrap();
    assert_eq!(default_bus::default_bus().await.unwrap().id(), a.id());
}

#[test]
fn nested_blocking_scopes_restore_the_enclosing_bus() {
    let broker = Broker::start();
    let outer = broker.connect_blocking();
    let inner = broker.connect_blocking();
    let replaced = broker.connect_blocking();
    let current = || default_bus::default_bus_blocking().unwrap().id();
    scope_blocking(Some(outer.clone()), || {
        assert_eq!(current(), outer.id());
        scope_blocking(Some(inner.clone()), || {
            assert_eq!(current(), inner.id());
        });
        assert_eq!(current(), outer.id());
        scope_blocking(None, || {
            assert_eq!(current(), outer.id());
            set_default_bus(&replaced).unwrap();
            assert_eq!(current(), replaced.id());
        });
        assert_eq!(current(), outer.id());
    });
    assert!(matches!(set_default_bus(&outer), Err(Error::Misuse(_))));
}

//! Registers, discovers, resolves and withdraws a service through two contexts sharing one
//! in-process provider.

use std::{
    net::Ipv4Addr,
    sync::{mpsc, Arc},
    time::Duration,
};

use dnssd_watch::{
    provider::local::LocalProvider, txt::TxtRecordValue, Config, Context, DiscoveryFlags,
    DiscoveryNotification, Error, ResolveNotification, TxtRecord,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn provider() -> Arc<LocalProvider> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut provider = LocalProvider::new();
    provider.set_host_name("testhost");
    provider.add_address(Ipv4Addr::new(192, 168, 0, 10).into());
    provider.set_scan_interval(Duration::from_millis(20));
    Arc::new(provider)
}

#[test]
fn register_discover_resolve() {
    let provider = provider();
    let server = Context::new(provider.clone()).unwrap();
    let mut config = Config::new();
    config.set_rescan_delay(Duration::from_millis(5));
    let client = Context::with_config(provider.clone(), config).unwrap();

    let (tx, rx) = mpsc::channel();
    let mut txt = TxtRecord::new();
    txt.insert("MaxUsers", "20");
    let service = server
        .register_service("MyService", "_daap._tcp", None, 3689, &txt, move |_, r| {
            tx.send(r).unwrap();
        })
        .unwrap();
    let registered = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(registered.name, "MyService");
    assert_eq!(registered.error, None);

    let (dtx, drx) = mpsc::channel::<DiscoveryNotification>();
    let discovery = client
        .start_discovery("_daap._tcp.", Some("local."), move |_, n| {
            dtx.send(n).ok();
        })
        .unwrap();
    let (rtx, rrx) = mpsc::channel::<ResolveNotification>();
    let resolve = client
        .start_resolve("MyService", "_daap._tcp", None, move |_, n| {
            rtx.send(n).ok();
        })
        .unwrap();

    let added = drx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(added.instance_name.as_deref(), Some("MyService"));
    assert_eq!(added.service_type, "_daap._tcp.");
    assert_eq!(added.domain, "local.");
    assert_eq!(added.flags, DiscoveryFlags::ADD);

    let resolved = rrx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(resolved.address, "192.168.0.10");
    assert_eq!(resolved.port, 3689);
    assert_eq!(resolved.host_target, "testhost.local.");
    assert_eq!(resolved.txt, b"\x0bMaxUsers=20");
    assert_eq!(resolved.txt_len(), 12);
    assert_eq!(
        resolved.txt_record().get("MaxUsers"),
        Some(TxtRecordValue::Value(b"20"))
    );

    // Steady state: several cycles pass without further notifications.
    std::thread::sleep(Duration::from_millis(150));
    assert!(drx.try_recv().is_err());
    assert!(rrx.try_recv().is_err());
    assert_eq!(client.discovered_instances(discovery).unwrap().len(), 1);

    server.unregister_service(service);
    let removed = drx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(removed.instance_name.as_deref(), Some("MyService"));
    assert!(removed.flags.is_empty());
    assert!(drx.recv_timeout(Duration::from_millis(150)).is_err());
    assert!(client.resolved_instances(resolve).unwrap().is_empty());

    client.stop_resolve(resolve);
    client.stop_discovery(discovery);
    assert!(client.discovered_instances(discovery).is_none());
}

#[test]
fn name_collision_across_contexts() {
    let provider = provider();
    let a = Context::new(provider.clone()).unwrap();
    let b = Context::new(provider.clone()).unwrap();

    let (tx, rx) = mpsc::channel();
    let tx2 = tx.clone();
    a.register_service("Printer", "_ipp._tcp", None, 631, &TxtRecord::new(), move |_, r| {
        tx.send(r).unwrap();
    })
    .unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().name, "Printer");

    // Same name in another context is not a local duplicate; the provider renames it.
    b.register_service("Printer", "_ipp._tcp", None, 631, &TxtRecord::new(), move |_, r| {
        tx2.send(r).unwrap();
    })
    .unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().name, "Printer (2)");

    assert_eq!(
        a.register_service("Printer", "_ipp._tcp", None, 631, &TxtRecord::new(), |_, _| {})
            .unwrap_err(),
        Error::ServiceAlreadyExists
    );

    drop(a);
    drop(b);
    assert_eq!(provider.advertisement_count(), 0);
}

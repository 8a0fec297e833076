//! Registers a service on the in-process provider, then discovers and resolves it.
//!
//! The provider reports the machine's non-loopback interface addresses for every instance.

use std::{
    env, io, process,
    sync::{mpsc, Arc},
    time::Duration,
};

use dnssd_watch::{provider::local::LocalProvider, tap::TapProvider, Context, TxtRecord};
use log::LevelFilter;

fn main() -> io::Result<()> {
    env_logger::Builder::new()
        .filter_module(env!("CARGO_PKG_NAME").replace('-', "_").as_str(), LevelFilter::Debug)
        .filter_module(env!("CARGO_CRATE_NAME"), LevelFilter::Trace)
        .init();

    let args = env::args().skip(1).collect::<Vec<_>>();
    let service_type = match &*args {
        [] => "_daap._tcp".to_string(),
        [ty] => ty.clone(),
        _ => {
            eprintln!("usage: local-roundtrip [service-type]");
            process::exit(1);
        }
    };

    let mut provider = LocalProvider::new();
    for interface in if_addrs::get_if_addrs()? {
        if !interface.is_loopback() {
            provider.add_address(interface.ip());
        }
    }
    let ctx = Context::new(TapProvider::new(Arc::new(provider)))?;

    let (tx, rx) = mpsc::channel();
    let mut txt = TxtRecord::new();
    txt.insert("MaxUsers", "20");
    let _service = ctx.register_service("MyService", &service_type, None, 3689, &txt, {
        let tx = tx.clone();
        move |_, result| {
            tx.send(format!("registered: {:?}", result)).ok();
        }
    })?;

    let discovery = ctx.start_discovery(&service_type, None, {
        let tx = tx.clone();
        move |_, n| {
            let verb = if n.is_added() { "added" } else { "removed" };
            tx.send(format!(
                "{} {:?} {}{}",
                verb, n.instance_name, n.service_type, n.domain
            ))
            .ok();
        }
    })?;
    let resolve = ctx.start_resolve("MyService", &service_type, None, move |_, n| {
        tx.send(format!(
            "resolved {} -> {}:{} on {} [{}]",
            n.full_name,
            n.address,
            n.port,
            n.host_target,
            n.txt_record()
        ))
        .ok();
    })?;

    while let Ok(line) = rx.recv_timeout(Duration::from_secs(3)) {
        println!("{}", line);
    }

    ctx.stop_resolve(resolve);
    ctx.stop_discovery(discovery);
    ctx.shutdown();
    Ok(())
}

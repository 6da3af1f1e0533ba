//! Ping/pong across a fork.
//!
//! The child raises "ping"; the parent's reply listener answers with "pong";
//! both events cross the tunnel exactly once.
//!
//! Run with: `cargo run --example pingpong`

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, fork};
use serde::{Deserialize, Serialize};

use forktunnel::{Dispatcher, DispatcherHandle, EventBus, Role, Tunnel};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Shuttle {
    Ping { n: u32 },
    Pong { n: u32 },
}

const PATIENCE: Option<Duration> = Some(Duration::from_secs(5));

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let bus: Rc<EventBus<Shuttle>> = Rc::new(EventBus::new());
    let handle: DispatcherHandle<Shuttle> = bus.clone();

    let tunnel: Tunnel<Shuttle> = Tunnel::new()?;
    tunnel.register_listener(&handle, ["ping", "pong"])?;

    match unsafe { fork() }? {
        ForkResult::Child => {
            let role = tunnel.split()?;
            tracing::info!(?role, "Split complete");

            let got_pong = Rc::new(Cell::new(false));
            let flag = Rc::clone(&got_pong);
            bus.add_listener(
                "pong",
                Rc::new(move |event: &Shuttle, _: &str| {
                    tracing::info!(?event, "Child received the reply");
                    flag.set(true);
                    Ok(())
                }),
                0,
            );

            bus.dispatch("ping", &Shuttle::Ping { n: 1 })?;
            tracing::info!("Child raised ping");

            for _ in 0..10 {
                if got_pong.get() {
                    break;
                }
                tunnel.wait(PATIENCE)?;
            }
        }
        ForkResult::Parent { child } => {
            let role = tunnel.split()?;
            tracing::info!(?role, "Split complete");
            assert_eq!(role, Role::Parent);

            let replied = Rc::new(Cell::new(false));
            let flag = Rc::clone(&replied);
            let reply_bus = Rc::clone(&bus);
            bus.add_listener(
                "ping",
                Rc::new(move |event: &Shuttle, _: &str| {
                    tracing::info!(?event, "Parent received ping; replying");
                    if let Shuttle::Ping { n } = event {
                        reply_bus.dispatch("pong", &Shuttle::Pong { n: n + 1 })?;
                    }
                    flag.set(true);
                    Ok(())
                }),
                0,
            );

            // First wake is the child's handshake; the next carries the ping.
            for _ in 0..10 {
                if replied.get() {
                    break;
                }
                tunnel.wait(PATIENCE)?;
            }

            waitpid(child, None)?;
            tracing::info!("Done");
        }
    }
    Ok(())
}
